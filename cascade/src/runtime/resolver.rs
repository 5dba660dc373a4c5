//! Chain resolver: assigns a destination to every chain on the resolve queue.

use std::sync::Arc;

use crate::chain::Chain;
use crate::net::Membership;
use crate::sync::BoundedQueue;
use crate::trace::{debug, trace, warn};
use crate::types::PartitionId;

use super::Outbound;

/// Routing decision for new chains.
pub trait Placement: Send + Sync {
    fn place(&self, chain: &Chain, membership: &Membership) -> PartitionId;
}

/// Keeps every chain on the node that produced it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalPlacement;

impl Placement for LocalPlacement {
    fn place(&self, _chain: &Chain, membership: &Membership) -> PartitionId {
        membership.partition()
    }
}

/// Spreads chains over the cluster by chain id.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpreadPlacement;

impl Placement for SpreadPlacement {
    fn place(&self, chain: &Chain, membership: &Membership) -> PartitionId {
        let nodes = membership.len() as u64;
        PartitionId::new((chain.id().as_u64() % nodes) as u32)
    }
}

pub struct ChainResolver {
    resolve_queue: Arc<BoundedQueue<Chain>>,
    process_queue: Arc<BoundedQueue<Chain>>,
    placement: Arc<dyn Placement>,
    membership: Arc<Membership>,
    outbound: Arc<dyn Outbound>,
}

impl ChainResolver {
    #[must_use]
    pub fn new(
        resolve_queue: Arc<BoundedQueue<Chain>>,
        process_queue: Arc<BoundedQueue<Chain>>,
        placement: Arc<dyn Placement>,
        membership: Arc<Membership>,
        outbound: Arc<dyn Outbound>,
    ) -> Self {
        Self {
            resolve_queue,
            process_queue,
            placement,
            membership,
            outbound,
        }
    }

    /// Routes one chain: local chains enter the process queue, the rest go
    /// to the transport.
    ///
    /// Returns `false` if the process queue is closed.
    pub fn resolve(&self, mut chain: Chain) -> bool {
        let destination = self.placement.place(&chain, &self.membership);
        chain.set_destination(destination);
        trace!(chain = %chain.id(), destination = %destination, "chain resolved");

        if destination == self.membership.partition() {
            if let Err(closed) = self.process_queue.push(chain) {
                warn!(chain = %closed.0.id(), "process queue closed, dropping chain");
                return false;
            }
        } else {
            self.outbound.send_chain(chain);
        }
        true
    }

    /// Resolves chains until the resolve queue is closed and drained.
    pub fn run(&self) {
        debug!("chain resolver started");
        while let Some(chain) = self.resolve_queue.pop() {
            if !self.resolve(chain) {
                break;
            }
        }
        debug!("chain resolver exiting");
    }
}

/// Name of the thread running resolver `index`.
#[must_use]
pub fn thread_name(index: usize) -> String {
    format!("resolver-{index}")
}
