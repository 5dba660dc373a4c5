//! Worker threads of one node.
//!
//! - `handler`: chain-handler threads running stage pipelines.
//! - `resolver`: resolver threads assigning destinations to new chains.
//! - `notifier`: parks chains whose input is not ready yet.

pub mod handler;
pub mod notifier;
mod pipeline;
pub mod resolver;

pub use handler::{Activation, ChainHandler};
pub use notifier::ChainNotifier;
pub use resolver::{ChainResolver, LocalPlacement, Placement, SpreadPlacement};

use std::sync::Arc;

use crate::chain::{Chain, TerminationRecord};
use crate::input::InputRegistry;
use crate::stage::StagePool;
use crate::stats::Statistics;
use crate::sync::BoundedQueue;

/// Where chains and termination records leave a handler.
///
/// Implemented by [`crate::net::Transport`]; both calls block while the
/// outgoing queues are full.
pub trait Outbound: Send + Sync {
    /// Sends chains whose destination is already set, leaving `chains` empty.
    fn send_chains(&self, chains: &mut Vec<Chain>);

    fn send_chain(&self, chain: Chain);

    /// Queues the termination record of `chain` for its submission node.
    fn signal_chain_terminated(&self, chain: &Chain) {
        self.signal_termination_record(TerminationRecord::from(chain));
    }

    fn signal_termination_record(&self, record: TerminationRecord);
}

/// Shared handles every handler thread needs.
#[derive(Clone)]
pub struct Services {
    pub process_queue: Arc<BoundedQueue<Chain>>,
    pub resolve_queue: Arc<BoundedQueue<Chain>>,
    pub stages: Arc<StagePool>,
    pub inputs: Arc<InputRegistry>,
    pub notifier: Arc<ChainNotifier>,
    pub outbound: Arc<dyn Outbound>,
    pub stats: Arc<dyn Statistics>,
}
