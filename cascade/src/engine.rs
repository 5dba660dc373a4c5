//! Engine: one cluster node with all of its threads.
//!
//! # Startup
//!
//! 1. Create the resolve and process queues, then start the transport.
//! 2. Signal ready to the coordinator; the coordinator waits for everyone.
//! 3. Seed each handler's chain-id and bucket-id blocks from the cluster
//!    sequences. A failure here stops the transport again.
//! 4. Start the statistics collector and the chain notifier.
//! 5. Spawn the `chain-handler-N` and `resolver-N` threads.
//!
//! # Shutdown
//!
//! [`Engine::terminate_cluster`] broadcasts `TERMINATE_NODE`; every node
//! observes it through [`Engine::wait_for_termination`] and then calls
//! [`Engine::shutdown`], which closes the queues and joins the threads.

use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::chain::{Chain, ChainError, TerminationRecord};
use crate::config::EngineConfig;
use crate::input::InputRegistry;
use crate::net::{
    InboundSink, RemoteCodeRegistry, SubmissionCache, Transport, TransportError,
};
use crate::runtime::{
    ChainHandler, ChainNotifier, ChainResolver, LocalPlacement, Placement, Services, handler,
    resolver,
};
use crate::stage::{StageContext, StagePool};
use crate::stats::StatisticsCollector;
use crate::sync::BoundedQueue;
use crate::trace::{debug, info, warn};
use crate::types::{BucketIdAllocator, ChainIdAllocator, PartitionId};

/// Cluster sequence seeding each handler's chain-id block.
pub const CHAIN_ID_SEQUENCE: &str = "chainID";
/// Cluster sequence seeding each handler's bucket-id block.
pub const BUCKET_ID_SEQUENCE: &str = "bucketID";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("engine is shutting down")]
    Stopped,
}

/// Receives the termination records of submissions owned by this node.
pub trait TerminationSink: Send + Sync {
    fn chain_terminated(&self, record: TerminationRecord);
}

/// Collects termination records in arrival order.
#[derive(Debug, Default)]
pub struct TerminationLog {
    records: Mutex<Vec<TerminationRecord>>,
    arrived: Condvar,
}

impl TerminationLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<TerminationRecord> {
        self.records.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Blocks until at least `count` records arrived or `timeout` elapsed.
    /// Returns whether the count was reached.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut records = self.records.lock();
        while records.len() < count {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let _ = self.arrived.wait_for(&mut records, remaining);
        }
        true
    }
}

impl TerminationSink for TerminationLog {
    fn chain_terminated(&self, record: TerminationRecord) {
        self.records.lock().push(record);
        self.arrived.notify_all();
    }
}

/// What the engine is built around.
pub struct Collaborators {
    pub stages: StagePool,
    pub inputs: InputRegistry,
    pub placement: Arc<dyn Placement>,
    pub terminations: Arc<dyn TerminationSink>,
    pub remote_code: Arc<RemoteCodeRegistry>,
    pub cache: Arc<SubmissionCache>,
}

impl Collaborators {
    /// Local placement, an empty remote-code registry and a fresh cache.
    #[must_use]
    pub fn new(
        stages: StagePool,
        inputs: InputRegistry,
        terminations: Arc<dyn TerminationSink>,
    ) -> Self {
        Self {
            stages,
            inputs,
            placement: Arc::new(LocalPlacement),
            terminations,
            remote_code: Arc::new(RemoteCodeRegistry::new()),
            cache: Arc::new(SubmissionCache::new()),
        }
    }

    #[must_use]
    pub fn with_placement(mut self, placement: Arc<dyn Placement>) -> Self {
        self.placement = placement;
        self
    }
}

#[derive(Default)]
struct TerminateFlag {
    requested: Mutex<bool>,
    signalled: Condvar,
}

impl TerminateFlag {
    fn set(&self) {
        *self.requested.lock() = true;
        self.signalled.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.requested.lock()
    }

    fn wait(&self) {
        let mut requested = self.requested.lock();
        while !*requested {
            self.signalled.wait(&mut requested);
        }
    }
}

/// Routes what the transport receives into this node.
struct Inbox {
    process_queue: Arc<BoundedQueue<Chain>>,
    terminations: Arc<dyn TerminationSink>,
    terminate: Arc<TerminateFlag>,
}

impl InboundSink for Inbox {
    fn chain_received(&self, chain: Chain) {
        if let Err(closed) = self.process_queue.push(chain) {
            warn!(chain = %closed.0.id(), "process queue closed, dropping received chain");
        }
    }

    fn offer_chain(&self, chain: Chain) -> Result<(), Chain> {
        match self.process_queue.try_push(chain) {
            Ok(()) => Ok(()),
            Err(chain) if self.process_queue.is_closed() => {
                warn!(chain = %chain.id(), "process queue closed, dropping received chain");
                Ok(())
            }
            Err(chain) => Err(chain),
        }
    }

    fn chain_terminated(&self, record: TerminationRecord) {
        self.terminations.chain_terminated(record);
    }

    fn terminate_requested(&self, from: PartitionId) {
        info!(from = %from, "node termination requested");
        self.terminate.set();
    }
}

/// Handle to a running node.
///
/// Dropping the handle closes the queues but does not wait for threads to
/// exit. Use [`Engine::shutdown`] for a graceful shutdown with join.
pub struct Engine {
    transport: Arc<Transport>,
    resolve_queue: Arc<BoundedQueue<Chain>>,
    process_queue: Arc<BoundedQueue<Chain>>,
    stats: Arc<StatisticsCollector>,
    notifier_shutdown: Arc<AtomicBool>,
    terminate: Arc<TerminateFlag>,
    resolvers: Vec<JoinHandle<()>>,
    handlers: Vec<JoinHandle<()>>,
    notifier_handle: Option<JoinHandle<()>>,
}

impl Engine {
    /// Starts a node listening on its member endpoint.
    ///
    /// Blocks until the cluster is ready: on the coordinator, until every
    /// other node signalled ready.
    ///
    /// # Errors
    ///
    /// Fails on an invalid configuration, if the transport cannot start, or
    /// if the coordinator cannot be reached.
    ///
    /// # Panics
    ///
    /// Panics if thread spawning fails.
    pub fn start(config: EngineConfig, collaborators: Collaborators) -> Result<Self, EngineError> {
        Self::launch(config, collaborators, None)
    }

    /// Like [`Engine::start`], on an already bound listener.
    ///
    /// # Errors
    ///
    /// See [`Engine::start`].
    pub fn start_on(
        config: EngineConfig,
        listener: TcpListener,
        collaborators: Collaborators,
    ) -> Result<Self, EngineError> {
        Self::launch(config, collaborators, Some(listener))
    }

    fn launch(
        config: EngineConfig,
        collaborators: Collaborators,
        listener: Option<TcpListener>,
    ) -> Result<Self, EngineError> {
        if config.handlers == 0 {
            return Err(EngineError::InvalidConfig("at least one chain handler is required"));
        }
        if config.resolvers == 0 {
            return Err(EngineError::InvalidConfig("at least one resolver is required"));
        }
        let Collaborators {
            stages,
            inputs,
            placement,
            terminations,
            remote_code,
            cache,
        } = collaborators;

        let resolve_queue = Arc::new(BoundedQueue::new(config.resolve_queue_capacity));
        let process_queue = Arc::new(BoundedQueue::new(config.process_queue_capacity));
        let terminate = Arc::new(TerminateFlag::default());
        let inbox = Arc::new(Inbox {
            process_queue: Arc::clone(&process_queue),
            terminations,
            terminate: Arc::clone(&terminate),
        });

        let transport = match listener {
            Some(listener) => Transport::spawn_on(config.transport, listener, inbox, cache, remote_code),
            None => Transport::spawn(config.transport, inbox, cache, remote_code),
        }?;

        let seeds = match Self::rendezvous(&transport, config.handlers) {
            Ok(seeds) => seeds,
            Err(e) => {
                transport.stop();
                return Err(e);
            }
        };

        let stats = StatisticsCollector::spawn(config.stats_queue_capacity);
        let notifier = Arc::new(ChainNotifier::new(Arc::clone(&process_queue)));
        let notifier_shutdown = Arc::new(AtomicBool::new(false));
        let notifier_handle = notifier.spawn(Arc::clone(&notifier_shutdown));

        let services = Services {
            process_queue: Arc::clone(&process_queue),
            resolve_queue: Arc::clone(&resolve_queue),
            stages: Arc::new(stages),
            inputs: Arc::new(inputs),
            notifier,
            outbound: transport.clone(),
            stats: stats.clone(),
        };
        let partition = transport.partition();

        let handlers = seeds
            .into_iter()
            .enumerate()
            .map(|(index, (chain_seq, bucket_seq))| {
                let ctx = StageContext::new(
                    partition,
                    ChainIdAllocator::from_sequence(chain_seq),
                    BucketIdAllocator::from_sequence(bucket_seq),
                    Some(Arc::clone(&transport)),
                );
                let mut handler = ChainHandler::new(services.clone(), ctx);
                thread::Builder::new()
                    .name(handler::thread_name(index))
                    .spawn(move || handler.run())
                    .expect("failed to spawn chain handler thread")
            })
            .collect();

        let membership = Arc::new(transport.membership().clone());
        let resolvers = (0..config.resolvers)
            .map(|index| {
                let resolver = ChainResolver::new(
                    Arc::clone(&resolve_queue),
                    Arc::clone(&process_queue),
                    Arc::clone(&placement),
                    Arc::clone(&membership),
                    transport.clone(),
                );
                thread::Builder::new()
                    .name(resolver::thread_name(index))
                    .spawn(move || resolver.run())
                    .expect("failed to spawn resolver thread")
            })
            .collect();

        info!(
            partition = %partition,
            handlers = config.handlers,
            resolvers = config.resolvers,
            "engine started"
        );

        Ok(Self {
            transport,
            resolve_queue,
            process_queue,
            stats,
            notifier_shutdown,
            terminate,
            resolvers,
            handlers,
            notifier_handle: Some(notifier_handle),
        })
    }

    /// Runs the startup barrier, then draws one (chain, bucket) sequence pair
    /// per handler.
    fn rendezvous(transport: &Transport, handlers: usize) -> Result<Vec<(u64, u64)>, EngineError> {
        transport.signal_ready()?;
        transport.wait_until_all_ready();
        let mut seeds = Vec::with_capacity(handlers);
        for _ in 0..handlers {
            let chain_seq = transport.get_counter(CHAIN_ID_SEQUENCE)?;
            let bucket_seq = transport.get_counter(BUCKET_ID_SEQUENCE)?;
            debug!(chain_seq, bucket_seq, "handler id blocks seeded");
            seeds.push((chain_seq, bucket_seq));
        }
        Ok(seeds)
    }

    #[must_use]
    pub fn partition(&self) -> PartitionId {
        self.transport.partition()
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    #[must_use]
    pub fn statistics(&self) -> &Arc<StatisticsCollector> {
        &self.stats
    }

    /// Queues a chain for placement.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Stopped`] once shutdown has begun.
    pub fn submit(&self, chain: Chain) -> Result<(), EngineError> {
        self.resolve_queue.push(chain).map_err(|_| EngineError::Stopped)
    }

    /// Asks every node, this one included, to terminate.
    pub fn terminate_cluster(&self) {
        self.transport.signal_termination();
        self.terminate.set();
    }

    #[must_use]
    pub fn is_termination_requested(&self) -> bool {
        self.terminate.is_set()
    }

    /// Blocks until this node is asked to terminate.
    pub fn wait_for_termination(&self) {
        self.terminate.wait();
    }

    /// Stops the worker threads, then the transport and the statistics
    /// collector.
    ///
    /// Chains still queued are processed first; children they produce after
    /// the resolve queue closed are dropped.
    pub fn shutdown(mut self) {
        info!(partition = %self.partition(), "engine shutdown initiated");

        self.resolve_queue.close();
        for handle in self.resolvers.drain(..) {
            let _ = handle.join();
        }
        debug!("resolvers stopped");

        self.process_queue.close();
        for handle in self.handlers.drain(..) {
            let _ = handle.join();
        }
        debug!("chain handlers stopped");

        self.notifier_shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.notifier_handle.take() {
            let _ = handle.join();
        }

        self.transport.stop();
        self.stats.stop();
        info!("engine shutdown complete");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Threads notice the closed queues and exit on their own.
        self.resolve_queue.close();
        self.process_queue.close();
        self.notifier_shutdown.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChainId, SubmissionId};

    fn chain(id: u64) -> Chain {
        Chain::new(ChainId::new(id), SubmissionId::new(1), PartitionId::new(1))
    }

    #[test]
    fn full_process_queue_hands_offered_chains_back() {
        let process_queue = Arc::new(BoundedQueue::new(1));
        let inbox = Inbox {
            process_queue: Arc::clone(&process_queue),
            terminations: Arc::new(TerminationLog::new()),
            terminate: Arc::new(TerminateFlag::default()),
        };

        assert!(inbox.offer_chain(chain(1)).is_ok());
        let refused = inbox.offer_chain(chain(2)).unwrap_err();
        assert_eq!(refused.id(), ChainId::new(2));

        assert_eq!(process_queue.try_pop().map(|c| c.id()), Some(ChainId::new(1)));
        assert!(inbox.offer_chain(refused).is_ok());

        // once closed, chains are dropped instead of held forever
        process_queue.close();
        assert!(inbox.offer_chain(chain(3)).is_ok());
        assert_eq!(process_queue.len(), 1);
    }
}
