//! Transport: one node's view of the cluster.
//!
//! # Threads
//!
//! - **rx**: accepts peer connections and dispatches incoming messages.
//! - **chain-sender**: drains the outgoing chain queue.
//! - **chain-terminator**: drains the termination-record queue.
//! - **remote-exec**: runs remote code requested by peers and replies.
//!
//! Collective operations run on the caller's thread and block it for a full
//! round trip. The rx thread never blocks, so replies keep arriving while
//! the node refuses incoming chains.
//!
//! # Example
//!
//! ```ignore
//! use cascade::config::TransportConfig;
//! use cascade::net::Transport;
//!
//! let transport = Transport::spawn(config, inbound, cache, remote_code)?;
//! transport.signal_ready()?;
//! transport.wait_until_all_ready();
//!
//! let ok = transport.broadcast_objects(submission, entries);
//!
//! transport.stop();
//! ```

use std::collections::HashMap;
use std::io;
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use crate::chain::{Chain, TerminationRecord};
use crate::config::TransportConfig;
use crate::runtime::Outbound;
use crate::sync::BoundedQueue;
use crate::trace::{debug, error, info, trace, warn};
use crate::types::{PartitionId, SubmissionId};
use crate::value::Value;

use super::cache::SubmissionCache;
use super::frame::FrameError;
use super::link::Links;
use super::membership::{Membership, MembershipError};
use super::metrics::TransportMetrics;
use super::protocol::{Broadcast, ChannelKind, Execute, Message, OpId, Retrieve, Sequence};
use super::remote::{RemoteCodeRegistry, RemoteInvocation};
use super::rendezvous::RendezvousTable;
use super::rx_thread::RxThread;
use super::workers::RemoteRequest;
use super::{Endpoint, workers};

/// How often [`Transport::wait_until_all_ready`] checks the ready count.
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Membership(#[from] MembershipError),
    #[error("failed to bind {endpoint}: {source}")]
    Bind { endpoint: Endpoint, source: io::Error },
    #[error("failed to start rx thread: {0}")]
    Poll(io::Error),
    #[error("unknown partition {0}")]
    UnknownPartition(PartitionId),
    #[error("failed to connect to partition {dest} at {endpoint}: {source}")]
    Connect {
        dest: PartitionId,
        endpoint: Endpoint,
        source: io::Error,
    },
    #[error("failed to send to partition {dest}: {source}")]
    Send { dest: PartitionId, source: io::Error },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("{kind} operation failed")]
    Collective { kind: &'static str },
}

/// Receives what peers deliver to this node.
pub trait InboundSink: Send + Sync {
    /// A chain this node sent to itself. May block.
    fn chain_received(&self, chain: Chain);

    /// A chain a peer sent to this node. Must not block.
    ///
    /// # Errors
    ///
    /// Hands the chain back when the node cannot take it yet. The rx thread
    /// holds it, stops reading that peer's chain stream and offers it again
    /// shortly.
    fn offer_chain(&self, chain: Chain) -> Result<(), Chain>;

    /// A termination record for a submission owned by this node.
    fn chain_terminated(&self, record: TerminationRecord);

    /// A peer asked this node to terminate.
    fn terminate_requested(&self, from: PartitionId);
}

enum Target {
    All,
    Node(PartitionId),
}

pub struct Transport {
    pub(super) membership: Arc<Membership>,
    pub(super) links: Links,
    pub(super) metrics: Arc<TransportMetrics>,
    pub(super) cache: Arc<SubmissionCache>,
    pub(super) remote_code: Arc<RemoteCodeRegistry>,
    pub(super) inbound: Arc<dyn InboundSink>,
    send_queue: BoundedQueue<Chain>,
    terminated_queue: BoundedQueue<TerminationRecord>,
    pub(super) remote_requests: BoundedQueue<RemoteRequest>,
    pub(super) ready_signals: AtomicUsize,
    ready_retries: u32,
    ready_retry_interval: Duration,
    pub(super) broadcasts: RendezvousTable<()>,
    pub(super) retrievals: RendezvousTable<Vec<Option<Value>>>,
    pub(super) executions: RendezvousTable<bool>,
    pub(super) sequences: RendezvousTable<u64>,
    /// Cluster sequences, only advanced on the coordinator.
    counters: Mutex<HashMap<String, u64>>,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Transport {
    /// Binds the local member's endpoint and starts the transport threads.
    ///
    /// # Errors
    ///
    /// Fails on an invalid membership or if the endpoint cannot be bound.
    pub fn spawn(
        config: TransportConfig,
        inbound: Arc<dyn InboundSink>,
        cache: Arc<SubmissionCache>,
        remote_code: Arc<RemoteCodeRegistry>,
    ) -> Result<Arc<Self>, TransportError> {
        let membership = Membership::new(config.members.clone(), &config.local_name)?;
        let endpoint = membership
            .endpoint(membership.partition())
            .ok_or(TransportError::UnknownPartition(membership.partition()))?;
        let listener = TcpListener::bind(endpoint.as_socket_addr()).map_err(|source| {
            error!(endpoint = %endpoint, error = %source, "failed to bind listener");
            TransportError::Bind { endpoint, source }
        })?;
        Self::spawn_on(config, listener, inbound, cache, remote_code)
    }

    /// Starts the transport on an already bound listener.
    ///
    /// # Errors
    ///
    /// Fails on an invalid membership or if the event loop cannot be set up.
    ///
    /// # Panics
    ///
    /// Panics if thread spawning fails.
    pub fn spawn_on(
        config: TransportConfig,
        listener: TcpListener,
        inbound: Arc<dyn InboundSink>,
        cache: Arc<SubmissionCache>,
        remote_code: Arc<RemoteCodeRegistry>,
    ) -> Result<Arc<Self>, TransportError> {
        let membership = Arc::new(Membership::new(config.members, &config.local_name)?);
        info!(
            partition = %membership.partition(),
            members = membership.len(),
            local = %config.local_name,
            "transport starting"
        );

        let metrics = Arc::new(TransportMetrics::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let transport = Arc::new(Self {
            links: Links::new(Arc::clone(&membership), Arc::clone(&metrics)),
            membership,
            metrics,
            cache,
            remote_code,
            inbound,
            send_queue: BoundedQueue::new(config.send_queue_capacity),
            terminated_queue: BoundedQueue::new(config.terminated_queue_capacity),
            remote_requests: BoundedQueue::new(config.remote_queue_capacity),
            ready_signals: AtomicUsize::new(0),
            ready_retries: config.ready_retries,
            ready_retry_interval: config.ready_retry_interval,
            broadcasts: RendezvousTable::new("broadcast"),
            retrievals: RendezvousTable::new("retrieve"),
            executions: RendezvousTable::new("execute"),
            sequences: RendezvousTable::new("sequence"),
            counters: Mutex::new(HashMap::new()),
            shutdown: Arc::clone(&shutdown),
            threads: Mutex::new(Vec::new()),
        });

        let mut rx = RxThread::new(listener, Arc::clone(&transport), shutdown)
            .map_err(TransportError::Poll)?;

        debug!("spawning rx thread");
        let rx_handle = thread::Builder::new()
            .name("rx".into())
            .spawn(move || {
                info!("rx thread started");
                rx.run();
                info!("rx thread exiting");
            })
            .expect("failed to spawn rx thread");

        let sender = Arc::clone(&transport);
        let sender_handle = thread::Builder::new()
            .name("chain-sender".into())
            .spawn(move || workers::run_sender(sender))
            .expect("failed to spawn chain sender thread");

        let terminator = Arc::clone(&transport);
        let terminator_handle = thread::Builder::new()
            .name("chain-terminator".into())
            .spawn(move || workers::run_terminator(terminator))
            .expect("failed to spawn chain terminator thread");

        let executor = Arc::clone(&transport);
        let exec_handle = thread::Builder::new()
            .name("remote-exec".into())
            .spawn(move || workers::run_remote_exec(executor))
            .expect("failed to spawn remote exec thread");

        transport.threads.lock().extend([
            rx_handle,
            sender_handle,
            terminator_handle,
            exec_handle,
        ]);
        info!(partition = %transport.membership.partition(), "transport started");
        Ok(transport)
    }

    #[must_use]
    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    #[must_use]
    pub fn partition(&self) -> PartitionId {
        self.membership.partition()
    }

    #[must_use]
    pub fn metrics(&self) -> &TransportMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn cache(&self) -> &SubmissionCache {
        &self.cache
    }

    pub(super) fn links(&self) -> &Links {
        &self.links
    }

    pub(super) fn inbound(&self) -> &dyn InboundSink {
        self.inbound.as_ref()
    }

    pub(super) fn send_queue(&self) -> &BoundedQueue<Chain> {
        &self.send_queue
    }

    pub(super) fn terminated_queue(&self) -> &BoundedQueue<TerminationRecord> {
        &self.terminated_queue
    }

    pub(super) fn remote_requests(&self) -> &BoundedQueue<RemoteRequest> {
        &self.remote_requests
    }

    // ---- startup barrier ----

    /// Tells the coordinator this node is up. A no-op on the coordinator.
    ///
    /// The coordinator may not be listening yet, so connecting is retried a
    /// bounded number of times.
    ///
    /// # Errors
    ///
    /// Returns the last send error once the retries are used up.
    pub fn signal_ready(&self) -> Result<(), TransportError> {
        if self.membership.is_coordinator() {
            return Ok(());
        }
        let msg = Message::Ready {
            partition: self.partition(),
        };
        let mut attempt = 0;
        loop {
            match self
                .links
                .send(PartitionId::COORDINATOR, ChannelKind::Control, &msg)
            {
                Ok(()) => {
                    debug!("ready signal sent");
                    return Ok(());
                }
                Err(e @ TransportError::Connect { .. }) if attempt < self.ready_retries => {
                    attempt += 1;
                    trace!(attempt, error = %e, "coordinator not reachable yet");
                    thread::sleep(self.ready_retry_interval);
                }
                Err(e) => {
                    error!(error = %e, "failed to signal ready");
                    return Err(e);
                }
            }
        }
    }

    /// Ready signals received so far (coordinator only).
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.ready_signals.load(Ordering::Acquire)
    }

    /// Blocks the coordinator until every other node signalled ready.
    /// Returns at once on other nodes.
    pub fn wait_until_all_ready(&self) {
        if !self.membership.is_coordinator() {
            return;
        }
        let expected = self.membership.peer_count();
        loop {
            let seen = self.ready_count();
            if seen >= expected {
                break;
            }
            debug!(seen, expected, "waiting for peers");
            thread::sleep(READY_POLL_INTERVAL);
        }
        info!(nodes = self.membership.len(), "all nodes ready");
    }

    /// Asks every other node to terminate.
    pub fn signal_termination(&self) {
        info!("signalling cluster termination");
        for peer in self.membership.peers() {
            if let Err(e) = self
                .links
                .send(peer, ChannelKind::Control, &Message::TerminateNode)
            {
                warn!(dest = %peer, error = %e, "failed to signal termination");
            }
        }
    }

    // ---- collectives ----

    /// Stores `entries` on every node, this one included.
    ///
    /// Returns `true` once every peer acknowledged, `false` if a request could
    /// not be sent.
    pub fn broadcast_objects(&self, submission: SubmissionId, entries: Vec<(Value, Value)>) -> bool {
        self.cache.put_all(submission, entries.iter().cloned());
        self.collective(&self.broadcasts, Target::All, |op| {
            Message::Broadcast(Broadcast {
                op,
                submission,
                entries,
            })
        })
        .is_some()
    }

    /// Stores `entries` on one node.
    pub fn send_object(
        &self,
        dest: PartitionId,
        submission: SubmissionId,
        entries: Vec<(Value, Value)>,
    ) -> bool {
        if dest == self.partition() {
            self.cache.put_all(submission, entries);
            return true;
        }
        self.collective(&self.broadcasts, Target::Node(dest), |op| {
            Message::Broadcast(Broadcast {
                op,
                submission,
                entries,
            })
        })
        .is_some()
    }

    /// Looks `keys` up on every other node.
    ///
    /// Returns one reply per peer in arrival order; each reply holds one slot
    /// per key. `None` if a request could not be sent.
    pub fn retrieve_objects(
        &self,
        submission: SubmissionId,
        keys: Vec<Value>,
    ) -> Option<Vec<Vec<Option<Value>>>> {
        self.collective(&self.retrievals, Target::All, |op| {
            Message::Retrieve(Retrieve {
                op,
                submission,
                keys,
            })
        })
    }

    /// Looks `keys` up on one node.
    pub fn retrieve_objects_from(
        &self,
        dest: PartitionId,
        submission: SubmissionId,
        keys: Vec<Value>,
    ) -> Option<Vec<Option<Value>>> {
        if dest == self.partition() {
            return Some(self.cache.get_all(submission, &keys));
        }
        self.collective(&self.retrievals, Target::Node(dest), |op| {
            Message::Retrieve(Retrieve {
                op,
                submission,
                keys,
            })
        })?
        .pop()
    }

    /// Runs the registered code `name` on every other node.
    ///
    /// Returns `true` only if every peer ran it successfully.
    pub fn execute_remote_code(&self, node: PartitionId, submission: SubmissionId, name: &str) -> bool {
        self.collective(&self.executions, Target::All, |op| {
            Message::Execute(Execute {
                op,
                node,
                submission,
                name: name.to_owned(),
            })
        })
        .is_some_and(|replies| replies.into_iter().all(|ok| ok))
    }

    /// Runs the registered code `name` on one node.
    pub fn execute_remote_code_on(
        &self,
        dest: PartitionId,
        node: PartitionId,
        submission: SubmissionId,
        name: &str,
    ) -> bool {
        if dest == self.partition() {
            let invocation = RemoteInvocation {
                origin: dest,
                node,
                submission,
            };
            return self.remote_code.run(name, &invocation);
        }
        self.collective(&self.executions, Target::Node(dest), |op| {
            Message::Execute(Execute {
                op,
                node,
                submission,
                name: name.to_owned(),
            })
        })
        .is_some_and(|replies| replies.into_iter().all(|ok| ok))
    }

    /// Takes the next value of the cluster-wide sequence `name`.
    ///
    /// Sequences start at 0 and are served by the coordinator.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Collective`] if the request could not be
    /// sent to the coordinator.
    pub fn get_counter(&self, name: &str) -> Result<u64, TransportError> {
        if self.membership.is_coordinator() {
            return Ok(self.next_sequence(name));
        }
        self.collective(&self.sequences, Target::Node(PartitionId::COORDINATOR), |op| {
            Message::Sequence(Sequence {
                op,
                name: name.to_owned(),
            })
        })
        .and_then(|mut replies| replies.pop())
        .ok_or(TransportError::Collective {
            kind: self.sequences.kind(),
        })
    }

    pub(super) fn next_sequence(&self, name: &str) -> u64 {
        let mut counters = self.counters.lock();
        let slot = counters.entry(name.to_owned()).or_insert(0);
        let value = *slot;
        *slot += 1;
        value
    }

    /// Opens a rendezvous, sends the request and waits for every reply.
    fn collective<T>(
        &self,
        table: &RendezvousTable<T>,
        target: Target,
        build: impl FnOnce(OpId) -> Message,
    ) -> Option<Vec<T>> {
        let dests: Vec<PartitionId> = match target {
            Target::All => self.membership.peers().collect(),
            Target::Node(dest) => vec![dest],
        };
        let ticket = table.open(dests.len());
        let msg = build(ticket.id());
        for dest in dests {
            if let Err(e) = self.links.send(dest, ChannelKind::Broadcast, &msg) {
                warn!(
                    kind = table.kind(),
                    op = %ticket.id(),
                    dest = %dest,
                    error = %e,
                    "collective request failed"
                );
                return None;
            }
        }
        trace!(kind = table.kind(), op = %ticket.id(), "waiting for replies");
        Some(ticket.wait())
    }

    // ---- monitoring ----

    pub fn start_monitoring(&self) {
        self.metrics.start_monitoring();
    }

    pub fn stop_monitoring(&self) {
        let _ = self.metrics.stop_monitoring();
    }

    /// Starts monitoring here and on every other node.
    pub fn broadcast_start_monitoring(&self) {
        self.metrics.start_monitoring();
        self.notify_peers(&Message::StartMonitoring);
    }

    /// Stops monitoring here and on every other node.
    pub fn broadcast_stop_monitoring(&self) {
        let _ = self.metrics.stop_monitoring();
        self.notify_peers(&Message::StopMonitoring);
    }

    fn notify_peers(&self, msg: &Message) {
        for peer in self.membership.peers() {
            if let Err(e) = self.links.send(peer, ChannelKind::Control, msg) {
                warn!(dest = %peer, tag = msg.tag(), error = %e, "failed to notify peer");
            }
        }
    }

    /// Drains the outgoing queues, stops the threads and closes every
    /// connection. Idempotent.
    pub fn stop(&self) {
        self.send_queue.close();
        self.terminated_queue.close();
        self.remote_requests.close();
        self.shutdown.store(true, Ordering::Relaxed);
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        if threads.is_empty() {
            return;
        }
        info!("transport shutdown initiated");
        for handle in threads {
            let _ = handle.join();
        }
        self.links.close_all();
        info!("transport shutdown complete");
    }
}

impl Outbound for Transport {
    fn send_chains(&self, chains: &mut Vec<Chain>) {
        if self.send_queue.push_all(chains).is_err() {
            warn!(dropped = chains.len(), "send queue closed, dropping chains");
            chains.clear();
        }
    }

    fn send_chain(&self, chain: Chain) {
        if let Err(closed) = self.send_queue.push(chain) {
            warn!(chain = %closed.0.id(), "send queue closed, dropping chain");
        }
    }

    fn signal_termination_record(&self, record: TerminationRecord) {
        if self.terminated_queue.push(record).is_err() {
            warn!(chain = %record.chain, "termination queue closed, dropping record");
        }
    }
}
