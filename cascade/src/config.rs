//! Node configuration.

use std::time::Duration;

use crate::net::Member;

/// Capacity of the queue of chains waiting for a placement decision.
pub const RESOLVE_QUEUE_CAPACITY: usize = 4096;
/// Capacity of the queue of chains waiting for a handler.
pub const PROCESS_QUEUE_CAPACITY: usize = 4096;
/// Capacity of the outgoing chain queue.
pub const SEND_QUEUE_CAPACITY: usize = 1024;
/// Capacity of the outgoing termination-record queue.
pub const TERMINATED_QUEUE_CAPACITY: usize = 4096;
/// Capacity of the queue of remote code requests waiting to run.
pub const REMOTE_QUEUE_CAPACITY: usize = 256;
/// Capacity of the statistics update queue.
pub const STATS_QUEUE_CAPACITY: usize = 8192;

/// Configuration for the transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Every cluster member, this node included. Order does not matter.
    pub members: Vec<Member>,
    /// Name of this node within `members`.
    pub local_name: String,
    pub send_queue_capacity: usize,
    pub terminated_queue_capacity: usize,
    /// Requests beyond this are refused with a failed reply.
    pub remote_queue_capacity: usize,
    /// Connection attempts made by `signal_ready` while the coordinator is
    /// not listening yet.
    pub ready_retries: u32,
    pub ready_retry_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            members: Vec::new(),
            local_name: String::new(),
            send_queue_capacity: SEND_QUEUE_CAPACITY,
            terminated_queue_capacity: TERMINATED_QUEUE_CAPACITY,
            remote_queue_capacity: REMOTE_QUEUE_CAPACITY,
            ready_retries: 100,
            ready_retry_interval: Duration::from_millis(100),
        }
    }
}

/// Configuration for one engine node.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub transport: TransportConfig,
    /// Number of `chain-handler-N` threads.
    pub handlers: usize,
    /// Number of `resolver-N` threads.
    pub resolvers: usize,
    pub resolve_queue_capacity: usize,
    pub process_queue_capacity: usize,
    pub stats_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            handlers: 4,
            resolvers: 1,
            resolve_queue_capacity: RESOLVE_QUEUE_CAPACITY,
            process_queue_capacity: PROCESS_QUEUE_CAPACITY,
            stats_queue_capacity: STATS_QUEUE_CAPACITY,
        }
    }
}
