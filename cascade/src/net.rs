//! Node-to-node transport.
//!
//! Every node keeps up to three TCP connections towards each peer, one per
//! [`ChannelKind`], and accepts the peers' connections on its own listener.
//! Messages are length-prefixed frames with a leading tag byte
//! (see [`protocol`]).
//!
//! On top of point-to-point chain transfer the transport offers collective
//! operations (broadcast, retrieve, remote execution, cluster sequences)
//! built on a counting rendezvous: the initiator blocks until every expected
//! reply has arrived.

mod cache;
mod endpoint;
mod frame;
mod link;
mod membership;
mod metrics;
pub mod protocol;
mod receiver;
mod remote;
mod rendezvous;
mod rx_thread;
mod transport;
mod workers;

pub use cache::SubmissionCache;
pub use endpoint::{Endpoint, EndpointError};
pub use frame::{FrameBuffer, FrameError, MAX_FRAME_LEN};
pub use membership::{Member, Membership, MembershipError};
pub use metrics::{TrafficSnapshot, TransportMetrics};
pub use protocol::{ChannelKind, Message, OpId};
pub use remote::{RemoteCodeRegistry, RemoteFn, RemoteInvocation};
pub use transport::{InboundSink, READY_POLL_INTERVAL, Transport, TransportError};
