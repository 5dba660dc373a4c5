//! Transport queue drainers: `chain-sender`, `chain-terminator` and
//! `remote-exec`.
//!
//! Each exits once its queue is closed and drained.

use std::sync::Arc;

use crate::trace::{debug, error, trace};

use super::protocol::{ChannelKind, ExecuteReply, Message, OpId};
use super::remote::RemoteInvocation;
use super::transport::Transport;

/// Remote code invocation received from a peer, answered once it has run.
pub(crate) struct RemoteRequest {
    pub(crate) op: OpId,
    pub(crate) name: String,
    pub(crate) invocation: RemoteInvocation,
}

pub(crate) fn run_sender(transport: Arc<Transport>) {
    debug!("chain sender started");
    let local = transport.membership().partition();
    while let Some(chain) = transport.send_queue().pop() {
        let dest = chain.destination().unwrap_or(local);
        if dest == local {
            trace!(chain = %chain.id(), "delivering chain locally");
            transport.inbound().chain_received(chain);
            continue;
        }
        let id = chain.id();
        if let Err(e) = transport
            .links()
            .send(dest, ChannelKind::Streaming, &Message::Chain(Box::new(chain)))
        {
            error!(chain = %id, dest = %dest, error = %e, "failed to send chain");
        }
    }
    debug!("chain sender exiting");
}

pub(crate) fn run_terminator(transport: Arc<Transport>) {
    debug!("chain terminator started");
    let local = transport.membership().partition();
    while let Some(record) = transport.terminated_queue().pop() {
        let dest = record.submission_node;
        if dest == local {
            transport.inbound().chain_terminated(record);
            continue;
        }
        if let Err(e) = transport.links().send(
            dest,
            ChannelKind::Control,
            &Message::ChainTerminated(record),
        ) {
            error!(
                chain = %record.chain,
                dest = %dest,
                error = %e,
                "failed to send termination record"
            );
        }
    }
    debug!("chain terminator exiting");
}

/// Runs remote code off the rx thread, so the code may itself start
/// collective operations.
pub(crate) fn run_remote_exec(transport: Arc<Transport>) {
    debug!("remote exec started");
    while let Some(RemoteRequest {
        op,
        name,
        invocation,
    }) = transport.remote_requests().pop()
    {
        let ok = transport.remote_code.run(&name, &invocation);
        trace!(name = %name, origin = %invocation.origin, ok, "remote code ran");
        transport.reply(invocation.origin, &Message::ExecuteReply(ExecuteReply { op, ok }));
    }
    debug!("remote exec exiting");
}
