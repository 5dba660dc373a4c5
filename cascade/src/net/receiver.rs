//! Handling of messages delivered by the rx thread.
//!
//! Requests are answered on the control channel of the requesting peer;
//! replies are counted against the pending rendezvous of their kind. Nothing
//! here blocks: chains are offered to the node and remote code is queued for
//! the `remote-exec` thread.

use std::sync::atomic::Ordering;

use crate::chain::Chain;
use crate::trace::{debug, trace, warn};
use crate::types::PartitionId;

use super::protocol::{
    Broadcast, ChannelKind, Execute, ExecuteReply, Message, OpId, Retrieve, RetrieveReply,
    Sequence, SequenceReply,
};
use super::remote::RemoteInvocation;
use super::rendezvous::RendezvousTable;
use super::transport::Transport;
use super::workers::RemoteRequest;

impl Transport {
    /// Handles one message from `from`. Returns a chain the node could not
    /// take yet.
    pub(super) fn dispatch(&self, from: PartitionId, msg: Message) -> Option<Chain> {
        trace!(from = %from, tag = msg.tag(), "dispatching");
        match msg {
            Message::Hello(hello) => {
                warn!(from = %from, partition = %hello.partition, "unexpected hello on an open connection");
            }
            Message::Chain(chain) => return self.inbound.offer_chain(*chain).err(),
            Message::ChainTerminated(record) => self.inbound.chain_terminated(record),
            Message::TerminateNode => {
                debug!(from = %from, "termination requested");
                self.inbound.terminate_requested(from);
            }
            Message::Ready { partition } => {
                let seen = self.ready_signals.fetch_add(1, Ordering::AcqRel) + 1;
                debug!(partition = %partition, seen, "node ready");
            }
            Message::Broadcast(Broadcast {
                op,
                submission,
                entries,
            }) => {
                self.cache.put_all(submission, entries);
                self.reply(from, &Message::BroadcastAck { op });
            }
            Message::Retrieve(Retrieve {
                op,
                submission,
                keys,
            }) => {
                let values = self.cache.get_all(submission, &keys);
                self.reply(from, &Message::RetrieveReply(RetrieveReply { op, values }));
            }
            Message::Execute(Execute {
                op,
                node,
                submission,
                name,
            }) => {
                let request = RemoteRequest {
                    op,
                    name,
                    invocation: RemoteInvocation {
                        origin: from,
                        node,
                        submission,
                    },
                };
                if let Err(request) = self.remote_requests.try_push(request) {
                    warn!(from = %from, name = %request.name, "remote code queue full, refusing");
                    let refused = ExecuteReply {
                        op: request.op,
                        ok: false,
                    };
                    self.reply(from, &Message::ExecuteReply(refused));
                }
            }
            Message::Sequence(Sequence { op, name }) => {
                if !self.membership.is_coordinator() {
                    warn!(from = %from, name = %name, "sequence request sent to a non-coordinator");
                    return None;
                }
                let value = self.next_sequence(&name);
                self.reply(from, &Message::SequenceReply(SequenceReply { op, value }));
            }
            Message::StartMonitoring => self.metrics.start_monitoring(),
            Message::StopMonitoring => {
                let _ = self.metrics.stop_monitoring();
            }
            Message::BroadcastAck { op } => count(&self.broadcasts, from, op, ()),
            Message::RetrieveReply(RetrieveReply { op, values }) => {
                count(&self.retrievals, from, op, values);
            }
            Message::ExecuteReply(ExecuteReply { op, ok }) => count(&self.executions, from, op, ok),
            Message::SequenceReply(SequenceReply { op, value }) => {
                count(&self.sequences, from, op, value);
            }
        }
        None
    }

    pub(super) fn reply(&self, to: PartitionId, msg: &Message) {
        if let Err(e) = self.links.send(to, ChannelKind::Control, msg) {
            warn!(dest = %to, tag = msg.tag(), error = %e, "failed to send reply");
        }
    }
}

fn count<T>(table: &RendezvousTable<T>, from: PartitionId, op: OpId, reply: T) {
    if !table.resolve(op, reply) {
        warn!(kind = table.kind(), op = %op, from = %from, "reply for unknown operation");
    }
}
