//! Node-to-node messages.
//!
//! Every frame carries one message: a tag byte followed by the postcard
//! encoding of the message payload. Request/reply pairs carry an [`OpId`]
//! that the initiator uses to find its pending rendezvous.
//!
//! | Tag | Message | Channel |
//! |-----|---------|---------|
//! | 0 | `Hello` | first frame on every connection |
//! | 1 | `Chain` | streaming |
//! | 2 | `ChainTerminated` | control |
//! | 3 | `TerminateNode` | control |
//! | 4 | `Ready` | control |
//! | 10 / 11 | `Broadcast` / `BroadcastAck` | broadcast / control |
//! | 12 / 13 | `Retrieve` / `RetrieveReply` | broadcast / control |
//! | 14 / 15 | `Execute` / `ExecuteReply` | broadcast / control |
//! | 16 / 17 | `StartMonitoring` / `StopMonitoring` | control |
//! | 18 / 19 | `Sequence` / `SequenceReply` | broadcast / control |

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;

use crate::chain::{Chain, TerminationRecord};
use crate::types::{PartitionId, SubmissionId};
use crate::value::Value;

use super::frame::{FrameError, LEN_PREFIX, seal};

pub mod tag {
    pub const HELLO: u8 = 0;
    pub const CHAIN: u8 = 1;
    pub const CHAIN_TERMINATED: u8 = 2;
    pub const TERMINATE_NODE: u8 = 3;
    pub const READY: u8 = 4;
    pub const BROADCAST: u8 = 10;
    pub const BROADCAST_ACK: u8 = 11;
    pub const RETRIEVE: u8 = 12;
    pub const RETRIEVE_REPLY: u8 = 13;
    pub const EXECUTE: u8 = 14;
    pub const EXECUTE_REPLY: u8 = 15;
    pub const START_MONITORING: u8 = 16;
    pub const STOP_MONITORING: u8 = 17;
    pub const SEQUENCE: u8 = 18;
    pub const SEQUENCE_REPLY: u8 = 19;
}

/// Identifier of one collective operation, unique per operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(u32);

impl OpId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three logical links kept towards every peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Chain transfer.
    Streaming,
    /// Small messages and replies.
    Control,
    /// Collective requests.
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub partition: PartitionId,
    pub channel: ChannelKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broadcast {
    pub op: OpId,
    pub submission: SubmissionId,
    pub entries: Vec<(Value, Value)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retrieve {
    pub op: OpId,
    pub submission: SubmissionId,
    pub keys: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveReply {
    pub op: OpId,
    pub values: Vec<Option<Value>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execute {
    pub op: OpId,
    /// Node the code runs on behalf of.
    pub node: PartitionId,
    pub submission: SubmissionId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteReply {
    pub op: OpId,
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    pub op: OpId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceReply {
    pub op: OpId,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello(Hello),
    Chain(Box<Chain>),
    ChainTerminated(TerminationRecord),
    TerminateNode,
    Ready { partition: PartitionId },
    Broadcast(Broadcast),
    BroadcastAck { op: OpId },
    Retrieve(Retrieve),
    RetrieveReply(RetrieveReply),
    Execute(Execute),
    ExecuteReply(ExecuteReply),
    StartMonitoring,
    StopMonitoring,
    Sequence(Sequence),
    SequenceReply(SequenceReply),
}

impl Message {
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Hello(_) => tag::HELLO,
            Self::Chain(_) => tag::CHAIN,
            Self::ChainTerminated(_) => tag::CHAIN_TERMINATED,
            Self::TerminateNode => tag::TERMINATE_NODE,
            Self::Ready { .. } => tag::READY,
            Self::Broadcast(_) => tag::BROADCAST,
            Self::BroadcastAck { .. } => tag::BROADCAST_ACK,
            Self::Retrieve(_) => tag::RETRIEVE,
            Self::RetrieveReply(_) => tag::RETRIEVE_REPLY,
            Self::Execute(_) => tag::EXECUTE,
            Self::ExecuteReply(_) => tag::EXECUTE_REPLY,
            Self::StartMonitoring => tag::START_MONITORING,
            Self::StopMonitoring => tag::STOP_MONITORING,
            Self::Sequence(_) => tag::SEQUENCE,
            Self::SequenceReply(_) => tag::SEQUENCE_REPLY,
        }
    }

    /// Appends this message as one complete frame.
    ///
    /// # Errors
    ///
    /// Fails if the payload cannot be serialized or the frame is too large;
    /// `out` is left as it was.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), FrameError> {
        let start = out.len();
        out.extend_from_slice(&[0; LEN_PREFIX]);
        out.push(self.tag());
        let body = match self {
            Self::Hello(m) => postcard::to_allocvec(m),
            Self::Chain(m) => postcard::to_allocvec(m.as_ref()),
            Self::ChainTerminated(m) => postcard::to_allocvec(m),
            Self::Ready { partition } => postcard::to_allocvec(partition),
            Self::Broadcast(m) => postcard::to_allocvec(m),
            Self::BroadcastAck { op } => postcard::to_allocvec(op),
            Self::Retrieve(m) => postcard::to_allocvec(m),
            Self::RetrieveReply(m) => postcard::to_allocvec(m),
            Self::Execute(m) => postcard::to_allocvec(m),
            Self::ExecuteReply(m) => postcard::to_allocvec(m),
            Self::Sequence(m) => postcard::to_allocvec(m),
            Self::SequenceReply(m) => postcard::to_allocvec(m),
            Self::TerminateNode | Self::StartMonitoring | Self::StopMonitoring => Ok(Vec::new()),
        };
        match body {
            Ok(body) => out.extend_from_slice(&body),
            Err(e) => {
                out.truncate(start);
                return Err(e.into());
            }
        }
        seal(out, start)
    }

    /// Decodes a frame as returned by [`super::FrameBuffer::next_frame`].
    ///
    /// # Errors
    ///
    /// Fails on an empty frame, an unknown tag or a malformed body.
    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        let (&tag, body) = frame.split_first().ok_or(FrameError::Empty)?;
        Ok(match tag {
            tag::HELLO => Self::Hello(parse(body)?),
            tag::CHAIN => Self::Chain(Box::new(parse(body)?)),
            tag::CHAIN_TERMINATED => Self::ChainTerminated(parse(body)?),
            tag::TERMINATE_NODE => Self::TerminateNode,
            tag::READY => Self::Ready {
                partition: parse(body)?,
            },
            tag::BROADCAST => Self::Broadcast(parse(body)?),
            tag::BROADCAST_ACK => Self::BroadcastAck { op: parse(body)? },
            tag::RETRIEVE => Self::Retrieve(parse(body)?),
            tag::RETRIEVE_REPLY => Self::RetrieveReply(parse(body)?),
            tag::EXECUTE => Self::Execute(parse(body)?),
            tag::EXECUTE_REPLY => Self::ExecuteReply(parse(body)?),
            tag::START_MONITORING => Self::StartMonitoring,
            tag::STOP_MONITORING => Self::StopMonitoring,
            tag::SEQUENCE => Self::Sequence(parse(body)?),
            tag::SEQUENCE_REPLY => Self::SequenceReply(parse(body)?),
            other => return Err(FrameError::UnknownTag(other)),
        })
    }

    /// Operation id of a collective reply.
    #[must_use]
    pub const fn reply_op(&self) -> Option<OpId> {
        match self {
            Self::BroadcastAck { op }
            | Self::RetrieveReply(RetrieveReply { op, .. })
            | Self::ExecuteReply(ExecuteReply { op, .. })
            | Self::SequenceReply(SequenceReply { op, .. }) => Some(*op),
            _ => None,
        }
    }
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T, FrameError> {
    Ok(postcard::from_bytes(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::FrameBuffer;
    use crate::types::ChainId;

    fn through_the_wire(msg: &Message) -> Message {
        let mut out = Vec::new();
        msg.encode(&mut out).unwrap();
        let mut fb = FrameBuffer::new();
        fb.extend(&out);
        let frame = fb.next_frame().unwrap().unwrap();
        assert_eq!(frame[0], msg.tag());
        Message::decode(frame).unwrap()
    }

    #[test]
    fn tags_match_wire_numbering() {
        assert_eq!(Message::TerminateNode.tag(), 3);
        assert_eq!(Message::StartMonitoring.tag(), 16);
        assert_eq!(
            Message::SequenceReply(SequenceReply {
                op: OpId::new(1),
                value: 0
            })
            .tag(),
            19
        );
    }

    #[test]
    fn chain_frame_decodes() {
        let chain = Chain::new(ChainId::new(42), SubmissionId::new(1), PartitionId::new(2))
            .with_stage("scan", vec![Value::Int(3)])
            .unwrap();
        let msg = Message::Chain(Box::new(chain));
        assert_eq!(through_the_wire(&msg), msg);
    }

    #[test]
    fn empty_body_messages_decode() {
        assert_eq!(through_the_wire(&Message::TerminateNode), Message::TerminateNode);
        assert_eq!(
            through_the_wire(&Message::StopMonitoring),
            Message::StopMonitoring
        );
    }

    #[test]
    fn reply_op_only_for_replies() {
        let reply = Message::ExecuteReply(ExecuteReply {
            op: OpId::new(9),
            ok: true,
        });
        assert_eq!(reply.reply_op(), Some(OpId::new(9)));
        assert_eq!(Message::TerminateNode.reply_op(), None);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(matches!(
            Message::decode(&[99, 0]),
            Err(FrameError::UnknownTag(99))
        ));
        assert!(matches!(Message::decode(&[]), Err(FrameError::Empty)));
    }

    #[test]
    fn truncated_body_is_rejected() {
        let mut out = Vec::new();
        Message::Retrieve(Retrieve {
            op: OpId::new(1),
            submission: SubmissionId::new(2),
            keys: vec![Value::from("k")],
        })
        .encode(&mut out)
        .unwrap();
        let frame = &out[LEN_PREFIX..out.len() - 1];
        assert!(matches!(Message::decode(frame), Err(FrameError::Body(_))));
    }
}
