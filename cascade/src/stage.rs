//! The three-phase stage contract.
//!
//! A chain's pipeline is a list of stage names. For every activation the
//! handler acquires one [`Stage`] per name from the [`StagePool`], then drives:
//!
//! ```text
//! start_process   once per stage, in order, until one blocks
//! process         0..N times, once per record reaching the stage
//! stop_process    once per started stage, in order, after the stream ends
//! ```
//!
//! Stages talk to the rest of the engine through three handles:
//! - [`Emitter`]: records for the next stage's `process`.
//! - [`ChildBuffers`]: new chains, either for routing or already addressed.
//! - [`StageContext`]: id allocation and the node's transport.

mod pool;

pub use pool::{StageFactory, StagePool};

use std::sync::Arc;
use thiserror::Error;

use crate::chain::{Chain, ChainError};
use crate::net::Transport;
use crate::types::{BucketIdAllocator, ChainIdAllocator, InputLayerId, PartitionId};
use crate::value::{Record, Value};

#[derive(Debug, Error)]
pub enum StageError {
    /// No factory is registered under this stage name.
    #[error("unknown stage: {0}")]
    UnknownStage(String),
    /// The chain names an input layer that is not registered.
    #[error("unknown input layer: {0}")]
    UnknownInputLayer(InputLayerId),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("stage failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// One step of a chain pipeline.
pub trait Stage: Send {
    /// Called once before streaming with the stage's parameters.
    ///
    /// # Errors
    ///
    /// Any error ends the activation and the handler thread running it.
    fn start_process(
        &mut self,
        ctx: &mut StageContext,
        chain: &mut Chain,
        params: &[Value],
    ) -> Result<(), StageError>;

    /// Declares that this stage drives the rest of the work itself.
    ///
    /// Checked after `start_process`, before every record handed to this
    /// stage and around `stop_process`. When set at start, later stages are
    /// never acquired and this stage receives no records. Raised later, it
    /// stops records reaching this stage and ends finalization after it.
    fn blocks_processing(&self) -> bool {
        false
    }

    /// Handles one record.
    ///
    /// # Errors
    ///
    /// Any error ends the activation and the handler thread running it.
    fn process(
        &mut self,
        record: &Record,
        chain: &mut Chain,
        children: &mut ChildBuffers,
        downstream: &mut Emitter<'_>,
        ctx: &mut StageContext,
    ) -> Result<(), StageError>;

    /// Called once after the stream ends. Emitted records still reach the
    /// later stages' `process`.
    ///
    /// # Errors
    ///
    /// Any error ends the activation and the handler thread running it.
    fn stop_process(
        &mut self,
        ctx: &mut StageContext,
        chain: &mut Chain,
        downstream: &mut Emitter<'_>,
        children: &mut ChildBuffers,
    ) -> Result<(), StageError> {
        let _ = (ctx, chain, downstream, children);
        Ok(())
    }
}

/// A stage held by a running pipeline.
pub(crate) struct Slot {
    pub(crate) name: String,
    /// `None` while the stage is being finalized and once it is back in the
    /// pool.
    pub(crate) stage: Option<Box<dyn Stage>>,
}

/// Output handle towards the next stage.
///
/// [`Emitter::emit`] runs the next stage's `process` on the record before it
/// returns, so every record reaches the end of the pipeline before the
/// emitting stage moves on. Nesting is bounded by
/// [`MAX_STAGES`](crate::chain::MAX_STAGES).
///
/// Disconnected past the last forwarding stage; emitting then drops the
/// record.
pub struct Emitter<'a> {
    downstream: &'a mut [Slot],
}

impl<'a> Emitter<'a> {
    /// Forwards into `downstream[0]`, which forwards into `downstream[1]`, and
    /// so on.
    pub(crate) fn new(downstream: &'a mut [Slot]) -> Self {
        Self { downstream }
    }

    #[must_use]
    pub fn disconnected() -> Self {
        Self {
            downstream: Default::default(),
        }
    }

    /// Hands `record` to the next stage and returns once it and every stage
    /// after it are done with it.
    ///
    /// A next stage that blocks processing does not receive the record.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a downstream stage.
    pub fn emit(
        &mut self,
        record: &Record,
        chain: &mut Chain,
        children: &mut ChildBuffers,
        ctx: &mut StageContext,
    ) -> Result<(), StageError> {
        let Some((next, later)) = self.downstream.split_first_mut() else {
            return Ok(());
        };
        let Some(stage) = next.stage.as_mut() else {
            return Ok(());
        };
        if stage.blocks_processing() {
            return Ok(());
        }
        stage.process(record, chain, children, &mut Emitter::new(later), ctx)
    }

    /// Whether a later stage will see emitted records.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.downstream.is_empty()
    }
}

/// Chains produced during an activation, flushed by the handler after every
/// record and once more at the end.
#[derive(Debug, Default)]
pub struct ChildBuffers {
    pub(crate) resolve: Vec<Chain>,
    pub(crate) send: Vec<Chain>,
}

impl ChildBuffers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a chain that still needs a placement decision.
    pub fn resolve(&mut self, chain: Chain) {
        self.resolve.push(chain);
    }

    /// Queues a chain whose destination is already set.
    pub fn send(&mut self, chain: Chain) {
        self.send.push(chain);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resolve.is_empty() && self.send.is_empty()
    }
}

/// Per-handler state shared by every stage the handler runs.
pub struct StageContext {
    partition: PartitionId,
    chain_ids: ChainIdAllocator,
    bucket_ids: BucketIdAllocator,
    transport: Option<Arc<Transport>>,
}

impl StageContext {
    #[must_use]
    pub fn new(
        partition: PartitionId,
        chain_ids: ChainIdAllocator,
        bucket_ids: BucketIdAllocator,
        transport: Option<Arc<Transport>>,
    ) -> Self {
        Self {
            partition,
            chain_ids,
            bucket_ids,
            transport,
        }
    }

    #[must_use]
    pub const fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Creates a child of `parent` with a fresh id and counts it on the parent.
    pub fn new_child(&mut self, parent: &mut Chain) -> Chain {
        parent.spawn_child(self.chain_ids.next_id())
    }

    pub fn next_bucket_id(&mut self) -> u32 {
        self.bucket_ids.next_id()
    }

    /// The node's transport, absent when running detached from a cluster.
    #[must_use]
    pub fn transport(&self) -> Option<&Arc<Transport>> {
        self.transport.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChainId, SubmissionId};

    fn ctx() -> StageContext {
        StageContext::new(
            PartitionId::new(1),
            ChainIdAllocator::from_sequence(0),
            BucketIdAllocator::from_sequence(0),
            None,
        )
    }

    #[test]
    fn new_child_allocates_and_counts() {
        let mut ctx = ctx();
        let mut parent = Chain::new(ChainId::new(7), SubmissionId::new(1), PartitionId::new(0));
        let a = ctx.new_child(&mut parent);
        let b = ctx.new_child(&mut parent);
        assert_eq!(parent.children(), 2);
        assert_eq!(a.id().as_u64(), 1 << 40);
        assert_eq!(b.id().as_u64(), (1 << 40) + 1);
        assert_eq!(b.parent(), Some(ChainId::new(7)));
    }

    /// Appends `tag:value` to a shared log and forwards the record.
    struct Tap {
        tag: &'static str,
        log: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    impl Stage for Tap {
        fn start_process(
            &mut self,
            _ctx: &mut StageContext,
            _chain: &mut Chain,
            _params: &[Value],
        ) -> Result<(), StageError> {
            Ok(())
        }

        fn process(
            &mut self,
            record: &Record,
            chain: &mut Chain,
            children: &mut ChildBuffers,
            downstream: &mut Emitter<'_>,
            ctx: &mut StageContext,
        ) -> Result<(), StageError> {
            self.log.lock().push(format!("{}:{}", self.tag, record[0]));
            downstream.emit(record, chain, children, ctx)
        }
    }

    #[test]
    fn emit_runs_downstream_before_returning() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut slots: Vec<Slot> = ["a", "b"]
            .into_iter()
            .map(|tag| Slot {
                name: tag.to_owned(),
                stage: Some(Box::new(Tap {
                    tag,
                    log: Arc::clone(&log),
                })),
            })
            .collect();
        let mut ctx = ctx();
        let mut chain = Chain::new(ChainId::new(1), SubmissionId::new(1), PartitionId::new(0));
        let mut children = ChildBuffers::new();

        let mut out = Emitter::new(&mut slots);
        assert!(out.is_connected());
        for i in 0..2 {
            let record = Record::from(vec![Value::Int(i)]);
            out.emit(&record, &mut chain, &mut children, &mut ctx).unwrap();
            log.lock().push(format!("emitted:{i}"));
        }

        assert_eq!(
            *log.lock(),
            vec!["a:0", "b:0", "emitted:0", "a:1", "b:1", "emitted:1"]
        );
    }

    #[test]
    fn disconnected_emitter_drops() {
        let mut out = Emitter::disconnected();
        assert!(!out.is_connected());
        let mut chain = Chain::new(ChainId::new(1), SubmissionId::new(1), PartitionId::new(0));
        out.emit(&Record::new(), &mut chain, &mut ChildBuffers::new(), &mut ctx())
            .unwrap();
    }

    #[test]
    fn child_buffers_split_by_route() {
        let mut buffers = ChildBuffers::new();
        assert!(buffers.is_empty());
        let chain = Chain::new(ChainId::new(1), SubmissionId::new(1), PartitionId::new(0));
        buffers.resolve(chain.clone());
        buffers.send(chain);
        assert_eq!(buffers.resolve.len(), 1);
        assert_eq!(buffers.send.len(), 1);
    }
}
