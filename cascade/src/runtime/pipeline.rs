//! Stage fan-out for one activation.
//!
//! Each record is handed to the first forwarding stage; every
//! [`Emitter::emit`] runs the next stage on it before returning. A stage that
//! turns on its block flag mid-stream stops receiving records from then on.

use crate::chain::Chain;
use crate::stage::{ChildBuffers, Emitter, Slot, StageContext, StageError, StagePool};
use crate::value::Record;

#[derive(Default)]
pub(crate) struct Pipeline {
    slots: Vec<Slot>,
    blocked: Option<usize>,
}

impl Pipeline {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Acquires and starts stages in order until one blocks.
    ///
    /// Stages acquired so far stay held on error; call [`Pipeline::release_all`].
    pub(crate) fn start(
        &mut self,
        pool: &StagePool,
        ctx: &mut StageContext,
        chain: &mut Chain,
    ) -> Result<(), StageError> {
        self.slots.clear();
        self.blocked = None;

        for index in 0..chain.stages().len() {
            let spec = chain.stages()[index].clone();
            let mut stage = pool.acquire(spec.name())?;
            let started = stage.start_process(ctx, chain, spec.params());
            let blocks = stage.blocks_processing();
            self.slots.push(Slot {
                name: spec.name().to_owned(),
                stage: Some(stage),
            });
            started?;
            if blocks {
                self.blocked = Some(index);
                break;
            }
        }
        Ok(())
    }

    /// Index of the stage that blocked at start, if any.
    pub(crate) const fn blocked_at(&self) -> Option<usize> {
        self.blocked
    }

    /// Stages below this index receive per-record `process` calls.
    fn forward_limit(&self) -> usize {
        self.blocked.unwrap_or(self.slots.len())
    }

    pub(crate) fn accepts_records(&self) -> bool {
        self.forward_limit() > 0
    }

    /// Pushes one input record through every forwarding stage.
    pub(crate) fn feed(
        &mut self,
        record: &Record,
        chain: &mut Chain,
        children: &mut ChildBuffers,
        ctx: &mut StageContext,
    ) -> Result<(), StageError> {
        let limit = self.forward_limit();
        let Some((first, rest)) = self.slots[..limit].split_first_mut() else {
            return Ok(());
        };
        let Some(stage) = first.stage.as_mut() else {
            return Ok(());
        };
        if stage.blocks_processing() {
            return Ok(());
        }
        stage.process(record, chain, children, &mut Emitter::new(rest), ctx)
    }

    /// Finalizes the started stages in order and releases each right away.
    ///
    /// Records a stage emits while stopping run through the forwarding stages
    /// after it, which are still live. Stops after the first stage whose block
    /// flag is set; the stages left over are released without `stop_process`.
    pub(crate) fn finish(
        &mut self,
        pool: &StagePool,
        chain: &mut Chain,
        children: &mut ChildBuffers,
        ctx: &mut StageContext,
    ) -> Result<(), StageError> {
        let limit = self.forward_limit();

        for index in 0..self.slots.len() {
            let (current, later) = self.slots.split_at_mut(index + 1);
            let slot = &mut current[index];
            let Some(mut stage) = slot.stage.take() else {
                continue;
            };
            let mut out = if stage.blocks_processing() {
                Emitter::disconnected()
            } else {
                Emitter::new(&mut later[..limit.saturating_sub(index + 1)])
            };
            let stopped = stage.stop_process(ctx, chain, &mut out, children);
            let blocks = stage.blocks_processing();
            pool.release(&slot.name, stage);
            stopped?;

            if blocks {
                break;
            }
        }

        self.release_all(pool);
        Ok(())
    }

    /// Returns every stage still held to the pool.
    pub(crate) fn release_all(&mut self, pool: &StagePool) {
        for slot in self.slots.drain(..) {
            if let Some(stage) = slot.stage {
                pool.release(&slot.name, stage);
            }
        }
    }
}
