//! Chain handler: the worker loop that executes chain pipelines.
//!
//! One activation per dequeued chain:
//! 1. Empty pipeline: go straight to termination.
//! 2. Open an iterator on the chain's input layer. If it is not ready, park
//!    the chain with the notifier and take the next one.
//! 3. Start the stages, stream every record through them, flushing child
//!    chains after each record.
//! 4. Stop the stages, flush once more, release the iterator.
//! 5. Signal termination unless a stage blocked at start, then count the
//!    chain as processed. A block flag raised later only cuts the stream.

use std::sync::Arc;

use minstant::Instant;

use crate::chain::Chain;
use crate::input::RecordIterator;
use crate::stage::{ChildBuffers, StageContext, StageError};
use crate::stats::counters;
use crate::trace::{debug, error, info, warn};
use crate::types::{PartitionId, SubmissionId};

use super::Services;
use super::pipeline::Pipeline;

/// Records-read counters are reported in batches of this size.
pub const RECORDS_REPORT_BATCH: u64 = 10_000;

/// Outcome of one activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// The pipeline ran to completion. `blocked` is set when a stage blocked at
    /// start, in which case no termination record was sent.
    Completed { blocked: bool },
    /// The input was not ready; the chain now waits in the notifier.
    Deferred,
}

pub struct ChainHandler {
    services: Services,
    ctx: StageContext,
    pipeline: Pipeline,
    children: ChildBuffers,
}

impl ChainHandler {
    #[must_use]
    pub fn new(services: Services, ctx: StageContext) -> Self {
        Self {
            services,
            ctx,
            pipeline: Pipeline::new(),
            children: ChildBuffers::new(),
        }
    }

    /// Processes chains until the process queue is closed and drained.
    ///
    /// A stage error is logged and ends the loop; chains still queued are left
    /// to the other handlers.
    pub fn run(&mut self) {
        info!(partition = %self.ctx.partition(), "chain handler started");
        while let Some(chain) = self.services.process_queue.pop() {
            let id = chain.id();
            let started = Instant::now();
            match self.process(chain) {
                Ok(Activation::Completed { blocked }) => {
                    debug!(
                        chain = %id,
                        blocked,
                        elapsed_us = started.elapsed().as_micros() as u64,
                        "chain processed"
                    );
                }
                Ok(Activation::Deferred) => {
                    debug!(chain = %id, "input not ready, chain parked");
                }
                Err(e) => {
                    error!(chain = %id, error = %e, "stage failed, stopping chain handler");
                    return;
                }
            }
        }
        info!(partition = %self.ctx.partition(), "chain handler exiting");
    }

    /// Runs one activation of `chain`.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a stage, the input layer or the
    /// stage pool. No termination record is sent for a failed chain.
    pub fn process(&mut self, mut chain: Chain) -> Result<Activation, StageError> {
        let mut blocked = false;

        if !chain.stages().is_empty() {
            let layer = self.services.inputs.get(chain.input_layer())?;
            let mut iterator = layer.iterator(chain.input(), &self.ctx)?;
            if !iterator.is_ready() {
                self.services.notifier.park(layer, iterator, chain);
                return Ok(Activation::Deferred);
            }

            let result = self.execute(&mut chain, iterator.as_mut());
            layer.release_iterator(iterator);
            if result.is_err() {
                self.pipeline.release_all(&self.services.stages);
                self.children.resolve.clear();
                self.children.send.clear();
            }
            blocked = result?;
        }

        if !blocked {
            self.services.outbound.signal_chain_terminated(&chain);
        }
        self.services.stats.add_counter(
            chain.submission_node(),
            chain.submission(),
            counters::CHAINS_PROCESSED,
            1,
        );
        Ok(Activation::Completed { blocked })
    }

    /// Start, stream and stop. Returns whether a stage blocked at start.
    fn execute(
        &mut self,
        chain: &mut Chain,
        iterator: &mut dyn RecordIterator,
    ) -> Result<bool, StageError> {
        let stages = Arc::clone(&self.services.stages);
        self.pipeline.start(&stages, &mut self.ctx, chain)?;
        let blocked = self.pipeline.blocked_at().is_some();

        let mut records = 0u64;
        if !chain.exclude_execution() && self.pipeline.accepts_records() {
            while iterator.advance()? {
                self.pipeline
                    .feed(iterator.current(), chain, &mut self.children, &mut self.ctx)?;
                records += 1;
                if records == RECORDS_REPORT_BATCH {
                    self.report_records(chain, records);
                    records = 0;
                }
                self.flush(chain);
            }
        }
        if records > 0 {
            self.report_records(chain, records);
        }

        self.pipeline
            .finish(&stages, chain, &mut self.children, &mut self.ctx)?;
        self.flush(chain);
        Ok(blocked)
    }

    fn report_records(&self, chain: &Chain, records: u64) {
        self.count(
            chain.submission_node(),
            chain.submission(),
            &counters::records_input(chain.input_layer()),
            records as i64,
        );
    }

    /// Moves buffered children out: first to the resolve queue, then to the
    /// transport.
    fn flush(&mut self, chain: &Chain) {
        let node = chain.submission_node();
        let submission = chain.submission();

        let resolved = self.children.resolve.len();
        if resolved > 0 {
            self.count(node, submission, counters::CHAINS_FROM_CHAINS, resolved as i64);
            if self
                .services
                .resolve_queue
                .push_all(&mut self.children.resolve)
                .is_err()
            {
                warn!(
                    chain = %chain.id(),
                    dropped = self.children.resolve.len(),
                    "resolve queue closed, dropping child chains"
                );
                self.children.resolve.clear();
            }
        }

        let sent = self.children.send.len();
        if sent > 0 {
            self.count(
                node,
                submission,
                counters::CHAINS_FROM_CHAINS_TO_PROCESS,
                sent as i64,
            );
            self.services.outbound.send_chains(&mut self.children.send);
        }
    }

    fn count(&self, node: PartitionId, submission: SubmissionId, name: &str, delta: i64) {
        self.services.stats.add_counter(node, submission, name, delta);
    }

    #[must_use]
    pub const fn context(&self) -> &StageContext {
        &self.ctx
    }
}

/// Name of the thread running handler `index`.
#[must_use]
pub fn thread_name(index: usize) -> String {
    format!("chain-handler-{index}")
}
