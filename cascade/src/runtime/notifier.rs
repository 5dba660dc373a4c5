//! Parking for chains whose input iterator is not ready.
//!
//! Handler threads never wait on input. A chain whose iterator reports
//! not-ready is handed over here together with the iterator; the
//! `chain-notifier` thread polls the iterators and puts the chain back on the
//! process queue once its data is available.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::chain::Chain;
use crate::input::{InputLayer, RecordIterator};
use crate::sync::BoundedQueue;
use crate::trace::{debug, trace, warn};

/// Pause between two polls of the parked iterators.
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

struct Waiter {
    layer: Arc<dyn InputLayer>,
    iterator: Box<dyn RecordIterator>,
    chain: Chain,
}

pub struct ChainNotifier {
    waiters: Mutex<Vec<Waiter>>,
    process_queue: Arc<BoundedQueue<Chain>>,
}

impl ChainNotifier {
    #[must_use]
    pub fn new(process_queue: Arc<BoundedQueue<Chain>>) -> Self {
        Self {
            waiters: Mutex::new(Vec::new()),
            process_queue,
        }
    }

    /// Parks `chain` until `iterator` is ready.
    pub fn park(
        &self,
        layer: Arc<dyn InputLayer>,
        iterator: Box<dyn RecordIterator>,
        chain: Chain,
    ) {
        trace!(chain = %chain.id(), "parking chain");
        self.waiters.lock().push(Waiter {
            layer,
            iterator,
            chain,
        });
    }

    /// Number of parked chains.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Requeues every chain whose iterator became ready.
    ///
    /// The iterator goes back to its layer; the next activation opens a fresh
    /// one. Returns the number of chains requeued.
    pub fn poll_once(&self) -> usize {
        let ready: Vec<Waiter> = {
            let mut waiters = self.waiters.lock();
            let (ready, waiting) = std::mem::take(&mut *waiters)
                .into_iter()
                .partition(|w| w.iterator.is_ready());
            *waiters = waiting;
            ready
        };

        let count = ready.len();
        for waiter in ready {
            waiter.layer.release_iterator(waiter.iterator);
            let id = waiter.chain.id();
            if self.process_queue.push(waiter.chain).is_err() {
                warn!(chain = %id, "process queue closed, dropping parked chain");
            } else {
                trace!(chain = %id, "input ready, chain requeued");
            }
        }
        count
    }

    /// Starts the `chain-notifier` thread, polling until `shutdown` is set.
    ///
    /// # Panics
    ///
    /// Panics if thread spawning fails.
    pub fn spawn(self: &Arc<Self>, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
        let notifier = Arc::clone(self);
        thread::Builder::new()
            .name("chain-notifier".into())
            .spawn(move || {
                debug!("chain notifier started");
                while !shutdown.load(Ordering::Relaxed) {
                    if notifier.poll_once() == 0 {
                        thread::sleep(POLL_INTERVAL);
                    }
                }
                debug!(parked = notifier.waiting(), "chain notifier exiting");
            })
            .expect("failed to spawn chain notifier thread")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::MemoryLayer;
    use crate::stage::StageError;
    use crate::types::{ChainId, PartitionId, SubmissionId};
    use crate::value::Record;
    use std::sync::atomic::AtomicUsize;

    /// Not ready until the flag flips.
    struct Gate {
        open: Arc<AtomicBool>,
        record: Record,
    }

    impl RecordIterator for Gate {
        fn is_ready(&self) -> bool {
            self.open.load(Ordering::Acquire)
        }

        fn advance(&mut self) -> Result<bool, StageError> {
            Ok(false)
        }

        fn current(&self) -> &Record {
            &self.record
        }
    }

    struct CountingLayer {
        released: AtomicUsize,
    }

    impl InputLayer for CountingLayer {
        fn iterator(
            &self,
            _query: &Record,
            _ctx: &crate::stage::StageContext,
        ) -> Result<Box<dyn RecordIterator>, StageError> {
            unreachable!("not opened in these tests")
        }

        fn release_iterator(&self, _iterator: Box<dyn RecordIterator>) {
            self.released.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn chain(id: u64) -> Chain {
        Chain::new(ChainId::new(id), SubmissionId::new(1), PartitionId::new(0))
    }

    #[test]
    fn requeues_only_ready_chains() {
        let queue = Arc::new(BoundedQueue::new(8));
        let notifier = ChainNotifier::new(Arc::clone(&queue));
        let layer = Arc::new(CountingLayer {
            released: AtomicUsize::new(0),
        });
        let open = Arc::new(AtomicBool::new(false));

        notifier.park(
            layer.clone(),
            Box::new(Gate {
                open: Arc::clone(&open),
                record: Record::new(),
            }),
            chain(1),
        );
        notifier.park(
            layer.clone(),
            Box::new(Gate {
                open: Arc::new(AtomicBool::new(false)),
                record: Record::new(),
            }),
            chain(2),
        );

        assert_eq!(notifier.poll_once(), 0);
        assert!(queue.is_empty());

        open.store(true, Ordering::Release);
        assert_eq!(notifier.poll_once(), 1);
        assert_eq!(queue.try_pop().map(|c| c.id()), Some(ChainId::new(1)));
        assert_eq!(notifier.waiting(), 1);
        assert_eq!(layer.released.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn thread_requeues_in_background() {
        let queue = Arc::new(BoundedQueue::new(8));
        let notifier = Arc::new(ChainNotifier::new(Arc::clone(&queue)));
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = notifier.spawn(Arc::clone(&shutdown));

        let layer: Arc<dyn InputLayer> = Arc::new(MemoryLayer::new(vec![]));
        let open = Arc::new(AtomicBool::new(false));
        notifier.park(
            layer,
            Box::new(Gate {
                open: Arc::clone(&open),
                record: Record::new(),
            }),
            chain(3),
        );
        open.store(true, Ordering::Release);

        let requeued = queue.pop_blocking(crate::sync::Timeout::Duration(Duration::from_secs(5)));
        assert_eq!(requeued.map(|c| c.id()), Some(ChainId::new(3)));

        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
