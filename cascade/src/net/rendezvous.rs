//! Counting rendezvous for collective operations.
//!
//! The initiator opens a [`Ticket`] expecting `n` replies, sends its requests
//! tagged with the ticket's [`OpId`] and blocks in [`Ticket::wait`]. The rx
//! thread feeds replies in through [`RendezvousTable::resolve`]. Each table
//! serves one operation kind, so a reply is matched on (kind, id).
//!
//! There is no timeout: a peer that never answers stalls the initiator.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Condvar, Mutex};

use super::protocol::OpId;

struct Pending<T> {
    state: Mutex<PendingState<T>>,
    done: Condvar,
}

struct PendingState<T> {
    remaining: usize,
    replies: Vec<T>,
}

pub(crate) struct RendezvousTable<T> {
    kind: &'static str,
    next_id: AtomicU32,
    pending: Mutex<HashMap<OpId, Arc<Pending<T>>>>,
}

impl<T> RendezvousTable<T> {
    pub(crate) fn new(kind: &'static str) -> Self {
        Self {
            kind,
            next_id: AtomicU32::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) const fn kind(&self) -> &'static str {
        self.kind
    }

    /// Registers a new operation expecting `expected` replies.
    pub(crate) fn open(&self, expected: usize) -> Ticket<'_, T> {
        let id = OpId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let pending = Arc::new(Pending {
            state: Mutex::new(PendingState {
                remaining: expected,
                replies: Vec::with_capacity(expected),
            }),
            done: Condvar::new(),
        });
        self.pending.lock().insert(id, Arc::clone(&pending));
        Ticket {
            table: self,
            id,
            pending,
        }
    }

    /// Counts one reply against operation `id`.
    ///
    /// Returns `false` if no such operation is outstanding or it already has
    /// every reply it expects; the reply is then discarded.
    pub(crate) fn resolve(&self, id: OpId, reply: T) -> bool {
        let Some(pending) = self.pending.lock().get(&id).cloned() else {
            return false;
        };
        let mut state = pending.state.lock();
        if state.remaining == 0 {
            return false;
        }
        state.replies.push(reply);
        state.remaining -= 1;
        if state.remaining == 0 {
            pending.done.notify_all();
        }
        true
    }

    /// Number of operations still registered.
    pub(crate) fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }
}

/// An open operation. Dropping it deregisters the operation.
pub(crate) struct Ticket<'a, T> {
    table: &'a RendezvousTable<T>,
    id: OpId,
    pending: Arc<Pending<T>>,
}

impl<T> Ticket<'_, T> {
    pub(crate) const fn id(&self) -> OpId {
        self.id
    }

    /// Blocks until every expected reply arrived, then returns them in
    /// arrival order.
    pub(crate) fn wait(self) -> Vec<T> {
        let mut state = self.pending.state.lock();
        while state.remaining > 0 {
            self.pending.done.wait(&mut state);
        }
        std::mem::take(&mut state.replies)
    }
}

impl<T> Drop for Ticket<'_, T> {
    fn drop(&mut self) {
        self.table.pending.lock().remove(&self.id);
    }
}
