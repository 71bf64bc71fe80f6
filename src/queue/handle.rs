//! Caller-side views of a queued ticket.

use crate::error::{Result, StoreError};
use crate::sync::Gate;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::thread;

use super::serial::Release;

/// Identifier of a ticket within its queue, assigned in arrival order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TicketId(pub u64);

impl fmt::Debug for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ticket({})", self.0)
    }
}

/// Result cell of one ticket. Resolved at most once.
pub(crate) struct Slot<T> {
    value: Mutex<Option<Result<T>>>,
    done: Gate,
}

impl<T> Slot<T> {
    pub(crate) fn new() -> Self {
        Self {
            value: Mutex::new(None),
            done: Gate::new(),
        }
    }

    /// Store the outcome. Returns false if the slot was already resolved.
    pub(crate) fn resolve(&self, outcome: Result<T>) -> bool {
        let mut value = self.value.lock();
        if self.done.is_ready() {
            return false;
        }
        *value = Some(outcome);
        self.done.open();
        true
    }
}

/// Handle to the eventual outcome of a queued work unit.
///
/// Submitting never blocks; [`wait`](Handle::wait) is the synchronous
/// wrapper. Waiting on a handle from inside a work unit of the same queue
/// deadlocks, since that ticket can only start after the current one ends.
#[must_use = "dropping a handle discards the outcome but does not cancel the work"]
pub struct Handle<T> {
    ticket: TicketId,
    slot: Arc<Slot<T>>,
}

impl<T> Handle<T> {
    pub(crate) fn new(ticket: TicketId, slot: Arc<Slot<T>>) -> Self {
        Self { ticket, slot }
    }

    pub fn ticket(&self) -> TicketId {
        self.ticket
    }

    /// True once the ticket ran, failed, or was canceled.
    pub fn is_done(&self) -> bool {
        self.slot.done.is_ready()
    }

    /// Block until the ticket resolves and return its outcome.
    pub fn wait(self) -> Result<T> {
        self.slot.done.block();
        self.slot
            .value
            .lock()
            .take()
            .unwrap_or(Err(StoreError::Abandoned))
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("ticket", &self.ticket)
            .field("done", &self.is_done())
            .finish()
    }
}

/// Where a completer unwinding out of its deferred work parks the queue
/// release, so the ticket records the real panic before the next one starts.
pub(crate) struct ReleaseHold {
    /// Set while the deferred work is still executing.
    pub(crate) armed: bool,
    pub(crate) release: Option<Release>,
}

/// Finishes a deferred ticket.
///
/// Handed to the work of [`SerialQueue::run_deferred`](super::SerialQueue::run_deferred).
/// The queue stays blocked on this ticket until the completer is completed
/// or dropped, from whichever thread owns it by then. Dropping it without
/// completing resolves the ticket with [`StoreError::Abandoned`].
pub struct Completer<T> {
    slot: Arc<Slot<T>>,
    release: Option<Release>,
    hold: Arc<Mutex<ReleaseHold>>,
}

impl<T> Completer<T> {
    pub(crate) fn new(
        slot: Arc<Slot<T>>,
        release: Release,
        hold: Arc<Mutex<ReleaseHold>>,
    ) -> Self {
        Self {
            slot,
            release: Some(release),
            hold,
        }
    }

    pub fn complete(self, outcome: Result<T>) {
        self.slot.resolve(outcome);
    }

    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn fail(self, error: StoreError) {
        self.complete(Err(error));
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if thread::panicking() {
            let mut hold = self.hold.lock();
            if hold.armed {
                hold.release = self.release.take();
                return;
            }
        }
        // Runs before `release` drops, so the handle resolves before the
        // next ticket is started.
        let error = if thread::panicking() {
            StoreError::Panicked("deferred completer dropped during a panic".into())
        } else {
            StoreError::Abandoned
        };
        self.slot.resolve(Err(error));
    }
}
