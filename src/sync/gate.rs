//! One-shot latch shared between threads.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;

struct GateInner {
    open: Mutex<bool>,
    opened: Condvar,
}

/// A one-shot binary latch.
///
/// Created closed; the first [`open`](Gate::open) releases every current and
/// future [`block`](Gate::block) call. There is no way to close it again.
/// Clones share the same latch.
#[derive(Clone)]
pub struct Gate {
    inner: Arc<GateInner>,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GateInner {
                open: Mutex::new(false),
                opened: Condvar::new(),
            }),
        }
    }

    /// Open the gate. Idempotent, callable from any thread.
    pub fn open(&self) {
        let mut open = self.inner.open.lock();
        if !*open {
            *open = true;
            self.inner.opened.notify_all();
        }
    }

    /// Block until the gate has been opened, including by an `open` that
    /// happened before this call.
    pub fn block(&self) {
        let mut open = self.inner.open.lock();
        while !*open {
            self.inner.opened.wait(&mut open);
        }
    }

    /// Non-blocking query.
    pub fn is_ready(&self) -> bool {
        *self.inner.open.lock()
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate").field("ready", &self.is_ready()).finish()
    }
}
