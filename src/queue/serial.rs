//! Single-flight scheduler for work submitted from arbitrary threads.

use crate::error::{Result, StoreError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::executor::{Executor, ThreadPool};
use super::handle::{Completer, Handle, ReleaseHold, Slot, TicketId};

/// Queue configuration.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Queue name, also the worker thread name prefix.
    /// Default: "recordcast"
    pub name: String,

    /// Worker threads in the pool built by [`SerialQueue::with_config`].
    /// A single queue never uses more than one at a time. Zero is rejected.
    /// Default: 1
    pub worker_threads: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "recordcast".to_string(),
            worker_threads: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Fifo,
    Latest,
    Deferred,
}

/// Queue-side ticket state. Done and canceled tickets leave the queue; their
/// outcome lives on in the caller's [`Handle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TicketState {
    Pending,
    Running,
}

/// Type-erased work owned by a ticket.
trait Runnable: Send {
    fn run(self: Box<Self>, release: Release);
    fn cancel(self: Box<Self>, reason: StoreError);
}

struct Ticket {
    id: TicketId,
    mode: Mode,
    state: TicketState,
    task: Option<Box<dyn Runnable>>,
}

struct QueueState {
    /// Head is always running once it is at the front.
    tickets: VecDeque<Ticket>,
    closed: bool,
}

struct QueueInner {
    name: String,
    executor: Arc<dyn Executor>,
    state: Mutex<QueueState>,
    next_ticket: AtomicU64,
}

/// Drop guard held while a ticket runs; releasing it retires the head and
/// starts the next ticket.
pub(crate) struct Release {
    queue: Arc<QueueInner>,
    ticket: TicketId,
}

impl Drop for Release {
    fn drop(&mut self) {
        self.queue.finish(self.ticket);
    }
}

impl QueueInner {
    /// Mark the head running and take its task, unless it already runs.
    fn start_head(state: &mut QueueState) -> Option<(TicketId, Box<dyn Runnable>)> {
        let head = state.tickets.front_mut()?;
        if head.state == TicketState::Running {
            return None;
        }
        head.state = TicketState::Running;
        head.task.take().map(|task| (head.id, task))
    }

    fn dispatch(self: &Arc<Self>, ticket: TicketId, task: Box<dyn Runnable>) {
        tracing::trace!(queue = %self.name, ticket = ticket.0, "ticket started");
        let release = Release {
            queue: Arc::clone(self),
            ticket,
        };
        self.executor.execute(Box::new(move || task.run(release)));
    }

    fn finish(self: &Arc<Self>, ticket: TicketId) {
        let next = {
            let mut state = self.state.lock();
            match state.tickets.front() {
                Some(head) if head.id == ticket => {
                    state.tickets.pop_front();
                }
                _ => {
                    tracing::warn!(queue = %self.name, ticket = ticket.0, "finished ticket is not the head");
                }
            }
            Self::start_head(&mut state)
        };
        tracing::trace!(queue = %self.name, ticket = ticket.0, "ticket done");

        if let Some((id, task)) = next {
            self.dispatch(id, task);
        }
    }
}

/// Mutual-exclusion scheduler: at most one work unit of a queue executes at
/// any time, whatever thread submitted it.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct SerialQueue {
    inner: Arc<QueueInner>,
}

impl SerialQueue {
    /// A queue running its tickets on `executor`.
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self::named(QueueConfig::default().name, executor)
    }

    pub fn named(name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                executor,
                state: Mutex::new(QueueState {
                    tickets: VecDeque::new(),
                    closed: false,
                }),
                next_ticket: AtomicU64::new(1),
            }),
        }
    }

    /// A queue backed by its own [`ThreadPool`].
    pub fn with_config(config: QueueConfig) -> Result<Self> {
        let pool = ThreadPool::new(&config)?;
        Ok(Self::named(config.name, Arc::new(pool)))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Run `work` after every ticket submitted before it, in arrival order.
    pub fn run_fifo<T, F>(&self, work: F) -> Handle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.submit_task(Mode::Fifo, work)
    }

    /// Like [`run_fifo`](Self::run_fifo), but supersedes every latest-mode
    /// ticket still waiting behind the running head. Superseded tickets
    /// resolve with [`StoreError::Superseded`] without running their work.
    pub fn run_latest<T, F>(&self, work: F) -> Handle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.submit_task(Mode::Latest, work)
    }

    /// Run `work` in FIFO order, but keep the ticket open until the
    /// [`Completer`] it receives is completed or dropped. Lets callback-style
    /// operations finish on another thread while still holding the queue.
    pub fn run_deferred<T, F>(&self, work: F) -> Handle<T>
    where
        T: Send + 'static,
        F: FnOnce(Completer<T>) + Send + 'static,
    {
        let slot = Arc::new(Slot::new());
        let task = DeferredTask {
            work: Some(work),
            slot: Arc::clone(&slot),
        };
        let ticket = self.submit(Mode::Deferred, Box::new(task));
        Handle::new(ticket, slot)
    }

    /// Block until every ticket submitted so far has finished.
    ///
    /// Must not be called from inside a work unit of this queue.
    pub fn flush(&self) -> Result<()> {
        self.run_fifo(|| Ok(())).wait()
    }

    /// Refuse new submissions. Tickets already queued still run.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        tracing::debug!(queue = %self.inner.name, "queue closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Tickets currently queued, including the running head.
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().tickets.len()
    }

    fn submit_task<T, F>(&self, mode: Mode, work: F) -> Handle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let slot = Arc::new(Slot::new());
        let task = Task {
            work: Some(work),
            slot: Arc::clone(&slot),
        };
        let ticket = self.submit(mode, Box::new(task));
        Handle::new(ticket, slot)
    }

    fn submit(&self, mode: Mode, task: Box<dyn Runnable>) -> TicketId {
        let id = TicketId(self.inner.next_ticket.fetch_add(1, Ordering::SeqCst));
        let mut superseded = Vec::new();

        let start = {
            let mut state = self.inner.state.lock();
            if state.closed {
                drop(state);
                tracing::debug!(queue = %self.inner.name, ticket = id.0, "rejected by closed queue");
                task.cancel(StoreError::Closed);
                return id;
            }

            if mode == Mode::Latest && state.tickets.len() > 1 {
                let waiting = state.tickets.split_off(1);
                for ticket in waiting {
                    if ticket.mode == Mode::Latest && ticket.state == TicketState::Pending {
                        superseded.push(ticket);
                    } else {
                        state.tickets.push_back(ticket);
                    }
                }
            }

            state.tickets.push_back(Ticket {
                id,
                mode,
                state: TicketState::Pending,
                task: Some(task),
            });
            QueueInner::start_head(&mut state)
        };

        for ticket in superseded {
            tracing::debug!(queue = %self.inner.name, ticket = ticket.id.0, by = id.0, "ticket superseded");
            if let Some(task) = ticket.task {
                task.cancel(StoreError::Superseded);
            }
        }

        if let Some((head, task)) = start {
            self.inner.dispatch(head, task);
        }
        id
    }
}

impl fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialQueue")
            .field("name", &self.inner.name)
            .field("pending", &self.pending_len())
            .finish()
    }
}

/// Ordinary work: resolves when the closure returns.
struct Task<T, F> {
    work: Option<F>,
    slot: Arc<Slot<T>>,
}

impl<T, F> Runnable for Task<T, F>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    fn run(mut self: Box<Self>, release: Release) {
        if let Some(work) = self.work.take() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(work))
                .unwrap_or_else(|payload| Err(StoreError::from_panic(&*payload)));
            if let Err(err) = &outcome {
                tracing::debug!(ticket = release.ticket.0, error = %err, "ticket failed");
            }
            self.slot.resolve(outcome);
        }
        drop(release);
    }

    fn cancel(self: Box<Self>, reason: StoreError) {
        self.slot.resolve(Err(reason));
    }
}

impl<T, F> Drop for Task<T, F> {
    fn drop(&mut self) {
        // Only reached unresolved when an executor dropped the job.
        self.slot.resolve(Err(StoreError::Abandoned));
    }
}

/// Completer-driven work: resolves when the completer says so.
struct DeferredTask<T, F> {
    work: Option<F>,
    slot: Arc<Slot<T>>,
}

impl<T, F> Runnable for DeferredTask<T, F>
where
    T: Send + 'static,
    F: FnOnce(Completer<T>) + Send + 'static,
{
    fn run(mut self: Box<Self>, release: Release) {
        if let Some(work) = self.work.take() {
            let hold = Arc::new(Mutex::new(ReleaseHold {
                armed: true,
                release: None,
            }));
            let completer = Completer::new(Arc::clone(&self.slot), release, Arc::clone(&hold));
            let outcome = panic::catch_unwind(AssertUnwindSafe(move || work(completer)));

            let parked = {
                let mut hold = hold.lock();
                hold.armed = false;
                hold.release.take()
            };
            match outcome {
                Err(payload) => {
                    self.slot.resolve(Err(StoreError::from_panic(&*payload)));
                }
                // The completer unwound on another thread while the work was
                // still running here.
                Ok(()) if parked.is_some() => {
                    self.slot.resolve(Err(StoreError::Panicked(
                        "deferred completer dropped during a panic".into(),
                    )));
                }
                Ok(()) => {}
            }
            drop(parked);
        }
    }

    fn cancel(self: Box<Self>, reason: StoreError) {
        self.slot.resolve(Err(reason));
    }
}

impl<T, F> Drop for DeferredTask<T, F> {
    fn drop(&mut self) {
        self.slot.resolve(Err(StoreError::Abandoned));
    }
}
