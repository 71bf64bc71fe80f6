//! Serialized execution of work submitted from arbitrary threads.
//!
//! A [`SerialQueue`] runs at most one ticket at a time in one of three modes:
//! - FIFO: strict arrival order, every ticket runs exactly once
//! - latest-wins: waiting latest-mode tickets are superseded by newer ones
//! - deferred: the ticket stays open until its [`Completer`] fires
//!
//! Tickets execute on an injected [`Executor`].
//!
//! # Example
//!
//! ```ignore
//! let queue = SerialQueue::with_config(QueueConfig::default())?;
//!
//! let handle = queue.run_fifo(|| Ok(40 + 2));
//! assert_eq!(handle.wait()?, 42);
//! ```

mod executor;
mod handle;
mod serial;

pub use executor::{Executor, InlineExecutor, Job, ThreadPool};
pub use handle::{Completer, Handle, TicketId};
pub use serial::{QueueConfig, SerialQueue};
