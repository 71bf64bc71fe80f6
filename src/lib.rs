//! # Record Cast
//!
//! A reactive record store: CRUD operations from any thread are serialized
//! against a durable repository, mirrored in memory, and republished to
//! subscribers as coalesced, acknowledgment-paced snapshots.
//!
//! ## Core Concepts
//!
//! - **Gate**: one-shot cross-thread latch
//! - **SerialQueue**: runs one ticket at a time in FIFO, latest-wins or
//!   deferred-completion mode
//! - **RecordStore**: the authoritative record set, persisted through a
//!   [`Repository`] and announced to [`Listener`]s
//! - **SnapshotBroadcaster**: folds store changes into ordered snapshots and
//!   paces delivery with `ready()` acknowledgments
//!
//! ## Example
//!
//! ```ignore
//! use recordcast::{
//!     BroadcastConfig, Entry, MemoryRepository, QueueConfig, RecordStore, SnapshotBroadcaster,
//! };
//! use std::sync::Arc;
//!
//! let store = RecordStore::open(Arc::new(MemoryRepository::new()), QueueConfig::default())?;
//! let broadcaster = SnapshotBroadcaster::new(store.queue().clone(), BroadcastConfig::default());
//! broadcaster.attach(&store).wait()?;
//!
//! let receiver = broadcaster.subscribe_channel();
//! store.refresh().wait()?;
//! store.insert(Entry::new("hello".to_string())).wait()?;
//!
//! let snapshot = receiver.recv()?;
//! receiver.ready();
//! ```

pub mod error;
pub mod listener;
pub mod queue;
pub mod repository;
pub mod store;
pub mod subscriptions;
pub mod sync;
pub mod types;

// Re-exports
pub use error::{Result, StoreError};
pub use listener::{Change, FnListener, Listener, ListenerId};
pub use queue::{
    Completer, Executor, Handle, InlineExecutor, Job, QueueConfig, SerialQueue, ThreadPool,
    TicketId,
};
pub use repository::{MemoryRepository, Repository};
pub use store::RecordStore;
pub use subscriptions::{
    BroadcastConfig, DeliveryPolicy, Snapshot, SnapshotBroadcaster, SnapshotReceiver, Subscriber,
    SubscriberId,
};
pub use sync::Gate;
pub use types::*;
