//! Snapshot broadcasting to acknowledging subscribers.
//!
//! The [`SnapshotBroadcaster`] mirrors a [`RecordStore`](crate::RecordStore)
//! by folding its change events, and republishes the full ordered record set
//! as a [`Snapshot`] after every change. Delivery is flow-controlled:
//! - a subscriber holds at most one unacknowledged snapshot
//! - changes arriving meanwhile collapse into one pending snapshot
//! - `ready()` releases the newest state, never an intermediate one
//!
//! # Example
//!
//! ```ignore
//! let broadcaster = SnapshotBroadcaster::new(queue, BroadcastConfig::default());
//! broadcaster.attach(&store).wait()?;
//!
//! let receiver = broadcaster.subscribe_channel();
//! store.refresh();
//!
//! loop {
//!     let snapshot = receiver.recv()?;
//!     render(&snapshot);
//!     receiver.ready();
//! }
//! ```

mod manager;
mod types;

pub use manager::SnapshotBroadcaster;
pub use types::{
    BroadcastConfig, DeliveryPolicy, Snapshot, SnapshotReceiver, Subscriber, SubscriberId,
};
