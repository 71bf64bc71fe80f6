//! Snapshot subscription types.

use crate::queue::Handle;
use crossbeam_channel::Sender;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use super::manager::SnapshotBroadcaster;
use crate::types::Record;

/// How the broadcaster paces deliveries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// One acknowledgment round for everybody: no new snapshot goes out
    /// until every subscriber acknowledged the previous one.
    #[default]
    Lockstep,
    /// Each subscriber is paced alone: an acknowledged subscriber receives
    /// new snapshots at once, a busy one catches up on `ready`.
    Independent,
}

/// Broadcaster configuration.
#[derive(Clone, Debug, Default)]
pub struct BroadcastConfig {
    /// Default: `DeliveryPolicy::Lockstep`
    pub policy: DeliveryPolicy,
}

/// Immutable ordered view of every record at one point in time.
///
/// Versions grow by one per folded change, so a higher version is always
/// the newer state.
#[derive(Clone, Debug)]
pub struct Snapshot<R> {
    version: u64,
    records: Arc<[R]>,
}

impl<R> Snapshot<R> {
    pub(crate) fn new(version: u64, records: Vec<R>) -> Self {
        Self {
            version,
            records: Arc::from(records),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn records(&self) -> &Arc<[R]> {
        &self.records
    }
}

impl<R> Deref for Snapshot<R> {
    type Target = [R];

    fn deref(&self) -> &[R] {
        &self.records
    }
}

/// Unique identifier for a subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(pub u64);

/// Consumer of snapshots.
///
/// `receive` runs on the broadcaster's queue worker. After consuming a
/// snapshot the owner must call [`SnapshotBroadcaster::ready`], or nothing
/// more is ever delivered to it. Calling `ready` from inside `receive` is
/// allowed.
pub trait Subscriber<R>: Send + Sync {
    fn receive(&self, snapshot: Snapshot<R>);
}

impl<R, F> Subscriber<R> for F
where
    F: Fn(Snapshot<R>) + Send + Sync,
{
    fn receive(&self, snapshot: Snapshot<R>) {
        self(snapshot)
    }
}

/// Forwards snapshots into a channel.
pub(crate) struct ChannelSubscriber<R> {
    pub(crate) sender: Sender<Snapshot<R>>,
}

impl<R: Send + Sync> Subscriber<R> for ChannelSubscriber<R> {
    fn receive(&self, snapshot: Snapshot<R>) {
        if self.sender.send(snapshot).is_err() {
            tracing::trace!("snapshot receiver is gone");
        }
    }
}

/// Channel-backed subscription.
///
/// Dropping the receiver unsubscribes it, so an abandoned receiver never
/// holds back other subscribers.
pub struct SnapshotReceiver<R: Record> {
    id: SubscriberId,
    receiver: crossbeam_channel::Receiver<Snapshot<R>>,
    broadcaster: SnapshotBroadcaster<R>,
    detached: bool,
}

impl<R: Record> SnapshotReceiver<R> {
    pub(crate) fn new(
        id: SubscriberId,
        receiver: crossbeam_channel::Receiver<Snapshot<R>>,
        broadcaster: SnapshotBroadcaster<R>,
    ) -> Self {
        Self {
            id,
            receiver,
            broadcaster,
            detached: false,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Receive the next snapshot (blocking).
    pub fn recv(&self) -> Result<Snapshot<R>, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a snapshot (non-blocking).
    pub fn try_recv(&self) -> Result<Snapshot<R>, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Snapshot<R>, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Acknowledge the last received snapshot.
    pub fn ready(&self) {
        let _ = self.broadcaster.ready(self.id);
    }

    pub fn unsubscribe(mut self) -> Handle<bool> {
        self.detached = true;
        self.broadcaster.unsubscribe(self.id)
    }
}

impl<R: Record> Drop for SnapshotReceiver<R> {
    fn drop(&mut self) {
        if !self.detached {
            let _ = self.broadcaster.unsubscribe(self.id);
        }
    }
}
