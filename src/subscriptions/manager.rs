//! Snapshot broadcaster folding store changes into flow-controlled deliveries.

use crate::error::{Result, StoreError};
use crate::listener::{Change, FnListener, ListenerId};
use crate::queue::{Handle, SerialQueue};
use crate::store::RecordStore;
use crate::sync::Gate;
use crate::types::{creation_order, Record, RecordId};
use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::types::{
    BroadcastConfig, ChannelSubscriber, DeliveryPolicy, Snapshot, SnapshotReceiver, Subscriber,
    SubscriberId,
};

type OrderFn<R> = dyn Fn(&R, &R) -> CmpOrdering + Send + Sync;

/// Internal subscriber state.
struct SubscriberState<R> {
    sink: Arc<dyn Subscriber<R>>,
    /// Whether the last delivered snapshot was acknowledged.
    acked: bool,
    /// Version of the last delivered snapshot (0 = none yet).
    seen: u64,
}

/// One snapshot on its way to one subscriber.
struct Delivery<R> {
    id: SubscriberId,
    sink: Arc<dyn Subscriber<R>>,
    snapshot: Snapshot<R>,
}

struct BroadcastState<R> {
    /// Record set as reconstructed from folded changes.
    mirror: HashMap<RecordId, R>,
    /// Ordered by id so dispatch order is stable.
    subscribers: BTreeMap<SubscriberId, SubscriberState<R>>,
    latest: Option<Snapshot<R>>,
    /// Newest snapshot built while a lockstep round was still open.
    pending: Option<Snapshot<R>>,
    version: u64,
}

impl<R: Record> BroadcastState<R> {
    fn fold(&mut self, change: Change<R>) {
        match change {
            Change::Inserted(item) | Change::Updated(item) => {
                self.mirror.insert(item.id(), item);
            }
            Change::InsertedMany(items) | Change::UpdatedMany(items) => {
                for item in items.iter() {
                    self.mirror.insert(item.id(), item.clone());
                }
            }
            Change::Removed(item) => {
                self.mirror.remove(&item.id());
            }
            Change::RemovedMany(items) => {
                for item in items.iter() {
                    self.mirror.remove(&item.id());
                }
            }
            Change::AllChanged(items) => {
                self.mirror = items.iter().map(|item| (item.id(), item.clone())).collect();
            }
        }
    }

    fn unacked(&self) -> usize {
        self.subscribers.values().filter(|sub| !sub.acked).count()
    }

    /// Hand `snapshot` to every subscriber matching `filter`, marking each
    /// of them as waiting for acknowledgment.
    fn dispatch(
        &mut self,
        snapshot: &Snapshot<R>,
        filter: impl Fn(SubscriberId, &SubscriberState<R>) -> bool,
    ) -> Vec<Delivery<R>> {
        let mut deliveries = Vec::new();
        for (id, sub) in self.subscribers.iter_mut() {
            if !filter(*id, sub) {
                continue;
            }
            sub.acked = false;
            sub.seen = snapshot.version();
            deliveries.push(Delivery {
                id: *id,
                sink: Arc::clone(&sub.sink),
                snapshot: snapshot.clone(),
            });
        }
        deliveries
    }

    /// Called when a lockstep round closes: send the pending snapshot to
    /// everyone, or catch up subscribers that joined mid-round.
    fn close_round(&mut self) -> Vec<Delivery<R>> {
        if let Some(pending) = self.pending.take() {
            return self.dispatch(&pending, |_, _| true);
        }
        match self.latest.clone() {
            Some(latest) => self.dispatch(&latest, |_, sub| sub.seen < latest.version()),
            None => Vec::new(),
        }
    }
}

struct BroadcastInner<R> {
    config: BroadcastConfig,
    order: Box<OrderFn<R>>,
    /// Only touched from queue work units; the lock exists for `Sync`.
    state: Mutex<BroadcastState<R>>,
    first_delivery: Gate,
    next_subscriber: AtomicU64,
}

/// Republishes the record set to subscribers with acknowledgment-based
/// backpressure.
///
/// Every state change (folding a store change, subscribing, unsubscribing,
/// acknowledging) runs as a FIFO ticket on the broadcaster's queue, and
/// snapshots are handed to subscribers from inside those tickets. Producers
/// never wait for subscribers; a subscriber that is still busy simply gets
/// the newest state once it acknowledges, skipping whatever came between.
pub struct SnapshotBroadcaster<R: Record> {
    queue: SerialQueue,
    inner: Arc<BroadcastInner<R>>,
}

impl<R: Record> Clone for SnapshotBroadcaster<R> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Record> SnapshotBroadcaster<R> {
    /// Broadcaster ordering snapshots by creation time, then id.
    pub fn new(queue: SerialQueue, config: BroadcastConfig) -> Self {
        Self::with_order(queue, config, creation_order::<R>)
    }

    /// Broadcaster ordering snapshots with `order`.
    pub fn with_order<F>(queue: SerialQueue, config: BroadcastConfig, order: F) -> Self
    where
        F: Fn(&R, &R) -> CmpOrdering + Send + Sync + 'static,
    {
        Self {
            queue,
            inner: Arc::new(BroadcastInner {
                config,
                order: Box::new(order),
                state: Mutex::new(BroadcastState {
                    mirror: HashMap::new(),
                    subscribers: BTreeMap::new(),
                    latest: None,
                    pending: None,
                    version: 0,
                }),
                first_delivery: Gate::new(),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    /// Register as a listener of `store`. A loaded store replays its records
    /// immediately, so attaching late is fine.
    pub fn attach(&self, store: &RecordStore<R>) -> Handle<ListenerId> {
        let broadcaster = self.clone();
        let listener = FnListener(move |change: Change<R>| {
            let _ = broadcaster.apply(change);
        });
        store.add_listener(Arc::new(listener))
    }

    /// Fold one change into the mirror and publish the resulting snapshot.
    pub fn apply(&self, change: Change<R>) -> Handle<()> {
        let inner = Arc::clone(&self.inner);
        self.queue.run_fifo(move || {
            inner.apply(change);
            Ok(())
        })
    }

    /// Add a subscriber. It receives the latest snapshot right away when no
    /// round is open, otherwise it joins the next round.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber<R>>) -> SubscriberId {
        let id = SubscriberId(self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst));
        let inner = Arc::clone(&self.inner);
        let _ = self.queue.run_fifo(move || {
            inner.subscribe(id, subscriber);
            Ok(())
        });
        id
    }

    /// Subscribe through a channel instead of a callback.
    pub fn subscribe_channel(&self) -> SnapshotReceiver<R> {
        let (sender, receiver) = unbounded();
        let id = self.subscribe(Arc::new(ChannelSubscriber { sender }));
        SnapshotReceiver::new(id, receiver, self.clone())
    }

    /// Remove a subscriber. Resolves to whether it was subscribed. Removing
    /// the last unacknowledged subscriber closes the current round.
    pub fn unsubscribe(&self, id: SubscriberId) -> Handle<bool> {
        let inner = Arc::clone(&self.inner);
        self.queue.run_fifo(move || Ok(inner.unsubscribe(id)))
    }

    /// Acknowledge the last snapshot delivered to `id`. A no-op when it is
    /// already acknowledged or unknown.
    pub fn ready(&self, id: SubscriberId) -> Handle<()> {
        let inner = Arc::clone(&self.inner);
        self.queue.run_fifo(move || {
            inner.ready(id);
            Ok(())
        })
    }

    /// Gate opened by the first snapshot ever delivered.
    pub fn first_delivery(&self) -> Gate {
        self.inner.first_delivery.clone()
    }

    /// Block until some subscriber received a snapshot.
    pub fn await_initial(&self) {
        self.inner.first_delivery.block();
    }

    /// Most recently built snapshot, delivered or not.
    pub fn latest(&self) -> Option<Snapshot<R>> {
        self.inner.state.lock().latest.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }

    /// Wait until every queued broadcaster operation has run.
    ///
    /// Must not be called from a subscriber callback.
    pub fn flush(&self) -> Result<()> {
        self.queue.flush()
    }
}

impl<R: Record> BroadcastInner<R> {
    fn apply(&self, change: Change<R>) {
        let kind = change.kind();
        let deliveries = {
            let mut state = self.state.lock();
            state.fold(change);

            let mut records: Vec<R> = state.mirror.values().cloned().collect();
            records.sort_by(|a, b| (self.order)(a, b));
            state.version += 1;
            let snapshot = Snapshot::new(state.version, records);
            state.latest = Some(snapshot.clone());

            match self.config.policy {
                DeliveryPolicy::Lockstep if state.unacked() > 0 => {
                    tracing::trace!(version = snapshot.version(), "snapshot coalesced");
                    state.pending = Some(snapshot);
                    Vec::new()
                }
                DeliveryPolicy::Lockstep => {
                    state.pending = None;
                    state.dispatch(&snapshot, |_, _| true)
                }
                DeliveryPolicy::Independent => state.dispatch(&snapshot, |_, sub| sub.acked),
            }
        };
        tracing::trace!(change = kind, delivered = deliveries.len(), "change folded");
        self.publish(deliveries);
    }

    fn subscribe(&self, id: SubscriberId, sink: Arc<dyn Subscriber<R>>) {
        let deliveries = {
            let mut state = self.state.lock();
            state.subscribers.insert(
                id,
                SubscriberState {
                    sink,
                    acked: true,
                    seen: 0,
                },
            );

            let round_open =
                self.config.policy == DeliveryPolicy::Lockstep && state.unacked() > 0;
            match state.latest.clone() {
                Some(latest) if !round_open => state.dispatch(&latest, |sub, _| sub == id),
                _ => Vec::new(),
            }
        };
        tracing::debug!(subscriber = id.0, "subscriber added");
        self.publish(deliveries);
    }

    fn unsubscribe(&self, id: SubscriberId) -> bool {
        let (removed, deliveries) = {
            let mut state = self.state.lock();
            match state.subscribers.remove(&id) {
                Some(sub) => {
                    let closes_round = !sub.acked
                        && self.config.policy == DeliveryPolicy::Lockstep
                        && state.unacked() == 0;
                    let deliveries = if closes_round {
                        state.close_round()
                    } else {
                        Vec::new()
                    };
                    (true, deliveries)
                }
                None => (false, Vec::new()),
            }
        };
        if removed {
            tracing::debug!(subscriber = id.0, "subscriber removed");
        }
        self.publish(deliveries);
        removed
    }

    fn ready(&self, id: SubscriberId) {
        let deliveries = {
            let mut state = self.state.lock();
            let seen = match state.subscribers.get_mut(&id) {
                Some(sub) if !sub.acked => {
                    sub.acked = true;
                    sub.seen
                }
                _ => return,
            };

            match self.config.policy {
                DeliveryPolicy::Lockstep if state.unacked() == 0 => state.close_round(),
                DeliveryPolicy::Lockstep => Vec::new(),
                DeliveryPolicy::Independent => match state.latest.clone() {
                    Some(latest) if latest.version() > seen => {
                        state.dispatch(&latest, |sub, _| sub == id)
                    }
                    _ => Vec::new(),
                },
            }
        };
        self.publish(deliveries);
    }

    /// Deliver, then treat every subscriber whose `receive` panicked as
    /// having acknowledged, closing the round if it was the last one out.
    fn publish(&self, mut deliveries: Vec<Delivery<R>>) {
        while !deliveries.is_empty() {
            let panicked = self.deliver(deliveries);
            if panicked.is_empty() {
                return;
            }

            let mut state = self.state.lock();
            for id in &panicked {
                if let Some(sub) = state.subscribers.get_mut(id) {
                    sub.acked = true;
                }
            }
            tracing::warn!(
                subscribers = panicked.len(),
                "acknowledged on behalf of panicked subscribers"
            );
            deliveries = match self.config.policy {
                DeliveryPolicy::Lockstep if state.unacked() == 0 => state.close_round(),
                _ => Vec::new(),
            };
        }
    }

    /// Invoke subscribers outside the state lock so they may acknowledge
    /// from inside `receive`. Returns the subscribers that panicked.
    fn deliver(&self, deliveries: Vec<Delivery<R>>) -> Vec<SubscriberId> {
        let mut panicked = Vec::new();
        if deliveries.is_empty() {
            return panicked;
        }
        for delivery in deliveries {
            let Delivery { id, sink, snapshot } = delivery;
            let version = snapshot.version();
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| sink.receive(snapshot))) {
                let err = StoreError::from_panic(&*payload);
                tracing::warn!(subscriber = id.0, version, error = %err, "subscriber panicked");
                panicked.push(id);
            }
        }
        self.first_delivery.open();
        panicked
    }
}
