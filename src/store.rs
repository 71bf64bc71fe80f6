//! Main RecordStore tying the queue, repository and listeners together.

use crate::error::Result;
use crate::listener::{Change, Listener, ListenerId};
use crate::queue::{Handle, QueueConfig, SerialQueue};
use crate::repository::Repository;
use crate::types::{creation_order, Record, RecordId, Timestamp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// How an accepted write lands in the in-memory map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Apply {
    Put,
    Remove,
}

struct StoreState<R> {
    records: HashMap<RecordId, R>,
    listeners: Vec<(ListenerId, Arc<dyn Listener<R>>)>,
    /// Whether a refresh has completed at least once.
    loaded: bool,
}

impl<R: Record> StoreState<R> {
    fn ordered(&self) -> Vec<R> {
        let mut items: Vec<R> = self.records.values().cloned().collect();
        items.sort_by(creation_order);
        items
    }

    /// Commit an accepted item, returning the version listeners should see.
    fn apply(&mut self, apply: Apply, item: R) -> R {
        match apply {
            Apply::Put => {
                self.records.insert(item.id(), item.clone());
                item
            }
            Apply::Remove => self.records.remove(&item.id()).unwrap_or(item),
        }
    }
}

struct StoreInner<R> {
    repository: Arc<dyn Repository<R>>,
    /// Only touched from queue work units; the lock exists for `Sync`.
    state: Mutex<StoreState<R>>,
    next_listener: AtomicU64,
}

/// The record store.
///
/// Keeps the authoritative in-memory copy of every record and funnels each
/// operation through one [`SerialQueue`] as a FIFO ticket:
/// - mutations hit the [`Repository`] first, then memory, then listeners
/// - batches report per-item outcomes; rejected items are left out of
///   memory and of the emitted event while the call itself succeeds
/// - listener registration is ordered with the mutations around it
///
/// Every method returns immediately with a [`Handle`]; call
/// [`Handle::wait`] for the synchronous behaviour.
pub struct RecordStore<R: Record> {
    queue: SerialQueue,
    inner: Arc<StoreInner<R>>,
}

impl<R: Record> Clone for RecordStore<R> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Record> RecordStore<R> {
    /// Build a store with its own pooled queue.
    pub fn open(repository: Arc<dyn Repository<R>>, config: QueueConfig) -> Result<Self> {
        Ok(Self::with_queue(repository, SerialQueue::with_config(config)?))
    }

    /// Build a store on an existing queue, possibly shared with other work.
    pub fn with_queue(repository: Arc<dyn Repository<R>>, queue: SerialQueue) -> Self {
        Self {
            queue,
            inner: Arc::new(StoreInner {
                repository,
                state: Mutex::new(StoreState {
                    records: HashMap::new(),
                    listeners: Vec::new(),
                    loaded: false,
                }),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn queue(&self) -> &SerialQueue {
        &self.queue
    }

    /// True once any refresh has completed.
    pub fn is_loaded(&self) -> bool {
        self.inner.state.lock().loaded
    }

    // --- Loading ---

    /// Reload everything from the repository and announce the new set in
    /// creation order.
    pub fn refresh(&self) -> Handle<Arc<[R]>> {
        self.refresh_with(|_| {})
    }

    /// Like [`refresh`](Self::refresh), passing every loaded record through
    /// `updater` first. Updated values are kept in memory only.
    pub fn refresh_with<F>(&self, updater: F) -> Handle<Arc<[R]>>
    where
        F: FnMut(&mut R) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.queue.run_fifo(move || inner.reload(updater))
    }

    // --- Mutations ---

    /// Persist a new record. Resolves to the assigned id, or `None` when the
    /// repository rejected it.
    pub fn insert(&self, item: R) -> Handle<Option<RecordId>> {
        let inner = Arc::clone(&self.inner);
        self.queue.run_fifo(move || {
            inner.apply_one(item, Apply::Put, |i| inner.persist_new(i), Change::Inserted)
        })
    }

    /// Persist new records. Resolves to one entry per input, in order.
    pub fn insert_batch(&self, items: Vec<R>) -> Handle<Vec<Option<RecordId>>> {
        let inner = Arc::clone(&self.inner);
        self.queue.run_fifo(move || {
            inner.apply_batch(items, Apply::Put, |i| inner.persist_new(i), Change::InsertedMany)
        })
    }

    /// Overwrite a record. Resolves to the affected row count.
    pub fn update(&self, item: R) -> Handle<usize> {
        let inner = Arc::clone(&self.inner);
        self.queue.run_fifo(move || {
            inner.apply_one(item, Apply::Put, |i| inner.persist_update(i), Change::Updated)
        })
    }

    /// Overwrite records. Resolves to per-item affected row counts.
    pub fn update_batch(&self, items: Vec<R>) -> Handle<Vec<usize>> {
        let inner = Arc::clone(&self.inner);
        self.queue.run_fifo(move || {
            inner.apply_batch(items, Apply::Put, |i| inner.persist_update(i), Change::UpdatedMany)
        })
    }

    /// Delete a record by its id. Resolves to the affected row count.
    pub fn delete(&self, item: R) -> Handle<usize> {
        let inner = Arc::clone(&self.inner);
        self.queue.run_fifo(move || {
            inner.apply_one(item, Apply::Remove, |i| inner.persist_delete(i), Change::Removed)
        })
    }

    /// Delete records by id. Resolves to per-item affected row counts.
    pub fn delete_batch(&self, items: Vec<R>) -> Handle<Vec<usize>> {
        let inner = Arc::clone(&self.inner);
        self.queue.run_fifo(move || {
            inner.apply_batch(items, Apply::Remove, |i| inner.persist_delete(i), Change::RemovedMany)
        })
    }

    /// Clear the repository, then reload so listeners see the empty set.
    pub fn delete_all(&self) -> Handle<()> {
        let inner = Arc::clone(&self.inner);
        self.queue.run_fifo(move || {
            inner.repository.delete_all()?;
            tracing::debug!("repository cleared");
            inner.reload(|_| {}).map(|_| ())
        })
    }

    // --- Reads ---

    /// All records in creation order, as of this point in the queue.
    pub fn records(&self) -> Handle<Vec<R>> {
        let inner = Arc::clone(&self.inner);
        self.queue.run_fifo(move || Ok(inner.state.lock().ordered()))
    }

    pub fn get(&self, id: RecordId) -> Handle<Option<R>> {
        let inner = Arc::clone(&self.inner);
        self.queue
            .run_fifo(move || Ok(inner.state.lock().records.get(&id).cloned()))
    }

    pub fn len(&self) -> Handle<usize> {
        let inner = Arc::clone(&self.inner);
        self.queue.run_fifo(move || Ok(inner.state.lock().records.len()))
    }

    // --- Listeners ---

    /// Register a listener. If the store is already loaded, the listener is
    /// first handed the current records through `on_all_changed`.
    pub fn add_listener(&self, listener: Arc<dyn Listener<R>>) -> Handle<ListenerId> {
        let inner = Arc::clone(&self.inner);
        self.queue.run_fifo(move || Ok(inner.register(listener)))
    }

    /// Unregister a listener. Resolves to whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> Handle<bool> {
        let inner = Arc::clone(&self.inner);
        self.queue.run_fifo(move || {
            let mut state = inner.state.lock();
            let before = state.listeners.len();
            state.listeners.retain(|(listener, _)| *listener != id);
            Ok(state.listeners.len() != before)
        })
    }
}

impl<R: Record> StoreInner<R> {
    fn reload(&self, mut updater: impl FnMut(&mut R)) -> Result<Arc<[R]>> {
        let mut loaded = self.repository.load_all()?;
        loaded.iter_mut().for_each(|item| updater(item));
        loaded.sort_by(creation_order);
        let items: Arc<[R]> = Arc::from(loaded);

        {
            let mut state = self.state.lock();
            state.records = items.iter().map(|item| (item.id(), item.clone())).collect();
            state.loaded = true;
        }
        tracing::debug!(records = items.len(), "store refreshed");

        self.emit(&Change::AllChanged(Arc::clone(&items)));
        Ok(items)
    }

    fn persist_new(&self, mut item: R) -> Result<(Option<RecordId>, Option<R>)> {
        let now = Timestamp::now();
        item.set_created(now);
        item.set_modified(now);
        item.set_id(RecordId::UNSET);

        let assigned = self.repository.insert(&item)?;
        match RecordId::from_assigned(assigned) {
            Some(id) => {
                item.set_id(id);
                Ok((Some(id), Some(item)))
            }
            None => {
                tracing::debug!(assigned, "repository rejected insert");
                Ok((None, None))
            }
        }
    }

    fn persist_update(&self, mut item: R) -> Result<(usize, Option<R>)> {
        item.set_modified(Timestamp::now());
        let rows = self.repository.update(&item)?;
        if rows == 0 {
            tracing::debug!(id = %item.id(), "update affected no rows");
        }
        Ok((rows, (rows > 0).then_some(item)))
    }

    fn persist_delete(&self, item: R) -> Result<(usize, Option<R>)> {
        let rows = self.repository.delete(item.id())?;
        if rows == 0 {
            tracing::debug!(id = %item.id(), "delete affected no rows");
        }
        Ok((rows, (rows > 0).then_some(item)))
    }

    fn apply_one<T>(
        &self,
        item: R,
        apply: Apply,
        write: impl FnOnce(R) -> Result<(T, Option<R>)>,
        change: fn(R) -> Change<R>,
    ) -> Result<T> {
        let (outcome, accepted) = write(item)?;
        if let Some(item) = accepted {
            let item = self.state.lock().apply(apply, item);
            self.emit(&change(item));
        }
        Ok(outcome)
    }

    /// Write items one by one. Items written before a repository error are
    /// still committed and announced before the error is returned.
    fn apply_batch<T>(
        &self,
        items: Vec<R>,
        apply: Apply,
        mut write: impl FnMut(R) -> Result<(T, Option<R>)>,
        change: fn(Arc<[R]>) -> Change<R>,
    ) -> Result<Vec<T>> {
        let requested = items.len();
        let mut outcomes = Vec::with_capacity(requested);
        let mut accepted = Vec::new();
        let mut failure = None;

        for item in items {
            match write(item) {
                Ok((outcome, Some(item))) => {
                    outcomes.push(outcome);
                    accepted.push(item);
                }
                Ok((outcome, None)) => outcomes.push(outcome),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if !accepted.is_empty() {
            let committed: Vec<R> = {
                let mut state = self.state.lock();
                accepted.into_iter().map(|item| state.apply(apply, item)).collect()
            };
            tracing::debug!(requested, committed = committed.len(), ?apply, "batch applied");
            self.emit(&change(Arc::from(committed)));
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(outcomes),
        }
    }

    fn register(&self, listener: Arc<dyn Listener<R>>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        let replay = {
            let mut state = self.state.lock();
            state.listeners.push((id, Arc::clone(&listener)));
            state.loaded.then(|| state.ordered())
        };

        if let Some(items) = replay {
            notify_isolated(id, listener.as_ref(), &Change::AllChanged(Arc::from(items)));
        }
        id
    }

    /// Fan a change out to every listener registered right now.
    fn emit(&self, change: &Change<R>) {
        let listeners: Vec<_> = self
            .state
            .lock()
            .listeners
            .iter()
            .map(|(id, listener)| (*id, Arc::clone(listener)))
            .collect();

        for (id, listener) in listeners {
            notify_isolated(id, listener.as_ref(), change);
        }
    }
}

fn notify_isolated<R>(id: ListenerId, listener: &dyn Listener<R>, change: &Change<R>) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| change.notify(listener))) {
        let err = crate::error::StoreError::from_panic(&*payload);
        tracing::warn!(listener = id.0, change = change.kind(), error = %err, "listener panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::listener::FnListener;
    use crate::queue::InlineExecutor;
    use crate::repository::MemoryRepository;
    use crate::types::Entry;

    type Note = Entry<String>;

    fn note(text: &str) -> Note {
        Entry::new(text.to_string())
    }

    fn inline_store(repo: Arc<dyn Repository<Note>>) -> RecordStore<Note> {
        RecordStore::with_queue(repo, SerialQueue::new(Arc::new(InlineExecutor)))
    }

    fn recorder() -> (Arc<dyn Listener<Note>>, Arc<Mutex<Vec<Change<Note>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener = FnListener(move |change: Change<Note>| sink.lock().push(change));
        (Arc::new(listener), seen)
    }

    /// Rejects inserts of payload "reject" and fails on payload "fail".
    struct Picky(MemoryRepository<Note>);

    impl Repository<Note> for Picky {
        fn load_all(&self) -> Result<Vec<Note>> {
            self.0.load_all()
        }

        fn insert(&self, item: &Note) -> Result<i64> {
            match item.payload.as_str() {
                "reject" => Ok(0),
                "fail" => Err(StoreError::repository("constraint violated")),
                _ => self.0.insert(item),
            }
        }

        fn update(&self, item: &Note) -> Result<usize> {
            self.0.update(item)
        }

        fn delete(&self, id: RecordId) -> Result<usize> {
            self.0.delete(id)
        }

        fn delete_all(&self) -> Result<()> {
            self.0.delete_all()
        }
    }

    #[test]
    fn test_insert_adopts_repository_id_and_stamps() {
        let store = inline_store(Arc::new(MemoryRepository::new()));
        let (listener, seen) = recorder();
        store.add_listener(listener).wait().unwrap();

        let mut item = note("first");
        item.id = RecordId(99);
        let id = store.insert(item).wait().unwrap().unwrap();
        assert_eq!(id, RecordId(1));

        let stored = store.get(id).wait().unwrap().unwrap();
        assert!(stored.created > Timestamp(0));
        assert_eq!(stored.created, stored.modified);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        match &seen[0] {
            Change::Inserted(item) => assert_eq!(item.id, RecordId(1)),
            other => panic!("Expected insert, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_rejected_insert_is_silent() {
        let store = inline_store(Arc::new(Picky(MemoryRepository::new())));
        let (listener, seen) = recorder();
        store.add_listener(listener).wait().unwrap();

        assert_eq!(store.insert(note("reject")).wait(), Ok(None));
        assert!(seen.lock().is_empty());
        assert_eq!(store.len().wait(), Ok(0));
    }

    #[test]
    fn test_batch_insert_emits_accepted_subset() {
        let store = inline_store(Arc::new(Picky(MemoryRepository::new())));
        let (listener, seen) = recorder();
        store.add_listener(listener).wait().unwrap();

        let ids = store
            .insert_batch(vec![note("a"), note("reject"), note("b")])
            .wait()
            .unwrap();
        assert_eq!(ids, vec![Some(RecordId(1)), None, Some(RecordId(2))]);

        let seen = seen.lock();
        match &seen[..] {
            [Change::InsertedMany(items)] => {
                let payloads: Vec<_> = items.iter().map(|i| i.payload.as_str()).collect();
                assert_eq!(payloads, vec!["a", "b"]);
            }
            _ => panic!("Expected a single insert_list event"),
        }
    }

    #[test]
    fn test_batch_error_commits_prefix_then_fails() {
        let store = inline_store(Arc::new(Picky(MemoryRepository::new())));
        let (listener, seen) = recorder();
        store.add_listener(listener).wait().unwrap();

        let result = store
            .insert_batch(vec![note("a"), note("fail"), note("never")])
            .wait();
        assert_eq!(result, Err(StoreError::Repository("constraint violated".into())));

        assert_eq!(store.len().wait(), Ok(1));
        assert!(matches!(&seen.lock()[..], [Change::InsertedMany(items)] if items.len() == 1));
    }

    #[test]
    fn test_update_and_delete_partial_success() {
        let repo = Arc::new(MemoryRepository::new());
        let store = inline_store(repo.clone());
        store.insert_batch(vec![note("a"), note("b")]).wait().unwrap();

        let (listener, seen) = recorder();
        store.add_listener(listener).wait().unwrap();
        seen.lock().clear();

        let mut records = store.records().wait().unwrap();
        records[0].payload = "a2".into();
        let ghost = note("ghost").with_id(RecordId(42));

        let rows = store
            .update_batch(vec![records[0].clone(), ghost.clone()])
            .wait()
            .unwrap();
        assert_eq!(rows, vec![1, 0]);
        assert_eq!(repo.records()[0].payload, "a2");

        let rows = store.delete_batch(vec![ghost, records[1].clone()]).wait().unwrap();
        assert_eq!(rows, vec![0, 1]);

        let seen = seen.lock();
        assert!(matches!(&seen[0], Change::UpdatedMany(items) if items.len() == 1 && items[0].payload == "a2"));
        assert!(matches!(&seen[1], Change::RemovedMany(items) if items.len() == 1 && items[0].payload == "b"));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_single_update_miss_emits_nothing() {
        let store = inline_store(Arc::new(MemoryRepository::new()));
        let (listener, seen) = recorder();
        store.add_listener(listener).wait().unwrap();

        assert_eq!(store.update(note("x").with_id(RecordId(3))).wait(), Ok(0));
        assert_eq!(store.delete(note("x").with_id(RecordId(3))).wait(), Ok(0));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_refresh_applies_updater_in_memory_only() {
        let repo = Arc::new(MemoryRepository::seeded(vec![note("raw")]));
        let store = inline_store(repo.clone());

        let items = store
            .refresh_with(|item: &mut Note| item.payload.make_ascii_uppercase())
            .wait()
            .unwrap();
        assert_eq!(items[0].payload, "RAW");
        assert_eq!(repo.records()[0].payload, "raw");
        assert!(store.is_loaded());
    }

    #[test]
    fn test_delete_all_announces_empty_set() {
        let repo = Arc::new(MemoryRepository::seeded(vec![note("a"), note("b")]));
        let store = inline_store(repo.clone());
        store.refresh().wait().unwrap();

        let (listener, seen) = recorder();
        store.add_listener(listener).wait().unwrap();
        store.delete_all().wait().unwrap();

        assert!(repo.is_empty());
        let seen = seen.lock();
        // Replay on registration, then the explicit empty set.
        assert!(matches!(&seen[0], Change::AllChanged(items) if items.len() == 2));
        assert!(matches!(&seen[1], Change::AllChanged(items) if items.is_empty()));
    }

    #[test]
    fn test_all_changed_lists_share_creation_order() {
        let stamped = |id: u64, created: i64| {
            let mut item = note(&format!("n{id}")).with_id(RecordId(id));
            item.created = Timestamp(created);
            item
        };
        // Repository loads by id; creation order is the reverse.
        let repo = MemoryRepository::seeded(vec![stamped(1, 30), stamped(2, 20), stamped(3, 10)]);
        let store = inline_store(Arc::new(repo));

        let (first, seen_first) = recorder();
        store.add_listener(first).wait().unwrap();
        let refreshed = store.refresh().wait().unwrap();

        let (late, seen_late) = recorder();
        store.add_listener(late).wait().unwrap();

        let ids = |items: &[Note]| items.iter().map(|i| i.id.0).collect::<Vec<_>>();
        assert_eq!(ids(&refreshed), vec![3, 2, 1]);
        match (&seen_first.lock()[..], &seen_late.lock()[..]) {
            ([Change::AllChanged(loaded)], [Change::AllChanged(replayed)]) => {
                assert_eq!(ids(loaded), vec![3, 2, 1]);
                assert_eq!(ids(replayed), vec![3, 2, 1]);
            }
            _ => panic!("Expected one all-changed event per listener"),
        };
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let store = inline_store(Arc::new(MemoryRepository::new()));
        let bad = FnListener(|_: Change<Note>| panic!("listener bug"));
        store.add_listener(Arc::new(bad)).wait().unwrap();
        let (listener, seen) = recorder();
        store.add_listener(listener).wait().unwrap();

        assert!(store.insert(note("a")).wait().unwrap().is_some());
        assert!(store.insert(note("b")).wait().unwrap().is_some());
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_removed_listener_stops_receiving() {
        let store = inline_store(Arc::new(MemoryRepository::new()));
        let (listener, seen) = recorder();
        let id = store.add_listener(listener).wait().unwrap();

        store.insert(note("a")).wait().unwrap();
        assert_eq!(store.remove_listener(id).wait(), Ok(true));
        assert_eq!(store.remove_listener(id).wait(), Ok(false));
        store.insert(note("b")).wait().unwrap();

        assert_eq!(seen.lock().len(), 1);
    }
}
