//! Durable storage consumed by the record store.

use crate::error::Result;
use crate::types::{Record, RecordId};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Backing store keyed by generated numeric id.
///
/// Every call is made from the owning store's queue worker, one at a time.
/// Implementations report partial success through return values rather than
/// errors: a rejected insert returns an id `<= 0`, a missed update or delete
/// returns zero affected rows.
pub trait Repository<R>: Send + Sync {
    /// Load every persisted record.
    fn load_all(&self) -> Result<Vec<R>>;

    /// Persist a new record and return its generated id (`<= 0` = rejected).
    fn insert(&self, item: &R) -> Result<i64>;

    /// Overwrite an existing record. Returns affected rows.
    fn update(&self, item: &R) -> Result<usize>;

    /// Delete by id. Returns affected rows.
    fn delete(&self, id: RecordId) -> Result<usize>;

    fn delete_all(&self) -> Result<()>;
}

struct MemoryState<R> {
    rows: BTreeMap<RecordId, R>,
    next_id: u64,
}

/// In-memory repository with sequential ids, loading in id order.
pub struct MemoryRepository<R> {
    state: Mutex<MemoryState<R>>,
}

impl<R: Record> MemoryRepository<R> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                rows: BTreeMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Pre-populate with records, keeping their ids. Records without an id
    /// get one assigned.
    pub fn seeded(items: impl IntoIterator<Item = R>) -> Self {
        let repo = Self::new();
        {
            let mut state = repo.state.lock();
            for mut item in items {
                if !item.id().is_set() {
                    item.set_id(RecordId(state.next_id));
                }
                state.next_id = state.next_id.max(item.id().0 + 1);
                state.rows.insert(item.id(), item);
            }
        }
        repo
    }

    /// Current contents in id order.
    pub fn records(&self) -> Vec<R> {
        self.state.lock().rows.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R: Record> Default for MemoryRepository<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Record> Repository<R> for MemoryRepository<R> {
    fn load_all(&self) -> Result<Vec<R>> {
        Ok(self.records())
    }

    fn insert(&self, item: &R) -> Result<i64> {
        let mut state = self.state.lock();
        let id = RecordId(state.next_id);
        state.next_id += 1;

        let mut row = item.clone();
        row.set_id(id);
        state.rows.insert(id, row);
        Ok(id.0 as i64)
    }

    fn update(&self, item: &R) -> Result<usize> {
        let mut state = self.state.lock();
        match state.rows.get_mut(&item.id()) {
            Some(row) => {
                *row = item.clone();
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn delete(&self, id: RecordId) -> Result<usize> {
        Ok(usize::from(self.state.lock().rows.remove(&id).is_some()))
    }

    fn delete_all(&self) -> Result<()> {
        self.state.lock().rows.clear();
        Ok(())
    }
}
