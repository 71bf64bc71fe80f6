//! Core types for the record store.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a persisted record. Zero means "not yet persisted".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct RecordId(pub u64);

impl RecordId {
    pub const UNSET: RecordId = RecordId(0);

    pub fn is_set(self) -> bool {
        self.0 != 0
    }

    /// Interpret a repository-assigned id; anything `<= 0` is a rejection.
    pub fn from_assigned(raw: i64) -> Option<Self> {
        u64::try_from(raw).ok().filter(|v| *v > 0).map(RecordId)
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time. A clock set before the epoch reads as zero.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A value the store can persist and publish.
///
/// The id and both timestamps belong to the store: callers may read them,
/// but [`RecordStore`](crate::RecordStore) overwrites them on every write.
pub trait Record: Clone + Send + Sync + 'static {
    fn id(&self) -> RecordId;
    fn set_id(&mut self, id: RecordId);

    fn created(&self) -> Timestamp;
    fn set_created(&mut self, at: Timestamp);

    fn modified(&self) -> Timestamp;
    fn set_modified(&mut self, at: Timestamp);
}

/// Default record order: creation time, ties broken by id.
pub fn creation_order<R: Record>(a: &R, b: &R) -> Ordering {
    a.created()
        .cmp(&b.created())
        .then_with(|| a.id().0.cmp(&b.id().0))
}

/// Ready-made record wrapping an opaque payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry<T> {
    pub id: RecordId,
    pub created: Timestamp,
    pub modified: Timestamp,
    pub payload: T,
}

impl<T> Entry<T> {
    /// A fresh, unpersisted entry.
    pub fn new(payload: T) -> Self {
        Self {
            id: RecordId::UNSET,
            created: Timestamp::default(),
            modified: Timestamp::default(),
            payload,
        }
    }

    /// Builder-style id override, mostly for seeding repositories.
    pub fn with_id(mut self, id: RecordId) -> Self {
        self.id = id;
        self
    }
}

impl<T> Record for Entry<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> RecordId {
        self.id
    }

    fn set_id(&mut self, id: RecordId) {
        self.id = id;
    }

    fn created(&self) -> Timestamp {
        self.created
    }

    fn set_created(&mut self, at: Timestamp) {
        self.created = at;
    }

    fn modified(&self) -> Timestamp {
        self.modified
    }

    fn set_modified(&mut self, at: Timestamp) {
        self.modified = at;
    }
}
