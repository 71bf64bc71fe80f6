//! Change listeners notified by the record store.

use std::sync::Arc;

/// Identifier of a registered listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Observer of record store mutations.
///
/// Called on the store's queue worker, one mutation at a time, in the order
/// the mutations were applied. Lists are immutable and never empty. A
/// panicking callback is logged and skipped; the remaining listeners still
/// run.
///
/// All callbacks default to no-ops.
#[allow(unused_variables)]
pub trait Listener<R>: Send + Sync {
    fn on_insert(&self, item: &R) {}

    fn on_insert_list(&self, items: &Arc<[R]>) {}

    fn on_update(&self, item: &R) {}

    fn on_update_list(&self, items: &Arc<[R]>) {}

    fn on_remove(&self, item: &R) {}

    fn on_remove_list(&self, items: &Arc<[R]>) {}

    /// The whole record set was replaced (refresh, delete-all, or replay to
    /// a newly registered listener).
    fn on_all_changed(&self, items: &Arc<[R]>) {}
}

/// One store mutation, as delivered to listeners.
#[derive(Clone, Debug)]
pub enum Change<R> {
    Inserted(R),
    InsertedMany(Arc<[R]>),
    Updated(R),
    UpdatedMany(Arc<[R]>),
    Removed(R),
    RemovedMany(Arc<[R]>),
    AllChanged(Arc<[R]>),
}

impl<R> Change<R> {
    /// Invoke the callback matching this change.
    pub fn notify(&self, listener: &dyn Listener<R>) {
        match self {
            Change::Inserted(item) => listener.on_insert(item),
            Change::InsertedMany(items) => listener.on_insert_list(items),
            Change::Updated(item) => listener.on_update(item),
            Change::UpdatedMany(items) => listener.on_update_list(items),
            Change::Removed(item) => listener.on_remove(item),
            Change::RemovedMany(items) => listener.on_remove_list(items),
            Change::AllChanged(items) => listener.on_all_changed(items),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Change::Inserted(_) => "insert",
            Change::InsertedMany(_) => "insert_list",
            Change::Updated(_) => "update",
            Change::UpdatedMany(_) => "update_list",
            Change::Removed(_) => "remove",
            Change::RemovedMany(_) => "remove_list",
            Change::AllChanged(_) => "all_changed",
        }
    }
}

/// Listener that forwards every change to a closure.
pub struct FnListener<F>(pub F);

impl<R, F> Listener<R> for FnListener<F>
where
    R: Clone,
    F: Fn(Change<R>) + Send + Sync,
{
    fn on_insert(&self, item: &R) {
        (self.0)(Change::Inserted(item.clone()))
    }

    fn on_insert_list(&self, items: &Arc<[R]>) {
        (self.0)(Change::InsertedMany(Arc::clone(items)))
    }

    fn on_update(&self, item: &R) {
        (self.0)(Change::Updated(item.clone()))
    }

    fn on_update_list(&self, items: &Arc<[R]>) {
        (self.0)(Change::UpdatedMany(Arc::clone(items)))
    }

    fn on_remove(&self, item: &R) {
        (self.0)(Change::Removed(item.clone()))
    }

    fn on_remove_list(&self, items: &Arc<[R]>) {
        (self.0)(Change::RemovedMany(Arc::clone(items)))
    }

    fn on_all_changed(&self, items: &Arc<[R]>) {
        (self.0)(Change::AllChanged(Arc::clone(items)))
    }
}
