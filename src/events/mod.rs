//! The event aggregator: batches data-change and schema-change
//! notifications for the duration of one transaction, layered one frame
//! per open savepoint so a `ROLLBACK TO` can discard exactly the events a
//! rolled-back savepoint produced.
//!
//! Grounded on the teacher's `connections.rs` subscription bookkeeping
//! (callbacks registered against a connection, unregistered on drop),
//! generalized from a flat per-connection callback list to a layered,
//! per-transaction batch with commit-time flush.

use crate::row::Row;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct DataChangeEvent {
    pub schema: String,
    pub table: String,
    pub kind: ChangeKind,
    pub pk: Row,
    /// Set when this event originates from applying a remotely-replicated
    /// change rather than a local DML statement; subscribers that only
    /// care about locally-originated writes can filter on this.
    pub remote: bool,
}

#[derive(Debug, Clone)]
pub struct SchemaChangeEvent {
    pub schema: String,
    pub object_name: String,
    pub ddl: Option<String>,
    pub remote: bool,
}

#[derive(Debug, Clone)]
pub enum Event {
    Data(DataChangeEvent),
    Schema(SchemaChangeEvent),
}

type DataCallback = Box<dyn FnMut(&DataChangeEvent)>;
type SchemaCallback = Box<dyn FnMut(&SchemaChangeEvent)>;

struct Inner {
    next_id: u64,
    data_subscribers: std::collections::HashMap<u64, DataCallback>,
    schema_subscribers: std::collections::HashMap<u64, SchemaCallback>,
    /// One `Vec<Event>` per open savepoint depth, plus the base (depth 0)
    /// transaction frame at index 0. `commit`/explicit-transaction-less
    /// autocommit statements use a single frame that is flushed immediately.
    layers: Vec<Vec<Event>>,
    /// Set by `Database` right before applying a change that originated on
    /// another connection (replication / coordinated-commit fan-out), so
    /// the next schema event recorded is tagged `remote` instead of
    /// re-deriving it from context.
    expect_remote_schema_event: bool,
}

impl Inner {
    fn new() -> Self {
        Self {
            next_id: 0,
            data_subscribers: std::collections::HashMap::new(),
            schema_subscribers: std::collections::HashMap::new(),
            layers: vec![Vec::new()],
            expect_remote_schema_event: false,
        }
    }
}

/// Unsubscribes automatically when dropped, so a connection's callbacks
/// never outlive the connection that registered them.
pub struct Subscription {
    aggregator: Weak<RefCell<Inner>>,
    id: u64,
    is_schema: bool,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.aggregator.upgrade() {
            let mut inner = inner.borrow_mut();
            if self.is_schema {
                inner.schema_subscribers.remove(&self.id);
            } else {
                inner.data_subscribers.remove(&self.id);
            }
        }
    }
}

#[derive(Clone)]
pub struct EventAggregator {
    inner: Rc<RefCell<Inner>>,
}

impl Default for EventAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl EventAggregator {
    pub fn new() -> Self {
        Self { inner: Rc::new(RefCell::new(Inner::new())) }
    }

    pub fn on_data_change(&self, callback: impl FnMut(&DataChangeEvent) + 'static) -> Subscription {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.data_subscribers.insert(id, Box::new(callback));
        Subscription { aggregator: Rc::downgrade(&self.inner), id, is_schema: false }
    }

    pub fn on_schema_change(&self, callback: impl FnMut(&SchemaChangeEvent) + 'static) -> Subscription {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.schema_subscribers.insert(id, Box::new(callback));
        Subscription { aggregator: Rc::downgrade(&self.inner), id, is_schema: true }
    }

    /// Marks the next recorded schema event as remotely-originated. Cleared
    /// automatically once consumed.
    pub fn expect_remote_schema_event(&self) {
        self.inner.borrow_mut().expect_remote_schema_event = true;
    }

    fn take_remote_flag(inner: &mut Inner) -> bool {
        std::mem::replace(&mut inner.expect_remote_schema_event, false)
    }

    pub fn record_data_change(&self, mut event: DataChangeEvent) {
        let mut inner = self.inner.borrow_mut();
        event.remote = event.remote || Self::take_remote_flag(&mut inner);
        inner.layers.last_mut().expect("base layer always present").push(Event::Data(event));
    }

    pub fn record_schema_change(&self, mut event: SchemaChangeEvent) {
        let mut inner = self.inner.borrow_mut();
        event.remote = event.remote || Self::take_remote_flag(&mut inner);
        inner.layers.last_mut().expect("base layer always present").push(Event::Schema(event));
    }

    /// Opens a new savepoint layer; events recorded afterward belong to it
    /// until `release_layer`/`rollback_layer` resolve it.
    pub fn begin_layer(&self) {
        self.inner.borrow_mut().layers.push(Vec::new());
    }

    /// Merges the top layer's events into the one below (`RELEASE
    /// SAVEPOINT`): they survive but are no longer independently
    /// discardable.
    pub fn release_layer(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.layers.len() <= 1 {
            return;
        }
        let top = inner.layers.pop().expect("checked len above");
        inner.layers.last_mut().expect("base layer always present").extend(top);
    }

    /// Discards every event recorded since the matching `begin_layer`
    /// (`ROLLBACK TO SAVEPOINT`).
    pub fn rollback_layer(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.layers.len() > 1 {
            inner.layers.pop();
        } else if let Some(base) = inner.layers.first_mut() {
            base.clear();
        }
    }

    /// Flushes every accumulated event to subscribers and resets to a
    /// single empty base layer. Per §4.7/§8: all schema events fire first
    /// (in recorded order), then all data events (in recorded order) — not
    /// simple recording order. Called once per committed transaction (and
    /// once per autocommit statement).
    pub fn commit(&self) {
        let events: Vec<Event> = {
            let mut inner = self.inner.borrow_mut();
            let mut events: Vec<Event> = inner.layers.drain(..).flatten().collect();
            events.sort_by_key(|e| match e {
                Event::Schema(_) => 0,
                Event::Data(_) => 1,
            });
            inner.layers.push(Vec::new());
            events
        };
        for event in events {
            let mut inner = self.inner.borrow_mut();
            match event {
                Event::Data(ref data) => {
                    tracing::trace!(schema = %data.schema, table = %data.table, kind = ?data.kind, "firing data change event");
                    for cb in inner.data_subscribers.values_mut() {
                        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(data))).is_err() {
                            tracing::warn!(table = %data.table, "data-change subscriber panicked, suppressing");
                        }
                    }
                }
                Event::Schema(ref schema) => {
                    tracing::trace!(schema = %schema.schema, object = %schema.object_name, "firing schema change event");
                    for cb in inner.schema_subscribers.values_mut() {
                        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(schema))).is_err() {
                            tracing::warn!(object = %schema.object_name, "schema-change subscriber panicked, suppressing");
                        }
                    }
                }
            }
        }
    }

    /// Discards every layer without notifying subscribers.
    pub fn rollback(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.layers.clear();
        inner.layers.push(Vec::new());
    }

    /// Total events recorded across all open layers, for tests and for the
    /// change log the transaction coordinator consults for assertion
    /// skip-checks.
    pub fn pending_event_count(&self) -> usize {
        self.inner.borrow().layers.iter().map(|l| l.len()).sum()
    }

    /// Names of tables touched by pending data-change events, deduplicated,
    /// used by the coordinator to skip assertions whose tables saw no
    /// writes this transaction.
    pub fn touched_tables(&self) -> Vec<String> {
        let inner = self.inner.borrow();
        let mut names: Vec<String> = inner
            .layers
            .iter()
            .flatten()
            .filter_map(|e| match e {
                Event::Data(d) => Some(d.table.clone()),
                Event::Schema(_) => None,
            })
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_event(table: &str) -> DataChangeEvent {
        DataChangeEvent {
            schema: "main".into(),
            table: table.into(),
            kind: ChangeKind::Insert,
            pk: vec![crate::value::Value::Integer(1)],
            remote: false,
        }
    }

    #[test]
    fn commit_flushes_in_order_and_resets() {
        let agg = EventAggregator::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_cb = seen.clone();
        let _sub = agg.on_data_change(move |e| seen_cb.borrow_mut().push(e.table.clone()));
        agg.record_data_change(data_event("a"));
        agg.record_data_change(data_event("b"));
        agg.commit();
        assert_eq!(*seen.borrow(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(agg.pending_event_count(), 0);
    }

    #[test]
    fn rollback_to_savepoint_discards_only_its_layer() {
        let agg = EventAggregator::new();
        agg.record_data_change(data_event("a"));
        agg.begin_layer();
        agg.record_data_change(data_event("b"));
        agg.rollback_layer();
        assert_eq!(agg.touched_tables(), vec!["a".to_string()]);
    }

    #[test]
    fn release_savepoint_keeps_events_in_parent_layer() {
        let agg = EventAggregator::new();
        agg.begin_layer();
        agg.record_data_change(data_event("b"));
        agg.release_layer();
        assert_eq!(agg.touched_tables(), vec!["b".to_string()]);
        agg.rollback_layer();
        assert_eq!(agg.touched_tables(), vec!["b".to_string()]);
    }

    #[test]
    fn schema_events_fire_before_data_events_regardless_of_recording_order() {
        let agg = EventAggregator::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let data_seen = seen.clone();
        let _data_sub = agg.on_data_change(move |e| data_seen.borrow_mut().push(format!("data:{}", e.table)));
        let schema_seen = seen.clone();
        let _schema_sub = agg.on_schema_change(move |e| schema_seen.borrow_mut().push(format!("schema:{}", e.object_name)));

        agg.record_data_change(data_event("a"));
        agg.record_schema_change(SchemaChangeEvent { schema: "main".into(), object_name: "t".into(), ddl: None, remote: false });
        agg.record_data_change(data_event("b"));
        agg.commit();

        assert_eq!(*seen.borrow(), vec!["schema:t".to_string(), "data:a".to_string(), "data:b".to_string()]);
    }

    #[test]
    fn dropping_subscription_stops_delivery() {
        let agg = EventAggregator::new();
        let seen = Rc::new(RefCell::new(0));
        let seen_cb = seen.clone();
        let sub = agg.on_data_change(move |_| *seen_cb.borrow_mut() += 1);
        drop(sub);
        agg.record_data_change(data_event("a"));
        agg.commit();
        assert_eq!(*seen.borrow(), 0);
    }
}
