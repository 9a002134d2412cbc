//! The runtime object graph: records, attribute values and the
//! identity-mapping context that scopes them to one unit of work.

use crate::error::{LoamError, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

/// Context-local handle to a record. Cross-references between records are
/// stored as these logical keys and resolved through the owning
/// `RecordContext`, so cyclic graphs never form reference cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordRef(u64);

pub type RecordHandle = Rc<RefCell<Record>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Created in a context, not yet backed by a row.
    Transient,
    /// Backed by a row; `id` is set.
    Persisted,
    /// Row deleted. The instance stays addressable in its context but
    /// must not be re-read or written.
    Deleted,
}

/// A large-object column value: read lazily on first access, cached, and
/// replayable thereafter.
#[derive(Clone)]
pub struct BinaryValue {
    backing: Rc<RefCell<BinaryBacking>>,
}

enum BinaryBacking {
    Bytes(Rc<Vec<u8>>),
    Pending {
        table: String,
        column: String,
        id: i64,
    },
}

impl BinaryValue {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        BinaryValue {
            backing: Rc::new(RefCell::new(BinaryBacking::Bytes(Rc::new(bytes)))),
        }
    }

    /// A handle onto a stored blob that has not been read yet.
    pub(crate) fn pending(table: &str, column: &str, id: i64) -> Self {
        BinaryValue {
            backing: Rc::new(RefCell::new(BinaryBacking::Pending {
                table: table.to_string(),
                column: column.to_string(),
                id,
            })),
        }
    }

    /// The bytes, if already materialized.
    pub fn bytes_cached(&self) -> Option<Rc<Vec<u8>>> {
        match &*self.backing.borrow() {
            BinaryBacking::Bytes(b) => Some(Rc::clone(b)),
            BinaryBacking::Pending { .. } => None,
        }
    }

    /// Materialize the bytes, fetching the column on first access.
    pub fn bytes(&self, conn: &Connection) -> Result<Rc<Vec<u8>>> {
        let fetched = match &*self.backing.borrow() {
            BinaryBacking::Bytes(b) => return Ok(Rc::clone(b)),
            BinaryBacking::Pending { table, column, id } => {
                let sql = format!("SELECT {column} FROM {table} WHERE id = ?1");
                let bytes: Option<Vec<u8>> =
                    conn.query_row(&sql, [id], |row| row.get(0))?;
                Rc::new(bytes.unwrap_or_default())
            }
        };
        *self.backing.borrow_mut() = BinaryBacking::Bytes(Rc::clone(&fetched));
        Ok(fetched)
    }

    /// A replayable reader over the materialized bytes.
    pub fn reader(&self, conn: &Connection) -> Result<std::io::Cursor<Vec<u8>>> {
        Ok(std::io::Cursor::new(self.bytes(conn)?.as_ref().clone()))
    }
}

impl std::fmt::Debug for BinaryValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.backing.borrow() {
            BinaryBacking::Bytes(b) => write!(f, "BinaryValue({} bytes)", b.len()),
            BinaryBacking::Pending { table, column, id } => {
                write!(f, "BinaryValue(pending {table}.{column}#{id})")
            }
        }
    }
}

impl PartialEq for BinaryValue {
    fn eq(&self, other: &Self) -> bool {
        match (self.bytes_cached(), other.bytes_cached()) {
            (Some(a), Some(b)) => a == b,
            _ => Rc::ptr_eq(&self.backing, &other.backing),
        }
    }
}

/// One attribute value. References hold context-local record handles;
/// inverse attributes hold a collection of them.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Decimal(f64),
    Boolean(bool),
    Date(DateTime<Utc>),
    Binary(BinaryValue),
    Json(serde_json::Value),
    Ref(RecordRef),
    RefList(Vec<RecordRef>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Decimal(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_record_ref(&self) -> Option<RecordRef> {
        match self {
            Value::Ref(r) => Some(*r),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// A runtime instance of a Type.
#[derive(Debug)]
pub struct Record {
    ctx_ref: RecordRef,
    type_name: String,
    id: Option<i64>,
    values: BTreeMap<String, Value>,
    dirty: bool,
    state: RecordState,
    /// False while this is a placeholder created to satisfy the identity
    /// map before its row has been read.
    loaded: bool,
}

impl Record {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// This record's handle within its context.
    pub fn ctx_ref(&self) -> RecordRef {
        self.ctx_ref
    }

    /// Stable cache-path key, used by invalidation traversals as the
    /// visited-set key for cycle tolerance.
    pub fn cache_path(&self) -> String {
        match self.id {
            Some(id) => format!("{}/{}", self.type_name, id),
            None => format!("{}/@{}", self.type_name, self.ctx_ref.0),
        }
    }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.values.get(attribute)
    }

    pub fn set(&mut self, attribute: impl Into<String>, value: Value) {
        self.values.insert(attribute.into(), value);
        self.dirty = true;
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub(crate) fn set_quiet(&mut self, attribute: impl Into<String>, value: Value) {
        self.values.insert(attribute.into(), value);
    }

    pub(crate) fn assign_id(&mut self, id: i64) {
        self.id = Some(id);
        self.state = RecordState::Persisted;
        self.loaded = true;
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub(crate) fn mark_loaded(&mut self) {
        self.loaded = true;
        self.dirty = false;
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.state = RecordState::Deleted;
    }
}

struct ContextInner {
    next_ref: u64,
    records: HashMap<RecordRef, RecordHandle>,
    by_key: HashMap<(String, i64), RecordRef>,
}

/// An identity map scoping a set of records to one unit of work. At most
/// one `Record` instance exists per logical row per context, which is what
/// makes cyclic reference graphs representable. Not thread-safe by
/// contract; one context per transaction/request.
pub struct RecordContext {
    inner: RefCell<ContextInner>,
}

impl RecordContext {
    pub fn new() -> Self {
        RecordContext {
            inner: RefCell::new(ContextInner {
                next_ref: 1,
                records: HashMap::new(),
                by_key: HashMap::new(),
            }),
        }
    }

    /// Create a fresh transient record of the given type.
    pub fn create(&self, type_name: impl Into<String>) -> RecordHandle {
        let mut inner = self.inner.borrow_mut();
        let ctx_ref = RecordRef(inner.next_ref);
        inner.next_ref += 1;
        let handle = Rc::new(RefCell::new(Record {
            ctx_ref,
            type_name: type_name.into(),
            id: None,
            values: BTreeMap::new(),
            dirty: false,
            state: RecordState::Transient,
            loaded: true,
        }));
        inner.records.insert(ctx_ref, Rc::clone(&handle));
        handle
    }

    /// Resolve (type, id) to its unique record instance, creating an
    /// unloaded placeholder when the row has not been read yet.
    pub fn resolve(&self, type_name: &str, id: i64) -> RecordHandle {
        let mut inner = self.inner.borrow_mut();
        let key = (type_name.to_string(), id);
        if let Some(ctx_ref) = inner.by_key.get(&key) {
            return Rc::clone(&inner.records[ctx_ref]);
        }
        let ctx_ref = RecordRef(inner.next_ref);
        inner.next_ref += 1;
        let handle = Rc::new(RefCell::new(Record {
            ctx_ref,
            type_name: type_name.to_string(),
            id: Some(id),
            values: BTreeMap::new(),
            dirty: false,
            state: RecordState::Persisted,
            loaded: false,
        }));
        inner.records.insert(ctx_ref, Rc::clone(&handle));
        inner.by_key.insert(key, ctx_ref);
        handle
    }

    /// Look up a record by its context handle.
    pub fn get(&self, ctx_ref: RecordRef) -> Option<RecordHandle> {
        self.inner.borrow().records.get(&ctx_ref).map(Rc::clone)
    }

    pub fn get_or_err(&self, ctx_ref: RecordRef) -> Result<RecordHandle> {
        self.get(ctx_ref).ok_or_else(|| {
            LoamError::RecordState("reference points outside its record context".into())
        })
    }

    /// Look up the loaded record for (type, id) without creating one.
    pub fn lookup(&self, type_name: &str, id: i64) -> Option<RecordHandle> {
        let inner = self.inner.borrow();
        inner
            .by_key
            .get(&(type_name.to_string(), id))
            .map(|r| Rc::clone(&inner.records[r]))
    }

    /// Register a just-persisted record under its new (type, id) key.
    pub(crate) fn adopt(&self, handle: &RecordHandle) {
        let record = handle.borrow();
        if let Some(id) = record.id {
            self.inner
                .borrow_mut()
                .by_key
                .insert((record.type_name.clone(), id), record.ctx_ref);
        }
    }

    /// Number of records owned by this context.
    pub fn len(&self) -> usize {
        self.inner.borrow().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().records.is_empty()
    }
}

impl Default for RecordContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_map_returns_same_instance() {
        let ctx = RecordContext::new();
        let first = ctx.resolve("Foo", 7);
        let second = ctx.resolve("Foo", 7);
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn distinct_ids_get_distinct_records() {
        let ctx = RecordContext::new();
        let a = ctx.resolve("Foo", 1);
        let b = ctx.resolve("Foo", 2);
        assert!(!Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn placeholder_is_unloaded_until_populated() {
        let ctx = RecordContext::new();
        let rec = ctx.resolve("Foo", 3);
        assert!(!rec.borrow().is_loaded());
        assert_eq!(rec.borrow().state(), RecordState::Persisted);
        rec.borrow_mut().mark_loaded();
        assert!(rec.borrow().is_loaded());
    }

    #[test]
    fn transient_record_adopted_after_id_assignment() {
        let ctx = RecordContext::new();
        let rec = ctx.create("Foo");
        assert_eq!(rec.borrow().state(), RecordState::Transient);
        assert!(rec.borrow().id().is_none());

        rec.borrow_mut().assign_id(42);
        ctx.adopt(&rec);

        let resolved = ctx.resolve("Foo", 42);
        assert!(Rc::ptr_eq(&rec, &resolved));
    }

    #[test]
    fn cyclic_references_resolve_through_context() {
        let ctx = RecordContext::new();
        let a = ctx.resolve("Foo", 1);
        let b = ctx.resolve("Foo", 2);

        let a_ref = a.borrow().ctx_ref();
        let b_ref = b.borrow().ctx_ref();
        a.borrow_mut().set("refFoo", Value::Ref(b_ref));
        b.borrow_mut().set("refFoo", Value::Ref(a_ref));

        // Walk a -> b -> a and land on the identical instance.
        let via_b = {
            let b_handle = ctx.get(a.borrow().get("refFoo").unwrap().as_record_ref().unwrap());
            let b_handle = b_handle.unwrap();
            let back = b_handle.borrow().get("refFoo").unwrap().as_record_ref().unwrap();
            ctx.get(back).unwrap()
        };
        assert!(Rc::ptr_eq(&a, &via_b));
    }

    #[test]
    fn set_marks_dirty() {
        let ctx = RecordContext::new();
        let rec = ctx.create("Foo");
        assert!(!rec.borrow().is_dirty());
        rec.borrow_mut().set("value", Value::String("x".into()));
        assert!(rec.borrow().is_dirty());
        rec.borrow_mut().mark_clean();
        assert!(!rec.borrow().is_dirty());
    }

    #[test]
    fn binary_value_caches_and_replays() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, payload BLOB)")
            .unwrap();
        conn.execute(
            "INSERT INTO t (id, payload) VALUES (1, ?1)",
            [vec![9u8, 8, 7]],
        )
        .unwrap();

        let bin = BinaryValue::pending("t", "payload", 1);
        assert!(bin.bytes_cached().is_none());
        assert_eq!(*bin.bytes(&conn).unwrap(), vec![9, 8, 7]);
        // Replayable: second read comes from the cache.
        assert_eq!(*bin.bytes(&conn).unwrap(), vec![9, 8, 7]);
        assert!(bin.bytes_cached().is_some());

        use std::io::Read;
        let mut reader = bin.reader(&conn).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, vec![9, 8, 7]);
    }

    #[test]
    fn cache_path_is_stable() {
        let ctx = RecordContext::new();
        let rec = ctx.resolve("Foo", 12);
        assert_eq!(rec.borrow().cache_path(), "Foo/12");
    }
}
