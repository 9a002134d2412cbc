//! Persistence event hooks. Mutations schedule Persist/Merge/Delete
//! notices as plain data inside their transaction; the queue is drained in
//! scheduled order only after the underlying commit succeeds. Rolled-back
//! transactions never dispatch.

use crate::error::Result;
use crate::record::{RecordContext, RecordHandle, Value};
use crate::schema::{AttributeKind, Schema};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A record was inserted.
    Persist,
    /// A record was updated.
    Merge,
    /// A record was deleted.
    Delete,
}

/// One scheduled notification.
pub struct PersistenceEvent {
    pub kind: EventKind,
    pub record: RecordHandle,
}

/// Listeners are registered per type name and invoked synchronously on the
/// committing thread, after the commit.
pub trait PersistenceListener: Send + Sync {
    fn on_event(&self, event: &PersistenceEvent);
}

struct ListenerInner {
    by_type: HashMap<String, Vec<Arc<dyn PersistenceListener>>>,
    /// Schemas currently attached to the fan-out.
    deployed: HashSet<String>,
}

/// Registry of persistence listeners. Mutated rarely (deployment and
/// teardown), read on every commit; mutation takes the write lock,
/// dispatch snapshots under the read lock and invokes outside it.
pub struct ListenerRegistry {
    inner: RwLock<ListenerInner>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        ListenerRegistry {
            inner: RwLock::new(ListenerInner {
                by_type: HashMap::new(),
                deployed: HashSet::new(),
            }),
        }
    }

    pub fn register(&self, type_name: impl Into<String>, listener: Arc<dyn PersistenceListener>) {
        let mut inner = self.inner.write().expect("listener registry poisoned");
        inner.by_type.entry(type_name.into()).or_default().push(listener);
    }

    pub fn unregister_type(&self, type_name: &str) {
        let mut inner = self.inner.write().expect("listener registry poisoned");
        inner.by_type.remove(type_name);
    }

    /// Attach a schema's engine to the fan-out.
    pub fn deploy(&self, schema_name: impl Into<String>) {
        let mut inner = self.inner.write().expect("listener registry poisoned");
        inner.deployed.insert(schema_name.into());
    }

    /// Detach; subsequent commits under this schema dispatch nothing.
    pub fn undeploy(&self, schema_name: &str) {
        let mut inner = self.inner.write().expect("listener registry poisoned");
        inner.deployed.remove(schema_name);
    }

    pub fn is_deployed(&self, schema_name: &str) -> bool {
        self.inner
            .read()
            .expect("listener registry poisoned")
            .deployed
            .contains(schema_name)
    }

    /// Deliver drained notices in scheduled order. Listener snapshots are
    /// taken under the read lock and invoked after it is released, so a
    /// listener may re-enter the registry.
    pub(crate) fn dispatch(&self, schema_name: &str, notices: &[PersistenceEvent]) {
        for notice in notices {
            let listeners: Vec<Arc<dyn PersistenceListener>> = {
                let inner = self.inner.read().expect("listener registry poisoned");
                if !inner.deployed.contains(schema_name) {
                    log::debug!(
                        "dropping {:?} notice: schema '{schema_name}' is not deployed",
                        notice.kind
                    );
                    continue;
                }
                let type_name = notice.record.borrow().type_name().to_string();
                inner.by_type.get(&type_name).cloned().unwrap_or_default()
            };
            for listener in listeners {
                listener.on_event(notice);
            }
        }
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer side of the cache-invalidation contract: `invalidate` is
/// called once per reachable record, `link` once per inverse back-edge.
pub trait InvalidationSink {
    fn invalidate(&mut self, cache_path: &str, record: &RecordHandle);

    /// An inverse attribute of the record at `from_path` points back at
    /// `referencing`. Linked, not recursed into: a later mutation of the
    /// referencing side invalidates the referenced side without another
    /// full graph walk.
    fn link(&mut self, from_path: &str, referencing: &RecordHandle);
}

/// Walk a mutated record's graph for cache invalidation: recurse through
/// every non-virtual, non-inverse reference attribute, bounded by a
/// visited set keyed on the stable cache-path string (cycle tolerance);
/// link each record referencing through an inverse attribute.
pub fn traverse_for_invalidation(
    schema: &Schema,
    ctx: &RecordContext,
    record: &RecordHandle,
    sink: &mut dyn InvalidationSink,
) -> Result<()> {
    let mut visited = HashSet::new();
    traverse_inner(schema, ctx, record, sink, &mut visited)
}

fn traverse_inner(
    schema: &Schema,
    ctx: &RecordContext,
    record: &RecordHandle,
    sink: &mut dyn InvalidationSink,
    visited: &mut HashSet<String>,
) -> Result<()> {
    let cache_path = record.borrow().cache_path();
    if !visited.insert(cache_path.clone()) {
        return Ok(());
    }
    sink.invalidate(&cache_path, record);

    let type_name = record.borrow().type_name().to_string();
    let attributes: Vec<_> = schema
        .effective_attributes(&type_name)?
        .into_iter()
        .cloned()
        .collect();

    for attr in attributes {
        match &attr.kind {
            AttributeKind::TypeRef { .. } | AttributeKind::MixinRef { .. } => {
                if attr.is_virtual {
                    continue;
                }
                let target = match record.borrow().get(&attr.name) {
                    Some(Value::Ref(r)) => ctx.get(*r),
                    _ => None,
                };
                if let Some(target) = target {
                    traverse_inner(schema, ctx, &target, sink, visited)?;
                }
            }
            AttributeKind::Inverse { .. } => {
                let referencing: Vec<RecordHandle> = match record.borrow().get(&attr.name) {
                    Some(Value::RefList(refs)) => {
                        refs.iter().filter_map(|r| ctx.get(*r)).collect()
                    }
                    _ => Vec::new(),
                };
                for referencing_record in referencing {
                    sink.link(&cache_path, &referencing_record);
                }
            }
            _ => {}
        }
    }
    Ok(())
}
