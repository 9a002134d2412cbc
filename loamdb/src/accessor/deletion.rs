//! Deletion strategies. The accessor consults a per-type strategy before
//! removing a row; types opt into custom cascade semantics by registering
//! a strategy under their name, without the accessor changing.

use crate::accessor::Transaction;
use crate::error::{LoamError, Result};
use crate::record::{RecordContext, RecordHandle};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub trait DeletionStrategy: Send + Sync {
    fn delete(
        &self,
        tx: &mut Transaction<'_>,
        record: &RecordHandle,
        ctx: &RecordContext,
    ) -> Result<()>;
}

/// The accessor's own behavior: referencing records whose relation carries
/// an `on-delete: cascade` annotation are deleted first; any other
/// referencing record blocks the deletion.
pub struct DefaultDeletionStrategy;

impl DeletionStrategy for DefaultDeletionStrategy {
    fn delete(
        &self,
        tx: &mut Transaction<'_>,
        record: &RecordHandle,
        ctx: &RecordContext,
    ) -> Result<()> {
        let referencing = tx.referencing_records(record, ctx)?;

        for (referencing_record, attr) in &referencing {
            if attr.annotation("on-delete") != Some("cascade") {
                let (type_name, id) = {
                    let r = record.borrow();
                    (r.type_name().to_string(), r.id().unwrap_or(-1))
                };
                let blocker = referencing_record.borrow();
                return Err(LoamError::DeletionRestricted {
                    type_name,
                    id,
                    reason: format!(
                        "still referenced by {}/{} through '{}'",
                        blocker.type_name(),
                        blocker.id().unwrap_or(-1),
                        attr.name
                    ),
                });
            }
        }

        for (referencing_record, _) in referencing {
            tx.delete(&referencing_record, ctx)?;
        }
        tx.delete_row(record)
    }
}

/// Refuse whenever any referencing record exists.
pub struct RestrictDeletionStrategy;

impl DeletionStrategy for RestrictDeletionStrategy {
    fn delete(
        &self,
        tx: &mut Transaction<'_>,
        record: &RecordHandle,
        ctx: &RecordContext,
    ) -> Result<()> {
        let referencing = tx.referencing_records(record, ctx)?;
        if let Some((blocker, attr)) = referencing.first() {
            let (type_name, id) = {
                let r = record.borrow();
                (r.type_name().to_string(), r.id().unwrap_or(-1))
            };
            let blocker = blocker.borrow();
            return Err(LoamError::DeletionRestricted {
                type_name,
                id,
                reason: format!(
                    "still referenced by {}/{} through '{}'",
                    blocker.type_name(),
                    blocker.id().unwrap_or(-1),
                    attr.name
                ),
            });
        }
        tx.delete_row(record)
    }
}

/// Delete every referencing record first (children before parent),
/// recursively through each child's own strategy.
pub struct CascadeDeletionStrategy;

impl DeletionStrategy for CascadeDeletionStrategy {
    fn delete(
        &self,
        tx: &mut Transaction<'_>,
        record: &RecordHandle,
        ctx: &RecordContext,
    ) -> Result<()> {
        for (referencing_record, _) in tx.referencing_records(record, ctx)? {
            tx.delete(&referencing_record, ctx)?;
        }
        tx.delete_row(record)
    }
}

/// Resolves strategies by type name, delegating to the default when a type
/// never registered its own. Writes are rare (deployment/teardown) and
/// take the write lock; resolution is a read-locked lookup.
pub struct DeletionStrategyRegistry {
    by_type: RwLock<HashMap<String, Arc<dyn DeletionStrategy>>>,
    default_strategy: Arc<dyn DeletionStrategy>,
}

impl DeletionStrategyRegistry {
    pub fn new() -> Self {
        DeletionStrategyRegistry {
            by_type: RwLock::new(HashMap::new()),
            default_strategy: Arc::new(DefaultDeletionStrategy),
        }
    }

    pub fn register(&self, type_name: impl Into<String>, strategy: Arc<dyn DeletionStrategy>) {
        self.by_type
            .write()
            .expect("deletion registry poisoned")
            .insert(type_name.into(), strategy);
    }

    pub fn unregister(&self, type_name: &str) {
        self.by_type
            .write()
            .expect("deletion registry poisoned")
            .remove(type_name);
    }

    pub fn resolve(&self, type_name: &str) -> Arc<dyn DeletionStrategy> {
        self.by_type
            .read()
            .expect("deletion registry poisoned")
            .get(type_name)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default_strategy))
    }
}

impl Default for DeletionStrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
