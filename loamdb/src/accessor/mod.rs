//! The accessor: CRUD orchestration, cascading, deletion-strategy
//! dispatch, query execution and the query-by-example builder.

pub mod deletion;
pub mod example;

pub use deletion::{
    CascadeDeletionStrategy, DefaultDeletionStrategy, DeletionStrategy, DeletionStrategyRegistry,
    RestrictDeletionStrategy,
};
pub use example::ExampleQuery;

use crate::driver::{SqlArg, SqliteAdapter, VendorAdapter};
use crate::error::{LoamError, Result};
use crate::events::{EventKind, ListenerRegistry, PersistenceEvent};
use crate::mediator::{mediator_for, CipherProvider, MediatorCx, NoopCipher};
use crate::nquery;
use crate::record::{RecordContext, RecordHandle, RecordRef, RecordState, Value};
use crate::schema::{Attribute, AttributeKind, Schema};
use crate::table::{self, JoinTable, TableRegistry, UniqueConstraintTable};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

/// The persistence engine for one schema: owns the connection, the table
/// registry and the listener/strategy registries. One logical transaction
/// at a time per engine; open one engine per concurrent caller.
pub struct Engine {
    schema: Arc<Schema>,
    registry: Option<Arc<TableRegistry>>,
    conn: Connection,
    adapter: Box<dyn VendorAdapter>,
    cipher: Box<dyn CipherProvider>,
    listeners: Arc<ListenerRegistry>,
    deletion_strategies: Arc<DeletionStrategyRegistry>,
}

impl Engine {
    /// Open an engine over a database file.
    pub fn open(path: &Path, schema: Schema) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self::with_connection(conn, schema))
    }

    /// In-memory engine, mainly for tests.
    pub fn open_in_memory(schema: Schema) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::with_connection(conn, schema))
    }

    fn with_connection(conn: Connection, schema: Schema) -> Self {
        Engine {
            schema: Arc::new(schema),
            registry: None,
            conn,
            adapter: Box::new(SqliteAdapter),
            cipher: Box::new(NoopCipher),
            listeners: Arc::new(ListenerRegistry::new()),
            deletion_strategies: Arc::new(DeletionStrategyRegistry::new()),
        }
    }

    pub fn with_cipher(mut self, cipher: Box<dyn CipherProvider>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn with_adapter(mut self, adapter: Box<dyn VendorAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn deletion_strategies(&self) -> &DeletionStrategyRegistry {
        &self.deletion_strategies
    }

    pub(crate) fn registry(&self) -> Result<&TableRegistry> {
        self.registry
            .as_deref()
            .ok_or_else(|| LoamError::Schema("engine is not deployed".into()))
    }

    /// Validate the schema, compile the table registry and create missing
    /// tables and indexes. Idempotent: existing objects are left alone
    /// (checked through the vendor adapter). Attaches the schema to the
    /// listener fan-out.
    pub fn deploy(&mut self) -> Result<()> {
        self.schema.validate()?;
        let registry = TableRegistry::build(&self.schema)?;

        for t in registry.all_tables() {
            if !self.adapter.table_exists(&self.conn, &t.name)? {
                log::debug!("creating table {}", t.name);
                self.conn.execute_batch(&t.create_sql(self.adapter.as_ref()))?;
            }
        }
        for index in registry.indexes() {
            if !self.adapter.index_exists(&self.conn, &index.table, &index.name)? {
                self.conn.execute_batch(&index.create_sql())?;
            }
        }

        self.registry = Some(Arc::new(registry));
        self.listeners.deploy(self.schema.name.clone());
        log::info!(
            "deployed schema '{}' ({} types, {} mixins)",
            self.schema.name,
            self.schema.types.len(),
            self.schema.mixins.len()
        );
        Ok(())
    }

    /// Detach from the listener fan-out. Tables stay in place.
    pub fn undeploy(&mut self) {
        self.listeners.undeploy(&self.schema.name);
        self.registry = None;
        log::info!("undeployed schema '{}'", self.schema.name);
    }

    pub fn is_deployed(&self) -> bool {
        self.registry.is_some()
    }

    /// Begin a transaction. The engine stays exclusively borrowed until
    /// the transaction commits, rolls back or drops (drop rolls back).
    pub fn begin(&mut self) -> Result<Transaction<'_>> {
        self.registry()?;
        self.conn.execute_batch("BEGIN")?;
        Ok(Transaction {
            engine: self,
            notices: Vec::new(),
            inserted: HashSet::new(),
            deleting: HashSet::new(),
            finished: false,
        })
    }

    /// Row counts per deployed type table.
    pub fn status(&self) -> Result<serde_json::Value> {
        let registry = self.registry()?;
        let mut counts = serde_json::Map::new();
        for tt in registry.type_tables() {
            let count: i64 = self.conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", tt.table.name),
                [],
                |row| row.get(0),
            )?;
            counts.insert(tt.type_name.clone(), serde_json::json!(count));
        }
        Ok(serde_json::json!({
            "schema": self.schema.name,
            "namespace": self.schema.namespace,
            "types": counts,
        }))
    }
}

/// A cascaded insert that re-entered a record already being inserted
/// (cyclic transient graph). The FK was written as NULL and is patched
/// once the whole cascade has assigned ids.
struct Fixup {
    owner: RecordRef,
    attr: Attribute,
}

/// One logical unit of work. All mutations schedule their notifications
/// here; `commit` drains them to the listener registry in scheduled order,
/// `rollback` (or drop) discards them.
pub struct Transaction<'e> {
    engine: &'e Engine,
    notices: Vec<PersistenceEvent>,
    inserted: HashSet<(String, i64)>,
    deleting: HashSet<RecordRef>,
    finished: bool,
}

impl<'e> Transaction<'e> {
    pub(crate) fn conn(&self) -> &Connection {
        &self.engine.conn
    }

    pub(crate) fn schema(&self) -> &Schema {
        &self.engine.schema
    }

    pub(crate) fn registry(&self) -> Result<&TableRegistry> {
        self.engine.registry()
    }

    pub(crate) fn mediator_cx<'x>(
        &'x self,
        ctx: &'x RecordContext,
        owner_type: &'x str,
        owner_id: Option<i64>,
    ) -> Result<MediatorCx<'x>> {
        Ok(MediatorCx {
            schema: &self.engine.schema,
            registry: self.engine.registry()?,
            ctx,
            conn: &self.engine.conn,
            cipher: self.engine.cipher.as_ref(),
            owner_type,
            owner_id,
        })
    }

    // ── Insert ───────────────────────────────────────────────────

    /// Persist a transient record. Referenced records must already be
    /// persisted; a transient reference is a constraint failure.
    pub fn insert(&mut self, record: &RecordHandle, ctx: &RecordContext) -> Result<i64> {
        self.insert_inner(record, ctx, false)
    }

    /// Persist a transient record, first persisting any transient records
    /// it references, recursively. Cyclic transient graphs are handled by
    /// deferring the back-edge and patching it after the cascade.
    pub fn insert_cascaded(&mut self, record: &RecordHandle, ctx: &RecordContext) -> Result<i64> {
        self.insert_inner(record, ctx, true)
    }

    fn insert_inner(
        &mut self,
        record: &RecordHandle,
        ctx: &RecordContext,
        cascade: bool,
    ) -> Result<i64> {
        let mut visiting = Vec::new();
        let mut fixups = Vec::new();
        let id = self.insert_record(record, ctx, cascade, &mut visiting, &mut fixups)?;
        self.apply_fixups(ctx, fixups)?;
        Ok(id)
    }

    fn insert_record(
        &mut self,
        record: &RecordHandle,
        ctx: &RecordContext,
        cascade: bool,
        visiting: &mut Vec<RecordRef>,
        fixups: &mut Vec<Fixup>,
    ) -> Result<i64> {
        let (type_name, state, my_ref) = {
            let r = record.borrow();
            (r.type_name().to_string(), r.state(), r.ctx_ref())
        };
        if state != RecordState::Transient {
            return Err(LoamError::RecordState(format!(
                "insert expects a transient record, got {state:?} ({type_name})"
            )));
        }
        let t = self
            .schema()
            .type_by_name(&type_name)
            .ok_or_else(|| LoamError::Schema(format!("Unknown type '{type_name}'")))?;
        if t.is_abstract {
            return Err(LoamError::Constraint(format!(
                "cannot insert abstract type '{type_name}'"
            )));
        }
        let attrs: Vec<Attribute> = self
            .schema()
            .effective_attributes(&type_name)?
            .into_iter()
            .cloned()
            .collect();
        let values = record.borrow().values().clone();

        self.check_mandatory(&type_name, &attrs, &values)?;

        visiting.push(my_ref);
        let mut deferred: HashSet<String> = HashSet::new();
        for attr in attrs.iter().filter(|a| a.is_reference() && a.is_persisted()) {
            let Some(Value::Ref(r)) = values.get(&attr.name) else {
                continue;
            };
            let target = ctx.get_or_err(*r)?;
            let (target_state, target_ref) = {
                let t = target.borrow();
                (t.state(), t.ctx_ref())
            };
            match target_state {
                RecordState::Persisted => {}
                RecordState::Deleted => {
                    visiting.pop();
                    return Err(LoamError::Constraint(format!(
                        "attribute '{}' references a deleted record",
                        attr.name
                    )));
                }
                RecordState::Transient => {
                    if !cascade {
                        visiting.pop();
                        return Err(LoamError::Constraint(format!(
                            "attribute '{}' references a non-persisted record; \
                             persist it first or insert cascaded",
                            attr.name
                        )));
                    }
                    if visiting.contains(&target_ref) {
                        // Cycle through transient records: defer this edge.
                        deferred.insert(attr.name.clone());
                        fixups.push(Fixup {
                            owner: my_ref,
                            attr: attr.clone(),
                        });
                    } else {
                        let result = self.insert_record(&target, ctx, true, visiting, fixups);
                        if result.is_err() {
                            visiting.pop();
                        }
                        result?;
                    }
                }
            }
        }
        visiting.pop();

        // Build the row, one prepared attribute at a time.
        let mcx = self.mediator_cx(ctx, &type_name, None)?;
        let mut columns: Vec<String> = Vec::new();
        let mut args: Vec<SqlArg> = Vec::new();
        let mut join_writes: Vec<(String, Vec<(String, SqlArg)>)> = Vec::new();
        for attr in attrs.iter().filter(|a| a.is_persisted()) {
            let value = if deferred.contains(&attr.name) {
                Value::Null
            } else {
                values.get(&attr.name).cloned().unwrap_or(Value::Null)
            };
            let prepared = mediator_for(&attr.kind).prepare(&value, attr, &mcx)?;
            if matches!(attr.kind, AttributeKind::MixinRef { .. }) {
                if !value.is_null() {
                    let join = mcx.registry.join_table(&type_name, &attr.name)?;
                    join_writes.push((join.table.name.clone(), prepared));
                }
            } else {
                for (column, arg) in prepared {
                    columns.push(column);
                    args.push(arg);
                }
            }
        }
        drop(mcx);

        let table_name = self.registry()?.type_table(&type_name)?.table.name.clone();
        let sql = if columns.is_empty() {
            format!("INSERT INTO {table_name} DEFAULT VALUES")
        } else {
            let placeholders: Vec<&str> = columns.iter().map(|_| "?").collect();
            format!(
                "INSERT INTO {table_name} ({}) VALUES ({})",
                columns.join(", "),
                placeholders.join(", ")
            )
        };
        self.conn().execute(&sql, params_from_iter(args))?;
        let id = self.conn().last_insert_rowid();

        {
            let mut r = record.borrow_mut();
            r.assign_id(id);
            r.mark_clean();
        }
        ctx.adopt(record);

        for (join_table, pairs) in join_writes {
            let sql = format!(
                "INSERT INTO {join_table} ({}, {}, {}) VALUES (?1, ?2, ?3)",
                JoinTable::OWNER,
                JoinTable::TARGET_TYPE,
                JoinTable::TARGET_ID
            );
            let mut write_args = vec![SqlArg::Integer(id)];
            write_args.extend(pairs.into_iter().map(|(_, a)| a));
            self.conn().execute(&sql, params_from_iter(write_args))?;
        }

        self.write_unique_rows(ctx, &type_name, id, &attrs, &values, &deferred)?;

        self.inserted.insert((type_name, id));
        self.notices.push(PersistenceEvent {
            kind: EventKind::Persist,
            record: Rc::clone(record),
        });
        Ok(id)
    }

    fn apply_fixups(&mut self, ctx: &RecordContext, fixups: Vec<Fixup>) -> Result<()> {
        for fixup in fixups {
            let owner = ctx.get_or_err(fixup.owner)?;
            let (type_name, id, value) = {
                let r = owner.borrow();
                let id = r.id().ok_or_else(|| {
                    LoamError::RecordState("deferred reference owner was never persisted".into())
                })?;
                (
                    r.type_name().to_string(),
                    id,
                    r.get(&fixup.attr.name).cloned().unwrap_or(Value::Null),
                )
            };
            let mcx = self.mediator_cx(ctx, &type_name, Some(id))?;
            let prepared = mediator_for(&fixup.attr.kind).prepare(&value, &fixup.attr, &mcx)?;
            drop(mcx);

            match &fixup.attr.kind {
                AttributeKind::MixinRef { .. } => {
                    let join = self
                        .registry()?
                        .join_table(&type_name, &fixup.attr.name)?
                        .table
                        .name
                        .clone();
                    let sql = format!(
                        "INSERT INTO {join} ({}, {}, {}) VALUES (?1, ?2, ?3)",
                        JoinTable::OWNER,
                        JoinTable::TARGET_TYPE,
                        JoinTable::TARGET_ID
                    );
                    let mut args = vec![SqlArg::Integer(id)];
                    args.extend(prepared.into_iter().map(|(_, a)| a));
                    self.conn().execute(&sql, params_from_iter(args))?;
                }
                _ => {
                    let table_name =
                        self.registry()?.type_table(&type_name)?.table.name.clone();
                    let sets: Vec<String> =
                        prepared.iter().map(|(c, _)| format!("{c} = ?")).collect();
                    let sql = format!(
                        "UPDATE {table_name} SET {} WHERE id = ?",
                        sets.join(", ")
                    );
                    let mut args: Vec<SqlArg> =
                        prepared.into_iter().map(|(_, a)| a).collect();
                    args.push(SqlArg::Integer(id));
                    self.conn().execute(&sql, params_from_iter(args))?;
                }
            }

            // The patched value may participate in a unique constraint.
            let attrs: Vec<Attribute> = self
                .schema()
                .effective_attributes(&type_name)?
                .into_iter()
                .cloned()
                .collect();
            let covered = self
                .schema()
                .effective_unique_constraints(&type_name)?
                .iter()
                .any(|(_, c)| c.attributes.contains(&fixup.attr.name));
            if covered {
                let values = owner.borrow().values().clone();
                self.delete_unique_rows(&type_name, id)?;
                self.write_unique_rows(ctx, &type_name, id, &attrs, &values, &HashSet::new())?;
            }
        }
        Ok(())
    }

    fn check_mandatory(
        &self,
        type_name: &str,
        attrs: &[Attribute],
        values: &std::collections::BTreeMap<String, Value>,
    ) -> Result<()> {
        for attr in attrs.iter().filter(|a| a.mandatory && a.is_persisted()) {
            let present = values.get(&attr.name).map(|v| !v.is_null()).unwrap_or(false);
            if !present {
                return Err(LoamError::Constraint(format!(
                    "mandatory attribute '{}' of type '{type_name}' is not set",
                    attr.name
                )));
            }
        }
        Ok(())
    }

    // ── Unique constraint side tables ────────────────────────────

    fn write_unique_rows(
        &self,
        ctx: &RecordContext,
        type_name: &str,
        id: i64,
        attrs: &[Attribute],
        values: &std::collections::BTreeMap<String, Value>,
        deferred: &HashSet<String>,
    ) -> Result<()> {
        for (declaring, constraint) in self.schema().effective_unique_constraints(type_name)? {
            let uq = self
                .registry()?
                .constraint_table(&declaring.name, &constraint.name)?;
            let mcx = self.mediator_cx(ctx, type_name, Some(id))?;

            let mut columns: Vec<String> = Vec::new();
            let mut args: Vec<SqlArg> = Vec::new();
            for attr_name in &constraint.attributes {
                let attr = attrs
                    .iter()
                    .find(|a| &a.name == attr_name)
                    .ok_or_else(|| {
                        LoamError::Schema(format!(
                            "constraint '{}' names unknown attribute '{attr_name}'",
                            constraint.name
                        ))
                    })?;
                let value = if deferred.contains(attr_name) {
                    Value::Null
                } else {
                    values.get(attr_name).cloned().unwrap_or(Value::Null)
                };
                let prepared = mediator_for(&attr.kind).prepare(&value, attr, &mcx)?;
                if matches!(attr.kind, AttributeKind::MixinRef { .. }) {
                    // Join-table column names don't apply here; the
                    // constraint table uses the attribute's own pair.
                    let mut renamed = prepared.into_iter().map(|(_, a)| a);
                    columns.push(table::ref_type_column(attr_name));
                    args.push(renamed.next().unwrap_or(SqlArg::Null));
                    columns.push(table::ref_id_column(attr_name));
                    args.push(renamed.next().unwrap_or(SqlArg::Null));
                } else {
                    for (column, arg) in prepared {
                        columns.push(column);
                        args.push(arg);
                    }
                }
            }
            drop(mcx);

            columns.push(UniqueConstraintTable::ROW_TYPE.into());
            args.push(SqlArg::Text(type_name.to_string()));
            columns.push(UniqueConstraintTable::ROW_ID.into());
            args.push(SqlArg::Integer(id));

            let placeholders: Vec<&str> = columns.iter().map(|_| "?").collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                uq.table.name,
                columns.join(", "),
                placeholders.join(", ")
            );
            self.conn()
                .execute(&sql, params_from_iter(args))
                .map_err(|e| unique_violation(e, &constraint.name, type_name))?;
        }
        Ok(())
    }

    fn delete_unique_rows(&self, type_name: &str, id: i64) -> Result<()> {
        for (declaring, constraint) in self.schema().effective_unique_constraints(type_name)? {
            let uq = self
                .registry()?
                .constraint_table(&declaring.name, &constraint.name)?;
            let sql = format!(
                "DELETE FROM {} WHERE {} = ?1 AND {} = ?2",
                uq.table.name,
                UniqueConstraintTable::ROW_TYPE,
                UniqueConstraintTable::ROW_ID
            );
            self.conn()
                .execute(&sql, rusqlite::params![type_name, id])?;
        }
        Ok(())
    }

    // ── Update ───────────────────────────────────────────────────

    /// Write a persisted record's current attribute values back to its
    /// row. Verifies the row still exists.
    pub fn update(&mut self, record: &RecordHandle, ctx: &RecordContext) -> Result<()> {
        self.update_inner(record, ctx, false, true)
    }

    /// Like `update`, but transient references are persisted first.
    pub fn update_cascaded(&mut self, record: &RecordHandle, ctx: &RecordContext) -> Result<()> {
        self.update_inner(record, ctx, true, true)
    }

    /// Update a record known to have been inserted earlier in this
    /// transaction; skips the row-existence check.
    pub fn update_post_persist(
        &mut self,
        record: &RecordHandle,
        ctx: &RecordContext,
    ) -> Result<()> {
        self.update_inner(record, ctx, false, false)
    }

    fn update_inner(
        &mut self,
        record: &RecordHandle,
        ctx: &RecordContext,
        cascade: bool,
        check_exists: bool,
    ) -> Result<()> {
        let (type_name, state, id) = {
            let r = record.borrow();
            (r.type_name().to_string(), r.state(), r.id())
        };
        let id = match (state, id) {
            (RecordState::Persisted, Some(id)) => id,
            (RecordState::Deleted, _) => {
                return Err(LoamError::RecordState(format!(
                    "cannot update deleted record of type '{type_name}'"
                )))
            }
            _ => {
                return Err(LoamError::RecordState(format!(
                    "update expects a persisted record of type '{type_name}'"
                )))
            }
        };
        let table_name = self.registry()?.type_table(&type_name)?.table.name.clone();

        if check_exists {
            let exists: Option<i64> = self
                .conn()
                .query_row(
                    &format!("SELECT 1 FROM {table_name} WHERE id = ?1"),
                    [id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(LoamError::NotFound { type_name, id });
            }
        }

        let attrs: Vec<Attribute> = self
            .schema()
            .effective_attributes(&type_name)?
            .into_iter()
            .cloned()
            .collect();
        let values = record.borrow().values().clone();
        self.check_mandatory(&type_name, &attrs, &values)?;

        // Transient references: persist or refuse, mirroring insert.
        for attr in attrs.iter().filter(|a| a.is_reference() && a.is_persisted()) {
            let Some(Value::Ref(r)) = values.get(&attr.name) else {
                continue;
            };
            let target = ctx.get_or_err(*r)?;
            let target_state = target.borrow().state();
            match target_state {
                RecordState::Persisted => {}
                RecordState::Deleted => {
                    return Err(LoamError::Constraint(format!(
                        "attribute '{}' references a deleted record",
                        attr.name
                    )))
                }
                RecordState::Transient => {
                    if !cascade {
                        return Err(LoamError::Constraint(format!(
                            "attribute '{}' references a non-persisted record; \
                             persist it first or update cascaded",
                            attr.name
                        )));
                    }
                    self.insert_inner(&target, ctx, true)?;
                }
            }
        }

        let mcx = self.mediator_cx(ctx, &type_name, Some(id))?;
        let mut sets: Vec<String> = Vec::new();
        let mut args: Vec<SqlArg> = Vec::new();
        let mut join_writes: Vec<(String, Option<Vec<(String, SqlArg)>>)> = Vec::new();
        for attr in attrs.iter().filter(|a| a.is_persisted()) {
            let value = values.get(&attr.name).cloned().unwrap_or(Value::Null);
            if matches!(attr.kind, AttributeKind::MixinRef { .. }) {
                let join = mcx.registry.join_table(&type_name, &attr.name)?;
                let pairs = if value.is_null() {
                    None
                } else {
                    Some(mediator_for(&attr.kind).prepare(&value, attr, &mcx)?)
                };
                join_writes.push((join.table.name.clone(), pairs));
            } else {
                for (column, arg) in mediator_for(&attr.kind).prepare(&value, attr, &mcx)? {
                    sets.push(format!("{column} = ?"));
                    args.push(arg);
                }
            }
        }
        drop(mcx);

        if !sets.is_empty() {
            let sql = format!(
                "UPDATE {table_name} SET {} WHERE id = ?",
                sets.join(", ")
            );
            args.push(SqlArg::Integer(id));
            self.conn().execute(&sql, params_from_iter(args))?;
        }

        for (join_table, pairs) in join_writes {
            self.conn().execute(
                &format!("DELETE FROM {join_table} WHERE {} = ?1", JoinTable::OWNER),
                [id],
            )?;
            if let Some(pairs) = pairs {
                let sql = format!(
                    "INSERT INTO {join_table} ({}, {}, {}) VALUES (?1, ?2, ?3)",
                    JoinTable::OWNER,
                    JoinTable::TARGET_TYPE,
                    JoinTable::TARGET_ID
                );
                let mut write_args = vec![SqlArg::Integer(id)];
                write_args.extend(pairs.into_iter().map(|(_, a)| a));
                self.conn().execute(&sql, params_from_iter(write_args))?;
            }
        }

        self.delete_unique_rows(&type_name, id)?;
        self.write_unique_rows(ctx, &type_name, id, &attrs, &values, &HashSet::new())?;

        record.borrow_mut().mark_clean();
        self.notices.push(PersistenceEvent {
            kind: EventKind::Merge,
            record: Rc::clone(record),
        });
        Ok(())
    }

    // ── Delete ───────────────────────────────────────────────────

    /// Delete through the type's deletion strategy. Idempotent for
    /// records already deleted in this transaction.
    pub fn delete(&mut self, record: &RecordHandle, ctx: &RecordContext) -> Result<()> {
        let (type_name, state, my_ref) = {
            let r = record.borrow();
            (r.type_name().to_string(), r.state(), r.ctx_ref())
        };
        if state == RecordState::Deleted || self.deleting.contains(&my_ref) {
            return Ok(());
        }
        if state != RecordState::Persisted {
            return Err(LoamError::RecordState(format!(
                "delete expects a persisted record of type '{type_name}'"
            )));
        }

        self.deleting.insert(my_ref);
        let strategy = self.engine.deletion_strategies.resolve(&type_name);
        let result = strategy.delete(self, record, ctx);
        self.deleting.remove(&my_ref);
        result
    }

    /// Records whose relations point at the given record, with the
    /// relation attribute. Records already being deleted in this
    /// transaction are excluded.
    pub fn referencing_records(
        &mut self,
        record: &RecordHandle,
        ctx: &RecordContext,
    ) -> Result<Vec<(RecordHandle, Attribute)>> {
        let (target_type, target_id) = {
            let r = record.borrow();
            let id = r.id().ok_or_else(|| {
                LoamError::RecordState("reference scan requires a persisted record".into())
            })?;
            (r.type_name().to_string(), id)
        };

        let types: Vec<String> = self
            .schema()
            .types
            .iter()
            .filter(|t| !t.is_abstract)
            .map(|t| t.name.clone())
            .collect();

        let mut out: Vec<(RecordHandle, Attribute)> = Vec::new();
        for type_name in types {
            let attrs: Vec<Attribute> = self
                .schema()
                .effective_attributes(&type_name)?
                .into_iter()
                .cloned()
                .collect();
            for attr in attrs
                .into_iter()
                .filter(|a| a.is_reference() && a.is_persisted())
            {
                let can_point_here = self
                    .schema()
                    .reference_implementers(&attr.kind)?
                    .iter()
                    .any(|t| t.name == target_type);
                if !can_point_here {
                    continue;
                }

                let ids: Vec<i64> = match &attr.kind {
                    AttributeKind::TypeRef { .. } => {
                        let table_name =
                            self.registry()?.type_table(&type_name)?.table.name.clone();
                        let sql = format!(
                            "SELECT id FROM {table_name} WHERE {} = ?1 AND {} = ?2 ORDER BY id",
                            table::ref_type_column(&attr.name),
                            table::ref_id_column(&attr.name)
                        );
                        self.collect_ids(&sql, &target_type, target_id)?
                    }
                    AttributeKind::MixinRef { .. } => {
                        let join = self
                            .registry()?
                            .join_table(&type_name, &attr.name)?
                            .table
                            .name
                            .clone();
                        let sql = format!(
                            "SELECT {} FROM {join} WHERE {} = ?1 AND {} = ?2 ORDER BY {}",
                            JoinTable::OWNER,
                            JoinTable::TARGET_TYPE,
                            JoinTable::TARGET_ID,
                            JoinTable::OWNER
                        );
                        self.collect_ids(&sql, &target_type, target_id)?
                    }
                    _ => Vec::new(),
                };

                for id in ids {
                    if type_name == target_type && id == target_id {
                        continue; // self-reference never blocks its own delete
                    }
                    let handle = ctx.resolve(&type_name, id);
                    let skip = {
                        let r = handle.borrow();
                        r.state() == RecordState::Deleted
                            || self.deleting.contains(&r.ctx_ref())
                    };
                    if !skip {
                        out.push((handle, attr.clone()));
                    }
                }
            }
        }
        Ok(out)
    }

    fn collect_ids(&self, sql: &str, target_type: &str, target_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn().prepare(sql)?;
        let mut rows = stmt.query(rusqlite::params![target_type, target_id])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            ids.push(row.get(0)?);
        }
        Ok(ids)
    }

    /// Low-level row removal: the row, its join rows and its unique
    /// constraint rows. Strategies call this after their own checks.
    pub fn delete_row(&mut self, record: &RecordHandle) -> Result<()> {
        let (type_name, id) = {
            let r = record.borrow();
            let id = r.id().ok_or_else(|| {
                LoamError::RecordState("delete expects a persisted record".into())
            })?;
            (r.type_name().to_string(), id)
        };

        self.delete_unique_rows(&type_name, id)?;

        let attrs: Vec<Attribute> = self
            .schema()
            .effective_attributes(&type_name)?
            .into_iter()
            .cloned()
            .collect();
        for attr in attrs
            .iter()
            .filter(|a| matches!(a.kind, AttributeKind::MixinRef { .. }) && a.is_persisted())
        {
            let join = self
                .registry()?
                .join_table(&type_name, &attr.name)?
                .table
                .name
                .clone();
            self.conn().execute(
                &format!("DELETE FROM {join} WHERE {} = ?1", JoinTable::OWNER),
                [id],
            )?;
        }

        let table_name = self.registry()?.type_table(&type_name)?.table.name.clone();
        self.conn()
            .execute(&format!("DELETE FROM {table_name} WHERE id = ?1"), [id])?;

        record.borrow_mut().mark_deleted();
        self.notices.push(PersistenceEvent {
            kind: EventKind::Delete,
            record: Rc::clone(record),
        });
        Ok(())
    }

    // ── Read ─────────────────────────────────────────────────────

    /// Load a record by type and id, honoring the identity map.
    pub fn find(
        &mut self,
        type_name: &str,
        id: i64,
        ctx: &RecordContext,
    ) -> Result<Option<RecordHandle>> {
        self.load(type_name, id, ctx, false)
    }

    pub(crate) fn load(
        &mut self,
        type_name: &str,
        id: i64,
        ctx: &RecordContext,
        eager: bool,
    ) -> Result<Option<RecordHandle>> {
        if let Some(existing) = ctx.lookup(type_name, id) {
            let (state, loaded) = {
                let r = existing.borrow();
                (r.state(), r.is_loaded())
            };
            if state == RecordState::Deleted {
                return Err(LoamError::RecordState(format!(
                    "deleted record {type_name}/{id} must not be re-read"
                )));
            }
            if loaded && !eager {
                return Ok(Some(existing));
            }
        }

        let table = self.registry()?.type_table(type_name)?;
        let column_names: Vec<String> =
            table.table.columns.iter().map(|c| c.name.clone()).collect();
        let table_name = table.table.name.clone();
        let sql = format!(
            "SELECT {} FROM {table_name} WHERE id = ?1",
            column_names.join(", ")
        );

        let attrs: Vec<Attribute> = self
            .schema()
            .effective_attributes(type_name)?
            .into_iter()
            .cloned()
            .collect();

        let extracted: Option<Vec<(String, Value)>> = {
            let mcx = self.mediator_cx(ctx, type_name, Some(id))?;
            let mut stmt = self.conn().prepare(&sql)?;
            let mut rows = stmt.query([id])?;
            match rows.next()? {
                None => None,
                Some(row) => {
                    let mut values = Vec::new();
                    for attr in &attrs {
                        let is_inverse = matches!(attr.kind, AttributeKind::Inverse { .. });
                        if is_inverse {
                            if eager {
                                let v = mediator_for(&attr.kind)
                                    .extract(row, &attr.name, attr, &mcx)?;
                                values.push((attr.name.clone(), v));
                            }
                            continue;
                        }
                        if !attr.is_persisted() {
                            continue;
                        }
                        let v = mediator_for(&attr.kind).extract(row, &attr.name, attr, &mcx)?;
                        values.push((attr.name.clone(), v));
                    }
                    Some(values)
                }
            }
        };
        let Some(extracted) = extracted else {
            return Ok(None);
        };

        let handle = ctx.resolve(type_name, id);
        {
            let mut r = handle.borrow_mut();
            for (name, value) in &extracted {
                r.set_quiet(name.clone(), value.clone());
            }
            r.mark_loaded();
        }

        if eager {
            // One level: referenced and referencing rows get fully read.
            let mut targets: Vec<RecordRef> = Vec::new();
            for (_, value) in &extracted {
                match value {
                    Value::Ref(r) => targets.push(*r),
                    Value::RefList(refs) => targets.extend(refs.iter().copied()),
                    _ => {}
                }
            }
            for target_ref in targets {
                if let Some(target) = ctx.get(target_ref) {
                    let (t_type, t_id, loaded) = {
                        let t = target.borrow();
                        (t.type_name().to_string(), t.id(), t.is_loaded())
                    };
                    if let (Some(t_id), false) = (t_id, loaded) {
                        self.load(&t_type, t_id, ctx, false)?;
                    }
                }
            }
        }

        Ok(Some(handle))
    }

    // ── Queries ──────────────────────────────────────────────────

    /// Execute a PICK query, returning matching records in query order.
    pub fn query(
        &mut self,
        text: &str,
        args: &[Value],
        ctx: &RecordContext,
    ) -> Result<Vec<RecordHandle>> {
        let parsed = nquery::parse(text)?;
        if parsed.projection != nquery::Projection::Pick {
            return Err(LoamError::QueryCompile(
                "COUNT query passed to query(); use count()".into(),
            ));
        }
        let compiled = nquery::compile(
            self.schema(),
            self.registry()?,
            self.engine.cipher.as_ref(),
            &parsed,
            args,
        )?;
        log::debug!("nquery: {}", compiled.sql);

        let pairs: Vec<(String, i64)> = {
            let mut stmt = self.conn().prepare(&compiled.sql)?;
            let mut rows = stmt.query(params_from_iter(compiled.args))?;
            let mut pairs = Vec::new();
            while let Some(row) = rows.next()? {
                let id: i64 = row.get(0)?;
                let rtype: String = row.get(1)?;
                pairs.push((rtype, id));
            }
            pairs
        };

        let mut records = Vec::with_capacity(pairs.len());
        for (rtype, id) in pairs {
            if let Some(record) = self.load(&rtype, id, ctx, false)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Execute a query in count projection, regardless of how the text
    /// spells it.
    pub fn count(&mut self, text: &str, args: &[Value]) -> Result<u64> {
        let mut parsed = nquery::parse(text)?;
        parsed.projection = nquery::Projection::Count;
        let compiled = nquery::compile(
            self.schema(),
            self.registry()?,
            self.engine.cipher.as_ref(),
            &parsed,
            args,
        )?;
        let count: i64 = self.conn().query_row(
            &compiled.sql,
            params_from_iter(compiled.args),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Start a query-by-example against a type (and its subtypes).
    pub fn query_by_example(&mut self, type_name: impl Into<String>) -> ExampleQuery<'_, 'e> {
        ExampleQuery::new(self, type_name.into())
    }

    // ── Iteration ────────────────────────────────────────────────

    /// Bounded-memory traversal of every row of a type (including its
    /// concrete subtypes), delivered in batches of at most `batch_size`.
    pub fn iterate(
        &mut self,
        type_name: &str,
        listener: &mut dyn RecordListener,
        batch_size: usize,
        eager: bool,
        ctx: &RecordContext,
    ) -> Result<()> {
        let batch_size = batch_size.max(1);
        let concrete: Vec<String> = self
            .schema()
            .concrete_subtypes(type_name)?
            .iter()
            .map(|t| t.name.clone())
            .collect();

        for concrete_type in concrete {
            let table_name = self
                .registry()?
                .type_table(&concrete_type)?
                .table
                .name
                .clone();
            let mut last_id = 0i64;
            loop {
                let ids: Vec<i64> = {
                    let sql = format!(
                        "SELECT id FROM {table_name} WHERE id > ?1 ORDER BY id LIMIT ?2"
                    );
                    let mut stmt = self.conn().prepare(&sql)?;
                    let mut rows =
                        stmt.query(rusqlite::params![last_id, batch_size as i64])?;
                    let mut ids = Vec::new();
                    while let Some(row) = rows.next()? {
                        ids.push(row.get(0)?);
                    }
                    ids
                };
                if ids.is_empty() {
                    break;
                }
                last_id = *ids.last().unwrap_or(&last_id);

                let mut batch = Vec::with_capacity(ids.len());
                for id in &ids {
                    if let Some(record) = self.load(&concrete_type, *id, ctx, eager)? {
                        batch.push(record);
                    }
                }
                listener.on_batch(&batch)?;

                if ids.len() < batch_size {
                    break;
                }
            }
        }
        Ok(())
    }

    // ── Transaction outcome ──────────────────────────────────────

    /// Commit, then deliver the scheduled notifications in order.
    pub fn commit(mut self) -> Result<()> {
        self.conn().execute_batch("COMMIT")?;
        self.finished = true;
        let notices = std::mem::take(&mut self.notices);
        self.engine
            .listeners
            .dispatch(&self.engine.schema.name, &notices);
        Ok(())
    }

    /// Roll back. No table mutation stays observable and no notification
    /// fires.
    pub fn rollback(mut self) -> Result<()> {
        self.conn().execute_batch("ROLLBACK")?;
        self.finished = true;
        self.notices.clear();
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn().execute_batch("ROLLBACK") {
                log::warn!("implicit rollback failed: {e}");
            }
        }
    }
}

/// Batch consumer for `Transaction::iterate`.
pub trait RecordListener {
    fn on_batch(&mut self, batch: &[RecordHandle]) -> Result<()>;
}

fn unique_violation(e: rusqlite::Error, constraint: &str, type_name: &str) -> LoamError {
    if let rusqlite::Error::SqliteFailure(fe, _) = &e {
        if fe.code == rusqlite::ErrorCode::ConstraintViolation {
            return LoamError::UniqueViolation {
                constraint: constraint.to_string(),
                type_name: type_name.to_string(),
            };
        }
    }
    e.into()
}
