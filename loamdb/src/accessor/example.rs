//! Query-by-example: attribute-equality predicates built fluently, fanned
//! out over the target type's concrete subtypes.

use crate::accessor::Transaction;
use crate::driver::SqlArg;
use crate::error::{LoamError, Result};
use crate::mediator::mediator_for;
use crate::nquery::Direction;
use crate::record::{RecordContext, RecordHandle, Value};
use crate::schema::AttributeKind;
use crate::table::{self, JoinTable};
use rusqlite::params_from_iter;

pub struct ExampleQuery<'t, 'e> {
    tx: &'t mut Transaction<'e>,
    type_name: String,
    predicates: Vec<(String, Value)>,
    order: Option<(String, Direction)>,
    limit: Option<u64>,
    offset: Option<u64>,
    eager: bool,
}

impl<'t, 'e> ExampleQuery<'t, 'e> {
    pub(crate) fn new(tx: &'t mut Transaction<'e>, type_name: String) -> Self {
        ExampleQuery {
            tx,
            type_name,
            predicates: Vec::new(),
            order: None,
            limit: None,
            offset: None,
            eager: false,
        }
    }

    /// Require `attribute = value`. A Null value matches unset columns.
    pub fn with(mut self, attribute: impl Into<String>, value: Value) -> Self {
        self.predicates.push((attribute.into(), value));
        self
    }

    pub fn order_by(mut self, attribute: impl Into<String>, direction: Direction) -> Self {
        self.order = Some((attribute.into(), direction));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Eagerly read referenced and referencing rows (one level) instead of
    /// leaving placeholders.
    pub fn eager(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    /// All matching records, in order.
    pub fn all(self, ctx: &RecordContext) -> Result<Vec<RecordHandle>> {
        let eager = self.eager;
        let (sql, args) = self.build_sql(false, ctx)?;
        let tx = self.tx;

        let pairs: Vec<(String, i64)> = {
            let mut stmt = tx.conn().prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(args))?;
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
            if let Some(record) = tx.load(&rtype, id, ctx, eager)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// The single matching record, None when nothing matches, an error
    /// when more than one row matches.
    pub fn single(mut self, ctx: &RecordContext) -> Result<Option<RecordHandle>> {
        self.limit = Some(2);
        self.offset = None;
        let type_name = self.type_name.clone();
        let mut results = self.all(ctx)?;
        match results.len() {
            0 => Ok(None),
            1 => Ok(results.pop()),
            _ => Err(LoamError::Constraint(format!(
                "example query on '{type_name}' matched more than one record"
            ))),
        }
    }

    /// Number of matching rows.
    pub fn count(self, ctx: &RecordContext) -> Result<u64> {
        let (sql, args) = self.build_sql(true, ctx)?;
        let count: i64 =
            self.tx
                .conn()
                .query_row(&sql, params_from_iter(args), |row| row.get(0))?;
        Ok(count as u64)
    }

    fn build_sql(&self, count: bool, ctx: &RecordContext) -> Result<(String, Vec<SqlArg>)> {
        let concrete: Vec<String> = self
            .tx
            .schema()
            .concrete_subtypes(&self.type_name)?
            .iter()
            .map(|t| t.name.clone())
            .collect();
        if concrete.is_empty() {
            return Err(LoamError::Schema(format!(
                "type '{}' has no concrete implementation",
                self.type_name
            )));
        }

        let mut args: Vec<SqlArg> = Vec::new();
        let mut subs: Vec<String> = Vec::new();
        for concrete_type in &concrete {
            let table_name = self
                .tx
                .registry()?
                .type_table(concrete_type)?
                .table
                .name
                .clone();

            let mut clauses: Vec<String> = Vec::new();
            for (attr_name, value) in &self.predicates {
                let attr = self
                    .tx
                    .schema()
                    .effective_attribute(concrete_type, attr_name)?
                    .clone();
                if !attr.is_persisted() {
                    return Err(LoamError::Schema(format!(
                        "attribute '{attr_name}' is not persisted and cannot be matched"
                    )));
                }

                match (&attr.kind, value.is_null()) {
                    (AttributeKind::MixinRef { .. }, true) => {
                        let join = self
                            .tx
                            .registry()?
                            .join_table(concrete_type, attr_name)?
                            .table
                            .name
                            .clone();
                        clauses.push(format!(
                            "NOT EXISTS (SELECT 1 FROM {join} j WHERE j.{} = t0.id)",
                            JoinTable::OWNER
                        ));
                    }
                    (AttributeKind::MixinRef { .. }, false) => {
                        let join = self
                            .tx
                            .registry()?
                            .join_table(concrete_type, attr_name)?
                            .table
                            .name
                            .clone();
                        let mcx = self.tx.mediator_cx(ctx, concrete_type, None)?;
                        let prepared = mediator_for(&attr.kind).prepare(value, &attr, &mcx)?;
                        clauses.push(format!(
                            "EXISTS (SELECT 1 FROM {join} j WHERE j.{} = t0.id AND j.{} = ? AND j.{} = ?)",
                            JoinTable::OWNER,
                            JoinTable::TARGET_TYPE,
                            JoinTable::TARGET_ID
                        ));
                        args.extend(prepared.into_iter().map(|(_, a)| a));
                    }
                    (AttributeKind::TypeRef { .. }, true) => {
                        clauses.push(format!(
                            "t0.{} IS NULL",
                            table::ref_id_column(attr_name)
                        ));
                    }
                    (_, true) => {
                        clauses.push(format!("t0.{} IS NULL", attr.name));
                    }
                    (_, false) => {
                        let mcx = self.tx.mediator_cx(ctx, concrete_type, None)?;
                        let prepared = mediator_for(&attr.kind).prepare(value, &attr, &mcx)?;
                        for (column, arg) in prepared {
                            clauses.push(format!("t0.{column} = ?"));
                            args.push(arg);
                        }
                    }
                }
            }

            let ord = match &self.order {
                Some((attr_name, _)) => {
                    let attr = self
                        .tx
                        .schema()
                        .effective_attribute(concrete_type, attr_name)?;
                    if attr.is_reference() || !attr.is_persisted() {
                        return Err(LoamError::Schema(format!(
                            "cannot order by non-scalar attribute '{attr_name}'"
                        )));
                    }
                    format!("t0.{}", attr.name)
                }
                None => "t0.id".to_string(),
            };

            let where_clause = if clauses.is_empty() {
                String::new()
            } else {
                format!(" WHERE {}", clauses.join(" AND "))
            };
            subs.push(format!(
                "SELECT t0.id AS id, '{concrete_type}' AS rtype, {ord} AS ord FROM {table_name} t0{where_clause}"
            ));
        }

        let union = subs.join(" UNION ALL ");
        let sql = if count {
            format!("SELECT COUNT(*) FROM ({union})")
        } else {
            let direction = match self.order.as_ref().map(|(_, d)| *d) {
                Some(Direction::Desc) => "DESC",
                _ => "ASC",
            };
            let limit = self.limit.map_or(-1, |l| l as i64);
            let offset = self.offset.unwrap_or(0);
            format!(
                "SELECT id, rtype FROM ({union}) ORDER BY ord {direction} LIMIT {limit} OFFSET {offset}"
            )
        };
        Ok((sql, args))
    }
}
