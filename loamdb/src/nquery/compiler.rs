//! Compiles a parsed query to one parameterized SQL statement.
//!
//! Each reference hop compiles to one relational join per concrete
//! implementer of the hop's target, OR-ed together, recursing until no
//! mixin ambiguity remains, terminating at the first repeated
//! (relation, implementer) pair. Arguments are threaded through a single
//! ordered array; the argument cursor supports mark/reset so every
//! implementer variant of one logical term consumes the same placeholders.

use crate::driver::SqlArg;
use crate::error::{LoamError, Result};
use crate::mediator::CipherProvider;
use crate::nquery::ast::{CmpOp, Direction, Expr, Projection, Query, Term};
use crate::record::Value;
use crate::schema::{Attribute, AttributeKind, Schema, Type};
use crate::table::{self, JoinTable, TableRegistry};

/// The compiled statement: `sql` selects `id, rtype` pairs (or a single
/// count), `args` bind in appearance order, `paths` lists every expanded
/// predicate path.
#[derive(Debug)]
pub struct CompiledQuery {
    pub projection: Projection,
    pub type_name: String,
    pub sql: String,
    pub args: Vec<SqlArg>,
    pub paths: Vec<String>,
}

/// Positional argument cursor with mark/reset backtracking.
struct QueryArgs<'a> {
    args: &'a [Value],
    pos: usize,
    marks: Vec<usize>,
}

impl<'a> QueryArgs<'a> {
    fn new(args: &'a [Value]) -> Self {
        QueryArgs {
            args,
            pos: 0,
            marks: Vec::new(),
        }
    }

    fn next_arg(&mut self) -> Result<&'a Value> {
        let value = self.args.get(self.pos).ok_or_else(|| {
            LoamError::QueryCompile(format!(
                "query consumes more than the {} supplied argument(s)",
                self.args.len()
            ))
        })?;
        self.pos += 1;
        Ok(value)
    }

    fn mark_query_arg_position(&mut self) {
        self.marks.push(self.pos);
    }

    fn reset_query_arg_position(&mut self) {
        if let Some(mark) = self.marks.pop() {
            self.pos = mark;
        }
    }

    fn rewind(&mut self) {
        self.pos = 0;
        self.marks.clear();
    }
}

fn compile_error(message: impl Into<String>) -> LoamError {
    LoamError::QueryCompile(message.into())
}

fn sql_str(name: &str) -> String {
    format!("'{}'", name.replace('\'', "''"))
}

struct Compiler<'a> {
    schema: &'a Schema,
    registry: &'a TableRegistry,
    cipher: &'a dyn CipherProvider,
    args: QueryArgs<'a>,
    out_args: Vec<SqlArg>,
    joins: Vec<String>,
    next_alias: usize,
    paths: Vec<String>,
}

pub fn compile(
    schema: &Schema,
    registry: &TableRegistry,
    cipher: &dyn CipherProvider,
    query: &Query,
    args: &[Value],
) -> Result<CompiledQuery> {
    let mut compiler = Compiler {
        schema,
        registry,
        cipher,
        args: QueryArgs::new(args),
        out_args: Vec::new(),
        joins: Vec::new(),
        next_alias: 1,
        paths: Vec::new(),
    };
    compiler.compile_query(query)
}

impl<'a> Compiler<'a> {
    fn compile_query(&mut self, query: &Query) -> Result<CompiledQuery> {
        if self.schema.type_by_name(&query.type_name).is_none() {
            return Err(compile_error(format!(
                "unknown query target type '{}'",
                query.type_name
            )));
        }
        let concrete = self.schema.concrete_subtypes(&query.type_name)?;
        if concrete.is_empty() {
            return Err(compile_error(format!(
                "type '{}' has no concrete implementation",
                query.type_name
            )));
        }
        let concrete: Vec<Type> = concrete.into_iter().cloned().collect();

        let mut subs = Vec::new();
        for t in &concrete {
            subs.push(self.select_for(t, query)?);
        }
        let union = subs.join(" UNION ALL ");

        let sql = match query.projection {
            Projection::Count => format!("SELECT COUNT(*) FROM ({union})"),
            Projection::Pick => {
                let direction = match query.order_by.as_ref().map(|(_, d)| *d) {
                    Some(Direction::Desc) => "DESC",
                    _ => "ASC",
                };
                let limit = query.limit.map_or(-1, |l| l as i64);
                let offset = query.offset.unwrap_or(0);
                format!(
                    "SELECT id, rtype FROM ({union}) ORDER BY ord {direction} LIMIT {limit} OFFSET {offset}"
                )
            }
        };

        Ok(CompiledQuery {
            projection: query.projection,
            type_name: query.type_name.clone(),
            sql,
            args: std::mem::take(&mut self.out_args),
            paths: std::mem::take(&mut self.paths),
        })
    }

    /// One sub-select per concrete subtype of the target. Every sub-select
    /// re-consumes the full argument list, so the cursor rewinds here.
    fn select_for(&mut self, concrete: &Type, query: &Query) -> Result<String> {
        self.joins.clear();
        self.args.rewind();

        let table = self.registry.type_table(&concrete.name)?.table.name.clone();
        let predicate = match &query.predicate {
            Some(expr) => Some(self.compile_expr(&concrete.name, "t0", expr)?),
            None => None,
        };
        if self.args.pos != self.args.args.len() {
            return Err(compile_error(format!(
                "query has {} placeholder(s) but {} argument(s) were supplied",
                self.args.pos,
                self.args.args.len()
            )));
        }

        let ord = match &query.order_by {
            Some((attr_name, _)) => {
                let attr = self
                    .schema
                    .effective_attribute(&concrete.name, attr_name)
                    .map_err(|_| {
                        compile_error(format!(
                            "unknown ordering attribute '{attr_name}' on type '{}'",
                            concrete.name
                        ))
                    })?;
                if attr.is_reference() || !attr.is_persisted() {
                    return Err(compile_error(format!(
                        "cannot order by non-scalar attribute '{attr_name}'"
                    )));
                }
                format!("t0.{}", attr.name)
            }
            None => "t0.id".to_string(),
        };

        let joins = if self.joins.is_empty() {
            String::new()
        } else {
            format!(" {}", self.joins.join(" "))
        };
        let where_clause = match predicate {
            Some(p) => format!(" WHERE {p}"),
            None => String::new(),
        };
        Ok(format!(
            "SELECT t0.id AS id, {} AS rtype, {ord} AS ord FROM {table} t0{joins}{where_clause}",
            sql_str(&concrete.name)
        ))
    }

    fn compile_expr(&mut self, type_name: &str, alias: &str, expr: &Expr) -> Result<String> {
        Ok(match expr {
            Expr::And(a, b) => format!(
                "({} AND {})",
                self.compile_expr(type_name, alias, a)?,
                self.compile_expr(type_name, alias, b)?
            ),
            Expr::Or(a, b) => format!(
                "({} OR {})",
                self.compile_expr(type_name, alias, a)?,
                self.compile_expr(type_name, alias, b)?
            ),
            Expr::Not(inner) => format!("NOT ({})", self.compile_expr(type_name, alias, inner)?),
            Expr::Term(term) => {
                let segments = match term {
                    Term::Cmp { path, .. } | Term::InRange { path } | Term::Typed { path, .. } => {
                        path.segments.clone()
                    }
                };
                let mut visited = Vec::new();
                let mut label = Vec::new();
                self.compile_path_term(type_name, alias, &segments, term, &mut visited, &mut label)?
            }
        })
    }

    fn compile_path_term(
        &mut self,
        type_name: &str,
        alias: &str,
        segments: &[String],
        term: &Term,
        visited: &mut Vec<(String, String)>,
        label: &mut Vec<String>,
    ) -> Result<String> {
        let seg = &segments[0];
        let attr = self
            .schema
            .effective_attribute(type_name, seg)
            .map_err(|_| {
                compile_error(format!(
                    "type '{type_name}' has no attribute '{seg}' (path '{}')",
                    segments.join(".")
                ))
            })?
            .clone();
        if !attr.is_persisted() {
            return Err(compile_error(format!(
                "attribute '{seg}' is virtual and cannot be queried"
            )));
        }

        if !attr.is_reference() {
            if segments.len() > 1 {
                return Err(compile_error(format!(
                    "attribute '{seg}' is not a reference; cannot continue path '{}'",
                    segments.join(".")
                )));
            }
            return self.scalar_predicate(alias, &attr, term, label);
        }

        // Reference hop.
        if segments.len() == 1 {
            return match term {
                Term::Typed {
                    type_name: narrow, ..
                } => self.typed_predicate(type_name, alias, &attr, narrow, label),
                _ => Err(compile_error(format!(
                    "path ends at reference '{seg}'; add a target attribute"
                ))),
            };
        }

        let implementers: Vec<Type> = self
            .schema
            .reference_implementers(&attr.kind)?
            .into_iter()
            .cloned()
            .collect();

        // An explicit type segment narrows the hop to one implementer.
        let (variants, rest): (Vec<&Type>, &[String]) = match implementers
            .iter()
            .find(|t| t.name == segments[1])
        {
            Some(narrowed) => {
                if segments.len() < 3 {
                    return Err(compile_error(format!(
                        "path '{}' ends at type narrowing '{}'",
                        segments.join("."),
                        segments[1]
                    )));
                }
                (vec![narrowed], &segments[2..])
            }
            None => (implementers.iter().collect(), &segments[1..]),
        };

        let mut variant_sql = Vec::new();
        let mut pending: Vec<&Type> = variants
            .into_iter()
            .filter(|t| !visited.contains(&(seg.clone(), t.name.clone())))
            .collect();
        if pending.is_empty() {
            return Err(compile_error(format!(
                "path '{}' cannot be expanded: every implementer of '{seg}' repeats a visited hop",
                segments.join(".")
            )));
        }

        let last = pending.len() - 1;
        for (i, target) in pending.drain(..).enumerate() {
            visited.push((seg.clone(), target.name.clone()));
            label.push(seg.clone());
            label.push(target.name.clone());

            let target_alias = self.join_hop(type_name, alias, &attr, &target.name)?;

            if i < last {
                self.args.mark_query_arg_position();
            }
            let sql =
                self.compile_path_term(&target.name, &target_alias, rest, term, visited, label);
            if i < last {
                self.args.reset_query_arg_position();
            }

            label.pop();
            label.pop();
            visited.pop();
            variant_sql.push(sql?);
        }

        Ok(if variant_sql.len() == 1 {
            variant_sql.pop().unwrap_or_default()
        } else {
            format!("({})", variant_sql.join(" OR "))
        })
    }

    /// Emit the joins for one hop into one implementer, returning the
    /// alias of the target row.
    fn join_hop(
        &mut self,
        holder_type: &str,
        alias: &str,
        attr: &Attribute,
        target_type: &str,
    ) -> Result<String> {
        let target_table = self.registry.type_table(target_type)?.table.name.clone();
        let target_alias = self.alias();
        match &attr.kind {
            AttributeKind::TypeRef { .. } => {
                self.joins.push(format!(
                    "LEFT JOIN {target_table} {target_alias} ON {target_alias}.id = {alias}.{} AND {alias}.{} = {}",
                    table::ref_id_column(&attr.name),
                    table::ref_type_column(&attr.name),
                    sql_str(target_type)
                ));
            }
            AttributeKind::MixinRef { .. } => {
                let join = self.registry.join_table(holder_type, &attr.name)?;
                let join_name = join.table.name.clone();
                let join_alias = self.alias();
                self.joins.push(format!(
                    "LEFT JOIN {join_name} {join_alias} ON {join_alias}.{} = {alias}.id",
                    JoinTable::OWNER
                ));
                self.joins.push(format!(
                    "LEFT JOIN {target_table} {target_alias} ON {target_alias}.id = {join_alias}.{} AND {join_alias}.{} = {}",
                    JoinTable::TARGET_ID,
                    JoinTable::TARGET_TYPE,
                    sql_str(target_type)
                ));
            }
            _ => {
                return Err(compile_error(format!(
                    "attribute '{}' is not a reference",
                    attr.name
                )))
            }
        }
        Ok(target_alias)
    }

    fn alias(&mut self) -> String {
        let alias = format!("t{}", self.next_alias);
        self.next_alias += 1;
        alias
    }

    fn scalar_predicate(
        &mut self,
        alias: &str,
        attr: &Attribute,
        term: &Term,
        label: &[String],
    ) -> Result<String> {
        if matches!(attr.kind, AttributeKind::Binary) {
            return Err(compile_error(format!(
                "binary attribute '{}' cannot appear in a predicate",
                attr.name
            )));
        }
        let column = format!("{alias}.{}", attr.name);
        let sql = match term {
            Term::Cmp { op, .. } => {
                if matches!(attr.kind, AttributeKind::Crypto { .. }) && *op != CmpOp::Eq {
                    return Err(compile_error(format!(
                        "encrypted attribute '{}' supports equality only",
                        attr.name
                    )));
                }
                let arg = self.args.next_arg()?;
                let arg = self.scalar_arg(attr, arg)?;
                self.out_args.push(arg);
                format!("{column} {} ?", op.sql())
            }
            Term::InRange { .. } => {
                if matches!(
                    attr.kind,
                    AttributeKind::Crypto { .. } | AttributeKind::Json
                ) {
                    return Err(compile_error(format!(
                        "attribute '{}' does not support INRANGE",
                        attr.name
                    )));
                }
                let low = self.args.next_arg()?;
                let low = self.scalar_arg(attr, low)?;
                let high = self.args.next_arg()?;
                let high = self.scalar_arg(attr, high)?;
                self.out_args.push(low);
                self.out_args.push(high);
                format!("({column} >= ? AND {column} <= ?)")
            }
            Term::Typed { .. } => {
                return Err(compile_error(format!(
                    "TYPED applies to reference attributes, not '{}'",
                    attr.name
                )))
            }
        };

        let mut full = label.to_vec();
        full.push(attr.name.clone());
        self.push_path(full.join("_"));
        Ok(sql)
    }

    /// `path TYPED T`: constrain the reference's discriminator.
    fn typed_predicate(
        &mut self,
        holder_type: &str,
        alias: &str,
        attr: &Attribute,
        narrow: &str,
        label: &[String],
    ) -> Result<String> {
        let implementers = self.schema.reference_implementers(&attr.kind)?;
        if !implementers.iter().any(|t| t.name == narrow) {
            return Err(compile_error(format!(
                "'{narrow}' cannot satisfy reference '{}'",
                attr.name
            )));
        }
        let sql = match &attr.kind {
            AttributeKind::TypeRef { .. } => format!(
                "{alias}.{} = {}",
                table::ref_type_column(&attr.name),
                sql_str(narrow)
            ),
            AttributeKind::MixinRef { .. } => {
                let join = self.registry.join_table(holder_type, &attr.name)?;
                format!(
                    "EXISTS (SELECT 1 FROM {} j WHERE j.{} = {alias}.id AND j.{} = {})",
                    join.table.name,
                    JoinTable::OWNER,
                    JoinTable::TARGET_TYPE,
                    sql_str(narrow)
                )
            }
            _ => unreachable!("typed_predicate is only called for references"),
        };

        let mut full = label.to_vec();
        full.push(attr.name.clone());
        self.push_path(full.join("_"));
        Ok(sql)
    }

    fn push_path(&mut self, path: String) {
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    fn scalar_arg(&self, attr: &Attribute, value: &Value) -> Result<SqlArg> {
        let mismatch = || {
            compile_error(format!(
                "argument for attribute '{}' ({}) has the wrong shape: {value:?}",
                attr.name,
                attr.kind.keyword()
            ))
        };
        Ok(match (&attr.kind, value) {
            (_, Value::Null) => SqlArg::Null,
            (AttributeKind::String { .. }, Value::String(s)) => SqlArg::Text(s.clone()),
            (AttributeKind::Decimal { .. }, Value::Decimal(f)) => SqlArg::Real(*f),
            (AttributeKind::Boolean, Value::Boolean(b)) => SqlArg::Integer(i64::from(*b)),
            (AttributeKind::Date, Value::Date(d)) => SqlArg::Text(d.to_rfc3339()),
            (AttributeKind::Json, Value::Json(j)) => SqlArg::Text(serde_json::to_string(j)?),
            (AttributeKind::Crypto { .. }, Value::String(s)) => {
                SqlArg::Blob(self.cipher.encrypt(s.as_bytes())?)
            }
            _ => return Err(mismatch()),
        })
    }
}

/// Every addressable predicate path on a type: one path per
/// (relation, concrete implementer, attribute) triple, closed recursively
/// and terminated at the first repeated (relation, implementer) pair.
pub fn addressable_paths(schema: &Schema, type_name: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut visited = Vec::new();
    let mut prefix = Vec::new();
    walk_paths(schema, type_name, &mut visited, &mut prefix, &mut out)?;
    Ok(out)
}

fn walk_paths(
    schema: &Schema,
    type_name: &str,
    visited: &mut Vec<(String, String)>,
    prefix: &mut Vec<String>,
    out: &mut Vec<String>,
) -> Result<()> {
    for attr in schema.effective_attributes(type_name)? {
        if !attr.is_persisted() {
            continue;
        }
        if attr.is_reference() {
            let implementers: Vec<String> = schema
                .reference_implementers(&attr.kind)?
                .iter()
                .map(|t| t.name.clone())
                .collect();
            for target in implementers {
                if visited.contains(&(attr.name.clone(), target.clone())) {
                    continue;
                }
                visited.push((attr.name.clone(), target.clone()));
                prefix.push(attr.name.clone());
                prefix.push(target.clone());
                walk_paths(schema, &target, visited, prefix, out)?;
                prefix.pop();
                prefix.pop();
                visited.pop();
            }
        } else {
            let mut full = prefix.clone();
            full.push(attr.name.clone());
            out.push(full.join("_"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mediator::NoopCipher;
    use crate::nquery::parser::parse;
    use crate::schema::parse_schema;
    use pretty_assertions::assert_eq;

    fn fixture() -> (Schema, TableRegistry) {
        let schema = parse_schema(
            r#"
<schema name="q" namespace="org.q">
  <mixin name="Mix">
    <string name="mixValue"/>
  </mixin>
  <type name="Bar">
    <mixwith name="Mix"/>
    <string name="barValue"/>
  </type>
  <type name="Baz" parent="Bar">
    <string name="bazValue"/>
  </type>
  <type name="Foo">
    <string name="value"/>
    <typeref name="ref" target="Bar"/>
  </type>
  <type name="Holder">
    <mixinref name="mref" target="Mix"/>
    <string name="note"/>
  </type>
  <type name="Loop">
    <string name="value"/>
    <typeref name="refFoo" target="Loop"/>
  </type>
</schema>
"#,
        )
        .unwrap();
        let registry = TableRegistry::build(&schema).unwrap();
        (schema, registry)
    }

    #[test]
    fn addressable_paths_cover_every_relation_implementer_attribute_triple() {
        let (schema, _) = fixture();
        let paths = addressable_paths(&schema, "Foo").unwrap();
        assert_eq!(
            paths,
            vec![
                "value",
                "ref_Bar_mixValue",
                "ref_Bar_barValue",
                "ref_Baz_mixValue",
                "ref_Baz_barValue",
                "ref_Baz_bazValue",
            ]
        );
    }

    #[test]
    fn addressable_paths_close_over_self_reference_without_recursion() {
        let (schema, _) = fixture();
        let paths = addressable_paths(&schema, "Loop").unwrap();
        // The second visit of (refFoo, Loop) terminates the expansion.
        assert_eq!(paths, vec!["value", "refFoo_Loop_value"]);
    }

    #[test]
    fn mixin_hop_expands_one_predicate_per_implementer() {
        let (schema, registry) = fixture();
        let query = parse("PICK Holder IF mref.mixValue = ?").unwrap();
        let compiled = compile(
            &schema,
            &registry,
            &NoopCipher,
            &query,
            &[Value::String("x".into())],
        )
        .unwrap();

        assert_eq!(
            compiled.paths,
            vec!["mref_Bar_mixValue", "mref_Baz_mixValue"]
        );
        // One argument in the text, one compiled predicate per implementer:
        // the cursor backtracked and re-consumed it.
        assert_eq!(
            compiled.args,
            vec![
                SqlArg::Text("x".into()),
                SqlArg::Text("x".into()),
            ]
        );
        assert!(compiled.sql.contains("LEFT JOIN holder__mref"));
        assert!(!compiled.sql.contains("UNION ALL"));
        assert!(compiled.sql.contains(" OR "));
    }

    #[test]
    fn explicit_type_segment_narrows_the_hop() {
        let (schema, registry) = fixture();
        let query = parse("PICK Foo IF ref.Baz.bazValue = ?").unwrap();
        let compiled = compile(
            &schema,
            &registry,
            &NoopCipher,
            &query,
            &[Value::String("x".into())],
        )
        .unwrap();
        assert_eq!(compiled.paths, vec!["ref_Baz_bazValue"]);
        assert_eq!(compiled.args.len(), 1);
        assert!(compiled.sql.contains("LEFT JOIN baz"));
        assert!(!compiled.sql.contains("LEFT JOIN bar"));
    }

    #[test]
    fn arguments_thread_in_statement_order() {
        let (schema, registry) = fixture();
        let query = parse("PICK Foo IF ref.barValue = ? AND value = ?").unwrap();
        let compiled = compile(
            &schema,
            &registry,
            &NoopCipher,
            &query,
            &[Value::String("b".into()), Value::String("v".into())],
        )
        .unwrap();
        // Hop variants (Bar, Baz) both consume the first argument, then the
        // scalar term consumes the second.
        assert_eq!(
            compiled.args,
            vec![
                SqlArg::Text("b".into()),
                SqlArg::Text("b".into()),
                SqlArg::Text("v".into()),
            ]
        );
    }

    #[test]
    fn subtype_fanout_repeats_arguments_per_sub_select() {
        let (schema, registry) = fixture();
        let query = parse("PICK Bar IF barValue = ?").unwrap();
        let compiled = compile(
            &schema,
            &registry,
            &NoopCipher,
            &query,
            &[Value::String("b".into())],
        )
        .unwrap();
        // Bar and Baz each get a sub-select consuming the argument.
        assert!(compiled.sql.contains("UNION ALL"));
        assert_eq!(compiled.args.len(), 2);
    }

    #[test]
    fn unknown_path_is_a_compile_error_not_a_syntax_error() {
        let (schema, registry) = fixture();
        let query = parse("PICK Foo IF nonsense = ?").unwrap();
        let err = compile(
            &schema,
            &registry,
            &NoopCipher,
            &query,
            &[Value::String("x".into())],
        )
        .unwrap_err();
        assert!(matches!(err, LoamError::QueryCompile(_)));
    }

    #[test]
    fn typed_narrows_references() {
        let (schema, registry) = fixture();
        let query = parse("PICK Foo IF ref TYPED Baz").unwrap();
        let compiled = compile(&schema, &registry, &NoopCipher, &query, &[]).unwrap();
        assert!(compiled.sql.contains("ref_type = 'Baz'"));

        let bad = parse("PICK Foo IF ref TYPED Holder").unwrap();
        let err = compile(&schema, &registry, &NoopCipher, &bad, &[]).unwrap_err();
        assert!(err.to_string().contains("cannot satisfy"));
    }

    #[test]
    fn argument_count_mismatch_is_reported() {
        let (schema, registry) = fixture();
        let query = parse("PICK Foo IF value = ?").unwrap();
        let err = compile(&schema, &registry, &NoopCipher, &query, &[]).unwrap_err();
        assert!(matches!(err, LoamError::QueryCompile(_)));

        let query = parse("PICK Foo").unwrap();
        let err = compile(
            &schema,
            &registry,
            &NoopCipher,
            &query,
            &[Value::String("extra".into())],
        )
        .unwrap_err();
        assert!(err.to_string().contains("placeholder"));
    }

    #[test]
    fn count_compiles_to_count_statement() {
        let (schema, registry) = fixture();
        let query = parse("COUNT Foo IF value = ?").unwrap();
        let compiled = compile(
            &schema,
            &registry,
            &NoopCipher,
            &query,
            &[Value::String("x".into())],
        )
        .unwrap();
        assert!(compiled.sql.starts_with("SELECT COUNT(*)"));
    }

    #[test]
    fn order_limit_offset_shape_the_outer_select() {
        let (schema, registry) = fixture();
        let query = parse("PICK Foo ORDERBY value DESC LIMIT 3 OFFSET 6").unwrap();
        let compiled = compile(&schema, &registry, &NoopCipher, &query, &[]).unwrap();
        assert!(compiled.sql.contains("ORDER BY ord DESC"));
        assert!(compiled.sql.contains("LIMIT 3 OFFSET 6"));
        assert!(compiled.sql.contains("t0.value AS ord"));
    }
}
