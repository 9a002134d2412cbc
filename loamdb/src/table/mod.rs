//! Table registry: compiles the schema model into relational table
//! descriptors. Built once per deployment, read-only afterwards.
//!
//! Strategy: one physical table per concrete type, carrying the type's
//! complete effective attribute set. Abstract types own no table; lookups
//! by a parent type fan out over its concrete subtypes' tables.

use crate::error::{LoamError, Result};
use crate::schema::{Attribute, AttributeKind, Schema, Type, UniqueConstraint};
use crate::driver::VendorAdapter;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Blob,
}

impl ColumnType {
    pub fn sql(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
            ColumnType::Blob => "BLOB",
        }
    }
}

/// One column, optionally tied to the attribute it stores.
#[derive(Debug, Clone)]
pub struct AttributeColumn {
    pub name: String,
    /// Name of the attribute this column backs; None for structural
    /// columns (primary key, join-table owner).
    pub attribute: Option<String>,
    pub column_type: ColumnType,
    pub primary_key: bool,
}

#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub columns: Vec<AttributeColumn>,
}

impl Table {
    pub fn primary_key(&self) -> Option<&AttributeColumn> {
        self.columns.iter().find(|c| c.primary_key)
    }

    pub fn column(&self, name: &str) -> Option<&AttributeColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// DDL for this table; the primary-key clause comes from the vendor.
    pub fn create_sql(&self, adapter: &dyn VendorAdapter) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                if c.primary_key {
                    format!("{} {}", c.name, adapter.primary_key_clause())
                } else {
                    format!("{} {}", c.name, c.column_type.sql())
                }
            })
            .collect();
        format!("CREATE TABLE {} ({})", self.name, cols.join(", "))
    }
}

/// Table backing one concrete type.
#[derive(Debug, Clone)]
pub struct TypeTable {
    pub type_name: String,
    pub table: Table,
}

/// Side table backing a relation that cuts across a mixin's implementers.
#[derive(Debug, Clone)]
pub struct JoinTable {
    pub holder: String,
    pub attribute: String,
    /// The mixin the relation targets.
    pub target_mixin: String,
    pub table: Table,
}

impl JoinTable {
    pub const OWNER: &'static str = "owner_id";
    pub const TARGET_TYPE: &'static str = "target_type";
    pub const TARGET_ID: &'static str = "target_id";
}

/// Side table enforcing a unique constraint across a type hierarchy.
#[derive(Debug, Clone)]
pub struct UniqueConstraintTable {
    pub type_name: String,
    pub constraint: UniqueConstraint,
    pub table: Table,
    /// Columns carrying the constrained values, in constraint order.
    pub value_columns: Vec<String>,
}

impl UniqueConstraintTable {
    pub const ROW_TYPE: &'static str = "row_type";
    pub const ROW_ID: &'static str = "row_id";
}

/// An index the engine creates at deployment (idempotently, through the
/// vendor adapter's existence check).
#[derive(Debug, Clone)]
pub struct IndexDef {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexDef {
    pub fn create_sql(&self) -> String {
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if self.unique { "UNIQUE " } else { "" },
            self.name,
            self.table,
            self.columns.join(", ")
        )
    }
}

/// Where one attribute of one concrete type lives.
#[derive(Debug, Clone)]
pub enum ColumnBinding {
    Scalar {
        table: String,
        column: String,
    },
    /// Inline polymorphic reference: a type discriminator next to the id.
    Reference {
        table: String,
        type_column: String,
        id_column: String,
    },
    /// Reference through a join table.
    Join {
        table: String,
    },
}

#[derive(Debug, Default)]
pub struct TableRegistry {
    type_tables: HashMap<String, TypeTable>,
    join_tables: HashMap<(String, String), JoinTable>,
    constraint_tables: HashMap<(String, String), UniqueConstraintTable>,
    indexes: Vec<IndexDef>,
}

pub fn ref_type_column(attribute: &str) -> String {
    format!("{attribute}_type")
}

pub fn ref_id_column(attribute: &str) -> String {
    format!("{attribute}_id")
}

pub fn type_table_name(type_name: &str) -> String {
    type_name.to_lowercase()
}

fn scalar_column_type(kind: &AttributeKind) -> Option<ColumnType> {
    match kind {
        AttributeKind::String { .. } => Some(ColumnType::Text),
        AttributeKind::Decimal { .. } => Some(ColumnType::Real),
        AttributeKind::Boolean => Some(ColumnType::Integer),
        AttributeKind::Date => Some(ColumnType::Text),
        AttributeKind::Binary => Some(ColumnType::Blob),
        AttributeKind::Json => Some(ColumnType::Text),
        AttributeKind::Crypto { .. } => Some(ColumnType::Blob),
        _ => None,
    }
}

impl TableRegistry {
    /// Compile a validated schema. Builds privately; callers publish the
    /// finished registry behind an `Arc` so concurrent readers never see a
    /// partial view.
    pub fn build(schema: &Schema) -> Result<Self> {
        let mut registry = TableRegistry::default();

        for t in schema.types.iter().filter(|t| !t.is_abstract) {
            registry.create_type_table(schema, t, &type_table_name(&t.name))?;
        }

        // Constraint tables hang off the declaring type, shared by its
        // whole concrete hierarchy.
        for t in &schema.types {
            for constraint in &t.unique_constraints {
                let table_name = format!("uq_{}_{}", type_table_name(&t.name), constraint.name);
                registry.create_unique_constraint_table(schema, t, constraint, &table_name)?;
            }
        }

        Ok(registry)
    }

    /// Build the table for one concrete type, one attribute at a time.
    fn create_type_table(&mut self, schema: &Schema, t: &Type, table_name: &str) -> Result<()> {
        let mut columns = vec![AttributeColumn {
            name: "id".into(),
            attribute: None,
            column_type: ColumnType::Integer,
            primary_key: true,
        }];

        for attr in schema.effective_attributes(&t.name)? {
            if !attr.is_persisted() {
                continue;
            }
            match &attr.kind {
                AttributeKind::TypeRef { .. } => {
                    columns.push(AttributeColumn {
                        name: ref_type_column(&attr.name),
                        attribute: Some(attr.name.clone()),
                        column_type: ColumnType::Text,
                        primary_key: false,
                    });
                    columns.push(AttributeColumn {
                        name: ref_id_column(&attr.name),
                        attribute: Some(attr.name.clone()),
                        column_type: ColumnType::Integer,
                        primary_key: false,
                    });
                    self.indexes.push(IndexDef {
                        name: format!("idx_{table_name}_{}", ref_id_column(&attr.name)),
                        table: table_name.to_string(),
                        columns: vec![ref_type_column(&attr.name), ref_id_column(&attr.name)],
                        unique: false,
                    });
                }
                AttributeKind::MixinRef { .. } => {
                    let join_name = format!("{table_name}__{}", attr.name);
                    self.create_join_table(&t.name, attr, &join_name)?;
                }
                kind => {
                    let column_type = scalar_column_type(kind).ok_or_else(|| {
                        LoamError::Schema(format!(
                            "attribute '{}' of kind '{}' has no column mapping",
                            attr.name,
                            kind.keyword()
                        ))
                    })?;
                    columns.push(AttributeColumn {
                        name: attr.name.clone(),
                        attribute: Some(attr.name.clone()),
                        column_type,
                        primary_key: false,
                    });
                }
            }
        }

        self.type_tables.insert(
            t.name.clone(),
            TypeTable {
                type_name: t.name.clone(),
                table: Table {
                    name: table_name.to_string(),
                    columns,
                },
            },
        );
        Ok(())
    }

    /// Build the side table for a mixin-reference relation.
    fn create_join_table(&mut self, holder: &str, attr: &Attribute, table_name: &str) -> Result<()> {
        let target_mixin = match &attr.kind {
            AttributeKind::MixinRef { target } => target.clone(),
            _ => {
                return Err(LoamError::Schema(format!(
                    "attribute '{}' does not need a join table",
                    attr.name
                )))
            }
        };
        let table = Table {
            name: table_name.to_string(),
            columns: vec![
                AttributeColumn {
                    name: "id".into(),
                    attribute: None,
                    column_type: ColumnType::Integer,
                    primary_key: true,
                },
                AttributeColumn {
                    name: JoinTable::OWNER.into(),
                    attribute: None,
                    column_type: ColumnType::Integer,
                    primary_key: false,
                },
                AttributeColumn {
                    name: JoinTable::TARGET_TYPE.into(),
                    attribute: Some(attr.name.clone()),
                    column_type: ColumnType::Text,
                    primary_key: false,
                },
                AttributeColumn {
                    name: JoinTable::TARGET_ID.into(),
                    attribute: Some(attr.name.clone()),
                    column_type: ColumnType::Integer,
                    primary_key: false,
                },
            ],
        };
        // One value per owner: the relation is single-valued.
        self.indexes.push(IndexDef {
            name: format!("idx_{table_name}_owner"),
            table: table_name.to_string(),
            columns: vec![JoinTable::OWNER.into()],
            unique: true,
        });
        self.indexes.push(IndexDef {
            name: format!("idx_{table_name}_target"),
            table: table_name.to_string(),
            columns: vec![JoinTable::TARGET_TYPE.into(), JoinTable::TARGET_ID.into()],
            unique: false,
        });
        self.join_tables.insert(
            (holder.to_string(), attr.name.clone()),
            JoinTable {
                holder: holder.to_string(),
                attribute: attr.name.clone(),
                target_mixin,
                table,
            },
        );
        Ok(())
    }

    /// Build the side table enforcing one unique constraint across the
    /// declaring type's concrete hierarchy.
    fn create_unique_constraint_table(
        &mut self,
        schema: &Schema,
        t: &Type,
        constraint: &UniqueConstraint,
        table_name: &str,
    ) -> Result<()> {
        let mut columns = vec![AttributeColumn {
            name: "id".into(),
            attribute: None,
            column_type: ColumnType::Integer,
            primary_key: true,
        }];
        let mut value_columns = Vec::new();

        for attr_name in &constraint.attributes {
            let attr = schema.effective_attribute(&t.name, attr_name)?;
            match &attr.kind {
                AttributeKind::TypeRef { .. } | AttributeKind::MixinRef { .. } => {
                    for (col, column_type) in [
                        (ref_type_column(attr_name), ColumnType::Text),
                        (ref_id_column(attr_name), ColumnType::Integer),
                    ] {
                        value_columns.push(col.clone());
                        columns.push(AttributeColumn {
                            name: col,
                            attribute: Some(attr_name.clone()),
                            column_type,
                            primary_key: false,
                        });
                    }
                }
                kind => {
                    let column_type = scalar_column_type(kind).ok_or_else(|| {
                        LoamError::Schema(format!(
                            "constraint '{}' cannot cover attribute '{attr_name}'",
                            constraint.name
                        ))
                    })?;
                    value_columns.push(attr_name.clone());
                    columns.push(AttributeColumn {
                        name: attr_name.clone(),
                        attribute: Some(attr_name.clone()),
                        column_type,
                        primary_key: false,
                    });
                }
            }
        }

        columns.push(AttributeColumn {
            name: UniqueConstraintTable::ROW_TYPE.into(),
            attribute: None,
            column_type: ColumnType::Text,
            primary_key: false,
        });
        columns.push(AttributeColumn {
            name: UniqueConstraintTable::ROW_ID.into(),
            attribute: None,
            column_type: ColumnType::Integer,
            primary_key: false,
        });

        self.indexes.push(IndexDef {
            name: format!("idx_{table_name}_values"),
            table: table_name.to_string(),
            columns: value_columns.clone(),
            unique: true,
        });
        self.indexes.push(IndexDef {
            name: format!("idx_{table_name}_row"),
            table: table_name.to_string(),
            columns: vec![
                UniqueConstraintTable::ROW_TYPE.into(),
                UniqueConstraintTable::ROW_ID.into(),
            ],
            unique: false,
        });
        self.constraint_tables.insert(
            (t.name.clone(), constraint.name.clone()),
            UniqueConstraintTable {
                type_name: t.name.clone(),
                constraint: constraint.clone(),
                table: Table {
                    name: table_name.to_string(),
                    columns,
                },
                value_columns,
            },
        );
        Ok(())
    }

    // ── Lookups ──────────────────────────────────────────────────

    pub fn type_table(&self, type_name: &str) -> Result<&TypeTable> {
        self.type_tables.get(type_name).ok_or_else(|| {
            LoamError::Schema(format!("No table for type '{type_name}' (abstract or unknown)"))
        })
    }

    pub fn join_table(&self, type_name: &str, attribute: &str) -> Result<&JoinTable> {
        self.join_tables
            .get(&(type_name.to_string(), attribute.to_string()))
            .ok_or_else(|| {
                LoamError::Schema(format!(
                    "No join table for '{type_name}.{attribute}'"
                ))
            })
    }

    pub fn constraint_table(
        &self,
        type_name: &str,
        constraint: &str,
    ) -> Result<&UniqueConstraintTable> {
        self.constraint_tables
            .get(&(type_name.to_string(), constraint.to_string()))
            .ok_or_else(|| {
                LoamError::Schema(format!(
                    "No constraint table for '{type_name}.{constraint}'"
                ))
            })
    }

    /// All join tables whose relation targets the given mixin.
    pub fn join_tables_for_mixin(&self, mixin_name: &str) -> Vec<&JoinTable> {
        self.join_tables
            .values()
            .filter(|j| j.target_mixin == mixin_name)
            .collect()
    }

    pub fn by_table_name(&self, name: &str) -> Option<&Table> {
        self.type_tables
            .values()
            .map(|t| &t.table)
            .chain(self.join_tables.values().map(|t| &t.table))
            .chain(self.constraint_tables.values().map(|t| &t.table))
            .find(|t| t.name == name)
    }

    pub fn type_tables(&self) -> impl Iterator<Item = &TypeTable> {
        self.type_tables.values()
    }

    pub fn join_tables(&self) -> impl Iterator<Item = &JoinTable> {
        self.join_tables.values()
    }

    pub fn constraint_tables(&self) -> impl Iterator<Item = &UniqueConstraintTable> {
        self.constraint_tables.values()
    }

    pub fn all_tables(&self) -> Vec<&Table> {
        self.type_tables
            .values()
            .map(|t| &t.table)
            .chain(self.join_tables.values().map(|t| &t.table))
            .chain(self.constraint_tables.values().map(|t| &t.table))
            .collect()
    }

    pub fn indexes(&self) -> &[IndexDef] {
        &self.indexes
    }

    /// Where a persisted attribute of a concrete type lives. Exactly one
    /// binding exists per (concrete type, persisted attribute).
    pub fn binding(&self, type_name: &str, attr: &Attribute) -> Result<ColumnBinding> {
        match &attr.kind {
            AttributeKind::Inverse { .. } => Err(LoamError::Schema(format!(
                "Inverse attribute '{}' owns no column",
                attr.name
            ))),
            AttributeKind::TypeRef { .. } => {
                let table = self.type_table(type_name)?;
                Ok(ColumnBinding::Reference {
                    table: table.table.name.clone(),
                    type_column: ref_type_column(&attr.name),
                    id_column: ref_id_column(&attr.name),
                })
            }
            AttributeKind::MixinRef { .. } => {
                let join = self.join_table(type_name, &attr.name)?;
                Ok(ColumnBinding::Join {
                    table: join.table.name.clone(),
                })
            }
            _ => {
                let table = self.type_table(type_name)?;
                Ok(ColumnBinding::Scalar {
                    table: table.table.name.clone(),
                    column: attr.name.clone(),
                })
            }
        }
    }
}
