//! Relational driver boundary. The engine only issues parameterized
//! statements and reads column values through `RowView`; the few
//! vendor-specific checks live behind `VendorAdapter`.

use crate::error::Result;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, ToSql};

/// A positional statement argument.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl ToSql for SqlArg {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlArg::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            SqlArg::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            SqlArg::Real(f) => ToSqlOutput::Borrowed(ValueRef::Real(*f)),
            SqlArg::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlArg::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

/// Read access to one result row by column name, independent of the
/// underlying driver's row type.
pub trait RowView {
    fn i64_value(&self, column: &str) -> Result<Option<i64>>;
    fn f64_value(&self, column: &str) -> Result<Option<f64>>;
    fn text_value(&self, column: &str) -> Result<Option<String>>;
    fn blob_value(&self, column: &str) -> Result<Option<Vec<u8>>>;
}

impl RowView for rusqlite::Row<'_> {
    fn i64_value(&self, column: &str) -> Result<Option<i64>> {
        Ok(self.get::<_, Option<i64>>(column)?)
    }

    fn f64_value(&self, column: &str) -> Result<Option<f64>> {
        Ok(self.get::<_, Option<f64>>(column)?)
    }

    fn text_value(&self, column: &str) -> Result<Option<String>> {
        Ok(self.get::<_, Option<String>>(column)?)
    }

    fn blob_value(&self, column: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get::<_, Option<Vec<u8>>>(column)?)
    }
}

/// Vendor-specific quirks, isolated so the core never branches on the
/// database flavor.
pub trait VendorAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn table_exists(&self, conn: &Connection, table: &str) -> Result<bool>;

    fn index_exists(&self, conn: &Connection, table: &str, index: &str) -> Result<bool>;

    /// Column clause for the auto-assigned integer primary key.
    fn primary_key_clause(&self) -> &'static str;
}

pub struct SqliteAdapter;

impl VendorAdapter for SqliteAdapter {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn table_exists(&self, conn: &Connection, table: &str) -> Result<bool> {
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn index_exists(&self, conn: &Connection, table: &str, index: &str) -> Result<bool> {
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1 AND name = ?2",
                [table, index],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn primary_key_clause(&self) -> &'static str {
        "INTEGER PRIMARY KEY AUTOINCREMENT"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_adapter_existence_checks() {
        let conn = Connection::open_in_memory().unwrap();
        let adapter = SqliteAdapter;

        assert!(!adapter.table_exists(&conn, "foo").unwrap());
        conn.execute_batch("CREATE TABLE foo (id INTEGER PRIMARY KEY, v TEXT)")
            .unwrap();
        assert!(adapter.table_exists(&conn, "foo").unwrap());

        assert!(!adapter.index_exists(&conn, "foo", "idx_foo_v").unwrap());
        conn.execute_batch("CREATE INDEX idx_foo_v ON foo(v)").unwrap();
        assert!(adapter.index_exists(&conn, "foo", "idx_foo_v").unwrap());
    }

    #[test]
    fn sql_args_bind_all_variants() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (i INTEGER, r REAL, s TEXT, b BLOB, n TEXT)")
            .unwrap();
        conn.execute(
            "INSERT INTO t (i, r, s, b, n) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                SqlArg::Integer(7),
                SqlArg::Real(1.5),
                SqlArg::Text("seven".into()),
                SqlArg::Blob(vec![1, 2, 3]),
                SqlArg::Null,
            ],
        )
        .unwrap();

        let (i, r, s, b, n): (i64, f64, String, Vec<u8>, Option<String>) = conn
            .query_row("SELECT i, r, s, b, n FROM t", [], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })
            .unwrap();
        assert_eq!((i, r, s.as_str(), b, n), (7, 1.5, "seven", vec![1, 2, 3], None));
    }
}
