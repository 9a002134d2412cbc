use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoamError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Schema document error: {0}")]
    SchemaXml(String),

    #[error("Query syntax error at '{fragment}': {message}")]
    QuerySyntax { fragment: String, message: String },

    #[error("Query compilation error: {0}")]
    QueryCompile(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Unique constraint '{constraint}' violated on type '{type_name}'")]
    UniqueViolation {
        constraint: String,
        type_name: String,
    },

    #[error("Deletion of {type_name}/{id} refused: {reason}")]
    DeletionRestricted {
        type_name: String,
        id: i64,
        reason: String,
    },

    #[error("Record not found: {type_name}/{id}")]
    NotFound { type_name: String, id: i64 },

    #[error("Record state error: {0}")]
    RecordState(String),

    #[error("Cipher error: {0}")]
    Cipher(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, LoamError>;
