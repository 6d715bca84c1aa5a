pub(crate) mod compiler;
pub(crate) mod exec;

/// Errors surfaced by query compilation, binding and execution.
#[derive(thiserror::Error, Debug)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("no full-text index on property `{0}`")]
    NoSuchIndex(String),
    #[error("invalid query parameter: {0}")]
    InvalidParameter(String),
    #[error("unknown query parameter `{0}`")]
    InvalidQueryParam(String),
    #[error("sql error: `{0}`")]
    Sql(#[from] rusqlite::Error),
    #[error("invalid document body: `{0}`")]
    InvalidBody(#[from] serde_json::Error),
    #[error("store error: `{0}`")]
    Store(#[from] anyhow::Error),
}

pub use compiler::QueryCompiler;
pub use exec::{FullTextTerm, QueryOptions, QueryRow, QueryRows, SqliteQuery};
