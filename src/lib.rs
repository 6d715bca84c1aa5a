pub mod query;
pub mod store;
pub mod value;

mod sql_writer;

pub use query::{
    FullTextTerm, QueryCompiler, QueryError, QueryOptions, QueryRow, QueryRows, SqliteQuery,
};
pub use store::{KeyStore, Record};
pub use value::Value;
