use anyhow::Result;

/// A record read back from the row store.
#[derive(Debug, Clone)]
pub struct Record {
    /// Revision counter at the time the record was stored.
    pub sequence: i64,
    /// Encoded document body (JSON).
    pub body: Vec<u8>,
}

/// Seam to the backing row store.
///
/// The store owns a table with at least `sequence`, `key`, `meta` and `body`
/// columns, registers the `fl_value`/`fl_exists`/`fl_count` accessor
/// functions with the SQLite runtime, and maintains any full-text index
/// tables (`"<table>::<property>"`).
pub trait KeyStore {
    /// Name of the backing document table.
    fn table_name(&self) -> &str;

    /// Whether a full-text index exists for the given property path.
    fn has_fts_index(&self, property_path: &str) -> bool;

    /// Re-reads a record's current body by record id. `Ok(None)` when the
    /// record no longer exists.
    fn read_record(&self, record_id: &[u8]) -> Result<Option<Record>>;
}
