//! Executor integration tests over an in-memory SQLite database, with the
//! document-accessor functions registered the way the embedding store would.

use anyhow::Result;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;

use lodestore::{KeyStore, QueryError, QueryOptions, Record, SqliteQuery, Value};

struct TestStore {
    conn: Connection,
    fts: Vec<String>,
}

impl TestStore {
    fn new() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE kv_default (
                sequence INTEGER PRIMARY KEY,
                key BLOB NOT NULL,
                meta BLOB NOT NULL,
                body TEXT NOT NULL)",
        )?;
        register_accessors(&conn)?;
        Ok(Self {
            conn,
            fts: Vec::new(),
        })
    }

    fn put(&self, key: &str, body: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO kv_default (key, meta, body) VALUES (?1, x'ab', ?2)",
            (key.as_bytes(), body),
        )?;
        Ok(())
    }
}

impl KeyStore for TestStore {
    fn table_name(&self) -> &str {
        "kv_default"
    }

    fn has_fts_index(&self, property_path: &str) -> bool {
        self.fts.iter().any(|p| p == property_path)
    }

    fn read_record(&self, record_id: &[u8]) -> Result<Option<Record>> {
        let mut stmt = self
            .conn
            .prepare("SELECT sequence, body FROM kv_default WHERE key = ?1")?;
        let mut rows = stmt.query([record_id])?;
        match rows.next()? {
            None => Ok(None),
            Some(row) => Ok(Some(Record {
                sequence: row.get(0)?,
                body: row.get::<_, String>(1)?.into_bytes(),
            })),
        }
    }
}

/// A store whose records always come back with a newer sequence, simulating
/// documents updated since they were indexed.
struct StaleStore<'a>(&'a TestStore);

impl KeyStore for StaleStore<'_> {
    fn table_name(&self) -> &str {
        self.0.table_name()
    }

    fn has_fts_index(&self, property_path: &str) -> bool {
        self.0.has_fts_index(property_path)
    }

    fn read_record(&self, record_id: &[u8]) -> Result<Option<Record>> {
        Ok(self.0.read_record(record_id)?.map(|mut record| {
            record.sequence += 1;
            record
        }))
    }
}

fn register_accessors(conn: &Connection) -> Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
    conn.create_scalar_function("fl_value", 2, flags, |ctx| {
        let body: String = ctx.get(0)?;
        let path: String = ctx.get(1)?;
        let parsed =
            Value::from_json(&body).map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
        Ok(match parsed.at_path(&path) {
            Some(Value::Bool(b)) => SqlValue::Integer(*b as i64),
            Some(Value::Int(n)) => SqlValue::Integer(*n),
            Some(Value::Float(f)) => SqlValue::Real(*f),
            Some(Value::String(s)) => SqlValue::Text(s.clone()),
            _ => SqlValue::Null,
        })
    })?;
    conn.create_scalar_function("fl_exists", 2, flags, |ctx| {
        let body: String = ctx.get(0)?;
        let path: String = ctx.get(1)?;
        let parsed =
            Value::from_json(&body).map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
        Ok(parsed.at_path(&path).is_some() as i64)
    })?;
    Ok(())
}

fn selector(json: &str) -> Value {
    Value::from_json(json).unwrap()
}

#[test]
fn iterates_matching_rows() -> Result<()> {
    let store = TestStore::new()?;
    store.put("doc1", r#"{"type":"note","n":1}"#)?;
    store.put("doc2", r#"{"type":"page","n":2}"#)?;
    store.put("doc3", r#"{"type":"note","n":3}"#)?;

    let expr = selector(r#"["=", [".", "type"], "note"]"#);
    let mut query = SqliteQuery::new(&store, &store.conn, &expr, None)?;
    let mut rows = query.run(&QueryOptions::default())?;
    assert!(!rows.has_full_text());

    let row = rows.next()?.unwrap();
    assert_eq!(row.sequence, 1);
    assert_eq!(row.record_id, b"doc1");
    assert_eq!(row.meta, [0xab]);
    assert_eq!(row.body_length, r#"{"type":"note","n":1}"#.len() as u64);
    assert!(row.full_text_terms()?.is_empty());

    let row = rows.next()?.unwrap();
    assert_eq!(row.sequence, 3);
    assert_eq!(row.record_id, b"doc3");

    assert!(rows.next()?.is_none());
    Ok(())
}

#[test]
fn binds_named_parameters() -> Result<()> {
    let store = TestStore::new()?;
    store.put("doc1", r#"{"n":1}"#)?;
    store.put("doc2", r#"{"n":2}"#)?;
    store.put("doc3", r#"{"n":3}"#)?;

    let expr = selector(r#"["=", [".", "n"], ["$", "n"]]"#);
    let mut query = SqliteQuery::new(&store, &store.conn, &expr, None)?;
    assert!(query.parameters().contains("n"));

    let options = QueryOptions {
        params: Some(selector(r#"{"n": 2}"#)),
        ..QueryOptions::default()
    };
    let mut rows = query.run(&options)?;
    assert_eq!(rows.next()?.unwrap().sequence, 2);
    assert!(rows.next()?.is_none());
    Ok(())
}

#[test]
fn rebinds_between_enumerations() -> Result<()> {
    let store = TestStore::new()?;
    store.put("doc1", r#"{"n":1}"#)?;
    store.put("doc2", r#"{"n":2}"#)?;

    let expr = selector(r#"["=", [".", "n"], ["$", "n"]]"#);
    let mut query = SqliteQuery::new(&store, &store.conn, &expr, None)?;

    for (bound, expected) in [(1, 1i64), (2, 2i64)] {
        let options = QueryOptions {
            params: Some(selector(&format!(r#"{{"n": {}}}"#, bound))),
            ..QueryOptions::default()
        };
        let mut rows = query.run(&options)?;
        assert_eq!(rows.next()?.unwrap().sequence, expected);
        assert!(rows.next()?.is_none());
    }

    // A null value is skipped, so after rebinding the placeholder is NULL
    // and nothing matches.
    let options = QueryOptions {
        params: Some(selector(r#"{"n": null}"#)),
        ..QueryOptions::default()
    };
    let mut rows = query.run(&options)?;
    assert!(rows.next()?.is_none());
    Ok(())
}

#[test]
fn rejects_bad_parameters() -> Result<()> {
    let store = TestStore::new()?;
    store.put("doc1", r#"{"n":1}"#)?;

    let expr = selector(r#"["=", [".", "n"], ["$", "n"]]"#);
    let mut query = SqliteQuery::new(&store, &store.conn, &expr, None)?;

    let unknown = QueryOptions {
        params: Some(selector(r#"{"bogus": 1}"#)),
        ..QueryOptions::default()
    };
    assert!(matches!(
        query.run(&unknown),
        Err(QueryError::InvalidQueryParam(_))
    ));

    let unsupported = QueryOptions {
        params: Some(selector(r#"{"n": [1, 2]}"#)),
        ..QueryOptions::default()
    };
    assert!(matches!(
        query.run(&unsupported),
        Err(QueryError::InvalidParameter(_))
    ));

    let not_a_dict = QueryOptions {
        params: Some(selector("[1]")),
        ..QueryOptions::default()
    };
    assert!(matches!(
        query.run(&not_a_dict),
        Err(QueryError::InvalidParameter(_))
    ));
    Ok(())
}

#[test]
fn exists_rewrites_to_accessor() -> Result<()> {
    let store = TestStore::new()?;
    store.put("doc1", r#"{"n":1}"#)?;
    store.put("doc2", r#"{"m":2}"#)?;

    let expr = selector(r#"["EXISTS", [".", "n"]]"#);
    let mut query = SqliteQuery::new(&store, &store.conn, &expr, None)?;
    let mut rows = query.run(&QueryOptions::default())?;
    assert_eq!(rows.next()?.unwrap().record_id, b"doc1");
    assert!(rows.next()?.is_none());
    Ok(())
}

#[test]
fn applies_skip_and_limit() -> Result<()> {
    let store = TestStore::new()?;
    for i in 1..=5 {
        store.put(&format!("doc{}", i), &format!(r#"{{"n":{}}}"#, i))?;
    }

    let expr = Value::Bool(true);
    let mut query = SqliteQuery::new(&store, &store.conn, &expr, None)?;
    let options = QueryOptions {
        skip: 1,
        limit: 2,
        params: None,
    };
    let mut rows = query.run(&options)?;
    assert_eq!(rows.next()?.unwrap().sequence, 2);
    assert_eq!(rows.next()?.unwrap().sequence, 3);
    assert!(rows.next()?.is_none());
    Ok(())
}

#[test]
fn sorts_by_order_terms() -> Result<()> {
    let store = TestStore::new()?;
    store.put("doc1", r#"{"n":2}"#)?;
    store.put("doc2", r#"{"n":3}"#)?;
    store.put("doc3", r#"{"n":1}"#)?;

    let expr = Value::Bool(true);
    let sort = selector(r#"[["DESC", [".", "n"]]]"#);
    let mut query = SqliteQuery::new(&store, &store.conn, &expr, Some(&sort))?;
    let mut rows = query.run(&QueryOptions::default())?;
    let mut sequences = Vec::new();
    while let Some(row) = rows.next()? {
        sequences.push(row.sequence);
    }
    assert_eq!(sequences, [2, 1, 3]);
    Ok(())
}

#[test]
fn match_requires_full_text_index() -> Result<()> {
    let store = TestStore::new()?;
    let expr = selector(r#"["MATCH", [".", "text"], "hello"]"#);
    match SqliteQuery::new(&store, &store.conn, &expr, None) {
        Err(QueryError::NoSuchIndex(property)) => assert_eq!(property, "text"),
        other => panic!("expected NoSuchIndex, got {:?}", other.map(|q| q.sql().to_string())),
    }
    Ok(())
}

#[test]
fn full_text_match_end_to_end() -> Result<()> {
    let mut store = TestStore::new()?;
    store.fts.push("text".to_string());
    store
        .conn
        .execute_batch("CREATE VIRTUAL TABLE \"kv_default::text\" USING fts4(text)")?;

    store.put("doc1", r#"{"text":"hello world"}"#)?;
    store.put("doc2", r#"{"text":"goodbye world"}"#)?;
    for (rowid, text) in [(1, "hello world"), (2, "goodbye world")] {
        store.conn.execute(
            "INSERT INTO \"kv_default::text\" (rowid, text) VALUES (?1, ?2)",
            (rowid, text),
        )?;
    }

    let expr = selector(r#"["MATCH", [".", "text"], "hello"]"#);
    let mut query = SqliteQuery::new(&store, &store.conn, &expr, None)?;
    assert_eq!(
        query.sql(),
        "SELECT sequence, key, meta, length(body), offsets(\"kv_default::text\") \
         FROM kv_default, \"kv_default::text\" AS FTS1 \
         WHERE ((FTS1.text MATCH 'hello' AND FTS1.rowid = kv_default.sequence)) \
         LIMIT $limit OFFSET $offset"
    );
    assert_eq!(query.fts_properties(), ["text"]);

    let mut rows = query.run(&QueryOptions::default())?;
    assert!(rows.has_full_text());
    {
        let row = rows.next()?.unwrap();
        assert_eq!(row.sequence, 1);
        assert_eq!(row.record_id, b"doc1");
        let terms = row.full_text_terms()?;
        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0].term_index, 0);
        assert_eq!(terms[0].byte_offset, 0);
        assert_eq!(terms[0].byte_length, 5);
    }
    assert_eq!(rows.matched_text(&store)?, "hello world");
    // A record whose sequence moved on since indexing yields no text.
    assert_eq!(rows.matched_text(&StaleStore(&store))?, "");

    assert!(rows.next()?.is_none());
    Ok(())
}
