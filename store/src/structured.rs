//! Structured backend: one SQLite table per collection.
//!
//! Each row keeps the record body as JSON text, with the primary key split
//! out into its own `pk` column and insertion order in `seq`. Secondary
//! indices are expression indices over `json_extract(body, '$.<keyPath>')`,
//! so unique indices are enforced by the engine itself.

use crate::{
    error::Result, query::IndexValue, CollectionDef, CollectionName, Connection, IndexDef, Key,
    KeyMode, KeyRange, Op, Record, StoreError,
};
use serde_json::{Map, Value};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite};

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Name of the table backing a collection.
pub(crate) fn table_name(collection: CollectionName) -> &'static str {
    collection.as_str()
}

/// Name of the SQLite index backing a secondary index.
pub(crate) fn index_name(collection: CollectionName, index: &IndexDef) -> String {
    format!("{}__{}", collection.as_str(), index.name)
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn index_expr(key_path: &str) -> String {
    format!("json_extract(body, '$.{key_path}')")
}

pub(crate) fn create_table_sql(def: &CollectionDef) -> String {
    let table = quote(table_name(def.name));
    match def.key_mode {
        // A restored key can be lower than existing ones, so insertion order
        // is kept apart from the key.
        KeyMode::Generated => format!(
            "CREATE TABLE IF NOT EXISTS {table} \
             (pk INTEGER PRIMARY KEY AUTOINCREMENT, seq INTEGER NOT NULL UNIQUE, body TEXT NOT NULL)"
        ),
        // `pk` has no declared type so integer and text keys keep their type.
        KeyMode::Supplied => format!(
            "CREATE TABLE IF NOT EXISTS {table} \
             (seq INTEGER PRIMARY KEY AUTOINCREMENT, pk NOT NULL UNIQUE, body TEXT NOT NULL)"
        ),
    }
}

pub(crate) fn create_index_sql(def: &CollectionDef, index: &IndexDef) -> String {
    format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        quote(&index_name(def.name, index)),
        quote(table_name(def.name)),
        index_expr(index.key_path),
    )
}

/// Matches one key. The type check stops column affinity from turning
/// `'1'` into `1`.
const KEY_MATCH: &str = "pk = ? AND typeof(pk) = ?";

/// Bind a key for [`KEY_MATCH`].
fn bind_key<'q>(query: SqliteQuery<'q>, key: &Key) -> SqliteQuery<'q> {
    match key {
        Key::Int(i) => query.bind(*i).bind("integer"),
        Key::Text(s) => query.bind(s.clone()).bind("text"),
    }
}

/// Insertion position for a row in a generated-key table.
fn next_seq(table: &str) -> String {
    format!("(SELECT COALESCE(MAX(seq), 0) + 1 FROM {table})")
}

fn bind_index_value<'q>(query: SqliteQuery<'q>, value: &IndexValue) -> SqliteQuery<'q> {
    match value {
        IndexValue::Number(n) => query.bind(*n),
        IndexValue::Text(s) => query.bind(s.clone()),
    }
}

fn engine_error(collection: CollectionName, op: Op, err: sqlx::Error) -> StoreError {
    if let Some(db) = err.as_database_error() {
        if db.is_unique_violation() {
            return StoreError::Constraint {
                collection,
                op,
                detail: db.message().to_string(),
            };
        }
    }
    tracing::error!(%collection, %op, error = %err, "storage engine failure");
    StoreError::storage(collection, op, err)
}

fn encode_body(def: &CollectionDef, record: &Record, op: Op) -> Result<String> {
    let mut body = record.as_map().clone();
    body.remove(def.key_path);
    serde_json::to_string(&body).map_err(|source| StoreError::Serialization {
        collection: def.name,
        op,
        source,
    })
}

fn decode_row(def: &CollectionDef, row: &SqliteRow, op: Op) -> Result<Record> {
    let read = |err: sqlx::Error| engine_error(def.name, op, err);

    let kind: String = row.try_get("kind").map_err(read)?;
    let key = if kind == "integer" {
        Key::Int(row.try_get("pk").map_err(read)?)
    } else {
        Key::Text(row.try_get("pk").map_err(read)?)
    };

    let body: String = row.try_get("body").map_err(read)?;
    let mut fields: Map<String, Value> =
        serde_json::from_str(&body).map_err(|source| StoreError::Serialization {
            collection: def.name,
            op,
            source,
        })?;
    fields.insert(def.key_path.to_string(), key.to_value());

    Ok(Record::from(fields))
}

/// Insert a record. With no key the table assigns the next sequence value.
pub(crate) async fn insert(
    conn: &Connection,
    def: &CollectionDef,
    key: Option<&Key>,
    record: &Record,
    op: Op,
) -> Result<Key> {
    let body = encode_body(def, record, op)?;
    let table = quote(table_name(def.name));

    let sql = match (def.key_mode, key) {
        (KeyMode::Generated, None) => {
            format!("INSERT INTO {table} (seq, body) VALUES ({}, ?)", next_seq(&table))
        }
        (KeyMode::Generated, Some(_)) => {
            format!("INSERT INTO {table} (pk, seq, body) VALUES (?, {}, ?)", next_seq(&table))
        }
        (KeyMode::Supplied, _) => format!("INSERT INTO {table} (pk, body) VALUES (?, ?)"),
    };

    let mut query = sqlx::query(&sql);
    if let Some(key) = key {
        query = match key {
            Key::Int(i) => query.bind(*i),
            Key::Text(s) => query.bind(s.clone()),
        };
    }
    let result = query
        .bind(body)
        .execute(conn.pool())
        .await
        .map_err(|e| engine_error(def.name, op, e))?;

    Ok(match key {
        Some(key) => key.clone(),
        None => Key::Int(result.last_insert_rowid()),
    })
}

pub(crate) async fn fetch(
    conn: &Connection,
    def: &CollectionDef,
    key: &Key,
    op: Op,
) -> Result<Option<Record>> {
    let sql = format!(
        "SELECT pk, typeof(pk) AS kind, body FROM {} WHERE {KEY_MATCH}",
        quote(table_name(def.name))
    );
    let row = bind_key(sqlx::query(&sql), key)
        .fetch_optional(conn.pool())
        .await
        .map_err(|e| engine_error(def.name, op, e))?;

    row.map(|row| decode_row(def, &row, op)).transpose()
}

/// Fetch every record, or those in `range` over the primary key or `index`.
///
/// Without an index or range the result is in insertion order. A range over
/// the primary key sorts by key. An index lookup sorts by index value, then
/// insertion order, and skips records without an indexable value.
pub(crate) async fn fetch_all(
    conn: &Connection,
    def: &CollectionDef,
    range: Option<&KeyRange>,
    index: Option<&IndexDef>,
    op: Op,
) -> Result<Vec<Record>> {
    let (expr, mut clauses, order) = match index {
        Some(index) => {
            let expr = index_expr(index.key_path);
            let present = format!(
                "json_type(body, '$.{}') IN ('integer', 'real', 'text', 'true', 'false')",
                index.key_path
            );
            let order = format!("{expr}, seq");
            (expr, vec![present], order)
        }
        None if range.is_some() => ("pk".to_string(), Vec::new(), "pk".to_string()),
        None => ("pk".to_string(), Vec::new(), "seq".to_string()),
    };

    let mut params = Vec::new();
    if let Some(range) = range {
        if let Some(lower) = &range.lower {
            clauses.push(format!("{expr} {} ?", if lower.open { ">" } else { ">=" }));
            params.push(&lower.value);
        }
        if let Some(upper) = &range.upper {
            clauses.push(format!("{expr} {} ?", if upper.open { "<" } else { "<=" }));
            params.push(&upper.value);
        }
    }

    let filter = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT pk, typeof(pk) AS kind, body FROM {}{filter} ORDER BY {order}",
        quote(table_name(def.name))
    );

    let mut query = sqlx::query(&sql);
    for value in params {
        query = bind_index_value(query, value);
    }
    let rows = query
        .fetch_all(conn.pool())
        .await
        .map_err(|e| engine_error(def.name, op, e))?;

    rows.iter().map(|row| decode_row(def, row, op)).collect()
}

/// Read-modify-write one record inside a single transaction.
pub(crate) async fn modify<F>(
    conn: &Connection,
    def: &CollectionDef,
    key: &Key,
    op: Op,
    change: F,
) -> Result<Record>
where
    F: FnOnce(Record) -> Result<Record> + Send,
{
    let table = quote(table_name(def.name));
    let fail = |e: sqlx::Error| engine_error(def.name, op, e);

    let mut tx = conn.pool().begin().await.map_err(fail)?;

    let select = format!("SELECT pk, typeof(pk) AS kind, body FROM {table} WHERE {KEY_MATCH}");
    let row = bind_key(sqlx::query(&select), key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(fail)?;
    let Some(row) = row else {
        return Err(StoreError::NotFound {
            collection: def.name,
            op,
            key: key.clone(),
        });
    };

    let existing = decode_row(def, &row, op)?;
    drop(row);
    let updated = change(existing)?;
    let body = encode_body(def, &updated, op)?;

    let update = format!("UPDATE {table} SET body = ? WHERE {KEY_MATCH}");
    bind_key(sqlx::query(&update).bind(body), key)
        .execute(&mut *tx)
        .await
        .map_err(fail)?;
    tx.commit().await.map_err(fail)?;

    Ok(updated)
}

/// Delete one record. Deleting an absent key is not an error.
pub(crate) async fn delete(conn: &Connection, def: &CollectionDef, key: &Key, op: Op) -> Result<()> {
    let sql = format!("DELETE FROM {} WHERE {KEY_MATCH}", quote(table_name(def.name)));
    bind_key(sqlx::query(&sql), key)
        .execute(conn.pool())
        .await
        .map_err(|e| engine_error(def.name, op, e))?;
    Ok(())
}

/// Delete every record. The key sequence is left alone, so generated keys
/// are never reused.
pub(crate) async fn clear(conn: &Connection, def: &CollectionDef, op: Op) -> Result<()> {
    let sql = format!("DELETE FROM {}", quote(table_name(def.name)));
    sqlx::query(&sql)
        .execute(conn.pool())
        .await
        .map_err(|e| engine_error(def.name, op, e))?;
    Ok(())
}
