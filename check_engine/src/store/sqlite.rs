//! SQLite-backed [`Store`] adapter: the relational-DB adapter from §6.
//!
//! SQLite gives the kernel a real, transactional, embeddable relational
//! engine without a network dependency — `ResultWriter::upsert_current`'s
//! archive-then-insert (§4.5) maps directly onto a `rusqlite` transaction.

use std::sync::Mutex;

use rusqlite::{params_from_iter, types::Value as SqlValue, Connection, ToSql};
use serde_json::Value;

use super::{schema, Filter, Row, Store, StoreError};

/// A `Store` backed by a single SQLite connection, guarded by a mutex so
/// the trait can offer `&self` methods while `rusqlite::Connection` itself
/// requires `&mut self` for statements.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path` and ensure every
    /// persisted table from §6 exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the connection cannot be
    /// opened or the schema cannot be created.
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Persistence(e.to_string()))?;
        let store = Self { conn: Mutex::new(conn) };
        store.create_tables()?;
        Ok(store)
    }

    /// Open a private in-memory database — used in tests and for ephemeral
    /// sample-evaluation runs that never need to persist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Persistence(e.to_string()))?;
        let store = Self { conn: Mutex::new(conn) };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("sqlite store mutex poisoned");
        conn.execute_batch(DDL).map_err(|e| StoreError::Persistence(e.to_string()))
    }
}

/// One `CREATE TABLE IF NOT EXISTS` per §6 table. Every column is `TEXT`
/// except the handful of genuinely numeric/boolean ones — JSON blob
/// columns (`metadata`, `resource_json`, ...) are stored as serialized
/// text, matching the "opaque blob" framing in §3/§6.
const DDL: &str = r"
CREATE TABLE IF NOT EXISTS framework (
    id TEXT PRIMARY KEY, name TEXT, description TEXT, path TEXT, version TEXT,
    created_at TEXT, updated_at TEXT, active INTEGER
);
CREATE TABLE IF NOT EXISTS control (
    id TEXT PRIMARY KEY, framework_id TEXT, control_parent_id TEXT, control_name TEXT,
    family_name TEXT, control_long_name TEXT, control_text TEXT, control_discussion TEXT,
    control_summary TEXT, source_control_mapping_emb TEXT, control_eval_criteria TEXT,
    created_at TEXT, updated_at TEXT, active INTEGER, source_control_mapping TEXT,
    order_index INTEGER, control_short_summary TEXT
);
CREATE TABLE IF NOT EXISTS standard (
    id TEXT PRIMARY KEY, name TEXT, short_description TEXT, long_description TEXT, path TEXT,
    labels TEXT, created_at TEXT, updated_at TEXT, active INTEGER, framework_id TEXT, "index" INTEGER
);
CREATE TABLE IF NOT EXISTS standard_control_mapping (
    id TEXT PRIMARY KEY, standard_id TEXT, control_id TEXT, additional_selection_parameters TEXT,
    additional_guidance TEXT, created_at TEXT, updated_at TEXT
);
CREATE TABLE IF NOT EXISTS checks (
    id TEXT PRIMARY KEY, name TEXT, description TEXT, output_statements TEXT, fix_details TEXT,
    created_by TEXT, category TEXT, metadata TEXT, updated_by TEXT, created_at TEXT,
    updated_at TEXT, is_deleted INTEGER
);
CREATE TABLE IF NOT EXISTS control_checks_mapping (
    control_id TEXT, check_id TEXT, created_at TEXT, updated_at TEXT, is_deleted INTEGER
);
CREATE TABLE IF NOT EXISTS connections (
    id TEXT PRIMARY KEY, customer_id TEXT, type INTEGER, credentials TEXT, created_at TEXT,
    updated_at TEXT, created_by TEXT, updated_by TEXT, synced_at TEXT, sync_status TEXT,
    sync_error TEXT, sync_frequency TEXT, metadata TEXT, is_deleted INTEGER, info TEXT, alias TEXT
);
CREATE TABLE IF NOT EXISTS con_mon_results (
    id TEXT PRIMARY KEY, customer_id TEXT, connection_id TEXT, check_id TEXT, result TEXT,
    result_message TEXT, success_count INTEGER, failure_count INTEGER, success_percentage REAL,
    success_resources TEXT, failed_resources TEXT, exclusions TEXT, resource_json TEXT,
    created_at TEXT, updated_at TEXT
);
CREATE TABLE IF NOT EXISTS con_mon_results_history (
    id TEXT, customer_id TEXT, connection_id TEXT, check_id TEXT, result TEXT,
    result_message TEXT, success_count INTEGER, failure_count INTEGER, success_percentage REAL,
    success_resources TEXT, failed_resources TEXT, exclusions TEXT, resource_json TEXT,
    created_at TEXT, updated_at TEXT, archived_at TEXT
);
";

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => {
            SqlValue::Text(serde_json::to_string(value).unwrap_or_default())
        }
    }
}

/// Reverse of [`json_to_sql`]: a `TEXT` column round-trips to a JSON string
/// only if it actually parses as JSON array/object syntax; otherwise it's
/// a plain string value, matching how the columns above are populated.
fn sql_to_json(value: rusqlite::types::ValueRef<'_>) -> Value {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => {
            let s = String::from_utf8_lossy(t).into_owned();
            if (s.starts_with('{') && s.ends_with('}')) || (s.starts_with('[') && s.ends_with(']')) {
                serde_json::from_str(&s).unwrap_or(Value::String(s))
            } else {
                Value::String(s)
            }
        }
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
    }
}

fn build_where(filter: &Filter<'_>) -> (String, Vec<SqlValue>) {
    if filter.is_empty() {
        return (String::new(), Vec::new());
    }
    let clauses: Vec<String> = filter
        .iter()
        .enumerate()
        .map(|(i, (col, _))| format!("\"{col}\" = ?{}", i + 1))
        .collect();
    let values = filter.iter().map(|(_, v)| json_to_sql(v)).collect();
    (format!(" WHERE {}", clauses.join(" AND ")), values)
}

impl Store for SqliteStore {
    fn select(&self, table: &str, filter: &Filter<'_>) -> Result<Vec<Row>, StoreError> {
        let conn = self.conn.lock().expect("sqlite store mutex poisoned");
        let (where_clause, values) = build_where(filter);
        let sql = format!("SELECT * FROM \"{table}\"{where_clause}");
        let mut stmt = conn.prepare(&sql).map_err(|e| StoreError::Persistence(e.to_string()))?;
        let column_names: Vec<String> = stmt.column_names().iter().map(|s| (*s).to_owned()).collect();

        let params: Vec<&dyn ToSql> = values.iter().map(|v| v as &dyn ToSql).collect();
        let rows = stmt
            .query_map(params_from_iter(params), |r| {
                let mut row = Row::new();
                for (i, name) in column_names.iter().enumerate() {
                    row.insert(name.clone(), sql_to_json(r.get_ref(i)?));
                }
                Ok(row)
            })
            .map_err(|e| StoreError::Persistence(e.to_string()))?;

        rows.collect::<Result<Vec<_>, _>>().map_err(|e| StoreError::Persistence(e.to_string()))
    }

    fn insert(&self, table: &str, row: &Row) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("sqlite store mutex poisoned");
        insert_row(&conn, table, row)
    }

    fn update(&self, table: &str, filter: &Filter<'_>, changes: &Row) -> Result<usize, StoreError> {
        let conn = self.conn.lock().expect("sqlite store mutex poisoned");
        let mut set_cols: Vec<&String> = changes.keys().collect();
        set_cols.sort();
        let set_clause: Vec<String> = set_cols
            .iter()
            .enumerate()
            .map(|(i, col)| format!("\"{col}\" = ?{}", i + 1))
            .collect();
        let (where_clause, where_values) = build_where_offset(filter, set_cols.len());
        let sql = format!("UPDATE \"{table}\" SET {}{where_clause}", set_clause.join(", "));

        let mut values: Vec<SqlValue> = set_cols.iter().map(|c| json_to_sql(&changes[*c])).collect();
        values.extend(where_values);
        let params: Vec<&dyn ToSql> = values.iter().map(|v| v as &dyn ToSql).collect();

        conn.execute(&sql, params_from_iter(params))
            .map_err(|e| StoreError::Persistence(e.to_string()))
    }

    fn delete(&self, table: &str, filter: &Filter<'_>) -> Result<usize, StoreError> {
        let conn = self.conn.lock().expect("sqlite store mutex poisoned");
        let (where_clause, values) = build_where(filter);
        let sql = format!("DELETE FROM \"{table}\"{where_clause}");
        let params: Vec<&dyn ToSql> = values.iter().map(|v| v as &dyn ToSql).collect();
        conn.execute(&sql, params_from_iter(params))
            .map_err(|e| StoreError::Persistence(e.to_string()))
    }

    fn archive_then_insert_result(
        &self,
        customer_id: &str,
        connection_id: &str,
        check_id: &str,
        new_row: Row,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().expect("sqlite store mutex poisoned");
        let txn = conn.transaction().map_err(|e| StoreError::Persistence(e.to_string()))?;

        let filter_values = [
            SqlValue::Text(customer_id.to_owned()),
            SqlValue::Text(connection_id.to_owned()),
            SqlValue::Text(check_id.to_owned()),
        ];

        let existing: Vec<Row> = {
            let mut stmt = txn
                .prepare(
                    "SELECT * FROM con_mon_results WHERE customer_id = ?1 AND connection_id = ?2 AND check_id = ?3",
                )
                .map_err(|e| StoreError::Persistence(e.to_string()))?;
            let column_names: Vec<String> = stmt.column_names().iter().map(|s| (*s).to_owned()).collect();
            let params: Vec<&dyn ToSql> = filter_values.iter().map(|v| v as &dyn ToSql).collect();
            let rows = stmt
                .query_map(params_from_iter(params), |r| {
                    let mut row = Row::new();
                    for (i, name) in column_names.iter().enumerate() {
                        row.insert(name.clone(), sql_to_json(r.get_ref(i)?));
                    }
                    Ok(row)
                })
                .map_err(|e| StoreError::Persistence(e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(|e| StoreError::Persistence(e.to_string()))?
        };

        let archived_at = chrono::Utc::now();
        for old_row in existing {
            let history_row = super::archive_row(old_row, archived_at);
            insert_row(&txn, schema::CON_MON_RESULTS_HISTORY_TABLE, &history_row)?;
        }

        {
            let params: Vec<&dyn ToSql> = filter_values.iter().map(|v| v as &dyn ToSql).collect();
            txn.execute(
                "DELETE FROM con_mon_results WHERE customer_id = ?1 AND connection_id = ?2 AND check_id = ?3",
                params_from_iter(params),
            )
            .map_err(|e| StoreError::Persistence(e.to_string()))?;
        }

        insert_row(&txn, schema::CON_MON_RESULTS_TABLE, &new_row)?;

        txn.commit().map_err(|e| StoreError::Persistence(e.to_string()))
    }
}

fn insert_row(conn: &Connection, table: &str, row: &Row) -> Result<(), StoreError> {
    let mut cols: Vec<&String> = row.keys().collect();
    cols.sort();
    let col_list = cols.iter().map(|c| format!("\"{c}\"")).collect::<Vec<_>>().join(", ");
    let placeholders = (1..=cols.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ");
    let sql = format!("INSERT INTO \"{table}\" ({col_list}) VALUES ({placeholders})");
    let values: Vec<SqlValue> = cols.iter().map(|c| json_to_sql(&row[*c])).collect();
    let params: Vec<&dyn ToSql> = values.iter().map(|v| v as &dyn ToSql).collect();
    conn.execute(&sql, params_from_iter(params))
        .map(|_| ())
        .map_err(|e| StoreError::Persistence(e.to_string()))
}

fn build_where_offset(filter: &Filter<'_>, offset: usize) -> (String, Vec<SqlValue>) {
    if filter.is_empty() {
        return (String::new(), Vec::new());
    }
    let clauses: Vec<String> = filter
        .iter()
        .enumerate()
        .map(|(i, (col, _))| format!("\"{col}\" = ?{}", offset + i + 1))
        .collect();
    let values = filter.iter().map(|(_, v)| json_to_sql(v)).collect();
    (format!(" WHERE {}", clauses.join(" AND ")), values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_row(id: &str, customer: &str, connection: &str, check: &str) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), json!(id));
        row.insert("customer_id".into(), json!(customer));
        row.insert("connection_id".into(), json!(connection));
        row.insert("check_id".into(), json!(check));
        row.insert("result".into(), json!("success"));
        row.insert("result_message".into(), json!("ok"));
        row.insert("success_count".into(), json!(1));
        row.insert("failure_count".into(), json!(0));
        row.insert("success_percentage".into(), json!(100.0));
        row.insert("success_resources".into(), json!(["r1"]));
        row.insert("failed_resources".into(), json!([]));
        row.insert("exclusions".into(), json!([]));
        row.insert("resource_json".into(), json!({"r1": true}));
        row.insert("created_at".into(), json!("2026-01-01T00:00:00Z"));
        row.insert("updated_at".into(), json!("2026-01-01T00:00:00Z"));
        row
    }

    #[test]
    fn test_insert_and_select_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert("con_mon_results", &sample_row("row-1", "cust", "conn", "chk")).unwrap();
        let rows = store
            .select("con_mon_results", &[("check_id", &json!("chk"))])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["result"], json!("success"));
    }

    #[test]
    fn test_archive_then_insert_moves_prior_row_to_history() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert("con_mon_results", &sample_row("row-1", "cust", "conn", "chk")).unwrap();

        let new_row = sample_row("row-2", "cust", "conn", "chk");
        store.archive_then_insert_result("cust", "conn", "chk", new_row).unwrap();

        let current = store.select("con_mon_results", &[("check_id", &json!("chk"))]).unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0]["id"], json!("row-2"));

        let history = store.select("con_mon_results_history", &[("check_id", &json!("chk"))]).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["id"], json!("row-1"));
        assert!(history[0].contains_key("archived_at"));
    }

    #[test]
    fn test_archive_then_insert_twice_accumulates_one_history_row_per_call() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .archive_then_insert_result("cust", "conn", "chk", sample_row("row-1", "cust", "conn", "chk"))
            .unwrap();
        store
            .archive_then_insert_result("cust", "conn", "chk", sample_row("row-2", "cust", "conn", "chk"))
            .unwrap();
        store
            .archive_then_insert_result("cust", "conn", "chk", sample_row("row-3", "cust", "conn", "chk"))
            .unwrap();

        let current = store.select("con_mon_results", &[("check_id", &json!("chk"))]).unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0]["id"], json!("row-3"));

        let history = store.select("con_mon_results_history", &[("check_id", &json!("chk"))]).unwrap();
        assert_eq!(history.len(), 2);
    }
}
