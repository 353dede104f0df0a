//! CSV-file-backed [`Store`] adapter: a directory of `.csv` files with the
//! bit-exact column lists from §6, standing in for "a CSV table-files
//! backend" that a Check can be evaluated and reported against exactly as
//! the relational adapter.
//!
//! `checks.csv` dotted-flattens its three JSON blob columns
//! (`output_statements`, `fix_details`, `metadata`) into individual columns
//! (`metadata.operation.name`, `output_statements.success`, ...), per §6;
//! every other table's JSON blob columns are JSON-encoded within a single
//! cell since their shape is schemaless map data rather than a fixed
//! record. Arrays are always JSON-encoded within a single cell. Writes are
//! serialised by an in-process mutex plus an advisory `.lock` file
//! (create-exclusive, spin-retry, remove on drop) so that two processes
//! sharing the same directory cannot interleave a read-modify-write cycle —
//! the rename-on-commit temp file makes the swap itself atomic.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

use super::{schema, Filter, Row, Store, StoreError};

pub struct CsvStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl CsvStore {
    /// Use (and create if necessary) `dir` as the table-file directory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if `dir` cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(Self { dir, write_lock: Mutex::new(()) })
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.csv"))
    }

    /// Known header for `table`, in column order. Tables not in the §6
    /// catalog fall back to deriving a header from whatever rows already
    /// exist on disk.
    fn known_header(table: &str) -> Option<Vec<String>> {
        let cols: Vec<&str> = match table {
            "framework" => schema::FRAMEWORK.to_vec(),
            "control" => schema::CONTROL.to_vec(),
            "standard" => schema::STANDARD.to_vec(),
            "standard_control_mapping" => schema::STANDARD_CONTROL_MAPPING.to_vec(),
            "checks" => return Some(checks_flat_header()),
            "control_checks_mapping" => schema::CONTROL_CHECKS_MAPPING.to_vec(),
            "connections" => schema::CONNECTIONS.to_vec(),
            "con_mon_results" => schema::CON_MON_RESULTS.to_vec(),
            "con_mon_results_history" => return Some(schema::con_mon_results_history_columns().iter().map(|s| (*s).to_owned()).collect()),
            _ => return None,
        };
        Some(cols.into_iter().map(str::to_owned).collect())
    }

    fn read_table(&self, table: &str) -> Result<(Vec<String>, Vec<Row>), StoreError> {
        let path = self.table_path(table);
        if !path.is_file() {
            return Ok((Self::known_header(table).unwrap_or_default(), Vec::new()));
        }
        let mut reader = csv::Reader::from_path(&path).map_err(|e| StoreError::Io(e.to_string()))?;
        let header: Vec<String> = reader
            .headers()
            .map_err(|e| StoreError::Malformed(e.to_string()))?
            .iter()
            .map(str::to_owned)
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| StoreError::Malformed(e.to_string()))?;
            let mut flat = HashMap::new();
            for (col, cell) in header.iter().zip(record.iter()) {
                flat.insert(col.clone(), cell_to_value(cell));
            }
            rows.push(if table == "checks" { unflatten_checks_row(&flat) } else { flat });
        }
        Ok((header, rows))
    }

    fn write_table(&self, table: &str, header: &[String], rows: &[Row]) -> Result<(), StoreError> {
        let _guard = AdvisoryLock::acquire(&self.dir, table)?;
        let final_path = self.table_path(table);
        let tmp_path = self.dir.join(format!("{table}.csv.tmp"));

        {
            let mut writer = csv::Writer::from_path(&tmp_path).map_err(|e| StoreError::Io(e.to_string()))?;
            writer.write_record(header).map_err(|e| StoreError::Io(e.to_string()))?;
            for row in rows {
                let flat = if table == "checks" { flatten_checks_row(row) } else { row.clone() };
                let record: Vec<String> = header
                    .iter()
                    .map(|col| flat.get(col).map(value_to_cell).unwrap_or_default())
                    .collect();
                writer.write_record(&record).map_err(|e| StoreError::Io(e.to_string()))?;
            }
            writer.flush().map_err(|e| StoreError::Io(e.to_string()))?;
        }

        fs::rename(&tmp_path, &final_path).map_err(|e| StoreError::Io(e.to_string()))
    }

    fn matches(row: &Row, filter: &Filter<'_>) -> bool {
        filter.iter().all(|(col, val)| row.get(*col).is_some_and(|v| v == *val))
    }
}

impl Store for CsvStore {
    fn select(&self, table: &str, filter: &Filter<'_>) -> Result<Vec<Row>, StoreError> {
        let (_, rows) = self.read_table(table)?;
        Ok(rows.into_iter().filter(|r| Self::matches(r, filter)).collect())
    }

    fn insert(&self, table: &str, row: &Row) -> Result<(), StoreError> {
        let _lock = self.write_lock.lock().expect("csv store mutex poisoned");
        let (mut header, mut rows) = self.read_table(table)?;
        if header.is_empty() {
            header = Self::known_header(table).unwrap_or_else(|| {
                let mut keys: Vec<String> = row.keys().cloned().collect();
                keys.sort();
                keys
            });
        }
        rows.push(row.clone());
        self.write_table(table, &header, &rows)
    }

    fn update(&self, table: &str, filter: &Filter<'_>, changes: &Row) -> Result<usize, StoreError> {
        let _lock = self.write_lock.lock().expect("csv store mutex poisoned");
        let (header, mut rows) = self.read_table(table)?;
        let mut updated = 0;
        for row in &mut rows {
            if Self::matches(row, filter) {
                for (k, v) in changes {
                    row.insert(k.clone(), v.clone());
                }
                updated += 1;
            }
        }
        if updated > 0 {
            self.write_table(table, &header, &rows)?;
        }
        Ok(updated)
    }

    fn delete(&self, table: &str, filter: &Filter<'_>) -> Result<usize, StoreError> {
        let _lock = self.write_lock.lock().expect("csv store mutex poisoned");
        let (header, rows) = self.read_table(table)?;
        let before = rows.len();
        let remaining: Vec<Row> = rows.into_iter().filter(|r| !Self::matches(r, filter)).collect();
        let removed = before - remaining.len();
        if removed > 0 {
            self.write_table(table, &header, &remaining)?;
        }
        Ok(removed)
    }

    fn archive_then_insert_result(
        &self,
        customer_id: &str,
        connection_id: &str,
        check_id: &str,
        new_row: Row,
    ) -> Result<(), StoreError> {
        let _lock = self.write_lock.lock().expect("csv store mutex poisoned");

        let key_filter = [
            ("customer_id", Value::String(customer_id.to_owned())),
            ("connection_id", Value::String(connection_id.to_owned())),
            ("check_id", Value::String(check_id.to_owned())),
        ];
        let filter_refs: Vec<(&str, &Value)> = key_filter.iter().map(|(k, v)| (*k, v)).collect();

        let (current_header, current_rows) = self.read_table(schema::CON_MON_RESULTS_TABLE)?;
        let current_header = if current_header.is_empty() {
            schema::CON_MON_RESULTS.iter().map(|s| (*s).to_owned()).collect()
        } else {
            current_header
        };
        let (matching, rest): (Vec<Row>, Vec<Row>) =
            current_rows.into_iter().partition(|r| Self::matches(r, &filter_refs));

        let archived_at = chrono::Utc::now();
        let (history_header, mut history_rows) = self.read_table(schema::CON_MON_RESULTS_HISTORY_TABLE)?;
        let history_header = if history_header.is_empty() {
            schema::con_mon_results_history_columns().iter().map(|s| (*s).to_owned()).collect()
        } else {
            history_header
        };
        for old_row in matching {
            history_rows.push(super::archive_row(old_row, archived_at));
        }
        self.write_table(schema::CON_MON_RESULTS_HISTORY_TABLE, &history_header, &history_rows)?;

        let mut remaining = rest;
        remaining.push(new_row);
        self.write_table(schema::CON_MON_RESULTS_TABLE, &current_header, &remaining)
    }
}

// ---------------------------------------------------------------------------
// `checks` table dotted-flattening
// ---------------------------------------------------------------------------

fn checks_flat_header() -> Vec<String> {
    [
        "id",
        "name",
        "description",
        "created_by",
        "category",
        "updated_by",
        "created_at",
        "updated_at",
        "is_deleted",
        "output_statements.success",
        "output_statements.failure",
        "output_statements.partial",
        "fix_details.description",
        "fix_details.instructions",
        "fix_details.estimated_time",
        "fix_details.automation_available",
        "metadata.resource_type",
        "metadata.field_path",
        "metadata.operation.name",
        "metadata.operation.logic",
        "metadata.expected_value",
        "metadata.tags",
        "metadata.severity",
        "metadata.category",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

fn flatten_checks_row(row: &Row) -> Row {
    let mut flat = Row::new();
    for key in ["id", "name", "description", "created_by", "category", "updated_by", "created_at", "updated_at", "is_deleted"] {
        if let Some(v) = row.get(key) {
            flat.insert(key.to_owned(), v.clone());
        }
    }
    if let Some(os) = row.get("output_statements") {
        for sub in ["success", "failure", "partial"] {
            flat.insert(format!("output_statements.{sub}"), os.get(sub).cloned().unwrap_or(Value::Null));
        }
    }
    if let Some(fd) = row.get("fix_details") {
        for sub in ["description", "instructions", "estimated_time", "automation_available"] {
            flat.insert(format!("fix_details.{sub}"), fd.get(sub).cloned().unwrap_or(Value::Null));
        }
    }
    if let Some(md) = row.get("metadata") {
        flat.insert("metadata.resource_type".into(), md.get("resource_type").cloned().unwrap_or(Value::Null));
        flat.insert("metadata.field_path".into(), md.get("field_path").cloned().unwrap_or(Value::Null));
        let op = md.get("operation");
        flat.insert(
            "metadata.operation.name".into(),
            op.and_then(|o| o.get("name")).cloned().unwrap_or(Value::Null),
        );
        flat.insert(
            "metadata.operation.logic".into(),
            op.and_then(|o| o.get("logic")).cloned().unwrap_or(Value::Null),
        );
        flat.insert("metadata.expected_value".into(), md.get("expected_value").cloned().unwrap_or(Value::Null));
        flat.insert("metadata.tags".into(), md.get("tags").cloned().unwrap_or_else(|| Value::Array(Vec::new())));
        flat.insert("metadata.severity".into(), md.get("severity").cloned().unwrap_or(Value::Null));
        flat.insert("metadata.category".into(), md.get("category").cloned().unwrap_or(Value::Null));
    }
    flat
}

fn unflatten_checks_row(flat: &HashMap<String, Value>) -> Row {
    let mut row = Row::new();
    for key in ["id", "name", "description", "created_by", "category", "updated_by", "created_at", "updated_at", "is_deleted"] {
        if let Some(v) = flat.get(key) {
            row.insert(key.to_owned(), v.clone());
        }
    }
    let get = |k: &str| flat.get(k).cloned().unwrap_or(Value::Null);
    row.insert(
        "output_statements".into(),
        serde_json::json!({
            "success": get("output_statements.success"),
            "failure": get("output_statements.failure"),
            "partial": get("output_statements.partial"),
        }),
    );
    row.insert(
        "fix_details".into(),
        serde_json::json!({
            "description": get("fix_details.description"),
            "instructions": get("fix_details.instructions"),
            "estimated_time": get("fix_details.estimated_time"),
            "automation_available": get("fix_details.automation_available"),
        }),
    );
    row.insert(
        "metadata".into(),
        serde_json::json!({
            "resource_type": get("metadata.resource_type"),
            "field_path": get("metadata.field_path"),
            "operation": {
                "name": get("metadata.operation.name"),
                "logic": get("metadata.operation.logic"),
            },
            "expected_value": get("metadata.expected_value"),
            "tags": get("metadata.tags"),
            "severity": get("metadata.severity"),
            "category": get("metadata.category"),
        }),
    );
    row
}

// ---------------------------------------------------------------------------
// Cell <-> Value conversion
// ---------------------------------------------------------------------------

fn value_to_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(_) | Value::Number(_) | Value::Array(_) | Value::Object(_) => {
            serde_json::to_string(value).unwrap_or_default()
        }
    }
}

fn cell_to_value(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    if let Ok(v) = serde_json::from_str::<Value>(cell) {
        if !v.is_string() {
            return v;
        }
    }
    Value::String(cell.to_owned())
}

// ---------------------------------------------------------------------------
// Advisory lock: create-exclusive lock file, spin-retry, remove on drop.
// ---------------------------------------------------------------------------

struct AdvisoryLock {
    path: PathBuf,
}

impl AdvisoryLock {
    fn acquire(dir: &Path, table: &str) -> Result<Self, StoreError> {
        let path = dir.join(format!(".{table}.lock"));
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() > deadline {
                        return Err(StoreError::Io(format!("timed out waiting for lock on table '{table}'")));
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(StoreError::Io(e.to_string())),
            }
        }
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_and_select_roundtrip_generic_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::open(dir.path()).unwrap();
        let mut row = Row::new();
        row.insert("id".into(), json!("f1"));
        row.insert("name".into(), json!("NIST 800-53"));
        row.insert("description".into(), json!("desc"));
        row.insert("path".into(), json!("/nist"));
        row.insert("version".into(), json!("5"));
        row.insert("created_at".into(), json!("2026-01-01"));
        row.insert("updated_at".into(), json!("2026-01-01"));
        row.insert("active".into(), json!(true));
        store.insert("framework", &row).unwrap();

        let rows = store.select("framework", &[("id", &json!("f1"))]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("NIST 800-53"));
        assert_eq!(rows[0]["active"], json!(true));
    }

    #[test]
    fn test_checks_table_dotted_flatten_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::open(dir.path()).unwrap();
        let mut row = Row::new();
        row.insert("id".into(), json!("c1"));
        row.insert("name".into(), json!("Buckets encrypted"));
        row.insert("description".into(), json!(null));
        row.insert("created_by".into(), json!("generator"));
        row.insert("category".into(), json!("network_security"));
        row.insert("updated_by".into(), json!(null));
        row.insert("created_at".into(), json!("2026-01-01"));
        row.insert("updated_at".into(), json!("2026-01-01"));
        row.insert("is_deleted".into(), json!(false));
        row.insert("output_statements".into(), json!({"success": "ok", "failure": "bad", "partial": "meh"}));
        row.insert(
            "fix_details".into(),
            json!({"description": "enable encryption", "instructions": ["step1"], "estimated_time": "5m", "automation_available": false}),
        );
        row.insert(
            "metadata".into(),
            json!({
                "resource_type": "con_mon_v2.mappings.aws.S3Bucket",
                "field_path": "encrypted",
                "operation": {"name": "==", "logic": null},
                "expected_value": true,
                "tags": ["sc-13"],
                "severity": "high",
                "category": "network_security",
            }),
        );
        store.insert("checks", &row).unwrap();

        let rows = store.select("checks", &[("id", &json!("c1"))]).unwrap();
        assert_eq!(rows.len(), 1);
        let got = &rows[0];
        assert_eq!(got["metadata"]["operation"]["name"], json!("=="));
        assert_eq!(got["metadata"]["expected_value"], json!(true));
        assert_eq!(got["output_statements"]["success"], json!("ok"));
        assert_eq!(got["fix_details"]["instructions"], json!(["step1"]));
    }

    #[test]
    fn test_archive_then_insert_on_csv_backend() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::open(dir.path()).unwrap();

        let mut first = Row::new();
        first.insert("id".into(), json!("row-1"));
        first.insert("customer_id".into(), json!("cust"));
        first.insert("connection_id".into(), json!("conn"));
        first.insert("check_id".into(), json!("chk"));
        first.insert("result".into(), json!("success"));
        first.insert("result_message".into(), json!("ok"));
        first.insert("success_count".into(), json!(1));
        first.insert("failure_count".into(), json!(0));
        first.insert("success_percentage".into(), json!(100.0));
        first.insert("success_resources".into(), json!(["r1"]));
        first.insert("failed_resources".into(), json!([]));
        first.insert("exclusions".into(), json!([]));
        first.insert("resource_json".into(), json!({}));
        first.insert("created_at".into(), json!("2026-01-01"));
        first.insert("updated_at".into(), json!("2026-01-01"));

        store.archive_then_insert_result("cust", "conn", "chk", first.clone()).unwrap();

        let mut second = first.clone();
        second.insert("id".into(), json!("row-2"));
        store.archive_then_insert_result("cust", "conn", "chk", second).unwrap();

        let current = store.select("con_mon_results", &[("check_id", &json!("chk"))]).unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0]["id"], json!("row-2"));

        let history = store.select("con_mon_results_history", &[("check_id", &json!("chk"))]).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["id"], json!("row-1"));
    }
}
