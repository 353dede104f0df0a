//! Persistence layer (§4.5, §6): the `Store` collaborator interface, the
//! bit-exact persisted table schemas, and the [`ResultWriter`] that
//! implements the archive-then-insert protocol for `con_mon_results`.
//!
//! Two concrete adapters ship, grounded in the retrieved corpus rather than
//! hand-rolled: [`sqlite::SqliteStore`] (a real embeddable relational engine,
//! standing in for "the relational-DB adapter") and [`csv::CsvStore`] (a
//! directory of `.csv` files with the dotted-flattened column lists below).
//! Both implement the same [`Store`] trait so `ResultWriter` and the
//! generator/orchestrator are backend-agnostic.

pub mod csv;
pub mod sqlite;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::check::CheckResult;
use crate::types::AggregateResult;

/// A single persisted row, keyed by column name. Every [`Store`] adapter
/// speaks this shape regardless of backend — SQLite rows and CSV rows are
/// both collapsed to it at the boundary.
pub type Row = HashMap<String, Value>;

/// An equality filter used by [`Store::select`]/[`Store::delete`]: every
/// pair must match for a row to be selected.
pub type Filter<'a> = [(&'a str, &'a Value)];

/// The bit-exact column lists from the distilled spec's §6, used by both
/// adapters to keep CSV headers and SQLite table definitions in lockstep.
pub mod schema {
    pub const FRAMEWORK: &[&str] = &[
        "id", "name", "description", "path", "version", "created_at", "updated_at", "active",
    ];

    pub const CONTROL: &[&str] = &[
        "id",
        "framework_id",
        "control_parent_id",
        "control_name",
        "family_name",
        "control_long_name",
        "control_text",
        "control_discussion",
        "control_summary",
        "source_control_mapping_emb",
        "control_eval_criteria",
        "created_at",
        "updated_at",
        "active",
        "source_control_mapping",
        "order_index",
        "control_short_summary",
    ];

    pub const STANDARD: &[&str] = &[
        "id",
        "name",
        "short_description",
        "long_description",
        "path",
        "labels",
        "created_at",
        "updated_at",
        "active",
        "framework_id",
        "index",
    ];

    pub const STANDARD_CONTROL_MAPPING: &[&str] = &[
        "id",
        "standard_id",
        "control_id",
        "additional_selection_parameters",
        "additional_guidance",
        "created_at",
        "updated_at",
    ];

    /// `output_statements`, `fix_details`, `metadata` are JSON blobs in the
    /// relational adapter; the CSV adapter dotted-flattens them (see
    /// [`super::csv`]).
    pub const CHECKS: &[&str] = &[
        "id",
        "name",
        "description",
        "output_statements",
        "fix_details",
        "created_by",
        "category",
        "metadata",
        "updated_by",
        "created_at",
        "updated_at",
        "is_deleted",
    ];

    pub const CONTROL_CHECKS_MAPPING: &[&str] =
        &["control_id", "check_id", "created_at", "updated_at", "is_deleted"];

    pub const CONNECTIONS: &[&str] = &[
        "id",
        "customer_id",
        "type",
        "credentials",
        "created_at",
        "updated_at",
        "created_by",
        "updated_by",
        "synced_at",
        "sync_status",
        "sync_error",
        "sync_frequency",
        "metadata",
        "is_deleted",
        "info",
        "alias",
    ];

    const CON_MON_RESULTS_BASE: &[&str] = &[
        "id",
        "customer_id",
        "connection_id",
        "check_id",
        "result",
        "result_message",
        "success_count",
        "failure_count",
        "success_percentage",
        "success_resources",
        "failed_resources",
        "exclusions",
        "resource_json",
        "created_at",
        "updated_at",
    ];

    pub const CON_MON_RESULTS: &[&str] = CON_MON_RESULTS_BASE;

    /// Same columns as `con_mon_results` plus `archived_at`.
    pub fn con_mon_results_history_columns() -> Vec<&'static str> {
        let mut cols: Vec<&'static str> = CON_MON_RESULTS_BASE.to_vec();
        cols.push("archived_at");
        cols
    }

    pub const CON_MON_RESULTS_TABLE: &str = "con_mon_results";
    pub const CON_MON_RESULTS_HISTORY_TABLE: &str = "con_mon_results_history";
}

/// The `Store` collaborator interface (§6): named-table CRUD plus one
/// purpose-built atomic operation for the archive-then-insert protocol.
///
/// A single generic `select`/`insert`/`update`/`delete` surface covers
/// reference data (`framework`, `control`, ...) and Check/Connection rows;
/// `archive_then_insert_result` is its own method rather than a generic
/// transaction closure because it is the one operation §4.5 requires to be
/// atomic end-to-end, and each backend has a different natural way to get
/// that guarantee (a SQL transaction vs. a lock file + rename-on-commit).
pub trait Store: Send + Sync {
    /// Fetch every row in `table` matching every `(column, value)` pair in
    /// `filter`. An empty filter returns every row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend rejects the read (unknown
    /// table, I/O failure, malformed on-disk data).
    fn select(&self, table: &str, filter: &Filter<'_>) -> Result<Vec<Row>, StoreError>;

    /// Insert one row into `table`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend rejects the write.
    fn insert(&self, table: &str, row: &Row) -> Result<(), StoreError>;

    /// Apply `changes` to every row in `table` matching `filter`. Returns
    /// the number of rows updated.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend rejects the write.
    fn update(&self, table: &str, filter: &Filter<'_>, changes: &Row) -> Result<usize, StoreError>;

    /// Delete every row in `table` matching `filter`. Returns the number of
    /// rows deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend rejects the write.
    fn delete(&self, table: &str, filter: &Filter<'_>) -> Result<usize, StoreError>;

    /// Archive every existing `con_mon_results` row for
    /// `(customer_id, connection_id, check_id)` into
    /// `con_mon_results_history`, then insert `new_row` as the sole current
    /// row for that key (§4.5).
    ///
    /// Must apply atomically: a crash partway through may leave orphan
    /// history rows, but must never leave the current row absent if an
    /// older one existed before the call.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the underlying transaction
    /// fails; the caller (the writer/orchestrator) treats this as a
    /// *Persistence error* per §7 and aborts the enclosing task.
    fn archive_then_insert_result(
        &self,
        customer_id: &str,
        connection_id: &str,
        check_id: &str,
        new_row: Row,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("store I/O error: {0}")]
    Io(String),

    #[error("store persistence error: {0}")]
    Persistence(String),

    #[error("malformed row data: {0}")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// Result Writer (§4.5)
// ---------------------------------------------------------------------------

/// Archive-then-insert orchestration on top of a [`Store`]: computes the
/// aggregate `ConMonResult` row for a Check's per-resource results and
/// hands the atomic archive+insert to the backing store.
pub struct ResultWriter<'a> {
    store: &'a dyn Store,
}

impl<'a> ResultWriter<'a> {
    #[must_use]
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    /// `upsert_current` (§4.5): for every `(check, results)` pair, archive
    /// the existing current row(s) for `(customer_id, connection_id,
    /// check.id)` and insert one freshly aggregated current row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on the first check whose archive+insert fails;
    /// checks processed before the failure remain committed (each check key
    /// is its own atomic unit, per §4.5's "atomically per check key").
    pub fn upsert_current(
        &self,
        results_per_check: &[(CheckSummary, Vec<CheckResult>)],
        customer_id: &str,
        connection_id: &str,
    ) -> Result<(), StoreError> {
        for (check, results) in results_per_check {
            let row = build_aggregate_row(check, results, customer_id, connection_id);
            self.store
                .archive_then_insert_result(customer_id, connection_id, &check.id, row)?;
            log::info!(
                "archived+inserted con_mon_results for customer={customer_id} connection={connection_id} check={}",
                check.id
            );
        }
        Ok(())
    }
}

/// The minimal view of a Check a writer needs: its id and name, for the
/// aggregate row's identity and default `result_message`.
#[derive(Debug, Clone)]
pub struct CheckSummary {
    pub id: String,
    pub name: String,
}

fn build_aggregate_row(check: &CheckSummary, results: &[CheckResult], customer_id: &str, connection_id: &str) -> Row {
    let success_count = results.iter().filter(|r| r.passed == Some(true)).count() as u64;
    let failure_count = results.iter().filter(|r| r.passed == Some(false)).count() as u64;
    let denom = success_count + failure_count;
    let success_percentage = if denom == 0 {
        0.0
    } else {
        100.0 * success_count as f64 / denom as f64
    };
    let result = AggregateResult::from_counts(success_count, failure_count);

    let success_resources: Vec<String> = results
        .iter()
        .filter(|r| r.passed == Some(true))
        .map(|r| r.resource_id.clone())
        .collect();
    let failed_resources: Vec<String> = results
        .iter()
        .filter(|r| r.passed == Some(false))
        .map(|r| r.resource_id.clone())
        .collect();

    let resource_json = serde_json::to_value(results).unwrap_or(Value::Null);
    let now = Utc::now();

    let mut row = Row::new();
    row.insert("id".into(), Value::String(uuid::Uuid::new_v4().to_string()));
    row.insert("customer_id".into(), Value::String(customer_id.to_owned()));
    row.insert("connection_id".into(), Value::String(connection_id.to_owned()));
    row.insert("check_id".into(), Value::String(check.id.clone()));
    row.insert("result".into(), Value::String(result.to_string()));
    row.insert(
        "result_message".into(),
        Value::String(format!("Check '{}' evaluated {} resources: {result}", check.name, results.len())),
    );
    row.insert("success_count".into(), Value::from(success_count));
    row.insert("failure_count".into(), Value::from(failure_count));
    row.insert(
        "success_percentage".into(),
        serde_json::Number::from_f64(success_percentage)
            .map(Value::Number)
            .unwrap_or(Value::from(0)),
    );
    row.insert("success_resources".into(), serde_json::to_value(success_resources).unwrap());
    row.insert("failed_resources".into(), serde_json::to_value(failed_resources).unwrap());
    row.insert("exclusions".into(), Value::Array(Vec::new()));
    row.insert("resource_json".into(), resource_json);
    row.insert("created_at".into(), Value::String(now.to_rfc3339()));
    row.insert("updated_at".into(), Value::String(now.to_rfc3339()));
    row
}

/// Stamp `archived_at` onto a current-row snapshot, producing the row to be
/// written into `con_mon_results_history`.
#[must_use]
pub fn archive_row(mut current_row: Row, archived_at: DateTime<Utc>) -> Row {
    current_row.insert("archived_at".into(), Value::String(archived_at.to_rfc3339()));
    current_row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::CheckResult as CR;

    fn result(resource_id: &str, passed: Option<bool>) -> CR {
        CR {
            check_id: "c1".to_owned(),
            resource_id: resource_id.to_owned(),
            passed,
            message: String::new(),
            error: None,
        }
    }

    #[test]
    fn test_build_aggregate_row_all_success() {
        let check = CheckSummary { id: "c1".to_owned(), name: "Buckets encrypted".to_owned() };
        let results = vec![result("r1", Some(true)), result("r2", Some(true))];
        let row = build_aggregate_row(&check, &results, "cust", "conn");
        assert_eq!(row["result"], Value::String("success".to_owned()));
        assert_eq!(row["success_count"], Value::from(2));
        assert_eq!(row["failure_count"], Value::from(0));
        assert_eq!(row["success_percentage"], serde_json::json!(100.0));
    }

    #[test]
    fn test_build_aggregate_row_excludes_execution_failures_from_counts() {
        let check = CheckSummary { id: "c1".to_owned(), name: "n".to_owned() };
        let results = vec![result("r1", Some(true)), result("r2", None)];
        let row = build_aggregate_row(&check, &results, "cust", "conn");
        assert_eq!(row["success_count"], Value::from(1));
        assert_eq!(row["failure_count"], Value::from(0));
        assert_eq!(row["result"], Value::String("success".to_owned()));
    }

    #[test]
    fn test_build_aggregate_row_mixed_is_partial() {
        let check = CheckSummary { id: "c1".to_owned(), name: "n".to_owned() };
        let results = vec![result("r1", Some(true)), result("r2", Some(false))];
        let row = build_aggregate_row(&check, &results, "cust", "conn");
        assert_eq!(row["result"], Value::String("partial".to_owned()));
        assert_eq!(row["success_percentage"], serde_json::json!(50.0));
    }

    #[test]
    fn test_archive_row_stamps_archived_at() {
        let mut row = Row::new();
        row.insert("id".into(), Value::String("x".into()));
        let archived = archive_row(row, Utc::now());
        assert!(archived.contains_key("archived_at"));
    }
}
