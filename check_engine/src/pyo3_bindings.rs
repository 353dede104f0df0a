//! PyO3 bindings exposing the Check Evaluation Kernel to Python.
//!
//! The Python module is importable as:
//! ```python
//! from compliance_check_engine import CheckEngine, EngineConfig, SchemaRegistry
//! ```
//!
//! Complex nested domain objects (`Check`, `Resource`, `CheckResult`, store
//! rows) cross the FFI boundary as JSON text rather than as generated
//! pyclass hierarchies — the kernel's types are shaped for serde
//! round-tripping (see `check::Check`'s own `Serialize`/`Deserialize`
//! derives) and the embedding host already speaks JSON to the relational
//! and CSV `Store` adapters, so this keeps one encoding throughout instead
//! of maintaining a second, parallel Python-facing shape.

use std::collections::HashMap;
use std::path::Path;

use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use serde_json::Value;

use crate::check::Check;
use crate::config::{EngineConfig, SandboxConfig};
use crate::resource::Resource;
use crate::schema::SchemaRegistry;
use crate::store::csv::CsvStore;
use crate::store::sqlite::SqliteStore;
use crate::store::{CheckSummary, ResultWriter, Row, Store};
use crate::types::ComparisonOperator;

fn json_err(e: impl std::fmt::Display) -> PyErr {
    PyValueError::new_err(e.to_string())
}

fn runtime_err(e: impl std::fmt::Display) -> PyErr {
    PyRuntimeError::new_err(e.to_string())
}

fn row_from_json(json: &str) -> PyResult<Row> {
    let value: Value = serde_json::from_str(json).map_err(json_err)?;
    let Value::Object(map) = value else {
        return Err(PyValueError::new_err("row must be a JSON object"));
    };
    Ok(map.into_iter().collect())
}

// ---------------------------------------------------------------------------
// Field-Path Engine (§4.2) / Comparison Engine (§4.3) / sandbox (§4.3.1)
// ---------------------------------------------------------------------------

/// Evaluate a field-path expression against `data_json` (a JSON document),
/// returning the extracted value as JSON text.
///
/// # Errors
///
/// Returns a `ValueError` if `data_json` is not valid JSON, or a
/// `RuntimeError` if the path cannot be resolved (missing field, wrong
/// type for a wildcard/aggregate).
#[pyfunction]
pub fn evaluate_field_path(data_json: &str, path: &str) -> PyResult<String> {
    let data: Value = serde_json::from_str(data_json).map_err(json_err)?;
    let result = crate::field_path::evaluate(&data, path).map_err(runtime_err)?;
    serde_json::to_string(&result).map_err(json_err)
}

/// Apply a non-custom comparison operator to a `(fetched, expected)` pair,
/// each given as JSON text. Use [`execute_custom_predicate`] for `custom`.
///
/// # Errors
///
/// Returns a `ValueError` for malformed JSON or an unknown wire value for
/// `op`, a `RuntimeError` for a comparison type mismatch.
#[pyfunction]
pub fn compare_values(op: &str, fetched_json: &str, expected_json: &str) -> PyResult<bool> {
    let operator = ComparisonOperator::parse_wire(op)
        .ok_or_else(|| PyValueError::new_err(format!("unknown comparison operator '{op}'")))?;
    let fetched: Value = serde_json::from_str(fetched_json).map_err(json_err)?;
    let expected: Value = serde_json::from_str(expected_json).map_err(json_err)?;
    crate::comparison::compare(operator, &fetched, &expected).map_err(runtime_err)
}

/// Execute a Check's `custom` predicate `logic` against a `(fetched,
/// expected)` pair in the sandbox (§4.3.1), returning its boolean result.
///
/// `max_steps`/`max_duration_ms` default to the kernel's built-in sandbox
/// ceilings when omitted.
///
/// # Errors
///
/// Returns a `RuntimeError` for empty/comment-only logic, a syntax error, a
/// disallowed name reference, or a step/time limit breach — any of these is
/// an execution failure, never silently coerced to `false`.
#[pyfunction]
#[pyo3(signature = (logic, fetched_json, expected_json, max_steps=None, max_duration_ms=None))]
pub fn execute_custom_predicate(
    logic: &str,
    fetched_json: &str,
    expected_json: &str,
    max_steps: Option<u64>,
    max_duration_ms: Option<u64>,
) -> PyResult<bool> {
    let fetched: Value = serde_json::from_str(fetched_json).map_err(json_err)?;
    let expected: Value = serde_json::from_str(expected_json).map_err(json_err)?;
    let defaults = SandboxConfig::default();
    let cfg = SandboxConfig { max_steps: max_steps.unwrap_or(defaults.max_steps), max_duration_ms: max_duration_ms.unwrap_or(defaults.max_duration_ms) };
    crate::sandbox::execute(logic, &fetched, &expected, &cfg).map_err(runtime_err)
}

// ---------------------------------------------------------------------------
// Schema Compiler (§4.1)
// ---------------------------------------------------------------------------

/// A compiled resource schema registry, produced by [`compile_schema`].
#[pyclass(name = "SchemaRegistry")]
pub struct PySchemaRegistry {
    inner: SchemaRegistry,
}

#[pymethods]
impl PySchemaRegistry {
    /// Every extractable path (including array- and function-bearing
    /// variants) for `schema_name`, walking the type tree to `max_depth`.
    fn field_paths(&self, schema_name: &str, max_depth: usize) -> Vec<String> {
        self.inner.field_paths(schema_name, max_depth)
    }

    /// The stable fully-qualified name a Check's `metadata.resource_type`
    /// must match for `schema_name` under `provider`.
    #[staticmethod]
    fn fully_qualified_name(provider: &str, schema_name: &str) -> String {
        SchemaRegistry::fully_qualified_name(provider, schema_name)
    }

    /// Whether `name` resolves to a known compiled resource type.
    fn contains(&self, name: &str) -> bool {
        self.inner.get(name).is_some()
    }

    fn __repr__(&self) -> String {
        "SchemaRegistry(...)".to_owned()
    }
}

/// Compile a YAML resource-schema document into a [`PySchemaRegistry`]
/// (§4.1).
///
/// # Errors
///
/// Returns a `ValueError` if the document is not valid YAML or violates
/// the schema compiler's structural requirements.
#[pyfunction]
pub fn compile_schema(yaml: &str) -> PyResult<PySchemaRegistry> {
    let inner = crate::schema::compile(yaml).map_err(json_err)?;
    Ok(PySchemaRegistry { inner })
}

// ---------------------------------------------------------------------------
// Check Model & Evaluator (§4.4)
// ---------------------------------------------------------------------------

/// A compliance Check, deserialised from its persisted JSON row shape.
#[pyclass(name = "Check")]
pub struct PyCheck {
    inner: Check,
}

#[pymethods]
impl PyCheck {
    /// Parse a Check from its JSON row representation (the same shape
    /// `checks.metadata`/`output_statements`/`fix_details` decode to).
    ///
    /// # Errors
    ///
    /// Returns a `ValueError` if `json` does not deserialise into a Check.
    #[staticmethod]
    fn from_json(json: &str) -> PyResult<Self> {
        let inner: Check = serde_json::from_str(json).map_err(json_err)?;
        Ok(Self { inner })
    }

    /// Evaluate this Check against `resources_json` (a JSON array of
    /// Resources), returning the per-resource `CheckResult` list as JSON
    /// text (§4.4). `max_steps`/`max_duration_ms` bound any `custom`
    /// sandbox predicate and default to the kernel's built-in ceilings.
    #[pyo3(signature = (resources_json, max_steps=None, max_duration_ms=None))]
    fn evaluate(&self, resources_json: &str, max_steps: Option<u64>, max_duration_ms: Option<u64>) -> PyResult<String> {
        let resources: Vec<Resource> = serde_json::from_str(resources_json).map_err(json_err)?;
        let defaults = SandboxConfig::default();
        let cfg = SandboxConfig { max_steps: max_steps.unwrap_or(defaults.max_steps), max_duration_ms: max_duration_ms.unwrap_or(defaults.max_duration_ms) };
        let results = self.inner.evaluate(&resources, &cfg);
        serde_json::to_string(&results).map_err(json_err)
    }

    /// Validate this Check's `comparison_operation` view (§4.4): for
    /// `custom` operators, that `logic` is non-empty after trimming
    /// comments; otherwise, that `expected_value` is present.
    fn is_valid(&self) -> bool {
        self.inner.comparison_operation().is_ok()
    }

    fn __repr__(&self) -> String {
        format!("Check(id={:?}, name={:?})", self.inner.id, self.inner.name)
    }
}

// ---------------------------------------------------------------------------
// Store (§4.5, §6) — SQLite and CSV adapters
// ---------------------------------------------------------------------------

/// A SQLite-backed [`Store`] (§6's relational-DB adapter).
#[pyclass(name = "SqliteStore")]
pub struct PySqliteStore {
    inner: SqliteStore,
}

#[pymethods]
impl PySqliteStore {
    /// Open (or create) a SQLite database at `path`.
    #[staticmethod]
    fn open(path: &str) -> PyResult<Self> {
        let inner = SqliteStore::open(Path::new(path)).map_err(runtime_err)?;
        Ok(Self { inner })
    }

    /// Open a private in-memory database, for tests and ephemeral runs.
    #[staticmethod]
    fn open_in_memory() -> PyResult<Self> {
        let inner = SqliteStore::open_in_memory().map_err(runtime_err)?;
        Ok(Self { inner })
    }

    /// Select every row of `table` matching no filter, as a JSON array of
    /// row objects.
    fn select_all(&self, table: &str) -> PyResult<String> {
        let rows = self.inner.select(table, &[]).map_err(runtime_err)?;
        serde_json::to_string(&rows).map_err(json_err)
    }

    /// Insert one row (given as a JSON object) into `table`.
    fn insert(&self, table: &str, row_json: &str) -> PyResult<()> {
        let row = row_from_json(row_json)?;
        self.inner.insert(table, &row).map_err(runtime_err)
    }

    /// Archive-then-insert the current `con_mon_results` row for
    /// `(customer_id, connection_id, check_id)` (§4.5).
    fn archive_then_insert_result(&self, customer_id: &str, connection_id: &str, check_id: &str, new_row_json: &str) -> PyResult<()> {
        let row = row_from_json(new_row_json)?;
        self.inner
            .archive_then_insert_result(customer_id, connection_id, check_id, row)
            .map_err(runtime_err)
    }

    fn __repr__(&self) -> String {
        "SqliteStore(...)".to_owned()
    }
}

/// A CSV-directory-backed [`Store`] (§6's CSV adapter).
#[pyclass(name = "CsvStore")]
pub struct PyCsvStore {
    inner: CsvStore,
}

#[pymethods]
impl PyCsvStore {
    /// Open (or create) a directory of `.csv` table files at `dir`.
    #[staticmethod]
    fn open(dir: &str) -> PyResult<Self> {
        let inner = CsvStore::open(dir).map_err(runtime_err)?;
        Ok(Self { inner })
    }

    fn select_all(&self, table: &str) -> PyResult<String> {
        let rows = self.inner.select(table, &[]).map_err(runtime_err)?;
        serde_json::to_string(&rows).map_err(json_err)
    }

    fn insert(&self, table: &str, row_json: &str) -> PyResult<()> {
        let row = row_from_json(row_json)?;
        self.inner.insert(table, &row).map_err(runtime_err)
    }

    fn archive_then_insert_result(&self, customer_id: &str, connection_id: &str, check_id: &str, new_row_json: &str) -> PyResult<()> {
        let row = row_from_json(new_row_json)?;
        self.inner
            .archive_then_insert_result(customer_id, connection_id, check_id, row)
            .map_err(runtime_err)
    }

    fn __repr__(&self) -> String {
        "CsvStore(...)".to_owned()
    }
}

// ---------------------------------------------------------------------------
// CheckEngine facade — the one-stop entry point the embedding host uses
// ---------------------------------------------------------------------------

/// Python-facing facade over the evaluation kernel: evaluates a batch of
/// Checks against a fetched resource collection and writes the aggregated
/// results through a [`PySqliteStore`] or [`PyCsvStore`] via
/// `upsert_current`.
///
/// Usage from Python:
/// ```python
/// from compliance_check_engine import CheckEngine, EngineConfig
/// engine = CheckEngine(EngineConfig())
/// results_json = engine.evaluate_checks(checks_json, resources_json)
/// ```
#[pyclass(name = "CheckEngine")]
pub struct PyCheckEngine {
    config: EngineConfig,
}

#[pymethods]
impl PyCheckEngine {
    #[new]
    #[pyo3(signature = (config=None))]
    fn new(config: Option<EngineConfig>) -> Self {
        Self { config: config.unwrap_or_default() }
    }

    /// Evaluate every Check in `checks_json` (a JSON array of Check rows)
    /// against `resources_json` (a JSON array of Resources), returning a
    /// JSON object mapping `check.id -> [CheckResult]`.
    fn evaluate_checks(&self, checks_json: &str, resources_json: &str) -> PyResult<String> {
        let checks: Vec<Check> = serde_json::from_str(checks_json).map_err(json_err)?;
        let resources: Vec<Resource> = serde_json::from_str(resources_json).map_err(json_err)?;

        let mut out = serde_json::Map::new();
        for check in &checks {
            let results = check.evaluate(&resources, &self.config.sandbox);
            out.insert(check.id.clone(), serde_json::to_value(&results).map_err(json_err)?);
        }
        serde_json::to_string(&out).map_err(json_err)
    }

    /// Archive-then-insert aggregated results for every check in
    /// `results_by_check_json` (a JSON object mapping `check_id ->
    /// {name, results: [CheckResult]}`) into `store` (§4.5).
    fn write_results(&self, store: &PySqliteStore, results_by_check_json: &str, customer_id: &str, connection_id: &str) -> PyResult<()> {
        let parsed: HashMap<String, CheckResultsEntry> = serde_json::from_str(results_by_check_json).map_err(json_err)?;
        let entries: Vec<(CheckSummary, Vec<crate::check::CheckResult>)> = parsed
            .into_iter()
            .map(|(id, entry)| (CheckSummary { id, name: entry.name }, entry.results))
            .collect();
        let writer = ResultWriter::new(&store.inner);
        writer.upsert_current(&entries, customer_id, connection_id).map_err(runtime_err)
    }

    fn __repr__(&self) -> String {
        "CheckEngine(...)".to_owned()
    }
}

#[derive(serde::Deserialize)]
struct CheckResultsEntry {
    name: String,
    results: Vec<crate::check::CheckResult>,
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Register all PyO3 classes and functions into the Python module.
///
/// Called from `lib.rs` to populate the module.
///
/// # Errors
///
/// Propagates any `PyErr` from class/function registration.
pub fn register_module(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyCheckEngine>()?;
    m.add_class::<EngineConfig>()?;
    m.add_class::<PySchemaRegistry>()?;
    m.add_class::<PyCheck>()?;
    m.add_class::<PySqliteStore>()?;
    m.add_class::<PyCsvStore>()?;
    m.add_class::<ComparisonOperator>()?;
    m.add_class::<crate::types::ConnectionType>()?;
    m.add_class::<crate::types::AggregateResult>()?;
    m.add_function(wrap_pyfunction!(evaluate_field_path, m)?)?;
    m.add_function(wrap_pyfunction!(compare_values, m)?)?;
    m.add_function(wrap_pyfunction!(execute_custom_predicate, m)?)?;
    m.add_function(wrap_pyfunction!(compile_schema, m)?)?;
    Ok(())
}
