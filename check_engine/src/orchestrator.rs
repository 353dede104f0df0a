//! Batch Orchestrator (§4.7): drives the Check generator across
//! `control × provider × resource_model` tuples with a durable status log,
//! resume/error-retry modes, a `rayon` worker pool, derived metrics, and
//! prompt/error capture (§4.11).

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::GeneratorConfig;
use crate::connector::ConnectorService;
use crate::generator::{self, Control, GeneratorError, GeneratorInputs};
use crate::llm::{LLMClient, LLMError, LLMRequest, LLMResponse};
use crate::resource::ResourceCollection;
use crate::schema::SchemaRegistry;
use crate::store::{Row, Store, StoreError};

// ---------------------------------------------------------------------------
// Task identity and status log
// ---------------------------------------------------------------------------

/// One `(control, provider, resource_model)` unit of work.
#[derive(Debug, Clone)]
pub struct Task {
    pub control: Control,
    pub provider: String,
    pub resource_model_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub control_id: String,
    pub provider: String,
    pub resource_type: String,
}

impl Task {
    #[must_use]
    pub fn key(&self) -> TaskKey {
        TaskKey {
            control_id: self.control.id.clone(),
            provider: self.provider.clone(),
            resource_type: SchemaRegistry::fully_qualified_name(&self.provider, &self.resource_model_name),
        }
    }
}

/// Build the full cross product of tasks, in deterministic order.
#[must_use]
pub fn build_tasks(controls: &[Control], providers: &[String], resource_models: &[String]) -> Vec<Task> {
    let mut tasks = Vec::with_capacity(controls.len() * providers.len() * resource_models.len());
    for control in controls {
        for provider in providers {
            for model in resource_models {
                tasks.push(Task { control: control.clone(), provider: provider.clone(), resource_model_name: model.clone() });
            }
        }
    }
    tasks
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusLogRow {
    pub control_id: String,
    pub control_name: String,
    pub provider: String,
    pub resource_type: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub check_id: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub attempts: u32,
}

impl StatusLogRow {
    fn key(&self) -> TaskKey {
        TaskKey { control_id: self.control_id.clone(), provider: self.provider.clone(), resource_type: self.resource_type.clone() }
    }
}

/// A durable, append-only log of task status transitions. A task's
/// *current* status is the latest row for its key (§4.7); rows are never
/// mutated or removed.
pub struct StatusLog {
    rows: Mutex<Vec<StatusLogRow>>,
    path: Option<PathBuf>,
}

impl StatusLog {
    #[must_use]
    pub fn new_in_memory() -> Self {
        Self { rows: Mutex::new(Vec::new()), path: None }
    }

    /// Open (and create if missing) a JSONL-backed status log, replaying
    /// any existing rows so resume/error-retry see prior runs.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Io`] if the file exists but cannot be
    /// read, or [`OrchestratorError::Malformed`] if a line fails to parse.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, OrchestratorError> {
        let path = path.into();
        let mut rows = Vec::new();
        if path.is_file() {
            let content = fs::read_to_string(&path).map_err(|e| OrchestratorError::Io(e.to_string()))?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                let row: StatusLogRow = serde_json::from_str(line).map_err(|e| OrchestratorError::Malformed(e.to_string()))?;
                rows.push(row);
            }
        }
        Ok(Self { rows: Mutex::new(rows), path: Some(path) })
    }

    /// Append one status row: in-memory, and durably (fsync'd) if backed
    /// by a file.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Io`] if the durable append fails.
    pub fn append(&self, row: StatusLogRow) -> Result<(), OrchestratorError> {
        if let Some(ref path) = self.path {
            let line = serde_json::to_string(&row).map_err(|e| OrchestratorError::Malformed(e.to_string()))?;
            let mut file = OpenOptions::new().create(true).append(true).open(path).map_err(|e| OrchestratorError::Io(e.to_string()))?;
            writeln!(file, "{line}").map_err(|e| OrchestratorError::Io(e.to_string()))?;
            file.sync_data().map_err(|e| OrchestratorError::Io(e.to_string()))?;
        }
        self.rows.lock().expect("status log mutex poisoned").push(row);
        Ok(())
    }

    /// The latest row for `key`, i.e. this task's current status.
    #[must_use]
    pub fn current_status(&self, key: &TaskKey) -> Option<StatusLogRow> {
        self.rows.lock().expect("status log mutex poisoned").iter().rev().find(|r| &r.key() == key).cloned()
    }

    #[must_use]
    pub fn rows(&self) -> Vec<StatusLogRow> {
        self.rows.lock().expect("status log mutex poisoned").clone()
    }
}

/// Which tasks a run should consider, per §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run every task, ignoring prior status (`--fresh`).
    Fresh,
    /// Skip tasks whose current status is `Success`.
    Resume,
    /// Only tasks whose current status is `Error` (`--error`).
    ErrorRetry,
}

/// Filter `tasks` against `status_log` according to `mode`.
#[must_use]
pub fn select_tasks(tasks: &[Task], status_log: &StatusLog, mode: RunMode) -> Vec<Task> {
    tasks
        .iter()
        .filter(|task| {
            let current = status_log.current_status(&task.key());
            match mode {
                RunMode::Fresh => true,
                RunMode::Resume => !matches!(current, Some(ref row) if row.status == TaskStatus::Success),
                RunMode::ErrorRetry => matches!(current, Some(ref row) if row.status == TaskStatus::Error),
            }
        })
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Metrics (§4.7: "derived, not authoritative")
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics {
    pub unique_tasks: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl Metrics {
    /// Derive metrics from the status log's rows, counting each unique
    /// `(control, provider, resource_type)` key once regardless of retries.
    #[must_use]
    pub fn from_rows(rows: &[StatusLogRow]) -> Self {
        let mut latest: HashMap<TaskKey, &StatusLogRow> = HashMap::new();
        for row in rows {
            latest.insert(row.key(), row);
        }
        let mut metrics = Self { unique_tasks: latest.len(), ..Self::default() };
        for row in latest.values() {
            match row.status {
                TaskStatus::Success => {
                    metrics.succeeded += 1;
                    metrics.completed += 1;
                }
                TaskStatus::Error => {
                    metrics.failed += 1;
                    metrics.completed += 1;
                }
                _ => {}
            }
        }
        metrics
    }

    /// Completions per minute, given the run's elapsed duration.
    #[must_use]
    pub fn rate_per_minute(&self, elapsed_secs: f64) -> f64 {
        if elapsed_secs <= 0.0 {
            0.0
        } else {
            f64::from(u32::try_from(self.completed).unwrap_or(u32::MAX)) / (elapsed_secs / 60.0)
        }
    }

    /// Estimated seconds remaining for every task to reach a terminal
    /// status, extrapolating from the observed completion rate. `None` if
    /// nothing has completed yet (rate is undefined).
    #[must_use]
    pub fn eta_seconds(&self, elapsed_secs: f64) -> Option<f64> {
        let rate = self.rate_per_minute(elapsed_secs);
        if rate <= 0.0 || self.completed >= self.unique_tasks {
            return None;
        }
        let remaining = self.unique_tasks - self.completed;
        Some(f64::from(u32::try_from(remaining).unwrap_or(u32::MAX)) / rate * 60.0)
    }

    /// Estimated seconds until every task has a `Success` status, assuming
    /// the success rate observed so far continues.
    #[must_use]
    pub fn eta_all_success_seconds(&self, elapsed_secs: f64) -> Option<f64> {
        if self.succeeded == 0 || elapsed_secs <= 0.0 {
            return None;
        }
        let success_rate_per_sec = f64::from(u32::try_from(self.succeeded).unwrap_or(u32::MAX)) / elapsed_secs;
        if success_rate_per_sec <= 0.0 || self.succeeded >= self.unique_tasks {
            return None;
        }
        let remaining = self.unique_tasks - self.succeeded;
        Some(f64::from(u32::try_from(remaining).unwrap_or(u32::MAX)) / success_rate_per_sec)
    }
}

// ---------------------------------------------------------------------------
// Prompt & error capture (§4.11)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct PromptLogRecord<'a> {
    control_id: &'a str,
    provider: &'a str,
    resource_model: &'a str,
    attempt: u32,
    prompt: &'a str,
    response: &'a str,
    timestamp: DateTime<Utc>,
}

/// Append-only JSONL writer of every generation attempt's exact prompt and
/// response text, mirroring `PromptLogger` in the original batch-generation
/// tooling.
pub struct PromptLogger {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PromptLogger {
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Io`] if the parent directory cannot be
    /// created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, OrchestratorError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| OrchestratorError::Io(e.to_string()))?;
        }
        Ok(Self { path, lock: Mutex::new(()) })
    }

    fn record(&self, control_id: &str, provider: &str, resource_model: &str, attempt: u32, prompt: &str, response: &str) -> Result<(), OrchestratorError> {
        let record = PromptLogRecord { control_id, provider, resource_model, attempt, prompt, response, timestamp: Utc::now() };
        let line = serde_json::to_string(&record).map_err(|e| OrchestratorError::Malformed(e.to_string()))?;
        let _guard = self.lock.lock().expect("prompt logger mutex poisoned");
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path).map_err(|e| OrchestratorError::Io(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| OrchestratorError::Io(e.to_string()))
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorRecord {
    pub control_id: String,
    pub provider: String,
    pub resource_model: String,
    pub error_type: String,
    pub sample_errors: Vec<String>,
    pub success_count: u64,
    pub failure_count: u64,
    pub error_count: u64,
    pub final_attempt: u32,
}

/// Append-only JSONL writer of structured failure records for tasks that
/// never produced a valid Check, mirroring `ErrorTracker`.
pub struct ErrorTracker {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ErrorTracker {
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Io`] if the parent directory cannot be
    /// created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, OrchestratorError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| OrchestratorError::Io(e.to_string()))?;
        }
        Ok(Self { path, lock: Mutex::new(()) })
    }

    fn record(&self, record: &ErrorRecord) -> Result<(), OrchestratorError> {
        let line = serde_json::to_string(record).map_err(|e| OrchestratorError::Malformed(e.to_string()))?;
        let _guard = self.lock.lock().expect("error tracker mutex poisoned");
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path).map_err(|e| OrchestratorError::Io(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| OrchestratorError::Io(e.to_string()))
    }
}

/// Wraps an [`LLMClient`] to capture every attempt's prompt/response via a
/// [`PromptLogger`], and counts attempts for the wrapped task.
struct CapturingLLMClient<'a> {
    inner: &'a dyn LLMClient,
    logger: Option<&'a PromptLogger>,
    control_id: &'a str,
    provider: &'a str,
    resource_model: &'a str,
    attempt: AtomicU32,
}

impl LLMClient for CapturingLLMClient<'_> {
    fn generate(&self, request: &LLMRequest) -> Result<LLMResponse, LLMError> {
        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        let response = self.inner.generate(request);
        if let Some(logger) = self.logger {
            let response_text = response.as_ref().map(|r| r.content.as_str()).unwrap_or_default();
            let _ = logger.record(self.control_id, self.provider, self.resource_model, attempt, &request.prompt, response_text);
        }
        response
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

type SampleCache = Mutex<HashMap<(String, String), ResourceCollection>>;

/// Drives Check generation across tasks with a bounded worker pool,
/// sharing one status-log writer, one `LLMClient`, one `Store`, and a
/// read-only `SchemaRegistry` across workers (§5).
pub struct Orchestrator<'a> {
    pub status_log: &'a StatusLog,
    pub schema_registry: &'a SchemaRegistry,
    pub llm: &'a dyn LLMClient,
    pub store: &'a dyn Store,
    pub connectors: &'a HashMap<String, &'a dyn ConnectorService>,
    pub generator_config: &'a GeneratorConfig,
    pub field_path_max_depth: usize,
    pub workers: usize,
    pub prompt_logger: Option<&'a PromptLogger>,
    pub error_tracker: Option<&'a ErrorTracker>,
    cancel: Arc<AtomicBool>,
    sample_cache: SampleCache,
}

impl<'a> Orchestrator<'a> {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        status_log: &'a StatusLog,
        schema_registry: &'a SchemaRegistry,
        llm: &'a dyn LLMClient,
        store: &'a dyn Store,
        connectors: &'a HashMap<String, &'a dyn ConnectorService>,
        generator_config: &'a GeneratorConfig,
        field_path_max_depth: usize,
        workers: usize,
    ) -> Self {
        Self {
            status_log,
            schema_registry,
            llm,
            store,
            connectors,
            generator_config,
            field_path_max_depth,
            workers,
            prompt_logger: None,
            error_tracker: None,
            cancel: Arc::new(AtomicBool::new(false)),
            sample_cache: Mutex::new(HashMap::new()),
        }
    }

    /// A clone of this orchestrator's cancellation flag: set it (e.g. from
    /// a SIGINT handler in the embedding host) to stop dispatching new
    /// tasks; in-flight tasks finish and record their status first (§4.7).
    #[must_use]
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run `tasks` (already filtered by [`select_tasks`]) across a worker
    /// pool of `self.workers` threads (`0` uses rayon's default).
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Pool`] if the worker pool itself fails
    /// to build; individual task failures are recorded in the status log
    /// and returned in the outcome list, not propagated as an `Err`.
    pub fn run(&self, tasks: &[Task], customer_id: &str, credentials: &HashMap<String, HashMap<String, String>>) -> Result<Vec<TaskOutcome>, OrchestratorError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| OrchestratorError::Pool(e.to_string()))?;

        let outcomes = pool.install(|| {
            tasks
                .par_iter()
                .map(|task| self.run_one(task, customer_id, credentials))
                .collect::<Vec<_>>()
        });
        Ok(outcomes)
    }

    fn fetch_sample(&self, provider: &str, resource_model: &str, credentials: &HashMap<String, String>) -> Result<ResourceCollection, OrchestratorError> {
        let cache_key = (provider.to_owned(), resource_model.to_owned());
        if let Some(cached) = self.sample_cache.lock().expect("sample cache mutex poisoned").get(&cache_key) {
            return Ok(cached.clone());
        }
        let connector = self
            .connectors
            .get(provider)
            .ok_or_else(|| OrchestratorError::UnknownProvider(provider.to_owned()))?;
        let (_, collection) = connector.fetch(credentials).map_err(|e| OrchestratorError::Connector(e.to_string()))?;
        self.sample_cache.lock().expect("sample cache mutex poisoned").insert(cache_key, collection.clone());
        Ok(collection)
    }

    fn run_one(&self, task: &Task, customer_id: &str, credentials: &HashMap<String, HashMap<String, String>>) -> TaskOutcome {
        let key = task.key();

        if self.cancel.load(Ordering::SeqCst) {
            let row = StatusLogRow {
                control_id: key.control_id.clone(),
                control_name: task.control.control_name.clone(),
                provider: key.provider.clone(),
                resource_type: key.resource_type.clone(),
                status: TaskStatus::Error,
                check_id: None,
                error_message: Some("cancelled before start".to_owned()),
                timestamp: Utc::now(),
                attempts: 0,
            };
            let _ = self.status_log.append(row);
            return TaskOutcome { key, status: TaskStatus::Error, check_id: None, error_message: Some("cancelled".to_owned()) };
        }

        let _ = self.status_log.append(StatusLogRow {
            control_id: key.control_id.clone(),
            control_name: task.control.control_name.clone(),
            provider: key.provider.clone(),
            resource_type: key.resource_type.clone(),
            status: TaskStatus::Running,
            check_id: None,
            error_message: None,
            timestamp: Utc::now(),
            attempts: 0,
        });

        let empty_creds = HashMap::new();
        let creds = credentials.get(&task.provider).unwrap_or(&empty_creds);

        let sample = match self.fetch_sample(&task.provider, &task.resource_model_name, creds) {
            Ok(s) => s,
            Err(err) => return self.fail(task, &key, 0, err.to_string()),
        };

        let llm: Box<dyn LLMClient> = match self.prompt_logger {
            Some(logger) => Box::new(CapturingLLMClient {
                inner: self.llm,
                logger: Some(logger),
                control_id: &task.control.id,
                provider: &task.provider,
                resource_model: &task.resource_model_name,
                attempt: AtomicU32::new(0),
            }),
            None => Box::new(CapturingLLMClient {
                inner: self.llm,
                logger: None,
                control_id: &task.control.id,
                provider: &task.provider,
                resource_model: &task.resource_model_name,
                attempt: AtomicU32::new(0),
            }),
        };

        let inputs = GeneratorInputs {
            control: &task.control,
            provider: &task.provider,
            resource_model_name: &task.resource_model_name,
            schema_registry: self.schema_registry,
            field_path_max_depth: self.field_path_max_depth,
            suggested_severity: None,
            suggested_category: None,
            sample: &sample,
        };

        if self.cancel.load(Ordering::SeqCst) {
            return self.fail(task, &key, 0, "cancelled during generation".to_owned());
        }

        match generator::generate(&inputs, llm.as_ref(), self.generator_config) {
            Ok(generated) => {
                let mut check_row = Row::new();
                check_row.insert("id".into(), serde_json::json!(generated.check.id));
                check_row.insert("name".into(), serde_json::json!(generated.check.name));
                check_row.insert("description".into(), serde_json::json!(generated.check.description));
                check_row.insert("created_by".into(), serde_json::json!(generated.check.created_by));
                check_row.insert("category".into(), serde_json::json!(generated.check.category));
                check_row.insert("updated_by".into(), serde_json::json!(generated.check.updated_by));
                check_row.insert("created_at".into(), serde_json::json!(generated.check.created_at));
                check_row.insert("updated_at".into(), serde_json::json!(generated.check.updated_at));
                check_row.insert("is_deleted".into(), serde_json::json!(generated.check.is_deleted));
                check_row.insert("output_statements".into(), serde_json::to_value(&generated.check.output_statements).unwrap_or_default());
                check_row.insert("fix_details".into(), serde_json::to_value(&generated.check.fix_details).unwrap_or_default());
                check_row.insert("metadata".into(), serde_json::to_value(&generated.check.metadata).unwrap_or_default());

                if let Err(err) = self.store.insert("checks", &check_row) {
                    return self.fail(task, &key, generated.attempts, err.to_string());
                }

                let mut mapping_row = Row::new();
                mapping_row.insert("control_id".into(), serde_json::json!(task.control.id));
                mapping_row.insert("check_id".into(), serde_json::json!(generated.check.id));
                if let Err(err) = self.store.insert("control_checks_mapping", &mapping_row) {
                    return self.fail(task, &key, generated.attempts, err.to_string());
                }

                let _ = customer_id;

                let row = StatusLogRow {
                    control_id: key.control_id.clone(),
                    control_name: task.control.control_name.clone(),
                    provider: key.provider.clone(),
                    resource_type: key.resource_type.clone(),
                    status: TaskStatus::Success,
                    check_id: Some(generated.check.id.clone()),
                    error_message: None,
                    timestamp: Utc::now(),
                    attempts: generated.attempts,
                };
                let _ = self.status_log.append(row);
                log::info!("task {:?} succeeded after {} attempt(s)", key, generated.attempts);
                TaskOutcome { key, status: TaskStatus::Success, check_id: Some(generated.check.id), error_message: None }
            }
            Err(err) => {
                let attempts = match &err {
                    GeneratorError::Exhausted { attempts, .. } => *attempts,
                    _ => 0,
                };
                if let GeneratorError::Exhausted { ref sample_errors, .. } = err {
                    if let Some(tracker) = self.error_tracker {
                        let _ = tracker.record(&ErrorRecord {
                            control_id: task.control.id.clone(),
                            provider: task.provider.clone(),
                            resource_model: task.resource_model_name.clone(),
                            error_type: "exhausted".to_owned(),
                            sample_errors: sample_errors.clone(),
                            success_count: 0,
                            failure_count: 0,
                            error_count: u64::from(attempts),
                            final_attempt: attempts,
                        });
                    }
                }
                self.fail(task, &key, attempts, err.to_string())
            }
        }
    }

    fn fail(&self, task: &Task, key: &TaskKey, attempts: u32, message: String) -> TaskOutcome {
        log::error!("task {key:?} failed: {message}");
        let row = StatusLogRow {
            control_id: key.control_id.clone(),
            control_name: task.control.control_name.clone(),
            provider: key.provider.clone(),
            resource_type: key.resource_type.clone(),
            status: TaskStatus::Error,
            check_id: None,
            error_message: Some(message.clone()),
            timestamp: Utc::now(),
            attempts,
        };
        let _ = self.status_log.append(row);
        TaskOutcome { key: key.clone(), status: TaskStatus::Error, check_id: None, error_message: Some(message) }
    }
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub key: TaskKey,
    pub status: TaskStatus,
    pub check_id: Option<String>,
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("orchestrator io error: {0}")]
    Io(String),

    #[error("malformed status log record: {0}")]
    Malformed(String),

    #[error("failed to build worker pool: {0}")]
    Pool(String),

    #[error("no connector registered for provider '{0}'")]
    UnknownProvider(String),

    #[error("connector fetch failed: {0}")]
    Connector(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MockConnectorService;
    use crate::llm::StubLLMClient;
    use crate::resource::{InfoData, Resource};
    use crate::schema::compile;
    use crate::store::sqlite::SqliteStore;
    use crate::types::ConnectionType;
    use serde_json::json;

    fn control(name: &str) -> Control {
        Control {
            id: format!("ctl-{name}"),
            framework_id: "fw-1".to_owned(),
            control_name: name.to_owned(),
            control_long_name: "Some control".to_owned(),
            control_text: "Do the thing.".to_owned(),
            family_name: "Family".to_owned(),
            active: true,
            order_index: 1,
        }
    }

    const VALID_RESPONSE: &str = r#"
checks:
  - name: Buckets must be encrypted
    description: desc
    output_statements:
      success: ok
      failure: bad
      partial: null
    fix_details:
      description: enable encryption
      instructions: []
      estimated_time: 5m
      automation_available: false
    metadata:
      resource_type: con_mon_v2.mappings.aws.S3Bucket
      field_path: encrypted
      operation:
        name: "=="
        logic: null
      expected_value: true
      tags: []
      severity: high
      category: network_security
"#;

    #[test]
    fn test_status_log_current_status_is_latest_row() {
        let log = StatusLog::new_in_memory();
        let key = TaskKey { control_id: "c1".into(), provider: "aws".into(), resource_type: "rt".into() };
        log.append(StatusLogRow {
            control_id: key.control_id.clone(),
            control_name: "C1".into(),
            provider: key.provider.clone(),
            resource_type: key.resource_type.clone(),
            status: TaskStatus::Running,
            check_id: None,
            error_message: None,
            timestamp: Utc::now(),
            attempts: 0,
        })
        .unwrap();
        log.append(StatusLogRow {
            control_id: key.control_id.clone(),
            control_name: "C1".into(),
            provider: key.provider.clone(),
            resource_type: key.resource_type.clone(),
            status: TaskStatus::Success,
            check_id: Some("chk-1".into()),
            error_message: None,
            timestamp: Utc::now(),
            attempts: 1,
        })
        .unwrap();
        assert_eq!(log.current_status(&key).unwrap().status, TaskStatus::Success);
    }

    #[test]
    fn test_select_tasks_resume_skips_success() {
        let tasks = vec![
            Task { control: control("AC-1"), provider: "aws".into(), resource_model_name: "S3Bucket".into() },
            Task { control: control("AC-2"), provider: "aws".into(), resource_model_name: "S3Bucket".into() },
        ];
        let log = StatusLog::new_in_memory();
        log.append(StatusLogRow {
            control_id: tasks[0].control.id.clone(),
            control_name: tasks[0].control.control_name.clone(),
            provider: "aws".into(),
            resource_type: tasks[0].key().resource_type,
            status: TaskStatus::Success,
            check_id: Some("chk".into()),
            error_message: None,
            timestamp: Utc::now(),
            attempts: 1,
        })
        .unwrap();

        let selected = select_tasks(&tasks, &log, RunMode::Resume);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].control.id, tasks[1].control.id);
    }

    #[test]
    fn test_select_tasks_error_retry_only_errored() {
        let tasks = vec![
            Task { control: control("AC-1"), provider: "aws".into(), resource_model_name: "S3Bucket".into() },
            Task { control: control("AC-2"), provider: "aws".into(), resource_model_name: "S3Bucket".into() },
        ];
        let log = StatusLog::new_in_memory();
        log.append(StatusLogRow {
            control_id: tasks[0].control.id.clone(),
            control_name: tasks[0].control.control_name.clone(),
            provider: "aws".into(),
            resource_type: tasks[0].key().resource_type,
            status: TaskStatus::Error,
            check_id: None,
            error_message: Some("boom".into()),
            timestamp: Utc::now(),
            attempts: 2,
        })
        .unwrap();

        let selected = select_tasks(&tasks, &log, RunMode::ErrorRetry);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].control.id, tasks[0].control.id);
    }

    #[test]
    fn test_metrics_counts_unique_tasks_ignoring_retries() {
        let mut rows = Vec::new();
        let key = TaskKey { control_id: "c1".into(), provider: "aws".into(), resource_type: "rt".into() };
        for (status, attempt) in [(TaskStatus::Running, 0), (TaskStatus::Error, 1), (TaskStatus::Success, 2)] {
            rows.push(StatusLogRow {
                control_id: key.control_id.clone(),
                control_name: "C1".into(),
                provider: key.provider.clone(),
                resource_type: key.resource_type.clone(),
                status,
                check_id: None,
                error_message: None,
                timestamp: Utc::now(),
                attempts: attempt,
            });
        }
        let metrics = Metrics::from_rows(&rows);
        assert_eq!(metrics.unique_tasks, 1);
        assert_eq!(metrics.succeeded, 1);
        assert_eq!(metrics.failed, 0);
    }

    #[test]
    fn test_orchestrator_runs_task_end_to_end_against_mock_connector_and_stub_llm() {
        let registry = compile("resources:\n  S3Bucket:\n    provider: aws\n    fields:\n      encrypted: boolean\n").unwrap();
        let resource = Resource::new("r1", "con_mon_v2.mappings.aws.S3Bucket", "aws", json!({"encrypted": true}));
        let collection = ResourceCollection::new("con_mon_v2.mappings.aws.S3Bucket", "aws", vec![resource]);
        let mock_connector = MockConnectorService::new(ConnectionType::Aws, InfoData::new("aws"), collection);
        let mut connectors: HashMap<String, &dyn ConnectorService> = HashMap::new();
        connectors.insert("aws".to_owned(), &mock_connector);

        let llm = StubLLMClient::with_content(vec![VALID_RESPONSE]);
        let store = SqliteStore::open_in_memory().unwrap();
        let status_log = StatusLog::new_in_memory();
        let generator_config = GeneratorConfig::default();

        let orchestrator = Orchestrator::new(&status_log, &registry, &llm, &store, &connectors, &generator_config, 4, 1);

        let tasks = vec![Task { control: control("SC-13"), provider: "aws".to_owned(), resource_model_name: "S3Bucket".to_owned() }];
        let outcomes = orchestrator.run(&tasks, "cust-1", &HashMap::new()).unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, TaskStatus::Success);
        assert!(outcomes[0].check_id.is_some());

        let stored = store.select("checks", &[]).unwrap();
        assert_eq!(stored.len(), 1);
    }
}
