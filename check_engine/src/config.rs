//! Configuration loading and resolution for the compliance check engine.
//!
//! Supports a 3-level configuration resolution order:
//! 1. `compliance.check.toml` (project root)
//! 2. `[tool.compliance.check]` section in `pyproject.toml`
//! 3. Built-in defaults
//!
//! First file found wins — later sources are not consulted. None of these
//! tunables are provider credentials or CLI flags; those live in the
//! embedding host.

use std::path::Path;

use pyo3::prelude::*;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Tunables for the self-improving Check generator (§4.6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Maximum number of evaluate/regenerate rounds before giving up.
    pub max_attempts: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self { max_attempts: 2 }
    }
}

/// Tunables for the batch orchestrator's worker pool (§4.7).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Number of worker threads in the task pool. `0` means "use rayon's
    /// default (number of logical CPUs)".
    pub workers: usize,
    /// Per-attempt timeout for an LLM call, in seconds.
    pub llm_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            llm_timeout_secs: 60,
        }
    }
}

/// Resource ceilings for the custom-predicate sandbox interpreter (§4.3.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Maximum number of interpreter steps (loop iterations, expression
    /// evaluations) before a predicate is aborted as non-terminating.
    pub max_steps: u64,
    /// Wall-clock ceiling for a single predicate evaluation.
    pub max_duration_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_steps: 100_000,
            max_duration_ms: 250,
        }
    }
}

/// Configuration for the sample-ResourceCollection memoisation cache (§4.10).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether the cache is consulted/populated at all.
    pub enabled: bool,
    /// Optional on-disk persistence path. `None` keeps the cache in-memory
    /// only, scoped to the current process.
    pub path: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Main config
// ---------------------------------------------------------------------------

/// Complete kernel configuration, loaded via the 3-level resolution order
/// and shared read-only across the orchestrator's worker pool.
#[pyclass]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum recursion depth for [`crate::schema::field_paths`] generation.
    pub field_path_max_depth: usize,

    /// Check generator tunables.
    pub generator: GeneratorConfig,

    /// Batch orchestrator tunables.
    pub orchestrator: OrchestratorConfig,

    /// Sandbox interpreter resource ceilings.
    pub sandbox: SandboxConfig,

    /// Sample-collection cache settings.
    pub cache: CacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            field_path_max_depth: 4,
            generator: GeneratorConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            sandbox: SandboxConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

#[pymethods]
impl EngineConfig {
    /// Create a new `EngineConfig` with built-in defaults.
    #[new]
    fn py_new() -> Self {
        Self::default()
    }

    /// Maximum recursion depth for field-path generation.
    #[getter]
    fn get_field_path_max_depth(&self) -> usize {
        self.field_path_max_depth
    }

    /// Set the maximum recursion depth for field-path generation.
    #[setter]
    fn set_field_path_max_depth(&mut self, value: usize) {
        self.field_path_max_depth = value;
    }

    /// Maximum generator regeneration attempts.
    #[getter]
    fn get_max_attempts(&self) -> u32 {
        self.generator.max_attempts
    }

    /// Set the maximum generator regeneration attempts.
    #[setter]
    fn set_max_attempts(&mut self, value: u32) {
        self.generator.max_attempts = value;
    }

    /// Orchestrator worker-pool size (`0` = rayon default).
    #[getter]
    fn get_workers(&self) -> usize {
        self.orchestrator.workers
    }

    /// Set the orchestrator worker-pool size.
    #[setter]
    fn set_workers(&mut self, value: usize) {
        self.orchestrator.workers = value;
    }

    /// Return a human-readable string representation.
    fn __repr__(&self) -> String {
        format!(
            "EngineConfig(field_path_max_depth={}, max_attempts={}, workers={})",
            self.field_path_max_depth, self.generator.max_attempts, self.orchestrator.workers,
        )
    }
}

// ---------------------------------------------------------------------------
// TOML deserialization helpers
// ---------------------------------------------------------------------------

/// Raw TOML structure for `compliance.check.toml`.
#[derive(Debug, Deserialize)]
struct TomlCheckFile {
    check: Option<TomlCheckSection>,
}

/// The `[check]` section inside the TOML file.
#[derive(Debug, Deserialize)]
struct TomlCheckSection {
    field_path_max_depth: Option<usize>,
    generator: Option<TomlGeneratorSection>,
    orchestrator: Option<TomlOrchestratorSection>,
    sandbox: Option<TomlSandboxSection>,
    cache: Option<TomlCacheSection>,
}

#[derive(Debug, Deserialize)]
struct TomlGeneratorSection {
    max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct TomlOrchestratorSection {
    workers: Option<usize>,
    llm_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TomlSandboxSection {
    max_steps: Option<u64>,
    max_duration_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TomlCacheSection {
    enabled: Option<bool>,
    path: Option<String>,
}

/// Raw TOML structure for `pyproject.toml` with `[tool.compliance.check]`.
#[derive(Debug, Deserialize)]
struct PyprojectToml {
    tool: Option<PyprojectTool>,
}

#[derive(Debug, Deserialize)]
struct PyprojectTool {
    compliance: Option<PyprojectCompliance>,
}

#[derive(Debug, Deserialize)]
struct PyprojectCompliance {
    check: Option<TomlCheckSection>,
}

/// Apply a [`TomlCheckSection`] onto an [`EngineConfig`], overriding any set values.
fn apply_toml_section(config: &mut EngineConfig, section: &TomlCheckSection) {
    if let Some(v) = section.field_path_max_depth {
        config.field_path_max_depth = v;
    }
    if let Some(ref g) = section.generator {
        if let Some(v) = g.max_attempts {
            config.generator.max_attempts = v;
        }
    }
    if let Some(ref o) = section.orchestrator {
        if let Some(v) = o.workers {
            config.orchestrator.workers = v;
        }
        if let Some(v) = o.llm_timeout_secs {
            config.orchestrator.llm_timeout_secs = v;
        }
    }
    if let Some(ref s) = section.sandbox {
        if let Some(v) = s.max_steps {
            config.sandbox.max_steps = v;
        }
        if let Some(v) = s.max_duration_ms {
            config.sandbox.max_duration_ms = v;
        }
    }
    if let Some(ref c) = section.cache {
        if let Some(v) = c.enabled {
            config.cache.enabled = v;
        }
        if let Some(ref v) = c.path {
            config.cache.path = Some(v.clone());
        }
    }
}

impl EngineConfig {
    /// Load configuration from the project root using the 3-level
    /// resolution order.
    ///
    /// 1. `compliance.check.toml` (project root)
    /// 2. `[tool.compliance.check]` in `pyproject.toml`
    /// 3. Built-in defaults
    ///
    /// First file found wins — later files are not consulted.
    ///
    /// # Errors
    ///
    /// Returns an error if a found config file cannot be read or parsed.
    pub fn load_from_project(root: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let check_toml = root.join("compliance.check.toml");
        if check_toml.is_file() {
            let content = std::fs::read_to_string(&check_toml).map_err(|e| {
                ConfigError::ReadError(check_toml.display().to_string(), e.to_string())
            })?;
            let parsed: TomlCheckFile = toml::from_str(&content).map_err(|e| {
                ConfigError::ParseError(check_toml.display().to_string(), e.to_string())
            })?;
            if let Some(ref section) = parsed.check {
                apply_toml_section(&mut config, section);
            }
            return Ok(config);
        }

        let pyproject = root.join("pyproject.toml");
        if pyproject.is_file() {
            let content = std::fs::read_to_string(&pyproject).map_err(|e| {
                ConfigError::ReadError(pyproject.display().to_string(), e.to_string())
            })?;
            let parsed: PyprojectToml = toml::from_str(&content).map_err(|e| {
                ConfigError::ParseError(pyproject.display().to_string(), e.to_string())
            })?;
            if let Some(tool) = parsed.tool {
                if let Some(compliance) = tool.compliance {
                    if let Some(ref section) = compliance.check {
                        apply_toml_section(&mut config, section);
                        return Ok(config);
                    }
                }
            }
        }

        Ok(config)
    }

    /// Compute a SHA-256 hash of the configuration, used to invalidate the
    /// sample-collection cache (§4.10) when tunables change.
    ///
    /// Uses canonical JSON (sorted keys) so the hash is deterministic
    /// regardless of field declaration order.
    #[must_use]
    pub fn config_hash(&self) -> String {
        use sha2::{Digest, Sha256};

        let value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        let canonical = canonical_json(&value);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}

// ---------------------------------------------------------------------------
// Canonical JSON for deterministic hashing
// ---------------------------------------------------------------------------

/// Produce a canonical JSON string with sorted object keys.
fn canonical_json(value: &serde_json::Value) -> String {
    let mut buf = String::new();
    write_canonical(value, &mut buf);
    buf
}

/// Recursively write a JSON value with sorted object keys.
fn write_canonical(value: &serde_json::Value, buf: &mut String) {
    use std::fmt::Write;

    match value {
        serde_json::Value::Null => buf.push_str("null"),
        serde_json::Value::Bool(b) => {
            let _ = write!(buf, "{b}");
        }
        serde_json::Value::Number(n) => {
            let _ = write!(buf, "{n}");
        }
        serde_json::Value::String(s) => {
            let _ = write!(buf, "{}", serde_json::to_string(s).unwrap_or_default());
        }
        serde_json::Value::Array(arr) => {
            buf.push('[');
            for (i, v) in arr.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                write_canonical(v, buf);
            }
            buf.push(']');
        }
        serde_json::Value::Object(map) => {
            buf.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                let _ = write!(buf, "{}", serde_json::to_string(*k).unwrap_or_default());
                buf.push(':');
                write_canonical(&map[*k], buf);
            }
            buf.push('}');
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[error("failed to read config file '{0}': {1}")]
    ReadError(String, String),

    /// Failed to parse a configuration file.
    #[error("failed to parse config file '{0}': {1}")]
    ParseError(String, String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.field_path_max_depth, 4);
        assert_eq!(config.generator.max_attempts, 2);
        assert!(config.cache.enabled);
        assert!(config.cache.path.is_none());
    }

    #[test]
    fn test_config_hash_deterministic() {
        let config = EngineConfig::default();
        assert_eq!(config.config_hash(), config.config_hash());
    }

    #[test]
    fn test_config_hash_changes_with_tunables() {
        let config1 = EngineConfig::default();
        let mut config2 = EngineConfig::default();
        config2.generator.max_attempts = 5;
        assert_ne!(config1.config_hash(), config2.config_hash());
    }

    #[test]
    fn test_load_nonexistent_dir() {
        let result = EngineConfig::load_from_project(Path::new("/nonexistent/path"));
        assert!(result.is_ok());
        let config = result.unwrap();
        assert_eq!(config.field_path_max_depth, 4);
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let toml_content = r#"
[check]
field_path_max_depth = 6

[check.generator]
max_attempts = 3

[check.orchestrator]
workers = 8
llm_timeout_secs = 120

[check.sandbox]
max_steps = 50000
max_duration_ms = 100

[check.cache]
enabled = false
"#;
        std::fs::write(dir.path().join("compliance.check.toml"), toml_content).unwrap();
        let config = EngineConfig::load_from_project(dir.path()).unwrap();
        assert_eq!(config.field_path_max_depth, 6);
        assert_eq!(config.generator.max_attempts, 3);
        assert_eq!(config.orchestrator.workers, 8);
        assert_eq!(config.orchestrator.llm_timeout_secs, 120);
        assert_eq!(config.sandbox.max_steps, 50_000);
        assert!(!config.cache.enabled);
    }

    #[test]
    fn test_load_from_pyproject_toml() {
        let dir = tempfile::tempdir().unwrap();
        let content = r#"
[project]
name = "my-project"

[tool.compliance.check]
field_path_max_depth = 3

[tool.compliance.check.generator]
max_attempts = 1
"#;
        std::fs::write(dir.path().join("pyproject.toml"), content).unwrap();
        let config = EngineConfig::load_from_project(dir.path()).unwrap();
        assert_eq!(config.field_path_max_depth, 3);
        assert_eq!(config.generator.max_attempts, 1);
    }

    #[test]
    fn test_check_toml_wins_over_pyproject() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("compliance.check.toml"),
            "[check]\nfield_path_max_depth = 9\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("pyproject.toml"),
            "[tool.compliance.check]\nfield_path_max_depth = 1\n",
        )
        .unwrap();
        let config = EngineConfig::load_from_project(dir.path()).unwrap();
        assert_eq!(config.field_path_max_depth, 9);
    }
}
