//! Check Model & Evaluator (§4.4): the central entity a compliance Check
//! is built from, and the `evaluate()` contract that turns a fetched
//! `ResourceCollection` into per-resource [`CheckResult`]s using the
//! Field-Path Engine and Comparison Engine.

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::comparison::{self, ComparisonError};
use crate::config::SandboxConfig;
use crate::field_path;
use crate::resource::Resource;
use crate::sandbox::{self, SandboxError};
use crate::types::ComparisonOperator;

/// The three message templates a Check carries for its aggregate outcomes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputStatements {
    pub success: Option<String>,
    pub failure: Option<String>,
    pub partial: Option<String>,
}

/// Remediation guidance attached to a Check, surfaced to operators when it
/// fails.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixDetails {
    pub description: Option<String>,
    #[serde(default)]
    pub instructions: Vec<String>,
    pub estimated_time: Option<String>,
    #[serde(default)]
    pub automation_available: bool,
}

/// The raw `metadata.operation` view: an operator name plus optional
/// predicate source text (populated only for `custom`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOperation {
    pub name: ComparisonOperator,
    #[serde(default)]
    pub logic: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckMetadata {
    /// Fully-qualified resource type name (see [`crate::schema`]).
    pub resource_type: String,
    pub field_path: String,
    pub operation: CheckOperation,
    pub expected_value: Option<Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub severity: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_deleted: bool,
    pub output_statements: OutputStatements,
    pub fix_details: FixDetails,
    pub metadata: CheckMetadata,

    /// Lazily materialised from `metadata.operation`, memoised once per
    /// instance (§4.4: "two views of the same contract").
    #[serde(skip)]
    comparison_operation: OnceCell<Result<(), CheckConfigError>>,
}

/// A single resource's outcome against a Check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_id: String,
    pub resource_id: String,
    /// `None` denotes an execution failure (missing field, predicate
    /// raised); `Some(_)` denotes a logical outcome.
    pub passed: Option<bool>,
    pub message: String,
    pub error: Option<String>,
}

impl Check {
    /// Build a Check from its persisted fields, with a fresh (unmemoised)
    /// `comparison_operation` cell. Used by the Check generator (§4.6) and
    /// by `Store`-backed row loaders, which both sit outside this module
    /// and so cannot construct the struct literal directly.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        name: String,
        description: Option<String>,
        category: Option<String>,
        created_by: Option<String>,
        updated_by: Option<String>,
        created_at: Option<DateTime<Utc>>,
        updated_at: Option<DateTime<Utc>>,
        is_deleted: bool,
        output_statements: OutputStatements,
        fix_details: FixDetails,
        metadata: CheckMetadata,
    ) -> Self {
        Self {
            id,
            name,
            description,
            category,
            created_by,
            updated_by,
            created_at,
            updated_at,
            is_deleted,
            output_statements,
            fix_details,
            metadata,
            comparison_operation: OnceCell::new(),
        }
    }

    /// Validate and memoise the `comparison_operation` view of this Check.
    ///
    /// For `custom` operators this runs the sandbox's logic validation
    /// (§4.3.1) exactly once; for every other operator it confirms
    /// `expected_value` is present (§3 invariant).
    ///
    /// # Errors
    ///
    /// Returns [`CheckConfigError`] if the Check's metadata violates an
    /// invariant: empty/comment-only `logic` for `custom`, or a missing
    /// `expected_value` for a non-custom operator.
    pub fn comparison_operation(&self) -> Result<(), CheckConfigError> {
        self.comparison_operation
            .get_or_init(|| match self.metadata.operation.name {
                ComparisonOperator::Custom => {
                    let logic = self.metadata.operation.logic.as_deref().unwrap_or("");
                    sandbox::validate_logic(logic).map_err(|_| CheckConfigError::EmptyCustomLogic(self.id.clone()))
                }
                _ => {
                    if self.metadata.expected_value.is_none() {
                        Err(CheckConfigError::MissingExpectedValue(self.id.clone()))
                    } else {
                        Ok(())
                    }
                }
            })
            .clone()
    }

    /// Evaluate this Check against a set of fetched resources (§4.4).
    ///
    /// Resources whose `resource_type` does not match
    /// `metadata.resource_type` are skipped. An unresolvable
    /// `resource_type` (no matching resources at all) yields an empty
    /// result list, not an error.
    pub fn evaluate(&self, resources: &[Resource], sandbox_config: &SandboxConfig) -> Vec<CheckResult> {
        if let Err(err) = self.comparison_operation() {
            return vec![CheckResult {
                check_id: self.id.clone(),
                resource_id: String::new(),
                passed: None,
                message: format!("Check {} is misconfigured", self.name),
                error: Some(err.to_string()),
            }];
        }

        let matching: Vec<&Resource> = resources
            .iter()
            .filter(|r| r.resource_type == self.metadata.resource_type)
            .collect();

        matching
            .into_iter()
            .map(|resource| self.evaluate_one(resource, sandbox_config))
            .collect()
    }

    fn evaluate_one(&self, resource: &Resource, sandbox_config: &SandboxConfig) -> CheckResult {
        let fetched = match field_path::evaluate(&resource.data, &self.metadata.field_path) {
            Ok(value) => value,
            Err(err) => {
                return CheckResult {
                    check_id: self.id.clone(),
                    resource_id: resource.id.clone(),
                    passed: None,
                    message: format!("Check {} failed due to missing field", self.name),
                    error: Some(format!("Field extraction failed: {err}")),
                };
            }
        };

        let expected = self.metadata.expected_value.clone().unwrap_or(Value::Null);

        let outcome = self.run_comparison(&fetched, &expected, sandbox_config);

        match outcome {
            Ok(passed) => CheckResult {
                check_id: self.id.clone(),
                resource_id: resource.id.clone(),
                passed: Some(passed),
                message: format!(
                    "Check {} {}. Expected: {expected}, Actual: {fetched}",
                    self.name,
                    if passed { "passed" } else { "failed" }
                ),
                error: None,
            },
            Err(err) => CheckResult {
                check_id: self.id.clone(),
                resource_id: resource.id.clone(),
                passed: None,
                message: format!("Check {} failed due to a comparison error", self.name),
                error: Some(err.to_string()),
            },
        }
    }

    fn run_comparison(
        &self,
        fetched: &Value,
        expected: &Value,
        sandbox_config: &SandboxConfig,
    ) -> Result<bool, CheckEvalError> {
        match self.metadata.operation.name {
            ComparisonOperator::Custom => {
                let logic = self.metadata.operation.logic.as_deref().unwrap_or("");
                sandbox::execute(logic, fetched, expected, sandbox_config).map_err(CheckEvalError::Sandbox)
            }
            op => comparison::compare(op, fetched, expected).map_err(CheckEvalError::Comparison),
        }
    }

    /// A Check result list is *invalid* for generator purposes (§4.4.1)
    /// iff it is empty or every result has `passed = None`.
    #[must_use]
    pub fn results_are_invalid(results: &[CheckResult]) -> bool {
        results.is_empty() || results.iter().all(|r| r.passed.is_none())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CheckConfigError {
    #[error("check {0}: operation is 'custom' but logic is empty or comment-only")]
    EmptyCustomLogic(String),

    #[error("check {0}: non-custom operation requires a non-null expected_value")]
    MissingExpectedValue(String),
}

#[derive(Debug, thiserror::Error)]
enum CheckEvalError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Comparison(#[from] ComparisonError),
}
