//! Check Generator with Self-Improvement (§4.6): builds a prompt from a
//! `Control` and a resource schema fragment, calls an [`LLMClient`], parses
//! the response into a [`Check`], and retries with accumulated feedback
//! until the Check evaluates usefully against a sample collection or
//! `max_attempts` is exhausted.

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use crate::check::{Check, CheckMetadata, CheckOperation, CheckResult, FixDetails, OutputStatements};
use crate::config::GeneratorConfig;
use crate::llm::{LLMClient, LLMError, LLMRequest};
use crate::resource::ResourceCollection;
use crate::schema::SchemaRegistry;
use crate::types::ComparisonOperator;

/// The human-authored compliance requirement a generated Check targets.
#[derive(Debug, Clone)]
pub struct Control {
    pub id: String,
    pub framework_id: String,
    pub control_name: String,
    pub control_long_name: String,
    pub control_text: String,
    pub family_name: String,
    pub active: bool,
    pub order_index: i64,
}

impl Control {
    /// The alpha prefix of `control_name` (e.g. `AC`, `AU`, `SC`).
    #[must_use]
    pub fn family(&self) -> String {
        self.control_name.chars().take_while(|c| c.is_ascii_alphabetic()).collect()
    }

    /// Default `(severity, category)` suggestion tabulated per control
    /// family (see the family table).
    #[must_use]
    pub fn family_defaults(&self) -> (&'static str, &'static str) {
        match self.family().as_str() {
            "AC" => ("high", "access_control"),
            "AU" => ("medium", "monitoring"),
            "CM" => ("medium", "configuration"),
            "IA" => ("high", "access_control"),
            "SC" => ("high", "network_security"),
            "SI" => ("medium", "monitoring"),
            _ => ("medium", "configuration"),
        }
    }
}

/// Everything the generator needs to build a prompt and run the
/// self-improvement loop for one `(control, provider, resource_model)` task.
pub struct GeneratorInputs<'a> {
    pub control: &'a Control,
    pub provider: &'a str,
    pub resource_model_name: &'a str,
    pub schema_registry: &'a SchemaRegistry,
    pub field_path_max_depth: usize,
    pub suggested_severity: Option<&'a str>,
    pub suggested_category: Option<&'a str>,
    pub sample: &'a ResourceCollection,
}

/// Generate a Check for `inputs`, running the bounded self-improvement
/// loop described in §4.6.
///
/// # Errors
///
/// Returns [`GeneratorError::Exhausted`] if no valid Check was produced
/// within `config.max_attempts` regeneration rounds; propagates
/// [`LLMError`] if the underlying client fails outright.
pub fn generate(inputs: &GeneratorInputs<'_>, llm: &dyn LLMClient, config: &GeneratorConfig) -> Result<GeneratedCheck, GeneratorError> {
    let mut all_results: Vec<CheckResult> = Vec::new();
    let mut attempted_field_paths: Vec<String> = Vec::new();
    let mut attempts = 0u32;

    let initial_prompt = build_prompt(inputs, None);
    let mut check = request_check(llm, &initial_prompt)?;
    attempted_field_paths.push(check.metadata.field_path.clone());
    let mut results = check.evaluate(&inputs.sample.resources, &crate::config::SandboxConfig::default());
    all_results.extend(results.clone());

    while Check::results_are_invalid(&results) && attempts < config.max_attempts {
        attempts += 1;
        let feedback = Feedback::from_results(&all_results, &attempted_field_paths);
        let prompt = build_prompt(inputs, Some(&feedback));
        check = request_check(llm, &prompt)?;
        attempted_field_paths.push(check.metadata.field_path.clone());
        results = check.evaluate(&inputs.sample.resources, &crate::config::SandboxConfig::default());
        all_results.extend(results.clone());
    }

    if Check::results_are_invalid(&results) {
        Err(GeneratorError::Exhausted {
            control_id: inputs.control.id.clone(),
            attempts,
            sample_errors: all_results.iter().filter_map(|r| r.error.clone()).take(5).collect(),
        })
    } else {
        Ok(GeneratedCheck { check, attempts, all_results })
    }
}

#[derive(Debug)]
pub struct GeneratedCheck {
    pub check: Check,
    pub attempts: u32,
    pub all_results: Vec<CheckResult>,
}

// ---------------------------------------------------------------------------
// Prompt construction
// ---------------------------------------------------------------------------

struct Feedback {
    failed_field_paths: Vec<String>,
    sample_errors: Vec<String>,
}

impl Feedback {
    fn from_results(all_results: &[CheckResult], attempted_field_paths: &[String]) -> Self {
        let mut sample_errors = Vec::new();
        for result in all_results {
            if let Some(ref err) = result.error {
                if sample_errors.len() < 5 {
                    sample_errors.push(err.clone());
                }
            }
        }
        let mut failed_field_paths: Vec<String> = attempted_field_paths.to_vec();
        failed_field_paths.sort();
        failed_field_paths.dedup();
        Self { failed_field_paths, sample_errors }
    }
}

fn build_prompt(inputs: &GeneratorInputs<'_>, feedback: Option<&Feedback>) -> String {
    let (default_severity, default_category) = inputs.control.family_defaults();
    let severity = inputs.suggested_severity.unwrap_or(default_severity);
    let category = inputs.suggested_category.unwrap_or(default_category);

    let field_paths = inputs
        .schema_registry
        .field_paths(inputs.resource_model_name, inputs.field_path_max_depth)
        .join(", ");

    let fully_qualified = SchemaRegistry::fully_qualified_name(inputs.provider, inputs.resource_model_name);

    let operators = [
        ComparisonOperator::Equal,
        ComparisonOperator::NotEqual,
        ComparisonOperator::LessThan,
        ComparisonOperator::GreaterThan,
        ComparisonOperator::LessThanOrEqual,
        ComparisonOperator::GreaterThanOrEqual,
        ComparisonOperator::Contains,
        ComparisonOperator::NotContains,
        ComparisonOperator::Custom,
    ]
    .iter()
    .map(|op| op.wire_value())
    .collect::<Vec<_>>()
    .join(", ");

    let mut prompt = format!(
        "You are authoring a compliance Check for control {control_name} \
         ({control_long_name}).\n\
         Control text: {control_text}\n\
         Resource type: {fully_qualified}\n\
         Available field paths: {field_paths}\n\
         Available operators: {operators}\n\
         Suggested severity: {severity}\n\
         Suggested category: {category}\n\n\
         Respond with exactly one YAML document under a top-level `checks:` \
         key, one list entry with `name`, `description`, `output_statements` \
         ({{success, failure, partial}}), `fix_details` ({{description, \
         instructions, estimated_time, automation_available}}), and \
         `metadata` ({{resource_type, field_path, operation: {{name, logic}}, \
         expected_value, tags, severity, category}}). For a `custom` \
         operation, `logic` must assign `result` using `fetched_value` and \
         `expected_value`.",
        control_name = inputs.control.control_name,
        control_long_name = inputs.control.control_long_name,
        control_text = inputs.control.control_text,
    );

    if let Some(fb) = feedback {
        if !fb.failed_field_paths.is_empty() {
            prompt.push_str(&format!(
                "\n\nPreviously failed field paths (avoid repeating these): {}",
                fb.failed_field_paths.join(", ")
            ));
        }
        if !fb.sample_errors.is_empty() {
            prompt.push_str(&format!("\nSample errors from prior attempts: {}", fb.sample_errors.join(" | ")));
        }
    }

    prompt
}

fn request_check(llm: &dyn LLMClient, prompt: &str) -> Result<Check, GeneratorError> {
    let response = llm.generate(&LLMRequest::new(prompt))?;
    parse_response(&response.content)
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChecksDocument {
    checks: Vec<RawCheckRow>,
}

#[derive(Debug, Deserialize)]
struct RawCheckRow {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    output_statements: OutputStatements,
    #[serde(default)]
    fix_details: FixDetails,
    metadata: RawCheckMetadata,
}

#[derive(Debug, Deserialize)]
struct RawCheckMetadata {
    resource_type: String,
    field_path: String,
    operation: RawCheckOperation,
    #[serde(default)]
    expected_value: Option<Value>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCheckOperation {
    name: String,
    #[serde(default)]
    logic: Option<String>,
}

/// Strip fenced code markers, ensure a `checks:` header, parse YAML,
/// require exactly one entry, and validate it into a [`Check`] (§4.6).
///
/// # Errors
///
/// Returns [`GeneratorError::Malformed`] for any parsing or validation
/// failure along the way.
fn parse_response(content: &str) -> Result<Check, GeneratorError> {
    let stripped = strip_fences(content);
    let document_text = if stripped.trim_start().starts_with("checks:") {
        stripped
    } else {
        format!("checks:\n{}", indent(&stripped))
    };

    let document: ChecksDocument =
        serde_yaml::from_str(&document_text).map_err(|e| GeneratorError::Malformed(format!("invalid YAML: {e}")))?;

    if document.checks.len() != 1 {
        return Err(GeneratorError::Malformed(format!(
            "expected exactly one check entry, got {}",
            document.checks.len()
        )));
    }
    let raw = document.checks.into_iter().next().expect("len checked above");

    let operation_name = ComparisonOperator::parse_wire(&raw.metadata.operation.name)
        .ok_or_else(|| GeneratorError::Malformed(format!("unknown operation '{}'", raw.metadata.operation.name)))?;

    Ok(Check::new(
        uuid::Uuid::new_v4().to_string(),
        raw.name,
        raw.description,
        raw.metadata.category.clone(),
        Some("generator".to_owned()),
        None,
        Some(Utc::now()),
        Some(Utc::now()),
        false,
        raw.output_statements,
        raw.fix_details,
        CheckMetadata {
            resource_type: raw.metadata.resource_type,
            field_path: raw.metadata.field_path,
            operation: CheckOperation { name: operation_name, logic: raw.metadata.operation.logic },
            expected_value: raw.metadata.expected_value,
            tags: raw.metadata.tags,
            severity: raw.metadata.severity,
            category: raw.metadata.category,
        },
    ))
}

fn strip_fences(content: &str) -> String {
    let trimmed = content.trim();
    let without_leading = trimmed.strip_prefix("```yaml").or_else(|| trimmed.strip_prefix("```")).unwrap_or(trimmed);
    without_leading.strip_suffix("```").unwrap_or(without_leading).trim().to_owned()
}

fn indent(text: &str) -> String {
    text.lines().map(|line| format!("  {line}")).collect::<Vec<_>>().join("\n")
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error(transparent)]
    Llm(#[from] LLMError),

    #[error("generated response could not be parsed into a check: {0}")]
    Malformed(String),

    #[error("generator exhausted {attempts} attempt(s) for control {control_id}: {sample_errors:?}")]
    Exhausted { control_id: String, attempts: u32, sample_errors: Vec<String> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StubLLMClient;
    use crate::resource::Resource;
    use serde_json::json;

    fn control() -> Control {
        Control {
            id: "ctl-1".to_owned(),
            framework_id: "fw-1".to_owned(),
            control_name: "SC-13".to_owned(),
            control_long_name: "Cryptographic Protection".to_owned(),
            control_text: "The organization implements cryptographic mechanisms.".to_owned(),
            family_name: "System and Communications Protection".to_owned(),
            active: true,
            order_index: 1,
        }
    }

    fn schema_registry() -> SchemaRegistry {
        crate::schema::compile(
            "resources:\n  S3Bucket:\n    provider: aws\n    fields:\n      encrypted: boolean\n",
        )
        .unwrap()
    }

    fn sample() -> ResourceCollection {
        let resource = Resource::new("r1", "con_mon_v2.mappings.aws.S3Bucket", "aws", json!({"encrypted": true}));
        ResourceCollection::new("con_mon_v2.mappings.aws.S3Bucket", "aws", vec![resource])
    }

    const VALID_RESPONSE: &str = r#"
checks:
  - name: Buckets must be encrypted
    description: Ensures S3 buckets use server-side encryption
    output_statements:
      success: Bucket is encrypted
      failure: Bucket is not encrypted
      partial: null
    fix_details:
      description: Enable default encryption
      instructions:
        - Enable SSE-KMS on the bucket
      estimated_time: 5m
      automation_available: false
    metadata:
      resource_type: con_mon_v2.mappings.aws.S3Bucket
      field_path: encrypted
      operation:
        name: "=="
        logic: null
      expected_value: true
      tags:
        - sc-13
      severity: high
      category: network_security
"#;

    #[test]
    fn test_control_family_defaults() {
        let ctl = control();
        assert_eq!(ctl.family(), "SC");
        assert_eq!(ctl.family_defaults(), ("high", "network_security"));
    }

    #[test]
    fn test_generate_succeeds_on_first_attempt() {
        let registry = schema_registry();
        let sample_collection = sample();
        let ctl = control();
        let inputs = GeneratorInputs {
            control: &ctl,
            provider: "aws",
            resource_model_name: "S3Bucket",
            schema_registry: &registry,
            field_path_max_depth: 4,
            suggested_severity: None,
            suggested_category: None,
            sample: &sample_collection,
        };
        let llm = StubLLMClient::with_content(vec![VALID_RESPONSE]);
        let config = GeneratorConfig::default();
        let result = generate(&inputs, &llm, &config).unwrap();
        assert_eq!(result.attempts, 0);
        assert_eq!(result.check.metadata.field_path, "encrypted");
    }

    #[test]
    fn test_feedback_carries_forward_previously_failed_field_paths() {
        let feedback = Feedback::from_results(&[], &["does_not_exist".to_owned(), "does_not_exist".to_owned()]);
        assert_eq!(feedback.failed_field_paths, vec!["does_not_exist".to_owned()]);

        let ctl = control();
        let registry = schema_registry();
        let sample_collection = sample();
        let inputs = GeneratorInputs {
            control: &ctl,
            provider: "aws",
            resource_model_name: "S3Bucket",
            schema_registry: &registry,
            field_path_max_depth: 4,
            suggested_severity: None,
            suggested_category: None,
            sample: &sample_collection,
        };
        let prompt = build_prompt(&inputs, Some(&feedback));
        assert!(prompt.contains("Previously failed field paths"));
        assert!(prompt.contains("does_not_exist"));
    }

    #[test]
    fn test_generate_retries_then_succeeds() {
        let registry = schema_registry();
        let sample_collection = sample();
        let ctl = control();
        let inputs = GeneratorInputs {
            control: &ctl,
            provider: "aws",
            resource_model_name: "S3Bucket",
            schema_registry: &registry,
            field_path_max_depth: 4,
            suggested_severity: None,
            suggested_category: None,
            sample: &sample_collection,
        };
        let bad_response = VALID_RESPONSE.replace("field_path: encrypted", "field_path: does_not_exist");
        let llm = StubLLMClient::with_content(vec![&bad_response, VALID_RESPONSE]);
        let config = GeneratorConfig::default();
        let result = generate(&inputs, &llm, &config).unwrap();
        assert_eq!(result.attempts, 1);
    }

    #[test]
    fn test_generate_exhausts_attempts_and_fails() {
        let registry = schema_registry();
        let sample_collection = sample();
        let ctl = control();
        let inputs = GeneratorInputs {
            control: &ctl,
            provider: "aws",
            resource_model_name: "S3Bucket",
            schema_registry: &registry,
            field_path_max_depth: 4,
            suggested_severity: None,
            suggested_category: None,
            sample: &sample_collection,
        };
        let bad_response = VALID_RESPONSE.replace("field_path: encrypted", "field_path: does_not_exist");
        let llm = StubLLMClient::with_content(vec![&bad_response, &bad_response, &bad_response]);
        let config = GeneratorConfig { max_attempts: 2 };
        let result = generate(&inputs, &llm, &config);
        assert!(matches!(result, Err(GeneratorError::Exhausted { .. })));
    }

    #[test]
    fn test_parse_response_rejects_multiple_entries() {
        let doc = format!("{VALID_RESPONSE}  - name: second\n    metadata:\n      resource_type: x\n      field_path: y\n      operation:\n        name: \"==\"\n");
        let result = parse_response(&doc);
        assert!(result.is_err());
    }

    #[test]
    fn test_strip_fences_handles_fenced_yaml() {
        let fenced = format!("```yaml\n{VALID_RESPONSE}```");
        let check = parse_response(&fenced).unwrap();
        assert_eq!(check.metadata.field_path, "encrypted");
    }
}
