//! Custom-Predicate Sandbox (§4.3.1): executes the LLM-authored `logic`
//! text a Check's `custom` comparator carries, in a restricted
//! Python-flavoured expression/statement language rather than real Python —
//! no interpreter embedding, no file/network/import access, a whitelisted
//! builtin surface, and hard step/time ceilings.
//!
//! Pipeline: [`lexer::tokenize`] -> [`parser::parse`] (which also rejects
//! any unresolvable identifier) -> [`interpreter::Interpreter::run`].

mod ast;
mod builtins;
mod interpreter;
mod lexer;
mod parser;
mod value;

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

pub use value::SandboxValue;

use crate::config::SandboxConfig;

/// Execute `logic` against the two values a Check comparison binds.
///
/// `fetched_value` is the value extracted from the resource by the field
/// path; `expected_value` is the Check's configured comparison value, also
/// bound as `config_value` for compatibility with generated logic that uses
/// either name. `result` starts bound to `false`; whatever it is bound to
/// when the program finishes is the boolean the comparison returns.
///
/// # Errors
///
/// Returns [`SandboxError::Syntax`] / [`SandboxError::NameError`] for logic
/// that fails to parse or references a name outside the whitelist, and
/// [`SandboxError::StepLimitExceeded`] / [`SandboxError::TimeLimitExceeded`]
/// if the configured ceilings in `config` are crossed. Any of these is an
/// execution failure, not a `false` result — callers must propagate it
/// rather than coerce it.
pub fn execute(logic: &str, fetched_value: &Value, expected_value: &Value, config: &SandboxConfig) -> Result<bool, SandboxError> {
    validate_logic(logic)?;
    let tokens = lexer::tokenize(logic)?;
    let program = parser::parse(tokens)?;

    let mut env = BTreeMap::new();
    env.insert("fetched_value".to_owned(), SandboxValue::from_json(fetched_value));
    env.insert("config_value".to_owned(), SandboxValue::from_json(expected_value));
    env.insert("expected_value".to_owned(), SandboxValue::from_json(expected_value));
    env.insert("result".to_owned(), SandboxValue::Bool(false));

    let mut interp = interpreter::Interpreter::new(
        env,
        config.max_steps,
        Duration::from_millis(config.max_duration_ms),
    );
    Ok(interp.run(&program)?.truthy())
}

/// Reject logic text that could never produce a meaningful result: empty,
/// all-whitespace, or comment-only. A generated Check whose logic fails
/// this check is a configuration error, not a runtime one — callers
/// memoize this at first materialization of the Check so it is only ever
/// computed once per logic string.
///
/// # Errors
///
/// Returns [`SandboxError::EmptyLogic`] if `logic` has no executable
/// content.
pub fn validate_logic(logic: &str) -> Result<(), SandboxError> {
    let has_code = logic.lines().any(|line| {
        let trimmed = line.trim();
        !trimmed.is_empty() && !trimmed.starts_with('#')
    });
    if has_code {
        Ok(())
    } else {
        Err(SandboxError::EmptyLogic)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("syntax error in custom predicate: {0}")]
    Syntax(String),

    #[error("name '{0}' is not defined or not permitted in custom predicates")]
    NameError(String),

    #[error("'{0}' object has no attribute")]
    AttributeError(String),

    #[error("index out of range: {0}")]
    IndexError(String),

    #[error("key not found: {0}")]
    KeyError(String),

    #[error("type error: {0}")]
    TypeError(String),

    #[error("value error: {0}")]
    ValueError(String),

    #[error("division by zero")]
    ZeroDivision,

    #[error("custom predicate exceeded its step limit ({0} steps)")]
    StepLimitExceeded(u64),

    #[error("custom predicate exceeded its time limit")]
    TimeLimitExceeded,

    #[error("custom predicate logic is empty or contains no executable statements")]
    EmptyLogic,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cfg() -> SandboxConfig {
        SandboxConfig {
            max_steps: 100_000,
            max_duration_ms: 250,
        }
    }

    #[test]
    fn test_execute_simple_equality() {
        let out = execute("result = fetched_value == expected_value", &json!(5), &json!(5), &cfg()).unwrap();
        assert!(out);
    }

    #[test]
    fn test_execute_uses_comparison_and_len() {
        let logic = "result = len(fetched_value) >= 2 and expected_value in fetched_value";
        let out = execute(logic, &json!(["a", "b", "c"]), &json!("b"), &cfg()).unwrap();
        assert!(out);
    }

    #[test]
    fn test_validate_rejects_empty_logic() {
        assert!(matches!(validate_logic(""), Err(SandboxError::EmptyLogic)));
        assert!(matches!(validate_logic("   \n  \n"), Err(SandboxError::EmptyLogic)));
        assert!(matches!(validate_logic("# just a comment\n"), Err(SandboxError::EmptyLogic)));
    }

    #[test]
    fn test_validate_accepts_real_logic() {
        assert!(validate_logic("result = True").is_ok());
    }

    #[test]
    fn test_execute_rejects_disallowed_name() {
        let err = execute("result = __import__('os')", &json!(null), &json!(null), &cfg()).unwrap_err();
        assert!(matches!(err, SandboxError::NameError(_)));
    }

    #[test]
    fn test_execute_surfaces_step_limit_as_error_not_false() {
        let tight = SandboxConfig { max_steps: 2, max_duration_ms: 250 };
        let logic = "for x in fetched_value:\n    pass\nresult = True\n";
        let err = execute(logic, &json!([1, 2, 3, 4, 5]), &json!(null), &tight).unwrap_err();
        assert!(matches!(err, SandboxError::StepLimitExceeded(_)));
    }

    #[test]
    fn test_execute_custom_predicate_counting_admins() {
        let logic = "result = any(m.get('role')=='admin' for m in fetched_value)";
        let members = json!([{"role": "admin"}, {"role": "member"}, {"role": "member"}]);
        let out = execute(logic, &members, &json!(null), &cfg()).unwrap();
        assert!(out);
    }
}
