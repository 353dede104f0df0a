//! Comparison Engine (§4.3): binary functions over `(fetched, expected)`
//! pairs for every [`crate::types::ComparisonOperator`] except `custom`,
//! which requires executing the Check's predicate text and is handled by
//! [`crate::sandbox`] instead (see [`ComparisonError::RequiresSandbox`]).

use serde_json::Value;

use crate::types::ComparisonOperator;

/// Apply a non-custom comparison operator to a `(fetched, expected)` pair.
///
/// # Errors
///
/// Returns [`ComparisonError::RequiresSandbox`] if `op` is
/// [`ComparisonOperator::Custom`] — the caller must invoke
/// [`crate::sandbox::execute`] instead. Returns
/// [`ComparisonError::TypeMismatch`] for an ordering comparator applied to
/// operands that are neither both numeric nor both strings.
pub fn compare(op: ComparisonOperator, fetched: &Value, expected: &Value) -> Result<bool, ComparisonError> {
    match op {
        ComparisonOperator::Equal => Ok(values_equal(fetched, expected)),
        ComparisonOperator::NotEqual => Ok(!values_equal(fetched, expected)),
        ComparisonOperator::LessThan => order(fetched, expected, "<", |a, b| a < b, |a, b| a < b),
        ComparisonOperator::GreaterThan => order(fetched, expected, ">", |a, b| a > b, |a, b| a > b),
        ComparisonOperator::LessThanOrEqual => {
            order(fetched, expected, "<=", |a, b| a <= b, |a, b| a <= b)
        }
        ComparisonOperator::GreaterThanOrEqual => {
            order(fetched, expected, ">=", |a, b| a >= b, |a, b| a >= b)
        }
        ComparisonOperator::Contains => Ok(contains(fetched, expected)),
        ComparisonOperator::NotContains => Ok(!contains(fetched, expected)),
        ComparisonOperator::Custom => Err(ComparisonError::RequiresSandbox(op.wire_value().to_owned())),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    a == b
}

fn order(
    fetched: &Value,
    expected: &Value,
    symbol: &str,
    numeric: impl Fn(f64, f64) -> bool,
    string: impl Fn(&str, &str) -> bool,
) -> Result<bool, ComparisonError> {
    if let (Some(a), Some(b)) = (fetched.as_f64(), expected.as_f64()) {
        return Ok(numeric(a, b));
    }
    if let (Some(a), Some(b)) = (fetched.as_str(), expected.as_str()) {
        return Ok(string(a, b));
    }
    Err(ComparisonError::TypeMismatch(
        symbol.to_owned(),
        fetched.clone(),
        expected.clone(),
    ))
}

/// `true` iff `fetched` has a containment relation and `expected` is found
/// within it; `false` (never an error) when `fetched` has no such relation.
fn contains(fetched: &Value, expected: &Value) -> bool {
    match fetched {
        Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
        Value::String(haystack) => expected
            .as_str()
            .map(|needle| haystack.contains(needle))
            .unwrap_or(false),
        Value::Object(map) => expected.as_str().map(|key| map.contains_key(key)).unwrap_or(false),
        _ => false,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ComparisonError {
    #[error("operator '{0}' requires sandbox execution, not a direct comparison")]
    RequiresSandbox(String),

    #[error("type mismatch applying '{0}': {1:?} vs {2:?}")]
    TypeMismatch(String, Value, Value),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equal_tolerates_int_vs_float() {
        assert!(compare(ComparisonOperator::Equal, &json!(5), &json!(5.0)).unwrap());
    }

    #[test]
    fn test_not_equal() {
        assert!(compare(ComparisonOperator::NotEqual, &json!(5), &json!(6)).unwrap());
    }

    #[test]
    fn test_ordering_numeric() {
        assert!(compare(ComparisonOperator::LessThan, &json!(3), &json!(5)).unwrap());
        assert!(compare(ComparisonOperator::GreaterThanOrEqual, &json!(5), &json!(5)).unwrap());
    }

    #[test]
    fn test_ordering_string() {
        assert!(compare(ComparisonOperator::LessThan, &json!("apple"), &json!("banana")).unwrap());
    }

    #[test]
    fn test_ordering_type_mismatch_raises() {
        let err = compare(ComparisonOperator::LessThan, &json!("5"), &json!(5)).unwrap_err();
        assert!(matches!(err, ComparisonError::TypeMismatch(..)));
    }

    #[test]
    fn test_contains_array() {
        assert!(compare(ComparisonOperator::Contains, &json!([1, 2, 3]), &json!(2)).unwrap());
        assert!(!compare(ComparisonOperator::Contains, &json!([1, 2, 3]), &json!(9)).unwrap());
    }

    #[test]
    fn test_contains_string() {
        assert!(compare(ComparisonOperator::Contains, &json!("hello world"), &json!("world")).unwrap());
    }

    #[test]
    fn test_contains_non_container_never_raises() {
        assert!(!compare(ComparisonOperator::Contains, &json!(42), &json!(1)).unwrap());
    }

    #[test]
    fn test_not_contains_non_container_is_true() {
        assert!(compare(ComparisonOperator::NotContains, &json!(42), &json!(1)).unwrap());
    }

    #[test]
    fn test_custom_requires_sandbox() {
        let err = compare(ComparisonOperator::Custom, &json!(1), &json!(1)).unwrap_err();
        assert!(matches!(err, ComparisonError::RequiresSandbox(_)));
    }
}
