//! Field-Path Engine (§4.2): a pure, allocation-light evaluator for the
//! dotted-path mini-language Checks use to name a value inside a
//! [`crate::resource::Resource`]'s `data`.
//!
//! ```text
//! path       := func "(" inner ")"  |  inner
//! func       := "len"|"any"|"all"|"count"|"sum"|"max"|"min"
//! inner      := segment ("." segment)*
//! segment    := identifier  |  identifier "[*]"  |  "*"
//! ```
//!
//! No I/O, no global state — every call is a pure function of the path
//! string and the resource data it's evaluated against.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFn {
    Len,
    Any,
    All,
    Count,
    Sum,
    Max,
    Min,
}

impl AggregateFn {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "len" => Self::Len,
            "any" => Self::Any,
            "all" => Self::All,
            "count" => Self::Count,
            "sum" => Self::Sum,
            "max" => Self::Max,
            "min" => Self::Min,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Plain `identifier`.
    Field(String),
    /// `identifier[*]`.
    FieldWildcard(String),
    /// Bare `*`.
    Wildcard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExpr {
    pub segments: Vec<PathSegment>,
    pub func: Option<AggregateFn>,
}

/// Parse a field path string into its [`PathExpr`] form.
///
/// # Errors
///
/// Returns [`FieldPathError::EmptyPath`] or
/// [`FieldPathError::InvalidSyntax`]/[`FieldPathError::UnknownFunction`] if
/// the path does not conform to the grammar above.
pub fn parse(path: &str) -> Result<PathExpr, FieldPathError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(FieldPathError::EmptyPath);
    }

    if let Some(open) = trimmed.find('(') {
        if !trimmed.ends_with(')') {
            return Err(FieldPathError::InvalidSyntax(path.to_owned()));
        }
        let func_name = &trimmed[..open];
        let inner = &trimmed[open + 1..trimmed.len() - 1];
        let func = AggregateFn::parse(func_name)
            .ok_or_else(|| FieldPathError::UnknownFunction(func_name.to_owned()))?;
        let segments = parse_inner(inner)?;
        return Ok(PathExpr {
            segments,
            func: Some(func),
        });
    }

    Ok(PathExpr {
        segments: parse_inner(trimmed)?,
        func: None,
    })
}

fn parse_inner(inner: &str) -> Result<Vec<PathSegment>, FieldPathError> {
    let inner = inner.trim();
    if inner.is_empty() {
        return Err(FieldPathError::EmptyPath);
    }
    inner.split('.').map(parse_segment).collect()
}

fn parse_segment(segment: &str) -> Result<PathSegment, FieldPathError> {
    if segment == "*" {
        return Ok(PathSegment::Wildcard);
    }
    if let Some(name) = segment.strip_suffix("[*]") {
        if IDENTIFIER.is_match(name) {
            return Ok(PathSegment::FieldWildcard(name.to_owned()));
        }
        return Err(FieldPathError::InvalidSyntax(segment.to_owned()));
    }
    if IDENTIFIER.is_match(segment) {
        return Ok(PathSegment::Field(segment.to_owned()));
    }
    Err(FieldPathError::InvalidSyntax(segment.to_owned()))
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate a field path against a resource's `data`.
///
/// # Errors
///
/// Returns [`FieldPathError::MissingField`] if a segment in the path cannot
/// be resolved against the top-level value, or a numeric-arithmetic error
/// from [`FieldPathError::NotNumeric`] if a `sum/max/min` wrapper is applied
/// to non-numeric, non-empty data.
pub fn evaluate(data: &Value, path: &str) -> Result<Value, FieldPathError> {
    let expr = parse(path)?;
    let extracted = evaluate_segments(data, &expr.segments)?;
    match expr.func {
        None => Ok(extracted),
        Some(func) => apply_function(func, &extracted),
    }
}

/// The intermediate evaluation state: a single value (no wildcard crossed
/// yet) or a flat list of per-branch values, where a branch that failed to
/// resolve becomes `None` rather than aborting the whole path.
enum EvalState {
    Single(Value),
    Multi(Vec<Option<Value>>),
}

fn evaluate_segments(root: &Value, segments: &[PathSegment]) -> Result<Value, FieldPathError> {
    let mut state = EvalState::Single(root.clone());
    let mut consumed = String::new();

    for segment in segments {
        if !consumed.is_empty() {
            consumed.push('.');
        }
        consumed.push_str(&segment_label(segment));

        state = match (state, segment) {
            (EvalState::Single(v), PathSegment::Field(name)) => {
                EvalState::Single(field_access(&v, name).ok_or_else(|| {
                    FieldPathError::MissingField(consumed.clone())
                })?)
            }
            (EvalState::Single(v), PathSegment::FieldWildcard(name)) => {
                let array_value = field_access(&v, name)
                    .ok_or_else(|| FieldPathError::MissingField(consumed.clone()))?;
                let elems = array_value
                    .as_array()
                    .ok_or_else(|| FieldPathError::MissingField(consumed.clone()))?;
                EvalState::Multi(elems.iter().cloned().map(Some).collect())
            }
            (EvalState::Single(v), PathSegment::Wildcard) => {
                let elems = v
                    .as_array()
                    .ok_or_else(|| FieldPathError::MissingField(consumed.clone()))?;
                EvalState::Multi(elems.iter().cloned().map(Some).collect())
            }
            (EvalState::Multi(items), PathSegment::Field(name)) => EvalState::Multi(
                items
                    .into_iter()
                    .map(|item| item.and_then(|v| field_access(&v, name)))
                    .collect(),
            ),
            (EvalState::Multi(items), PathSegment::FieldWildcard(name)) => {
                let mut flattened = Vec::new();
                for item in items {
                    if let Some(v) = item.and_then(|v| field_access(&v, name)) {
                        if let Some(arr) = v.as_array() {
                            flattened.extend(arr.iter().cloned().map(Some));
                        }
                    }
                }
                EvalState::Multi(flattened)
            }
            (EvalState::Multi(items), PathSegment::Wildcard) => {
                let mut flattened = Vec::new();
                for item in items {
                    if let Some(arr) = item.as_ref().and_then(Value::as_array) {
                        flattened.extend(arr.iter().cloned().map(Some));
                    }
                }
                EvalState::Multi(flattened)
            }
        };
    }

    Ok(match state {
        EvalState::Single(v) => v,
        EvalState::Multi(items) => Value::Array(items.into_iter().flatten().collect()),
    })
}

fn segment_label(segment: &PathSegment) -> String {
    match segment {
        PathSegment::Field(name) => name.clone(),
        PathSegment::FieldWildcard(name) => format!("{name}[*]"),
        PathSegment::Wildcard => "*".to_owned(),
    }
}

/// Field access with mapping-key fallback (§4.2.1): `v` is a JSON object in
/// every case here, so this is just `Value::get`, but kept as its own
/// function for the fallback wording's sake and as the one seam a future
/// struct-backed resource representation would need to change.
fn field_access(v: &Value, name: &str) -> Option<Value> {
    v.get(name).cloned()
}

// ---------------------------------------------------------------------------
// Aggregate functions
// ---------------------------------------------------------------------------

fn as_elements(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn apply_function(func: AggregateFn, value: &Value) -> Result<Value, FieldPathError> {
    match func {
        AggregateFn::Len => Ok(Value::from(len_of(value))),
        AggregateFn::Any => {
            let elems = as_elements(value);
            Ok(Value::Bool(elems.iter().any(is_truthy)))
        }
        AggregateFn::All => {
            let elems = as_elements(value);
            Ok(Value::Bool(elems.iter().all(is_truthy)))
        }
        AggregateFn::Count => {
            let elems = as_elements(value);
            Ok(Value::from(elems.iter().filter(|v| is_truthy(v)).count()))
        }
        AggregateFn::Sum => {
            let elems = as_elements(value);
            let numbers: Vec<f64> = elems.iter().filter_map(Value::as_f64).collect();
            if numbers.is_empty() {
                Ok(Value::from(0.0))
            } else if numbers.len() != elems.len() {
                Err(FieldPathError::NotNumeric("sum".to_owned()))
            } else {
                Ok(serde_json::Number::from_f64(numbers.iter().sum())
                    .map(Value::Number)
                    .unwrap_or(Value::from(0)))
            }
        }
        AggregateFn::Max | AggregateFn::Min => {
            let elems = as_elements(value);
            let numbers: Vec<f64> = elems.iter().filter_map(Value::as_f64).collect();
            if numbers.is_empty() || numbers.len() != elems.len() {
                return Err(FieldPathError::NotNumeric(
                    if func == AggregateFn::Max { "max" } else { "min" }.to_owned(),
                ));
            }
            let result = if func == AggregateFn::Max {
                numbers.iter().cloned().fold(f64::MIN, f64::max)
            } else {
                numbers.iter().cloned().fold(f64::MAX, f64::min)
            };
            Ok(serde_json::Number::from_f64(result)
                .map(Value::Number)
                .unwrap_or(Value::from(0)))
        }
    }
}

fn len_of(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::Array(a) => a.len(),
        Value::Object(o) => o.len(),
        Value::String(s) => s.chars().count(),
        _ => 0,
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FieldPathError {
    #[error("empty field path")]
    EmptyPath,

    #[error("invalid field path syntax: '{0}'")]
    InvalidSyntax(String),

    #[error("unknown field path function '{0}'")]
    UnknownFunction(String),

    #[error("missing field at '{0}'")]
    MissingField(String),

    #[error("'{0}' requires numeric, non-empty elements")]
    NotNumeric(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_nested_path() {
        let data = json!({"repository_data": {"basic_info": {"private": true}}});
        let value = evaluate(&data, "repository_data.basic_info.private").unwrap();
        assert_eq!(value, json!(true));
    }

    #[test]
    fn test_missing_field_raises() {
        let data = json!({"repository_data": {}});
        let err = evaluate(&data, "repository_data.basic_info.private").unwrap_err();
        assert!(matches!(err, FieldPathError::MissingField(_)));
    }

    #[test]
    fn test_array_wildcard_extraction() {
        let data = json!({"branches": [{"name": "main", "protected": true}, {"name": "dev", "protected": false}]});
        let value = evaluate(&data, "branches[*].name").unwrap();
        assert_eq!(value, json!(["main", "dev"]));
    }

    #[test]
    fn test_wildcard_on_non_array_raises() {
        let data = json!({"branches": {"name": "main"}});
        let err = evaluate(&data, "branches[*].name").unwrap_err();
        assert!(matches!(err, FieldPathError::MissingField(_)));
    }

    #[test]
    fn test_nested_wildcards_flatten_one_dimension_per_level() {
        let data = json!({
            "teams": [
                {"members": [{"name": "a"}, {"name": "b"}]},
                {"members": [{"name": "c"}]}
            ]
        });
        let value = evaluate(&data, "teams[*].members[*].name").unwrap();
        assert_eq!(value, json!(["a", "b", "c"]));
    }

    #[test]
    fn test_len_never_raises() {
        assert_eq!(evaluate(&json!(null), "len(missing_but_wrapped)").is_err(), true);
        let data = json!({"name": "hello"});
        assert_eq!(evaluate(&data, "len(name)").unwrap(), json!(5));
        let empty = json!({"tags": []});
        assert_eq!(evaluate(&empty, "len(tags)").unwrap(), json!(0));
    }

    #[test]
    fn test_any_all_count_empty_edge_cases() {
        let data = json!({"tags": []});
        assert_eq!(evaluate(&data, "any(tags[*])").unwrap(), json!(false));
        assert_eq!(evaluate(&data, "all(tags[*])").unwrap(), json!(true));
        assert_eq!(evaluate(&data, "count(tags[*])").unwrap(), json!(0));
    }

    #[test]
    fn test_any_all_on_array_values() {
        let data = json!({"flags": [true, false, true]});
        assert_eq!(evaluate(&data, "any(flags[*])").unwrap(), json!(true));
        assert_eq!(evaluate(&data, "all(flags[*])").unwrap(), json!(false));
        assert_eq!(evaluate(&data, "count(flags[*])").unwrap(), json!(2));
    }

    #[test]
    fn test_sum_of_empty_is_zero() {
        let data = json!({"values": []});
        assert_eq!(evaluate(&data, "sum(values[*])").unwrap(), json!(0.0));
    }

    #[test]
    fn test_max_of_non_numeric_raises() {
        let data = json!({"values": ["a", "b"]});
        let err = evaluate(&data, "max(values[*])").unwrap_err();
        assert!(matches!(err, FieldPathError::NotNumeric(_)));
    }

    #[test]
    fn test_max_min_over_numbers() {
        let data = json!({"values": [3, 1, 4, 1, 5]});
        assert_eq!(evaluate(&data, "max(values[*])").unwrap(), json!(5.0));
        assert_eq!(evaluate(&data, "min(values[*])").unwrap(), json!(1.0));
    }

    #[test]
    fn test_unknown_function_rejected() {
        let err = parse("frobnicate(x)").unwrap_err();
        assert!(matches!(err, FieldPathError::UnknownFunction(_)));
    }

    #[test]
    fn test_invalid_identifier_rejected() {
        assert!(parse("1bad.path").is_err());
    }
}
