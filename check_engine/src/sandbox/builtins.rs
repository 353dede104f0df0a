//! The whitelisted builtin functions the sandbox interpreter may call.
//!
//! Every name here is one the parser accepts in call position (see
//! `parser::BUILTINS`); anything else was already rejected before the
//! interpreter runs. A handful (`int`, `str`, `float`, ...) double as type
//! markers when referenced bare (not called) — see `type_marker` — so that
//! `isinstance(x, int)` can be expressed without a real type-object value.

use super::value::SandboxValue;
use super::SandboxError;

const TYPE_MARKER_PREFIX: &str = "__type__:";

#[must_use]
pub fn type_marker(name: &str) -> SandboxValue {
    SandboxValue::Str(format!("{TYPE_MARKER_PREFIX}{name}"))
}

fn as_marker(value: &SandboxValue) -> Option<&str> {
    match value {
        SandboxValue::Str(s) => s.strip_prefix(TYPE_MARKER_PREFIX),
        _ => None,
    }
}

pub fn call(name: &str, args: &[SandboxValue]) -> Result<SandboxValue, SandboxError> {
    match name {
        "len" => {
            let v = one(args, name)?;
            v.len()
                .map(|n| SandboxValue::Int(n as i64))
                .ok_or_else(|| SandboxError::TypeError(format!("object of type '{}' has no len()", v.type_name())))
        }
        "str" => Ok(SandboxValue::Str(one(args, name)?.to_string())),
        "int" => {
            let v = one(args, name)?;
            match v {
                SandboxValue::Int(i) => Ok(SandboxValue::Int(*i)),
                SandboxValue::Float(f) => Ok(SandboxValue::Int(*f as i64)),
                SandboxValue::Bool(b) => Ok(SandboxValue::Int(i64::from(*b))),
                SandboxValue::Str(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(SandboxValue::Int)
                    .map_err(|_| SandboxError::ValueError(format!("invalid literal for int(): '{s}'"))),
                other => Err(SandboxError::TypeError(format!(
                    "int() argument must be a string or a number, not '{}'",
                    other.type_name()
                ))),
            }
        }
        "float" => {
            let v = one(args, name)?;
            v.as_f64()
                .map(SandboxValue::Float)
                .or_else(|| match v {
                    SandboxValue::Str(s) => s.trim().parse::<f64>().ok().map(SandboxValue::Float),
                    _ => None,
                })
                .ok_or_else(|| SandboxError::ValueError(format!("could not convert to float: {v}")))
        }
        "bool" => Ok(SandboxValue::Bool(one(args, name)?.truthy())),
        "list" => Ok(SandboxValue::List(as_elements(one(args, name)?)?)),
        "tuple" => Ok(SandboxValue::Tuple(as_elements(one(args, name)?)?)),
        "set" => {
            let mut seen = Vec::new();
            for item in as_elements(one(args, name)?)? {
                if !seen.contains(&item) {
                    seen.push(item);
                }
            }
            Ok(SandboxValue::List(seen))
        }
        "dict" => match args.first() {
            None => Ok(SandboxValue::Dict(std::collections::BTreeMap::new())),
            Some(SandboxValue::Dict(map)) => Ok(SandboxValue::Dict(map.clone())),
            Some(other) => Err(SandboxError::TypeError(format!(
                "cannot build dict from '{}'",
                other.type_name()
            ))),
        },
        "any" => Ok(SandboxValue::Bool(as_elements(one(args, name)?)?.iter().any(SandboxValue::truthy))),
        "all" => Ok(SandboxValue::Bool(as_elements(one(args, name)?)?.iter().all(SandboxValue::truthy))),
        "sum" => {
            let items = as_elements(one(args, name)?)?;
            let total: f64 = items.iter().filter_map(SandboxValue::as_f64).sum();
            Ok(numeric_result(total, all_ints(&items)))
        }
        "max" => reduce_extreme(args, name, true),
        "min" => reduce_extreme(args, name, false),
        "sorted" => {
            let mut items = as_elements(one(args, name)?)?;
            items.sort_by(|a, b| a.partial_cmp_value(b).unwrap_or(std::cmp::Ordering::Equal));
            Ok(SandboxValue::List(items))
        }
        "reversed" => {
            let mut items = as_elements(one(args, name)?)?;
            items.reverse();
            Ok(SandboxValue::List(items))
        }
        "enumerate" => {
            let items = as_elements(one(args, name)?)?;
            Ok(SandboxValue::List(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| SandboxValue::Tuple(vec![SandboxValue::Int(i as i64), v]))
                    .collect(),
            ))
        }
        "zip" => {
            let sequences: Vec<Vec<SandboxValue>> =
                args.iter().map(as_elements).collect::<Result<_, _>>()?;
            let shortest = sequences.iter().map(Vec::len).min().unwrap_or(0);
            Ok(SandboxValue::List(
                (0..shortest)
                    .map(|i| SandboxValue::Tuple(sequences.iter().map(|s| s[i].clone()).collect()))
                    .collect(),
            ))
        }
        "range" => range(args),
        "isinstance" => {
            if args.len() != 2 {
                return Err(SandboxError::TypeError("isinstance() takes exactly 2 arguments".to_owned()));
            }
            let type_name = as_marker(&args[1])
                .ok_or_else(|| SandboxError::TypeError("isinstance() arg 2 must be a type".to_owned()))?;
            Ok(SandboxValue::Bool(matches_type(&args[0], type_name)))
        }
        "hasattr" => {
            if args.len() != 2 {
                return Err(SandboxError::TypeError("hasattr() takes exactly 2 arguments".to_owned()));
            }
            let attr = match &args[1] {
                SandboxValue::Str(s) => s.as_str(),
                _ => return Err(SandboxError::TypeError("hasattr(): attribute name must be string".to_owned())),
            };
            Ok(SandboxValue::Bool(args[0].get_attr_or_item(attr).is_some()))
        }
        "getattr" => {
            if args.len() < 2 || args.len() > 3 {
                return Err(SandboxError::TypeError("getattr() takes 2 or 3 arguments".to_owned()));
            }
            let attr = match &args[1] {
                SandboxValue::Str(s) => s.as_str(),
                _ => return Err(SandboxError::TypeError("getattr(): attribute name must be string".to_owned())),
            };
            match args[0].get_attr_or_item(attr) {
                Some(v) => Ok(v),
                None => args
                    .get(2)
                    .cloned()
                    .ok_or_else(|| SandboxError::AttributeError(attr.to_owned())),
            }
        }
        "abs" => match one(args, name)? {
            SandboxValue::Int(i) => Ok(SandboxValue::Int(i.abs())),
            SandboxValue::Float(f) => Ok(SandboxValue::Float(f.abs())),
            other => Err(SandboxError::TypeError(format!(
                "bad operand type for abs(): '{}'",
                other.type_name()
            ))),
        },
        "round" => {
            let v = one(args, name)?.as_f64().ok_or_else(|| {
                SandboxError::TypeError("type expected a number for round()".to_owned())
            })?;
            Ok(SandboxValue::Int(v.round() as i64))
        }
        "Exception" => Ok(SandboxValue::Str(
            args.first().map(SandboxValue::to_string).unwrap_or_default(),
        )),
        other => Err(SandboxError::NameError(other.to_owned())),
    }
}

/// A whitelisted method dispatched on a runtime value (`dict.get`,
/// `str.upper`, ...), reached via `Expr::MethodCall`. Unlike `call`, which
/// only ever dispatches a bare whitelisted builtin name, the whitelist here
/// is keyed by `(receiver type, method name)`. An unrecognised pair is an
/// `AttributeError`, never a silent no-op — mirrors the `m.get(...)`
/// pattern custom predicates rely on (`con_mon_v2`'s own generated checks
/// use exactly this form to test a member's role).
pub fn call_method(receiver: &SandboxValue, method: &str, args: &[SandboxValue]) -> Result<SandboxValue, SandboxError> {
    match (receiver, method) {
        (SandboxValue::Dict(map), "get") => {
            let key = match args.first() {
                Some(SandboxValue::Str(s)) => s.clone(),
                Some(other) => {
                    return Err(SandboxError::TypeError(format!(
                        "dict key must be str, not '{}'",
                        other.type_name()
                    )))
                }
                None => return Err(SandboxError::TypeError("get() missing required argument: 'key'".to_owned())),
            };
            Ok(map.get(&key).cloned().unwrap_or_else(|| args.get(1).cloned().unwrap_or(SandboxValue::None)))
        }
        (SandboxValue::Dict(map), "keys") => Ok(SandboxValue::List(map.keys().cloned().map(SandboxValue::Str).collect())),
        (SandboxValue::Dict(map), "values") => Ok(SandboxValue::List(map.values().cloned().collect())),
        (SandboxValue::Dict(map), "items") => Ok(SandboxValue::List(
            map.iter()
                .map(|(k, v)| SandboxValue::Tuple(vec![SandboxValue::Str(k.clone()), v.clone()]))
                .collect(),
        )),
        (SandboxValue::Str(s), "upper") => Ok(SandboxValue::Str(s.to_uppercase())),
        (SandboxValue::Str(s), "lower") => Ok(SandboxValue::Str(s.to_lowercase())),
        (SandboxValue::Str(s), "strip") => Ok(SandboxValue::Str(s.trim().to_owned())),
        (SandboxValue::Str(s), "startswith") => Ok(SandboxValue::Bool(s.starts_with(string_arg(args, "startswith")?.as_str()))),
        (SandboxValue::Str(s), "endswith") => Ok(SandboxValue::Bool(s.ends_with(string_arg(args, "endswith")?.as_str()))),
        (SandboxValue::Str(s), "split") => {
            let parts = match args.first() {
                Some(SandboxValue::Str(sep)) => s.split(sep.as_str()).map(|p| SandboxValue::Str(p.to_owned())).collect(),
                None => s.split_whitespace().map(|p| SandboxValue::Str(p.to_owned())).collect(),
                Some(other) => {
                    return Err(SandboxError::TypeError(format!(
                        "split() argument must be str, not '{}'",
                        other.type_name()
                    )))
                }
            };
            Ok(SandboxValue::List(parts))
        }
        (SandboxValue::Str(s), "replace") => {
            let from = string_arg(args, "replace")?;
            let to = args.get(1).map(SandboxValue::to_string).unwrap_or_default();
            Ok(SandboxValue::Str(s.replace(from.as_str(), &to)))
        }
        (SandboxValue::List(items) | SandboxValue::Tuple(items), "count") => {
            let needle = one(args, "count")?.clone();
            Ok(SandboxValue::Int(items.iter().filter(|v| **v == needle).count() as i64))
        }
        (receiver, method) => Err(SandboxError::AttributeError(format!(
            "'{}' object has no attribute '{}'",
            receiver.type_name(),
            method
        ))),
    }
}

fn string_arg(args: &[SandboxValue], method_name: &str) -> Result<String, SandboxError> {
    match args.first() {
        Some(SandboxValue::Str(s)) => Ok(s.clone()),
        _ => Err(SandboxError::TypeError(format!("{method_name}() argument must be str"))),
    }
}

fn one<'a>(args: &'a [SandboxValue], fn_name: &str) -> Result<&'a SandboxValue, SandboxError> {
    args.first()
        .ok_or_else(|| SandboxError::TypeError(format!("{fn_name}() missing required argument")))
}

fn as_elements(value: &SandboxValue) -> Result<Vec<SandboxValue>, SandboxError> {
    match value {
        SandboxValue::List(items) | SandboxValue::Tuple(items) => Ok(items.clone()),
        SandboxValue::Dict(map) => Ok(map.keys().cloned().map(SandboxValue::Str).collect()),
        SandboxValue::Str(s) => Ok(s.chars().map(|c| SandboxValue::Str(c.to_string())).collect()),
        other => Err(SandboxError::TypeError(format!("'{}' object is not iterable", other.type_name()))),
    }
}

fn all_ints(items: &[SandboxValue]) -> bool {
    items.iter().all(|v| matches!(v, SandboxValue::Int(_)))
}

fn numeric_result(total: f64, as_int: bool) -> SandboxValue {
    if as_int {
        SandboxValue::Int(total as i64)
    } else {
        SandboxValue::Float(total)
    }
}

fn reduce_extreme(args: &[SandboxValue], fn_name: &str, want_max: bool) -> Result<SandboxValue, SandboxError> {
    let items = if args.len() == 1 {
        as_elements(one(args, fn_name)?)?
    } else {
        args.to_vec()
    };
    items
        .into_iter()
        .try_fold(None::<SandboxValue>, |acc, item| match acc {
            None => Ok(Some(item)),
            Some(best) => {
                let ordering = best.partial_cmp_value(&item).ok_or_else(|| {
                    SandboxError::TypeError(format!("'{fn_name}' not supported between these types"))
                })?;
                let keep_item = if want_max { ordering.is_lt() } else { ordering.is_gt() };
                Ok(Some(if keep_item { item } else { best }))
            }
        })?
        .ok_or_else(|| SandboxError::ValueError(format!("{fn_name}() arg is an empty sequence")))
}

fn range(args: &[SandboxValue]) -> Result<SandboxValue, SandboxError> {
    let ints: Vec<i64> = args
        .iter()
        .map(|v| match v {
            SandboxValue::Int(i) => Ok(*i),
            other => Err(SandboxError::TypeError(format!(
                "'{}' object cannot be interpreted as an integer",
                other.type_name()
            ))),
        })
        .collect::<Result<_, _>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(SandboxError::TypeError("range() takes 1 to 3 arguments".to_owned())),
    };
    if step == 0 {
        return Err(SandboxError::ValueError("range() arg 3 must not be zero".to_owned()));
    }
    let mut out = Vec::new();
    let mut n = start;
    while (step > 0 && n < stop) || (step < 0 && n > stop) {
        out.push(SandboxValue::Int(n));
        n += step;
    }
    Ok(SandboxValue::List(out))
}

fn matches_type(value: &SandboxValue, type_name: &str) -> bool {
    match type_name {
        "int" => matches!(value, SandboxValue::Int(_)),
        "float" => matches!(value, SandboxValue::Float(_)),
        "bool" => matches!(value, SandboxValue::Bool(_)),
        "str" => matches!(value, SandboxValue::Str(_)),
        "list" => matches!(value, SandboxValue::List(_)),
        "tuple" => matches!(value, SandboxValue::Tuple(_)),
        "dict" => matches!(value, SandboxValue::Dict(_)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_len_of_list() {
        let v = SandboxValue::from_json(&json!([1, 2, 3]));
        assert_eq!(call("len", &[v]).unwrap(), SandboxValue::Int(3));
    }

    #[test]
    fn test_any_all_on_empty() {
        let empty = SandboxValue::List(Vec::new());
        assert_eq!(call("any", &[empty.clone()]).unwrap(), SandboxValue::Bool(false));
        assert_eq!(call("all", &[empty]).unwrap(), SandboxValue::Bool(true));
    }

    #[test]
    fn test_sorted_numeric() {
        let v = SandboxValue::from_json(&json!([3, 1, 2]));
        let sorted = call("sorted", &[v]).unwrap();
        assert_eq!(sorted, SandboxValue::List(vec![SandboxValue::Int(1), SandboxValue::Int(2), SandboxValue::Int(3)]));
    }

    #[test]
    fn test_isinstance_marker() {
        let marker = type_marker("int");
        assert!(call("isinstance", &[SandboxValue::Int(5), marker]).unwrap().truthy());
    }

    #[test]
    fn test_range_three_arg() {
        let out = range(&[SandboxValue::Int(0), SandboxValue::Int(10), SandboxValue::Int(3)]).unwrap();
        assert_eq!(out, SandboxValue::List(vec![SandboxValue::Int(0), SandboxValue::Int(3), SandboxValue::Int(6), SandboxValue::Int(9)]));
    }

    #[test]
    fn test_max_of_empty_raises() {
        let err = call("max", &[SandboxValue::List(Vec::new())]).unwrap_err();
        assert!(matches!(err, SandboxError::ValueError(_)));
    }

    #[test]
    fn test_dict_get_found_and_missing_with_default() {
        let member = SandboxValue::from_json(&json!({"role": "admin"}));
        assert_eq!(
            call_method(&member, "get", &[SandboxValue::Str("role".to_owned())]).unwrap(),
            SandboxValue::Str("admin".to_owned())
        );
        assert_eq!(call_method(&member, "get", &[SandboxValue::Str("missing".to_owned())]).unwrap(), SandboxValue::None);
        assert_eq!(
            call_method(&member, "get", &[SandboxValue::Str("missing".to_owned()), SandboxValue::Int(0)]).unwrap(),
            SandboxValue::Int(0)
        );
    }

    #[test]
    fn test_str_upper_and_startswith() {
        let s = SandboxValue::Str("Admin".to_owned());
        assert_eq!(call_method(&s, "upper", &[]).unwrap(), SandboxValue::Str("ADMIN".to_owned()));
        assert_eq!(
            call_method(&s, "startswith", &[SandboxValue::Str("Adm".to_owned())]).unwrap(),
            SandboxValue::Bool(true)
        );
    }

    #[test]
    fn test_unknown_method_is_attribute_error() {
        let err = call_method(&SandboxValue::Int(5), "get", &[]).unwrap_err();
        assert!(matches!(err, SandboxError::AttributeError(_)));
    }
}
