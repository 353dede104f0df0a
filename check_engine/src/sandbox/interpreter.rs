//! Tree-walking evaluator for the sandbox AST.
//!
//! Execution is bounded on two axes (`SandboxConfig`): a step counter
//! incremented on every statement and expression node visited, and a
//! wall-clock deadline checked at the same points. Either ceiling being
//! crossed surfaces as [`SandboxError::StepLimitExceeded`] /
//! [`SandboxError::TimeLimitExceeded`] — an execution failure, never a
//! silent `false`.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::ast::{BinOp, BoolOp, CmpOp, Expr, Stmt, UnaryOp};
use super::value::SandboxValue;
use super::SandboxError;

pub struct Interpreter {
    env: BTreeMap<String, SandboxValue>,
    steps_taken: u64,
    max_steps: u64,
    deadline: Instant,
}

impl Interpreter {
    pub fn new(env: BTreeMap<String, SandboxValue>, max_steps: u64, max_duration: Duration) -> Self {
        Self {
            env,
            steps_taken: 0,
            max_steps,
            deadline: Instant::now() + max_duration,
        }
    }

    pub fn run(&mut self, program: &[Stmt]) -> Result<SandboxValue, SandboxError> {
        self.exec_block(program)?;
        Ok(self.env.get("result").cloned().unwrap_or(SandboxValue::Bool(false)))
    }

    fn tick(&mut self) -> Result<(), SandboxError> {
        self.steps_taken += 1;
        if self.steps_taken > self.max_steps {
            return Err(SandboxError::StepLimitExceeded(self.max_steps));
        }
        if Instant::now() > self.deadline {
            return Err(SandboxError::TimeLimitExceeded);
        }
        Ok(())
    }

    fn exec_block(&mut self, stmts: &[Stmt]) -> Result<(), SandboxError> {
        for stmt in stmts {
            self.exec_stmt(stmt)?;
        }
        Ok(())
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<(), SandboxError> {
        self.tick()?;
        match stmt {
            Stmt::Pass => Ok(()),
            Stmt::Assign(name, expr) => {
                let value = self.eval(expr)?;
                self.env.insert(name.clone(), value);
                Ok(())
            }
            Stmt::Expr(expr) => {
                self.eval(expr)?;
                Ok(())
            }
            Stmt::If(branches, else_body) => {
                for (cond, body) in branches {
                    if self.eval(cond)?.truthy() {
                        return self.exec_block(body);
                    }
                }
                self.exec_block(else_body)
            }
            Stmt::For(target, iterable, body) => {
                let iter_value = self.eval(iterable)?;
                let items = iterable_items(iter_value)?;
                for item in items {
                    self.tick()?;
                    self.env.insert(target.clone(), item);
                    self.exec_block(body)?;
                }
                Ok(())
            }
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<SandboxValue, SandboxError> {
        self.tick()?;
        match expr {
            Expr::None => Ok(SandboxValue::None),
            Expr::Bool(b) => Ok(SandboxValue::Bool(*b)),
            Expr::Int(n) => Ok(SandboxValue::Int(*n)),
            Expr::Float(n) => Ok(SandboxValue::Float(*n)),
            Expr::Str(s) => Ok(SandboxValue::Str(s.clone())),
            Expr::Name(name) => match self.env.get(name) {
                Some(value) => Ok(value.clone()),
                None if super::parser::BUILTINS.contains(&name.as_str()) => {
                    Ok(super::builtins::type_marker(name))
                }
                None => Err(SandboxError::NameError(name.clone())),
            },
            Expr::List(items) => Ok(SandboxValue::List(
                items.iter().map(|e| self.eval(e)).collect::<Result<_, _>>()?,
            )),
            Expr::Tuple(items) => Ok(SandboxValue::Tuple(
                items.iter().map(|e| self.eval(e)).collect::<Result<_, _>>()?,
            )),
            Expr::Dict(entries) => {
                let mut map = BTreeMap::new();
                for (k, v) in entries {
                    let key = match self.eval(k)? {
                        SandboxValue::Str(s) => s,
                        other => other.to_string(),
                    };
                    map.insert(key, self.eval(v)?);
                }
                Ok(SandboxValue::Dict(map))
            }
            Expr::Attr(base, name) => {
                let base_value = self.eval(base)?;
                base_value
                    .get_attr_or_item(name)
                    .ok_or_else(|| SandboxError::AttributeError(name.clone()))
            }
            Expr::Index(base, index) => {
                let base_value = self.eval(base)?;
                let index_value = self.eval(index)?;
                index_into(&base_value, &index_value)
            }
            Expr::UnaryOp(op, inner) => {
                let value = self.eval(inner)?;
                match op {
                    UnaryOp::Not => Ok(SandboxValue::Bool(!value.truthy())),
                    UnaryOp::Neg => match value {
                        SandboxValue::Int(i) => Ok(SandboxValue::Int(-i)),
                        SandboxValue::Float(f) => Ok(SandboxValue::Float(-f)),
                        other => Err(SandboxError::TypeError(format!(
                            "bad operand type for unary -: '{}'",
                            other.type_name()
                        ))),
                    },
                }
            }
            Expr::BinOp(op, lhs, rhs) => {
                let left = self.eval(lhs)?;
                let right = self.eval(rhs)?;
                binop(*op, &left, &right)
            }
            Expr::BoolOp(op, terms) => {
                for (i, term) in terms.iter().enumerate() {
                    let value = self.eval(term)?;
                    let short_circuit = match op {
                        BoolOp::And => !value.truthy(),
                        BoolOp::Or => value.truthy(),
                    };
                    if short_circuit || i == terms.len() - 1 {
                        return Ok(value);
                    }
                }
                Ok(SandboxValue::Bool(matches!(op, BoolOp::And)))
            }
            Expr::Compare(first, rest) => {
                let mut left = self.eval(first)?;
                for (op, rhs_expr) in rest {
                    let right = self.eval(rhs_expr)?;
                    if !compare(*op, &left, &right)? {
                        return Ok(SandboxValue::Bool(false));
                    }
                    left = right;
                }
                Ok(SandboxValue::Bool(true))
            }
            Expr::Call(name, args) => {
                let values = args.iter().map(|a| self.eval(a)).collect::<Result<Vec<_>, _>>()?;
                super::builtins::call(name, &values)
            }
            Expr::MethodCall(receiver, method, args) => {
                let receiver_value = self.eval(receiver)?;
                let arg_values = args.iter().map(|a| self.eval(a)).collect::<Result<Vec<_>, _>>()?;
                super::builtins::call_method(&receiver_value, method, &arg_values)
            }
            Expr::GeneratorExp(element, var, iterable, condition) => {
                Ok(SandboxValue::List(self.eval_comprehension(element, var, iterable, condition.as_deref())?))
            }
            Expr::ListComp(element, var, iterable, condition) => {
                Ok(SandboxValue::List(self.eval_comprehension(element, var, iterable, condition.as_deref())?))
            }
        }
    }

    /// Shared evaluation for generator expressions and list comprehensions —
    /// both are materialised eagerly into a `Vec` (no lazy generators here).
    /// The loop variable shadows any existing binding of the same name for
    /// the duration of the comprehension and is restored afterwards.
    fn eval_comprehension(
        &mut self,
        element: &Expr,
        var: &str,
        iterable: &Expr,
        condition: Option<&Expr>,
    ) -> Result<Vec<SandboxValue>, SandboxError> {
        let iter_value = self.eval(iterable)?;
        let items = iterable_items(iter_value)?;
        let previous = self.env.get(var).cloned();
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            self.tick()?;
            self.env.insert(var.to_owned(), item);
            let keep = match condition {
                Some(cond) => self.eval(cond)?.truthy(),
                None => true,
            };
            if keep {
                out.push(self.eval(element)?);
            }
        }
        match previous {
            Some(value) => {
                self.env.insert(var.to_owned(), value);
            }
            None => {
                self.env.remove(var);
            }
        }
        Ok(out)
    }
}

fn iterable_items(value: SandboxValue) -> Result<Vec<SandboxValue>, SandboxError> {
    match value {
        SandboxValue::List(items) | SandboxValue::Tuple(items) => Ok(items),
        SandboxValue::Dict(map) => Ok(map.into_keys().map(SandboxValue::Str).collect()),
        SandboxValue::Str(s) => Ok(s.chars().map(|c| SandboxValue::Str(c.to_string())).collect()),
        other => Err(SandboxError::TypeError(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

fn index_into(base: &SandboxValue, index: &SandboxValue) -> Result<SandboxValue, SandboxError> {
    match (base, index) {
        (SandboxValue::List(items) | SandboxValue::Tuple(items), SandboxValue::Int(i)) => {
            let idx = if *i < 0 { items.len() as i64 + i } else { *i };
            usize::try_from(idx)
                .ok()
                .and_then(|idx| items.get(idx))
                .cloned()
                .ok_or_else(|| SandboxError::IndexError(idx.to_string()))
        }
        (SandboxValue::Dict(map), SandboxValue::Str(key)) => {
            map.get(key).cloned().ok_or_else(|| SandboxError::KeyError(key.clone()))
        }
        (SandboxValue::Str(s), SandboxValue::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = if *i < 0 { chars.len() as i64 + i } else { *i };
            usize::try_from(idx)
                .ok()
                .and_then(|idx| chars.get(idx))
                .map(|c| SandboxValue::Str(c.to_string()))
                .ok_or_else(|| SandboxError::IndexError(idx.to_string()))
        }
        (base, _) => Err(SandboxError::TypeError(format!(
            "'{}' object is not subscriptable",
            base.type_name()
        ))),
    }
}

fn binop(op: BinOp, left: &SandboxValue, right: &SandboxValue) -> Result<SandboxValue, SandboxError> {
    if op == BinOp::Add {
        if let (SandboxValue::Str(a), SandboxValue::Str(b)) = (left, right) {
            return Ok(SandboxValue::Str(format!("{a}{b}")));
        }
        if let (SandboxValue::List(a), SandboxValue::List(b)) = (left, right) {
            let mut combined = a.clone();
            combined.extend(b.clone());
            return Ok(SandboxValue::List(combined));
        }
    }
    let (a, b) = match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(SandboxError::TypeError(format!(
                "unsupported operand type(s): '{}' and '{}'",
                left.type_name(),
                right.type_name()
            )))
        }
    };
    let both_int = matches!(left, SandboxValue::Int(_)) && matches!(right, SandboxValue::Int(_));
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(SandboxError::ZeroDivision);
            }
            a / b
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(SandboxError::ZeroDivision);
            }
            a.rem_euclid(b)
        }
    };
    if both_int && op != BinOp::Div {
        Ok(SandboxValue::Int(result as i64))
    } else {
        Ok(SandboxValue::Float(result))
    }
}

fn compare(op: CmpOp, left: &SandboxValue, right: &SandboxValue) -> Result<bool, SandboxError> {
    match op {
        CmpOp::Eq => Ok(values_equal(left, right)),
        CmpOp::NotEq => Ok(!values_equal(left, right)),
        CmpOp::In => contains(right, left),
        CmpOp::NotIn => contains(right, left).map(|b| !b),
        CmpOp::Lt | CmpOp::Gt | CmpOp::LtEq | CmpOp::GtEq => {
            let ordering = left.partial_cmp_value(right).ok_or_else(|| {
                SandboxError::TypeError(format!(
                    "'{}' not supported between instances of '{}' and '{}'",
                    op_symbol(op),
                    left.type_name(),
                    right.type_name()
                ))
            })?;
            Ok(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::LtEq => ordering.is_le(),
                CmpOp::GtEq => ordering.is_ge(),
                _ => unreachable!(),
            })
        }
    }
}

fn op_symbol(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Lt => "<",
        CmpOp::Gt => ">",
        CmpOp::LtEq => "<=",
        CmpOp::GtEq => ">=",
        _ => "?",
    }
}

fn values_equal(a: &SandboxValue, b: &SandboxValue) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    a == b
}

fn contains(container: &SandboxValue, needle: &SandboxValue) -> Result<bool, SandboxError> {
    match container {
        SandboxValue::List(items) | SandboxValue::Tuple(items) => {
            Ok(items.iter().any(|item| values_equal(item, needle)))
        }
        SandboxValue::Str(haystack) => match needle {
            SandboxValue::Str(s) => Ok(haystack.contains(s.as_str())),
            other => Err(SandboxError::TypeError(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        SandboxValue::Dict(map) => match needle {
            SandboxValue::Str(s) => Ok(map.contains_key(s)),
            other => Err(SandboxError::TypeError(format!(
                "unhashable key type: '{}'",
                other.type_name()
            ))),
        },
        other => Err(SandboxError::TypeError(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{lexer::tokenize, parser::parse};
    use serde_json::json;

    fn run_logic(logic: &str, fetched: serde_json::Value, expected: serde_json::Value) -> Result<bool, SandboxError> {
        let tokens = tokenize(logic)?;
        let program = parse(tokens)?;
        let mut env = BTreeMap::new();
        env.insert("fetched_value".to_owned(), SandboxValue::from_json(&fetched));
        env.insert("config_value".to_owned(), SandboxValue::from_json(&expected));
        env.insert("expected_value".to_owned(), SandboxValue::from_json(&expected));
        env.insert("result".to_owned(), SandboxValue::Bool(false));
        let mut interp = Interpreter::new(env, 100_000, Duration::from_millis(250));
        Ok(interp.run(&program)?.truthy())
    }

    #[test]
    fn test_simple_equality_check() {
        let out = run_logic("result = fetched_value == expected_value", json!(5), json!(5)).unwrap();
        assert!(out);
    }

    #[test]
    fn test_if_else_sets_result() {
        let logic = "if len(fetched_value) > 0:\n    result = True\nelse:\n    result = False\n";
        let out = run_logic(logic, json!([1, 2]), json!(null)).unwrap();
        assert!(out);
    }

    #[test]
    fn test_for_loop_builds_result() {
        let logic = "found = False\nfor tag in fetched_value:\n    if tag == expected_value:\n        found = True\nresult = found\n";
        let out = run_logic(logic, json!(["a", "b", "c"]), json!("b")).unwrap();
        assert!(out);
    }

    #[test]
    fn test_step_limit_exceeded() {
        let tokens = tokenize("for x in fetched_value:\n    pass\n").unwrap();
        let program = parse(tokens).unwrap();
        let mut env = BTreeMap::new();
        env.insert(
            "fetched_value".to_owned(),
            SandboxValue::from_json(&json!((0..1000).collect::<Vec<_>>())),
        );
        env.insert("config_value".to_owned(), SandboxValue::None);
        env.insert("expected_value".to_owned(), SandboxValue::None);
        env.insert("result".to_owned(), SandboxValue::Bool(false));
        let mut interp = Interpreter::new(env, 10, Duration::from_secs(5));
        let err = interp.run(&program).unwrap_err();
        assert!(matches!(err, SandboxError::StepLimitExceeded(_)));
    }

    #[test]
    fn test_division_by_zero_raises() {
        let err = run_logic("result = 1 / 0", json!(null), json!(null)).unwrap_err();
        assert!(matches!(err, SandboxError::ZeroDivision));
    }

    #[test]
    fn test_contains_via_in_operator() {
        let out = run_logic("result = expected_value in fetched_value", json!(["x", "y"]), json!("x")).unwrap();
        assert!(out);
    }

    #[test]
    fn test_any_generator_over_method_calls_finds_admin() {
        let logic = "result = any(m.get('role')=='admin' for m in fetched_value)";
        let members = json!([{"role": "member"}, {"role": "admin"}, {"role": "member"}]);
        let out = run_logic(logic, members, json!(null)).unwrap();
        assert!(out);
    }

    #[test]
    fn test_any_generator_over_method_calls_no_admin() {
        let logic = "result = any(m.get('role')=='admin' for m in fetched_value)";
        let members = json!([{"role": "member"}, {"role": "viewer"}]);
        let out = run_logic(logic, members, json!(null)).unwrap();
        assert!(!out);
    }

    #[test]
    fn test_sum_generator_with_if_clause_counts_admins() {
        let logic = "result = sum(1 for member in fetched_value if member.get('role') == 'admin') > 0";
        let members = json!([{"role": "admin"}, {"role": "member"}]);
        let out = run_logic(logic, members, json!(null)).unwrap();
        assert!(out);
    }

    #[test]
    fn test_list_comprehension_materialises_values() {
        let logic = "result = len([m.get('role') for m in fetched_value]) == 2";
        let members = json!([{"role": "admin"}, {"role": "member"}]);
        let out = run_logic(logic, members, json!(null)).unwrap();
        assert!(out);
    }

    #[test]
    fn test_dict_get_missing_key_returns_none_not_error() {
        let logic = "result = fetched_value.get('missing') == None";
        let out = run_logic(logic, json!({"role": "admin"}), json!(null)).unwrap();
        assert!(out);
    }

    #[test]
    fn test_method_call_on_unsupported_type_is_attribute_error() {
        let err = run_logic("result = fetched_value.get('x')", json!(5), json!(null)).unwrap_err();
        assert!(matches!(err, SandboxError::AttributeError(_)));
    }
}
