//! GML evaluator.
//!
//! Walks the AST against a [`Context`] chain plus a per-block statement
//! scope. The language is null-safe by design: unknown variables, missing
//! fields, out-of-range indexes and unknown methods all evaluate to `null`
//! instead of failing the node. Hard errors are reserved for unknown
//! functions, malformed arguments and type-invalid arithmetic.

use crate::ast::*;
use crate::context::Context;
use crate::error::{GmlError, GmlResult};
use crate::functions::Functions;
use crate::methods;
use crate::parser::Parser;
use crate::udf::UdfKind;
use crate::value::{LambdaValue, Object, Value};
use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

const MAX_DEPTH: u32 = 64;

/// Compiled LIKE patterns, keyed by the raw pattern text.
static LIKE_CACHE: Lazy<Mutex<HashMap<String, Regex>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Borrowed evaluation state threaded through expression evaluation.
pub(crate) struct EvalScope<'a> {
    pub ctx: &'a Context,
    pub scope: &'a Object,
    pub depth: u32,
}

impl<'a> EvalScope<'a> {
    fn deeper<'b>(&self, scope: &'b Object) -> GmlResult<EvalScope<'b>>
    where
        'a: 'b,
    {
        if self.depth + 1 > MAX_DEPTH {
            return Err(GmlError::RecursionLimit);
        }
        Ok(EvalScope {
            ctx: self.ctx,
            scope,
            depth: self.depth + 1,
        })
    }
}

pub struct Evaluator {
    functions: Functions,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator {
    pub fn new() -> Self {
        Self {
            functions: Functions::new(),
        }
    }

    /// Parse and evaluate a GML block. Blocks containing assignments
    /// produce an object of the assigned fields (`$`-temporaries filtered);
    /// otherwise the value of the final expression statement.
    pub fn evaluate(&self, source: &str, ctx: &Context) -> GmlResult<Value> {
        let script = Parser::new(source)?.parse()?;
        self.evaluate_script(&script, ctx)
    }

    pub fn evaluate_script(&self, script: &Script, ctx: &Context) -> GmlResult<Value> {
        let mut scope = Object::new();
        let mut result = Value::Null;
        let mut has_assignments = false;

        for stmt in &script.statements {
            match stmt {
                Statement::Assignment(assign) => {
                    let es = EvalScope {
                        ctx,
                        scope: &scope,
                        depth: 0,
                    };
                    let value = self.eval_expr(&assign.expression, &es)?;
                    has_assignments = true;
                    scope.insert(assign.field.clone(), value);
                }
                Statement::Expression(Expression::Spread(inner)) => {
                    // A standalone `...expr` statement merges the object's
                    // fields into the block output.
                    let es = EvalScope {
                        ctx,
                        scope: &scope,
                        depth: 0,
                    };
                    let value = self.eval_expr(inner, &es)?;
                    if let Value::Object(obj) = value {
                        has_assignments = true;
                        scope.extend(obj);
                    }
                }
                Statement::Expression(expr) => {
                    let es = EvalScope {
                        ctx,
                        scope: &scope,
                        depth: 0,
                    };
                    result = self.eval_expr(expr, &es)?;
                }
                Statement::Return(expr) => {
                    let es = EvalScope {
                        ctx,
                        scope: &scope,
                        depth: 0,
                    };
                    return self.eval_expr(expr, &es);
                }
            }
        }

        if has_assignments {
            let output: Object = scope
                .into_iter()
                .filter(|(k, _)| !k.starts_with('$'))
                .collect();
            if output.is_empty() {
                Ok(result)
            } else {
                Ok(Value::Object(output))
            }
        } else {
            Ok(result)
        }
    }

    /// Evaluate a block and return the assignment map, for `vars`/`sets`
    /// style consumers that want bindings rather than a block value.
    pub fn evaluate_bindings(&self, source: &str, ctx: &Context) -> GmlResult<Object> {
        let script = Parser::new(source)?.parse()?;
        let mut scope = Object::new();

        for stmt in &script.statements {
            match stmt {
                Statement::Assignment(assign) => {
                    let es = EvalScope {
                        ctx,
                        scope: &scope,
                        depth: 0,
                    };
                    let value = self.eval_expr(&assign.expression, &es)?;
                    scope.insert(assign.field.clone(), value);
                }
                Statement::Expression(Expression::Spread(inner)) => {
                    let es = EvalScope {
                        ctx,
                        scope: &scope,
                        depth: 0,
                    };
                    if let Value::Object(obj) = self.eval_expr(inner, &es)? {
                        scope.extend(obj);
                    }
                }
                Statement::Expression(_) | Statement::Return(_) => {}
            }
        }

        Ok(scope
            .into_iter()
            .filter(|(k, _)| !k.starts_with('$'))
            .collect())
    }

    /// Evaluate a boolean guard expression (`when`, `only`).
    pub fn evaluate_bool(&self, source: &str, ctx: &Context) -> GmlResult<bool> {
        Ok(self.evaluate(source, ctx)?.is_truthy())
    }

    pub(crate) fn eval_expr(&self, expr: &Expression, es: &EvalScope) -> GmlResult<Value> {
        match expr {
            Expression::Literal(v) => Ok(v.clone()),

            Expression::Variable(path) => {
                // Statement scope shadows the context chain.
                let first = &path[0];
                let root = es
                    .scope
                    .get(first)
                    .or_else(|| es.ctx.get(first))
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(resolve_path(root, &path[1..]))
            }

            Expression::This(path) => {
                // Inside a callable property `this` is the receiver;
                // otherwise it is the evaluation root.
                let root = match es.scope.get("this") {
                    Some(receiver) => receiver.clone(),
                    None => Value::Object(es.ctx.flatten()),
                };
                Ok(resolve_path(root, path))
            }

            Expression::Member {
                target,
                name,
                optional: _,
            } => {
                let value = self.eval_expr(target, es)?;
                Ok(member_of(&value, name))
            }

            Expression::Index { target, index } => {
                let value = self.eval_expr(target, es)?;
                let index = self.eval_expr(index, es)?;
                Ok(index_of(&value, &index))
            }

            Expression::Binary { left, op, right } => {
                let lhs = self.eval_expr(left, es)?;
                match op {
                    // Short-circuit forms return the deciding operand.
                    BinaryOp::And => {
                        if !lhs.is_truthy() {
                            return Ok(lhs);
                        }
                        return self.eval_expr(right, es);
                    }
                    BinaryOp::Or => {
                        if lhs.is_truthy() {
                            return Ok(lhs);
                        }
                        return self.eval_expr(right, es);
                    }
                    BinaryOp::NullCoalesce => {
                        if !lhs.is_null() {
                            return Ok(lhs);
                        }
                        return self.eval_expr(right, es);
                    }
                    _ => {}
                }
                let rhs = self.eval_expr(right, es)?;
                eval_binary_op(&lhs, *op, &rhs)
            }

            Expression::Unary { op, operand } => {
                let value = self.eval_expr(operand, es)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
                    UnaryOp::Neg => match value {
                        Value::Int(i) => Ok(Value::Int(-i)),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        other => Err(GmlError::TypeMismatch {
                            expected: "number".to_string(),
                            actual: other.type_name().to_string(),
                        }),
                    },
                    UnaryOp::Pos => match value {
                        Value::Int(_) | Value::Float(_) => Ok(value),
                        Value::String(s) => s
                            .trim()
                            .parse::<f64>()
                            .map(Value::Float)
                            .map_err(|_| GmlError::TypeMismatch {
                                expected: "numeric string".to_string(),
                                actual: "string".to_string(),
                            }),
                        other => Err(GmlError::TypeMismatch {
                            expected: "number".to_string(),
                            actual: other.type_name().to_string(),
                        }),
                    },
                }
            }

            Expression::Ternary {
                condition,
                then_branch,
                else_branch,
            } => {
                if self.eval_expr(condition, es)?.is_truthy() {
                    self.eval_expr(then_branch, es)
                } else {
                    self.eval_expr(else_branch, es)
                }
            }

            Expression::Case {
                branches,
                else_branch,
            } => {
                for branch in branches {
                    if self.eval_expr(&branch.when, es)?.is_truthy() {
                        return self.eval_expr(&branch.then, es);
                    }
                }
                match else_branch {
                    Some(expr) => self.eval_expr(expr, es),
                    None => Ok(Value::Null),
                }
            }

            Expression::FunctionCall { name, args } => {
                let arg_values: Vec<Value> = args
                    .iter()
                    .map(|a| self.eval_expr(a, es))
                    .collect::<GmlResult<_>>()?;

                if self.functions.contains(name) {
                    return self.functions.call(name, &arg_values);
                }
                if let Some(udf) = es.ctx.lookup_udf(name) {
                    return self.invoke_udf(&udf, &arg_values, es);
                }
                Err(GmlError::UndefinedFunction(name.clone()))
            }

            Expression::MethodCall {
                target,
                method,
                args,
                optional: _,
            } => {
                let receiver = self.eval_expr(target, es)?;
                if receiver.is_null() {
                    return Ok(Value::Null);
                }
                let arg_values: Vec<Value> = args
                    .iter()
                    .map(|a| self.eval_expr(a, es))
                    .collect::<GmlResult<_>>()?;
                self.dispatch_method(&receiver, method, &arg_values, es)
            }

            Expression::Lambda { params, body } => Ok(Value::Lambda(LambdaValue {
                params: params.clone(),
                body: Arc::new((**body).clone()),
            })),

            Expression::ObjectLiteral(fields) => {
                let mut obj = Object::new();
                for field in fields {
                    match field {
                        ObjectField::Named { name, value } => {
                            obj.insert(name.clone(), self.eval_expr(value, es)?);
                        }
                        ObjectField::Shorthand(name) => {
                            let value = es
                                .scope
                                .get(name)
                                .or_else(|| es.ctx.get(name))
                                .cloned()
                                .unwrap_or(Value::Null);
                            obj.insert(name.clone(), value);
                        }
                        ObjectField::Spread(expr) => {
                            if let Value::Object(spread) = self.eval_expr(expr, es)? {
                                obj.extend(spread);
                            }
                        }
                    }
                }
                Ok(Value::Object(obj))
            }

            Expression::ArrayLiteral(elements) => {
                let mut arr = Vec::with_capacity(elements.len());
                for element in elements {
                    if let Expression::Spread(inner) = element {
                        match self.eval_expr(inner, es)? {
                            Value::Array(items) => arr.extend(items),
                            Value::Null => {}
                            other => arr.push(other),
                        }
                    } else {
                        arr.push(self.eval_expr(element, es)?);
                    }
                }
                Ok(Value::Array(arr))
            }

            Expression::Spread(inner) => self.eval_expr(inner, es),

            Expression::Template(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Literal(s) => out.push_str(s),
                        TemplatePart::Expression(expr) => {
                            out.push_str(&self.eval_expr(expr, es)?.template_string());
                        }
                    }
                }
                Ok(Value::String(out))
            }
        }
    }

    /// Method dispatch: array table, string table, object table, then a
    /// callable property on the receiver; anything else is `null`.
    fn dispatch_method(
        &self,
        receiver: &Value,
        method: &str,
        args: &[Value],
        es: &EvalScope,
    ) -> GmlResult<Value> {
        match receiver {
            Value::Array(arr) => methods::array_method(self, arr, method, args, es),
            Value::String(s) => methods::string_method(s, method, args),
            Value::Object(obj) => {
                if let Some(result) = methods::object_method(obj, method, args)? {
                    return Ok(result);
                }
                if let Some(Value::Lambda(lambda)) = obj.get(method) {
                    let mut scope = es.scope.clone();
                    scope.insert("this".to_string(), receiver.clone());
                    let lambda = lambda.clone();
                    let es = es.deeper(&scope)?;
                    return self.invoke_lambda(&lambda, args, &es);
                }
                Ok(Value::Null)
            }
            _ => Ok(Value::Null),
        }
    }

    /// Invoke an arrow function value with positional arguments.
    pub(crate) fn invoke_lambda(
        &self,
        lambda: &LambdaValue,
        args: &[Value],
        es: &EvalScope,
    ) -> GmlResult<Value> {
        let mut scope = es.scope.clone();
        for (param, value) in lambda.params.iter().zip(args.iter()) {
            scope.insert(param.clone(), value.clone());
        }
        for param in lambda.params.iter().skip(args.len()) {
            scope.insert(param.clone(), Value::Null);
        }
        let es = es.deeper(&scope)?;
        self.eval_expr(&lambda.body, &es)
    }

    fn invoke_udf(
        &self,
        udf: &crate::udf::Udf,
        args: &[Value],
        es: &EvalScope,
    ) -> GmlResult<Value> {
        let bound = udf.bind_args(args)?;
        match &udf.kind {
            UdfKind::Native(f) => f(&bound.iter().map(|(_, v)| v.clone()).collect::<Vec<_>>()),
            UdfKind::Expression(script) => {
                if es.depth + 1 > MAX_DEPTH {
                    return Err(GmlError::RecursionLimit);
                }
                // Fresh child frame with only the parameters bound; the
                // caller's context chain stays visible through the parent.
                let mut frame = es.ctx.child();
                for (name, value) in bound {
                    frame.set(name, value);
                }
                self.evaluate_script(script, &frame)
            }
        }
    }
}

// Path and member helpers: all null-safe.

fn resolve_path(root: Value, path: &[String]) -> Value {
    let mut current = root;
    for key in path {
        current = member_of(&current, key);
        if current.is_null() {
            return Value::Null;
        }
    }
    current
}

fn member_of(value: &Value, name: &str) -> Value {
    match value {
        Value::Object(obj) => obj.get(name).cloned().unwrap_or(Value::Null),
        Value::String(s) if name == "length" => Value::Int(s.chars().count() as i64),
        Value::Array(arr) if name == "length" => Value::Int(arr.len() as i64),
        _ => Value::Null,
    }
}

fn index_of(target: &Value, index: &Value) -> Value {
    match (target, index) {
        (Value::Array(arr), idx) => {
            let Some(i) = idx.as_int() else {
                return Value::Null;
            };
            let i = if i < 0 { arr.len() as i64 + i } else { i };
            if i < 0 {
                return Value::Null;
            }
            arr.get(i as usize).cloned().unwrap_or(Value::Null)
        }
        (Value::Object(obj), Value::String(key)) => obj.get(key).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn eval_binary_op(left: &Value, op: BinaryOp, right: &Value) -> GmlResult<Value> {
    match op {
        BinaryOp::Add => match (left, right) {
            (Value::String(_), _) | (_, Value::String(_)) => Ok(Value::String(format!(
                "{}{}",
                left.display_string(),
                right.display_string()
            ))),
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
            _ => numeric_op(left, right, |a, b| a + b),
        },
        BinaryOp::Sub => match (left, right) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a - b)),
            _ => numeric_op(left, right, |a, b| a - b),
        },
        BinaryOp::Mul => match (left, right) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a * b)),
            _ => numeric_op(left, right, |a, b| a * b),
        },
        BinaryOp::Div => {
            // IEEE-754 semantics: division by zero yields ±inf/NaN rather
            // than an error. Exact integer division stays an Int.
            if let (Value::Int(a), Value::Int(b)) = (left, right)
                && *b != 0
                && a % b == 0
            {
                return Ok(Value::Int(a / b));
            }
            numeric_op(left, right, |a, b| a / b)
        }
        BinaryOp::Mod => match (left, right) {
            (Value::Int(a), Value::Int(b)) if *b != 0 => Ok(Value::Int(a % b)),
            _ => numeric_op(left, right, |a, b| a % b),
        },
        BinaryOp::Eq => Ok(Value::Bool(loose_equals(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_equals(left, right))),
        BinaryOp::StrictEq => Ok(Value::Bool(strict_equals(left, right))),
        BinaryOp::StrictNe => Ok(Value::Bool(!strict_equals(left, right))),
        BinaryOp::Lt => compare_op(left, right, Ordering::is_lt),
        BinaryOp::Le => compare_op(left, right, Ordering::is_le),
        BinaryOp::Gt => compare_op(left, right, Ordering::is_gt),
        BinaryOp::Ge => compare_op(left, right, Ordering::is_ge),
        BinaryOp::In => {
            let found = match right {
                Value::Array(items) => items.iter().any(|item| loose_equals(left, item)),
                _ => false,
            };
            Ok(Value::Bool(found))
        }
        BinaryOp::Like => {
            let matched = match (left, right) {
                (Value::String(s), Value::String(pattern)) => like_match(s, pattern),
                _ => false,
            };
            Ok(Value::Bool(matched))
        }
        BinaryOp::And | BinaryOp::Or | BinaryOp::NullCoalesce => {
            unreachable!("short-circuit ops handled in eval_expr")
        }
    }
}

fn numeric_op(left: &Value, right: &Value, op: impl Fn(f64, f64) -> f64) -> GmlResult<Value> {
    match (left.as_float(), right.as_float()) {
        (Some(a), Some(b)) => Ok(Value::Float(op(a, b))),
        _ => Err(GmlError::TypeMismatch {
            expected: "number".to_string(),
            actual: format!("{} and {}", left.type_name(), right.type_name()),
        }),
    }
}

fn compare_op(
    left: &Value,
    right: &Value,
    check: impl Fn(Ordering) -> bool,
) -> GmlResult<Value> {
    let ordering = match (left, right) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => match (left.as_float(), right.as_float()) {
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
            _ => {
                return Err(GmlError::TypeMismatch {
                    expected: "comparable values".to_string(),
                    actual: format!("{} and {}", left.type_name(), right.type_name()),
                });
            }
        },
    };
    Ok(Value::Bool(check(ordering)))
}

/// Loose equality: numeric cross-variant comparison, number/string
/// comparison by numeric coercion, deep array/object comparison.
pub(crate) fn loose_equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::String(s), n @ (Value::Int(_) | Value::Float(_)))
        | (n @ (Value::Int(_) | Value::Float(_)), Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(|parsed| float_eq(parsed, n.as_float().unwrap_or(f64::NAN)))
            .unwrap_or(false),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| loose_equals(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).is_some_and(|other| loose_equals(v, other)))
        }
        _ => match (left.as_float(), right.as_float()) {
            (Some(a), Some(b)) => float_eq(a, b),
            _ => false,
        },
    }
}

fn strict_equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        (
            a @ (Value::Int(_) | Value::Float(_)),
            b @ (Value::Int(_) | Value::Float(_)),
        ) => float_eq(a.as_float().unwrap(), b.as_float().unwrap()),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| strict_equals(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).is_some_and(|other| strict_equals(v, other)))
        }
        _ => false,
    }
}

fn float_eq(a: f64, b: f64) -> bool {
    (a - b).abs() < f64::EPSILON
}

/// Ordering used by `sort()` and aggregate comparisons.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => match (a.as_float(), b.as_float()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
    }
}

/// SQL LIKE: `%` matches any run, `_` one character; case-insensitive.
fn like_match(s: &str, pattern: &str) -> bool {
    if let Some(re) = LIKE_CACHE.lock().unwrap().get(pattern) {
        return re.is_match(s);
    }
    let mut regex_src = String::from("(?is)^");
    for ch in pattern.chars() {
        match ch {
            '%' => regex_src.push_str(".*"),
            '_' => regex_src.push('.'),
            other => regex_src.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex_src.push('$');
    let Ok(re) = Regex::new(&regex_src) else {
        return false;
    };
    let matched = re.is_match(s);
    LIKE_CACHE
        .lock()
        .unwrap()
        .insert(pattern.to_string(), re);
    matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::udf::{Udf, UdfParam};

    fn ctx(pairs: &[(&str, Value)]) -> Context {
        let mut ctx = Context::new();
        for (k, v) in pairs {
            ctx.set(*k, v.clone());
        }
        ctx
    }

    fn eval(src: &str, ctx: &Context) -> Value {
        Evaluator::new().evaluate(src, ctx).unwrap()
    }

    #[test]
    fn test_arithmetic() {
        let c = Context::new();
        assert_eq!(eval("2 + 3", &c), Value::Int(5));
        assert_eq!(eval("10 - 4", &c), Value::Int(6));
        assert_eq!(eval("3 * 4", &c), Value::Int(12));
        assert_eq!(eval("15 / 3", &c), Value::Int(5));
        assert_eq!(eval("7 / 2", &c), Value::Float(3.5));
        assert_eq!(eval("17 % 5", &c), Value::Int(2));
    }

    #[test]
    fn test_division_by_zero_is_ieee() {
        let c = Context::new();
        assert_eq!(eval("1 / 0", &c), Value::Float(f64::INFINITY));
        assert_eq!(eval("-1 / 0", &c), Value::Float(f64::NEG_INFINITY));
        let nan = eval("0 / 0", &c);
        assert!(matches!(nan, Value::Float(f) if f.is_nan()));
    }

    #[test]
    fn test_string_concat_coerces() {
        let c = Context::new();
        assert_eq!(eval("'v' + 2", &c), Value::string("v2"));
        assert_eq!(eval("1 + '2'", &c), Value::string("12"));
        assert_eq!(eval("'a' + 'b'", &c), Value::string("ab"));
    }

    #[test]
    fn test_loose_and_strict_equality() {
        let c = Context::new();
        assert_eq!(eval("1 == '1'", &c), Value::Bool(true));
        assert_eq!(eval("1 === '1'", &c), Value::Bool(false));
        assert_eq!(eval("1 === 1.0", &c), Value::Bool(true));
        assert_eq!(eval("null == null", &c), Value::Bool(true));
        assert_eq!(eval("1 !== 2", &c), Value::Bool(true));
    }

    #[test]
    fn test_logic_returns_operand() {
        let c = ctx(&[("name", Value::Null)]);
        assert_eq!(eval("name || 'default'", &c), Value::string("default"));
        assert_eq!(eval("0 && 'x'", &c), Value::Int(0));
        assert_eq!(eval("'a' && 'b'", &c), Value::string("b"));
        assert_eq!(eval("0 ?? 5", &c), Value::Int(0));
        assert_eq!(eval("null ?? 5", &c), Value::Int(5));
    }

    #[test]
    fn test_in_and_like() {
        let c = Context::new();
        assert_eq!(eval("2 IN [1, 2, 3]", &c), Value::Bool(true));
        assert_eq!(eval("5 IN [1, 2, 3]", &c), Value::Bool(false));
        assert_eq!(eval("'Alice' LIKE 'a%'", &c), Value::Bool(true));
        assert_eq!(eval("'Bob' LIKE '_ob'", &c), Value::Bool(true));
        assert_eq!(eval("'Bob' LIKE 'b'", &c), Value::Bool(false));
    }

    #[test]
    fn test_ternary_and_case() {
        let c = ctx(&[("score", Value::Int(75))]);
        assert_eq!(
            eval("score >= 60 ? 'pass' : 'fail'", &c),
            Value::string("pass")
        );
        assert_eq!(
            eval(
                "CASE WHEN score >= 90 THEN 'A' WHEN score >= 70 THEN 'C' ELSE 'F' END",
                &c
            ),
            Value::string("C")
        );
        assert_eq!(eval("CASE WHEN false THEN 1 END", &c), Value::Null);
    }

    #[test]
    fn test_optional_chaining() {
        let c = ctx(&[("user", Value::Null)]);
        assert_eq!(eval("user?.name", &c), Value::Null);
        assert_eq!(eval("user?.load()", &c), Value::Null);
    }

    #[test]
    fn test_unknown_variable_is_null() {
        let c = Context::new();
        assert_eq!(eval("missing", &c), Value::Null);
        assert_eq!(eval("missing.deep.path", &c), Value::Null);
    }

    #[test]
    fn test_template_null_renders_empty() {
        let c = ctx(&[("name", Value::Null), ("n", Value::Int(3))]);
        assert_eq!(eval("`x${name}y${n}`", &c), Value::string("xy3"));
    }

    #[test]
    fn test_block_with_assignments() {
        let c = ctx(&[("user", Value::object([("name", Value::string("Ada"))]))]);
        let result = eval("$tmp = user.name\ngreeting = 'Hi ' + $tmp", &c);
        assert_eq!(result.get("greeting"), Some(&Value::string("Hi Ada")));
        assert!(result.get("$tmp").is_none());
    }

    #[test]
    fn test_block_spread_statement() {
        let c = ctx(&[(
            "customer",
            Value::object([("id", Value::string("C1")), ("name", Value::string("Ada"))]),
        )]);
        let result = eval("...customer\norders = 5", &c);
        assert_eq!(result.get("id"), Some(&Value::string("C1")));
        assert_eq!(result.get("orders"), Some(&Value::Int(5)));
    }

    #[test]
    fn test_evaluate_bindings() {
        let c = Context::new();
        let bindings = Evaluator::new()
            .evaluate_bindings("i = 0; sum = 0", &c)
            .unwrap();
        assert_eq!(bindings.get("i"), Some(&Value::Int(0)));
        assert_eq!(bindings.get("sum"), Some(&Value::Int(0)));
    }

    #[test]
    fn test_array_index_negative() {
        let c = ctx(&[("xs", Value::array([Value::Int(1), Value::Int(2), Value::Int(3)]))]);
        assert_eq!(eval("xs[0]", &c), Value::Int(1));
        assert_eq!(eval("xs[-1]", &c), Value::Int(3));
        assert_eq!(eval("xs[9]", &c), Value::Null);
    }

    #[test]
    fn test_length_property_and_method() {
        let c = ctx(&[("s", Value::string("hello"))]);
        assert_eq!(eval("s.length", &c), Value::Int(5));
        assert_eq!(eval("s.length()", &c), Value::Int(5));
    }

    #[test]
    fn test_lambda_stored_and_invoked() {
        let c = Context::new();
        let result = eval("$f = x => x * 3\n$obj = { calc: $f }\nout = $obj.calc(7)", &c);
        assert_eq!(result.get("out"), Some(&Value::Int(21)));
    }

    #[test]
    fn test_udf_expression() {
        let mut c = Context::new();
        c.register_udf(
            Udf::expression(
                "discount",
                vec![
                    UdfParam::required("price"),
                    UdfParam::optional("rate", Value::Float(0.1)),
                ],
                "price * (1 - rate)",
            )
            .unwrap(),
        );
        assert_eq!(eval("discount(100)", &c), Value::Float(90.0));
        assert_eq!(eval("discount(100, 0.5)", &c), Value::Float(50.0));
    }

    #[test]
    fn test_udf_shadowed_in_child() {
        let mut root = Context::new();
        root.register_udf(Udf::expression("f", vec![], "1").unwrap());
        let mut child = root.child();
        child.register_udf(Udf::expression("f", vec![], "2").unwrap());
        assert_eq!(eval("f()", &child), Value::Int(2));
        assert_eq!(eval("f()", &root), Value::Int(1));
    }

    #[test]
    fn test_undefined_function_errors() {
        let c = Context::new();
        assert!(matches!(
            Evaluator::new().evaluate("NOPE()", &c),
            Err(GmlError::UndefinedFunction(_))
        ));
    }

    #[test]
    fn test_unknown_method_is_null() {
        let c = ctx(&[("xs", Value::array([Value::Int(1)]))]);
        assert_eq!(eval("xs.frobnicate()", &c), Value::Null);
    }

    #[test]
    fn test_deterministic_evaluation() {
        let c = ctx(&[("xs", Value::array([Value::Int(3), Value::Int(1), Value::Int(2)]))]);
        let a = eval("xs.sort().map(x => x * 2).join('-')", &c);
        let b = eval("xs.sort().map(x => x * 2).join('-')", &c);
        assert_eq!(a, b);
        assert_eq!(a, Value::string("2-4-6"));
    }
}
