//! Array, string and object method tables.
//!
//! All methods are pure: mutating-flavoured operations (`add`, `remove`,
//! `sort`, ...) return new values. Lambda-taking methods receive the arrow
//! function as a `Value::Lambda` and call back into the evaluator.

use crate::error::{GmlError, GmlResult};
use crate::evaluator::{EvalScope, Evaluator, compare_values, loose_equals};
use crate::value::{LambdaValue, Object, Value};
use std::cmp::Ordering;

/// Accept a field list as either `'a,b,c'` or `['a', 'b', 'c']`.
fn field_list(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => s
            .split(',')
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn want_lambda<'v>(args: &'v [Value], method: &str) -> GmlResult<&'v LambdaValue> {
    args.first()
        .and_then(Value::as_lambda)
        .ok_or_else(|| GmlError::InvalidArgument(format!("{} requires a lambda", method)))
}

/// Extract a numeric value, optionally through a property name.
fn numeric_of(item: &Value, prop: Option<&str>) -> Option<f64> {
    match prop {
        Some(p) => item.get(p).and_then(Value::as_float),
        None => item.as_float(),
    }
}

fn prop_arg(args: &[Value]) -> Option<String> {
    args.first()
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Render a grouping key for `group`/`groupBy`.
fn key_string(value: &Value) -> String {
    value.display_string()
}

pub(crate) fn array_method(
    ev: &Evaluator,
    arr: &[Value],
    method: &str,
    args: &[Value],
    es: &EvalScope,
) -> GmlResult<Value> {
    match method {
        // Higher-order methods

        "map" => match args.first() {
            Some(Value::Lambda(lambda)) => {
                let mut out = Vec::with_capacity(arr.len());
                for (i, item) in arr.iter().enumerate() {
                    out.push(ev.invoke_lambda(
                        lambda,
                        &[item.clone(), Value::Int(i as i64)],
                        es,
                    )?);
                }
                Ok(Value::Array(out))
            }
            Some(Value::String(prop)) => Ok(Value::Array(
                arr.iter()
                    .map(|item| item.get(prop).cloned().unwrap_or(Value::Null))
                    .collect(),
            )),
            _ => Err(GmlError::InvalidArgument(
                "map requires a lambda or property name".to_string(),
            )),
        },

        "filter" => {
            let lambda = want_lambda(args, "filter")?;
            let mut out = Vec::new();
            for item in arr {
                if ev.invoke_lambda(lambda, &[item.clone()], es)?.is_truthy() {
                    out.push(item.clone());
                }
            }
            Ok(Value::Array(out))
        }

        "reduce" => {
            let lambda = want_lambda(args, "reduce")?;
            let mut acc = args.get(1).cloned().unwrap_or(Value::Null);
            for (i, item) in arr.iter().enumerate() {
                acc = ev.invoke_lambda(
                    lambda,
                    &[acc, item.clone(), Value::Int(i as i64)],
                    es,
                )?;
            }
            Ok(acc)
        }

        "find" => {
            let lambda = want_lambda(args, "find")?;
            for item in arr {
                if ev.invoke_lambda(lambda, &[item.clone()], es)?.is_truthy() {
                    return Ok(item.clone());
                }
            }
            Ok(Value::Null)
        }

        "findIndex" => {
            let lambda = want_lambda(args, "findIndex")?;
            for (i, item) in arr.iter().enumerate() {
                if ev.invoke_lambda(lambda, &[item.clone()], es)?.is_truthy() {
                    return Ok(Value::Int(i as i64));
                }
            }
            Ok(Value::Int(-1))
        }

        "some" => {
            let lambda = want_lambda(args, "some")?;
            for item in arr {
                if ev.invoke_lambda(lambda, &[item.clone()], es)?.is_truthy() {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }

        "every" => {
            let lambda = want_lambda(args, "every")?;
            for item in arr {
                if !ev.invoke_lambda(lambda, &[item.clone()], es)?.is_truthy() {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }

        "sort" => {
            let mut out = arr.to_vec();
            match args.first() {
                // One-parameter lambda extracts a sort key; two parameters
                // act as a comparator returning a signed number.
                Some(Value::Lambda(lambda)) if lambda.params.len() >= 2 => {
                    let mut err = None;
                    out.sort_by(|a, b| {
                        if err.is_some() {
                            return Ordering::Equal;
                        }
                        match ev.invoke_lambda(lambda, &[a.clone(), b.clone()], es) {
                            Ok(v) => {
                                let n = v.as_float().unwrap_or(0.0);
                                n.partial_cmp(&0.0).unwrap_or(Ordering::Equal)
                            }
                            Err(e) => {
                                err = Some(e);
                                Ordering::Equal
                            }
                        }
                    });
                    if let Some(e) = err {
                        return Err(e);
                    }
                    Ok(Value::Array(out))
                }
                Some(Value::Lambda(lambda)) => {
                    let mut keyed = Vec::with_capacity(out.len());
                    for item in out {
                        let key = ev.invoke_lambda(lambda, &[item.clone()], es)?;
                        keyed.push((item, key));
                    }
                    keyed.sort_by(|a, b| compare_values(&a.1, &b.1));
                    Ok(Value::Array(keyed.into_iter().map(|(item, _)| item).collect()))
                }
                Some(Value::String(prop)) => {
                    out.sort_by(|a, b| {
                        compare_values(
                            a.get(prop).unwrap_or(&Value::Null),
                            b.get(prop).unwrap_or(&Value::Null),
                        )
                    });
                    Ok(Value::Array(out))
                }
                _ => {
                    out.sort_by(compare_values);
                    Ok(Value::Array(out))
                }
            }
        }

        "reverse" => Ok(Value::Array(arr.iter().rev().cloned().collect())),

        // Indexing and slicing

        "includes" => {
            let needle = args.first().ok_or_else(|| {
                GmlError::InvalidArgument("includes requires an argument".to_string())
            })?;
            Ok(Value::Bool(arr.iter().any(|item| loose_equals(item, needle))))
        }

        "indexOf" => {
            let needle = args.first().ok_or_else(|| {
                GmlError::InvalidArgument("indexOf requires an argument".to_string())
            })?;
            Ok(Value::Int(
                arr.iter()
                    .position(|item| loose_equals(item, needle))
                    .map(|i| i as i64)
                    .unwrap_or(-1),
            ))
        }

        "slice" => {
            let (start, end) = slice_bounds(arr.len(), args);
            Ok(Value::Array(arr[start..end].to_vec()))
        }

        "concat" | "addAll" => {
            let mut out = arr.to_vec();
            for arg in args {
                match arg {
                    Value::Array(other) => out.extend(other.clone()),
                    other => out.push(other.clone()),
                }
            }
            Ok(Value::Array(out))
        }

        "join" => {
            let sep = prop_arg(args).unwrap_or_else(|| ",".to_string());
            Ok(Value::String(
                arr.iter()
                    .map(Value::display_string)
                    .collect::<Vec<_>>()
                    .join(&sep),
            ))
        }

        "first" => Ok(arr.first().cloned().unwrap_or(Value::Null)),
        "last" => Ok(arr.last().cloned().unwrap_or(Value::Null)),

        "take" => {
            let n = args.first().and_then(Value::as_int).unwrap_or(0).max(0) as usize;
            Ok(Value::Array(arr.iter().take(n).cloned().collect()))
        }

        "skip" => {
            let n = args.first().and_then(Value::as_int).unwrap_or(0).max(0) as usize;
            Ok(Value::Array(arr.iter().skip(n).cloned().collect()))
        }

        "at" => {
            let idx = args.first().and_then(Value::as_int).unwrap_or(0);
            let idx = if idx < 0 { arr.len() as i64 + idx } else { idx };
            if idx < 0 {
                return Ok(Value::Null);
            }
            Ok(arr.get(idx as usize).cloned().unwrap_or(Value::Null))
        }

        "chunk" => {
            let size = args
                .first()
                .and_then(Value::as_int)
                .unwrap_or(1)
                .max(1) as usize;
            Ok(Value::Array(
                arr.chunks(size)
                    .map(|chunk| Value::Array(chunk.to_vec()))
                    .collect(),
            ))
        }

        // Pure "mutators"

        "add" | "push" => {
            let mut out = arr.to_vec();
            out.extend(args.iter().cloned());
            Ok(Value::Array(out))
        }

        "remove" => {
            let needle = args.first().ok_or_else(|| {
                GmlError::InvalidArgument("remove requires an argument".to_string())
            })?;
            Ok(Value::Array(
                arr.iter()
                    .filter(|item| !loose_equals(item, needle))
                    .cloned()
                    .collect(),
            ))
        }

        "removeAt" => {
            let idx = args.first().and_then(Value::as_int).unwrap_or(-1);
            let mut out = arr.to_vec();
            if idx >= 0 && (idx as usize) < out.len() {
                out.remove(idx as usize);
            }
            Ok(Value::Array(out))
        }

        "distinct" => {
            let mut out: Vec<Value> = Vec::new();
            for item in arr {
                if !out.iter().any(|seen| loose_equals(seen, item)) {
                    out.push(item.clone());
                }
            }
            Ok(Value::Array(out))
        }

        "flatten" | "flat" => {
            let depth = args.first().and_then(Value::as_int).unwrap_or(1).max(0) as usize;
            Ok(Value::Array(flatten(arr, depth)))
        }

        // Aggregates

        "sum" => {
            let prop = prop_arg(args);
            Ok(Value::Float(
                arr.iter()
                    .filter_map(|item| numeric_of(item, prop.as_deref()))
                    .sum(),
            ))
        }

        "avg" => {
            let prop = prop_arg(args);
            let values: Vec<f64> = arr
                .iter()
                .filter_map(|item| numeric_of(item, prop.as_deref()))
                .collect();
            if values.is_empty() {
                return Ok(Value::Null);
            }
            Ok(Value::Float(values.iter().sum::<f64>() / values.len() as f64))
        }

        "min" | "max" => {
            let prop = prop_arg(args);
            let mut values = arr
                .iter()
                .filter_map(|item| numeric_of(item, prop.as_deref()));
            let first = values.next();
            let Some(first) = first else {
                return Ok(Value::Null);
            };
            let result = values.fold(first, |acc, v| {
                if (method == "min") == (v < acc) { v } else { acc }
            });
            Ok(Value::Float(result))
        }

        "count" | "length" => Ok(Value::Int(arr.len() as i64)),

        // Grouping and projection

        "group" => {
            let groups = build_groups(ev, arr, args, es)?;
            Ok(Value::Array(
                groups
                    .into_iter()
                    .map(|(key, items)| {
                        Value::object([
                            ("key", Value::String(key)),
                            ("val", Value::Array(items)),
                        ])
                    })
                    .collect(),
            ))
        }

        "groupBy" => {
            let groups = build_groups(ev, arr, args, es)?;
            Ok(Value::Object(
                groups
                    .into_iter()
                    .map(|(key, items)| (key, Value::Array(items)))
                    .collect(),
            ))
        }

        "proj" | "pick" => {
            // Property selection with a field list, or a per-item lambda
            // projection.
            if let Some(Value::Lambda(lambda)) = args.first() {
                let mut out = Vec::with_capacity(arr.len());
                for item in arr {
                    out.push(ev.invoke_lambda(lambda, &[item.clone()], es)?);
                }
                return Ok(Value::Array(out));
            }
            let fields = field_list(args.first().unwrap_or(&Value::Null));
            Ok(Value::Array(
                arr.iter()
                    .map(|item| match item.as_object() {
                        Some(obj) => Value::Object(
                            fields
                                .iter()
                                .filter_map(|f| {
                                    obj.get(f).map(|v| (f.clone(), v.clone()))
                                })
                                .collect(),
                        ),
                        None => Value::Null,
                    })
                    .collect(),
            ))
        }

        "omit" => {
            let fields = field_list(args.first().unwrap_or(&Value::Null));
            Ok(Value::Array(
                arr.iter()
                    .map(|item| match item.as_object() {
                        Some(obj) => Value::Object(
                            obj.iter()
                                .filter(|(k, _)| !fields.contains(k))
                                .map(|(k, v)| (k.clone(), v.clone()))
                                .collect(),
                        ),
                        None => item.clone(),
                    })
                    .collect(),
            ))
        }

        _ => Ok(Value::Null),
    }
}

fn slice_bounds(len: usize, args: &[Value]) -> (usize, usize) {
    let clamp = |i: i64| -> usize {
        let i = if i < 0 { len as i64 + i } else { i };
        i.clamp(0, len as i64) as usize
    };
    let start = clamp(args.first().and_then(Value::as_int).unwrap_or(0));
    let end = clamp(args.get(1).and_then(Value::as_int).unwrap_or(len as i64));
    (start, end.max(start))
}

fn flatten(arr: &[Value], depth: usize) -> Vec<Value> {
    if depth == 0 {
        return arr.to_vec();
    }
    let mut out = Vec::new();
    for item in arr {
        match item {
            Value::Array(inner) => out.extend(flatten(inner, depth - 1)),
            other => out.push(other.clone()),
        }
    }
    out
}

/// Shared by `group`/`groupBy`: ordered buckets keyed by first occurrence.
fn build_groups(
    ev: &Evaluator,
    arr: &[Value],
    args: &[Value],
    es: &EvalScope,
) -> GmlResult<Vec<(String, Vec<Value>)>> {
    let mut groups: Vec<(String, Vec<Value>)> = Vec::new();
    for item in arr {
        let key = match args.first() {
            Some(Value::Lambda(lambda)) => {
                key_string(&ev.invoke_lambda(lambda, &[item.clone()], es)?)
            }
            Some(Value::String(prop)) => {
                key_string(item.get(prop).unwrap_or(&Value::Null))
            }
            _ => {
                return Err(GmlError::InvalidArgument(
                    "group requires a key property or lambda".to_string(),
                ));
            }
        };
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, items)) => items.push(item.clone()),
            None => groups.push((key, vec![item.clone()])),
        }
    }
    Ok(groups)
}

pub(crate) fn string_method(s: &str, method: &str, args: &[Value]) -> GmlResult<Value> {
    let str_arg = |i: usize| args.get(i).and_then(Value::as_str).unwrap_or("");
    let int_arg = |i: usize| args.get(i).and_then(Value::as_int);

    match method {
        "length" => Ok(Value::Int(s.chars().count() as i64)),
        "trim" => Ok(Value::string(s.trim())),
        "trimStart" => Ok(Value::string(s.trim_start())),
        "trimEnd" => Ok(Value::string(s.trim_end())),
        "toUpperCase" | "upper" => Ok(Value::string(s.to_uppercase())),
        "toLowerCase" | "lower" => Ok(Value::string(s.to_lowercase())),
        "startsWith" => Ok(Value::Bool(s.starts_with(str_arg(0)))),
        "endsWith" => Ok(Value::Bool(s.ends_with(str_arg(0)))),
        "includes" | "contains" => Ok(Value::Bool(s.contains(str_arg(0)))),
        "indexOf" => Ok(Value::Int(char_index(s, str_arg(0)).unwrap_or(-1))),
        "lastIndexOf" => {
            let needle = str_arg(0);
            if needle.is_empty() {
                return Ok(Value::Int(s.chars().count() as i64));
            }
            let mut found = -1i64;
            let mut from = 0;
            while let Some(byte_idx) = s[from..].find(needle) {
                let abs = from + byte_idx;
                found = s[..abs].chars().count() as i64;
                from = abs + needle.len().max(1);
                if from > s.len() {
                    break;
                }
            }
            Ok(Value::Int(found))
        }
        "substring" => {
            let chars: Vec<char> = s.chars().collect();
            let start = int_arg(0).unwrap_or(0).clamp(0, chars.len() as i64) as usize;
            let end = int_arg(1)
                .unwrap_or(chars.len() as i64)
                .clamp(0, chars.len() as i64) as usize;
            let (lo, hi) = if start <= end { (start, end) } else { (end, start) };
            Ok(Value::string(chars[lo..hi].iter().collect::<String>()))
        }
        "slice" => {
            let chars: Vec<char> = s.chars().collect();
            let (start, end) = slice_bounds(chars.len(), args);
            Ok(Value::string(chars[start..end].iter().collect::<String>()))
        }
        "split" => {
            let sep = str_arg(0);
            let parts: Vec<Value> = if sep.is_empty() {
                s.chars().map(|c| Value::string(c.to_string())).collect()
            } else {
                s.split(sep).map(Value::string).collect()
            };
            Ok(Value::Array(parts))
        }
        "replace" => Ok(Value::string(s.replacen(str_arg(0), str_arg(1), 1))),
        "replaceAll" => Ok(Value::string(s.replace(str_arg(0), str_arg(1)))),
        "padStart" | "padEnd" => {
            let target = int_arg(0).unwrap_or(0).max(0) as usize;
            let pad = args
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or(" ")
                .chars()
                .next()
                .unwrap_or(' ');
            let len = s.chars().count();
            if len >= target {
                return Ok(Value::string(s));
            }
            let filler: String = std::iter::repeat_n(pad, target - len).collect();
            if method == "padStart" {
                Ok(Value::string(format!("{}{}", filler, s)))
            } else {
                Ok(Value::string(format!("{}{}", s, filler)))
            }
        }
        "charAt" => {
            let idx = int_arg(0).unwrap_or(0);
            if idx < 0 {
                return Ok(Value::string(""));
            }
            Ok(Value::string(
                s.chars()
                    .nth(idx as usize)
                    .map(|c| c.to_string())
                    .unwrap_or_default(),
            ))
        }
        "charCodeAt" => {
            let idx = int_arg(0).unwrap_or(0);
            if idx < 0 {
                return Ok(Value::Null);
            }
            Ok(s.chars()
                .nth(idx as usize)
                .map(|c| Value::Int(c as i64))
                .unwrap_or(Value::Null))
        }
        _ => Ok(Value::Null),
    }
}

fn char_index(s: &str, needle: &str) -> Option<i64> {
    if needle.is_empty() {
        return Some(0);
    }
    s.find(needle).map(|byte_idx| s[..byte_idx].chars().count() as i64)
}

/// Object method table. Returns `Ok(None)` for unknown names so the
/// dispatcher can fall through to callable properties.
pub(crate) fn object_method(
    obj: &Object,
    method: &str,
    args: &[Value],
) -> GmlResult<Option<Value>> {
    let result = match method {
        "keys" => Value::Array(obj.keys().map(Value::string).collect()),
        "values" => Value::Array(obj.values().cloned().collect()),
        "entries" => Value::Array(
            obj.iter()
                .map(|(k, v)| {
                    Value::object([("key", Value::string(k.clone())), ("value", v.clone())])
                })
                .collect(),
        ),
        "pick" | "proj" => {
            let fields = field_list(args.first().unwrap_or(&Value::Null));
            Value::Object(
                fields
                    .iter()
                    .filter_map(|f| obj.get(f).map(|v| (f.clone(), v.clone())))
                    .collect(),
            )
        }
        "omit" => {
            let fields = field_list(args.first().unwrap_or(&Value::Null));
            Value::Object(
                obj.iter()
                    .filter(|(k, _)| !fields.contains(k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            )
        }
        "merge" => {
            let mut out = obj.clone();
            for arg in args {
                if let Value::Object(src) = arg {
                    out.extend(src.clone());
                }
            }
            Value::Object(out)
        }
        _ => return Ok(None),
    };
    Ok(Some(result))
}

#[cfg(test)]
mod tests {
    use crate::context::Context;
    use crate::evaluator::Evaluator;
    use crate::value::Value;

    fn ctx_with_items() -> Context {
        let mut ctx = Context::new();
        ctx.set(
            "items",
            Value::array([
                Value::object([("name", Value::string("a")), ("price", Value::Int(10))]),
                Value::object([("name", Value::string("b")), ("price", Value::Int(30))]),
                Value::object([("name", Value::string("a")), ("price", Value::Int(20))]),
            ]),
        );
        ctx.set(
            "nums",
            Value::array([Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)]),
        );
        ctx
    }

    fn eval(src: &str) -> Value {
        Evaluator::new().evaluate(src, &ctx_with_items()).unwrap()
    }

    #[test]
    fn test_map_filter_reduce() {
        assert_eq!(
            eval("nums.map(x => x * 2)"),
            Value::array([Value::Int(2), Value::Int(4), Value::Int(6), Value::Int(8)])
        );
        assert_eq!(
            eval("nums.filter(x => x % 2 == 0)"),
            Value::array([Value::Int(2), Value::Int(4)])
        );
        assert_eq!(eval("nums.reduce((acc, x) => acc + x, 0)"), Value::Int(10));
    }

    #[test]
    fn test_map_property_name() {
        assert_eq!(
            eval("items.map('price')"),
            Value::array([Value::Int(10), Value::Int(30), Value::Int(20)])
        );
    }

    #[test]
    fn test_find_some_every() {
        assert_eq!(eval("nums.find(x => x > 2)"), Value::Int(3));
        assert_eq!(eval("nums.findIndex(x => x > 2)"), Value::Int(2));
        assert_eq!(eval("nums.some(x => x > 3)"), Value::Bool(true));
        assert_eq!(eval("nums.every(x => x > 0)"), Value::Bool(true));
        assert_eq!(eval("nums.every(x => x > 1)"), Value::Bool(false));
    }

    #[test]
    fn test_sort_variants() {
        assert_eq!(
            eval("[3, 1, 2].sort()"),
            Value::array([Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        assert_eq!(
            eval("items.sort(i => i.price).map('price')"),
            Value::array([Value::Int(10), Value::Int(20), Value::Int(30)])
        );
        assert_eq!(
            eval("[1, 3, 2].sort((a, b) => b - a)"),
            Value::array([Value::Int(3), Value::Int(2), Value::Int(1)])
        );
    }

    #[test]
    fn test_slicing_family() {
        assert_eq!(
            eval("nums.slice(1, 3)"),
            Value::array([Value::Int(2), Value::Int(3)])
        );
        assert_eq!(
            eval("nums.take(2)"),
            Value::array([Value::Int(1), Value::Int(2)])
        );
        assert_eq!(
            eval("nums.skip(3)"),
            Value::array([Value::Int(4)])
        );
        assert_eq!(eval("nums.first()"), Value::Int(1));
        assert_eq!(eval("nums.last()"), Value::Int(4));
        assert_eq!(eval("nums.at(-1)"), Value::Int(4));
    }

    #[test]
    fn test_add_remove_distinct() {
        assert_eq!(
            eval("[1, 2].add(3)"),
            Value::array([Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        assert_eq!(
            eval("[1, 2].addAll([3, 4])"),
            Value::array([Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)])
        );
        assert_eq!(
            eval("[1, 2, 1].remove(1)"),
            Value::array([Value::Int(2)])
        );
        assert_eq!(
            eval("[1, 2, 3].removeAt(1)"),
            Value::array([Value::Int(1), Value::Int(3)])
        );
        assert_eq!(
            eval("[1, 2, 2, 3, 1].distinct()"),
            Value::array([Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        assert_eq!(
            eval("[[1, 2], [3]].flatten()"),
            Value::array([Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn test_aggregates() {
        assert_eq!(eval("nums.sum()"), Value::Float(10.0));
        assert_eq!(eval("nums.avg()"), Value::Float(2.5));
        assert_eq!(eval("nums.min()"), Value::Float(1.0));
        assert_eq!(eval("nums.max()"), Value::Float(4.0));
        assert_eq!(eval("nums.count()"), Value::Int(4));
        assert_eq!(eval("items.sum('price')"), Value::Float(60.0));
        assert_eq!(eval("[].avg()"), Value::Null);
    }

    #[test]
    fn test_group_preserves_order() {
        let grouped = eval("items.group('name')");
        let Value::Array(groups) = grouped else {
            panic!("expected array")
        };
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].get("key"), Some(&Value::string("a")));
        assert_eq!(
            groups[0].get("val").and_then(|v| v.as_array()).map(Vec::len),
            Some(2)
        );
        assert_eq!(groups[1].get("key"), Some(&Value::string("b")));
    }

    #[test]
    fn test_group_by_object() {
        let grouped = eval("items.groupBy('name')");
        assert_eq!(
            grouped.get("b").and_then(|v| v.as_array()).map(Vec::len),
            Some(1)
        );
    }

    #[test]
    fn test_projection() {
        let projected = eval("items.pick('name')");
        assert_eq!(
            projected.get_index(0).and_then(|v| v.get("price")),
            None
        );
        let omitted = eval("items.omit('price')");
        assert_eq!(omitted.get_index(0).and_then(|v| v.get("price")), None);
        assert!(omitted.get_index(0).and_then(|v| v.get("name")).is_some());
    }

    #[test]
    fn test_string_methods() {
        let mut ctx = Context::new();
        ctx.set("s", Value::string("  Hello World  "));
        let ev = Evaluator::new();
        let eval = |src: &str| ev.evaluate(src, &ctx).unwrap();

        assert_eq!(eval("s.trim()"), Value::string("Hello World"));
        assert_eq!(eval("s.trim().toUpperCase()"), Value::string("HELLO WORLD"));
        assert_eq!(eval("s.trim().split(' ').length()"), Value::Int(2));
        assert_eq!(eval("'ab'.padStart(4, '0')"), Value::string("00ab"));
        assert_eq!(eval("'ab'.padEnd(4)"), Value::string("ab  "));
        assert_eq!(eval("'hello'.replace('l', 'L')"), Value::string("heLlo"));
        assert_eq!(eval("'hello'.replaceAll('l', 'L')"), Value::string("heLLo"));
        assert_eq!(eval("'hello'.indexOf('ll')"), Value::Int(2));
        assert_eq!(eval("'hello'.lastIndexOf('l')"), Value::Int(3));
        assert_eq!(eval("'hello'.charAt(1)"), Value::string("e"));
        assert_eq!(eval("'A'.charCodeAt(0)"), Value::Int(65));
        assert_eq!(eval("'hello'.substring(1, 3)"), Value::string("el"));
        assert_eq!(eval("'hello'.slice(-2)"), Value::string("lo"));
    }

    #[test]
    fn test_object_methods() {
        let mut ctx = Context::new();
        ctx.set(
            "user",
            Value::object([
                ("id", Value::Int(1)),
                ("name", Value::string("Ada")),
                ("role", Value::string("admin")),
            ]),
        );
        let ev = Evaluator::new();
        let eval = |src: &str| ev.evaluate(src, &ctx).unwrap();

        assert_eq!(
            eval("user.keys()"),
            Value::array([
                Value::string("id"),
                Value::string("name"),
                Value::string("role")
            ])
        );
        assert_eq!(eval("user.values().length()"), Value::Int(3));
        assert_eq!(
            eval("user.entries()[0].key"),
            Value::string("id")
        );
        assert_eq!(eval("user.pick('id,name').keys().length()"), Value::Int(2));
        assert_eq!(eval("user.omit('role').keys().length()"), Value::Int(2));
        assert_eq!(
            eval("user.merge({ role: 'viewer' }).role"),
            Value::string("viewer")
        );
    }
}
