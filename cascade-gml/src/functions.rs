//! Built-in functions, registered globally and case-sensitive.
//!
//! The registry is a table of plain function pointers; identifier
//! resolution checks it before the UDF chain.

use crate::error::{GmlError, GmlResult};
use crate::value::Value;
use chrono::{DateTime, Duration, Local, NaiveDate, Utc};
use std::collections::HashMap;

type FunctionImpl = fn(&[Value]) -> GmlResult<Value>;

pub struct Functions {
    registry: HashMap<&'static str, FunctionImpl>,
}

impl Default for Functions {
    fn default() -> Self {
        Self::new()
    }
}

impl Functions {
    pub fn new() -> Self {
        let mut registry: HashMap<&'static str, FunctionImpl> = HashMap::new();

        // Math
        registry.insert("SUM", fn_sum);
        registry.insert("AVG", fn_avg);
        registry.insert("MIN", fn_min);
        registry.insert("MAX", fn_max);
        registry.insert("ROUND", fn_round);
        registry.insert("FLOOR", fn_floor);
        registry.insert("CEIL", fn_ceil);
        registry.insert("ABS", fn_abs);

        // Strings
        registry.insert("CONCAT", fn_concat);
        registry.insert("UPPER", fn_upper);
        registry.insert("LOWER", fn_lower);
        registry.insert("TRIM", fn_trim);
        registry.insert("LEN", fn_len);
        registry.insert("SUBSTRING", fn_substring);
        registry.insert("REPLACE", fn_replace);
        registry.insert("SPLIT", fn_split);

        // Dates
        registry.insert("DATE", fn_date);
        registry.insert("TIME", fn_date);
        registry.insert("NOW", fn_now);
        registry.insert("FORMAT_DATE", fn_format_date);

        // Arrays
        registry.insert("COUNT", fn_count);
        registry.insert("FIRST", fn_first);
        registry.insert("LAST", fn_last);

        // Conversions
        registry.insert("INT", fn_int);
        registry.insert("FLOAT", fn_float);
        registry.insert("STRING", fn_string);
        registry.insert("BOOL", fn_bool);

        // Utilities
        registry.insert("IF", fn_if);
        registry.insert("COALESCE", fn_coalesce);

        Self { registry }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registry.contains_key(name)
    }

    pub fn call(&self, name: &str, args: &[Value]) -> GmlResult<Value> {
        self.registry
            .get(name)
            .ok_or_else(|| GmlError::UndefinedFunction(name.to_string()))
            .and_then(|f| f(args))
    }
}

fn numeric_of(item: &Value, prop: Option<&str>) -> Option<f64> {
    match prop {
        Some(p) => item.get(p).and_then(Value::as_float),
        None => item.as_float(),
    }
}

// Math

fn fn_sum(args: &[Value]) -> GmlResult<Value> {
    // SUM(array, 'prop'?) or SUM(a, b, c, ...)
    if let Some(Value::Array(arr)) = args.first() {
        let prop = args.get(1).and_then(Value::as_str);
        let sum: f64 = arr.iter().filter_map(|v| numeric_of(v, prop)).sum();
        Ok(Value::Float(sum))
    } else {
        let sum: f64 = args.iter().filter_map(Value::as_float).sum();
        Ok(Value::Float(sum))
    }
}

fn fn_avg(args: &[Value]) -> GmlResult<Value> {
    let Some(Value::Array(arr)) = args.first() else {
        return Err(GmlError::InvalidArgument("AVG requires an array".to_string()));
    };
    let prop = args.get(1).and_then(Value::as_str);
    let values: Vec<f64> = arr.iter().filter_map(|v| numeric_of(v, prop)).collect();
    if values.is_empty() {
        return Ok(Value::Null);
    }
    Ok(Value::Float(values.iter().sum::<f64>() / values.len() as f64))
}

fn fn_min(args: &[Value]) -> GmlResult<Value> {
    min_max(args, true)
}

fn fn_max(args: &[Value]) -> GmlResult<Value> {
    min_max(args, false)
}

fn min_max(args: &[Value], take_min: bool) -> GmlResult<Value> {
    let values: Vec<f64> = if let Some(Value::Array(arr)) = args.first() {
        let prop = args.get(1).and_then(Value::as_str);
        arr.iter().filter_map(|v| numeric_of(v, prop)).collect()
    } else {
        args.iter().filter_map(Value::as_float).collect()
    };
    let result = values
        .into_iter()
        .reduce(|a, b| if (b < a) == take_min { b } else { a });
    Ok(result.map(Value::Float).unwrap_or(Value::Null))
}

fn fn_round(args: &[Value]) -> GmlResult<Value> {
    let n = args
        .first()
        .and_then(Value::as_float)
        .ok_or_else(|| GmlError::InvalidArgument("ROUND requires a number".to_string()))?;
    let decimals = args.get(1).and_then(Value::as_int).unwrap_or(0);
    let factor = 10_f64.powi(decimals as i32);
    Ok(Value::Float((n * factor).round() / factor))
}

fn fn_floor(args: &[Value]) -> GmlResult<Value> {
    let n = args
        .first()
        .and_then(Value::as_float)
        .ok_or_else(|| GmlError::InvalidArgument("FLOOR requires a number".to_string()))?;
    Ok(Value::Float(n.floor()))
}

fn fn_ceil(args: &[Value]) -> GmlResult<Value> {
    let n = args
        .first()
        .and_then(Value::as_float)
        .ok_or_else(|| GmlError::InvalidArgument("CEIL requires a number".to_string()))?;
    Ok(Value::Float(n.ceil()))
}

fn fn_abs(args: &[Value]) -> GmlResult<Value> {
    match args.first() {
        Some(Value::Int(i)) => Ok(Value::Int(i.abs())),
        Some(Value::Float(f)) => Ok(Value::Float(f.abs())),
        Some(other) => Err(GmlError::TypeMismatch {
            expected: "number".to_string(),
            actual: other.type_name().to_string(),
        }),
        None => Err(GmlError::InvalidArgument("ABS requires a number".to_string())),
    }
}

// Strings

fn fn_concat(args: &[Value]) -> GmlResult<Value> {
    Ok(Value::String(
        args.iter()
            .map(|v| match v {
                Value::Null => String::new(),
                other => other.display_string(),
            })
            .collect(),
    ))
}

fn fn_upper(args: &[Value]) -> GmlResult<Value> {
    str_arg(args, "UPPER").map(|s| Value::string(s.to_uppercase()))
}

fn fn_lower(args: &[Value]) -> GmlResult<Value> {
    str_arg(args, "LOWER").map(|s| Value::string(s.to_lowercase()))
}

fn fn_trim(args: &[Value]) -> GmlResult<Value> {
    str_arg(args, "TRIM").map(|s| Value::string(s.trim()))
}

fn fn_len(args: &[Value]) -> GmlResult<Value> {
    match args.first() {
        Some(Value::String(s)) => Ok(Value::Int(s.chars().count() as i64)),
        Some(Value::Array(arr)) => Ok(Value::Int(arr.len() as i64)),
        Some(Value::Object(obj)) => Ok(Value::Int(obj.len() as i64)),
        Some(Value::Null) | None => Ok(Value::Int(0)),
        Some(other) => Err(GmlError::TypeMismatch {
            expected: "string, array or object".to_string(),
            actual: other.type_name().to_string(),
        }),
    }
}

fn fn_substring(args: &[Value]) -> GmlResult<Value> {
    let s = str_arg(args, "SUBSTRING")?;
    let chars: Vec<char> = s.chars().collect();
    let start = args
        .get(1)
        .and_then(Value::as_int)
        .unwrap_or(0)
        .clamp(0, chars.len() as i64) as usize;
    let end = args
        .get(2)
        .and_then(Value::as_int)
        .map(|len| start as i64 + len)
        .unwrap_or(chars.len() as i64)
        .clamp(start as i64, chars.len() as i64) as usize;
    Ok(Value::string(chars[start..end].iter().collect::<String>()))
}

fn fn_replace(args: &[Value]) -> GmlResult<Value> {
    let s = str_arg(args, "REPLACE")?;
    let from = args
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| GmlError::InvalidArgument("REPLACE requires a pattern".to_string()))?;
    let to = args.get(2).and_then(Value::as_str).unwrap_or("");
    Ok(Value::string(s.replace(from, to)))
}

fn fn_split(args: &[Value]) -> GmlResult<Value> {
    let s = str_arg(args, "SPLIT")?;
    let sep = args.get(1).and_then(Value::as_str).unwrap_or(",");
    Ok(Value::Array(s.split(sep).map(Value::string).collect()))
}

fn str_arg<'a>(args: &'a [Value], name: &str) -> GmlResult<&'a str> {
    args.first()
        .and_then(Value::as_str)
        .ok_or_else(|| GmlError::InvalidArgument(format!("{} requires a string", name)))
}

// Dates

fn fn_date(args: &[Value]) -> GmlResult<Value> {
    let now = Local::now();
    let result = match args.first().and_then(Value::as_str) {
        Some(offset) => apply_date_offset(now, offset)?,
        None => now,
    };
    Ok(Value::String(result.to_rfc3339()))
}

fn fn_now(_args: &[Value]) -> GmlResult<Value> {
    Ok(Value::String(Utc::now().to_rfc3339()))
}

fn fn_format_date(args: &[Value]) -> GmlResult<Value> {
    let date = str_arg(args, "FORMAT_DATE")?;
    let format = args.get(1).and_then(Value::as_str).unwrap_or("%Y-%m-%d");

    if let Ok(dt) = DateTime::parse_from_rfc3339(date) {
        return Ok(Value::string(dt.format(format).to_string()));
    }
    if let Ok(d) = NaiveDate::parse_from_str(date, "%Y-%m-%d") {
        return Ok(Value::string(d.format(format).to_string()));
    }
    Err(GmlError::InvalidArgument(format!(
        "invalid date: {}",
        date
    )))
}

/// Apply an offset of the form `±N<unit>` with unit in `s m h d w M y`.
/// A bare number means days. Months and years are calendar-approximate
/// (30/365 days); the clock library has no calendar-month arithmetic.
fn apply_date_offset(dt: DateTime<Local>, offset: &str) -> GmlResult<DateTime<Local>> {
    let offset = offset.trim();
    if offset.is_empty() || offset == "0" {
        return Ok(dt);
    }

    let (num_src, unit) = if offset.ends_with(|c: char| c.is_alphabetic()) {
        offset.split_at(offset.len() - 1)
    } else {
        (offset, "d")
    };
    let n: i64 = num_src
        .parse()
        .map_err(|_| GmlError::InvalidArgument(format!("invalid date offset: {}", offset)))?;

    let duration = match unit {
        "s" => Duration::seconds(n),
        "m" => Duration::minutes(n),
        "h" => Duration::hours(n),
        "d" => Duration::days(n),
        "w" => Duration::weeks(n),
        "M" => Duration::days(n * 30),
        "y" => Duration::days(n * 365),
        other => {
            return Err(GmlError::InvalidArgument(format!(
                "invalid date offset unit: {}",
                other
            )));
        }
    };
    Ok(dt + duration)
}

// Arrays

fn fn_count(args: &[Value]) -> GmlResult<Value> {
    match args.first() {
        Some(Value::Array(arr)) => Ok(Value::Int(arr.len() as i64)),
        Some(Value::Null) | None => Ok(Value::Int(0)),
        Some(_) => Ok(Value::Int(1)),
    }
}

fn fn_first(args: &[Value]) -> GmlResult<Value> {
    match args.first() {
        Some(Value::Array(arr)) => Ok(arr.first().cloned().unwrap_or(Value::Null)),
        Some(other) => Ok(other.clone()),
        None => Ok(Value::Null),
    }
}

fn fn_last(args: &[Value]) -> GmlResult<Value> {
    match args.first() {
        Some(Value::Array(arr)) => Ok(arr.last().cloned().unwrap_or(Value::Null)),
        Some(other) => Ok(other.clone()),
        None => Ok(Value::Null),
    }
}

// Conversions

fn fn_int(args: &[Value]) -> GmlResult<Value> {
    match args.first() {
        Some(Value::Int(i)) => Ok(Value::Int(*i)),
        Some(Value::Float(f)) => Ok(Value::Int(*f as i64)),
        Some(Value::Bool(b)) => Ok(Value::Int(*b as i64)),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| GmlError::InvalidArgument(format!("cannot convert '{}' to int", s))),
        Some(other) => Err(GmlError::TypeMismatch {
            expected: "convertible to int".to_string(),
            actual: other.type_name().to_string(),
        }),
        None => Err(GmlError::InvalidArgument("INT requires an argument".to_string())),
    }
}

fn fn_float(args: &[Value]) -> GmlResult<Value> {
    match args.first() {
        Some(Value::Int(i)) => Ok(Value::Float(*i as f64)),
        Some(Value::Float(f)) => Ok(Value::Float(*f)),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| GmlError::InvalidArgument(format!("cannot convert '{}' to float", s))),
        Some(other) => Err(GmlError::TypeMismatch {
            expected: "convertible to float".to_string(),
            actual: other.type_name().to_string(),
        }),
        None => Err(GmlError::InvalidArgument(
            "FLOAT requires an argument".to_string(),
        )),
    }
}

fn fn_string(args: &[Value]) -> GmlResult<Value> {
    Ok(Value::string(
        args.first().unwrap_or(&Value::Null).display_string(),
    ))
}

fn fn_bool(args: &[Value]) -> GmlResult<Value> {
    Ok(Value::Bool(args.first().unwrap_or(&Value::Null).is_truthy()))
}

// Utilities

fn fn_if(args: &[Value]) -> GmlResult<Value> {
    if args.len() < 3 {
        return Err(GmlError::InvalidArgument(
            "IF requires condition, then, else".to_string(),
        ));
    }
    if args[0].is_truthy() {
        Ok(args[1].clone())
    } else {
        Ok(args[2].clone())
    }
}

fn fn_coalesce(args: &[Value]) -> GmlResult<Value> {
    for arg in args {
        if !arg.is_null() {
            return Ok(arg.clone());
        }
    }
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_modes() {
        assert_eq!(
            fn_sum(&[Value::Int(1), Value::Int(2), Value::Int(3)]).unwrap(),
            Value::Float(6.0)
        );
        let arr = Value::array([
            Value::object([("amount", Value::Int(10))]),
            Value::object([("amount", Value::Int(5))]),
        ]);
        assert_eq!(
            fn_sum(&[arr, Value::string("amount")]).unwrap(),
            Value::Float(15.0)
        );
    }

    #[test]
    fn test_len() {
        assert_eq!(fn_len(&[Value::string("héllo")]).unwrap(), Value::Int(5));
        assert_eq!(
            fn_len(&[Value::array([Value::Int(1), Value::Int(2)])]).unwrap(),
            Value::Int(2)
        );
        assert_eq!(fn_len(&[Value::Null]).unwrap(), Value::Int(0));
    }

    #[test]
    fn test_round() {
        assert_eq!(
            fn_round(&[Value::Float(3.14159), Value::Int(2)]).unwrap(),
            Value::Float(3.14)
        );
        assert_eq!(fn_round(&[Value::Float(2.5)]).unwrap(), Value::Float(3.0));
    }

    #[test]
    fn test_coalesce() {
        assert_eq!(
            fn_coalesce(&[Value::Null, Value::Null, Value::Int(3)]).unwrap(),
            Value::Int(3)
        );
        assert_eq!(fn_coalesce(&[Value::Null]).unwrap(), Value::Null);
    }

    #[test]
    fn test_if() {
        assert_eq!(
            fn_if(&[Value::Bool(true), Value::Int(1), Value::Int(2)]).unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            fn_if(&[Value::Int(0), Value::Int(1), Value::Int(2)]).unwrap(),
            Value::Int(2)
        );
    }

    #[test]
    fn test_date_offsets() {
        let base = Local::now();
        assert!(apply_date_offset(base, "1d").unwrap() > base);
        assert!(apply_date_offset(base, "-3M").unwrap() < base);
        assert!(apply_date_offset(base, "2w").unwrap() > base);
        assert!(apply_date_offset(base, "5x").is_err());
    }

    #[test]
    fn test_conversions() {
        assert_eq!(fn_int(&[Value::string("42")]).unwrap(), Value::Int(42));
        assert_eq!(fn_float(&[Value::Int(2)]).unwrap(), Value::Float(2.0));
        assert_eq!(fn_bool(&[Value::string("")]).unwrap(), Value::Bool(false));
        assert_eq!(fn_string(&[Value::Int(7)]).unwrap(), Value::string("7"));
    }

    #[test]
    fn test_format_date() {
        let formatted = fn_format_date(&[
            Value::string("2026-03-01T10:30:00+00:00"),
            Value::string("%Y/%m/%d"),
        ])
        .unwrap();
        assert_eq!(formatted, Value::string("2026/03/01"));
    }
}
