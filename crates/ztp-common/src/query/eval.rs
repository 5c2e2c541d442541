//! Eager evaluator for query expressions over `serde_json::Value`

use std::cmp::Ordering;

use serde_json::{Map, Value};

use super::parser::{number, ArithOp, CompareOp, Expr, ObjectKey};

/// Outcome of evaluating an expression against one input
pub type Outputs = Result<Vec<Value>, String>;

/// Evaluate `expr` against `input`, collecting every output.
pub fn eval(expr: &Expr, input: &Value) -> Outputs {
    match expr {
        Expr::Identity => Ok(vec![input.clone()]),
        Expr::Literal(value) => Ok(vec![value.clone()]),
        Expr::Field(target, name) => {
            let mut out = Vec::new();
            for value in eval(target, input)? {
                out.push(index_field(&value, name)?);
            }
            Ok(out)
        }
        Expr::Index(target, index) => {
            let mut out = Vec::new();
            for value in eval(target, input)? {
                for key in eval(index, input)? {
                    out.push(index_value(&value, &key)?);
                }
            }
            Ok(out)
        }
        Expr::Slice(target, from, to) => {
            let mut out = Vec::new();
            let froms = bound_outputs(from.as_deref(), input)?;
            let tos = bound_outputs(to.as_deref(), input)?;
            for value in eval(target, input)? {
                for from in &froms {
                    for to in &tos {
                        out.push(slice(&value, from, to)?);
                    }
                }
            }
            Ok(out)
        }
        Expr::Iterate(target) => {
            let mut out = Vec::new();
            for value in eval(target, input)? {
                match value {
                    Value::Array(items) => out.extend(items),
                    Value::Object(map) => out.extend(map.into_iter().map(|(_, v)| v)),
                    other => return Err(format!("cannot iterate over {}", describe(&other))),
                }
            }
            Ok(out)
        }
        Expr::Optional(inner) => Ok(eval(inner, input).unwrap_or_default()),
        Expr::Try(body, handler) => match eval(body, input) {
            Ok(out) => Ok(out),
            Err(message) => match handler {
                Some(handler) => eval(handler, &Value::String(message)),
                None => Ok(Vec::new()),
            },
        },
        Expr::Pipe(left, right) => {
            let mut out = Vec::new();
            for value in eval(left, input)? {
                out.extend(eval(right, &value)?);
            }
            Ok(out)
        }
        Expr::Comma(left, right) => {
            let mut out = eval(left, input)?;
            out.extend(eval(right, input)?);
            Ok(out)
        }
        Expr::Alternative(left, right) => {
            let truthy: Vec<Value> = eval(left, input)
                .unwrap_or_default()
                .into_iter()
                .filter(is_truthy)
                .collect();
            if truthy.is_empty() {
                eval(right, input)
            } else {
                Ok(truthy)
            }
        }
        Expr::And(left, right) => {
            let mut out = Vec::new();
            for l in eval(left, input)? {
                if !is_truthy(&l) {
                    out.push(Value::Bool(false));
                    continue;
                }
                for r in eval(right, input)? {
                    out.push(Value::Bool(is_truthy(&r)));
                }
            }
            Ok(out)
        }
        Expr::Or(left, right) => {
            let mut out = Vec::new();
            for l in eval(left, input)? {
                if is_truthy(&l) {
                    out.push(Value::Bool(true));
                    continue;
                }
                for r in eval(right, input)? {
                    out.push(Value::Bool(is_truthy(&r)));
                }
            }
            Ok(out)
        }
        Expr::Compare(op, left, right) => {
            let mut out = Vec::new();
            let rights = eval(right, input)?;
            for l in eval(left, input)? {
                for r in &rights {
                    let ordering = compare(&l, r);
                    let result = match op {
                        CompareOp::Eq => ordering == Ordering::Equal,
                        CompareOp::Ne => ordering != Ordering::Equal,
                        CompareOp::Lt => ordering == Ordering::Less,
                        CompareOp::Le => ordering != Ordering::Greater,
                        CompareOp::Gt => ordering == Ordering::Greater,
                        CompareOp::Ge => ordering != Ordering::Less,
                    };
                    out.push(Value::Bool(result));
                }
            }
            Ok(out)
        }
        Expr::Arith(op, left, right) => {
            let mut out = Vec::new();
            let rights = eval(right, input)?;
            for l in eval(left, input)? {
                for r in &rights {
                    out.push(arith(*op, &l, r)?);
                }
            }
            Ok(out)
        }
        Expr::Neg(operand) => eval(operand, input)?
            .into_iter()
            .map(|v| match v.as_f64() {
                Some(n) => number(-n).ok_or_else(|| "numeric overflow".to_string()),
                None => Err(format!("{} cannot be negated", describe(&v))),
            })
            .collect(),
        Expr::Array(inner) => match inner {
            Some(inner) => Ok(vec![Value::Array(eval(inner, input)?)]),
            None => Ok(vec![Value::Array(Vec::new())]),
        },
        Expr::Object(entries) => construct_object(entries, input),
        Expr::If(branches, otherwise) => eval_if(branches, otherwise.as_deref(), input),
        Expr::Call(name, args) => call(name, args, input),
    }
}

fn bound_outputs(bound: Option<&Expr>, input: &Value) -> Outputs {
    match bound {
        Some(expr) => eval(expr, input),
        None => Ok(vec![Value::Null]),
    }
}

fn eval_if(branches: &[(Expr, Expr)], otherwise: Option<&Expr>, input: &Value) -> Outputs {
    let Some(((condition, body), rest)) = branches.split_first() else {
        return match otherwise {
            Some(expr) => eval(expr, input),
            None => Ok(vec![input.clone()]),
        };
    };
    let mut out = Vec::new();
    for value in eval(condition, input)? {
        if is_truthy(&value) {
            out.extend(eval(body, input)?);
        } else {
            out.extend(eval_if(rest, otherwise, input)?);
        }
    }
    Ok(out)
}

fn construct_object(entries: &[(ObjectKey, Option<Expr>)], input: &Value) -> Outputs {
    let mut partials = vec![Map::new()];
    for (key, value) in entries {
        let keys = match key {
            ObjectKey::Literal(name) => vec![name.clone()],
            ObjectKey::Computed(expr) => eval(expr, input)?
                .into_iter()
                .map(|k| match k {
                    Value::String(s) => Ok(s),
                    other => Err(format!("object keys must be strings, not {}", describe(&other))),
                })
                .collect::<Result<Vec<_>, _>>()?,
        };
        let values = match (key, value) {
            (_, Some(expr)) => eval(expr, input)?,
            (ObjectKey::Literal(name), None) => vec![index_field(input, name)?],
            (ObjectKey::Computed(_), None) => Vec::new(),
        };
        let mut next = Vec::with_capacity(partials.len() * keys.len() * values.len());
        for partial in &partials {
            for k in &keys {
                for v in &values {
                    let mut map = partial.clone();
                    map.insert(k.clone(), v.clone());
                    next.push(map);
                }
            }
        }
        partials = next;
    }
    Ok(partials.into_iter().map(Value::Object).collect())
}

fn index_field(value: &Value, name: &str) -> Result<Value, String> {
    match value {
        Value::Object(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
        Value::Null => Ok(Value::Null),
        other => Err(format!("cannot index {} with \"{}\"", describe(other), name)),
    }
}

fn index_value(value: &Value, key: &Value) -> Result<Value, String> {
    match (value, key) {
        (Value::Object(_), Value::String(name)) => index_field(value, name),
        (Value::Array(items), Value::Number(n)) => {
            let Some(n) = n.as_f64() else {
                return Ok(Value::Null);
            };
            let len = items.len() as i64;
            let mut i = n.floor() as i64;
            if i < 0 {
                i += len;
            }
            if i < 0 || i >= len {
                return Ok(Value::Null);
            }
            Ok(items[i as usize].clone())
        }
        (Value::Null, Value::String(_) | Value::Number(_) | Value::Null) => Ok(Value::Null),
        (other, key) => Err(format!(
            "cannot index {} with {}",
            describe(other),
            describe(key)
        )),
    }
}

fn slice(value: &Value, from: &Value, to: &Value) -> Result<Value, String> {
    let bound = |b: &Value, len: usize, default: usize| -> Result<usize, String> {
        match b {
            Value::Null => Ok(default),
            Value::Number(n) => {
                let n = n.as_f64().unwrap_or(0.0).floor() as i64;
                let len = len as i64;
                let n = if n < 0 { n + len } else { n };
                Ok(n.clamp(0, len) as usize)
            }
            other => Err(format!("slice bounds must be numbers, not {}", describe(other))),
        }
    };
    match value {
        Value::Null => Ok(Value::Null),
        Value::Array(items) => {
            let start = bound(from, items.len(), 0)?;
            let end = bound(to, items.len(), items.len())?.max(start);
            Ok(Value::Array(items[start..end].to_vec()))
        }
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            let start = bound(from, chars.len(), 0)?;
            let end = bound(to, chars.len(), chars.len())?.max(start);
            Ok(Value::String(chars[start..end].iter().collect()))
        }
        other => Err(format!("cannot slice {}", describe(other))),
    }
}

fn arith(op: ArithOp, left: &Value, right: &Value) -> Result<Value, String> {
    match (op, left, right) {
        (ArithOp::Add, Value::Null, other) | (ArithOp::Add, other, Value::Null) => Ok(other.clone()),
        (_, Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
            let result = match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
                ArithOp::Mul => a * b,
                ArithOp::Div if b == 0.0 => return Err("division by zero".to_string()),
                ArithOp::Div => a / b,
            };
            number(result).ok_or_else(|| "numeric overflow".to_string())
        }
        (ArithOp::Add, Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
        (ArithOp::Add, Value::Array(a), Value::Array(b)) => {
            Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
        }
        (ArithOp::Sub, Value::Array(a), Value::Array(b)) => Ok(Value::Array(
            a.iter().filter(|x| !b.contains(x)).cloned().collect(),
        )),
        (ArithOp::Add, Value::Object(a), Value::Object(b)) => {
            let mut merged = a.clone();
            merged.extend(b.iter().map(|(k, v)| (k.clone(), v.clone())));
            Ok(Value::Object(merged))
        }
        (ArithOp::Div, Value::String(a), Value::String(b)) => Ok(Value::Array(
            a.split(b.as_str()).map(|s| Value::String(s.to_string())).collect(),
        )),
        _ => Err(format!(
            "{} and {} cannot be combined with {:?}",
            describe(left),
            describe(right),
            op
        )),
    }
}

fn call(name: &str, args: &[Expr], input: &Value) -> Outputs {
    match (name, args) {
        ("empty", []) => Ok(Vec::new()),
        ("not", []) => Ok(vec![Value::Bool(!is_truthy(input))]),
        ("length", []) => length(input).map(|v| vec![v]),
        ("keys", []) => match input {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                Ok(vec![Value::Array(
                    keys.into_iter().map(|k| Value::String(k.clone())).collect(),
                )])
            }
            Value::Array(items) => Ok(vec![Value::Array(
                (0..items.len()).map(Value::from).collect(),
            )]),
            other => Err(format!("{} has no keys", describe(other))),
        },
        ("type", []) => Ok(vec![Value::String(type_name(input).to_string())]),
        ("tostring", []) => Ok(vec![Value::String(match input {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })]),
        ("tonumber", []) => match input {
            Value::Number(_) => Ok(vec![input.clone()]),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(number)
                .map(|v| vec![v])
                .ok_or_else(|| format!("cannot parse '{}' as a number", s)),
            other => Err(format!("{} cannot be parsed as a number", describe(other))),
        },
        ("ascii_downcase", []) => map_string(input, name, |s| s.to_ascii_lowercase()),
        ("ascii_upcase", []) => map_string(input, name, |s| s.to_ascii_uppercase()),
        ("values", []) => Ok(if input.is_null() {
            Vec::new()
        } else {
            vec![input.clone()]
        }),
        ("add", []) => match input {
            Value::Array(items) => {
                let mut acc = Value::Null;
                for item in items {
                    acc = arith(ArithOp::Add, &acc, item)?;
                }
                Ok(vec![acc])
            }
            Value::Null => Ok(vec![Value::Null]),
            other => Err(format!("cannot add the elements of {}", describe(other))),
        },
        ("first", []) => index_value(input, &Value::from(0)).map(|v| vec![v]),
        ("last", []) => index_value(input, &Value::from(-1)).map(|v| vec![v]),
        ("reverse", []) => match input {
            Value::Array(items) => Ok(vec![Value::Array(items.iter().rev().cloned().collect())]),
            Value::String(s) => Ok(vec![Value::String(s.chars().rev().collect())]),
            Value::Null => Ok(vec![Value::Array(Vec::new())]),
            other => Err(format!("cannot reverse {}", describe(other))),
        },
        ("sort", []) => with_array(input, name, |items| {
            let mut items = items.to_vec();
            items.sort_by(compare);
            Ok(Value::Array(items))
        }),
        ("unique", []) => with_array(input, name, |items| {
            let mut items = items.to_vec();
            items.sort_by(compare);
            items.dedup();
            Ok(Value::Array(items))
        }),
        ("to_entries", []) => match input {
            Value::Object(map) => Ok(vec![Value::Array(
                map.iter()
                    .map(|(k, v)| {
                        let mut entry = Map::new();
                        entry.insert("key".to_string(), Value::String(k.clone()));
                        entry.insert("value".to_string(), v.clone());
                        Value::Object(entry)
                    })
                    .collect(),
            )]),
            other => Err(format!("{} has no entries", describe(other))),
        },
        ("from_entries", []) => with_array(input, name, |items| {
            let mut map = Map::new();
            for item in items {
                let key = match item.get("key").or_else(|| item.get("name")) {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) if !other.is_null() => other.to_string(),
                    _ => return Err("entries need a 'key'".to_string()),
                };
                map.insert(key, item.get("value").cloned().unwrap_or(Value::Null));
            }
            Ok(Value::Object(map))
        }),
        ("any", []) => with_array(input, name, |items| {
            Ok(Value::Bool(items.iter().any(is_truthy)))
        }),
        ("all", []) => with_array(input, name, |items| {
            Ok(Value::Bool(items.iter().all(is_truthy)))
        }),
        ("error", []) => Err(error_message(input)),
        ("error", [message]) => {
            let message = eval(message, input)?
                .into_iter()
                .next()
                .unwrap_or(Value::Null);
            Err(error_message(&message))
        }
        ("select", [predicate]) => {
            let mut out = Vec::new();
            for value in eval(predicate, input)? {
                if is_truthy(&value) {
                    out.push(input.clone());
                }
            }
            Ok(out)
        }
        ("map", [f]) => {
            let items = match input {
                Value::Array(items) => items.clone(),
                Value::Object(map) => map.values().cloned().collect(),
                other => return Err(format!("cannot iterate over {}", describe(other))),
            };
            let mut mapped = Vec::new();
            for item in &items {
                mapped.extend(eval(f, item)?);
            }
            Ok(vec![Value::Array(mapped)])
        }
        ("has", [key]) => eval(key, input)?
            .into_iter()
            .map(|k| match (input, &k) {
                (Value::Object(map), Value::String(s)) => Ok(Value::Bool(map.contains_key(s))),
                (Value::Array(items), Value::Number(n)) => Ok(Value::Bool(
                    n.as_f64()
                        .is_some_and(|i| i >= 0.0 && (i as usize) < items.len()),
                )),
                _ => Err(format!(
                    "cannot check whether {} has {}",
                    describe(input),
                    describe(&k)
                )),
            })
            .collect(),
        ("first", [f]) => Ok(eval(f, input)?.into_iter().take(1).collect()),
        ("startswith", [arg]) => string_test(input, arg, name, |s, p| s.starts_with(p)),
        ("endswith", [arg]) => string_test(input, arg, name, |s, p| s.ends_with(p)),
        ("contains", [arg]) => eval(arg, input)?
            .into_iter()
            .map(|needle| Ok(Value::Bool(contains(input, &needle))))
            .collect(),
        ("join", [sep]) => {
            let mut out = Vec::new();
            for sep in eval(sep, input)? {
                let Value::String(sep) = sep else {
                    return Err("join separator must be a string".to_string());
                };
                let joined = with_array(input, name, |items| {
                    let parts = items
                        .iter()
                        .map(|item| match item {
                            Value::Null => Ok(String::new()),
                            Value::String(s) => Ok(s.clone()),
                            Value::Number(_) | Value::Bool(_) => Ok(item.to_string()),
                            other => Err(format!("cannot join {}", describe(other))),
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(Value::String(parts.join(&sep)))
                })?;
                out.extend(joined);
            }
            Ok(out)
        }
        ("split", [sep]) => {
            let mut out = Vec::new();
            for sep in eval(sep, input)? {
                out.push(arith(ArithOp::Div, input, &sep)?);
            }
            Ok(out)
        }
        (name, args) => Err(format!("{}/{} is not defined", name, args.len())),
    }
}

fn error_message(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn length(value: &Value) -> Result<Value, String> {
    match value {
        Value::Null => Ok(Value::from(0)),
        Value::Bool(_) => Err("boolean has no length".to_string()),
        Value::Number(n) => Ok(number(n.as_f64().unwrap_or(0.0).abs()).unwrap_or(Value::Null)),
        Value::String(s) => Ok(Value::from(s.chars().count())),
        Value::Array(items) => Ok(Value::from(items.len())),
        Value::Object(map) => Ok(Value::from(map.len())),
    }
}

fn map_string(input: &Value, name: &str, f: impl Fn(&str) -> String) -> Outputs {
    match input {
        Value::String(s) => Ok(vec![Value::String(f(s))]),
        other => Err(format!("{} input must be a string, not {}", name, describe(other))),
    }
}

fn with_array(
    input: &Value,
    name: &str,
    f: impl FnOnce(&[Value]) -> Result<Value, String>,
) -> Outputs {
    match input {
        Value::Array(items) => f(items).map(|v| vec![v]),
        other => Err(format!("{} input must be an array, not {}", name, describe(other))),
    }
}

fn string_test(input: &Value, arg: &Expr, name: &str, f: impl Fn(&str, &str) -> bool) -> Outputs {
    eval(arg, input)?
        .into_iter()
        .map(|pattern| match (input, &pattern) {
            (Value::String(s), Value::String(p)) => Ok(Value::Bool(f(s, p))),
            _ => Err(format!("{} requires string inputs", name)),
        })
        .collect()
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(h), Value::String(n)) => h.contains(n.as_str()),
        (Value::Array(h), Value::Array(n)) => n.iter().all(|x| h.iter().any(|y| contains(y, x))),
        (Value::Object(h), Value::Object(n)) => n
            .iter()
            .all(|(k, v)| h.get(k).is_some_and(|hv| contains(hv, v))),
        (h, n) => h == n,
    }
}

/// `false` and `null` are falsy, everything else is truthy
pub fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::String(s) if s.len() <= 32 => format!("string \"{}\"", s),
        other => type_name(other).to_string(),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

/// Total order over values: null < false < true < numbers < strings < arrays < objects
pub fn compare(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&y.as_f64().unwrap_or(0.0))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            let mut xk: Vec<&String> = x.keys().collect();
            let mut yk: Vec<&String> = y.keys().collect();
            xk.sort();
            yk.sort();
            let keys = xk.cmp(&yk);
            if keys != Ordering::Equal {
                return keys;
            }
            for k in xk {
                let ord = compare(&x[k], &y[k]);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        }
        _ => Ordering::Equal,
    }
}
