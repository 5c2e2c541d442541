//! Helper functions and filters available to every template
//!
//! - `execute(name, data)`: render another template and return its output
//! - `base64(value)`: standard Base64 of bytes, strings or anything printable
//! - `json(value)`: the value as JSON text
//! - `uuid()`: a fresh random identifier
//! - `data(k1, v1, k2, v2, ...)`: build a mapping from key/value pairs
//!
//! `base64` and `json` are registered both as functions and as filters, so
//! `{{ base64(x) }}` and `{{ x | base64 }}` are equivalent.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use minijinja::value::{Rest, ValueKind};
use minijinja::{context, ErrorKind, State, Value};

use crate::Error;

/// Wrap one of our errors so it survives the trip through minijinja
pub(crate) fn helper_error(err: Error) -> minijinja::Error {
    minijinja::Error::new(ErrorKind::InvalidOperation, err.to_string()).with_source(err)
}

/// Recover the error a helper raised, or classify a plain minijinja failure
pub(crate) fn convert_error(template: &str, err: &minijinja::Error) -> Error {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(ours) = e.downcast_ref::<Error>() {
            return ours.clone();
        }
        source = e.source();
    }
    match err.kind() {
        ErrorKind::TemplateNotFound => Error::TemplateNotFound {
            name: err
                .detail()
                .map(|d| d.trim_matches('"').to_string())
                .unwrap_or_else(|| template.to_string()),
        },
        _ => Error::template_render(template, format!("{:#}", err)),
    }
}

/// Build the render context for `data`: the value itself is `this`, and the
/// entries of a mapping are also top-level variables.
pub(crate) fn scope(data: Value) -> Value {
    if data.kind() == ValueKind::Map {
        context! { this => data.clone(), ..data }
    } else {
        context! { this => data }
    }
}

pub(crate) fn execute(state: &State, name: &str, data: Option<Value>) -> Result<String, minijinja::Error> {
    let template = state
        .env()
        .get_template(name)
        .map_err(|_| helper_error(Error::TemplateNotFound { name: name.to_string() }))?;
    template
        .render(scope(data.unwrap_or_default()))
        .map_err(|e| helper_error(convert_error(name, &e)))
}

pub(crate) fn base64(value: Value) -> Result<String, minijinja::Error> {
    if value.is_undefined() || value.is_none() {
        return Err(helper_error(Error::TemplateType {
            helper: "base64".to_string(),
            message: "expected bytes, a string or a printable value".to_string(),
        }));
    }
    Ok(match value.as_bytes() {
        Some(bytes) => STANDARD.encode(bytes),
        None => STANDARD.encode(value.to_string()),
    })
}

pub(crate) fn json(value: Value) -> Result<String, minijinja::Error> {
    serde_json::to_string(&value).map_err(|e| {
        helper_error(Error::TemplateType {
            helper: "json".to_string(),
            message: e.to_string(),
        })
    })
}

pub(crate) fn uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn data(args: Rest<Value>) -> Result<Value, minijinja::Error> {
    if args.len() % 2 != 0 {
        return Err(helper_error(Error::TemplateArity {
            helper: "data".to_string(),
            message: format!("expected key/value pairs, got {} arguments", args.len()),
        }));
    }
    let mut map = BTreeMap::new();
    for pair in args.chunks(2) {
        let Some(key) = pair[0].as_str() else {
            return Err(helper_error(Error::TemplateType {
                helper: "data".to_string(),
                message: format!("keys must be strings, got {}", pair[0].kind()),
            }));
        };
        map.insert(key.to_string(), pair[1].clone());
    }
    Ok(Value::from_serialize(&map))
}
