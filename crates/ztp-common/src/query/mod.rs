//! Path-expression queries over arbitrary serializable trees
//!
//! The language is the jq subset needed for readiness checks and selective
//! extraction: field and index access, iteration (`[]`), optional chaining
//! (`?`), pipes, `select(..)`, comparisons, boolean logic, object and array
//! construction, `try`/`catch` and a small builtin library.
//!
//! Inputs are serialized to `serde_json::Value` before evaluation, so callers
//! can query typed structs, `DynamicObject`s or raw JSON alike. Results are
//! deserialized into whatever the caller asks for:
//!
//! - a single result fills a single-value destination, or a one-element
//!   sequence when the destination is a collection;
//! - several results fill a sequence in the order they were produced;
//! - no results fill an empty sequence, or `None` for an `Option`.
//!
//! ```ignore
//! let status: Option<String> = query(
//!     r#"try .status.conditions[] | select(.type == "Established") | .status"#,
//!     &crd,
//! )?;
//! ```

mod eval;
mod lexer;
mod parser;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::{Error, Result};

pub use eval::is_truthy;

/// A compiled query, reusable across inputs
#[derive(Debug, Clone)]
pub struct Query {
    text: String,
    expr: parser::Expr,
}

impl Query {
    /// Parse query text, failing with `QueryParse` on invalid syntax
    pub fn compile(text: &str) -> Result<Self> {
        let expr = parser::parse(text).map_err(|e| Error::query_parse(text, e))?;
        Ok(Self {
            text: text.to_string(),
            expr,
        })
    }

    /// Source text of the query
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Evaluate against `input` and return every produced value in order
    pub fn run<I: Serialize + ?Sized>(&self, input: &I) -> Result<Vec<Value>> {
        let input = serde_json::to_value(input)
            .map_err(|e| Error::query_type(&self.text, format!("input is not serializable: {}", e)))?;
        eval::eval(&self.expr, &input).map_err(|e| Error::query_runtime(&self.text, e))
    }

    /// Evaluate against `input` and deserialize the results into `T`
    pub fn extract<T, I>(&self, input: &I) -> Result<T>
    where
        T: DeserializeOwned,
        I: Serialize + ?Sized,
    {
        let results = self.run(input)?;
        self.convert(results)
    }

    fn convert<T: DeserializeOwned>(&self, mut results: Vec<Value>) -> Result<T> {
        let mismatch = |e: serde_json::Error| Error::query_type(&self.text, e.to_string());
        match results.len() {
            1 => {
                let single = results.remove(0);
                match serde_json::from_value(single.clone()) {
                    Ok(value) => Ok(value),
                    Err(first) => serde_json::from_value(Value::Array(vec![single]))
                        .map_err(|_| mismatch(first)),
                }
            }
            0 => match serde_json::from_value(Value::Array(Vec::new())) {
                Ok(value) => Ok(value),
                Err(_) => serde_json::from_value(Value::Null).map_err(|_| {
                    Error::query_type(&self.text, "query produced no results")
                }),
            },
            _ => serde_json::from_value(Value::Array(results)).map_err(mismatch),
        }
    }
}

/// Compile and evaluate `text` against `input` in one step
pub fn query<T, I>(text: &str, input: &I) -> Result<T>
where
    T: DeserializeOwned,
    I: Serialize + ?Sized,
{
    Query::compile(text)?.extract(input)
}
