//! Common building blocks for ZTP: site model and loader, query evaluator,
//! template engine, errors and retry policy

#![deny(missing_docs)]

pub mod error;
pub mod loader;
pub mod models;
pub mod query;
pub mod retry;
pub mod template;
pub mod yaml;

pub use error::Error;
pub use loader::{load, Source};
pub use models::Config;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
