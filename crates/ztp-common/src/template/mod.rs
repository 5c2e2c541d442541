//! Filesystem-hosted templates rendered with Jinja syntax
//!
//! A [`TemplateEngine`] is built from a [`TemplateFs`] and a sub-directory
//! prefix. Every regular file below the prefix becomes a template named by
//! its relative path. Templates see the render data as `this`; when the data
//! is a mapping its keys are also top-level variables:
//!
//! ```text
//! apiVersion: v1
//! kind: Secret
//! metadata:
//!   name: assisted-deployment-pull-secret
//!   namespace: {{ Cluster.Name }}
//! data:
//!   .dockerconfigjson: {{ Cluster.PullSecret | base64 }}
//! ```
//!
//! Templates can call `execute`, `base64`, `json`, `uuid` and `data`;
//! `base64` and `json` also work as filters.

mod engine;
mod fs;
mod helpers;

pub use engine::TemplateEngine;
pub use fs::{DirFs, MemoryFs, TemplateFs};
