//! Hub side of ZTP: API client, enricher and template applier
//!
//! The client talks to the hub (or, through an SSH tunnel, to an edge
//! cluster). The enricher completes a loaded site configuration with
//! generated and discovered values. The applier renders templates into
//! objects and creates or deletes them in dependency order.

#![deny(missing_docs)]

pub mod applier;
pub mod client;
pub mod enricher;
pub mod gvks;
pub mod labels;

#[cfg(test)]
mod testing;

pub use applier::{Applier, ApplierEvent, ApplierListener, EventKind};
pub use client::{Client, HubClient};
pub use enricher::Enricher;
pub use ztp_common::{Error, Result};
