//! Typed site model
//!
//! A [`Config`] owns its [`Cluster`]s, which own their [`Node`]s. The loader
//! builds it from site YAML and the enricher fills in generated and
//! discovered values. Field names serialize in PascalCase (`Cluster.Name`,
//! `Cluster.API.InternalIP`, `Node.BMC.URL`) because that is how templates
//! address them. Opaque secrets serialize as bytes so templates can feed
//! them straight to `base64`.

mod cluster;
mod config;
mod ip;
mod node;

pub use cluster::{
    Api, Cluster, ClusterNetwork, Dns, Ingress, MachineNetwork, Registry, ServiceNetwork, Ssh,
};
pub use config::Config;
pub use ip::Ip;
pub use node::{Bmc, Nic, Node, NodeKind};

/// Serialize `Vec<u8>` as a byte string rather than a sequence of integers
pub(crate) mod bytes {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(value)
    }
}
