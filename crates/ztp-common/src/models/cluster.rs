use std::net::IpAddr;

use serde::Serialize;

use super::{bytes, Ip, Node};

/// API server endpoints
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Api {
    /// Virtual IP on the internal network
    #[serde(rename = "InternalIP")]
    pub internal_ip: Option<IpAddr>,
    /// Address the API name resolves to from outside
    #[serde(rename = "ExternalIP")]
    pub external_ip: Option<IpAddr>,
}

/// Ingress endpoints
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Ingress {
    /// Virtual IP on the internal network
    #[serde(rename = "InternalIP")]
    pub internal_ip: Option<IpAddr>,
    /// Address the ingress name resolves to from outside
    #[serde(rename = "ExternalIP")]
    pub external_ip: Option<IpAddr>,
}

/// DNS settings
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Dns {
    /// Base domain; the cluster lives at `<name>.<domain>`
    pub domain: String,
}

/// SSH key pair installed on every node
#[derive(Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Ssh {
    /// OpenSSH `authorized_keys` line
    #[serde(with = "bytes")]
    pub public_key: Vec<u8>,
    /// PEM encoded private key
    #[serde(with = "bytes")]
    pub private_key: Vec<u8>,
}

impl std::fmt::Debug for Ssh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ssh")
            .field("public_key", &String::from_utf8_lossy(&self.public_key))
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Mirror registry
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Registry {
    /// `host[:port]` of the registry
    #[serde(rename = "URL")]
    pub url: String,
    /// CA certificate bundle trusted for the registry
    #[serde(rename = "CA", with = "bytes")]
    pub ca: Vec<u8>,
}

/// Pod network
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterNetwork {
    /// Network range
    #[serde(rename = "CIDR")]
    pub cidr: Ip,
    /// Prefix length of the per-node slice
    pub host_prefix: u8,
}

/// Node network
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MachineNetwork {
    /// Network range
    #[serde(rename = "CIDR")]
    pub cidr: Ip,
}

/// Service network
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServiceNetwork {
    /// Network range
    #[serde(rename = "CIDR")]
    pub cidr: Ip,
}

/// One edge cluster
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Cluster {
    /// Cluster name, also its namespace on the hub
    pub name: String,
    /// Enable TPM disk encryption
    #[serde(rename = "TPM")]
    pub tpm: bool,
    /// Single node cluster, true iff there is exactly one control-plane node
    #[serde(rename = "SNO")]
    pub sno: bool,
    /// Pull secret JSON
    #[serde(with = "bytes")]
    pub pull_secret: Vec<u8>,
    /// Name of the cluster image set to install
    pub image_set: String,
    /// DNS settings
    #[serde(rename = "DNS")]
    pub dns: Dns,
    /// API endpoints
    #[serde(rename = "API")]
    pub api: Api,
    /// Ingress endpoints
    pub ingress: Ingress,
    /// Node SSH keys
    #[serde(rename = "SSH")]
    pub ssh: Ssh,
    /// Admin kubeconfig, available once installed
    #[serde(with = "bytes")]
    pub kubeconfig: Vec<u8>,
    /// Mirror registry
    pub registry: Registry,
    /// Pod networks
    pub cluster_networks: Vec<ClusterNetwork>,
    /// Node networks
    pub machine_networks: Vec<MachineNetwork>,
    /// Service networks
    pub service_networks: Vec<ServiceNetwork>,
    /// Machines, sorted by name
    pub nodes: Vec<Node>,
}

impl Cluster {
    /// Create an empty cluster called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Control-plane nodes, in cluster order
    pub fn control_plane_nodes(&self) -> Vec<&Node> {
        self.nodes.iter().filter(|n| n.is_control_plane()).collect()
    }

    /// Worker nodes, in cluster order
    pub fn worker_nodes(&self) -> Vec<&Node> {
        self.nodes.iter().filter(|n| n.is_worker()).collect()
    }

    /// Find a node by name
    pub fn lookup_node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Names of all nodes, in cluster order
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }
}
