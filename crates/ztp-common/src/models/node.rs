use serde::Serialize;

use super::Ip;

/// Role of a node, derived from its name
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum NodeKind {
    /// `master<N>`
    ControlPlane,
    /// `worker<N>`
    Worker,
}

impl NodeKind {
    /// Classify a node name: `master\d+` or `worker\d+`, anything else is
    /// left unclassified
    pub fn from_name(name: &str) -> Option<Self> {
        let numbered = |prefix: &str| {
            name.strip_prefix(prefix)
                .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        };
        if numbered("master") {
            Some(NodeKind::ControlPlane)
        } else if numbered("worker") {
            Some(NodeKind::Worker)
        } else {
            None
        }
    }
}

/// Baseboard management controller credentials
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Bmc {
    /// Redfish or IPMI endpoint
    #[serde(rename = "URL")]
    pub url: String,
    /// Login user
    pub user: String,
    /// Login password
    pub pass: String,
}

/// Network interface
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Nic {
    /// Interface name, e.g. `eno1`
    pub name: String,
    /// Hardware address; empty when unknown
    #[serde(rename = "MAC")]
    pub mac: String,
}

/// One machine of an edge cluster
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Node {
    /// Name as written in the site file
    pub name: String,
    /// Role, `None` when the name matches neither pattern
    pub kind: Option<NodeKind>,
    /// Hostname assigned by the enricher
    pub hostname: String,
    /// Management controller
    #[serde(rename = "BMC")]
    pub bmc: Bmc,
    /// Installation disk
    pub root_disk: String,
    /// Disks handed to local storage, in site-file order
    pub storage_disks: Vec<String>,
    /// NIC on the static internal network
    #[serde(rename = "InternalNIC")]
    pub internal_nic: Option<Nic>,
    /// Address on the internal network
    #[serde(rename = "InternalIP")]
    pub internal_ip: Option<Ip>,
    /// NIC on the DHCP external network
    #[serde(rename = "ExternalNIC")]
    pub external_nic: Option<Nic>,
    /// Address discovered on the external network
    #[serde(rename = "ExternalIP")]
    pub external_ip: Option<Ip>,
    /// Interfaces the installer must leave alone
    #[serde(rename = "IgnoredNICs")]
    pub ignored_nics: Vec<String>,
}

impl Node {
    /// Create a node, classifying it by name
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: NodeKind::from_name(&name),
            name,
            ..Default::default()
        }
    }

    /// Trailing decimal digits of the name (`master2` → `2`), empty if none
    pub fn index(&self) -> &str {
        let digits = self
            .name
            .bytes()
            .rev()
            .take_while(|b| b.is_ascii_digit())
            .count();
        &self.name[self.name.len() - digits..]
    }

    /// True for control-plane nodes
    pub fn is_control_plane(&self) -> bool {
        self.kind == Some(NodeKind::ControlPlane)
    }

    /// True for worker nodes
    pub fn is_worker(&self) -> bool {
        self.kind == Some(NodeKind::Worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_name() {
        assert_eq!(NodeKind::from_name("master0"), Some(NodeKind::ControlPlane));
        assert_eq!(NodeKind::from_name("master12"), Some(NodeKind::ControlPlane));
        assert_eq!(NodeKind::from_name("worker3"), Some(NodeKind::Worker));
        assert_eq!(NodeKind::from_name("master"), None);
        assert_eq!(NodeKind::from_name("master0a"), None);
        assert_eq!(NodeKind::from_name("xmaster0"), None);
        assert_eq!(NodeKind::from_name("bootstrap"), None);
    }

    #[test]
    fn test_index() {
        assert_eq!(Node::new("master2").index(), "2");
        assert_eq!(Node::new("worker10").index(), "10");
        assert_eq!(Node::new("bootstrap").index(), "");
    }

    #[test]
    fn test_template_field_names() {
        let mut node = Node::new("master0");
        node.bmc.url = "http://bmc".to_string();
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["Kind"], "ControlPlane");
        assert_eq!(value["BMC"]["URL"], "http://bmc");
        assert!(value["ExternalNIC"].is_null());
    }
}
