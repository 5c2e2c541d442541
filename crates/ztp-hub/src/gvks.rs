//! Well-known group/version/kinds
//!
//! The hub's custom kinds have no generated Rust types, so they are handled
//! as `DynamicObject`s addressed through these constants.

use kube::api::{ApiResource, GroupVersionKind};

/// A group/version/kind known at compile time
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Gvk {
    /// API group, empty for the core group
    pub group: &'static str,
    /// API version
    pub version: &'static str,
    /// Kind
    pub kind: &'static str,
}

impl Gvk {
    const fn new(group: &'static str, version: &'static str, kind: &'static str) -> Self {
        Self {
            group,
            version,
            kind,
        }
    }

    /// Owned kube representation
    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(self.group, self.version, self.kind)
    }

    /// True if `gvk` names the same group and kind, ignoring version
    pub fn matches(&self, gvk: &GroupVersionKind) -> bool {
        gvk.group == self.group && gvk.kind == self.kind
    }
}

/// Namespace
pub const NAMESPACE: Gvk = Gvk::new("", "v1", "Namespace");
/// Secret
pub const SECRET: Gvk = Gvk::new("", "v1", "Secret");
/// ConfigMap
pub const CONFIG_MAP: Gvk = Gvk::new("", "v1", "ConfigMap");
/// Node
pub const NODE: Gvk = Gvk::new("", "v1", "Node");
/// CustomResourceDefinition
pub const CRD: Gvk = Gvk::new("apiextensions.k8s.io", "v1", "CustomResourceDefinition");
/// Agent reported by a booted discovery image
pub const AGENT: Gvk = Gvk::new("agent-install.openshift.io", "v1beta1", "Agent");
/// AgentClusterInstall
pub const AGENT_CLUSTER_INSTALL: Gvk = Gvk::new(
    "extensions.hive.openshift.io",
    "v1beta1",
    "AgentClusterInstall",
);
/// BareMetalHost
pub const BARE_METAL_HOST: Gvk = Gvk::new("metal3.io", "v1alpha1", "BareMetalHost");
/// ClusterDeployment
pub const CLUSTER_DEPLOYMENT: Gvk = Gvk::new("hive.openshift.io", "v1", "ClusterDeployment");
/// IngressController, source of the hub DNS domain
pub const INGRESS_CONTROLLER: Gvk = Gvk::new("operator.openshift.io", "v1", "IngressController");
/// LocalVolume created by the local storage operator
pub const LOCAL_VOLUME: Gvk = Gvk::new("local.storage.openshift.io", "v1", "LocalVolume");

/// Known irregular plurals, lowercase kind to resource name
const KIND_PLURALS: &[(&str, &str)] = &[
    ("ingress", "ingresses"),
    ("endpoints", "endpoints"),
    ("nmstateconfig", "nmstateconfigs"),
    ("storageclass", "storageclasses"),
    ("ipaddresspool", "ipaddresspools"),
];

/// Resource name for a kind, e.g. `BareMetalHost` → `baremetalhosts`
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    for (singular, plural) in KIND_PLURALS {
        if *singular == lower {
            return (*plural).to_string();
        }
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Build an ApiResource without asking the server
///
/// Used when discovery doesn't know the kind yet, e.g. right after its CRD
/// was created.
pub fn build_api_resource(gvk: &GroupVersionKind) -> ApiResource {
    let api_version = if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    };
    ApiResource {
        group: gvk.group.clone(),
        version: gvk.version.clone(),
        kind: gvk.kind.clone(),
        api_version,
        plural: pluralize_kind(&gvk.kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pluralize_kind() {
        assert_eq!(pluralize_kind("BareMetalHost"), "baremetalhosts");
        assert_eq!(pluralize_kind("CustomResourceDefinition"), "customresourcedefinitions");
        assert_eq!(pluralize_kind("IngressController"), "ingresscontrollers");
        assert_eq!(pluralize_kind("Ingress"), "ingresses");
        assert_eq!(pluralize_kind("Policy"), "policies");
        assert_eq!(pluralize_kind("Gateway"), "gateways");
        assert_eq!(pluralize_kind("Class"), "classes");
    }

    #[test]
    fn test_build_api_resource() {
        let ar = build_api_resource(&AGENT_CLUSTER_INSTALL.gvk());
        assert_eq!(ar.api_version, "extensions.hive.openshift.io/v1beta1");
        assert_eq!(ar.plural, "agentclusterinstalls");

        let ar = build_api_resource(&NAMESPACE.gvk());
        assert_eq!(ar.api_version, "v1");
        assert_eq!(ar.group, "");
        assert_eq!(ar.plural, "namespaces");
    }

    #[test]
    fn test_matches_ignores_version() {
        let other = GroupVersionKind::gvk("hive.openshift.io", "v2", "ClusterDeployment");
        assert!(CLUSTER_DEPLOYMENT.matches(&other));
        assert!(!BARE_METAL_HOST.matches(&other));
    }
}
