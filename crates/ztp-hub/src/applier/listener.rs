//! Human readable rendering of applier events

use std::io::Write;
use std::sync::Arc;

use super::events::{ApplierEvent, EventKind, Listener};

type Sink = Arc<dyn Fn(&str) + Send + Sync>;

/// Writes one line per applier event for the person running the tool
///
/// Progress goes to the info sink and failures to the error sink, so a
/// console can prefix and colour them differently.
#[derive(Clone)]
pub struct ApplierListener {
    info: Sink,
    error: Sink,
}

impl std::fmt::Debug for ApplierListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplierListener").finish_non_exhaustive()
    }
}

impl ApplierListener {
    /// Listener writing through the given sinks
    pub fn new(
        info: impl Fn(&str) + Send + Sync + 'static,
        error: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        Self {
            info: Arc::new(info),
            error: Arc::new(error),
        }
    }

    /// Listener writing to standard output and standard error
    pub fn stdio() -> Self {
        Self::new(
            |line| {
                let _ = writeln!(std::io::stdout(), "{}", line);
            },
            |line| {
                let _ = writeln!(std::io::stderr(), "{}", line);
            },
        )
    }

    /// Callback to register with the applier builder
    pub fn into_listener(self) -> Listener {
        Arc::new(move |event: &ApplierEvent| self.on_event(event))
    }

    /// Write the line for `event`
    pub fn on_event(&self, event: &ApplierEvent) {
        let line = message(event);
        if event.kind.is_error() {
            (self.error)(&line);
        } else {
            (self.info)(&line);
        }
    }
}

/// The line shown for an event
pub fn message(event: &ApplierEvent) -> String {
    let kind = friendly_kind(event.object_kind());
    let name = event.object_name();
    let error = event
        .error
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();
    match event.kind {
        EventKind::ObjectCreated => format!("Created {} '{}'", kind, name),
        EventKind::ObjectExists => format!("{} '{}' already exists", capitalize(kind), name),
        EventKind::ObjectNotExist => format!("{} '{}' doesn't exist", capitalize(kind), name),
        EventKind::ObjectDeleted => format!("Deleted {} '{}'", kind, name),
        EventKind::CreateError => format!("Failed to create {} '{}': {}", kind, name, error),
        EventKind::DeleteError => format!("Failed to delete {} '{}': {}", kind, name, error),
        EventKind::StatusUpdated => format!("Updated status of {} '{}'", kind, name),
        EventKind::StatusError => {
            format!("Failed to update status of {} '{}': {}", kind, name, error)
        }
        EventKind::WaitingCrd => format!("Waiting for CRD '{}' to be established", name),
        EventKind::WaitingDisappear => {
            format!("Waiting for {} '{}' to disappear", kind, name)
        }
    }
}

fn friendly_kind(kind: &str) -> &'static str {
    match kind {
        "Agent" => "agent",
        "AgentClusterInstall" => "agent cluster install",
        "BareMetalHost" => "bare metal host",
        "CatalogSource" => "catalog source",
        "ClusterDeployment" => "cluster deployment",
        "ClusterImageSet" => "cluster image set",
        "ConfigMap" => "configmap",
        "CustomResourceDefinition" => "CRD",
        "Deployment" => "deployment",
        "InfraEnv" => "infrastructure environment",
        "IngressController" => "ingress controller",
        "IPAddressPool" => "IP address pool",
        "KlusterletAddonConfig" => "klusterlet addon configuration",
        "L2Advertisement" => "L2 advertisement",
        "LocalVolume" => "local volume",
        "ManagedCluster" => "managed cluster",
        "MetalLB" => "MetalLB",
        "MultiClusterEngine" => "multicluster engine",
        "NMStateConfig" => "nmstate configuration",
        "Namespace" => "namespace",
        "OperatorGroup" => "operator group",
        "Route" => "route",
        "Secret" => "secret",
        "Service" => "service",
        "Subscription" => "subscription",
        _ => "object",
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
