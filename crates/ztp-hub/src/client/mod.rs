//! Facade over the hub (or edge) cluster API
//!
//! Everything the enricher and applier need from the API server goes through
//! [`HubClient`], which works on untyped [`DynamicObject`]s addressed by
//! group/version/kind. [`Client`] is the real implementation; tests use the
//! generated mock or an in-memory fake.
//!
//! Watches are exposed as a [`Watch`] handle that owns the receiving end of a
//! channel. The real client keeps the channel open across server-side
//! timeouts by re-subscribing from the last seen resource version, so a
//! consumer never sees the gap.

mod kube_client;
mod tunnel;
mod watcher;

use std::fmt;

use async_trait::async_trait;
use kube::api::{DynamicObject, GroupVersionKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

pub use kube_client::{Client, ClientBuilder, KubeconfigSource};
pub use tunnel::{ExecOutput, RemoteExec, SshTunnel};

/// Identifies one object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectKey {
    /// Type of the object
    pub gvk: GroupVersionKind,
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced object
    pub fn namespaced(gvk: GroupVersionKind, namespace: &str, name: &str) -> Self {
        Self {
            gvk,
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    /// Key for a cluster-scoped object
    pub fn cluster(gvk: GroupVersionKind, name: &str) -> Self {
        Self {
            gvk,
            namespace: None,
            name: name.to_string(),
        }
    }

    /// Key of an existing object
    pub fn of(object: &DynamicObject) -> Result<Self> {
        Ok(Self {
            gvk: gvk_of(object)?,
            namespace: object.metadata.namespace.clone(),
            name: object.metadata.name.clone().unwrap_or_default(),
        })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.gvk.kind, ns, self.name),
            None => write!(f, "{} {}", self.gvk.kind, self.name),
        }
    }
}

/// Filters for list, watch and delete-collection calls
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Restrict to one namespace
    pub namespace: Option<String>,
    /// Label selector, e.g. `ztpfw=true`
    pub label_selector: Option<String>,
    /// Field selector, e.g. `metadata.name=foo`
    pub field_selector: Option<String>,
}

impl ListOptions {
    /// Restrict to `namespace`
    pub fn in_namespace(namespace: &str) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }
    }

    /// Add a label selector
    pub fn labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }

    /// Add a field selector
    pub fn fields(mut self, selector: &str) -> Self {
        self.field_selector = Some(selector.to_string());
        self
    }
}

/// How a patch body is interpreted by the server
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchStrategy {
    /// JSON merge patch (RFC 7386)
    Merge,
    /// Kubernetes strategic merge patch
    Strategic,
    /// Server-side apply
    Apply,
}

/// One change observed by a watch
#[derive(Clone, Debug)]
pub enum WatchEvent {
    /// Object appeared (or existed when the watch started)
    Added(DynamicObject),
    /// Object changed
    Modified(DynamicObject),
    /// Object is gone
    Deleted(DynamicObject),
    /// Progress marker carrying only a resource version
    Bookmark {
        /// Resource version the watch has reached
        resource_version: String,
    },
    /// Server reported an error inside the stream
    Error {
        /// HTTP style status code
        code: u16,
        /// Server message
        message: String,
    },
}

impl WatchEvent {
    /// The object carried by added, modified and deleted events
    pub fn object(&self) -> Option<&DynamicObject> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => Some(o),
            _ => None,
        }
    }
}

/// A running watch
///
/// Events arrive in order on [`Watch::next`]. Server disconnects are
/// absorbed by the producer, which reports failures to reconnect as
/// [`WatchEvent::Error`] and keeps trying; the stream ends only when the
/// watch is stopped or the handle is dropped.
pub struct Watch {
    events: mpsc::Receiver<WatchEvent>,
    stop: CancellationToken,
}

impl Watch {
    /// Wrap the receiving end of an event channel; cancelling `stop` tells
    /// the producer to finish
    pub fn from_channel(events: mpsc::Receiver<WatchEvent>, stop: CancellationToken) -> Self {
        Self { events, stop }
    }

    /// Next event, or `None` once the watch has ended
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }

    /// Ask the producer to stop; events already queued can still be read
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch")
            .field("stopped", &self.stop.is_cancelled())
            .finish()
    }
}

/// Operations on the declarative API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HubClient: Send + Sync {
    /// Fetch one object
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject>;

    /// List objects of one type
    async fn list(&self, gvk: &GroupVersionKind, options: &ListOptions)
        -> Result<Vec<DynamicObject>>;

    /// Create an object; `AlreadyExists` if it is already there
    async fn create(&self, object: &DynamicObject) -> Result<DynamicObject>;

    /// Replace an object; `Conflict` if its resource version is stale
    async fn update(&self, object: &DynamicObject) -> Result<DynamicObject>;

    /// Patch an object with the given strategy, using the object as the body
    async fn patch(&self, object: &DynamicObject, strategy: PatchStrategy)
        -> Result<DynamicObject>;

    /// Delete an object; `NotFound` if it doesn't exist
    async fn delete(&self, object: &DynamicObject) -> Result<()>;

    /// Delete every object of a type matching the filters
    async fn delete_all_of(&self, gvk: &GroupVersionKind, options: &ListOptions) -> Result<()>;

    /// Write the status subtree of an object; `Conflict` if its resource
    /// version is stale
    async fn update_status(&self, object: &DynamicObject) -> Result<DynamicObject>;

    /// Patch the status subtree of an object
    async fn patch_status(
        &self,
        object: &DynamicObject,
        strategy: PatchStrategy,
    ) -> Result<DynamicObject>;

    /// Start watching objects of one type
    async fn watch(&self, gvk: &GroupVersionKind, options: &ListOptions) -> Result<Watch>;
}

/// Writes that only touch the status subresource
pub struct StatusWriter<'a> {
    client: &'a dyn HubClient,
}

impl StatusWriter<'_> {
    /// Replace the status of `object`
    pub async fn update(&self, object: &DynamicObject) -> Result<DynamicObject> {
        self.client.update_status(object).await
    }

    /// Patch the status of `object`
    pub async fn patch(&self, object: &DynamicObject, strategy: PatchStrategy) -> Result<DynamicObject> {
        self.client.patch_status(object, strategy).await
    }
}

impl dyn HubClient + '_ {
    /// Sub-client whose writes go to the status subresource
    pub fn status(&self) -> StatusWriter<'_> {
        StatusWriter { client: self }
    }
}

/// Group/version/kind of an object, from its `apiVersion` and `kind`
pub fn gvk_of(object: &DynamicObject) -> Result<GroupVersionKind> {
    let types = object.types.as_ref().ok_or_else(|| {
        Error::internal_with_context(
            "client",
            format!(
                "object '{}' has no apiVersion or kind",
                object.metadata.name.as_deref().unwrap_or_default()
            ),
        )
    })?;
    let (group, version) = parse_api_version(&types.api_version);
    Ok(GroupVersionKind::gvk(&group, &version, &types.kind))
}

/// Split `group/version` (or a bare core `version`) into its parts
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// `apiVersion` string for a group/version/kind
pub fn api_version_of(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    }
}

/// Delete every CRD whose `spec.group` is `group`, returning how many were
/// deleted
pub async fn delete_crd_group(client: &dyn HubClient, group: &str) -> Result<usize> {
    let crds = client
        .list(&crate::gvks::CRD.gvk(), &ListOptions::default())
        .await?;
    let matching: Vec<_> = crds
        .into_iter()
        .filter(|crd| crd.data.pointer("/spec/group").and_then(|g| g.as_str()) == Some(group))
        .collect();
    tracing::debug!(group = %group, count = matching.len(), "CRDs to delete");

    let mut deleted = 0;
    for crd in &matching {
        client.delete(crd).await?;
        deleted += 1;
        tracing::debug!(
            group = %group,
            name = crd.metadata.name.as_deref().unwrap_or_default(),
            "Deleted CRD"
        );
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gvks;
    use serde_json::json;

    fn crd(name: &str, group: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": name},
            "spec": {"group": group}
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_api_version() {
        assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
        assert_eq!(
            parse_api_version("metal3.io/v1alpha1"),
            ("metal3.io".to_string(), "v1alpha1".to_string())
        );
        assert_eq!(api_version_of(&gvks::NAMESPACE.gvk()), "v1");
        assert_eq!(api_version_of(&gvks::BARE_METAL_HOST.gvk()), "metal3.io/v1alpha1");
    }

    #[test]
    fn test_object_key_display() {
        let key = ObjectKey::of(&crd("widgets.example.com", "example.com")).unwrap();
        assert_eq!(key.to_string(), "CustomResourceDefinition widgets.example.com");
        let key = ObjectKey::namespaced(gvks::SECRET.gvk(), "sno", "pull-secret");
        assert_eq!(key.to_string(), "Secret sno/pull-secret");
    }

    #[tokio::test]
    async fn test_delete_crd_group_only_deletes_matching() {
        let mut mock = MockHubClient::new();
        mock.expect_list().returning(|_, _| {
            Ok(vec![
                crd("a.metal3.io", "metal3.io"),
                crd("b.example.com", "example.com"),
                crd("c.metal3.io", "metal3.io"),
            ])
        });
        mock.expect_delete()
            .withf(|o| o.metadata.name.as_deref().is_some_and(|n| n.ends_with("metal3.io")))
            .times(2)
            .returning(|_| Ok(()));

        let deleted = delete_crd_group(&mock, "metal3.io").await.unwrap();
        assert_eq!(deleted, 2);
    }

    #[tokio::test]
    async fn test_watch_handle_stops_producer_on_drop() {
        let (tx, rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        let watch = Watch::from_channel(rx, stop.clone());
        drop(watch);
        assert!(stop.is_cancelled());
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_status_writer_routes_to_status_calls() {
        let mut mock = MockHubClient::new();
        mock.expect_update_status().times(1).returning(|o| Ok(o.clone()));
        mock.expect_update().never();
        let client: &dyn HubClient = &mock;
        let object = crd("x.example.com", "example.com");
        client.status().update(&object).await.unwrap();
    }
}
