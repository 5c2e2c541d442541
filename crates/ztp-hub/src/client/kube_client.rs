//! kube-backed implementation of [`HubClient`]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch,
    PatchParams, PostParams, WatchParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::Scope;
use kube::Config;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::tunnel::SshTunnel;
use super::watcher::{self, EventStream, WatchSource};
use super::{HubClient, ListOptions, ObjectKey, PatchStrategy, Watch};
use crate::gvks::build_api_resource;
use crate::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const FIELD_MANAGER: &str = "ztp";
/// Server-side watch timeout; must stay below the 295s kube allows
const WATCH_TIMEOUT_SECS: u32 = 290;
const WATCH_BUFFER: usize = 64;
const DEFAULT_SSH_USER: &str = "core";

/// Where the kubeconfig comes from
#[derive(Clone, Debug)]
pub enum KubeconfigSource {
    /// Read from a file
    Path(PathBuf),
    /// Kubeconfig YAML already in memory
    Bytes(Vec<u8>),
}

/// Builds a [`Client`]
#[derive(Debug, Default)]
pub struct ClientBuilder {
    kubeconfig: Option<KubeconfigSource>,
    ssh_servers: Vec<String>,
    ssh_user: Option<String>,
    ssh_key: Option<Vec<u8>>,
}

impl ClientBuilder {
    /// Use this kubeconfig instead of inferring one from the environment
    pub fn kubeconfig(mut self, source: KubeconfigSource) -> Self {
        self.kubeconfig = Some(source);
        self
    }

    /// Tunnel through this SSH server; may be called several times, servers
    /// are tried in order
    pub fn ssh_server(mut self, server: impl Into<String>) -> Self {
        self.ssh_servers.push(server.into());
        self
    }

    /// Tunnel through any of these SSH servers
    pub fn ssh_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ssh_servers.extend(servers.into_iter().map(Into::into));
        self
    }

    /// SSH user, `core` by default
    pub fn ssh_user(mut self, user: impl Into<String>) -> Self {
        self.ssh_user = Some(user.into());
        self
    }

    /// PEM encoded private key for the SSH user
    pub fn ssh_key(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.ssh_key = Some(pem.into());
        self
    }

    /// Load the configuration, open the tunnel if one was requested, and
    /// create the client
    pub async fn build(self) -> Result<Client> {
        let mut config = match &self.kubeconfig {
            Some(KubeconfigSource::Path(path)) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to read kubeconfig '{}': {}", path.display(), e),
                    )
                })?;
                custom_config(kubeconfig).await?
            }
            Some(KubeconfigSource::Bytes(bytes)) => {
                let text = std::str::from_utf8(bytes).map_err(|e| {
                    Error::internal_with_context("create_client", format!("kubeconfig is not UTF-8: {}", e))
                })?;
                let kubeconfig = Kubeconfig::from_yaml(text).map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to parse kubeconfig: {}", e),
                    )
                })?;
                custom_config(kubeconfig).await?
            }
            None => Config::infer().await.map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to infer config: {}", e),
                )
            })?,
        };
        config.connect_timeout = Some(CONNECT_TIMEOUT);

        let tunnel = if self.ssh_servers.is_empty() {
            None
        } else {
            let key = self.ssh_key.as_deref().ok_or_else(|| {
                Error::internal_with_context("create_client", "SSH servers given without an SSH key")
            })?;
            let user = self.ssh_user.as_deref().unwrap_or(DEFAULT_SSH_USER);
            let tunnel = SshTunnel::connect(&self.ssh_servers, user, key).await?;
            route_through(&mut config, &tunnel).await?;
            Some(tunnel)
        };

        let inner = kube::Client::try_from(config).map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to create client: {}", e))
        })?;

        Ok(Client {
            inner,
            tunnel,
            resources: Mutex::new(HashMap::new()),
        })
    }
}

async fn custom_config(kubeconfig: Kubeconfig) -> Result<Config> {
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to load kubeconfig: {}", e))
        })
}

/// Point `config` at a loopback forwarder that relays to the API server
/// through `tunnel`, keeping the original name for TLS verification
async fn route_through(config: &mut Config, tunnel: &SshTunnel) -> Result<()> {
    let host = config
        .cluster_url
        .host()
        .ok_or_else(|| {
            Error::internal_with_context("create_client", "kubeconfig server URL has no host")
        })?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = config.cluster_url.port_u16().unwrap_or(443);

    let local = tunnel.forward(&host, port).await?;
    config.cluster_url = format!("https://{}", local).parse().map_err(|e| {
        Error::internal_with_context("create_client", format!("invalid tunnel URL: {}", e))
    })?;
    if config.tls_server_name.is_none() {
        config.tls_server_name = Some(host.clone());
    }
    info!(api = %format!("{host}:{port}"), local = %local, "API traffic routed through SSH tunnel");
    Ok(())
}

/// Client for the declarative API, optionally tunnelled over SSH
pub struct Client {
    inner: kube::Client,
    tunnel: Option<SshTunnel>,
    resources: Mutex<HashMap<GroupVersionKind, (ApiResource, bool)>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("tunnel", &self.tunnel)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Start building a client
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// The SSH tunnel, when the client was built with one
    pub fn tunnel(&self) -> Option<&SshTunnel> {
        self.tunnel.as_ref()
    }

    /// Release the SSH session, if any
    pub async fn close(&self) {
        if let Some(tunnel) = &self.tunnel {
            tunnel.close().await;
        }
    }

    /// Resource description and scope for `gvk`
    ///
    /// Asks discovery first. Kinds discovery doesn't know yet fall back to a
    /// guessed plural and are not cached, so a later call can still find
    /// them once their CRD is served.
    async fn resource(&self, gvk: &GroupVersionKind) -> (ApiResource, Option<bool>) {
        let cached = self
            .resources
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(gvk)
            .cloned();
        if let Some((ar, namespaced)) = cached {
            return (ar, Some(namespaced));
        }

        match kube::discovery::pinned_kind(&self.inner, gvk).await {
            Ok((ar, caps)) => {
                let namespaced = caps.scope == Scope::Namespaced;
                self.resources
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(gvk.clone(), (ar.clone(), namespaced));
                (ar, Some(namespaced))
            }
            Err(e) => {
                debug!(kind = %gvk.kind, group = %gvk.group, error = %e, "Discovery failed, guessing resource");
                (build_api_resource(gvk), None)
            }
        }
    }

    async fn api(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let (ar, namespaced) = self.resource(gvk).await;
        let namespaced = namespaced.unwrap_or(namespace.is_some());
        match namespace {
            Some(ns) if namespaced => Api::namespaced_with(self.inner.clone(), ns, &ar),
            _ => Api::all_with(self.inner.clone(), &ar),
        }
    }

    async fn api_for(&self, object: &DynamicObject) -> Result<(Api<DynamicObject>, ObjectKey)> {
        let key = ObjectKey::of(object)?;
        let api = self.api(&key.gvk, key.namespace.as_deref()).await;
        Ok((api, key))
    }
}

#[async_trait]
impl HubClient for Client {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject> {
        let api = self.api(&key.gvk, key.namespace.as_deref()).await;
        api.get(&key.name).await.map_err(|e| api_error(e, key))
    }

    async fn list(&self, gvk: &GroupVersionKind, options: &ListOptions) -> Result<Vec<DynamicObject>> {
        let api = self.api(gvk, options.namespace.as_deref()).await;
        let list = api.list(&list_params(options)).await.map_err(Error::from)?;
        debug!(kind = %gvk.kind, count = list.items.len(), "Listed objects");
        Ok(list.items)
    }

    async fn create(&self, object: &DynamicObject) -> Result<DynamicObject> {
        let (api, key) = self.api_for(object).await?;
        let created = api
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| api_error(e, &key))?;
        debug!(object = %key, "Created object");
        Ok(created)
    }

    async fn update(&self, object: &DynamicObject) -> Result<DynamicObject> {
        let (api, key) = self.api_for(object).await?;
        let updated = api
            .replace(&key.name, &PostParams::default(), object)
            .await
            .map_err(|e| api_error(e, &key))?;
        debug!(object = %key, "Updated object");
        Ok(updated)
    }

    async fn patch(&self, object: &DynamicObject, strategy: PatchStrategy) -> Result<DynamicObject> {
        let (api, key) = self.api_for(object).await?;
        let params = patch_params(strategy);
        let patched = api
            .patch(&key.name, &params, &patch_body(object, strategy))
            .await
            .map_err(|e| api_error(e, &key))?;
        debug!(object = %key, strategy = ?strategy, "Patched object");
        Ok(patched)
    }

    async fn delete(&self, object: &DynamicObject) -> Result<()> {
        let (api, key) = self.api_for(object).await?;
        api.delete(&key.name, &DeleteParams::background())
            .await
            .map_err(|e| api_error(e, &key))?;
        debug!(object = %key, "Deleted object");
        Ok(())
    }

    async fn delete_all_of(&self, gvk: &GroupVersionKind, options: &ListOptions) -> Result<()> {
        let api = self.api(gvk, options.namespace.as_deref()).await;
        api.delete_collection(&DeleteParams::background(), &list_params(options))
            .await
            .map_err(Error::from)?;
        debug!(kind = %gvk.kind, namespace = ?options.namespace, "Deleted collection");
        Ok(())
    }

    /// Sends the whole object as a merge patch to the status subresource;
    /// the resource version it carries makes the write conditional
    async fn update_status(&self, object: &DynamicObject) -> Result<DynamicObject> {
        let (api, key) = self.api_for(object).await?;
        let updated = api
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(object))
            .await
            .map_err(|e| api_error(e, &key))?;
        debug!(object = %key, "Updated status");
        Ok(updated)
    }

    async fn patch_status(&self, object: &DynamicObject, strategy: PatchStrategy) -> Result<DynamicObject> {
        let (api, key) = self.api_for(object).await?;
        let params = patch_params(strategy);
        let patched = api
            .patch_status(&key.name, &params, &patch_body(object, strategy))
            .await
            .map_err(|e| api_error(e, &key))?;
        debug!(object = %key, strategy = ?strategy, "Patched status");
        Ok(patched)
    }

    async fn watch(&self, gvk: &GroupVersionKind, options: &ListOptions) -> Result<Watch> {
        let api = self.api(gvk, options.namespace.as_deref()).await;
        let mut params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        if let Some(labels) = &options.label_selector {
            params = params.labels(labels);
        }
        if let Some(fields) = &options.field_selector {
            params = params.fields(fields);
        }

        let source = ApiWatchSource {
            api,
            watch: params,
            list: list_params(options),
        };

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let stop = CancellationToken::new();
        tokio::spawn(watcher::pump(source, gvk.kind.clone(), tx, stop.clone()));
        Ok(Watch::from_channel(rx, stop))
    }
}

/// Subscriptions for one kind through the kube API
struct ApiWatchSource {
    api: Api<DynamicObject>,
    watch: WatchParams,
    list: ListParams,
}

#[async_trait]
impl WatchSource for ApiWatchSource {
    async fn open(&self, version: &str) -> Result<EventStream> {
        let stream = self.api.watch(&self.watch, version).await?;
        Ok(stream.map(|item| item.map_err(Error::from)).boxed())
    }

    async fn relist(&self) -> Result<(String, Vec<DynamicObject>)> {
        let listed = self.api.list(&self.list).await?;
        let version = listed.metadata.resource_version.unwrap_or_default();
        Ok((version, listed.items))
    }
}

fn list_params(options: &ListOptions) -> ListParams {
    let mut params = ListParams::default();
    if let Some(labels) = &options.label_selector {
        params = params.labels(labels);
    }
    if let Some(fields) = &options.field_selector {
        params = params.fields(fields);
    }
    params
}

fn patch_params(strategy: PatchStrategy) -> PatchParams {
    match strategy {
        PatchStrategy::Apply => PatchParams::apply(FIELD_MANAGER).force(),
        _ => PatchParams::default(),
    }
}

fn patch_body(object: &DynamicObject, strategy: PatchStrategy) -> Patch<&DynamicObject> {
    match strategy {
        PatchStrategy::Merge => Patch::Merge(object),
        PatchStrategy::Strategic => Patch::Strategic(object),
        PatchStrategy::Apply => Patch::Apply(object),
    }
}

/// Convert a kube error, naming the object for not-found and already-exists
fn api_error(err: kube::Error, key: &ObjectKey) -> Error {
    let name = match &key.namespace {
        Some(ns) => format!("{}/{}", ns, key.name),
        None => key.name.clone(),
    };
    match Error::from(err) {
        Error::NotFound { .. } => Error::not_found(&key.gvk.kind, name),
        Error::AlreadyExists { .. } => Error::already_exists(&key.gvk.kind, name),
        other => other,
    }
}
