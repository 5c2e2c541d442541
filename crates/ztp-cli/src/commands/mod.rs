//! CLI commands

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use clap::Args;
use kube::api::DynamicObject;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use ztp_common::models::Cluster;
use ztp_common::template::DirFs;
use ztp_common::Config;
use ztp_hub::applier::ApplierBuilder;
use ztp_hub::client::{KubeconfigSource, ObjectKey, Watch, WatchEvent};
use ztp_hub::enricher::HickoryResolver;
use ztp_hub::{enricher, gvks, Applier, Client, Enricher, HubClient};

use crate::console::Console;
use crate::{Error, Result};

pub mod cluster;
pub mod dev;
pub mod lso;
pub mod metallb;
pub mod ui;

/// Key-scoped user on every edge node
const SSH_USER: &str = "core";

/// Shared state of one command invocation
#[derive(Clone, Debug)]
pub struct Context {
    pub console: Arc<Console>,
    pub cancel: CancellationToken,
}

impl Context {
    pub fn new(console: Arc<Console>, cancel: CancellationToken) -> Self {
        Self { console, cancel }
    }

    /// Applier for `root/objects` of the template tree, reporting to the
    /// console
    pub fn applier(&self, data_dir: &Path, root: &str, client: Arc<dyn HubClient>) -> ApplierBuilder {
        Applier::builder()
            .client(client)
            .fs(Arc::new(DirFs::new(data_dir)))
            .root(root)
            .dir("objects")
            .listener({
                let listener = self.console.applier_listener().into_listener();
                move |event: &ztp_hub::ApplierEvent| listener(event)
            })
            .cancel(self.cancel.clone())
    }
}

/// Options shared by every command that works on the site description
#[derive(Args, Debug, Clone)]
pub struct SiteArgs {
    /// Site description file
    #[arg(long, env = "EDGECLUSTERS_FILE")]
    pub config: Option<PathBuf>,

    /// Hub kubeconfig (default: in-cluster or ~/.kube/config)
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// File containing the pull secret
    #[arg(long, env = enricher::PULL_SECRET)]
    pub pull_secret: Option<String>,

    /// Cluster image set to install
    #[arg(long, env = enricher::CLUSTER_IMAGE_SET)]
    pub image_set: Option<String>,

    /// Mirror registry, `host[:port]`
    #[arg(long, env = enricher::REGISTRY)]
    pub registry: Option<String>,

    /// OpenShift version, e.g. `4.12.0`; derives the release tag, RHCOS
    /// release and default image set
    #[arg(long, env = enricher::OCP_VERSION)]
    pub ocp_version: Option<String>,

    /// DNS server, `ip:port`, used instead of the system ones to find the
    /// external addresses of edge clusters
    #[arg(long, hide = true)]
    pub resolver: Option<SocketAddr>,

    /// Directory holding the object templates
    #[arg(long, env = "ZTP_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,
}

impl SiteArgs {
    /// Load the site description named by `--config`
    pub fn load_config(&self) -> Result<Config> {
        let Some(file) = &self.config else {
            return Err(Error::command_failed(
                "Can't load configuration because the '--config' flag is empty and the \
                 'EDGECLUSTERS_FILE' environment variable isn't set",
            ));
        };
        if !file.exists() {
            return Err(Error::command_failed(format!(
                "Configuration file '{}' doesn't exist",
                file.display()
            )));
        }
        ztp_common::load(file.as_path()).map_err(|e| {
            Error::command_failed(format!(
                "Failed to load configuration file '{}': {}",
                file.display(),
                e
            ))
        })
    }

    /// Client for the hub
    pub async fn hub_client(&self) -> Result<Arc<Client>> {
        let mut builder = Client::builder();
        if let Some(path) = &self.kubeconfig {
            builder = builder.kubeconfig(KubeconfigSource::Path(path.clone()));
        }
        let client = builder
            .build()
            .await
            .map_err(|e| Error::command_failed(format!("Failed to create API client: {}", e)))?;
        Ok(Arc::new(client))
    }

    /// Complete `config` with generated and hub-discovered values
    pub async fn enrich(&self, hub: Arc<dyn HubClient>, config: &mut Config) -> Result<()> {
        let mut builder = Enricher::builder()
            .client(hub)
            .option_if_set(enricher::PULL_SECRET, self.pull_secret.clone())
            .option_if_set(enricher::CLUSTER_IMAGE_SET, self.image_set.clone())
            .option_if_set(enricher::REGISTRY, self.registry.clone())
            .option_if_set(enricher::OCP_VERSION, self.ocp_version.clone());
        if let Some(server) = self.resolver {
            builder = builder.resolver(Arc::new(HickoryResolver::with_server(server)));
        }
        let enricher = builder.build()?;
        enricher
            .enrich(config)
            .await
            .map_err(|e| Error::command_failed(format!("Failed to enrich configuration: {}", e)))
    }

    /// Load, connect to the hub and enrich, in that order
    pub async fn prepare(&self, ctx: &Context) -> Result<(Config, Arc<Client>)> {
        let mut config = self.load_config()?;
        let hub = self.hub_client().await?;
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(ztp_common::Error::cancelled("enrichment cancelled").into()),
            result = self.enrich(hub.clone(), &mut config) => result?,
        }
        Ok((config, hub))
    }

    /// Like [`SiteArgs::prepare`], for commands that log in to installed
    /// clusters: the generated SSH keys are replaced by the pair the cluster
    /// was installed with
    pub async fn prepare_installed(&self, ctx: &Context) -> Result<(Config, Arc<Client>)> {
        let (mut config, hub) = self.prepare(ctx).await?;
        for cluster in &mut config.clusters {
            use_installed_keys(hub.as_ref(), cluster).await?;
        }
        Ok((config, hub))
    }
}

/// Load the key pair stored in `<cluster>/<cluster>-keypair` into `cluster`
///
/// Leaves the keys alone when the secret doesn't exist.
pub async fn use_installed_keys(hub: &dyn HubClient, cluster: &mut Cluster) -> Result<()> {
    let name = format!("{}-keypair", cluster.name);
    let key = ObjectKey::namespaced(gvks::SECRET.gvk(), &cluster.name, &name);
    let secret = match hub.get(&key).await {
        Ok(secret) => secret,
        Err(e) if e.is_not_found() => {
            debug!(cluster = %cluster.name, "No stored SSH key pair, keeping generated keys");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let field = |field: &str| -> Result<Vec<u8>> {
        let encoded = secret.data["data"][field].as_str().unwrap_or_default();
        BASE64_STANDARD.decode(encoded).map_err(|e| {
            Error::command_failed(format!("field '{}' of secret '{}' isn't valid base64: {}", field, key, e))
        })
    };
    let public_key = field("id_rsa.pub")?;
    let private_key = field("id_rsa.key")?;
    if public_key.is_empty() || private_key.is_empty() {
        return Err(Error::command_failed(format!("secret '{}' doesn't contain an SSH key pair", key)));
    }
    cluster.ssh.public_key = public_key;
    cluster.ssh.private_key = private_key;
    info!(cluster = %cluster.name, secret = %key, "Loaded installed SSH keys");
    Ok(())
}

/// Parse `--wait` values: plain seconds, or a number with an `s`, `m` or `h`
/// suffix
pub fn parse_duration(text: &str) -> std::result::Result<Duration, String> {
    let text = text.trim();
    let (number, unit) = match text.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => text.split_at(split),
        None => (text, "s"),
    };
    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{}'", text))?;
    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        _ => return Err(format!("invalid duration unit in '{}', expected s, m or h", text)),
    };
    Ok(Duration::from_secs(seconds))
}

/// Human form of a duration for console messages
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    if seconds >= 3600 && seconds % 3600 == 0 {
        format!("{}h", seconds / 3600)
    } else if seconds >= 60 && seconds % 60 == 0 {
        format!("{}m", seconds / 60)
    } else {
        format!("{}s", seconds)
    }
}

/// Template data exposing one cluster as `Cluster`
///
/// Built as a map of references rather than a JSON value so the opaque byte
/// fields keep their byte form for the `base64` helper.
pub fn cluster_data(cluster: &Cluster) -> BTreeMap<&'static str, &Cluster> {
    BTreeMap::from([("Cluster", cluster)])
}

/// Kubeconfig of an installed cluster, or a failure naming it
pub fn require_kubeconfig(cluster: &Cluster) -> Result<KubeconfigSource> {
    if cluster.kubeconfig.is_empty() {
        return Err(Error::command_failed(format!(
            "kubeconfig for cluster '{}' isn't available",
            cluster.name
        )));
    }
    Ok(KubeconfigSource::Bytes(cluster.kubeconfig.clone()))
}

/// Private key of the cluster nodes, or a failure naming the cluster
pub fn require_ssh_key(cluster: &Cluster) -> Result<&[u8]> {
    if cluster.ssh.private_key.is_empty() {
        return Err(Error::command_failed(format!(
            "SSH key for cluster '{}' isn't available",
            cluster.name
        )));
    }
    Ok(&cluster.ssh.private_key)
}

/// Address of the first control-plane node with an external IP
pub fn ssh_host(cluster: &Cluster) -> Result<IpAddr> {
    cluster
        .control_plane_nodes()
        .into_iter()
        .find_map(|node| node.external_ip.map(|ip| ip.address))
        .ok_or_else(|| {
            Error::command_failed(format!(
                "failed to find SSH host for cluster '{}' because there is no control plane \
                 node that has an external IP address",
                cluster.name
            ))
        })
}

/// Client for an edge cluster, talking to it directly
pub async fn edge_client(cluster: &Cluster) -> Result<Client> {
    let kubeconfig = require_kubeconfig(cluster)?;
    Ok(Client::builder().kubeconfig(kubeconfig).build().await?)
}

/// Client for an edge cluster whose API is only reachable through SSH to
/// one of its control-plane nodes
pub async fn tunnelled_edge_client(cluster: &Cluster) -> Result<Client> {
    let kubeconfig = require_kubeconfig(cluster)?;
    let key = require_ssh_key(cluster)?;
    let host = ssh_host(cluster)?;
    debug!(cluster = %cluster.name, host = %host, "Tunnelling to edge cluster");
    Ok(Client::builder()
        .kubeconfig(kubeconfig)
        .ssh_server(host.to_string())
        .ssh_user(SSH_USER)
        .ssh_key(key.to_vec())
        .build()
        .await?)
}

/// Consume `watch` until `done` accepts one of the added or modified objects
pub async fn watch_until<F>(cancel: &CancellationToken, mut watch: Watch, mut done: F) -> Result<()>
where
    F: FnMut(&DynamicObject) -> Result<bool>,
{
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ztp_common::Error::cancelled("wait cancelled").into());
            }
            event = watch.next() => event,
        };
        match event {
            Some(WatchEvent::Added(object) | WatchEvent::Modified(object)) => {
                if done(&object)? {
                    return Ok(());
                }
            }
            Some(_) => {}
            None => return Err(Error::command_failed("watch ended before the wait was over")),
        }
    }
}

/// Run `task` for every cluster, reporting failures and carrying on
///
/// Fails at the end when any cluster failed.
pub async fn for_each_cluster<'a, F, Fut>(ctx: &Context, config: &'a Config, what: &str, mut task: F) -> Result<()>
where
    F: FnMut(&'a Cluster) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut failed = Vec::new();
    for cluster in &config.clusters {
        match task(cluster).await {
            Ok(()) => info!(cluster = %cluster.name, what = %what, "Cluster done"),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                ctx.console
                    .error(format_args!("Failed to {} for cluster '{}': {}", what, cluster.name, e));
                failed.push(cluster.name.as_str());
            }
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(Error::command_failed(format!(
            "Failed to {} for clusters {}",
            what,
            failed.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;
    use ztp_common::models::{Ip, Node};

    fn cluster_with(nodes: Vec<Node>) -> Cluster {
        let mut cluster = Cluster::new("edge");
        cluster.nodes = nodes;
        cluster
    }

    fn node(name: &str, ip: Option<&str>) -> Node {
        let mut node = Node::new(name);
        node.external_ip = ip.map(|ip| Ip::parse(ip).unwrap());
        node
    }

    fn object(name: &str, state: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "metal3.io/v1alpha1",
            "kind": "BareMetalHost",
            "metadata": {"name": name},
            "status": {"provisioning": {"state": state}},
        }))
        .unwrap()
    }

    // =========================================================================
    // Durations
    // =========================================================================

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("0"), Ok(Duration::ZERO));
        assert_eq!(parse_duration("45"), Ok(Duration::from_secs(45)));
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("60m"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration("2h"), Ok(Duration::from_secs(7200)));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("m").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(format_duration(Duration::from_secs(600)), "10m");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
    }

    // =========================================================================
    // Edge cluster preconditions
    // =========================================================================

    #[test]
    fn when_no_control_plane_has_external_ip_then_no_ssh_host() {
        let cluster = cluster_with(vec![node("master0", None), node("worker0", Some("10.0.0.9/24"))]);
        let err = ssh_host(&cluster).unwrap_err();
        assert!(err.to_string().contains("no control plane node"));
    }

    #[test]
    fn when_several_control_planes_then_first_with_ip_is_ssh_host() {
        let cluster = cluster_with(vec![
            node("master0", None),
            node("master1", Some("10.0.0.11/24")),
            node("master2", Some("10.0.0.12/24")),
        ]);
        assert_eq!(ssh_host(&cluster).unwrap().to_string(), "10.0.0.11");
    }

    #[test]
    fn when_cluster_not_installed_then_kubeconfig_is_required() {
        let mut cluster = cluster_with(vec![]);
        assert!(require_kubeconfig(&cluster)
            .unwrap_err()
            .to_string()
            .contains("kubeconfig for cluster 'edge'"));
        cluster.kubeconfig = b"apiVersion: v1".to_vec();
        assert!(matches!(require_kubeconfig(&cluster), Ok(KubeconfigSource::Bytes(_))));
        assert!(require_ssh_key(&cluster).is_err());
    }

    // =========================================================================
    // Waiting on watches
    // =========================================================================

    #[tokio::test]
    async fn story_watch_until_stops_at_first_accepted_object() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(WatchEvent::Added(object("master0", "registering"))).await.unwrap();
        tx.send(WatchEvent::Modified(object("master0", "provisioned"))).await.unwrap();
        let watch = Watch::from_channel(rx, CancellationToken::new());

        let mut seen = 0;
        watch_until(&CancellationToken::new(), watch, |object| {
            seen += 1;
            Ok(object.data["status"]["provisioning"]["state"] == "provisioned")
        })
        .await
        .unwrap();
        assert_eq!(seen, 2);
    }

    #[tokio::test]
    async fn story_watch_until_fails_when_stream_ends() {
        let (tx, rx) = mpsc::channel(8);
        drop(tx);
        let watch = Watch::from_channel(rx, CancellationToken::new());
        let err = watch_until(&CancellationToken::new(), watch, |_| Ok(false))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn story_watch_until_honours_cancel() {
        let (_tx, rx) = mpsc::channel::<WatchEvent>(8);
        let watch = Watch::from_channel(rx, CancellationToken::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = watch_until(&cancel, watch, |_| Ok(false)).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    // =========================================================================
    // Per-cluster tasks
    // =========================================================================

    #[tokio::test]
    async fn story_failing_cluster_does_not_stop_the_others() {
        let (console, _out, err) = crate::console::tests::console(false);
        let ctx = Context::new(Arc::new(console), CancellationToken::new());
        let config = Config {
            clusters: vec![Cluster::new("a"), Cluster::new("b"), Cluster::new("c")],
            ..Default::default()
        };

        let mut visited = Vec::new();
        let result = for_each_cluster(&ctx, &config, "create load balancer", |cluster| {
            visited.push(cluster.name.clone());
            let fail = cluster.name == "b";
            async move {
                if fail {
                    Err(Error::command_failed("boom"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(visited, ["a", "b", "c"]);
        assert!(result.unwrap_err().to_string().contains("clusters b"));
        assert_eq!(err.text(), "E: Failed to create load balancer for cluster 'b': boom\n");
    }
}
