//! `ztp create lso`
//!
//! Deploys the local storage operator on an edge cluster, backed by the
//! storage disks of the control-plane nodes. Every control-plane node must
//! list the same disks because a single LocalVolume selects them by path on
//! all nodes. Disks can be wiped first, over SSH, with the `wipe.sh` script
//! of the template tree.

use std::sync::Arc;

use async_trait::async_trait;
use clap::Args;
use serde_json::{json, Value};
use tracing::{debug, info};
use ztp_common::models::{Cluster, Node};
use ztp_common::query::Query;
use ztp_common::template::{DirFs, TemplateEngine};
use ztp_hub::client::{gvk_of, ExecOutput, ListOptions, ObjectKey, RemoteExec, SshTunnel};
use ztp_hub::{gvks, HubClient};

use super::{edge_client, for_each_cluster, require_kubeconfig, require_ssh_key, Context, SiteArgs, SSH_USER};
use crate::{Error, Result};

#[cfg(test)]
use mockall::automock;

const VOLUME_AVAILABLE: &str = r#".status.conditions[]? | select(.type == "Available") | .status"#;

/// Create the local storage operator
#[derive(Args, Debug)]
pub struct CreateArgs {
    #[command(flatten)]
    pub site: SiteArgs,

    /// Wipe the storage disks before handing them to the operator
    #[arg(long)]
    pub wipe: bool,
}

/// Run the create lso command.
pub async fn create(ctx: &Context, args: CreateArgs) -> Result<()> {
    let (config, hub) = args.site.prepare_installed(ctx).await?;
    hub.close().await;

    let args = &args;
    for_each_cluster(ctx, &config, "create local storage operator", |cluster| async move {
        deploy(ctx, args, cluster).await
    })
    .await
}

async fn deploy(ctx: &Context, args: &CreateArgs, cluster: &Cluster) -> Result<()> {
    require_kubeconfig(cluster)?;
    let key = require_ssh_key(cluster)?;
    let disks = storage_disks(cluster)?;

    if args.wipe {
        let engine = TemplateEngine::new(&DirFs::new(&args.site.data_dir), "lso/scripts")?;
        let shell = SshShell { key };
        for node in cluster.control_plane_nodes() {
            ctx.console.info(format_args!(
                "Wiping disks of node '{}' of cluster '{}'",
                node.name, cluster.name
            ));
            wipe_disks(&engine, &shell, node).await?;
        }
    } else {
        ctx.console.warn(format_args!(
            "Will not wipe the disks of cluster '{}', to enable it add the '--wipe' flag",
            cluster.name
        ));
    }

    let client = Arc::new(edge_client(cluster).await?);
    let result = apply_and_wait(ctx, args, client.clone(), cluster, disks).await;
    client.close().await;
    result
}

async fn apply_and_wait(
    ctx: &Context,
    args: &CreateArgs,
    client: Arc<dyn HubClient>,
    cluster: &Cluster,
    disks: Vec<String>,
) -> Result<()> {
    let applier = ctx.applier(&args.site.data_dir, "lso", client.clone()).build()?;
    let data = lso_data(cluster, disks);
    info!(cluster = %cluster.name, data = %data, "Calculated local storage details");

    let volume = applier
        .render(&data)?
        .into_iter()
        .find(|object| gvk_of(object).is_ok_and(|gvk| gvks::LOCAL_VOLUME.matches(&gvk)))
        .ok_or_else(|| Error::command_failed("the templates don't produce a local volume"))?;
    applier.apply(&data).await?;

    let key = ObjectKey::of(&volume)?;
    ctx.console.info(format_args!(
        "Waiting for local volume '{}' of cluster '{}' to be available",
        key.name, cluster.name
    ));
    let available = Query::compile(VOLUME_AVAILABLE)?;
    let mut options = ListOptions::default().fields(&format!("metadata.name={}", key.name));
    options.namespace = key.namespace.clone();
    let watch = client.watch(&key.gvk, &options).await?;
    super::watch_until(&ctx.cancel, watch, |volume| {
        let status: Option<String> = available.extract(volume)?;
        Ok(status.as_deref() == Some("True"))
    })
    .await?;
    ctx.console.info(format_args!(
        "Local volume '{}' of cluster '{}' is now available",
        key.name, cluster.name
    ));
    Ok(())
}

/// Sorted storage disks shared by every control-plane node
///
/// Fails when there are no control-plane nodes, when any of them lacks an
/// external address, or when their disk sets differ.
pub fn storage_disks(cluster: &Cluster) -> Result<Vec<String>> {
    let nodes = cluster.control_plane_nodes();
    let Some(first) = nodes.first() else {
        return Err(invalid(cluster, "there are no control plane nodes"));
    };

    let missing: Vec<&str> = nodes
        .iter()
        .filter(|node| node.external_ip.is_none())
        .map(|node| node.name.as_str())
        .collect();
    match missing.as_slice() {
        [] => {}
        [one] => {
            return Err(invalid(cluster, format!(
                "IP address of node '{}' isn't available",
                one
            )))
        }
        many => {
            return Err(invalid(cluster, format!(
                "IP addresses of nodes {} aren't available",
                quoted(many)
            )))
        }
    }

    let expected = sorted(&first.storage_disks);
    for node in &nodes[1..] {
        let disks = sorted(&node.storage_disks);
        if disks != expected {
            return Err(invalid(cluster, format!(
                "all control plane nodes should have the same storage disks, but node '{}' has {} \
                 and node '{}' has {}",
                first.name,
                quoted(&expected),
                node.name,
                quoted(&disks)
            )));
        }
    }
    Ok(expected)
}

/// Template data for the local storage objects
pub fn lso_data(cluster: &Cluster, disks: Vec<String>) -> Value {
    let mut hostnames: Vec<&str> = cluster
        .control_plane_nodes()
        .into_iter()
        .map(|node| node.hostname.as_str())
        .collect();
    hostnames.sort_unstable();
    json!({
        "Hostnames": hostnames,
        "Disks": disks,
    })
}

fn invalid(cluster: &Cluster, message: impl Into<String>) -> Error {
    ztp_common::Error::validation_for(&cluster.name, message).into()
}

/// Runs scripts on edge nodes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeShell: Send + Sync {
    /// Run `script` on the node reachable at `host`
    async fn run(&self, host: &str, script: &str) -> Result<ExecOutput>;
}

/// Opens an SSH session per script
struct SshShell<'a> {
    key: &'a [u8],
}

#[async_trait]
impl NodeShell for SshShell<'_> {
    async fn run(&self, host: &str, script: &str) -> Result<ExecOutput> {
        let tunnel = SshTunnel::connect(&[host.to_string()], SSH_USER, self.key).await?;
        let output = tunnel.exec(script).await;
        tunnel.close().await;
        Ok(output?)
    }
}

/// Render the wipe script for the disks of `node` and run it there
pub async fn wipe_disks(engine: &TemplateEngine, shell: &dyn NodeShell, node: &Node) -> Result<()> {
    let Some(ip) = node.external_ip else {
        return Err(Error::command_failed(format!(
            "IP address of node '{}' isn't available",
            node.name
        )));
    };
    let host = ip.address.to_string();
    let script = engine.render("wipe.sh", &json!({"Disks": node.storage_disks}))?;
    debug!(node = %node.name, host = %host, disks = ?node.storage_disks, script = %script, "Generated script to wipe disks");

    let output = shell.run(&host, &script).await?;
    debug!(
        node = %node.name,
        stdout = %String::from_utf8_lossy(&output.stdout),
        stderr = %String::from_utf8_lossy(&output.stderr),
        "Executed script to wipe disks"
    );
    if !output.success() {
        return Err(Error::command_failed(format!(
            "script to wipe disks of node '{}' failed with status {}: {}",
            node.name,
            output
                .exit_status
                .map(|status| status.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

fn sorted(disks: &[String]) -> Vec<String> {
    let mut disks = disks.to_vec();
    disks.sort();
    disks
}

fn quoted<S: AsRef<str>>(items: &[S]) -> String {
    items
        .iter()
        .map(|item| format!("'{}'", item.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use ztp_common::models::Ip;
    use ztp_common::template::MemoryFs;

    fn node(name: &str, ip: Option<&str>, disks: &[&str]) -> Node {
        let mut node = Node::new(name);
        node.hostname = format!("ztpfw-edge-master-{}", node.index());
        node.external_ip = ip.map(|ip| Ip::parse(ip).unwrap());
        node.storage_disks = disks.iter().map(|d| d.to_string()).collect();
        node
    }

    fn cluster(nodes: Vec<Node>) -> Cluster {
        let mut cluster = Cluster::new("edge");
        cluster.nodes = nodes;
        cluster
    }

    fn finished(status: u32) -> ExecOutput {
        ExecOutput {
            exit_status: Some(status),
            stdout: Vec::new(),
            stderr: b"wipefs: permission denied\n".to_vec(),
        }
    }

    // =========================================================================
    // Storage disk checks
    // =========================================================================

    #[test]
    fn when_disk_sets_match_in_any_order_then_sorted_disks_are_used() {
        let cluster = cluster(vec![
            node("master0", Some("10.0.0.10/24"), &["/dev/sdc", "/dev/sdb"]),
            node("master1", Some("10.0.0.11/24"), &["/dev/sdb", "/dev/sdc"]),
            node("worker0", None, &[]),
        ]);
        assert_eq!(storage_disks(&cluster).unwrap(), ["/dev/sdb", "/dev/sdc"]);
    }

    #[test]
    fn when_disk_sets_differ_then_deployment_fails_before_wiping() {
        let cluster = cluster(vec![
            node("master0", Some("10.0.0.10/24"), &["/dev/sdb"]),
            node("master1", Some("10.0.0.11/24"), &["/dev/sdb"]),
            node("master2", Some("10.0.0.12/24"), &["/dev/sdb", "/dev/sdc"]),
        ]);
        let (name, message) = match storage_disks(&cluster) {
            Err(Error::Core(ztp_common::Error::Validation { cluster, message })) => (cluster, message),
            other => panic!("expected a validation error, got {other:?}"),
        };
        assert_eq!(name, "edge");
        assert!(message.contains("node 'master0' has '/dev/sdb'"));
        assert!(message.contains("node 'master2' has '/dev/sdb', '/dev/sdc'"));
    }

    #[test]
    fn when_nodes_lack_addresses_then_they_are_named() {
        let one = cluster(vec![node("master0", None, &[])]);
        assert_eq!(
            storage_disks(&one).unwrap_err().to_string(),
            "validation error for edge: IP address of node 'master0' isn't available"
        );

        let two = cluster(vec![node("master0", None, &[]), node("master1", None, &[])]);
        assert_eq!(
            storage_disks(&two).unwrap_err().to_string(),
            "validation error for edge: IP addresses of nodes 'master0', 'master1' aren't available"
        );

        let none = cluster(vec![node("worker0", None, &[])]);
        assert!(matches!(
            storage_disks(&none),
            Err(Error::Core(ztp_common::Error::Validation { .. }))
        ));
    }

    #[test]
    fn test_lso_data_sorts_hostnames() {
        let cluster = cluster(vec![
            node("master1", None, &[]),
            node("master0", None, &[]),
        ]);
        let data = lso_data(&cluster, vec!["/dev/sdb".to_string()]);
        assert_eq!(
            data,
            json!({
                "Hostnames": ["ztpfw-edge-master-0", "ztpfw-edge-master-1"],
                "Disks": ["/dev/sdb"],
            })
        );
    }

    // =========================================================================
    // Wiping
    // =========================================================================

    fn wipe_engine() -> TemplateEngine {
        let fs = MemoryFs::new().with_file(
            "lso/scripts/wipe.sh",
            "{% for disk in Disks %}sudo wipefs -a {{ disk }}\n{% endfor %}",
        );
        TemplateEngine::new(&fs, "lso/scripts").unwrap()
    }

    #[tokio::test]
    async fn story_wipe_script_runs_on_the_node_address() {
        let mut shell = MockNodeShell::new();
        shell
            .expect_run()
            .with(
                eq("10.0.0.10"),
                eq("sudo wipefs -a /dev/sdb\nsudo wipefs -a /dev/sdc\n"),
            )
            .times(1)
            .returning(|_, _| Ok(finished(0)));

        let node = node("master0", Some("10.0.0.10/24"), &["/dev/sdb", "/dev/sdc"]);
        wipe_disks(&wipe_engine(), &shell, &node).await.unwrap();
    }

    #[tokio::test]
    async fn story_failed_wipe_reports_status_and_stderr() {
        let mut shell = MockNodeShell::new();
        shell.expect_run().returning(|_, _| Ok(finished(1)));

        let node = node("master0", Some("10.0.0.10/24"), &["/dev/sdb"]);
        let err = wipe_disks(&wipe_engine(), &shell, &node).await.unwrap_err().to_string();
        assert!(err.contains("node 'master0' failed with status 1"));
        assert!(err.contains("permission denied"));
    }

    #[tokio::test]
    async fn when_node_has_no_address_then_nothing_runs() {
        let mut shell = MockNodeShell::new();
        shell.expect_run().never();

        let node = node("master0", None, &["/dev/sdb"]);
        let err = wipe_disks(&wipe_engine(), &shell, &node).await.unwrap_err();
        assert_eq!(err.to_string(), "IP address of node 'master0' isn't available");
    }
}
