//! `ztp create cluster` and `ztp delete cluster`
//!
//! Clusters are installed by the hub: creating one means applying the
//! cluster templates there and, optionally, watching the hosts provision and
//! the installation complete.

use std::collections::BTreeSet;
use std::time::Duration;

use clap::Args;
use tracing::{debug, info};
use ztp_common::models::Cluster;
use ztp_common::query::Query;
use ztp_hub::client::ListOptions;
use ztp_hub::{gvks, labels, HubClient};

use super::{cluster_data, format_duration, parse_duration, watch_until, Context, SiteArgs};
use crate::{Error, Result};

const PROVISIONING_STATE: &str = "try .status.provisioning.state";
const INSTALL_COMPLETED: &str = r#"try .status.conditions[] | select(.type == "Completed") | .status"#;

/// Create clusters
#[derive(Args, Debug)]
pub struct CreateArgs {
    #[command(flatten)]
    pub site: SiteArgs,

    /// Time to wait till the clusters are ready; zero disables waiting
    #[arg(long, short = 'w', default_value = "60m", value_parser = parse_duration)]
    pub wait: Duration,
}

/// Delete clusters
#[derive(Args, Debug)]
pub struct DeleteArgs {
    #[command(flatten)]
    pub site: SiteArgs,
}

/// Run the create cluster command.
pub async fn create(ctx: &Context, args: CreateArgs) -> Result<()> {
    let (config, hub) = args.site.prepare(ctx).await?;
    let applier = ctx
        .applier(&args.site.data_dir, "cluster", hub.clone())
        .labels(labels::managed())
        .build()?;

    for cluster in &config.clusters {
        info!(cluster = %cluster.name, "Deploying cluster");
        applier.apply(&cluster_data(cluster)).await.map_err(|e| {
            Error::command_failed(format!("Failed to deploy cluster '{}': {}", cluster.name, e))
        })?;
    }

    if !args.wait.is_zero() {
        let wait = format_duration(args.wait);
        ctx.console
            .info(format_args!("Waiting up to {} for clusters to be ready", wait));
        let ready = async {
            for cluster in &config.clusters {
                wait_hosts(ctx, hub.as_ref(), cluster).await?;
                wait_install(ctx, hub.as_ref(), cluster).await?;
            }
            Ok::<_, Error>(())
        };
        tokio::time::timeout(args.wait, ready).await.map_err(|_| {
            Error::command_failed(format!("Clusters aren't ready after waiting for {}", wait))
        })??;
    }

    hub.close().await;
    Ok(())
}

/// Run the delete cluster command.
pub async fn delete(ctx: &Context, args: DeleteArgs) -> Result<()> {
    let (config, hub) = args.site.prepare(ctx).await?;
    let applier = ctx
        .applier(&args.site.data_dir, "cluster", hub.clone())
        .labels(labels::managed())
        .build()?;

    for cluster in &config.clusters {
        info!(cluster = %cluster.name, "Deleting cluster");
        applier.delete(&cluster_data(cluster)).await.map_err(|e| {
            Error::command_failed(format!("Failed to delete cluster '{}': {}", cluster.name, e))
        })?;
    }

    hub.close().await;
    Ok(())
}

/// Wait till every BareMetalHost of the cluster reports `provisioned`
async fn wait_hosts(ctx: &Context, hub: &dyn HubClient, cluster: &Cluster) -> Result<()> {
    ctx.console.info(format_args!(
        "Waiting for hosts of cluster '{}' to be provisioned",
        cluster.name
    ));

    let options = ListOptions::in_namespace(&cluster.name);
    let hosts = hub.list(&gvks::BARE_METAL_HOST.gvk(), &options).await?;
    let mut pending: BTreeSet<String> = hosts
        .into_iter()
        .filter_map(|host| host.metadata.name)
        .collect();
    if pending.is_empty() {
        debug!(cluster = %cluster.name, "Cluster has no hosts to wait for");
        return Ok(());
    }

    let state = Query::compile(PROVISIONING_STATE)?;
    let watch = hub.watch(&gvks::BARE_METAL_HOST.gvk(), &options).await?;
    watch_until(&ctx.cancel, watch, |host| {
        let current: Option<String> = state.extract(host)?;
        let Some(name) = host.metadata.name.as_deref() else {
            return Ok(false);
        };
        if current.as_deref() == Some("provisioned") && pending.remove(name) {
            ctx.console.info(format_args!(
                "Host '{}' of cluster '{}' is provisioned",
                name, cluster.name
            ));
        }
        Ok(pending.is_empty())
    })
    .await
}

/// Wait till the AgentClusterInstall of the cluster reports `Completed`
async fn wait_install(ctx: &Context, hub: &dyn HubClient, cluster: &Cluster) -> Result<()> {
    ctx.console.info(format_args!(
        "Waiting for installation of cluster '{}' to be completed",
        cluster.name
    ));

    let completed = Query::compile(INSTALL_COMPLETED)?;
    let options = ListOptions::in_namespace(&cluster.name).fields(&format!("metadata.name={}", cluster.name));
    let watch = hub.watch(&gvks::AGENT_CLUSTER_INSTALL.gvk(), &options).await?;
    watch_until(&ctx.cancel, watch, |install| {
        let status: Option<String> = completed.extract(install)?;
        Ok(status.as_deref() == Some("True"))
    })
    .await?;

    ctx.console
        .info(format_args!("Cluster '{}' is installed", cluster.name));
    Ok(())
}
