//! `ztp create metallb` and `ztp delete metallb`
//!
//! The load balancer lives on the edge cluster, whose API is only reachable
//! through an SSH tunnel to one of its control-plane nodes until the
//! load balancer itself publishes it.

use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use tracing::debug;
use ztp_common::models::Cluster;
use ztp_common::retry::{retry_with_backoff, RetryConfig};
use ztp_hub::client::ObjectKey;
use ztp_hub::{gvks, HubClient};

use super::{
    cluster_data, edge_client, for_each_cluster, format_duration, parse_duration, tunnelled_edge_client,
    Context, SiteArgs,
};
use crate::{Error, Result};

/// Create metal load balancers
#[derive(Args, Debug)]
pub struct CreateArgs {
    #[command(flatten)]
    pub site: SiteArgs,

    /// Time to wait till the API endpoints are reachable; zero disables
    /// waiting
    #[arg(long, short = 'w', default_value = "10m", value_parser = parse_duration)]
    pub wait: Duration,
}

/// Delete metal load balancers
#[derive(Args, Debug)]
pub struct DeleteArgs {
    #[command(flatten)]
    pub site: SiteArgs,
}

/// Run the create metallb command.
pub async fn create(ctx: &Context, args: CreateArgs) -> Result<()> {
    let (config, hub) = args.site.prepare_installed(ctx).await?;
    hub.close().await;

    let data_dir = &args.site.data_dir;
    let created = for_each_cluster(ctx, &config, "create load balancer", |cluster| async move {
        let client = Arc::new(tunnelled_edge_client(cluster).await?);
        let result = ctx
            .applier(data_dir, "metallb", client.clone())
            .build()?
            .apply(&cluster_data(cluster))
            .await;
        client.close().await;
        Ok(result?)
    })
    .await;

    if !args.wait.is_zero() {
        let wait = format_duration(args.wait);
        ctx.console
            .info(format_args!("Waiting up to {} for API endpoints to be reachable", wait));
        let reachable = async {
            for cluster in &config.clusters {
                ctx.console.info(format_args!(
                    "Waiting for API endpoint of cluster '{}' to be reachable",
                    cluster.name
                ));
                wait_reachable(cluster).await?;
                ctx.console.info(format_args!(
                    "API endpoint of cluster '{}' is now reachable",
                    cluster.name
                ));
            }
            Ok::<_, Error>(())
        };
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(ztp_common::Error::cancelled("wait cancelled").into()),
            result = tokio::time::timeout(args.wait, reachable) => result.map_err(|_| {
                Error::command_failed(format!("API endpoints aren't reachable after waiting for {}", wait))
            })??,
        }
    }

    created
}

/// Run the delete metallb command.
pub async fn delete(ctx: &Context, args: DeleteArgs) -> Result<()> {
    let (config, hub) = args.site.prepare_installed(ctx).await?;
    hub.close().await;

    let data_dir = &args.site.data_dir;
    for_each_cluster(ctx, &config, "delete load balancer", |cluster| async move {
        let client = Arc::new(tunnelled_edge_client(cluster).await?);
        let result = ctx
            .applier(data_dir, "metallb", client.clone())
            .build()?
            .delete(&cluster_data(cluster))
            .await;
        client.close().await;
        Ok(result?)
    })
    .await
}

/// Retry a trivial read against the cluster API, without the tunnel, until
/// it succeeds
async fn wait_reachable(cluster: &Cluster) -> Result<()> {
    let client = edge_client(cluster).await?;
    let key = ObjectKey::cluster(gvks::NAMESPACE.gvk(), "kube-public");
    let result = retry_with_backoff(&RetryConfig::watch_restart(), "api_reachable", || {
        let client = &client;
        let key = &key;
        async move {
            client.get(key).await.inspect_err(|e| {
                debug!(cluster = %cluster.name, error = %e, "API check failed, will retry");
            })
        }
    })
    .await;
    client.close().await;
    result?;
    Ok(())
}
