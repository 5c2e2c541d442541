//! `ztp create ui` and `ztp delete ui`

use std::sync::Arc;

use clap::Args;
use serde_json::{json, Value};
use tracing::info;
use ztp_common::models::Cluster;

use super::{edge_client, for_each_cluster, Context, SiteArgs};
use crate::Result;

/// Options of the UI commands
#[derive(Args, Debug)]
pub struct UiArgs {
    #[command(flatten)]
    pub site: SiteArgs,
}

/// Run the create ui command.
pub async fn create(ctx: &Context, args: UiArgs) -> Result<()> {
    run(ctx, args, false).await
}

/// Run the delete ui command.
pub async fn delete(ctx: &Context, args: UiArgs) -> Result<()> {
    run(ctx, args, true).await
}

async fn run(ctx: &Context, args: UiArgs, delete: bool) -> Result<()> {
    let (config, hub) = args.site.prepare(ctx).await?;
    hub.close().await;

    let what = if delete { "delete UI components" } else { "create UI components" };
    let data_dir = &args.site.data_dir;
    for_each_cluster(ctx, &config, what, |cluster| async move {
        let data = ui_data(cluster);
        info!(cluster = %cluster.name, data = %data, "Calculated UI details");

        let client = Arc::new(edge_client(cluster).await?);
        let applier = ctx.applier(data_dir, "ui", client.clone()).build()?;
        let result = if delete {
            applier.delete(&data).await
        } else {
            applier.apply(&data).await
        };
        client.close().await;
        Ok(result?)
    })
    .await
}

/// Template data for the UI objects: the host name the UI is published at
pub fn ui_data(cluster: &Cluster) -> Value {
    json!({
        "Cluster": {"Name": cluster.name},
        "Host": format!("edge-cluster-setup.apps.{}.{}", cluster.name, cluster.dns.domain),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ui_host_uses_cluster_domain() {
        let mut cluster = Cluster::new("edge");
        cluster.dns.domain = "example.com".to_string();
        assert_eq!(
            ui_data(&cluster)["Host"],
            "edge-cluster-setup.apps.edge.example.com"
        );
    }
}
