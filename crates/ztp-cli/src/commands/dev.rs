//! `ztp dev apply` and `ztp dev delete` - run the applier on any template
//! directory against the hub

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use ztp_common::template::DirFs;
use ztp_common::Config;
use ztp_hub::Applier;

use super::{Context, SiteArgs};
use crate::Result;

/// Options of the developer commands
#[derive(Args, Debug)]
pub struct DevArgs {
    /// Directory containing the templates of the objects
    #[arg(long)]
    pub dir: PathBuf,

    #[command(flatten)]
    pub site: SiteArgs,
}

/// Run the dev apply command.
pub async fn apply(ctx: &Context, args: DevArgs) -> Result<()> {
    run(ctx, args, false).await
}

/// Run the dev delete command.
pub async fn delete(ctx: &Context, args: DevArgs) -> Result<()> {
    run(ctx, args, true).await
}

async fn run(ctx: &Context, args: DevArgs, delete: bool) -> Result<()> {
    // The site description is optional here; templates see it as loaded
    let config = match &args.site.config {
        Some(_) => args.site.load_config()?,
        None => Config::default(),
    };
    let hub = args.site.hub_client().await?;

    let applier = Applier::builder()
        .client(hub.clone())
        .fs(Arc::new(DirFs::new(&args.dir)))
        .root(".")
        .listener({
            let listener = ctx.console.applier_listener().into_listener();
            move |event: &ztp_hub::ApplierEvent| listener(event)
        })
        .cancel(ctx.cancel.clone())
        .build()?;
    let result = if delete {
        applier.delete(&config).await
    } else {
        applier.apply(&config).await
    };
    hub.close().await;
    Ok(result?)
}
