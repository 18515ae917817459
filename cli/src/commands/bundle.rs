use anyhow::{anyhow, Result};
use clap::Args;
use dse_core::{archive, snapshot, Bundle};

#[derive(Args)]
pub struct BundleCommand {
    #[arg(long, help = "Source snapshot id (omit with --initial)")]
    source: Option<String>,

    #[arg(long, help = "Target snapshot id (default: newest)")]
    target: Option<String>,

    #[arg(long, help = "Build an initial bundle carrying every tracked file")]
    initial: bool,

    #[arg(short, long, help = "Bundle description")]
    description: Option<String>,
}

impl BundleCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        if self.initial && self.source.is_some() {
            return Err(anyhow!("--initial and --source are mutually exclusive"));
        }
        let (_manager, _entry, ctx) = super::resolve_context(cli.repo_flag())?;
        let tracking = super::load_tracking(&ctx)?;
        let ids = snapshot::list(&ctx).await?;

        let target_id = match &self.target {
            Some(id) => id.clone(),
            None => ids
                .last()
                .cloned()
                .ok_or_else(|| anyhow!("repository has no snapshots"))?,
        };
        let target = snapshot::load(&ctx, &target_id).await?;

        let source = if self.initial {
            None
        } else {
            let source_id = match &self.source {
                Some(id) => id.clone(),
                None => ids
                    .iter()
                    .filter(|id| **id < target_id)
                    .next_back()
                    .cloned()
                    .ok_or_else(|| {
                        anyhow!("no snapshot precedes {target_id}; pass --initial for a full bundle")
                    })?,
            };
            Some(snapshot::load(&ctx, &source_id).await?)
        };

        let bundle = Bundle::create(
            &ctx,
            &tracking,
            source.as_ref(),
            &target,
            &super::current_user(),
            self.description.clone(),
        )
        .await?;

        let path = ctx.bundles_dir().join(archive::archive_name(&bundle.id));
        archive::pack(&bundle, &path)?;

        println!("Bundle {} written to {}", bundle.id, path.display());
        println!("Changes:  {}", bundle.changes.len());
        println!("Initial:  {}", bundle.is_initial);
        println!("Target:   {}", bundle.target_snapshot);
        if let Some(source) = &bundle.source_snapshot {
            println!("Source:   {source}");
        }
        Ok(())
    }
}
