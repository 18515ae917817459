use anyhow::Result;
use clap::Args;
use dse_core::archive;
use dse_core::tracking::path_within;
use std::path::Path;
use tracing::warn;

#[derive(Args)]
pub struct ApplyCommand {
    #[arg(short, long, help = "Path to the bundle archive")]
    bundle: String,

    #[arg(short, long, help = "Overwrite files with local modifications")]
    force: bool,
}

impl ApplyCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let (_manager, _entry, ctx) = super::resolve_context(cli.repo_flag())?;

        let bundle = archive::load(Path::new(&self.bundle))?;
        let stats = bundle.apply(self.force).await?;

        // Adopt tracked paths the bundle introduces, now that their files
        // exist in the working tree.
        let mut tracking = super::load_tracking(&ctx)?;
        let mut adopted = 0;
        for tracked in &bundle.repository.tracking_config.paths {
            if tracking.paths.iter().any(|p| p.path == tracked.path) {
                continue;
            }
            if !path_within(&tracked.path, &ctx.root) {
                warn!(path = %tracked.path.display(), "bundle tracks a path outside this repository, skipping");
                continue;
            }
            match tracking.add_path(&ctx.root, &tracked.path, tracked.excludes.clone()) {
                Ok(_) => adopted += 1,
                Err(e) => warn!(path = %tracked.path.display(), "could not adopt tracked path: {e}"),
            }
        }
        if adopted > 0 {
            tracking.save(&ctx.tracking_path())?;
        }

        println!("Applied bundle {}", bundle.id);
        println!("Written:  {}", stats.written);
        println!("Deleted:  {}", stats.deleted);
        if adopted > 0 {
            println!("Adopted {adopted} tracked path(s) from the bundle");
        }
        Ok(())
    }
}
