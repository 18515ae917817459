use anyhow::{anyhow, Result};
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct TrackCommand {
    #[arg(required = true, help = "Paths to track (or whose excludes to modify)")]
    paths: Vec<String>,

    #[arg(long, help = "Exclude patterns (directories only)")]
    exclude: Vec<String>,

    #[arg(
        long,
        conflicts_with = "remove_excludes",
        help = "Add the --exclude patterns to already-tracked directories"
    )]
    add_excludes: bool,

    #[arg(
        long,
        conflicts_with = "add_excludes",
        help = "Remove the --exclude patterns from already-tracked directories"
    )]
    remove_excludes: bool,
}

impl TrackCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let (_manager, _entry, ctx) = super::resolve_context(cli.repo_flag())?;
        let mut tracking = super::load_tracking(&ctx)?;
        let paths: Vec<PathBuf> = self.paths.iter().map(PathBuf::from).collect();

        if self.add_excludes || self.remove_excludes {
            if self.exclude.is_empty() {
                return Err(anyhow!("no patterns given; pass them with --exclude"));
            }
            if self.add_excludes {
                tracking.add_excludes(&paths, &self.exclude)?;
                println!("Added {} pattern(s) to {} path(s)", self.exclude.len(), paths.len());
            } else {
                tracking.remove_excludes(&paths, &self.exclude)?;
                println!("Removed {} pattern(s) from {} path(s)", self.exclude.len(), paths.len());
            }
            tracking.save(&ctx.tracking_path())?;
            return Ok(());
        }

        for path in &paths {
            let tracked = tracking.add_path(&ctx.root, path, self.exclude.clone())?;
            let kind = if tracked.is_dir { "directory" } else { "file" };
            println!("Tracking {kind} {}", tracked.path.display());
        }
        tracking.save(&ctx.tracking_path())?;
        Ok(())
    }
}
