use anyhow::{anyhow, Result};
use clap::Args;
use dse_core::snapshot;
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Args)]
pub struct SnapshotCommand {
    #[arg(short, long, help = "Snapshot message", default_value = "")]
    message: String,
}

impl SnapshotCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let (_manager, _entry, ctx) = super::resolve_context(cli.repo_flag())?;
        let tracking = super::load_tracking(&ctx)?;
        if tracking.paths.is_empty() {
            return Err(anyhow!("nothing is tracked; add paths with `dse track` first"));
        }

        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")?,
        );
        pb.set_message("Walking tracked paths...");

        let snap = snapshot::create_snapshot(
            &tracking.paths,
            &super::current_user(),
            &self.message,
            ctx.config.hash_algorithm,
        )?;
        snapshot::save(&ctx, &snap).await?;

        pb.finish_with_message(format!("Snapshot {} recorded", snap.id));
        println!("Files:    {}", snap.stats.total_files);
        println!("Size:     {} bytes", snap.stats.total_size);
        println!("Symlinks: {}", snap.stats.symlink_count);
        println!("Excluded: {}", snap.stats.excluded_files);
        println!("Took:     {} ms", snap.stats.processing_time_ms);
        Ok(())
    }
}
