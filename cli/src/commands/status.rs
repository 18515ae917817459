use anyhow::Result;
use clap::Args;
use dse_core::bundle::diff_snapshots;
use dse_core::snapshot::{self, create_snapshot};

#[derive(Args)]
pub struct StatusCommand {}

impl StatusCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let (_manager, entry, ctx) = super::resolve_context(cli.repo_flag())?;
        let tracking = super::load_tracking(&ctx)?;

        println!("Repository: {} ({})", entry.name, entry.path.display());
        if tracking.is_closed() {
            let by = tracking.state.closed_by.as_deref().unwrap_or("unknown");
            println!("State:      closed by {by}");
        } else {
            println!("State:      open");
        }

        if tracking.paths.is_empty() {
            println!("No tracked paths.");
            return Ok(());
        }
        println!("Tracked paths:");
        for tracked in &tracking.paths {
            let kind = if tracked.is_dir { "dir " } else { "file" };
            print!("  {kind} {}", tracked.path.display());
            if !tracked.excludes.is_empty() {
                print!("  (excludes: {})", tracked.excludes.join(", "));
            }
            println!();
        }

        let Some(latest) = snapshot::latest(&ctx).await? else {
            println!("No snapshots yet.");
            return Ok(());
        };

        let current = create_snapshot(
            &tracking.paths,
            &super::current_user(),
            "",
            ctx.config.hash_algorithm,
        )?;
        let changes = diff_snapshots(Some(&latest), &current);
        if changes.is_empty() {
            println!("Working tree matches snapshot {}", latest.id);
        } else {
            println!("Changes since snapshot {}:", latest.id);
            for change in &changes {
                println!("  {:<7} {}", change.change_type.to_string(), change.path);
            }
        }
        Ok(())
    }
}
