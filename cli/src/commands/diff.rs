use anyhow::{anyhow, Result};
use clap::Args;
use dse_core::bundle::diff_snapshots;
use dse_core::snapshot;

#[derive(Args)]
pub struct DiffCommand {
    #[arg(help = "Source snapshot id (default: second-newest)")]
    source: Option<String>,

    #[arg(help = "Target snapshot id (default: newest)")]
    target: Option<String>,
}

impl DiffCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let (_manager, _entry, ctx) = super::resolve_context(cli.repo_flag())?;
        let ids = snapshot::list(&ctx).await?;

        let target_id = match &self.target {
            Some(id) => id.clone(),
            None => ids
                .last()
                .cloned()
                .ok_or_else(|| anyhow!("repository has no snapshots"))?,
        };
        let source_id = match &self.source {
            Some(id) => id.clone(),
            None => {
                let mut earlier = ids.iter().filter(|id| **id < target_id);
                earlier
                    .next_back()
                    .cloned()
                    .ok_or_else(|| anyhow!("no snapshot precedes {target_id}; nothing to diff"))?
            }
        };

        let source = snapshot::load(&ctx, &source_id).await?;
        let target = snapshot::load(&ctx, &target_id).await?;
        let changes = diff_snapshots(Some(&source), &target);

        if changes.is_empty() {
            println!("No changes between {source_id} and {target_id}");
            return Ok(());
        }
        println!("Changes from {source_id} to {target_id}:");
        for change in &changes {
            println!("  {:<7} {}", change.change_type.to_string(), change.path);
        }
        println!("{} change(s)", changes.len());
        Ok(())
    }
}
