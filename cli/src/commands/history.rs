use anyhow::Result;
use clap::Args;
use dse_core::snapshot;

#[derive(Args)]
pub struct HistoryCommand {
    #[arg(short, long, help = "Show at most this many snapshots")]
    limit: Option<usize>,
}

impl HistoryCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let (_manager, _entry, ctx) = super::resolve_context(cli.repo_flag())?;
        let mut ids = snapshot::list(&ctx).await?;
        if ids.is_empty() {
            println!("No snapshots.");
            return Ok(());
        }

        ids.reverse(); // newest first
        if let Some(limit) = self.limit {
            ids.truncate(limit);
        }
        for id in &ids {
            let snap = snapshot::load(&ctx, id).await?;
            println!(
                "{}  {}  {} file(s), {} bytes  {}",
                snap.id,
                snap.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
                snap.stats.total_files,
                snap.stats.total_size,
                snap.user,
            );
            if !snap.message.is_empty() {
                println!("    {}", snap.message);
            }
        }
        Ok(())
    }
}
