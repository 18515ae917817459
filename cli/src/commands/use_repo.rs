use anyhow::{anyhow, Result};
use clap::Args;
use dse_core::repos::RepoManager;

#[derive(Args)]
pub struct UseCommand {
    #[arg(help = "Repository name or path")]
    repo: Option<String>,

    #[arg(long, conflicts_with = "repo", help = "Clear the working repository")]
    clear: bool,
}

impl UseCommand {
    pub async fn run(&self, _cli: &crate::Cli) -> Result<()> {
        let store = super::global_store()?;
        let mut manager = RepoManager::new(&store)?;

        if self.clear {
            manager.clear_working()?;
            println!("Working repository cleared");
            return Ok(());
        }
        let repo = self
            .repo
            .as_deref()
            .ok_or_else(|| anyhow!("pass a repository, or --clear"))?;
        manager.set_working(repo)?;
        println!("Working repository set to '{repo}'");
        Ok(())
    }
}
