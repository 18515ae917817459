use anyhow::Result;
use clap::Args;
use std::path::Path;

#[derive(Args)]
pub struct UntrackCommand {
    #[arg(required = true, help = "Paths to stop tracking")]
    paths: Vec<String>,
}

impl UntrackCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let (_manager, _entry, ctx) = super::resolve_context(cli.repo_flag())?;
        let mut tracking = super::load_tracking(&ctx)?;

        for path in &self.paths {
            let removed = tracking.remove_path(Path::new(path))?;
            println!("No longer tracking {}", removed.path.display());
        }
        tracking.save(&ctx.tracking_path())?;
        Ok(())
    }
}
