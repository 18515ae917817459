use anyhow::{anyhow, Result};
use clap::Args;
use dse_core::repos::RepoManager;
use dse_core::{HashAlgorithm, RepoConfig, RepoContext};
use tracing::info;

#[derive(Args)]
pub struct InitCommand {
    #[arg(help = "Repository root (default: current directory)")]
    path: Option<String>,

    #[arg(long, help = "Repository name (default: directory name)")]
    name: Option<String>,

    #[arg(long, help = "Metadata directory name", default_value = ".dsp")]
    dsp_dir: String,

    #[arg(long, help = "Hash algorithm (blake3, sha256, sha512)")]
    hash_algorithm: Option<String>,

    #[arg(long, help = "Compression level (1-9)")]
    compression_level: Option<i32>,

    #[arg(short = 'D', long, help = "Set as the default repository")]
    default: bool,
}

impl InitCommand {
    pub async fn run(&self, _cli: &crate::Cli) -> Result<()> {
        let root = match &self.path {
            Some(path) => std::path::PathBuf::from(path),
            None => std::env::current_dir()?,
        };
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;

        let name = match &self.name {
            Some(name) => name.clone(),
            None => root
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .ok_or_else(|| anyhow!("cannot derive a repository name from {}", root.display()))?,
        };

        let mut config = RepoConfig {
            dsp_dir: self.dsp_dir.clone(),
            data_dir: self.dsp_dir.clone(),
            ..Default::default()
        };
        if let Some(algo) = &self.hash_algorithm {
            config.hash_algorithm = algo.parse::<HashAlgorithm>()?;
        }
        if let Some(level) = self.compression_level {
            config.compression_level = level;
        }

        let ctx = RepoContext::init(&root, &name, config)?;
        info!(root = %root.display(), "repository initialized");

        let store = super::global_store()?;
        let mut manager = RepoManager::new(&store)?;
        manager.register(&root, &name, self.default, &ctx.config.dsp_dir)?;

        println!("Initialized repository '{name}' at {}", root.display());
        println!("Metadata directory: {}", ctx.dsp_path().display());
        Ok(())
    }
}
