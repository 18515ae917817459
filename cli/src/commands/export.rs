use anyhow::{anyhow, Result};
use clap::Args;
use dse_core::archive;
use dse_transport::{ExportAuth, ExportServer, ExportServerConfig};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Args)]
pub struct ExportCommand {
    #[arg(help = "Bundle id or path to a bundle archive")]
    bundle: String,

    #[arg(
        short,
        long,
        conflicts_with = "user",
        help = "Password authentication (downloads are token-gated and encrypted)"
    )]
    password: Option<String>,

    #[arg(
        short,
        long,
        conflicts_with = "password",
        help = "Comma-separated user list (no encryption)"
    )]
    user: Option<String>,

    #[arg(long, default_value_t = 9443, help = "Port to listen on")]
    port: u16,

    #[arg(short, long, help = "Number of allowed downloads")]
    number: usize,

    #[arg(long, default_value_t = 3600, help = "Server timeout in seconds")]
    timeout: u64,
}

impl ExportCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let auth = match (&self.password, &self.user) {
            (Some(password), None) => ExportAuth::Password(password.clone()),
            (None, Some(users)) => ExportAuth::Users(
                users
                    .split(',')
                    .map(|u| u.trim().to_string())
                    .filter(|u| !u.is_empty())
                    .collect(),
            ),
            _ => return Err(anyhow!("specify exactly one of --password or --user")),
        };

        let bundle_path = self.resolve_bundle(cli)?;
        let store = super::global_store()?;
        let config = ExportServerConfig {
            timeout: Duration::from_secs(self.timeout),
            ..ExportServerConfig::new(bundle_path, self.port, auth, self.number)
        };
        let server = ExportServer::new(&store, config).await?;

        println!("Export information (hand this to importers out of band):");
        println!("{}", serde_json::to_string_pretty(server.export_info())?);
        println!();
        println!("Serving on port {}. Ctrl+C to stop.", self.port);

        let cancel = server.cancellation();
        tokio::select! {
            result = server.serve() => result?,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            }
        }
        println!("Export server stopped.");
        Ok(())
    }

    /// Accept either a filesystem path or a bundle id in the current
    /// repository's bundles directory.
    fn resolve_bundle(&self, cli: &crate::Cli) -> Result<PathBuf> {
        let direct = PathBuf::from(&self.bundle);
        if direct.is_file() {
            return Ok(direct);
        }
        let (_manager, _entry, ctx) = super::resolve_context(cli.repo_flag())?;
        let candidate = ctx.bundles_dir().join(archive::archive_name(&self.bundle));
        if candidate.is_file() {
            return Ok(candidate);
        }
        Err(anyhow!(
            "bundle not found: {} (tried as a path and as an id under {})",
            self.bundle,
            ctx.bundles_dir().display()
        ))
    }
}
