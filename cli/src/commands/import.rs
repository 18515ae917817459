use anyhow::{anyhow, Result};
use clap::Args;
use dse_transport::client::ImportAuth;
use dse_transport::{import_bundle, ImportOptions};
use std::path::PathBuf;

#[derive(Args)]
pub struct ImportCommand {
    #[arg(short = 'H', long, help = "Export server host")]
    host: String,

    #[arg(long, default_value_t = 9443, help = "Export server port")]
    port: u16,

    #[arg(short, long, conflicts_with = "user", help = "Password for authentication")]
    password: Option<String>,

    #[arg(short, long, conflicts_with = "password", help = "User name for authentication")]
    user: Option<String>,

    #[arg(short, long, help = "Name for the new repository")]
    name: String,

    #[arg(short = 'R', long, help = "Root path for the new repository")]
    root: String,

    #[arg(short = 'D', long, help = "Set the new repository as default")]
    default: bool,

    #[arg(long, help = "Skip the key exchange handshake")]
    no_key_exchange: bool,
}

impl ImportCommand {
    pub async fn run(&self, _cli: &crate::Cli) -> Result<()> {
        let auth = match (&self.password, &self.user) {
            (Some(password), None) => ImportAuth::Password(password.clone()),
            (None, Some(user)) => ImportAuth::User(user.clone()),
            _ => return Err(anyhow!("specify exactly one of --password or --user")),
        };

        let store = super::global_store()?;
        let options = ImportOptions {
            host: self.host.clone(),
            port: self.port,
            auth,
            repo_name: self.name.clone(),
            repo_root: PathBuf::from(&self.root),
            set_default: self.default,
            skip_key_exchange: self.no_key_exchange,
        };

        println!("Importing from {}:{} ...", self.host, self.port);
        let outcome = import_bundle(&store, &options).await?;

        println!("Import completed.");
        println!("Repository: {} ({})", self.name, self.root);
        println!("Metadata:   {}", outcome.dsp_dir);
        println!("Bundle:     {} ({} change(s))", outcome.bundle_id, outcome.changes);
        println!("Archive:    {}", outcome.bundle_path.display());
        println!();
        println!("Run `dse apply -b {}` inside the repository to materialize the files.", outcome.bundle_path.display());
        Ok(())
    }
}
