use anyhow::Result;
use clap::{Args, Subcommand};
use dse_core::crypto::KeyManager;

#[derive(Args)]
pub struct CryptoCommand {
    #[command(subcommand)]
    action: CryptoAction,
}

#[derive(Subcommand)]
enum CryptoAction {
    #[command(about = "Generate the local identity, signing key, and TLS certificate")]
    Init,

    #[command(about = "Register a recipient's public encryption key")]
    AddRecipient {
        #[arg(help = "Recipient name")]
        name: String,
        #[arg(help = "Recipient public key (age1…)")]
        key: String,
    },

    #[command(about = "List known recipients")]
    List,

    #[command(about = "Remove a recipient")]
    Remove {
        #[arg(help = "Recipient name")]
        name: String,
    },

    #[command(about = "Print the local public keys")]
    ExportKey,
}

impl CryptoCommand {
    pub async fn run(&self, _cli: &crate::Cli) -> Result<()> {
        let store = super::global_store()?;
        let mut keys = KeyManager::new(&store)?;

        match &self.action {
            CryptoAction::Init => {
                keys.init_keys()?;
                println!("Key material ready under {}", store.keys_dir().display());
                println!("Public key:          {}", keys.public_key()?);
                println!("Signing public key:  {}", keys.signing_public_key()?);
                println!("Cert fingerprint:    {}", keys.certificate_fingerprint()?);
            }
            CryptoAction::AddRecipient { name, key } => {
                keys.add_recipient(name, key)?;
                println!("Added recipient '{name}'");
            }
            CryptoAction::List => {
                if keys.recipients().is_empty() {
                    println!("No recipients.");
                    return Ok(());
                }
                for recipient in keys.recipients() {
                    let trust = if recipient.trusted { "trusted" } else { "untrusted" };
                    println!(
                        "{:<20} {}  added {}  [{trust}]",
                        recipient.name,
                        recipient.key,
                        recipient.added.format("%Y-%m-%d")
                    );
                }
            }
            CryptoAction::Remove { name } => {
                keys.remove_recipient(name)?;
                println!("Removed recipient '{name}'");
            }
            CryptoAction::ExportKey => {
                println!("{}", keys.public_key()?);
                println!("{}", keys.signing_public_key()?);
            }
        }
        Ok(())
    }
}
