use anyhow::Result;
use clap::{Args, Subcommand};
use dse_core::hosts::{Host, HostManager};

#[derive(Args)]
pub struct HostCommand {
    #[command(subcommand)]
    action: HostAction,
}

#[derive(Subcommand)]
enum HostAction {
    #[command(about = "Add a host manually")]
    Add {
        #[arg(help = "Host name")]
        name: String,
        #[arg(help = "Host public key (age1…)")]
        public_key: String,
        #[arg(long, help = "Description")]
        description: Option<String>,
    },

    #[command(about = "List known hosts")]
    List,

    #[command(about = "Show one host")]
    Show {
        #[arg(help = "Host name or alias")]
        host: String,
    },

    #[command(about = "Remove a host")]
    Remove {
        #[arg(help = "Host name")]
        name: String,
    },

    #[command(about = "Mark a host trusted")]
    Trust {
        #[arg(help = "Host name")]
        name: String,
    },

    #[command(about = "Mark a host untrusted")]
    Untrust {
        #[arg(help = "Host name")]
        name: String,
    },

    #[command(about = "Add a tag to a host")]
    Tag {
        #[arg(help = "Host name")]
        name: String,
        #[arg(help = "Tag")]
        tag: String,
    },

    #[command(about = "Remove a tag from a host")]
    Untag {
        #[arg(help = "Host name")]
        name: String,
        #[arg(help = "Tag")]
        tag: String,
    },

    #[command(about = "Set or clear a host alias")]
    Alias {
        #[arg(help = "Host name")]
        name: String,
        #[arg(help = "Alias (omit to clear)")]
        alias: Option<String>,
    },
}

impl HostCommand {
    pub async fn run(&self, _cli: &crate::Cli) -> Result<()> {
        let store = super::global_store()?;
        let mut hosts = HostManager::new(&store)?;

        match &self.action {
            HostAction::Add { name, public_key, description } => {
                let mut host = Host::new(name.clone(), public_key.clone());
                host.description = description.clone();
                hosts.add(host)?;
                println!("Added host '{name}'");
            }
            HostAction::List => {
                if hosts.list().is_empty() {
                    println!("No known hosts.");
                    return Ok(());
                }
                for host in hosts.list() {
                    let trust = if host.trusted { "trusted" } else { "untrusted" };
                    let pin = if host.cert_info.is_some() { "pinned" } else { "no pin" };
                    println!("{:<20} [{trust}, {pin}]  last used {}", host.name, host.last_used.format("%Y-%m-%d"));
                }
            }
            HostAction::Show { host } => {
                let host = hosts.resolve(host)?;
                println!("Name:       {}", host.name);
                println!("Public key: {}", host.public_key);
                println!("Trusted:    {}", host.trusted);
                println!("Added:      {}", host.added_at.format("%Y-%m-%d %H:%M:%S UTC"));
                println!("Last used:  {}", host.last_used.format("%Y-%m-%d %H:%M:%S UTC"));
                if let Some(alias) = &host.alias {
                    println!("Alias:      {alias}");
                }
                if !host.tags.is_empty() {
                    println!("Tags:       {}", host.tags.join(", "));
                }
                if let Some(ip) = &host.ip_address {
                    println!("Address:    {ip}:{}", host.last_port.unwrap_or(0));
                }
                if let Some(cert) = &host.cert_info {
                    println!("Cert pin:   {}", cert.fingerprint);
                    println!("  valid:    {} to {}", cert.valid_from.format("%Y-%m-%d"), cert.valid_to.format("%Y-%m-%d"));
                    println!("  checked:  {}", cert.last_verified.format("%Y-%m-%d %H:%M:%S UTC"));
                }
            }
            HostAction::Remove { name } => {
                hosts.remove(name)?;
                println!("Removed host '{name}'");
            }
            HostAction::Trust { name } => {
                hosts.set_trusted(name, true)?;
                println!("Host '{name}' marked trusted");
            }
            HostAction::Untrust { name } => {
                hosts.set_trusted(name, false)?;
                println!("Host '{name}' marked untrusted");
            }
            HostAction::Tag { name, tag } => {
                hosts.add_tag(name, tag)?;
                println!("Tagged '{name}' with '{tag}'");
            }
            HostAction::Untag { name, tag } => {
                hosts.remove_tag(name, tag)?;
                println!("Removed tag '{tag}' from '{name}'");
            }
            HostAction::Alias { name, alias } => {
                hosts.set_alias(name, alias.clone())?;
                match alias {
                    Some(alias) => println!("Host '{name}' aliased as '{alias}'"),
                    None => println!("Alias cleared for '{name}'"),
                }
            }
        }
        Ok(())
    }
}
