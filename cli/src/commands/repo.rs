use anyhow::Result;
use clap::{Args, Subcommand};
use dse_core::repos::RepoManager;
use dse_core::tracking::TrackingConfig;
use std::path::Path;

#[derive(Args)]
pub struct RepoCommand {
    #[command(subcommand)]
    action: RepoAction,
}

#[derive(Subcommand)]
enum RepoAction {
    #[command(about = "List registered repositories")]
    List,

    #[command(about = "Register an existing repository by its metadata directory")]
    Add {
        #[arg(help = "Path to the metadata directory (e.g. /path/to/repo/.dsp)")]
        dsp_path: String,
        #[arg(help = "Repository name")]
        name: String,
        #[arg(short = 'D', long, help = "Set as the default repository")]
        default: bool,
    },

    #[command(about = "Remove a repository from the registry (closes its tracking state)")]
    Remove {
        #[arg(help = "Repository name or path")]
        repo: String,
    },

    #[command(about = "Rename a repository")]
    Rename {
        #[arg(help = "Repository name or path")]
        repo: String,
        #[arg(help = "New name")]
        new_name: String,
    },

    #[command(about = "Move a repository's metadata to a new root")]
    Move {
        #[arg(help = "Repository name or path")]
        repo: String,
        #[arg(help = "New repository root")]
        new_path: String,
    },

    #[command(about = "Set the default repository")]
    SetDefault {
        #[arg(help = "Repository name or path")]
        repo: String,
    },

    #[command(about = "Clear the default repository")]
    UnsetDefault,

    #[command(about = "Show one repository")]
    Show {
        #[arg(help = "Repository name or path")]
        repo: String,
    },

    #[command(about = "Show the registry state")]
    Status,
}

impl RepoCommand {
    pub async fn run(&self, _cli: &crate::Cli) -> Result<()> {
        let store = super::global_store()?;
        let mut manager = RepoManager::new(&store)?;

        match &self.action {
            RepoAction::List => {
                if manager.list().is_empty() {
                    println!("No repositories registered.");
                    return Ok(());
                }
                for entry in manager.list() {
                    let marker = if entry.is_default { "*" } else { " " };
                    println!("{marker} {:<20} {}", entry.name, entry.path.display());
                }
            }
            RepoAction::Add { dsp_path, name, default } => {
                manager.add_existing(Path::new(dsp_path), name, *default)?;
                println!("Added repository '{name}'");
            }
            RepoAction::Remove { repo } => {
                let removed = manager.remove(repo, &super::current_user())?;
                println!(
                    "Removed repository '{}' (working tree at {} is untouched)",
                    removed.name,
                    removed.path.display()
                );
            }
            RepoAction::Rename { repo, new_name } => {
                manager.rename(repo, new_name)?;
                println!("Renamed repository to '{new_name}'");
            }
            RepoAction::Move { repo, new_path } => {
                manager.move_repository(repo, Path::new(new_path))?;
                println!("Moved repository to {new_path}");
            }
            RepoAction::SetDefault { repo } => {
                manager.set_default(Some(repo))?;
                println!("Default repository set to '{repo}'");
            }
            RepoAction::UnsetDefault => {
                manager.set_default(None)?;
                println!("Default repository cleared");
            }
            RepoAction::Show { repo } => {
                let entry = manager.get(repo)?;
                println!("Name:     {}", entry.name);
                println!("Path:     {}", entry.path.display());
                println!("Metadata: {}", entry.dsp_path().display());
                println!("Default:  {}", entry.is_default);
                let tracking =
                    TrackingConfig::load(&entry.dsp_path().join("tracking.yaml"))?;
                println!("Tracked:  {} path(s)", tracking.paths.len());
                println!("Closed:   {}", tracking.is_closed());
            }
            RepoAction::Status => {
                println!("Registered: {}", manager.list().len());
                match &manager.default_repo {
                    Some(path) => println!("Default:    {}", path.display()),
                    None => println!("Default:    (none)"),
                }
                match &manager.working_repo {
                    Some(path) => println!("Working:    {}", path.display()),
                    None => println!("Working:    (none)"),
                }
            }
        }
        Ok(())
    }
}
