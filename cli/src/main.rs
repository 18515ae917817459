mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{
    apply::ApplyCommand, bundle::BundleCommand, crypto::CryptoCommand, diff::DiffCommand,
    export::ExportCommand, history::HistoryCommand, host::HostCommand, import::ImportCommand,
    init::InitCommand, repo::RepoCommand, snapshot::SnapshotCommand, status::StatusCommand,
    track::TrackCommand, untrack::UntrackCommand, use_repo::UseCommand,
};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "dse",
    about = "Disconnected synchronization engine",
    long_about = "DSE records directory trees as verifiable snapshots, packs changes into \
                  bundles, and moves them between peers over an authenticated TLS channel."
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, env = "DSE_REPO", global = true, help = "Repository name or path")]
    repo: Option<String>,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode")]
    quiet: bool,
}

impl Cli {
    pub fn repo_flag(&self) -> Option<&str> {
        self.repo.as_deref()
    }
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Initialize a new repository")]
    Init(InitCommand),

    #[command(about = "Track paths, or manage exclude patterns on tracked directories")]
    Track(TrackCommand),

    #[command(about = "Stop tracking paths")]
    Untrack(UntrackCommand),

    #[command(about = "Record a snapshot of the tracked tree")]
    Snapshot(SnapshotCommand),

    #[command(about = "Show the changes between two snapshots")]
    Diff(DiffCommand),

    #[command(about = "Pack the changes between two snapshots into a bundle archive")]
    Bundle(BundleCommand),

    #[command(about = "Apply a bundle archive to the working tree")]
    Apply(ApplyCommand),

    #[command(about = "Show tracked paths and pending changes")]
    Status(StatusCommand),

    #[command(about = "List snapshots")]
    History(HistoryCommand),

    #[command(about = "Manage registered repositories")]
    Repo(RepoCommand),

    #[command(name = "use", about = "Set or clear the working repository")]
    Use(UseCommand),

    #[command(about = "Manage local keys and recipients")]
    Crypto(CryptoCommand),

    #[command(about = "Manage known hosts and their pinned certificates")]
    Host(HostCommand),

    #[command(about = "Serve a bundle to importers")]
    Export(ExportCommand),

    #[command(about = "Download a bundle and create a repository from it")]
    Import(ImportCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);

    match &cli.command {
        Commands::Init(cmd) => cmd.run(&cli).await,
        Commands::Track(cmd) => cmd.run(&cli).await,
        Commands::Untrack(cmd) => cmd.run(&cli).await,
        Commands::Snapshot(cmd) => cmd.run(&cli).await,
        Commands::Diff(cmd) => cmd.run(&cli).await,
        Commands::Bundle(cmd) => cmd.run(&cli).await,
        Commands::Apply(cmd) => cmd.run(&cli).await,
        Commands::Status(cmd) => cmd.run(&cli).await,
        Commands::History(cmd) => cmd.run(&cli).await,
        Commands::Repo(cmd) => cmd.run(&cli).await,
        Commands::Use(cmd) => cmd.run(&cli).await,
        Commands::Crypto(cmd) => cmd.run(&cli).await,
        Commands::Host(cmd) => cmd.run(&cli).await,
        Commands::Export(cmd) => cmd.run(&cli).await,
        Commands::Import(cmd) => cmd.run(&cli).await,
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!("dse={level},dse_core={level},dse_transport={level}")))
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Setting default subscriber failed");
}
