pub mod apply;
pub mod bundle;
pub mod crypto;
pub mod diff;
pub mod export;
pub mod history;
pub mod host;
pub mod import;
pub mod init;
pub mod repo;
pub mod snapshot;
pub mod status;
pub mod track;
pub mod untrack;
pub mod use_repo;

use anyhow::Result;
use dse_core::repos::{RepoManager, RepositoryEntry};
use dse_core::tracking::TrackingConfig;
use dse_core::{GlobalStore, RepoContext};

pub fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

pub fn global_store() -> Result<GlobalStore> {
    Ok(GlobalStore::new()?)
}

/// Resolve the repository this invocation targets (flag, working repo,
/// default repo, or the current directory).
pub fn resolve_context(repo_flag: Option<&str>) -> Result<(RepoManager, RepositoryEntry, RepoContext)> {
    let store = global_store()?;
    let manager = RepoManager::new(&store)?;
    let entry = manager.current(repo_flag)?.clone();
    let ctx = manager.context(&entry)?;
    Ok((manager, entry, ctx))
}

pub fn load_tracking(ctx: &RepoContext) -> Result<TrackingConfig> {
    Ok(TrackingConfig::load(&ctx.tracking_path())?)
}
