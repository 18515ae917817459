use crate::{Error, Result};
use std::path::{Path, PathBuf};

/// Handle to the per-user global state directory (`~/.dse-global`).
///
/// The key store, host registry, and repository manager all persist beneath
/// this directory. The handle is an explicit value passed to their
/// constructors; tests point it at a temporary directory instead.
#[derive(Debug, Clone)]
pub struct GlobalStore {
    root: PathBuf,
}

impl GlobalStore {
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("unable to determine home directory".to_string()))?;
        Ok(Self::with_root(home.join(".dse-global")))
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.root.join("keys")
    }

    pub fn hosts_dir(&self) -> PathBuf {
        self.root.join("hosts")
    }

    pub fn repos_file(&self) -> PathBuf {
        self.root.join("repos.yaml")
    }

    pub fn cert_path(&self) -> PathBuf {
        self.root.join("dse-local.crt")
    }

    pub fn cert_key_path(&self) -> PathBuf {
        self.root.join("dse-local.key")
    }
}
