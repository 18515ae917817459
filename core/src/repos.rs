use crate::config::{CONFIG_FILE, TRACKING_FILE};
use crate::tracking::{absolutize, TrackingConfig};
use crate::{Error, GlobalStore, RepoContext, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// One registered repository root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryEntry {
    pub path: PathBuf,
    pub name: String,
    pub is_default: bool,
    pub dsp_dir: String,
}

impl RepositoryEntry {
    pub fn dsp_path(&self) -> PathBuf {
        self.path.join(&self.dsp_dir)
    }
}

/// User-global registry of repository roots (`repos.yaml`), plus the default
/// and working repository pointers.
#[derive(Debug, Serialize, Deserialize)]
pub struct RepoManager {
    #[serde(default)]
    pub repos: Vec<RepositoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_repo: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_repo: Option<PathBuf>,
    #[serde(skip)]
    config_path: PathBuf,
}

impl RepoManager {
    pub fn new(store: &GlobalStore) -> Result<Self> {
        std::fs::create_dir_all(store.root())?;
        let config_path = store.repos_file();
        if !config_path.exists() {
            let manager = Self {
                repos: Vec::new(),
                default_repo: None,
                working_repo: None,
                config_path,
            };
            manager.save()?;
            return Ok(manager);
        }
        let data = std::fs::read_to_string(&config_path)?;
        let mut manager: RepoManager = serde_yaml::from_str(&data)?;
        manager.config_path = config_path;
        Ok(manager)
    }

    pub fn save(&self) -> Result<()> {
        std::fs::write(&self.config_path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Register a repository root. Rejects a path or name already present.
    pub fn register(
        &mut self,
        path: &Path,
        name: &str,
        is_default: bool,
        dsp_dir: &str,
    ) -> Result<&RepositoryEntry> {
        let abs = absolutize(path)?;
        if self.repos.iter().any(|r| r.path == abs) {
            return Err(Error::already_exists("repository", abs.display().to_string()));
        }
        if self.repos.iter().any(|r| r.name == name) {
            return Err(Error::already_exists("repository", name));
        }
        self.repos.push(RepositoryEntry {
            path: abs.clone(),
            name: name.to_string(),
            is_default,
            dsp_dir: dsp_dir.to_string(),
        });
        if is_default {
            self.set_default_path(&abs);
        }
        self.save()?;
        Ok(self.repos.last().unwrap())
    }

    /// Register a previously initialized (possibly closed) repository by its
    /// metadata directory path, reopening it if needed.
    pub fn add_existing(&mut self, dsp_path: &Path, name: &str, is_default: bool) -> Result<()> {
        let abs = absolutize(dsp_path)?;
        let root = abs
            .parent()
            .ok_or_else(|| Error::Config(format!("invalid metadata path: {}", abs.display())))?
            .to_path_buf();
        let dsp_dir = abs
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Config(format!("invalid metadata path: {}", abs.display())))?
            .to_string();

        if !abs.join(CONFIG_FILE).exists() {
            return Err(Error::not_found("repository", root.display().to_string()));
        }
        let tracking_path = abs.join(TRACKING_FILE);
        let mut tracking = TrackingConfig::load(&tracking_path)?;
        if tracking.is_closed() {
            tracking.reopen()?;
            tracking.save(&tracking_path)?;
        }

        self.register(&root, name, is_default, &dsp_dir)?;
        Ok(())
    }

    /// Remove a repository from the registry and mark its tracking state
    /// closed. The working tree is left untouched.
    pub fn remove(&mut self, name_or_path: &str, user: &str) -> Result<RepositoryEntry> {
        let entry = self.get(name_or_path)?.clone();
        self.repos.retain(|r| r.path != entry.path);
        if self.default_repo.as_deref() == Some(entry.path.as_path()) {
            self.default_repo = None;
            for repo in &mut self.repos {
                repo.is_default = false;
            }
        }
        if self.working_repo.as_deref() == Some(entry.path.as_path()) {
            self.working_repo = None;
        }
        self.save()?;

        let tracking_path = entry.dsp_path().join(TRACKING_FILE);
        match TrackingConfig::load(&tracking_path) {
            Ok(mut tracking) => {
                tracking.close(user);
                if let Err(e) = tracking.save(&tracking_path) {
                    warn!(repo = %entry.path.display(), "failed to close tracking state: {e}");
                }
            }
            Err(e) => warn!(repo = %entry.path.display(), "failed to load tracking state: {e}"),
        }
        Ok(entry)
    }

    pub fn rename(&mut self, name_or_path: &str, new_name: &str) -> Result<()> {
        if self.repos.iter().any(|r| r.name == new_name) {
            return Err(Error::already_exists("repository", new_name));
        }
        let path = self.get(name_or_path)?.path.clone();
        let entry = self
            .repos
            .iter_mut()
            .find(|r| r.path == path)
            .expect("entry resolved above");
        entry.name = new_name.to_string();
        self.save()
    }

    fn set_default_path(&mut self, path: &Path) {
        for repo in &mut self.repos {
            repo.is_default = repo.path == path;
        }
        self.default_repo = Some(path.to_path_buf());
    }

    /// Set the default repository, or clear it with `None`.
    pub fn set_default(&mut self, name_or_path: Option<&str>) -> Result<()> {
        match name_or_path {
            Some(arg) => {
                let path = self.get(arg)?.path.clone();
                self.set_default_path(&path);
            }
            None => {
                for repo in &mut self.repos {
                    repo.is_default = false;
                }
                self.default_repo = None;
            }
        }
        self.save()
    }

    pub fn set_working(&mut self, name_or_path: &str) -> Result<()> {
        let path = self.get(name_or_path)?.path.clone();
        self.working_repo = Some(path);
        self.save()
    }

    pub fn clear_working(&mut self) -> Result<()> {
        self.working_repo = None;
        self.save()
    }

    /// Look up a repository by name first, then by path.
    pub fn get(&self, name_or_path: &str) -> Result<&RepositoryEntry> {
        if let Some(entry) = self.repos.iter().find(|r| r.name == name_or_path) {
            return Ok(entry);
        }
        let abs = absolutize(Path::new(name_or_path))?;
        self.repos
            .iter()
            .find(|r| r.path == abs)
            .ok_or_else(|| Error::not_found("repository", name_or_path))
    }

    /// Resolve the repository an operation targets.
    ///
    /// Precedence: explicit argument, then the working repository, then the
    /// default repository, then the current directory if it is a known root.
    pub fn current(&self, explicit: Option<&str>) -> Result<&RepositoryEntry> {
        if let Some(arg) = explicit {
            return self.get(arg);
        }
        if let Some(working) = &self.working_repo {
            return self
                .repos
                .iter()
                .find(|r| &r.path == working)
                .ok_or_else(|| Error::not_found("repository", working.display().to_string()));
        }
        if let Some(default) = &self.default_repo {
            return self
                .repos
                .iter()
                .find(|r| &r.path == default)
                .ok_or_else(|| Error::not_found("repository", default.display().to_string()));
        }
        let cwd = std::env::current_dir()?;
        self.repos.iter().find(|r| r.path == cwd).ok_or_else(|| {
            Error::Config(
                "no repository context: pass --repo, set a working repository with `use`, \
                 set a default repository, or run from a repository root"
                    .to_string(),
            )
        })
    }

    pub fn list(&self) -> &[RepositoryEntry] {
        &self.repos
    }

    /// Open the repository context for an entry.
    pub fn context(&self, entry: &RepositoryEntry) -> Result<RepoContext> {
        RepoContext::open(&entry.path, &entry.name, &entry.dsp_dir)
    }

    /// Move a repository's metadata subtree to a new root.
    ///
    /// The subtree is copied to a temporary directory, verified, and renamed
    /// into the destination (copy+delete when the rename crosses devices).
    /// If updating the registry fails afterwards, the destination is renamed
    /// back so the source survives.
    pub fn move_repository(&mut self, name_or_path: &str, new_root: &Path) -> Result<()> {
        let entry = self.get(name_or_path)?.clone();
        let new_root = absolutize(new_root)?;

        if entry.path == new_root {
            return Err(Error::Config(format!(
                "repository is already at {}",
                new_root.display()
            )));
        }
        if new_root.starts_with(&entry.path) {
            return Err(Error::Config(format!(
                "cannot move repository into itself: {} is inside {}",
                new_root.display(),
                entry.path.display()
            )));
        }
        if self.repos.iter().any(|r| r.path == new_root) {
            return Err(Error::already_exists(
                "repository",
                new_root.display().to_string(),
            ));
        }

        let src_dsp = entry.dsp_path();
        let dst_dsp = new_root.join(&entry.dsp_dir);
        if !src_dsp.is_dir() {
            return Err(Error::not_found(
                "repository metadata",
                src_dsp.display().to_string(),
            ));
        }

        // Stage a full copy first; the source is not touched until the
        // staged copy has been verified.
        let staging = tempfile::tempdir()?;
        let staged = staging.path().join(&entry.dsp_dir);
        copy_dir(&src_dsp, &staged)?;
        for required in [CONFIG_FILE, TRACKING_FILE] {
            if !staged.join(required).exists() {
                return Err(Error::Invariant(format!(
                    "staged copy is missing {required}"
                )));
            }
        }

        std::fs::create_dir_all(&new_root)?;
        move_tree(&staged, &dst_dsp)?;
        std::fs::remove_dir_all(&src_dsp)?;

        let old_path = entry.path.clone();
        for repo in &mut self.repos {
            if repo.path == old_path {
                repo.path = new_root.clone();
            }
        }
        if self.default_repo.as_deref() == Some(old_path.as_path()) {
            self.default_repo = Some(new_root.clone());
        }
        if self.working_repo.as_deref() == Some(old_path.as_path()) {
            self.working_repo = Some(new_root.clone());
        }

        if let Err(e) = self.save() {
            // Put the metadata back where the registry still points.
            if let Err(restore) = move_tree(&dst_dsp, &src_dsp) {
                warn!("failed to restore {} after move error: {restore}", src_dsp.display());
            }
            for repo in &mut self.repos {
                if repo.path == new_root {
                    repo.path = old_path.clone();
                }
            }
            return Err(e);
        }
        Ok(())
    }
}

/// Whether a directory is a repository root with the given metadata
/// directory name.
pub fn is_repository(root: &Path, dsp_dir: &str) -> bool {
    let dsp_path = root.join(dsp_dir);
    dsp_path.join(CONFIG_FILE).exists() && TrackingConfig::load(&dsp_path.join(TRACKING_FILE)).is_ok()
}

/// Rename a directory, falling back to copy+delete across devices.
fn move_tree(src: &Path, dst: &Path) -> Result<()> {
    match std::fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_dir(src, dst)?;
            std::fs::remove_dir_all(src)?;
            Ok(())
        }
    }
}

fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RepoConfig;

    fn setup() -> (tempfile::TempDir, GlobalStore, RepoManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = GlobalStore::with_root(dir.path().join("global"));
        let manager = RepoManager::new(&store).unwrap();
        (dir, store, manager)
    }

    fn init_repo(root: &Path, name: &str) -> RepoContext {
        std::fs::create_dir_all(root).unwrap();
        RepoContext::init(root, name, RepoConfig::default()).unwrap()
    }

    #[test]
    fn register_and_reload() {
        let (dir, store, mut manager) = setup();
        let root = dir.path().join("repo-a");
        init_repo(&root, "a");
        manager.register(&root, "a", true, ".dsp").unwrap();

        assert!(matches!(
            manager.register(&root, "other", false, ".dsp").unwrap_err(),
            Error::AlreadyExists { .. }
        ));

        let reloaded = RepoManager::new(&store).unwrap();
        assert_eq!(reloaded.repos.len(), 1);
        assert_eq!(reloaded.default_repo.as_deref(), Some(root.as_path()));
    }

    #[test]
    fn resolution_precedence() {
        let (dir, _store, mut manager) = setup();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        init_repo(&a, "a");
        init_repo(&b, "b");
        manager.register(&a, "a", true, ".dsp").unwrap();
        manager.register(&b, "b", false, ".dsp").unwrap();

        // Explicit beats everything.
        assert_eq!(manager.current(Some("b")).unwrap().name, "b");
        // Default when nothing else is set.
        assert_eq!(manager.current(None).unwrap().name, "a");
        // Working beats default.
        manager.set_working("b").unwrap();
        assert_eq!(manager.current(None).unwrap().name, "b");
        manager.clear_working().unwrap();
        assert_eq!(manager.current(None).unwrap().name, "a");
    }

    #[test]
    fn no_context_fails() {
        let (_dir, _store, manager) = setup();
        assert!(manager.current(None).is_err());
    }

    #[test]
    fn remove_closes_tracking_and_clears_default() {
        let (dir, _store, mut manager) = setup();
        let root = dir.path().join("a");
        init_repo(&root, "a");
        manager.register(&root, "a", true, ".dsp").unwrap();

        manager.remove("a", "alice").unwrap();
        assert!(manager.repos.is_empty());
        assert!(manager.default_repo.is_none());

        let tracking = TrackingConfig::load(&root.join(".dsp/tracking.yaml")).unwrap();
        assert!(tracking.is_closed());
    }

    #[test]
    fn add_existing_reopens_closed_repository() {
        let (dir, _store, mut manager) = setup();
        let root = dir.path().join("a");
        init_repo(&root, "a");
        manager.register(&root, "a", false, ".dsp").unwrap();
        manager.remove("a", "alice").unwrap();

        manager.add_existing(&root.join(".dsp"), "a", false).unwrap();
        let tracking = TrackingConfig::load(&root.join(".dsp/tracking.yaml")).unwrap();
        assert!(!tracking.is_closed());
    }

    #[test]
    fn move_repository_relocates_metadata() {
        let (dir, _store, mut manager) = setup();
        let old_root = dir.path().join("old");
        let new_root = dir.path().join("new");
        init_repo(&old_root, "a");
        manager.register(&old_root, "a", true, ".dsp").unwrap();

        manager.move_repository("a", &new_root).unwrap();

        assert!(!old_root.join(".dsp").exists());
        assert!(new_root.join(".dsp/config.yaml").is_file());
        assert_eq!(manager.get("a").unwrap().path, new_root);
        assert_eq!(manager.default_repo.as_deref(), Some(new_root.as_path()));
    }

    #[test]
    fn move_into_self_rejected() {
        let (dir, _store, mut manager) = setup();
        let root = dir.path().join("a");
        init_repo(&root, "a");
        manager.register(&root, "a", false, ".dsp").unwrap();
        assert!(manager.move_repository("a", &root.join("nested")).is_err());
    }

    #[test]
    fn is_repository_checks_layout() {
        let (dir, _store, _manager) = setup();
        let root = dir.path().join("a");
        init_repo(&root, "a");
        assert!(is_repository(&root, ".dsp"));
        assert!(!is_repository(dir.path(), ".dsp"));
    }
}
