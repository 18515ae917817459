use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A single tracked path.
///
/// Exclude patterns use a forward-slash glob grammar (`*`, `?`, `[class]`,
/// `[!class]`) and are matched against the path relative to the tracked
/// directory. A pattern that matches a directory excludes its entire
/// subtree. Excludes are only valid on directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedPath {
    pub path: PathBuf,
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excludes: Vec<String>,
}

/// Lifecycle state of a repository's tracking store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryState {
    pub is_closed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

/// The tracked-path document, stored as `<dsp_dir>/tracking.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default)]
    pub state: RepositoryState,
    #[serde(default)]
    pub paths: Vec<TrackedPath>,
}

impl TrackingConfig {
    /// Load the tracking document, or an empty one if none exists yet.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(TrackingConfig::default());
        }
        let data = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_yaml::to_string(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.state.is_closed {
            return Err(Error::Config(
                "repository is closed; reopen it before changing tracking".to_string(),
            ));
        }
        Ok(())
    }

    /// Track a path, optionally with exclude patterns.
    ///
    /// The path must exist and lie within the repository root; excludes are
    /// rejected unless the path is a directory.
    pub fn add_path(
        &mut self,
        repo_root: &Path,
        path: &Path,
        excludes: Vec<String>,
    ) -> Result<&TrackedPath> {
        self.check_open()?;
        let abs = absolutize(path)?;
        if !path_within(&abs, repo_root) {
            return Err(Error::Config(format!(
                "path {} lies outside the repository root {}",
                abs.display(),
                repo_root.display()
            )));
        }
        let meta = std::fs::symlink_metadata(&abs)
            .map_err(|_| Error::not_found("path", abs.display().to_string()))?;
        let is_dir = meta.is_dir();
        if !excludes.is_empty() && !is_dir {
            return Err(Error::Config(
                "exclude patterns can only be specified for directories".to_string(),
            ));
        }
        if self.paths.iter().any(|p| p.path == abs) {
            return Err(Error::already_exists("tracked path", abs.display().to_string()));
        }
        let excludes = excludes
            .into_iter()
            .map(|p| normalize_pattern(&p))
            .collect::<Result<Vec<_>>>()?;
        self.paths.push(TrackedPath {
            path: abs,
            is_dir,
            excludes,
        });
        self.touch();
        Ok(self.paths.last().expect("path was just pushed"))
    }

    pub fn remove_path(&mut self, path: &Path) -> Result<TrackedPath> {
        self.check_open()?;
        let abs = absolutize(path)?;
        let idx = self
            .paths
            .iter()
            .position(|p| p.path == abs)
            .ok_or_else(|| Error::not_found("tracked path", abs.display().to_string()))?;
        self.touch();
        Ok(self.paths.remove(idx))
    }

    /// Add exclude patterns to a set of already-tracked directories.
    pub fn add_excludes(&mut self, paths: &[PathBuf], patterns: &[String]) -> Result<()> {
        self.check_open()?;
        let patterns = patterns
            .iter()
            .map(|p| normalize_pattern(p))
            .collect::<Result<Vec<_>>>()?;
        self.for_each_target(paths, |tracked| {
            for pattern in &patterns {
                if !tracked.excludes.contains(pattern) {
                    tracked.excludes.push(pattern.clone());
                }
            }
            Ok(())
        })
    }

    /// Remove exclude patterns from a set of tracked directories.
    pub fn remove_excludes(&mut self, paths: &[PathBuf], patterns: &[String]) -> Result<()> {
        self.check_open()?;
        self.for_each_target(paths, |tracked| {
            tracked.excludes.retain(|e| !patterns.contains(e));
            Ok(())
        })
    }

    fn for_each_target<F>(&mut self, paths: &[PathBuf], mut apply: F) -> Result<()>
    where
        F: FnMut(&mut TrackedPath) -> Result<()>,
    {
        let targets = paths
            .iter()
            .map(|p| absolutize(p))
            .collect::<Result<Vec<_>>>()?;
        let mut found = false;
        for tracked in &mut self.paths {
            if targets.contains(&tracked.path) {
                if !tracked.is_dir {
                    return Err(Error::Config(format!(
                        "exclude patterns can only be modified for directories, but {} is a file",
                        tracked.path.display()
                    )));
                }
                apply(tracked)?;
                found = true;
            }
        }
        if !found {
            return Err(Error::not_found(
                "tracked path",
                paths
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            ));
        }
        self.touch();
        Ok(())
    }

    pub fn close(&mut self, user: &str) {
        let now = Utc::now();
        self.state = RepositoryState {
            is_closed: true,
            closed_at: Some(now),
            closed_by: Some(user.to_string()),
            last_modified: Some(now),
        };
    }

    pub fn reopen(&mut self) -> Result<()> {
        if !self.state.is_closed {
            return Err(Error::Config("repository is not closed".to_string()));
        }
        self.state = RepositoryState {
            is_closed: false,
            closed_at: None,
            closed_by: None,
            last_modified: Some(Utc::now()),
        };
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed
    }

    fn touch(&mut self) {
        self.state.last_modified = Some(Utc::now());
    }
}

/// Validate and normalize an exclude pattern: relative, forward-slash
/// separated, leading separators stripped, backslashes rejected.
pub fn normalize_pattern(pattern: &str) -> Result<String> {
    if pattern.contains('\\') {
        return Err(Error::Config(format!(
            "exclude pattern must use forward slashes: {pattern}"
        )));
    }
    let trimmed = pattern.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(Error::Config("exclude pattern must not be empty".to_string()));
    }
    glob::Pattern::new(trimmed)
        .map_err(|e| Error::Config(format!("invalid exclude pattern {trimmed}: {e}")))?;
    Ok(trimmed.to_string())
}

pub fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Whether `path` lies within `root` (both absolute; no symlink resolution).
pub fn path_within(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, TrackingConfig) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"notes").unwrap();
        (dir, TrackingConfig::default())
    }

    #[test]
    fn add_and_remove_path() {
        let (dir, mut tracking) = setup();
        let src = dir.path().join("src");
        tracking.add_path(dir.path(), &src, vec![]).unwrap();
        assert_eq!(tracking.paths.len(), 1);
        assert!(tracking.paths[0].is_dir);

        let err = tracking.add_path(dir.path(), &src, vec![]).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));

        tracking.remove_path(&src).unwrap();
        assert!(tracking.paths.is_empty());
    }

    #[test]
    fn excludes_rejected_on_files() {
        let (dir, mut tracking) = setup();
        let file = dir.path().join("notes.txt");
        let err = tracking
            .add_path(dir.path(), &file, vec!["*.log".to_string()])
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn path_outside_root_rejected() {
        let (dir, mut tracking) = setup();
        let err = tracking
            .add_path(dir.path(), Path::new("/etc"), vec![])
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn pattern_normalization() {
        assert_eq!(normalize_pattern("/build/*").unwrap(), "build/*");
        assert!(normalize_pattern("a\\b").is_err());
        assert!(normalize_pattern("").is_err());
        assert!(normalize_pattern("[").is_err());
    }

    #[test]
    fn exclude_management_deduplicates() {
        let (dir, mut tracking) = setup();
        let src = dir.path().join("src");
        tracking.add_path(dir.path(), &src, vec![]).unwrap();
        tracking
            .add_excludes(&[src.clone()], &["*.log".to_string(), "*.log".to_string()])
            .unwrap();
        assert_eq!(tracking.paths[0].excludes, vec!["*.log"]);

        tracking
            .remove_excludes(&[src.clone()], &["*.log".to_string()])
            .unwrap();
        assert!(tracking.paths[0].excludes.is_empty());
    }

    #[test]
    fn closed_repository_rejects_mutations() {
        let (dir, mut tracking) = setup();
        tracking.close("alice");
        let err = tracking
            .add_path(dir.path(), &dir.path().join("src"), vec![])
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        tracking.reopen().unwrap();
        tracking
            .add_path(dir.path(), &dir.path().join("src"), vec![])
            .unwrap();
    }

    #[test]
    fn roundtrip_document() {
        let (dir, mut tracking) = setup();
        let src = dir.path().join("src");
        tracking
            .add_path(dir.path(), &src, vec!["*.tmp".to_string()])
            .unwrap();
        let path = dir.path().join("tracking.yaml");
        tracking.save(&path).unwrap();
        let loaded = TrackingConfig::load(&path).unwrap();
        assert_eq!(loaded.paths.len(), 1);
        assert_eq!(loaded.paths[0].excludes, vec!["*.tmp"]);
    }
}
