use crate::hash::HashAlgorithm;
use crate::{compress, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_DSP_DIR: &str = ".dsp";
pub const CONFIG_FILE: &str = "config.yaml";
pub const TRACKING_FILE: &str = "tracking.yaml";

/// Per-repository configuration document, stored as `<dsp_dir>/config.yaml`.
///
/// Field names are part of the on-disk contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub dsp_dir: String,
    pub data_dir: String,
    pub hash_algorithm: HashAlgorithm,
    pub compression_level: i32,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            dsp_dir: DEFAULT_DSP_DIR.to_string(),
            data_dir: DEFAULT_DSP_DIR.to_string(),
            hash_algorithm: HashAlgorithm::default(),
            compression_level: 6,
        }
    }
}

impl RepoConfig {
    /// Load a configuration document and apply environment overrides
    /// (`DSP_DATA_DIR`, `DSP_HASH_ALGORITHM`, `DSP_COMPRESSION_LEVEL`).
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let mut config: RepoConfig = serde_yaml::from_str(&data)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(data_dir) = std::env::var("DSP_DATA_DIR") {
            self.data_dir = data_dir;
        }
        if let Ok(algo) = std::env::var("DSP_HASH_ALGORITHM") {
            self.hash_algorithm = algo.parse()?;
        }
        if let Ok(level) = std::env::var("DSP_COMPRESSION_LEVEL") {
            self.compression_level = level
                .parse()
                .map_err(|_| Error::Config(format!("invalid DSP_COMPRESSION_LEVEL: {level}")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.dsp_dir.is_empty() {
            return Err(Error::Config("dsp_dir must not be empty".to_string()));
        }
        if Path::new(&self.dsp_dir).is_absolute() {
            return Err(Error::Config("dsp_dir must be a relative path".to_string()));
        }
        if !(compress::MIN_LEVEL..=compress::MAX_LEVEL).contains(&self.compression_level) {
            return Err(Error::Config(format!(
                "invalid compression level: {}, must be between {} and {}",
                self.compression_level,
                compress::MIN_LEVEL,
                compress::MAX_LEVEL
            )));
        }
        Ok(())
    }
}

/// Resolved repository context passed to every engine operation.
#[derive(Debug, Clone)]
pub struct RepoContext {
    pub root: PathBuf,
    pub name: String,
    pub config: RepoConfig,
}

impl RepoContext {
    /// Open a repository rooted at `root` whose metadata directory is named
    /// `dsp_dir`.
    pub fn open(root: impl Into<PathBuf>, name: impl Into<String>, dsp_dir: &str) -> Result<Self> {
        let root = root.into();
        let config_path = root.join(dsp_dir).join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(Error::not_found("repository", root.display().to_string()));
        }
        let config = RepoConfig::load(&config_path)?;
        Ok(Self {
            root,
            name: name.into(),
            config,
        })
    }

    /// Initialize a fresh repository layout on disk and return its context.
    pub fn init(
        root: impl Into<PathBuf>,
        name: impl Into<String>,
        config: RepoConfig,
    ) -> Result<Self> {
        config.validate()?;
        let root = root.into();
        let dsp_path = root.join(&config.dsp_dir);
        if dsp_path.join(CONFIG_FILE).exists() {
            return Err(Error::already_exists(
                "repository",
                root.display().to_string(),
            ));
        }
        std::fs::create_dir_all(dsp_path.join("snapshots"))?;
        std::fs::create_dir_all(dsp_path.join("bundles"))?;
        config.save(&dsp_path.join(CONFIG_FILE))?;
        crate::tracking::TrackingConfig::default().save(&dsp_path.join(TRACKING_FILE))?;
        // Keep repository metadata out of any enclosing VCS working copy.
        std::fs::write(dsp_path.join(".gitignore"), "*\n")?;
        Ok(Self {
            root,
            name: name.into(),
            config,
        })
    }

    pub fn dsp_path(&self) -> PathBuf {
        self.root.join(&self.config.dsp_dir)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dsp_path().join(CONFIG_FILE)
    }

    pub fn tracking_path(&self) -> PathBuf {
        self.dsp_path().join(TRACKING_FILE)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.dsp_path().join("snapshots")
    }

    pub fn bundles_dir(&self) -> PathBuf {
        self.dsp_path().join("bundles")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        RepoConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_compression_level() {
        let config = RepoConfig {
            compression_level: 12,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn init_creates_layout_and_open_reads_it() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RepoContext::init(dir.path(), "demo", RepoConfig::default()).unwrap();
        assert!(ctx.snapshots_dir().is_dir());
        assert!(ctx.bundles_dir().is_dir());
        assert!(ctx.config_path().is_file());

        let reopened = RepoContext::open(dir.path(), "demo", DEFAULT_DSP_DIR).unwrap();
        assert_eq!(reopened.config.compression_level, 6);
    }

    #[test]
    fn double_init_rejected() {
        let dir = tempfile::tempdir().unwrap();
        RepoContext::init(dir.path(), "demo", RepoConfig::default()).unwrap();
        let err = RepoContext::init(dir.path(), "demo", RepoConfig::default()).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }
}
