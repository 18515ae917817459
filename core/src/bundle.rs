use crate::compress;
use crate::hash::{self, HashAlgorithm};
use crate::snapshot::{FileRecord, Snapshot};
use crate::tracking::TrackingConfig;
use crate::{Error, RepoContext, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tokio::fs;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Add,
    Modify,
    Delete,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Add => f.write_str("add"),
            ChangeType::Modify => f.write_str("modify"),
            ChangeType::Delete => f.write_str("delete"),
        }
    }
}

/// A single change in a bundle.
///
/// `content_hash` is the digest of the *compressed* payload stored in the
/// bundle; it is present for regular-file adds and modifies and absent for
/// deletions and symlinks (which carry no payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub path: String,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub hash: String,
    pub size: u64,
    pub modified_time: DateTime<Utc>,
    pub is_symlink: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleRepoConfig {
    pub hash_algorithm: HashAlgorithm,
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub name: String,
    pub dsp_dir: String,
    pub data_dir: String,
    pub config: BundleRepoConfig,
    pub tracking_config: TrackingConfig,
}

/// A packaged delta between two snapshots, including the compressed payloads
/// of changed files.
///
/// An initial bundle has no source snapshot and carries every tracked file
/// as an `add`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_initial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_snapshot: Option<String>,
    pub target_snapshot: String,
    pub repository: RepositoryInfo,
    pub changes: Vec<Change>,
    /// Compressed payloads keyed by path. Stored alongside the metadata in
    /// the archive, never inside the JSON document.
    #[serde(skip)]
    pub file_contents: HashMap<String, Vec<u8>>,
}

/// Compute the add/modify/delete set between two snapshots.
///
/// With no source, every target file is an `add`. The order of the returned
/// list is unspecified; every change is independently self-describing.
pub fn diff_snapshots(source: Option<&Snapshot>, target: &Snapshot) -> Vec<Change> {
    let mut changes = Vec::new();

    let source_files: HashMap<&str, &FileRecord> = source
        .map(|s| s.files.iter().map(|f| (f.path.as_str(), f)).collect())
        .unwrap_or_default();
    let target_files: HashMap<&str, &FileRecord> =
        target.files.iter().map(|f| (f.path.as_str(), f)).collect();

    for record in &target.files {
        match source_files.get(record.path.as_str()) {
            None => changes.push(change_from_record(record, ChangeType::Add)),
            Some(old) if old.hash != record.hash => {
                changes.push(change_from_record(record, ChangeType::Modify));
            }
            Some(_) => {}
        }
    }

    if let Some(source) = source {
        for record in &source.files {
            if !target_files.contains_key(record.path.as_str()) {
                changes.push(change_from_record(record, ChangeType::Delete));
            }
        }
    }

    changes
}

fn change_from_record(record: &FileRecord, change_type: ChangeType) -> Change {
    Change {
        path: record.path.clone(),
        change_type,
        hash: record.hash.clone(),
        size: record.size,
        modified_time: record.modified_time,
        is_symlink: record.is_symlink,
        symlink_target: record.symlink_target.clone(),
        content_hash: None,
    }
}

impl Bundle {
    /// Build a bundle from two snapshots, reading and compressing the
    /// current on-disk content of every added or modified regular file.
    ///
    /// Bundle ids have one-second resolution; callers that need finer must
    /// serialize bundle creation.
    pub async fn create(
        ctx: &RepoContext,
        tracking: &TrackingConfig,
        source: Option<&Snapshot>,
        target: &Snapshot,
        created_by: &str,
        description: Option<String>,
    ) -> Result<Self> {
        let mut changes = diff_snapshots(source, target);
        let mut file_contents = HashMap::new();
        let level = ctx.config.compression_level;
        let algorithm = ctx.config.hash_algorithm;

        for change in &mut changes {
            if change.change_type == ChangeType::Delete || change.is_symlink {
                continue;
            }
            let raw = fs::read(&change.path).await?;
            let compressed = compress::compress(&raw, level)?;
            change.content_hash = Some(hash::hash_bytes(algorithm, &compressed));
            file_contents.insert(change.path.clone(), compressed);
        }

        debug!(
            changes = changes.len(),
            payloads = file_contents.len(),
            "bundle computed"
        );

        Ok(Bundle {
            id: Utc::now().format("%Y%m%d%H%M%S").to_string(),
            created_at: Utc::now(),
            created_by: created_by.to_string(),
            description,
            is_initial: source.is_none(),
            source_snapshot: source.map(|s| s.id.clone()),
            target_snapshot: target.id.clone(),
            repository: RepositoryInfo {
                name: ctx.name.clone(),
                dsp_dir: ctx.config.dsp_dir.clone(),
                data_dir: ctx.config.data_dir.clone(),
                config: BundleRepoConfig {
                    hash_algorithm: algorithm,
                    compression_level: level,
                },
                tracking_config: tracking.clone(),
            },
            changes,
            file_contents,
        })
    }

    /// Check the bundle's structural and payload integrity.
    ///
    /// A bundle with no changes is legal (nothing changed between the
    /// snapshots); every payload that is present must match its recorded
    /// content hash.
    pub fn verify(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::Invariant("bundle has no id".to_string()));
        }
        if self.created_by.is_empty() {
            return Err(Error::Invariant("bundle has no creator".to_string()));
        }
        if self.target_snapshot.is_empty() {
            return Err(Error::Invariant("bundle has no target snapshot".to_string()));
        }
        if !self.is_initial && self.source_snapshot.is_none() {
            return Err(Error::Invariant(
                "non-initial bundle has no source snapshot".to_string(),
            ));
        }
        if self.is_initial && self.source_snapshot.is_some() {
            return Err(Error::Invariant(
                "initial bundle carries a source snapshot".to_string(),
            ));
        }
        if self.repository.name.is_empty() || self.repository.dsp_dir.is_empty() {
            return Err(Error::Invariant(
                "bundle has incomplete repository information".to_string(),
            ));
        }
        let level = self.repository.config.compression_level;
        if !(compress::MIN_LEVEL..=compress::MAX_LEVEL).contains(&level) {
            return Err(Error::Invariant(format!(
                "invalid compression level: {level}"
            )));
        }

        let algorithm = self.repository.config.hash_algorithm;
        for (i, change) in self.changes.iter().enumerate() {
            if change.path.is_empty() {
                return Err(Error::Invariant(format!("change {i} has no path")));
            }
            if change.hash.is_empty() {
                return Err(Error::Invariant(format!("change {i} has no hash")));
            }
            if change.is_symlink && change.symlink_target.is_none() {
                return Err(Error::Invariant(format!(
                    "change {i} is a symlink but has no target"
                )));
            }

            let wants_payload = matches!(change.change_type, ChangeType::Add | ChangeType::Modify)
                && !change.is_symlink;
            if wants_payload {
                let content_hash = change.content_hash.as_deref().ok_or_else(|| {
                    Error::Invariant(format!("change {} has no content hash", change.path))
                })?;
                let payload = self.file_contents.get(&change.path).ok_or_else(|| {
                    Error::Invariant(format!("missing payload for {}", change.path))
                })?;
                let actual = hash::hash_bytes(algorithm, payload);
                if actual != content_hash {
                    return Err(Error::Invariant(format!(
                        "payload digest mismatch for {}: expected {content_hash}, got {actual}",
                        change.path
                    )));
                }
            } else if self.file_contents.contains_key(&change.path) {
                return Err(Error::Invariant(format!(
                    "unexpected payload for {} change {}",
                    change.change_type, change.path
                )));
            }
        }
        Ok(())
    }

    /// Decompress the stored payload for a path.
    pub fn payload(&self, path: &str) -> Result<Vec<u8>> {
        let compressed = self
            .file_contents
            .get(path)
            .ok_or_else(|| Error::not_found("bundle payload", path))?;
        compress::decompress(compressed)
    }

    /// Materialize the bundle into the working tree.
    ///
    /// Adds and modifies write the decompressed bytes (creating parent
    /// directories) and restore the recorded modification time; symlink
    /// records recreate the link; deletes unlink and ignore already-missing
    /// targets. Without `force`, an existing regular file whose content
    /// differs from the incoming record is left untouched and reported as a
    /// conflict.
    pub async fn apply(&self, force: bool) -> Result<ApplyStats> {
        let algorithm = self.repository.config.hash_algorithm;
        let mut stats = ApplyStats::default();

        for change in &self.changes {
            let path = Path::new(&change.path);
            match change.change_type {
                ChangeType::Delete => {
                    match fs::remove_file(path).await {
                        Ok(()) => stats.deleted += 1,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                ChangeType::Add | ChangeType::Modify => {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent).await?;
                    }
                    if change.is_symlink {
                        let target = change.symlink_target.as_deref().ok_or_else(|| {
                            Error::Invariant(format!("symlink {} has no target", change.path))
                        })?;
                        apply_symlink(path, target).await?;
                        stats.written += 1;
                        continue;
                    }

                    if !force && path.exists() {
                        let current = hash::hash_file(algorithm, path)?;
                        if current != change.hash {
                            return Err(Error::Invariant(format!(
                                "refusing to overwrite {}: local content differs from the bundle (pass force to override)",
                                change.path
                            )));
                        }
                    }

                    let bytes = self.payload(&change.path)?;
                    fs::write(path, &bytes).await?;
                    let mtime = filetime::FileTime::from_system_time(change.modified_time.into());
                    filetime::set_file_mtime(path, mtime)?;
                    stats.written += 1;
                }
            }
        }
        Ok(stats)
    }
}

#[cfg(unix)]
async fn apply_symlink(path: &Path, target: &str) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    fs::symlink(target, path).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn apply_symlink(_path: &Path, _target: &str) -> Result<()> {
    Err(Error::Config(
        "symlink restoration is not supported on this platform".to_string(),
    ))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyStats {
    pub written: u64,
    pub deleted: u64,
}
