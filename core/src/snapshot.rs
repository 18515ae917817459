use crate::hash::{self, HashAlgorithm};
use crate::tracking::TrackedPath;
use crate::{Error, RepoContext, Result};
use chrono::{DateTime, Utc};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use tokio::fs;
use tracing::debug;
use walkdir::WalkDir;

/// Immutable record of the tracked tree at a point in time.
///
/// Written once under `snapshots/<id>/snapshot.json` with an atomic rename;
/// never mutated afterwards. Ids are unique within a repository and lexically
/// ordered by creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub user: String,
    pub message: String,
    pub files: Vec<FileRecord>,
    pub stats: Stats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub hash: String,
    pub size: u64,
    pub modified_time: DateTime<Utc>,
    pub is_symlink: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub total_files: u64,
    pub total_size: u64,
    pub symlink_count: u64,
    pub regular_files: u64,
    pub excluded_files: u64,
    pub processing_time_ms: u64,
}

/// Glob matching options for exclude patterns: `*` and `?` never cross a
/// path separator, so `*.log` matches only at the top of the tracked tree.
const EXCLUDE_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Walk the tracked paths and produce a snapshot record.
///
/// Non-existent tracked roots are skipped (they may reappear later); any
/// other I/O error aborts the snapshot. Symlinks are recorded with their
/// target string hashed instead of their content.
pub fn create_snapshot(
    tracked: &[TrackedPath],
    user: &str,
    message: &str,
    algorithm: HashAlgorithm,
) -> Result<Snapshot> {
    let started = Instant::now();
    let now = Utc::now();
    let mut snapshot = Snapshot {
        id: now.format("%Y%m%d-%H%M%S").to_string(),
        timestamp: now,
        user: user.to_string(),
        message: message.to_string(),
        files: Vec::new(),
        stats: Stats::default(),
    };

    for path in tracked {
        process_tracked_path(path, algorithm, &mut snapshot)?;
    }

    snapshot.stats.processing_time_ms = started.elapsed().as_millis() as u64;
    Ok(snapshot)
}

fn process_tracked_path(
    tracked: &TrackedPath,
    algorithm: HashAlgorithm,
    snapshot: &mut Snapshot,
) -> Result<()> {
    let meta = match std::fs::symlink_metadata(&tracked.path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %tracked.path.display(), "tracked path missing, skipping");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if !meta.is_dir() {
        let record = record_file(&tracked.path, &meta, algorithm)?;
        push_record(snapshot, record);
        return Ok(());
    }

    let excludes = tracked
        .excludes
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|e| Error::Config(format!("invalid exclude pattern {p}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut walker = WalkDir::new(&tracked.path)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if entry.depth() == 0 {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(&tracked.path)
            .expect("walked entry is under its root");
        let rel_str = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");

        if excludes
            .iter()
            .any(|p| p.matches_with(&rel_str, EXCLUDE_MATCH))
        {
            snapshot.stats.excluded_files += 1;
            if entry.file_type().is_dir() {
                // A directory match prunes its entire subtree.
                walker.skip_current_dir();
            }
            continue;
        }

        if entry.file_type().is_dir() {
            continue;
        }

        let meta = entry.metadata().map_err(|e| Error::Io(e.into()))?;
        let record = record_file(entry.path(), &meta, algorithm)?;
        push_record(snapshot, record);
    }

    Ok(())
}

fn record_file(
    path: &Path,
    meta: &std::fs::Metadata,
    algorithm: HashAlgorithm,
) -> Result<FileRecord> {
    let is_symlink = meta.is_symlink();
    let (hash, symlink_target) = if is_symlink {
        let target = std::fs::read_link(path)?;
        let target = target.to_string_lossy().to_string();
        (hash::hash_bytes(algorithm, target.as_bytes()), Some(target))
    } else {
        (hash::hash_file(algorithm, path)?, None)
    };

    let modified_time = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    Ok(FileRecord {
        path: path.to_string_lossy().to_string(),
        hash,
        size: meta.len(),
        modified_time,
        is_symlink,
        symlink_target,
        change_type: None,
    })
}

fn push_record(snapshot: &mut Snapshot, record: FileRecord) {
    snapshot.stats.total_files += 1;
    snapshot.stats.total_size += record.size;
    if record.is_symlink {
        snapshot.stats.symlink_count += 1;
    } else {
        snapshot.stats.regular_files += 1;
    }
    snapshot.files.push(record);
}

/// Persist a snapshot under `snapshots/<id>/snapshot.json`.
///
/// The record is written to a temporary file first; the rename is the commit
/// point, so a failed write never leaves a partial snapshot behind.
pub async fn save(ctx: &RepoContext, snapshot: &Snapshot) -> Result<()> {
    let dir = ctx.snapshots_dir().join(&snapshot.id);
    fs::create_dir_all(&dir).await?;
    let data = serde_json::to_vec_pretty(snapshot)?;
    let tmp = dir.join("snapshot.json.tmp");
    fs::write(&tmp, &data).await?;
    fs::rename(&tmp, dir.join("snapshot.json")).await?;
    Ok(())
}

pub async fn load(ctx: &RepoContext, id: &str) -> Result<Snapshot> {
    let path = ctx.snapshots_dir().join(id).join("snapshot.json");
    let data = fs::read(&path)
        .await
        .map_err(|_| Error::not_found("snapshot", id))?;
    Ok(serde_json::from_slice(&data)?)
}

/// List snapshot ids, oldest first.
pub async fn list(ctx: &RepoContext) -> Result<Vec<String>> {
    let dir = ctx.snapshots_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    let mut entries = fs::read_dir(&dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() && entry.path().join("snapshot.json").exists() {
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
    }
    ids.sort();
    Ok(ids)
}

pub async fn latest(ctx: &RepoContext) -> Result<Option<Snapshot>> {
    match list(ctx).await?.last() {
        Some(id) => Ok(Some(load(ctx, id).await?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RepoConfig;
    use std::path::PathBuf;

    fn tracked_dir(path: PathBuf, excludes: &[&str]) -> TrackedPath {
        TrackedPath {
            path,
            is_dir: true,
            excludes: excludes.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn snapshot_records_files_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello\n").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"world\n").unwrap();

        let tracked = vec![tracked_dir(dir.path().to_path_buf(), &[])];
        let snap = create_snapshot(&tracked, "alice", "first", HashAlgorithm::Blake3).unwrap();

        assert_eq!(snap.files.len(), 2);
        assert_eq!(snap.stats.total_files, 2);
        assert_eq!(snap.stats.regular_files, 2);
        assert_eq!(snap.stats.total_size, 12);

        let a = snap
            .files
            .iter()
            .find(|f| f.path.ends_with("a.txt"))
            .unwrap();
        assert_eq!(a.hash, hash::hash_bytes(HashAlgorithm::Blake3, b"hello\n"));
    }

    #[test]
    fn exclusion_filters_matching_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.log"), b"log").unwrap();
        std::fs::write(dir.path().join("x.txt"), b"txt").unwrap();

        let tracked = vec![tracked_dir(dir.path().to_path_buf(), &["*.log"])];
        let snap = create_snapshot(&tracked, "alice", "", HashAlgorithm::Blake3).unwrap();

        assert_eq!(snap.files.len(), 1);
        assert!(snap.files[0].path.ends_with("x.txt"));
        assert_eq!(snap.stats.excluded_files, 1);
    }

    #[test]
    fn excluded_directory_prunes_subtree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("build/deep")).unwrap();
        std::fs::write(dir.path().join("build/deep/out.bin"), b"bin").unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"keep").unwrap();

        let tracked = vec![tracked_dir(dir.path().to_path_buf(), &["build"])];
        let snap = create_snapshot(&tracked, "alice", "", HashAlgorithm::Blake3).unwrap();

        assert_eq!(snap.files.len(), 1);
        assert!(snap.files[0].path.ends_with("keep.txt"));
    }

    #[test]
    fn star_does_not_cross_separators() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("top.log"), b"1").unwrap();
        std::fs::write(dir.path().join("sub/nested.log"), b"2").unwrap();

        let tracked = vec![tracked_dir(dir.path().to_path_buf(), &["*.log"])];
        let snap = create_snapshot(&tracked, "alice", "", HashAlgorithm::Blake3).unwrap();

        let paths: Vec<_> = snap.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].ends_with("nested.log"));
    }

    #[test]
    fn missing_tracked_root_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("real.txt"), b"real").unwrap();
        let tracked = vec![
            tracked_dir(dir.path().join("gone"), &[]),
            TrackedPath {
                path: dir.path().join("real.txt"),
                is_dir: false,
                excludes: vec![],
            },
        ];
        let snap = create_snapshot(&tracked, "alice", "", HashAlgorithm::Blake3).unwrap();
        assert_eq!(snap.files.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_hashes_target_string() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("real.txt"), b"real").unwrap();
        std::os::unix::fs::symlink("real.txt", dir.path().join("link")).unwrap();

        let tracked = vec![tracked_dir(dir.path().to_path_buf(), &[])];
        let snap = create_snapshot(&tracked, "alice", "", HashAlgorithm::Blake3).unwrap();

        let link = snap.files.iter().find(|f| f.is_symlink).unwrap();
        assert_eq!(link.symlink_target.as_deref(), Some("real.txt"));
        assert_eq!(
            link.hash,
            hash::hash_bytes(HashAlgorithm::Blake3, b"real.txt")
        );
        assert_eq!(snap.stats.symlink_count, 1);
    }

    #[test]
    fn unchanged_tree_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"same").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"same too").unwrap();
        let tracked = vec![tracked_dir(dir.path().to_path_buf(), &[])];

        let one = create_snapshot(&tracked, "alice", "", HashAlgorithm::Sha256).unwrap();
        let two = create_snapshot(&tracked, "alice", "", HashAlgorithm::Sha256).unwrap();

        let strip = |s: &Snapshot| {
            s.files
                .iter()
                .map(|f| (f.path.clone(), f.hash.clone(), f.size))
                .collect::<Vec<_>>()
        };
        assert_eq!(strip(&one), strip(&two));
    }

    #[tokio::test]
    async fn save_load_list_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RepoContext::init(dir.path(), "demo", RepoConfig::default()).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hi").unwrap();

        let tracked = vec![TrackedPath {
            path: dir.path().join("a.txt"),
            is_dir: false,
            excludes: vec![],
        }];
        let snap = create_snapshot(&tracked, "alice", "msg", HashAlgorithm::Blake3).unwrap();
        save(&ctx, &snap).await.unwrap();

        let ids = list(&ctx).await.unwrap();
        assert_eq!(ids, vec![snap.id.clone()]);

        let loaded = load(&ctx, &snap.id).await.unwrap();
        assert_eq!(loaded.files.len(), 1);
        assert_eq!(loaded.message, "msg");

        assert!(latest(&ctx).await.unwrap().is_some());
        assert!(matches!(
            load(&ctx, "nope").await.unwrap_err(),
            Error::NotFound { .. }
        ));
    }
}
