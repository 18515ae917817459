use crate::bundle::Bundle;
use crate::{Error, Result};
use std::fs::File;
use std::path::Path;
use tracing::debug;

pub const ARCHIVE_EXTENSION: &str = "archive";

/// Pack a bundle into a single transport archive.
///
/// The archive holds `metadata.json` (the bundle record without payloads)
/// and a `contents/` directory whose entries are named by content hash, so
/// identical compressed blobs are stored once. The archive is staged in a
/// temporary directory and moved into place with a rename.
pub fn pack(bundle: &Bundle, dest: &Path) -> Result<()> {
    bundle.verify()?;

    let staging = tempfile::tempdir()?;
    let metadata_path = staging.path().join("metadata.json");
    std::fs::write(&metadata_path, serde_json::to_vec_pretty(bundle)?)?;

    let contents_dir = staging.path().join("contents");
    std::fs::create_dir(&contents_dir)?;
    for change in &bundle.changes {
        let Some(content_hash) = change.content_hash.as_deref() else {
            continue;
        };
        let payload = bundle
            .file_contents
            .get(&change.path)
            .ok_or_else(|| Error::Invariant(format!("missing payload for {}", change.path)))?;
        // Content-addressed name; duplicate blobs collapse to one entry.
        std::fs::write(contents_dir.join(content_hash), payload)?;
    }

    let parent = dest
        .parent()
        .ok_or_else(|| Error::Config(format!("invalid archive path: {}", dest.display())))?;
    std::fs::create_dir_all(parent)?;
    let tmp = tempfile::NamedTempFile::new_in(parent)?;
    {
        let mut builder = tar::Builder::new(tmp.as_file());
        builder.append_path_with_name(&metadata_path, "metadata.json")?;
        builder.append_dir_all("contents", &contents_dir)?;
        builder.finish()?;
    }
    tmp.persist(dest)
        .map_err(|e| Error::Io(e.error))?;

    debug!(archive = %dest.display(), changes = bundle.changes.len(), "bundle packed");
    Ok(())
}

/// Load and verify a bundle archive.
///
/// Extraction happens in a temporary directory; each change's payload is
/// rebound by looking up its content hash under `contents/`, and the bundle
/// verification re-checks every digest before the bundle is returned.
pub fn load(path: &Path) -> Result<Bundle> {
    if !path.exists() {
        return Err(Error::not_found("bundle archive", path.display().to_string()));
    }

    let staging = tempfile::tempdir()?;
    let mut archive = tar::Archive::new(File::open(path)?);
    archive.unpack(staging.path())?;

    let metadata = std::fs::read(staging.path().join("metadata.json"))
        .map_err(|_| Error::Invariant("archive has no metadata.json".to_string()))?;
    let mut bundle: Bundle = serde_json::from_slice(&metadata)?;

    let contents_dir = staging.path().join("contents");
    for change in &bundle.changes {
        let Some(content_hash) = change.content_hash.clone() else {
            continue;
        };
        let blob_path = contents_dir.join(&content_hash);
        let payload = std::fs::read(&blob_path).map_err(|_| {
            Error::Invariant(format!(
                "archive is missing payload {content_hash} for {}",
                change.path
            ))
        })?;
        bundle.file_contents.insert(change.path.clone(), payload);
    }

    bundle.verify()?;
    Ok(bundle)
}

/// The canonical archive file name for a bundle id.
pub fn archive_name(bundle_id: &str) -> String {
    format!("{bundle_id}.{ARCHIVE_EXTENSION}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::create_snapshot;
    use crate::tracking::TrackingConfig;
    use crate::{RepoConfig, RepoContext};

    async fn make_bundle(dir: &Path) -> Bundle {
        let ctx = RepoContext::init(dir, "demo", RepoConfig::default()).unwrap();
        let mut tracking = TrackingConfig::default();
        let data = dir.join("data");
        tracking.add_path(dir, &data, vec![]).unwrap();
        let snap = create_snapshot(&tracking.paths, "alice", "", ctx.config.hash_algorithm).unwrap();
        Bundle::create(&ctx, &tracking, None, &snap, "alice", Some("first".to_string()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn pack_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("data/a.txt"), b"hello\n").unwrap();
        std::fs::write(dir.path().join("data/b.txt"), b"world\n").unwrap();

        let bundle = make_bundle(dir.path()).await;
        let archive_path = dir.path().join(".dsp/bundles").join(archive_name(&bundle.id));
        pack(&bundle, &archive_path).unwrap();
        assert!(archive_path.is_file());

        let loaded = load(&archive_path).unwrap();
        assert_eq!(loaded.id, bundle.id);
        assert_eq!(loaded.is_initial, bundle.is_initial);
        assert_eq!(loaded.changes.len(), bundle.changes.len());
        for change in &loaded.changes {
            assert_eq!(
                loaded.payload(&change.path).unwrap(),
                bundle.payload(&change.path).unwrap()
            );
        }
    }

    #[tokio::test]
    async fn identical_payloads_are_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("data/a.txt"), b"same bytes").unwrap();
        std::fs::write(dir.path().join("data/b.txt"), b"same bytes").unwrap();

        let bundle = make_bundle(dir.path()).await;
        let hashes: std::collections::HashSet<_> = bundle
            .changes
            .iter()
            .filter_map(|c| c.content_hash.clone())
            .collect();
        assert_eq!(hashes.len(), 1);

        let archive_path = dir.path().join("out.archive");
        pack(&bundle, &archive_path).unwrap();
        let loaded = load(&archive_path).unwrap();
        assert_eq!(loaded.payload(&loaded.changes[0].path).unwrap(), b"same bytes");
    }

    #[tokio::test]
    async fn tampered_content_hash_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("data/a.txt"), b"payload").unwrap();

        let mut bundle = make_bundle(dir.path()).await;
        // Re-point a change at a digest its payload no longer matches.
        let victim = bundle
            .changes
            .iter_mut()
            .find(|c| c.content_hash.is_some())
            .unwrap();
        victim.content_hash = Some("0".repeat(64));

        let archive_path = dir.path().join("out.archive");
        let err = pack(&bundle, &archive_path).unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[test]
    fn loading_missing_archive_is_not_found() {
        let err = load(Path::new("/nonexistent/b.archive")).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
