//! Directory-level captures of an instance's working directory.
//!
//! A snapshot is a tar archive whose entry names are rooted at `/` with the
//! leading slash removed, so `/vibe0/src/main.rs` is stored as
//! `vibe0/src/main.rs`. Restoring a snapshot is a plain extraction into `/`
//! of the working container; capturing replaces the stored snapshot
//! wholesale.

use crate::error::{SandboxError, SandboxResult};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Full capture of the working directory after a completed command.
#[derive(Debug, Clone)]
pub struct WorkspaceSnapshot {
    archive: Arc<[u8]>,
    digest: String,
    captured_at: DateTime<Utc>,
}

impl WorkspaceSnapshot {
    pub fn from_archive(archive: Vec<u8>) -> Self {
        let digest = compute_digest(&archive);
        Self {
            archive: archive.into(),
            digest,
            captured_at: Utc::now(),
        }
    }

    /// Archive a host directory as if it were mounted at `workdir`.
    pub fn capture_dir(dir: &Path, workdir: &str) -> SandboxResult<Self> {
        let prefix = archive_prefix(workdir)?;
        let mut builder = tar::Builder::new(Vec::new());
        builder.mode(tar::HeaderMode::Deterministic);
        builder.follow_symlinks(false);

        for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| SandboxError::IoError(e.into()))?;
            let relative = entry
                .path()
                .strip_prefix(dir)
                .map_err(|e| SandboxError::InvalidArgument(e.to_string()))?;
            let name = prefix.join(relative);
            builder.append_path_with_name(entry.path(), &name)?;
        }

        Ok(Self::from_archive(builder.into_inner()?))
    }

    pub fn archive(&self) -> &[u8] {
        &self.archive
    }

    /// SHA-256 of the archive bytes, hex encoded.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn size(&self) -> usize {
        self.archive.len()
    }

    /// Regular files contained in the snapshot, as absolute container paths.
    pub fn files(&self) -> SandboxResult<Vec<PathBuf>> {
        let mut archive = tar::Archive::new(self.archive());
        let mut files = Vec::new();
        for entry in archive.entries()? {
            let entry = entry?;
            if entry.header().entry_type().is_file() {
                files.push(Path::new("/").join(entry.path()?));
            }
        }
        Ok(files)
    }

    /// Unpack into a host directory standing in for the container's `/`.
    pub fn unpack_into(&self, root: &Path) -> SandboxResult<()> {
        tar::Archive::new(self.archive()).unpack(root)?;
        Ok(())
    }
}

/// A file to place into the working container before the command runs.
#[derive(Debug, Clone)]
pub struct FileWrite {
    /// Absolute container path.
    pub path: String,
    pub content: Vec<u8>,
}

/// Build the archive restored into a working container: the snapshot (if
/// any) followed by individual file writes. Later entries win on extraction.
pub fn layer_archive(
    snapshot: Option<&WorkspaceSnapshot>,
    files: &[FileWrite],
) -> SandboxResult<Option<Vec<u8>>> {
    if files.is_empty() {
        return Ok(snapshot.map(|s| s.archive().to_vec()));
    }

    let mut builder = tar::Builder::new(Vec::new());
    if let Some(snapshot) = snapshot {
        let mut archive = tar::Archive::new(snapshot.archive());
        for entry in archive.entries()? {
            let mut entry = entry?;
            let mut header = entry.header().clone();
            let path = entry.path()?.into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            builder.append_data(&mut header, path, data.as_slice())?;
        }
    }

    for file in files {
        let name = archive_prefix(&file.path)?;
        let mut header = tar::Header::new_gnu();
        header.set_size(file.content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(Utc::now().timestamp().max(0) as u64);
        header.set_cksum();
        builder.append_data(&mut header, name, file.content.as_slice())?;
    }

    Ok(Some(builder.into_inner()?))
}

/// Re-root an archive produced by copying `workdir` out of a container.
///
/// Container engines emit entries relative to the working directory's
/// parent (`vibe0/...` for `/vibe0`); nested working directories need
/// their remaining parent components put back.
pub fn rebase_archive(archive: Vec<u8>, workdir: &str) -> SandboxResult<Vec<u8>> {
    let prefix = archive_prefix(workdir)?;
    let parent = match prefix.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => return Ok(archive),
    };

    let mut builder = tar::Builder::new(Vec::new());
    let mut source = tar::Archive::new(archive.as_slice());
    for entry in source.entries()? {
        let mut entry = entry?;
        let mut header = entry.header().clone();
        let path = parent.join(entry.path()?);
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        builder.append_data(&mut header, path, data.as_slice())?;
    }
    Ok(builder.into_inner()?)
}

/// Resolve `path` against `workdir`, rejecting parent traversal.
pub fn resolve_path(workdir: &str, path: &str) -> SandboxResult<String> {
    let candidate = Path::new(path);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        Path::new(workdir).join(candidate)
    };

    let mut normalized = PathBuf::from("/");
    for component in joined.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(SandboxError::InvalidArgument(format!(
                    "Path must not escape the container root: {}",
                    path
                )))
            }
        }
    }
    Ok(normalized.to_string_lossy().into_owned())
}

/// Archive entry name for an absolute container path.
fn archive_prefix(path: &str) -> SandboxResult<PathBuf> {
    let resolved = resolve_path("/", path)?;
    let relative = resolved.trim_start_matches('/');
    if relative.is_empty() {
        return Err(SandboxError::InvalidArgument(
            "The container root cannot be used as a working directory".to_string(),
        ));
    }
    Ok(PathBuf::from(relative))
}

fn compute_digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Holds the most recent snapshot of one instance.
///
/// The lock doubles as the instance's critical section: a command keeps the
/// guard from reading the snapshot until it stores the next one.
#[derive(Debug, Default)]
pub struct WorkspaceStore {
    current: Mutex<Option<WorkspaceSnapshot>>,
}

impl WorkspaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, Option<WorkspaceSnapshot>> {
        self.current.lock().await
    }

    pub async fn current(&self) -> Option<WorkspaceSnapshot> {
        self.current.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.current.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_paths_against_workdir() {
        assert_eq!(resolve_path("/vibe0", "f.txt").unwrap(), "/vibe0/f.txt");
        assert_eq!(resolve_path("/vibe0", "./a/b").unwrap(), "/vibe0/a/b");
        assert_eq!(resolve_path("/vibe0", "/etc/hosts").unwrap(), "/etc/hosts");
        assert!(resolve_path("/vibe0", "../etc/passwd").is_err());
    }

    #[test]
    fn root_is_not_a_workdir() {
        assert!(archive_prefix("/").is_err());
        assert_eq!(archive_prefix("/custom/workdir").unwrap(), PathBuf::from("custom/workdir"));
    }

    #[test]
    fn capture_and_unpack_preserve_files() {
        let source = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(source.path().join("src")).unwrap();
        std::fs::write(source.path().join("src/lib.rs"), "pub fn f() {}").unwrap();
        std::fs::write(source.path().join("f.txt"), "one\n").unwrap();

        let snapshot = WorkspaceSnapshot::capture_dir(source.path(), "/vibe0").unwrap();
        let mut files = snapshot.files().unwrap();
        files.sort();
        assert_eq!(
            files,
            vec![PathBuf::from("/vibe0/f.txt"), PathBuf::from("/vibe0/src/lib.rs")]
        );

        let root = tempfile::tempdir().unwrap();
        snapshot.unpack_into(root.path()).unwrap();
        assert_eq!(
            std::fs::read_to_string(root.path().join("vibe0/f.txt")).unwrap(),
            "one\n"
        );
    }

    #[test]
    fn identical_directories_share_a_digest() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::write(a.path().join("x"), "same").unwrap();
        std::fs::write(b.path().join("x"), "same").unwrap();

        let first = WorkspaceSnapshot::capture_dir(a.path(), "/w").unwrap();
        let second = WorkspaceSnapshot::capture_dir(b.path(), "/w").unwrap();
        assert_eq!(first.digest(), second.digest());
        assert_eq!(first.digest().len(), 64);
    }

    #[test]
    fn layered_writes_follow_the_snapshot() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("keep.txt"), "kept").unwrap();
        let snapshot = WorkspaceSnapshot::capture_dir(source.path(), "/vibe0").unwrap();

        let archive = layer_archive(
            Some(&snapshot),
            &[FileWrite {
                path: "/vibe0/new.txt".to_string(),
                content: b"fresh".to_vec(),
            }],
        )
        .unwrap()
        .unwrap();

        let root = tempfile::tempdir().unwrap();
        WorkspaceSnapshot::from_archive(archive)
            .unpack_into(root.path())
            .unwrap();
        assert_eq!(std::fs::read_to_string(root.path().join("vibe0/keep.txt")).unwrap(), "kept");
        assert_eq!(std::fs::read_to_string(root.path().join("vibe0/new.txt")).unwrap(), "fresh");
    }

    #[test]
    fn layering_nothing_is_nothing() {
        assert!(layer_archive(None, &[]).unwrap().is_none());
    }

    #[test]
    fn rebase_restores_nested_parent() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("f"), "x").unwrap();
        // What an engine hands back for `/custom/workdir`: entries under `workdir/`.
        let copied = WorkspaceSnapshot::capture_dir(source.path(), "/workdir").unwrap();

        let rebased = rebase_archive(copied.archive().to_vec(), "/custom/workdir").unwrap();
        let files = WorkspaceSnapshot::from_archive(rebased).files().unwrap();
        assert_eq!(files, vec![PathBuf::from("/custom/workdir/f")]);
    }

    #[tokio::test]
    async fn store_starts_empty_and_clears() {
        let store = WorkspaceStore::new();
        assert!(store.current().await.is_none());

        *store.lock().await = Some(WorkspaceSnapshot::from_archive(Vec::new()));
        assert!(store.current().await.is_some());

        store.clear().await;
        assert!(store.current().await.is_none());
    }
}
