use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use runbox_filesign::Signer;
use thiserror::Error;
use tracing::warn;

/// Owner applied to sandbox directories and files so the non-root runner
/// user can read and write them.
const SANDBOX_UID: u32 = 1000;
const SANDBOX_GID: u32 = 1000;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("conversation id cannot be empty")]
    EmptyConversationId,

    #[error("invalid filename: {0}")]
    InvalidFilename(String),

    // Reports the hashed id, never the server-view path.
    #[error("sandbox {hashed_id}: {source}")]
    Io {
        hashed_id: String,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ManagerError>;

/// An ensured sandbox directory: the hashed name used in URLs and bind
/// mounts, and the server-view path used for local I/O.
#[derive(Debug, Clone)]
pub struct SandboxDir {
    pub hashed_id: String,
    pub path: PathBuf,
}

/// Manages per-conversation sandbox directories on disk.
///
/// Two roots are tracked: `sandbox_root` is the server's view, used for all
/// filesystem operations; `sandbox_host_path` is the Docker host's view of
/// the same directory, used only when composing bind mounts. They differ
/// only in nested-container deployments where the server shares the host's
/// Docker daemon.
pub struct SandboxManager {
    sandbox_root: PathBuf,
    sandbox_host_path: PathBuf,
    signer: Arc<Signer>,
}

impl SandboxManager {
    pub fn new(
        sandbox_root: impl Into<PathBuf>,
        sandbox_host_path: impl Into<PathBuf>,
        signer: Arc<Signer>,
    ) -> Self {
        Self {
            sandbox_root: sandbox_root.into(),
            sandbox_host_path: sandbox_host_path.into(),
            signer,
        }
    }

    /// Ensure the sandbox directory for a conversation exists. Idempotent.
    ///
    /// The directory is created with mode 0o777 and chowned to the runner
    /// user; chown/chmod failures are logged and ignored since some host
    /// filesystems (shared-folder mounts in particular) reject them.
    pub fn ensure(&self, conversation_id: &str) -> Result<SandboxDir> {
        if conversation_id.is_empty() {
            return Err(ManagerError::EmptyConversationId);
        }

        let hashed_id = self.signer.hashed_id(conversation_id);
        let path = self.sandbox_root.join(&hashed_id);

        fs::create_dir_all(&path).map_err(|source| ManagerError::Io {
            hashed_id: hashed_id.clone(),
            source,
        })?;
        set_sandbox_permissions(&path, 0o777);

        Ok(SandboxDir { hashed_id, path })
    }

    /// The Docker-host path for a conversation's sandbox, for bind mounts.
    /// Purely path arithmetic; never touches the filesystem.
    pub fn host_path(&self, conversation_id: &str) -> PathBuf {
        self.sandbox_host_path
            .join(self.signer.hashed_id(conversation_id))
    }

    /// Write a file into a conversation's sandbox, creating the sandbox
    /// directory if needed.
    pub fn write_file(
        &self,
        conversation_id: &str,
        filename: &str,
        content: &[u8],
    ) -> Result<()> {
        validate_filename(filename)?;
        let dir = self.ensure(conversation_id)?;

        let file_path = dir.path.join(filename);
        fs::write(&file_path, content).map_err(|source| ManagerError::Io {
            hashed_id: dir.hashed_id.clone(),
            source,
        })?;
        chown_sandbox(&file_path);

        Ok(())
    }

    /// List the files in a conversation's sandbox. A sandbox that was never
    /// created lists as empty; directory entries are skipped.
    pub fn list_files(&self, conversation_id: &str) -> Result<Vec<String>> {
        let hashed_id = self.signer.hashed_id(conversation_id);
        let dir = self.sandbox_root.join(&hashed_id);

        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&dir).map_err(|source| ManagerError::Io {
            hashed_id: hashed_id.clone(),
            source,
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ManagerError::Io {
                hashed_id: hashed_id.clone(),
                source,
            })?;
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if is_file {
                files.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        Ok(files)
    }

    /// Compose the server-view path for a file, addressed by hashed id the
    /// way the download handler sees it. The caller is responsible for
    /// traversal checks on the realized path.
    pub fn file_path(&self, hashed_id: &str, filename: &str) -> PathBuf {
        self.sandbox_root.join(hashed_id).join(filename)
    }

    /// Root directory containing every sandbox.
    pub fn sandbox_root(&self) -> &Path {
        &self.sandbox_root
    }

    /// Remove a conversation's sandbox and all of its contents.
    pub fn delete(&self, conversation_id: &str) -> Result<()> {
        let hashed_id = self.signer.hashed_id(conversation_id);
        let dir = self.sandbox_root.join(&hashed_id);
        if !dir.exists() {
            return Ok(());
        }
        fs::remove_dir_all(&dir).map_err(|source| ManagerError::Io { hashed_id, source })
    }
}

/// Sandbox files live at depth 1; reject names that would land anywhere else.
fn validate_filename(filename: &str) -> Result<()> {
    if filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains('/')
        || filename.contains('\\')
    {
        return Err(ManagerError::InvalidFilename(filename.to_string()));
    }
    Ok(())
}

fn set_sandbox_permissions(path: &Path, mode: u32) {
    chown_sandbox(path);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
            warn!("failed to chmod {:o} on sandbox dir: {}", mode, e);
        }
    }
    #[cfg(not(unix))]
    let _ = mode;
}

fn chown_sandbox(path: &Path) {
    #[cfg(unix)]
    if let Err(e) = std::os::unix::fs::chown(path, Some(SANDBOX_UID), Some(SANDBOX_GID)) {
        warn!(
            "failed to chown sandbox path to {}:{}: {}",
            SANDBOX_UID, SANDBOX_GID, e
        );
    }
    #[cfg(not(unix))]
    let _ = path;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn test_manager() -> (SandboxManager, TempDir) {
        let root = TempDir::new().unwrap();
        let signer = Arc::new(Signer::new("test-secret", "http://localhost:8080"));
        let manager = SandboxManager::new(root.path(), "/mnt/host/sandboxes", signer);
        (manager, root)
    }

    fn test_signer() -> Signer {
        Signer::new("test-secret", "http://localhost:8080")
    }

    #[test]
    fn test_ensure_creates_directory() {
        let (manager, root) = test_manager();
        let dir = manager.ensure("conv-1").unwrap();

        assert!(dir.path.is_dir());
        assert_eq!(dir.path, root.path().join(&dir.hashed_id));
        assert_eq!(dir.hashed_id.len(), runbox_filesign::HASHED_ID_LEN);
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let (manager, _root) = test_manager();
        let first = manager.ensure("conv-1").unwrap();
        manager.write_file("conv-1", "keep.txt", b"data").unwrap();
        let second = manager.ensure("conv-1").unwrap();

        assert_eq!(first.hashed_id, second.hashed_id);
        assert_eq!(first.path, second.path);
        assert_eq!(manager.list_files("conv-1").unwrap(), vec!["keep.txt"]);
    }

    #[test]
    fn test_ensure_rejects_empty_conversation_id() {
        let (manager, _root) = test_manager();
        assert!(matches!(
            manager.ensure(""),
            Err(ManagerError::EmptyConversationId)
        ));
    }

    #[test]
    fn test_hashed_id_matches_signer() {
        let (manager, _root) = test_manager();
        let dir = manager.ensure("conv-1").unwrap();
        assert_eq!(dir.hashed_id, test_signer().hashed_id("conv-1"));
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let (manager, root) = test_manager();
        manager
            .write_file("conv-1", "data.csv", b"name,age\nA,1\n")
            .unwrap();

        let on_disk = root
            .path()
            .join(test_signer().hashed_id("conv-1"))
            .join("data.csv");
        assert_eq!(fs::read(on_disk).unwrap(), b"name,age\nA,1\n");
    }

    #[test]
    fn test_write_file_rejects_traversal_names() {
        let (manager, _root) = test_manager();
        for bad in ["", ".", "..", "a/b", "../escape", "a\\b"] {
            assert!(
                matches!(
                    manager.write_file("conv-1", bad, b"x"),
                    Err(ManagerError::InvalidFilename(_))
                ),
                "expected rejection for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_list_files_missing_sandbox_is_empty() {
        let (manager, _root) = test_manager();
        assert!(manager.list_files("never-used").unwrap().is_empty());
    }

    #[test]
    fn test_list_files_skips_directories() {
        let (manager, _root) = test_manager();
        let dir = manager.ensure("conv-1").unwrap();
        manager.write_file("conv-1", "a.txt", b"a").unwrap();
        fs::create_dir(dir.path.join("subdir")).unwrap();

        let files = manager.list_files("conv-1").unwrap();
        assert_eq!(files, vec!["a.txt"]);
    }

    #[test]
    fn test_host_path_composition() {
        let (manager, _root) = test_manager();
        assert_eq!(
            manager.host_path("conv-1"),
            PathBuf::from("/mnt/host/sandboxes").join(test_signer().hashed_id("conv-1"))
        );
    }

    #[test]
    fn test_file_path_composition() {
        let (manager, root) = test_manager();
        let path = manager.file_path("abc123", "out.txt");
        assert_eq!(path, root.path().join("abc123").join("out.txt"));
    }

    #[test]
    fn test_delete_removes_sandbox() {
        let (manager, _root) = test_manager();
        let dir = manager.ensure("conv-1").unwrap();
        manager.write_file("conv-1", "a.txt", b"a").unwrap();

        manager.delete("conv-1").unwrap();
        assert!(!dir.path.exists());

        // Deleting an absent sandbox is not an error.
        manager.delete("conv-1").unwrap();
    }

    #[test]
    fn test_io_error_reports_hashed_id_not_root_path() {
        let (manager, root) = test_manager();
        // Occupy the sandbox path with a regular file so directory creation fails.
        let hashed = test_signer().hashed_id("conv-1");
        fs::write(root.path().join(&hashed), b"not a dir").unwrap();

        let err = manager.write_file("conv-1", "a.txt", b"a").unwrap_err();
        let message = err.to_string();
        assert!(message.contains(&hashed));
        assert!(!message.contains(root.path().to_str().unwrap()));
    }
}
