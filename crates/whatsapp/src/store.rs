//! Credential store: the on-disk auth directory the transport persists into.

use std::{
    io,
    path::{Path, PathBuf},
};

use tracing::debug;

/// Credential directory shared with the transport.
///
/// The core only guarantees the directory exists before the first connect;
/// what the transport writes inside it is its own business.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    root: PathBuf,
}

impl CredentialStore {
    /// Open the store at `root`, creating it (mode 0700 on Unix) if absent.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o700))?;
            }
            debug!(path = %root.display(), "created credential directory");
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Per-client subdirectory, laid out as `session-<client_id>`.
    pub fn session_dir(&self, client_id: &str) -> PathBuf {
        self.root.join(format!("session-{client_id}"))
    }

    /// True when the transport has persisted anything for `client_id`.
    pub fn has_credentials(&self, client_id: &str) -> bool {
        std::fs::read_dir(self.session_dir(client_id))
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }
}
