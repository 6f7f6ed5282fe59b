//! Host-side directory that carries the submitted code into the container.

use std::path::{Path, PathBuf};
use tempfile::{Builder, TempDir};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::errors::SandboxError;

/// A temporary directory holding one code file. Deleted when dropped.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    code_path: PathBuf,
}

impl Workspace {
    /// Create `<root>/<prefix>XXXX/<code_file>` containing `code`.
    ///
    /// The directory is made world-readable so the unprivileged sandbox user
    /// can read the bind mount.
    pub async fn prepare(
        root: &Path,
        prefix: &str,
        code_file: &str,
        code: &str,
    ) -> Result<Self, SandboxError> {
        let dir = Builder::new().prefix(prefix).tempdir_in(root).map_err(|e| {
            SandboxError::IoError(format!(
                "Could not create workspace in {}: {}",
                root.display(),
                e
            ))
        })?;
        let code_path = dir.path().join(code_file);

        let mut file = fs::File::create(&code_path).await?;
        file.write_all(code.as_bytes()).await?;
        file.flush().await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).await?;
            fs::set_permissions(&code_path, std::fs::Permissions::from_mode(0o644)).await?;
        }

        Ok(Self { dir, code_path })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn code_path(&self) -> &Path {
        &self.code_path
    }
}
