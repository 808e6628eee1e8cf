use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::JudgeError;

/// Mount backend for per-task scratch directories.
pub trait ScratchMount: Send + Sync {
    fn mount(&self, dir: &Path, size: &str) -> std::io::Result<()>;
    fn unmount(&self, dir: &Path) -> std::io::Result<()>;
}

/// Ephemeral in-memory filesystem (needs CAP_SYS_ADMIN).
#[derive(Debug, Default, Clone, Copy)]
pub struct TmpfsMount;

#[cfg(target_os = "linux")]
impl ScratchMount for TmpfsMount {
    fn mount(&self, dir: &Path, size: &str) -> std::io::Result<()> {
        use nix::mount::{MsFlags, mount};

        let data = format!("size={size}");
        mount(
            Some("tmpfs"),
            dir,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some(data.as_str()),
        )
        .map_err(std::io::Error::from)
    }

    fn unmount(&self, dir: &Path) -> std::io::Result<()> {
        use nix::mount::{MntFlags, umount2};

        umount2(dir, MntFlags::MNT_DETACH).map_err(std::io::Error::from)
    }
}

#[cfg(not(target_os = "linux"))]
impl ScratchMount for TmpfsMount {
    fn mount(&self, _dir: &Path, _size: &str) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "tmpfs scratch mounts are only supported on Linux",
        ))
    }

    fn unmount(&self, _dir: &Path) -> std::io::Result<()> {
        Ok(())
    }
}

/// Plain directories, for unprivileged deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMount;

impl ScratchMount for NoMount {
    fn mount(&self, _dir: &Path, _size: &str) -> std::io::Result<()> {
        Ok(())
    }

    fn unmount(&self, _dir: &Path) -> std::io::Result<()> {
        Ok(())
    }
}

/// Scratch directory owned by exactly one judge task. Released exactly
/// once: explicitly through [`ScratchDir::release`], or on drop when the
/// task was torn down early.
pub struct ScratchDir {
    path: PathBuf,
    mounter: Arc<dyn ScratchMount>,
    released: bool,
}

impl ScratchDir {
    /// Create `<root>/<host>/<rid>` and mount it. The returned guard also
    /// reports a mount failure, so the directory is cleaned up either way.
    pub fn create(
        root: &Path,
        host: &str,
        rid: &str,
        mounter: Arc<dyn ScratchMount>,
        size: &str,
    ) -> (Self, Result<(), JudgeError>) {
        let path = root.join(host).join(rid);
        let guard = Self {
            path,
            mounter,
            released: false,
        };
        let result = guard.prepare(size);
        (guard, result)
    }

    fn prepare(&self, size: &str) -> Result<(), JudgeError> {
        std::fs::create_dir_all(&self.path).map_err(|e| {
            JudgeError::system(format!(
                "failed to create scratch dir {}: {e}",
                self.path.display()
            ))
        })?;
        self.mounter.mount(&self.path, size).map_err(|e| {
            JudgeError::system(format!(
                "failed to mount scratch dir {}: {e}",
                self.path.display()
            ))
        })?;
        debug!(path = %self.path.display(), size, "scratch dir ready");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unmount and remove on the blocking pool.
    pub async fn release(mut self) {
        self.released = true;
        let path = self.path.clone();
        let mounter = Arc::clone(&self.mounter);
        let cleanup = tokio::task::spawn_blocking(move || remove(mounter.as_ref(), &path));
        if let Err(e) = cleanup.await {
            warn!(path = %self.path.display(), "scratch cleanup did not finish: {e}");
        }
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            remove(self.mounter.as_ref(), &self.path);
        }
    }
}

fn remove(mounter: &dyn ScratchMount, path: &Path) {
    if let Err(e) = mounter.unmount(path) {
        // EINVAL: never mounted.
        debug!(path = %path.display(), "unmount skipped: {e}");
    }
    match std::fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "failed to remove scratch dir: {e}"),
    }
}
