//! Linux [`Mounter`] implementation.
//!
//! NFS mounts go through the system `mount` helper so that `mount.nfs`
//! resolves the server address and negotiates the protocol version.  Bind
//! mounts and unmounts use the syscalls directly via [`nix::mount`], moved
//! onto the blocking pool because they can stall on an unresponsive server.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::mount::MsFlags;
use tracing::{debug, instrument};

use super::{BIND_OPTION, MountPoint, Mounter, READ_ONLY_OPTION, parse_mount_table};
use crate::error::CsiError;

const MOUNT_TABLE: &str = "/proc/self/mounts";

/// `mount.nfs` messages that indicate the server, not the request, is at
/// fault.
const UNREACHABLE_MARKERS: &[&str] = &[
    "Connection refused",
    "Connection timed out",
    "No route to host",
    "Network is unreachable",
    "server is down",
    "timed out",
];

/// Mounter backed by the host kernel.  Requires `CAP_SYS_ADMIN`.
#[derive(Debug, Default, Clone)]
pub struct LinuxMounter;

impl LinuxMounter {
    pub fn new() -> Self {
        Self
    }

    async fn bind_mount(
        &self,
        source: &str,
        target: &Path,
        read_only: bool,
    ) -> Result<(), CsiError> {
        let source = PathBuf::from(source);
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || {
            nix::mount::mount(
                Some(source.as_path()),
                target.as_path(),
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|e| CsiError::MountFailed {
                path: target.display().to_string(),
                reason: format!("bind {}: {e}", source.display()),
            })?;

            // The kernel ignores MS_RDONLY on the initial bind; it only
            // takes effect on a remount.
            if read_only {
                nix::mount::mount(
                    None::<&str>,
                    target.as_path(),
                    None::<&str>,
                    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                    None::<&str>,
                )
                .map_err(|e| CsiError::MountFailed {
                    path: target.display().to_string(),
                    reason: format!("remount read-only: {e}"),
                })?;
            }
            Ok(())
        })
        .await
        .map_err(CsiError::internal)?
    }
}

#[async_trait]
impl Mounter for LinuxMounter {
    #[instrument(skip(self))]
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        if options.iter().any(|o| o == BIND_OPTION) {
            let read_only = options.iter().any(|o| o == READ_ONLY_OPTION);
            return self.bind_mount(source, target, read_only).await;
        }

        let mut cmd = tokio::process::Command::new("mount");
        if !fs_type.is_empty() {
            cmd.args(["-t", fs_type]);
        }
        if !options.is_empty() {
            cmd.arg("-o").arg(options.join(","));
        }
        cmd.arg(source).arg(target);
        debug!(?cmd, "running mount helper");

        let output = cmd.output().await.map_err(|e| CsiError::MountFailed {
            path: target.display().to_string(),
            reason: format!("spawn mount: {e}"),
        })?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        Err(classify_mount_failure(source, target, &stderr))
    }

    #[instrument(skip(self))]
    async fn unmount(&self, target: &Path) -> Result<(), CsiError> {
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || {
            nix::mount::umount(target.as_path()).map_err(|e| CsiError::UnmountFailed {
                path: target.display().to_string(),
                reason: e.to_string(),
            })
        })
        .await
        .map_err(CsiError::internal)?
    }

    async fn list(&self) -> Result<Vec<MountPoint>, CsiError> {
        let contents = tokio::fs::read_to_string(MOUNT_TABLE)
            .await
            .map_err(|e| CsiError::io("read", MOUNT_TABLE, e))?;
        Ok(parse_mount_table(&contents))
    }
}

fn classify_mount_failure(source: &str, target: &Path, stderr: &str) -> CsiError {
    if UNREACHABLE_MARKERS.iter().any(|m| stderr.contains(m)) {
        CsiError::Unavailable(format!("mount {source} at {}: {stderr}", target.display()))
    } else {
        CsiError::MountFailed {
            path: target.display().to_string(),
            reason: format!("mount {source}: {stderr}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusCode;

    #[test]
    fn unreachable_server_is_unavailable() {
        let err = classify_mount_failure(
            "nfs-server:/exports",
            Path::new("/mnt/w"),
            "mount.nfs: Connection timed out",
        );
        assert_eq!(err.code(), StatusCode::Unavailable);
    }

    #[test]
    fn access_denied_is_internal() {
        let err = classify_mount_failure(
            "nfs-server:/exports",
            Path::new("/mnt/w"),
            "mount.nfs: access denied by server while mounting nfs-server:/exports",
        );
        assert_eq!(err.code(), StatusCode::Internal);
        assert!(err.to_string().contains("/mnt/w"));
    }
}
