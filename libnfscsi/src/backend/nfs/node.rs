//! Node half of [`NfsBackend`]: mounts on the local host.

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::working::NFS_FS_TYPE;
use super::{NfsBackend, NodeMountSource, check_capability, require_absolute, require_non_empty};
use crate::error::CsiError;
use crate::mount::{BIND_OPTION, MountPoint, READ_ONLY_OPTION, split_options};
use crate::node::CsiNode;
use crate::types::*;

/// Create `path` if missing.  Returns whether this call created it.
async fn ensure_dir(path: &Path) -> Result<bool, CsiError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(false),
        Ok(_) => Err(CsiError::Internal(format!(
            "{} exists and is not a directory",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(path)
                .await
                .map_err(|e| CsiError::MountFailed {
                    path: path.display().to_string(),
                    reason: format!("create dir: {e}"),
                })?;
            Ok(true)
        }
        Err(e) => Err(CsiError::io("stat", path, e)),
    }
}

/// An existing mount satisfies the request only if it has the same source
/// and the same read-only-ness.
fn check_existing(
    existing: &MountPoint,
    source: &str,
    read_only: bool,
    path: &Path,
) -> Result<(), CsiError> {
    if existing.device != source {
        return Err(CsiError::AlreadyExists(format!(
            "{} is already mounted from {}, requested {source}",
            path.display(),
            existing.device
        )));
    }
    if existing.is_read_only() != read_only {
        return Err(CsiError::AlreadyExists(format!(
            "{} is already mounted with read_only={}, requested read_only={read_only}",
            path.display(),
            existing.is_read_only()
        )));
    }
    debug!(path = %path.display(), %source, "already mounted, assuming idempotent retry");
    Ok(())
}

/// Options for an NFS mount: capability flags, then storage-class options.
fn nfs_options(cap: &VolumeCapability, source: &NodeMountSource, read_only: bool) -> Vec<String> {
    let mut options: Vec<String> = cap.mount_flags().to_vec();
    if let Some(extra) = &source.mount_options {
        options.extend(split_options(extra));
    }
    if read_only && !options.iter().any(|o| o == READ_ONLY_OPTION) {
        options.push(READ_ONLY_OPTION.to_owned());
    }
    options
}

impl NfsBackend {
    fn require_staging(&self) -> Result<(), CsiError> {
        if !self.config.enable_staging {
            return Err(CsiError::Unimplemented(
                "volume staging is not enabled on this node".into(),
            ));
        }
        Ok(())
    }

    /// Mount `source` on `target`, creating `target` first and removing it
    /// again if this call created it and the mount failed.
    async fn mount_at(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        let created = ensure_dir(target).await?;
        if let Err(e) = self.mounter.mount(source, target, fs_type, options).await {
            if created && let Err(rm) = tokio::fs::remove_dir(target).await {
                warn!(path = %target.display(), error = %rm, "could not remove target after failed mount");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Unmount `path` if mounted, then remove it.
    async fn unmount_and_remove(&self, path: &Path) -> Result<(), CsiError> {
        if !self.mounter.is_mount_point(path).await? {
            debug!(path = %path.display(), "not mounted, nothing to unmount");
            if let Err(e) = tokio::fs::remove_dir(path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), error = %e, "leaving unmounted directory in place");
            }
            return Ok(());
        }

        self.mounter.unmount(path).await?;
        match tokio::fs::remove_dir(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CsiError::io("remove dir", path, e)),
        }
    }
}

#[async_trait]
impl CsiNode for NfsBackend {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, staging = %req.staging_target_path))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        self.require_staging()?;
        require_non_empty("volume id", req.volume_id.as_str())?;
        require_absolute("staging target path", &req.staging_target_path)?;
        check_capability(&req.volume_capability).map_err(CsiError::InvalidArgument)?;
        let source = NodeMountSource::from_context(&req.volume_context)?;
        let read_only = req
            .volume_capability
            .access_mode
            .is_some_and(|m| m.is_read_only());
        let staging = Path::new(&req.staging_target_path);

        let _lock = self.locks.lock(req.volume_id.as_str()).await;
        if let Some(existing) = self.mounter.mount_point(staging).await? {
            return check_existing(&existing, &source.source(), read_only, staging);
        }

        let options = nfs_options(&req.volume_capability, &source, read_only);
        self.mount_at(&source.source(), staging, NFS_FS_TYPE, &options)
            .await?;

        info!(source = %source.source(), "volume staged");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        self.require_staging()?;
        require_non_empty("volume id", volume_id.as_str())?;
        require_absolute("staging target path", staging_target_path)?;

        let _lock = self.locks.lock(volume_id.as_str()).await;
        self.unmount_and_remove(Path::new(staging_target_path))
            .await?;

        info!(%volume_id, path = staging_target_path, "volume unstaged");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target_path = %req.target_path))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        require_non_empty("volume id", req.volume_id.as_str())?;
        require_absolute("target path", &req.target_path)?;
        check_capability(&req.volume_capability).map_err(CsiError::InvalidArgument)?;
        let source = NodeMountSource::from_context(&req.volume_context)?;
        let staging = req
            .staging_target_path
            .as_deref()
            .filter(|p| self.config.enable_staging && !p.is_empty());
        if let Some(staging) = staging {
            require_absolute("staging target path", staging)?;
        }
        let target = Path::new(&req.target_path);

        let _lock = self.locks.lock(req.volume_id.as_str()).await;
        if let Some(existing) = self.mounter.mount_point(target).await? {
            return check_existing(&existing, &source.source(), req.read_only, target);
        }

        match staging {
            Some(staging) => {
                if !self.mounter.is_mount_point(Path::new(staging)).await? {
                    return Err(CsiError::NotFound(format!(
                        "staging path {staging} is not mounted"
                    )));
                }
                let mut options = vec![BIND_OPTION.to_owned()];
                if req.read_only {
                    options.push(READ_ONLY_OPTION.to_owned());
                }
                self.mount_at(staging, target, "", &options).await?;
            }
            None => {
                let options = nfs_options(&req.volume_capability, &source, req.read_only);
                self.mount_at(&source.source(), target, NFS_FS_TYPE, &options)
                    .await?;
            }
        }

        info!(
            source = %source.source(),
            read_only = req.read_only,
            bind = staging.is_some(),
            "volume published",
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        require_non_empty("volume id", volume_id.as_str())?;
        require_absolute("target path", target_path)?;

        let _lock = self.locks.lock(volume_id.as_str()).await;
        self.unmount_and_remove(Path::new(target_path)).await?;

        info!(%volume_id, %target_path, "volume unpublished");
        Ok(())
    }

    async fn node_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        let mut caps = Vec::new();
        if self.config.enable_staging {
            caps.push(NodeCapability::StageUnstageVolume);
        }
        Ok(caps)
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.config.node_id.clone(),
            max_volumes: 0,
        })
    }
}
