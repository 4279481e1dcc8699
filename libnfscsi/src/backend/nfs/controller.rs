//! Controller half of [`NfsBackend`]: volume directories on the export.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::working::{Export, WorkingMount};
use super::{CreateParams, NfsBackend, NfsVolume, check_capability, require_non_empty};
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::types::*;

impl NfsBackend {
    /// Return a working mount, logging rather than failing on cleanup
    /// errors: the directory change it served is already durable.
    async fn release_working(&self, mount: WorkingMount) {
        let path = mount.path().to_path_buf();
        if let Err(e) = self.working.release(mount).await {
            warn!(path = %path.display(), error = %e, "working mount cleanup failed");
        }
    }
}

/// Create the volume directory unless it already exists.
async fn create_volume_dir(path: &Path, mode: Option<u32>) -> Result<(), CsiError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => {
            debug!(path = %path.display(), "volume directory exists, assuming idempotent retry");
            return Ok(());
        }
        Ok(_) => {
            return Err(CsiError::Internal(format!(
                "{} exists and is not a directory",
                path.display()
            )));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(CsiError::io("stat", path, e)),
    }

    match tokio::fs::create_dir(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(()),
        Err(e) => return Err(CsiError::io("create dir", path, e)),
    }

    // Set explicitly; the mode passed to mkdir is masked by the umask.
    if let Some(mode) = mode {
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| CsiError::io("chmod", path, e))?;
    }
    Ok(())
}

async fn remove_volume_dir(path: &Path) -> Result<(), CsiError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "volume directory already gone");
            Ok(())
        }
        Err(e) => Err(CsiError::io("remove dir", path, e)),
    }
}

fn check_capabilities(caps: &[VolumeCapability]) -> Result<(), CsiError> {
    if caps.is_empty() {
        return Err(CsiError::InvalidArgument(
            "volume capabilities are required".into(),
        ));
    }
    caps.iter()
        .try_for_each(check_capability)
        .map_err(CsiError::InvalidArgument)
}

#[async_trait]
impl CsiController for NfsBackend {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        require_non_empty("volume name", &req.name)?;
        check_capabilities(&req.volume_capabilities)?;
        let params = CreateParams::parse(&req.parameters)?;
        let sub_dir = params.sub_dir_for(&req.name)?;

        let volume = NfsVolume::new(&params.server, &params.base_dir, &sub_dir);
        let volume_id = volume.encode();
        let mode = params
            .mount_permissions
            .or(self.config.default_mount_permissions);

        let _lock = self.locks.lock(volume_id.as_str()).await;
        let mount = self
            .working
            .acquire(&Export::from(&volume), params.mount_options.as_deref())
            .await?;
        let created = create_volume_dir(&mount.path().join(&volume.sub_dir), mode).await;
        self.release_working(mount).await;
        created?;

        info!(%volume_id, "volume created");
        Ok(Volume {
            volume_context: params.volume_context(&volume),
            volume_id,
            capacity_bytes: req.capacity_bytes,
        })
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let volume = NfsVolume::decode(volume_id)?;

        let _lock = self.locks.lock(volume_id.as_str()).await;
        let mount = self.working.acquire(&Export::from(&volume), None).await?;
        let removed = remove_volume_dir(&mount.path().join(&volume.sub_dir)).await;
        self.release_working(mount).await;
        removed?;

        info!(%volume_id, "volume deleted");
        Ok(())
    }

    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        NfsVolume::decode(volume_id)?;
        if capabilities.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume capabilities are required".into(),
            ));
        }
        // NFS serves every access mode, including many concurrent writers.
        Ok(capabilities.iter().all(|c| check_capability(c).is_ok()))
    }

    async fn controller_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(vec![ControllerCapability::CreateDeleteVolume])
    }
}
