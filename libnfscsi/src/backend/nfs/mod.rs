//! NFS storage backend for CSI.
//!
//! [`NfsBackend`] implements [`CsiIdentity`], [`CsiController`], and
//! [`CsiNode`] on top of externally managed NFS exports.  A volume is a
//! sub-directory of an export; the controller creates and removes it through
//! a temporary working mount of the export, and the node mounts the
//! sub-directory (directly, or bind-mounted from a staging mount) at the
//! workload's target path.
//!
//! Nothing is persisted by the plugin.  The directory tree on the export and
//! the orchestrator's own records are the only state, and every operation is
//! re-derived from them, which makes each one safe to retry after a crash.
//!
//! [`CsiController`]: crate::controller::CsiController
//! [`CsiNode`]: crate::node::CsiNode

mod controller;
mod node;
pub mod volume;
pub mod working;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::lock::VolumeLocks;
use crate::mount::Mounter;
use crate::types::*;

use self::working::WorkingMounts;

pub use self::volume::{CreateParams, NfsVolume, NodeMountSource};

pub const DEFAULT_DRIVER_NAME: &str = "nfs.csi.k8s.io";
pub const DEFAULT_WORKING_MOUNT_DIR: &str = "/tmp/nfs-csi";

/// Backend configuration.  Every field has a default so partial config
/// files deserialize.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NfsDriverConfig {
    /// Name reported by `GetPluginInfo`.
    pub driver_name: String,
    /// Identifier reported by `NodeGetInfo`.
    pub node_id: String,
    /// Directory under which exports are temporarily mounted.
    pub working_mount_dir: PathBuf,
    /// Advertise `STAGE_UNSTAGE_VOLUME` and bind-mount publish targets from
    /// a per-node staging mount.
    pub enable_staging: bool,
    /// Mode for new volume directories when the storage class sets none.
    pub default_mount_permissions: Option<u32>,
    /// Pause before retrying a failed working-mount unmount.
    pub unmount_retry_delay_ms: u64,
}

impl Default for NfsDriverConfig {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_owned(),
            node_id: String::new(),
            working_mount_dir: PathBuf::from(DEFAULT_WORKING_MOUNT_DIR),
            enable_staging: false,
            default_mount_permissions: None,
            unmount_retry_delay_ms: 500,
        }
    }
}

/// Concrete CSI backend for NFS exports.
///
/// # Thread safety
///
/// Per-volume operations are serialized by [`VolumeLocks`]; working mounts
/// are shared and reference-counted by [`WorkingMounts`].  Everything else
/// is immutable, so any number of Tokio tasks can call into one backend.
pub struct NfsBackend {
    config: NfsDriverConfig,
    mounter: Arc<dyn Mounter>,
    working: WorkingMounts,
    locks: VolumeLocks,
}

impl NfsBackend {
    pub fn new(config: NfsDriverConfig, mounter: Arc<dyn Mounter>) -> Self {
        let working = WorkingMounts::new(
            config.working_mount_dir.clone(),
            Arc::clone(&mounter),
            Duration::from_millis(config.unmount_retry_delay_ms),
        );
        info!(
            driver = %config.driver_name,
            node_id = %config.node_id,
            working_mount_dir = %config.working_mount_dir.display(),
            staging = config.enable_staging,
            "NFS backend initialized",
        );
        Self {
            config,
            mounter,
            working,
            locks: VolumeLocks::new(),
        }
    }

    /// Working-mount registry, exposed for inspection.
    pub fn working_mounts(&self) -> &WorkingMounts {
        &self.working
    }
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for NfsBackend {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.config.driver_name.clone(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        // Healthy when the working mount root can be used.
        let ready = tokio::fs::metadata(&self.config.working_mount_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        Ok(ready)
    }
}

// ---------------------------------------------------------------------------
// Shared validation
// ---------------------------------------------------------------------------

/// Reject capabilities NFS cannot serve.
///
/// Returns a message describing the first unsupported capability.
fn check_capability(cap: &VolumeCapability) -> Result<(), String> {
    match &cap.access_type {
        Some(AccessType::Mount { .. }) => {}
        Some(AccessType::Block) => return Err("block access type is not supported".into()),
        None => return Err("volume capability has no access type".into()),
    }
    match cap.access_mode {
        None => Err("volume capability has no access mode".into()),
        Some(AccessMode::Unknown) => Err("access mode is unknown".into()),
        Some(_) => Ok(()),
    }
}

fn require_non_empty(what: &str, value: &str) -> Result<(), CsiError> {
    if value.is_empty() {
        return Err(CsiError::InvalidArgument(format!("{what} is required")));
    }
    Ok(())
}

fn require_absolute(what: &str, path: &str) -> Result<(), CsiError> {
    require_non_empty(what, path)?;
    if !path.starts_with('/') {
        return Err(CsiError::InvalidArgument(format!(
            "{what} {path:?} must be absolute"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::FakeMounter;

    fn backend(dir: &std::path::Path) -> NfsBackend {
        let config = NfsDriverConfig {
            node_id: "test-node".into(),
            working_mount_dir: dir.to_path_buf(),
            ..Default::default()
        };
        NfsBackend::new(config, Arc::new(FakeMounter::new()))
    }

    #[tokio::test]
    async fn plugin_info() {
        let tmp = tempfile::tempdir().unwrap();
        let info = backend(tmp.path()).get_plugin_info().await.unwrap();
        assert_eq!(info.name, DEFAULT_DRIVER_NAME);
    }

    #[tokio::test]
    async fn advertises_controller() {
        let tmp = tempfile::tempdir().unwrap();
        let caps = backend(tmp.path()).get_plugin_capabilities().await.unwrap();
        assert_eq!(caps, vec![PluginCapability::ControllerService]);
    }

    #[tokio::test]
    async fn probe_healthy_root() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(backend(tmp.path()).probe().await.unwrap());
    }

    #[tokio::test]
    async fn probe_missing_root() {
        let b = backend(std::path::Path::new("/nonexistent/path/for/test"));
        assert!(!b.probe().await.unwrap());
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let cfg: NfsDriverConfig =
            serde_json::from_str(r#"{"node_id":"n1","enable_staging":true}"#).unwrap();
        assert_eq!(cfg.node_id, "n1");
        assert!(cfg.enable_staging);
        assert_eq!(cfg.driver_name, DEFAULT_DRIVER_NAME);
        assert_eq!(cfg.unmount_retry_delay_ms, 500);
    }

    #[test]
    fn capability_checks() {
        assert!(check_capability(&VolumeCapability::mount(AccessMode::MultiNodeMultiWriter)).is_ok());
        assert!(check_capability(&VolumeCapability::mount(AccessMode::Unknown)).is_err());
        assert!(
            check_capability(&VolumeCapability {
                access_type: Some(AccessType::Block),
                access_mode: Some(AccessMode::SingleNodeWriter),
            })
            .is_err()
        );
        assert!(
            check_capability(&VolumeCapability {
                access_type: None,
                access_mode: Some(AccessMode::MultiNodeMultiWriter),
            })
            .is_err()
        );
    }

    #[test]
    fn relative_paths_rejected() {
        assert!(require_absolute("target path", "/var/lib/x").is_ok());
        assert!(require_absolute("target path", "var/lib/x").is_err());
        assert!(require_absolute("target path", "").is_err());
    }
}
