//! Node-side volume operations.
//!
//! A volume reaches a workload in up to two hops.  With staging, the export
//! sub-directory is mounted once per node at a staging path and every
//! workload target is a bind mount of it; without staging each target is a
//! direct NFS mount.  Teardown runs the same hops in reverse.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeId,
};

#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Mount the volume at its per-node staging path.  A staging path that
    /// already holds the same source is success.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unmount and remove the staging path.  An absent path is success.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Make the volume visible at `req.target_path`.  A target that already
    /// holds the same source with the same read-only setting is success;
    /// anything else mounted there is [`CsiError::AlreadyExists`].
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unmount and remove the target path.  An absent path is success.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    async fn node_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    async fn get_info(&self) -> Result<NodeInfo, CsiError>;
}
