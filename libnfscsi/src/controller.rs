//! Controller-side volume operations.
//!
//! These run once per volume, wherever the controller is deployed, and only
//! touch the storage backend.  Nothing here mounts on a workload node.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{ControllerCapability, CreateVolumeRequest, Volume, VolumeCapability, VolumeId};

#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision the volume named in `req`.
    ///
    /// The same name and parameters always yield the same [`Volume`], so a
    /// retried call finds its own earlier work and succeeds.  The returned
    /// `volume_context` must be handed to every node operation.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Remove the volume's backing storage.  An unknown volume is success.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// `Ok(false)` when some capability cannot be served.  Errors are kept
    /// for malformed input.
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError>;

    async fn controller_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;
}
