//! The request/response envelope carried on every QUIC stream.

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// One message per stream direction.  Requests are grouped by the service
/// that answers them; each has exactly one success variant below, and any
/// request may instead be answered with [`CsiMessage::Error`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // Controller
    CreateVolume(CreateVolumeRequest),
    DeleteVolume(VolumeId),
    ValidateVolumeCapabilities {
        volume_id: VolumeId,
        capabilities: Vec<VolumeCapability>,
    },
    ControllerGetCapabilities,

    // Node
    StageVolume(NodeStageVolumeRequest),
    UnstageVolume {
        volume_id: VolumeId,
        staging_target_path: String,
    },
    PublishVolume(NodePublishVolumeRequest),
    UnpublishVolume {
        volume_id: VolumeId,
        target_path: String,
    },
    NodeGetCapabilities,
    GetNodeInfo,

    // Identity
    Probe,
    GetPluginInfo,
    GetPluginCapabilities,

    /// Answer to `CreateVolume`.
    VolumeCreated(Volume),
    /// Answer to `ValidateVolumeCapabilities`.
    CapabilitiesValid(bool),
    ControllerCapabilitiesResponse(Vec<ControllerCapability>),
    NodeCapabilitiesResponse(Vec<NodeCapability>),
    NodeInfoResponse(NodeInfo),
    PluginInfoResponse(PluginInfo),
    PluginCapabilitiesResponse(Vec<PluginCapability>),
    ProbeResult(bool),
    /// Answer to requests with no payload (delete, stage, publish, ...).
    Ok,
    Error(CsiError),
}

impl CsiMessage {
    /// Turn an [`CsiMessage::Error`] response into `Err`.
    pub fn into_result(self) -> Result<Self, CsiError> {
        match self {
            Self::Error(e) => Err(e),
            other => Ok(other),
        }
    }
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateVolume(req) => write!(f, "CreateVolume(name={})", req.name),
            Self::DeleteVolume(id) => write!(f, "DeleteVolume({})", id),
            Self::ValidateVolumeCapabilities { volume_id, .. } => {
                write!(f, "ValidateVolumeCapabilities({})", volume_id)
            }
            Self::ControllerGetCapabilities => f.write_str("ControllerGetCapabilities"),
            Self::StageVolume(req) => write!(f, "StageVolume({})", req.volume_id),
            Self::UnstageVolume { volume_id, .. } => write!(f, "UnstageVolume({})", volume_id),
            Self::PublishVolume(req) => {
                write!(f, "PublishVolume({} -> {})", req.volume_id, req.target_path)
            }
            Self::UnpublishVolume {
                volume_id,
                target_path,
            } => write!(f, "UnpublishVolume({} at {})", volume_id, target_path),
            Self::NodeGetCapabilities => f.write_str("NodeGetCapabilities"),
            Self::GetNodeInfo => f.write_str("GetNodeInfo"),
            Self::Probe => f.write_str("Probe"),
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::VolumeCreated(v) => write!(f, "VolumeCreated({})", v.volume_id),
            Self::CapabilitiesValid(v) => write!(f, "CapabilitiesValid({})", v),
            Self::ControllerCapabilitiesResponse(caps) => {
                write!(f, "ControllerCapabilities(count={})", caps.len())
            }
            Self::NodeCapabilitiesResponse(caps) => {
                write!(f, "NodeCapabilities(count={})", caps.len())
            }
            Self::NodeInfoResponse(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::PluginInfoResponse(info) => write!(f, "PluginInfo(name={})", info.name),
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::ProbeResult(ok) => write!(f, "ProbeResult({})", ok),
            Self::Ok => f.write_str("Ok"),
            Self::Error(e) => write!(f, "Error({}: {})", e.code(), e),
        }
    }
}
