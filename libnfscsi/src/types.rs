//! Wire types shared by the service traits and the transport.
//!
//! Optional request fields carry `#[serde(default)]` so that a sparse JSON
//! request decodes and is then rejected by validation with a useful message
//! rather than by the decoder.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Volume identifier as handed to the orchestrator.  The NFS backend encodes
/// `server/baseDir/subDir` into it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl VolumeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// CSI access modes.  "Node" is a host, "writer" a workload with write
/// access.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    Unknown,
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
    SingleNodeSingleWriter,
    SingleNodeMultiWriter,
}

impl AccessMode {
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::SingleNodeReaderOnly | Self::MultiNodeReaderOnly)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessType {
    /// Raw block device.  NFS cannot provide this.
    Block,
    /// Mounted filesystem.
    Mount {
        /// Empty means the plugin default.
        #[serde(default)]
        fs_type: String,
        /// Extra mount options, e.g. `nfsvers=4.1`.
        #[serde(default)]
        mount_flags: Vec<String>,
    },
}

impl AccessType {
    /// Filesystem access with no extra options.
    pub fn mount() -> Self {
        Self::Mount {
            fs_type: String::new(),
            mount_flags: Vec::new(),
        }
    }
}

/// What a workload needs from a volume.  Both parts are optional on the
/// wire; backends reject a capability missing either.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    #[serde(default)]
    pub access_type: Option<AccessType>,
    #[serde(default)]
    pub access_mode: Option<AccessMode>,
}

impl VolumeCapability {
    pub fn mount(mode: AccessMode) -> Self {
        Self {
            access_type: Some(AccessType::mount()),
            access_mode: Some(mode),
        }
    }

    /// `mount_flags` of a filesystem capability; empty for anything else.
    pub fn mount_flags(&self) -> &[String] {
        match &self.access_type {
            Some(AccessType::Mount { mount_flags, .. }) => mount_flags,
            _ => &[],
        }
    }
}

/// Result of `CreateVolume`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    pub volume_id: VolumeId,
    /// Echoed from the request; NFS sub-directories have no size.
    pub capacity_bytes: u64,
    /// Must accompany every node request for this volume.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Orchestrator-chosen name, also the default sub-directory name.
    pub name: String,
    /// Accepted and ignored.
    #[serde(default)]
    pub capacity_bytes: u64,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage-class parameters (`server`, `share`, ...).
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    pub volume_id: VolumeId,
    /// Per-node mount point shared by all publish targets of the volume.
    pub staging_target_path: String,
    pub volume_capability: VolumeCapability,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    pub volume_id: VolumeId,
    /// Set when the node stages volumes; the target is then bind-mounted
    /// from here.
    #[serde(default)]
    pub staging_target_path: Option<String>,
    /// Path the workload sees, e.g.
    /// `/var/lib/kubelet/pods/<uid>/volumes/<name>/mount`.
    pub target_path: String,
    pub volume_capability: VolumeCapability,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Driver name, `nfs.csi.k8s.io` unless configured otherwise.
    pub name: String,
    pub vendor_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    ControllerService,
}

/// Optional controller RPCs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerCapability {
    CreateDeleteVolume,
}

/// Optional node RPCs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    StageUnstageVolume,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    /// 0 means no limit.
    pub max_volumes: u64,
}
