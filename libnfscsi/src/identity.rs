//! Plugin identity: name, version, readiness.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{PluginCapability, PluginInfo};

#[async_trait]
pub trait CsiIdentity: Send + Sync {
    /// Driver name and version as registered with the orchestrator.
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError>;

    /// `Ok(false)` means the process is up but cannot serve requests yet.
    async fn probe(&self) -> Result<bool, CsiError>;

    /// Every plugin in this crate ships a controller alongside the node
    /// service, so that is the default answer.
    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![PluginCapability::ControllerService])
    }
}
