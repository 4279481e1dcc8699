//! Caller side of the transport: the orchestrator talks to a plugin through
//! [`CsiClient`].

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use quinn::crypto::rustls::QuicClientConfig;
use tracing::{debug, instrument};

use super::{recv_payload, send_message};
use crate::error::CsiError;
use crate::message::CsiMessage;
use crate::types::{
    CreateVolumeRequest, NodePublishVolumeRequest, NodeStageVolumeRequest, Volume,
    VolumeCapability, VolumeId,
};

/// One QUIC connection to a plugin.  Requests may be issued concurrently;
/// each gets its own stream.
pub struct CsiClient {
    connection: quinn::Connection,
}

impl CsiClient {
    /// Connect to the plugin at `addr`.  `server_name` is checked against
    /// the plugin certificate's SANs.
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        tls_config: rustls::ClientConfig,
    ) -> Result<Self, CsiError> {
        let crypto = QuicClientConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;
        let mut endpoint = quinn::Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .map_err(CsiError::transport)?;
        endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(crypto)));

        let connecting = endpoint
            .connect(addr, server_name)
            .map_err(CsiError::transport)?;
        let connection = connecting.await.map_err(CsiError::transport)?;
        debug!(%addr, %server_name, "connected to plugin");
        Ok(Self { connection })
    }

    /// Send `msg` and return whatever the plugin answered, including
    /// [`CsiMessage::Error`].
    #[instrument(skip(self), fields(msg = %msg))]
    pub async fn request(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        let (mut send, mut recv) = self
            .connection
            .open_bi()
            .await
            .map_err(CsiError::transport)?;
        send_message(&mut send, msg).await?;
        let reply: CsiMessage =
            serde_json::from_slice(&recv_payload(&mut recv).await?).map_err(CsiError::transport)?;
        debug!(%reply, "reply received");
        Ok(reply)
    }

    /// [`Self::request`] with an error reply turned into `Err`.
    pub async fn call(&self, msg: CsiMessage) -> Result<CsiMessage, CsiError> {
        self.request(&msg).await?.into_result()
    }

    pub async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        match self.call(CsiMessage::CreateVolume(req)).await? {
            CsiMessage::VolumeCreated(volume) => Ok(volume),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        expect_ok(self.call(CsiMessage::DeleteVolume(volume_id.clone())).await?)
    }

    pub async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: Vec<VolumeCapability>,
    ) -> Result<bool, CsiError> {
        let msg = CsiMessage::ValidateVolumeCapabilities {
            volume_id: volume_id.clone(),
            capabilities,
        };
        match self.call(msg).await? {
            CsiMessage::CapabilitiesValid(valid) => Ok(valid),
            other => Err(unexpected(other)),
        }
    }

    pub async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        expect_ok(self.call(CsiMessage::StageVolume(req)).await?)
    }

    pub async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        expect_ok(
            self.call(CsiMessage::UnstageVolume {
                volume_id: volume_id.clone(),
                staging_target_path: staging_target_path.to_owned(),
            })
            .await?,
        )
    }

    pub async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        expect_ok(self.call(CsiMessage::PublishVolume(req)).await?)
    }

    pub async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        expect_ok(
            self.call(CsiMessage::UnpublishVolume {
                volume_id: volume_id.clone(),
                target_path: target_path.to_owned(),
            })
            .await?,
        )
    }

    pub async fn probe(&self) -> Result<bool, CsiError> {
        match self.call(CsiMessage::Probe).await? {
            CsiMessage::ProbeResult(ready) => Ok(ready),
            other => Err(unexpected(other)),
        }
    }

    pub fn close(&self) {
        self.connection
            .close(quinn::VarInt::from_u32(0), b"client shutdown");
    }
}

fn expect_ok(reply: CsiMessage) -> Result<(), CsiError> {
    match reply {
        CsiMessage::Ok => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn unexpected(msg: CsiMessage) -> CsiError {
    CsiError::TransportError(format!("unexpected response: {msg}"))
}
