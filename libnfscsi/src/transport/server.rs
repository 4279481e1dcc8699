//! Plugin side of the transport.  Requests are decoded, run against the
//! backend under a deadline, and answered on the stream they arrived on.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::QuicServerConfig;
use tracing::{debug, error, info, instrument, warn};

use super::{recv_payload, send_message};
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::node::CsiNode;

/// Serves one backend implementing all three service traits.
pub struct CsiServer<T> {
    endpoint: quinn::Endpoint,
    handler: Arc<T>,
    request_timeout: Duration,
}

impl<T> CsiServer<T>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
{
    /// Bind to `addr`.  Every request that does not complete within `request_timeout` is
    /// answered with [`CsiError::DeadlineExceeded`].
    pub fn new(
        addr: SocketAddr,
        tls_config: rustls::ServerConfig,
        handler: Arc<T>,
        request_timeout: Duration,
    ) -> Result<Self, CsiError> {
        let quic_server_config = QuicServerConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_server_config));
        let endpoint = quinn::Endpoint::server(server_config, addr).map_err(CsiError::transport)?;
        info!(%addr, ?request_timeout, "CSI QUIC server listening");
        Ok(Self {
            endpoint,
            handler,
            request_timeout,
        })
    }

    /// Runs until the endpoint is closed.  Connections and the streams
    /// inside them are served on separate tasks.
    pub async fn serve(&self) -> Result<(), CsiError> {
        while let Some(incoming) = self.endpoint.accept().await {
            let handler = Arc::clone(&self.handler);
            let timeout = self.request_timeout;
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        let remote = conn.remote_address();
                        debug!(%remote, "CSI connection accepted");
                        if let Err(e) = Self::handle_connection(conn, handler, timeout).await {
                            warn!(%remote, error = %e, "CSI connection error");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "CSI incoming connection failed");
                    }
                }
            });
        }
        Ok(())
    }

    async fn handle_connection(
        conn: quinn::Connection,
        handler: Arc<T>,
        timeout: Duration,
    ) -> Result<(), CsiError> {
        loop {
            let (send, recv) = match conn.accept_bi().await {
                Ok(stream) => stream,
                Err(quinn::ConnectionError::ApplicationClosed(_)) => return Ok(()),
                Err(e) => return Err(CsiError::transport(e)),
            };

            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_stream(send, recv, &handler, timeout).await {
                    error!(error = %e, "CSI stream handler error");
                }
            });
        }
    }

    /// An undecodable request still gets an `InvalidArgument` reply.
    #[instrument(skip_all)]
    async fn handle_stream(
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
        handler: &T,
        timeout: Duration,
    ) -> Result<(), CsiError> {
        let buf = recv_payload(&mut recv).await?;
        let response = match serde_json::from_slice::<CsiMessage>(&buf) {
            Ok(request) => {
                debug!(%request, "CSI request received");
                handle_request(handler, request, timeout).await
            }
            Err(e) => CsiMessage::Error(CsiError::InvalidArgument(format!(
                "malformed request: {e}"
            ))),
        };
        send_message(&mut send, &response).await
    }

    /// For the bound address and for shutdown.
    pub fn endpoint(&self) -> &quinn::Endpoint {
        &self.endpoint
    }
}

/// Dispatch `request` with a deadline.  Dropping the operation at the
/// deadline releases its volume lock; a mount helper already running is
/// left to finish on its own.
pub async fn handle_request<T>(handler: &T, request: CsiMessage, timeout: Duration) -> CsiMessage
where
    T: CsiIdentity + CsiController + CsiNode,
{
    let name = request.to_string();
    match tokio::time::timeout(timeout, dispatch(handler, request)).await {
        Ok(response) => {
            if let CsiMessage::Error(e) = &response {
                warn!(request = %name, code = %e.code(), error = %e, "CSI request failed");
            }
            response
        }
        Err(_) => {
            warn!(request = %name, ?timeout, "CSI request timed out");
            CsiMessage::Error(CsiError::DeadlineExceeded(format!(
                "{name} did not complete within {timeout:?}"
            )))
        }
    }
}

/// Run one request against `handler` with no deadline.  Non-request
/// variants are answered with `InvalidArgument`.
pub async fn dispatch<T>(handler: &T, request: CsiMessage) -> CsiMessage
where
    T: CsiIdentity + CsiController + CsiNode,
{
    let result = match request {
        // --- Identity -------------------------------------------------------
        CsiMessage::Probe => handler.probe().await.map(CsiMessage::ProbeResult),
        CsiMessage::GetPluginInfo => handler
            .get_plugin_info()
            .await
            .map(CsiMessage::PluginInfoResponse),
        CsiMessage::GetPluginCapabilities => handler
            .get_plugin_capabilities()
            .await
            .map(CsiMessage::PluginCapabilitiesResponse),

        // --- Controller -----------------------------------------------------
        CsiMessage::CreateVolume(req) => handler
            .create_volume(req)
            .await
            .map(CsiMessage::VolumeCreated),
        CsiMessage::DeleteVolume(id) => handler.delete_volume(&id).await.map(|()| CsiMessage::Ok),
        CsiMessage::ValidateVolumeCapabilities {
            volume_id,
            capabilities,
        } => handler
            .validate_volume_capabilities(&volume_id, &capabilities)
            .await
            .map(CsiMessage::CapabilitiesValid),
        CsiMessage::ControllerGetCapabilities => handler
            .controller_capabilities()
            .await
            .map(CsiMessage::ControllerCapabilitiesResponse),

        // --- Node -----------------------------------------------------------
        CsiMessage::StageVolume(req) => handler.stage_volume(req).await.map(|()| CsiMessage::Ok),
        CsiMessage::UnstageVolume {
            volume_id,
            staging_target_path,
        } => handler
            .unstage_volume(&volume_id, &staging_target_path)
            .await
            .map(|()| CsiMessage::Ok),
        CsiMessage::PublishVolume(req) => {
            handler.publish_volume(req).await.map(|()| CsiMessage::Ok)
        }
        CsiMessage::UnpublishVolume {
            volume_id,
            target_path,
        } => handler
            .unpublish_volume(&volume_id, &target_path)
            .await
            .map(|()| CsiMessage::Ok),
        CsiMessage::NodeGetCapabilities => handler
            .node_capabilities()
            .await
            .map(CsiMessage::NodeCapabilitiesResponse),
        CsiMessage::GetNodeInfo => handler.get_info().await.map(CsiMessage::NodeInfoResponse),

        // Replies sent by a confused peer.
        other => {
            warn!(msg = %other, "unexpected message variant received as request");
            Err(CsiError::InvalidArgument(format!(
                "unexpected message: {other}"
            )))
        }
    };
    result.unwrap_or_else(CsiMessage::Error)
}
