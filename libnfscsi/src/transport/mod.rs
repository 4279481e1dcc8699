//! JSON over QUIC.
//!
//! Every RPC owns one bi-directional stream: the caller writes a single
//! serialized [`CsiMessage`] and finishes its send side, the plugin answers
//! with one message and finishes likewise.  There is no further framing.

pub mod client;
pub mod server;

use crate::error::CsiError;
use crate::message::CsiMessage;

/// Largest message accepted on a stream.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

async fn send_message(send: &mut quinn::SendStream, msg: &CsiMessage) -> Result<(), CsiError> {
    let payload = serde_json::to_vec(msg).map_err(CsiError::internal)?;
    send.write_all(&payload)
        .await
        .map_err(CsiError::transport)?;
    send.finish().map_err(CsiError::transport)
}

async fn recv_payload(recv: &mut quinn::RecvStream) -> Result<Vec<u8>, CsiError> {
    recv.read_to_end(MAX_MESSAGE_SIZE)
        .await
        .map_err(CsiError::transport)
}
