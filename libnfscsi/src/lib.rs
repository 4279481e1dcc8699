//! NFS volumes for RK8s, served over the simplified QUIC CSI transport.
//!
//! A volume is a sub-directory of an externally managed NFS export.  The
//! controller side creates and removes that directory through a short-lived
//! working mount of the export; the node side mounts it where a workload
//! can reach it.  [`NfsBackend`] implements all three CSI services and
//! [`transport::server::CsiServer`] exposes it as JSON over [`quinn`].
//!
//! | Module | Contents |
//! |---|---|
//! | [`backend`] | The NFS backend: id codec, working mounts, both services. |
//! | [`mount`] | [`Mounter`] plus the Linux and in-memory mounters. |
//! | [`lock`] | Per-volume mutual exclusion. |
//! | [`identity`], [`controller`], [`node`] | The CSI service traits. |
//! | [`types`], [`message`] | Wire types and the request/response envelope. |
//! | [`error`] | [`CsiError`] and its [`StatusCode`] mapping. |
//! | [`transport`] | QUIC client and server. |

pub mod backend;
pub mod controller;
pub mod error;
pub mod identity;
pub mod lock;
pub mod message;
pub mod mount;
pub mod node;
pub mod transport;
pub mod types;

pub use backend::nfs::{NfsBackend, NfsDriverConfig};
pub use controller::CsiController;
pub use error::{CsiError, StatusCode};
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use mount::Mounter;
pub use node::CsiNode;
pub use types::*;
