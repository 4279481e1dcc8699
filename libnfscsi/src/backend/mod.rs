//! Storage backend implementations.
//!
//! Each backend module provides a concrete type that implements
//! [`CsiIdentity`](crate::CsiIdentity), [`CsiController`](crate::CsiController),
//! and [`CsiNode`](crate::CsiNode).

pub mod nfs;
