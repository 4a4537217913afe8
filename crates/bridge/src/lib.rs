//! Source bridge: a [`SourceClient`](ct_domain::source::SourceClient) that
//! talks to an external process owning the messaging-source session.
//!
//! The bridge speaks JSON over a single WebSocket. See [`protocol`] for the
//! frame types.

pub mod client;
pub mod protocol;

pub use client::BridgeClient;
pub use protocol::{BridgeError, BridgeMessage, BridgeOp, ErrorKind};
