use thiserror::Error;

use gba_sio_mesh_net::{CodecError, SocketError};

/// Errors surfaced to the caller. Anything that happens once a node is
/// already running is logged and handled in place per the error-handling
/// table; only construction and join-time failures ever reach here.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),
    #[error("wire codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("node id {0} out of range (expected 1..=3)")]
    IdOutOfRange(u8),
}
