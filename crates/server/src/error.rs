use std::io;
use std::net::SocketAddr;

use posestream_wire::ConfigError;
use thiserror::Error;

/// Errors that stop the server. Per-datagram problems never surface here.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("UDP transport failed: {0}")]
    Transport(#[source] io::Error),

    #[error("invalid configuration: max datagram size must be greater than zero")]
    ZeroDatagramSize,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}
