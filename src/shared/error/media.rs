use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RtpParseError {
    #[error("rtp packet too short ({0} bytes)")]
    TooShort(usize),
    #[error("unsupported rtp version {0}")]
    UnsupportedVersion(u8),
    #[error("rtp packet has no payload")]
    EmptyPayload,
}

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("failed to bind rtp listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("rtp listener did not bind within {0:?}")]
    BindTimeout(std::time::Duration),
}
