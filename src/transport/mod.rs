//! Transport layer for the device session
//!
//! This module provides the byte-stream transport abstraction the session
//! controller drives, plus a TLS implementation over tokio and rustls.
//! The session never touches sockets directly; it only calls the
//! `Transport` trait so tests can substitute an in-memory broker.

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod network;
pub mod tls;
pub mod trust;

pub use network::{HostNetwork, NetworkInterface};
pub use tls::TlsTransport;
pub use trust::{PemSource, TrustConfig};

/// Byte-stream transport used by the protocol layer
///
/// Lifecycle is `open` (bind a network handle), optional `configure_trust`,
/// `connect`, then any number of `read`/`write` calls, then `close`.
#[async_trait]
pub trait Transport: Send {
    /// Bind the transport to an already initialized network interface
    async fn open(&mut self, network: Arc<dyn NetworkInterface>) -> Result<(), TransportError>;

    /// Install root and client certificate material for the next connect
    fn configure_trust(&mut self, trust: TrustConfig) -> Result<(), TransportError>;

    /// Establish the TCP connection and run the TLS handshake
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError>;

    /// Read into `buf`, waiting at most `timeout`.
    ///
    /// Returns `Ok(0)` when the timeout elapses with nothing received. A peer
    /// close is reported as `TransportError::Closed`, never as `Ok(0)`.
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Write the whole buffer, returning the number of bytes written
    async fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError>;

    /// Close the connection. Closing an already closed transport succeeds.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// True while a connected stream is held
    fn is_open(&self) -> bool;
}

/// Transport failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Network interface is not up")]
    NetworkUnavailable,

    #[error("Transport has no network interface; call open first")]
    NotBound,

    #[error("TCP connect to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("TLS configuration invalid: {0}")]
    TlsConfig(String),

    #[error("No trust anchors available to authenticate the server")]
    NoTrustAnchors,

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    #[error("TLS handshake with {host} failed: {source}")]
    TlsHandshake {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("Transport is not connected")]
    NotOpen,

    #[error("Connection closed by peer")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Coarse classification used when mapping into the session taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Network bring-up or TCP connect
    Open,
    /// TLS configuration or handshake
    Tls,
    /// Use before connect or after close
    Logic,
    /// Failure on an established stream
    Io,
}

impl TransportError {
    pub fn kind(&self) -> TransportErrorKind {
        match self {
            TransportError::NetworkUnavailable
            | TransportError::NotBound
            | TransportError::Connect { .. } => TransportErrorKind::Open,
            TransportError::TlsConfig(_)
            | TransportError::NoTrustAnchors
            | TransportError::InvalidServerName(_)
            | TransportError::TlsHandshake { .. } => TransportErrorKind::Tls,
            TransportError::NotOpen => TransportErrorKind::Logic,
            TransportError::Closed | TransportError::Io(_) => TransportErrorKind::Io,
        }
    }

    pub fn tls_config<S: Into<String>>(message: S) -> Self {
        Self::TlsConfig(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            TransportError::NetworkUnavailable.kind(),
            TransportErrorKind::Open
        );
        assert_eq!(
            TransportError::Connect {
                host: "broker.example.com".to_string(),
                port: 8883,
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            }
            .kind(),
            TransportErrorKind::Open
        );
        assert_eq!(TransportError::NoTrustAnchors.kind(), TransportErrorKind::Tls);
        assert_eq!(
            TransportError::TlsHandshake {
                host: "broker.example.com".to_string(),
                source: io::Error::new(io::ErrorKind::InvalidData, "bad certificate"),
            }
            .kind(),
            TransportErrorKind::Tls
        );
        assert_eq!(TransportError::NotOpen.kind(), TransportErrorKind::Logic);
        assert_eq!(TransportError::Closed.kind(), TransportErrorKind::Io);
    }

    #[test]
    fn test_handshake_error_keeps_cause() {
        let err = TransportError::TlsHandshake {
            host: "broker.example.com".to_string(),
            source: io::Error::new(io::ErrorKind::InvalidData, "UnknownIssuer"),
        };
        assert!(err.to_string().contains("UnknownIssuer"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
