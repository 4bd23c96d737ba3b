//! TLS transport over tokio TCP using rustls
//!
//! Reads are bounded by `tokio::time::timeout` so the service loop never
//! blocks longer than one tick waiting on the broker.

use super::{NetworkInterface, Transport, TransportError, TrustConfig};
use async_trait::async_trait;
use rumqttc::tokio_rustls::{
    client::TlsStream,
    rustls::{pki_types::ServerName, ClientConfig},
    TlsConnector,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// TLS-secured byte stream to an MQTT broker
#[derive(Default)]
pub struct TlsTransport {
    network: Option<Arc<dyn NetworkInterface>>,
    tls_config: Option<Arc<ClientConfig>>,
    stream: Option<TlsStream<TcpStream>>,
    peer: Option<String>,
}

impl TlsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote endpoint of the current connection, if any
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    fn stream_mut(&mut self) -> Result<&mut TlsStream<TcpStream>, TransportError> {
        self.stream.as_mut().ok_or(TransportError::NotOpen)
    }
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("bound", &self.network.is_some())
            .field("trust_configured", &self.tls_config.is_some())
            .field("connected", &self.stream.is_some())
            .field("peer", &self.peer)
            .finish()
    }
}

#[async_trait]
impl Transport for TlsTransport {
    async fn open(&mut self, network: Arc<dyn NetworkInterface>) -> Result<(), TransportError> {
        if !network.is_up() {
            return Err(TransportError::NetworkUnavailable);
        }
        self.network = Some(network);
        Ok(())
    }

    fn configure_trust(&mut self, trust: TrustConfig) -> Result<(), TransportError> {
        self.tls_config = Some(trust.build_client_config()?);
        Ok(())
    }

    async fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        let network = self.network.clone().ok_or(TransportError::NotBound)?;
        if !network.is_up() {
            return Err(TransportError::NetworkUnavailable);
        }

        // Without explicit trust material fall back to the platform store
        let tls_config = match &self.tls_config {
            Some(config) => config.clone(),
            None => {
                let config = TrustConfig::default().build_client_config()?;
                self.tls_config = Some(config.clone());
                config
            }
        };

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| TransportError::InvalidServerName(host.to_string()))?;

        debug!(host, port, "Opening TCP connection");
        let tcp = network
            .connect_tcp(host, port)
            .await
            .map_err(|source| TransportError::Connect {
                host: host.to_string(),
                port,
                source,
            })?;

        let connector = TlsConnector::from(tls_config);
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|source| TransportError::TlsHandshake {
                host: host.to_string(),
                source,
            })?;

        info!(host, port, "TLS session established");
        self.stream = Some(stream);
        self.peer = Some(format!("{host}:{port}"));
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let stream = self.stream_mut()?;
        match tokio::time::timeout(timeout, stream.read(buf)).await {
            Err(_elapsed) => Ok(0),
            Ok(Ok(0)) if !buf.is_empty() => Err(TransportError::Closed),
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(TransportError::Io(e)),
        }
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        let stream = self.stream_mut()?;
        stream.write_all(buf).await?;
        stream.flush().await?;
        Ok(buf.len())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        self.peer = None;

        // close_notify is best effort; the socket is dropped either way
        if let Err(e) = stream.shutdown().await {
            warn!("TLS shutdown did not complete cleanly: {}", e);
            return Err(TransportError::Io(e));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}
