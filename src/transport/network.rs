//! Network interface boundary
//!
//! Interface bring-up (Wi-Fi, Ethernet, cellular) happens outside this crate.
//! The transport only needs to know the interface is up and to obtain a
//! connected TCP stream through it.

use async_trait::async_trait;
use std::io;
use tokio::net::TcpStream;

/// An already initialized network interface
#[async_trait]
pub trait NetworkInterface: Send + Sync {
    /// True once IP connectivity is established
    fn is_up(&self) -> bool;

    /// Open a TCP connection to `host:port` through this interface
    async fn connect_tcp(&self, host: &str, port: u16) -> io::Result<TcpStream>;
}

/// Host operating system networking
#[derive(Debug, Default, Clone)]
pub struct HostNetwork;

impl HostNetwork {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NetworkInterface for HostNetwork {
    fn is_up(&self) -> bool {
        true
    }

    async fn connect_tcp(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
