//! MQTT protocol boundary for the device session
//!
//! Wire framing is delegated to the `rumqttc` v4 codec. This module adds
//! the client state machine on top of a `Transport`: connect handshake,
//! subscription acknowledgements, keepalive and inbound delivery.

use crate::transport::TransportError;
use rumqttc::mqttbytes::{Error as CodecError, QoS};
use rumqttc::ConnectReturnCode;
use thiserror::Error;

pub mod client;
pub mod messages;
pub mod topics;

pub use client::{DeliverySink, DiscardSink, MqttProtocol, ProtocolSettings};
pub use messages::*;
pub use topics::*;

/// Protocol level failures
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("MQTT session is not connected")]
    NotConnected,

    #[error("Broker refused connection: {0:?}")]
    Rejected(ConnectReturnCode),

    #[error("No {packet} within {timeout_ms}ms")]
    AckTimeout {
        packet: &'static str,
        timeout_ms: u64,
    },

    #[error("Broker refused subscription to '{0}'")]
    SubscriptionRefused(String),

    #[error("Keepalive lost: no PINGRESP within {keep_alive_secs}s")]
    KeepaliveLost { keep_alive_secs: u16 },

    #[error("{0}")]
    InvalidTopic(String),

    #[error("QoS {0:?} is not supported for publishing")]
    UnsupportedQos(QoS),

    #[error("Malformed packet from broker: {0}")]
    Codec(#[from] CodecError),

    #[error("Unexpected packet: {0}")]
    UnexpectedPacket(String),

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),
}

impl ProtocolError {
    /// True when the underlying connection can no longer be used
    pub fn is_transport_down(&self) -> bool {
        matches!(
            self,
            ProtocolError::NotConnected
                | ProtocolError::KeepaliveLost { .. }
                | ProtocolError::Codec(_)
                | ProtocolError::Transport(_)
        )
    }
}
