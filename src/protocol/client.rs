//! MQTT 3.1.1 client protocol over a `Transport`
//!
//! Packet encoding and framing come from the `rumqttc::mqttbytes::v4` codec.
//! This adapter owns the read/write buffers, packet identifiers and
//! keepalive bookkeeping, and hands inbound publishes to a `DeliverySink`.
//! It never spawns tasks or retries; every call returns within its
//! configured time bound.

use super::{InboundMessage, OutboundMessage, ProtocolError};
use crate::auth::Credential;
use crate::protocol::topics::{validate_filter, validate_publish_topic};
use crate::transport::{Transport, TransportError};
use bytes::BytesMut;
use rumqttc::mqttbytes::{v4, Error as CodecError, QoS};
use rumqttc::{
    ConnAck, Connect, ConnectReturnCode, Disconnect, Login, Packet, PingReq, PubAck, SubAck,
    Subscribe, SubscribeReasonCode, Unsubscribe,
};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

const READ_CHUNK: usize = 4096;

/// Receives publishes as they are decoded
///
/// Called from inside the protocol's read path; implementations must not
/// block or do long computation.
pub trait DeliverySink: Send {
    fn deliver(&mut self, message: &InboundMessage);
}

/// Sink that drops everything, used where no subscription can exist yet
#[derive(Debug, Default)]
pub struct DiscardSink;

impl DeliverySink for DiscardSink {
    fn deliver(&mut self, message: &InboundMessage) {
        debug!(topic = %message.topic, "Dropping publish with no sink attached");
    }
}

/// Timing and size limits for the protocol adapter
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolSettings {
    /// Keepalive interval announced in CONNECT; zero disables pings
    pub keep_alive: Duration,
    /// Bound on waiting for CONNACK, SUBACK and UNSUBACK
    pub ack_timeout: Duration,
    /// Largest inbound packet accepted by the decoder
    pub max_packet_size: usize,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(5),
            max_packet_size: 64 * 1024,
        }
    }
}

impl ProtocolSettings {
    fn keep_alive_secs(&self) -> u16 {
        u16::try_from(self.keep_alive.as_secs()).unwrap_or(u16::MAX)
    }
}

/// Client side of an MQTT session running over a byte-stream transport
pub struct MqttProtocol<T: Transport> {
    transport: T,
    settings: ProtocolSettings,
    read_buf: BytesMut,
    write_buf: BytesMut,
    chunk: Vec<u8>,
    connected: bool,
    next_pkid: u16,
    last_outgoing: Instant,
    ping_outstanding: Option<Instant>,
}

impl<T: Transport> MqttProtocol<T> {
    pub fn new(transport: T, settings: ProtocolSettings) -> Self {
        Self {
            transport,
            settings,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(READ_CHUNK),
            chunk: vec![0u8; READ_CHUNK],
            connected: false,
            next_pkid: 0,
            last_outgoing: Instant::now(),
            ping_outstanding: None,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn settings(&self) -> &ProtocolSettings {
        &self.settings
    }

    /// True between a successful CONNACK and disconnect or a fatal error
    pub fn is_connected(&self) -> bool {
        self.connected && self.transport.is_open()
    }

    /// Send CONNECT and wait for CONNACK. Returns the session-present flag.
    pub async fn connect(&mut self, credential: &Credential) -> Result<bool, ProtocolError> {
        self.read_buf.clear();
        self.ping_outstanding = None;
        self.connected = false;

        let mut connect = Connect::new(credential.client_id());
        connect.keep_alive = self.settings.keep_alive_secs();
        connect.clean_session = true;
        if !credential.username().is_empty() || !credential.secret().is_empty() {
            connect.login = Some(Login::new(credential.username(), credential.secret()));
        }

        debug!(client_id = %connect.client_id, keep_alive = connect.keep_alive, "Sending CONNECT");
        self.send(|buf| connect.write(buf)).await?;

        let packet = self
            .await_packet("CONNACK", &mut DiscardSink, |p| matches!(p, Packet::ConnAck(_)))
            .await?;

        match packet {
            Packet::ConnAck(ConnAck {
                code: ConnectReturnCode::Success,
                session_present,
            }) => {
                self.connected = true;
                info!(client_id = %credential.client_id(), session_present, "MQTT session accepted");
                Ok(session_present)
            }
            Packet::ConnAck(ConnAck { code, .. }) => {
                warn!(client_id = %credential.client_id(), ?code, "MQTT session rejected");
                Err(ProtocolError::Rejected(code))
            }
            other => Err(ProtocolError::UnexpectedPacket(format!("{other:?}"))),
        }
    }

    /// Subscribe to one filter and wait for the broker's grant
    pub async fn subscribe(
        &mut self,
        filter: &str,
        qos: QoS,
        sink: &mut dyn DeliverySink,
    ) -> Result<QoS, ProtocolError> {
        self.ensure_connected()?;
        validate_filter(filter).map_err(|e| ProtocolError::InvalidTopic(e.to_string()))?;

        let mut subscribe = Subscribe::new(filter, qos);
        subscribe.pkid = self.take_pkid();
        let pkid = subscribe.pkid;
        self.send(|buf| subscribe.write(buf)).await?;

        let packet = self
            .await_packet("SUBACK", sink, |p| {
                matches!(p, Packet::SubAck(ack) if ack.pkid == pkid)
            })
            .await?;

        match packet {
            Packet::SubAck(SubAck { return_codes, .. }) => match return_codes.first() {
                Some(SubscribeReasonCode::Success(granted)) => Ok(*granted),
                _ => Err(ProtocolError::SubscriptionRefused(filter.to_string())),
            },
            other => Err(ProtocolError::UnexpectedPacket(format!("{other:?}"))),
        }
    }

    /// Remove a subscription and wait for UNSUBACK
    pub async fn unsubscribe(
        &mut self,
        filter: &str,
        sink: &mut dyn DeliverySink,
    ) -> Result<(), ProtocolError> {
        self.ensure_connected()?;

        let mut unsubscribe = Unsubscribe::new(filter);
        unsubscribe.pkid = self.take_pkid();
        let pkid = unsubscribe.pkid;
        self.send(|buf| unsubscribe.write(buf)).await?;

        self.await_packet("UNSUBACK", sink, |p| {
            matches!(p, Packet::UnsubAck(ack) if ack.pkid == pkid)
        })
        .await
        .map(|_| ())
    }

    /// Send a publish. At-most-once and at-least-once are supported; the
    /// at-least-once PUBACK is consumed by later `yield_for` calls.
    pub async fn publish(&mut self, message: &OutboundMessage) -> Result<(), ProtocolError> {
        self.ensure_connected()?;
        validate_publish_topic(&message.topic)
            .map_err(|e| ProtocolError::InvalidTopic(e.to_string()))?;
        if message.qos == QoS::ExactlyOnce {
            return Err(ProtocolError::UnsupportedQos(message.qos));
        }

        let pkid = if message.qos == QoS::AtMostOnce {
            0
        } else {
            self.take_pkid()
        };
        let publish = message.to_publish(pkid);
        self.send(|buf| publish.write(buf)).await?;
        debug!(topic = %message.topic, id = message.id, len = message.len(), "Publish sent");
        Ok(())
    }

    /// Service the connection for at most `budget`.
    ///
    /// Sends a PINGREQ when the keepalive interval has passed without
    /// outgoing traffic, performs one bounded read, and dispatches every
    /// complete publish to `sink`. Returns the number of publishes
    /// delivered. A read that times out with no data is not an error.
    pub async fn yield_for(
        &mut self,
        budget: Duration,
        sink: &mut dyn DeliverySink,
    ) -> Result<usize, ProtocolError> {
        self.ensure_connected()?;
        self.service_keepalive().await?;

        let mut delivered = self.drain(sink, |_| false).await?.1;

        let n = self.read_some(budget).await?;
        if n > 0 {
            trace!(bytes = n, "Received data");
            delivered += self.drain(sink, |_| false).await?.1;
        }
        Ok(delivered)
    }

    /// Send DISCONNECT. A session that is not connected is left as is.
    pub async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.ping_outstanding = None;
        self.send(|buf| Disconnect.write(buf)).await
    }

    /// Drop protocol state after the transport is gone
    pub fn reset(&mut self) {
        self.connected = false;
        self.ping_outstanding = None;
        self.read_buf.clear();
        self.write_buf.clear();
    }

    fn ensure_connected(&self) -> Result<(), ProtocolError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ProtocolError::NotConnected)
        }
    }

    fn take_pkid(&mut self) -> u16 {
        self.next_pkid = self.next_pkid.wrapping_add(1);
        if self.next_pkid == 0 {
            self.next_pkid = 1;
        }
        self.next_pkid
    }

    async fn service_keepalive(&mut self) -> Result<(), ProtocolError> {
        if self.settings.keep_alive.is_zero() {
            return Ok(());
        }
        let now = Instant::now();

        if let Some(sent) = self.ping_outstanding {
            if now.duration_since(sent) >= self.settings.keep_alive {
                self.connected = false;
                return Err(ProtocolError::KeepaliveLost {
                    keep_alive_secs: self.settings.keep_alive_secs(),
                });
            }
            return Ok(());
        }

        if now.duration_since(self.last_outgoing) >= self.settings.keep_alive {
            trace!("Sending PINGREQ");
            self.send(|buf| PingReq.write(buf)).await?;
            self.ping_outstanding = Some(now);
        }
        Ok(())
    }

    async fn send<F>(&mut self, encode: F) -> Result<(), ProtocolError>
    where
        F: FnOnce(&mut BytesMut) -> Result<usize, CodecError>,
    {
        self.write_buf.clear();
        encode(&mut self.write_buf)?;
        if let Err(e) = self.transport.write(&self.write_buf).await {
            self.connected = false;
            return Err(ProtocolError::Transport(e));
        }
        self.last_outgoing = Instant::now();
        Ok(())
    }

    async fn read_some(&mut self, timeout: Duration) -> Result<usize, ProtocolError> {
        match self.transport.read(&mut self.chunk, timeout).await {
            Ok(n) => {
                self.read_buf.extend_from_slice(&self.chunk[..n]);
                Ok(n)
            }
            Err(e) => {
                self.connected = false;
                Err(ProtocolError::Transport(e))
            }
        }
    }

    /// Decode every complete packet in the read buffer.
    ///
    /// Stops early and returns the first packet accepted by `wanted`.
    async fn drain<F>(
        &mut self,
        sink: &mut dyn DeliverySink,
        wanted: F,
    ) -> Result<(Option<Packet>, usize), ProtocolError>
    where
        F: Fn(&Packet) -> bool,
    {
        let mut delivered = 0;
        loop {
            let packet = match v4::read(&mut self.read_buf, self.settings.max_packet_size) {
                Ok(packet) => packet,
                Err(CodecError::InsufficientBytes(_)) => return Ok((None, delivered)),
                Err(e) => {
                    self.connected = false;
                    return Err(ProtocolError::Codec(e));
                }
            };

            if wanted(&packet) {
                return Ok((Some(packet), delivered));
            }
            if self.handle_packet(packet, sink).await? {
                delivered += 1;
            }
        }
    }

    /// Returns true when the packet was a publish handed to the sink
    async fn handle_packet(
        &mut self,
        packet: Packet,
        sink: &mut dyn DeliverySink,
    ) -> Result<bool, ProtocolError> {
        match packet {
            Packet::Publish(publish) => {
                if publish.qos == QoS::AtLeastOnce {
                    let ack = PubAck::new(publish.pkid);
                    self.send(|buf| ack.write(buf)).await?;
                }
                let message = InboundMessage::from(publish);
                trace!(topic = %message.topic, len = message.len(), "Publish received");
                sink.deliver(&message);
                Ok(true)
            }
            Packet::PingResp => {
                trace!("PINGRESP received");
                self.ping_outstanding = None;
                Ok(false)
            }
            Packet::PubAck(ack) => {
                debug!(pkid = ack.pkid, "PUBACK received");
                Ok(false)
            }
            Packet::Disconnect => {
                self.connected = false;
                Err(ProtocolError::Transport(TransportError::Closed))
            }
            other => {
                warn!("Ignoring unexpected packet: {:?}", other);
                Ok(false)
            }
        }
    }

    async fn await_packet<F>(
        &mut self,
        what: &'static str,
        sink: &mut dyn DeliverySink,
        wanted: F,
    ) -> Result<Packet, ProtocolError>
    where
        F: Fn(&Packet) -> bool,
    {
        let deadline = Instant::now() + self.settings.ack_timeout;
        loop {
            if let (Some(packet), _) = self.drain(sink, &wanted).await? {
                return Ok(packet);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ProtocolError::AckTimeout {
                    packet: what,
                    timeout_ms: self.settings.ack_timeout.as_millis() as u64,
                });
            }
            self.read_some(deadline - now).await?;
        }
    }
}

impl<T: Transport + std::fmt::Debug> std::fmt::Debug for MqttProtocol<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttProtocol")
            .field("transport", &self.transport)
            .field("connected", &self.connected)
            .field("next_pkid", &self.next_pkid)
            .field("ping_outstanding", &self.ping_outstanding.is_some())
            .finish()
    }
}
