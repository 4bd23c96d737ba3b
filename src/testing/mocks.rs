//! Mock implementations for testing
//!
//! `MockBroker` is an in-memory MQTT broker that frames client packets with
//! the real codec and answers them. `MockTransport` is the client end of it.
//! `MockNetwork` and `ManualClock` stand in for network bring-up and time
//! synchronization.

use crate::auth::Clock;
use crate::transport::{NetworkInterface, Transport, TransportError, TrustConfig};
use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use rumqttc::mqttbytes::{v4, Error as CodecError, QoS};
use rumqttc::{
    ConnAck, Connect, ConnectReturnCode, Packet, PingResp, PubAck, Publish, SubAck,
    SubscribeReasonCode, UnsubAck,
};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;

#[derive(Debug)]
struct BrokerState {
    to_client: BytesMut,
    from_client: BytesMut,
    connack_code: ConnectReturnCode,
    silent: bool,
    dropped: bool,
    fail_open: bool,
    fail_handshake: bool,
    fail_close: bool,
    drop_unsuback: bool,
    refused_filters: Vec<String>,
    connects: Vec<Connect>,
    endpoints: Vec<(String, u16)>,
    trust_configs: Vec<TrustConfig>,
    subscriptions: Vec<String>,
    unsubscriptions: Vec<String>,
    published: Vec<Publish>,
    pubacks: Vec<u16>,
    pings: usize,
    disconnects: usize,
    read_timeouts: usize,
    calls: Vec<String>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            to_client: BytesMut::new(),
            from_client: BytesMut::new(),
            connack_code: ConnectReturnCode::Success,
            silent: false,
            dropped: false,
            fail_open: false,
            fail_handshake: false,
            fail_close: false,
            drop_unsuback: false,
            refused_filters: Vec::new(),
            connects: Vec::new(),
            endpoints: Vec::new(),
            trust_configs: Vec::new(),
            subscriptions: Vec::new(),
            unsubscriptions: Vec::new(),
            published: Vec::new(),
            pubacks: Vec::new(),
            pings: 0,
            disconnects: 0,
            read_timeouts: 0,
            calls: Vec::new(),
        }
    }
}

impl BrokerState {
    fn queue<F>(&mut self, encode: F)
    where
        F: FnOnce(&mut BytesMut) -> Result<usize, CodecError>,
    {
        if self.silent {
            return;
        }
        // Encoding fixed, well-formed packets cannot fail
        let _ = encode(&mut self.to_client);
    }

    fn absorb(&mut self, bytes: &[u8]) {
        self.from_client.extend_from_slice(bytes);
        while let Ok(packet) = v4::read(&mut self.from_client, usize::MAX) {
            self.answer(packet);
        }
    }

    fn answer(&mut self, packet: Packet) {
        match packet {
            Packet::Connect(connect) => {
                self.connects.push(connect);
                let ack = ConnAck::new(self.connack_code, false);
                self.queue(|buf| ack.write(buf));
            }
            Packet::Subscribe(subscribe) => {
                let mut codes = Vec::new();
                for filter in &subscribe.filters {
                    if self.refused_filters.contains(&filter.path) {
                        codes.push(SubscribeReasonCode::Failure);
                    } else {
                        self.subscriptions.push(filter.path.clone());
                        codes.push(SubscribeReasonCode::Success(filter.qos));
                    }
                }
                let ack = SubAck::new(subscribe.pkid, codes);
                self.queue(|buf| ack.write(buf));
            }
            Packet::Unsubscribe(unsubscribe) => {
                for topic in &unsubscribe.topics {
                    self.subscriptions.retain(|s| s != topic);
                    self.unsubscriptions.push(topic.clone());
                }
                if !self.drop_unsuback {
                    let ack = UnsubAck::new(unsubscribe.pkid);
                    self.queue(|buf| ack.write(buf));
                }
            }
            Packet::Publish(publish) => {
                if publish.qos == QoS::AtLeastOnce {
                    let ack = PubAck::new(publish.pkid);
                    self.queue(|buf| ack.write(buf));
                }
                self.published.push(publish);
            }
            Packet::PubAck(ack) => self.pubacks.push(ack.pkid),
            Packet::PingReq => {
                self.pings += 1;
                self.queue(|buf| PingResp.write(buf));
            }
            Packet::Disconnect => self.disconnects += 1,
            _ => {}
        }
    }
}

/// Shared in-memory broker
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A fresh client transport attached to this broker
    pub fn transport(&self) -> MockTransport {
        MockTransport {
            broker: self.clone(),
            bound: false,
            open: false,
        }
    }

    pub fn set_connack_code(&self, code: ConnectReturnCode) {
        self.state().connack_code = code;
    }

    /// Record client packets without ever answering
    pub fn set_silent(&self, silent: bool) {
        self.state().silent = silent;
    }

    pub fn refuse_filter(&self, filter: &str) {
        self.state().refused_filters.push(filter.to_string());
    }

    pub fn fail_open(&self, fail: bool) {
        self.state().fail_open = fail;
    }

    pub fn fail_handshake(&self, fail: bool) {
        self.state().fail_handshake = fail;
    }

    pub fn fail_close(&self, fail: bool) {
        self.state().fail_close = fail;
    }

    /// Accept UNSUBSCRIBE but never acknowledge it
    pub fn drop_unsuback(&self, drop: bool) {
        self.state().drop_unsuback = drop;
    }

    /// Queue an at-most-once publish for the client
    pub fn inject_publish(&self, topic: &str, payload: &str) {
        let publish = Publish::new(topic, QoS::AtMostOnce, payload);
        let mut state = self.state();
        let _ = publish.write(&mut state.to_client);
    }

    /// Queue an at-least-once publish for the client
    pub fn inject_publish_qos1(&self, topic: &str, payload: &str, pkid: u16) {
        let mut publish = Publish::new(topic, QoS::AtLeastOnce, payload);
        publish.pkid = pkid;
        let mut state = self.state();
        let _ = publish.write(&mut state.to_client);
    }

    /// Queue raw bytes for the client
    pub fn inject_raw(&self, bytes: &[u8]) {
        self.state().to_client.extend_from_slice(bytes);
    }

    /// Simulate the broker closing the connection
    pub fn drop_connection(&self) {
        let mut state = self.state();
        state.dropped = true;
        state.to_client.clear();
    }

    pub fn last_connect(&self) -> Option<Connect> {
        self.state().connects.last().cloned()
    }

    pub fn connect_count(&self) -> usize {
        self.state().connects.len()
    }

    pub fn endpoints(&self) -> Vec<(String, u16)> {
        self.state().endpoints.clone()
    }

    pub fn trust_configs(&self) -> Vec<TrustConfig> {
        self.state().trust_configs.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state().subscriptions.clone()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        self.state().unsubscriptions.clone()
    }

    pub fn published(&self) -> Vec<Publish> {
        self.state().published.clone()
    }

    pub fn pubacks(&self) -> Vec<u16> {
        self.state().pubacks.clone()
    }

    pub fn ping_count(&self) -> usize {
        self.state().pings
    }

    pub fn disconnect_count(&self) -> usize {
        self.state().disconnects
    }

    pub fn read_timeouts(&self) -> usize {
        self.state().read_timeouts
    }

    /// Transport level calls in order: open, configure_trust, connect, close
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }
}

/// Client end of a `MockBroker`
#[derive(Debug)]
pub struct MockTransport {
    broker: MockBroker,
    bound: bool,
    open: bool,
}

impl MockTransport {
    /// Skip open and connect, for protocol level tests
    pub fn connect_now(&mut self) {
        self.bound = true;
        self.open = true;
        self.broker.state().dropped = false;
    }

    pub fn broker(&self) -> &MockBroker {
        &self.broker
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self, network: Arc<dyn NetworkInterface>) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.calls.push("open".to_string());
        if state.fail_open || !network.is_up() {
            return Err(TransportError::NetworkUnavailable);
        }
        self.bound = true;
        Ok(())
    }

    fn configure_trust(&mut self, trust: TrustConfig) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.calls.push("configure_trust".to_string());
        state.trust_configs.push(trust);
        Ok(())
    }

    async fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.calls.push(format!("connect {host}:{port}"));
        if !self.bound {
            return Err(TransportError::NotBound);
        }
        if state.fail_handshake {
            return Err(TransportError::TlsHandshake {
                host: host.to_string(),
                source: io::Error::new(
                    io::ErrorKind::InvalidData,
                    "invalid peer certificate: UnknownIssuer",
                ),
            });
        }
        state.endpoints.push((host.to_string(), port));
        state.dropped = false;
        state.to_client.clear();
        state.from_client.clear();
        self.open = true;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        {
            let mut state = self.broker.state();
            if !state.to_client.is_empty() {
                let n = buf.len().min(state.to_client.len());
                let chunk = state.to_client.split_to(n);
                buf[..n].copy_from_slice(&chunk);
                return Ok(n);
            }
            if state.dropped {
                return Err(TransportError::Closed);
            }
        }

        tokio::time::sleep(timeout).await;
        self.broker.state().read_timeouts += 1;
        Ok(0)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        let mut state = self.broker.state();
        if state.dropped {
            return Err(TransportError::Closed);
        }
        state.absorb(buf);
        Ok(buf.len())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.calls.push("close".to_string());
        if !self.open {
            return Ok(());
        }
        self.open = false;
        if state.fail_close {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "close_notify not sent",
            )));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open && !self.broker.state().dropped
    }
}

/// Network interface with a switchable link state
#[derive(Debug, Clone)]
pub struct MockNetwork {
    up: bool,
}

impl MockNetwork {
    pub fn up() -> Self {
        Self { up: true }
    }

    pub fn down() -> Self {
        Self { up: false }
    }
}

#[async_trait]
impl NetworkInterface for MockNetwork {
    fn is_up(&self) -> bool {
        self.up
    }

    async fn connect_tcp(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        if !self.up {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "link down"));
        }
        TcpStream::connect((host, port)).await
    }
}

/// Settable clock; `None` models an unsynchronized RTC
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Option<DateTime<Utc>>>,
}

impl ManualClock {
    /// Clock reading `secs` seconds after the Unix epoch
    pub fn at(secs: i64) -> Self {
        Self {
            now: Mutex::new(Utc.timestamp_opt(secs, 0).single()),
        }
    }

    pub fn unsynchronized() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, secs: i64) {
        *self.slot() = Utc.timestamp_opt(secs, 0).single();
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut slot = self.slot();
        if let Some(now) = *slot {
            *slot = Some(now + by);
        }
    }

    pub fn desynchronize(&self) {
        *self.slot() = None;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Option<DateTime<Utc>> {
        *self.slot()
    }
}
