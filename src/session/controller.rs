//! Session controller
//!
//! Owns the transport, protocol adapter, router and scheduler, and drives
//! them through the states in `state.rs`. Every operation is bounded: the
//! connect handshake by the ack timeout, each service tick by its budget
//! plus the ack timeout. Nothing here retries; reconnect policy lives in
//! the runner.

use super::router::{MessageRouter, RouterStats};
use super::scheduler::{PublishScheduler, StimulusHandle};
use super::state::{
    can_exchange_messages, log_state_transition, next_state, SessionEvent, SessionState,
    StateNotification,
};
use crate::auth::{Clock, Credential, CredentialError, CredentialProvider};
use crate::error::{SessionError, SessionResult};
use crate::protocol::{InboundMessage, MqttProtocol, ProtocolSettings};
use crate::transport::{NetworkInterface, Transport, TrustConfig};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rumqttc::mqttbytes::QoS;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Tunables for one session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    /// Installed on the transport before each connect; `None` keeps the
    /// transport's own defaults
    pub trust: Option<TrustConfig>,
    pub keep_alive: Duration,
    /// Read budget of one service tick
    pub tick: Duration,
    pub ack_timeout: Duration,
    /// Renew time-bounded credentials this long before they expire
    pub renew_margin: chrono::Duration,
    pub qos: QoS,
    pub max_payload_bytes: usize,
    pub max_subscriptions: usize,
    pub publish_topic: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8883,
            trust: None,
            keep_alive: Duration::from_secs(60),
            tick: Duration::from_millis(100),
            ack_timeout: Duration::from_secs(5),
            renew_margin: chrono::Duration::seconds(300),
            qos: QoS::AtMostOnce,
            max_payload_bytes: 1024,
            max_subscriptions: super::router::MAX_SUBSCRIPTIONS,
            publish_topic: None,
        }
    }
}

/// Result of one service tick
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Publishes decoded during this tick
    pub delivered: usize,
    /// An unconsumed message is waiting in the inbound slot
    pub message_arrived: bool,
    /// Id of the message published this tick
    pub published: Option<u64>,
    /// Per-call publish failure; the session is still up
    pub publish_error: Option<SessionError>,
    /// The credential was renewed by reconnecting
    pub renewed: bool,
}

/// Outcome of `disconnect`
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub already_disconnected: bool,
    /// Best-effort steps that failed, in order
    pub errors: Vec<SessionError>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Counters for one `Session` value, across reconnects
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub connects: u32,
    pub renewals: u32,
    pub ticks: u64,
    pub messages_received: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub inbound: RouterStats,
    pub outbound_overwritten: u64,
    pub connected_since: Option<Instant>,
}

pub struct Session<T: Transport> {
    config: SessionConfig,
    protocol: MqttProtocol<T>,
    network: Arc<dyn NetworkInterface>,
    credentials: Arc<dyn CredentialProvider>,
    clock: Arc<dyn Clock>,
    router: MessageRouter,
    scheduler: PublishScheduler,
    state: SessionState,
    notifier: Arc<watch::Sender<StateNotification>>,
    session_id: Option<Uuid>,
    active_credential: Option<Credential>,
    last_service: Option<Instant>,
    stats: SessionStats,
}

impl<T: Transport> Session<T> {
    pub fn new(
        transport: T,
        network: Arc<dyn NetworkInterface>,
        credentials: Arc<dyn CredentialProvider>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        let settings = ProtocolSettings {
            keep_alive: config.keep_alive,
            ack_timeout: config.ack_timeout,
            ..ProtocolSettings::default()
        };
        let (notifier, _) = watch::channel(StateNotification::initial());
        Self {
            router: MessageRouter::new(config.max_subscriptions, config.max_payload_bytes),
            scheduler: PublishScheduler::new(config.publish_topic.clone(), config.qos),
            protocol: MqttProtocol::new(transport, settings),
            network,
            credentials,
            clock,
            config,
            state: SessionState::Disconnected,
            notifier: Arc::new(notifier),
            session_id: None,
            active_credential: None,
            last_service: None,
            stats: SessionStats::default(),
        }
    }

    /// Use an externally owned stimulus handle, so triggers survive
    /// rebuilding the session
    pub fn with_stimulus(mut self, stimulus: StimulusHandle) -> Self {
        self.scheduler = self.scheduler.with_stimulus(stimulus);
        self
    }

    /// Publish state notifications on a shared channel
    pub fn with_notifier(mut self, notifier: Arc<watch::Sender<StateNotification>>) -> Self {
        notifier.send_replace(StateNotification::initial());
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Receiver that sees every state transition
    pub fn state_receiver(&self) -> watch::Receiver<StateNotification> {
        self.notifier.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        can_exchange_messages(self.state) && self.protocol.is_connected()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    /// Expiry of the credential the current connection was made with
    pub fn credential_expiry(&self) -> Option<DateTime<Utc>> {
        self.active_credential.as_ref().and_then(Credential::expires_at)
    }

    /// When the last tick completed
    pub fn last_service(&self) -> Option<Instant> {
        self.last_service
    }

    pub fn stats(&self) -> SessionStats {
        let mut stats = self.stats.clone();
        stats.inbound = self.router.stats();
        stats.outbound_overwritten = self.scheduler.overwritten();
        stats
    }

    pub fn transport(&self) -> &T {
        self.protocol.transport()
    }

    /// Handle that requests a publish from any thread
    pub fn stimulus_handle(&self) -> StimulusHandle {
        self.scheduler.stimulus_handle()
    }

    /// Queue a message for the next tick, replacing any unsent one
    pub fn schedule(&mut self, payload: impl Into<Bytes>) -> Option<u64> {
        self.scheduler.schedule(payload)
    }

    /// Take the message waiting in the inbound slot, if any
    pub fn take_message(&mut self) -> Option<InboundMessage> {
        self.router.take()
    }

    pub fn message_arrived(&self) -> bool {
        self.router.has_message()
    }

    /// Issue a credential and connect with it
    pub async fn connect(&mut self) -> SessionResult<()> {
        self.require(SessionState::Disconnected, "connect")?;
        let credential = {
            let _span = crate::auth_span!(kind = self.credentials.kind()).entered();
            self.credentials.issue(self.clock.as_ref())?
        };
        self.connect_with_credential(credential).await
    }

    /// Connect with a caller supplied credential.
    ///
    /// A time-bounded credential is checked against the clock before any
    /// network activity.
    pub async fn connect_with_credential(&mut self, credential: Credential) -> SessionResult<()> {
        self.require(SessionState::Disconnected, "connect")?;
        self.check_fresh(&credential)?;

        let session_id = Uuid::new_v4();
        self.session_id = Some(session_id);
        let span = crate::session_span!(
            session_id = %session_id,
            host = %self.config.host,
            port = self.config.port,
            client_id = %credential.client_id()
        );
        self.establish(credential).instrument(span).await
    }

    /// Register `handler` for `filter` and subscribe on the broker.
    ///
    /// A refused or failed subscription leaves the session up unless the
    /// transport itself went down.
    pub async fn subscribe<F>(&mut self, filter: &str, handler: F) -> SessionResult<QoS>
    where
        F: FnMut(&InboundMessage) + Send + 'static,
    {
        self.require_exchange("subscribe")?;
        let qos = self.config.qos;
        self.router.register(filter, qos, Box::new(handler))?;

        match self.protocol.subscribe(filter, qos, &mut self.router).await {
            Ok(granted) => {
                info!(filter, ?granted, "Subscribed");
                Ok(granted)
            }
            Err(e) => {
                self.router.remove(filter);
                let err = SessionError::subscribe_failed(filter, &e);
                if e.is_transport_down() {
                    self.teardown(Some(err.sanitized())).await;
                } else {
                    warn!(filter, "Subscribe failed: {}", err.sanitized());
                }
                Err(err)
            }
        }
    }

    /// Unsubscribe on the broker and drop the local registration
    pub async fn unsubscribe(&mut self, filter: &str) -> SessionResult<()> {
        self.require_exchange("unsubscribe")?;
        let result = self.protocol.unsubscribe(filter, &mut self.router).await;
        self.router.remove(filter);
        match result {
            Ok(()) => {
                info!(filter, "Unsubscribed");
                Ok(())
            }
            Err(e) => {
                let down = e.is_transport_down();
                let err = SessionError::from(e);
                if down {
                    self.teardown(Some(err.sanitized())).await;
                }
                Err(err)
            }
        }
    }

    /// One service step.
    ///
    /// Checks the connection and credential, reads for at most the tick
    /// budget, then sends at most one scheduled message. Fatal errors tear
    /// the session down before they are returned.
    pub async fn tick(&mut self) -> SessionResult<TickOutcome> {
        match self.state {
            SessionState::Ready => self.transition(SessionEvent::ServiceStarted, None)?,
            SessionState::Servicing => {}
            state => {
                return Err(SessionError::InvalidState {
                    state,
                    operation: "tick",
                })
            }
        }

        if !self.protocol.is_connected() {
            let err = SessionError::connection_lost("transport reports disconnected");
            self.teardown(Some(err.sanitized())).await;
            return Err(err);
        }

        let mut outcome = TickOutcome {
            renewed: self.maintain_credential().await?,
            ..TickOutcome::default()
        };

        let limit = self.config.tick + self.config.ack_timeout;
        let serviced = tokio::time::timeout(limit, self.service_io(&mut outcome)).await;
        let result = match serviced {
            Ok(result) => result,
            Err(_) => Err(SessionError::ServiceTimeout {
                budget_ms: limit.as_millis() as u64,
            }),
        };
        if let Err(err) = result {
            self.teardown(Some(err.sanitized())).await;
            return Err(err);
        }

        outcome.message_arrived = self.router.has_message();
        self.stats.ticks += 1;
        self.last_service = Some(Instant::now());
        Ok(outcome)
    }

    /// Service ticks until `shutdown` turns true, then disconnect.
    ///
    /// Each arrived message is passed to `on_message`. A fatal tick error
    /// ends the loop with the session already torn down.
    pub async fn run<F>(
        &mut self,
        shutdown: watch::Receiver<bool>,
        mut on_message: F,
    ) -> SessionResult<SessionStats>
    where
        F: FnMut(InboundMessage) + Send,
    {
        while !*shutdown.borrow() {
            let outcome = match self.tick().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Session loop stopped: {}", e.sanitized());
                    return Err(e);
                }
            };
            if outcome.message_arrived {
                if let Some(message) = self.take_message() {
                    on_message(message);
                }
            }
            if let Some(e) = outcome.publish_error {
                warn!("{}", e.sanitized());
            }
        }

        info!("Shutdown requested");
        let report = self.disconnect().await;
        if !report.is_clean() {
            warn!(errors = report.errors.len(), "Teardown finished with errors");
        }
        Ok(self.stats())
    }

    /// Unsubscribe everything, send DISCONNECT and close the transport.
    ///
    /// Every step is attempted even if an earlier one failed; failures are
    /// collected in the report. Calling this on a disconnected session is a
    /// no-op.
    pub async fn disconnect(&mut self) -> TeardownReport {
        self.teardown(None).await
    }

    fn require(&self, expected: SessionState, operation: &'static str) -> SessionResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                state: self.state,
                operation,
            })
        }
    }

    fn require_exchange(&self, operation: &'static str) -> SessionResult<()> {
        if can_exchange_messages(self.state) {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                state: self.state,
                operation,
            })
        }
    }

    fn transition(&mut self, event: SessionEvent, fault: Option<String>) -> SessionResult<()> {
        let Some(next) = next_state(self.state, event) else {
            return Err(SessionError::InvalidState {
                state: self.state,
                operation: event.name(),
            });
        };
        log_state_transition(self.state, next, fault.as_deref());
        self.state = next;
        self.notifier.send_replace(StateNotification { state: next, fault });
        Ok(())
    }

    fn trusted_now(&self) -> SessionResult<DateTime<Utc>> {
        self.clock
            .now()
            .ok_or(SessionError::TokenGeneration(CredentialError::UntrustedTime))
    }

    fn check_fresh(&self, credential: &Credential) -> SessionResult<()> {
        if credential.validity().is_none() {
            return Ok(());
        }
        match credential.ensure_valid(self.trusted_now()?) {
            Ok(()) => Ok(()),
            Err(CredentialError::Expired { expired_at }) => {
                warn!(%expired_at, "Refusing to connect with expired credential");
                Err(SessionError::TokenExpired { expired_at })
            }
            Err(other) => Err(other.into()),
        }
    }

    async fn establish(&mut self, credential: Credential) -> SessionResult<()> {
        self.transition(SessionEvent::ConnectRequested, None)?;

        if let Err(err) = self.open_transport().await {
            self.transition(SessionEvent::TransportFailed, Some(err.sanitized()))?;
            return Err(err);
        }
        self.transition(SessionEvent::TransportUp, None)?;
        self.transition(SessionEvent::ProtocolConnectStarted, None)?;

        if let Err(e) = self.protocol.connect(&credential).await {
            let err = SessionError::from(e);
            if let Err(close) = self.protocol.transport_mut().close().await {
                debug!("Close after failed connect: {}", close);
            }
            self.protocol.reset();
            self.transition(SessionEvent::ConnectRejected, Some(err.sanitized()))?;
            return Err(err);
        }

        self.active_credential = Some(credential);
        self.stats.connects += 1;
        self.stats.connected_since = Some(Instant::now());
        self.transition(SessionEvent::ConnAckAccepted, None)?;
        info!(
            host = %self.config.host,
            port = self.config.port,
            "Connected"
        );
        Ok(())
    }

    async fn open_transport(&mut self) -> SessionResult<()> {
        let span = crate::transport_span!(host = %self.config.host, port = self.config.port);
        async {
            let transport = self.protocol.transport_mut();
            transport
                .open(self.network.clone())
                .await
                .map_err(SessionError::from_connect_phase)?;
            if let Some(trust) = self.config.trust.clone() {
                transport
                    .configure_trust(trust)
                    .map_err(SessionError::from_connect_phase)?;
            }
            transport
                .connect(&self.config.host, self.config.port)
                .await
                .map_err(SessionError::from_connect_phase)
        }
        .instrument(span)
        .await
    }

    async fn service_io(&mut self, outcome: &mut TickOutcome) -> SessionResult<()> {
        outcome.delivered = self
            .protocol
            .yield_for(self.config.tick, &mut self.router)
            .await?;
        self.stats.messages_received += outcome.delivered as u64;

        let Some(message) = self.scheduler.poll() else {
            return Ok(());
        };
        match self.protocol.publish(&message).await {
            Ok(()) => {
                info!(id = message.id, topic = %message.topic, "Published message");
                self.stats.messages_published += 1;
                outcome.published = Some(message.id);
                Ok(())
            }
            Err(e) => {
                self.stats.publish_failures += 1;
                let down = e.is_transport_down();
                let err = SessionError::publish_failed(message.topic.clone(), &e);
                if down {
                    Err(err)
                } else {
                    outcome.publish_error = Some(err);
                    Ok(())
                }
            }
        }
    }

    /// Tear down on expiry, reconnect with a fresh credential when renewal
    /// is due. Returns whether a renewal happened.
    async fn maintain_credential(&mut self) -> SessionResult<bool> {
        let Some(active) = self.active_credential.as_ref() else {
            return Ok(false);
        };
        if active.validity().is_none() {
            return Ok(false);
        }
        let Some(now) = self.clock.now() else {
            warn!("Clock not synchronized, skipping credential check");
            return Ok(false);
        };

        let expired = active.ensure_valid(now).err();
        let due = active.renewal_due(now, self.config.renew_margin);

        if let Some(CredentialError::Expired { expired_at }) = expired {
            let err = SessionError::TokenExpired { expired_at };
            self.teardown(Some(err.sanitized())).await;
            return Err(err);
        }
        if !due {
            return Ok(false);
        }

        let fresh = {
            let _span = crate::auth_span!(kind = self.credentials.kind()).entered();
            self.credentials.issue(self.clock.as_ref())
        };
        match fresh {
            Ok(credential) => {
                self.renew(credential).await?;
                Ok(true)
            }
            Err(e) => {
                // Keep the current connection until the old credential lapses
                warn!("Credential renewal failed, will retry: {}", e);
                Ok(false)
            }
        }
    }

    async fn renew(&mut self, credential: Credential) -> SessionResult<()> {
        info!(expires_at = ?self.credential_expiry(), "Renewing credential by reconnecting");
        let filters = self.router.filters();

        self.transition(SessionEvent::ShutdownRequested, None)?;
        if let Err(e) = self.protocol.disconnect().await {
            debug!("DISCONNECT before renewal failed: {}", e);
        }
        if let Err(e) = self.protocol.transport_mut().close().await {
            debug!("Close before renewal failed: {}", e);
        }
        self.protocol.reset();
        self.active_credential = None;
        self.transition(SessionEvent::TeardownComplete, None)?;

        if let Err(err) = self.establish(credential).await {
            self.router.clear();
            return Err(err);
        }
        self.stats.renewals += 1;

        for (filter, qos) in filters {
            if let Err(e) = self.protocol.subscribe(&filter, qos, &mut self.router).await {
                let down = e.is_transport_down();
                let err = SessionError::subscribe_failed(filter.as_str(), &e);
                self.router.remove(&filter);
                if down {
                    self.teardown(Some(err.sanitized())).await;
                    return Err(err);
                }
                warn!(filter = %filter, "Re-subscribe after renewal failed: {}", err.sanitized());
            }
        }

        self.transition(SessionEvent::ServiceStarted, None)
    }

    async fn teardown(&mut self, fault: Option<String>) -> TeardownReport {
        if self.state == SessionState::Disconnected {
            return TeardownReport {
                already_disconnected: true,
                errors: Vec::new(),
            };
        }

        let event = if fault.is_some() {
            SessionEvent::Fault
        } else {
            SessionEvent::ShutdownRequested
        };
        if self.transition(event, fault.clone()).is_err() {
            // Connect phases settle synchronously; force the state if reached
            self.state = SessionState::Disconnecting;
        }

        let mut errors = Vec::new();
        for (filter, _) in self.router.filters() {
            match self.protocol.unsubscribe(&filter, &mut self.router).await {
                Ok(()) => debug!(filter = %filter, "Unsubscribed during teardown"),
                Err(e) => errors.push(SessionError::teardown("unsubscribe", e)),
            }
        }
        if let Err(e) = self.protocol.disconnect().await {
            errors.push(SessionError::teardown("disconnect", e));
        }
        if let Err(e) = self.protocol.transport_mut().close().await {
            errors.push(SessionError::teardown("close", e));
        }

        self.protocol.reset();
        self.router.clear();
        if let Some(discarded) = self.scheduler.discard_pending() {
            debug!(id = discarded.id, "Discarding unsent message");
        }
        self.active_credential = None;
        self.stats.connected_since = None;

        for err in &errors {
            warn!("{}", err.sanitized());
        }

        if let Err(e) = self.transition(SessionEvent::TeardownComplete, fault) {
            error!("Teardown state error: {}", e);
            self.state = SessionState::Disconnected;
        }

        TeardownReport {
            already_disconnected: false,
            errors,
        }
    }
}

impl<T: Transport> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("state", &self.state)
            .field("session_id", &self.session_id)
            .field("credentials", &self.credentials.kind())
            .field("router", &self.router)
            .finish()
    }
}
