//! Session supervision: build, connect, subscribe, run, and reconnect with
//! backoff after failures
//!
//! The session controller never retries. This is the caller-side policy the
//! binary uses; each attempt gets a fresh `Session` and transport while the
//! stimulus handle and state channel stay shared across attempts.

use crate::auth::{Clock, CredentialError, CredentialProvider, SystemClock};
use crate::config::{ConfigError, DeviceConfig};
use crate::error::{SessionError, SessionResult};
use crate::protocol::InboundMessage;
use crate::session::{Session, SessionConfig, SessionStats, StateNotification, StimulusHandle};
use crate::transport::{HostNetwork, NetworkInterface, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Reconnection policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive failed attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![1_000, 2_000, 5_000, 10_000],
            sustained_delay: 30_000,
        }
    }
}

impl ReconnectConfig {
    /// Total delay across all attempts, `None` for unlimited retries
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Delay in milliseconds before attempt number `attempt` (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    pub fn attempts_exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }
}

/// Whether another attempt can succeed without operator action
pub fn is_retryable(error: &SessionError) -> bool {
    match error {
        SessionError::TokenGeneration(CredentialError::UntrustedTime) => true,
        SessionError::TokenGeneration(_)
        | SessionError::InvalidState { .. }
        | SessionError::SubscriptionLimit { .. } => false,
        _ => true,
    }
}

/// Builds sessions that share one stimulus handle and one state channel
pub struct Supervisor {
    config: SessionConfig,
    subscribe_filter: Option<String>,
    network: Arc<dyn NetworkInterface>,
    credentials: Arc<dyn CredentialProvider>,
    clock: Arc<dyn Clock>,
    reconnect: ReconnectConfig,
    stimulus: StimulusHandle,
    notifier: Arc<watch::Sender<StateNotification>>,
}

impl Supervisor {
    pub fn new(
        config: SessionConfig,
        network: Arc<dyn NetworkInterface>,
        credentials: Arc<dyn CredentialProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (notifier, _) = watch::channel(StateNotification::initial());
        Self {
            config,
            subscribe_filter: None,
            network,
            credentials,
            clock,
            reconnect: ReconnectConfig::default(),
            stimulus: StimulusHandle::new(),
            notifier: Arc::new(notifier),
        }
    }

    /// Supervisor for a loaded device configuration, on the host network
    /// and system clock
    pub fn from_config(config: &DeviceConfig) -> Result<Self, ConfigError> {
        let supervisor = Self::new(
            config.session_config()?,
            Arc::new(HostNetwork::new()),
            config.credential_provider()?,
            Arc::new(SystemClock::new()),
        );
        Ok(match config.subscribe_filter()? {
            Some(filter) => supervisor.with_subscription(filter),
            None => supervisor,
        })
    }

    pub fn with_subscription<S: Into<String>>(mut self, filter: S) -> Self {
        self.subscribe_filter = Some(filter.into());
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn stimulus_handle(&self) -> StimulusHandle {
        self.stimulus.clone()
    }

    pub fn state_receiver(&self) -> watch::Receiver<StateNotification> {
        self.notifier.subscribe()
    }

    /// Fresh session over `transport`, wired to the shared handles
    pub fn build_session<T: Transport>(&self, transport: T) -> Session<T> {
        Session::new(
            transport,
            self.network.clone(),
            self.credentials.clone(),
            self.clock.clone(),
            self.config.clone(),
        )
        .with_stimulus(self.stimulus.clone())
        .with_notifier(self.notifier.clone())
    }

    /// One attempt: connect, subscribe, service until shutdown or failure
    pub async fn run_once<T, M>(
        &self,
        transport: T,
        shutdown: watch::Receiver<bool>,
        on_message: M,
    ) -> SessionResult<SessionStats>
    where
        T: Transport,
        M: FnMut(InboundMessage) + Send,
    {
        self.attempt(transport, shutdown, on_message).await.result
    }

    async fn attempt<T, M>(
        &self,
        transport: T,
        shutdown: watch::Receiver<bool>,
        on_message: M,
    ) -> Attempt
    where
        T: Transport,
        M: FnMut(InboundMessage) + Send,
    {
        let mut session = self.build_session(transport);
        let result = self.drive(&mut session, shutdown, on_message).await;
        Attempt {
            reached_ready: session.stats().connects > 0,
            result,
        }
    }

    async fn drive<T, M>(
        &self,
        session: &mut Session<T>,
        shutdown: watch::Receiver<bool>,
        on_message: M,
    ) -> SessionResult<SessionStats>
    where
        T: Transport,
        M: FnMut(InboundMessage) + Send,
    {
        session.connect().await?;

        if let Some(filter) = &self.subscribe_filter {
            match session
                .subscribe(filter, |message| {
                    debug!(topic = %message.topic, len = message.len(), "Delivery");
                })
                .await
            {
                Ok(_) => {}
                Err(e) if session.is_connected() => {
                    warn!("Continuing without subscription: {}", e.sanitized());
                }
                Err(e) => return Err(e),
            }
        }

        session.run(shutdown, on_message).await
    }

    /// Run attempts until shutdown, a permanent error, or the attempt limit
    pub async fn supervise<T, F, M>(
        &self,
        mut make_transport: F,
        mut shutdown: watch::Receiver<bool>,
        mut on_message: M,
    ) -> SessionResult<SessionStats>
    where
        T: Transport,
        F: FnMut() -> T,
        M: FnMut(InboundMessage) + Send,
    {
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                return Ok(SessionStats::default());
            }

            let attempt = self
                .attempt(make_transport(), shutdown.clone(), &mut on_message)
                .await;

            let err = match attempt.result {
                Ok(stats) => {
                    info!(
                        published = stats.messages_published,
                        received = stats.messages_received,
                        "Session finished"
                    );
                    return Ok(stats);
                }
                Err(e) => e,
            };

            if !is_retryable(&err) {
                error!("Giving up: {}", err.sanitized());
                return Err(err);
            }

            // A session that reached Ready resets the failure count
            if attempt.reached_ready {
                failures = 0;
            }
            failures += 1;

            if self.reconnect.attempts_exhausted(failures) {
                error!(failures, "Reconnect attempts exhausted: {}", err.sanitized());
                return Err(err);
            }

            let delay = Duration::from_millis(self.reconnect.calculate_backoff_delay(failures));
            warn!(
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "Session failed, reconnecting: {}",
                err.sanitized()
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}

/// Outcome of one supervised attempt
struct Attempt {
    reached_ready: bool,
    result: SessionResult<SessionStats>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("subscribe_filter", &self.subscribe_filter)
            .field("credentials", &self.credentials.kind())
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{SignedTokenProvider, StaticCredentials, TokenAlgorithm, TokenSettings};
    use crate::testing::{ManualClock, MockBroker, MockNetwork};
    use rumqttc::ConnectReturnCode;

    fn supervisor() -> Supervisor {
        let config = SessionConfig {
            host: "broker.example.com".to_string(),
            publish_topic: Some("devices/123/events".to_string()),
            ..SessionConfig::default()
        };
        Supervisor::new(
            config,
            Arc::new(MockNetwork::up()),
            Arc::new(StaticCredentials::new("123", "123", "pw")),
            Arc::new(ManualClock::at(1_700_000_000)),
        )
        .with_subscription("devices/123/config")
    }

    #[test]
    fn test_reconnect_config_defaults() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.calculate_max_total_time(), None);
        assert!(!config.attempts_exhausted(1_000));
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let config = ReconnectConfig {
            max_attempts: Some(6),
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        };
        assert_eq!(config.calculate_backoff_delay(0), 25);
        assert_eq!(config.calculate_backoff_delay(1), 25);
        assert_eq!(config.calculate_backoff_delay(4), 250);
        assert_eq!(config.calculate_backoff_delay(100), 250);
        assert_eq!(config.calculate_max_total_time(), Some(25 + 50 + 100 + 250 + 250 + 250));
        assert!(config.attempts_exhausted(6));
        assert!(!config.attempts_exhausted(5));
    }

    #[test]
    fn test_empty_pattern_uses_sustained_delay() {
        let config = ReconnectConfig {
            max_attempts: None,
            backoff_pattern: vec![],
            sustained_delay: 500,
        };
        assert_eq!(config.calculate_backoff_delay(1), 500);
    }

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(&SessionError::connection_lost("eof")));
        assert!(is_retryable(&SessionError::TokenGeneration(
            CredentialError::UntrustedTime
        )));
        assert!(!is_retryable(&SessionError::TokenGeneration(
            CredentialError::KeyMalformed("bad".to_string())
        )));
        assert!(!is_retryable(&SessionError::SubscriptionLimit { max: 4 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervise_stops_after_attempt_limit() {
        let broker = MockBroker::new();
        broker.set_connack_code(ConnectReturnCode::NotAuthorized);
        let supervisor = supervisor().with_reconnect(ReconnectConfig {
            max_attempts: Some(3),
            backoff_pattern: vec![10],
            sustained_delay: 10,
        });
        let (_tx, shutdown) = watch::channel(false);

        let result = supervisor
            .supervise(|| broker.transport(), shutdown, |_| {})
            .await;

        assert!(matches!(
            result,
            Err(SessionError::ProtocolConnectRejected { .. })
        ));
        assert_eq!(broker.connect_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervise_subscribes_and_shuts_down() {
        let broker = MockBroker::new();
        let supervisor = supervisor();
        let stimulus = supervisor.stimulus_handle();
        let (tx, shutdown) = watch::channel(false);

        let task = {
            let broker = broker.clone();
            async move {
                supervisor
                    .supervise(|| broker.transport(), shutdown, |_| {})
                    .await
            }
        };
        let driver = async {
            tokio::time::sleep(Duration::from_millis(250)).await;
            stimulus.trigger();
            tokio::time::sleep(Duration::from_millis(250)).await;
            tx.send_replace(true);
        };

        let (result, _) = tokio::join!(task, driver);
        let stats = result.unwrap();
        assert_eq!(stats.messages_published, 1);
        assert_eq!(broker.subscriptions(), Vec::<String>::new());
        assert_eq!(broker.unsubscriptions(), vec!["devices/123/config".to_string()]);
        assert_eq!(broker.published().len(), 1);
        assert_eq!(broker.disconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervise_reconnects_after_connection_loss() {
        let broker = MockBroker::new();
        let supervisor = supervisor().with_reconnect(ReconnectConfig {
            max_attempts: None,
            backoff_pattern: vec![50],
            sustained_delay: 50,
        });
        let (tx, shutdown) = watch::channel(false);

        let task = {
            let broker = broker.clone();
            async move {
                supervisor
                    .supervise(|| broker.transport(), shutdown, |_| {})
                    .await
            }
        };
        let driver = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            broker.drop_connection();
            tokio::time::sleep(Duration::from_millis(500)).await;
            tx.send_replace(true);
        };

        let (result, _) = tokio::join!(task, driver);
        assert!(result.is_ok());
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_after_ready_resets_attempt_count() {
        let broker = MockBroker::new();
        let clock = Arc::new(ManualClock::at(1_700_000_000));
        let provider = SignedTokenProvider::from_pem(
            "123",
            "unused",
            TokenAlgorithm::Hs256,
            b"shared-secret",
            TokenSettings::new("proj-1", chrono::Duration::seconds(600)),
        )
        .unwrap();
        let config = SessionConfig {
            host: "broker.example.com".to_string(),
            ..SessionConfig::default()
        };
        let supervisor = Supervisor::new(
            config,
            Arc::new(MockNetwork::up()),
            Arc::new(provider),
            clock.clone(),
        )
        .with_reconnect(ReconnectConfig {
            max_attempts: Some(2),
            backoff_pattern: vec![50],
            sustained_delay: 50,
        });
        let (tx, shutdown) = watch::channel(false);

        let task = {
            let broker = broker.clone();
            async move {
                supervisor
                    .supervise(|| broker.transport(), shutdown, |_| {})
                    .await
            }
        };
        let driver = async {
            // Each jump lands past the token's expiry while the session is Ready
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(400)).await;
                clock.advance(chrono::Duration::seconds(700));
            }
            tokio::time::sleep(Duration::from_millis(400)).await;
            tx.send_replace(true);
        };

        let (result, _) = tokio::join!(task, driver);
        assert!(result.is_ok(), "expected clean shutdown, got {result:?}");
        assert_eq!(broker.connect_count(), 4);
    }
}
