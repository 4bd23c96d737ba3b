//! Pure session state machine
//!
//! Transitions are computed by `next_state` without side effects so the
//! controller, the indicator and the tests agree on one table.

use tracing::{error, info, warn};

/// Lifecycle state of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    TransportConnecting,
    TransportConnected,
    ProtocolConnecting,
    Ready,
    Servicing,
    Disconnecting,
}

/// Events that drive state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectRequested,
    TransportUp,
    TransportFailed,
    ProtocolConnectStarted,
    ConnAckAccepted,
    ConnectRejected,
    ServiceStarted,
    Fault,
    ShutdownRequested,
    TeardownComplete,
}

impl SessionEvent {
    pub fn name(self) -> &'static str {
        match self {
            SessionEvent::ConnectRequested => "connect",
            SessionEvent::TransportUp => "transport_up",
            SessionEvent::TransportFailed => "transport_failed",
            SessionEvent::ProtocolConnectStarted => "protocol_connect",
            SessionEvent::ConnAckAccepted => "connack",
            SessionEvent::ConnectRejected => "connect_rejected",
            SessionEvent::ServiceStarted => "service",
            SessionEvent::Fault => "fault",
            SessionEvent::ShutdownRequested => "shutdown",
            SessionEvent::TeardownComplete => "teardown_complete",
        }
    }
}

/// State published to observers on every transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateNotification {
    pub state: SessionState,
    /// Sanitized reason when the transition was caused by a failure
    pub fault: Option<String>,
}

impl StateNotification {
    pub fn initial() -> Self {
        Self {
            state: SessionState::Disconnected,
            fault: None,
        }
    }
}

/// Next state for `event` in `current`, or `None` if the event is not
/// allowed there
pub fn next_state(current: SessionState, event: SessionEvent) -> Option<SessionState> {
    use SessionEvent as E;
    use SessionState as S;

    match (current, event) {
        (S::Disconnected, E::ConnectRequested) => Some(S::TransportConnecting),
        (S::TransportConnecting, E::TransportUp) => Some(S::TransportConnected),
        (S::TransportConnecting | S::TransportConnected, E::TransportFailed) => {
            Some(S::Disconnected)
        }
        (S::TransportConnected, E::ProtocolConnectStarted) => Some(S::ProtocolConnecting),
        (S::ProtocolConnecting, E::ConnAckAccepted) => Some(S::Ready),
        (S::ProtocolConnecting, E::ConnectRejected) => Some(S::Disconnected),
        (S::Ready | S::Servicing, E::ServiceStarted) => Some(S::Servicing),
        (S::Ready | S::Servicing, E::Fault | E::ShutdownRequested) => Some(S::Disconnecting),
        (S::Disconnecting, E::TeardownComplete) => Some(S::Disconnected),
        _ => None,
    }
}

/// Subscribing and publishing need an accepted MQTT session
pub fn can_exchange_messages(state: SessionState) -> bool {
    matches!(state, SessionState::Ready | SessionState::Servicing)
}

/// Log a state transition
pub fn log_state_transition(from: SessionState, to: SessionState, fault: Option<&str>) {
    match (from, to, fault) {
        (_, SessionState::Disconnected, Some(reason)) => {
            error!("Session ended after failure: {}", reason);
        }
        (_, SessionState::Disconnecting, Some(reason)) => {
            warn!("Session fault, tearing down: {}", reason);
        }
        (SessionState::ProtocolConnecting, SessionState::Ready, None) => {
            info!("Session ready");
        }
        (SessionState::Disconnecting, SessionState::Disconnected, None) => {
            info!("Session closed");
        }
        _ => {
            info!("Session state: {:?} -> {:?}", from, to);
        }
    }
}
