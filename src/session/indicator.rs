//! Device status indicator driven by session state notifications

use super::state::{SessionState, StateNotification};
use tokio::sync::watch;
use tracing::{error, info};

/// Coarse status shown to an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorState {
    Initializing,
    Active,
    Faulted,
}

impl IndicatorState {
    pub fn from_notification(notification: &StateNotification) -> Self {
        match (notification.state, &notification.fault) {
            (SessionState::Ready | SessionState::Servicing, _) => IndicatorState::Active,
            (_, Some(_)) => IndicatorState::Faulted,
            _ => IndicatorState::Initializing,
        }
    }
}

/// Something that can display an `IndicatorState`, such as an LED
pub trait StatusIndicator: Send {
    fn show(&mut self, state: IndicatorState);
}

/// Indicator that writes changes to the log
#[derive(Debug, Default)]
pub struct LogIndicator {
    current: Option<IndicatorState>,
}

impl LogIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<IndicatorState> {
        self.current
    }
}

impl StatusIndicator for LogIndicator {
    fn show(&mut self, state: IndicatorState) {
        if self.current == Some(state) {
            return;
        }
        self.current = Some(state);
        match state {
            IndicatorState::Faulted => error!(indicator = ?state, "Status indicator"),
            _ => info!(indicator = ?state, "Status indicator"),
        }
    }
}

/// Follow session notifications until the sender is dropped
pub async fn drive_indicator<I: StatusIndicator>(
    mut notifications: watch::Receiver<StateNotification>,
    mut indicator: I,
) -> I {
    loop {
        let state = IndicatorState::from_notification(&notifications.borrow_and_update());
        indicator.show(state);
        if notifications.changed().await.is_err() {
            return indicator;
        }
    }
}
