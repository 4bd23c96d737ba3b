//! Device session: state machine, inbound routing, outbound scheduling and
//! the controller tying them to a transport

pub mod controller;
pub mod indicator;
pub mod router;
pub mod scheduler;
pub mod state;

pub use controller::{Session, SessionConfig, SessionStats, TeardownReport, TickOutcome};
pub use indicator::{drive_indicator, IndicatorState, LogIndicator, StatusIndicator};
pub use router::{ArrivalFlag, MessageHandler, MessageRouter, RouterStats, MAX_SUBSCRIPTIONS};
pub use scheduler::{PublishScheduler, StimulusHandle};
pub use state::{next_state, SessionEvent, SessionState, StateNotification};
