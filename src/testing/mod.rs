//! Test support: in-memory broker, transport, network and clock

pub mod mocks;

pub use mocks::{ManualClock, MockBroker, MockNetwork, MockTransport};
