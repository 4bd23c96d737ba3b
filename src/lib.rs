//! iot-session - client-side MQTT device session core
//!
//! Connects an embedded-style device to an MQTT broker over TLS,
//! authenticates with a static password or a signed, time-bounded token,
//! subscribes to a command topic, and publishes on demand, all from one
//! bounded control loop.
//!
//! # Layers
//!
//! - `transport`: TLS byte stream over an already initialized network
//! - `auth`: static and signed-token credential providers, trusted clock
//! - `protocol`: MQTT 3.1.1 client on top of a transport
//! - `session`: state machine, single-slot inbound router, publish
//!   scheduler and the controller
//! - `config`, `backend`, `runner`: TOML configuration, per-cloud identity
//!   policy and reconnect supervision
//!
//! # Quick Start
//!
//! ```no_run
//! use iot_session::auth::{StaticCredentials, SystemClock};
//! use iot_session::session::{Session, SessionConfig};
//! use iot_session::transport::{HostNetwork, TlsTransport};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = SessionConfig {
//!     host: "broker.example.com".to_string(),
//!     publish_topic: Some("devices/123/events".to_string()),
//!     ..SessionConfig::default()
//! };
//! let mut session = Session::new(
//!     TlsTransport::new(),
//!     Arc::new(HostNetwork::new()),
//!     Arc::new(StaticCredentials::new("123", "123", "password")),
//!     Arc::new(SystemClock::new()),
//!     config,
//! );
//!
//! session.connect().await?;
//! session.subscribe("devices/123/config", |_| {}).await?;
//! session.stimulus_handle().trigger();
//! let outcome = session.tick().await?;
//! if outcome.message_arrived {
//!     let message = session.take_message();
//!     println!("{message:?}");
//! }
//! session.disconnect().await;
//! # Ok::<(), iot_session::SessionError>(())
//! # }).unwrap();
//! ```

pub mod auth;
pub mod backend;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod runner;
pub mod session;
pub mod testing;
pub mod transport;

pub use backend::Backend;
pub use config::{ConfigError, DeviceConfig};
pub use error::{SessionError, SessionResult};
pub use session::{Session, SessionConfig, SessionState};
