//! Configuration loading and validation tests
//!
//! Tests focus on behavior of loading, validation and the values handed to
//! the session, not on TOML parsing details.

use iot_session::auth::TokenAlgorithm;
use iot_session::config::{CredentialsSection, DeviceConfig};
use iot_session::testing::ManualClock;
use iot_session::transport::PemSource;
use iot_session::{Backend, ConfigError};
use rumqttc::mqttbytes::QoS;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

const RSA_KEY: &[u8] = include_bytes!("fixtures/device_rsa.pem");

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_static_config_loads_with_defaults() {
    let file = write_config(
        r#"
[server]
host = "broker.example.com"

[identity]
device_id = "device-123"

[credentials]
mode = "static"
password = "hunter2"

[topics]
publish = "devices/device-123/events"
subscribe = "devices/device-123/config"
"#,
    );

    let config = DeviceConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.server.port, 8883);
    assert_eq!(config.server.backend, Backend::Generic);
    assert_eq!(config.client_id().unwrap(), "device-123");
    assert_eq!(config.username().unwrap(), "device-123");
    assert_eq!(config.get_password().unwrap(), Some("hunter2".to_string()));
    assert!(config.trust_config().is_none());

    let session = config.session_config().unwrap();
    assert_eq!(session.host, "broker.example.com");
    assert_eq!(session.keep_alive, Duration::from_secs(60));
    assert_eq!(session.tick, Duration::from_millis(100));
    assert_eq!(session.ack_timeout, Duration::from_millis(5000));
    assert_eq!(session.max_payload_bytes, 1024);
    assert_eq!(session.max_subscriptions, 4);
    assert_eq!(session.qos, QoS::AtMostOnce);
    assert_eq!(
        session.publish_topic.as_deref(),
        Some("devices/device-123/events")
    );
}

#[test]
fn test_static_provider_issues_configured_password() {
    let config = DeviceConfig::from_toml_str(
        r#"
[server]
host = "broker.example.com"

[identity]
device_id = "device-123"

[credentials]
mode = "static"
password = "hunter2"
"#,
    )
    .unwrap();

    let provider = config.credential_provider().unwrap();
    let credential = provider.issue(&ManualClock::unsynchronized()).unwrap();
    assert_eq!(provider.kind(), "static");
    assert_eq!(credential.secret(), "hunter2");
    assert_eq!(credential.client_id(), "device-123");
}

#[test]
fn test_missing_password_env_is_reported() {
    let config = DeviceConfig::from_toml_str(
        r#"
[server]
host = "broker.example.com"

[identity]
device_id = "device-123"

[credentials]
mode = "static"
password_env = "IOT_SESSION_TEST_PASSWORD_THAT_IS_NOT_SET"
"#,
    )
    .unwrap();

    match config.credential_provider() {
        Err(ConfigError::EnvVarNotFound(name)) => {
            assert_eq!(name, "IOT_SESSION_TEST_PASSWORD_THAT_IS_NOT_SET")
        }
        Err(other) => panic!("expected EnvVarNotFound, got {other:?}"),
        Ok(_) => panic!("expected EnvVarNotFound"),
    }
}

#[test]
fn test_google_token_config() {
    let mut key_file = NamedTempFile::new().unwrap();
    key_file.write_all(RSA_KEY).unwrap();

    let config = DeviceConfig::from_toml_str(&format!(
        r#"
[server]
host = "mqtt.googleapis.com"
backend = "google"

[identity]
device_id = "dev1"
project = "proj-1"
region = "us-central1"
registry = "reg"

[credentials]
mode = "token"
private_key_file = "{}"
lifetime_secs = 3600
renew_margin_secs = 120
"#,
        key_file.path().display()
    ))
    .unwrap();

    assert_eq!(
        config.client_id().unwrap(),
        "projects/proj-1/locations/us-central1/registries/reg/devices/dev1"
    );
    assert_eq!(config.username().unwrap(), "unused");
    assert_eq!(
        config.publish_topic().unwrap().as_deref(),
        Some("/devices/dev1/events")
    );
    assert_eq!(
        config.subscribe_filter().unwrap().as_deref(),
        Some("/devices/dev1/config")
    );
    assert_eq!(config.renew_margin(), chrono::Duration::seconds(120));
    assert!(matches!(
        config.credentials,
        CredentialsSection::Token {
            algorithm: TokenAlgorithm::Rs256,
            ..
        }
    ));

    let provider = config.credential_provider().unwrap();
    let credential = provider.issue(&ManualClock::at(1_700_000_000)).unwrap();
    assert_eq!(provider.kind(), "signed-token");
    assert_eq!(
        credential.expires_at().unwrap().timestamp(),
        1_700_000_000 + 3600
    );
}

#[test]
fn test_google_backend_requires_project() {
    let result = DeviceConfig::from_toml_str(
        r#"
[server]
host = "mqtt.googleapis.com"
backend = "google"

[identity]
device_id = "dev1"

[credentials]
mode = "token"
private_key_file = "/nonexistent/key.pem"
"#,
    );

    match result {
        Err(ConfigError::InvalidConfig(message)) => assert!(message.contains("identity.project")),
        other => panic!("expected InvalidConfig, got {other:?}"),
    }
}

#[test]
fn test_oversized_token_lifetime_rejected_at_load() {
    for lifetime_secs in ["1000000000000000", "100000000000000000"] {
        let result = DeviceConfig::from_toml_str(&format!(
            r#"
[server]
host = "broker.example.com"

[identity]
device_id = "dev1"

[credentials]
mode = "token"
private_key_file = "/etc/iot/device.pem"
lifetime_secs = {lifetime_secs}
"#
        ));
        match result {
            Err(ConfigError::InvalidConfig(message)) => {
                assert!(message.contains("credentials.lifetime_secs"))
            }
            other => panic!("lifetime {lifetime_secs} should be rejected, got {other:?}"),
        }
    }
}

#[test]
fn test_missing_key_file_fails_provider() {
    let config = DeviceConfig::from_toml_str(
        r#"
[server]
host = "broker.example.com"

[identity]
device_id = "dev1"

[credentials]
mode = "token"
private_key_file = "/nonexistent/key.pem"
"#,
    )
    .unwrap();

    assert!(matches!(
        config.credential_provider(),
        Err(ConfigError::Credential(_))
    ));
}

#[test]
fn test_tls_section_maps_to_trust_config() {
    let config = DeviceConfig::from_toml_str(
        r#"
[server]
host = "broker.example.com"
port = 8884

[identity]
device_id = "device-123"

[credentials]
mode = "static"
password = "pw"

[tls]
root_ca_file = "/etc/iot/ca.pem"
"#,
    )
    .unwrap();

    let trust = config.trust_config().unwrap();
    assert_eq!(
        trust.root_ca,
        Some(PemSource::File("/etc/iot/ca.pem".into()))
    );
    assert!(trust.client_cert.is_none());
    assert_eq!(config.session_config().unwrap().port, 8884);
}

#[test]
fn test_invalid_values_rejected() {
    let base = |extra: &str| {
        format!(
            r#"
[server]
host = "broker.example.com"

[identity]
device_id = "device-123"

[credentials]
mode = "static"
password = "pw"
{extra}
"#
        )
    };

    let cases = [
        "[session]\nqos = 2",
        "[session]\ntick_ms = 0",
        "[session]\nkeep_alive_secs = 70000",
        "[session]\nmax_subscriptions = 0",
        "[topics]\npublish = \"devices/+/events\"",
        "[topics]\nsubscribe = \"devices/#/config\"",
        "[tls]\nclient_cert_file = \"/etc/iot/cert.pem\"",
    ];
    for extra in cases {
        let result = DeviceConfig::from_toml_str(&base(extra));
        assert!(
            matches!(result, Err(ConfigError::InvalidConfig(_))),
            "{extra} should be rejected, got {result:?}"
        );
    }
}

#[test]
fn test_invalid_device_id_rejected() {
    let result = DeviceConfig::from_toml_str(
        r#"
[server]
host = "broker.example.com"

[identity]
device_id = "device/123"

[credentials]
mode = "static"
password = "pw"
"#,
    );
    assert!(matches!(result, Err(ConfigError::InvalidDeviceId(_))));
}

#[test]
fn test_malformed_toml_and_missing_file() {
    assert!(matches!(
        DeviceConfig::from_toml_str("[server\nhost ="),
        Err(ConfigError::TomlParse(_))
    ));
    assert!(matches!(
        DeviceConfig::load_from_file(std::path::Path::new("/nonexistent/device.toml")),
        Err(ConfigError::FileRead(_))
    ));
}

#[test]
fn test_redacted_toml_masks_password() {
    let config = DeviceConfig::from_toml_str(
        r#"
[server]
host = "broker.example.com"

[identity]
device_id = "device-123"

[credentials]
mode = "static"
password = "hunter2"
"#,
    )
    .unwrap();

    let shown = config.redacted_toml().unwrap();
    assert!(!shown.contains("hunter2"));
    assert!(shown.contains("***"));
    assert!(shown.contains("broker.example.com"));
}
