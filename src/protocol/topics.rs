//! Device id and topic validation
//!
//! Wildcard semantics and filter syntax are those of the MQTT codec
//! (`rumqttc::mqttbytes`); this module only wraps them with error values
//! the configuration and session layers can report.

use rumqttc::mqttbytes::{has_wildcards, valid_filter, valid_topic};
use thiserror::Error;

/// Largest topic the MQTT string encoding can carry
pub const MAX_TOPIC_LEN: usize = 65_535;

pub fn validate_device_id(device_id: &str) -> Result<(), ValidationError> {
    if device_id.is_empty() {
        return Err(ValidationError::EmptyDeviceId);
    }

    for ch in device_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidDeviceIdChar(ch));
        }
    }

    Ok(())
}

/// A concrete topic a message can be published to
pub fn validate_publish_topic(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(ValidationError::TopicTooLong(topic.len()));
    }
    if has_wildcards(topic) || !valid_topic(topic) {
        return Err(ValidationError::WildcardInTopic(topic.to_string()));
    }
    Ok(())
}

/// A subscription filter, possibly containing `+` and `#`
pub fn validate_filter(filter: &str) -> Result<(), ValidationError> {
    if filter.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }
    if filter.len() > MAX_TOPIC_LEN {
        return Err(ValidationError::TopicTooLong(filter.len()));
    }
    if !valid_filter(filter) {
        return Err(ValidationError::InvalidFilter(filter.to_string()));
    }
    Ok(())
}

/// Validation errors for identities and topics
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Device ID cannot be empty")]
    EmptyDeviceId,
    #[error("Device ID contains invalid character: '{0}'")]
    InvalidDeviceIdChar(char),
    #[error("Topic cannot be empty")]
    EmptyTopic,
    #[error("Topic of {0} bytes exceeds the MQTT limit")]
    TopicTooLong(usize),
    #[error("Publish topic must not contain wildcards: '{0}'")]
    WildcardInTopic(String),
    #[error("Invalid subscription filter: '{0}'")]
    InvalidFilter(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_valid_device_id_format(id in "[a-zA-Z0-9._-]{1,64}") {
            prop_assert!(validate_device_id(&id).is_ok(), "Valid device ID should pass: {}", id);
        }

        #[test]
        fn test_invalid_device_id_chars(id in "[^a-zA-Z0-9._-]{1}[a-zA-Z0-9._-]*") {
            prop_assert!(validate_device_id(&id).is_err(), "Invalid device ID should fail: {}", id);
        }

        #[test]
        fn plain_topics_are_valid_filters(segments in proptest::collection::vec("[a-z0-9]{1,8}", 1..6)) {
            // Property: any wildcard-free topic is also an acceptable filter
            let topic = segments.join("/");
            prop_assert!(validate_publish_topic(&topic).is_ok());
            prop_assert!(validate_filter(&topic).is_ok());
        }

        #[test]
        fn trailing_hash_filter_is_valid(segments in proptest::collection::vec("[a-z0-9]{1,8}", 0..5)) {
            let mut parts = segments.clone();
            parts.push("#".to_string());
            let filter = parts.join("/");
            prop_assert!(validate_filter(&filter).is_ok(), "filter should be valid: {}", filter);
            prop_assert!(validate_publish_topic(&filter).is_err());
        }
    }

    #[test]
    fn test_device_id_examples() {
        assert!(validate_device_id("device-123").is_ok());
        assert!(validate_device_id("sensor_01.kitchen").is_ok());
        assert_eq!(validate_device_id(""), Err(ValidationError::EmptyDeviceId));
        assert_eq!(
            validate_device_id("device/123"),
            Err(ValidationError::InvalidDeviceIdChar('/'))
        );
        assert!(validate_device_id("device 123").is_err());
    }

    #[test]
    fn test_publish_topic_examples() {
        assert!(validate_publish_topic("devices/123/events").is_ok());
        assert!(validate_publish_topic("devices/device-123/messages/events/").is_ok());
        assert_eq!(validate_publish_topic(""), Err(ValidationError::EmptyTopic));
        assert!(validate_publish_topic("devices/+/events").is_err());
        assert!(validate_publish_topic("devices/#").is_err());
    }

    #[test]
    fn test_filter_examples() {
        assert!(validate_filter("devices/123/config").is_ok());
        assert!(validate_filter("devices/+/config").is_ok());
        assert!(validate_filter("devices/device-123/messages/devicebound/#").is_ok());
        assert!(validate_filter("devices/#/config").is_err());
        assert_eq!(validate_filter(""), Err(ValidationError::EmptyTopic));
    }
}
