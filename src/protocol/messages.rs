//! Application message types exchanged with the broker
//!
//! `InboundMessage` is what the router hands to the control loop;
//! `OutboundMessage` is what the publish scheduler composes.

use bytes::Bytes;
use rumqttc::{Publish, QoS};

/// A message delivered by the broker
///
/// # Examples
/// ```
/// use iot_session::protocol::InboundMessage;
/// use rumqttc::QoS;
///
/// let message = InboundMessage::new("devices/123/config", "on", QoS::AtMostOnce);
/// assert_eq!(message.payload_str(), Some("on"));
/// assert_eq!(message.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
    pub dup: bool,
    /// Packet identifier, zero for at-most-once deliveries
    pub pkid: u16,
}

impl InboundMessage {
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, payload: P, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retained: false,
            dup: false,
            pkid: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Payload as UTF-8, if it is valid text
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

impl From<Publish> for InboundMessage {
    fn from(publish: Publish) -> Self {
        Self {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retained: publish.retain,
            dup: publish.dup,
            pkid: publish.pkid,
        }
    }
}

/// A message composed for publishing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
    pub dup: bool,
    /// Application level sequence number, strictly increasing per scheduler
    pub id: u64,
}

impl OutboundMessage {
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, payload: P, qos: QoS, id: u64) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retained: false,
            dup: false,
            id,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Wire representation; `pkid` is ignored for at-most-once
    pub fn to_publish(&self, pkid: u16) -> Publish {
        let mut publish = Publish::from_bytes(self.topic.clone(), self.qos, self.payload.clone());
        publish.retain = self.retained;
        publish.dup = self.dup;
        if self.qos != QoS::AtMostOnce {
            publish.pkid = pkid;
        }
        publish
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_from_publish_keeps_flags() {
        let mut publish = Publish::new("devices/123/config", QoS::AtLeastOnce, "on");
        publish.retain = true;
        publish.dup = true;
        publish.pkid = 7;

        let message = InboundMessage::from(publish);
        assert_eq!(message.topic, "devices/123/config");
        assert_eq!(message.payload_str(), Some("on"));
        assert_eq!(message.qos, QoS::AtLeastOnce);
        assert!(message.retained);
        assert!(message.dup);
        assert_eq!(message.pkid, 7);
    }

    #[test]
    fn test_binary_payload_is_not_str() {
        let message = InboundMessage::new("a/b", vec![0xff, 0xfe], QoS::AtMostOnce);
        assert_eq!(message.payload_str(), None);
        assert_eq!(message.len(), 2);
    }

    #[test]
    fn test_outbound_qos0_has_no_pkid() {
        let message = OutboundMessage::new("devices/123/events", "1", QoS::AtMostOnce, 1);
        let publish = message.to_publish(42);
        assert_eq!(publish.pkid, 0);
        assert_eq!(publish.topic, "devices/123/events");
        assert_eq!(&publish.payload[..], b"1");
    }

    #[test]
    fn test_outbound_qos1_uses_pkid() {
        let mut message = OutboundMessage::new("devices/123/events", "2", QoS::AtLeastOnce, 2);
        message.retained = true;
        let publish = message.to_publish(42);
        assert_eq!(publish.pkid, 42);
        assert!(publish.retain);
    }
}
