//! Topic filter to handler routing with a single-slot inbound buffer
//!
//! Delivery runs inside the protocol read path, so handlers must be quick
//! and must not block. The payload is copied into one reusable buffer and
//! an arrival flag is raised; the control loop takes the message later.
//!
//! The slot is lossy by contract: a second delivery before the control loop
//! takes the first overwrites it. Payloads larger than the slot capacity
//! are dropped whole.

use crate::error::{SessionError, SessionResult};
use crate::protocol::{DeliverySink, InboundMessage};
use bytes::BytesMut;
use rumqttc::mqttbytes::{matches, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default bound on concurrently registered filters
pub const MAX_SUBSCRIPTIONS: usize = 4;

/// Lightweight callback invoked on delivery
pub type MessageHandler = Box<dyn FnMut(&InboundMessage) + Send>;

struct Route {
    filter: String,
    qos: QoS,
    handler: MessageHandler,
}

/// Read-only view of the arrival flag for other contexts
#[derive(Debug, Clone)]
pub struct ArrivalFlag(Arc<AtomicBool>);

impl ArrivalFlag {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub delivered: u64,
    pub overwritten: u64,
    pub unmatched: u64,
    pub oversized: u64,
}

pub struct MessageRouter {
    routes: Vec<Route>,
    max_routes: usize,
    capacity: usize,
    topic: String,
    payload: BytesMut,
    qos: QoS,
    retained: bool,
    dup: bool,
    pkid: u16,
    arrived: Arc<AtomicBool>,
    stats: RouterStats,
}

impl MessageRouter {
    /// Router holding at most `max_routes` filters and payloads up to
    /// `capacity` bytes
    pub fn new(max_routes: usize, capacity: usize) -> Self {
        Self {
            routes: Vec::with_capacity(max_routes),
            max_routes,
            capacity,
            topic: String::new(),
            payload: BytesMut::with_capacity(capacity),
            qos: QoS::AtMostOnce,
            retained: false,
            dup: false,
            pkid: 0,
            arrived: Arc::new(AtomicBool::new(false)),
            stats: RouterStats::default(),
        }
    }

    /// Register a handler. Registering an existing filter replaces its
    /// handler without using another slot.
    pub fn register(
        &mut self,
        filter: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> SessionResult<()> {
        if let Some(route) = self.routes.iter_mut().find(|r| r.filter == filter) {
            route.qos = qos;
            route.handler = handler;
            return Ok(());
        }
        if self.routes.len() >= self.max_routes {
            return Err(SessionError::SubscriptionLimit {
                max: self.max_routes,
            });
        }
        self.routes.push(Route {
            filter: filter.to_string(),
            qos,
            handler,
        });
        Ok(())
    }

    /// Remove a filter, returning whether it was registered
    pub fn remove(&mut self, filter: &str) -> bool {
        let before = self.routes.len();
        self.routes.retain(|r| r.filter != filter);
        self.routes.len() != before
    }

    /// Registered filters with their requested QoS
    pub fn filters(&self) -> Vec<(String, QoS)> {
        self.routes
            .iter()
            .map(|r| (r.filter.clone(), r.qos))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn has_message(&self) -> bool {
        self.arrived.load(Ordering::Acquire)
    }

    pub fn arrival_flag(&self) -> ArrivalFlag {
        ArrivalFlag(self.arrived.clone())
    }

    /// Take the buffered message and clear the arrival flag
    pub fn take(&mut self) -> Option<InboundMessage> {
        if !self.arrived.swap(false, Ordering::AcqRel) {
            return None;
        }
        Some(InboundMessage {
            topic: std::mem::take(&mut self.topic),
            payload: self.payload.split().freeze(),
            qos: self.qos,
            retained: self.retained,
            dup: self.dup,
            pkid: self.pkid,
        })
    }

    /// Drop any unconsumed message
    pub fn clear_pending(&mut self) {
        self.arrived.store(false, Ordering::Release);
        self.topic.clear();
        self.payload.clear();
    }

    /// Drop every registration and any unconsumed message
    pub fn clear(&mut self) {
        self.routes.clear();
        self.clear_pending();
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }
}

impl DeliverySink for MessageRouter {
    fn deliver(&mut self, message: &InboundMessage) {
        let Some(route) = self
            .routes
            .iter_mut()
            .find(|r| matches(&message.topic, &r.filter))
        else {
            self.stats.unmatched += 1;
            debug!(topic = %message.topic, "No subscription matches topic");
            return;
        };

        if message.len() > self.capacity {
            self.stats.oversized += 1;
            warn!(
                topic = %message.topic,
                len = message.len(),
                capacity = self.capacity,
                "Dropping payload larger than inbound buffer"
            );
            return;
        }

        (route.handler)(message);

        if self.arrived.load(Ordering::Acquire) {
            self.stats.overwritten += 1;
            debug!(topic = %self.topic, "Overwriting unconsumed message");
        }

        self.topic.clear();
        self.topic.push_str(&message.topic);
        self.payload.clear();
        self.payload.reserve(message.len());
        self.payload.extend_from_slice(&message.payload);
        self.qos = message.qos;
        self.retained = message.retained;
        self.dup = message.dup;
        self.pkid = message.pkid;
        self.stats.delivered += 1;
        self.arrived.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("filters", &self.filters())
            .field("capacity", &self.capacity)
            .field("arrived", &self.has_message())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn noop() -> MessageHandler {
        Box::new(|_| {})
    }

    fn msg(topic: &str, payload: &str) -> InboundMessage {
        InboundMessage::new(topic, payload.to_string(), QoS::AtMostOnce)
    }

    #[test]
    fn test_delivery_sets_flag_and_take_clears_it() {
        let mut router = MessageRouter::new(MAX_SUBSCRIPTIONS, 64);
        router.register("devices/123/config", QoS::AtMostOnce, noop()).unwrap();

        router.deliver(&msg("devices/123/config", "on"));
        assert!(router.has_message());

        let taken = router.take().unwrap();
        assert_eq!(taken.topic, "devices/123/config");
        assert_eq!(taken.payload_str(), Some("on"));
        assert!(!router.has_message());
        assert!(router.take().is_none());
    }

    #[test]
    fn test_second_delivery_overwrites_first() {
        let mut router = MessageRouter::new(MAX_SUBSCRIPTIONS, 64);
        router.register("devices/+/config", QoS::AtMostOnce, noop()).unwrap();

        router.deliver(&msg("devices/123/config", "M1"));
        router.deliver(&msg("devices/123/config", "M2"));

        let taken = router.take().unwrap();
        assert_eq!(taken.payload_str(), Some("M2"));
        assert!(router.take().is_none());
        assert_eq!(router.stats().overwritten, 1);
    }

    #[test]
    fn test_unmatched_topic_dropped() {
        let mut router = MessageRouter::new(MAX_SUBSCRIPTIONS, 64);
        router.register("devices/123/config", QoS::AtMostOnce, noop()).unwrap();

        router.deliver(&msg("devices/456/config", "on"));
        assert!(!router.has_message());
        assert_eq!(router.stats().unmatched, 1);
    }

    #[test]
    fn test_oversized_payload_dropped_whole() {
        let mut router = MessageRouter::new(MAX_SUBSCRIPTIONS, 4);
        router.register("a/#", QoS::AtMostOnce, noop()).unwrap();

        router.deliver(&msg("a/b", "12345"));
        assert!(!router.has_message());
        assert_eq!(router.stats().oversized, 1);

        router.deliver(&msg("a/b", "1234"));
        assert_eq!(router.take().unwrap().payload_str(), Some("1234"));
    }

    #[test]
    fn test_handler_invoked_for_matching_route() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut router = MessageRouter::new(MAX_SUBSCRIPTIONS, 64);
        router
            .register(
                "devices/123/#",
                QoS::AtMostOnce,
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        router.deliver(&msg("devices/123/config", "on"));
        router.deliver(&msg("devices/123/state", "off"));
        router.deliver(&msg("other/topic", "x"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_subscription_limit() {
        let mut router = MessageRouter::new(2, 64);
        router.register("a", QoS::AtMostOnce, noop()).unwrap();
        router.register("b", QoS::AtMostOnce, noop()).unwrap();
        let err = router.register("c", QoS::AtMostOnce, noop()).unwrap_err();
        assert!(matches!(err, SessionError::SubscriptionLimit { max: 2 }));

        // Re-registering an existing filter does not need a new slot
        router.register("a", QoS::AtLeastOnce, noop()).unwrap();
        assert_eq!(router.len(), 2);
        assert_eq!(router.filters()[0], ("a".to_string(), QoS::AtLeastOnce));
    }

    #[test]
    fn test_buffer_reused_after_take() {
        let mut router = MessageRouter::new(MAX_SUBSCRIPTIONS, 64);
        router.register("a/b", QoS::AtMostOnce, noop()).unwrap();

        for i in 0..10 {
            router.deliver(&msg("a/b", &i.to_string()));
            let taken = router.take().unwrap();
            assert_eq!(taken.payload_str(), Some(i.to_string().as_str()));
        }
        assert_eq!(router.stats().delivered, 10);
    }

    #[test]
    fn test_arrival_flag_view() {
        let mut router = MessageRouter::new(MAX_SUBSCRIPTIONS, 64);
        router.register("a/b", QoS::AtMostOnce, noop()).unwrap();
        let flag = router.arrival_flag();

        assert!(!flag.is_set());
        router.deliver(&msg("a/b", "x"));
        assert!(flag.is_set());
        router.take();
        assert!(!flag.is_set());
    }

    #[test]
    fn test_clear_drops_routes_and_pending() {
        let mut router = MessageRouter::new(MAX_SUBSCRIPTIONS, 64);
        router.register("a/b", QoS::AtMostOnce, noop()).unwrap();
        router.deliver(&msg("a/b", "x"));

        router.clear();
        assert!(router.is_empty());
        assert!(!router.has_message());
    }
}
