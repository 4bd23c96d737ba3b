//! Outbound publish scheduling
//!
//! A stimulus (a button interrupt, a signal) only raises an atomic flag
//! through `StimulusHandle::trigger`. The control loop polls the scheduler
//! once per tick; the scheduler composes at most one message, tagged with a
//! monotonically increasing id, into a single pending slot. A newer message
//! composed before the previous one was sent overwrites it.

use crate::protocol::OutboundMessage;
use bytes::Bytes;
use rumqttc::mqttbytes::QoS;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Cloneable trigger safe to use from any thread or signal task
#[derive(Debug, Clone, Default)]
pub struct StimulusHandle {
    pending: Arc<AtomicBool>,
}

impl StimulusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a publish. Repeated triggers before the next poll coalesce.
    pub fn trigger(&self) {
        self.pending.store(true, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}

#[derive(Debug)]
pub struct PublishScheduler {
    topic: Option<String>,
    qos: QoS,
    stimulus: StimulusHandle,
    last_id: u64,
    pending: Option<OutboundMessage>,
    overwritten: u64,
}

impl PublishScheduler {
    /// Scheduler for `topic`. Without a topic, stimuli are consumed and
    /// ignored.
    pub fn new(topic: Option<String>, qos: QoS) -> Self {
        Self {
            topic,
            qos,
            stimulus: StimulusHandle::new(),
            last_id: 0,
            pending: None,
            overwritten: 0,
        }
    }

    /// Replace the stimulus handle with one owned elsewhere
    pub fn with_stimulus(mut self, stimulus: StimulusHandle) -> Self {
        self.stimulus = stimulus;
        self
    }

    pub fn stimulus_handle(&self) -> StimulusHandle {
        self.stimulus.clone()
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// Id of the most recently composed message, zero before the first
    pub fn last_id(&self) -> u64 {
        self.last_id
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Number of composed messages replaced before they were sent
    pub fn overwritten(&self) -> u64 {
        self.overwritten
    }

    /// Compose a message with an explicit payload into the pending slot.
    /// Returns its id, or `None` when no publish topic is configured.
    pub fn schedule<P: Into<Bytes>>(&mut self, payload: P) -> Option<u64> {
        let Some(topic) = self.topic.clone() else {
            warn!("No publish topic configured, dropping scheduled message");
            return None;
        };
        let id = self.next_id();
        self.compose(OutboundMessage::new(topic, payload, self.qos, id));
        Some(id)
    }

    /// Consume a pending stimulus and hand out the message to send this
    /// tick, if any. A stimulus composes a message whose payload is its id
    /// in decimal.
    pub fn poll(&mut self) -> Option<OutboundMessage> {
        if self.stimulus.take() {
            match self.topic.clone() {
                Some(topic) => {
                    let id = self.next_id();
                    debug!(id, "Stimulus observed");
                    self.compose(OutboundMessage::new(topic, id.to_string(), self.qos, id));
                }
                None => warn!("Stimulus ignored, no publish topic configured"),
            }
        }
        self.pending.take()
    }

    /// Drop the pending message without sending it
    pub fn discard_pending(&mut self) -> Option<OutboundMessage> {
        self.pending.take()
    }

    fn compose(&mut self, message: OutboundMessage) {
        if let Some(previous) = self.pending.replace(message) {
            self.overwritten += 1;
            debug!(id = previous.id, "Overwriting unsent message");
        }
    }

    /// Strictly increasing until 2^64 messages, then wraps to zero
    fn next_id(&mut self) -> u64 {
        self.last_id = self.last_id.wrapping_add(1);
        self.last_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> PublishScheduler {
        PublishScheduler::new(Some("devices/123/events".to_string()), QoS::AtMostOnce)
    }

    #[test]
    fn test_poll_without_stimulus_is_empty() {
        let mut scheduler = scheduler();
        assert!(scheduler.poll().is_none());
        assert_eq!(scheduler.last_id(), 0);
    }

    #[test]
    fn test_stimulus_publishes_count() {
        let mut scheduler = scheduler();
        let handle = scheduler.stimulus_handle();

        handle.trigger();
        let first = scheduler.poll().unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(&first.payload[..], b"1");
        assert_eq!(first.topic, "devices/123/events");
        assert_eq!(first.qos, QoS::AtMostOnce);

        handle.trigger();
        let second = scheduler.poll().unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(&second.payload[..], b"2");

        assert!(scheduler.poll().is_none());
    }

    #[test]
    fn test_ids_keep_increasing_past_u32_range() {
        let mut scheduler = scheduler();
        scheduler.last_id = u64::from(u32::MAX) - 1;

        let ids: Vec<u64> = (0..3).filter_map(|_| scheduler.schedule("x")).collect();
        assert_eq!(
            ids,
            vec![
                u64::from(u32::MAX),
                u64::from(u32::MAX) + 1,
                u64::from(u32::MAX) + 2
            ]
        );

        let handle = scheduler.stimulus_handle();
        handle.trigger();
        let message = scheduler.poll().unwrap();
        assert_eq!(message.id, u64::from(u32::MAX) + 3);
        assert_eq!(&message.payload[..], b"4294967298");
    }

    #[test]
    fn test_repeated_triggers_coalesce() {
        let mut scheduler = scheduler();
        let handle = scheduler.stimulus_handle();

        handle.trigger();
        handle.trigger();
        handle.trigger();
        assert!(handle.is_pending());

        assert_eq!(scheduler.poll().unwrap().id, 1);
        assert!(!handle.is_pending());
        assert!(scheduler.poll().is_none());
    }

    #[test]
    fn test_stimulus_overwrites_scheduled_message() {
        let mut scheduler = scheduler();
        assert_eq!(scheduler.schedule("hello"), Some(1));
        scheduler.stimulus_handle().trigger();

        let sent = scheduler.poll().unwrap();
        assert_eq!(sent.id, 2);
        assert_eq!(&sent.payload[..], b"2");
        assert_eq!(scheduler.overwritten(), 1);
    }

    #[test]
    fn test_ids_strictly_increase() {
        let mut scheduler = scheduler();
        let mut last = 0;
        for _ in 0..20 {
            let id = scheduler.schedule("x").unwrap();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_no_topic_ignores_stimulus() {
        let mut scheduler = PublishScheduler::new(None, QoS::AtMostOnce);
        scheduler.stimulus_handle().trigger();
        assert!(scheduler.poll().is_none());
        assert!(scheduler.schedule("x").is_none());
        assert!(!scheduler.stimulus_handle().is_pending());
    }

    #[test]
    fn test_external_stimulus_handle() {
        let handle = StimulusHandle::new();
        let mut scheduler = scheduler().with_stimulus(handle.clone());
        handle.trigger();
        assert_eq!(scheduler.poll().unwrap().id, 1);
    }

    #[test]
    fn test_handle_works_across_threads() {
        let mut scheduler = scheduler();
        let handle = scheduler.stimulus_handle();
        std::thread::spawn(move || handle.trigger()).join().unwrap();
        assert!(scheduler.poll().is_some());
    }
}
