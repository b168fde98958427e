use std::{collections::HashMap, fmt, sync::Arc};

use shared::frame::Frame;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMessage {
    pub topic: String,
    pub body: String,
}

/// Invoked on the connection task; must not block.
pub type TopicHandler = Arc<dyn Fn(TopicMessage) + Send + Sync>;

struct Registration {
    id: String,
    handler: TopicHandler,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    by_topic: HashMap<String, Registration>,
    next_id: u64,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("topics", &self.topics())
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the SUBSCRIBE frame for a new topic, `None` if it was
    /// already registered (the existing handler is kept).
    pub fn register(&mut self, topic: &str, handler: TopicHandler) -> Option<Frame> {
        if self.by_topic.contains_key(topic) {
            debug!(topic, "subscriptions: already registered");
            return None;
        }
        let id = format!("sub-{}", self.next_id);
        self.next_id += 1;
        let frame = Frame::subscribe(&id, topic);
        self.by_topic
            .insert(topic.to_string(), Registration { id, handler });
        Some(frame)
    }

    /// Returns the UNSUBSCRIBE frame when `topic` was registered.
    pub fn remove(&mut self, topic: &str) -> Option<Frame> {
        self.by_topic
            .remove(topic)
            .map(|registration| Frame::unsubscribe(&registration.id))
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.by_topic.contains_key(topic)
    }

    pub fn len(&self) -> usize {
        self.by_topic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_topic.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_topic.clear();
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.by_topic.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// One SUBSCRIBE per registered topic, reusing the original ids.
    pub fn resubscribe_frames(&self) -> Vec<Frame> {
        let mut entries: Vec<_> = self.by_topic.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
            .into_iter()
            .map(|(topic, registration)| Frame::subscribe(&registration.id, topic))
            .collect()
    }

    /// Hands a MESSAGE frame to its handler. Routing uses the `destination`
    /// header and falls back to the `subscription` id.
    pub fn dispatch(&self, frame: &Frame) -> bool {
        let by_destination = frame
            .get("destination")
            .and_then(|destination| self.by_topic.get_key_value(destination));
        let by_subscription = || {
            let id = frame.get("subscription")?;
            self.by_topic
                .iter()
                .find(|(_, registration)| registration.id == id)
        };
        let Some((topic, registration)) = by_destination.or_else(by_subscription) else {
            return false;
        };
        (registration.handler)(TopicMessage {
            topic: topic.clone(),
            body: frame.body.clone(),
        });
        true
    }
}

#[cfg(test)]
#[path = "tests/subscriptions_tests.rs"]
mod tests;
