//! Topic subscriber store backing the client pub/sub calls.
//!
//! Topics are keys: the node responsible for the topic's ring position owns
//! its subscriber list. Subscribe is idempotent; unsubscribing an absent
//! url reports not-found. Fan-out delivery beyond the owning node (HTTP
//! POSTs to subscriber urls) belongs to the web facade and is out of scope;
//! the owner hands published content to its local subscriber list.

use std::collections::HashMap;

/// Outcome of an unsubscribe call.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) enum UnsubOutcome {
    Removed,
    NotFound,
}

/// Subscriber lists of the topics this node owns.
#[derive(Debug, Default)]
pub(crate) struct PubSubStore {
    topics: HashMap<String, Vec<String>>,
}

impl PubSubStore {
    pub(crate) fn new() -> Self {
        PubSubStore {
            topics: HashMap::new(),
        }
    }

    /// Subscribes a url to a topic. Repeated subscriptions of the same url
    /// are collapsed into one.
    pub(crate) fn subscribe(&mut self, topic: &str, url: &str) {
        let urls = self.topics.entry(topic.into()).or_default();
        if !urls.iter().any(|u| u == url) {
            urls.push(url.into());
        }
    }

    /// Unsubscribes a url from a topic.
    pub(crate) fn unsubscribe(
        &mut self,
        topic: &str,
        url: &str,
    ) -> UnsubOutcome {
        let Some(urls) = self.topics.get_mut(topic) else {
            return UnsubOutcome::NotFound;
        };
        let Some(pos) = urls.iter().position(|u| u == url) else {
            return UnsubOutcome::NotFound;
        };
        urls.remove(pos);
        if urls.is_empty() {
            self.topics.remove(topic);
        }
        UnsubOutcome::Removed
    }

    /// Current subscribers of a topic, in subscription order.
    pub(crate) fn subscribers(&self, topic: &str) -> Vec<String> {
        self.topics.get(topic).cloned().unwrap_or_default()
    }

    /// Hands published content to the topic's subscribers. Returns the
    /// subscriber urls the content is due for.
    pub(crate) fn publish(&self, topic: &str, content: &str) -> Vec<String> {
        let urls = self.subscribers(topic);
        for url in &urls {
            pf_debug!(
                "delivering publish on '{}' to '{}': {} bytes",
                topic,
                url,
                content.len()
            );
        }
        urls
    }
}

#[cfg(test)]
mod pubsub_tests {
    use super::*;

    #[test]
    fn subscribe_idempotent() {
        let mut store = PubSubStore::new();
        store.subscribe("T", "http://a");
        store.subscribe("T", "http://a");
        store.subscribe("T", "http://b");
        assert_eq!(
            store.subscribers("T"),
            vec!["http://a".to_string(), "http://b".to_string()]
        );
    }

    #[test]
    fn unsubscribe_twice() {
        let mut store = PubSubStore::new();
        store.subscribe("T", "http://a");
        assert_eq!(store.unsubscribe("T", "http://a"), UnsubOutcome::Removed);
        assert_eq!(store.unsubscribe("T", "http://a"), UnsubOutcome::NotFound);
        assert_eq!(store.unsubscribe("U", "http://a"), UnsubOutcome::NotFound);
    }

    #[test]
    fn subscribe_unsubscribe_listing() {
        let mut store = PubSubStore::new();
        store.subscribe("T", "http://a");
        store.subscribe("T", "http://b");
        store.unsubscribe("T", "http://a");
        assert_eq!(store.subscribers("T"), vec!["http://b".to_string()]);
    }

    #[test]
    fn publish_reaches_subscribers() {
        let mut store = PubSubStore::new();
        assert!(store.publish("T", "nothing").is_empty());
        store.subscribe("T", "http://a");
        store.subscribe("T", "http://b");
        assert_eq!(store.publish("T", "hello").len(), 2);
    }
}
