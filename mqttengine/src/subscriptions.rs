use bytes::Bytes;

use crate::mqttbytes::{matches, Filter, Properties, Publish, QoS};

use std::collections::HashMap;
use std::sync::Arc;

/// Application message handed to subscription handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub properties: Properties,
}

impl From<&Publish> for Message {
    fn from(publish: &Publish) -> Message {
        Message {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retain: publish.retain,
            dup: publish.dup,
            properties: publish.properties.clone(),
        }
    }
}

/// Receives messages on the topics it was subscribed with. Handlers run on
/// the eventloop and should return quickly
pub trait Handler: Send + Sync {
    fn handle(&self, message: &Message);
}

impl<F> Handler for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn handle(&self, message: &Message) {
        self(message)
    }
}

struct Subscription {
    qos: QoS,
    handler: Arc<dyn Handler>,
}

/// Topic filter to handler mapping
#[derive(Default)]
pub struct SubscriptionTable {
    entries: HashMap<String, Subscription>,
}

impl SubscriptionTable {
    pub fn new() -> SubscriptionTable {
        SubscriptionTable::default()
    }

    /// Registers `handler` for `filter`. An existing entry for the same
    /// filter is replaced
    pub fn insert(&mut self, filter: &Filter, handler: Arc<dyn Handler>) {
        let subscription = Subscription {
            qos: filter.qos,
            handler,
        };

        if self.entries.insert(filter.path.clone(), subscription).is_some() {
            debug!("Replaced handler of {}", filter.path);
        }
    }

    pub fn remove(&mut self, filter: &str) -> bool {
        self.entries.remove(filter).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every registered filter, to subscribe again after a reconnection
    pub fn filters(&self) -> Vec<Filter> {
        let mut filters: Vec<Filter> = self
            .entries
            .iter()
            .map(|(path, subscription)| Filter::new(path.clone(), subscription.qos))
            .collect();

        filters.sort_by(|a, b| a.path.cmp(&b.path));
        filters
    }

    /// Hands `publish` to every handler with a matching filter. A handler
    /// registered under several matching filters runs once. Returns the
    /// number of handlers invoked
    pub fn dispatch(&self, publish: &Publish) -> usize {
        let mut handlers: Vec<&Arc<dyn Handler>> = Vec::new();
        for (filter, subscription) in self.entries.iter() {
            if !matches(&publish.topic, filter) {
                continue;
            }

            if !handlers.iter().any(|h| Arc::ptr_eq(*h, &subscription.handler)) {
                handlers.push(&subscription.handler);
            }
        }

        if handlers.is_empty() {
            trace!("No subscription for {}", publish.topic);
            return 0;
        }

        let message = Message::from(publish);
        for handler in handlers.iter() {
            handler.handle(&message);
        }

        handlers.len()
    }
}
