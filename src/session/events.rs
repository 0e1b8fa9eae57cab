//! Pure event routing and handler dispatch
//!
//! Classifies raw MQTT events into routing decisions, and holds the
//! registries the manager dispatches into: lifecycle handlers and the
//! subscription table. Routing is a pure function of the event so it can
//! be tested without a broker.

use crate::session::connection::qos_from_level;
use crate::topic::filter_matches;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::Event;
use rumqttc::Outgoing;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Session lifecycle notifications delivered to registered handlers
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// Initial connection established
    Connected,
    /// Transport lost while connected; reconnection begins after this
    ConnectionLost { reason: String },
    /// Connection re-established after one or more retries
    Reconnected,
    /// Session closed by an explicit disconnect
    Disconnected,
}

/// An inbound message delivered to a subscription handler
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: u8,
    pub retain: bool,
}

/// Handler invoked for each lifecycle transition
///
/// Handlers run inline on the event loop task and must not block.
pub type LifecycleHandler = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Handler invoked for each message arriving on a subscription
pub type MessageHandler = Arc<dyn Fn(ReceivedMessage) + Send + Sync>;

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Broker acknowledged the connection
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived(ReceivedMessage),
    /// A publish left the client with this packet id
    PublishIssued(u16),
    /// A subscribe left the client with this packet id
    SubscribeIssued(u16),
    /// Broker acknowledged a publish (PUBACK or PUBCOMP)
    PublishAcknowledged(u16),
    /// Broker acknowledged a subscribe
    SubscribeAcknowledged(u16),
    /// Broker initiated a disconnect
    BrokerDisconnect(String),
    /// Keep-alive or other infrastructure traffic
    InfrastructureEvent,
}

/// Classify an MQTT event into a routing decision (pure function)
pub fn route_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(incoming) => {
            use rumqttc::v5::mqttbytes::v5::Packet;
            match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived(ReceivedMessage {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    qos: publish.qos as u8,
                    retain: publish.retain,
                }),
                Packet::PubAck(puback) => EventRoute::PublishAcknowledged(puback.pkid),
                Packet::PubComp(pubcomp) => EventRoute::PublishAcknowledged(pubcomp.pkid),
                Packet::SubAck(suback) => EventRoute::SubscribeAcknowledged(suback.pkid),
                Packet::Disconnect(disconnect) => {
                    EventRoute::BrokerDisconnect(format!("{:?}", disconnect.reason_code))
                }
                _ => EventRoute::InfrastructureEvent,
            }
        }
        Event::Outgoing(Outgoing::Publish(pkid)) => EventRoute::PublishIssued(*pkid),
        Event::Outgoing(Outgoing::Subscribe(pkid)) => EventRoute::SubscribeIssued(*pkid),
        Event::Outgoing(_) => EventRoute::InfrastructureEvent,
    }
}

/// Registry of lifecycle handlers
#[derive(Default)]
pub struct LifecycleRegistry {
    handlers: Vec<LifecycleHandler>,
}

impl LifecycleRegistry {
    pub fn register(&mut self, handler: LifecycleHandler) {
        self.handlers.push(handler);
    }

    /// Invoke every registered handler with the event, in registration order
    pub fn dispatch(&self, event: &LifecycleEvent) {
        debug!(event = ?event, handlers = self.handlers.len(), "Dispatching lifecycle event");
        for handler in &self.handlers {
            handler(event);
        }
    }
}

/// One active subscription: the granted QoS level and its handler
#[derive(Clone)]
pub struct SubscriptionEntry {
    pub qos: u8,
    pub handler: MessageHandler,
}

/// Active subscriptions keyed by topic filter
///
/// Used for inbound dispatch and for replaying subscriptions after a
/// reconnect.
#[derive(Default)]
pub struct SubscriptionTable {
    entries: HashMap<String, SubscriptionEntry>,
}

impl SubscriptionTable {
    /// Record a subscription, replacing any previous handler for the filter
    pub fn insert(&mut self, filter: String, qos: u8, handler: MessageHandler) {
        self.entries.insert(filter, SubscriptionEntry { qos, handler });
    }

    /// Remove a subscription; returns whether the filter was present
    pub fn remove(&mut self, filter: &str) -> bool {
        self.entries.remove(filter).is_some()
    }

    /// Filters and QoS levels to replay after a reconnect
    pub fn replay_set(&self) -> Vec<(String, QoS)> {
        self.entries
            .iter()
            .map(|(filter, entry)| (filter.clone(), qos_from_level(entry.qos)))
            .collect()
    }

    /// Deliver an inbound message to every subscription whose filter matches
    ///
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, message: &ReceivedMessage) -> usize {
        let mut delivered = 0;
        for (filter, entry) in &self.entries {
            if filter_matches(filter, &message.topic) {
                (entry.handler)(message.clone());
                delivered += 1;
            }
        }
        if delivered == 0 {
            debug!(topic = %message.topic, "No subscription matched inbound message");
        }
        delivered
    }
}
