//! Reference in-memory broker.
//!
//! [`InMemoryQueue`] keeps a topic → groups subscription index and one
//! bounded channel per registered consumer group. Sending a message delivers
//! one independent copy to every group subscribed to the message name, with
//! the group header rewritten to the receiving group.
//!
//! Its behavior is the conformance baseline for every other broker adapter:
//! each subscribed group receives its own copy exactly once per successful
//! send, and a send that cannot reach every subscribed group is an explicit
//! routing failure.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::sync::mpsc;

use crate::{TransportMessage, headers::keys, transport::TransportError};

/// Topic → group registry and fan-out.
///
/// Each instance is independent; tests can create as many brokers as they
/// need.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    registry: Mutex<Registry>,
}

#[derive(Debug, Default)]
struct Registry {
    topic_groups: HashMap<String, BTreeSet<String>>,
    clients: HashMap<String, Client>,
    next_registration: u64,
}

#[derive(Debug)]
struct Client {
    registration: RegistrationId,
    sender: mpsc::Sender<TransportMessage>,
}

/// Identifies one client registration of a group.
///
/// Registering again under the same group supersedes the previous
/// registration; [`InMemoryQueue::unregister`] with a superseded id leaves
/// the newer client in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationId(u64);

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the delivery channel of `group`, replacing any previous one.
    ///
    /// `capacity` bounds how many undelivered copies may queue up for the
    /// group before senders wait.
    pub fn register_client(
        &self,
        group: &str,
        capacity: usize,
    ) -> mpsc::Receiver<TransportMessage> {
        self.register(group, capacity).1
    }

    /// Same as [`register_client`](Self::register_client), also returning the
    /// id needed to [`unregister`](Self::unregister) this client only.
    pub fn register(
        &self,
        group: &str,
        capacity: usize,
    ) -> (RegistrationId, mpsc::Receiver<TransportMessage>) {
        let (sender, rx) = mpsc::channel(capacity.max(1));
        let mut registry = self.registry();
        registry.next_registration += 1;
        let registration = RegistrationId(registry.next_registration);
        registry.clients.insert(
            group.to_owned(),
            Client {
                registration,
                sender,
            },
        );
        tracing::debug!(group, registration = registration.0, "Registered in-memory consumer client");
        (registration, rx)
    }

    /// Add `group` to the subscriber set of every topic in `topics`.
    pub fn subscribe<I, T>(&self, group: &str, topics: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut registry = self.registry();
        for topic in topics {
            let topic = topic.into();
            tracing::debug!(group, topic = %topic, "Subscribing group to topic");
            registry
                .topic_groups
                .entry(topic)
                .or_default()
                .insert(group.to_owned());
        }
    }

    /// Remove the client registration of `group`.
    ///
    /// Topic subscriptions are left in place, so a client registering again
    /// under the same group resumes receiving without subscribing again.
    pub fn unsubscribe(&self, group: &str) {
        if self.registry().clients.remove(group).is_some() {
            tracing::debug!(group, "Unregistered in-memory consumer client");
        }
    }

    /// Remove the client registration of `group` if it still is
    /// `registration`. Returns whether it was removed.
    pub fn unregister(&self, group: &str, registration: RegistrationId) -> bool {
        let mut registry = self.registry();
        match registry.clients.get(group) {
            Some(client) if client.registration == registration => {
                registry.clients.remove(group);
                tracing::debug!(group, registration = registration.0, "Unregistered in-memory consumer client");
                true
            }
            _ => false,
        }
    }

    /// Groups subscribed to `topic`, in name order.
    pub fn groups(&self, topic: &str) -> Vec<String> {
        self.registry()
            .topic_groups
            .get(topic)
            .map(|groups| groups.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a client is registered for `group`.
    pub fn has_client(&self, group: &str) -> bool {
        self.registry().clients.contains_key(group)
    }

    /// Deliver one copy of `message` to each group subscribed to its name.
    ///
    /// Fails with a routing error when nobody subscribed to the topic, or
    /// when a subscribed group has no live client. In the latter case no
    /// copy is sent, so a retry reaches every group.
    pub async fn send(&self, message: TransportMessage) -> Result<(), TransportError> {
        let topic = message
            .headers
            .name()
            .ok_or_else(|| TransportError::missing_header(keys::MESSAGE_NAME))?
            .to_owned();

        let targets: Vec<(String, mpsc::Sender<TransportMessage>)> = {
            let registry = self.registry();
            let groups = registry
                .topic_groups
                .get(&topic)
                .ok_or_else(|| TransportError::no_subscriber(topic.clone()))?;

            groups
                .iter()
                .map(|group| match registry.clients.get(group) {
                    Some(client) if !client.sender.is_closed() => {
                        Ok((group.clone(), client.sender.clone()))
                    }
                    _ => {
                        tracing::warn!(
                            topic = %topic,
                            group = %group,
                            "Subscribed group has no live client"
                        );
                        Err(TransportError::no_client(topic.clone(), group.clone()))
                    }
                })
                .collect::<Result<_, _>>()?
        };

        for (group, client) in targets {
            let mut copy = message.clone();
            copy.headers.insert(keys::GROUP, group.as_str());

            if client.send(copy).await.is_err() {
                tracing::warn!(
                    topic = %topic,
                    group = %group,
                    "Consumer client went away before delivery"
                );
                return Err(TransportError::no_client(topic, group));
            }
        }

        Ok(())
    }
}
