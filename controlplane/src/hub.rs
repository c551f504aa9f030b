//! Change broadcast hub.
//!
//! One coordinator task owns the client set and multiplexes register,
//! unregister and broadcast commands; each connected observer gets a
//! bounded outbound queue. A full queue drops the message for that client
//! only, so producers never block on a slow observer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Outbound queue capacity per client.
pub const CLIENT_QUEUE_CAPACITY: usize = 256;
const COMMAND_QUEUE_CAPACITY: usize = 1024;

pub mod message_type {
    pub const TASK_UPDATE: &str = "task_update";
    pub const LOG_ENTRY: &str = "log_entry";
    pub const METRIC_UPDATE: &str = "metric_update";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionFilter {
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub resource_types: Vec<String>,
    #[serde(default)]
    pub resource_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub timestamp: i64,
}

/// What observers send us. Unknown `type` values are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub filters: Option<Vec<SubscriptionFilter>>,
}

enum HubCommand {
    Register {
        id: u64,
        sender: async_channel::Sender<ServerMessage>,
    },
    Unregister {
        id: u64,
    },
    Inbound {
        id: u64,
        message: ClientMessage,
    },
    /// Fan-out with per-client filter evaluation.
    Broadcast {
        message: ServerMessage,
    },
    /// Delivery restricted to matching subscriptions.
    Targeted {
        message: ServerMessage,
    },
}

#[derive(Clone)]
pub struct Hub {
    commands: async_channel::Sender<HubCommand>,
    allowed_origins: Arc<Vec<String>>,
    next_id: Arc<AtomicU64>,
}

struct ClientEntry {
    sender: async_channel::Sender<ServerMessage>,
    subscriptions: HashSet<(String, String)>,
    filters: Vec<SubscriptionFilter>,
}

impl Hub {
    pub fn new(allowed_origins: Vec<String>) -> Self {
        let (commands, rx) = async_channel::bounded(COMMAND_QUEUE_CAPACITY);
        tokio::spawn(coordinator(rx));
        Hub {
            commands,
            allowed_origins: Arc::new(allowed_origins),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Origin policy: an absent header is treated as same-origin; an empty
    /// allow-list accepts everything.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            None | Some("") => true,
            Some(origin) => {
                self.allowed_origins.is_empty()
                    || self.allowed_origins.iter().any(|o| o == origin)
            }
        }
    }

    /// Register a new observer; returns its id and outbound queue.
    pub async fn connect(&self) -> (u64, async_channel::Receiver<ServerMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = async_channel::bounded(CLIENT_QUEUE_CAPACITY);
        let _ = self
            .commands
            .send(HubCommand::Register { id, sender })
            .await;
        (id, receiver)
    }

    pub async fn disconnect(&self, id: u64) {
        let _ = self.commands.send(HubCommand::Unregister { id }).await;
    }

    pub async fn handle_client_message(&self, id: u64, message: ClientMessage) {
        let _ = self.commands.send(HubCommand::Inbound { id, message }).await;
    }

    fn make_message(
        kind: &str,
        resource_type: Option<&str>,
        resource_id: Option<&str>,
        payload: serde_json::Value,
    ) -> ServerMessage {
        ServerMessage {
            kind: kind.to_string(),
            id: None,
            resource_type: resource_type.map(str::to_string),
            resource_id: resource_id.map(str::to_string),
            payload: Some(payload),
            timestamp: kecs_common::now_ms(),
        }
    }

    /// Filtered fan-out. Non-blocking: if the hub's command queue is full
    /// the event is dropped, never the producer.
    pub fn publish(
        &self,
        kind: &str,
        resource_type: Option<&str>,
        resource_id: Option<&str>,
        payload: serde_json::Value,
    ) {
        let message = Self::make_message(kind, resource_type, resource_id, payload);
        if self
            .commands
            .try_send(HubCommand::Broadcast { message })
            .is_err()
        {
            tracing::debug!(kind, "hub command queue full, event dropped");
        }
    }

    /// Deliver only to clients subscribed to `(resource_type, resource_id)`.
    pub fn publish_targeted(
        &self,
        kind: &str,
        resource_type: &str,
        resource_id: &str,
        payload: serde_json::Value,
    ) {
        let message = Self::make_message(kind, Some(resource_type), Some(resource_id), payload);
        if self
            .commands
            .try_send(HubCommand::Targeted { message })
            .is_err()
        {
            tracing::debug!(kind, "hub command queue full, event dropped");
        }
    }

    pub fn task_update(&self, task_id: &str, payload: serde_json::Value) {
        self.publish(message_type::TASK_UPDATE, Some("task"), Some(task_id), payload);
    }

    pub fn log_entry(&self, task_id: &str, payload: serde_json::Value) {
        self.publish(message_type::LOG_ENTRY, Some("task"), Some(task_id), payload);
    }

    pub fn metric_update(&self, resource_id: &str, payload: serde_json::Value) {
        self.publish(
            message_type::METRIC_UPDATE,
            Some("metric"),
            Some(resource_id),
            payload,
        );
    }
}

async fn coordinator(rx: async_channel::Receiver<HubCommand>) {
    let mut clients: HashMap<u64, ClientEntry> = HashMap::new();
    while let Ok(command) = rx.recv().await {
        match command {
            HubCommand::Register { id, sender } => {
                clients.insert(
                    id,
                    ClientEntry {
                        sender,
                        subscriptions: HashSet::new(),
                        filters: Vec::new(),
                    },
                );
                tracing::debug!(client = id, total = clients.len(), "observer connected");
            }
            HubCommand::Unregister { id } => {
                clients.remove(&id);
                tracing::debug!(client = id, total = clients.len(), "observer disconnected");
            }
            HubCommand::Inbound { id, message } => {
                if let Some(entry) = clients.get_mut(&id) {
                    handle_inbound(entry, message);
                }
            }
            HubCommand::Broadcast { message } => {
                for (id, entry) in &clients {
                    if message_passes(&entry.filters, &message) {
                        deliver(*id, entry, &message);
                    }
                }
            }
            HubCommand::Targeted { message } => {
                let key_type = message.resource_type.clone().unwrap_or_default();
                let key_id = message.resource_id.clone().unwrap_or_default();
                for (id, entry) in &clients {
                    let subscribed = entry
                        .subscriptions
                        .contains(&(key_type.clone(), key_id.clone()))
                        || entry
                            .subscriptions
                            .contains(&(key_type.clone(), "*".to_string()));
                    if subscribed {
                        deliver(*id, entry, &message);
                    }
                }
            }
        }
    }
}

/// Enqueue onto one client's bounded queue; a full queue drops the
/// message for that client only.
fn deliver(id: u64, entry: &ClientEntry, message: &ServerMessage) {
    if entry.sender.try_send(message.clone()).is_err() {
        tracing::debug!(client = id, kind = %message.kind, "client queue full, message dropped");
    }
}

fn handle_inbound(entry: &mut ClientEntry, message: ClientMessage) {
    let reply = |kind: &str, message: &ClientMessage| ServerMessage {
        kind: kind.to_string(),
        id: message.id.clone(),
        resource_type: message.resource_type.clone(),
        resource_id: message.resource_id.clone(),
        payload: None,
        timestamp: kecs_common::now_ms(),
    };
    match message.kind.as_str() {
        "ping" => {
            let pong = reply("pong", &message);
            let _ = entry.sender.try_send(pong);
        }
        "subscribe" => {
            let Some(resource_type) = message.resource_type.clone() else {
                return;
            };
            let resource_id = message
                .resource_id
                .clone()
                .unwrap_or_else(|| "*".to_string());
            entry.subscriptions.insert((resource_type, resource_id));
            let ack = reply("subscribed", &message);
            let _ = entry.sender.try_send(ack);
        }
        "unsubscribe" => {
            let Some(resource_type) = message.resource_type.clone() else {
                return;
            };
            let resource_id = message
                .resource_id
                .clone()
                .unwrap_or_else(|| "*".to_string());
            entry.subscriptions.remove(&(resource_type, resource_id));
            let ack = reply("unsubscribed", &message);
            let _ = entry.sender.try_send(ack);
        }
        "setFilters" => {
            entry.filters = message.filters.clone().unwrap_or_default();
            let ack = reply("filtersSet", &message);
            let _ = entry.sender.try_send(ack);
        }
        // Unknown inbound types are ignored, never fatal.
        _ => {}
    }
}

/// A message passes an empty filter set; otherwise it must match at least
/// one filter (OR across filters, AND within one).
fn message_passes(filters: &[SubscriptionFilter], message: &ServerMessage) -> bool {
    if filters.is_empty() {
        return true;
    }
    filters.iter().any(|f| filter_matches(f, message))
}

fn filter_matches(filter: &SubscriptionFilter, message: &ServerMessage) -> bool {
    if !filter.event_types.is_empty() && !filter.event_types.contains(&message.kind) {
        return false;
    }
    if !filter.resource_types.is_empty() {
        let Some(resource_type) = &message.resource_type else {
            return false;
        };
        if !filter.resource_types.contains(resource_type) {
            return false;
        }
    }
    if !filter.resource_ids.is_empty() {
        if filter.resource_ids.iter().any(|id| id == "*") {
            return true;
        }
        let Some(resource_id) = &message.resource_id else {
            return false;
        };
        if !filter.resource_ids.contains(resource_id) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn msg(kind: &str, rt: Option<&str>, rid: Option<&str>) -> ServerMessage {
        ServerMessage {
            kind: kind.to_string(),
            id: None,
            resource_type: rt.map(str::to_string),
            resource_id: rid.map(str::to_string),
            payload: None,
            timestamp: 0,
        }
    }

    fn filter(events: &[&str], types: &[&str], ids: &[&str]) -> SubscriptionFilter {
        SubscriptionFilter {
            event_types: events.iter().map(|s| s.to_string()).collect(),
            resource_types: types.iter().map(|s| s.to_string()).collect(),
            resource_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn empty_filter_set_accepts_all() {
        assert!(message_passes(&[], &msg("task_update", None, None)));
    }

    #[test]
    fn dimensions_and_within_one_filter() {
        let f = filter(&["task_update"], &["task"], &[]);
        assert!(filter_matches(&f, &msg("task_update", Some("task"), Some("t-1"))));
        assert!(!filter_matches(&f, &msg("task_update", Some("service"), None)));
        assert!(!filter_matches(&f, &msg("log_entry", Some("task"), None)));
    }

    #[test]
    fn filters_or_across_the_set() {
        let set = vec![filter(&["task_update"], &[], &[]), filter(&[], &["service"], &[])];
        // Matches the first filter only.
        assert!(message_passes(&set, &msg("task_update", Some("task"), Some("t-1"))));
        // Matches the second filter only.
        assert!(message_passes(&set, &msg("service_update", Some("service"), Some("s-1"))));
        // Matches both.
        assert!(message_passes(&set, &msg("task_update", Some("service"), None)));
        // Matches neither.
        assert!(!message_passes(&set, &msg("log_entry", Some("task"), None)));
    }

    #[test]
    fn wildcard_resource_id() {
        let f = filter(&[], &["task"], &["*"]);
        assert!(filter_matches(&f, &msg("task_update", Some("task"), Some("anything"))));
        assert!(filter_matches(&f, &msg("task_update", Some("task"), None)));
        assert!(!filter_matches(&f, &msg("task_update", Some("service"), Some("s-1"))));
    }

    #[tokio::test]
    async fn origin_policy() {
        let open = Hub::new(Vec::new());
        assert!(open.origin_allowed(None));
        assert!(open.origin_allowed(Some("")));
        assert!(open.origin_allowed(Some("http://anywhere")));

        let restricted = Hub::new(vec!["http://localhost:3000".to_string()]);
        assert!(restricted.origin_allowed(None));
        assert!(restricted.origin_allowed(Some("http://localhost:3000")));
        assert!(!restricted.origin_allowed(Some("http://evil.example")));
    }

    async fn drain_until(
        rx: &async_channel::Receiver<ServerMessage>,
        kind: &str,
    ) -> Option<ServerMessage> {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let message = rx.recv().await.ok()?;
                if message.kind == kind {
                    return Some(message);
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    #[tokio::test]
    async fn fan_out_respects_filters() {
        let hub = Hub::new(Vec::new());
        let (a, rx_a) = hub.connect().await;
        let (b, rx_b) = hub.connect().await;
        hub.handle_client_message(
            a,
            ClientMessage {
                kind: "setFilters".to_string(),
                filters: Some(vec![filter(&["task_update"], &[], &[])]),
                ..Default::default()
            },
        )
        .await;
        hub.handle_client_message(
            b,
            ClientMessage {
                kind: "setFilters".to_string(),
                filters: Some(vec![filter(&[], &["service"], &[])]),
                ..Default::default()
            },
        )
        .await;
        assert!(drain_until(&rx_a, "filtersSet").await.is_some());
        assert!(drain_until(&rx_b, "filtersSet").await.is_some());

        hub.publish("task_update", Some("task"), Some("t-1"), serde_json::json!({}));
        assert!(drain_until(&rx_a, "task_update").await.is_some());

        hub.publish("service_update", Some("service"), Some("s-1"), serde_json::json!({}));
        assert!(drain_until(&rx_b, "service_update").await.is_some());
        // A only accepts task_update events; nothing else arrived for it.
        assert!(rx_a.is_empty());

        // A message matching both via different dimensions reaches both.
        hub.publish("task_update", Some("service"), None, serde_json::json!({}));
        assert!(drain_until(&rx_a, "task_update").await.is_some());
        assert!(drain_until(&rx_b, "task_update").await.is_some());
    }

    #[tokio::test]
    async fn targeted_delivery_by_subscription() {
        let hub = Hub::new(Vec::new());
        let (a, rx_a) = hub.connect().await;
        let (_b, rx_b) = hub.connect().await;
        hub.handle_client_message(
            a,
            ClientMessage {
                kind: "subscribe".to_string(),
                resource_type: Some("task".to_string()),
                resource_id: Some("t-1".to_string()),
                id: Some("m-1".to_string()),
                ..Default::default()
            },
        )
        .await;
        let ack = drain_until(&rx_a, "subscribed").await.unwrap();
        assert_eq!(ack.id.as_deref(), Some("m-1"));

        hub.publish_targeted("task_update", "task", "t-1", serde_json::json!({}));
        assert!(drain_until(&rx_a, "task_update").await.is_some());
        assert!(rx_b.is_empty());

        // Wildcard subscription catches every id of that type.
        hub.handle_client_message(
            a,
            ClientMessage {
                kind: "subscribe".to_string(),
                resource_type: Some("task".to_string()),
                resource_id: Some("*".to_string()),
                ..Default::default()
            },
        )
        .await;
        drain_until(&rx_a, "subscribed").await.unwrap();
        hub.publish_targeted("task_update", "task", "t-999", serde_json::json!({}));
        assert!(drain_until(&rx_a, "task_update").await.is_some());
    }

    #[tokio::test]
    async fn ping_pong_echoes_id() {
        let hub = Hub::new(Vec::new());
        let (id, rx) = hub.connect().await;
        hub.handle_client_message(
            id,
            ClientMessage {
                kind: "ping".to_string(),
                id: Some("ping-42".to_string()),
                ..Default::default()
            },
        )
        .await;
        let pong = drain_until(&rx, "pong").await.unwrap();
        assert_eq!(pong.id.as_deref(), Some("ping-42"));
    }

    #[tokio::test]
    async fn unknown_inbound_ignored() {
        let hub = Hub::new(Vec::new());
        let (id, rx) = hub.connect().await;
        hub.handle_client_message(
            id,
            ClientMessage {
                kind: "mystery".to_string(),
                ..Default::default()
            },
        )
        .await;
        // Still alive and responsive afterwards.
        hub.handle_client_message(
            id,
            ClientMessage {
                kind: "ping".to_string(),
                ..Default::default()
            },
        )
        .await;
        assert!(drain_until(&rx, "pong").await.is_some());
    }

    #[tokio::test]
    async fn slow_client_drops_instead_of_blocking() {
        let hub = Hub::new(Vec::new());
        let (_id, rx) = hub.connect().await;
        // Overfill the bounded queue without draining.
        for i in 0..CLIENT_QUEUE_CAPACITY + 50 {
            hub.publish(
                "task_update",
                Some("task"),
                Some(&format!("t-{i}")),
                serde_json::json!({}),
            );
        }
        // Give the coordinator time to process.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert!(received <= CLIENT_QUEUE_CAPACITY);
        assert!(received > 0);

        // The hub survives and keeps delivering.
        hub.publish("task_update", Some("task"), Some("after"), serde_json::json!({}));
        assert!(drain_until(&rx, "task_update").await.is_some());
    }
}
