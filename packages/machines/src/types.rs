//! Durable state layout and wire types shared across handlers.
//!
//! Per keyed instance, exactly six durable fields exist: `version`,
//! `snapshot`, `events`, `children`, `disposed` and `subscriptions`. Every
//! other structure here is a request or response payload for the virtual
//! object handlers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::impl_restate_serde;
use crate::logic::{EventObject, SnapshotWithTags};

// =============================================================================
// Durable state keys
// =============================================================================

pub const STATE_VERSION: &str = "version";
pub const STATE_SNAPSHOT: &str = "snapshot";
pub const STATE_EVENTS: &str = "events";
pub const STATE_CHILDREN: &str = "children";
pub const STATE_DISPOSED: &str = "disposed";
pub const STATE_SUBSCRIPTIONS: &str = "subscriptions";

// =============================================================================
// Actor references and scheduled events
// =============================================================================

/// Serializable reference to an actor in the instance's tree.
///
/// Session ids must stay stable across rehydrations or message correlation
/// breaks; the bridge's child table exists to preserve them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRef {
    pub id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<ActorRef>>,
}

impl ActorRef {
    pub fn new(id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: ActorRef) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    /// The `src` labels of this actor and every ancestor, nearest first.
    /// Used by the promise bridge to re-resolve nested task definitions.
    pub fn src_chain(&self, own_src: &str) -> Vec<String> {
        let mut srcs = vec![own_src.to_string()];
        let mut cursor = self.parent.as_deref();
        while let Some(p) = cursor {
            srcs.push(p.id.clone());
            cursor = p.parent.as_deref();
        }
        srcs
    }
}

/// An in-flight delayed message (timer or delayed send).
///
/// `uuid` correlates the durable delayed message with the stored record; a
/// delivery whose uuid no longer matches is stale and must be dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub id: String,
    pub event: EventObject,
    pub delay_ms: u64,
    pub source: ActorRef,
    pub target: ActorRef,
    pub started_at: u64,
    pub uuid: String,
}

/// Key under which a scheduled event is stored: `<source session>.<id>`.
pub fn scheduled_event_id(source: &ActorRef, id: &str) -> String {
    format!("{}.{}", source.session_id, id)
}

pub type EventsTable = BTreeMap<String, ScheduledEvent>;
pub type ChildrenTable = BTreeMap<String, ActorRef>;

// =============================================================================
// Subscriptions
// =============================================================================

/// Pending external wait handles registered against one condition key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub awakeables: Vec<String>,
}

pub type SubscriptionsTable = BTreeMap<String, Subscription>;

// =============================================================================
// Handler request/response types
// =============================================================================

/// Empty request for parameterless handlers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyRequest {}

impl_restate_serde!(EmptyRequest);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

impl_restate_serde!(CreateRequest);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub event: EventObject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ActorRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ActorRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_event: Option<ScheduledEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<SubscribeRequest>,
}

impl SendRequest {
    pub fn event(event: EventObject) -> Self {
        Self {
            event,
            source: None,
            target: None,
            scheduled_event: None,
            subscribe: None,
        }
    }
}

impl_restate_serde!(SendRequest);

/// `send` returns nothing when a stale scheduled event was silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotWithTags>,
}

impl_restate_serde!(SendResponse);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub condition: String,
    pub awakeable_id: String,
}

impl_restate_serde!(SubscribeRequest);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitForRequest {
    pub condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<EventObject>,
}

impl_restate_serde!(WaitForRequest);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpireWaitRequest {
    pub awakeable_id: String,
    pub timeout_ms: u64,
}

impl_restate_serde!(ExpireWaitRequest);

/// Diagnostic read used by the watcher side-car.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckTagRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl_restate_serde!(CheckTagRequest);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckTagResponse {
    pub has_tag: bool,
    pub is_final: bool,
    pub snapshot: SnapshotWithTags,
}

impl_restate_serde!(CheckTagResponse);

/// Request for the shared promise invocation handlers.
///
/// `self_ref` is the originating actor; when absent the raw result/error is
/// returned to the caller instead of being sent back as an event (the
/// retry-wrapper contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeTaskRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_ref: Option<ActorRef>,
    pub srcs: Vec<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl_restate_serde!(InvokeTaskRequest);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduled_event_id_format() {
        let source = ActorRef::new("child-a", "sess-1");
        assert_eq!(scheduled_event_id(&source, "timer"), "sess-1.timer");
    }

    #[test]
    fn test_src_chain_walks_ancestors() {
        let root = ActorRef::new("payment", "root-sess");
        let machine = ActorRef::new("charge-machine", "m-sess").with_parent(root);
        let task = ActorRef::new("0.charge", "t-sess").with_parent(machine);

        assert_eq!(
            task.src_chain("charge_card"),
            vec!["charge_card", "charge-machine", "payment"]
        );
    }

    #[test]
    fn test_actor_ref_round_trips_without_parent_field() {
        let json = serde_json::to_value(ActorRef::new("a", "s")).unwrap();
        assert_eq!(json, serde_json::json!({"id": "a", "session_id": "s"}));
    }

    #[test]
    fn test_send_request_optional_fields_omitted() {
        let req = SendRequest::event(EventObject::new("PAY"));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, serde_json::json!({"event": {"type": "PAY"}}));
    }
}
