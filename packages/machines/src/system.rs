//! Scheduler/registry bridge between the transition engine and durable
//! storage.
//!
//! Built once per handler invocation from the durable `events`/`children`
//! view. The engine's native scheduling and child bookkeeping are
//! synchronous and memory-resident; this is the sole place where those
//! effects are mirrored into durable state. All durable effects flow
//! through the [`SystemHost`] capability, so the bridge itself carries no
//! Restate types and is testable with a recording host.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::logic::{InspectionEvent, Inspector};
use crate::promise::TaskInvocation;
use crate::types::{
    scheduled_event_id, ActorRef, ChildrenTable, EventsTable, InvokeTaskRequest, ScheduledEvent,
    SendRequest,
};

/// Capability surface the bridge needs from the durable host.
///
/// The real implementation wraps a Restate object context; tests use
/// [`crate::testing::RecordingHost`]. Randomness must come from the host's
/// replay-safe source so replays reproduce identical ids.
pub trait SystemHost: Send + Sync {
    /// The instance's external key.
    fn key(&self) -> &str;

    /// Replay-safe random identifier for scheduled events without one.
    fn random_id(&self) -> String;

    /// Replay-safe random correlation uuid.
    fn random_uuid(&self) -> String;

    /// Wall-clock milliseconds, diagnostic only (never read back by logic).
    fn unix_millis(&self) -> u64;

    fn set_events(&self, events: &EventsTable);

    fn set_children(&self, children: &ChildrenTable);

    /// Durable (optionally delayed) message back to this same key.
    fn send_to_self(&self, request: SendRequest, delay: Option<Duration>);

    /// Durable fire-and-forget call to the shared task-invocation handler.
    fn invoke_task(&self, request: InvokeTaskRequest, retry: bool);
}

/// Outcome of validating a delivered scheduled event against stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledDelivery {
    /// Entry present with a matching uuid; it has been consumed.
    Consumed,
    /// No entry under this key: the event was cancelled before delivery.
    Cancelled,
    /// Entry exists but with a different uuid: the event was replaced.
    Replaced,
}

impl ScheduledDelivery {
    pub fn is_stale(self) -> bool {
        !matches!(self, ScheduledDelivery::Consumed)
    }
}

pub struct ActorSystem<'a> {
    host: &'a dyn SystemHost,
    version: String,
    events: EventsTable,
    children: ChildrenTable,
    live: BTreeSet<String>,
    keyed: ChildrenTable,
    inspectors: Vec<Arc<dyn Inspector>>,
}

impl<'a> ActorSystem<'a> {
    pub fn new(
        host: &'a dyn SystemHost,
        version: impl Into<String>,
        events: EventsTable,
        children: ChildrenTable,
    ) -> Self {
        Self {
            host,
            version: version.into(),
            events,
            children,
            live: BTreeSet::new(),
            keyed: ChildrenTable::new(),
            inspectors: Vec::new(),
        }
    }

    /// The instance key, which is also the system name.
    pub fn key(&self) -> &str {
        self.host.key()
    }

    /// The version tag bound to this instance.
    pub fn version(&self) -> &str {
        &self.version
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Schedule a delayed event from `source` to `target`.
    ///
    /// Re-scheduling under an existing key is an idempotent duplicate and
    /// is dropped. Otherwise the record is persisted and a durable delayed
    /// message carrying it is sent back to this key; the record's uuid is
    /// re-checked at delivery time.
    pub fn schedule(
        &mut self,
        source: &ActorRef,
        target: &ActorRef,
        event: crate::logic::EventObject,
        delay: Duration,
        id: Option<String>,
    ) {
        let id = id.unwrap_or_else(|| self.host.random_id());

        tracing::debug!(
            source = %source.id,
            target = %target.id,
            id = %id,
            delay_ms = delay.as_millis() as u64,
            "scheduling event"
        );

        let key = scheduled_event_id(source, &id);
        if self.events.contains_key(&key) {
            tracing::debug!(source = %source.id, target = %target.id, "ignoring duplicate schedule");
            return;
        }

        let scheduled = ScheduledEvent {
            id,
            event: event.clone(),
            delay_ms: delay.as_millis() as u64,
            source: source.clone(),
            target: target.clone(),
            started_at: self.host.unix_millis(),
            uuid: self.host.random_uuid(),
        };

        self.host.send_to_self(
            SendRequest {
                event,
                source: Some(source.clone()),
                target: Some(target.clone()),
                scheduled_event: Some(scheduled.clone()),
                subscribe: None,
            },
            Some(delay),
        );

        self.events.insert(key, scheduled);
        self.host.set_events(&self.events);
    }

    /// Remove a scheduled event. The durable delayed message cannot be
    /// un-sent; cancellation is detected at delivery time by the staleness
    /// check.
    pub fn cancel(&mut self, source: &ActorRef, id: &str) {
        let key = scheduled_event_id(source, id);
        if self.events.remove(&key).is_none() {
            return;
        }
        tracing::debug!(source = %source.id, id = %id, "cancelling scheduled event");
        self.host.set_events(&self.events);
    }

    /// Remove every scheduled event originating from the given session
    /// (used when a child actor stops).
    pub fn cancel_all(&mut self, session_id: &str) {
        if self.events.is_empty() {
            return;
        }
        tracing::debug!(session = %session_id, "cancelling all scheduled events for session");
        self.events
            .retain(|_, scheduled| scheduled.source.session_id != session_id);
        self.host.set_events(&self.events);
    }

    /// Validate a delivered scheduled event and consume its entry.
    pub fn consume_scheduled(&mut self, scheduled: &ScheduledEvent) -> ScheduledDelivery {
        let key = scheduled_event_id(&scheduled.source, &scheduled.id);
        let Some(stored) = self.events.get(&key) else {
            return ScheduledDelivery::Cancelled;
        };
        if stored.uuid != scheduled.uuid {
            return ScheduledDelivery::Replaced;
        }
        self.events.remove(&key);
        self.host.set_events(&self.events);
        ScheduledDelivery::Consumed
    }

    pub fn scheduled_events(&self) -> &EventsTable {
        &self.events
    }

    // =========================================================================
    // Actor registry
    // =========================================================================

    /// Register a (re)spawned actor. If a prior record exists for this
    /// logical id its session id wins, so correlation survives
    /// rehydration; the engine must adopt the returned reference.
    pub fn register(&mut self, proposed: ActorRef) -> ActorRef {
        let actor = match self.children.get(&proposed.id) {
            Some(existing) => {
                // Rehydration: keep session-id continuity.
                let mut actor = proposed;
                actor.session_id = existing.session_id.clone();
                actor
            }
            None => {
                self.children.insert(proposed.id.clone(), proposed.clone());
                self.host.set_children(&self.children);
                proposed
            }
        };
        self.live.insert(actor.session_id.clone());
        actor
    }

    /// Remove an actor from the registry, restoring session continuity
    /// first so the right live entry is dropped.
    pub fn unregister(&mut self, actor: &ActorRef) {
        let session_id = self
            .children
            .get(&actor.id)
            .map(|existing| existing.session_id.clone())
            .unwrap_or_else(|| actor.session_id.clone());

        self.live.remove(&session_id);
        if self.children.remove(&actor.id).is_some() {
            self.host.set_children(&self.children);
        }
        self.keyed.retain(|_, r| r.session_id != session_id);
    }

    /// Whether a session is live in this invocation (root excluded; the
    /// root is the actor object itself).
    pub fn is_live(&self, session_id: &str) -> bool {
        self.live.contains(session_id)
    }

    pub fn children(&self) -> &ChildrenTable {
        &self.children
    }

    /// Associate a system-wide key with an actor, mirroring the engine's
    /// keyed-actor lookup. Rebuilt from scratch each invocation.
    pub fn set_keyed(&mut self, system_id: impl Into<String>, actor: ActorRef) {
        self.keyed.insert(system_id.into(), actor);
    }

    pub fn keyed(&self, system_id: &str) -> Option<&ActorRef> {
        self.keyed.get(system_id)
    }

    // =========================================================================
    // Relay
    // =========================================================================

    /// Dispatch an event into the live actor tree.
    ///
    /// A target that is neither the root nor a live registered session has
    /// already stopped; relaying to it is a terminal failure.
    pub fn relay(
        &mut self,
        source: Option<&ActorRef>,
        target: Option<&ActorRef>,
        root: &mut dyn crate::logic::MachineActor,
        event: &crate::logic::EventObject,
    ) -> Result<(), crate::logic::MachineError> {
        let root_ref = root.actor_ref();
        let target_session = match target {
            Some(t) if t.session_id != root_ref.session_id => {
                if !self.is_live(&t.session_id) {
                    return Err(crate::logic::MachineError::TargetNotFound { id: t.id.clone() });
                }
                Some(t.session_id.clone())
            }
            _ => None,
        };

        tracing::debug!(
            source = source.map(|s| s.id.as_str()).unwrap_or("<external>"),
            target = target.map(|t| t.id.as_str()).unwrap_or(root_ref.id.as_str()),
            event = %event.event_type,
            "relaying message"
        );

        root.deliver(target_session.as_deref(), event, self)
    }

    // =========================================================================
    // Task invocation
    // =========================================================================

    /// Issue the durable background call for a machine-invoked async task.
    pub fn invoke_task(&mut self, invocation: TaskInvocation) {
        tracing::debug!(
            srcs = ?invocation.srcs,
            version = %self.version,
            retry = invocation.retry,
            "invoking task"
        );
        self.host.invoke_task(
            InvokeTaskRequest {
                self_ref: Some(invocation.self_ref),
                srcs: invocation.srcs,
                input: invocation.input,
                version: Some(self.version.clone()),
            },
            invocation.retry,
        );
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn attach_inspector(&mut self, inspector: Arc<dyn Inspector>) {
        self.inspectors.push(inspector);
    }

    pub fn send_inspection_event(&self, kind: impl Into<String>, payload: Value) {
        if self.inspectors.is_empty() {
            return;
        }
        let event = InspectionEvent {
            root_id: self.host.key().to_string(),
            kind: kind.into(),
            payload,
        };
        for inspector in &self.inspectors {
            inspector.next(&event);
        }
    }
}
