//! The transition-engine contract.
//!
//! The engine itself is an external collaborator: the adapter never computes
//! next states, it only drives an opaque [`MachineActor`] and makes its side
//! effects durable. Engines receive the scheduler/registry bridge as an
//! explicit capability argument on `start`/`deliver`; they own their child
//! actors and route targeted events internally.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::impl_restate_serde;
use crate::promise::PromiseTask;
use crate::system::ActorSystem;
use crate::types::ActorRef;

/// An event as exchanged with the machine: a type plus an optional payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventObject {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl EventObject {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: Value::Null,
        }
    }

    pub fn with_data(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }

    pub fn is(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }
}

impl_restate_serde!(EventObject);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Active,
    Done,
    Error,
    Stopped,
}

impl MachineStatus {
    pub fn is_final(self) -> bool {
        matches!(self, MachineStatus::Done | MachineStatus::Error)
    }
}

/// Persisted representation of a machine's current state.
///
/// Owned exclusively by the instance and overwritten after every
/// transition. `value` (current nodes) and `children` (pending invocation
/// snapshots) are opaque to the adapter; only `status`, `context` and
/// `output`/`error` are ever inspected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub status: MachineStatus,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub children: Value,
}

impl MachineSnapshot {
    pub fn active(value: Value, context: Value) -> Self {
        Self {
            status: MachineStatus::Active,
            value,
            context,
            output: None,
            error: None,
            children: Value::Null,
        }
    }
}

impl_restate_serde!(MachineSnapshot);

/// A persisted snapshot together with the live snapshot's sorted tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotWithTags {
    #[serde(flatten)]
    pub snapshot: MachineSnapshot,
    pub tags: Vec<String>,
}

impl SnapshotWithTags {
    pub fn of(actor: &dyn MachineActor) -> Self {
        Self::with_snapshot(actor, actor.persisted_snapshot())
    }

    pub fn with_snapshot(actor: &dyn MachineActor, snapshot: MachineSnapshot) -> Self {
        let mut tags: Vec<String> = actor.tags().into_iter().collect();
        tags.sort();
        Self { snapshot, tags }
    }
}

impl_restate_serde!(SnapshotWithTags);

/// Failures reported by the engine while starting or transitioning.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("actor {id} not found; it may have since stopped")]
    TargetNotFound { id: String },

    #[error("persisted snapshot is not understood by this machine definition: {0}")]
    BadSnapshot(String),

    #[error("{0}")]
    Internal(String),
}

/// One frozen machine definition, identified by its version tag.
pub trait MachineLogic: Send + Sync + 'static {
    /// Version identifier. An instance binds to exactly one for its
    /// lifetime.
    fn id(&self) -> &str;

    /// Fresh instance from external input.
    fn create(&self, input: Option<Value>) -> Result<Box<dyn MachineActor>, MachineError>;

    /// Instance restored from a persisted snapshot.
    fn restore(&self, snapshot: MachineSnapshot) -> Result<Box<dyn MachineActor>, MachineError>;

    /// Resolve the async task referenced by a src chain (task src first,
    /// then the enclosing machine srcs, innermost first).
    fn resolve_task(&self, srcs: &[String]) -> Option<Arc<dyn PromiseTask>> {
        let _ = srcs;
        None
    }
}

// Logic is a trait object; the version id is the useful part.
impl std::fmt::Debug for dyn MachineLogic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineLogic").field("id", &self.id()).finish()
    }
}

/// A live engine instance, rehydrated for the duration of one handler
/// invocation. The trait object is the root of the actor tree; the
/// original's synthetic no-op root parent has no counterpart here.
pub trait MachineActor: Send {
    /// Begin (or resume) processing. Restored instances re-activate pending
    /// invocations here; the `sent` bookkeeping in their snapshots prevents
    /// re-issuing durable calls.
    fn start(&mut self, system: &mut ActorSystem<'_>) -> Result<(), MachineError>;

    /// Deliver an event to the actor identified by `target_session`
    /// (`None` targets the root).
    fn deliver(
        &mut self,
        target_session: Option<&str>,
        event: &EventObject,
        system: &mut ActorSystem<'_>,
    ) -> Result<(), MachineError>;

    fn persisted_snapshot(&self) -> MachineSnapshot;

    fn status(&self) -> MachineStatus;

    /// Live tag membership of the current state.
    fn tags(&self) -> BTreeSet<String>;

    fn has_tag(&self, tag: &str) -> bool {
        self.tags().contains(tag)
    }

    /// Serializable reference to the root actor.
    fn actor_ref(&self) -> ActorRef;
}

/// An internal event observed at the system level, for tracing.
#[derive(Debug, Clone, Serialize)]
pub struct InspectionEvent {
    pub root_id: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

/// Observer attached at the system level so every internal event can be
/// traced.
pub trait Inspector: Send + Sync {
    fn next(&self, event: &InspectionEvent);
}
