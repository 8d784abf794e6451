//! Promise-actor bridge: machine-invoked async work as durable background
//! calls.
//!
//! A machine that invokes an async task does not run it inline. The task
//! actor issues one durable call to the shared invocation handler and marks
//! itself `sent`, so a crash-and-replay never re-issues the call; the
//! handler runs the work and delivers the result (or error) back into the
//! instance as a self-addressed resolve/reject event.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::logic::{EventObject, MachineStatus};
use crate::system::ActorSystem;
use crate::types::ActorRef;

/// Self-addressed event marking the durable call as issued.
pub const PROMISE_SENT_EVENT: &str = "machine.promise.sent";
/// Self-addressed event carrying a task's successful output.
pub const PROMISE_RESOLVE_EVENT: &str = "machine.promise.resolve";
/// Self-addressed event carrying a task's terminal failure.
pub const PROMISE_REJECT_EVENT: &str = "machine.promise.reject";
/// Engine-issued stop notification for a task actor.
pub const STOP_EVENT: &str = "machine.stop";

/// Failure of a task's work function.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Never retried; always becomes a terminal reject event.
    #[error("{0}")]
    Terminal(String),

    /// Retried by the host's retry policy where configured; otherwise it
    /// too becomes a terminal reject.
    #[error("{0}")]
    Retryable(String),
}

/// One async unit of work a machine can invoke.
///
/// The work function runs inside a journaled side effect on the shared
/// handler; it may call out to other systems but must not mutate this
/// instance's durable state.
#[async_trait]
pub trait PromiseTask: Send + Sync {
    async fn run(&self, input: Value, env: &TaskEnv) -> Result<Value, TaskError>;
}

/// Restricted execution context handed to a task's work function.
#[derive(Debug, Clone)]
pub struct TaskEnv {
    /// The instance's external key.
    pub key: String,
    /// The version tag the invocation was issued under.
    pub version: String,
}

/// Dispatch request built by a task actor when it first activates.
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    pub self_ref: ActorRef,
    pub srcs: Vec<String>,
    pub input: Value,
    /// Retrying mode wraps the call in the host's retry policy; plain mode
    /// is a single attempt whose failure becomes a terminal reject.
    pub retry: bool,
}

/// Retry policy applied to retried task invocations, mapped onto the
/// host's journaled-action retry policy.
#[derive(Debug, Clone)]
pub struct TaskRetryPolicy {
    pub initial_delay: Duration,
    pub factor: f32,
    pub max_delay: Option<Duration>,
    pub max_attempts: Option<u32>,
    pub max_duration: Option<Duration>,
}

impl Default for TaskRetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Some(Duration::from_secs(10)),
            max_attempts: Some(3),
            max_duration: None,
        }
    }
}

// =============================================================================
// Task actor state
// =============================================================================

/// Persisted state of one invoked task actor, embedded in the parent
/// machine's snapshot by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub status: MachineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default)]
    pub sent: bool,
}

impl TaskSnapshot {
    pub fn initial(input: Option<Value>) -> Self {
        Self {
            status: MachineStatus::Active,
            output: None,
            error: None,
            input,
            sent: false,
        }
    }

    /// Pure transition of the task actor. Non-active states absorb every
    /// event.
    pub fn transition(mut self, event: &EventObject) -> Self {
        if self.status != MachineStatus::Active {
            return self;
        }
        match event.event_type.as_str() {
            PROMISE_SENT_EVENT => {
                self.sent = true;
                self
            }
            PROMISE_RESOLVE_EVENT => {
                self.status = MachineStatus::Done;
                self.output = Some(event.data.clone());
                self.input = None;
                self
            }
            PROMISE_REJECT_EVENT => {
                self.status = MachineStatus::Error;
                self.error = Some(event.data.clone());
                self.input = None;
                self
            }
            STOP_EVENT => {
                self.status = MachineStatus::Stopped;
                self.input = None;
                self
            }
            _ => self,
        }
    }

    /// Issue the durable invocation on (re)start, at most once.
    ///
    /// Returns true when a call was issued; callers must apply the `sent`
    /// marker to their snapshot in the same invocation so replays skip it.
    pub fn activate(
        &mut self,
        self_ref: &ActorRef,
        src: &str,
        retry: bool,
        system: &mut ActorSystem<'_>,
    ) -> bool {
        if self.status != MachineStatus::Active || self.sent {
            return false;
        }
        system.invoke_task(TaskInvocation {
            self_ref: self_ref.clone(),
            srcs: self_ref.src_chain(src),
            input: self.input.clone().unwrap_or(Value::Null),
            retry,
        });
        self.sent = true;
        true
    }
}

/// Walk a src chain through nested machine definitions using a lookup
/// table per machine level. Convenience for [`crate::logic::MachineLogic`]
/// implementations whose nesting is table-driven.
pub fn resolve_src_chain<'t, T>(
    tables: &'t [BTreeMap<String, T>],
    srcs: &[String],
) -> Option<&'t T> {
    // Outermost machine last in the chain; the task src itself is first.
    let task_src = srcs.first()?;
    let depth = srcs.len().saturating_sub(1);
    tables.get(depth)?.get(task_src)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingHost;
    use crate::types::{ChildrenTable, EventsTable};
    use serde_json::json;

    #[test]
    fn test_resolve_marks_done_and_drops_input() {
        let state = TaskSnapshot::initial(Some(json!({"card": "visa"})));
        let next = state.transition(&EventObject::with_data(
            PROMISE_RESOLVE_EVENT,
            json!({"status": "charged"}),
        ));
        assert_eq!(next.status, MachineStatus::Done);
        assert_eq!(next.output, Some(json!({"status": "charged"})));
        assert_eq!(next.input, None);
    }

    #[test]
    fn test_reject_marks_error() {
        let state = TaskSnapshot::initial(None);
        let next = state.transition(&EventObject::with_data(
            PROMISE_REJECT_EVENT,
            json!("card declined"),
        ));
        assert_eq!(next.status, MachineStatus::Error);
        assert_eq!(next.error, Some(json!("card declined")));
    }

    #[test]
    fn test_terminal_states_absorb_events() {
        let done = TaskSnapshot::initial(None)
            .transition(&EventObject::with_data(PROMISE_RESOLVE_EVENT, json!(1)));
        let after = done
            .clone()
            .transition(&EventObject::with_data(PROMISE_REJECT_EVENT, json!("late")));
        assert_eq!(after, done);
    }

    #[test]
    fn test_stop_stops_active_task() {
        let next = TaskSnapshot::initial(Some(json!(1))).transition(&EventObject::new(STOP_EVENT));
        assert_eq!(next.status, MachineStatus::Stopped);
        assert_eq!(next.input, None);
    }

    #[test]
    fn test_activate_issues_call_at_most_once() {
        let host = RecordingHost::new("order-1");
        let mut system = ActorSystem::new(&host, "v1", EventsTable::new(), ChildrenTable::new());
        let self_ref =
            ActorRef::new("0.charge", "task-sess").with_parent(ActorRef::new("payment", "root"));
        let mut state = TaskSnapshot::initial(Some(json!({"amount": 100})));

        assert!(state.activate(&self_ref, "charge_card", true, &mut system));
        // Replay after the sent marker was applied: no second call.
        assert!(!state.activate(&self_ref, "charge_card", true, &mut system));

        let invocations = host.task_invocations();
        assert_eq!(invocations.len(), 1);
        let (request, retry) = &invocations[0];
        assert!(*retry);
        assert_eq!(request.srcs, vec!["charge_card", "payment"]);
        assert_eq!(request.version.as_deref(), Some("v1"));
        assert_eq!(request.self_ref.as_ref().unwrap().session_id, "task-sess");
    }

    #[test]
    fn test_activate_skips_non_active_states() {
        let host = RecordingHost::new("order-1");
        let mut system = ActorSystem::new(&host, "v1", EventsTable::new(), ChildrenTable::new());
        let self_ref = ActorRef::new("0.charge", "task-sess");
        let mut state = TaskSnapshot::initial(None);
        state.status = MachineStatus::Stopped;

        assert!(!state.activate(&self_ref, "charge_card", false, &mut system));
        assert!(host.task_invocations().is_empty());
    }

    #[test]
    fn test_resolve_src_chain_depth() {
        let mut root_level: BTreeMap<String, &str> = BTreeMap::new();
        root_level.insert("charge_card".into(), "root-task");
        let mut nested_level: BTreeMap<String, &str> = BTreeMap::new();
        nested_level.insert("charge_card".into(), "nested-task");
        let tables = vec![root_level, nested_level];

        // src chain of a task directly under the root machine.
        let srcs = vec!["charge_card".to_string()];
        assert_eq!(resolve_src_chain(&tables, &srcs), Some(&"root-task"));

        // one machine of nesting.
        let srcs = vec!["charge_card".to_string(), "sub-machine".to_string()];
        assert_eq!(resolve_src_chain(&tables, &srcs), Some(&"nested-task"));

        assert_eq!(resolve_src_chain(&tables, &[]), None);
    }
}
