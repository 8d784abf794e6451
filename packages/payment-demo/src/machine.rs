//! A hand-written payment machine exercising every bridge surface: a
//! delayed authorization timeout timer, a retried `charge_card` task, a
//! `processing` tag for the watcher, and terminal success/failure states.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use restate_machines::logic::{
    EventObject, MachineActor, MachineError, MachineLogic, MachineSnapshot, MachineStatus,
};
use restate_machines::promise::{PromiseTask, TaskEnv, TaskError, TaskSnapshot};
use restate_machines::system::ActorSystem;
use restate_machines::types::ActorRef;

pub const MACHINE_VERSION: &str = "payment-v1";
pub const AUTHORIZE_EVENT: &str = "AUTHORIZE";
pub const PROCESSING_TAG: &str = "processing";

const AUTH_TIMEOUT_EVENT: &str = "AUTH_TIMEOUT";
const AUTH_TIMEOUT_TIMER: &str = "auth-timeout";
const CHARGE_SRC: &str = "charge_card";
const TASK_SESSION: &str = "charge-session";

/// How long a created payment waits for authorization before failing.
const AUTH_WINDOW: Duration = Duration::from_secs(15 * 60);

fn root_ref() -> ActorRef {
    ActorRef::new("payment", "payment-root")
}

fn task_ref() -> ActorRef {
    ActorRef::new("0.charge_card", TASK_SESSION).with_parent(root_ref())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum PaymentState {
    AwaitingAuthorization,
    Charging,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PaymentContext {
    amount: u64,
    currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    receipt: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentInput {
    amount: u64,
    #[serde(default = "default_currency")]
    currency: String,
}

fn default_currency() -> String {
    "usd".to_string()
}

// =============================================================================
// Machine definition
// =============================================================================

pub struct PaymentMachine;

impl MachineLogic for PaymentMachine {
    fn id(&self) -> &str {
        MACHINE_VERSION
    }

    fn create(&self, input: Option<Value>) -> Result<Box<dyn MachineActor>, MachineError> {
        let input: PaymentInput = serde_json::from_value(input.unwrap_or(Value::Null))
            .map_err(|e| MachineError::Internal(format!("invalid payment input: {e}")))?;
        Ok(Box::new(PaymentActor {
            state: PaymentState::AwaitingAuthorization,
            context: PaymentContext {
                amount: input.amount,
                currency: input.currency,
                receipt: None,
                failure: None,
            },
            task: None,
        }))
    }

    fn restore(&self, snapshot: MachineSnapshot) -> Result<Box<dyn MachineActor>, MachineError> {
        let state: PaymentState = serde_json::from_value(snapshot.value.clone())
            .map_err(|e| MachineError::BadSnapshot(e.to_string()))?;
        let context: PaymentContext = serde_json::from_value(snapshot.context.clone())
            .map_err(|e| MachineError::BadSnapshot(e.to_string()))?;
        let task = match snapshot.children.get(CHARGE_SRC) {
            Some(raw) => Some(
                serde_json::from_value::<TaskSnapshot>(raw.clone())
                    .map_err(|e| MachineError::BadSnapshot(e.to_string()))?,
            ),
            None => None,
        };
        Ok(Box::new(PaymentActor {
            state,
            context,
            task,
        }))
    }

    fn resolve_task(&self, srcs: &[String]) -> Option<Arc<dyn PromiseTask>> {
        match srcs.first().map(String::as_str) {
            Some(CHARGE_SRC) => Some(Arc::new(ChargeCardTask)),
            _ => None,
        }
    }
}

// =============================================================================
// Actor
// =============================================================================

struct PaymentActor {
    state: PaymentState,
    context: PaymentContext,
    task: Option<TaskSnapshot>,
}

impl PaymentActor {
    fn activate_task(&mut self, system: &mut ActorSystem<'_>) {
        if self.state != PaymentState::Charging {
            return;
        }
        if let Some(task) = self.task.as_mut() {
            let adopted = system.register(task_ref());
            task.activate(&adopted, CHARGE_SRC, true, system);
        }
    }

    fn deliver_to_task(
        &mut self,
        event: &EventObject,
        system: &mut ActorSystem<'_>,
    ) -> Result<(), MachineError> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        *task = task.clone().transition(event);

        match task.status {
            MachineStatus::Done => {
                let receipt = task.output.clone().unwrap_or(Value::Null);
                system.unregister(&task_ref());
                self.state = PaymentState::Success;
                self.context.receipt = Some(receipt);
            }
            MachineStatus::Error => {
                let failure = task
                    .error
                    .clone()
                    .and_then(|e| e.as_str().map(str::to_string))
                    .unwrap_or_else(|| "charge failed".to_string());
                system.unregister(&task_ref());
                self.state = PaymentState::Failed;
                self.context.failure = Some(failure);
            }
            _ => {}
        }
        Ok(())
    }
}

impl MachineActor for PaymentActor {
    fn start(&mut self, system: &mut ActorSystem<'_>) -> Result<(), MachineError> {
        match self.state {
            PaymentState::AwaitingAuthorization => {
                // Idempotent across restarts: duplicate timer keys are
                // dropped by the scheduler.
                system.schedule(
                    &root_ref(),
                    &root_ref(),
                    EventObject::new(AUTH_TIMEOUT_EVENT),
                    AUTH_WINDOW,
                    Some(AUTH_TIMEOUT_TIMER.to_string()),
                );
            }
            PaymentState::Charging => self.activate_task(system),
            PaymentState::Success | PaymentState::Failed => {}
        }
        Ok(())
    }

    fn deliver(
        &mut self,
        target_session: Option<&str>,
        event: &EventObject,
        system: &mut ActorSystem<'_>,
    ) -> Result<(), MachineError> {
        if target_session == Some(TASK_SESSION) {
            return self.deliver_to_task(event, system);
        }

        match event.event_type.as_str() {
            AUTHORIZE_EVENT if self.state == PaymentState::AwaitingAuthorization => {
                system.cancel(&root_ref(), AUTH_TIMEOUT_TIMER);
                self.state = PaymentState::Charging;
                self.task = Some(TaskSnapshot::initial(Some(json!({
                    "amount": self.context.amount,
                    "currency": self.context.currency,
                }))));
                self.activate_task(system);
                Ok(())
            }
            AUTH_TIMEOUT_EVENT if self.state == PaymentState::AwaitingAuthorization => {
                self.state = PaymentState::Failed;
                self.context.failure = Some("authorization window elapsed".to_string());
                Ok(())
            }
            other => {
                tracing::debug!(event = %other, state = ?self.state, "ignoring event");
                Ok(())
            }
        }
    }

    fn persisted_snapshot(&self) -> MachineSnapshot {
        MachineSnapshot {
            status: self.status(),
            value: serde_json::to_value(self.state).unwrap_or(Value::Null),
            context: serde_json::to_value(&self.context).unwrap_or(Value::Null),
            output: match self.state {
                PaymentState::Success => self.context.receipt.clone(),
                _ => None,
            },
            error: self
                .context
                .failure
                .as_ref()
                .map(|f| Value::String(f.clone())),
            children: match &self.task {
                Some(task) => json!({ CHARGE_SRC: task }),
                None => Value::Null,
            },
        }
    }

    fn status(&self) -> MachineStatus {
        match self.state {
            PaymentState::AwaitingAuthorization | PaymentState::Charging => MachineStatus::Active,
            PaymentState::Success => MachineStatus::Done,
            PaymentState::Failed => MachineStatus::Error,
        }
    }

    fn tags(&self) -> BTreeSet<String> {
        let mut tags = BTreeSet::new();
        if self.state == PaymentState::Charging {
            tags.insert(PROCESSING_TAG.to_string());
        }
        tags
    }

    fn actor_ref(&self) -> ActorRef {
        root_ref()
    }
}

// =============================================================================
// Charge task
// =============================================================================

#[derive(Debug, Deserialize)]
struct ChargeInput {
    amount: u64,
    currency: String,
}

/// Stand-in for the payment service provider call.
pub struct ChargeCardTask;

#[async_trait]
impl PromiseTask for ChargeCardTask {
    async fn run(&self, input: Value, env: &TaskEnv) -> Result<Value, TaskError> {
        let charge: ChargeInput = serde_json::from_value(input)
            .map_err(|e| TaskError::Terminal(format!("invalid charge input: {e}")))?;
        if charge.amount == 0 {
            return Err(TaskError::Terminal("amount must be positive".to_string()));
        }

        tracing::info!(
            key = %env.key,
            amount = charge.amount,
            currency = %charge.currency,
            "charging card"
        );
        Ok(json!({
            "receipt": format!("rcpt-{}-{}", env.key, charge.amount),
            "amount": charge.amount,
            "currency": charge.currency,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use restate_machines::promise::{PROMISE_REJECT_EVENT, PROMISE_RESOLVE_EVENT};
    use restate_machines::testing::RecordingHost;
    use restate_machines::types::{ChildrenTable, EventsTable};

    fn fresh(
        host: &RecordingHost,
    ) -> (Box<dyn MachineActor>, ActorSystem<'_>) {
        let mut system = ActorSystem::new(host, MACHINE_VERSION, EventsTable::new(), ChildrenTable::new());
        let mut actor = PaymentMachine
            .create(Some(json!({"amount": 100, "currency": "usd"})))
            .unwrap();
        actor.start(&mut system).unwrap();
        (actor, system)
    }

    #[test]
    fn test_start_schedules_authorization_timeout() {
        let host = RecordingHost::new("order-1");
        let (_actor, system) = fresh(&host);

        assert!(system
            .scheduled_events()
            .contains_key("payment-root.auth-timeout"));
        assert_eq!(host.self_sends().len(), 1);
        assert_eq!(
            host.self_sends()[0].delay,
            Some(Duration::from_secs(15 * 60))
        );
    }

    #[test]
    fn test_authorize_cancels_timer_and_invokes_charge() {
        let host = RecordingHost::new("order-1");
        let (mut actor, mut system) = fresh(&host);

        actor
            .deliver(None, &EventObject::new(AUTHORIZE_EVENT), &mut system)
            .unwrap();

        assert!(system.scheduled_events().is_empty());
        assert!(actor.has_tag(PROCESSING_TAG));

        let invocations = host.task_invocations();
        assert_eq!(invocations.len(), 1);
        let (request, retry) = &invocations[0];
        assert!(*retry);
        assert_eq!(request.srcs, vec!["charge_card", "payment"]);
        assert_eq!(request.version.as_deref(), Some(MACHINE_VERSION));
    }

    #[test]
    fn test_restored_charging_machine_does_not_reissue_charge() {
        let host = RecordingHost::new("order-1");
        let snapshot = {
            let (mut actor, mut system) = fresh(&host);
            actor
                .deliver(None, &EventObject::new(AUTHORIZE_EVENT), &mut system)
                .unwrap();
            actor.persisted_snapshot()
        };
        let issued_before = host.task_invocations().len();

        let mut system = ActorSystem::new(
            &host,
            MACHINE_VERSION,
            EventsTable::new(),
            ChildrenTable::new(),
        );
        let mut actor = PaymentMachine.restore(snapshot).unwrap();
        actor.start(&mut system).unwrap();

        assert_eq!(host.task_invocations().len(), issued_before);
    }

    #[test]
    fn test_resolve_completes_payment() {
        let host = RecordingHost::new("order-1");
        let (mut actor, mut system) = fresh(&host);
        actor
            .deliver(None, &EventObject::new(AUTHORIZE_EVENT), &mut system)
            .unwrap();

        actor
            .deliver(
                Some(TASK_SESSION),
                &EventObject::with_data(PROMISE_RESOLVE_EVENT, json!({"receipt": "rcpt-1"})),
                &mut system,
            )
            .unwrap();

        assert_eq!(actor.status(), MachineStatus::Done);
        let snapshot = actor.persisted_snapshot();
        assert_eq!(snapshot.output, Some(json!({"receipt": "rcpt-1"})));
        assert!(system.children().is_empty());
    }

    #[test]
    fn test_reject_fails_payment() {
        let host = RecordingHost::new("order-1");
        let (mut actor, mut system) = fresh(&host);
        actor
            .deliver(None, &EventObject::new(AUTHORIZE_EVENT), &mut system)
            .unwrap();

        actor
            .deliver(
                Some(TASK_SESSION),
                &EventObject::with_data(PROMISE_REJECT_EVENT, json!("card declined")),
                &mut system,
            )
            .unwrap();

        assert_eq!(actor.status(), MachineStatus::Error);
        assert_eq!(
            actor.persisted_snapshot().error,
            Some(json!("card declined"))
        );
    }

    #[test]
    fn test_timeout_fails_payment() {
        let host = RecordingHost::new("order-1");
        let (mut actor, mut system) = fresh(&host);

        actor
            .deliver(None, &EventObject::new(AUTH_TIMEOUT_EVENT), &mut system)
            .unwrap();

        assert_eq!(actor.status(), MachineStatus::Error);
        assert_eq!(
            actor.persisted_snapshot().error,
            Some(json!("authorization window elapsed"))
        );
    }

    #[tokio::test]
    async fn test_charge_task_produces_receipt() {
        let env = TaskEnv {
            key: "order-1".to_string(),
            version: MACHINE_VERSION.to_string(),
        };
        let output = ChargeCardTask
            .run(json!({"amount": 100, "currency": "usd"}), &env)
            .await
            .unwrap();
        assert_eq!(output["receipt"], json!("rcpt-order-1-100"));
    }

    #[tokio::test]
    async fn test_charge_task_rejects_zero_amount() {
        let env = TaskEnv {
            key: "order-1".to_string(),
            version: MACHINE_VERSION.to_string(),
        };
        let err = ChargeCardTask
            .run(json!({"amount": 0, "currency": "usd"}), &env)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Terminal(_)));
    }
}
