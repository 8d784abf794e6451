//! The durable state-machine virtual object.
//!
//! One keyed instance per machine, addressed by its external key. Exclusive
//! handlers rebuild the engine from durable state, apply exactly one
//! transition batch, and persist the result; shared handlers read, wait and
//! run task work without blocking the instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use restate_sdk::prelude::*;
use serde_json::Value;

use crate::actor::{instantiate, load_system, MachineOptions};
use crate::conditions::{self, Condition, ConditionOutcome};
use crate::error::{AdapterError, WAIT_REJECTED_ERROR_CODE, WAIT_TIMEOUT_ERROR_CODE};
use crate::lifecycle::{ensure_not_disposed, schedule_disposal_if_final};
use crate::logic::{EventObject, MachineActor, MachineError, MachineSnapshot, SnapshotWithTags};
use crate::promise::{
    TaskEnv, TaskError, PROMISE_REJECT_EVENT, PROMISE_RESOLVE_EVENT,
};
use crate::registry::MachineRegistry;
use crate::system::{ActorSystem, SystemHost};
use crate::types::{
    ActorRef, CheckTagRequest, CheckTagResponse, ChildrenTable, CreateRequest, EmptyRequest,
    EventsTable, ExpireWaitRequest, InvokeTaskRequest, SendRequest, SendResponse,
    SubscribeRequest, SubscriptionsTable, WaitForRequest, STATE_CHILDREN, STATE_DISPOSED,
    STATE_EVENTS, STATE_SNAPSHOT, STATE_SUBSCRIPTIONS, STATE_VERSION,
};

// =============================================================================
// Virtual object definition
// =============================================================================

#[restate_sdk::object]
#[name = "StateMachine"]
pub trait StateMachineObject {
    /// Create (or re-create) the instance and run its initial transition.
    async fn create(req: CreateRequest) -> Result<SnapshotWithTags, HandlerError>;

    /// Deliver one event into the actor tree.
    async fn send(req: SendRequest) -> Result<SendResponse, HandlerError>;

    /// Current persisted snapshot plus live tags.
    async fn snapshot(req: EmptyRequest) -> Result<SnapshotWithTags, HandlerError>;

    /// Register a wait handle against a condition (or settle it immediately).
    async fn subscribe(req: SubscribeRequest) -> Result<(), HandlerError>;

    /// Block the caller until a condition settles, without blocking the
    /// instance.
    #[shared]
    async fn wait_for(req: WaitForRequest) -> Result<SnapshotWithTags, HandlerError>;

    /// Non-blocking tag/finality probe for pollers.
    #[shared]
    async fn check_tag(req: CheckTagRequest) -> Result<CheckTagResponse, HandlerError>;

    /// Run a machine-invoked async task and report its result back as an
    /// event.
    #[shared]
    async fn invoke_promise(req: InvokeTaskRequest) -> Result<Json<Value>, HandlerError>;

    /// Retrying wrapper around `invoke_promise` that guarantees exactly one
    /// resolve/reject event lands in the machine.
    #[shared]
    async fn invoke_promise_retry(req: InvokeTaskRequest) -> Result<(), HandlerError>;

    /// Delayed timeout for a `wait_for` awakeable.
    #[shared]
    async fn expire_wait(req: ExpireWaitRequest) -> Result<(), HandlerError>;

    /// Wipe all durable state, leaving only the disposed marker.
    async fn cleanup_state(req: EmptyRequest) -> Result<(), HandlerError>;
}

pub struct StateMachineObjectImpl {
    registry: Arc<MachineRegistry>,
    options: MachineOptions,
}

impl StateMachineObjectImpl {
    pub fn new(registry: Arc<MachineRegistry>) -> Self {
        Self {
            registry,
            options: MachineOptions::default(),
        }
    }

    pub fn with_options(registry: Arc<MachineRegistry>, options: MachineOptions) -> Self {
        Self { registry, options }
    }

    /// Version pinned to this instance; first contact binds it to the
    /// registry's latest and persists the binding.
    async fn get_or_set_version(&self, ctx: &ObjectContext<'_>) -> Result<String, HandlerError> {
        if let Some(version) = ctx.get::<String>(STATE_VERSION).await? {
            return Ok(version);
        }
        let latest = self.registry.latest_id().to_string();
        ctx.set(STATE_VERSION, latest.clone());
        Ok(latest)
    }
}

// =============================================================================
// Durable host wiring
// =============================================================================

/// [`SystemHost`] over a live object context. Drawing randomness mid-batch
/// would need the context mutably while the bridge holds it shared, so ids
/// derive from a single journaled uuid drawn before the host is built plus
/// a per-invocation counter; replays observe identical values.
struct RestateHost<'a, 'ctx> {
    ctx: &'a ObjectContext<'ctx>,
    seed: String,
    counter: AtomicU64,
}

impl<'a, 'ctx> RestateHost<'a, 'ctx> {
    fn new(ctx: &'a ObjectContext<'ctx>, seed: String) -> Self {
        Self {
            ctx,
            seed,
            counter: AtomicU64::new(0),
        }
    }

    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.seed)
    }
}

impl SystemHost for RestateHost<'_, '_> {
    fn key(&self) -> &str {
        self.ctx.key()
    }

    fn random_id(&self) -> String {
        self.next_id()
    }

    fn random_uuid(&self) -> String {
        self.next_id()
    }

    fn unix_millis(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }

    fn set_events(&self, events: &crate::types::EventsTable) {
        self.ctx.set(STATE_EVENTS, Json(events.clone()));
    }

    fn set_children(&self, children: &crate::types::ChildrenTable) {
        self.ctx.set(STATE_CHILDREN, Json(children.clone()));
    }

    fn send_to_self(&self, request: SendRequest, delay: Option<Duration>) {
        let client = self
            .ctx
            .object_client::<StateMachineObjectClient>(self.ctx.key());
        match delay {
            Some(delay) => {
                client.send(request).send_after(delay);
            }
            None => {
                client.send(request).send();
            }
        }
    }

    fn invoke_task(&self, request: InvokeTaskRequest, retry: bool) {
        let client = self
            .ctx
            .object_client::<StateMachineObjectClient>(self.ctx.key());
        if retry {
            client.invoke_promise_retry(request).send();
        } else {
            client.invoke_promise(request).send();
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

impl StateMachineObject for StateMachineObjectImpl {
    async fn create(
        &self,
        mut ctx: ObjectContext<'_>,
        req: CreateRequest,
    ) -> Result<SnapshotWithTags, HandlerError> {
        tracing::info!(key = %ctx.key(), "creating state machine instance");

        // Explicit re-creation starts from a clean slate and resurrects a
        // disposed key.
        ctx.clear(STATE_VERSION);
        ctx.clear(STATE_SNAPSHOT);
        ctx.clear(STATE_EVENTS);
        ctx.clear(STATE_CHILDREN);
        ctx.clear(STATE_DISPOSED);
        ctx.clear(STATE_SUBSCRIPTIONS);

        let seed = ctx.rand_uuid().simple().to_string();
        let version = self.get_or_set_version(&ctx).await?;
        let logic = self
            .registry
            .resolve(&version)
            .map_err(TerminalError::from)?
            .clone();
        let host = RestateHost::new(&ctx, seed);
        let mut system =
            ActorSystem::new(&host, version.as_str(), EventsTable::new(), ChildrenTable::new());
        let mut actor = instantiate(&ctx, &logic, req.input, &self.options, &mut system).await?;

        actor.start(&mut system).map_err(machine_error)?;

        let snapshot = actor.persisted_snapshot();
        ctx.set(STATE_SNAPSHOT, snapshot.clone());

        schedule_disposal_if_final(&ctx, self.options.final_state_ttl).await?;
        Ok(SnapshotWithTags::with_snapshot(actor.as_ref(), snapshot))
    }

    async fn send(
        &self,
        mut ctx: ObjectContext<'_>,
        req: SendRequest,
    ) -> Result<SendResponse, HandlerError> {
        ensure_not_disposed(ctx.get::<bool>(STATE_DISPOSED).await?)?;

        let seed = ctx.rand_uuid().simple().to_string();
        let version = self.get_or_set_version(&ctx).await?;
        let logic = self
            .registry
            .resolve(&version)
            .map_err(TerminalError::from)?
            .clone();
        let host = RestateHost::new(&ctx, seed);
        let mut system = load_system(&ctx, &host, &version).await?;

        if let Some(scheduled) = &req.scheduled_event {
            let delivery = system.consume_scheduled(scheduled);
            if delivery.is_stale() {
                tracing::info!(
                    key = %ctx.key(),
                    id = %scheduled.id,
                    outcome = ?delivery,
                    "dropping stale scheduled event"
                );
                return Ok(SendResponse { snapshot: None });
            }
        }

        let mut actor = instantiate(&ctx, &logic, None, &self.options, &mut system).await?;

        let mut subscriptions = read_subscriptions(&ctx).await?;
        if let Some(sub) = &req.subscribe {
            let condition: Condition = sub.condition.parse().map_err(TerminalError::from)?;
            let outcome = conditions::evaluate(&condition, actor.as_ref());
            if outcome.is_settled() {
                settle(
                    &ctx,
                    actor.as_ref(),
                    outcome,
                    std::slice::from_ref(&sub.awakeable_id),
                );
            } else {
                subscriptions
                    .entry(sub.condition.clone())
                    .or_default()
                    .awakeables
                    .push(sub.awakeable_id.clone());
                ctx.set(STATE_SUBSCRIPTIONS, Json(subscriptions.clone()));
            }
        }

        actor.start(&mut system).map_err(machine_error)?;
        system
            .relay(
                req.source.as_ref(),
                req.target.as_ref(),
                actor.as_mut(),
                &req.event,
            )
            .map_err(machine_error)?;

        let snapshot = actor.persisted_snapshot();
        ctx.set(STATE_SNAPSHOT, snapshot.clone());

        sweep_subscriptions(&ctx, actor.as_ref(), &mut subscriptions);
        schedule_disposal_if_final(&ctx, self.options.final_state_ttl).await?;

        Ok(SendResponse {
            snapshot: Some(SnapshotWithTags::with_snapshot(actor.as_ref(), snapshot)),
        })
    }

    async fn snapshot(
        &self,
        mut ctx: ObjectContext<'_>,
        _req: EmptyRequest,
    ) -> Result<SnapshotWithTags, HandlerError> {
        ensure_not_disposed(ctx.get::<bool>(STATE_DISPOSED).await?)?;

        let version = effective_version(ctx.get::<String>(STATE_VERSION).await?, &self.registry);
        let logic = self
            .registry
            .resolve(&version)
            .map_err(TerminalError::from)?
            .clone();
        let seed = ctx.rand_uuid().simple().to_string();
        let host = RestateHost::new(&ctx, seed);
        let mut system = load_system(&ctx, &host, &version).await?;
        let actor = instantiate(&ctx, &logic, None, &self.options, &mut system).await?;

        Ok(SnapshotWithTags::of(actor.as_ref()))
    }

    async fn subscribe(
        &self,
        mut ctx: ObjectContext<'_>,
        req: SubscribeRequest,
    ) -> Result<(), HandlerError> {
        ensure_not_disposed(ctx.get::<bool>(STATE_DISPOSED).await?)?;

        let condition: Condition = req.condition.parse().map_err(TerminalError::from)?;
        let version = effective_version(ctx.get::<String>(STATE_VERSION).await?, &self.registry);
        let logic = self
            .registry
            .resolve(&version)
            .map_err(TerminalError::from)?
            .clone();
        let seed = ctx.rand_uuid().simple().to_string();
        let host = RestateHost::new(&ctx, seed);
        let mut system = load_system(&ctx, &host, &version).await?;
        let actor = instantiate(&ctx, &logic, None, &self.options, &mut system).await?;

        let outcome = conditions::evaluate(&condition, actor.as_ref());
        if outcome.is_settled() {
            settle(
                &ctx,
                actor.as_ref(),
                outcome,
                std::slice::from_ref(&req.awakeable_id),
            );
            return Ok(());
        }

        tracing::debug!(
            key = %ctx.key(),
            condition = %req.condition,
            "registering subscription"
        );
        let mut subscriptions = read_subscriptions(&ctx).await?;
        subscriptions
            .entry(req.condition.clone())
            .or_default()
            .awakeables
            .push(req.awakeable_id);
        ctx.set(STATE_SUBSCRIPTIONS, Json(subscriptions));
        Ok(())
    }

    async fn wait_for(
        &self,
        ctx: SharedObjectContext<'_>,
        req: WaitForRequest,
    ) -> Result<SnapshotWithTags, HandlerError> {
        ensure_not_disposed(ctx.get::<bool>(STATE_DISPOSED).await?)?;

        let condition: Condition = req.condition.parse().map_err(TerminalError::from)?;
        let (awakeable_id, awakeable) = ctx.awakeable::<SnapshotWithTags>();

        match req.event {
            // Deliver the event and register the wait handle in the same
            // exclusive invocation, so the event itself cannot race past
            // the registration.
            Some(event) => {
                let mut send = SendRequest::event(event);
                send.subscribe = Some(SubscribeRequest {
                    condition: condition.to_string(),
                    awakeable_id: awakeable_id.clone(),
                });
                ctx.object_client::<StateMachineObjectClient>(ctx.key())
                    .send(send)
                    .send();
            }
            None => {
                ctx.object_client::<StateMachineObjectClient>(ctx.key())
                    .subscribe(SubscribeRequest {
                        condition: condition.to_string(),
                        awakeable_id: awakeable_id.clone(),
                    })
                    .send();
            }
        }

        if let Some(timeout_ms) = req.timeout_ms {
            ctx.object_client::<StateMachineObjectClient>(ctx.key())
                .expire_wait(ExpireWaitRequest {
                    awakeable_id: awakeable_id.clone(),
                    timeout_ms,
                })
                .send_after(Duration::from_millis(timeout_ms));
        }

        match awakeable.await {
            Ok(snapshot) => Ok(snapshot),
            // Settlement rejections come through as generic failures; stamp
            // them with the precondition-failed code so callers can tell
            // them from timeouts.
            Err(err) if err.code() == 500 => Err(TerminalError::new_with_code(
                WAIT_REJECTED_ERROR_CODE,
                err.to_string(),
            )
            .into()),
            Err(err) => Err(err.into()),
        }
    }

    async fn check_tag(
        &self,
        ctx: SharedObjectContext<'_>,
        req: CheckTagRequest,
    ) -> Result<CheckTagResponse, HandlerError> {
        ensure_not_disposed(ctx.get::<bool>(STATE_DISPOSED).await?)?;

        let version = effective_version(ctx.get::<String>(STATE_VERSION).await?, &self.registry);
        let logic = self
            .registry
            .resolve(&version)
            .map_err(TerminalError::from)?
            .clone();
        let snapshot = ctx.get::<MachineSnapshot>(STATE_SNAPSHOT).await?;
        let actor = match snapshot {
            Some(snapshot) => logic.restore(snapshot),
            None => logic.create(None),
        }
        .map_err(machine_error)?;

        let has_tag = req
            .tag
            .as_deref()
            .map(|tag| actor.has_tag(tag))
            .unwrap_or(false);
        Ok(CheckTagResponse {
            has_tag,
            is_final: actor.status().is_final(),
            snapshot: SnapshotWithTags::of(actor.as_ref()),
        })
    }

    async fn invoke_promise(
        &self,
        ctx: SharedObjectContext<'_>,
        req: InvokeTaskRequest,
    ) -> Result<Json<Value>, HandlerError> {
        ensure_not_disposed(ctx.get::<bool>(STATE_DISPOSED).await?)?;

        if req.srcs.is_empty() {
            return Err(TerminalError::from(AdapterError::MissingTaskSource).into());
        }
        // A missing request version predates version stamping.
        let version = effective_version(req.version.clone(), &self.registry);
        let logic = self
            .registry
            .resolve(&version)
            .map_err(TerminalError::from)?
            .clone();
        let task = logic
            .resolve_task(&req.srcs)
            .ok_or_else(|| TerminalError::from(AdapterError::TaskNotFound(req.srcs.join("."))))?;

        tracing::info!(
            key = %ctx.key(),
            srcs = ?req.srcs,
            version = %version,
            "running promise task"
        );

        let env = TaskEnv {
            key: ctx.key().to_string(),
            version,
        };
        let input = req.input.clone();
        // Direct invocations (self present) get a single attempt; the retry
        // wrapper calls back in without a self reference and gets the
        // configured policy.
        let policy = if req.self_ref.is_some() {
            RunRetryPolicy::default().max_attempts(1)
        } else {
            run_retry_policy(self.options.task_retry_policy.as_ref())
        };

        let result = ctx
            .run(|| {
                let task = Arc::clone(&task);
                let env = env.clone();
                let input = input.clone();
                async move {
                    match task.run(input, &env).await {
                        Ok(output) => Ok(Json(output)),
                        Err(TaskError::Terminal(msg)) => Err(TerminalError::new(msg).into()),
                        Err(TaskError::Retryable(msg)) => Err(anyhow::anyhow!(msg).into()),
                    }
                }
            })
            .retry_policy(policy)
            .await;

        match result {
            Ok(output) => {
                if let Some(self_ref) = &req.self_ref {
                    deliver_task_event(
                        &ctx,
                        self_ref,
                        EventObject::with_data(PROMISE_RESOLVE_EVENT, output.0.clone()),
                    );
                }
                // Nothing consumes this response on the event path; it is
                // returned for debugging.
                Ok(output)
            }
            Err(err) => {
                if let Some(self_ref) = &req.self_ref {
                    deliver_task_event(
                        &ctx,
                        self_ref,
                        EventObject::with_data(PROMISE_REJECT_EVENT, Value::String(err.to_string())),
                    );
                }
                Err(err.into())
            }
        }
    }

    async fn invoke_promise_retry(
        &self,
        ctx: SharedObjectContext<'_>,
        req: InvokeTaskRequest,
    ) -> Result<(), HandlerError> {
        ensure_not_disposed(ctx.get::<bool>(STATE_DISPOSED).await?)?;

        let Some(self_ref) = req.self_ref.clone() else {
            return Err(TerminalError::new(
                "invoke_promise_retry requires an originating actor reference",
            )
            .into());
        };

        let call = ctx
            .object_client::<StateMachineObjectClient>(ctx.key())
            .invoke_promise(InvokeTaskRequest {
                self_ref: None,
                srcs: req.srcs,
                input: req.input,
                version: req.version,
            })
            .call()
            .await;

        match call {
            Ok(Json(output)) => deliver_task_event(
                &ctx,
                &self_ref,
                EventObject::with_data(PROMISE_RESOLVE_EVENT, output),
            ),
            Err(err) => deliver_task_event(
                &ctx,
                &self_ref,
                EventObject::with_data(PROMISE_REJECT_EVENT, Value::String(err.to_string())),
            ),
        }
        Ok(())
    }

    async fn expire_wait(
        &self,
        ctx: SharedObjectContext<'_>,
        req: ExpireWaitRequest,
    ) -> Result<(), HandlerError> {
        // Completing an already-settled awakeable is a no-op on the host
        // side, so the late timer needs no bookkeeping.
        ctx.reject_awakeable(
            &req.awakeable_id,
            TerminalError::new_with_code(
                WAIT_TIMEOUT_ERROR_CODE,
                format!("no result after {}ms", req.timeout_ms),
            ),
        );
        Ok(())
    }

    async fn cleanup_state(
        &self,
        ctx: ObjectContext<'_>,
        _req: EmptyRequest,
    ) -> Result<(), HandlerError> {
        tracing::info!(key = %ctx.key(), "disposing state machine instance");
        ctx.clear_all();
        ctx.set(STATE_DISPOSED, true);
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Version governing a read path: the stored binding when present,
/// otherwise the registry's latest. Takes the already-fetched binding and
/// never persists one, so an unpinned instance stays free to bind on its
/// first `create`/`send`.
fn effective_version(stored: Option<String>, registry: &MachineRegistry) -> String {
    stored.unwrap_or_else(|| registry.latest_id().to_string())
}

fn machine_error(err: MachineError) -> HandlerError {
    let adapter = match err {
        MachineError::TargetNotFound { id } => AdapterError::TargetNotFound(id),
        other => AdapterError::Machine(other.to_string()),
    };
    TerminalError::from(adapter).into()
}

fn run_retry_policy(policy: Option<&crate::promise::TaskRetryPolicy>) -> RunRetryPolicy {
    let Some(policy) = policy else {
        return RunRetryPolicy::default();
    };
    let mut run = RunRetryPolicy::default()
        .initial_delay(policy.initial_delay)
        .exponentiation_factor(policy.factor);
    if let Some(max_delay) = policy.max_delay {
        run = run.max_delay(max_delay);
    }
    if let Some(max_attempts) = policy.max_attempts {
        run = run.max_attempts(max_attempts);
    }
    if let Some(max_duration) = policy.max_duration {
        run = run.max_duration(max_duration);
    }
    run
}

/// Self-addressed resolve/reject event from a finished task, relayed to
/// the originating task actor.
fn deliver_task_event(ctx: &SharedObjectContext<'_>, self_ref: &ActorRef, event: EventObject) {
    ctx.object_client::<StateMachineObjectClient>(ctx.key())
        .send(SendRequest {
            event,
            source: Some(self_ref.clone()),
            target: Some(self_ref.clone()),
            scheduled_event: None,
            subscribe: None,
        })
        .send();
}

async fn read_subscriptions(ctx: &ObjectContext<'_>) -> Result<SubscriptionsTable, HandlerError> {
    Ok(ctx
        .get::<Json<SubscriptionsTable>>(STATE_SUBSCRIPTIONS)
        .await?
        .map(|Json(t)| t)
        .unwrap_or_default())
}

/// Complete wait handles for a settled condition.
fn settle(
    ctx: &ObjectContext<'_>,
    actor: &dyn MachineActor,
    outcome: ConditionOutcome,
    awakeables: &[String],
) {
    match outcome {
        ConditionOutcome::Resolve => {
            let payload = SnapshotWithTags::of(actor);
            for awakeable_id in awakeables {
                ctx.resolve_awakeable(awakeable_id, payload.clone());
            }
        }
        ConditionOutcome::Reject(reason) => {
            for awakeable_id in awakeables {
                ctx.reject_awakeable(awakeable_id, TerminalError::new(reason.message()));
            }
        }
        ConditionOutcome::Pending => {}
    }
}

/// Re-evaluate every stored subscription against the post-transition actor
/// and wake the settled ones.
fn sweep_subscriptions(
    ctx: &ObjectContext<'_>,
    actor: &dyn MachineActor,
    subscriptions: &mut SubscriptionsTable,
) {
    if subscriptions.is_empty() {
        return;
    }

    let mut settled = Vec::new();
    for (raw, subscription) in subscriptions.iter() {
        let Ok(condition) = raw.parse::<Condition>() else {
            // Conditions are validated at registration; an unparseable one
            // can only come from a manual state edit.
            tracing::warn!(condition = %raw, "dropping unparseable stored condition");
            settled.push(raw.clone());
            continue;
        };
        let outcome = conditions::evaluate(&condition, actor);
        if !outcome.is_settled() {
            continue;
        }
        tracing::debug!(
            condition = %raw,
            waiters = subscription.awakeables.len(),
            "condition settled; completing wait handles"
        );
        settle(ctx, actor, outcome, &subscription.awakeables);
        settled.push(raw.clone());
    }

    if settled.is_empty() {
        return;
    }
    for key in settled {
        subscriptions.remove(&key);
    }
    ctx.set(STATE_SUBSCRIPTIONS, Json(subscriptions.clone()));
}
