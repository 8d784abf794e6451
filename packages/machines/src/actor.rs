//! Rehydration of a machine instance from durable state.
//!
//! Every handler that touches the machine rebuilds the same picture: the
//! scheduler/registry bridge from the `events`/`children` tables, then the
//! engine instance from the persisted snapshot (or fresh from input on
//! first contact).

use std::sync::Arc;
use std::time::Duration;

use restate_sdk::prelude::*;
use serde_json::Value;

use crate::logic::{Inspector, MachineActor, MachineLogic, MachineSnapshot};
use crate::promise::TaskRetryPolicy;
use crate::system::{ActorSystem, SystemHost};
use crate::types::{ChildrenTable, EventsTable, STATE_CHILDREN, STATE_EVENTS, STATE_SNAPSHOT};

/// Deployment-wide options for the machine object.
pub struct MachineOptions {
    /// How long a finished instance's state is retained before the delayed
    /// cleanup wipes it. `None` keeps it forever.
    pub final_state_ttl: Option<Duration>,
    /// Retry policy for retried task invocations. `None` leaves retries to
    /// the host's defaults.
    pub task_retry_policy: Option<TaskRetryPolicy>,
    /// Observers attached to every rehydrated instance.
    pub inspectors: Vec<Arc<dyn Inspector>>,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            final_state_ttl: Some(Duration::from_secs(24 * 3600)),
            task_retry_policy: Some(TaskRetryPolicy::default()),
            inspectors: Vec::new(),
        }
    }
}

/// Rebuild the scheduler/registry bridge from the durable tables.
pub(crate) async fn load_system<'h>(
    ctx: &ObjectContext<'_>,
    host: &'h dyn SystemHost,
    version: &str,
) -> Result<ActorSystem<'h>, HandlerError> {
    let events = ctx
        .get::<Json<EventsTable>>(STATE_EVENTS)
        .await?
        .map(|Json(t)| t)
        .unwrap_or_default();
    let children = ctx
        .get::<Json<ChildrenTable>>(STATE_CHILDREN)
        .await?
        .map(|Json(t)| t)
        .unwrap_or_default();
    Ok(ActorSystem::new(host, version, events, children))
}

/// Rebuild the engine instance: restore from the persisted snapshot when
/// one exists, otherwise create it fresh from `input`.
pub(crate) async fn instantiate(
    ctx: &ObjectContext<'_>,
    logic: &Arc<dyn MachineLogic>,
    input: Option<Value>,
    options: &MachineOptions,
    system: &mut ActorSystem<'_>,
) -> Result<Box<dyn MachineActor>, HandlerError> {
    for inspector in &options.inspectors {
        system.attach_inspector(Arc::clone(inspector));
    }
    let snapshot = ctx.get::<MachineSnapshot>(STATE_SNAPSHOT).await?;
    let actor = match snapshot {
        Some(snapshot) => logic.restore(snapshot),
        None => logic.create(input),
    }
    .map_err(|e| TerminalError::new(e.to_string()))?;
    Ok(actor)
}
