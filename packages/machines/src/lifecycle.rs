//! Final-state retention and disposal.
//!
//! A finished instance keeps its state readable for a configurable TTL,
//! then a delayed self-sent `cleanup_state` wipes everything and leaves a
//! single `disposed` marker so later calls fail with a permanent 410.

use std::time::Duration;

use restate_sdk::prelude::*;

use crate::error::AdapterError;
use crate::logic::{MachineSnapshot, MachineStatus};
use crate::object::StateMachineObjectClient;
use crate::types::{EmptyRequest, STATE_SNAPSHOT};

/// Fail permanently when the instance has already been disposed. Takes the
/// fetched marker so exclusive and shared contexts share one guard.
pub(crate) fn ensure_not_disposed(disposed: Option<bool>) -> Result<(), TerminalError> {
    if disposed.unwrap_or(false) {
        return Err(AdapterError::Disposed.into());
    }
    Ok(())
}

/// Whether a disposal should be scheduled for the given persisted status.
///
/// Only `done` counts: errored instances stay inspectable until operators
/// deal with them, and `stopped`/`active` instances are still in flight.
pub(crate) fn should_dispose(status: Option<MachineStatus>, ttl: Option<Duration>) -> bool {
    ttl.is_some() && status == Some(MachineStatus::Done)
}

/// Schedule the delayed `cleanup_state` when the instance just reached its
/// final state. Idempotent at delivery: cleaning an already-clean instance
/// only rewrites the `disposed` marker.
pub(crate) async fn schedule_disposal_if_final(
    ctx: &ObjectContext<'_>,
    ttl: Option<Duration>,
) -> Result<(), HandlerError> {
    let status = ctx
        .get::<MachineSnapshot>(STATE_SNAPSHOT)
        .await?
        .map(|s| s.status);
    let Some(ttl) = ttl else { return Ok(()) };
    if !should_dispose(status, Some(ttl)) {
        return Ok(());
    }

    tracing::info!(
        key = %ctx.key(),
        ttl_secs = ttl.as_secs(),
        "machine finished; scheduling state cleanup"
    );
    ctx.object_client::<StateMachineObjectClient>(ctx.key())
        .cleanup_state(EmptyRequest {})
        .send_after(ttl);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_done_instances_get_disposed() {
        let ttl = Some(Duration::from_secs(60));
        assert!(should_dispose(Some(MachineStatus::Done), ttl));
        assert!(!should_dispose(Some(MachineStatus::Error), ttl));
        assert!(!should_dispose(Some(MachineStatus::Active), ttl));
        assert!(!should_dispose(Some(MachineStatus::Stopped), ttl));
        assert!(!should_dispose(None, ttl));
    }

    #[test]
    fn test_no_ttl_means_no_disposal() {
        assert!(!should_dispose(Some(MachineStatus::Done), None));
    }

    #[test]
    fn test_disposed_marker_blocks_entry_with_410() {
        let err = ensure_not_disposed(Some(true)).unwrap_err();
        assert_eq!(err.code(), crate::error::DISPOSED_ERROR_CODE);

        assert!(ensure_not_disposed(Some(false)).is_ok());
        assert!(ensure_not_disposed(None).is_ok());
    }
}
