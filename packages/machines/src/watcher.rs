//! Watch side-car: send an event on behalf of a caller and poll the
//! machine until a configured condition settles.
//!
//! The watcher is its own virtual object keyed identically to the machine
//! instance, so a slow watch never holds the machine's exclusive lock. It
//! only ever talks to the machine through its public handlers.

use std::collections::BTreeMap;
use std::time::Duration;

use restate_sdk::prelude::*;
use serde::{Deserialize, Serialize};

use crate::impl_restate_serde;
use crate::logic::{EventObject, SnapshotWithTags};
use crate::object::StateMachineObjectClient;
use crate::types::{CheckTagRequest, CheckTagResponse};

// =============================================================================
// Configuration
// =============================================================================

/// What a watched event is waiting for. A final machine status always ends
/// the watch, whatever the rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchUntil {
    /// The machine reaches `done` or `error`.
    Final,
    /// The named tag becomes present.
    TagObserved(String),
    /// The named tag, expected to appear while the event is processed,
    /// falls off again.
    TagCleared(String),
    /// The named context key holds a non-null value.
    Result(String),
}

impl WatchUntil {
    /// The tag the poll probe should ask about, where the rule names one.
    fn probe_tag(&self) -> Option<String> {
        match self {
            WatchUntil::TagObserved(tag) | WatchUntil::TagCleared(tag) => Some(tag.clone()),
            WatchUntil::Final | WatchUntil::Result(_) => None,
        }
    }

    /// Whether one `check_tag` probe settles the watch.
    fn satisfied(&self, check: &CheckTagResponse) -> bool {
        if check.is_final {
            return true;
        }
        match self {
            WatchUntil::Final => false,
            WatchUntil::TagObserved(_) => check.has_tag,
            WatchUntil::TagCleared(_) => !check.has_tag,
            WatchUntil::Result(key) => check
                .snapshot
                .snapshot
                .context
                .get(key)
                .map(|value| !value.is_null())
                .unwrap_or(false),
        }
    }
}

/// Per-deployment watch rules: event type to condition, plus poll timing.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    rules: BTreeMap<String, WatchUntil>,
    poll_interval: Duration,
    timeout: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            rules: BTreeMap::new(),
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
        }
    }
}

impl WatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, event_type: impl Into<String>, until: WatchUntil) -> Self {
        self.rules.insert(event_type.into(), until);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn rule_for(&self, event_type: &str) -> Option<&WatchUntil> {
        self.rules.get(event_type)
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchRequest {
    pub event: EventObject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl_restate_serde!(WatchRequest);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchResult {
    pub timed_out: bool,
    /// Poll count times interval, so replays report identical waits.
    pub waited_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SnapshotWithTags>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl_restate_serde!(WatchResult);

// =============================================================================
// Virtual object definition
// =============================================================================

#[restate_sdk::object]
#[name = "StateMachineWatcher"]
pub trait MachineWatcherObject {
    /// Send an event to the machine with the same key and wait until its
    /// configured condition settles or the timeout elapses.
    async fn send_with_await(req: WatchRequest) -> Result<WatchResult, HandlerError>;
}

pub struct MachineWatcherObjectImpl {
    config: WatcherConfig,
}

impl MachineWatcherObjectImpl {
    pub fn new(config: WatcherConfig) -> Self {
        Self { config }
    }
}

impl MachineWatcherObject for MachineWatcherObjectImpl {
    async fn send_with_await(
        &self,
        ctx: ObjectContext<'_>,
        req: WatchRequest,
    ) -> Result<WatchResult, HandlerError> {
        let Some(until) = self.config.rule_for(&req.event.event_type) else {
            // Missing rules are a deployment configuration error, never
            // retryable.
            return Err(TerminalError::new_with_code(
                crate::error::BAD_REQUEST_ERROR_CODE,
                format!("no watch rule configured for event {}", req.event.event_type),
            )
            .into());
        };

        let interval = req
            .interval_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.poll_interval);
        let timeout = req
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.timeout);
        let probe = CheckTagRequest {
            tag: until.probe_tag(),
        };

        tracing::info!(
            key = %ctx.key(),
            event = %req.event.event_type,
            rule = ?until,
            "watching event"
        );

        ctx.object_client::<StateMachineObjectClient>(ctx.key())
            .send(crate::types::SendRequest::event(req.event.clone()))
            .send();

        let mut waited = Duration::ZERO;
        loop {
            ctx.sleep(interval).await?;
            waited += interval;

            match ctx
                .object_client::<StateMachineObjectClient>(ctx.key())
                .check_tag(probe.clone())
                .call()
                .await
            {
                Ok(check) if until.satisfied(&check) => {
                    return Ok(WatchResult {
                        timed_out: false,
                        waited_ms: waited.as_millis() as u64,
                        result: Some(check.snapshot),
                        error: None,
                    });
                }
                Ok(_) => {}
                Err(err) => {
                    // The instance may still be materializing; keep polling
                    // until the timeout says otherwise.
                    tracing::warn!(key = %ctx.key(), error = %err, "check_tag probe failed");
                }
            }

            if waited >= timeout {
                return Ok(WatchResult {
                    timed_out: true,
                    waited_ms: waited.as_millis() as u64,
                    result: None,
                    error: Some(format!(
                        "timeout after {}ms waiting for event {} on key {}",
                        timeout.as_millis(),
                        req.event.event_type,
                        ctx.key()
                    )),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::{MachineSnapshot, MachineStatus};
    use serde_json::json;

    fn check(status: MachineStatus, has_tag: bool, context: serde_json::Value) -> CheckTagResponse {
        let mut snapshot = MachineSnapshot::active(json!("working"), context);
        snapshot.status = status;
        CheckTagResponse {
            has_tag,
            is_final: status.is_final(),
            snapshot: SnapshotWithTags {
                snapshot,
                tags: vec![],
            },
        }
    }

    #[test]
    fn test_final_rule_waits_for_terminal_status() {
        let rule = WatchUntil::Final;
        assert!(!rule.satisfied(&check(MachineStatus::Active, false, json!({}))));
        assert!(rule.satisfied(&check(MachineStatus::Done, false, json!({}))));
        assert!(rule.satisfied(&check(MachineStatus::Error, false, json!({}))));
    }

    #[test]
    fn test_tag_rules() {
        let observed = WatchUntil::TagObserved("processing".into());
        assert!(!observed.satisfied(&check(MachineStatus::Active, false, json!({}))));
        assert!(observed.satisfied(&check(MachineStatus::Active, true, json!({}))));

        let cleared = WatchUntil::TagCleared("processing".into());
        assert!(!cleared.satisfied(&check(MachineStatus::Active, true, json!({}))));
        assert!(cleared.satisfied(&check(MachineStatus::Active, false, json!({}))));
    }

    #[test]
    fn test_result_rule_checks_context_key() {
        let rule = WatchUntil::Result("receipt".into());
        assert!(!rule.satisfied(&check(MachineStatus::Active, false, json!({}))));
        assert!(!rule.satisfied(&check(
            MachineStatus::Active,
            false,
            json!({"receipt": null})
        )));
        assert!(rule.satisfied(&check(
            MachineStatus::Active,
            false,
            json!({"receipt": "r-1"})
        )));
    }

    #[test]
    fn test_finality_ends_any_watch() {
        let rule = WatchUntil::TagObserved("processing".into());
        assert!(rule.satisfied(&check(MachineStatus::Done, false, json!({}))));
    }

    #[test]
    fn test_config_rule_lookup() {
        let config = WatcherConfig::new()
            .rule("START", WatchUntil::Final)
            .rule("SYNC", WatchUntil::TagCleared("sync".into()));
        assert_eq!(config.rule_for("START"), Some(&WatchUntil::Final));
        assert!(config.rule_for("UNKNOWN").is_none());
    }
}
