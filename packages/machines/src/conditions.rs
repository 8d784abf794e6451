//! Conditions external callers can wait on, and their evaluation rules.
//!
//! A condition is either the literal `done` or `hasTag:<tag>`. Evaluation
//! order matters and is fixed: a machine in error rejects every pending
//! wait, a currently-present tag resolves, a finished machine resolves
//! `done` and rejects everything else, anything else stays pending.

use std::fmt;
use std::str::FromStr;

use crate::error::AdapterError;
use crate::logic::{MachineActor, MachineStatus};

const HAS_TAG_PREFIX: &str = "hasTag:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Done,
    HasTag(String),
}

impl FromStr for Condition {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "done" {
            return Ok(Condition::Done);
        }
        if let Some(tag) = s.strip_prefix(HAS_TAG_PREFIX) {
            return Ok(Condition::HasTag(tag.to_string()));
        }
        Err(AdapterError::InvalidCondition(s.to_string()))
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Done => f.write_str("done"),
            Condition::HasTag(tag) => write!(f, "{HAS_TAG_PREFIX}{tag}"),
        }
    }
}

/// Why pending wait handles for a condition are being rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Errored,
    CompletedUnmet,
}

impl RejectReason {
    pub fn message(self) -> &'static str {
        match self {
            RejectReason::Errored => "state machine returned an error",
            RejectReason::CompletedUnmet => {
                "state machine completed without the condition being met"
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOutcome {
    Pending,
    Resolve,
    Reject(RejectReason),
}

impl ConditionOutcome {
    /// Pending handles are kept; anything else settles the subscription.
    pub fn is_settled(self) -> bool {
        !matches!(self, ConditionOutcome::Pending)
    }
}

/// Evaluate a condition against a live actor. Checked strictly in the
/// order the rules are written; an error status always defeats waits.
pub fn evaluate(condition: &Condition, actor: &dyn MachineActor) -> ConditionOutcome {
    let status = actor.status();

    if status == MachineStatus::Error {
        return ConditionOutcome::Reject(RejectReason::Errored);
    }

    if let Condition::HasTag(tag) = condition {
        if actor.has_tag(tag) {
            return ConditionOutcome::Resolve;
        }
    }

    if status == MachineStatus::Done {
        return match condition {
            Condition::Done => ConditionOutcome::Resolve,
            Condition::HasTag(_) => ConditionOutcome::Reject(RejectReason::CompletedUnmet),
        };
    }

    ConditionOutcome::Pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::{EventObject, MachineError, MachineSnapshot};
    use crate::system::ActorSystem;
    use crate::types::ActorRef;
    use std::collections::BTreeSet;

    struct FakeActor {
        status: MachineStatus,
        tags: BTreeSet<String>,
    }

    impl FakeActor {
        fn new(status: MachineStatus, tags: &[&str]) -> Self {
            Self {
                status,
                tags: tags.iter().map(|t| t.to_string()).collect(),
            }
        }
    }

    impl MachineActor for FakeActor {
        fn start(&mut self, _system: &mut ActorSystem<'_>) -> Result<(), MachineError> {
            Ok(())
        }

        fn deliver(
            &mut self,
            _target_session: Option<&str>,
            _event: &EventObject,
            _system: &mut ActorSystem<'_>,
        ) -> Result<(), MachineError> {
            Ok(())
        }

        fn persisted_snapshot(&self) -> MachineSnapshot {
            let mut snapshot = MachineSnapshot::active(serde_json::Value::Null, serde_json::Value::Null);
            snapshot.status = self.status;
            snapshot
        }

        fn status(&self) -> MachineStatus {
            self.status
        }

        fn tags(&self) -> BTreeSet<String> {
            self.tags.clone()
        }

        fn actor_ref(&self) -> ActorRef {
            ActorRef::new("fake", "fake-session")
        }
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("done".parse::<Condition>().unwrap(), Condition::Done);
        assert_eq!(
            "hasTag:processing".parse::<Condition>().unwrap(),
            Condition::HasTag("processing".into())
        );
        assert_eq!(
            Condition::HasTag("processing".into()).to_string(),
            "hasTag:processing"
        );
        assert!(matches!(
            "nonsense".parse::<Condition>(),
            Err(AdapterError::InvalidCondition(_))
        ));
    }

    #[test]
    fn test_error_status_defeats_every_wait() {
        // Even a currently-present tag loses to an errored machine.
        let actor = FakeActor::new(MachineStatus::Error, &["processing"]);
        assert_eq!(
            evaluate(&Condition::HasTag("processing".into()), &actor),
            ConditionOutcome::Reject(RejectReason::Errored)
        );
        assert_eq!(
            evaluate(&Condition::Done, &actor),
            ConditionOutcome::Reject(RejectReason::Errored)
        );
    }

    #[test]
    fn test_present_tag_resolves_while_active() {
        let actor = FakeActor::new(MachineStatus::Active, &["processing"]);
        assert_eq!(
            evaluate(&Condition::HasTag("processing".into()), &actor),
            ConditionOutcome::Resolve
        );
    }

    #[test]
    fn test_done_resolves_done_and_rejects_missing_tags() {
        let actor = FakeActor::new(MachineStatus::Done, &[]);
        assert_eq!(evaluate(&Condition::Done, &actor), ConditionOutcome::Resolve);
        assert_eq!(
            evaluate(&Condition::HasTag("processing".into()), &actor),
            ConditionOutcome::Reject(RejectReason::CompletedUnmet)
        );
    }

    #[test]
    fn test_done_with_live_tag_still_resolves_tag() {
        // Tag check precedes the done check.
        let actor = FakeActor::new(MachineStatus::Done, &["processing"]);
        assert_eq!(
            evaluate(&Condition::HasTag("processing".into()), &actor),
            ConditionOutcome::Resolve
        );
    }

    #[test]
    fn test_active_without_tag_stays_pending() {
        let actor = FakeActor::new(MachineStatus::Active, &[]);
        assert_eq!(
            evaluate(&Condition::Done, &actor),
            ConditionOutcome::Pending
        );
        assert_eq!(
            evaluate(&Condition::HasTag("processing".into()), &actor),
            ConditionOutcome::Pending
        );
    }
}
