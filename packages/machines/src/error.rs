//! Error taxonomy for the durable machine adapter.
//!
//! Every variant here is permanent: retrying cannot fix a disposed
//! instance, a version that no longer exists in the code, or a malformed
//! condition. Transient infrastructure failures never take this shape; they
//! surface as retryable handler errors and are handled by Restate itself.

use restate_sdk::prelude::*;
use thiserror::Error;

/// Terminal status code telling callers the instance has been torn down.
pub const DISPOSED_ERROR_CODE: u16 = 410;

/// Terminal status code for syntactically invalid requests.
pub const BAD_REQUEST_ERROR_CODE: u16 = 400;

/// Terminal status code signalling a non-transient wait rejection
/// (condition unsatisfiable, machine errored).
pub const WAIT_REJECTED_ERROR_CODE: u16 = 412;

/// Terminal status code used when a `wait_for` timeout elapses.
pub const WAIT_TIMEOUT_ERROR_CODE: u16 = 408;

/// Permanent failures surfaced by the adapter's entry points.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("the state machine has been disposed after reaching its final state")]
    Disposed,

    #[error("the state refers to a version {0} which is not present in the code")]
    VersionNotFound(String),

    #[error("actor {0} not found; it may have since stopped")]
    TargetNotFound(String),

    #[error("invalid subscription condition: {0}")]
    InvalidCondition(String),

    #[error("no task sources provided for promise invocation")]
    MissingTaskSource,

    #[error("couldn't find task with src {0}")]
    TaskNotFound(String),

    #[error("machine reported an error: {0}")]
    Machine(String),
}

impl AdapterError {
    fn code(&self) -> u16 {
        match self {
            AdapterError::Disposed => DISPOSED_ERROR_CODE,
            AdapterError::InvalidCondition(_) | AdapterError::MissingTaskSource => {
                BAD_REQUEST_ERROR_CODE
            }
            // Non-retryable configuration / lookup failures.
            AdapterError::VersionNotFound(_)
            | AdapterError::TargetNotFound(_)
            | AdapterError::TaskNotFound(_)
            | AdapterError::Machine(_) => 500,
        }
    }
}

// Handler boundaries convert through `TerminalError` explicitly; a direct
// `From<AdapterError> for HandlerError` would collide with the SDK's
// blanket conversion and, worse, the blanket path would mark these
// permanent failures retryable.
impl From<AdapterError> for TerminalError {
    fn from(err: AdapterError) -> Self {
        TerminalError::new_with_code(err.code(), err.to_string())
    }
}

/// Eager registration failures. These abort construction of the registry,
/// not an individual call.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("state machine ID {0} is used in both the latest and a previous version; IDs must be unique across versions")]
    DuplicateLatestVersion(String),

    #[error("state machine ID {0} is used in two previous versions; IDs must be unique across versions")]
    DuplicatePreviousVersion(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_errors_become_terminal_with_stable_codes() {
        let disposed = TerminalError::from(AdapterError::Disposed);
        assert_eq!(disposed.code(), DISPOSED_ERROR_CODE);

        let bad = TerminalError::from(AdapterError::InvalidCondition("nope".into()));
        assert_eq!(bad.code(), BAD_REQUEST_ERROR_CODE);
        let bad = TerminalError::from(AdapterError::MissingTaskSource);
        assert_eq!(bad.code(), BAD_REQUEST_ERROR_CODE);

        let lookup = TerminalError::from(AdapterError::VersionNotFound("v9".into()));
        assert_eq!(lookup.code(), 500);
    }
}
