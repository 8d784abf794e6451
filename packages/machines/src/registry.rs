//! Versioned logic resolver.
//!
//! A keyed instance binds to one machine definition for its whole lifetime.
//! The registry holds the latest definition plus any number of frozen prior
//! ones and resolves a persisted version tag back to runnable logic. The
//! registry is sealed at construction; nothing mutates it after startup.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::error::{AdapterError, RegistryError};
use crate::logic::MachineLogic;

pub struct MachineRegistry {
    latest: Arc<dyn MachineLogic>,
    previous: Vec<Arc<dyn MachineLogic>>,
}

// Logic is a trait object; the version ids are the useful part.
impl fmt::Debug for MachineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineRegistry")
            .field("latest", &self.latest.id())
            .field(
                "previous",
                &self.previous.iter().map(|v| v.id()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl MachineRegistry {
    pub fn new(latest: Arc<dyn MachineLogic>) -> Self {
        Self {
            latest,
            previous: Vec::new(),
        }
    }

    /// Build a registry with frozen prior definitions. Duplicate version
    /// identifiers fail eagerly here, not per call.
    pub fn with_previous(
        latest: Arc<dyn MachineLogic>,
        previous: Vec<Arc<dyn MachineLogic>>,
    ) -> Result<Self, RegistryError> {
        let mut seen = BTreeSet::new();
        for version in &previous {
            if version.id() == latest.id() {
                return Err(RegistryError::DuplicateLatestVersion(
                    version.id().to_string(),
                ));
            }
            if !seen.insert(version.id().to_string()) {
                return Err(RegistryError::DuplicatePreviousVersion(
                    version.id().to_string(),
                ));
            }
        }
        Ok(Self { latest, previous })
    }

    pub fn latest_id(&self) -> &str {
        self.latest.id()
    }

    /// Select the definition governing a persisted version tag.
    ///
    /// A missing version means the tag refers to code that no longer
    /// exists; retrying cannot fix that, so the error is terminal.
    pub fn resolve(&self, version: &str) -> Result<&Arc<dyn MachineLogic>, AdapterError> {
        if self.latest.id() == version {
            return Ok(&self.latest);
        }
        self.previous
            .iter()
            .find(|v| v.id() == version)
            .ok_or_else(|| AdapterError::VersionNotFound(version.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::{MachineActor, MachineError, MachineSnapshot};
    use serde_json::Value;

    struct StubLogic(&'static str);

    impl MachineLogic for StubLogic {
        fn id(&self) -> &str {
            self.0
        }

        fn create(&self, _input: Option<Value>) -> Result<Box<dyn MachineActor>, MachineError> {
            Err(MachineError::Internal("stub".into()))
        }

        fn restore(
            &self,
            _snapshot: MachineSnapshot,
        ) -> Result<Box<dyn MachineActor>, MachineError> {
            Err(MachineError::Internal("stub".into()))
        }
    }

    #[test]
    fn test_resolves_latest_and_previous() {
        let registry = MachineRegistry::with_previous(
            Arc::new(StubLogic("v3")),
            vec![Arc::new(StubLogic("v1")), Arc::new(StubLogic("v2"))],
        )
        .unwrap();

        assert_eq!(registry.latest_id(), "v3");
        assert_eq!(registry.resolve("v3").unwrap().id(), "v3");
        assert_eq!(registry.resolve("v1").unwrap().id(), "v1");
        assert_eq!(registry.resolve("v2").unwrap().id(), "v2");
        assert_eq!(
            format!("{registry:?}"),
            r#"MachineRegistry { latest: "v3", previous: ["v1", "v2"] }"#
        );
    }

    #[test]
    fn test_unknown_version_is_terminal() {
        let registry = MachineRegistry::new(Arc::new(StubLogic("v2")));
        let err = registry.resolve("v1").unwrap_err();
        assert!(matches!(err, AdapterError::VersionNotFound(v) if v == "v1"));
    }

    #[test]
    fn test_duplicate_latest_id_fails_eagerly() {
        let err = MachineRegistry::with_previous(
            Arc::new(StubLogic("v2")),
            vec![Arc::new(StubLogic("v2"))],
        )
        .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateLatestVersion("v2".into()));
    }

    #[test]
    fn test_duplicate_previous_ids_fail_eagerly() {
        let err = MachineRegistry::with_previous(
            Arc::new(StubLogic("v3")),
            vec![Arc::new(StubLogic("v1")), Arc::new(StubLogic("v1"))],
        )
        .unwrap_err();
        assert_eq!(err, RegistryError::DuplicatePreviousVersion("v1".into()));
    }
}
