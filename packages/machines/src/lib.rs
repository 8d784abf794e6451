//! Durable hierarchical state machines on Restate.
//!
//! An adapter that runs an opaque transition engine inside a Restate
//! virtual object: one keyed instance per machine, with timers, child
//! actors, async task invocations and external waits all made durable and
//! replay-safe. The engine is a collaborator behind [`logic::MachineLogic`];
//! this crate never computes a transition itself.
//!
//! A deployment wires a [`registry::MachineRegistry`] (latest plus frozen
//! previous machine versions) into [`object::StateMachineObjectImpl`] and,
//! optionally, a [`watcher::MachineWatcherObjectImpl`] side-car, and binds
//! both on a Restate endpoint.

pub mod actor;
pub mod conditions;
pub mod error;
pub mod lifecycle;
pub mod logic;
pub mod object;
pub mod promise;
pub mod registry;
pub mod serde_support;
pub mod system;
pub mod testing;
pub mod types;
pub mod watcher;

pub use actor::MachineOptions;
pub use error::{AdapterError, RegistryError};
pub use logic::{
    EventObject, Inspector, MachineActor, MachineError, MachineLogic, MachineSnapshot,
    MachineStatus, SnapshotWithTags,
};
pub use object::{StateMachineObject, StateMachineObjectImpl};
pub use promise::{PromiseTask, TaskEnv, TaskError, TaskRetryPolicy, TaskSnapshot};
pub use registry::MachineRegistry;
pub use system::{ActorSystem, SystemHost};
pub use types::{ActorRef, CreateRequest, EmptyRequest, SendRequest, WaitForRequest};
pub use watcher::{MachineWatcherObject, MachineWatcherObjectImpl, WatchUntil, WatcherConfig};
