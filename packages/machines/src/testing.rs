//! Recording [`SystemHost`] for exercising machine logic without a
//! running Restate server.
//!
//! Every durable effect the bridge would hand to the host is captured in
//! memory instead, and randomness is a plain counter so assertions can
//! name the ids a run will produce.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::system::SystemHost;
use crate::types::{ChildrenTable, EventsTable, InvokeTaskRequest, SendRequest};

/// A self-addressed message captured by [`RecordingHost`].
#[derive(Debug, Clone)]
pub struct RecordedSend {
    pub request: SendRequest,
    pub delay: Option<Duration>,
}

/// In-memory [`SystemHost`] with deterministic ids (`rand-1`, `rand-2`, ...)
/// and captured effects.
pub struct RecordingHost {
    key: String,
    counter: AtomicU64,
    events: Mutex<Option<EventsTable>>,
    children: Mutex<Option<ChildrenTable>>,
    sends: Mutex<Vec<RecordedSend>>,
    tasks: Mutex<Vec<(InvokeTaskRequest, bool)>>,
}

impl RecordingHost {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            counter: AtomicU64::new(0),
            events: Mutex::new(None),
            children: Mutex::new(None),
            sends: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The most recent `events` table written, or `None` if never written.
    pub fn last_events(&self) -> Option<EventsTable> {
        self.events.lock().unwrap().clone()
    }

    /// The most recent `children` table written, or `None` if never written.
    pub fn last_children(&self) -> Option<ChildrenTable> {
        self.children.lock().unwrap().clone()
    }

    /// All self-addressed messages, in send order.
    pub fn self_sends(&self) -> Vec<RecordedSend> {
        self.sends.lock().unwrap().clone()
    }

    /// All task invocations as `(request, retry)` pairs.
    pub fn task_invocations(&self) -> Vec<(InvokeTaskRequest, bool)> {
        self.tasks.lock().unwrap().clone()
    }
}

impl SystemHost for RecordingHost {
    fn key(&self) -> &str {
        &self.key
    }

    fn random_id(&self) -> String {
        format!("rand-{}", self.next())
    }

    fn random_uuid(&self) -> String {
        format!("uuid-{}", self.next())
    }

    fn unix_millis(&self) -> u64 {
        // Frozen clock; `started_at` is diagnostic only.
        1_700_000_000_000
    }

    fn set_events(&self, events: &EventsTable) {
        *self.events.lock().unwrap() = Some(events.clone());
    }

    fn set_children(&self, children: &ChildrenTable) {
        *self.children.lock().unwrap() = Some(children.clone());
    }

    fn send_to_self(&self, request: SendRequest, delay: Option<Duration>) {
        self.sends.lock().unwrap().push(RecordedSend { request, delay });
    }

    fn invoke_task(&self, request: InvokeTaskRequest, retry: bool) {
        self.tasks.lock().unwrap().push((request, retry));
    }
}
