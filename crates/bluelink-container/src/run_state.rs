//! Ephemeral per-run deployment state.
//!
//! Owned exclusively by the orchestrator for a single run. Tracks element
//! lifecycles for the readiness computation, link endpoint serialisation and
//! finish accounting. Updated before any persistence so the readiness view
//! stays consistent across the event loop.

use bluelink_core::state::parse_link_name;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// What kind of element an id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ElementKind {
    Resource,
    Link,
    Child,
}

/// Identity of an element within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ElementId {
    pub kind: ElementKind,
    pub name: String,
}

impl ElementId {
    pub fn resource(name: impl Into<String>) -> Self {
        Self {
            kind: ElementKind::Resource,
            name: name.into(),
        }
    }

    pub fn link(name: impl Into<String>) -> Self {
        Self {
            kind: ElementKind::Link,
            name: name.into(),
        }
    }

    pub fn child(name: impl Into<String>) -> Self {
        Self {
            kind: ElementKind::Child,
            name: name.into(),
        }
    }
}

/// Lifecycle of an element within the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ElementLifecycle {
    Pending,
    InProgress,
    /// Provider configuration applied; external stability not yet confirmed.
    ConfigComplete,
    Completed,
    Failed,
    Interrupted,
}

impl ElementLifecycle {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ElementLifecycle::Completed | ElementLifecycle::Failed | ElementLifecycle::Interrupted
        )
    }
}

#[derive(Default)]
struct Inner {
    elements: HashMap<ElementId, ElementLifecycle>,
    /// Resources currently being mutated by an in-flight link.
    busy_endpoints: HashSet<String>,
    /// Links whose endpoints are ready but which are waiting for an endpoint
    /// to free up.
    waiting_links: VecDeque<String>,
    failure_reasons: Vec<String>,
    prepare_duration_ms: Option<f64>,
    expected: usize,
    terminated: usize,
}

/// Mutable bookkeeping for a single orchestration run.
///
/// Interior mutability via a plain mutex: critical sections are short and
/// never held across await points.
#[derive(Default)]
pub(crate) struct DeploymentState {
    inner: Mutex<Inner>,
}

impl DeploymentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_prepare_duration_ms(&self, duration_ms: f64) {
        self.inner.lock().unwrap().prepare_duration_ms = Some(duration_ms);
    }

    pub fn prepare_duration_ms(&self) -> Option<f64> {
        self.inner.lock().unwrap().prepare_duration_ms
    }

    /// Register an element the run will process. Returns the new expected
    /// element count.
    pub fn register(&self, id: ElementId) -> usize {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .elements
            .insert(id, ElementLifecycle::Pending)
            .is_none()
        {
            inner.expected += 1;
        }
        inner.expected
    }

    /// Record an element that is part of the blueprint but not part of this
    /// run's change set. Dependents treat it as already completed.
    pub fn mark_prefinished(&self, id: ElementId) {
        let mut inner = self.inner.lock().unwrap();
        inner.elements.insert(id, ElementLifecycle::Completed);
    }

    pub fn lifecycle(&self, id: &ElementId) -> Option<ElementLifecycle> {
        self.inner.lock().unwrap().elements.get(id).copied()
    }

    pub fn transition(&self, id: &ElementId, lifecycle: ElementLifecycle) {
        let mut inner = self.inner.lock().unwrap();
        inner.elements.insert(id.clone(), lifecycle);
    }

    /// Record a terminal transition for a registered element, accumulating
    /// failure reasons. Returns `(terminated, expected)` after the update.
    pub fn record_terminal(
        &self,
        id: &ElementId,
        lifecycle: ElementLifecycle,
        failure_reasons: &[String],
    ) -> (usize, usize) {
        debug_assert!(lifecycle.is_terminal());
        let mut inner = self.inner.lock().unwrap();
        let previous = inner.elements.insert(id.clone(), lifecycle);
        // Workers emit one terminal message per element; retries surface as
        // non-terminal failures with can_retry set.
        if previous.map(|lc| !lc.is_terminal()).unwrap_or(true) {
            inner.terminated += 1;
        }
        inner
            .failure_reasons
            .extend(failure_reasons.iter().cloned());
        (inner.terminated, inner.expected)
    }

    pub fn is_run_complete(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.terminated >= inner.expected
    }

    pub fn failure_reasons(&self) -> Vec<String> {
        self.inner.lock().unwrap().failure_reasons.clone()
    }

    pub fn has_failures(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.elements.values().any(|lifecycle| {
            matches!(
                lifecycle,
                ElementLifecycle::Failed | ElementLifecycle::Interrupted
            )
        })
    }

    /// Elements currently in flight, for interrupted marking on drain
    /// expiry.
    pub fn in_flight(&self) -> Vec<ElementId> {
        let inner = self.inner.lock().unwrap();
        inner
            .elements
            .iter()
            .filter(|(_, lifecycle)| {
                matches!(
                    lifecycle,
                    ElementLifecycle::InProgress | ElementLifecycle::ConfigComplete
                )
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Try to claim both endpoints of a link for exclusive mutation. When an
    /// endpoint is busy the link is queued and started later via
    /// [`Self::release_link_endpoints`].
    pub fn try_claim_link_endpoints(&self, link_name: &str) -> bool {
        let Some((a, b)) = parse_link_name(link_name) else {
            return false;
        };
        let mut inner = self.inner.lock().unwrap();
        if inner.busy_endpoints.contains(a) || inner.busy_endpoints.contains(b) {
            if !inner.waiting_links.iter().any(|name| name == link_name) {
                inner.waiting_links.push_back(link_name.to_string());
            }
            return false;
        }
        inner.busy_endpoints.insert(a.to_string());
        inner.busy_endpoints.insert(b.to_string());
        true
    }

    /// Release a finished link's endpoints and return queued links that can
    /// now claim both of theirs.
    pub fn release_link_endpoints(&self, link_name: &str) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        if let Some((a, b)) = parse_link_name(link_name) {
            inner.busy_endpoints.remove(a);
            inner.busy_endpoints.remove(b);
        }

        let mut startable = Vec::new();
        let mut still_waiting = VecDeque::new();
        while let Some(waiting) = inner.waiting_links.pop_front() {
            let Some((a, b)) = parse_link_name(&waiting) else {
                continue;
            };
            if inner.busy_endpoints.contains(a) || inner.busy_endpoints.contains(b) {
                still_waiting.push_back(waiting);
            } else {
                inner.busy_endpoints.insert(a.to_string());
                inner.busy_endpoints.insert(b.to_string());
                startable.push(waiting);
            }
        }
        inner.waiting_links = still_waiting;
        startable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluelink_core::state::link_name;

    #[test]
    fn test_finish_accounting() {
        let state = DeploymentState::new();
        state.register(ElementId::resource("a"));
        state.register(ElementId::resource("b"));
        // Duplicate registration does not inflate the expected count.
        assert_eq!(state.register(ElementId::resource("b")), 2);

        let (terminated, expected) =
            state.record_terminal(&ElementId::resource("a"), ElementLifecycle::Completed, &[]);
        assert_eq!((terminated, expected), (1, 2));
        assert!(!state.is_run_complete());

        let reasons = vec!["provider rejected spec".to_string()];
        state.record_terminal(&ElementId::resource("b"), ElementLifecycle::Failed, &reasons);
        assert!(state.is_run_complete());
        assert!(state.has_failures());
        assert_eq!(state.failure_reasons(), reasons);
    }

    #[test]
    fn test_duplicate_terminal_events_counted_once() {
        let state = DeploymentState::new();
        state.register(ElementId::resource("a"));
        state.record_terminal(&ElementId::resource("a"), ElementLifecycle::Completed, &[]);
        let (terminated, expected) =
            state.record_terminal(&ElementId::resource("a"), ElementLifecycle::Completed, &[]);
        assert_eq!((terminated, expected), (1, 1));
    }

    #[test]
    fn test_link_endpoint_serialisation() {
        let state = DeploymentState::new();
        let first = link_name("function", "tableA");
        let second = link_name("function", "tableB");
        let third = link_name("other", "tableC");

        assert!(state.try_claim_link_endpoints(&first));
        // Shares the `function` endpoint with the in-flight link.
        assert!(!state.try_claim_link_endpoints(&second));
        // Disjoint endpoints proceed concurrently.
        assert!(state.try_claim_link_endpoints(&third));

        let startable = state.release_link_endpoints(&first);
        assert_eq!(startable, vec![second]);
    }

    #[test]
    fn test_in_flight_tracking() {
        let state = DeploymentState::new();
        state.register(ElementId::resource("a"));
        state.register(ElementId::child("networking"));
        state.transition(&ElementId::resource("a"), ElementLifecycle::ConfigComplete);
        state.transition(&ElementId::child("networking"), ElementLifecycle::InProgress);

        let mut in_flight = state.in_flight();
        in_flight.sort_by(|x, y| x.name.cmp(&y.name));
        assert_eq!(in_flight.len(), 2);
    }
}
