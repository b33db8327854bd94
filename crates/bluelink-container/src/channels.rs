//! Channel plumbing between workers, the orchestrator and callers.

use bluelink_core::changes::BlueprintChanges;
use bluelink_core::events::{
    ChildChangesMessage, ChildDeployUpdateMessage, DeployEvent, LinkChangesMessage,
    LinkDeployUpdateMessage, ResourceChangesMessage, ResourceDeployUpdateMessage,
};
use bluelink_core::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub(crate) const CHANNEL_CAPACITY: usize = 128;

/// Sender half handed to every worker spawned for a run.
#[derive(Clone)]
pub(crate) struct WorkerChannels {
    pub resource_tx: mpsc::Sender<ResourceDeployUpdateMessage>,
    pub link_tx: mpsc::Sender<LinkDeployUpdateMessage>,
    pub child_tx: mpsc::Sender<ChildDeployUpdateMessage>,
    /// Child blueprint events forwarded verbatim to the caller.
    pub forward_tx: mpsc::Sender<DeployEvent>,
    pub err_tx: mpsc::Sender<Error>,
}

/// Receiver half consumed by the orchestrator's event loop.
pub(crate) struct OrchestratorChannels {
    pub resource_rx: mpsc::Receiver<ResourceDeployUpdateMessage>,
    pub link_rx: mpsc::Receiver<LinkDeployUpdateMessage>,
    pub child_rx: mpsc::Receiver<ChildDeployUpdateMessage>,
    pub forward_rx: mpsc::Receiver<DeployEvent>,
    pub err_rx: mpsc::Receiver<Error>,
}

pub(crate) fn worker_channels() -> (WorkerChannels, OrchestratorChannels) {
    let (resource_tx, resource_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (link_tx, link_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (child_tx, child_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (forward_tx, forward_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (err_tx, err_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        WorkerChannels {
            resource_tx,
            link_tx,
            child_tx,
            forward_tx,
            err_tx,
        },
        OrchestratorChannels {
            resource_rx,
            link_rx,
            child_rx,
            forward_rx,
            err_rx,
        },
    )
}

/// Caller-facing handle for a deploy or destroy run.
///
/// Events arrive in causal order per element; the stream always terminates
/// with at least one `Finish` event carrying `end_of_stream = true`.
pub struct DeployStream {
    pub events: mpsc::Receiver<DeployEvent>,
    /// Fatal errors (state store failures) that abort the run.
    pub errors: mpsc::Receiver<Error>,
    pub handle: JoinHandle<()>,
}

/// Caller-facing handle for a change staging run.
pub struct ChangeStagingStream {
    pub resource_changes: mpsc::Receiver<ResourceChangesMessage>,
    pub link_changes: mpsc::Receiver<LinkChangesMessage>,
    pub child_changes: mpsc::Receiver<ChildChangesMessage>,
    /// The aggregated change set, sent once staging finishes cleanly.
    pub complete: oneshot::Receiver<BlueprintChanges>,
    pub errors: mpsc::Receiver<Error>,
    pub handle: JoinHandle<()>,
}
