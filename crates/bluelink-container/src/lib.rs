//! The Bluelink blueprint container: change staging and deployment
//! orchestration.
//!
//! A [`BlueprintContainer`] wraps one parsed blueprint together with the
//! collaborators the engine consumes (state container, provider registry,
//! resolvers, drift checker, clock). It exposes:
//! - [`BlueprintContainer::stage_changes`]: compute a change set by diffing
//!   the resolved blueprint against persisted state, streamed element by
//!   element.
//! - [`BlueprintContainer::deploy`] / [`BlueprintContainer::destroy`]: apply
//!   a change set by orchestrating provider plugins in dependency order
//!   across parallel groups.
//! - [`BlueprintContainer::check_reconciliation`] /
//!   [`BlueprintContainer::apply_reconciliation`]: inspect and correct
//!   interrupted or drifted state outside the normal deploy flow.
//!
//! There is no global state: every registry, resolver and cache is injected
//! through [`ContainerServices`], and each run gets a fresh ephemeral
//! deployment state.

mod channels;
mod child;
mod config;
mod link;
mod locks;
mod orchestrator;
mod prepare;
mod reconcile;
mod resource;
mod run_state;
mod staging;
mod template;

#[cfg(test)]
mod testutil;

pub use channels::{ChangeStagingStream, DeployStream};
pub use config::{StabilityPollingConfig, MAX_BLUEPRINT_DEPTH};
pub use locks::{ResourceLockGuard, ResourceLockRegistry};
pub use orchestrator::{DeployInput, DestroyInput};
pub use reconcile::{
    ApplyReconciliationInput, AppliedReconciliation, LinkDataUpdate, LinkReconcileResult,
    ReconcileAction, ReconcileActionRequest, ReconcileElement, ReconcileScope, ReconcileType,
    ReconciliationApplyResult, ReconciliationCheckInput, ReconciliationCheckResult,
    ResourceReconcileResult,
};
pub use resource::STABILISE_TIMEOUT_REASON;
pub use staging::StageChangesInput;

use bluelink_core::clock::{Clock, SystemClock};
use bluelink_core::drift::DriftChecker;
use bluelink_core::provider::ProviderRegistry;
use bluelink_core::resolve::{
    BlueprintLoader, BlueprintParams, ChildResolver, LinkOracle, SubstitutionResolver,
};
use bluelink_core::schema::Blueprint;
use bluelink_core::store::StateContainer;
use bluelink_core::{IdGenerator, Result, UuidIdGenerator};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything the engine consumes, injected once and shared by all runs and
/// child containers.
#[derive(Clone)]
pub struct ContainerServices {
    pub state: Arc<dyn StateContainer>,
    pub providers: Arc<dyn ProviderRegistry>,
    pub resolver: Arc<dyn SubstitutionResolver>,
    pub child_resolver: Arc<dyn ChildResolver>,
    pub blueprint_loader: Arc<dyn BlueprintLoader>,
    pub link_oracle: Arc<dyn LinkOracle>,
    pub drift_checker: Option<Arc<dyn DriftChecker>>,
    pub id_generator: Arc<dyn IdGenerator>,
    pub clock: Arc<dyn Clock>,
    pub locks: Arc<ResourceLockRegistry>,
    pub polling: StabilityPollingConfig,
}

impl ContainerServices {
    /// Assemble services with default clock, id generation, lock registry
    /// and polling configuration.
    pub fn new(
        state: Arc<dyn StateContainer>,
        providers: Arc<dyn ProviderRegistry>,
        resolver: Arc<dyn SubstitutionResolver>,
        child_resolver: Arc<dyn ChildResolver>,
        blueprint_loader: Arc<dyn BlueprintLoader>,
        link_oracle: Arc<dyn LinkOracle>,
    ) -> Self {
        Self {
            state,
            providers,
            resolver,
            child_resolver,
            blueprint_loader,
            link_oracle,
            drift_checker: None,
            id_generator: Arc::new(UuidIdGenerator),
            clock: Arc::new(SystemClock),
            locks: Arc::new(ResourceLockRegistry::new()),
            polling: StabilityPollingConfig::default(),
        }
    }

    pub fn with_drift_checker(mut self, drift_checker: Arc<dyn DriftChecker>) -> Self {
        self.drift_checker = Some(drift_checker);
        self
    }

    pub fn with_id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_polling(mut self, polling: StabilityPollingConfig) -> Self {
        self.polling = polling;
        self
    }
}

/// One parsed blueprint plus the services needed to stage and deploy it.
pub struct BlueprintContainer {
    services: Arc<ContainerServices>,
    blueprint: Arc<Blueprint>,
}

impl BlueprintContainer {
    pub fn new(services: ContainerServices, blueprint: Blueprint) -> Self {
        Self {
            services: Arc::new(services),
            blueprint: Arc::new(blueprint),
        }
    }

    /// Container for a child blueprint sharing this container's services.
    pub(crate) fn for_child(services: Arc<ContainerServices>, blueprint: Blueprint) -> Self {
        Self {
            services,
            blueprint: Arc::new(blueprint),
        }
    }

    pub fn blueprint(&self) -> &Blueprint {
        &self.blueprint
    }

    /// Stage changes for this blueprint against the persisted state of an
    /// instance. Validation errors (unknown instance, cycles, depth, template
    /// length mismatches surfaced during expansion) are returned before any
    /// message is streamed.
    pub async fn stage_changes(
        &self,
        input: StageChangesInput,
        params: BlueprintParams,
    ) -> Result<ChangeStagingStream> {
        staging::start_staging(
            self.services.clone(),
            self.blueprint.clone(),
            input,
            params,
        )
        .await
    }

    /// Deploy a staged change set. Returns a stream of [`bluelink_core::events::DeployEvent`]s
    /// terminating with a `Finish` event carrying `end_of_stream = true`.
    pub async fn deploy(
        &self,
        input: DeployInput,
        params: BlueprintParams,
        cancel: CancellationToken,
    ) -> Result<DeployStream> {
        orchestrator::start_deploy(
            self.services.clone(),
            self.blueprint.clone(),
            input,
            params,
            cancel,
        )
        .await
    }

    /// Destroy an instance according to a staged (destroy) change set.
    pub async fn destroy(
        &self,
        input: DestroyInput,
        params: BlueprintParams,
        cancel: CancellationToken,
    ) -> Result<DeployStream> {
        orchestrator::start_destroy(
            self.services.clone(),
            self.blueprint.clone(),
            input,
            params,
            cancel,
        )
        .await
    }

    /// Inspect interrupted or drifted elements and recommend reconciliation
    /// actions.
    pub async fn check_reconciliation(
        &self,
        input: ReconciliationCheckInput,
    ) -> Result<ReconciliationCheckResult> {
        reconcile::check(self.services.clone(), input).await
    }

    /// Apply user-chosen reconciliation actions.
    pub async fn apply_reconciliation(
        &self,
        input: ApplyReconciliationInput,
    ) -> Result<ReconciliationApplyResult> {
        reconcile::apply(self.services.clone(), input).await
    }
}
