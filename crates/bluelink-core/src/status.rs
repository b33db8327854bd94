//! Status enums for the instance, resource and link state machines.
//!
//! Each element carries two layers: a coarse status for high-level UIs and a
//! precise status driving the internal state machines.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a blueprint instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Unknown,
    Preparing,
    Deploying,
    Deployed,
    DeployFailed,
    Updating,
    Updated,
    UpdateFailed,
    Destroying,
    Destroyed,
    DestroyFailed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Deployed
                | InstanceStatus::DeployFailed
                | InstanceStatus::Updated
                | InstanceStatus::UpdateFailed
                | InstanceStatus::Destroyed
                | InstanceStatus::DestroyFailed
                | InstanceStatus::RolledBack
                | InstanceStatus::RollbackFailed
        )
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Preparing
                | InstanceStatus::Deploying
                | InstanceStatus::Updating
                | InstanceStatus::Destroying
                | InstanceStatus::RollingBack
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            InstanceStatus::DeployFailed
                | InstanceStatus::UpdateFailed
                | InstanceStatus::DestroyFailed
                | InstanceStatus::RollbackFailed
        )
    }
}

impl Default for InstanceStatus {
    fn default() -> Self {
        InstanceStatus::Unknown
    }
}

/// The operation an element is going through in the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementOperation {
    Create,
    Update,
    Destroy,
}

/// Coarse resource status for high-level consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceStatus {
    Unknown,
    Creating,
    Created,
    CreateFailed,
    Updating,
    Updated,
    UpdateFailed,
    Destroying,
    Destroyed,
    DestroyFailed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl Default for ResourceStatus {
    fn default() -> Self {
        ResourceStatus::Unknown
    }
}

impl ResourceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ResourceStatus::Unknown
                | ResourceStatus::Creating
                | ResourceStatus::Updating
                | ResourceStatus::Destroying
                | ResourceStatus::RollingBack
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ResourceStatus::CreateFailed
                | ResourceStatus::UpdateFailed
                | ResourceStatus::DestroyFailed
                | ResourceStatus::RollbackFailed
        )
    }
}

/// Precise resource status driving the deployment state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreciseResourceStatus {
    Unknown,
    Creating,
    CreateConfigComplete,
    Created,
    CreateFailed,
    CreateInterrupted,
    CreateRollingBack,
    CreateRolledBack,
    CreateRollbackFailed,
    Updating,
    UpdateConfigComplete,
    Updated,
    UpdateFailed,
    UpdateInterrupted,
    UpdateRollingBack,
    UpdateRolledBack,
    UpdateRollbackFailed,
    Destroying,
    Destroyed,
    DestroyFailed,
    DestroyInterrupted,
    DestroyRollingBack,
    DestroyRolledBack,
    DestroyRollbackFailed,
}

impl Default for PreciseResourceStatus {
    fn default() -> Self {
        PreciseResourceStatus::Unknown
    }
}

impl PreciseResourceStatus {
    /// The in-progress status for the given operation.
    pub fn in_progress(op: ElementOperation) -> Self {
        match op {
            ElementOperation::Create => PreciseResourceStatus::Creating,
            ElementOperation::Update => PreciseResourceStatus::Updating,
            ElementOperation::Destroy => PreciseResourceStatus::Destroying,
        }
    }

    /// The config-complete status for the given operation. Destroys have no
    /// config-complete phase and go straight to Destroyed.
    pub fn config_complete(op: ElementOperation) -> Self {
        match op {
            ElementOperation::Create => PreciseResourceStatus::CreateConfigComplete,
            ElementOperation::Update => PreciseResourceStatus::UpdateConfigComplete,
            ElementOperation::Destroy => PreciseResourceStatus::Destroyed,
        }
    }

    pub fn succeeded(op: ElementOperation) -> Self {
        match op {
            ElementOperation::Create => PreciseResourceStatus::Created,
            ElementOperation::Update => PreciseResourceStatus::Updated,
            ElementOperation::Destroy => PreciseResourceStatus::Destroyed,
        }
    }

    pub fn failed(op: ElementOperation) -> Self {
        match op {
            ElementOperation::Create => PreciseResourceStatus::CreateFailed,
            ElementOperation::Update => PreciseResourceStatus::UpdateFailed,
            ElementOperation::Destroy => PreciseResourceStatus::DestroyFailed,
        }
    }

    pub fn interrupted(op: ElementOperation) -> Self {
        match op {
            ElementOperation::Create => PreciseResourceStatus::CreateInterrupted,
            ElementOperation::Update => PreciseResourceStatus::UpdateInterrupted,
            ElementOperation::Destroy => PreciseResourceStatus::DestroyInterrupted,
        }
    }

    pub fn is_config_complete(&self) -> bool {
        matches!(
            self,
            PreciseResourceStatus::CreateConfigComplete
                | PreciseResourceStatus::UpdateConfigComplete
        )
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            PreciseResourceStatus::CreateInterrupted
                | PreciseResourceStatus::UpdateInterrupted
                | PreciseResourceStatus::DestroyInterrupted
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            PreciseResourceStatus::CreateFailed
                | PreciseResourceStatus::UpdateFailed
                | PreciseResourceStatus::DestroyFailed
                | PreciseResourceStatus::CreateRollbackFailed
                | PreciseResourceStatus::UpdateRollbackFailed
                | PreciseResourceStatus::DestroyRollbackFailed
        )
    }

    /// The coarse status this precise status projects onto.
    pub fn coarse(&self) -> ResourceStatus {
        match self {
            PreciseResourceStatus::Unknown => ResourceStatus::Unknown,
            PreciseResourceStatus::Creating | PreciseResourceStatus::CreateConfigComplete => {
                ResourceStatus::Creating
            }
            PreciseResourceStatus::Created => ResourceStatus::Created,
            PreciseResourceStatus::CreateFailed | PreciseResourceStatus::CreateInterrupted => {
                ResourceStatus::CreateFailed
            }
            PreciseResourceStatus::Updating | PreciseResourceStatus::UpdateConfigComplete => {
                ResourceStatus::Updating
            }
            PreciseResourceStatus::Updated => ResourceStatus::Updated,
            PreciseResourceStatus::UpdateFailed | PreciseResourceStatus::UpdateInterrupted => {
                ResourceStatus::UpdateFailed
            }
            PreciseResourceStatus::Destroying => ResourceStatus::Destroying,
            PreciseResourceStatus::Destroyed => ResourceStatus::Destroyed,
            PreciseResourceStatus::DestroyFailed | PreciseResourceStatus::DestroyInterrupted => {
                ResourceStatus::DestroyFailed
            }
            PreciseResourceStatus::CreateRollingBack
            | PreciseResourceStatus::UpdateRollingBack
            | PreciseResourceStatus::DestroyRollingBack => ResourceStatus::RollingBack,
            PreciseResourceStatus::CreateRolledBack
            | PreciseResourceStatus::UpdateRolledBack
            | PreciseResourceStatus::DestroyRolledBack => ResourceStatus::RolledBack,
            PreciseResourceStatus::CreateRollbackFailed
            | PreciseResourceStatus::UpdateRollbackFailed
            | PreciseResourceStatus::DestroyRollbackFailed => ResourceStatus::RollbackFailed,
        }
    }
}

/// Coarse link status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkStatus {
    Unknown,
    Creating,
    Created,
    CreateFailed,
    Updating,
    Updated,
    UpdateFailed,
    Destroying,
    Destroyed,
    DestroyFailed,
}

impl Default for LinkStatus {
    fn default() -> Self {
        LinkStatus::Unknown
    }
}

impl LinkStatus {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            LinkStatus::CreateFailed | LinkStatus::UpdateFailed | LinkStatus::DestroyFailed
        )
    }
}

/// Precise link status following the three-stage A / B / intermediaries
/// lifecycle. Destroys run the stages in reverse; the operation itself is
/// carried by the coarse [`LinkStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreciseLinkStatus {
    Unknown,
    UpdatingResourceA,
    ResourceAUpdated,
    ResourceAUpdateFailed,
    ResourceAUpdateInterrupted,
    UpdatingResourceB,
    ResourceBUpdated,
    ResourceBUpdateFailed,
    ResourceBUpdateInterrupted,
    UpdatingIntermediaryResources,
    IntermediaryResourcesUpdated,
    IntermediaryResourceUpdateFailed,
    IntermediaryResourceUpdateInterrupted,
    Complete,
}

impl Default for PreciseLinkStatus {
    fn default() -> Self {
        PreciseLinkStatus::Unknown
    }
}

impl PreciseLinkStatus {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            PreciseLinkStatus::ResourceAUpdateFailed
                | PreciseLinkStatus::ResourceBUpdateFailed
                | PreciseLinkStatus::IntermediaryResourceUpdateFailed
        )
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            PreciseLinkStatus::ResourceAUpdateInterrupted
                | PreciseLinkStatus::ResourceBUpdateInterrupted
                | PreciseLinkStatus::IntermediaryResourceUpdateInterrupted
        )
    }
}

/// Status of an intermediary resource owned by a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntermediaryResourceStatus {
    Unknown,
    Created,
    CreateFailed,
    Updated,
    UpdateFailed,
    Destroyed,
    DestroyFailed,
}

impl Default for IntermediaryResourceStatus {
    fn default() -> Self {
        IntermediaryResourceStatus::Unknown
    }
}
