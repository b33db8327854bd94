//! Error types for Bluelink.

use crate::status::InstanceStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("link not found: {0}")]
    LinkNotFound(String),

    #[error("an id or unique name is required to identify the blueprint instance")]
    MissingInstanceIdentifier,

    #[error("instance {id} already has an operation in progress ({status:?})")]
    InstanceInProgress { id: String, status: InstanceStatus },

    #[error("blueprint cycle detected: {path}")]
    BlueprintCycleDetected { path: String },

    #[error("maximum blueprint nesting depth of {max} exceeded")]
    MaxBlueprintDepthExceeded { max: usize },

    #[error(
        "linked resource templates {template_a} ({len_a} items) and {template_b} ({len_b} items) must expand to the same length"
    )]
    ResourceTemplateLinkLengthMismatch {
        template_a: String,
        template_b: String,
        len_a: usize,
        len_b: usize,
    },

    #[error("reference cycle detected involving element {0}")]
    ReferenceCycleDetected(String),

    #[error("no provider registered for resource type {0}")]
    ProviderNotFound(String),

    #[error("no link implementation registered for {0}")]
    LinkImplementationNotFound(String),

    #[error("failed to resolve child blueprint {include}: {message}")]
    ChildResolveFailed { include: String, message: String },

    #[error("substitution resolution failed for {element}: {message}")]
    ResolveFailed { element: String, message: String },

    #[error("drift check failed: {0}")]
    DriftCheckFailed(String),

    #[error("state store error: {0}")]
    StateStore(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
