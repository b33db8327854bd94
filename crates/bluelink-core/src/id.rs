//! Identifier generation.

use uuid::Uuid;

/// Generates unique identifiers for instances, resources and links.
///
/// Injected into the container so tests can produce deterministic ids.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Default generator producing UUIDv7 ids (time-ordered, sortable).
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn generate(&self) -> String {
        Uuid::now_v7().to_string()
    }
}
