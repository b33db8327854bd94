//! Engine configuration.

use std::time::Duration;

/// Maximum nesting depth for child blueprints. Exceeding it fails the run
/// with `MaxBlueprintDepthExceeded`.
pub const MAX_BLUEPRINT_DEPTH: usize = 10;

/// How resource stabilisation is polled after config-complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilityPollingConfig {
    /// Interval between `has_stabilised` calls.
    pub interval: Duration,
    /// Total time allowed for a resource to stabilise.
    pub timeout: Duration,
}

impl Default for StabilityPollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}
