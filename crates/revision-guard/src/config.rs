//! Revision guard settings.

use std::time::Duration;

/// What the guard does with a queued event once the missing-event hook has
/// been reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MissingEventPolicy {
    /// Keep the event queued and invoke the hook again on every further
    /// timeout.
    #[default]
    KeepWaiting,
    /// Invoke the hook once, drop the event from the queue and fail its
    /// waiter with [`GuardError::MissingEvents`](crate::GuardError::MissingEvents).
    GiveUp,
}

/// Revision guard configuration.
///
/// Reads from environment variables in [`GuardConfig::from_env`]:
/// - `DENORMALIZER_QUEUE_TIMEOUT_MS` (default: `1000`)
/// - `DENORMALIZER_QUEUE_MAX_LOOPS` (default: `3`)
/// - `DENORMALIZER_START_REVISION` (default: unset)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardConfig {
    /// Interval between re-checks of a queued event.
    pub queue_timeout: Duration,
    /// Number of re-checks before the missing-event hook fires.
    pub queue_timeout_max_loops: u32,
    /// Expected revision for aggregates without a checkpoint. When unset, the
    /// first event seen for such an aggregate is admitted whatever its revision.
    pub start_revision_number: Option<u64>,
    pub on_max_loops: MissingEventPolicy,
}

impl GuardConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue_timeout: std::env::var("DENORMALIZER_QUEUE_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.queue_timeout),
            queue_timeout_max_loops: std::env::var("DENORMALIZER_QUEUE_MAX_LOOPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.queue_timeout_max_loops),
            start_revision_number: std::env::var("DENORMALIZER_START_REVISION")
                .ok()
                .and_then(|v| v.parse().ok()),
            on_max_loops: defaults.on_max_loops,
        }
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    pub fn with_max_loops(mut self, loops: u32) -> Self {
        self.queue_timeout_max_loops = loops;
        self
    }

    pub fn with_start_revision(mut self, revision: u64) -> Self {
        self.start_revision_number = Some(revision);
        self
    }

    pub fn with_policy(mut self, policy: MissingEventPolicy) -> Self {
        self.on_max_loops = policy;
        self
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            queue_timeout: Duration::from_millis(1000),
            queue_timeout_max_loops: 3,
            start_revision_number: None,
            on_max_loops: MissingEventPolicy::KeepWaiting,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = GuardConfig::default();
        assert_eq!(config.queue_timeout, Duration::from_millis(1000));
        assert_eq!(config.queue_timeout_max_loops, 3);
        assert_eq!(config.start_revision_number, None);
        assert_eq!(config.on_max_loops, MissingEventPolicy::KeepWaiting);
    }

    #[test]
    fn test_builder_overrides() {
        let config = GuardConfig::default()
            .with_queue_timeout(Duration::from_millis(50))
            .with_max_loops(1)
            .with_start_revision(1)
            .with_policy(MissingEventPolicy::GiveUp);

        assert_eq!(config.queue_timeout, Duration::from_millis(50));
        assert_eq!(config.queue_timeout_max_loops, 1);
        assert_eq!(config.start_revision_number, Some(1));
        assert_eq!(config.on_max_loops, MissingEventPolicy::GiveUp);
    }
}
