//! Denormalizer configuration.

use std::sync::Arc;
use std::time::Duration;

use common::{EventDefinition, NotificationDefinition};
use revision_guard::GuardConfig;

/// Generates ids for notifications. When unset, the owning collection's
/// repository supplies them.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Denormalizer behavior switches.
///
/// Reads from environment variables in [`DenormalizerOptions::from_env`]:
/// - `DENORMALIZER_RETRY_TIMEOUT_MS` (default: `800`)
/// - `DENORMALIZER_CALL_AFTER_COMMIT_DURING_REPLAY` (default: `false`)
/// - `DENORMALIZER_SKIP_AFTER_COMMIT` (default: `false`)
/// - the revision guard variables read by [`GuardConfig::from_env`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenormalizerOptions {
    /// Upper bound of the random wait before retrying after a concurrency
    /// conflict.
    pub retry_on_concurrency_timeout: Duration,
    pub command_rejected_event_name: String,
    pub call_on_after_commit_during_replay: bool,
    pub skip_after_commit: bool,
    pub skip_on_event: bool,
    pub skip_on_notification: bool,
    pub skip_on_event_missing: bool,
    pub skip_extend_event: bool,
    pub revision_guard: GuardConfig,
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        })
}

impl DenormalizerOptions {
    /// Loads options from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            retry_on_concurrency_timeout: std::env::var("DENORMALIZER_RETRY_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_on_concurrency_timeout),
            call_on_after_commit_during_replay: env_flag(
                "DENORMALIZER_CALL_AFTER_COMMIT_DURING_REPLAY",
            )
            .unwrap_or(defaults.call_on_after_commit_during_replay),
            skip_after_commit: env_flag("DENORMALIZER_SKIP_AFTER_COMMIT")
                .unwrap_or(defaults.skip_after_commit),
            revision_guard: GuardConfig::from_env(),
            ..defaults
        }
    }

    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_on_concurrency_timeout = timeout;
        self
    }

    pub fn with_command_rejected_event_name(mut self, name: impl Into<String>) -> Self {
        self.command_rejected_event_name = name.into();
        self
    }

    pub fn call_after_commit_during_replay(mut self, enabled: bool) -> Self {
        self.call_on_after_commit_during_replay = enabled;
        self
    }

    pub fn skip_after_commit(mut self, skip: bool) -> Self {
        self.skip_after_commit = skip;
        self
    }

    pub fn skip_on_event(mut self, skip: bool) -> Self {
        self.skip_on_event = skip;
        self
    }

    pub fn skip_on_notification(mut self, skip: bool) -> Self {
        self.skip_on_notification = skip;
        self
    }

    pub fn skip_on_event_missing(mut self, skip: bool) -> Self {
        self.skip_on_event_missing = skip;
        self
    }

    pub fn skip_extend_event(mut self, skip: bool) -> Self {
        self.skip_extend_event = skip;
        self
    }

    pub fn with_revision_guard(mut self, config: GuardConfig) -> Self {
        self.revision_guard = config;
        self
    }
}

impl Default for DenormalizerOptions {
    fn default() -> Self {
        Self {
            retry_on_concurrency_timeout: Duration::from_millis(800),
            command_rejected_event_name: "commandRejected".to_string(),
            call_on_after_commit_during_replay: false,
            skip_after_commit: false,
            skip_on_event: false,
            skip_on_notification: false,
            skip_on_event_missing: false,
            skip_extend_event: false,
            revision_guard: GuardConfig::default(),
        }
    }
}

/// Everything view builders and extenders need to know about their
/// surroundings, shared by the dispatcher and the replay handler.
#[derive(Clone, Default)]
pub struct Settings {
    pub options: DenormalizerOptions,
    pub event: EventDefinition,
    pub notification: NotificationDefinition,
    pub id_generator: Option<IdGenerator>,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("options", &self.options)
            .field("event", &self.event)
            .field("notification", &self.notification)
            .field("id_generator", &self.id_generator.is_some())
            .finish()
    }
}
