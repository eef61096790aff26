//! Tunables for the saga/connection/dispatch stack, loadable from the
//! environment the way the donor's signaling server reads its bind address
//! (see `signaling-server/src/main.rs`), generalized into a single struct so
//! a host application can also construct one in code for tests.

use std::time::Duration;

/// Runtime configuration for a [`crate::connection::Connection`] and its
/// sagas. All fields have spec-mandated or spec-reasonable defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-step deadline for `Await*` states (spec.md §4.1.3). Default 60s.
    pub step_deadline: Duration,
    /// Dispatcher retry cadence for envelopes that can't yet be handled
    /// (spec.md §4.3). Default 500ms.
    pub dispatch_retry_interval: Duration,
    /// Bounds the dispatcher's retry queue so an envelope that will never
    /// become actionable (peer removed, saga never created) doesn't retry
    /// forever. Not specified by spec.md prose; a supplemented ambient
    /// safeguard (see DESIGN.md).
    pub max_dispatch_retries: u32,
    /// Acceptable clock skew for envelope freshness checks (spec.md §6.1,
    /// §7: "freshness timestamps on signaling envelopes").
    pub envelope_max_skew: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            step_deadline: Duration::from_secs(60),
            dispatch_retry_interval: Duration::from_millis(500),
            max_dispatch_retries: 20,
            envelope_max_skew: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Override fields from environment variables, falling back to defaults
    /// for anything unset or unparsable. Variable names:
    /// `MESHLINE_STEP_DEADLINE_SECS`, `MESHLINE_DISPATCH_RETRY_MILLIS`,
    /// `MESHLINE_MAX_DISPATCH_RETRIES`, `MESHLINE_ENVELOPE_MAX_SKEW_SECS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_u64("MESHLINE_STEP_DEADLINE_SECS") {
            config.step_deadline = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("MESHLINE_DISPATCH_RETRY_MILLIS") {
            config.dispatch_retry_interval = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("MESHLINE_MAX_DISPATCH_RETRIES") {
            config.max_dispatch_retries = v as u32;
        }
        if let Some(v) = env_u64("MESHLINE_ENVELOPE_MAX_SKEW_SECS") {
            config.envelope_max_skew = Duration::from_secs(v);
        }

        config
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.step_deadline, Duration::from_secs(60));
        assert_eq!(config.dispatch_retry_interval, Duration::from_millis(500));
    }
}
