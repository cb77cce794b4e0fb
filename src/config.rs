//! Health-check configuration (C1).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::traits::{TimeSource, TokioTimeSource};

/// Default bound on the per-host reuse scan (`linear_search_space`) when
/// an embedder doesn't override it via [`crate::balancer::LoadBalancerBuilder`].
pub const DEFAULT_LINEAR_SEARCH_SPACE: usize = 8;

/// Immutable health-check parameter bundle.
///
/// Held as `Option<HealthCheckConfig>` at the call site to represent
/// health checking being turned off entirely — there is no disabled
/// state inside this type itself.
#[derive(Clone)]
pub struct HealthCheckConfig {
    pub failure_threshold: u32,
    pub probe_interval: Duration,
    pub probe_jitter: Duration,
    pub resubscribe_lower: Duration,
    pub resubscribe_upper: Duration,
    pub time_source: Arc<dyn TimeSource>,
}

impl fmt::Debug for HealthCheckConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthCheckConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("probe_interval", &self.probe_interval)
            .field("probe_jitter", &self.probe_jitter)
            .field("resubscribe_lower", &self.resubscribe_lower)
            .field("resubscribe_upper", &self.resubscribe_upper)
            .field("time_source", &"<dyn TimeSource>")
            .finish()
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            probe_interval: Duration::from_secs(30),
            probe_jitter: Duration::ZERO,
            resubscribe_lower: Duration::from_secs(1),
            resubscribe_upper: Duration::from_secs(30),
            time_source: Arc::new(TokioTimeSource::new()),
        }
    }
}

impl HealthCheckConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }
        if self.resubscribe_upper < self.resubscribe_lower {
            return Err(ConfigError::ResubscribeBoundsInverted {
                lower: self.resubscribe_lower,
                upper: self.resubscribe_upper,
            });
        }
        Ok(())
    }
}

/// Plain-data mirror of [`HealthCheckConfig`], for embedders whose own
/// configuration layer deserializes a whole settings file. `HealthCheckConfig`
/// itself can't derive `Deserialize` because it carries a `time_source`
/// trait object that no file format can construct.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HealthCheckParams {
    pub failure_threshold: u32,
    pub probe_interval_ms: u64,
    pub probe_jitter_ms: u64,
    pub resubscribe_lower_ms: u64,
    pub resubscribe_upper_ms: u64,
}

impl Default for HealthCheckParams {
    fn default() -> Self {
        let defaults = HealthCheckConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            probe_interval_ms: defaults.probe_interval.as_millis() as u64,
            probe_jitter_ms: defaults.probe_jitter.as_millis() as u64,
            resubscribe_lower_ms: defaults.resubscribe_lower.as_millis() as u64,
            resubscribe_upper_ms: defaults.resubscribe_upper.as_millis() as u64,
        }
    }
}

impl HealthCheckParams {
    /// Materializes a full `HealthCheckConfig`, plugging in the given
    /// time source since params alone can't carry one.
    pub fn into_config(self, time_source: Arc<dyn TimeSource>) -> HealthCheckConfig {
        HealthCheckConfig {
            failure_threshold: self.failure_threshold,
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            probe_jitter: Duration::from_millis(self.probe_jitter_ms),
            resubscribe_lower: Duration::from_millis(self.resubscribe_lower_ms),
            resubscribe_upper: Duration::from_millis(self.resubscribe_upper_ms),
            time_source,
        }
    }
}
