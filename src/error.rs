//! Error taxonomy.

use thiserror::Error;

/// Raised by [`crate::config::HealthCheckConfig::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failure_threshold must be at least 1")]
    ZeroFailureThreshold,

    #[error("resubscribe_upper ({upper:?}) must not be less than resubscribe_lower ({lower:?})")]
    ResubscribeBoundsInverted {
        lower: std::time::Duration,
        upper: std::time::Duration,
    },
}

/// Raised by the public balancer API.
#[derive(Debug, Error)]
pub enum LoadBalancerError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    #[error("load balancer has been closed")]
    LoadBalancerClosed,

    #[error("no hosts available")]
    NoHostsAvailable,

    #[error("host is not active")]
    NoActiveHost,

    #[error("connection build failed: {0}")]
    BuildError(#[source] E),
}

impl<E> PartialEq for LoadBalancerError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn eq(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (Self::LoadBalancerClosed, Self::LoadBalancerClosed)
                | (Self::NoHostsAvailable, Self::NoHostsAvailable)
                | (Self::NoActiveHost, Self::NoActiveHost)
        )
    }
}
