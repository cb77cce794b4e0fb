//! Client-side, embeddable load balancer.
//!
//! The core never opens a socket or parses a discovery payload itself —
//! that's all supplied by the embedder through [`traits`]. What's here is
//! the host health state machine, the round-robin selector with a health
//! bias, service-discovery batch reconciliation, and the lifecycle root
//! that ties them together behind an `Arc`.
//!
//! ```text
//! ServiceDiscoverer -> reconciler -> ArcSwap<Vec<Host>> -> HostSelector -> Connection
//! ```

pub mod balancer;
pub mod config;
pub mod error;
pub mod executor;
pub mod host;
pub mod jitter;
pub mod reconciler;
pub mod selector;
pub mod traits;
pub mod types;

pub use balancer::{LoadBalancer, LoadBalancerBuilder};
pub use config::{HealthCheckConfig, HealthCheckParams, DEFAULT_LINEAR_SEARCH_SPACE};
pub use error::{ConfigError, LoadBalancerError};
pub use host::{Host, HostState};
pub use selector::HostSelector;
pub use traits::{
    Address, CancelHandle, Connection, ConnectionFactory, ServiceDiscoverer, TimeSource,
    TokioTimeSource,
};
pub use types::{Readiness, SdBatch, SdEvent, SdStatus};
