//! Plain data types shared across modules.

use std::fmt;

use crate::traits::Address;

/// One host's membership status within a service-discovery batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdStatus {
    Available,
    Expired,
    Unavailable,
}

/// A single host's reported status, as emitted by a [`crate::traits::ServiceDiscoverer`].
#[derive(Debug, Clone)]
pub struct SdEvent<A: Address> {
    pub address: A,
    pub status: SdStatus,
}

impl<A: Address> SdEvent<A> {
    pub fn new(address: A, status: SdStatus) -> Self {
        Self { address, status }
    }
}

/// One discovery update: the full list of events the discoverer wants
/// applied for this tick. Whether this is a delta or a full snapshot is
/// determined by the reconciler from the `is_stateless` flag the
/// balancer attaches after a resubscribe, not by this type itself.
pub type SdBatch<A> = Vec<SdEvent<A>>;

/// Whether the load balancer currently has at least one host it could
/// hand out a connection from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady,
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Ready => f.write_str("ready"),
            Readiness::NotReady => f.write_str("not-ready"),
        }
    }
}
