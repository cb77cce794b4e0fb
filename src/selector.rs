//! Round-robin host selector with a health bias (C3).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::LoadBalancerError;
use crate::host::{Host, HostState};
use crate::traits::ConnectionFactory;

/// Stateless except for a single rotating counter shared across every
/// call. Tie-breaking is strictly by that rotating index; there is no
/// random reshuffle.
pub struct HostSelector {
    counter: AtomicU64,
}

impl Default for HostSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSelector {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    pub(crate) fn counter_value(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Picks one host out of `hosts` and returns a connection to it.
    ///
    /// `hosts` is an immutable snapshot; this never mutates the list
    /// itself, only the per-host pool via `Host::select_or_build`.
    pub async fn select<F: ConnectionFactory>(
        &self,
        hosts: &[Arc<Host<F>>],
        filter: &dyn Fn(&F::Connection) -> bool,
        context: &F::Context,
        force_new: bool,
    ) -> Result<Arc<F::Connection>, LoadBalancerError<F::Error>> {
        if hosts.is_empty() {
            return Err(LoadBalancerError::NoHostsAvailable);
        }

        let len = hosts.len();
        // fetch_add wraps on overflow, which is fine: only `c mod len`
        // matters and wrapping preserves that.
        let start = (self.counter.fetch_add(1, Ordering::Relaxed) % len as u64) as usize;

        let mut last_err: Option<LoadBalancerError<F::Error>> = None;

        for step in 0..len {
            let idx = (start + step) % len;
            let host = &hosts[idx];

            if !matches!(host.state(), HostState::Active | HostState::Expired) {
                continue;
            }

            match host.select_or_build(filter, context, force_new).await {
                Ok(conn) => return Ok(conn),
                Err(LoadBalancerError::NoActiveHost) => {
                    // This host raced into UNHEALTHY/CLOSED between the
                    // state() check and the call; try the next one.
                    continue;
                }
                Err(err @ LoadBalancerError::BuildError(_)) => {
                    if force_new {
                        // force_new never falls back to another host on a
                        // build failure; surface it directly.
                        return Err(err);
                    }
                    last_err = Some(err);
                }
                Err(other) => return Err(other),
            }
        }

        if let Some(err) = last_err {
            return Err(err);
        }

        Err(LoadBalancerError::NoActiveHost)
    }
}
