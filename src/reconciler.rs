//! Service-discovery batch reconciliation (C4).
//!
//! Pure with respect to the host list itself — it only ever appends to or
//! omits from a fresh `Vec`, never mutates `H_old` in place — but each
//! `Host` it touches does have interior state, so applying a batch still
//! drives real `mark_*` transitions on the old hosts it keeps.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::HealthCheckConfig;
use crate::host::{Host, HostState};
use crate::traits::ConnectionFactory;
use crate::types::{SdBatch, SdStatus};

/// Result of applying one batch: the next host list plus whether the
/// load balancer's readiness flips (empty <-> non-empty).
pub struct ReconcileOutcome<F: ConnectionFactory> {
    pub hosts: Vec<Arc<Host<F>>>,
    pub ready_transition: bool,
}

/// Applies `batch` to `old_hosts`, producing the next host list.
///
/// `first_batch_after_resubscribe` implements stateless-discoverer
/// reconciliation: when set and every event in the batch is
/// `AVAILABLE`, any host from `old_hosts` whose address isn't mentioned
/// is assumed gone and gracefully closed, rather than carried forward.
pub async fn reconcile<F>(
    old_hosts: &[Arc<Host<F>>],
    batch: SdBatch<F::Address>,
    factory: &Arc<F>,
    health_config: &Option<Arc<HealthCheckConfig>>,
    linear_search_space: usize,
    first_batch_after_resubscribe: bool,
) -> ReconcileOutcome<F>
where
    F: ConnectionFactory,
{
    let was_empty = old_hosts.is_empty();
    let mut ready_transition = false;

    let batch_is_all_available = !batch.is_empty() && batch.iter().all(|e| e.status == SdStatus::Available);
    let available_addresses: std::collections::HashSet<F::Address> = batch
        .iter()
        .filter(|e| e.status == SdStatus::Available)
        .map(|e| e.address.clone())
        .collect();

    let mut pending: HashMap<F::Address, SdStatus> = HashMap::with_capacity(batch.len());
    for event in batch {
        if pending.insert(event.address.clone(), event.status).is_some() {
            log::warn!(
                "duplicate service-discovery event for {:?} in one batch; last wins",
                event.address
            );
        }
    }

    let mut next_hosts = Vec::with_capacity(old_hosts.len() + pending.len());

    for host in old_hosts {
        let Some(status) = pending.remove(host.address()) else {
            // No event this batch: an already-EXPIRED host might have
            // drained since the last batch touched it (connections are
            // only ever released by the caller, so this is the one
            // place that lazily notices).
            if host.state() == HostState::Expired {
                if !host.prune_if_drained().await {
                    next_hosts.push(Arc::clone(host));
                }
            } else {
                next_hosts.push(Arc::clone(host));
            }
            continue;
        };

        match status {
            SdStatus::Available => {
                ready_transition |= was_empty;
                if host.mark_active_if_not_closed().await {
                    next_hosts.push(Arc::clone(host));
                } else {
                    // The old entry is CLOSED and draining on its own;
                    // the discoverer still wants this address served.
                    next_hosts.push(Host::with_linear_search_space(
                        host.address().clone(),
                        Arc::clone(factory),
                        health_config.clone(),
                        linear_search_space,
                    ));
                }
            }
            SdStatus::Expired => {
                if !host.mark_expired().await {
                    next_hosts.push(Arc::clone(host));
                }
            }
            SdStatus::Unavailable => {
                host.mark_closed().await;
            }
        }
    }

    // Leftover events: addresses not previously known.
    for (address, status) in pending {
        match status {
            SdStatus::Available => {
                next_hosts.push(Host::with_linear_search_space(
                    address,
                    Arc::clone(factory),
                    health_config.clone(),
                    linear_search_space,
                ));
                ready_transition = true;
            }
            SdStatus::Expired | SdStatus::Unavailable => {
                log::debug!(
                    "{:?} event for unknown address {:?}; nothing to apply it to",
                    status,
                    address
                );
            }
        }
    }

    if first_batch_after_resubscribe && batch_is_all_available {
        let mut reconciled = Vec::with_capacity(next_hosts.len());
        for host in next_hosts {
            if available_addresses.contains(host.address()) {
                reconciled.push(host);
            } else {
                log::info!(
                    "stateless resubscribe reconciliation: closing {:?}, absent from first batch",
                    host.address()
                );
                host.mark_closed().await;
            }
        }
        next_hosts = reconciled;
    }

    if !was_empty && next_hosts.is_empty() {
        ready_transition = true;
    }

    ReconcileOutcome {
        hosts: next_hosts,
        ready_transition,
    }
}
