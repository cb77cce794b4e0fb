//! Per-address state machine and connection pool (C2).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::HealthCheckConfig;
use crate::error::LoadBalancerError;
use crate::jitter::jitter_duration;
use crate::traits::{CancelHandle, Connection, ConnectionFactory};

/// A host's position in the health state machine.
///
/// ```text
///            ACTIVE event            failure_threshold reached
///   -------------------------> ACTIVE ------------------------> UNHEALTHY
///   |                             |  ^                              |
///   |                     UNAVAILABLE|  successful probe             |
///   |                             v  |                              |
///   |                          EXPIRED <----------------------------+
///   |                             |       UNAVAILABLE while unhealthy
///   |                     pool drains (reuse-only, no new builds)
///   |                             v
///   +-------------------------- CLOSED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Active,
    Expired,
    Unhealthy,
    Closed,
}

impl HostState {
    fn to_u8(self) -> u8 {
        match self {
            HostState::Active => 0,
            HostState::Expired => 1,
            HostState::Unhealthy => 2,
            HostState::Closed => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => HostState::Active,
            1 => HostState::Expired,
            2 => HostState::Unhealthy,
            _ => HostState::Closed,
        }
    }
}

struct HostInner<F: ConnectionFactory> {
    state: HostState,
    consecutive_failures: u32,
    connections: Vec<Arc<F::Connection>>,
    probe_handle: Option<CancelHandle>,
}

/// One backend address: its health state, its reusable connection pool,
/// and (when a [`HealthCheckConfig`] is attached) its probe schedule.
///
/// The mutex is held across the `.await` of a connection build or probe
/// attempt, deliberately: a single host must never have two concurrent
/// builds/probes racing its failure counter.
pub struct Host<F: ConnectionFactory> {
    address: F::Address,
    factory: Arc<F>,
    health_config: Option<Arc<HealthCheckConfig>>,
    /// Bounds the reuse scan in [`Host::select_or_build`] to
    /// `min(linear_search_space, pool_size)` connections.
    linear_search_space: usize,
    state_mirror: AtomicU8,
    inner: Mutex<HostInner<F>>,
    /// Back-reference to itself, filled in by [`Arc::new_cyclic`]. Lets a
    /// method that only borrows `&self` (because it runs with the inner
    /// mutex already held) still hand off an owned `Arc<Self>` to a
    /// detached probe task once the guard is dropped, without `Host`
    /// ever holding a strong `Arc` to itself.
    self_weak: std::sync::Weak<Self>,
}

impl<F: ConnectionFactory> Host<F> {
    pub fn new(
        address: F::Address,
        factory: Arc<F>,
        health_config: Option<Arc<HealthCheckConfig>>,
    ) -> Arc<Self> {
        Self::with_linear_search_space(
            address,
            factory,
            health_config,
            crate::config::DEFAULT_LINEAR_SEARCH_SPACE,
        )
    }

    pub fn with_linear_search_space(
        address: F::Address,
        factory: Arc<F>,
        health_config: Option<Arc<HealthCheckConfig>>,
        linear_search_space: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            address,
            factory,
            health_config,
            linear_search_space,
            state_mirror: AtomicU8::new(HostState::Active.to_u8()),
            inner: Mutex::new(HostInner {
                state: HostState::Active,
                consecutive_failures: 0,
                connections: Vec::new(),
                probe_handle: None,
            }),
            self_weak: weak.clone(),
        })
    }

    pub fn address(&self) -> &F::Address {
        &self.address
    }

    /// Lock-free snapshot of the current state, for the selector's hot
    /// path — it must not take the per-host mutex just to decide whether
    /// a host is a selection candidate.
    pub fn state(&self) -> HostState {
        HostState::from_u8(self.state_mirror.load(Ordering::Acquire))
    }

    pub fn is_unhealthy(&self) -> bool {
        self.state() == HostState::Unhealthy
    }

    fn set_state(&self, inner: &mut HostInner<F>, state: HostState) {
        inner.state = state;
        self.state_mirror.store(state.to_u8(), Ordering::Release);
    }

    /// Reuses a live pooled connection passing `filter`, or — unless
    /// `force_new` skips the reuse scan, or the host is `EXPIRED` —
    /// builds a fresh one. `filter` is never applied to a freshly built
    /// connection: a new connection is assumed to satisfy the caller's
    /// intent.
    ///
    /// `EXPIRED` hosts are reuse-only: a build attempt against one
    /// returns [`LoadBalancerError::NoActiveHost`] rather than opening a
    /// new connection to a host the discoverer no longer lists.
    pub async fn select_or_build(
        &self,
        filter: &dyn Fn(&F::Connection) -> bool,
        context: &F::Context,
        force_new: bool,
    ) -> Result<Arc<F::Connection>, LoadBalancerError<F::Error>> {
        let mut inner = self.inner.lock().await;

        if matches!(inner.state, HostState::Closed | HostState::Unhealthy) {
            return Err(LoadBalancerError::NoActiveHost);
        }

        if !force_new {
            inner.connections.retain(|c| c.is_alive());
            // connections is insertion-order LIFO: the front holds the
            // most recently built/reused entries, so the bounded scan
            // below checks them before older ones age out of the window.
            let scan_space = self.linear_search_space.min(inner.connections.len());
            if let Some(conn) = inner.connections[..scan_space]
                .iter()
                .find(|c| filter(c) && c.try_reserve())
            {
                return Ok(Arc::clone(conn));
            }
        }

        if inner.state == HostState::Expired {
            return Err(LoadBalancerError::NoActiveHost);
        }

        match self.factory.connect(&self.address, context).await {
            Ok(conn) => {
                inner.consecutive_failures = 0;
                let conn = Arc::new(conn);
                inner.connections.insert(0, Arc::clone(&conn));
                Ok(conn)
            }
            Err(err) => {
                let became_unhealthy = self.record_failure(&mut inner);
                drop(inner);
                if became_unhealthy {
                    self.trigger_probe();
                }
                Err(LoadBalancerError::BuildError(err))
            }
        }
    }

    /// Bumps the failure counter and, if this crossed `failure_threshold`
    /// for the first time, flips `ACTIVE` to `UNHEALTHY`. Returns whether
    /// that transition just happened, so the caller can start probing
    /// once it has released the inner lock (scheduling a probe needs to
    /// re-acquire it).
    fn record_failure(&self, inner: &mut HostInner<F>) -> bool {
        inner.consecutive_failures += 1;
        let Some(cfg) = &self.health_config else {
            return false;
        };
        if inner.state == HostState::Active && inner.consecutive_failures >= cfg.failure_threshold
        {
            log::warn!(
                "host {:?} crossed failure_threshold ({}), marking unhealthy",
                self.address,
                cfg.failure_threshold
            );
            self.set_state(inner, HostState::Unhealthy);
            true
        } else {
            false
        }
    }

    /// Applies an `ACTIVE` service-discovery event. A `CLOSED` host never
    /// reopens — the discoverer would have to report it as a brand new
    /// address for that. Returns `false` iff the host was `CLOSED`.
    pub async fn mark_active_if_not_closed(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state == HostState::Closed {
            return false;
        }
        if let Some(handle) = inner.probe_handle.take() {
            handle.cancel();
        }
        inner.consecutive_failures = 0;
        self.set_state(&mut inner, HostState::Active);
        true
    }

    /// Applies an `EXPIRED` service-discovery event: the host stops
    /// accepting new builds but keeps serving existing pooled connections
    /// until they drain. If the pool is already empty at this instant,
    /// the host self-closes immediately instead of sitting `EXPIRED`
    /// forever. Returns `true` iff this call closed the host — the
    /// caller then drops it from the published list.
    pub async fn mark_expired(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state == HostState::Closed {
            return true;
        }
        if let Some(handle) = inner.probe_handle.take() {
            handle.cancel();
        }
        inner.connections.retain(|c| c.is_alive());
        if inner.connections.is_empty() {
            self.set_state(&mut inner, HostState::Closed);
            true
        } else {
            self.set_state(&mut inner, HostState::Expired);
            false
        }
    }

    pub async fn mark_closed(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.probe_handle.take() {
            handle.cancel();
        }
        for conn in inner.connections.drain(..) {
            conn.close();
        }
        self.set_state(&mut inner, HostState::Closed);
    }

    /// Called by the reconciler on the "no event for this host" branch.
    /// An `EXPIRED` host whose pool has fully drained (no live
    /// connections left to reuse) has nothing left to do — it
    /// self-transitions to `CLOSED` so the next published host list
    /// omits it, without the reconciler needing a callback from
    /// `Connection` back into `Host`.
    ///
    /// Returns `true` if this call closed the host.
    pub async fn prune_if_drained(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state != HostState::Expired {
            return false;
        }
        inner.connections.retain(|c| c.is_alive());
        if inner.connections.is_empty() {
            self.set_state(&mut inner, HostState::Closed);
            true
        } else {
            false
        }
    }
}

impl<F> Host<F>
where
    F: ConnectionFactory,
    F::Context: Default,
{
    /// Fire-and-forget entry point used from a context that only holds
    /// `&self` (typically right after releasing the inner lock inside
    /// `select_or_build`). Upgrades the weak back-reference and hands the
    /// resulting `Arc` to a detached task — never stores a strong `Arc`
    /// inside `Host` itself, which would create an owning cycle.
    fn trigger_probe(&self) {
        if self.health_config.is_none() {
            return;
        }
        let Some(strong) = self.self_weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            strong.schedule_probe().await;
        });
    }

    /// Schedules the next probe attempt via the injected time source.
    /// Only meaningful when a [`HealthCheckConfig`] is attached; a host
    /// with none never probes. At most one probe is ever in flight: this
    /// is only called right after crossing into `UNHEALTHY`, or
    /// recursively from `run_probe` after the previous attempt finished.
    async fn schedule_probe(self: Arc<Self>) {
        let Some(cfg) = self.health_config.clone() else {
            return;
        };
        let delay = jitter_duration(cfg.probe_interval, cfg.probe_jitter);
        let host = Arc::clone(&self);
        let handle = cfg.time_source.schedule(
            delay,
            Box::pin(async move {
                host.run_probe().await;
            }),
        );
        let mut inner = self.inner.lock().await;
        if inner.state == HostState::Closed {
            handle.cancel();
        } else {
            inner.probe_handle = Some(handle);
        }
    }

    async fn run_probe(self: Arc<Self>) {
        {
            let inner = self.inner.lock().await;
            if inner.state == HostState::Closed {
                return;
            }
        }

        let context = F::Context::default();
        let result = self.factory.connect(&self.address, &context).await;

        {
            let mut inner = self.inner.lock().await;
            if inner.state == HostState::Closed {
                return;
            }
            match result {
                Ok(conn) => {
                    inner.consecutive_failures = 0;
                    inner.connections.insert(0, Arc::new(conn));
                    if inner.state == HostState::Unhealthy {
                        log::info!("host {:?} recovered, marking active", self.address);
                        self.set_state(&mut inner, HostState::Active);
                    }
                    inner.probe_handle = None;
                    return;
                }
                Err(_) => {
                    self.record_failure(&mut inner);
                }
            }
        }

        self.schedule_probe().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("connect failed")]
    struct FakeConnectError;

    struct FakeConnection {
        reserved: AtomicBool,
        alive: AtomicBool,
    }

    impl FakeConnection {
        fn new() -> Self {
            Self {
                reserved: AtomicBool::new(false),
                alive: AtomicBool::new(true),
            }
        }
    }

    impl Connection for FakeConnection {
        fn try_reserve(&self) -> bool {
            self.reserved
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        fail: AtomicBool,
        connect_count: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl ConnectionFactory for FakeFactory {
        type Address = &'static str;
        type Connection = FakeConnection;
        type Context = ();
        type Error = FakeConnectError;

        async fn connect(
            &self,
            _address: &Self::Address,
            _context: &Self::Context,
        ) -> Result<Self::Connection, Self::Error> {
            self.connect_count.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(FakeConnectError)
            } else {
                Ok(FakeConnection::new())
            }
        }
    }

    fn host() -> Arc<Host<FakeFactory>> {
        Host::new("h1", Arc::new(FakeFactory::default()), None)
    }

    #[tokio::test]
    async fn builds_new_connection_when_pool_empty() {
        let h = host();
        let conn = h.select_or_build(&|_: &FakeConnection| true, &(), false).await.unwrap();
        assert!(conn.is_alive());
    }

    #[tokio::test]
    async fn reuses_pooled_connection_before_building() {
        let h = host();
        let first = h.select_or_build(&|_: &FakeConnection| true, &(), false).await.unwrap();
        first.try_reserve(); // simulate release: actually this keeps it reserved
        // release it so the next call can reserve the same one
        first.reserved.store(false, Ordering::SeqCst);
        let second = h.select_or_build(&|_: &FakeConnection| true, &(), false).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn force_new_skips_reuse_scan() {
        let h = host();
        let first = h.select_or_build(&|_: &FakeConnection| true, &(), false).await.unwrap();
        first.reserved.store(false, Ordering::SeqCst);
        let second = h.select_or_build(&|_: &FakeConnection| true, &(), true).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn expired_host_cannot_build_new() {
        let h = host();
        h.mark_expired().await;
        let result = h.select_or_build(&|_: &FakeConnection| true, &(), false).await;
        assert!(matches!(result, Err(LoadBalancerError::NoActiveHost)));
    }

    #[tokio::test]
    async fn expired_host_still_serves_pooled_connection() {
        let h = host();
        let first = h.select_or_build(&|_: &FakeConnection| true, &(), false).await.unwrap();
        first.reserved.store(false, Ordering::SeqCst);
        h.mark_expired().await;
        let reused = h.select_or_build(&|_: &FakeConnection| true, &(), false).await.unwrap();
        assert!(Arc::ptr_eq(&first, &reused));
    }

    #[tokio::test]
    async fn prune_if_drained_closes_expired_host_with_no_live_connections() {
        let h = host();
        let conn = h.select_or_build(&|_: &FakeConnection| true, &(), false).await.unwrap();
        h.mark_expired().await;
        conn.close();
        let pruned = h.prune_if_drained().await;
        assert!(pruned);
        assert_eq!(h.state(), HostState::Closed);
    }

    #[tokio::test]
    async fn prune_if_drained_is_noop_while_connections_are_alive() {
        let h = host();
        let _conn = h.select_or_build(&|_: &FakeConnection| true, &(), false).await.unwrap();
        h.mark_expired().await;
        assert!(!h.prune_if_drained().await);
        assert_eq!(h.state(), HostState::Expired);
    }

    #[tokio::test]
    async fn build_failures_cross_threshold_mark_unhealthy() {
        let factory = Arc::new(FakeFactory::default());
        factory.fail.store(true, Ordering::SeqCst);
        let cfg = Arc::new(HealthCheckConfig {
            failure_threshold: 2,
            ..HealthCheckConfig::default()
        });
        let h = Host::new("h1", factory, Some(cfg));
        assert!(h.select_or_build(&|_: &FakeConnection| true, &(), false).await.is_err());
        assert_eq!(h.state(), HostState::Active);
        assert!(h.select_or_build(&|_: &FakeConnection| true, &(), false).await.is_err());
        assert_eq!(h.state(), HostState::Unhealthy);
    }

    #[tokio::test]
    async fn closed_host_rejects_selection() {
        let h = host();
        h.mark_closed().await;
        let result = h.select_or_build(&|_: &FakeConnection| true, &(), false).await;
        assert!(matches!(result, Err(LoadBalancerError::NoActiveHost)));
    }

    #[tokio::test]
    async fn mark_expired_with_empty_pool_self_closes_immediately() {
        let h = host();
        assert!(h.mark_expired().await);
        assert_eq!(h.state(), HostState::Closed);
    }

    #[tokio::test]
    async fn mark_active_if_not_closed_reports_false_once_closed() {
        let h = host();
        h.mark_closed().await;
        assert!(!h.mark_active_if_not_closed().await);
        assert_eq!(h.state(), HostState::Closed);
    }

    #[tokio::test]
    async fn mark_active_if_not_closed_recovers_from_expired() {
        let h = host();
        let conn = h.select_or_build(&|_: &FakeConnection| true, &(), false).await.unwrap();
        conn.reserved.store(false, Ordering::SeqCst);
        h.mark_expired().await;
        assert_eq!(h.state(), HostState::Expired);
        assert!(h.mark_active_if_not_closed().await);
        assert_eq!(h.state(), HostState::Active);
    }

    #[tokio::test]
    async fn successful_probe_appends_connection_and_recovers_host() {
        let factory = Arc::new(FakeFactory::default());
        factory.fail.store(true, Ordering::SeqCst);
        let cfg = Arc::new(HealthCheckConfig {
            failure_threshold: 1,
            ..HealthCheckConfig::default()
        });
        let h = Host::new("h1", Arc::clone(&factory), Some(cfg));

        assert!(h
            .select_or_build(&|_: &FakeConnection| true, &(), false)
            .await
            .is_err());
        assert_eq!(h.state(), HostState::Unhealthy);

        // Run the probe directly rather than waiting on the scheduled
        // timer; the factory now succeeds.
        factory.fail.store(false, Ordering::SeqCst);
        let attempts_before_probe = factory.connect_count.load(Ordering::SeqCst);
        Arc::clone(&h).run_probe().await;

        assert_eq!(h.state(), HostState::Active);
        let attempts_after_probe = factory.connect_count.load(Ordering::SeqCst);
        assert_eq!(attempts_after_probe, attempts_before_probe + 1);

        // The probe's own connection was appended to the pool, so the
        // next reuse-eligible select finds it without building another.
        let conn = h
            .select_or_build(&|_: &FakeConnection| true, &(), false)
            .await
            .unwrap();
        assert!(conn.is_alive());
        assert_eq!(
            factory.connect_count.load(Ordering::SeqCst),
            attempts_after_probe,
            "probe's connection should have been reused, not rebuilt"
        );
    }
}
