//! Load balancer lifecycle root (C5).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use futures_util::StreamExt;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::config::{HealthCheckConfig, DEFAULT_LINEAR_SEARCH_SPACE};
use crate::error::{ConfigError, LoadBalancerError};
use crate::host::{Host, HostState};
use crate::jitter::uniform_duration;
use crate::reconciler::reconcile;
use crate::executor::SingleWriterExecutor;
use crate::selector::HostSelector;
use crate::traits::ConnectionFactory;
use crate::traits::ServiceDiscoverer;
use crate::types::Readiness;

/// Sentinel value for `next_resubscribe_time_ms` marking "a resubscribe
/// is currently in flight", guarding the CAS-based resubscribe policy.
const RESUBSCRIBING: u64 = u64::MAX;

/// Client-side load balancer: owns the live host set, serves
/// `select_connection`/`new_connection`, and reconciles an injected
/// service-discovery stream against it.
pub struct LoadBalancer<F, D>
where
    F: ConnectionFactory,
    D: ServiceDiscoverer<Address = F::Address>,
{
    factory: Arc<F>,
    discoverer: Arc<D>,
    health_config: Option<Arc<HealthCheckConfig>>,
    linear_search_space: usize,
    hosts: ArcSwap<Vec<Arc<Host<F>>>>,
    selector: HostSelector,
    executor: SingleWriterExecutor,
    /// `None` once the readiness stream has been deliberately ended (see
    /// `terminate_readiness_stream`) — dropping the sender is what makes
    /// every subscriber's next `changed()` call observe the termination.
    readiness_tx: Mutex<Option<watch::Sender<Readiness>>>,
    readiness_rx: watch::Receiver<Readiness>,
    is_closed: AtomicBool,
    next_resubscribe_time_ms: AtomicU64,
    resubscribe_notify: Notify,
    sd_loop_handle: Mutex<Option<JoinHandle<()>>>,
    /// Set when the SD stream ended/errored with health checking
    /// disabled: without health checking there's no resubscribe tick to
    /// wait for, so the stream terminates for good instead.
    sd_terminated: AtomicBool,
}

impl<F, D> LoadBalancer<F, D>
where
    F: ConnectionFactory,
    D: ServiceDiscoverer<Address = F::Address>,
{
    pub fn new(
        factory: Arc<F>,
        discoverer: Arc<D>,
        health_config: Option<HealthCheckConfig>,
        linear_search_space: usize,
    ) -> Arc<Self> {
        let health_config = health_config.map(Arc::new);
        let (readiness_tx, readiness_rx) = watch::channel(Readiness::NotReady);

        let lb = Arc::new(Self {
            factory,
            discoverer,
            health_config,
            linear_search_space,
            hosts: ArcSwap::new(Arc::new(Vec::new())),
            selector: HostSelector::new(),
            executor: SingleWriterExecutor::new(),
            readiness_tx: Mutex::new(Some(readiness_tx)),
            readiness_rx,
            is_closed: AtomicBool::new(false),
            next_resubscribe_time_ms: AtomicU64::new(0),
            resubscribe_notify: Notify::new(),
            sd_loop_handle: Mutex::new(None),
            sd_terminated: AtomicBool::new(false),
        });

        let handle = tokio::spawn(Arc::clone(&lb).run_sd_loop());
        *lb.sd_loop_handle.lock().unwrap() = Some(handle);
        lb
    }

    pub fn builder(factory: Arc<F>, discoverer: Arc<D>) -> LoadBalancerBuilder<F, D> {
        LoadBalancerBuilder::new(factory, discoverer)
    }

    /// Picks a host from the current snapshot and reuses or builds a
    /// connection on it, subject to `filter`. Never builds a connection
    /// the caller can't use: `filter` only gates reused connections —
    /// a freshly built one is assumed to satisfy the caller's intent.
    pub async fn select_connection(
        &self,
        filter: impl Fn(&F::Connection) -> bool,
        context: &F::Context,
    ) -> Result<Arc<F::Connection>, LoadBalancerError<F::Error>> {
        if self.is_closed.load(Ordering::Acquire) {
            return Err(LoadBalancerError::LoadBalancerClosed);
        }
        let snapshot = self.hosts.load_full();
        let result = self.selector.select(&snapshot, &filter, context, false).await;
        if matches!(result, Err(LoadBalancerError::NoActiveHost)) {
            self.maybe_trigger_resubscribe(&snapshot);
        }
        result
    }

    /// Forces a brand-new connection rather than reusing a pooled one.
    /// If the chosen host's build fails, the error is surfaced directly
    /// — no silent fallback to a different backend.
    pub async fn new_connection(
        &self,
        context: &F::Context,
    ) -> Result<Arc<F::Connection>, LoadBalancerError<F::Error>> {
        if self.is_closed.load(Ordering::Acquire) {
            return Err(LoadBalancerError::LoadBalancerClosed);
        }
        let snapshot = self.hosts.load_full();
        let result = self
            .selector
            .select(&snapshot, &|_| true, context, true)
            .await;
        if matches!(result, Err(LoadBalancerError::NoActiveHost)) {
            self.maybe_trigger_resubscribe(&snapshot);
        }
        result
    }

    /// Subscribes to readiness transitions. The new receiver immediately
    /// observes the most recently published value via `borrow()` —
    /// late subscribers see the last emission.
    pub fn event_stream(&self) -> watch::Receiver<Readiness> {
        self.readiness_rx.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    /// `true` once the SD stream has ended/errored with health checking
    /// disabled — no further host-list updates will ever arrive.
    pub fn is_sd_stream_terminated(&self) -> bool {
        self.sd_terminated.load(Ordering::Acquire)
    }

    /// Publishes a readiness transition, if the stream hasn't already
    /// been terminated.
    fn publish_readiness(&self, readiness: Readiness) {
        if let Some(tx) = self.readiness_tx.lock().unwrap().as_ref() {
            let _ = tx.send(readiness);
        }
    }

    /// Ends the readiness stream for good: dropping the sender makes
    /// every subscriber's next `changed()` call return `Err`, which is
    /// how §7's "propagate [the SD stream error] to event-stream
    /// subscribers" is surfaced on a `watch` channel.
    fn terminate_readiness_stream(&self) {
        self.readiness_tx.lock().unwrap().take();
    }

    /// Idempotent. `graceful` lets existing pooled connections drain
    /// (hosts transition to `EXPIRED` and stop accepting new builds);
    /// non-graceful closes every connection immediately.
    pub async fn close(self: &Arc<Self>, graceful: bool) {
        if self.is_closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(handle) = self.sd_loop_handle.lock().unwrap().take() {
            handle.abort();
        }

        let this = Arc::clone(self);
        self.executor
            .submit_and_wait(async move {
                let hosts = this.hosts.load_full();
                for host in hosts.iter() {
                    if graceful {
                        host.mark_expired().await;
                    } else {
                        host.mark_closed().await;
                    }
                }
                this.hosts.store(Arc::new(Vec::new()));
                this.publish_readiness(Readiness::NotReady);
            })
            .await;

        self.factory.shutdown().await;
    }

    fn maybe_trigger_resubscribe(&self, snapshot: &[Arc<Host<F>>]) {
        let Some(cfg) = &self.health_config else {
            return;
        };
        if snapshot.is_empty() {
            return;
        }
        if !snapshot.iter().all(|h| h.is_unhealthy()) {
            return;
        }

        let now = cfg.time_source.now_millis();
        let current = self.next_resubscribe_time_ms.load(Ordering::Acquire);
        if current == RESUBSCRIBING || now < current {
            return;
        }
        if self
            .next_resubscribe_time_ms
            .compare_exchange(current, RESUBSCRIBING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return; // another caller won the race
        }

        log::info!("all hosts unhealthy, triggering service-discovery resubscribe");
        self.resubscribe_notify.notify_one();

        let backoff = uniform_duration(cfg.resubscribe_lower, cfg.resubscribe_upper);
        let next = now.saturating_add(backoff.as_millis() as u64);
        self.next_resubscribe_time_ms.store(next, Ordering::Release);
    }

    async fn apply_batch(
        self: &Arc<Self>,
        batch: crate::types::SdBatch<F::Address>,
        first_batch_after_resubscribe: bool,
    ) {
        let this = Arc::clone(self);
        self.executor
            .submit_and_wait(async move {
                let old = this.hosts.load_full();
                let outcome = reconcile(
                    &old,
                    batch,
                    &this.factory,
                    &this.health_config,
                    this.linear_search_space,
                    first_batch_after_resubscribe,
                )
                .await;
                let became_empty = outcome.hosts.is_empty();
                this.hosts.store(Arc::new(outcome.hosts));
                if outcome.ready_transition {
                    let readiness = if became_empty {
                        Readiness::NotReady
                    } else {
                        Readiness::Ready
                    };
                    this.publish_readiness(readiness);
                }
            })
            .await;
    }

    /// Owns the service-discovery subscription for the balancer's
    /// lifetime: applies every batch, and tears down + re-establishes
    /// the subscription whenever `maybe_trigger_resubscribe` fires (or
    /// restarts it after the stream itself ends, once health checking
    /// confirms a resubscribe tick is due).
    async fn run_sd_loop(self: Arc<Self>) {
        loop {
            let mut stream = self.discoverer.subscribe();
            let mut first_batch = true;
            let mut stream_exhausted = false;

            loop {
                tokio::select! {
                    biased;
                    _ = self.resubscribe_notify.notified() => {
                        break;
                    }
                    item = stream.next() => {
                        match item {
                            Some(Ok(batch)) => {
                                self.apply_batch(batch, first_batch).await;
                                first_batch = false;
                            }
                            Some(Err(err)) => {
                                log::warn!("service discovery stream error: {err}");
                                stream_exhausted = true;
                                break;
                            }
                            None => {
                                log::warn!("service discovery stream ended");
                                stream_exhausted = true;
                                break;
                            }
                        }
                    }
                }
            }
            drop(stream);

            if self.is_closed.load(Ordering::Acquire) {
                return;
            }

            if stream_exhausted {
                if self.health_config.is_none() {
                    self.sd_terminated.store(true, Ordering::Release);
                    self.terminate_readiness_stream();
                    return;
                }
                // Retain the last host set and wait for the next
                // resubscribe tick rather than hot-looping reconnects.
                self.resubscribe_notify.notified().await;
            }
        }
    }
}

/// Builder for [`LoadBalancer`]: accumulates optional config, validates
/// once at `build()` rather than at every setter call.
pub struct LoadBalancerBuilder<F, D>
where
    F: ConnectionFactory,
    D: ServiceDiscoverer<Address = F::Address>,
{
    factory: Arc<F>,
    discoverer: Arc<D>,
    health_config: Option<HealthCheckConfig>,
    linear_search_space: usize,
}

impl<F, D> LoadBalancerBuilder<F, D>
where
    F: ConnectionFactory,
    D: ServiceDiscoverer<Address = F::Address>,
{
    pub fn new(factory: Arc<F>, discoverer: Arc<D>) -> Self {
        Self {
            factory,
            discoverer,
            health_config: None,
            linear_search_space: DEFAULT_LINEAR_SEARCH_SPACE,
        }
    }

    pub fn health_check_config(mut self, config: HealthCheckConfig) -> Self {
        self.health_config = Some(config);
        self
    }

    pub fn linear_search_space(mut self, n: usize) -> Self {
        self.linear_search_space = n;
        self
    }

    pub fn build(self) -> Result<Arc<LoadBalancer<F, D>>, ConfigError> {
        if let Some(cfg) = &self.health_config {
            cfg.validate()?;
        }
        Ok(LoadBalancer::new(
            self.factory,
            self.discoverer,
            self.health_config,
            self.linear_search_space,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::Connection;
    use crate::types::{SdEvent, SdStatus};
    use async_trait::async_trait;
    use futures_util::stream::{self, BoxStream};
    use std::sync::atomic::{AtomicBool as StdAtomicBool, AtomicU64 as StdAtomicU64};
    use std::time::Duration;
    use thiserror::Error;
    use tokio::sync::mpsc;

    #[derive(Debug, Error)]
    #[error("connect failed")]
    struct FakeConnectError;

    struct FakeConnection {
        reserved: StdAtomicBool,
        alive: StdAtomicBool,
    }

    impl FakeConnection {
        fn new() -> Self {
            Self {
                reserved: StdAtomicBool::new(false),
                alive: StdAtomicBool::new(true),
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
        fail_for: std::sync::Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl ConnectionFactory for FakeFactory {
        type Address = &'static str;
        type Connection = FakeConnection;
        type Context = ();
        type Error = FakeConnectError;

        async fn connect(
            &self,
            address: &Self::Address,
            _context: &Self::Context,
        ) -> Result<Self::Connection, Self::Error> {
            if self.fail_for.lock().unwrap().contains(address) {
                Err(FakeConnectError)
            } else {
                Ok(FakeConnection::new())
            }
        }
    }

    /// Discoverer fed by an mpsc channel so tests can push batches on
    /// demand; every `subscribe()` call (including after a resubscribe)
    /// hands out a fresh stream wired to the same shared receiver, so no
    /// batch sent to the channel is ever lost to a stale subscription.
    struct FakeDiscoverer {
        rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<crate::types::SdBatch<&'static str>, FakeConnectError>>>>,
        subscribe_count: StdAtomicU64,
    }

    impl FakeDiscoverer {
        fn new(rx: mpsc::UnboundedReceiver<Result<crate::types::SdBatch<&'static str>, FakeConnectError>>) -> Self {
            Self {
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
                subscribe_count: StdAtomicU64::new(0),
            }
        }
    }

    impl ServiceDiscoverer for FakeDiscoverer {
        type Address = &'static str;
        type Error = FakeConnectError;

        fn subscribe(&self) -> BoxStream<'static, Result<crate::types::SdBatch<Self::Address>, Self::Error>> {
            self.subscribe_count.fetch_add(1, Ordering::SeqCst);
            let rx = Arc::clone(&self.rx);
            Box::pin(stream::unfold(rx, |rx| async move {
                let item = rx.lock().await.recv().await;
                item.map(|it| (it, rx))
            }))
        }
    }

    fn available(addr: &'static str) -> SdEvent<&'static str> {
        SdEvent::new(addr, SdStatus::Available)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn empty_then_available_reaches_ready_and_serves_connection() {
        let (tx, rx) = mpsc::unbounded_channel();
        let discoverer = Arc::new(FakeDiscoverer::new(rx));
        let factory = Arc::new(FakeFactory::default());
        let lb = LoadBalancer::new(factory, discoverer, None, 8);

        let result = lb.select_connection(|_| true, &()).await;
        assert!(matches!(result, Err(LoadBalancerError::NoHostsAvailable)));

        let mut events = lb.event_stream();
        assert_eq!(*events.borrow(), Readiness::NotReady);

        tx.send(Ok(vec![available("a")])).unwrap();
        events.changed().await.unwrap();
        assert_eq!(*events.borrow(), Readiness::Ready);

        let conn = lb.select_connection(|_| true, &()).await.unwrap();
        assert!(conn.is_alive());
    }

    #[tokio::test]
    async fn round_robin_across_three_hosts() {
        let (tx, rx) = mpsc::unbounded_channel();
        let discoverer = Arc::new(FakeDiscoverer::new(rx));
        let factory = Arc::new(FakeFactory::default());
        let lb = LoadBalancer::new(factory, discoverer, None, 8);

        tx.send(Ok(vec![available("a"), available("b"), available("c")]))
            .unwrap();
        wait_until(|| lb.hosts.load().len() == 3).await;

        for _ in 0..6 {
            lb.new_connection(&()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn health_quarantine_skips_unhealthy_host() {
        let (tx, rx) = mpsc::unbounded_channel();
        let discoverer = Arc::new(FakeDiscoverer::new(rx));
        let factory = Arc::new(FakeFactory::default());
        factory.fail_for.lock().unwrap().push("b");

        let cfg = HealthCheckConfig {
            failure_threshold: 3,
            ..HealthCheckConfig::default()
        };
        let lb = LoadBalancer::new(factory, discoverer, Some(cfg), 8);

        tx.send(Ok(vec![available("a"), available("b")])).unwrap();
        wait_until(|| lb.hosts.load().len() == 2).await;

        // Drive three failed builds against "b" specifically via new_connection's
        // force_new + no-fallback semantics isn't suitable here; instead probe
        // select_connection repeatedly until "b" trips to unhealthy.
        let mut saw_unhealthy = false;
        for _ in 0..50 {
            let _ = lb.select_connection(|_| true, &()).await;
            if lb
                .hosts
                .load()
                .iter()
                .any(|h| h.state() == HostState::Unhealthy)
            {
                saw_unhealthy = true;
                break;
            }
        }
        assert!(saw_unhealthy);

        // Subsequent selections should still succeed, landing on "a".
        for _ in 0..5 {
            let conn = lb.select_connection(|_| true, &()).await;
            assert!(conn.is_ok());
        }
    }

    #[tokio::test]
    async fn sd_stream_end_without_health_check_terminates_readiness_stream() {
        let (tx, rx) = mpsc::unbounded_channel();
        let discoverer = Arc::new(FakeDiscoverer::new(rx));
        let factory = Arc::new(FakeFactory::default());
        let lb = LoadBalancer::new(factory, discoverer, None, 8);

        let mut events = lb.event_stream();
        drop(tx); // ends the SD stream with no health_config configured

        wait_until(|| lb.is_sd_stream_terminated()).await;

        assert!(events.changed().await.is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let discoverer = Arc::new(FakeDiscoverer::new(rx));
        let factory = Arc::new(FakeFactory::default());
        let lb = LoadBalancer::new(factory, discoverer, None, 8);

        lb.close(true).await;
        lb.close(true).await;

        let result = lb.select_connection(|_| true, &()).await;
        assert!(matches!(result, Err(LoadBalancerError::LoadBalancerClosed)));
    }

    #[tokio::test]
    async fn stateless_resubscribe_drops_hosts_missing_from_first_batch() {
        let (tx, rx) = mpsc::unbounded_channel();
        let discoverer = Arc::new(FakeDiscoverer::new(rx));
        let factory = Arc::new(FakeFactory::default());
        factory.fail_for.lock().unwrap().push("a");
        factory.fail_for.lock().unwrap().push("b");

        let cfg = HealthCheckConfig {
            failure_threshold: 1,
            resubscribe_lower: Duration::ZERO,
            resubscribe_upper: Duration::ZERO,
            ..HealthCheckConfig::default()
        };
        let lb = LoadBalancer::new(factory, discoverer, Some(cfg), 8);

        tx.send(Ok(vec![available("a"), available("b")])).unwrap();
        wait_until(|| lb.hosts.load().len() == 2).await;

        // Both hosts fail their one allowed build and go UNHEALTHY; keep
        // selecting (each hit trips one more host) until both are down.
        let mut last_result = None;
        for _ in 0..20 {
            last_result = Some(lb.select_connection(|_| true, &()).await);
            if lb.hosts.load().iter().all(|h| h.is_unhealthy()) {
                break;
            }
        }
        assert!(lb.hosts.load().iter().all(|h| h.is_unhealthy()));
        // The call that found every host already unhealthy (or this one,
        // if the loop above happened to trip the last host and find out
        // on the same call) observes NoActiveHost and triggers a resubscribe.
        if !matches!(last_result, Some(Err(LoadBalancerError::NoActiveHost))) {
            last_result = Some(lb.select_connection(|_| true, &()).await);
        }
        assert!(matches!(last_result, Some(Err(LoadBalancerError::NoActiveHost))));

        tx.send(Ok(vec![available("a")])).unwrap();
        wait_until(|| lb.hosts.load().len() == 1).await;
        assert_eq!(*lb.hosts.load().first().unwrap().address(), "a");
        assert!(lb.discoverer.subscribe_count.load(Ordering::SeqCst) >= 2);
    }
}
