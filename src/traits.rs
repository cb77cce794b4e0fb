//! Collaborator contracts.
//!
//! Everything in this module is injected by the embedder: the service
//! discoverer, the connection factory, the connection type itself, and
//! the time source. The core never constructs a transport connection or
//! parses a discovery wire format on its own.

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::types::SdBatch;

/// A backend address. Opaque to the core beyond equality and hashing —
/// the reconciler keys its diff map on this.
pub trait Address: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> Address for T where T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// An opaque, reusable connection to one backend.
///
/// The core only ever needs to reserve a connection for a request, ask
/// whether it is still alive, and close it. Everything else — protocol
/// framing, read/write, pooling beyond reuse — is the embedder's.
pub trait Connection: Send + Sync + 'static {
    /// Atomically claims this connection for the caller. Returns `false`
    /// if another caller already reserved it. Must not be called again
    /// for the same logical request once it has returned `true`.
    fn try_reserve(&self) -> bool;

    /// Cheap liveness check used to prune dead connections out of a
    /// host's pool; does not itself close anything.
    fn is_alive(&self) -> bool;

    /// Closes the connection. Idempotent.
    fn close(&self);
}

/// Builds new connections to a backend address.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Address: Address;
    type Connection: Connection;
    /// Per-request context threaded through to `connect`. Background
    /// probes have no caller request to carry a context from, so this
    /// must supply a sensible default for that case.
    type Context: Send + Sync + 'static + Default;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn connect(
        &self,
        address: &Self::Address,
        context: &Self::Context,
    ) -> Result<Self::Connection, Self::Error>;

    /// Releases any resources the factory itself holds (connection
    /// templates, TLS contexts, client-side certificates). Called once
    /// by [`crate::balancer::LoadBalancer::close`] after every host has
    /// been closed. Most factories have nothing to do here.
    async fn shutdown(&self) {}
}

/// Produces the asynchronous sequence of service-discovery batches.
///
/// `subscribe` may be called again after a previous stream ends or
/// errors (a resubscribe); each call starts a fresh subscription.
pub trait ServiceDiscoverer: Send + Sync + 'static {
    type Address: Address;
    type Error: std::error::Error + Send + Sync + 'static;

    fn subscribe(&self) -> BoxStream<'static, Result<SdBatch<Self::Address>, Self::Error>>;
}

/// A future scheduled by a [`TimeSource`], boxed so it can cross the
/// collaborator boundary.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Handle to a scheduled task. Cancelling after the task has already run
/// to completion is a no-op.
pub struct CancelHandle {
    cancel: Box<dyn Fn() + Send + Sync>,
}

impl CancelHandle {
    pub fn new(cancel: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Box::new(cancel),
        }
    }

    pub fn cancel(&self) {
        (self.cancel)();
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CancelHandle")
    }
}

/// Monotonic clock plus a delayed-task scheduler, injected so probe and
/// resubscribe timing can be driven deterministically in tests.
pub trait TimeSource: Send + Sync + 'static {
    /// Milliseconds since an arbitrary, implementation-chosen epoch.
    /// Only differences between two calls are meaningful.
    fn now_millis(&self) -> u64;

    /// Runs `task` after `delay`. The returned handle cancels it if it
    /// hasn't started yet; a task already running to completion is not
    /// interrupted.
    fn schedule(&self, delay: Duration, task: BoxFuture) -> CancelHandle;
}

/// Real-clock [`TimeSource`] backed by the tokio runtime.
pub struct TokioTimeSource {
    start: std::time::Instant,
}

impl TokioTimeSource {
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

impl Default for TokioTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for TokioTimeSource {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn schedule(&self, delay: Duration, task: BoxFuture) -> CancelHandle {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        CancelHandle::new(move || handle.abort())
    }
}
