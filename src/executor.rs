//! Single-writer task queue.
//!
//! A FIFO of boxed futures guarded by a leader-election flag: the first
//! submitter to find the queue idle becomes the runner and drains it
//! (awaiting each task in turn, including ones submitted while it runs)
//! until empty, then releases the flag. Anyone who submits while a
//! runner is already draining just enqueues and returns. This gives the
//! load balancer serialized host-list mutations without a coarse
//! `async` lock held across `.await` points, and without the
//! reentrancy hazard of a task submitting another task itself — e.g. a
//! host's close path scheduling a follow-up list rewrite.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct SingleWriterExecutor {
    queue: Mutex<VecDeque<BoxedTask>>,
    running: AtomicBool,
}

impl Default for SingleWriterExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleWriterExecutor {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Enqueues `task` and, if the queue was idle, drains it (this task
    /// and anything submitted while draining) before returning.
    ///
    /// Safe to call from *within* a task already running on this
    /// executor: `running` is already held by the active drain loop, so
    /// this just enqueues and returns without blocking — the active
    /// leader will reach the new task before it releases leadership.
    pub async fn submit<Fut>(&self, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.queue.lock().unwrap().push_back(Box::pin(task));
        self.try_drain().await;
    }

    /// Like [`submit`](Self::submit), but only resolves once `task`
    /// itself has finished running rather than merely been enqueued.
    ///
    /// Must not be called from within a task currently executing on
    /// this executor — that caller would be the one and only drain
    /// loop that could ever run the awaited task, and it would be
    /// blocked waiting on itself.
    pub async fn submit_and_wait<Fut>(&self, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let boxed: BoxedTask = Box::pin(async move {
            task.await;
            let _ = tx.send(());
        });
        self.queue.lock().unwrap().push_back(boxed);
        self.try_drain().await;
        let _ = rx.await;
    }

    async fn try_drain(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        loop {
            let next = self.queue.lock().unwrap().pop_front();
            match next {
                Some(task) => task.await,
                None => break,
            }
        }

        self.running.store(false, Ordering::Release);

        // A concurrent submitter may have pushed after we observed the
        // queue empty but before we cleared `running` — they would have
        // seen `running == true` and bailed out without draining. Check
        // once more and reclaim leadership if so, rather than leaving
        // an orphaned task nobody ever runs.
        if !self.queue.lock().unwrap().is_empty() {
            Box::pin(self.try_drain()).await;
        }
    }
}
