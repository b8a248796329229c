use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tracing::{debug, warn};

use crate::engine::types::PoolName;

/// Unit of work dispatched through a pool.
pub type Invocation = BoxFuture<'static, ()>;

/// Concurrency limits for the three priority tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolConfig {
    pub high: usize,
    pub default: usize,
    pub low: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            high: 10,
            default: 5,
            low: 3,
        }
    }
}

impl PoolConfig {
    pub fn limit(&self, pool: PoolName) -> usize {
        match pool {
            PoolName::High => self.high,
            PoolName::Default => self.default,
            PoolName::Low => self.low,
        }
    }
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub name: PoolName,
    pub max_parallelism: usize,
    pub running: usize,
    pub queued: usize,
    /// Highest `running` value ever observed.
    pub peak_running: usize,
    pub admitted: u64,
}

struct Queued {
    invocation: Invocation,
    done: oneshot::Sender<()>,
}

struct PoolInner {
    name: PoolName,
    max_parallelism: usize,
    semaphore: Arc<Semaphore>,
    /// Feeds the dispatcher that admits queued invocations in arrival order.
    /// Started on the first enqueue that has to wait.
    wait_queue: OnceLock<mpsc::UnboundedSender<Queued>>,
    running: AtomicUsize,
    queued: AtomicUsize,
    peak_running: AtomicUsize,
    admitted: AtomicU64,
}

/// Bounded-concurrency FIFO dispatcher for one priority tier.
///
/// Every running invocation holds one permit of the pool's semaphore, so
/// `running <= max_parallelism`. Invocations that find no free permit wait
/// in a queue drained by a single dispatcher task.
#[derive(Clone)]
pub struct WorkPool {
    inner: Arc<PoolInner>,
}

/// Resolves when the enqueued invocation has run to completion.
pub struct InvocationHandle {
    done: oneshot::Receiver<()>,
}

impl InvocationHandle {
    /// Wait for the invocation. Returns `false` if it panicked or was dropped.
    pub async fn finished(self) -> bool {
        self.done.await.is_ok()
    }
}

impl WorkPool {
    pub fn new(name: PoolName, max_parallelism: usize) -> Self {
        let max_parallelism = max_parallelism.max(1);
        Self {
            inner: Arc::new(PoolInner {
                name,
                max_parallelism,
                semaphore: Arc::new(Semaphore::new(max_parallelism)),
                wait_queue: OnceLock::new(),
                running: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                peak_running: AtomicUsize::new(0),
                admitted: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> PoolName {
        self.inner.name
    }

    pub fn max_parallelism(&self) -> usize {
        self.inner.max_parallelism
    }

    /// Run `invocation` now if a slot is free, otherwise queue it at the tail.
    pub fn enqueue(&self, invocation: Invocation) -> InvocationHandle {
        let (tx, rx) = oneshot::channel();
        let job = Queued {
            invocation,
            done: tx,
        };

        let Ok(runtime) = Handle::try_current() else {
            warn!(pool = %self.inner.name, "No runtime available; dropping invocation");
            return InvocationHandle { done: rx };
        };

        // Nothing may overtake invocations that are already waiting.
        if self.inner.queued.load(Ordering::SeqCst) == 0
            && let Ok(permit) = self.inner.semaphore.clone().try_acquire_owned()
        {
            PoolInner::admit(&self.inner, &runtime, permit, job);
            return InvocationHandle { done: rx };
        }

        let queue = self.inner.wait_queue.get_or_init(|| {
            let (queue_tx, queue_rx) = mpsc::unbounded_channel();
            runtime.spawn(PoolInner::dispatch(
                Arc::downgrade(&self.inner),
                self.inner.semaphore.clone(),
                queue_rx,
            ));
            queue_tx
        });

        let queued = self.inner.queued.fetch_add(1, Ordering::SeqCst) + 1;
        if queue.send(job).is_err() {
            self.inner.queued.fetch_sub(1, Ordering::SeqCst);
            warn!(pool = %self.inner.name, "Pool dispatcher stopped; dropping invocation");
        } else {
            debug!(pool = %self.inner.name, queued = queued, "Pool saturated; invocation queued");
        }

        InvocationHandle { done: rx }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.inner.name,
            max_parallelism: self.inner.max_parallelism,
            running: self.inner.running.load(Ordering::SeqCst),
            queued: self.inner.queued.load(Ordering::SeqCst),
            peak_running: self.inner.peak_running.load(Ordering::SeqCst),
            admitted: self.inner.admitted.load(Ordering::SeqCst),
        }
    }
}

impl PoolInner {
    /// Admit queued invocations one at a time as permits come back. The
    /// semaphore hands permits to waiters in order, and there is only one
    /// waiter, so the queue drains FIFO.
    async fn dispatch(
        pool: Weak<PoolInner>,
        semaphore: Arc<Semaphore>,
        mut queue: mpsc::UnboundedReceiver<Queued>,
    ) {
        while let Some(job) = queue.recv().await {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let Some(pool) = pool.upgrade() else {
                break;
            };
            pool.queued.fetch_sub(1, Ordering::SeqCst);
            PoolInner::admit(&pool, &Handle::current(), permit, job);
        }
    }

    fn admit(pool: &Arc<PoolInner>, runtime: &Handle, permit: OwnedSemaphorePermit, job: Queued) {
        let running = pool.running.fetch_add(1, Ordering::SeqCst) + 1;
        pool.peak_running.fetch_max(running, Ordering::SeqCst);
        pool.admitted.fetch_add(1, Ordering::SeqCst);

        let slot = Slot {
            pool: pool.clone(),
            _permit: permit,
        };
        runtime.spawn(async move {
            job.invocation.await;
            // Freed before `done` fires so a finished handle sees the slot back.
            drop(slot);
            let _ = job.done.send(());
        });
    }
}

/// One admitted invocation. Dropping it, even while unwinding from a panic,
/// lowers `running` and then returns the permit.
struct Slot {
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.pool.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The three priority pools. Constructed once at startup and shared for the
/// lifetime of the process; nothing needs tearing down.
pub struct WorkPools {
    high: WorkPool,
    default: WorkPool,
    low: WorkPool,
}

impl WorkPools {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            high: WorkPool::new(PoolName::High, config.high),
            default: WorkPool::new(PoolName::Default, config.default),
            low: WorkPool::new(PoolName::Low, config.low),
        }
    }

    pub fn get(&self, pool: PoolName) -> &WorkPool {
        match pool {
            PoolName::High => &self.high,
            PoolName::Default => &self.default,
            PoolName::Low => &self.low,
        }
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        PoolName::ALL.iter().map(|p| self.get(*p).stats()).collect()
    }
}

impl Default for WorkPools {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}
