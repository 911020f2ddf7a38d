//! Time-ordered job scheduling.
//!
//! A [`JobQueue`] keeps deferred and repeating callbacks in a binary heap
//! ordered by due time. One timer task owns the heap: it sleeps until the
//! earliest due time, fires every job that is due and goes back to sleep.
//! Scheduling or cancelling wakes the timer through a [`Notify`].
//!
//! Jobs start in non-decreasing order of their due time. Each firing runs on
//! its own task, so a slow job never delays the timer. Cancelling only
//! prevents future firings; a job that already started runs to completion.
//!
//! Time is [`tokio::time`]'s, so tests can pause and advance it.
//!
//! ```rust,ignore
//! let jobs = JobQueue::new();
//! jobs.start();
//!
//! let handle = jobs.run_repeating("heartbeat", Duration::from_secs(30), Duration::ZERO, |ctx| async move {
//!     tracing::info!(job = ctx.job().name(), "tick");
//!     Ok::<_, BoxError>(())
//! });
//! handle.cancel();
//! ```

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace};

use crate::error::BoxError;

/// A type-erased job callback.
pub type JobCallback = Arc<dyn Fn(JobContext) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Receives errors returned by job callbacks.
///
/// The dispatcher registers itself here so failed jobs reach its error
/// handlers. Without a sink, failures are logged.
#[async_trait]
pub trait JobErrorSink: Send + Sync {
    /// Called once per failed firing.
    async fn job_failed(&self, job: JobHandle, error: BoxError);
}

// =============================================================================
// Job entries
// =============================================================================

struct JobEntry {
    id: u64,
    name: String,
    callback: JobCallback,
    interval: Option<Duration>,
    cancelled: AtomicBool,
    // Due time of the pending firing; `None` once the job is done.
    next_due: Mutex<Option<Instant>>,
}

/// A handle to a scheduled job.
#[derive(Clone)]
pub struct JobHandle {
    entry: Arc<JobEntry>,
    queue: Weak<JobQueueInner>,
}

impl JobHandle {
    /// Unique id within the queue.
    pub fn id(&self) -> u64 {
        self.entry.id
    }

    /// The name given at scheduling time.
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    /// The repeat interval, for repeating jobs.
    pub fn interval(&self) -> Option<Duration> {
        self.entry.interval
    }

    /// When the job fires next; `None` once it's done or cancelled.
    pub fn next_due(&self) -> Option<Instant> {
        *self.entry.next_due.lock()
    }

    /// Whether [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.entry.cancelled.load(Ordering::SeqCst)
    }

    /// Prevents any further firing.
    pub fn cancel(&self) {
        if self.entry.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.entry.next_due.lock() = None;
        if let Some(queue) = self.queue.upgrade() {
            queue.registry.lock().remove(&self.entry.id);
            queue.wake.notify_one();
        }
        trace!(job = %self.entry.name, id = self.entry.id, "Job cancelled");
    }
}

impl PartialEq for JobHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.entry.id)
            .field("name", &self.entry.name)
            .field("interval", &self.entry.interval)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// What a job callback receives.
#[derive(Clone, Debug)]
pub struct JobContext {
    job: JobHandle,
    queue: JobQueue,
}

impl JobContext {
    /// The firing job.
    pub fn job(&self) -> &JobHandle {
        &self.job
    }

    /// The queue, for scheduling follow-up jobs.
    pub fn job_queue(&self) -> &JobQueue {
        &self.queue
    }
}

// =============================================================================
// Heap ordering
// =============================================================================

struct Scheduled {
    due: Instant,
    seq: u64,
    entry: Arc<JobEntry>,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Ties on the due time fire in scheduling order.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

// =============================================================================
// JobQueue
// =============================================================================

struct JobQueueInner {
    heap: Mutex<BinaryHeap<Reverse<Scheduled>>>,
    registry: Mutex<HashMap<u64, Arc<JobEntry>>>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    wake: Notify,
    shutdown: Mutex<Option<CancellationToken>>,
    tracker: TaskTracker,
    error_sink: RwLock<Option<Weak<dyn JobErrorSink>>>,
}

/// A due-time ordered queue of jobs driven by one timer task.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<JobQueueInner>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    /// Creates a stopped, empty queue.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(JobQueueInner {
                heap: Mutex::new(BinaryHeap::new()),
                registry: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                next_seq: AtomicU64::new(0),
                wake: Notify::new(),
                shutdown: Mutex::new(None),
                tracker: TaskTracker::new(),
                error_sink: RwLock::new(None),
            }),
        }
    }

    /// Routes failed jobs to `sink`. Held weakly.
    pub fn set_error_sink(&self, sink: Weak<dyn JobErrorSink>) {
        *self.inner.error_sink.write() = Some(sink);
    }

    /// Whether the timer task is running.
    pub fn is_running(&self) -> bool {
        self.inner.shutdown.lock().is_some()
    }

    /// Spawns the timer task. Calling it on a running queue does nothing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let token = {
            let mut shutdown = self.inner.shutdown.lock();
            if shutdown.is_some() {
                return;
            }
            let token = CancellationToken::new();
            *shutdown = Some(token.clone());
            token
        };
        self.inner.tracker.reopen();
        let queue = self.clone();
        tokio::spawn(async move { queue.timer_loop(token).await });
        info!("Job queue started");
    }

    /// Stops the timer, drops every pending job and waits for running ones.
    pub async fn stop(&self) {
        let token = self.inner.shutdown.lock().take();
        let Some(token) = token else {
            return;
        };
        token.cancel();

        self.inner.heap.lock().clear();
        let pending: Vec<_> = self.inner.registry.lock().drain().map(|(_, e)| e).collect();
        for entry in pending {
            entry.cancelled.store(true, Ordering::SeqCst);
            *entry.next_due.lock() = None;
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("Job queue stopped");
    }

    /// Schedules `callback` to fire at `due`, then every `interval` if given.
    ///
    /// A zero interval is treated as no interval.
    pub fn schedule(
        &self,
        name: impl Into<String>,
        callback: JobCallback,
        due: Instant,
        interval: Option<Duration>,
    ) -> JobHandle {
        let interval = interval.filter(|interval| !interval.is_zero());
        let entry = Arc::new(JobEntry {
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
            name: name.into(),
            callback,
            interval,
            cancelled: AtomicBool::new(false),
            next_due: Mutex::new(Some(due)),
        });
        self.inner.registry.lock().insert(entry.id, Arc::clone(&entry));
        self.push(Arc::clone(&entry), due);
        trace!(job = %entry.name, id = entry.id, ?interval, "Job scheduled");

        JobHandle {
            entry,
            queue: Arc::downgrade(&self.inner),
        }
    }

    /// Fires once after `delay`.
    pub fn run_once<F, Fut>(&self, name: impl Into<String>, delay: Duration, f: F) -> JobHandle
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.schedule(name, job_callback(f), Instant::now() + delay, None)
    }

    /// Fires once at `when`.
    pub fn run_at<F, Fut>(&self, name: impl Into<String>, when: Instant, f: F) -> JobHandle
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.schedule(name, job_callback(f), when, None)
    }

    /// Fires after `first`, then every `interval`.
    pub fn run_repeating<F, Fut>(
        &self,
        name: impl Into<String>,
        interval: Duration,
        first: Duration,
        f: F,
    ) -> JobHandle
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.schedule(name, job_callback(f), Instant::now() + first, Some(interval))
    }

    /// Cancels a job. Same as [`JobHandle::cancel`].
    pub fn cancel(&self, handle: &JobHandle) {
        handle.cancel();
    }

    /// Every pending job, soonest first.
    pub fn jobs(&self) -> Vec<JobHandle> {
        let mut jobs: Vec<_> = self
            .inner
            .registry
            .lock()
            .values()
            .map(|entry| JobHandle {
                entry: Arc::clone(entry),
                queue: Arc::downgrade(&self.inner),
            })
            .collect();
        jobs.sort_by_key(|job| (job.next_due(), job.id()));
        jobs
    }

    /// Pending jobs called `name`.
    pub fn jobs_by_name(&self, name: &str) -> Vec<JobHandle> {
        self.jobs().into_iter().filter(|job| job.name() == name).collect()
    }

    fn push(&self, entry: Arc<JobEntry>, due: Instant) {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        self.inner.heap.lock().push(Reverse(Scheduled { due, seq, entry }));
        self.inner.wake.notify_one();
    }

    async fn timer_loop(self, token: CancellationToken) {
        loop {
            let next_due = self.inner.heap.lock().peek().map(|Reverse(s)| s.due);
            let sleep = async {
                match next_due {
                    Some(due) => tokio::time::sleep_until(due).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.inner.wake.notified() => continue,
                _ = sleep => self.fire_due(),
            }
        }
        debug!("Job timer exited");
    }

    fn fire_due(&self) {
        let now = Instant::now();
        loop {
            let scheduled = {
                let mut heap = self.inner.heap.lock();
                let is_due = heap.peek().is_some_and(|Reverse(next)| next.due <= now);
                if is_due { heap.pop().map(|Reverse(s)| s) } else { None }
            };
            let Some(Scheduled { due, entry, .. }) = scheduled else {
                break;
            };

            // Skip cancelled jobs and heap entries superseded by a reschedule.
            if entry.cancelled.load(Ordering::SeqCst) || *entry.next_due.lock() != Some(due) {
                continue;
            }

            match entry.interval {
                Some(interval) => {
                    let mut next = due + interval;
                    if next <= now {
                        next = now + interval;
                    }
                    *entry.next_due.lock() = Some(next);
                    self.push(Arc::clone(&entry), next);
                }
                None => {
                    *entry.next_due.lock() = None;
                    self.inner.registry.lock().remove(&entry.id);
                }
            }

            self.spawn_firing(entry);
        }
    }

    fn spawn_firing(&self, entry: Arc<JobEntry>) {
        let handle = JobHandle {
            entry: Arc::clone(&entry),
            queue: Arc::downgrade(&self.inner),
        };
        let ctx = JobContext {
            job: handle.clone(),
            queue: self.clone(),
        };
        let sink = self.inner.error_sink.read().clone();

        trace!(job = %entry.name, id = entry.id, "Job firing");
        let fut = (entry.callback)(ctx);
        self.inner.tracker.spawn(async move {
            if let Err(e) = fut.await {
                match sink.and_then(|sink| sink.upgrade()) {
                    Some(sink) => sink.job_failed(handle, e).await,
                    None => error!(job = %handle.name(), error = %e, "Job failed"),
                }
            }
        });
    }
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("running", &self.is_running())
            .field("pending", &self.inner.registry.lock().len())
            .finish()
    }
}

/// Boxes an async closure into a [`JobCallback`].
pub fn job_callback<F, Fut>(f: F) -> JobCallback
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |ctx: JobContext| -> BoxFuture<'static, Result<(), BoxError>> { Box::pin(f(ctx)) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder(log: &Arc<Mutex<Vec<String>>>) -> impl Fn(JobContext) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |ctx: JobContext| -> BoxFuture<'static, Result<(), BoxError>> {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().push(ctx.job().name().to_string());
                Ok(())
            })
        }
    }

    /// Lets spawned firings run.
    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_in_due_order() {
        let queue = JobQueue::new();
        queue.start();
        let log = Arc::new(Mutex::new(Vec::new()));

        queue.run_once("third", Duration::from_secs(30), recorder(&log));
        queue.run_once("first", Duration::from_secs(10), recorder(&log));
        queue.run_once("second", Duration::from_secs(20), recorder(&log));

        tokio::time::sleep(Duration::from_secs(31)).await;
        settle().await;

        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
        assert!(queue.jobs().is_empty());
        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_job_never_fires() {
        let queue = JobQueue::new();
        queue.start();
        let log = Arc::new(Mutex::new(Vec::new()));

        let handle = queue.run_once("doomed", Duration::from_secs(5), recorder(&log));
        queue.run_once("kept", Duration::from_secs(6), recorder(&log));
        handle.cancel();
        assert!(handle.is_cancelled());
        assert_eq!(handle.next_due(), None);

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(*log.lock(), vec!["kept"]);
        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_job_until_cancelled() {
        let queue = JobQueue::new();
        queue.start();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let handle = queue.run_repeating("tick", Duration::from_secs(10), Duration::ZERO, move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        // Fires at 0, 10, 20.
        tokio::time::sleep(Duration::from_secs(25)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(queue.jobs_by_name("tick").len(), 1);

        handle.cancel();
        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        queue.stop().await;
    }

    struct CountingSink(AtomicUsize);

    #[async_trait]
    impl JobErrorSink for CountingSink {
        async fn job_failed(&self, job: JobHandle, _error: BoxError) {
            assert_eq!(job.name(), "broken");
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_reach_error_sink() {
        let queue = JobQueue::new();
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let weak: Weak<dyn JobErrorSink> = Arc::downgrade(&sink) as Weak<dyn JobErrorSink>;
        queue.set_error_sink(weak);
        queue.start();

        queue.run_once("broken", Duration::from_secs(1), |_| async {
            Err::<(), BoxError>("boom".into())
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_scheduled_before_start_fire_after_start() {
        let queue = JobQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        queue.run_once("early", Duration::from_secs(1), recorder(&log));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(log.lock().is_empty());

        queue.start();
        settle().await;
        assert_eq!(*log.lock(), vec!["early"]);
        queue.stop().await;
    }
}
