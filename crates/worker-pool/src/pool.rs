use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use imgup_hasher::{
    ChunkDescriptor, ContentHash, ContentHasher, HashRequest, HashResponse, HashService,
    ProgressFn,
};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::worker::{Job, WorkerPoolItem, fallback_loop, spawn_worker};
use crate::{PoolConfig, PoolError};

/// Builds the hash service hosted by each worker.
pub type ServiceFactory = Arc<dyn Fn() -> std::io::Result<Box<dyn HashService>> + Send + Sync>;

/// Point-in-time view of the pool, for display only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub workers: usize,
    pub busy_workers: usize,
    pub queued_tasks: usize,
    /// Tasks dispatched since the pool was (re)initialised.
    pub total_tasks: u64,
}

/// What a worker does after finishing a task.
pub(crate) enum Next {
    /// Run the overflow queue's head; the worker stays busy.
    Run(Job),
    /// Nothing queued; the worker is now idle.
    Idle,
    /// The pool was destroyed; drop the result and exit.
    Retired,
}

#[derive(Default)]
struct PoolState {
    generation: u64,
    initialized: bool,
    workers: Vec<WorkerPoolItem>,
    queue: VecDeque<Job>,
    /// Blocking-pool tasks running in place of workers that failed to start.
    fallback_running: usize,
    fallback_tasks: u64,
}

impl PoolState {
    fn busy_count(&self) -> usize {
        self.workers.iter().filter(|w| w.busy).count() + self.fallback_running
    }

    /// Hands `job` to the idle worker with the fewest completed tasks, or
    /// queues it. At most `limit` tasks run at once.
    ///
    /// Returns the job back when it must run on the blocking pool because no
    /// worker is running.
    fn dispatch(&mut self, job: Job, limit: usize) -> Option<Job> {
        let has_room = self.busy_count() < limit;

        if self.workers.is_empty() {
            if has_room {
                self.fallback_running += 1;
                self.fallback_tasks += 1;
                return Some(job);
            }
            debug!(queued = self.queue.len() + 1, "fallback slots busy, queueing task");
            self.queue.push_back(job);
            return None;
        }

        let idle = self
            .workers
            .iter_mut()
            .enumerate()
            .filter(|(_, w)| has_room && !w.busy)
            .min_by_key(|(slot, w)| (w.task_count, *slot));

        let Some((slot, worker)) = idle else {
            debug!(queued = self.queue.len() + 1, "all workers busy, queueing task");
            self.queue.push_back(job);
            return None;
        };

        worker.busy = true;
        worker.task_count += 1;
        if let Err(send_err) = worker.jobs.send(job) {
            // The thread is gone; its reply channel closes with the dropped job.
            worker.busy = false;
            warn!(slot, method = send_err.0.request.method(), "hash worker unreachable");
        }
        None
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            workers: self.workers.len(),
            busy_workers: self.busy_count(),
            queued_tasks: self.queue.len(),
            total_tasks: self.workers.iter().map(|w| w.task_count).sum::<u64>()
                + self.fallback_tasks,
        }
    }
}

/// State shared between the pool handle and its worker threads.
pub(crate) struct Shared {
    state: Mutex<PoolState>,
    factory: ServiceFactory,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn build_service(&self) -> std::io::Result<Box<dyn HashService>> {
        (self.factory)()
    }

    /// Called by a worker after each task.
    pub(crate) fn finish(&self, slot: usize, generation: u64) -> Next {
        let mut state = self.lock();
        if state.generation != generation {
            return Next::Retired;
        }
        let Some(next) = state.queue.pop_front() else {
            if let Some(worker) = state.workers.get_mut(slot) {
                worker.busy = false;
            }
            return Next::Idle;
        };
        if let Some(worker) = state.workers.get_mut(slot) {
            worker.task_count += 1;
        }
        Next::Run(next)
    }

    /// Called by a blocking-pool task after each task.
    pub(crate) fn finish_fallback(&self, generation: u64) -> Next {
        let mut state = self.lock();
        if state.generation != generation {
            return Next::Retired;
        }
        match state.queue.pop_front() {
            Some(next) => {
                state.fallback_tasks += 1;
                Next::Run(next)
            }
            None => {
                state.fallback_running = state.fallback_running.saturating_sub(1);
                Next::Idle
            }
        }
    }
}

/// Bounded pool of hashing threads.
///
/// All bookkeeping sits behind one mutex that is never held across an
/// `.await` or a call into the service factory; callers only ever see
/// [`PoolStatus`] snapshots.
pub struct WorkerPool {
    config: PoolConfig,
    shared: Arc<Shared>,
    /// Serializes worker startup.
    startup: Mutex<()>,
}

impl WorkerPool {
    /// Creates a pool of [`ContentHasher`] workers. Threads start on first use.
    pub fn new(config: PoolConfig) -> Self {
        Self::with_factory(config, || Ok(Box::new(ContentHasher) as Box<dyn HashService>))
    }

    /// Creates a pool whose workers each host a service built by `factory`.
    ///
    /// A factory error leaves that worker slot out of the pool. The factory
    /// may call [`status`](Self::status) but must not start the pool.
    pub fn with_factory<F>(config: PoolConfig, factory: F) -> Self
    where
        F: Fn() -> std::io::Result<Box<dyn HashService>> + Send + Sync + 'static,
    {
        Self {
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState::default()),
                factory: Arc::new(factory),
            }),
            startup: Mutex::new(()),
        }
    }

    /// Starts the worker threads if they are not running.
    ///
    /// Idempotent once workers are up. A pool running degraded (no worker
    /// started) tries again on each call.
    pub fn initialize(&self) {
        self.start_workers(true);
    }

    fn start_workers(&self, retry_degraded: bool) {
        let _startup = self.startup.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = {
            let state = self.shared.lock();
            let degraded = state.initialized && state.workers.is_empty();
            if state.initialized && !(retry_degraded && degraded) {
                return;
            }
            state.generation
        };

        let requested = self.config.worker_count();
        let mut started = Vec::with_capacity(requested);
        for _ in 0..requested {
            let slot = started.len();
            let worker = self.shared.build_service().and_then(|service| {
                spawn_worker(slot, generation, service, Arc::clone(&self.shared))
            });
            match worker {
                Ok(worker) => started.push(worker),
                Err(e) => warn!(slot, error = %e, "failed to start hash worker"),
            }
        }

        let mut state = self.shared.lock();
        if state.generation != generation {
            // Destroyed while starting; dropping `started` stops the threads.
            return;
        }
        state.initialized = true;
        if started.is_empty() {
            warn!(requested, "no hash workers started, tasks will run on the blocking pool");
            return;
        }
        info!(workers = started.len(), requested, "worker pool initialized");
        state.workers = started;
    }

    /// Runs `request` on the pool and waits for its result.
    ///
    /// `progress` is moved to the worker thread and called there.
    pub async fn submit(
        &self,
        request: HashRequest,
        progress: Option<ProgressFn>,
    ) -> Result<HashResponse, PoolError> {
        self.start_workers(false);

        let (reply, rx) = oneshot::channel();
        let job = Job {
            request,
            progress,
            reply,
        };

        let fallback = {
            let mut state = self.shared.lock();
            let generation = state.generation;
            state
                .dispatch(job, self.config.worker_count())
                .map(|job| (job, generation))
        };

        if let Some((job, generation)) = fallback {
            let shared = Arc::clone(&self.shared);
            tokio::task::spawn_blocking(move || fallback_loop(generation, job, shared));
        }
        rx.await.map_err(|_| PoolError::Terminated)?
    }

    /// Digests a whole file.
    pub async fn digest(
        &self,
        path: impl Into<PathBuf>,
        progress: Option<ProgressFn>,
    ) -> Result<ContentHash, PoolError> {
        let request = HashRequest::Digest { path: path.into() };
        match self.submit(request, progress).await? {
            HashResponse::Digest(digest) => Ok(digest),
            _ => Err(PoolError::UnexpectedResponse("digest")),
        }
    }

    /// Digests an in-memory blob.
    pub async fn digest_of(&self, bytes: Vec<u8>) -> Result<ContentHash, PoolError> {
        match self.submit(HashRequest::DigestOf { bytes }, None).await? {
            HashResponse::Digest(digest) => Ok(digest),
            _ => Err(PoolError::UnexpectedResponse("digest_of")),
        }
    }

    /// Splits a file into `chunk_size` chunks with per-chunk digests.
    pub async fn split(
        &self,
        path: impl Into<PathBuf>,
        chunk_size: u64,
        progress: Option<ProgressFn>,
    ) -> Result<Vec<ChunkDescriptor>, PoolError> {
        let request = HashRequest::Split {
            path: path.into(),
            chunk_size,
        };
        match self.submit(request, progress).await? {
            HashResponse::Chunks(chunks) => Ok(chunks),
            _ => Err(PoolError::UnexpectedResponse("split")),
        }
    }

    /// Recomputes a file digest and compares it to `expected`.
    pub async fn verify(
        &self,
        path: impl Into<PathBuf>,
        expected: ContentHash,
        progress: Option<ProgressFn>,
    ) -> Result<bool, PoolError> {
        let request = HashRequest::Verify {
            path: path.into(),
            expected,
        };
        match self.submit(request, progress).await? {
            HashResponse::Verified(ok) => Ok(ok),
            _ => Err(PoolError::UnexpectedResponse("verify")),
        }
    }

    /// Returns a snapshot of pool occupancy.
    pub fn status(&self) -> PoolStatus {
        self.shared.lock().status()
    }

    /// Hard shutdown: stops all workers and drops the overflow queue.
    ///
    /// Running tasks cannot be interrupted; their threads finish the current
    /// task, discard the result, and exit. Pending callers observe
    /// [`PoolError::Terminated`]. A later [`submit`](Self::submit) starts a
    /// fresh set of workers.
    pub fn destroy(&self) {
        let (busy, workers, queue) = {
            let mut state = self.shared.lock();
            let busy = state.busy_count();
            state.generation += 1;
            state.initialized = false;
            state.fallback_running = 0;
            state.fallback_tasks = 0;
            (
                busy,
                std::mem::take(&mut state.workers),
                std::mem::take(&mut state.queue),
            )
        };

        if busy == 0 && workers.is_empty() && queue.is_empty() {
            return;
        }
        info!(
            workers = workers.len(),
            busy,
            dropped = queue.len(),
            "worker pool destroyed"
        );
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.destroy();
    }
}
