//! Worker thread and blocking-fallback task bodies.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender, unbounded};
use imgup_hasher::{HashRequest, HashResponse, HashService, ProgressFn};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::PoolError;
use crate::pool::{Next, Shared};

pub(crate) type Reply = oneshot::Sender<Result<HashResponse, PoolError>>;

/// A submitted task waiting for or running on a worker.
pub(crate) struct Job {
    pub request: HashRequest,
    pub progress: Option<ProgressFn>,
    pub reply: Reply,
}

/// Live handle to one worker thread, owned by the pool state.
pub(crate) struct WorkerPoolItem {
    pub jobs: Sender<Job>,
    pub busy: bool,
    pub task_count: u64,
    _thread: std::thread::JoinHandle<()>,
}

/// Starts a worker thread hosting `service`.
pub(crate) fn spawn_worker(
    slot: usize,
    generation: u64,
    service: Box<dyn HashService>,
    shared: Arc<Shared>,
) -> std::io::Result<WorkerPoolItem> {
    let (jobs, rx) = unbounded();
    let thread = std::thread::Builder::new()
        .name(format!("imgup-hasher-{slot}"))
        .spawn(move || worker_loop(slot, generation, service, rx, shared))?;
    Ok(WorkerPoolItem {
        jobs,
        busy: false,
        task_count: 0,
        _thread: thread,
    })
}

fn worker_loop(
    slot: usize,
    generation: u64,
    mut service: Box<dyn HashService>,
    jobs: Receiver<Job>,
    shared: Arc<Shared>,
) {
    debug!(slot, generation, "hash worker started");

    while let Ok(job) = jobs.recv() {
        if !drain(service.as_mut(), job, || shared.finish(slot, generation)) {
            debug!(slot, generation, "pool destroyed, worker exiting");
            return;
        }
    }

    debug!(slot, generation, "hash worker stopped");
}

/// Body of a blocking-pool task standing in for a worker that never started.
///
/// Runs `job`, then keeps taking the overflow queue's head until it is empty.
pub(crate) fn fallback_loop(generation: u64, job: Job, shared: Arc<Shared>) {
    match shared.build_service() {
        Ok(mut service) => {
            drain(service.as_mut(), job, || shared.finish_fallback(generation));
        }
        Err(e) => {
            warn!(error = %e, "hash service unavailable");
            let mut job = job;
            loop {
                let next = shared.finish_fallback(generation);
                let _ = job.reply.send(Err(PoolError::Unavailable(e.to_string())));
                match next {
                    Next::Run(queued) => job = queued,
                    Next::Idle | Next::Retired => return,
                }
            }
        }
    }
}

/// Runs `job`, then whatever `finish` hands back, until `finish` reports idle.
///
/// Bookkeeping is updated before each reply is sent. Returns `false` once
/// the pool generation is gone; that result is dropped unsent.
fn drain(service: &mut dyn HashService, mut job: Job, mut finish: impl FnMut() -> Next) -> bool {
    loop {
        let Job {
            request,
            progress,
            reply,
        } = job;
        let method = request.method();
        let outcome = run_job(service, request, progress);
        if let Err(e) = &outcome {
            debug!(method, error = %e, "hash task failed");
        }

        match finish() {
            Next::Run(next) => {
                let _ = reply.send(outcome);
                job = next;
            }
            Next::Idle => {
                let _ = reply.send(outcome);
                return true;
            }
            Next::Retired => {
                debug!(method, "discarding result of abandoned task");
                return false;
            }
        }
    }
}

/// Runs one request, converting a panic into a task-scoped error.
///
/// Progress reaching the callback never decreases.
fn run_job(
    service: &mut dyn HashService,
    request: HashRequest,
    mut progress: Option<ProgressFn>,
) -> Result<HashResponse, PoolError> {
    let method = request.method();
    let mut last = 0.0_f64;
    let mut report = |p: f64| {
        if let Some(cb) = progress.as_mut()
            && p >= last
        {
            last = p;
            cb(p);
        }
    };

    match panic::catch_unwind(AssertUnwindSafe(|| service.handle(request, &mut report))) {
        Ok(result) => result.map_err(PoolError::from),
        Err(_) => {
            warn!(method, "hash service panicked");
            Err(PoolError::WorkerPanicked(method))
        }
    }
}
