//! Render worker pool
//!
//! Worker threads pull tasks from a shared channel, run the executor and
//! post a [`JobOutcome`] back to the owner. They never touch the request
//! queue or the active-job table. Panics inside the executor are caught at
//! the worker boundary and reported as failures.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use readium_render::{Bitmap, RenderError};

use crate::{lock, CancellationToken, GenerationRequest};

/// Unique job identifier
pub type JobId = u64;

/// Renders one request. Should return early once the token is cancelled.
pub type JobExecutor =
    Arc<dyn Fn(&GenerationRequest, &CancellationToken) -> Result<Bitmap, RenderError> + Send + Sync>;

/// Why a job did not produce a bitmap.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobFailure {
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("render worker panicked: {0}")]
    Panicked(String),
}

impl JobFailure {
    pub fn is_retryable(&self) -> bool {
        match self {
            JobFailure::Render(err) => err.is_retryable(),
            JobFailure::Panicked(_) => true,
        }
    }
}

/// Result of one job, sent from a worker to the owner thread.
#[derive(Debug)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub request: GenerationRequest,
    pub result: Result<Bitmap, JobFailure>,
    pub elapsed: Duration,
}

/// Lets the owner block until a worker is done with a job.
#[derive(Debug)]
pub struct JobHandle {
    done: flume::Receiver<()>,
}

impl JobHandle {
    /// Block until the worker has finished (or skipped) the job.
    pub fn wait(&self) {
        // Disconnection also means the worker is done with the task
        let _ = self.done.recv();
    }
}

struct Task {
    job_id: JobId,
    request: GenerationRequest,
    token: CancellationToken,
    done: flume::Sender<()>,
}

/// Pool of render worker threads, grown on demand.
pub struct WorkerPool {
    tasks: Option<flume::Sender<Task>>,
    task_queue: flume::Receiver<Task>,
    outcomes: flume::Sender<JobOutcome>,
    executor: JobExecutor,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create an empty pool whose workers report to `outcomes`.
    pub fn new(executor: JobExecutor, outcomes: flume::Sender<JobOutcome>) -> Self {
        let (tasks, task_queue) = flume::unbounded();
        Self {
            tasks: Some(tasks),
            task_queue,
            outcomes,
            executor,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn threads until at least `count` workers exist.
    pub fn ensure_workers(&self, count: usize) {
        let mut workers = lock(&self.workers);
        while workers.len() < count {
            let id = workers.len();
            let tasks = self.task_queue.clone();
            let outcomes = self.outcomes.clone();
            let executor = Arc::clone(&self.executor);

            let spawned = thread::Builder::new()
                .name(format!("readium-render-worker-{id}"))
                .spawn(move || run_worker(tasks, outcomes, executor));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    log::error!("Failed to spawn render worker {id}: {err}");
                    break;
                }
            }
        }
    }

    pub fn num_workers(&self) -> usize {
        lock(&self.workers).len()
    }

    /// Hand a job to the next idle worker.
    pub fn spawn(&self, job_id: JobId, request: GenerationRequest, token: CancellationToken) -> JobHandle {
        let (done, done_rx) = flume::bounded(1);
        let task = Task {
            job_id,
            request,
            token,
            done,
        };
        if let Some(tasks) = &self.tasks {
            // The pool keeps its own receiver, so the channel cannot be closed here
            if tasks.send(task).is_err() {
                log::error!("Render task channel closed, job {job_id} dropped");
            }
        }
        JobHandle { done: done_rx }
    }

    /// Stop accepting work and join every worker after its current task.
    pub fn shutdown(mut self) {
        self.join_workers();
    }

    fn join_workers(&mut self) {
        self.tasks.take();
        // Tasks still queued are dropped, which releases anyone waiting on them
        let _ = self.task_queue.drain();
        let workers = std::mem::take(&mut *lock(&self.workers));
        for worker in workers {
            if worker.join().is_err() {
                log::error!("Render worker exited by panic");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.join_workers();
    }
}

fn run_worker(
    tasks: flume::Receiver<Task>,
    outcomes: flume::Sender<JobOutcome>,
    executor: JobExecutor,
) {
    for task in tasks.iter() {
        let Task {
            job_id,
            request,
            token,
            done,
        } = task;

        if token.is_cancelled() {
            log::trace!("Skipping cancelled job {job_id} for page {}", request.page_index);
            drop(done);
            continue;
        }

        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| executor(&request, &token)))
            .unwrap_or_else(|payload| Err(RenderError::Panicked(panic_message(payload.as_ref()))))
            .map_err(|err| match err {
                RenderError::Panicked(message) => JobFailure::Panicked(message),
                other => JobFailure::Render(other),
            });

        let outcome = JobOutcome {
            job_id,
            request,
            result,
            elapsed: started.elapsed(),
        };
        if outcomes.send(outcome).is_err() {
            log::debug!("Outcome of job {job_id} dropped, scheduler is gone");
        }
        let _ = done.send(());
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use readium_render::TargetSize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(page: usize) -> GenerationRequest {
        GenerationRequest::new(page, TargetSize::new(4, 4), 1.0, 0)
    }

    fn pool_with<F>(executor: F) -> (WorkerPool, flume::Receiver<JobOutcome>)
    where
        F: Fn(&GenerationRequest, &CancellationToken) -> Result<Bitmap, RenderError>
            + Send
            + Sync
            + 'static,
    {
        let (tx, rx) = flume::unbounded();
        (WorkerPool::new(Arc::new(executor), tx), rx)
    }

    #[test]
    fn test_pool_starts_empty_and_grows() {
        let (pool, _rx) = pool_with(|_, _| Ok(Bitmap::new(1, 1)));
        assert_eq!(pool.num_workers(), 0);

        pool.ensure_workers(3);
        assert_eq!(pool.num_workers(), 3);
        pool.ensure_workers(2);
        assert_eq!(pool.num_workers(), 3);
        pool.shutdown();
    }

    #[test]
    fn test_executes_and_reports() {
        let (pool, rx) = pool_with(|request, _| {
            Ok(Bitmap::new(request.size.width, request.size.height))
        });
        pool.ensure_workers(2);

        let handles: Vec<JobHandle> = (0..4)
            .map(|page| pool.spawn(page as JobId, request(page), CancellationToken::new()))
            .collect();
        for handle in &handles {
            handle.wait();
        }

        let mut pages: Vec<usize> = rx.try_iter().map(|o| o.request.page_index).collect();
        pages.sort_unstable();
        assert_eq!(pages, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_cancelled_task_skipped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let (pool, rx) = pool_with(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Bitmap::new(1, 1))
        });
        pool.ensure_workers(1);

        let token = CancellationToken::new();
        token.cancel();
        pool.spawn(1, request(0), token).wait();

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_panic_becomes_failure() {
        let (pool, rx) = pool_with(|_, _| panic!("rasterizer exploded"));
        pool.ensure_workers(1);

        pool.spawn(7, request(0), CancellationToken::new()).wait();

        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.job_id, 7);
        assert_eq!(
            outcome.result.unwrap_err(),
            JobFailure::Panicked("rasterizer exploded".to_string())
        );

        // The worker survives the panic
        pool.spawn(8, request(1), CancellationToken::new()).wait();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_error_propagates() {
        let (pool, rx) = pool_with(|request, _| {
            Err(RenderError::EmptyRaster {
                page: request.page_index,
            })
        });
        pool.ensure_workers(1);
        pool.spawn(1, request(3), CancellationToken::new()).wait();

        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            outcome.result.unwrap_err(),
            JobFailure::Render(RenderError::EmptyRaster { page: 3 })
        );
    }

    #[test]
    fn test_wait_blocks_until_done() {
        let (pool, rx) = pool_with(|_, _| {
            thread::sleep(Duration::from_millis(100));
            Ok(Bitmap::new(1, 1))
        });
        pool.ensure_workers(1);

        let started = Instant::now();
        let handle = pool.spawn(1, request(0), CancellationToken::new());
        handle.wait();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_shutdown_joins_workers() {
        let (pool, _rx) = pool_with(|_, _| Ok(Bitmap::new(1, 1)));
        pool.ensure_workers(4);
        pool.shutdown();
    }
}
