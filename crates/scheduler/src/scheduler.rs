//! Job scheduler
//!
//! Owns the request queue, the active-job table and the worker pool.
//! The owner thread drives it: `submit` queues work, `dispatch` admits
//! queued requests while fewer than the concurrency limit are running,
//! and `drain_completions` / `wait_completion` turn worker outcomes into
//! [`Completion`]s, re-queueing retryable failures.
//!
//! When the queue lock and the active-table lock are both held, the
//! active-table lock is taken first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use readium_render::{Bitmap, RenderError};

use crate::worker::{JobExecutor, JobFailure, JobHandle, JobId, JobOutcome, WorkerPool};
use crate::{lock, CancellationToken, GenerationRequest, RequestQueue};

/// Upper bound for the concurrency limit.
pub const MAX_CONCURRENT_JOBS: usize = 8;
/// Upper bound for the retry limit.
pub const MAX_RETRIES: u32 = 5;
/// Added to a request's priority each time it is retried.
pub const RETRY_PRIORITY_PENALTY: i32 = 10;
/// Adaptive tuning never raises the limit above this.
pub const ADAPTIVE_CEILING: usize = 6;
/// Adaptive tuning never lowers the limit below this.
pub const ADAPTIVE_FLOOR: usize = 2;

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Jobs allowed in flight, 1-8
    pub max_concurrent_jobs: usize,
    /// Retries after the first attempt, 0-5
    pub max_retries: u32,
    /// Queue depth unit for adaptive concurrency
    pub batch_size: usize,
    pub adaptive_concurrency: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 6,
            max_retries: 2,
            batch_size: 8,
            adaptive_concurrency: true,
        }
    }
}

/// What `submit` did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    /// Identical work is already waiting
    Duplicate,
    /// A job for this page is in flight
    PageActive,
}

/// What `cancel` removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CancelOutcome {
    /// Queued requests dropped
    pub queued: usize,
    /// Whether an in-flight job was cancelled
    pub in_flight: bool,
}

impl CancelOutcome {
    pub fn is_empty(&self) -> bool {
        self.queued == 0 && !self.in_flight
    }
}

/// A worker outcome after the scheduler has accounted for it.
#[derive(Debug)]
pub enum Completion {
    Finished {
        request: GenerationRequest,
        bitmap: Bitmap,
        elapsed: Duration,
    },
    /// Failed and re-queued; `request` is the re-queued copy
    Retrying {
        request: GenerationRequest,
        error: JobFailure,
    },
    /// Failed for good
    Failed {
        request: GenerationRequest,
        error: JobFailure,
    },
    /// The job had been cancelled or superseded; its result was dropped
    Discarded { page: usize },
}

impl Completion {
    pub fn page(&self) -> usize {
        match self {
            Completion::Finished { request, .. }
            | Completion::Retrying { request, .. }
            | Completion::Failed { request, .. } => request.page_index,
            Completion::Discarded { page } => *page,
        }
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub dispatched: u64,
    pub completed: u64,
    /// Every failed attempt, retried or not
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    pub discarded: u64,
}

struct ActiveJob {
    id: JobId,
    request: GenerationRequest,
    token: CancellationToken,
    handle: JobHandle,
    started: Instant,
}

/// Priority-queued, bounded-concurrency job scheduler.
pub struct JobScheduler {
    queue: RequestQueue,
    active: Mutex<HashMap<usize, ActiveJob>>,
    pool: WorkerPool,
    completions: flume::Receiver<JobOutcome>,
    concurrency: AtomicUsize,
    max_retries: AtomicU32,
    batch_size: usize,
    adaptive: AtomicBool,
    paused: AtomicBool,
    next_job_id: AtomicU64,
    stats: Mutex<SchedulerStats>,
}

impl JobScheduler {
    /// Create a scheduler whose workers run `executor`.
    pub fn new<F>(config: SchedulerConfig, executor: F) -> Self
    where
        F: Fn(&GenerationRequest, &CancellationToken) -> Result<Bitmap, RenderError>
            + Send
            + Sync
            + 'static,
    {
        Self::with_executor(config, std::sync::Arc::new(executor))
    }

    pub fn with_executor(config: SchedulerConfig, executor: JobExecutor) -> Self {
        let (outcomes, completions) = flume::unbounded();
        Self {
            queue: RequestQueue::new(),
            active: Mutex::new(HashMap::new()),
            pool: WorkerPool::new(executor, outcomes),
            completions,
            concurrency: AtomicUsize::new(clamp_concurrency(config.max_concurrent_jobs)),
            max_retries: AtomicU32::new(config.max_retries.min(MAX_RETRIES)),
            batch_size: config.batch_size.max(1),
            adaptive: AtomicBool::new(config.adaptive_concurrency),
            paused: AtomicBool::new(false),
            next_job_id: AtomicU64::new(1),
            stats: Mutex::new(SchedulerStats::default()),
        }
    }

    /// Queue a request unless identical work is in flight or already
    /// waiting.
    ///
    /// A request for a page whose in-flight job renders something else is
    /// queued and dispatched once that job has finished.
    pub fn submit(&self, request: GenerationRequest) -> Admission {
        let rendering_same = lock(&self.active)
            .get(&request.page_index)
            .is_some_and(|job| job.request.is_same_work(&request));
        if rendering_same {
            return Admission::PageActive;
        }
        if !self.queue.push(request) {
            return Admission::Duplicate;
        }
        lock(&self.stats).submitted += 1;
        Admission::Queued
    }

    /// Admit queued requests while under the concurrency limit.
    ///
    /// Returns the requests handed to workers, in dispatch order.
    pub fn dispatch(&self) -> Vec<GenerationRequest> {
        if self.is_paused() {
            return Vec::new();
        }

        let limit = self.max_concurrent_jobs();
        self.pool.ensure_workers(limit);

        let mut started = Vec::new();
        let mut deferred = Vec::new();
        // Limit check, pop and insert share one lock
        let mut active = lock(&self.active);
        while active.len() < limit {
            let Some(request) = self.queue.pop() else {
                break;
            };
            if active.contains_key(&request.page_index) {
                deferred.push(request);
                continue;
            }

            let id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
            let token = CancellationToken::new();
            let handle = self.pool.spawn(id, request.clone(), token.clone());
            active.insert(
                request.page_index,
                ActiveJob {
                    id,
                    request: request.clone(),
                    token,
                    handle,
                    started: Instant::now(),
                },
            );
            started.push(request);
        }
        for request in deferred {
            log::trace!("Page {} still rendering, request deferred", request.page_index);
            self.queue.push(request);
        }
        drop(active);

        if !started.is_empty() {
            lock(&self.stats).dispatched += started.len() as u64;
        }
        started
    }

    /// Resolve every outcome already posted by workers.
    pub fn drain_completions(&self) -> Vec<Completion> {
        self.completions
            .try_iter()
            .map(|outcome| self.resolve(outcome))
            .collect()
    }

    /// Block up to `timeout` for the next outcome.
    pub fn wait_completion(&self, timeout: Duration) -> Option<Completion> {
        self.completions
            .recv_timeout(timeout)
            .ok()
            .map(|outcome| self.resolve(outcome))
    }

    fn resolve(&self, outcome: JobOutcome) -> Completion {
        let page = outcome.request.page_index;
        let job = {
            let mut active = lock(&self.active);
            match active.get(&page) {
                Some(job) if job.id == outcome.job_id => active.remove(&page),
                _ => None,
            }
        };

        let Some(job) = job else {
            log::trace!("Dropping result of cancelled job {} (page {page})", outcome.job_id);
            lock(&self.stats).discarded += 1;
            return Completion::Discarded { page };
        };

        match outcome.result {
            Ok(bitmap) => {
                lock(&self.stats).completed += 1;
                Completion::Finished {
                    request: outcome.request,
                    bitmap,
                    elapsed: outcome.elapsed,
                }
            }
            Err(error) => self.handle_failure(outcome.request, error, job.started),
        }
    }

    fn handle_failure(
        &self,
        request: GenerationRequest,
        error: JobFailure,
        started: Instant,
    ) -> Completion {
        let max_retries = self.max_retries();
        let retry = error.is_retryable() && request.retry_count < max_retries;

        lock(&self.stats).failed += 1;
        if !retry {
            log::warn!(
                "Thumbnail for page {} failed after {} attempt(s): {error}",
                request.page_index,
                request.retry_count + 1
            );
            return Completion::Failed { request, error };
        }

        let mut retried = request.clone();
        retried.retry_count += 1;
        retried.priority = retried.priority.saturating_add(RETRY_PRIORITY_PENALTY);
        retried.submitted_at = Instant::now();
        if !self.queue.push(retried.clone()) {
            log::debug!(
                "Retry of page {} not queued, identical work already waiting: {error}",
                request.page_index
            );
            return Completion::Failed { request, error };
        }

        lock(&self.stats).retried += 1;
        log::debug!(
            "Retrying page {} ({}/{max_retries}) after {:?}: {error}",
            retried.page_index,
            retried.retry_count,
            started.elapsed()
        );
        Completion::Retrying {
            request: retried,
            error,
        }
    }

    /// Drop queued requests for `page` and cancel its in-flight job.
    ///
    /// A cancelled job's result is discarded when it arrives.
    pub fn cancel(&self, page: usize) -> CancelOutcome {
        let queued = self.queue.remove_if(|request| request.page_index == page).len();
        let job = lock(&self.active).remove(&page);
        let in_flight = match job {
            Some(job) => {
                job.token.cancel();
                true
            }
            None => false,
        };

        let outcome = CancelOutcome { queued, in_flight };
        if !outcome.is_empty() {
            lock(&self.stats).cancelled += (queued + usize::from(in_flight)) as u64;
        }
        outcome
    }

    /// Reprioritize queued requests for `page`.
    pub fn set_priority(&self, page: usize, priority: i32) -> usize {
        self.queue.set_priority(page, priority)
    }

    /// Remove every queued request, returning them in queue order.
    pub fn clear_queue(&self) -> Vec<GenerationRequest> {
        let cleared = self.queue.clear();
        if !cleared.is_empty() {
            lock(&self.stats).cancelled += cleared.len() as u64;
        }
        cleared
    }

    /// Remove queued requests matching `predicate`.
    pub fn remove_queued_where<F>(&self, predicate: F) -> Vec<GenerationRequest>
    where
        F: Fn(&GenerationRequest) -> bool,
    {
        let removed = self.queue.remove_if(predicate);
        if !removed.is_empty() {
            lock(&self.stats).cancelled += removed.len() as u64;
        }
        removed
    }

    /// Clear the queue, cancel every in-flight job and block until each
    /// worker has let go of it.
    ///
    /// Returns every request that was dropped, queued ones first. Outcomes
    /// already posted by workers are discarded.
    pub fn stop(&self) -> Vec<GenerationRequest> {
        let mut dropped = self.queue.clear();
        let jobs: Vec<ActiveJob> = lock(&self.active).drain().map(|(_, job)| job).collect();

        for job in &jobs {
            job.token.cancel();
        }
        for job in &jobs {
            job.handle.wait();
        }
        let stale = self.completions.try_iter().count();

        {
            let mut stats = lock(&self.stats);
            stats.cancelled += (dropped.len() + jobs.len()) as u64;
            stats.discarded += stale as u64;
        }
        if !jobs.is_empty() {
            log::debug!("Stopped {} in-flight job(s), discarded {stale} result(s)", jobs.len());
        }

        dropped.extend(jobs.into_iter().map(|job| job.request));
        dropped
    }

    /// Stop admitting new jobs; in-flight jobs keep running.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// One additive step of concurrency tuning from the queue depth.
    ///
    /// Returns the new limit if it changed.
    pub fn adapt_concurrency(&self) -> Option<usize> {
        if !self.adaptive.load(Ordering::Relaxed) {
            return None;
        }

        let depth = self.queue.len();
        let current = self.max_concurrent_jobs();
        let next = if depth > self.batch_size * 2 && current < ADAPTIVE_CEILING {
            current + 1
        } else if depth < self.batch_size && current > ADAPTIVE_FLOOR {
            current - 1
        } else {
            return None;
        };

        self.concurrency.store(next, Ordering::Relaxed);
        log::debug!("Concurrency {current} -> {next} (queue depth {depth})");
        Some(next)
    }

    /// Takes effect on the next `dispatch`.
    pub fn set_max_concurrent_jobs(&self, jobs: usize) {
        self.concurrency.store(clamp_concurrency(jobs), Ordering::Relaxed);
    }

    pub fn max_concurrent_jobs(&self) -> usize {
        self.concurrency.load(Ordering::Relaxed)
    }

    pub fn set_max_retries(&self, retries: u32) {
        self.max_retries.store(retries.min(MAX_RETRIES), Ordering::Relaxed);
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.load(Ordering::Relaxed)
    }

    pub fn set_adaptive_concurrency(&self, enabled: bool) {
        self.adaptive.store(enabled, Ordering::Relaxed);
    }

    pub fn adaptive_concurrency(&self) -> bool {
        self.adaptive.load(Ordering::Relaxed)
    }

    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    pub fn has_active(&self, page: usize) -> bool {
        lock(&self.active).contains_key(&page)
    }

    pub fn is_queued(&self, page: usize) -> bool {
        self.queue.contains_page(page)
    }

    /// Nothing queued and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && lock(&self.active).is_empty()
    }

    pub fn num_workers(&self) -> usize {
        self.pool.num_workers()
    }

    pub fn stats(&self) -> SchedulerStats {
        *lock(&self.stats)
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        // Let running jobs bail out early; the pool joins its workers next
        for job in lock(&self.active).values() {
            job.token.cancel();
        }
    }
}

fn clamp_concurrency(jobs: usize) -> usize {
    jobs.clamp(1, MAX_CONCURRENT_JOBS)
}
