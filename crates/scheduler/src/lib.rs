//! Readium Scheduler Library
//!
//! Priority-queued, bounded-concurrency scheduling of thumbnail render jobs.
//!
//! Requests wait in a priority queue (lower value = more urgent, FIFO
//! within a priority). The scheduler admits them onto a worker pool while
//! fewer than the concurrency limit are running, keeps at most one job per
//! page in flight, retries failures with a priority penalty, and tunes the
//! concurrency limit to the queue depth.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use readium_render::{Bitmap, TargetSize};
//! use readium_scheduler::{Completion, GenerationRequest, JobScheduler, SchedulerConfig};
//!
//! let scheduler = JobScheduler::new(SchedulerConfig::default(), |request, _token| {
//!     Ok(Bitmap::new(request.size.width, request.size.height))
//! });
//!
//! scheduler.submit(GenerationRequest::new(0, TargetSize::new(12, 16), 1.0, 0));
//! scheduler.dispatch();
//!
//! match scheduler.wait_completion(Duration::from_secs(5)) {
//!     Some(Completion::Finished { request, bitmap, .. }) => {
//!         assert_eq!(request.page_index, 0);
//!         assert_eq!(bitmap.dimensions(), (12, 16));
//!     }
//!     other => panic!("unexpected completion: {other:?}"),
//! }
//! ```

mod cancel;
mod priority;
mod scheduler;
mod viewport;
mod worker;

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-export public API
pub use cancel::{Cancelled, CancellationToken};
pub use priority::{GenerationRequest, RequestQueue, QUALITY_EPSILON};
pub use scheduler::{
    Admission, CancelOutcome, Completion, JobScheduler, SchedulerConfig, SchedulerStats,
    ADAPTIVE_CEILING, ADAPTIVE_FLOOR, MAX_CONCURRENT_JOBS, MAX_RETRIES, RETRY_PRIORITY_PENALTY,
};
pub use viewport::{ViewportPriority, DEFAULT_PRIORITY, MARGIN_PRIORITY, VISIBLE_PRIORITY};
pub use worker::{JobExecutor, JobFailure, JobHandle, JobId, JobOutcome, WorkerPool};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
