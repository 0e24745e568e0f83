//! Generation requests and the priority queue they wait in
//!
//! Lower priority values are more urgent. Within one priority, requests
//! leave in submission order; a monotonic sequence number breaks ties
//! between identical timestamps.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::Instant;

use readium_render::{BackendPreference, RenderRequest, TargetSize};

use crate::lock;

/// Two qualities closer than this describe the same work.
pub const QUALITY_EPSILON: f64 = 0.001;

/// A request for one page thumbnail.
///
/// After creation only `priority`, `retry_count` and `submitted_at`
/// change, and only when the request is retried or reprioritized.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub page_index: usize,
    pub size: TargetSize,
    /// Render quality multiplier, 0.1-3.0
    pub quality: f64,
    /// Lower is more urgent
    pub priority: i32,
    pub submitted_at: Instant,
    pub retry_count: u32,
    pub preferred_backend: BackendPreference,
}

impl GenerationRequest {
    pub fn new(page_index: usize, size: TargetSize, quality: f64, priority: i32) -> Self {
        Self {
            page_index,
            size,
            quality,
            priority,
            submitted_at: Instant::now(),
            retry_count: 0,
            preferred_backend: BackendPreference::default(),
        }
    }

    pub fn with_backend(mut self, backend: BackendPreference) -> Self {
        self.preferred_backend = backend;
        self
    }

    /// `"{page}_{w}x{h}_q{quality}"`
    pub fn cache_key(&self) -> String {
        format!(
            "{}_{}x{}_q{}",
            self.page_index, self.size.width, self.size.height, self.quality
        )
    }

    /// Same page, size and quality: queuing both would render twice.
    pub fn is_same_work(&self, other: &GenerationRequest) -> bool {
        self.page_index == other.page_index
            && self.size == other.size
            && (self.quality - other.quality).abs() < QUALITY_EPSILON
    }

    pub fn render_request(&self) -> RenderRequest {
        RenderRequest::new(self.page_index, self.size)
            .with_quality(self.quality)
            .with_preference(self.preferred_backend)
    }
}

/// Heap entry; `Ord` is reversed so the max-heap yields the most urgent.
#[derive(Debug, Clone)]
struct QueuedRequest {
    request: GenerationRequest,
    sequence: u64,
}

impl QueuedRequest {
    fn rank(&self) -> (i32, Instant, u64) {
        (self.request.priority, self.request.submitted_at, self.sequence)
    }
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        other.rank().cmp(&self.rank())
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedRequest>,
    next_sequence: u64,
}

impl QueueState {
    fn rebuild<F>(&mut self, mut keep: F) -> Vec<GenerationRequest>
    where
        F: FnMut(&mut GenerationRequest) -> bool,
    {
        let mut removed = Vec::new();
        let mut remaining = Vec::with_capacity(self.heap.len());
        for mut entry in self.heap.drain() {
            if keep(&mut entry.request) {
                remaining.push(entry);
            } else {
                removed.push(entry);
            }
        }
        self.heap = remaining.into_iter().collect();
        removed.sort_by(|a, b| b.cmp(a));
        removed.into_iter().map(|entry| entry.request).collect()
    }
}

/// Thread-safe priority queue of generation requests with deduplication.
///
/// # Example
///
/// ```
/// use readium_render::TargetSize;
/// use readium_scheduler::{GenerationRequest, RequestQueue};
///
/// let queue = RequestQueue::new();
/// let size = TargetSize::new(120, 160);
/// queue.push(GenerationRequest::new(0, size, 1.0, 5));
/// queue.push(GenerationRequest::new(1, size, 1.0, 1));
///
/// // Identical work is queued once
/// assert!(!queue.push(GenerationRequest::new(1, size, 1.0, 3)));
///
/// assert_eq!(queue.pop().unwrap().page_index, 1);
/// assert_eq!(queue.pop().unwrap().page_index, 0);
/// ```
#[derive(Default)]
pub struct RequestQueue {
    state: Mutex<QueueState>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request unless identical work is already waiting.
    ///
    /// Returns whether the request was added.
    pub fn push(&self, request: GenerationRequest) -> bool {
        let mut state = lock(&self.state);
        if state
            .heap
            .iter()
            .any(|queued| queued.request.is_same_work(&request))
        {
            return false;
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.heap.push(QueuedRequest { request, sequence });
        true
    }

    /// Remove and return the most urgent request.
    pub fn pop(&self) -> Option<GenerationRequest> {
        lock(&self.state).heap.pop().map(|entry| entry.request)
    }

    pub fn len(&self) -> usize {
        lock(&self.state).heap.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).heap.is_empty()
    }

    /// Whether any request for `page` is waiting.
    pub fn contains_page(&self, page: usize) -> bool {
        lock(&self.state)
            .heap
            .iter()
            .any(|entry| entry.request.page_index == page)
    }

    /// Remove everything, returning the removed requests in queue order.
    pub fn clear(&self) -> Vec<GenerationRequest> {
        lock(&self.state).rebuild(|_| false)
    }

    /// Remove every request matching the predicate, in queue order.
    pub fn remove_if<F>(&self, predicate: F) -> Vec<GenerationRequest>
    where
        F: Fn(&GenerationRequest) -> bool,
    {
        lock(&self.state).rebuild(|request| !predicate(request))
    }

    /// Change the priority of every waiting request for `page` and restore
    /// heap order. Returns the number of requests updated.
    pub fn set_priority(&self, page: usize, priority: i32) -> usize {
        let mut updated = 0;
        lock(&self.state).rebuild(|request| {
            if request.page_index == page {
                request.priority = priority;
                updated += 1;
            }
            true
        });
        updated
    }
}
