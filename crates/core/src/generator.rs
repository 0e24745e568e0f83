//! Thumbnail generator
//!
//! The façade consumers talk to. It validates requests, feeds the job
//! scheduler, tracks per-page state, keeps statistics and turns scheduler
//! completions into [`GeneratorEvent`]s.
//!
//! One owner thread drives it by calling [`tick`](ThumbnailGenerator::tick)
//! on a timer or [`pump`](ThumbnailGenerator::pump), which blocks on the
//! completion channel. Every other method may be called from any thread.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use readium_cache::{CacheStats, CacheStrategy, PoolStats};
use readium_render::{
    BackendPreference, GpuRasterizer, PageSource, RenderBackend, RenderError, TargetSize,
};
use readium_scheduler::{
    Admission, Completion, GenerationRequest, JobScheduler, SchedulerStats,
};

use crate::config::{clamp_quality, GeneratorConfig};
use crate::error::{RequestError, RequestResult};
use crate::events::{EventBus, GeneratorEvent};
use crate::state::{PageState, PageStateTable};
use crate::{lock, read, write};

/// Renders slower than this are logged.
const SLOW_RENDER: Duration = Duration::from_secs(1);

/// Batch ticks between statistics summaries in the log.
const SUMMARY_EVERY_TICKS: u64 = 50;

type DocumentSlot = Arc<RwLock<Option<Arc<dyn PageSource>>>>;

/// Snapshot of generator statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GeneratorStatistics {
    /// Thumbnails rendered successfully
    pub total_generated: u64,

    /// Failed attempts, including ones that were retried
    pub total_errors: u64,

    /// Time spent in successful renders
    pub total_render_time: Duration,

    pub queue_size: usize,
    pub active_jobs: usize,
    pub scheduler: SchedulerStats,
    pub cache: CacheStats,
    pub pool: PoolStats,
}

impl GeneratorStatistics {
    /// Share of finished attempts that succeeded, 0.0 before any finished.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_generated + self.total_errors;
        if total == 0 {
            0.0
        } else {
            self.total_generated as f64 / total as f64
        }
    }

    /// Mean duration of a successful render.
    pub fn average_render_time(&self) -> Duration {
        average_render_time(self.total_render_time, self.total_generated)
    }
}

fn average_render_time(render_time: Duration, generated: u64) -> Duration {
    if generated == 0 {
        Duration::ZERO
    } else {
        render_time.div_f64(generated as f64)
    }
}

/// Per-request overrides of the generator defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ThumbnailOptions {
    /// Target box, the default thumbnail size when unset
    pub size: Option<TargetSize>,
    /// Quality multiplier, the default quality when unset
    pub quality: Option<f64>,
    pub priority: i32,
    /// Rasterizer, the render mode when unset
    pub backend: Option<BackendPreference>,
}

impl ThumbnailOptions {
    pub fn with_size(mut self, size: TargetSize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_backend(mut self, backend: BackendPreference) -> Self {
        self.backend = Some(backend);
        self
    }
}

/// Size, quality and rasterizer of one submission.
#[derive(Clone, Copy)]
struct Variant {
    size: TargetSize,
    quality: f64,
    backend: BackendPreference,
}

#[derive(Default)]
struct Totals {
    generated: u64,
    errors: u64,
    render_time: Duration,
}

struct Settings {
    thumbnail_size: TargetSize,
    quality: f64,
    render_mode: BackendPreference,
    cache_strategy: CacheStrategy,
    batch_interval: Duration,
}

/// Asynchronous thumbnail generator.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use readium_core::{GeneratorConfig, GeneratorEvent, ThumbnailGenerator};
/// use readium_render::SyntheticDocument;
///
/// let generator = ThumbnailGenerator::new(GeneratorConfig::default());
/// generator.set_document(Some(Arc::new(SyntheticDocument::letter(3))));
/// let events = generator.subscribe();
///
/// generator.generate_thumbnail(1, 0).unwrap();
/// assert!(generator.wait_idle(Duration::from_secs(10)));
///
/// let generated = events
///     .try_iter()
///     .any(|event| matches!(event, GeneratorEvent::ThumbnailGenerated { page: 1, .. }));
/// assert!(generated);
/// ```
pub struct ThumbnailGenerator {
    document: DocumentSlot,
    backend: Arc<RenderBackend>,
    scheduler: JobScheduler,
    states: PageStateTable,
    events: EventBus,
    settings: Mutex<Settings>,
    totals: Mutex<Totals>,
    running: AtomicBool,
    batch_ticks: AtomicU64,
    last_batch: Mutex<Instant>,
}

impl ThumbnailGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        let backend = RenderBackend::new(&config.cache, config.device_pixel_ratio);
        Self::with_backend(config, backend)
    }

    /// Generator with a hardware rasterizer attached.
    pub fn with_gpu(config: GeneratorConfig, gpu: Arc<dyn GpuRasterizer>) -> Self {
        let backend =
            RenderBackend::new(&config.cache, config.device_pixel_ratio).with_gpu(gpu);
        Self::with_backend(config, backend)
    }

    fn with_backend(config: GeneratorConfig, backend: RenderBackend) -> Self {
        backend.set_gpu_enabled(config.gpu_acceleration);
        let backend = Arc::new(backend);
        let document: DocumentSlot = Arc::new(RwLock::new(None));

        let executor_document = Arc::clone(&document);
        let executor_backend = Arc::clone(&backend);
        let scheduler = JobScheduler::new(config.scheduler_config(), move |request, _token| {
            // Clone the handle so the document lock is not held while rendering
            let source = read(&executor_document)
                .clone()
                .ok_or(RenderError::NoDocument)?;
            executor_backend.render(source.as_ref(), &request.render_request())
        });

        let generator = Self {
            document,
            backend,
            scheduler,
            states: PageStateTable::new(),
            events: EventBus::new(),
            settings: Mutex::new(Settings {
                thumbnail_size: config.thumbnail_size,
                quality: clamp_quality(config.quality),
                render_mode: config.render_mode,
                cache_strategy: config.cache_strategy,
                batch_interval: config.batch_interval,
            }),
            totals: Mutex::new(Totals::default()),
            running: AtomicBool::new(true),
            batch_ticks: AtomicU64::new(0),
            last_batch: Mutex::new(Instant::now()),
        };
        generator.set_render_mode(config.render_mode);
        generator
    }

    /// Replace the document.
    ///
    /// Stops admitting work, cancels and waits for in-flight jobs, clears
    /// the queue and page states, then installs `source`.
    pub fn set_document(&self, source: Option<Arc<dyn PageSource>>) {
        // Requests fail with NoDocument until the new source is in place
        let previous = write(&self.document).take();

        let dropped = self.scheduler.stop();
        self.states.clear();
        self.backend.cache().clear();

        let pages = source.as_ref().map_or(0, |doc| doc.num_pages());
        *write(&self.document) = source;

        if previous.is_some() || !dropped.is_empty() {
            log::info!(
                "Document replaced, {} pending request(s) dropped, new document has {pages} page(s)",
                dropped.len()
            );
        } else {
            log::info!("Document set, {pages} page(s)");
        }
        self.events.emit(GeneratorEvent::QueueSizeChanged(0));
        self.events.emit(GeneratorEvent::ActiveJobsChanged(0));
    }

    pub fn document(&self) -> Option<Arc<dyn PageSource>> {
        read(&self.document).clone()
    }

    /// Pages in the current document, 0 without one.
    pub fn page_count(&self) -> usize {
        self.document().map_or(0, |doc| doc.num_pages())
    }

    /// Queue `page` at the default size, quality and render mode.
    pub fn generate_thumbnail(&self, page: usize, priority: i32) -> RequestResult<()> {
        self.generate_thumbnail_with(page, ThumbnailOptions::default().with_priority(priority))
    }

    /// Queue `page`, overriding the defaults with whatever `options` sets.
    ///
    /// Invalid requests are rejected with an error and a `ThumbnailError`
    /// event and never reach the queue. Requests identical to one already
    /// rendering or queued are ignored.
    pub fn generate_thumbnail_with(&self, page: usize, options: ThumbnailOptions) -> RequestResult<()> {
        let variant = self.variant(&options);
        if let Err(err) = self.validate(page, variant.size) {
            self.events.emit(GeneratorEvent::ThumbnailError {
                page,
                message: err.to_string(),
            });
            return Err(err);
        }

        if self.enqueue(page, variant, options.priority) {
            self.events
                .emit(GeneratorEvent::QueueSizeChanged(self.scheduler.queue_size()));
            self.dispatch();
        }
        Ok(())
    }

    /// Queue `start..=end`, clamped to the document, with priorities
    /// increasing from 0 at `start`. `size` and `quality` default to the
    /// generator settings. Returns how many requests were queued.
    pub fn generate_thumbnail_range(
        &self,
        start: usize,
        end: usize,
        size: Option<TargetSize>,
        quality: Option<f64>,
    ) -> RequestResult<usize> {
        let Some(document) = self.document() else {
            return Err(RequestError::NoDocument);
        };
        let variant = self.variant(&ThumbnailOptions {
            size,
            quality,
            ..ThumbnailOptions::default()
        });
        if variant.size.is_empty() {
            return Err(RequestError::ZeroTargetSize {
                width: variant.size.width,
                height: variant.size.height,
            });
        }
        let page_count = document.num_pages();
        if page_count == 0 {
            return Ok(0);
        }

        let start = start.min(page_count - 1);
        let end = end.clamp(start, page_count - 1);

        let queued = (start..=end)
            .filter(|page| self.enqueue(*page, variant, (page - start) as i32))
            .count();
        self.after_enqueue(queued);
        Ok(queued)
    }

    /// Queue a set of pages, ordered by page index (or by page area under
    /// the memory-aware strategy) with priority equal to position.
    ///
    /// Pages outside the document are skipped. Returns how many requests
    /// were queued.
    pub fn generate_thumbnail_batch(&self, pages: &[usize]) -> RequestResult<usize> {
        let Some(document) = self.document() else {
            return Err(RequestError::NoDocument);
        };
        let page_count = document.num_pages();

        let mut ordered: Vec<usize> = pages.iter().copied().filter(|p| *p < page_count).collect();
        ordered.sort_unstable();
        ordered.dedup();
        if self.cache_strategy() == CacheStrategy::MemoryAware {
            ordered.sort_by(|a, b| {
                let area = |page: usize| {
                    document
                        .page_size(page)
                        .map_or(0.0, |size| size.width * size.height)
                };
                area(*a).total_cmp(&area(*b))
            });
        }

        let variant = self.variant(&ThumbnailOptions::default());
        let queued = ordered
            .iter()
            .enumerate()
            .filter(|(position, page)| self.enqueue(**page, variant, *position as i32))
            .count();
        self.after_enqueue(queued);
        Ok(queued)
    }

    fn validate(&self, page: usize, size: TargetSize) -> RequestResult<()> {
        let Some(document) = self.document() else {
            return Err(RequestError::NoDocument);
        };
        let page_count = document.num_pages();
        if page >= page_count {
            return Err(RequestError::InvalidPage { page, page_count });
        }
        if size.is_empty() {
            return Err(RequestError::ZeroTargetSize {
                width: size.width,
                height: size.height,
            });
        }
        Ok(())
    }

    /// Submit one request; true if it was queued.
    fn enqueue(&self, page: usize, variant: Variant, priority: i32) -> bool {
        let Variant {
            size,
            quality,
            backend,
        } = variant;
        let request = GenerationRequest::new(page, size, quality, priority).with_backend(backend);

        match self.scheduler.submit(request) {
            Admission::Queued => {
                self.states.transition(page, PageState::Queued);
                true
            }
            Admission::Duplicate => {
                log::trace!("Page {page} already queued at {}x{}", size.width, size.height);
                false
            }
            Admission::PageActive => {
                log::trace!("Page {page} already rendering at {}x{}", size.width, size.height);
                false
            }
        }
    }

    fn after_enqueue(&self, queued: usize) {
        if queued > 0 {
            self.events
                .emit(GeneratorEvent::QueueSizeChanged(self.scheduler.queue_size()));
            self.dispatch();
        }
    }

    fn variant(&self, options: &ThumbnailOptions) -> Variant {
        let settings = lock(&self.settings);
        Variant {
            size: options.size.unwrap_or(settings.thumbnail_size),
            quality: options.quality.map_or(settings.quality, clamp_quality),
            backend: options.backend.unwrap_or(settings.render_mode),
        }
    }

    /// Admit queued work onto the workers.
    fn dispatch(&self) {
        if !self.is_running() {
            return;
        }
        let started = self.scheduler.dispatch();
        if started.is_empty() {
            return;
        }

        for request in &started {
            self.states.transition(request.page_index, PageState::Rendering);
        }
        self.events
            .emit(GeneratorEvent::QueueSizeChanged(self.scheduler.queue_size()));
        self.events
            .emit(GeneratorEvent::ActiveJobsChanged(self.scheduler.active_count()));
    }

    /// Process finished jobs, run the batch tick when due and admit more
    /// work. Returns the number of completions handled.
    pub fn tick(&self) -> usize {
        let completions = self.scheduler.drain_completions();
        let handled = completions.len();
        self.handle_completions(completions);

        let batch_due = {
            let interval = lock(&self.settings).batch_interval;
            let mut last = lock(&self.last_batch);
            if last.elapsed() >= interval {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if batch_due {
            self.batch_tick();
        }

        self.dispatch();
        handled
    }

    /// Like [`tick`](Self::tick), but first blocks up to `timeout` for a
    /// completion when none is ready.
    pub fn pump(&self, timeout: Duration) -> usize {
        self.dispatch();
        let mut handled = 0;
        if let Some(completion) = self.scheduler.wait_completion(timeout) {
            self.handle_completions(vec![completion]);
            handled += 1;
        }
        handled + self.tick()
    }

    /// Pump until nothing is queued or in flight. Returns false if that
    /// did not happen within `timeout` (for example while paused).
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.tick();
            if self.scheduler.is_idle() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.pump((deadline - now).min(Duration::from_millis(50)));
        }
    }

    fn handle_completions(&self, completions: Vec<Completion>) {
        if completions.is_empty() {
            return;
        }

        for completion in completions {
            match completion {
                Completion::Finished {
                    request,
                    bitmap,
                    elapsed,
                } => {
                    let page = request.page_index;
                    {
                        let mut totals = lock(&self.totals);
                        totals.generated += 1;
                        totals.render_time += elapsed;
                    }
                    if elapsed > SLOW_RENDER {
                        log::debug!(
                            "Slow thumbnail: page {page} at {}x{} q{} took {elapsed:?}",
                            request.size.width,
                            request.size.height,
                            request.quality
                        );
                    }
                    self.settle(page, PageState::Cached);
                    self.events.emit(GeneratorEvent::ThumbnailGenerated {
                        page,
                        size: request.size,
                        quality: request.quality,
                        bitmap: Arc::new(bitmap),
                    });
                }
                Completion::Retrying { request, .. } => {
                    lock(&self.totals).errors += 1;
                    self.states.transition(request.page_index, PageState::Queued);
                    self.events
                        .emit(GeneratorEvent::QueueSizeChanged(self.scheduler.queue_size()));
                }
                Completion::Failed { request, error } => {
                    lock(&self.totals).errors += 1;
                    let page = request.page_index;
                    self.settle(page, PageState::Failed);
                    self.events.emit(GeneratorEvent::ThumbnailError {
                        page,
                        message: error.to_string(),
                    });
                }
                Completion::Discarded { page } => {
                    log::trace!("Discarded result for page {page}");
                }
            }
        }

        self.events
            .emit(GeneratorEvent::ActiveJobsChanged(self.scheduler.active_count()));
    }

    /// Record a finished job, going back to `Queued` if another request
    /// for the page is still waiting.
    fn settle(&self, page: usize, state: PageState) {
        self.states.transition(page, state);
        if self.scheduler.is_queued(page) {
            self.states.transition(page, PageState::Queued);
        }
    }

    fn batch_tick(&self) {
        self.scheduler.adapt_concurrency();
        self.backend.pool().sweep();

        let (generated, errors, render_time) = {
            let totals = lock(&self.totals);
            (totals.generated, totals.errors, totals.render_time)
        };
        let total = generated + errors;
        if total == 0 {
            return;
        }

        self.events.emit(GeneratorEvent::GenerationProgress {
            completed: generated,
            total,
        });

        let ticks = self.batch_ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if ticks % SUMMARY_EVERY_TICKS == 0 {
            log::debug!(
                "Thumbnail stats: success rate {:.1}%, avg time {:.1} ms, queue {}, active {}",
                generated as f64 / total as f64 * 100.0,
                average_render_time(render_time, generated).as_secs_f64() * 1000.0,
                self.scheduler.queue_size(),
                self.scheduler.active_count()
            );
        }
    }

    /// Drop queued requests for `page` and cancel its in-flight job.
    pub fn cancel_request(&self, page: usize) {
        let outcome = self.scheduler.cancel(page);
        if outcome.is_empty() {
            return;
        }

        if self.states.transition(page, PageState::Cancelled) {
            self.events.emit(GeneratorEvent::ThumbnailCancelled { page });
        }
        self.events
            .emit(GeneratorEvent::QueueSizeChanged(self.scheduler.queue_size()));
        if outcome.in_flight {
            self.events
                .emit(GeneratorEvent::ActiveJobsChanged(self.scheduler.active_count()));
        }
    }

    /// Reprioritize queued requests for `page`.
    pub fn set_priority(&self, page: usize, priority: i32) {
        self.scheduler.set_priority(page, priority);
    }

    /// Drop every queued request; in-flight jobs keep running.
    pub fn clear_queue(&self) {
        let cleared = self.scheduler.clear_queue();
        self.release_queued(&cleared);
        self.events.emit(GeneratorEvent::QueueSizeChanged(0));
    }

    /// Settle pages whose queued requests were removed. A page with a job
    /// in flight goes back to rendering, one with nothing left is cancelled.
    fn release_queued(&self, removed: &[GenerationRequest]) {
        let pages: BTreeSet<usize> = removed.iter().map(|request| request.page_index).collect();
        for page in pages {
            if self.scheduler.is_queued(page) {
                continue;
            }
            if self.scheduler.has_active(page) {
                self.states.transition(page, PageState::Rendering);
            } else if self.states.transition(page, PageState::Cancelled) {
                self.events.emit(GeneratorEvent::ThumbnailCancelled { page });
            }
        }
    }

    /// Stop admitting new jobs. In-flight jobs finish normally.
    pub fn pause(&self) {
        self.scheduler.pause();
    }

    pub fn resume(&self) {
        self.scheduler.resume();
        self.dispatch();
    }

    /// Clear the queue and cancel every in-flight job, waiting for the
    /// workers to let go of them.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.scheduler.resume();

        let dropped = self.scheduler.stop();
        self.release_queued(&dropped);
        log::info!("Thumbnail generation stopped, {} request(s) cancelled", dropped.len());

        self.events.emit(GeneratorEvent::QueueSizeChanged(0));
        self.events.emit(GeneratorEvent::ActiveJobsChanged(0));
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
        self.scheduler.resume();
        log::info!("Thumbnail generation started");
        self.dispatch();
    }

    /// Whether a job for `page` is in flight.
    pub fn is_generating(&self, page: usize) -> bool {
        self.scheduler.has_active(page)
    }

    pub fn is_paused(&self) -> bool {
        self.scheduler.is_paused()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn queue_size(&self) -> usize {
        self.scheduler.queue_size()
    }

    pub fn active_job_count(&self) -> usize {
        self.scheduler.active_count()
    }

    pub fn page_state(&self, page: usize) -> PageState {
        self.states.get(page)
    }

    pub fn statistics(&self) -> GeneratorStatistics {
        let (total_generated, total_errors, total_render_time) = {
            let totals = lock(&self.totals);
            (totals.generated, totals.errors, totals.render_time)
        };
        GeneratorStatistics {
            total_generated,
            total_errors,
            total_render_time,
            queue_size: self.scheduler.queue_size(),
            active_jobs: self.scheduler.active_count(),
            scheduler: self.scheduler.stats(),
            cache: self.backend.cache().stats(),
            pool: self.backend.pool().stats(),
        }
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> flume::Receiver<GeneratorEvent> {
        self.events.subscribe()
    }

    /// Run `listener` on the emitting thread for every event.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&GeneratorEvent) + Send + Sync + 'static,
    {
        self.events.add_listener(listener);
    }

    /// Change the default size. Queued requests made at the old default
    /// size are dropped.
    pub fn set_thumbnail_size(&self, size: TargetSize) {
        if size.is_empty() {
            return;
        }
        let previous = {
            let mut settings = lock(&self.settings);
            std::mem::replace(&mut settings.thumbnail_size, size)
        };
        if previous == size {
            return;
        }

        let removed = self.scheduler.remove_queued_where(|request| request.size == previous);
        self.release_queued(&removed);
        if !removed.is_empty() {
            log::debug!("Dropped {} queued request(s) at the old size", removed.len());
        }
        self.events
            .emit(GeneratorEvent::QueueSizeChanged(self.scheduler.queue_size()));
    }

    pub fn thumbnail_size(&self) -> TargetSize {
        lock(&self.settings).thumbnail_size
    }

    /// Default quality, clamped to 0.1-3.0.
    pub fn set_quality(&self, quality: f64) {
        lock(&self.settings).quality = clamp_quality(quality);
    }

    pub fn quality(&self) -> f64 {
        lock(&self.settings).quality
    }

    /// Clamped to 1-8; takes effect on the next dispatch.
    pub fn set_max_concurrent_jobs(&self, jobs: usize) {
        self.scheduler.set_max_concurrent_jobs(jobs);
    }

    pub fn max_concurrent_jobs(&self) -> usize {
        self.scheduler.max_concurrent_jobs()
    }

    /// Clamped to 0-5.
    pub fn set_max_retries(&self, retries: u32) {
        self.scheduler.set_max_retries(retries);
    }

    pub fn max_retries(&self) -> u32 {
        self.scheduler.max_retries()
    }

    /// Select the rasterizer for new requests. GPU-only mode without a
    /// usable GPU falls back to CPU-only.
    pub fn set_render_mode(&self, mode: BackendPreference) {
        let gpu_missing = !self.is_gpu_acceleration_available();
        let mode = if mode == BackendPreference::GpuAccelerated && gpu_missing {
            log::warn!("GPU acceleration not available, falling back to CPU rendering");
            BackendPreference::CpuOnly
        } else {
            mode
        };
        lock(&self.settings).render_mode = mode;
    }

    pub fn render_mode(&self) -> BackendPreference {
        lock(&self.settings).render_mode
    }

    pub fn set_cache_strategy(&self, strategy: CacheStrategy) {
        lock(&self.settings).cache_strategy = strategy;
    }

    pub fn cache_strategy(&self) -> CacheStrategy {
        lock(&self.settings).cache_strategy
    }

    pub fn set_gpu_acceleration_enabled(&self, enabled: bool) {
        self.backend.set_gpu_enabled(enabled);
    }

    /// GPU enabled and an attached rasterizer reports itself usable.
    pub fn is_gpu_acceleration_available(&self) -> bool {
        self.backend.gpu_enabled() && self.backend.gpu_available()
    }

    pub fn set_compression_enabled(&self, enabled: bool) {
        self.backend.set_compression_enabled(enabled);
    }

    pub fn compression_enabled(&self) -> bool {
        self.backend.compression_enabled()
    }

    /// JPEG quality of cached thumbnails, clamped to 1-100.
    pub fn set_compression_quality(&self, quality: u8) {
        self.backend.cache().set_quality(quality);
    }

    pub fn compression_quality(&self) -> u8 {
        self.backend.cache().quality()
    }

    /// Byte capacity of the compressed cache; shrinking evicts.
    pub fn set_cache_capacity(&self, bytes: usize) {
        self.backend.cache().set_capacity(bytes);
    }

    /// Pixel buffer pool budget, clamped to 16-512 MB.
    pub fn set_memory_pool_size(&self, bytes: usize) {
        self.backend.pool().set_capacity(bytes);
    }

    pub fn memory_pool_usage(&self) -> usize {
        self.backend.pool().usage()
    }

    pub fn set_device_pixel_ratio(&self, ratio: f64) {
        self.backend.dpi_calculator().set_device_pixel_ratio(ratio);
    }

    pub fn device_pixel_ratio(&self) -> f64 {
        self.backend.dpi_calculator().device_pixel_ratio()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.backend.cache().stats()
    }

    pub fn backend(&self) -> &RenderBackend {
        &self.backend
    }
}

impl Default for ThumbnailGenerator {
    fn default() -> Self {
        Self::new(GeneratorConfig::default())
    }
}
