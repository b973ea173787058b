//! Collector orchestrating buffering, flush triggers and delivery
//!
//! Buffers created through a [`Collector`] report every append back to it. The
//! collector keeps aggregate counters, flushes when they reach
//! `max_bulk_size` or when the flush timer fires, and retries failed pushes
//! with exponential backoff before reverting the items into their buffers.

use crate::buffer::{
    lock, AppendNotice, AppendObserver, Buffer, BufferEntity, BufferItem, Metric, Stream,
};
use crate::cache::KeyedCache;
use crate::config::CollectorConfig;
use crate::errors::{CollectorError, Result, SinkError, SinkKind, ValidationError};
use crate::telemetry::{Fingerprint, LabelSet, Snapshot};
use crate::transport::{LogSink, MetricSink, PushOptions, SinkResponse};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Notify};
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;

/// Where the flush state machine currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    /// Nothing pending
    Idle,
    /// Items pending, waiting for the timer or the size threshold
    Accumulating,
    /// A flush is extracting or delivering
    Flushing,
    /// A push failed and the flush is backing off before the next attempt
    Retrying,
    /// The last flush exhausted its retries; items were put back
    IdleWithError,
}

/// Summary of one flush
#[derive(Debug, Clone, PartialEq)]
pub struct FlushReport {
    pub flush_id: String,
    pub attempts: u32,
    pub streams: usize,
    pub entries: usize,
    pub metrics: usize,
    pub samples: usize,
    pub log_response: Option<SinkResponse>,
    pub metric_response: Option<SinkResponse>,
}

#[derive(Debug, Clone)]
pub enum CollectorEvent {
    /// At least one sink accepted its batch
    Flushed(FlushReport),
    /// A sink kept failing until retries ran out
    Failed(Arc<CollectorError>),
}

#[derive(Debug, Clone)]
pub enum FlushOutcome {
    /// Another flush was in flight; a follow-up was requested instead
    Deferred,
    /// No tracked buffer had pending items
    Empty,
    Delivered(FlushReport),
    /// At least one kind exhausted its retries. `report` still carries the
    /// response of a kind that went through.
    Failed {
        report: FlushReport,
        errors: Vec<Arc<CollectorError>>,
    },
}

/// Collector statistics
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorStats {
    pub state: CollectorState,
    pub streams: usize,
    pub metrics: usize,
    pub pending_entries: usize,
    pub pending_samples: usize,
    pub flushes: u64,
    pub failed_flushes: u64,
    pub attempts: u64,
    pub delivered_entries: u64,
    pub delivered_samples: u64,
}

#[derive(Debug, Default)]
struct FlushCounters {
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
    attempts: AtomicU64,
    delivered_entries: AtomicU64,
    delivered_samples: AtomicU64,
}

#[derive(Debug, Default)]
struct TimerSlot {
    generation: u64,
    armed: Option<(u64, AbortHandle)>,
}

/// Batches log entries and metric samples and pushes them to the sinks
#[derive(Clone)]
pub struct Collector {
    inner: Arc<Inner>,
}

struct Inner {
    config: CollectorConfig,
    options: PushOptions,
    log_sink: Arc<dyn LogSink>,
    metric_sink: Arc<dyn MetricSink>,
    streams: Mutex<KeyedCache<Stream>>,
    metrics: Mutex<KeyedCache<Metric>>,
    /// Kept in step with the tracked streams' pending lists
    pending_entries: Arc<AtomicUsize>,
    pending_samples: Arc<AtomicUsize>,
    flushing: AtomicBool,
    flush_scheduled: AtomicBool,
    /// An append wanted the timer while a flush was in flight
    rearm_after_flush: AtomicBool,
    trailing: AtomicBool,
    retrying: AtomicBool,
    failed: AtomicBool,
    timer: Mutex<TimerSlot>,
    flush_done: Notify,
    events: broadcast::Sender<CollectorEvent>,
    counters: FlushCounters,
    runtime: Handle,
    this: Weak<Inner>,
}

impl Collector {
    /// Create a collector. Must be called from within a tokio runtime, which
    /// then runs the flush timer and threshold-triggered flushes.
    pub fn new(
        config: CollectorConfig,
        log_sink: Arc<dyn LogSink>,
        metric_sink: Arc<dyn MetricSink>,
    ) -> Result<Self> {
        config.validate().map_err(CollectorError::Config)?;

        let runtime = Handle::try_current().map_err(|e| {
            CollectorError::Config(format!("collector must be created inside a tokio runtime: {}", e))
        })?;

        let options = PushOptions {
            org_id: config.org_id.clone(),
            async_insert: config.async_insert,
            fp_limit: config.fp_limit,
            ttl_days: config.ttl_days,
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new_cyclic(|this| Inner {
            streams: Mutex::new(KeyedCache::new(config.cache.clone())),
            metrics: Mutex::new(KeyedCache::new(config.cache.clone())),
            config,
            options,
            log_sink,
            metric_sink,
            pending_entries: Arc::new(AtomicUsize::new(0)),
            pending_samples: Arc::new(AtomicUsize::new(0)),
            flushing: AtomicBool::new(false),
            flush_scheduled: AtomicBool::new(false),
            rearm_after_flush: AtomicBool::new(false),
            trailing: AtomicBool::new(false),
            retrying: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            timer: Mutex::new(TimerSlot::default()),
            flush_done: Notify::new(),
            events,
            counters: FlushCounters::default(),
            runtime,
            this: this.clone(),
        });

        info!(
            "Collector ready - bulk size {}, timeout {:?}, {} attempts",
            inner.config.max_bulk_size, inner.config.max_timeout, inner.config.retry_attempts
        );

        Ok(Self { inner })
    }

    /// Get or create the stream for a label set. Label order does not matter.
    pub fn create_stream(&self, labels: impl Into<LabelSet>) -> Result<Arc<Stream>> {
        let labels = labels.into();
        let fingerprint = Fingerprint::for_stream(&labels);

        let (stream, created) = lock(&self.inner.streams).get_or_insert_with(fingerprint, || {
            let stream = Stream::new(labels)?;
            stream.attach_gauge(&self.inner.pending_entries);
            stream.subscribe(self.inner.observer()).detach();
            Ok::<_, ValidationError>(stream)
        })?;

        if created {
            debug!("Created stream {}", stream.fingerprint());
        }
        Ok(stream)
    }

    /// Get or create the metric series for a name and label set
    pub fn create_metric(
        &self,
        name: impl Into<String>,
        labels: impl Into<LabelSet>,
    ) -> Result<Arc<Metric>> {
        let name = name.into();
        let labels = labels.into();
        let fingerprint = Fingerprint::for_metric(&name, &labels);

        let (metric, created) = lock(&self.inner.metrics).get_or_insert_with(fingerprint, || {
            let metric = Metric::new(name, labels)?;
            metric.attach_gauge(&self.inner.pending_samples);
            metric.subscribe(self.inner.observer()).detach();
            Ok::<_, ValidationError>(metric)
        })?;

        if created {
            debug!("Created metric {}", metric.fingerprint());
        }
        Ok(metric)
    }

    /// Flush everything pending now
    pub async fn push_bulk(&self) -> FlushOutcome {
        self.inner.push_bulk().await
    }

    /// Pending log entries plus pending samples
    pub fn total(&self) -> usize {
        self.inner.total()
    }

    /// Log entries waiting in tracked streams, not counting any in flight
    pub fn pending_entries(&self) -> usize {
        self.inner.pending_entries.load(Ordering::Acquire)
    }

    /// Samples waiting in tracked metrics, not counting any in flight
    pub fn pending_samples(&self) -> usize {
        self.inner.pending_samples.load(Ordering::Acquire)
    }

    /// Current [`CollectorState`]
    pub fn state(&self) -> CollectorState {
        self.inner.state()
    }

    /// Options forwarded with every push
    pub fn options(&self) -> &PushOptions {
        &self.inner.options
    }

    /// Configuration the collector was built with
    pub fn config(&self) -> &CollectorConfig {
        &self.inner.config
    }

    /// Number of streams in the cache
    pub fn stream_count(&self) -> usize {
        lock(&self.inner.streams).len()
    }

    /// Number of metrics in the cache
    pub fn metric_count(&self) -> usize {
        lock(&self.inner.metrics).len()
    }

    /// Receive flush events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<CollectorEvent> {
        self.inner.events.subscribe()
    }

    /// Get collector statistics
    pub fn stats(&self) -> CollectorStats {
        let counters = &self.inner.counters;
        CollectorStats {
            state: self.state(),
            streams: self.stream_count(),
            metrics: self.metric_count(),
            pending_entries: self.pending_entries(),
            pending_samples: self.pending_samples(),
            flushes: counters.flushes.load(Ordering::Relaxed),
            failed_flushes: counters.failed_flushes.load(Ordering::Relaxed),
            attempts: counters.attempts.load(Ordering::Relaxed),
            delivered_entries: counters.delivered_entries.load(Ordering::Relaxed),
            delivered_samples: counters.delivered_samples.load(Ordering::Relaxed),
        }
    }

    /// Stop the timer, wait for an in-flight flush and flush what is left
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> FlushOutcome {
        info!("Shutting down collector");

        loop {
            self.inner.cancel_timer();
            self.inner.wait_for_flush().await;

            let outcome = self.inner.push_bulk().await;
            if matches!(outcome, FlushOutcome::Deferred) {
                continue;
            }
            self.inner.cancel_timer();

            let stats = self.stats();
            info!(
                "Collector shutdown complete - {} flushes ({} failed), {} entries and {} samples delivered, {} items left",
                stats.flushes,
                stats.failed_flushes,
                stats.delivered_entries,
                stats.delivered_samples,
                stats.pending_entries + stats.pending_samples
            );
            return outcome;
        }
    }
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("state", &self.state())
            .field("pending_entries", &self.pending_entries())
            .field("pending_samples", &self.pending_samples())
            .finish()
    }
}

impl Inner {
    fn observer(&self) -> Weak<dyn AppendObserver> {
        self.this.clone()
    }

    /// Sum of both pending gauges
    fn total(&self) -> usize {
        self.pending_entries.load(Ordering::Acquire) + self.pending_samples.load(Ordering::Acquire)
    }

    fn state(&self) -> CollectorState {
        if self.flushing.load(Ordering::Acquire) {
            if self.retrying.load(Ordering::Acquire) {
                CollectorState::Retrying
            } else {
                CollectorState::Flushing
            }
        } else if self.failed.load(Ordering::Acquire) {
            CollectorState::IdleWithError
        } else if self.total() > 0 {
            CollectorState::Accumulating
        } else {
            CollectorState::Idle
        }
    }

    /// Put an appended-to buffer back under tracking if it was evicted. When a
    /// newer buffer already owns the fingerprint, the pending items move there.
    fn track<T: BufferItem>(
        &self,
        cache: &Mutex<KeyedCache<Buffer<T>>>,
        gauge: &Arc<AtomicUsize>,
        buffer: Arc<Buffer<T>>,
    ) {
        let mut cache = lock(cache);
        match cache.get(buffer.fingerprint()) {
            Some(current) if Arc::ptr_eq(&current, &buffer) => {}
            Some(current) => {
                let items = buffer.take_pending();
                debug!(
                    "Moving {} items from a stale buffer into {}",
                    items.len(),
                    current.fingerprint()
                );
                current.absorb(items);
            }
            None => {
                debug!("Re-registering evicted buffer {}", buffer.fingerprint());
                buffer.attach_gauge(gauge);
                cache.insert(buffer.fingerprint().clone(), buffer);
            }
        }
    }

    /// Flush at the size threshold, otherwise make sure the timer runs
    fn after_append(&self) {
        self.failed.store(false, Ordering::Release);
        if self.total() >= self.config.max_bulk_size {
            self.schedule_flush();
        } else {
            self.arm_timer();
        }
    }

    /// Spawn one flush on the runtime unless one is running or queued
    fn schedule_flush(&self) {
        if self.flushing.load(Ordering::Acquire) {
            self.trailing.store(true, Ordering::Release);
            self.arm_timer();
            return;
        }
        if self.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(inner) = self.this.upgrade() else {
            return;
        };

        debug!("Bulk size {} reached, flushing", self.config.max_bulk_size);
        self.runtime.spawn(async move {
            inner.push_bulk().await;
        });
    }

    /// Start the flush timer if none is armed. While a flush is in flight the
    /// request is remembered and honoured once it ends.
    fn arm_timer(&self) {
        if self.flushing.load(Ordering::SeqCst) {
            self.rearm_after_flush.store(true, Ordering::SeqCst);
            // the flush may have ended before it could see the request
            if self.flushing.load(Ordering::SeqCst) {
                return;
            }
        }

        let mut slot = lock(&self.timer);
        if slot.armed.is_some() {
            return;
        }

        slot.generation += 1;
        let generation = slot.generation;
        let delay = self.config.max_timeout;
        let weak = self.this.clone();

        let task = self.runtime.spawn(async move {
            sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                if inner.disarm(generation) {
                    debug!("Flush timer fired after {:?}", delay);
                    inner.push_bulk().await;
                }
            }
        });

        slot.armed = Some((generation, task.abort_handle()));
        debug!("Armed flush timer for {:?}", delay);
    }

    /// Clear the slot if it still holds this generation's timer
    fn disarm(&self, generation: u64) -> bool {
        let mut slot = lock(&self.timer);
        match slot.armed {
            Some((armed, _)) if armed == generation => {
                slot.armed = None;
                true
            }
            _ => false,
        }
    }

    /// Abort the armed timer, if any
    fn cancel_timer(&self) {
        if let Some((_, handle)) = lock(&self.timer).armed.take() {
            handle.abort();
        }
    }

    /// Resolve once no flush is in flight
    async fn wait_for_flush(&self) {
        loop {
            let notified = self.flush_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.flushing.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    #[instrument(skip(self))]
    async fn push_bulk(&self) -> FlushOutcome {
        self.flush_scheduled.store(false, Ordering::Release);

        if self.flushing.swap(true, Ordering::SeqCst) {
            self.trailing.store(true, Ordering::Release);
            debug!("Flush already in flight, deferring");
            return FlushOutcome::Deferred;
        }
        self.rearm_after_flush.store(false, Ordering::SeqCst);

        let outcome = loop {
            self.trailing.store(false, Ordering::Release);
            let outcome = self.flush_once().await;

            let follow_up = self.trailing.load(Ordering::Acquire)
                && matches!(outcome, FlushOutcome::Delivered(_))
                && self.total() > 0;
            if !follow_up {
                break outcome;
            }
            debug!("Running trailing flush for {} items", self.total());
        };

        self.flushing.store(false, Ordering::SeqCst);
        self.flush_done.notify_waiters();

        // after exhausted retries only appends made during the flush re-arm
        let appended = self.rearm_after_flush.swap(false, Ordering::SeqCst);
        let rearm = match outcome {
            FlushOutcome::Failed { .. } => appended,
            _ => true,
        };
        if rearm && self.total() > 0 {
            self.arm_timer();
        }
        outcome
    }

    /// One extraction plus delivery with retries
    async fn flush_once(&self) -> FlushOutcome {
        self.cancel_timer();

        let mut logs = Delivery::extract(SinkKind::Logs, &self.streams);
        let mut metrics = Delivery::extract(SinkKind::Metrics, &self.metrics);

        if logs.is_empty() && metrics.is_empty() {
            debug!("Nothing to flush");
            return FlushOutcome::Empty;
        }

        let flush_id = Uuid::new_v4().to_string();
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Flush {} - {} streams ({} entries), {} metrics ({} samples)",
            flush_id,
            logs.snapshots.len(),
            logs.items(),
            metrics.snapshots.len(),
            metrics.items()
        );

        let max_attempts = self.config.retry_attempts.max(1);
        let mut attempts = 0;

        while attempts < max_attempts {
            attempts += 1;
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);

            if logs.is_outstanding() {
                let result = self.log_sink.push(&logs.snapshots, &self.options).await;
                match result {
                    Ok(response) => logs.confirm(response),
                    Err(e) => logs.fail(e),
                }
            }

            if metrics.is_outstanding() {
                let result = self.metric_sink.push(&metrics.snapshots, &self.options).await;
                match result {
                    Ok(response) => metrics.confirm(response),
                    Err(e) => metrics.fail(e),
                }
            }

            if !logs.is_outstanding() && !metrics.is_outstanding() {
                break;
            }

            if attempts < max_attempts {
                let delay = backoff(self.config.retry_delay, attempts);
                for (kind, e) in [logs.last_error(), metrics.last_error()].into_iter().flatten() {
                    warn!(
                        "Flush {} failed to push {} (attempt {}), retrying in {:?}: {}",
                        flush_id, kind, attempts, delay, e
                    );
                }
                self.retrying.store(true, Ordering::Release);
                sleep(delay).await;
            }
        }
        self.retrying.store(false, Ordering::Release);

        let report = FlushReport {
            flush_id,
            attempts,
            streams: logs.snapshots.len(),
            entries: logs.items(),
            metrics: metrics.snapshots.len(),
            samples: metrics.items(),
            log_response: logs.response(),
            metric_response: metrics.response(),
        };

        if report.log_response.is_some() {
            self.counters
                .delivered_entries
                .fetch_add(report.entries as u64, Ordering::Relaxed);
        }
        if report.metric_response.is_some() {
            self.counters
                .delivered_samples
                .fetch_add(report.samples as u64, Ordering::Relaxed);
        }
        if report.log_response.is_some() || report.metric_response.is_some() {
            let _ = self.events.send(CollectorEvent::Flushed(report.clone()));
        }

        let errors: Vec<Arc<CollectorError>> = [logs.give_up(attempts), metrics.give_up(attempts)]
            .into_iter()
            .flatten()
            .map(Arc::new)
            .collect();

        if errors.is_empty() {
            self.failed.store(false, Ordering::Release);
            info!(
                "Flush {} delivered {} entries and {} samples (attempt {})",
                report.flush_id, report.entries, report.samples, report.attempts
            );
            return FlushOutcome::Delivered(report);
        }

        self.failed.store(true, Ordering::Release);
        self.counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
        for e in &errors {
            error!("Flush {} gave up: {}", report.flush_id, e);
            let _ = self.events.send(CollectorEvent::Failed(Arc::clone(e)));
        }

        FlushOutcome::Failed { report, errors }
    }
}

impl AppendObserver for Inner {
    fn on_append(&self, notice: AppendNotice) {
        match notice {
            AppendNotice::Stream(stream) => {
                self.track(&self.streams, &self.pending_entries, stream);
            }
            AppendNotice::Metric(metric) => {
                self.track(&self.metrics, &self.pending_samples, metric);
            }
        }
        self.after_append();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

/// `base * 2^(attempt - 1)`
fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)))
}

enum Progress {
    Unsent,
    Delivered(SinkResponse),
    Failed(SinkError),
}

/// Snapshots of one kind travelling through a flush
struct Delivery<T> {
    kind: SinkKind,
    buffers: Vec<Arc<Buffer<T>>>,
    snapshots: Vec<Snapshot<T>>,
    progress: Progress,
}

impl<T: BufferItem> Delivery<T> {
    /// Extract every non-empty tracked buffer. Pushed buffers count as used,
    /// so their recency and age are refreshed.
    fn extract(kind: SinkKind, cache: &Mutex<KeyedCache<Buffer<T>>>) -> Self {
        let mut buffers = Vec::new();
        let mut snapshots = Vec::new();

        let mut cache = lock(cache);
        for buffer in cache.values() {
            let snapshot = buffer.extract();
            if snapshot.is_empty() {
                continue;
            }
            cache.get(buffer.fingerprint());
            buffers.push(buffer);
            snapshots.push(snapshot);
        }

        Self {
            kind,
            buffers,
            snapshots,
            progress: Progress::Unsent,
        }
    }

    fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    fn items(&self) -> usize {
        self.snapshots.iter().map(Snapshot::len).sum()
    }

    fn is_outstanding(&self) -> bool {
        !self.is_empty() && !matches!(self.progress, Progress::Delivered(_))
    }

    fn confirm(&mut self, response: SinkResponse) {
        for buffer in &self.buffers {
            buffer.confirm();
        }
        self.progress = Progress::Delivered(response);
    }

    fn fail(&mut self, error: SinkError) {
        self.progress = Progress::Failed(error);
    }

    fn last_error(&self) -> Option<(SinkKind, &SinkError)> {
        match &self.progress {
            Progress::Failed(e) => Some((self.kind, e)),
            _ => None,
        }
    }

    fn response(&self) -> Option<SinkResponse> {
        match &self.progress {
            Progress::Delivered(response) => Some(response.clone()),
            _ => None,
        }
    }

    /// Revert undelivered items; reverting puts them back in the gauge
    fn give_up(&mut self, attempts: u32) -> Option<CollectorError> {
        if !self.is_outstanding() {
            return None;
        }

        for buffer in &self.buffers {
            buffer.revert();
        }

        match std::mem::replace(&mut self.progress, Progress::Unsent) {
            Progress::Failed(source) => Some(CollectorError::ExhaustedRetries {
                attempts,
                kind: self.kind,
                source,
            }),
            _ => None,
        }
    }
}
