//! In-memory buffering for telemetry data
//!
//! A [`Buffer`] holds the pending items of one series. Items leave a buffer in
//! two steps: [`BufferEntity::extract`] moves them into a staging area and
//! hands out a [`Snapshot`], then either [`BufferEntity::confirm`] drops the
//! staged copy or [`BufferEntity::revert`] puts it back in front of anything
//! appended in the meantime.

use crate::errors::ValidationError;
use crate::telemetry::{
    current_timestamp_millis, Fingerprint, LabelSet, LogEntry, Sample, Series, Snapshot,
};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, warn};

/// Log stream buffer
pub type Stream = Buffer<LogEntry>;

/// Metric series buffer
pub type Metric = Buffer<Sample>;

/// Sent to observers after every successful append
#[derive(Clone)]
pub enum AppendNotice {
    Stream(Arc<Stream>),
    Metric(Arc<Metric>),
}

impl AppendNotice {
    pub fn fingerprint(&self) -> &Fingerprint {
        match self {
            AppendNotice::Stream(stream) => stream.fingerprint(),
            AppendNotice::Metric(metric) => metric.fingerprint(),
        }
    }
}

/// Receives append notifications from buffers it subscribed to
pub trait AppendObserver: Send + Sync {
    fn on_append(&self, notice: AppendNotice);
}

/// Item types a [`Buffer`] can hold
pub trait BufferItem: Clone + fmt::Debug + Send + Sync + 'static {
    fn notice(buffer: Arc<Buffer<Self>>) -> AppendNotice;
}

impl BufferItem for LogEntry {
    fn notice(buffer: Arc<Buffer<Self>>) -> AppendNotice {
        AppendNotice::Stream(buffer)
    }
}

impl BufferItem for Sample {
    fn notice(buffer: Arc<Buffer<Self>>) -> AppendNotice {
        AppendNotice::Metric(buffer)
    }
}

/// Pending/staged lifecycle shared by streams and metrics
pub trait BufferEntity: Send + Sync {
    type Item;

    fn fingerprint(&self) -> &Fingerprint;

    fn pending_len(&self) -> usize;

    fn staged_len(&self) -> usize;

    /// Move all pending items into staging and return a copy of them
    fn extract(&self) -> Snapshot<Self::Item>;

    /// Drop the staged items once the sink has accepted them
    fn confirm(&self);

    /// Restore staged items ahead of anything appended since extraction
    fn revert(&self);

    /// Drop pending and staged items
    fn reset(&self);

    /// Called by a cache when it stops tracking this entity
    fn untracked(&self) {}

    /// Holds data that would be lost if the entity stopped being tracked
    fn is_pinned(&self) -> bool {
        self.pending_len() > 0 || self.staged_len() > 0
    }
}

#[derive(Debug)]
struct BufferState<T> {
    pending: Vec<T>,
    staged: Vec<T>,
    /// Shared count of pending items; follows `pending.len()` while attached
    gauge: Option<Arc<AtomicUsize>>,
}

impl<T> BufferState<T> {
    fn count(&self, added: usize) {
        if let Some(gauge) = &self.gauge {
            gauge.fetch_add(added, Ordering::AcqRel);
        }
    }

    fn uncount(&self, removed: usize) {
        if let Some(gauge) = &self.gauge {
            gauge.fetch_sub(removed, Ordering::AcqRel);
        }
    }
}

#[derive(Default)]
struct ObserverRegistry {
    next_id: u64,
    observers: Vec<(u64, Weak<dyn AppendObserver>)>,
}

/// Handle for one observer registration; dropping it unsubscribes
#[must_use = "dropping a Subscription unsubscribes the observer"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<ObserverRegistry>>,
    detached: bool,
}

impl Subscription {
    /// Keep the observer registered until the observer itself is dropped
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).observers.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Buffer of pending items for one series
pub struct Buffer<T> {
    fingerprint: Fingerprint,
    series: Series,
    state: Mutex<BufferState<T>>,
    observers: Arc<Mutex<ObserverRegistry>>,
    this: Weak<Buffer<T>>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: BufferItem> Buffer<T> {
    fn with_series(fingerprint: Fingerprint, series: Series) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            fingerprint,
            series,
            state: Mutex::new(BufferState {
                pending: Vec::new(),
                staged: Vec::new(),
                gauge: None,
            }),
            observers: Arc::new(Mutex::new(ObserverRegistry::default())),
            this: this.clone(),
        })
    }

    /// Metric name (if any) and labels this buffer was created for
    pub fn series(&self) -> &Series {
        &self.series
    }

    /// Labels this buffer was created for
    pub fn labels(&self) -> &LabelSet {
        &self.series.labels
    }

    /// Copy of the pending items, oldest first
    pub fn pending(&self) -> Vec<T> {
        lock(&self.state).pending.clone()
    }

    /// Register an observer, held weakly
    pub fn subscribe(&self, observer: Weak<dyn AppendObserver>) -> Subscription {
        let mut registry = lock(&self.observers);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.observers.push((id, observer));

        Subscription {
            id,
            registry: Arc::downgrade(&self.observers),
            detached: false,
        }
    }

    /// Whether any live observer is subscribed
    pub fn is_observed(&self) -> bool {
        lock(&self.observers)
            .observers
            .iter()
            .any(|(_, observer)| observer.strong_count() > 0)
    }

    /// Mirror the pending count into `gauge` from now on
    pub(crate) fn attach_gauge(&self, gauge: &Arc<AtomicUsize>) {
        let mut state = lock(&self.state);
        if state.gauge.as_ref().is_some_and(|g| Arc::ptr_eq(g, gauge)) {
            return;
        }
        state.uncount(state.pending.len());
        state.gauge = Some(Arc::clone(gauge));
        state.count(state.pending.len());
    }

    /// Stop counting; pending items are taken back out of the gauge
    pub(crate) fn detach_gauge(&self) {
        let mut state = lock(&self.state);
        state.uncount(state.pending.len());
        state.gauge = None;
    }

    fn append(&self, item: T) {
        let pending = {
            let mut state = lock(&self.state);
            state.pending.push(item);
            state.count(1);
            state.pending.len()
        };
        debug!("Appended to {}, pending: {}", self.fingerprint, pending);
        self.notify();
    }

    /// Append items without notifying observers
    pub(crate) fn absorb(&self, items: Vec<T>) {
        if items.is_empty() {
            return;
        }
        let mut state = lock(&self.state);
        state.count(items.len());
        state.pending.extend(items);
    }

    /// Take pending items, leaving anything staged in place
    pub(crate) fn take_pending(&self) -> Vec<T> {
        let mut state = lock(&self.state);
        state.uncount(state.pending.len());
        std::mem::take(&mut state.pending)
    }

    fn notify(&self) {
        let observers: Vec<Arc<dyn AppendObserver>> = {
            let mut registry = lock(&self.observers);
            registry
                .observers
                .retain(|(_, observer)| observer.strong_count() > 0);
            registry
                .observers
                .iter()
                .filter_map(|(_, observer)| observer.upgrade())
                .collect()
        };

        if observers.is_empty() {
            return;
        }

        let Some(this) = self.this.upgrade() else {
            return;
        };

        for observer in observers {
            observer.on_append(T::notice(Arc::clone(&this)));
        }
    }
}

impl<T: BufferItem> BufferEntity for Buffer<T> {
    type Item = T;

    fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    fn pending_len(&self) -> usize {
        lock(&self.state).pending.len()
    }

    fn staged_len(&self) -> usize {
        lock(&self.state).staged.len()
    }

    fn extract(&self) -> Snapshot<T> {
        let mut state = lock(&self.state);

        if !state.staged.is_empty() {
            warn!(
                "Extracting {} with {} unresolved staged items, folding them back",
                self.fingerprint,
                state.staged.len()
            );
            state.count(state.staged.len());
            let mut restored = std::mem::take(&mut state.staged);
            restored.append(&mut state.pending);
            state.pending = restored;
        }

        state.uncount(state.pending.len());
        state.staged = std::mem::take(&mut state.pending);

        Snapshot {
            fingerprint: self.fingerprint.clone(),
            series: self.series.clone(),
            items: state.staged.clone(),
        }
    }

    fn confirm(&self) {
        lock(&self.state).staged.clear();
    }

    fn revert(&self) {
        let mut state = lock(&self.state);
        if state.staged.is_empty() {
            return;
        }
        state.count(state.staged.len());
        let mut restored = std::mem::take(&mut state.staged);
        restored.append(&mut state.pending);
        state.pending = restored;
        debug!(
            "Reverted {}, pending: {}",
            self.fingerprint,
            state.pending.len()
        );
    }

    fn reset(&self) {
        let mut state = lock(&self.state);
        state.uncount(state.pending.len());
        state.pending.clear();
        state.staged.clear();
    }

    fn untracked(&self) {
        self.detach_gauge();
    }
}

impl<T: BufferItem> fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Buffer")
            .field("fingerprint", &self.fingerprint)
            .field("pending", &state.pending.len())
            .field("staged", &state.staged.len())
            .finish()
    }
}

impl Buffer<LogEntry> {
    /// Create a log stream for a label set
    pub fn new(labels: LabelSet) -> Result<Arc<Self>, ValidationError> {
        labels.validate()?;
        let fingerprint = Fingerprint::for_stream(&labels);
        Ok(Self::with_series(
            fingerprint,
            Series { name: None, labels },
        ))
    }

    /// Append a log line; the timestamp is rendered now, not at flush time
    pub fn push_entry(&self, timestamp: DateTime<Utc>, line: impl Into<String>) {
        self.append(LogEntry::new(timestamp, line));
    }

    /// Append a log line with a millisecond Unix timestamp
    pub fn push_entry_millis(
        &self,
        timestamp_ms: i64,
        line: impl Into<String>,
    ) -> Result<(), ValidationError> {
        let entry = LogEntry::from_millis(timestamp_ms, line)?;
        self.append(entry);
        Ok(())
    }
}

impl Buffer<Sample> {
    /// Create a metric series for a name and label set
    pub fn new(name: impl Into<String>, labels: LabelSet) -> Result<Arc<Self>, ValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyMetricName);
        }
        labels.validate()?;
        let fingerprint = Fingerprint::for_metric(&name, &labels);
        Ok(Self::with_series(
            fingerprint,
            Series {
                name: Some(name),
                labels,
            },
        ))
    }

    /// Metric name
    pub fn name(&self) -> &str {
        self.series.name.as_deref().unwrap_or_default()
    }

    /// Append a sample with a millisecond Unix timestamp; NaN is rejected
    pub fn add_sample(&self, value: f64, timestamp_ms: i64) -> Result<(), ValidationError> {
        let sample = Sample::new(value, timestamp_ms)?;
        self.append(sample);
        Ok(())
    }

    /// Append a sample stamped with the current time
    pub fn add_sample_now(&self, value: f64) -> Result<(), ValidationError> {
        self.add_sample(value, current_timestamp_millis())
    }
}
