//! Telemetry Batcher Library
//!
//! Buffers log lines and metric samples per series, deduplicates series by
//! their labels, and flushes them to pluggable sinks in bulk with retries.

pub mod buffer;
pub mod cache;
pub mod collector;
pub mod config;
pub mod errors;
pub mod telemetry;
pub mod transport;

pub use buffer::{BufferEntity, Metric, Stream};
pub use collector::{Collector, CollectorEvent, CollectorState, FlushOutcome, FlushReport};
pub use config::{CacheConfig, CollectorConfig, HttpSinkConfig};
pub use errors::{CollectorError, Result, SinkError, ValidationError};
pub use telemetry::{LabelSet, LogEntry, Sample};
pub use transport::{HttpLogSink, LogSink, MetricSink, PushOptions, SinkResponse, TracingSink};
