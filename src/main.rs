//! Telemetry Batcher Binary
//!
//! Reads lines from stdin into one log stream and ships them through a
//! collector until stdin closes or Ctrl-C is received.

use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use telemetry_batcher::{
    Collector, CollectorConfig, CollectorEvent, FlushOutcome, HttpLogSink, HttpSinkConfig,
    LabelSet, LogSink, Result, TracingSink,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "telemetry-batcher", version, about = "Batch stdin lines into a log stream")]
struct Args {
    /// Stream label as name=value, repeatable
    #[arg(short, long = "label", value_parser = parse_label, default_value = "job=telemetry-batcher")]
    labels: Vec<(String, String)>,

    /// Log batches instead of pushing them over HTTP
    #[arg(long, env = "BATCHER_DRY_RUN")]
    dry_run: bool,

    /// Metric recording how many lines were forwarded
    #[arg(long, default_value = "batcher_lines_total")]
    line_metric: String,
}

fn parse_label(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected name=value, got {:?}", raw)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    initialize_tracing();

    let args = Args::parse();
    info!("Starting telemetry batcher v{}", env!("CARGO_PKG_VERSION"));

    let config = CollectorConfig::from_env();
    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    let log_sink: Arc<dyn LogSink> = if args.dry_run {
        info!("Dry run, batches are logged only");
        Arc::new(TracingSink)
    } else {
        let sink_config = HttpSinkConfig::from_env();
        info!("Pushing logs to {}", sink_config.base_url);
        Arc::new(HttpLogSink::new(sink_config)?)
    };

    let collector = Collector::new(config, log_sink, Arc::new(TracingSink))?;
    report_events(&collector);

    let labels: LabelSet = args.labels.into_iter().collect();
    let stream = collector.create_stream(labels.clone())?;
    let line_metric = collector.create_metric(&args.line_metric, labels)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut forwarded: u64 = 0;

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    stream.push_entry(Utc::now(), line);
                    forwarded += 1;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    line_metric.add_sample_now(forwarded as f64)?;
    info!("Forwarded {} lines, flushing", forwarded);

    if let FlushOutcome::Failed { errors, .. } = collector.shutdown().await {
        for e in errors {
            error!("Final flush failed: {}", e);
        }
        std::process::exit(1);
    }

    Ok(())
}

/// Log collector events as they arrive
fn report_events(collector: &Collector) {
    let mut events = collector.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CollectorEvent::Flushed(report)) => debug!(
                    "Flush {} - {} entries, {} samples",
                    report.flush_id, report.entries, report.samples
                ),
                Ok(CollectorEvent::Failed(e)) => warn!("Flush failed: {}", e),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} collector events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Initialize structured logging
fn initialize_tracing() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_label() {
        assert_eq!(
            parse_label("job=api"),
            Ok(("job".to_string(), "api".to_string()))
        );
        assert_eq!(
            parse_label("query=a=b"),
            Ok(("query".to_string(), "a=b".to_string()))
        );
        assert!(parse_label("job").is_err());
        assert!(parse_label("=api").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "telemetry-batcher",
            "--label",
            "job=api",
            "-l",
            "env=dev",
            "--dry-run",
        ])
        .unwrap();

        assert!(args.dry_run);
        assert_eq!(args.labels.len(), 2);
        assert_eq!(args.line_metric, "batcher_lines_total");
    }
}
