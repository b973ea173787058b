//! Sink capabilities the collector delivers to, plus an HTTP log sink

use crate::config::HttpSinkConfig;
use crate::errors::{CollectorError, Result, SinkError};
use crate::telemetry::{LogEntry, MetricSnapshot, StreamSnapshot};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response};
use serde::Serialize;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

pub const LOG_PUSH_PATH: &str = "/loki/api/v1/push";

/// Per-push hints forwarded to the backend
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushOptions {
    pub org_id: Option<String>,
    pub async_insert: bool,
    pub fp_limit: Option<u64>,
    pub ttl_days: Option<u32>,
}

impl PushOptions {
    /// Request headers carrying these options
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        if let Some(org_id) = &self.org_id {
            insert_header(&mut headers, "x-scope-orgid", org_id);
        }
        if self.async_insert {
            insert_header(&mut headers, "x-async-insert", "true");
        }
        if let Some(limit) = self.fp_limit {
            insert_header(&mut headers, "x-fp-limit", &limit.to_string());
        }
        if let Some(days) = self.ttl_days {
            insert_header(&mut headers, "x-ttl-days", &days.to_string());
        }

        headers
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(name), value);
        }
        Err(_) => debug!("Skipping header {} with invalid value", name),
    }
}

/// What a sink reports back after accepting a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkResponse {
    pub status: u16,
    pub path: String,
    pub items: usize,
}

#[async_trait]
pub trait LogSink: Send + Sync {
    async fn push(
        &self,
        streams: &[StreamSnapshot],
        options: &PushOptions,
    ) -> std::result::Result<SinkResponse, SinkError>;
}

#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn push(
        &self,
        metrics: &[MetricSnapshot],
        options: &PushOptions,
    ) -> std::result::Result<SinkResponse, SinkError>;
}

#[derive(Serialize)]
struct PushRequest<'a> {
    streams: Vec<PushStream<'a>>,
}

#[derive(Serialize)]
struct PushStream<'a> {
    labels: &'a str,
    entries: &'a [LogEntry],
}

/// Posts stream snapshots as JSON to the log push endpoint
#[derive(Debug, Clone)]
pub struct HttpLogSink {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    timeout: Duration,
}

impl HttpLogSink {
    pub fn new(config: HttpSinkConfig) -> Result<Self> {
        config.validate().map_err(CollectorError::Config)?;

        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(format!("telemetry_batcher/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(SinkError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username,
            password: config.password,
            timeout: config.timeout,
        })
    }

    async fn handle_response(&self, response: Response, items: usize) -> std::result::Result<SinkResponse, SinkError> {
        let status = response.status();

        if status.is_success() {
            debug!("Log push accepted with {}", status);
            return Ok(SinkResponse {
                status: status.as_u16(),
                path: LOG_PUSH_PATH.to_string(),
                items,
            });
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        Err(SinkError::Status {
            status,
            path: LOG_PUSH_PATH.to_string(),
            body,
        })
    }
}

#[async_trait]
impl LogSink for HttpLogSink {
    async fn push(
        &self,
        streams: &[StreamSnapshot],
        options: &PushOptions,
    ) -> std::result::Result<SinkResponse, SinkError> {
        let items = streams.iter().map(|s| s.len()).sum();
        let payload = PushRequest {
            streams: streams
                .iter()
                .map(|s| PushStream {
                    labels: s.fingerprint.as_str(),
                    entries: &s.items,
                })
                .collect(),
        };

        let url = format!("{}{}", self.base_url, LOG_PUSH_PATH);
        debug!("Pushing {} streams ({} entries) to {}", streams.len(), items, url);

        let mut request = self.client.post(&url).headers(options.headers()).json(&payload);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_ref());
        }

        let response = timeout(self.timeout, request.send())
            .await
            .map_err(|_| SinkError::Timeout)??;

        self.handle_response(response, items).await
    }
}

/// Accepts every batch and logs a summary; useful for dry runs
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

#[async_trait]
impl LogSink for TracingSink {
    async fn push(
        &self,
        streams: &[StreamSnapshot],
        options: &PushOptions,
    ) -> std::result::Result<SinkResponse, SinkError> {
        let items = streams.iter().map(|s| s.len()).sum();
        for stream in streams {
            info!(
                "stream {} - {} entries (org: {:?})",
                stream.fingerprint,
                stream.len(),
                options.org_id
            );
        }
        Ok(SinkResponse {
            status: 200,
            path: "tracing://logs".to_string(),
            items,
        })
    }
}

#[async_trait]
impl MetricSink for TracingSink {
    async fn push(
        &self,
        metrics: &[MetricSnapshot],
        options: &PushOptions,
    ) -> std::result::Result<SinkResponse, SinkError> {
        let items = metrics.iter().map(|m| m.len()).sum();
        for metric in metrics {
            info!(
                "metric {} - {} samples, last value {:?} (org: {:?})",
                metric.fingerprint,
                metric.len(),
                metric.items.last().map(|s| s.value),
                options.org_id
            );
        }
        Ok(SinkResponse {
            status: 200,
            path: "tracing://metrics".to_string(),
            items,
        })
    }
}
