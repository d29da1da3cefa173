pub mod path;
pub mod reader;
pub mod writer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("invalid metric path {0:?}")]
    InvalidPath(String),
    #[error("limit must be positive")]
    InvalidLimit,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("metrics reader unavailable")]
    Unavailable,
}

/// Query parameters as they arrive from the API. Absent bounds default to
/// `end = now` and `start = end - lookback`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricQuery {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// Point-to-point request to the metrics reader.
#[derive(Debug)]
pub struct MetricQueryRequest {
    pub device_ids: Vec<i64>,
    pub query: MetricQuery,
    pub reply: oneshot::Sender<Result<Vec<BatchMetricResult>, MetricsError>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub value: serde_json::Value,
}

/// Samples for one device, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct BatchMetricResult {
    pub device_id: i64,
    pub results: Vec<MetricPoint>,
}
