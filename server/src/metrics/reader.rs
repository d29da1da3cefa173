use super::path::{path_to_jsonb_selector, validate_path};
use super::{BatchMetricResult, MetricPoint, MetricQuery, MetricQueryRequest, MetricsError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{info, trace};
#[cfg(test)]
use mockall::automock;
use nms_shared::config::MetricsConfig;
use nms_shared::os::stopper::Stopper;
use sqlx::{PgPool, Row};
use tokio::sync::mpsc;

/// Row source behind the reader, mocked in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn fetch(
        &self,
        device_id: i64,
        selector: Option<String>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MetricPoint>, MetricsError>;
}

pub struct PgMetricSource {
    pool: PgPool,
}

impl PgMetricSource {
    pub fn new(pool: PgPool) -> Self {
        PgMetricSource { pool }
    }
}

#[async_trait]
impl MetricSource for PgMetricSource {
    async fn fetch(
        &self,
        device_id: i64,
        selector: Option<String>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MetricPoint>, MetricsError> {
        // The selector is derived from a validated path; everything else is
        // a bound parameter. One statement shape per selector, so sqlx's
        // statement cache reuses the prepared statement across device ids.
        let sql = match &selector {
            Some(selector) => format!(
                "SELECT timestamp, data #> '{{{}}}' AS value FROM metrics \
                 WHERE device_id = $1 AND timestamp >= $2 AND timestamp <= $3 \
                 ORDER BY timestamp DESC LIMIT $4",
                selector
            ),
            None => "SELECT timestamp, data AS value FROM metrics \
                     WHERE device_id = $1 AND timestamp >= $2 AND timestamp <= $3 \
                     ORDER BY timestamp DESC LIMIT $4"
                .to_string(),
        };
        let rows = sqlx::query(&sql)
            .bind(device_id)
            .bind(from)
            .bind(to)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        let mut points = Vec::with_capacity(rows.len());
        for row in rows {
            let value: Option<serde_json::Value> = row.try_get("value")?;
            // Samples that do not contain the requested path are omitted.
            if let Some(value) = value {
                points.push(MetricPoint {
                    timestamp: row.try_get("timestamp")?,
                    value,
                });
            }
        }
        Ok(points)
    }
}

/// Long-lived query task serving the API over a request channel.
pub struct MetricsReader<S: MetricSource> {
    source: S,
    requests: mpsc::Receiver<MetricQueryRequest>,
    lookback: Duration,
    default_limit: i64,
    stopper: Stopper,
}

impl<S: MetricSource> MetricsReader<S> {
    pub fn new(
        source: S,
        requests: mpsc::Receiver<MetricQueryRequest>,
        config: &MetricsConfig,
        stopper: Stopper,
    ) -> Self {
        MetricsReader {
            source,
            requests,
            lookback: Duration::seconds(config.lookback_seconds),
            default_limit: config.default_limit,
            stopper,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.stopper.stopped() => {
                    info!("run - metrics reader stopping");
                    return;
                }
                request = self.requests.recv() => match request {
                    Some(request) => {
                        let response = self.answer(&request.device_ids, request.query).await;
                        let _ = request.reply.send(response);
                    }
                    None => {
                        info!("run - request channel closed, metrics reader exiting");
                        return;
                    }
                }
            }
        }
    }

    async fn answer(
        &self,
        device_ids: &[i64],
        query: MetricQuery,
    ) -> Result<Vec<BatchMetricResult>, MetricsError> {
        let selector = match &query.path {
            Some(path) => {
                validate_path(path)?;
                Some(path_to_jsonb_selector(path))
            }
            None => None,
        };
        let to = query.to.unwrap_or_else(Utc::now);
        let from = query.from.unwrap_or(to - self.lookback);
        let limit = query.limit.unwrap_or(self.default_limit);
        if limit <= 0 {
            return Err(MetricsError::InvalidLimit);
        }
        trace!(
            "answer - {} device(s), path {:?}, window {} .. {}",
            device_ids.len(),
            query.path,
            from,
            to
        );
        let mut batches = Vec::with_capacity(device_ids.len());
        for &device_id in device_ids {
            let results = self
                .source
                .fetch(device_id, selector.clone(), from, to, limit)
                .await?;
            batches.push(BatchMetricResult { device_id, results });
        }
        Ok(batches)
    }
}
