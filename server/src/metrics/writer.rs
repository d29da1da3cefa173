use super::MetricsError;
use crate::plugin::PluginResult;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{error, info, trace, warn};
use nms_shared::bus::{publish_or_drop, DeviceFailure, FailureReason};
use nms_shared::os::stopper::Stopper;
#[cfg(test)]
use mockall::automock;
use sqlx::postgres::PgPoolCopyExt;
use sqlx::PgPool;
use tokio::sync::mpsc;

/// One row bound for the metrics table.
#[derive(Debug, Clone)]
pub struct MetricRow {
    pub device_id: i64,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Bulk ingestion sink, mocked in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn copy_rows(&self, rows: Vec<MetricRow>) -> Result<u64, MetricsError>;
}

/// Streams each batch through one `COPY ... FROM STDIN` on the writer's own
/// pool.
pub struct PgMetricSink {
    pool: PgPool,
}

impl PgMetricSink {
    pub fn new(pool: PgPool) -> Self {
        PgMetricSink { pool }
    }
}

#[async_trait]
impl MetricSink for PgMetricSink {
    async fn copy_rows(&self, rows: Vec<MetricRow>) -> Result<u64, MetricsError> {
        let mut copy = self
            .pool
            .copy_in_raw("COPY metrics (device_id, data, timestamp) FROM STDIN WITH (FORMAT csv)")
            .await?;
        let mut buffer = String::new();
        for row in &rows {
            buffer.push_str(&csv_line(row));
        }
        if let Err(e) = copy.send(buffer.into_bytes()).await {
            // Abort the stream so the connection returns to the pool clean.
            let _ = copy.abort("send failed").await;
            return Err(e.into());
        }
        Ok(copy.finish().await?)
    }
}

fn csv_line(row: &MetricRow) -> String {
    let json = row.data.to_string().replace('"', "\"\"");
    format!(
        "{},\"{}\",{}\n",
        row.device_id,
        json,
        row.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
    )
}

/// Splits a plugin batch into rows to ingest and failures to report.
/// Results without a device id cannot be correlated and are dropped with a
/// warning.
pub fn split_batch(
    batch: Vec<PluginResult>,
    now: DateTime<Utc>,
) -> (Vec<MetricRow>, Vec<DeviceFailure>) {
    let mut rows = Vec::with_capacity(batch.len());
    let mut failures = Vec::new();
    for result in batch {
        let Some(device_id) = result.device_id else {
            warn!("split_batch - result for {} has no device id, dropped", result.target);
            continue;
        };
        if result.success {
            match result.data {
                Some(data) => rows.push(MetricRow {
                    device_id,
                    data,
                    timestamp: now,
                }),
                None => warn!(
                    "split_batch - successful result for device {} carries no data",
                    device_id
                ),
            }
        } else {
            failures.push(DeviceFailure {
                device_id,
                at: now,
                reason: FailureReason::Poll,
            });
        }
    }
    (rows, failures)
}

/// Long-lived ingestion task. Failures fan out to the health monitor;
/// successes land in one bulk copy. A copy error drops the batch; samples
/// are at-most-once by design.
pub struct MetricsWriter<S: MetricSink> {
    sink: S,
    results: mpsc::Receiver<Vec<PluginResult>>,
    failures: mpsc::Sender<DeviceFailure>,
    stopper: Stopper,
}

impl<S: MetricSink> MetricsWriter<S> {
    pub fn new(
        sink: S,
        results: mpsc::Receiver<Vec<PluginResult>>,
        failures: mpsc::Sender<DeviceFailure>,
        stopper: Stopper,
    ) -> Self {
        MetricsWriter {
            sink,
            results,
            failures,
            stopper,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.stopper.stopped() => {
                    info!("run - metrics writer stopping");
                    return;
                }
                batch = self.results.recv() => match batch {
                    Some(batch) => self.ingest(batch).await,
                    None => {
                        info!("run - result channel closed, metrics writer exiting");
                        return;
                    }
                }
            }
        }
    }

    async fn ingest(&self, batch: Vec<PluginResult>) {
        let (rows, failures) = split_batch(batch, Utc::now());
        for failure in failures {
            publish_or_drop("device-failures", &self.failures, failure);
        }
        if rows.is_empty() {
            return;
        }
        let count = rows.len();
        match self.sink.copy_rows(rows).await {
            Ok(copied) => trace!("ingest - copied {} rows", copied),
            Err(e) => error!("ingest - bulk copy failed, dropping {} rows: {}", count, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(device_id: Option<i64>, success: bool, data: Option<serde_json::Value>) -> PluginResult {
        PluginResult {
            target: "10.0.0.1".to_string(),
            port: 161,
            success,
            error: None,
            hostname: None,
            data,
            device_id,
            request_id: None,
        }
    }

    #[test]
    fn test_split_batch_partitions_successes_and_failures() {
        let now = Utc::now();
        let (rows, failures) = split_batch(
            vec![
                result(Some(1), true, Some(serde_json::json!({"cpu": {"total": 12}}))),
                result(Some(2), false, None),
                result(Some(3), true, Some(serde_json::json!({"mem": 5}))),
                result(None, false, None),
            ],
            now,
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].device_id, 1);
        assert_eq!(rows[0].timestamp, now);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].device_id, 2);
        assert_eq!(failures[0].reason, FailureReason::Poll);
    }

    #[test]
    fn test_split_batch_success_without_data_is_dropped() {
        let (rows, failures) = split_batch(vec![result(Some(1), true, None)], Utc::now());
        assert!(rows.is_empty());
        assert!(failures.is_empty());
    }

    #[test]
    fn test_csv_line_quotes_the_json_document() {
        let row = MetricRow {
            device_id: 42,
            data: serde_json::json!({"a": "b"}),
            timestamp: "2026-01-05T10:00:00Z".parse().unwrap(),
        };
        assert_eq!(
            csv_line(&row),
            "42,\"{\"\"a\"\":\"\"b\"\"}\",2026-01-05T10:00:00.000000Z\n"
        );
    }

    #[test]
    fn test_csv_line_escaping_is_reversible() {
        let row = MetricRow {
            device_id: 42,
            data: serde_json::json!({"name": "disk \"c\"", "free": 7}),
            timestamp: "2026-01-05T10:00:00Z".parse().unwrap(),
        };
        let line = csv_line(&row);
        // Strip "<id>,\"" and "\",<timestamp>\n", then undo the doubling.
        let quoted = line
            .strip_prefix("42,\"")
            .unwrap()
            .rsplit_once("\",")
            .unwrap()
            .0
            .to_string();
        assert_eq!(quoted.replace("\"\"", "\""), row.data.to_string());
    }

    #[tokio::test]
    async fn test_ingest_emits_poll_failures_and_copies_successes() {
        let mut sink = MockMetricSink::new();
        sink.expect_copy_rows()
            .withf(|rows| rows.len() == 1 && rows[0].device_id == 1)
            .returning(|rows| Ok(rows.len() as u64));
        let (_results_tx, results_rx) = mpsc::channel(4);
        let (failures_tx, mut failures_rx) = mpsc::channel(4);
        let writer = MetricsWriter::new(sink, results_rx, failures_tx, Stopper::new());
        writer
            .ingest(vec![
                result(Some(1), true, Some(serde_json::json!({"cpu": 1}))),
                result(Some(2), false, None),
            ])
            .await;
        let failure = failures_rx.try_recv().unwrap();
        assert_eq!(failure.device_id, 2);
        assert_eq!(failure.reason, FailureReason::Poll);
        assert!(failures_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ingest_skips_copy_for_all_failure_batch() {
        // No copy_rows expectation: a call would panic the test.
        let sink = MockMetricSink::new();
        let (_results_tx, results_rx) = mpsc::channel(4);
        let (failures_tx, mut failures_rx) = mpsc::channel(4);
        let writer = MetricsWriter::new(sink, results_rx, failures_tx, Stopper::new());
        writer
            .ingest(vec![result(Some(1), false, None), result(Some(2), false, None)])
            .await;
        assert_eq!(failures_rx.try_recv().unwrap().device_id, 1);
        assert_eq!(failures_rx.try_recv().unwrap().device_id, 2);
    }

    #[tokio::test]
    async fn test_ingest_drops_batch_on_copy_error() {
        let mut sink = MockMetricSink::new();
        sink.expect_copy_rows()
            .returning(|_| Err(MetricsError::Database(sqlx::Error::PoolClosed)));
        let (_results_tx, results_rx) = mpsc::channel(4);
        let (failures_tx, mut failures_rx) = mpsc::channel(4);
        let writer = MetricsWriter::new(sink, results_rx, failures_tx, Stopper::new());
        // Must not panic; the batch is logged and dropped.
        writer
            .ingest(vec![result(Some(1), true, Some(serde_json::json!({"cpu": 1})))])
            .await;
        assert!(failures_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_crash_batch_produces_nothing() {
        // A crashed plugin yields an empty result slice: no rows, no
        // failures, no feedback loop.
        let sink = MockMetricSink::new();
        let (_results_tx, results_rx) = mpsc::channel(4);
        let (failures_tx, mut failures_rx) = mpsc::channel(4);
        let writer = MetricsWriter::new(sink, results_rx, failures_tx, Stopper::new());
        writer.ingest(Vec::new()).await;
        assert!(failures_rx.try_recv().is_err());
    }
}
