use chrono::{DateTime, Duration, Utc};
use log::{info, trace, warn};
use nms_shared::bus::{DeviceFailure, EntityHandle};
use nms_shared::config::HealthConfig;
use nms_shared::os::stopper::Stopper;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Per-device failure state. Cleared when the device is deactivated.
#[derive(Debug, Clone)]
struct FailureRecord {
    last_failure_at: DateTime<Utc>,
    count: u32,
}

/// Sliding-window deactivator.
///
/// Failures within `window` of each other accumulate; a gap of `window` or
/// more resets the count. When the count reaches `threshold`, the device is
/// deactivated through the entity service and its record erased.
pub struct HealthMonitor {
    window: Duration,
    threshold: u32,
    failures: mpsc::Receiver<DeviceFailure>,
    entity: EntityHandle,
    records: HashMap<i64, FailureRecord>,
    stopper: Stopper,
}

impl HealthMonitor {
    pub fn new(
        config: &HealthConfig,
        failures: mpsc::Receiver<DeviceFailure>,
        entity: EntityHandle,
        stopper: Stopper,
    ) -> Self {
        HealthMonitor {
            window: Duration::seconds(config.window_seconds as i64),
            threshold: config.threshold.max(1),
            failures,
            entity,
            records: HashMap::new(),
            stopper,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.stopper.stopped() => {
                    info!("run - health monitor stopping");
                    return;
                }
                failure = self.failures.recv() => match failure {
                    Some(failure) => self.on_failure(failure),
                    None => {
                        info!("run - failure channel closed, health monitor exiting");
                        return;
                    }
                }
            }
        }
    }

    fn on_failure(&mut self, failure: DeviceFailure) {
        trace!(
            "on_failure - device {} failed ({})",
            failure.device_id,
            failure.reason.as_str()
        );
        if !self.observe(failure.device_id, failure.at) {
            return;
        }
        info!(
            "on_failure - device {} crossed the failure threshold, requesting deactivation",
            failure.device_id
        );
        // Awaited in the background so one slow deactivation cannot
        // head-of-line the failure stream.
        let entity = self.entity.clone();
        let device_id = failure.device_id;
        tokio::spawn(async move {
            match entity.deactivate_device(device_id).await {
                Ok(device) => info!(
                    "on_failure - device {} deactivated after repeated failures",
                    device.id
                ),
                Err(e) => warn!("on_failure - deactivation of device {} failed: {}", device_id, e),
            }
        });
    }

    /// Pure window transition. Returns true exactly when this failure is
    /// the `threshold`-th inside the window; the record is erased at that
    /// point.
    fn observe(&mut self, device_id: i64, at: DateTime<Utc>) -> bool {
        let record = self.records.entry(device_id).or_insert(FailureRecord {
            last_failure_at: at,
            count: 0,
        });
        if record.count > 0 && at - record.last_failure_at < self.window {
            record.count += 1;
        } else {
            record.count = 1;
        }
        record.last_failure_at = at;
        if record.count >= self.threshold {
            self.records.remove(&device_id);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nms_shared::bus::{EntityError, EntityRequest, FailureReason};
    use nms_shared::entity::{Device, DeviceStatus};

    fn monitor(window_seconds: u64, threshold: u32) -> (HealthMonitor, mpsc::Sender<DeviceFailure>) {
        let (req_tx, _req_rx) = mpsc::channel(8);
        let (ctl_tx, _ctl_rx) = mpsc::channel(8);
        let (failures_tx, failures_rx) = mpsc::channel(8);
        let monitor = HealthMonitor::new(
            &HealthConfig {
                window_seconds,
                threshold,
            },
            failures_rx,
            EntityHandle::new(req_tx, ctl_tx),
            Stopper::new(),
        );
        (monitor, failures_tx)
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        let base: DateTime<Utc> = "2026-01-05T10:00:00Z".parse().unwrap();
        base + Duration::seconds(seconds)
    }

    #[test]
    fn test_deactivation_fires_exactly_at_threshold() {
        let (mut monitor, _tx) = monitor(60, 3);
        assert!(!monitor.observe(1, at(0)));
        assert!(!monitor.observe(1, at(10)));
        assert!(monitor.observe(1, at(20)));
        // The record was erased; counting starts over.
        assert!(!monitor.observe(1, at(21)));
    }

    #[test]
    fn test_gap_outside_window_resets_count() {
        let (mut monitor, _tx) = monitor(60, 3);
        assert!(!monitor.observe(1, at(0)));
        assert!(!monitor.observe(1, at(10)));
        // 70s after the last failure: the window has lapsed.
        assert!(!monitor.observe(1, at(80)));
        assert!(!monitor.observe(1, at(90)));
        assert!(monitor.observe(1, at(100)));
    }

    #[test]
    fn test_devices_are_tracked_independently() {
        let (mut monitor, _tx) = monitor(60, 2);
        assert!(!monitor.observe(1, at(0)));
        assert!(!monitor.observe(2, at(1)));
        assert!(monitor.observe(1, at(2)));
        assert!(monitor.observe(2, at(3)));
    }

    #[test]
    fn test_threshold_of_one_fires_immediately() {
        let (mut monitor, _tx) = monitor(60, 1);
        assert!(monitor.observe(5, at(0)));
    }

    #[test]
    fn test_boundary_gap_equal_to_window_resets() {
        let (mut monitor, _tx) = monitor(60, 2);
        assert!(!monitor.observe(1, at(0)));
        // Exactly the window apart: not "within" it.
        assert!(!monitor.observe(1, at(60)));
        assert!(monitor.observe(1, at(61)));
    }

    #[tokio::test]
    async fn test_threshold_submits_deactivation_request() {
        let (req_tx, mut req_rx) = mpsc::channel(8);
        let (ctl_tx, _ctl_rx) = mpsc::channel(8);
        let (failures_tx, failures_rx) = mpsc::channel(8);
        let stopper = Stopper::new();
        let monitor = HealthMonitor::new(
            &HealthConfig {
                window_seconds: 60,
                threshold: 3,
            },
            failures_rx,
            EntityHandle::new(req_tx, ctl_tx),
            stopper.clone(),
        );
        tokio::spawn(monitor.run());

        for i in 0..3 {
            failures_tx
                .send(DeviceFailure {
                    device_id: 7,
                    at: at(i),
                    reason: FailureReason::Ping,
                })
                .await
                .unwrap();
        }

        // The third failure triggers exactly one deactivation request.
        let request = tokio::time::timeout(std::time::Duration::from_secs(2), req_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match request {
            EntityRequest::DeactivateDevice { id, reply } => {
                assert_eq!(id, 7);
                let device = Device {
                    id: 7,
                    hostname: None,
                    ip_address: "10.0.0.7".to_string(),
                    plugin_id: "snmp".to_string(),
                    port: 161,
                    credential_profile_id: 1,
                    discovery_profile_id: None,
                    polling_interval_seconds: 60,
                    should_ping: true,
                    status: DeviceStatus::Inactive,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                };
                let _ = reply.send(Ok(device));
            }
            other => panic!("unexpected request {:?}", other),
        }
        assert!(req_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_deactivation_is_survivable() {
        let (req_tx, mut req_rx) = mpsc::channel(8);
        let (ctl_tx, _ctl_rx) = mpsc::channel(8);
        let (failures_tx, failures_rx) = mpsc::channel(8);
        let monitor = HealthMonitor::new(
            &HealthConfig {
                window_seconds: 60,
                threshold: 1,
            },
            failures_rx,
            EntityHandle::new(req_tx, ctl_tx),
            Stopper::new(),
        );
        tokio::spawn(monitor.run());
        failures_tx
            .send(DeviceFailure {
                device_id: 9,
                at: at(0),
                reason: FailureReason::Poll,
            })
            .await
            .unwrap();
        if let Some(EntityRequest::DeactivateDevice { id, reply }) = req_rx.recv().await {
            let _ = reply.send(Err(EntityError::NotFound { kind: "device", id }));
        }
        // The monitor keeps consuming failures afterwards.
        failures_tx
            .send(DeviceFailure {
                device_id: 9,
                at: at(1),
                reason: FailureReason::Poll,
            })
            .await
            .unwrap();
        assert!(matches!(
            tokio::time::timeout(std::time::Duration::from_secs(2), req_rx.recv())
                .await
                .unwrap(),
            Some(EntityRequest::DeactivateDevice { id: 9, .. })
        ));
    }
}
