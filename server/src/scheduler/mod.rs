pub mod deadline_queue;
pub mod ping;

use self::deadline_queue::{DeadlineEntry, DeadlineQueue};
use self::ping::ReachabilityProbe;
use chrono::Utc;
use log::{debug, info, trace, warn};
use nms_shared::bus::{publish_or_drop, DeviceEvent, DeviceFailure, EntityHandle, FailureReason};
use nms_shared::config::SchedulerConfig;
use nms_shared::entity::{Device, MIN_POLLING_INTERVAL_SECS};
use nms_shared::os::stopper::Stopper;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Deadline-driven polling scheduler.
///
/// Owns the deadline queue exclusively. Each tick pops every expired entry,
/// resolves the ids against the entity service, probes reachability for the
/// devices that want it, reschedules everything, and hands the qualified
/// batch to the poller in one send.
pub struct Scheduler<P: ReachabilityProbe> {
    queue: DeadlineQueue,
    tick: Duration,
    reschedule_on_update: bool,
    entity: EntityHandle,
    dispatch: mpsc::Sender<Vec<Device>>,
    failures: mpsc::Sender<DeviceFailure>,
    device_events: mpsc::Receiver<DeviceEvent>,
    probe: P,
    stopper: Stopper,
}

impl<P: ReachabilityProbe> Scheduler<P> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &SchedulerConfig,
        entity: EntityHandle,
        dispatch: mpsc::Sender<Vec<Device>>,
        failures: mpsc::Sender<DeviceFailure>,
        device_events: mpsc::Receiver<DeviceEvent>,
        probe: P,
        stopper: Stopper,
    ) -> Self {
        Scheduler {
            queue: DeadlineQueue::new(),
            tick: Duration::from_secs(config.tick_seconds.max(1)),
            reschedule_on_update: config.reschedule_on_update,
            entity,
            dispatch,
            failures,
            device_events,
            probe,
            stopper,
        }
    }

    /// Seeds one entry per active device with deadline = now, so every
    /// device is eligible on the first tick after boot.
    pub fn seed(&mut self, device_ids: Vec<i64>) {
        let now = Instant::now();
        let count = device_ids.len();
        self.queue.push_batch(device_ids.into_iter().map(|device_id| DeadlineEntry {
            device_id,
            deadline: now,
        }));
        info!("seed - scheduler primed with {} active devices", count);
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.stopper.stopped() => {
                    info!("run - scheduler stopping");
                    return;
                }
                _ = ticker.tick() => self.on_tick().await,
                Some(event) = self.device_events.recv() => self.on_device_event(event),
            }
        }
    }

    /// Device mutations reschedule eagerly; deletions are left to lazy
    /// reconciliation (the entity service drops the id from the next
    /// `GetBatch`, so the stale heap entry evaporates on its own).
    fn on_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Created(device) => {
                trace!("on_device_event - device {} created, scheduling now", device.id);
                self.queue.push(DeadlineEntry {
                    device_id: device.id,
                    deadline: Instant::now(),
                });
            }
            DeviceEvent::Updated(device) => {
                if self.reschedule_on_update {
                    trace!("on_device_event - device {} updated, rescheduling now", device.id);
                    self.queue.push(DeadlineEntry {
                        device_id: device.id,
                        deadline: Instant::now(),
                    });
                }
            }
            DeviceEvent::Deleted(id) => {
                trace!("on_device_event - device {} deleted, leaving queue to lazy cleanup", id);
            }
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        let expired = self.queue.pop_expired(now);
        if expired.is_empty() {
            return;
        }
        trace!("on_tick - {} deadlines expired", expired.len());

        // First occurrence wins: pop order is non-decreasing, so duplicates
        // of the same id keep their earliest deadline as the base.
        let mut original: HashMap<i64, Instant> = HashMap::with_capacity(expired.len());
        let mut ids = Vec::with_capacity(expired.len());
        for entry in &expired {
            if !original.contains_key(&entry.device_id) {
                ids.push(entry.device_id);
            }
            original.entry(entry.device_id).or_insert(entry.deadline);
        }

        let batch = match self.entity.get_batch(ids).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(
                    "on_tick - entity lookup failed, pushing {} entries one tick out: {}",
                    expired.len(),
                    e
                );
                let tick = self.tick;
                self.queue.push_batch(expired.into_iter().map(|mut entry| {
                    entry.deadline += tick;
                    entry
                }));
                return;
            }
        };

        let unique_ips: Vec<String> = batch
            .to_ping
            .iter()
            .map(|device| device.ip_address.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let alive = if unique_ips.is_empty() {
            HashSet::new()
        } else {
            match self.probe.alive_hosts(unique_ips).await {
                Ok(alive) => alive,
                Err(e) => {
                    warn!("on_tick - reachability probe failed, assuming nothing alive: {}", e);
                    HashSet::new()
                }
            }
        };

        let mut qualified = Vec::with_capacity(batch.to_ping.len() + batch.to_skip.len());
        let mut rescheduled = Vec::with_capacity(batch.to_ping.len() + batch.to_skip.len());
        for device in batch.to_ping {
            rescheduled.push(self.next_entry(&original, &device, now));
            if alive.contains(&device.ip_address) {
                qualified.push(device);
            } else {
                debug!("on_tick - device {} unreachable at {}", device.id, device.ip_address);
                publish_or_drop(
                    "device-failures",
                    &self.failures,
                    DeviceFailure {
                        device_id: device.id,
                        at: Utc::now(),
                        reason: FailureReason::Ping,
                    },
                );
            }
        }
        for device in batch.to_skip {
            rescheduled.push(self.next_entry(&original, &device, now));
            qualified.push(device);
        }
        self.queue.push_batch(rescheduled);

        if !qualified.is_empty() {
            trace!("on_tick - dispatching {} qualified devices", qualified.len());
            if self.dispatch.send(qualified).await.is_err() {
                warn!("on_tick - poller channel closed, batch dropped");
            }
        }
    }

    /// Next deadline = the entry's original deadline + the device's polling
    /// interval, so a slow tick does not drift the cadence.
    fn next_entry(
        &self,
        original: &HashMap<i64, Instant>,
        device: &Device,
        now: Instant,
    ) -> DeadlineEntry {
        let base = original.get(&device.id).copied().unwrap_or(now);
        let interval = device.polling_interval_seconds.max(MIN_POLLING_INTERVAL_SECS) as u64;
        DeadlineEntry {
            device_id: device.id,
            deadline: base + Duration::from_secs(interval),
        }
    }
}
