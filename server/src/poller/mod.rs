use crate::plugin::pool::{PluginJob, PluginPool};
use crate::plugin::{resolve_plugin_binary, PluginResult, PluginTask};
use log::{error, info, trace, warn};
use nms_shared::bus::EntityHandle;
use nms_shared::crypto::PayloadCipher;
use nms_shared::entity::Device;
use nms_shared::os::stopper::Stopper;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Consumes qualified device batches from the scheduler, groups them by
/// protocol, attaches decrypted credentials and submits one subprocess job
/// per protocol group.
pub struct Poller {
    batches: mpsc::Receiver<Vec<Device>>,
    entity: EntityHandle,
    jobs: PluginPool<PluginTask>,
    plugin_dir: PathBuf,
    cipher: PayloadCipher,
    stopper: Stopper,
}

impl Poller {
    pub fn new(
        batches: mpsc::Receiver<Vec<Device>>,
        entity: EntityHandle,
        jobs: PluginPool<PluginTask>,
        plugin_dir: PathBuf,
        cipher: PayloadCipher,
        stopper: Stopper,
    ) -> Self {
        Poller {
            batches,
            entity,
            jobs,
            plugin_dir,
            cipher,
            stopper,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.stopper.stopped() => {
                    info!("run - poller stopping");
                    return;
                }
                batch = self.batches.recv() => match batch {
                    Some(devices) => self.dispatch(devices).await,
                    None => {
                        info!("run - scheduler channel closed, poller exiting");
                        return;
                    }
                }
            }
        }
    }

    async fn dispatch(&self, devices: Vec<Device>) {
        trace!("dispatch - {} qualified devices", devices.len());
        for (protocol, group) in group_by_protocol(devices) {
            let Some(binary) = resolve_plugin_binary(&self.plugin_dir, &protocol) else {
                error!(
                    "dispatch - no executable plugin for protocol {:?}, dropping {} devices",
                    protocol,
                    group.len()
                );
                continue;
            };
            let mut tasks = Vec::with_capacity(group.len());
            for device in group {
                let credentials = self.credentials_for(&device).await;
                tasks.push(PluginTask {
                    target: device.ip_address.clone(),
                    port: device.port,
                    credentials,
                    device_id: Some(device.id),
                    request_id: None,
                });
            }
            if let Err(e) = self.jobs.submit(PluginJob { binary, tasks }).await {
                warn!("dispatch - plugin pool rejected {} batch: {}", protocol, e);
            }
        }
    }

    /// Resolves and decrypts the device's credential payload. Any failure
    /// substitutes an empty credential object; the plugin may still manage
    /// unauthenticated work or fail cleanly per target.
    async fn credentials_for(&self, device: &Device) -> serde_json::Value {
        match self.entity.get_credential(device.credential_profile_id).await {
            Ok(profile) => match self.cipher.decrypt_json(&profile.payload) {
                Ok(credentials) => credentials,
                Err(e) => {
                    warn!(
                        "credentials_for - decrypt of profile {} for device {} failed: {}",
                        profile.id, device.id, e
                    );
                    empty_credentials()
                }
            },
            Err(e) => {
                warn!(
                    "credentials_for - lookup of profile {} for device {} failed: {}",
                    device.credential_profile_id, device.id, e
                );
                empty_credentials()
            }
        }
    }
}

fn empty_credentials() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Partitions a batch by plugin tag so each subprocess sees one homogeneous
/// task list.
pub fn group_by_protocol(devices: Vec<Device>) -> HashMap<String, Vec<Device>> {
    let mut groups: HashMap<String, Vec<Device>> = HashMap::new();
    for device in devices {
        groups.entry(device.plugin_id.clone()).or_default().push(device);
    }
    groups
}

/// Forwards plugin result batches to the metrics pipeline, suppressing the
/// empty ones (crashed or unparseable plugin runs).
pub async fn forward_results(
    mut results: mpsc::Receiver<Vec<PluginResult>>,
    sink: mpsc::Sender<Vec<PluginResult>>,
    stopper: Stopper,
) {
    loop {
        tokio::select! {
            _ = stopper.stopped() => return,
            batch = results.recv() => match batch {
                Some(batch) if batch.is_empty() => {
                    trace!("forward_results - suppressing empty batch");
                }
                Some(batch) => {
                    if sink.send(batch).await.is_err() {
                        return;
                    }
                }
                None => return,
            }
        }
    }
}
