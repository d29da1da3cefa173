pub mod targets;

use self::targets::expand_target;
use crate::plugin::pool::{PluginJob, PluginPool};
use crate::plugin::{resolve_plugin_binary, PluginResult, PluginTask};
use log::{error, info, trace, warn};
use nms_shared::bus::{DiscoveredDevice, RunDiscovery};
use nms_shared::crypto::PayloadCipher;
use nms_shared::os::stopper::Stopper;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// What we remember about an in-flight probe, keyed by target IP. The
/// collector consumes entries as results arrive; leftovers belong to
/// targets that never answered.
#[derive(Debug, Clone)]
pub struct PendingContext {
    pub discovery_profile_id: i64,
    pub credential_profile_id: i64,
    pub port: i32,
}

pub type PendingContexts = Arc<RwLock<HashMap<String, PendingContext>>>;

/// One-shot scan executor. Each `RunDiscovery` event expands its target
/// expression, records a pending context per address and submits a single
/// subprocess job with one task per address.
pub struct DiscoveryService {
    runs: mpsc::Receiver<RunDiscovery>,
    jobs: PluginPool<PluginTask>,
    pending: PendingContexts,
    plugin_dir: PathBuf,
    cipher: PayloadCipher,
    stopper: Stopper,
}

impl DiscoveryService {
    pub fn new(
        runs: mpsc::Receiver<RunDiscovery>,
        jobs: PluginPool<PluginTask>,
        pending: PendingContexts,
        plugin_dir: PathBuf,
        cipher: PayloadCipher,
        stopper: Stopper,
    ) -> Self {
        DiscoveryService {
            runs,
            jobs,
            pending,
            plugin_dir,
            cipher,
            stopper,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.stopper.stopped() => {
                    info!("run - discovery service stopping");
                    return;
                }
                run = self.runs.recv() => match run {
                    Some(run) => self.launch(run).await,
                    None => {
                        info!("run - discovery channel closed, service exiting");
                        return;
                    }
                }
            }
        }
    }

    async fn launch(&self, run: RunDiscovery) {
        let profile = run.profile;
        let targets = match expand_target(&profile.target) {
            Ok(targets) => targets,
            Err(e) => {
                error!(
                    "launch - profile {} has unusable target {:?}: {}",
                    profile.id, profile.target, e
                );
                return;
            }
        };
        let credentials = match self.cipher.decrypt_json(&run.credential.payload) {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(
                    "launch - decrypt of credential {} failed, probing without: {}",
                    run.credential.id, e
                );
                serde_json::Value::Object(serde_json::Map::new())
            }
        };
        let Some(binary) = resolve_plugin_binary(&self.plugin_dir, &run.credential.protocol) else {
            error!(
                "launch - no executable plugin for protocol {:?}, profile {} skipped",
                run.credential.protocol, profile.id
            );
            return;
        };
        {
            let mut pending = self.pending.write().unwrap();
            for target in &targets {
                pending.insert(
                    target.clone(),
                    PendingContext {
                        discovery_profile_id: profile.id,
                        credential_profile_id: profile.credential_profile_id,
                        port: profile.port,
                    },
                );
            }
        }
        info!(
            "launch - profile {} probing {} targets via {:?}",
            profile.id,
            targets.len(),
            run.credential.protocol
        );
        let tasks: Vec<PluginTask> = targets
            .into_iter()
            .map(|target| PluginTask {
                target,
                port: profile.port,
                credentials: credentials.clone(),
                device_id: None,
                request_id: None,
            })
            .collect();
        if let Err(e) = self.jobs.submit(PluginJob { binary, tasks }).await {
            warn!("launch - plugin pool rejected scan for profile {}: {}", profile.id, e);
        }
    }
}

/// Matches one plugin result against the pending-context map. Successful
/// results with a hostname claim (and remove) their context; everything
/// else is dropped here.
pub fn claim_pending(pending: &PendingContexts, result: &PluginResult) -> Option<DiscoveredDevice> {
    if !result.success {
        trace!(
            "claim_pending - probe of {} failed: {}",
            result.target,
            result.error.as_deref().unwrap_or("no error reported")
        );
        return None;
    }
    let hostname = match result.hostname.as_deref() {
        Some(hostname) if !hostname.is_empty() => hostname.to_string(),
        _ => {
            trace!("claim_pending - {} answered without a hostname, dropping", result.target);
            return None;
        }
    };
    let context = pending.write().unwrap().remove(&result.target);
    match context {
        Some(context) => Some(DiscoveredDevice {
            target: result.target.clone(),
            port: context.port,
            hostname,
            discovery_profile_id: context.discovery_profile_id,
            credential_profile_id: context.credential_profile_id,
        }),
        None => {
            // Late arrival, e.g. after the profile was deleted mid-flight.
            warn!("claim_pending - no pending context for {}, result dropped", result.target);
            None
        }
    }
}

/// Collector task: enriches successful results with their pending context
/// and forwards them to the entity service for provisioning.
pub async fn collect_results(
    mut results: mpsc::Receiver<Vec<PluginResult>>,
    pending: PendingContexts,
    discovered: mpsc::Sender<DiscoveredDevice>,
    stopper: Stopper,
) {
    loop {
        tokio::select! {
            _ = stopper.stopped() => return,
            batch = results.recv() => match batch {
                Some(batch) => {
                    for result in batch {
                        if let Some(device) = claim_pending(&pending, &result) {
                            if discovered.send(device).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nms_shared::entity::{CredentialProfile, DiscoveryProfile};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    const TEST_KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

    fn pending_with(entries: &[(&str, i64, i64, i32)]) -> PendingContexts {
        let map: HashMap<String, PendingContext> = entries
            .iter()
            .map(|(target, profile, credential, port)| {
                (
                    target.to_string(),
                    PendingContext {
                        discovery_profile_id: *profile,
                        credential_profile_id: *credential,
                        port: *port,
                    },
                )
            })
            .collect();
        Arc::new(RwLock::new(map))
    }

    fn result(target: &str, success: bool, hostname: Option<&str>) -> PluginResult {
        PluginResult {
            target: target.to_string(),
            port: 5985,
            success,
            error: if success { None } else { Some("timeout".to_string()) },
            hostname: hostname.map(String::from),
            data: None,
            device_id: None,
            request_id: None,
        }
    }

    #[test]
    fn test_claim_pending_enriches_and_removes() {
        let pending = pending_with(&[("10.0.0.2", 3, 1, 5985)]);
        let device = claim_pending(&pending, &result("10.0.0.2", true, Some("HOST2"))).unwrap();
        assert_eq!(device.hostname, "HOST2");
        assert_eq!(device.port, 5985);
        assert_eq!(device.discovery_profile_id, 3);
        assert_eq!(device.credential_profile_id, 1);
        assert!(pending.read().unwrap().is_empty());
    }

    #[test]
    fn test_claim_pending_drops_failures_and_keeps_context() {
        let pending = pending_with(&[("10.0.0.2", 3, 1, 5985)]);
        assert!(claim_pending(&pending, &result("10.0.0.2", false, None)).is_none());
        assert_eq!(pending.read().unwrap().len(), 1);
    }

    #[test]
    fn test_claim_pending_requires_hostname() {
        let pending = pending_with(&[("10.0.0.2", 3, 1, 5985)]);
        assert!(claim_pending(&pending, &result("10.0.0.2", true, None)).is_none());
        assert!(claim_pending(&pending, &result("10.0.0.2", true, Some(""))).is_none());
        // Context stays for a later, complete result in the same batch run.
        assert_eq!(pending.read().unwrap().len(), 1);
    }

    #[test]
    fn test_claim_pending_unmatched_target_dropped() {
        let pending = pending_with(&[]);
        assert!(claim_pending(&pending, &result("10.0.0.9", true, Some("HOST9"))).is_none());
    }

    #[tokio::test]
    async fn test_collect_results_forwards_enriched_devices() {
        let pending = pending_with(&[("10.0.0.2", 3, 1, 5985)]);
        let (results_tx, results_rx) = mpsc::channel(4);
        let (discovered_tx, mut discovered_rx) = mpsc::channel(4);
        tokio::spawn(collect_results(
            results_rx,
            pending,
            discovered_tx,
            Stopper::new(),
        ));
        results_tx
            .send(vec![
                result("10.0.0.1", false, None),
                result("10.0.0.2", true, Some("HOST2")),
                result("10.0.0.3", true, Some("HOST3")), // no pending entry
            ])
            .await
            .unwrap();
        let device = tokio::time::timeout(Duration::from_secs(2), discovered_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(device.target, "10.0.0.2");
        assert!(discovered_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_launch_records_pending_and_submits_one_task_per_target() {
        let cipher = PayloadCipher::from_base64_key(TEST_KEY).unwrap();
        let plugin_dir = tempfile::tempdir().unwrap();
        let binary = plugin_dir.path().join("winrm");
        // Discovery-mode stand-in: succeed for .2 only.
        fs::write(
            &binary,
            r#"#!/bin/sh
cat > /dev/null
echo '[{"target":"10.0.0.1","port":5985,"success":false,"error":"timeout"},
       {"target":"10.0.0.2","port":5985,"success":true,"hostname":"HOST2"},
       {"target":"10.0.0.3","port":5985,"success":false,"error":"timeout"}]'
"#,
        )
        .unwrap();
        let mut perms = fs::metadata(&binary).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&binary, perms).unwrap();

        let stopper = Stopper::new();
        let (pool, mut pool_results) = PluginPool::<PluginTask>::start::<PluginResult>(
            "discovery",
            1,
            4,
            vec![crate::plugin::DISCOVERY_FLAG.to_string()],
            stopper.clone(),
        );
        let (_runs_tx, runs_rx) = mpsc::channel(4);
        let pending: PendingContexts = Arc::new(RwLock::new(HashMap::new()));
        let service = DiscoveryService::new(
            runs_rx,
            pool,
            pending.clone(),
            plugin_dir.path().to_path_buf(),
            cipher.clone(),
            stopper,
        );

        let payload = cipher.encrypt(br#"{"username":"admin"}"#).unwrap();
        service
            .launch(RunDiscovery {
                profile: DiscoveryProfile {
                    id: 3,
                    name: "lab".to_string(),
                    target: "10.0.0.1-10.0.0.3".to_string(),
                    port: 5985,
                    credential_profile_id: 1,
                    auto_provision: true,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                },
                credential: CredentialProfile {
                    id: 1,
                    name: "lab".to_string(),
                    protocol: "winrm".to_string(),
                    payload,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                },
            })
            .await;

        // Three targets expanded, three pending contexts recorded.
        assert_eq!(pending.read().unwrap().len(), 3);
        let batch = tokio::time::timeout(Duration::from_secs(5), pool_results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 3);
        let device = claim_pending(&pending, &batch[1]).unwrap();
        assert_eq!(device.hostname, "HOST2");
        assert_eq!(pending.read().unwrap().len(), 2);
    }
}
