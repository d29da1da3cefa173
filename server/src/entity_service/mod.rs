pub mod store;

use self::store::{DeviceDraft, EntityStore};
use log::{error, info, trace, warn};
use nms_shared::bus::{
    publish_or_drop, ControlEvent, CredentialCommand, CredentialEvent, DeviceBatch, DeviceCommand,
    DeviceEvent, DiscoveredDevice, DiscoveryProfileCommand, DiscoveryProfileEvent, EntityError,
    EntityRequest, RunDiscovery, Topic,
};
use nms_shared::entity::{
    CredentialProfile, CredentialProfileChanges, Device, DeviceChanges, DeviceStatus,
    DiscoveryProfile, DiscoveryProfileChanges, NewCredentialProfile, NewDevice,
    NewDiscoveryProfile, DEFAULT_POLLING_INTERVAL_SECS, MIN_POLLING_INTERVAL_SECS,
};
use nms_shared::os::stopper::Stopper;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// The authoritative in-memory view of devices and credential profiles.
/// Only the entity service task writes it; it is read under a shared lock
/// when answering lookups.
#[derive(Default)]
pub struct EntityCache {
    pub devices: HashMap<i64, Device>,
    pub credentials: HashMap<i64, CredentialProfile>,
}

/// The entity service: authoritative caches plus the CRUD router.
///
/// One consumer loop selects over three inputs: CRUD requests, control
/// events and discovery results. Every mutation commits to the database
/// first, then the cache, then publishes its event, so consumer caches
/// always converge on what the database holds.
pub struct EntityService<S: EntityStore> {
    store: S,
    cache: Arc<RwLock<EntityCache>>,
    requests: mpsc::Receiver<EntityRequest>,
    control: mpsc::Receiver<ControlEvent>,
    discovered: mpsc::Receiver<DiscoveredDevice>,
    device_events: Topic<DeviceEvent>,
    credential_events: Topic<CredentialEvent>,
    profile_events: Topic<DiscoveryProfileEvent>,
    run_discovery: mpsc::Sender<RunDiscovery>,
    stopper: Stopper,
}

impl<S: EntityStore> EntityService<S> {
    pub fn new(
        store: S,
        requests: mpsc::Receiver<EntityRequest>,
        control: mpsc::Receiver<ControlEvent>,
        discovered: mpsc::Receiver<DiscoveredDevice>,
        run_discovery: mpsc::Sender<RunDiscovery>,
        stopper: Stopper,
    ) -> Self {
        EntityService {
            store,
            cache: Arc::new(RwLock::new(EntityCache::default())),
            requests,
            control,
            discovered,
            device_events: Topic::new("device-events"),
            credential_events: Topic::new("credential-events"),
            profile_events: Topic::new("discovery-profile-events"),
            run_discovery,
            stopper,
        }
    }

    pub fn subscribe_device_events(&mut self, capacity: usize) -> mpsc::Receiver<DeviceEvent> {
        self.device_events.subscribe(capacity)
    }

    /// Unwired by default; consumers that cache credentials locally can
    /// subscribe during startup.
    pub fn subscribe_credential_events(&mut self, capacity: usize) -> mpsc::Receiver<CredentialEvent> {
        self.credential_events.subscribe(capacity)
    }

    pub fn subscribe_discovery_profile_events(
        &mut self,
        capacity: usize,
    ) -> mpsc::Receiver<DiscoveryProfileEvent> {
        self.profile_events.subscribe(capacity)
    }

    /// Loads both tables into the cache. Called once before the consumer
    /// loop starts.
    pub async fn load(&mut self) -> Result<(), EntityError> {
        let devices = self.store.load_devices().await?;
        let credentials = self.store.load_credential_profiles().await?;
        let mut cache = self.cache.write().unwrap();
        cache.devices = devices.into_iter().map(|d| (d.id, d)).collect();
        cache.credentials = credentials.into_iter().map(|c| (c.id, c)).collect();
        info!(
            "load - cached {} devices, {} credential profiles",
            cache.devices.len(),
            cache.credentials.len()
        );
        Ok(())
    }

    /// Ids the scheduler seeds its deadline queue with at boot.
    pub fn active_device_ids(&self) -> Vec<i64> {
        let cache = self.cache.read().unwrap();
        let mut ids: Vec<i64> = cache
            .devices
            .values()
            .filter(|d| d.status == DeviceStatus::Active)
            .map(|d| d.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub async fn run(mut self) {
        info!("run - entity service online");
        loop {
            tokio::select! {
                _ = self.stopper.stopped() => {
                    info!("run - entity service stopping");
                    return;
                }
                Some(request) = self.requests.recv() => self.handle_request(request).await,
                Some(event) = self.control.recv() => self.handle_control(event).await,
                Some(result) = self.discovered.recv() => self.provision(result).await,
                else => {
                    info!("run - all inputs closed, entity service exiting");
                    return;
                }
            }
        }
    }

    async fn handle_request(&mut self, request: EntityRequest) {
        match request {
            EntityRequest::Device(command) => match command {
                DeviceCommand::List { reply } => {
                    let _ = reply.send(Ok(self.list_devices()));
                }
                DeviceCommand::Get { id, reply } => {
                    let _ = reply.send(self.get_device(id));
                }
                DeviceCommand::Create { new, reply } => {
                    let _ = reply.send(self.create_device(new).await);
                }
                DeviceCommand::Update { id, changes, reply } => {
                    let _ = reply.send(self.update_device(id, changes).await);
                }
                DeviceCommand::Delete { id, reply } => {
                    let _ = reply.send(self.delete_device(id).await);
                }
            },
            EntityRequest::Credential(command) => match command {
                CredentialCommand::List { reply } => {
                    let _ = reply.send(Ok(self.list_credentials()));
                }
                CredentialCommand::Get { id, reply } => {
                    let _ = reply.send(self.get_credential(id));
                }
                CredentialCommand::Create { new, reply } => {
                    let _ = reply.send(self.create_credential(new).await);
                }
                CredentialCommand::Update { id, changes, reply } => {
                    let _ = reply.send(self.update_credential(id, changes).await);
                }
                CredentialCommand::Delete { id, reply } => {
                    let _ = reply.send(self.delete_credential(id).await);
                }
            },
            EntityRequest::DiscoveryProfile(command) => match command {
                DiscoveryProfileCommand::List { reply } => {
                    let _ = reply.send(self.store.list_discovery_profiles().await);
                }
                DiscoveryProfileCommand::Get { id, reply } => {
                    let _ = reply.send(self.get_discovery_profile(id).await);
                }
                DiscoveryProfileCommand::Create { new, reply } => {
                    let _ = reply.send(self.create_discovery_profile(new).await);
                }
                DiscoveryProfileCommand::Update { id, changes, reply } => {
                    let _ = reply.send(self.update_discovery_profile(id, changes).await);
                }
                DiscoveryProfileCommand::Delete { id, reply } => {
                    let _ = reply.send(self.delete_discovery_profile(id).await);
                }
            },
            EntityRequest::GetBatch { ids, reply } => {
                let _ = reply.send(self.get_batch(&ids));
            }
            EntityRequest::GetCredential { id, reply } => {
                let _ = reply.send(self.get_credential(id));
            }
            EntityRequest::DeactivateDevice { id, reply } => {
                let _ = reply.send(self.deactivate_device(id).await);
            }
        }
    }

    async fn handle_control(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::TriggerDiscovery { profile_id } => self.trigger_discovery(profile_id).await,
            ControlEvent::ActivateDevice {
                device_id,
                polling_interval_seconds,
            } => self.activate_device(device_id, polling_interval_seconds).await,
        }
    }

    // ---- devices ----

    fn list_devices(&self) -> Vec<Device> {
        let cache = self.cache.read().unwrap();
        let mut devices: Vec<Device> = cache.devices.values().cloned().collect();
        devices.sort_by_key(|d| d.id);
        devices
    }

    fn get_device(&self, id: i64) -> Result<Device, EntityError> {
        self.cache
            .read()
            .unwrap()
            .devices
            .get(&id)
            .cloned()
            .ok_or(EntityError::NotFound { kind: "device", id })
    }

    async fn create_device(&mut self, new: NewDevice) -> Result<Device, EntityError> {
        let interval = new
            .polling_interval_seconds
            .unwrap_or(DEFAULT_POLLING_INTERVAL_SECS);
        if interval < MIN_POLLING_INTERVAL_SECS {
            return Err(EntityError::Invalid(format!(
                "polling interval must be at least {} second(s)",
                MIN_POLLING_INTERVAL_SECS
            )));
        }
        // The protocol tag always comes from the credential profile.
        let protocol = self
            .cache
            .read()
            .unwrap()
            .credentials
            .get(&new.credential_profile_id)
            .map(|c| c.protocol.clone())
            .ok_or(EntityError::NotFound {
                kind: "credential profile",
                id: new.credential_profile_id,
            })?;
        if self.endpoint_in_cache(&new.ip_address, new.port, None) {
            return Err(EntityError::Duplicate {
                ip: new.ip_address,
                port: new.port,
            });
        }
        let draft = DeviceDraft {
            hostname: new.hostname,
            ip_address: new.ip_address,
            plugin_id: protocol,
            port: new.port,
            credential_profile_id: new.credential_profile_id,
            discovery_profile_id: new.discovery_profile_id,
            polling_interval_seconds: interval,
            should_ping: new.should_ping.unwrap_or(true),
            status: new.status.unwrap_or(DeviceStatus::Active),
        };
        let device = self.store.insert_device(draft).await?;
        self.cache
            .write()
            .unwrap()
            .devices
            .insert(device.id, device.clone());
        self.device_events.publish(DeviceEvent::Created(device.clone()));
        Ok(device)
    }

    async fn update_device(&mut self, id: i64, changes: DeviceChanges) -> Result<Device, EntityError> {
        let mut device = self.get_device(id)?;
        if let Some(credential_id) = changes.credential_profile_id {
            if credential_id != device.credential_profile_id {
                return Err(EntityError::Immutable("credential_profile_id"));
            }
        }
        if let Some(profile_id) = changes.discovery_profile_id {
            if Some(profile_id) != device.discovery_profile_id {
                return Err(EntityError::Immutable("discovery_profile_id"));
            }
        }
        if let Some(interval) = changes.polling_interval_seconds {
            if interval < MIN_POLLING_INTERVAL_SECS {
                return Err(EntityError::Invalid(format!(
                    "polling interval must be at least {} second(s)",
                    MIN_POLLING_INTERVAL_SECS
                )));
            }
            device.polling_interval_seconds = interval;
        }
        if let Some(hostname) = changes.hostname {
            device.hostname = Some(hostname);
        }
        if let Some(ip_address) = changes.ip_address {
            device.ip_address = ip_address;
        }
        if let Some(port) = changes.port {
            device.port = port;
        }
        if let Some(should_ping) = changes.should_ping {
            device.should_ping = should_ping;
        }
        if let Some(status) = changes.status {
            device.status = status;
        }
        if self.endpoint_in_cache(&device.ip_address, device.port, Some(id)) {
            return Err(EntityError::Duplicate {
                ip: device.ip_address,
                port: device.port,
            });
        }
        let updated = self.store.update_device(device).await?;
        self.cache
            .write()
            .unwrap()
            .devices
            .insert(updated.id, updated.clone());
        self.device_events.publish(DeviceEvent::Updated(updated.clone()));
        Ok(updated)
    }

    async fn delete_device(&mut self, id: i64) -> Result<(), EntityError> {
        let removed = self.store.delete_device(id).await?;
        if removed == 0 {
            return Err(EntityError::NotFound { kind: "device", id });
        }
        self.cache.write().unwrap().devices.remove(&id);
        self.device_events.publish(DeviceEvent::Deleted(id));
        Ok(())
    }

    async fn deactivate_device(&mut self, id: i64) -> Result<Device, EntityError> {
        let mut device = self.get_device(id)?;
        device.status = DeviceStatus::Inactive;
        let updated = self.store.update_device(device).await?;
        self.cache
            .write()
            .unwrap()
            .devices
            .insert(updated.id, updated.clone());
        self.device_events.publish(DeviceEvent::Updated(updated.clone()));
        info!("deactivate_device - device {} is now inactive", id);
        Ok(updated)
    }

    async fn activate_device(&mut self, id: i64, polling_interval_seconds: Option<i64>) {
        let mut device = match self.get_device(id) {
            Ok(device) => device,
            Err(_) => {
                warn!("activate_device - unknown device {}", id);
                return;
            }
        };
        if let Some(interval) = polling_interval_seconds {
            if interval >= MIN_POLLING_INTERVAL_SECS {
                device.polling_interval_seconds = interval;
            } else {
                warn!(
                    "activate_device - ignoring polling interval {} for device {}",
                    interval, id
                );
            }
        }
        device.status = DeviceStatus::Active;
        match self.store.update_device(device).await {
            Ok(updated) => {
                self.cache
                    .write()
                    .unwrap()
                    .devices
                    .insert(updated.id, updated.clone());
                self.device_events.publish(DeviceEvent::Updated(updated));
                info!("activate_device - device {} is now active", id);
            }
            Err(e) => error!("activate_device - update for device {} failed: {}", id, e),
        }
    }

    /// Partitions the requested ids by `should_ping`. Unknown and
    /// non-active ids are silently dropped, which is also what cleans stale
    /// deadline entries out of the scheduler's queue.
    fn get_batch(&self, ids: &[i64]) -> DeviceBatch {
        let cache = self.cache.read().unwrap();
        let mut batch = DeviceBatch::default();
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(*id) {
                continue;
            }
            if let Some(device) = cache.devices.get(id) {
                if device.status != DeviceStatus::Active {
                    continue;
                }
                if device.should_ping {
                    batch.to_ping.push(device.clone());
                } else {
                    batch.to_skip.push(device.clone());
                }
            }
        }
        batch
    }

    fn endpoint_in_cache(&self, ip_address: &str, port: i32, exclude: Option<i64>) -> bool {
        self.cache.read().unwrap().devices.values().any(|d| {
            d.ip_address == ip_address && d.port == port && exclude.map_or(true, |id| d.id != id)
        })
    }

    // ---- credential profiles ----

    fn list_credentials(&self) -> Vec<CredentialProfile> {
        let cache = self.cache.read().unwrap();
        let mut profiles: Vec<CredentialProfile> = cache.credentials.values().cloned().collect();
        profiles.sort_by_key(|p| p.id);
        profiles
    }

    fn get_credential(&self, id: i64) -> Result<CredentialProfile, EntityError> {
        self.cache
            .read()
            .unwrap()
            .credentials
            .get(&id)
            .cloned()
            .ok_or(EntityError::NotFound {
                kind: "credential profile",
                id,
            })
    }

    async fn create_credential(
        &mut self,
        new: NewCredentialProfile,
    ) -> Result<CredentialProfile, EntityError> {
        if new.name.trim().is_empty() {
            return Err(EntityError::Invalid("name must not be empty".to_string()));
        }
        let profile = self.store.insert_credential_profile(new).await?;
        self.cache
            .write()
            .unwrap()
            .credentials
            .insert(profile.id, profile.clone());
        self.credential_events
            .publish(CredentialEvent::Created(profile.clone()));
        Ok(profile)
    }

    async fn update_credential(
        &mut self,
        id: i64,
        changes: CredentialProfileChanges,
    ) -> Result<CredentialProfile, EntityError> {
        let mut profile = self.get_credential(id)?;
        if let Some(name) = changes.name {
            if name.trim().is_empty() {
                return Err(EntityError::Invalid("name must not be empty".to_string()));
            }
            profile.name = name;
        }
        if let Some(payload) = changes.payload {
            profile.payload = payload;
        }
        let updated = self.store.update_credential_profile(profile).await?;
        self.cache
            .write()
            .unwrap()
            .credentials
            .insert(updated.id, updated.clone());
        self.credential_events
            .publish(CredentialEvent::Updated(updated.clone()));
        Ok(updated)
    }

    async fn delete_credential(&mut self, id: i64) -> Result<(), EntityError> {
        let removed = self.store.delete_credential_profile(id).await?;
        if removed == 0 {
            return Err(EntityError::NotFound {
                kind: "credential profile",
                id,
            });
        }
        self.cache.write().unwrap().credentials.remove(&id);
        self.credential_events.publish(CredentialEvent::Deleted(id));
        Ok(())
    }

    // ---- discovery profiles ----

    async fn get_discovery_profile(&mut self, id: i64) -> Result<DiscoveryProfile, EntityError> {
        self.store
            .get_discovery_profile(id)
            .await?
            .ok_or(EntityError::NotFound {
                kind: "discovery profile",
                id,
            })
    }

    async fn create_discovery_profile(
        &mut self,
        new: NewDiscoveryProfile,
    ) -> Result<DiscoveryProfile, EntityError> {
        if !self
            .cache
            .read()
            .unwrap()
            .credentials
            .contains_key(&new.credential_profile_id)
        {
            return Err(EntityError::NotFound {
                kind: "credential profile",
                id: new.credential_profile_id,
            });
        }
        let profile = self.store.insert_discovery_profile(new).await?;
        self.profile_events
            .publish(DiscoveryProfileEvent::Created(profile.clone()));
        Ok(profile)
    }

    async fn update_discovery_profile(
        &mut self,
        id: i64,
        changes: DiscoveryProfileChanges,
    ) -> Result<DiscoveryProfile, EntityError> {
        let mut profile = self.get_discovery_profile(id).await?;
        if let Some(name) = changes.name {
            profile.name = name;
        }
        if let Some(target) = changes.target {
            profile.target = target;
        }
        if let Some(port) = changes.port {
            profile.port = port;
        }
        if let Some(credential_id) = changes.credential_profile_id {
            if !self
                .cache
                .read()
                .unwrap()
                .credentials
                .contains_key(&credential_id)
            {
                return Err(EntityError::NotFound {
                    kind: "credential profile",
                    id: credential_id,
                });
            }
            profile.credential_profile_id = credential_id;
        }
        if let Some(auto_provision) = changes.auto_provision {
            profile.auto_provision = auto_provision;
        }
        let updated = self.store.update_discovery_profile(profile).await?;
        self.profile_events
            .publish(DiscoveryProfileEvent::Updated(updated.clone()));
        Ok(updated)
    }

    /// Deleting a profile never cascades into the devices it discovered.
    async fn delete_discovery_profile(&mut self, id: i64) -> Result<(), EntityError> {
        let removed = self.store.delete_discovery_profile(id).await?;
        if removed == 0 {
            return Err(EntityError::NotFound {
                kind: "discovery profile",
                id,
            });
        }
        self.profile_events.publish(DiscoveryProfileEvent::Deleted(id));
        Ok(())
    }

    // ---- events ----

    async fn trigger_discovery(&mut self, profile_id: i64) {
        let profile = match self.store.get_discovery_profile(profile_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                warn!("trigger_discovery - unknown discovery profile {}", profile_id);
                return;
            }
            Err(e) => {
                error!(
                    "trigger_discovery - lookup for profile {} failed: {}",
                    profile_id, e
                );
                return;
            }
        };
        let credential = self
            .cache
            .read()
            .unwrap()
            .credentials
            .get(&profile.credential_profile_id)
            .cloned();
        let Some(credential) = credential else {
            warn!(
                "trigger_discovery - credential profile {} for profile {} missing",
                profile.credential_profile_id, profile_id
            );
            return;
        };
        trace!("trigger_discovery - dispatching scan for profile {}", profile_id);
        publish_or_drop(
            "run-discovery",
            &self.run_discovery,
            RunDiscovery { profile, credential },
        );
    }

    /// Provisions one discovery result. The device starts out `active` only
    /// when the originating profile has auto-provision set, and only then is
    /// a create event fanned out to the scheduler.
    async fn provision(&mut self, result: DiscoveredDevice) {
        if self.endpoint_in_cache(&result.target, result.port, None) {
            trace!(
                "provision - {}:{} already managed, skipping",
                result.target,
                result.port
            );
            return;
        }
        match self
            .store
            .find_device_by_endpoint(result.target.clone(), result.port)
            .await
        {
            Ok(Some(existing)) => {
                warn!(
                    "provision - device {} was missing from the cache, restoring",
                    existing.id
                );
                self.cache
                    .write()
                    .unwrap()
                    .devices
                    .insert(existing.id, existing);
                return;
            }
            Ok(None) => {}
            Err(e) => {
                error!("provision - endpoint lookup failed: {}", e);
                return;
            }
        }
        let protocol = self
            .cache
            .read()
            .unwrap()
            .credentials
            .get(&result.credential_profile_id)
            .map(|c| c.protocol.clone());
        let Some(protocol) = protocol else {
            warn!(
                "provision - credential profile {} unknown, dropping result for {}",
                result.credential_profile_id, result.target
            );
            return;
        };
        // A vanished profile never auto-activates.
        let status = match self.store.get_discovery_profile(result.discovery_profile_id).await {
            Ok(Some(profile)) if profile.auto_provision => DeviceStatus::Active,
            Ok(_) => DeviceStatus::Discovered,
            Err(e) => {
                error!("provision - discovery profile lookup failed: {}", e);
                return;
            }
        };
        let draft = DeviceDraft {
            hostname: Some(result.hostname),
            ip_address: result.target,
            plugin_id: protocol,
            port: result.port,
            credential_profile_id: result.credential_profile_id,
            discovery_profile_id: Some(result.discovery_profile_id),
            polling_interval_seconds: DEFAULT_POLLING_INTERVAL_SECS,
            should_ping: true,
            status,
        };
        match self.store.insert_device(draft).await {
            Ok(device) => {
                self.cache
                    .write()
                    .unwrap()
                    .devices
                    .insert(device.id, device.clone());
                info!(
                    "provision - device {} provisioned at {}:{} ({})",
                    device.id, device.ip_address, device.port, device.status
                );
                if device.status == DeviceStatus::Active {
                    self.device_events.publish(DeviceEvent::Created(device));
                }
            }
            Err(e) => error!("provision - insert failed: {}", e),
        }
    }
}
