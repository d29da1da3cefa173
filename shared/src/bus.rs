use crate::entity::{
    CredentialProfile, CredentialProfileChanges, Device, DeviceChanges, DiscoveryProfile,
    DiscoveryProfileChanges, NewCredentialProfile, NewDevice, NewDiscoveryProfile,
};
use chrono::{DateTime, Utc};
use log::warn;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Capacity for high-volume data channels (poll result batches).
pub const DATA_CHANNEL_CAPACITY: usize = 1000;
/// Capacity for standard event and request channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;
/// Capacity for control channels and the scheduler-to-poller dispatch.
pub const DISPATCH_CHANNEL_CAPACITY: usize = 50;

/// Errors surfaced to entity-service callers over reply channels.
#[derive(Error, Debug)]
pub enum EntityError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },
    #[error("{0}")]
    Invalid(String),
    #[error("{0} cannot change after creation")]
    Immutable(&'static str),
    #[error("a device already exists at {ip}:{port}")]
    Duplicate { ip: String, port: i32 },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("entity service unavailable")]
    Unavailable,
}

/// Single-slot reply channel carried inside every request variant. Replies
/// never block the responder because the slot is always free when the
/// request is handled.
pub type Reply<T> = oneshot::Sender<Result<T, EntityError>>;

/// Device lifecycle events fanned out after each committed mutation.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Created(Device),
    Updated(Device),
    Deleted(i64),
}

#[derive(Debug, Clone)]
pub enum CredentialEvent {
    Created(CredentialProfile),
    Updated(CredentialProfile),
    Deleted(i64),
}

#[derive(Debug, Clone)]
pub enum DiscoveryProfileEvent {
    Created(DiscoveryProfile),
    Updated(DiscoveryProfile),
    Deleted(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Ping,
    Poll,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Ping => "ping",
            FailureReason::Poll => "poll",
        }
    }
}

/// One observed failure for one device, consumed by the health monitor.
#[derive(Debug, Clone)]
pub struct DeviceFailure {
    pub device_id: i64,
    pub at: DateTime<Utc>,
    pub reason: FailureReason,
}

/// Instruction to the discovery service to run one scan. The credential is
/// attached by the entity service so the discovery service never has to look
/// it up itself.
#[derive(Debug, Clone)]
pub struct RunDiscovery {
    pub profile: DiscoveryProfile,
    pub credential: CredentialProfile,
}

/// An enriched discovery result, ready for provisioning.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub target: String,
    pub port: i32,
    pub hostname: String,
    pub discovery_profile_id: i64,
    pub credential_profile_id: i64,
}

/// Fire-and-forget operations consumed by the entity service alongside CRUD
/// requests and discovery results.
#[derive(Debug)]
pub enum ControlEvent {
    TriggerDiscovery {
        profile_id: i64,
    },
    ActivateDevice {
        device_id: i64,
        polling_interval_seconds: Option<i64>,
    },
}

/// `GetBatch` response: the requested ids partitioned by `should_ping`.
/// Unknown and non-active ids are silently dropped.
#[derive(Debug, Default)]
pub struct DeviceBatch {
    pub to_ping: Vec<Device>,
    pub to_skip: Vec<Device>,
}

#[derive(Debug)]
pub enum CredentialCommand {
    List { reply: Reply<Vec<CredentialProfile>> },
    Get { id: i64, reply: Reply<CredentialProfile> },
    Create { new: NewCredentialProfile, reply: Reply<CredentialProfile> },
    Update { id: i64, changes: CredentialProfileChanges, reply: Reply<CredentialProfile> },
    Delete { id: i64, reply: Reply<()> },
}

#[derive(Debug)]
pub enum DeviceCommand {
    List { reply: Reply<Vec<Device>> },
    Get { id: i64, reply: Reply<Device> },
    Create { new: NewDevice, reply: Reply<Device> },
    Update { id: i64, changes: DeviceChanges, reply: Reply<Device> },
    Delete { id: i64, reply: Reply<()> },
}

#[derive(Debug)]
pub enum DiscoveryProfileCommand {
    List { reply: Reply<Vec<DiscoveryProfile>> },
    Get { id: i64, reply: Reply<DiscoveryProfile> },
    Create { new: NewDiscoveryProfile, reply: Reply<DiscoveryProfile> },
    Update { id: i64, changes: DiscoveryProfileChanges, reply: Reply<DiscoveryProfile> },
    Delete { id: i64, reply: Reply<()> },
}

/// Point-to-point requests answered by the entity service. Every variant
/// carries its own reply slot; the compiler keeps the router exhaustive.
#[derive(Debug)]
pub enum EntityRequest {
    Credential(CredentialCommand),
    Device(DeviceCommand),
    DiscoveryProfile(DiscoveryProfileCommand),
    GetBatch {
        ids: Vec<i64>,
        reply: oneshot::Sender<DeviceBatch>,
    },
    GetCredential {
        id: i64,
        reply: Reply<CredentialProfile>,
    },
    DeactivateDevice {
        id: i64,
        reply: Reply<Device>,
    },
}

/// Sends `message` without waiting. A full or closed channel drops the
/// message with a warning; consumers reconcile through their next lookup.
pub fn publish_or_drop<T>(channel: &str, tx: &mpsc::Sender<T>, message: T) {
    match tx.try_send(message) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("publish_or_drop - {} channel full, event dropped", channel);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            warn!("publish_or_drop - {} channel closed, event dropped", channel);
        }
    }
}

/// One named topic with any number of subscribers. Publication clones the
/// event per subscriber and never blocks; a topic without subscribers is a
/// no-op, which is how optional topics (credential events) stay pluggable.
pub struct Topic<T: Clone> {
    name: &'static str,
    subscribers: Vec<mpsc::Sender<T>>,
}

impl<T: Clone> Topic<T> {
    pub fn new(name: &'static str) -> Self {
        Topic {
            name,
            subscribers: Vec::new(),
        }
    }

    /// Registers a new subscriber and returns its receiving end. Must be
    /// called during wiring, before the owning service starts publishing.
    pub fn subscribe(&mut self, capacity: usize) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(capacity);
        self.subscribers.push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn publish(&self, event: T) {
        for subscriber in &self.subscribers {
            publish_or_drop(self.name, subscriber, event.clone());
        }
    }
}

/// Typed client for the entity service, cloned into every component that
/// issues requests (API layer, scheduler, poller, health monitor).
#[derive(Clone)]
pub struct EntityHandle {
    requests: mpsc::Sender<EntityRequest>,
    control: mpsc::Sender<ControlEvent>,
}

impl EntityHandle {
    pub fn new(requests: mpsc::Sender<EntityRequest>, control: mpsc::Sender<ControlEvent>) -> Self {
        EntityHandle { requests, control }
    }

    async fn roundtrip<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> EntityRequest,
    ) -> Result<T, EntityError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .await
            .map_err(|_| EntityError::Unavailable)?;
        rx.await.map_err(|_| EntityError::Unavailable)?
    }

    pub async fn get_batch(&self, ids: Vec<i64>) -> Result<DeviceBatch, EntityError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(EntityRequest::GetBatch { ids, reply: tx })
            .await
            .map_err(|_| EntityError::Unavailable)?;
        rx.await.map_err(|_| EntityError::Unavailable)
    }

    pub async fn get_credential(&self, id: i64) -> Result<CredentialProfile, EntityError> {
        self.roundtrip(|reply| EntityRequest::GetCredential { id, reply })
            .await
    }

    pub async fn deactivate_device(&self, id: i64) -> Result<Device, EntityError> {
        self.roundtrip(|reply| EntityRequest::DeactivateDevice { id, reply })
            .await
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>, EntityError> {
        self.roundtrip(|reply| EntityRequest::Device(DeviceCommand::List { reply }))
            .await
    }

    pub async fn get_device(&self, id: i64) -> Result<Device, EntityError> {
        self.roundtrip(|reply| EntityRequest::Device(DeviceCommand::Get { id, reply }))
            .await
    }

    pub async fn create_device(&self, new: NewDevice) -> Result<Device, EntityError> {
        self.roundtrip(|reply| EntityRequest::Device(DeviceCommand::Create { new, reply }))
            .await
    }

    pub async fn update_device(&self, id: i64, changes: DeviceChanges) -> Result<Device, EntityError> {
        self.roundtrip(|reply| EntityRequest::Device(DeviceCommand::Update { id, changes, reply }))
            .await
    }

    pub async fn delete_device(&self, id: i64) -> Result<(), EntityError> {
        self.roundtrip(|reply| EntityRequest::Device(DeviceCommand::Delete { id, reply }))
            .await
    }

    pub async fn list_credential_profiles(&self) -> Result<Vec<CredentialProfile>, EntityError> {
        self.roundtrip(|reply| EntityRequest::Credential(CredentialCommand::List { reply }))
            .await
    }

    pub async fn get_credential_profile(&self, id: i64) -> Result<CredentialProfile, EntityError> {
        self.roundtrip(|reply| EntityRequest::Credential(CredentialCommand::Get { id, reply }))
            .await
    }

    pub async fn create_credential_profile(
        &self,
        new: NewCredentialProfile,
    ) -> Result<CredentialProfile, EntityError> {
        self.roundtrip(|reply| EntityRequest::Credential(CredentialCommand::Create { new, reply }))
            .await
    }

    pub async fn update_credential_profile(
        &self,
        id: i64,
        changes: CredentialProfileChanges,
    ) -> Result<CredentialProfile, EntityError> {
        self.roundtrip(|reply| {
            EntityRequest::Credential(CredentialCommand::Update { id, changes, reply })
        })
        .await
    }

    pub async fn delete_credential_profile(&self, id: i64) -> Result<(), EntityError> {
        self.roundtrip(|reply| EntityRequest::Credential(CredentialCommand::Delete { id, reply }))
            .await
    }

    pub async fn list_discovery_profiles(&self) -> Result<Vec<DiscoveryProfile>, EntityError> {
        self.roundtrip(|reply| EntityRequest::DiscoveryProfile(DiscoveryProfileCommand::List { reply }))
            .await
    }

    pub async fn get_discovery_profile(&self, id: i64) -> Result<DiscoveryProfile, EntityError> {
        self.roundtrip(|reply| {
            EntityRequest::DiscoveryProfile(DiscoveryProfileCommand::Get { id, reply })
        })
        .await
    }

    pub async fn create_discovery_profile(
        &self,
        new: NewDiscoveryProfile,
    ) -> Result<DiscoveryProfile, EntityError> {
        self.roundtrip(|reply| {
            EntityRequest::DiscoveryProfile(DiscoveryProfileCommand::Create { new, reply })
        })
        .await
    }

    pub async fn update_discovery_profile(
        &self,
        id: i64,
        changes: DiscoveryProfileChanges,
    ) -> Result<DiscoveryProfile, EntityError> {
        self.roundtrip(|reply| {
            EntityRequest::DiscoveryProfile(DiscoveryProfileCommand::Update { id, changes, reply })
        })
        .await
    }

    pub async fn delete_discovery_profile(&self, id: i64) -> Result<(), EntityError> {
        self.roundtrip(|reply| {
            EntityRequest::DiscoveryProfile(DiscoveryProfileCommand::Delete { id, reply })
        })
        .await
    }

    /// Emits `TriggerDiscovery`. Non-blocking: a full control channel drops
    /// the event with a warning.
    pub fn trigger_discovery(&self, profile_id: i64) {
        publish_or_drop(
            "control",
            &self.control,
            ControlEvent::TriggerDiscovery { profile_id },
        );
    }

    /// Emits `ActivateDevice`, optionally overriding the polling interval.
    pub fn activate_device(&self, device_id: i64, polling_interval_seconds: Option<i64>) {
        publish_or_drop(
            "control",
            &self.control,
            ControlEvent::ActivateDevice {
                device_id,
                polling_interval_seconds,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_or_drop_delivers_when_buffered() {
        let (tx, mut rx) = mpsc::channel(2);
        publish_or_drop("test", &tx, 1u32);
        publish_or_drop("test", &tx, 2u32);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_publish_or_drop_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        publish_or_drop("test", &tx, 1u32);
        // Buffer is full; this one must be dropped, not block.
        publish_or_drop("test", &tx, 2u32);
        assert_eq!(rx.recv().await, Some(1));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_or_drop_ignores_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        publish_or_drop("test", &tx, 1u32);
    }

    #[tokio::test]
    async fn test_topic_fans_out_to_all_subscribers() {
        let mut topic: Topic<u32> = Topic::new("numbers");
        let mut first = topic.subscribe(4);
        let mut second = topic.subscribe(4);
        topic.publish(42);
        assert_eq!(first.recv().await, Some(42));
        assert_eq!(second.recv().await, Some(42));
    }

    #[tokio::test]
    async fn test_topic_without_subscribers_is_noop() {
        let topic: Topic<u32> = Topic::new("unwired");
        assert_eq!(topic.subscriber_count(), 0);
        topic.publish(7);
    }

    #[tokio::test]
    async fn test_topic_full_subscriber_does_not_block_others() {
        let mut topic: Topic<u32> = Topic::new("numbers");
        let mut clogged = topic.subscribe(1);
        let mut healthy = topic.subscribe(4);
        topic.publish(1);
        topic.publish(2);
        // The clogged subscriber only saw the first event.
        assert_eq!(clogged.recv().await, Some(1));
        assert!(clogged.try_recv().is_err());
        // The healthy subscriber saw both.
        assert_eq!(healthy.recv().await, Some(1));
        assert_eq!(healthy.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_entity_handle_roundtrip() {
        let (req_tx, mut req_rx) = mpsc::channel(4);
        let (ctl_tx, _ctl_rx) = mpsc::channel(4);
        let handle = EntityHandle::new(req_tx, ctl_tx);

        tokio::spawn(async move {
            while let Some(request) = req_rx.recv().await {
                match request {
                    EntityRequest::GetCredential { id, reply } => {
                        let _ = reply.send(Err(EntityError::NotFound {
                            kind: "credential profile",
                            id,
                        }));
                    }
                    EntityRequest::GetBatch { reply, .. } => {
                        let _ = reply.send(DeviceBatch::default());
                    }
                    _ => panic!("unexpected request"),
                }
            }
        });

        match handle.get_credential(9).await {
            Err(EntityError::NotFound { id: 9, .. }) => {}
            other => panic!("unexpected reply: {:?}", other.map(|p| p.id)),
        }
        let batch = handle.get_batch(vec![1, 2, 3]).await.unwrap();
        assert!(batch.to_ping.is_empty());
        assert!(batch.to_skip.is_empty());
    }

    #[tokio::test]
    async fn test_entity_handle_unavailable_when_service_gone() {
        let (req_tx, req_rx) = mpsc::channel(4);
        let (ctl_tx, _ctl_rx) = mpsc::channel(4);
        drop(req_rx);
        let handle = EntityHandle::new(req_tx, ctl_tx);
        assert!(matches!(
            handle.get_credential(1).await,
            Err(EntityError::Unavailable)
        ));
    }
}
