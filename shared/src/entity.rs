use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Default polling interval applied when a device is created without one.
pub const DEFAULT_POLLING_INTERVAL_SECS: i64 = 60;
/// Smallest polling interval a device may be configured with.
pub const MIN_POLLING_INTERVAL_SECS: i64 = 1;

/// Lifecycle state of a managed device.
///
/// Only `Active` devices are eligible for scheduling. `Discovered` devices
/// are known but idle; `Inactive` devices have been administratively (or
/// automatically) disabled but remain in the cache and the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Discovered,
    Active,
    Inactive,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Discovered => "discovered",
            DeviceStatus::Active => "active",
            DeviceStatus::Inactive => "inactive",
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("unknown device status {0:?}")]
pub struct InvalidStatus(String);

impl TryFrom<String> for DeviceStatus {
    type Error = InvalidStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "discovered" => Ok(DeviceStatus::Discovered),
            "active" => Ok(DeviceStatus::Active),
            "inactive" => Ok(DeviceStatus::Inactive),
            _ => Err(InvalidStatus(value)),
        }
    }
}

/// A managed network endpoint.
///
/// `credential_profile_id` and `discovery_profile_id` are fixed at creation
/// time; updates that attempt to change them are rejected. The pair
/// `(ip_address, port)` is unique across all non-deleted devices.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: i64,
    pub hostname: Option<String>,
    pub ip_address: String,
    /// Protocol tag selecting the plugin binary used to poll this device.
    pub plugin_id: String,
    pub port: i32,
    pub credential_profile_id: i64,
    pub discovery_profile_id: Option<i64>,
    pub polling_interval_seconds: i64,
    pub should_ping: bool,
    #[sqlx(try_from = "String")]
    pub status: DeviceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An opaque, protocol-specific secret.
///
/// `payload` holds the symmetrically encrypted credential blob. It is never
/// exposed through serialization; API responses carry a mask instead.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CredentialProfile {
    pub id: i64,
    pub name: String,
    /// Protocol tag shared with the devices this profile unlocks.
    pub protocol: String,
    #[serde(serialize_with = "mask_payload")]
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn mask_payload<S: Serializer>(_payload: &str, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str("********")
}

/// A scan specification: which targets to probe, on which port, with which
/// credential, and whether found devices start out `active`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DiscoveryProfile {
    pub id: i64,
    pub name: String,
    /// Single IP, CIDR block, or "start-end" range (end may be a full
    /// address or a final octet).
    pub target: String,
    pub port: i32,
    pub credential_profile_id: i64,
    pub auto_provision: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCredentialProfile {
    pub name: String,
    pub protocol: String,
    /// Already-encrypted payload; encryption happens at the API boundary.
    pub payload: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialProfileChanges {
    pub name: Option<String>,
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewDevice {
    #[serde(default)]
    pub hostname: Option<String>,
    pub ip_address: String,
    pub port: i32,
    pub credential_profile_id: i64,
    #[serde(default)]
    pub discovery_profile_id: Option<i64>,
    #[serde(default)]
    pub polling_interval_seconds: Option<i64>,
    #[serde(default)]
    pub should_ping: Option<bool>,
    #[serde(default)]
    pub status: Option<DeviceStatus>,
}

/// Partial device update. `None` fields are left untouched. The two profile
/// id fields are present only so a change attempt can be detected and
/// rejected.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceChanges {
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    pub port: Option<i32>,
    pub polling_interval_seconds: Option<i64>,
    pub should_ping: Option<bool>,
    pub status: Option<DeviceStatus>,
    pub credential_profile_id: Option<i64>,
    pub discovery_profile_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewDiscoveryProfile {
    pub name: String,
    pub target: String,
    pub port: i32,
    pub credential_profile_id: i64,
    #[serde(default)]
    pub auto_provision: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoveryProfileChanges {
    pub name: Option<String>,
    pub target: Option<String>,
    pub port: Option<i32>,
    pub credential_profile_id: Option<i64>,
    pub auto_provision: Option<bool>,
}
