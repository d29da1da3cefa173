use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use nms_shared::bus::EntityError;
use nms_shared::entity::{
    CredentialProfile, Device, DeviceStatus, DiscoveryProfile, NewCredentialProfile,
    NewDiscoveryProfile,
};
use sqlx::PgPool;

/// A fully resolved device row, ready for insertion. Built by the entity
/// service after protocol resolution and validation, whether the device
/// comes from the API or from discovery provisioning.
#[derive(Debug, Clone)]
pub struct DeviceDraft {
    pub hostname: Option<String>,
    pub ip_address: String,
    pub plugin_id: String,
    pub port: i32,
    pub credential_profile_id: i64,
    pub discovery_profile_id: Option<i64>,
    pub polling_interval_seconds: i64,
    pub should_ping: bool,
    pub status: DeviceStatus,
}

/// Everything the entity service asks of the database. Kept behind a trait
/// so cache and event semantics are tested against a mock store.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn load_devices(&self) -> Result<Vec<Device>, EntityError>;
    async fn load_credential_profiles(&self) -> Result<Vec<CredentialProfile>, EntityError>;

    async fn insert_device(&self, draft: DeviceDraft) -> Result<Device, EntityError>;
    async fn update_device(&self, device: Device) -> Result<Device, EntityError>;
    async fn delete_device(&self, id: i64) -> Result<u64, EntityError>;
    async fn find_device_by_endpoint(
        &self,
        ip_address: String,
        port: i32,
    ) -> Result<Option<Device>, EntityError>;

    async fn insert_credential_profile(
        &self,
        new: NewCredentialProfile,
    ) -> Result<CredentialProfile, EntityError>;
    async fn update_credential_profile(
        &self,
        profile: CredentialProfile,
    ) -> Result<CredentialProfile, EntityError>;
    async fn delete_credential_profile(&self, id: i64) -> Result<u64, EntityError>;

    async fn list_discovery_profiles(&self) -> Result<Vec<DiscoveryProfile>, EntityError>;
    async fn get_discovery_profile(&self, id: i64) -> Result<Option<DiscoveryProfile>, EntityError>;
    async fn insert_discovery_profile(
        &self,
        new: NewDiscoveryProfile,
    ) -> Result<DiscoveryProfile, EntityError>;
    async fn update_discovery_profile(
        &self,
        profile: DiscoveryProfile,
    ) -> Result<DiscoveryProfile, EntityError>;
    async fn delete_discovery_profile(&self, id: i64) -> Result<u64, EntityError>;
}

pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    pub fn new(pool: PgPool) -> Self {
        PgEntityStore { pool }
    }
}

/// Unique violations become `Duplicate`, foreign-key violations `Invalid`;
/// everything else surfaces as a database error.
fn map_write_error(e: sqlx::Error, ip_address: &str, port: i32) -> EntityError {
    if let sqlx::Error::Database(db) = &e {
        match db.code().as_deref() {
            Some("23505") => {
                return EntityError::Duplicate {
                    ip: ip_address.to_string(),
                    port,
                }
            }
            Some("23503") => {
                return EntityError::Invalid(
                    "operation violates a reference to another entity".to_string(),
                )
            }
            _ => {}
        }
    }
    EntityError::Database(e)
}

fn map_ref_error(e: sqlx::Error) -> EntityError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some("23503") {
            return EntityError::Invalid("entity is still referenced".to_string());
        }
    }
    EntityError::Database(e)
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn load_devices(&self) -> Result<Vec<Device>, EntityError> {
        Ok(sqlx::query_as::<_, Device>("SELECT * FROM devices ORDER BY id")
            .fetch_all(&self.pool)
            .await?)
    }

    async fn load_credential_profiles(&self) -> Result<Vec<CredentialProfile>, EntityError> {
        Ok(
            sqlx::query_as::<_, CredentialProfile>("SELECT * FROM credential_profiles ORDER BY id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn insert_device(&self, draft: DeviceDraft) -> Result<Device, EntityError> {
        sqlx::query_as::<_, Device>(
            r#"
            INSERT INTO devices
                (hostname, ip_address, plugin_id, port, credential_profile_id,
                 discovery_profile_id, polling_interval_seconds, should_ping, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(&draft.hostname)
        .bind(&draft.ip_address)
        .bind(&draft.plugin_id)
        .bind(draft.port)
        .bind(draft.credential_profile_id)
        .bind(draft.discovery_profile_id)
        .bind(draft.polling_interval_seconds)
        .bind(draft.should_ping)
        .bind(draft.status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_write_error(e, &draft.ip_address, draft.port))
    }

    async fn update_device(&self, device: Device) -> Result<Device, EntityError> {
        sqlx::query_as::<_, Device>(
            r#"
            UPDATE devices
            SET hostname = $2, ip_address = $3, port = $4,
                polling_interval_seconds = $5, should_ping = $6, status = $7,
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(device.id)
        .bind(&device.hostname)
        .bind(&device.ip_address)
        .bind(device.port)
        .bind(device.polling_interval_seconds)
        .bind(device.should_ping)
        .bind(device.status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_write_error(e, &device.ip_address, device.port))
    }

    async fn delete_device(&self, id: i64) -> Result<u64, EntityError> {
        let result = sqlx::query("DELETE FROM devices WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn find_device_by_endpoint(
        &self,
        ip_address: String,
        port: i32,
    ) -> Result<Option<Device>, EntityError> {
        Ok(
            sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE ip_address = $1 AND port = $2")
                .bind(ip_address)
                .bind(port)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn insert_credential_profile(
        &self,
        new: NewCredentialProfile,
    ) -> Result<CredentialProfile, EntityError> {
        Ok(sqlx::query_as::<_, CredentialProfile>(
            r#"
            INSERT INTO credential_profiles (name, protocol, payload)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(&new.name)
        .bind(&new.protocol)
        .bind(&new.payload)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn update_credential_profile(
        &self,
        profile: CredentialProfile,
    ) -> Result<CredentialProfile, EntityError> {
        Ok(sqlx::query_as::<_, CredentialProfile>(
            r#"
            UPDATE credential_profiles
            SET name = $2, payload = $3, updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(profile.id)
        .bind(&profile.name)
        .bind(&profile.payload)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn delete_credential_profile(&self, id: i64) -> Result<u64, EntityError> {
        let result = sqlx::query("DELETE FROM credential_profiles WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_ref_error)?;
        Ok(result.rows_affected())
    }

    async fn list_discovery_profiles(&self) -> Result<Vec<DiscoveryProfile>, EntityError> {
        Ok(
            sqlx::query_as::<_, DiscoveryProfile>("SELECT * FROM discovery_profiles ORDER BY id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn get_discovery_profile(&self, id: i64) -> Result<Option<DiscoveryProfile>, EntityError> {
        Ok(
            sqlx::query_as::<_, DiscoveryProfile>("SELECT * FROM discovery_profiles WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn insert_discovery_profile(
        &self,
        new: NewDiscoveryProfile,
    ) -> Result<DiscoveryProfile, EntityError> {
        sqlx::query_as::<_, DiscoveryProfile>(
            r#"
            INSERT INTO discovery_profiles (name, target, port, credential_profile_id, auto_provision)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(&new.name)
        .bind(&new.target)
        .bind(new.port)
        .bind(new.credential_profile_id)
        .bind(new.auto_provision)
        .fetch_one(&self.pool)
        .await
        .map_err(map_ref_error)
    }

    async fn update_discovery_profile(
        &self,
        profile: DiscoveryProfile,
    ) -> Result<DiscoveryProfile, EntityError> {
        sqlx::query_as::<_, DiscoveryProfile>(
            r#"
            UPDATE discovery_profiles
            SET name = $2, target = $3, port = $4, credential_profile_id = $5,
                auto_provision = $6, updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(profile.id)
        .bind(&profile.name)
        .bind(&profile.target)
        .bind(profile.port)
        .bind(profile.credential_profile_id)
        .bind(profile.auto_provision)
        .fetch_one(&self.pool)
        .await
        .map_err(map_ref_error)
    }

    async fn delete_discovery_profile(&self, id: i64) -> Result<u64, EntityError> {
        let result = sqlx::query("DELETE FROM discovery_profiles WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
