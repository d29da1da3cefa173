use log::info;
use sqlx::PgPool;

/// Idempotent DDL, applied at startup. `discovery_profile_id` on devices and
/// `device_id` on metrics deliberately carry no foreign key: deleting a
/// discovery profile must not cascade into discovered devices, and deleting
/// a device must not touch its historical samples.
const DDL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS credential_profiles (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        protocol TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS discovery_profiles (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        target TEXT NOT NULL,
        port INT NOT NULL,
        credential_profile_id BIGINT NOT NULL REFERENCES credential_profiles (id),
        auto_provision BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS devices (
        id BIGSERIAL PRIMARY KEY,
        hostname TEXT,
        ip_address TEXT NOT NULL,
        plugin_id TEXT NOT NULL,
        port INT NOT NULL,
        credential_profile_id BIGINT NOT NULL REFERENCES credential_profiles (id),
        discovery_profile_id BIGINT,
        polling_interval_seconds BIGINT NOT NULL DEFAULT 60,
        should_ping BOOLEAN NOT NULL DEFAULT TRUE,
        status TEXT NOT NULL DEFAULT 'discovered',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (ip_address, port)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS metrics (
        id BIGSERIAL PRIMARY KEY,
        device_id BIGINT NOT NULL,
        data JSONB NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS metrics_device_time_idx
        ON metrics (device_id, timestamp DESC)
    "#,
];

pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in DDL {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("ensure_schema - schema is up to date");
    Ok(())
}
