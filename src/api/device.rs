//! Device API — registered-device directory, telemetry history, and
//! command dispatch.
//!
//! Reads go through an injected [`DeviceDirectory`] (Postgres in
//! production, an in-memory fake in tests); commands go out over the shared
//! device WebSocket channel wrapped in the command envelope. Missing
//! directory or authentication degrades to empty results with a warning
//! rather than an error: dashboards are frequently previewed logged-out.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use crate::api::ws::DeviceChannel;
use crate::wire;

/// Default number of readings returned by history queries.
pub const DEFAULT_READING_LIMIT: i64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("database error: {0}")]
    Backend(#[from] sqlx::Error),
}

/// A device registered to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub online: bool,
    /// Milliseconds since the Unix epoch, if the device ever reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
}

/// One stored telemetry reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceReading {
    pub device_id: String,
    pub payload: Value,
    /// Milliseconds since the Unix epoch.
    pub recorded_at: i64,
}

// =============================================================================
// DIRECTORY TRAIT
// =============================================================================

/// Backing store for the device directory and telemetry history.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Devices registered to a user.
    ///
    /// # Errors
    ///
    /// Returns `Backend` on transport failure.
    async fn devices_for_user(&self, user_id: Uuid) -> Result<Vec<DeviceRecord>, DeviceError>;

    /// The most recent `limit` readings for a device, newest first.
    ///
    /// # Errors
    ///
    /// Returns `Backend` on transport failure.
    async fn recent_readings(&self, device_id: &str, limit: i64) -> Result<Vec<DeviceReading>, DeviceError>;
}

/// Postgres-backed [`DeviceDirectory`] over the `devices` and
/// `device_readings` tables.
pub struct PgDeviceDirectory {
    pool: PgPool,
}

impl PgDeviceDirectory {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceDirectory for PgDeviceDirectory {
    async fn devices_for_user(&self, user_id: Uuid) -> Result<Vec<DeviceRecord>, DeviceError> {
        let rows = sqlx::query(
            "SELECT id, name, kind, online, last_seen FROM devices WHERE user_id = $1 ORDER BY name",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(DeviceRecord {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    kind: row.try_get("kind")?,
                    online: row.try_get("online")?,
                    last_seen: row.try_get("last_seen")?,
                })
            })
            .collect()
    }

    async fn recent_readings(&self, device_id: &str, limit: i64) -> Result<Vec<DeviceReading>, DeviceError> {
        let rows = sqlx::query(
            "SELECT device_id, payload, recorded_at FROM device_readings \
             WHERE device_id = $1 ORDER BY recorded_at DESC LIMIT $2",
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(DeviceReading {
                    device_id: row.try_get("device_id")?,
                    payload: row.try_get("payload")?,
                    recorded_at: row.try_get("recorded_at")?,
                })
            })
            .collect()
    }
}

// =============================================================================
// FACADE
// =============================================================================

/// Device capability facade handed to the script sandbox.
#[derive(Clone)]
pub struct DeviceApi {
    directory: Option<Arc<dyn DeviceDirectory>>,
    user_id: Option<Uuid>,
    channel: DeviceChannel,
}

impl DeviceApi {
    #[must_use]
    pub fn new(
        directory: Option<Arc<dyn DeviceDirectory>>,
        user_id: Option<Uuid>,
        channel: DeviceChannel,
    ) -> Self {
        Self { directory, user_id, channel }
    }

    /// The current user's registered devices. Empty, with a warning, when
    /// unauthenticated or no directory is configured.
    ///
    /// # Errors
    ///
    /// Returns `Backend` on transport failure.
    pub async fn get_devices(&self) -> Result<Vec<DeviceRecord>, DeviceError> {
        let Some(directory) = &self.directory else {
            warn!("get_devices: no device directory configured");
            return Ok(Vec::new());
        };
        let Some(user_id) = self.user_id else {
            warn!("get_devices: not authenticated");
            return Ok(Vec::new());
        };
        directory.devices_for_user(user_id).await
    }

    /// The most recent readings for a device, newest first. `limit`
    /// defaults to [`DEFAULT_READING_LIMIT`].
    ///
    /// # Errors
    ///
    /// Returns `Backend` on transport failure.
    pub async fn get_device_data(
        &self,
        device_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<DeviceReading>, DeviceError> {
        let Some(directory) = &self.directory else {
            warn!(device_id, "get_device_data: no device directory configured");
            return Ok(Vec::new());
        };
        directory
            .recent_readings(device_id, limit.unwrap_or(DEFAULT_READING_LIMIT))
            .await
    }

    /// Forward a command object to a device over the device channel,
    /// wrapped in the `{targetId, payload: {commands}}` envelope.
    /// Fire-and-forget; `false` when the channel is down.
    pub fn send_command(&self, device_id: &str, command: Value) -> bool {
        let payload = wire::command_payload(None, vec![command]);
        self.channel.send(device_id, &payload)
    }
}

// =============================================================================
// TESTS
// =============================================================================
