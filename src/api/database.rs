//! Database API — remote per-dashboard key/value storage.
//!
//! DESIGN
//! ======
//! Script data lives in a `scriptData` sub-map inside the dashboard
//! record's `dashboard_config` JSON blob. Every operation round-trips
//! through a fetch-modify-write of the whole config: there is no partial
//! update, so concurrent scripts mutating the same dashboard race and the
//! last writer wins. The backing store is an injected trait so hosts and
//! tests substitute their own; the Postgres implementation mirrors how the
//! dashboard service itself persists records.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use sqlx::PgPool;
use uuid::Uuid;

/// Key of the script-owned sub-map inside `dashboard_config`.
pub const SCRIPT_DATA_KEY: &str = "scriptData";

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("no database connection is available")]
    NoConnection,
    #[error("Dashboard ID is not available in the script context")]
    NoDashboardId,
    #[error("dashboard record not found: {0}")]
    RecordNotFound(Uuid),
    #[error("database error: {0}")]
    Backend(#[from] sqlx::Error),
}

// =============================================================================
// STORE TRAIT
// =============================================================================

/// Wholesale access to a dashboard record's `dashboard_config` blob.
#[async_trait]
pub trait DashboardStore: Send + Sync {
    /// Fetch the config blob, or `None` when the record has no config yet.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::RecordNotFound`] when the dashboard row is
    /// absent, or `Backend` on transport failure.
    async fn load_config(&self, dashboard_id: Uuid) -> Result<Option<Value>, DatabaseError>;

    /// Replace the config blob.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::RecordNotFound`] when the dashboard row is
    /// absent, or `Backend` on transport failure.
    async fn save_config(&self, dashboard_id: Uuid, config: Value) -> Result<(), DatabaseError>;
}

/// Postgres-backed [`DashboardStore`] over the `dashboards` table.
pub struct PgDashboardStore {
    pool: PgPool,
}

impl PgDashboardStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DashboardStore for PgDashboardStore {
    async fn load_config(&self, dashboard_id: Uuid) -> Result<Option<Value>, DatabaseError> {
        let config: Option<Option<Value>> =
            sqlx::query_scalar("SELECT dashboard_config FROM dashboards WHERE id = $1")
                .bind(dashboard_id)
                .fetch_optional(&self.pool)
                .await?;
        match config {
            Some(config) => Ok(config),
            None => Err(DatabaseError::RecordNotFound(dashboard_id)),
        }
    }

    async fn save_config(&self, dashboard_id: Uuid, config: Value) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE dashboards SET dashboard_config = $2 WHERE id = $1")
            .bind(dashboard_id)
            .bind(config)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::RecordNotFound(dashboard_id));
        }
        Ok(())
    }
}

/// In-memory [`DashboardStore`] for hosts without a remote backend, and for
/// tests. Unknown dashboard ids behave as empty records rather than errors.
#[derive(Default)]
pub struct MemoryDashboardStore {
    records: parking_lot::Mutex<std::collections::HashMap<Uuid, Value>>,
}

impl MemoryDashboardStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DashboardStore for MemoryDashboardStore {
    async fn load_config(&self, dashboard_id: Uuid) -> Result<Option<Value>, DatabaseError> {
        Ok(self.records.lock().get(&dashboard_id).cloned())
    }

    async fn save_config(&self, dashboard_id: Uuid, config: Value) -> Result<(), DatabaseError> {
        self.records.lock().insert(dashboard_id, config);
        Ok(())
    }
}

// =============================================================================
// FACADE
// =============================================================================

/// Database capability facade handed to the script sandbox.
#[derive(Clone)]
pub struct DatabaseApi {
    store: Option<Arc<dyn DashboardStore>>,
    dashboard_id: Option<Uuid>,
}

impl DatabaseApi {
    #[must_use]
    pub fn new(store: Option<Arc<dyn DashboardStore>>, dashboard_id: Option<Uuid>) -> Self {
        Self { store, dashboard_id }
    }

    /// Write one key into the dashboard's script data.
    ///
    /// # Errors
    ///
    /// Rejects when no store or dashboard id is available, or on a backend
    /// failure during the fetch-modify-write.
    pub async fn save(&self, key: &str, value: Value) -> Result<(), DatabaseError> {
        let (store, dashboard_id) = self.require()?;
        let mut config = load_config_object(store, dashboard_id).await?;
        script_data_mut(&mut config).insert(key.to_owned(), value);
        store.save_config(dashboard_id, Value::Object(config)).await
    }

    /// Read one key from the dashboard's script data.
    ///
    /// # Errors
    ///
    /// Rejects when no store or dashboard id is available, or on a backend
    /// failure.
    pub async fn load(&self, key: &str) -> Result<Option<Value>, DatabaseError> {
        let (store, dashboard_id) = self.require()?;
        let mut config = load_config_object(store, dashboard_id).await?;
        Ok(script_data_mut(&mut config).get(key).cloned())
    }

    /// Delete one key from the dashboard's script data.
    ///
    /// # Errors
    ///
    /// Rejects when no store or dashboard id is available, or on a backend
    /// failure during the fetch-modify-write.
    pub async fn remove(&self, key: &str) -> Result<(), DatabaseError> {
        let (store, dashboard_id) = self.require()?;
        let mut config = load_config_object(store, dashboard_id).await?;
        script_data_mut(&mut config).remove(key);
        store.save_config(dashboard_id, Value::Object(config)).await
    }

    /// List the keys currently stored in the dashboard's script data.
    ///
    /// # Errors
    ///
    /// Rejects when no store or dashboard id is available, or on a backend
    /// failure.
    pub async fn list(&self) -> Result<Vec<String>, DatabaseError> {
        let (store, dashboard_id) = self.require()?;
        let mut config = load_config_object(store, dashboard_id).await?;
        Ok(script_data_mut(&mut config).keys().cloned().collect())
    }

    fn require(&self) -> Result<(&Arc<dyn DashboardStore>, Uuid), DatabaseError> {
        let store = self.store.as_ref().ok_or(DatabaseError::NoConnection)?;
        let dashboard_id = self.dashboard_id.ok_or(DatabaseError::NoDashboardId)?;
        Ok((store, dashboard_id))
    }
}

async fn load_config_object(
    store: &Arc<dyn DashboardStore>,
    dashboard_id: Uuid,
) -> Result<Map<String, Value>, DatabaseError> {
    let config = store.load_config(dashboard_id).await?.unwrap_or_else(|| json!({}));
    match config {
        Value::Object(map) => Ok(map),
        // A non-object blob is replaced rather than merged into.
        _ => Ok(Map::new()),
    }
}

/// The `scriptData` sub-map, created on first use.
fn script_data_mut(config: &mut Map<String, Value>) -> &mut Map<String, Value> {
    let entry = config
        .entry(SCRIPT_DATA_KEY.to_owned())
        .or_insert_with(|| json!({}));
    if !entry.is_object() {
        *entry = json!({});
    }
    entry.as_object_mut().expect("scriptData forced to object above")
}

// =============================================================================
// TESTS
// =============================================================================
