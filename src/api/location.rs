//! Location API — one-shot and continuous geolocation over an injected
//! provider.
//!
//! The runtime itself has no position source; the host injects a
//! [`LocationProvider`] (a GPS daemon, a browser bridge, a fixed test
//! position). The facade applies the default options, logs failures, and
//! registers every watch with the runtime's cleanup bag so `cleanup()`
//! guarantees no callback fires after teardown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::events::Unsubscribe;
use crate::runtime::CleanupBag;

#[derive(Debug, Clone, thiserror::Error)]
pub enum LocationError {
    #[error("geolocation is not supported in this environment")]
    Unsupported,
    #[error("geolocation permission denied")]
    PermissionDenied,
    #[error("position unavailable: {0}")]
    Unavailable(String),
    #[error("geolocation request timed out")]
    Timeout,
}

/// A geolocation fix.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeoPosition {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in meters.
    pub accuracy: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Options for one-shot and watch requests.
#[derive(Debug, Clone, Copy)]
pub struct LocationOptions {
    pub enable_high_accuracy: bool,
    pub timeout: Duration,
    pub maximum_age: Duration,
}

impl Default for LocationOptions {
    fn default() -> Self {
        Self {
            enable_high_accuracy: true,
            timeout: Duration::from_secs(10),
            maximum_age: Duration::from_secs(60),
        }
    }
}

/// Callback invoked with each position fix of a watch.
pub type PositionCallback = Arc<dyn Fn(&GeoPosition) + Send + Sync>;

// =============================================================================
// PROVIDER TRAIT
// =============================================================================

/// Host-supplied position source.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    fn is_supported(&self) -> bool;

    /// Resolve a single fix.
    ///
    /// # Errors
    ///
    /// Returns a [`LocationError`] when unsupported, denied, or timed out.
    async fn current_position(&self, options: &LocationOptions) -> Result<GeoPosition, LocationError>;

    /// Start a continuous watch. Returns a watch id for
    /// [`LocationProvider::clear_watch`]. Fix errors inside a running watch
    /// are the provider's to log; they must not stop the watch.
    ///
    /// # Errors
    ///
    /// Returns a [`LocationError`] when the watch cannot start at all.
    fn watch(&self, options: &LocationOptions, callback: PositionCallback) -> Result<u64, LocationError>;

    /// Stop a watch. Unknown ids are a no-op.
    fn clear_watch(&self, watch_id: u64);
}

/// Default provider for hosts without a position source: everything fails
/// with [`LocationError::Unsupported`].
pub struct UnsupportedLocation;

#[async_trait]
impl LocationProvider for UnsupportedLocation {
    fn is_supported(&self) -> bool {
        false
    }

    async fn current_position(&self, _options: &LocationOptions) -> Result<GeoPosition, LocationError> {
        Err(LocationError::Unsupported)
    }

    fn watch(&self, _options: &LocationOptions, _callback: PositionCallback) -> Result<u64, LocationError> {
        Err(LocationError::Unsupported)
    }

    fn clear_watch(&self, _watch_id: u64) {}
}

// =============================================================================
// FACADE
// =============================================================================

/// Location capability facade handed to the script sandbox.
#[derive(Clone)]
pub struct LocationApi {
    provider: Arc<dyn LocationProvider>,
    cleanups: CleanupBag,
}

impl LocationApi {
    pub(crate) fn new(provider: Arc<dyn LocationProvider>, cleanups: CleanupBag) -> Self {
        Self { provider, cleanups }
    }

    /// Whether the environment can produce positions at all.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.provider.is_supported()
    }

    /// Resolve a single fix with the given or default options.
    ///
    /// # Errors
    ///
    /// Logs and propagates the provider's error.
    pub async fn get_current_position(
        &self,
        options: Option<LocationOptions>,
    ) -> Result<GeoPosition, LocationError> {
        let options = options.unwrap_or_default();
        match self.provider.current_position(&options).await {
            Ok(position) => Ok(position),
            Err(e) => {
                warn!(error = %e, "get_current_position failed");
                Err(e)
            }
        }
    }

    /// Start a continuous watch. The returned closure stops it; the runtime
    /// cleanup bag holds a second stop handle so `cleanup()` also ends it.
    ///
    /// # Errors
    ///
    /// Logs and propagates the provider's error when the watch cannot start.
    pub fn watch_position(
        &self,
        callback: PositionCallback,
        options: Option<LocationOptions>,
    ) -> Result<Unsubscribe, LocationError> {
        let options = options.unwrap_or_default();
        let watch_id = match self.provider.watch(&options, callback) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "watch_position failed to start");
                return Err(e);
            }
        };

        let provider = self.provider.clone();
        self.cleanups.push({
            let provider = provider.clone();
            move || provider.clear_watch(watch_id)
        });
        Ok(Box::new(move || provider.clear_watch(watch_id)))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Fixed-position provider whose watches fire only when the test pumps
    /// them, mirroring a host bridge delivering fixes.
    #[derive(Default)]
    pub(crate) struct FixedLocation {
        next_watch: AtomicU64,
        watches: Mutex<HashMap<u64, PositionCallback>>,
    }

    impl FixedLocation {
        pub(crate) fn pump(&self) {
            let fix = GeoPosition {
                latitude: 59.33,
                longitude: 18.07,
                accuracy: 5.0,
                altitude: None,
                heading: None,
                speed: None,
                timestamp: 1_700_000_000_000,
            };
            let snapshot: Vec<PositionCallback> = self.watches.lock().values().cloned().collect();
            for callback in snapshot {
                callback(&fix);
            }
        }

        pub(crate) fn watch_count(&self) -> usize {
            self.watches.lock().len()
        }
    }

    #[async_trait]
    impl LocationProvider for FixedLocation {
        fn is_supported(&self) -> bool {
            true
        }

        async fn current_position(&self, _options: &LocationOptions) -> Result<GeoPosition, LocationError> {
            Ok(GeoPosition {
                latitude: 59.33,
                longitude: 18.07,
                accuracy: 5.0,
                altitude: Some(28.0),
                heading: None,
                speed: None,
                timestamp: 1_700_000_000_000,
            })
        }

        fn watch(&self, _options: &LocationOptions, callback: PositionCallback) -> Result<u64, LocationError> {
            let id = self.next_watch.fetch_add(1, Ordering::Relaxed);
            self.watches.lock().insert(id, callback);
            Ok(id)
        }

        fn clear_watch(&self, watch_id: u64) {
            self.watches.lock().remove(&watch_id);
        }
    }

    #[tokio::test]
    async fn one_shot_resolves_through_provider() {
        let api = LocationApi::new(Arc::new(FixedLocation::default()), CleanupBag::new());
        let fix = api.get_current_position(None).await.unwrap();
        assert!((fix.latitude - 59.33).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn unsupported_provider_rejects() {
        let api = LocationApi::new(Arc::new(UnsupportedLocation), CleanupBag::new());
        assert!(!api.is_supported());
        let err = api.get_current_position(None).await.unwrap_err();
        assert!(matches!(err, LocationError::Unsupported));
    }

    #[test]
    fn watch_unsubscribe_stops_fixes() {
        let provider = Arc::new(FixedLocation::default());
        let api = LocationApi::new(provider.clone(), CleanupBag::new());

        let count = Arc::new(AtomicU64::new(0));
        let sink = count.clone();
        let unsubscribe = api
            .watch_position(
                Arc::new(move |_| {
                    sink.fetch_add(1, Ordering::SeqCst);
                }),
                None,
            )
            .unwrap();

        provider.pump();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        unsubscribe();
        provider.pump();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(provider.watch_count(), 0);
    }

    #[test]
    fn cleanup_bag_cancels_forgotten_watch() {
        let provider = Arc::new(FixedLocation::default());
        let cleanups = CleanupBag::new();
        let api = LocationApi::new(provider.clone(), cleanups.clone());

        let count = Arc::new(AtomicU64::new(0));
        let sink = count.clone();
        let _forgotten = api
            .watch_position(
                Arc::new(move |_| {
                    sink.fetch_add(1, Ordering::SeqCst);
                }),
                None,
            )
            .unwrap();

        cleanups.drain();
        provider.pump();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn default_options_match_contract() {
        let options = LocationOptions::default();
        assert!(options.enable_high_accuracy);
        assert_eq!(options.timeout, Duration::from_secs(10));
        assert_eq!(options.maximum_age, Duration::from_secs(60));
    }
}
