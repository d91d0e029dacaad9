//! Sensor and USB APIs — facades over host device-sensor primitives.
//!
//! The runtime never talks to hardware; the host injects a [`SensorHub`].
//! Kinds the hub does not support return `None` with a warning instead of
//! erroring: an absent sensor is an expected environment limitation
//! ("requires a native host"), not a bug, and shows up only in the script
//! console. The USB facade follows the same stance with an empty default.

use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::events::Unsubscribe;
use crate::runtime::CleanupBag;

/// Callback invoked with each sample of a sensor watch.
pub type SensorCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// The sensor kinds scripts can ask for. Which of them actually produce
/// data is up to the injected hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    Motion,
    Orientation,
    AmbientLight,
    Microphone,
    Camera,
    Nfc,
    Biometric,
    Proximity,
    Barometer,
    Temperature,
    Humidity,
    HeartRate,
    BloodOxygen,
    Lidar,
}

impl SensorKind {
    /// Wire/script name of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SensorKind::Motion => "motion",
            SensorKind::Orientation => "orientation",
            SensorKind::AmbientLight => "ambient-light",
            SensorKind::Microphone => "microphone",
            SensorKind::Camera => "camera",
            SensorKind::Nfc => "nfc",
            SensorKind::Biometric => "biometric",
            SensorKind::Proximity => "proximity",
            SensorKind::Barometer => "barometer",
            SensorKind::Temperature => "temperature",
            SensorKind::Humidity => "humidity",
            SensorKind::HeartRate => "heart-rate",
            SensorKind::BloodOxygen => "blood-oxygen",
            SensorKind::Lidar => "lidar",
        }
    }
}

impl FromStr for SensorKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "motion" => Ok(SensorKind::Motion),
            "orientation" => Ok(SensorKind::Orientation),
            "ambient-light" => Ok(SensorKind::AmbientLight),
            "microphone" => Ok(SensorKind::Microphone),
            "camera" => Ok(SensorKind::Camera),
            "nfc" => Ok(SensorKind::Nfc),
            "biometric" => Ok(SensorKind::Biometric),
            "proximity" => Ok(SensorKind::Proximity),
            "barometer" => Ok(SensorKind::Barometer),
            "temperature" => Ok(SensorKind::Temperature),
            "humidity" => Ok(SensorKind::Humidity),
            "heart-rate" => Ok(SensorKind::HeartRate),
            "blood-oxygen" => Ok(SensorKind::BloodOxygen),
            "lidar" => Ok(SensorKind::Lidar),
            _ => Err(()),
        }
    }
}

// =============================================================================
// HUB TRAIT
// =============================================================================

/// Host-supplied sensor access.
pub trait SensorHub: Send + Sync {
    fn is_supported(&self, kind: SensorKind) -> bool;

    /// One-shot sample, or `None` when unsupported.
    fn read(&self, kind: SensorKind) -> Option<Value>;

    /// Start a continuous watch; `None` when unsupported.
    fn watch(&self, kind: SensorKind, callback: SensorCallback) -> Option<u64>;

    /// Stop a watch. Unknown ids are a no-op.
    fn clear_watch(&self, watch_id: u64);
}

/// Default hub for headless hosts: nothing is supported.
pub struct NullSensorHub;

impl SensorHub for NullSensorHub {
    fn is_supported(&self, _kind: SensorKind) -> bool {
        false
    }

    fn read(&self, _kind: SensorKind) -> Option<Value> {
        None
    }

    fn watch(&self, _kind: SensorKind, _callback: SensorCallback) -> Option<u64> {
        None
    }

    fn clear_watch(&self, _watch_id: u64) {}
}

// =============================================================================
// FACADES
// =============================================================================

/// Sensor capability facade handed to the script sandbox.
#[derive(Clone)]
pub struct SensorApi {
    hub: Arc<dyn SensorHub>,
    cleanups: CleanupBag,
}

impl SensorApi {
    pub(crate) fn new(hub: Arc<dyn SensorHub>, cleanups: CleanupBag) -> Self {
        Self { hub, cleanups }
    }

    /// Whether the hub can produce this kind.
    #[must_use]
    pub fn is_supported(&self, kind: SensorKind) -> bool {
        self.hub.is_supported(kind)
    }

    /// One-shot sample. Unsupported kinds warn and return `None`.
    #[must_use]
    pub fn read(&self, kind: SensorKind) -> Option<Value> {
        if !self.hub.is_supported(kind) {
            warn!(sensor = kind.as_str(), "sensor unavailable; requires a native host");
            return None;
        }
        self.hub.read(kind)
    }

    /// Start a continuous watch. Unsupported kinds warn and return `None`;
    /// started watches are tracked by the runtime cleanup bag.
    pub fn watch(&self, kind: SensorKind, callback: SensorCallback) -> Option<Unsubscribe> {
        if !self.hub.is_supported(kind) {
            warn!(sensor = kind.as_str(), "sensor unavailable; requires a native host");
            return None;
        }
        let watch_id = self.hub.watch(kind, callback)?;

        let hub = self.hub.clone();
        self.cleanups.push({
            let hub = hub.clone();
            move || hub.clear_watch(watch_id)
        });
        Some(Box::new(move || hub.clear_watch(watch_id)))
    }
}

/// USB capability facade. Device I/O needs a native host; the embedded
/// runtime only reports the absence.
#[derive(Clone, Default)]
pub struct UsbApi;

impl UsbApi {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// USB access is never available in the embedded runtime.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        false
    }

    /// Always empty, with a warning.
    #[must_use]
    pub fn devices(&self) -> Vec<Value> {
        warn!("usb unavailable; requires a native host");
        Vec::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Hub supporting ambient light only.
    #[derive(Default)]
    struct LightOnlyHub {
        next_watch: AtomicU64,
        watches: Mutex<HashMap<u64, SensorCallback>>,
    }

    impl LightOnlyHub {
        fn pump(&self, lux: f64) {
            let sample = json!({ "lux": lux });
            let snapshot: Vec<SensorCallback> = self.watches.lock().values().cloned().collect();
            for callback in snapshot {
                callback(&sample);
            }
        }
    }

    impl SensorHub for LightOnlyHub {
        fn is_supported(&self, kind: SensorKind) -> bool {
            kind == SensorKind::AmbientLight
        }

        fn read(&self, kind: SensorKind) -> Option<Value> {
            (kind == SensorKind::AmbientLight).then(|| json!({ "lux": 120.0 }))
        }

        fn watch(&self, kind: SensorKind, callback: SensorCallback) -> Option<u64> {
            if kind != SensorKind::AmbientLight {
                return None;
            }
            let id = self.next_watch.fetch_add(1, Ordering::Relaxed);
            self.watches.lock().insert(id, callback);
            Some(id)
        }

        fn clear_watch(&self, watch_id: u64) {
            self.watches.lock().remove(&watch_id);
        }
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in [SensorKind::AmbientLight, SensorKind::HeartRate, SensorKind::Nfc] {
            assert_eq!(kind.as_str().parse::<SensorKind>(), Ok(kind));
        }
        assert!("gravity".parse::<SensorKind>().is_err());
    }

    #[test]
    fn unsupported_kind_reads_none() {
        let api = SensorApi::new(Arc::new(NullSensorHub), CleanupBag::new());
        assert!(!api.is_supported(SensorKind::Barometer));
        assert!(api.read(SensorKind::Barometer).is_none());
        assert!(api.watch(SensorKind::Barometer, Arc::new(|_| {})).is_none());
    }

    #[test]
    fn supported_kind_reads_and_watches() {
        let hub = Arc::new(LightOnlyHub::default());
        let api = SensorApi::new(hub.clone(), CleanupBag::new());

        assert_eq!(api.read(SensorKind::AmbientLight), Some(json!({"lux": 120.0})));

        let count = Arc::new(AtomicU64::new(0));
        let sink = count.clone();
        let unsubscribe = api
            .watch(
                SensorKind::AmbientLight,
                Arc::new(move |_| {
                    sink.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        hub.pump(80.0);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        unsubscribe();
        hub.pump(90.0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleanup_bag_stops_sensor_watches() {
        let hub = Arc::new(LightOnlyHub::default());
        let cleanups = CleanupBag::new();
        let api = SensorApi::new(hub.clone(), cleanups.clone());

        let count = Arc::new(AtomicU64::new(0));
        let sink = count.clone();
        let _watch = api.watch(
            SensorKind::AmbientLight,
            Arc::new(move |_| {
                sink.fetch_add(1, Ordering::SeqCst);
            }),
        );

        cleanups.drain();
        hub.pump(80.0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn usb_is_absent_by_design() {
        let usb = UsbApi::new();
        assert!(!usb.is_supported());
        assert!(usb.devices().is_empty());
    }
}
