//! Script runtime — construction, shared core state, lifecycle entry
//! points, and teardown.
//!
//! DESIGN
//! ======
//! `ScriptRuntime` is the unit the host constructs per dashboard script
//! run: it owns the widget snapshot and event bus, assembles one set of
//! capability facades over the injected shared services, executes the
//! script through the sandbox, and exposes the entry points the host calls
//! afterwards (`trigger_widget_event`, `trigger_lifecycle_event`, inbound
//! message routing). Shared services (device channel, connection pool,
//! stores, providers) are injected handles, never module-level singletons,
//! so several runtimes can coexist and tests substitute fakes per instance.
//!
//! LIFECYCLE
//! =========
//! 1. Host builds the runtime with the current widget list and callbacks
//! 2. `execute` runs the script once; handlers and watches register
//! 3. Inbound events call the bus; handlers call back into the facades
//! 4. `cleanup` cancels every tracked subscription, watch, and timer

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::debug;

use crate::api::database::{DashboardStore, DatabaseApi};
use crate::api::device::{DeviceApi, DeviceDirectory};
use crate::api::http::{HttpApi, HttpError};
use crate::api::location::{LocationApi, LocationProvider, UnsupportedLocation};
use crate::api::sensor::{NullSensorHub, SensorApi, SensorHub, UsbApi};
use crate::api::storage::{KeyValueStore, MemoryStore, StorageApi};
use crate::api::widget_api::WidgetApi;
use crate::api::ws::{ConnectionPool, DeviceChannel, WsApi};
use crate::context::{ContextApi, ScriptContext};
use crate::events::EventBus;
use crate::script::{Capabilities, Sandbox, ScriptError};
use crate::widget::{TransformPatch, Widget, WidgetPatch, WidgetStore};
use crate::wire;

// =============================================================================
// CALLBACK TYPES
// =============================================================================

/// Host callback for config/value/title/style updates.
pub type UpdateCallback = Arc<dyn Fn(&str, WidgetPatch) + Send + Sync>;

/// Host callback for geometry updates.
pub type TransformCallback = Arc<dyn Fn(&str, TransformPatch) + Send + Sync>;

/// Sink for script console output, feeding the host's in-app console view.
pub type ConsoleSink = Arc<dyn Fn(ConsoleLevel, &str, &[Value]) + Send + Sync>;

/// Severity of a script console entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Log,
    Warn,
    Error,
    Info,
}

impl ConsoleLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ConsoleLevel::Log => "log",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Error => "error",
            ConsoleLevel::Info => "info",
        }
    }
}

/// Widget lifecycle points the host reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Widget mounted.
    Load,
    /// Widget mounted and first-rendered.
    Ready,
    /// Widget about to unmount.
    Destroy,
}

impl LifecycleEvent {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleEvent::Load => "load",
            LifecycleEvent::Ready => "ready",
            LifecycleEvent::Destroy => "destroy",
        }
    }
}

// =============================================================================
// SHARED CORE
// =============================================================================

/// State shared by the widget facade and the runtime: the widget snapshot,
/// the event bus, and the host callbacks.
pub(crate) struct RuntimeCore {
    pub(crate) store: Mutex<WidgetStore>,
    pub(crate) bus: EventBus,
    pub(crate) on_update: Option<UpdateCallback>,
    pub(crate) on_transform: Option<TransformCallback>,
}

impl RuntimeCore {
    pub(crate) fn new(
        widgets: Vec<Widget>,
        on_update: Option<UpdateCallback>,
        on_transform: Option<TransformCallback>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store: Mutex::new(WidgetStore::from_widgets(widgets)),
            bus: EventBus::new(),
            on_update,
            on_transform,
        })
    }
}

/// Central registry of teardown closures: event unsubscribes, location and
/// sensor watch cancellations, timer aborts. One `drain` guarantees no
/// further callback fires even if individual call sites forgot to
/// unsubscribe.
#[derive(Clone)]
pub struct CleanupBag {
    closures: Arc<Mutex<Vec<Box<dyn FnOnce() + Send>>>>,
}

impl CleanupBag {
    #[must_use]
    pub fn new() -> Self {
        Self { closures: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Register a teardown closure.
    pub fn push(&self, closure: impl FnOnce() + Send + 'static) {
        self.closures.lock().push(Box::new(closure));
    }

    /// Run and drop every registered closure. Safe to call repeatedly.
    pub fn drain(&self) {
        let closures: Vec<_> = std::mem::take(&mut *self.closures.lock());
        for closure in closures {
            closure();
        }
    }
}

impl Default for CleanupBag {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// RUNTIME
// =============================================================================

/// One dashboard script run: widget snapshot, capability facades, sandbox.
pub struct ScriptRuntime {
    core: Arc<RuntimeCore>,
    widget: WidgetApi,
    ws: WsApi,
    storage: StorageApi,
    database: DatabaseApi,
    context: ContextApi,
    location: LocationApi,
    http: HttpApi,
    device: DeviceApi,
    sensor: SensorApi,
    usb: UsbApi,
    sandbox: Sandbox,
    cleanups: CleanupBag,
}

impl ScriptRuntime {
    /// Start building a runtime over the host's current widget list.
    #[must_use]
    pub fn builder(widgets: Vec<Widget>) -> RuntimeBuilder {
        RuntimeBuilder::new(widgets)
    }

    /// Compile and run a script. Event handlers and watches registered by
    /// the script stay live until [`ScriptRuntime::cleanup`].
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError`] for compile and runtime failures, after
    /// logging them to both the tracing layer and the console sink. The
    /// host decides whether that aborts the dashboard load.
    pub fn execute(&self, script: &str) -> Result<(), ScriptError> {
        self.sandbox.execute(script)
    }

    /// External entry point for inbound events: UI interactions and
    /// WebSocket-routed triggers.
    pub fn trigger_widget_event(&self, widget_id: &str, event: &str, value: &Value) {
        self.core.bus.trigger(widget_id, event, value);
    }

    /// Report a widget lifecycle point. Timing and ordering are the host's
    /// contract; the runtime only dispatches.
    pub fn trigger_lifecycle_event(&self, widget_id: &str, event: LifecycleEvent) {
        self.core
            .bus
            .trigger(widget_id, event.as_str(), &json!({ "widgetId": widget_id }));
    }

    /// Route an inbound device-channel message to its widget by id,
    /// applying it as a value write (which drives the usual change and
    /// edge events). Returns `false` for shapes that carry no widget update.
    pub fn route_message(&self, message: &Value) -> bool {
        match wire::widget_update(message) {
            Some((widget_id, value)) => {
                let (widget_id, value) = (widget_id.to_owned(), value.clone());
                self.widget.set_value(&widget_id, value);
                true
            }
            None => {
                debug!("inbound message carries no widget update");
                false
            }
        }
    }

    /// Replace the widget snapshot, called by the host on re-render.
    /// Subscriptions are untouched; they are keyed by widget id.
    pub fn replace_widgets(&self, widgets: Vec<Widget>) {
        self.core.store.lock().replace_all(widgets);
    }

    /// Cancel every tracked subscription, watch, and timer, and clear the
    /// event map. Safe to call more than once; capability calls after
    /// cleanup are a caller contract violation, not guarded here.
    pub fn cleanup(&self) {
        self.sandbox.teardown();
        self.cleanups.drain();
        self.core.bus.clear();
    }

    /// Widget control facade.
    #[must_use]
    pub fn widget(&self) -> &WidgetApi {
        &self.widget
    }

    /// WebSocket facade.
    #[must_use]
    pub fn ws(&self) -> &WsApi {
        &self.ws
    }

    /// Namespaced local storage facade.
    #[must_use]
    pub fn storage(&self) -> &StorageApi {
        &self.storage
    }

    /// Remote per-dashboard storage facade.
    #[must_use]
    pub fn database(&self) -> &DatabaseApi {
        &self.database
    }

    /// Context snapshot facade.
    #[must_use]
    pub fn context(&self) -> &ContextApi {
        &self.context
    }

    /// Geolocation facade.
    #[must_use]
    pub fn location(&self) -> &LocationApi {
        &self.location
    }

    /// HTTP facade.
    #[must_use]
    pub fn http(&self) -> &HttpApi {
        &self.http
    }

    /// Device directory and command facade.
    #[must_use]
    pub fn device(&self) -> &DeviceApi {
        &self.device
    }

    /// Sensor facade.
    #[must_use]
    pub fn sensor(&self) -> &SensorApi {
        &self.sensor
    }

    /// USB facade.
    #[must_use]
    pub fn usb(&self) -> &UsbApi {
        &self.usb
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Builder for [`ScriptRuntime`]. Everything beyond the widget list is
/// optional; absent services degrade the matching capability the way the
/// error-handling design specifies.
pub struct RuntimeBuilder {
    widgets: Vec<Widget>,
    on_update: Option<UpdateCallback>,
    on_transform: Option<TransformCallback>,
    console_sink: Option<ConsoleSink>,
    context: ScriptContext,
    database: Option<Arc<dyn DashboardStore>>,
    devices: Option<Arc<dyn DeviceDirectory>>,
    location: Option<Arc<dyn LocationProvider>>,
    sensors: Option<Arc<dyn SensorHub>>,
    storage: Option<Arc<dyn KeyValueStore>>,
    device_channel: Option<DeviceChannel>,
    connection_pool: Option<ConnectionPool>,
}

impl RuntimeBuilder {
    fn new(widgets: Vec<Widget>) -> Self {
        Self {
            widgets,
            on_update: None,
            on_transform: None,
            console_sink: None,
            context: ScriptContext::default(),
            database: None,
            devices: None,
            location: None,
            sensors: None,
            storage: None,
            device_channel: None,
            connection_pool: None,
        }
    }

    /// Host callback for config/value/title/style updates.
    #[must_use]
    pub fn on_update(mut self, callback: UpdateCallback) -> Self {
        self.on_update = Some(callback);
        self
    }

    /// Host callback for geometry updates.
    #[must_use]
    pub fn on_transform(mut self, callback: TransformCallback) -> Self {
        self.on_transform = Some(callback);
        self
    }

    /// Sink for script console output.
    #[must_use]
    pub fn console_sink(mut self, sink: ConsoleSink) -> Self {
        self.console_sink = Some(sink);
        self
    }

    /// User/device/dashboard snapshot for this run.
    #[must_use]
    pub fn context(mut self, context: ScriptContext) -> Self {
        self.context = context;
        self
    }

    /// Remote dashboard store backing the database capability.
    #[must_use]
    pub fn database(mut self, store: Arc<dyn DashboardStore>) -> Self {
        self.database = Some(store);
        self
    }

    /// Device directory backing the device capability.
    #[must_use]
    pub fn devices(mut self, directory: Arc<dyn DeviceDirectory>) -> Self {
        self.devices = Some(directory);
        self
    }

    /// Position source backing the location capability.
    #[must_use]
    pub fn location(mut self, provider: Arc<dyn LocationProvider>) -> Self {
        self.location = Some(provider);
        self
    }

    /// Sensor hub backing the sensor capability.
    #[must_use]
    pub fn sensors(mut self, hub: Arc<dyn SensorHub>) -> Self {
        self.sensors = Some(hub);
        self
    }

    /// Durable key/value store backing the storage capability.
    #[must_use]
    pub fn storage(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.storage = Some(store);
        self
    }

    /// Shared device channel. Pass the same handle to every runtime so
    /// repeated script runs reuse one socket.
    #[must_use]
    pub fn device_channel(mut self, channel: DeviceChannel) -> Self {
        self.device_channel = Some(channel);
        self
    }

    /// Shared custom-connection pool. Pass the same handle to every runtime
    /// so connections survive script edits.
    #[must_use]
    pub fn connection_pool(mut self, pool: ConnectionPool) -> Self {
        self.connection_pool = Some(pool);
        self
    }

    /// Assemble the runtime.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::ClientBuild`] if the HTTP client cannot be
    /// initialized.
    pub fn build(self) -> Result<ScriptRuntime, HttpError> {
        let cleanups = CleanupBag::new();
        let core = RuntimeCore::new(self.widgets, self.on_update, self.on_transform);

        let channel = self.device_channel.unwrap_or_default();
        let pool = self.connection_pool.unwrap_or_default();

        let widget = WidgetApi::new(core.clone());
        let ws = WsApi::new(channel.clone(), pool, cleanups.clone());
        let storage = StorageApi::new(
            self.storage
                .unwrap_or_else(|| Arc::new(MemoryStore::new())),
        );
        let database = DatabaseApi::new(self.database, self.context.dashboard_id);
        let location = LocationApi::new(
            self.location
                .unwrap_or_else(|| Arc::new(UnsupportedLocation)),
            cleanups.clone(),
        );
        let http = HttpApi::new()?;
        let user_id = self.context.user.as_ref().map(|u| u.id);
        let device = DeviceApi::new(self.devices, user_id, channel);
        let sensor = SensorApi::new(
            self.sensors.unwrap_or_else(|| Arc::new(NullSensorHub)),
            cleanups.clone(),
        );
        let usb = UsbApi::new();
        let context = ContextApi::new(self.context);

        let sandbox = Sandbox::new(
            Capabilities {
                widget: widget.clone(),
                ws: ws.clone(),
                storage: storage.clone(),
                database: database.clone(),
                context: context.clone(),
                location: location.clone(),
                http: http.clone(),
                device: device.clone(),
                sensor: sensor.clone(),
                usb: usb.clone(),
            },
            self.console_sink,
        );

        Ok(ScriptRuntime {
            core,
            widget,
            ws,
            storage,
            database,
            context,
            location,
            http,
            device,
            sensor,
            usb,
            sandbox,
            cleanups,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::widget::WidgetKind;

    fn runtime_with_switch() -> (ScriptRuntime, Arc<Mutex<Vec<(String, WidgetPatch)>>>) {
        let patches: Arc<Mutex<Vec<(String, WidgetPatch)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = patches.clone();
        let runtime = ScriptRuntime::builder(vec![Widget::new("sw1", WidgetKind::Switch)])
            .on_update(Arc::new(move |id, patch| {
                sink.lock().push((id.to_owned(), patch));
            }))
            .build()
            .unwrap();
        (runtime, patches)
    }

    #[test]
    fn route_message_nested_shape_drives_set_value() {
        let (runtime, patches) = runtime_with_switch();
        let routed = runtime.route_message(&json!({"payload": {"widgetId": "sw1", "value": true}}));
        assert!(routed);
        assert_eq!(runtime.widget().get_value("sw1"), Some(json!(true)));
        assert_eq!(patches.lock().len(), 1);
    }

    #[test]
    fn route_message_flat_shape_drives_set_value() {
        let (runtime, _) = runtime_with_switch();
        assert!(runtime.route_message(&json!({"widgetId": "sw1", "value": "on"})));
        assert_eq!(runtime.widget().get_value("sw1"), Some(json!("on")));
    }

    #[test]
    fn route_message_rejects_other_shapes() {
        let (runtime, patches) = runtime_with_switch();
        assert!(!runtime.route_message(&json!({"status": "hello"})));
        assert!(patches.lock().is_empty());
    }

    #[test]
    fn lifecycle_events_carry_the_widget_id() {
        let (runtime, _) = runtime_with_switch();
        let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _unsub = runtime.widget().on(
            "sw1",
            "destroy",
            Arc::new(move |v| {
                sink.lock().push(v.clone());
            }),
        );

        runtime.trigger_lifecycle_event("sw1", LifecycleEvent::Destroy);
        assert_eq!(seen.lock()[0], json!({"widgetId": "sw1"}));
    }

    #[test]
    fn cleanup_clears_subscriptions_and_is_repeatable() {
        let (runtime, _) = runtime_with_switch();
        let seen = Arc::new(Mutex::new(0usize));
        let sink = seen.clone();
        let _unsub = runtime.widget().on(
            "sw1",
            "change",
            Arc::new(move |_| {
                *sink.lock() += 1;
            }),
        );

        runtime.cleanup();
        runtime.cleanup();
        runtime.trigger_widget_event("sw1", "change", &json!(1));
        assert_eq!(*seen.lock(), 0);
    }

    #[test]
    fn replace_widgets_swaps_the_snapshot() {
        let (runtime, _) = runtime_with_switch();
        runtime.replace_widgets(vec![Widget::new("g1", WidgetKind::Gauge)]);
        assert!(runtime.widget().get("sw1").is_none());
        assert!(runtime.widget().get("g1").is_some());
    }

    #[test]
    fn lifecycle_event_names() {
        assert_eq!(LifecycleEvent::Load.as_str(), "load");
        assert_eq!(LifecycleEvent::Ready.as_str(), "ready");
        assert_eq!(LifecycleEvent::Destroy.as_str(), "destroy");
    }
}
