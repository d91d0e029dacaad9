//! Scripting and live-binding runtime for IoT dashboards.
//!
//! A dashboard is a canvas of widgets (gauges, sliders, switches, labels)
//! driven by live telemetry. This crate is the runtime behind it: the host
//! rendering layer hands over its widget list and a per-dashboard user
//! script, and the runtime executes the script in a capability sandbox,
//! routes events between inbound device messages, widget state changes,
//! and outbound commands, and emits sparse update patches back to the
//! host. Rendering, persistence, and authentication stay on the host side;
//! the runtime only consumes a widget list plus a script string and
//! produces widget-update instructions and outbound network messages.
//!
//! ## Module layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`runtime`] | [`runtime::ScriptRuntime`]: construction, lifecycle, teardown |
//! | [`widget`] | Widget records, value semantics, patches, the in-memory store |
//! | [`events`] | Per-widget event bus with `on`/`once`/`off`/`emit` |
//! | [`api`] | Capability facades: widget control, ws, storage, db, location, http, device, sensor |
//! | [`script`] | Rhai sandbox executing the user script against the facades |
//! | [`context`] | Per-run user/device/dashboard snapshot |
//! | [`wire`] | Device-channel JSON shapes (inbound telemetry, command envelope) |

pub mod api;
pub mod context;
pub mod events;
pub mod runtime;
pub mod script;
pub mod widget;
pub mod wire;

pub use api::database::{DashboardStore, DatabaseApi, DatabaseError, MemoryDashboardStore, PgDashboardStore};
pub use api::device::{DeviceApi, DeviceDirectory, DeviceError, DeviceReading, DeviceRecord, PgDeviceDirectory};
pub use api::http::{HttpApi, HttpError};
pub use api::location::{
    GeoPosition, LocationApi, LocationError, LocationOptions, LocationProvider, PositionCallback,
    UnsupportedLocation,
};
pub use api::sensor::{NullSensorHub, SensorApi, SensorCallback, SensorHub, SensorKind, UsbApi};
pub use api::storage::{KeyValueStore, MemoryStore, StorageApi};
pub use api::widget_api::WidgetApi;
pub use api::ws::{ConnectionPool, DeviceChannel, MessageCallback, WsApi, WsError};
pub use context::{ContextApi, DeviceClass, DeviceInfo, ScriptContext, UserInfo, Viewport};
pub use events::{EventBus, EventCallback, Unsubscribe};
pub use runtime::{
    CleanupBag, ConsoleLevel, ConsoleSink, LifecycleEvent, RuntimeBuilder, ScriptRuntime,
    TransformCallback, UpdateCallback,
};
pub use script::ScriptError;
pub use widget::{Point, Size, TransformPatch, Widget, WidgetKind, WidgetPatch, WidgetStore};
