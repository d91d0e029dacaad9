//! Capability bindings — registers every facade as a Rhai static module.
//!
//! One `register_*` function per capability, mirroring how the facades are
//! assembled. Script closures arrive as `FnPtr`s and are wrapped into the
//! runtime's callback types; the wrappers resolve against the sandbox's
//! retained engine/AST pair, so they go quiet after teardown instead of
//! erroring. Subscription-style APIs hand scripts an integer token
//! (`widget::unsubscribe`, `location::clear_watch`) because host closures
//! cannot round-trip through the engine.

use std::sync::Arc;
use std::time::Duration;

use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, Module};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use super::SandboxShared;
use crate::api::location::PositionCallback;
use crate::api::sensor::{SensorCallback, SensorKind};
use crate::api::ws::MessageCallback;
use crate::events::EventCallback;
use crate::runtime::ConsoleLevel;

pub(crate) fn register_all(engine: &mut Engine, shared: &Arc<SandboxShared>) {
    register_widget(engine, shared);
    register_ws(engine, shared);
    register_storage(engine, shared);
    register_db(engine, shared);
    register_context(engine, shared);
    register_location(engine, shared);
    register_http(engine, shared);
    register_device(engine, shared);
    register_sensor(engine, shared);
    register_usb(engine, shared);
    register_console(engine, shared);
    register_timers(engine, shared);
}

// =============================================================================
// CONVERSION HELPERS
// =============================================================================

fn runtime_err(message: impl std::fmt::Display) -> Box<EvalAltResult> {
    message.to_string().into()
}

fn dyn_to_value(value: &Dynamic) -> Result<Value, Box<EvalAltResult>> {
    rhai::serde::from_dynamic(value)
}

/// Serialize anything into a `Dynamic`; unrepresentable values become unit.
fn to_dyn<T: Serialize>(value: &T) -> Dynamic {
    rhai::serde::to_dynamic(value).unwrap_or(Dynamic::UNIT)
}

fn opt_to_dyn(value: Option<Value>) -> Dynamic {
    value.as_ref().map_or(Dynamic::UNIT, to_dyn)
}

/// Coerce a script number (int or float) to `f64`.
fn num(value: &Dynamic) -> Result<f64, Box<EvalAltResult>> {
    if let Ok(f) = value.as_float() {
        return Ok(f);
    }
    #[allow(clippy::cast_precision_loss)]
    if let Ok(i) = value.as_int() {
        return Ok(i as f64);
    }
    Err(runtime_err(format!("expected a number, got {}", value.type_name())))
}

/// Run a capability future to completion on the host runtime.
fn block_on<F: Future>(shared: &SandboxShared, future: F) -> Result<F::Output, Box<EvalAltResult>> {
    let Some(handle) = shared.runtime_handle() else {
        return Err(runtime_err("async capabilities require a tokio runtime host"));
    };
    if tokio::runtime::Handle::try_current().is_ok() {
        Ok(tokio::task::block_in_place(|| handle.block_on(future)))
    } else {
        Ok(handle.block_on(future))
    }
}

// =============================================================================
// CALLBACK WRAPPERS
// =============================================================================

fn event_callback(shared: &Arc<SandboxShared>, fn_ptr: FnPtr) -> EventCallback {
    let shared = shared.clone();
    Arc::new(move |value: &Value| {
        shared.invoke(&fn_ptr, (to_dyn(value),));
    })
}

fn message_callback(shared: &Arc<SandboxShared>, fn_ptr: FnPtr) -> MessageCallback {
    let shared = shared.clone();
    Arc::new(move |message: &Value| {
        shared.invoke(&fn_ptr, (to_dyn(message),));
    })
}

fn position_callback(shared: &Arc<SandboxShared>, fn_ptr: FnPtr) -> PositionCallback {
    let shared = shared.clone();
    Arc::new(move |position| {
        shared.invoke(&fn_ptr, (to_dyn(position),));
    })
}

fn sensor_callback(shared: &Arc<SandboxShared>, fn_ptr: FnPtr) -> SensorCallback {
    let shared = shared.clone();
    Arc::new(move |sample: &Value| {
        shared.invoke(&fn_ptr, (to_dyn(sample),));
    })
}

// =============================================================================
// WIDGET
// =============================================================================

#[allow(clippy::too_many_lines)]
fn register_widget(engine: &mut Engine, shared: &Arc<SandboxShared>) {
    let mut module = Module::new();

    {
        let shared = shared.clone();
        module.set_native_fn("get", move |id: &str| {
            let widget = shared.caps.widget.get(id);
            Ok(opt_to_dyn(widget.and_then(|w| serde_json::to_value(w).ok())))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("get_value", move |id: &str| {
            Ok(opt_to_dyn(shared.caps.widget.get_value(id)))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("set_value", move |id: &str, value: Dynamic| {
            shared.caps.widget.set_value(id, dyn_to_value(&value)?);
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("get_text", move |id: &str| {
            Ok(shared
                .caps
                .widget
                .get_text(id)
                .map_or(Dynamic::UNIT, Dynamic::from))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("set_text", move |id: &str, text: &str| {
            shared.caps.widget.set_text(id, text);
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("show", move |id: &str| {
            shared.caps.widget.show(id);
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("hide", move |id: &str| {
            shared.caps.widget.hide(id);
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("set_position", move |id: &str, x: Dynamic, y: Dynamic| {
            shared.caps.widget.set_position(id, num(&x)?, num(&y)?);
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("move", move |id: &str, x: Dynamic, y: Dynamic| {
            shared.caps.widget.set_position(id, num(&x)?, num(&y)?);
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("set_size", move |id: &str, width: Dynamic, height: Dynamic| {
            shared.caps.widget.set_size(id, num(&width)?, num(&height)?);
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("resize", move |id: &str, width: Dynamic, height: Dynamic| {
            shared.caps.widget.set_size(id, num(&width)?, num(&height)?);
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("set_rotation", move |id: &str, degrees: Dynamic| {
            shared.caps.widget.set_rotation(id, num(&degrees)?);
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("get_position", move |id: &str| {
            Ok(shared
                .caps
                .widget
                .get_position(id)
                .as_ref()
                .map_or(Dynamic::UNIT, to_dyn))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("get_size", move |id: &str| {
            Ok(shared
                .caps
                .widget
                .get_size(id)
                .as_ref()
                .map_or(Dynamic::UNIT, to_dyn))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("get_rotation", move |id: &str| {
            Ok(shared
                .caps
                .widget
                .get_rotation(id)
                .map_or(Dynamic::UNIT, Dynamic::from))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("set_config", move |id: &str, key: &str, value: Dynamic| {
            shared.caps.widget.set_config(id, key, dyn_to_value(&value)?);
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("get_config", move |id: &str| {
            Ok(opt_to_dyn(shared.caps.widget.get_config(id).map(Value::Object)))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("get_config", move |id: &str, key: &str| {
            Ok(opt_to_dyn(shared.caps.widget.get_config_key(id, key)))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("on", move |id: &str, event: &str, callback: FnPtr| {
            let unsubscribe = shared.caps.widget.on(id, event, event_callback(&shared, callback));
            Ok(shared.store_subscription(unsubscribe))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("once", move |id: &str, event: &str, callback: FnPtr| {
            let unsubscribe = shared.caps.widget.once(id, event, event_callback(&shared, callback));
            Ok(shared.store_subscription(unsubscribe))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("off", move |id: &str| {
            shared.caps.widget.off(id);
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("off", move |id: &str, event: &str| {
            shared.caps.widget.off_event(id, event);
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("unsubscribe", move |token: i64| {
            shared.drop_subscription(token);
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("emit", move |id: &str, event: &str| {
            shared.caps.widget.emit(id, event, &Value::Null);
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("emit", move |id: &str, event: &str, value: Dynamic| {
            shared.caps.widget.emit(id, event, &dyn_to_value(&value)?);
            Ok(())
        });
    }

    engine.register_static_module("widget", module.into());
}

// =============================================================================
// WEBSOCKET
// =============================================================================

fn register_ws(engine: &mut Engine, shared: &Arc<SandboxShared>) {
    let mut module = Module::new();

    {
        let shared = shared.clone();
        module.set_native_fn("send", move |target: &str, payload: Dynamic| {
            Ok(shared.caps.ws.send(target, &dyn_to_value(&payload)?))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("on_message", move |callback: FnPtr| {
            let unsubscribe = shared.caps.ws.on_message(message_callback(&shared, callback));
            Ok(shared.store_subscription(unsubscribe))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("connect", move |url: &str| {
            block_on(&shared, shared.caps.ws.connect(url, None))?.map_err(runtime_err)
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("connect", move |url: &str, callback: FnPtr| {
            let handler = Some(message_callback(&shared, callback));
            block_on(&shared, shared.caps.ws.connect(url, handler))?.map_err(runtime_err)
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("send_to", move |url: &str, data: Dynamic| {
            Ok(shared.caps.ws.send_to(url, &dyn_to_value(&data)?))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("disconnect", move |url: &str| {
            shared.caps.ws.disconnect(url);
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("is_connected", move |url: &str| {
            Ok(shared.caps.ws.is_connected(url))
        });
    }

    engine.register_static_module("ws", module.into());
}

// =============================================================================
// STORAGE
// =============================================================================

fn register_storage(engine: &mut Engine, shared: &Arc<SandboxShared>) {
    let mut module = Module::new();

    {
        let shared = shared.clone();
        module.set_native_fn("set", move |key: &str, value: Dynamic| {
            shared.caps.storage.set(key, &dyn_to_value(&value)?);
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("get", move |key: &str| Ok(opt_to_dyn(shared.caps.storage.get(key))));
    }
    {
        let shared = shared.clone();
        module.set_native_fn("remove", move |key: &str| {
            shared.caps.storage.remove(key);
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("clear", move || {
            shared.caps.storage.clear();
            Ok(())
        });
    }

    engine.register_static_module("storage", module.into());
}

// =============================================================================
// DATABASE
// =============================================================================

fn register_db(engine: &mut Engine, shared: &Arc<SandboxShared>) {
    let mut module = Module::new();

    {
        let shared = shared.clone();
        module.set_native_fn("save", move |key: &str, value: Dynamic| {
            let value = dyn_to_value(&value)?;
            block_on(&shared, shared.caps.database.save(key, value))?.map_err(runtime_err)?;
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("load", move |key: &str| {
            let value = block_on(&shared, shared.caps.database.load(key))?.map_err(runtime_err)?;
            Ok(opt_to_dyn(value))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("remove", move |key: &str| {
            block_on(&shared, shared.caps.database.remove(key))?.map_err(runtime_err)?;
            Ok(())
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("list", move || {
            let keys = block_on(&shared, shared.caps.database.list())?.map_err(runtime_err)?;
            Ok(to_dyn(&keys))
        });
    }

    engine.register_static_module("db", module.into());
}

// =============================================================================
// CONTEXT
// =============================================================================

fn register_context(engine: &mut Engine, shared: &Arc<SandboxShared>) {
    let mut module = Module::new();

    {
        let shared = shared.clone();
        module.set_native_fn("user", move || {
            Ok(shared.caps.context.user().map_or(Dynamic::UNIT, to_dyn))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("device", move || Ok(to_dyn(&shared.caps.context.device())));
    }
    {
        let shared = shared.clone();
        module.set_native_fn("dashboard_id", move || {
            Ok(shared
                .caps
                .context
                .dashboard_id()
                .map_or(Dynamic::UNIT, |id| Dynamic::from(id.to_string())))
        });
    }

    engine.register_static_module("context", module.into());
}

// =============================================================================
// LOCATION
// =============================================================================

fn register_location(engine: &mut Engine, shared: &Arc<SandboxShared>) {
    let mut module = Module::new();

    {
        let shared = shared.clone();
        module.set_native_fn("is_supported", move || Ok(shared.caps.location.is_supported()));
    }
    {
        let shared = shared.clone();
        module.set_native_fn("current_position", move || {
            let position = block_on(&shared, shared.caps.location.get_current_position(None))?
                .map_err(runtime_err)?;
            Ok(to_dyn(&position))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("watch_position", move |callback: FnPtr| {
            let unsubscribe = shared
                .caps
                .location
                .watch_position(position_callback(&shared, callback), None)
                .map_err(runtime_err)?;
            Ok(shared.store_subscription(unsubscribe))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("clear_watch", move |token: i64| {
            shared.drop_subscription(token);
            Ok(())
        });
    }

    engine.register_static_module("location", module.into());
}

// =============================================================================
// HTTP
// =============================================================================

fn register_http(engine: &mut Engine, shared: &Arc<SandboxShared>) {
    let mut module = Module::new();

    {
        let shared = shared.clone();
        module.set_native_fn("get", move |url: &str| {
            let body = block_on(&shared, shared.caps.http.get(url))?.map_err(runtime_err)?;
            Ok(to_dyn(&body))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("post", move |url: &str| {
            let body = block_on(&shared, shared.caps.http.post(url, None))?.map_err(runtime_err)?;
            Ok(to_dyn(&body))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("post", move |url: &str, payload: Dynamic| {
            let payload = dyn_to_value(&payload)?;
            let body =
                block_on(&shared, shared.caps.http.post(url, Some(payload)))?.map_err(runtime_err)?;
            Ok(to_dyn(&body))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("put", move |url: &str| {
            let body = block_on(&shared, shared.caps.http.put(url, None))?.map_err(runtime_err)?;
            Ok(to_dyn(&body))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("put", move |url: &str, payload: Dynamic| {
            let payload = dyn_to_value(&payload)?;
            let body =
                block_on(&shared, shared.caps.http.put(url, Some(payload)))?.map_err(runtime_err)?;
            Ok(to_dyn(&body))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("delete", move |url: &str| {
            let body = block_on(&shared, shared.caps.http.delete(url))?.map_err(runtime_err)?;
            Ok(to_dyn(&body))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("request", move |method: &str, url: &str| {
            let body = block_on(&shared, shared.caps.http.request_named(method, url, None))?
                .map_err(runtime_err)?;
            Ok(to_dyn(&body))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("request", move |method: &str, url: &str, payload: Dynamic| {
            let payload = dyn_to_value(&payload)?;
            let body = block_on(&shared, shared.caps.http.request_named(method, url, Some(payload)))?
                .map_err(runtime_err)?;
            Ok(to_dyn(&body))
        });
    }

    engine.register_static_module("http", module.into());
}

// =============================================================================
// DEVICE
// =============================================================================

fn register_device(engine: &mut Engine, shared: &Arc<SandboxShared>) {
    let mut module = Module::new();

    {
        let shared = shared.clone();
        module.set_native_fn("get_devices", move || {
            let devices = block_on(&shared, shared.caps.device.get_devices())?.map_err(runtime_err)?;
            Ok(to_dyn(&devices))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("get_device_data", move |device_id: &str| {
            let readings = block_on(&shared, shared.caps.device.get_device_data(device_id, None))?
                .map_err(runtime_err)?;
            Ok(to_dyn(&readings))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("get_device_data", move |device_id: &str, limit: i64| {
            let readings =
                block_on(&shared, shared.caps.device.get_device_data(device_id, Some(limit)))?
                    .map_err(runtime_err)?;
            Ok(to_dyn(&readings))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("send_command", move |device_id: &str, command: Dynamic| {
            Ok(shared.caps.device.send_command(device_id, dyn_to_value(&command)?))
        });
    }

    engine.register_static_module("device", module.into());
}

// =============================================================================
// SENSOR / USB
// =============================================================================

fn parse_sensor(name: &str) -> Option<SensorKind> {
    let kind = name.parse().ok();
    if kind.is_none() {
        warn!(sensor = name, "unknown sensor kind");
    }
    kind
}

fn register_sensor(engine: &mut Engine, shared: &Arc<SandboxShared>) {
    let mut module = Module::new();

    {
        let shared = shared.clone();
        module.set_native_fn("is_supported", move |name: &str| {
            Ok(parse_sensor(name).is_some_and(|kind| shared.caps.sensor.is_supported(kind)))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("read", move |name: &str| {
            let sample = parse_sensor(name).and_then(|kind| shared.caps.sensor.read(kind));
            Ok(opt_to_dyn(sample))
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("watch", move |name: &str, callback: FnPtr| {
            let Some(kind) = parse_sensor(name) else {
                return Ok(Dynamic::UNIT);
            };
            match shared.caps.sensor.watch(kind, sensor_callback(&shared, callback)) {
                Some(unsubscribe) => Ok(Dynamic::from(shared.store_subscription(unsubscribe))),
                None => Ok(Dynamic::UNIT),
            }
        });
    }
    {
        let shared = shared.clone();
        module.set_native_fn("clear_watch", move |token: i64| {
            shared.drop_subscription(token);
            Ok(())
        });
    }

    engine.register_static_module("sensor", module.into());
}

fn register_usb(engine: &mut Engine, shared: &Arc<SandboxShared>) {
    let mut module = Module::new();

    {
        let shared = shared.clone();
        module.set_native_fn("is_supported", move || Ok(shared.caps.usb.is_supported()));
    }
    {
        let shared = shared.clone();
        module.set_native_fn("devices", move || Ok(to_dyn(&shared.caps.usb.devices())));
    }

    engine.register_static_module("usb", module.into());
}

// =============================================================================
// CONSOLE
// =============================================================================

fn console_entry(shared: &SandboxShared, level: ConsoleLevel, args: &[Dynamic]) {
    let message = args
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    let values: Vec<Value> = args
        .iter()
        .map(|d| rhai::serde::from_dynamic(d).unwrap_or(Value::Null))
        .collect();
    shared.console(level, &message, &values);
}

fn register_console(engine: &mut Engine, shared: &Arc<SandboxShared>) {
    let mut module = Module::new();

    for (name, level) in [
        ("log", ConsoleLevel::Log),
        ("warn", ConsoleLevel::Warn),
        ("error", ConsoleLevel::Error),
        ("info", ConsoleLevel::Info),
    ] {
        {
            let shared = shared.clone();
            module.set_native_fn(name, move |arg: Dynamic| {
                console_entry(&shared, level, &[arg]);
                Ok(())
            });
        }
        {
            let shared = shared.clone();
            module.set_native_fn(name, move |a: Dynamic, b: Dynamic| {
                console_entry(&shared, level, &[a, b]);
                Ok(())
            });
        }
        {
            let shared = shared.clone();
            module.set_native_fn(name, move |a: Dynamic, b: Dynamic, c: Dynamic| {
                console_entry(&shared, level, &[a, b, c]);
                Ok(())
            });
        }
    }

    engine.register_static_module("console", module.into());
}

// =============================================================================
// TIMERS
// =============================================================================

fn register_timers(engine: &mut Engine, shared: &Arc<SandboxShared>) {
    {
        let shared = shared.clone();
        engine.register_fn(
            "set_timeout",
            move |callback: FnPtr, ms: i64| -> Result<i64, Box<EvalAltResult>> {
                let Some(handle) = shared.runtime_handle() else {
                    return Err(runtime_err("timers require a tokio runtime host"));
                };
                let id = shared.timers.next();
                let task_shared = shared.clone();
                let task = handle.spawn(async move {
                    tokio::time::sleep(Duration::from_millis(u64::try_from(ms).unwrap_or(0))).await;
                    task_shared.timers.remove(id);
                    task_shared.invoke(&callback, ());
                });
                shared.timers.insert(id, task);
                Ok(id)
            },
        );
    }
    {
        let shared = shared.clone();
        engine.register_fn(
            "set_interval",
            move |callback: FnPtr, ms: i64| -> Result<i64, Box<EvalAltResult>> {
                let Some(handle) = shared.runtime_handle() else {
                    return Err(runtime_err("timers require a tokio runtime host"));
                };
                let id = shared.timers.next();
                let task_shared = shared.clone();
                let period = Duration::from_millis(u64::try_from(ms).unwrap_or(0).max(1));
                let task = handle.spawn(async move {
                    loop {
                        tokio::time::sleep(period).await;
                        task_shared.invoke(&callback, ());
                    }
                });
                shared.timers.insert(id, task);
                Ok(id)
            },
        );
    }
    {
        let shared = shared.clone();
        engine.register_fn("clear_timeout", move |id: i64| {
            shared.timers.cancel(id);
        });
    }
    {
        let shared = shared.clone();
        engine.register_fn("clear_interval", move |id: i64| {
            shared.timers.cancel(id);
        });
    }
}
