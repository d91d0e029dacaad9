//! Script sandbox — compiles and runs the per-dashboard user script.
//!
//! DESIGN
//! ======
//! The sandbox embeds the Rhai engine. A fresh engine is assembled per
//! execution with every capability facade registered as a static module
//! (`widget::…`, `ws::…`, `storage::…`, `db::…`, `context::…`,
//! `location::…`, `http::…`, `device::…`, `sensor::…`, `usb::…`), plus a
//! `console` module and `set_timeout`/`set_interval` timers. A script can
//! reach nothing except those modules: the capability set IS the sandbox
//! boundary. No instruction budget is enforced — the script author is the
//! dashboard owner, not an untrusted third party.
//!
//! Script closures handed to subscription APIs are kept as `FnPtr`s and
//! called back through the retained engine/AST pair; `teardown` drops that
//! pair, so no script callback can fire after cleanup even if a handler
//! set still holds a wrapper.
//!
//! Script-facing async capabilities (http, db, device history, custom
//! connect) block the executing thread on the host's tokio runtime, so
//! `execute` must run on a multi-thread runtime or a dedicated blocking
//! thread.
//!
//! ERROR HANDLING
//! ==============
//! Compile and top-level runtime errors are logged to both the tracing
//! layer and the console sink, then returned to the host, which decides
//! between aborting the dashboard load and a toast. Errors inside event
//! handlers are logged the same way but stay isolated to the handler.

mod bindings;

#[cfg(test)]
#[path = "sandbox_test.rs"]
mod sandbox_test;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use rhai::{AST, Dynamic, Engine, FnPtr};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::api::database::DatabaseApi;
use crate::api::device::DeviceApi;
use crate::api::http::HttpApi;
use crate::api::location::LocationApi;
use crate::api::sensor::{SensorApi, UsbApi};
use crate::api::storage::StorageApi;
use crate::api::widget_api::WidgetApi;
use crate::api::ws::WsApi;
use crate::context::ContextApi;
use crate::events::Unsubscribe;
use crate::runtime::{ConsoleLevel, ConsoleSink};

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("script compile error: {0}")]
    Compile(String),
    #[error("script runtime error: {0}")]
    Runtime(String),
}

/// The capability facades one script run sees.
pub(crate) struct Capabilities {
    pub(crate) widget: WidgetApi,
    pub(crate) ws: WsApi,
    pub(crate) storage: StorageApi,
    pub(crate) database: DatabaseApi,
    pub(crate) context: ContextApi,
    pub(crate) location: LocationApi,
    pub(crate) http: HttpApi,
    pub(crate) device: DeviceApi,
    pub(crate) sensor: SensorApi,
    pub(crate) usb: UsbApi,
}

/// The engine/AST pair of the currently executed script. Script callbacks
/// resolve against this; dropping it silences them.
#[derive(Clone)]
struct ExecUnit {
    engine: Arc<Engine>,
    ast: Arc<AST>,
}

/// Timer tasks spawned by `set_timeout`/`set_interval`.
#[derive(Default)]
struct TimerRegistry {
    next_id: AtomicI64,
    tasks: Mutex<HashMap<i64, JoinHandle<()>>>,
}

impl TimerRegistry {
    fn next(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn insert(&self, id: i64, task: JoinHandle<()>) {
        self.tasks.lock().insert(id, task);
    }

    fn cancel(&self, id: i64) {
        if let Some(task) = self.tasks.lock().remove(&id) {
            task.abort();
        }
    }

    fn remove(&self, id: i64) {
        self.tasks.lock().remove(&id);
    }

    fn abort_all(&self) {
        for (_, task) in self.tasks.lock().drain() {
            task.abort();
        }
    }
}

/// State shared between the sandbox, the registered bindings, and the
/// callback wrappers they hand out.
pub(crate) struct SandboxShared {
    caps: Capabilities,
    sink: Option<ConsoleSink>,
    exec: Mutex<Option<ExecUnit>>,
    timers: TimerRegistry,
    /// Script-held subscription tokens → unsubscribe closures.
    subscriptions: Mutex<HashMap<i64, Unsubscribe>>,
    next_token: AtomicI64,
    /// Captured at `execute` so timers and async bridges reach the host's
    /// runtime from the script thread.
    handle: Mutex<Option<tokio::runtime::Handle>>,
}

impl SandboxShared {
    fn runtime_handle(&self) -> Option<tokio::runtime::Handle> {
        self.handle.lock().clone()
    }

    fn next_token(&self) -> i64 {
        self.next_token.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn store_subscription(&self, unsubscribe: Unsubscribe) -> i64 {
        let token = self.next_token();
        self.subscriptions.lock().insert(token, unsubscribe);
        token
    }

    fn drop_subscription(&self, token: i64) {
        if let Some(unsubscribe) = self.subscriptions.lock().remove(&token) {
            unsubscribe();
        }
    }

    /// Emit a console entry to the tracing layer and the host sink.
    fn console(&self, level: ConsoleLevel, message: &str, values: &[Value]) {
        match level {
            ConsoleLevel::Error => error!(target: "dashwire::script", "{message}"),
            ConsoleLevel::Warn => warn!(target: "dashwire::script", "{message}"),
            ConsoleLevel::Log | ConsoleLevel::Info => {
                tracing::info!(target: "dashwire::script", "{message}");
            }
        }
        if let Some(sink) = &self.sink {
            sink(level, message, values);
        }
    }

    /// Call a script closure against the retained engine/AST pair. A
    /// dropped pair (post-teardown) silently ignores the call; a handler
    /// error is logged and contained.
    fn invoke(&self, fn_ptr: &FnPtr, args: impl rhai::FuncArgs) {
        let exec = { self.exec.lock().clone() };
        let Some(exec) = exec else {
            return;
        };
        if let Err(e) = fn_ptr.call::<Dynamic>(&exec.engine, &exec.ast, args) {
            error!(error = %e, "script handler failed");
            self.console(ConsoleLevel::Error, &format!("handler error: {e}"), &[]);
        }
    }
}

// =============================================================================
// SANDBOX
// =============================================================================

pub(crate) struct Sandbox {
    shared: Arc<SandboxShared>,
}

impl Sandbox {
    pub(crate) fn new(caps: Capabilities, sink: Option<ConsoleSink>) -> Self {
        Self {
            shared: Arc::new(SandboxShared {
                caps,
                sink,
                exec: Mutex::new(None),
                timers: TimerRegistry::default(),
                subscriptions: Mutex::new(HashMap::new()),
                next_token: AtomicI64::new(0),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Compile and run a script against a freshly assembled engine.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError`] after logging the failure to the tracing
    /// layer and the console sink.
    pub(crate) fn execute(&self, script: &str) -> Result<(), ScriptError> {
        *self.shared.handle.lock() = tokio::runtime::Handle::try_current().ok();

        let mut engine = Engine::new();
        bindings::register_all(&mut engine, &self.shared);
        {
            let shared = self.shared.clone();
            engine.on_print(move |text| {
                shared.console(ConsoleLevel::Log, text, &[]);
            });
        }
        {
            let shared = self.shared.clone();
            engine.on_debug(move |text, _source, _pos| {
                shared.console(ConsoleLevel::Log, text, &[]);
            });
        }

        let ast = match engine.compile(script) {
            Ok(ast) => ast,
            Err(e) => {
                let message = e.to_string();
                error!(error = %message, "script compile failed");
                self.shared
                    .console(ConsoleLevel::Error, &format!("compile error: {message}"), &[]);
                return Err(ScriptError::Compile(message));
            }
        };

        let exec = ExecUnit { engine: Arc::new(engine), ast: Arc::new(ast) };
        // Installed before evaluation: a handler registered and triggered
        // inside the script body must already resolve.
        *self.shared.exec.lock() = Some(exec.clone());

        if let Err(e) = exec.engine.run_ast(&exec.ast) {
            let message = e.to_string();
            error!(error = %message, "script execution failed");
            self.shared
                .console(ConsoleLevel::Error, &format!("script error: {message}"), &[]);
            return Err(ScriptError::Runtime(message));
        }
        Ok(())
    }

    /// Drop the engine/AST pair, abort timers, and forget script-held
    /// subscription tokens. After this, no script callback can fire.
    pub(crate) fn teardown(&self) {
        *self.shared.exec.lock() = None;
        self.shared.timers.abort_all();
        self.shared.subscriptions.lock().clear();
    }
}
