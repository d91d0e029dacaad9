//! Widget API — typed read/write access to widget state plus the
//! event-subscription surface.
//!
//! DESIGN
//! ======
//! Every mutation is a dual write: the local widget snapshot is updated in
//! place (so a script that calls `set_value` then `get_value` observes its
//! own write immediately) and a sparse patch is emitted through the matching
//! host callback. Config/value/title/style changes flow through the default
//! update callback; geometry flows through the separate transform callback
//! so the rendering layer can move widgets without a full diff.
//!
//! Value semantics dispatch on [`WidgetKind`]: the kind picks the config key
//! (`state`, `value`, `status`) and the event-emission policy (switch
//! on/off/toggle, range min/max/threshold edge-triggering).
//!
//! ERROR HANDLING
//! ==============
//! Operations referencing an unknown widget id log a warning and no-op; they
//! never panic, so one bad reference cannot abort a script run or an event
//! handler chain.

#[cfg(test)]
#[path = "widget_api_test.rs"]
mod widget_api_test;

use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::events::{EventCallback, Unsubscribe};
use crate::runtime::RuntimeCore;
use crate::widget::{
    CONFIG_VALUE, STYLE_VISIBLE, Point, Size, TransformPatch, Widget, WidgetKind, WidgetPatch,
    coerce_number,
};

// =============================================================================
// EVENT NAMES
// =============================================================================

/// Emitted on every value write.
pub const EVENT_CHANGE: &str = "change";

/// Emitted on every value or config write.
pub const EVENT_UPDATE: &str = "update";

/// Emitted on every switch value write.
pub const EVENT_TOGGLE: &str = "toggle";

/// Emitted when a switch turns on (`true`, `"on"`, `1`).
pub const EVENT_ON: &str = "on";

/// Emitted when a switch turns off (`false`, `"off"`, `0`).
pub const EVENT_OFF: &str = "off";

/// Emitted when a range value reaches its floor from above.
pub const EVENT_MIN: &str = "min";

/// Emitted when a range value reaches its ceiling from below.
pub const EVENT_MAX: &str = "max";

/// Emitted when a range value crosses its configured threshold.
pub const EVENT_THRESHOLD: &str = "threshold";

/// Emitted when a widget is shown.
pub const EVENT_VISIBLE: &str = "visible";

/// Emitted when a widget is hidden.
pub const EVENT_HIDDEN: &str = "hidden";

// =============================================================================
// FACADE
// =============================================================================

/// Widget control facade. Cheap to clone; clones share the runtime core.
#[derive(Clone)]
pub struct WidgetApi {
    core: Arc<RuntimeCore>,
}

/// Range bounds captured while the store lock is held, so edge detection
/// works on a consistent before/after pair.
struct RangeBounds {
    min: f64,
    max: f64,
    threshold: Option<f64>,
}

impl WidgetApi {
    pub(crate) fn new(core: Arc<RuntimeCore>) -> Self {
        Self { core }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Return a clone of the widget record, or `None` for an unknown id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Widget> {
        self.core.store.lock().get(id).cloned()
    }

    /// Read a widget's value through its kind's config key.
    ///
    /// Text inputs fall back to their configured default, then to the empty
    /// string. Unknown widget ids log a warning and return `None`.
    #[must_use]
    pub fn get_value(&self, id: &str) -> Option<Value> {
        let store = self.core.store.lock();
        let Some(widget) = store.get(id) else {
            warn!(widget_id = id, "get_value: unknown widget");
            return None;
        };
        match widget.kind {
            WidgetKind::TextInput => widget
                .config
                .get(CONFIG_VALUE)
                .cloned()
                .or_else(|| widget.config_view().text_input_default().cloned())
                .or_else(|| Some(Value::String(String::new()))),
            kind => widget.config.get(kind.value_key()).cloned(),
        }
    }

    /// Read a widget's display text. Labels prefer their `config.value`
    /// (stringified) over the title; every other kind returns the title.
    #[must_use]
    pub fn get_text(&self, id: &str) -> Option<String> {
        let store = self.core.store.lock();
        let Some(widget) = store.get(id) else {
            warn!(widget_id = id, "get_text: unknown widget");
            return None;
        };
        if widget.kind == WidgetKind::Label {
            if let Some(value) = widget.config.get(CONFIG_VALUE).filter(|v| !v.is_null()) {
                return Some(stringify(value));
            }
        }
        Some(widget.title.clone())
    }

    /// Current position, read from the local snapshot. No event emission.
    #[must_use]
    pub fn get_position(&self, id: &str) -> Option<Point> {
        self.core.store.lock().get(id).map(|w| w.position)
    }

    /// Current size, read from the local snapshot. No event emission.
    #[must_use]
    pub fn get_size(&self, id: &str) -> Option<Size> {
        self.core.store.lock().get(id).map(|w| w.size)
    }

    /// Current rotation in degrees, if the widget is rotated.
    #[must_use]
    pub fn get_rotation(&self, id: &str) -> Option<f64> {
        self.core.store.lock().get(id).and_then(|w| w.rotation)
    }

    /// The whole config bag, or `None` for an unknown id.
    #[must_use]
    pub fn get_config(&self, id: &str) -> Option<Map<String, Value>> {
        self.core.store.lock().get(id).map(|w| w.config.clone())
    }

    /// A single config field, or `None` when absent.
    #[must_use]
    pub fn get_config_key(&self, id: &str, key: &str) -> Option<Value> {
        self.core.store.lock().get(id).and_then(|w| w.config.get(key).cloned())
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Write a widget's value through its kind's config key.
    ///
    /// Side effects, in order: the default update callback fires with the
    /// merged config and the new top-level value; `change` and `update`
    /// events fire; switches additionally fire `toggle` plus `on`/`off`;
    /// range widgets fire `min`/`max`/`threshold` edge events computed from
    /// the before/after value pair.
    pub fn set_value(&self, id: &str, value: Value) {
        let (kind, old, bounds, config) = {
            let mut store = self.core.store.lock();
            let Some(widget) = store.get_mut(id) else {
                warn!(widget_id = id, "set_value: unknown widget");
                return;
            };
            let kind = widget.kind;
            let key = kind.value_key();
            let old = widget.config.get(key).cloned();
            widget.config.insert(key.to_owned(), value.clone());

            let bounds = kind.is_range().then(|| {
                let view = widget.config_view();
                RangeBounds {
                    min: view.min_value(),
                    max: view.max_value(),
                    threshold: view.threshold(),
                }
            });
            (kind, old, bounds, widget.config.clone())
        };

        self.emit_update(
            id,
            WidgetPatch { config: Some(config), value: Some(value.clone()), ..WidgetPatch::default() },
        );

        self.core.bus.trigger(id, EVENT_CHANGE, &value);
        self.core.bus.trigger(id, EVENT_UPDATE, &value);

        if kind == WidgetKind::Switch {
            self.core.bus.trigger(id, EVENT_TOGGLE, &value);
            match switch_state(&value) {
                Some(true) => self.core.bus.trigger(id, EVENT_ON, &value),
                Some(false) => self.core.bus.trigger(id, EVENT_OFF, &value),
                None => {}
            }
        }

        if let Some(bounds) = bounds {
            self.emit_range_edges(id, old.as_ref(), &value, &bounds);
        }
    }

    /// Write a widget's display title.
    pub fn set_text(&self, id: &str, text: impl Into<String>) {
        let text = text.into();
        {
            let mut store = self.core.store.lock();
            let Some(widget) = store.get_mut(id) else {
                warn!(widget_id = id, "set_text: unknown widget");
                return;
            };
            widget.title = text.clone();
        }
        self.emit_update(id, WidgetPatch { title: Some(text), ..WidgetPatch::default() });
    }

    /// Make a widget visible. Emits a `visible` event.
    pub fn show(&self, id: &str) {
        self.set_visibility(id, true, EVENT_VISIBLE);
    }

    /// Hide a widget. Emits a `hidden` event.
    pub fn hide(&self, id: &str) {
        self.set_visibility(id, false, EVENT_HIDDEN);
    }

    /// Merge one key into a widget's config. Fires the default update
    /// callback with the full merged config and an `update` event carrying
    /// `{configKey, value}`.
    pub fn set_config(&self, id: &str, key: impl Into<String>, value: Value) {
        let key = key.into();
        let config = {
            let mut store = self.core.store.lock();
            let Some(widget) = store.get_mut(id) else {
                warn!(widget_id = id, "set_config: unknown widget");
                return;
            };
            widget.config.insert(key.clone(), value.clone());
            widget.config.clone()
        };
        self.emit_update(id, WidgetPatch { config: Some(config), ..WidgetPatch::default() });
        self.core
            .bus
            .trigger(id, EVENT_UPDATE, &json!({ "configKey": key, "value": value }));
    }

    // -------------------------------------------------------------------------
    // Geometry — routed through the transform callback
    // -------------------------------------------------------------------------

    /// Move a widget. Routed through the transform callback, not the
    /// default one.
    pub fn set_position(&self, id: &str, x: f64, y: f64) {
        let position = Point { x, y };
        if !self.with_widget(id, "set_position", |w| w.position = position) {
            return;
        }
        self.emit_transform(
            id,
            TransformPatch { position: Some(position), ..TransformPatch::default() },
        );
    }

    /// Alias for [`WidgetApi::set_position`].
    pub fn move_to(&self, id: &str, x: f64, y: f64) {
        self.set_position(id, x, y);
    }

    /// Resize a widget. Routed through the transform callback.
    pub fn set_size(&self, id: &str, width: f64, height: f64) {
        let size = Size { width, height };
        if !self.with_widget(id, "set_size", |w| w.size = size) {
            return;
        }
        self.emit_transform(id, TransformPatch { size: Some(size), ..TransformPatch::default() });
    }

    /// Alias for [`WidgetApi::set_size`].
    pub fn resize(&self, id: &str, width: f64, height: f64) {
        self.set_size(id, width, height);
    }

    /// Rotate a widget, in degrees clockwise. Routed through the transform
    /// callback.
    pub fn set_rotation(&self, id: &str, degrees: f64) {
        if !self.with_widget(id, "set_rotation", |w| w.rotation = Some(degrees)) {
            return;
        }
        self.emit_transform(
            id,
            TransformPatch { rotation: Some(degrees), ..TransformPatch::default() },
        );
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    /// Subscribe to an event on a widget. Returns an unsubscribe closure.
    pub fn on(&self, id: &str, event: &str, callback: EventCallback) -> Unsubscribe {
        self.core.bus.on(id, event, callback)
    }

    /// Subscribe to the next occurrence of an event only.
    pub fn once(&self, id: &str, event: &str, callback: EventCallback) -> Unsubscribe {
        self.core.bus.once(id, event, callback)
    }

    /// Remove all subscriptions for a widget.
    pub fn off(&self, id: &str) {
        self.core.bus.off_widget(id);
    }

    /// Remove all subscriptions for one event on a widget. Removing a single
    /// callback is done through the closure returned by `on`/`once`.
    pub fn off_event(&self, id: &str, event: &str) {
        self.core.bus.off_event(id, event);
    }

    /// Manually dispatch an event, for script-synthesized custom events.
    pub fn emit(&self, id: &str, event: &str, value: &Value) {
        self.core.bus.trigger(id, event, value);
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Run a mutation against a widget, warning and returning `false` when
    /// the id is unknown. The store lock is released before any callback.
    fn with_widget(&self, id: &str, op: &str, mutate: impl FnOnce(&mut Widget)) -> bool {
        let mut store = self.core.store.lock();
        match store.get_mut(id) {
            Some(widget) => {
                mutate(widget);
                true
            }
            None => {
                warn!(widget_id = id, operation = op, "unknown widget");
                false
            }
        }
    }

    fn set_visibility(&self, id: &str, visible: bool, event: &str) {
        let style = {
            let mut store = self.core.store.lock();
            let Some(widget) = store.get_mut(id) else {
                warn!(widget_id = id, "set_visibility: unknown widget");
                return;
            };
            widget.style.insert(STYLE_VISIBLE.to_owned(), Value::Bool(visible));
            widget.style.clone()
        };
        self.emit_update(id, WidgetPatch { style: Some(style), ..WidgetPatch::default() });
        self.core.bus.trigger(id, event, &Value::Bool(true));
    }

    fn emit_update(&self, id: &str, patch: WidgetPatch) {
        if let Some(on_update) = &self.core.on_update {
            on_update(id, patch);
        }
    }

    fn emit_transform(&self, id: &str, patch: TransformPatch) {
        if let Some(on_transform) = &self.core.on_transform {
            on_transform(id, patch);
        } else {
            debug!(widget_id = id, "transform change with no transform callback");
        }
    }

    /// Edge-triggered range events, computed from the before/after pair
    /// captured inside the mutation. Non-numeric endpoints emit nothing.
    fn emit_range_edges(&self, id: &str, old: Option<&Value>, new: &Value, bounds: &RangeBounds) {
        let Some(old_n) = old.and_then(coerce_number) else {
            return;
        };
        let Some(new_n) = coerce_number(new) else {
            return;
        };

        if new_n <= bounds.min && old_n > bounds.min {
            self.core.bus.trigger(id, EVENT_MIN, new);
        }
        if new_n >= bounds.max && old_n < bounds.max {
            self.core.bus.trigger(id, EVENT_MAX, new);
        }
        if let Some(threshold) = bounds.threshold {
            let crossed_up = old_n < threshold && new_n >= threshold;
            let crossed_down = old_n >= threshold && new_n < threshold;
            if crossed_up || crossed_down {
                self.core.bus.trigger(
                    id,
                    EVENT_THRESHOLD,
                    &json!({ "value": new, "threshold": threshold }),
                );
            }
        }
    }
}

/// Interpret a value as a switch state: `true`/`"on"`/`1` is on,
/// `false`/`"off"`/`0` is off, anything else is neither.
fn switch_state(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.as_str() {
            "on" => Some(true),
            "off" => Some(false),
            _ => None,
        },
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Display form of a JSON value: strings verbatim, everything else as JSON.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
