//! Widget model: dashboard widgets, their value semantics, and the in-memory store.
//!
//! This module defines the core data types the runtime manipulates (`Widget`,
//! `WidgetKind`), the sparse update payloads emitted toward the host
//! (`WidgetPatch` for config/value/title/style, `TransformPatch` for
//! geometry), a typed accessor for the open-ended `config` JSON bag
//! (`ConfigView`), and the runtime store that owns the live widget snapshot
//! (`WidgetStore`).
//!
//! Data flows into this layer from the host at construction (widget list
//! deserialized from the saved dashboard) and from the Widget API
//! (mutations). The host reads nothing back directly; it consumes the
//! patches emitted through the update callbacks.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

/// Config key holding a switch/button on-off state.
pub const CONFIG_STATE: &str = "state";

/// Config key holding a slider/gauge/text-input/generic value.
pub const CONFIG_VALUE: &str = "value";

/// Config key holding a status widget's status tag.
pub const CONFIG_STATUS: &str = "status";

/// Config key for a text input's fallback value.
pub const CONFIG_TEXT_INPUT_DEFAULT: &str = "textInputDefaultValue";

/// Config key for a range widget's floor. Defaults to 0 when absent.
pub const CONFIG_MIN_VALUE: &str = "minValue";

/// Config key for a range widget's ceiling. Defaults to 100 when absent.
pub const CONFIG_MAX_VALUE: &str = "maxValue";

/// Config key for a range widget's threshold line. No default.
pub const CONFIG_THRESHOLD: &str = "threshold";

/// Style key controlling widget visibility.
pub const STYLE_VISIBLE: &str = "visible";

// =============================================================================
// TYPES
// =============================================================================

/// The kind of a dashboard widget. Selects value semantics in the Widget API.
///
/// Unknown type tags deserialize to [`WidgetKind::Generic`] so a dashboard
/// saved by a newer builder still loads with generic value semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WidgetKind {
    /// On/off toggle. Value lives in `config.state`.
    Switch,
    /// Momentary push button. Value lives in `config.state`.
    Button,
    /// Continuous range input. Value lives in `config.value`.
    Slider,
    /// Read-only range display. Value lives in `config.value`.
    Gauge,
    /// Discrete status indicator. Value lives in `config.status`.
    Status,
    /// Free-text input. Value lives in `config.value` with a configured fallback.
    TextInput,
    /// Static text whose displayed text prefers `config.value` over `title`.
    Label,
    /// Any widget type the runtime has no special semantics for.
    #[serde(other)]
    Generic,
}

impl WidgetKind {
    /// The config key this kind reads and writes its value through.
    #[must_use]
    pub fn value_key(self) -> &'static str {
        match self {
            WidgetKind::Switch | WidgetKind::Button => CONFIG_STATE,
            WidgetKind::Status => CONFIG_STATUS,
            WidgetKind::Slider
            | WidgetKind::Gauge
            | WidgetKind::TextInput
            | WidgetKind::Label
            | WidgetKind::Generic => CONFIG_VALUE,
        }
    }

    /// Kinds with min/max/threshold edge-triggered events.
    #[must_use]
    pub fn is_range(self) -> bool {
        matches!(self, WidgetKind::Slider | WidgetKind::Gauge)
    }
}

/// Position of a widget on the dashboard canvas, in canvas units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Size of a widget's bounding box, in canvas units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

/// A dashboard widget as stored in the runtime and on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Widget {
    /// Unique identifier within a dashboard page.
    pub id: String,
    /// Kind tag selecting value semantics.
    #[serde(rename = "type")]
    pub kind: WidgetKind,
    /// Display title; doubles as the textual value for non-valued widgets.
    #[serde(default)]
    pub title: String,
    /// Open-ended per-kind configuration (value fields, ranges, behavior).
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Open-ended style bag. `visible` controls rendering.
    #[serde(default)]
    pub style: Map<String, Value>,
    /// Top-left corner of the bounding box.
    #[serde(default)]
    pub position: Point,
    /// Bounding box size.
    #[serde(default)]
    pub size: Size,
    /// Clockwise rotation in degrees. Absent means unrotated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
}

impl Widget {
    /// Create a widget of the given kind with empty config and style.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: WidgetKind) -> Self {
        Self {
            id: id.into(),
            kind,
            title: String::new(),
            config: Map::new(),
            style: Map::new(),
            position: Point::default(),
            size: Size::default(),
            rotation: None,
        }
    }

    /// Typed view over this widget's `config` bag.
    #[must_use]
    pub fn config_view(&self) -> ConfigView<'_> {
        ConfigView::new(&self.config)
    }
}

// =============================================================================
// PATCHES
// =============================================================================

/// Sparse update toward the host's default update callback.
/// Only present fields are applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WidgetPatch {
    /// Full merged config after the mutation, if config changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Map<String, Value>>,
    /// The new top-level value, for renderers that bind on it directly.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// New display title, if it changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Full merged style after the mutation, if style changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<Map<String, Value>>,
}

/// Sparse geometry update toward the host's transform callback. Kept separate
/// from [`WidgetPatch`] so the rendering layer can apply geometry changes
/// without a full widget diff.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TransformPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Point>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
}

// =============================================================================
// CONFIG VIEW
// =============================================================================

/// Typed access to well-known fields of a widget `config` bag.
pub struct ConfigView<'a> {
    map: &'a Map<String, Value>,
}

impl<'a> ConfigView<'a> {
    /// Wrap a reference to a `config` map for typed access.
    #[must_use]
    pub fn new(map: &'a Map<String, Value>) -> Self {
        Self { map }
    }

    /// Range floor. Defaults to `0.0` when absent or non-numeric.
    #[must_use]
    pub fn min_value(&self) -> f64 {
        self.number(CONFIG_MIN_VALUE).unwrap_or(0.0)
    }

    /// Range ceiling. Defaults to `100.0` when absent or non-numeric.
    #[must_use]
    pub fn max_value(&self) -> f64 {
        self.number(CONFIG_MAX_VALUE).unwrap_or(100.0)
    }

    /// Threshold line, if configured.
    #[must_use]
    pub fn threshold(&self) -> Option<f64> {
        self.number(CONFIG_THRESHOLD)
    }

    /// Text-input fallback value, if configured.
    #[must_use]
    pub fn text_input_default(&self) -> Option<&Value> {
        self.map.get(CONFIG_TEXT_INPUT_DEFAULT)
    }

    /// A config field coerced to a number. Numeric strings are accepted,
    /// matching what dashboard configuration forms actually save.
    #[must_use]
    pub fn number(&self, key: &str) -> Option<f64> {
        coerce_number(self.map.get(key)?)
    }
}

/// Coerce a JSON value to `f64`. Accepts numbers and numeric strings.
#[must_use]
pub fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// =============================================================================
// STORE
// =============================================================================

/// In-memory store of the runtime's widget snapshot.
///
/// The runtime instance is the sole owner; the host refreshes it wholesale
/// via [`WidgetStore::replace_all`] when its own widget list changes.
pub struct WidgetStore {
    widgets: HashMap<String, Widget>,
}

impl WidgetStore {
    /// Build a store from the host's widget list. Duplicate ids keep the
    /// last occurrence, mirroring how the dashboard JSON is merged.
    #[must_use]
    pub fn from_widgets(widgets: Vec<Widget>) -> Self {
        let mut store = Self { widgets: HashMap::new() };
        store.replace_all(widgets);
        store
    }

    /// Return a reference to a widget by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Widget> {
        self.widgets.get(id)
    }

    /// Return a mutable reference to a widget by id.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Widget> {
        self.widgets.get_mut(id)
    }

    /// Replace the whole snapshot with a fresh widget list.
    pub fn replace_all(&mut self, widgets: Vec<Widget>) {
        self.widgets.clear();
        for widget in widgets {
            self.widgets.insert(widget.id.clone(), widget);
        }
    }

    /// Number of widgets currently in the store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.widgets.len()
    }

    /// Returns `true` if the store contains no widgets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.widgets.is_empty()
    }
}

// =============================================================================
// TESTS
// =============================================================================
