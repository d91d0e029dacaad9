//! Script context — immutable per-run snapshot of user, device, and dashboard.
//!
//! The context is captured at runtime construction and never updated during
//! a run; a new runtime instance must be built to pick up a new session.
//! Device classification is derived from the host-supplied viewport, the
//! same breakpoints the dashboard builder's layout engine uses.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Viewport width below which a device classifies as mobile.
pub const MOBILE_MAX_WIDTH: u32 = 768;

/// Viewport width below which a device classifies as tablet.
pub const TABLET_MAX_WIDTH: u32 = 1024;

// =============================================================================
// TYPES
// =============================================================================

/// The authenticated user a script runs on behalf of.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: Uuid,
    pub email: String,
    pub role: String,
}

/// Coarse device classification by viewport width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Mobile,
    Tablet,
    Desktop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Portrait,
    Landscape,
}

/// Host viewport dimensions and input capability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub touch: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self { width: 1920, height: 1080, touch: false }
    }
}

/// Derived device description exposed to scripts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "type")]
    pub class: DeviceClass,
    pub orientation: Orientation,
    pub touch: bool,
    pub width: u32,
    pub height: u32,
}

impl DeviceInfo {
    /// Classify a viewport: `< 768` mobile, `768–1023` tablet, `≥ 1024` desktop.
    #[must_use]
    pub fn from_viewport(viewport: Viewport) -> Self {
        let class = if viewport.width < MOBILE_MAX_WIDTH {
            DeviceClass::Mobile
        } else if viewport.width < TABLET_MAX_WIDTH {
            DeviceClass::Tablet
        } else {
            DeviceClass::Desktop
        };
        let orientation = if viewport.height > viewport.width {
            Orientation::Portrait
        } else {
            Orientation::Landscape
        };
        Self {
            class,
            orientation,
            touch: viewport.touch,
            width: viewport.width,
            height: viewport.height,
        }
    }
}

/// Immutable per-run snapshot supplied by the host at construction.
#[derive(Debug, Clone, Default)]
pub struct ScriptContext {
    pub user: Option<UserInfo>,
    pub dashboard_id: Option<Uuid>,
    pub viewport: Viewport,
}

// =============================================================================
// FACADE
// =============================================================================

/// Context capability facade handed to the script sandbox.
#[derive(Clone)]
pub struct ContextApi {
    context: ScriptContext,
}

impl ContextApi {
    #[must_use]
    pub fn new(context: ScriptContext) -> Self {
        Self { context }
    }

    /// The user snapshot, or `None` when unauthenticated.
    #[must_use]
    pub fn user(&self) -> Option<&UserInfo> {
        self.context.user.as_ref()
    }

    /// Device classification for the captured viewport.
    #[must_use]
    pub fn device(&self) -> DeviceInfo {
        DeviceInfo::from_viewport(self.context.viewport)
    }

    /// The dashboard this run belongs to, if known.
    #[must_use]
    pub fn dashboard_id(&self) -> Option<Uuid> {
        self.context.dashboard_id
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_breakpoints() {
        let info = DeviceInfo::from_viewport(Viewport { width: 767, height: 900, touch: true });
        assert_eq!(info.class, DeviceClass::Mobile);
        assert_eq!(info.orientation, Orientation::Portrait);

        let info = DeviceInfo::from_viewport(Viewport { width: 768, height: 500, touch: true });
        assert_eq!(info.class, DeviceClass::Tablet);
        assert_eq!(info.orientation, Orientation::Landscape);

        let info = DeviceInfo::from_viewport(Viewport { width: 1024, height: 768, touch: false });
        assert_eq!(info.class, DeviceClass::Desktop);
    }

    #[test]
    fn default_context_is_anonymous_desktop() {
        let api = ContextApi::new(ScriptContext::default());
        assert!(api.user().is_none());
        assert!(api.dashboard_id().is_none());
        assert_eq!(api.device().class, DeviceClass::Desktop);
    }

    #[test]
    fn device_info_serializes_with_type_tag() {
        let info = DeviceInfo::from_viewport(Viewport::default());
        let json = serde_json::to_value(info).unwrap();
        assert_eq!(json.get("type").and_then(|v| v.as_str()), Some("desktop"));
        assert_eq!(json.get("orientation").and_then(|v| v.as_str()), Some("landscape"));
    }
}
