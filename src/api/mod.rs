//! Capability facades exposed to dashboard scripts.
//!
//! Each facade is a thin, cloneable wrapper over shared services injected at
//! runtime construction: the widget store and event bus (`widget_api`), the
//! device WebSocket channel and custom connection pool (`ws`), namespaced
//! local storage (`storage`), the per-dashboard remote key/value store
//! (`database`), geolocation (`location`), plain HTTP (`http`), the device
//! directory (`device`), and host sensors (`sensor`). Facades hold no state
//! of their own beyond what their underlying service owns; the sandbox
//! assembles one set per script run.

pub mod database;
pub mod device;
pub mod http;
pub mod location;
pub mod sensor;
pub mod storage;
pub mod widget_api;
pub mod ws;
