//! Wire shapes for the device WebSocket channel.
//!
//! DESIGN
//! ======
//! The device channel speaks flat JSON objects. Inbound telemetry arrives as
//! either `{payload: {widgetId, value}}` or the flat `{widgetId, value}`;
//! both route to the same widget by id. Outbound traffic wraps a payload in
//! a `{targetId, payload}` envelope; device commands additionally carry a
//! `commands` list inside the payload. The runtime never inspects payload
//! fields beyond the ones named here.

use serde_json::{Value, json};

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

/// Wire key addressing a widget.
pub const FIELD_WIDGET_ID: &str = "widgetId";

/// Wire key carrying a telemetry value.
pub const FIELD_VALUE: &str = "value";

/// Wire key wrapping a nested payload object.
pub const FIELD_PAYLOAD: &str = "payload";

/// Wire key addressing the device channel target.
pub const FIELD_TARGET_ID: &str = "targetId";

/// Wire key carrying a device command list.
pub const FIELD_COMMANDS: &str = "commands";

// =============================================================================
// INBOUND
// =============================================================================

/// Extract a widget update from an inbound device-channel message.
///
/// Supports both wire shapes: `{payload: {widgetId, value}}` and the flat
/// `{widgetId, value}`. Returns `None` for anything else.
#[must_use]
pub fn widget_update(message: &Value) -> Option<(&str, &Value)> {
    let body = message.get(FIELD_PAYLOAD).unwrap_or(message);
    let widget_id = body.get(FIELD_WIDGET_ID)?.as_str()?;
    let value = body.get(FIELD_VALUE)?;
    Some((widget_id, value))
}

// =============================================================================
// OUTBOUND
// =============================================================================

/// Wrap a payload in the outbound `{targetId, payload}` envelope.
#[must_use]
pub fn envelope(target_id: &str, payload: Value) -> Value {
    json!({ FIELD_TARGET_ID: target_id, FIELD_PAYLOAD: payload })
}

/// Build a device-command payload: `{widgetId?, commands: [...]}`.
#[must_use]
pub fn command_payload(widget_id: Option<&str>, commands: Vec<Value>) -> Value {
    let mut payload = json!({ FIELD_COMMANDS: commands });
    if let Some(id) = widget_id {
        payload[FIELD_WIDGET_ID] = json!(id);
    }
    payload
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_inbound_shape() {
        let msg = json!({"payload": {"widgetId": "g1", "value": 42}});
        let (id, value) = widget_update(&msg).unwrap();
        assert_eq!(id, "g1");
        assert_eq!(value, &json!(42));
    }

    #[test]
    fn flat_inbound_shape() {
        let msg = json!({"widgetId": "g1", "value": "on"});
        let (id, value) = widget_update(&msg).unwrap();
        assert_eq!(id, "g1");
        assert_eq!(value, &json!("on"));
    }

    #[test]
    fn malformed_inbound_is_none() {
        assert!(widget_update(&json!({"value": 1})).is_none());
        assert!(widget_update(&json!({"widgetId": "g1"})).is_none());
        assert!(widget_update(&json!({"widgetId": 7, "value": 1})).is_none());
        assert!(widget_update(&json!("text")).is_none());
    }

    #[test]
    fn command_envelope_shape() {
        let command = json!({"command": "set", "actions": [{"action": "power", "params": {"on": true}}]});
        let msg = envelope("dev-1", command_payload(None, vec![command]));

        assert_eq!(msg[FIELD_TARGET_ID], json!("dev-1"));
        let commands = msg[FIELD_PAYLOAD][FIELD_COMMANDS].as_array().unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0]["command"], json!("set"));
    }

    #[test]
    fn command_payload_with_widget_id() {
        let payload = command_payload(Some("sw1"), vec![]);
        assert_eq!(payload[FIELD_WIDGET_ID], json!("sw1"));
    }
}
