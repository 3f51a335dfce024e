//! Wire message codec.
//!
//! A [`WireMessage`] is a host message stripped down to something that can cross
//! a socket: identifiers, a type tag, and a data tree made only of JSON primitives,
//! objects and arrays. [`to_wire`] builds one from any [`HostMessage`].
//!
//! Sanitization is lossy on purpose. Host data may hold handles to host-only
//! objects (functionalities, widgets); those are dropped from the wire copy unless
//! the object offers a projection. Every drop is traced with its key path so the
//! loss can be found in the logs.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::host::{HostData, HostMessage, HostValue};

/// Correlation token shared by a request and every reply to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(uuid::Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEntry {
    pub source: String,
    pub data: Value,
}

impl ResponseEntry {
    pub fn new(source: impl Into<String>, data: Value) -> Self {
        Self {
            source: source.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub source: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl ErrorEntry {
    pub fn new(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            message: message.into(),
            exception_info: None,
            stack_trace: None,
        }
    }

    /// Build an entry from a handler error, keeping the full cause chain.
    ///
    /// Uses the error's own backtrace when one was captured, otherwise the
    /// backtrace of the point where the error was caught.
    pub fn from_error(source: impl Into<String>, err: &anyhow::Error) -> Self {
        let trace = err.backtrace();
        let stack_trace = match trace.status() {
            BacktraceStatus::Captured => trace.to_string(),
            _ => Backtrace::force_capture().to_string(),
        };
        Self {
            source: source.into(),
            message: err.to_string(),
            exception_info: Some(format!("{err:#}")),
            stack_trace: Some(stack_trace),
        }
    }

    /// Build an entry from a caught panic payload.
    pub fn from_panic(source: impl Into<String>, payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked".to_string()
        };
        Self {
            source: source.into(),
            exception_info: Some(format!("panic: {message}")),
            message,
            stack_trace: Some(Backtrace::force_capture().to_string()),
        }
    }
}

/// Sanitized, transportable projection of a host message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    id: MessageId,
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default)]
    data: Map<String, Value>,
    source_name: String,
    #[serde(default)]
    responses: Vec<ResponseEntry>,
    #[serde(default)]
    errors: Vec<ErrorEntry>,
}

impl WireMessage {
    /// New message originating on this side of the bridge.
    pub fn new(message_type: impl Into<String>, source_name: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            message_type: message_type.into(),
            data: Map::new(),
            source_name: source_name.into(),
            responses: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.data
    }

    pub fn is_type(&self, message_type: &str) -> bool {
        self.message_type == message_type
    }

    pub fn source_is(&self, source_name: &str) -> bool {
        self.source_name == source_name
    }

    pub fn add_response(&mut self, response: ResponseEntry) {
        self.responses.push(response);
    }

    pub fn add_error(&mut self, error: ErrorEntry) {
        self.errors.push(error);
    }

    pub fn responses(&self) -> &[ResponseEntry] {
        &self.responses
    }

    pub fn errors(&self) -> &[ErrorEntry] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Split into accumulated responses and errors, consuming the message.
    pub fn into_outcome(self) -> (Vec<ResponseEntry>, Vec<ErrorEntry>) {
        (self.responses, self.errors)
    }
}

/// Convert a host message into its wire form. Never fails.
pub fn to_wire(message: &dyn HostMessage) -> WireMessage {
    let data = sanitize(message.data());
    tracing::trace!(
        id = %message.id(),
        message_type = message.message_type(),
        keys = data.len(),
        "Converted host message to wire form"
    );
    WireMessage {
        id: message.id(),
        message_type: message.message_type().to_string(),
        data,
        source_name: message.source_name().to_string(),
        responses: Vec::new(),
        errors: Vec::new(),
    }
}

/// Recursively strip everything that cannot cross the wire.
pub fn sanitize(data: &HostData) -> Map<String, Value> {
    sanitize_map("", data)
}

fn sanitize_map(path: &str, data: &HostData) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in data {
        let child = join_path(path, key);
        if let Some(v) = sanitize_value(&child, value) {
            out.insert(key.clone(), v);
        }
    }
    out
}

fn sanitize_value(path: &str, value: &HostValue) -> Option<Value> {
    match value {
        HostValue::Null => Some(Value::Null),
        HostValue::Bool(b) => Some(Value::Bool(*b)),
        HostValue::Int(i) => Some(Value::Number((*i).into())),
        HostValue::UInt(u) => Some(Value::Number((*u).into())),
        HostValue::Float(f) => match Number::from_f64(*f) {
            Some(n) => Some(Value::Number(n)),
            None => {
                tracing::trace!(path, value = f, "Dropping non-finite float");
                None
            }
        },
        HostValue::String(s) => Some(Value::String(s.clone())),
        HostValue::List(items) => Some(Value::Array(
            items
                .iter()
                .enumerate()
                .filter_map(|(i, item)| sanitize_value(&format!("{path}[{i}]"), item))
                .collect(),
        )),
        HostValue::Map(map) => Some(Value::Object(sanitize_map(path, map))),
        HostValue::Object(object) => {
            let projection = object.wire_projection();
            if projection.is_none() {
                tracing::trace!(
                    path,
                    object_type = object.type_name(),
                    "Dropping host-only object"
                );
            }
            projection
        }
    }
}

fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HalMessage, HostObject};
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Debug)]
    struct Widget;

    impl HostObject for Widget {
        fn type_name(&self) -> &'static str {
            "Widget"
        }
    }

    #[derive(Debug)]
    struct TimingFunctionality {
        time_base: String,
    }

    impl HostObject for TimingFunctionality {
        fn type_name(&self) -> &'static str {
            "TimingFunctionality"
        }

        fn wire_projection(&self) -> Option<Value> {
            Some(json!({ "time_base": self.time_base }))
        }
    }

    fn test_id() -> MessageId {
        MessageId::parse("550e8400-e29b-41d4-a716-446655440000").unwrap()
    }

    #[test]
    fn to_wire_copies_identity() {
        let msg = HalMessage::new("get status", "focuslock", HostData::new()).with_id(test_id());
        let wire = to_wire(&msg);

        assert_eq!(wire.id(), test_id());
        assert!(wire.is_type("get status"));
        assert!(wire.source_is("focuslock"));
        assert!(wire.responses().is_empty());
        assert!(wire.errors().is_empty());
    }

    #[test]
    fn sanitize_drops_host_objects_at_any_depth() {
        let mut inner = HostData::new();
        inner.insert("widget".into(), HostValue::Object(Arc::new(Widget)));
        inner.insert("exposure".into(), HostValue::Float(0.05));

        let mut data = HostData::new();
        data.insert("camera".into(), HostValue::Map(inner));
        data.insert(
            "items".into(),
            HostValue::List(vec![
                HostValue::Int(1),
                HostValue::Object(Arc::new(Widget)),
                HostValue::String("two".into()),
            ]),
        );
        data.insert("display".into(), HostValue::Object(Arc::new(Widget)));

        let clean = sanitize(&data);

        assert_eq!(
            Value::Object(clean),
            json!({
                "camera": { "exposure": 0.05 },
                "items": [1, "two"],
            })
        );
    }

    #[test]
    fn sanitize_uses_object_projection() {
        let mut props = HostData::new();
        props.insert(
            "functionality".into(),
            HostValue::Object(Arc::new(TimingFunctionality {
                time_base: "camera1".into(),
            })),
        );
        let mut data = HostData::new();
        data.insert("properties".into(), HostValue::Map(props));

        let clean = sanitize(&data);
        assert_eq!(
            clean["properties"]["functionality"]["time_base"],
            json!("camera1")
        );
    }

    #[test]
    fn sanitize_drops_non_finite_floats() {
        let mut data = HostData::new();
        data.insert("nan".into(), HostValue::Float(f64::NAN));
        data.insert("ok".into(), HostValue::Float(1.5));

        let clean = sanitize(&data);
        assert!(!clean.contains_key("nan"));
        assert_eq!(clean["ok"], json!(1.5));
    }

    #[test]
    fn round_trip_through_host_message_is_identity() {
        let wire = WireMessage::new("new parameters", "settings")
            .with_id(test_id())
            .with_data(
                json!({
                    "parameters": { "camera1": { "exposure_time": 0.1, "gain": 10, "roi": [0, 0, 512, 512] } },
                    "flag": true,
                    "note": null,
                    "big": u64::MAX,
                    "offset": -3,
                })
                .as_object()
                .cloned()
                .unwrap(),
            );

        let host = HalMessage::from_wire(wire.clone());
        assert_eq!(to_wire(&host), wire);
    }

    #[test]
    fn from_wire_keeps_accumulated_outcome() {
        let mut wire = WireMessage::new("stop film", "film").with_id(test_id());
        wire.add_response(ResponseEntry::new("camera1", json!({"ok": true})));
        wire.add_error(ErrorEntry::new("camera1", "shutter stuck"));

        let host = HalMessage::from_wire(wire);
        assert_eq!(host.responses().len(), 1);
        assert_eq!(host.errors()[0].message, "shutter stuck");
    }

    #[test]
    fn error_entry_from_error_keeps_chain() {
        let err = anyhow::anyhow!("serial port timed out").context("failed to set exposure");
        let entry = ErrorEntry::from_error("camera1", &err);

        assert_eq!(entry.message, "failed to set exposure");
        assert_eq!(
            entry.exception_info.as_deref(),
            Some("failed to set exposure: serial port timed out")
        );
        assert!(entry.stack_trace.is_some());
    }

    #[test]
    fn error_entry_from_panic_payload() {
        let payload: Box<dyn Any + Send> = Box::new("index out of range");
        let entry = ErrorEntry::from_panic("na", payload.as_ref());
        assert_eq!(entry.message, "index out of range");
    }

    #[test]
    fn wire_message_serializes() {
        let mut wire = WireMessage::new("getStatus", "focuslock")
            .with_id(test_id())
            .with_data(json!({"mode": "locked"}).as_object().cloned().unwrap());
        wire.add_response(ResponseEntry::new("remote", json!({"offset": 0.25})));

        insta::assert_json_snapshot!(wire, @r#"
        {
          "id": "550e8400-e29b-41d4-a716-446655440000",
          "type": "getStatus",
          "data": {
            "mode": "locked"
          },
          "source_name": "focuslock",
          "responses": [
            {
              "source": "remote",
              "data": {
                "offset": 0.25
              }
            }
          ],
          "errors": []
        }
        "#);
    }
}
