//! Frame types for the two paths between host and remote.
//!
//! - **Request path** (host → remote, replies flow back on the same connection):
//!   forwarded host messages, host-originated events, and the close handshake.
//! - **Notify path** (remote → host): deferred replies to held requests and
//!   spontaneous device events.
//!
//! Events travel as [`TaggedEvent`], a `["name", payload]` pair, and are decoded
//! into [`DeviceEvent`] once at the boundary.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::ProtocolError;
use crate::wire::{MessageId, WireMessage};

/// Frames sent by the host on the request path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestFrame {
    /// Forwarded host message; always answered with a [`ReplyFrame`].
    Message { message: WireMessage },

    /// Host-originated event; never answered.
    Event { event: TaggedEvent },

    /// Close handshake; answered with [`ReplyFrame::Ack`].
    Close,
}

/// Synchronous answers on the request path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyFrame {
    /// The handler answered immediately.
    Completed { message: WireMessage },

    /// The handler held request `id`; the real answer arrives on the notify
    /// path.
    Wait { id: MessageId },

    Ack,
}

/// Frames sent by the remote on the notify path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotifyFrame {
    /// Completed message for a previously held request.
    Deferred { message: WireMessage },

    Event { event: TaggedEvent },
}

/// Event as it appears on the wire: `["name", payload]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedEvent(pub String, pub Value);

impl TaggedEvent {
    pub fn name(&self) -> &str {
        &self.0
    }
}

/// Camera description sent once after the remote camera is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub camera_name: String,
    pub have_emccd: bool,
    pub have_preamp: bool,
    pub have_shutter: bool,
    pub have_temperature: bool,
    pub is_master: bool,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub camera: String,
    pub frame_number: u64,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    pub camera: String,
    pub temperature: f64,
    pub state: String,
}

/// Sent by the host to create the remote device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitConfig {
    pub camera_name: String,
    #[serde(default)]
    pub remote_save: bool,
    #[serde(default)]
    pub camera_params: Map<String, Value>,
}

pub const SEND_MESSAGE: &str = "sendMessage";
pub const CAMERA_FUNCTIONALITY: &str = "camera_functionality";
pub const EMCCD_GAIN: &str = "emccdGain";
pub const NEW_FRAME: &str = "newFrame";
pub const PARAMETERS_CHANGED: &str = "parametersChanged";
pub const SHUTTER: &str = "shutter";
pub const STARTED: &str = "started";
pub const STOPPED: &str = "stopped";
pub const TEMPERATURE: &str = "temperature";
pub const INIT: &str = "init";
pub const CONNECTED: &str = "connected";
pub const RECEIVED: &str = "received";

/// Decoded form of a [`TaggedEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Remote-originated host message to broadcast on the host bus.
    SendMessage(WireMessage),
    CameraFunctionality(CameraInfo),
    EmccdGain(f64),
    NewFrame(Frame),
    ParametersChanged,
    Shutter(bool),
    Started,
    Stopped,
    Temperature(TemperatureReading),

    /// Host → remote: create the device.
    Init(InitConfig),
    /// Host → remote: whether anything on the host consumes frames.
    Connected(bool),
    /// Host → remote: the last frame was consumed.
    Received,
}

#[derive(Deserialize)]
struct ConnectedPayload {
    connected: bool,
}

fn payload<T: DeserializeOwned>(name: &str, value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::malformed(name, e))
}

fn to_payload<T: Serialize>(name: &str, value: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::malformed(name, e))
}

impl DeviceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendMessage(_) => SEND_MESSAGE,
            Self::CameraFunctionality(_) => CAMERA_FUNCTIONALITY,
            Self::EmccdGain(_) => EMCCD_GAIN,
            Self::NewFrame(_) => NEW_FRAME,
            Self::ParametersChanged => PARAMETERS_CHANGED,
            Self::Shutter(_) => SHUTTER,
            Self::Started => STARTED,
            Self::Stopped => STOPPED,
            Self::Temperature(_) => TEMPERATURE,
            Self::Init(_) => INIT,
            Self::Connected(_) => CONNECTED,
            Self::Received => RECEIVED,
        }
    }

    pub fn encode(&self) -> Result<TaggedEvent, ProtocolError> {
        let name = self.name();
        let value = match self {
            Self::SendMessage(message) => to_payload(name, message)?,
            Self::CameraFunctionality(info) => to_payload(name, info)?,
            Self::EmccdGain(gain) => json!(gain),
            Self::NewFrame(frame) => to_payload(name, frame)?,
            Self::Shutter(open) => json!(open),
            Self::Temperature(reading) => to_payload(name, reading)?,
            Self::Init(config) => to_payload(name, config)?,
            Self::Connected(connected) => json!({ "connected": connected }),
            Self::Received => json!({ "received": true }),
            Self::ParametersChanged | Self::Started | Self::Stopped => Value::Null,
        };
        Ok(TaggedEvent(name.to_string(), value))
    }

    pub fn decode(event: TaggedEvent) -> Result<Self, ProtocolError> {
        let TaggedEvent(name, value) = event;
        let decoded = match name.as_str() {
            SEND_MESSAGE => Self::SendMessage(payload(&name, value)?),
            CAMERA_FUNCTIONALITY => Self::CameraFunctionality(payload(&name, value)?),
            EMCCD_GAIN => Self::EmccdGain(payload(&name, value)?),
            NEW_FRAME => Self::NewFrame(payload(&name, value)?),
            PARAMETERS_CHANGED => Self::ParametersChanged,
            SHUTTER => Self::Shutter(payload(&name, value)?),
            STARTED => Self::Started,
            STOPPED => Self::Stopped,
            TEMPERATURE => Self::Temperature(payload(&name, value)?),
            INIT => Self::Init(payload(&name, value)?),
            CONNECTED => Self::Connected(payload::<ConnectedPayload>(&name, value)?.connected),
            RECEIVED => Self::Received,
            _ => return Err(ProtocolError::UnknownEvent(name)),
        };
        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_id() -> MessageId {
        MessageId::parse("550e8400-e29b-41d4-a716-446655440000").unwrap()
    }

    #[test]
    fn tagged_event_is_a_pair() {
        let event = DeviceEvent::Connected(true).encode().unwrap();
        insta::assert_json_snapshot!(event, @r#"
        [
          "connected",
          {
            "connected": true
          }
        ]
        "#);
    }

    #[test]
    fn unit_events_carry_null_payload() {
        let event = DeviceEvent::Started.encode().unwrap();
        assert_eq!(event, TaggedEvent("started".into(), Value::Null));
    }

    #[test]
    fn request_close_serializes() {
        insta::assert_json_snapshot!(RequestFrame::Close, @r#"
        {
          "kind": "close"
        }
        "#);
    }

    #[test]
    fn reply_wait_serializes() {
        insta::assert_json_snapshot!(ReplyFrame::Wait { id: test_id() }, @r#"
        {
          "kind": "wait",
          "id": "550e8400-e29b-41d4-a716-446655440000"
        }
        "#);
    }

    #[test]
    fn notify_event_serializes() {
        let frame = NotifyFrame::Event {
            event: DeviceEvent::EmccdGain(20.0).encode().unwrap(),
        };
        insta::assert_json_snapshot!(frame, @r#"
        {
          "kind": "event",
          "event": [
            "emccdGain",
            20.0
          ]
        }
        "#);
    }

    #[test]
    fn decode_restores_every_variant() {
        let events = vec![
            DeviceEvent::SendMessage(WireMessage::new("configuration", "camera1").with_id(test_id())),
            DeviceEvent::CameraFunctionality(CameraInfo {
                camera_name: "camera1".into(),
                have_emccd: true,
                have_preamp: false,
                have_shutter: true,
                have_temperature: true,
                is_master: true,
                parameters: Map::new(),
            }),
            DeviceEvent::EmccdGain(12.0),
            DeviceEvent::NewFrame(Frame {
                camera: "camera1".into(),
                frame_number: 7,
                width: 2,
                height: 1,
                data: vec![10, 20],
            }),
            DeviceEvent::ParametersChanged,
            DeviceEvent::Shutter(false),
            DeviceEvent::Started,
            DeviceEvent::Stopped,
            DeviceEvent::Temperature(TemperatureReading {
                camera: "camera1".into(),
                temperature: -70.0,
                state: "stable".into(),
            }),
            DeviceEvent::Init(InitConfig {
                camera_name: "camera1".into(),
                remote_save: false,
                camera_params: Map::new(),
            }),
            DeviceEvent::Connected(false),
            DeviceEvent::Received,
        ];

        for event in events {
            let decoded = DeviceEvent::decode(event.encode().unwrap()).unwrap();
            assert_eq!(decoded, event);
        }
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        let err = DeviceEvent::decode(TaggedEvent("stageMoved".into(), Value::Null)).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownEvent("stageMoved".into()));
    }

    #[test]
    fn decode_rejects_bad_payload() {
        let err = DeviceEvent::decode(TaggedEvent("shutter".into(), json!("open"))).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedEvent { ref name, .. } if name == "shutter"));
    }

    #[test]
    fn frames_round_trip_through_json() {
        let frame = ReplyFrame::Completed {
            message: WireMessage::new("getStatus", "focuslock").with_id(test_id()),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let parsed: ReplyFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, frame);
    }
}
