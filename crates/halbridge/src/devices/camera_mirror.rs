//! Host-side record of a remote camera.
//!
//! A local bridge standing in for a camera keeps one of these so that
//! `get functionality` can be answered inside the host, and so the cached
//! parameters follow the remote's `new parameters` responses.

use serde_json::{Value, json};

use crate::bridge::protocol::{CameraInfo, DeviceEvent};
use crate::host::{HostMessage, HostValue};
use crate::wire::{ResponseEntry, WireMessage};

#[derive(Debug, Clone, Default)]
pub struct CameraMirror {
    functionality: Option<CameraInfo>,
}

impl CameraMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last camera description sent by the remote, with parameters kept current.
    pub fn functionality(&self) -> Option<&CameraInfo> {
        self.functionality.as_ref()
    }

    /// Add the cached functionality to a `get functionality` request naming
    /// `module_name`. The message is still forwarded afterwards.
    pub fn answer_get_functionality(&self, module_name: &str, message: &dyn HostMessage) -> bool {
        if !message.is_type("get functionality") {
            return false;
        }
        match message.data().get("name") {
            Some(HostValue::String(name)) if name == module_name => {}
            _ => return false,
        }
        let functionality = self
            .functionality
            .as_ref()
            .and_then(|info| serde_json::to_value(info).ok())
            .unwrap_or(Value::Null);
        message.add_response(ResponseEntry::new(
            module_name,
            json!({ "functionality": functionality }),
        ));
        true
    }

    pub fn observe_event(&mut self, event: &DeviceEvent) {
        if let DeviceEvent::CameraFunctionality(info) = event {
            tracing::debug!(camera = %info.camera_name, "Camera functionality received");
            self.functionality = Some(info.clone());
        }
    }

    /// Pick up the parameters a completed `new parameters` request settled on.
    pub fn observe_reply(&mut self, reply: &WireMessage) {
        if reply.message_type() != "new parameters" {
            return;
        }
        let Some(info) = self.functionality.as_mut() else {
            return;
        };
        for response in reply.responses() {
            if let Some(Value::Object(parameters)) = response.data.get("new parameters") {
                info.parameters = parameters.clone();
            }
        }
    }
}
