//! Parameter store emulator.
//!
//! Behaves like a remote module that only owns a block of parameters:
//! `current parameters` reports them and `new parameters` swaps them,
//! answering with the old and new values.

use serde_json::{Map, Value, json};

use crate::bridge::protocol::DeviceEvent;
use crate::handler::{BridgeContext, RemoteHandler};
use crate::wire::{ResponseEntry, WireMessage};

#[derive(Debug, Clone)]
pub struct ParameterStoreHandler {
    module_name: String,
    parameters: Map<String, Value>,
}

impl ParameterStoreHandler {
    pub fn new(module_name: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Self {
            module_name: module_name.into(),
            parameters,
        }
    }

    pub fn parameters(&self) -> &Map<String, Value> {
        &self.parameters
    }

    fn update(&mut self, update: Option<&Value>) -> anyhow::Result<()> {
        match update {
            Some(Value::Object(update)) => {
                for (key, value) in update {
                    self.parameters.insert(key.clone(), value.clone());
                }
                Ok(())
            }
            Some(other) => anyhow::bail!("parameters for '{}' must be an object, got {other}", self.module_name),
            None => Ok(()),
        }
    }
}

impl RemoteHandler for ParameterStoreHandler {
    fn name(&self) -> &str {
        &self.module_name
    }

    fn process_message(&mut self, mut message: WireMessage, ctx: &mut BridgeContext) -> anyhow::Result<()> {
        match message.message_type() {
            "current parameters" => {
                message.add_response(ResponseEntry::new(
                    &self.module_name,
                    json!({ "parameters": self.parameters }),
                ));
                ctx.reply(message)?;
            }
            "new parameters" => {
                let update = message
                    .data()
                    .get("parameters")
                    .and_then(|all| all.get(&self.module_name))
                    .cloned();
                message.add_response(ResponseEntry::new(
                    &self.module_name,
                    json!({ "old parameters": self.parameters }),
                ));
                ctx.hold(message)?;

                self.update(update.as_ref())?;
                if let Some(held) = ctx.held_mut() {
                    held.add_response(ResponseEntry::new(
                        &self.module_name,
                        json!({ "new parameters": self.parameters }),
                    ));
                }
                ctx.release()?;
                ctx.emit(DeviceEvent::ParametersChanged)?;
            }
            _ => ctx.reply(message)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{NotifyFrame, ReplyFrame};
    use crate::bridge::transport::Endpoint;
    use crate::config::ServerConfig;
    use crate::server::RemoteBridge;

    fn bridge() -> RemoteBridge<ParameterStoreHandler> {
        let mut params = Map::new();
        params.insert("exposure_time".into(), json!(0.1));
        let config = ServerConfig::new(Endpoint::new("127.0.0.1", 0), Endpoint::new("127.0.0.1", 0));
        RemoteBridge::new(config, ParameterStoreHandler::new("camera1", params))
    }

    #[test]
    fn current_parameters_replies_immediately() {
        let mut bridge = bridge();
        match bridge.dispatch(WireMessage::new("current parameters", "settings")) {
            ReplyFrame::Completed { message } => {
                assert_eq!(
                    message.responses()[0].data,
                    json!({"parameters": {"exposure_time": 0.1}})
                );
            }
            other => panic!("expected completed, got {other:?}"),
        }
    }

    #[test]
    fn new_parameters_is_held_then_released() {
        let mut bridge = bridge();
        let mut data = Map::new();
        data.insert("parameters".into(), json!({"camera1": {"exposure_time": 0.05}}));
        let request = WireMessage::new("new parameters", "settings").with_data(data);

        assert!(matches!(bridge.dispatch(request), ReplyFrame::Wait { .. }));
        assert_eq!(bridge.handler().parameters()["exposure_time"], json!(0.05));

        let out = bridge.take_notifications();
        assert_eq!(out.len(), 2);
        match &out[0] {
            NotifyFrame::Deferred { message } => {
                let responses: Vec<_> = message.responses().iter().map(|r| r.data.clone()).collect();
                assert_eq!(
                    responses,
                    vec![
                        json!({"old parameters": {"exposure_time": 0.1}}),
                        json!({"new parameters": {"exposure_time": 0.05}}),
                    ]
                );
            }
            other => panic!("expected deferred, got {other:?}"),
        }
        assert!(matches!(&out[1], NotifyFrame::Event { event } if event.name() == "parametersChanged"));
    }

    #[test]
    fn bad_update_is_reported_on_the_released_message() {
        let mut bridge = bridge();
        let mut data = Map::new();
        data.insert("parameters".into(), json!({"camera1": 3}));
        let request = WireMessage::new("new parameters", "settings").with_data(data);

        assert!(matches!(bridge.dispatch(request), ReplyFrame::Wait { .. }));
        assert!(!bridge.is_held());
        match &bridge.take_notifications()[..] {
            [NotifyFrame::Deferred { message }] => assert!(message.has_errors()),
            other => panic!("expected one deferred, got {other:?}"),
        }
    }
}
