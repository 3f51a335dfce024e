//! Handler with no device behind it.

use crate::handler::{BridgeContext, RemoteHandler};
use crate::wire::WireMessage;

/// Answers every message immediately and unchanged.
#[derive(Debug, Default)]
pub struct EchoHandler;

impl RemoteHandler for EchoHandler {
    fn name(&self) -> &str {
        "none"
    }

    fn process_message(&mut self, message: WireMessage, ctx: &mut BridgeContext) -> anyhow::Result<()> {
        tracing::trace!(id = %message.id(), message_type = message.message_type(), "Echoing");
        ctx.reply(message)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::ReplyFrame;
    use crate::bridge::transport::Endpoint;
    use crate::config::ServerConfig;
    use crate::server::RemoteBridge;

    #[test]
    fn echoes_message() {
        let config = ServerConfig::new(Endpoint::new("127.0.0.1", 0), Endpoint::new("127.0.0.1", 0));
        let mut bridge = RemoteBridge::new(config, EchoHandler);
        let request = WireMessage::new("sync", "hal");
        assert_eq!(
            bridge.dispatch(request.clone()),
            ReplyFrame::Completed { message: request }
        );
    }
}
