//! Handler contract for the remote side.
//!
//! A [`RemoteHandler`] owns the device logic. The remote bridge calls it from a
//! single task and hands it a [`BridgeContext`] through which it answers the
//! current request, holds it for later, and pushes events to the host.

use crate::bridge::protocol::{DeviceEvent, NotifyFrame};
use crate::error::ProtocolError;
use crate::wire::{ErrorEntry, WireMessage};

/// Device logic hosted by a [`RemoteBridge`](crate::server::RemoteBridge).
///
/// Methods run to completion on the bridge task and must not block. Long
/// operations hold the request in `process_message` and release it later
/// from `poll`.
pub trait RemoteHandler: Send + 'static {
    /// Used as the source name on error entries.
    fn name(&self) -> &str {
        "remote"
    }

    /// Handle one forwarded host message.
    ///
    /// Must either `ctx.reply(message)` or `ctx.hold(message)`. Returning
    /// without doing either echoes the message back unchanged.
    fn process_message(&mut self, message: WireMessage, ctx: &mut BridgeContext)
    -> anyhow::Result<()>;

    /// Handle a host-originated event.
    fn process_event(&mut self, event: DeviceEvent, ctx: &mut BridgeContext) -> anyhow::Result<()> {
        let _ = ctx;
        tracing::trace!(event = event.name(), "Event ignored by handler");
        Ok(())
    }

    /// Called on every bridge tick.
    fn poll(&mut self, ctx: &mut BridgeContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Called when the host closes the session.
    fn clean_up(&mut self) {}
}

/// How the current request was answered.
#[derive(Debug)]
pub(crate) enum PendingReply {
    Completed(WireMessage),
    Wait,
}

/// Per-session state shared between the remote bridge and its handler.
#[derive(Debug, Default)]
pub struct BridgeContext {
    held: Option<WireMessage>,
    reply: Option<PendingReply>,
    outbox: Vec<NotifyFrame>,
    dispatching: bool,
}

impl BridgeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the current request immediately.
    pub fn reply(&mut self, message: WireMessage) -> Result<(), ProtocolError> {
        if !self.dispatching {
            return Err(ProtocolError::NoActiveRequest);
        }
        if self.reply.is_some() {
            return Err(ProtocolError::AlreadyReplied);
        }
        self.reply = Some(PendingReply::Completed(message));
        Ok(())
    }

    /// Keep the current request; the host is told to wait.
    pub fn hold(&mut self, message: WireMessage) -> Result<(), ProtocolError> {
        if self.held.is_some() {
            return Err(ProtocolError::AlreadyHeld);
        }
        if !self.dispatching {
            return Err(ProtocolError::NoActiveRequest);
        }
        if self.reply.is_some() {
            return Err(ProtocolError::AlreadyReplied);
        }
        tracing::debug!(id = %message.id(), message_type = message.message_type(), "Holding request");
        self.held = Some(message);
        self.reply = Some(PendingReply::Wait);
        Ok(())
    }

    /// Send the held request back as a deferred reply.
    pub fn release(&mut self) -> Result<(), ProtocolError> {
        let message = self.held.take().ok_or(ProtocolError::NotHeld)?;
        tracing::debug!(id = %message.id(), message_type = message.message_type(), "Releasing request");
        self.outbox.push(NotifyFrame::Deferred { message });
        Ok(())
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// The held request, for accumulating responses before release.
    pub fn held_mut(&mut self) -> Option<&mut WireMessage> {
        self.held.as_mut()
    }

    /// Queue a spontaneous event for the host.
    pub fn emit(&mut self, event: DeviceEvent) -> Result<(), ProtocolError> {
        let event = event.encode()?;
        self.outbox.push(NotifyFrame::Event { event });
        Ok(())
    }

    /// Broadcast a message on the host's bus.
    pub fn send_message(&mut self, message: WireMessage) -> Result<(), ProtocolError> {
        self.emit(DeviceEvent::SendMessage(message))
    }

    pub(crate) fn begin_dispatch(&mut self) {
        self.dispatching = true;
        self.reply = None;
    }

    pub(crate) fn end_dispatch(&mut self) -> Option<PendingReply> {
        self.dispatching = false;
        self.reply.take()
    }

    pub(crate) fn drain_outbox(&mut self) -> Vec<NotifyFrame> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn take_held(&mut self) -> Option<WireMessage> {
        self.held.take()
    }

    /// Add an error to the most recently released, not yet sent, request.
    pub(crate) fn attach_to_deferred(&mut self, error: ErrorEntry) {
        let deferred = self.outbox.iter_mut().rev().find_map(|frame| match frame {
            NotifyFrame::Deferred { message } => Some(message),
            NotifyFrame::Event { .. } => None,
        });
        match deferred {
            Some(message) => message.add_error(error),
            None => tracing::warn!(error = %error.message, "No released request to attach error to"),
        }
    }
}
