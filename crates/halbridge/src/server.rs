//! Remote bridge: hosts a [`RemoteHandler`] behind the socket pair.
//!
//! One session at a time. Each session runs a single `select!` loop over
//! inbound request frames, a poll tick and cancellation. After the host closes
//! (or drops) the connection the handler is cleaned up and the bridge goes back
//! to accepting.

use std::panic::{AssertUnwindSafe, catch_unwind};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::WireCodec;
use crate::bridge::protocol::{DeviceEvent, NotifyFrame, ReplyFrame, RequestFrame, TaggedEvent};
use crate::bridge::transport::{BridgeListener, ServerConnection};
use crate::config::ServerConfig;
use crate::error::{ProtocolError, TransportError};
use crate::handler::{BridgeContext, PendingReply, RemoteHandler};
use crate::wire::{ErrorEntry, WireMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Closed,
    Disconnected,
    Cancelled,
}

pub struct RemoteBridge<H> {
    config: ServerConfig,
    handler: H,
    ctx: BridgeContext,
}

impl<H: RemoteHandler> RemoteBridge<H> {
    pub fn new(config: ServerConfig, handler: H) -> Self {
        Self {
            config,
            handler,
            ctx: BridgeContext::new(),
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn is_held(&self) -> bool {
        self.ctx.is_held()
    }

    /// Bind the configured endpoints and serve until cancelled.
    pub async fn serve(&mut self, cancel: CancellationToken) -> Result<(), TransportError> {
        let listener =
            BridgeListener::bind(&self.config.request_endpoint, &self.config.notify_endpoint).await?;
        tracing::info!(
            request = %self.config.request_endpoint,
            notify = %self.config.notify_endpoint,
            handler = self.handler.name(),
            "Remote bridge listening"
        );
        self.serve_listener(listener, cancel).await
    }

    /// Serve on already bound listeners until cancelled.
    pub async fn serve_listener(
        &mut self,
        listener: BridgeListener,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        loop {
            let conn = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                conn = listener.accept() => conn,
            };
            let conn = match conn {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept host connection");
                    continue;
                }
            };

            let end = self.run_session(conn, &cancel).await;
            self.end_session();
            match end {
                Ok(SessionEnd::Closed) => tracing::info!("Host closed session"),
                Ok(SessionEnd::Disconnected) => tracing::warn!("Host disconnected without closing"),
                Ok(SessionEnd::Cancelled) => return Ok(()),
                Err(e) => tracing::warn!(error = %e, "Session ended by transport error"),
            }
        }
    }

    async fn run_session(
        &mut self,
        conn: ServerConnection,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, TransportError> {
        let ServerConnection {
            mut requests,
            mut replies,
            mut notify,
        } = conn;

        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),

                frame = requests.next() => {
                    match frame {
                        Some(Ok(RequestFrame::Message { message })) => {
                            let reply = self.dispatch(message);
                            replies.send(reply).await?;
                        }
                        Some(Ok(RequestFrame::Event { event })) => self.handle_event(event),
                        Some(Ok(RequestFrame::Close)) => {
                            tracing::debug!("Close requested");
                            replies.send(ReplyFrame::Ack).await?;
                            return Ok(SessionEnd::Closed);
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(SessionEnd::Disconnected),
                    }
                }

                _ = tick.tick() => self.tick(),
            }

            flush_notifications(&mut notify, self.take_notifications()).await?;
        }
    }

    /// Run the handler on one request and produce the synchronous reply.
    pub fn dispatch(&mut self, message: WireMessage) -> ReplyFrame {
        let id = message.id();
        let source = self.handler.name().to_string();

        if self.ctx.is_held() {
            let err = ProtocolError::AlreadyHeld;
            tracing::error!(%id, message_type = message.message_type(), error = %err, "Request arrived while another is held");
            let mut message = message;
            message.add_error(ErrorEntry::new(source, format!("protocol violation: {err}")));
            return ReplyFrame::Completed { message };
        }

        tracing::debug!(%id, message_type = message.message_type(), "Dispatching request");
        let fallback = message.clone();
        self.ctx.begin_dispatch();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.handler.process_message(message, &mut self.ctx)
        }));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                tracing::error!(%id, error = %e, "Handler failed");
                Some(ErrorEntry::from_error(&source, &e))
            }
            Err(panic) => {
                tracing::error!(%id, "Handler panicked");
                Some(ErrorEntry::from_panic(&source, &*panic))
            }
        };

        match (self.ctx.end_dispatch(), failure) {
            (Some(PendingReply::Completed(message)), None) => ReplyFrame::Completed { message },
            (Some(PendingReply::Completed(mut message)), Some(err)) => {
                message.add_error(err);
                ReplyFrame::Completed { message }
            }
            (Some(PendingReply::Wait), None) => ReplyFrame::Wait { id },
            (Some(PendingReply::Wait), Some(err)) => {
                self.fail_held(err);
                ReplyFrame::Wait { id }
            }
            (None, failure) => {
                tracing::debug!(%id, "Handler left request unanswered, echoing it back");
                let mut message = fallback;
                if let Some(err) = failure {
                    message.add_error(err);
                }
                ReplyFrame::Completed { message }
            }
        }
    }

    /// Decode and deliver a host-originated event.
    pub fn handle_event(&mut self, event: TaggedEvent) {
        let event = match DeviceEvent::decode(event) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable event");
                return;
            }
        };
        let name = event.name();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.handler.process_event(event, &mut self.ctx)
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(event = name, error = %e, "Handler failed on event"),
            Err(_) => tracing::error!(event = name, "Handler panicked on event"),
        }
    }

    /// Give the handler its periodic turn.
    pub fn tick(&mut self) {
        let source = self.handler.name().to_string();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.handler.poll(&mut self.ctx)));
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Handler poll failed");
                ErrorEntry::from_error(&source, &e)
            }
            Err(panic) => {
                tracing::error!("Handler poll panicked");
                ErrorEntry::from_panic(&source, &*panic)
            }
        };
        if self.ctx.is_held() {
            self.fail_held(failure);
        }
    }

    /// Notify frames produced since the last call.
    pub fn take_notifications(&mut self) -> Vec<NotifyFrame> {
        self.ctx.drain_outbox()
    }

    /// Attach a failure to the held request and send it back.
    fn fail_held(&mut self, err: ErrorEntry) {
        match self.ctx.held_mut() {
            Some(held) => {
                held.add_error(err);
                let _ = self.ctx.release();
            }
            None => {
                // Already released during this dispatch; the deferred reply is queued.
                self.ctx.attach_to_deferred(err);
            }
        }
    }

    fn end_session(&mut self) {
        if catch_unwind(AssertUnwindSafe(|| self.handler.clean_up())).is_err() {
            tracing::error!("Handler panicked during clean up");
        }
        if let Some(held) = self.ctx.take_held() {
            tracing::warn!(id = %held.id(), message_type = held.message_type(), "Dropping held request at session end");
        }
        let dropped = self.ctx.drain_outbox().len();
        if dropped > 0 {
            tracing::debug!(dropped, "Discarding unsent notifications");
        }
        self.ctx = BridgeContext::new();
    }
}

async fn flush_notifications(
    notify: &mut FramedWrite<TcpStream, WireCodec<NotifyFrame>>,
    frames: Vec<NotifyFrame>,
) -> Result<(), TransportError> {
    if frames.is_empty() {
        return Ok(());
    }
    for frame in frames {
        notify.feed(frame).await?;
    }
    notify.flush().await?;
    Ok(())
}
