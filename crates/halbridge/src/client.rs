//! Local bridge: stands in for a remote module inside the host.
//!
//! The host hands it messages; each is converted to wire form and sent on the
//! request path. A `Completed` reply finishes the message at once. A `Wait`
//! reply parks it as the single pending request until the matching deferred
//! reply arrives on the notify path. Messages arriving meanwhile are queued
//! and replayed in order. A queued message already counts as in flight: its
//! ref count is raised when it is queued and lowered once it finishes.
//!
//! [`LocalBridge`] can be driven directly (call [`LocalBridge::poll`] on a
//! timer) or moved onto its own task with [`LocalBridge::spawn`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{
    CameraInfo, DeviceEvent, NotifyFrame, ReplyFrame, RequestFrame, TaggedEvent,
};
use crate::bridge::transport::ClientTransport;
use crate::config::ClientConfig;
use crate::devices::CameraMirror;
use crate::error::{BridgeError, ProtocolError, TransportError};
use crate::host::{HalMessage, HostBus, HostMessage, host_data_from};
use crate::wire::{ErrorEntry, MessageId, WireMessage, to_wire};

/// Outcome of [`LocalBridge::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Answered synchronously; responses are already on the host message.
    Completed,
    /// Held by the remote; responses follow on the notify path.
    Deferred,
}

struct PendingRequest {
    message: Arc<dyn HostMessage>,
    id: MessageId,
    since: Instant,
}

pub struct LocalBridge {
    config: ClientConfig,
    transport: ClientTransport,
    bus: Arc<dyn HostBus>,
    pending: Option<PendingRequest>,
    queue: VecDeque<Arc<dyn HostMessage>>,
    camera: Option<CameraMirror>,
}

impl LocalBridge {
    /// Connect to the remote's request and notify endpoints.
    pub async fn connect(config: ClientConfig, bus: Arc<dyn HostBus>) -> Result<Self, BridgeError> {
        let transport = ClientTransport::connect(
            &config.request_endpoint,
            &config.notify_endpoint,
            config.connect_timeout,
        )
        .await?;
        tracing::info!(
            module = %config.module_name,
            request = %config.request_endpoint,
            notify = %config.notify_endpoint,
            "Local bridge connected"
        );
        let camera = config.mirror_camera.then(CameraMirror::new);
        let connect_events = config.connect_events.clone();
        let mut bridge = Self {
            config,
            transport,
            bus,
            pending: None,
            queue: VecDeque::new(),
            camera,
        };
        for event in connect_events {
            bridge.send_event(event).await?;
        }
        Ok(bridge)
    }

    pub fn module_name(&self) -> &str {
        &self.config.module_name
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// The remote camera's description, when this bridge mirrors a camera.
    pub fn camera_functionality(&self) -> Option<&CameraInfo> {
        self.camera.as_ref().and_then(CameraMirror::functionality)
    }

    /// Host entry point: forward now if idle, otherwise queue behind the
    /// pending request.
    ///
    /// At most `max_queued` messages wait. Past that the message is not
    /// taken: it gets an error entry and [`ProtocolError::QueueFull`] is
    /// returned, leaving its ref count untouched.
    pub async fn process_message(&mut self, message: Arc<dyn HostMessage>) -> Result<(), BridgeError> {
        if let Some(camera) = &self.camera {
            camera.answer_get_functionality(&self.config.module_name, message.as_ref());
        }
        if self.pending.is_none() && self.queue.is_empty() {
            return self.submit(message).await.map(|_| ());
        }
        if self.queue.len() >= self.config.max_queued {
            let err = ProtocolError::QueueFull(self.queue.len());
            tracing::error!(id = %message.id(), error = %err, "Rejected message");
            message.add_error(ErrorEntry::new(self.config.module_name.clone(), err.to_string()));
            return Err(err.into());
        }
        tracing::debug!(
            id = %message.id(),
            message_type = message.message_type(),
            queued = self.queue.len() + 1,
            "Queueing message behind pending request"
        );
        message.inc_ref_count();
        self.queue.push_back(message);
        Ok(())
    }

    /// Forward one message. Fails with [`ProtocolError::RequestPending`] if
    /// another request is still awaiting its deferred reply.
    pub async fn submit(&mut self, message: Arc<dyn HostMessage>) -> Result<Submission, BridgeError> {
        if let Some(pending) = &self.pending {
            let err = ProtocolError::RequestPending(pending.id);
            tracing::error!(id = %message.id(), error = %err, "Rejected submit");
            return Err(err.into());
        }
        message.inc_ref_count();
        self.forward(message).await
    }

    /// Send a message whose ref count increment this bridge already holds.
    /// Every outcome either parks it as pending or lowers the count again.
    async fn forward(&mut self, message: Arc<dyn HostMessage>) -> Result<Submission, BridgeError> {
        let wire = to_wire(message.as_ref());
        let id = wire.id();
        tracing::debug!(%id, message_type = wire.message_type(), "Forwarding message");

        match self.exchange(wire).await {
            Ok(ReplyFrame::Completed { message: reply }) => {
                self.copy_outcome(message.as_ref(), reply);
                message.dec_ref_count();
                tracing::debug!(%id, "Completed synchronously");
                Ok(Submission::Completed)
            }
            Ok(ReplyFrame::Wait { .. }) => {
                tracing::debug!(%id, "Remote holding request");
                self.pending = Some(PendingRequest {
                    message,
                    id,
                    since: Instant::now(),
                });
                Ok(Submission::Deferred)
            }
            Ok(ReplyFrame::Ack) => {
                let err = ProtocolError::UnexpectedReply(format!("ack in reply to message {id}"));
                tracing::error!(%id, error = %err, "Protocol violation");
                self.fail(message.as_ref(), &err.to_string());
                Err(err.into())
            }
            Err(e) => {
                tracing::error!(%id, error = %e, "Forwarding failed");
                self.fail(message.as_ref(), &e.to_string());
                Err(e)
            }
        }
    }

    /// Send a message and wait for its synchronous reply. Replies left over
    /// from an earlier timed out request carry another id and are skipped.
    async fn exchange(&mut self, wire: WireMessage) -> Result<ReplyFrame, BridgeError> {
        let id = wire.id();
        self.transport
            .requests
            .send(RequestFrame::Message { message: wire })
            .await?;

        let deadline = tokio::time::Instant::now() + self.config.reply_timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.transport.replies.next()).await {
                Err(_) => return Err(BridgeError::ReplyTimeout(id)),
                Ok(None) => return Err(TransportError::Closed.into()),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(ReplyFrame::Completed { message }))) if message.id() != id => {
                    tracing::warn!(%id, stale = %message.id(), "Dropping stale reply");
                }
                Ok(Some(Ok(ReplyFrame::Wait { id: stale }))) if stale != id => {
                    tracing::warn!(%id, %stale, "Dropping stale wait");
                }
                Ok(Some(Ok(reply))) => return Ok(reply),
            }
        }
    }

    /// Forward a host-originated event to the remote. No reply is expected.
    pub async fn send_event(&mut self, event: DeviceEvent) -> Result<(), BridgeError> {
        let event = event.encode()?;
        tracing::trace!(event = event.name(), "Sending event");
        self.transport
            .requests
            .send(RequestFrame::Event { event })
            .await?;
        Ok(())
    }

    /// Drain everything waiting on the notify path, then replay queued
    /// messages if the bridge is idle again.
    pub async fn poll(&mut self) -> Result<(), BridgeError> {
        while let Some(frame) = self.transport.notify.next().now_or_never() {
            match frame {
                Some(Ok(NotifyFrame::Deferred { message })) => self.complete_deferred(message),
                Some(Ok(NotifyFrame::Event { event })) => self.dispatch_event(event).await?,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(TransportError::Closed.into()),
            }
        }
        self.expire_pending();
        self.drain_queue().await
    }

    fn complete_deferred(&mut self, reply: WireMessage) {
        let id = reply.id();
        match self.pending.take() {
            Some(pending) if pending.id == id => {
                self.copy_outcome(pending.message.as_ref(), reply);
                pending.message.dec_ref_count();
                let waited_ms = pending.since.elapsed().as_millis() as u64;
                tracing::debug!(%id, waited_ms, "Deferred reply completed");
            }
            Some(pending) => {
                tracing::warn!(%id, pending = %pending.id, "Dropping deferred reply for another request");
                self.pending = Some(pending);
            }
            None => {
                tracing::warn!(%id, "Dropping deferred reply with nothing pending");
            }
        }
    }

    async fn dispatch_event(&mut self, event: TaggedEvent) -> Result<(), BridgeError> {
        let event = match DeviceEvent::decode(event) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable event");
                return Ok(());
            }
        };
        match event {
            DeviceEvent::SendMessage(wire) => {
                tracing::debug!(message_type = wire.message_type(), "Remote sent host message");
                let message = HalMessage::new(
                    wire.message_type(),
                    self.config.module_name.clone(),
                    host_data_from(wire.data().clone()),
                );
                self.bus.send_message(message);
            }
            DeviceEvent::NewFrame(frame) => {
                self.bus.device_event(DeviceEvent::NewFrame(frame));
                self.send_event(DeviceEvent::Received).await?;
            }
            other => {
                if let Some(camera) = &mut self.camera {
                    camera.observe_event(&other);
                }
                self.bus.device_event(other)
            }
        }
        Ok(())
    }

    fn expire_pending(&mut self) {
        let Some(limit) = self.config.pending_timeout else {
            return;
        };
        let expired = self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.since.elapsed() >= limit);
        if expired && let Some(pending) = self.pending.take() {
            tracing::warn!(id = %pending.id, "Timed out waiting for deferred reply");
            self.fail(pending.message.as_ref(), "timed out waiting for deferred reply");
        }
    }

    async fn drain_queue(&mut self) -> Result<(), BridgeError> {
        while self.pending.is_none() {
            let Some(next) = self.queue.pop_front() else {
                break;
            };
            match self.forward(next).await {
                Ok(_) | Err(BridgeError::Protocol(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Close handshake, then fail whatever is still outstanding.
    pub async fn shutdown(mut self) -> Result<(), BridgeError> {
        tracing::info!(module = %self.config.module_name, "Closing local bridge");
        let result = self.close_handshake().await;
        self.fail_outstanding("bridge shut down");
        result
    }

    async fn close_handshake(&mut self) -> Result<(), BridgeError> {
        self.transport.requests.send(RequestFrame::Close).await?;
        let deadline = tokio::time::Instant::now() + self.config.close_timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.transport.replies.next()).await {
                Err(_) => {
                    tracing::warn!("No ack from remote before close timeout");
                    return Ok(());
                }
                Ok(Some(Ok(ReplyFrame::Ack))) => {
                    tracing::debug!("Remote acknowledged close");
                    return Ok(());
                }
                Ok(Some(Ok(other))) => tracing::debug!(?other, "Ignoring reply while closing"),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => return Err(TransportError::Closed.into()),
            }
        }
    }

    fn fail_outstanding(&mut self, reason: &str) {
        if let Some(pending) = self.pending.take() {
            tracing::warn!(id = %pending.id, reason, "Failing pending request");
            self.fail(pending.message.as_ref(), reason);
        }
        for message in std::mem::take(&mut self.queue) {
            tracing::debug!(id = %message.id(), reason, "Failing queued message");
            self.fail(message.as_ref(), reason);
        }
    }

    /// Copy the remote outcome onto the host message, crediting every entry
    /// to this bridge's module.
    fn copy_outcome(&mut self, host: &dyn HostMessage, reply: WireMessage) {
        if let Some(camera) = &mut self.camera {
            camera.observe_reply(&reply);
        }
        let (responses, errors) = reply.into_outcome();
        for mut response in responses {
            response.source = self.config.module_name.clone();
            host.add_response(response);
        }
        for mut error in errors {
            error.source = self.config.module_name.clone();
            host.add_error(error);
        }
    }

    /// Finish an in-flight message with an error.
    fn fail(&self, host: &dyn HostMessage, reason: &str) {
        host.add_error(ErrorEntry::new(self.config.module_name.clone(), reason));
        host.dec_ref_count();
    }

    /// Move the bridge onto its own task.
    pub fn spawn(self, cancel: CancellationToken) -> BridgeHandle {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run_event_loop(self, rx, cancel));
        BridgeHandle { tx }
    }
}

enum Command {
    Process(Arc<dyn HostMessage>),
    Event(DeviceEvent),
    Shutdown(oneshot::Sender<Result<(), BridgeError>>),
}

/// Cloneable handle to a spawned [`LocalBridge`].
#[derive(Clone)]
pub struct BridgeHandle {
    tx: mpsc::Sender<Command>,
}

impl BridgeHandle {
    pub async fn process_message(&self, message: Arc<dyn HostMessage>) -> Result<(), BridgeError> {
        self.tx
            .send(Command::Process(message))
            .await
            .map_err(|_| BridgeError::Shutdown)
    }

    pub async fn send_event(&self, event: DeviceEvent) -> Result<(), BridgeError> {
        self.tx
            .send(Command::Event(event))
            .await
            .map_err(|_| BridgeError::Shutdown)
    }

    /// Close the bridge and wait for the handshake to finish.
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown(reply_tx))
            .await
            .map_err(|_| BridgeError::Shutdown)?;
        reply_rx.await.map_err(|_| BridgeError::Shutdown)?
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

fn is_fatal(err: &BridgeError) -> bool {
    matches!(err, BridgeError::Transport(_))
}

async fn run_event_loop(
    mut bridge: LocalBridge,
    mut commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(bridge.config.poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let result = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                if let Err(e) = bridge.shutdown().await {
                    tracing::warn!(error = %e, "Close handshake failed");
                }
                return;
            }

            cmd = commands.recv() => match cmd {
                Some(Command::Process(message)) => bridge.process_message(message).await,
                Some(Command::Event(event)) => bridge.send_event(event).await,
                Some(Command::Shutdown(reply)) => {
                    let _ = reply.send(bridge.shutdown().await);
                    return;
                }
                None => {
                    tracing::debug!("All bridge handles dropped");
                    if let Err(e) = bridge.shutdown().await {
                        tracing::warn!(error = %e, "Close handshake failed");
                    }
                    return;
                }
            },

            _ = tick.tick() => bridge.poll().await,
        };

        if let Err(e) = result {
            if is_fatal(&e) {
                tracing::error!(error = %e, "Bridge transport failed, stopping");
                bridge.fail_outstanding("bridge transport failed");
                return;
            }
            tracing::error!(error = %e, "Bridge operation failed");
        }
    }
}
