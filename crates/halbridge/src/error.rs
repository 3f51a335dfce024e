//! Error taxonomy for the bridge.
//!
//! - [`TransportError`]: socket setup and framing failures.
//! - [`ProtocolError`]: wiring mistakes (double hold, double submit, bad frames).
//! - [`BridgeError`]: what the local bridge API returns to the host.
//!
//! Handler failures are not errors at this level: they are converted into
//! [`ErrorEntry`](crate::wire::ErrorEntry) values and shipped back in the reply.

use std::io;

use crate::wire::MessageId;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid endpoint '{0}': expected tcp://host:port")]
    InvalidEndpoint(String),

    #[error("transport io error: {0}")]
    Io(#[from] io::Error),

    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("connection closed by peer")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Single-flight violation on the local side.
    #[error("request {0} is still awaiting a deferred reply")]
    RequestPending(MessageId),

    #[error("local queue is full ({0} messages waiting)")]
    QueueFull(usize),

    #[error("a request is already held")]
    AlreadyHeld,

    #[error("release called with no held request")]
    NotHeld,

    #[error("request has already been answered")]
    AlreadyReplied,

    /// reply() or hold() called outside of process_message.
    #[error("no request is being dispatched")]
    NoActiveRequest,

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("unknown event '{0}'")]
    UnknownEvent(String),

    #[error("malformed '{name}' event: {reason}")]
    MalformedEvent { name: String, reason: String },
}

impl ProtocolError {
    pub fn malformed(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::MalformedEvent {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("timed out waiting for reply to {0}")]
    ReplyTimeout(MessageId),

    #[error("bridge is shut down")]
    Shutdown,
}

impl From<io::Error> for BridgeError {
    fn from(e: io::Error) -> Self {
        Self::Transport(TransportError::Io(e))
    }
}
