//! Host-side collaborator surface.
//!
//! The host application owns its message bus and message lifecycle. The bridge
//! only sees it through [`HostMessage`] and [`HostBus`]. [`HalMessage`] is a plain
//! in-process implementation, used when the bridge has to build host messages
//! itself (remote `sendMessage` events) and by tests.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Value};

use crate::bridge::protocol::DeviceEvent;
use crate::wire::{ErrorEntry, MessageId, ResponseEntry, WireMessage};

/// Data carried by a host message.
pub type HostData = BTreeMap<String, HostValue>;

/// A handle to something that only exists inside the host process.
pub trait HostObject: fmt::Debug + Send + Sync {
    fn type_name(&self) -> &'static str;

    /// Wire-safe stand-in for this object, if it has one.
    fn wire_projection(&self) -> Option<Value> {
        None
    }
}

/// A value in host message data.
#[derive(Debug, Clone)]
pub enum HostValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    List(Vec<HostValue>),
    Map(HostData),
    Object(Arc<dyn HostObject>),
}

impl From<Value> for HostValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => HostValue::Null,
            Value::Bool(b) => HostValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    HostValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    HostValue::UInt(u)
                } else {
                    HostValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => HostValue::String(s),
            Value::Array(items) => HostValue::List(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => HostValue::Map(host_data_from(map)),
        }
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::String(s.to_string())
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Bool(b)
    }
}

impl From<i64> for HostValue {
    fn from(i: i64) -> Self {
        HostValue::Int(i)
    }
}

impl From<f64> for HostValue {
    fn from(f: f64) -> Self {
        HostValue::Float(f)
    }
}

/// Convert wire data back into host data.
pub fn host_data_from(map: Map<String, Value>) -> HostData {
    map.into_iter().map(|(k, v)| (k, HostValue::from(v))).collect()
}

/// The capabilities the bridge needs from a host message.
///
/// Reference counting belongs to the host: the bridge calls
/// [`inc_ref_count`](Self::inc_ref_count) when it takes a message into its care and
/// [`dec_ref_count`](Self::dec_ref_count) exactly once when it is done with it.
pub trait HostMessage: Send + Sync {
    fn id(&self) -> MessageId;

    fn message_type(&self) -> &str;

    fn source_name(&self) -> &str;

    fn data(&self) -> &HostData;

    fn add_response(&self, response: ResponseEntry);

    fn add_error(&self, error: ErrorEntry);

    fn inc_ref_count(&self);

    fn dec_ref_count(&self);

    fn is_type(&self, message_type: &str) -> bool {
        self.message_type() == message_type
    }

    fn source_is(&self, source_name: &str) -> bool {
        self.source_name() == source_name
    }
}

/// Host message bus as seen by the local bridge.
pub trait HostBus: Send + Sync {
    /// Broadcast a message originated by the remote side.
    fn send_message(&self, message: HalMessage);

    /// Re-emit a device signal received from the remote side.
    fn device_event(&self, event: DeviceEvent) {
        tracing::trace!(event = event.name(), "Device event ignored by host bus");
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Host message mutex poisoned - recovering");
            poisoned.into_inner()
        }
    }
}

/// In-process host message.
#[derive(Debug)]
pub struct HalMessage {
    id: MessageId,
    message_type: String,
    source_name: String,
    data: HostData,
    responses: Mutex<Vec<ResponseEntry>>,
    errors: Mutex<Vec<ErrorEntry>>,
    ref_count: AtomicI64,
}

impl HalMessage {
    pub fn new(
        message_type: impl Into<String>,
        source_name: impl Into<String>,
        data: HostData,
    ) -> Self {
        Self {
            id: MessageId::new(),
            message_type: message_type.into(),
            source_name: source_name.into(),
            data,
            responses: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            ref_count: AtomicI64::new(0),
        }
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    /// Rebuild a host message from its wire form, keeping any accumulated outcome.
    pub fn from_wire(message: WireMessage) -> Self {
        let id = message.id();
        let message_type = message.message_type().to_string();
        let source_name = message.source_name().to_string();
        let data = host_data_from(message.data().clone());
        let (responses, errors) = message.into_outcome();
        Self {
            id,
            message_type,
            source_name,
            data,
            responses: Mutex::new(responses),
            errors: Mutex::new(errors),
            ref_count: AtomicI64::new(0),
        }
    }

    pub fn responses(&self) -> Vec<ResponseEntry> {
        lock(&self.responses).clone()
    }

    pub fn errors(&self) -> Vec<ErrorEntry> {
        lock(&self.errors).clone()
    }

    pub fn ref_count(&self) -> i64 {
        self.ref_count.load(Ordering::SeqCst)
    }
}

impl HostMessage for HalMessage {
    fn id(&self) -> MessageId {
        self.id
    }

    fn message_type(&self) -> &str {
        &self.message_type
    }

    fn source_name(&self) -> &str {
        &self.source_name
    }

    fn data(&self) -> &HostData {
        &self.data
    }

    fn add_response(&self, response: ResponseEntry) {
        lock(&self.responses).push(response);
    }

    fn add_error(&self, error: ErrorEntry) {
        lock(&self.errors).push(error);
    }

    fn inc_ref_count(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    fn dec_ref_count(&self) {
        self.ref_count.fetch_sub(1, Ordering::SeqCst);
    }
}
