//! Bridge configuration.

use std::time::Duration;

use crate::bridge::protocol::{DeviceEvent, InitConfig};
use crate::bridge::transport::Endpoint;
use crate::error::TransportError;

pub const DEFAULT_REMOTE_ADDRESS: &str = "tcp://*:5556";
pub const DEFAULT_LOCAL_ADDRESS: &str = "tcp://*:5557";

pub const REMOTE_ADDRESS_ENV: &str = "HALBRIDGE_REMOTE_ADDRESS";
pub const LOCAL_ADDRESS_ENV: &str = "HALBRIDGE_LOCAL_ADDRESS";

/// Host-side bridge configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name of the host module this bridge stands in for. Response sources
    /// are rewritten to it.
    pub module_name: String,
    pub request_endpoint: Endpoint,
    pub notify_endpoint: Endpoint,
    pub poll_interval: Duration,
    pub reply_timeout: Duration,
    pub connect_timeout: Duration,
    pub close_timeout: Duration,
    /// How long a held request may stay pending. `None` waits forever.
    pub pending_timeout: Option<Duration>,
    /// Host messages allowed to wait behind a pending request. Further
    /// messages are rejected with `ProtocolError::QueueFull`.
    pub max_queued: usize,
    /// Events sent to the remote right after connecting, in order.
    pub connect_events: Vec<DeviceEvent>,
    /// Keep a `CameraMirror` for the remote camera.
    pub mirror_camera: bool,
}

impl ClientConfig {
    pub fn new(
        module_name: impl Into<String>,
        request_endpoint: Endpoint,
        notify_endpoint: Endpoint,
    ) -> Self {
        Self {
            module_name: module_name.into(),
            request_endpoint,
            notify_endpoint,
            poll_interval: Duration::from_millis(50),
            reply_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            pending_timeout: None,
            max_queued: 256,
            connect_events: Vec::new(),
            mirror_camera: false,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = Some(timeout);
        self
    }

    pub fn with_max_queued(mut self, max_queued: usize) -> Self {
        self.max_queued = max_queued;
        self
    }

    /// Send `event` as soon as the bridge connects, e.g. the camera `init`.
    pub fn with_connect_event(mut self, event: DeviceEvent) -> Self {
        self.connect_events.push(event);
        self
    }

    /// Stand in for a remote camera: send `init` on connect and mirror its
    /// functionality on the host side.
    pub fn with_camera(self, init: InitConfig) -> Self {
        let mut config = self.with_connect_event(DeviceEvent::Init(init));
        config.mirror_camera = true;
        config
    }
}

/// Remote-side bridge configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub request_endpoint: Endpoint,
    pub notify_endpoint: Endpoint,
    pub poll_interval: Duration,
}

impl ServerConfig {
    pub fn new(request_endpoint: Endpoint, notify_endpoint: Endpoint) -> Self {
        Self {
            request_endpoint,
            notify_endpoint,
            poll_interval: Duration::from_millis(10),
        }
    }

    /// Endpoints from `HALBRIDGE_REMOTE_ADDRESS` / `HALBRIDGE_LOCAL_ADDRESS`,
    /// falling back to the defaults.
    pub fn from_env() -> Result<Self, TransportError> {
        let request = std::env::var(REMOTE_ADDRESS_ENV)
            .unwrap_or_else(|_| DEFAULT_REMOTE_ADDRESS.to_string());
        let notify = std::env::var(LOCAL_ADDRESS_ENV)
            .unwrap_or_else(|_| DEFAULT_LOCAL_ADDRESS.to_string());
        Ok(Self::new(request.parse()?, notify.parse()?))
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_defaults() {
        let config = ClientConfig::new(
            "camera1",
            "tcp://localhost:5556".parse().unwrap(),
            "tcp://localhost:5557".parse().unwrap(),
        );
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.pending_timeout, None);
        assert_eq!(config.max_queued, 256);
        assert!(config.connect_events.is_empty());
    }

    #[test]
    fn client_builders() {
        let config = ClientConfig::new(
            "focuslock",
            Endpoint::new("127.0.0.1", 1),
            Endpoint::new("127.0.0.1", 2),
        )
        .with_poll_interval(Duration::from_millis(5))
        .with_pending_timeout(Duration::from_secs(1))
        .with_max_queued(2)
        .with_connect_event(DeviceEvent::Connected(true));
        assert_eq!(config.poll_interval, Duration::from_millis(5));
        assert_eq!(config.pending_timeout, Some(Duration::from_secs(1)));
        assert_eq!(config.max_queued, 2);
        assert_eq!(config.connect_events, vec![DeviceEvent::Connected(true)]);
    }

    #[test]
    fn camera_config_sends_init_on_connect() {
        let init = InitConfig {
            camera_name: "camera1".into(),
            remote_save: false,
            camera_params: Default::default(),
        };
        let config = ClientConfig::new(
            "camera1",
            Endpoint::new("127.0.0.1", 1),
            Endpoint::new("127.0.0.1", 2),
        )
        .with_camera(init.clone());
        assert!(config.mirror_camera);
        assert_eq!(config.connect_events, vec![DeviceEvent::Init(init)]);
    }

    #[test]
    fn server_defaults_parse() {
        let config = ServerConfig::new(
            DEFAULT_REMOTE_ADDRESS.parse().unwrap(),
            DEFAULT_LOCAL_ADDRESS.parse().unwrap(),
        );
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.request_endpoint.port(), 5556);
        assert_eq!(config.notify_endpoint.port(), 5557);
    }
}
