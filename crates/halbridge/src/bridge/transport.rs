//! TCP socket pair between host and remote.
//!
//! The remote binds two endpoints and the host connects to both:
//! - **request**: host sends [`RequestFrame`], remote answers with [`ReplyFrame`]
//! - **notify**: remote pushes [`NotifyFrame`], nothing flows back

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::WireCodec;
use super::protocol::{NotifyFrame, ReplyFrame, RequestFrame};
use crate::error::TransportError;

const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// A `tcp://host:port` address. `*` as host binds every interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn bind_addr(&self) -> String {
        match self.host.as_str() {
            "*" => format!("0.0.0.0:{}", self.port),
            host => format!("{host}:{}", self.port),
        }
    }

    fn connect_addr(&self) -> String {
        match self.host.as_str() {
            "*" => format!("127.0.0.1:{}", self.port),
            host => format!("{host}:{}", self.port),
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidEndpoint(s.to_string());
        let rest = s.strip_prefix("tcp://").ok_or_else(invalid)?;
        let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        let host = match addr {
            SocketAddr::V4(v4) => v4.ip().to_string(),
            SocketAddr::V6(v6) => format!("[{}]", v6.ip()),
        };
        Self::new(host, addr.port())
    }
}

async fn connect_with_retry(endpoint: &Endpoint, deadline: Instant) -> Result<TcpStream, TransportError> {
    let addr = endpoint.connect_addr();
    loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                tracing::trace!(%endpoint, "Connected");
                return Ok(stream);
            }
            Err(e) => {
                if Instant::now() + CONNECT_RETRY > deadline {
                    tracing::debug!(%endpoint, error = %e, "Giving up on connect");
                    return Err(TransportError::ConnectTimeout(endpoint.to_string()));
                }
                tracing::trace!(%endpoint, error = %e, "Connect failed, retrying");
                tokio::time::sleep(CONNECT_RETRY).await;
            }
        }
    }
}

/// Host side of the socket pair.
pub struct ClientTransport {
    pub requests: FramedWrite<OwnedWriteHalf, WireCodec<RequestFrame>>,
    pub replies: FramedRead<OwnedReadHalf, WireCodec<ReplyFrame>>,
    pub notify: FramedRead<TcpStream, WireCodec<NotifyFrame>>,
}

impl ClientTransport {
    /// Connect to both endpoints, retrying until `timeout` elapses.
    pub async fn connect(
        request: &Endpoint,
        notify: &Endpoint,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let deadline = Instant::now() + timeout;
        tracing::debug!(%request, %notify, "Connecting bridge transport");

        let request_stream = connect_with_retry(request, deadline).await?;
        let notify_stream = connect_with_retry(notify, deadline).await?;

        let (read, write) = request_stream.into_split();
        Ok(Self {
            requests: FramedWrite::new(write, WireCodec::new()),
            replies: FramedRead::new(read, WireCodec::new()),
            notify: FramedRead::new(notify_stream, WireCodec::new()),
        })
    }
}

/// Remote side of one connected session.
pub struct ServerConnection {
    pub requests: FramedRead<OwnedReadHalf, WireCodec<RequestFrame>>,
    pub replies: FramedWrite<OwnedWriteHalf, WireCodec<ReplyFrame>>,
    pub notify: FramedWrite<TcpStream, WireCodec<NotifyFrame>>,
}

/// Bound request and notify listeners.
pub struct BridgeListener {
    request: TcpListener,
    notify: TcpListener,
}

impl BridgeListener {
    pub async fn bind(request: &Endpoint, notify: &Endpoint) -> Result<Self, TransportError> {
        let request_listener = TcpListener::bind(request.bind_addr()).await?;
        let notify_listener = TcpListener::bind(notify.bind_addr()).await?;
        tracing::debug!(%request, %notify, "Bound bridge endpoints");
        Ok(Self {
            request: request_listener,
            notify: notify_listener,
        })
    }

    pub fn request_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.request.local_addr()?)
    }

    pub fn notify_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.notify.local_addr()?)
    }

    /// Wait for the host to connect to both endpoints.
    pub async fn accept(&self) -> Result<ServerConnection, TransportError> {
        tracing::trace!("Waiting for host connection");
        let ((request_stream, request_peer), (notify_stream, _)) =
            tokio::try_join!(self.request.accept(), self.notify.accept())?;
        request_stream.set_nodelay(true)?;
        notify_stream.set_nodelay(true)?;
        tracing::debug!(peer = %request_peer, "Host connected");

        let (read, write) = request_stream.into_split();
        Ok(ServerConnection {
            requests: FramedRead::new(read, WireCodec::new()),
            replies: FramedWrite::new(write, WireCodec::new()),
            notify: FramedWrite::new(notify_stream, WireCodec::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};

    #[test]
    fn endpoint_parses_wildcard_and_host() {
        let any: Endpoint = "tcp://*:5556".parse().unwrap();
        assert_eq!(any.host(), "*");
        assert_eq!(any.port(), 5556);
        assert_eq!(any.bind_addr(), "0.0.0.0:5556");

        let local: Endpoint = "tcp://localhost:5557".parse().unwrap();
        assert_eq!(local.connect_addr(), "localhost:5557");
        assert_eq!(local.to_string(), "tcp://localhost:5557");
    }

    #[test]
    fn endpoint_rejects_garbage() {
        for bad in ["localhost:5556", "tcp://:5556", "tcp://host", "tcp://host:port", "ipc:///tmp/x"] {
            assert!(
                matches!(bad.parse::<Endpoint>(), Err(TransportError::InvalidEndpoint(_))),
                "{bad} should not parse"
            );
        }
    }

    #[tokio::test]
    async fn connect_times_out_without_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint::new("127.0.0.1", port);
        let result =
            ClientTransport::connect(&endpoint, &endpoint, Duration::from_millis(150)).await;
        assert!(matches!(result, Err(TransportError::ConnectTimeout(_))));
    }

    #[tokio::test]
    async fn frames_cross_both_paths() {
        let loopback = Endpoint::new("127.0.0.1", 0);
        let listener = BridgeListener::bind(&loopback, &loopback).await.unwrap();
        let request = Endpoint::from(listener.request_addr().unwrap());
        let notify = Endpoint::from(listener.notify_addr().unwrap());

        let (server, client) = tokio::join!(
            listener.accept(),
            ClientTransport::connect(&request, &notify, Duration::from_secs(2))
        );
        let mut server = server.unwrap();
        let mut client = client.unwrap();

        client.requests.send(RequestFrame::Close).await.unwrap();
        assert_eq!(
            server.requests.next().await.unwrap().unwrap(),
            RequestFrame::Close
        );

        server.replies.send(ReplyFrame::Ack).await.unwrap();
        assert_eq!(client.replies.next().await.unwrap().unwrap(), ReplyFrame::Ack);

        let event = crate::bridge::protocol::DeviceEvent::Started.encode().unwrap();
        server
            .notify
            .send(NotifyFrame::Event { event: event.clone() })
            .await
            .unwrap();
        assert_eq!(
            client.notify.next().await.unwrap().unwrap(),
            NotifyFrame::Event { event }
        );
    }
}
