//! Outbound message transports.
//!
//! The engine only needs "push these bytes"; the socket type is a detail of
//! the [`Transport`] implementation. [`ZmqPushTransport`] is what a real
//! consumer connects to, [`ChannelTransport`] keeps everything in-process.

use async_trait::async_trait;
use tokio::sync::mpsc;
use zeromq::{PushSocket, Socket, SocketSend, ZmqMessage};

use crate::error::{DetectorError, DetectorResult};

/// Sink for encoded stream messages. Sends are not retried.
#[async_trait]
pub trait Transport: Send {
    /// Pushes one encoded message.
    async fn send(&mut self, payload: Vec<u8>) -> DetectorResult<()>;

    /// Human-readable endpoint, for logs.
    fn endpoint(&self) -> String;
}

/// ZeroMQ PUSH socket bound to a local endpoint.
pub struct ZmqPushTransport {
    socket: PushSocket,
    endpoint: String,
}

impl ZmqPushTransport {
    /// Binds a PUSH socket, e.g. on `tcp://0.0.0.0:5555`.
    pub async fn bind(address: &str) -> DetectorResult<Self> {
        let mut socket = PushSocket::new();
        let endpoint = socket
            .bind(address)
            .await
            .map_err(|e| DetectorError::Transport(format!("ZMQ PUSH bind error on {address}: {e}")))?;
        tracing::info!(%endpoint, "ZMQ PUSH socket bound");
        Ok(Self {
            socket,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl Transport for ZmqPushTransport {
    async fn send(&mut self, payload: Vec<u8>) -> DetectorResult<()> {
        self.socket
            .send(ZmqMessage::from(payload))
            .await
            .map_err(|e| DetectorError::Transport(format!("ZMQ send error: {e}")))
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

/// In-process transport; every payload is forwarded to a channel receiver.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelTransport {
    /// Creates the transport and the receiving end of its channel.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, payload: Vec<u8>) -> DetectorResult<()> {
        self.tx
            .send(payload)
            .map_err(|_| DetectorError::Transport("channel receiver dropped".into()))
    }

    fn endpoint(&self) -> String {
        "inproc://channel".into()
    }
}
