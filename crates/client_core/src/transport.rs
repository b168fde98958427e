use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use shared::frame::{Frame, FrameCommand, WireFrame};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Error as WsError, Message,
    },
};
use tracing::{debug, warn};

use crate::error::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Frame(Frame),
    Heartbeat,
    Closed(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("credential rejected during handshake: {0}")]
    Unauthorized(String),
    #[error("handshake rejected: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("handshake timed out")]
    Timeout,
}

/// Heart-beat periods agreed in the CONNECT/CONNECTED exchange. `None`
/// means that direction carries no beats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Heartbeats {
    pub send: Option<Duration>,
    pub expect: Option<Duration>,
}

impl Heartbeats {
    pub fn every(period: Duration) -> Self {
        Self {
            send: Some(period),
            expect: Some(period),
        }
    }

    /// Combines the client's proposal `proposed` (used for both directions)
    /// with the `heart-beat` header of CONNECTED. A missing or malformed
    /// header means the server neither sends nor wants beats.
    pub fn negotiate(proposed: Duration, server_header: Option<&str>) -> Self {
        let (server_sends, server_wants) = server_header
            .and_then(|value| value.split_once(','))
            .and_then(|(sx, sy)| Some((sx.trim().parse::<u64>().ok()?, sy.trim().parse::<u64>().ok()?)))
            .unwrap_or((0, 0));
        let proposed_ms = proposed.as_millis() as u64;
        let agree = |server_ms: u64| {
            (proposed_ms > 0 && server_ms > 0)
                .then(|| Duration::from_millis(proposed_ms.max(server_ms)))
        };
        Self {
            send: agree(server_wants),
            expect: agree(server_sends),
        }
    }
}

pub struct TransportLink {
    outbound: mpsc::UnboundedSender<WireFrame>,
    inbound: mpsc::UnboundedReceiver<LinkEvent>,
    reader: Option<JoinHandle<()>>,
    heartbeats: Heartbeats,
}

impl TransportLink {
    pub fn new(
        outbound: mpsc::UnboundedSender<WireFrame>,
        inbound: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            reader: None,
            heartbeats: Heartbeats::default(),
        }
    }

    pub fn with_heartbeats(mut self, heartbeats: Heartbeats) -> Self {
        self.heartbeats = heartbeats;
        self
    }

    pub fn heartbeats(&self) -> Heartbeats {
        self.heartbeats
    }

    fn with_reader(mut self, reader: JoinHandle<()>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn send(&self, frame: WireFrame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    pub async fn recv(&mut self) -> LinkEvent {
        self.inbound
            .recv()
            .await
            .unwrap_or(LinkEvent::Closed(None))
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        // The writer drains and closes once `outbound` is dropped.
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Opens the transport with `bearer_token` as the connect-time credential
    /// and completes the protocol handshake.
    async fn connect(
        &self,
        endpoint: &str,
        bearer_token: &str,
    ) -> Result<TransportLink, HandshakeError>;
}

pub struct MissingTransportConnector;

#[async_trait]
impl TransportConnector for MissingTransportConnector {
    async fn connect(
        &self,
        _endpoint: &str,
        _bearer_token: &str,
    ) -> Result<TransportLink, HandshakeError> {
        Err(HandshakeError::Transport("no transport configured".into()))
    }
}

pub struct WebSocketConnector {
    heartbeat: Duration,
}

impl WebSocketConnector {
    pub fn new(heartbeat: Duration) -> Self {
        Self { heartbeat }
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(
        &self,
        endpoint: &str,
        bearer_token: &str,
    ) -> Result<TransportLink, HandshakeError> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|err| HandshakeError::Transport(format!("invalid endpoint {endpoint}: {err}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {bearer_token}"))
            .map_err(|_| HandshakeError::Unauthorized("token is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);
        let host = request.uri().host().unwrap_or("localhost").to_string();

        let (ws_stream, _) = connect_async(request).await.map_err(map_upgrade_error)?;
        let (mut sink, mut stream) = ws_stream.split();

        let connect = Frame::connect(&host, bearer_token, self.heartbeat.as_millis() as u64);
        sink.send(Message::Text(connect.encode()))
            .await
            .map_err(|err| HandshakeError::Transport(err.to_string()))?;
        let connected = await_connected(&mut stream).await?;
        let heartbeats = Heartbeats::negotiate(self.heartbeat, connected.get("heart-beat"));
        debug!(endpoint, ?heartbeats, "transport: STOMP session established");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WireFrame>();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(err) = sink.send(Message::Text(frame.encode())).await {
                    debug!("transport: writer stopped: {err}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let event = match WireFrame::decode(&text) {
                            Ok(WireFrame::Heartbeat) => LinkEvent::Heartbeat,
                            Ok(WireFrame::Frame(frame)) => LinkEvent::Frame(frame),
                            Err(err) => {
                                warn!("transport: dropping {}", ProtocolError::from(err));
                                continue;
                            }
                        };
                        if in_tx.send(event).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(close))) => {
                        break close.map(|frame| frame.reason.to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break Some(err.to_string()),
                    None => break None,
                }
            };
            let _ = in_tx.send(LinkEvent::Closed(reason));
        });

        Ok(TransportLink::new(out_tx, in_rx)
            .with_reader(reader)
            .with_heartbeats(heartbeats))
    }
}

fn map_upgrade_error(err: WsError) -> HandshakeError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                HandshakeError::Unauthorized(format!("upgrade rejected with status {status}"))
            } else {
                HandshakeError::Rejected(format!("upgrade failed with status {status}"))
            }
        }
        other => HandshakeError::Transport(other.to_string()),
    }
}

async fn await_connected<S>(stream: &mut S) -> Result<Frame, HandshakeError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(message) = stream.next().await {
        let message = message.map_err(|err| HandshakeError::Transport(err.to_string()))?;
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match WireFrame::decode(&text) {
            Ok(WireFrame::Heartbeat) => {}
            Ok(WireFrame::Frame(frame)) => match frame.command {
                FrameCommand::Connected => return Ok(frame),
                FrameCommand::Error => return Err(classify_error_frame(&frame)),
                other => debug!(
                    command = other.as_str(),
                    "transport: ignoring frame before CONNECTED"
                ),
            },
            Err(err) => {
                return Err(HandshakeError::Rejected(format!(
                    "malformed handshake frame: {err}"
                )))
            }
        }
    }
    Err(HandshakeError::Transport(
        "connection closed during handshake".into(),
    ))
}

/// ERROR frames that name an authentication problem are credential failures.
pub fn classify_error_frame(frame: &Frame) -> HandshakeError {
    let detail = frame
        .get("message")
        .map(str::to_string)
        .unwrap_or_else(|| frame.body.trim().to_string());
    let lowered = format!("{} {}", detail, frame.body).to_ascii_lowercase();
    let is_auth = ["unauthorized", "401", "403", "forbidden", "expired", "invalid token", "authentication"]
        .iter()
        .any(|needle| lowered.contains(needle));
    if is_auth {
        HandshakeError::Unauthorized(detail)
    } else {
        HandshakeError::Rejected(detail)
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
