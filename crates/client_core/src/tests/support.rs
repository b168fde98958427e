use std::{
    collections::VecDeque,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{EncodingKey, Header};
use serde::Serialize;
use shared::{
    domain::{ChatId, MessageId, MessageType, UserId},
    frame::{Frame, FrameCommand, WireFrame},
    protocol::{MessageEnvelope, UserSummary},
};
use tokio::{sync::mpsc, time::timeout};

use crate::{
    credential::Credential,
    transport::{HandshakeError, Heartbeats, LinkEvent, TransportConnector, TransportLink},
};

#[derive(Serialize)]
struct Claims<'a> {
    sub: &'a str,
    exp: i64,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    jti: Option<&'a str>,
}

/// Mints an HS256 token for `subject` expiring `ttl_secs` from now.
pub fn mint_token(subject: &str, ttl_secs: i64) -> String {
    mint_token_with_nonce(subject, ttl_secs, None)
}

pub fn mint_token_with_nonce(subject: &str, ttl_secs: i64, nonce: Option<&str>) -> String {
    let claims = Claims {
        sub: subject,
        exp: Utc::now().timestamp() + ttl_secs,
        name: "Test User",
        jti: nonce,
    };
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"test-secret"),
    )
    .expect("mint token")
}

pub fn credential_for(subject: &str) -> Credential {
    Credential::from_token(mint_token(subject, 3600), None).expect("credential")
}

pub fn ts(raw: &str) -> DateTime<Utc> {
    raw.parse().expect("timestamp")
}

pub fn new_envelope(id: &str, chat_id: &str, sender_id: &str, content: &str, sent_at: &str) -> MessageEnvelope {
    MessageEnvelope {
        id: MessageId::from(id),
        chat_id: Some(ChatId::from(chat_id)),
        sender: Some(UserSummary {
            id: UserId::from(sender_id),
            username: format!("user-{sender_id}"),
            display_name: None,
        }),
        content: Some(content.to_string()),
        attachment: None,
        message_type: Some(MessageType::Text),
        sent_at: Some(ts(sent_at)),
        command: None,
        edited_at: None,
        edited: false,
        deleted: false,
    }
}

/// Polls `check` until it returns true or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Step {
    Accept,
    Unauthorized,
    Fail,
}

/// Test-side end of an accepted link.
pub struct ServerSide {
    pub token: String,
    pub from_client: mpsc::UnboundedReceiver<WireFrame>,
    pub to_client: mpsc::UnboundedSender<LinkEvent>,
}

impl ServerSide {
    pub fn deliver(&self, destination: &str, body: &str) {
        let frame = Frame::new(FrameCommand::Message)
            .header("destination", destination)
            .with_body(body);
        let _ = self.to_client.send(LinkEvent::Frame(frame));
    }
}

/// In-memory transport. Each connect consumes one scripted step and accepts
/// once the script runs out.
pub struct ScriptedConnector {
    script: StdMutex<VecDeque<Step>>,
    tokens: StdMutex<Vec<String>>,
    heartbeats: StdMutex<Heartbeats>,
    accepted: mpsc::UnboundedSender<ServerSide>,
}

impl ScriptedConnector {
    pub fn new(steps: &[Step]) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: StdMutex::new(steps.iter().copied().collect()),
            tokens: StdMutex::new(Vec::new()),
            heartbeats: StdMutex::new(Heartbeats::default()),
            accepted,
        });
        (connector, rx)
    }

    pub fn attempts(&self) -> usize {
        self.tokens.lock().expect("tokens lock").len()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().expect("tokens lock").clone()
    }

    /// Heart-beats agreed on every link accepted from now on.
    pub fn set_heartbeats(&self, heartbeats: Heartbeats) {
        *self.heartbeats.lock().expect("heartbeats lock") = heartbeats;
    }
}

#[async_trait]
impl TransportConnector for ScriptedConnector {
    async fn connect(
        &self,
        _endpoint: &str,
        bearer_token: &str,
    ) -> Result<TransportLink, HandshakeError> {
        self.tokens
            .lock()
            .expect("tokens lock")
            .push(bearer_token.to_string());
        let step = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(Step::Accept);
        match step {
            Step::Unauthorized => Err(HandshakeError::Unauthorized("401".into())),
            Step::Fail => Err(HandshakeError::Transport("connection refused".into())),
            Step::Accept => {
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                let (in_tx, in_rx) = mpsc::unbounded_channel();
                let _ = self.accepted.send(ServerSide {
                    token: bearer_token.to_string(),
                    from_client: out_rx,
                    to_client: in_tx,
                });
                let heartbeats = *self.heartbeats.lock().expect("heartbeats lock");
                Ok(TransportLink::new(out_tx, in_rx).with_heartbeats(heartbeats))
            }
        }
    }
}

pub async fn next_link(links: &mut mpsc::UnboundedReceiver<ServerSide>) -> ServerSide {
    timeout(Duration::from_secs(2), links.recv())
        .await
        .expect("link within timeout")
        .expect("connector alive")
}

/// Next non-heartbeat frame written by the client.
pub async fn next_frame(server: &mut ServerSide) -> Frame {
    loop {
        let wire = timeout(Duration::from_secs(2), server.from_client.recv())
            .await
            .expect("frame within timeout")
            .expect("client side open");
        if let WireFrame::Frame(frame) = wire {
            return frame;
        }
    }
}
