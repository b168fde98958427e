use std::{collections::VecDeque, sync::Arc, time::Duration};

use shared::frame::{Frame, FrameCommand, WireFrame};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    credential::{CredentialChange, CredentialCoordinator, CredentialSubscription},
    error::ConnectionError,
    subscriptions::{SubscriptionRegistry, TopicHandler},
    transport::{HandshakeError, Heartbeats, LinkEvent, TransportConnector, TransportLink},
};

/// Expected heart-beat periods without inbound traffic before the link counts as dead.
const STALE_HEARTBEATS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Offline { attempts: u32 },
    /// The server refused the credential even after one refresh.
    AuthRejected(String),
    /// The credential was cleared; the connection will not come back on its own.
    SessionEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishReceipt {
    Sent,
    Queued,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub endpoint: String,
    pub handshake_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub health_probe_interval: Duration,
    pub pending_queue_limit: usize,
}

impl ConnectionConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            handshake_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(10),
            health_probe_interval: Duration::from_secs(30),
            pending_queue_limit: 64,
        }
    }
}

enum Command {
    Activate,
    Deactivate,
    EndSession {
        reply: oneshot::Sender<()>,
    },
    Subscribe {
        topic: String,
        handler: TopicHandler,
        reply: oneshot::Sender<bool>,
    },
    Unsubscribe {
        topic: String,
        reply: oneshot::Sender<bool>,
    },
    Publish {
        destination: String,
        body: String,
        reply: oneshot::Sender<Result<PublishReceipt, ConnectionError>>,
    },
    Topics {
        reply: oneshot::Sender<Vec<String>>,
    },
    Shutdown,
}

pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn spawn(
        config: ConnectionConfig,
        connector: Arc<dyn TransportConnector>,
        credentials: Arc<CredentialCoordinator>,
    ) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(256);
        let credential_changes = credentials.on_change();

        let actor = ConnectionActor {
            config,
            connector,
            credentials,
            credential_changes,
            commands: command_rx,
            state: state_tx,
            events: events.clone(),
            registry: SubscriptionRegistry::new(),
            link: None,
            link_token: None,
            active: false,
            reconnect_attempt: 0,
            reconnect_at: None,
            last_inbound: Instant::now(),
            heartbeats: Heartbeats::default(),
            pending: VecDeque::new(),
        };
        let task = tokio::spawn(actor.run());

        Arc::new(Self {
            commands: command_tx,
            state: state_rx,
            events,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn activate(&self) {
        let _ = self.commands.send(Command::Activate);
    }

    pub fn deactivate(&self) {
        let _ = self.commands.send(Command::Deactivate);
    }

    /// Closes the link and forgets every topic. Commands sent after this
    /// returns belong to the next session.
    pub async fn end_session(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::EndSession { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Registers `handler` for `topic`. Returns false when the topic already
    /// had a handler, which is left in place.
    pub async fn subscribe(&self, topic: &str, handler: TopicHandler) -> bool {
        let (reply, rx) = oneshot::channel();
        let command = Command::Subscribe {
            topic: topic.to_string(),
            handler,
            reply,
        };
        if self.commands.send(command).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn unsubscribe(&self, topic: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let command = Command::Unsubscribe {
            topic: topic.to_string(),
            reply,
        };
        if self.commands.send(command).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Sends a SEND frame, or queues it until the next handshake when the
    /// manager is active but not connected.
    pub async fn publish(
        &self,
        destination: &str,
        body: String,
    ) -> Result<PublishReceipt, ConnectionError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Publish {
            destination: destination.to_string(),
            body,
            reply,
        };
        self.commands
            .send(command)
            .map_err(|_| ConnectionError::Closed)?;
        rx.await.map_err(|_| ConnectionError::Closed)?
    }

    pub async fn topics(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Topics { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub async fn wait_for_connected(&self, limit: Duration) -> bool {
        let mut state = self.state.clone();
        let reached = timeout(
            limit,
            state.wait_for(|current| *current == ConnectionState::Connected),
        )
        .await;
        matches!(reached, Ok(Ok(_)))
    }

    pub async fn dispose(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

enum EstablishError {
    AuthRejected(String),
    Transport(ConnectionError),
}

struct ConnectionActor {
    config: ConnectionConfig,
    connector: Arc<dyn TransportConnector>,
    credentials: Arc<CredentialCoordinator>,
    credential_changes: CredentialSubscription,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    registry: SubscriptionRegistry,
    link: Option<TransportLink>,
    link_token: Option<String>,
    active: bool,
    reconnect_attempt: u32,
    reconnect_at: Option<Instant>,
    last_inbound: Instant,
    heartbeats: Heartbeats,
    pending: VecDeque<Frame>,
}

impl ConnectionActor {
    async fn run(mut self) {
        let heartbeat_period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let probe_period = self
            .config
            .health_probe_interval
            .max(Duration::from_millis(1));
        let mut heartbeat = interval_at(Instant::now() + heartbeat_period, heartbeat_period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut probe = interval_at(Instant::now() + probe_period, probe_period);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        self.deactivate();
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Some(change) = self.credential_changes.recv() => {
                    self.handle_credential_change(change).await;
                }
                event = next_link_event(&mut self.link) => self.handle_link_event(event),
                _ = sleep_until_deadline(self.reconnect_at) => self.reconnect_tick().await,
                _ = heartbeat.tick() => self.heartbeat_tick(),
                _ = probe.tick() => self.health_probe().await,
            }
        }
        debug!("connection: actor stopped");
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Activate => self.activate().await,
            Command::Deactivate => self.deactivate(),
            Command::EndSession { reply } => {
                self.end_session();
                let _ = reply.send(());
            }
            Command::Subscribe {
                topic,
                handler,
                reply,
            } => {
                let created = match self.registry.register(&topic, handler) {
                    Some(frame) => {
                        if self.is_connected() {
                            self.send_frame(frame);
                        }
                        debug!(topic = %topic, "connection: topic registered");
                        true
                    }
                    None => false,
                };
                let _ = reply.send(created);
            }
            Command::Unsubscribe { topic, reply } => {
                let removed = match self.registry.remove(&topic) {
                    Some(frame) => {
                        if self.is_connected() {
                            self.send_frame(frame);
                        }
                        debug!(topic = %topic, "connection: topic removed");
                        true
                    }
                    None => false,
                };
                let _ = reply.send(removed);
            }
            Command::Publish {
                destination,
                body,
                reply,
            } => {
                let _ = reply.send(self.publish(Frame::send(&destination, body)));
            }
            Command::Topics { reply } => {
                let _ = reply.send(self.registry.topics());
            }
            Command::Shutdown => {
                self.deactivate();
                return false;
            }
        }
        true
    }

    fn publish(&mut self, frame: Frame) -> Result<PublishReceipt, ConnectionError> {
        if self.is_connected() && self.send_frame(frame.clone()) {
            return Ok(PublishReceipt::Sent);
        }
        if !self.active {
            return Err(ConnectionError::NotConnected);
        }
        if self.pending.len() >= self.config.pending_queue_limit {
            warn!(
                limit = self.config.pending_queue_limit,
                "connection: pending queue full, rejecting frame"
            );
            return Err(ConnectionError::QueueFull(self.config.pending_queue_limit));
        }
        self.pending.push_back(frame);
        Ok(PublishReceipt::Queued)
    }

    async fn activate(&mut self) {
        self.active = true;
        if self.link.is_some() || self.current_state() != ConnectionState::Disconnected {
            return;
        }
        self.set_state(ConnectionState::Connecting);
        match self.establish().await {
            Ok(()) => {}
            Err(EstablishError::AuthRejected(reason)) => self.fail_auth(reason),
            Err(EstablishError::Transport(err)) => self.begin_reconnect(&err.to_string()),
        }
    }

    fn deactivate(&mut self) {
        self.active = false;
        if let Some(link) = &self.link {
            link.send(WireFrame::Frame(Frame::disconnect()));
        }
        self.drop_link();
        self.reconnect_at = None;
        self.reconnect_attempt = 0;
        self.pending.clear();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Handshake with the live token; on an auth rejection, refresh once and
    /// retry with the new token.
    async fn establish(&mut self) -> Result<(), EstablishError> {
        let token = self
            .credentials
            .access_token()
            .ok_or_else(|| EstablishError::AuthRejected("no credential".into()))?;

        let reason = match self.handshake(&token).await {
            Ok(link) => {
                self.install(link, token);
                return Ok(());
            }
            Err(HandshakeError::Unauthorized(reason)) => reason,
            Err(other) => {
                let err = connection_error(other, self.config.handshake_timeout);
                return Err(EstablishError::Transport(err));
            }
        };

        warn!("connection: handshake rejected ({reason}), refreshing credential once");
        let fresh = self
            .credentials
            .refresh_if_current(&token)
            .await
            .map_err(|err| EstablishError::AuthRejected(err.to_string()))?;
        match self.handshake(&fresh.access_token).await {
            Ok(link) => {
                self.install(link, fresh.access_token);
                Ok(())
            }
            Err(HandshakeError::Unauthorized(reason)) => Err(EstablishError::AuthRejected(reason)),
            Err(other) => Err(EstablishError::Transport(connection_error(
                other,
                self.config.handshake_timeout,
            ))),
        }
    }

    async fn handshake(&self, token: &str) -> Result<TransportLink, HandshakeError> {
        debug!(endpoint = %self.config.endpoint, "connection: opening transport");
        timeout(
            self.config.handshake_timeout,
            self.connector.connect(&self.config.endpoint, token),
        )
        .await
        .unwrap_or(Err(HandshakeError::Timeout))
    }

    fn install(&mut self, link: TransportLink, token: String) {
        self.heartbeats = link.heartbeats();
        self.link = Some(link);
        self.link_token = Some(token);
        self.reconnect_attempt = 0;
        self.reconnect_at = None;
        self.last_inbound = Instant::now();
        self.set_state(ConnectionState::Connected);

        let subscriptions = self.registry.resubscribe_frames();
        let topics = subscriptions.len();
        for frame in subscriptions {
            self.send_frame(frame);
        }
        let flushed = self.pending.len();
        while let Some(frame) = self.pending.pop_front() {
            self.send_frame(frame);
        }
        info!(
            topics,
            flushed,
            heartbeats = ?self.heartbeats,
            "connection: established"
        );
        let _ = self.events.send(ConnectionEvent::Connected);
    }

    fn begin_reconnect(&mut self, reason: &str) {
        self.drop_link();
        if !self.active {
            self.set_state(ConnectionState::Disconnected);
            return;
        }
        warn!(reason, "connection: link lost, scheduling reconnect");
        self.reconnect_attempt = 0;
        self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
        self.set_state(ConnectionState::Reconnecting);
    }

    async fn reconnect_tick(&mut self) {
        self.reconnect_at = None;
        self.reconnect_attempt += 1;
        let attempt = self.reconnect_attempt;
        info!(
            attempt,
            max = self.config.max_reconnect_attempts,
            "connection: reconnect attempt"
        );
        match self.establish().await {
            Ok(()) => {}
            Err(EstablishError::AuthRejected(reason)) => self.fail_auth(reason),
            Err(EstablishError::Transport(err)) => {
                if attempt >= self.config.max_reconnect_attempts {
                    self.go_offline();
                } else {
                    warn!(attempt, "connection: reconnect failed: {err}");
                    self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
                }
            }
        }
    }

    fn go_offline(&mut self) {
        let attempts = self.reconnect_attempt;
        self.reconnect_attempt = 0;
        self.reconnect_at = None;
        self.set_state(ConnectionState::Disconnected);
        error!(attempts, "connection: reconnect attempts exhausted, offline");
        let _ = self.events.send(ConnectionEvent::Offline { attempts });
    }

    fn fail_auth(&mut self, reason: String) {
        self.drop_link();
        self.active = false;
        self.reconnect_at = None;
        self.reconnect_attempt = 0;
        self.pending.clear();
        self.set_state(ConnectionState::Disconnected);
        error!(reason = %reason, "connection: credential rejected by server");
        let _ = self.events.send(ConnectionEvent::AuthRejected(reason));
    }

    async fn handle_credential_change(&mut self, change: CredentialChange) {
        match change {
            CredentialChange::Updated(credential) => {
                // Pending handshakes read the live token on their own.
                if !self.is_connected()
                    || self.link_token.as_deref() == Some(credential.access_token.as_str())
                {
                    return;
                }
                info!("connection: credential rotated, re-handshaking");
                if let Some(link) = &self.link {
                    link.send(WireFrame::Frame(Frame::disconnect()));
                }
                self.drop_link();
                self.reconnect_attempt = 0;
                self.set_state(ConnectionState::Reconnecting);
                match self.establish().await {
                    Ok(()) => {}
                    Err(EstablishError::AuthRejected(reason)) => self.fail_auth(reason),
                    Err(EstablishError::Transport(err)) => self.begin_reconnect(&err.to_string()),
                }
            }
            CredentialChange::Cleared(reason) => {
                if self.credentials.credential().is_some() {
                    debug!(?reason, "connection: credential already replaced by a new login");
                    return;
                }
                info!(?reason, "connection: credential cleared, tearing down");
                self.end_session();
                let _ = self.events.send(ConnectionEvent::SessionEnded);
            }
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        self.last_inbound = Instant::now();
        match event {
            LinkEvent::Heartbeat => {}
            LinkEvent::Frame(frame) => match frame.command {
                FrameCommand::Message => {
                    if !self.registry.dispatch(&frame) {
                        debug!(
                            destination = frame.get("destination").unwrap_or_default(),
                            "connection: message for unregistered topic dropped"
                        );
                    }
                }
                FrameCommand::Error => {
                    let detail = frame
                        .get("message")
                        .unwrap_or(frame.body.as_str())
                        .to_string();
                    warn!(detail = %detail, "connection: server sent ERROR");
                    self.begin_reconnect(&detail);
                }
                other => debug!(command = other.as_str(), "connection: ignoring frame"),
            },
            LinkEvent::Closed(reason) => {
                let reason = reason.unwrap_or_else(|| "closed by peer".into());
                self.begin_reconnect(&reason);
            }
        }
    }

    fn end_session(&mut self) {
        self.deactivate();
        self.registry.clear();
    }

    // Ticks at the client's proposed period, which is never longer than the
    // negotiated sending period.
    fn heartbeat_tick(&mut self) {
        if self.link.is_none() {
            return;
        }
        if let Some(expect) = self.heartbeats.expect {
            if self.last_inbound.elapsed() > expect * STALE_HEARTBEATS {
                self.begin_reconnect("heart-beat timeout");
                return;
            }
        }
        if self.heartbeats.send.is_some() && !self.send_wire(WireFrame::Heartbeat) {
            self.begin_reconnect("writer closed");
        }
    }

    async fn health_probe(&mut self) {
        if !self.active
            || self.link.is_some()
            || self.reconnect_at.is_some()
            || self.current_state() != ConnectionState::Disconnected
        {
            return;
        }
        if !self.credentials.is_valid() {
            debug!("connection: health probe skipped, credential not valid");
            return;
        }
        info!("connection: health probe found link down, trying once");
        self.set_state(ConnectionState::Connecting);
        match self.establish().await {
            Ok(()) => {}
            Err(EstablishError::AuthRejected(reason)) => self.fail_auth(reason),
            Err(EstablishError::Transport(err)) => {
                warn!("connection: health probe reconnect failed: {err}");
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.link.is_some() && self.current_state() == ConnectionState::Connected
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            debug!(state = ?next, "connection: state changed");
        }
    }

    fn send_frame(&self, frame: Frame) -> bool {
        self.send_wire(WireFrame::Frame(frame))
    }

    fn send_wire(&self, frame: WireFrame) -> bool {
        self.link.as_ref().is_some_and(|link| link.send(frame))
    }

    fn drop_link(&mut self) {
        self.link = None;
        self.link_token = None;
    }
}

fn connection_error(err: HandshakeError, handshake_timeout: Duration) -> ConnectionError {
    match err {
        HandshakeError::Timeout => ConnectionError::HandshakeTimeout(handshake_timeout),
        HandshakeError::Rejected(reason) | HandshakeError::Unauthorized(reason) => {
            ConnectionError::HandshakeRejected(reason)
        }
        HandshakeError::Transport(reason) => ConnectionError::Transport(reason),
    }
}

async fn next_link_event(link: &mut Option<TransportLink>) -> LinkEvent {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
