use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, Weak,
    },
};

use serde_json::Value;
use shared::{
    domain::{ChatId, MessageId, UserId},
    protocol::{chat_topic, notification_topic, user_message_topic, MessageEnvelope},
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod api;
pub mod config;
pub mod connection;
pub mod conversations;
pub mod credential;
pub mod dispatcher;
pub mod error;
pub mod reconciler;
pub mod subscriptions;
pub mod transport;

pub use api::{ApiClient, AttachmentUpload, ChatApi, HttpTokenRefresher};
pub use config::{load_settings, Settings};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use conversations::{Conversation, ConversationIndex};
pub use credential::{Credential, CredentialCoordinator};
pub use dispatcher::SendOutcome;
pub use error::{SyncError, SyncResult};
pub use reconciler::ChatMessage;
pub use transport::{TransportConnector, WebSocketConnector};

use crate::{
    config::ConfigError,
    conversations::IndexUpdate,
    credential::{CredentialChange, CredentialSubscription},
    dispatcher::OutboundDispatcher,
    error::{AuthError, ProtocolError, ValidationError},
    reconciler::{parse_event, ChatEvent, MessageReconciler},
    subscriptions::{TopicHandler, TopicMessage},
};

const NOTIFICATION_TOPIC_PREFIX: &str = "/notifications/";
const CHAT_TOPIC_PREFIX: &str = "/chat/";

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ConnectionChanged(ConnectionState),
    /// Reconnect attempts ran out; the health probe keeps trying.
    Offline { attempts: u32 },
    AuthRejected(String),
    /// The credential is gone; the user has to log in again.
    SessionEnded,
    MessagesUpdated { chat_id: ChatId },
    ConversationsUpdated,
    Notification(Value),
    Error(String),
}

pub struct SyncSession {
    settings: Settings,
    credentials: Arc<CredentialCoordinator>,
    api: Arc<dyn ChatApi>,
    connection: Arc<ConnectionManager>,
    dispatcher: OutboundDispatcher,
    inner: Mutex<SessionState>,
    inbound: mpsc::UnboundedSender<TopicMessage>,
    events: broadcast::Sender<SyncEvent>,
    refetch_inflight: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct SessionState {
    subject: Option<UserId>,
    chats: HashMap<ChatId, OpenChat>,
    conversations: ConversationIndex,
    next_generation: u64,
}

struct OpenChat {
    /// Distinguishes this opening from earlier ones of the same chat.
    generation: u64,
    reconciler: MessageReconciler,
}

impl SessionState {
    fn clear(&mut self) {
        self.subject = None;
        self.chats.clear();
        self.conversations = ConversationIndex::new();
    }
}

impl SyncSession {
    pub fn init(settings: Settings) -> Result<Arc<Self>, ConfigError> {
        let credentials =
            CredentialCoordinator::new(Arc::new(HttpTokenRefresher::new(&settings.server_url)));
        let api = Arc::new(ApiClient::new(&settings.server_url, Arc::clone(&credentials)));
        let connector = Arc::new(WebSocketConnector::new(settings.heartbeat_interval));
        Self::init_with_dependencies(settings, credentials, api, connector)
    }

    pub fn init_with_dependencies(
        settings: Settings,
        credentials: Arc<CredentialCoordinator>,
        api: Arc<dyn ChatApi>,
        connector: Arc<dyn TransportConnector>,
    ) -> Result<Arc<Self>, ConfigError> {
        let connection_config = settings.connection_config()?;
        let endpoint = connection_config.endpoint.clone();
        let connection =
            ConnectionManager::spawn(connection_config, connector, Arc::clone(&credentials));
        let dispatcher =
            OutboundDispatcher::new(Arc::clone(&connection), settings.send_ready_timeout);
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(1024);
        let credential_changes = credentials.on_change();
        let connection_state = connection.watch_state();
        let connection_events = connection.subscribe_events();

        let session = Arc::new(Self {
            settings,
            credentials,
            api,
            connection,
            dispatcher,
            inner: Mutex::new(SessionState::default()),
            inbound,
            events,
            refetch_inflight: AtomicBool::new(false),
            tasks: StdMutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&session);
        let tasks = vec![
            tokio::spawn(run_inbound_loop(weak.clone(), inbound_rx)),
            tokio::spawn(watch_credentials(weak.clone(), credential_changes)),
            tokio::spawn(watch_connection(weak, connection_state, connection_events)),
        ];
        *session.tasks.lock().unwrap_or_else(|p| p.into_inner()) = tasks;
        info!(endpoint = %endpoint, "sync: session initialized");
        Ok(session)
    }

    pub async fn dispose(&self) {
        self.connection.dispose().await;
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for task in tasks {
            task.abort();
        }
        self.inner.lock().await.clear();
        info!("sync: session disposed");
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn credential(&self) -> Option<Credential> {
        self.credentials.credential()
    }

    pub fn credentials(&self) -> &Arc<CredentialCoordinator> {
        &self.credentials
    }

    pub async fn login(self: &Arc<Self>, username: &str, password: &str) -> SyncResult<Credential> {
        let credential = self.api.login(username, password).await?;
        let subject = credential.subject_id.clone();
        {
            // Installed under the state lock so a late clear from an earlier
            // logout sees the new credential.
            let mut state = self.inner.lock().await;
            state.clear();
            state.subject = Some(subject.clone());
            self.credentials.set_credential(credential.clone());
        }
        info!(subject = %subject, "sync: logged in");

        self.subscribe_topic(user_message_topic(&subject)).await;
        self.subscribe_topic(notification_topic(&subject)).await;
        self.connection.activate();
        if !self
            .connection
            .wait_for_connected(self.settings.handshake_timeout)
            .await
        {
            warn!(
                timeout = ?self.settings.handshake_timeout,
                "sync: connection not ready, continuing without live updates"
            );
        }

        if let Err(err) = self.refresh_conversations().await {
            warn!("sync: initial conversation fetch failed: {err}");
            self.emit(SyncEvent::Error(format!("conversation list: {err}")));
        }
        Ok(credential)
    }

    /// Returns once the link is closed and every topic is forgotten, so a
    /// following `login` starts from a clean connection.
    pub async fn logout(&self) {
        self.credentials.logout();
        self.connection.end_session().await;
        self.inner.lock().await.clear();
    }

    pub async fn refresh_conversations(&self) -> SyncResult<()> {
        let conversations = self.api.fetch_conversations().await?;
        let count = conversations.len();
        self.inner.lock().await.conversations.replace_all(conversations);
        debug!(count, "sync: conversation list replaced");
        self.emit(SyncEvent::ConversationsUpdated);
        Ok(())
    }

    /// Makes `chat_id` the active chat, subscribes its topic and starts the
    /// first history fetch. Reopening an open chat only re-activates it.
    pub async fn open_chat(self: &Arc<Self>, chat_id: &ChatId) -> SyncResult<()> {
        let subject = self
            .credentials
            .subject_id()
            .ok_or(AuthError::NotAuthenticated)?;
        let generation = {
            let mut state = self.inner.lock().await;
            state.conversations.set_active_chat(Some(chat_id.clone()));
            if state.chats.contains_key(chat_id) {
                None
            } else {
                state.next_generation += 1;
                let generation = state.next_generation;
                state.chats.insert(
                    chat_id.clone(),
                    OpenChat {
                        generation,
                        reconciler: MessageReconciler::new(chat_id.clone(), Some(subject)),
                    },
                );
                Some(generation)
            }
        };
        let Some(generation) = generation else {
            return Ok(());
        };

        info!(chat_id = %chat_id, generation, "sync: chat opened");
        self.subscribe_topic(chat_topic(chat_id)).await;
        self.spawn_history_fetch(chat_id.clone(), generation, 0);
        Ok(())
    }

    pub async fn load_older(&self, chat_id: &ChatId) -> SyncResult<bool> {
        let (generation, page) = {
            let state = self.inner.lock().await;
            match state.chats.get(chat_id) {
                Some(open) if open.reconciler.has_more() => {
                    (open.generation, open.reconciler.next_page())
                }
                _ => return Ok(false),
            }
        };
        self.fetch_history_page(chat_id, generation, page).await
    }

    pub async fn close_chat(&self, chat_id: &ChatId) {
        {
            let mut state = self.inner.lock().await;
            state.chats.remove(chat_id);
            if state.conversations.active_chat() == Some(chat_id) {
                state.conversations.set_active_chat(None);
            }
        }
        self.connection.unsubscribe(&chat_topic(chat_id)).await;
        debug!(chat_id = %chat_id, "sync: chat closed");
    }

    /// Zeroes the unread count locally and acknowledges in the background.
    /// The local change is not rolled back if the acknowledgement fails.
    pub async fn mark_read(self: &Arc<Self>, chat_id: &ChatId) {
        let changed = self.inner.lock().await.conversations.mark_read(chat_id);
        if changed {
            self.emit(SyncEvent::ConversationsUpdated);
        }
        let session = Arc::clone(self);
        let chat_id = chat_id.clone();
        tokio::spawn(async move {
            if let Err(err) = session.api.mark_read(&chat_id).await {
                warn!(chat_id = %chat_id, "sync: read acknowledgement failed: {err}");
            }
        });
    }

    /// A missing `chat_id` is filled in from the cached direct chat with
    /// `target`, if there is one.
    pub async fn send_message(
        &self,
        chat_id: Option<&ChatId>,
        target: &str,
        text: &str,
    ) -> SendOutcome {
        let chat_id = match chat_id {
            Some(chat_id) => Some(chat_id.clone()),
            None => self
                .inner
                .lock()
                .await
                .conversations
                .chat_for_subject(target.trim())
                .cloned(),
        };
        self.dispatcher.send(chat_id.as_ref(), target, text).await
    }

    pub async fn on_conversation_created(&self, conversation: Conversation) {
        debug!(chat_id = %conversation.chat_id, "sync: conversation created");
        self.inner
            .lock()
            .await
            .conversations
            .on_conversation_created(conversation);
        self.emit(SyncEvent::ConversationsUpdated);
    }

    pub async fn send_to_chat(&self, chat_id: &ChatId, text: &str) -> SendOutcome {
        let target = {
            let state = self.inner.lock().await;
            state
                .conversations
                .get(chat_id)
                .and_then(|conversation| conversation.target.as_ref())
                .map(|target| target.username.clone())
        };
        match target {
            Some(target) => self.send_message(Some(chat_id), &target, text).await,
            None => SendOutcome::Rejected(ValidationError::EmptyRecipient),
        }
    }

    /// The server broadcasts the EDIT; local state changes when it arrives.
    pub async fn edit_message(&self, message_id: &MessageId, content: &str) -> SyncResult<()> {
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }
        self.api.edit_message(message_id, content.trim()).await
    }

    pub async fn delete_message(&self, message_id: &MessageId) -> SyncResult<()> {
        self.api.delete_message(message_id).await
    }

    pub async fn upload_attachment(
        self: &Arc<Self>,
        chat_id: &ChatId,
        upload: AttachmentUpload,
    ) -> SyncResult<()> {
        let envelope = self.api.upload_attachment(chat_id, upload).await?;
        self.apply_envelope(envelope, Some(chat_id)).await;
        Ok(())
    }

    pub async fn messages(&self, chat_id: &ChatId) -> Vec<ChatMessage> {
        self.inner
            .lock()
            .await
            .chats
            .get(chat_id)
            .map(|open| open.reconciler.messages().to_vec())
            .unwrap_or_default()
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.inner.lock().await.conversations.conversations().to_vec()
    }

    pub async fn total_unread(&self) -> u32 {
        self.inner.lock().await.conversations.total_unread()
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    async fn subscribe_topic(&self, topic: String) -> bool {
        let inbound = self.inbound.clone();
        let handler: TopicHandler = Arc::new(move |message| {
            let _ = inbound.send(message);
        });
        self.connection.subscribe(&topic, handler).await
    }

    async fn handle_inbound(self: &Arc<Self>, message: TopicMessage) {
        if message.topic.starts_with(NOTIFICATION_TOPIC_PREFIX) {
            match decode_payload::<Value>(&message.body) {
                Ok(value) => self.emit(SyncEvent::Notification(value)),
                Err(err) => warn!(topic = %message.topic, "sync: dropping notification: {err}"),
            }
            return;
        }

        let envelope = match decode_payload::<MessageEnvelope>(&message.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(topic = %message.topic, "sync: dropping event: {err}");
                return;
            }
        };
        let topic_chat = message
            .topic
            .strip_prefix(CHAT_TOPIC_PREFIX)
            .map(ChatId::from);
        self.apply_envelope(envelope, topic_chat.as_ref()).await;
    }

    async fn apply_envelope(self: &Arc<Self>, envelope: MessageEnvelope, topic_chat: Option<&ChatId>) {
        let mut state = self.inner.lock().await;
        let subject = state.subject.clone();
        let (chat_id, event) = match parse_event(envelope, topic_chat, subject.as_ref()) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("sync: dropping event: {err}");
                return;
            }
        };

        let messages_changed = match state.chats.get_mut(&chat_id) {
            Some(open) => open.reconciler.apply(event.clone()).changed(),
            None => false,
        };
        let mut refetch = false;
        let conversations_changed = match &event {
            ChatEvent::New(message) => match state.conversations.on_message(message) {
                IndexUpdate::Updated => true,
                IndexUpdate::Unchanged => false,
                IndexUpdate::RefetchRequired(stale) => {
                    debug!("sync: {stale}, refetching conversation list");
                    refetch = true;
                    false
                }
            },
            ChatEvent::Edit { id, content, .. } => {
                state.conversations.on_message_edited(&chat_id, id, content)
            }
            ChatEvent::Delete { id } => state.conversations.on_message_deleted(&chat_id, id),
        };
        drop(state);

        if messages_changed {
            self.emit(SyncEvent::MessagesUpdated { chat_id });
        }
        if conversations_changed {
            self.emit(SyncEvent::ConversationsUpdated);
        }
        if refetch {
            self.spawn_conversation_refetch();
        }
    }

    fn spawn_history_fetch(self: &Arc<Self>, chat_id: ChatId, generation: u64, page: u32) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = session.fetch_history_page(&chat_id, generation, page).await {
                warn!(chat_id = %chat_id, page, "sync: history fetch failed: {err}");
                session.emit(SyncEvent::Error(format!("history for chat {chat_id}: {err}")));
            }
        });
    }

    async fn fetch_history_page(
        &self,
        chat_id: &ChatId,
        generation: u64,
        page: u32,
    ) -> SyncResult<bool> {
        let size = self.settings.history_page_size;
        let envelopes = self.api.fetch_history(chat_id, page, size).await?;

        let mut state = self.inner.lock().await;
        let Some(open) = state
            .chats
            .get_mut(chat_id)
            .filter(|open| open.generation == generation)
        else {
            debug!(chat_id = %chat_id, generation, "sync: discarding history for closed chat");
            return Ok(false);
        };
        open.reconciler.merge_history(page, size, envelopes);
        drop(state);

        self.emit(SyncEvent::MessagesUpdated {
            chat_id: chat_id.clone(),
        });
        Ok(true)
    }

    /// Coalesces concurrent refetch requests into one fetch.
    fn spawn_conversation_refetch(self: &Arc<Self>) {
        if self.refetch_inflight.swap(true, Ordering::SeqCst) {
            debug!("sync: conversation refetch already in flight");
            return;
        }
        let session = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = session.refresh_conversations().await {
                warn!("sync: conversation refetch failed: {err}");
                session.emit(SyncEvent::Error(format!("conversation list: {err}")));
            }
            session.refetch_inflight.store(false, Ordering::SeqCst);
        });
    }

    async fn catch_up(self: &Arc<Self>) {
        let open: Vec<(ChatId, u64)> = {
            let state = self.inner.lock().await;
            if state.subject.is_none() {
                return;
            }
            state
                .chats
                .iter()
                .map(|(chat_id, open)| (chat_id.clone(), open.generation))
                .collect()
        };
        info!(open_chats = open.len(), "sync: reconnected, catching up");
        self.spawn_conversation_refetch();
        for (chat_id, generation) in open {
            self.spawn_history_fetch(chat_id, generation, 0);
        }
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(body)?)
}

async fn run_inbound_loop(
    session: Weak<SyncSession>,
    mut inbound: mpsc::UnboundedReceiver<TopicMessage>,
) {
    while let Some(message) = inbound.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        session.handle_inbound(message).await;
    }
    debug!("sync: inbound loop stopped");
}

async fn watch_credentials(session: Weak<SyncSession>, mut changes: CredentialSubscription) {
    while let Some(change) = changes.recv().await {
        let CredentialChange::Cleared(reason) = change else {
            continue;
        };
        let Some(session) = session.upgrade() else {
            break;
        };
        let mut state = session.inner.lock().await;
        if session.credentials.credential().is_some() {
            debug!(?reason, "sync: ignoring clear from a previous login");
            continue;
        }
        info!(?reason, "sync: session ended");
        state.clear();
        drop(state);
        session.emit(SyncEvent::SessionEnded);
    }
}

async fn watch_connection(
    session: Weak<SyncSession>,
    mut state: watch::Receiver<ConnectionState>,
    mut events: broadcast::Receiver<ConnectionEvent>,
) {
    let mut connected_before = false;
    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                let Some(session) = session.upgrade() else {
                    break;
                };
                session.emit(SyncEvent::ConnectionChanged(current));
            }
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "sync: connection events lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(session) = session.upgrade() else {
                    break;
                };
                match event {
                    ConnectionEvent::Connected => {
                        if connected_before {
                            session.catch_up().await;
                        }
                        connected_before = true;
                    }
                    ConnectionEvent::Offline { attempts } => {
                        session.emit(SyncEvent::Offline { attempts });
                    }
                    ConnectionEvent::AuthRejected(reason) => {
                        session.emit(SyncEvent::AuthRejected(reason));
                    }
                    ConnectionEvent::SessionEnded => {
                        connected_before = false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
