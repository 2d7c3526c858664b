use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Result;
use chrono::Utc;
use shared::{
    domain::{ChatId, MessageId, MessageStatus, UserId, UserSummary},
    protocol::{Chat, EventKind, InboundEvent, Message, MessageSender},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings, connection::ChatConnection, error::TransportError, rest::ChatApi,
};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    MessagesChanged,
    TypingChanged(bool),
    ChatUpdated(Chat),
    NewChat(Chat),
    Error(String),
}

#[derive(Default)]
struct SessionState {
    chat: Option<Chat>,
    // Newest first.
    messages: Vec<Message>,
    page: u32,
    has_more: bool,
    loading: bool,
    peer_typing: bool,
    last_error: Option<String>,
    last_provisional_seq: u128,
    typing_timer: Option<JoinHandle<()>>,
    delivered_timer: Option<JoinHandle<()>>,
    promotion_timers: HashMap<MessageId, JoinHandle<()>>,
}

impl SessionState {
    fn abort_timers(&mut self) {
        if let Some(timer) = self.typing_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.delivered_timer.take() {
            timer.abort();
        }
        for (_, timer) in self.promotion_timers.drain() {
            timer.abort();
        }
    }

    fn next_provisional_id(&mut self) -> MessageId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        let seq = now.max(self.last_provisional_seq + 1);
        self.last_provisional_seq = seq;
        MessageId::provisional(seq)
    }

    fn find_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|message| &message.id == id)
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.abort_timers();
    }
}

pub struct ChatSession {
    chat_id: ChatId,
    local_user: UserSummary,
    settings: ClientSettings,
    connection: Arc<ChatConnection>,
    api: Arc<dyn ChatApi>,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl ChatSession {
    pub fn new(
        chat_id: ChatId,
        local_user: UserSummary,
        settings: ClientSettings,
        connection: Arc<ChatConnection>,
        api: Arc<dyn ChatApi>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let mut state = SessionState::default();
        state.has_more = true;
        Arc::new(Self {
            chat_id,
            local_user,
            settings,
            connection,
            api,
            state: Mutex::new(state),
            events,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn record_error(&self, message: String) {
        self.lock_state().last_error = Some(message.clone());
        self.emit(SessionEvent::Error(message));
    }

    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    pub fn connection(&self) -> &Arc<ChatConnection> {
        &self.connection
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock_state().messages.clone()
    }

    pub fn chat(&self) -> Option<Chat> {
        self.lock_state().chat.clone()
    }

    pub fn is_peer_typing(&self) -> bool {
        self.lock_state().peer_typing
    }

    pub fn is_loading(&self) -> bool {
        self.lock_state().loading
    }

    pub fn has_more(&self) -> bool {
        self.lock_state().has_more
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock_state().last_error.clone()
    }

    fn is_from_local_user(&self, sender: &UserId) -> bool {
        sender == &self.local_user.id
    }

    /// Load failures are recorded in `last_error` and do not stop the connect.
    pub async fn start(self: &Arc<Self>) -> Result<(), TransportError> {
        self.load_chat().await;
        self.register_handlers();

        let result = self.connection.connect(Some(self.chat_id.clone())).await;
        match &result {
            Ok(()) => self.schedule_delivered_ack(),
            Err(error) => warn!(chat_id = %self.chat_id, %error, "session: initial connect failed"),
        }
        result
    }

    async fn load_chat(&self) {
        self.lock_state().loading = true;

        let loaded = async {
            let chat = self.api.get_chat(&self.chat_id).await?;
            let page = self
                .api
                .get_messages(&self.chat_id, 1, self.settings.page_size)
                .await?;
            Ok::<_, anyhow::Error>((chat, page))
        }
        .await;

        let (chat, page) = match loaded {
            Ok(loaded) => loaded,
            Err(error) => {
                self.lock_state().loading = false;
                warn!(chat_id = %self.chat_id, error = %format!("{error:#}"), "session: failed to load chat");
                self.record_error(format!("Failed to load chat: {error:#}"));
                return;
            }
        };

        let count = page.len();
        {
            let mut state = self.lock_state();
            state.messages = page
                .into_iter()
                .map(|message| self.mark_origin(message))
                .collect();
            state.page = 1;
            state.has_more = count == self.settings.page_size as usize;
            state.chat = Some(chat.clone());
            state.loading = false;
        }
        info!(chat_id = %self.chat_id, count, "session: loaded chat");
        self.emit(SessionEvent::ChatUpdated(chat));
        self.emit(SessionEvent::MessagesChanged);

        if let Err(error) = self.api.mark_all_as_read(&self.chat_id).await {
            warn!(chat_id = %self.chat_id, error = %format!("{error:#}"), "session: mark all as read failed");
        }
        if count > 0 {
            self.mark_as_read();
        }
    }

    fn mark_origin(&self, mut message: Message) -> Message {
        message.is_from_current_user = self.is_from_local_user(&message.sender.id);
        message
    }

    fn register_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        for kind in EventKind::ALL {
            let weak: Weak<Self> = weak.clone();
            self.connection.on(kind, move |event| {
                if let Some(session) = weak.upgrade() {
                    session.handle_event(event);
                }
            });
        }
    }

    fn handle_event(self: &Arc<Self>, event: InboundEvent) {
        match event {
            InboundEvent::Message(message) => self.handle_message(message),
            InboundEvent::MessageStatus { message_id, status } => {
                self.handle_status_update(&message_id, status)
            }
            InboundEvent::Typing { chat_id, user_id } => self.handle_typing(&chat_id, &user_id),
            InboundEvent::NewChat { chat } => self.handle_new_chat(chat),
            InboundEvent::ParticipantsUpdated {
                chat_id,
                participants,
            } => self.handle_participants(&chat_id, participants),
        }
    }

    pub fn send_message(self: &Arc<Self>, content: &str) -> Result<Message, TransportError> {
        let provisional = {
            let mut state = self.lock_state();
            let message = Message {
                id: state.next_provisional_id(),
                chat: self.chat_id.clone(),
                content: content.to_string(),
                sent_at: Utc::now(),
                status: MessageStatus::Sending,
                sender: MessageSender {
                    id: self.local_user.id.clone(),
                    username: self.local_user.username.clone(),
                },
                is_from_current_user: true,
            };
            state.messages.insert(0, message.clone());
            message
        };
        self.emit(SessionEvent::MessagesChanged);

        if let Err(error) = self.connection.send_chat_message(content) {
            warn!(message_id = %provisional.id, %error, "session: send failed");
            let mut state = self.lock_state();
            if let Some(message) = state.find_mut(&provisional.id) {
                message.status = MessageStatus::Failed;
            }
            drop(state);
            self.emit(SessionEvent::MessagesChanged);
            return Err(error);
        }

        self.schedule_promotion(provisional.id.clone());
        Ok(provisional)
    }

    fn schedule_promotion(self: &Arc<Self>, id: MessageId) {
        let delay = self.settings.send_promotion_delay;
        let weak = Arc::downgrade(self);
        let mut state = self.lock_state();
        let timer_id = id.clone();
        // Spawned under the lock so the task cannot observe the map before insert.
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(session) = weak.upgrade() else {
                return;
            };
            let promoted = {
                let mut state = session.lock_state();
                state.promotion_timers.remove(&timer_id);
                match state.find_mut(&timer_id) {
                    Some(message) if message.status == MessageStatus::Sending => {
                        message.status = MessageStatus::Sent;
                        true
                    }
                    _ => false,
                }
            };
            if promoted {
                debug!(message_id = %timer_id, "session: provisional message promoted to sent");
                session.emit(SessionEvent::MessagesChanged);
            }
        });
        if let Some(previous) = state.promotion_timers.insert(id, timer) {
            previous.abort();
        }
    }

    fn handle_message(self: &Arc<Self>, message: Message) {
        if message.chat != self.chat_id {
            debug!(chat_id = %message.chat, "session: ignoring message for another chat");
            return;
        }
        let mut message = self.mark_origin(message);
        let from_local_user = message.is_from_current_user;
        let message_id = message.id.clone();

        {
            let mut state = self.lock_state();
            if let Some(index) = state.messages.iter().position(|known| known.id == message_id) {
                let existing = &mut state.messages[index];
                if !existing.status.can_advance_to(message.status) {
                    message.status = existing.status;
                }
                *existing = message;
            } else if let Some(index) = from_local_user
                .then(|| provisional_match(&state.messages, &message.content))
                .flatten()
            {
                let superseded = std::mem::replace(&mut state.messages[index], message);
                if let Some(timer) = state.promotion_timers.remove(&superseded.id) {
                    timer.abort();
                }
                debug!(
                    provisional_id = %superseded.id,
                    message_id = %message_id,
                    "session: provisional message confirmed"
                );
            } else {
                state.messages.insert(0, message);
            }
        }
        self.emit(SessionEvent::MessagesChanged);

        if !from_local_user {
            if self.connection.connected() {
                let api = Arc::clone(&self.api);
                tokio::spawn(async move {
                    if let Err(error) = api
                        .update_message_status(&message_id, MessageStatus::Delivered)
                        .await
                    {
                        warn!(message_id = %message_id, error = %format!("{error:#}"), "session: delivered update failed");
                    }
                });
            }
            self.mark_as_read();
        }
    }

    fn handle_status_update(&self, message_id: &MessageId, status: MessageStatus) {
        let changed = {
            let mut state = self.lock_state();
            match state.find_mut(message_id) {
                Some(message)
                    if message.status.can_advance_to(status) || status == MessageStatus::Failed =>
                {
                    message.status = status;
                    true
                }
                Some(message) => {
                    debug!(
                        message_id = %message_id,
                        current = %message.status,
                        stale = %status,
                        "session: ignoring stale status update"
                    );
                    false
                }
                None => false,
            }
        };
        if changed {
            self.emit(SessionEvent::MessagesChanged);
        }
    }

    fn handle_typing(self: &Arc<Self>, chat_id: &ChatId, user_id: &UserId) {
        if chat_id != &self.chat_id || self.is_from_local_user(user_id) {
            return;
        }

        let delay = self.settings.typing_timeout;
        let weak = Arc::downgrade(self);
        let started = {
            let mut state = self.lock_state();
            if let Some(timer) = state.typing_timer.take() {
                timer.abort();
            }
            let started = !state.peer_typing;
            state.peer_typing = true;
            state.typing_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let Some(session) = weak.upgrade() else {
                    return;
                };
                {
                    let mut state = session.lock_state();
                    state.typing_timer = None;
                    state.peer_typing = false;
                }
                session.emit(SessionEvent::TypingChanged(false));
            }));
            started
        };
        if started {
            self.emit(SessionEvent::TypingChanged(true));
        }
    }

    fn handle_new_chat(&self, chat: Chat) {
        if chat.id == self.chat_id {
            self.lock_state().chat = Some(chat.clone());
            self.emit(SessionEvent::ChatUpdated(chat.clone()));
        }
        self.emit(SessionEvent::NewChat(chat));
    }

    fn handle_participants(&self, chat_id: &ChatId, participants: Vec<UserSummary>) {
        if chat_id != &self.chat_id {
            return;
        }
        let updated = {
            let mut state = self.lock_state();
            state.chat.as_mut().map(|chat| {
                chat.participants = participants;
                chat.clone()
            })
        };
        if let Some(chat) = updated {
            self.emit(SessionEvent::ChatUpdated(chat));
        }
    }

    /// Returns how many older messages were appended.
    pub async fn load_more_messages(&self) -> Result<usize> {
        let next_page = {
            let mut state = self.lock_state();
            if !state.has_more || state.loading {
                return Ok(0);
            }
            state.loading = true;
            state.page + 1
        };

        let page_size = self.settings.page_size;
        let fetched = self
            .api
            .get_messages(&self.chat_id, next_page, page_size)
            .await;

        let added = {
            let mut state = self.lock_state();
            state.loading = false;
            let batch = match fetched {
                Ok(batch) => batch,
                Err(error) => {
                    drop(state);
                    warn!(chat_id = %self.chat_id, page = next_page, error = %format!("{error:#}"), "session: failed to load more messages");
                    return Err(error);
                }
            };
            if batch.is_empty() {
                state.has_more = false;
                return Ok(0);
            }

            let full_page = batch.len() == page_size as usize;
            let known: HashSet<MessageId> =
                state.messages.iter().map(|message| message.id.clone()).collect();
            let fresh: Vec<Message> = batch
                .into_iter()
                .filter(|message| !known.contains(&message.id))
                .map(|message| self.mark_origin(message))
                .collect();
            let added = fresh.len();
            state.messages.extend(fresh);
            state.page = next_page;
            state.has_more = full_page;
            added
        };
        debug!(chat_id = %self.chat_id, page = next_page, added, "session: loaded older messages");
        self.emit(SessionEvent::MessagesChanged);
        Ok(added)
    }

    pub async fn update_message_status(&self, message_id: &MessageId, status: MessageStatus) -> Result<()> {
        self.api.update_message_status(message_id, status).await?;
        let changed = {
            let mut state = self.lock_state();
            match state.find_mut(message_id) {
                Some(message) => {
                    message.status = status;
                    true
                }
                None => false,
            }
        };
        if changed {
            self.emit(SessionEvent::MessagesChanged);
        }
        Ok(())
    }

    pub fn notify_typing(&self) {
        if let Err(error) = self.connection.send_typing() {
            debug!(%error, "session: typing notification not sent");
        }
    }

    pub fn mark_as_read(&self) {
        if let Err(error) = self.connection.mark_as_read() {
            debug!(%error, "session: read receipt not sent");
        }
    }

    fn schedule_delivered_ack(self: &Arc<Self>) {
        let delay = self.settings.delivered_ack_delay;
        let weak = Arc::downgrade(self);
        let mut state = self.lock_state();
        if let Some(timer) = state.delivered_timer.take() {
            timer.abort();
        }
        state.delivered_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(session) = weak.upgrade() else {
                return;
            };
            session.lock_state().delivered_timer = None;
            if session.connection.connected() {
                if let Err(error) = session.connection.mark_as_delivered() {
                    debug!(%error, "session: delivered receipt not sent");
                }
            }
        }));
    }

    pub async fn shutdown(&self) {
        for kind in EventKind::ALL {
            self.connection.off(kind);
        }
        self.lock_state().abort_timers();
        self.connection.disconnect().await;
        info!(chat_id = %self.chat_id, "session: closed");
    }
}

/// Oldest provisional message from the local user with the same content that
/// has not failed.
fn provisional_match(messages: &[Message], content: &str) -> Option<usize> {
    messages.iter().rposition(|message| {
        message.is_provisional()
            && message.is_from_current_user
            && message.status != MessageStatus::Failed
            && message.content == content
    })
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
