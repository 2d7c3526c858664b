//! In-memory socket connector and REST fake shared by the unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{ChatId, MessageId, MessageStatus, UserId},
    protocol::{Chat, Message, MessageSender},
};
use tokio::sync::mpsc;
use url::Url;

use crate::{
    error::TransportError,
    rest::ChatApi,
    socket::{SocketChannel, SocketConnector, SocketEvent},
};

pub(crate) enum OpenOutcome {
    Accept,
    Fail(TransportError),
    Hang,
}

/// Test side of one accepted socket.
pub(crate) struct MemorySocket {
    pub url: Url,
    pub sent: mpsc::UnboundedReceiver<String>,
    pub inbound: mpsc::UnboundedSender<SocketEvent>,
}

impl MemorySocket {
    pub fn push_text(&self, text: &str) {
        self.inbound
            .send(SocketEvent::Text(text.to_string()))
            .expect("reader alive");
    }

    pub fn close_from_server(&self) {
        let _ = self.inbound.send(SocketEvent::Closed { code: Some(1006) });
    }

    pub fn drain_sent(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.sent.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

#[derive(Default)]
pub(crate) struct MemoryConnector {
    script: Mutex<VecDeque<OpenOutcome>>,
    fail_when_unscripted: AtomicBool,
    sockets: Mutex<VecDeque<MemorySocket>>,
    opens: AtomicUsize,
}

impl MemoryConnector {
    pub fn script(&self, outcome: OpenOutcome) {
        self.script.lock().expect("lock").push_back(outcome);
    }

    pub fn fail_when_unscripted(&self) {
        self.fail_when_unscripted.store(true, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn take_socket(&self) -> MemorySocket {
        self.sockets
            .lock()
            .expect("lock")
            .pop_front()
            .expect("an accepted socket")
    }
}

#[async_trait]
impl SocketConnector for MemoryConnector {
    async fn open(&self, url: &Url) -> Result<SocketChannel, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let outcome = self.script.lock().expect("lock").pop_front();
        let outcome = match outcome {
            Some(outcome) => outcome,
            None if self.fail_when_unscripted.load(Ordering::SeqCst) => {
                OpenOutcome::Fail(TransportError::Connection("connection refused".into()))
            }
            None => OpenOutcome::Accept,
        };
        match outcome {
            OpenOutcome::Accept => {
                let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
                let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
                self.sockets.lock().expect("lock").push_back(MemorySocket {
                    url: url.clone(),
                    sent: outgoing_rx,
                    inbound: incoming_tx,
                });
                Ok(SocketChannel::new(outgoing_tx, incoming_rx))
            }
            OpenOutcome::Fail(err) => Err(err),
            OpenOutcome::Hang => std::future::pending().await,
        }
    }
}

/// Lets spawned tasks run without advancing the clock.
pub(crate) async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

pub(crate) fn message(id: &str, chat: &str, sender: (&str, &str), content: &str) -> Message {
    Message {
        id: MessageId::new(id),
        chat: ChatId::new(chat),
        content: content.to_string(),
        sent_at: "2024-01-01T00:00:00Z".parse().expect("timestamp"),
        status: MessageStatus::Sent,
        sender: MessageSender {
            id: UserId::new(sender.0),
            username: sender.1.to_string(),
        },
        is_from_current_user: false,
    }
}

pub(crate) fn message_frame(id: &str, chat: &str, sender: (&str, &str), content: &str) -> String {
    let mut value = serde_json::to_value(message(id, chat, sender, content)).expect("json");
    value["type"] = serde_json::Value::String("message".into());
    value.to_string()
}

pub(crate) fn chat(id: &str) -> Chat {
    Chat {
        id: ChatId::new(id),
        name: Some(format!("chat {id}")),
        participants: Vec::new(),
        is_group: false,
        last_message: None,
        unread_count: None,
        created_at: None,
    }
}

#[derive(Default)]
pub(crate) struct FakeChatApi {
    pub pages: Mutex<HashMap<u32, Vec<Message>>>,
    pub page_requests: Mutex<Vec<(u32, u32)>>,
    pub status_updates: Mutex<Vec<(MessageId, MessageStatus)>>,
    pub mark_all_calls: AtomicUsize,
    pub fail_chat: AtomicBool,
    pub fail_messages: AtomicBool,
}

impl FakeChatApi {
    pub fn with_page(self, page: u32, messages: Vec<Message>) -> Self {
        self.pages.lock().expect("lock").insert(page, messages);
        self
    }

    pub fn status_updates(&self) -> Vec<(MessageId, MessageStatus)> {
        self.status_updates.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn list_chats(&self) -> Result<Vec<Chat>> {
        Ok(vec![chat("42")])
    }

    async fn get_chat(&self, chat_id: &ChatId) -> Result<Chat> {
        if self.fail_chat.load(Ordering::SeqCst) {
            return Err(anyhow!("Chat not found"));
        }
        Ok(chat(chat_id.as_str()))
    }

    async fn create_chat(&self, name: &str, _participant_ids: &[UserId]) -> Result<Chat> {
        let mut created = chat("100");
        created.name = Some(name.to_string());
        Ok(created)
    }

    async fn add_participants(&self, chat_id: &ChatId, _user_ids: &[UserId]) -> Result<Chat> {
        Ok(chat(chat_id.as_str()))
    }

    async fn get_messages(
        &self,
        _chat_id: &ChatId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Message>> {
        self.page_requests
            .lock()
            .expect("lock")
            .push((page, page_size));
        if self.fail_messages.load(Ordering::SeqCst) {
            return Err(anyhow!("network error"));
        }
        Ok(self
            .pages
            .lock()
            .expect("lock")
            .get(&page)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(&self, chat_id: &ChatId, content: &str) -> Result<Message> {
        Ok(message("500", chat_id.as_str(), ("1", "me"), content))
    }

    async fn update_message_status(
        &self,
        message_id: &MessageId,
        status: MessageStatus,
    ) -> Result<()> {
        self.status_updates
            .lock()
            .expect("lock")
            .push((message_id.clone(), status));
        Ok(())
    }

    async fn mark_all_as_read(&self, _chat_id: &ChatId) -> Result<()> {
        self.mark_all_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
