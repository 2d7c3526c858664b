use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ChatId, MessageId, MessageStatus, UserId},
    error::{ApiErrorBody, ApiException},
    protocol::{Chat, Message},
};
use tracing::debug;

use crate::{auth::TokenProvider, config::ClientSettings};

/// REST surface of the chat backend consumed by the session.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_chats(&self) -> Result<Vec<Chat>>;
    async fn get_chat(&self, chat_id: &ChatId) -> Result<Chat>;
    async fn create_chat(&self, name: &str, participant_ids: &[UserId]) -> Result<Chat>;
    async fn add_participants(&self, chat_id: &ChatId, user_ids: &[UserId]) -> Result<Chat>;
    async fn get_messages(&self, chat_id: &ChatId, page: u32, page_size: u32)
        -> Result<Vec<Message>>;
    async fn send_message(&self, chat_id: &ChatId, content: &str) -> Result<Message>;
    async fn update_message_status(&self, message_id: &MessageId, status: MessageStatus)
        -> Result<()>;
    async fn mark_all_as_read(&self, chat_id: &ChatId) -> Result<()>;
}

#[derive(Serialize)]
struct CreateChatRequest<'a> {
    name: &'a str,
    participant_ids: &'a [UserId],
}

#[derive(Serialize)]
struct AddParticipantsRequest<'a> {
    users_ids: &'a [UserId],
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    content: &'a str,
    chat: &'a ChatId,
}

#[derive(Serialize)]
struct UpdateStatusRequest {
    status: MessageStatus,
}

#[derive(Serialize)]
struct MessagesQuery {
    page: u32,
    page_size: u32,
}

pub struct HttpChatApi {
    http: Client,
    base: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpChatApi {
    pub fn new(settings: &ClientSettings, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            http: Client::new(),
            base: settings.rest_base(),
            tokens,
        }
    }

    fn url(&self, route: &str) -> String {
        format!("{}{route}", self.base)
    }

    async fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.tokens.bearer_token().await {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute(&self, request: RequestBuilder, route: &str) -> Result<Response> {
        let response = self
            .authorized(request)
            .await
            .send()
            .await
            .with_context(|| format!("request to {route} failed"))?;
        let status = response.status();
        debug!(route, status = status.as_u16(), "rest: response");
        if status.is_success() {
            return Ok(response);
        }
        let body: ApiErrorBody = response.json().await.unwrap_or_default();
        Err(ApiException::from_body(status.as_u16(), &body))
            .with_context(|| format!("request to {route} was rejected"))
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        route: &str,
    ) -> Result<T> {
        self.execute(request, route)
            .await?
            .json()
            .await
            .with_context(|| format!("invalid response body from {route}"))
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_chats(&self) -> Result<Vec<Chat>> {
        let route = "/chats/";
        self.fetch_json(self.http.get(self.url(route)), route).await
    }

    async fn get_chat(&self, chat_id: &ChatId) -> Result<Chat> {
        let route = format!("/chats/{chat_id}/");
        self.fetch_json(self.http.get(self.url(&route)), &route)
            .await
    }

    async fn create_chat(&self, name: &str, participant_ids: &[UserId]) -> Result<Chat> {
        let route = "/chats/";
        let request = self.http.post(self.url(route)).json(&CreateChatRequest {
            name,
            participant_ids,
        });
        self.fetch_json(request, route).await
    }

    async fn add_participants(&self, chat_id: &ChatId, user_ids: &[UserId]) -> Result<Chat> {
        let route = format!("/chats/{chat_id}/add_participants/");
        let request = self
            .http
            .post(self.url(&route))
            .json(&AddParticipantsRequest {
                users_ids: user_ids,
            });
        self.fetch_json(request, &route).await
    }

    async fn get_messages(
        &self,
        chat_id: &ChatId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Message>> {
        let route = format!("/chats/{chat_id}/messages/");
        let request = self
            .http
            .get(self.url(&route))
            .query(&MessagesQuery { page, page_size });
        self.fetch_json(request, &route).await
    }

    async fn send_message(&self, chat_id: &ChatId, content: &str) -> Result<Message> {
        let route = format!("/chats/{chat_id}/messages/");
        let request = self
            .http
            .post(self.url(&route))
            .json(&SendMessageRequest {
                content,
                chat: chat_id,
            });
        self.fetch_json(request, &route).await
    }

    async fn update_message_status(
        &self,
        message_id: &MessageId,
        status: MessageStatus,
    ) -> Result<()> {
        let route = format!("/messages/{message_id}/status/");
        let request = self
            .http
            .put(self.url(&route))
            .json(&UpdateStatusRequest { status });
        self.execute(request, &route).await?;
        Ok(())
    }

    async fn mark_all_as_read(&self, chat_id: &ChatId) -> Result<()> {
        let route = format!("/messages/status/update-all/{chat_id}/");
        let request = self
            .http
            .put(self.url(&route))
            .json(&serde_json::json!({}));
        self.execute(request, &route).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
