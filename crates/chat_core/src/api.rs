//! Request/response surface of the resource API used when the persistent
//! channel is unavailable, plus the unread-count endpoints.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ConversationId, CorrelationId},
    error::{ApiError, ErrorCode},
    protocol::{MessagePayload, SendMessageRequest, UnreadCountResponse},
};

use crate::error::RequestError;

#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn send_message(
        &self,
        conversation_id: ConversationId,
        text: &str,
        correlation_id: Option<&CorrelationId>,
    ) -> Result<MessagePayload, RequestError>;
    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<MessagePayload>, RequestError>;
    async fn unread_count(&self, conversation_id: ConversationId) -> Result<u32, RequestError>;
    async fn mark_read(&self, conversation_id: ConversationId) -> Result<(), RequestError>;
}

pub struct HttpConversationApi {
    http: Client,
    server_url: String,
    auth_token: String,
}

impl HttpConversationApi {
    pub fn new(server_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self::with_client(Client::new(), server_url, auth_token)
    }

    pub fn with_client(
        http: Client,
        server_url: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Self {
        let server_url = server_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            server_url,
            auth_token: auth_token.into(),
        }
    }

    fn messages_url(&self, conversation_id: ConversationId, suffix: &str) -> String {
        format!(
            "{}/conversations/{conversation_id}/messages/{suffix}",
            self.server_url
        )
    }

    async fn execute(&self, url: &str, request: RequestBuilder) -> Result<Response, RequestError> {
        let response = request
            .bearer_auth(&self.auth_token)
            .send()
            .await
            .map_err(|err| RequestError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let error = serde_json::from_str::<ApiError>(&body).unwrap_or_else(|_| {
            ApiError::new(
                ErrorCode::from_status(status.as_u16()),
                if body.is_empty() {
                    status.to_string()
                } else {
                    body
                },
            )
        });
        Err(RequestError::Api {
            url: url.to_string(),
            status: status.as_u16(),
            error,
        })
    }

    async fn decode<T: DeserializeOwned>(url: &str, response: Response) -> Result<T, RequestError> {
        response.json().await.map_err(|err| RequestError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        })
    }
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn send_message(
        &self,
        conversation_id: ConversationId,
        text: &str,
        correlation_id: Option<&CorrelationId>,
    ) -> Result<MessagePayload, RequestError> {
        let url = self.messages_url(conversation_id, "");
        let request = self.http.post(&url).json(&SendMessageRequest {
            text: text.to_string(),
            correlation_id: correlation_id.cloned(),
        });
        let response = self.execute(&url, request).await?;
        Self::decode(&url, response).await
    }

    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<MessagePayload>, RequestError> {
        let url = self.messages_url(conversation_id, "");
        let response = self.execute(&url, self.http.get(&url)).await?;
        Self::decode(&url, response).await
    }

    async fn unread_count(&self, conversation_id: ConversationId) -> Result<u32, RequestError> {
        let url = self.messages_url(conversation_id, "unread-count/");
        let response = self.execute(&url, self.http.get(&url)).await?;
        let body: UnreadCountResponse = Self::decode(&url, response).await?;
        Ok(body.unread_count)
    }

    async fn mark_read(&self, conversation_id: ConversationId) -> Result<(), RequestError> {
        let url = self.messages_url(conversation_id, "read/");
        self.execute(&url, self.http.post(&url)).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
