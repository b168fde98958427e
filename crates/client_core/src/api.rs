use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use shared::{
    domain::{ChatId, MessageId},
    error::ApiError,
    protocol::{
        AuthResponse, ConversationPayload, EditMessageRequest, LoginRequest, MessageEnvelope,
        RefreshRequest,
    },
};
use tracing::{debug, warn};

use crate::{
    credential::{Credential, CredentialCoordinator, TokenRefresher},
    error::{AuthError, SyncError, SyncResult},
};

/// Paths that never carry the bearer header.
pub const PUBLIC_PATH_PREFIXES: &[&str] = &[
    "/api/auth/login",
    "/api/auth/register",
    "/api/auth/refresh",
    "/api/auth/reset-password",
    "/api/auth/verify-email",
];

pub fn is_public_path(path: &str) -> bool {
    PUBLIC_PATH_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
}

#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
    pub caption: Option<String>,
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> SyncResult<Credential>;
    async fn fetch_history(
        &self,
        chat_id: &ChatId,
        page: u32,
        size: u32,
    ) -> SyncResult<Vec<MessageEnvelope>>;
    async fn fetch_conversations(&self) -> SyncResult<Vec<ConversationPayload>>;
    async fn mark_read(&self, chat_id: &ChatId) -> SyncResult<()>;
    async fn edit_message(&self, message_id: &MessageId, content: &str) -> SyncResult<()>;
    async fn delete_message(&self, message_id: &MessageId) -> SyncResult<()>;
    async fn upload_attachment(
        &self,
        chat_id: &ChatId,
        upload: AttachmentUpload,
    ) -> SyncResult<MessageEnvelope>;
}

#[derive(Serialize)]
struct HistoryQuery {
    page: u32,
    size: u32,
}

pub struct ApiClient {
    http: Client,
    base_url: String,
    credentials: Arc<CredentialCoordinator>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, credentials: Arc<CredentialCoordinator>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Sends the request built by `build`, attaching the live bearer token
    /// unless `path` is public. A 401 is routed through the coordinator's
    /// single-flight refresh and the request is replayed once.
    async fn execute<F>(&self, path: &str, build: F) -> SyncResult<Response>
    where
        F: Fn(&Client, String) -> RequestBuilder + Send + Sync,
    {
        let url = self.url(path);
        if is_public_path(path) {
            return check_status(build(&self.http, url).send().await?).await;
        }

        let token = self
            .credentials
            .access_token()
            .ok_or(AuthError::NotAuthenticated)?;
        let response = build(&self.http, url.clone())
            .bearer_auth(&token)
            .send()
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        debug!(path, "api: unauthorized, waiting for credential refresh");
        let fresh = self.credentials.refresh_if_current(&token).await?;
        let replay = build(&self.http, url)
            .bearer_auth(&fresh.access_token)
            .send()
            .await?;
        if replay.status() == StatusCode::UNAUTHORIZED {
            warn!(path, "api: replay rejected after refresh");
            return Err(AuthError::Rejected.into());
        }
        check_status(replay).await
    }
}

async fn check_status(response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SyncError::Api {
        status: status.as_u16(),
        error: ApiError::from_body(&body),
    })
}

#[async_trait]
impl ChatApi for ApiClient {
    async fn login(&self, username: &str, password: &str) -> SyncResult<Credential> {
        let request = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let response: AuthResponse = self
            .execute("/api/auth/login", |http, url| http.post(url).json(&request))
            .await?
            .json()
            .await?;
        Ok(Credential::from_token(response.token, response.display_name)?)
    }

    async fn fetch_history(
        &self,
        chat_id: &ChatId,
        page: u32,
        size: u32,
    ) -> SyncResult<Vec<MessageEnvelope>> {
        let query = HistoryQuery {
            page,
            size: size.clamp(1, 200),
        };
        let path = format!("/api/chats/{chat_id}/messages");
        Ok(self
            .execute(&path, |http, url| http.get(url).query(&query))
            .await?
            .json()
            .await?)
    }

    async fn fetch_conversations(&self) -> SyncResult<Vec<ConversationPayload>> {
        Ok(self
            .execute("/api/chats", |http, url| http.get(url))
            .await?
            .json()
            .await?)
    }

    async fn mark_read(&self, chat_id: &ChatId) -> SyncResult<()> {
        let path = format!("/api/chats/{chat_id}/read");
        self.execute(&path, |http, url| http.put(url)).await?;
        Ok(())
    }

    async fn edit_message(&self, message_id: &MessageId, content: &str) -> SyncResult<()> {
        let path = format!("/api/messages/{message_id}");
        let body = EditMessageRequest {
            content: content.to_string(),
        };
        self.execute(&path, |http, url| http.put(url).json(&body))
            .await?;
        Ok(())
    }

    async fn delete_message(&self, message_id: &MessageId) -> SyncResult<()> {
        let path = format!("/api/messages/{message_id}");
        self.execute(&path, |http, url| http.delete(url)).await?;
        Ok(())
    }

    async fn upload_attachment(
        &self,
        chat_id: &ChatId,
        upload: AttachmentUpload,
    ) -> SyncResult<MessageEnvelope> {
        let path = format!("/api/chats/{chat_id}/attachments");
        let response = self
            .execute(&path, |http, url| {
                let mut part =
                    multipart::Part::bytes(upload.bytes.clone()).file_name(upload.filename.clone());
                if let Some(mime) = upload.mime_type.as_deref() {
                    part = match part.mime_str(mime) {
                        Ok(typed) => typed,
                        Err(_) => multipart::Part::bytes(upload.bytes.clone())
                            .file_name(upload.filename.clone()),
                    };
                }
                let mut form = multipart::Form::new().part("file", part);
                if let Some(caption) = upload.caption.clone() {
                    form = form.text("text", caption);
                }
                http.post(url).multipart(form)
            })
            .await?;
        Ok(response.json().await?)
    }
}

/// Calls the public refresh endpoint with the current token.
pub struct HttpTokenRefresher {
    http: Client,
    base_url: String,
}

impl HttpTokenRefresher {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, current: &Credential) -> Result<Credential, AuthError> {
        let response = self
            .http
            .post(format!("{}/api/auth/refresh", self.base_url))
            .json(&RefreshRequest {
                token: current.access_token.clone(),
            })
            .send()
            .await
            .map_err(|err| AuthError::RefreshFailed(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::RefreshFailed(format!(
                "status {}: {}",
                status.as_u16(),
                ApiError::from_body(&body)
            )));
        }
        let body: AuthResponse = response
            .json()
            .await
            .map_err(|err| AuthError::RefreshFailed(err.to_string()))?;
        Credential::from_token(
            body.token,
            body.display_name.or_else(|| Some(current.display_name.clone())),
        )
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
