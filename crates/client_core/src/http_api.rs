use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    multipart::{Form, Part},
    Client, Response,
};
use shared::{
    domain::{ChatRef, Credential, LocalMessageId},
    error::{ApiError, ErrorCode},
    protocol::{ActiveChatsResponse, CallInviteRequest, MessagePayload, SendReceipt},
};

use crate::{config::RealtimeEndpoints, error::ApiFailure};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Everything needed to (re)send one message. Retries reuse it verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessageRequest {
    pub chat: ChatRef,
    pub text: String,
    pub attachment: Option<Attachment>,
    pub client_ref: LocalMessageId,
}

/// Request/response collaborators the realtime core depends on.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn active_chats(&self, credential: &Credential)
        -> Result<ActiveChatsResponse, ApiFailure>;
    async fn messages(
        &self,
        credential: &Credential,
        chat: &ChatRef,
    ) -> Result<Vec<MessagePayload>, ApiFailure>;
    async fn send_message(
        &self,
        credential: &Credential,
        request: &SendMessageRequest,
    ) -> Result<SendReceipt, ApiFailure>;
    async fn invite_call(&self, credential: &Credential, target_login: &str)
        -> Result<(), ApiFailure>;
}

pub struct HttpChatApi {
    http: Client,
    endpoints: RealtimeEndpoints,
}

impl HttpChatApi {
    /// Every request, sends included, gives up after `request_timeout` and
    /// reports a transport failure.
    pub fn new(endpoints: RealtimeEndpoints, request_timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { http, endpoints })
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn active_chats(
        &self,
        credential: &Credential,
    ) -> Result<ActiveChatsResponse, ApiFailure> {
        let response = self
            .http
            .get(self.endpoints.api_url("chats/active"))
            .bearer_auth(credential.expose())
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn messages(
        &self,
        credential: &Credential,
        chat: &ChatRef,
    ) -> Result<Vec<MessagePayload>, ApiFailure> {
        let response = self
            .http
            .get(self.endpoints.api_url("messages"))
            .bearer_auth(credential.expose())
            .query(&[
                ("chat_type", chat.kind.wire_name()),
                ("target", chat.target.as_str()),
            ])
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn send_message(
        &self,
        credential: &Credential,
        request: &SendMessageRequest,
    ) -> Result<SendReceipt, ApiFailure> {
        let mut form = Form::new()
            .text("chat_type", request.chat.kind.wire_name())
            .text("target", request.chat.target.clone())
            .text("text", request.text.clone())
            .text("client_ref", request.client_ref.to_string());
        if let Some(attachment) = &request.attachment {
            let mut part = Part::bytes(attachment.bytes.clone()).file_name(attachment.filename.clone());
            if let Some(mime_type) = &attachment.mime_type {
                part = part.mime_str(mime_type).map_err(|err| {
                    ApiFailure::Rejected(ApiError::new(
                        ErrorCode::Validation,
                        format!("invalid attachment mime type {mime_type}: {err}"),
                    ))
                })?;
            }
            form = form.part("file", part);
        }

        let response = self
            .http
            .post(self.endpoints.api_url("messages"))
            .bearer_auth(credential.expose())
            .multipart(form)
            .send()
            .await?;
        let body = check_status(response).await?.bytes().await?;
        // Older servers answer `{"status": "success"}` without the stored id.
        Ok(serde_json::from_slice(&body).unwrap_or_default())
    }

    async fn invite_call(
        &self,
        credential: &Credential,
        target_login: &str,
    ) -> Result<(), ApiFailure> {
        let response = self
            .http
            .post(self.endpoints.api_url("calls/invite"))
            .bearer_auth(credential.expose())
            .json(&CallInviteRequest {
                target_login: target_login.to_string(),
            })
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

/// Maps non-2xx responses, reading the `detail` field the server puts in error bodies.
async fn check_status(response: Response) -> Result<Response, ApiFailure> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let fallback = status
        .canonical_reason()
        .unwrap_or("request failed")
        .to_string();
    let detail = match response.json::<serde_json::Value>().await {
        Ok(serde_json::Value::Object(body)) => match body.get("detail") {
            Some(serde_json::Value::String(detail)) => detail.clone(),
            Some(other) => other.to_string(),
            None => fallback,
        },
        _ => fallback,
    };
    Err(ApiFailure::from_status(status.as_u16(), detail))
}

#[cfg(test)]
#[path = "tests/http_api_tests.rs"]
mod tests;
