//! Optimistic outbound messages and the per-chat lanes that deliver them.

use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{ChatRef, Credential, LocalMessageId, MessageId},
    protocol::{MessagePayload, SendReceipt},
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    error::{ApiFailure, CoreError, FailureReason},
    http_api::{Attachment, ChatApi, SendMessageRequest},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboundStatus {
    Sending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub local_id: LocalMessageId,
    pub status: OutboundStatus,
    pub failure: Option<FailureReason>,
    pub server_id: Option<MessageId>,
    /// Latest fetch ticket issued when the send was confirmed.
    pub confirmed_at: Option<u64>,
    retry_payload: SendMessageRequest,
}

impl OutboundMessage {
    pub fn chat(&self) -> &ChatRef {
        &self.retry_payload.chat
    }

    pub fn text(&self) -> &str {
        &self.retry_payload.text
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        self.retry_payload.attachment.as_ref()
    }

    pub fn retry_payload(&self) -> &SendMessageRequest {
        &self.retry_payload
    }

    fn is_echoed_by(&self, message: &MessagePayload) -> bool {
        message.client_ref == Some(self.local_id) || self.server_id == Some(message.id)
    }
}

/// Entries not yet replaced by their authoritative copy, in append order.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    entries: Vec<OutboundMessage>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a Sending entry and returns the payload to dispatch.
    pub fn enqueue(
        &mut self,
        chat: ChatRef,
        text: String,
        attachment: Option<Attachment>,
    ) -> SendMessageRequest {
        let request = SendMessageRequest {
            chat,
            text,
            attachment,
            client_ref: LocalMessageId::generate(),
        };
        self.entries.push(OutboundMessage {
            local_id: request.client_ref,
            status: OutboundStatus::Sending,
            failure: None,
            server_id: None,
            confirmed_at: None,
            retry_payload: request.clone(),
        });
        request
    }

    pub fn mark_sent(
        &mut self,
        local_id: LocalMessageId,
        server_id: Option<MessageId>,
        latest_ticket: u64,
    ) -> bool {
        let Some(entry) = self.sending_mut(local_id) else {
            return false;
        };
        entry.status = OutboundStatus::Sent;
        entry.server_id = server_id;
        entry.confirmed_at = Some(latest_ticket);
        true
    }

    pub fn mark_failed(&mut self, local_id: LocalMessageId, reason: FailureReason) -> bool {
        let Some(entry) = self.sending_mut(local_id) else {
            return false;
        };
        entry.status = OutboundStatus::Failed;
        entry.failure = Some(reason);
        true
    }

    /// Failed → Sending. Returns the identical payload of the first attempt.
    pub fn begin_retry(
        &mut self,
        local_id: LocalMessageId,
    ) -> Result<SendMessageRequest, CoreError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.local_id == local_id)
            .ok_or(CoreError::UnknownMessage(local_id))?;
        if entry.status != OutboundStatus::Failed {
            return Err(CoreError::NotRetryable(local_id));
        }
        entry.status = OutboundStatus::Sending;
        entry.failure = None;
        Ok(entry.retry_payload.clone())
    }

    /// Drops Sent entries the authoritative list now covers. Sending and
    /// Failed entries always stay visible.
    pub fn reconcile(
        &mut self,
        chat: &ChatRef,
        authoritative: &[MessagePayload],
        fetch_ticket: u64,
    ) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| {
            if entry.chat() != chat || entry.status != OutboundStatus::Sent {
                return true;
            }
            let echoed = authoritative.iter().any(|message| entry.is_echoed_by(message));
            let fetched_after_confirm = entry
                .confirmed_at
                .is_some_and(|confirmed| fetch_ticket > confirmed);
            !(echoed || fetched_after_confirm)
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(chat = %chat, removed, "outbound: replaced by server copies");
        }
        removed
    }

    pub fn get(&self, local_id: LocalMessageId) -> Option<&OutboundMessage> {
        self.entries.iter().find(|entry| entry.local_id == local_id)
    }

    pub fn for_chat<'a>(
        &'a self,
        chat: &'a ChatRef,
    ) -> impl Iterator<Item = &'a OutboundMessage> + 'a {
        self.entries.iter().filter(move |entry| entry.chat() == chat)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sending_mut(&mut self, local_id: LocalMessageId) -> Option<&mut OutboundMessage> {
        self.entries
            .iter_mut()
            .find(|entry| entry.local_id == local_id && entry.status == OutboundStatus::Sending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendCompletion {
    pub local_id: LocalMessageId,
    pub chat: ChatRef,
    pub result: Result<SendReceipt, ApiFailure>,
}

/// One delivery task per chat, so sends to a chat reach the server in the
/// order they were made. Dropping the lanes stops the tasks once their
/// queue drains.
pub struct DeliveryLanes {
    api: Arc<dyn ChatApi>,
    credential: Credential,
    completions: mpsc::UnboundedSender<SendCompletion>,
    lanes: HashMap<ChatRef, mpsc::UnboundedSender<SendMessageRequest>>,
}

impl DeliveryLanes {
    pub fn new(
        api: Arc<dyn ChatApi>,
        credential: Credential,
        completions: mpsc::UnboundedSender<SendCompletion>,
    ) -> Self {
        Self {
            api,
            credential,
            completions,
            lanes: HashMap::new(),
        }
    }

    pub fn dispatch(&mut self, request: SendMessageRequest) {
        let request = match self.lanes.get(&request.chat) {
            Some(lane) => match lane.send(request) {
                Ok(()) => return,
                Err(mpsc::error::SendError(request)) => request,
            },
            None => request,
        };
        let lane = self.open_lane(request.chat.clone());
        // A freshly opened lane holds its receiver, so this cannot fail.
        let _ = lane.send(request);
    }

    pub fn close(&mut self) {
        self.lanes.clear();
    }

    fn open_lane(&mut self, chat: ChatRef) -> &mpsc::UnboundedSender<SendMessageRequest> {
        let (tx, mut rx) = mpsc::unbounded_channel::<SendMessageRequest>();
        let api = Arc::clone(&self.api);
        let credential = self.credential.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let result = api.send_message(&credential, &request).await;
                match &result {
                    Ok(_) => info!(
                        local_id = %request.client_ref,
                        chat = %request.chat,
                        "outbound: delivered"
                    ),
                    Err(err) => warn!(
                        local_id = %request.client_ref,
                        chat = %request.chat,
                        "outbound: delivery failed: {err}"
                    ),
                }
                let completion = SendCompletion {
                    local_id: request.client_ref,
                    chat: request.chat,
                    result,
                };
                if completions.send(completion).is_err() {
                    break;
                }
            }
        });
        self.lanes.insert(chat.clone(), tx);
        &self.lanes[&chat]
    }
}

#[cfg(test)]
#[path = "tests/outbound_tests.rs"]
mod tests;
