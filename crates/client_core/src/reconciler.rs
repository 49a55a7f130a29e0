//! Local view of the chat list and the open conversation, rebuilt from
//! authoritative fetches whenever something may have changed.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use shared::{
    domain::{ChatId, ChatKind, ChatRef, Credential},
    protocol::{
        ActiveChatsResponse, GroupChatSummary, MessagePayload, ServerEvent, UserChatSummary,
    },
};
use tracing::debug;

use crate::{error::ApiFailure, http_api::ChatApi};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSummary {
    pub id: ChatId,
    pub kind: ChatKind,
    /// Peer login for private chats, group id for groups.
    pub target: String,
    pub display_name: String,
    pub last_message_preview: String,
    pub last_message_time: String,
    pub unread_count: u32,
}

impl ChatSummary {
    pub fn chat_ref(&self) -> ChatRef {
        ChatRef {
            kind: self.kind,
            target: self.target.clone(),
        }
    }

    fn is(&self, chat: &ChatRef) -> bool {
        self.kind == chat.kind && self.target == chat.target
    }
}

impl From<UserChatSummary> for ChatSummary {
    fn from(user: UserChatSummary) -> Self {
        Self {
            id: user.id,
            kind: ChatKind::User,
            target: user.login,
            display_name: user.name,
            last_message_preview: user.last_message,
            last_message_time: user.last_time,
            unread_count: user.unread_count,
        }
    }
}

impl From<GroupChatSummary> for ChatSummary {
    fn from(group: GroupChatSummary) -> Self {
        Self {
            id: group.id,
            kind: ChatKind::Group,
            target: group.id.to_string(),
            display_name: group.name,
            last_message_preview: group.last_message,
            last_message_time: group.last_time,
            unread_count: group.unread_count,
        }
    }
}

/// Monotonic tickets handed to fetches when they start. Shared by every
/// fetch source so a late response can be recognised as stale.
#[derive(Debug, Clone, Default)]
pub struct FetchTickets(Arc<AtomicU64>);

impl FetchTickets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn latest(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Refresh {
    Summaries,
    Messages(ChatRef),
}

#[derive(Debug)]
pub enum FetchOutcome {
    Summaries {
        ticket: u64,
        result: Result<ActiveChatsResponse, ApiFailure>,
    },
    Messages {
        chat: ChatRef,
        ticket: u64,
        result: Result<Vec<MessagePayload>, ApiFailure>,
    },
}

impl FetchOutcome {
    pub fn is_ok(&self) -> bool {
        match self {
            FetchOutcome::Summaries { result, .. } => result.is_ok(),
            FetchOutcome::Messages { result, .. } => result.is_ok(),
        }
    }
}

/// Runs one authoritative fetch, taking its ticket before the request goes out.
#[derive(Clone)]
pub struct RefreshFetcher {
    api: Arc<dyn ChatApi>,
    credential: Credential,
    tickets: FetchTickets,
}

impl RefreshFetcher {
    pub fn new(api: Arc<dyn ChatApi>, credential: Credential, tickets: FetchTickets) -> Self {
        Self {
            api,
            credential,
            tickets,
        }
    }

    pub async fn fetch(&self, refresh: Refresh) -> FetchOutcome {
        let ticket = self.tickets.next();
        match refresh {
            Refresh::Summaries => FetchOutcome::Summaries {
                ticket,
                result: self.api.active_chats(&self.credential).await,
            },
            Refresh::Messages(chat) => {
                let result = self.api.messages(&self.credential, &chat).await;
                FetchOutcome::Messages {
                    chat,
                    ticket,
                    result,
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ChatStateReconciler {
    summaries: Vec<ChatSummary>,
    active: Option<ChatRef>,
    timeline: Vec<MessagePayload>,
    summaries_ticket: u64,
    timeline_ticket: u64,
}

impl ChatStateReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summaries(&self) -> &[ChatSummary] {
        &self.summaries
    }

    pub fn active_chat(&self) -> Option<&ChatRef> {
        self.active.as_ref()
    }

    /// Authoritative messages of the open chat, oldest first.
    pub fn timeline(&self) -> &[MessagePayload] {
        &self.timeline
    }

    pub fn summary(&self, chat: &ChatRef) -> Option<&ChatSummary> {
        self.summaries.iter().find(|summary| summary.is(chat))
    }

    /// Marks `chat` active and zeroes its unread count before anything is fetched.
    pub fn open_chat(&mut self, chat: ChatRef) -> Vec<Refresh> {
        if self.active.as_ref() != Some(&chat) {
            self.timeline.clear();
            self.timeline_ticket = 0;
        }
        self.active = Some(chat.clone());
        self.clear_active_unread();
        // The server marks messages read while serving them, so summaries follow.
        vec![Refresh::Messages(chat), Refresh::Summaries]
    }

    pub fn apply_summaries(&mut self, ticket: u64, response: ActiveChatsResponse) -> bool {
        if ticket <= self.summaries_ticket {
            debug!(ticket, applied = self.summaries_ticket, "reconcile: stale summaries");
            return false;
        }
        self.summaries_ticket = ticket;
        self.summaries = response
            .users
            .into_iter()
            .map(ChatSummary::from)
            .chain(response.groups.into_iter().map(ChatSummary::from))
            .collect();
        self.clear_active_unread();
        true
    }

    /// Replaces the open chat's timeline unless the response is for another
    /// chat or older than what is shown.
    pub fn apply_messages(
        &mut self,
        chat: &ChatRef,
        ticket: u64,
        messages: Vec<MessagePayload>,
    ) -> bool {
        if self.active.as_ref() != Some(chat) {
            debug!(chat = %chat, "reconcile: messages for a chat that is no longer open");
            return false;
        }
        if ticket <= self.timeline_ticket {
            debug!(ticket, applied = self.timeline_ticket, "reconcile: stale messages");
            return false;
        }
        self.timeline_ticket = ticket;
        self.timeline = messages;
        true
    }

    pub fn on_pushed_event(&mut self, event: &ServerEvent) -> Vec<Refresh> {
        match event {
            ServerEvent::MessageNew { .. } | ServerEvent::ChatUpdate { .. } => {
                self.clear_active_unread();
                let mut refreshes = vec![Refresh::Summaries];
                if let Some(active) = &self.active {
                    refreshes.push(Refresh::Messages(active.clone()));
                }
                refreshes
            }
            ServerEvent::CallInvite { .. } => Vec::new(),
        }
    }

    fn clear_active_unread(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        if let Some(summary) = self.summaries.iter_mut().find(|summary| summary.is(active)) {
            summary.unread_count = 0;
        }
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
