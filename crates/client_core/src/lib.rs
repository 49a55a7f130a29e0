use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use peer_negotiation::{NegotiatorFactory, PeerNegotiator, PeerOptions};
use shared::domain::{ChatRef, LocalMessageId, RoomId};
use tokio::sync::broadcast;

pub mod backoff;
pub mod call_session;
pub mod config;
pub mod error;
pub mod event_channel;
pub mod heartbeat;
pub mod http_api;
pub mod outbound;
pub mod poller;
pub mod reconciler;
pub mod session;
pub mod signaling;
pub mod transport;

pub use call_session::{CallRole, CallState};
pub use config::{load_settings, ClientSettings, RealtimeEndpoints};
pub use error::{CoreError, FailureReason};
pub use event_channel::ChannelState;
pub use http_api::Attachment;
pub use session::{
    CallSnapshot, IncomingInvite, Session, SessionDeps, SessionHandle, SessionSnapshot,
    TimelineEntry,
};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

/// Used when the build has no media backend: every call fails as MediaUnavailable.
pub struct MissingNegotiatorFactory;

#[async_trait]
impl NegotiatorFactory for MissingNegotiatorFactory {
    async fn create(&self, _options: PeerOptions) -> Result<Arc<dyn PeerNegotiator>> {
        Err(anyhow!("no audio backend is available"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ChannelStateChanged {
        state: ChannelState,
        attempt: u32,
        retry_in: Option<Duration>,
    },
    ChatsUpdated,
    TimelineUpdated {
        chat: ChatRef,
    },
    IncomingMessage {
        chat: ChatRef,
        sender_name: String,
        preview: String,
    },
    MessageFailed {
        local_id: LocalMessageId,
        chat: ChatRef,
        reason: FailureReason,
    },
    IncomingCall(IncomingInvite),
    CallStateChanged(CallSnapshot),
    /// A failure the user has to see. Everything else is recovered locally.
    Failure(CoreError),
    LoggedOut,
}

#[async_trait]
pub trait ClientHandle: Send + Sync {
    /// Shows the message immediately and delivers it in the background.
    async fn send(
        &self,
        chat: ChatRef,
        text: String,
        attachment: Option<Attachment>,
    ) -> Result<LocalMessageId, CoreError>;
    async fn retry(&self, local_id: LocalMessageId) -> Result<(), CoreError>;
    async fn open_chat(&self, chat: ChatRef) -> Result<(), CoreError>;
    async fn set_draft(&self, chat: ChatRef, text: String) -> Result<(), CoreError>;
    async fn start_call(&self, chat: ChatRef) -> Result<RoomId, CoreError>;
    /// Answers the oldest pending invite.
    async fn accept_call(&self) -> Result<IncomingInvite, CoreError>;
    async fn decline_call(&self) -> Result<IncomingInvite, CoreError>;
    async fn hangup(&self) -> Result<(), CoreError>;
    /// Replaces the event channel with a fresh connection.
    async fn reconnect(&self) -> Result<(), CoreError>;
    async fn snapshot(&self) -> Result<SessionSnapshot, CoreError>;
    async fn logout(&self) -> Result<(), CoreError>;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
