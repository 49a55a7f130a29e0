//! Scripted collaborators shared by the unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use peer_negotiation::{NegotiatorEvent, NegotiatorFactory, PeerNegotiator, PeerOptions};
use shared::{
    domain::{ChatId, ChatRef, Credential, MessageId},
    error::ApiError,
    protocol::{
        ActiveChatsResponse, GroupChatSummary, IceCandidate, MessagePayload, SendReceipt,
        SessionDescription, UserChatSummary,
    },
};
use tokio::sync::{broadcast, mpsc, Notify};
use url::Url;
use uuid::Uuid;

use crate::{
    error::{ApiFailure, TransportError},
    http_api::{ChatApi, SendMessageRequest},
    transport::{WireConnection, WireConnector},
};

/// Server side of a fake connection.
pub struct FakePeer {
    pub url: Url,
    pub to_client: mpsc::UnboundedSender<String>,
    pub from_client: mpsc::UnboundedReceiver<String>,
}

impl FakePeer {
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.to_client.send(text.into());
    }

    pub async fn next_frame(&mut self) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(30), self.from_client.recv())
            .await
            .ok()
            .flatten()
    }
}

pub struct FakeConnector {
    script: StdMutex<VecDeque<bool>>,
    default_accept: bool,
    attempts: StdMutex<Vec<(Url, tokio::time::Instant)>>,
    peers: mpsc::UnboundedSender<FakePeer>,
}

impl FakeConnector {
    pub fn new(default_accept: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<FakePeer>) {
        let (peers, peers_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                script: StdMutex::new(VecDeque::new()),
                default_accept,
                attempts: StdMutex::new(Vec::new()),
                peers,
            }),
            peers_rx,
        )
    }

    /// Outcomes for the next `open` calls, `true` meaning accept.
    pub fn script(&self, outcomes: impl IntoIterator<Item = bool>) {
        self.script.lock().expect("script lock").extend(outcomes);
    }

    pub fn attempts(&self) -> Vec<(Url, tokio::time::Instant)> {
        self.attempts.lock().expect("attempts lock").clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().expect("attempts lock").len()
    }
}

#[async_trait]
impl WireConnector for FakeConnector {
    async fn open(&self, url: &Url) -> Result<WireConnection, TransportError> {
        self.attempts
            .lock()
            .expect("attempts lock")
            .push((url.clone(), tokio::time::Instant::now()));
        let accept = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(self.default_accept);
        if !accept {
            return Err(TransportError::Connect {
                url: url.to_string(),
                reason: "connection refused".into(),
            });
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let _ = self.peers.send(FakePeer {
            url: url.clone(),
            to_client,
            from_client,
        });
        Ok(WireConnection { outbound, inbound })
    }
}

pub fn message(id: u128, text: &str) -> MessagePayload {
    MessagePayload {
        id: MessageId(Uuid::from_u128(id)),
        sender: "Alice A".into(),
        text: text.into(),
        file_url: String::new(),
        is_image: false,
        is_mine: false,
        is_read: true,
        time: "10:00".into(),
        created_at: Utc
            .with_ymd_and_hms(2024, 1, 1, 10, 0, 0)
            .single()
            .expect("timestamp"),
        client_ref: None,
    }
}

pub fn user_chat(login: &str, unread: u32) -> UserChatSummary {
    UserChatSummary {
        id: ChatId(Uuid::new_v5(&Uuid::NAMESPACE_OID, login.as_bytes())),
        login: login.into(),
        name: format!("{login} name"),
        avatar_url: String::new(),
        unread_count: unread,
        last_message: "hi".into(),
        last_time: "10:00".into(),
    }
}

pub fn group_chat(id: u128, name: &str, unread: u32) -> GroupChatSummary {
    GroupChatSummary {
        id: ChatId(Uuid::from_u128(id)),
        name: name.into(),
        avatar_url: String::new(),
        owner_login: "alice".into(),
        members: vec!["alice".into(), "me".into()],
        unread_count: unread,
        last_message: "hello".into(),
        last_time: "09:00".into(),
    }
}

#[derive(Default)]
struct FakeApiState {
    chats: ActiveChatsResponse,
    messages: HashMap<ChatRef, Vec<MessagePayload>>,
    send_failures: VecDeque<ApiFailure>,
    fail_reads: bool,
    sent: Vec<SendMessageRequest>,
    invites: Vec<String>,
    chat_fetches: usize,
    message_fetches: usize,
    stalled_chat_fetches: usize,
}

/// In-memory chat server. Sends are persisted into the target chat.
#[derive(Default)]
pub struct FakeChatApi {
    state: StdMutex<FakeApiState>,
    hold_sends: AtomicBool,
    release_sends: Notify,
    next_id: AtomicUsize,
}

impl FakeChatApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_chats(&self, chats: ActiveChatsResponse) {
        self.state.lock().expect("state").chats = chats;
    }

    pub fn set_messages(&self, chat: ChatRef, messages: Vec<MessagePayload>) {
        self.state
            .lock()
            .expect("state")
            .messages
            .insert(chat, messages);
    }

    pub fn fail_next_send(&self, failure: ApiFailure) {
        self.state
            .lock()
            .expect("state")
            .send_failures
            .push_back(failure);
    }

    /// The next `count` summary fetches never answer.
    pub fn stall_chat_fetches(&self, count: usize) {
        self.state.lock().expect("state").stalled_chat_fetches = count;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.state.lock().expect("state").fail_reads = fail;
    }

    /// Parks every send until `release_sends` is called.
    pub fn hold_sends(&self) {
        self.hold_sends.store(true, Ordering::SeqCst);
    }

    pub fn release_sends(&self) {
        self.hold_sends.store(false, Ordering::SeqCst);
        self.release_sends.notify_waiters();
    }

    pub fn sent(&self) -> Vec<SendMessageRequest> {
        self.state.lock().expect("state").sent.clone()
    }

    pub fn invites(&self) -> Vec<String> {
        self.state.lock().expect("state").invites.clone()
    }

    pub fn chat_fetches(&self) -> usize {
        self.state.lock().expect("state").chat_fetches
    }

    pub fn message_fetches(&self) -> usize {
        self.state.lock().expect("state").message_fetches
    }
}

fn unreachable_server() -> ApiFailure {
    ApiFailure::Transport(TransportError::Request("connection refused".into()))
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn active_chats(
        &self,
        _credential: &Credential,
    ) -> Result<ActiveChatsResponse, ApiFailure> {
        let stalled = {
            let mut state = self.state.lock().expect("state");
            state.chat_fetches += 1;
            let stalled = state.stalled_chat_fetches > 0;
            state.stalled_chat_fetches = state.stalled_chat_fetches.saturating_sub(1);
            stalled
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        let state = self.state.lock().expect("state");
        if state.fail_reads {
            return Err(unreachable_server());
        }
        Ok(state.chats.clone())
    }

    async fn messages(
        &self,
        _credential: &Credential,
        chat: &ChatRef,
    ) -> Result<Vec<MessagePayload>, ApiFailure> {
        let mut state = self.state.lock().expect("state");
        state.message_fetches += 1;
        if state.fail_reads {
            return Err(unreachable_server());
        }
        match state.messages.get(chat) {
            Some(messages) => Ok(messages.clone()),
            None => Err(ApiFailure::Rejected(ApiError::from_status(404, "chat not found"))),
        }
    }

    async fn send_message(
        &self,
        _credential: &Credential,
        request: &SendMessageRequest,
    ) -> Result<SendReceipt, ApiFailure> {
        while self.hold_sends.load(Ordering::SeqCst) {
            let released = self.release_sends.notified();
            if !self.hold_sends.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }

        let mut state = self.state.lock().expect("state");
        state.sent.push(request.clone());
        if let Some(failure) = state.send_failures.pop_front() {
            return Err(failure);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as u128 + 1_000;
        let mut persisted = message(id, &request.text);
        persisted.is_mine = true;
        persisted.client_ref = Some(request.client_ref);
        state
            .messages
            .entry(request.chat.clone())
            .or_default()
            .push(persisted);
        Ok(SendReceipt {
            id: Some(MessageId(Uuid::from_u128(id))),
            status: Some("success".into()),
        })
    }

    async fn invite_call(
        &self,
        _credential: &Credential,
        target_login: &str,
    ) -> Result<(), ApiFailure> {
        self.state
            .lock()
            .expect("state")
            .invites
            .push(target_login.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct NegotiatorLog {
    acquired: bool,
    released: usize,
    offers_created: usize,
    accepted_offers: Vec<SessionDescription>,
    applied_answers: Vec<SessionDescription>,
    candidates: Vec<IceCandidate>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Microphone {
    Present,
    Missing,
    Stuck,
}

/// Negotiator that records calls and can be told to fail.
pub struct FakeNegotiator {
    log: StdMutex<NegotiatorLog>,
    microphone: Microphone,
    fail_candidates: bool,
    events: broadcast::Sender<NegotiatorEvent>,
}

impl FakeNegotiator {
    pub fn new() -> Arc<Self> {
        Self::build(Microphone::Present, false)
    }

    pub fn without_microphone() -> Arc<Self> {
        Self::build(Microphone::Missing, false)
    }

    /// Capture never completes, like a permission prompt nobody answers.
    pub fn stuck_microphone() -> Arc<Self> {
        Self::build(Microphone::Stuck, false)
    }

    pub fn rejecting_candidates() -> Arc<Self> {
        Self::build(Microphone::Present, true)
    }

    fn build(microphone: Microphone, fail_candidates: bool) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            log: StdMutex::new(NegotiatorLog::default()),
            microphone,
            fail_candidates,
            events,
        })
    }

    pub fn emit(&self, event: NegotiatorEvent) {
        let _ = self.events.send(event);
    }

    pub fn media_acquired(&self) -> bool {
        self.log.lock().expect("log").acquired
    }

    pub fn release_count(&self) -> usize {
        self.log.lock().expect("log").released
    }

    pub fn offers_created(&self) -> usize {
        self.log.lock().expect("log").offers_created
    }

    pub fn applied_answers(&self) -> Vec<SessionDescription> {
        self.log.lock().expect("log").applied_answers.clone()
    }

    pub fn accepted_offers(&self) -> Vec<SessionDescription> {
        self.log.lock().expect("log").accepted_offers.clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.log.lock().expect("log").candidates.clone()
    }
}

#[async_trait]
impl PeerNegotiator for FakeNegotiator {
    async fn acquire_local_audio(&self) -> anyhow::Result<()> {
        match self.microphone {
            Microphone::Present => {}
            Microphone::Missing => return Err(anyhow!("permission denied")),
            Microphone::Stuck => std::future::pending::<()>().await,
        }
        self.log.lock().expect("log").acquired = true;
        Ok(())
    }

    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        self.log.lock().expect("log").offers_created += 1;
        Ok(SessionDescription::offer("local-offer"))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> anyhow::Result<SessionDescription> {
        self.log.lock().expect("log").accepted_offers.push(offer);
        Ok(SessionDescription::answer("local-answer"))
    }

    async fn apply_answer(&self, answer: SessionDescription) -> anyhow::Result<()> {
        self.log.lock().expect("log").applied_answers.push(answer);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()> {
        if self.fail_candidates {
            return Err(anyhow!("no remote description yet"));
        }
        self.log.lock().expect("log").candidates.push(candidate);
        Ok(())
    }

    fn release(&self) {
        let mut log = self.log.lock().expect("log");
        log.acquired = false;
        log.released += 1;
    }

    fn subscribe_events(&self) -> broadcast::Receiver<NegotiatorEvent> {
        self.events.subscribe()
    }
}

/// Hands out pre-built negotiators in order, then fresh ones.
pub struct FakeNegotiatorFactory {
    queue: StdMutex<VecDeque<Arc<FakeNegotiator>>>,
}

impl FakeNegotiatorFactory {
    pub fn new(negotiators: impl IntoIterator<Item = Arc<FakeNegotiator>>) -> Arc<Self> {
        Arc::new(Self {
            queue: StdMutex::new(negotiators.into_iter().collect()),
        })
    }
}

#[async_trait]
impl NegotiatorFactory for FakeNegotiatorFactory {
    async fn create(&self, _options: PeerOptions) -> anyhow::Result<Arc<dyn PeerNegotiator>> {
        let negotiator = self
            .queue
            .lock()
            .expect("queue")
            .pop_front()
            .unwrap_or_else(FakeNegotiator::new);
        Ok(negotiator)
    }
}
