//! The single owner of everything that lives for one login: the event
//! channel, the poller, the chat view, the outbound queue and the call slot.
//! All of it is mutated on one actor task; handles talk to it by message.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use peer_negotiation::NegotiatorFactory;
use shared::{
    domain::{ChatKind, ChatRef, Credential, LocalMessageId, RoomId},
    protocol::{MessagePayload, ServerEvent},
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::{
    call_session::{CallHandle, CallProgress, CallRole, CallSetup, CallState, CallUpdate},
    config::{ClientSettings, RealtimeEndpoints},
    error::{ApiFailure, CoreError, FailureReason},
    event_channel::{ChannelNotice, ChannelSettings, ChannelState, EventChannelManager},
    http_api::{Attachment, ChatApi, HttpChatApi},
    outbound::{DeliveryLanes, OutboundMessage, OutboundQueue, SendCompletion},
    poller::FallbackPoller,
    reconciler::{
        ChatStateReconciler, ChatSummary, FetchOutcome, FetchTickets, Refresh, RefreshFetcher,
    },
    transport::{WebSocketConnector, WireConnector},
    ClientEvent, ClientHandle,
};

/// Who is logged in. Fixed for the lifetime of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub credential: Credential,
    pub identity: String,
}

impl Session {
    pub fn new(credential: Credential, identity: impl Into<String>) -> Self {
        Self {
            credential,
            identity: identity.into(),
        }
    }
}

/// Collaborators the session reaches the outside world through.
#[derive(Clone)]
pub struct SessionDeps {
    pub api: Arc<dyn ChatApi>,
    pub connector: Arc<dyn WireConnector>,
    pub negotiators: Arc<dyn NegotiatorFactory>,
}

impl SessionDeps {
    pub fn over_network(
        settings: &ClientSettings,
        negotiators: Arc<dyn NegotiatorFactory>,
    ) -> anyhow::Result<Self> {
        let api = HttpChatApi::new(settings.endpoints()?, settings.request_timeout())?;
        Ok(Self {
            api: Arc::new(api),
            connector: Arc::new(WebSocketConnector),
            negotiators,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingInvite {
    pub from_login: String,
    pub from_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub room_id: RoomId,
    pub role: CallRole,
    pub remote_peer: String,
    pub state: CallState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEntry {
    Delivered(MessagePayload),
    Pending(OutboundMessage),
}

impl TimelineEntry {
    pub fn text(&self) -> &str {
        match self {
            TimelineEntry::Delivered(message) => &message.text,
            TimelineEntry::Pending(message) => message.text(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub identity: String,
    pub channel_state: ChannelState,
    pub summaries: Vec<ChatSummary>,
    pub active_chat: Option<ChatRef>,
    /// Server messages of the open chat followed by local ones not yet replaced.
    pub timeline: Vec<TimelineEntry>,
    pub draft: String,
    pub call: Option<CallSnapshot>,
    pub pending_invites: Vec<IncomingInvite>,
}

type Reply<T> = oneshot::Sender<Result<T, CoreError>>;

enum Command {
    Send {
        chat: ChatRef,
        text: String,
        attachment: Option<Attachment>,
        reply: Reply<LocalMessageId>,
    },
    Retry {
        local_id: LocalMessageId,
        reply: Reply<()>,
    },
    OpenChat {
        chat: ChatRef,
        reply: Reply<()>,
    },
    SetDraft {
        chat: ChatRef,
        text: String,
        reply: Reply<()>,
    },
    StartCall {
        chat: ChatRef,
        reply: Reply<RoomId>,
    },
    AcceptCall {
        reply: Reply<IncomingInvite>,
    },
    DeclineCall {
        reply: Reply<IncomingInvite>,
    },
    Hangup {
        reply: Reply<()>,
    },
    Reconnect {
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<SessionSnapshot>,
    },
    Logout {
        reply: Reply<()>,
    },
}

/// Cheap handle to the session actor. Clones share the same session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ClientEvent>,
}

impl SessionHandle {
    /// Spawns the session actor; it connects the event channel and starts polling right away.
    pub fn start(
        session: Session,
        settings: ClientSettings,
        deps: SessionDeps,
    ) -> anyhow::Result<Self> {
        let endpoints = settings.endpoints()?;
        let (events, _) = broadcast::channel(1024);
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (inboxes, senders) = Inboxes::new(commands_rx);
        let actor = SessionActor::new(session, settings, endpoints, deps, events.clone(), senders);
        tokio::spawn(actor.run(inboxes));
        Ok(Self { commands, events })
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, CoreError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| CoreError::SessionClosed)?;
        response.await.map_err(|_| CoreError::SessionClosed)?
    }
}

#[async_trait]
impl ClientHandle for SessionHandle {
    async fn send(
        &self,
        chat: ChatRef,
        text: String,
        attachment: Option<Attachment>,
    ) -> Result<LocalMessageId, CoreError> {
        self.request(|reply| Command::Send {
            chat,
            text,
            attachment,
            reply,
        })
        .await
    }

    async fn retry(&self, local_id: LocalMessageId) -> Result<(), CoreError> {
        self.request(|reply| Command::Retry { local_id, reply }).await
    }

    async fn open_chat(&self, chat: ChatRef) -> Result<(), CoreError> {
        self.request(|reply| Command::OpenChat { chat, reply }).await
    }

    async fn set_draft(&self, chat: ChatRef, text: String) -> Result<(), CoreError> {
        self.request(|reply| Command::SetDraft { chat, text, reply })
            .await
    }

    async fn start_call(&self, chat: ChatRef) -> Result<RoomId, CoreError> {
        self.request(|reply| Command::StartCall { chat, reply }).await
    }

    async fn accept_call(&self) -> Result<IncomingInvite, CoreError> {
        self.request(|reply| Command::AcceptCall { reply }).await
    }

    async fn decline_call(&self) -> Result<IncomingInvite, CoreError> {
        self.request(|reply| Command::DeclineCall { reply }).await
    }

    async fn hangup(&self) -> Result<(), CoreError> {
        self.request(|reply| Command::Hangup { reply }).await
    }

    async fn reconnect(&self) -> Result<(), CoreError> {
        self.request(|reply| Command::Reconnect { reply }).await
    }

    async fn snapshot(&self) -> Result<SessionSnapshot, CoreError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    async fn logout(&self) -> Result<(), CoreError> {
        self.request(|reply| Command::Logout { reply }).await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

struct Inboxes {
    commands: mpsc::UnboundedReceiver<Command>,
    notices: mpsc::UnboundedReceiver<ChannelNotice>,
    fetched: mpsc::UnboundedReceiver<FetchOutcome>,
    sends: mpsc::UnboundedReceiver<SendCompletion>,
    calls: mpsc::UnboundedReceiver<CallUpdate>,
}

struct Senders {
    notices: mpsc::UnboundedSender<ChannelNotice>,
    fetched: mpsc::UnboundedSender<FetchOutcome>,
    sends: mpsc::UnboundedSender<SendCompletion>,
    calls: mpsc::UnboundedSender<CallUpdate>,
}

impl Inboxes {
    fn new(commands: mpsc::UnboundedReceiver<Command>) -> (Self, Senders) {
        let (notices_tx, notices) = mpsc::unbounded_channel();
        let (fetched_tx, fetched) = mpsc::unbounded_channel();
        let (sends_tx, sends) = mpsc::unbounded_channel();
        let (calls_tx, calls) = mpsc::unbounded_channel();
        (
            Self {
                commands,
                notices,
                fetched,
                sends,
                calls,
            },
            Senders {
                notices: notices_tx,
                fetched: fetched_tx,
                sends: sends_tx,
                calls: calls_tx,
            },
        )
    }
}

struct ActiveCall {
    handle: CallHandle,
    snapshot: CallSnapshot,
}

struct SessionActor {
    session: Session,
    settings: ClientSettings,
    endpoints: RealtimeEndpoints,
    deps: SessionDeps,
    events: broadcast::Sender<ClientEvent>,
    senders: Senders,
    channel: Option<EventChannelManager>,
    channel_state: ChannelState,
    poller: Option<FallbackPoller>,
    active_chat: watch::Sender<Option<ChatRef>>,
    tickets: FetchTickets,
    fetcher: RefreshFetcher,
    reconciler: ChatStateReconciler,
    outbound: OutboundQueue,
    lanes: DeliveryLanes,
    call: Option<ActiveCall>,
    call_generation: u64,
    invites: VecDeque<IncomingInvite>,
    drafts: HashMap<ChatRef, String>,
}

impl SessionActor {
    fn new(
        session: Session,
        settings: ClientSettings,
        endpoints: RealtimeEndpoints,
        deps: SessionDeps,
        events: broadcast::Sender<ClientEvent>,
        senders: Senders,
    ) -> Self {
        let tickets = FetchTickets::new();
        let fetcher = RefreshFetcher::new(
            Arc::clone(&deps.api),
            session.credential.clone(),
            tickets.clone(),
        );
        let lanes = DeliveryLanes::new(
            Arc::clone(&deps.api),
            session.credential.clone(),
            senders.sends.clone(),
        );
        let (active_chat, _) = watch::channel(None);
        Self {
            session,
            settings,
            endpoints,
            deps,
            events,
            senders,
            channel: None,
            channel_state: ChannelState::Closed,
            poller: None,
            active_chat,
            tickets,
            fetcher,
            reconciler: ChatStateReconciler::new(),
            outbound: OutboundQueue::new(),
            lanes,
            call: None,
            call_generation: 0,
            invites: VecDeque::new(),
            drafts: HashMap::new(),
        }
    }

    async fn run(mut self, mut inboxes: Inboxes) {
        info!(identity = %self.session.identity, "session: started");
        self.connect_channel();
        self.poller = Some(FallbackPoller::start(
            self.settings.poll_interval(),
            self.fetcher.clone(),
            self.active_chat.subscribe(),
            self.senders.fetched.clone(),
        ));
        self.spawn_refreshes(vec![Refresh::Summaries]);

        loop {
            tokio::select! {
                command = inboxes.commands.recv() => match command {
                    Some(Command::Logout { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(Ok(()));
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(notice) = inboxes.notices.recv() => self.on_channel_notice(notice),
                Some(outcome) = inboxes.fetched.recv() => self.on_fetched(outcome),
                Some(completion) = inboxes.sends.recv() => self.on_send_completed(completion),
                Some(update) = inboxes.calls.recv() => self.on_call_update(update),
            }
        }
        // Every handle is gone.
        self.teardown().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send {
                chat,
                text,
                attachment,
                reply,
            } => {
                let _ = reply.send(self.send(chat, text, attachment));
            }
            Command::Retry { local_id, reply } => {
                let _ = reply.send(self.retry(local_id));
            }
            Command::OpenChat { chat, reply } => {
                self.open_chat(chat);
                let _ = reply.send(Ok(()));
            }
            Command::SetDraft { chat, text, reply } => {
                if text.is_empty() {
                    self.drafts.remove(&chat);
                } else {
                    self.drafts.insert(chat, text);
                }
                let _ = reply.send(Ok(()));
            }
            Command::StartCall { chat, reply } => {
                let _ = reply.send(self.start_call(chat));
            }
            Command::AcceptCall { reply } => {
                let _ = reply.send(self.accept_call());
            }
            Command::DeclineCall { reply } => {
                let declined = self.invites.pop_front().ok_or(CoreError::NoIncomingCall);
                if let Ok(invite) = &declined {
                    info!(from = %invite.from_login, "call: invite declined");
                }
                let _ = reply.send(declined);
            }
            Command::Hangup { reply } => {
                let result = match &self.call {
                    Some(call) => {
                        call.handle.hangup();
                        Ok(())
                    }
                    None => Err(CoreError::NoActiveCall),
                };
                let _ = reply.send(result);
            }
            Command::Reconnect { reply } => {
                if let Some(previous) = self.channel.take() {
                    previous.shutdown().await;
                }
                self.connect_channel();
                let _ = reply.send(Ok(()));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            // Handled by the run loop.
            Command::Logout { reply } => {
                let _ = reply.send(Err(CoreError::SessionClosed));
            }
        }
    }

    fn connect_channel(&mut self) {
        self.channel = Some(EventChannelManager::connect(
            &self.session,
            &self.endpoints,
            Arc::clone(&self.deps.connector),
            ChannelSettings::from(&self.settings),
            self.senders.notices.clone(),
        ));
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn spawn_refreshes(&self, refreshes: Vec<Refresh>) {
        for refresh in refreshes {
            let fetcher = self.fetcher.clone();
            let sink = self.senders.fetched.clone();
            tokio::spawn(async move {
                let _ = sink.send(fetcher.fetch(refresh).await);
            });
        }
    }

    fn send(
        &mut self,
        chat: ChatRef,
        text: String,
        attachment: Option<Attachment>,
    ) -> Result<LocalMessageId, CoreError> {
        if text.trim().is_empty() && attachment.is_none() {
            return Err(CoreError::Validation("message is empty".into()));
        }
        let request = self.outbound.enqueue(chat.clone(), text, attachment);
        let local_id = request.client_ref;
        self.drafts.remove(&chat);
        self.lanes.dispatch(request);
        debug!(local_id = %local_id, chat = %chat, "outbound: queued");
        self.emit(ClientEvent::TimelineUpdated { chat });
        Ok(local_id)
    }

    fn retry(&mut self, local_id: LocalMessageId) -> Result<(), CoreError> {
        let request = self.outbound.begin_retry(local_id)?;
        let chat = request.chat.clone();
        self.lanes.dispatch(request);
        info!(local_id = %local_id, chat = %chat, "outbound: retrying");
        self.emit(ClientEvent::TimelineUpdated { chat });
        Ok(())
    }

    fn open_chat(&mut self, chat: ChatRef) {
        let refreshes = self.reconciler.open_chat(chat.clone());
        self.active_chat.send_replace(Some(chat.clone()));
        self.spawn_refreshes(refreshes);
        self.emit(ClientEvent::ChatsUpdated);
        self.emit(ClientEvent::TimelineUpdated { chat });
    }

    fn start_call(&mut self, chat: ChatRef) -> Result<RoomId, CoreError> {
        if chat.kind != ChatKind::User {
            return Err(CoreError::Validation(
                "calls are only possible in private chats".into(),
            ));
        }
        if chat.target == self.session.identity {
            return Err(CoreError::Validation("cannot call yourself".into()));
        }
        if self.call.is_some() {
            return Err(CoreError::CallInProgress);
        }
        Ok(self.launch_call(CallRole::Caller, chat.target))
    }

    fn accept_call(&mut self) -> Result<IncomingInvite, CoreError> {
        if self.call.is_some() {
            return Err(CoreError::CallInProgress);
        }
        let invite = self.invites.pop_front().ok_or(CoreError::NoIncomingCall)?;
        self.launch_call(CallRole::Callee, invite.from_login.clone());

        let caller_chat = ChatRef::user(invite.from_login.clone());
        if self.reconciler.summary(&caller_chat).is_some() {
            self.open_chat(caller_chat);
        }
        Ok(invite)
    }

    fn launch_call(&mut self, role: CallRole, remote_peer: String) -> RoomId {
        self.call_generation += 1;
        let room_id = RoomId::for_pair(&self.session.identity, &remote_peer);
        let setup = CallSetup {
            generation: self.call_generation,
            room_id: room_id.clone(),
            role,
            remote_peer: remote_peer.clone(),
            session: self.session.clone(),
            endpoints: self.endpoints.clone(),
            connector: Arc::clone(&self.deps.connector),
            negotiators: Arc::clone(&self.deps.negotiators),
            peer_options: self.settings.peer_options(),
            api: Arc::clone(&self.deps.api),
        };
        let snapshot = CallSnapshot {
            room_id: room_id.clone(),
            role,
            remote_peer,
            state: match role {
                CallRole::Caller => CallState::Inviting,
                CallRole::Callee => CallState::Negotiating,
            },
        };
        info!(room = %room_id, role = ?role, "call: starting");
        self.emit(ClientEvent::CallStateChanged(snapshot.clone()));
        self.call = Some(ActiveCall {
            handle: CallHandle::spawn(setup, self.senders.calls.clone()),
            snapshot,
        });
        room_id
    }

    fn on_channel_notice(&mut self, notice: ChannelNotice) {
        match notice {
            ChannelNotice::StateChanged {
                state,
                attempt,
                retry_in,
            } => {
                let reopened =
                    state == ChannelState::Open && self.channel_state != ChannelState::Open;
                self.channel_state = state;
                self.emit(ClientEvent::ChannelStateChanged {
                    state,
                    attempt,
                    retry_in,
                });
                if reopened {
                    // Catch up on whatever was pushed while the socket was down.
                    let mut refreshes = vec![Refresh::Summaries];
                    if let Some(chat) = self.reconciler.active_chat() {
                        refreshes.push(Refresh::Messages(chat.clone()));
                    }
                    self.spawn_refreshes(refreshes);
                }
            }
            ChannelNotice::Event(event) => self.on_server_event(event),
        }
    }

    fn on_server_event(&mut self, event: ServerEvent) {
        let refreshes = self.reconciler.on_pushed_event(&event);
        self.spawn_refreshes(refreshes);
        match event {
            ServerEvent::MessageNew {
                chat_type,
                target,
                sender_login,
                sender_name,
                preview,
            } => {
                if !sender_login.is_empty() && sender_login != self.session.identity {
                    // Private pushes carry the recipient as target, which is us.
                    let chat = match chat_type {
                        ChatKind::User => ChatRef::user(sender_login),
                        ChatKind::Group => ChatRef::group(target),
                    };
                    self.emit(ClientEvent::IncomingMessage {
                        chat,
                        sender_name,
                        preview,
                    });
                }
            }
            ServerEvent::ChatUpdate { .. } => {}
            ServerEvent::CallInvite {
                from_login,
                from_name,
            } => self.on_call_invite(from_login, from_name),
        }
    }

    fn on_call_invite(&mut self, from_login: String, from_name: String) {
        if from_login == self.session.identity {
            return;
        }
        if self.invites.iter().any(|invite| invite.from_login == from_login) {
            debug!(from = %from_login, "call: duplicate invite");
            return;
        }
        info!(
            from = %from_login,
            busy = self.call.is_some(),
            queued = self.invites.len(),
            "call: incoming invite"
        );
        let invite = IncomingInvite {
            from_login,
            from_name,
        };
        self.invites.push_back(invite.clone());
        self.emit(ClientEvent::IncomingCall(invite));
    }

    fn on_fetched(&mut self, outcome: FetchOutcome) {
        match outcome {
            FetchOutcome::Summaries {
                ticket,
                result: Ok(response),
            } => {
                if self.reconciler.apply_summaries(ticket, response) {
                    self.emit(ClientEvent::ChatsUpdated);
                }
            }
            FetchOutcome::Messages {
                chat,
                ticket,
                result: Ok(messages),
            } => {
                if self.reconciler.apply_messages(&chat, ticket, messages) {
                    self.outbound
                        .reconcile(&chat, self.reconciler.timeline(), ticket);
                    self.emit(ClientEvent::TimelineUpdated { chat });
                }
            }
            FetchOutcome::Messages {
                chat,
                result: Err(err),
                ..
            } if err.is_not_found() => {
                debug!("{}", CoreError::StaleChatReference(chat));
            }
            FetchOutcome::Summaries { result: Err(err), .. }
            | FetchOutcome::Messages { result: Err(err), .. } => {
                debug!("session: refresh failed: {err}");
            }
        }
    }

    fn on_send_completed(&mut self, completion: SendCompletion) {
        let SendCompletion {
            local_id,
            chat,
            result,
        } = completion;
        match result {
            Ok(receipt) => {
                self.outbound
                    .mark_sent(local_id, receipt.id, self.tickets.latest());
                let mut refreshes = vec![Refresh::Summaries];
                if self.reconciler.active_chat() == Some(&chat) {
                    refreshes.push(Refresh::Messages(chat.clone()));
                }
                self.spawn_refreshes(refreshes);
            }
            Err(failure) => {
                let reason = FailureReason::from(&failure);
                self.outbound.mark_failed(local_id, reason.clone());
                if let ApiFailure::Rejected(err) = &failure {
                    self.emit(ClientEvent::Failure(CoreError::DeliveryRejected(
                        err.message.clone(),
                    )));
                }
                self.emit(ClientEvent::MessageFailed {
                    local_id,
                    chat: chat.clone(),
                    reason,
                });
            }
        }
        self.emit(ClientEvent::TimelineUpdated { chat });
    }

    fn on_call_update(&mut self, update: CallUpdate) {
        let Some(call) = &mut self.call else {
            return;
        };
        if call.handle.generation() != update.generation {
            debug!(generation = update.generation, "call: update from a finished call");
            return;
        }
        match update.progress {
            CallProgress::StateChanged(state) => {
                call.snapshot.state = state;
                let snapshot = call.snapshot.clone();
                self.emit(ClientEvent::CallStateChanged(snapshot));
            }
            CallProgress::Failed(err) => {
                warn!(room = %call.snapshot.room_id, "call: failed: {err}");
                if err.is_user_visible() {
                    self.emit(ClientEvent::Failure(err));
                }
            }
            CallProgress::Finished => {
                info!(room = %call.snapshot.room_id, "call: finished");
                self.call = None;
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let active_chat = self.reconciler.active_chat().cloned();
        let mut timeline: Vec<TimelineEntry> = self
            .reconciler
            .timeline()
            .iter()
            .cloned()
            .map(TimelineEntry::Delivered)
            .collect();
        let mut draft = String::new();
        if let Some(chat) = &active_chat {
            timeline.extend(
                self.outbound
                    .for_chat(chat)
                    .cloned()
                    .map(TimelineEntry::Pending),
            );
            draft = self.drafts.get(chat).cloned().unwrap_or_default();
        }
        SessionSnapshot {
            identity: self.session.identity.clone(),
            channel_state: self.channel_state,
            summaries: self.reconciler.summaries().to_vec(),
            active_chat,
            timeline,
            draft,
            call: self.call.as_ref().map(|call| call.snapshot.clone()),
            pending_invites: self.invites.iter().cloned().collect(),
        }
    }

    async fn teardown(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.shutdown().await;
        }
        if let Some(poller) = self.poller.take() {
            poller.shutdown().await;
        }
        if let Some(call) = self.call.take() {
            call.handle.shutdown().await;
        }
        self.lanes.close();
        self.invites.clear();
        self.channel_state = ChannelState::Closed;
        info!(identity = %self.session.identity, "session: logged out");
        self.emit(ClientEvent::LoggedOut);
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
