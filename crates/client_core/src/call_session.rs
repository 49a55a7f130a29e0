//! One voice call: the negotiation state machine and the task that drives it.

use std::{sync::Arc, time::Duration};

use peer_negotiation::{NegotiatorEvent, NegotiatorFactory, PeerNegotiator, PeerOptions};
use shared::{
    domain::RoomId,
    protocol::{SessionDescription, SignalingMessage},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::RealtimeEndpoints,
    error::{CoreError, TransportError},
    http_api::ChatApi,
    session::Session,
    signaling::{SignalNotice, SignalingClient},
    transport::WireConnector,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallRole {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Idle,
    Inviting,
    AwaitingAnswer,
    Negotiating,
    Active,
    Ending,
    Ended,
}

impl CallState {
    fn rank(self) -> u8 {
        match self {
            CallState::Idle => 0,
            CallState::Inviting => 1,
            CallState::AwaitingAnswer => 2,
            CallState::Negotiating => 3,
            CallState::Active => 4,
            CallState::Ending => 5,
            CallState::Ended => 6,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == CallState::Ended
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("microphone unavailable: {0}")]
    MediaUnavailable(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

impl From<CallError> for CoreError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::MediaUnavailable(reason) => CoreError::MediaUnavailable(reason),
            CallError::Negotiation(reason) => CoreError::Transport(TransportError::Request(reason)),
        }
    }
}

/// State of a single call. Media is released on every exit path, including drop.
pub struct CallSession {
    room_id: RoomId,
    role: CallRole,
    remote_peer: String,
    state: CallState,
    negotiator: Arc<dyn PeerNegotiator>,
    offer_sent: bool,
    media_acquired: bool,
    released: bool,
    last_remote_description: Option<SessionDescription>,
}

impl CallSession {
    /// Local start: the invite goes out and the room is joined.
    pub fn outgoing(
        room_id: RoomId,
        remote_peer: impl Into<String>,
        negotiator: Arc<dyn PeerNegotiator>,
    ) -> Self {
        Self::new(
            room_id,
            CallRole::Caller,
            remote_peer.into(),
            CallState::Inviting,
            negotiator,
        )
    }

    /// Accepted invite: the callee joins the room and waits for an offer.
    pub fn incoming(
        room_id: RoomId,
        remote_peer: impl Into<String>,
        negotiator: Arc<dyn PeerNegotiator>,
    ) -> Self {
        Self::new(
            room_id,
            CallRole::Callee,
            remote_peer.into(),
            CallState::Negotiating,
            negotiator,
        )
    }

    fn new(
        room_id: RoomId,
        role: CallRole,
        remote_peer: String,
        state: CallState,
        negotiator: Arc<dyn PeerNegotiator>,
    ) -> Self {
        Self {
            room_id,
            role,
            remote_peer,
            state,
            negotiator,
            offer_sent: false,
            media_acquired: false,
            released: false,
            last_remote_description: None,
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn remote_peer(&self) -> &str {
        &self.remote_peer
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn last_remote_description(&self) -> Option<&SessionDescription> {
        self.last_remote_description.as_ref()
    }

    /// Applies one relayed frame and returns the frames to send back.
    pub async fn on_signal(
        &mut self,
        message: SignalingMessage,
    ) -> Result<Vec<SignalingMessage>, CallError> {
        if self.state.is_terminal() {
            return Ok(Vec::new());
        }
        match message {
            SignalingMessage::Join => {
                if self.role != CallRole::Caller || self.offer_sent {
                    return Ok(Vec::new());
                }
                self.acquire_media().await?;
                let offer = self
                    .negotiator
                    .create_offer()
                    .await
                    .map_err(|err| CallError::Negotiation(err.to_string()))?;
                self.offer_sent = true;
                self.advance(CallState::AwaitingAnswer);
                info!(room = %self.room_id, "call: offer sent");
                Ok(vec![SignalingMessage::Offer { sdp: offer }])
            }
            SignalingMessage::Offer { sdp } => {
                if self.role != CallRole::Callee {
                    debug!(room = %self.room_id, "call: ignoring offer as caller");
                    return Ok(Vec::new());
                }
                self.acquire_media().await?;
                let answer = self
                    .negotiator
                    .accept_offer(sdp.clone())
                    .await
                    .map_err(|err| CallError::Negotiation(err.to_string()))?;
                self.last_remote_description = Some(sdp);
                self.advance(CallState::Negotiating);
                info!(room = %self.room_id, "call: answer sent");
                Ok(vec![SignalingMessage::Answer { sdp: answer }])
            }
            SignalingMessage::Answer { sdp } => {
                if self.role != CallRole::Caller || self.state != CallState::AwaitingAnswer {
                    debug!(room = %self.room_id, state = ?self.state, "call: ignoring answer");
                    return Ok(Vec::new());
                }
                self.negotiator
                    .apply_answer(sdp.clone())
                    .await
                    .map_err(|err| CallError::Negotiation(err.to_string()))?;
                self.last_remote_description = Some(sdp);
                self.advance(CallState::Active);
                Ok(Vec::new())
            }
            SignalingMessage::IceCandidate { candidate } => {
                if let Err(err) = self.negotiator.add_remote_candidate(candidate).await {
                    warn!(room = %self.room_id, "call: ignoring remote candidate: {err}");
                }
                Ok(Vec::new())
            }
            SignalingMessage::Hangup => {
                info!(room = %self.room_id, "call: remote hangup");
                self.finish();
                Ok(Vec::new())
            }
        }
    }

    /// First remote track. For the callee this is the moment the call is up.
    pub fn on_remote_media(&mut self) {
        if self.role == CallRole::Callee && self.state == CallState::Negotiating {
            self.advance(CallState::Active);
        }
    }

    /// Ends the call from this side; returns the `hangup` frame for the peer.
    pub fn hangup_local(&mut self) -> Vec<SignalingMessage> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        self.finish();
        vec![SignalingMessage::Hangup]
    }

    /// Ends the call without telling the peer, e.g. after the room was lost.
    pub fn abort(&mut self) {
        if !self.state.is_terminal() {
            self.finish();
        }
    }

    async fn acquire_media(&mut self) -> Result<(), CallError> {
        if self.media_acquired {
            return Ok(());
        }
        self.negotiator
            .acquire_local_audio()
            .await
            .map_err(|err| CallError::MediaUnavailable(err.to_string()))?;
        self.media_acquired = true;
        Ok(())
    }

    fn advance(&mut self, next: CallState) -> bool {
        if next == CallState::Ended || next.rank() > self.state.rank() {
            debug!(room = %self.room_id, from = ?self.state, to = ?next, "call: state change");
            self.state = next;
            true
        } else {
            false
        }
    }

    fn finish(&mut self) {
        self.advance(CallState::Ending);
        self.release_media();
        self.advance(CallState::Ended);
    }

    fn release_media(&mut self) {
        if !self.released {
            self.negotiator.release();
            self.released = true;
        }
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.release_media();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallProgress {
    StateChanged(CallState),
    Failed(CoreError),
    Finished,
}

/// Report from a call driver, tagged with the generation of the call it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallUpdate {
    pub generation: u64,
    pub progress: CallProgress,
}

pub struct CallSetup {
    pub generation: u64,
    pub room_id: RoomId,
    pub role: CallRole,
    pub remote_peer: String,
    pub session: Session,
    pub endpoints: RealtimeEndpoints,
    pub connector: Arc<dyn WireConnector>,
    pub negotiators: Arc<dyn NegotiatorFactory>,
    pub peer_options: PeerOptions,
    pub api: Arc<dyn ChatApi>,
}

/// How long `CallHandle::shutdown` waits for a clean hangup before aborting the driver.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Owner's side of a running call driver. Dropping it hangs up.
pub struct CallHandle {
    generation: u64,
    hangup: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl CallHandle {
    pub fn spawn(setup: CallSetup, updates: mpsc::UnboundedSender<CallUpdate>) -> Self {
        let generation = setup.generation;
        let (hangup, hangup_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(drive_call(setup, hangup_rx, updates));
        Self {
            generation,
            hangup,
            task,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn hangup(&self) {
        let _ = self.hangup.send(());
    }

    /// Hangs up and waits until media is released and the room is closed.
    /// A driver that does not wind down within the grace period is aborted;
    /// dropping its `CallSession` still releases media.
    pub async fn shutdown(mut self) {
        self.hangup();
        if timeout(SHUTDOWN_GRACE, &mut self.task).await.is_err() {
            warn!(generation = self.generation, "call: driver did not stop, aborting");
            self.task.abort();
            let _ = (&mut self.task).await;
        }
    }
}

struct Reporter {
    generation: u64,
    updates: mpsc::UnboundedSender<CallUpdate>,
}

impl Reporter {
    fn send(&self, progress: CallProgress) {
        let _ = self.updates.send(CallUpdate {
            generation: self.generation,
            progress,
        });
    }
}

async fn drive_call(
    setup: CallSetup,
    mut hangup: mpsc::UnboundedReceiver<()>,
    updates: mpsc::UnboundedSender<CallUpdate>,
) {
    let reporter = Reporter {
        generation: setup.generation,
        updates,
    };
    run_call(setup, &mut hangup, &reporter).await;
    reporter.send(CallProgress::StateChanged(CallState::Ended));
    reporter.send(CallProgress::Finished);
}

async fn run_call(
    setup: CallSetup,
    hangup: &mut mpsc::UnboundedReceiver<()>,
    reporter: &Reporter,
) {
    let created = tokio::select! {
        biased;
        _ = hangup.recv() => {
            info!(room = %setup.room_id, "call: hung up before media was ready");
            return;
        }
        created = setup.negotiators.create(setup.peer_options.clone()) => created,
    };
    let negotiator = match created {
        Ok(negotiator) => negotiator,
        Err(err) => {
            warn!(room = %setup.room_id, "call: no media backend: {err}");
            reporter.send(CallProgress::Failed(CoreError::MediaUnavailable(err.to_string())));
            return;
        }
    };
    let mut negotiator_events = negotiator.subscribe_events();
    let mut call = match setup.role {
        CallRole::Caller => {
            CallSession::outgoing(setup.room_id.clone(), setup.remote_peer.clone(), negotiator)
        }
        CallRole::Callee => {
            CallSession::incoming(setup.room_id.clone(), setup.remote_peer.clone(), negotiator)
        }
    };
    reporter.send(CallProgress::StateChanged(call.state()));

    if call.role() == CallRole::Caller {
        let invited = tokio::select! {
            biased;
            _ = hangup.recv() => {
                call.abort();
                info!(room = %setup.room_id, "call: hung up while inviting");
                return;
            }
            invited = setup.api.invite_call(&setup.session.credential, &setup.remote_peer) => invited,
        };
        if let Err(err) = invited {
            warn!(room = %setup.room_id, "call: invite failed: {err}");
            call.abort();
            reporter.send(CallProgress::Failed(CoreError::Transport(TransportError::Request(
                err.to_string(),
            ))));
            return;
        }
    }

    let (signal_tx, mut signals) = mpsc::unbounded_channel();
    let signaling = SignalingClient::join(
        &setup.session,
        &setup.endpoints,
        setup.room_id.clone(),
        Arc::clone(&setup.connector),
        signal_tx,
    );
    info!(room = %setup.room_id, role = ?call.role(), peer = %call.remote_peer(), "call: joining room");

    let mut events_open = true;
    loop {
        let before = call.state();
        tokio::select! {
            _ = hangup.recv() => {
                send_all(&signaling, call.hangup_local());
            }
            notice = signals.recv() => match notice {
                Some(SignalNotice::Opened) => {}
                Some(SignalNotice::Message(message)) => {
                    // Media capture and SDP work can stall; a hangup still wins.
                    let step = tokio::select! {
                        biased;
                        _ = hangup.recv() => None,
                        step = call.on_signal(message) => Some(step),
                    };
                    match step {
                        None => send_all(&signaling, call.hangup_local()),
                        Some(Ok(outbound)) => send_all(&signaling, outbound),
                        Some(Err(err)) => {
                            warn!(room = %call.room_id(), "call: aborting: {err}");
                            send_all(&signaling, call.hangup_local());
                            reporter.send(CallProgress::Failed(err.into()));
                        }
                    }
                }
                Some(SignalNotice::Closed) | None => {
                    if !call.state().is_terminal() {
                        warn!(room = %call.room_id(), "call: signaling lost");
                        call.abort();
                        reporter.send(CallProgress::Failed(CoreError::Transport(TransportError::Closed)));
                    }
                }
            },
            event = negotiator_events.recv(), if events_open => match event {
                Ok(NegotiatorEvent::LocalCandidate(candidate)) => {
                    send_all(&signaling, vec![SignalingMessage::IceCandidate { candidate }]);
                }
                Ok(NegotiatorEvent::RemoteMediaStarted) => call.on_remote_media(),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "call: negotiator events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => events_open = false,
            },
        }

        let after = call.state();
        if after != before && !after.is_terminal() {
            reporter.send(CallProgress::StateChanged(after));
        }
        if after.is_terminal() {
            break;
        }
    }

    reporter.send(CallProgress::StateChanged(CallState::Ending));
    signaling.shutdown().await;
    info!(room = %call.room_id(), "call: ended");
}

fn send_all(signaling: &SignalingClient, messages: Vec<SignalingMessage>) {
    for message in messages {
        let kind = message.kind();
        if signaling.send(message).is_err() {
            debug!(kind, "call: signaling already closed");
        }
    }
}

#[cfg(test)]
#[path = "tests/call_session_tests.rs"]
mod tests;
