//! Relay connection for one call room. Unlike the event channel it never
//! reconnects: losing the room ends the call.

use std::sync::Arc;

use shared::{domain::RoomId, protocol::SignalingMessage};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::RealtimeEndpoints,
    error::TransportError,
    session::Session,
    transport::{redacted, WireConnection, WireConnector},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalNotice {
    /// The room socket is open and `join` has been sent.
    Opened,
    Message(SignalingMessage),
    /// The room was lost without a local `close`.
    Closed,
}

pub struct SignalingClient {
    room: RoomId,
    outbound: mpsc::UnboundedSender<SignalingMessage>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SignalingClient {
    /// Opens the room socket in the background. Messages passed to `send`
    /// before it opens are queued and flushed right after `join`.
    pub fn join(
        session: &Session,
        endpoints: &RealtimeEndpoints,
        room: RoomId,
        connector: Arc<dyn WireConnector>,
        sink: mpsc::UnboundedSender<SignalNotice>,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let url = endpoints.call_url(room.as_str(), session.credential.expose());
        let task = tokio::spawn(run_room(
            url,
            room.clone(),
            connector,
            outbound_rx,
            sink,
            stop.clone(),
        ));
        Self {
            room,
            outbound,
            stop,
            task: Some(task),
        }
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn send(&self, message: SignalingMessage) -> Result<(), TransportError> {
        self.outbound
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    pub fn close(&self) {
        self.stop.cancel();
    }

    /// Closes after flushing anything already queued, and waits for the socket task.
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn run_room(
    url: Url,
    room: RoomId,
    connector: Arc<dyn WireConnector>,
    mut outbound: mpsc::UnboundedReceiver<SignalingMessage>,
    sink: mpsc::UnboundedSender<SignalNotice>,
    stop: CancellationToken,
) {
    let opened = tokio::select! {
        biased;
        _ = stop.cancelled() => return,
        opened = connector.open(&url) => opened,
    };
    let mut connection = match opened {
        Ok(connection) => connection,
        Err(err) => {
            warn!(room = %room, "call: signaling connect failed: {err}");
            let _ = sink.send(SignalNotice::Closed);
            return;
        }
    };
    info!(room = %room, url = %redacted(&url), "call: signaling open");

    if !forward(&connection, &SignalingMessage::Join) {
        let _ = sink.send(SignalNotice::Closed);
        return;
    }
    let _ = sink.send(SignalNotice::Opened);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                while let Ok(message) = outbound.try_recv() {
                    forward(&connection, &message);
                }
                debug!(room = %room, "call: signaling closed locally");
                return;
            }
            message = outbound.recv() => {
                let Some(message) = message else {
                    return;
                };
                if !forward(&connection, &message) {
                    let _ = sink.send(SignalNotice::Closed);
                    return;
                }
            }
            frame = connection.inbound.recv() => {
                let Some(text) = frame else {
                    info!(room = %room, "call: signaling closed by peer");
                    let _ = sink.send(SignalNotice::Closed);
                    return;
                };
                if let Some(message) = parse_signal(&text) {
                    let _ = sink.send(SignalNotice::Message(message));
                }
            }
        }
    }
}

fn forward(connection: &WireConnection, message: &SignalingMessage) -> bool {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(err) => {
            warn!("call: failed to encode {} frame: {err}", message.kind());
            return true;
        }
    };
    connection.outbound.send(text).is_ok()
}

pub(crate) fn parse_signal(text: &str) -> Option<SignalingMessage> {
    match serde_json::from_str::<SignalingMessage>(text) {
        Ok(message) => Some(message),
        Err(err) => {
            debug!(len = text.len(), "call: dropping malformed signal: {err}");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/signaling_tests.rs"]
mod tests;
