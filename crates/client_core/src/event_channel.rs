//! The per-session event socket: one reconnecting connection that turns
//! server pushes into [`ChannelNotice`]s for a single consumer.

use std::{sync::Arc, time::Duration};

use shared::protocol::ServerEvent;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    backoff::{BackoffPolicy, ReconnectCounter},
    config::{ClientSettings, RealtimeEndpoints},
    heartbeat::HeartbeatMonitor,
    session::Session,
    transport::{redacted, WireConnection, WireConnector},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Closed,
    Connecting,
    Open,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelNotice {
    StateChanged {
        state: ChannelState,
        attempt: u32,
        retry_in: Option<Duration>,
    },
    Event(ServerEvent),
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelSettings {
    pub backoff: BackoffPolicy,
    pub heartbeat_interval: Duration,
}

impl From<&ClientSettings> for ChannelSettings {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            backoff: settings.backoff(),
            heartbeat_interval: settings.heartbeat_interval(),
        }
    }
}

pub struct EventChannelManager {
    state: watch::Receiver<ChannelState>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl EventChannelManager {
    /// Starts connecting immediately. Every notice goes to `sink`, in receipt order.
    pub fn connect(
        session: &Session,
        endpoints: &RealtimeEndpoints,
        connector: Arc<dyn WireConnector>,
        settings: ChannelSettings,
        sink: mpsc::UnboundedSender<ChannelNotice>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ChannelState::Closed);
        let stop = CancellationToken::new();
        let driver = ChannelDriver {
            url: endpoints.events_url(session.credential.expose()),
            connector,
            settings,
            sink,
            state_tx,
            stop: stop.clone(),
            counter: ReconnectCounter::new(settings.backoff.attempt_cap()),
        };
        let task = tokio::spawn(driver.run());
        Self {
            state: state_rx,
            stop,
            task: Some(task),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Clean shutdown. Cancels a pending reconnect timer and suppresses any later one.
    pub fn close(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Closes and waits for the connection task to finish.
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for EventChannelManager {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

struct ChannelDriver {
    url: Url,
    connector: Arc<dyn WireConnector>,
    settings: ChannelSettings,
    sink: mpsc::UnboundedSender<ChannelNotice>,
    state_tx: watch::Sender<ChannelState>,
    stop: CancellationToken,
    counter: ReconnectCounter,
}

impl ChannelDriver {
    async fn run(mut self) {
        self.set_state(ChannelState::Connecting, None);
        loop {
            let opened = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                opened = self.connector.open(&self.url) => opened,
            };
            match opened {
                Ok(connection) => self.pump(connection).await,
                Err(err) => warn!(
                    attempt = self.counter.attempt(),
                    "events: connect failed: {err}"
                ),
            }
            if self.stop.is_cancelled() {
                break;
            }

            let attempt = self.counter.bump();
            let delay = self.settings.backoff.delay_for_attempt(attempt);
            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                url = %redacted(&self.url),
                "events: scheduling reconnect"
            );
            self.set_state(ChannelState::Reconnecting, Some(delay));
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            if self.stop.is_cancelled() {
                break;
            }
        }
        self.set_state(ChannelState::Closed, None);
        debug!("events: channel task finished");
    }

    /// Runs one open connection until the peer closes it or the manager stops.
    async fn pump(&mut self, mut connection: WireConnection) {
        self.counter.reset();
        self.set_state(ChannelState::Open, None);
        info!(url = %redacted(&self.url), "events: channel open");
        let _heartbeat = HeartbeatMonitor::start(
            connection.outbound.clone(),
            self.settings.heartbeat_interval,
            self.state_tx.subscribe(),
        );

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return,
                frame = connection.inbound.recv() => frame,
            };
            let Some(text) = frame else {
                warn!("events: channel closed unexpectedly");
                return;
            };
            let Some(event) = parse_event(&text) else {
                continue;
            };
            if self.sink.send(ChannelNotice::Event(event)).is_err() {
                debug!("events: consumer gone, stopping channel");
                self.stop.cancel();
                return;
            }
        }
    }

    fn set_state(&self, state: ChannelState, retry_in: Option<Duration>) {
        self.state_tx.send_replace(state);
        let _ = self.sink.send(ChannelNotice::StateChanged {
            state,
            attempt: self.counter.attempt(),
            retry_in,
        });
    }
}

/// Malformed payloads are dropped; the poller covers anything they carried.
pub(crate) fn parse_event(text: &str) -> Option<ServerEvent> {
    match serde_json::from_str::<ServerEvent>(text) {
        Ok(event) => Some(event),
        Err(err) => {
            debug!(len = text.len(), "events: dropping malformed payload: {err}");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/event_channel_tests.rs"]
mod tests;
