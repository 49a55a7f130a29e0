use std::time::Duration;

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::debug;

use crate::event_channel::ChannelState;

pub const PING_FRAME: &str = "ping";

/// Periodic liveness probe for one open connection. Stops when dropped.
pub struct HeartbeatMonitor {
    task: JoinHandle<()>,
}

impl HeartbeatMonitor {
    pub fn start(
        outbound: mpsc::UnboundedSender<String>,
        period: Duration,
        state: watch::Receiver<ChannelState>,
    ) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if *state.borrow() != ChannelState::Open {
                    continue;
                }
                if outbound.send(PING_FRAME.to_string()).is_err() {
                    debug!("heartbeat: connection gone, stopping");
                    break;
                }
            }
        });
        Self { task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
