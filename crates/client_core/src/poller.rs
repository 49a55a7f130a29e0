use std::time::Duration;

use shared::domain::ChatRef;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval_at, timeout, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::reconciler::{FetchOutcome, Refresh, RefreshFetcher};

/// Periodic refresh that runs whether or not the event channel is up, so a
/// dead socket degrades to polling instead of a frozen view. A fetch that
/// outlives two periods is abandoned so the next tick still runs.
pub struct FallbackPoller {
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FallbackPoller {
    pub fn start(
        period: Duration,
        fetcher: RefreshFetcher,
        active_chat: watch::Receiver<Option<ChatRef>>,
        sink: mpsc::UnboundedSender<FetchOutcome>,
    ) -> Self {
        let stop = CancellationToken::new();
        let task = tokio::spawn(poll_loop(period, fetcher, active_chat, sink, stop.clone()));
        Self {
            stop,
            task: Some(task),
        }
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for FallbackPoller {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn poll_loop(
    period: Duration,
    fetcher: RefreshFetcher,
    active_chat: watch::Receiver<Option<ChatRef>>,
    sink: mpsc::UnboundedSender<FetchOutcome>,
    stop: CancellationToken,
) {
    let budget = period * 2;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let mut targets = vec![Refresh::Summaries];
        if let Some(chat) = active_chat.borrow().clone() {
            targets.push(Refresh::Messages(chat));
        }
        for target in targets {
            let outcome = tokio::select! {
                biased;
                _ = stop.cancelled() => return,
                outcome = timeout(budget, fetcher.fetch(target)) => match outcome {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        debug!("poll: refresh abandoned after {budget:?}");
                        continue;
                    }
                },
            };
            if !outcome.is_ok() {
                debug!("poll: refresh failed: {outcome:?}");
                continue;
            }
            if sink.send(outcome).is_err() {
                return;
            }
        }
    }
    debug!("poll: stopped");
}
