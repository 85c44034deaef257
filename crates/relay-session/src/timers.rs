//! Timers driving the relay: one-shot grace/idle timers and the keepalive.

use std::time::Duration;

use relay_core::{Outbound, ServerFrame};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

/// A cancellable one-shot timer.
///
/// Firing only delivers a generation number back to the owner; the owner
/// asks [`Timer::fired`] whether that generation is still current, so a fire
/// racing a cancel is dropped.
#[derive(Debug, Default)]
pub(crate) struct Timer {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl Timer {
    /// Arm the timer, replacing any pending fire.
    pub(crate) fn arm<F>(&mut self, after: Duration, fire: F)
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel();
        let generation = self.generation;
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            fire(generation);
        }));
    }

    /// Cancel a pending fire. Returns true if one was pending.
    pub(crate) fn cancel(&mut self) -> bool {
        self.generation = self.generation.wrapping_add(1);
        self.task.take().is_some_and(|task| {
            task.abort();
            true
        })
    }

    pub(crate) const fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    /// Accept a fire for `generation`. False if it was cancelled or re-armed.
    pub(crate) fn fired(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.task.is_none() {
            return false;
        }
        self.task = None;
        self.generation = self.generation.wrapping_add(1);
        true
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Send `ping` to one client every `interval` until its channel closes.
pub(crate) fn spawn_keepalive(
    interval: Duration,
    outbound: mpsc::UnboundedSender<Outbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ping = match ServerFrame::Ping.to_text() {
            Ok(ping) => ping,
            Err(e) => {
                tracing::error!("Failed to serialize ping frame: {e}");
                return;
            }
        };
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if outbound.send(Outbound::Text(ping.clone())).is_err() {
                break;
            }
        }
    })
}
