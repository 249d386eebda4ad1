use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::{ChatId, WagerId};

/// A countdown that ran out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiry {
    pub wager: WagerId,
    pub chat: ChatId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerInfo {
    pub wager: WagerId,
    pub chat: ChatId,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

struct ArmedTimer {
    info: TimerInfo,
    generation: u64,
    handle: JoinHandle<()>,
}

/// One countdown per open wager, keyed by wager id. A countdown that runs out
/// removes itself and emits a single [`Expiry`] on the channel handed out by
/// [`ExpiryTimers::new`].
pub struct ExpiryTimers {
    timers: Arc<DashMap<WagerId, ArmedTimer>>,
    events: mpsc::UnboundedSender<Expiry>,
    runtime: Handle,
    generation: AtomicU64,
}

impl ExpiryTimers {
    pub fn new(runtime: Handle) -> (Self, mpsc::UnboundedReceiver<Expiry>) {
        let (events, rx) = mpsc::unbounded_channel();
        let timers = Self {
            timers: Arc::new(DashMap::new()),
            events,
            runtime,
            generation: AtomicU64::new(0),
        };
        (timers, rx)
    }

    /// Arms a countdown for `wager`, replacing any existing one.
    pub fn arm(&self, wager: WagerId, chat: ChatId, duration: Duration) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (armed_tx, armed_rx) = oneshot::channel();

        let handle = self.runtime.spawn(countdown(
            Arc::clone(&self.timers),
            self.events.clone(),
            Expiry {
                wager: wager.clone(),
                chat,
            },
            generation,
            Instant::now() + duration,
            armed_rx,
        ));

        let created_at = Utc::now();
        let deadline = chrono::Duration::from_std(duration)
            .map(|d| created_at + d)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let timer = ArmedTimer {
            info: TimerInfo {
                wager: wager.clone(),
                chat,
                created_at,
                deadline,
            },
            generation,
            handle,
        };

        if let Some(previous) = self.timers.insert(wager.clone(), timer) {
            previous.handle.abort();
        }
        // The countdown only starts once its registry entry is visible.
        let _ = armed_tx.send(());

        debug!(wager = %wager, chat, ?duration, "expiry timer armed");
    }

    /// Cancels the countdown for `wager`. Returns whether one was armed.
    pub fn disarm(&self, wager: &WagerId) -> bool {
        match self.timers.remove(wager) {
            Some((_, timer)) => {
                timer.handle.abort();
                debug!(wager = %wager, "expiry timer disarmed");
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, wager: &WagerId) -> bool {
        self.timers.contains_key(wager)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn armed_wagers(&self) -> Vec<WagerId> {
        self.timers.iter().map(|t| t.key().clone()).collect()
    }

    /// Snapshot of armed countdowns, soonest deadline first.
    pub fn active(&self) -> Vec<TimerInfo> {
        let mut active: Vec<TimerInfo> = self.timers.iter().map(|t| t.info.clone()).collect();
        active.sort_by(|a, b| a.deadline.cmp(&b.deadline));
        active
    }

    /// Disarms every countdown.
    pub fn shutdown(&self) {
        for wager in self.armed_wagers() {
            self.disarm(&wager);
        }
    }
}

async fn countdown(
    timers: Arc<DashMap<WagerId, ArmedTimer>>,
    events: mpsc::UnboundedSender<Expiry>,
    expiry: Expiry,
    generation: u64,
    deadline: Instant,
    armed: oneshot::Receiver<()>,
) {
    if armed.await.is_err() {
        return;
    }
    tokio::time::sleep_until(deadline).await;

    // A re-arm or disarm that raced with the deadline wins.
    if timers
        .remove_if(&expiry.wager, |_, t| t.generation == generation)
        .is_some()
    {
        let _ = events.send(expiry);
    }
}
