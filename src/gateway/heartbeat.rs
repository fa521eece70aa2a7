use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Keep-alive bookkeeping for one connection.
///
/// The first beat lands after a random fraction of the interval so that many
/// shards reconnecting at once don't all beat in lockstep.
pub struct Heartbeat {
    interval: Duration,
    ticker: Interval,
    awaiting_ack: bool,
    sent_at: Option<Instant>,
    latency: Option<Duration>,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        let first = interval.mul_f64(rand::random::<f64>());
        Self::with_first_beat(interval, first)
    }

    pub fn with_first_beat(interval: Duration, first: Duration) -> Self {
        let mut ticker = interval_at(Instant::now() + first, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval,
            ticker,
            awaiting_ack: false,
            sent_at: None,
            latency: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Resolves when the next beat is due. Cancel-safe.
    pub async fn tick(&mut self) {
        self.ticker.tick().await;
    }

    /// The last beat never got an ACK, so the connection is probably dead.
    pub fn is_zombie(&self) -> bool {
        self.awaiting_ack
    }

    pub fn record_sent(&mut self) {
        self.awaiting_ack = true;
        self.sent_at = Some(Instant::now());
    }

    pub fn record_ack(&mut self) {
        self.awaiting_ack = false;
        if let Some(sent) = self.sent_at.take() {
            self.latency = Some(sent.elapsed());
        }
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }
}
