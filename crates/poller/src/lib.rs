//! Client-side payment status polling.
//!
//! After a customer is sent to a gateway, the storefront keeps asking the
//! backend for the order status until it is final. [`Poller`] implements that
//! loop as a small state machine:
//!
//! `idle -> polling -> paid | failed | cancelled | timed_out`, plus `aborted`
//! when the caller's stop signal fires. Stopping only ends the local loop; no
//! cancellation is sent to the server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use model::{OrderStatus, PaymentStatus};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

mod http;

pub use http::HttpStatusSource;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("status request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("status endpoint answered {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("unexpected status payload: {0}")]
    Malformed(String),
}

/// Raw status as reported by the backend. Kept as strings so older labels
/// still classify.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusReport {
    pub order_status: String,
    #[serde(default)]
    pub payment_status: Option<String>,
}

#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch(&self, order_id: Uuid) -> Result<StatusReport, PollError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(3000),
            max_attempts: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling { attempt: u32 },
    Paid,
    Failed,
    Cancelled,
    TimedOut,
    Aborted,
}

impl PollState {
    pub fn is_final(self) -> bool {
        !matches!(self, PollState::Idle | PollState::Polling { .. })
    }
}

/// Final state and the number of fetches it took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub state: PollState,
    pub attempts: u32,
}

/// Maps a status report to a final poll state, `None` to keep polling.
pub fn classify(report: &StatusReport) -> Option<PollState> {
    let payment_paid = report
        .payment_status
        .as_deref()
        .and_then(|s| s.parse::<PaymentStatus>().ok())
        == Some(PaymentStatus::Paid);
    match report.order_status.parse::<OrderStatus>() {
        Ok(OrderStatus::Paid) => Some(PollState::Paid),
        Ok(OrderStatus::Failed) => Some(PollState::Failed),
        Ok(OrderStatus::Cancelled) => Some(PollState::Cancelled),
        _ if payment_paid => Some(PollState::Paid),
        _ => None,
    }
}

pub struct Poller<S> {
    source: S,
    policy: PollPolicy,
    state: watch::Sender<PollState>,
}

impl<S: StatusSource> Poller<S> {
    pub fn new(source: S, policy: PollPolicy) -> Self {
        let (state, _) = watch::channel(PollState::Idle);
        Self {
            source,
            policy,
            state,
        }
    }

    /// Follows state changes, e.g. to drive a spinner.
    pub fn subscribe(&self) -> watch::Receiver<PollState> {
        self.state.subscribe()
    }

    fn set(&self, state: PollState) {
        self.state.send_replace(state);
    }

    /// Polls `order_id` until a final state, the attempt cap, or `stop`.
    ///
    /// Fetch errors are logged and count as attempts.
    pub async fn run(&self, order_id: Uuid, stop: Arc<Notify>) -> PollReport {
        let stopped = stop.notified();
        tokio::pin!(stopped);
        // Like the storefront's setInterval: the first fetch waits one period.
        let period = self.policy.interval.max(Duration::from_millis(1));
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut attempts = 0;

        let state = loop {
            if attempts >= self.policy.max_attempts {
                break PollState::TimedOut;
            }
            tokio::select! {
                biased;
                _ = &mut stopped => break PollState::Aborted,
                _ = ticker.tick() => {}
            }

            attempts += 1;
            self.set(PollState::Polling { attempt: attempts });
            match self.source.fetch(order_id).await {
                Ok(report) => match classify(&report) {
                    Some(state) => break state,
                    None => debug!(%order_id, attempts, status = %report.order_status, "still pending"),
                },
                Err(e) => warn!(%order_id, attempts, error = %e, "status fetch failed"),
            }
        };

        self.set(state);
        info!(%order_id, ?state, attempts, "polling finished");
        PollReport { state, attempts }
    }
}
