//! Heart-rate readings, the stability rule for single measurements, and the
//! handle that keeps continuous monitoring alive

use crate::client::ActiveSession;
use crate::codec::HeartRateControl;
use crate::error::BandError;
use crate::transport::{Characteristic, Link, Subscription};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One decoded heart-rate value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeartRateReading {
    /// 0-250; zero means the band has no skin contact yet
    pub bpm: u8,
    pub timestamp: DateTime<Utc>,
}

impl HeartRateReading {
    pub fn now(bpm: u8) -> Self {
        Self {
            bpm,
            timestamp: Utc::now(),
        }
    }
}

/// Decides when a single measurement has settled.
///
/// A measurement is final once `required` consecutive non-zero readings all
/// lie within `tolerance` bpm of each other. A zero reading empties the window.
#[derive(Debug, Clone)]
pub struct StabilityTracker {
    window: VecDeque<u8>,
    required: usize,
    tolerance: u8,
}

impl StabilityTracker {
    pub fn new(required: usize, tolerance: u8) -> Self {
        let required = required.max(1);
        Self {
            window: VecDeque::with_capacity(required),
            required,
            tolerance,
        }
    }

    /// Feed one reading; true when it completes a stable window
    pub fn push(&mut self, bpm: u8) -> bool {
        if bpm == 0 {
            self.window.clear();
            return false;
        }
        if self.window.len() == self.required {
            self.window.pop_front();
        }
        self.window.push_back(bpm);
        self.is_stable()
    }

    pub fn is_stable(&self) -> bool {
        if self.window.len() < self.required {
            return false;
        }
        let min = self.window.iter().min().copied().unwrap_or(0);
        let max = self.window.iter().max().copied().unwrap_or(0);
        max - min <= self.tolerance
    }
}

/// Running continuous heart-rate stream.
///
/// [`stop`](Self::stop) turns monitoring off on the band; dropping the handle
/// only stops local delivery.
pub struct HeartRateMonitor<L: Link> {
    session: Arc<ActiveSession<L>>,
    control: Characteristic,
    stopped: Arc<AtomicBool>,
    subscription: Mutex<Option<Subscription>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    command_timeout: Duration,
}

impl<L: Link> HeartRateMonitor<L> {
    pub(crate) fn start(
        session: Arc<ActiveSession<L>>,
        control: Characteristic,
        stopped: Arc<AtomicBool>,
        subscription: Subscription,
        keepalive_interval: Duration,
        command_timeout: Duration,
    ) -> Self {
        let keepalive = spawn_keepalive(session.clone(), control, keepalive_interval, command_timeout);
        info!(?keepalive_interval, "Continuous heart rate started");
        Self {
            session,
            control,
            stopped,
            subscription: Mutex::new(Some(subscription)),
            keepalive: Mutex::new(Some(keepalive)),
            command_timeout,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop delivery and switch continuous mode off. Later calls do nothing.
    pub async fn stop(&self) -> Result<(), BandError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(keepalive) = self.keepalive.lock().take() {
            keepalive.abort();
        }
        let result = self.switch_off().await;
        self.session.end_streaming();
        result
    }

    async fn switch_off(&self) -> Result<(), BandError> {
        let subscription = self.subscription.lock().take();
        let transport = self.session.transport();
        if let Some(subscription) = subscription {
            self.session
                .exchange("heart_rate_unsubscribe", self.command_timeout, transport.unsubscribe(subscription))
                .await?;
        }
        if !transport.is_connected() {
            debug!("Link already closed, continuous heart rate needs no switch-off");
            return Ok(());
        }
        self.session
            .exchange(
                "heart_rate_continuous_off",
                self.command_timeout,
                transport.write(&self.control, HeartRateControl::ContinuousOff.encode()),
            )
            .await?;
        info!("Continuous heart rate stopped");
        Ok(())
    }
}

impl<L: Link> Drop for HeartRateMonitor<L> {
    fn drop(&mut self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.session.end_streaming();
        }
        if let Some(keepalive) = self.keepalive.get_mut().take() {
            keepalive.abort();
        }
    }
}

/// The band drops continuous mode unless it is pinged periodically
fn spawn_keepalive<L: Link>(
    session: Arc<ActiveSession<L>>,
    control: Characteristic,
    interval: Duration,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        loop {
            ticker.tick().await;
            let transport = session.transport();
            if !transport.is_connected() {
                break;
            }
            let sent = session
                .exchange(
                    "heart_rate_keepalive",
                    timeout,
                    transport.write(&control, HeartRateControl::KeepAlive.encode()),
                )
                .await;
            if let Err(e) = sent {
                warn!(error = %e, "Heart-rate keep-alive failed");
            }
        }
    })
}
