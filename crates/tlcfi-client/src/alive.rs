//! # Alive Supervision
//!
//! Two watchdogs per session.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  SEND TIMER (every alive_send_interval)                                │
//! │  ──────────────────────────────────────                                │
//! │  connected && systems_alive?  ──no──►  skip                            │
//! │        │ yes                                                            │
//! │        ▼                                                                │
//! │  Alive{ticks,time} ──► echo equal? ──yes──► failures = 0               │
//! │                            │ no / error                                 │
//! │                            ▼                                            │
//! │                       failures += 1  ──(> 2)──► stop, SendTimeout      │
//! │                                                                         │
//! │  RECEIVE TIMER (alive_receive_timeout)                                 │
//! │  ─────────────────────────────────────                                 │
//! │  every inbound Alive restarts the window; if it runs out:              │
//! │  stop, ReceiveTimeout                                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use tlcfi_core::TicksClock;
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::cancel::CancelScope;
use crate::config::TimingConfig;
use crate::protocol::{current_time_millis, AliveObject};
use crate::rpc::TlcProxy;
use crate::session::SessionFlags;

/// Consecutive send failures tolerated before giving up.
const MAX_SEND_FAILURES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliveEvent {
    SendTimeout,
    ReceiveTimeout,
}

/// Handle to the running watchdogs. Dropping it does not stop them.
#[derive(Debug, Clone)]
pub struct AliveHandle {
    feed: Arc<Notify>,
    scope: CancelScope,
}

impl AliveHandle {
    /// Restarts the receive window; call on every inbound Alive.
    pub fn feed(&self) {
        self.feed.notify_one();
    }

    pub fn stop(&self) {
        self.scope.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.scope.is_cancelled()
    }
}

/// Starts both watchdogs under `scope`.
pub fn spawn(
    proxy: TlcProxy,
    clock: Arc<TicksClock>,
    flags: Arc<SessionFlags>,
    timing: &TimingConfig,
    scope: CancelScope,
    events: mpsc::Sender<AliveEvent>,
) -> AliveHandle {
    let feed = Arc::new(Notify::new());

    tokio::spawn(send_loop(
        proxy,
        clock,
        flags,
        timing.alive_send_interval(),
        scope.clone(),
        events.clone(),
    ));
    tokio::spawn(receive_loop(
        feed.clone(),
        timing.alive_receive_timeout(),
        scope.clone(),
        events,
    ));

    AliveHandle { feed, scope }
}

async fn send_loop(
    proxy: TlcProxy,
    clock: Arc<TicksClock>,
    flags: Arc<SessionFlags>,
    interval: Duration,
    scope: CancelScope,
    events: mpsc::Sender<AliveEvent>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = scope.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if !proxy.is_connected() || !flags.systems_alive() {
            continue;
        }

        let alive = AliveObject {
            ticks: clock.ticks(),
            time: current_time_millis(),
        };
        match scope.run(proxy.alive(&alive)).await {
            Ok(echo) if echo == alive => {
                failures = 0;
            }
            Ok(echo) => {
                failures += 1;
                warn!(sent = ?alive, received = ?echo, failures, "Alive echo does not match");
            }
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                failures += 1;
                warn!(error = %e, failures, "Alive not answered");
            }
        }

        if failures > MAX_SEND_FAILURES {
            error!(failures, "TLC stopped answering Alive");
            scope.cancel();
            let _ = events.send(AliveEvent::SendTimeout).await;
            return;
        }
    }
}

async fn receive_loop(
    feed: Arc<Notify>,
    timeout: Duration,
    scope: CancelScope,
    events: mpsc::Sender<AliveEvent>,
) {
    loop {
        tokio::select! {
            _ = scope.cancelled() => return,
            _ = feed.notified() => {
                debug!("Alive received");
            }
            _ = tokio::time::sleep(timeout) => {
                error!(timeout_ms = timeout.as_millis() as u64, "No Alive received from TLC");
                scope.cancel();
                let _ = events.send(AliveEvent::ReceiveTimeout).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockChannel;
    use crate::ClientError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn start(
        channel: Arc<MockChannel>,
        flags: Arc<SessionFlags>,
    ) -> (AliveHandle, mpsc::Receiver<AliveEvent>) {
        let timing = TimingConfig::default();
        let (tx, rx) = mpsc::channel(4);
        let proxy = TlcProxy::new(channel, timing.clone());
        let handle = spawn(
            proxy,
            Arc::new(TicksClock::manual(0)),
            flags,
            &timing,
            CancelScope::new(),
            tx,
        );
        (handle, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_send_failures_raise_timeout() {
        let (handle, mut events) = start(MockChannel::silent(), Arc::new(SessionFlags::default()));
        // Keep the receive side happy.
        let feeder = handle.clone();
        tokio::spawn(async move {
            loop {
                feeder.feed();
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });

        let started = tokio::time::Instant::now();
        assert_eq!(events.recv().await, Some(AliveEvent::SendTimeout));
        assert_eq!(started.elapsed(), Duration::from_millis(6000));
        assert!(!handle.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_counter_resets_on_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        // Fails twice, answers once, then keeps failing.
        let channel = MockChannel::new(move |_, params| {
            match counter.fetch_add(1, Ordering::SeqCst) {
                2 => Ok(params.clone()),
                _ => Err(ClientError::Timeout(1)),
            }
        });
        let (handle, mut events) = start(channel, Arc::new(SessionFlags::default()));
        let feeder = handle.clone();
        tokio::spawn(async move {
            loop {
                feeder.feed();
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });

        assert_eq!(events.recv().await, Some(AliveEvent::SendTimeout));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_skipped_while_systems_not_alive() {
        let channel = MockChannel::echo();
        let flags = Arc::new(SessionFlags::default());
        flags.set_systems_alive(false);
        let (handle, _events) = start(channel.clone(), flags.clone());

        tokio::time::sleep(Duration::from_millis(4500)).await;
        handle.feed();
        assert!(channel.calls_of("Alive").is_empty());

        flags.set_systems_alive(true);
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(channel.calls_of("Alive").len(), 1);
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_timeout_without_alive() {
        let (handle, mut events) = start(MockChannel::echo(), Arc::new(SessionFlags::default()));
        let started = tokio::time::Instant::now();
        assert_eq!(events.recv().await, Some(AliveEvent::ReceiveTimeout));
        assert_eq!(started.elapsed(), Duration::from_millis(6000));
        assert!(!handle.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_restarts_receive_window() {
        let (handle, mut events) = start(MockChannel::echo(), Arc::new(SessionFlags::default()));
        tokio::time::sleep(Duration::from_millis(5000)).await;
        handle.feed();
        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert!(events.try_recv().is_err());
        assert!(handle.is_running());

        assert_eq!(events.recv().await, Some(AliveEvent::ReceiveTimeout));
    }
}
