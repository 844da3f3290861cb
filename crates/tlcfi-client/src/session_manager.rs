//! # Session Manager
//!
//! Owns the connect/reconnect loop and the single active [`ConnectionSession`].
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  get_new_session()                                                      │
//! │                                                                         │
//! │  active && connected ──► refuse (None)                                 │
//! │  active && !connected ──► dispose, None (caller retries)               │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  wait until 42 s after the last successful registration (1 s slices)   │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  ┌──────────────────────────────────────────────────────┐              │
//! │  │ wait rest of timeout ─► tries += 1 ─► start(timeout) │◄── error ─┐  │
//! │  └───────────────────────────┬──────────────────────────┘           │  │
//! │                              │ connected                 ───────────┘  │
//! │                              ▼                                          │
//! │                         Some(session)                                   │
//! │                                                                         │
//! │  Alive timeouts and ControlState=Error close the session; Ended        │
//! │  disposes it and frees the slot for the next call.                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use tlcfi_core::MIN_REGISTER_INTERVAL_SECS;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::CancelScope;
use crate::config::TimingConfig;
use crate::registry::Registry;
use crate::rpc::Connector;
use crate::session::{ConnectionSession, SessionEvent};

const MIN_REGISTER_INTERVAL: Duration = Duration::from_secs(MIN_REGISTER_INTERVAL_SECS);
const WAIT_SLICE: Duration = Duration::from_secs(1);
const INITIAL_TIMEOUT: Duration = Duration::from_millis(1000);

// =============================================================================
// Backoff
// =============================================================================

/// Step function over the number of connection tries.
#[derive(Debug, Clone, Default)]
pub struct StepBackoff {
    tries: u32,
}

impl StepBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }

    /// Connect timeout (and retry interval) for the given try.
    pub fn timeout_for(tries: u32) -> Duration {
        let millis = match tries {
            0..=4 => 1000,
            5..=9 => 2000,
            10..=20 => 5000,
            21..=24 => 30000,
            _ => 60000,
        };
        Duration::from_millis(millis)
    }
}

impl Backoff for StepBackoff {
    fn reset(&mut self) {
        self.tries = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.tries = self.tries.saturating_add(1);
        Some(Self::timeout_for(self.tries))
    }
}

// =============================================================================
// Session Source
// =============================================================================

/// Hands out connected sessions to the client's reconnect loop.
#[async_trait]
pub trait SessionSource: Send + Sync {
    /// Returns a connected session, or `None` when the caller should retry
    /// (or stop, if its scope was cancelled).
    async fn get_new_session(
        &self,
        registry: Arc<Registry>,
        scope: &CancelScope,
    ) -> Option<Arc<ConnectionSession>>;

    /// Called after a fully configured session; restarts the backoff and the
    /// registration interval.
    fn reset_connection_retry_timers(&self);

    /// Closes and disposes the active session, if any.
    async fn end_active_session(&self, expected: bool);

    fn dispose_active_session(&self);

    /// Connection tries since the last reset.
    fn connection_tries(&self) -> u32;
}

// =============================================================================
// Session Manager
// =============================================================================

struct ManagerInner {
    active: Option<Arc<ConnectionSession>>,
    connecting: bool,
    backoff: StepBackoff,
    timeout: Duration,
    last_register: Option<Instant>,
}

type SharedInner = Arc<Mutex<ManagerInner>>;

fn lock(inner: &SharedInner) -> MutexGuard<'_, ManagerInner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

/// Clears the connecting flag however `get_new_session` returns.
struct ConnectingGuard(SharedInner);

impl Drop for ConnectingGuard {
    fn drop(&mut self) {
        lock(&self.0).connecting = false;
    }
}

pub struct SessionManager {
    address: String,
    connector: Arc<dyn Connector>,
    timing: TimingConfig,
    inner: SharedInner,
}

impl SessionManager {
    pub fn new(address: impl Into<String>, connector: Arc<dyn Connector>, timing: TimingConfig) -> Self {
        SessionManager {
            address: address.into(),
            connector,
            timing,
            inner: Arc::new(Mutex::new(ManagerInner {
                active: None,
                connecting: false,
                backoff: StepBackoff::new(),
                timeout: INITIAL_TIMEOUT,
                last_register: None,
            })),
        }
    }

    pub fn active_session(&self) -> Option<Arc<ConnectionSession>> {
        lock(&self.inner).active.clone()
    }

    /// Time still to wait before the next registration is allowed.
    fn register_wait(&self) -> Duration {
        lock(&self.inner)
            .last_register
            .map(|at| MIN_REGISTER_INTERVAL.saturating_sub(at.elapsed()))
            .unwrap_or_default()
    }

    fn discard(&self, session: &Arc<ConnectionSession>) {
        {
            let mut inner = lock(&self.inner);
            if inner.active.as_ref().map_or(false, |a| Arc::ptr_eq(a, session)) {
                inner.active = None;
            }
        }
        session.dispose();
    }

    fn supervise(&self, session: &Arc<ConnectionSession>) {
        let mut events = session.subscribe_events();
        let weak: Weak<ConnectionSession> = Arc::downgrade(session);
        let inner = self.inner.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(
                        SessionEvent::SendAliveTimeout
                        | SessionEvent::ReceiveAliveTimeout
                        | SessionEvent::ControlStateError,
                    ) => {
                        if let Some(session) = weak.upgrade() {
                            session.close(false).await;
                        }
                    }
                    Ok(SessionEvent::Ended { expected }) => {
                        debug!(expected, "Releasing ended session");
                        if let Some(session) = weak.upgrade() {
                            {
                                let mut inner = lock(&inner);
                                if inner.active.as_ref().map_or(false, |a| Arc::ptr_eq(a, &session)) {
                                    inner.active = None;
                                }
                            }
                            session.dispose();
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Session supervisor lagged behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
}

#[async_trait]
impl SessionSource for SessionManager {
    async fn get_new_session(
        &self,
        registry: Arc<Registry>,
        scope: &CancelScope,
    ) -> Option<Arc<ConnectionSession>> {
        let stale = {
            let mut inner = lock(&self.inner);
            if inner.connecting {
                warn!("A session is already being connected");
                return None;
            }
            match inner.active.clone() {
                Some(active) if active.is_connected() => {
                    warn!("A connected session is still active; refusing a second one");
                    return None;
                }
                Some(active) => {
                    inner.active = None;
                    Some(active)
                }
                None => {
                    inner.connecting = true;
                    None
                }
            }
        };
        if let Some(stale) = stale {
            debug!("Disposing disconnected session");
            stale.dispose();
            return None;
        }
        let _connecting = ConnectingGuard(self.inner.clone());

        let wait = self.register_wait();
        if !wait.is_zero() {
            info!(wait_ms = wait.as_millis() as u64, "Waiting before registering again");
            let deadline = Instant::now() + wait;
            loop {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    break;
                }
                if scope.sleep(left.min(WAIT_SLICE)).await.is_err() {
                    return None;
                }
            }
        }

        let session = ConnectionSession::new(
            self.address.clone(),
            self.connector.clone(),
            registry,
            self.timing.clone(),
            scope.child(),
        );
        lock(&self.inner).active = Some(session.clone());
        self.supervise(&session);

        let mut last_attempt = Instant::now();
        loop {
            let (timeout, tries) = {
                let inner = lock(&self.inner);
                (inner.timeout, inner.backoff.tries())
            };
            if scope
                .sleep(timeout.saturating_sub(last_attempt.elapsed()))
                .await
                .is_err()
            {
                self.discard(&session);
                return None;
            }

            let timeout = {
                let mut inner = lock(&self.inner);
                let next = inner.backoff.next_backoff().unwrap_or(INITIAL_TIMEOUT);
                inner.timeout = next;
                next
            };
            last_attempt = Instant::now();
            debug!(tries = tries + 1, timeout_ms = timeout.as_millis() as u64, "Connecting to TLC");

            match session.start(timeout).await {
                Ok(()) if session.is_connected() => {
                    info!(address = %self.address, tries = tries + 1, "TLC session started");
                    return Some(session);
                }
                Ok(()) => {
                    debug!("Connect returned without a live connection");
                }
                Err(e) if e.is_cancelled() => {
                    self.discard(&session);
                    return None;
                }
                Err(e) => {
                    warn!(address = %self.address, tries = tries + 1, error = %e, "Connecting to TLC failed");
                }
            }
        }
    }

    fn reset_connection_retry_timers(&self) {
        let mut inner = lock(&self.inner);
        inner.backoff.reset();
        inner.timeout = INITIAL_TIMEOUT;
        inner.last_register = Some(Instant::now());
    }

    async fn end_active_session(&self, expected: bool) {
        let active = lock(&self.inner).active.take();
        if let Some(session) = active {
            session.close(expected).await;
            session.dispose();
        }
    }

    fn dispose_active_session(&self) {
        let active = lock(&self.inner).active.take();
        if let Some(session) = active {
            session.dispose();
        }
    }

    fn connection_tries(&self) -> u32 {
        lock(&self.inner).backoff.tries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockChannel, MockConnector};
    use tlcfi_core::TicksClock;

    fn registry() -> Arc<Registry> {
        Registry::new(Arc::new(TicksClock::manual(0))).0
    }

    fn manager(connector: Arc<MockConnector>) -> SessionManager {
        SessionManager::new("127.0.0.1:11501", connector, TimingConfig::default())
    }

    fn fresh_channels() -> Arc<MockConnector> {
        MockConnector::with_factory(MockChannel::echo)
    }

    #[test]
    fn test_backoff_steps() {
        let cases = [
            (1, 1000),
            (4, 1000),
            (5, 2000),
            (9, 2000),
            (10, 5000),
            (20, 5000),
            (21, 30000),
            (24, 30000),
            (25, 60000),
            (30, 60000),
        ];
        for (tries, millis) in cases {
            assert_eq!(
                StepBackoff::timeout_for(tries),
                Duration::from_millis(millis),
                "tries = {}",
                tries
            );
        }
    }

    #[test]
    fn test_step_backoff_counts_and_resets() {
        let mut backoff = StepBackoff::new();
        let first: Vec<u64> = (0..6)
            .filter_map(|_| backoff.next_backoff())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(first, vec![1000, 1000, 1000, 1000, 2000, 2000]);
        assert_eq!(backoff.tries(), 6);

        backoff.reset();
        assert_eq!(backoff.tries(), 0);
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(1000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_active_session() {
        let connector = fresh_channels();
        let manager = manager(connector.clone());
        let scope = CancelScope::new();

        let first = manager.get_new_session(registry(), &scope).await.unwrap();
        assert!(first.is_connected());

        assert!(manager.get_new_session(registry(), &scope).await.is_none());
        assert!(first.is_connected());
        assert!(!first.is_ended());
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_active_session_is_disposed() {
        let channel = MockChannel::echo();
        let manager = manager(MockConnector::with_channel(channel.clone()));
        let scope = CancelScope::new();

        let session = manager.get_new_session(registry(), &scope).await.unwrap();
        channel.disconnect();

        assert!(manager.get_new_session(registry(), &scope).await.is_none());
        assert!(session.scope().is_cancelled());
        assert!(manager.active_session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registrations_at_least_42_seconds_apart() {
        let manager = manager(fresh_channels());
        let scope = CancelScope::new();

        manager.reset_connection_retry_timers();
        tokio::time::sleep(Duration::from_secs(32)).await;

        let started = Instant::now();
        let session = manager.get_new_session(registry(), &scope).await.unwrap();
        // 10 s left of the interval, then the first attempt's timeout.
        assert_eq!(started.elapsed(), Duration::from_secs(11));

        manager.reset_connection_retry_timers();
        manager.end_active_session(true).await;
        assert!(session.is_ended());
        tokio::time::sleep(Duration::from_secs(42)).await;

        let started = Instant::now();
        manager.get_new_session(registry(), &scope).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_register_wait() {
        let manager = manager(fresh_channels());
        let scope = CancelScope::new();
        manager.reset_connection_retry_timers();

        let canceller = scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        assert!(manager.get_new_session(registry(), &scope).await.is_none());
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(manager.connection_tries(), 0);
        assert!(manager.active_session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connects_follow_backoff() {
        let connector = MockConnector::refusing();
        let manager = Arc::new(manager(connector.clone()));
        let scope = CancelScope::new();

        let task = {
            let manager = manager.clone();
            let scope = scope.clone();
            tokio::spawn(async move { manager.get_new_session(registry(), &scope).await })
        };

        // Attempts at 1, 2, 3, 4 and 5 s, then 2 s apart.
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(connector.attempts(), 4);
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(connector.attempts(), 5);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(connector.attempts(), 6);
        assert_eq!(manager.connection_tries(), 6);

        scope.cancel();
        assert!(task.await.unwrap().is_none());
        assert!(manager.active_session().is_none());
    }
}
