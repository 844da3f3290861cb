//! Reconnect loop behaviour of `TlcfiClient` against scripted session sources.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tlcfi_client::{
    CancelScope, ClientConfig, ClientError, ClientEvent, ClientEventEmitter, ClientResult,
    ConnectionSession, Connector, Registry, RpcChannel, RpcHandler, SessionInitializer,
    SessionSource, TimingConfig, TlcfiClient,
};
use tokio::sync::watch;

// =============================================================================
// Fakes
// =============================================================================

/// Answers every call with an empty object until closed.
struct LoopbackChannel {
    closed: watch::Sender<bool>,
}

#[async_trait]
impl RpcChannel for LoopbackChannel {
    async fn invoke(&self, _method: &str, _params: Value, _timeout: Duration) -> ClientResult<Value> {
        if *self.closed.borrow() {
            return Err(ClientError::NotConnected);
        }
        Ok(json!({}))
    }

    fn is_connected(&self) -> bool {
        !*self.closed.borrow()
    }

    async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }
}

struct LoopbackConnector;

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(
        &self,
        _address: &str,
        _timeout: Duration,
        _handler: Arc<dyn RpcHandler>,
    ) -> ClientResult<Arc<dyn RpcChannel>> {
        let (closed, _) = watch::channel(false);
        Ok(Arc::new(LoopbackChannel { closed }))
    }
}

/// Counts attempts; either always fails or always hands out a session.
struct MockSource {
    tries: AtomicU32,
    hand_out_sessions: bool,
    active: Mutex<Option<Arc<ConnectionSession>>>,
}

impl MockSource {
    fn new(hand_out_sessions: bool) -> Arc<Self> {
        Arc::new(MockSource {
            tries: AtomicU32::new(0),
            hand_out_sessions,
            active: Mutex::new(None),
        })
    }

    fn tries(&self) -> u32 {
        self.tries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionSource for MockSource {
    async fn get_new_session(
        &self,
        registry: Arc<Registry>,
        scope: &CancelScope,
    ) -> Option<Arc<ConnectionSession>> {
        self.tries.fetch_add(1, Ordering::SeqCst);
        scope.sleep(Duration::from_millis(10)).await.ok()?;
        if !self.hand_out_sessions {
            return None;
        }
        let session = ConnectionSession::new(
            "127.0.0.1:11501",
            Arc::new(LoopbackConnector),
            registry,
            TimingConfig::default(),
            scope.child(),
        );
        session.start(Duration::from_secs(1)).await.ok()?;
        *self.active.lock().unwrap() = Some(session.clone());
        Some(session)
    }

    fn reset_connection_retry_timers(&self) {}

    async fn end_active_session(&self, expected: bool) {
        let active = self.active.lock().unwrap().take();
        if let Some(session) = active {
            session.close(expected).await;
        }
    }

    fn dispose_active_session(&self) {
        if let Some(session) = self.active.lock().unwrap().take() {
            session.dispose();
        }
    }

    fn connection_tries(&self) -> u32 {
        self.tries()
    }
}

/// Fails every initialization with the given fatality.
struct FailingInitializer {
    fatal: bool,
}

#[async_trait]
impl SessionInitializer for FailingInitializer {
    async fn initialize(&self, _session: &Arc<ConnectionSession>, _scope: &CancelScope) -> ClientResult<()> {
        Err(ClientError::session("Registration rejected", self.fatal))
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<ClientEvent>>);

impl ClientEventEmitter for Recorder {
    fn emit(&self, event: &ClientEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

fn config(auto_reconnect: bool) -> ClientConfig {
    let mut config = ClientConfig::new();
    config.application.intersection_id = "K205195".into();
    config.application.register_delay_ms = 0;
    config.application.auto_reconnect = auto_reconnect;
    config.objects.signal_groups = ["02", "03", "05", "08"].iter().map(|s| s.to_string()).collect();
    config
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_without_auto_reconnect_tries_once() {
    let source = MockSource::new(false);
    let client = TlcfiClient::builder(config(false))
        .with_session_source(source.clone())
        .build()
        .unwrap();

    client.start_session().await.unwrap();
    assert_eq!(source.tries(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_auto_reconnect_keeps_trying() {
    let source = MockSource::new(false);
    let scope = CancelScope::new();
    let client = TlcfiClient::builder(config(true))
        .with_session_source(source.clone())
        .with_cancel_scope(scope.clone())
        .build()
        .unwrap();

    let runner = client.clone();
    let handle = tokio::spawn(async move { runner.start_session().await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    scope.cancel();

    handle.await.unwrap().unwrap();
    assert!(source.tries() > 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_fatal_initialization_error_reconnects() {
    let source = MockSource::new(true);
    let scope = CancelScope::new();
    let events = Arc::new(Recorder::default());
    let client = TlcfiClient::builder(config(true))
        .with_session_source(source.clone())
        .with_initializer(Arc::new(FailingInitializer { fatal: false }))
        .with_emitter(events.clone())
        .with_cancel_scope(scope.clone())
        .build()
        .unwrap();

    let runner = client.clone();
    let handle = tokio::spawn(async move { runner.start_session().await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    scope.cancel();

    handle.await.unwrap().unwrap();
    assert!(source.tries() > 1);
    assert!(!client.has_fatal_error());
    let events = events.0.lock().unwrap();
    assert!(events.contains(&ClientEvent::SessionEnded { expected: false }));
    assert!(events.contains(&ClientEvent::SessionStarted {
        remote: "127.0.0.1:11501".into()
    }));
}

#[tokio::test(start_paused = true)]
async fn test_fatal_initialization_error_stops_loop() {
    let source = MockSource::new(true);
    let events = Arc::new(Recorder::default());
    let client = TlcfiClient::builder(config(true))
        .with_session_source(source.clone())
        .with_initializer(Arc::new(FailingInitializer { fatal: true }))
        .with_emitter(events.clone())
        .build()
        .unwrap();

    let err = client.start_session().await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(source.tries(), 1);
    assert!(client.has_fatal_error());

    let events = events.0.lock().unwrap();
    assert!(events.iter().any(|e| matches!(e, ClientEvent::FatalError { .. })));
    assert!(!events.contains(&ClientEvent::Initialized));
}

#[test]
fn test_invalid_config_is_rejected() {
    let mut config = config(true);
    config.application.intersection_id.clear();
    assert!(TlcfiClient::new(config).is_err());
}
