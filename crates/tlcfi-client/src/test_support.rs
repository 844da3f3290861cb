//! In-memory channel and connector doubles shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::{ClientError, ClientResult};
use crate::rpc::{Connector, RpcChannel, RpcHandler};

type Responder = Box<dyn Fn(&str, &Value) -> ClientResult<Value> + Send + Sync>;

/// Channel answering every call through a closure and recording it.
pub(crate) struct MockChannel {
    connected: AtomicBool,
    closed: watch::Sender<bool>,
    calls: Mutex<Vec<(String, Value)>>,
    responder: Responder,
}

impl MockChannel {
    pub(crate) fn new(
        responder: impl Fn(&str, &Value) -> ClientResult<Value> + Send + Sync + 'static,
    ) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(MockChannel {
            connected: AtomicBool::new(true),
            closed,
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        })
    }

    /// Echoes the params of every call.
    pub(crate) fn echo() -> Arc<Self> {
        Self::new(|_, params| Ok(params.clone()))
    }

    /// Fails every call with a timeout.
    pub(crate) fn silent() -> Arc<Self> {
        Self::new(|_, _| Err(ClientError::Timeout(1)))
    }

    pub(crate) fn calls_of(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Simulates the facility dropping the connection.
    pub(crate) fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.send_replace(true);
    }
}

#[async_trait]
impl RpcChannel for MockChannel {
    async fn invoke(&self, method: &str, params: Value, _timeout: Duration) -> ClientResult<Value> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));
        (self.responder)(method, &params)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn close(&self) {
        self.disconnect();
    }
}

type ChannelFactory = Box<dyn Fn() -> Arc<MockChannel> + Send + Sync>;

/// Connector handing out prepared channels, or failing when it has none.
pub(crate) struct MockConnector {
    factory: Option<ChannelFactory>,
    attempts: AtomicUsize,
    handler: Mutex<Option<Arc<dyn RpcHandler>>>,
}

impl MockConnector {
    pub(crate) fn with_channel(channel: Arc<MockChannel>) -> Arc<Self> {
        Self::with_factory(move || channel.clone())
    }

    /// Builds a new channel for every connect.
    pub(crate) fn with_factory(factory: impl Fn() -> Arc<MockChannel> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(MockConnector {
            factory: Some(Box::new(factory)),
            attempts: AtomicUsize::new(0),
            handler: Mutex::new(None),
        })
    }

    pub(crate) fn refusing() -> Arc<Self> {
        Arc::new(MockConnector {
            factory: None,
            attempts: AtomicUsize::new(0),
            handler: Mutex::new(None),
        })
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The inbound handler of the last successful connect.
    pub(crate) fn handler(&self) -> Arc<dyn RpcHandler> {
        self.handler.lock().unwrap().clone().expect("not connected yet")
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        address: &str,
        _timeout: Duration,
        handler: Arc<dyn RpcHandler>,
    ) -> ClientResult<Arc<dyn RpcChannel>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match &self.factory {
            Some(factory) => {
                *self.handler.lock().unwrap() = Some(handler);
                Ok(factory())
            }
            None => Err(ClientError::ConnectionFailed(format!("{}: refused", address))),
        }
    }
}
