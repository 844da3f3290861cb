//! # RPC Seams
//!
//! Object-safe traits between the session logic and the wire, plus the typed
//! [`TlcProxy`] that turns TLC-FI calls into `invoke(method, params, timeout)`.
//!
//! ```text
//! ┌──────────────────┐  invoke()   ┌──────────────────┐   bytes   ┌─────────┐
//! │ TlcProxy         │────────────►│ dyn RpcChannel   │──────────►│  TLC    │
//! │ (typed calls)    │◄────────────│ (TcpRpcChannel)  │◄──────────│facility │
//! └──────────────────┘   Value     └────────┬─────────┘           └─────────┘
//!                                           │ inbound requests
//!                                  ┌────────▼─────────┐
//!                                  │ dyn RpcHandler   │
//!                                  │ (session.rs)     │
//!                                  └──────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tlcfi_core::{ObjectReference, ProtocolErrorCode};
use tracing::{debug, error, warn};

use crate::config::TimingConfig;
use crate::error::{ClientError, ClientResult};
use crate::protocol::{
    methods, AliveObject, DeregistrationRequest, ObjectData, ObjectEvent, ObjectMeta,
    ObjectStateUpdateGroup, RegistrationReply, RegistrationRequest, RpcErrorObject,
};

// =============================================================================
// Traits
// =============================================================================

/// A connected JSON-RPC channel.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Sends a request and waits for its response.
    async fn invoke(&self, method: &str, params: Value, timeout: Duration) -> ClientResult<Value>;

    fn is_connected(&self) -> bool;

    /// Completes once the channel is closed, from either side.
    async fn wait_closed(&self);

    async fn close(&self);
}

/// Handles requests the facility sends to us.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcErrorObject>;
}

/// Opens channels. One call per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        address: &str,
        timeout: Duration,
        handler: Arc<dyn RpcHandler>,
    ) -> ClientResult<Arc<dyn RpcChannel>>;
}

// =============================================================================
// Typed Proxy
// =============================================================================

/// Typed TLC-FI calls on top of an [`RpcChannel`].
#[derive(Clone)]
pub struct TlcProxy {
    channel: Arc<dyn RpcChannel>,
    timing: TimingConfig,
}

impl TlcProxy {
    pub fn new(channel: Arc<dyn RpcChannel>, timing: TimingConfig) -> Self {
        TlcProxy { channel, timing }
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    pub async fn register(&self, request: &RegistrationRequest) -> ClientResult<RegistrationReply> {
        self.call(methods::REGISTER, request, self.timing.max_rpc_duration_session())
            .await
    }

    pub async fn deregister(&self) -> ClientResult<()> {
        self.call::<_, Value>(
            methods::DEREGISTER,
            &DeregistrationRequest::default(),
            self.timing.max_rpc_duration_session(),
        )
        .await
        .map(|_| ())
    }

    pub async fn read_meta(&self, objects: &ObjectReference) -> ClientResult<ObjectMeta> {
        self.call(methods::READ_META, objects, self.timing.max_rpc_duration())
            .await
    }

    pub async fn subscribe(&self, objects: &ObjectReference) -> ClientResult<ObjectData> {
        self.call(methods::SUBSCRIBE, objects, self.timing.max_rpc_duration_session())
            .await
    }

    pub async fn update_state(&self, update: &ObjectStateUpdateGroup) -> ClientResult<()> {
        self.call::<_, Value>(methods::UPDATE_STATE, update, self.timing.max_rpc_duration())
            .await
            .map(|_| ())
    }

    pub async fn notify_event(&self, event: &ObjectEvent) -> ClientResult<()> {
        self.call::<_, Value>(methods::NOTIFY_EVENT, event, self.timing.max_rpc_duration())
            .await
            .map(|_| ())
    }

    pub async fn alive(&self, alive: &AliveObject) -> ClientResult<AliveObject> {
        self.call(methods::ALIVE, alive, self.timing.alive_receive_timeout())
            .await
    }

    async fn call<P, R>(&self, method: &str, params: &P, timeout: Duration) -> ClientResult<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        debug!(method, "Invoking");
        match self.channel.invoke(method, params, timeout).await {
            Ok(result) => Ok(serde_json::from_value(result)?),
            Err(err) => {
                if let ClientError::Rpc { code, message } = &err {
                    log_rpc_error(method, *code, message);
                }
                Err(err)
            }
        }
    }
}

/// Logs an RPC error with the message that belongs to its TLC-FI code.
pub fn log_rpc_error(method: &str, code: i64, message: &str) {
    let Ok(code) = ProtocolErrorCode::try_from(code) else {
        error!(method, code, message, "Unknown type of error");
        return;
    };

    match code {
        ProtocolErrorCode::Error => error!(method, message, "TLC reported a general error"),
        ProtocolErrorCode::NotAuthorized => {
            error!(method, message, "Client is not authorized to use the server")
        }
        ProtocolErrorCode::NoRights => {
            error!(method, message, "Client has no (appropriate) rights on the server")
        }
        ProtocolErrorCode::InvalidProtocol => {
            error!(method, message, "Client protocol version is not compatible with the server")
        }
        ProtocolErrorCode::AlreadyRegistered => {
            warn!(method, message, "Client is already registered")
        }
        ProtocolErrorCode::UnknownObjectType => error!(method, message, "Unknown object type"),
        ProtocolErrorCode::MissingAttribute => error!(method, message, "Missing attribute"),
        ProtocolErrorCode::InvalidAttributeType => error!(method, message, "Invalid attribute type"),
        ProtocolErrorCode::InvalidAttributeValue => {
            error!(method, message, "Invalid attribute value")
        }
        ProtocolErrorCode::InvalidObjectReference => {
            error!(method, message, "Invalid object reference")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use tlcfi_core::ObjectType;

    /// Records calls and answers from a fixed script.
    struct ScriptedChannel {
        calls: Mutex<Vec<(String, Value, Duration)>>,
        reply: Result<Value, (i64, String)>,
    }

    #[async_trait]
    impl RpcChannel for ScriptedChannel {
        async fn invoke(&self, method: &str, params: Value, timeout: Duration) -> ClientResult<Value> {
            self.calls
                .lock()
                .unwrap()
                .push((method.to_string(), params, timeout));
            self.reply.clone().map_err(|(code, message)| ClientError::Rpc { code, message })
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn wait_closed(&self) {}

        async fn close(&self) {}
    }

    fn proxy(reply: Result<Value, (i64, String)>) -> (TlcProxy, Arc<ScriptedChannel>) {
        let channel = Arc::new(ScriptedChannel {
            calls: Mutex::new(Vec::new()),
            reply,
        });
        (TlcProxy::new(channel.clone(), TimingConfig::default()), channel)
    }

    #[tokio::test]
    async fn test_read_meta_uses_rpc_timeout() {
        let (proxy, channel) = proxy(Ok(json!({
            "objects": { "type": 3, "ids": ["02"] },
            "meta": [{ "id": "02" }],
            "ticks": 5
        })));

        let meta = proxy
            .read_meta(&ObjectReference::single(ObjectType::SignalGroup, "02"))
            .await
            .unwrap();
        assert_eq!(meta.meta.len(), 1);

        let calls = channel.calls.lock().unwrap();
        assert_eq!(calls[0].0, "ReadMeta");
        assert_eq!(calls[0].1, json!({ "type": 3, "ids": ["02"] }));
        assert_eq!(calls[0].2, Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn test_register_uses_session_timeout() {
        let (proxy, channel) = proxy(Err((1, "bad password".into())));
        let request = RegistrationRequest {
            username: "u".into(),
            password: "p".into(),
            application_type: tlcfi_core::ApplicationType::Control,
            version: crate::protocol::ProtocolVersion::current(),
            uri: "tcp://127.0.0.1:1".into(),
        };
        let err = proxy.register(&request).await.unwrap_err();
        assert_eq!(err.protocol_code(), Some(ProtocolErrorCode::NotAuthorized));
        assert_eq!(channel.calls.lock().unwrap()[0].2, Duration::from_millis(10000));
    }

    #[tokio::test]
    async fn test_deregister_sends_empty_object() {
        let (proxy, channel) = proxy(Ok(Value::Null));
        proxy.deregister().await.unwrap();
        assert_eq!(channel.calls.lock().unwrap()[0].1, json!({}));
    }

    #[tokio::test]
    async fn test_alive_echo_decodes() {
        let (proxy, _) = proxy(Ok(json!({ "ticks": 9, "time": 1000 })));
        let echo = proxy.alive(&AliveObject { ticks: 9, time: 1000 }).await.unwrap();
        assert_eq!(echo, AliveObject { ticks: 9, time: 1000 });
    }
}
