//! # Connection Session
//!
//! One TCP-backed RPC channel to the facility, its alive watchdogs and the
//! handling of everything the facility sends us.
//!
//! ## Session Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   new() ──► start(timeout) ──► [initializer] ──► running ──► close()   │
//! │                │                                    │          │        │
//! │                │ connect failed                     │          ▼        │
//! │                ▼                                    │     Deregister   │
//! │             retried by SessionManager               │     Ended(exp)   │
//! │                                                     │                   │
//! │   disconnect ───────────────────────────────────────┴──► Ended(false)  │
//! │   alive timeout / ControlState=Error ──► event ──► manager closes      │
//! │                                                                         │
//! │   dispose(): stop timers, cancel scope, drop channel (idempotent)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Inbound Session Control States
//! ```text
//! ┌────────────────┬────────────────────────────────────────────────────────┐
//! │ New state      │ Reaction                                               │
//! ├────────────────┼────────────────────────────────────────────────────────┤
//! │ Error          │ session control off, raise ControlStateError           │
//! │ NotConfigured  │ off; requested Error → request NotConfigured           │
//! │ Offline        │ off; stored Offline and requested Error/NotConfigured  │
//! │                │ → request Offline                                      │
//! │ ReadyToControl │ off                                                    │
//! │ StartControl   │ requested ReadyToControl → on, request InControl       │
//! │                │ otherwise reject the call                              │
//! │ InControl      │ on                                                     │
//! │ EndControl     │ requested EndControl → accept                          │
//! │                │ requested InControl → request EndControl               │
//! │                │ otherwise reject the call                              │
//! └────────────────┴────────────────────────────────────────────────────────┘
//! ```
//! The stored `controlState` is updated after the table ran, even when the
//! transition is not one the protocol allows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tlcfi_core::objects::SessionStateData;
use tlcfi_core::{
    ControlState, CoreError, IntersectionControlState, ObjectType, ProtocolErrorCode, TicksClock,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::alive::{self, AliveEvent, AliveHandle};
use crate::cancel::CancelScope;
use crate::config::TimingConfig;
use crate::error::{ClientError, ClientResult};
use crate::protocol::{methods, ObjectEvent, ObjectStateUpdate, ObjectStateUpdateGroup, RpcErrorObject};
use crate::registry::Registry;
use crate::rpc::{Connector, RpcChannel, RpcHandler, TlcProxy};

const EVENT_CAPACITY: usize = 64;
const RELEASE_POLL: Duration = Duration::from_millis(100);

/// Everything a session reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Disconnected,
    SendAliveTimeout,
    ReceiveAliveTimeout,
    /// The facility set the session control state to Error.
    ControlStateError,
    Ended { expected: bool },
    EventNotified(ObjectEvent),
}

// =============================================================================
// Flags
// =============================================================================

/// Boolean session state shared with the alive watchdogs.
#[derive(Debug)]
pub struct SessionFlags {
    registered: AtomicBool,
    configured: AtomicBool,
    session_control: AtomicBool,
    intersection_control: AtomicBool,
    systems_alive: AtomicBool,
}

impl Default for SessionFlags {
    fn default() -> Self {
        SessionFlags {
            registered: AtomicBool::new(false),
            configured: AtomicBool::new(false),
            session_control: AtomicBool::new(false),
            intersection_control: AtomicBool::new(false),
            systems_alive: AtomicBool::new(true),
        }
    }
}

macro_rules! flag {
    ($get:ident, $set:ident) => {
        pub fn $get(&self) -> bool {
            self.$get.load(Ordering::SeqCst)
        }

        pub fn $set(&self, value: bool) {
            self.$get.store(value, Ordering::SeqCst);
        }
    };
}

impl SessionFlags {
    flag!(registered, set_registered);
    flag!(configured, set_configured);
    flag!(session_control, set_session_control);
    flag!(intersection_control, set_intersection_control);
    flag!(systems_alive, set_systems_alive);

    /// Session and intersection are both under our control.
    pub fn controlling(&self) -> bool {
        self.session_control() && self.intersection_control()
    }
}

// =============================================================================
// Session
// =============================================================================

pub struct ConnectionSession {
    address: String,
    connector: Arc<dyn Connector>,
    registry: Arc<Registry>,
    clock: Arc<TicksClock>,
    timing: TimingConfig,
    scope: CancelScope,
    flags: Arc<SessionFlags>,
    channel: Mutex<Option<Arc<dyn RpcChannel>>>,
    alive: Mutex<Option<AliveHandle>>,
    events: broadcast::Sender<SessionEvent>,
    ended: watch::Sender<Option<bool>>,
    weak_self: Weak<ConnectionSession>,
}

impl ConnectionSession {
    pub fn new(
        address: impl Into<String>,
        connector: Arc<dyn Connector>,
        registry: Arc<Registry>,
        timing: TimingConfig,
        scope: CancelScope,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (ended, _) = watch::channel(None);
        let clock = registry.clock().clone();
        Arc::new_cyclic(|weak_self| ConnectionSession {
            address: address.into(),
            connector,
            registry,
            clock,
            timing,
            scope,
            flags: Arc::new(SessionFlags::default()),
            channel: Mutex::new(None),
            alive: Mutex::new(None),
            events,
            ended,
            weak_self: weak_self.clone(),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn channel_guard(&self) -> MutexGuard<'_, Option<Arc<dyn RpcChannel>>> {
        self.channel.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn alive_guard(&self) -> MutexGuard<'_, Option<AliveHandle>> {
        self.alive.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn remote_address(&self) -> &str {
        &self.address
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn flags(&self) -> &Arc<SessionFlags> {
        &self.flags
    }

    pub fn scope(&self) -> &CancelScope {
        &self.scope
    }

    pub fn is_connected(&self) -> bool {
        self.channel_guard()
            .as_ref()
            .map_or(false, |channel| channel.is_connected())
    }

    pub fn proxy(&self) -> ClientResult<TlcProxy> {
        self.channel_guard()
            .as_ref()
            .map(|channel| TlcProxy::new(channel.clone(), self.timing.clone()))
            .ok_or(ClientError::NotConnected)
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Opens the channel. Fails with `Cancelled` once the session scope is cancelled.
    pub async fn start(&self, timeout: Duration) -> ClientResult<()> {
        self.scope.check()?;
        let handler: Arc<dyn RpcHandler> = Arc::new(SessionHandler {
            session: self.weak_self.clone(),
        });
        let channel = self
            .scope
            .run(self.connector.connect(&self.address, timeout, handler))
            .await?;
        *self.channel_guard() = Some(channel.clone());

        let weak = self.weak_self.clone();
        let scope = self.scope.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = scope.cancelled() => {}
                _ = channel.wait_closed() => {
                    if let Some(session) = weak.upgrade() {
                        session.on_disconnected();
                    }
                }
            }
        });
        Ok(())
    }

    fn on_disconnected(&self) {
        warn!(address = %self.address, "Disconnected from TLC");
        self.stop_alive_timers();
        self.flags.set_registered(false);
        self.emit(SessionEvent::Disconnected);
        self.finish(false);
    }

    // =========================================================================
    // Alive
    // =========================================================================

    pub fn start_alive_timers(&self) -> ClientResult<()> {
        let proxy = self.proxy()?;
        let (tx, mut rx) = mpsc::channel(4);
        let handle = alive::spawn(
            proxy,
            self.clock.clone(),
            self.flags.clone(),
            &self.timing,
            self.scope.child(),
            tx,
        );
        if let Some(previous) = self.alive_guard().replace(handle) {
            previous.stop();
        }

        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match weak.upgrade() {
                    Some(session) => session.on_alive_event(event),
                    None => break,
                }
            }
        });
        Ok(())
    }

    pub fn stop_alive_timers(&self) {
        if let Some(handle) = self.alive_guard().take() {
            handle.stop();
        }
    }

    fn feed_alive(&self) {
        if let Some(handle) = self.alive_guard().as_ref() {
            handle.feed();
        }
    }

    fn on_alive_event(&self, event: AliveEvent) {
        self.stop_alive_timers();
        match event {
            AliveEvent::SendTimeout => {
                error!(address = %self.address, "Alive send timeout");
                self.emit(SessionEvent::SendAliveTimeout);
            }
            AliveEvent::ReceiveTimeout => {
                error!(address = %self.address, "Alive receive timeout");
                self.flags.set_registered(false);
                self.emit(SessionEvent::ReceiveAliveTimeout);
            }
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Ends the session: waits for control to be released, stops the timers
    /// and deregisters. Deregister failures are ignored.
    pub async fn close(&self, expected: bool) {
        if self.is_connected() && self.flags.controlling() {
            info!("Waiting for control to be released");
            let deadline = Instant::now() + self.timing.max_release_control();
            while self.is_connected() && self.flags.controlling() && Instant::now() < deadline {
                tokio::time::sleep(RELEASE_POLL).await;
            }
            if self.flags.controlling() {
                warn!("Control was not released in time");
            }
        }

        self.stop_alive_timers();

        if self.is_connected() && self.flags.registered() {
            match self.proxy() {
                Ok(proxy) => match proxy.deregister().await {
                    Ok(()) => info!("Deregistered"),
                    Err(e) => warn!(error = %e, "Deregister failed"),
                },
                Err(e) => debug!(error = %e, "No channel to deregister on"),
            }
            self.flags.set_registered(false);
        }

        self.finish(expected);
    }

    /// Releases every resource. Safe to call repeatedly.
    pub fn dispose(&self) {
        self.stop_alive_timers();
        self.scope.cancel();
        if let Some(channel) = self.channel_guard().take() {
            tokio::spawn(async move { channel.close().await });
        }
        self.finish(false);
    }

    fn finish(&self, expected: bool) {
        let first = self.ended.send_if_modified(|ended| {
            if ended.is_none() {
                *ended = Some(expected);
                true
            } else {
                false
            }
        });
        if first {
            info!(expected, "Session ended");
            self.emit(SessionEvent::Ended { expected });
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended.borrow().is_some()
    }

    /// Waits until the session ends and returns whether that was expected.
    pub async fn wait_ended(&self) -> bool {
        let mut ended = self.ended.subscribe();
        let expected = match ended.wait_for(|ended| ended.is_some()).await {
            Ok(ended) => (*ended).unwrap_or(false),
            Err(_) => false,
        };
        expected
    }

    // =========================================================================
    // Outbound Requests
    // =========================================================================

    /// Requests a session control state and sends it right away.
    pub async fn set_req_control_state(&self, state: ControlState) -> ClientResult<()> {
        let Some(update) = self.registry.request_session_control_state(state) else {
            debug!(%state, "Control state already requested");
            return Ok(());
        };
        info!(%state, "Requesting session control state");
        self.proxy()?.update_state(&update).await
    }

    /// Requests a state for the controlled intersection and sends it right away.
    pub async fn set_intersection_req_state(&self, state: IntersectionControlState) -> ClientResult<()> {
        let Some(update) = self.registry.request_intersection_state(state) else {
            debug!(%state, "Intersection state already requested");
            return Ok(());
        };
        info!(%state, "Requesting intersection state");
        self.proxy()?.update_state(&update).await
    }

    pub async fn send_update(&self, update: &ObjectStateUpdateGroup) -> ClientResult<()> {
        self.proxy()?.update_state(update).await
    }

    fn request_control_state_later(&self, state: ControlState) {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            if let Some(session) = weak.upgrade() {
                if let Err(e) = session.set_req_control_state(state).await {
                    warn!(%state, error = %e, "Control state request failed");
                }
            }
        });
    }

    // =========================================================================
    // Inbound Requests
    // =========================================================================

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcErrorObject> {
        match method {
            methods::ALIVE => {
                self.feed_alive();
                Ok(params)
            }
            methods::UPDATE_STATE => {
                let group: ObjectStateUpdateGroup = decode(params)?;
                self.on_update_state(group)?;
                Ok(Value::Null)
            }
            methods::NOTIFY_EVENT => {
                let event: ObjectEvent = decode(params)?;
                info!(objects = ?event.objects, events = ?event.events, "TLC notified event");
                self.emit(SessionEvent::EventNotified(event));
                Ok(Value::Null)
            }
            methods::READ_META => Err(RpcErrorObject::new(
                ProtocolErrorCode::Error,
                "ReadMeta is not supported by this client",
            )),
            other => {
                warn!(method = other, "Unknown method called by TLC");
                Err(RpcErrorObject::method_not_found(other))
            }
        }
    }

    fn on_update_state(&self, group: ObjectStateUpdateGroup) -> Result<(), RpcErrorObject> {
        if group.update.is_empty() {
            return Err(protocol_error("List of objects is empty"));
        }

        for update in &group.update {
            if update.objects.ids.len() != update.states.len() {
                return Err(protocol_error("Lists of ids and states have different lengths"));
            }
            if update.objects.ids.is_empty() {
                return Err(protocol_error("List of objects is empty"));
            }

            match update.objects.object_type {
                ObjectType::Session => self.on_session_update(update)?,
                ObjectType::TLCFacilities => {
                    return Err(protocol_error("TLCFacilities has no state"));
                }
                ObjectType::Intersection => {
                    self.apply_each(update)?;
                    let controlled = self.registry.controlled_intersection_id();
                    if update.objects.ids.iter().any(|id| Some(id) == controlled.as_ref()) {
                        let in_control =
                            self.registry.intersection_state() == Some(IntersectionControlState::Control);
                        self.flags.set_intersection_control(in_control);
                    }
                }
                ObjectType::SpecialVehicleEventGenerator => {
                    let generator = self
                        .registry
                        .with_store(|s| s.special_vehicle_generator().map(|g| g.id.clone()));
                    if update.objects.ids.len() != 1 || generator.as_ref() != update.objects.ids.first() {
                        return Err(RpcErrorObject::new(
                            ProtocolErrorCode::InvalidObjectReference,
                            "Update must reference exactly the special vehicle event generator",
                        ));
                    }
                    self.apply_each(update)?;
                }
                _ => self.apply_each(update)?,
            }
        }
        Ok(())
    }

    fn apply_each(&self, update: &ObjectStateUpdate) -> Result<(), RpcErrorObject> {
        let object_type = update.objects.object_type;
        for (id, state) in update.objects.ids.iter().zip(&update.states) {
            self.registry
                .apply_remote_update(object_type, id, state)
                .map_err(core_to_rpc)?;
        }
        Ok(())
    }

    fn on_session_update(&self, update: &ObjectStateUpdate) -> Result<(), RpcErrorObject> {
        let session_id = self.registry.session_id();
        if update.objects.ids.len() != 1 || update.objects.ids.first() != session_id.as_ref() {
            return Err(RpcErrorObject::new(
                ProtocolErrorCode::InvalidObjectReference,
                "Update must reference exactly this session",
            ));
        }
        let data: SessionStateData = serde_json::from_value(update.states[0].clone()).map_err(|e| {
            RpcErrorObject::new(ProtocolErrorCode::InvalidAttributeType, e.to_string())
        })?;
        let Some(new) = data.control_state else {
            return Err(RpcErrorObject::new(
                ProtocolErrorCode::InvalidAttributeValue,
                "Session state carries no controlState",
            ));
        };

        self.react_to_control_state(new)?;
        self.registry.apply_session_update(data).map_err(core_to_rpc)?;
        Ok(())
    }

    fn react_to_control_state(&self, new: ControlState) -> Result<(), RpcErrorObject> {
        let requested = self.registry.session_req_control_state();
        info!(%new, requested = ?requested, "TLC set session control state");

        let mismatch = |expected: ControlState| {
            if requested != Some(expected) {
                warn!(%new, requested = ?requested, "Control state differs from the requested one");
            }
        };

        match new {
            ControlState::Error => {
                self.flags.set_session_control(false);
                error!("TLC set session control state to Error");
                self.emit(SessionEvent::ControlStateError);
            }
            ControlState::NotConfigured => {
                self.flags.set_session_control(false);
                if requested == Some(ControlState::Error) {
                    self.request_control_state_later(ControlState::NotConfigured);
                }
            }
            ControlState::Offline => {
                self.flags.set_session_control(false);
                let stored = self.registry.session_control_state();
                if stored == Some(ControlState::Offline)
                    && matches!(requested, Some(ControlState::Error | ControlState::NotConfigured))
                {
                    self.request_control_state_later(ControlState::Offline);
                } else {
                    mismatch(ControlState::Offline);
                }
            }
            ControlState::ReadyToControl => {
                self.flags.set_session_control(false);
                mismatch(ControlState::ReadyToControl);
            }
            ControlState::InControl => {
                self.flags.set_session_control(true);
                mismatch(ControlState::InControl);
            }
            ControlState::StartControl => {
                if requested != Some(ControlState::ReadyToControl) {
                    return Err(protocol_error("StartControl received while ReadyToControl was not requested"));
                }
                self.flags.set_session_control(true);
                self.request_control_state_later(ControlState::InControl);
            }
            ControlState::EndControl => match requested {
                Some(ControlState::EndControl) => {}
                Some(ControlState::InControl) => {
                    info!("TLC ends control; confirming");
                    self.request_control_state_later(ControlState::EndControl);
                }
                _ => {
                    return Err(protocol_error("EndControl received while not in control"));
                }
            },
        }
        Ok(())
    }
}

// =============================================================================
// Inbound Handler
// =============================================================================

/// Routes inbound calls to the session without keeping it alive.
struct SessionHandler {
    session: Weak<ConnectionSession>,
}

#[async_trait]
impl RpcHandler for SessionHandler {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcErrorObject> {
        match self.session.upgrade() {
            Some(session) => session.handle_request(method, params).await,
            None => Err(protocol_error("Session is gone")),
        }
    }
}

fn protocol_error(message: &str) -> RpcErrorObject {
    RpcErrorObject::new(ProtocolErrorCode::Error, message)
}

fn decode<T: DeserializeOwned>(params: Value) -> Result<T, RpcErrorObject> {
    serde_json::from_value(params)
        .map_err(|e| RpcErrorObject::new(ProtocolErrorCode::InvalidAttributeType, e.to_string()))
}

fn core_to_rpc(err: CoreError) -> RpcErrorObject {
    match err {
        CoreError::ObjectNotFound { id, .. } => RpcErrorObject::new(
            ProtocolErrorCode::InvalidObjectReference,
            format!("Object {} unknown", id),
        ),
        err @ CoreError::MalformedPayload { .. } => {
            RpcErrorObject::new(ProtocolErrorCode::InvalidAttributeType, err.to_string())
        }
        err @ CoreError::Validation(_) => {
            RpcErrorObject::new(ProtocolErrorCode::InvalidAttributeValue, err.to_string())
        }
        err => RpcErrorObject::new(ProtocolErrorCode::Error, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockChannel, MockConnector};
    use serde_json::json;
    use tlcfi_core::objects::{Intersection, Session, SignalGroup, SpecialVehicleGenerator};
    use tlcfi_core::{ApplicationType, SignalGroupState, TlcObject};

    struct Fixture {
        session: Arc<ConnectionSession>,
        channel: Arc<MockChannel>,
        connector: Arc<MockConnector>,
    }

    impl Fixture {
        async fn call(&self, method: &str, params: Value) -> Result<Value, RpcErrorObject> {
            self.connector.handler().handle(method, params).await
        }

        async fn update(&self, object_type: ObjectType, id: &str, state: Value) -> Result<Value, RpcErrorObject> {
            self.call(
                "UpdateState",
                json!({
                    "update": [{ "objects": { "type": object_type, "ids": [id] }, "states": [state] }],
                    "ticks": 1
                }),
            )
            .await
        }

        fn request(&self, state: ControlState) {
            self.session.registry().request_session_control_state(state);
        }
    }

    async fn fixture() -> Fixture {
        let (registry, _events) = Registry::new(Arc::new(TicksClock::manual(0)));
        registry.add(TlcObject::Session(Session::new("s1", ApplicationType::Control)));
        registry.add(TlcObject::Intersection(Intersection {
            id: "K205195".into(),
            signalgroups: vec!["02".into()],
            ..Default::default()
        }));
        registry.add(TlcObject::SignalGroup(SignalGroup::new("02")));
        registry.add(TlcObject::SpecialVehicleGenerator(SpecialVehicleGenerator {
            id: "spv".into(),
            ..Default::default()
        }));
        registry.initialize("K205195").unwrap();

        let channel = MockChannel::echo();
        let connector = MockConnector::with_channel(channel.clone());
        let session = ConnectionSession::new(
            "127.0.0.1:11501",
            connector.clone(),
            registry,
            TimingConfig::default(),
            CancelScope::new(),
        );
        session.start(Duration::from_secs(1)).await.unwrap();
        Fixture {
            session,
            channel,
            connector,
        }
    }

    /// Lets spawned follow-up requests run.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn requested_states(channel: &MockChannel) -> Vec<Value> {
        channel
            .calls_of("UpdateState")
            .iter()
            .map(|call| call["update"][0]["states"][0]["reqControlState"].clone())
            .collect()
    }

    #[tokio::test]
    async fn test_alive_is_echoed() {
        let f = fixture().await;
        let params = json!({ "ticks": 12, "time": 34 });
        assert_eq!(f.call("Alive", params.clone()).await.unwrap(), params);
    }

    #[tokio::test]
    async fn test_read_meta_is_rejected() {
        let f = fixture().await;
        let err = f.call("ReadMeta", json!({ "type": 3, "ids": ["02"] })).await.unwrap_err();
        assert_eq!(err.code, ProtocolErrorCode::Error.as_i64());
    }

    #[tokio::test]
    async fn test_update_state_shape_is_checked() {
        let f = fixture().await;
        let empty = f.call("UpdateState", json!({ "update": [], "ticks": 1 })).await.unwrap_err();
        assert_eq!(empty.message, "List of objects is empty");

        let uneven = f
            .call(
                "UpdateState",
                json!({
                    "update": [{ "objects": { "type": 3, "ids": ["02"] }, "states": [] }],
                    "ticks": 1
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(uneven.message, "Lists of ids and states have different lengths");
    }

    #[tokio::test]
    async fn test_unknown_object_is_invalid_reference() {
        let f = fixture().await;
        let err = f
            .update(ObjectType::SignalGroup, "99", json!({ "state": 3 }))
            .await
            .unwrap_err();
        assert_eq!(err.code, ProtocolErrorCode::InvalidObjectReference.as_i64());
        assert_eq!(err.message, "Object 99 unknown");

        f.update(ObjectType::SignalGroup, "02", json!({ "state": 3 }))
            .await
            .unwrap();
        assert_eq!(
            f.session.registry().signal_group_state("02").unwrap(),
            Some(SignalGroupState::StopAndRemain)
        );
    }

    #[tokio::test]
    async fn test_special_vehicle_generator_id_checked() {
        let f = fixture().await;
        let err = f
            .update(ObjectType::SpecialVehicleEventGenerator, "other", json!({ "faultstate": 0 }))
            .await
            .unwrap_err();
        assert_eq!(err.code, ProtocolErrorCode::InvalidObjectReference.as_i64());

        f.update(ObjectType::SpecialVehicleEventGenerator, "spv", json!({ "faultstate": 0 }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_intersection_control_flag_follows_state() {
        let f = fixture().await;
        f.update(ObjectType::Intersection, "K205195", json!({ "state": 7 }))
            .await
            .unwrap();
        assert!(f.session.flags().intersection_control());

        f.update(ObjectType::Intersection, "K205195", json!({ "state": 6 }))
            .await
            .unwrap();
        assert!(!f.session.flags().intersection_control());
    }

    #[tokio::test]
    async fn test_session_update_must_name_this_session() {
        let f = fixture().await;
        let err = f
            .update(ObjectType::Session, "s2", json!({ "controlState": 2 }))
            .await
            .unwrap_err();
        assert_eq!(err.code, ProtocolErrorCode::InvalidObjectReference.as_i64());

        let err = f
            .update(ObjectType::Session, "s1", json!({ "reqHandover": 1 }))
            .await
            .unwrap_err();
        assert_eq!(err.code, ProtocolErrorCode::InvalidAttributeValue.as_i64());
    }

    #[tokio::test]
    async fn test_start_control_accepted_after_ready_to_control() {
        let f = fixture().await;
        f.request(ControlState::ReadyToControl);

        f.update(ObjectType::Session, "s1", json!({ "controlState": 4 }))
            .await
            .unwrap();
        assert!(f.session.flags().session_control());
        assert_eq!(
            f.session.registry().session_control_state(),
            Some(ControlState::StartControl)
        );

        settle().await;
        assert_eq!(requested_states(&f.channel), vec![json!(5)]);
    }

    #[tokio::test]
    async fn test_start_control_rejected_when_not_requested() {
        let f = fixture().await;
        f.request(ControlState::Offline);

        let err = f
            .update(ObjectType::Session, "s1", json!({ "controlState": 4 }))
            .await
            .unwrap_err();
        assert_eq!(err.code, ProtocolErrorCode::Error.as_i64());
        assert!(!f.session.flags().session_control());
        assert_eq!(f.session.registry().session_control_state(), None);
    }

    #[tokio::test]
    async fn test_remote_end_control_is_confirmed() {
        let f = fixture().await;
        f.request(ControlState::InControl);

        f.update(ObjectType::Session, "s1", json!({ "controlState": 6 }))
            .await
            .unwrap();
        settle().await;
        assert_eq!(requested_states(&f.channel), vec![json!(6)]);
    }

    #[tokio::test]
    async fn test_end_control_rejected_when_not_in_control() {
        let f = fixture().await;
        f.request(ControlState::Offline);
        let err = f
            .update(ObjectType::Session, "s1", json!({ "controlState": 6 }))
            .await
            .unwrap_err();
        assert_eq!(err.code, ProtocolErrorCode::Error.as_i64());
    }

    #[tokio::test]
    async fn test_offline_auto_confirmed_after_error_request() {
        let f = fixture().await;
        f.update(ObjectType::Session, "s1", json!({ "controlState": 2 }))
            .await
            .unwrap();
        f.request(ControlState::Error);

        f.update(ObjectType::Session, "s1", json!({ "controlState": 2 }))
            .await
            .unwrap();
        settle().await;
        assert_eq!(requested_states(&f.channel), vec![json!(2)]);
    }

    #[tokio::test]
    async fn test_offline_not_confirmed_until_tlc_was_offline() {
        let f = fixture().await;
        f.request(ControlState::NotConfigured);

        f.update(ObjectType::Session, "s1", json!({ "controlState": 1 }))
            .await
            .unwrap();
        f.update(ObjectType::Session, "s1", json!({ "controlState": 2 }))
            .await
            .unwrap();
        settle().await;
        assert!(requested_states(&f.channel).is_empty());
        assert_eq!(f.session.registry().session_control_state(), Some(ControlState::Offline));
    }

    #[tokio::test]
    async fn test_not_configured_auto_confirmed_after_error_request() {
        let f = fixture().await;
        f.request(ControlState::Error);

        f.update(ObjectType::Session, "s1", json!({ "controlState": 1 }))
            .await
            .unwrap();
        settle().await;
        assert_eq!(requested_states(&f.channel), vec![json!(1)]);
    }

    #[tokio::test]
    async fn test_control_state_error_raises_event() {
        let f = fixture().await;
        let mut events = f.session.subscribe_events();
        f.update(ObjectType::Session, "s1", json!({ "controlState": 0 }))
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::ControlStateError);
        assert_eq!(f.session.registry().session_control_state(), Some(ControlState::Error));
    }

    #[tokio::test]
    async fn test_close_deregisters_and_ends() {
        let f = fixture().await;
        f.session.flags().set_registered(true);

        f.session.close(true).await;
        assert_eq!(f.channel.calls_of("Deregister"), vec![json!({})]);
        assert!(!f.session.flags().registered());
        assert!(f.session.wait_ended().await);

        // A second close does not change the outcome.
        f.session.close(false).await;
        assert!(f.session.wait_ended().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_control_release() {
        let f = fixture().await;
        f.session.flags().set_session_control(true);
        f.session.flags().set_intersection_control(true);

        let started = Instant::now();
        f.session.close(true).await;
        assert!(started.elapsed() >= Duration::from_millis(10000));
    }

    #[tokio::test]
    async fn test_disconnect_ends_unexpectedly() {
        let f = fixture().await;
        let mut events = f.session.subscribe_events();
        f.channel.disconnect();

        assert!(!f.session.wait_ended().await);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Disconnected);
        assert!(!f.session.is_connected());
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let f = fixture().await;
        f.session.dispose();
        f.session.dispose();
        assert!(f.session.is_ended());
        assert!(f.session.scope().is_cancelled());
        assert!(f.session.proxy().is_err());
    }
}
