//! # TLC-FI Client
//!
//! The facade a controller application talks to. It drives the reconnect
//! loop, reacts to control handover and forwards state changes as
//! [`ClientEvent`]s.
//!
//! ## Session Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  start_session()                                                        │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  ┌──────────────────────────────────────────────────────────────┐      │
//! │  │ fresh Registry ──► get_new_session() ──► register delay      │      │
//! │  │        ▲                   │ None            │               │      │
//! │  │        │                   ▼                 ▼               │      │
//! │  │        │               next round      initializer           │      │
//! │  │        │                                 │ ok   │ error      │      │
//! │  │        │                                 ▼      ▼            │      │
//! │  │        │                       Initialized   end session     │      │
//! │  │        │                                 │      │ (fatal?)   │      │
//! │  │        │                                 ▼      ▼            │      │
//! │  │        └──── auto_reconnect ◄──── wait for session end       │      │
//! │  └──────────────────────────────────────────────────────────────┘      │
//! │     │ fatal, cancelled, or no auto_reconnect                           │
//! │     ▼                                                                   │
//! │  return                                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Authorization
//! Requests that are not allowed in the current role or control state are
//! logged and ignored. Unknown ids are reported as errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tlcfi_core::{
    ApplicationType, ControlState, DetectorState, IntersectionControlState, Prediction,
    SignalGroupState, TicksClock, END_CONTROL_GRACE_SECS,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelScope;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::initializer::{ClientInitializer, SessionInitializer};
use crate::protocol::{ObjectEvent, ObjectStateUpdateGroup};
use crate::registry::{Registry, RegistryEvent};
use crate::session::{ConnectionSession, SessionEvent};
use crate::session_manager::{SessionManager, SessionSource};
use crate::transport::TcpConnector;

const END_CONTROL_GRACE: Duration = Duration::from_secs(END_CONTROL_GRACE_SECS);

// =============================================================================
// Events
// =============================================================================

/// Everything the client reports to the controller application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A TCP session to the facility is open; initialization follows.
    SessionStarted { remote: String },
    /// Connected, registered and configured.
    Initialized,
    GotControl,
    LostControl { expected: bool },
    StartControlRequestReceived,
    /// Call [`TlcfiClient::confirm_end_control`] once control can be released.
    EndControlRequestReceived,
    IntersectionStateChanged { id: String, state: IntersectionControlState },
    SignalGroupStateChanged { id: String, state: SignalGroupState },
    DetectorStateChanged { id: String, state: DetectorState },
    InputStateChanged { id: String, state: i32 },
    OutputStateChanged { id: String, state: i32 },
    VariableChanged { id: String, value: i32 },
    SessionEnded { expected: bool },
    /// The client stopped reconnecting.
    FatalError { message: String },
    EventNotified(ObjectEvent),
}

impl ClientEvent {
    fn from_state_change(event: RegistryEvent) -> Option<Self> {
        let event = match event {
            RegistryEvent::SessionControlStateChanged { .. } => return None,
            RegistryEvent::IntersectionStateChanged { id, state } => {
                ClientEvent::IntersectionStateChanged { id, state }
            }
            RegistryEvent::SignalGroupStateChanged { id, state } => {
                ClientEvent::SignalGroupStateChanged { id, state }
            }
            RegistryEvent::DetectorStateChanged { id, state } => {
                ClientEvent::DetectorStateChanged { id, state }
            }
            RegistryEvent::InputStateChanged { id, state } => ClientEvent::InputStateChanged { id, state },
            RegistryEvent::OutputStateChanged { id, state } => ClientEvent::OutputStateChanged { id, state },
            RegistryEvent::VariableChanged { id, value } => ClientEvent::VariableChanged { id, value },
        };
        Some(event)
    }
}

/// Receives client events. Called from the client's tasks; keep it quick.
pub trait ClientEventEmitter: Send + Sync {
    fn emit(&self, event: &ClientEvent);
}

/// Drops every event.
pub struct NoOpEmitter;

impl ClientEventEmitter for NoOpEmitter {
    fn emit(&self, _event: &ClientEvent) {}
}

// =============================================================================
// Client
// =============================================================================

#[derive(Default)]
struct ClientState {
    session: Option<Arc<ConnectionSession>>,
    session_scope: Option<CancelScope>,
    end_control: Option<CancelScope>,
    user_wants_control: bool,
    user_intersection_state: Option<IntersectionControlState>,
    session_error_count: u32,
}

struct ClientInner {
    config: ClientConfig,
    sessions: Arc<dyn SessionSource>,
    initializer: Arc<dyn SessionInitializer>,
    emitter: Arc<dyn ClientEventEmitter>,
    clock: Arc<TicksClock>,
    scope: CancelScope,
    state: Mutex<ClientState>,
    running: AtomicBool,
    fatal: AtomicBool,
    flushing: Arc<AtomicBool>,
}

/// Clears the in-flight flag however the flush ends.
struct FlushGuard(Arc<AtomicBool>);

impl Drop for FlushGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Handle to the client. Cheap to clone.
#[derive(Clone)]
pub struct TlcfiClient {
    inner: Arc<ClientInner>,
}

impl TlcfiClient {
    /// Creates a client that connects over TCP to the configured facility.
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        TlcfiClientBuilder::new(config).build()
    }

    pub fn builder(config: ClientConfig) -> TlcfiClientBuilder {
        TlcfiClientBuilder::new(config)
    }

    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ClientEvent) {
        self.inner.emitter.emit(&event);
    }

    fn current_session(&self) -> Option<Arc<ConnectionSession>> {
        self.state().session.clone()
    }

    fn require_session(&self) -> ClientResult<Arc<ConnectionSession>> {
        self.current_session().ok_or(ClientError::NotConnected)
    }

    fn set_fatal(&self, message: &str) {
        if !self.inner.fatal.swap(true, Ordering::SeqCst) {
            error!(
                reason = message,
                "The client had an error considered fatal; it will no longer make new connections. Check the configuration."
            );
            self.emit(ClientEvent::FatalError {
                message: message.to_string(),
            });
        }
    }

    // =========================================================================
    // Session Loop
    // =========================================================================

    /// Runs sessions until a fatal error, cancellation or, without
    /// `auto_reconnect`, the end of the first one.
    pub async fn start_session(&self) -> ClientResult<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("start_session is already running");
            return Err(ClientError::session("Session loop already running", false));
        }

        let app = &self.inner.config.application;
        let mut first = true;
        while (first || app.auto_reconnect) && !self.has_fatal_error() && !self.inner.scope.is_cancelled() {
            first = false;
            self.run_session_round().await;
        }

        self.inner.running.store(false, Ordering::SeqCst);
        if self.has_fatal_error() {
            return Err(ClientError::session("Stopped after a fatal error", true));
        }
        Ok(())
    }

    async fn run_session_round(&self) {
        let session_scope = self.inner.scope.child();
        let (registry, registry_events) = Registry::new(self.inner.clock.clone());
        self.state().session_scope = Some(session_scope.clone());

        let Some(session) = self
            .inner
            .sessions
            .get_new_session(registry.clone(), &session_scope)
            .await
        else {
            return;
        };
        self.state().session = Some(session.clone());
        let session_events = session.subscribe_events();
        self.emit(ClientEvent::SessionStarted {
            remote: session.remote_address().to_string(),
        });

        let register_delay = Duration::from_millis(self.inner.config.application.register_delay_ms);
        if session_scope.sleep(register_delay).await.is_ok() {
            match self.inner.initializer.initialize(&session, &session_scope).await {
                Ok(()) => {
                    for event in registry.current_state_events() {
                        if let Some(event) = ClientEvent::from_state_change(event) {
                            self.emit(event);
                        }
                    }
                    self.inner.sessions.reset_connection_retry_timers();
                    self.spawn_dispatchers(registry_events, session_events, session_scope.clone());
                    info!(intersection = %self.inner.config.intersection_id(), "Client initialized");
                    self.emit(ClientEvent::Initialized);
                }
                Err(e) if e.is_cancelled() => debug!("Initialization cancelled"),
                Err(e) => {
                    if e.is_fatal() {
                        self.set_fatal(&e.to_string());
                    }
                    self.inner.sessions.end_active_session(false).await;
                }
            }
        }

        let expected = tokio::select! {
            expected = session.wait_ended() => expected,
            _ = session_scope.cancelled() => {
                self.inner.sessions.dispose_active_session();
                session.dispose();
                session.wait_ended().await
            }
        };
        session_scope.cancel();
        self.on_session_ended(&registry, expected);
    }

    fn on_session_ended(&self, registry: &Registry, expected: bool) {
        info!(expected, "Session ended");
        let max_errors = self.inner.config.application.max_session_error_count;
        let error_count = {
            let mut state = self.state();
            state.session = None;
            state.session_scope = None;
            if let Some(grace) = state.end_control.take() {
                grace.cancel();
            }
            if registry.session_control_state() == Some(ControlState::Error) {
                state.session_error_count += 1;
            }
            state.session_error_count
        };
        self.emit(ClientEvent::SessionEnded { expected });

        if error_count >= max_errors {
            self.set_fatal(&format!(
                "The session state was set to ControlState.Error {} times",
                error_count
            ));
        }
        if let Some(remote) = registry.session_application_type() {
            let local = self.inner.config.application_type();
            if remote != local {
                self.set_fatal(&format!(
                    "The application type is configured differently in the TLC: local {}, remote {}",
                    local, remote
                ));
            }
        }
    }

    fn spawn_dispatchers(
        &self,
        mut registry_events: mpsc::UnboundedReceiver<RegistryEvent>,
        mut session_events: broadcast::Receiver<SessionEvent>,
        scope: CancelScope,
    ) {
        let client = self.clone();
        let registry_scope = scope.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = registry_scope.cancelled() => break,
                    event = registry_events.recv() => match event {
                        Some(event) => client.on_registry_event(event).await,
                        None => break,
                    },
                }
            }
        });

        let client = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = scope.cancelled() => break,
                    event = session_events.recv() => match event {
                        Ok(SessionEvent::EventNotified(event)) => client.emit(ClientEvent::EventNotified(event)),
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Client missed session events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    // =========================================================================
    // Control Handover
    // =========================================================================

    async fn on_registry_event(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::SessionControlStateChanged { old, new } => {
                if let Err(e) = self.on_control_state_changed(old, new).await {
                    warn!(%new, error = %e, "Reacting to control state failed");
                }
            }
            other => {
                if let Some(event) = ClientEvent::from_state_change(other) {
                    self.emit(event);
                }
            }
        }
    }

    async fn on_control_state_changed(&self, old: Option<ControlState>, new: ControlState) -> ClientResult<()> {
        let Some(session) = self.current_session() else {
            return Ok(());
        };
        let registry = session.registry().clone();

        match new {
            ControlState::StartControl => {
                info!("Received signal to take control from TLC");
                self.emit(ClientEvent::StartControlRequestReceived);
            }
            ControlState::EndControl => {
                info!(
                    grace_secs = END_CONTROL_GRACE_SECS,
                    "Received signal to release control from TLC"
                );
                if old == Some(ControlState::InControl) && session.flags().intersection_control() {
                    let grace = self.inner.scope.child();
                    if let Some(previous) = self.state().end_control.replace(grace.clone()) {
                        previous.cancel();
                    }
                    self.emit(ClientEvent::EndControlRequestReceived);
                    let client = self.clone();
                    tokio::spawn(async move { client.finish_end_control(session, grace).await });
                }
            }
            ControlState::InControl => {
                registry.clear_requested();
                self.emit(ClientEvent::GotControl);

                let wanted = self.state().user_intersection_state;
                if let (Some(actual), Some(wanted)) = (registry.intersection_state(), wanted) {
                    let requested = registry.intersection_req_state();
                    if actual != IntersectionControlState::Control
                        && (requested.is_none() || (wanted != actual && Some(wanted) != requested))
                    {
                        session.set_intersection_req_state(wanted).await?;
                    }
                }
            }
            ControlState::Offline => {
                let wants_control = self.state().user_wants_control;
                if wants_control {
                    session.set_req_control_state(ControlState::ReadyToControl).await?;
                }
            }
            ControlState::Error | ControlState::NotConfigured | ControlState::ReadyToControl => {
                if registry.session_req_control_state() == Some(ControlState::InControl) {
                    warn!(%new, "Lost control unexpectedly");
                    self.emit(ClientEvent::LostControl { expected: false });
                }
            }
        }
        Ok(())
    }

    async fn finish_end_control(&self, session: Arc<ConnectionSession>, grace: CancelScope) {
        let started = Instant::now();
        tokio::select! {
            _ = grace.cancelled() => {
                info!(elapsed_secs = started.elapsed().as_secs_f64(), "Control was released");
            }
            _ = tokio::time::sleep(END_CONTROL_GRACE) => {
                error!(grace_secs = END_CONTROL_GRACE_SECS, "Control was not released in time; forcing end of control");
            }
        }
        if self.inner.scope.is_cancelled() {
            return;
        }

        let wants_control = {
            let mut state = self.state();
            if state.end_control.as_ref().map_or(false, |current| current.is_cancelled()) {
                state.end_control = None;
            }
            state.user_wants_control
        };
        let target = if wants_control {
            ControlState::ReadyToControl
        } else {
            ControlState::Offline
        };
        if let Err(e) = session.set_req_control_state(target).await {
            warn!(%target, error = %e, "Requesting control state after end of control failed");
        }
        self.emit(ClientEvent::LostControl { expected: true });
    }

    /// Confirms that control may be released after [`ClientEvent::EndControlRequestReceived`].
    pub fn confirm_end_control(&self) {
        match self.state().end_control.take() {
            Some(grace) => grace.cancel(),
            None => warn!("confirm_end_control called, but EndControl was not requested"),
        }
    }

    // =========================================================================
    // Control Requests
    // =========================================================================

    /// Asks the facility for control. [`ClientEvent::StartControlRequestReceived`]
    /// follows once it is granted.
    pub async fn request_session_start_control(&self) -> ClientResult<()> {
        let Some(session) = self.current_session() else {
            warn!("request_session_start_control: no active session");
            return Ok(());
        };
        let registry = session.registry();
        let kind = registry.session_application_type();
        if kind != Some(ApplicationType::Control) {
            warn!(application_type = ?kind, "Only control applications may request control");
            return Ok(());
        }
        if !session.flags().configured() {
            warn!("request_session_start_control: session is not configured yet");
            return Ok(());
        }

        debug!("Will request ReadyToControl once Offline");
        self.state().user_wants_control = true;
        if registry.session_control_state() == Some(ControlState::Offline) {
            session.set_req_control_state(ControlState::ReadyToControl).await?;
        }
        Ok(())
    }

    /// Asks the facility to end control.
    pub async fn request_session_end_control(&self) -> ClientResult<()> {
        let Some(session) = self.current_session() else {
            warn!("request_session_end_control: no active session");
            return Ok(());
        };
        let registry = session.registry();
        let kind = registry.session_application_type();
        if kind != Some(ApplicationType::Control) {
            warn!(application_type = ?kind, "Only control applications can have control");
            return Ok(());
        }
        if let Some(state) = registry.session_control_state() {
            if state != ControlState::InControl {
                warn!(%state, "request_session_end_control: session is not in control");
                return Ok(());
            }
        }

        self.state().user_wants_control = false;
        session.set_req_control_state(ControlState::EndControl).await
    }

    /// Requests a state for the controlled intersection.
    pub async fn set_intersection_req_control_state(&self, state: IntersectionControlState) -> ClientResult<()> {
        let Some(session) = self.current_session() else {
            warn!("set_intersection_req_control_state: no active session");
            return Ok(());
        };
        let registry = session.registry();
        let kind = registry.session_application_type();
        if kind != Some(ApplicationType::Control) {
            warn!(application_type = ?kind, "Only control applications may set the intersection state");
            return Ok(());
        }
        if let Some(control) = registry.session_control_state() {
            if control != ControlState::InControl {
                warn!(%control, "set_intersection_req_control_state: session is not in control");
                return Ok(());
            }
        }

        self.state().user_intersection_state = Some(state);
        debug!(%state, "Setting requested intersection state");
        session.set_intersection_req_state(state).await
    }

    fn controls_intersection(registry: &Registry) -> bool {
        registry
            .session_control_state()
            .map_or(false, ControlState::is_controlling)
            && registry.intersection_state() == Some(IntersectionControlState::Control)
    }

    /// Requests a signal group state. Sent with the next flush.
    pub fn set_signal_group_req_state(&self, id: &str, state: SignalGroupState) -> ClientResult<()> {
        if !self.inner.config.is_control_application() {
            warn!("set_signal_group_req_state may only be called by control applications");
            return Ok(());
        }
        let session = self.require_session()?;
        let registry = session.registry();
        registry.signal_group_state(id)?;
        if !Self::controls_intersection(registry) {
            warn!(signal_group = id, "Not in control of intersection; may not set signal group state");
            return Ok(());
        }
        registry.request_signal_group_state(id, state)?;
        Ok(())
    }

    /// Requests signal group predictions. Sent with the next flush.
    pub fn set_signal_group_req_predictions(&self, id: &str, predictions: Vec<Prediction>) -> ClientResult<()> {
        if !self.inner.config.is_control_application() {
            warn!("set_signal_group_req_predictions may only be called by control applications");
            return Ok(());
        }
        let session = self.require_session()?;
        let registry = session.registry();
        registry.signal_group_state(id)?;
        if !Self::controls_intersection(registry) {
            warn!(signal_group = id, "Not in control of intersection; may not set predictions");
            return Ok(());
        }
        registry.request_signal_group_predictions(id, predictions)?;
        Ok(())
    }

    /// Requests an output state. Sent with the next flush.
    pub fn set_output_req_state(&self, id: &str, state: i64) -> ClientResult<()> {
        let kind = self.inner.config.application_type();
        if kind == ApplicationType::Consumer {
            warn!("set_output_req_state may only be called by control or provider applications");
            return Ok(());
        }
        let session = self.require_session()?;
        let registry = session.registry();
        if registry.output_is_exclusive(id)? {
            if kind == ApplicationType::Provider {
                warn!(output = id, "Output is exclusive; only control applications may set it");
                return Ok(());
            }
            if !Self::controls_intersection(registry) {
                warn!(output = id, "Output is exclusive; may only be set when in control of intersection");
                return Ok(());
            }
        }
        registry.request_output_state(id, state)?;
        Ok(())
    }

    /// Requests a variable value. Sent with the next flush.
    pub fn set_variable_req_state(&self, id: &str, value: i64, lifetime: i64) -> ClientResult<()> {
        if self.inner.config.application_type() == ApplicationType::Consumer {
            warn!("set_variable_req_state may only be called by control or provider applications");
            return Ok(());
        }
        let session = self.require_session()?;
        let registry = session.registry();
        registry.variable_value(id)?;
        registry.request_variable_state(id, value, lifetime)?;
        Ok(())
    }

    pub async fn notify_event(&self, event: &ObjectEvent) -> ClientResult<()> {
        self.require_session()?.proxy()?.notify_event(event).await
    }

    // =========================================================================
    // State Flush
    // =========================================================================

    fn begin_flush(&self) -> Option<(Arc<ConnectionSession>, ObjectStateUpdateGroup, FlushGuard)> {
        let session = self.current_session()?;
        if self.inner.flushing.swap(true, Ordering::SeqCst) {
            warn!("Previous state update still in flight; skipping this one");
            return None;
        }
        let guard = FlushGuard(self.inner.flushing.clone());
        let update = session.registry().take_update_group()?;
        Some((session, update, guard))
    }

    /// Sends everything requested since the last flush, in the background.
    /// Never blocks.
    pub fn update_state(&self) {
        let Some((session, update, guard)) = self.begin_flush() else {
            return;
        };
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = session.send_update(&update).await {
                warn!(error = %e, "UpdateState failed");
            }
        });
    }

    /// Like [`update_state`](Self::update_state) but waits for the reply.
    /// Returns whether anything was sent.
    pub async fn flush(&self) -> ClientResult<bool> {
        let Some((session, update, _guard)) = self.begin_flush() else {
            return Ok(false);
        };
        session.send_update(&update).await?;
        Ok(true)
    }

    /// Releases control if held, deregisters and stops the session loop.
    /// The client cannot be started again afterwards.
    pub async fn end_session(&self) {
        if self.session_in_control() {
            info!("Ending session while in control; requesting end of control first");
            if let Err(e) = self.request_session_end_control().await {
                warn!(error = %e, "Requesting end of control failed");
            }
        }
        self.inner.sessions.end_active_session(true).await;
        let session_scope = self.state().session_scope.take();
        if let Some(scope) = session_scope {
            scope.cancel();
        }
        self.inner.scope.cancel();
        self.inner.sessions.dispose_active_session();
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn cancel_scope(&self) -> &CancelScope {
        &self.inner.scope
    }

    /// The registry of the current session.
    pub fn registry(&self) -> Option<Arc<Registry>> {
        self.current_session().map(|s| s.registry().clone())
    }

    pub fn has_fatal_error(&self) -> bool {
        self.inner.fatal.load(Ordering::SeqCst)
    }

    pub fn connection_tries(&self) -> u32 {
        self.inner.sessions.connection_tries()
    }

    pub fn is_connected(&self) -> bool {
        self.current_session().map_or(false, |s| s.is_connected())
    }

    pub fn is_configured(&self) -> bool {
        self.current_session().map_or(false, |s| s.flags().configured())
    }

    pub fn session_in_control(&self) -> bool {
        self.current_session().map_or(false, |s| s.flags().session_control())
    }

    pub fn intersection_in_control(&self) -> bool {
        self.current_session().map_or(false, |s| s.flags().intersection_control())
    }

    pub fn systems_alive(&self) -> bool {
        self.current_session().map_or(false, |s| s.flags().systems_alive())
    }

    /// While false, no Alive messages are sent to the facility.
    pub fn set_systems_alive(&self, alive: bool) {
        if let Some(session) = self.current_session() {
            session.flags().set_systems_alive(alive);
        }
    }

    /// Average confirmation time of requests, in ticks.
    pub fn avg_response_time(&self) -> f64 {
        self.registry().map_or(0.0, |r| r.avg_response_time())
    }

    pub fn get_signal_group_state(&self, id: &str) -> ClientResult<Option<SignalGroupState>> {
        Ok(self.require_session()?.registry().signal_group_state(id)?)
    }

    pub fn get_detector_state(&self, id: &str) -> ClientResult<Option<DetectorState>> {
        Ok(self.require_session()?.registry().detector_state(id)?)
    }

    pub fn get_input_state(&self, id: &str) -> ClientResult<Option<i32>> {
        Ok(self.require_session()?.registry().input_state(id)?)
    }

    pub fn get_output_state(&self, id: &str) -> ClientResult<Option<i32>> {
        Ok(self.require_session()?.registry().output_state(id)?)
    }

    pub fn get_variable_value(&self, id: &str) -> ClientResult<Option<i32>> {
        Ok(self.require_session()?.registry().variable_value(id)?)
    }

    pub fn get_intersection_state(&self, id: &str) -> ClientResult<Option<IntersectionControlState>> {
        Ok(self.require_session()?.registry().intersection_state_of(id)?)
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for [`TlcfiClient`]; every collaborator can be swapped.
pub struct TlcfiClientBuilder {
    config: ClientConfig,
    sessions: Option<Arc<dyn SessionSource>>,
    initializer: Option<Arc<dyn SessionInitializer>>,
    emitter: Option<Arc<dyn ClientEventEmitter>>,
    clock: Option<Arc<TicksClock>>,
    scope: Option<CancelScope>,
}

impl TlcfiClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        TlcfiClientBuilder {
            config,
            sessions: None,
            initializer: None,
            emitter: None,
            clock: None,
            scope: None,
        }
    }

    pub fn with_session_source(mut self, sessions: Arc<dyn SessionSource>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_initializer(mut self, initializer: Arc<dyn SessionInitializer>) -> Self {
        self.initializer = Some(initializer);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn ClientEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn with_clock(mut self, clock: Arc<TicksClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Cancelling this scope stops the session loop.
    pub fn with_cancel_scope(mut self, scope: CancelScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn build(self) -> ClientResult<TlcfiClient> {
        self.config.validate()?;

        let config = self.config;
        let sessions = self.sessions.unwrap_or_else(|| {
            Arc::new(SessionManager::new(
                config.remote.socket_address(),
                Arc::new(TcpConnector),
                config.timing.clone(),
            ))
        });
        let initializer = self
            .initializer
            .unwrap_or_else(|| Arc::new(ClientInitializer::new(config.clone())));

        Ok(TlcfiClient {
            inner: Arc::new(ClientInner {
                sessions,
                initializer,
                emitter: self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter)),
                clock: self.clock.unwrap_or_else(|| Arc::new(TicksClock::monotonic())),
                scope: self.scope.unwrap_or_default(),
                state: Mutex::new(ClientState::default()),
                running: AtomicBool::new(false),
                fatal: AtomicBool::new(false),
                flushing: Arc::new(AtomicBool::new(false)),
                config,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimingConfig;
    use crate::test_support::{MockChannel, MockConnector};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tlcfi_core::objects::{Intersection, Output, Session, SignalGroup};
    use tlcfi_core::{ObjectType, TlcObject};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ClientEvent>>);

    impl Recorder {
        fn events(&self) -> Vec<ClientEvent> {
            self.0.lock().unwrap().clone()
        }

        fn contains(&self, event: &ClientEvent) -> bool {
            self.events().contains(event)
        }
    }

    impl ClientEventEmitter for Recorder {
        fn emit(&self, event: &ClientEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    /// Hands out one session on a prepared channel with a fixed object set.
    struct FixedSource {
        connector: Arc<MockConnector>,
        application_type: ApplicationType,
    }

    #[async_trait]
    impl SessionSource for FixedSource {
        async fn get_new_session(
            &self,
            registry: Arc<Registry>,
            scope: &CancelScope,
        ) -> Option<Arc<ConnectionSession>> {
            registry.add(TlcObject::Session(Session::new("s1", self.application_type)));
            registry.add(TlcObject::Intersection(Intersection {
                id: "K205195".into(),
                signalgroups: vec!["02".into()],
                outputs: vec!["o1".into()],
                ..Default::default()
            }));
            registry.add(TlcObject::SignalGroup(SignalGroup::new("02")));
            registry.add(TlcObject::Output(Output::new("o1")));
            registry.add(TlcObject::Output(Output::new("o2")));
            registry.initialize("K205195").ok()?;

            let session = ConnectionSession::new(
                "127.0.0.1:11501",
                self.connector.clone(),
                registry,
                TimingConfig::default(),
                scope.child(),
            );
            session.start(Duration::from_secs(1)).await.ok()?;
            Some(session)
        }

        fn reset_connection_retry_timers(&self) {}

        async fn end_active_session(&self, _expected: bool) {}

        fn dispose_active_session(&self) {}

        fn connection_tries(&self) -> u32 {
            1
        }
    }

    struct MarkConfigured;

    #[async_trait]
    impl SessionInitializer for MarkConfigured {
        async fn initialize(&self, session: &Arc<ConnectionSession>, _scope: &CancelScope) -> ClientResult<()> {
            session.flags().set_registered(true);
            session.flags().set_configured(true);
            Ok(())
        }
    }

    struct Harness {
        client: TlcfiClient,
        channel: Arc<MockChannel>,
        connector: Arc<MockConnector>,
        events: Arc<Recorder>,
    }

    impl Harness {
        async fn start(application_type: ApplicationType) -> Self {
            let channel = MockChannel::echo();
            let connector = MockConnector::with_channel(channel.clone());
            let events = Arc::new(Recorder::default());

            let mut config = ClientConfig::new();
            config.application.application_type = application_type;
            config.application.intersection_id = "K205195".into();
            config.application.register_delay_ms = 0;
            config.application.auto_reconnect = false;

            let client = TlcfiClient::builder(config)
                .with_session_source(Arc::new(FixedSource {
                    connector: connector.clone(),
                    application_type,
                }))
                .with_initializer(Arc::new(MarkConfigured))
                .with_emitter(events.clone())
                .with_clock(Arc::new(TicksClock::manual(0)))
                .build()
                .unwrap();

            let runner = client.clone();
            tokio::spawn(async move { runner.start_session().await });
            let harness = Harness {
                client,
                channel,
                connector,
                events,
            };
            harness.until(|h| h.events.contains(&ClientEvent::Initialized)).await;
            harness
        }

        async fn until(&self, condition: impl Fn(&Harness) -> bool) {
            for _ in 0..200 {
                if condition(self) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("condition not reached");
        }

        async fn tlc_update(&self, object_type: ObjectType, id: &str, state: Value) {
            self.connector
                .handler()
                .handle(
                    "UpdateState",
                    json!({
                        "update": [{ "objects": { "type": object_type, "ids": [id] }, "states": [state] }],
                        "ticks": 1
                    }),
                )
                .await
                .unwrap();
        }

        async fn take_control(&self) {
            let registry = self.client.registry().unwrap();
            registry.request_session_control_state(ControlState::InControl);
            self.tlc_update(ObjectType::Session, "s1", json!({ "controlState": 5 })).await;
            self.tlc_update(ObjectType::Intersection, "K205195", json!({ "state": 7 })).await;
            self.until(|h| h.events.contains(&ClientEvent::GotControl)).await;
        }
    }

    #[tokio::test]
    async fn test_session_start_reported_before_initialized() {
        let h = Harness::start(ApplicationType::Control).await;
        let events = h.events.events();
        assert_eq!(
            events.first(),
            Some(&ClientEvent::SessionStarted {
                remote: "127.0.0.1:11501".into()
            })
        );
        let started = events.iter().position(|e| matches!(e, ClientEvent::SessionStarted { .. }));
        let initialized = events.iter().position(|e| *e == ClientEvent::Initialized);
        assert!(started < initialized);
    }

    #[tokio::test]
    async fn test_signal_group_request_needs_control() {
        let h = Harness::start(ApplicationType::Control).await;
        let registry = h.client.registry().unwrap();

        h.client
            .set_signal_group_req_state("02", SignalGroupState::ProtectedMovementAllowed)
            .unwrap();
        assert_eq!(registry.dirty_count(), 0);

        let err = h
            .client
            .set_signal_group_req_state("99", SignalGroupState::ProtectedMovementAllowed)
            .unwrap_err();
        assert!(matches!(err, ClientError::Core(tlcfi_core::CoreError::ObjectNotFound { .. })));

        h.take_control().await;
        assert!(h.client.session_in_control());
        assert!(h.client.intersection_in_control());

        h.client
            .set_signal_group_req_state("02", SignalGroupState::ProtectedMovementAllowed)
            .unwrap();
        assert_eq!(registry.dirty_count(), 1);

        assert!(h.client.flush().await.unwrap());
        assert!(!h.client.flush().await.unwrap());
        let updates = h.channel.calls_of("UpdateState");
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["update"][0]["objects"]["ids"], json!(["02"]));
        assert_eq!(updates[0]["update"][0]["states"][0]["reqState"], 6);
    }

    #[tokio::test]
    async fn test_exclusive_outputs_need_control() {
        let h = Harness::start(ApplicationType::Control).await;
        let registry = h.client.registry().unwrap();

        h.client.set_output_req_state("o1", 1).unwrap();
        assert_eq!(registry.dirty_count(), 0);
        h.client.set_output_req_state("o2", 1).unwrap();
        assert_eq!(registry.dirty_count(), 1);
    }

    #[tokio::test]
    async fn test_provider_may_not_set_exclusive_output() {
        let h = Harness::start(ApplicationType::Provider).await;
        let registry = h.client.registry().unwrap();

        h.client.set_output_req_state("o1", 1).unwrap();
        h.client.set_output_req_state("o2", 1).unwrap();
        assert_eq!(registry.dirty_count(), 1);

        h.client.request_session_start_control().await.unwrap();
        assert!(h.channel.calls_of("UpdateState").is_empty());
    }

    #[tokio::test]
    async fn test_consumer_may_not_set_outputs() {
        let h = Harness::start(ApplicationType::Consumer).await;
        h.client.set_output_req_state("o2", 1).unwrap();
        assert_eq!(h.client.registry().unwrap().dirty_count(), 0);
    }

    #[tokio::test]
    async fn test_start_control_requests_ready_to_control_when_offline() {
        let h = Harness::start(ApplicationType::Control).await;
        h.tlc_update(ObjectType::Session, "s1", json!({ "controlState": 2 })).await;

        h.client.request_session_start_control().await.unwrap();
        let updates = h.channel.calls_of("UpdateState");
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["update"][0]["states"][0]["reqControlState"], 3);
    }

    #[tokio::test]
    async fn test_state_changes_forwarded() {
        let h = Harness::start(ApplicationType::Control).await;
        h.tlc_update(ObjectType::SignalGroup, "02", json!({ "state": 3 })).await;
        h.until(|h| {
            h.events.contains(&ClientEvent::SignalGroupStateChanged {
                id: "02".into(),
                state: SignalGroupState::StopAndRemain,
            })
        })
        .await;
        assert_eq!(
            h.client.get_signal_group_state("02").unwrap(),
            Some(SignalGroupState::StopAndRemain)
        );
        assert!(h.client.get_detector_state("d1").is_err());
    }

    #[tokio::test]
    async fn test_end_control_confirmed_by_application() {
        let h = Harness::start(ApplicationType::Control).await;
        h.take_control().await;

        h.tlc_update(ObjectType::Session, "s1", json!({ "controlState": 6 })).await;
        h.until(|h| h.events.contains(&ClientEvent::EndControlRequestReceived)).await;

        h.client.confirm_end_control();
        h.until(|h| h.events.contains(&ClientEvent::LostControl { expected: true })).await;

        let requested: Vec<Value> = h
            .channel
            .calls_of("UpdateState")
            .iter()
            .map(|u| u["update"][0]["states"][0]["reqControlState"].clone())
            .collect();
        // Confirmation of EndControl, then back to Offline.
        assert_eq!(requested, vec![json!(6), json!(2)]);
    }

    #[tokio::test]
    async fn test_unexpected_loss_of_control() {
        let h = Harness::start(ApplicationType::Control).await;
        h.take_control().await;

        h.tlc_update(ObjectType::Session, "s1", json!({ "controlState": 3 })).await;
        h.until(|h| h.events.contains(&ClientEvent::LostControl { expected: false })).await;
        assert!(!h.client.session_in_control());
    }

    #[tokio::test]
    async fn test_session_end_is_reported() {
        let h = Harness::start(ApplicationType::Control).await;
        h.channel.disconnect();
        h.until(|h| h.events.contains(&ClientEvent::SessionEnded { expected: false })).await;
        assert!(!h.client.is_connected());
        assert!(h.client.registry().is_none());
    }
}
