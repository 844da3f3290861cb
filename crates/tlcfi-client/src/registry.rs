//! # Object Registry
//!
//! Thread-safe wrapper around one session's [`ObjectStore`]. It tracks which
//! objects carry local requests (the dirty set), measures how long the
//! facility takes to confirm them, and reports remote state changes on a
//! bounded channel.
//!
//! ## Data Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  client API ──► request_*() ──┐                                        │
//! │                               ▼                                         │
//! │                  ┌──────────────────────────┐                           │
//! │                  │  Mutex<RegistryInner>    │                           │
//! │                  │  • ObjectStore           │                           │
//! │                  │  • dirty: Vec<ObjectKey> │ ──► take_update_group()   │
//! │                  │  • requested: key→ticks  │     (UpdateState flush)   │
//! │                  │  • LatencyWindow         │                           │
//! │                  └──────────────────────────┘                           │
//! │                               ▲                                         │
//! │  inbound UpdateState ─────────┘ apply_remote_update()                  │
//! │                               │                                         │
//! │                               ▼                                         │
//! │                 mpsc<RegistryEvent> ──► client event dispatcher         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Pending request keys are `<prefix><id>`: `sg` signal group state, `pr`
//! signal group predictions, `os` output state, `va` variable value.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tlcfi_core::objects::SessionStateData;
use tlcfi_core::{
    is_transition_ok, ApplicationType, ControlState, CoreError, CoreResult, DetectorState,
    HandoverCapability, IntersectionControlState, LatencyWindow, ObjectKey, ObjectReference,
    ObjectStore, ObjectType, Prediction, SignalGroupState, StoreSummary, TicksClock, TlcObject,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{ObjectData, ObjectMeta, ObjectStateUpdate, ObjectStateUpdateGroup};


const PREFIX_SIGNAL_GROUP: &str = "sg";
const PREFIX_PREDICTIONS: &str = "pr";
const PREFIX_OUTPUT: &str = "os";
const PREFIX_VARIABLE: &str = "va";

/// Remote state changes, in the order they were applied.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    SessionControlStateChanged {
        old: Option<ControlState>,
        new: ControlState,
    },
    IntersectionStateChanged {
        id: String,
        state: IntersectionControlState,
    },
    SignalGroupStateChanged {
        id: String,
        state: SignalGroupState,
    },
    DetectorStateChanged {
        id: String,
        state: DetectorState,
    },
    InputStateChanged {
        id: String,
        state: i32,
    },
    OutputStateChanged {
        id: String,
        state: i32,
    },
    VariableChanged {
        id: String,
        value: i32,
    },
}

impl RegistryEvent {
    /// The change event for an object's current actual state, if it has one.
    fn for_object(object: &TlcObject) -> Option<Self> {
        let id = object.id().to_string();
        match object {
            TlcObject::Intersection(o) => o
                .state()
                .map(|state| RegistryEvent::IntersectionStateChanged { id, state }),
            TlcObject::SignalGroup(o) => o
                .state()
                .map(|state| RegistryEvent::SignalGroupStateChanged { id, state }),
            TlcObject::Detector(o) => o
                .state()
                .map(|state| RegistryEvent::DetectorStateChanged { id, state }),
            TlcObject::Input(o) => o
                .state()
                .map(|state| RegistryEvent::InputStateChanged { id, state }),
            TlcObject::Output(o) => o
                .state()
                .map(|state| RegistryEvent::OutputStateChanged { id, state }),
            TlcObject::Variable(o) => o
                .value()
                .map(|value| RegistryEvent::VariableChanged { id, value }),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct RegistryInner {
    store: ObjectStore,
    dirty: Vec<ObjectKey>,
    requested: HashMap<String, u32>,
    latency: LatencyWindow,
}

impl RegistryInner {
    fn mark_dirty(&mut self, key: ObjectKey) {
        if !self.dirty.contains(&key) {
            self.dirty.push(key);
        }
    }

    /// Records a local request for later latency measurement.
    fn track_request(&mut self, key: String, already_in_state: bool, ticks: u32) {
        if self.requested.remove(&key).is_some() {
            warn!(request = %key, "Previous request was not confirmed yet; replacing it");
        }
        if already_in_state {
            warn!(request = %key, "Object is already in the requested state");
        } else {
            self.requested.insert(key, ticks);
        }
    }

    fn confirm_request(&mut self, key: &str, now: u32) {
        if let Some(requested_at) = self.requested.remove(key) {
            let elapsed = tlcfi_core::ticks::elapsed(requested_at, now);
            let average = self.latency.push(elapsed);
            debug!(request = key, elapsed, average, "Request confirmed");
        }
    }
}

/// Object registry of one session.
#[derive(Debug)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
    clock: Arc<TicksClock>,
    events: mpsc::UnboundedSender<RegistryEvent>,
}

impl Registry {
    /// Creates an empty registry plus the receiving end of its events.
    ///
    /// The event channel is unbounded: control state changes must reach the
    /// client even behind a burst of object updates.
    pub fn new(clock: Arc<TicksClock>) -> (Arc<Self>, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = Registry {
            inner: Mutex::new(RegistryInner {
                store: ObjectStore::new(),
                dirty: Vec::new(),
                requested: HashMap::new(),
                latency: LatencyWindow::default(),
            }),
            clock,
            events,
        };
        (Arc::new(registry), rx)
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: RegistryEvent) {
        if self.events.send(event).is_err() {
            debug!("No receiver for registry events");
        }
    }

    pub fn clock(&self) -> &Arc<TicksClock> {
        &self.clock
    }

    /// Read access to the store for queries that need several objects.
    pub fn with_store<R>(&self, f: impl FnOnce(&ObjectStore) -> R) -> R {
        f(&self.lock().store)
    }

    // =========================================================================
    // Population
    // =========================================================================

    pub fn add(&self, object: TlcObject) {
        self.lock().store.add(object);
    }

    /// Adds every object described by a ReadMeta reply.
    pub fn add_from_meta(&self, meta: &ObjectMeta) -> CoreResult<usize> {
        let objects = meta
            .meta
            .iter()
            .map(|m| TlcObject::from_meta(meta.objects.object_type, m))
            .collect::<CoreResult<Vec<_>>>()?;
        let count = objects.len();
        let mut inner = self.lock();
        for object in objects {
            inner.store.add(object);
        }
        Ok(count)
    }

    pub fn initialize(&self, intersection_id: &str) -> CoreResult<StoreSummary> {
        self.lock().store.initialize(intersection_id)
    }

    /// Copies the initial state of a Subscribe reply without raising events.
    pub fn seed_state(&self, data: &ObjectData) -> CoreResult<()> {
        let ticks = self.clock.ticks();
        let object_type = data.objects.object_type;
        let mut inner = self.lock();
        for (id, state) in data.objects.ids.iter().zip(&data.data) {
            let object = inner
                .store
                .find_mut(object_type, id)
                .ok_or_else(|| CoreError::not_found(object_type, id.as_str()))?;
            object.copy_state(state, ticks)?;
            if object_type != ObjectType::Session {
                object.reset_changed();
            }
        }
        Ok(())
    }

    // =========================================================================
    // Remote Updates
    // =========================================================================

    /// Applies one entry of an inbound UpdateState to a non-session object.
    ///
    /// Returns whether the object's actual state changed.
    pub fn apply_remote_update(&self, object_type: ObjectType, id: &str, state: &Value) -> CoreResult<bool> {
        let now = self.clock.ticks();
        let mut inner = self.lock();
        let key = ObjectKey::new(object_type, id);
        let pending_flush = inner.dirty.contains(&key);

        let object = inner
            .store
            .find_mut(object_type, id)
            .ok_or_else(|| CoreError::not_found(object_type, id))?;
        let changed = object.copy_state(state, now)?;
        let event = if changed {
            RegistryEvent::for_object(object)
        } else {
            None
        };
        if !pending_flush {
            object.reset_changed();
        }

        match object_type {
            ObjectType::SignalGroup => {
                if changed {
                    inner.confirm_request(&format!("{}{}", PREFIX_SIGNAL_GROUP, id), now);
                }
                if state.get("predictions").is_some() {
                    inner.confirm_request(&format!("{}{}", PREFIX_PREDICTIONS, id), now);
                }
            }
            ObjectType::Output if changed => {
                inner.confirm_request(&format!("{}{}", PREFIX_OUTPUT, id), now)
            }
            ObjectType::Variable if changed => {
                inner.confirm_request(&format!("{}{}", PREFIX_VARIABLE, id), now)
            }
            _ => {}
        }
        drop(inner);

        if let Some(event) = event {
            self.emit(event);
        }
        Ok(changed)
    }

    /// Applies an inbound session state and returns the previous control state.
    ///
    /// Illegal transitions are logged and applied anyway.
    pub fn apply_session_update(&self, data: SessionStateData) -> CoreResult<Option<ControlState>> {
        let ticks = self.clock.ticks();
        let new = data.control_state;
        let old = {
            let mut inner = self.lock();
            let session = inner
                .store
                .session_mut()
                .ok_or_else(|| CoreError::not_found(ObjectType::Session, ""))?;
            let old = session.control_state();
            session.copy_state(data, ticks)?;
            old
        };

        if let Some(new) = new {
            if let Some(old) = old {
                if !is_transition_ok(old, new) {
                    warn!(%old, %new, "Illegal control state transition reported by TLC");
                }
            }
            self.emit(RegistryEvent::SessionControlStateChanged { old, new });
        }
        Ok(old)
    }

    // =========================================================================
    // Local Requests
    // =========================================================================

    pub fn request_signal_group_state(&self, id: &str, state: SignalGroupState) -> CoreResult<()> {
        let ticks = self.clock.ticks();
        let mut inner = self.lock();
        let group = inner.store.signal_group_mut(id)?;
        let already = group.state() == Some(state);
        group.set_req_state(state, ticks);
        inner.track_request(format!("{}{}", PREFIX_SIGNAL_GROUP, id), already, ticks);
        inner.mark_dirty(ObjectKey::new(ObjectType::SignalGroup, id));
        Ok(())
    }

    pub fn request_signal_group_predictions(&self, id: &str, predictions: Vec<Prediction>) -> CoreResult<()> {
        let ticks = self.clock.ticks();
        let mut inner = self.lock();
        inner.store.signal_group_mut(id)?.set_req_predictions(predictions, ticks)?;
        inner.track_request(format!("{}{}", PREFIX_PREDICTIONS, id), false, ticks);
        inner.mark_dirty(ObjectKey::new(ObjectType::SignalGroup, id));
        Ok(())
    }

    pub fn request_output_state(&self, id: &str, value: i64) -> CoreResult<()> {
        let ticks = self.clock.ticks();
        let mut inner = self.lock();
        let output = inner.store.output_mut(id)?;
        let already = output.state().map(i64::from) == Some(value);
        output.set_req_state(value, ticks)?;
        inner.track_request(format!("{}{}", PREFIX_OUTPUT, id), already, ticks);
        inner.mark_dirty(ObjectKey::new(ObjectType::Output, id));
        Ok(())
    }

    pub fn request_variable_state(&self, id: &str, value: i64, lifetime: i64) -> CoreResult<()> {
        let ticks = self.clock.ticks();
        let mut inner = self.lock();
        let variable = inner.store.variable_mut(id)?;
        let already = variable.value().map(i64::from) == Some(value);
        variable.set_req(value, lifetime)?;
        inner.track_request(format!("{}{}", PREFIX_VARIABLE, id), already, ticks);
        inner.mark_dirty(ObjectKey::new(ObjectType::Variable, id));
        Ok(())
    }

    /// Stores the handover parameters of a control session locally.
    ///
    /// They travel with the next session control state request.
    pub fn prepare_control_session(
        &self,
        start: HandoverCapability,
        end: HandoverCapability,
        intersection_id: &str,
    ) -> CoreResult<()> {
        let ticks = self.clock.ticks();
        let mut inner = self.lock();
        let session = inner
            .store
            .session_mut()
            .ok_or_else(|| CoreError::not_found(ObjectType::Session, ""))?;
        session.set_req_control_state(ControlState::Error, ticks);
        session.start_capability.set(start);
        session.end_capability.set(end);
        session.set_req_intersection(intersection_id)
    }

    /// Sets the requested session control state.
    ///
    /// Returns the update to send right away, or `None` when the state was
    /// already requested.
    pub fn request_session_control_state(&self, state: ControlState) -> Option<ObjectStateUpdateGroup> {
        let ticks = self.clock.ticks();
        let mut inner = self.lock();
        let session = inner.store.session_mut()?;
        if session.req_control_state() == Some(state) {
            return None;
        }
        session.set_req_control_state(state, ticks);
        let key = ObjectKey::new(ObjectType::Session, session.id.as_str());
        single_update(&mut inner, &key, ticks)
    }

    /// Sets the requested state of the controlled intersection.
    pub fn request_intersection_state(&self, state: IntersectionControlState) -> Option<ObjectStateUpdateGroup> {
        let ticks = self.clock.ticks();
        let mut inner = self.lock();
        let intersection = inner.store.controlled_intersection_mut()?;
        if intersection.req_state() == Some(state) {
            return None;
        }
        intersection.set_req_state(state, ticks);
        let key = ObjectKey::new(ObjectType::Intersection, intersection.id.as_str());
        single_update(&mut inner, &key, ticks)
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Takes the dirty set and builds one batched update, grouped by type.
    ///
    /// Changed flags of every included object are reset. Returns `None` when
    /// nothing is pending.
    pub fn take_update_group(&self) -> Option<ObjectStateUpdateGroup> {
        let ticks = self.clock.ticks();
        let mut inner = self.lock();
        if inner.dirty.is_empty() {
            return None;
        }
        let keys = std::mem::take(&mut inner.dirty);

        let mut update: Vec<ObjectStateUpdate> = Vec::new();
        for key in keys {
            let Some(object) = inner.store.get_mut(&key) else {
                warn!(object = %key, "Dirty object vanished from registry");
                continue;
            };
            let state = object.get_state(false);
            object.reset_changed();
            if state.as_object().map_or(true, |m| m.is_empty()) {
                continue;
            }

            match update.iter_mut().find(|u| u.objects.object_type == key.object_type) {
                Some(entry) => {
                    entry.objects.ids.push(key.id);
                    entry.states.push(state);
                }
                None => update.push(ObjectStateUpdate {
                    objects: ObjectReference::new(key.object_type, vec![key.id]),
                    states: vec![state],
                }),
            }
        }

        (!update.is_empty()).then_some(ObjectStateUpdateGroup { update, ticks })
    }

    pub fn dirty_count(&self) -> usize {
        self.lock().dirty.len()
    }

    /// Forgets every pending request, e.g. when control is (re)gained.
    pub fn clear_requested(&self) {
        self.lock().requested.clear();
    }

    pub fn pending_request_count(&self) -> usize {
        self.lock().requested.len()
    }

    /// Average confirmation time in ticks over the last samples.
    pub fn avg_response_time(&self) -> f64 {
        self.lock().latency.average()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn is_initialized(&self) -> bool {
        self.lock().store.is_initialized()
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock().store.session().map(|s| s.id.clone())
    }

    pub fn session_application_type(&self) -> Option<ApplicationType> {
        self.lock().store.session().map(|s| s.application_type)
    }

    pub fn session_control_state(&self) -> Option<ControlState> {
        self.lock().store.session().and_then(|s| s.control_state())
    }

    pub fn session_req_control_state(&self) -> Option<ControlState> {
        self.lock().store.session().and_then(|s| s.req_control_state())
    }

    pub fn controlled_intersection_id(&self) -> Option<String> {
        self.lock().store.controlled_intersection().map(|i| i.id.clone())
    }

    pub fn intersection_state(&self) -> Option<IntersectionControlState> {
        self.lock().store.controlled_intersection().and_then(|i| i.state())
    }

    pub fn intersection_req_state(&self) -> Option<IntersectionControlState> {
        self.lock().store.controlled_intersection().and_then(|i| i.req_state())
    }

    pub fn intersection_state_of(&self, id: &str) -> CoreResult<Option<IntersectionControlState>> {
        Ok(self.lock().store.intersection(id)?.state())
    }

    pub fn signal_group_state(&self, id: &str) -> CoreResult<Option<SignalGroupState>> {
        Ok(self.lock().store.signal_group(id)?.state())
    }

    pub fn detector_state(&self, id: &str) -> CoreResult<Option<DetectorState>> {
        Ok(self.lock().store.detector(id)?.state())
    }

    pub fn input_state(&self, id: &str) -> CoreResult<Option<i32>> {
        Ok(self.lock().store.input(id)?.state())
    }

    pub fn output_state(&self, id: &str) -> CoreResult<Option<i32>> {
        Ok(self.lock().store.output(id)?.state())
    }

    pub fn output_is_exclusive(&self, id: &str) -> CoreResult<bool> {
        Ok(self.lock().store.output(id)?.exclusive)
    }

    pub fn variable_value(&self, id: &str) -> CoreResult<Option<i32>> {
        Ok(self.lock().store.variable(id)?.value())
    }

    /// Change events for the current state of every signal group, detector,
    /// input and output, in store order.
    pub fn current_state_events(&self) -> Vec<RegistryEvent> {
        self.lock()
            .store
            .iter()
            .filter(|o| {
                matches!(
                    o.object_type(),
                    ObjectType::SignalGroup | ObjectType::Detector | ObjectType::Input | ObjectType::Output
                )
            })
            .filter_map(RegistryEvent::for_object)
            .collect()
    }
}

/// Builds an update carrying one object and resets its changed flags.
fn single_update(inner: &mut RegistryInner, key: &ObjectKey, ticks: u32) -> Option<ObjectStateUpdateGroup> {
    let object = inner.store.get_mut(key)?;
    let state = object.get_state(false);
    object.reset_changed();
    inner.dirty.retain(|k| k != key);
    Some(ObjectStateUpdateGroup {
        update: vec![ObjectStateUpdate {
            objects: ObjectReference::single(key.object_type, key.id.as_str()),
            states: vec![state],
        }],
        ticks,
    })
}
