//! # Protocol Objects
//!
//! Every TLC-FI object as a variant of one closed enum, [`TlcObject`], with
//! per-field dirty tracking.
//!
//! ## Dirty Tracking
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Field Lifecycle                                    │
//! │                                                                         │
//! │   set_req_state(x)            get_state(false)          reset_changed() │
//! │  ┌──────────────┐           ┌──────────────────┐      ┌──────────────┐ │
//! │  │ value = x    │──────────►│ { "reqState": x }│─────►│ changed=false│ │
//! │  │ changed=true │           │ (flag untouched) │      │              │ │
//! │  └──────────────┘           └──────────────────┘      └──────────────┘ │
//! │                                                                         │
//! │  get_state(true)  → stateticks + every changed field (facility view)   │
//! │  get_state(false) → changed req* fields only (what the client sends)   │
//! │  copy_state(data) → merges only the attributes present in `data`       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::control::{ControlState, IntersectionControlState};
use crate::error::{CoreError, CoreResult, ValidationError};
use crate::types::{
    validate_id, validate_int_state, ApplicationType, DetectorFaultState, DetectorState,
    FaultState, HandoverCapability, ObjectType, SignalGroupState, SwicoState,
};
use crate::MAX_PREDICTIONS;

// =============================================================================
// Tracked Field
// =============================================================================

/// A state attribute plus its "changed since last reset" flag.
#[derive(Debug, Clone, PartialEq)]
pub struct Tracked<T> {
    value: Option<T>,
    changed: bool,
}

impl<T> Default for Tracked<T> {
    fn default() -> Self {
        Tracked {
            value: None,
            changed: false,
        }
    }
}

impl<T> Tracked<T> {
    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn set(&mut self, value: T) {
        self.value = Some(value);
        self.changed = true;
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn reset(&mut self) {
        self.changed = false;
    }

    /// The value when changed, for building partial state payloads.
    fn changed_value(&self) -> Option<Option<&T>> {
        self.changed.then(|| self.value.as_ref())
    }
}

impl<T: Copy> Tracked<T> {
    pub fn value(&self) -> Option<T> {
        self.value
    }
}

fn put<T: Serialize>(map: &mut Map<String, Value>, key: &str, field: &Tracked<T>) {
    if let Some(value) = field.changed_value() {
        map.insert(key.to_string(), json!(value));
    }
}

fn check_predictions(predictions: &[Prediction]) -> Result<(), ValidationError> {
    if predictions.len() > MAX_PREDICTIONS {
        return Err(ValidationError::TooManyPredictions {
            count: predictions.len(),
            max: MAX_PREDICTIONS,
        });
    }
    Ok(())
}

fn check_ids(ids: &[String]) -> Result<(), ValidationError> {
    ids.iter().try_for_each(|id| validate_id(id))
}

// =============================================================================
// Prediction
// =============================================================================

/// One predicted future signal group state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub state: SignalGroupState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u32>,
    pub min_end: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_end: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub likely_end: Option<u32>,
    /// Percentage, 0..=100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<u32>,
}

impl Prediction {
    fn validate(&self) -> Result<(), ValidationError> {
        match self.confidence {
            Some(c) if c > 100 => Err(ValidationError::OutOfRange {
                field: "confidence",
                value: i64::from(c),
            }),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// State Payloads
// =============================================================================
// Decoded `states[]` entries of an inbound UpdateState or Subscribe reply.
// Absent attributes stay `None` and are left untouched by `copy_state`.

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SessionStateData {
    #[serde(rename = "controlState")]
    pub control_state: Option<ControlState>,
    #[serde(rename = "reqControlState")]
    pub req_control_state: Option<ControlState>,
    #[serde(rename = "startCapability")]
    pub start_capability: Option<HandoverCapability>,
    #[serde(rename = "endCapability")]
    pub end_capability: Option<HandoverCapability>,
    #[serde(rename = "reqIntersection")]
    pub req_intersection: Option<String>,
    #[serde(rename = "reqHandover")]
    pub req_handover: Option<HandoverCapability>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct IntersectionStateData {
    #[serde(rename = "stateticks")]
    pub state_ticks: Option<u32>,
    pub state: Option<IntersectionControlState>,
    #[serde(rename = "reqState")]
    pub req_state: Option<IntersectionControlState>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SignalGroupStateData {
    #[serde(rename = "stateticks")]
    pub state_ticks: Option<u32>,
    pub state: Option<SignalGroupState>,
    #[serde(rename = "reqState")]
    pub req_state: Option<SignalGroupState>,
    pub predictions: Option<Vec<Prediction>>,
    #[serde(rename = "reqPredictions")]
    pub req_predictions: Option<Vec<Prediction>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DetectorStateData {
    #[serde(rename = "stateticks")]
    pub state_ticks: Option<u32>,
    pub state: Option<DetectorState>,
    #[serde(rename = "faultstate")]
    pub fault_state: Option<DetectorFaultState>,
    pub swico: Option<SwicoState>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InputStateData {
    #[serde(rename = "stateticks")]
    pub state_ticks: Option<u32>,
    pub state: Option<i64>,
    #[serde(rename = "faultstate")]
    pub fault_state: Option<FaultState>,
    pub swico: Option<SwicoState>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OutputStateData {
    #[serde(rename = "stateticks")]
    pub state_ticks: Option<u32>,
    pub state: Option<i64>,
    #[serde(rename = "reqState")]
    pub req_state: Option<i64>,
    #[serde(rename = "faultstate")]
    pub fault_state: Option<FaultState>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SpecialVehicleGeneratorStateData {
    #[serde(rename = "faultstate")]
    pub fault_state: Option<FaultState>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct VariableStateData {
    pub value: Option<i64>,
    #[serde(rename = "reqValue")]
    pub req_value: Option<i64>,
    pub lifetime: Option<i64>,
    #[serde(rename = "reqLifetime")]
    pub req_lifetime: Option<i64>,
}

fn validate_lifetime(value: i64) -> Result<i32, ValidationError> {
    if (0..=i64::from(i32::MAX)).contains(&value) {
        Ok(value as i32)
    } else {
        Err(ValidationError::OutOfRange {
            field: "lifetime",
            value,
        })
    }
}

// =============================================================================
// Session
// =============================================================================

/// The client's own session object.
#[derive(Debug, Clone, Deserialize)]
pub struct Session {
    #[serde(rename = "sessionid")]
    pub id: String,
    #[serde(rename = "type")]
    pub application_type: ApplicationType,
    #[serde(skip)]
    pub state_ticks: u32,
    #[serde(skip)]
    pub control_state: Tracked<ControlState>,
    #[serde(skip)]
    pub req_control_state: Tracked<ControlState>,
    #[serde(skip)]
    pub start_capability: Tracked<HandoverCapability>,
    #[serde(skip)]
    pub end_capability: Tracked<HandoverCapability>,
    #[serde(skip)]
    pub req_intersection: Tracked<String>,
    #[serde(skip)]
    pub req_handover: Tracked<HandoverCapability>,
}

impl Session {
    pub fn new(id: impl Into<String>, application_type: ApplicationType) -> Self {
        Session {
            id: id.into(),
            application_type,
            state_ticks: 0,
            control_state: Tracked::default(),
            req_control_state: Tracked::default(),
            start_capability: Tracked::default(),
            end_capability: Tracked::default(),
            req_intersection: Tracked::default(),
            req_handover: Tracked::default(),
        }
    }

    pub fn control_state(&self) -> Option<ControlState> {
        self.control_state.value()
    }

    pub fn req_control_state(&self) -> Option<ControlState> {
        self.req_control_state.value()
    }

    /// Records the state reported by the facility.
    pub fn set_control_state(&mut self, state: ControlState, ticks: u32) {
        self.control_state.set(state);
        self.state_ticks = ticks;
    }

    pub fn set_req_control_state(&mut self, state: ControlState, ticks: u32) {
        self.req_control_state.set(state);
        self.state_ticks = ticks;
    }

    pub fn set_req_intersection(&mut self, id: &str) -> CoreResult<()> {
        validate_id(id)?;
        self.req_intersection.set(id.to_string());
        Ok(())
    }

    fn get_meta(&self) -> Value {
        json!({ "sessionid": self.id, "type": self.application_type })
    }

    fn get_state(&self, for_tlc: bool) -> Map<String, Value> {
        let mut map = Map::new();
        if for_tlc {
            put(&mut map, "controlState", &self.control_state);
            put(&mut map, "reqHandover", &self.req_handover);
        } else {
            put(&mut map, "startCapability", &self.start_capability);
            put(&mut map, "endCapability", &self.end_capability);
            put(&mut map, "reqIntersection", &self.req_intersection);
            put(&mut map, "reqControlState", &self.req_control_state);
        }
        map
    }

    pub fn copy_state(&mut self, data: SessionStateData, ticks: u32) -> CoreResult<bool> {
        let mut state_changed = false;
        if let Some(state) = data.control_state {
            self.set_control_state(state, ticks);
            state_changed = true;
        }
        if let Some(state) = data.req_control_state {
            self.set_req_control_state(state, ticks);
        }
        if let Some(cap) = data.start_capability {
            self.start_capability.set(cap);
        }
        if let Some(cap) = data.end_capability {
            self.end_capability.set(cap);
        }
        if let Some(id) = data.req_intersection {
            self.set_req_intersection(&id)?;
        }
        if let Some(cap) = data.req_handover {
            self.req_handover.set(cap);
        }
        Ok(state_changed)
    }

    fn reset_changed(&mut self) {
        self.control_state.reset();
        self.req_control_state.reset();
        self.start_capability.reset();
        self.end_capability.reset();
        self.req_intersection.reset();
        self.req_handover.reset();
    }

    fn has_changes(&self) -> bool {
        self.control_state.is_changed()
            || self.req_control_state.is_changed()
            || self.start_capability.is_changed()
            || self.end_capability.is_changed()
            || self.req_intersection.is_changed()
            || self.req_handover.is_changed()
    }
}

// =============================================================================
// Facilities
// =============================================================================

/// The facility's inventory of objects. Carries no state.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Facilities {
    pub id: String,
    #[serde(default)]
    pub intersections: Vec<String>,
    #[serde(default)]
    pub signalgroups: Vec<String>,
    #[serde(default)]
    pub detectors: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub spvehgenerator: Option<String>,
    #[serde(default)]
    pub variables: Vec<String>,
    #[serde(default)]
    pub info: Option<Value>,
}

impl Facilities {
    fn validate(&self) -> Result<(), ValidationError> {
        validate_id(&self.id)?;
        check_ids(&self.intersections)?;
        check_ids(&self.signalgroups)?;
        check_ids(&self.detectors)?;
        check_ids(&self.inputs)?;
        check_ids(&self.outputs)?;
        check_ids(&self.variables)?;
        if let Some(id) = &self.spvehgenerator {
            validate_id(id)?;
        }
        Ok(())
    }

    fn get_meta(&self) -> Value {
        json!({
            "id": self.id,
            "intersections": self.intersections,
            "signalgroups": self.signalgroups,
            "detectors": self.detectors,
            "inputs": self.inputs,
            "outputs": self.outputs,
            "spvehgenerator": self.spvehgenerator,
            "variables": self.variables,
            "info": self.info,
        })
    }
}

// =============================================================================
// Intersection
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Intersection {
    pub id: String,
    #[serde(default)]
    pub signalgroups: Vec<String>,
    #[serde(default)]
    pub detectors: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub spvehgenerator: Option<String>,
    #[serde(skip)]
    pub state_ticks: u32,
    #[serde(skip)]
    pub state: Tracked<IntersectionControlState>,
    #[serde(skip)]
    pub req_state: Tracked<IntersectionControlState>,
}

impl Intersection {
    pub fn state(&self) -> Option<IntersectionControlState> {
        self.state.value()
    }

    pub fn req_state(&self) -> Option<IntersectionControlState> {
        self.req_state.value()
    }

    pub fn is_in_control(&self) -> bool {
        self.state() == Some(IntersectionControlState::Control)
    }

    pub fn set_req_state(&mut self, state: IntersectionControlState, ticks: u32) {
        self.req_state.set(state);
        self.state_ticks = ticks;
    }

    fn validate(&self) -> Result<(), ValidationError> {
        validate_id(&self.id)?;
        check_ids(&self.signalgroups)?;
        check_ids(&self.detectors)?;
        check_ids(&self.inputs)?;
        check_ids(&self.outputs)
    }

    fn get_meta(&self) -> Value {
        json!({
            "id": self.id,
            "signalgroups": self.signalgroups,
            "detectors": self.detectors,
            "inputs": self.inputs,
            "outputs": self.outputs,
            "spvehgenerator": self.spvehgenerator,
        })
    }

    fn get_state(&self, for_tlc: bool) -> Map<String, Value> {
        let mut map = Map::new();
        if for_tlc {
            map.insert("stateticks".into(), json!(self.state_ticks));
            put(&mut map, "reqState", &self.req_state);
            put(&mut map, "state", &self.state);
        } else {
            put(&mut map, "reqState", &self.req_state);
        }
        map
    }

    pub fn copy_state(&mut self, data: IntersectionStateData, ticks: u32) -> bool {
        self.state_ticks = data.state_ticks.unwrap_or(ticks);
        let mut state_changed = false;
        if let Some(state) = data.state {
            self.state.set(state);
            state_changed = true;
        }
        if let Some(state) = data.req_state {
            self.req_state.set(state);
        }
        state_changed
    }

    fn reset_changed(&mut self) {
        self.state.reset();
        self.req_state.reset();
    }

    fn has_changes(&self) -> bool {
        self.state.is_changed() || self.req_state.is_changed()
    }
}

// =============================================================================
// Signal Group
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignalGroup {
    pub id: String,
    #[serde(default)]
    pub intersection: Option<String>,
    #[serde(default)]
    pub intergreen: Option<Value>,
    #[serde(default)]
    pub timing: Option<Value>,
    #[serde(skip)]
    pub state_ticks: u32,
    #[serde(skip)]
    pub state: Tracked<SignalGroupState>,
    #[serde(skip)]
    pub req_state: Tracked<SignalGroupState>,
    #[serde(skip)]
    pub predictions: Tracked<Vec<Prediction>>,
    #[serde(skip)]
    pub req_predictions: Tracked<Vec<Prediction>>,
}

impl SignalGroup {
    pub fn new(id: impl Into<String>) -> Self {
        SignalGroup {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn state(&self) -> Option<SignalGroupState> {
        self.state.value()
    }

    pub fn req_state(&self) -> Option<SignalGroupState> {
        self.req_state.value()
    }

    pub fn set_req_state(&mut self, state: SignalGroupState, ticks: u32) {
        self.req_state.set(state);
        self.state_ticks = ticks;
    }

    pub fn set_req_predictions(&mut self, predictions: Vec<Prediction>, ticks: u32) -> CoreResult<()> {
        check_predictions(&predictions)?;
        predictions.iter().try_for_each(Prediction::validate)?;
        self.req_predictions.set(predictions);
        self.state_ticks = ticks;
        Ok(())
    }

    fn get_meta(&self) -> Value {
        json!({
            "id": self.id,
            "intersection": self.intersection,
            "intergreen": self.intergreen,
            "timing": self.timing,
        })
    }

    fn get_state(&self, for_tlc: bool) -> Map<String, Value> {
        let mut map = Map::new();
        if for_tlc {
            map.insert("stateticks".into(), json!(self.state_ticks));
            put(&mut map, "state", &self.state);
            put(&mut map, "reqState", &self.req_state);
            put(&mut map, "predictions", &self.predictions);
            put(&mut map, "reqPredictions", &self.req_predictions);
        } else {
            put(&mut map, "reqState", &self.req_state);
            put(&mut map, "reqPredictions", &self.req_predictions);
        }
        map
    }

    pub fn copy_state(&mut self, data: SignalGroupStateData, ticks: u32) -> CoreResult<bool> {
        for predictions in [&data.predictions, &data.req_predictions].into_iter().flatten() {
            check_predictions(predictions)?;
            predictions.iter().try_for_each(Prediction::validate)?;
        }

        self.state_ticks = data.state_ticks.unwrap_or(ticks);
        let mut state_changed = false;
        if let Some(state) = data.state {
            self.state.set(state);
            state_changed = true;
        }
        if let Some(state) = data.req_state {
            self.req_state.set(state);
        }
        if let Some(predictions) = data.predictions.filter(|p| !p.is_empty()) {
            self.predictions.set(predictions);
        }
        if let Some(predictions) = data.req_predictions.filter(|p| !p.is_empty()) {
            self.req_predictions.set(predictions);
        }
        Ok(state_changed)
    }

    fn reset_changed(&mut self) {
        self.state.reset();
        self.req_state.reset();
        self.predictions.reset();
        self.req_predictions.reset();
    }

    fn has_changes(&self) -> bool {
        self.state.is_changed()
            || self.req_state.is_changed()
            || self.predictions.is_changed()
            || self.req_predictions.is_changed()
    }
}

// =============================================================================
// Detector
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Detector {
    pub id: String,
    #[serde(default, rename = "generatesEvents")]
    pub generates_events: bool,
    #[serde(skip)]
    pub state_ticks: u32,
    #[serde(skip)]
    pub state: Tracked<DetectorState>,
    #[serde(skip)]
    pub fault_state: Tracked<DetectorFaultState>,
    #[serde(skip)]
    pub swico: Tracked<SwicoState>,
}

impl Detector {
    pub fn new(id: impl Into<String>) -> Self {
        Detector {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn state(&self) -> Option<DetectorState> {
        self.state.value()
    }

    fn get_meta(&self) -> Value {
        json!({ "id": self.id, "generatesEvents": self.generates_events })
    }

    fn get_state(&self, for_tlc: bool) -> Map<String, Value> {
        let mut map = Map::new();
        if for_tlc {
            map.insert("stateticks".into(), json!(self.state_ticks));
            put(&mut map, "state", &self.state);
            put(&mut map, "faultstate", &self.fault_state);
            put(&mut map, "swico", &self.swico);
        }
        map
    }

    pub fn copy_state(&mut self, data: DetectorStateData, ticks: u32) -> bool {
        self.state_ticks = data.state_ticks.unwrap_or(ticks);
        let mut state_changed = false;
        if let Some(state) = data.state {
            self.state.set(state);
            state_changed = true;
        }
        if let Some(fault) = data.fault_state {
            self.fault_state.set(fault);
        }
        if let Some(swico) = data.swico {
            self.swico.set(swico);
        }
        state_changed
    }

    fn reset_changed(&mut self) {
        self.state.reset();
        self.fault_state.reset();
        self.swico.reset();
    }

    fn has_changes(&self) -> bool {
        self.state.is_changed() || self.fault_state.is_changed() || self.swico.is_changed()
    }
}

// =============================================================================
// Input
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Input {
    pub id: String,
    #[serde(skip)]
    pub state_ticks: u32,
    #[serde(skip)]
    pub state: Tracked<i32>,
    #[serde(skip)]
    pub fault_state: Tracked<FaultState>,
    #[serde(skip)]
    pub swico: Tracked<SwicoState>,
}

impl Input {
    pub fn new(id: impl Into<String>) -> Self {
        Input {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn state(&self) -> Option<i32> {
        self.state.value()
    }

    fn get_meta(&self) -> Value {
        json!({ "id": self.id })
    }

    fn get_state(&self, for_tlc: bool) -> Map<String, Value> {
        let mut map = Map::new();
        if for_tlc {
            map.insert("stateticks".into(), json!(self.state_ticks));
            put(&mut map, "state", &self.state);
            put(&mut map, "faultstate", &self.fault_state);
            put(&mut map, "swico", &self.swico);
        }
        map
    }

    pub fn copy_state(&mut self, data: InputStateData, ticks: u32) -> CoreResult<bool> {
        let state = data
            .state
            .map(|v| validate_int_state("state", v))
            .transpose()?;

        self.state_ticks = data.state_ticks.unwrap_or(ticks);
        let state_changed = state.is_some();
        if let Some(state) = state {
            self.state.set(state);
        }
        if let Some(fault) = data.fault_state {
            self.fault_state.set(fault);
        }
        if let Some(swico) = data.swico {
            self.swico.set(swico);
        }
        Ok(state_changed)
    }

    fn reset_changed(&mut self) {
        self.state.reset();
        self.fault_state.reset();
        self.swico.reset();
    }

    fn has_changes(&self) -> bool {
        self.state.is_changed() || self.fault_state.is_changed() || self.swico.is_changed()
    }
}

// =============================================================================
// Output
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Output {
    pub id: String,
    /// Listed by the controlled intersection; only a controlling session may set it.
    #[serde(skip)]
    pub exclusive: bool,
    #[serde(skip)]
    pub state_ticks: u32,
    #[serde(skip)]
    pub state: Tracked<i32>,
    #[serde(skip)]
    pub req_state: Tracked<i32>,
    #[serde(skip)]
    pub fault_state: Tracked<FaultState>,
}

impl Output {
    pub fn new(id: impl Into<String>) -> Self {
        Output {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn state(&self) -> Option<i32> {
        self.state.value()
    }

    pub fn req_state(&self) -> Option<i32> {
        self.req_state.value()
    }

    pub fn set_req_state(&mut self, value: i64, ticks: u32) -> CoreResult<()> {
        let value = validate_int_state("reqState", value)?;
        self.req_state.set(value);
        self.state_ticks = ticks;
        Ok(())
    }

    fn get_meta(&self) -> Value {
        json!({ "id": self.id })
    }

    fn get_state(&self, for_tlc: bool) -> Map<String, Value> {
        let mut map = Map::new();
        if for_tlc {
            map.insert("stateticks".into(), json!(self.state_ticks));
            put(&mut map, "state", &self.state);
            put(&mut map, "faultstate", &self.fault_state);
            put(&mut map, "reqState", &self.req_state);
        } else {
            put(&mut map, "reqState", &self.req_state);
        }
        map
    }

    pub fn copy_state(&mut self, data: OutputStateData, ticks: u32) -> CoreResult<bool> {
        let state = data
            .state
            .map(|v| validate_int_state("state", v))
            .transpose()?;
        let req_state = data
            .req_state
            .map(|v| validate_int_state("reqState", v))
            .transpose()?;

        self.state_ticks = data.state_ticks.unwrap_or(ticks);
        let state_changed = state.is_some();
        if let Some(state) = state {
            self.state.set(state);
        }
        if let Some(fault) = data.fault_state {
            self.fault_state.set(fault);
        }
        if let Some(req) = req_state {
            self.req_state.set(req);
        }
        Ok(state_changed)
    }

    fn reset_changed(&mut self) {
        self.state.reset();
        self.req_state.reset();
        self.fault_state.reset();
    }

    fn has_changes(&self) -> bool {
        self.state.is_changed() || self.req_state.is_changed() || self.fault_state.is_changed()
    }
}

// =============================================================================
// Special Vehicle Event Generator
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpecialVehicleGenerator {
    pub id: String,
    #[serde(skip)]
    pub fault_state: Tracked<FaultState>,
}

impl SpecialVehicleGenerator {
    fn get_meta(&self) -> Value {
        json!({ "id": self.id })
    }

    fn get_state(&self, for_tlc: bool) -> Map<String, Value> {
        let mut map = Map::new();
        if for_tlc {
            put(&mut map, "faultstate", &self.fault_state);
        }
        map
    }

    pub fn copy_state(&mut self, data: SpecialVehicleGeneratorStateData) -> bool {
        match data.fault_state {
            Some(fault) => {
                self.fault_state.set(fault);
                true
            }
            None => false,
        }
    }
}

// =============================================================================
// Variable
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Variable {
    pub id: String,
    #[serde(skip)]
    pub value: Tracked<i32>,
    #[serde(skip)]
    pub req_value: Tracked<i32>,
    #[serde(skip)]
    pub lifetime: Tracked<i32>,
    #[serde(skip)]
    pub req_lifetime: Tracked<i32>,
}

impl Variable {
    pub fn new(id: impl Into<String>) -> Self {
        Variable {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn value(&self) -> Option<i32> {
        self.value.value()
    }

    pub fn set_req(&mut self, value: i64, lifetime: i64) -> CoreResult<()> {
        let value = validate_int_state("reqValue", value)?;
        let lifetime = validate_lifetime(lifetime)?;
        self.req_value.set(value);
        self.req_lifetime.set(lifetime);
        Ok(())
    }

    fn get_meta(&self) -> Value {
        json!({ "id": self.id })
    }

    fn get_state(&self, for_tlc: bool) -> Map<String, Value> {
        let mut map = Map::new();
        if for_tlc {
            put(&mut map, "value", &self.value);
            put(&mut map, "reqValue", &self.req_value);
            put(&mut map, "lifetime", &self.lifetime);
            put(&mut map, "reqLifetime", &self.req_lifetime);
        } else {
            put(&mut map, "reqValue", &self.req_value);
            put(&mut map, "reqLifetime", &self.req_lifetime);
        }
        map
    }

    pub fn copy_state(&mut self, data: VariableStateData) -> CoreResult<bool> {
        let value = data.value.map(|v| validate_int_state("value", v)).transpose()?;
        let req_value = data
            .req_value
            .map(|v| validate_int_state("reqValue", v))
            .transpose()?;
        let lifetime = data.lifetime.map(validate_lifetime).transpose()?;
        let req_lifetime = data.req_lifetime.map(validate_lifetime).transpose()?;

        let state_changed = value.is_some() || lifetime.is_some();
        if let Some(v) = value {
            self.value.set(v);
        }
        if let Some(v) = req_value {
            self.req_value.set(v);
        }
        if let Some(v) = lifetime {
            self.lifetime.set(v);
        }
        if let Some(v) = req_lifetime {
            self.req_lifetime.set(v);
        }
        Ok(state_changed)
    }

    fn reset_changed(&mut self) {
        self.value.reset();
        self.req_value.reset();
        self.lifetime.reset();
        self.req_lifetime.reset();
    }

    fn has_changes(&self) -> bool {
        self.value.is_changed()
            || self.req_value.is_changed()
            || self.lifetime.is_changed()
            || self.req_lifetime.is_changed()
    }
}

// =============================================================================
// Tagged Union
// =============================================================================

/// Any TLC-FI object.
#[derive(Debug, Clone)]
pub enum TlcObject {
    Session(Session),
    Facilities(Facilities),
    Intersection(Intersection),
    SignalGroup(SignalGroup),
    Detector(Detector),
    Input(Input),
    Output(Output),
    SpecialVehicleGenerator(SpecialVehicleGenerator),
    Variable(Variable),
}

fn decode<T: serde::de::DeserializeOwned>(object_type: ObjectType, value: &Value) -> CoreResult<T> {
    T::deserialize(value).map_err(|e| CoreError::MalformedPayload {
        object_type,
        message: e.to_string(),
    })
}

impl TlcObject {
    /// Builds an object from one `meta[]` entry of a ReadMeta reply.
    pub fn from_meta(object_type: ObjectType, meta: &Value) -> CoreResult<Self> {
        let object = match object_type {
            ObjectType::Session => TlcObject::Session(decode(object_type, meta)?),
            ObjectType::TLCFacilities => {
                let facilities: Facilities = decode(object_type, meta)?;
                facilities.validate()?;
                TlcObject::Facilities(facilities)
            }
            ObjectType::Intersection => {
                let intersection: Intersection = decode(object_type, meta)?;
                intersection.validate()?;
                TlcObject::Intersection(intersection)
            }
            ObjectType::SignalGroup => TlcObject::SignalGroup(decode(object_type, meta)?),
            ObjectType::Detector => TlcObject::Detector(decode(object_type, meta)?),
            ObjectType::Input => TlcObject::Input(decode(object_type, meta)?),
            ObjectType::Output => TlcObject::Output(decode(object_type, meta)?),
            ObjectType::SpecialVehicleEventGenerator => {
                TlcObject::SpecialVehicleGenerator(decode(object_type, meta)?)
            }
            ObjectType::Variable => TlcObject::Variable(decode(object_type, meta)?),
        };
        validate_id(object.id())?;
        Ok(object)
    }

    pub fn object_type(&self) -> ObjectType {
        match self {
            TlcObject::Session(_) => ObjectType::Session,
            TlcObject::Facilities(_) => ObjectType::TLCFacilities,
            TlcObject::Intersection(_) => ObjectType::Intersection,
            TlcObject::SignalGroup(_) => ObjectType::SignalGroup,
            TlcObject::Detector(_) => ObjectType::Detector,
            TlcObject::Input(_) => ObjectType::Input,
            TlcObject::Output(_) => ObjectType::Output,
            TlcObject::SpecialVehicleGenerator(_) => ObjectType::SpecialVehicleEventGenerator,
            TlcObject::Variable(_) => ObjectType::Variable,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            TlcObject::Session(o) => &o.id,
            TlcObject::Facilities(o) => &o.id,
            TlcObject::Intersection(o) => &o.id,
            TlcObject::SignalGroup(o) => &o.id,
            TlcObject::Detector(o) => &o.id,
            TlcObject::Input(o) => &o.id,
            TlcObject::Output(o) => &o.id,
            TlcObject::SpecialVehicleGenerator(o) => &o.id,
            TlcObject::Variable(o) => &o.id,
        }
    }

    pub fn get_meta(&self) -> Value {
        match self {
            TlcObject::Session(o) => o.get_meta(),
            TlcObject::Facilities(o) => o.get_meta(),
            TlcObject::Intersection(o) => o.get_meta(),
            TlcObject::SignalGroup(o) => o.get_meta(),
            TlcObject::Detector(o) => o.get_meta(),
            TlcObject::Input(o) => o.get_meta(),
            TlcObject::Output(o) => o.get_meta(),
            TlcObject::SpecialVehicleGenerator(o) => o.get_meta(),
            TlcObject::Variable(o) => o.get_meta(),
        }
    }

    /// Changed attributes as a JSON object. Never clears the changed flags.
    pub fn get_state(&self, for_tlc: bool) -> Value {
        let map = match self {
            TlcObject::Session(o) => o.get_state(for_tlc),
            TlcObject::Facilities(_) => Map::new(),
            TlcObject::Intersection(o) => o.get_state(for_tlc),
            TlcObject::SignalGroup(o) => o.get_state(for_tlc),
            TlcObject::Detector(o) => o.get_state(for_tlc),
            TlcObject::Input(o) => o.get_state(for_tlc),
            TlcObject::Output(o) => o.get_state(for_tlc),
            TlcObject::SpecialVehicleGenerator(o) => o.get_state(for_tlc),
            TlcObject::Variable(o) => o.get_state(for_tlc),
        };
        Value::Object(map)
    }

    /// Merges the attributes present in `state` and returns whether the
    /// object's actual state changed.
    pub fn copy_state(&mut self, state: &Value, ticks: u32) -> CoreResult<bool> {
        let object_type = self.object_type();
        match self {
            TlcObject::Session(o) => o.copy_state(decode(object_type, state)?, ticks),
            TlcObject::Facilities(_) => Err(CoreError::MalformedPayload {
                object_type,
                message: "facilities carry no state".into(),
            }),
            TlcObject::Intersection(o) => Ok(o.copy_state(decode(object_type, state)?, ticks)),
            TlcObject::SignalGroup(o) => o.copy_state(decode(object_type, state)?, ticks),
            TlcObject::Detector(o) => Ok(o.copy_state(decode(object_type, state)?, ticks)),
            TlcObject::Input(o) => o.copy_state(decode(object_type, state)?, ticks),
            TlcObject::Output(o) => o.copy_state(decode(object_type, state)?, ticks),
            TlcObject::SpecialVehicleGenerator(o) => Ok(o.copy_state(decode(object_type, state)?)),
            TlcObject::Variable(o) => o.copy_state(decode(object_type, state)?),
        }
    }

    pub fn reset_changed(&mut self) {
        match self {
            TlcObject::Session(o) => o.reset_changed(),
            TlcObject::Facilities(_) => {}
            TlcObject::Intersection(o) => o.reset_changed(),
            TlcObject::SignalGroup(o) => o.reset_changed(),
            TlcObject::Detector(o) => o.reset_changed(),
            TlcObject::Input(o) => o.reset_changed(),
            TlcObject::Output(o) => o.reset_changed(),
            TlcObject::SpecialVehicleGenerator(o) => o.fault_state.reset(),
            TlcObject::Variable(o) => o.reset_changed(),
        }
    }

    pub fn has_changes(&self) -> bool {
        match self {
            TlcObject::Session(o) => o.has_changes(),
            TlcObject::Facilities(_) => false,
            TlcObject::Intersection(o) => o.has_changes(),
            TlcObject::SignalGroup(o) => o.has_changes(),
            TlcObject::Detector(o) => o.has_changes(),
            TlcObject::Input(o) => o.has_changes(),
            TlcObject::Output(o) => o.has_changes(),
            TlcObject::SpecialVehicleGenerator(o) => o.fault_state.is_changed(),
            TlcObject::Variable(o) => o.has_changes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_group_from_meta() {
        let meta = json!({ "id": "02", "intersection": "K205195", "timing": [] });
        let object = TlcObject::from_meta(ObjectType::SignalGroup, &meta).unwrap();
        assert_eq!(object.object_type(), ObjectType::SignalGroup);
        assert_eq!(object.id(), "02");
        assert_eq!(object.get_meta()["intersection"], "K205195");
    }

    #[test]
    fn test_from_meta_rejects_invalid_id() {
        let meta = json!({ "id": "not valid" });
        assert!(TlcObject::from_meta(ObjectType::Detector, &meta).is_err());
    }

    #[test]
    fn test_get_state_only_changed_req_fields() {
        let mut sg = SignalGroup::new("03");
        sg.state.set(SignalGroupState::StopAndRemain);
        assert_eq!(sg.get_state(false), Map::new());

        sg.set_req_state(SignalGroupState::ProtectedMovementAllowed, 500);
        let state = Value::Object(sg.get_state(false));
        assert_eq!(state, json!({ "reqState": 6 }));

        // Reading never clears the flag.
        assert_eq!(Value::Object(sg.get_state(false)), json!({ "reqState": 6 }));

        let full = Value::Object(sg.get_state(true));
        assert_eq!(full["stateticks"], 500);
        assert_eq!(full["state"], 3);
    }

    #[test]
    fn test_reset_changed_clears_flags() {
        let mut object = TlcObject::SignalGroup(SignalGroup::new("05"));
        if let TlcObject::SignalGroup(sg) = &mut object {
            sg.set_req_state(SignalGroupState::StopAndRemain, 1);
        }
        assert!(object.has_changes());
        object.reset_changed();
        assert!(!object.has_changes());
        assert_eq!(object.get_state(false), json!({}));
    }

    #[test]
    fn test_copy_state_merges_present_fields_only() {
        let mut object = TlcObject::SignalGroup(SignalGroup::new("08"));
        let changed = object
            .copy_state(&json!({ "stateticks": 10, "state": 6 }), 99)
            .unwrap();
        assert!(changed);

        let changed = object.copy_state(&json!({ "reqState": 3 }), 120).unwrap();
        assert!(!changed);

        match &object {
            TlcObject::SignalGroup(sg) => {
                assert_eq!(sg.state(), Some(SignalGroupState::ProtectedMovementAllowed));
                assert_eq!(sg.req_state(), Some(SignalGroupState::StopAndRemain));
                assert_eq!(sg.state_ticks, 120);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_too_many_predictions_rejected() {
        let prediction = Prediction {
            state: SignalGroupState::PreMovement,
            start_time: None,
            min_end: 100,
            max_end: None,
            likely_end: None,
            confidence: Some(80),
            next: None,
        };
        let mut sg = SignalGroup::new("02");
        assert!(sg.set_req_predictions(vec![prediction.clone(); 16], 1).is_ok());
        assert!(sg.set_req_predictions(vec![prediction; 17], 1).is_err());
    }

    #[test]
    fn test_output_range_checked() {
        let mut output = Output::new("o1");
        assert!(output.set_req_state(1, 0).is_ok());
        assert!(output.set_req_state(32768, 0).is_err());

        let mut object = TlcObject::Output(Output::new("o2"));
        assert!(object.copy_state(&json!({ "state": -40000 }), 0).is_err());
    }

    #[test]
    fn test_session_state_split() {
        let mut session = Session::new("s1", ApplicationType::Control);
        session.set_req_control_state(ControlState::Offline, 5);
        session.set_control_state(ControlState::NotConfigured, 5);
        let outbound = Value::Object(session.get_state(false));
        assert_eq!(outbound, json!({ "reqControlState": 2 }));
        let inbound = Value::Object(session.get_state(true));
        assert_eq!(inbound, json!({ "controlState": 1 }));
    }

    #[test]
    fn test_facilities_carry_no_state() {
        let meta = json!({
            "id": "tlc1",
            "intersections": ["K205195"],
            "signalgroups": ["02", "03"],
            "spvehgenerator": "spv"
        });
        let mut object = TlcObject::from_meta(ObjectType::TLCFacilities, &meta).unwrap();
        assert!(object.copy_state(&json!({}), 0).is_err());
        assert_eq!(object.get_state(true), json!({}));
    }

    #[test]
    fn test_variable_request() {
        let mut var = Variable::new("v7");
        var.set_req(12, 3000).unwrap();
        assert_eq!(
            Value::Object(var.get_state(false)),
            json!({ "reqValue": 12, "reqLifetime": 3000 })
        );
        assert!(var.set_req(1, -1).is_err());
    }
}
