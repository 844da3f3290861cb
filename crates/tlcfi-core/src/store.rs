//! # Object Store
//!
//! Owns every protocol object of one session and indexes them by
//! `(ObjectType, id)`.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   new()  ──►  add(..) × N  ──►  initialize(intersection_id)             │
//! │  (empty)     (ReadMeta          ├── no intersection   → NoIntersection  │
//! │               results)          ├── duplicate id      → DuplicateId     │
//! │                                 ├── unknown intersection → NotFound     │
//! │                                 └── ok: index built, exclusive outputs  │
//! │                                     marked, intersection selected       │
//! │                                                                         │
//! │  A fresh store is built for every connection attempt.                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::fmt;

use crate::error::{CoreError, CoreResult};
use crate::objects::{
    Detector, Facilities, Input, Intersection, Output, Session, SignalGroup,
    SpecialVehicleGenerator, TlcObject, Variable,
};
use crate::types::ObjectType;

/// Typed object identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub object_type: ObjectType,
    pub id: String,
}

impl ObjectKey {
    pub fn new(object_type: ObjectType, id: impl Into<String>) -> Self {
        ObjectKey {
            object_type,
            id: id.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.id)
    }
}

/// Object counts after a successful [`ObjectStore::initialize`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSummary {
    pub signal_groups: usize,
    pub detectors: usize,
    pub inputs: usize,
    pub outputs: usize,
    pub exclusive_outputs: usize,
    pub variables: usize,
}

#[derive(Debug, Default)]
pub struct ObjectStore {
    objects: Vec<TlcObject>,
    index: HashMap<ObjectKey, usize>,
    intersection: Option<usize>,
    initialized: bool,
}

macro_rules! typed_access {
    ($get:ident, $get_mut:ident, $variant:ident, $ty:ty) => {
        pub fn $get(&self, id: &str) -> CoreResult<&$ty> {
            match self.find(ObjectType::$variant, id) {
                Some(TlcObject::$variant(o)) => Ok(o),
                _ => Err(CoreError::not_found(ObjectType::$variant, id)),
            }
        }

        pub fn $get_mut(&mut self, id: &str) -> CoreResult<&mut $ty> {
            match self.find_mut(ObjectType::$variant, id) {
                Some(TlcObject::$variant(o)) => Ok(o),
                _ => Err(CoreError::not_found(ObjectType::$variant, id)),
            }
        }
    };
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Adds an object. Duplicates are only detected by [`ObjectStore::initialize`].
    pub fn add(&mut self, object: TlcObject) {
        if self.initialized {
            let key = ObjectKey::new(object.object_type(), object.id());
            self.index.entry(key).or_insert(self.objects.len());
        }
        self.objects.push(object);
    }

    /// Validates the collected objects and builds the index.
    ///
    /// On error the store stays uninitialized.
    pub fn initialize(&mut self, intersection_id: &str) -> CoreResult<StoreSummary> {
        self.initialized = false;
        self.index.clear();
        self.intersection = None;

        if !self
            .objects
            .iter()
            .any(|o| matches!(o, TlcObject::Intersection(_)))
        {
            return Err(CoreError::NoIntersection);
        }

        let mut index = HashMap::with_capacity(self.objects.len());
        for (position, object) in self.objects.iter().enumerate() {
            let key = ObjectKey::new(object.object_type(), object.id());
            if index.insert(key, position).is_some() {
                return Err(CoreError::DuplicateId {
                    object_type: object.object_type(),
                    id: object.id().to_string(),
                });
            }
        }

        let selected = index
            .get(&ObjectKey::new(ObjectType::Intersection, intersection_id))
            .copied()
            .ok_or_else(|| CoreError::IntersectionMissing {
                id: intersection_id.to_string(),
            })?;

        let exclusive: Vec<String> = match &self.objects[selected] {
            TlcObject::Intersection(i) => i.outputs.clone(),
            _ => Vec::new(),
        };

        let mut summary = StoreSummary::default();
        for object in &mut self.objects {
            match object {
                TlcObject::SignalGroup(_) => summary.signal_groups += 1,
                TlcObject::Detector(_) => summary.detectors += 1,
                TlcObject::Input(_) => summary.inputs += 1,
                TlcObject::Output(output) => {
                    summary.outputs += 1;
                    output.exclusive = exclusive.contains(&output.id);
                    if output.exclusive {
                        summary.exclusive_outputs += 1;
                    }
                }
                TlcObject::Variable(_) => summary.variables += 1,
                _ => {}
            }
        }

        self.index = index;
        self.intersection = Some(selected);
        self.initialized = true;
        Ok(summary)
    }

    fn position(&self, object_type: ObjectType, id: &str) -> Option<usize> {
        if self.initialized {
            self.index.get(&ObjectKey::new(object_type, id)).copied()
        } else {
            self.objects
                .iter()
                .position(|o| o.object_type() == object_type && o.id() == id)
        }
    }

    pub fn find(&self, object_type: ObjectType, id: &str) -> Option<&TlcObject> {
        self.position(object_type, id).map(|p| &self.objects[p])
    }

    pub fn find_mut(&mut self, object_type: ObjectType, id: &str) -> Option<&mut TlcObject> {
        self.position(object_type, id).map(move |p| &mut self.objects[p])
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&TlcObject> {
        self.find(key.object_type, &key.id)
    }

    pub fn get_mut(&mut self, key: &ObjectKey) -> Option<&mut TlcObject> {
        self.find_mut(key.object_type, &key.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TlcObject> {
        self.objects.iter()
    }

    /// Ids of every object of one kind, in insertion order.
    pub fn ids_of(&self, object_type: ObjectType) -> Vec<String> {
        self.objects
            .iter()
            .filter(|o| o.object_type() == object_type)
            .map(|o| o.id().to_string())
            .collect()
    }

    // =========================================================================
    // Singletons
    // =========================================================================

    pub fn session(&self) -> Option<&Session> {
        self.objects.iter().find_map(|o| match o {
            TlcObject::Session(s) => Some(s),
            _ => None,
        })
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.objects.iter_mut().find_map(|o| match o {
            TlcObject::Session(s) => Some(s),
            _ => None,
        })
    }

    pub fn facilities(&self) -> Option<&Facilities> {
        self.objects.iter().find_map(|o| match o {
            TlcObject::Facilities(f) => Some(f),
            _ => None,
        })
    }

    pub fn special_vehicle_generator(&self) -> Option<&SpecialVehicleGenerator> {
        self.objects.iter().find_map(|o| match o {
            TlcObject::SpecialVehicleGenerator(g) => Some(g),
            _ => None,
        })
    }

    /// The intersection selected at initialization.
    pub fn controlled_intersection(&self) -> Option<&Intersection> {
        match self.intersection.map(|p| &self.objects[p]) {
            Some(TlcObject::Intersection(i)) => Some(i),
            _ => None,
        }
    }

    pub fn controlled_intersection_mut(&mut self) -> Option<&mut Intersection> {
        match self.intersection {
            Some(p) => match &mut self.objects[p] {
                TlcObject::Intersection(i) => Some(i),
                _ => None,
            },
            None => None,
        }
    }

    // =========================================================================
    // Typed Lookups
    // =========================================================================

    typed_access!(intersection, intersection_mut, Intersection, Intersection);
    typed_access!(signal_group, signal_group_mut, SignalGroup, SignalGroup);
    typed_access!(detector, detector_mut, Detector, Detector);
    typed_access!(input, input_mut, Input, Input);
    typed_access!(output, output_mut, Output, Output);
    typed_access!(variable, variable_mut, Variable, Variable);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ApplicationType;

    fn intersection(id: &str, outputs: &[&str]) -> TlcObject {
        TlcObject::Intersection(Intersection {
            id: id.into(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    fn populated() -> ObjectStore {
        let mut store = ObjectStore::new();
        store.add(TlcObject::Session(Session::new("s1", ApplicationType::Control)));
        store.add(intersection("K205195", &["o1"]));
        store.add(TlcObject::SignalGroup(SignalGroup::new("02")));
        store.add(TlcObject::SignalGroup(SignalGroup::new("03")));
        store.add(TlcObject::Output(Output::new("o1")));
        store.add(TlcObject::Output(Output::new("o2")));
        store
    }

    #[test]
    fn test_initialize_marks_exclusive_outputs() {
        let mut store = populated();
        let summary = store.initialize("K205195").unwrap();
        assert!(store.is_initialized());
        assert_eq!(summary.signal_groups, 2);
        assert_eq!(summary.outputs, 2);
        assert_eq!(summary.exclusive_outputs, 1);
        assert!(store.output("o1").unwrap().exclusive);
        assert!(!store.output("o2").unwrap().exclusive);
        assert_eq!(store.controlled_intersection().unwrap().id, "K205195");
    }

    #[test]
    fn test_duplicate_signal_group_rejected() {
        let mut store = populated();
        store.add(TlcObject::SignalGroup(SignalGroup::new("02")));
        let err = store.initialize("K205195").unwrap_err();
        assert!(matches!(err, CoreError::DuplicateId { .. }));
        assert!(err.is_fatal());
        assert!(!store.is_initialized());
        assert!(store.controlled_intersection().is_none());
    }

    #[test]
    fn test_same_id_different_kinds_allowed() {
        let mut store = populated();
        store.add(TlcObject::Detector(Detector::new("02")));
        assert!(store.initialize("K205195").is_ok());
    }

    #[test]
    fn test_no_intersection_is_fatal() {
        let mut store = ObjectStore::new();
        store.add(TlcObject::SignalGroup(SignalGroup::new("02")));
        let err = store.initialize("K205195").unwrap_err();
        assert!(matches!(err, CoreError::NoIntersection));
    }

    #[test]
    fn test_missing_configured_intersection_is_fatal() {
        let mut store = populated();
        let err = store.initialize("K999").unwrap_err();
        assert!(matches!(err, CoreError::IntersectionMissing { ref id } if id == "K999"));
        assert!(err.is_fatal());
        assert!(!store.is_initialized());
    }

    #[test]
    fn test_lookup_unknown_id() {
        let mut store = populated();
        store.initialize("K205195").unwrap();
        let err = store.signal_group("99").unwrap_err();
        assert!(matches!(err, CoreError::ObjectNotFound { .. }));
        assert!(store.detector("02").is_err());
    }

    #[test]
    fn test_lookup_before_initialize() {
        let store = populated();
        assert!(store.signal_group("03").is_ok());
        assert_eq!(store.session().unwrap().id, "s1");
    }
}
