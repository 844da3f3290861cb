//! # Wire Types
//!
//! Enumerations and small value types shared by every TLC-FI payload.
//!
//! ## Integer Encoding
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Enum Wire Representation                           │
//! │                                                                         │
//! │  TLC-FI encodes every enumeration as a bare JSON integer:              │
//! │                                                                         │
//! │    { "type": 3, "ids": ["02", "03"] }     ObjectType::SignalGroup      │
//! │    { "state": 6 }                        ProtectedMovementAllowed      │
//! │                                                                         │
//! │  `wire_enum!` generates for each enum:                                 │
//! │  • Serialize / Deserialize as i64                                      │
//! │  • TryFrom<i64> (unknown value → ValidationError)                      │
//! │  • Display (variant name)                                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

// =============================================================================
// Enum Generator
// =============================================================================

/// Declares a C-like enum that travels over the wire as an integer.
#[macro_export]
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $value:expr ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value ),+
        }

        impl $name {
            /// All variants in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// The integer sent on the wire.
            pub fn as_i64(self) -> i64 {
                self as i64
            }
        }

        impl ::std::convert::TryFrom<i64> for $name {
            type Error = $crate::error::ValidationError;

            fn try_from(value: i64) -> Result<Self, $crate::error::ValidationError> {
                match value {
                    $( v if v == $value => Ok($name::$variant), )+
                    _ => Err($crate::error::ValidationError::UnknownEnumValue {
                        kind: stringify!($name),
                        value,
                    }),
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                ::std::fmt::Debug::fmt(self, f)
            }
        }

        impl ::serde::Serialize for $name {
            fn serialize<S: ::serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_i64(*self as i64)
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $name {
            fn deserialize<D: ::serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let value = <i64 as ::serde::Deserialize>::deserialize(deserializer)?;
                <$name as ::std::convert::TryFrom<i64>>::try_from(value)
                    .map_err(::serde::de::Error::custom)
            }
        }
    };
}

// =============================================================================
// Object Kinds
// =============================================================================

wire_enum! {
    /// Discriminant of every TLC-FI object.
    ObjectType {
        Session = 0,
        TLCFacilities = 1,
        Intersection = 2,
        SignalGroup = 3,
        Detector = 4,
        Input = 5,
        Output = 6,
        SpecialVehicleEventGenerator = 7,
        Variable = 8,
    }
}

wire_enum! {
    /// Role the client registers as.
    ApplicationType {
        Consumer = 0,
        Provider = 1,
        Control = 2,
    }
}

impl std::str::FromStr for ApplicationType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "consumer" => Ok(ApplicationType::Consumer),
            "provider" => Ok(ApplicationType::Provider),
            "control" => Ok(ApplicationType::Control),
            _ => Err(ValidationError::UnknownName {
                kind: "ApplicationType",
                name: s.to_string(),
            }),
        }
    }
}

// =============================================================================
// Object States
// =============================================================================

wire_enum! {
    /// Signal group state (TLC-FI signal group state model).
    SignalGroupState {
        Unavailable = 0,
        Dark = 1,
        StopThenProceed = 2,
        StopAndRemain = 3,
        PreMovement = 4,
        PermissiveMovementAllowed = 5,
        ProtectedMovementAllowed = 6,
        PermissiveClearance = 7,
        ProtectedClearance = 8,
        CautionConflictingTraffic = 9,
        PermissiveMovementPreClearance = 10,
        ProtectedMovementPreClearance = 11,
    }
}

wire_enum! {
    /// Capability offered when taking over or handing back control.
    HandoverCapability {
        NoHandover = 0,
        Release = 1,
        Graceful = 2,
        Immediate = 3,
    }
}

wire_enum! {
    DetectorState {
        Free = 0,
        Occupied = 1,
    }
}

wire_enum! {
    DetectorFaultState {
        NoFault = 0,
        TooLongUnoccupied = 1,
        TooLongOccupied = 2,
        Flutter = 3,
        HardwareError = 4,
    }
}

wire_enum! {
    /// Fault state of inputs, outputs and the special vehicle generator.
    FaultState {
        NoFault = 0,
        Faulted = 1,
    }
}

wire_enum! {
    /// Switch-in/out override of a detector or input.
    SwicoState {
        NoOverride = 0,
        ForcedOn = 1,
        ForcedOff = 2,
    }
}

// =============================================================================
// Protocol Codes
// =============================================================================

wire_enum! {
    /// Error codes carried in JSON-RPC error objects.
    ProtocolErrorCode {
        Error = 0,
        NotAuthorized = 1,
        NoRights = 2,
        InvalidProtocol = 3,
        AlreadyRegistered = 4,
        UnknownObjectType = 5,
        MissingAttribute = 6,
        InvalidAttributeType = 7,
        InvalidAttributeValue = 8,
        InvalidObjectReference = 9,
    }
}

wire_enum! {
    /// Event codes the facility may raise on a session.
    SessionEventCode {
        Deregistered = 0,
        FacilitiesStopping = 1,
        UpdateStateFailedIncorrectControlState = 1000,
        UpdateStateFailedIncorrectIntersectionState = 1001,
        UpdateStateFailedIncorrectObjectState = 1002,
    }
}

// =============================================================================
// Object Reference
// =============================================================================

/// Reference to one or more objects of the same kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectReference {
    #[serde(rename = "type")]
    pub object_type: ObjectType,
    pub ids: Vec<String>,
}

impl ObjectReference {
    pub fn new(object_type: ObjectType, ids: Vec<String>) -> Self {
        ObjectReference { object_type, ids }
    }

    pub fn single(object_type: ObjectType, id: impl Into<String>) -> Self {
        ObjectReference {
            object_type,
            ids: vec![id.into()],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

// =============================================================================
// Validators
// =============================================================================

/// Exclusive bounds for integer states of inputs, outputs and variables.
pub const INT_STATE_MIN_EXCLUSIVE: i64 = -32768;
pub const INT_STATE_MAX_EXCLUSIVE: i64 = 32768;

/// Returns true if `id` is non-empty and uses only `[A-Za-z0-9_-]`.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Validates an object id.
pub fn validate_id(id: &str) -> Result<(), ValidationError> {
    if is_valid_id(id) {
        Ok(())
    } else {
        Err(ValidationError::InvalidObjectId(id.to_string()))
    }
}

/// Validates an integer state and narrows it to `i32`.
pub fn validate_int_state(field: &'static str, value: i64) -> Result<i32, ValidationError> {
    if value > INT_STATE_MIN_EXCLUSIVE && value < INT_STATE_MAX_EXCLUSIVE {
        Ok(value as i32)
    } else {
        Err(ValidationError::OutOfRange { field, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_serializes_as_integer() {
        let json = serde_json::to_string(&SignalGroupState::ProtectedMovementAllowed).unwrap();
        assert_eq!(json, "6");

        let parsed: ObjectType = serde_json::from_str("3").unwrap();
        assert_eq!(parsed, ObjectType::SignalGroup);
    }

    #[test]
    fn test_unknown_enum_value_rejected() {
        assert!(serde_json::from_str::<ObjectType>("42").is_err());
        assert_eq!(
            DetectorFaultState::try_from(9),
            Err(ValidationError::UnknownEnumValue {
                kind: "DetectorFaultState",
                value: 9
            })
        );
    }

    #[test]
    fn test_application_type_from_str() {
        assert_eq!("control".parse::<ApplicationType>().unwrap(), ApplicationType::Control);
        assert_eq!("Consumer".parse::<ApplicationType>().unwrap(), ApplicationType::Consumer);
        assert!("observer".parse::<ApplicationType>().is_err());
    }

    #[test]
    fn test_session_event_codes() {
        assert_eq!(
            SessionEventCode::try_from(1001).unwrap(),
            SessionEventCode::UpdateStateFailedIncorrectIntersectionState
        );
    }

    #[test]
    fn test_object_reference_wire_names() {
        let reference = ObjectReference::single(ObjectType::Intersection, "K205195");
        let value = serde_json::to_value(&reference).unwrap();
        assert_eq!(value["type"], 2);
        assert_eq!(value["ids"][0], "K205195");
    }

    #[test]
    fn test_id_validation() {
        assert!(is_valid_id("K205195"));
        assert!(is_valid_id("sg_02-a"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("02 "));
        assert!(validate_id("a.b").is_err());
    }

    #[test]
    fn test_int_state_bounds() {
        assert_eq!(validate_int_state("state", 32767), Ok(32767));
        assert_eq!(validate_int_state("state", -32767), Ok(-32767));
        assert!(validate_int_state("state", 32768).is_err());
        assert!(validate_int_state("state", -32768).is_err());
    }
}
