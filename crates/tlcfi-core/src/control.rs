//! # Control States
//!
//! Session control state machine and intersection control states.
//!
//! ## Session Control Handover
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    ControlState Transition Table                        │
//! │                                                                         │
//! │   Error ──► NotConfigured ──► Offline ──► ReadyToControl               │
//! │                                  ▲  ▲            │                      │
//! │                                  │  │            ▼                      │
//! │                                  │  └──── StartControl                 │
//! │                                  │               │                      │
//! │                                  │               ▼                      │
//! │                   ReadyToControl ◄────────── InControl                  │
//! │                          ▲               │       │                      │
//! │                          │               │       ▼                      │
//! │                          └──────────────┴─── EndControl ──► Offline    │
//! │                                                                         │
//! │   Any state ──► Error is always legal.                                 │
//! │   The facility is authoritative: an illegal transition it reports is   │
//! │   logged by the session layer, never rejected.                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

crate::wire_enum! {
    /// Control state of a Control application's session.
    ControlState {
        Error = 0,
        NotConfigured = 1,
        Offline = 2,
        ReadyToControl = 3,
        StartControl = 4,
        InControl = 5,
        EndControl = 6,
    }
}

crate::wire_enum! {
    /// State of an intersection as reported (or requested) over TLC-FI.
    IntersectionControlState {
        Error = 0,
        Dark = 1,
        Standby = 2,
        AlternativeStandby = 3,
        SwitchOn = 4,
        SwitchOff = 5,
        AllRed = 6,
        Control = 7,
    }
}

impl ControlState {
    /// Returns true while the session holds (or is handing back) control.
    pub fn is_controlling(self) -> bool {
        matches!(self, ControlState::InControl | ControlState::EndControl)
    }
}

/// Returns true if the facility may move a session from `old` to `new`.
pub fn is_transition_ok(old: ControlState, new: ControlState) -> bool {
    if new == ControlState::Error {
        return true;
    }

    match old {
        ControlState::Error => new == ControlState::NotConfigured,
        ControlState::NotConfigured => new == ControlState::Offline,
        ControlState::Offline => new == ControlState::ReadyToControl,
        ControlState::ReadyToControl => new == ControlState::StartControl,
        ControlState::StartControl => {
            matches!(new, ControlState::InControl | ControlState::Offline)
        }
        ControlState::InControl => matches!(
            new,
            ControlState::EndControl | ControlState::ReadyToControl | ControlState::Offline
        ),
        ControlState::EndControl => {
            matches!(new, ControlState::ReadyToControl | ControlState::Offline)
        }
    }
}
