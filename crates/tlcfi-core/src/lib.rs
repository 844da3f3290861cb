//! # tlcfi-core: Pure Protocol Model for TLC-FI
//!
//! This crate holds everything about the TLC-FI protocol that does not touch
//! a socket or a timer: the ticks clock, the control state machine, the wire
//! enumerations and the object model with dirty tracking.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        TLC-FI Client Architecture                       │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Consuming controller application                │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ TlcfiClient API + events              │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    tlcfi-client                                 │   │
//! │  │  SessionManager, ConnectionSession, Initializer, Registry       │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tlcfi-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │  control  │  │  objects  │  │   store   │  │  compat   │  │   │
//! │  │   │ Control-  │  │ TlcObject │  │ ObjectKey │  │ Expected- │  │   │
//! │  │   │ State     │  │ Tracked<T>│  │ index     │  │ Ids       │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO NETWORK • NO TIMERS                               │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Wire enumerations, object references, id/range validators
//! - [`control`] - `ControlState`, `IntersectionControlState`, transition table
//! - [`ticks`] - 32-bit wrapping millisecond clock
//! - [`objects`] - Tagged union of protocol objects with dirty tracking
//! - [`store`] - Per-session object store and its initialization checks
//! - [`latency`] - Rolling response time window
//! - [`compat`] - Configured ids vs facility ids
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use tlcfi_core::control::{is_transition_ok, ControlState};
//!
//! assert!(is_transition_ok(ControlState::Offline, ControlState::ReadyToControl));
//! assert!(!is_transition_ok(ControlState::Offline, ControlState::InControl));
//! assert!(is_transition_ok(ControlState::InControl, ControlState::Error));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod types;

pub mod compat;
pub mod control;
pub mod error;
pub mod latency;
pub mod objects;
pub mod store;
pub mod ticks;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use compat::{CompatReport, ExpectedIds};
pub use control::{is_transition_ok, ControlState, IntersectionControlState};
pub use error::{CoreError, CoreResult, ValidationError};
pub use latency::LatencyWindow;
pub use objects::{Prediction, TlcObject, Tracked};
pub use store::{ObjectKey, ObjectStore, StoreSummary};
pub use ticks::TicksClock;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// TLC-FI protocol version implemented by this crate.
pub const PROTOCOL_VERSION: (u32, u32, u32) = (1, 1, 0);

/// Maximum number of predictions per signal group.
pub const MAX_PREDICTIONS: usize = 16;

/// Number of response time samples in the rolling average.
pub const LATENCY_WINDOW: usize = 50;

/// Minimum time between two successful registrations.
///
/// Protocol compliance value; keep it exact.
pub const MIN_REGISTER_INTERVAL_SECS: u64 = 42;

/// How long a consuming application has to confirm a remote EndControl.
pub const END_CONTROL_GRACE_SECS: u64 = 180;
