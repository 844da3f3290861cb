//! # Compatibility Check
//!
//! Compares the object ids a client is configured for with the ids the
//! facility (or one of its intersections) actually exposes.
//!
//! ## Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Kind          Local id missing remotely   Remote id missing locally   │
//! │  ────────────  ─────────────────────────   ─────────────────────────   │
//! │  SignalGroup   error                       error                       │
//! │  Detector      error                       warning                     │
//! │  Input         error                       warning                     │
//! │  Output        error                       warning                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The checker is pure: callers decide how to log the report.

use serde::{Deserialize, Serialize};

use crate::objects::{Facilities, Intersection};
use crate::types::ObjectType;

/// Ids the client is configured to work with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedIds {
    #[serde(default)]
    pub signal_groups: Vec<String>,
    #[serde(default)]
    pub detectors: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// Outcome of a compatibility check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompatReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl CompatReport {
    pub fn is_compatible(&self) -> bool {
        self.errors.is_empty()
    }

    fn missing(&mut self, kind: ObjectType, local: &[String], remote: &[String], source: &str) {
        for id in local.iter().filter(|id| !remote.contains(id)) {
            self.errors
                .push(format!("{} with id {} from config not found in {}", kind, id, source));
        }
    }

    fn extra(&mut self, kind: ObjectType, local: &[String], remote: &[String], source: &str, fatal: bool) {
        for id in remote.iter().filter(|id| !local.contains(id)) {
            let message = format!("{} with id {} from {} not found in config", kind, id, source);
            if fatal {
                self.errors.push(message);
            } else {
                self.warnings.push(message);
            }
        }
    }
}

/// Checks configured ids against the facility-wide lists.
pub fn check_against_facilities(expected: &ExpectedIds, facilities: &Facilities) -> CompatReport {
    let source = "TLC facilities";
    let mut report = CompatReport::default();

    report.extra(ObjectType::SignalGroup, &expected.signal_groups, &facilities.signalgroups, source, true);
    report.missing(ObjectType::SignalGroup, &expected.signal_groups, &facilities.signalgroups, source);

    report.missing(ObjectType::Detector, &expected.detectors, &facilities.detectors, source);
    report.extra(ObjectType::Detector, &expected.detectors, &facilities.detectors, source, false);

    report.missing(ObjectType::Input, &expected.inputs, &facilities.inputs, source);
    report.extra(ObjectType::Input, &expected.inputs, &facilities.inputs, source, false);

    report.missing(ObjectType::Output, &expected.outputs, &facilities.outputs, source);
    report.extra(ObjectType::Output, &expected.outputs, &facilities.outputs, source, false);

    report
}

/// Checks configured ids against one intersection.
///
/// When `all_outputs` is given, outputs are checked against the facility-wide
/// list instead, so non-exclusive outputs can be configured.
pub fn check_against_intersection(
    expected: &ExpectedIds,
    intersection: &Intersection,
    all_outputs: Option<&Facilities>,
) -> CompatReport {
    let source = "TLC intersection";
    let mut report = CompatReport::default();

    report.extra(ObjectType::SignalGroup, &expected.signal_groups, &intersection.signalgroups, source, true);
    report.missing(ObjectType::SignalGroup, &expected.signal_groups, &intersection.signalgroups, source);

    report.missing(ObjectType::Detector, &expected.detectors, &intersection.detectors, source);
    report.extra(ObjectType::Detector, &expected.detectors, &intersection.detectors, source, false);

    report.missing(ObjectType::Input, &expected.inputs, &intersection.inputs, source);
    report.extra(ObjectType::Input, &expected.inputs, &intersection.inputs, source, false);

    let (outputs, output_source) = match all_outputs {
        Some(facilities) => (&facilities.outputs, "TLC facilities"),
        None => (&intersection.outputs, source),
    };
    report.missing(ObjectType::Output, &expected.outputs, outputs, output_source);
    report.extra(ObjectType::Output, &expected.outputs, outputs, output_source, false);

    report
}
