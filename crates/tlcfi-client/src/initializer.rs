//! # Session Initializer
//!
//! Configures a freshly connected session against the facility.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. Register ──────────────────────────────► session id, facilities ref │
//! │  2. Start alive timers                                                  │
//! │  3. ReadMeta + Subscribe Session ─────────► application type check     │
//! │  4. ReadMeta TLCFacilities ───────────────► intersection listed?       │
//! │  5. ReadMeta + Subscribe Intersection (unless ids come from the TLC)   │
//! │  6. Compatibility check of configured ids                               │
//! │  7. ReadMeta of every collection ─── join_all ───┐                     │
//! │  8. registry.initialize(intersection)            │ any failure: fatal  │
//! │  9. Subscribe every collection ───── join_all ───┘ failure: abort      │
//! │ 10. Request Offline, Configured = true                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every failure comes back as [`ClientError::Session`]; only cancellation
//! passes through unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tlcfi_core::compat::{check_against_facilities, check_against_intersection};
use tlcfi_core::objects::Intersection;
use tlcfi_core::{
    ApplicationType, ControlState, CoreError, IntersectionControlState, ObjectReference, ObjectType,
    TlcObject,
};
use tracing::{debug, error, info, warn};

use crate::cancel::CancelScope;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::protocol::{ProtocolVersion, RegistrationRequest};
use crate::session::ConnectionSession;

/// Brings a connected session into the configured state.
#[async_trait]
pub trait SessionInitializer: Send + Sync {
    async fn initialize(&self, session: &Arc<ConnectionSession>, scope: &CancelScope) -> ClientResult<()>;
}

pub struct ClientInitializer {
    config: ClientConfig,
}

impl ClientInitializer {
    pub fn new(config: ClientConfig) -> Self {
        ClientInitializer { config }
    }

    async fn run(&self, session: &Arc<ConnectionSession>, scope: &CancelScope) -> ClientResult<()> {
        let app = &self.config.application;
        let intersection_id = app.intersection_id.as_str();
        let use_tlc_ids = app.use_ids_from_tlc_for_subscription;
        let proxy = session.proxy()?;
        let registry = session.registry();
        let flags = session.flags();

        // Register
        let request = RegistrationRequest {
            username: self.config.remote.username.clone(),
            password: self.config.remote.password.clone(),
            application_type: app.application_type,
            version: ProtocolVersion::current(),
            uri: self.config.remote.callback_uri.clone(),
        };
        let reply = match scope.run(proxy.register(&request)).await {
            Ok(reply) => reply,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => return Err(ClientError::session(format!("Register failed: {}", e), false)),
        };
        if reply.version != ProtocolVersion::current() {
            warn!(remote = %reply.version, local = %ProtocolVersion::current(), "Protocol versions differ");
        }
        flags.set_registered(true);
        info!(session_id = %reply.sessionid, version = %reply.version, "Registered at TLC");

        session.start_alive_timers()?;

        // Session
        let session_ref = ObjectReference::single(ObjectType::Session, reply.sessionid.as_str());
        let meta = scope.run(proxy.read_meta(&session_ref)).await?;
        if meta.meta.len() != 1 {
            return Err(ClientError::session(
                format!("Expected one session object, got {}", meta.meta.len()),
                false,
            ));
        }
        registry.add_from_meta(&meta)?;
        let remote_type = registry.session_application_type();
        if remote_type != Some(app.application_type) {
            return Err(ClientError::session(
                format!(
                    "Application type mismatch: configured {}, TLC reports {:?}",
                    app.application_type, remote_type
                ),
                true,
            ));
        }
        let data = scope.run(proxy.subscribe(&session_ref)).await?;
        registry.seed_state(&data)?;
        if app.application_type == ApplicationType::Control {
            registry.prepare_control_session(app.start_capability, app.end_capability, intersection_id)?;
        }

        // Facilities
        let meta = scope.run(proxy.read_meta(&reply.facilities)).await?;
        if meta.meta.len() != 1 {
            return Err(ClientError::session(
                format!("Expected one facilities object, got {}", meta.meta.len()),
                false,
            ));
        }
        registry.add_from_meta(&meta)?;
        let facilities = registry
            .with_store(|s| s.facilities().cloned())
            .ok_or_else(|| ClientError::session("TLC facilities missing", false))?;
        if !facilities.intersections.iter().any(|id| id == intersection_id) {
            let err = CoreError::not_found(ObjectType::Intersection, intersection_id);
            return Err(ClientError::session(err.to_string(), true));
        }
        info!(
            facilities = %facilities.id,
            intersections = facilities.intersections.len(),
            signal_groups = facilities.signalgroups.len(),
            "Read TLC facilities"
        );

        // Intersection
        let intersection = if use_tlc_ids {
            None
        } else {
            let reference = ObjectReference::single(ObjectType::Intersection, intersection_id);
            let meta = scope.run(proxy.read_meta(&reference)).await?;
            registry.add_from_meta(&meta)?;
            let data = scope.run(proxy.subscribe(&reference)).await?;
            registry.seed_state(&data)?;
            let intersection = registry
                .with_store(|s| match s.find(ObjectType::Intersection, intersection_id) {
                    Some(TlcObject::Intersection(i)) => Some(i.clone()),
                    _ => None,
                })
                .ok_or_else(|| {
                    ClientError::session(CoreError::not_found(ObjectType::Intersection, intersection_id).to_string(), true)
                })?;
            flags.set_intersection_control(intersection.state() == Some(IntersectionControlState::Control));
            Some(intersection)
        };

        // Compatibility
        let report = match &intersection {
            Some(i) => check_against_intersection(
                &self.config.objects,
                i,
                app.subscribe_to_all_outputs.then_some(&facilities),
            ),
            None => check_against_facilities(&self.config.objects, &facilities),
        };
        for warning in &report.warnings {
            warn!("{}", warning);
        }
        for err in &report.errors {
            error!("{}", err);
        }
        if !report.is_compatible() {
            return Err(ClientError::session(
                "Not all necessary objects could be matched",
                true,
            ));
        }

        let references = self.references(&facilities, intersection.as_ref());

        // Meta of every collection
        let metas = scope
            .run(async {
                join_all(references.iter().map(|r| proxy.read_meta(r)))
                    .await
                    .into_iter()
                    .collect::<ClientResult<Vec<_>>>()
            })
            .await;
        let metas = match metas {
            Ok(metas) => metas,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => return Err(ClientError::session(format!("ReadMeta failed: {}", e), true)),
        };
        for meta in &metas {
            let count = registry.add_from_meta(meta)?;
            debug!(object_type = %meta.objects.object_type, count, "Added objects");
        }

        let summary = registry.initialize(intersection_id)?;
        info!(
            signal_groups = summary.signal_groups,
            detectors = summary.detectors,
            inputs = summary.inputs,
            outputs = summary.outputs,
            exclusive_outputs = summary.exclusive_outputs,
            variables = summary.variables,
            "Registry initialized"
        );

        // Initial states
        let results = scope
            .run(async { Ok(join_all(references.iter().map(|r| proxy.subscribe(r))).await) })
            .await?;
        for (reference, result) in references.iter().zip(results) {
            match result {
                Ok(data) => registry.seed_state(&data)?,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    return Err(ClientError::session(
                        format!("Subscribe to {} failed: {}", reference.object_type, e),
                        false,
                    ))
                }
            }
        }

        if use_tlc_ids {
            flags.set_intersection_control(
                registry.intersection_state() == Some(IntersectionControlState::Control),
            );
        }
        if app.application_type == ApplicationType::Control
            && registry.session_req_control_state() != Some(ControlState::Offline)
        {
            scope.run(session.set_req_control_state(ControlState::Offline)).await?;
        }
        flags.set_configured(true);
        Ok(())
    }

    /// Collections to read and subscribe, skipping empty ones.
    fn references(
        &self,
        facilities: &tlcfi_core::objects::Facilities,
        intersection: Option<&Intersection>,
    ) -> Vec<ObjectReference> {
        let app = &self.config.application;
        let (signal_groups, detectors, inputs, generator) = match intersection {
            Some(i) => (&i.signalgroups, &i.detectors, &i.inputs, &i.spvehgenerator),
            None => (
                &facilities.signalgroups,
                &facilities.detectors,
                &facilities.inputs,
                &facilities.spvehgenerator,
            ),
        };
        let outputs = match intersection {
            Some(i) if !app.subscribe_to_all_outputs => &i.outputs,
            _ => &facilities.outputs,
        };

        let mut collections = vec![
            (ObjectType::SignalGroup, signal_groups.clone()),
            (ObjectType::Detector, detectors.clone()),
            (ObjectType::Output, outputs.clone()),
            (ObjectType::Input, inputs.clone()),
            (
                ObjectType::SpecialVehicleEventGenerator,
                generator.iter().cloned().collect(),
            ),
            (ObjectType::Variable, facilities.variables.clone()),
        ];
        if intersection.is_none() {
            collections.push((ObjectType::Intersection, facilities.intersections.clone()));
        }

        collections
            .into_iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(object_type, ids)| ObjectReference::new(object_type, ids))
            .collect()
    }
}

#[async_trait]
impl SessionInitializer for ClientInitializer {
    async fn initialize(&self, session: &Arc<ConnectionSession>, scope: &CancelScope) -> ClientResult<()> {
        match self.run(session, scope).await {
            Ok(()) => {
                info!(intersection = %self.config.application.intersection_id, "Session configured");
                Ok(())
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                let err = e.into_session_error();
                error!(error = %err, "Session initialization failed");
                Err(err)
            }
        }
    }
}
