//! # tlcfi-client: Async TLC-FI Client
//!
//! Connects a controller application to a traffic light controller facility
//! (TLC) over JSON-RPC/TCP, keeps the session alive, and runs the handover of
//! intersection control between the facility and the application.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Client Architecture                             │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 TlcfiClient (facade, reconnect loop)             │  │
//! │  └──────────┬──────────────────────┬─────────────────────┬──────────┘  │
//! │             ▼                      ▼                     ▼             │
//! │  ┌────────────────┐   ┌────────────────────┐   ┌──────────────────┐   │
//! │  │ SessionManager │   │ ClientInitializer  │   │ Registry         │   │
//! │  │ backoff, 42 s  │   │ Register, ReadMeta │   │ objects, dirty   │   │
//! │  │ between regs   │   │ Subscribe, Offline │   │ set, latency     │   │
//! │  └───────┬────────┘   └─────────┬──────────┘   └──────────────────┘   │
//! │          ▼                      ▼                                      │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │ ConnectionSession: alive timers, inbound UpdateState, close      │  │
//! │  └──────────────────────────────┬───────────────────────────────────┘  │
//! │                                 ▼                                      │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │ Transport: TCP, brace framing, JSON-RPC id matching              │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`client`] - `TlcfiClient` facade and `ClientEvent`s
//! - [`config`] - TOML configuration and validation
//! - [`error`] - Client error types
//! - [`session_manager`] - Connection attempts with backoff
//! - [`session`] - One TCP session and its inbound handling
//! - [`initializer`] - Registration and subscription sequence
//! - [`registry`] - Per-session object registry
//! - [`alive`] - Alive send/receive watchdogs
//! - [`rpc`] - Typed proxy and channel traits
//! - [`transport`] - TCP channel
//! - [`framing`] - Brace-balanced JSON framing
//! - [`protocol`] - JSON-RPC and TLC-FI message types
//! - [`cancel`] - Hierarchical cancellation scopes
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tlcfi_client::{ClientConfig, TlcfiClient};
//!
//! let config = ClientConfig::load(None)?;
//! let client = TlcfiClient::new(config)?;
//!
//! let runner = client.clone();
//! tokio::spawn(async move { runner.start_session().await });
//!
//! client.request_session_start_control().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod alive;
pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod framing;
pub mod initializer;
pub mod protocol;
pub mod registry;
pub mod rpc;
pub mod session;
pub mod session_manager;
pub mod transport;

#[cfg(test)]
mod test_support;

// =============================================================================
// Re-exports
// =============================================================================

pub use cancel::CancelScope;
pub use client::{ClientEvent, ClientEventEmitter, NoOpEmitter, TlcfiClient, TlcfiClientBuilder};
pub use config::{ApplicationConfig, ClientConfig, RemoteConfig, TimingConfig};
pub use error::{ClientError, ClientResult};
pub use initializer::{ClientInitializer, SessionInitializer};
pub use protocol::{ObjectEvent, ObjectStateUpdateGroup};
pub use registry::{Registry, RegistryEvent};
pub use rpc::{Connector, RpcChannel, RpcHandler, TlcProxy};
pub use session::{ConnectionSession, SessionEvent, SessionFlags};
pub use session_manager::{SessionManager, SessionSource, StepBackoff};
pub use transport::TcpConnector;
