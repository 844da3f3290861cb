//! # Client Error Types
//!
//! Error types for the TLC-FI client.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Client Error Categories                            │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  Rpc { code, message }  │ │
//! │  │  ConfigLoad/Save│  │  Disconnected   │  │  InvalidMessage         │ │
//! │  │  InvalidUri     │  │  Timeout        │  │  SerializationFailed    │ │
//! │  └─────────────────┘  │  Cancelled      │  └─────────────────────────┘ │
//! │                       └─────────────────┘                              │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Session      │  │    Registry     │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Session {      │  │  Core(..)       │  │  ChannelError           │ │
//! │  │   message,      │  │  object not     │  │  NotConnected           │ │
//! │  │   fatal }       │  │  found, dupes   │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only the session loop decides whether to reconnect; it looks at
//! [`ClientError::is_fatal`].

use thiserror::Error;
use tlcfi_core::{CoreError, ProtocolErrorCode};

/// Result type alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid client configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    #[error("Invalid callback URI: {0}")]
    InvalidUri(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Disconnected from TLC facilities")]
    Disconnected,

    /// No reply within the given number of milliseconds.
    #[error("Timeout after {0} ms")]
    Timeout(u64),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Not connected")]
    NotConnected,

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// The remote answered with a JSON-RPC error object.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Session Errors
    // =========================================================================
    /// Initialization or session failure; `fatal` stops reconnecting.
    #[error("{}{}", fatal_marker(.fatal), .message)]
    Session { message: String, fatal: bool },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    #[error(transparent)]
    Core(#[from] CoreError),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Channel error: {0}")]
    ChannelError(String),
}

fn fatal_marker(fatal: &bool) -> &'static str {
    if *fatal {
        "(FATAL!) "
    } else {
        ""
    }
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for ClientError {
    fn from(err: url::ParseError) -> Self {
        ClientError::InvalidUri(err.to_string())
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for ClientError {
    fn from(err: toml::de::Error) -> Self {
        ClientError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for ClientError {
    fn from(err: toml::ser::Error) -> Self {
        ClientError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl ClientError {
    pub fn session(message: impl Into<String>, fatal: bool) -> Self {
        ClientError::Session {
            message: message.into(),
            fatal,
        }
    }

    /// Returns true if this error must stop the reconnect loop.
    pub fn is_fatal(&self) -> bool {
        match self {
            ClientError::Session { fatal, .. } => *fatal,
            ClientError::Core(err) => err.is_fatal(),
            _ => false,
        }
    }

    /// Returns true if the failed operation can simply be tried again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionFailed(_)
                | ClientError::Disconnected
                | ClientError::Timeout(_)
                | ClientError::NotConnected
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Cancelled)
    }

    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ClientError::InvalidConfig(_)
                | ClientError::ConfigLoadFailed(_)
                | ClientError::ConfigSaveFailed(_)
                | ClientError::InvalidUri(_)
        )
    }

    /// The TLC-FI error code of an [`ClientError::Rpc`], if it is a known one.
    pub fn protocol_code(&self) -> Option<ProtocolErrorCode> {
        match self {
            ClientError::Rpc { code, .. } => ProtocolErrorCode::try_from(*code).ok(),
            _ => None,
        }
    }

    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            ClientError::Rpc { .. }
                | ClientError::InvalidMessage(_)
                | ClientError::SerializationFailed(_)
        )
    }

    /// Wraps any error raised during session setup into a [`ClientError::Session`].
    ///
    /// Session errors pass through unchanged.
    pub fn into_session_error(self) -> Self {
        match self {
            err @ ClientError::Session { .. } => err,
            err => {
                let fatal = err.is_fatal();
                ClientError::Session {
                    message: err.to_string(),
                    fatal,
                }
            }
        }
    }
}
