//! # Client Configuration
//!
//! Configuration management for the TLC-FI client.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TLCFI_REMOTE_ADDRESS=10.0.0.5                                      │
//! │     TLCFI_INTERSECTION_ID=K205195                                      │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tlcfi-client/tlcfi.toml (Linux)                          │
//! │     ~/Library/Application Support/nl.tlcfi.client/tlcfi.toml (macOS)   │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [remote]
//! address = "192.168.1.20"
//! port = 11501
//! username = "cla"
//! password = "secret"
//! callback_uri = "tcp://192.168.1.10:11502"
//!
//! [application]
//! application_type = "control"
//! intersection_id = "K205195"
//! auto_reconnect = true
//!
//! [objects]
//! signal_groups = ["02", "03", "05", "08"]
//! detectors = ["021", "022"]
//!
//! [timing]
//! alive_send_interval_ms = 2000
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use tlcfi_core::{is_valid_id, ApplicationType, ExpectedIds, HandoverCapability};

use crate::error::{ClientError, ClientResult};

// =============================================================================
// Remote Facility
// =============================================================================

/// Where and how to reach the TLC facilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Sent with Register; tells the facility how to reach this client.
    #[serde(default = "default_callback_uri")]
    pub callback_uri: String,
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    11501
}

fn default_callback_uri() -> String {
    "tcp://127.0.0.1:11502".to_string()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            address: default_address(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            callback_uri: default_callback_uri(),
        }
    }
}

impl RemoteConfig {
    /// Returns `address:port`.
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

// =============================================================================
// Application Settings
// =============================================================================

mod application_type_name {
    use serde::{Deserialize, Deserializer, Serializer};
    use tlcfi_core::ApplicationType;

    pub fn serialize<S: Serializer>(value: &ApplicationType, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string().to_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<ApplicationType, D::Error> {
        let name = String::deserialize(d)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// How this client presents itself and reacts to session failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// control | consumer | provider
    #[serde(default = "default_application_type", with = "application_type_name")]
    pub application_type: ApplicationType,

    #[serde(default)]
    pub intersection_id: String,

    /// Wire value of the start handover capability.
    #[serde(default = "default_capability")]
    pub start_capability: HandoverCapability,

    #[serde(default = "default_capability")]
    pub end_capability: HandoverCapability,

    /// Settle time between TCP connect and Register (milliseconds).
    #[serde(default = "default_register_delay")]
    pub register_delay_ms: u64,

    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Number of remote `ControlState = Error` reports before giving up.
    #[serde(default = "default_max_session_errors")]
    pub max_session_error_count: u32,

    #[serde(default)]
    pub subscribe_to_all_outputs: bool,

    /// Take object ids from the facility instead of from the intersection.
    #[serde(default)]
    pub use_ids_from_tlc_for_subscription: bool,
}

fn default_application_type() -> ApplicationType {
    ApplicationType::Control
}

fn default_capability() -> HandoverCapability {
    HandoverCapability::Graceful
}

fn default_register_delay() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_max_session_errors() -> u32 {
    5
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        ApplicationConfig {
            application_type: default_application_type(),
            intersection_id: String::new(),
            start_capability: default_capability(),
            end_capability: default_capability(),
            register_delay_ms: default_register_delay(),
            auto_reconnect: true,
            max_session_error_count: default_max_session_errors(),
            subscribe_to_all_outputs: false,
            use_ids_from_tlc_for_subscription: false,
        }
    }
}

// =============================================================================
// Timing
// =============================================================================

/// Protocol timing, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_alive_send")]
    pub alive_send_interval_ms: u64,

    #[serde(default = "default_alive_receive")]
    pub alive_receive_timeout_ms: u64,

    /// ReadMeta, UpdateState, NotifyEvent.
    #[serde(default = "default_rpc_duration")]
    pub max_rpc_duration_ms: u64,

    /// Register, Deregister, Subscribe.
    #[serde(default = "default_rpc_duration_session")]
    pub max_rpc_duration_session_ms: u64,

    /// How long close() waits for control to be released.
    #[serde(default = "default_release_control")]
    pub max_release_control_ms: u64,
}

fn default_alive_send() -> u64 {
    2000
}

fn default_alive_receive() -> u64 {
    6000
}

fn default_rpc_duration() -> u64 {
    5000
}

fn default_rpc_duration_session() -> u64 {
    10000
}

fn default_release_control() -> u64 {
    10000
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            alive_send_interval_ms: default_alive_send(),
            alive_receive_timeout_ms: default_alive_receive(),
            max_rpc_duration_ms: default_rpc_duration(),
            max_rpc_duration_session_ms: default_rpc_duration_session(),
            max_release_control_ms: default_release_control(),
        }
    }
}

impl TimingConfig {
    pub fn alive_send_interval(&self) -> Duration {
        Duration::from_millis(self.alive_send_interval_ms)
    }

    pub fn alive_receive_timeout(&self) -> Duration {
        Duration::from_millis(self.alive_receive_timeout_ms)
    }

    pub fn max_rpc_duration(&self) -> Duration {
        Duration::from_millis(self.max_rpc_duration_ms)
    }

    pub fn max_rpc_duration_session(&self) -> Duration {
        Duration::from_millis(self.max_rpc_duration_session_ms)
    }

    pub fn max_release_control(&self) -> Duration {
        Duration::from_millis(self.max_release_control_ms)
    }
}

// =============================================================================
// Main Client Configuration
// =============================================================================

/// Complete client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub application: ApplicationConfig,

    /// Object ids this client expects to find at the facility.
    #[serde(default)]
    pub objects: ExpectedIds,

    #[serde(default)]
    pub timing: TimingConfig,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (tlcfi.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> ClientResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading client config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load client config: {}. Using defaults.", e);
            Self::default()
        })
    }

    pub fn save(&self, config_path: Option<PathBuf>) -> ClientResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| ClientError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Client config saved");
        Ok(())
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.remote.address.is_empty() {
            return Err(ClientError::InvalidConfig("remote address is empty".into()));
        }
        if self.remote.port == 0 {
            return Err(ClientError::InvalidConfig("remote port must be non-zero".into()));
        }

        let uri = url::Url::parse(&self.remote.callback_uri)?;
        if uri.cannot_be_a_base() {
            return Err(ClientError::InvalidUri(self.remote.callback_uri.clone()));
        }

        if !is_valid_id(&self.application.intersection_id) {
            return Err(ClientError::InvalidConfig(format!(
                "invalid intersection id '{}'",
                self.application.intersection_id
            )));
        }

        let objects = &self.objects;
        for id in objects
            .signal_groups
            .iter()
            .chain(&objects.detectors)
            .chain(&objects.inputs)
            .chain(&objects.outputs)
        {
            if !is_valid_id(id) {
                return Err(ClientError::InvalidConfig(format!("invalid object id '{}'", id)));
            }
        }

        if self.application.max_session_error_count == 0 {
            return Err(ClientError::InvalidConfig(
                "max_session_error_count must be greater than 0".into(),
            ));
        }

        let t = &self.timing;
        if [
            t.alive_send_interval_ms,
            t.alive_receive_timeout_ms,
            t.max_rpc_duration_ms,
            t.max_rpc_duration_session_ms,
            t.max_release_control_ms,
        ]
        .contains(&0)
        {
            return Err(ClientError::InvalidConfig("timing values must be non-zero".into()));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(address) = std::env::var("TLCFI_REMOTE_ADDRESS") {
            debug!(address = %address, "Overriding remote address from environment");
            self.remote.address = address;
        }

        if let Ok(port) = std::env::var("TLCFI_REMOTE_PORT") {
            match port.parse::<u16>() {
                Ok(p) => self.remote.port = p,
                Err(_) => warn!(port = %port, "Invalid TLCFI_REMOTE_PORT"),
            }
        }

        if let Ok(username) = std::env::var("TLCFI_USERNAME") {
            self.remote.username = username;
        }

        if let Ok(password) = std::env::var("TLCFI_PASSWORD") {
            self.remote.password = password;
        }

        if let Ok(id) = std::env::var("TLCFI_INTERSECTION_ID") {
            debug!(intersection = %id, "Overriding intersection from environment");
            self.application.intersection_id = id;
        }

        if let Ok(kind) = std::env::var("TLCFI_APPLICATION_TYPE") {
            match kind.parse() {
                Ok(parsed) => self.application.application_type = parsed,
                Err(_) => warn!(kind = %kind, "Unknown application type in environment"),
            }
        }

        if let Ok(flag) = std::env::var("TLCFI_AUTO_RECONNECT") {
            match flag.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.application.auto_reconnect = true,
                "0" | "false" | "no" => self.application.auto_reconnect = false,
                _ => warn!(flag = %flag, "Invalid TLCFI_AUTO_RECONNECT"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("nl", "tlcfi", "client")
            .map(|dirs| dirs.config_dir().join("tlcfi.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn application_type(&self) -> ApplicationType {
        self.application.application_type
    }

    pub fn intersection_id(&self) -> &str {
        &self.application.intersection_id
    }

    pub fn is_control_application(&self) -> bool {
        self.application.application_type == ApplicationType::Control
    }
}
