//! Application security configuration
//!
//! The configuration is read once when a pairing session starts and is held
//! unchanged by that session. It can be loaded from TOML:
//!
//! ```toml
//! io_capability = "keyboard_display"
//! bonding = true
//! mitm = true
//! secure_connections = true
//! our_key_dist = "ENC_KEY | ID_KEY"
//! their_key_dist = "ENC_KEY | ID_KEY"
//! ```

use super::constants::*;
use super::types::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Local security configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecurityConfig {
    pub io_capability: IoCapability,
    pub oob_data_present: bool,
    /// Accept new pairings; when false only existing bonds are used
    pub pairable: bool,
    pub bonding: bool,
    pub mitm: bool,
    pub secure_connections: bool,
    /// Refuse legacy pairing altogether
    pub sc_only: bool,
    /// Key-press notifications; must stay false
    pub keypress: bool,
    /// Keys this device offers to distribute
    pub our_key_dist: KeyDistribution,
    /// Keys this device asks the peer to distribute
    pub their_key_dist: KeyDistribution,
    pub min_key_size: u8,
    pub max_key_size: u8,
    pub pairing_timeout_ms: u64,
    pub max_failed_attempts: u32,
    pub attempt_window_secs: u64,
    /// Hex IRK, most significant octet first. Generated at startup when unset.
    pub identity_irk: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            io_capability: IoCapability::NoInputNoOutput,
            oob_data_present: false,
            pairable: true,
            bonding: true,
            mitm: false,
            secure_connections: true,
            sc_only: false,
            keypress: false,
            our_key_dist: KeyDistribution::ENC_KEY | KeyDistribution::ID_KEY,
            their_key_dist: KeyDistribution::ENC_KEY | KeyDistribution::ID_KEY,
            min_key_size: SMP_MIN_ENCRYPTION_KEY_SIZE,
            max_key_size: SMP_MAX_ENCRYPTION_KEY_SIZE,
            pairing_timeout_ms: SMP_TIMEOUT_GENERAL,
            max_failed_attempts: SMP_DEFAULT_MAX_FAILED_ATTEMPTS,
            attempt_window_secs: SMP_DEFAULT_ATTEMPT_WINDOW_SECS,
            identity_irk: None,
        }
    }
}

impl SecurityConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keypress {
            return Err(ConfigError::Invalid(
                "key-press notifications are not supported".into(),
            ));
        }
        if self.min_key_size < SMP_MIN_ENCRYPTION_KEY_SIZE
            || self.max_key_size > SMP_MAX_ENCRYPTION_KEY_SIZE
            || self.min_key_size > self.max_key_size
        {
            return Err(ConfigError::Invalid(format!(
                "key size range {}..={} outside {}..={}",
                self.min_key_size,
                self.max_key_size,
                SMP_MIN_ENCRYPTION_KEY_SIZE,
                SMP_MAX_ENCRYPTION_KEY_SIZE
            )));
        }
        if self.pairing_timeout_ms == 0 {
            return Err(ConfigError::Invalid("pairing timeout must be non-zero".into()));
        }
        if self.max_failed_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_failed_attempts must be at least 1".into(),
            ));
        }
        if self.sc_only && !self.secure_connections {
            return Err(ConfigError::Invalid(
                "sc_only requires secure_connections".into(),
            ));
        }
        let unsupported = (self.our_key_dist | self.their_key_dist) - KeyDistribution::SUPPORTED;
        if !unsupported.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "unsupported key distribution bits {:?}",
                unsupported
            )));
        }
        self.identity_irk()?;
        Ok(())
    }

    /// AuthReq octet advertised in our Pairing Request/Response
    pub fn auth_req(&self) -> AuthReq {
        let mut auth_req = AuthReq::empty();
        auth_req.set(AuthReq::BONDING, self.bonding);
        auth_req.set(AuthReq::MITM, self.mitm);
        auth_req.set(AuthReq::SC, self.secure_connections);
        auth_req
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_millis(self.pairing_timeout_ms)
    }

    pub fn attempt_window(&self) -> Duration {
        Duration::from_secs(self.attempt_window_secs)
    }

    pub fn identity_irk(&self) -> Result<Option<u128>, ConfigError> {
        let Some(text) = &self.identity_irk else {
            return Ok(None);
        };
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(text.trim(), &mut bytes)
            .map_err(|e| ConfigError::Invalid(format!("identity_irk: {}", e)))?;
        Ok(Some(u128::from_be_bytes(bytes)))
    }
}
