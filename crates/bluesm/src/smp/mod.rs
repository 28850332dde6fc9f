//! Security Manager Protocol (SMP) implementation
//!
//! This module implements the LE Security Manager, which is responsible for:
//! - Negotiating pairing features and the association model
//! - LE Legacy and LE Secure Connections key agreement
//! - Distributing keys and persisting bonds
//! - Answering the controller's requests for bonded keys

mod agreement;
pub mod config;
pub mod constants;
pub mod crypto;
mod distribution;
mod events;
mod keys;
pub mod loopback;
mod manager;
mod pairing;
mod pdu;
pub mod policy;
mod throttle;
mod types;


// Re-export public API
pub use self::config::{ConfigError, SecurityConfig};
pub use self::crypto::ScOobData;
pub use self::events::*;
pub use self::keys::*;
pub use self::manager::SecurityManager;
pub use self::pdu::{PairingFeatures, SmpPdu};
pub use self::policy::Negotiation;
pub use self::types::*;
