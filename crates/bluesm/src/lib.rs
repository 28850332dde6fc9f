//! bluesm - A Bluetooth Low Energy Security Manager
//!
//! This library implements the host side of the LE Security Manager Protocol:
//! pairing feature negotiation, LE Legacy and LE Secure Connections key
//! agreement, key distribution and bonding. It talks to the controller
//! through a [`smp::Transport`]; the [`hci`] module provides one that speaks
//! HCI, and [`smp::loopback`] one that connects two managers in memory.

pub mod error;
pub mod gap;
pub mod hci;
pub mod smp;

// Re-export common types for convenience
pub use error::LinkError;
pub use gap::{Address, AddressType, BdAddr, Role};
pub use hci::{HciCommand, HciEvent, HciLink};
pub use smp::{
    BondStore, IoCapability, KeyDistribution, MemoryBondStore, SecurityConfig, SecurityLevel,
    SecurityManager, SmEvent, SmNotification, SmpError, Transport,
};
