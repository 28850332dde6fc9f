//! Events into and notifications out of the Security Manager
//!
//! Everything that happens to a connection reaches the manager as an
//! [`SmEvent`] on the host's serialized event queue. Everything the
//! application needs to see comes back as an [`SmNotification`].

use super::types::*;
use crate::error::LinkError;
use crate::gap::{Address, Role};

/// Input events for [`SecurityManager::handle_event`](super::SecurityManager::handle_event)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmEvent {
    /// An SM PDU arrived on the fixed channel
    PduReceived { conn: ConnHandle, data: Vec<u8> },
    /// Encryption Change or Key Refresh from the controller
    EncryptionChanged {
        conn: ConnHandle,
        status: u8,
        enabled: bool,
        key_size: Option<u8>,
    },
    /// LE Long Term Key Request from the controller (peripheral role)
    LtkRequest { conn: ConnHandle, ediv: u16, rand: u64 },
    /// Passkey typed by the user, `None` if the user gave up
    PasskeyInput { conn: ConnHandle, passkey: Option<u32> },
    /// User's answer to a numeric comparison
    NumericComparison { conn: ConnHandle, accept: bool },
    /// The application freed space in the bond store
    StoreRoomMade,
    /// Local abort of a pairing in progress
    Cancel { conn: ConnHandle },
    /// The connection is gone
    ConnectionLost { conn: ConnHandle, reason: u8 },
}

/// Result of a completed pairing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingOutcome {
    pub method: PairingMethod,
    /// Requirement actually achieved
    pub achieved: SecurityRequirement,
    /// Whether a bond record was written
    pub bonded: bool,
    /// Identity the bond is stored under
    pub peer_identity: Option<Address>,
    /// Key types of ours held in the bond record
    pub local_keys: KeyDistribution,
    /// Key types of the peer held in the bond record
    pub peer_keys: KeyDistribution,
}

/// Notifications to the application
#[derive(Debug)]
pub enum SmNotification {
    /// Show this passkey to the user
    PasskeyDisplay { conn: ConnHandle, passkey: u32 },
    /// Ask the user to type the passkey shown on the peer
    PasskeyRequest { conn: ConnHandle },
    /// Ask the user whether both devices show this value
    NumericComparison { conn: ConnHandle, value: u32 },
    /// Terminal success of a pairing
    PairingComplete {
        conn: ConnHandle,
        outcome: PairingOutcome,
    },
    /// Terminal failure of a pairing
    PairingFailed { conn: ConnHandle, error: SmpError },
    /// Link encryption state changed
    SecurityChanged {
        conn: ConnHandle,
        security: LinkSecurity,
    },
    /// Re-encryption with a bonded key failed
    EncryptionFailed { conn: ConnHandle, status: u8 },
}

impl SmNotification {
    pub fn conn(&self) -> Option<ConnHandle> {
        match self {
            SmNotification::PasskeyDisplay { conn, .. }
            | SmNotification::PasskeyRequest { conn }
            | SmNotification::NumericComparison { conn, .. }
            | SmNotification::PairingComplete { conn, .. }
            | SmNotification::PairingFailed { conn, .. }
            | SmNotification::SecurityChanged { conn, .. }
            | SmNotification::EncryptionFailed { conn, .. } => Some(*conn),
        }
    }
}

/// Link-layer collaborator: SM PDU transport and controller encryption
pub trait Transport {
    /// Send an SM PDU on the fixed channel of a connection
    fn send_pdu(&mut self, conn: ConnHandle, pdu: &[u8]) -> Result<(), LinkError>;

    /// Start (or refresh) encryption as Central
    fn start_encryption(
        &mut self,
        conn: ConnHandle,
        key: u128,
        ediv: u16,
        rand: u64,
    ) -> Result<(), LinkError>;

    /// Answer an LTK request as Peripheral, `None` for a negative reply
    fn ltk_reply(&mut self, conn: ConnHandle, key: Option<u128>) -> Result<(), LinkError>;
}

/// What the manager knows about a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub handle: ConnHandle,
    pub role: Role,
    /// Our address on this link
    pub local: Address,
    /// Peer address on this link
    pub peer: Address,
}

impl ConnectionInfo {
    pub fn pairing_role(&self) -> PairingRole {
        match self.role {
            Role::Central => PairingRole::Initiator,
            Role::Peripheral => PairingRole::Responder,
        }
    }

    /// (initiator, responder) addresses
    pub fn pairing_addresses(&self) -> (Address, Address) {
        match self.role {
            Role::Central => (self.local, self.peer),
            Role::Peripheral => (self.peer, self.local),
        }
    }
}
