//! Type definitions for the Security Manager Protocol
use super::constants::*;
use super::keys::StoreError;
use crate::error::LinkError;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Connection handle as assigned by the controller
pub type ConnHandle = u16;

/// Pairing Failed reason codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reason {
    PasskeyEntryFailed = SMP_REASON_PASSKEY_ENTRY_FAILED,
    OobNotAvailable = SMP_REASON_OOB_NOT_AVAILABLE,
    AuthenticationRequirements = SMP_REASON_AUTHENTICATION_REQUIREMENTS,
    ConfirmValueFailed = SMP_REASON_CONFIRM_VALUE_FAILED,
    PairingNotSupported = SMP_REASON_PAIRING_NOT_SUPPORTED,
    EncryptionKeySize = SMP_REASON_ENCRYPTION_KEY_SIZE,
    CommandNotSupported = SMP_REASON_COMMAND_NOT_SUPPORTED,
    UnspecifiedReason = SMP_REASON_UNSPECIFIED_REASON,
    RepeatedAttempts = SMP_REASON_REPEATED_ATTEMPTS,
    InvalidParameters = SMP_REASON_INVALID_PARAMETERS,
    DhKeyCheckFailed = SMP_REASON_DHKEY_CHECK_FAILED,
    NumericComparisonFailed = SMP_REASON_NUMERIC_COMPARISON_FAILED,
    BrEdrPairingInProgress = SMP_REASON_BR_EDR_PAIRING_IN_PROGRESS,
    CrossTransportKeyNotAllowed = SMP_REASON_CROSS_TRANSPORT_KEY_NOT_ALLOWED,
}

impl Reason {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        let reason = match value {
            SMP_REASON_PASSKEY_ENTRY_FAILED => Reason::PasskeyEntryFailed,
            SMP_REASON_OOB_NOT_AVAILABLE => Reason::OobNotAvailable,
            SMP_REASON_AUTHENTICATION_REQUIREMENTS => Reason::AuthenticationRequirements,
            SMP_REASON_CONFIRM_VALUE_FAILED => Reason::ConfirmValueFailed,
            SMP_REASON_PAIRING_NOT_SUPPORTED => Reason::PairingNotSupported,
            SMP_REASON_ENCRYPTION_KEY_SIZE => Reason::EncryptionKeySize,
            SMP_REASON_COMMAND_NOT_SUPPORTED => Reason::CommandNotSupported,
            SMP_REASON_UNSPECIFIED_REASON => Reason::UnspecifiedReason,
            SMP_REASON_REPEATED_ATTEMPTS => Reason::RepeatedAttempts,
            SMP_REASON_INVALID_PARAMETERS => Reason::InvalidParameters,
            SMP_REASON_DHKEY_CHECK_FAILED => Reason::DhKeyCheckFailed,
            SMP_REASON_NUMERIC_COMPARISON_FAILED => Reason::NumericComparisonFailed,
            SMP_REASON_BR_EDR_PAIRING_IN_PROGRESS => Reason::BrEdrPairingInProgress,
            SMP_REASON_CROSS_TRANSPORT_KEY_NOT_ALLOWED => Reason::CrossTransportKeyNotAllowed,
            _ => return None,
        };
        Some(reason)
    }

    fn is_authentication(self) -> bool {
        matches!(
            self,
            Reason::PasskeyEntryFailed
                | Reason::OobNotAvailable
                | Reason::AuthenticationRequirements
                | Reason::ConfirmValueFailed
                | Reason::EncryptionKeySize
                | Reason::PairingNotSupported
                | Reason::RepeatedAttempts
                | Reason::DhKeyCheckFailed
                | Reason::NumericComparisonFailed
        )
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Reason::PasskeyEntryFailed => "Passkey Entry Failed",
            Reason::OobNotAvailable => "OOB Not Available",
            Reason::AuthenticationRequirements => "Authentication Requirements",
            Reason::ConfirmValueFailed => "Confirm Value Failed",
            Reason::PairingNotSupported => "Pairing Not Supported",
            Reason::EncryptionKeySize => "Encryption Key Size",
            Reason::CommandNotSupported => "Command Not Supported",
            Reason::UnspecifiedReason => "Unspecified Reason",
            Reason::RepeatedAttempts => "Repeated Attempts",
            Reason::InvalidParameters => "Invalid Parameters",
            Reason::DhKeyCheckFailed => "DHKey Check Failed",
            Reason::NumericComparisonFailed => "Numeric Comparison Failed",
            Reason::BrEdrPairingInProgress => "BR/EDR Pairing In Progress",
            Reason::CrossTransportKeyNotAllowed => "Cross-transport Key Derivation Not Allowed",
        };
        write!(f, "{} (0x{:02X})", text, self.to_u8())
    }
}

/// Coarse classification of a pairing failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed or out-of-sequence PDU
    Protocol,
    /// Confirm or DHKey mismatch, or requirements that cannot be met
    Authentication,
    /// Bond store could not take the record
    Resource,
    /// No response within the per-state deadline
    Timeout,
    /// Link failed to encrypt or went away
    External,
    /// Aborted by the application
    Cancelled,
    /// API misuse; never ends a session
    Local,
}

/// SMP Error types
#[derive(Debug, Error)]
pub enum SmpError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Command not supported: opcode 0x{0:02X}")]
    CommandNotSupported(u8),

    #[error("Unexpected PDU 0x{opcode:02X} in state {state:?}")]
    UnexpectedPdu { opcode: u8, state: PairingState },

    #[error("Unexpected key distribution: {0}")]
    UnexpectedKey(&'static str),

    #[error("Passkey entry failed")]
    PasskeyEntryFailed,

    #[error("OOB data not available")]
    OobNotAvailable,

    #[error("Authentication requirements not met")]
    AuthenticationRequirements,

    #[error("Confirm value failed")]
    ConfirmValueFailed,

    #[error("Pairing not supported")]
    PairingNotSupported,

    #[error("Encryption key size too small")]
    EncryptionKeySize,

    #[error("Too many pairing attempts")]
    RepeatedAttempts,

    #[error("DHKey check failed")]
    DhKeyCheckFailed,

    #[error("Numeric comparison failed")]
    NumericComparisonFailed,

    #[error("Invalid public key from peer")]
    InvalidPublicKey,

    #[error("Peer reported failure: {0}")]
    Remote(Reason),

    #[error("Bond store error: {0}")]
    Store(#[from] StoreError),

    #[error("Operation timeout")]
    Timeout,

    #[error("Link failed to start encryption (status 0x{0:02X})")]
    EncryptionFailed(u8),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Pairing cancelled")]
    Cancelled,

    #[error("Invalid state for operation: {0}")]
    InvalidState(&'static str),

    #[error("Unknown connection 0x{0:04X}")]
    UnknownConnection(ConnHandle),

    #[error("Not bonded with peer")]
    NotBonded,
}

impl SmpError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SmpError::InvalidParameter(_)
            | SmpError::CommandNotSupported(_)
            | SmpError::UnexpectedPdu { .. }
            | SmpError::UnexpectedKey(_) => ErrorCategory::Protocol,
            SmpError::PasskeyEntryFailed
            | SmpError::OobNotAvailable
            | SmpError::AuthenticationRequirements
            | SmpError::ConfirmValueFailed
            | SmpError::PairingNotSupported
            | SmpError::EncryptionKeySize
            | SmpError::RepeatedAttempts
            | SmpError::DhKeyCheckFailed
            | SmpError::NumericComparisonFailed
            | SmpError::InvalidPublicKey => ErrorCategory::Authentication,
            SmpError::Remote(reason) => {
                if reason.is_authentication() {
                    ErrorCategory::Authentication
                } else {
                    ErrorCategory::Protocol
                }
            }
            SmpError::Store(_) => ErrorCategory::Resource,
            SmpError::Timeout => ErrorCategory::Timeout,
            SmpError::EncryptionFailed(_) | SmpError::ConnectionLost | SmpError::Link(_) => {
                ErrorCategory::External
            }
            SmpError::Cancelled => ErrorCategory::Cancelled,
            SmpError::InvalidState(_) | SmpError::UnknownConnection(_) | SmpError::NotBonded => {
                ErrorCategory::Local
            }
        }
    }

    /// The SMP reason code this failure corresponds to, if any
    pub fn reason(&self) -> Option<Reason> {
        let reason = match self {
            SmpError::InvalidParameter(_) => Reason::InvalidParameters,
            SmpError::CommandNotSupported(_) => Reason::CommandNotSupported,
            SmpError::UnexpectedPdu { .. } | SmpError::UnexpectedKey(_) => {
                Reason::UnspecifiedReason
            }
            SmpError::PasskeyEntryFailed => Reason::PasskeyEntryFailed,
            SmpError::OobNotAvailable => Reason::OobNotAvailable,
            SmpError::AuthenticationRequirements => Reason::AuthenticationRequirements,
            SmpError::ConfirmValueFailed => Reason::ConfirmValueFailed,
            SmpError::PairingNotSupported => Reason::PairingNotSupported,
            SmpError::EncryptionKeySize => Reason::EncryptionKeySize,
            SmpError::RepeatedAttempts => Reason::RepeatedAttempts,
            SmpError::DhKeyCheckFailed | SmpError::InvalidPublicKey => Reason::DhKeyCheckFailed,
            SmpError::NumericComparisonFailed => Reason::NumericComparisonFailed,
            SmpError::Cancelled => Reason::UnspecifiedReason,
            SmpError::Remote(reason) => *reason,
            _ => return None,
        };
        Some(reason)
    }

    /// Reason to place in a Pairing Failed PDU, or `None` when the peer must not be told
    pub fn peer_reason(&self) -> Option<Reason> {
        match self {
            SmpError::Remote(_) => None,
            _ => self.reason(),
        }
    }

    /// Host status code: 0x400 + reason for local failures, 0x500 + reason for peer ones
    pub fn status_code(&self) -> Option<u16> {
        match self {
            SmpError::Remote(reason) => Some(SMP_STATUS_PEER_BASE + reason.to_u8() as u16),
            _ => self
                .reason()
                .map(|reason| SMP_STATUS_LOCAL_BASE + reason.to_u8() as u16),
        }
    }

    /// Failures that count towards repeated-attempt throttling
    pub fn is_failed_attempt(&self) -> bool {
        matches!(
            self,
            SmpError::ConfirmValueFailed
                | SmpError::DhKeyCheckFailed
                | SmpError::PasskeyEntryFailed
                | SmpError::NumericComparisonFailed
                | SmpError::InvalidPublicKey
        )
    }
}

/// Result type for SMP operations
pub type SmpResult<T> = Result<T, SmpError>;

/// IO Capability types for pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoCapability {
    /// Display only capability
    DisplayOnly,
    /// Display with yes/no capability
    DisplayYesNo,
    /// Keyboard only
    KeyboardOnly,
    /// No input, no output
    NoInputNoOutput,
    /// Both keyboard and display
    KeyboardDisplay,
}

impl IoCapability {
    pub const ALL: [IoCapability; 5] = [
        IoCapability::DisplayOnly,
        IoCapability::DisplayYesNo,
        IoCapability::KeyboardOnly,
        IoCapability::NoInputNoOutput,
        IoCapability::KeyboardDisplay,
    ];

    /// Convert to u8 value for protocol
    pub fn to_u8(&self) -> u8 {
        match self {
            IoCapability::DisplayOnly => SMP_IO_CAPABILITY_DISPLAY_ONLY,
            IoCapability::DisplayYesNo => SMP_IO_CAPABILITY_DISPLAY_YES_NO,
            IoCapability::KeyboardOnly => SMP_IO_CAPABILITY_KEYBOARD_ONLY,
            IoCapability::NoInputNoOutput => SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT,
            IoCapability::KeyboardDisplay => SMP_IO_CAPABILITY_KEYBOARD_DISPLAY,
        }
    }

    /// Convert from u8 value from protocol
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            SMP_IO_CAPABILITY_DISPLAY_ONLY => Some(IoCapability::DisplayOnly),
            SMP_IO_CAPABILITY_DISPLAY_YES_NO => Some(IoCapability::DisplayYesNo),
            SMP_IO_CAPABILITY_KEYBOARD_ONLY => Some(IoCapability::KeyboardOnly),
            SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT => Some(IoCapability::NoInputNoOutput),
            SMP_IO_CAPABILITY_KEYBOARD_DISPLAY => Some(IoCapability::KeyboardDisplay),
            _ => None,
        }
    }
}

impl fmt::Display for IoCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoCapability::DisplayOnly => write!(f, "Display Only"),
            IoCapability::DisplayYesNo => write!(f, "Display Yes/No"),
            IoCapability::KeyboardOnly => write!(f, "Keyboard Only"),
            IoCapability::NoInputNoOutput => write!(f, "No Input No Output"),
            IoCapability::KeyboardDisplay => write!(f, "Keyboard Display"),
        }
    }
}

bitflags! {
    /// AuthReq field of Pairing Request, Pairing Response and Security Request
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AuthReq: u8 {
        const BONDING = SMP_AUTH_REQ_BONDING;
        const MITM = SMP_AUTH_REQ_MITM;
        const SC = SMP_AUTH_REQ_SC;
        const KEYPRESS = SMP_AUTH_REQ_KEYPRESS;
        const CT2 = SMP_AUTH_REQ_CT2;
    }
}

bitflags! {
    /// Initiator/Responder Key Distribution field
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct KeyDistribution: u8 {
        /// LTK with EDIV and Rand
        const ENC_KEY = SMP_KEY_DIST_ENC_KEY;
        /// IRK and identity address
        const ID_KEY = SMP_KEY_DIST_ID_KEY;
        /// CSRK
        const SIGN_KEY = SMP_KEY_DIST_SIGN_KEY;
        /// BR/EDR link key derivation
        const LINK_KEY = SMP_KEY_DIST_LINK_KEY;
    }
}

impl KeyDistribution {
    /// Key types this implementation can send and receive
    pub const SUPPORTED: Self = Self::ENC_KEY.union(Self::ID_KEY).union(Self::SIGN_KEY);
}

/// Association model chosen for a pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairingMethod {
    LegacyJustWorks,
    LegacyPasskeyEntry,
    LegacyOob,
    ScJustWorks,
    ScNumericComparison,
    ScPasskeyEntry,
    ScOob,
}

impl PairingMethod {
    pub fn is_secure_connections(&self) -> bool {
        matches!(
            self,
            PairingMethod::ScJustWorks
                | PairingMethod::ScNumericComparison
                | PairingMethod::ScPasskeyEntry
                | PairingMethod::ScOob
        )
    }

    /// Whether the method protects against a man in the middle
    pub fn provides_mitm(&self) -> bool {
        !matches!(self, PairingMethod::LegacyJustWorks | PairingMethod::ScJustWorks)
    }

    pub fn is_passkey(&self) -> bool {
        matches!(self, PairingMethod::LegacyPasskeyEntry | PairingMethod::ScPasskeyEntry)
    }
}

impl fmt::Display for PairingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingMethod::LegacyJustWorks => write!(f, "Legacy Just Works"),
            PairingMethod::LegacyPasskeyEntry => write!(f, "Legacy Passkey Entry"),
            PairingMethod::LegacyOob => write!(f, "Legacy Out of Band"),
            PairingMethod::ScJustWorks => write!(f, "LE Secure Connections Just Works"),
            PairingMethod::ScNumericComparison => write!(f, "LE Secure Connections Numeric Comparison"),
            PairingMethod::ScPasskeyEntry => write!(f, "LE Secure Connections Passkey Entry"),
            PairingMethod::ScOob => write!(f, "LE Secure Connections Out of Band"),
        }
    }
}

/// Which side types the passkey during Passkey Entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PasskeyRole {
    /// Responder displays, initiator types
    InitiatorInputs,
    /// Initiator displays, responder types
    ResponderInputs,
    /// Neither side displays; the user types the same value on both
    BothInput,
}

impl PasskeyRole {
    pub fn local_inputs(&self, role: PairingRole) -> bool {
        match self {
            PasskeyRole::InitiatorInputs => role == PairingRole::Initiator,
            PasskeyRole::ResponderInputs => role == PairingRole::Responder,
            PasskeyRole::BothInput => true,
        }
    }
}

/// Pairing Role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairingRole {
    /// Initiator of the pairing (the Central)
    Initiator,
    /// Responder to pairing (the Peripheral)
    Responder,
}

/// Externally visible state of a pairing session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairingState {
    Idle,
    RequestExchanged,
    LegacyConfirm { round: u8 },
    ScPublicKeyExchange,
    ScConfirm { round: u8 },
    EncryptionPending,
    KeyDistribution,
    Complete,
    Failed,
}

impl PairingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PairingState::Complete | PairingState::Failed)
    }
}

/// Negotiated security of a session; fixed once computed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityRequirement {
    pub bonding: bool,
    pub mitm: bool,
    pub secure_connections: bool,
    pub keypress: bool,
    pub key_size: u8,
    /// Keys this device distributes
    pub local_keys: KeyDistribution,
    /// Keys the peer distributes
    pub peer_keys: KeyDistribution,
}

/// Security level for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityLevel {
    /// No security (unencrypted)
    None = 0,
    /// Encryption without authentication (Just Works)
    EncryptionOnly = 1,
    /// Encryption with authentication (MITM protection)
    EncryptionWithAuthentication = 2,
    /// Secure Connections with encryption and authentication
    SecureConnections = 3,
}

impl SecurityLevel {
    pub fn is_authenticated(&self) -> bool {
        *self >= SecurityLevel::EncryptionWithAuthentication
    }
}

/// Current encryption state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkSecurity {
    pub encrypted: bool,
    pub authenticated: bool,
    pub secure_connections: bool,
    pub bonded: bool,
    pub key_size: u8,
}

impl LinkSecurity {
    pub fn level(&self) -> SecurityLevel {
        if !self.encrypted {
            SecurityLevel::None
        } else if self.authenticated && self.secure_connections {
            SecurityLevel::SecureConnections
        } else if self.authenticated {
            SecurityLevel::EncryptionWithAuthentication
        } else {
            SecurityLevel::EncryptionOnly
        }
    }
}
