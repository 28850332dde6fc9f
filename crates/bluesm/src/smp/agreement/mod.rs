//! Key Agreement Engine
//!
//! Runs either LE Legacy pairing or LE Secure Connections up to the point
//! where both sides hold the same session key. The engines never touch the
//! link: they return [`Action`]s that the pairing session carries out.

mod legacy;
mod sc;

pub use legacy::LegacyAgreement;
pub use sc::ScAgreement;

use super::constants::*;
use super::crypto::{EcdhKeyPair, ScOobData};
use super::pdu::{PairingFeatures, SmpPdu};
use super::types::*;
use crate::gap::Address;
use rand::{CryptoRng, RngCore};
use subtle::ConstantTimeEq;

/// Fixed inputs of one key agreement
#[derive(Debug, Clone, Copy)]
pub struct AgreementContext {
    pub role: PairingRole,
    pub method: PairingMethod,
    pub passkey_role: Option<PasskeyRole>,
    pub request: PairingFeatures,
    pub response: PairingFeatures,
    pub initiator: Address,
    pub responder: Address,
    pub key_size: u8,
}

impl AgreementContext {
    fn is_initiator(&self) -> bool {
        self.role == PairingRole::Initiator
    }

    fn local_inputs_passkey(&self) -> bool {
        self.passkey_role
            .map_or(false, |passkey_role| passkey_role.local_inputs(self.role))
    }

    fn preq(&self) -> [u8; 7] {
        wire_features(SmpPdu::PairingRequest(self.request))
    }

    fn pres(&self) -> [u8; 7] {
        wire_features(SmpPdu::PairingResponse(self.response))
    }

    fn peer_features(&self) -> &PairingFeatures {
        if self.is_initiator() {
            &self.response
        } else {
            &self.request
        }
    }
}

fn wire_features(pdu: SmpPdu) -> [u8; 7] {
    let mut out = [0u8; SMP_PAIRING_FEATURES_LEN];
    out.copy_from_slice(&pdu.serialize());
    out
}

/// Out-of-band material available for a connection
#[derive(Default)]
pub struct OobMaterial {
    /// Temporary Key for LE Legacy OOB
    pub legacy_tk: Option<u128>,
    /// Our key pair and the OOB data generated from it
    pub sc_local: Option<(EcdhKeyPair, ScOobData)>,
    /// OOB data received from the peer
    pub sc_peer: Option<ScOobData>,
}

/// Work for the pairing session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(SmpPdu),
    DisplayPasskey(u32),
    RequestPasskey,
    ConfirmNumeric(u32),
    /// Session key agreed, already masked to the negotiated size
    Agreed(u128),
}

/// The engine selected for a session
pub enum Agreement {
    Legacy(LegacyAgreement),
    SecureConnections(ScAgreement),
}

impl Agreement {
    pub fn new<R: RngCore + CryptoRng>(
        ctx: AgreementContext,
        oob: OobMaterial,
        rng: &mut R,
    ) -> SmpResult<Self> {
        if ctx.method.is_secure_connections() {
            Ok(Agreement::SecureConnections(ScAgreement::new(ctx, oob, rng)?))
        } else {
            Ok(Agreement::Legacy(LegacyAgreement::new(ctx, oob.legacy_tk)?))
        }
    }

    pub fn start<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> SmpResult<Vec<Action>> {
        match self {
            Agreement::Legacy(engine) => engine.start(rng),
            Agreement::SecureConnections(engine) => engine.start(rng),
        }
    }

    pub fn on_pdu<R: RngCore + CryptoRng>(
        &mut self,
        pdu: &SmpPdu,
        rng: &mut R,
    ) -> SmpResult<Vec<Action>> {
        match self {
            Agreement::Legacy(engine) => engine.on_pdu(pdu, rng),
            Agreement::SecureConnections(engine) => engine.on_pdu(pdu, rng),
        }
    }

    pub fn on_passkey<R: RngCore + CryptoRng>(
        &mut self,
        passkey: Option<u32>,
        rng: &mut R,
    ) -> SmpResult<Vec<Action>> {
        let passkey = checked_passkey(passkey)?;
        match self {
            Agreement::Legacy(engine) => engine.on_passkey(passkey, rng),
            Agreement::SecureConnections(engine) => engine.on_passkey(passkey, rng),
        }
    }

    pub fn on_numeric_comparison(&mut self, accept: bool) -> SmpResult<Vec<Action>> {
        match self {
            Agreement::Legacy(_) => Err(SmpError::InvalidState("no numeric comparison pending")),
            Agreement::SecureConnections(engine) => engine.on_numeric_comparison(accept),
        }
    }

    pub fn state(&self) -> PairingState {
        match self {
            Agreement::Legacy(engine) => engine.state(),
            Agreement::SecureConnections(engine) => engine.state(),
        }
    }

    /// Zero every secret held by the engine
    pub fn erase(&mut self) {
        match self {
            Agreement::Legacy(engine) => engine.erase(),
            Agreement::SecureConnections(engine) => engine.erase(),
        }
    }

    /// Whether any secret is still held
    pub fn holds_secrets(&self) -> bool {
        match self {
            Agreement::Legacy(engine) => engine.holds_secrets(),
            Agreement::SecureConnections(engine) => engine.holds_secrets(),
        }
    }
}

fn checked_passkey(passkey: Option<u32>) -> SmpResult<u32> {
    match passkey {
        Some(value) if value <= SMP_PASSKEY_MAX => Ok(value),
        _ => Err(SmpError::PasskeyEntryFailed),
    }
}

/// Constant-time comparison of confirm and check values
fn values_match(expected: u128, received: u128) -> bool {
    expected.to_le_bytes()[..]
        .ct_eq(&received.to_le_bytes()[..])
        .into()
}

/// Commitment bit for one passkey round
fn passkey_bit(passkey: u32, round: u8) -> u8 {
    0x80 | ((passkey >> round) & 1) as u8
}

fn unexpected(pdu: &SmpPdu, state: PairingState) -> SmpError {
    SmpError::UnexpectedPdu {
        opcode: pdu.opcode(),
        state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passkey_bits() {
        let passkey = 0b1011;
        assert_eq!(passkey_bit(passkey, 0), 0x81);
        assert_eq!(passkey_bit(passkey, 1), 0x81);
        assert_eq!(passkey_bit(passkey, 2), 0x80);
        assert_eq!(passkey_bit(passkey, 3), 0x81);
        assert_eq!(passkey_bit(passkey, 19), 0x80);
    }

    #[test]
    fn test_checked_passkey() {
        assert_eq!(checked_passkey(Some(0)).unwrap(), 0);
        assert_eq!(checked_passkey(Some(999_999)).unwrap(), 999_999);
        assert!(matches!(
            checked_passkey(Some(1_000_000)),
            Err(SmpError::PasskeyEntryFailed)
        ));
        assert!(matches!(checked_passkey(None), Err(SmpError::PasskeyEntryFailed)));
    }

    #[test]
    fn test_values_match() {
        assert!(values_match(0x1234, 0x1234));
        assert!(!values_match(0x1234, 0x1235));
    }
}
