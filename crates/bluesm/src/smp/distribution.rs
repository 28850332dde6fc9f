//! Key Distribution Manager
//!
//! Runs once the link is encrypted. The responder sends its keys first,
//! the initiator after it has received everything the responder owes it.
//! Within one side keys go out in a fixed order: encryption information,
//! identity information, signing information.

use super::constants::*;
use super::crypto::{mask_key, random_u128};
use super::keys::{KeySet, LocalIdentity, LongTermKey};
use super::pdu::SmpPdu;
use super::types::*;
use crate::gap::Address;
use log::debug;
use rand::{CryptoRng, Rng, RngCore};
use std::collections::VecDeque;
use zeroize::Zeroize;

pub struct KeyDistributor {
    role: PairingRole,
    key_size: u8,
    authenticated: bool,
    local_dist: KeyDistribution,
    /// Opcodes still owed by the peer, in order
    expected: VecDeque<u8>,
    sent: bool,
    local: KeySet,
    received: KeySet,
    /// Encryption Information waiting for its Central Identification
    pending_ltk: Option<u128>,
}

impl KeyDistributor {
    pub fn new(requirement: &SecurityRequirement, role: PairingRole) -> Self {
        let mut local_dist = requirement.local_keys & KeyDistribution::SUPPORTED;
        let mut peer_dist = requirement.peer_keys & KeyDistribution::SUPPORTED;
        if requirement.secure_connections {
            local_dist.remove(KeyDistribution::ENC_KEY);
            peer_dist.remove(KeyDistribution::ENC_KEY);
        }

        let mut expected = VecDeque::new();
        if peer_dist.contains(KeyDistribution::ENC_KEY) {
            expected.push_back(SMP_ENCRYPTION_INFORMATION);
            expected.push_back(SMP_MASTER_IDENTIFICATION);
        }
        if peer_dist.contains(KeyDistribution::ID_KEY) {
            expected.push_back(SMP_IDENTITY_INFORMATION);
            expected.push_back(SMP_IDENTITY_ADDRESS_INFORMATION);
        }
        if peer_dist.contains(KeyDistribution::SIGN_KEY) {
            expected.push_back(SMP_SIGNING_INFORMATION);
        }

        Self {
            role,
            key_size: requirement.key_size,
            authenticated: requirement.mitm,
            local_dist,
            expected,
            sent: false,
            local: KeySet::default(),
            received: KeySet::default(),
            pending_ltk: None,
        }
    }

    /// Keys to send as soon as the link is encrypted
    pub fn start<R: RngCore + CryptoRng>(
        &mut self,
        identity: &LocalIdentity,
        local_address: Address,
        rng: &mut R,
    ) -> Vec<SmpPdu> {
        if self.role == PairingRole::Responder || self.expected.is_empty() {
            self.send_keys(identity, local_address, rng)
        } else {
            Vec::new()
        }
    }

    pub fn on_pdu<R: RngCore + CryptoRng>(
        &mut self,
        pdu: &SmpPdu,
        identity: &LocalIdentity,
        local_address: Address,
        rng: &mut R,
    ) -> SmpResult<Vec<SmpPdu>> {
        if self.expected.front() != Some(&pdu.opcode()) {
            return Err(SmpError::UnexpectedKey(pdu.name()));
        }
        self.expected.pop_front();

        match pdu {
            SmpPdu::EncryptionInformation(ltk) => self.pending_ltk = Some(*ltk),
            SmpPdu::MasterIdentification { ediv, rand } => {
                let key = self
                    .pending_ltk
                    .take()
                    .ok_or(SmpError::UnexpectedKey(pdu.name()))?;
                self.received.ltk = Some(LongTermKey {
                    key,
                    ediv: *ediv,
                    rand: *rand,
                    key_size: self.key_size,
                    secure_connections: false,
                    authenticated: self.authenticated,
                });
            }
            SmpPdu::IdentityInformation(irk) => self.received.irk = Some(*irk),
            SmpPdu::IdentityAddressInformation(address) => {
                if address.is_random()
                    && address.bdaddr.bytes[5] & crate::gap::RANDOM_ADDR_SUBTYPE_MASK
                        != crate::gap::RANDOM_ADDR_STATIC
                {
                    return Err(SmpError::InvalidParameter(format!(
                        "Identity address {} is not static",
                        address
                    )));
                }
                self.received.identity = Some(*address);
            }
            SmpPdu::SigningInformation(csrk) => self.received.csrk = Some(*csrk),
            _ => return Err(SmpError::UnexpectedKey(pdu.name())),
        }
        debug!("Received {}", pdu.name());

        if self.expected.is_empty() && !self.sent {
            return Ok(self.send_keys(identity, local_address, rng));
        }
        Ok(Vec::new())
    }

    fn send_keys<R: RngCore + CryptoRng>(
        &mut self,
        identity: &LocalIdentity,
        local_address: Address,
        rng: &mut R,
    ) -> Vec<SmpPdu> {
        let mut pdus = Vec::new();

        if self.local_dist.contains(KeyDistribution::ENC_KEY) {
            let ltk = LongTermKey {
                key: mask_key(random_u128(rng), self.key_size),
                ediv: rng.gen(),
                rand: rng.gen(),
                key_size: self.key_size,
                secure_connections: false,
                authenticated: self.authenticated,
            };
            pdus.push(SmpPdu::EncryptionInformation(ltk.key));
            pdus.push(SmpPdu::MasterIdentification {
                ediv: ltk.ediv,
                rand: ltk.rand,
            });
            self.local.ltk = Some(ltk);
        }
        if self.local_dist.contains(KeyDistribution::ID_KEY) {
            let address = identity.address.unwrap_or(local_address);
            pdus.push(SmpPdu::IdentityInformation(identity.irk));
            pdus.push(SmpPdu::IdentityAddressInformation(address));
            self.local.irk = Some(identity.irk);
            self.local.identity = Some(address);
        }
        if self.local_dist.contains(KeyDistribution::SIGN_KEY) {
            let csrk = random_u128(rng);
            pdus.push(SmpPdu::SigningInformation(csrk));
            self.local.csrk = Some(csrk);
        }

        self.sent = true;
        pdus
    }

    /// Both sides have sent everything their masks require
    pub fn is_complete(&self) -> bool {
        self.sent && self.expected.is_empty()
    }

    /// (keys we sent, keys we received)
    pub fn take_keys(&mut self) -> (KeySet, KeySet) {
        (
            std::mem::take(&mut self.local),
            std::mem::take(&mut self.received),
        )
    }
}

impl Drop for KeyDistributor {
    fn drop(&mut self) {
        self.pending_ltk.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    fn requirement(sc: bool, local: KeyDistribution, peer: KeyDistribution) -> SecurityRequirement {
        SecurityRequirement {
            bonding: true,
            mitm: false,
            secure_connections: sc,
            keypress: false,
            key_size: 16,
            local_keys: local,
            peer_keys: peer,
        }
    }

    fn identity(last: u8) -> LocalIdentity {
        LocalIdentity {
            irk: 0x1000 + last as u128,
            address: Some(Address::public([last, 0, 0, 0, 0, 0])),
        }
    }

    #[test]
    fn test_legacy_exchange_order() {
        let mut rng = ChaCha12Rng::seed_from_u64(1);
        let all = KeyDistribution::SUPPORTED;
        let mut initiator = KeyDistributor::new(&requirement(false, all, all), PairingRole::Initiator);
        let mut responder = KeyDistributor::new(&requirement(false, all, all), PairingRole::Responder);
        let (id_i, id_r) = (identity(1), identity(2));
        let local = Address::public([9; 6]);

        assert!(initiator.start(&id_i, local, &mut rng).is_empty());
        let from_responder = responder.start(&id_r, local, &mut rng);
        let opcodes: Vec<u8> = from_responder.iter().map(|pdu| pdu.opcode()).collect();
        assert_eq!(
            opcodes,
            vec![
                SMP_ENCRYPTION_INFORMATION,
                SMP_MASTER_IDENTIFICATION,
                SMP_IDENTITY_INFORMATION,
                SMP_IDENTITY_ADDRESS_INFORMATION,
                SMP_SIGNING_INFORMATION,
            ]
        );

        let mut from_initiator = Vec::new();
        for pdu in &from_responder {
            assert!(!initiator.is_complete());
            from_initiator.extend(initiator.on_pdu(pdu, &id_i, local, &mut rng).unwrap());
        }
        assert_eq!(from_initiator.len(), 5);
        assert!(initiator.is_complete());

        for pdu in &from_initiator {
            assert!(responder.on_pdu(pdu, &id_r, local, &mut rng).unwrap().is_empty());
        }
        assert!(responder.is_complete());

        let (i_local, i_received) = initiator.take_keys();
        let (r_local, r_received) = responder.take_keys();
        assert_eq!(i_received, r_local);
        assert_eq!(r_received, i_local);
        assert_eq!(i_received.irk, Some(0x1002));
        assert_eq!(i_received.identity, id_r.address);
    }

    #[test]
    fn test_secure_connections_skips_encryption_key() {
        let mut rng = ChaCha12Rng::seed_from_u64(2);
        let all = KeyDistribution::SUPPORTED;
        let mut responder = KeyDistributor::new(&requirement(true, all, all), PairingRole::Responder);
        let pdus = responder.start(&identity(2), Address::public([9; 6]), &mut rng);
        assert!(pdus
            .iter()
            .all(|pdu| pdu.opcode() != SMP_ENCRYPTION_INFORMATION));
        assert_eq!(pdus.len(), 3);
    }

    #[test]
    fn test_key_outside_mask_is_rejected() {
        let mut rng = ChaCha12Rng::seed_from_u64(3);
        let mut initiator = KeyDistributor::new(
            &requirement(false, KeyDistribution::empty(), KeyDistribution::ID_KEY),
            PairingRole::Initiator,
        );
        let result = initiator.on_pdu(
            &SmpPdu::SigningInformation(7),
            &identity(1),
            Address::public([9; 6]),
            &mut rng,
        );
        assert!(matches!(result, Err(SmpError::UnexpectedKey(_))));
    }

    #[test]
    fn test_out_of_order_key_is_rejected() {
        let mut rng = ChaCha12Rng::seed_from_u64(4);
        let mut initiator = KeyDistributor::new(
            &requirement(false, KeyDistribution::empty(), KeyDistribution::SUPPORTED),
            PairingRole::Initiator,
        );
        let result = initiator.on_pdu(
            &SmpPdu::IdentityInformation(7),
            &identity(1),
            Address::public([9; 6]),
            &mut rng,
        );
        assert!(matches!(result, Err(SmpError::UnexpectedKey(_))));
    }

    #[test]
    fn test_nothing_to_exchange() {
        let mut rng = ChaCha12Rng::seed_from_u64(5);
        let none = KeyDistribution::empty();
        let mut initiator = KeyDistributor::new(&requirement(true, none, none), PairingRole::Initiator);
        assert!(initiator
            .start(&identity(1), Address::public([9; 6]), &mut rng)
            .is_empty());
        assert!(initiator.is_complete());
    }
}
