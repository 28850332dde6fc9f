//! Wire format of Security Manager PDUs
//!
//! Every PDU starts with a one-octet opcode. Multi-octet values are
//! little-endian on the wire; 128-bit values are held as `u128` so that
//! `to_le_bytes` gives the wire form and `to_be_bytes` the form fed to AES.

use super::constants::*;
use super::crypto::PublicKeyBytes;
use super::types::*;
use crate::gap::{Address, AddressType, BdAddr};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Body of a Pairing Request or Pairing Response
///
/// Reserved AuthReq and key distribution bits are kept as received so that
/// the serialized form matches the octets the confirm values are computed
/// over; policy only looks at the defined flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingFeatures {
    pub io_capability: IoCapability,
    pub oob_data_present: bool,
    pub auth_req: AuthReq,
    /// Maximum encryption key size (7-16)
    pub max_key_size: u8,
    pub initiator_key_dist: KeyDistribution,
    pub responder_key_dist: KeyDistribution,
}

impl PairingFeatures {
    fn parse_body(data: &[u8]) -> SmpResult<Self> {
        let io_capability = IoCapability::from_u8(data[1]).ok_or_else(|| {
            SmpError::InvalidParameter(format!("IO capability 0x{:02X} out of range", data[1]))
        })?;

        let oob_data_present = match data[2] {
            SMP_OOB_NOT_PRESENT => false,
            SMP_OOB_PRESENT => true,
            other => {
                return Err(SmpError::InvalidParameter(format!(
                    "OOB data flag 0x{:02X} out of range",
                    other
                )))
            }
        };

        let max_key_size = data[4];
        if !(SMP_MIN_ENCRYPTION_KEY_SIZE..=SMP_MAX_ENCRYPTION_KEY_SIZE).contains(&max_key_size) {
            return Err(SmpError::InvalidParameter(format!(
                "Maximum key size {} out of range",
                max_key_size
            )));
        }

        Ok(Self {
            io_capability,
            oob_data_present,
            auth_req: AuthReq::from_bits_retain(data[3]),
            max_key_size,
            initiator_key_dist: KeyDistribution::from_bits_retain(data[5]),
            responder_key_dist: KeyDistribution::from_bits_retain(data[6]),
        })
    }

    fn serialize_body(&self, opcode: u8) -> Vec<u8> {
        vec![
            opcode,
            self.io_capability.to_u8(),
            if self.oob_data_present {
                SMP_OOB_PRESENT
            } else {
                SMP_OOB_NOT_PRESENT
            },
            self.auth_req.bits(),
            self.max_key_size,
            self.initiator_key_dist.bits(),
            self.responder_key_dist.bits(),
        ]
    }

    /// AuthReq, OOB flag and IO capability as used by f6, most significant first
    pub fn io_cap_bytes(&self) -> [u8; 3] {
        [
            self.auth_req.bits(),
            self.oob_data_present as u8,
            self.io_capability.to_u8(),
        ]
    }
}

/// A decoded Security Manager PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmpPdu {
    PairingRequest(PairingFeatures),
    PairingResponse(PairingFeatures),
    PairingConfirm(u128),
    PairingRandom(u128),
    PairingFailed(Reason),
    EncryptionInformation(u128),
    MasterIdentification { ediv: u16, rand: u64 },
    IdentityInformation(u128),
    IdentityAddressInformation(Address),
    SigningInformation(u128),
    SecurityRequest(AuthReq),
    PairingPublicKey(PublicKeyBytes),
    PairingDhKeyCheck(u128),
    KeypressNotification(u8),
}

fn expect_len(data: &[u8], expected: usize, name: &str) -> SmpResult<()> {
    if data.len() != expected {
        return Err(SmpError::InvalidParameter(format!(
            "{} has length {} (expected {})",
            name,
            data.len(),
            expected
        )));
    }
    Ok(())
}

fn read_u128(data: &[u8]) -> u128 {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&data[1..17]);
    u128::from_le_bytes(bytes)
}

fn value_pdu(opcode: u8, value: u128) -> Vec<u8> {
    let mut packet = Vec::with_capacity(SMP_VALUE_128_LEN);
    packet.push(opcode);
    packet.extend_from_slice(&value.to_le_bytes());
    packet
}

impl SmpPdu {
    /// Parse from raw packet
    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        let Some(&opcode) = data.first() else {
            return Err(SmpError::InvalidParameter("Empty SMP PDU".into()));
        };

        let pdu = match opcode {
            SMP_PAIRING_REQUEST => {
                expect_len(data, SMP_PAIRING_FEATURES_LEN, "Pairing request")?;
                SmpPdu::PairingRequest(PairingFeatures::parse_body(data)?)
            }
            SMP_PAIRING_RESPONSE => {
                expect_len(data, SMP_PAIRING_FEATURES_LEN, "Pairing response")?;
                SmpPdu::PairingResponse(PairingFeatures::parse_body(data)?)
            }
            SMP_PAIRING_CONFIRM => {
                expect_len(data, SMP_VALUE_128_LEN, "Pairing confirm")?;
                SmpPdu::PairingConfirm(read_u128(data))
            }
            SMP_PAIRING_RANDOM => {
                expect_len(data, SMP_VALUE_128_LEN, "Pairing random")?;
                SmpPdu::PairingRandom(read_u128(data))
            }
            SMP_PAIRING_FAILED => {
                expect_len(data, SMP_PAIRING_FAILED_LEN, "Pairing failed")?;
                SmpPdu::PairingFailed(Reason::from_u8(data[1]).unwrap_or(Reason::UnspecifiedReason))
            }
            SMP_ENCRYPTION_INFORMATION => {
                expect_len(data, SMP_VALUE_128_LEN, "Encryption information")?;
                SmpPdu::EncryptionInformation(read_u128(data))
            }
            SMP_MASTER_IDENTIFICATION => {
                expect_len(data, SMP_MASTER_IDENTIFICATION_LEN, "Master identification")?;
                let mut cursor = Cursor::new(&data[1..]);
                let ediv = cursor
                    .read_u16::<LittleEndian>()
                    .map_err(|e| SmpError::InvalidParameter(e.to_string()))?;
                let rand = cursor
                    .read_u64::<LittleEndian>()
                    .map_err(|e| SmpError::InvalidParameter(e.to_string()))?;
                SmpPdu::MasterIdentification { ediv, rand }
            }
            SMP_IDENTITY_INFORMATION => {
                expect_len(data, SMP_VALUE_128_LEN, "Identity information")?;
                SmpPdu::IdentityInformation(read_u128(data))
            }
            SMP_IDENTITY_ADDRESS_INFORMATION => {
                expect_len(
                    data,
                    SMP_IDENTITY_ADDRESS_INFORMATION_LEN,
                    "Identity address information",
                )?;
                if data[1] > 1 {
                    return Err(SmpError::InvalidParameter(format!(
                        "Identity address type 0x{:02X} out of range",
                        data[1]
                    )));
                }
                let bdaddr = BdAddr::from_slice(&data[2..8])
                    .ok_or_else(|| SmpError::InvalidParameter("Identity address too short".into()))?;
                SmpPdu::IdentityAddressInformation(Address::new(AddressType::from(data[1]), bdaddr))
            }
            SMP_SIGNING_INFORMATION => {
                expect_len(data, SMP_VALUE_128_LEN, "Signing information")?;
                SmpPdu::SigningInformation(read_u128(data))
            }
            SMP_SECURITY_REQUEST => {
                expect_len(data, SMP_SECURITY_REQUEST_LEN, "Security request")?;
                SmpPdu::SecurityRequest(AuthReq::from_bits_truncate(data[1]))
            }
            SMP_PAIRING_PUBLIC_KEY => {
                expect_len(data, SMP_PUBLIC_KEY_LEN, "Pairing public key")?;
                let mut x = [0u8; 32];
                let mut y = [0u8; 32];
                x.copy_from_slice(&data[1..33]);
                y.copy_from_slice(&data[33..65]);
                SmpPdu::PairingPublicKey(PublicKeyBytes { x, y })
            }
            SMP_PAIRING_DHK_CHECK => {
                expect_len(data, SMP_VALUE_128_LEN, "Pairing DHKey check")?;
                SmpPdu::PairingDhKeyCheck(read_u128(data))
            }
            SMP_PAIRING_KEYPRESS_NOTIFICATION => {
                expect_len(data, SMP_KEYPRESS_NOTIFICATION_LEN, "Keypress notification")?;
                if data[1] > 4 {
                    return Err(SmpError::InvalidParameter(format!(
                        "Keypress notification type 0x{:02X} out of range",
                        data[1]
                    )));
                }
                SmpPdu::KeypressNotification(data[1])
            }
            other => return Err(SmpError::CommandNotSupported(other)),
        };

        Ok(pdu)
    }

    /// Serialize to raw packet
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            SmpPdu::PairingRequest(features) => features.serialize_body(SMP_PAIRING_REQUEST),
            SmpPdu::PairingResponse(features) => features.serialize_body(SMP_PAIRING_RESPONSE),
            SmpPdu::PairingConfirm(value) => value_pdu(SMP_PAIRING_CONFIRM, *value),
            SmpPdu::PairingRandom(value) => value_pdu(SMP_PAIRING_RANDOM, *value),
            SmpPdu::PairingFailed(reason) => vec![SMP_PAIRING_FAILED, reason.to_u8()],
            SmpPdu::EncryptionInformation(ltk) => value_pdu(SMP_ENCRYPTION_INFORMATION, *ltk),
            SmpPdu::MasterIdentification { ediv, rand } => {
                let mut packet = Vec::with_capacity(SMP_MASTER_IDENTIFICATION_LEN);
                packet.push(SMP_MASTER_IDENTIFICATION);
                packet.extend_from_slice(&ediv.to_le_bytes());
                packet.extend_from_slice(&rand.to_le_bytes());
                packet
            }
            SmpPdu::IdentityInformation(irk) => value_pdu(SMP_IDENTITY_INFORMATION, *irk),
            SmpPdu::IdentityAddressInformation(address) => {
                let mut packet = Vec::with_capacity(SMP_IDENTITY_ADDRESS_INFORMATION_LEN);
                packet.push(SMP_IDENTITY_ADDRESS_INFORMATION);
                packet.push(u8::from(address.addr_type));
                packet.extend_from_slice(address.bdaddr.as_slice());
                packet
            }
            SmpPdu::SigningInformation(csrk) => value_pdu(SMP_SIGNING_INFORMATION, *csrk),
            SmpPdu::SecurityRequest(auth_req) => vec![SMP_SECURITY_REQUEST, auth_req.bits()],
            SmpPdu::PairingPublicKey(key) => {
                let mut packet = Vec::with_capacity(SMP_PUBLIC_KEY_LEN);
                packet.push(SMP_PAIRING_PUBLIC_KEY);
                packet.extend_from_slice(&key.x);
                packet.extend_from_slice(&key.y);
                packet
            }
            SmpPdu::PairingDhKeyCheck(value) => value_pdu(SMP_PAIRING_DHK_CHECK, *value),
            SmpPdu::KeypressNotification(kind) => vec![SMP_PAIRING_KEYPRESS_NOTIFICATION, *kind],
        }
    }

    pub fn opcode(&self) -> u8 {
        match self {
            SmpPdu::PairingRequest(_) => SMP_PAIRING_REQUEST,
            SmpPdu::PairingResponse(_) => SMP_PAIRING_RESPONSE,
            SmpPdu::PairingConfirm(_) => SMP_PAIRING_CONFIRM,
            SmpPdu::PairingRandom(_) => SMP_PAIRING_RANDOM,
            SmpPdu::PairingFailed(_) => SMP_PAIRING_FAILED,
            SmpPdu::EncryptionInformation(_) => SMP_ENCRYPTION_INFORMATION,
            SmpPdu::MasterIdentification { .. } => SMP_MASTER_IDENTIFICATION,
            SmpPdu::IdentityInformation(_) => SMP_IDENTITY_INFORMATION,
            SmpPdu::IdentityAddressInformation(_) => SMP_IDENTITY_ADDRESS_INFORMATION,
            SmpPdu::SigningInformation(_) => SMP_SIGNING_INFORMATION,
            SmpPdu::SecurityRequest(_) => SMP_SECURITY_REQUEST,
            SmpPdu::PairingPublicKey(_) => SMP_PAIRING_PUBLIC_KEY,
            SmpPdu::PairingDhKeyCheck(_) => SMP_PAIRING_DHK_CHECK,
            SmpPdu::KeypressNotification(_) => SMP_PAIRING_KEYPRESS_NOTIFICATION,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SmpPdu::PairingRequest(_) => "Pairing Request",
            SmpPdu::PairingResponse(_) => "Pairing Response",
            SmpPdu::PairingConfirm(_) => "Pairing Confirm",
            SmpPdu::PairingRandom(_) => "Pairing Random",
            SmpPdu::PairingFailed(_) => "Pairing Failed",
            SmpPdu::EncryptionInformation(_) => "Encryption Information",
            SmpPdu::MasterIdentification { .. } => "Master Identification",
            SmpPdu::IdentityInformation(_) => "Identity Information",
            SmpPdu::IdentityAddressInformation(_) => "Identity Address Information",
            SmpPdu::SigningInformation(_) => "Signing Information",
            SmpPdu::SecurityRequest(_) => "Security Request",
            SmpPdu::PairingPublicKey(_) => "Pairing Public Key",
            SmpPdu::PairingDhKeyCheck(_) => "Pairing DHKey Check",
            SmpPdu::KeypressNotification(_) => "Keypress Notification",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn features() -> PairingFeatures {
        PairingFeatures {
            io_capability: IoCapability::KeyboardDisplay,
            oob_data_present: false,
            auth_req: AuthReq::BONDING | AuthReq::MITM | AuthReq::SC,
            max_key_size: 16,
            initiator_key_dist: KeyDistribution::ENC_KEY | KeyDistribution::ID_KEY,
            responder_key_dist: KeyDistribution::ENC_KEY | KeyDistribution::ID_KEY,
        }
    }

    #[test]
    fn test_pairing_request_layout() {
        let packet = SmpPdu::PairingRequest(features()).serialize();
        assert_eq!(packet, vec![0x01, 0x04, 0x00, 0x0D, 0x10, 0x03, 0x03]);
        assert_eq!(SmpPdu::parse(&packet).unwrap(), SmpPdu::PairingRequest(features()));
    }

    #[test]
    fn test_reserved_bits_survive_reserialization() {
        let packet = [0x01, 0x03, 0x00, 0x81, 0x10, 0x41, 0x80];
        let pdu = SmpPdu::parse(&packet).unwrap();
        let SmpPdu::PairingRequest(request) = &pdu else {
            panic!("not a pairing request");
        };
        assert!(request.auth_req.contains(AuthReq::BONDING));
        assert!(!request.auth_req.contains(AuthReq::MITM));
        assert_eq!(request.io_cap_bytes(), [0x81, 0x00, 0x03]);
        assert_eq!(pdu.serialize(), packet.to_vec());
    }

    #[test]
    fn test_master_identification_layout() {
        let pdu = SmpPdu::MasterIdentification {
            ediv: 0x1234,
            rand: 0x0102030405060708,
        };
        let packet = pdu.serialize();
        assert_eq!(
            packet,
            vec![0x07, 0x34, 0x12, 0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
        assert_eq!(SmpPdu::parse(&packet).unwrap(), pdu);
    }

    #[test]
    fn test_value_is_little_endian_on_wire() {
        let packet = SmpPdu::PairingConfirm(0x00112233445566778899AABBCCDDEEFF).serialize();
        assert_eq!(packet[0], SMP_PAIRING_CONFIRM);
        assert_eq!(packet[1], 0xFF);
        assert_eq!(packet[16], 0x00);
    }

    #[test]
    fn test_identity_address_information() {
        let address = Address::random([0x01, 0x02, 0x03, 0x04, 0x05, 0xC6]);
        let packet = SmpPdu::IdentityAddressInformation(address).serialize();
        assert_eq!(packet, vec![0x09, 0x01, 0x01, 0x02, 0x03, 0x04, 0x05, 0xC6]);
        assert_eq!(
            SmpPdu::parse(&packet).unwrap(),
            SmpPdu::IdentityAddressInformation(address)
        );
    }

    #[test]
    fn test_field_ranges_rejected() {
        // IO capability 5
        let err = SmpPdu::parse(&[0x01, 0x05, 0x00, 0x01, 0x10, 0x01, 0x01]).unwrap_err();
        assert_eq!(err.reason(), Some(Reason::InvalidParameters));

        // OOB flag 2
        let err = SmpPdu::parse(&[0x01, 0x03, 0x02, 0x01, 0x10, 0x01, 0x01]).unwrap_err();
        assert_eq!(err.reason(), Some(Reason::InvalidParameters));

        // key size 6 and 17
        assert!(SmpPdu::parse(&[0x02, 0x03, 0x00, 0x01, 0x06, 0x01, 0x01]).is_err());
        assert!(SmpPdu::parse(&[0x02, 0x03, 0x00, 0x01, 0x11, 0x01, 0x01]).is_err());

        // identity address type 2
        let err = SmpPdu::parse(&[0x09, 0x02, 1, 2, 3, 4, 5, 6]).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Protocol);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        assert!(SmpPdu::parse(&[]).is_err());
        assert!(SmpPdu::parse(&[0x03, 0x00]).is_err());
        let mut long = SmpPdu::PairingRandom(7).serialize();
        long.push(0);
        assert!(matches!(
            SmpPdu::parse(&long),
            Err(SmpError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_unknown_opcode() {
        let err = SmpPdu::parse(&[0x42, 0x00]).unwrap_err();
        assert!(matches!(err, SmpError::CommandNotSupported(0x42)));
        assert_eq!(err.reason(), Some(Reason::CommandNotSupported));
    }

    #[test]
    fn test_unknown_failure_reason_maps_to_unspecified() {
        assert_eq!(
            SmpPdu::parse(&[0x05, 0x7F]).unwrap(),
            SmpPdu::PairingFailed(Reason::UnspecifiedReason)
        );
    }

    proptest! {
        #[test]
        fn parse_never_panics(data in proptest::collection::vec(any::<u8>(), 0..80)) {
            let _ = SmpPdu::parse(&data);
        }

        #[test]
        fn parsed_pdus_reserialize_to_valid_pdus(data in proptest::collection::vec(any::<u8>(), 0..80)) {
            if let Ok(pdu) = SmpPdu::parse(&data) {
                let again = SmpPdu::parse(&pdu.serialize()).unwrap();
                prop_assert_eq!(again, pdu);
            }
        }
    }
}
