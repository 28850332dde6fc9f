use crate::gap::constants::*;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Central,
    Peripheral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    Public,
    Random,
}

impl From<u8> for AddressType {
    fn from(value: u8) -> Self {
        match value {
            PUBLIC_DEVICE_ADDRESS => AddressType::Public,
            _ => AddressType::Random,
        }
    }
}

impl From<AddressType> for u8 {
    fn from(value: AddressType) -> Self {
        match value {
            AddressType::Public => PUBLIC_DEVICE_ADDRESS,
            AddressType::Random => RANDOM_DEVICE_ADDRESS,
        }
    }
}

/// Bluetooth device address, stored little-endian as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Most significant octet first, as the crypto toolbox expects
    pub fn to_be_bytes(&self) -> [u8; 6] {
        let mut out = self.bytes;
        out.reverse();
        out
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

/// A typed device address. Bonds are keyed by this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub addr_type: AddressType,
    pub bdaddr: BdAddr,
}

impl Address {
    pub fn new(addr_type: AddressType, bdaddr: BdAddr) -> Self {
        Self { addr_type, bdaddr }
    }

    pub fn public(bytes: [u8; 6]) -> Self {
        Self::new(AddressType::Public, BdAddr::new(bytes))
    }

    pub fn random(bytes: [u8; 6]) -> Self {
        Self::new(AddressType::Random, BdAddr::new(bytes))
    }

    pub fn is_random(&self) -> bool {
        self.addr_type == AddressType::Random
    }

    /// True for a random address whose two top bits mark it resolvable
    pub fn is_resolvable_private(&self) -> bool {
        self.is_random() && self.bdaddr.bytes[5] & RANDOM_ADDR_SUBTYPE_MASK == RANDOM_ADDR_RESOLVABLE
    }

    /// Address type octet followed by the address, most significant octet first
    pub fn to_smp_bytes(&self) -> [u8; 7] {
        let mut out = [0u8; 7];
        out[0] = u8::from(self.addr_type);
        out[1..].copy_from_slice(&self.bdaddr.to_be_bytes());
        out
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr_type {
            AddressType::Public => write!(f, "{} (public)", self.bdaddr),
            AddressType::Random => write!(f, "{} (random)", self.bdaddr),
        }
    }
}
