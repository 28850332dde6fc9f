//! Key management for Security Manager Protocol
//!
//! This module holds the keys exchanged during bonding: Long Term Keys (LTK),
//! Identity Resolving Keys (IRK) and Connection Signature Resolving Keys
//! (CSRK). It also defines the [`BondStore`] boundary through which bonded
//! credentials are persisted, and an in-memory implementation of it.

use super::crypto;
use super::types::*;
use crate::gap::Address;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Long Term Key (LTK) information
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct LongTermKey {
    /// Key value
    pub key: u128,
    /// EDIV (Encrypted Diversifier), zero for Secure Connections
    pub ediv: u16,
    /// Rand, zero for Secure Connections
    pub rand: u64,
    /// Encryption key size in octets
    pub key_size: u8,
    /// Whether this key was generated with Secure Connections pairing
    pub secure_connections: bool,
    /// Whether the pairing that produced it had MITM protection
    pub authenticated: bool,
}

impl LongTermKey {
    /// Whether this key answers an LE Long Term Key Request with these values
    pub fn matches(&self, ediv: u16, rand: u64) -> bool {
        self.ediv == ediv && self.rand == rand
    }
}

impl fmt::Debug for LongTermKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LongTermKey")
            .field("ediv", &self.ediv)
            .field("key_size", &self.key_size)
            .field("secure_connections", &self.secure_connections)
            .field("authenticated", &self.authenticated)
            .finish_non_exhaustive()
    }
}

/// Keys distributed by one side of a bonding
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeySet {
    pub ltk: Option<LongTermKey>,
    pub irk: Option<u128>,
    #[zeroize(skip)]
    pub identity: Option<Address>,
    pub csrk: Option<u128>,
}

impl KeySet {
    /// Key types present in this set
    pub fn distributed(&self) -> KeyDistribution {
        let mut dist = KeyDistribution::empty();
        if self.ltk.is_some() {
            dist |= KeyDistribution::ENC_KEY;
        }
        if self.irk.is_some() {
            dist |= KeyDistribution::ID_KEY;
        }
        if self.csrk.is_some() {
            dist |= KeyDistribution::SIGN_KEY;
        }
        dist
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySet")
            .field("ltk", &self.ltk)
            .field("irk", &self.irk.map(|_| "<redacted>"))
            .field("identity", &self.identity)
            .field("csrk", &self.csrk.map(|_| "<redacted>"))
            .finish()
    }
}

/// Bonded credential record for one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondRecord {
    /// Identity of the peer (identity address if it sent one)
    pub peer: Address,
    /// Keys this device distributed
    pub local: KeySet,
    /// Keys the peer distributed
    pub peer_keys: KeySet,
    pub authenticated: bool,
    pub secure_connections: bool,
    pub key_size: u8,
}

impl BondRecord {
    /// LTK to encrypt with when this device is the Central
    pub fn central_ltk(&self) -> Option<&LongTermKey> {
        self.peer_keys.ltk.as_ref()
    }

    /// LTK to answer the controller with when this device is the Peripheral
    pub fn peripheral_ltk(&self) -> Option<&LongTermKey> {
        self.local.ltk.as_ref()
    }

    pub fn security_level(&self) -> SecurityLevel {
        LinkSecurity {
            encrypted: true,
            authenticated: self.authenticated,
            secure_connections: self.secure_connections,
            bonded: true,
            key_size: self.key_size,
        }
        .level()
    }
}

/// Errors reported by a bond store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Bond store capacity exceeded")]
    CapacityExceeded,

    #[error("Bond store backend error: {0}")]
    Backend(String),
}

/// Passed to the store when a write does not fit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityContext {
    pub conn: ConnHandle,
    pub peer: Address,
}

/// What the store wants done after a capacity overflow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityDecision {
    /// Room was made; write again now
    Retry,
    /// The application will signal when room has been made
    Deferred,
    /// Give up on this bond
    Abandon,
}

/// Persistence boundary for bonded credentials
pub trait BondStore {
    /// Load the record for a peer identity
    fn read(&self, peer: &Address) -> Option<BondRecord>;

    /// Persist a record, replacing any record for the same peer
    fn write(&mut self, record: BondRecord) -> Result<(), StoreError>;

    /// Remove the record for a peer
    fn delete(&mut self, peer: &Address) -> Result<(), StoreError>;

    /// Called when a write failed with [`StoreError::CapacityExceeded`]
    fn on_capacity_exceeded(&mut self, context: &CapacityContext) -> CapacityDecision;

    /// Map a resolvable private address to the identity it belongs to
    fn resolve(&self, address: &Address) -> Option<Address> {
        let _ = address;
        None
    }

    /// All bonded peer identities
    fn peers(&self) -> Vec<Address> {
        Vec::new()
    }
}

/// How [`MemoryBondStore`] reacts when full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    EvictOldest,
    Defer,
    Refuse,
}

/// In-memory implementation of BondStore
#[derive(Debug)]
pub struct MemoryBondStore {
    records: HashMap<Address, BondRecord>,
    order: VecDeque<Address>,
    capacity: usize,
    policy: OverflowPolicy,
    capacity_events: usize,
}

impl Default for MemoryBondStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBondStore {
    /// Create a new empty store without a size limit
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            policy: OverflowPolicy::EvictOldest,
            capacity_events: 0,
        }
    }

    pub fn set_overflow_policy(&mut self, policy: OverflowPolicy) {
        self.policy = policy;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of overflow notifications received so far
    pub fn capacity_events(&self) -> usize {
        self.capacity_events
    }
}

impl BondStore for MemoryBondStore {
    fn read(&self, peer: &Address) -> Option<BondRecord> {
        self.records.get(peer).cloned()
    }

    fn write(&mut self, record: BondRecord) -> Result<(), StoreError> {
        let peer = record.peer;
        if !self.records.contains_key(&peer) && self.records.len() >= self.capacity {
            return Err(StoreError::CapacityExceeded);
        }
        self.order.retain(|existing| *existing != peer);
        self.order.push_back(peer);
        self.records.insert(peer, record);
        Ok(())
    }

    fn delete(&mut self, peer: &Address) -> Result<(), StoreError> {
        self.order.retain(|existing| existing != peer);
        self.records.remove(peer);
        Ok(())
    }

    fn on_capacity_exceeded(&mut self, _context: &CapacityContext) -> CapacityDecision {
        self.capacity_events += 1;
        match self.policy {
            OverflowPolicy::EvictOldest => {
                if let Some(oldest) = self.order.pop_front() {
                    self.records.remove(&oldest);
                    CapacityDecision::Retry
                } else {
                    CapacityDecision::Abandon
                }
            }
            OverflowPolicy::Defer => CapacityDecision::Deferred,
            OverflowPolicy::Refuse => CapacityDecision::Abandon,
        }
    }

    fn resolve(&self, address: &Address) -> Option<Address> {
        if !address.is_resolvable_private() {
            return None;
        }
        self.records.values().find_map(|record| match record.peer_keys.irk {
            Some(irk) if crypto::resolves(irk, address) => Some(record.peer),
            _ => None,
        })
    }

    fn peers(&self) -> Vec<Address> {
        self.order.iter().copied().collect()
    }
}

/// Identity this device distributes during bonding
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct LocalIdentity {
    pub irk: u128,
    /// Identity address; the link's own address is used when unset
    #[zeroize(skip)]
    pub address: Option<Address>,
}
