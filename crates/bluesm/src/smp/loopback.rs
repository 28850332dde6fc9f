//! In-memory link between two Security Managers
//!
//! [`LoopbackPair`] wires a Central and a Peripheral manager together over
//! [`LoopbackTransport`]s. It carries SM PDUs across, emulates the controller's
//! encryption start (the Peripheral's LTK has to match the one the Central
//! used) and answers user prompts once both sides are quiet.

use super::config::ConfigError;
use super::events::*;
use super::keys::BondStore;
use super::manager::SecurityManager;
use super::types::*;
use crate::gap::{Address, Role};
use log::{debug, warn};
use rand::{CryptoRng, RngCore};
use std::collections::VecDeque;

/// Connection handle used on both sides of the loopback link
pub const LOOPBACK_HANDLE: ConnHandle = 0x0040;

/// Controller status for a missing or rejected key
const STATUS_PIN_OR_KEY_MISSING: u8 = 0x06;

/// Upper bound on deliveries before a run is considered stuck
const MAX_STEPS: usize = 512;

/// Anything a manager asked its link layer to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutput {
    Pdu {
        conn: ConnHandle,
        data: Vec<u8>,
    },
    StartEncryption {
        conn: ConnHandle,
        key: u128,
        ediv: u16,
        rand: u64,
    },
    LtkReply {
        conn: ConnHandle,
        key: Option<u128>,
    },
}

/// Transport that queues everything it is asked to send
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    outputs: VecDeque<LinkOutput>,
}

impl LoopbackTransport {
    pub fn pop(&mut self) -> Option<LinkOutput> {
        self.outputs.pop_front()
    }

    pub fn drain(&mut self) -> Vec<LinkOutput> {
        self.outputs.drain(..).collect()
    }
}

impl Transport for LoopbackTransport {
    fn send_pdu(&mut self, conn: ConnHandle, pdu: &[u8]) -> Result<(), crate::error::LinkError> {
        self.outputs.push_back(LinkOutput::Pdu {
            conn,
            data: pdu.to_vec(),
        });
        Ok(())
    }

    fn start_encryption(
        &mut self,
        conn: ConnHandle,
        key: u128,
        ediv: u16,
        rand: u64,
    ) -> Result<(), crate::error::LinkError> {
        self.outputs.push_back(LinkOutput::StartEncryption {
            conn,
            key,
            ediv,
            rand,
        });
        Ok(())
    }

    fn ltk_reply(&mut self, conn: ConnHandle, key: Option<u128>) -> Result<(), crate::error::LinkError> {
        self.outputs.push_back(LinkOutput::LtkReply { conn, key });
        Ok(())
    }
}

/// Direction of a PDU on the loopback link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    CentralToPeripheral,
    PeripheralToCentral,
}

type TamperHook = Box<dyn FnMut(Direction, &mut Vec<u8>)>;

/// Two managers connected back to back
pub struct LoopbackPair<S: BondStore, R: RngCore + CryptoRng> {
    pub central: SecurityManager<LoopbackTransport, S, R>,
    pub peripheral: SecurityManager<LoopbackTransport, S, R>,
    pub central_address: Address,
    pub peripheral_address: Address,
    /// Notifications seen by the Central, in order
    pub central_events: Vec<SmNotification>,
    /// Notifications seen by the Peripheral, in order
    pub peripheral_events: Vec<SmNotification>,
    /// Typed when no passkey is on display
    pub fallback_passkey: u32,
    /// Answer given to numeric comparison prompts
    pub accept_numeric: bool,
    tamper: Option<TamperHook>,
    /// Key the Central is encrypting with
    pending_key: Option<u128>,
    central_seen: usize,
    peripheral_seen: usize,
}

impl<S: BondStore, R: RngCore + CryptoRng> LoopbackPair<S, R> {
    pub fn new(
        central: SecurityManager<LoopbackTransport, S, R>,
        peripheral: SecurityManager<LoopbackTransport, S, R>,
        central_address: Address,
        peripheral_address: Address,
    ) -> Self {
        let mut pair = Self {
            central,
            peripheral,
            central_address,
            peripheral_address,
            central_events: Vec::new(),
            peripheral_events: Vec::new(),
            fallback_passkey: 123456,
            accept_numeric: true,
            tamper: None,
            pending_key: None,
            central_seen: 0,
            peripheral_seen: 0,
        };
        pair.connect();
        pair
    }

    /// Build both managers from configurations and stores
    pub fn from_parts(
        central: (super::config::SecurityConfig, S, R),
        peripheral: (super::config::SecurityConfig, S, R),
        central_address: Address,
        peripheral_address: Address,
    ) -> Result<Self, ConfigError> {
        let (config, store, rng) = central;
        let central = SecurityManager::with_rng(config, LoopbackTransport::default(), store, rng)?;
        let (config, store, rng) = peripheral;
        let peripheral =
            SecurityManager::with_rng(config, LoopbackTransport::default(), store, rng)?;
        Ok(Self::new(central, peripheral, central_address, peripheral_address))
    }

    /// (Re)establish the link on both sides
    pub fn connect(&mut self) {
        self.pending_key = None;
        self.central.connect(ConnectionInfo {
            handle: LOOPBACK_HANDLE,
            role: Role::Central,
            local: self.central_address,
            peer: self.peripheral_address,
        });
        self.peripheral.connect(ConnectionInfo {
            handle: LOOPBACK_HANDLE,
            role: Role::Peripheral,
            local: self.peripheral_address,
            peer: self.central_address,
        });
    }

    /// Drop the link on both sides
    pub fn disconnect(&mut self, reason: u8) -> SmpResult<()> {
        let event = SmEvent::ConnectionLost {
            conn: LOOPBACK_HANDLE,
            reason,
        };
        let produced = self.central.handle_event(event.clone())?;
        self.central_events.extend(produced);
        let produced = self.peripheral.handle_event(event)?;
        self.peripheral_events.extend(produced);
        self.central.transport_mut().drain();
        self.peripheral.transport_mut().drain();
        Ok(())
    }

    /// Modify PDUs in flight
    pub fn set_tamper(&mut self, hook: impl FnMut(Direction, &mut Vec<u8>) + 'static) {
        self.tamper = Some(Box::new(hook));
    }

    /// Central starts pairing; runs until both sides are quiet
    pub fn pair(&mut self) -> SmpResult<()> {
        let produced = self.central.initiate_pairing(LOOPBACK_HANDLE)?;
        self.central_events.extend(produced);
        self.run()
    }

    /// Peripheral sends a Security Request; runs until both sides are quiet
    pub fn request_security(&mut self) -> SmpResult<()> {
        let produced = self.peripheral.initiate_pairing(LOOPBACK_HANDLE)?;
        self.peripheral_events.extend(produced);
        self.run()
    }

    /// Central re-encrypts with its bonded key
    pub fn encrypt_bonded(&mut self) -> SmpResult<()> {
        self.central.encrypt_bonded(LOOPBACK_HANDLE)?;
        self.run()
    }

    /// Deliver everything queued and answer prompts until nothing moves
    pub fn run(&mut self) -> SmpResult<()> {
        for _ in 0..MAX_STEPS {
            if self.step()? || self.answer_prompts()? {
                continue;
            }
            return Ok(());
        }
        Err(SmpError::InvalidState("loopback link did not settle"))
    }

    /// Deliver the next queued output, Central first; `false` when both queues are empty
    pub fn step(&mut self) -> SmpResult<bool> {
        if let Some(output) = self.central.transport_mut().pop() {
            self.from_central(output)?;
            return Ok(true);
        }
        if let Some(output) = self.peripheral.transport_mut().pop() {
            self.from_peripheral(output)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn from_central(&mut self, output: LinkOutput) -> SmpResult<()> {
        match output {
            LinkOutput::Pdu { conn, mut data } => {
                if let Some(hook) = self.tamper.as_mut() {
                    hook(Direction::CentralToPeripheral, &mut data);
                }
                let produced = self
                    .peripheral
                    .handle_event(SmEvent::PduReceived { conn, data })?;
                self.peripheral_events.extend(produced);
            }
            LinkOutput::StartEncryption {
                conn,
                key,
                ediv,
                rand,
            } => {
                debug!("Loopback: Central starts encryption");
                self.pending_key = Some(key);
                let produced = self
                    .peripheral
                    .handle_event(SmEvent::LtkRequest { conn, ediv, rand })?;
                self.peripheral_events.extend(produced);
            }
            LinkOutput::LtkReply { .. } => warn!("Loopback: LTK reply from the Central ignored"),
        }
        Ok(())
    }

    fn from_peripheral(&mut self, output: LinkOutput) -> SmpResult<()> {
        match output {
            LinkOutput::Pdu { conn, mut data } => {
                if let Some(hook) = self.tamper.as_mut() {
                    hook(Direction::PeripheralToCentral, &mut data);
                }
                let produced = self
                    .central
                    .handle_event(SmEvent::PduReceived { conn, data })?;
                self.central_events.extend(produced);
            }
            LinkOutput::LtkReply { conn, key } => {
                let expected = self.pending_key.take();
                let accepted = matches!((key, expected), (Some(a), Some(b)) if a == b);
                let (status, enabled) = if accepted {
                    (0, true)
                } else {
                    (STATUS_PIN_OR_KEY_MISSING, false)
                };
                debug!("Loopback: encryption {}", if accepted { "started" } else { "failed" });

                let event = SmEvent::EncryptionChanged {
                    conn,
                    status,
                    enabled,
                    key_size: None,
                };
                let produced = self.central.handle_event(event.clone())?;
                self.central_events.extend(produced);
                if key.is_some() {
                    let produced = self.peripheral.handle_event(event)?;
                    self.peripheral_events.extend(produced);
                }
            }
            LinkOutput::StartEncryption { .. } => {
                warn!("Loopback: Peripheral cannot start encryption")
            }
        }
        Ok(())
    }

    /// Answer prompts raised since the last call
    fn answer_prompts(&mut self) -> SmpResult<bool> {
        let central_prompts = prompts(&self.central_events[self.central_seen..]);
        self.central_seen = self.central_events.len();
        let peripheral_prompts = prompts(&self.peripheral_events[self.peripheral_seen..]);
        self.peripheral_seen = self.peripheral_events.len();

        let answered = !central_prompts.is_empty() || !peripheral_prompts.is_empty();
        for prompt in central_prompts {
            let event = self.answer(prompt, &self.peripheral_events);
            let produced = self.central.handle_event(event)?;
            self.central_events.extend(produced);
        }
        for prompt in peripheral_prompts {
            let event = self.answer(prompt, &self.central_events);
            let produced = self.peripheral.handle_event(event)?;
            self.peripheral_events.extend(produced);
        }
        Ok(answered)
    }

    fn answer(&self, prompt: Prompt, other_side: &[SmNotification]) -> SmEvent {
        match prompt {
            Prompt::Passkey(conn) => {
                let shown = other_side.iter().rev().find_map(|notification| match notification {
                    SmNotification::PasskeyDisplay { passkey, .. } => Some(*passkey),
                    _ => None,
                });
                SmEvent::PasskeyInput {
                    conn,
                    passkey: Some(shown.unwrap_or(self.fallback_passkey)),
                }
            }
            Prompt::Numeric(conn) => SmEvent::NumericComparison {
                conn,
                accept: self.accept_numeric,
            },
        }
    }

    /// Last pairing outcome reported by the Central
    pub fn central_outcome(&self) -> Option<&PairingOutcome> {
        last_outcome(&self.central_events)
    }

    pub fn peripheral_outcome(&self) -> Option<&PairingOutcome> {
        last_outcome(&self.peripheral_events)
    }

    /// Last pairing failure reported by the Central
    pub fn central_failure(&self) -> Option<&SmpError> {
        last_failure(&self.central_events)
    }

    pub fn peripheral_failure(&self) -> Option<&SmpError> {
        last_failure(&self.peripheral_events)
    }
}

#[derive(Debug, Clone, Copy)]
enum Prompt {
    Passkey(ConnHandle),
    Numeric(ConnHandle),
}

fn prompts(notifications: &[SmNotification]) -> Vec<Prompt> {
    notifications
        .iter()
        .filter_map(|notification| match notification {
            SmNotification::PasskeyRequest { conn } => Some(Prompt::Passkey(*conn)),
            SmNotification::NumericComparison { conn, .. } => Some(Prompt::Numeric(*conn)),
            _ => None,
        })
        .collect()
}

fn last_outcome(notifications: &[SmNotification]) -> Option<&PairingOutcome> {
    notifications.iter().rev().find_map(|notification| match notification {
        SmNotification::PairingComplete { outcome, .. } => Some(outcome),
        _ => None,
    })
}

fn last_failure(notifications: &[SmNotification]) -> Option<&SmpError> {
    notifications.iter().rev().find_map(|notification| match notification {
        SmNotification::PairingFailed { error, .. } => Some(error),
        _ => None,
    })
}
