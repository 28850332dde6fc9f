//! HCI transport for the Security Manager
//!
//! [`HciLink`] writes H:4 packets to any byte sink (a UART, a socket or a
//! buffer) and [`decode_packet`] turns controller packets into
//! [`SmEvent`]s for the manager's event queue.

use super::constants::*;
use super::packet::{HciCommand, HciEvent, SecurityEvent, SmAclPacket};
use crate::error::LinkError;
use crate::smp::{ConnHandle, SmEvent, Transport};
use log::debug;
use std::io::Write;

/// Transport writing HCI commands and ACL data to a byte sink
#[derive(Debug)]
pub struct HciLink<W: Write> {
    writer: W,
}

impl<W: Write> HciLink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_packet(&mut self, packet: &[u8]) -> Result<(), LinkError> {
        self.writer.write_all(packet)?;
        self.writer.flush()?;
        Ok(())
    }

    fn send_command(&mut self, command: &HciCommand) -> Result<(), LinkError> {
        debug!("HCI command {:?}", command);
        self.write_packet(&command.to_packet())
    }
}

impl<W: Write> Transport for HciLink<W> {
    fn send_pdu(&mut self, conn: ConnHandle, pdu: &[u8]) -> Result<(), LinkError> {
        let packet = SmAclPacket {
            handle: conn,
            payload: pdu.to_vec(),
        }
        .to_packet()?;
        self.write_packet(&packet)
    }

    fn start_encryption(
        &mut self,
        conn: ConnHandle,
        key: u128,
        ediv: u16,
        rand: u64,
    ) -> Result<(), LinkError> {
        self.send_command(&HciCommand::LeEnableEncryption {
            handle: conn,
            random: rand,
            ediv,
            ltk: key,
        })
    }

    fn ltk_reply(&mut self, conn: ConnHandle, key: Option<u128>) -> Result<(), LinkError> {
        let command = match key {
            Some(ltk) => HciCommand::LeLongTermKeyRequestReply { handle: conn, ltk },
            None => HciCommand::LeLongTermKeyRequestNegativeReply { handle: conn },
        };
        self.send_command(&command)
    }
}

/// Decode an H:4 packet from the controller
///
/// Returns `Ok(None)` for packets that do not concern the Security Manager.
pub fn decode_packet(packet: &[u8]) -> Result<Option<SmEvent>, LinkError> {
    let (&packet_type, body) = packet.split_first().ok_or(LinkError::InvalidPacketFormat)?;
    match packet_type {
        HCI_EVENT_PKT => decode_event(body),
        HCI_ACL_PKT => Ok(SmAclPacket::parse(body)?.map(|acl| SmEvent::PduReceived {
            conn: acl.handle,
            data: acl.payload,
        })),
        _ => Ok(None),
    }
}

/// Decode an HCI event (without the H:4 indicator)
///
/// Encryption Change and Key Refresh Complete carry no key size, so
/// `key_size` is left unset and the manager reports the size negotiated
/// during pairing, or the size stored with the bonded key.
pub fn decode_event(data: &[u8]) -> Result<Option<SmEvent>, LinkError> {
    let event = HciEvent::parse(data).ok_or(LinkError::InvalidPacketFormat)?;
    let decoded = event.security_event()?.and_then(|security| match security {
        SecurityEvent::EncryptionChange {
            status,
            handle,
            enabled,
        } => Some(SmEvent::EncryptionChanged {
            conn: handle,
            status,
            enabled,
            key_size: None,
        }),
        SecurityEvent::KeyRefreshComplete { status, handle } => Some(SmEvent::EncryptionChanged {
            conn: handle,
            status,
            enabled: status == 0,
            key_size: None,
        }),
        // A failed disconnect leaves the link up
        SecurityEvent::DisconnectionComplete { status: 0, handle, reason } => {
            Some(SmEvent::ConnectionLost {
                conn: handle,
                reason,
            })
        }
        SecurityEvent::DisconnectionComplete { .. } => None,
        SecurityEvent::LongTermKeyRequest { handle, rand, ediv } => Some(SmEvent::LtkRequest {
            conn: handle,
            ediv,
            rand,
        }),
    });
    Ok(decoded)
}
