//! HCI packet structures and parsing
//!
//! This module contains the commands the Security Manager issues to the
//! controller, the events it listens for, and ACL framing of SM PDUs.

use crate::error::LinkError;
use crate::hci::constants::*;
use crate::smp::constants::SMP_CID;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// HCI Commands used by the Security Manager
#[derive(Clone, PartialEq, Eq)]
pub enum HciCommand {
    /// Start or refresh encryption as Central
    LeEnableEncryption {
        handle: u16,
        random: u64,
        ediv: u16,
        ltk: u128,
    },
    LeLongTermKeyRequestReply { handle: u16, ltk: u128 },
    LeLongTermKeyRequestNegativeReply { handle: u16 },
}

impl std::fmt::Debug for HciCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LeEnableEncryption { handle, .. } => f
                .debug_struct("LeEnableEncryption")
                .field("handle", handle)
                .finish_non_exhaustive(),
            Self::LeLongTermKeyRequestReply { handle, .. } => f
                .debug_struct("LeLongTermKeyRequestReply")
                .field("handle", handle)
                .finish_non_exhaustive(),
            Self::LeLongTermKeyRequestNegativeReply { handle } => f
                .debug_struct("LeLongTermKeyRequestNegativeReply")
                .field("handle", handle)
                .finish(),
        }
    }
}

impl HciCommand {
    /// Get the OGF and OCF for this command
    pub fn opcode_parts(&self) -> (u8, u16) {
        match self {
            Self::LeEnableEncryption { .. } => (OGF_LE, OCF_LE_ENABLE_ENCRYPTION),
            Self::LeLongTermKeyRequestReply { .. } => (OGF_LE, OCF_LE_LONG_TERM_KEY_REQUEST_REPLY),
            Self::LeLongTermKeyRequestNegativeReply { .. } => {
                (OGF_LE, OCF_LE_LONG_TERM_KEY_REQUEST_NEGATIVE_REPLY)
            }
        }
    }

    pub fn opcode(&self) -> u16 {
        let (ogf, ocf) = self.opcode_parts();
        ((ogf as u16) << 10) | (ocf & 0x3ff)
    }

    /// Convert the command to its raw parameter bytes
    fn parameters(&self) -> Vec<u8> {
        match *self {
            Self::LeEnableEncryption {
                handle,
                random,
                ediv,
                ltk,
            } => {
                let mut params = Vec::with_capacity(28);
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&random.to_le_bytes());
                params.extend_from_slice(&ediv.to_le_bytes());
                params.extend_from_slice(&ltk.to_le_bytes());
                params
            }

            Self::LeLongTermKeyRequestReply { handle, ltk } => {
                let mut params = Vec::with_capacity(18);
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&ltk.to_le_bytes());
                params
            }

            Self::LeLongTermKeyRequestNegativeReply { handle } => handle.to_le_bytes().to_vec(),
        }
    }

    /// Convert the command to a raw HCI packet
    pub fn to_packet(&self) -> Vec<u8> {
        let params = self.parameters();

        let mut packet = vec![HCI_COMMAND_PKT];
        packet.extend_from_slice(&self.opcode().to_le_bytes());
        packet.push(params.len() as u8);
        packet.extend_from_slice(&params);
        packet
    }
}

/// HCI Event packet
#[derive(Debug, Clone)]
pub struct HciEvent {
    pub event_code: u8,
    pub parameter_total_length: u8,
    pub parameters: Vec<u8>,
}

impl HciEvent {
    /// Parse an HCI event from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }

        let event_code = data[0];
        let parameter_total_length = data[1];

        if data.len() < (parameter_total_length as usize + 2) {
            return None;
        }

        let parameters = data[2..(parameter_total_length as usize + 2)].to_vec();

        Some(HciEvent {
            event_code,
            parameter_total_length,
            parameters,
        })
    }

    /// Decode the events the Security Manager cares about
    pub fn security_event(&self) -> Result<Option<SecurityEvent>, LinkError> {
        let mut cursor = Cursor::new(self.parameters.as_slice());
        let event = match self.event_code {
            EVT_ENCRYPTION_CHANGE => {
                let status = cursor.read_u8()?;
                let handle = cursor.read_u16::<LittleEndian>()? & ACL_HANDLE_MASK;
                let enabled = cursor.read_u8()? != 0;
                SecurityEvent::EncryptionChange {
                    status,
                    handle,
                    enabled,
                }
            }
            EVT_ENCRYPTION_KEY_REFRESH_COMPLETE => {
                let status = cursor.read_u8()?;
                let handle = cursor.read_u16::<LittleEndian>()? & ACL_HANDLE_MASK;
                SecurityEvent::KeyRefreshComplete { status, handle }
            }
            EVT_DISCONN_COMPLETE => {
                let status = cursor.read_u8()?;
                let handle = cursor.read_u16::<LittleEndian>()? & ACL_HANDLE_MASK;
                let reason = cursor.read_u8()?;
                SecurityEvent::DisconnectionComplete {
                    status,
                    handle,
                    reason,
                }
            }
            EVT_LE_META_EVENT => {
                if cursor.read_u8()? != EVT_LE_LONG_TERM_KEY_REQUEST {
                    return Ok(None);
                }
                let handle = cursor.read_u16::<LittleEndian>()? & ACL_HANDLE_MASK;
                let rand = cursor.read_u64::<LittleEndian>()?;
                let ediv = cursor.read_u16::<LittleEndian>()?;
                SecurityEvent::LongTermKeyRequest { handle, rand, ediv }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// Controller events relevant to link security
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityEvent {
    EncryptionChange {
        status: u8,
        handle: u16,
        enabled: bool,
    },
    KeyRefreshComplete {
        status: u8,
        handle: u16,
    },
    DisconnectionComplete {
        status: u8,
        handle: u16,
        reason: u8,
    },
    LongTermKeyRequest {
        handle: u16,
        rand: u64,
        ediv: u16,
    },
}

/// An SM PDU carried in an ACL data packet on the SM fixed channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmAclPacket {
    pub handle: u16,
    pub payload: Vec<u8>,
}

impl SmAclPacket {
    /// Frame the PDU as an H:4 ACL packet with a basic L2CAP header
    pub fn to_packet(&self) -> Result<Vec<u8>, LinkError> {
        let l2cap_len = u16::try_from(self.payload.len())
            .map_err(|_| LinkError::InvalidParamLength(self.payload.len()))?;
        let acl_len = l2cap_len
            .checked_add(L2CAP_HEADER_LEN as u16)
            .ok_or(LinkError::InvalidParamLength(self.payload.len()))?;

        let mut packet = Vec::with_capacity(5 + acl_len as usize);
        packet.write_u8(HCI_ACL_PKT)?;
        packet.write_u16::<LittleEndian>((self.handle & ACL_HANDLE_MASK) | ACL_PB_FIRST_FLUSHABLE)?;
        packet.write_u16::<LittleEndian>(acl_len)?;
        packet.write_u16::<LittleEndian>(l2cap_len)?;
        packet.write_u16::<LittleEndian>(SMP_CID)?;
        packet.extend_from_slice(&self.payload);
        Ok(packet)
    }

    /// Parse an ACL packet (without the H:4 indicator); `None` if it is not
    /// addressed to the SM channel
    pub fn parse(data: &[u8]) -> Result<Option<Self>, LinkError> {
        let mut cursor = Cursor::new(data);
        let handle = cursor.read_u16::<LittleEndian>()? & ACL_HANDLE_MASK;
        let acl_len = cursor.read_u16::<LittleEndian>()? as usize;
        if data.len() < 4 + acl_len || acl_len < L2CAP_HEADER_LEN {
            return Err(LinkError::InvalidPacketFormat);
        }
        let l2cap_len = cursor.read_u16::<LittleEndian>()? as usize;
        let channel_id = cursor.read_u16::<LittleEndian>()?;
        if channel_id != SMP_CID {
            return Ok(None);
        }
        if l2cap_len + L2CAP_HEADER_LEN != acl_len {
            return Err(LinkError::InvalidPacketFormat);
        }
        let start = 4 + L2CAP_HEADER_LEN;
        Ok(Some(Self {
            handle,
            payload: data[start..start + l2cap_len].to_vec(),
        }))
    }
}
