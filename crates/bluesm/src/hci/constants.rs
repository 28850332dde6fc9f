//! HCI protocol constants
//!
//! This module contains the constants of the HCI packets the Security Manager
//! needs: LE encryption commands, encryption and disconnection events, and
//! ACL framing of the SM fixed channel.

// HCI packet types
pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_ACL_PKT: u8 = 0x02;
pub const HCI_EVENT_PKT: u8 = 0x04;

// Maximum size of HCI command parameters
pub const HCI_MAX_PARAM_LEN: usize = 255;

// OGF (Opcode Group Field) values
pub const OGF_LE: u8 = 0x08;

// LE Command OCF values (OGF: 0x08)
pub const OCF_LE_ENABLE_ENCRYPTION: u16 = 0x0019;
pub const OCF_LE_LONG_TERM_KEY_REQUEST_REPLY: u16 = 0x001A;
pub const OCF_LE_LONG_TERM_KEY_REQUEST_NEGATIVE_REPLY: u16 = 0x001B;

// HCI Events
pub const EVT_DISCONN_COMPLETE: u8 = 0x05;
pub const EVT_ENCRYPTION_CHANGE: u8 = 0x08;
pub const EVT_ENCRYPTION_KEY_REFRESH_COMPLETE: u8 = 0x30;
pub const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta Events
pub const EVT_LE_LONG_TERM_KEY_REQUEST: u8 = 0x05;

// ACL data
pub const ACL_HANDLE_MASK: u16 = 0x0FFF;
/// Packet boundary flag: first automatically flushable packet
pub const ACL_PB_FIRST_FLUSHABLE: u16 = 0x2000;
pub const L2CAP_HEADER_LEN: usize = 4;
