//! Bluetooth HCI (Host Controller Interface) implementation
//!
//! This module provides the link-layer side of the Security Manager: the
//! LE encryption commands, the events that report encryption and
//! disconnection, and SM PDU framing on ACL links.

pub mod constants;
pub mod link;
pub mod packet;

#[cfg(test)]
mod tests;

pub use link::{decode_event, decode_packet, HciLink};
pub use packet::{HciCommand, HciEvent, SecurityEvent, SmAclPacket};
