//! Error types for the link collaborator
//!
//! The Security Manager talks to the controller through a [`Transport`](crate::smp::Transport).
//! Failures on that path are reported as [`LinkError`].

use thiserror::Error;

/// Errors raised while framing, sending or decoding link-layer packets
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("I/O error on link: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid parameter length: {0}")]
    InvalidParamLength(usize),

    #[error("Invalid HCI packet format")]
    InvalidPacketFormat,

    #[error("Connection 0x{0:04X} is not connected")]
    Disconnected(u16),
}
