//! Unit tests for HCI packet parsing and serialization

use super::constants::*;
use super::link::*;
use super::packet::*;
use crate::error::LinkError;
use crate::smp::{SmEvent, Transport};

#[test]
fn test_hci_command_serialization() {
    // LE Enable Encryption
    let command = HciCommand::LeEnableEncryption {
        handle: 0x0040,
        random: 0x0102_0304_0506_0708,
        ediv: 0xBEEF,
        ltk: 0x00112233_44556677_8899AABB_CCDDEEFF,
    };
    let packet = command.to_packet();

    assert_eq!(packet[0], HCI_COMMAND_PKT);

    // Opcode: LE Enable Encryption (0x0019)
    let opcode = u16::from_le_bytes([packet[1], packet[2]]);
    assert_eq!(opcode, 0x2019); // OGF_LE << 10 | OCF_LE_ENABLE_ENCRYPTION

    // Param length: 28
    assert_eq!(packet[3], 28);

    // Parameters
    assert_eq!(u16::from_le_bytes([packet[4], packet[5]]), 0x0040); // handle
    assert_eq!(packet[6], 0x08); // random, least significant octet first
    assert_eq!(packet[13], 0x01);
    assert_eq!(u16::from_le_bytes([packet[14], packet[15]]), 0xBEEF); // ediv
    assert_eq!(packet[16], 0xFF); // ltk, least significant octet first
    assert_eq!(packet[31], 0x00);

    // LE Long Term Key Request Reply
    let command = HciCommand::LeLongTermKeyRequestReply {
        handle: 0x0041,
        ltk: 1,
    };
    let packet = command.to_packet();
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x201A);
    assert_eq!(packet[3], 18);
    assert_eq!(u16::from_le_bytes([packet[4], packet[5]]), 0x0041);
    assert_eq!(packet[6], 0x01);

    // LE Long Term Key Request Negative Reply
    let command = HciCommand::LeLongTermKeyRequestNegativeReply { handle: 0x0042 };
    assert_eq!(command.to_packet(), vec![HCI_COMMAND_PKT, 0x1B, 0x20, 2, 0x42, 0x00]);
}

#[test]
fn test_command_debug_hides_key() {
    let command = HciCommand::LeLongTermKeyRequestReply {
        handle: 0x0040,
        ltk: 0xDEADBEEF,
    };
    let text = format!("{:?}", command);
    assert!(text.contains("LeLongTermKeyRequestReply"));
    assert!(!text.contains("3735928559"));
}

#[test]
fn test_hci_event_parsing() {
    // Encryption Change
    let data = [
        EVT_ENCRYPTION_CHANGE, // Event code
        4,                     // Parameter length
        0x00,                  // Status
        0x40,
        0x00, // Connection_Handle
        0x01, // Encryption_Enabled
    ];

    let event = HciEvent::parse(&data).unwrap();
    assert_eq!(event.event_code, EVT_ENCRYPTION_CHANGE);
    assert_eq!(event.parameter_total_length, 4);
    assert_eq!(
        event.security_event().unwrap(),
        Some(SecurityEvent::EncryptionChange {
            status: 0,
            handle: 0x0040,
            enabled: true,
        })
    );

    // LE Long Term Key Request
    let data = [
        EVT_LE_META_EVENT,            // Event code
        13,                           // Parameter length
        EVT_LE_LONG_TERM_KEY_REQUEST, // Subevent code
        0x40,
        0x00, // Connection_Handle
        0x08,
        0x07,
        0x06,
        0x05,
        0x04,
        0x03,
        0x02,
        0x01, // Random_Number
        0x34,
        0x12, // Encrypted_Diversifier
    ];

    let event = HciEvent::parse(&data).unwrap();
    assert_eq!(
        event.security_event().unwrap(),
        Some(SecurityEvent::LongTermKeyRequest {
            handle: 0x0040,
            rand: 0x0102_0304_0506_0708,
            ediv: 0x1234,
        })
    );

    // Other LE meta events are not ours
    let event = HciEvent::parse(&[EVT_LE_META_EVENT, 2, 0x01, 0x00]).unwrap();
    assert_eq!(event.security_event().unwrap(), None);

    // Invalid data tests
    assert!(HciEvent::parse(&[]).is_none()); // Empty data
    assert!(HciEvent::parse(&[EVT_ENCRYPTION_CHANGE, 10, 1, 2]).is_none()); // Too short for parameter length

    // Parameters shorter than the event requires
    let event = HciEvent::parse(&[EVT_ENCRYPTION_CHANGE, 2, 0x00, 0x40]).unwrap();
    assert!(matches!(event.security_event(), Err(LinkError::Io(_))));
}

#[test]
fn test_decode_controller_events() {
    let refresh = [HCI_EVENT_PKT, EVT_ENCRYPTION_KEY_REFRESH_COMPLETE, 3, 0x00, 0x40, 0x00];
    assert_eq!(
        decode_packet(&refresh).unwrap(),
        Some(SmEvent::EncryptionChanged {
            conn: 0x0040,
            status: 0,
            enabled: true,
            key_size: None,
        })
    );

    let disconnect = [HCI_EVENT_PKT, EVT_DISCONN_COMPLETE, 4, 0x00, 0x40, 0x00, 0x13];
    assert_eq!(
        decode_packet(&disconnect).unwrap(),
        Some(SmEvent::ConnectionLost {
            conn: 0x0040,
            reason: 0x13,
        })
    );

    // A failed disconnect does not end the connection
    let failed = [HCI_EVENT_PKT, EVT_DISCONN_COMPLETE, 4, 0x0C, 0x40, 0x00, 0x13];
    assert_eq!(decode_packet(&failed).unwrap(), None);

    assert!(matches!(decode_packet(&[]), Err(LinkError::InvalidPacketFormat)));
}

#[test]
fn test_sm_acl_framing() {
    let acl = SmAclPacket {
        handle: 0x0040,
        payload: vec![0x0B, 0x01],
    };
    let packet = acl.to_packet().unwrap();
    assert_eq!(
        packet,
        vec![
            HCI_ACL_PKT,
            0x40,
            0x20, // handle with packet boundary flag
            0x06,
            0x00, // ACL length
            0x02,
            0x00, // L2CAP length
            0x06,
            0x00, // SM channel
            0x0B,
            0x01,
        ]
    );

    assert_eq!(
        decode_packet(&packet).unwrap(),
        Some(SmEvent::PduReceived {
            conn: 0x0040,
            data: vec![0x0B, 0x01],
        })
    );

    // ATT channel traffic is ignored
    let att = [HCI_ACL_PKT, 0x40, 0x20, 0x05, 0x00, 0x01, 0x00, 0x04, 0x00, 0x0A];
    assert_eq!(decode_packet(&att).unwrap(), None);

    // Truncated payload
    let truncated = [HCI_ACL_PKT, 0x40, 0x20, 0x06, 0x00, 0x02, 0x00, 0x06, 0x00, 0x0B];
    assert!(matches!(
        decode_packet(&truncated),
        Err(LinkError::InvalidPacketFormat)
    ));
}

#[test]
fn test_hci_link_transport() {
    let mut link = HciLink::new(Vec::new());
    link.send_pdu(0x0040, &[0x05, 0x08]).unwrap();
    link.ltk_reply(0x0040, None).unwrap();
    link.start_encryption(0x0040, 2, 3, 4).unwrap();

    let written = link.into_inner();
    let pdu_len = 9 + 2;
    assert_eq!(written[0], HCI_ACL_PKT);
    assert_eq!(&written[pdu_len - 2..pdu_len], &[0x05, 0x08]);
    assert_eq!(
        &written[pdu_len..pdu_len + 6],
        &[HCI_COMMAND_PKT, 0x1B, 0x20, 2, 0x40, 0x00]
    );
    assert_eq!(written[pdu_len + 6], HCI_COMMAND_PKT);
    assert_eq!(written.len(), pdu_len + 6 + 4 + 28);
}
