//! Security policy evaluation
//!
//! Pure functions that turn the local configuration and the exchanged
//! Pairing Request/Response into a [`Negotiation`]: the Security Requirement
//! for the session and the association method used to reach it.

use super::config::SecurityConfig;
use super::pdu::PairingFeatures;
use super::types::*;

/// Outcome of policy evaluation for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiation {
    pub requirement: SecurityRequirement,
    pub method: PairingMethod,
    /// Set for Passkey Entry
    pub passkey_role: Option<PasskeyRole>,
}

/// Association model selected from the two IO capabilities alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IoMethod {
    JustWorks,
    NumericComparison,
    Passkey(PasskeyRole),
}

fn io_method(initiator: IoCapability, responder: IoCapability, sc: bool) -> IoMethod {
    use IoCapability::*;
    use PasskeyRole::*;

    match (initiator, responder) {
        (NoInputNoOutput, _) | (_, NoInputNoOutput) => IoMethod::JustWorks,
        (DisplayOnly, DisplayOnly) | (DisplayOnly, DisplayYesNo) | (DisplayYesNo, DisplayOnly) => {
            IoMethod::JustWorks
        }
        (DisplayYesNo, DisplayYesNo) => {
            if sc {
                IoMethod::NumericComparison
            } else {
                IoMethod::JustWorks
            }
        }
        (DisplayYesNo, KeyboardDisplay)
        | (KeyboardDisplay, DisplayYesNo)
        | (KeyboardDisplay, KeyboardDisplay)
            if sc =>
        {
            IoMethod::NumericComparison
        }
        (KeyboardOnly, KeyboardOnly) => IoMethod::Passkey(BothInput),
        (KeyboardOnly, DisplayOnly)
        | (KeyboardOnly, DisplayYesNo)
        | (KeyboardOnly, KeyboardDisplay)
        | (KeyboardDisplay, DisplayOnly)
        | (KeyboardDisplay, DisplayYesNo) => IoMethod::Passkey(InitiatorInputs),
        (DisplayOnly, KeyboardOnly)
        | (DisplayOnly, KeyboardDisplay)
        | (DisplayYesNo, KeyboardOnly)
        | (DisplayYesNo, KeyboardDisplay)
        | (KeyboardDisplay, KeyboardOnly)
        | (KeyboardDisplay, KeyboardDisplay) => IoMethod::Passkey(ResponderInputs),
    }
}

fn max_key_size(config: &SecurityConfig) -> u8 {
    config.max_key_size
}

/// Build the Pairing Request this device sends as initiator
pub fn build_request(config: &SecurityConfig) -> PairingFeatures {
    let (initiator_key_dist, responder_key_dist) = if config.bonding {
        (
            config.our_key_dist & KeyDistribution::SUPPORTED,
            config.their_key_dist & KeyDistribution::SUPPORTED,
        )
    } else {
        (KeyDistribution::empty(), KeyDistribution::empty())
    };

    PairingFeatures {
        io_capability: config.io_capability,
        oob_data_present: config.oob_data_present,
        auth_req: config.auth_req(),
        max_key_size: max_key_size(config),
        initiator_key_dist,
        responder_key_dist,
    }
}

/// Build the Pairing Response to a received request
///
/// Each distribution field is the intersection of what the initiator asked
/// for and what this device is configured to send or accept.
pub fn build_response(config: &SecurityConfig, request: &PairingFeatures) -> PairingFeatures {
    let bonding = config.bonding && request.auth_req.contains(AuthReq::BONDING);
    let (initiator_key_dist, responder_key_dist) = if bonding {
        (
            request.initiator_key_dist & config.their_key_dist & KeyDistribution::SUPPORTED,
            request.responder_key_dist & config.our_key_dist & KeyDistribution::SUPPORTED,
        )
    } else {
        (KeyDistribution::empty(), KeyDistribution::empty())
    };

    PairingFeatures {
        io_capability: config.io_capability,
        oob_data_present: config.oob_data_present,
        auth_req: config.auth_req(),
        max_key_size: max_key_size(config),
        initiator_key_dist,
        responder_key_dist,
    }
}

/// Check that a response only narrows what was requested
pub fn validate_response(request: &PairingFeatures, response: &PairingFeatures) -> SmpResult<()> {
    let defined = KeyDistribution::all();
    if !(request.initiator_key_dist & defined).contains(response.initiator_key_dist & defined)
        || !(request.responder_key_dist & defined).contains(response.responder_key_dist & defined)
    {
        return Err(SmpError::InvalidParameter(
            "Pairing response distributes keys that were not requested".into(),
        ));
    }
    Ok(())
}

/// Derive the Security Requirement and association method for a session
pub fn evaluate(
    config: &SecurityConfig,
    role: PairingRole,
    request: &PairingFeatures,
    response: &PairingFeatures,
) -> SmpResult<Negotiation> {
    let sc = request.auth_req.contains(AuthReq::SC) && response.auth_req.contains(AuthReq::SC);
    if config.sc_only && !sc {
        return Err(SmpError::AuthenticationRequirements);
    }

    let key_size = request.max_key_size.min(response.max_key_size);
    if key_size < config.min_key_size {
        return Err(SmpError::EncryptionKeySize);
    }

    let oob = if sc {
        request.oob_data_present || response.oob_data_present
    } else {
        request.oob_data_present && response.oob_data_present
    };
    let mitm_requested =
        request.auth_req.contains(AuthReq::MITM) || response.auth_req.contains(AuthReq::MITM);

    let io = if oob {
        None
    } else if !mitm_requested {
        Some(IoMethod::JustWorks)
    } else {
        Some(io_method(request.io_capability, response.io_capability, sc))
    };

    let (method, passkey_role) = match (io, sc) {
        (None, true) => (PairingMethod::ScOob, None),
        (None, false) => (PairingMethod::LegacyOob, None),
        (Some(IoMethod::JustWorks), true) => (PairingMethod::ScJustWorks, None),
        (Some(IoMethod::JustWorks), false) => (PairingMethod::LegacyJustWorks, None),
        (Some(IoMethod::NumericComparison), _) => (PairingMethod::ScNumericComparison, None),
        (Some(IoMethod::Passkey(passkey_role)), true) => {
            (PairingMethod::ScPasskeyEntry, Some(passkey_role))
        }
        (Some(IoMethod::Passkey(passkey_role)), false) => {
            (PairingMethod::LegacyPasskeyEntry, Some(passkey_role))
        }
    };

    if config.mitm && !method.provides_mitm() {
        return Err(SmpError::AuthenticationRequirements);
    }

    let bonding =
        request.auth_req.contains(AuthReq::BONDING) && response.auth_req.contains(AuthReq::BONDING);
    let (mut initiator_keys, mut responder_keys) = if bonding {
        (
            response.initiator_key_dist & KeyDistribution::SUPPORTED,
            response.responder_key_dist & KeyDistribution::SUPPORTED,
        )
    } else {
        (KeyDistribution::empty(), KeyDistribution::empty())
    };
    if sc {
        // the LTK is derived, never distributed
        initiator_keys.remove(KeyDistribution::ENC_KEY);
        responder_keys.remove(KeyDistribution::ENC_KEY);
    }

    let (local_keys, peer_keys) = match role {
        PairingRole::Initiator => (initiator_keys, responder_keys),
        PairingRole::Responder => (responder_keys, initiator_keys),
    };

    Ok(Negotiation {
        requirement: SecurityRequirement {
            bonding,
            mitm: method.provides_mitm(),
            secure_connections: sc,
            keypress: false,
            key_size,
            local_keys,
            peer_keys,
        },
        method,
        passkey_role,
    })
}
