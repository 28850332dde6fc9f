//! bluesm: run a complete LE pairing between two in-process Security Managers

use anyhow::{bail, Context, Result};
use bluesm::gap::Address;
use bluesm::smp::loopback::{LoopbackPair, LOOPBACK_HANDLE};
use bluesm::smp::{IoCapability, MemoryBondStore, SecurityConfig, SmNotification};
use clap::{Parser, ValueEnum};
use rand::rngs::OsRng;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum IoArg {
    DisplayOnly,
    DisplayYesNo,
    KeyboardOnly,
    NoInputNoOutput,
    KeyboardDisplay,
}

impl From<IoArg> for IoCapability {
    fn from(io: IoArg) -> Self {
        match io {
            IoArg::DisplayOnly => IoCapability::DisplayOnly,
            IoArg::DisplayYesNo => IoCapability::DisplayYesNo,
            IoArg::KeyboardOnly => IoCapability::KeyboardOnly,
            IoArg::NoInputNoOutput => IoCapability::NoInputNoOutput,
            IoArg::KeyboardDisplay => IoCapability::KeyboardDisplay,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "bluesm", version, about = "Pair two in-process LE Security Managers")]
struct Args {
    /// TOML configuration for the Central
    #[arg(long)]
    central_config: Option<PathBuf>,

    /// TOML configuration for the Peripheral
    #[arg(long)]
    peripheral_config: Option<PathBuf>,

    /// I/O capabilities of the Central
    #[arg(long, value_enum)]
    central_io: Option<IoArg>,

    /// I/O capabilities of the Peripheral
    #[arg(long, value_enum)]
    peripheral_io: Option<IoArg>,

    /// Require MITM protection on both sides
    #[arg(long)]
    mitm: bool,

    /// Disable LE Secure Connections on both sides
    #[arg(long)]
    legacy: bool,

    /// Exchange out-of-band data before pairing
    #[arg(long)]
    oob: bool,

    /// Answer numeric comparison with "no"
    #[arg(long)]
    reject: bool,

    /// Passkey typed when neither side displays one
    #[arg(long, default_value_t = 123456)]
    passkey: u32,

    /// Let the Peripheral ask for security instead of the Central pairing
    #[arg(long)]
    security_request: bool,

    /// Reconnect afterwards and encrypt with the bonded key
    #[arg(long)]
    reconnect: bool,
}

fn load_config(path: Option<&PathBuf>, io: Option<IoArg>, args: &Args) -> Result<SecurityConfig> {
    let mut config = match path {
        Some(path) => SecurityConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SecurityConfig::default(),
    };
    if let Some(io) = io {
        config.io_capability = io.into();
    }
    config.mitm |= args.mitm;
    config.oob_data_present |= args.oob;
    if args.legacy {
        config.secure_connections = false;
        config.sc_only = false;
    }
    config.validate()?;
    Ok(config)
}

fn describe(notification: &SmNotification) -> String {
    match notification {
        SmNotification::PasskeyDisplay { passkey, .. } => format!("display passkey {:06}", passkey),
        SmNotification::PasskeyRequest { .. } => "passkey requested".to_string(),
        SmNotification::NumericComparison { value, .. } => {
            format!("confirm value {:06}", value)
        }
        SmNotification::PairingComplete { outcome, .. } => format!(
            "pairing complete: {}, mitm={}, key size {}, bonded={}, keys ours={:?} theirs={:?}",
            outcome.method,
            outcome.achieved.mitm,
            outcome.achieved.key_size,
            outcome.bonded,
            outcome.local_keys,
            outcome.peer_keys
        ),
        SmNotification::PairingFailed { error, .. } => format!(
            "pairing failed: {} ({:?}, status {})",
            error,
            error.category(),
            error
                .status_code()
                .map_or_else(|| "-".to_string(), |code| format!("0x{:03X}", code))
        ),
        SmNotification::SecurityChanged { security, .. } => format!(
            "security changed: {:?}, key size {}, bonded={}",
            security.level(),
            security.key_size,
            security.bonded
        ),
        SmNotification::EncryptionFailed { status, .. } => {
            format!("encryption failed: status 0x{:02X}", status)
        }
    }
}

fn print_events(side: &str, events: &[SmNotification]) {
    for event in events {
        println!("{:>10}: {}", side, describe(event));
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let central_config = load_config(args.central_config.as_ref(), args.central_io, &args)?;
    let peripheral_config =
        load_config(args.peripheral_config.as_ref(), args.peripheral_io, &args)?;
    let legacy = !(central_config.secure_connections && peripheral_config.secure_connections);

    let central_address = Address::public([0x01, 0x00, 0x5E, 0x1B, 0x00, 0xC0]);
    let peripheral_address = Address::random([0x2A, 0x19, 0x00, 0x5E, 0x1B, 0xC5]);
    let mut pair = LoopbackPair::from_parts(
        (central_config, MemoryBondStore::new(), OsRng),
        (peripheral_config, MemoryBondStore::new(), OsRng),
        central_address,
        peripheral_address,
    )?;
    pair.fallback_passkey = args.passkey;
    pair.accept_numeric = !args.reject;

    if args.oob {
        if legacy {
            let tk: u128 = rand::random();
            pair.central.set_legacy_oob_tk(LOOPBACK_HANDLE, tk)?;
            pair.peripheral.set_legacy_oob_tk(LOOPBACK_HANDLE, tk)?;
        } else {
            let central_data = pair.central.generate_sc_oob_data(LOOPBACK_HANDLE)?;
            let peripheral_data = pair.peripheral.generate_sc_oob_data(LOOPBACK_HANDLE)?;
            pair.central.set_peer_sc_oob(LOOPBACK_HANDLE, peripheral_data)?;
            pair.peripheral.set_peer_sc_oob(LOOPBACK_HANDLE, central_data)?;
        }
        info!("Out-of-band data exchanged");
    }

    info!("Pairing {} with {}", central_address, peripheral_address);
    if args.security_request {
        pair.request_security()?;
    } else {
        pair.pair()?;
    }
    print_events("central", &pair.central_events);
    print_events("peripheral", &pair.peripheral_events);

    let Some(outcome) = pair.central_outcome() else {
        match pair.central_failure().or(pair.peripheral_failure()) {
            Some(error) => bail!("pairing failed: {}", error),
            None => bail!("pairing did not finish"),
        }
    };
    let bonded = outcome.bonded;

    if args.reconnect {
        if !bonded {
            warn!("Not bonded, nothing to reconnect with");
            return Ok(());
        }
        pair.disconnect(0x13)?;
        pair.connect();
        let seen = (pair.central_events.len(), pair.peripheral_events.len());
        pair.encrypt_bonded()?;
        print_events("central", &pair.central_events[seen.0..]);
        print_events("peripheral", &pair.peripheral_events[seen.1..]);
        match pair.central.security_state(LOOPBACK_HANDLE) {
            Some(security) if security.encrypted => {
                info!("Reconnected with {:?}", security.level())
            }
            _ => bail!("re-encryption with the bonded key failed"),
        }
    }

    println!("bonded peers (central): {}", pair.central.bonded_peers().len());
    Ok(())
}
