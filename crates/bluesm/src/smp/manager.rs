//! Security Manager Protocol manager implementation
//!
//! This module provides the main interface for the SMP module. The
//! [`SecurityManager`] owns every connection's pairing session and is driven
//! by one serialized stream of [`SmEvent`]s: received PDUs, controller
//! encryption events, user input and store signals. Each call returns the
//! notifications the application has to act on.

use super::agreement::OobMaterial;
use super::config::{ConfigError, SecurityConfig};
use super::crypto::{random_u128, EcdhKeyPair, ScOobData};
use super::events::*;
use super::keys::*;
use super::pairing::{PairingSession, SessionContext};
use super::pdu::SmpPdu;
use super::throttle::AttemptThrottle;
use super::types::*;
use crate::gap::{Address, Role};
use log::{debug, info, warn};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// Per-connection state kept by the manager
struct Link {
    info: ConnectionInfo,
    security: LinkSecurity,
    session: Option<PairingSession>,
    /// OOB material for the next pairing on this link
    oob: OobMaterial,
    /// Security the link gets if the bonded key being used is accepted
    pending_bond: Option<LinkSecurity>,
    /// SMP timed out; no further pairing on this connection
    timed_out: bool,
}

impl Link {
    fn active_session(&self) -> Option<&PairingSession> {
        self.session.as_ref().filter(|session| !session.is_terminal())
    }
}

/// Security Manager for all connections of one host
pub struct SecurityManager<T: Transport, S: BondStore, R: RngCore + CryptoRng = OsRng> {
    config: SecurityConfig,
    transport: T,
    store: S,
    rng: R,
    identity: LocalIdentity,
    throttle: AttemptThrottle,
    links: HashMap<ConnHandle, Link>,
    /// Connections whose bond commit waits for store room, oldest first
    commit_queue: VecDeque<ConnHandle>,
}

impl<T: Transport, S: BondStore> SecurityManager<T, S, OsRng> {
    /// Create a manager drawing randomness from the operating system
    pub fn new(config: SecurityConfig, transport: T, store: S) -> Result<Self, ConfigError> {
        Self::with_rng(config, transport, store, OsRng)
    }
}

impl<T: Transport, S: BondStore, R: RngCore + CryptoRng> SecurityManager<T, S, R> {
    pub fn with_rng(
        config: SecurityConfig,
        transport: T,
        store: S,
        mut rng: R,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let irk = match config.identity_irk()? {
            Some(irk) => irk,
            None => random_u128(&mut rng),
        };
        let throttle = AttemptThrottle::new(config.max_failed_attempts, config.attempt_window());

        Ok(Self {
            config,
            transport,
            store,
            rng,
            identity: LocalIdentity { irk, address: None },
            throttle,
            links: HashMap::new(),
            commit_queue: VecDeque::new(),
        })
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Replace the configuration; sessions already running keep theirs
    pub fn set_config(&mut self, config: SecurityConfig) -> Result<(), ConfigError> {
        config.validate()?;
        if let Some(irk) = config.identity_irk()? {
            self.identity.irk = irk;
        }
        self.throttle
            .reconfigure(config.max_failed_attempts, config.attempt_window());
        self.config = config;
        Ok(())
    }

    /// Identity address distributed during bonding instead of the link address
    pub fn set_identity_address(&mut self, address: Address) {
        self.identity.address = Some(address);
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Register a new connection
    pub fn connect(&mut self, info: ConnectionInfo) {
        debug!(
            "Connection 0x{:04X} to {} as {:?}",
            info.handle, info.peer, info.role
        );
        self.links.insert(
            info.handle,
            Link {
                info,
                security: LinkSecurity::default(),
                session: None,
                oob: OobMaterial::default(),
                pending_bond: None,
                timed_out: false,
            },
        );
    }

    pub fn session_state(&self, conn: ConnHandle) -> Option<PairingState> {
        self.links
            .get(&conn)?
            .session
            .as_ref()
            .map(|session| session.state())
    }

    pub fn security_state(&self, conn: ConnHandle) -> Option<LinkSecurity> {
        self.links.get(&conn).map(|link| link.security)
    }

    /// Whether a session on this connection still holds key material
    pub fn holds_secrets(&self, conn: ConnHandle) -> bool {
        self.links
            .get(&conn)
            .and_then(|link| link.session.as_ref())
            .map_or(false, |session| session.holds_secrets())
    }

    /// Earliest session deadline, for the host's event loop timer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.links
            .values()
            .filter_map(|link| link.active_session()?.deadline())
            .min()
    }

    pub fn bonded_peers(&self) -> Vec<Address> {
        self.store.peers()
    }

    pub fn remove_bond(&mut self, peer: &Address) -> SmpResult<()> {
        let identity = self.store.resolve(peer).unwrap_or(*peer);
        if self.store.read(&identity).is_none() {
            return Err(SmpError::NotBonded);
        }
        self.store.delete(&identity)?;
        info!("Removed bond with {}", identity);
        Ok(())
    }

    fn link_mut(&mut self, conn: ConnHandle) -> SmpResult<&mut Link> {
        self.links
            .get_mut(&conn)
            .ok_or(SmpError::UnknownConnection(conn))
    }

    /// Temporary Key for a LE Legacy OOB pairing on this connection
    pub fn set_legacy_oob_tk(&mut self, conn: ConnHandle, tk: u128) -> SmpResult<()> {
        self.link_mut(conn)?.oob.legacy_tk = Some(tk);
        Ok(())
    }

    /// OOB data received from the peer for LE Secure Connections
    pub fn set_peer_sc_oob(&mut self, conn: ConnHandle, data: ScOobData) -> SmpResult<()> {
        self.link_mut(conn)?.oob.sc_peer = Some(data);
        Ok(())
    }

    /// Generate the key pair for the next pairing on this connection and
    /// the OOB data to hand to the peer
    pub fn generate_sc_oob_data(&mut self, conn: ConnHandle) -> SmpResult<ScOobData> {
        let link = self
            .links
            .get_mut(&conn)
            .ok_or(SmpError::UnknownConnection(conn))?;
        let key_pair = EcdhKeyPair::generate(&mut self.rng);
        let data = ScOobData::generate(&key_pair, &mut self.rng);
        link.oob.sc_local = Some((key_pair, data));
        Ok(data)
    }

    fn lookup_bond(&self, peer: &Address) -> Option<BondRecord> {
        let identity = self.store.resolve(peer).unwrap_or(*peer);
        self.store.read(&identity)
    }

    fn blocked_identities(&self) -> Vec<Address> {
        self.links
            .values()
            .filter_map(|link| link.session.as_ref()?.pending_identity())
            .collect()
    }

    /// Run `f` against the active session of a connection
    fn with_session<F>(
        &mut self,
        conn: ConnHandle,
        now: Instant,
        f: F,
    ) -> SmpResult<Vec<SmNotification>>
    where
        F: FnOnce(&mut PairingSession, &mut SessionContext<'_, T, S, R>) -> SmpResult<()>,
    {
        let blocked = self.blocked_identities();
        let mut notifications = Vec::new();
        let link = self
            .links
            .get_mut(&conn)
            .ok_or(SmpError::UnknownConnection(conn))?;
        let session = link
            .session
            .as_mut()
            .filter(|session| !session.is_terminal())
            .ok_or(SmpError::InvalidState("no pairing in progress"))?;
        let pending = session.pending_identity();

        let mut ctx = SessionContext {
            transport: &mut self.transport,
            store: &mut self.store,
            rng: &mut self.rng,
            throttle: &mut self.throttle,
            identity: &self.identity,
            notifications: &mut notifications,
            blocked_identities: &blocked,
            now,
        };
        f(session, &mut ctx)?;
        let released = pending.filter(|_| !session.awaiting_store_room());
        self.after_session_event(&notifications);

        // commits queued behind this one no longer wait on it
        if let Some(identity) = released {
            match self.retry_commits(Some(identity), now) {
                Ok(produced) => notifications.extend(produced),
                Err(error) => warn!("Queued commit for {} not retried: {}", identity, error),
            }
        }
        Ok(notifications)
    }

    /// Bookkeeping that follows any session progress
    fn after_session_event(&mut self, notifications: &[SmNotification]) {
        for notification in notifications {
            if let SmNotification::PairingComplete { conn, outcome } = notification {
                if let Some(link) = self.links.get_mut(conn) {
                    link.security.bonded |= outcome.bonded;
                }
            }
        }
        for (conn, link) in &self.links {
            let waiting = link
                .session
                .as_ref()
                .map_or(false, |session| session.awaiting_store_room());
            if waiting && !self.commit_queue.contains(conn) {
                self.commit_queue.push_back(*conn);
            }
        }
        let links = &self.links;
        self.commit_queue.retain(|conn| {
            links
                .get(conn)
                .and_then(|link| link.session.as_ref())
                .map_or(false, |session| session.awaiting_store_room())
        });
    }

    /// Tell the peer pairing is refused and report the failure
    fn reject(&mut self, conn: ConnHandle, error: SmpError) -> SmpResult<Vec<SmNotification>> {
        if let Some(reason) = error.peer_reason() {
            self.transport
                .send_pdu(conn, &SmpPdu::PairingFailed(reason).serialize())?;
        }
        warn!("Pairing on connection 0x{:04X} refused: {}", conn, error);
        Ok(vec![SmNotification::PairingFailed { conn, error }])
    }

    fn new_session(&mut self, conn: ConnHandle, now: Instant) -> SmpResult<()> {
        let config = self.config.clone();
        let link = self.link_mut(conn)?;
        let oob = std::mem::take(&mut link.oob);
        link.session = Some(PairingSession::new(link.info, config, oob, now));
        Ok(())
    }

    /// Start pairing on a connection
    ///
    /// As Central this sends a Pairing Request. As Peripheral it sends a
    /// Security Request and waits for the Central to start pairing.
    pub fn initiate_pairing(&mut self, conn: ConnHandle) -> SmpResult<Vec<SmNotification>> {
        self.initiate_pairing_at(conn, Instant::now())
    }

    pub fn initiate_pairing_at(
        &mut self,
        conn: ConnHandle,
        now: Instant,
    ) -> SmpResult<Vec<SmNotification>> {
        let link = self
            .links
            .get(&conn)
            .ok_or(SmpError::UnknownConnection(conn))?;
        if link.timed_out {
            return Err(SmpError::InvalidState("SMP timed out on this connection"));
        }
        if link.active_session().is_some() {
            return Err(SmpError::InvalidState("pairing already in progress"));
        }
        let info = link.info;
        if !self.config.pairable {
            return Err(SmpError::PairingNotSupported);
        }
        if self.throttle.is_blocked(&info.peer, now) {
            return Err(SmpError::RepeatedAttempts);
        }

        self.new_session(conn, now)?;
        match info.role {
            Role::Central => self.with_session(conn, now, |session, ctx| session.initiate(ctx)),
            Role::Peripheral => {
                let auth_req = self.config.auth_req();
                debug!("Sending Security Request on connection 0x{:04X}", conn);
                self.transport
                    .send_pdu(conn, &SmpPdu::SecurityRequest(auth_req).serialize())?;
                Ok(Vec::new())
            }
        }
    }

    /// Re-encrypt a Central link with the LTK of an existing bond
    pub fn encrypt_bonded(&mut self, conn: ConnHandle) -> SmpResult<()> {
        let link = self
            .links
            .get(&conn)
            .ok_or(SmpError::UnknownConnection(conn))?;
        if link.info.role != Role::Central {
            return Err(SmpError::InvalidState("only the Central starts encryption"));
        }
        if link.active_session().is_some() {
            return Err(SmpError::InvalidState("pairing in progress"));
        }
        let record = self.lookup_bond(&link.info.peer).ok_or(SmpError::NotBonded)?;
        let ltk = record.central_ltk().ok_or(SmpError::NotBonded)?;

        debug!("Encrypting connection 0x{:04X} with bonded key", conn);
        self.transport
            .start_encryption(conn, ltk.key, ltk.ediv, ltk.rand)?;
        let security = LinkSecurity {
            encrypted: true,
            authenticated: record.authenticated,
            secure_connections: record.secure_connections,
            bonded: true,
            key_size: ltk.key_size,
        };
        self.link_mut(conn)?.pending_bond = Some(security);
        Ok(())
    }

    /// Fail every session whose deadline has passed
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<SmNotification> {
        let expired: Vec<ConnHandle> = self
            .links
            .iter()
            .filter(|(_, link)| {
                link.active_session()
                    .and_then(|session| session.deadline())
                    .map_or(false, |deadline| deadline <= now)
            })
            .map(|(conn, _)| *conn)
            .collect();

        let mut notifications = Vec::new();
        for conn in expired {
            if let Some(link) = self.links.get_mut(&conn) {
                link.timed_out = true;
            }
            match self.with_session(conn, now, |session, ctx| {
                session.on_timeout(ctx);
                Ok(())
            }) {
                Ok(produced) => notifications.extend(produced),
                Err(error) => warn!("Timeout handling on 0x{:04X}: {}", conn, error),
            }
        }
        notifications
    }

    pub fn handle_event(&mut self, event: SmEvent) -> SmpResult<Vec<SmNotification>> {
        self.handle_event_at(event, Instant::now())
    }

    /// Process one event with an explicit notion of the current time
    pub fn handle_event_at(
        &mut self,
        event: SmEvent,
        now: Instant,
    ) -> SmpResult<Vec<SmNotification>> {
        match event {
            SmEvent::PduReceived { conn, data } => self.on_pdu(conn, &data, now),
            SmEvent::EncryptionChanged {
                conn,
                status,
                enabled,
                key_size,
            } => self.on_encryption_changed(conn, status, enabled, key_size, now),
            SmEvent::LtkRequest { conn, ediv, rand } => self.on_ltk_request(conn, ediv, rand, now),
            SmEvent::PasskeyInput { conn, passkey } => {
                self.with_session(conn, now, |session, ctx| session.on_passkey(passkey, ctx))
            }
            SmEvent::NumericComparison { conn, accept } => self.with_session(conn, now, |session, ctx| {
                session.on_numeric_comparison(accept, ctx)
            }),
            SmEvent::StoreRoomMade => self.on_store_room_made(now),
            SmEvent::Cancel { conn } => {
                info!("Pairing on connection 0x{:04X} cancelled", conn);
                self.with_session(conn, now, |session, ctx| {
                    session.fail(SmpError::Cancelled, ctx);
                    Ok(())
                })
            }
            SmEvent::ConnectionLost { conn, reason } => self.on_connection_lost(conn, reason, now),
        }
    }

    fn on_pdu(
        &mut self,
        conn: ConnHandle,
        data: &[u8],
        now: Instant,
    ) -> SmpResult<Vec<SmNotification>> {
        let link = self
            .links
            .get(&conn)
            .ok_or(SmpError::UnknownConnection(conn))?;
        if link.timed_out {
            debug!("Dropping SM PDU on timed out connection 0x{:04X}", conn);
            return Ok(Vec::new());
        }
        let has_session = link.active_session().is_some();
        let info = link.info;

        let pdu = match SmpPdu::parse(data) {
            Ok(pdu) => pdu,
            Err(error) if has_session => {
                return self.with_session(conn, now, |session, ctx| {
                    session.fail(error, ctx);
                    Ok(())
                });
            }
            Err(error) => {
                warn!("Malformed SM PDU on connection 0x{:04X}: {}", conn, error);
                if let Some(reason) = error.peer_reason() {
                    self.transport
                        .send_pdu(conn, &SmpPdu::PairingFailed(reason).serialize())?;
                }
                return Ok(Vec::new());
            }
        };

        if has_session {
            return self.with_session(conn, now, |session, ctx| session.on_pdu(pdu, ctx));
        }

        match (pdu, info.role) {
            (pdu @ SmpPdu::PairingRequest(_), Role::Peripheral) => {
                if !self.config.pairable {
                    return self.reject(conn, SmpError::PairingNotSupported);
                }
                if self.throttle.is_blocked(&info.peer, now) {
                    return self.reject(conn, SmpError::RepeatedAttempts);
                }
                self.new_session(conn, now)?;
                self.with_session(conn, now, |session, ctx| session.on_pdu(pdu, ctx))
            }
            (SmpPdu::SecurityRequest(auth_req), Role::Central) => {
                self.on_security_request(conn, info, auth_req, now)
            }
            (SmpPdu::PairingFailed(reason), _) => {
                debug!(
                    "Pairing Failed ({}) without a pairing on connection 0x{:04X}",
                    reason, conn
                );
                Ok(Vec::new())
            }
            (pdu @ (SmpPdu::PairingRequest(_) | SmpPdu::SecurityRequest(_)), _) => {
                warn!("{} not supported in this role", pdu.name());
                self.transport.send_pdu(
                    conn,
                    &SmpPdu::PairingFailed(Reason::CommandNotSupported).serialize(),
                )?;
                Ok(Vec::new())
            }
            (pdu, _) => {
                warn!("{} received outside of pairing", pdu.name());
                self.transport.send_pdu(
                    conn,
                    &SmpPdu::PairingFailed(Reason::UnspecifiedReason).serialize(),
                )?;
                Ok(Vec::new())
            }
        }
    }

    fn on_security_request(
        &mut self,
        conn: ConnHandle,
        info: ConnectionInfo,
        auth_req: AuthReq,
        now: Instant,
    ) -> SmpResult<Vec<SmNotification>> {
        let sufficient = self.lookup_bond(&info.peer).map_or(false, |record| {
            record.central_ltk().is_some()
                && (record.security_level().is_authenticated()
                    || !auth_req.contains(AuthReq::MITM))
        });
        if sufficient {
            debug!("Security Request from bonded peer {}, re-encrypting", info.peer);
            self.encrypt_bonded(conn)?;
            return Ok(Vec::new());
        }
        match self.initiate_pairing_at(conn, now) {
            Err(error @ (SmpError::RepeatedAttempts | SmpError::PairingNotSupported)) => {
                self.reject(conn, error)
            }
            other => other,
        }
    }

    fn on_encryption_changed(
        &mut self,
        conn: ConnHandle,
        status: u8,
        enabled: bool,
        key_size: Option<u8>,
        now: Instant,
    ) -> SmpResult<Vec<SmNotification>> {
        let link = self.link_mut(conn)?;
        let pending_bond = link.pending_bond.take();
        let mut notifications = Vec::new();

        if status == 0 && enabled {
            let session_security = link
                .session
                .as_ref()
                .filter(|session| session.state() == PairingState::EncryptionPending)
                .and_then(|session| session.link_security(key_size));
            let re_encrypted = session_security.is_none() && pending_bond.is_some();
            let mut security = match (session_security, pending_bond) {
                (Some(security), _) => security,
                (None, Some(security)) => security,
                (None, None) => LinkSecurity {
                    encrypted: true,
                    ..link.security
                },
            };
            if let Some(key_size) = key_size {
                security.key_size = key_size;
            }
            link.security = security;
            // A Security Request answered with the bonded key needs no pairing
            if re_encrypted
                && link
                    .session
                    .as_ref()
                    .map_or(false, |session| session.state() == PairingState::Idle)
            {
                link.session = None;
            }
            info!(
                "Connection 0x{:04X} encrypted ({:?})",
                conn,
                security.level()
            );
            notifications.push(SmNotification::SecurityChanged { conn, security });
        } else {
            if status == 0 {
                link.security = LinkSecurity::default();
                notifications.push(SmNotification::SecurityChanged {
                    conn,
                    security: link.security,
                });
            }
            if pending_bond.is_some() {
                warn!(
                    "Encryption with bonded key failed on 0x{:04X}: status 0x{:02X}",
                    conn, status
                );
                notifications.push(SmNotification::EncryptionFailed { conn, status });
            }
        }

        if link.active_session().is_some() {
            notifications.extend(self.with_session(conn, now, |session, ctx| {
                session.on_encryption_changed(status, enabled, ctx)
            })?);
        }
        Ok(notifications)
    }

    fn on_ltk_request(
        &mut self,
        conn: ConnHandle,
        ediv: u16,
        rand: u64,
        now: Instant,
    ) -> SmpResult<Vec<SmNotification>> {
        let link = self
            .links
            .get(&conn)
            .ok_or(SmpError::UnknownConnection(conn))?;
        if link
            .active_session()
            .map_or(false, |session| session.awaits_ltk_request())
        {
            return self.with_session(conn, now, |session, ctx| session.on_ltk_request(ctx));
        }

        let peer = link.info.peer;
        let bonded = self.lookup_bond(&peer).and_then(|record| {
            let ltk = record.peripheral_ltk().filter(|ltk| ltk.matches(ediv, rand))?;
            Some((
                ltk.key,
                LinkSecurity {
                    encrypted: true,
                    authenticated: record.authenticated,
                    secure_connections: record.secure_connections,
                    bonded: true,
                    key_size: ltk.key_size,
                },
            ))
        });

        match bonded {
            Some((key, security)) => {
                debug!("Answering LTK request on 0x{:04X} from bond", conn);
                self.transport.ltk_reply(conn, Some(key))?;
                self.link_mut(conn)?.pending_bond = Some(security);
            }
            None => {
                debug!("No key for LTK request on 0x{:04X}", conn);
                self.transport.ltk_reply(conn, None)?;
            }
        }
        Ok(Vec::new())
    }

    fn on_store_room_made(&mut self, now: Instant) -> SmpResult<Vec<SmNotification>> {
        self.retry_commits(None, now)
    }

    /// Retry deferred commits in the order they were deferred, optionally
    /// only those for one peer identity
    fn retry_commits(
        &mut self,
        only: Option<Address>,
        now: Instant,
    ) -> SmpResult<Vec<SmNotification>> {
        let mut notifications = Vec::new();
        let mut still_blocked: Vec<Address> = Vec::new();
        let queued: Vec<ConnHandle> = self.commit_queue.iter().copied().collect();

        for conn in queued {
            let Some(identity) = self
                .links
                .get(&conn)
                .and_then(|link| link.session.as_ref())
                .filter(|session| session.awaiting_store_room())
                .and_then(|session| session.pending_identity())
            else {
                continue;
            };
            if still_blocked.contains(&identity) || only.map_or(false, |only| only != identity) {
                continue;
            }
            notifications.extend(
                self.with_session(conn, now, |session, ctx| session.on_store_room_made(ctx))?,
            );
            let waiting = self
                .links
                .get(&conn)
                .and_then(|link| link.session.as_ref())
                .map_or(false, |session| session.awaiting_store_room());
            if waiting {
                still_blocked.push(identity);
            }
        }
        Ok(notifications)
    }

    fn on_connection_lost(
        &mut self,
        conn: ConnHandle,
        reason: u8,
        now: Instant,
    ) -> SmpResult<Vec<SmNotification>> {
        let active = self
            .links
            .get(&conn)
            .ok_or(SmpError::UnknownConnection(conn))?
            .active_session()
            .is_some();
        debug!(
            "Connection 0x{:04X} lost (reason 0x{:02X})",
            conn, reason
        );

        let notifications = if active {
            self.with_session(conn, now, |session, ctx| {
                session.fail(SmpError::ConnectionLost, ctx);
                Ok(())
            })?
        } else {
            Vec::new()
        };
        self.links.remove(&conn);
        self.commit_queue.retain(|queued| *queued != conn);
        Ok(notifications)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smp::loopback::{LinkOutput, LoopbackTransport};
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    fn manager(role: Role) -> (SecurityManager<LoopbackTransport, MemoryBondStore, ChaCha12Rng>, ConnectionInfo) {
        let mut manager = SecurityManager::with_rng(
            SecurityConfig::default(),
            LoopbackTransport::default(),
            MemoryBondStore::new(),
            ChaCha12Rng::seed_from_u64(7),
        )
        .unwrap();
        let info = ConnectionInfo {
            handle: 0x40,
            role,
            local: Address::public([1, 1, 1, 1, 1, 1]),
            peer: Address::public([2, 2, 2, 2, 2, 2]),
        };
        manager.connect(info);
        (manager, info)
    }

    #[test]
    fn test_central_sends_pairing_request() {
        let (mut manager, info) = manager(Role::Central);
        manager.initiate_pairing(info.handle).unwrap();
        assert_eq!(
            manager.session_state(info.handle),
            Some(PairingState::RequestExchanged)
        );
        let sent = manager.transport_mut().drain();
        assert!(matches!(
            sent.as_slice(),
            [LinkOutput::Pdu { data, .. }] if data[0] == crate::smp::constants::SMP_PAIRING_REQUEST
        ));
        assert!(matches!(
            manager.initiate_pairing(info.handle),
            Err(SmpError::InvalidState(_))
        ));
    }

    #[test]
    fn test_peripheral_sends_security_request() {
        let (mut manager, info) = manager(Role::Peripheral);
        manager.initiate_pairing(info.handle).unwrap();
        assert_eq!(manager.session_state(info.handle), Some(PairingState::Idle));
        let sent = manager.transport_mut().drain();
        assert!(matches!(
            sent.as_slice(),
            [LinkOutput::Pdu { data, .. }] if data[0] == crate::smp::constants::SMP_SECURITY_REQUEST
        ));
    }

    #[test]
    fn test_unknown_connection() {
        let (mut manager, _) = manager(Role::Central);
        assert!(matches!(
            manager.initiate_pairing(0x99),
            Err(SmpError::UnknownConnection(0x99))
        ));
        assert!(matches!(
            manager.handle_event(SmEvent::Cancel { conn: 0x99 }),
            Err(SmpError::UnknownConnection(0x99))
        ));
    }

    #[test]
    fn test_unknown_opcode_without_session() {
        let (mut manager, info) = manager(Role::Peripheral);
        let notifications = manager
            .handle_event(SmEvent::PduReceived {
                conn: info.handle,
                data: vec![0x7F],
            })
            .unwrap();
        assert!(notifications.is_empty());
        let sent = manager.transport_mut().drain();
        assert!(matches!(
            sent.as_slice(),
            [LinkOutput::Pdu { data, .. }]
                if data.as_slice() == [crate::smp::constants::SMP_PAIRING_FAILED, Reason::CommandNotSupported.to_u8()]
        ));
    }

    #[test]
    fn test_ltk_request_without_bond_is_refused() {
        let (mut manager, info) = manager(Role::Peripheral);
        manager
            .handle_event(SmEvent::LtkRequest {
                conn: info.handle,
                ediv: 1,
                rand: 2,
            })
            .unwrap();
        let sent = manager.transport_mut().drain();
        assert!(matches!(
            sent.as_slice(),
            [LinkOutput::LtkReply { key: None, .. }]
        ));
    }

    #[test]
    fn test_encrypt_bonded_requires_bond() {
        let (mut manager, info) = manager(Role::Central);
        assert!(matches!(
            manager.encrypt_bonded(info.handle),
            Err(SmpError::NotBonded)
        ));
        assert!(matches!(manager.remove_bond(&info.peer), Err(SmpError::NotBonded)));
    }

    #[test]
    fn test_confirm_covers_reserved_auth_req_bits() {
        use crate::smp::crypto::c1;

        let (mut manager, info) = manager(Role::Peripheral);
        let preq = [0x01, 0x03, 0x00, 0x81, 0x10, 0x00, 0x00];
        manager
            .handle_event(SmEvent::PduReceived {
                conn: info.handle,
                data: preq.to_vec(),
            })
            .unwrap();
        let sent = manager.transport_mut().drain();
        let [LinkOutput::Pdu { data: response, .. }] = sent.as_slice() else {
            panic!("expected a pairing response, got {:?}", sent);
        };
        let mut pres = [0u8; 7];
        pres.copy_from_slice(response);

        // the remote Central computes Mconfirm over the octets it sent
        let mrand = 0x0F0E_0D0C_0B0A_0908_0706_0504_0302_0100;
        let mconfirm = c1(
            0,
            mrand,
            &preq,
            &pres,
            info.peer.addr_type.into(),
            &info.peer.bdaddr,
            info.local.addr_type.into(),
            &info.local.bdaddr,
        );
        manager
            .handle_event(SmEvent::PduReceived {
                conn: info.handle,
                data: SmpPdu::PairingConfirm(mconfirm).serialize(),
            })
            .unwrap();
        let notifications = manager
            .handle_event(SmEvent::PduReceived {
                conn: info.handle,
                data: SmpPdu::PairingRandom(mrand).serialize(),
            })
            .unwrap();

        assert!(!notifications
            .iter()
            .any(|n| matches!(n, SmNotification::PairingFailed { .. })));
        let sent = manager.transport_mut().drain();
        assert!(matches!(
            sent.last(),
            Some(LinkOutput::Pdu { data, .. }) if data[0] == crate::smp::constants::SMP_PAIRING_RANDOM
        ));
    }

    fn occupant() -> Address {
        Address::public([0xAA, 0, 0, 0, 0, 0x22])
    }

    /// Peripheral manager whose store is full and defers overflowing commits
    fn deferring_peripheral() -> SecurityManager<LoopbackTransport, MemoryBondStore, ChaCha12Rng> {
        let mut store = MemoryBondStore::with_capacity(1);
        store.set_overflow_policy(OverflowPolicy::Defer);
        store
            .write(BondRecord {
                peer: occupant(),
                local: KeySet::default(),
                peer_keys: KeySet::default(),
                authenticated: false,
                secure_connections: false,
                key_size: 16,
            })
            .unwrap();
        SecurityManager::with_rng(
            SecurityConfig::default(),
            LoopbackTransport::default(),
            store,
            ChaCha12Rng::seed_from_u64(11),
        )
        .unwrap()
    }

    fn peripheral_link(handle: ConnHandle, peer: Address) -> ConnectionInfo {
        ConnectionInfo {
            handle,
            role: Role::Peripheral,
            local: Address::public([1, 1, 1, 1, 1, 1]),
            peer,
        }
    }

    /// Play a remote Central through LE Legacy Just Works that hands over
    /// its identity once the link is encrypted
    fn pair_with_remote_central(
        manager: &mut SecurityManager<LoopbackTransport, MemoryBondStore, ChaCha12Rng>,
        info: ConnectionInfo,
        identity: Address,
    ) -> Vec<SmNotification> {
        use crate::smp::constants::*;
        use crate::smp::crypto::c1;

        let conn = info.handle;
        let preq = [
            SMP_PAIRING_REQUEST,
            0x03, // NoInputNoOutput
            0x00,
            SMP_AUTH_REQ_BONDING,
            16,
            SMP_KEY_DIST_ID_KEY,
            0x00,
        ];
        let mut notifications = manager
            .handle_event(SmEvent::PduReceived {
                conn,
                data: preq.to_vec(),
            })
            .unwrap();
        let pres = match manager.transport_mut().drain().as_slice() {
            [LinkOutput::Pdu { data, .. }] => {
                let mut pres = [0u8; 7];
                pres.copy_from_slice(data);
                pres
            }
            other => panic!("expected a pairing response, got {:?}", other),
        };

        let mrand = 0x5555_AAAA_5555_AAAA_0123_4567_89AB_CDEF;
        let mconfirm = c1(
            0,
            mrand,
            &preq,
            &pres,
            info.peer.addr_type.into(),
            &info.peer.bdaddr,
            info.local.addr_type.into(),
            &info.local.bdaddr,
        );
        let events = [
            SmEvent::PduReceived {
                conn,
                data: SmpPdu::PairingConfirm(mconfirm).serialize(),
            },
            SmEvent::PduReceived {
                conn,
                data: SmpPdu::PairingRandom(mrand).serialize(),
            },
            SmEvent::LtkRequest {
                conn,
                ediv: 0,
                rand: 0,
            },
            SmEvent::EncryptionChanged {
                conn,
                status: 0,
                enabled: true,
                key_size: Some(16),
            },
            SmEvent::PduReceived {
                conn,
                data: SmpPdu::IdentityInformation(0x1234).serialize(),
            },
            SmEvent::PduReceived {
                conn,
                data: SmpPdu::IdentityAddressInformation(identity).serialize(),
            },
        ];
        for event in events {
            notifications.extend(manager.handle_event(event).unwrap());
        }
        manager.transport_mut().drain();
        notifications
    }

    fn completions(notifications: &[SmNotification]) -> Vec<ConnHandle> {
        notifications
            .iter()
            .filter_map(|notification| match notification {
                SmNotification::PairingComplete { conn, .. } => Some(*conn),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_commits_for_one_identity_are_serialized() {
        let identity = Address::public([0x33, 0, 0, 0, 0, 0x44]);
        let first = peripheral_link(0x40, Address::public([2, 2, 2, 2, 2, 2]));
        let second = peripheral_link(0x41, Address::public([3, 3, 3, 3, 3, 3]));
        let mut manager = deferring_peripheral();
        manager.connect(first);
        manager.connect(second);

        let notifications = pair_with_remote_central(&mut manager, first, identity);
        assert!(completions(&notifications).is_empty());
        assert_eq!(manager.store().capacity_events(), 1);

        // Queued behind the first commit without asking the store again
        let notifications = pair_with_remote_central(&mut manager, second, identity);
        assert!(completions(&notifications).is_empty());
        assert_eq!(manager.store().capacity_events(), 1);
        assert_eq!(
            manager.session_state(second.handle),
            Some(PairingState::KeyDistribution)
        );

        manager.store_mut().delete(&occupant()).unwrap();
        let notifications = manager.handle_event(SmEvent::StoreRoomMade).unwrap();
        assert_eq!(completions(&notifications), vec![first.handle, second.handle]);
        assert!(manager.store().read(&identity).is_some());
        assert_eq!(manager.next_deadline(), None);
    }

    #[test]
    fn test_queued_commit_resumes_when_blocking_link_drops() {
        let identity = Address::public([0x33, 0, 0, 0, 0, 0x44]);
        let first = peripheral_link(0x40, Address::public([2, 2, 2, 2, 2, 2]));
        let second = peripheral_link(0x41, Address::public([3, 3, 3, 3, 3, 3]));
        let mut manager = deferring_peripheral();
        manager.connect(first);
        manager.connect(second);
        pair_with_remote_central(&mut manager, first, identity);
        pair_with_remote_central(&mut manager, second, identity);

        // Room is made but nobody signals it; the blocking link then drops
        manager.store_mut().delete(&occupant()).unwrap();
        let notifications = manager
            .handle_event(SmEvent::ConnectionLost {
                conn: first.handle,
                reason: 0x13,
            })
            .unwrap();

        assert!(matches!(
            notifications.as_slice(),
            [
                SmNotification::PairingFailed { conn: 0x40, error: SmpError::ConnectionLost },
                SmNotification::PairingComplete { conn: 0x41, outcome },
            ] if outcome.bonded && outcome.peer_identity == Some(identity)
        ));
        assert!(manager.store().read(&identity).is_some());
        assert_eq!(manager.store().capacity_events(), 1);
        assert_eq!(
            manager.session_state(second.handle),
            Some(PairingState::Complete)
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = SecurityConfig {
            keypress: true,
            ..SecurityConfig::default()
        };
        assert!(SecurityManager::with_rng(
            config,
            LoopbackTransport::default(),
            MemoryBondStore::new(),
            ChaCha12Rng::seed_from_u64(1),
        )
        .is_err());
    }
}
