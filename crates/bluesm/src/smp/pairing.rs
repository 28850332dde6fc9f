//! Pairing implementation for the Security Manager Protocol
//!
//! A [`PairingSession`] is the per-connection state machine. It feeds the
//! Pairing Request/Response exchange into the policy evaluator, drives the
//! selected key agreement engine, waits for the controller to report
//! encryption, runs key distribution and finally proposes one bond record
//! to the store.

use super::agreement::{Action, Agreement, AgreementContext, OobMaterial};
use super::config::SecurityConfig;
use super::distribution::KeyDistributor;
use super::events::{ConnectionInfo, PairingOutcome, SmNotification, Transport};
use super::keys::*;
use super::pdu::{PairingFeatures, SmpPdu};
use super::policy::{self, Negotiation};
use super::throttle::AttemptThrottle;
use super::types::*;
use crate::gap::Address;
use log::{debug, info, warn};
use rand::{CryptoRng, RngCore};
use std::time::Instant;
use zeroize::Zeroize;

/// Everything a session needs from its owner while handling one event
pub struct SessionContext<'a, T, S, R> {
    pub transport: &'a mut T,
    pub store: &'a mut S,
    pub rng: &'a mut R,
    pub throttle: &'a mut AttemptThrottle,
    pub identity: &'a LocalIdentity,
    pub notifications: &'a mut Vec<SmNotification>,
    /// Identities with a bond commit already waiting for store room
    pub blocked_identities: &'a [Address],
    pub now: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Responder waiting for a Pairing Request
    AwaitRequest,
    /// Initiator waiting for the Pairing Response
    AwaitResponse,
    Agreement,
    EncryptionPending,
    Distribution,
    /// Keys are complete but the store had no room
    AwaitStoreRoom,
    Complete,
    Failed,
}

/// One pairing attempt on one connection
pub struct PairingSession {
    info: ConnectionInfo,
    role: PairingRole,
    config: SecurityConfig,
    step: Step,
    deadline: Option<Instant>,
    request: Option<PairingFeatures>,
    response: Option<PairingFeatures>,
    negotiation: Option<Negotiation>,
    oob: Option<OobMaterial>,
    agreement: Option<Agreement>,
    session_key: Option<u128>,
    distributor: Option<KeyDistributor>,
    pending_record: Option<BondRecord>,
}

impl PairingSession {
    /// Create a session; the configuration is fixed for its lifetime
    pub fn new(info: ConnectionInfo, config: SecurityConfig, oob: OobMaterial, now: Instant) -> Self {
        let role = info.pairing_role();
        let step = match role {
            PairingRole::Initiator => Step::AwaitResponse,
            PairingRole::Responder => Step::AwaitRequest,
        };
        let deadline = Some(now + config.pairing_timeout());
        Self {
            info,
            role,
            config,
            step,
            deadline,
            request: None,
            response: None,
            negotiation: None,
            oob: Some(oob),
            agreement: None,
            session_key: None,
            distributor: None,
            pending_record: None,
        }
    }

    pub fn conn(&self) -> ConnHandle {
        self.info.handle
    }

    pub fn state(&self) -> PairingState {
        match self.step {
            Step::AwaitRequest => PairingState::Idle,
            Step::AwaitResponse => {
                if self.request.is_some() {
                    PairingState::RequestExchanged
                } else {
                    PairingState::Idle
                }
            }
            Step::Agreement => self
                .agreement
                .as_ref()
                .map_or(PairingState::RequestExchanged, |agreement| agreement.state()),
            Step::EncryptionPending => PairingState::EncryptionPending,
            Step::Distribution | Step::AwaitStoreRoom => PairingState::KeyDistribution,
            Step::Complete => PairingState::Complete,
            Step::Failed => PairingState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn negotiation(&self) -> Option<&Negotiation> {
        self.negotiation.as_ref()
    }

    pub fn awaiting_store_room(&self) -> bool {
        self.step == Step::AwaitStoreRoom
    }

    /// Identity of the bond waiting for store room
    pub fn pending_identity(&self) -> Option<Address> {
        self.pending_record.as_ref().map(|record| record.peer)
    }

    /// Whether the responder is waiting for the controller to ask for the key
    pub fn awaits_ltk_request(&self) -> bool {
        self.step == Step::EncryptionPending && self.role == PairingRole::Responder
    }

    /// Whether ephemeral or session key material is still held
    pub fn holds_secrets(&self) -> bool {
        self.session_key.is_some()
            || self
                .agreement
                .as_ref()
                .map_or(false, |agreement| agreement.holds_secrets())
    }

    /// Security of the link once encrypted with the key of this session
    pub fn link_security(&self, key_size: Option<u8>) -> Option<LinkSecurity> {
        let requirement = &self.negotiation.as_ref()?.requirement;
        Some(LinkSecurity {
            encrypted: true,
            authenticated: requirement.mitm,
            secure_connections: requirement.secure_connections,
            bonded: false,
            key_size: key_size.unwrap_or(requirement.key_size),
        })
    }

    /// Send the Pairing Request (initiator only)
    pub fn initiate<T, S, R>(&mut self, ctx: &mut SessionContext<'_, T, S, R>) -> SmpResult<()>
    where
        T: Transport,
        S: BondStore,
        R: RngCore + CryptoRng,
    {
        if self.role != PairingRole::Initiator || self.request.is_some() {
            return Err(SmpError::InvalidState("pairing already started"));
        }
        let request = policy::build_request(&self.config);
        self.request = Some(request);
        info!(
            "Starting pairing on connection 0x{:04X} with {}",
            self.info.handle, self.info.peer
        );
        let result = self.send(&SmpPdu::PairingRequest(request), ctx);
        self.settle(result, ctx)
    }

    pub fn on_pdu<T, S, R>(
        &mut self,
        pdu: SmpPdu,
        ctx: &mut SessionContext<'_, T, S, R>,
    ) -> SmpResult<()>
    where
        T: Transport,
        S: BondStore,
        R: RngCore + CryptoRng,
    {
        if self.is_terminal() {
            return Err(SmpError::InvalidState("pairing session has ended"));
        }
        debug!(
            "Connection 0x{:04X}: received {} in {:?}",
            self.info.handle,
            pdu.name(),
            self.state()
        );
        let result = self.process_pdu(pdu, ctx);
        self.settle(result, ctx)
    }

    fn process_pdu<T, S, R>(
        &mut self,
        pdu: SmpPdu,
        ctx: &mut SessionContext<'_, T, S, R>,
    ) -> SmpResult<()>
    where
        T: Transport,
        S: BondStore,
        R: RngCore + CryptoRng,
    {
        match (&pdu, self.step) {
            (SmpPdu::PairingFailed(reason), _) => Err(SmpError::Remote(*reason)),
            (SmpPdu::SecurityRequest(_), _) if self.role == PairingRole::Initiator => {
                debug!("Ignoring Security Request during pairing");
                Ok(())
            }
            (SmpPdu::PairingRequest(request), Step::AwaitRequest) => {
                self.on_request(*request, ctx)
            }
            (SmpPdu::PairingResponse(response), Step::AwaitResponse)
                if self.request.is_some() =>
            {
                self.on_response(*response, ctx)
            }
            (_, Step::Agreement) => {
                let actions = self
                    .agreement
                    .as_mut()
                    .ok_or(SmpError::InvalidState("no key agreement running"))?
                    .on_pdu(&pdu, ctx.rng)?;
                self.apply(actions, ctx)
            }
            (_, Step::Distribution) => {
                let distributor = self
                    .distributor
                    .as_mut()
                    .ok_or(SmpError::InvalidState("no key distribution running"))?;
                let replies = distributor.on_pdu(&pdu, ctx.identity, self.info.local, ctx.rng)?;
                let complete = distributor.is_complete();
                for reply in &replies {
                    self.send(reply, ctx)?;
                }
                if complete {
                    self.commit(ctx)?;
                }
                Ok(())
            }
            _ => Err(SmpError::UnexpectedPdu {
                opcode: pdu.opcode(),
                state: self.state(),
            }),
        }
    }

    fn on_request<T, S, R>(
        &mut self,
        request: PairingFeatures,
        ctx: &mut SessionContext<'_, T, S, R>,
    ) -> SmpResult<()>
    where
        T: Transport,
        S: BondStore,
        R: RngCore + CryptoRng,
    {
        info!(
            "Pairing requested on connection 0x{:04X} by {}",
            self.info.handle, self.info.peer
        );
        let response = policy::build_response(&self.config, &request);
        self.request = Some(request);
        self.response = Some(response);
        let negotiation = policy::evaluate(&self.config, self.role, &request, &response)?;
        self.negotiation = Some(negotiation);
        self.send(&SmpPdu::PairingResponse(response), ctx)?;
        self.begin_agreement(ctx)
    }

    fn on_response<T, S, R>(
        &mut self,
        response: PairingFeatures,
        ctx: &mut SessionContext<'_, T, S, R>,
    ) -> SmpResult<()>
    where
        T: Transport,
        S: BondStore,
        R: RngCore + CryptoRng,
    {
        let request = self
            .request
            .ok_or(SmpError::InvalidState("response before request"))?;
        policy::validate_response(&request, &response)?;
        self.response = Some(response);
        let negotiation = policy::evaluate(&self.config, self.role, &request, &response)?;
        self.negotiation = Some(negotiation);
        self.begin_agreement(ctx)
    }

    fn begin_agreement<T, S, R>(&mut self, ctx: &mut SessionContext<'_, T, S, R>) -> SmpResult<()>
    where
        T: Transport,
        S: BondStore,
        R: RngCore + CryptoRng,
    {
        let (Some(negotiation), Some(request), Some(response)) =
            (self.negotiation, self.request, self.response)
        else {
            return Err(SmpError::InvalidState("negotiation incomplete"));
        };
        let (initiator, responder) = self.info.pairing_addresses();
        debug!(
            "Connection 0x{:04X}: {} selected, key size {}",
            self.info.handle, negotiation.method, negotiation.requirement.key_size
        );

        let context = AgreementContext {
            role: self.role,
            method: negotiation.method,
            passkey_role: negotiation.passkey_role,
            request,
            response,
            initiator,
            responder,
            key_size: negotiation.requirement.key_size,
        };
        let oob = self.oob.take().unwrap_or_default();
        let mut agreement = Agreement::new(context, oob, ctx.rng)?;
        let actions = agreement.start(ctx.rng)?;
        self.agreement = Some(agreement);
        self.step = Step::Agreement;
        self.apply(actions, ctx)
    }

    /// User typed a passkey, or gave up (`None`)
    pub fn on_passkey<T, S, R>(
        &mut self,
        passkey: Option<u32>,
        ctx: &mut SessionContext<'_, T, S, R>,
    ) -> SmpResult<()>
    where
        T: Transport,
        S: BondStore,
        R: RngCore + CryptoRng,
    {
        let actions = match self.agreement.as_mut() {
            Some(agreement) if self.step == Step::Agreement => {
                agreement.on_passkey(passkey, ctx.rng)
            }
            _ => return Err(SmpError::InvalidState("no passkey requested")),
        };
        let result = match actions {
            Ok(actions) => self.apply(actions, ctx),
            Err(error) => Err(error),
        };
        self.settle(result, ctx)
    }

    pub fn on_numeric_comparison<T, S, R>(
        &mut self,
        accept: bool,
        ctx: &mut SessionContext<'_, T, S, R>,
    ) -> SmpResult<()>
    where
        T: Transport,
        S: BondStore,
        R: RngCore + CryptoRng,
    {
        let actions = match self.agreement.as_mut() {
            Some(agreement) if self.step == Step::Agreement => {
                agreement.on_numeric_comparison(accept)
            }
            _ => return Err(SmpError::InvalidState("no numeric comparison pending")),
        };
        let result = match actions {
            Ok(actions) => self.apply(actions, ctx),
            Err(error) => Err(error),
        };
        self.settle(result, ctx)
    }

    fn apply<T, S, R>(
        &mut self,
        actions: Vec<Action>,
        ctx: &mut SessionContext<'_, T, S, R>,
    ) -> SmpResult<()>
    where
        T: Transport,
        S: BondStore,
        R: RngCore + CryptoRng,
    {
        let conn = self.info.handle;
        for action in actions {
            match action {
                Action::Send(pdu) => self.send(&pdu, ctx)?,
                Action::DisplayPasskey(passkey) => ctx
                    .notifications
                    .push(SmNotification::PasskeyDisplay { conn, passkey }),
                Action::RequestPasskey => ctx
                    .notifications
                    .push(SmNotification::PasskeyRequest { conn }),
                Action::ConfirmNumeric(value) => ctx
                    .notifications
                    .push(SmNotification::NumericComparison { conn, value }),
                Action::Agreed(key) => self.finish_agreement(key, ctx)?,
            }
        }
        Ok(())
    }

    fn finish_agreement<T, S, R>(
        &mut self,
        key: u128,
        ctx: &mut SessionContext<'_, T, S, R>,
    ) -> SmpResult<()>
    where
        T: Transport,
        S: BondStore,
        R: RngCore + CryptoRng,
    {
        self.erase_agreement();
        self.session_key = Some(key);
        self.step = Step::EncryptionPending;
        debug!(
            "Connection 0x{:04X}: key agreed, waiting for encryption",
            self.info.handle
        );
        if self.role == PairingRole::Initiator {
            ctx.transport.start_encryption(self.info.handle, key, 0, 0)?;
        }
        Ok(())
    }

    /// Answer the controller's LTK request with the agreed key
    pub fn on_ltk_request<T, S, R>(&mut self, ctx: &mut SessionContext<'_, T, S, R>) -> SmpResult<()>
    where
        T: Transport,
        S: BondStore,
        R: RngCore + CryptoRng,
    {
        if !self.awaits_ltk_request() {
            return Err(SmpError::InvalidState("no key agreed"));
        }
        let result = match self.session_key {
            Some(key) => ctx
                .transport
                .ltk_reply(self.info.handle, Some(key))
                .map_err(SmpError::from),
            None => Err(SmpError::InvalidState("no key agreed")),
        };
        self.settle(result, ctx)
    }

    pub fn on_encryption_changed<T, S, R>(
        &mut self,
        status: u8,
        enabled: bool,
        ctx: &mut SessionContext<'_, T, S, R>,
    ) -> SmpResult<()>
    where
        T: Transport,
        S: BondStore,
        R: RngCore + CryptoRng,
    {
        let result = match self.step {
            Step::EncryptionPending if status == 0 && enabled => self.begin_distribution(ctx),
            Step::EncryptionPending | Step::Distribution if status != 0 || !enabled => {
                Err(SmpError::EncryptionFailed(status))
            }
            _ => Ok(()),
        };
        self.settle(result, ctx)
    }

    fn begin_distribution<T, S, R>(
        &mut self,
        ctx: &mut SessionContext<'_, T, S, R>,
    ) -> SmpResult<()>
    where
        T: Transport,
        S: BondStore,
        R: RngCore + CryptoRng,
    {
        let requirement = self
            .negotiation
            .as_ref()
            .map(|negotiation| negotiation.requirement)
            .ok_or(SmpError::InvalidState("negotiation incomplete"))?;
        let mut distributor = KeyDistributor::new(&requirement, self.role);
        let pdus = distributor.start(ctx.identity, self.info.local, ctx.rng);
        let complete = distributor.is_complete();
        self.distributor = Some(distributor);
        self.step = Step::Distribution;
        for pdu in &pdus {
            self.send(pdu, ctx)?;
        }
        if complete {
            self.commit(ctx)?;
        }
        Ok(())
    }

    /// Propose the collected keys to the store as one record
    fn commit<T, S, R>(&mut self, ctx: &mut SessionContext<'_, T, S, R>) -> SmpResult<()>
    where
        T: Transport,
        S: BondStore,
        R: RngCore + CryptoRng,
    {
        let (mut local, mut peer_keys) = self
            .distributor
            .take()
            .ok_or(SmpError::InvalidState("no key distribution running"))?
            .take_keys();
        let requirement = self
            .negotiation
            .as_ref()
            .map(|negotiation| negotiation.requirement)
            .ok_or(SmpError::InvalidState("negotiation incomplete"))?;

        if !requirement.bonding {
            self.complete(None, ctx);
            return Ok(());
        }

        if requirement.secure_connections {
            let key = self
                .session_key
                .ok_or(SmpError::InvalidState("no key agreed"))?;
            let ltk = LongTermKey {
                key,
                ediv: 0,
                rand: 0,
                key_size: requirement.key_size,
                secure_connections: true,
                authenticated: requirement.mitm,
            };
            local.ltk = Some(ltk.clone());
            peer_keys.ltk = Some(ltk);
        }

        let record = BondRecord {
            peer: peer_keys.identity.unwrap_or(self.info.peer),
            local,
            peer_keys,
            authenticated: requirement.mitm,
            secure_connections: requirement.secure_connections,
            key_size: requirement.key_size,
        };

        if ctx.blocked_identities.contains(&record.peer) {
            debug!(
                "Bond for {} queued behind a pending commit",
                record.peer
            );
            self.defer(record);
            return Ok(());
        }
        self.write_record(record, ctx)
    }

    fn defer(&mut self, record: BondRecord) {
        self.pending_record = Some(record);
        self.step = Step::AwaitStoreRoom;
        self.deadline = None;
    }

    fn write_record<T, S, R>(
        &mut self,
        record: BondRecord,
        ctx: &mut SessionContext<'_, T, S, R>,
    ) -> SmpResult<()>
    where
        T: Transport,
        S: BondStore,
        R: RngCore + CryptoRng,
    {
        let identity = record.peer;
        match ctx.store.write(record.clone()) {
            Ok(()) => {}
            Err(StoreError::CapacityExceeded) => {
                let context = CapacityContext {
                    conn: self.info.handle,
                    peer: identity,
                };
                match ctx.store.on_capacity_exceeded(&context) {
                    CapacityDecision::Retry => ctx.store.write(record.clone())?,
                    CapacityDecision::Deferred => {
                        info!("Bond store full, waiting for room to store {}", identity);
                        self.defer(record);
                        return Ok(());
                    }
                    CapacityDecision::Abandon => {
                        return Err(SmpError::Store(StoreError::CapacityExceeded))
                    }
                }
            }
            Err(error) => return Err(error.into()),
        }
        self.complete(Some(&record), ctx);
        Ok(())
    }

    /// Retry a deferred commit after the application made room
    pub fn on_store_room_made<T, S, R>(
        &mut self,
        ctx: &mut SessionContext<'_, T, S, R>,
    ) -> SmpResult<()>
    where
        T: Transport,
        S: BondStore,
        R: RngCore + CryptoRng,
    {
        let result = match self.pending_record.take() {
            Some(record) if self.step == Step::AwaitStoreRoom => self.write_record(record, ctx),
            _ => Err(SmpError::InvalidState("no commit pending")),
        };
        match result {
            Err(error) if error.category() != ErrorCategory::Local => {
                self.fail(error, ctx);
                Ok(())
            }
            other => other,
        }
    }

    /// Report success; `bond` is the record now held by the store
    fn complete<T, S, R>(
        &mut self,
        bond: Option<&BondRecord>,
        ctx: &mut SessionContext<'_, T, S, R>,
    ) where
        T: Transport,
        S: BondStore,
        R: RngCore + CryptoRng,
    {
        let Some(negotiation) = self.negotiation else {
            return;
        };
        self.session_key.zeroize();
        self.step = Step::Complete;
        self.deadline = None;
        ctx.throttle.clear(&self.info.peer);
        info!(
            "Pairing on connection 0x{:04X} complete: {}{}",
            self.info.handle,
            negotiation.method,
            if bond.is_some() { ", bonded" } else { "" }
        );
        ctx.notifications.push(SmNotification::PairingComplete {
            conn: self.info.handle,
            outcome: PairingOutcome {
                method: negotiation.method,
                achieved: negotiation.requirement,
                bonded: bond.is_some(),
                peer_identity: bond.map(|record| record.peer),
                local_keys: bond.map_or(KeyDistribution::empty(), |record| {
                    record.local.distributed()
                }),
                peer_keys: bond.map_or(KeyDistribution::empty(), |record| {
                    record.peer_keys.distributed()
                }),
            },
        });
    }

    /// No response within the deadline
    pub fn on_timeout<T, S, R>(&mut self, ctx: &mut SessionContext<'_, T, S, R>)
    where
        T: Transport,
        S: BondStore,
        R: RngCore + CryptoRng,
    {
        self.fail(SmpError::Timeout, ctx);
    }

    /// End the session with a failure: erase secrets, tell the peer where
    /// the protocol asks for it, and notify the application once
    pub fn fail<T, S, R>(&mut self, error: SmpError, ctx: &mut SessionContext<'_, T, S, R>)
    where
        T: Transport,
        S: BondStore,
        R: RngCore + CryptoRng,
    {
        if self.is_terminal() {
            return;
        }
        self.erase_agreement();
        self.session_key.zeroize();
        self.distributor = None;
        self.pending_record = None;
        self.oob = None;
        self.step = Step::Failed;
        self.deadline = None;

        if let Some(reason) = error.peer_reason() {
            let pdu = SmpPdu::PairingFailed(reason).serialize();
            if let Err(e) = ctx.transport.send_pdu(self.info.handle, &pdu) {
                warn!("Failed to send Pairing Failed: {}", e);
            }
        }
        if error.is_failed_attempt() {
            ctx.throttle.record_failure(self.info.peer, ctx.now);
        }

        warn!(
            "Pairing on connection 0x{:04X} failed: {}",
            self.info.handle, error
        );
        ctx.notifications.push(SmNotification::PairingFailed {
            conn: self.info.handle,
            error,
        });
    }

    fn erase_agreement(&mut self) {
        if let Some(mut agreement) = self.agreement.take() {
            agreement.erase();
        }
    }

    fn send<T, S, R>(&mut self, pdu: &SmpPdu, ctx: &mut SessionContext<'_, T, S, R>) -> SmpResult<()>
    where
        T: Transport,
        S: BondStore,
        R: RngCore + CryptoRng,
    {
        debug!("Connection 0x{:04X}: sending {}", self.info.handle, pdu.name());
        ctx.transport.send_pdu(self.info.handle, &pdu.serialize())?;
        Ok(())
    }

    /// Turn an internal result into session progress or a terminal failure
    fn settle<T, S, R>(
        &mut self,
        result: SmpResult<()>,
        ctx: &mut SessionContext<'_, T, S, R>,
    ) -> SmpResult<()>
    where
        T: Transport,
        S: BondStore,
        R: RngCore + CryptoRng,
    {
        match result {
            Ok(()) => {
                if !self.is_terminal() && self.step != Step::AwaitStoreRoom {
                    self.deadline = Some(ctx.now + self.config.pairing_timeout());
                }
                Ok(())
            }
            Err(error) if error.category() == ErrorCategory::Local => Err(error),
            Err(error) => {
                self.fail(error, ctx);
                Ok(())
            }
        }
    }
}

impl Drop for PairingSession {
    fn drop(&mut self) {
        self.erase_agreement();
        self.session_key.zeroize();
    }
}
