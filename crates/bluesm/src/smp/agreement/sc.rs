//! LE Secure Connections pairing
//!
//! Public key exchange, then the authentication stage of the selected
//! association model, then f5 key generation and the f6 DHKey checks.

use super::*;
use crate::smp::crypto::{
    f4, f5, f6, g2, generate_passkey, mask_key, random_u128, PublicKeyBytes,
};
use log::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    AwaitPublicKey,
    /// Waiting for the local user to type the passkey
    AwaitPasskey,
    AwaitConfirm,
    AwaitRandom,
    /// Waiting for the user to accept the numeric comparison value
    AwaitUserConfirm,
    AwaitCheck,
    Done,
}

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ScAgreement {
    #[zeroize(skip)]
    ctx: AgreementContext,
    #[zeroize(skip)]
    step: Step,
    #[zeroize(skip)]
    rounds: u8,
    #[zeroize(skip)]
    key_pair: Option<EcdhKeyPair>,
    round: u8,
    local_public: PublicKeyBytes,
    peer_public: Option<PublicKeyBytes>,
    dh_key: Option<[u8; 32]>,
    passkey: Option<u32>,
    local_nonce: Option<u128>,
    peer_nonce: Option<u128>,
    peer_confirm: Option<u128>,
    local_oob: Option<ScOobData>,
    peer_oob: Option<ScOobData>,
    mac_key: Option<u128>,
    ltk: Option<u128>,
    /// Peer DHKey check received before the user answered
    pending_check: Option<u128>,
}

impl ScAgreement {
    pub fn new<R: RngCore + CryptoRng>(
        ctx: AgreementContext,
        oob: OobMaterial,
        rng: &mut R,
    ) -> SmpResult<Self> {
        let OobMaterial {
            sc_local, sc_peer, ..
        } = oob;
        let (key_pair, local_oob) = match sc_local {
            Some((key_pair, data)) => (key_pair, Some(data)),
            None => (EcdhKeyPair::generate(rng), None),
        };

        if ctx.method == PairingMethod::ScOob {
            let local_flag = if ctx.is_initiator() {
                ctx.request.oob_data_present
            } else {
                ctx.response.oob_data_present
            };
            // our flag says we hold the peer's data
            if local_flag && sc_peer.is_none() {
                return Err(SmpError::OobNotAvailable);
            }
        }

        let rounds = if ctx.method == PairingMethod::ScPasskeyEntry {
            SMP_PASSKEY_ROUNDS
        } else {
            1
        };

        Ok(Self {
            ctx,
            step: Step::AwaitPublicKey,
            rounds,
            local_public: *key_pair.public_key(),
            key_pair: Some(key_pair),
            round: 0,
            peer_public: None,
            dh_key: None,
            passkey: None,
            local_nonce: None,
            peer_nonce: None,
            peer_confirm: None,
            local_oob,
            peer_oob: sc_peer,
            mac_key: None,
            ltk: None,
            pending_check: None,
        })
    }

    pub fn state(&self) -> PairingState {
        match self.step {
            Step::AwaitPublicKey => PairingState::ScPublicKeyExchange,
            _ => PairingState::ScConfirm { round: self.round },
        }
    }

    pub fn erase(&mut self) {
        self.zeroize();
        self.key_pair = None;
        self.peer_public = None;
        self.dh_key = None;
        self.passkey = None;
        self.local_nonce = None;
        self.peer_nonce = None;
        self.peer_confirm = None;
        self.local_oob = None;
        self.peer_oob = None;
        self.mac_key = None;
        self.ltk = None;
        self.pending_check = None;
        self.step = Step::Done;
    }

    pub fn holds_secrets(&self) -> bool {
        self.key_pair.is_some()
            || self.dh_key.is_some()
            || self.passkey.is_some()
            || self.local_nonce.is_some()
            || self.peer_nonce.is_some()
            || self.local_oob.is_some()
            || self.peer_oob.is_some()
            || self.mac_key.is_some()
            || self.ltk.is_some()
    }

    pub fn start<R: RngCore + CryptoRng>(&mut self, _rng: &mut R) -> SmpResult<Vec<Action>> {
        if self.ctx.is_initiator() {
            return Ok(vec![Action::Send(SmpPdu::PairingPublicKey(self.local_public))]);
        }
        Ok(Vec::new())
    }

    pub fn on_pdu<R: RngCore + CryptoRng>(
        &mut self,
        pdu: &SmpPdu,
        rng: &mut R,
    ) -> SmpResult<Vec<Action>> {
        match (pdu, self.step) {
            (SmpPdu::PairingPublicKey(key), Step::AwaitPublicKey) => self.on_public_key(key, rng),
            (SmpPdu::PairingConfirm(confirm), Step::AwaitConfirm) => {
                self.on_confirm(*confirm, rng)
            }
            (SmpPdu::PairingRandom(random), Step::AwaitRandom) => self.on_random(*random, rng),
            (SmpPdu::PairingDhKeyCheck(check), Step::AwaitCheck) => self.on_check(*check),
            (SmpPdu::PairingDhKeyCheck(check), Step::AwaitUserConfirm)
                if !self.ctx.is_initiator() && self.pending_check.is_none() =>
            {
                debug!("DHKey check buffered until the user confirms");
                self.pending_check = Some(*check);
                Ok(Vec::new())
            }
            _ => Err(unexpected(pdu, self.state())),
        }
    }

    pub fn on_passkey<R: RngCore + CryptoRng>(
        &mut self,
        passkey: u32,
        rng: &mut R,
    ) -> SmpResult<Vec<Action>> {
        if self.ctx.method != PairingMethod::ScPasskeyEntry
            || self.passkey.is_some()
            || self.step == Step::AwaitPublicKey
        {
            return Err(SmpError::InvalidState("no passkey requested"));
        }
        self.passkey = Some(passkey);

        if self.ctx.is_initiator() {
            return Ok(self.send_passkey_confirm(rng));
        }
        if self.peer_confirm.is_some() {
            return Ok(self.send_passkey_confirm(rng));
        }
        Ok(Vec::new())
    }

    pub fn on_numeric_comparison(&mut self, accept: bool) -> SmpResult<Vec<Action>> {
        if self.step != Step::AwaitUserConfirm {
            return Err(SmpError::InvalidState("no numeric comparison pending"));
        }
        if !accept {
            return Err(SmpError::NumericComparisonFailed);
        }

        self.step = Step::AwaitCheck;
        if self.ctx.is_initiator() {
            return Ok(vec![Action::Send(SmpPdu::PairingDhKeyCheck(self.local_check()?))]);
        }
        match self.pending_check.take() {
            Some(check) => self.on_check(check),
            None => Ok(Vec::new()),
        }
    }

    fn local_x(&self) -> [u8; 32] {
        self.local_public.x_be()
    }

    fn peer_x(&self) -> SmpResult<[u8; 32]> {
        self.peer_public
            .map(|key| key.x_be())
            .ok_or(SmpError::InvalidState("peer public key missing"))
    }

    fn on_public_key<R: RngCore + CryptoRng>(
        &mut self,
        key: &PublicKeyBytes,
        rng: &mut R,
    ) -> SmpResult<Vec<Action>> {
        let key_pair = self
            .key_pair
            .as_ref()
            .ok_or(SmpError::InvalidState("key pair already consumed"))?;
        let dh_key = key_pair.diffie_hellman(key)?;
        self.dh_key = Some(*dh_key);
        self.peer_public = Some(*key);
        // the private key is not needed past this point
        self.key_pair = None;

        let mut actions = Vec::new();
        if !self.ctx.is_initiator() {
            actions.push(Action::Send(SmpPdu::PairingPublicKey(self.local_public)));
        }

        match self.ctx.method {
            PairingMethod::ScJustWorks | PairingMethod::ScNumericComparison => {
                if self.ctx.is_initiator() {
                    self.step = Step::AwaitConfirm;
                } else {
                    let nonce = random_u128(rng);
                    let confirm = f4(&self.local_x(), &self.peer_x()?, nonce, 0);
                    self.local_nonce = Some(nonce);
                    self.step = Step::AwaitRandom;
                    actions.push(Action::Send(SmpPdu::PairingConfirm(confirm)));
                }
            }
            PairingMethod::ScPasskeyEntry => {
                if self.ctx.local_inputs_passkey() {
                    actions.push(Action::RequestPasskey);
                    self.step = if self.ctx.is_initiator() {
                        Step::AwaitPasskey
                    } else {
                        Step::AwaitConfirm
                    };
                } else {
                    let passkey = generate_passkey(rng);
                    self.passkey = Some(passkey);
                    actions.push(Action::DisplayPasskey(passkey));
                    self.step = Step::AwaitConfirm;
                    if self.ctx.is_initiator() {
                        actions.extend(self.send_passkey_confirm(rng));
                    }
                }
            }
            PairingMethod::ScOob => {
                self.verify_peer_oob()?;
                if self.ctx.is_initiator() {
                    let nonce = random_u128(rng);
                    self.local_nonce = Some(nonce);
                    actions.push(Action::Send(SmpPdu::PairingRandom(nonce)));
                }
                self.step = Step::AwaitRandom;
            }
            _ => return Err(SmpError::InvalidState("not a Secure Connections method")),
        }
        Ok(actions)
    }

    fn verify_peer_oob(&self) -> SmpResult<()> {
        if let Some(oob) = &self.peer_oob {
            let peer_x = self.peer_x()?;
            if !values_match(f4(&peer_x, &peer_x, oob.r, 0), oob.c) {
                return Err(SmpError::ConfirmValueFailed);
            }
        }
        Ok(())
    }

    /// Commit to a fresh nonce and the current passkey bit
    fn send_passkey_confirm<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Vec<Action> {
        let (Some(passkey), Ok(peer_x)) = (self.passkey, self.peer_x()) else {
            return Vec::new();
        };
        let nonce = random_u128(rng);
        let confirm = f4(
            &self.local_x(),
            &peer_x,
            nonce,
            passkey_bit(passkey, self.round),
        );
        self.local_nonce = Some(nonce);
        self.step = if self.ctx.is_initiator() {
            Step::AwaitConfirm
        } else {
            Step::AwaitRandom
        };
        vec![Action::Send(SmpPdu::PairingConfirm(confirm))]
    }

    fn on_confirm<R: RngCore + CryptoRng>(
        &mut self,
        confirm: u128,
        rng: &mut R,
    ) -> SmpResult<Vec<Action>> {
        if self.peer_confirm.is_some() {
            return Err(SmpError::UnexpectedPdu {
                opcode: SMP_PAIRING_CONFIRM,
                state: self.state(),
            });
        }
        self.peer_confirm = Some(confirm);

        if self.ctx.is_initiator() {
            let nonce = match self.ctx.method {
                PairingMethod::ScPasskeyEntry => self
                    .local_nonce
                    .ok_or(SmpError::InvalidState("confirm before local commitment"))?,
                _ => {
                    let nonce = random_u128(rng);
                    self.local_nonce = Some(nonce);
                    nonce
                }
            };
            self.step = Step::AwaitRandom;
            return Ok(vec![Action::Send(SmpPdu::PairingRandom(nonce))]);
        }

        // only Passkey Entry has the initiator confirm first
        if self.ctx.method != PairingMethod::ScPasskeyEntry {
            return Err(SmpError::UnexpectedPdu {
                opcode: SMP_PAIRING_CONFIRM,
                state: self.state(),
            });
        }
        if self.passkey.is_none() {
            debug!("Pairing Confirm buffered until the passkey is entered");
            return Ok(Vec::new());
        }
        Ok(self.send_passkey_confirm(rng))
    }

    fn on_random<R: RngCore + CryptoRng>(
        &mut self,
        peer_nonce: u128,
        rng: &mut R,
    ) -> SmpResult<Vec<Action>> {
        let local_x = self.local_x();
        let peer_x = self.peer_x()?;
        self.peer_nonce = Some(peer_nonce);
        let mut actions = Vec::new();

        match self.ctx.method {
            PairingMethod::ScJustWorks | PairingMethod::ScNumericComparison => {
                if self.ctx.is_initiator() {
                    let peer_confirm = self
                        .peer_confirm
                        .take()
                        .ok_or(SmpError::InvalidState("random before confirm"))?;
                    if !values_match(f4(&peer_x, &local_x, peer_nonce, 0), peer_confirm) {
                        return Err(SmpError::ConfirmValueFailed);
                    }
                } else {
                    let nonce = self
                        .local_nonce
                        .ok_or(SmpError::InvalidState("random before local commitment"))?;
                    actions.push(Action::Send(SmpPdu::PairingRandom(nonce)));
                }

                self.generate_keys()?;
                if self.ctx.method == PairingMethod::ScNumericComparison {
                    let (na, nb) = self.nonces()?;
                    let (pka, pkb) = if self.ctx.is_initiator() {
                        (local_x, peer_x)
                    } else {
                        (peer_x, local_x)
                    };
                    self.step = Step::AwaitUserConfirm;
                    actions.push(Action::ConfirmNumeric(g2(&pka, &pkb, na, nb)));
                } else {
                    actions.extend(self.begin_check()?);
                }
            }
            PairingMethod::ScPasskeyEntry => {
                let passkey = self
                    .passkey
                    .ok_or(SmpError::InvalidState("random before passkey"))?;
                let peer_confirm = self
                    .peer_confirm
                    .take()
                    .ok_or(SmpError::InvalidState("random before confirm"))?;
                let z = passkey_bit(passkey, self.round);
                if !values_match(f4(&peer_x, &local_x, peer_nonce, z), peer_confirm) {
                    return Err(SmpError::ConfirmValueFailed);
                }
                if !self.ctx.is_initiator() {
                    let nonce = self
                        .local_nonce
                        .ok_or(SmpError::InvalidState("random before local commitment"))?;
                    actions.push(Action::Send(SmpPdu::PairingRandom(nonce)));
                }

                if self.round + 1 < self.rounds {
                    self.round += 1;
                    self.step = Step::AwaitConfirm;
                    if self.ctx.is_initiator() {
                        actions.extend(self.send_passkey_confirm(rng));
                    }
                } else {
                    self.generate_keys()?;
                    actions.extend(self.begin_check()?);
                }
            }
            PairingMethod::ScOob => {
                if !self.ctx.is_initiator() {
                    let nonce = random_u128(rng);
                    self.local_nonce = Some(nonce);
                    actions.push(Action::Send(SmpPdu::PairingRandom(nonce)));
                }
                self.generate_keys()?;
                actions.extend(self.begin_check()?);
            }
            _ => return Err(SmpError::InvalidState("not a Secure Connections method")),
        }
        Ok(actions)
    }

    /// (Na, Nb) of the final round
    fn nonces(&self) -> SmpResult<(u128, u128)> {
        match (self.local_nonce, self.peer_nonce) {
            (Some(local), Some(peer)) if self.ctx.is_initiator() => Ok((local, peer)),
            (Some(local), Some(peer)) => Ok((peer, local)),
            _ => Err(SmpError::InvalidState("nonces missing")),
        }
    }

    fn generate_keys(&mut self) -> SmpResult<()> {
        let dh_key = Zeroizing::new(
            self.dh_key
                .ok_or(SmpError::InvalidState("DHKey missing"))?,
        );
        let (na, nb) = self.nonces()?;
        let (mac_key, ltk) = f5(
            &dh_key,
            na,
            nb,
            &self.ctx.initiator.to_smp_bytes(),
            &self.ctx.responder.to_smp_bytes(),
        );
        self.mac_key = Some(mac_key);
        self.ltk = Some(ltk);
        // the shared secret is not needed past key generation
        self.dh_key.zeroize();
        Ok(())
    }

    /// The initiator sends its check first
    fn begin_check(&mut self) -> SmpResult<Vec<Action>> {
        self.step = Step::AwaitCheck;
        if self.ctx.is_initiator() {
            return Ok(vec![Action::Send(SmpPdu::PairingDhKeyCheck(self.local_check()?))]);
        }
        Ok(Vec::new())
    }

    fn addresses(&self) -> ([u8; 7], [u8; 7]) {
        let initiator = self.ctx.initiator.to_smp_bytes();
        let responder = self.ctx.responder.to_smp_bytes();
        if self.ctx.is_initiator() {
            (initiator, responder)
        } else {
            (responder, initiator)
        }
    }

    fn local_features(&self) -> &PairingFeatures {
        if self.ctx.is_initiator() {
            &self.ctx.request
        } else {
            &self.ctx.response
        }
    }

    /// r values of f6: (used in our check, used in the peer's check)
    fn check_randoms(&self) -> (u128, u128) {
        match self.ctx.method {
            PairingMethod::ScPasskeyEntry => {
                let passkey = self.passkey.unwrap_or_default() as u128;
                (passkey, passkey)
            }
            PairingMethod::ScOob => {
                let ours = self.peer_oob.map_or(0, |oob| oob.r);
                let theirs = if self.ctx.peer_features().oob_data_present {
                    self.local_oob.map_or(0, |oob| oob.r)
                } else {
                    0
                };
                (ours, theirs)
            }
            _ => (0, 0),
        }
    }

    fn local_check(&self) -> SmpResult<u128> {
        let mac_key = self
            .mac_key
            .ok_or(SmpError::InvalidState("MacKey missing"))?;
        let local = self
            .local_nonce
            .ok_or(SmpError::InvalidState("nonces missing"))?;
        let peer = self
            .peer_nonce
            .ok_or(SmpError::InvalidState("nonces missing"))?;
        let (local_addr, peer_addr) = self.addresses();
        let (r, _) = self.check_randoms();
        Ok(f6(
            mac_key,
            local,
            peer,
            r,
            &self.local_features().io_cap_bytes(),
            &local_addr,
            &peer_addr,
        ))
    }

    fn expected_peer_check(&self) -> SmpResult<u128> {
        let mac_key = self
            .mac_key
            .ok_or(SmpError::InvalidState("MacKey missing"))?;
        let local = self
            .local_nonce
            .ok_or(SmpError::InvalidState("nonces missing"))?;
        let peer = self
            .peer_nonce
            .ok_or(SmpError::InvalidState("nonces missing"))?;
        let (local_addr, peer_addr) = self.addresses();
        let (_, r) = self.check_randoms();
        Ok(f6(
            mac_key,
            peer,
            local,
            r,
            &self.ctx.peer_features().io_cap_bytes(),
            &peer_addr,
            &local_addr,
        ))
    }

    fn on_check(&mut self, check: u128) -> SmpResult<Vec<Action>> {
        if !values_match(self.expected_peer_check()?, check) {
            return Err(SmpError::DhKeyCheckFailed);
        }

        let mut actions = Vec::new();
        if !self.ctx.is_initiator() {
            actions.push(Action::Send(SmpPdu::PairingDhKeyCheck(self.local_check()?)));
        }
        let ltk = self.ltk.ok_or(SmpError::InvalidState("LTK missing"))?;
        self.step = Step::Done;
        debug!("Secure Connections key agreement complete ({})", self.ctx.method);
        actions.push(Action::Agreed(mask_key(ltk, self.ctx.key_size)));
        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smp::config::SecurityConfig;
    use crate::smp::policy;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    fn context(
        method: PairingMethod,
        passkey_role: Option<PasskeyRole>,
        initiator_oob: bool,
        responder_oob: bool,
    ) -> (AgreementContext, AgreementContext) {
        let config = SecurityConfig::default();
        let mut request = policy::build_request(&config);
        request.oob_data_present = initiator_oob;
        let mut response = policy::build_response(&config, &request);
        response.oob_data_present = responder_oob;
        let initiator = AgreementContext {
            role: PairingRole::Initiator,
            method,
            passkey_role,
            request,
            response,
            initiator: Address::public([0xCE, 0xBF, 0x37, 0x37, 0x12, 0x56]),
            responder: Address::public([0xC1, 0xCF, 0x2D, 0x70, 0x13, 0xA7]),
            key_size: 16,
        };
        let responder = AgreementContext {
            role: PairingRole::Responder,
            ..initiator
        };
        (initiator, responder)
    }

    #[derive(Default)]
    struct Outcome {
        initiator_key: Option<u128>,
        responder_key: Option<u128>,
        numeric: Vec<u32>,
        confirms: usize,
    }

    struct Harness {
        initiator: ScAgreement,
        responder: ScAgreement,
        accept_numeric: bool,
        /// Applied to PDUs sent by the initiator
        tamper: Option<fn(&mut SmpPdu)>,
    }

    impl Harness {
        fn engine(&mut self, initiator: bool) -> &mut ScAgreement {
            if initiator {
                &mut self.initiator
            } else {
                &mut self.responder
            }
        }

        /// Deliver actions until both sides are idle; passkey prompts are
        /// answered with the displayed value once nothing else is in flight
        fn run(&mut self, first: Vec<Action>, rng: &mut ChaCha12Rng) -> SmpResult<Outcome> {
            let mut queue: Vec<(bool, Action)> = first.into_iter().map(|x| (true, x)).collect();
            let mut outcome = Outcome::default();
            let mut displayed = None;
            let mut prompts = Vec::new();

            loop {
                if queue.is_empty() {
                    if prompts.is_empty() {
                        break;
                    }
                    let passkey = displayed.unwrap_or(123_456);
                    for side in std::mem::take(&mut prompts) {
                        let produced = self.engine(side).on_passkey(passkey, rng)?;
                        queue.extend(produced.into_iter().map(|x| (side, x)));
                    }
                    continue;
                }

                let (from_initiator, action) = queue.remove(0);
                match action {
                    Action::Send(mut pdu) => {
                        if let SmpPdu::PairingConfirm(_) = pdu {
                            outcome.confirms += 1;
                        }
                        if from_initiator {
                            if let Some(tamper) = self.tamper {
                                tamper(&mut pdu);
                            }
                        }
                        let produced = self.engine(!from_initiator).on_pdu(&pdu, rng)?;
                        queue.extend(produced.into_iter().map(|x| (!from_initiator, x)));
                    }
                    Action::DisplayPasskey(passkey) => displayed = Some(passkey),
                    Action::RequestPasskey => prompts.push(from_initiator),
                    Action::ConfirmNumeric(value) => {
                        outcome.numeric.push(value);
                        let accept = self.accept_numeric;
                        let produced = self.engine(from_initiator).on_numeric_comparison(accept)?;
                        queue.extend(produced.into_iter().map(|x| (from_initiator, x)));
                    }
                    Action::Agreed(key) => {
                        if from_initiator {
                            outcome.initiator_key = Some(key);
                        } else {
                            outcome.responder_key = Some(key);
                        }
                    }
                }
            }
            Ok(outcome)
        }
    }

    fn harness(
        method: PairingMethod,
        passkey_role: Option<PasskeyRole>,
        rng: &mut ChaCha12Rng,
    ) -> Harness {
        let (ic, rc) = context(method, passkey_role, false, false);
        Harness {
            initiator: ScAgreement::new(ic, OobMaterial::default(), rng).unwrap(),
            responder: ScAgreement::new(rc, OobMaterial::default(), rng).unwrap(),
            accept_numeric: true,
            tamper: None,
        }
    }

    fn start(harness: &mut Harness, rng: &mut ChaCha12Rng) -> SmpResult<Outcome> {
        assert!(harness.responder.start(rng)?.is_empty());
        let first = harness.initiator.start(rng)?;
        harness.run(first, rng)
    }

    #[test]
    fn test_just_works() {
        let mut rng = ChaCha12Rng::seed_from_u64(1);
        let mut h = harness(PairingMethod::ScJustWorks, None, &mut rng);
        let outcome = start(&mut h, &mut rng).unwrap();
        assert!(outcome.initiator_key.is_some());
        assert_eq!(outcome.initiator_key, outcome.responder_key);
        assert_eq!(outcome.confirms, 1);
        assert!(outcome.numeric.is_empty());
    }

    #[test]
    fn test_numeric_comparison_shows_same_value() {
        let mut rng = ChaCha12Rng::seed_from_u64(2);
        let mut h = harness(PairingMethod::ScNumericComparison, None, &mut rng);
        let outcome = start(&mut h, &mut rng).unwrap();
        assert_eq!(outcome.numeric.len(), 2);
        assert_eq!(outcome.numeric[0], outcome.numeric[1]);
        assert!(outcome.numeric[0] <= SMP_PASSKEY_MAX);
        assert!(outcome.initiator_key.is_some());
        assert_eq!(outcome.initiator_key, outcome.responder_key);
    }

    #[test]
    fn test_numeric_comparison_rejected() {
        let mut rng = ChaCha12Rng::seed_from_u64(3);
        let mut h = harness(PairingMethod::ScNumericComparison, None, &mut rng);
        h.accept_numeric = false;
        assert!(matches!(
            start(&mut h, &mut rng),
            Err(SmpError::NumericComparisonFailed)
        ));
    }

    #[test]
    fn test_passkey_entry_runs_twenty_rounds() {
        for role in [
            PasskeyRole::InitiatorInputs,
            PasskeyRole::ResponderInputs,
            PasskeyRole::BothInput,
        ] {
            let mut rng = ChaCha12Rng::seed_from_u64(4);
            let mut h = harness(PairingMethod::ScPasskeyEntry, Some(role), &mut rng);
            let outcome = start(&mut h, &mut rng).unwrap();
            assert_eq!(outcome.confirms, 2 * SMP_PASSKEY_ROUNDS as usize);
            assert!(outcome.initiator_key.is_some());
            assert_eq!(outcome.initiator_key, outcome.responder_key);
        }
    }

    fn flip_confirm(pdu: &mut SmpPdu) {
        if let SmpPdu::PairingConfirm(value) = pdu {
            *value ^= 0x10;
        }
    }

    fn flip_check(pdu: &mut SmpPdu) {
        if let SmpPdu::PairingDhKeyCheck(value) = pdu {
            *value ^= 1;
        }
    }

    #[test]
    fn test_corrupted_passkey_round_fails() {
        let mut rng = ChaCha12Rng::seed_from_u64(5);
        let mut h = harness(
            PairingMethod::ScPasskeyEntry,
            Some(PasskeyRole::InitiatorInputs),
            &mut rng,
        );
        h.tamper = Some(flip_confirm as fn(&mut SmpPdu));
        assert!(matches!(
            start(&mut h, &mut rng),
            Err(SmpError::ConfirmValueFailed)
        ));
    }

    #[test]
    fn test_corrupted_dhkey_check_fails() {
        let mut rng = ChaCha12Rng::seed_from_u64(6);
        let mut h = harness(PairingMethod::ScJustWorks, None, &mut rng);
        h.tamper = Some(flip_check as fn(&mut SmpPdu));
        assert!(matches!(
            start(&mut h, &mut rng),
            Err(SmpError::DhKeyCheckFailed)
        ));
    }

    #[test]
    fn test_invalid_public_keys_rejected() {
        let mut rng = ChaCha12Rng::seed_from_u64(7);
        let mut h = harness(PairingMethod::ScJustWorks, None, &mut rng);
        h.responder.start(&mut rng).unwrap();

        let identity = PublicKeyBytes {
            x: [0u8; 32],
            y: [0u8; 32],
        };
        assert!(matches!(
            h.responder
                .on_pdu(&SmpPdu::PairingPublicKey(identity), &mut rng),
            Err(SmpError::InvalidPublicKey)
        ));

        let mut off_curve = h.initiator.local_public;
        off_curve.y[0] ^= 1;
        assert!(matches!(
            h.responder
                .on_pdu(&SmpPdu::PairingPublicKey(off_curve), &mut rng),
            Err(SmpError::InvalidPublicKey)
        ));

        let reflected = h.responder.local_public;
        assert!(matches!(
            h.responder
                .on_pdu(&SmpPdu::PairingPublicKey(reflected), &mut rng),
            Err(SmpError::InvalidPublicKey)
        ));
        // nothing was derived from the rejected keys
        assert!(h.responder.dh_key.is_none());
        assert!(h.responder.peer_public.is_none());
    }

    fn oob_harness(rng: &mut ChaCha12Rng, corrupt: bool) -> Harness {
        // the responder received the initiator's OOB data
        let (ic, rc) = context(PairingMethod::ScOob, None, false, true);
        let key_pair = EcdhKeyPair::generate(rng);
        let data = ScOobData::generate(&key_pair, rng);
        let mut received = data;
        if corrupt {
            received.c ^= 1;
        }
        Harness {
            initiator: ScAgreement::new(
                ic,
                OobMaterial {
                    sc_local: Some((key_pair, data)),
                    ..OobMaterial::default()
                },
                rng,
            )
            .unwrap(),
            responder: ScAgreement::new(
                rc,
                OobMaterial {
                    sc_peer: Some(received),
                    ..OobMaterial::default()
                },
                rng,
            )
            .unwrap(),
            accept_numeric: true,
            tamper: None,
        }
    }

    #[test]
    fn test_oob_agreement() {
        let mut rng = ChaCha12Rng::seed_from_u64(8);
        let mut h = oob_harness(&mut rng, false);
        let outcome = start(&mut h, &mut rng).unwrap();
        assert_eq!(outcome.confirms, 0);
        assert!(outcome.initiator_key.is_some());
        assert_eq!(outcome.initiator_key, outcome.responder_key);
    }

    #[test]
    fn test_oob_confirm_mismatch() {
        let mut rng = ChaCha12Rng::seed_from_u64(9);
        let mut h = oob_harness(&mut rng, true);
        assert!(matches!(
            start(&mut h, &mut rng),
            Err(SmpError::ConfirmValueFailed)
        ));
    }

    #[test]
    fn test_oob_flag_without_data() {
        let mut rng = ChaCha12Rng::seed_from_u64(10);
        let (_, rc) = context(PairingMethod::ScOob, None, false, true);
        assert!(matches!(
            ScAgreement::new(rc, OobMaterial::default(), &mut rng),
            Err(SmpError::OobNotAvailable)
        ));
    }

    #[test]
    fn test_erase_drops_key_material() {
        let mut rng = ChaCha12Rng::seed_from_u64(11);
        let mut h = harness(PairingMethod::ScJustWorks, None, &mut rng);
        let first = h.initiator.start(&mut rng).unwrap();
        let Action::Send(pdu) = &first[0] else {
            panic!("expected the public key");
        };
        h.responder.on_pdu(pdu, &mut rng).unwrap();
        assert!(h.responder.holds_secrets());
        h.responder.erase();
        assert!(!h.responder.holds_secrets());
        assert_eq!(h.responder.local_public, PublicKeyBytes { x: [0; 32], y: [0; 32] });
    }
}
