//! LE Legacy pairing
//!
//! Confirm/random exchange over a Temporary Key. Passkey Entry commits to
//! the passkey one bit per round, `0x80 | bit` being the round's TK, so a
//! wrong guess is caught before more than one bit is revealed.

use super::*;
use crate::smp::crypto::{c1, generate_passkey, mask_key, random_u128, s1};
use log::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Waiting for the local user to type the passkey
    AwaitPasskey,
    AwaitConfirm,
    AwaitRandom,
    Done,
}

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct LegacyAgreement {
    #[zeroize(skip)]
    ctx: AgreementContext,
    #[zeroize(skip)]
    step: Step,
    #[zeroize(skip)]
    rounds: u8,
    round: u8,
    /// OOB Temporary Key
    oob_tk: Option<u128>,
    passkey: Option<u32>,
    local_random: Option<u128>,
    local_confirm: Option<u128>,
    peer_confirm: Option<u128>,
}

impl LegacyAgreement {
    pub fn new(ctx: AgreementContext, oob_tk: Option<u128>) -> SmpResult<Self> {
        let oob_tk = match ctx.method {
            PairingMethod::LegacyOob => Some(oob_tk.ok_or(SmpError::OobNotAvailable)?),
            PairingMethod::LegacyJustWorks | PairingMethod::LegacyPasskeyEntry => None,
            _ => return Err(SmpError::InvalidState("not a legacy pairing method")),
        };
        let rounds = if ctx.method.is_passkey() {
            SMP_PASSKEY_ROUNDS
        } else {
            1
        };

        Ok(Self {
            ctx,
            step: Step::AwaitConfirm,
            rounds,
            round: 0,
            oob_tk,
            passkey: None,
            local_random: None,
            local_confirm: None,
            peer_confirm: None,
        })
    }

    pub fn state(&self) -> PairingState {
        PairingState::LegacyConfirm { round: self.round }
    }

    pub fn erase(&mut self) {
        self.zeroize();
        self.oob_tk = None;
        self.passkey = None;
        self.local_random = None;
        self.local_confirm = None;
        self.peer_confirm = None;
        self.step = Step::Done;
    }

    pub fn holds_secrets(&self) -> bool {
        self.oob_tk.is_some()
            || self.passkey.is_some()
            || self.local_random.is_some()
            || self.local_confirm.is_some()
            || self.peer_confirm.is_some()
    }

    pub fn start<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> SmpResult<Vec<Action>> {
        let mut actions = Vec::new();

        if self.ctx.method.is_passkey() {
            if self.ctx.local_inputs_passkey() {
                self.step = Step::AwaitPasskey;
                actions.push(Action::RequestPasskey);
                if !self.ctx.is_initiator() {
                    // a Pairing Confirm may arrive while the user types
                    self.step = Step::AwaitConfirm;
                }
                return Ok(actions);
            }
            let passkey = generate_passkey(rng);
            self.passkey = Some(passkey);
            actions.push(Action::DisplayPasskey(passkey));
        }

        if self.ctx.is_initiator() {
            actions.extend(self.send_confirm(rng));
        }
        Ok(actions)
    }

    pub fn on_passkey<R: RngCore + CryptoRng>(
        &mut self,
        passkey: u32,
        rng: &mut R,
    ) -> SmpResult<Vec<Action>> {
        if !self.ctx.method.is_passkey() || self.passkey.is_some() {
            return Err(SmpError::InvalidState("no passkey requested"));
        }
        self.passkey = Some(passkey);

        if self.ctx.is_initiator() {
            return Ok(self.send_confirm(rng));
        }
        if self.peer_confirm.is_some() {
            return Ok(self.send_confirm(rng));
        }
        Ok(Vec::new())
    }

    pub fn on_pdu<R: RngCore + CryptoRng>(
        &mut self,
        pdu: &SmpPdu,
        rng: &mut R,
    ) -> SmpResult<Vec<Action>> {
        match (pdu, self.step) {
            (SmpPdu::PairingConfirm(confirm), Step::AwaitConfirm) => {
                self.on_confirm(*confirm, rng)
            }
            (SmpPdu::PairingRandom(random), Step::AwaitRandom) => self.on_random(*random, rng),
            _ => Err(unexpected(pdu, self.state())),
        }
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
            let random = self
                .local_random
                .ok_or(SmpError::InvalidState("confirm before local commitment"))?;
            self.step = Step::AwaitRandom;
            return Ok(vec![Action::Send(SmpPdu::PairingRandom(random))]);
        }

        if self.ctx.method.is_passkey() && self.passkey.is_none() {
            debug!("Pairing Confirm buffered until the passkey is entered");
            return Ok(Vec::new());
        }
        Ok(self.send_confirm(rng))
    }

    fn on_random<R: RngCore + CryptoRng>(
        &mut self,
        peer_random: u128,
        rng: &mut R,
    ) -> SmpResult<Vec<Action>> {
        let tk = self.round_key();
        let peer_confirm = self
            .peer_confirm
            .take()
            .ok_or(SmpError::InvalidState("random before confirm"))?;
        if !values_match(self.confirm_value(tk, peer_random), peer_confirm) {
            return Err(SmpError::ConfirmValueFailed);
        }

        let local_random = self
            .local_random
            .take()
            .ok_or(SmpError::InvalidState("random before local commitment"))?;
        self.local_confirm = None;

        let mut actions = Vec::new();
        if !self.ctx.is_initiator() {
            actions.push(Action::Send(SmpPdu::PairingRandom(local_random)));
        }

        if self.round + 1 < self.rounds {
            self.round += 1;
            self.step = Step::AwaitConfirm;
            if self.ctx.is_initiator() {
                actions.extend(self.send_confirm(rng));
            }
            return Ok(actions);
        }

        let (mrand, srand) = if self.ctx.is_initiator() {
            (local_random, peer_random)
        } else {
            (peer_random, local_random)
        };
        let stk = mask_key(s1(self.temporary_key(), srand, mrand), self.ctx.key_size);
        self.step = Step::Done;
        debug!("Legacy key agreement complete after {} round(s)", self.rounds);
        actions.push(Action::Agreed(stk));
        Ok(actions)
    }

    /// Commit to a fresh random value for the current round
    fn send_confirm<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Vec<Action> {
        let random = random_u128(rng);
        let confirm = self.confirm_value(self.round_key(), random);
        self.local_random = Some(random);
        self.local_confirm = Some(confirm);
        self.step = if self.ctx.is_initiator() {
            Step::AwaitConfirm
        } else {
            Step::AwaitRandom
        };
        vec![Action::Send(SmpPdu::PairingConfirm(confirm))]
    }

    fn confirm_value(&self, tk: u128, random: u128) -> u128 {
        let initiator = &self.ctx.initiator;
        let responder = &self.ctx.responder;
        c1(
            tk,
            random,
            &self.ctx.preq(),
            &self.ctx.pres(),
            initiator.addr_type.into(),
            &initiator.bdaddr,
            responder.addr_type.into(),
            &responder.bdaddr,
        )
    }

    /// TK used for the confirm values of the current round
    fn round_key(&self) -> u128 {
        match (self.oob_tk, self.passkey) {
            (Some(tk), _) => tk,
            (None, Some(passkey)) => passkey_bit(passkey, self.round) as u128,
            (None, None) => 0,
        }
    }

    /// TK the STK is generated from
    fn temporary_key(&self) -> u128 {
        match (self.oob_tk, self.passkey) {
            (Some(tk), _) => tk,
            (None, Some(passkey)) => passkey as u128,
            (None, None) => 0,
        }
    }
}
