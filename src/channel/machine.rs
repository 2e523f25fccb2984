use super::{Idx, Params, State, Transaction};
use crate::{
    encoding::{
        self,
        types::{Address, Signature},
    },
    sig::{self, Verifier, Wallet},
};
use std::sync::Arc;
use thiserror::Error;

/// Lifecycle phase of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    InitSigning,
    InitSigned,
    Funding,
    Acting,
    Signing,
    Final,
    Registering,
    Registered,
    Progressing,
    Progressed,
    Withdrawing,
    Withdrawn,
}

impl Phase {
    pub fn can_transition_to(self, to: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, to),
            (InitSigning, InitSigned)
                | (InitSigned, Funding)
                | (Funding, Acting)
                | (Acting, Signing | Final | Registering | Registered)
                | (Signing, Acting | Final)
                | (Final, Registering | Registered | Withdrawing)
                | (Registering, Registering | Registered)
                | (Registered, Progressing | Withdrawing)
                | (Progressing, Progressed | Registered)
                | (Progressed, Registered | Withdrawing)
                | (Withdrawing, Withdrawing | Withdrawn)
        )
    }

    /// Phases in which the off-chain state may still change.
    pub fn is_off_chain(self) -> bool {
        matches!(self, Phase::Acting | Phase::Signing | Phase::Final)
    }

    /// Phases after the channel went to the ledger.
    pub fn is_on_chain(self) -> bool {
        matches!(
            self,
            Phase::Registering
                | Phase::Registered
                | Phase::Progressing
                | Phase::Progressed
                | Phase::Withdrawing
                | Phase::Withdrawn
        )
    }
}

impl core::fmt::Display for Phase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

impl From<Phase> for u32 {
    fn from(p: Phase) -> u32 {
        p as u32
    }
}

impl TryFrom<u32> for Phase {
    type Error = MachineError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use Phase::*;
        const ALL: [Phase; 12] = [
            InitSigning,
            InitSigned,
            Funding,
            Acting,
            Signing,
            Final,
            Registering,
            Registered,
            Progressing,
            Progressed,
            Withdrawing,
            Withdrawn,
        ];
        ALL.get(value as usize)
            .copied()
            .ok_or(MachineError::UnknownPhase(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidUpdate {
    #[error("state belongs to a different channel")]
    InvalidChannelID,
    #[error("version must increase by exactly one")]
    InvalidVersionNumber,
    #[error("current state is final")]
    CurrentStateIsFinal,
    #[error("assets changed")]
    AssetsMismatch,
    #[error("total allocation changed")]
    TotalAllocationAmountMismatch,
    #[error("number of participants does not match")]
    ParticipantCountMismatch,
    #[error("actor {actor} is not allowed to propose this update")]
    ActorMismatch { actor: Idx },
    #[error("locked funds changed")]
    LockedChanged,
    #[error("invalid sub-allocation: {0}")]
    InvalidSubAllocation(String),
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("invalid phase transition {from} -> {to}")]
    PhaseTransition { from: Phase, to: Phase },
    #[error("operation requires phase {expected}, channel is in {actual}")]
    WrongPhase { expected: Phase, actual: Phase },
    #[error(transparent)]
    InvalidUpdate(#[from] InvalidUpdate),
    #[error("no update staged")]
    NoStagedUpdate,
    #[error("state already signed by participant {0}")]
    AlreadySigned(Idx),
    #[error("signature of participant {idx} recovers to {recovered}")]
    InvalidSignature { idx: Idx, recovered: Address },
    #[error("participant index {0} out of range")]
    InvalidIndex(Idx),
    #[error("transaction is not signed by all participants")]
    NotFullySigned,
    #[error("channel has no app, it can't be progressed")]
    NoApp,
    #[error("unknown phase {0}")]
    UnknownPhase(u32),
    #[error(transparent)]
    Encoding(#[from] encoding::Error),
    #[error(transparent)]
    Sig(#[from] sig::Error),
}

/// Checks the rules every update has to follow, regardless of who proposed it.
pub fn check_valid_transition(
    current: &State,
    next: &State,
    num_parts: usize,
) -> Result<(), InvalidUpdate> {
    next.allocation.valid(num_parts)?;

    if next.id() != current.id() {
        Err(InvalidUpdate::InvalidChannelID)
    } else if current.is_final {
        Err(InvalidUpdate::CurrentStateIsFinal)
    } else if next.version() != current.version() + 1 {
        Err(InvalidUpdate::InvalidVersionNumber)
    } else if next.allocation.assets != current.allocation.assets {
        Err(InvalidUpdate::AssetsMismatch)
    } else if next.allocation.total_assets().is_none()
        || next.allocation.total_assets() != current.allocation.total_assets()
    {
        Err(InvalidUpdate::TotalAllocationAmountMismatch)
    } else {
        Ok(())
    }
}

/// Phase machine of one channel.
///
/// Holds the current (fully signed) transaction and at most one staged
/// transaction that is being signed.
pub struct Machine {
    idx: Idx,
    params: Params,
    phase: Phase,
    current: Transaction,
    staging: Option<Transaction>,
    wallet: Arc<dyn Wallet>,
    verifier: Arc<dyn Verifier>,
}

impl core::fmt::Debug for Machine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.params.id())
            .field("idx", &self.idx)
            .field("phase", &self.phase)
            .field("version", &self.current.version())
            .field("staging", &self.staging.as_ref().map(Transaction::version))
            .finish()
    }
}

impl Machine {
    /// Creates the machine with `init_state` staged for signing.
    pub fn new(
        wallet: Arc<dyn Wallet>,
        verifier: Arc<dyn Verifier>,
        params: Params,
        idx: Idx,
        init_state: State,
    ) -> Result<Self, MachineError> {
        if idx >= params.num_parts() {
            return Err(MachineError::InvalidIndex(idx));
        }
        if init_state.id() != params.id() {
            return Err(InvalidUpdate::InvalidChannelID.into());
        }
        if init_state.version() != 0 {
            return Err(InvalidUpdate::InvalidVersionNumber.into());
        }
        init_state.allocation.valid(params.num_parts())?;

        let tx = Transaction::new(init_state, params.num_parts());
        Ok(Self {
            idx,
            phase: Phase::InitSigning,
            current: tx.clone(),
            staging: Some(tx),
            params,
            wallet,
            verifier,
        })
    }

    /// Recreates a machine from persisted data.
    ///
    /// A channel that was persisted while signing an update goes back to
    /// [Phase::Acting], the staged state is lost.
    pub fn restore(
        wallet: Arc<dyn Wallet>,
        verifier: Arc<dyn Verifier>,
        params: Params,
        idx: Idx,
        phase: Phase,
        current: Transaction,
    ) -> Result<Self, MachineError> {
        if idx >= params.num_parts() {
            return Err(MachineError::InvalidIndex(idx));
        }
        if current.state.id() != params.id() {
            return Err(InvalidUpdate::InvalidChannelID.into());
        }
        let (phase, staging) = match phase {
            Phase::InitSigning => (phase, Some(current.clone())),
            Phase::Signing if current.state.is_final => (Phase::Final, None),
            Phase::Signing => (Phase::Acting, None),
            _ => (phase, None),
        };
        Ok(Self {
            idx,
            params,
            phase,
            current,
            staging,
            wallet,
            verifier,
        })
    }

    pub fn id(&self) -> super::ChannelId {
        self.params.id()
    }

    pub fn idx(&self) -> Idx {
        self.idx
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn current(&self) -> &Transaction {
        &self.current
    }

    pub fn staging(&self) -> Option<&Transaction> {
        self.staging.as_ref()
    }

    pub fn verifier(&self) -> &dyn Verifier {
        self.verifier.as_ref()
    }

    fn set_phase(&mut self, to: Phase) -> Result<(), MachineError> {
        if !self.phase.can_transition_to(to) {
            return Err(MachineError::PhaseTransition {
                from: self.phase,
                to,
            });
        }
        tracing::trace!(channel = %self.id(), from = %self.phase, %to, "Phase transition");
        self.phase = to;
        Ok(())
    }

    fn expect_phase(&self, expected: Phase) -> Result<(), MachineError> {
        if self.phase != expected {
            return Err(MachineError::WrongPhase {
                expected,
                actual: self.phase,
            });
        }
        Ok(())
    }

    fn staging_mut(&mut self) -> Result<&mut Transaction, MachineError> {
        self.staging.as_mut().ok_or(MachineError::NoStagedUpdate)
    }

    /// Signs the staged state with our key.
    pub fn sig(&mut self) -> Result<Signature, MachineError> {
        let idx = self.idx;
        let wallet = Arc::clone(&self.wallet);
        let staging = self.staging_mut()?;
        if staging.sigs[idx].is_some() {
            return Err(MachineError::AlreadySigned(idx));
        }
        staging.sign(idx, wallet.as_ref())
    }

    /// Adds the signature of participant `idx` to the staged state after
    /// checking it.
    pub fn add_sig(&mut self, idx: Idx, sig: Signature) -> Result<(), MachineError> {
        let verifier = Arc::clone(&self.verifier);
        let params = self.params.clone();
        let staging = self.staging_mut()?;
        let slot = staging.sigs.get(idx).ok_or(MachineError::InvalidIndex(idx))?;
        if slot.is_some() {
            return Err(MachineError::AlreadySigned(idx));
        }
        staging.verify_sig(&params, idx, &sig, verifier.as_ref())?;
        staging.sigs[idx] = Some(sig);
        Ok(())
    }

    /// Makes the fully signed initial state current.
    pub fn enable_init(&mut self) -> Result<(), MachineError> {
        self.expect_phase(Phase::InitSigning)?;
        let staging = self.staging.as_ref().ok_or(MachineError::NoStagedUpdate)?;
        if !staging.is_fully_signed() {
            return Err(MachineError::NotFullySigned);
        }
        self.set_phase(Phase::InitSigned)?;
        self.current = self.staging.take().ok_or(MachineError::NoStagedUpdate)?;
        Ok(())
    }

    pub fn set_funding(&mut self) -> Result<(), MachineError> {
        self.set_phase(Phase::Funding)
    }

    pub fn set_funded(&mut self) -> Result<(), MachineError> {
        self.expect_phase(Phase::Funding)?;
        self.set_phase(Phase::Acting)
    }

    /// Checks `state` as an update proposed by `actor` including the
    /// signature, without changing the machine.
    pub fn check_update(
        &self,
        state: &State,
        actor: Idx,
        sig: &Signature,
    ) -> Result<(), MachineError> {
        self.expect_phase(Phase::Acting)?;
        check_valid_transition(&self.current.state, state, self.params.num_parts())?;
        let tx = Transaction::new(state.clone(), self.params.num_parts());
        tx.verify_sig(&self.params, actor, sig, self.verifier.as_ref())
    }

    /// Stages `state` as the next state, moving to [Phase::Signing].
    pub fn update(&mut self, state: State, actor: Idx) -> Result<(), MachineError> {
        self.expect_phase(Phase::Acting)?;
        if actor >= self.params.num_parts() {
            return Err(MachineError::InvalidIndex(actor));
        }
        check_valid_transition(&self.current.state, &state, self.params.num_parts())?;
        self.set_phase(Phase::Signing)?;
        self.staging = Some(Transaction::new(state, self.params.num_parts()));
        Ok(())
    }

    /// Makes the fully signed staged state current.
    pub fn enable_update(&mut self) -> Result<(), MachineError> {
        self.expect_phase(Phase::Signing)?;
        let staging = self.staging.as_ref().ok_or(MachineError::NoStagedUpdate)?;
        if !staging.is_fully_signed() {
            return Err(MachineError::NotFullySigned);
        }
        let next = if staging.state.is_final {
            Phase::Final
        } else {
            Phase::Acting
        };
        self.set_phase(next)?;
        self.current = self.staging.take().ok_or(MachineError::NoStagedUpdate)?;
        Ok(())
    }

    /// Drops the staged state, going back to [Phase::Acting].
    pub fn discard_update(&mut self) -> Result<(), MachineError> {
        self.expect_phase(Phase::Signing)?;
        self.staging = None;
        self.set_phase(Phase::Acting)
    }

    pub fn set_registering(&mut self) -> Result<(), MachineError> {
        self.set_phase(Phase::Registering)
    }

    pub fn set_registered(&mut self) -> Result<(), MachineError> {
        self.set_phase(Phase::Registered)
    }

    pub fn set_progressing(&mut self, state: State) -> Result<(), MachineError> {
        self.expect_phase(Phase::Registered)?;
        if !self.params.has_app() {
            return Err(MachineError::NoApp);
        }
        check_valid_transition(&self.current.state, &state, self.params.num_parts())?;
        self.set_phase(Phase::Progressing)?;
        self.staging = Some(Transaction::new(state, self.params.num_parts()));
        Ok(())
    }

    /// The state was progressed on-chain, `tx` only carries the signature of
    /// the actor.
    pub fn set_progressed(&mut self, tx: Transaction) -> Result<(), MachineError> {
        self.set_phase(Phase::Progressed)?;
        self.staging = None;
        self.current = tx;
        Ok(())
    }

    pub fn set_withdrawing(&mut self) -> Result<(), MachineError> {
        self.set_phase(Phase::Withdrawing)
    }

    pub fn set_withdrawn(&mut self) -> Result<(), MachineError> {
        self.set_phase(Phase::Withdrawn)
    }

    /// Adopts `tx` if it is newer than the current transaction and fully
    /// signed. Returns whether it was adopted.
    pub fn sync(&mut self, tx: Transaction) -> Result<bool, MachineError> {
        if tx.version() <= self.current.version() {
            return Ok(false);
        }
        if !self.phase.is_off_chain() {
            return Err(MachineError::WrongPhase {
                expected: Phase::Acting,
                actual: self.phase,
            });
        }
        tx.verify(&self.params, self.verifier.as_ref())?;

        self.staging = None;
        self.phase = if tx.state.is_final {
            Phase::Final
        } else {
            Phase::Acting
        };
        self.current = tx;
        Ok(true)
    }
}
