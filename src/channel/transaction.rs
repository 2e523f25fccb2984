use super::{Idx, MachineError, Params, State};
use crate::{
    encoding::types::Signature,
    sig::{Verifier, Wallet},
};

/// A state together with the signatures collected so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub state: State,
    pub sigs: Vec<Option<Signature>>,
}

impl Transaction {
    /// Unsigned transaction with a signature slot for every participant.
    pub fn new(state: State, num_parts: usize) -> Self {
        Self {
            state,
            sigs: vec![None; num_parts],
        }
    }

    pub fn version(&self) -> u64 {
        self.state.version()
    }

    pub fn is_fully_signed(&self) -> bool {
        self.sigs.iter().all(Option::is_some)
    }

    /// All signatures, `None` if one is missing.
    pub fn signatures(&self) -> Option<Vec<Signature>> {
        self.sigs.iter().copied().collect()
    }

    pub(crate) fn sign(&mut self, idx: Idx, wallet: &dyn Wallet) -> Result<Signature, MachineError> {
        let slot = self.sigs.get_mut(idx).ok_or(MachineError::InvalidIndex(idx))?;
        let sig = wallet.sign_hash(self.state.hash()?)?;
        *slot = Some(sig);
        Ok(sig)
    }

    /// Checks that `sig` was created by participant `idx` over this state.
    pub fn verify_sig(
        &self,
        params: &Params,
        idx: Idx,
        sig: &Signature,
        verifier: &dyn Verifier,
    ) -> Result<(), MachineError> {
        let expected = *params
            .participants()
            .get(idx)
            .ok_or(MachineError::InvalidIndex(idx))?;
        let recovered = verifier.recover(self.state.hash()?, sig)?;
        if recovered != expected {
            return Err(MachineError::InvalidSignature { idx, recovered });
        }
        Ok(())
    }

    /// Valid only if every participant signed this state and every signature
    /// belongs to that participant.
    pub fn verify(&self, params: &Params, verifier: &dyn Verifier) -> Result<(), MachineError> {
        if self.state.id() != params.id() {
            return Err(super::InvalidUpdate::InvalidChannelID.into());
        }
        if self.sigs.len() != params.num_parts() {
            return Err(super::InvalidUpdate::ParticipantCountMismatch.into());
        }
        for (idx, sig) in self.sigs.iter().enumerate() {
            let sig = sig.as_ref().ok_or(MachineError::NotFullySigned)?;
            self.verify_sig(params, idx, sig, verifier)?;
        }
        Ok(())
    }
}

/// Everything the adjudicator needs to register a (sub-)channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedState {
    pub params: Params,
    pub state: State,
    pub sigs: Vec<Signature>,
}

impl SignedState {
    pub fn from_transaction(params: Params, tx: &Transaction) -> Option<Self> {
        Some(Self {
            params,
            state: tx.state.clone(),
            sigs: tx.signatures()?,
        })
    }
}
