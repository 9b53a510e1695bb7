//! Nullable transactor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tollgate_chain::{
    ChainError, FeesResponse, PromiseSettledEvent, TransactorRegistration, Transactor,
};
use tollgate_types::{Address, ChainId, HermesId, Identity, Promise, Timestamp, TokenAmount};

use crate::NullBlockchain;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettleKind {
    Rebalance,
    Beneficiary,
    IntoStake,
    PayAndSettle,
}

/// A recorded settlement request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettleCall {
    pub kind: SettleKind,
    pub chain_id: ChainId,
    pub provider: Identity,
    pub hermes: HermesId,
    pub beneficiary: Option<Address>,
    pub promise: Promise,
    /// Provider signature authorizing a pay-and-settle beneficiary.
    pub beneficiary_signature: Vec<u8>,
}

/// A transactor that records settlement requests instead of sending them.
///
/// When attached to a [`NullBlockchain`] with [`NullTransactor::settling_on`],
/// every accepted settlement is immediately mined: a settled event for the
/// promise is emitted to the chain's subscribers.
///
/// Results queued with [`NullTransactor::push_settle_result`] are used
/// before the persistent [`NullTransactor::fail_settlements`] error.
pub struct NullTransactor {
    fees: Mutex<FeesResponse>,
    registration_fees: Mutex<FeesResponse>,
    settle_results: Mutex<VecDeque<Result<(), ChainError>>>,
    settle_error: Mutex<Option<ChainError>>,
    registrations: Mutex<Vec<TransactorRegistration>>,
    settlements: Mutex<Vec<SettleCall>>,
    chain: Mutex<Option<Arc<NullBlockchain>>>,
    fee_fetches: AtomicUsize,
    settle_attempts: AtomicUsize,
}

impl NullTransactor {
    /// Zero fees, valid for an hour.
    pub fn new() -> Self {
        let free = FeesResponse {
            fee: TokenAmount::ZERO,
            valid_until: Timestamp::now().saturating_add(Duration::from_secs(3600)),
        };
        Self {
            fees: Mutex::new(free.clone()),
            registration_fees: Mutex::new(free),
            settle_results: Mutex::new(VecDeque::new()),
            settle_error: Mutex::new(None),
            registrations: Mutex::new(Vec::new()),
            settlements: Mutex::new(Vec::new()),
            chain: Mutex::new(None),
            fee_fetches: AtomicUsize::new(0),
            settle_attempts: AtomicUsize::new(0),
        }
    }

    pub fn settling_on(self, chain: Arc<NullBlockchain>) -> Self {
        *lock(&self.chain) = Some(chain);
        self
    }

    pub fn set_fees(&self, fees: FeesResponse) {
        *lock(&self.fees) = fees;
    }

    pub fn set_registration_fees(&self, fees: FeesResponse) {
        *lock(&self.registration_fees) = fees;
    }

    /// Queue the outcome of the next settlement request.
    pub fn push_settle_result(&self, result: Result<(), ChainError>) {
        lock(&self.settle_results).push_back(result);
    }

    pub fn fail_settlements(&self, err: ChainError) {
        *lock(&self.settle_error) = Some(err);
    }

    pub fn add_registration(&self, registration: TransactorRegistration) {
        lock(&self.registrations).push(registration);
    }

    pub fn settlements(&self) -> Vec<SettleCall> {
        lock(&self.settlements).clone()
    }

    pub fn fee_fetches(&self) -> usize {
        self.fee_fetches.load(Ordering::SeqCst)
    }

    /// Settlement requests received, rejected ones included.
    pub fn settle_attempts(&self) -> usize {
        self.settle_attempts.load(Ordering::SeqCst)
    }

    fn settle(&self, call: SettleCall) -> Result<(), ChainError> {
        self.settle_attempts.fetch_add(1, Ordering::SeqCst);
        let scripted = lock(&self.settle_results).pop_front();
        match scripted {
            Some(Err(err)) => return Err(err),
            Some(Ok(())) => {}
            None => {
                if let Some(err) = lock(&self.settle_error).clone() {
                    return Err(err);
                }
            }
        }
        let chain = lock(&self.chain).clone();
        if let Some(chain) = chain {
            let event = PromiseSettledEvent {
                tx_hash: format!("0x{:064x}", lock(&self.settlements).len() + 1),
                channel_id: call.promise.channel(),
                amount_sent_to_beneficiary: call.promise.amount,
                fees: call.promise.fee,
                lock: call.promise.hashlock.clone(),
            };
            chain.emit_settled(call.chain_id, &call.provider, &call.hermes, event);
        }
        lock(&self.settlements).push(call);
        Ok(())
    }
}

impl Default for NullTransactor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transactor for NullTransactor {
    async fn fetch_settle_fees(&self, _chain_id: ChainId) -> Result<FeesResponse, ChainError> {
        self.fee_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.fees).clone())
    }

    async fn settle_and_rebalance(
        &self,
        chain_id: ChainId,
        hermes: &HermesId,
        provider: &Identity,
        promise: &Promise,
    ) -> Result<(), ChainError> {
        self.settle(SettleCall {
            kind: SettleKind::Rebalance,
            chain_id,
            provider: provider.clone(),
            hermes: hermes.clone(),
            beneficiary: None,
            promise: promise.clone(),
            beneficiary_signature: Vec::new(),
        })
    }

    async fn settle_with_beneficiary(
        &self,
        chain_id: ChainId,
        provider: &Identity,
        beneficiary: &Address,
        hermes: &HermesId,
        promise: &Promise,
    ) -> Result<(), ChainError> {
        self.settle(SettleCall {
            kind: SettleKind::Beneficiary,
            chain_id,
            provider: provider.clone(),
            hermes: hermes.clone(),
            beneficiary: Some(beneficiary.clone()),
            promise: promise.clone(),
            beneficiary_signature: Vec::new(),
        })
    }

    async fn settle_into_stake(
        &self,
        chain_id: ChainId,
        hermes: &HermesId,
        provider: &Identity,
        promise: &Promise,
    ) -> Result<(), ChainError> {
        self.settle(SettleCall {
            kind: SettleKind::IntoStake,
            chain_id,
            provider: provider.clone(),
            hermes: hermes.clone(),
            beneficiary: None,
            promise: promise.clone(),
            beneficiary_signature: Vec::new(),
        })
    }

    async fn pay_and_settle(
        &self,
        chain_id: ChainId,
        hermes: &HermesId,
        provider: &Identity,
        promise: &Promise,
        beneficiary: &Address,
        beneficiary_signature: &[u8],
    ) -> Result<(), ChainError> {
        self.settle(SettleCall {
            kind: SettleKind::PayAndSettle,
            chain_id,
            provider: provider.clone(),
            hermes: hermes.clone(),
            beneficiary: Some(beneficiary.clone()),
            promise: promise.clone(),
            beneficiary_signature: beneficiary_signature.to_vec(),
        })
    }

    async fn fetch_registration_fees(&self, _chain_id: ChainId) -> Result<FeesResponse, ChainError> {
        Ok(lock(&self.registration_fees).clone())
    }

    async fn fetch_registration_status(
        &self,
        identity: &Identity,
    ) -> Result<Vec<TransactorRegistration>, ChainError> {
        Ok(lock(&self.registrations)
            .iter()
            .filter(|r| &r.identity == identity)
            .cloned()
            .collect())
    }
}
