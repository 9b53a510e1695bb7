//! Nullable hermes: scripted promise responses, recorded calls.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tollgate_crypto::{pay_and_settle_channel_id, provider_channel_id};
use tollgate_hermes::{
    ConsumerData, HermesApi, HermesCause, HermesError, HermesResolver, ProviderData,
    RefreshPromiseRequest, RequestPromise,
};
use tollgate_types::{ChainId, ChannelId, HermesId, Identity, Promise, TokenAmount};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// A recorded `reveal_r` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevealCall {
    pub r: String,
    pub provider: Identity,
    pub agreement_id: u128,
}

/// A recorded `sync_promise` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncCall {
    pub promise: Promise,
    pub provider: Identity,
    pub signature: Vec<u8>,
}

/// The signature [`NullHermes`] puts on a promise for `amount`.
///
/// Differs per amount so a reissued promise is distinguishable.
pub fn promise_signature(amount: TokenAmount) -> Vec<u8> {
    let mut signature = vec![0x5a; 49];
    signature.extend_from_slice(&amount.raw().to_be_bytes());
    signature
}

/// A hermes that answers from scripts.
///
/// Unscripted promise requests succeed with a promise for the full
/// `agreement_total`, on the provider's channel for plain requests and on
/// the withdrawal channel for pay-and-settle. Unscripted reveals and syncs
/// succeed. Consumer and provider data are `NotFound` unless set.
#[derive(Default)]
pub struct NullHermes {
    promise_results: Mutex<VecDeque<Result<Promise, HermesError>>>,
    reveal_results: Mutex<VecDeque<Result<(), HermesError>>>,
    fee_update_error: Mutex<Option<HermesError>>,
    consumer_data: Mutex<HashMap<(ChainId, Identity), ConsumerData>>,
    provider_data: Mutex<HashMap<(ChainId, Identity), ProviderData>>,
    requests: Mutex<Vec<RequestPromise>>,
    reveals: Mutex<Vec<RevealCall>>,
    syncs: Mutex<Vec<SyncCall>>,
    refreshes: Mutex<Vec<RefreshPromiseRequest>>,
    pay_and_settle_calls: AtomicUsize,
    fee_updates: AtomicUsize,
    consumer_data_calls: AtomicUsize,
}

impl NullHermes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next promise request.
    pub fn push_promise_result(&self, result: Result<Promise, HermesError>) {
        lock(&self.promise_results).push_back(result);
    }

    /// Queue the result of the next reveal.
    pub fn push_reveal_result(&self, result: Result<(), HermesError>) {
        lock(&self.reveal_results).push_back(result);
    }

    pub fn fail_fee_updates(&self, err: HermesError) {
        *lock(&self.fee_update_error) = Some(err);
    }

    pub fn set_consumer_data(&self, chain_id: ChainId, data: ConsumerData) {
        lock(&self.consumer_data).insert((chain_id, data.identity.clone()), data);
    }

    pub fn set_provider_data(&self, chain_id: ChainId, data: ProviderData) {
        lock(&self.provider_data).insert((chain_id, data.identity.clone()), data);
    }

    pub fn syncs(&self) -> Vec<SyncCall> {
        lock(&self.syncs).clone()
    }

    pub fn refreshes(&self) -> Vec<RefreshPromiseRequest> {
        lock(&self.refreshes).clone()
    }

    /// Every promise request received, pay-and-settle included.
    pub fn requests(&self) -> Vec<RequestPromise> {
        lock(&self.requests).clone()
    }

    pub fn reveals(&self) -> Vec<RevealCall> {
        lock(&self.reveals).clone()
    }

    pub fn pay_and_settle_calls(&self) -> usize {
        self.pay_and_settle_calls.load(Ordering::SeqCst)
    }

    pub fn fee_updates(&self) -> usize {
        self.fee_updates.load(Ordering::SeqCst)
    }

    pub fn consumer_data_calls(&self) -> usize {
        self.consumer_data_calls.load(Ordering::SeqCst)
    }

    fn answer(
        &self,
        request: &RequestPromise,
        channel: fn(&Identity, &HermesId) -> ChannelId,
    ) -> Result<Promise, HermesError> {
        lock(&self.requests).push(request.clone());
        if let Some(scripted) = lock(&self.promise_results).pop_front() {
            return scripted;
        }

        let message = &request.exchange_message;
        let channel = channel(&message.provider, &message.hermes_id);
        Ok(Promise {
            chain_id: message.chain_id,
            channel_id: channel.to_bytes().unwrap_or_default(),
            amount: message.agreement_total,
            fee: request.transactor_fee,
            hashlock: message.promise.hashlock.clone(),
            r: Vec::new(),
            signature: promise_signature(message.agreement_total),
        })
    }
}

#[async_trait]
impl HermesApi for NullHermes {
    async fn request_promise(&self, request: &RequestPromise) -> Result<Promise, HermesError> {
        self.answer(request, provider_channel_id)
    }

    async fn pay_and_settle(&self, request: &RequestPromise) -> Result<Promise, HermesError> {
        self.pay_and_settle_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(request, pay_and_settle_channel_id)
    }

    async fn reveal_r(
        &self,
        r: &str,
        provider: &Identity,
        agreement_id: u128,
    ) -> Result<(), HermesError> {
        lock(&self.reveals).push(RevealCall {
            r: r.to_string(),
            provider: provider.clone(),
            agreement_id,
        });
        lock(&self.reveal_results).pop_front().unwrap_or(Ok(()))
    }

    async fn update_promise_fee(
        &self,
        promise: &Promise,
        new_fee: TokenAmount,
    ) -> Result<Promise, HermesError> {
        self.fee_updates.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = lock(&self.fee_update_error).clone() {
            return Err(err);
        }
        Ok(Promise {
            fee: new_fee,
            ..promise.clone()
        })
    }

    async fn get_consumer_data(
        &self,
        chain_id: ChainId,
        identity: &Identity,
    ) -> Result<ConsumerData, HermesError> {
        self.consumer_data_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.consumer_data)
            .get(&(chain_id, identity.clone()))
            .cloned()
            .ok_or_else(|| HermesError::remote(HermesCause::NotFound, "unknown consumer"))
    }

    async fn get_provider_data(
        &self,
        chain_id: ChainId,
        identity: &Identity,
    ) -> Result<ProviderData, HermesError> {
        lock(&self.provider_data)
            .get(&(chain_id, identity.clone()))
            .cloned()
            .ok_or_else(|| HermesError::remote(HermesCause::NotFound, "unknown provider"))
    }

    async fn sync_promise(
        &self,
        promise: &Promise,
        provider: &Identity,
        signature: &[u8],
    ) -> Result<(), HermesError> {
        lock(&self.syncs).push(SyncCall {
            promise: promise.clone(),
            provider: provider.clone(),
            signature: signature.to_vec(),
        });
        Ok(())
    }

    /// Reissues the provider's latest promise from the provider data under
    /// the requested hashlock.
    async fn refresh_promise(
        &self,
        request: &RefreshPromiseRequest,
    ) -> Result<Promise, HermesError> {
        lock(&self.refreshes).push(request.clone());
        let data = lock(&self.provider_data)
            .get(&(request.chain_id, request.identity.clone()))
            .cloned()
            .ok_or_else(|| HermesError::remote(HermesCause::NotFound, "unknown provider"))?;
        let latest = data.latest_promise;
        Ok(Promise {
            chain_id: request.chain_id,
            channel_id: latest.channel_id,
            amount: latest.amount,
            fee: latest.fee,
            hashlock: request.hashlock.clone(),
            r: Vec::new(),
            signature: promise_signature(latest.amount),
        })
    }
}

/// Resolves every chain to one active hermes backed by a [`NullHermes`].
///
/// Hermeses registered as inactive share the same backing double.
pub struct NullHermesResolver {
    hermes_id: HermesId,
    inactive: Vec<HermesId>,
    hermes: Arc<NullHermes>,
}

impl NullHermesResolver {
    pub fn new(hermes_id: HermesId, hermes: Arc<NullHermes>) -> Self {
        Self {
            hermes_id,
            inactive: Vec::new(),
            hermes,
        }
    }

    pub fn with_inactive(mut self, inactive: Vec<HermesId>) -> Self {
        self.inactive = inactive;
        self
    }
}

impl HermesResolver for NullHermesResolver {
    fn active_hermes(&self, _chain_id: ChainId) -> Result<HermesId, HermesError> {
        Ok(self.hermes_id.clone())
    }

    fn caller(
        &self,
        _chain_id: ChainId,
        hermes_id: &HermesId,
    ) -> Result<Arc<dyn HermesApi>, HermesError> {
        if hermes_id != &self.hermes_id && !self.inactive.contains(hermes_id) {
            return Err(HermesError::UnknownHermes(hermes_id.to_string()));
        }
        Ok(self.hermes.clone())
    }

    fn inactive_hermeses(&self, _chain_id: ChainId) -> Result<Vec<HermesId>, HermesError> {
        Ok(self.inactive.clone())
    }
}
