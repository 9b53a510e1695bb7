//! Promise exchange with hermes.
//!
//! Providers hand in exchange messages as sessions progress. Each one is
//! queued and processed by a single worker task, which requests the
//! matching promise from hermes, stores it, announces it, and reveals the
//! hashlock secret R. Requests complete through a [`RequestHandle`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tollgate_chain::{FeesResponse, Transactor};
use tollgate_crypto::{
    pay_and_settle_channel_id, promise_digest, provider_channel_id, Encryptor, Signer,
};
use tollgate_hermes::{
    HermesApi, HermesCause, HermesError, HermesResolver, RRecoveryDetails, RequestPromise,
};
use tollgate_store::{HermesPromise, PromiseStore, StoreError};
use tollgate_types::{
    ChainId, ChannelId, ExchangeMessage, HermesId, Identity, Promise, TokenAmount,
};
use tollgate_utils::StopSignal;

use crate::events::{AppEvent, EventBus};
use crate::metrics::PaymentsMetrics;
use crate::payments::Collaborators;
use crate::PaymentsError;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Promise,
    /// Promise that hermes settles right away.
    PayAndSettle,
}

impl RequestKind {
    /// The provider channel a promise of this kind is issued on.
    pub fn channel(self, provider: &Identity, hermes: &HermesId) -> ChannelId {
        match self {
            Self::Promise => provider_channel_id(provider, hermes),
            Self::PayAndSettle => pay_and_settle_channel_id(provider, hermes),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PromiseRequest {
    pub r: Vec<u8>,
    pub exchange_message: ExchangeMessage,
    pub provider: Identity,
    pub session_id: String,
    pub kind: RequestKind,
}

/// A queued request and the channel its error, if any, is reported on.
pub struct EnqueuedRequest {
    pub request: PromiseRequest,
    reply: oneshot::Sender<PaymentsError>,
}

/// Completion of a submitted request.
///
/// The worker sends at most one error and then drops its end; a request
/// that finishes without an error resolves to `Ok(())`.
pub struct RequestHandle {
    rx: oneshot::Receiver<PaymentsError>,
}

impl RequestHandle {
    fn failed(err: PaymentsError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(err);
        Self { rx }
    }

    pub async fn outcome(self) -> Result<(), PaymentsError> {
        match self.rx.await {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }
}

enum WorkerState {
    Idle(mpsc::Receiver<EnqueuedRequest>),
    Running,
    Stopped,
}

pub struct PromiseHandler {
    tx: mpsc::Sender<EnqueuedRequest>,
    state: Mutex<WorkerState>,
    worker: Arc<Worker>,
    stop: StopSignal,
}

impl PromiseHandler {
    pub fn new(
        deps: &Collaborators,
        promises: Arc<PromiseStore>,
        bus: Arc<EventBus>,
        metrics: Arc<PaymentsMetrics>,
        chains: Vec<ChainId>,
        queue_capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            tx,
            state: Mutex::new(WorkerState::Idle(rx)),
            worker: Arc::new(Worker {
                promises,
                hermes: deps.hermes.clone(),
                transactor: deps.transactor.clone(),
                encryptor: deps.encryptor.clone(),
                signer: deps.signer.clone(),
                bus,
                metrics,
                chains,
                fees: Mutex::new(HashMap::new()),
            }),
            stop: StopSignal::new(),
        }
    }

    /// Launch the worker. Later calls, and calls after [`PromiseHandler::stop`],
    /// do nothing.
    pub fn start(&self) {
        let mut state = lock(&self.state);
        let rx = match std::mem::replace(&mut *state, WorkerState::Running) {
            WorkerState::Idle(rx) => rx,
            other => {
                *state = other;
                return;
            }
        };
        drop(state);

        tracing::info!("promise handler started");
        let worker = self.worker.clone();
        let stop = self.stop.clone();
        tokio::spawn(async move { worker.run(rx, stop).await });
    }

    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *lock(&self.state), WorkerState::Stopped);
        self.stop.stop();
        if let WorkerState::Idle(rx) = previous {
            reject_pending(rx, &self.worker.metrics);
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*lock(&self.state), WorkerState::Running)
    }

    pub async fn request_promise(
        &self,
        r: Vec<u8>,
        exchange_message: ExchangeMessage,
        provider: Identity,
        session_id: impl Into<String>,
    ) -> RequestHandle {
        self.submit(PromiseRequest {
            r,
            exchange_message,
            provider,
            session_id: session_id.into(),
            kind: RequestKind::Promise,
        })
        .await
    }

    pub async fn pay_and_settle(
        &self,
        r: Vec<u8>,
        exchange_message: ExchangeMessage,
        provider: Identity,
        session_id: impl Into<String>,
    ) -> RequestHandle {
        self.submit(PromiseRequest {
            r,
            exchange_message,
            provider,
            session_id: session_id.into(),
            kind: RequestKind::PayAndSettle,
        })
        .await
    }

    /// Queue a request, waiting for room while the queue is full.
    pub async fn submit(&self, request: PromiseRequest) -> RequestHandle {
        if self.stop.is_stopped() {
            return RequestHandle::failed(PaymentsError::Stopped);
        }

        let (reply, rx) = oneshot::channel();
        let queued = &self.worker.metrics.queued_promise_requests;
        queued.inc();
        let sent = tokio::select! {
            biased;
            _ = self.stop.stopped() => false,
            sent = self.tx.send(EnqueuedRequest { request, reply }) => sent.is_ok(),
        };
        if !sent {
            queued.dec();
            return RequestHandle::failed(PaymentsError::Stopped);
        }
        RequestHandle { rx }
    }
}

/// Fail every request still queued on `rx` with [`PaymentsError::Stopped`].
fn reject_pending(mut rx: mpsc::Receiver<EnqueuedRequest>, metrics: &PaymentsMetrics) {
    rx.close();
    while let Ok(pending) = rx.try_recv() {
        metrics.queued_promise_requests.dec();
        let _ = pending.reply.send(PaymentsError::Stopped);
    }
}

struct Worker {
    promises: Arc<PromiseStore>,
    hermes: Arc<dyn HermesResolver>,
    transactor: Arc<dyn Transactor>,
    encryptor: Arc<dyn Encryptor>,
    signer: Arc<dyn Signer>,
    bus: Arc<EventBus>,
    metrics: Arc<PaymentsMetrics>,
    chains: Vec<ChainId>,
    fees: Mutex<HashMap<ChainId, FeesResponse>>,
}

impl Worker {
    async fn run(&self, mut rx: mpsc::Receiver<EnqueuedRequest>, stop: StopSignal) {
        for chain_id in &self.chains {
            if let Err(e) = self.refresh_fees(*chain_id).await {
                tracing::warn!(chain_id, error = %e, "could not fetch transactor fees");
            }
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = stop.stopped() => None,
                next = rx.recv() => next,
            };
            let Some(EnqueuedRequest { request, reply }) = next else {
                break;
            };
            self.metrics.queued_promise_requests.dec();

            if let Err(e) = self.process(&request).await {
                self.metrics.promise_errors.inc();
                tracing::warn!(
                    provider = %request.provider,
                    session = %request.session_id,
                    error = %e,
                    "promise request failed"
                );
                let _ = reply.send(e);
            }
        }

        reject_pending(rx, &self.metrics);
        tracing::info!("promise handler stopped");
    }

    async fn process(&self, request: &PromiseRequest) -> Result<(), PaymentsError> {
        let message = &request.exchange_message;
        let chain_id = message.chain_id;
        let hermes_id = &message.hermes_id;
        let provider = &request.provider;
        // Withdrawal promises are paid from the consumer channel's chain.
        let api = match request.kind {
            RequestKind::Promise => self.hermes.caller(chain_id, hermes_id)?,
            RequestKind::PayAndSettle => self.hermes.caller(message.promise.chain_id, hermes_id)?,
        };

        let channel = request.kind.channel(provider, hermes_id);
        self.reveal_pending(api.as_ref(), chain_id, &channel).await;

        let hermes_request = RequestPromise {
            exchange_message: message.clone(),
            transactor_fee: self.transactor_fee(chain_id).await?,
            r_recovery_data: self.recovery_data(provider, &request.r, message.agreement_id)?,
        };

        let promise = match self.call(api.as_ref(), request.kind, &hermes_request).await {
            Ok(promise) => promise,
            Err(e) if e.is(HermesCause::NoPreviousPromise) => {
                tracing::info!(provider = %provider, "no previous promise on hermes");
                return Ok(());
            }
            Err(e) if e.is(HermesCause::NeedsRRecovery) => {
                self.recover_r(api.as_ref(), provider, &e).await?;
                tracing::info!(provider = %provider, "R recovered, requesting promise again");
                self.call(api.as_ref(), request.kind, &hermes_request).await?
            }
            Err(e)
                if e.is(HermesCause::InvalidPreviousLatestPromise)
                    && request.kind == RequestKind::Promise =>
            {
                self.sync_previous(api.as_ref(), chain_id, &channel).await?;
                tracing::info!(provider = %provider, "previous promise synced, requesting promise again");
                self.call(api.as_ref(), request.kind, &hermes_request).await?
            }
            Err(e) => return Err(e.into()),
        };
        if promise.chain_id != chain_id {
            tracing::debug!(expected = chain_id, got = promise.chain_id, "hermes promise on another chain");
        }

        let stored = HermesPromise {
            channel_id: promise.channel(),
            identity: provider.clone(),
            hermes_id: hermes_id.clone(),
            r: hex::encode(&request.r),
            revealed: false,
            agreement_id: message.agreement_id,
            promise,
        };
        match self.promises.store(&stored) {
            Ok(()) => {}
            Err(e @ StoreError::AttemptToOverwrite { .. }) => {
                tracing::debug!(error = %e, "newer promise already stored");
            }
            Err(e) => return Err(e.into()),
        }
        self.metrics.promises_received.inc();

        self.bus.publish(AppEvent::HermesPromiseReceived {
            promise: stored.clone(),
            provider: provider.clone(),
            hermes_id: hermes_id.clone(),
        });
        self.bus.publish(AppEvent::TokensEarned {
            provider: provider.clone(),
            session_id: request.session_id.clone(),
            total: message.agreement_total,
        });

        self.reveal(api.as_ref(), &stored).await
    }

    async fn call(
        &self,
        api: &dyn HermesApi,
        kind: RequestKind,
        request: &RequestPromise,
    ) -> Result<Promise, HermesError> {
        match kind {
            RequestKind::Promise => api.request_promise(request).await,
            RequestKind::PayAndSettle => api.pay_and_settle(request).await,
        }
    }

    /// R of the previous promise on the channel must be revealed before
    /// hermes issues the next one.
    async fn reveal_pending(&self, api: &dyn HermesApi, chain_id: ChainId, channel: &ChannelId) {
        let pending = match self.promises.get(chain_id, channel) {
            Ok(stored) if !stored.revealed && !stored.r.is_empty() => stored,
            Ok(_) => return,
            Err(e) if e.is_not_found() => return,
            Err(e) => {
                tracing::warn!(chain_id, channel = %channel, error = %e, "could not read stored promise");
                return;
            }
        };
        if let Err(e) = self.reveal(api, &pending).await {
            tracing::warn!(chain_id, channel = %channel, error = %e, "could not reveal previous promise");
        }
    }

    /// Hand hermes our last known promise when its own record disagrees,
    /// then reveal that promise's R so a new one can be issued.
    async fn sync_previous(
        &self,
        api: &dyn HermesApi,
        chain_id: ChainId,
        channel: &ChannelId,
    ) -> Result<(), PaymentsError> {
        let stored = self.promises.get(chain_id, channel)?;
        tracing::info!(provider = %stored.identity, amount = %stored.promise.amount, "syncing previous promise with hermes");
        let signature = self
            .signer
            .sign(&stored.identity, &promise_digest(&stored.promise))?;
        api.sync_promise(&stored.promise, &stored.identity, &signature)
            .await?;
        api.reveal_r(&stored.r, &stored.identity, stored.agreement_id)
            .await?;
        self.promises
            .mark_revealed(chain_id, channel, &stored.r)?;
        Ok(())
    }

    async fn reveal(&self, api: &dyn HermesApi, stored: &HermesPromise) -> Result<(), PaymentsError> {
        match api.reveal_r(&stored.r, &stored.identity, stored.agreement_id).await {
            Ok(()) => {}
            Err(e) if e.is(HermesCause::NoPreviousPromise) => {
                tracing::info!(provider = %stored.identity, "no previous promise on hermes, marking R as revealed");
            }
            Err(e) if e.is(HermesCause::NeedsRRecovery) => {
                return self.recover_r(api, &stored.identity, &e).await;
            }
            Err(e) => return Err(e.into()),
        }
        let current = self
            .promises
            .mark_revealed(stored.promise.chain_id, &stored.channel_id, &stored.r)?;
        if !current {
            tracing::debug!(channel = %stored.channel_id, "revealed R no longer matches the stored promise");
        }
        Ok(())
    }

    /// Reveal the R hermes kept for us, sealed in the error payload.
    async fn recover_r(
        &self,
        api: &dyn HermesApi,
        provider: &Identity,
        err: &HermesError,
    ) -> Result<(), PaymentsError> {
        tracing::info!(provider = %provider, "recovering R");
        let data = err
            .data()
            .ok_or_else(|| PaymentsError::RecoveryPayload("hermes sent no recovery data".into()))?;
        let sealed = hex::decode(data.trim_start_matches("0x"))
            .map_err(|e| PaymentsError::RecoveryPayload(e.to_string()))?;
        let plain = self.encryptor.decrypt(provider, &sealed)?;
        let details: RRecoveryDetails = serde_json::from_slice(&plain)
            .map_err(|e| PaymentsError::RecoveryPayload(e.to_string()))?;

        api.reveal_r(&details.r, provider, details.agreement_id).await?;
        self.metrics.r_recoveries.inc();
        tracing::info!(provider = %provider, agreement = details.agreement_id, "R recovered");
        Ok(())
    }

    fn recovery_data(&self, provider: &Identity, r: &[u8], agreement_id: u128) -> Result<String, PaymentsError> {
        let details = RRecoveryDetails {
            r: hex::encode(r),
            agreement_id,
        };
        let json = serde_json::to_vec(&details)
            .map_err(|e| PaymentsError::RecoveryPayload(e.to_string()))?;
        Ok(hex::encode(self.encryptor.encrypt(provider, &json)?))
    }

    async fn transactor_fee(&self, chain_id: ChainId) -> Result<TokenAmount, PaymentsError> {
        let cached = lock(&self.fees)
            .get(&chain_id)
            .filter(|fees| fees.is_valid())
            .map(|fees| fees.fee);
        match cached {
            Some(fee) => Ok(fee),
            None => self.refresh_fees(chain_id).await,
        }
    }

    async fn refresh_fees(&self, chain_id: ChainId) -> Result<TokenAmount, PaymentsError> {
        let fees = self.transactor.fetch_settle_fees(chain_id).await?;
        let fee = fees.fee;
        lock(&self.fees).insert(chain_id, fees);
        Ok(fee)
    }
}
