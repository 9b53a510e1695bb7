//! Settlement of provider earnings.
//!
//! Every promise a provider receives is checked against the settlement
//! threshold. Once earnings cross it, a settlement request goes out on the
//! bus and is executed here: the transactor is asked to settle the latest
//! promise and the scheduler waits for the matching promise-settled event
//! on chain. Only one settlement per provider runs at a time.
//!
//! Withdrawals take the same path through a separate channel: the provider
//! issues itself a promise over its hermes balance, hermes answers with a
//! pay-and-settle promise, and the transactor pays it out to a beneficiary.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tollgate_chain::{
    BlockchainView, FeesResponse, PromiseSettledEvent, RegistrationStatusProvider, Subscription,
    Transactor,
};
use tollgate_crypto::{
    beneficiary_digest, consumer_channel_address, exchange_message_digest, generate_r, hashlock,
    pay_and_settle_channel_id, promise_digest, Signer,
};
use tollgate_hermes::HermesResolver;
use tollgate_store::{
    HermesPromise, HistoryFilter, PromiseFilter, PromiseStore, SettlementHistoryEntry,
    SettlementHistoryStore,
};
use tollgate_types::{
    Address, ChainId, ChannelId, ExchangeMessage, HermesId, Identity, Promise,
    RegistrationStatus, Timestamp, TokenAmount, ONE_TOKEN,
};
use tollgate_utils::{Attempt, RetryPolicy, StopSignal};

use crate::channel::Channel;
use crate::channel_repository::ChannelRepository;
use crate::config::PaymentsConfig;
use crate::events::{AppEvent, EventBus, NodeStatus, Topic};
use crate::metrics::PaymentsMetrics;
use crate::payments::Collaborators;
use crate::promise_handler::PromiseHandler;
use crate::PaymentsError;

/// Cap on a withdrawal made without an explicit amount.
pub const MAX_WITHDRAWAL: u128 = 500 * ONE_TOKEN;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where a provider stands with respect to settling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettlementState {
    Unregistered,
    Registered,
    /// A settlement is running; `registered` is restored once it ends.
    Settling { registered: bool },
}

/// Destination of a settlement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SettlementKind {
    /// Pay the channel beneficiary and rebalance the channel from hermes.
    Rebalance,
    Beneficiary(Address),
    IntoStake,
}

#[derive(Clone, Debug)]
pub struct SettlerConfig {
    /// Share of the available channel balance that triggers settlement.
    pub threshold: f64,
    pub max_wait_for_settlement: Duration,
    /// Chain of the services this node runs.
    pub chain_id: ChainId,
    pub chains: Vec<ChainId>,
    /// Withdrawals go here unless another chain is asked for.
    pub l1_chain_id: ChainId,
    pub withdrawal_retry_interval: Duration,
    pub withdrawal_retries: u32,
}

impl From<&PaymentsConfig> for SettlerConfig {
    fn from(config: &PaymentsConfig) -> Self {
        Self {
            threshold: config.settlement_threshold,
            max_wait_for_settlement: config.max_wait_for_settlement(),
            chain_id: config.chain_id,
            chains: config.all_chains(),
            l1_chain_id: config.l1_chain_id,
            withdrawal_retry_interval: config.withdrawal_retry_interval(),
            withdrawal_retries: config.withdrawal_retries,
        }
    }
}

/// Block explorer link for a settlement transaction.
pub fn explorer_url(chain_id: ChainId, tx_hash: &str) -> Option<String> {
    if tx_hash.is_empty() {
        return None;
    }
    let host = match chain_id {
        1 => "etherscan.io",
        5 => "goerli.etherscan.io",
        137 => "polygonscan.com",
        80001 => "mumbai.polygonscan.com",
        _ => return None,
    };
    Some(format!("https://{host}/tx/{tx_hash}"))
}

fn agreement_id() -> Result<u128, PaymentsError> {
    let random = generate_r()?;
    let mut id = [0u8; 16];
    id.copy_from_slice(&random[..16]);
    Ok(u128::from_be_bytes(id))
}

enum Waited {
    Stopped,
    Settled(Option<PromiseSettledEvent>),
    TimedOut,
}

/// Marks a provider as settling for as long as it lives.
struct SettlingGuard<'a> {
    states: &'a Mutex<HashMap<Identity, SettlementState>>,
    provider: Identity,
}

impl Drop for SettlingGuard<'_> {
    fn drop(&mut self) {
        let mut states = lock(self.states);
        if let Some(state) = states.get_mut(&self.provider) {
            if let SettlementState::Settling { registered } = *state {
                *state = if registered {
                    SettlementState::Registered
                } else {
                    SettlementState::Unregistered
                };
            }
        }
    }
}

pub struct SettlementScheduler {
    chain: Arc<dyn BlockchainView>,
    transactor: Arc<dyn Transactor>,
    registry: Arc<dyn RegistrationStatusProvider>,
    hermes: Arc<dyn HermesResolver>,
    signer: Arc<dyn Signer>,
    channels: Arc<ChannelRepository>,
    handler: Arc<PromiseHandler>,
    promises: Arc<PromiseStore>,
    history: Arc<SettlementHistoryStore>,
    bus: Arc<EventBus>,
    metrics: Arc<PaymentsMetrics>,
    config: SettlerConfig,
    states: Mutex<HashMap<Identity, SettlementState>>,
    hermes_fees: Mutex<HashMap<(ChainId, HermesId), u16>>,
    settle_fees: Mutex<HashMap<ChainId, FeesResponse>>,
    stop: StopSignal,
}

impl SettlementScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        deps: &Collaborators,
        channels: Arc<ChannelRepository>,
        handler: Arc<PromiseHandler>,
        promises: Arc<PromiseStore>,
        history: Arc<SettlementHistoryStore>,
        bus: Arc<EventBus>,
        metrics: Arc<PaymentsMetrics>,
        config: SettlerConfig,
    ) -> Self {
        Self {
            chain: deps.chain.clone(),
            transactor: deps.transactor.clone(),
            registry: deps.registry.clone(),
            hermes: deps.hermes.clone(),
            signer: deps.signer.clone(),
            channels,
            handler,
            promises,
            history,
            bus,
            metrics,
            config,
            states: Mutex::new(HashMap::new()),
            hermes_fees: Mutex::new(HashMap::new()),
            settle_fees: Mutex::new(HashMap::new()),
            stop: StopSignal::new(),
        }
    }

    pub fn state(&self, provider: &Identity) -> Option<SettlementState> {
        lock(&self.states).get(provider).copied()
    }

    /// Track `provider` if it is registered. Providers already known to be
    /// registered are left alone.
    pub async fn load_initial_state(&self, chain_id: ChainId, provider: &Identity) -> Result<(), PaymentsError> {
        if matches!(
            self.state(provider),
            Some(SettlementState::Registered | SettlementState::Settling { registered: true })
        ) {
            tracing::debug!(provider = %provider, "settlement state already loaded");
            return Ok(());
        }

        let status = self.registry.get_registration_status(chain_id, provider).await?;
        if !status.is_registered() {
            tracing::info!(provider = %provider, status = status.as_str(), "provider not registered, skipping");
            return Ok(());
        }

        self.set_registered(provider);
        Ok(())
    }

    fn set_registered(&self, provider: &Identity) {
        let mut states = lock(&self.states);
        let state = states
            .entry(provider.clone())
            .or_insert(SettlementState::Registered);
        if let SettlementState::Settling { registered } = state {
            *registered = true;
        } else {
            *state = SettlementState::Registered;
        }
    }

    /// Whether the channel's earnings should be settled now.
    pub fn needs_settling(&self, threshold: f64, channel: &Channel) -> bool {
        if self.state(&channel.identity) != Some(SettlementState::Registered) {
            return false;
        }

        let unsettled = channel.unsettled_balance();
        if channel.stake().is_zero() && unsettled.raw() < ONE_TOKEN {
            return false;
        }

        let calculated = channel.available_balance().mul_ratio(threshold);
        unsettled >= calculated && channel.balance() <= calculated
    }

    fn cached_channel(
        &self,
        chain_id: ChainId,
        provider: &Identity,
        hermes: &HermesId,
    ) -> Result<Channel, PaymentsError> {
        self.channels
            .get(chain_id, provider, hermes)
            .ok_or_else(|| PaymentsError::NothingToSettle(provider.to_string()))
    }

    /// Settle to the channel beneficiary and rebalance the channel.
    pub async fn force_settle(&self, chain_id: ChainId, provider: &Identity, hermes: &HermesId) -> Result<(), PaymentsError> {
        let channel = self.cached_channel(chain_id, provider, hermes)?;
        self.settle(SettlementKind::Rebalance, channel).await
    }

    pub async fn settle_with_beneficiary(
        &self,
        chain_id: ChainId,
        provider: &Identity,
        hermes: &HermesId,
        beneficiary: Address,
    ) -> Result<(), PaymentsError> {
        let channel = self.cached_channel(chain_id, provider, hermes)?;
        self.settle(SettlementKind::Beneficiary(beneficiary), channel).await
    }

    pub async fn settle_into_stake(&self, chain_id: ChainId, provider: &Identity, hermes: &HermesId) -> Result<(), PaymentsError> {
        let channel = self.cached_channel(chain_id, provider, hermes)?;
        self.settle(SettlementKind::IntoStake, channel).await
    }

    /// Settle with each of `hermeses` in turn. Hermeses whose fees eat the
    /// whole of the earnings are skipped, and the call fails only when that
    /// is true of all of them.
    pub async fn force_settle_many(
        &self,
        chain_id: ChainId,
        provider: &Identity,
        hermeses: &[HermesId],
    ) -> Result<(), PaymentsError> {
        let mut fee_not_covered = 0;
        for hermes in hermeses {
            let channel = match self.channels.fetch(chain_id, provider, hermes).await {
                Ok(channel) => channel,
                Err(e) => {
                    tracing::error!(chain_id, provider = %provider, hermes = %hermes, error = %e, "could not fetch channel");
                    return Err(PaymentsError::NothingToSettle(provider.to_string()));
                }
            };
            match self.settle(SettlementKind::Rebalance, channel).await {
                Ok(()) => {}
                Err(e @ PaymentsError::FeeNotCovered { .. }) => {
                    tracing::warn!(hermes = %hermes, error = %e, "fee not covered, skipping");
                    fee_not_covered += 1;
                }
                Err(e) => return Err(e),
            }
        }
        if !hermeses.is_empty() && fee_not_covered == hermeses.len() {
            return Err(PaymentsError::FeeNotCoveredForAll);
        }
        Ok(())
    }

    /// Collect earnings left behind with hermeses that are no longer active.
    pub async fn force_settle_inactive_hermeses(&self, chain_id: ChainId, provider: &Identity) -> Result<(), PaymentsError> {
        let inactive = self.hermes.inactive_hermeses(chain_id)?;
        if inactive.is_empty() {
            tracing::info!(chain_id, "no inactive hermeses");
            return Ok(());
        }
        self.force_settle_many(chain_id, provider, &inactive).await
    }

    pub fn settlement_history(&self, filter: &HistoryFilter) -> Result<Vec<SettlementHistoryEntry>, PaymentsError> {
        Ok(self.history.list(filter)?)
    }

    fn begin_settling(&self, provider: &Identity) -> Result<SettlingGuard<'_>, PaymentsError> {
        let mut states = lock(&self.states);
        let state = states
            .entry(provider.clone())
            .or_insert(SettlementState::Unregistered);
        *state = match *state {
            SettlementState::Settling { .. } => {
                return Err(PaymentsError::AlreadySettling(provider.to_string()));
            }
            SettlementState::Registered => SettlementState::Settling { registered: true },
            SettlementState::Unregistered => SettlementState::Settling { registered: false },
        };
        Ok(SettlingGuard {
            states: &self.states,
            provider: provider.clone(),
        })
    }

    async fn settle(&self, kind: SettlementKind, channel: Channel) -> Result<(), PaymentsError> {
        let provider = &channel.identity;
        let _settling = self.begin_settling(provider)?;
        tracing::info!(provider = %provider, hermes = %channel.hermes_id, ?kind, "settling");

        let result = self.settle_channel(&kind, &channel).await;
        match &result {
            Ok(()) => {}
            Err(PaymentsError::SettleTimeout) => self.metrics.settlement_timeouts.inc(),
            Err(e) => {
                self.metrics.settlement_failures.inc();
                tracing::error!(provider = %provider, error = %e, "settlement failed");
            }
        }
        result
    }

    async fn settle_channel(&self, kind: &SettlementKind, channel: &Channel) -> Result<(), PaymentsError> {
        let chain_id = channel.chain_id;
        let provider = &channel.identity;
        let hermes = &channel.hermes_id;

        let mut promise = channel.last_promise.promise.clone();
        if promise.r.is_empty() {
            match hex::decode(&channel.last_promise.r) {
                Ok(r) => promise.r = r,
                Err(e) => tracing::warn!(provider = %provider, error = %e, "stored R is not hex"),
            }
        }
        let promise = self.with_latest_fee(chain_id, hermes, promise).await?;

        let amount = promise.amount.saturating_sub(channel.provider_channel.settled);
        if amount.is_zero() {
            tracing::warn!(provider = %provider, "nothing left to settle");
            return Ok(());
        }

        let hermes_fee = amount.basis_points(self.hermes_fee(chain_id, hermes).await?);
        let fees = hermes_fee.saturating_add(promise.fee);
        if fees > amount {
            tracing::error!(
                provider = %provider,
                %amount,
                %hermes_fee,
                transactor_fee = %promise.fee,
                "earnings too small for settling"
            );
            return Err(PaymentsError::FeeNotCovered {
                fees,
                unsettled: amount,
            });
        }

        let mut settled = self
            .chain
            .subscribe_to_promise_settled(chain_id, provider, hermes)
            .await?;

        let sent = match kind {
            SettlementKind::Rebalance => {
                self.transactor
                    .settle_and_rebalance(chain_id, hermes, provider, &promise)
                    .await
            }
            SettlementKind::Beneficiary(beneficiary) => {
                self.transactor
                    .settle_with_beneficiary(chain_id, provider, beneficiary, hermes, &promise)
                    .await
            }
            SettlementKind::IntoStake => {
                self.transactor
                    .settle_into_stake(chain_id, hermes, provider, &promise)
                    .await
            }
        };
        let beneficiary = match kind {
            SettlementKind::Beneficiary(beneficiary) => beneficiary.clone(),
            _ => channel.beneficiary().clone(),
        };
        if let Err(e) = sent {
            settled.cancel();
            self.record(&SettlementHistoryEntry {
                provider_id: provider.clone(),
                hermes_id: hermes.clone(),
                channel_address: channel.channel_id.clone(),
                time: Timestamp::now(),
                promise,
                beneficiary,
                amount,
                total_settled: channel.provider_channel.settled,
                error: e.to_string(),
                ..Default::default()
            });
            return Err(e.into());
        }

        let Some(event) = self.wait_for_settlement(&mut settled, None).await? else {
            tracing::info!(provider = %provider, "stopped while waiting for settlement");
            return Ok(());
        };

        let total_settled = match self.channels.fetch(chain_id, provider, hermes).await {
            Ok(refreshed) => refreshed.provider_channel.settled,
            Err(e) => {
                tracing::error!(provider = %provider, error = %e, "resync after settlement failed");
                channel.provider_channel.settled.saturating_add(event.amount_sent_to_beneficiary)
            }
        };
        let entry = SettlementHistoryEntry {
            block_explorer_url: explorer_url(chain_id, &event.tx_hash).unwrap_or_default(),
            tx_hash: event.tx_hash,
            provider_id: provider.clone(),
            hermes_id: hermes.clone(),
            channel_address: channel.channel_id.clone(),
            time: Timestamp::now(),
            promise,
            beneficiary,
            amount: event.amount_sent_to_beneficiary,
            total_settled,
            fees: event.fees,
            is_withdrawal: false,
            error: String::new(),
        };
        self.record(&entry);

        self.metrics.settlements_completed.inc();
        self.bus.publish(AppEvent::SettlementComplete {
            chain_id,
            provider: provider.clone(),
            hermes_id: hermes.clone(),
        });
        tracing::info!(provider = %provider, amount = %entry.amount, "settlement complete");
        Ok(())
    }

    /// Wait for the promise-settled event, of `channel` when one is given.
    /// `None` when the scheduler stopped first.
    async fn wait_for_settlement(
        &self,
        settled: &mut Subscription<PromiseSettledEvent>,
        channel: Option<&ChannelId>,
    ) -> Result<Option<PromiseSettledEvent>, PaymentsError> {
        let deadline = tokio::time::Instant::now() + self.config.max_wait_for_settlement;
        let result = loop {
            let waited = tokio::select! {
                biased;
                _ = self.stop.stopped() => Waited::Stopped,
                event = settled.recv() => Waited::Settled(event),
                _ = tokio::time::sleep_until(deadline) => Waited::TimedOut,
            };
            match waited {
                Waited::Stopped => break Ok(None),
                Waited::TimedOut => break Err(PaymentsError::SettleTimeout),
                Waited::Settled(None) => {
                    break Err(PaymentsError::Other(
                        "promise settled subscription closed".into(),
                    ))
                }
                Waited::Settled(Some(event))
                    if channel.is_some_and(|channel| *channel != event.channel_id) =>
                {
                    tracing::debug!(channel = %event.channel_id, "settlement of another channel");
                }
                Waited::Settled(Some(event)) => break Ok(Some(event)),
            }
        };
        settled.cancel();
        result
    }

    fn record(&self, entry: &SettlementHistoryEntry) {
        match self.history.store(entry) {
            Ok(()) if entry.error.is_empty() => {
                tracing::debug!(tx = %entry.tx_hash, "saved a settlement");
            }
            Ok(()) => tracing::debug!(provider = %entry.provider_id, "saved a failed settlement"),
            Err(e) => {
                tracing::error!(tx = %entry.tx_hash, error = %e, "could not store settlement history");
            }
        }
    }

    /// Withdraw the provider's hermes balance on `from_chain` to
    /// `beneficiary` on `to_chain`, L1 when not given.
    ///
    /// Without an `amount` the whole balance goes, capped at
    /// [`MAX_WITHDRAWAL`]. Returns once the payout is observed on chain.
    pub async fn withdraw(
        &self,
        from_chain: ChainId,
        to_chain: Option<ChainId>,
        provider: &Identity,
        hermes: &HermesId,
        beneficiary: &Address,
        amount: Option<TokenAmount>,
    ) -> Result<(), PaymentsError> {
        let _settling = self.begin_settling(provider)?;
        let to_chain = to_chain.unwrap_or(self.config.l1_chain_id);
        if from_chain != self.config.chain_id {
            return Err(PaymentsError::WrongWithdrawalChain {
                requested: from_chain,
                allowed: self.config.chain_id,
            });
        }

        let api = self.hermes.caller(from_chain, hermes)?;
        let data = api.get_provider_data(from_chain, provider).await?;
        let amount =
            amount.unwrap_or_else(|| data.balance.min(TokenAmount::new(MAX_WITHDRAWAL)));
        self.validate_withdrawal_amount(amount, to_chain).await?;

        let channel_id = pay_and_settle_channel_id(provider, hermes);
        let previous = match self.promises.get(to_chain, &channel_id) {
            Ok(stored) => Some(stored),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        // A promise behind what was already settled gets corrected by this one.
        let promised = data.latest_promise.amount.max(data.settled);
        let (r, message) =
            self.issue_self_promise(from_chain, to_chain, amount, promised, provider, hermes)?;
        tracing::info!(provider = %provider, from_chain, to_chain, %amount, "requesting withdrawal promise");
        self.handler
            .pay_and_settle(r, message, provider.clone(), "")
            .await
            .outcome()
            .await?;

        let latest = self.promises.get(to_chain, &channel_id)?;
        if previous.is_some_and(|previous| previous.promise.signature == latest.promise.signature) {
            tracing::warn!(provider = %provider, "hermes did not update the withdrawal promise");
            return Err(PaymentsError::PromiseNotUpdated);
        }
        self.pay_and_settle_withdrawal(from_chain, amount, beneficiary, latest)
            .await
    }

    /// What the latest withdrawal promise on `chain_id` still has unpaid,
    /// and the channel it sits on.
    pub async fn check_latest_withdrawal(
        &self,
        chain_id: ChainId,
        provider: &Identity,
        hermes: &HermesId,
    ) -> Result<(TokenAmount, ChannelId), PaymentsError> {
        let channel_id = pay_and_settle_channel_id(provider, hermes);
        let latest = self.promises.get(chain_id, &channel_id)?;
        let channel = self.chain.get_withdrawal_channel(chain_id, hermes, provider).await?;
        Ok((latest.promise.amount.saturating_sub(channel.settled), channel_id))
    }

    /// Send the stored withdrawal promise on `channel_id` to the transactor
    /// again, without asking hermes for a new one.
    pub async fn retry_withdraw_latest(
        &self,
        chain_id: ChainId,
        amount: TokenAmount,
        channel_id: &ChannelId,
        beneficiary: &Address,
        provider: &Identity,
    ) -> Result<(), PaymentsError> {
        let _settling = self.begin_settling(provider)?;
        let latest = self.promises.get(chain_id, channel_id)?;
        self.pay_and_settle_withdrawal(chain_id, amount, beneficiary, latest)
            .await
    }

    async fn validate_withdrawal_amount(&self, amount: TokenAmount, to_chain: ChainId) -> Result<(), PaymentsError> {
        let fees = self.transactor.fetch_settle_fees(to_chain).await?;
        if fees.fee > amount {
            return Err(PaymentsError::WithdrawalTooSmall {
                fee: fees.fee,
                amount,
            });
        }
        Ok(())
    }

    /// A promise from the provider's own consumer channel on `from_chain`,
    /// wrapped in an exchange message asking for `amount` on `to_chain`.
    fn issue_self_promise(
        &self,
        from_chain: ChainId,
        to_chain: ChainId,
        amount: TokenAmount,
        promised: TokenAmount,
        provider: &Identity,
        hermes: &HermesId,
    ) -> Result<(Vec<u8>, ExchangeMessage), PaymentsError> {
        let r = generate_r()?;
        let channel = consumer_channel_address(provider, hermes)
            .to_bytes()
            .map_err(|e| PaymentsError::Other(e.to_string()))?;
        let mut promise = Promise {
            chain_id: from_chain,
            channel_id: channel,
            amount: amount + promised,
            fee: TokenAmount::ZERO,
            hashlock: hashlock(&r).to_vec(),
            r: r.to_vec(),
            signature: Vec::new(),
        };
        promise.signature = self.signer.sign(provider, &promise_digest(&promise))?;

        let mut message = ExchangeMessage {
            promise,
            agreement_id: agreement_id()?,
            agreement_total: amount,
            provider: provider.clone(),
            hermes_id: hermes.clone(),
            chain_id: to_chain,
            signature: Vec::new(),
        };
        message.signature = self
            .signer
            .sign(provider, &exchange_message_digest(&message))?;
        Ok((r.to_vec(), message))
    }

    async fn pay_and_settle_withdrawal(
        &self,
        from_chain: ChainId,
        amount: TokenAmount,
        beneficiary: &Address,
        stored: HermesPromise,
    ) -> Result<(), PaymentsError> {
        let provider = &stored.identity;
        let hermes = &stored.hermes_id;
        let to_chain = stored.promise.chain_id;

        let mut promise = stored.promise.clone();
        promise.r = hex::decode(&stored.r)
            .map_err(|e| PaymentsError::Other(format!("stored R is not hex: {e}")))?;
        let digest = beneficiary_digest(
            beneficiary,
            to_chain,
            &promise.channel_id,
            promise.amount,
            &promise.r,
        );
        let beneficiary_signature = self.signer.sign(provider, &digest)?;

        let promise = self.with_latest_fee(to_chain, hermes, promise).await?;
        if promise.fee > amount {
            tracing::error!(provider = %provider, %amount, fee = %promise.fee, "withdrawal too small for the transactor fee");
            return Err(PaymentsError::WithdrawalTooSmall {
                fee: promise.fee,
                amount,
            });
        }

        let mut settled = self
            .chain
            .subscribe_to_promise_settled(to_chain, provider, hermes)
            .await?;
        let sent = self
            .send_withdrawal(to_chain, hermes, provider, &promise, beneficiary, &beneficiary_signature)
            .await;
        if let Err(e) = sent {
            settled.cancel();
            self.record(&SettlementHistoryEntry {
                provider_id: provider.clone(),
                hermes_id: hermes.clone(),
                channel_address: stored.channel_id.clone(),
                time: Timestamp::now(),
                promise,
                beneficiary: beneficiary.clone(),
                amount,
                is_withdrawal: true,
                error: e.to_string(),
                ..Default::default()
            });
            self.metrics.settlement_failures.inc();
            return Err(e);
        }
        self.bus.publish(AppEvent::WithdrawalRequested {
            chain_id: from_chain,
            provider: provider.clone(),
            hermes_id: hermes.clone(),
        });

        let event = match self.wait_for_settlement(&mut settled, Some(&stored.channel_id)).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                tracing::info!(provider = %provider, "stopped while waiting for withdrawal");
                return Ok(());
            }
            Err(e) => {
                if matches!(e, PaymentsError::SettleTimeout) {
                    self.metrics.settlement_timeouts.inc();
                }
                return Err(e);
            }
        };

        let total_settled = match self.chain.get_withdrawal_channel(to_chain, hermes, provider).await {
            Ok(channel) => channel.settled,
            Err(e) => {
                tracing::error!(provider = %provider, error = %e, "could not read withdrawal channel");
                event.amount_sent_to_beneficiary
            }
        };
        let entry = SettlementHistoryEntry {
            block_explorer_url: explorer_url(to_chain, &event.tx_hash).unwrap_or_default(),
            tx_hash: event.tx_hash,
            provider_id: provider.clone(),
            hermes_id: hermes.clone(),
            channel_address: stored.channel_id.clone(),
            time: Timestamp::now(),
            promise,
            beneficiary: beneficiary.clone(),
            amount: event.amount_sent_to_beneficiary,
            total_settled,
            fees: event.fees,
            is_withdrawal: true,
            error: String::new(),
        };
        self.record(&entry);

        self.metrics.settlements_completed.inc();
        self.bus.publish(AppEvent::SettlementComplete {
            chain_id: to_chain,
            provider: provider.clone(),
            hermes_id: hermes.clone(),
        });
        tracing::info!(provider = %provider, amount = %entry.amount, "withdrawal complete");
        Ok(())
    }

    /// Hand the withdrawal to the transactor, retrying while it reports a
    /// conflict or a server error.
    async fn send_withdrawal(
        &self,
        chain_id: ChainId,
        hermes: &HermesId,
        provider: &Identity,
        promise: &Promise,
        beneficiary: &Address,
        signature: &[u8],
    ) -> Result<(), PaymentsError> {
        let transactor = &self.transactor;
        RetryPolicy::constant(
            self.config.withdrawal_retry_interval,
            self.config.withdrawal_retries,
        )
        .run_until(Some(&self.stop), move || async move {
            transactor
                .pay_and_settle(chain_id, hermes, provider, promise, beneficiary, signature)
                .await
                .map_err(|e| {
                    if e.is_retryable() {
                        tracing::warn!(error = %e, "transactor did not take the withdrawal, retrying");
                        Attempt::Retry(e)
                    } else {
                        Attempt::Abort(e)
                    }
                })
        })
        .await
        .map_err(|e| e.into_inner().map_or(PaymentsError::Stopped, PaymentsError::from))
    }

    /// Hermes fee in basis points, fetched once per chain and hermes.
    async fn hermes_fee(&self, chain_id: ChainId, hermes: &HermesId) -> Result<u16, PaymentsError> {
        let key = (chain_id, hermes.clone());
        if let Some(fee) = lock(&self.hermes_fees).get(&key) {
            return Ok(*fee);
        }
        let fee = self.chain.get_hermes_fee(chain_id, hermes).await?;
        lock(&self.hermes_fees).insert(key, fee);
        Ok(fee)
    }

    async fn settle_fees(&self, chain_id: ChainId) -> Result<TokenAmount, PaymentsError> {
        let cached = lock(&self.settle_fees)
            .get(&chain_id)
            .filter(|fees| fees.is_valid())
            .map(|fees| fees.fee);
        if let Some(fee) = cached {
            return Ok(fee);
        }
        let fees = self.transactor.fetch_settle_fees(chain_id).await?;
        let fee = fees.fee;
        lock(&self.settle_fees).insert(chain_id, fees);
        Ok(fee)
    }

    /// Have hermes re-issue the promise when the transactor now charges a
    /// different fee. Classified hermes errors abort; transport failures fall
    /// back to the promise as stored.
    async fn with_latest_fee(
        &self,
        chain_id: ChainId,
        hermes: &HermesId,
        promise: Promise,
    ) -> Result<Promise, PaymentsError> {
        let fee = self.settle_fees(chain_id).await?;
        if fee == promise.fee {
            return Ok(promise);
        }

        let api = self.hermes.caller(chain_id, hermes)?;
        match api.update_promise_fee(&promise, fee).await {
            Ok(mut updated) => {
                updated.r = promise.r;
                tracing::debug!(%fee, "promise updated with latest fee");
                Ok(updated)
            }
            Err(e) if e.is_classified() => Err(e.into()),
            Err(e) => {
                tracing::warn!(error = %e, "could not update promise fee, settling with the stored promise");
                Ok(promise)
            }
        }
    }

    async fn load_known_providers(&self) {
        for chain_id in &self.config.chains {
            let promises = match self.promises.list(&PromiseFilter::chain(*chain_id)) {
                Ok(promises) => promises,
                Err(e) => {
                    tracing::warn!(chain_id, error = %e, "could not list stored promises");
                    continue;
                }
            };
            let providers: BTreeSet<_> = promises.into_iter().map(|p| p.identity).collect();
            for provider in providers {
                if let Err(e) = self.load_initial_state(*chain_id, &provider).await {
                    tracing::warn!(chain_id, provider = %provider, error = %e, "could not load settlement state");
                }
            }
        }
    }

    async fn handle_promise_received(&self, chain_id: ChainId, provider: &Identity, hermes: &HermesId) {
        match self.state(provider) {
            Some(SettlementState::Registered) => {}
            Some(state) => {
                tracing::debug!(provider = %provider, ?state, "not checking settlement");
                return;
            }
            None => {
                tracing::debug!(provider = %provider, "no settlement state for provider, skipping");
                return;
            }
        }

        let channel = match self.channels.fetch(chain_id, provider, hermes).await {
            Ok(channel) => channel,
            Err(e) => {
                tracing::error!(provider = %provider, hermes = %hermes, error = %e, "could not sync channel");
                return;
            }
        };
        if self.needs_settling(self.config.threshold, &channel) {
            tracing::info!(provider = %provider, "starting auto settle");
            self.bus.publish(AppEvent::SettlementRequest {
                chain_id,
                provider: provider.clone(),
                hermes_id: hermes.clone(),
                into_stake: channel.needs_stake(),
            });
        }
    }

    async fn handle_settlement_request(&self, chain_id: ChainId, provider: &Identity, hermes: &HermesId, into_stake: bool) {
        let result = if into_stake {
            self.settle_into_stake(chain_id, provider, hermes).await
        } else {
            self.force_settle(chain_id, provider, hermes).await
        };
        if let Err(e) = result {
            tracing::error!(provider = %provider, into_stake, error = %e, "requested settlement failed");
        }
    }

    pub fn stop(&self) {
        if self.stop.stop() {
            tracing::info!("settlement scheduler stopped");
        }
    }

    pub fn subscribe(self: &Arc<Self>, bus: &EventBus) {
        bus.subscribe_weak(Topic::Node, self, |settler, event| async move {
            match event {
                AppEvent::Node(NodeStatus::Started) => settler.load_known_providers().await,
                AppEvent::Node(NodeStatus::Stopped) => settler.stop(),
                _ => {}
            }
        });
        bus.subscribe_weak(Topic::ServiceStatus, self, |settler, event| async move {
            if let AppEvent::ServiceStatus { provider, running: true } = event {
                let chain_id = settler.config.chain_id;
                if let Err(e) = settler.load_initial_state(chain_id, &provider).await {
                    tracing::error!(provider = %provider, error = %e, "could not load settlement state");
                }
            }
        });
        bus.subscribe_weak(Topic::IdentityRegistration, self, |settler, event| async move {
            if let AppEvent::IdentityRegistration {
                identity,
                status: RegistrationStatus::Registered,
                ..
            } = event
            {
                settler.set_registered(&identity);
            }
        });
        bus.subscribe_weak(Topic::HermesPromiseReceived, self, |settler, event| async move {
            if let AppEvent::HermesPromiseReceived { promise, provider, hermes_id } = event {
                settler
                    .handle_promise_received(promise.promise.chain_id, &provider, &hermes_id)
                    .await;
            }
        });
        bus.subscribe_weak(Topic::SettlementRequest, self, |settler, event| async move {
            if let AppEvent::SettlementRequest { chain_id, provider, hermes_id, into_stake } = event {
                settler
                    .handle_settlement_request(chain_id, &provider, &hermes_id, into_stake)
                    .await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_chain::{ChainError, ProviderChannel};
    use tollgate_crypto::Keyring;
    use tollgate_hermes::{HermesCause, HermesError};
    use tollgate_nullables::{
        NullBlockchain, NullHermes, NullHermesResolver, NullRegistry, NullSigner, NullTransactor,
        SettleKind,
    };
    use tollgate_store::MemoryKv;

    const CHAIN: ChainId = 137;
    const L1: ChainId = 1;

    fn provider() -> Identity {
        Identity::new("0x00000000000000000000000000000000000000a1")
    }

    fn hermes() -> HermesId {
        HermesId::new("0x00000000000000000000000000000000000000b2")
    }

    fn inactive() -> Vec<HermesId> {
        vec![
            HermesId::new("0x00000000000000000000000000000000000000d1"),
            HermesId::new("0x00000000000000000000000000000000000000d2"),
        ]
    }

    fn beneficiary() -> Address {
        Address::new("0x00000000000000000000000000000000000000e5")
    }

    struct Fixture {
        settler: Arc<SettlementScheduler>,
        handler: Arc<PromiseHandler>,
        bus: Arc<EventBus>,
        channels: Arc<ChannelRepository>,
        chain: Arc<NullBlockchain>,
        transactor: Arc<NullTransactor>,
        hermes: Arc<NullHermes>,
        registry: Arc<NullRegistry>,
        promises: Arc<PromiseStore>,
        metrics: Arc<PaymentsMetrics>,
    }

    fn fixture_with(transactor: NullTransactor, chain: Arc<NullBlockchain>, max_wait: Duration) -> Fixture {
        let transactor = Arc::new(transactor);
        let hermes_api = Arc::new(NullHermes::default());
        let registry = Arc::new(NullRegistry::new());
        let deps = Collaborators {
            chain: chain.clone(),
            transactor: transactor.clone(),
            registry: registry.clone(),
            hermes: Arc::new(
                NullHermesResolver::new(hermes(), hermes_api.clone()).with_inactive(inactive()),
            ),
            encryptor: Arc::new(Keyring::new()),
            signer: Arc::new(NullSigner::new()),
        };
        let kv = Arc::new(MemoryKv::new());
        let promises = Arc::new(PromiseStore::new(kv.clone()));
        let bus = Arc::new(EventBus::new());
        let metrics = Arc::new(PaymentsMetrics::new().unwrap());
        let channels = Arc::new(ChannelRepository::new(
            &deps,
            promises.clone(),
            bus.clone(),
            vec![CHAIN],
        ));
        let handler = Arc::new(PromiseHandler::new(
            &deps,
            promises.clone(),
            bus.clone(),
            metrics.clone(),
            vec![CHAIN, L1],
            8,
        ));
        let settler = Arc::new(SettlementScheduler::new(
            &deps,
            channels.clone(),
            handler.clone(),
            promises.clone(),
            Arc::new(SettlementHistoryStore::new(kv)),
            bus.clone(),
            metrics.clone(),
            SettlerConfig {
                threshold: 0.1,
                max_wait_for_settlement: max_wait,
                chain_id: CHAIN,
                chains: vec![CHAIN],
                l1_chain_id: L1,
                withdrawal_retry_interval: Duration::from_secs(30),
                withdrawal_retries: 3,
            },
        ));
        Fixture {
            settler,
            handler,
            bus,
            channels,
            chain,
            transactor,
            hermes: hermes_api,
            registry,
            promises,
            metrics,
        }
    }

    /// Settlements are mined as soon as they are sent.
    fn fixture() -> Fixture {
        let chain = Arc::new(NullBlockchain::new());
        let transactor = NullTransactor::new().settling_on(chain.clone());
        fixture_with(transactor, chain, Duration::from_secs(60))
    }

    fn registered(f: &Fixture) {
        f.settler.set_registered(&provider());
    }

    /// A channel holding `available` of which `promised` has been promised.
    async fn cache_channel(f: &Fixture, available: u128, promised: u128, stake: u128) -> Channel {
        cache_channel_with_goal(f, &hermes(), available, promised, stake, stake).await
    }

    async fn cache_channel_with_goal(
        f: &Fixture,
        hermes: &HermesId,
        available: u128,
        promised: u128,
        stake: u128,
        stake_goal: u128,
    ) -> Channel {
        f.chain.set_provider_channel(
            CHAIN,
            hermes,
            &provider(),
            ProviderChannel {
                balance: TokenAmount::new(available),
                stake: TokenAmount::new(stake),
                stake_goal: TokenAmount::new(stake_goal),
                ..Default::default()
            },
        );
        let mut promise = Channel::empty_promise(CHAIN, &provider(), hermes);
        promise.promise.amount = TokenAmount::new(promised);
        promise.r = "aa".into();
        let _ = f.promises.store(&promise);
        f.channels.fetch(CHAIN, &provider(), hermes).await.unwrap()
    }

    fn provider_balance(f: &Fixture, balance: u128) {
        f.hermes.set_provider_data(
            CHAIN,
            tollgate_hermes::ProviderData {
                identity: provider(),
                balance: TokenAmount::new(balance),
                ..Default::default()
            },
        );
    }

    #[tokio::test]
    async fn threshold_requires_both_conditions() {
        let f = fixture();
        registered(&f);
        let staked = ONE_TOKEN;

        let channel = cache_channel(&f, 10_000, 9_000, staked).await;
        assert!(f.settler.needs_settling(0.1, &channel));

        let mut channel = channel;
        channel.last_promise.promise.amount = TokenAmount::new(8_999);
        assert!(!f.settler.needs_settling(0.1, &channel));
    }

    #[tokio::test]
    async fn zero_stake_dust_is_not_settled() {
        let f = fixture();
        registered(&f);
        let channel = cache_channel(&f, ONE_TOKEN, ONE_TOKEN - 1, 0).await;
        assert!(!f.settler.needs_settling(0.0, &channel));

        let channel = cache_channel(&f, ONE_TOKEN, ONE_TOKEN, 0).await;
        assert!(f.settler.needs_settling(0.1, &channel));
    }

    #[tokio::test]
    async fn unregistered_or_settling_never_needs_settling() {
        let f = fixture();
        let channel = cache_channel(&f, 10_000, 9_000, ONE_TOKEN).await;
        assert!(!f.settler.needs_settling(0.1, &channel));

        registered(&f);
        let _guard = f.settler.begin_settling(&provider()).unwrap();
        assert!(!f.settler.needs_settling(0.1, &channel));
    }

    #[tokio::test]
    async fn initial_state_only_for_registered() {
        let f = fixture();
        f.settler.load_initial_state(CHAIN, &provider()).await.unwrap();
        assert_eq!(f.settler.state(&provider()), None);

        f.registry
            .set_status(CHAIN, &provider(), RegistrationStatus::Registered);
        f.settler.load_initial_state(CHAIN, &provider()).await.unwrap();
        f.settler.load_initial_state(CHAIN, &provider()).await.unwrap();
        assert_eq!(f.settler.state(&provider()), Some(SettlementState::Registered));
    }

    #[tokio::test]
    async fn initial_state_loads_over_an_unregistered_entry() {
        let f = fixture();
        let settling = f.settler.begin_settling(&provider()).unwrap();
        f.registry
            .set_status(CHAIN, &provider(), RegistrationStatus::Registered);

        f.settler.load_initial_state(CHAIN, &provider()).await.unwrap();
        assert_eq!(
            f.settler.state(&provider()),
            Some(SettlementState::Settling { registered: true })
        );
        drop(settling);
        assert_eq!(f.settler.state(&provider()), Some(SettlementState::Registered));
    }

    #[tokio::test]
    async fn settle_records_history_and_restores_state() {
        let f = fixture();
        registered(&f);
        cache_channel(&f, 10_000, 9_000, ONE_TOKEN).await;

        f.settler
            .force_settle(CHAIN, &provider(), &hermes())
            .await
            .unwrap();

        let calls = f.transactor.settlements();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, SettleKind::Rebalance);
        assert_eq!(calls[0].promise.r, vec![0xaa]);

        let history = f.settler.settlement_history(&HistoryFilter::default()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].amount, TokenAmount::new(9_000));
        assert!(history[0]
            .block_explorer_url
            .starts_with("https://polygonscan.com/tx/0x"));
        assert_eq!(f.settler.state(&provider()), Some(SettlementState::Registered));
        assert_eq!(f.chain.live_subscriptions(), 0);
        assert_eq!(f.metrics.settlements_completed.get(), 1);
    }

    #[tokio::test]
    async fn concurrent_settlements_are_exclusive() {
        let chain = Arc::new(NullBlockchain::new());
        let f = fixture_with(NullTransactor::new(), chain, Duration::from_secs(60));
        registered(&f);
        cache_channel(&f, 10_000, 9_000, ONE_TOKEN).await;

        let (provider, hermes) = (provider(), hermes());
        let (a, b) = tokio::join!(
            f.settler.force_settle(CHAIN, &provider, &hermes),
            async {
                let second = f.settler.force_settle(CHAIN, &provider, &hermes).await;
                f.chain.emit_settled(
                    CHAIN,
                    &provider,
                    &hermes,
                    PromiseSettledEvent {
                        tx_hash: "0x01".into(),
                        amount_sent_to_beneficiary: TokenAmount::new(9_000),
                        ..Default::default()
                    },
                );
                second
            },
        );
        assert!(a.is_ok());
        assert!(matches!(b, Err(PaymentsError::AlreadySettling(_))));
        assert_eq!(f.transactor.settlements().len(), 1);
    }

    #[tokio::test]
    async fn missing_channel_is_nothing_to_settle() {
        let f = fixture();
        let err = f
            .settler
            .settle_into_stake(CHAIN, &provider(), &hermes())
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentsError::NothingToSettle(_)));
    }

    #[tokio::test]
    async fn zero_amount_is_skipped() {
        let f = fixture();
        registered(&f);
        cache_channel(&f, 10_000, 0, ONE_TOKEN).await;
        f.settler
            .force_settle(CHAIN, &provider(), &hermes())
            .await
            .unwrap();
        assert!(f.transactor.settlements().is_empty());
    }

    #[tokio::test]
    async fn fees_above_earnings_are_refused() {
        let f = fixture();
        registered(&f);
        f.chain.set_hermes_fee(2_000);
        cache_channel(&f, 10_000, 100, ONE_TOKEN).await;
        f.transactor.set_fees(FeesResponse {
            fee: TokenAmount::new(90),
            valid_until: Timestamp::now().saturating_add(Duration::from_secs(600)),
        });

        let err = f
            .settler
            .force_settle(CHAIN, &provider(), &hermes())
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentsError::FeeNotCovered { .. }));
        assert_eq!(f.hermes.fee_updates(), 1);
        assert!(f.transactor.settlements().is_empty());
        assert_eq!(f.settler.state(&provider()), Some(SettlementState::Registered));
    }

    #[tokio::test]
    async fn classified_fee_update_error_aborts() {
        let f = fixture();
        registered(&f);
        cache_channel(&f, 10_000, 9_000, ONE_TOKEN).await;
        f.transactor.set_fees(FeesResponse {
            fee: TokenAmount::new(1),
            valid_until: Timestamp::now().saturating_add(Duration::from_secs(600)),
        });
        f.hermes
            .fail_fee_updates(HermesError::remote(HermesCause::Internal, "boom"));
        assert!(f.settler.force_settle(CHAIN, &provider(), &hermes()).await.is_err());

        f.hermes
            .fail_fee_updates(HermesError::Transport("connection reset".into()));
        f.settler
            .force_settle(CHAIN, &provider(), &hermes())
            .await
            .unwrap();
        assert_eq!(f.transactor.settlements()[0].promise.fee, TokenAmount::ZERO);
    }

    #[tokio::test]
    async fn transactor_failure_cancels_subscription() {
        let f = fixture();
        registered(&f);
        cache_channel(&f, 10_000, 9_000, ONE_TOKEN).await;
        f.transactor
            .fail_settlements(ChainError::Transactor("queue full".into()));

        let err = f
            .settler
            .force_settle(CHAIN, &provider(), &hermes())
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentsError::Chain(_)));
        assert_eq!(f.chain.live_subscriptions(), 0);
        assert_eq!(f.metrics.settlement_failures.get(), 1);

        let history = f.settler.settlement_history(&HistoryFilter::default()).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].tx_hash.is_empty());
        assert!(history[0].error.contains("queue full"));
        assert!(!history[0].is_withdrawal);
    }

    #[tokio::test(start_paused = true)]
    async fn unobserved_settlement_times_out() {
        let chain = Arc::new(NullBlockchain::new());
        let f = fixture_with(NullTransactor::new(), chain, Duration::from_secs(30));
        registered(&f);
        cache_channel(&f, 10_000, 9_000, ONE_TOKEN).await;

        let err = f
            .settler
            .settle_with_beneficiary(CHAIN, &provider(), &hermes(), Address::zero())
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentsError::SettleTimeout));
        assert_eq!(f.metrics.settlement_timeouts.get(), 1);
        assert_eq!(f.settler.state(&provider()), Some(SettlementState::Registered));
    }

    #[tokio::test]
    async fn stop_ends_wait_without_error() {
        let chain = Arc::new(NullBlockchain::new());
        let f = fixture_with(NullTransactor::new(), chain, Duration::from_secs(3600));
        registered(&f);
        cache_channel(&f, 10_000, 9_000, ONE_TOKEN).await;

        let (provider, hermes) = (provider(), hermes());
        let settle = f.settler.force_settle(CHAIN, &provider, &hermes);
        let stopper = async {
            while f.transactor.settlements().is_empty() {
                tokio::task::yield_now().await;
            }
            f.settler.stop();
        };
        let (result, ()) = tokio::join!(settle, stopper);
        result.unwrap();
        assert!(f.settler.settlement_history(&HistoryFilter::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn promise_below_stake_goal_settles_into_stake() {
        let f = fixture();
        f.settler.subscribe(&f.bus);
        registered(&f);
        let channel =
            cache_channel_with_goal(&f, &hermes(), 10_000, 9_000, ONE_TOKEN, 2 * ONE_TOKEN).await;

        f.bus.publish(AppEvent::HermesPromiseReceived {
            promise: channel.last_promise.clone(),
            provider: provider(),
            hermes_id: hermes(),
        });
        for _ in 0..1000 {
            if !f.transactor.settlements().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let calls = f.transactor.settlements();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, SettleKind::IntoStake);
    }

    #[tokio::test]
    async fn force_settle_many_skips_uncovered_fees() {
        let f = fixture();
        registered(&f);
        let [first, second] = [inactive()[0].clone(), inactive()[1].clone()];
        cache_channel_with_goal(&f, &first, 10_000, 9_000, ONE_TOKEN, ONE_TOKEN).await;
        cache_channel_with_goal(&f, &second, 10_000, 0, ONE_TOKEN, ONE_TOKEN).await;

        f.settler
            .force_settle_inactive_hermeses(CHAIN, &provider())
            .await
            .unwrap();
        let calls = f.transactor.settlements();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].hermes, first);
    }

    #[tokio::test]
    async fn force_settle_many_fails_when_no_fee_is_covered() {
        let f = fixture();
        registered(&f);
        f.chain.set_hermes_fee(2_000);
        f.transactor.set_fees(FeesResponse {
            fee: TokenAmount::new(90),
            valid_until: Timestamp::now().saturating_add(Duration::from_secs(600)),
        });
        for hermes in inactive() {
            cache_channel_with_goal(&f, &hermes, 10_000, 100, ONE_TOKEN, ONE_TOKEN).await;
        }
        let err = f
            .settler
            .force_settle_many(CHAIN, &provider(), &inactive())
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentsError::FeeNotCoveredForAll));
        assert!(f.transactor.settlements().is_empty());
    }

    #[tokio::test]
    async fn withdraw_pays_out_the_self_promise() {
        let f = fixture();
        f.handler.start();
        provider_balance(&f, 7_000);
        let requested = Arc::new(Mutex::new(Vec::new()));
        let seen = requested.clone();
        f.bus.subscribe(Topic::WithdrawalRequested, move |event| {
            if let AppEvent::WithdrawalRequested { chain_id, .. } = event {
                lock(&seen).push(*chain_id);
            }
        });

        f.settler
            .withdraw(CHAIN, None, &provider(), &hermes(), &beneficiary(), None)
            .await
            .unwrap();

        let requests = f.hermes.requests();
        assert_eq!(requests.len(), 1);
        let message = &requests[0].exchange_message;
        assert_eq!(message.chain_id, L1);
        assert_eq!(message.promise.chain_id, CHAIN);
        assert_eq!(message.agreement_total, TokenAmount::new(7_000));
        assert!(!message.signature.is_empty());

        let calls = f.transactor.settlements();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, SettleKind::PayAndSettle);
        assert_eq!(calls[0].chain_id, L1);
        assert_eq!(calls[0].beneficiary, Some(beneficiary()));
        assert!(!calls[0].beneficiary_signature.is_empty());
        assert_eq!(*lock(&requested), vec![CHAIN]);

        let history = f.settler.settlement_history(&HistoryFilter::default()).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_withdrawal);
        assert_eq!(
            history[0].channel_address,
            pay_and_settle_channel_id(&provider(), &hermes())
        );
        assert_eq!(f.settler.state(&provider()), Some(SettlementState::Unregistered));
    }

    #[tokio::test]
    async fn withdrawal_without_amount_is_capped() {
        let f = fixture();
        f.handler.start();
        provider_balance(&f, 2 * MAX_WITHDRAWAL);
        f.settler
            .withdraw(CHAIN, Some(L1), &provider(), &hermes(), &beneficiary(), None)
            .await
            .unwrap();
        assert_eq!(
            f.hermes.requests()[0].exchange_message.agreement_total,
            TokenAmount::new(MAX_WITHDRAWAL)
        );
    }

    #[tokio::test]
    async fn withdrawal_checks_chain_and_fee() {
        let f = fixture();
        provider_balance(&f, 100);
        let err = f
            .settler
            .withdraw(L1, None, &provider(), &hermes(), &beneficiary(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaymentsError::WrongWithdrawalChain { requested: L1, allowed: CHAIN }
        ));

        f.transactor.set_fees(FeesResponse {
            fee: TokenAmount::new(101),
            valid_until: Timestamp::now().saturating_add(Duration::from_secs(600)),
        });
        let err = f
            .settler
            .withdraw(CHAIN, None, &provider(), &hermes(), &beneficiary(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentsError::WithdrawalTooSmall { .. }));
        assert!(f.hermes.requests().is_empty());
        assert_eq!(f.settler.state(&provider()), Some(SettlementState::Unregistered));
    }

    #[tokio::test]
    async fn unchanged_withdrawal_promise_is_reported() {
        let f = fixture();
        f.handler.start();
        provider_balance(&f, 300);
        f.settler
            .withdraw(CHAIN, None, &provider(), &hermes(), &beneficiary(), None)
            .await
            .unwrap();

        // Hermes answers with the same amount, which the store keeps out.
        let err = f
            .settler
            .withdraw(CHAIN, None, &provider(), &hermes(), &beneficiary(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentsError::PromiseNotUpdated));
        assert_eq!(f.transactor.settlements().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn withdrawal_retries_transactor_conflicts() {
        let f = fixture();
        f.handler.start();
        provider_balance(&f, 300);
        let conflict = ChainError::TransactorStatus {
            status: 409,
            message: "nonce in use".into(),
        };
        f.transactor.push_settle_result(Err(conflict.clone()));
        f.transactor.push_settle_result(Err(conflict));

        f.settler
            .withdraw(CHAIN, None, &provider(), &hermes(), &beneficiary(), None)
            .await
            .unwrap();
        assert_eq!(f.transactor.settle_attempts(), 3);
        assert_eq!(f.transactor.settlements().len(), 1);
    }

    #[tokio::test]
    async fn rejected_withdrawal_is_kept_in_history() {
        let f = fixture();
        f.handler.start();
        provider_balance(&f, 300);
        f.transactor.push_settle_result(Err(ChainError::TransactorStatus {
            status: 400,
            message: "bad beneficiary".into(),
        }));

        let err = f
            .settler
            .withdraw(CHAIN, None, &provider(), &hermes(), &beneficiary(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentsError::Chain(_)));
        assert_eq!(f.transactor.settle_attempts(), 1);

        let history = f.settler.settlement_history(&HistoryFilter::default()).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_withdrawal);
        assert!(history[0].error.contains("bad beneficiary"));
        assert_eq!(f.chain.live_subscriptions(), 0);
    }

    #[tokio::test]
    async fn latest_withdrawal_can_be_checked_and_retried() {
        let f = fixture();
        f.handler.start();
        provider_balance(&f, 300);
        f.transactor.push_settle_result(Err(ChainError::TransactorStatus {
            status: 400,
            message: "rejected".into(),
        }));
        assert!(f
            .settler
            .withdraw(CHAIN, None, &provider(), &hermes(), &beneficiary(), None)
            .await
            .is_err());

        f.chain.set_withdrawal_channel(
            L1,
            &hermes(),
            &provider(),
            ProviderChannel {
                settled: TokenAmount::new(100),
                ..Default::default()
            },
        );
        let (unpaid, channel_id) = f
            .settler
            .check_latest_withdrawal(L1, &provider(), &hermes())
            .await
            .unwrap();
        assert_eq!(unpaid, TokenAmount::new(200));
        assert_eq!(channel_id, pay_and_settle_channel_id(&provider(), &hermes()));

        f.settler
            .retry_withdraw_latest(L1, unpaid, &channel_id, &beneficiary(), &provider())
            .await
            .unwrap();
        assert_eq!(f.hermes.requests().len(), 1);
        let calls = f.transactor.settlements();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, SettleKind::PayAndSettle);
    }

    #[test]
    fn explorer_urls() {
        assert_eq!(
            explorer_url(1, "0xabc").as_deref(),
            Some("https://etherscan.io/tx/0xabc")
        );
        assert_eq!(
            explorer_url(80001, "0x1").as_deref(),
            Some("https://mumbai.polygonscan.com/tx/0x1")
        );
        assert_eq!(explorer_url(42, "0x1"), None);
        assert_eq!(explorer_url(137, ""), None);
    }
}
