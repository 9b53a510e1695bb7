//! Consumer balance tracking.
//!
//! A consumer's spendable balance comes from one of three places: hermes'
//! books for off-chain identities, the consumer channel contract once it is
//! opened, or the registration bounty (or raw token balance) while the
//! channel does not exist yet. [`BalanceTracker`] reconciles them into a
//! cache keyed by (chain, identity) and keeps it fresh with background jobs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tollgate_chain::{
    BlockchainView, ChainError, RegistrationStatusProvider, TokenTransfer, Transactor,
    TransactorRegistration, TransactorRegistrationState,
};
use tollgate_crypto::consumer_channel_address;
use tollgate_hermes::{ConsumerData, HermesCause, HermesError, HermesResolver};
use tollgate_store::ConsumerTotalsStore;
use tollgate_types::{
    Address, ChainId, HermesId, Identity, RegistrationStatus, Timestamp, TokenAmount,
};
use tollgate_utils::{format_duration, Attempt, RetryPolicy, StopSignal};

use crate::balance::ConsumerBalance;
use crate::config::PaymentsConfig;
use crate::events::{AppEvent, EventBus, NodeStatus, Topic};
use crate::job::JobSyncer;
use crate::metrics::PaymentsMetrics;
use crate::payments::Collaborators;
use crate::PaymentsError;

/// Below this many raw units a cached balance is re-synced before use.
const DUST_THRESHOLD: u128 = 1_000_000_000;

type BalanceKey = (ChainId, Identity);

fn hermes_align_retry() -> RetryPolicy {
    RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(15), 4)
}

fn grand_total_recovery_retry() -> RetryPolicy {
    RetryPolicy::exponential(Duration::from_secs(2), Duration::from_secs(20), 10)
}

/// Pause before re-subscribing to channel transfers after the stream ended.
const TRANSFER_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

fn registration_retry() -> RetryPolicy {
    RetryPolicy::constant(Duration::from_millis(500), 10)
}

/// Timing knobs, taken from [`PaymentsConfig`].
#[derive(Clone, Debug)]
pub struct BalanceSyncConfig {
    pub offchain_expiration: Duration,
    pub force_update_throttle: Duration,
    pub aggressive_timeout: Duration,
    pub aggressive_interval: Duration,
    pub lifetime_timeout: Duration,
    pub lifetime_interval: Duration,
    /// Sender of free-registration top-ups, which must not move the balance.
    pub transactor_address: Address,
}

impl From<&PaymentsConfig> for BalanceSyncConfig {
    fn from(config: &PaymentsConfig) -> Self {
        Self {
            offchain_expiration: config.offchain_balance_expiration(),
            force_update_throttle: config.force_update_throttle(),
            aggressive_timeout: config.aggressive_sync_timeout(),
            aggressive_interval: config.aggressive_sync_interval(),
            lifetime_timeout: config.lifetime_sync_timeout(),
            lifetime_interval: config.lifetime_sync_interval(),
            transactor_address: config.transactor_address.clone(),
        }
    }
}

/// Outcome of asking hermes about a consumer.
enum HermesAlignment {
    /// Hermes owns the balance; the cache now holds its figures.
    Offchain(TokenAmount),
    /// The balance lives on chain. Carries hermes' data when it had any.
    Onchain(Option<ConsumerData>),
}

pub struct BalanceTracker {
    me: Weak<Self>,
    chain: Arc<dyn BlockchainView>,
    transactor: Arc<dyn Transactor>,
    registry: Arc<dyn RegistrationStatusProvider>,
    hermes: Arc<dyn HermesResolver>,
    totals: Arc<ConsumerTotalsStore>,
    bus: Arc<EventBus>,
    metrics: Arc<PaymentsMetrics>,
    config: BalanceSyncConfig,
    balances: Mutex<HashMap<BalanceKey, ConsumerBalance>>,
    bounties: Mutex<HashMap<BalanceKey, TokenAmount>>,
    last_forced: Mutex<HashMap<BalanceKey, Instant>>,
    watched: Mutex<HashSet<BalanceKey>>,
    jobs: JobSyncer,
    stop: StopSignal,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BalanceTracker {
    pub fn new(
        deps: &Collaborators,
        totals: Arc<ConsumerTotalsStore>,
        bus: Arc<EventBus>,
        metrics: Arc<PaymentsMetrics>,
        config: BalanceSyncConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            chain: deps.chain.clone(),
            transactor: deps.transactor.clone(),
            registry: deps.registry.clone(),
            hermes: deps.hermes.clone(),
            totals,
            bus,
            metrics,
            config,
            balances: Mutex::new(HashMap::new()),
            bounties: Mutex::new(HashMap::new()),
            last_forced: Mutex::new(HashMap::new()),
            watched: Mutex::new(HashSet::new()),
            jobs: JobSyncer::new(),
            stop: StopSignal::new(),
        })
    }

    /// Cached spendable balance, zero when nothing is known.
    pub fn get_balance(&self, chain_id: ChainId, identity: &Identity) -> TokenAmount {
        lock(&self.balances)
            .get(&(chain_id, identity.clone()))
            .map(ConsumerBalance::get_balance)
            .unwrap_or_default()
    }

    /// The full cache entry.
    pub fn entry(&self, chain_id: ChainId, identity: &Identity) -> Option<ConsumerBalance> {
        lock(&self.balances).get(&(chain_id, identity.clone())).cloned()
    }

    /// Whether the cached balance should not be trusted as is.
    pub fn needs_force_sync(&self, chain_id: ChainId, identity: &Identity) -> bool {
        let balances = lock(&self.balances);
        let Some(entry) = balances.get(&(chain_id, identity.clone())) else {
            return true;
        };
        entry.is_stale(self.config.offchain_expiration, Timestamp::now())
            || entry.bc_balance.raw() < DUST_THRESHOLD
    }

    /// Like [`BalanceTracker::force_balance_update`], at most once per throttle
    /// window per identity. Inside the window the cached balance is returned.
    pub async fn force_balance_update_cached(
        &self,
        chain_id: ChainId,
        identity: &Identity,
    ) -> TokenAmount {
        let key = (chain_id, identity.clone());
        {
            let mut last = lock(&self.last_forced);
            if last
                .get(&key)
                .is_some_and(|at| at.elapsed() < self.config.force_update_throttle)
            {
                return self.get_balance(chain_id, identity);
            }
            last.insert(key, Instant::now());
        }
        self.force_balance_update(chain_id, identity).await
    }

    /// Rebuild the balance from hermes, the chain and the stored grand total.
    ///
    /// Never fails: when a source is unavailable the previous balance is
    /// returned and the failure logged.
    pub async fn force_balance_update(&self, chain_id: ChainId, identity: &Identity) -> TokenAmount {
        let fallback = self.get_balance(chain_id, identity);
        let hermes = match self.hermes.active_hermes(chain_id) {
            Ok(hermes) => hermes,
            Err(e) => {
                tracing::error!(chain_id, error = %e, "could not resolve active hermes");
                return fallback;
            }
        };

        let hermes_data = match self.align_with_hermes(chain_id, identity, &hermes).await {
            HermesAlignment::Offchain(balance) => return balance,
            HermesAlignment::Onchain(data) => data,
        };

        let address = consumer_channel_address(identity, &hermes);
        let channel = match self.chain.get_consumer_channel(chain_id, &address).await {
            Ok(channel) => channel,
            Err(ChainError::ChannelNotFound(_)) => {
                let bounty = self.bounty(chain_id, identity);
                let balance = match bounty {
                    Some(bounty) => bounty,
                    None => self.unregistered_balance(chain_id, identity, &hermes).await,
                };
                tracing::debug!(chain_id, identity = %identity, %balance, "consumer channel not opened yet");
                return self.set_balance(
                    chain_id,
                    identity,
                    ConsumerBalance {
                        bc_balance: balance,
                        ..Default::default()
                    },
                );
            }
            Err(e) => {
                tracing::error!(chain_id, identity = %identity, error = %e, "could not get consumer channel");
                return fallback;
            }
        };

        let grand_total = self
            .reconcile_grand_total(chain_id, identity, &hermes, hermes_data)
            .await;
        self.set_balance(
            chain_id,
            identity,
            ConsumerBalance {
                bc_balance: channel.balance,
                bc_settled: channel.settled,
                grand_total_promised: grand_total,
                ..Default::default()
            },
        )
    }

    async fn align_with_hermes(
        &self,
        chain_id: ChainId,
        identity: &Identity,
        hermes: &HermesId,
    ) -> HermesAlignment {
        let api = match self.hermes.caller(chain_id, hermes) {
            Ok(api) => api,
            Err(e) => {
                tracing::warn!(chain_id, hermes = %hermes, error = %e, "no hermes client, using consumer channel");
                return HermesAlignment::Onchain(None);
            }
        };

        let api = &api;
        let result = hermes_align_retry()
            .run_until(Some(&self.stop), move || async move {
                api.get_consumer_data(chain_id, identity)
                    .await
                    .map_err(|e| match e {
                        e if e.is(HermesCause::NotFound) => Attempt::Abort(e),
                        e @ HermesError::Decode(_) => Attempt::Abort(e),
                        e => Attempt::Retry(e),
                    })
            })
            .await;

        let data = match result {
            Ok(data) => data,
            Err(e) => {
                match e.into_inner() {
                    Some(e) if e.is(HermesCause::NotFound) => {}
                    Some(e) => {
                        tracing::warn!(chain_id, identity = %identity, error = %e, "syncing balance with hermes failed, will try consumer channel");
                    }
                    None => {}
                }
                return HermesAlignment::Onchain(None);
            }
        };

        if !data.is_offchain {
            return HermesAlignment::Onchain(Some(data));
        }

        let balance = self.set_balance(
            chain_id,
            identity,
            ConsumerBalance {
                bc_balance: data.balance,
                bc_settled: data.settled,
                grand_total_promised: data.latest_promise.amount,
                is_offchain: true,
                last_offchain_sync: Timestamp::now(),
            },
        );
        HermesAlignment::Offchain(balance)
    }

    /// The larger of the stored grand total and what hermes last saw
    /// promised. Hermes being ahead means promises were missed locally, so the
    /// store catches up.
    async fn reconcile_grand_total(
        &self,
        chain_id: ChainId,
        identity: &Identity,
        hermes: &HermesId,
        hermes_data: Option<ConsumerData>,
    ) -> TokenAmount {
        let stored = match self.totals.get(chain_id, identity, hermes) {
            Ok(total) => Some(total),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                tracing::error!(chain_id, identity = %identity, error = %e, "could not read grand total");
                None
            }
        };

        let from_hermes = match hermes_data {
            Some(data) => Some(data.latest_promise.amount),
            None if stored.is_none() => self.hermes_promised(chain_id, identity, hermes).await,
            None => None,
        };

        let total = stored.unwrap_or_default().max(from_hermes.unwrap_or_default());
        let hermes_ahead = match (stored, from_hermes) {
            (Some(stored), Some(promised)) => promised > stored,
            (None, Some(_)) => true,
            _ => false,
        };
        if hermes_ahead {
            if let Err(e) = self.totals.store(chain_id, identity, hermes, total) {
                tracing::error!(chain_id, identity = %identity, error = %e, "could not store grand total");
            }
        }
        total
    }

    /// What hermes last saw promised by the consumer. Zero when hermes does
    /// not know the consumer, `None` when it could not be asked.
    async fn hermes_promised(
        &self,
        chain_id: ChainId,
        identity: &Identity,
        hermes: &HermesId,
    ) -> Option<TokenAmount> {
        let api = match self.hermes.caller(chain_id, hermes) {
            Ok(api) => api,
            Err(e) => {
                tracing::warn!(chain_id, hermes = %hermes, error = %e, "no hermes client");
                return None;
            }
        };

        let api = &api;
        let result = grand_total_recovery_retry()
            .run_until(Some(&self.stop), move || async move {
                match api.get_consumer_data(chain_id, identity).await {
                    Ok(data) => Ok(data.latest_promise.amount),
                    Err(e) if e.is(HermesCause::NotFound) => Ok(TokenAmount::ZERO),
                    Err(e) => Err(Attempt::Retry(e)),
                }
            })
            .await;

        match result {
            Ok(promised) => {
                tracing::debug!(chain_id, identity = %identity, %promised, "loaded hermes grand total");
                Some(promised)
            }
            Err(e) => {
                if let Some(e) = e.into_inner() {
                    tracing::error!(chain_id, identity = %identity, error = %e, "could not recover grand total");
                }
                None
            }
        }
    }

    /// Seed the stored grand total from hermes, never lowering it.
    pub async fn recover_grand_total(&self, chain_id: ChainId, identity: &Identity) -> Result<(), PaymentsError> {
        let hermes = self.hermes.active_hermes(chain_id)?;
        let Some(promised) = self.hermes_promised(chain_id, identity, &hermes).await else {
            return Ok(());
        };
        let stored = match self.totals.get(chain_id, identity, &hermes) {
            Ok(total) => Some(total),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        if stored.map_or(true, |stored| promised > stored) {
            self.totals.store(chain_id, identity, &hermes, promised)?;
        }
        Ok(())
    }

    async fn unregistered_balance(
        &self,
        chain_id: ChainId,
        identity: &Identity,
        hermes: &HermesId,
    ) -> TokenAmount {
        let address = consumer_channel_address(identity, hermes);
        match self.chain.get_token_balance(chain_id, &address).await {
            Ok(balance) => balance,
            Err(e) => {
                tracing::error!(chain_id, address = %address, error = %e, "could not get token balance of consumer channel");
                TokenAmount::ZERO
            }
        }
    }

    fn bounty(&self, chain_id: ChainId, identity: &Identity) -> Option<TokenAmount> {
        lock(&self.bounties).get(&(chain_id, identity.clone())).copied()
    }

    /// Provisional balance while a registration is being mined.
    ///
    /// Only applies when nothing non-zero is cached yet. The bounty the
    /// transactor grants, or the raw channel balance without one, stands in
    /// until the channel contract can be read.
    pub async fn align_with_transactor(&self, chain_id: ChainId, identity: &Identity) {
        let known = lock(&self.balances)
            .get(&(chain_id, identity.clone()))
            .is_some_and(|entry| !entry.bc_balance.is_zero());
        if known {
            return;
        }

        let registration = match self.registration(chain_id, identity).await {
            Ok(registration) => registration,
            Err(e) => {
                tracing::error!(chain_id, identity = %identity, error = %e, "could not fetch registration status from transactor");
                return;
            }
        };
        if !matches!(
            registration.status,
            TransactorRegistrationState::Created | TransactorRegistrationState::PriceIncreased
        ) {
            return;
        }

        let bounty = if registration.bounty_amount.is_zero() {
            match self.hermes.active_hermes(chain_id) {
                Ok(hermes) => self.unregistered_balance(chain_id, identity, &hermes).await,
                Err(e) => {
                    tracing::error!(chain_id, error = %e, "could not resolve active hermes");
                    TokenAmount::ZERO
                }
            }
        } else {
            registration.bounty_amount
        };

        tracing::debug!(chain_id, identity = %identity, %bounty, "loaded transactor state");
        lock(&self.bounties).insert((chain_id, identity.clone()), bounty);
        self.set_balance(
            chain_id,
            identity,
            ConsumerBalance {
                bc_balance: bounty,
                ..Default::default()
            },
        );
    }

    async fn registration(
        &self,
        chain_id: ChainId,
        identity: &Identity,
    ) -> Result<TransactorRegistration, PaymentsError> {
        let transactor = &self.transactor;
        registration_retry()
            .run_until(Some(&self.stop), move || async move {
                let registrations = transactor
                    .fetch_registration_status(identity)
                    .await
                    .map_err(|e| Attempt::Retry(PaymentsError::from(e)))?;
                registrations
                    .into_iter()
                    .find(|r| r.chain_id == chain_id)
                    .ok_or_else(|| {
                        Attempt::Abort(PaymentsError::NotFound(format!(
                            "registration of {identity} on chain {chain_id}"
                        )))
                    })
            })
            .await
            .map_err(|e| e.into_inner().unwrap_or(PaymentsError::Stopped))
    }

    fn set_balance(&self, chain_id: ChainId, identity: &Identity, balance: ConsumerBalance) -> TokenAmount {
        self.update_balance(chain_id, identity, |entry| *entry = balance)
    }

    /// Apply `update` to the entry and publish the change, if there was one.
    fn update_balance(
        &self,
        chain_id: ChainId,
        identity: &Identity,
        update: impl FnOnce(&mut ConsumerBalance),
    ) -> TokenAmount {
        let (previous, current) = {
            let mut balances = lock(&self.balances);
            let entry = balances.entry((chain_id, identity.clone())).or_default();
            let previous = entry.get_balance();
            update(entry);
            (previous, entry.get_balance())
        };
        self.metrics.balance_updates.inc();

        if previous != current {
            tracing::debug!(chain_id, identity = %identity, %previous, %current, "consumer balance changed");
            self.bus.publish(AppEvent::BalanceChanged {
                chain_id,
                identity: identity.clone(),
                previous,
                current,
            });
        }
        current
    }

    fn is_offchain(&self, chain_id: ChainId, identity: &Identity) -> bool {
        lock(&self.balances)
            .get(&(chain_id, identity.clone()))
            .is_some_and(|entry| entry.is_offchain)
    }

    /// Re-sync the balance every `interval` until `timeout`. A job already
    /// running for the same identity and cadence is extended instead.
    fn start_sync_job(
        &self,
        kind: &str,
        chain_id: ChainId,
        identity: &Identity,
        timeout: Duration,
        interval: Duration,
    ) {
        if self.stop.is_stopped() {
            return;
        }
        let key = format!(
            "{kind}:{chain_id}:{identity}:{}:{}",
            timeout.as_secs(),
            interval.as_secs()
        );
        let me = self.me.clone();
        let target = identity.clone();
        let (_, extended) = self.jobs.periodicly_sync_balance(
            key,
            move |stop: StopSignal| {
                let me = me.clone();
                let identity = target.clone();
                async move {
                    loop {
                        tokio::select! {
                            biased;
                            _ = stop.stopped() => return,
                            _ = tokio::time::sleep(interval) => {}
                        }
                        let Some(tracker) = me.upgrade() else {
                            return;
                        };
                        tracker.force_balance_update(chain_id, &identity).await;
                    }
                }
            },
            timeout,
        );
        tracing::debug!(
            kind,
            chain_id,
            identity = %identity,
            extended,
            every = %format_duration(interval),
            "balance sync job started"
        );
    }

    pub async fn sync_aggressively(&self, chain_id: ChainId, identity: &Identity) {
        self.force_balance_update(chain_id, identity).await;
        self.start_sync_job(
            "aggressive",
            chain_id,
            identity,
            self.config.aggressive_timeout,
            self.config.aggressive_interval,
        );
    }

    async fn handle_registration(&self, chain_id: ChainId, identity: &Identity, status: RegistrationStatus) {
        match status {
            RegistrationStatus::InProgress => self.align_with_transactor(chain_id, identity).await,
            RegistrationStatus::Registered => {
                lock(&self.bounties).remove(&(chain_id, identity.clone()));
                self.force_balance_update(chain_id, identity).await;
            }
            _ => {}
        }
    }

    async fn handle_grand_total_changed(&self, chain_id: ChainId, consumer: &Identity, amount: TokenAmount) {
        let needs_update = lock(&self.balances)
            .get(&(chain_id, consumer.clone()))
            .map_or(true, |entry| {
                entry.is_stale(self.config.offchain_expiration, Timestamp::now())
            });
        if needs_update {
            self.force_balance_update(chain_id, consumer).await;
            return;
        }
        self.update_balance(chain_id, consumer, |entry| entry.grand_total_promised = amount);
    }

    async fn handle_unlock(&self, chain_id: ChainId, identity: &Identity) {
        self.watch_transfers(chain_id, identity);
        if let Err(e) = self.recover_grand_total(chain_id, identity).await {
            tracing::error!(chain_id, identity = %identity, error = %e, "could not recover grand total");
        }

        match self.registry.get_registration_status(chain_id, identity).await {
            Ok(RegistrationStatus::InProgress) => self.align_with_transactor(chain_id, identity).await,
            Ok(_) => {
                self.force_balance_update(chain_id, identity).await;
            }
            Err(e) => {
                tracing::error!(chain_id, identity = %identity, error = %e, "could not get registration status");
                self.force_balance_update(chain_id, identity).await;
            }
        }

        if self.is_offchain(chain_id, identity) {
            return;
        }
        self.start_sync_job(
            "lifetime",
            chain_id,
            identity,
            self.config.lifetime_timeout,
            self.config.lifetime_interval,
        );
    }

    /// Follow token transfers in and out of the consumer channel, once per
    /// identity. Runs until the tracker stops.
    fn watch_transfers(&self, chain_id: ChainId, identity: &Identity) {
        if self.stop.is_stopped() {
            return;
        }
        if !lock(&self.watched).insert((chain_id, identity.clone())) {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let identity = identity.clone();
        tokio::spawn(async move { me.follow_transfers(chain_id, identity).await });
    }

    async fn follow_transfers(&self, chain_id: ChainId, identity: Identity) {
        let hermes = match self.hermes.active_hermes(chain_id) {
            Ok(hermes) => hermes,
            Err(e) => {
                tracing::error!(chain_id, error = %e, "could not resolve active hermes");
                lock(&self.watched).remove(&(chain_id, identity));
                return;
            }
        };
        let channel = consumer_channel_address(&identity, &hermes);

        while !self.stop.is_stopped() {
            match self.chain.subscribe_to_channel_transfers(chain_id, &channel).await {
                Ok(mut transfers) => {
                    tracing::info!(chain_id, channel = %channel, "subscribed to channel transfers");
                    loop {
                        let transfer = tokio::select! {
                            biased;
                            _ = self.stop.stopped() => return,
                            transfer = transfers.recv() => transfer,
                        };
                        let Some(transfer) = transfer else {
                            break;
                        };
                        self.apply_transfer(chain_id, &identity, &channel, transfer).await;
                    }
                    tracing::debug!(chain_id, channel = %channel, "channel transfer stream ended");
                }
                Err(e) => {
                    tracing::warn!(chain_id, channel = %channel, error = %e, "could not subscribe to channel transfers");
                }
            }
            tokio::select! {
                biased;
                _ = self.stop.stopped() => return,
                _ = tokio::time::sleep(TRANSFER_RESUBSCRIBE_DELAY) => {}
            }
        }
    }

    /// Move the cached balance by a transfer touching `channel`.
    async fn apply_transfer(
        &self,
        chain_id: ChainId,
        identity: &Identity,
        channel: &Address,
        transfer: TokenTransfer,
    ) {
        if self.is_free_registration(chain_id, identity, &transfer).await {
            tracing::debug!(chain_id, identity = %identity, value = %transfer.value, "skipping free registration transfer");
            return;
        }
        let value = transfer.value;
        if transfer.to == *channel {
            self.update_balance(chain_id, identity, |entry| entry.bc_balance += value);
        } else {
            self.update_balance(chain_id, identity, |entry| {
                entry.bc_balance = entry.bc_balance - value
            });
        }
    }

    /// A transfer from the transactor of exactly bounty plus registration fee
    /// pays for a free registration and does not belong to the consumer.
    async fn is_free_registration(
        &self,
        chain_id: ChainId,
        identity: &Identity,
        transfer: &TokenTransfer,
    ) -> bool {
        if transfer.from != self.config.transactor_address {
            return false;
        }
        let registration = match self.registration(chain_id, identity).await {
            Ok(registration) => registration,
            Err(e) => {
                tracing::error!(chain_id, identity = %identity, error = %e, "could not fetch registration status from transactor");
                return false;
            }
        };
        let fees = match self.transactor.fetch_registration_fees(chain_id).await {
            Ok(fees) => fees,
            Err(e) => {
                tracing::error!(chain_id, error = %e, "could not fetch registration fees");
                return false;
            }
        };
        registration.bounty_amount + fees.fee == transfer.value
    }

    pub fn stop(&self) {
        if self.stop.stop() {
            tracing::info!("balance tracker stopped");
        }
        self.jobs.stop_all();
    }

    pub fn subscribe(self: &Arc<Self>, bus: &EventBus) {
        bus.subscribe_weak(Topic::SettlementComplete, self, |tracker, event| async move {
            if let AppEvent::SettlementComplete { chain_id, provider, .. } = event {
                tracker.sync_aggressively(chain_id, &provider).await;
            }
        });
        bus.subscribe_weak(Topic::WithdrawalRequested, self, |tracker, event| async move {
            if let AppEvent::WithdrawalRequested { chain_id, provider, .. } = event {
                tracker.sync_aggressively(chain_id, &provider).await;
            }
        });
        bus.subscribe_weak(Topic::OrderUpdated, self, |tracker, event| async move {
            if let AppEvent::OrderUpdated { chain_id, identity, paid: true } = event {
                tracker.sync_aggressively(chain_id, &identity).await;
            }
        });
        bus.subscribe_weak(Topic::IdentityRegistration, self, |tracker, event| async move {
            if let AppEvent::IdentityRegistration { chain_id, identity, status } = event {
                tracker.handle_registration(chain_id, &identity, status).await;
            }
        });
        bus.subscribe_weak(Topic::GrandTotalChanged, self, |tracker, event| async move {
            if let AppEvent::GrandTotalChanged { chain_id, consumer, amount, .. } = event {
                tracker.handle_grand_total_changed(chain_id, &consumer, amount).await;
            }
        });
        bus.subscribe_weak(Topic::IdentityUnlock, self, |tracker, event| async move {
            if let AppEvent::IdentityUnlock { chain_id, identity } = event {
                tracker.handle_unlock(chain_id, &identity).await;
            }
        });
        bus.subscribe_weak(Topic::Node, self, |tracker, event| async move {
            if let AppEvent::Node(NodeStatus::Stopped) = event {
                tracker.stop();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tollgate_chain::ConsumerChannel;
    use tollgate_crypto::Keyring;
    use tollgate_hermes::LatestPromise;
    use tollgate_nullables::{
        NullBlockchain, NullHermes, NullHermesResolver, NullRegistry, NullSigner, NullTransactor,
    };
    use tollgate_store::MemoryKv;

    const CHAIN: ChainId = 1;

    fn consumer() -> Identity {
        Identity::new("0x00000000000000000000000000000000000000c1")
    }

    fn hermes() -> HermesId {
        HermesId::new("0x00000000000000000000000000000000000000b2")
    }

    fn transactor_address() -> Address {
        Address::new("0x00000000000000000000000000000000000000f0")
    }

    struct Fixture {
        tracker: Arc<BalanceTracker>,
        chain: Arc<NullBlockchain>,
        hermes: Arc<NullHermes>,
        transactor: Arc<NullTransactor>,
        registry: Arc<NullRegistry>,
        totals: Arc<ConsumerTotalsStore>,
        bus: Arc<EventBus>,
        balance_events: Arc<AtomicUsize>,
    }

    fn sync_config() -> BalanceSyncConfig {
        BalanceSyncConfig {
            offchain_expiration: Duration::from_secs(1800),
            force_update_throttle: Duration::from_secs(60),
            aggressive_timeout: Duration::from_secs(300),
            aggressive_interval: Duration::from_secs(15),
            lifetime_timeout: Duration::from_secs(3600),
            lifetime_interval: Duration::from_secs(600),
            transactor_address: transactor_address(),
        }
    }

    fn fixture() -> Fixture {
        let chain = Arc::new(NullBlockchain::new());
        let hermes_api = Arc::new(NullHermes::default());
        let transactor = Arc::new(NullTransactor::new());
        let registry = Arc::new(NullRegistry::new());
        let deps = Collaborators {
            chain: chain.clone(),
            transactor: transactor.clone(),
            registry: registry.clone(),
            hermes: Arc::new(NullHermesResolver::new(hermes(), hermes_api.clone())),
            encryptor: Arc::new(Keyring::new()),
            signer: Arc::new(NullSigner::new()),
        };
        let totals = Arc::new(ConsumerTotalsStore::new(Arc::new(MemoryKv::new())));
        let bus = Arc::new(EventBus::new());
        let balance_events = Arc::new(AtomicUsize::new(0));
        let counter = balance_events.clone();
        bus.subscribe(Topic::BalanceChanged, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let tracker = BalanceTracker::new(
            &deps,
            totals.clone(),
            bus.clone(),
            Arc::new(PaymentsMetrics::new().unwrap()),
            sync_config(),
        );
        Fixture {
            tracker,
            chain,
            hermes: hermes_api,
            transactor,
            registry,
            totals,
            bus,
            balance_events,
        }
    }

    fn channel_address() -> tollgate_types::Address {
        consumer_channel_address(&consumer(), &hermes())
    }

    fn open_channel(f: &Fixture, balance: u128, settled: u128) {
        f.chain.set_consumer_channel(
            CHAIN,
            &channel_address(),
            ConsumerChannel {
                balance: TokenAmount::new(balance),
                settled: TokenAmount::new(settled),
                ..Default::default()
            },
        );
    }

    fn offchain_data(balance: u128, promised: u128) -> ConsumerData {
        ConsumerData {
            identity: consumer(),
            balance: TokenAmount::new(balance),
            latest_promise: LatestPromise {
                amount: TokenAmount::new(promised),
                ..Default::default()
            },
            is_offchain: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn onchain_balance_subtracts_unsettled_promises() {
        let f = fixture();
        open_channel(&f, 3, 1);
        f.totals
            .store(CHAIN, &consumer(), &hermes(), TokenAmount::new(2))
            .unwrap();

        let balance = f.tracker.force_balance_update(CHAIN, &consumer()).await;
        assert_eq!(balance, TokenAmount::new(2));
        assert_eq!(f.tracker.get_balance(CHAIN, &consumer()), TokenAmount::new(2));
        assert_eq!(f.balance_events.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unchanged_balance_is_not_republished() {
        let f = fixture();
        open_channel(&f, 1000, 0);
        f.tracker.force_balance_update(CHAIN, &consumer()).await;
        f.tracker.force_balance_update(CHAIN, &consumer()).await;
        assert_eq!(f.balance_events.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn offchain_identity_takes_hermes_figures() {
        let f = fixture();
        f.hermes.set_consumer_data(CHAIN, offchain_data(500, 120));
        open_channel(&f, 9999, 0);

        let balance = f.tracker.force_balance_update(CHAIN, &consumer()).await;
        assert_eq!(balance, TokenAmount::new(380));
        let entry = f.tracker.entry(CHAIN, &consumer()).unwrap();
        assert!(entry.is_offchain);
        assert_eq!(f.chain.consumer_channel_reads(), 0);
    }

    #[tokio::test]
    async fn hermes_ahead_of_store_raises_grand_total() {
        let f = fixture();
        let mut data = offchain_data(0, 40);
        data.is_offchain = false;
        f.hermes.set_consumer_data(CHAIN, data);
        open_channel(&f, 100, 0);
        f.totals
            .store(CHAIN, &consumer(), &hermes(), TokenAmount::new(10))
            .unwrap();

        let balance = f.tracker.force_balance_update(CHAIN, &consumer()).await;
        assert_eq!(balance, TokenAmount::new(60));
        assert_eq!(
            f.totals.get(CHAIN, &consumer(), &hermes()).unwrap(),
            TokenAmount::new(40)
        );
    }

    #[tokio::test]
    async fn store_ahead_of_hermes_is_kept() {
        let f = fixture();
        let mut data = offchain_data(0, 5);
        data.is_offchain = false;
        f.hermes.set_consumer_data(CHAIN, data);
        open_channel(&f, 100, 0);
        f.totals
            .store(CHAIN, &consumer(), &hermes(), TokenAmount::new(30))
            .unwrap();

        assert_eq!(
            f.tracker.force_balance_update(CHAIN, &consumer()).await,
            TokenAmount::new(70)
        );
        assert_eq!(
            f.totals.get(CHAIN, &consumer(), &hermes()).unwrap(),
            TokenAmount::new(30)
        );
    }

    #[tokio::test]
    async fn missing_channel_falls_back_to_token_balance() {
        let f = fixture();
        f.chain
            .set_token_balance(CHAIN, &channel_address(), TokenAmount::new(777));
        assert_eq!(
            f.tracker.force_balance_update(CHAIN, &consumer()).await,
            TokenAmount::new(777)
        );
    }

    #[tokio::test]
    async fn registration_bounty_survives_missing_channel() {
        let f = fixture();
        f.transactor.add_registration(TransactorRegistration {
            identity: consumer(),
            chain_id: CHAIN,
            status: TransactorRegistrationState::Created,
            bounty_amount: TokenAmount::new(250),
        });

        f.tracker
            .handle_registration(CHAIN, &consumer(), RegistrationStatus::InProgress)
            .await;
        assert_eq!(f.tracker.get_balance(CHAIN, &consumer()), TokenAmount::new(250));

        // Channel still not opened: the bounty stands in for the zero read.
        f.tracker.force_balance_update(CHAIN, &consumer()).await;
        assert_eq!(f.tracker.get_balance(CHAIN, &consumer()), TokenAmount::new(250));

        open_channel(&f, 250, 0);
        f.tracker
            .handle_registration(CHAIN, &consumer(), RegistrationStatus::Registered)
            .await;
        assert!(f.tracker.bounty(CHAIN, &consumer()).is_none());
        assert_eq!(f.tracker.get_balance(CHAIN, &consumer()), TokenAmount::new(250));
    }

    #[tokio::test]
    async fn transactor_does_not_override_known_balance() {
        let f = fixture();
        open_channel(&f, 900, 0);
        f.tracker.force_balance_update(CHAIN, &consumer()).await;
        f.transactor.add_registration(TransactorRegistration {
            identity: consumer(),
            chain_id: CHAIN,
            status: TransactorRegistrationState::Created,
            bounty_amount: TokenAmount::new(5),
        });

        f.tracker.align_with_transactor(CHAIN, &consumer()).await;
        assert_eq!(f.tracker.get_balance(CHAIN, &consumer()), TokenAmount::new(900));
    }

    #[tokio::test]
    async fn needs_force_sync_rules() {
        let f = fixture();
        assert!(f.tracker.needs_force_sync(CHAIN, &consumer()));

        open_channel(&f, 10, 0);
        f.tracker.force_balance_update(CHAIN, &consumer()).await;
        assert!(f.tracker.needs_force_sync(CHAIN, &consumer()), "dust balance");

        open_channel(&f, 2 * DUST_THRESHOLD, 0);
        f.tracker.force_balance_update(CHAIN, &consumer()).await;
        assert!(!f.tracker.needs_force_sync(CHAIN, &consumer()));
    }

    #[tokio::test]
    async fn stale_offchain_entry_needs_sync() {
        let f = fixture();
        f.tracker.set_balance(
            CHAIN,
            &consumer(),
            ConsumerBalance {
                bc_balance: TokenAmount::tokens(1),
                is_offchain: true,
                last_offchain_sync: Timestamp::new(1),
                ..Default::default()
            },
        );
        assert!(f.tracker.needs_force_sync(CHAIN, &consumer()));
    }

    #[tokio::test(start_paused = true)]
    async fn cached_update_is_throttled() {
        let f = fixture();
        open_channel(&f, 100, 0);
        f.tracker.force_balance_update_cached(CHAIN, &consumer()).await;
        open_channel(&f, 200, 0);
        assert_eq!(
            f.tracker.force_balance_update_cached(CHAIN, &consumer()).await,
            TokenAmount::new(100)
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(
            f.tracker.force_balance_update_cached(CHAIN, &consumer()).await,
            TokenAmount::new(200)
        );
    }

    #[tokio::test]
    async fn grand_total_change_updates_cached_entry() {
        let f = fixture();
        open_channel(&f, 100, 0);
        f.tracker.force_balance_update(CHAIN, &consumer()).await;
        let reads = f.chain.consumer_channel_reads();

        f.tracker
            .handle_grand_total_changed(CHAIN, &consumer(), TokenAmount::new(30))
            .await;
        assert_eq!(f.tracker.get_balance(CHAIN, &consumer()), TokenAmount::new(70));
        assert_eq!(f.chain.consumer_channel_reads(), reads);
        assert_eq!(f.balance_events.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn grand_total_change_without_entry_forces_update() {
        let f = fixture();
        open_channel(&f, 100, 0);
        f.tracker
            .handle_grand_total_changed(CHAIN, &consumer(), TokenAmount::new(30))
            .await;
        assert_eq!(f.chain.consumer_channel_reads(), 1);
        assert!(f.tracker.entry(CHAIN, &consumer()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unlock_starts_lifetime_sync() {
        let f = fixture();
        f.registry
            .set_status(CHAIN, &consumer(), RegistrationStatus::Registered);
        open_channel(&f, 100, 0);

        f.tracker.handle_unlock(CHAIN, &consumer()).await;
        assert_eq!(f.tracker.get_balance(CHAIN, &consumer()), TokenAmount::new(100));
        assert_eq!(f.tracker.jobs.len(), 1);
        assert_eq!(
            f.totals.get(CHAIN, &consumer(), &hermes()).unwrap(),
            TokenAmount::ZERO
        );

        let reads = f.chain.consumer_channel_reads();
        tokio::time::sleep(Duration::from_secs(601)).await;
        assert!(f.chain.consumer_channel_reads() > reads);
    }

    #[tokio::test]
    async fn unlock_skips_lifetime_sync_for_offchain() {
        let f = fixture();
        f.hermes.set_consumer_data(CHAIN, offchain_data(50, 0));
        f.tracker.handle_unlock(CHAIN, &consumer()).await;
        assert!(f.tracker.jobs.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn settlement_starts_single_aggressive_job() {
        let f = fixture();
        f.tracker.subscribe(&f.bus);
        open_channel(&f, 100, 0);

        for _ in 0..2 {
            f.bus.publish(AppEvent::SettlementComplete {
                chain_id: CHAIN,
                provider: consumer(),
                hermes_id: hermes(),
            });
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(f.tracker.jobs.len(), 1);

        f.bus.publish(AppEvent::Node(NodeStatus::Stopped));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(f.tracker.jobs.is_empty());
    }

    fn transfer(from: Address, to: Address, value: u128) -> TokenTransfer {
        TokenTransfer {
            from,
            to,
            value: TokenAmount::new(value),
        }
    }

    fn outsider() -> Address {
        Address::new("0x00000000000000000000000000000000000000e1")
    }

    async fn watch(f: &Fixture) {
        f.tracker.watch_transfers(CHAIN, &consumer());
        while f.chain.transfer_subscriptions() == 0 {
            tokio::task::yield_now().await;
        }
    }

    async fn wait_for_balance(f: &Fixture, expected: u128) {
        for _ in 0..1000 {
            if f.tracker.get_balance(CHAIN, &consumer()) == TokenAmount::new(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!(
            "balance stayed at {}, expected {expected}",
            f.tracker.get_balance(CHAIN, &consumer())
        );
    }

    #[tokio::test]
    async fn channel_transfers_move_the_balance() {
        let f = fixture();
        open_channel(&f, 100, 0);
        f.tracker.force_balance_update(CHAIN, &consumer()).await;
        watch(&f).await;

        assert_eq!(
            f.chain
                .emit_transfer(CHAIN, transfer(outsider(), channel_address(), 50)),
            1
        );
        wait_for_balance(&f, 150).await;

        f.chain
            .emit_transfer(CHAIN, transfer(channel_address(), outsider(), 30));
        wait_for_balance(&f, 120).await;
    }

    #[tokio::test]
    async fn free_registration_transfer_is_skipped() {
        let f = fixture();
        f.transactor.add_registration(TransactorRegistration {
            identity: consumer(),
            chain_id: CHAIN,
            status: TransactorRegistrationState::Created,
            bounty_amount: TokenAmount::new(250),
        });
        f.transactor.set_registration_fees(tollgate_chain::FeesResponse {
            fee: TokenAmount::new(10),
            valid_until: Timestamp::new(u64::MAX),
        });
        open_channel(&f, 100, 0);
        f.tracker.force_balance_update(CHAIN, &consumer()).await;
        watch(&f).await;

        f.chain
            .emit_transfer(CHAIN, transfer(transactor_address(), channel_address(), 260));
        f.chain
            .emit_transfer(CHAIN, transfer(outsider(), channel_address(), 40));
        // Transfers apply in order, so reaching 140 means the 260 was skipped.
        wait_for_balance(&f, 140).await;

        f.chain
            .emit_transfer(CHAIN, transfer(transactor_address(), channel_address(), 5));
        wait_for_balance(&f, 145).await;
    }

    #[tokio::test]
    async fn transfers_are_watched_once_until_stopped() {
        let f = fixture();
        watch(&f).await;
        f.tracker.watch_transfers(CHAIN, &consumer());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.chain.transfer_subscriptions(), 1);

        f.tracker.stop();
        for _ in 0..1000 {
            if f.chain.transfer_subscriptions() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("transfer subscription outlived the tracker");
    }
}
