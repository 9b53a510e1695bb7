//! Cache of provider channels and the single source of earnings events.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tollgate_chain::BlockchainView;
use tollgate_crypto::{generate_r, hashlock, provider_channel_id, refresh_digest, Encryptor, Signer};
use tollgate_hermes::{HermesApi, HermesCause, HermesResolver, RRecoveryDetails, RefreshPromiseRequest};
use tollgate_store::{HermesPromise, PromiseFilter, PromiseStore};
use tollgate_types::{ChainId, HermesId, Identity};

use crate::channel::{Channel, Earnings, EarningsDetailed};
use crate::events::{AppEvent, EventBus, NodeStatus, Topic};
use crate::payments::Collaborators;
use crate::PaymentsError;

type ChannelKey = (ChainId, Identity, HermesId);

/// Merges stored promises with on-chain provider channels.
///
/// [`ChannelRepository::fetch`] is the only place earnings-changed events
/// originate, and only when the identity's earnings actually moved.
pub struct ChannelRepository {
    promises: Arc<PromiseStore>,
    chain: Arc<dyn BlockchainView>,
    hermes: Arc<dyn HermesResolver>,
    encryptor: Arc<dyn Encryptor>,
    signer: Arc<dyn Signer>,
    bus: Arc<EventBus>,
    chains: Vec<ChainId>,
    channels: Mutex<HashMap<ChannelKey, Channel>>,
}

impl ChannelRepository {
    pub fn new(
        deps: &Collaborators,
        promises: Arc<PromiseStore>,
        bus: Arc<EventBus>,
        chains: Vec<ChainId>,
    ) -> Self {
        Self {
            promises,
            chain: deps.chain.clone(),
            hermes: deps.hermes.clone(),
            encryptor: deps.encryptor.clone(),
            signer: deps.signer.clone(),
            bus,
            chains,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<ChannelKey, Channel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The cached channel, without touching the network.
    pub fn get(&self, chain_id: ChainId, identity: &Identity, hermes: &HermesId) -> Option<Channel> {
        self.channels()
            .get(&(chain_id, identity.clone(), hermes.clone()))
            .cloned()
    }

    /// Rebuild the channel from storage and chain state and cache it.
    pub async fn fetch(
        &self,
        chain_id: ChainId,
        identity: &Identity,
        hermes: &HermesId,
    ) -> Result<Channel, PaymentsError> {
        let promise = match self.promises.get_for(chain_id, identity, hermes) {
            Ok(promise) => promise,
            Err(e) if e.is_not_found() => Channel::empty_promise(chain_id, identity, hermes),
            Err(e) => return Err(e.into()),
        };
        let provider_channel = self
            .chain
            .get_provider_channel(chain_id, hermes, identity)
            .await?;
        let channel = Channel::new(
            chain_id,
            identity.clone(),
            hermes.clone(),
            provider_channel,
            promise,
        );

        let (previous, current) = {
            let mut channels = self.channels();
            let previous = earnings_of(&channels, chain_id, identity);
            channels.insert((chain_id, identity.clone(), hermes.clone()), channel.clone());
            (previous, earnings_of(&channels, chain_id, identity))
        };

        if previous != current {
            tracing::debug!(
                chain_id,
                identity = %identity,
                lifetime = %current.lifetime_balance,
                unsettled = %current.unsettled_balance,
                "earnings changed"
            );
            self.bus.publish(AppEvent::EarningsChanged {
                chain_id,
                identity: identity.clone(),
                previous,
                current,
            });
        }
        Ok(channel)
    }

    /// Every cached channel on the chain.
    pub fn list(&self, chain_id: ChainId) -> Vec<Channel> {
        self.channels()
            .values()
            .filter(|c| c.chain_id == chain_id)
            .cloned()
            .collect()
    }

    pub fn earnings(&self, chain_id: ChainId, identity: &Identity) -> Earnings {
        earnings_of(&self.channels(), chain_id, identity)
    }

    pub fn earnings_detailed(&self, chain_id: ChainId, identity: &Identity) -> EarningsDetailed {
        let channels = self.channels();
        let per_hermes = channels
            .values()
            .filter(|c| c.chain_id == chain_id && &c.identity == identity)
            .map(|c| (c.hermes_id.clone(), c.earnings()))
            .collect();
        EarningsDetailed {
            total: earnings_of(&channels, chain_id, identity),
            per_hermes,
        }
    }

    /// Fetch every channel there is a stored promise for.
    pub async fn fetch_known(&self) {
        for chain_id in &self.chains {
            let promises = match self.promises.list(&PromiseFilter::chain(*chain_id)) {
                Ok(promises) => promises,
                Err(e) => {
                    tracing::warn!(chain_id, error = %e, "could not list stored promises");
                    continue;
                }
            };
            let pairs: BTreeSet<_> = promises
                .into_iter()
                .map(|p| (p.identity, p.hermes_id))
                .collect();
            for (identity, hermes) in pairs {
                if let Err(e) = self.fetch(*chain_id, &identity, &hermes).await {
                    tracing::warn!(chain_id, identity = %identity, hermes = %hermes, error = %e, "could not load channel");
                }
            }
        }
    }

    /// Bring an identity's promise up to date with hermes once it unlocks.
    ///
    /// If hermes' latest promise carries the hashlock of the stored one, its
    /// R is revealed. Otherwise hermes is asked to reissue the latest promise
    /// under a fresh R, which is stored, announced and revealed.
    pub async fn handle_identity_unlock(
        &self,
        chain_id: ChainId,
        identity: &Identity,
    ) -> Result<(), PaymentsError> {
        let hermes = self.hermes.active_hermes(chain_id)?;
        if self.get(chain_id, identity, &hermes).is_some() {
            return Ok(());
        }

        let api = self.hermes.caller(chain_id, &hermes)?;
        let data = match api.get_provider_data(chain_id, identity).await {
            Ok(data) => data,
            Err(e) if e.is(HermesCause::NotFound) => {
                tracing::debug!(chain_id, identity = %identity, "no provider data on hermes");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let latest = data.latest_promise;
        let channel_id = provider_channel_id(identity, &hermes);

        if !latest.hashlock.is_empty() {
            match self.promises.get(chain_id, &channel_id) {
                Ok(stored) if stored.promise.hashlock == latest.hashlock => {
                    match self.reveal(api.as_ref(), &stored).await {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            tracing::error!(identity = %identity, error = %e, "failed to reveal R on identity unlock");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        if latest.amount.is_zero() {
            return Ok(());
        }

        let r = generate_r()?;
        let lock = hashlock(&r);
        let details = RRecoveryDetails {
            r: hex::encode(r),
            agreement_id: 0,
        };
        let json = serde_json::to_vec(&details)
            .map_err(|e| PaymentsError::RecoveryPayload(e.to_string()))?;
        let sealed = self.encryptor.encrypt(identity, &json)?;
        let signature = self
            .signer
            .sign(identity, &refresh_digest(chain_id, identity, &lock))?;
        let promise = api
            .refresh_promise(&RefreshPromiseRequest {
                chain_id,
                identity: identity.clone(),
                hashlock: lock.to_vec(),
                r_recovery_data: hex::encode(sealed),
                signature,
            })
            .await?;

        let stored = HermesPromise {
            channel_id,
            identity: identity.clone(),
            hermes_id: hermes.clone(),
            promise,
            r: details.r,
            revealed: false,
            agreement_id: 0,
        };
        self.promises.store(&stored)?;
        self.bus.publish(AppEvent::HermesPromiseReceived {
            promise: stored.clone(),
            provider: identity.clone(),
            hermes_id: hermes,
        });

        self.reveal(api.as_ref(), &stored).await?;
        tracing::debug!(identity = %identity, amount = %stored.promise.amount, "refreshed promise");
        Ok(())
    }

    async fn reveal(&self, api: &dyn HermesApi, stored: &HermesPromise) -> Result<(), PaymentsError> {
        if stored.revealed {
            return Ok(());
        }
        api.reveal_r(&stored.r, &stored.identity, stored.agreement_id)
            .await?;
        self.promises
            .mark_revealed(stored.promise.chain_id, &stored.channel_id, &stored.r)?;
        Ok(())
    }

    pub fn subscribe(self: &Arc<Self>, bus: &EventBus) {
        bus.subscribe_weak(Topic::Node, self, |repo, event| async move {
            if let AppEvent::Node(NodeStatus::Started) = event {
                repo.fetch_known().await;
            }
        });

        bus.subscribe_weak(Topic::HermesPromiseReceived, self, |repo, event| async move {
            let AppEvent::HermesPromiseReceived { promise, provider, hermes_id } = event else {
                return;
            };
            let chain_id = promise.promise.chain_id;
            if let Err(e) = repo.fetch(chain_id, &provider, &hermes_id).await {
                tracing::warn!(chain_id, provider = %provider, error = %e, "could not refresh channel");
            }
        });

        bus.subscribe_weak(Topic::IdentityUnlock, self, |repo, event| async move {
            let AppEvent::IdentityUnlock { chain_id, identity } = event else {
                return;
            };
            if let Err(e) = repo.handle_identity_unlock(chain_id, &identity).await {
                tracing::error!(chain_id, identity = %identity, error = %e, "could not refresh promise on unlock");
            }
        });
    }
}

fn earnings_of(channels: &HashMap<ChannelKey, Channel>, chain_id: ChainId, identity: &Identity) -> Earnings {
    channels
        .values()
        .filter(|c| c.chain_id == chain_id && &c.identity == identity)
        .map(Channel::earnings)
        .sum()
}
