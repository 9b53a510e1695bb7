//! Wires the payment components together around one event bus.

use std::sync::Arc;

use tollgate_chain::{BlockchainView, RegistrationStatusProvider, Transactor};
use tollgate_crypto::{Encryptor, Signer};
use tollgate_hermes::{HermesResolver, HttpHermesResolver};
use tollgate_store::{ConsumerTotalsStore, PersistentKv, PromiseStore, SettlementHistoryStore};
use tollgate_store_lmdb::LmdbKv;

use crate::balance_tracker::{BalanceSyncConfig, BalanceTracker};
use crate::channel_repository::ChannelRepository;
use crate::config::PaymentsConfig;
use crate::events::{AppEvent, EventBus, NodeStatus, Topic};
use crate::metrics::PaymentsMetrics;
use crate::promise_handler::PromiseHandler;
use crate::settler::{SettlementScheduler, SettlerConfig};
use crate::PaymentsError;

/// External services the payment components talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub chain: Arc<dyn BlockchainView>,
    pub transactor: Arc<dyn Transactor>,
    pub registry: Arc<dyn RegistrationStatusProvider>,
    pub hermes: Arc<dyn HermesResolver>,
    /// Decrypts R recovery payloads for local identities.
    pub encryptor: Arc<dyn Encryptor>,
    /// Signs on behalf of unlocked local identities.
    pub signer: Arc<dyn Signer>,
}

/// Open the LMDB environment under the configured data directory.
pub fn open_store(config: &PaymentsConfig) -> Result<Arc<dyn PersistentKv>, PaymentsError> {
    let kv = LmdbKv::open_default(&config.data_dir.join("payments"))?;
    Ok(Arc::new(kv))
}

/// HTTP resolver over the configured hermes endpoints.
pub fn hermes_resolver(config: &PaymentsConfig) -> Arc<dyn HermesResolver> {
    Arc::new(HttpHermesResolver::new(
        config.hermes.clone(),
        config.hermes_timeout(),
    ))
}

/// The payment core of a node.
///
/// Components react to [`AppEvent`]s on the shared bus. `start` announces
/// the node as started, which loads known channels and settlement state and
/// launches the promise worker; `stop` shuts everything down.
pub struct PaymentsCore {
    config: PaymentsConfig,
    bus: Arc<EventBus>,
    metrics: Arc<PaymentsMetrics>,
    promises: Arc<PromiseStore>,
    channels: Arc<ChannelRepository>,
    balances: Arc<BalanceTracker>,
    promise_handler: Arc<PromiseHandler>,
    settler: Arc<SettlementScheduler>,
}

impl PaymentsCore {
    pub fn new(
        config: PaymentsConfig,
        kv: Arc<dyn PersistentKv>,
        deps: Collaborators,
    ) -> Result<Self, PaymentsError> {
        config.validate()?;

        let bus = Arc::new(EventBus::new());
        let metrics = Arc::new(PaymentsMetrics::new()?);
        let promises = Arc::new(PromiseStore::new(kv.clone()));
        let totals = Arc::new(ConsumerTotalsStore::new(kv.clone()));
        let history = Arc::new(SettlementHistoryStore::new(kv));
        let chains = config.all_chains();

        let channels = Arc::new(ChannelRepository::new(
            &deps,
            promises.clone(),
            bus.clone(),
            chains.clone(),
        ));
        let balances = BalanceTracker::new(
            &deps,
            totals,
            bus.clone(),
            metrics.clone(),
            BalanceSyncConfig::from(&config),
        );
        let promise_handler = Arc::new(PromiseHandler::new(
            &deps,
            promises.clone(),
            bus.clone(),
            metrics.clone(),
            chains,
            config.promise_queue_capacity,
        ));
        let settler = Arc::new(SettlementScheduler::new(
            &deps,
            channels.clone(),
            promise_handler.clone(),
            promises.clone(),
            history,
            bus.clone(),
            metrics.clone(),
            SettlerConfig::from(&config),
        ));

        channels.subscribe(&bus);
        balances.subscribe(&bus);
        settler.subscribe(&bus);
        bus.subscribe(Topic::Node, {
            let handler = Arc::downgrade(&promise_handler);
            move |event| {
                let Some(handler) = handler.upgrade() else {
                    return;
                };
                match event {
                    AppEvent::Node(NodeStatus::Started) => handler.start(),
                    AppEvent::Node(NodeStatus::Stopped) => handler.stop(),
                    _ => {}
                }
            }
        });
        bus.subscribe(Topic::ServiceStatus, {
            let handler = Arc::downgrade(&promise_handler);
            move |event| {
                if let (AppEvent::ServiceStatus { running: true, .. }, Some(handler)) =
                    (event, handler.upgrade())
                {
                    handler.start();
                }
            }
        });

        tracing::info!(
            chain_id = config.chain_id,
            hermes = config.hermes.len(),
            "payments core created"
        );
        Ok(Self {
            config,
            bus,
            metrics,
            promises,
            channels,
            balances,
            promise_handler,
            settler,
        })
    }

    /// Announce the node as started. Must be called within a Tokio runtime.
    pub fn start(&self) {
        tracing::info!("payments core starting");
        self.bus.publish(AppEvent::Node(NodeStatus::Started));
    }

    pub fn stop(&self) {
        tracing::info!("payments core stopping");
        self.bus.publish(AppEvent::Node(NodeStatus::Stopped));
        // Inline stop so callers outside a runtime still shut down.
        self.promise_handler.stop();
        self.balances.stop();
        self.settler.stop();
    }

    pub fn config(&self) -> &PaymentsConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn metrics(&self) -> &Arc<PaymentsMetrics> {
        &self.metrics
    }

    pub fn promises(&self) -> &Arc<PromiseStore> {
        &self.promises
    }

    pub fn channels(&self) -> &Arc<ChannelRepository> {
        &self.channels
    }

    pub fn balances(&self) -> &Arc<BalanceTracker> {
        &self.balances
    }

    pub fn promise_handler(&self) -> &Arc<PromiseHandler> {
        &self.promise_handler
    }

    pub fn settler(&self) -> &Arc<SettlementScheduler> {
        &self.settler
    }
}

impl Drop for PaymentsCore {
    fn drop(&mut self) {
        self.promise_handler.stop();
        self.balances.stop();
        self.settler.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_crypto::Keyring;
    use tollgate_nullables::{
        NullBlockchain, NullHermes, NullHermesResolver, NullRegistry, NullSigner, NullTransactor,
    };
    use tollgate_store::MemoryKv;
    use tollgate_types::HermesId;

    fn deps() -> Collaborators {
        Collaborators {
            chain: Arc::new(NullBlockchain::new()),
            transactor: Arc::new(NullTransactor::new()),
            registry: Arc::new(NullRegistry::new()),
            hermes: Arc::new(NullHermesResolver::new(
                HermesId::new("0x00000000000000000000000000000000000000b2"),
                Arc::new(NullHermes::new()),
            )),
            encryptor: Arc::new(Keyring::new()),
            signer: Arc::new(NullSigner::new()),
        }
    }

    #[test]
    fn components_subscribe_to_the_bus() {
        let core = PaymentsCore::new(
            PaymentsConfig::default(),
            Arc::new(MemoryKv::new()),
            deps(),
        )
        .unwrap();
        let bus = core.bus();
        assert!(bus.handler_count(Topic::Node) >= 4);
        assert_eq!(bus.handler_count(Topic::HermesPromiseReceived), 2);
        assert_eq!(bus.handler_count(Topic::SettlementRequest), 1);
        assert_eq!(bus.handler_count(Topic::SettlementComplete), 1);
        assert_eq!(bus.handler_count(Topic::IdentityUnlock), 2);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = PaymentsConfig {
            settlement_threshold: 2.0,
            ..Default::default()
        };
        let result = PaymentsCore::new(config, Arc::new(MemoryKv::new()), deps());
        assert!(matches!(result, Err(PaymentsError::Config(_))));
    }

    #[tokio::test]
    async fn start_launches_promise_worker() {
        let core = PaymentsCore::new(
            PaymentsConfig::default(),
            Arc::new(MemoryKv::new()),
            deps(),
        )
        .unwrap();
        assert!(!core.promise_handler().is_running());
        core.start();
        assert!(core.promise_handler().is_running());
        core.stop();
        assert!(!core.promise_handler().is_running());
    }

    #[test]
    fn opens_lmdb_under_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = PaymentsConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        open_store(&config).unwrap();
        assert!(dir.path().join("payments").exists());
    }
}
