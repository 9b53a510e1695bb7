//! Domain events and the in-process bus that carries them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tollgate_store::HermesPromise;
use tollgate_types::{ChainId, HermesId, Identity, RegistrationStatus, TokenAmount};

use crate::channel::Earnings;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeStatus {
    Started,
    Stopped,
}

/// Events exchanged between the payment components and the rest of the node.
#[derive(Clone, Debug)]
pub enum AppEvent {
    Node(NodeStatus),
    /// A provider service changed state.
    ServiceStatus {
        provider: Identity,
        running: bool,
    },
    IdentityRegistration {
        chain_id: ChainId,
        identity: Identity,
        status: RegistrationStatus,
    },
    IdentityUnlock {
        chain_id: ChainId,
        identity: Identity,
    },
    /// The consumer promised more to a hermes in total.
    GrandTotalChanged {
        chain_id: ChainId,
        consumer: Identity,
        hermes_id: HermesId,
        amount: TokenAmount,
    },
    /// A top-up order changed state.
    OrderUpdated {
        chain_id: ChainId,
        identity: Identity,
        paid: bool,
    },
    SettlementComplete {
        chain_id: ChainId,
        provider: Identity,
        hermes_id: HermesId,
    },
    WithdrawalRequested {
        chain_id: ChainId,
        provider: Identity,
        hermes_id: HermesId,
    },
    HermesPromiseReceived {
        promise: HermesPromise,
        provider: Identity,
        hermes_id: HermesId,
    },
    TokensEarned {
        provider: Identity,
        session_id: String,
        total: TokenAmount,
    },
    BalanceChanged {
        chain_id: ChainId,
        identity: Identity,
        previous: TokenAmount,
        current: TokenAmount,
    },
    EarningsChanged {
        chain_id: ChainId,
        identity: Identity,
        previous: Earnings,
        current: Earnings,
    },
    /// A provider's earnings crossed the settlement threshold.
    SettlementRequest {
        chain_id: ChainId,
        provider: Identity,
        hermes_id: HermesId,
        into_stake: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    Node,
    ServiceStatus,
    IdentityRegistration,
    IdentityUnlock,
    GrandTotalChanged,
    OrderUpdated,
    SettlementComplete,
    WithdrawalRequested,
    HermesPromiseReceived,
    TokensEarned,
    BalanceChanged,
    EarningsChanged,
    SettlementRequest,
}

impl AppEvent {
    pub fn topic(&self) -> Topic {
        match self {
            Self::Node(_) => Topic::Node,
            Self::ServiceStatus { .. } => Topic::ServiceStatus,
            Self::IdentityRegistration { .. } => Topic::IdentityRegistration,
            Self::IdentityUnlock { .. } => Topic::IdentityUnlock,
            Self::GrandTotalChanged { .. } => Topic::GrandTotalChanged,
            Self::OrderUpdated { .. } => Topic::OrderUpdated,
            Self::SettlementComplete { .. } => Topic::SettlementComplete,
            Self::WithdrawalRequested { .. } => Topic::WithdrawalRequested,
            Self::HermesPromiseReceived { .. } => Topic::HermesPromiseReceived,
            Self::TokensEarned { .. } => Topic::TokensEarned,
            Self::BalanceChanged { .. } => Topic::BalanceChanged,
            Self::EarningsChanged { .. } => Topic::EarningsChanged,
            Self::SettlementRequest { .. } => Topic::SettlementRequest,
        }
    }
}

type InlineHandler = Arc<dyn Fn(&AppEvent) + Send + Sync>;
type SpawnedHandler = Arc<dyn Fn(AppEvent) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Inline(InlineHandler),
    Spawned(SpawnedHandler),
}

/// Topic-based fan-out bus.
///
/// Inline handlers run on the publishing thread and must stay fast. Async
/// handlers get a fresh Tokio task per event; they are skipped with a
/// warning when publishing outside a runtime.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<Topic, Vec<Handler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, topic: Topic, handler: Handler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic)
            .or_default()
            .push(handler);
    }

    pub fn subscribe<F>(&self, topic: Topic, handler: F)
    where
        F: Fn(&AppEvent) + Send + Sync + 'static,
    {
        self.add(topic, Handler::Inline(Arc::new(handler)));
    }

    pub fn subscribe_async<F, Fut>(&self, topic: Topic, handler: F)
    where
        F: Fn(AppEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add(
            topic,
            Handler::Spawned(Arc::new(move |event| handler(event).boxed())),
        );
    }

    /// Async handler bound to a component. The bus keeps only a weak
    /// reference, events arriving after `target` is dropped are ignored.
    pub fn subscribe_weak<T, F, Fut>(&self, topic: Topic, target: &Arc<T>, handler: F)
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>, AppEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let target = Arc::downgrade(target);
        self.subscribe_async(topic, move |event| {
            let call = target.upgrade().map(|target| handler(target, event));
            async move {
                if let Some(call) = call {
                    call.await;
                }
            }
        });
    }

    pub fn publish(&self, event: AppEvent) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.topic())
            .cloned()
            .unwrap_or_default();

        for handler in handlers {
            match handler {
                Handler::Inline(f) => f(&event),
                Handler::Spawned(f) => match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(f(event.clone()));
                    }
                    Err(_) => {
                        tracing::warn!(topic = ?event.topic(), "no runtime, async handler skipped");
                    }
                },
            }
        }
    }

    pub fn handler_count(&self, topic: Topic) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&topic)
            .map_or(0, Vec::len)
    }
}
