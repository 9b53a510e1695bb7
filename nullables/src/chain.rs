//! Nullable blockchain view.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tollgate_chain::{
    BlockchainView, ChainError, ConsumerChannel, PromiseSettledEvent, ProviderChannel,
    Subscription, TokenTransfer,
};
use tollgate_types::{Address, ChainId, HermesId, Identity, TokenAmount};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

type SettledSink = (ChainId, Identity, HermesId, mpsc::Sender<PromiseSettledEvent>);
type TransferSink = (ChainId, Address, mpsc::Sender<TokenTransfer>);

/// In-memory chain state.
///
/// Provider channels and token balances read as zero until set. Consumer
/// channels fail with [`ChainError::ChannelNotFound`] until set, like an
/// unregistered identity on chain.
#[derive(Default)]
pub struct NullBlockchain {
    provider_channels: Mutex<HashMap<(ChainId, HermesId, Identity), ProviderChannel>>,
    withdrawal_channels: Mutex<HashMap<(ChainId, HermesId, Identity), ProviderChannel>>,
    consumer_channels: Mutex<HashMap<(ChainId, Address), ConsumerChannel>>,
    token_balances: Mutex<HashMap<(ChainId, Address), TokenAmount>>,
    hermes_fee: AtomicU16,
    sinks: Mutex<Vec<SettledSink>>,
    transfer_sinks: Mutex<Vec<TransferSink>>,
    provider_channel_reads: AtomicUsize,
    consumer_channel_reads: AtomicUsize,
}

impl NullBlockchain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_provider_channel(
        &self,
        chain_id: ChainId,
        hermes: &HermesId,
        provider: &Identity,
        channel: ProviderChannel,
    ) {
        lock(&self.provider_channels).insert((chain_id, hermes.clone(), provider.clone()), channel);
    }

    pub fn set_withdrawal_channel(
        &self,
        chain_id: ChainId,
        hermes: &HermesId,
        provider: &Identity,
        channel: ProviderChannel,
    ) {
        lock(&self.withdrawal_channels)
            .insert((chain_id, hermes.clone(), provider.clone()), channel);
    }

    pub fn set_consumer_channel(&self, chain_id: ChainId, address: &Address, channel: ConsumerChannel) {
        lock(&self.consumer_channels).insert((chain_id, address.clone()), channel);
    }

    pub fn set_token_balance(&self, chain_id: ChainId, address: &Address, balance: TokenAmount) {
        lock(&self.token_balances).insert((chain_id, address.clone()), balance);
    }

    /// Hermes fee in basis points.
    pub fn set_hermes_fee(&self, basis_points: u16) {
        self.hermes_fee.store(basis_points, Ordering::SeqCst);
    }

    /// Deliver a settled event to every live subscription for the pair.
    /// Returns how many subscribers received it.
    pub fn emit_settled(
        &self,
        chain_id: ChainId,
        provider: &Identity,
        hermes: &HermesId,
        event: PromiseSettledEvent,
    ) -> usize {
        let mut sinks = lock(&self.sinks);
        sinks.retain(|(_, _, _, tx)| !tx.is_closed());
        let mut delivered = 0;
        for (chain, id, h, tx) in sinks.iter() {
            if *chain == chain_id && id == provider && h == hermes && tx.try_send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver a transfer to every live subscription watching `from` or `to`.
    /// Returns how many subscribers received it.
    pub fn emit_transfer(&self, chain_id: ChainId, transfer: TokenTransfer) -> usize {
        let mut sinks = lock(&self.transfer_sinks);
        sinks.retain(|(_, _, tx)| !tx.is_closed());
        let mut delivered = 0;
        for (chain, watched, tx) in sinks.iter() {
            let touches = *watched == transfer.from || *watched == transfer.to;
            if *chain == chain_id && touches && tx.try_send(transfer.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Live transfer subscriptions.
    pub fn transfer_subscriptions(&self) -> usize {
        let mut sinks = lock(&self.transfer_sinks);
        sinks.retain(|(_, _, tx)| !tx.is_closed());
        sinks.len()
    }

    /// Subscriptions that have not been canceled.
    pub fn live_subscriptions(&self) -> usize {
        let mut sinks = lock(&self.sinks);
        sinks.retain(|(_, _, _, tx)| !tx.is_closed());
        sinks.len()
    }

    pub fn provider_channel_reads(&self) -> usize {
        self.provider_channel_reads.load(Ordering::SeqCst)
    }

    pub fn consumer_channel_reads(&self) -> usize {
        self.consumer_channel_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlockchainView for NullBlockchain {
    async fn get_provider_channel(
        &self,
        chain_id: ChainId,
        hermes: &HermesId,
        provider: &Identity,
    ) -> Result<ProviderChannel, ChainError> {
        self.provider_channel_reads.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.provider_channels)
            .get(&(chain_id, hermes.clone(), provider.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_withdrawal_channel(
        &self,
        chain_id: ChainId,
        hermes: &HermesId,
        provider: &Identity,
    ) -> Result<ProviderChannel, ChainError> {
        Ok(lock(&self.withdrawal_channels)
            .get(&(chain_id, hermes.clone(), provider.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_consumer_channel(
        &self,
        chain_id: ChainId,
        channel: &Address,
    ) -> Result<ConsumerChannel, ChainError> {
        self.consumer_channel_reads.fetch_add(1, Ordering::SeqCst);
        lock(&self.consumer_channels)
            .get(&(chain_id, channel.clone()))
            .cloned()
            .ok_or_else(|| ChainError::ChannelNotFound(channel.to_string()))
    }

    async fn get_token_balance(
        &self,
        chain_id: ChainId,
        address: &Address,
    ) -> Result<TokenAmount, ChainError> {
        Ok(lock(&self.token_balances)
            .get(&(chain_id, address.clone()))
            .copied()
            .unwrap_or_default())
    }

    async fn get_hermes_fee(&self, _chain_id: ChainId, _hermes: &HermesId) -> Result<u16, ChainError> {
        Ok(self.hermes_fee.load(Ordering::SeqCst))
    }

    async fn subscribe_to_promise_settled(
        &self,
        chain_id: ChainId,
        provider: &Identity,
        hermes: &HermesId,
    ) -> Result<Subscription<PromiseSettledEvent>, ChainError> {
        let (subscription, tx, _cancel) = Subscription::channel(8);
        lock(&self.sinks).push((chain_id, provider.clone(), hermes.clone(), tx));
        Ok(subscription)
    }

    async fn subscribe_to_channel_transfers(
        &self,
        chain_id: ChainId,
        channel: &Address,
    ) -> Result<Subscription<TokenTransfer>, ChainError> {
        let (subscription, tx, _cancel) = Subscription::channel(8);
        lock(&self.transfer_sinks).push((chain_id, channel.clone(), tx));
        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> Identity {
        Identity::new("0x00000000000000000000000000000000000000a1")
    }

    fn hermes() -> HermesId {
        HermesId::new("0x00000000000000000000000000000000000000b2")
    }

    #[tokio::test]
    async fn settled_events_reach_matching_subscribers() {
        let chain = NullBlockchain::new();
        let mut sub = chain.subscribe_to_promise_settled(1, &provider(), &hermes()).await.unwrap();

        let event = PromiseSettledEvent {
            tx_hash: "0x01".into(),
            ..Default::default()
        };
        assert_eq!(chain.emit_settled(5, &provider(), &hermes(), event.clone()), 0);
        assert_eq!(chain.emit_settled(1, &provider(), &hermes(), event.clone()), 1);
        assert_eq!(sub.recv().await, Some(event));
    }

    #[tokio::test]
    async fn canceled_subscriptions_are_dropped() {
        let chain = NullBlockchain::new();
        let sub = chain.subscribe_to_promise_settled(1, &provider(), &hermes()).await.unwrap();
        assert_eq!(chain.live_subscriptions(), 1);
        drop(sub);
        assert_eq!(chain.live_subscriptions(), 0);
    }

    #[tokio::test]
    async fn transfers_reach_both_ends() {
        let chain = NullBlockchain::new();
        let watched = Address::new("0x00000000000000000000000000000000000000c3");
        let mut sub = chain.subscribe_to_channel_transfers(1, &watched).await.unwrap();

        let incoming = TokenTransfer {
            from: Address::zero(),
            to: watched.clone(),
            value: TokenAmount::new(5),
        };
        let unrelated = TokenTransfer {
            to: Address::zero(),
            ..incoming.clone()
        };
        assert_eq!(chain.emit_transfer(1, unrelated), 0);
        assert_eq!(chain.emit_transfer(2, incoming.clone()), 0);
        assert_eq!(chain.emit_transfer(1, incoming.clone()), 1);
        assert_eq!(sub.recv().await, Some(incoming));
        drop(sub);
        assert_eq!(chain.transfer_subscriptions(), 0);
    }

    #[tokio::test]
    async fn unknown_consumer_channel_is_not_found() {
        let chain = NullBlockchain::new();
        let err = chain.get_consumer_channel(1, &Address::zero()).await.unwrap_err();
        assert!(matches!(err, ChainError::ChannelNotFound(_)));
    }
}
