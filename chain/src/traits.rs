//! Collaborator traits.

use async_trait::async_trait;
use tollgate_types::{
    Address, ChainId, HermesId, Identity, Promise, RegistrationStatus, TokenAmount,
};

use crate::{
    ChainError, ConsumerChannel, FeesResponse, PromiseSettledEvent, ProviderChannel, Subscription,
    TokenTransfer, TransactorRegistration,
};

/// Read access to channel contracts and token balances.
#[async_trait]
pub trait BlockchainView: Send + Sync {
    async fn get_provider_channel(
        &self,
        chain_id: ChainId,
        hermes: &HermesId,
        provider: &Identity,
    ) -> Result<ProviderChannel, ChainError>;

    /// Fails with [`ChainError::ChannelNotFound`] until the channel is opened.
    async fn get_consumer_channel(
        &self,
        chain_id: ChainId,
        channel: &Address,
    ) -> Result<ConsumerChannel, ChainError>;

    async fn get_token_balance(
        &self,
        chain_id: ChainId,
        address: &Address,
    ) -> Result<TokenAmount, ChainError>;

    /// Hermes fee in basis points.
    async fn get_hermes_fee(&self, chain_id: ChainId, hermes: &HermesId) -> Result<u16, ChainError>;

    /// The channel hermes settles a provider's withdrawals through.
    async fn get_withdrawal_channel(
        &self,
        chain_id: ChainId,
        hermes: &HermesId,
        provider: &Identity,
    ) -> Result<ProviderChannel, ChainError>;

    async fn subscribe_to_promise_settled(
        &self,
        chain_id: ChainId,
        provider: &Identity,
        hermes: &HermesId,
    ) -> Result<Subscription<PromiseSettledEvent>, ChainError>;

    /// Token transfers into and out of `channel`.
    async fn subscribe_to_channel_transfers(
        &self,
        chain_id: ChainId,
        channel: &Address,
    ) -> Result<Subscription<TokenTransfer>, ChainError>;
}

/// Relays settlement and registration transactions on behalf of identities.
#[async_trait]
pub trait Transactor: Send + Sync {
    async fn fetch_settle_fees(&self, chain_id: ChainId) -> Result<FeesResponse, ChainError>;

    /// Settle to the channel and rebalance it from hermes.
    async fn settle_and_rebalance(
        &self,
        chain_id: ChainId,
        hermes: &HermesId,
        provider: &Identity,
        promise: &Promise,
    ) -> Result<(), ChainError>;

    async fn settle_with_beneficiary(
        &self,
        chain_id: ChainId,
        provider: &Identity,
        beneficiary: &Address,
        hermes: &HermesId,
        promise: &Promise,
    ) -> Result<(), ChainError>;

    async fn settle_into_stake(
        &self,
        chain_id: ChainId,
        hermes: &HermesId,
        provider: &Identity,
        promise: &Promise,
    ) -> Result<(), ChainError>;

    /// Settle a withdrawal promise from the pay-and-settle channel to `beneficiary`.
    ///
    /// Transactor rejections surface as [`ChainError::TransactorStatus`].
    async fn pay_and_settle(
        &self,
        chain_id: ChainId,
        hermes: &HermesId,
        provider: &Identity,
        promise: &Promise,
        beneficiary: &Address,
        beneficiary_signature: &[u8],
    ) -> Result<(), ChainError>;

    async fn fetch_registration_fees(&self, chain_id: ChainId) -> Result<FeesResponse, ChainError>;

    async fn fetch_registration_status(
        &self,
        identity: &Identity,
    ) -> Result<Vec<TransactorRegistration>, ChainError>;
}

/// Registration status as tracked by the node's identity registry.
#[async_trait]
pub trait RegistrationStatusProvider: Send + Sync {
    async fn get_registration_status(
        &self,
        chain_id: ChainId,
        identity: &Identity,
    ) -> Result<RegistrationStatus, ChainError>;
}
