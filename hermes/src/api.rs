//! The hermes contract and its wire types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tollgate_types::{
    hex_bytes, Address, ChainId, ExchangeMessage, Identity, Promise, TokenAmount,
};

use crate::HermesError;

/// Body of a promise request (plain or pay-and-settle).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestPromise {
    pub exchange_message: ExchangeMessage,
    pub transactor_fee: TokenAmount,
    /// Hex of the R-recovery payload sealed to the provider.
    pub r_recovery_data: String,
}

/// What hermes keeps on the provider's behalf to recover a lost R.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RRecoveryDetails {
    /// Hex-encoded R.
    pub r: String,
    pub agreement_id: u128,
}

/// Latest promise a consumer issued to hermes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestPromise {
    pub chain_id: ChainId,
    #[serde(with = "hex_bytes")]
    pub channel_id: Vec<u8>,
    pub amount: TokenAmount,
    pub fee: TokenAmount,
    #[serde(with = "hex_bytes")]
    pub hashlock: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

/// Hermes' ledger entry for a consumer on one chain.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerData {
    pub identity: Identity,
    pub beneficiary: Address,
    pub channel_id: String,
    pub balance: TokenAmount,
    pub settled: TokenAmount,
    pub stake: TokenAmount,
    pub latest_promise: LatestPromise,
    /// The consumer's balance lives only in hermes' books.
    pub is_offchain: bool,
}

/// Hermes keeps the same ledger shape for providers.
pub type ProviderData = ConsumerData;

/// Body asking hermes to reissue the provider's latest promise under a new hashlock.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefreshPromiseRequest {
    pub chain_id: ChainId,
    pub identity: Identity,
    #[serde(with = "hex_bytes")]
    pub hashlock: Vec<u8>,
    /// Hex of the R-recovery payload sealed to the provider.
    pub r_recovery_data: String,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

#[async_trait]
pub trait HermesApi: Send + Sync {
    async fn request_promise(&self, request: &RequestPromise) -> Result<Promise, HermesError>;

    /// Request a promise and have hermes settle it right away.
    async fn pay_and_settle(&self, request: &RequestPromise) -> Result<Promise, HermesError>;

    async fn reveal_r(
        &self,
        r: &str,
        provider: &Identity,
        agreement_id: u128,
    ) -> Result<(), HermesError>;

    /// Re-issue `promise` with a different transactor fee.
    async fn update_promise_fee(
        &self,
        promise: &Promise,
        new_fee: TokenAmount,
    ) -> Result<Promise, HermesError>;

    /// Fails with a `NotFound` cause if hermes has no entry for the chain.
    async fn get_consumer_data(
        &self,
        chain_id: ChainId,
        identity: &Identity,
    ) -> Result<ConsumerData, HermesError>;

    /// Fails with a `NotFound` cause if hermes has no entry for the chain.
    async fn get_provider_data(
        &self,
        chain_id: ChainId,
        identity: &Identity,
    ) -> Result<ProviderData, HermesError>;

    /// Make hermes adopt `promise` as the provider's latest one.
    ///
    /// Used when hermes rejects a request because its view of the previous
    /// promise differs from ours. `signature` is the provider's signature
    /// over the promise digest.
    async fn sync_promise(
        &self,
        promise: &Promise,
        provider: &Identity,
        signature: &[u8],
    ) -> Result<(), HermesError>;

    async fn refresh_promise(&self, request: &RefreshPromiseRequest)
        -> Result<Promise, HermesError>;
}
