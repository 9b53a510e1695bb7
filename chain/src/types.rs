//! Values exchanged with the blockchain and the transactor.

use serde::{Deserialize, Serialize};
use tollgate_types::{hex_bytes, Address, ChainId, ChannelId, Identity, Timestamp, TokenAmount};

/// On-chain state of the channel hermes pays a provider from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderChannel {
    pub balance: TokenAmount,
    pub settled: TokenAmount,
    pub stake: TokenAmount,
    pub stake_goal: TokenAmount,
    pub beneficiary: Address,
}

/// On-chain state of the channel a consumer pays hermes from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerChannel {
    pub balance: TokenAmount,
    pub settled: TokenAmount,
    pub stake: TokenAmount,
}

/// Emitted once a settlement transaction for a provider channel is mined.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseSettledEvent {
    pub tx_hash: String,
    pub channel_id: ChannelId,
    pub amount_sent_to_beneficiary: TokenAmount,
    pub fees: TokenAmount,
    #[serde(with = "hex_bytes")]
    pub lock: Vec<u8>,
}

/// A token transfer touching a watched address.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransfer {
    pub from: Address,
    pub to: Address,
    pub value: TokenAmount,
}

/// Transactor fee quote for settling on a chain.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeesResponse {
    pub fee: TokenAmount,
    pub valid_until: Timestamp,
}

impl FeesResponse {
    pub fn is_valid_at(&self, now: Timestamp) -> bool {
        now < self.valid_until
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Timestamp::now())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransactorRegistrationState {
    #[default]
    Created,
    PriceIncreased,
    Success,
    Fail,
}

/// The transactor's view of a registration it relays.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactorRegistration {
    pub identity: Identity,
    pub chain_id: ChainId,
    pub status: TransactorRegistrationState,
    /// Tokens the transactor grants the identity on registration.
    pub bounty_amount: TokenAmount,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_validity_is_exclusive() {
        let fees = FeesResponse {
            fee: TokenAmount::new(1),
            valid_until: Timestamp::new(100),
        };
        assert!(fees.is_valid_at(Timestamp::new(99)));
        assert!(!fees.is_valid_at(Timestamp::new(100)));
        assert!(!FeesResponse::default().is_valid());
    }
}
