//! Provider channel view: on-chain state plus the latest hermes promise.

use std::collections::BTreeMap;
use std::iter::Sum;
use std::ops::Add;

use tollgate_chain::ProviderChannel;
use tollgate_crypto::provider_channel_id;
use tollgate_store::HermesPromise;
use tollgate_types::{
    Address, ChainId, ChannelId, HermesId, Identity, Promise, Timestamp, TokenAmount,
};

/// What a provider has earned, in total and not yet paid out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Earnings {
    pub lifetime_balance: TokenAmount,
    pub unsettled_balance: TokenAmount,
}

impl Add for Earnings {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            lifetime_balance: self.lifetime_balance.saturating_add(rhs.lifetime_balance),
            unsettled_balance: self.unsettled_balance.saturating_add(rhs.unsettled_balance),
        }
    }
}

impl Sum for Earnings {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

/// Earnings of one identity, also broken down per hermes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EarningsDetailed {
    pub total: Earnings,
    pub per_hermes: BTreeMap<HermesId, Earnings>,
}

/// A provider's channel with one hermes.
///
/// Built fresh from chain state and the stored promise on every fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Channel {
    pub chain_id: ChainId,
    pub identity: Identity,
    pub hermes_id: HermesId,
    pub channel_id: ChannelId,
    pub provider_channel: ProviderChannel,
    pub last_promise: HermesPromise,
    pub updated_at: Timestamp,
}

impl Channel {
    pub fn new(
        chain_id: ChainId,
        identity: Identity,
        hermes_id: HermesId,
        provider_channel: ProviderChannel,
        last_promise: HermesPromise,
    ) -> Self {
        Self {
            chain_id,
            channel_id: provider_channel_id(&identity, &hermes_id),
            identity,
            hermes_id,
            provider_channel,
            last_promise,
            updated_at: Timestamp::now(),
        }
    }

    /// A zero promise for a channel nothing was promised on yet.
    pub fn empty_promise(chain_id: ChainId, identity: &Identity, hermes_id: &HermesId) -> HermesPromise {
        let channel_id = provider_channel_id(identity, hermes_id);
        HermesPromise {
            promise: Promise {
                chain_id,
                channel_id: channel_id.to_bytes().unwrap_or_default(),
                ..Default::default()
            },
            channel_id,
            identity: identity.clone(),
            hermes_id: hermes_id.clone(),
            ..Default::default()
        }
    }

    fn promised(&self) -> TokenAmount {
        self.last_promise.promise.amount
    }

    /// Everything the channel could ever pay out: balance plus what was settled.
    pub fn available_balance(&self) -> TokenAmount {
        self.provider_channel
            .balance
            .saturating_add(self.provider_channel.settled)
    }

    /// What is left in the channel after the latest promise.
    pub fn balance(&self) -> TokenAmount {
        self.available_balance().saturating_sub(self.promised())
    }

    /// Promised but not yet settled.
    pub fn unsettled_balance(&self) -> TokenAmount {
        self.promised().saturating_sub(self.provider_channel.settled)
    }

    pub fn lifetime_balance(&self) -> TokenAmount {
        self.promised()
    }

    pub fn stake(&self) -> TokenAmount {
        self.provider_channel.stake
    }

    /// The stake has not reached its goal, so earnings go to stake first.
    pub fn needs_stake(&self) -> bool {
        self.provider_channel.stake < self.provider_channel.stake_goal
    }

    pub fn beneficiary(&self) -> &Address {
        &self.provider_channel.beneficiary
    }

    pub fn earnings(&self) -> Earnings {
        Earnings {
            lifetime_balance: self.lifetime_balance(),
            unsettled_balance: self.unsettled_balance(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(balance: u128, settled: u128, promised: u128) -> Channel {
        let identity = Identity::new("0x00000000000000000000000000000000000000a1");
        let hermes = HermesId::new("0x00000000000000000000000000000000000000b2");
        let mut promise = Channel::empty_promise(1, &identity, &hermes);
        promise.promise.amount = TokenAmount::new(promised);
        Channel::new(
            1,
            identity,
            hermes,
            ProviderChannel {
                balance: TokenAmount::new(balance),
                settled: TokenAmount::new(settled),
                ..Default::default()
            },
            promise,
        )
    }

    #[test]
    fn derived_balances() {
        let c = channel(7000, 3000, 5000);
        assert_eq!(c.available_balance(), TokenAmount::new(10_000));
        assert_eq!(c.balance(), TokenAmount::new(5000));
        assert_eq!(c.unsettled_balance(), TokenAmount::new(2000));
        assert_eq!(c.lifetime_balance(), TokenAmount::new(5000));
    }

    #[test]
    fn derived_balances_saturate() {
        // Settled ahead of the stored promise, promise beyond the channel.
        let c = channel(10, 500, 100);
        assert_eq!(c.unsettled_balance(), TokenAmount::ZERO);
        let c = channel(10, 0, 100);
        assert_eq!(c.balance(), TokenAmount::ZERO);
    }

    #[test]
    fn empty_promise_targets_the_channel() {
        let c = channel(0, 0, 0);
        assert_eq!(c.last_promise.channel_id, c.channel_id);
        assert_eq!(c.last_promise.promise.channel(), c.channel_id);
        assert_eq!(c.earnings(), Earnings::default());
    }

    #[test]
    fn earnings_sum() {
        let total: Earnings = [channel(0, 10, 30), channel(0, 0, 5)]
            .iter()
            .map(Channel::earnings)
            .sum();
        assert_eq!(total.lifetime_balance, TokenAmount::new(35));
        assert_eq!(total.unsettled_balance, TokenAmount::new(25));
    }
}
