//! Deterministic channel identifiers.
//!
//! A channel is fully determined by the identity and the hermes it is opened
//! with, so its id is never stored on its own.

use tollgate_types::{Address, ChannelId, HermesId, Identity};

use crate::hash::blake2b_256_multi;

const PROVIDER_TAG: &[u8] = b"tollgate/provider-channel";
const CONSUMER_TAG: &[u8] = b"tollgate/consumer-channel";
const PAY_AND_SETTLE_TAG: &[u8] = b"tollgate/pay-and-settle-channel";

/// Id of the channel hermes pays a provider from.
pub fn provider_channel_id(identity: &Identity, hermes: &HermesId) -> ChannelId {
    let digest = blake2b_256_multi(&[
        PROVIDER_TAG,
        identity.as_str().as_bytes(),
        hermes.as_str().as_bytes(),
    ]);
    ChannelId::from_bytes(&digest)
}

/// On-chain address of the channel a consumer pays hermes from.
pub fn consumer_channel_address(identity: &Identity, hermes: &HermesId) -> Address {
    let digest = blake2b_256_multi(&[
        CONSUMER_TAG,
        identity.as_str().as_bytes(),
        hermes.as_str().as_bytes(),
    ]);
    Address::from_bytes(&digest[12..])
}

/// Id of the channel hermes uses for a provider's withdrawals.
///
/// Kept apart from the earning channel so a withdrawal never moves that
/// channel's promise.
pub fn pay_and_settle_channel_id(identity: &Identity, hermes: &HermesId) -> ChannelId {
    let digest = blake2b_256_multi(&[
        PAY_AND_SETTLE_TAG,
        identity.as_str().as_bytes(),
        hermes.as_str().as_bytes(),
    ]);
    ChannelId::from_bytes(&digest)
}
