//! Signing contract and the digests that get signed.
//!
//! Key storage and the signature scheme live outside this crate; callers
//! hand a [`Signer`] in. The digests here fix what bytes a signature covers.

use tollgate_types::{Address, ChainId, ExchangeMessage, Identity, Promise, TokenAmount};

use crate::hash::blake2b_256_multi;
use crate::CryptoError;

const PROMISE_TAG: &[u8] = b"tollgate/promise";
const EXCHANGE_TAG: &[u8] = b"tollgate/exchange-message";
const BENEFICIARY_TAG: &[u8] = b"tollgate/beneficiary";
const REFRESH_TAG: &[u8] = b"tollgate/refresh-promise";

/// Produces signatures on behalf of an unlocked identity.
pub trait Signer: Send + Sync {
    fn sign(&self, identity: &Identity, message: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Digest a promise signature covers. The signature and R are excluded.
pub fn promise_digest(promise: &Promise) -> [u8; 32] {
    blake2b_256_multi(&[
        PROMISE_TAG,
        &promise.chain_id.to_be_bytes(),
        promise.channel_id.as_slice(),
        &promise.amount.raw().to_be_bytes(),
        &promise.fee.raw().to_be_bytes(),
        promise.hashlock.as_slice(),
    ])
}

pub fn exchange_message_digest(message: &ExchangeMessage) -> [u8; 32] {
    blake2b_256_multi(&[
        EXCHANGE_TAG,
        &promise_digest(&message.promise),
        &message.agreement_id.to_be_bytes(),
        &message.agreement_total.raw().to_be_bytes(),
        message.provider.as_str().as_bytes(),
        message.hermes_id.as_str().as_bytes(),
        &message.chain_id.to_be_bytes(),
    ])
}

/// Digest authorizing a withdrawal of `amount` from `channel_id` to `beneficiary`.
pub fn beneficiary_digest(
    beneficiary: &Address,
    chain_id: ChainId,
    channel_id: &[u8],
    amount: TokenAmount,
    r: &[u8],
) -> [u8; 32] {
    blake2b_256_multi(&[
        BENEFICIARY_TAG,
        beneficiary.as_str().as_bytes(),
        &chain_id.to_be_bytes(),
        channel_id,
        &amount.raw().to_be_bytes(),
        r,
    ])
}

/// Digest asking hermes to reissue a promise under a new hashlock.
pub fn refresh_digest(chain_id: ChainId, identity: &Identity, hashlock: &[u8]) -> [u8; 32] {
    blake2b_256_multi(&[
        REFRESH_TAG,
        &chain_id.to_be_bytes(),
        identity.as_str().as_bytes(),
        hashlock,
    ])
}
