//! Payment promises and the exchange messages that request them.

use serde::{Deserialize, Serialize};

use crate::{hex_bytes, ChainId, ChannelId, HermesId, Identity, TokenAmount};

/// A hermes-signed attestation of the cumulative amount earned in a channel.
///
/// `amount` only ever grows for a given channel. `r` stays empty until the
/// provider reveals it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promise {
    pub chain_id: ChainId,
    #[serde(with = "hex_bytes")]
    pub channel_id: Vec<u8>,
    pub amount: TokenAmount,
    pub fee: TokenAmount,
    #[serde(with = "hex_bytes")]
    pub hashlock: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub r: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl Promise {
    /// The channel id in its normalized `0x` + hex form.
    pub fn channel(&self) -> ChannelId {
        ChannelId::from_bytes(&self.channel_id)
    }
}

/// A consumer-signed message authorizing hermes to pay a provider.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeMessage {
    /// The consumer's promise to hermes.
    pub promise: Promise,
    pub agreement_id: u128,
    /// Total owed to the provider for this agreement so far.
    pub agreement_total: TokenAmount,
    pub provider: Identity,
    pub hermes_id: HermesId,
    pub chain_id: ChainId,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_normalizes_bytes() {
        let promise = Promise {
            channel_id: vec![0xAB, 0x01],
            ..Default::default()
        };
        assert_eq!(promise.channel().as_str(), "0xab01");
    }

    #[test]
    fn promise_survives_bincode() {
        let promise = Promise {
            chain_id: 137,
            channel_id: vec![1; 32],
            amount: TokenAmount::new(100),
            fee: TokenAmount::new(3),
            hashlock: vec![2; 32],
            r: Vec::new(),
            signature: vec![3; 65],
        };
        let bytes = bincode::serialize(&promise).unwrap();
        let back: Promise = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, promise);
    }

    #[test]
    fn exchange_message_json_carries_hex_signature() {
        let msg = ExchangeMessage {
            signature: vec![0xff],
            ..Default::default()
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["signature"], "0xff");
    }
}
