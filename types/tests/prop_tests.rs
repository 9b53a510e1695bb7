use std::time::Duration;

use proptest::prelude::*;

use tollgate_types::{Address, Identity, Promise, Timestamp, TokenAmount};

proptest! {
    /// Timestamp ordering: new(a) <= new(b) iff a <= b.
    #[test]
    fn timestamp_ordering(a in 0u64..u64::MAX, b in 0u64..u64::MAX) {
        let ta = Timestamp::new(a);
        let tb = Timestamp::new(b);
        prop_assert_eq!(ta <= tb, a <= b);
        prop_assert_eq!(ta == tb, a == b);
    }

    /// Timestamp has_expired agrees with manual arithmetic.
    #[test]
    fn timestamp_has_expired(base in 0u64..1_000_000, ttl in 0u64..1_000_000, now in 0u64..3_000_000) {
        let t = Timestamp::new(base);
        prop_assert_eq!(
            t.has_expired(Duration::from_secs(ttl), Timestamp::new(now)),
            now >= base + ttl
        );
    }

    /// saturating_sub never goes below zero and matches checked arithmetic otherwise.
    #[test]
    fn amount_saturating_sub(a in any::<u128>(), b in any::<u128>()) {
        let diff = TokenAmount::new(a).saturating_sub(TokenAmount::new(b));
        prop_assert_eq!(diff.raw(), a.checked_sub(b).unwrap_or(0));
    }

    /// Basis points match exact arithmetic wherever the product fits.
    #[test]
    fn amount_basis_points(a in 0u128..(u128::MAX / 10_000), bps in 0u16..=10_000) {
        let expected = a * bps as u128 / 10_000;
        prop_assert_eq!(TokenAmount::new(a).basis_points(bps).raw(), expected);
    }

    /// A ratio within 0..=1 never yields more than the amount itself.
    #[test]
    fn amount_ratio_bounded(a in 0u128..(1u128 << 100), ratio in 0.0f64..=1.0) {
        let amount = TokenAmount::new(a);
        prop_assert!(amount.mul_ratio(ratio) <= amount);
    }

    /// Address normalization is case- and prefix-insensitive.
    #[test]
    fn address_normalization(bytes in prop::array::uniform20(0u8..)) {
        let body = hex::encode(bytes);
        let lower = Address::new(format!("0x{body}"));
        let upper = Address::new(format!("0X{}", body.to_uppercase()));
        let bare = Address::new(&body);
        prop_assert_eq!(&lower, &upper);
        prop_assert_eq!(&lower, &bare);
        prop_assert!(lower.is_valid());
        prop_assert_eq!(lower.to_bytes().unwrap(), bytes.to_vec());
    }

    /// Identities parse only from 20-byte hex strings.
    #[test]
    fn identity_parse_rejects_wrong_length(len in 0usize..40) {
        let raw = format!("0x{}", "a".repeat(len * 2 + 1));
        prop_assert!(Identity::parse(&raw).is_err());
    }
}

#[test]
fn promise_bytes_are_hex_in_json() {
    let promise = Promise {
        chain_id: 137,
        channel_id: vec![0xab; 32],
        amount: TokenAmount::new(5),
        hashlock: vec![0x01, 0x02],
        r: vec![],
        ..Default::default()
    };
    let json = serde_json::to_value(&promise).unwrap();
    assert_eq!(json["hashlock"], "0x0102");
    assert_eq!(json["amount"], 5);
    let back: Promise = serde_json::from_value(json).unwrap();
    assert_eq!(back, promise);

    let encoded = bincode::serialize(&promise).unwrap();
    assert_eq!(bincode::deserialize::<Promise>(&encoded).unwrap(), promise);
}
