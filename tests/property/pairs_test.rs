// tests/property/pairs_test.rs

//! Property-based tests for the bus wire codec.

use garnetfs::core::bus::envelope::{
    self, Envelope, EnvelopeCmd, SubjectKind, encode_keys, encode_pairs, parse_keys, parse_pairs,
};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Keys and values free of the reserved wire bytes.
fn wire_safe() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_./-]{1,32}"
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        ..ProptestConfig::default()
    })]

    /// Encoding then decoding a finite map yields the same map.
    #[test]
    fn test_pairs_roundtrip(
        entries in prop::collection::btree_map(wire_safe(), (wire_safe(), 0u64..1_000_000), 0..32)
    ) {
        let encoded = encode_pairs(
            entries.iter().map(|(k, (v, cid))| (k.as_str(), v.as_str(), *cid)),
        ).unwrap();

        let decoded = parse_pairs(&encoded).unwrap();
        let decoded_map: BTreeMap<String, (String, u64)> = decoded
            .into_iter()
            .map(|(k, v, cid)| (k, (v, cid)))
            .collect();

        prop_assert_eq!(decoded_map, entries);
    }

    /// Deletion key lists survive the round trip in order.
    #[test]
    fn test_keys_roundtrip(keys in prop::collection::vec(wire_safe(), 0..32)) {
        let mut unique = keys.clone();
        unique.sort();
        unique.dedup();

        let encoded = encode_keys(unique.iter().map(|k| k.as_str())).unwrap();
        prop_assert_eq!(parse_keys(&encoded), unique);
    }

    /// Envelope bodies round-trip through the flat wire format.
    #[test]
    fn test_envelope_body_roundtrip(
        subject in "[a-zA-Z0-9_./-]{1,24}",
        entries in prop::collection::btree_map(wire_safe(), (wire_safe(), 0u64..1000), 1..8)
    ) {
        let pairs = encode_pairs(
            entries.iter().map(|(k, (v, cid))| (k.as_str(), v.as_str(), *cid)),
        ).unwrap();

        let env = Envelope {
            cmd: EnvelopeCmd::Update,
            subject: subject.clone(),
            kind: SubjectKind::Hash,
            reply: None,
            pairs: Some(pairs.clone()),
            keys: None,
        };

        let parsed = Envelope::parse_body(&env.to_body()).unwrap();
        prop_assert_eq!(parsed.cmd, EnvelopeCmd::Update);
        prop_assert_eq!(parsed.subject, subject);
        prop_assert_eq!(parsed.kind, SubjectKind::Hash);
        prop_assert_eq!(parsed.pairs, Some(pairs));
    }

    /// Values carrying reserved delimiter bytes are rejected at emission.
    #[test]
    fn test_reserved_bytes_rejected(key in wire_safe(), bad in "[|~%&=]{1}") {
        let value = format!("prefix{bad}suffix");
        prop_assert!(encode_pairs([(key.as_str(), value.as_str(), 1u64)]).is_err());
    }
}

/// Malformed pair tags fail the parse instead of panicking.
#[test]
fn test_malformed_pairs() {
    // Unbalanced delimiter counts.
    assert!(parse_pairs("|k~v").is_err());
    assert!(parse_pairs("|k%1").is_err());
    assert!(parse_pairs("~v%1").is_err());

    // Delimiters out of order.
    assert!(parse_pairs("~|k%v1").is_err());
    assert!(parse_pairs("|a~b%1%2~c|d").is_err());

    // Change id is numeric.
    assert!(parse_pairs("|k~v%notanumber").is_err());

    // The empty tag decodes to the empty map.
    assert_eq!(parse_pairs("").unwrap(), vec![]);
}

/// Envelope parsing demands subject, type and command tags.
#[test]
fn test_envelope_missing_tags() {
    assert!(Envelope::parse_body("mqsh.cmd=update&mqsh.type=hash").is_err());
    assert!(Envelope::parse_body("mqsh.cmd=update&mqsh.subject=s").is_err());
    assert!(Envelope::parse_body("mqsh.subject=s&mqsh.type=hash").is_err());
    assert!(Envelope::parse_body("mqsh.cmd=bogus&mqsh.subject=s&mqsh.type=hash").is_err());
    assert!(Envelope::parse_body("mqsh.cmd=update&mqsh.subject=s&mqsh.type=tree").is_err());
}

/// The update tags render in the documented order.
#[test]
fn test_update_body_shape() {
    let pairs = envelope::encode_pairs([("status", "booted", 3u64)]).unwrap();
    let env = Envelope {
        cmd: EnvelopeCmd::Update,
        subject: "fs/7".to_string(),
        kind: SubjectKind::Hash,
        reply: None,
        pairs: Some(pairs),
        keys: None,
    };

    assert_eq!(
        env.to_body(),
        "mqsh.cmd=update&mqsh.subject=fs/7&mqsh.type=hash&mqsh.pairs=|status~booted%3"
    );
}
