// tests/property/cipher_test.rs

//! Property-based tests for the capability cipher.

use garnetfs::core::cipher::UriCapCipher;
use once_cell::sync::Lazy;
use proptest::prelude::*;

// Key derivation is deliberately expensive; share one fixed-salt cipher so
// the property runs reuse the cached key.
static CIPHER: Lazy<UriCapCipher> =
    Lazy::new(|| UriCapCipher::from_password_fixed_salt(b"property-password".to_vec()).unwrap());

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 200,
        ..ProptestConfig::default()
    })]

    /// decrypt(encrypt(p)) == p for arbitrary plaintexts.
    #[test]
    fn test_encrypt_decrypt_roundtrip(plaintext in ".{0,4096}") {
        let cgi = CIPHER.encrypt_to_cgi(plaintext.as_bytes());
        prop_assert_eq!(CIPHER.decrypt_from_cgi(&cgi), plaintext);
    }

    /// Flipping any single character of either field yields empty.
    #[test]
    fn test_tamper_detection(plaintext in ".{1,512}", pos_seed in any::<usize>()) {
        let cgi = CIPHER.encrypt_to_cgi(plaintext.as_bytes());
        let bytes = cgi.as_bytes();

        // Pick a position inside a value, never a separator or '='.
        let candidates: Vec<usize> = (0..bytes.len())
            .filter(|&i| bytes[i] != b'&' && bytes[i] != b'=' && bytes[i] != b'.')
            .filter(|&i| !cgi[..i].ends_with("cap"))
            .collect();
        let pos = candidates[pos_seed % candidates.len()];

        let mut tampered = cgi.clone().into_bytes();
        // Swap to a different base64url character.
        tampered[pos] = if tampered[pos] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).unwrap();

        if tampered != cgi {
            prop_assert_eq!(CIPHER.decrypt_from_cgi(&tampered), "");
        }
    }

    /// Swapping the header between two envelopes breaks both.
    #[test]
    fn test_aad_binding(pa in ".{1,256}", pb in ".{1,256}") {
        prop_assume!(pa != pb);

        let a = CIPHER.encrypt_to_cgi(pa.as_bytes());
        let b = CIPHER.encrypt_to_cgi(pb.as_bytes());

        let sym_a = field(&a, "cap.sym");
        let msg_a = field(&a, "cap.msg");
        let sym_b = field(&b, "cap.sym");
        let msg_b = field(&b, "cap.msg");

        let crossed_a = format!("cap.sym={sym_b}&cap.msg={msg_a}");
        let crossed_b = format!("cap.sym={sym_a}&cap.msg={msg_b}");

        prop_assert_eq!(CIPHER.decrypt_from_cgi(&crossed_a), "");
        prop_assert_eq!(CIPHER.decrypt_from_cgi(&crossed_b), "");
    }
}

/// Boundary behaviors outside the proptest harness.
#[test]
fn test_decrypt_boundaries() {
    let cipher = &*CIPHER;

    // cap.sym not decoding to the fixed header length.
    assert_eq!(cipher.decrypt_from_cgi("cap.sym=AAAA&cap.msg=AAAAAAAA"), "");

    // cap.msg shorter than the authentication tag.
    let valid = cipher.encrypt_to_cgi(b"x");
    let sym = field(&valid, "cap.sym");
    assert_eq!(
        cipher.decrypt_from_cgi(&format!("cap.sym={sym}&cap.msg=AAAA")),
        ""
    );

    // Missing fields and junk never panic.
    assert_eq!(cipher.decrypt_from_cgi(""), "");
    assert_eq!(cipher.decrypt_from_cgi("cap.sym=&cap.msg="), "");
    assert_eq!(cipher.decrypt_from_cgi("unrelated=1"), "");
    assert_eq!(cipher.decrypt_from_cgi("cap.sym"), "");
}

fn field(cgi: &str, key: &str) -> String {
    cgi.split('&')
        .find_map(|p| {
            let (k, v) = p.split_once('=')?;
            (k == key).then(|| v.to_string())
        })
        .unwrap_or_default()
}
