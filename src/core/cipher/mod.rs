// src/core/cipher/mod.rs

//! The URI capability cipher.
//!
//! Encrypts short authorization capabilities into the URL-safe CGI fields
//! `cap.sym` (versioned header) and `cap.msg` (AEAD ciphertext and tag). The
//! header is bound to the ciphertext as associated data, so tampering with
//! either field makes decryption fail. Decryption collapses every failure
//! into an empty-string return and never panics or errors across the public
//! surface.

pub mod header;

use crate::config::{CipherConfig, CipherSaltMode, CipherSecretSource};
use crate::core::CoreError;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use zeroize::Zeroizing;

pub use header::{CapHeader, HEADER_LEN, NONCE_LEN, SALT_LEN, TAG_LEN};

/// scrypt cost parameter, must be a power of two.
const SCRYPT_N: u64 = 32768;
/// scrypt block size parameter.
const SCRYPT_R: u64 = 8;
/// scrypt parallelization parameter.
const SCRYPT_P: u64 = 1;
/// Derived key length.
const KEY_LEN: usize = 32;

/// A derived key cached together with the fixed salt it was derived from.
struct CachedKey {
    salt: [u8; SALT_LEN],
    key: Zeroizing<[u8; KEY_LEN]>,
}

/// The capability cipher with an operator-provided password.
///
/// In per-message-salt mode a fresh salt is generated and a key derived for
/// every envelope. In fixed-salt mode the salt is derived deterministically
/// from the password and the key is derived once and reused, trading the
/// per-message KDF cost for a constant salt on the wire.
pub struct UriCapCipher {
    password: Zeroizing<Vec<u8>>,
    cached: Option<CachedKey>,
}

impl UriCapCipher {
    /// Builds a cipher whose password is the SHA-256 digest of the given file.
    pub fn from_secret_file(path: &str) -> Result<Self, CoreError> {
        let data = std::fs::read(path)
            .map_err(|e| CoreError::Invalid(format!("failed to open secret file '{path}': {e}")))?;

        if data.is_empty() {
            return Err(CoreError::Invalid(format!("secret file is empty: {path}")));
        }

        let digest = Sha256::digest(&data);
        Ok(Self {
            password: Zeroizing::new(digest.to_vec()),
            cached: None,
        })
    }

    /// Builds a cipher from a raw password, deriving a fresh key per message.
    pub fn from_password(password: impl Into<Vec<u8>>) -> Self {
        Self {
            password: Zeroizing::new(password.into()),
            cached: None,
        }
    }

    /// Builds a cipher from a raw password with a deterministic salt and a
    /// cached key.
    pub fn from_password_fixed_salt(password: impl Into<Vec<u8>>) -> Result<Self, CoreError> {
        let password = Zeroizing::new(password.into());
        let digest = Sha256::digest(password.as_slice());
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&digest[..SALT_LEN]);

        let key = kdf_scrypt(&password, &salt, SCRYPT_N, SCRYPT_R, SCRYPT_P)?;

        Ok(Self {
            password,
            cached: Some(CachedKey { salt, key }),
        })
    }

    /// Builds a cipher from the node configuration.
    pub fn from_config(cfg: &CipherConfig) -> Result<Self, CoreError> {
        let base = match &cfg.secret_source {
            CipherSecretSource::FilePath(path) => Self::from_secret_file(path)?,
            CipherSecretSource::RawPassword(pw) => Self::from_password(pw.as_bytes().to_vec()),
        };

        match cfg.mode {
            CipherSaltMode::PerMessageSalt => Ok(base),
            CipherSaltMode::FixedSalt => Self::from_password_fixed_salt(base.password.to_vec()),
        }
    }

    /// Encrypts the plaintext into `"cap.sym=<...>&cap.msg=<...>"`.
    /// Returns an empty string when the system RNG fails.
    pub fn encrypt_to_cgi(&self, plaintext: &[u8]) -> String {
        let mut h = CapHeader::new(SCRYPT_N, SCRYPT_R, SCRYPT_P);

        let key: Zeroizing<[u8; KEY_LEN]> = if let Some(cached) = &self.cached {
            h.salt = cached.salt;
            cached.key.clone()
        } else {
            if getrandom::fill(&mut h.salt).is_err() {
                warn!("msg=\"system rng failure while generating salt\"");
                return String::new();
            }
            match kdf_scrypt(&self.password, &h.salt, h.n, h.r, h.p) {
                Ok(key) => key,
                Err(e) => {
                    warn!("msg=\"key derivation failed\" err={e}");
                    return String::new();
                }
            }
        };

        if getrandom::fill(&mut h.nonce).is_err() {
            warn!("msg=\"system rng failure while generating nonce\"");
            return String::new();
        }

        let cap_sym = URL_SAFE_NO_PAD.encode(h.serialize());

        // AEAD with AAD = exact cap.sym string bytes. The encrypt output is
        // ciphertext with the 16-byte tag appended.
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
        let payload = Payload {
            msg: plaintext,
            aad: cap_sym.as_bytes(),
        };

        let Ok(ct_and_tag) = cipher.encrypt(Nonce::from_slice(&h.nonce), payload) else {
            warn!("msg=\"aead encryption failed\"");
            return String::new();
        };

        let cap_msg = URL_SAFE_NO_PAD.encode(ct_and_tag);
        format!("cap.sym={cap_sym}&cap.msg={cap_msg}")
    }

    /// Decrypts a query string carrying `cap.sym` and `cap.msg`.
    /// Any parse, sanity, KDF or authentication failure yields `""`.
    pub fn decrypt_from_cgi(&self, cgi: &str) -> String {
        self.try_decrypt(cgi).unwrap_or_default()
    }

    fn try_decrypt(&self, cgi: &str) -> Option<String> {
        let cap_sym = percent_decode(&get_query_value(cgi, "cap.sym")?);
        let cap_msg = percent_decode(&get_query_value(cgi, "cap.msg")?);

        if cap_sym.is_empty() || cap_msg.is_empty() {
            return None;
        }

        let sym_bytes = URL_SAFE_NO_PAD.decode(&cap_sym).ok()?;
        let h = CapHeader::parse(&sym_bytes).ok()?;

        if !h.is_sane() {
            debug!("msg=\"capability header failed sanity checks\"");
            return None;
        }

        let msg_bytes = URL_SAFE_NO_PAD.decode(&cap_msg).ok()?;
        if msg_bytes.len() < TAG_LEN {
            return None;
        }

        // Reuse the cached key when the header salt matches, derive otherwise.
        let key: Zeroizing<[u8; KEY_LEN]> = match &self.cached {
            Some(cached) if cached.salt == h.salt => cached.key.clone(),
            _ => kdf_scrypt(&self.password, &h.salt, h.n, h.r, h.p).ok()?,
        };

        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
        let payload = Payload {
            msg: msg_bytes.as_slice(),
            aad: cap_sym.as_bytes(),
        };

        let plaintext = cipher.decrypt(Nonce::from_slice(&h.nonce), payload).ok()?;
        String::from_utf8(plaintext).ok()
    }
}

/// Derives a 32-byte key with scrypt. The parameters come off the wire on
/// decryption, so conversion failures map to errors rather than panics.
fn kdf_scrypt(
    password: &[u8],
    salt: &[u8],
    n: u64,
    r: u64,
    p: u64,
) -> Result<Zeroizing<[u8; KEY_LEN]>, CoreError> {
    if !n.is_power_of_two() || n < 2 {
        return Err(CoreError::Invalid(format!("scrypt N not a power of two: {n}")));
    }

    let log_n = n.trailing_zeros() as u8;
    let r: u32 = r
        .try_into()
        .map_err(|_| CoreError::Invalid(format!("scrypt r out of range: {r}")))?;
    let p: u32 = p
        .try_into()
        .map_err(|_| CoreError::Invalid(format!("scrypt p out of range: {p}")))?;

    let params = scrypt::Params::new(log_n, r, p, KEY_LEN)
        .map_err(|e| CoreError::Invalid(format!("invalid scrypt parameters: {e}")))?;

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    scrypt::scrypt(password, salt, &params, key.as_mut_slice())
        .map_err(|e| CoreError::Internal(format!("scrypt failed: {e}")))?;
    Ok(key)
}

/// Extracts the raw value of `key` from a `k=v&k=v` query string.
fn get_query_value(input: &str, key: &str) -> Option<String> {
    for part in input.split('&') {
        if let Some((k, v)) = part.split_once('=')
            && k == key
        {
            return Some(v.to_string());
        }
    }
    None
}

/// Percent-decodes a query value, accepting `+` as space.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let h1 = (bytes[i + 1] as char).to_digit(16);
                let h2 = (bytes[i + 2] as char).to_digit(16);
                if let (Some(h1), Some(h2)) = (h1, h2) {
                    out.push(((h1 << 4) | h2) as u8);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}
