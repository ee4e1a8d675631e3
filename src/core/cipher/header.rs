// src/core/cipher/header.rs

//! The fixed binary header carried in the `cap.sym` CGI field.

use crate::core::CoreError;

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Serialized header size: 4 one-byte fields, 3 little-endian u64 KDF
/// parameters, the salt and the nonce.
pub const HEADER_LEN: usize = 4 + 3 * 8 + SALT_LEN + NONCE_LEN;

pub const VERSION_V1: u8 = 1;
pub const KDF_SCRYPT: u8 = 1;
pub const AEAD_CHACHA20_POLY1305: u8 = 1;

/// The envelope header binding version, KDF parameters, salt and nonce.
///
/// Its base64url encoding is the `cap.sym` field and doubles as the
/// associated data of the AEAD, so any header modification invalidates the
/// ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapHeader {
    pub version: u8,
    pub kdf: u8,
    pub aead: u8,
    pub reserved: u8,
    pub n: u64,
    pub r: u64,
    pub p: u64,
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
}

impl CapHeader {
    pub fn new(n: u64, r: u64, p: u64) -> Self {
        Self {
            version: VERSION_V1,
            kdf: KDF_SCRYPT,
            aead: AEAD_CHACHA20_POLY1305,
            reserved: 0,
            n,
            r,
            p,
            salt: [0u8; SALT_LEN],
            nonce: [0u8; NONCE_LEN],
        }
    }

    /// Serializes the header into its fixed little-endian layout.
    pub fn serialize(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.version;
        out[1] = self.kdf;
        out[2] = self.aead;
        out[3] = self.reserved;
        out[4..12].copy_from_slice(&self.n.to_le_bytes());
        out[12..20].copy_from_slice(&self.r.to_le_bytes());
        out[20..28].copy_from_slice(&self.p.to_le_bytes());
        out[28..28 + SALT_LEN].copy_from_slice(&self.salt);
        out[44..44 + NONCE_LEN].copy_from_slice(&self.nonce);
        out
    }

    /// Parses a header from its serialized form. The input must be exactly
    /// [`HEADER_LEN`] bytes.
    pub fn parse(data: &[u8]) -> Result<Self, CoreError> {
        if data.len() != HEADER_LEN {
            return Err(CoreError::Invalid(format!(
                "cap.sym header wrong length: {}",
                data.len()
            )));
        }

        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        salt.copy_from_slice(&data[28..28 + SALT_LEN]);
        nonce.copy_from_slice(&data[44..44 + NONCE_LEN]);

        Ok(Self {
            version: data[0],
            kdf: data[1],
            aead: data[2],
            reserved: data[3],
            n: u64::from_le_bytes(data[4..12].try_into().expect("8 bytes")),
            r: u64::from_le_bytes(data[12..20].try_into().expect("8 bytes")),
            p: u64::from_le_bytes(data[20..28].try_into().expect("8 bytes")),
            salt,
            nonce,
        })
    }

    /// Basic sanity checks on version, algorithm ids and KDF parameters.
    pub fn is_sane(&self) -> bool {
        self.version == VERSION_V1
            && self.kdf == KDF_SCRYPT
            && self.aead == AEAD_CHACHA20_POLY1305
            && self.n >= 2
            && self.n.is_power_of_two()
            && self.r > 0
            && self.p > 0
    }
}
