// Visor identity keys
// This file defines the public key type that names every visor and setup node,
// plus helpers to derive it from a hex-encoded Ed25519 secret seed
//
// Numan Thabit 2025 Nov

use crate::errors::KeyError;
use ed25519_dalek::{SigningKey, VerifyingKey};
use hex::FromHex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub const PUBKEY_LEN: usize = 32;

/// Ed25519 public key identifying a visor or setup node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PubKey([u8; PUBKEY_LEN]);

impl PubKey {
    pub const fn from_bytes(bytes: [u8; PUBKEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBKEY_LEN] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0u8; PUBKEY_LEN]
    }

    /// Equality that does not short-circuit on the first differing byte.
    pub fn ct_eq(&self, other: &PubKey) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    /// Checks the key is a valid curve point.
    pub fn verifying_key(&self) -> Result<VerifyingKey, KeyError> {
        VerifyingKey::from_bytes(&self.0).map_err(|_| KeyError::InvalidPoint)
    }
}

impl From<&SigningKey> for PubKey {
    fn from(sk: &SigningKey) -> Self {
        Self(sk.verifying_key().to_bytes())
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", hex::encode(&self.0[..8]))
    }
}

impl FromStr for PubKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <[u8; PUBKEY_LEN]>::from_hex(s)
            .map(Self)
            .map_err(|e| KeyError::Hex(e.to_string()))
    }
}

impl Serialize for PubKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PubKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse a hex-encoded 32-byte Ed25519 seed.
pub fn signing_key_from_hex(secret_hex: &str) -> Result<SigningKey, KeyError> {
    let sk_bytes = <[u8; 32]>::from_hex(secret_hex.trim())
        .map_err(|e| KeyError::Hex(e.to_string()))?;
    Ok(SigningKey::from_bytes(&sk_bytes))
}

/// Derive the public key for a hex-encoded secret seed.
pub fn pubkey_from_secret_hex(secret_hex: &str) -> Result<PubKey, KeyError> {
    signing_key_from_hex(secret_hex).map(|sk| PubKey::from(&sk))
}

/// Constant-time membership test; every candidate is compared.
pub fn contains_ct(set: &[PubKey], pk: &PubKey) -> bool {
    set.iter().fold(false, |found, candidate| found | candidate.ct_eq(pk))
}
