/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use log::debug;
use num_bigint::BigUint;

use crate::error::{Error, Result};
use crate::utilities::patching::find_bytes;

/// Size of the dummy signature sent when no key matches.
pub const SLA_SIGNATURE_LEN: usize = 0x100;

/// A vendor RSA key able to answer the loader SLA challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaKey {
    pub name: String,
    /// Modulus, big endian hex.
    pub n: String,
    /// Private exponent, big endian hex.
    pub d: String,
    pub e: u32,
}

impl SlaKey {
    pub fn new(name: impl Into<String>, n: impl Into<String>, d: impl Into<String>) -> Self {
        SlaKey { name: name.into(), n: n.into(), d: d.into(), e: 0x10001 }
    }

    pub fn modulus_bytes(&self) -> Option<Vec<u8>> {
        hex::decode(self.n.trim()).ok()
    }
}

/// Ordered collection of candidate keys.
#[derive(Debug, Clone, Default)]
pub struct SlaKeyring {
    keys: Vec<SlaKey>,
}

impl SlaKeyring {
    pub fn new(keys: Vec<SlaKey>) -> Self {
        SlaKeyring { keys }
    }

    pub fn keys(&self) -> &[SlaKey] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// First key, in keyring order, whose modulus is embedded in `da2`.
    pub fn select_key(&self, da2: &[u8]) -> Option<&SlaKey> {
        self.keys.iter().find(|key| match key.modulus_bytes() {
            Some(n) => find_bytes(da2, &n, 0).is_some(),
            None => {
                debug!("SLA key '{}' has an invalid modulus, skipping", key.name);
                false
            }
        })
    }
}

/// Produces the answer to the SLA challenge.
pub trait SlaSigner: Send + Sync {
    fn sign(&self, key: &SlaKey, challenge: &[u8]) -> Result<Vec<u8>>;
}

/// Plain RSA private operation, `challenge^d mod n`, left padded to the modulus size.
#[derive(Debug, Clone, Copy, Default)]
pub struct RsaSigner;

impl SlaSigner for RsaSigner {
    fn sign(&self, key: &SlaKey, challenge: &[u8]) -> Result<Vec<u8>> {
        let n = BigUint::parse_bytes(key.n.trim().as_bytes(), 16)
            .ok_or_else(|| Error::obscura(format!("Invalid modulus in key '{}'", key.name)))?;
        let d = BigUint::parse_bytes(key.d.trim().as_bytes(), 16)
            .ok_or_else(|| Error::obscura(format!("Invalid exponent in key '{}'", key.name)))?;

        let m = BigUint::from_bytes_be(challenge);
        if m >= n {
            return Err(Error::obscura("SLA challenge doesn't fit the key modulus"));
        }

        let sig = m.modpow(&d, &n).to_bytes_be();
        let size = n.bits().div_ceil(8) as usize;

        let mut out = vec![0u8; size.saturating_sub(sig.len())];
        out.extend_from_slice(&sig);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // p = 61, q = 53
    fn toy_key(name: &str) -> SlaKey {
        SlaKey { name: name.into(), n: "0CA1".into(), d: "0AC1".into(), e: 17 }
    }

    #[test]
    fn signature_verifies_with_public_exponent() {
        let key = toy_key("toy");
        let sig = RsaSigner.sign(&key, &[0x00, 0x41]).unwrap();
        assert_eq!(sig.len(), 2);

        let n = BigUint::from(3233u32);
        let back = BigUint::from_bytes_be(&sig).modpow(&BigUint::from(key.e), &n);
        assert_eq!(back, BigUint::from(0x41u32));

        assert!(RsaSigner.sign(&key, &[0xFF, 0xFF]).is_err());
    }

    #[test]
    fn key_selection_by_modulus() {
        let a = SlaKey::new("a", "DEADBEEF", "01");
        let b = SlaKey::new("b", "CAFEBABE", "01");
        let broken = SlaKey::new("broken", "XYZ", "01");

        let mut da2 = vec![0u8; 0x40];
        da2.extend_from_slice(&[0xCA, 0xFE, 0xBA, 0xBE]);
        da2.extend_from_slice(&[0u8; 0x10]);

        let forward = SlaKeyring::new(vec![broken.clone(), a.clone(), b.clone()]);
        let backward = SlaKeyring::new(vec![b.clone(), a.clone(), broken]);
        assert_eq!(forward.select_key(&da2).map(|k| k.name.as_str()), Some("b"));
        assert_eq!(backward.select_key(&da2).map(|k| k.name.as_str()), Some("b"));

        assert!(SlaKeyring::default().select_key(&da2).is_none());
        assert!(SlaKeyring::new(vec![a]).select_key(&da2).is_none());
    }
}
