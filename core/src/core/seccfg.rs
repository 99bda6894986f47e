/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Version 4 `seccfg` partition, which holds the bootloader lock state.
//!
//! The header is seven little endian dwords followed by the SHA-256 of those
//! dwords, encrypted by the SoC crypto engine. Changing the lock state means
//! recomputing that hash and encrypting it the same way the device did.
use log::{debug, info};
use sha2::{Digest, Sha256};

use crate::core::crypto::{CryptoIO, HwCrypto};
use crate::error::{Error, Result};
use crate::le_u32;

pub const V4_MAGIC_BEGIN: u32 = 0x4D4D_4D4D;
pub const V4_MAGIC_END: u32 = 0x4545_4545;
const V4_HEADER_LEN: usize = 7 * 4;
const HASH_LEN: usize = 0x20;
/// The rewritten image is padded to whole blocks.
const IMAGE_ALIGN: usize = 0x200;

const LKS_DEFAULT: u32 = 1;
const LKS_UNLOCK: u32 = 3;
const LKCS_UNLOCK: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockFlag {
    Lock,
    Unlock,
}

/// Engine variant the device used to encrypt the seccfg hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecCfgAlgo {
    Sw,
    HwV2,
    HwV3,
    /// V3 engine in legacy mode.
    HwV4,
}

impl SecCfgAlgo {
    /// Order in which variants are tried against a stored hash.
    pub const ALL: [SecCfgAlgo; 4] = [SecCfgAlgo::Sw, SecCfgAlgo::HwV2, SecCfgAlgo::HwV3, SecCfgAlgo::HwV4];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecCfgV4 {
    pub seccfg_ver: u32,
    pub seccfg_size: u32,
    pub lock_state: u32,
    pub critical_lock_state: u32,
    pub sboot_runtime: u32,
    pub algo: Option<SecCfgAlgo>,
    pub enc_hash: Vec<u8>,
}

impl SecCfgV4 {
    /// Reads the header and the stored hash, without touching the crypto engine.
    pub fn parse_header(data: &[u8]) -> Result<SecCfgV4> {
        if data.len() < V4_HEADER_LEN {
            return Err(Error::obscura("SecCfg v4 data too short"));
        }

        if le_u32!(data, 0) != V4_MAGIC_BEGIN || le_u32!(data, 24) != V4_MAGIC_END {
            return Err(Error::obscura("Invalid SecCfg v4 magic values"));
        }

        let seccfg_size = le_u32!(data, 8);
        let enc_hash = (seccfg_size as usize)
            .checked_sub(HASH_LEN)
            .and_then(|start| data.get(start..start + HASH_LEN))
            .ok_or_else(|| Error::obscura(format!("SecCfg size 0x{seccfg_size:X} doesn't fit the partition")))?;

        Ok(SecCfgV4 {
            seccfg_ver: le_u32!(data, 4),
            seccfg_size,
            lock_state: le_u32!(data, 12),
            critical_lock_state: le_u32!(data, 16),
            sboot_runtime: le_u32!(data, 20),
            algo: None,
            enc_hash: enc_hash.to_vec(),
        })
    }

    /// Parses `data` and finds the engine variant its hash was encrypted with.
    pub async fn parse(data: &[u8], crypto: &mut dyn HwCrypto, io: &mut (dyn CryptoIO + Send)) -> Result<SecCfgV4> {
        let mut seccfg = SecCfgV4::parse_header(data)?;
        seccfg.detect_algo(crypto, io).await?;
        Ok(seccfg)
    }

    fn header(&self) -> Vec<u8> {
        [
            V4_MAGIC_BEGIN,
            self.seccfg_ver,
            self.seccfg_size,
            self.lock_state,
            self.critical_lock_state,
            self.sboot_runtime,
            V4_MAGIC_END,
        ]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
    }

    pub fn get_hash(&self) -> Vec<u8> {
        Sha256::digest(self.header()).to_vec()
    }

    pub fn is_unlocked(&self) -> bool {
        self.lock_state == LKS_UNLOCK
    }

    async fn detect_algo(&mut self, crypto: &mut dyn HwCrypto, io: &mut (dyn CryptoIO + Send)) -> Result<SecCfgAlgo> {
        let hash = self.get_hash();

        for algo in SecCfgAlgo::ALL {
            let Some(dec) = crypto.seccfg_hash(io, algo, &self.enc_hash, false).await else {
                continue;
            };
            if dec == hash {
                debug!("SecCfg hash encrypted with {algo:?}");
                self.algo = Some(algo);
                return Ok(algo);
            }
        }

        Err(Error::obscura("Unknown SecCfg encryption, the device may already be unlocked"))
    }

    /// Updates the lock fields, refusing a state the device is already in.
    pub fn set_lock_state(&mut self, flag: LockFlag) -> Result<()> {
        match flag {
            LockFlag::Lock if self.lock_state == LKS_DEFAULT => Err(Error::obscura("Device is already locked")),
            LockFlag::Unlock if self.lock_state == LKS_UNLOCK => Err(Error::obscura("Device is already unlocked")),
            LockFlag::Lock => {
                self.lock_state = LKS_DEFAULT;
                self.critical_lock_state = 0;
                Ok(())
            }
            LockFlag::Unlock => {
                self.lock_state = LKS_UNLOCK;
                self.critical_lock_state = LKCS_UNLOCK;
                Ok(())
            }
        }
    }

    /// Builds the partition image with the hash encrypted by the detected engine variant.
    pub async fn create(&mut self, crypto: &mut dyn HwCrypto, io: &mut (dyn CryptoIO + Send)) -> Result<Vec<u8>> {
        let algo = self.algo.ok_or_else(|| Error::obscura("SecCfg encryption not detected"))?;

        let enc_hash = crypto
            .seccfg_hash(io, algo, &self.get_hash(), true)
            .await
            .ok_or_else(|| Error::obscura(format!("Crypto engine couldn't encrypt with {algo:?}")))?;
        self.enc_hash = enc_hash;

        let mut data = self.header();
        data.extend_from_slice(&self.enc_hash);
        data.resize(data.len().next_multiple_of(IMAGE_ALIGN), 0);

        info!("[Obscura] Built seccfg with lock state {}", self.lock_state);
        Ok(data)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::core::crypto::OTP_LEN;

    /// Engine that only knows one variant, a plain XOR with `key`.
    pub(crate) struct XorEngine {
        pub algo: SecCfgAlgo,
        pub key: u8,
    }

    #[async_trait]
    impl HwCrypto for XorEngine {
        async fn rpmb_key(&mut self, _: &mut (dyn CryptoIO + Send), _: &[u8], _: &[u8; OTP_LEN]) -> Option<Vec<u8>> {
            None
        }

        async fn seccfg_hash(
            &mut self,
            _: &mut (dyn CryptoIO + Send),
            algo: SecCfgAlgo,
            data: &[u8],
            _encrypt: bool,
        ) -> Option<Vec<u8>> {
            (algo == self.algo).then(|| data.iter().map(|b| b ^ self.key).collect())
        }
    }

    /// Registers are never touched by `XorEngine`.
    pub(crate) struct NoIo;

    #[async_trait]
    impl CryptoIO for NoIo {
        async fn read32(&mut self, _: u32) -> u32 {
            0
        }

        async fn write32(&mut self, _: u32, _: u32) {}
    }

    /// A seccfg image in `lock_state`, hash encrypted with `key`.
    pub(crate) fn seccfg_image(lock_state: u32, key: u8) -> Vec<u8> {
        let seccfg = SecCfgV4 {
            seccfg_ver: 4,
            seccfg_size: 0x3C,
            lock_state,
            critical_lock_state: 0,
            sboot_runtime: 0,
            algo: None,
            enc_hash: Vec::new(),
        };
        let mut data = seccfg.header();
        data.extend(seccfg.get_hash().iter().map(|b| b ^ key));
        data.resize(0x200, 0);
        data
    }

    #[test]
    fn header_fields() {
        let data = seccfg_image(LKS_DEFAULT, 0x5A);
        let seccfg = SecCfgV4::parse_header(&data).unwrap();

        assert_eq!(seccfg.seccfg_ver, 4);
        assert_eq!(seccfg.seccfg_size, 0x3C);
        assert_eq!(seccfg.lock_state, LKS_DEFAULT);
        assert_eq!(seccfg.enc_hash, &data[0x1C..0x3C]);
        assert!(!seccfg.is_unlocked());
    }

    #[test]
    fn broken_headers() {
        assert!(SecCfgV4::parse_header(&[0x4D; 0x10]).is_err());

        let mut data = seccfg_image(LKS_DEFAULT, 0);
        data[24] = 0;
        assert!(SecCfgV4::parse_header(&data).is_err());

        // Hash would sit past the end of the data
        let mut data = seccfg_image(LKS_DEFAULT, 0);
        data[8..12].copy_from_slice(&0x1000u32.to_le_bytes());
        assert!(SecCfgV4::parse_header(&data).is_err());

        let mut data = seccfg_image(LKS_DEFAULT, 0);
        data[8..12].copy_from_slice(&0x10u32.to_le_bytes());
        assert!(SecCfgV4::parse_header(&data).is_err());
    }

    #[tokio::test]
    async fn unlock_reencrypts_with_the_same_variant() {
        let mut engine = XorEngine { algo: SecCfgAlgo::HwV3, key: 0x5A };
        let data = seccfg_image(LKS_DEFAULT, 0x5A);

        let mut seccfg = SecCfgV4::parse(&data, &mut engine, &mut NoIo).await.unwrap();
        assert_eq!(seccfg.algo, Some(SecCfgAlgo::HwV3));

        seccfg.set_lock_state(LockFlag::Unlock).unwrap();
        let image = seccfg.create(&mut engine, &mut NoIo).await.unwrap();

        assert_eq!(image.len(), 0x200);
        assert_eq!(le_u32!(image, 12), LKS_UNLOCK);
        assert_eq!(le_u32!(image, 16), LKCS_UNLOCK);
        assert_eq!(image, seccfg_image_with(LKS_UNLOCK, LKCS_UNLOCK, 0x5A));

        // The new image reads back as unlocked with the same variant
        let back = SecCfgV4::parse(&image, &mut engine, &mut NoIo).await.unwrap();
        assert!(back.is_unlocked());
        assert_eq!(back.algo, Some(SecCfgAlgo::HwV3));
    }

    fn seccfg_image_with(lock_state: u32, critical: u32, key: u8) -> Vec<u8> {
        let mut data = seccfg_image(lock_state, key);
        data[16..20].copy_from_slice(&critical.to_le_bytes());
        let seccfg = SecCfgV4::parse_header(&data).unwrap();
        let enc: Vec<u8> = seccfg.get_hash().iter().map(|b| b ^ key).collect();
        data[0x1C..0x3C].copy_from_slice(&enc);
        data
    }

    #[tokio::test]
    async fn lock_state_is_checked() {
        let mut engine = XorEngine { algo: SecCfgAlgo::Sw, key: 0 };

        let mut locked = SecCfgV4::parse(&seccfg_image(LKS_DEFAULT, 0), &mut engine, &mut NoIo).await.unwrap();
        assert!(locked.set_lock_state(LockFlag::Lock).is_err());

        let mut unlocked = SecCfgV4::parse(&seccfg_image(LKS_UNLOCK, 0), &mut engine, &mut NoIo).await.unwrap();
        assert!(unlocked.set_lock_state(LockFlag::Unlock).is_err());
        unlocked.set_lock_state(LockFlag::Lock).unwrap();
        assert_eq!((unlocked.lock_state, unlocked.critical_lock_state), (LKS_DEFAULT, 0));
    }

    #[tokio::test]
    async fn unknown_encryption() {
        let mut engine = XorEngine { algo: SecCfgAlgo::HwV2, key: 0x11 };
        let data = seccfg_image(LKS_DEFAULT, 0x22);
        assert!(SecCfgV4::parse(&data, &mut engine, &mut NoIo).await.is_err());

        let mut seccfg = SecCfgV4::parse_header(&data).unwrap();
        assert!(seccfg.create(&mut engine, &mut NoIo).await.is_err());
    }
}
