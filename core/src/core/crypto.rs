/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use async_trait::async_trait;

use crate::core::seccfg::SecCfgAlgo;
use crate::utilities::patching::find_bytes;

/// Marker preceding the OTP seed inside a preloader image.
const OTP_MARKER: &[u8] = b"\x4D\x4D\x4D\x01\x30";
const OTP_OFFSET: usize = 0xC;
pub const OTP_LEN: usize = 32;

/// Register access handed to a crypto engine, so it can drive the hardware
/// block through whatever channel the session has.
#[async_trait]
pub trait CryptoIO: Send {
    async fn read32(&mut self, addr: u32) -> u32;
    async fn write32(&mut self, addr: u32, val: u32);
}

/// Hardware crypto engine (SEJ, GCPU...). Opaque to this crate.
#[async_trait]
pub trait HwCrypto: Send {
    /// Derives the RPMB authentication key from the MEID and the OTP seed.
    async fn rpmb_key(
        &mut self,
        io: &mut (dyn CryptoIO + Send),
        meid: &[u8],
        otp: &[u8; OTP_LEN],
    ) -> Option<Vec<u8>>;

    /// Encrypts (or decrypts) the seccfg hash with engine variant `algo`.
    /// Engines that can't do `algo` return `None`.
    async fn seccfg_hash(
        &mut self,
        _io: &mut (dyn CryptoIO + Send),
        _algo: SecCfgAlgo,
        _data: &[u8],
        _encrypt: bool,
    ) -> Option<Vec<u8>> {
        None
    }
}

/// Extracts the OTP seed from a preloader image, zeros if there isn't one.
pub fn find_otp(preloader: Option<&[u8]>) -> [u8; OTP_LEN] {
    let mut otp = [0u8; OTP_LEN];

    let Some(pl) = preloader else {
        return otp;
    };

    if let Some(idx) = find_bytes(pl, OTP_MARKER, 0) {
        let start = idx + OTP_OFFSET;
        if let Some(seed) = pl.get(start..start + OTP_LEN) {
            otp.copy_from_slice(seed);
        }
    }

    otp
}
