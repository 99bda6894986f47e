/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use log::{debug, error};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::utilities::patching::find_bytes;
use crate::{le_u16, le_u32};

const HEADER_LEN: usize = 0x6C;
const ENTRY_LEN: usize = 0xDC;
const LEGACY_ENTRY_LEN: usize = 0xD8;
const REGION_LEN: usize = 20;

/// Loader container flavour.
/// - Legacy: pre XFlash loaders, only detected to be refused
/// - V5: XFlash loaders, binary command set
/// - V6: XML loaders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DAType {
    Legacy,
    V5,
    V6,
}

/// One stage of a loader entry.
/// Region 0 describes the file itself, region 1 is DA1 and region 2 is DA2.
#[derive(Clone, Debug)]
pub struct DAEntryRegion {
    /// Region bytes, signature included.
    pub data: Vec<u8>,
    /// Offset of the region inside the container.
    pub offset: u32,
    pub length: u32,
    /// Load address on the device.
    pub addr: u32,
    /// `length - sig_len`
    pub region_length: u32,
    pub sig_len: u32,
}

impl DAEntryRegion {
    /// Region bytes without the trailing signature.
    pub fn unsigned(&self) -> &[u8] {
        let end = self.data.len().saturating_sub(self.sig_len as usize);
        &self.data[..end]
    }
}

/// Loader entry for a single SoC.
#[derive(Clone, Debug)]
pub struct DA {
    pub da_type: DAType,
    pub regions: Vec<DAEntryRegion>,
    /// Always 0xDADA
    pub magic: u16,
    pub hw_code: u16,
    pub hw_sub_code: u16,
}

/// A parsed loader container.
pub struct DAFile {
    pub da_raw_data: Vec<u8>,
    pub da_type: DAType,
    pub das: Vec<DA>,
}

impl DAFile {
    pub fn parse_da(raw_data: &[u8]) -> Result<DAFile> {
        if raw_data.len() < HEADER_LEN + ENTRY_LEN {
            return Err(Error::obscura("Invalid DA file, too small"));
        }

        let hdr = &raw_data[..HEADER_LEN];

        let legacy_test_pos = HEADER_LEN + LEGACY_ENTRY_LEN;
        let da_type = if &raw_data[legacy_test_pos..legacy_test_pos + 2] == b"\xDA\xDA" {
            DAType::Legacy
        } else if find_bytes(hdr, b"MTK_DA_v6", 0).is_some() {
            DAType::V6
        } else {
            DAType::V5
        };

        if da_type != DAType::Legacy && find_bytes(hdr, b"MTK_DOWNLOAD_AGENT", 0).is_none() {
            return Err(Error::obscura("Invalid DA file: Missing MTK_DOWNLOAD_AGENT signature"));
        }

        let da_id = String::from_utf8_lossy(&hdr[0x20..0x60]).trim_end_matches('\0').to_string();
        let num_socs = le_u32!(hdr, 0x68);
        debug!("DA file '{da_id}' ({da_type:?}), {num_socs} entries");

        let entry_len = match da_type {
            DAType::Legacy => LEGACY_ENTRY_LEN,
            _ => ENTRY_LEN,
        };

        let mut das = Vec::new();
        for i in 0..num_socs as usize {
            let start = HEADER_LEN + i * entry_len;
            let entry = raw_data
                .get(start..start + entry_len)
                .ok_or_else(|| Error::obscura(format!("DA entry {i} is truncated")))?;

            // 0x00 magic, 0x02 hw_code, 0x04 hw_sub_code, 0x06 hw_version,
            // 0x12 region count, 0x14 region table
            let magic = le_u16!(entry, 0x00);
            let hw_code = le_u16!(entry, 0x02);
            let hw_sub_code = le_u16!(entry, 0x04);
            let region_count = le_u16!(entry, 0x12) as usize;

            let mut inner_type = da_type;
            let mut regions = Vec::with_capacity(region_count);
            for r in 0..region_count {
                // offset, length, addr, region_length, sig_len
                let pos = 0x14 + r * REGION_LEN;
                let Some(region_hdr) = entry.get(pos..pos + REGION_LEN) else {
                    error!("Region table of entry {hw_code:04X} overflows");
                    break;
                };

                let offset = le_u32!(region_hdr, 0x00);
                let length = le_u32!(region_hdr, 0x04);
                let addr = le_u32!(region_hdr, 0x08);
                let sig_len = le_u32!(region_hdr, 0x10);

                let data = raw_data
                    .get(offset as usize..(offset as usize + length as usize))
                    .ok_or_else(|| {
                        Error::obscura(format!("Region {r} of entry {hw_code:04X} is out of bounds"))
                    })?
                    .to_vec();
                debug!(
                    "Region: offset={:08X}, length={:08X}, addr={:08X}, sig_len={:08X}",
                    offset, length, addr, sig_len
                );

                if inner_type != DAType::Legacy && find_bytes(&data, b"AND_SECRO_v", 0).is_some() {
                    inner_type = DAType::Legacy;
                }

                regions.push(DAEntryRegion {
                    data,
                    offset,
                    length,
                    addr,
                    region_length: length.saturating_sub(sig_len),
                    sig_len,
                });
            }

            das.push(DA { da_type: inner_type, regions, magic, hw_code, hw_sub_code });
        }

        Ok(DAFile { da_raw_data: raw_data.to_vec(), da_type, das })
    }

    /// Finds the loader entry for a hardware code, translating codes that
    /// share a loader with another SoC.
    pub fn get_da_from_hw_code(&self, hw_code: u16) -> Option<DA> {
        let da_code = match hw_code {
            0x279 => 0x6797,
            0x321 => 0x6735,
            0x326 => 0x6755,
            0x335 => 0x6735,
            0x337 => 0x6735,
            0x507 => 0x6758,
            0x551 => 0x6757,
            0x562 => 0x6799,
            0x601 => 0x6755,
            0x633 => 0x6570,
            0x688 => 0x6758,
            0x690 => 0x6763,
            0x699 => 0x6739,
            0x707 => 0x6768,
            0x717 => 0x6761,
            0x725 => 0x6779,
            0x766 => 0x6765,
            0x788 => 0x6771,
            0x813 => 0x6785,
            0x816 => 0x6885,
            0x886 => 0x6873,
            0x908 => 0x8696,
            0x930 => 0x8195,
            0x950 => 0x6893,
            0x959 => 0x6877,
            0x989 => 0x6833,
            0x996 => 0x6853,
            0x1066 => 0x6781,
            0x6583 => 0x6589,
            0x8172 => 0x8173,
            0x8176 => 0x8173,
            _ => hw_code,
        };

        self.das.iter().find(|da| da.hw_code == da_code || da.hw_code == hw_code).cloned()
    }
}

impl DA {
    pub fn get_da1(&self) -> Option<&DAEntryRegion> {
        if self.regions.len() >= 3 { Some(&self.regions[1]) } else { None }
    }

    pub fn get_da2(&self) -> Option<&DAEntryRegion> {
        if self.regions.len() >= 3 { Some(&self.regions[2]) } else { None }
    }

    pub fn is_v6(&self) -> bool {
        self.da_type == DAType::V6
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMode {
    Sha1,
    Sha256,
}

impl HashMode {
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashMode::Sha1 => Sha1::digest(data).to_vec(),
            HashMode::Sha256 => Sha256::digest(data).to_vec(),
        }
    }
}

/// Where DA1 keeps the digest of DA2, and over how many DA2 bytes it is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashPos {
    pub offset: usize,
    pub mode: HashMode,
    pub hashed_len: usize,
}

fn find_digest(da1: &[u8], da2: &[u8]) -> Option<(usize, HashMode)> {
    [HashMode::Sha1, HashMode::Sha256]
        .into_iter()
        .find_map(|mode| find_bytes(da1, &mode.digest(da2), 0).map(|pos| (pos, mode)))
}

/// XFlash loaders keep the digest right before the "MMU MAP: VA" string.
fn find_hash_v5(da1: &[u8]) -> Option<(usize, HashMode)> {
    let idx = find_bytes(da1, b"MMU MAP: VA", 0)?;
    let window = da1.get(idx.checked_sub(0x30)?..idx)?;

    if window.ends_with(&[0, 0, 0, 0]) {
        Some((idx - 0x30, HashMode::Sha256))
    } else {
        Some((idx - 0x14, HashMode::Sha1))
    }
}

/// XML loaders keep a zero padded SHA-256 right before the DA1 signature.
fn find_hash_v6(da1: &[u8], da1_sig_len: usize) -> Option<(usize, HashMode)> {
    let pos = da1.len().checked_sub(da1_sig_len)?.checked_sub(0x30)?;
    if da1[pos..pos + 0x30].ends_with(&[0, 0, 0, 0]) {
        return Some((pos, HashMode::Sha256));
    }
    None
}

/// Locates the DA2 digest inside DA1. The digest itself is searched first,
/// the layout rules only kick in when it isn't found verbatim.
pub fn compute_hash_pos(
    da1: &[u8],
    da2: &[u8],
    da1_sig_len: usize,
    da2_sig_len: usize,
    v6: bool,
) -> Option<HashPos> {
    let unsigned = da2.len().saturating_sub(da2_sig_len);

    for hashed_len in [unsigned, da2.len()] {
        if let Some((offset, mode)) = find_digest(da1, &da2[..hashed_len]) {
            return Some(HashPos { offset, mode, hashed_len });
        }
    }

    let found = if v6 { find_hash_v6(da1, da1_sig_len) } else { find_hash_v5(da1) };
    match found {
        Some((offset, mode)) => Some(HashPos { offset, mode, hashed_len: unsigned }),
        None => {
            error!("Hash computation failed.");
            None
        }
    }
}

/// Rewrites the DA2 digest stored in DA1.
pub fn fix_hash(da1: &mut [u8], da2: &[u8], pos: &HashPos) -> Result<()> {
    let hashed = da2
        .get(..pos.hashed_len)
        .ok_or_else(|| Error::obscura("DA2 is shorter than its hashed length"))?;
    let digest = pos.mode.digest(hashed);

    let slot = da1
        .get_mut(pos.offset..pos.offset + digest.len())
        .ok_or_else(|| Error::obscura(format!("Hash position 0x{:X} is out of DA1", pos.offset)))?;
    slot.copy_from_slice(&digest);
    Ok(())
}
