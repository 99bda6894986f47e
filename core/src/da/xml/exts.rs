/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Loader extension, reached through the `CMD:CUSTOM` hook planted by the
//! patcher. It adds raw memory, register and RPMB access to DA2.
use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::connection::Payload;
use crate::core::chip::ChipConfig;
use crate::core::crypto::{CryptoIO, find_otp};
use crate::core::storage::StorageType;
use crate::da::xml::Xml;
use crate::da::xml::cmds::create_bare_cmd;
use crate::error::{Error, Result, RpmbError};
use crate::le_u16;
use crate::le_u32;
use crate::utilities::arm::op_mov_to_offset;
use crate::utilities::patching::{find_bytes, find_pattern};

/// What `CMD:CUSTOMACK` answers once the extension runs.
const EXT_ACK: [u8; 4] = [0xA4, 0xA3, 0xA2, 0xA1];
pub const RPMB_FRAME_LEN: usize = 0x100;
/// Below this many dwords, memory is accessed one register at a time.
const REG_LOOP_LIMIT: usize = 0x20;
const PEEK_CHUNK: usize = 0x1000;

// Placeholders inside the extension, replaced by DA2 addresses
const REGISTER_XML_CMD: [u8; 4] = [0x11; 4];
const MMC_GET_CARD: [u8; 4] = [0x22; 4];
const MMC_SET_PART_CONFIG: [u8; 4] = [0x33; 4];
const MMC_RPMB_SEND_COMMAND: [u8; 4] = [0x44; 4];
const UFSHCD_QUEUECOMMAND: [u8; 4] = [0x55; 4];
const UFSHCD_GET_FREE_TAG: [u8; 4] = [0x66; 4];
const G_UFS_HBA: [u8; 4] = [0x77; 4];
const EFUSE_ADDR: [u8; 4] = [0x88; 4];

const REGISTER_XML_CMD_SIG: &str = "704C2DE910B08DE20050A0E11400A0E3";
const MMC_GET_CARD_SIG: &str = "901220E01EFF2FE1";
const MMC_SET_PART_CONFIG_SIG: &str = "F04B2DE918B08DE223DE4DE2";
const MMC_RPMB_SEND_COMMAND_SIG: &str = "F0482DE910B08DE208709BE5";
const UFS_HBA_ANCHOR: &str = "000094E5341090E5010011E30300000A";
const UFSHCD_QUEUECOMMAND_SIG: &str = "F04D2DE918B08DE208D04DE2484090E5";
const UFSHCD_GET_FREE_TAG_SIG: &str = "104C2DE908B08DE20040A0E3000051E3";

fn put_addr(ext: &mut [u8], sentinel: &[u8; 4], value: u32) {
    match find_bytes(ext, sentinel, 0) {
        Some(idx) => ext[idx..idx + 4].copy_from_slice(&value.to_le_bytes()),
        None => debug!("Extension has no {:02X} slot", sentinel[0]),
    }
}

/// Fills the extension placeholders with the DA2 addresses it calls into.
///
/// Returns `None` when the extension or DA2 lack the command registration
/// hook, in which case the extension can't be used at all. Any other missing
/// function is written as 0.
pub fn patch_extension(ext: &[u8], da2: &[u8], da2addr: u32, chip: &ChipConfig) -> Option<Vec<u8>> {
    if find_bytes(ext, &REGISTER_XML_CMD, 0).is_none() {
        warn!("Extension has no command registration slot");
        return None;
    }
    let Some(register_xml_cmd) = find_pattern(da2, REGISTER_XML_CMD_SIG, 0) else {
        warn!("Couldn't find register_xml_cmd in DA2");
        return None;
    };

    let register_xml_cmd = (register_xml_cmd as u32).wrapping_add(da2addr);

    let mut data = ext.to_vec();
    put_addr(&mut data, &REGISTER_XML_CMD, register_xml_cmd);

    let mmc_get_card = find_pattern(da2, MMC_GET_CARD_SIG, 0).map_or(0, |idx| idx.saturating_sub(0xC) as u32);
    let mmc_set_part_config = find_pattern(da2, MMC_SET_PART_CONFIG_SIG, 0).map_or(0, |idx| idx as u32);
    let mmc_rpmb_send_command = find_pattern(da2, MMC_RPMB_SEND_COMMAND_SIG, 0).map_or(0, |idx| idx as u32);
    put_addr(&mut data, &MMC_GET_CARD, mmc_get_card);
    put_addr(&mut data, &MMC_SET_PART_CONFIG, mmc_set_part_config);
    put_addr(&mut data, &MMC_RPMB_SEND_COMMAND, mmc_rpmb_send_command);

    let (mut g_ufs_hba, mut queuecommand, mut get_free_tag) = (0, 0, 0);
    if let Some(idx) = find_pattern(da2, UFS_HBA_ANCHOR, 0).filter(|idx| *idx >= 8) {
        g_ufs_hba = op_mov_to_offset(le_u32!(da2, idx - 8), le_u32!(da2, idx - 4), 4, 0).unwrap_or(0);
        queuecommand = find_pattern(da2, UFSHCD_QUEUECOMMAND_SIG, 0).map_or(0, |i| (i as u32).wrapping_add(da2addr));
        get_free_tag = find_pattern(da2, UFSHCD_GET_FREE_TAG_SIG, 0).map_or(0, |i| (i as u32).wrapping_add(da2addr));
    }
    put_addr(&mut data, &G_UFS_HBA, g_ufs_hba);
    put_addr(&mut data, &UFSHCD_QUEUECOMMAND, queuecommand);
    put_addr(&mut data, &UFSHCD_GET_FREE_TAG, get_free_tag);

    if let Some(efuse) = chip.efuse_addr {
        put_addr(&mut data, &EFUSE_ADDR, efuse);
    }

    debug!(
        "Extension hooks: register_xml_cmd=0x{:X}, mmc_get_card=0x{:X}, g_ufs_hba=0x{:X}",
        register_xml_cmd,
        mmc_get_card,
        g_ufs_hba
    );
    Some(data)
}

/// Sends a bare custom command and waits for the extension to accept it.
async fn open_custom(xml: &mut Xml, name: &str) -> Result<()> {
    xml.xsend(Payload::Text(&create_bare_cmd(name))).await?;

    let resp = xml.get_response().await;
    if resp != "OK" {
        error!("CMD:{name} refused: {resp}");
        return Err(Error::proto(format!("CMD:{name} refused: {resp}")));
    }
    Ok(())
}

/// Patches and uploads the extension, then checks that it answers.
/// `Ok(false)` means the session goes on with the stock loader.
pub async fn boot_extensions(xml: &mut Xml) -> Result<bool> {
    let Some(ext) = xml.ext_data.clone() else {
        debug!("No extension payload, skipping");
        return Ok(false);
    };
    let da2addr = xml.da.get_da2().ok_or_else(|| Error::obscura("DA2 region not found"))?.addr;

    let Some(ext) = patch_extension(&ext, &xml.da2, da2addr, &xml.chip) else {
        warn!("Extension couldn't be patched, going on without it");
        return Ok(false);
    };

    xml.xsend(Payload::Text(&create_bare_cmd("CUSTOM"))).await?;
    let resp = xml.get_response().await;
    if resp != "OK" {
        error!("DA extensions failed: {resp}");
        return Ok(false);
    }

    xml.xsend(Payload::U32(ext.len() as u32)).await?;
    xml.xsend(Payload::Bytes(&ext)).await?;
    xml.drain_bracket().await?;

    if !custom_ack(xml).await? {
        error!("DA extensions failed");
        return Ok(false);
    }

    info!("[Obscura] DA extensions successfully loaded");
    xml.using_exts = true;

    if let Some(storage) = xml.dev_info.storage().await
        && let Err(e) = custom_set_storage(xml, storage.kind() == StorageType::Ufs).await
    {
        warn!("Couldn't select the extension storage: {e}");
    }
    Ok(true)
}

pub async fn custom_ack(xml: &mut Xml) -> Result<bool> {
    xml.xsend(Payload::Text(&create_bare_cmd("CUSTOMACK"))).await?;
    xml.get_response().await;
    let data = xml.get_response_raw().await;
    xml.drain_bracket().await?;

    Ok(data == EXT_ACK)
}

pub async fn custom_read(xml: &mut Xml, addr: u64, length: u32) -> Result<Vec<u8>> {
    open_custom(xml, "CUSTOMMEMR").await?;
    xml.xsend(Payload::U64(addr)).await?;
    xml.xsend(Payload::U32(length)).await?;
    let data = xml.get_response_raw().await;
    xml.drain_bracket().await?;

    if data.len() < length as usize {
        return Err(Error::proto(format!("Short memory read at 0x{addr:X}")));
    }
    Ok(data)
}

pub async fn custom_write(xml: &mut Xml, addr: u64, data: &[u8]) -> Result<()> {
    open_custom(xml, "CUSTOMMEMW").await?;
    xml.xsend(Payload::U64(addr)).await?;
    xml.xsend(Payload::U32(data.len() as u32)).await?;
    xml.xsend(Payload::Bytes(data)).await?;
    xml.drain_bracket().await
}

pub async fn custom_read_register(xml: &mut Xml, addr: u32) -> Result<u32> {
    open_custom(xml, "CUSTOMREGR").await?;
    xml.xsend(Payload::U32(addr)).await?;
    let data = xml.get_response_raw().await;
    xml.drain_bracket().await?;

    if data.len() < 4 {
        return Err(Error::proto(format!("Couldn't read register 0x{addr:08X}")));
    }
    Ok(le_u32!(data, 0))
}

pub async fn custom_write_register(xml: &mut Xml, addr: u32, value: u32) -> Result<()> {
    open_custom(xml, "CUSTOMREGW").await?;
    xml.xsend(Payload::U32(addr)).await?;
    xml.xsend(Payload::U32(value)).await?;
    xml.drain_bracket().await
}

/// Selects the storage the extension RPMB handlers talk to.
pub async fn custom_set_storage(xml: &mut Xml, ufs: bool) -> Result<()> {
    open_custom(xml, "CUSTOMSTORAGE").await?;
    xml.xsend(Payload::U32(ufs as u32)).await?;
    xml.drain_bracket().await
}

pub async fn read_mem(xml: &mut Xml, addr: u32, dwords: usize) -> Result<Vec<u32>> {
    if dwords < REG_LOOP_LIMIT {
        let mut out = Vec::with_capacity(dwords);
        for pos in 0..dwords {
            out.push(custom_read_register(xml, addr.wrapping_add((pos * 4) as u32)).await?);
        }
        debug!("RX: 0x{addr:08X} -> {out:08X?}");
        return Ok(out);
    }

    let data = custom_read(xml, addr as u64, (dwords * 4) as u32).await?;
    Ok(data.chunks_exact(4).take(dwords).map(|c| le_u32!(c, 0)).collect())
}

/// Writes `data`, zero padded to whole dwords.
pub async fn write_mem(xml: &mut Xml, addr: u32, data: &[u8]) -> Result<()> {
    let mut buf = data.to_vec();
    buf.resize(data.len().next_multiple_of(4), 0);

    if buf.len() / 4 >= REG_LOOP_LIMIT {
        return custom_write(xml, addr as u64, &buf).await;
    }

    for (i, dword) in buf.chunks_exact(4).enumerate() {
        let value = le_u32!(dword, 0);
        let at = addr.wrapping_add((i * 4) as u32);
        debug!("TX: 0x{at:08X} -> 0x{value:08X}");
        custom_write_register(xml, at, value).await?;
    }
    Ok(())
}

/// Dumps memory through the extension into `writer`.
pub async fn peek(
    xml: &mut Xml,
    addr: u32,
    length: usize,
    writer: &mut (dyn AsyncWrite + Unpin + Send),
    progress: &mut (dyn FnMut(usize, usize) + Send),
) -> Result<()> {
    if !xml.using_exts {
        return Err(Error::obscura("Memory access needs the DA extensions"));
    }

    let mut done = 0;
    while done < length {
        let size = (length - done).min(PEEK_CHUNK);
        let data = custom_read(xml, addr as u64 + done as u64, size as u32).await?;
        writer.write_all(&data[..size]).await?;

        done += size;
        progress(done, length);
    }

    writer.flush().await?;
    Ok(())
}

fn rpmb_status(data: &[u8], sector: u32) -> Result<u16> {
    if data.len() < 2 {
        return Err(Error::proto(format!("No RPMB status for sector {sector}")));
    }
    Ok(le_u16!(data, 0))
}

/// Reads one 256 byte RPMB frame.
pub async fn rpmb_read_sector(xml: &mut Xml, sector: u32, ufs: bool) -> Result<Vec<u8>> {
    open_custom(xml, if ufs { "CUSTOMURPMBR" } else { "CUSTOMRPMBR" }).await?;
    xml.xsend(Payload::U32(sector)).await?;

    let status = rpmb_status(&xml.get_response_raw().await, sector);
    let data = match status {
        Ok(0) => xml.get_response_raw().await,
        _ => Vec::new(),
    };
    xml.drain_bracket().await?;

    match status? {
        0 if data.len() >= RPMB_FRAME_LEN => Ok(data[..RPMB_FRAME_LEN].to_vec()),
        0 => Err(Error::proto(format!("Short RPMB frame for sector {sector}"))),
        code => Err(Error::Rpmb(RpmbError::from_code(code, sector))),
    }
}

pub async fn rpmb_write_sector(xml: &mut Xml, sector: u32, frame: &[u8], ufs: bool) -> Result<()> {
    if frame.len() != RPMB_FRAME_LEN {
        return Err(Error::obscura(format!("RPMB frames are 0x100 bytes, got 0x{:X}", frame.len())));
    }

    open_custom(xml, if ufs { "CUSTOMURPMBW" } else { "CUSTOMRPMBW" }).await?;
    xml.xsend(Payload::U32(sector)).await?;
    xml.xsend(Payload::Bytes(frame)).await?;

    let status = rpmb_status(&xml.get_response_raw().await, sector);
    xml.drain_bracket().await?;

    match status? {
        0 => Ok(()),
        code => Err(Error::Rpmb(RpmbError::from_code(code, sector))),
    }
}

/// Derives the RPMB key with the crypto engine and hands it to the extension.
/// Skipped without a MEID address, an engine or a MEID.
async fn push_rpmb_key(xml: &mut Xml) -> Result<()> {
    if xml.chip.meid_addr.is_none() {
        return Ok(());
    }

    let meid = xml.dev_info.meid().await;
    if meid.iter().all(|b| *b == 0) {
        debug!("No MEID, not pushing an RPMB key");
        return Ok(());
    }

    let Some(mut crypto) = xml.crypto.take() else {
        return Ok(());
    };
    let otp = find_otp(xml.preloader.as_deref());

    info!("[Obscura] Generating SEJ RPMB key...");
    let key = crypto.rpmb_key(&mut *xml, &meid, &otp).await;
    xml.crypto = Some(crypto);

    let Some(key) = key else {
        warn!("Crypto engine couldn't derive an RPMB key");
        return Ok(());
    };

    open_custom(xml, "CUSTOMRPMBKEY").await?;
    xml.xsend(Payload::Bytes(&key)).await?;
    let echoed = xml.get_response_raw().await;
    xml.drain_bracket().await?;

    if echoed != key {
        error!("Extension answered with a different RPMB key");
        return Err(Error::Rpmb(RpmbError::KeyRejected));
    }

    info!("[Obscura] Setting RPMB key: ok");
    Ok(())
}

/// Gets the extension ready for RPMB writes: key push, then key derivation on
/// the storage side.
pub async fn custom_rpmb_init(xml: &mut Xml) -> Result<()> {
    let ufs = xml.get_or_reinit_storage().await?.kind() == StorageType::Ufs;

    push_rpmb_key(xml).await?;

    open_custom(xml, if ufs { "CUSTOMUFSINIT" } else { "CUSTOMMMCINIT" }).await?;
    let derived = xml.get_response_raw().await;
    xml.drain_bracket().await?;

    if derived.len() < 4 || le_u32!(derived, 0) == 0xFF {
        error!("Failed to derive a valid RPMB key");
        return Err(Error::obscura("Failed to derive a valid RPMB key"));
    }

    info!("[Obscura] Derived RPMB key: {}", hex::encode(&derived));
    Ok(())
}

#[async_trait]
impl CryptoIO for Xml {
    async fn read32(&mut self, addr: u32) -> u32 {
        let value = if self.using_exts {
            custom_read_register(self, addr).await
        } else {
            self.read_register(addr).await
        };

        value.unwrap_or_else(|e| {
            error!("Couldn't read 0x{addr:08X}: {e}");
            0
        })
    }

    async fn write32(&mut self, addr: u32, val: u32) {
        let result = if self.using_exts {
            custom_write_register(self, addr, val).await
        } else {
            self.write_register(addr, &val.to_le_bytes()).await
        };

        if let Err(e) = result {
            error!("Couldn't write 0x{addr:08X}: {e}");
        }
    }
}
