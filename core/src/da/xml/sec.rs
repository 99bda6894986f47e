/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use log::{error, info};

use crate::core::crypto::HwCrypto;
use crate::core::seccfg::{LockFlag, SecCfgV4, V4_MAGIC_BEGIN};
use crate::da::protocol::DAProtocol;
use crate::da::xml::Xml;
use crate::da::xml::{flash, storage};
use crate::error::{Error, Result};
use crate::utilities::patching::find_bytes;

const SECCFG_PART: &str = "seccfg";
/// Hash of the SoC root public key, inside the efuse block.
const PUBK_OFFSET: u32 = 0x90;
const PUBK_LEN: u32 = 0x30;

/// Byte offset and content of the seccfg partition of the user area.
async fn read_seccfg(xml: &mut Xml) -> Result<(u64, Vec<u8>)> {
    let table = storage::get_gpt(xml, None)
        .await?
        .ok_or_else(|| Error::obscura("Error getting the partition table"))?;
    let part = table
        .find(SECCFG_PART)
        .ok_or_else(|| Error::obscura("Couldn't find the seccfg partition"))?;
    let (offset, length) = table.span(part);

    let mut data = flash::read_to_vec(xml, offset, length, None).await?;
    data.truncate(length as usize);
    Ok((offset, data))
}

async fn rebuild(crypto: &mut dyn HwCrypto, xml: &mut Xml, data: &[u8], flag: LockFlag) -> Result<Vec<u8>> {
    let mut seccfg = SecCfgV4::parse(data, crypto, xml).await?;
    seccfg.set_lock_state(flag)?;
    seccfg.create(crypto, xml).await
}

/// Rebuilds a seccfg image with the lock state `flag`, hash encrypted by the
/// session crypto engine.
pub async fn rewrite_seccfg(xml: &mut Xml, data: &[u8], flag: LockFlag) -> Result<Vec<u8>> {
    let magic = V4_MAGIC_BEGIN.to_le_bytes();
    if find_bytes(data, &magic, 0).is_none() {
        return Err(Error::obscura("SecCfg is empty"));
    }
    if !data.starts_with(&magic) {
        return Err(Error::obscura("Unknown seccfg partition header"));
    }

    let Some(mut crypto) = xml.crypto.take() else {
        return Err(Error::obscura("Changing the lock state needs a crypto engine"));
    };
    let image = rebuild(&mut *crypto, xml, data, flag).await;
    xml.crypto = Some(crypto);
    image
}

/// Reads seccfg, switches its lock state and writes it back. Returns the written image.
pub async fn set_lock_state(
    xml: &mut Xml,
    flag: LockFlag,
    progress: &mut (dyn FnMut(usize, usize) + Send),
) -> Result<Vec<u8>> {
    let (offset, current) = read_seccfg(xml).await?;
    let image = rewrite_seccfg(xml, &current, flag).await.inspect_err(|e| {
        error!("Couldn't rebuild seccfg: {e}");
    })?;

    flash::write_flash(xml, offset, image.len() as u64, None, &image, progress).await?;
    info!("[Obscura] Wrote seccfg ({flag:?})");
    Ok(image)
}

fn efuse_base(xml: &Xml) -> Result<u32> {
    xml.chip.efuse_addr.ok_or_else(|| Error::obscura("No efuse base known for this SoC"))
}

/// Reads the efuse word at `offset` from the efuse base.
pub async fn read_fuse(xml: &mut Xml, offset: u32) -> Result<u32> {
    let addr = efuse_base(xml)?
        .checked_add(offset)
        .ok_or_else(|| Error::obscura(format!("Efuse offset 0x{offset:X} out of range")))?;
    DAProtocol::read32(xml, addr).await
}

pub async fn read_fuses(xml: &mut Xml, offsets: &[u32]) -> Result<Vec<u32>> {
    let mut out = Vec::with_capacity(offsets.len());
    for offset in offsets {
        out.push(read_fuse(xml, *offset).await?);
    }
    Ok(out)
}

/// Public key hash burnt into the efuses.
pub async fn read_pubk(xml: &mut Xml) -> Result<Vec<u8>> {
    let offsets: Vec<u32> = (PUBK_OFFSET..PUBK_OFFSET + PUBK_LEN).step_by(4).collect();
    let words = read_fuses(xml, &offsets).await?;
    Ok(words.iter().flat_map(|w| w.to_le_bytes()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::ScriptHandle;
    use crate::core::chip::ChipConfig;
    use crate::core::seccfg::SecCfgAlgo;
    use crate::core::seccfg::tests::{XorEngine, seccfg_image};
    use crate::core::storage::{EmmcInfo, StorageInfo};
    use crate::da::xml::storage::tests::{push_blob, push_readback};
    use crate::da::xml::xml_lib::tests::{download_file_cmd, push_upload_acks, scripted_xml};
    use crate::le_u32;

    async fn emmc_xml() -> (Xml, ScriptHandle) {
        let (mut xml, handle) = scripted_xml();
        xml.dev_info
            .set_storage(StorageInfo::Emmc(EmmcInfo {
                block_size: 0x200,
                user_size: 0x1_0000_0000,
                ..Default::default()
            }))
            .await;
        xml.crypto = Some(Box::new(XorEngine { algo: SecCfgAlgo::HwV2, key: 0xA7 }));
        (xml, handle)
    }

    /// Loader table with a one sector seccfg at 8 MiB, then its content.
    fn push_seccfg(handle: &ScriptHandle, seccfg: &[u8]) {
        let mut boot = b"EMMC_BOOT".to_vec();
        boot.resize(0x20000, 0);
        push_readback(handle, &boot);
        push_blob(handle, b"<pt><name>seccfg</name><start>0x800000</start><size>0x200</size></pt>");

        let mut data = seccfg.to_vec();
        data.resize(0x20000, 0);
        push_readback(handle, &data);
    }

    #[tokio::test]
    async fn unlock_rewrites_the_partition() {
        let (mut xml, handle) = emmc_xml().await;
        push_seccfg(&handle, &seccfg_image(1, 0xA7));

        handle.push_text("OK");
        handle.push_cmd("CMD:FILE-SYS-OPERATION", "<key>FILE-SIZE</key><file_path>MEM://0x800000:0x200</file_path>");
        download_file_cmd(&handle, 0x200, 0x1000);
        push_upload_acks(&handle, 0x200, 0x1000);

        let mut progress = |_, _| {};
        let image = set_lock_state(&mut xml, LockFlag::Unlock, &mut progress).await.unwrap();
        assert_eq!(handle.unread(), 0);
        assert!(xml.crypto.is_some());

        assert_eq!(image.len(), 0x200);
        assert_eq!(le_u32!(image, 12), 3);
        assert_eq!(le_u32!(image, 16), 1);

        let texts = handle.sent_texts();
        let write = texts.iter().find(|t| t.contains("CMD:WRITE-FLASH")).unwrap();
        assert!(write.contains("<partition>EMMC-USER</partition>"));
        assert!(write.contains("<offset>0x800000</offset>"));
        assert!(handle.sent_frames().contains(&image));
    }

    #[tokio::test]
    async fn nothing_is_written_on_refusal() {
        let (mut xml, handle) = emmc_xml().await;
        push_seccfg(&handle, &seccfg_image(3, 0xA7));

        let mut progress = |_, _| {};
        assert!(set_lock_state(&mut xml, LockFlag::Unlock, &mut progress).await.is_err());
        assert_eq!(handle.unread(), 0);
        assert!(!handle.sent_texts().iter().any(|t| t.contains("CMD:WRITE-FLASH")));
    }

    #[tokio::test]
    async fn seccfg_content_is_checked() {
        let (mut xml, _handle) = emmc_xml().await;

        assert!(rewrite_seccfg(&mut xml, &[0u8; 0x200], LockFlag::Unlock).await.is_err());

        let mut shifted = vec![0u8; 0x10];
        shifted.extend(seccfg_image(1, 0xA7));
        assert!(rewrite_seccfg(&mut xml, &shifted, LockFlag::Unlock).await.is_err());

        // Wrong key, the variant can't be found
        assert!(rewrite_seccfg(&mut xml, &seccfg_image(1, 0x11), LockFlag::Unlock).await.is_err());

        xml.crypto = None;
        assert!(rewrite_seccfg(&mut xml, &seccfg_image(1, 0xA7), LockFlag::Unlock).await.is_err());
    }

    /// Device side of a `CUSTOMREGR` answering `value`.
    fn push_register(handle: &ScriptHandle, value: u32) {
        handle.push_text("OK");
        handle.push_bytes(&value.to_le_bytes());
        handle.push_end_start("OK");
    }

    #[tokio::test]
    async fn efuse_words_from_the_base() {
        let (mut xml, handle) = scripted_xml();
        xml.using_exts = true;

        assert!(read_fuse(&mut xml, 0x20).await.is_err());
        assert!(handle.written().is_empty());

        xml.chip = ChipConfig::new(Some(0x11C5_0000), None);
        push_register(&handle, 0x0000_0021);
        push_register(&handle, 0xDEAD_BEEF);
        assert_eq!(read_fuses(&mut xml, &[0x20, 0x60]).await.unwrap(), [0x21, 0xDEAD_BEEF]);

        let frames = handle.sent_frames();
        assert_eq!(frames[1], 0x11C5_0020u32.to_le_bytes());
        assert_eq!(frames[5], 0x11C5_0060u32.to_le_bytes());
        assert_eq!(handle.unread(), 0);

        assert!(read_fuse(&mut xml, u32::MAX).await.is_err());
    }

    #[tokio::test]
    async fn public_key_hash() {
        let (mut xml, handle) = scripted_xml();
        xml.using_exts = true;
        xml.chip = ChipConfig::new(Some(0x1000_0000), None);

        for i in 0..12u32 {
            push_register(&handle, 0x0302_0100 + i * 0x0404_0404);
        }
        let pubk = read_pubk(&mut xml).await.unwrap();
        assert_eq!(pubk, (0..0x30u8).collect::<Vec<u8>>());
        assert_eq!(handle.sent_frames()[1], 0x1000_0090u32.to_le_bytes());
        assert_eq!(handle.unread(), 0);
    }
}
