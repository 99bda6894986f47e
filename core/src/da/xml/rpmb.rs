/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use log::{error, info};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::core::storage::StorageInfo;
use crate::da::xml::Xml;
use crate::da::xml::exts::{self, RPMB_FRAME_LEN};
use crate::error::{Error, Result};

/// UFS devices don't report their RPMB size.
const UFS_RPMB_SECTORS: u32 = 512 * 256;

/// Sector by sector RPMB access through the loader extension.
///
/// Every sector is one 256 byte frame. A failing sector stops the operation,
/// sectors sent before it stay written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpmbEngine {
    ufs: bool,
    sectors: u32,
}

impl RpmbEngine {
    pub fn for_storage(storage: &StorageInfo) -> Result<Self> {
        match storage {
            StorageInfo::Emmc(emmc) => {
                Ok(RpmbEngine { ufs: false, sectors: (emmc.rpmb_size / RPMB_FRAME_LEN as u64) as u32 })
            }
            StorageInfo::Ufs(_) => Ok(RpmbEngine { ufs: true, sectors: UFS_RPMB_SECTORS }),
            other => Err(Error::obscura(format!("{} storage has no RPMB", other.kind()))),
        }
    }

    /// Sectors covered when the caller doesn't give a count.
    pub fn default_sectors(&self) -> u32 {
        self.sectors
    }

    /// Last sector touched by `count` sectors from `sector`, refusing a wrapping range.
    fn last_sector(sector: u32, count: u32) -> Result<u32> {
        sector
            .checked_add(count - 1)
            .ok_or_else(|| Error::obscura(format!("RPMB range 0x{sector:X}+0x{count:X} out of bounds")))
    }

    fn check_ready(xml: &Xml) -> Result<()> {
        if !xml.using_exts {
            return Err(Error::obscura("RPMB access needs the DA extensions"));
        }
        Ok(())
    }

    pub async fn read(
        &self,
        xml: &mut Xml,
        sector: u32,
        count: Option<u32>,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        Self::check_ready(xml)?;

        let count = count.unwrap_or(self.sectors);
        if count == 0 {
            return Err(Error::obscura("No RPMB sectors to read"));
        }
        let total = count as usize * RPMB_FRAME_LEN;

        let last = Self::last_sector(sector, count)?;
        for at in sector..=last {
            let frame = exts::rpmb_read_sector(xml, at, self.ufs).await.inspect_err(|e| {
                error!("Couldn't read RPMB sector {at}: {e}");
            })?;
            writer.write_all(&frame).await?;
            progress((at - sector + 1) as usize * RPMB_FRAME_LEN, total);
        }
        writer.flush().await?;

        info!("[Obscura] Read {count} RPMB sectors");
        Ok(())
    }

    /// Writes `data` from `sector` on. A trailing partial frame is dropped.
    pub async fn write(
        &self,
        xml: &mut Xml,
        sector: u32,
        data: &[u8],
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        Self::check_ready(xml)?;

        let count = ((data.len() / RPMB_FRAME_LEN) as u32).min(self.sectors);
        if count == 0 {
            return Err(Error::obscura("No whole RPMB frame to write"));
        }
        Self::last_sector(sector, count)?;

        exts::custom_rpmb_init(xml).await?;

        let frames = data.chunks_exact(RPMB_FRAME_LEN).take(count as usize);
        self.write_frames(xml, sector, frames, count, progress).await?;

        info!("[Obscura] Wrote {count} RPMB sectors");
        Ok(())
    }

    /// Zeroes `count` sectors. There is no erase command, zero frames are written instead.
    pub async fn erase(
        &self,
        xml: &mut Xml,
        sector: u32,
        count: Option<u32>,
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        Self::check_ready(xml)?;

        let count = count.unwrap_or(self.sectors);
        if count == 0 {
            return Err(Error::obscura("No RPMB sectors to erase"));
        }
        Self::last_sector(sector, count)?;

        exts::custom_rpmb_init(xml).await?;

        let zero = [0u8; RPMB_FRAME_LEN];
        let frames = std::iter::repeat_n(&zero[..], count as usize);
        self.write_frames(xml, sector, frames, count, progress).await?;

        info!("[Obscura] Erased {count} RPMB sectors");
        Ok(())
    }

    async fn write_frames<'a>(
        &self,
        xml: &mut Xml,
        sector: u32,
        frames: impl Iterator<Item = &'a [u8]>,
        count: u32,
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        let total = count as usize * RPMB_FRAME_LEN;

        for (pos, frame) in frames.enumerate() {
            let at = sector.wrapping_add(pos as u32);
            exts::rpmb_write_sector(xml, at, frame, self.ufs).await.inspect_err(|e| {
                error!("Couldn't write RPMB sector {at}: {e}");
            })?;
            progress((pos + 1) * RPMB_FRAME_LEN, total);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::ScriptHandle;
    use crate::core::storage::{EmmcInfo, NandInfo, UfsInfo};
    use crate::da::xml::xml_lib::tests::scripted_xml;
    use crate::error::{RpmbError, RpmbStatus};

    fn emmc(rpmb_size: u64) -> StorageInfo {
        StorageInfo::Emmc(EmmcInfo { block_size: 0x200, rpmb_size, ..Default::default() })
    }

    fn push_custom(handle: &ScriptHandle, frames: &[&[u8]]) {
        handle.push_text("OK");
        for frame in frames {
            handle.push_bytes(frame);
        }
        handle.push_end_start("OK");
    }

    fn frames(count: usize) -> Vec<u8> {
        (0..count * RPMB_FRAME_LEN).map(|i| (i / RPMB_FRAME_LEN + i) as u8).collect()
    }

    async fn rpmb_xml(storage: StorageInfo) -> (Xml, ScriptHandle) {
        let (mut xml, handle) = scripted_xml();
        xml.using_exts = true;
        xml.dev_info.set_storage(storage).await;
        (xml, handle)
    }

    #[test]
    fn sector_counts_follow_storage() {
        assert_eq!(RpmbEngine::for_storage(&emmc(0x40_0000)).unwrap().default_sectors(), 0x4000);

        let ufs = StorageInfo::Ufs(UfsInfo { block_size: 0x1000, ..Default::default() });
        assert_eq!(RpmbEngine::for_storage(&ufs).unwrap().default_sectors(), 0x2_0000);

        let nand = StorageInfo::Nand(NandInfo::default());
        assert!(RpmbEngine::for_storage(&nand).is_err());
    }

    #[tokio::test]
    async fn write_then_read_back() {
        let storage = emmc(0x40_0000);
        let engine = RpmbEngine::for_storage(&storage).unwrap();
        let (mut xml, handle) = rpmb_xml(storage).await;
        let data = frames(3);

        // Key derivation, then one status per sector
        push_custom(&handle, &[&[1, 0, 0, 0]]);
        for _ in 0..3 {
            push_custom(&handle, &[&[0, 0]]);
        }

        let mut seen = Vec::new();
        let mut progress = |done: usize, total: usize| seen.push((done, total));
        engine.write(&mut xml, 0x10, &data, &mut progress).await.unwrap();
        assert_eq!(seen.last(), Some(&(0x300, 0x300)));

        let sent = handle.sent_frames();
        assert_eq!(sent[4], 0x10u32.to_le_bytes());
        assert_eq!(sent[5], &data[..0x100]);
        assert_eq!(sent[15], &data[0x200..]);

        for frame in data.chunks(RPMB_FRAME_LEN) {
            push_custom(&handle, &[&[0, 0], frame]);
        }
        let mut out = Vec::new();
        let mut progress = |_, _| {};
        engine.read(&mut xml, 0x10, Some(3), &mut out, &mut progress).await.unwrap();

        assert_eq!(out, data);
        assert_eq!(handle.unread(), 0);
    }

    #[tokio::test]
    async fn failing_sector_stops_the_write() {
        let storage = emmc(0x40_0000);
        let engine = RpmbEngine::for_storage(&storage).unwrap();
        let (mut xml, handle) = rpmb_xml(storage).await;

        push_custom(&handle, &[&[1, 0, 0, 0]]);
        push_custom(&handle, &[&[0, 0]]);
        push_custom(&handle, &[&[0, 0]]);
        push_custom(&handle, &[&[3, 0]]);

        let mut progress = |_, _| {};
        let err = engine.write(&mut xml, 0, &frames(4), &mut progress).await.unwrap_err();
        assert!(matches!(err, Error::Rpmb(RpmbError::Status(RpmbStatus::CounterFailure, 2))));
        assert_eq!(handle.unread(), 0);

        // Sectors 0 to 2 went out, sector 3 never did
        let writes = handle.sent_texts().iter().filter(|t| t.contains("CMD:CUSTOMRPMBW")).count();
        assert_eq!(writes, 3);
    }

    #[tokio::test]
    async fn erase_writes_zero_frames() {
        let storage = emmc(0x200);
        let engine = RpmbEngine::for_storage(&storage).unwrap();
        let (mut xml, handle) = rpmb_xml(storage).await;

        push_custom(&handle, &[&[1, 0, 0, 0]]);
        push_custom(&handle, &[&[0, 0]]);
        push_custom(&handle, &[&[0, 0]]);

        let mut progress = |_, _| {};
        engine.erase(&mut xml, 0, None, &mut progress).await.unwrap();
        assert_eq!(handle.unread(), 0);

        let zero_frames = handle.sent_frames().iter().filter(|f| f.as_slice() == [0u8; RPMB_FRAME_LEN]).count();
        assert_eq!(zero_frames, 2);
    }

    #[tokio::test]
    async fn ranges_past_the_last_sector_are_refused() {
        let storage = emmc(0x40_0000);
        let engine = RpmbEngine::for_storage(&storage).unwrap();
        let (mut xml, handle) = rpmb_xml(storage).await;

        let mut out = Vec::new();
        let mut progress = |_, _| {};
        assert!(engine.read(&mut xml, u32::MAX, Some(2), &mut out, &mut progress).await.is_err());
        assert!(engine.erase(&mut xml, u32::MAX - 1, Some(3), &mut progress).await.is_err());
        assert!(engine.write(&mut xml, u32::MAX, &frames(2), &mut progress).await.is_err());
        assert!(handle.written().is_empty());
    }

    #[tokio::test]
    async fn needs_the_extension() {
        let storage = emmc(0x200);
        let engine = RpmbEngine::for_storage(&storage).unwrap();
        let (mut xml, handle) = rpmb_xml(storage).await;
        xml.using_exts = false;

        let mut out = Vec::new();
        let mut progress = |_, _| {};
        assert!(engine.read(&mut xml, 0, None, &mut out, &mut progress).await.is_err());
        assert!(handle.written().is_empty());
    }
}
