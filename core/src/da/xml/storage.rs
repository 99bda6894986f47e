/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use log::{debug, info, warn};

use crate::core::gpt::{BPI_MAGIC, GptHeader, GptTable, PartitionEntry, PartitionType};
use crate::core::storage::StorageInfo;
use crate::da::xml::Xml;
use crate::da::xml::cmds::{EmmcControl, GetHwInfo, ReadPartitionTable, create_cmd};
use crate::da::xml::flash;
use crate::error::Result;
use crate::utilities::xml::{get_field, parse_hex};

/// Where the backup header is looked for when the primary one is blank.
const BACKUP_GPT_OFFSET: u64 = 0x4000;
/// Sectors read to get a whole BPI table.
const BPI_SECTORS: u64 = 32;

/// Queries the storage geometry and replaces the cached one.
pub async fn reinit(xml: &mut Xml) -> Result<StorageInfo> {
    let data = xml.fetch_blob(&create_cmd(&GetHwInfo::new())).await?;
    let storage = StorageInfo::from_hw_info(&String::from_utf8_lossy(&data))?;

    info!("[Obscura] {} storage, 0x{:X} bytes", storage.kind(), storage.flash_size());
    xml.sector_size = storage.sector_size();
    xml.dev_info.set_storage(storage.clone()).await;

    Ok(storage)
}

pub async fn check_lifecycle(xml: &mut Xml) -> Result<bool> {
    let cmd = create_cmd(&EmmcControl::new("LIFE-CYCLE-STATUS".to_string()));
    let data = xml.fetch_blob(&cmd).await?;
    Ok(data == b"OK\0")
}

/// Partition list kept by the loader itself, used when the storage has no GPT.
pub async fn read_partition_table(xml: &mut Xml) -> Result<Vec<PartitionEntry>> {
    let data = xml.fetch_blob(&create_cmd(&ReadPartitionTable::new())).await?;
    let text = String::from_utf8_lossy(&data);
    let ss = xml.sector_size.max(1) as u64;

    let mut entries = Vec::new();
    for item in text.split("<pt>") {
        let name = get_field(item, "name");
        if name.is_empty() {
            continue;
        }
        let Some(size) = parse_hex(&get_field(item, "size")) else {
            continue;
        };
        let start = parse_hex(&get_field(item, "start")).unwrap_or_default();

        entries.push(PartitionEntry {
            name,
            unique_id: String::new(),
            first_sector: start / ss,
            sector_count: size / ss,
            flags: 0,
            type_id: PartitionType::Bpi,
        });
    }

    debug!("Loader partition table holds {} entries", entries.len());
    Ok(entries)
}

/// Reads and parses the partition table of `part`. Vendor tables are returned
/// as a [`GptTable`] too. `None` when the storage holds no table at all.
pub async fn get_gpt(xml: &mut Xml, part: Option<&str>) -> Result<Option<GptTable>> {
    let ss = xml.get_or_reinit_storage().await?.sector_size();
    xml.sector_size = ss;

    let data = flash::read_to_vec(xml, 0, 2 * ss as u64, part).await?;
    if data.is_empty() {
        return Ok(None);
    }

    if data.starts_with(BPI_MAGIC) {
        let data = flash::read_to_vec(xml, 0, BPI_SECTORS * ss as u64, part).await?;
        return Ok(Some(GptTable::parse_bpi(&data, ss)));
    }

    if data.starts_with(b"EMMC_BOOT") || data.starts_with(b"UFS_BOOT") {
        let entries = read_partition_table(xml).await?;
        if entries.is_empty() {
            return Ok(None);
        }
        let total_sectors = entries.iter().map(|e| e.first_sector + e.sector_count).max().unwrap_or(0);
        return Ok(Some(GptTable { sector_size: ss, total_sectors, first_usable_lba: 0, entries }));
    }

    let header = match GptHeader::parse(&data, ss) {
        Some(header) => header,
        None => {
            let flash_size = xml.get_or_reinit_storage().await?.flash_size();
            let addr = flash_size.saturating_sub(BACKUP_GPT_OFFSET);
            warn!("No GPT header at the start of the storage, trying 0x{addr:X}");

            let data = flash::read_to_vec(xml, addr, 2 * ss as u64, part).await?;
            match GptHeader::parse(&data, ss) {
                Some(header) => header,
                None => return Ok(None),
            }
        }
    };

    if header.first_usable_lba == 0 {
        return Ok(None);
    }

    let data = flash::read_to_vec(xml, 0, header.first_usable_lba * ss as u64, part).await?;
    Ok(GptTable::parse_any(&data, ss))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::connection::mock::ScriptHandle;
    use crate::core::gpt::tests::sample_gpt;
    use crate::core::storage::UfsInfo;
    use crate::da::xml::xml_lib::tests::{push_transfer, scripted_xml, upload_file_cmd};

    const EMMC_HW_INFO: &str = "<storage>EMMC</storage><emmc><block_size>0x200</block_size><boot1_size>0x400000</boot1_size><boot2_size>0x400000</boot2_size><rpmb_size>0x1000000</rpmb_size><user_size>0x100000000</user_size></emmc>";

    pub(crate) fn push_blob(handle: &ScriptHandle, blob: &[u8]) {
        handle.push_text("OK");
        upload_file_cmd(handle);
        push_transfer(handle, blob, 0x1000);
        handle.push_end_start("OK");
    }

    /// Device side of a READ-FLASH of `data`, sent as a single frame.
    pub(crate) fn push_readback(handle: &ScriptHandle, data: &[u8]) {
        handle.push_text("OK");
        upload_file_cmd(handle);
        handle.push_text(&format!("OK@0x{:x}", data.len()));
        handle.push_text("OK");
        handle.push_bytes(data);
        handle.push_cmd("CMD:END", "<result>OK</result>");
        handle.push_cmd("CMD:START", "");
    }

    fn padded(mut data: Vec<u8>, len: usize) -> Vec<u8> {
        data.resize(len, 0);
        data
    }

    #[tokio::test]
    async fn reinit_replaces_geometry() {
        let (mut xml, handle) = scripted_xml();

        push_blob(&handle, EMMC_HW_INFO.as_bytes());
        let storage = reinit(&mut xml).await.unwrap();

        assert_eq!(storage.flash_size(), 0x1_0000_0000);
        assert_eq!(xml.dev_info.storage().await, Some(storage));
        assert_eq!(xml.sector_size, 512);

        push_blob(&handle, b"OK\0");
        assert!(check_lifecycle(&mut xml).await.unwrap());
        push_blob(&handle, b"ERR\0");
        assert!(!check_lifecycle(&mut xml).await.unwrap());
        assert_eq!(handle.unread(), 0);
    }

    #[tokio::test]
    async fn loader_partition_list() {
        let (mut xml, handle) = scripted_xml();
        xml.sector_size = 4096;

        push_blob(
            &handle,
            b"<pt><name>preloader</name><start>0x0</start><size>0x400000</size></pt>\
              <pt><name>broken</name><start>0x400000</start><size></size></pt>\
              <pt><name>nvram</name><start>0x400000</start><size>0x800000</size></pt>",
        );

        let entries = read_partition_table(&mut xml).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].name, "nvram");
        assert_eq!(entries[1].first_sector, 0x400);
        assert_eq!(entries[1].sector_count, 0x800);
        assert_eq!(entries[1].type_id, PartitionType::Bpi);
    }

    #[tokio::test]
    async fn gpt_from_user_area() {
        let (mut xml, handle) = scripted_xml();
        xml.dev_info
            .set_storage(StorageInfo::Ufs(UfsInfo { block_size: 0x1000, lua2_size: 0x1_0000_0000, ..Default::default() }))
            .await;

        let image = padded(sample_gpt(4096), 0x20000);
        push_readback(&handle, &image);
        push_readback(&handle, &image);

        let table = get_gpt(&mut xml, None).await.unwrap().unwrap();
        assert_eq!(table.sector_size, 4096);
        assert_eq!(table.find("boot").map(|p| p.first_sector), Some(0x40));
        assert_eq!(handle.unread(), 0);

        // Both reads went to the user LU
        let texts = handle.sent_texts();
        assert_eq!(texts.iter().filter(|t| t.contains("<partition>UFS-LUA2</partition>")).count(), 2);
    }

    #[tokio::test]
    async fn blank_storage_has_no_table() {
        let (mut xml, handle) = scripted_xml();
        push_blob(&handle, EMMC_HW_INFO.as_bytes());

        let blank = vec![0u8; 0x20000];
        push_readback(&handle, &blank);
        push_readback(&handle, &blank);

        assert_eq!(get_gpt(&mut xml, None).await.unwrap(), None);
        assert!(handle.sent_texts().iter().any(|t| t.contains("<offset>0xffffc000</offset>")));
        assert_eq!(handle.unread(), 0);
    }

    #[tokio::test]
    async fn vendor_boot_header_uses_loader_table() {
        let (mut xml, handle) = scripted_xml();
        push_blob(&handle, EMMC_HW_INFO.as_bytes());

        let mut boot = b"EMMC_BOOT".to_vec();
        boot.resize(0x20000, 0);
        push_readback(&handle, &boot);
        push_blob(&handle, b"<pt><name>lk</name><start>0x200</start><size>0x400</size></pt>");

        let table = get_gpt(&mut xml, Some("user")).await.unwrap().unwrap();
        assert_eq!(table.entries.len(), 1);
        assert_eq!(table.total_sectors, 3);
        assert_eq!(table.first_usable_lba, 0);
    }
}
