/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::fmt;

use log::{error, warn};

use crate::error::{Error, Result};
use crate::utilities::xml::{get_field, parse_hex};

/// Smallest transfer the loader accepts for a flash operation.
pub const MIN_FLASH_LENGTH: u64 = 0x20000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Emmc,
    Ufs,
    Nand,
    Nor,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageType::Emmc => "EMMC",
            StorageType::Ufs => "UFS",
            StorageType::Nand => "NAND",
            StorageType::Nor => "NOR",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmmcInfo {
    pub block_size: u64,
    pub boot1_size: u64,
    pub boot2_size: u64,
    pub rpmb_size: u64,
    pub user_size: u64,
    pub gp1_size: u64,
    pub gp2_size: u64,
    pub gp3_size: u64,
    pub gp4_size: u64,
    pub cid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UfsInfo {
    pub block_size: u64,
    pub lua0_size: u64,
    pub lua1_size: u64,
    pub lua2_size: u64,
    pub lua3_size: u64,
    pub cid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NandInfo {
    pub block_size: u64,
    pub page_size: u64,
    pub spare_size: u64,
    pub total_size: u64,
    pub page_parity_size: u64,
    pub id: String,
    pub sub_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NorInfo {
    pub available_size: u64,
}

/// Storage geometry reported by the loader. Replaced as a whole on every reinit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageInfo {
    Emmc(EmmcInfo),
    Ufs(UfsInfo),
    Nand(NandInfo),
    Nor(NorInfo),
}

/// A logical partition request resolved to what the loader understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashTarget {
    pub storage: StorageType,
    /// Loader partition id, e.g. `EMMC-USER` or `UFS-LUA2`.
    pub partition: &'static str,
    pub length: u64,
}

fn hex_field(data: &str, name: &str) -> u64 {
    parse_hex(&get_field(data, name)).unwrap_or_default()
}

fn field_or(data: &str, name: &str, fallback: &str) -> String {
    let value = get_field(data, name);
    if value.is_empty() { get_field(data, fallback) } else { value }
}

impl StorageInfo {
    /// Builds the storage geometry out of a `GET-HW-INFO` reply.
    pub fn from_hw_info(data: &str) -> Result<Self> {
        let storage = get_field(data, "storage");

        let info = match storage.as_str() {
            "EMMC" => StorageInfo::Emmc(EmmcInfo {
                block_size: hex_field(data, "block_size"),
                boot1_size: hex_field(data, "boot1_size"),
                boot2_size: hex_field(data, "boot2_size"),
                rpmb_size: hex_field(data, "rpmb_size"),
                user_size: hex_field(data, "user_size"),
                gp1_size: hex_field(data, "gp1_size"),
                gp2_size: hex_field(data, "gp2_size"),
                gp3_size: hex_field(data, "gp3_size"),
                gp4_size: hex_field(data, "gp4_size"),
                // Some vendor loaders only report the cid tag
                cid: field_or(data, "id", "emmc_cid"),
            }),
            "UFS" => StorageInfo::Ufs(UfsInfo {
                block_size: hex_field(data, "block_size"),
                lua0_size: hex_field(data, "lua0_size"),
                lua1_size: hex_field(data, "lua1_size"),
                lua2_size: hex_field(data, "lua2_size"),
                lua3_size: hex_field(data, "lua3_size"),
                cid: field_or(data, "id", "ufs_cid"),
            }),
            "NAND" => StorageInfo::Nand(NandInfo {
                block_size: hex_field(data, "block_size"),
                page_size: hex_field(data, "page_size"),
                spare_size: hex_field(data, "spare_size"),
                total_size: hex_field(data, "total_size"),
                page_parity_size: hex_field(data, "page_parity_size"),
                id: get_field(data, "id"),
                sub_type: get_field(data, "sub_type"),
            }),
            "NOR" => StorageInfo::Nor(NorInfo { available_size: hex_field(data, "available_size") }),
            other => {
                error!("Unknown storage type: {other}");
                return Err(Error::proto(format!("Unknown storage type '{other}'")));
            }
        };

        Ok(info)
    }

    pub fn kind(&self) -> StorageType {
        match self {
            StorageInfo::Emmc(_) => StorageType::Emmc,
            StorageInfo::Ufs(_) => StorageType::Ufs,
            StorageInfo::Nand(_) => StorageType::Nand,
            StorageInfo::Nor(_) => StorageType::Nor,
        }
    }

    /// Size of the area holding the GPT.
    pub fn flash_size(&self) -> u64 {
        match self {
            StorageInfo::Emmc(e) => e.user_size,
            StorageInfo::Ufs(u) => u.lua2_size,
            StorageInfo::Nand(n) => n.total_size,
            StorageInfo::Nor(n) => n.available_size,
        }
    }

    pub fn rpmb_size(&self) -> u64 {
        match self {
            StorageInfo::Emmc(e) => e.rpmb_size,
            StorageInfo::Ufs(u) => u.lua3_size,
            _ => 0,
        }
    }

    pub fn sector_size(&self) -> usize {
        match self {
            StorageInfo::Ufs(_) => 4096,
            _ => 512,
        }
    }

    /// Maps a logical partition name (`user`, `boot1`, `lu3`, `rpmb`...) to the loader
    /// partition id, clamping `length` to what the partition can hold.
    /// Unknown names for the storage type yield `None`.
    pub fn resolve_partition(&self, part: Option<&str>, length: u64) -> Option<FlashTarget> {
        let length = length.max(MIN_FLASH_LENGTH);
        let part = part.unwrap_or("user");

        let (partition, capacity) = match self {
            StorageInfo::Emmc(e) => match part {
                "user" => ("EMMC-USER", e.user_size),
                "boot1" => ("EMMC-BOOT1", e.boot1_size),
                "boot2" => ("EMMC-BOOT2", e.boot2_size),
                "gp1" => ("EMMC-GP1", e.gp1_size),
                "gp2" => ("EMMC-GP2", e.gp2_size),
                "gp3" => ("EMMC-GP3", e.gp3_size),
                "gp4" => ("EMMC-GP4", e.gp4_size),
                "rpmb" => ("EMMC-RPMB", e.rpmb_size),
                _ => {
                    warn!(
                        "Unknown partition type '{part}'. Known types are \"user\", \"boot1\", \"boot2\", \"gp1\", \"gp2\", \"gp3\", \"gp4\", \"rpmb\""
                    );
                    return None;
                }
            },
            StorageInfo::Ufs(u) => match part {
                "lu3" | "user" => ("UFS-LUA2", u.lua2_size),
                "lu1" | "boot1" => ("UFS-LUA0", u.lua0_size),
                "lu2" | "boot2" => ("UFS-LUA1", u.lua1_size),
                "lu4" | "rpmb" => ("UFS-LUA3", u.lua3_size),
                _ => {
                    warn!(
                        "Unknown partition type '{part}'. Known types are \"lu1\", \"lu2\", \"lu3\", \"lu4\""
                    );
                    return None;
                }
            },
            StorageInfo::Nand(n) => ("NAND-WHOLE", n.total_size),
            StorageInfo::Nor(n) => ("NOR-WHOLE", n.available_size),
        };

        Some(FlashTarget { storage: self.kind(), partition, length: length.min(capacity) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UFS_HW_INFO: &str = r#"<?xml version="1.0" encoding="utf-8"?><da_hw_info><version>1.2</version><ram_size>0x100000000</ram_size><storage>UFS</storage><ufs><block_size>0x1000</block_size><lua0_size>0x400000</lua0_size><lua1_size>0x400000</lua1_size><lua2_size>0xee5800000</lua2_size><lua3_size>0x1000000</lua3_size><ufs_cid>4D54303634</ufs_cid></ufs></da_hw_info>"#;

    const EMMC_HW_INFO: &str = "<storage>EMMC</storage><emmc><block_size>0x200</block_size><boot1_size>0x400000</boot1_size><boot2_size>0x400000</boot2_size><rpmb_size>0x1000000</rpmb_size><user_size>0x3A3E00000</user_size><gp1_size>0</gp1_size><gp2_size>0</gp2_size><gp3_size>0</gp3_size><gp4_size>0</gp4_size><id>150100</id></emmc>";

    #[test]
    fn parses_hw_info() {
        let StorageInfo::Ufs(ufs) = StorageInfo::from_hw_info(UFS_HW_INFO).unwrap() else {
            panic!("expected UFS");
        };
        assert_eq!(ufs.block_size, 0x1000);
        assert_eq!(ufs.lua2_size, 0xee5800000);
        assert_eq!(ufs.cid, "4D54303634");

        let emmc = StorageInfo::from_hw_info(EMMC_HW_INFO).unwrap();
        assert_eq!(emmc.kind(), StorageType::Emmc);
        assert_eq!(emmc.flash_size(), 0x3A3E00000);
        assert_eq!(emmc.sector_size(), 512);

        assert!(StorageInfo::from_hw_info("<storage>SDIO</storage>").is_err());
    }

    #[test]
    fn resolution_clamps_to_capacity() {
        let emmc = StorageInfo::from_hw_info(EMMC_HW_INFO).unwrap();

        let boot1 = emmc.resolve_partition(Some("boot1"), 0x1000_0000).unwrap();
        assert_eq!(boot1.partition, "EMMC-BOOT1");
        assert_eq!(boot1.length, 0x400000);

        let user = emmc.resolve_partition(None, 0x100).unwrap();
        assert_eq!(user.partition, "EMMC-USER");
        assert_eq!(user.length, MIN_FLASH_LENGTH);

        assert_eq!(emmc.resolve_partition(Some("lu3"), 0x1000), None);

        let ufs = StorageInfo::from_hw_info(UFS_HW_INFO).unwrap();
        for (name, id, cap) in [
            ("lu3", "UFS-LUA2", 0xee5800000u64),
            ("user", "UFS-LUA2", 0xee5800000),
            ("boot1", "UFS-LUA0", 0x400000),
            ("lu2", "UFS-LUA1", 0x400000),
            ("rpmb", "UFS-LUA3", 0x1000000),
        ] {
            let target = ufs.resolve_partition(Some(name), u64::MAX).unwrap();
            assert_eq!(target.partition, id);
            assert_eq!(target.length, cap);
        }
    }

    #[test]
    fn nand_is_whole_device() {
        let nand = StorageInfo::Nand(NandInfo { total_size: 0x100000, ..Default::default() });
        let target = nand.resolve_partition(Some("anything"), 0x1000_0000).unwrap();
        assert_eq!(target.partition, "NAND-WHOLE");
        assert_eq!(target.length, 0x100000);
    }
}
