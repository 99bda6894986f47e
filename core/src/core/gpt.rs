/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::fmt;

use log::{debug, error, warn};
use num_enum::TryFromPrimitive;

use crate::{le_u32, le_u64};

pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
pub const GPT_REVISION: u32 = 0x0001_0000;
pub const BPI_MAGIC: &[u8; 4] = b"BPI\0";
const GPT_HEADER_LEN: usize = 0x5C;
const BPI_TABLE_START: usize = 0x800;
const BPI_ENTRY_LEN: usize = 0x80;
/// Sectors past `last_usable_lba` taken by the backup entries and header.
const GPT_TRAILER_SECTORS: u64 = 34;

/// Well known partition types, keyed by the first dword of the type GUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum EfiType {
    Unused = 0x0000_0000,
    Mbr = 0x024D_EE41,
    System = 0xC12A_7328,
    BiosBoot = 0x2168_6148,
    Iffs = 0xD3BF_E2DE,
    SonyBoot = 0xF401_9732,
    LenovoBoot = 0xBFBF_AFE7,
    Msr = 0xE3C9_E316,
    BasicData = 0xEBD0_A0A2,
    LdmMeta = 0x5808_C8AA,
    Ldm = 0xAF9B_60A0,
    Recovery = 0xDE94_BBA4,
    Gpfs = 0x37AF_FC90,
    StorageSpaces = 0xE75C_AF8F,
    HpuxData = 0x7589_4C1E,
    HpuxService = 0xE2A1_E728,
    LinuxData = 0x0FC6_3DAF,
    LinuxRaid = 0xA19D_880F,
    LinuxRoot32 = 0x4447_9540,
    LinuxRoot64 = 0x4F68_BCE3,
    LinuxRootArm32 = 0x69DA_D710,
    LinuxRootArm64 = 0xB921_B045,
    LinuxSwap = 0x0657_FD6D,
    LinuxLvm = 0xE6D6_D379,
    LinuxHome = 0x933A_C7E1,
    LinuxSrv = 0x3B8F_8425,
    LinuxDmCrypt = 0x7FFE_C5C9,
    LinuxLuks = 0xCA7D_7CCB,
    LinuxReserved = 0x8DA6_3339,
    FreebsdBoot = 0x83BD_6B9D,
    FreebsdData = 0x516E_7CB4,
    FreebsdSwap = 0x516E_7CB5,
    FreebsdUfs = 0x516E_7CB6,
    FreebsdVinum = 0x516E_7CB8,
    FreebsdZfs = 0x516E_7CBA,
    OsxHfs = 0x4846_5300,
    OsxUfs = 0x5546_5300,
    OsxZfs = 0x6A89_8CC3,
    OsxRaid = 0x5241_4944,
    OsxRecovery = 0x426F_6F74,
    OsxLabel = 0x4C61_6265,
    OsxTvRecovery = 0x5265_636F,
    OsxCoreStorage = 0x5374_6F72,
    ChromeosKernel = 0xFE3A_2A5D,
    ChromeosRootfs = 0x3CB8_E202,
    ChromeosFuture = 0x2E0A_753D,
    Haiku = 0x4246_5331,
    CephJournal = 0x45B0_969E,
    CephOsd = 0x4FBD_7E29,
    CephCreate = 0x89C5_7F98,
    Openbsd = 0x824C_C7A0,
    Qnx = 0xCEF5_A9AD,
    Plan9 = 0xC918_18F9,
    VmwareVmkcore = 0x9D27_5380,
    VmwareVmfs = 0xAA31_E02A,
    VmwareReserved = 0x9198_EFFC,
}

impl EfiType {
    pub fn name(&self) -> &'static str {
        match self {
            EfiType::Unused => "EFI_UNUSED",
            EfiType::Mbr => "EFI_MBR",
            EfiType::System => "EFI_SYSTEM",
            EfiType::BiosBoot => "EFI_BIOS_BOOT",
            EfiType::Iffs => "EFI_IFFS",
            EfiType::SonyBoot => "EFI_SONY_BOOT",
            EfiType::LenovoBoot => "EFI_LENOVO_BOOT",
            EfiType::Msr => "EFI_MSR",
            EfiType::BasicData => "EFI_BASIC_DATA",
            EfiType::LdmMeta => "EFI_LDM_META",
            EfiType::Ldm => "EFI_LDM",
            EfiType::Recovery => "EFI_RECOVERY",
            EfiType::Gpfs => "EFI_GPFS",
            EfiType::StorageSpaces => "EFI_STORAGE_SPACES",
            EfiType::HpuxData => "EFI_HPUX_DATA",
            EfiType::HpuxService => "EFI_HPUX_SERVICE",
            EfiType::LinuxData => "EFI_LINUX_DATA",
            EfiType::LinuxRaid => "EFI_LINUX_RAID",
            EfiType::LinuxRoot32 => "EFI_LINUX_ROOT32",
            EfiType::LinuxRoot64 => "EFI_LINUX_ROOT64",
            EfiType::LinuxRootArm32 => "EFI_LINUX_ROOT_ARM32",
            EfiType::LinuxRootArm64 => "EFI_LINUX_ROOT_ARM64",
            EfiType::LinuxSwap => "EFI_LINUX_SWAP",
            EfiType::LinuxLvm => "EFI_LINUX_LVM",
            EfiType::LinuxHome => "EFI_LINUX_HOME",
            EfiType::LinuxSrv => "EFI_LINUX_SRV",
            EfiType::LinuxDmCrypt => "EFI_LINUX_DM_CRYPT",
            EfiType::LinuxLuks => "EFI_LINUX_LUKS",
            EfiType::LinuxReserved => "EFI_LINUX_RESERVED",
            EfiType::FreebsdBoot => "EFI_FREEBSD_BOOT",
            EfiType::FreebsdData => "EFI_FREEBSD_DATA",
            EfiType::FreebsdSwap => "EFI_FREEBSD_SWAP",
            EfiType::FreebsdUfs => "EFI_FREEBSD_UFS",
            EfiType::FreebsdVinum => "EFI_FREEBSD_VINUM",
            EfiType::FreebsdZfs => "EFI_FREEBSD_ZFS",
            EfiType::OsxHfs => "EFI_OSX_HFS",
            EfiType::OsxUfs => "EFI_OSX_UFS",
            EfiType::OsxZfs => "EFI_OSX_ZFS",
            EfiType::OsxRaid => "EFI_OSX_RAID",
            EfiType::OsxRecovery => "EFI_OSX_RECOVERY",
            EfiType::OsxLabel => "EFI_OSX_LABEL",
            EfiType::OsxTvRecovery => "EFI_OSX_TV_RECOVERY",
            EfiType::OsxCoreStorage => "EFI_OSX_CORE_STORAGE",
            EfiType::ChromeosKernel => "EFI_CHROMEOS_KERNEL",
            EfiType::ChromeosRootfs => "EFI_CHROMEOS_ROOTFS",
            EfiType::ChromeosFuture => "EFI_CHROMEOS_FUTURE",
            EfiType::Haiku => "EFI_HAIKU",
            EfiType::CephJournal => "EFI_CEPH_JOURNAL",
            EfiType::CephOsd => "EFI_CEPH_OSD",
            EfiType::CephCreate => "EFI_CEPH_CREATE",
            EfiType::Openbsd => "EFI_OPENBSD",
            EfiType::Qnx => "EFI_QNX",
            EfiType::Plan9 => "EFI_PLAN9",
            EfiType::VmwareVmkcore => "EFI_VMWARE_VMKCORE",
            EfiType::VmwareVmfs => "EFI_VMWARE_VMFS",
            EfiType::VmwareReserved => "EFI_VMWARE_RESERVED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    Efi(EfiType),
    /// Type GUID not in [`EfiType`], holds its first dword.
    Raw(u32),
    /// Entries of a vendor BPI table carry no type.
    Bpi,
}

impl PartitionType {
    fn from_guid(guid: &[u8]) -> Self {
        let id = le_u32!(guid, 0);
        match EfiType::try_from(id) {
            Ok(t) => PartitionType::Efi(t),
            Err(_) => PartitionType::Raw(id),
        }
    }
}

impl fmt::Display for PartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionType::Efi(t) => f.write_str(t.name()),
            PartitionType::Raw(id) => write!(f, "0x{id:x}"),
            PartitionType::Bpi => f.write_str("0x0"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub name: String,
    pub unique_id: String,
    pub first_sector: u64,
    pub sector_count: u64,
    pub flags: u64,
    pub type_id: PartitionType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
    pub revision: u32,
    pub header_size: u32,
    pub crc32: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub part_entry_start_lba: u64,
    pub num_part_entries: u32,
    pub part_entry_size: u32,
}

impl GptHeader {
    /// Reads the header found at `sector_size`. `None` if the signature is missing.
    pub fn parse(data: &[u8], sector_size: usize) -> Option<Self> {
        let hdr = data.get(sector_size..sector_size + GPT_HEADER_LEN)?;
        if &hdr[0..8] != GPT_SIGNATURE {
            return None;
        }

        Some(GptHeader {
            revision: le_u32!(hdr, 0x08),
            header_size: le_u32!(hdr, 0x0C),
            crc32: le_u32!(hdr, 0x10),
            current_lba: le_u64!(hdr, 0x18),
            backup_lba: le_u64!(hdr, 0x20),
            first_usable_lba: le_u64!(hdr, 0x28),
            last_usable_lba: le_u64!(hdr, 0x30),
            part_entry_start_lba: le_u64!(hdr, 0x48),
            num_part_entries: le_u32!(hdr, 0x50),
            part_entry_size: le_u32!(hdr, 0x54),
        })
    }

    /// Recomputes the header CRC over `header_size` bytes with the CRC field zeroed.
    fn crc_matches(&self, data: &[u8], sector_size: usize) -> bool {
        let len = self.header_size as usize;
        if !(GPT_HEADER_LEN..=sector_size).contains(&len) {
            return false;
        }
        let Some(raw) = data.get(sector_size..sector_size + len) else {
            return false;
        };
        let mut raw = raw.to_vec();
        raw[0x10..0x14].fill(0);
        crc32fast::hash(&raw) == self.crc32
    }
}

/// Partition table read off the device, either a GPT or a BPI table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptTable {
    pub sector_size: usize,
    pub total_sectors: u64,
    /// Sectors to read to get the whole primary table. Zero for BPI.
    pub first_usable_lba: u64,
    pub entries: Vec<PartitionEntry>,
}

fn format_guid(raw: &[u8]) -> String {
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{}",
        le_u32!(raw, 0),
        u16::from_le_bytes([raw[4], raw[5]]),
        u16::from_le_bytes([raw[6], raw[7]]),
        u16::from_le_bytes([raw[8], raw[9]]),
        hex::encode(&raw[10..16])
    )
}

fn decode_name(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|c| *c != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

fn is_zero(data: &[u8]) -> bool {
    data.iter().all(|b| *b == 0)
}

/// Parses the common 0x80 byte entry layout (type, unique, first, last, flags, name).
fn parse_entry(raw: &[u8], type_id: PartitionType) -> PartitionEntry {
    let first = le_u64!(raw, 0x20);
    let last = le_u64!(raw, 0x28);

    PartitionEntry {
        name: decode_name(&raw[0x38..0x80]),
        unique_id: format_guid(&raw[0x10..0x20]),
        first_sector: first,
        sector_count: last.saturating_sub(first).saturating_add(1),
        flags: le_u64!(raw, 0x30),
        type_id,
    }
}

impl GptTable {
    /// Parses a GPT with the given sector size, or a BPI table if the buffer starts
    /// with its magic. Returns `None` when the buffer holds neither.
    pub fn parse(data: &[u8], sector_size: usize) -> Option<Self> {
        let Some(header) = GptHeader::parse(data, sector_size) else {
            if data.starts_with(BPI_MAGIC) {
                return Some(Self::parse_bpi(data, sector_size));
            }
            return None;
        };

        if header.revision != GPT_REVISION {
            error!("Unknown GPT revision 0x{:X}", header.revision);
            return None;
        }

        if !(GPT_HEADER_LEN..=sector_size).contains(&(header.header_size as usize)) {
            error!("Invalid GPT header size 0x{:X}", header.header_size);
            return None;
        }

        if !header.crc_matches(data, sector_size) {
            warn!("GPT header CRC mismatch, parsing anyway");
        }

        let Some(start) = usize::try_from(header.part_entry_start_lba)
            .ok()
            .and_then(|lba| lba.checked_mul(sector_size))
        else {
            error!("GPT entries start out of range (LBA 0x{:X})", header.part_entry_start_lba);
            return None;
        };
        let entry_size = header.part_entry_size as usize;
        if entry_size < BPI_ENTRY_LEN {
            error!("Invalid GPT entry size 0x{:X}", entry_size);
            return None;
        }

        let mut entries = Vec::new();
        for idx in 0..header.num_part_entries as usize {
            let raw = idx
                .checked_mul(entry_size)
                .and_then(|off| off.checked_add(start))
                .and_then(|off| data.get(off..off.checked_add(entry_size)?));
            let Some(raw) = raw else {
                debug!("GPT buffer ends before entry {idx}");
                break;
            };

            if is_zero(&raw[0x10..0x20]) {
                break;
            }

            let type_id = PartitionType::from_guid(&raw[0..0x10]);
            if type_id == PartitionType::Efi(EfiType::Unused) {
                continue;
            }
            entries.push(parse_entry(raw, type_id));
        }

        let Some(total_sectors) = header.last_usable_lba.checked_add(GPT_TRAILER_SECTORS) else {
            error!("Invalid GPT last usable LBA 0x{:X}", header.last_usable_lba);
            return None;
        };

        Some(GptTable {
            sector_size,
            total_sectors,
            first_usable_lba: header.first_usable_lba,
            entries,
        })
    }

    /// Parses the vendor BPI table: fixed 0x80 byte entries starting at 0x800.
    pub fn parse_bpi(data: &[u8], sector_size: usize) -> Self {
        let mut entries = Vec::new();
        let mut total_sectors = 0;

        let mut pos = BPI_TABLE_START;
        while let Some(raw) = data.get(pos..pos + BPI_ENTRY_LEN) {
            if is_zero(&raw[0x10..0x20]) {
                break;
            }

            let entry = parse_entry(raw, PartitionType::Bpi);
            total_sectors = total_sectors.max(le_u64!(raw, 0x28));
            entries.push(entry);
            pos += BPI_ENTRY_LEN;
        }

        GptTable { sector_size, total_sectors, first_usable_lba: 0, entries }
    }

    /// Tries `preferred` first, then the usual 512 and 4096 byte sectors.
    pub fn parse_any(data: &[u8], preferred: usize) -> Option<Self> {
        [preferred, 512, 4096].into_iter().find_map(|size| Self::parse(data, size))
    }

    pub fn total_size(&self) -> u64 {
        self.total_sectors.saturating_mul(self.sector_size as u64)
    }

    pub fn find(&self, name: &str) -> Option<&PartitionEntry> {
        self.entries.iter().find(|p| p.name == name)
    }

    /// Byte offset and length of a partition.
    pub fn span(&self, entry: &PartitionEntry) -> (u64, u64) {
        let ss = self.sector_size as u64;
        (entry.first_sector.saturating_mul(ss), entry.sector_count.saturating_mul(ss))
    }
}

impl fmt::Display for GptTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\nGPT Table:\n-------------")?;
        for p in &self.entries {
            let (offset, length) = self.span(p);
            writeln!(
                f,
                "{:20} Offset 0x{:016x}, Length 0x{:016x}, Flags 0x{:08x}, UUID {}, Type {}",
                format!("{}:", p.name),
                offset,
                length,
                p.flags,
                p.unique_id,
                p.type_id
            )?;
        }
        writeln!(
            f,
            "\nTotal disk size:0x{:016x}, sectors:0x{:016x}",
            self.total_size(),
            self.total_sectors
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const LINUX_DATA_GUID: [u8; 16] = [
        0xAF, 0x3D, 0xC6, 0x0F, 0x83, 0x84, 0x72, 0x47, 0x8E, 0x79, 0x3D, 0x69, 0xD8, 0x47, 0x7D,
        0xE4,
    ];

    fn write_entry(buf: &mut [u8], type_guid: &[u8; 16], unique: u8, first: u64, last: u64, name: &str) {
        buf[0..16].copy_from_slice(type_guid);
        buf[16..32].fill(unique);
        buf[0x20..0x28].copy_from_slice(&first.to_le_bytes());
        buf[0x28..0x30].copy_from_slice(&last.to_le_bytes());
        buf[0x30..0x38].copy_from_slice(&1u64.to_le_bytes());
        for (i, unit) in name.encode_utf16().enumerate() {
            buf[0x38 + i * 2..0x3A + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
    }

    /// Builds a small GPT image: an unused entry between two used ones.
    pub(crate) fn sample_gpt(sector_size: usize) -> Vec<u8> {
        let mut data = vec![0u8; sector_size * 6];
        let hdr = &mut data[sector_size..sector_size + GPT_HEADER_LEN];
        hdr[0..8].copy_from_slice(GPT_SIGNATURE);
        hdr[0x08..0x0C].copy_from_slice(&GPT_REVISION.to_le_bytes());
        hdr[0x0C..0x10].copy_from_slice(&(GPT_HEADER_LEN as u32).to_le_bytes());
        hdr[0x28..0x30].copy_from_slice(&6u64.to_le_bytes());
        hdr[0x30..0x38].copy_from_slice(&0x1000u64.to_le_bytes());
        hdr[0x48..0x50].copy_from_slice(&2u64.to_le_bytes());
        hdr[0x50..0x54].copy_from_slice(&4u32.to_le_bytes());
        hdr[0x54..0x58].copy_from_slice(&0x80u32.to_le_bytes());
        let crc = crc32fast::hash(hdr);
        hdr[0x10..0x14].copy_from_slice(&crc.to_le_bytes());

        let base = 2 * sector_size;
        write_entry(&mut data[base..base + 0x80], &LINUX_DATA_GUID, 0x11, 0x40, 0x7F, "boot");
        write_entry(&mut data[base + 0x80..base + 0x100], &[0u8; 16], 0x22, 0x80, 0x8F, "hole");
        let mut odd = [0u8; 16];
        odd[0..4].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        write_entry(&mut data[base + 0x100..base + 0x180], &odd, 0x33, 0x90, 0x9F, "vendor");
        data
    }

    #[test]
    fn parses_gpt() {
        let data = sample_gpt(512);
        let table = GptTable::parse(&data, 512).unwrap();

        assert_eq!(table.entries.len(), 2);
        assert!(table.entries.iter().all(|e| e.type_id != PartitionType::Efi(EfiType::Unused)));

        let boot = table.find("boot").unwrap();
        assert_eq!(boot.first_sector, 0x40);
        assert_eq!(boot.sector_count, 0x40);
        assert_eq!(boot.type_id, PartitionType::Efi(EfiType::LinuxData));
        assert_eq!(boot.unique_id, "11111111-1111-1111-1111-111111111111");
        assert_eq!(table.span(boot), (0x8000, 0x8000));

        assert_eq!(table.find("vendor").unwrap().type_id.to_string(), "0x12345678");
        assert_eq!(table.total_sectors, 0x1000 + 34);
        assert_eq!(table.first_usable_lba, 6);

        // Same input, same output
        assert_eq!(GptTable::parse(&data, 512), Some(table));
    }

    #[test]
    fn sector_size_fallback() {
        let data = sample_gpt(4096);
        assert_eq!(GptTable::parse(&data, 512), None);
        let table = GptTable::parse_any(&data, 512).unwrap();
        assert_eq!(table.sector_size, 4096);
        assert_eq!(table.total_size(), (0x1000 + 34) * 4096);
    }

    #[test]
    fn rejects_bad_revision() {
        let mut data = sample_gpt(512);
        data[512 + 8] = 0x02;
        assert_eq!(GptTable::parse(&data, 512), None);
        assert_eq!(GptTable::parse(&[0u8; 0x400], 512), None);
    }

    fn rewrite_header(data: &mut [u8], at: usize, value: &[u8]) {
        data[512 + at..512 + at + value.len()].copy_from_slice(value);
        let hdr = &mut data[512..512 + GPT_HEADER_LEN];
        hdr[0x10..0x14].fill(0);
        let crc = crc32fast::hash(hdr);
        hdr[0x10..0x14].copy_from_slice(&crc.to_le_bytes());
    }

    #[test]
    fn corrupt_headers_are_rejected() {
        let mut short = sample_gpt(512);
        short[512 + 0x0C..512 + 0x10].copy_from_slice(&8u32.to_le_bytes());
        assert_eq!(GptTable::parse(&short, 512), None);

        let mut huge = sample_gpt(512);
        huge[512 + 0x0C..512 + 0x10].copy_from_slice(&0x1000u32.to_le_bytes());
        assert_eq!(GptTable::parse(&huge, 512), None);

        let mut far = sample_gpt(512);
        rewrite_header(&mut far, 0x48, &u64::MAX.to_le_bytes());
        assert_eq!(GptTable::parse(&far, 512), None);

        let mut past_end = sample_gpt(512);
        rewrite_header(&mut past_end, 0x30, &u64::MAX.to_le_bytes());
        assert_eq!(GptTable::parse(&past_end, 512), None);

        // Entries past the buffer end the table instead of failing it
        let mut beyond = sample_gpt(512);
        rewrite_header(&mut beyond, 0x48, &0x10_0000u64.to_le_bytes());
        assert_eq!(GptTable::parse(&beyond, 512).map(|t| t.entries.len()), Some(0));
    }

    #[test]
    fn oversized_entries_saturate() {
        let mut data = sample_gpt(512);
        let base = 2 * 512;
        write_entry(&mut data[base..base + 0x80], &LINUX_DATA_GUID, 0x11, 0, u64::MAX, "boot");

        let table = GptTable::parse(&data, 512).unwrap();
        let boot = table.find("boot").unwrap();
        assert_eq!(boot.sector_count, u64::MAX);
        assert_eq!(table.span(boot), (0, u64::MAX));
    }

    #[test]
    fn parses_bpi() {
        let mut data = vec![0u8; 0x1000];
        data[0..4].copy_from_slice(BPI_MAGIC);
        write_entry(&mut data[0x800..0x880], &[0u8; 16], 0xAA, 0x0, 0x3FF, "preloader");
        write_entry(&mut data[0x880..0x900], &[0u8; 16], 0xBB, 0x400, 0x13FF, "nvram");

        let table = GptTable::parse(&data, 512).unwrap();
        assert_eq!(table.entries.len(), 2);
        assert_eq!(table.total_sectors, 0x13FF);
        assert_eq!(table.entries[1].sector_count, 0x1000);
        assert_eq!(table.entries[0].type_id, PartitionType::Bpi);
    }

    #[test]
    fn printable_table() {
        let table = GptTable::parse(&sample_gpt(512), 512).unwrap();
        let text = table.to_string();
        assert!(text.contains(
            "boot:                Offset 0x0000000000008000, Length 0x0000000000008000, Flags 0x00000001, UUID 11111111-1111-1111-1111-111111111111, Type EFI_LINUX_DATA"
        ));
        assert!(text.contains("Total disk size:0x0000000000201c00, sectors:0x0000000000001022"));
    }
}
