/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use log::{debug, info, warn};
use tokio::io::AsyncWrite;

use crate::core::storage::{FlashTarget, StorageType};
use crate::da::xml::Xml;
use crate::da::xml::result::CommandResult;
use crate::error::{Error, Result};

/// Flash writes are sent in whole 512 byte blocks.
const WRITE_ALIGN: u64 = 512;

/// Resolves a logical partition against the current storage. With no name,
/// the user area of the storage is used.
async fn resolve(xml: &mut Xml, part: Option<&str>, length: u64) -> Result<FlashTarget> {
    let storage = xml.get_or_reinit_storage().await?;

    let part = part.or(match storage.kind() {
        StorageType::Emmc => Some("user"),
        StorageType::Ufs => Some("lu3"),
        _ => None,
    });

    storage
        .resolve_partition(part, length)
        .ok_or_else(|| Error::obscura(format!("Unknown partition '{}'", part.unwrap_or_default())))
}

pub async fn read_flash(
    xml: &mut Xml,
    addr: u64,
    length: u64,
    part: Option<&str>,
    writer: &mut (dyn AsyncWrite + Unpin + Send),
    progress: &mut (dyn FnMut(usize, usize) + Send),
) -> Result<()> {
    let target = resolve(xml, part, length).await?;
    info!(
        "Reading flash at address {:#X} with size {:#X} from {}",
        addr, target.length, target.partition
    );

    xmlcmd_noack!(xml, ReadFlash, target.partition.to_string(), addr, target.length).await?;

    let CommandResult::Upload(req) = xml.get_command_result().await? else {
        return Err(Error::proto("READ-FLASH was not followed by CMD:UPLOAD-FILE"));
    };
    let read = xml.download_raw(&req, writer, progress).await?;
    debug!("Read 0x{read:X} bytes");

    if !xml.get_command_result().await?.is_start() {
        return Err(Error::proto("Missing CMD:START after READ-FLASH"));
    }

    Ok(())
}

/// Reads into memory. The loader never transfers less than the minimum flash
/// length, so the buffer may be longer than requested.
pub async fn read_to_vec(xml: &mut Xml, addr: u64, length: u64, part: Option<&str>) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(length as usize);
    let mut progress = |_, _| {};
    read_flash(xml, addr, length, part, &mut data, &mut progress).await?;
    Ok(data)
}

pub async fn write_flash(
    xml: &mut Xml,
    addr: u64,
    length: u64,
    part: Option<&str>,
    data: &[u8],
    progress: &mut (dyn FnMut(usize, usize) + Send),
) -> Result<()> {
    let mut length = length.min(data.len() as u64).next_multiple_of(WRITE_ALIGN);

    let target = resolve(xml, part, length).await?;
    if target.length < length {
        warn!(
            "{} only holds 0x{:X} bytes, truncating the 0x{:X} byte write",
            target.partition, target.length, length
        );
        length = target.length;
    }

    let used = length.min(data.len() as u64);
    let mut buf = data[..used as usize].to_vec();
    buf.resize(length as usize, 0);
    info!("Writing flash at address {:#X} with size {:#X} to {}", addr, length, target.partition);

    xmlcmd_noack!(xml, WriteFlash, target.partition.to_string(), addr, length).await?;

    match xml.get_command_result().await? {
        CommandResult::FileSys(op) if op.key == "FILE-SIZE" => {}
        other => {
            return Err(Error::proto(format!("Expected a FILE-SIZE query, got {other:?}")));
        }
    }
    xml.ack_value(length as usize).await?;

    let CommandResult::Download(req) = xml.get_command_result().await? else {
        return Err(Error::proto("WRITE-FLASH was not followed by CMD:DOWNLOAD-FILE"));
    };
    xml.upload(&req, &buf, true, progress).await
}

pub async fn erase_flash(xml: &mut Xml, addr: u64, length: u64, part: Option<&str>) -> Result<()> {
    let target = resolve(xml, part, length).await?;
    info!(
        "Formatting addr {:#X} with length {:#X} on {}, please standby...",
        addr, target.length, target.partition
    );

    xmlcmd!(xml, EraseFlash, target.partition.to_string(), addr, target.length).await?;

    info!("Successfully formatted addr {:#X}", addr);
    Ok(())
}
