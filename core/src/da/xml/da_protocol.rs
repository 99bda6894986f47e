/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use async_trait::async_trait;
use log::{error, info, warn};
use tokio::io::AsyncWrite;

use crate::connection::Connection;
use crate::connection::port::ConnectionType;
use crate::core::devinfo::DeviceInfo;
use crate::core::gpt::{GptTable, PartitionEntry};
use crate::core::storage::StorageInfo;
use crate::da::protocol::{BootMode, DAProtocol};
use crate::da::xml::Xml;
use crate::da::xml::result::CommandResult;
#[cfg(not(feature = "no_exploits"))]
use crate::da::xml::exts;
#[cfg(not(feature = "no_exploits"))]
use crate::core::seccfg::LockFlag;
#[cfg(not(feature = "no_exploits"))]
use crate::da::xml::rpmb::RpmbEngine;
#[cfg(not(feature = "no_exploits"))]
use crate::da::xml::sec;
use crate::da::xml::{flash, sla, storage};
use crate::error::{Error, Result};

impl Xml {
    /// Best effort steps once DA2 runs. None of them is fatal to the session.
    async fn setup_da2(&mut self) {
        if let Err(e) = self.setup_hw_init().await {
            warn!("DA2 hardware init failed: {e}");
        }

        match sla::change_usb_speed(self).await {
            Ok(true) => info!("[Obscura] USB speed raised"),
            Ok(false) => {}
            Err(e) => warn!("Couldn't change USB speed: {e}"),
        }

        match sla::check_sla(self).await {
            Ok(Some(true)) => {
                info!("[Obscura] SLA is enabled");
                if let Err(e) = sla::authenticate(self).await {
                    error!("SLA authentication failed: {e}");
                }
            }
            Ok(Some(false)) => info!("[Obscura] SLA is disabled"),
            Ok(None) => {}
            Err(e) => warn!("Couldn't query DA.SLA: {e}"),
        }
    }
}

#[async_trait]
impl DAProtocol for Xml {
    /// Boots DA1 through the preloader, then DA2 on top of it.
    ///
    /// Only a DA1 failure is an error. `Ok(false)` means DA2 didn't come up, the
    /// session then stays on DA1 with the patch path turned off.
    async fn upload_da(&mut self) -> Result<bool> {
        self.using_exts = false;

        self.upload_da1()
            .await
            .map_err(|e| Error::proto(format!("Failed to upload XML DA1: {e}")))?;
        info!("[Obscura] Stage 1 successfully loaded");

        let da2addr = self.da.get_da2().ok_or_else(|| Error::obscura("DA2 region not found"))?.addr;
        let da2 = self.da2.clone();

        info!("[Obscura] Uploading and booting to XML DA2...");
        let loaded = match self.boot_to(da2addr, &da2).await {
            Ok(loaded) => loaded,
            Err(e) => {
                error!("Failed to boot DA2: {e}");
                false
            }
        };

        if loaded {
            info!("[Obscura] Successfully uploaded stage 2");
            self.setup_da2().await;
        } else {
            self.patch = false;
        }

        if let Err(e) = storage::reinit(self).await {
            warn!("Couldn't read the storage geometry: {e}");
        }
        match storage::check_lifecycle(self).await {
            Ok(true) => {}
            Ok(false) => warn!("Storage lifecycle check didn't pass"),
            Err(e) => warn!("Couldn't check the storage lifecycle: {e}"),
        }

        #[cfg(not(feature = "no_exploits"))]
        {
            if loaded && self.patch && !self.using_exts {
                match exts::boot_extensions(self).await {
                    Ok(true) => info!("[Obscura] DA XML extensions successfully loaded"),
                    Ok(false) => {}
                    Err(e) => warn!("DA XML extensions failed: {e}"),
                }
            }
        }

        Ok(loaded)
    }

    /// Uploads `data` to `addr` and jumps there. `false` when the loader
    /// doesn't ask for the image.
    async fn boot_to(&mut self, addr: u32, data: &[u8]) -> Result<bool> {
        let result = xmlcmd!(self, BootTo, addr as u64, addr as u64, 0, data.len() as u64).await?;
        let CommandResult::Download(req) = result else {
            error!("BOOT-TO answered with {result:?}");
            return Ok(false);
        };

        let mut progress = |_, _| {};
        self.upload(&req, data, false, &mut progress).await?;
        Ok(true)
    }

    async fn read_flash(
        &mut self,
        addr: u64,
        length: u64,
        part: Option<&str>,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        flash::read_flash(self, addr, length, part, writer, progress).await
    }

    async fn write_flash(
        &mut self,
        addr: u64,
        length: u64,
        part: Option<&str>,
        data: &[u8],
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        flash::write_flash(self, addr, length, part, data, progress).await
    }

    async fn erase_flash(&mut self, addr: u64, length: u64, part: Option<&str>) -> Result<()> {
        flash::erase_flash(self, addr, length, part).await
    }

    async fn get_gpt(&mut self, part: Option<&str>) -> Result<Option<GptTable>> {
        storage::get_gpt(self, part).await
    }

    async fn read_partition_table(&mut self) -> Result<Vec<PartitionEntry>> {
        storage::read_partition_table(self).await
    }

    async fn shutdown(&mut self, mode: BootMode, disconnect: bool) -> Result<bool> {
        if let Some(arg) = mode.boot_mode_arg() {
            xmlcmd!(
                self,
                SetBootMode,
                arg.to_string(),
                "USB".to_string(),
                "OFF".to_string(),
                "OFF".to_string()
            )
            .await?;
        }

        let action = if disconnect { "DISCONNECT" } else { "IMMEDIATE" };
        match xmlcmd!(self, Reboot, action.to_string()).await {
            Ok(_) => {
                info!("[Obscura] Device released ({mode:?})");
                Ok(true)
            }
            Err(e) => {
                error!("Error on sending reboot: {e}");
                Ok(false)
            }
        }
    }

    async fn read32(&mut self, addr: u32) -> Result<u32> {
        #[cfg(not(feature = "no_exploits"))]
        {
            if self.using_exts {
                return exts::custom_read_register(self, addr).await;
            }
        }
        self.read_register(addr).await
    }

    async fn write32(&mut self, addr: u32, value: u32) -> Result<()> {
        #[cfg(not(feature = "no_exploits"))]
        {
            if self.using_exts {
                return exts::custom_write_register(self, addr, value).await;
            }
        }
        self.write_register(addr, &value.to_le_bytes()).await
    }

    #[cfg(not(feature = "no_exploits"))]
    async fn peek(
        &mut self,
        addr: u32,
        length: usize,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        exts::peek(self, addr, length, writer, progress).await
    }

    #[cfg(not(feature = "no_exploits"))]
    async fn read_rpmb(
        &mut self,
        sector: u32,
        count: Option<u32>,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        let storage = self.get_or_reinit_storage().await?;
        RpmbEngine::for_storage(&storage)?.read(self, sector, count, writer, progress).await
    }

    #[cfg(not(feature = "no_exploits"))]
    async fn write_rpmb(
        &mut self,
        sector: u32,
        data: &[u8],
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        let storage = self.get_or_reinit_storage().await?;
        RpmbEngine::for_storage(&storage)?.write(self, sector, data, progress).await
    }

    #[cfg(not(feature = "no_exploits"))]
    async fn erase_rpmb(
        &mut self,
        sector: u32,
        count: Option<u32>,
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        let storage = self.get_or_reinit_storage().await?;
        RpmbEngine::for_storage(&storage)?.erase(self, sector, count, progress).await
    }

    #[cfg(not(feature = "no_exploits"))]
    async fn set_seccfg_lock_state(
        &mut self,
        flag: LockFlag,
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<Vec<u8>> {
        sec::set_lock_state(self, flag, progress).await
    }

    #[cfg(not(feature = "no_exploits"))]
    async fn read_fuse(&mut self, offset: u32) -> Result<u32> {
        sec::read_fuse(self, offset).await
    }

    #[cfg(not(feature = "no_exploits"))]
    async fn read_pubk(&mut self) -> Result<Vec<u8>> {
        sec::read_pubk(self).await
    }

    fn get_connection(&mut self) -> &mut Connection {
        &mut self.conn
    }

    fn set_connection_type(&mut self, conn_type: ConnectionType) -> Result<()> {
        self.conn.connection_type = conn_type;
        Ok(())
    }

    async fn get_storage(&mut self) -> Option<StorageInfo> {
        self.get_or_reinit_storage().await.ok()
    }

    fn get_devinfo(&self) -> &DeviceInfo {
        &self.dev_info
    }
}
