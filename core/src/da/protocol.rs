/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::AsyncWrite;

use crate::connection::Connection;
use crate::connection::port::ConnectionType;
use crate::core::devinfo::DeviceInfo;
use crate::core::gpt::{GptTable, PartitionEntry};
#[cfg(not(feature = "no_exploits"))]
use crate::core::seccfg::LockFlag;
use crate::core::storage::StorageInfo;
use crate::error::Result;

/// What the device should do once the loader lets it go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum BootMode {
    Normal = 0,
    HomeScreen = 1,
    Fastboot = 2,
    Test = 3,
    Meta = 4,
}

impl BootMode {
    /// Mode string for `SET-BOOT-MODE`. Normal and HomeScreen reboot without one.
    pub fn boot_mode_arg(&self) -> Option<&'static str> {
        match self {
            BootMode::Fastboot => Some("FASTBOOT"),
            BootMode::Test => Some("ANDROID-TEST-MODE"),
            BootMode::Meta => Some("META"),
            BootMode::Normal | BootMode::HomeScreen => None,
        }
    }
}

#[async_trait::async_trait]
pub trait DAProtocol: Send {
    // Main helpers
    async fn upload_da(&mut self) -> Result<bool>;
    async fn boot_to(&mut self, addr: u32, data: &[u8]) -> Result<bool>;

    // FLASH operations
    /// `part` is a logical partition name (`user`, `boot1`, `lu3`...), `None` for the user area.
    async fn read_flash(
        &mut self,
        addr: u64,
        length: u64,
        part: Option<&str>,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()>;

    async fn write_flash(
        &mut self,
        addr: u64,
        length: u64,
        part: Option<&str>,
        data: &[u8],
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()>;

    async fn erase_flash(&mut self, addr: u64, length: u64, part: Option<&str>) -> Result<()>;

    async fn get_gpt(&mut self, part: Option<&str>) -> Result<Option<GptTable>>;
    async fn read_partition_table(&mut self) -> Result<Vec<PartitionEntry>>;

    async fn shutdown(&mut self, mode: BootMode, disconnect: bool) -> Result<bool>;

    // Memory
    async fn read32(&mut self, addr: u32) -> Result<u32>;
    async fn write32(&mut self, addr: u32, value: u32) -> Result<()>;

    #[cfg(not(feature = "no_exploits"))]
    async fn peek(
        &mut self,
        addr: u32,
        length: usize,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()>;

    // RPMB, through the loader extension
    #[cfg(not(feature = "no_exploits"))]
    async fn read_rpmb(
        &mut self,
        sector: u32,
        count: Option<u32>,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()>;

    #[cfg(not(feature = "no_exploits"))]
    async fn write_rpmb(
        &mut self,
        sector: u32,
        data: &[u8],
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()>;

    #[cfg(not(feature = "no_exploits"))]
    async fn erase_rpmb(
        &mut self,
        sector: u32,
        count: Option<u32>,
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()>;

    // Security settings
    /// Switches the seccfg lock state, returning the image written.
    #[cfg(not(feature = "no_exploits"))]
    async fn set_seccfg_lock_state(
        &mut self,
        flag: LockFlag,
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<Vec<u8>>;

    /// Efuse word at `offset` from the SoC efuse base.
    #[cfg(not(feature = "no_exploits"))]
    async fn read_fuse(&mut self, offset: u32) -> Result<u32>;

    #[cfg(not(feature = "no_exploits"))]
    async fn read_pubk(&mut self) -> Result<Vec<u8>>;

    // Connection
    fn get_connection(&mut self) -> &mut Connection;
    fn set_connection_type(&mut self, conn_type: ConnectionType) -> Result<()>;

    async fn get_storage(&mut self) -> Option<StorageInfo>;

    // DevInfo helpers
    fn get_devinfo(&self) -> &DeviceInfo;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_modes() {
        assert_eq!(BootMode::try_from(2u8), Ok(BootMode::Fastboot));
        assert!(BootMode::try_from(9u8).is_err());
        assert_eq!(u8::from(BootMode::Meta), 4);

        assert_eq!(BootMode::Test.boot_mode_arg(), Some("ANDROID-TEST-MODE"));
        assert_eq!(BootMode::HomeScreen.boot_mode_arg(), None);
    }
}
