/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::pin::Pin;
use std::task::{Context, Poll};

use log::{error, info, warn};
use tokio::io::AsyncWrite;

use crate::connection::Connection;
use crate::connection::port::{ConnectionType, MTKPort};
use crate::core::chip::ChipConfig;
use crate::core::crypto::{CryptoIO, HwCrypto};
use crate::core::devinfo::{DevInfoData, DeviceInfo};
use crate::core::gpt::GptTable;
#[cfg(not(feature = "no_exploits"))]
use crate::core::seccfg::LockFlag;
use crate::core::sla::{SlaKeyring, SlaSigner};
use crate::core::storage::StorageInfo;
use crate::da::{BootMode, DAFile, DAProtocol, DAType, Xml, XmlOptions};
use crate::error::{Error, Result};

/// A builder for creating a new [`Device`].
///
/// Only the port is required. Without loader data, the device stays on the
/// preloader channel and only identity queries are available.
///
/// # Example
/// ```rust,ignore
/// use obscura::{DeviceBuilder, find_mtk_port};
///
/// let mtk_port = find_mtk_port().await.ok_or("No MTK port found")?;
/// let da_data = std::fs::read("path/to/da/file")?;
/// let device = DeviceBuilder::default().with_mtk_port(mtk_port).with_da_data(da_data).build()?;
/// ```
#[derive(Default)]
pub struct DeviceBuilder {
    mtk_port: Option<Box<dyn MTKPort>>,
    da_data: Option<Vec<u8>>,
    options: XmlOptions,
}

impl DeviceBuilder {
    /// Assigns the MTK port to be used for the device connection.
    pub fn with_mtk_port(mut self, port: Box<dyn MTKPort>) -> Self {
        self.mtk_port = Some(port);
        self
    }

    /// Assigns the loader container (`MTK_DA_v6`) to be used for the device.
    pub fn with_da_data(mut self, data: Vec<u8>) -> Self {
        self.da_data = Some(data);
        self
    }

    /// Extension payload loaded into DA2 once it runs.
    pub fn with_extension(mut self, data: Vec<u8>) -> Self {
        self.options.extension = Some(data);
        self
    }

    /// Preloader image, the OTP seed of the RPMB key is read from it.
    pub fn with_preloader(mut self, data: Vec<u8>) -> Self {
        self.options.preloader = Some(data);
        self
    }

    pub fn with_keyring(mut self, keyring: SlaKeyring) -> Self {
        self.options.keyring = keyring;
        self
    }

    pub fn with_signer(mut self, signer: Box<dyn SlaSigner>) -> Self {
        self.options.signer = signer;
        self
    }

    /// Backend deriving the RPMB key. Without one, RPMB writes are refused by the extension.
    pub fn with_crypto(mut self, crypto: Box<dyn HwCrypto>) -> Self {
        self.options.crypto = Some(crypto);
        self
    }

    pub fn with_chip_config(mut self, chip: ChipConfig) -> Self {
        self.options.chip = chip;
        self
    }

    /// Patch the loader even if the target doesn't enforce secure boot.
    pub fn with_patch(mut self, patch: bool) -> Self {
        self.options.patch = patch;
        self
    }

    /// Builds and returns a new `Device` instance.
    pub fn build(self) -> Result<Device> {
        let port = self
            .mtk_port
            .ok_or_else(|| Error::obscura("MTK port must be provided to build a Device."))?;

        Ok(Device {
            dev_info: DeviceInfo::new(),
            connection: Some(Connection::new(port)),
            protocol: None,
            connected: false,
            da_data: self.da_data,
            options: Some(self.options),
            table: None,
        })
    }
}

/// Represents a connected MTK device.
///
/// # Lifecycle
/// 1. Construct via [`DeviceBuilder`].
/// 2. Call [`Device::init`] to handshake with the device.
/// 3. Optionally call [`Device::enter_da_mode`]. Every flash operation enters it on demand.
/// 4. Read, write and erase partitions, RPMB or memory.
pub struct Device {
    /// Device information and metadata, shared with the protocol.
    pub dev_info: DeviceInfo,
    /// Preloader connection, `None` once the protocol owns it.
    connection: Option<Connection>,
    protocol: Option<Box<dyn DAProtocol + Send>>,
    connected: bool,
    da_data: Option<Vec<u8>>,
    /// Session options, handed to the protocol on init.
    options: Option<XmlOptions>,
    /// Partition table read when entering DA mode.
    table: Option<GptTable>,
}

impl Device {
    /// Performs the handshake and reads the device identity through the preloader.
    /// Must be called before any other operation.
    pub async fn init(&mut self) -> Result<()> {
        let mut conn = self
            .connection
            .take()
            .ok_or_else(|| Error::obscura("Connection is not initialized."))?;

        conn.handshake().await?;

        let soc_id = conn.get_soc_id().await?;
        let meid = conn.get_meid().await?;
        let hw_code = conn.get_hw_code().await?;
        let target_config = conn.get_target_config().await?;

        info!("[Obscura] Hardware code: 0x{hw_code:04X}, target config: 0x{target_config:X}");

        self.dev_info
            .set_data(DevInfoData {
                chipset: String::from("Unknown"),
                soc_id,
                meid,
                hw_code,
                partitions: vec![],
                storage: None,
                target_config,
            })
            .await;

        let Some(da_data) = &self.da_data else {
            self.connection = Some(conn);
            self.connected = true;
            return Ok(());
        };

        let da_file = DAFile::parse_da(da_data)?;
        let da = da_file.get_da_from_hw_code(hw_code).ok_or_else(|| {
            Error::obscura(format!("No compatible DA for hardware code 0x{hw_code:04X}"))
        })?;

        if da.da_type != DAType::V6 {
            self.connection = Some(conn);
            return Err(Error::obscura(format!("Unsupported DA type {:?}", da.da_type)));
        }

        let options = self.options.take().unwrap_or_default();
        self.protocol = Some(Box::new(Xml::new(conn, da, self.dev_info.clone(), options)));
        self.connected = true;

        Ok(())
    }

    /// Uploads the loader and reads the partition table into `dev_info`.
    pub async fn enter_da_mode(&mut self) -> Result<()> {
        if !self.connected {
            return Err(Error::conn("Device is not connected. Call init() first."));
        }

        let protocol = self.protocol.as_mut().ok_or_else(|| {
            Error::conn("DA protocol is not initialized. DA data might be missing.")
        })?;

        match protocol.upload_da().await {
            Ok(true) => info!("[Obscura] Successfully entered DA mode"),
            Ok(false) => warn!("DA2 didn't boot, going on with DA1 only"),
            Err(e) => return Err(Error::proto(format!("Failed to enter DA mode: {e}"))),
        }
        protocol.set_connection_type(ConnectionType::Da)?;

        let table = match protocol.get_gpt(None).await {
            Ok(Some(table)) => Some(table),
            Ok(None) => {
                warn!("No partition table on the user area, asking the loader");
                loader_table(&mut **protocol).await
            }
            Err(e) => {
                error!("Couldn't read the partition table: {e}");
                None
            }
        };

        let partitions = table.as_ref().map(|t| t.entries.clone()).unwrap_or_default();
        info!("[Obscura] {} partitions found", partitions.len());
        self.dev_info.set_partitions(partitions).await;
        self.table = table;

        Ok(())
    }

    async fn ensure_da_mode(&mut self) -> Result<&mut Box<dyn DAProtocol + Send>> {
        if !self.connected {
            return Err(Error::conn("Device is not connected. Call init() first."));
        }

        if self.get_connection()?.connection_type != ConnectionType::Da {
            info!("Not in DA mode, entering now...");
            self.enter_da_mode().await?;
        }

        self.protocol
            .as_mut()
            .ok_or_else(|| Error::conn("DA protocol is not initialized. DA data might be missing."))
    }

    /// Gets the active connection, the protocol's once it owns it.
    pub fn get_connection(&mut self) -> Result<&mut Connection> {
        match (&mut self.connection, &mut self.protocol) {
            (Some(conn), _) => Ok(conn),
            (None, Some(proto)) => Ok(proto.get_connection()),
            (None, None) => Err(Error::conn("No active connection available.")),
        }
    }

    pub fn get_protocol(&mut self) -> Option<&mut Box<dyn DAProtocol + Send>> {
        self.protocol.as_mut()
    }

    pub async fn get_storage(&mut self) -> Result<StorageInfo> {
        let protocol = self.ensure_da_mode().await?;
        protocol.get_storage().await.ok_or_else(|| Error::proto("Failed to get storage information."))
    }

    /// Reads the partition table of `part` (`None` for the user area).
    pub async fn get_gpt(&mut self, part: Option<&str>) -> Result<Option<GptTable>> {
        let protocol = self.ensure_da_mode().await?;
        protocol.get_gpt(part).await
    }

    /// Byte span of a named partition from the table read on entering DA mode.
    async fn partition_span(&mut self, name: &str) -> Result<(u64, u64)> {
        self.ensure_da_mode().await?;

        let table = self.table.as_ref().ok_or_else(|| Error::obscura("No partition table available"))?;
        let part = table.find(name).ok_or_else(|| Error::obscura(format!("Partition '{name}' not found")))?;

        Ok(table.span(part))
    }

    /// Streams a named partition of the user area into `writer`.
    pub async fn read_partition(
        &mut self,
        name: &str,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        let (offset, length) = self.partition_span(name).await?;
        self.read_offset(offset, length, None, writer, progress).await
    }

    pub async fn write_partition(
        &mut self,
        name: &str,
        data: &[u8],
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        let (offset, length) = self.partition_span(name).await?;
        if data.len() as u64 > length {
            return Err(Error::obscura(format!(
                "Data size 0x{:X} exceeds partition size 0x{length:X}",
                data.len()
            )));
        }

        let protocol = self.ensure_da_mode().await?;
        protocol.write_flash(offset, data.len() as u64, None, data, progress).await
    }

    pub async fn erase_partition(&mut self, name: &str) -> Result<()> {
        let (offset, length) = self.partition_span(name).await?;
        let protocol = self.ensure_da_mode().await?;
        protocol.erase_flash(offset, length, None).await
    }

    /// Reads `length` bytes at `address` of a physical partition (`user`, `boot1`,
    /// `lu3`...). The loader transfers at least 0x20000 bytes, the excess is dropped.
    pub async fn read_offset(
        &mut self,
        address: u64,
        length: u64,
        part: Option<&str>,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        let protocol = self.ensure_da_mode().await?;
        let mut limited = LimitedWriter::new(writer, length);
        protocol.read_flash(address, length, part, &mut limited, progress).await
    }

    pub async fn write_offset(
        &mut self,
        address: u64,
        data: &[u8],
        part: Option<&str>,
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        let protocol = self.ensure_da_mode().await?;
        protocol.write_flash(address, data.len() as u64, part, data, progress).await
    }

    pub async fn erase_offset(&mut self, address: u64, length: u64, part: Option<&str>) -> Result<()> {
        let protocol = self.ensure_da_mode().await?;
        protocol.erase_flash(address, length, part).await
    }

    /// Dumps the whole user area.
    pub async fn read_user_area(
        &mut self,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        let length = self.get_storage().await?.flash_size();
        self.read_offset(0, length, None, writer, progress).await
    }

    #[cfg(not(feature = "no_exploits"))]
    pub async fn read_rpmb(
        &mut self,
        sector: u32,
        count: Option<u32>,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        let protocol = self.ensure_da_mode().await?;
        protocol.read_rpmb(sector, count, writer, progress).await
    }

    #[cfg(not(feature = "no_exploits"))]
    pub async fn write_rpmb(
        &mut self,
        sector: u32,
        data: &[u8],
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        let protocol = self.ensure_da_mode().await?;
        protocol.write_rpmb(sector, data, progress).await
    }

    #[cfg(not(feature = "no_exploits"))]
    pub async fn erase_rpmb(
        &mut self,
        sector: u32,
        count: Option<u32>,
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        let protocol = self.ensure_da_mode().await?;
        protocol.erase_rpmb(sector, count, progress).await
    }

    /// Streams device memory through the loader extension.
    #[cfg(not(feature = "no_exploits"))]
    pub async fn peek(
        &mut self,
        addr: u32,
        length: usize,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        let protocol = self.ensure_da_mode().await?;
        protocol.peek(addr, length, writer, progress).await
    }

    /// Locks or unlocks the bootloader by rewriting `seccfg`. Needs a crypto engine
    /// able to handle the seccfg hash of this SoC.
    #[cfg(not(feature = "no_exploits"))]
    pub async fn set_seccfg_lock_state(
        &mut self,
        flag: LockFlag,
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<Vec<u8>> {
        let protocol = self.ensure_da_mode().await?;
        protocol.set_seccfg_lock_state(flag, progress).await
    }

    /// Reads efuse words, `offsets` counted from the efuse base of the chip config.
    #[cfg(not(feature = "no_exploits"))]
    pub async fn read_fuses(&mut self, offsets: &[u32]) -> Result<Vec<u32>> {
        let protocol = self.ensure_da_mode().await?;
        let mut words = Vec::with_capacity(offsets.len());
        for offset in offsets {
            words.push(protocol.read_fuse(*offset).await?);
        }
        Ok(words)
    }

    #[cfg(not(feature = "no_exploits"))]
    pub async fn read_pubk(&mut self) -> Result<Vec<u8>> {
        let protocol = self.ensure_da_mode().await?;
        protocol.read_pubk().await
    }

    pub async fn reboot(&mut self, mode: BootMode) -> Result<bool> {
        let protocol = self.ensure_da_mode().await?;
        protocol.shutdown(mode, false).await
    }

    /// Releases the device and lets it power off.
    pub async fn shutdown(&mut self) -> Result<bool> {
        let protocol = self.ensure_da_mode().await?;
        protocol.shutdown(BootMode::Normal, true).await
    }
}

/// Loader kept partition list, used when the user area holds no table.
async fn loader_table(protocol: &mut (dyn DAProtocol + Send)) -> Option<GptTable> {
    let sector_size = protocol.get_storage().await?.sector_size();
    match protocol.read_partition_table().await {
        Ok(entries) if !entries.is_empty() => {
            Some(GptTable { sector_size, total_sectors: 0, first_usable_lba: 0, entries })
        }
        Ok(_) => None,
        Err(e) => {
            error!("Couldn't read the loader partition table: {e}");
            None
        }
    }
}

#[async_trait::async_trait]
impl CryptoIO for Device {
    async fn read32(&mut self, addr: u32) -> u32 {
        let Some(protocol) = self.get_protocol() else {
            error!("No protocol available for read32 at 0x{:08X}!", addr);
            return 0;
        };

        match protocol.read32(addr).await {
            Ok(val) => val,
            Err(e) => {
                error!("Failed to read32 from protocol at 0x{:08X}: {}", addr, e);
                0
            }
        }
    }

    async fn write32(&mut self, addr: u32, val: u32) {
        let Some(protocol) = self.get_protocol() else {
            error!("No protocol available for write32 at 0x{:08X}!", addr);
            return;
        };

        if let Err(e) = protocol.write32(addr, val).await {
            error!("Failed to write32 to protocol at 0x{:08X}: {}", addr, e);
        }
    }
}

/// Passes the first `remaining` bytes through and swallows the rest.
struct LimitedWriter<'a> {
    inner: &'a mut (dyn AsyncWrite + Unpin + Send),
    remaining: u64,
}

impl<'a> LimitedWriter<'a> {
    fn new(inner: &'a mut (dyn AsyncWrite + Unpin + Send), limit: u64) -> Self {
        LimitedWriter { inner, remaining: limit }
    }
}

impl AsyncWrite for LimitedWriter<'_> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        if self.remaining == 0 {
            return Poll::Ready(Ok(buf.len()));
        }

        let take = buf.len().min(self.remaining as usize);
        match Pin::new(&mut *self.inner).poll_write(cx, &buf[..take]) {
            Poll::Ready(Ok(n)) => {
                self.remaining -= n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}
