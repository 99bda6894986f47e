/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::fmt::Debug;

use async_trait::async_trait;
use downcast_rs::{DowncastSync, impl_downcast};

#[cfg(feature = "serial")]
use crate::connection::backend::SerialMTKPort;
use crate::error::Result;

pub const MTK_VID: u16 = 0x0E8D;
pub const BROM_PID: u16 = 0x0003;
pub const PRELOADER_PID: u16 = 0x2000;
pub const DA_PID: u16 = 0x2001;

/// Known MediaTek USB identities and the mode they expose.
pub const KNOWN_PORTS: &[(u16, u16, ConnectionType)] = &[
    (MTK_VID, BROM_PID, ConnectionType::Brom),
    (MTK_VID, PRELOADER_PID, ConnectionType::Preloader),
    (MTK_VID, DA_PID, ConnectionType::Da),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Brom,
    Preloader,
    Da,
}

/// Byte stream to a MediaTek device.
///
/// Reads and writes are always of a known length: a read blocks until the
/// whole buffer is filled.
#[async_trait]
pub trait MTKPort: DowncastSync + Debug {
    async fn open(&mut self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<usize>;
    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;
    async fn flush(&mut self) -> Result<()>;
    async fn handshake(&mut self) -> Result<()>;

    fn get_connection_type(&self) -> ConnectionType;
    fn get_baudrate(&self) -> u32;
    fn get_port_name(&self) -> String;

    async fn find_device() -> Result<Option<Self>>
    where
        Self: Sized;
}
impl_downcast!(sync MTKPort);

/// Looks for the first MediaTek port available on the host.
pub async fn find_mtk_port() -> Option<Box<dyn MTKPort>> {
    #[cfg(feature = "serial")]
    if let Ok(Some(port)) = SerialMTKPort::find_device().await {
        return Some(Box::new(port));
    }

    None
}

pub fn connection_type_for(vid: u16, pid: u16) -> Option<ConnectionType> {
    KNOWN_PORTS.iter().find(|(v, p, _)| *v == vid && *p == pid).map(|(_, _, t)| *t)
}
