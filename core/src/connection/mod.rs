/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
mod backend;
mod command;
pub mod framer;
#[cfg(test)]
pub mod mock;
pub mod port;
use std::time::Duration;

use log::{debug, error, info};
use tokio::time::timeout;

#[cfg(feature = "serial")]
pub use crate::connection::backend::SerialMTKPort;
use crate::connection::command::Command;
pub use crate::connection::framer::Payload;
use crate::connection::port::{ConnectionType, MTKPort};
use crate::error::{Error, Result};

/// Size of the chunks used for large frames until the loader tells us otherwise.
pub const DEFAULT_WRITE_CHUNK: usize = 0x8000;

#[derive(Debug)]
pub struct Connection {
    pub port: Box<dyn MTKPort>,
    pub connection_type: ConnectionType,
    pub baudrate: u32,
    pub write_chunk_size: usize,
}

impl Connection {
    pub fn new(port: Box<dyn MTKPort>) -> Self {
        let connection_type = port.get_connection_type();
        let baudrate = port.get_baudrate();

        Connection { port, connection_type, baudrate, write_chunk_size: DEFAULT_WRITE_CHUNK }
    }

    pub fn check(&self, data: &[u8], expected_data: &[u8]) -> Result<()> {
        if data == expected_data {
            Ok(())
        } else {
            error!("Data mismatch. Expected: {:x?}, Got: {:x?}", expected_data, data);
            Err(Error::conn("Data mismatch"))
        }
    }

    pub async fn echo(&mut self, data: &[u8], size: usize) -> Result<()> {
        self.port.write_all(data).await?;
        let mut buf = vec![0u8; size];
        self.port.read_exact(&mut buf).await?;
        self.check(&buf, data)
    }

    async fn read_status(&mut self) -> Result<u16> {
        let mut status = [0u8; 2];
        self.port.read_exact(&mut status).await?;
        Ok(u16::from_le_bytes(status))
    }

    pub async fn handshake(&mut self) -> Result<()> {
        info!("Starting handshake...");
        self.port.handshake().await?;
        info!("Handshake completed!");
        Ok(())
    }

    pub async fn jump_da(&mut self, address: u32) -> Result<()> {
        debug!("Jump to DA at 0x{:08X}", address);

        self.echo(&[Command::JumpDa as u8], 1).await?;
        self.echo(&address.to_le_bytes(), 4).await?;

        let status = self.read_status().await?;
        if status != 0 {
            error!("JumpDA failed with status: {:04X}", status);
            return Err(Error::conn("JumpDA failed"));
        }

        Ok(())
    }

    pub async fn send_da(
        &mut self,
        da_data: &[u8],
        da_len: u32,
        address: u32,
        sig_len: u32,
    ) -> Result<()> {
        debug!("Sending DA, size: {}", da_data.len());
        self.echo(&[Command::SendDa as u8], 1).await?;
        self.echo(&address.to_be_bytes(), 4).await?;
        self.echo(&da_len.to_be_bytes(), 4).await?;
        self.echo(&sig_len.to_be_bytes(), 4).await?;

        let mut status = [0u8; 2];
        self.port.read_exact(&mut status).await?;
        let status_val = u16::from_be_bytes(status);
        if status_val != 0 {
            error!("SendDA command failed with status: {:04X}", status_val);
            return Err(Error::conn("SendDA command failed"));
        }

        self.port.write_all(da_data).await?;

        let mut checksum = [0u8; 2];
        self.port.read_exact(&mut checksum).await?;
        debug!("Received checksum: {:02X}{:02X}", checksum[0], checksum[1]);

        self.port.read_exact(&mut status).await?;
        let status_val = u16::from_be_bytes(status);
        if status_val != 0 {
            error!("SendDA data transfer failed with status: {:04X}", status_val);
            return Err(Error::conn("SendDA data transfer failed"));
        }

        debug!("DA sent!");
        Ok(())
    }

    pub async fn get_hw_code(&mut self) -> Result<u16> {
        self.echo(&[Command::GetHwCode as u8], 1).await?;

        let mut hw_code = [0u8; 2];
        self.port.read_exact(&mut hw_code).await?;

        let status = self.read_status().await?;
        if status != 0 {
            error!("GetHwCode failed with status: {:04X}", status);
            return Err(Error::conn("GetHwCode failed"));
        }

        Ok(u16::from_be_bytes(hw_code))
    }

    /// Reads a length prefixed identifier (SocId, MEID).
    /// Older preloaders don't answer at all, which yields an empty vector.
    async fn get_id(&mut self, cmd: Command) -> Result<Vec<u8>> {
        self.echo(&[cmd as u8], 1).await?;

        let mut length_bytes = [0u8; 4];
        match timeout(Duration::from_millis(500), self.port.read_exact(&mut length_bytes)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(vec![]),
        }

        let length = u32::from_be_bytes(length_bytes) as usize;
        let mut id = vec![0u8; length];
        self.port.read_exact(&mut id).await?;

        let status = self.read_status().await?;
        if status != 0 {
            error!("{:?} failed with status: 0x{:04X}", cmd, status);
            return Err(Error::conn(format!("{cmd:?} failed")));
        }

        Ok(id)
    }

    pub async fn get_soc_id(&mut self) -> Result<Vec<u8>> {
        self.get_id(Command::GetSocId).await
    }

    pub async fn get_meid(&mut self) -> Result<Vec<u8>> {
        self.get_id(Command::GetMeId).await
    }

    /// Returns the target configuration of the device.
    /// This configuration can be interpreted as follows:
    ///
    /// SBC = target_config & 0x1
    /// SLA = target_config & 0x2
    /// DAA = target_config & 0x4
    pub async fn get_target_config(&mut self) -> Result<u32> {
        self.echo(&[Command::GetTargetConfig as u8], 1).await?;

        let mut config_bytes = [0u8; 4];
        self.port.read_exact(&mut config_bytes).await?;

        let status = self.read_status().await?;
        if status != 0 {
            error!("GetTargetConfig failed with status: 0x{:04X}", status);
            return Err(Error::conn("GetTargetConfig failed"));
        }

        Ok(u32::from_be_bytes(config_bytes))
    }
}
