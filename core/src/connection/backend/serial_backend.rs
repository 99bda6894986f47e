/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serialport::{SerialPortType, available_ports};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::connection::port::{ConnectionType, MTKPort, connection_type_for};
use crate::error::{Error, Result};

const DEFAULT_BAUDRATE: u32 = 115200;
const MAX_TIMEOUT: Duration = Duration::from_secs(2);

pub struct SerialMTKPort {
    port_name: String,
    baudrate: u32,
    connection_type: ConnectionType,
    stream: Option<SerialStream>,
}

impl fmt::Debug for SerialMTKPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerialMTKPort {{ port_name: {}, baudrate: {}, connection_type: {:?}, is_open: {} }}",
            self.port_name,
            self.baudrate,
            self.connection_type,
            self.stream.is_some()
        )
    }
}

impl SerialMTKPort {
    pub fn new(port_name: String, baudrate: u32, connection_type: ConnectionType) -> Self {
        Self { port_name, baudrate, connection_type, stream: None }
    }

    fn stream(&mut self) -> Result<&mut SerialStream> {
        self.stream.as_mut().ok_or_else(|| Error::io("Serial port is not open"))
    }
}

#[async_trait]
impl MTKPort for SerialMTKPort {
    async fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let stream = tokio_serial::new(&self.port_name, self.baudrate)
            .timeout(MAX_TIMEOUT)
            .open_native_async()
            .map_err(std::io::Error::from)?;

        debug!("Opened serial port {}", self.port_name);
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stream = None;
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stream = self.stream()?;
        stream.read_exact(buf).await?;
        Ok(buf.len())
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let stream = self.stream()?;
        stream.write_all(buf).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.stream()?.flush().await?;
        Ok(())
    }

    async fn handshake(&mut self) -> Result<()> {
        let mut resp = [0u8; 1];

        loop {
            self.write_all(&[0xA0]).await?;
            self.read_exact(&mut resp).await?;

            if resp[0] == 0x5F {
                break;
            }

            // Already handshaken, the preloader just echoes
            if resp[0] == 0xA0 {
                return Ok(());
            }
        }

        const SEQ: [u8; 3] = [0x0A, 0x50, 0x05];

        for &byte in &SEQ {
            self.write_all(&[byte]).await?;
            self.read_exact(&mut resp).await?;

            if resp[0] != (byte ^ 0xFF) {
                return Err(Error::conn(format!(
                    "Handshake failed: sent 0x{:02X}, expected 0x{:02X}, got 0x{:02X}",
                    byte,
                    byte ^ 0xFF,
                    resp[0]
                )));
            }
        }

        Ok(())
    }

    fn get_connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    fn get_baudrate(&self) -> u32 {
        self.baudrate
    }

    fn get_port_name(&self) -> String {
        self.port_name.clone()
    }

    async fn find_device() -> Result<Option<Self>> {
        let ports = available_ports().map_err(std::io::Error::from)?;

        for port in ports {
            let SerialPortType::UsbPort(usb) = &port.port_type else {
                continue;
            };

            if let Some(conn_type) = connection_type_for(usb.vid, usb.pid) {
                debug!("Found {:?} port at {}", conn_type, port.port_name);
                return Ok(Some(SerialMTKPort::new(port.port_name, DEFAULT_BAUDRATE, conn_type)));
            }
        }

        Ok(None)
    }
}
