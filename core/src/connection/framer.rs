/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use log::{debug, error};

use crate::connection::Connection;
use crate::le_u32;

/// Magic opening every frame exchanged with the XML loader.
pub const MAGIC: u32 = 0xFEEEEEEF;
/// Data type of every frame. The loader never uses anything else.
pub const DT_PROTOCOL_FLOW: u32 = 0x1;
pub const HEADER_LEN: usize = 12;

/// What can be carried in a frame.
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    U32(u32),
    U64(u64),
    /// Sent as UTF-8 followed by a NUL.
    Text(&'a str),
    Bytes(&'a [u8]),
}

impl Payload<'_> {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Payload::U32(v) => v.to_le_bytes().to_vec(),
            Payload::U64(v) => v.to_le_bytes().to_vec(),
            Payload::Text(s) => {
                let mut out = Vec::with_capacity(s.len() + 1);
                out.extend_from_slice(s.as_bytes());
                out.push(0);
                out
            }
            Payload::Bytes(b) => b.to_vec(),
        }
    }
}

pub fn encode_header(length: usize) -> [u8; HEADER_LEN] {
    let mut hdr = [0u8; HEADER_LEN];

    // efeeeefe | 01000000 | <length>
    hdr[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    hdr[4..8].copy_from_slice(&DT_PROTOCOL_FLOW.to_le_bytes());
    hdr[8..12].copy_from_slice(&(length as u32).to_le_bytes());
    hdr
}

/// Returns the payload length announced by a header, `None` if the magic is wrong.
pub fn decode_header(hdr: &[u8; HEADER_LEN]) -> Option<usize> {
    if le_u32!(hdr, 0) != MAGIC {
        return None;
    }
    Some(le_u32!(hdr, 8) as usize)
}

impl Connection {
    /// Frames and writes a payload. Transport failures are logged and reported as `false`.
    pub async fn send(&mut self, payload: Payload<'_>) -> bool {
        let data = payload.encode();
        let hdr = encode_header(data.len());
        debug!("[TX] Header: {:02X?}, Length: 0x{:X}", hdr, data.len());

        if let Err(e) = self.port.write_all(&hdr).await {
            error!("[TX] Failed to write header: {e}");
            return false;
        }

        let chunk_size = self.write_chunk_size.max(1);
        for chunk in data.chunks(chunk_size) {
            if let Err(e) = self.port.write_all(chunk).await {
                error!("[TX] Failed to write 0x{:X} bytes: {e}", chunk.len());
                return false;
            }
        }

        true
    }

    /// Reads one frame and returns its payload untouched.
    /// A short read or a bad magic yields an empty buffer.
    pub async fn receive(&mut self) -> Vec<u8> {
        let mut hdr = [0u8; HEADER_LEN];
        if let Err(e) = self.port.read_exact(&mut hdr).await {
            error!("[RX] Failed to read header: {e}");
            return Vec::new();
        }

        let Some(len) = decode_header(&hdr) else {
            error!("[RX] Wrong magic in header: {:02X?}", hdr);
            return Vec::new();
        };
        debug!("[RX] Length from header: 0x{:X}", len);

        let mut data = vec![0u8; len];
        if let Err(e) = self.port.read_exact(&mut data).await {
            error!("[RX] Short read of 0x{:X} bytes: {e}", len);
            return Vec::new();
        }

        data
    }

    /// Reads one frame as text, without the terminating NUL.
    pub async fn receive_text(&mut self) -> String {
        let data = self.receive().await;
        let text = String::from_utf8_lossy(&data);
        text.strip_suffix('\0').unwrap_or(&text).to_string()
    }
}
