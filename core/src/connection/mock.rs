/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! In-memory port replaying scripted device output, for tests.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::connection::framer::{HEADER_LEN, Payload, decode_header, encode_header};
use crate::connection::port::{ConnectionType, MTKPort};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Script {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    fail_writes: bool,
}

#[derive(Debug)]
pub struct ScriptedPort {
    script: Arc<Mutex<Script>>,
}

/// Test side of a [`ScriptedPort`]: queue device output, inspect host writes.
#[derive(Debug, Clone)]
pub struct ScriptHandle {
    script: Arc<Mutex<Script>>,
}

fn lock(script: &Arc<Mutex<Script>>) -> MutexGuard<'_, Script> {
    match script.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ScriptedPort {
    pub fn new() -> (Self, ScriptHandle) {
        let script = Arc::new(Mutex::new(Script::default()));
        (ScriptedPort { script: script.clone() }, ScriptHandle { script })
    }
}

impl ScriptHandle {
    pub fn push_raw(&self, data: &[u8]) {
        lock(&self.script).rx.extend(data);
    }

    pub fn push_frame(&self, payload: Payload<'_>) {
        let data = payload.encode();
        let mut script = lock(&self.script);
        script.rx.extend(encode_header(data.len()));
        script.rx.extend(data);
    }

    pub fn push_text(&self, text: &str) {
        self.push_frame(Payload::Text(text));
    }

    pub fn push_bytes(&self, data: &[u8]) {
        self.push_frame(Payload::Bytes(data));
    }

    /// Queues `<command>name</command>` wrapped the way the loader sends it.
    pub fn push_cmd(&self, name: &str, arg: &str) {
        self.push_text(&format!(
            r#"<?xml version="1.0" encoding="utf-8"?><host><version>1.0</version><command>{name}</command><arg>{arg}</arg></host>"#
        ));
    }

    /// Queues a `CMD:END` carrying `result`, followed by `CMD:START`.
    pub fn push_end_start(&self, result: &str) {
        self.push_cmd("CMD:END", &format!("<result>{result}</result>"));
        self.push_cmd("CMD:START", "");
    }

    /// Moves every byte written so far into the read queue.
    pub fn loopback(&self) {
        let mut script = lock(&self.script);
        let tx = std::mem::take(&mut script.tx);
        script.rx.extend(tx);
    }

    pub fn fail_writes(&self, fail: bool) {
        lock(&self.script).fail_writes = fail;
    }

    pub fn written(&self) -> Vec<u8> {
        lock(&self.script).tx.clone()
    }

    pub fn unread(&self) -> usize {
        lock(&self.script).rx.len()
    }

    /// Splits the host output back into frame payloads.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        let tx = self.written();
        let mut frames = Vec::new();
        let mut pos = 0;

        while pos + HEADER_LEN <= tx.len() {
            let mut hdr = [0u8; HEADER_LEN];
            hdr.copy_from_slice(&tx[pos..pos + HEADER_LEN]);
            let Some(len) = decode_header(&hdr) else {
                break;
            };
            let start = pos + HEADER_LEN;
            let end = (start + len).min(tx.len());
            frames.push(tx[start..end].to_vec());
            pos = end;
        }

        frames
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent_frames()
            .iter()
            .map(|f| String::from_utf8_lossy(f).trim_end_matches('\0').to_string())
            .collect()
    }
}

#[async_trait]
impl MTKPort for ScriptedPort {
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut script = lock(&self.script);
        if script.rx.len() < buf.len() {
            return Err(Error::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)));
        }

        for b in buf.iter_mut() {
            *b = script.rx.pop_front().unwrap_or_default();
        }
        Ok(buf.len())
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let mut script = lock(&self.script);
        if script.fail_writes {
            return Err(Error::io("Scripted write failure"));
        }
        script.tx.extend_from_slice(buf);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn handshake(&mut self) -> Result<()> {
        Ok(())
    }

    fn get_connection_type(&self) -> ConnectionType {
        ConnectionType::Preloader
    }

    fn get_baudrate(&self) -> u32 {
        0
    }

    fn get_port_name(&self) -> String {
        "scripted".to_string()
    }

    async fn find_device() -> Result<Option<Self>> {
        Ok(None)
    }
}
