/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use log::{debug, error, info, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::connection::{Connection, Payload};
use crate::core::chip::ChipConfig;
use crate::core::crypto::HwCrypto;
use crate::core::devinfo::DeviceInfo;
use crate::core::sla::{RsaSigner, SlaKeyring, SlaSigner};
use crate::core::storage::StorageInfo;
use crate::da::{DA, DAEntryRegion};
use crate::da::xml::cmds::HOST_CMDS;
#[cfg(not(feature = "no_exploits"))]
use crate::da::xml::patch;
use crate::da::xml::result::{CommandResult, DownloadRequest, UploadRequest};
use crate::da::xml::storage;
use crate::error::{Error, Result, XmlError, XmlErrorKind};
use crate::utilities::xml::get_field;

/// Readback buffers in flight between the device and the writer.
const WRITE_QUEUE_DEPTH: usize = 16;

/// Session options, everything the loader bootstrap may need beside the loader itself.
pub struct XmlOptions {
    /// Run the patch path even if the target doesn't enforce secure boot.
    pub patch: bool,
    /// Extension payload loaded through `CMD:CUSTOM`.
    pub extension: Option<Vec<u8>>,
    pub keyring: SlaKeyring,
    pub signer: Box<dyn SlaSigner>,
    pub chip: ChipConfig,
    pub crypto: Option<Box<dyn HwCrypto>>,
    /// Preloader image, source of the OTP seed.
    pub preloader: Option<Vec<u8>>,
}

impl Default for XmlOptions {
    fn default() -> Self {
        XmlOptions {
            patch: false,
            extension: None,
            keyring: SlaKeyring::default(),
            signer: Box::new(RsaSigner),
            chip: ChipConfig::default(),
            crypto: None,
            preloader: None,
        }
    }
}

pub struct Xml {
    pub conn: Connection,
    pub da: DA,
    pub dev_info: DeviceInfo,
    pub(super) using_exts: bool,
    pub(super) patch: bool,
    pub(super) sector_size: usize,
    /// DA2 as it was sent, patched or not, without its signature.
    pub(super) da2: Vec<u8>,
    pub(super) ext_data: Option<Vec<u8>>,
    pub(super) keyring: SlaKeyring,
    pub(super) signer: Box<dyn SlaSigner>,
    #[cfg_attr(feature = "no_exploits", allow(dead_code))]
    pub(super) chip: ChipConfig,
    #[cfg_attr(feature = "no_exploits", allow(dead_code))]
    pub(super) crypto: Option<Box<dyn HwCrypto>>,
    #[cfg_attr(feature = "no_exploits", allow(dead_code))]
    pub(super) preloader: Option<Vec<u8>>,
}

/// What the writer side of a readback receives.
enum WriteChunk {
    Data(Vec<u8>),
    End,
}

impl Xml {
    pub fn new(conn: Connection, da: DA, dev_info: DeviceInfo, options: XmlOptions) -> Self {
        Xml {
            conn,
            da,
            dev_info,
            using_exts: false,
            patch: options.patch,
            sector_size: 512,
            da2: Vec::new(),
            ext_data: options.extension,
            keyring: options.keyring,
            signer: options.signer,
            chip: options.chip,
            crypto: options.crypto,
            preloader: options.preloader,
        }
    }

    /// Whether the loader extension answered and its custom commands can be used.
    pub fn using_exts(&self) -> bool {
        self.using_exts
    }

    pub(super) async fn xsend(&mut self, payload: Payload<'_>) -> Result<()> {
        if self.conn.send(payload).await {
            Ok(())
        } else {
            Err(Error::conn("Failed to send frame"))
        }
    }

    /// One text frame, empty on transport faults.
    pub(super) async fn get_response(&mut self) -> String {
        self.conn.receive_text().await
    }

    pub(super) async fn get_response_raw(&mut self) -> Vec<u8> {
        self.conn.receive().await
    }

    pub(super) async fn ack(&mut self) -> Result<()> {
        self.xsend(Payload::Text("OK")).await
    }

    pub(super) async fn ack_value(&mut self, value: usize) -> Result<()> {
        self.xsend(Payload::Text(&format!("OK@0x{value:x}"))).await
    }

    /// Sends a command and waits for its outcome.
    ///
    /// With `noack` the call returns right after the loader accepted the command,
    /// leaving the data phase and the closing bracket to the caller.
    /// Otherwise, the first message following the acceptance is returned, unless
    /// it is `CMD:END`, in which case the whole `CMD:END`/`CMD:START` bracket is
    /// consumed first.
    pub(super) async fn send_command(&mut self, cmd: &str, noack: bool) -> Result<CommandResult> {
        debug!("Sending XML command: {}", get_field(cmd, "command"));
        self.xsend(Payload::Text(cmd)).await?;

        let resp = self.get_response().await;
        match CommandResult::parse(&resp) {
            CommandResult::Ok => {
                if noack {
                    return Ok(CommandResult::Ok);
                }

                match self.get_command_result().await? {
                    CommandResult::End { result } => {
                        self.ack().await?;
                        if !self.get_command_result().await?.is_start() {
                            return Err(Error::proto("Missing CMD:START after CMD:END"));
                        }
                        if result != "OK" {
                            error!("Command failed: {result}");
                            return Err(Error::Xml(XmlError::from_message(result.as_bytes())));
                        }
                        Ok(CommandResult::End { result })
                    }
                    other => Ok(other),
                }
            }
            CommandResult::Error(err) if err.kind == XmlErrorKind::UnsupportedCmd => {
                // The loader still runs the bracket for commands it doesn't know
                let result = self.get_command_result().await?;
                self.ack().await?;
                self.get_command_result().await?;

                let message = match result {
                    CommandResult::End { result } if !result.is_empty() => result,
                    _ => err.message,
                };
                Err(Error::Xml(XmlError { kind: XmlErrorKind::UnsupportedCmd, message }))
            }
            CommandResult::Error(err) => Err(Error::Xml(err)),
            _ if resp.is_empty() => Err(Error::conn("No answer to command")),
            _ => Err(Error::proto(format!("Unexpected answer to command: {resp}"))),
        }
    }

    /// Reads and decodes the next loader message, acknowledging it where the
    /// loader expects it. Raw transfers (`OK@0x<len>`) are read completely and
    /// returned as [`CommandResult::Data`].
    pub(super) async fn get_command_result(&mut self) -> Result<CommandResult> {
        let mut resp = self.get_response().await;

        loop {
            let result = CommandResult::parse(&resp);
            match result {
                CommandResult::Transfer(length) => {
                    self.ack().await?;
                    let sresp = self.get_response().await;
                    if !sresp.contains("OK") {
                        return Err(Error::proto(format!("Transfer refused: {sresp}")));
                    }
                    self.ack().await?;

                    let data = self.read_frames(length).await?;
                    self.ack().await?;
                    return Ok(CommandResult::Data(data));
                }
                CommandResult::Progress { ref message } => {
                    debug!("Progress report: {message}");
                    self.ack().await?;
                    loop {
                        let data = self.get_response().await;
                        if data.is_empty() {
                            return Err(Error::proto("Progress report interrupted"));
                        }
                        self.ack().await?;
                        if data == "OK!EOT" {
                            break;
                        }
                    }
                    resp = self.get_response().await;
                }
                CommandResult::Start
                | CommandResult::Download(_)
                | CommandResult::Upload(_)
                | CommandResult::FileSys(_) => {
                    self.ack().await?;
                    return Ok(result);
                }
                _ if resp.is_empty() => return Err(Error::conn("No answer from loader")),
                _ => return Ok(result),
            }
        }
    }

    /// Reads frames until `length` bytes were collected.
    async fn read_frames(&mut self, length: usize) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(length);
        while data.len() < length {
            let frame = self.get_response_raw().await;
            if frame.is_empty() {
                error!("Transfer stopped at 0x{:X} of 0x{:X} bytes", data.len(), length);
                return Err(Error::proto("Short transfer"));
            }
            data.extend_from_slice(&frame);
        }
        Ok(data)
    }

    /// Opening of every host bound transfer: `OK@0x<len>`, then `OK`.
    async fn begin_transfer(&mut self) -> Result<usize> {
        let resp = self.get_response().await;
        let CommandResult::Transfer(length) = CommandResult::parse(&resp) else {
            error!("Error on downloading data: {resp}");
            return Err(Error::proto(format!("Expected a transfer, got '{resp}'")));
        };
        self.ack().await?;

        let sresp = self.get_response().await;
        if !sresp.contains("OK") {
            return Err(Error::proto(format!("Transfer refused: {sresp}")));
        }
        self.ack().await?;

        Ok(length)
    }

    /// Serves a `CMD:DOWNLOAD-FILE`: sends `data` to the loader in `packet_length` chunks.
    pub(super) async fn upload(
        &mut self,
        req: &DownloadRequest,
        data: &[u8],
        raw: bool,
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        let length = req
            .length()
            .ok_or_else(|| Error::proto(format!("Invalid source file '{}'", req.source_file)))?;
        let packet_length = req.packet_length.max(1);

        self.ack_value(length).await?;
        let resp = self.get_response().await;
        if resp != "OK" {
            return Err(Error::proto(format!("Upload of '{}' refused: {resp}", req.info)));
        }

        let mut written = 0;
        for pos in (0..length).step_by(packet_length) {
            self.ack_value(0).await?;
            let resp = self.get_response().await;
            if !resp.contains("OK") {
                error!("Error on writing at pos 0x{pos:X}: {}", get_field(&resp, "message"));
                return Err(Error::proto(format!("Upload status refused at 0x{pos:X}")));
            }

            let start = pos.min(data.len());
            let end = (pos + packet_length).min(data.len());
            let chunk = &data[start..end];
            self.xsend(Payload::Bytes(chunk)).await?;

            let resp = self.get_response().await;
            if !resp.contains("OK") {
                error!("Error on writing at pos 0x{pos:X}");
                return Err(Error::proto(format!("Upload chunk refused at 0x{pos:X}")));
            }

            written += chunk.len();
            progress(written, length);
        }

        if raw {
            self.ack().await?;
        }

        let result = self.get_command_result().await?;
        self.ack().await?;
        if result.is_end_ok() {
            if self.get_command_result().await?.is_start() {
                return Ok(());
            }
            return Err(Error::proto("Missing CMD:START after upload"));
        }

        self.get_command_result().await?;
        error!("Upload failed: {result:?}");
        match result {
            CommandResult::End { result } => Err(Error::Xml(XmlError::from_message(result.as_bytes()))),
            _ => Err(Error::proto("Upload did not end with CMD:END")),
        }
    }

    /// Serves a `CMD:UPLOAD-FILE` whole, returning the payload.
    pub(super) async fn download(&mut self, req: &UploadRequest) -> Result<Vec<u8>> {
        debug!("Receiving {} ({})", req.target_file, req.info);
        let length = self.begin_transfer().await?;
        let data = self.read_frames(length).await?;
        self.ack().await?;
        Ok(data)
    }

    /// Serves a `CMD:UPLOAD-FILE` frame by frame, streaming the payload into `writer`.
    /// Returns the number of bytes received.
    pub(super) async fn download_raw(
        &mut self,
        req: &UploadRequest,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<usize> {
        debug!("Streaming {} ({})", req.target_file, req.info);
        let length = self.begin_transfer().await?;

        let (tx, mut rx) = mpsc::channel::<WriteChunk>(WRITE_QUEUE_DEPTH);

        let reader = async {
            let result = self.pump_frames(length, &tx, progress).await;
            let _ = tx.send(WriteChunk::End).await;
            result
        };

        let sink = async {
            while let Some(chunk) = rx.recv().await {
                match chunk {
                    WriteChunk::Data(data) => writer.write_all(&data).await?,
                    WriteChunk::End => break,
                }
            }
            writer.flush().await?;
            Ok::<(), Error>(())
        };

        let (read, written) = tokio::join!(reader, sink);
        written?;
        read
    }

    async fn pump_frames(
        &mut self,
        length: usize,
        tx: &mpsc::Sender<WriteChunk>,
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<usize> {
        let mut read = 0;

        while read < length {
            let data = self.get_response_raw().await;
            if data.is_empty() {
                error!("Readback stopped at 0x{read:X} of 0x{length:X} bytes");
                return Err(Error::proto("Short readback"));
            }
            read += data.len();

            // The writer may be gone, the device still has to be served
            if tx.send(WriteChunk::Data(data)).await.is_err() {
                debug!("Writer closed, discarding readback data");
            }
            progress(read, length);

            self.ack().await?;
            let sresp = self.get_response().await;
            if !sresp.contains("OK") {
                warn!("Readback interrupted: {sresp}");
                break;
            }
            self.ack().await?;
        }

        Ok(read)
    }

    /// Consumes `CMD:END`, and `CMD:START` when the command succeeded.
    pub(super) async fn end_bracket(&mut self) -> Result<()> {
        let result = self.get_command_result().await?;
        self.ack().await?;

        match result {
            CommandResult::End { result } if result == "OK" => {
                if self.get_command_result().await?.is_start() {
                    Ok(())
                } else {
                    Err(Error::proto("Missing CMD:START"))
                }
            }
            CommandResult::End { result } => Err(Error::Xml(XmlError::from_message(result.as_bytes()))),
            other => Err(Error::proto(format!("Expected CMD:END, got {other:?}"))),
        }
    }

    /// Closing of the custom commands: `CMD:END` and `CMD:START`, each acked.
    pub(super) async fn drain_bracket(&mut self) -> Result<()> {
        for _ in 0..2 {
            self.get_response().await;
            self.ack().await?;
        }
        Ok(())
    }

    /// Runs a command whose answer is a file, and returns that file.
    pub(super) async fn fetch_blob(&mut self, cmd: &str) -> Result<Vec<u8>> {
        self.send_command(cmd, true).await?;

        let CommandResult::Upload(req) = self.get_command_result().await? else {
            return Err(Error::proto("Expected CMD:UPLOAD-FILE"));
        };
        let data = self.download(&req).await?;
        self.end_bracket().await?;

        Ok(data)
    }

    /// Builds the DA1 image to send and keeps the unsigned DA2 for `boot_to`.
    /// Both stages go through the patch engine on secure boot targets or when
    /// patching is forced.
    pub(super) async fn prepare_stages(&mut self) -> Result<(DAEntryRegion, Vec<u8>)> {
        let da1 = self.da.get_da1().ok_or_else(|| Error::obscura("DA1 region not found"))?.clone();
        let da2 = self.da.get_da2().ok_or_else(|| Error::obscura("DA2 region not found"))?.clone();

        let mut da1data = da1.data.clone();
        let mut da2data = da2.data.clone();

        #[cfg(not(feature = "no_exploits"))]
        {
            let sbc = self.dev_info.sbc_enabled().await;
            if self.patch || sbc {
                let patched = patch::patch_da(
                    &mut da1data,
                    &mut da2data,
                    da1.sig_len as usize,
                    da2.sig_len as usize,
                    self.da.is_v6(),
                    da2.addr,
                );
                if !patched {
                    warn!("No hash position in DA1, DA2 is sent unpatched");
                }
                self.patch = true;
            }
        }
        #[cfg(feature = "no_exploits")]
        {
            self.patch = false;
        }

        let unsigned = da2data.len().saturating_sub(da2.sig_len as usize);
        da2data.truncate(unsigned);
        self.da2 = da2data;

        Ok((da1, da1data))
    }

    /// Sends DA1 through the preloader and brings its command loop up.
    pub(super) async fn upload_da1(&mut self) -> Result<()> {
        let (da1, da1data) = self.prepare_stages().await?;

        info!(
            "[Obscura] Uploading XML DA1 region to address 0x{:08X} with length 0x{:X}",
            da1.addr, da1.length
        );
        self.conn.send_da(&da1data, da1.length, da1.addr, da1.sig_len).await?;
        info!("[Obscura] Sent XML DA1, jumping to address 0x{:08X}...", da1.addr);
        self.conn.jump_da(da1.addr).await?;

        if !self.get_command_result().await?.is_start() {
            return Err(Error::proto("DA1 did not start"));
        }

        self.setup_env().await?;
        self.setup_hw_init().await?;
        if let Err(e) = self.setup_host_info("").await {
            warn!("SET-HOST-INFO failed: {e}");
        }

        Ok(())
    }

    pub(super) async fn setup_env(&mut self) -> Result<()> {
        xmlcmd!(
            self,
            SetRuntimeParameter,
            "NONE".to_string(),
            "AUTO-DETECT".to_string(),
            "INFO".to_string(),
            "UART".to_string(),
            "LINUX".to_string(),
            "YES".to_string()
        )
        .await?;
        Ok(())
    }

    pub(super) async fn setup_hw_init(&mut self) -> Result<()> {
        xmlcmd!(self, HostSupportedCommands, HOST_CMDS.to_string()).await?;
        // DRAM init, reported through CMD:PROGRESS-REPORT
        xmlcmd!(self, NotifyInitHw).await?;
        Ok(())
    }

    pub(super) async fn setup_host_info(&mut self, info: &str) -> Result<()> {
        xmlcmd!(self, SetHostInfo, info.to_string()).await?;
        Ok(())
    }

    /// Writes registers through the stock `WRITE-REGISTER` command.
    pub(super) async fn write_register(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let result = xmlcmd!(self, WriteRegister, addr, data.len() as u64).await?;
        let CommandResult::Download(req) = result else {
            return Err(Error::proto(format!("WRITE-REGISTER answered with {result:?}")));
        };

        let mut progress = |_, _| {};
        self.upload(&req, data, false, &mut progress).await
    }

    pub(super) async fn read_register(&mut self, addr: u32) -> Result<u32> {
        xmlcmd_noack!(self, ReadRegister, addr).await?;

        let CommandResult::Data(data) = self.get_command_result().await? else {
            return Err(Error::proto("READ-REGISTER sent no data"));
        };
        self.end_bracket().await?;

        if data.len() < 4 {
            return Err(Error::proto(format!("Short register read at 0x{addr:08X}")));
        }
        Ok(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Cached storage geometry, asking the loader when there is none yet.
    pub(super) async fn get_or_reinit_storage(&mut self) -> Result<StorageInfo> {
        if let Some(storage) = self.dev_info.storage().await {
            return Ok(storage);
        }
        storage::reinit(self).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::connection::mock::{ScriptHandle, ScriptedPort};
    use crate::da::DAEntryRegion;
    use crate::da::dafile::DAType;

    pub(crate) fn region(data: Vec<u8>, addr: u32, sig_len: u32) -> DAEntryRegion {
        let length = data.len() as u32;
        DAEntryRegion { data, offset: 0, length, addr, region_length: length - sig_len, sig_len }
    }

    pub(crate) fn sample_da(da1: Vec<u8>, da2: Vec<u8>) -> DA {
        DA {
            da_type: DAType::V6,
            regions: vec![
                region(vec![], 0, 0),
                region(da1, 0x0020_0000, 0x10),
                region(da2, 0x4000_0000, 0x10),
            ],
            magic: 0xDADA,
            hw_code: 0x766,
            hw_sub_code: 0x8A00,
        }
    }

    pub(crate) fn scripted_xml() -> (Xml, ScriptHandle) {
        let (port, handle) = ScriptedPort::new();
        let conn = Connection::new(Box::new(port));
        let xml = Xml::new(
            conn,
            sample_da(vec![0u8; 0x40], vec![0u8; 0x40]),
            DeviceInfo::new(),
            XmlOptions::default(),
        );
        (xml, handle)
    }

    /// Device side of `upload()` for `length` bytes in `packet` sized chunks.
    pub(crate) fn push_upload_acks(handle: &ScriptHandle, length: usize, packet: usize) {
        handle.push_text("OK");
        for _ in (0..length).step_by(packet) {
            handle.push_text("OK");
            handle.push_text("OK");
        }
        handle.push_end_start("OK");
    }

    /// Device side of `download()`: `OK@0x<len>`, `OK`, then the payload in `packet` sized frames.
    pub(crate) fn push_transfer(handle: &ScriptHandle, data: &[u8], packet: usize) {
        handle.push_text(&format!("OK@0x{:x}", data.len()));
        handle.push_text("OK");
        for chunk in data.chunks(packet) {
            handle.push_bytes(chunk);
        }
    }

    pub(crate) fn upload_file_cmd(handle: &ScriptHandle) {
        handle.push_cmd(
            "CMD:UPLOAD-FILE",
            "<checksum>CHK_NO</checksum><info></info><target_file>MEM://0x0:0x200000</target_file><packet_length>0x1000</packet_length>",
        );
    }

    pub(crate) fn download_file_cmd(handle: &ScriptHandle, length: usize, packet: usize) {
        handle.push_cmd(
            "CMD:DOWNLOAD-FILE",
            &format!(
                "<checksum>CHK_NO</checksum><info>data</info><source_file>MEM://0x0:0x{length:x}</source_file><packet_length>0x{packet:x}</packet_length>"
            ),
        );
    }

    #[cfg(not(feature = "no_exploits"))]
    #[tokio::test]
    async fn secure_boot_selects_the_patch_path() {
        use crate::core::devinfo::DevInfoData;

        let (mut xml, _handle) = scripted_xml();
        let (da1, _) = xml.prepare_stages().await.unwrap();
        assert_eq!(da1.addr, 0x0020_0000);
        assert!(!xml.patch);
        assert_eq!(xml.da2.len(), 0x30);

        let (mut xml, _handle) = scripted_xml();
        xml.dev_info.set_data(DevInfoData { target_config: 0x1, ..Default::default() }).await;
        xml.prepare_stages().await.unwrap();
        assert!(xml.patch);
        assert_eq!(xml.da2.len(), 0x30);

        // Forced on a target without secure boot
        let (mut xml, _handle) = scripted_xml();
        xml.patch = true;
        xml.prepare_stages().await.unwrap();
        assert!(xml.patch);
    }

    #[tokio::test]
    async fn command_bracket() {
        let (mut xml, handle) = scripted_xml();

        handle.push_text("OK");
        handle.push_end_start("OK");
        let res = xmlcmd!(xml, SetHostInfo, String::new()).await.unwrap();
        assert!(res.is_end_ok());
        assert_eq!(handle.unread(), 0);

        // Command, END ack, START ack
        let sent = handle.sent_texts();
        assert_eq!(sent.len(), 3);
        assert!(sent[0].contains("<command>CMD:SET-HOST-INFO</command>"));
        assert_eq!(&sent[1..], ["OK", "OK"]);

        // Ready for the next one
        handle.push_text("OK");
        handle.push_end_start("OK");
        assert!(xmlcmd!(xml, NotifyInitHw).await.is_ok());
        assert_eq!(handle.unread(), 0);
    }

    #[tokio::test]
    async fn progress_reports_are_drained() {
        let (mut xml, handle) = scripted_xml();

        handle.push_text("OK");
        handle.push_cmd("CMD:PROGRESS-REPORT", "<message>init-hw</message>");
        handle.push_text("OK!PROGRESS@40");
        handle.push_text("OK!EOT");
        handle.push_end_start("OK");

        assert!(xmlcmd!(xml, NotifyInitHw).await.unwrap().is_end_ok());
        assert_eq!(handle.unread(), 0);
        assert_eq!(handle.sent_texts().len(), 6);
    }

    #[tokio::test]
    async fn device_errors() {
        let (mut xml, handle) = scripted_xml();

        handle.push_text("ERR!UNSUPPORTED");
        handle.push_end_start("ERR!UNSUPPORTED");
        let err = xmlcmd!(xml, CanHigherUsbSpeed).await.unwrap_err();
        assert!(matches!(err, Error::Xml(XmlError { kind: XmlErrorKind::UnsupportedCmd, .. })));
        assert_eq!(handle.unread(), 0);

        handle.push_text("ERR!INVALID_PARAM");
        let err = xmlcmd!(xml, NotifyInitHw).await.unwrap_err();
        assert!(matches!(err, Error::Xml(XmlError { kind: XmlErrorKind::Device, .. })));

        handle.push_text("OK");
        handle.push_cmd("CMD:END", "<result>ERR</result><message>STATUS_ERR</message>");
        handle.push_cmd("CMD:START", "");
        let err = xmlcmd!(xml, NotifyInitHw).await.unwrap_err();
        assert_eq!(err.to_string(), "XML DA error: STATUS_ERR");

        // Nothing left to read
        assert!(matches!(xmlcmd!(xml, NotifyInitHw).await, Err(Error::Connection(_))));
    }

    #[tokio::test]
    async fn upload_in_packets() {
        let (mut xml, handle) = scripted_xml();
        let data: Vec<u8> = (0..0x2800u32).map(|i| i as u8).collect();

        let req = DownloadRequest {
            checksum: "CHK_NO".into(),
            info: "2nd-DA".into(),
            source_file: "MEM://0x0:0x2800".into(),
            packet_length: 0x1000,
        };
        push_upload_acks(&handle, data.len(), 0x1000);

        let mut seen = Vec::new();
        let mut progress = |done: usize, total: usize| seen.push((done, total));
        xml.upload(&req, &data, false, &mut progress).await.unwrap();

        assert_eq!(seen.last(), Some(&(0x2800, 0x2800)));
        assert_eq!(seen.len(), 3);
        assert_eq!(handle.unread(), 0);

        let frames = handle.sent_frames();
        assert_eq!(frames[0], b"OK@0x2800\0");
        assert_eq!(frames[1], b"OK@0x0\0");
        assert_eq!(frames[2], &data[..0x1000]);
        assert_eq!(frames[6], &data[0x2000..]);
    }

    #[tokio::test]
    async fn blobs_and_raw_transfers() {
        let (mut xml, handle) = scripted_xml();

        handle.push_text("OK");
        upload_file_cmd(&handle);
        push_transfer(&handle, b"<storage>NOR</storage>", 8);
        handle.push_end_start("OK");
        let blob = xml.fetch_blob(&crate::da::xml::cmds::create_cmd(&crate::da::xml::cmds::GetHwInfo::new())).await.unwrap();
        assert_eq!(blob, b"<storage>NOR</storage>");
        assert_eq!(handle.unread(), 0);

        // A transfer announced in place of a command
        push_transfer(&handle, &[1, 2, 3, 4], 4);
        assert_eq!(xml.get_command_result().await.unwrap(), CommandResult::Data(vec![1, 2, 3, 4]));
    }

    #[tokio::test]
    async fn stock_registers() {
        let (mut xml, handle) = scripted_xml();

        handle.push_text("OK");
        download_file_cmd(&handle, 4, 0x1000);
        push_upload_acks(&handle, 4, 0x1000);
        xml.write_register(0x1000_7000, &0x2200_0064u32.to_le_bytes()).await.unwrap();
        assert_eq!(handle.unread(), 0);
        assert!(handle.sent_frames().iter().any(|f| f == &[0x64, 0x00, 0x00, 0x22]));

        handle.push_text("OK");
        push_transfer(&handle, &0xCA00_0000u32.to_le_bytes(), 4);
        handle.push_end_start("OK");
        assert_eq!(xml.read_register(0x0800_0000).await.unwrap(), 0xCA00_0000);
        assert_eq!(handle.unread(), 0);
    }

    #[tokio::test]
    async fn streamed_readback() {
        let (mut xml, handle) = scripted_xml();
        let data: Vec<u8> = (0..0x300u32).map(|i| (i * 7) as u8).collect();

        handle.push_text("OK@0x300");
        handle.push_text("OK");
        for (i, chunk) in data.chunks(0x100).enumerate() {
            handle.push_bytes(chunk);
            if i < 2 {
                handle.push_text("OK");
            } else {
                handle.push_cmd("CMD:END", "<result>OK</result>");
            }
        }

        let req = UploadRequest {
            checksum: "CHK_NO".into(),
            info: String::new(),
            target_file: "MEM://0x0:0x300".into(),
            packet_length: "0x100".into(),
        };
        let mut out = Vec::new();
        let mut progress = |_, _| {};
        let read = xml.download_raw(&req, &mut out, &mut progress).await.unwrap();

        assert_eq!(read, 0x300);
        assert_eq!(out, data);
        assert_eq!(handle.unread(), 0);
    }
}
