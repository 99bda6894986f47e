/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::error::XmlError;
use crate::utilities::xml::{get_field, parse_hex, parse_number};

/// `CMD:DOWNLOAD-FILE`: the loader wants data from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub checksum: String,
    pub info: String,
    /// `MEM://<offset>:<length>`
    pub source_file: String,
    pub packet_length: usize,
}

impl DownloadRequest {
    /// Transfer length announced in the `source_file` location.
    pub fn length(&self) -> Option<usize> {
        let length = self.source_file.split(':').nth(2)?;
        parse_hex(length).map(|l| l as usize)
    }
}

/// `CMD:UPLOAD-FILE`: the loader is about to send data to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub checksum: String,
    pub info: String,
    pub target_file: String,
    pub packet_length: String,
}

/// `CMD:FILE-SYS-OPERATION`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSysOp {
    pub key: String,
    pub file_path: String,
}

/// A decoded loader message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// Plain `OK`.
    Ok,
    /// `OK@0x<len>`: a raw transfer of `len` bytes follows.
    Transfer(usize),
    Error(XmlError),
    Download(DownloadRequest),
    Upload(UploadRequest),
    FileSys(FileSysOp),
    Progress { message: String },
    Start,
    End { result: String },
    /// Payload collected from a raw transfer.
    Data(Vec<u8>),
    Other(String),
}

impl CommandResult {
    /// Decodes a single text frame. Transfers are only announced here,
    /// reading them is up to the caller.
    pub fn parse(text: &str) -> CommandResult {
        let text = text.trim_end_matches('\0');

        if text == "OK" {
            return CommandResult::Ok;
        }
        if let Some(len) = text.strip_prefix("OK@") {
            return match parse_number(len) {
                Some(len) => CommandResult::Transfer(len as usize),
                None => CommandResult::Other(text.to_string()),
            };
        }
        if text.starts_with("ERR!") {
            return CommandResult::Error(XmlError::from_message(text.as_bytes()));
        }

        let arg = get_field(text, "arg");
        match get_field(text, "command").as_str() {
            "CMD:START" => CommandResult::Start,
            "CMD:END" => CommandResult::End { result: end_result(&arg) },
            "CMD:PROGRESS-REPORT" => CommandResult::Progress { message: get_field(&arg, "message") },
            "CMD:DOWNLOAD-FILE" => CommandResult::Download(DownloadRequest {
                checksum: get_field(&arg, "checksum"),
                info: get_field(&arg, "info"),
                source_file: get_field(&arg, "source_file"),
                packet_length: parse_number(&get_field(&arg, "packet_length"))
                    .unwrap_or_default() as usize,
            }),
            "CMD:UPLOAD-FILE" => CommandResult::Upload(UploadRequest {
                checksum: get_field(&arg, "checksum"),
                info: get_field(&arg, "info"),
                target_file: get_field(&arg, "target_file"),
                packet_length: get_field(&arg, "packet_length"),
            }),
            "CMD:FILE-SYS-OPERATION" => CommandResult::FileSys(FileSysOp {
                key: get_field(&arg, "key"),
                file_path: get_field(&arg, "file_path"),
            }),
            _ => CommandResult::Other(text.to_string()),
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self, CommandResult::Start)
    }

    /// `true` for `CMD:END` carrying `OK`.
    pub fn is_end_ok(&self) -> bool {
        matches!(self, CommandResult::End { result } if result == "OK")
    }
}

/// A failing `CMD:END` carries the reason in `<message>`.
fn end_result(arg: &str) -> String {
    let result = get_field(arg, "result");
    let message = get_field(arg, "message");
    if result != "OK" && !message.is_empty() { message } else { result }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::XmlErrorKind;

    fn host(cmd: &str, arg: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?><host><version>1.0</version><command>{cmd}</command><arg>{arg}</arg></host>"#
        )
    }

    #[test]
    fn plain_replies() {
        assert_eq!(CommandResult::parse("OK\0"), CommandResult::Ok);
        assert_eq!(CommandResult::parse("OK@0x1000"), CommandResult::Transfer(0x1000));
        assert!(matches!(CommandResult::parse("OK@zz"), CommandResult::Other(_)));

        let CommandResult::Error(err) = CommandResult::parse("ERR!UNSUPPORTED") else {
            panic!("expected an error");
        };
        assert_eq!(err.kind, XmlErrorKind::UnsupportedCmd);
    }

    #[test]
    fn lifetime_markers() {
        assert!(CommandResult::parse(&host("CMD:START", "")).is_start());
        assert!(CommandResult::parse(&host("CMD:END", "<result>OK</result>")).is_end_ok());

        let failed = CommandResult::parse(&host(
            "CMD:END",
            "<result>ERR</result><message>STATUS_PARTITION_NOT_FOUND</message>",
        ));
        assert_eq!(failed, CommandResult::End { result: "STATUS_PARTITION_NOT_FOUND".into() });
    }

    #[test]
    fn transfer_requests() {
        let dl = CommandResult::parse(&host(
            "CMD:DOWNLOAD-FILE",
            "<checksum>CHK_NO</checksum><info>2nd-DA</info><source_file>MEM://0x0:0x50c78</source_file><packet_length>0x1000</packet_length>",
        ));
        let CommandResult::Download(req) = dl else {
            panic!("expected a download request");
        };
        assert_eq!(req.packet_length, 0x1000);
        assert_eq!(req.length(), Some(0x50c78));

        let up = CommandResult::parse(&host(
            "CMD:UPLOAD-FILE",
            "<checksum>CHK_NO</checksum><info></info><target_file>MEM://0x0:0x200000</target_file><packet_length>0x100000</packet_length>",
        ));
        assert!(matches!(up, CommandResult::Upload(UploadRequest { ref packet_length, .. }) if packet_length == "0x100000"));

        let fs = CommandResult::parse(&host(
            "CMD:FILE-SYS-OPERATION",
            "<key>FILE-SIZE</key><file_path>MEM://0x0:0x1000</file_path>",
        ));
        assert_eq!(
            fs,
            CommandResult::FileSys(FileSysOp { key: "FILE-SIZE".into(), file_path: "MEM://0x0:0x1000".into() })
        );
    }
}
