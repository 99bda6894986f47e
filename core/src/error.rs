/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::fmt;

use num_enum::TryFromPrimitive;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("XML DA error: {0}")]
    Xml(#[from] XmlError),
    #[error("RPMB error: {0}")]
    Rpmb(#[from] RpmbError),
    #[error("{0}")]
    Obscura(String),
}

impl Error {
    pub fn io(msg: impl Into<String>) -> Self {
        Error::Io(std::io::Error::other(msg.into()))
    }

    pub fn conn(msg: impl Into<String>) -> Self {
        Error::Connection(msg.into())
    }

    pub fn proto(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn obscura(msg: impl Into<String>) -> Self {
        Error::Obscura(msg.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmlErrorKind {
    /// `ERR!UNSUPPORTED`, the loader doesn't know the command.
    UnsupportedCmd,
    /// Any other `ERR!...` reply.
    Device,
}

/// Error reported by the loader as an `ERR!<reason>` string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct XmlError {
    pub kind: XmlErrorKind,
    pub message: String,
}

impl XmlError {
    pub fn from_message(raw: &[u8]) -> Self {
        let message = String::from_utf8_lossy(raw).trim_end_matches('\0').to_string();
        let kind = if message.contains("ERR!UNSUPPORTED") {
            XmlErrorKind::UnsupportedCmd
        } else {
            XmlErrorKind::Device
        };

        XmlError { kind, message }
    }
}

/// Status codes returned by the extension RPMB handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum RpmbStatus {
    GeneralFailure = 1,
    AuthenticationFailure = 2,
    CounterFailure = 3,
    AddressFailure = 4,
    WriteFailure = 5,
    ReadFailure = 6,
    KeyNotProgrammed = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RpmbError {
    #[error("{0} (sector {1})")]
    Status(RpmbStatus, u32),
    #[error("Unknown RPMB status 0x{0:04X} (sector {1})")]
    Unknown(u16, u32),
    #[error("RPMB key was not accepted")]
    KeyRejected,
}

impl RpmbError {
    pub fn from_code(code: u16, sector: u32) -> Self {
        match RpmbStatus::try_from(code) {
            Ok(status) => RpmbError::Status(status, sector),
            Err(_) => RpmbError::Unknown(code, sector),
        }
    }
}

impl fmt::Display for RpmbStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            RpmbStatus::GeneralFailure => "General failure",
            RpmbStatus::AuthenticationFailure => "Authentication failure",
            RpmbStatus::CounterFailure => "Counter failure",
            RpmbStatus::AddressFailure => "Address failure",
            RpmbStatus::WriteFailure => "Write failure",
            RpmbStatus::ReadFailure => "Read failure",
            RpmbStatus::KeyNotProgrammed => "Authentication key not yet programmed",
        };
        f.write_str(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xml_error_kind_follows_message() {
        let unsupported = XmlError::from_message(b"ERR!UNSUPPORTED\0");
        assert_eq!(unsupported.kind, XmlErrorKind::UnsupportedCmd);
        assert_eq!(unsupported.message, "ERR!UNSUPPORTED");

        let other = XmlError::from_message(b"ERR!CHECKSUM");
        assert_eq!(other.kind, XmlErrorKind::Device);
    }

    #[test]
    fn rpmb_codes_map_to_messages() {
        let err = RpmbError::from_code(2, 5);
        assert_eq!(err.to_string(), "Authentication failure (sector 5)");

        let err = RpmbError::from_code(7, 0);
        assert_eq!(err, RpmbError::Status(RpmbStatus::KeyNotProgrammed, 0));

        assert_eq!(RpmbError::from_code(0x42, 1), RpmbError::Unknown(0x42, 1));
    }
}
