/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::str::FromStr;

use crate::error::{Error, Result};

/// Extracts the text between the first `<name>` and the following `</name>`.
/// The loader replies are not real XML documents, so no parser is involved.
/// Returns an empty string if either marker is missing.
pub fn get_field(data: &str, name: &str) -> String {
    let open = format!("<{name}>");
    let close = format!("</{name}>");

    let Some(start) = data.find(&open) else {
        return String::new();
    };
    let body = start + open.len();

    match data[body..].find(&close) {
        Some(end) => data[body..body + end].to_string(),
        None => String::new(),
    }
}

/// Like [`get_field`] but walks a `/` separated path (e.g. `arg/packet_length`)
/// and parses the result.
pub fn get_tag<T: FromStr>(data: &str, path: &str) -> Result<T> {
    let mut current = data.to_string();
    for segment in path.split('/') {
        current = get_field(&current, segment);
        if current.is_empty() {
            return Err(Error::proto(format!("Missing tag <{path}>")));
        }
    }

    current.trim().parse::<T>().map_err(|_| Error::proto(format!("Invalid value in <{path}>")))
}

/// Reads a numeric tag, accepting both `0x` prefixed hex and plain decimal.
pub fn get_tag_usize(data: &str, path: &str) -> Result<usize> {
    let raw: String = get_tag(data, path)?;
    parse_number(&raw)
        .map(|v| v as usize)
        .ok_or_else(|| Error::proto(format!("Invalid number in <{path}>: {raw}")))
}

pub fn parse_number(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

/// Parses a hex number which may or may not carry the `0x` prefix.
pub fn parse_hex(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let hex = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")).unwrap_or(raw);
    u64::from_str_radix(hex, 16).ok()
}
