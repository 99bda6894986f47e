/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use log::{debug, error, info, warn};

use crate::core::sla::SLA_SIGNATURE_LEN;
use crate::da::xml::Xml;
use crate::da::xml::cmds::{GetSysProperty, SecurityGetDevFwInfo, create_cmd, mem_file};
use crate::da::xml::result::CommandResult;
use crate::error::{Error, Result, XmlErrorKind};
use crate::utilities::xml::get_field;

/// Host buffer the SLA answer is announced from.
const SLA_HOST_OFFSET: u64 = 0x800_0000;

/// Identity blob returned by `SECURITY-GET-DEV-FW-INFO`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevInfo {
    /// SLA challenge.
    pub rnd: Vec<u8>,
    pub hrid: Vec<u8>,
    pub socid: Vec<u8>,
}

fn hex_field(data: &str, name: &str) -> Vec<u8> {
    hex::decode(get_field(data, name)).unwrap_or_default()
}

pub async fn get_dev_info(xml: &mut Xml) -> Result<DevInfo> {
    let data = xml.fetch_blob(&create_cmd(&SecurityGetDevFwInfo::new())).await?;
    let text = String::from_utf8_lossy(&data);

    Ok(DevInfo {
        rnd: hex_field(&text, "rnd"),
        hrid: hex_field(&text, "hrid"),
        socid: hex_field(&text, "socid"),
    })
}

pub async fn get_sys_property(xml: &mut Xml, key: &str, length: u64) -> Result<Vec<u8>> {
    xml.fetch_blob(&create_cmd(&GetSysProperty::new(key.to_string(), length))).await
}

/// Whether the loader enforces SLA. `None` when the property can't be read.
pub async fn check_sla(xml: &mut Xml) -> Result<Option<bool>> {
    let data = get_sys_property(xml, "DA.SLA", 0x20_0000).await?;
    let text = String::from_utf8_lossy(&data);

    let Some(idx) = text.find("item key=") else {
        warn!("Couldn't find item key in DA.SLA");
        return Ok(None);
    };

    let item = &text[idx + "item key=".len()..];
    let value = item
        .find('>')
        .map(|start| &item[start + 1..])
        .and_then(|rest| rest.find('<').map(|end| &rest[..end]))
        .unwrap_or_default();

    debug!("DA.SLA: {value}");
    Ok(Some(value != "DISABLED"))
}

/// Sends the SLA answer. `false` when the loader refused it.
pub async fn handle_sla(xml: &mut Xml, signature: &[u8]) -> Result<bool> {
    let result = xmlcmd!(
        xml,
        SecuritySetFlashPolicy,
        mem_file(SLA_HOST_OFFSET, signature.len() as u64)
    )
    .await?;

    let CommandResult::Download(req) = result else {
        error!("SLA policy command answered with {result:?}");
        return Ok(false);
    };

    info!("[Obscura] Running SLA auth...");
    let mut progress = |_, _| {};
    match xml.upload(&req, signature, false, &mut progress).await {
        Ok(()) => {
            info!("[Obscura] Successfully uploaded SLA auth");
            Ok(true)
        }
        Err(Error::Xml(e)) => {
            error!("SLA auth refused: {e}");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Answers the SLA challenge with the first matching key, or with a blank
/// signature when no key matches DA2.
pub async fn authenticate(xml: &mut Xml) -> Result<bool> {
    let key = xml.keyring.select_key(&xml.da2).cloned();

    let signature = match key {
        Some(key) => {
            info!("[Obscura] Using SLA key '{}'", key.name);
            let dev_info = get_dev_info(xml).await?;
            xml.signer.sign(&key, &dev_info.rnd)?
        }
        None => {
            warn!("No valid SLA key found, using dummy auth...");
            vec![0u8; SLA_SIGNATURE_LEN]
        }
    };

    let accepted = handle_sla(xml, &signature).await?;
    if !accepted {
        warn!("SLA key wasn't accepted");
    }
    Ok(accepted)
}

/// Asks the loader for a faster USB link. `false` if it can't.
pub async fn change_usb_speed(xml: &mut Xml) -> Result<bool> {
    match xmlcmd!(xml, CanHigherUsbSpeed).await {
        Ok(CommandResult::Upload(req)) => {
            let reply = xml.download(&req).await?;
            xml.end_bracket().await?;
            debug!("USB speed reply: {}", String::from_utf8_lossy(&reply));
            Ok(true)
        }
        Ok(_) => Ok(true),
        Err(Error::Xml(e)) if e.kind == XmlErrorKind::UnsupportedCmd || e.message.contains("Unsupported") => {
            debug!("Higher USB speed unsupported");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
