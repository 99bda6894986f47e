/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use clap_num::maybe_hex;
use obscura::{ChipConfig, SlaKey, SlaKeyring};
use serde::Deserialize;

#[derive(Args, Debug)]
pub struct DaArgs {
    /// The DA file to use. Defaults to the last one used.
    #[arg(short, long = "da", value_name = "DA_FILE", global = true)]
    pub da_file: Option<PathBuf>,
    /// The preloader file to use, source of the RPMB key seed
    #[arg(short, long = "pl", value_name = "PRELOADER_FILE", global = true)]
    pub preloader_file: Option<PathBuf>,
    /// DA extension payload, needed for RPMB and memory access
    #[arg(short, long = "ext", value_name = "EXTENSION_FILE", global = true)]
    pub extension_file: Option<PathBuf>,
    /// JSON list of SLA keys (`[{"name", "n", "d"}]`). No SLA keys are built in,
    /// without this file SLA protected loaders only get a dummy signature.
    #[arg(long, value_name = "KEYS_FILE", global = true)]
    pub sla_keys: Option<PathBuf>,
    /// Patch the loader even if secure boot is off
    #[arg(long, global = true)]
    pub patch: bool,
    /// Efuse base of the SoC
    #[arg(long, value_parser = maybe_hex::<u32>, global = true)]
    pub efuse_addr: Option<u32>,
    /// MEID register of the SoC
    #[arg(long, value_parser = maybe_hex::<u32>, global = true)]
    pub meid_addr: Option<u32>,
}

impl DaArgs {
    pub fn chip_config(&self) -> ChipConfig {
        ChipConfig::new(self.efuse_addr, self.meid_addr)
    }
}

#[derive(Deserialize, Debug)]
struct KeyEntry {
    name: String,
    n: String,
    d: String,
}

pub async fn load_keyring(path: &Path) -> Result<SlaKeyring> {
    let json = tokio::fs::read(path).await?;
    let entries: Vec<KeyEntry> =
        serde_json::from_slice(&json).with_context(|| format!("Invalid SLA key file {}", path.display()))?;

    Ok(SlaKeyring::new(entries.into_iter().map(|k| SlaKey::new(k.name, k.n, k.d)).collect()))
}

/// A trait for providing metadata for CLI commands.
pub trait CommandMetadata {
    fn aliases() -> &'static [&'static str] {
        &[]
    }
    fn visible_aliases() -> &'static [&'static str] {
        &[]
    }
    fn about() -> &'static str {
        ""
    }
    fn long_about() -> &'static str {
        ""
    }
    fn hide() -> bool {
        false
    }
}
