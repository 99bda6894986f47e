/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use anyhow::Result;
use async_trait::async_trait;
use clap::Args;
use clap_num::maybe_hex;
#[cfg(not(feature = "no_exploits"))]
use log::info;
use obscura::Device;

use crate::cli::MtkCommand;
use crate::cli::common::{CommandMetadata, DaArgs};
use crate::cli::state::PersistedDeviceState;

#[derive(Args, Debug)]
pub struct EfuseArgs {
    #[command(flatten)]
    pub da: DaArgs,
    /// Offsets from the efuse base (--efuse-addr) to read
    #[arg(value_parser = maybe_hex::<u32>)]
    pub offsets: Vec<u32>,
    /// Also read the public key hash
    #[arg(long)]
    pub pubk: bool,
}

impl CommandMetadata for EfuseArgs {
    fn about() -> &'static str {
        "Read efuse words and the public key hash."
    }

    fn long_about() -> &'static str {
        "Read efuse words relative to the efuse base given with --efuse-addr.
        Reads go through the DA extension when it is loaded."
    }
}

#[cfg(not(feature = "no_exploits"))]
#[async_trait]
impl MtkCommand for EfuseArgs {
    fn da(&self) -> &DaArgs {
        &self.da
    }

    async fn run(&self, dev: &mut Device, _state: &mut PersistedDeviceState) -> Result<()> {
        if self.offsets.is_empty() && !self.pubk {
            anyhow::bail!("Nothing to read, give efuse offsets or --pubk");
        }
        dev.enter_da_mode().await?;

        let words = dev.read_fuses(&self.offsets).await?;
        for (offset, word) in self.offsets.iter().zip(words) {
            info!("Efuse +0x{offset:03X}: 0x{word:08X}");
        }

        if self.pubk {
            let pubk = dev.read_pubk().await?;
            info!("Public key hash: {}", hex::encode_upper(pubk));
        }

        Ok(())
    }
}

#[cfg(feature = "no_exploits")]
#[async_trait]
impl MtkCommand for EfuseArgs {
    fn da(&self) -> &DaArgs {
        &self.da
    }

    async fn run(&self, _dev: &mut Device, _state: &mut PersistedDeviceState) -> Result<()> {
        anyhow::bail!("Efuse reads are not available in this build")
    }
}
