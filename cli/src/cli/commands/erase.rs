/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use anyhow::Result;
use async_trait::async_trait;
use clap::Args;
use log::info;
use obscura::Device;

use crate::cli::MtkCommand;
use crate::cli::common::{CommandMetadata, DaArgs};
use crate::cli::state::PersistedDeviceState;

#[derive(Args, Debug)]
pub struct EraseArgs {
    #[command(flatten)]
    pub da: DaArgs,
    /// The partition to erase
    pub partition: String,
}

impl CommandMetadata for EraseArgs {
    fn visible_aliases() -> &'static [&'static str] {
        &["e"]
    }

    fn about() -> &'static str {
        "Erase a partition of the device."
    }
}

#[async_trait]
impl MtkCommand for EraseArgs {
    fn da(&self) -> &DaArgs {
        &self.da
    }

    async fn run(&self, dev: &mut Device, _state: &mut PersistedDeviceState) -> Result<()> {
        dev.enter_da_mode().await?;
        dev.erase_partition(&self.partition).await?;

        info!("Erased '{}'", self.partition);
        Ok(())
    }
}
