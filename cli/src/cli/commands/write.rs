/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use clap::Args;
use log::info;
use obscura::Device;
use tokio::fs::read;

use crate::cli::MtkCommand;
use crate::cli::common::{CommandMetadata, DaArgs};
use crate::cli::progress::ObscuraProgress;
use crate::cli::state::PersistedDeviceState;

#[derive(Args, Debug)]
pub struct WriteArgs {
    #[command(flatten)]
    pub da: DaArgs,
    /// The partition to write
    pub partition: String,
    /// The file to flash
    pub input_file: PathBuf,
}

impl CommandMetadata for WriteArgs {
    fn visible_aliases() -> &'static [&'static str] {
        &["w"]
    }

    fn about() -> &'static str {
        "Write a file to a partition of the device."
    }

    fn long_about() -> &'static str {
        "Write the given file to a partition. The file can't be larger than the partition."
    }
}

#[async_trait]
impl MtkCommand for WriteArgs {
    fn da(&self) -> &DaArgs {
        &self.da
    }

    async fn run(&self, dev: &mut Device, _state: &mut PersistedDeviceState) -> Result<()> {
        let data = read(&self.input_file).await?;
        dev.enter_da_mode().await?;

        let pb = ObscuraProgress::new(data.len() as u64);
        let mut progress = pb.callback("Writing flash", "Write complete!");

        if let Err(e) = dev.write_partition(&self.partition, &data, &mut progress).await {
            pb.abandon("Write failed!");
            return Err(e.into());
        }

        info!("Flashed {} to '{}'", self.input_file.display(), self.partition);
        Ok(())
    }
}
