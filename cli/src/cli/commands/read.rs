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
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::cli::MtkCommand;
use crate::cli::common::{CommandMetadata, DaArgs};
use crate::cli::progress::ObscuraProgress;
use crate::cli::state::PersistedDeviceState;

#[derive(Args, Debug)]
pub struct ReadArgs {
    #[command(flatten)]
    pub da: DaArgs,
    /// The partition to read
    pub partition: String,
    /// The destination file
    pub output_file: PathBuf,
}

impl CommandMetadata for ReadArgs {
    fn visible_aliases() -> &'static [&'static str] {
        &["r"]
    }

    fn about() -> &'static str {
        "Read a partition from the device and save it to a file."
    }

    fn long_about() -> &'static str {
        "Read a specified partition from the device and save it to a file with the given output filename."
    }
}

#[async_trait]
impl MtkCommand for ReadArgs {
    fn da(&self) -> &DaArgs {
        &self.da
    }

    async fn run(&self, dev: &mut Device, _state: &mut PersistedDeviceState) -> Result<()> {
        dev.enter_da_mode().await?;

        let Some(partition) = dev.dev_info.get_partition(&self.partition).await else {
            anyhow::bail!("Partition '{}' not found on device.", self.partition);
        };

        let sector_size = dev.get_storage().await?.sector_size() as u64;
        let pb = ObscuraProgress::new(partition.sector_count * sector_size);
        let mut progress = pb.callback("Reading flash", "Read complete!");

        let file = File::create(&self.output_file).await?;
        let mut writer = BufWriter::new(file);

        if let Err(e) = dev.read_partition(&self.partition, &mut writer, &mut progress).await {
            pb.abandon("Read failed!");
            return Err(e.into());
        }
        writer.flush().await?;

        info!("Saved '{}' to {}", self.partition, self.output_file.display());
        Ok(())
    }
}
