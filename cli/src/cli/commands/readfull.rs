/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use clap::Args;
use obscura::Device;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::cli::MtkCommand;
use crate::cli::common::{CommandMetadata, DaArgs};
use crate::cli::progress::ObscuraProgress;
use crate::cli::state::PersistedDeviceState;

#[derive(Args, Debug)]
pub struct ReadFullArgs {
    #[command(flatten)]
    pub da: DaArgs,
    /// The destination file
    pub output_file: PathBuf,
}

impl CommandMetadata for ReadFullArgs {
    fn about() -> &'static str {
        "Dump the whole user area to a file."
    }
}

#[async_trait]
impl MtkCommand for ReadFullArgs {
    fn da(&self) -> &DaArgs {
        &self.da
    }

    async fn run(&self, dev: &mut Device, _state: &mut PersistedDeviceState) -> Result<()> {
        dev.enter_da_mode().await?;

        let size = dev.get_storage().await?.flash_size();
        let pb = ObscuraProgress::new(size);
        let mut progress = pb.callback("Reading flash", "Dump complete!");

        let file = File::create(&self.output_file).await?;
        let mut writer = BufWriter::new(file);

        if let Err(e) = dev.read_user_area(&mut writer, &mut progress).await {
            pb.abandon("Dump failed!");
            return Err(e.into());
        }
        writer.flush().await?;

        Ok(())
    }
}
