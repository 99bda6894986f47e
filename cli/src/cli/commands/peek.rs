/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use clap::Args;
use clap_num::maybe_hex;
use obscura::Device;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::cli::MtkCommand;
use crate::cli::common::{CommandMetadata, DaArgs};
use crate::cli::progress::ObscuraProgress;
use crate::cli::state::PersistedDeviceState;

#[derive(Args, Debug)]
pub struct PeekArgs {
    #[command(flatten)]
    pub da: DaArgs,
    /// Start address
    #[arg(value_parser = maybe_hex::<u32>)]
    pub address: u32,
    /// Number of bytes to read
    #[arg(value_parser = maybe_hex::<usize>)]
    pub length: usize,
    /// The destination file
    pub output_file: PathBuf,
}

impl CommandMetadata for PeekArgs {
    fn about() -> &'static str {
        "Dump device memory to a file."
    }

    fn long_about() -> &'static str {
        "Read device memory through the DA extension and save it to a file."
    }
}

#[cfg(not(feature = "no_exploits"))]
#[async_trait]
impl MtkCommand for PeekArgs {
    fn da(&self) -> &DaArgs {
        &self.da
    }

    async fn run(&self, dev: &mut Device, _state: &mut PersistedDeviceState) -> Result<()> {
        dev.enter_da_mode().await?;

        let pb = ObscuraProgress::new(self.length as u64);
        let mut progress = pb.callback("Reading memory", "Peek complete!");

        let file = File::create(&self.output_file).await?;
        let mut writer = BufWriter::new(file);

        if let Err(e) = dev.peek(self.address, self.length, &mut writer, &mut progress).await {
            pb.abandon("Peek failed!");
            return Err(e.into());
        }
        writer.flush().await?;

        Ok(())
    }
}

#[cfg(feature = "no_exploits")]
#[async_trait]
impl MtkCommand for PeekArgs {
    fn da(&self) -> &DaArgs {
        &self.da
    }

    async fn run(&self, _dev: &mut Device, _state: &mut PersistedDeviceState) -> Result<()> {
        anyhow::bail!("Memory access is not available in this build")
    }
}
