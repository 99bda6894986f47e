/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use clap::{Args, Subcommand};
use clap_num::maybe_hex;
use obscura::Device;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::cli::MtkCommand;
use crate::cli::common::{CommandMetadata, DaArgs};
use crate::cli::progress::ObscuraProgress;
use crate::cli::state::PersistedDeviceState;

const RPMB_FRAME_LEN: u64 = 0x100;

#[derive(Subcommand, Debug)]
pub enum RpmbAction {
    /// Dump RPMB sectors to a file
    Read {
        output_file: PathBuf,
        #[arg(long, default_value_t = 0, value_parser = maybe_hex::<u32>)]
        sector: u32,
        /// Sectors to read, the whole RPMB if not given
        #[arg(long, value_parser = maybe_hex::<u32>)]
        count: Option<u32>,
    },
    /// Write a file of 256 byte frames to RPMB
    Write {
        input_file: PathBuf,
        #[arg(long, default_value_t = 0, value_parser = maybe_hex::<u32>)]
        sector: u32,
    },
    /// Zero RPMB sectors
    Erase {
        #[arg(long, default_value_t = 0, value_parser = maybe_hex::<u32>)]
        sector: u32,
        #[arg(long, value_parser = maybe_hex::<u32>)]
        count: Option<u32>,
    },
}

#[derive(Args, Debug)]
pub struct RpmbArgs {
    #[command(flatten)]
    pub da: DaArgs,
    #[command(subcommand)]
    pub action: RpmbAction,
}

impl CommandMetadata for RpmbArgs {
    fn about() -> &'static str {
        "Read, write or erase the RPMB partition."
    }

    fn long_about() -> &'static str {
        "Access the RPMB partition sector by sector. Needs the DA extension (--ext) and
        a preloader (--pl) the RPMB key can be derived from."
    }
}

#[cfg(not(feature = "no_exploits"))]
#[async_trait]
impl MtkCommand for RpmbArgs {
    fn da(&self) -> &DaArgs {
        &self.da
    }

    async fn run(&self, dev: &mut Device, _state: &mut PersistedDeviceState) -> Result<()> {
        dev.enter_da_mode().await?;

        match &self.action {
            RpmbAction::Read { output_file, sector, count } => {
                let pb = ObscuraProgress::new(count.map_or(0, |c| c as u64 * RPMB_FRAME_LEN));
                let mut progress = |done: usize, total: usize| {
                    pb.set_length(total as u64);
                    pb.update(done as u64, "Reading RPMB");
                };

                let file = File::create(output_file).await?;
                let mut writer = BufWriter::new(file);
                if let Err(e) = dev.read_rpmb(*sector, *count, &mut writer, &mut progress).await {
                    pb.abandon("RPMB read failed!");
                    return Err(e.into());
                }
                writer.flush().await?;
                pb.finish("RPMB read complete!");
            }
            RpmbAction::Write { input_file, sector } => {
                let data = tokio::fs::read(input_file).await?;
                let pb = ObscuraProgress::new(data.len() as u64);
                let mut progress = pb.callback("Writing RPMB", "RPMB write complete!");

                if let Err(e) = dev.write_rpmb(*sector, &data, &mut progress).await {
                    pb.abandon("RPMB write failed!");
                    return Err(e.into());
                }
            }
            RpmbAction::Erase { sector, count } => {
                let pb = ObscuraProgress::new(count.map_or(0, |c| c as u64 * RPMB_FRAME_LEN));
                let mut progress = |done: usize, total: usize| {
                    pb.set_length(total as u64);
                    pb.update(done as u64, "Erasing RPMB");
                };

                if let Err(e) = dev.erase_rpmb(*sector, *count, &mut progress).await {
                    pb.abandon("RPMB erase failed!");
                    return Err(e.into());
                }
                pb.finish("RPMB erase complete!");
            }
        }

        Ok(())
    }
}

#[cfg(feature = "no_exploits")]
#[async_trait]
impl MtkCommand for RpmbArgs {
    fn da(&self) -> &DaArgs {
        &self.da
    }

    async fn run(&self, _dev: &mut Device, _state: &mut PersistedDeviceState) -> Result<()> {
        anyhow::bail!("RPMB access is not available in this build")
    }
}
