/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use anyhow::Result;
use async_trait::async_trait;
use clap::Args;
use human_bytes::human_bytes;
use log::info;
use obscura::Device;

use crate::cli::MtkCommand;
use crate::cli::common::{CommandMetadata, DaArgs};
use crate::cli::state::PersistedDeviceState;

#[derive(Args, Debug)]
pub struct PrintGptArgs {
    #[command(flatten)]
    pub da: DaArgs,
    /// Physical partition holding the table (defaults to the user area)
    #[arg(long)]
    pub part: Option<String>,
}

impl CommandMetadata for PrintGptArgs {
    fn visible_aliases() -> &'static [&'static str] {
        &["pgpt"]
    }

    fn about() -> &'static str {
        "Print the partition table of the device."
    }
}

#[async_trait]
impl MtkCommand for PrintGptArgs {
    fn da(&self) -> &DaArgs {
        &self.da
    }

    async fn run(&self, dev: &mut Device, _state: &mut PersistedDeviceState) -> Result<()> {
        dev.enter_da_mode().await?;

        let storage = dev.get_storage().await?;
        info!("Storage: {} ({})", storage.kind(), human_bytes(storage.flash_size() as f64));

        let Some(table) = dev.get_gpt(self.part.as_deref()).await? else {
            anyhow::bail!("No partition table found");
        };

        println!("{table}");
        for entry in &table.entries {
            let (_, size) = table.span(entry);
            info!("{:<20} {}", entry.name, human_bytes(size as f64));
        }

        Ok(())
    }
}
