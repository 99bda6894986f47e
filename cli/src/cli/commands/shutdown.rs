/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use anyhow::Result;
use async_trait::async_trait;
use clap::Args;
use log::{info, warn};
use obscura::Device;

use crate::cli::MtkCommand;
use crate::cli::common::{CommandMetadata, DaArgs};
use crate::cli::state::PersistedDeviceState;

#[derive(Args, Debug)]
pub struct ShutdownArgs {
    #[command(flatten)]
    pub da: DaArgs,
}

impl CommandMetadata for ShutdownArgs {
    fn about() -> &'static str {
        "Release the device and let it power off."
    }
}

#[async_trait]
impl MtkCommand for ShutdownArgs {
    fn da(&self) -> &DaArgs {
        &self.da
    }

    async fn run(&self, dev: &mut Device, _state: &mut PersistedDeviceState) -> Result<()> {
        dev.enter_da_mode().await?;

        if dev.shutdown().await? {
            info!("Device disconnected");
        } else {
            warn!("The loader refused to shut down");
        }
        Ok(())
    }
}
