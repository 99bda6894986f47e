/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use anyhow::Result;
use async_trait::async_trait;
use clap::{Args, ValueEnum};
use log::{info, warn};
use obscura::{BootMode, Device};

use crate::cli::MtkCommand;
use crate::cli::common::{CommandMetadata, DaArgs};
use crate::cli::state::PersistedDeviceState;

#[derive(Debug, ValueEnum, Clone, Copy)]
pub enum RebootAction {
    Normal,
    HomeScreen,
    Fastboot,
    Meta,
    Test,
}

impl From<RebootAction> for BootMode {
    fn from(action: RebootAction) -> Self {
        match action {
            RebootAction::Normal => BootMode::Normal,
            RebootAction::HomeScreen => BootMode::HomeScreen,
            RebootAction::Fastboot => BootMode::Fastboot,
            RebootAction::Test => BootMode::Test,
            RebootAction::Meta => BootMode::Meta,
        }
    }
}

#[derive(Args, Debug)]
pub struct RebootArgs {
    #[command(flatten)]
    pub da: DaArgs,
    /// Mode to boot into
    #[arg(value_enum, default_value_t = RebootAction::Normal)]
    pub mode: RebootAction,
}

impl CommandMetadata for RebootArgs {
    fn about() -> &'static str {
        "Reboot the device into a specified mode."
    }

    fn long_about() -> &'static str {
        "Reboot the device into a specified mode. Fastboot, Meta and Test are
        set through the loader before rebooting."
    }
}

#[async_trait]
impl MtkCommand for RebootArgs {
    fn da(&self) -> &DaArgs {
        &self.da
    }

    async fn run(&self, dev: &mut Device, _state: &mut PersistedDeviceState) -> Result<()> {
        dev.enter_da_mode().await?;

        if dev.reboot(self.mode.into()).await? {
            info!("Rebooting into {:?} mode", self.mode);
        } else {
            warn!("The loader refused to reboot");
        }
        Ok(())
    }
}
