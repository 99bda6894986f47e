/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use anyhow::Result;
use async_trait::async_trait;
use clap::{Args, Subcommand};
#[cfg(not(feature = "no_exploits"))]
use log::info;
use obscura::Device;
#[cfg(not(feature = "no_exploits"))]
use obscura::LockFlag;

use crate::cli::MtkCommand;
use crate::cli::common::{CommandMetadata, DaArgs};
#[cfg(not(feature = "no_exploits"))]
use crate::cli::progress::ObscuraProgress;
use crate::cli::state::PersistedDeviceState;

#[derive(Subcommand, Debug, Clone, Copy)]
pub enum SeccfgAction {
    Unlock,
    Lock,
}

#[derive(Args, Debug)]
pub struct SeccfgArgs {
    #[command(flatten)]
    pub da: DaArgs,
    #[command(subcommand)]
    pub action: SeccfgAction,
}

impl CommandMetadata for SeccfgArgs {
    fn about() -> &'static str {
        "Lock or unlock the bootloader through the seccfg partition."
    }

    fn long_about() -> &'static str {
        "Rewrite the seccfg partition with a new lock state. The hash it carries is
        encrypted by the SoC crypto engine, so a crypto engine for this SoC is required."
    }
}

#[cfg(not(feature = "no_exploits"))]
#[async_trait]
impl MtkCommand for SeccfgArgs {
    fn da(&self) -> &DaArgs {
        &self.da
    }

    async fn run(&self, dev: &mut Device, _state: &mut PersistedDeviceState) -> Result<()> {
        dev.enter_da_mode().await?;

        let flag = match self.action {
            SeccfgAction::Unlock => LockFlag::Unlock,
            SeccfgAction::Lock => LockFlag::Lock,
        };
        info!("Setting seccfg to {flag:?}...");

        let pb = ObscuraProgress::new(0);
        let mut progress = |done: usize, total: usize| {
            pb.set_length(total as u64);
            pb.update(done as u64, "Writing seccfg");
        };
        if let Err(e) = dev.set_seccfg_lock_state(flag, &mut progress).await {
            pb.abandon("Seccfg not changed!");
            return Err(e.into());
        }
        pb.finish("Seccfg written!");

        Ok(())
    }
}

#[cfg(feature = "no_exploits")]
#[async_trait]
impl MtkCommand for SeccfgArgs {
    fn da(&self) -> &DaArgs {
        &self.da
    }

    async fn run(&self, _dev: &mut Device, _state: &mut PersistedDeviceState) -> Result<()> {
        anyhow::bail!("Changing the lock state is not available in this build")
    }
}
