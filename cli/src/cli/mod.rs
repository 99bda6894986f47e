/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
mod commands;
mod common;
mod macros;
mod progress;
mod state;

use anyhow::Result;
use async_trait::async_trait;
use clap::{CommandFactory, Parser};
use log::{info, warn};
use obscura::{Device, DeviceBuilder, find_mtk_port};
use tokio::fs::read;
use tokio::time::{Duration, sleep};

use crate::cli::commands::*;
use crate::cli::common::DaArgs;
use crate::cli::macros::mtk_commands;
use crate::cli::state::PersistedDeviceState;

/// Time between two port scans while waiting for the device.
const PORT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CliArgs {
    /// Enable verbose logging, including debug information
    #[arg(short, long, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Option<Commands>,
}

mtk_commands! {
    Printgpt(PrintGptArgs),
    Read(ReadArgs),
    Write(WriteArgs),
    Erase(EraseArgs),
    Rf(ReadFullArgs),
    Rpmb(RpmbArgs),
    Peek(PeekArgs),
    Seccfg(SeccfgArgs),
    Efuse(EfuseArgs),
    Reboot(RebootArgs),
    Shutdown(ShutdownArgs),
}

#[async_trait]
pub trait MtkCommand {
    fn da(&self) -> &DaArgs;
    async fn run(&self, dev: &mut Device, state: &mut PersistedDeviceState) -> Result<()>;
}

async fn build_device(da: &DaArgs, state: &mut PersistedDeviceState) -> Result<Device> {
    let da_path = match (&da.da_file, &state.da_file_path) {
        (Some(path), _) => path.clone(),
        (None, Some(path)) => path.into(),
        (None, None) => anyhow::bail!("No DA file given, use --da"),
    };
    let da_data = read(&da_path).await?;
    state.da_file_path = Some(da_path.to_string_lossy().to_string());

    info!("Waiting for MTK device...");
    let mtk_port = loop {
        if let Some(port) = find_mtk_port().await {
            info!("Found MTK port: {}", port.get_port_name());
            break port;
        }
        sleep(PORT_POLL_INTERVAL).await;
    };

    let mut builder = DeviceBuilder::default()
        .with_mtk_port(mtk_port)
        .with_da_data(da_data)
        .with_chip_config(da.chip_config())
        .with_patch(da.patch);

    if let Some(path) = &da.preloader_file {
        builder = builder.with_preloader(read(path).await?);
    }
    if let Some(path) = &da.extension_file {
        builder = builder.with_extension(read(path).await?);
    }
    match &da.sla_keys {
        Some(path) => builder = builder.with_keyring(common::load_keyring(path).await?),
        None => warn!("No SLA key file given, SLA will be answered with a dummy signature"),
    }

    Ok(builder.build()?)
}

pub async fn run_cli(args: &CliArgs) -> Result<()> {
    let Some(cmd) = &args.command else {
        CliArgs::command().print_help()?;
        return Ok(());
    };

    let mut state = PersistedDeviceState::load().await;
    let mut dev = build_device(cmd.da(), &mut state).await?;

    info!("Initializing device...");
    dev.init().await?;

    state.soc_id = dev.dev_info.soc_id().await;
    state.meid = dev.dev_info.meid().await;
    state.hw_code = dev.dev_info.hw_code().await;
    state.target_config = dev.dev_info.target_config().await;
    state.save().await?;

    info!("=====================================");
    info!("HW code: 0x{:04X}", state.hw_code);
    info!("MEID: {}", hex::encode_upper(&state.meid));
    info!("SBC: {}", (state.target_config & 0x1) != 0);
    info!("SLA: {}", (state.target_config & 0x2) != 0);
    info!("DAA: {}", (state.target_config & 0x4) != 0);
    info!("=====================================");

    cmd.run(&mut dev, &mut state).await?;
    state.save().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyring_help_says_none_are_built_in() {
        let mut cmd = CliArgs::command();
        cmd.build();
        let read = cmd.find_subcommand_mut("read").unwrap();
        let help = read.render_long_help().to_string();
        assert!(help.contains("--sla-keys"));
        assert!(help.contains("No SLA keys are built in"));
    }

    #[test]
    fn seccfg_and_efuse_arguments() {
        let args = CliArgs::try_parse_from(["obscura", "seccfg", "unlock"]).unwrap();
        assert!(matches!(args.command, Some(Commands::Seccfg(SeccfgArgs { action: SeccfgAction::Unlock, .. }))));

        let args = CliArgs::try_parse_from(["obscura", "efuse", "0x20", "96", "--pubk"]).unwrap();
        let Some(Commands::Efuse(efuse)) = args.command else { panic!("not an efuse command") };
        assert_eq!(efuse.offsets, [0x20, 96]);
        assert!(efuse.pubk);
    }

    #[test]
    fn keyring_is_optional() {
        let args = CliArgs::try_parse_from(["obscura", "read", "boot", "boot.img"]).unwrap();
        assert!(args.command.unwrap().da().sla_keys.is_none());
    }
}
