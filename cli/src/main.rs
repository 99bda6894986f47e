/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
mod cli;
mod logger;

use anyhow::Result;
use clap::Parser;
use cli::{CliArgs, run_cli};
use logger::init_logger;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    init_logger(args.verbose);

    run_cli(&args).await
}
