/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
mod efuse;
mod erase;
mod peek;
mod printgpt;
mod read;
mod readfull;
mod reboot;
mod rpmb;
mod seccfg;
mod shutdown;
mod write;

pub use efuse::EfuseArgs;
pub use erase::EraseArgs;
pub use peek::PeekArgs;
pub use printgpt::PrintGptArgs;
pub use read::ReadArgs;
pub use readfull::ReadFullArgs;
pub use reboot::RebootArgs;
pub use rpmb::RpmbArgs;
pub use seccfg::{SeccfgAction, SeccfgArgs};
pub use shutdown::ShutdownArgs;
pub use write::WriteArgs;
