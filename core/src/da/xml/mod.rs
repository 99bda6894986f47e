/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
#[macro_use]
mod macros;
pub mod cmds;
mod da_protocol;
#[cfg(not(feature = "no_exploits"))]
mod exts;
mod flash;
#[cfg(not(feature = "no_exploits"))]
mod patch;
pub mod result;
#[cfg(not(feature = "no_exploits"))]
mod rpmb;
#[cfg(not(feature = "no_exploits"))]
mod sec;
mod sla;
mod storage;
mod xml_lib;

#[cfg(not(feature = "no_exploits"))]
pub use patch::SlaPatchOutcome;
pub use xml_lib::{Xml, XmlOptions};

#[cfg(test)]
pub(crate) use xml_lib::tests;
