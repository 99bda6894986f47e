/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod dafile;
pub mod protocol;
pub mod xml;

pub use dafile::{DA, DAEntryRegion, DAFile, DAType, HashMode, HashPos, compute_hash_pos, fix_hash};
pub use protocol::{BootMode, DAProtocol};
pub use xml::{Xml, XmlOptions};
