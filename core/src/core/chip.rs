/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/

/// SoC specific addresses the loader can't report by itself.
/// A missing address disables whatever depends on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChipConfig {
    /// Efuse controller base, handed to the extension.
    pub efuse_addr: Option<u32>,
    /// Where the MEID lives. Without it the RPMB key is never pushed.
    pub meid_addr: Option<u32>,
}

impl ChipConfig {
    pub fn new(efuse_addr: Option<u32>, meid_addr: Option<u32>) -> Self {
        ChipConfig { efuse_addr, meid_addr }
    }
}
