/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/

/// Preloader / BROM commands needed before the loader runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    JumpDa = 0xD5,
    SendDa = 0xD7,
    GetTargetConfig = 0xD8,
    GetMeId = 0xE1,
    GetSocId = 0xE7,
    GetHwCode = 0xFD,
}
