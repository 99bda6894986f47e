/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod arm;
pub mod patching;
pub mod xml;

/// Reads a little endian u16 at `$off`. Panics on out of bounds, like slicing.
#[macro_export]
macro_rules! le_u16 {
    ($buf:expr, $off:expr) => {{
        let b = &$buf;
        let o = $off as usize;
        u16::from_le_bytes([b[o], b[o + 1]])
    }};
}

#[macro_export]
macro_rules! le_u32 {
    ($buf:expr, $off:expr) => {{
        let b = &$buf;
        let o = $off as usize;
        u32::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]])
    }};
}

#[macro_export]
macro_rules! le_u64 {
    ($buf:expr, $off:expr) => {{
        let b = &$buf;
        let o = $off as usize;
        u64::from_le_bytes([
            b[o],
            b[o + 1],
            b[o + 2],
            b[o + 3],
            b[o + 4],
            b[o + 5],
            b[o + 6],
            b[o + 7],
        ])
    }};
}
