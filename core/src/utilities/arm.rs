/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Encoding and decoding of the ARM (A32) `MOVW`/`MOVT` pairs used by the
//! loader to materialize 32 bit addresses.

const MOVW: u32 = 0xE300_0000;
const MOVT_FLAG: u32 = 4 << 20;

fn encode_imm16(imm: u32, reg: u32) -> u32 {
    let imm = imm & 0xFFFF;
    (((imm >> 12) & 0xF) << 16) | ((reg & 0xF) << 12) | (imm & 0xFFF)
}

/// Builds the `MOVW reg, #lo` / `MOVT reg, #hi` pair loading `addr + base` into `reg`.
pub fn offset_to_op_mov(addr: u32, reg: u32, base: u32) -> (u32, u32) {
    let offset = addr.wrapping_add(base);
    let low = encode_imm16(offset, reg);
    let high = encode_imm16(offset >> 16, reg) | MOVT_FLAG;
    (MOVW + low, MOVW + high)
}

const OPCODE_MASK: u32 = 0x0FF0_0000;

/// Register and shifted immediate of a `MOVW` or `MOVT`, `None` for any other word.
fn decode_mov(op: u32) -> Option<(u32, u32)> {
    let shift = match op & OPCODE_MASK {
        0x0300_0000 => 0,
        0x0340_0000 => 16,
        _ => return None,
    };
    let reg = (op >> 12) & 0xF;
    let imm = ((op & 0xF0000) >> 4) | (op & 0xFFF);
    Some((reg, imm << shift))
}

/// Recovers the address loaded into `reg` by a `MOVW`/`MOVT` pair, minus `base`.
/// Returns `None` if either word is not a `MOVW`/`MOVT` or targets another register.
pub fn op_mov_to_offset(first: u32, second: u32, reg: u32, base: u32) -> Option<u32> {
    let (reg_lo, lo) = decode_mov(first)?;
    let (reg_hi, hi) = decode_mov(second)?;

    if reg_lo != reg || reg_hi != reg {
        return None;
    }

    Some((hi | lo).wrapping_sub(base))
}
