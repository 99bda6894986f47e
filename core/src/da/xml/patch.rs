/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use log::{info, warn};

use crate::da::dafile::{compute_hash_pos, fix_hash};
use crate::error::{Error, Result};
use crate::le_u16;
use crate::le_u32;
use crate::utilities::arm::{offset_to_op_mov, op_mov_to_offset};
use crate::utilities::patching::{
    PatchOutcome,
    PatchRule,
    find_bytes,
    find_pattern,
    patch,
    patch_bytes,
    rfind_bytes,
};

/// `mov r0, #0; bx lr`
const RETURN_ZERO: &str = "0000A0E31EFF2FE1";

/// Modulus of a key we hold the private part of, spliced in place of the vendor one.
const SLA_MODULUS: &str = "9BB734774443D77557A76E24B10733787750D90D09C869CD606D54F28978EA6220DC9948B3C9E89284F8551D6166F3754B6A3B890AC9CDA9E37DFAA0C1317E351CE5107C4273795949C6CCE638314AB1A345385D7642CB8D055A1F410C7D7E24A6F0A2AAB8184E773D21B3754A947541680F2C1A8D6BA5BEFD3B6E1FC28EC0B61D55B1454383F2C3E8BD27170A25978608F6788B90A2FC34F0CE35056BF7520795C8C60232CBBC0B0399367AF937869CA45CF737A8A066127893E93166C433298DD6FD009E6790E743B3392ACA8EA99F61DFC77BD99416DDA4B8A9D7E4DA24217427F3584119A4932016F1735CC63B12650FDDDA73C8FCFBC79E058F36219D3D";
const SLA_MODULUS_LEN: usize = 0x100;

/// Jumps through the extension entry point, see `boot_extensions`.
///
/// ```text
/// push  {r4-r6, r10, r11, lr}
/// add   r11, sp, #0x10
/// mov   r8, r0
/// movw  r0, #0xF000 ; movt r0, #0x6800
/// mov   r1, #4
/// ldr   r2, [r8] ; blx r2
/// movw  r0, #0xF000 ; movt r0, #0x6800
/// movw  r0, #0x0000 ; movt r0, #0x6800
/// ldr   r2, [r8] ; blx r2
/// movw  r0, #0x0000 ; movt r0, #0x6800
/// blx   r0
/// pop   {r4-r6, r10, r11, pc}
/// ```
const CUSTOM_THUNK: &str = "704c2de910b08de20080a0e100000fe3000846e30410a0e3002098e532ff2fe100000fe3000846e3000000e3000846e3002098e532ff2fe1000000e3000846e330ff2fe1708cbde8";

fn rewrite_register_access(data: &mut [u8], idx: usize) -> Result<()> {
    // The bl moves one instruction down
    let offset = le_u16!(data, idx + 0xC).wrapping_sub(1);

    let mut code = hex::decode("0000A0E30410A0E12C220EE3002044E3").map_err(|e| Error::obscura(e.to_string()))?;
    code.extend_from_slice(&offset.to_le_bytes());
    code.extend_from_slice(&[0x00, 0xEB]);
    patch_bytes(data, idx, &code)
}

fn rewrite_write_allow(data: &mut [u8], idx: usize) -> Result<()> {
    let start = idx.checked_sub(1).ok_or_else(|| Error::obscura("Write allow match at offset 0"))?;
    // mov r0, #1; bx lr, three times
    patch(data, start, &"0100A0E31EFF2FE1".repeat(3))
}

fn rewrite_hash_binding(data: &mut [u8], idx: usize) -> Result<()> {
    patch(data, idx, "0010A0E3001080E5")
}

fn rewrite_return_zero(data: &mut [u8], idx: usize) -> Result<()> {
    patch(data, idx, RETURN_ZERO)
}

/// Lifts the range checks of `read_register`/`write_register`.
const REGISTER_ACCESS: PatchRule = PatchRule {
    name: "read_register / write_register",
    signature: "0000A0E3 0410A0E1 0020A0E3 XXXX00EB 014000E3",
    rewrite: rewrite_register_access,
    all_matches: true,
};

const WRITE_ALLOW: PatchRule = PatchRule {
    name: "write partitions / allow_read / allow_write",
    signature: "00A0E31EFF2FE1XX 00A0E31EFF2FE1XX 00A0E31EFF2FE1 704C",
    rewrite: rewrite_write_allow,
    all_matches: false,
};

const HASH_BINDING: PatchRule = PatchRule {
    name: "hash binding",
    signature: "0110A0E3001080E5",
    rewrite: rewrite_hash_binding,
    all_matches: false,
};

/// Vendor remote SLA checks, tried in order.
const VENDOR_SLA: [PatchRule; 3] = [
    PatchRule {
        name: "Infinix remote SLA",
        signature: "30482DE908B08DE220D04DE20150A0E1",
        rewrite: rewrite_return_zero,
        all_matches: false,
    },
    PatchRule {
        name: "Oppo remote SLA",
        signature: "704C2DE910B08DE20060A0E10206A0E3",
        rewrite: rewrite_return_zero,
        all_matches: false,
    },
    PatchRule {
        name: "Vivo remote SLA",
        signature: "F04D2DE918B08DE282DF4DE20160A0E138190FE30070A0E1420F8DE2",
        rewrite: rewrite_return_zero,
        all_matches: false,
    },
];

const OPPO_ALLOWANCE: &str = "03000000FFFFFFFF0000000001000000";

/// What the SLA step of the DA2 patch pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaPatchOutcome {
    /// A vendor check was turned into a `return 0`.
    Vendor(&'static str),
    /// The modulus before the last `01 00 01 00` exponent was replaced.
    GenericExponent,
    /// The modulus before the hex alphabet table was replaced.
    GenericAlphabet,
    /// Nothing to hook, SLA stays enforced.
    AnchorNotFound,
}

fn apply_rule(rule: &PatchRule, data: &mut [u8]) -> bool {
    match rule.apply(data) {
        PatchOutcome::Applied(sites) => {
            info!("[Obscura] Patched {} ({} site(s))", rule.name, sites.len());
            true
        }
        PatchOutcome::Skipped => {
            warn!("{} not patched", rule.name);
            false
        }
    }
}

/// Replaces `SLA_MODULUS_LEN` bytes right before `anchor`.
fn splice_modulus(data: &mut [u8], anchor: usize) -> bool {
    let Some(start) = anchor.checked_sub(SLA_MODULUS_LEN) else {
        return false;
    };
    patch(data, start, SLA_MODULUS).is_ok()
}

pub fn patch_sla(data: &mut [u8]) -> SlaPatchOutcome {
    for (i, rule) in VENDOR_SLA.iter().enumerate() {
        if !rule.apply(data).applied() {
            continue;
        }
        info!("[Obscura] Patched {}", rule.name);

        // Oppo loaders also gate the flash policy on an allowance flag
        if i == 1
            && let Some(idx) = find_pattern(data, OPPO_ALLOWANCE, 0)
            && patch(data, idx, "FF000000").is_ok()
        {
            info!("[Obscura] Patched Oppo allowance flag");
        }
        return SlaPatchOutcome::Vendor(rule.name);
    }

    if let Some(idx) = rfind_bytes(data, &[0x01, 0x00, 0x01, 0x00])
        && splice_modulus(data, idx)
    {
        info!("[Obscura] Replaced SLA public key");
        return SlaPatchOutcome::GenericExponent;
    }

    if let Some(idx) = find_bytes(data, b"0123456789ABCDEF0123456789abcdef", 0)
        && splice_modulus(data, idx)
    {
        info!("[Obscura] Replaced SLA public key");
        return SlaPatchOutcome::GenericAlphabet;
    }

    warn!("SLA authentication not patched");
    SlaPatchOutcome::AnchorNotFound
}

/// Turns the `CMD:SET-HOST-INFO` handler into a `CMD:CUSTOM` one that jumps into
/// the extension. `da2addr` is the DA2 load address.
pub fn patch_command(data: &mut [u8], da2addr: u32) -> bool {
    let Some(idx) = find_bytes(data, b"\0CMD:SET-HOST-INFO\0", 0) else {
        warn!("SET-HOST-INFO command string not found");
        return false;
    };

    // The string is loaded with movw r0 / movt r0, the handler with movw r2 / movt r2 right after
    let (first, second) = offset_to_op_mov(idx as u32 + 1, 0, da2addr);
    let Some(midx) = find_bytes(data, &first.to_le_bytes(), 0) else {
        warn!("SET-HOST-INFO registration not found");
        return false;
    };
    let Some(midx2) = find_bytes(data, &second.to_le_bytes(), midx) else {
        warn!("SET-HOST-INFO registration not found");
        return false;
    };
    if midx + 8 != midx2 || midx2 + 8 > data.len() {
        warn!("SET-HOST-INFO registration has an unexpected layout");
        return false;
    }

    let Some(addr) = op_mov_to_offset(le_u32!(data, midx + 4), le_u32!(data, midx2 + 4), 2, da2addr) else {
        warn!("SET-HOST-INFO handler isn't loaded through r2");
        return false;
    };

    if let Err(e) = patch(data, addr as usize, CUSTOM_THUNK) {
        warn!("Couldn't place the CMD:CUSTOM thunk: {e}");
        return false;
    }
    if let Err(e) = patch_bytes(data, idx + 1, b"CMD:CUSTOM\0") {
        warn!("Couldn't rename SET-HOST-INFO: {e}");
        return false;
    }

    info!("[Obscura] Hooked SET-HOST-INFO as CMD:CUSTOM at 0x{:X}", addr);
    true
}

/// Runs every DA2 patch over the same buffer, in order. Each step is independent,
/// a miss is logged and skipped.
pub fn patch_da2(data: &mut [u8], da2addr: u32) -> SlaPatchOutcome {
    info!("[Obscura] Patching DA2...");

    apply_rule(&REGISTER_ACCESS, data);
    patch_command(data, da2addr);
    apply_rule(&WRITE_ALLOW, data);
    apply_rule(&HASH_BINDING, data);

    patch_sla(data)
}

/// Patches DA2 and rewrites its digest in DA1. Nothing is touched when DA1
/// doesn't hold a digest of DA2, and `false` is returned.
pub fn patch_da(
    da1: &mut [u8],
    da2: &mut [u8],
    da1_sig_len: usize,
    da2_sig_len: usize,
    v6: bool,
    da2addr: u32,
) -> bool {
    let Some(pos) = compute_hash_pos(da1, da2, da1_sig_len, da2_sig_len, v6) else {
        return false;
    };

    patch_da2(da2, da2addr);
    if let Err(e) = fix_hash(da1, da2, &pos) {
        warn!("Couldn't fix the DA2 hash: {e}");
        return false;
    }

    info!("[Obscura] DA2 hash fixed at 0x{:X} ({:?})", pos.offset, pos.mode);
    true
}
