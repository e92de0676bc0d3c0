//! CFA/FP opcode vocabulary and register-address resolution (§4.3).
//!
//! Numeric values for `UNWIND_OPCODE_BASE_*`/`UNWIND_OPCODEF_DEREF`/
//! `UNWIND_DEREF_MASK` are not enumerated in the retained source files (they
//! live in a stack-delta-types header that was filtered out of the
//! `original_source` pack); the layout below is a documented, internally
//! self-consistent reconstruction — see DESIGN.md.

/// Low 3 bits of `opcode`/`fpOpcode`: which register the expression is based on.
pub const UNWIND_OPCODE_BASE_CFA: u8 = 0;
pub const UNWIND_OPCODE_BASE_FP: u8 = 1;
pub const UNWIND_OPCODE_BASE_SP: u8 = 2;
pub const UNWIND_OPCODE_BASE_LR: u8 = 3;
pub const UNWIND_OPCODE_BASE_MASK: u8 = 0x07;

/// High bit of `opcode`/`fpOpcode`: the base register must be dereferenced.
pub const UNWIND_OPCODEF_DEREF: u8 = 0x80;

/// Low 7 bits of `param`, after the base offset is applied, select how many
/// bytes to skip before the final 8-byte load (deref happens at
/// `base + pre_deref_param`, then `param>>7`'s remainder is added post-deref).
pub const UNWIND_DEREF_MASK: i32 = 0x7F;
pub const UNWIND_DEREF_MULTIPLIER: i32 = 8;

/// High bit of `mergeOpcode`: `addrLow` threshold comparisons run in the
/// negative direction (delta decreases towards the match).
pub const MERGEOPCODE_NEGATIVE: u8 = 0x80;
pub const MERGEOPCODE_ADDR_MASK: u8 = 0x7F;

/// The live CPU register set an unwind step can read from, abstracted so
/// both the x86-64 and aarch64 native unwinders share one resolver.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegisterFile {
    pub cfa: u64,
    pub fp: u64,
    pub sp: u64,
    pub lr: u64,
}

impl RegisterFile {
    const fn base_value(self, base: u8) -> Option<u64> {
        Some(match base & UNWIND_OPCODE_BASE_MASK {
            UNWIND_OPCODE_BASE_CFA => self.cfa,
            UNWIND_OPCODE_BASE_FP => self.fp,
            UNWIND_OPCODE_BASE_SP => self.sp,
            UNWIND_OPCODE_BASE_LR => self.lr,
            _ => return None,
        })
    }
}

/// Resolve a CFA/FP opcode expression against a register file and a memory
/// reader, mirroring `native_stack_trace.ebpf.c`'s `unwind_register_address`.
/// `read_u64` reads 8 bytes from a (possibly userspace) address.
pub fn unwind_register_address<E>(
    regs: RegisterFile,
    opcode: u8,
    param: i32,
    mut read_u64: impl FnMut(u64) -> Result<u64, E>,
) -> Result<Option<u64>, E> {
    let Some(base) = regs.base_value(opcode) else {
        return Ok(None);
    };

    if opcode & UNWIND_OPCODEF_DEREF == 0 {
        return Ok(Some(base.wrapping_add(param as i64 as u64)));
    }

    let pre_deref_offset = (param & !UNWIND_DEREF_MASK) as i64;
    let post_deref = i64::from((param & UNWIND_DEREF_MASK) * UNWIND_DEREF_MULTIPLIER);
    let deref_addr = base.wrapping_add(pre_deref_offset as u64);
    let value = read_u64(deref_addr)?;
    Ok(Some(value.wrapping_add(post_deref as u64)))
}

/// Apply the stack-delta merge adjustment: when `mergeOpcode`'s high bit is
/// set, the threshold comparison runs "negative" (the stored addrLow is an
/// upper bound rather than a lower one).
pub const fn merge_opcode_threshold(merge_opcode: u8) -> (bool, u8) {
    (merge_opcode & MERGEOPCODE_NEGATIVE != 0, merge_opcode & MERGEOPCODE_ADDR_MASK)
}

/// Nudge `param` by the stack-delta merge adjustment (§4.3): when
/// `merge_opcode` is non-zero and `offset - addr_low` has reached the
/// encoded threshold, `param` shifts by 8 in the direction the high bit of
/// `merge_opcode` names. Used identically for CFA and FP recovery — both
/// consult the same `merge_opcode` field.
pub const fn apply_merge_adjustment(merge_opcode: u8, offset: u16, addr_low: u16, param: i32) -> i32 {
    if merge_opcode == 0 {
        return param;
    }
    let (negative, threshold) = merge_opcode_threshold(merge_opcode);
    if offset.wrapping_sub(addr_low) >= threshold as u16 {
        if negative {
            param - 8
        } else {
            param + 8
        }
    } else {
        param
    }
}
