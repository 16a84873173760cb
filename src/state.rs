//! Guest machine state.
//!
//! `State` is the architectural register file plus the one-shot exit channel
//! through which a block (interpreted or native) tells the dispatcher why it
//! returned. The struct is `#[repr(C)]` because compiled blocks receive a
//! raw pointer to it: the layout must byte-match the `state_t` declaration
//! in the generated C prologue (see `codegen`).

use crate::registers::{GpReg, NUM_FP_REGS, NUM_GP_REGS};

/// Why a block stopped executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExitReason {
    /// No exit recorded yet. Cleared by the dispatcher before every block
    /// entry; a block that returns with this value violates the protocol.
    None = 0,
    /// A taken branch or JAL; `reenter_pc` is the statically known target.
    DirectBranch = 1,
    /// A JALR; `reenter_pc` was computed from a register.
    IndirectBranch = 2,
    /// An ECALL; `reenter_pc` is the following instruction.
    Ecall = 3,
}

/// One floating-point register slot.
///
/// Mirrors the C union the generated code uses (`v`/`w`/`d`/`f` views of the
/// same 64 bits). Writes through the 32-bit views leave the upper half of
/// the slot untouched; only [`FpRegister::set_boxed_f32`] (the FLW path)
/// fills it with the NaN-box pattern.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct FpRegister {
    bits: u64,
}

impl FpRegister {
    /// Raw 64-bit contents.
    #[inline]
    pub fn v(self) -> u64 {
        self.bits
    }

    /// Low 32 bits.
    #[inline]
    pub fn w(self) -> u32 {
        self.bits as u32
    }

    /// Low 32 bits as a single-precision float.
    #[inline]
    pub fn f32(self) -> f32 {
        f32::from_bits(self.bits as u32)
    }

    /// All 64 bits as a double-precision float.
    #[inline]
    pub fn f64(self) -> f64 {
        f64::from_bits(self.bits)
    }

    #[inline]
    pub fn set_v(&mut self, val: u64) {
        self.bits = val;
    }

    /// Write the low 32 bits, preserving the high half.
    #[inline]
    pub fn set_w(&mut self, val: u32) {
        self.bits = (self.bits & 0xffff_ffff_0000_0000) | u64::from(val);
    }

    #[inline]
    pub fn set_f32(&mut self, val: f32) {
        self.set_w(val.to_bits());
    }

    #[inline]
    pub fn set_f64(&mut self, val: f64) {
        self.bits = val.to_bits();
    }

    /// NaN-box a single-precision value: low 32 bits hold it, the high 32
    /// bits are all-ones.
    #[inline]
    pub fn set_boxed_f32(&mut self, raw: u32) {
        self.bits = u64::from(raw) | 0xffff_ffff_0000_0000;
    }
}

/// Architectural guest state shared between the interpreter, compiled
/// blocks, and the dispatcher.
///
/// Field order is load-bearing: compiled blocks address this layout.
#[repr(C)]
pub struct State {
    /// Exit channel, written by every block before it returns.
    pub exit_reason: ExitReason,
    /// Guest pc to resume at, valid whenever `exit_reason` is set.
    pub reenter_pc: u64,
    /// x0..x31. Index 0 is wired to zero: the interpreter clears it after
    /// every step and the emitter elides writes to it.
    pub gp_regs: [u64; NUM_GP_REGS],
    /// f0..f31.
    pub fp_regs: [FpRegister; NUM_FP_REGS],
    /// Current guest program counter (block entry).
    pub pc: u64,
    /// Floating-point control/status register. Storage only; arithmetic
    /// uses the host rounding mode.
    pub fcsr: u32,
}

impl State {
    pub fn new() -> Self {
        State {
            exit_reason: ExitReason::None,
            reenter_pc: 0,
            gp_regs: [0; NUM_GP_REGS],
            fp_regs: [FpRegister::default(); NUM_FP_REGS],
            pc: 0,
            fcsr: 0,
        }
    }

    /// Read a general-purpose register by ABI name.
    #[inline]
    pub fn gp_reg(&self, reg: GpReg) -> u64 {
        self.gp_regs[reg as usize]
    }

    /// Write a general-purpose register by ABI name. Writes to `zero` are
    /// discarded.
    #[inline]
    pub fn set_gp_reg(&mut self, reg: GpReg, val: u64) {
        if reg != GpReg::Zero {
            self.gp_regs[reg as usize] = val;
        }
    }
}

impl Default for State {
    fn default() -> Self {
        State::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn test_layout_matches_generated_prologue() {
        // The generated C declares: enum (4) + pad, u64, u64[32],
        // union[32], u64, u32. Any drift here breaks native blocks.
        assert_eq!(offset_of!(State, reenter_pc), 8);
        assert_eq!(offset_of!(State, gp_regs), 16);
        assert_eq!(offset_of!(State, fp_regs), 16 + 32 * 8);
        assert_eq!(offset_of!(State, pc), 16 + 64 * 8);
        assert_eq!(offset_of!(State, fcsr), 16 + 65 * 8);
        assert_eq!(size_of::<FpRegister>(), 8);
    }

    #[test]
    fn test_zero_register_is_wired() {
        let mut state = State::new();
        state.set_gp_reg(GpReg::Zero, 0xdead);
        assert_eq!(state.gp_reg(GpReg::Zero), 0);
        state.set_gp_reg(GpReg::A0, 42);
        assert_eq!(state.gp_reg(GpReg::A0), 42);
    }

    #[test]
    fn test_fp_register_union_views() {
        let mut f = FpRegister::default();
        f.set_v(0x1122_3344_5566_7788);
        assert_eq!(f.w(), 0x5566_7788);

        // A 32-bit write must leave the upper half alone.
        f.set_w(0xaabb_ccdd);
        assert_eq!(f.v(), 0x1122_3344_aabb_ccdd);

        // The FLW path boxes instead.
        f.set_boxed_f32(1.5f32.to_bits());
        assert_eq!(f.v() >> 32, 0xffff_ffff);
        assert_eq!(f.f32(), 1.5);
    }
}
