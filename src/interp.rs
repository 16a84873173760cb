//! Block interpreter.
//!
//! [`exec_block`] is the semantic reference for guest execution: it decodes
//! and executes instructions starting at `state.pc` until the block ends
//! (a jump, environment call, fence, or a taken branch), leaving the exit
//! reason and re-entry pc in the state's exit channel. Compiled blocks must
//! produce bit-identical results, so every width, sign extension, and
//! division edge case here is mirrored in the C the emitter generates.
//!
//! The register `x0` is cleared after every step rather than guarded at
//! every write site.

use crate::decoder::decode;
use crate::error::{EmuError, Result};
use crate::instruction::{InstKind, Instruction};
use crate::mmu::{read_guest, write_guest};
use crate::state::{ExitReason, State};

/// Execute one basic block, starting at `state.pc`.
///
/// On return `state.exit_reason` is set and `state.reenter_pc` holds the
/// guest pc the dispatcher should continue from.
///
/// # Errors
///
/// Propagates decode failures, unsupported CSR accesses, and guest EBREAK;
/// all are fatal to the emulation.
pub fn exec_block(state: &mut State) -> Result<()> {
    loop {
        // SAFETY: pc points into the mapped guest image. For a trailing
        // 16-bit instruction the upper half of the fetch is ignored.
        let word = unsafe { read_guest::<u32>(state.pc) };
        let inst = decode(word)?;

        exec(state, &inst)?;
        state.gp_regs[0] = 0;

        if inst.cont || state.exit_reason != ExitReason::None {
            return Ok(());
        }
        state.pc += inst.length();
    }
}

/// Execute a single decoded instruction against `state`.
fn exec(state: &mut State, inst: &Instruction) -> Result<()> {
    let rd = inst.rd as usize;
    let rs1 = state.gp_regs[inst.rs1 as usize];
    let rs2 = state.gp_regs[inst.rs2 as usize];
    let imm = inst.imm as i64;
    let mem = rs1.wrapping_add(imm as u64);

    match inst.kind {
        // ── Loads ──
        InstKind::Lb => state.gp_regs[rd] = unsafe { read_guest::<i8>(mem) } as i64 as u64,
        InstKind::Lh => state.gp_regs[rd] = unsafe { read_guest::<i16>(mem) } as i64 as u64,
        InstKind::Lw => state.gp_regs[rd] = unsafe { read_guest::<i32>(mem) } as i64 as u64,
        InstKind::Ld => state.gp_regs[rd] = unsafe { read_guest::<u64>(mem) },
        InstKind::Lbu => state.gp_regs[rd] = unsafe { read_guest::<u8>(mem) } as u64,
        InstKind::Lhu => state.gp_regs[rd] = unsafe { read_guest::<u16>(mem) } as u64,
        InstKind::Lwu => state.gp_regs[rd] = unsafe { read_guest::<u32>(mem) } as u64,
        InstKind::Flw => {
            let raw = unsafe { read_guest::<u32>(mem) };
            state.fp_regs[rd].set_boxed_f32(raw);
        }
        InstKind::Fld => {
            let raw = unsafe { read_guest::<u64>(mem) };
            state.fp_regs[rd].set_v(raw);
        }

        // ── Stores ──
        InstKind::Sb => unsafe { write_guest::<u8>(mem, rs2 as u8) },
        InstKind::Sh => unsafe { write_guest::<u16>(mem, rs2 as u16) },
        InstKind::Sw => unsafe { write_guest::<u32>(mem, rs2 as u32) },
        InstKind::Sd => unsafe { write_guest::<u64>(mem, rs2) },
        InstKind::Fsw => unsafe { write_guest::<u32>(mem, state.fp_regs[inst.rs2 as usize].w()) },
        InstKind::Fsd => unsafe { write_guest::<u64>(mem, state.fp_regs[inst.rs2 as usize].v()) },

        // ── Register-immediate ALU ──
        InstKind::Addi => state.gp_regs[rd] = rs1.wrapping_add(imm as u64),
        InstKind::Slti => state.gp_regs[rd] = ((rs1 as i64) < imm) as u64,
        InstKind::Sltiu => state.gp_regs[rd] = (rs1 < imm as u64) as u64,
        InstKind::Xori => state.gp_regs[rd] = rs1 ^ imm as u64,
        InstKind::Ori => state.gp_regs[rd] = rs1 | imm as u64,
        InstKind::Andi => state.gp_regs[rd] = rs1 & imm as u64,
        InstKind::Slli => state.gp_regs[rd] = rs1 << (inst.imm & 0x3f),
        InstKind::Srli => state.gp_regs[rd] = rs1 >> (inst.imm & 0x3f),
        InstKind::Srai => state.gp_regs[rd] = ((rs1 as i64) >> (inst.imm & 0x3f)) as u64,
        InstKind::Addiw => {
            state.gp_regs[rd] = rs1.wrapping_add(imm as u64) as i32 as i64 as u64;
        }
        InstKind::Slliw => {
            state.gp_regs[rd] = ((rs1 as u32) << (inst.imm & 0x1f)) as i32 as i64 as u64;
        }
        InstKind::Srliw => {
            state.gp_regs[rd] = ((rs1 as u32) >> (inst.imm & 0x1f)) as i32 as i64 as u64;
        }
        InstKind::Sraiw => {
            state.gp_regs[rd] = ((rs1 as i32) >> (inst.imm & 0x1f)) as i64 as u64;
        }

        // ── Register-register ALU ──
        InstKind::Add => state.gp_regs[rd] = rs1.wrapping_add(rs2),
        InstKind::Sub => state.gp_regs[rd] = rs1.wrapping_sub(rs2),
        InstKind::Sll => state.gp_regs[rd] = rs1 << (rs2 & 0x3f),
        InstKind::Slt => state.gp_regs[rd] = ((rs1 as i64) < rs2 as i64) as u64,
        InstKind::Sltu => state.gp_regs[rd] = (rs1 < rs2) as u64,
        InstKind::Xor => state.gp_regs[rd] = rs1 ^ rs2,
        InstKind::Srl => state.gp_regs[rd] = rs1 >> (rs2 & 0x3f),
        InstKind::Sra => state.gp_regs[rd] = ((rs1 as i64) >> (rs2 & 0x3f)) as u64,
        InstKind::Or => state.gp_regs[rd] = rs1 | rs2,
        InstKind::And => state.gp_regs[rd] = rs1 & rs2,
        InstKind::Addw => state.gp_regs[rd] = rs1.wrapping_add(rs2) as i32 as i64 as u64,
        InstKind::Subw => state.gp_regs[rd] = rs1.wrapping_sub(rs2) as i32 as i64 as u64,
        InstKind::Sllw => {
            state.gp_regs[rd] = ((rs1 as u32) << (rs2 & 0x1f)) as i32 as i64 as u64;
        }
        InstKind::Srlw => {
            state.gp_regs[rd] = ((rs1 as u32) >> (rs2 & 0x1f)) as i32 as i64 as u64;
        }
        InstKind::Sraw => {
            state.gp_regs[rd] = ((rs1 as i32) >> (rs2 & 0x1f)) as i64 as u64;
        }

        // ── Multiply / divide ──
        InstKind::Mul => state.gp_regs[rd] = rs1.wrapping_mul(rs2),
        InstKind::Mulh => state.gp_regs[rd] = mulh(rs1 as i64, rs2 as i64) as u64,
        InstKind::Mulhsu => state.gp_regs[rd] = mulhsu(rs1 as i64, rs2) as u64,
        InstKind::Mulhu => state.gp_regs[rd] = mulhu(rs1, rs2),
        InstKind::Div => state.gp_regs[rd] = div(rs1 as i64, rs2 as i64),
        InstKind::Divu => state.gp_regs[rd] = divu(rs1, rs2),
        InstKind::Rem => state.gp_regs[rd] = rem(rs1 as i64, rs2 as i64),
        InstKind::Remu => state.gp_regs[rd] = remu(rs1, rs2),
        InstKind::Mulw => state.gp_regs[rd] = rs1.wrapping_mul(rs2) as i32 as i64 as u64,
        InstKind::Divw => state.gp_regs[rd] = divw(rs1 as i32, rs2 as i32),
        InstKind::Divuw => state.gp_regs[rd] = divuw(rs1 as u32, rs2 as u32),
        InstKind::Remw => state.gp_regs[rd] = remw(rs1 as i32, rs2 as i32),
        InstKind::Remuw => state.gp_regs[rd] = remuw(rs1 as u32, rs2 as u32),

        // ── Upper immediates ──
        InstKind::Lui => state.gp_regs[rd] = imm as u64,
        InstKind::Auipc => state.gp_regs[rd] = state.pc.wrapping_add(imm as u64),

        // ── Branches ──
        InstKind::Beq => branch(state, imm, rs1 == rs2),
        InstKind::Bne => branch(state, imm, rs1 != rs2),
        InstKind::Blt => branch(state, imm, (rs1 as i64) < rs2 as i64),
        InstKind::Bge => branch(state, imm, rs1 as i64 >= rs2 as i64),
        InstKind::Bltu => branch(state, imm, rs1 < rs2),
        InstKind::Bgeu => branch(state, imm, rs1 >= rs2),

        // ── Jumps ──
        InstKind::Jal => {
            state.gp_regs[rd] = state.pc + inst.length();
            state.reenter_pc = state.pc.wrapping_add(imm as u64);
            state.exit_reason = ExitReason::DirectBranch;
        }
        InstKind::Jalr => {
            let target = rs1.wrapping_add(imm as u64) & !1;
            state.gp_regs[rd] = state.pc + inst.length();
            state.reenter_pc = target;
            state.exit_reason = ExitReason::IndirectBranch;
        }

        // ── System ──
        InstKind::Ecall => {
            state.reenter_pc = state.pc + 4;
            state.exit_reason = ExitReason::Ecall;
        }
        InstKind::Ebreak => return Err(EmuError::Ebreak(state.pc)),
        InstKind::Fence | InstKind::FenceI => {
            // Single-threaded emulation: a fence only ends the block.
            state.reenter_pc = state.pc + 4;
            state.exit_reason = ExitReason::DirectBranch;
        }
        InstKind::Csrrw => {
            let old = csr_read(state, inst.csr)?;
            csr_write(state, inst.csr, rs1);
            state.gp_regs[rd] = old;
        }
        InstKind::Csrrs => {
            let old = csr_read(state, inst.csr)?;
            if inst.rs1 != 0 {
                csr_write(state, inst.csr, old | rs1);
            }
            state.gp_regs[rd] = old;
        }
        InstKind::Csrrc => {
            let old = csr_read(state, inst.csr)?;
            if inst.rs1 != 0 {
                csr_write(state, inst.csr, old & !rs1);
            }
            state.gp_regs[rd] = old;
        }
        InstKind::Csrrwi => {
            let old = csr_read(state, inst.csr)?;
            csr_write(state, inst.csr, u64::from(inst.rs1));
            state.gp_regs[rd] = old;
        }
        InstKind::Csrrsi => {
            let old = csr_read(state, inst.csr)?;
            if inst.rs1 != 0 {
                csr_write(state, inst.csr, old | u64::from(inst.rs1));
            }
            state.gp_regs[rd] = old;
        }
        InstKind::Csrrci => {
            let old = csr_read(state, inst.csr)?;
            if inst.rs1 != 0 {
                csr_write(state, inst.csr, old & !u64::from(inst.rs1));
            }
            state.gp_regs[rd] = old;
        }

        // ── Single-precision FP ──
        InstKind::FmaddS | InstKind::FmsubS | InstKind::FnmsubS | InstKind::FnmaddS => {
            let a = state.fp_regs[inst.rs1 as usize].f32();
            let b = state.fp_regs[inst.rs2 as usize].f32();
            let c = state.fp_regs[inst.rs3 as usize].f32();
            let val = match inst.kind {
                InstKind::FmaddS => a.mul_add(b, c),
                InstKind::FmsubS => a.mul_add(b, -c),
                InstKind::FnmsubS => (-a).mul_add(b, c),
                _ => (-a).mul_add(b, -c),
            };
            state.fp_regs[rd].set_f32(val);
        }
        InstKind::FaddS | InstKind::FsubS | InstKind::FmulS | InstKind::FdivS
        | InstKind::FminS | InstKind::FmaxS => {
            let a = state.fp_regs[inst.rs1 as usize].f32();
            let b = state.fp_regs[inst.rs2 as usize].f32();
            let val = match inst.kind {
                InstKind::FaddS => a + b,
                InstKind::FsubS => a - b,
                InstKind::FmulS => a * b,
                InstKind::FdivS => a / b,
                InstKind::FminS => a.min(b),
                _ => a.max(b),
            };
            state.fp_regs[rd].set_f32(val);
        }
        InstKind::FsqrtS => {
            let val = state.fp_regs[inst.rs1 as usize].f32().sqrt();
            state.fp_regs[rd].set_f32(val);
        }
        InstKind::FsgnjS | InstKind::FsgnjnS | InstKind::FsgnjxS => {
            let a = state.fp_regs[inst.rs1 as usize].w();
            let b = state.fp_regs[inst.rs2 as usize].w();
            let val = match inst.kind {
                InstKind::FsgnjS => fsgnj32(a, b, false, false),
                InstKind::FsgnjnS => fsgnj32(a, b, true, false),
                _ => fsgnj32(a, b, false, true),
            };
            state.fp_regs[rd].set_w(val);
        }
        InstKind::FcvtWS => {
            state.gp_regs[rd] = state.fp_regs[inst.rs1 as usize].f32() as i32 as i64 as u64;
        }
        InstKind::FcvtWuS => {
            state.gp_regs[rd] = state.fp_regs[inst.rs1 as usize].f32() as u32 as i32 as i64 as u64;
        }
        InstKind::FcvtLS => {
            state.gp_regs[rd] = state.fp_regs[inst.rs1 as usize].f32() as i64 as u64;
        }
        InstKind::FcvtLuS => {
            state.gp_regs[rd] = state.fp_regs[inst.rs1 as usize].f32() as u64;
        }
        InstKind::FcvtSW => {
            let val = rs1 as i32 as f32;
            state.fp_regs[rd].set_f32(val);
        }
        InstKind::FcvtSWu => {
            let val = rs1 as u32 as f32;
            state.fp_regs[rd].set_f32(val);
        }
        InstKind::FcvtSL => {
            let val = rs1 as i64 as f32;
            state.fp_regs[rd].set_f32(val);
        }
        InstKind::FcvtSLu => {
            let val = rs1 as f32;
            state.fp_regs[rd].set_f32(val);
        }
        InstKind::FmvXW => {
            state.gp_regs[rd] = state.fp_regs[inst.rs1 as usize].w() as i32 as i64 as u64;
        }
        InstKind::FmvWX => state.fp_regs[rd].set_w(rs1 as u32),
        InstKind::FeqS | InstKind::FltS | InstKind::FleS => {
            let a = state.fp_regs[inst.rs1 as usize].f32();
            let b = state.fp_regs[inst.rs2 as usize].f32();
            let val = match inst.kind {
                InstKind::FeqS => a == b,
                InstKind::FltS => a < b,
                _ => a <= b,
            };
            state.gp_regs[rd] = val as u64;
        }
        InstKind::FclassS => {
            state.gp_regs[rd] = fclass32(state.fp_regs[inst.rs1 as usize].w());
        }

        // ── Double-precision FP ──
        InstKind::FmaddD | InstKind::FmsubD | InstKind::FnmsubD | InstKind::FnmaddD => {
            let a = state.fp_regs[inst.rs1 as usize].f64();
            let b = state.fp_regs[inst.rs2 as usize].f64();
            let c = state.fp_regs[inst.rs3 as usize].f64();
            let val = match inst.kind {
                InstKind::FmaddD => a.mul_add(b, c),
                InstKind::FmsubD => a.mul_add(b, -c),
                InstKind::FnmsubD => (-a).mul_add(b, c),
                _ => (-a).mul_add(b, -c),
            };
            state.fp_regs[rd].set_f64(val);
        }
        InstKind::FaddD | InstKind::FsubD | InstKind::FmulD | InstKind::FdivD
        | InstKind::FminD | InstKind::FmaxD => {
            let a = state.fp_regs[inst.rs1 as usize].f64();
            let b = state.fp_regs[inst.rs2 as usize].f64();
            let val = match inst.kind {
                InstKind::FaddD => a + b,
                InstKind::FsubD => a - b,
                InstKind::FmulD => a * b,
                InstKind::FdivD => a / b,
                InstKind::FminD => a.min(b),
                _ => a.max(b),
            };
            state.fp_regs[rd].set_f64(val);
        }
        InstKind::FsqrtD => {
            let val = state.fp_regs[inst.rs1 as usize].f64().sqrt();
            state.fp_regs[rd].set_f64(val);
        }
        InstKind::FsgnjD | InstKind::FsgnjnD | InstKind::FsgnjxD => {
            let a = state.fp_regs[inst.rs1 as usize].v();
            let b = state.fp_regs[inst.rs2 as usize].v();
            let val = match inst.kind {
                InstKind::FsgnjD => fsgnj64(a, b, false, false),
                InstKind::FsgnjnD => fsgnj64(a, b, true, false),
                _ => fsgnj64(a, b, false, true),
            };
            state.fp_regs[rd].set_v(val);
        }
        InstKind::FcvtSD => {
            let val = state.fp_regs[inst.rs1 as usize].f64() as f32;
            state.fp_regs[rd].set_f32(val);
        }
        InstKind::FcvtDS => {
            let val = f64::from(state.fp_regs[inst.rs1 as usize].f32());
            state.fp_regs[rd].set_f64(val);
        }
        InstKind::FcvtWD => {
            state.gp_regs[rd] = state.fp_regs[inst.rs1 as usize].f64() as i32 as i64 as u64;
        }
        InstKind::FcvtWuD => {
            state.gp_regs[rd] = state.fp_regs[inst.rs1 as usize].f64() as u32 as i32 as i64 as u64;
        }
        InstKind::FcvtLD => {
            state.gp_regs[rd] = state.fp_regs[inst.rs1 as usize].f64() as i64 as u64;
        }
        InstKind::FcvtLuD => {
            state.gp_regs[rd] = state.fp_regs[inst.rs1 as usize].f64() as u64;
        }
        InstKind::FcvtDW => {
            let val = f64::from(rs1 as i32);
            state.fp_regs[rd].set_f64(val);
        }
        InstKind::FcvtDWu => {
            let val = f64::from(rs1 as u32);
            state.fp_regs[rd].set_f64(val);
        }
        InstKind::FcvtDL => {
            let val = rs1 as i64 as f64;
            state.fp_regs[rd].set_f64(val);
        }
        InstKind::FcvtDLu => {
            let val = rs1 as f64;
            state.fp_regs[rd].set_f64(val);
        }
        InstKind::FmvXD => state.gp_regs[rd] = state.fp_regs[inst.rs1 as usize].v(),
        InstKind::FmvDX => state.fp_regs[rd].set_v(rs1),
        InstKind::FeqD | InstKind::FltD | InstKind::FleD => {
            let a = state.fp_regs[inst.rs1 as usize].f64();
            let b = state.fp_regs[inst.rs2 as usize].f64();
            let val = match inst.kind {
                InstKind::FeqD => a == b,
                InstKind::FltD => a < b,
                _ => a <= b,
            };
            state.gp_regs[rd] = val as u64;
        }
        InstKind::FclassD => {
            state.gp_regs[rd] = fclass64(state.fp_regs[inst.rs1 as usize].v());
        }
    }

    Ok(())
}

#[inline]
fn branch(state: &mut State, imm: i64, taken: bool) {
    if taken {
        state.reenter_pc = state.pc.wrapping_add(imm as u64);
        state.exit_reason = ExitReason::DirectBranch;
    }
}

// ── CSR file ──
//
// Only the floating-point CSRs exist; `fflags` and `frm` are views into
// `fcsr`.

const CSR_FFLAGS: u16 = 0x001;
const CSR_FRM: u16 = 0x002;
const CSR_FCSR: u16 = 0x003;

fn csr_read(state: &State, csr: u16) -> Result<u64> {
    match csr {
        CSR_FFLAGS => Ok(u64::from(state.fcsr & 0x1f)),
        CSR_FRM => Ok(u64::from((state.fcsr >> 5) & 0x7)),
        CSR_FCSR => Ok(u64::from(state.fcsr & 0xff)),
        _ => Err(EmuError::UnsupportedCsr(csr)),
    }
}

fn csr_write(state: &mut State, csr: u16, val: u64) {
    let val = val as u32;
    match csr {
        CSR_FFLAGS => state.fcsr = (state.fcsr & !0x1f) | (val & 0x1f),
        CSR_FRM => state.fcsr = (state.fcsr & !0xe0) | ((val & 0x7) << 5),
        CSR_FCSR => state.fcsr = val & 0xff,
        // csr_read already rejected anything else.
        _ => unreachable!(),
    }
}

// ── Arithmetic helpers ──
//
// The generated C carries inline twins of these; the two sets must agree
// bit for bit.

/// High 64 bits of the unsigned 128-bit product.
pub(crate) fn mulhu(a: u64, b: u64) -> u64 {
    ((u128::from(a) * u128::from(b)) >> 64) as u64
}

/// High 64 bits of the signed 128-bit product.
pub(crate) fn mulh(a: i64, b: i64) -> i64 {
    ((i128::from(a) * i128::from(b)) >> 64) as i64
}

/// High 64 bits of the signed-by-unsigned 128-bit product.
pub(crate) fn mulhsu(a: i64, b: u64) -> i64 {
    ((i128::from(a) * i128::from(b)) >> 64) as i64
}

pub(crate) fn div(a: i64, b: i64) -> u64 {
    if b == 0 {
        u64::MAX
    } else {
        // wrapping_div folds the i64::MIN / -1 overflow to i64::MIN.
        a.wrapping_div(b) as u64
    }
}

pub(crate) fn divu(a: u64, b: u64) -> u64 {
    if b == 0 {
        u64::MAX
    } else {
        a / b
    }
}

pub(crate) fn rem(a: i64, b: i64) -> u64 {
    if b == 0 {
        a as u64
    } else {
        a.wrapping_rem(b) as u64
    }
}

pub(crate) fn remu(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        a % b
    }
}

pub(crate) fn divw(a: i32, b: i32) -> u64 {
    if b == 0 {
        u64::MAX
    } else {
        a.wrapping_div(b) as i64 as u64
    }
}

pub(crate) fn divuw(a: u32, b: u32) -> u64 {
    if b == 0 {
        u64::MAX
    } else {
        (a / b) as i32 as i64 as u64
    }
}

pub(crate) fn remw(a: i32, b: i32) -> u64 {
    if b == 0 {
        a as i64 as u64
    } else {
        a.wrapping_rem(b) as i64 as u64
    }
}

pub(crate) fn remuw(a: u32, b: u32) -> u64 {
    if b == 0 {
        a as i32 as i64 as u64
    } else {
        (a % b) as i32 as i64 as u64
    }
}

const F32_SIGN: u32 = 1 << 31;
const F64_SIGN: u64 = 1 << 63;

/// Compose the magnitude of `a` with a sign derived from `b` (optionally
/// negated or xored with `a`'s own sign).
pub(crate) fn fsgnj32(a: u32, b: u32, neg: bool, xor: bool) -> u32 {
    let v = if xor {
        a
    } else if neg {
        F32_SIGN
    } else {
        0
    };
    (a & !F32_SIGN) | ((v ^ b) & F32_SIGN)
}

pub(crate) fn fsgnj64(a: u64, b: u64, neg: bool, xor: bool) -> u64 {
    let v = if xor {
        a
    } else if neg {
        F64_SIGN
    } else {
        0
    };
    (a & !F64_SIGN) | ((v ^ b) & F64_SIGN)
}

/// RISC-V 10-bit classification mask for a single-precision value.
pub(crate) fn fclass32(a: u32) -> u64 {
    let sign = a >> 31 != 0;
    let exp = (a >> 23) & 0xff;
    let frac = a & 0x007f_ffff;
    let bit = if exp == 0xff {
        if frac == 0 {
            if sign {
                0
            } else {
                7
            }
        } else if frac & 0x0040_0000 != 0 {
            9
        } else {
            8
        }
    } else if exp == 0 {
        match (sign, frac == 0) {
            (true, true) => 3,
            (true, false) => 2,
            (false, true) => 4,
            (false, false) => 5,
        }
    } else if sign {
        1
    } else {
        6
    };
    1 << bit
}

/// RISC-V 10-bit classification mask for a double-precision value.
pub(crate) fn fclass64(a: u64) -> u64 {
    let sign = a >> 63 != 0;
    let exp = (a >> 52) & 0x7ff;
    let frac = a & 0x000f_ffff_ffff_ffff;
    let bit = if exp == 0x7ff {
        if frac == 0 {
            if sign {
                0
            } else {
                7
            }
        } else if frac & 0x0008_0000_0000_0000 != 0 {
            9
        } else {
            8
        }
    } else if exp == 0 {
        match (sign, frac == 0) {
            (true, true) => 3,
            (true, false) => 2,
            (false, true) => 4,
            (false, false) => 5,
        }
    } else if sign {
        1
    } else {
        6
    };
    1 << bit
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu;

    /// Map one anonymous RW page of guest memory at `addr`. Each test uses
    /// its own guest page so tests stay independent.
    fn map_guest_page(addr: u64) {
        let ret = unsafe {
            libc::mmap(
                mmu::to_host(addr) as *mut libc::c_void,
                4096,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        assert!(ret != libc::MAP_FAILED);
    }

    fn store_code(addr: u64, words: &[u32]) {
        for (i, word) in words.iter().enumerate() {
            unsafe { mmu::write_guest(addr + i as u64 * 4, *word) };
        }
    }

    #[test]
    fn test_add_then_return() {
        // add a0, a1, a2 ; jalr x0, 0(ra)
        map_guest_page(0x1000);
        store_code(0x1000, &[0x00c5_8533, 0x0000_8067]);

        let mut state = State::new();
        state.pc = 0x1000;
        state.gp_regs[11] = 5;
        state.gp_regs[12] = 7;
        state.gp_regs[1] = 0x2000;

        exec_block(&mut state).unwrap();

        assert_eq!(state.gp_regs[10], 12);
        assert_eq!(state.exit_reason, ExitReason::IndirectBranch);
        assert_eq!(state.reenter_pc, 0x2000);
    }

    #[test]
    fn test_countdown_loop() {
        // addi a0, a0, -1 ; bne a0, x0, -4 ; ecall
        map_guest_page(0x3000);
        store_code(0x3000, &[0xfff5_0513, 0xfe05_1ee3, 0x0000_0073]);

        let mut state = State::new();
        state.pc = 0x3000;
        state.gp_regs[10] = 5;

        let mut taken = 0;
        loop {
            state.exit_reason = ExitReason::None;
            exec_block(&mut state).unwrap();
            match state.exit_reason {
                ExitReason::DirectBranch => {
                    taken += 1;
                    state.pc = state.reenter_pc;
                }
                ExitReason::Ecall => break,
                other => panic!("unexpected exit: {other:?}"),
            }
        }

        // Five decrements, four taken back-edges, then the fall-through.
        assert_eq!(taken, 4);
        assert_eq!(state.gp_regs[10], 0);
        assert_eq!(state.reenter_pc, 0x300c);
    }

    #[test]
    fn test_zero_register_stays_zero() {
        // addi x0, x0, 5 ; ecall
        map_guest_page(0x4000);
        store_code(0x4000, &[0x0050_0013, 0x0000_0073]);

        let mut state = State::new();
        state.pc = 0x4000;
        exec_block(&mut state).unwrap();
        assert_eq!(state.gp_regs[0], 0);
    }

    #[test]
    fn test_division_edge_cases() {
        assert_eq!(div(i64::MIN, -1), i64::MIN as u64);
        assert_eq!(div(7, 0), u64::MAX);
        assert_eq!(divu(7, 0), u64::MAX);
        assert_eq!(rem(i64::MIN, -1), 0);
        assert_eq!(rem(7, 0), 7);
        assert_eq!(remu(7, 0), 7);

        assert_eq!(divw(i32::MIN, -1), i32::MIN as i64 as u64);
        assert_eq!(divw(1, 0), u64::MAX);
        assert_eq!(divuw(u32::MAX, 0), u64::MAX);
        assert_eq!(remw(i32::MIN, -1), 0);
        assert_eq!(remuw(0x8000_0001, 0), 0x8000_0001u32 as i32 as i64 as u64);
    }

    #[test]
    fn test_widening_multiply() {
        assert_eq!(mulh(i64::MIN, i64::MIN), 1 << 62);
        assert_eq!(mulh(-1, -1), 0);
        assert_eq!(mulhu(u64::MAX, u64::MAX), u64::MAX - 1);
        assert_eq!(mulhsu(-1, u64::MAX), -1);
        assert_eq!(mulhsu(1, u64::MAX), 0);
    }

    #[test]
    fn test_compressed_matches_base() {
        // c.addi sp, -32 against addi sp, sp, -32
        let c = crate::decoder::decode(0x0000_1101).unwrap();
        let full = crate::decoder::decode(0xfe01_0113).unwrap();

        let mut a = State::new();
        let mut b = State::new();
        a.gp_regs[2] = 0x8000;
        b.gp_regs[2] = 0x8000;

        exec(&mut a, &c).unwrap();
        exec(&mut b, &full).unwrap();
        assert_eq!(a.gp_regs[2], b.gp_regs[2]);

        // c.mv a0, a1 against add a0, x0, a1
        let c = crate::decoder::decode(0x0000_852e).unwrap();
        let full = crate::decoder::decode(0x00b0_0533).unwrap();
        a.gp_regs[11] = 0x1234;
        b.gp_regs[11] = 0x1234;
        exec(&mut a, &c).unwrap();
        exec(&mut b, &full).unwrap();
        assert_eq!(a.gp_regs[10], b.gp_regs[10]);
    }

    #[test]
    fn test_flw_nan_boxes_and_fsw_roundtrips() {
        map_guest_page(0x5000);
        let raw = 1.5f32.to_bits();
        unsafe { mmu::write_guest(0x5000u64, raw) };

        let mut state = State::new();
        state.gp_regs[5] = 0x5000;

        // flw fa0, 0(t0)
        let mut flw = crate::instruction::Instruction::new(InstKind::Flw);
        flw.rd = 10;
        flw.rs1 = 5;
        exec(&mut state, &flw).unwrap();
        assert_eq!(state.fp_regs[10].v() >> 32, 0xffff_ffff);
        assert_eq!(state.fp_regs[10].f32(), 1.5);

        // fsw fa0, 8(t0)
        let mut fsw = crate::instruction::Instruction::new(InstKind::Fsw);
        fsw.rs1 = 5;
        fsw.rs2 = 10;
        fsw.imm = 8;
        exec(&mut state, &fsw).unwrap();
        let stored: u32 = unsafe { mmu::read_guest(0x5008) };
        assert_eq!(stored, raw);
    }

    #[test]
    fn test_fclass_masks() {
        assert_eq!(fclass64(f64::NEG_INFINITY.to_bits()), 1 << 0);
        assert_eq!(fclass64((-1.0f64).to_bits()), 1 << 1);
        assert_eq!(fclass64((-0.0f64).to_bits()), 1 << 3);
        assert_eq!(fclass64(0.0f64.to_bits()), 1 << 4);
        assert_eq!(fclass64(2.5f64.to_bits()), 1 << 6);
        assert_eq!(fclass64(f64::INFINITY.to_bits()), 1 << 7);
        assert_eq!(fclass64(f64::NAN.to_bits()), 1 << 9);

        assert_eq!(fclass32(1.0f32.to_bits()), 1 << 6);
        assert_eq!(fclass32(f32::NAN.to_bits()), 1 << 9);
        // Smallest positive subnormal.
        assert_eq!(fclass32(1), 1 << 5);
    }

    #[test]
    fn test_fsgnj() {
        let a = 1.5f32.to_bits();
        let b = (-2.0f32).to_bits();
        assert_eq!(fsgnj32(a, b, false, false), (-1.5f32).to_bits());
        assert_eq!(fsgnj32(a, b, true, false), 1.5f32.to_bits());
        assert_eq!(fsgnj32(a, a, false, true), 1.5f32.to_bits());
        assert_eq!(fsgnj64(2.0f64.to_bits(), (-1.0f64).to_bits(), false, false),
                   (-2.0f64).to_bits());
    }

    #[test]
    fn test_csr_views_of_fcsr() {
        let mut state = State::new();

        let mut csrrwi = crate::instruction::Instruction::new(InstKind::Csrrwi);
        csrrwi.csr = 0x003;
        csrrwi.rs1 = 0x1f; // zimm
        csrrwi.rd = 10;
        exec(&mut state, &csrrwi).unwrap();
        assert_eq!(state.gp_regs[10], 0);
        assert_eq!(state.fcsr, 0x1f);

        // frm reads bits 7:5.
        state.fcsr = 0b101_00000;
        let mut csrrs = crate::instruction::Instruction::new(InstKind::Csrrs);
        csrrs.csr = 0x002;
        csrrs.rd = 11;
        exec(&mut state, &csrrs).unwrap();
        assert_eq!(state.gp_regs[11], 0b101);

        // Unknown CSRs are fatal.
        let mut bad = crate::instruction::Instruction::new(InstKind::Csrrw);
        bad.csr = 0xc00;
        assert!(exec(&mut state, &bad).is_err());
    }

    #[test]
    fn test_w_ops_sign_extend() {
        let mut state = State::new();
        state.gp_regs[11] = 0x7fff_ffff;
        state.gp_regs[12] = 1;

        let mut addw = crate::instruction::Instruction::new(InstKind::Addw);
        addw.rd = 10;
        addw.rs1 = 11;
        addw.rs2 = 12;
        exec(&mut state, &addw).unwrap();
        assert_eq!(state.gp_regs[10], 0xffff_ffff_8000_0000);

        let mut srliw = crate::instruction::Instruction::new(InstKind::Srliw);
        srliw.rd = 10;
        srliw.rs1 = 10;
        srliw.imm = 0;
        exec(&mut state, &srliw).unwrap();
        assert_eq!(state.gp_regs[10], 0xffff_ffff_8000_0000);
    }
}
