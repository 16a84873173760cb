//! Translation-region discovery and C source emission.
//!
//! [`gen_block`] walks the guest code statically reachable from an entry pc
//! through fall-through edges and direct branches (conditional branches and
//! JAL), and emits one C translation unit implementing the whole region.
//! Indirect jumps, environment calls, and fences end the walk.
//!
//! The emitted function `start(state_t *state)` mirrors the interpreter
//! exactly:
//!
//! - a register prologue copies every guest register the region touches
//!   into a local (`uint64_t x5`, `fp_reg_t f10`, ...), and the epilogue
//!   writes the same set back; the liveness tracer guarantees the two
//!   lists match;
//! - each guest instruction becomes a labeled compound statement
//!   `inst_<hexpc>: { ... }`, so intra-region branches are plain `goto`s;
//! - region exits store the exit reason and re-entry pc to `*state` and
//!   jump to the shared `end:` label ahead of the epilogue.
//!
//! Widths are forced with explicit fixed-size casts so the compiled code
//! cannot diverge from the interpreter on W-form or division edge cases.

use std::collections::HashSet;
use std::fmt::Write;

use crate::decoder::decode;
use crate::error::{EmuError, Result};
use crate::instruction::{InstKind, Instruction};
use crate::mmu::read_guest;
use crate::registers::{NUM_FP_REGS, NUM_GP_REGS};

/// Pending-pc worklist bound; a region deeper than this is rejected.
const STACK_CAP: usize = 256;

/// Shared head of every generated translation unit: the state layout (kept
/// byte-identical to [`crate::state::State`]), the guest-to-host macro, and
/// inline twins of the interpreter's arithmetic helpers.
const PROLOGUE: &str = "\
#include <stdint.h>
#include <stdbool.h>

#define OFFSET 0x088800000000ULL
#define GUEST_TO_HOST(addr) ((addr) + OFFSET)

enum exit_reason_t {
    none,
    direct_branch,
    indirect_branch,
    ecall,
};

typedef union {
    uint64_t v;
    uint32_t w;
    double d;
    float f;
} fp_reg_t;

typedef struct {
    enum exit_reason_t exit_reason;
    uint64_t reenter_pc;
    uint64_t gp_regs[32];
    fp_reg_t fp_regs[32];
    uint64_t pc;
    uint32_t fcsr;
} state_t;

static inline uint64_t mulhu(uint64_t a, uint64_t b) {
    return (uint64_t)(((unsigned __int128)a * b) >> 64);
}

static inline int64_t mulh(int64_t a, int64_t b) {
    return (int64_t)(((__int128)a * b) >> 64);
}

static inline int64_t mulhsu(int64_t a, uint64_t b) {
    return (int64_t)(((__int128)a * (__int128)b) >> 64);
}

static inline uint32_t fsgnj32(uint32_t a, uint32_t b, int n, int x) {
    uint32_t sign = (uint32_t)1 << 31;
    uint32_t v = x ? a : n ? sign : 0;
    return (a & ~sign) | ((v ^ b) & sign);
}

static inline uint64_t fsgnj64(uint64_t a, uint64_t b, int n, int x) {
    uint64_t sign = (uint64_t)1 << 63;
    uint64_t v = x ? a : n ? sign : 0;
    return (a & ~sign) | ((v ^ b) & sign);
}

static inline uint64_t fclass32(uint32_t a) {
    uint32_t sign = a >> 31, exp = (a >> 23) & 0xff, frac = a & 0x7fffff;
    if (exp == 0xff) {
        if (frac == 0) return sign ? 1 << 0 : 1 << 7;
        return (frac & 0x400000) ? 1 << 9 : 1 << 8;
    }
    if (exp == 0) {
        if (frac == 0) return sign ? 1 << 3 : 1 << 4;
        return sign ? 1 << 2 : 1 << 5;
    }
    return sign ? 1 << 1 : 1 << 6;
}

static inline uint64_t fclass64(uint64_t a) {
    uint64_t sign = a >> 63, exp = (a >> 52) & 0x7ff;
    uint64_t frac = a & 0xfffffffffffffULL;
    if (exp == 0x7ff) {
        if (frac == 0) return sign ? 1 << 0 : 1 << 7;
        return (frac & 0x8000000000000ULL) ? 1 << 9 : 1 << 8;
    }
    if (exp == 0) {
        if (frac == 0) return sign ? 1 << 3 : 1 << 4;
        return sign ? 1 << 2 : 1 << 5;
    }
    return sign ? 1 << 1 : 1 << 6;
}

void start(volatile state_t *restrict state) {
";

/// Tracks which guest registers a region touches, so the prologue and
/// epilogue only move the registers that matter.
#[derive(Default)]
struct Tracer {
    gp: [bool; NUM_GP_REGS],
    fp: [bool; NUM_FP_REGS],
}

impl Tracer {
    fn mark_gp(&mut self, regs: &[u8]) {
        for &r in regs {
            self.gp[r as usize] = true;
        }
    }

    fn mark_fp(&mut self, regs: &[u8]) {
        for &r in regs {
            self.fp[r as usize] = true;
        }
    }

    fn append_prologue(&self, s: &mut String) {
        for (i, _) in self.gp.iter().enumerate().skip(1).filter(|(_, &used)| used) {
            let _ = writeln!(s, "    uint64_t x{i} = state->gp_regs[{i}];");
        }
        for (i, _) in self.fp.iter().enumerate().filter(|(_, &used)| used) {
            let _ = writeln!(s, "    fp_reg_t f{i} = state->fp_regs[{i}];");
        }
    }

    fn append_epilogue(&self, s: &mut String) {
        for (i, _) in self.gp.iter().enumerate().skip(1).filter(|(_, &used)| used) {
            let _ = writeln!(s, "    state->gp_regs[{i}] = x{i};");
        }
        for (i, _) in self.fp.iter().enumerate().filter(|(_, &used)| used) {
            let _ = writeln!(s, "    state->fp_regs[{i}] = f{i};");
        }
    }
}

/// Push a direct-branch target onto the worklist, deduplicating and
/// enforcing the depth bound.
fn schedule(stack: &mut Vec<u64>, pc: u64) {
    if !stack.contains(&pc) {
        assert!(stack.len() < STACK_CAP, "translation worklist overflow");
        stack.push(pc);
    }
}

/// Discover the region reachable from `entry` and emit its C source.
///
/// # Errors
///
/// Fails on undecodable guest words and on CSR numbers the emulator does
/// not model; both make the region untranslatable (and would already have
/// been fatal in the interpreter).
pub fn gen_block(entry: u64) -> Result<String> {
    let mut body = String::new();
    let mut tracer = Tracer::default();
    let mut visited: HashSet<u64> = HashSet::new();
    let mut stack = vec![entry];

    while let Some(pc) = stack.pop() {
        if !visited.insert(pc) {
            continue;
        }

        // SAFETY: region discovery only follows pcs inside the mapped
        // guest image.
        let word = unsafe { read_guest::<u32>(pc) };
        let inst = decode(word)?;

        let _ = writeln!(body, "inst_{pc:x}: {{");
        gen_inst(&mut body, &inst, &mut tracer, &mut stack, pc)?;

        if !inst.cont {
            let next = pc + inst.length();
            let _ = writeln!(body, "    goto inst_{next:x};");
            schedule(&mut stack, next);
        }
        body.push_str("}\n");
    }

    let mut source = String::with_capacity(PROLOGUE.len() + body.len() + 2048);
    source.push_str(PROLOGUE);
    tracer.append_prologue(&mut source);
    source.push_str(&body);
    source.push_str("end:;\n");
    tracer.append_epilogue(&mut source);
    source.push_str("}\n");
    Ok(source)
}

/// Copy a guest GP register into a named local, honoring the zero wire.
fn reg_get(s: &mut String, reg: u8, name: &str) {
    if reg == 0 {
        let _ = writeln!(s, "    uint64_t {name} = 0;");
    } else {
        let _ = writeln!(s, "    uint64_t {name} = x{reg};");
    }
}

/// Assign an expression to a guest GP register local; writes to the zero
/// register are elided.
fn reg_set_expr(s: &mut String, rd: u8, expr: &str) {
    if rd != 0 {
        let _ = writeln!(s, "    x{rd} = {expr};");
    }
}

fn reg_set_val(s: &mut String, rd: u8, val: u64) {
    if rd != 0 {
        let _ = writeln!(s, "    x{rd} = {val:#x}ULL;");
    }
}

/// Store the exit reason and re-entry pc and leave the region.
fn emit_exit(s: &mut String, reason: &str, reenter: &str) {
    let _ = writeln!(s, "    state->exit_reason = {reason};");
    let _ = writeln!(s, "    state->reenter_pc = {reenter};");
    s.push_str("    goto end;\n");
}

fn gen_inst(
    s: &mut String,
    inst: &Instruction,
    tracer: &mut Tracer,
    stack: &mut Vec<u64>,
    pc: u64,
) -> Result<()> {
    use InstKind::*;

    let imm = i64::from(inst.imm);
    let rd = inst.rd;
    let rs1 = inst.rs1;
    let rs2 = inst.rs2;
    let rs3 = inst.rs3;

    match inst.kind {
        // ── Loads ──
        Lb | Lh | Lw | Ld | Lbu | Lhu | Lwu => {
            let (ty, cast) = match inst.kind {
                Lb => ("int8_t", "(uint64_t)(int64_t)"),
                Lh => ("int16_t", "(uint64_t)(int64_t)"),
                Lw => ("int32_t", "(uint64_t)(int64_t)"),
                Ld => ("uint64_t", ""),
                Lbu => ("uint8_t", "(uint64_t)"),
                Lhu => ("uint16_t", "(uint64_t)"),
                _ => ("uint32_t", "(uint64_t)"),
            };
            reg_get(s, rs1, "rs1");
            let _ = writeln!(
                s,
                "    {ty} val = *({ty} *)GUEST_TO_HOST(rs1 + (int64_t){imm}LL);"
            );
            reg_set_expr(s, rd, &format!("{cast}val"));
            tracer.mark_gp(&[rs1, rd]);
        }
        Flw => {
            reg_get(s, rs1, "rs1");
            let _ = writeln!(
                s,
                "    f{rd}.v = (uint64_t)*(uint32_t *)GUEST_TO_HOST(rs1 + (int64_t){imm}LL) \
                 | 0xffffffff00000000ULL;"
            );
            tracer.mark_gp(&[rs1]);
            tracer.mark_fp(&[rd]);
        }
        Fld => {
            reg_get(s, rs1, "rs1");
            let _ = writeln!(
                s,
                "    f{rd}.v = *(uint64_t *)GUEST_TO_HOST(rs1 + (int64_t){imm}LL);"
            );
            tracer.mark_gp(&[rs1]);
            tracer.mark_fp(&[rd]);
        }

        // ── Stores ──
        Sb | Sh | Sw | Sd => {
            let ty = match inst.kind {
                Sb => "uint8_t",
                Sh => "uint16_t",
                Sw => "uint32_t",
                _ => "uint64_t",
            };
            reg_get(s, rs1, "rs1");
            reg_get(s, rs2, "rs2");
            let _ = writeln!(
                s,
                "    *({ty} *)GUEST_TO_HOST(rs1 + (int64_t){imm}LL) = ({ty})rs2;"
            );
            tracer.mark_gp(&[rs1, rs2]);
        }
        Fsw | Fsd => {
            let (ty, field) = if inst.kind == Fsw {
                ("uint32_t", "w")
            } else {
                ("uint64_t", "v")
            };
            reg_get(s, rs1, "rs1");
            let _ = writeln!(
                s,
                "    *({ty} *)GUEST_TO_HOST(rs1 + (int64_t){imm}LL) = f{rs2}.{field};"
            );
            tracer.mark_gp(&[rs1]);
            tracer.mark_fp(&[rs2]);
        }

        // ── Register-immediate ALU ──
        Addi | Slti | Sltiu | Xori | Ori | Andi | Slli | Srli | Srai | Addiw | Slliw
        | Srliw | Sraiw => {
            let shamt = inst.imm & 0x3f;
            let shamt_w = inst.imm & 0x1f;
            let expr = match inst.kind {
                Addi => format!("rs1 + (int64_t){imm}LL"),
                Slti => format!("(int64_t)rs1 < (int64_t){imm}LL ? 1 : 0"),
                Sltiu => format!("rs1 < (uint64_t)(int64_t){imm}LL ? 1 : 0"),
                Xori => format!("rs1 ^ (uint64_t)(int64_t){imm}LL"),
                Ori => format!("rs1 | (uint64_t)(int64_t){imm}LL"),
                Andi => format!("rs1 & (uint64_t)(int64_t){imm}LL"),
                Slli => format!("rs1 << {shamt}"),
                Srli => format!("rs1 >> {shamt}"),
                Srai => format!("(uint64_t)((int64_t)rs1 >> {shamt})"),
                Addiw => format!("(uint64_t)(int64_t)(int32_t)(rs1 + (int64_t){imm}LL)"),
                Slliw => format!("(uint64_t)(int64_t)(int32_t)((uint32_t)rs1 << {shamt_w})"),
                Srliw => format!("(uint64_t)(int64_t)(int32_t)((uint32_t)rs1 >> {shamt_w})"),
                _ => format!("(uint64_t)(int64_t)((int32_t)rs1 >> {shamt_w})"),
            };
            reg_get(s, rs1, "rs1");
            reg_set_expr(s, rd, &expr);
            tracer.mark_gp(&[rs1, rd]);
        }

        // ── Register-register ALU ──
        Add | Sub | Sll | Slt | Sltu | Xor | Srl | Sra | Or | And | Addw | Subw | Sllw
        | Srlw | Sraw | Mul | Mulh | Mulhsu | Mulhu | Div | Divu | Rem | Remu | Mulw
        | Divw | Divuw | Remw | Remuw => {
            let expr = match inst.kind {
                Add => "rs1 + rs2",
                Sub => "rs1 - rs2",
                Sll => "rs1 << (rs2 & 0x3f)",
                Slt => "(int64_t)rs1 < (int64_t)rs2 ? 1 : 0",
                Sltu => "rs1 < rs2 ? 1 : 0",
                Xor => "rs1 ^ rs2",
                Srl => "rs1 >> (rs2 & 0x3f)",
                Sra => "(uint64_t)((int64_t)rs1 >> (rs2 & 0x3f))",
                Or => "rs1 | rs2",
                And => "rs1 & rs2",
                Addw => "(uint64_t)(int64_t)(int32_t)(rs1 + rs2)",
                Subw => "(uint64_t)(int64_t)(int32_t)(rs1 - rs2)",
                Sllw => "(uint64_t)(int64_t)(int32_t)((uint32_t)rs1 << (rs2 & 0x1f))",
                Srlw => "(uint64_t)(int64_t)(int32_t)((uint32_t)rs1 >> (rs2 & 0x1f))",
                Sraw => "(uint64_t)(int64_t)((int32_t)rs1 >> (rs2 & 0x1f))",
                Mul => "rs1 * rs2",
                Mulh => "(uint64_t)mulh((int64_t)rs1, (int64_t)rs2)",
                Mulhsu => "(uint64_t)mulhsu((int64_t)rs1, rs2)",
                Mulhu => "mulhu(rs1, rs2)",
                Div => {
                    "rs2 == 0 ? UINT64_MAX : \
                     ((int64_t)rs1 == INT64_MIN && (int64_t)rs2 == -1) ? rs1 : \
                     (uint64_t)((int64_t)rs1 / (int64_t)rs2)"
                }
                Divu => "rs2 == 0 ? UINT64_MAX : rs1 / rs2",
                Rem => {
                    "rs2 == 0 ? rs1 : \
                     ((int64_t)rs1 == INT64_MIN && (int64_t)rs2 == -1) ? 0 : \
                     (uint64_t)((int64_t)rs1 % (int64_t)rs2)"
                }
                Remu => "rs2 == 0 ? rs1 : rs1 % rs2",
                Mulw => "(uint64_t)(int64_t)(int32_t)(rs1 * rs2)",
                Divw => {
                    "(int32_t)rs2 == 0 ? UINT64_MAX : \
                     ((int32_t)rs1 == INT32_MIN && (int32_t)rs2 == -1) ? \
                     (uint64_t)(int64_t)INT32_MIN : \
                     (uint64_t)(int64_t)((int32_t)rs1 / (int32_t)rs2)"
                }
                Divuw => {
                    "(uint32_t)rs2 == 0 ? UINT64_MAX : \
                     (uint64_t)(int64_t)(int32_t)((uint32_t)rs1 / (uint32_t)rs2)"
                }
                Remw => {
                    "(int32_t)rs2 == 0 ? (uint64_t)(int64_t)(int32_t)rs1 : \
                     ((int32_t)rs1 == INT32_MIN && (int32_t)rs2 == -1) ? 0 : \
                     (uint64_t)(int64_t)((int32_t)rs1 % (int32_t)rs2)"
                }
                _ => {
                    "(uint32_t)rs2 == 0 ? (uint64_t)(int64_t)(int32_t)rs1 : \
                     (uint64_t)(int64_t)(int32_t)((uint32_t)rs1 % (uint32_t)rs2)"
                }
            };
            reg_get(s, rs1, "rs1");
            reg_get(s, rs2, "rs2");
            reg_set_expr(s, rd, expr);
            tracer.mark_gp(&[rs1, rs2, rd]);
        }

        // ── Upper immediates ──
        Lui => {
            reg_set_val(s, rd, imm as u64);
            tracer.mark_gp(&[rd]);
        }
        Auipc => {
            reg_set_val(s, rd, pc.wrapping_add(imm as u64));
            tracer.mark_gp(&[rd]);
        }

        // ── Branches: intra-region gotos ──
        Beq | Bne | Blt | Bge | Bltu | Bgeu => {
            let cond = match inst.kind {
                Beq => "rs1 == rs2",
                Bne => "rs1 != rs2",
                Blt => "(int64_t)rs1 < (int64_t)rs2",
                Bge => "(int64_t)rs1 >= (int64_t)rs2",
                Bltu => "rs1 < rs2",
                _ => "rs1 >= rs2",
            };
            let target = pc.wrapping_add(imm as u64);
            reg_get(s, rs1, "rs1");
            reg_get(s, rs2, "rs2");
            let _ = writeln!(s, "    if ({cond}) {{");
            let _ = writeln!(s, "        goto inst_{target:x};");
            s.push_str("    }\n");
            schedule(stack, target);
            tracer.mark_gp(&[rs1, rs2]);
        }

        // ── Jumps ──
        Jal => {
            let target = pc.wrapping_add(imm as u64);
            reg_set_val(s, rd, pc + inst.length());
            let _ = writeln!(s, "    goto inst_{target:x};");
            schedule(stack, target);
            tracer.mark_gp(&[rd]);
        }
        Jalr => {
            reg_get(s, rs1, "rs1");
            reg_set_val(s, rd, pc + inst.length());
            emit_exit(
                s,
                "indirect_branch",
                &format!("(rs1 + (int64_t){imm}LL) & ~(uint64_t)1"),
            );
            tracer.mark_gp(&[rs1, rd]);
        }

        // ── System ──
        Ecall => {
            emit_exit(s, "ecall", &format!("{:#x}ULL", pc + 4));
        }
        Ebreak => {
            // Route back to the dispatcher so the cold path reports it.
            emit_exit(s, "direct_branch", &format!("{pc:#x}ULL"));
        }
        Fence | FenceI => {
            emit_exit(s, "direct_branch", &format!("{:#x}ULL", pc + 4));
        }
        Csrrw | Csrrs | Csrrc | Csrrwi | Csrrsi | Csrrci => {
            gen_csr(s, inst, tracer)?;
        }

        // ── Single-precision FP ──
        FmaddS | FmsubS | FnmsubS | FnmaddS => {
            let expr = match inst.kind {
                FmaddS => format!("__builtin_fmaf(f{rs1}.f, f{rs2}.f, f{rs3}.f)"),
                FmsubS => format!("__builtin_fmaf(f{rs1}.f, f{rs2}.f, -f{rs3}.f)"),
                FnmsubS => format!("__builtin_fmaf(-f{rs1}.f, f{rs2}.f, f{rs3}.f)"),
                _ => format!("__builtin_fmaf(-f{rs1}.f, f{rs2}.f, -f{rs3}.f)"),
            };
            let _ = writeln!(s, "    f{rd}.f = {expr};");
            tracer.mark_fp(&[rs1, rs2, rs3, rd]);
        }
        FaddS | FsubS | FmulS | FdivS | FminS | FmaxS => {
            let expr = match inst.kind {
                FaddS => format!("f{rs1}.f + f{rs2}.f"),
                FsubS => format!("f{rs1}.f - f{rs2}.f"),
                FmulS => format!("f{rs1}.f * f{rs2}.f"),
                FdivS => format!("f{rs1}.f / f{rs2}.f"),
                FminS => format!("__builtin_fminf(f{rs1}.f, f{rs2}.f)"),
                _ => format!("__builtin_fmaxf(f{rs1}.f, f{rs2}.f)"),
            };
            let _ = writeln!(s, "    f{rd}.f = {expr};");
            tracer.mark_fp(&[rs1, rs2, rd]);
        }
        FsqrtS => {
            let _ = writeln!(s, "    f{rd}.f = __builtin_sqrtf(f{rs1}.f);");
            tracer.mark_fp(&[rs1, rd]);
        }
        FsgnjS | FsgnjnS | FsgnjxS => {
            let (n, x) = match inst.kind {
                FsgnjS => (0, 0),
                FsgnjnS => (1, 0),
                _ => (0, 1),
            };
            let _ = writeln!(s, "    f{rd}.w = fsgnj32(f{rs1}.w, f{rs2}.w, {n}, {x});");
            tracer.mark_fp(&[rs1, rs2, rd]);
        }
        FcvtWS | FcvtWuS | FcvtLS | FcvtLuS | FmvXW | FclassS => {
            let expr = match inst.kind {
                FcvtWS => format!("(uint64_t)(int64_t)(int32_t)f{rs1}.f"),
                FcvtWuS => format!("(uint64_t)(int64_t)(int32_t)(uint32_t)f{rs1}.f"),
                FcvtLS => format!("(uint64_t)(int64_t)f{rs1}.f"),
                FcvtLuS => format!("(uint64_t)f{rs1}.f"),
                FmvXW => format!("(uint64_t)(int64_t)(int32_t)f{rs1}.w"),
                _ => format!("fclass32(f{rs1}.w)"),
            };
            reg_set_expr(s, rd, &expr);
            tracer.mark_fp(&[rs1]);
            tracer.mark_gp(&[rd]);
        }
        FcvtSW | FcvtSWu | FcvtSL | FcvtSLu | FmvWX => {
            reg_get(s, rs1, "rs1");
            let stmt = match inst.kind {
                FcvtSW => format!("f{rd}.f = (float)(int32_t)rs1;"),
                FcvtSWu => format!("f{rd}.f = (float)(uint32_t)rs1;"),
                FcvtSL => format!("f{rd}.f = (float)(int64_t)rs1;"),
                FcvtSLu => format!("f{rd}.f = (float)rs1;"),
                _ => format!("f{rd}.w = (uint32_t)rs1;"),
            };
            let _ = writeln!(s, "    {stmt}");
            tracer.mark_gp(&[rs1]);
            tracer.mark_fp(&[rd]);
        }
        FeqS | FltS | FleS => {
            let op = match inst.kind {
                FeqS => "==",
                FltS => "<",
                _ => "<=",
            };
            reg_set_expr(s, rd, &format!("f{rs1}.f {op} f{rs2}.f ? 1 : 0"));
            tracer.mark_fp(&[rs1, rs2]);
            tracer.mark_gp(&[rd]);
        }

        // ── Double-precision FP ──
        FmaddD | FmsubD | FnmsubD | FnmaddD => {
            let expr = match inst.kind {
                FmaddD => format!("__builtin_fma(f{rs1}.d, f{rs2}.d, f{rs3}.d)"),
                FmsubD => format!("__builtin_fma(f{rs1}.d, f{rs2}.d, -f{rs3}.d)"),
                FnmsubD => format!("__builtin_fma(-f{rs1}.d, f{rs2}.d, f{rs3}.d)"),
                _ => format!("__builtin_fma(-f{rs1}.d, f{rs2}.d, -f{rs3}.d)"),
            };
            let _ = writeln!(s, "    f{rd}.d = {expr};");
            tracer.mark_fp(&[rs1, rs2, rs3, rd]);
        }
        FaddD | FsubD | FmulD | FdivD | FminD | FmaxD => {
            let expr = match inst.kind {
                FaddD => format!("f{rs1}.d + f{rs2}.d"),
                FsubD => format!("f{rs1}.d - f{rs2}.d"),
                FmulD => format!("f{rs1}.d * f{rs2}.d"),
                FdivD => format!("f{rs1}.d / f{rs2}.d"),
                FminD => format!("__builtin_fmin(f{rs1}.d, f{rs2}.d)"),
                _ => format!("__builtin_fmax(f{rs1}.d, f{rs2}.d)"),
            };
            let _ = writeln!(s, "    f{rd}.d = {expr};");
            tracer.mark_fp(&[rs1, rs2, rd]);
        }
        FsqrtD => {
            let _ = writeln!(s, "    f{rd}.d = __builtin_sqrt(f{rs1}.d);");
            tracer.mark_fp(&[rs1, rd]);
        }
        FsgnjD | FsgnjnD | FsgnjxD => {
            let (n, x) = match inst.kind {
                FsgnjD => (0, 0),
                FsgnjnD => (1, 0),
                _ => (0, 1),
            };
            let _ = writeln!(s, "    f{rd}.v = fsgnj64(f{rs1}.v, f{rs2}.v, {n}, {x});");
            tracer.mark_fp(&[rs1, rs2, rd]);
        }
        FcvtSD => {
            let _ = writeln!(s, "    f{rd}.f = (float)f{rs1}.d;");
            tracer.mark_fp(&[rs1, rd]);
        }
        FcvtDS => {
            let _ = writeln!(s, "    f{rd}.d = (double)f{rs1}.f;");
            tracer.mark_fp(&[rs1, rd]);
        }
        FcvtWD | FcvtWuD | FcvtLD | FcvtLuD | FmvXD | FclassD => {
            let expr = match inst.kind {
                FcvtWD => format!("(uint64_t)(int64_t)(int32_t)f{rs1}.d"),
                FcvtWuD => format!("(uint64_t)(int64_t)(int32_t)(uint32_t)f{rs1}.d"),
                FcvtLD => format!("(uint64_t)(int64_t)f{rs1}.d"),
                FcvtLuD => format!("(uint64_t)f{rs1}.d"),
                FmvXD => format!("f{rs1}.v"),
                _ => format!("fclass64(f{rs1}.v)"),
            };
            reg_set_expr(s, rd, &expr);
            tracer.mark_fp(&[rs1]);
            tracer.mark_gp(&[rd]);
        }
        FcvtDW | FcvtDWu | FcvtDL | FcvtDLu | FmvDX => {
            reg_get(s, rs1, "rs1");
            let stmt = match inst.kind {
                FcvtDW => format!("f{rd}.d = (double)(int32_t)rs1;"),
                FcvtDWu => format!("f{rd}.d = (double)(uint32_t)rs1;"),
                FcvtDL => format!("f{rd}.d = (double)(int64_t)rs1;"),
                FcvtDLu => format!("f{rd}.d = (double)rs1;"),
                _ => format!("f{rd}.v = rs1;"),
            };
            let _ = writeln!(s, "    {stmt}");
            tracer.mark_gp(&[rs1]);
            tracer.mark_fp(&[rd]);
        }
        FeqD | FltD | FleD => {
            let op = match inst.kind {
                FeqD => "==",
                FltD => "<",
                _ => "<=",
            };
            reg_set_expr(s, rd, &format!("f{rs1}.d {op} f{rs2}.d ? 1 : 0"));
            tracer.mark_fp(&[rs1, rs2]);
            tracer.mark_gp(&[rd]);
        }
    }

    Ok(())
}

/// CSR accesses go straight through `*state`; only the fcsr views exist.
fn gen_csr(s: &mut String, inst: &Instruction, tracer: &mut Tracer) -> Result<()> {
    use InstKind::*;

    let read_expr = match inst.csr {
        0x001 => "(uint64_t)(state->fcsr & 0x1f)",
        0x002 => "(uint64_t)((state->fcsr >> 5) & 0x7)",
        0x003 => "(uint64_t)(state->fcsr & 0xff)",
        _ => return Err(EmuError::UnsupportedCsr(inst.csr)),
    };

    let is_imm = matches!(inst.kind, Csrrwi | Csrrsi | Csrrci);
    if !is_imm {
        reg_get(s, inst.rs1, "rs1");
        tracer.mark_gp(&[inst.rs1]);
    }
    let _ = writeln!(s, "    uint64_t csr = {read_expr};");

    let operand = if is_imm {
        format!("{}", inst.rs1)
    } else {
        "rs1".to_string()
    };
    // Set/clear forms with a zero operand register (or zero immediate) do
    // not write; that is statically known here.
    let new_val = match inst.kind {
        Csrrw | Csrrwi => Some(operand),
        Csrrs | Csrrsi if inst.rs1 != 0 => Some(format!("csr | {operand}")),
        Csrrc | Csrrci if inst.rs1 != 0 => Some(format!("csr & ~(uint64_t){operand}")),
        _ => None,
    };
    if let Some(val) = new_val {
        let stmt = match inst.csr {
            0x001 => format!("state->fcsr = (state->fcsr & ~0x1fu) | ((uint32_t)({val}) & 0x1f);"),
            0x002 => {
                format!("state->fcsr = (state->fcsr & ~0xe0u) | (((uint32_t)({val}) & 0x7) << 5);")
            }
            _ => format!("state->fcsr = (uint32_t)({val}) & 0xff;"),
        };
        let _ = writeln!(s, "    {stmt}");
    }
    reg_set_expr(s, inst.rd, "csr");
    tracer.mark_gp(&[inst.rd]);
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu;

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
    fn test_straight_line_region() {
        // add a0, a1, a2 ; jalr x0, 0(ra)
        map_guest_page(0x6000);
        store_code(0x6000, &[0x00c5_8533, 0x0000_8067]);

        let source = gen_block(0x6000).unwrap();

        assert!(source.contains("inst_6000: {"));
        assert!(source.contains("inst_6004: {"));
        assert!(source.contains("state->exit_reason = indirect_branch;"));
        assert!(source.contains("end:;"));

        // Live registers move through locals, and only live ones.
        assert!(source.contains("uint64_t x10 = state->gp_regs[10];"));
        assert!(source.contains("uint64_t x1 = state->gp_regs[1];"));
        assert!(source.contains("state->gp_regs[10] = x10;"));
        assert!(!source.contains("state->gp_regs[7]"));
    }

    #[test]
    fn test_branch_region_emits_backward_goto() {
        // addi a0, a0, -1 ; bne a0, x0, -4 ; ecall
        map_guest_page(0x7000);
        store_code(0x7000, &[0xfff5_0513, 0xfe05_1ee3, 0x0000_0073]);

        let source = gen_block(0x7000).unwrap();

        assert!(source.contains("inst_7000: {"));
        assert!(source.contains("inst_7004: {"));
        assert!(source.contains("inst_7008: {"));
        assert!(source.contains("goto inst_7000;"));
        assert!(source.contains("state->exit_reason = ecall;"));
        assert!(source.contains("state->reenter_pc = 0x700cULL;"));
    }

    #[test]
    fn test_writes_to_zero_are_elided() {
        // addi x0, x0, 5 ; ecall
        map_guest_page(0x8000);
        store_code(0x8000, &[0x0050_0013, 0x0000_0073]);

        let source = gen_block(0x8000).unwrap();
        assert!(!source.contains("x0 ="));
        assert!(!source.contains("gp_regs[0]"));
    }

    #[test]
    fn test_jal_links_and_joins_target() {
        // jal ra, +8 ; ecall ; ecall   (jal skips the first ecall)
        map_guest_page(0x9000);
        store_code(0x9000, &[0x0080_00ef, 0x0000_0073, 0x0000_0073]);

        let source = gen_block(0x9000).unwrap();
        // Link register carries the return address.
        assert!(source.contains("x1 = 0x9004ULL;"));
        assert!(source.contains("goto inst_9008;"));
        assert!(source.contains("inst_9008: {"));
    }

    #[test]
    fn test_prologue_declares_state_layout() {
        map_guest_page(0xa000);
        store_code(0xa000, &[0x0000_0073]);

        let source = gen_block(0xa000).unwrap();
        assert!(source.contains("#define GUEST_TO_HOST"));
        assert!(source.contains("enum exit_reason_t"));
        assert!(source.contains("void start(volatile state_t *restrict state)"));
    }
}
