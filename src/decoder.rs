//! RV64GC instruction decoding.
//!
//! [`decode`] is a pure function from a 32-bit little-endian instruction
//! word to an [`Instruction`] record. The low two bits select the quadrant:
//! quadrants 00/01/10 are 16-bit compressed encodings (only the low half of
//! the word is consumed) and expand to a base-ISA instruction with `rvc`
//! set; quadrant 11 is a full 32-bit encoding.
//!
//! Reserved and unsupported encodings fail with
//! [`EmuError::IllegalInstruction`]. That includes the compressed forms
//! the manual marks reserved: `C.ADDI4SPN` with a zero immediate,
//! `C.ADDIW` with `rd=0`, `C.LWSP`/`C.LDSP` with `rd=0`, and `C.JR` with
//! `rs1=0`.

use crate::error::{EmuError, Result};
use crate::instruction::{InstKind, Instruction};

/// Extract bits `hi..=lo` of `word`, shifted down to bit 0.
#[inline]
const fn bits(word: u32, hi: u32, lo: u32) -> u32 {
    (word >> lo) & ((1 << (hi - lo + 1)) - 1)
}

/// Sign-extend the low `width` bits of `value`.
#[inline]
const fn sign_extend(value: u32, width: u32) -> i32 {
    let shift = 32 - width;
    ((value << shift) as i32) >> shift
}

#[inline]
const fn rd(word: u32) -> u8 {
    bits(word, 11, 7) as u8
}

#[inline]
const fn rs1(word: u32) -> u8 {
    bits(word, 19, 15) as u8
}

#[inline]
const fn rs2(word: u32) -> u8 {
    bits(word, 24, 20) as u8
}

#[inline]
const fn funct3(word: u32) -> u32 {
    bits(word, 14, 12)
}

#[inline]
const fn funct7(word: u32) -> u32 {
    bits(word, 31, 25)
}

#[inline]
const fn imm_i(word: u32) -> i32 {
    sign_extend(bits(word, 31, 20), 12)
}

#[inline]
const fn imm_s(word: u32) -> i32 {
    sign_extend(bits(word, 31, 25) << 5 | bits(word, 11, 7), 12)
}

#[inline]
const fn imm_b(word: u32) -> i32 {
    sign_extend(
        bits(word, 31, 31) << 12
            | bits(word, 7, 7) << 11
            | bits(word, 30, 25) << 5
            | bits(word, 11, 8) << 1,
        13,
    )
}

/// U-type immediate: the 20-bit field already shifted into place.
#[inline]
const fn imm_u(word: u32) -> i32 {
    (word & 0xffff_f000) as i32
}

#[inline]
const fn imm_j(word: u32) -> i32 {
    sign_extend(
        bits(word, 31, 31) << 20
            | bits(word, 19, 12) << 12
            | bits(word, 20, 20) << 11
            | bits(word, 30, 21) << 1,
        21,
    )
}

/// Decode one instruction word.
///
/// # Errors
///
/// Returns [`EmuError::IllegalInstruction`] for any encoding outside
/// RV64IMFD, Zicsr, and the C expansions thereof.
pub fn decode(word: u32) -> Result<Instruction> {
    match word & 0b11 {
        0b00 => decode_q0(word & 0xffff),
        0b01 => decode_q1(word & 0xffff),
        0b10 => decode_q2(word & 0xffff),
        _ => decode_full(word),
    }
}

// ── 32-bit encodings ──

fn decode_full(word: u32) -> Result<Instruction> {
    let illegal = EmuError::IllegalInstruction(word);

    let kind = match bits(word, 6, 0) {
        0x03 => {
            return Ok(inst_i(
                match funct3(word) {
                    0 => InstKind::Lb,
                    1 => InstKind::Lh,
                    2 => InstKind::Lw,
                    3 => InstKind::Ld,
                    4 => InstKind::Lbu,
                    5 => InstKind::Lhu,
                    6 => InstKind::Lwu,
                    _ => return Err(illegal),
                },
                word,
            ))
        }
        0x07 => {
            return Ok(inst_i(
                match funct3(word) {
                    2 => InstKind::Flw,
                    3 => InstKind::Fld,
                    _ => return Err(illegal),
                },
                word,
            ))
        }
        0x0f => {
            let mut inst = Instruction::new(match funct3(word) {
                0 => InstKind::Fence,
                1 => InstKind::FenceI,
                _ => return Err(illegal),
            });
            inst.cont = true;
            return Ok(inst);
        }
        0x13 => return decode_op_imm(word),
        0x17 => {
            let mut inst = Instruction::new(InstKind::Auipc);
            inst.rd = rd(word);
            inst.imm = imm_u(word);
            return Ok(inst);
        }
        0x1b => return decode_op_imm32(word),
        0x23 => {
            return Ok(inst_s(
                match funct3(word) {
                    0 => InstKind::Sb,
                    1 => InstKind::Sh,
                    2 => InstKind::Sw,
                    3 => InstKind::Sd,
                    _ => return Err(illegal),
                },
                word,
            ))
        }
        0x27 => {
            return Ok(inst_s(
                match funct3(word) {
                    2 => InstKind::Fsw,
                    3 => InstKind::Fsd,
                    _ => return Err(illegal),
                },
                word,
            ))
        }
        0x33 => match (funct3(word), funct7(word)) {
            (0, 0x00) => InstKind::Add,
            (0, 0x20) => InstKind::Sub,
            (1, 0x00) => InstKind::Sll,
            (2, 0x00) => InstKind::Slt,
            (3, 0x00) => InstKind::Sltu,
            (4, 0x00) => InstKind::Xor,
            (5, 0x00) => InstKind::Srl,
            (5, 0x20) => InstKind::Sra,
            (6, 0x00) => InstKind::Or,
            (7, 0x00) => InstKind::And,
            (0, 0x01) => InstKind::Mul,
            (1, 0x01) => InstKind::Mulh,
            (2, 0x01) => InstKind::Mulhsu,
            (3, 0x01) => InstKind::Mulhu,
            (4, 0x01) => InstKind::Div,
            (5, 0x01) => InstKind::Divu,
            (6, 0x01) => InstKind::Rem,
            (7, 0x01) => InstKind::Remu,
            _ => return Err(illegal),
        },
        0x3b => match (funct3(word), funct7(word)) {
            (0, 0x00) => InstKind::Addw,
            (0, 0x20) => InstKind::Subw,
            (1, 0x00) => InstKind::Sllw,
            (5, 0x00) => InstKind::Srlw,
            (5, 0x20) => InstKind::Sraw,
            (0, 0x01) => InstKind::Mulw,
            (4, 0x01) => InstKind::Divw,
            (5, 0x01) => InstKind::Divuw,
            (6, 0x01) => InstKind::Remw,
            (7, 0x01) => InstKind::Remuw,
            _ => return Err(illegal),
        },
        0x37 => {
            let mut inst = Instruction::new(InstKind::Lui);
            inst.rd = rd(word);
            inst.imm = imm_u(word);
            return Ok(inst);
        }
        0x63 => {
            let mut inst = Instruction::new(match funct3(word) {
                0 => InstKind::Beq,
                1 => InstKind::Bne,
                4 => InstKind::Blt,
                5 => InstKind::Bge,
                6 => InstKind::Bltu,
                7 => InstKind::Bgeu,
                _ => return Err(illegal),
            });
            inst.rs1 = rs1(word);
            inst.rs2 = rs2(word);
            inst.imm = imm_b(word);
            return Ok(inst);
        }
        0x67 => {
            if funct3(word) != 0 {
                return Err(illegal);
            }
            let mut inst = inst_i(InstKind::Jalr, word);
            inst.cont = true;
            return Ok(inst);
        }
        0x6f => {
            let mut inst = Instruction::new(InstKind::Jal);
            inst.rd = rd(word);
            inst.imm = imm_j(word);
            inst.cont = true;
            return Ok(inst);
        }
        0x73 => return decode_system(word),
        0x43 | 0x47 | 0x4b | 0x4f => return decode_fused(word),
        0x53 => return decode_op_fp(word),
        _ => return Err(illegal),
    };

    // Shared R-type tail for OP/OP-32.
    let mut inst = Instruction::new(kind);
    inst.rd = rd(word);
    inst.rs1 = rs1(word);
    inst.rs2 = rs2(word);
    Ok(inst)
}

fn inst_i(kind: InstKind, word: u32) -> Instruction {
    let mut inst = Instruction::new(kind);
    inst.rd = rd(word);
    inst.rs1 = rs1(word);
    inst.imm = imm_i(word);
    inst
}

fn inst_s(kind: InstKind, word: u32) -> Instruction {
    let mut inst = Instruction::new(kind);
    inst.rs1 = rs1(word);
    inst.rs2 = rs2(word);
    inst.imm = imm_s(word);
    inst
}

fn decode_op_imm(word: u32) -> Result<Instruction> {
    let funct6 = bits(word, 31, 26);
    let shamt = bits(word, 25, 20) as i32;
    let (kind, imm) = match funct3(word) {
        0 => (InstKind::Addi, imm_i(word)),
        2 => (InstKind::Slti, imm_i(word)),
        3 => (InstKind::Sltiu, imm_i(word)),
        4 => (InstKind::Xori, imm_i(word)),
        6 => (InstKind::Ori, imm_i(word)),
        7 => (InstKind::Andi, imm_i(word)),
        1 if funct6 == 0x00 => (InstKind::Slli, shamt),
        5 if funct6 == 0x00 => (InstKind::Srli, shamt),
        5 if funct6 == 0x10 => (InstKind::Srai, shamt),
        _ => return Err(EmuError::IllegalInstruction(word)),
    };
    let mut inst = Instruction::new(kind);
    inst.rd = rd(word);
    inst.rs1 = rs1(word);
    inst.imm = imm;
    Ok(inst)
}

fn decode_op_imm32(word: u32) -> Result<Instruction> {
    let shamt = bits(word, 24, 20) as i32;
    let (kind, imm) = match (funct3(word), funct7(word)) {
        (0, _) => (InstKind::Addiw, imm_i(word)),
        (1, 0x00) => (InstKind::Slliw, shamt),
        (5, 0x00) => (InstKind::Srliw, shamt),
        (5, 0x20) => (InstKind::Sraiw, shamt),
        _ => return Err(EmuError::IllegalInstruction(word)),
    };
    let mut inst = Instruction::new(kind);
    inst.rd = rd(word);
    inst.rs1 = rs1(word);
    inst.imm = imm;
    Ok(inst)
}

fn decode_system(word: u32) -> Result<Instruction> {
    if funct3(word) == 0 {
        let mut inst = Instruction::new(match bits(word, 31, 20) {
            0 if rs1(word) == 0 && rd(word) == 0 => InstKind::Ecall,
            1 if rs1(word) == 0 && rd(word) == 0 => InstKind::Ebreak,
            _ => return Err(EmuError::IllegalInstruction(word)),
        });
        inst.cont = true;
        return Ok(inst);
    }
    let kind = match funct3(word) {
        1 => InstKind::Csrrw,
        2 => InstKind::Csrrs,
        3 => InstKind::Csrrc,
        5 => InstKind::Csrrwi,
        6 => InstKind::Csrrsi,
        7 => InstKind::Csrrci,
        _ => return Err(EmuError::IllegalInstruction(word)),
    };
    let mut inst = Instruction::new(kind);
    inst.rd = rd(word);
    inst.rs1 = rs1(word); // register index or zimm, per kind
    inst.csr = bits(word, 31, 20) as u16;
    Ok(inst)
}

fn decode_fused(word: u32) -> Result<Instruction> {
    let single = match bits(word, 26, 25) {
        0 => true,
        1 => false,
        _ => return Err(EmuError::IllegalInstruction(word)),
    };
    let kind = match (bits(word, 6, 0), single) {
        (0x43, true) => InstKind::FmaddS,
        (0x47, true) => InstKind::FmsubS,
        (0x4b, true) => InstKind::FnmsubS,
        (0x4f, true) => InstKind::FnmaddS,
        (0x43, false) => InstKind::FmaddD,
        (0x47, false) => InstKind::FmsubD,
        (0x4b, false) => InstKind::FnmsubD,
        (0x4f, false) => InstKind::FnmaddD,
        _ => return Err(EmuError::IllegalInstruction(word)),
    };
    let mut inst = Instruction::new(kind);
    inst.rd = rd(word);
    inst.rs1 = rs1(word);
    inst.rs2 = rs2(word);
    inst.rs3 = bits(word, 31, 27) as u8;
    Ok(inst)
}

fn decode_op_fp(word: u32) -> Result<Instruction> {
    let illegal = EmuError::IllegalInstruction(word);
    let kind = match funct7(word) {
        0x00 => InstKind::FaddS,
        0x01 => InstKind::FaddD,
        0x04 => InstKind::FsubS,
        0x05 => InstKind::FsubD,
        0x08 => InstKind::FmulS,
        0x09 => InstKind::FmulD,
        0x0c => InstKind::FdivS,
        0x0d => InstKind::FdivD,
        0x2c => InstKind::FsqrtS,
        0x2d => InstKind::FsqrtD,
        0x10 => match funct3(word) {
            0 => InstKind::FsgnjS,
            1 => InstKind::FsgnjnS,
            2 => InstKind::FsgnjxS,
            _ => return Err(illegal),
        },
        0x11 => match funct3(word) {
            0 => InstKind::FsgnjD,
            1 => InstKind::FsgnjnD,
            2 => InstKind::FsgnjxD,
            _ => return Err(illegal),
        },
        0x14 => match funct3(word) {
            0 => InstKind::FminS,
            1 => InstKind::FmaxS,
            _ => return Err(illegal),
        },
        0x15 => match funct3(word) {
            0 => InstKind::FminD,
            1 => InstKind::FmaxD,
            _ => return Err(illegal),
        },
        0x20 => match rs2(word) {
            1 => InstKind::FcvtSD,
            _ => return Err(illegal),
        },
        0x21 => match rs2(word) {
            0 => InstKind::FcvtDS,
            _ => return Err(illegal),
        },
        0x50 => match funct3(word) {
            0 => InstKind::FleS,
            1 => InstKind::FltS,
            2 => InstKind::FeqS,
            _ => return Err(illegal),
        },
        0x51 => match funct3(word) {
            0 => InstKind::FleD,
            1 => InstKind::FltD,
            2 => InstKind::FeqD,
            _ => return Err(illegal),
        },
        0x60 => match rs2(word) {
            0 => InstKind::FcvtWS,
            1 => InstKind::FcvtWuS,
            2 => InstKind::FcvtLS,
            3 => InstKind::FcvtLuS,
            _ => return Err(illegal),
        },
        0x61 => match rs2(word) {
            0 => InstKind::FcvtWD,
            1 => InstKind::FcvtWuD,
            2 => InstKind::FcvtLD,
            3 => InstKind::FcvtLuD,
            _ => return Err(illegal),
        },
        0x68 => match rs2(word) {
            0 => InstKind::FcvtSW,
            1 => InstKind::FcvtSWu,
            2 => InstKind::FcvtSL,
            3 => InstKind::FcvtSLu,
            _ => return Err(illegal),
        },
        0x69 => match rs2(word) {
            0 => InstKind::FcvtDW,
            1 => InstKind::FcvtDWu,
            2 => InstKind::FcvtDL,
            3 => InstKind::FcvtDLu,
            _ => return Err(illegal),
        },
        0x70 => match funct3(word) {
            0 => InstKind::FmvXW,
            1 => InstKind::FclassS,
            _ => return Err(illegal),
        },
        0x71 => match funct3(word) {
            0 => InstKind::FmvXD,
            1 => InstKind::FclassD,
            _ => return Err(illegal),
        },
        0x78 => InstKind::FmvWX,
        0x79 => InstKind::FmvDX,
        _ => return Err(illegal),
    };
    let mut inst = Instruction::new(kind);
    inst.rd = rd(word);
    inst.rs1 = rs1(word);
    inst.rs2 = rs2(word);
    Ok(inst)
}

// ── 16-bit encodings ──
//
// Register fields named with a prime in the manual (rd', rs1', rs2') are
// 3-bit and map to x8..x15 / f8..f15.

#[inline]
const fn creg(word: u32, lo: u32) -> u8 {
    (bits(word, lo + 2, lo) + 8) as u8
}

/// Quadrant 00: stack-pointer-relative wide immediates and register loads
/// and stores through rs1'.
fn decode_q0(word: u32) -> Result<Instruction> {
    let funct3 = bits(word, 15, 13);

    let mut inst = match funct3 {
        0b000 => {
            // C.ADDI4SPN -> ADDI rd', sp, nzuimm
            let uimm = bits(word, 12, 11) << 4
                | bits(word, 10, 7) << 6
                | bits(word, 6, 6) << 2
                | bits(word, 5, 5) << 3;
            if uimm == 0 {
                return Err(EmuError::IllegalInstruction(word));
            }
            let mut inst = Instruction::new(InstKind::Addi);
            inst.rd = creg(word, 2);
            inst.rs1 = 2;
            inst.imm = uimm as i32;
            inst
        }
        0b001 | 0b010 | 0b011 => {
            // C.FLD / C.LW / C.LD
            let (kind, uimm) = match funct3 {
                0b001 => (InstKind::Fld, bits(word, 12, 10) << 3 | bits(word, 6, 5) << 6),
                0b010 => {
                    (
                        InstKind::Lw,
                        bits(word, 12, 10) << 3 | bits(word, 6, 6) << 2 | bits(word, 5, 5) << 6,
                    )
                }
                _ => (InstKind::Ld, bits(word, 12, 10) << 3 | bits(word, 6, 5) << 6),
            };
            let mut inst = Instruction::new(kind);
            inst.rd = creg(word, 2);
            inst.rs1 = creg(word, 7);
            inst.imm = uimm as i32;
            inst
        }
        0b101 | 0b110 | 0b111 => {
            // C.FSD / C.SW / C.SD
            let (kind, uimm) = match funct3 {
                0b101 => (InstKind::Fsd, bits(word, 12, 10) << 3 | bits(word, 6, 5) << 6),
                0b110 => {
                    (
                        InstKind::Sw,
                        bits(word, 12, 10) << 3 | bits(word, 6, 6) << 2 | bits(word, 5, 5) << 6,
                    )
                }
                _ => (InstKind::Sd, bits(word, 12, 10) << 3 | bits(word, 6, 5) << 6),
            };
            let mut inst = Instruction::new(kind);
            inst.rs1 = creg(word, 7);
            inst.rs2 = creg(word, 2);
            inst.imm = uimm as i32;
            inst
        }
        _ => return Err(EmuError::IllegalInstruction(word)),
    };

    inst.rvc = true;
    Ok(inst)
}

/// Quadrant 01: immediates, register-register ALU on the prime set, and
/// direct control transfer.
fn decode_q1(word: u32) -> Result<Instruction> {
    let funct3 = bits(word, 15, 13);
    let imm6 = sign_extend(bits(word, 12, 12) << 5 | bits(word, 6, 2), 6);

    let mut inst = match funct3 {
        0b000 => {
            // C.ADDI (rd=0 encodes C.NOP, which is just addi x0, x0, 0)
            let mut inst = Instruction::new(InstKind::Addi);
            inst.rd = rd(word);
            inst.rs1 = rd(word);
            inst.imm = imm6;
            inst
        }
        0b001 => {
            // C.ADDIW
            if rd(word) == 0 {
                return Err(EmuError::IllegalInstruction(word));
            }
            let mut inst = Instruction::new(InstKind::Addiw);
            inst.rd = rd(word);
            inst.rs1 = rd(word);
            inst.imm = imm6;
            inst
        }
        0b010 => {
            // C.LI -> ADDI rd, x0, imm
            let mut inst = Instruction::new(InstKind::Addi);
            inst.rd = rd(word);
            inst.imm = imm6;
            inst
        }
        0b011 => {
            if rd(word) == 2 {
                // C.ADDI16SP
                let imm = sign_extend(
                    bits(word, 12, 12) << 9
                        | bits(word, 4, 3) << 7
                        | bits(word, 5, 5) << 6
                        | bits(word, 2, 2) << 5
                        | bits(word, 6, 6) << 4,
                    10,
                );
                if imm == 0 {
                    return Err(EmuError::IllegalInstruction(word));
                }
                let mut inst = Instruction::new(InstKind::Addi);
                inst.rd = 2;
                inst.rs1 = 2;
                inst.imm = imm;
                inst
            } else {
                // C.LUI
                let imm = sign_extend(bits(word, 12, 12) << 17 | bits(word, 6, 2) << 12, 18);
                if imm == 0 {
                    return Err(EmuError::IllegalInstruction(word));
                }
                let mut inst = Instruction::new(InstKind::Lui);
                inst.rd = rd(word);
                inst.imm = imm;
                inst
            }
        }
        0b100 => return decode_q1_alu(word),
        0b101 => {
            // C.J -> JAL x0, imm
            let imm = sign_extend(
                bits(word, 12, 12) << 11
                    | bits(word, 11, 11) << 4
                    | bits(word, 10, 9) << 8
                    | bits(word, 8, 8) << 10
                    | bits(word, 7, 7) << 6
                    | bits(word, 6, 6) << 7
                    | bits(word, 5, 3) << 1
                    | bits(word, 2, 2) << 5,
                12,
            );
            let mut inst = Instruction::new(InstKind::Jal);
            inst.imm = imm;
            inst.cont = true;
            inst
        }
        _ => {
            // C.BEQZ / C.BNEZ -> BEQ/BNE rs1', x0, imm
            let imm = sign_extend(
                bits(word, 12, 12) << 8
                    | bits(word, 11, 10) << 3
                    | bits(word, 6, 5) << 6
                    | bits(word, 4, 3) << 1
                    | bits(word, 2, 2) << 5,
                9,
            );
            let mut inst = Instruction::new(if funct3 == 0b110 {
                InstKind::Beq
            } else {
                InstKind::Bne
            });
            inst.rs1 = creg(word, 7);
            inst.imm = imm;
            inst
        }
    };

    inst.rvc = true;
    Ok(inst)
}

fn decode_q1_alu(word: u32) -> Result<Instruction> {
    let reg = creg(word, 7);
    let shamt = (bits(word, 12, 12) << 5 | bits(word, 6, 2)) as i32;

    let mut inst = match bits(word, 11, 10) {
        0b00 | 0b01 => {
            // C.SRLI / C.SRAI
            let mut inst = Instruction::new(if bits(word, 11, 10) == 0b00 {
                InstKind::Srli
            } else {
                InstKind::Srai
            });
            inst.rd = reg;
            inst.rs1 = reg;
            inst.imm = shamt;
            inst
        }
        0b10 => {
            // C.ANDI
            let mut inst = Instruction::new(InstKind::Andi);
            inst.rd = reg;
            inst.rs1 = reg;
            inst.imm = sign_extend(bits(word, 12, 12) << 5 | bits(word, 6, 2), 6);
            inst
        }
        _ => {
            let kind = match (bits(word, 12, 12), bits(word, 6, 5)) {
                (0, 0b00) => InstKind::Sub,
                (0, 0b01) => InstKind::Xor,
                (0, 0b10) => InstKind::Or,
                (0, 0b11) => InstKind::And,
                (1, 0b00) => InstKind::Subw,
                (1, 0b01) => InstKind::Addw,
                _ => return Err(EmuError::IllegalInstruction(word)),
            };
            let mut inst = Instruction::new(kind);
            inst.rd = reg;
            inst.rs1 = reg;
            inst.rs2 = creg(word, 2);
            inst
        }
    };

    inst.rvc = true;
    Ok(inst)
}

/// Quadrant 10: stack-pointer-relative loads/stores and register control
/// transfer.
fn decode_q2(word: u32) -> Result<Instruction> {
    let funct3 = bits(word, 15, 13);

    let mut inst = match funct3 {
        0b000 => {
            // C.SLLI
            let mut inst = Instruction::new(InstKind::Slli);
            inst.rd = rd(word);
            inst.rs1 = rd(word);
            inst.imm = (bits(word, 12, 12) << 5 | bits(word, 6, 2)) as i32;
            inst
        }
        0b001 | 0b010 | 0b011 => {
            // C.FLDSP / C.LWSP / C.LDSP
            let (kind, uimm) = match funct3 {
                0b001 => {
                    (
                        InstKind::Fld,
                        bits(word, 12, 12) << 5 | bits(word, 6, 5) << 3 | bits(word, 4, 2) << 6,
                    )
                }
                0b010 => {
                    if rd(word) == 0 {
                        return Err(EmuError::IllegalInstruction(word));
                    }
                    (
                        InstKind::Lw,
                        bits(word, 12, 12) << 5 | bits(word, 6, 4) << 2 | bits(word, 3, 2) << 6,
                    )
                }
                _ => {
                    if rd(word) == 0 {
                        return Err(EmuError::IllegalInstruction(word));
                    }
                    (
                        InstKind::Ld,
                        bits(word, 12, 12) << 5 | bits(word, 6, 5) << 3 | bits(word, 4, 2) << 6,
                    )
                }
            };
            let mut inst = Instruction::new(kind);
            inst.rd = rd(word);
            inst.rs1 = 2;
            inst.imm = uimm as i32;
            inst
        }
        0b100 => return decode_q2_jump(word),
        _ => {
            // C.FSDSP / C.SWSP / C.SDSP
            let (kind, uimm) = match funct3 {
                0b101 => (InstKind::Fsd, bits(word, 12, 10) << 3 | bits(word, 9, 7) << 6),
                0b110 => (InstKind::Sw, bits(word, 12, 9) << 2 | bits(word, 8, 7) << 6),
                _ => (InstKind::Sd, bits(word, 12, 10) << 3 | bits(word, 9, 7) << 6),
            };
            let mut inst = Instruction::new(kind);
            inst.rs1 = 2;
            inst.rs2 = bits(word, 6, 2) as u8;
            inst.imm = uimm as i32;
            inst
        }
    };

    inst.rvc = true;
    Ok(inst)
}

fn decode_q2_jump(word: u32) -> Result<Instruction> {
    let reg = rd(word);
    let rs2 = bits(word, 6, 2) as u8;

    let mut inst = if bits(word, 12, 12) == 0 {
        if rs2 == 0 {
            // C.JR -> JALR x0, 0(rs1)
            if reg == 0 {
                return Err(EmuError::IllegalInstruction(word));
            }
            let mut inst = Instruction::new(InstKind::Jalr);
            inst.rs1 = reg;
            inst.cont = true;
            inst
        } else {
            // C.MV -> ADD rd, x0, rs2
            let mut inst = Instruction::new(InstKind::Add);
            inst.rd = reg;
            inst.rs2 = rs2;
            inst
        }
    } else if rs2 == 0 && reg == 0 {
        let mut inst = Instruction::new(InstKind::Ebreak);
        inst.cont = true;
        inst
    } else if rs2 == 0 {
        // C.JALR -> JALR ra, 0(rs1)
        let mut inst = Instruction::new(InstKind::Jalr);
        inst.rd = 1;
        inst.rs1 = reg;
        inst.cont = true;
        inst
    } else {
        // C.ADD
        let mut inst = Instruction::new(InstKind::Add);
        inst.rd = reg;
        inst.rs1 = reg;
        inst.rs2 = rs2;
        inst
    };

    inst.rvc = true;
    Ok(inst)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add() {
        // add a0, a1, a2
        let inst = decode(0x00c5_8533).unwrap();
        assert_eq!(inst.kind, InstKind::Add);
        assert_eq!(inst.rd, 10);
        assert_eq!(inst.rs1, 11);
        assert_eq!(inst.rs2, 12);
        assert!(!inst.rvc);
        assert!(!inst.cont);
    }

    #[test]
    fn test_addi() {
        // addi a0, zero, 42
        let inst = decode(0x02a0_0513).unwrap();
        assert_eq!(inst.kind, InstKind::Addi);
        assert_eq!(inst.rd, 10);
        assert_eq!(inst.rs1, 0);
        assert_eq!(inst.imm, 42);
    }

    #[test]
    fn test_lui_negative() {
        // lui t0, 0x80000
        let inst = decode(0x8000_02b7).unwrap();
        assert_eq!(inst.kind, InstKind::Lui);
        assert_eq!(inst.rd, 5);
        assert_eq!(inst.imm, i32::MIN);
    }

    #[test]
    fn test_jalr_ret() {
        // jalr x0, 0(ra)
        let inst = decode(0x0000_8067).unwrap();
        assert_eq!(inst.kind, InstKind::Jalr);
        assert_eq!(inst.rd, 0);
        assert_eq!(inst.rs1, 1);
        assert_eq!(inst.imm, 0);
        assert!(inst.cont);
    }

    #[test]
    fn test_jal_forward() {
        // jal ra, +8
        let inst = decode(0x0080_00ef).unwrap();
        assert_eq!(inst.kind, InstKind::Jal);
        assert_eq!(inst.rd, 1);
        assert_eq!(inst.imm, 8);
        assert!(inst.cont);
    }

    #[test]
    fn test_beq_backward() {
        // beq x0, x0, -8
        let inst = decode(0xfe00_0ce3).unwrap();
        assert_eq!(inst.kind, InstKind::Beq);
        assert_eq!(inst.imm, -8);
        assert!(!inst.cont);
    }

    #[test]
    fn test_shift_immediates() {
        // slli a0, a0, 3
        let inst = decode(0x0035_1513).unwrap();
        assert_eq!(inst.kind, InstKind::Slli);
        assert_eq!(inst.imm, 3);

        // sraiw a0, a0, 1
        let inst = decode(0x4015_551b).unwrap();
        assert_eq!(inst.kind, InstKind::Sraiw);
        assert_eq!(inst.imm, 1);
    }

    #[test]
    fn test_ecall_ebreak() {
        let ecall = decode(0x0000_0073).unwrap();
        assert_eq!(ecall.kind, InstKind::Ecall);
        assert!(ecall.cont);

        let ebreak = decode(0x0010_0073).unwrap();
        assert_eq!(ebreak.kind, InstKind::Ebreak);
        assert!(ebreak.cont);
    }

    #[test]
    fn test_fence_terminates_region() {
        let inst = decode(0x0ff0_000f).unwrap();
        assert_eq!(inst.kind, InstKind::Fence);
        assert!(inst.cont);
    }

    #[test]
    fn test_csrrw() {
        // csrrw x0, fcsr, a0
        let inst = decode(0x0035_1073).unwrap();
        assert_eq!(inst.kind, InstKind::Csrrw);
        assert_eq!(inst.csr, 3);
        assert_eq!(inst.rs1, 10);
        assert_eq!(inst.rd, 0);
    }

    #[test]
    fn test_fmadd_s() {
        // fmadd.s f3, f4, f5, f6
        let inst = decode(0x3052_01c3).unwrap();
        assert_eq!(inst.kind, InstKind::FmaddS);
        assert_eq!(inst.rd, 3);
        assert_eq!(inst.rs1, 4);
        assert_eq!(inst.rs2, 5);
        assert_eq!(inst.rs3, 6);
    }

    #[test]
    fn test_fadd_s() {
        // fadd.s f0, f1, f2
        let inst = decode(0x0020_8053).unwrap();
        assert_eq!(inst.kind, InstKind::FaddS);
        assert_eq!(inst.rs1, 1);
        assert_eq!(inst.rs2, 2);
    }

    #[test]
    fn test_c_swsp() {
        // c.swsp a5, 0(sp) -> sw a5, 0(sp)
        let inst = decode(0x0000_c03e).unwrap();
        assert_eq!(inst.kind, InstKind::Sw);
        assert_eq!(inst.rs1, 2);
        assert_eq!(inst.rs2, 15);
        assert_eq!(inst.imm, 0);
        assert!(inst.rvc);
    }

    #[test]
    fn test_c_fsdsp() {
        // c.fsdsp fa5, 0(sp) -> fsd fa5, 0(sp)
        let inst = decode(0x0000_a03e).unwrap();
        assert_eq!(inst.kind, InstKind::Fsd);
        assert_eq!(inst.rs1, 2);
        assert_eq!(inst.rs2, 15);
        assert_eq!(inst.imm, 0);
        assert!(inst.rvc);
    }

    #[test]
    fn test_c_addi_sp() {
        // c.addi sp, -32
        let inst = decode(0x0000_1101).unwrap();
        assert_eq!(inst.kind, InstKind::Addi);
        assert_eq!(inst.rd, 2);
        assert_eq!(inst.rs1, 2);
        assert_eq!(inst.imm, -32);
        assert!(inst.rvc);
    }

    #[test]
    fn test_c_li() {
        // c.li a0, 1
        let inst = decode(0x0000_4505).unwrap();
        assert_eq!(inst.kind, InstKind::Addi);
        assert_eq!(inst.rd, 10);
        assert_eq!(inst.rs1, 0);
        assert_eq!(inst.imm, 1);
    }

    #[test]
    fn test_c_mv() {
        // c.mv a0, a1 -> add a0, x0, a1
        let inst = decode(0x0000_852e).unwrap();
        assert_eq!(inst.kind, InstKind::Add);
        assert_eq!(inst.rd, 10);
        assert_eq!(inst.rs1, 0);
        assert_eq!(inst.rs2, 11);
    }

    #[test]
    fn test_c_jr_ra() {
        // c.jr ra -> jalr x0, 0(ra)
        let inst = decode(0x0000_8082).unwrap();
        assert_eq!(inst.kind, InstKind::Jalr);
        assert_eq!(inst.rd, 0);
        assert_eq!(inst.rs1, 1);
        assert!(inst.cont);
        assert!(inst.rvc);
    }

    #[test]
    fn test_c_addi4spn() {
        // c.addi4spn a0, sp, 16
        let inst = decode(0x0000_0808).unwrap();
        assert_eq!(inst.kind, InstKind::Addi);
        assert_eq!(inst.rd, 10);
        assert_eq!(inst.rs1, 2);
        assert_eq!(inst.imm, 16);
    }

    #[test]
    fn test_reserved_encodings() {
        // All-zero halfword (C.ADDI4SPN with nzuimm=0)
        assert!(decode(0x0000_0000).is_err());
        // C.LWSP with rd=0
        assert!(decode(0x0000_4002).is_err());
        // C.JR with rs1=0
        assert!(decode(0x0000_8002).is_err());
        // C.ADDIW with rd=0
        assert!(decode(0x0000_2001).is_err());
    }

    #[test]
    fn test_decode_is_pure() {
        for word in [0x00c5_8533_u32, 0x0000_c03e, 0x0000_1101, 0x8000_02b7] {
            assert_eq!(decode(word).unwrap(), decode(word).unwrap());
        }
    }
}
