//! Error types for rvemu.
//!
//! Every `EmuError` is fatal: the core never catches or retries. Fallible
//! setup paths (ELF loading, the compile pipeline) propagate with `?` up to
//! `main`, which prints the error and exits nonzero. Internal invariants
//! (probe-chain bounds, exit-reason protocol, cache capacity) are enforced
//! with `assert!` instead, which carries file and line.

use std::fmt;
use std::io;

/// Errors raised while loading or executing a guest program.
#[derive(Debug)]
pub enum EmuError {
    /// Host I/O failure while reading the guest executable.
    Io(io::Error),
    /// The guest executable is not a statically linked RV64 ELF.
    BadElf(&'static str),
    /// A guest instruction word has no valid decoding (reserved or
    /// unsupported encoding).
    IllegalInstruction(u32),
    /// The guest executed EBREAK.
    Ebreak(u64),
    /// A CSR access targeted a register the emulator does not model.
    UnsupportedCsr(u16),
    /// The guest invoked a syscall number the shim does not implement.
    UnknownSyscall(u64),
    /// The guest used a syscall mode the shim does not implement
    /// (e.g. `mmap` at a fixed address).
    Unsupported(&'static str),
    /// `clang` could not be spawned, or produced no object.
    CompilerFailed(String),
    /// The clang-produced relocatable object is malformed or missing a
    /// required section.
    BadObject(&'static str),
    /// The object carries a relocation type other than `R_X86_64_PC32`.
    UnsupportedReloc(u32),
}

/// Convenience alias used across the crate.
pub type Result<T> = core::result::Result<T, EmuError>;

impl fmt::Display for EmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmuError::Io(e) => write!(f, "i/o error: {e}"),
            EmuError::BadElf(what) => write!(f, "bad elf: {what}"),
            EmuError::IllegalInstruction(word) => {
                write!(f, "illegal instruction: {word:#010x}")
            }
            EmuError::Ebreak(pc) => write!(f, "guest ebreak at {pc:#x}"),
            EmuError::UnsupportedCsr(csr) => write!(f, "unsupported csr: {csr:#05x}"),
            EmuError::UnknownSyscall(n) => write!(f, "unknown syscall: {n}"),
            EmuError::Unsupported(what) => write!(f, "unsupported: {what}"),
            EmuError::CompilerFailed(what) => write!(f, "compiler failed: {what}"),
            EmuError::BadObject(what) => write!(f, "bad object: {what}"),
            EmuError::UnsupportedReloc(kind) => {
                write!(f, "unsupported relocation type: {kind}")
            }
        }
    }
}

impl std::error::Error for EmuError {}

impl From<io::Error> for EmuError {
    fn from(e: io::Error) -> Self {
        EmuError::Io(e)
    }
}
