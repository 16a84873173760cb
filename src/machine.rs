//! Machine assembly and the dispatch loop.
//!
//! `Machine` ties the pieces together: guest memory, architectural state,
//! and the code cache. [`Machine::step`] is the dispatcher: it runs guest
//! blocks (interpreted while cold, native once hot) and chains them through
//! the exit channel until the guest traps into an environment call, which
//! is handed back to the caller's syscall loop.

use std::fs::File;

use log::{debug, info};

use crate::cache::CodeCache;
use crate::codegen;
use crate::compile;
use crate::error::Result;
use crate::interp;
use crate::mmu::GuestSpace;
use crate::registers::GpReg;
use crate::state::{ExitReason, State};

/// Guest stack size: 32 MiB, allocated out of the guest heap area.
const STACK_SIZE: u64 = 32 * 1024 * 1024;

/// Signature of a compiled block. The pointee layout is pinned by the
/// `state_t` declaration the emitter generates.
type NativeBlock = unsafe extern "C" fn(*mut State);

/// An emulated RV64 machine.
pub struct Machine {
    pub state: State,
    pub mmu: GuestSpace,
    cache: CodeCache,
}

impl Machine {
    pub fn new() -> Self {
        Machine {
            state: State::new(),
            mmu: GuestSpace::new(),
            cache: CodeCache::new(),
        }
    }

    /// Map the guest executable and point the machine at its entry.
    pub fn load_program(&mut self, path: &str) -> Result<()> {
        let mut file = File::open(path)?;
        self.mmu.load_elf(&mut file)?;
        self.state.pc = self.mmu.entry;
        debug!(
            "loaded {path}: entry {:#x}, image end {:#x}",
            self.mmu.entry, self.mmu.base
        );
        Ok(())
    }

    /// Build the guest stack: `sp` ends up pointing at
    /// `[argc, argv[0..argc], NULL, envp-NULL, auxv-NULL]`, with the
    /// argv strings copied into freshly allocated guest memory.
    pub fn setup(&mut self, argv: &[String]) {
        let stack_top = self.mmu.alloc(STACK_SIZE as i64) + STACK_SIZE;

        let mut ptrs = Vec::with_capacity(argv.len());
        for arg in argv {
            let bytes = arg.as_bytes();
            let addr = self.mmu.alloc(bytes.len() as i64 + 1);
            self.mmu.write(addr, bytes);
            self.mmu.write(addr + bytes.len() as u64, &[0]);
            ptrs.push(addr);
        }

        // argc + argv pointers + argv NULL + envp NULL + auxv NULL,
        // keeping sp 16-byte aligned as the psABI wants at entry.
        let words = 1 + ptrs.len() as u64 + 3;
        let sp = (stack_top - words * 8) & !15;

        self.mmu.write(sp, &(argv.len() as u64).to_le_bytes());
        for (i, ptr) in ptrs.iter().enumerate() {
            self.mmu
                .write(sp + 8 * (1 + i as u64), &ptr.to_le_bytes());
        }
        for i in 0..3 {
            let null_at = sp + 8 * (1 + ptrs.len() as u64 + i);
            self.mmu.write(null_at, &0u64.to_le_bytes());
        }

        self.state.set_gp_reg(GpReg::Sp, sp);
    }

    /// Read a guest register by ABI name.
    pub fn gp_reg(&self, reg: GpReg) -> u64 {
        self.state.gp_reg(reg)
    }

    /// Write a guest register by ABI name.
    pub fn set_gp_reg(&mut self, reg: GpReg, val: u64) {
        self.state.set_gp_reg(reg, val);
    }

    /// Run guest code until it raises an environment call.
    ///
    /// Each outer iteration picks the block for the current pc: native
    /// code if the pc is hot (compiling it on the promotion edge),
    /// otherwise the interpreter. The inner loop chains blocks: as long as
    /// a block exits into a pc whose code is already installed, the next
    /// block runs without touching the promotion path.
    pub fn step(&mut self) -> Result<ExitReason> {
        loop {
            let pc = self.state.pc;
            let mut code = self.cache.lookup(pc);

            if code.is_none() && self.cache.hot(pc) {
                info!("jit: promoting block at {pc:#x}");
                let source = codegen::gen_block(pc)?;
                debug!("generated source for {pc:#x}:\n{source}");
                code = Some(compile::compile_and_install(&mut self.cache, pc, &source)?);
            }

            loop {
                self.state.exit_reason = ExitReason::None;
                match code {
                    Some(ptr) => {
                        // SAFETY: ptr came from the cache, which only hands
                        // out entry points of fully installed blocks whose
                        // ABI is `NativeBlock`.
                        let block: NativeBlock = unsafe { core::mem::transmute(ptr) };
                        unsafe { block(&mut self.state) };
                    }
                    None => interp::exec_block(&mut self.state)?,
                }
                assert!(
                    self.state.exit_reason != ExitReason::None,
                    "block exited without setting a reason"
                );

                match self.state.exit_reason {
                    ExitReason::DirectBranch | ExitReason::IndirectBranch => {
                        match self.cache.lookup(self.state.reenter_pc) {
                            Some(next) => code = Some(next),
                            None => {
                                self.state.pc = self.state.reenter_pc;
                                break;
                            }
                        }
                    }
                    ExitReason::Ecall => {
                        self.state.pc = self.state.reenter_pc;
                        return Ok(ExitReason::Ecall);
                    }
                    ExitReason::None => unreachable!(),
                }
            }
        }
    }
}

impl Default for Machine {
    fn default() -> Self {
        Machine::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu::{self, to_host};

    fn map_guest_page(addr: u64) {
        let ret = unsafe {
            libc::mmap(
                to_host(addr) as *mut libc::c_void,
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

    fn clang_available() -> bool {
        std::process::Command::new("clang")
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_step_returns_on_ecall() {
        // add a0, a1, a2 ; ecall
        map_guest_page(0xb000);
        store_code(0xb000, &[0x00c5_8533, 0x0000_0073]);

        let mut m = Machine::new();
        m.state.pc = 0xb000;
        m.state.gp_regs[11] = 30;
        m.state.gp_regs[12] = 12;

        let reason = m.step().unwrap();
        assert_eq!(reason, ExitReason::Ecall);
        assert_eq!(m.gp_reg(GpReg::A0), 42);
        assert_eq!(m.state.pc, 0xb008);
    }

    #[test]
    fn test_step_chains_branches_through_interpreter() {
        // addi a0, a0, -1 ; bne a0, x0, -4 ; ecall
        map_guest_page(0xd000);
        store_code(0xd000, &[0xfff5_0513, 0xfe05_1ee3, 0x0000_0073]);

        let mut m = Machine::new();
        m.state.pc = 0xd000;
        m.state.gp_regs[10] = 17;

        let reason = m.step().unwrap();
        assert_eq!(reason, ExitReason::Ecall);
        assert_eq!(m.gp_reg(GpReg::A0), 0);
    }

    #[test]
    fn test_hot_loop_is_promoted_and_matches_interpreter() {
        if !clang_available() {
            eprintln!("clang not in PATH, skipping");
            return;
        }

        // The same countdown loop, iterated past the promotion threshold:
        // the tail of the loop runs as native code and must leave exactly
        // the state the interpreter would.
        map_guest_page(0xc000);
        store_code(0xc000, &[0xfff5_0513, 0xfe05_1ee3, 0x0000_0073]);

        let iterations = crate::cache::CACHE_HOT_COUNT + 50_000;
        let mut m = Machine::new();
        m.state.pc = 0xc000;
        m.state.gp_regs[10] = iterations;

        let reason = m.step().unwrap();
        assert_eq!(reason, ExitReason::Ecall);
        assert_eq!(m.gp_reg(GpReg::A0), 0);
        assert_eq!(m.state.pc, 0xc00c);
    }

    #[test]
    fn test_setup_builds_guest_stack() {
        let base = 0x7500_0000;
        let mut m = Machine::new();
        m.mmu.base = base;
        m.mmu.alloc = base;
        m.mmu.host_alloc = to_host(base);

        let argv = vec!["prog".to_string(), "arg1".to_string()];
        m.setup(&argv);

        let sp = m.gp_reg(GpReg::Sp);
        assert_eq!(sp % 16, 0);

        let argc: u64 = unsafe { mmu::read_guest(sp) };
        assert_eq!(argc, 2);

        let argv0: u64 = unsafe { mmu::read_guest(sp + 8) };
        let argv1: u64 = unsafe { mmu::read_guest(sp + 16) };
        let null: u64 = unsafe { mmu::read_guest(sp + 24) };
        assert_eq!(null, 0);

        let mut name = [0u8; 4];
        for (i, b) in name.iter_mut().enumerate() {
            *b = unsafe { mmu::read_guest(argv0 + i as u64) };
        }
        assert_eq!(&name, b"prog");
        let terminator: u8 = unsafe { mmu::read_guest(argv0 + 4) };
        assert_eq!(terminator, 0);

        let first: u8 = unsafe { mmu::read_guest(argv1) };
        assert_eq!(first, b'a');
    }
}
