//! Guest address space.
//!
//! The guest lives in a contiguous window of host virtual memory at a fixed
//! bias: guest address `g` is host address `g + GUEST_BIAS`. Address
//! translation is therefore a single add, and compiled blocks inline it as
//! the `GUEST_TO_HOST` macro. `GuestSpace` owns the window: it maps the ELF
//! image with `MAP_FIXED` file-backed mappings and grows or shrinks the
//! heap area with a signed bump allocator.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::AsRawFd;

use goblin::elf::header::EM_RISCV;
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_LOAD};
use goblin::elf::{Elf, ProgramHeader};

use crate::error::{EmuError, Result};

/// Fixed offset between guest and host addresses.
pub const GUEST_BIAS: u64 = 0x0000_0888_0000_0000;

/// Translate a guest address to the host address backing it.
#[inline]
pub const fn to_host(addr: u64) -> u64 {
    addr + GUEST_BIAS
}

/// Translate a host address inside the guest window back to guest space.
#[inline]
pub const fn to_guest(addr: u64) -> u64 {
    addr - GUEST_BIAS
}

/// Read a value from guest memory.
///
/// # Safety
///
/// `addr` must lie inside a mapped guest region with at least
/// `size_of::<T>()` readable bytes.
#[inline]
pub unsafe fn read_guest<T: Copy>(addr: u64) -> T {
    core::ptr::read_unaligned(to_host(addr) as *const T)
}

/// Write a value into guest memory.
///
/// # Safety
///
/// `addr` must lie inside a mapped, writable guest region with at least
/// `size_of::<T>()` bytes of room.
#[inline]
pub unsafe fn write_guest<T>(addr: u64, val: T) {
    core::ptr::write_unaligned(to_host(addr) as *mut T, val);
}

#[inline]
fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

#[inline]
const fn round_down(val: u64, align: u64) -> u64 {
    val & !(align - 1)
}

#[inline]
const fn round_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

/// The guest memory window: ELF image plus the bump-allocated area above it.
///
/// ```text
/// [             | host_alloc        ]
/// [     ELF     | heap/stack |      ]
/// [             | base       | alloc]
/// ```
#[derive(Debug, Default)]
pub struct GuestSpace {
    /// Guest pc of the executable's entry point.
    pub entry: u64,
    /// First guest address past the loaded image; floor of the allocator.
    pub base: u64,
    /// Current guest break.
    pub alloc: u64,
    /// Host-side high-water mark of the mapping, page aligned.
    pub host_alloc: u64,
}

impl GuestSpace {
    pub fn new() -> Self {
        GuestSpace::default()
    }

    /// Map a statically linked RV64 executable into the guest window and
    /// record its entry point.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or is not a 64-bit little-endian
    /// RISC-V ELF.
    pub fn load_elf(&mut self, file: &mut File) -> Result<()> {
        let mut image = Vec::new();
        file.read_to_end(&mut image)?;

        let elf = Elf::parse(&image).map_err(|_| EmuError::BadElf("not an ELF image"))?;
        if !elf.is_64 {
            return Err(EmuError::BadElf("not a 64-bit ELF"));
        }
        if !elf.little_endian {
            return Err(EmuError::BadElf("not little-endian"));
        }
        if elf.header.e_machine != EM_RISCV {
            return Err(EmuError::BadElf("machine is not RISC-V"));
        }

        self.entry = elf.header.e_entry;

        for phdr in elf.program_headers.iter().filter(|p| p.p_type == PT_LOAD) {
            self.load_segment(file, phdr)?;
        }
        Ok(())
    }

    /// Map one PT_LOAD segment at its biased address: a file-backed private
    /// mapping for the file-sized portion, plus an anonymous mapping for
    /// the zero-filled remainder.
    fn load_segment(&mut self, file: &File, phdr: &ProgramHeader) -> Result<()> {
        let page = page_size();

        let vaddr = to_host(phdr.p_vaddr);
        let aligned_vaddr = round_down(vaddr, page);
        let filesz = phdr.p_filesz + (vaddr - aligned_vaddr);
        let memsz = phdr.p_memsz + (vaddr - aligned_vaddr);
        let prot = flags_to_prot(phdr.p_flags);

        // SAFETY: MAP_FIXED inside the guest window, which this process
        // reserves by construction of the bias.
        let addr = unsafe {
            libc::mmap(
                aligned_vaddr as *mut libc::c_void,
                filesz as usize,
                prot,
                libc::MAP_PRIVATE | libc::MAP_FIXED,
                file.as_raw_fd(),
                round_down(phdr.p_offset, page) as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(EmuError::Io(io::Error::last_os_error()));
        }

        let file_end = round_up(filesz, page);
        let bss = round_up(memsz, page) - file_end;
        if bss > 0 {
            // SAFETY: extends the same fixed window; anonymous pages come
            // back zeroed, which is exactly what bss needs.
            let addr = unsafe {
                libc::mmap(
                    (aligned_vaddr + file_end) as *mut libc::c_void,
                    bss as usize,
                    prot,
                    libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_FIXED,
                    -1,
                    0,
                )
            };
            if addr == libc::MAP_FAILED {
                return Err(EmuError::Io(io::Error::last_os_error()));
            }
        }

        self.host_alloc = self.host_alloc.max(aligned_vaddr + round_up(memsz, page));
        self.base = to_guest(self.host_alloc);
        self.alloc = self.base;
        Ok(())
    }

    /// Signed bump allocation over the guest heap area.
    ///
    /// A positive `size` grows the break, extending the host mapping in
    /// whole pages when the break crosses the mapped high-water mark. A
    /// negative `size` retreats it, unmapping any whole pages freed below
    /// the mark. Returns the guest address of the previous break.
    ///
    /// Fatal on mmap failure or if the break would drop below the image.
    pub fn alloc(&mut self, size: i64) -> u64 {
        let page = page_size();
        let old = self.alloc;
        assert!(old >= self.base, "guest break below image base");

        self.alloc = self.alloc.wrapping_add(size as u64);
        assert!(self.alloc >= self.base, "guest break below image base");

        if size > 0 && to_guest(self.host_alloc) < self.alloc {
            let len = round_up(size as u64, page);
            // SAFETY: anonymous RW extension of the fixed guest window.
            let addr = unsafe {
                libc::mmap(
                    self.host_alloc as *mut libc::c_void,
                    len as usize,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_FIXED,
                    -1,
                    0,
                )
            };
            assert!(
                addr != libc::MAP_FAILED,
                "mmap: {}",
                io::Error::last_os_error()
            );
            self.host_alloc += len;
        } else if size < 0 {
            let keep = to_host(round_up(self.alloc, page));
            if keep < self.host_alloc {
                let len = self.host_alloc - keep;
                // SAFETY: unmaps only the freed tail of the guest window.
                let ret = unsafe { libc::munmap(keep as *mut libc::c_void, len as usize) };
                assert!(ret == 0, "munmap: {}", io::Error::last_os_error());
                self.host_alloc = keep;
            }
        }

        old
    }

    /// Copy raw bytes into guest memory. No protection check; the target
    /// range must already be mapped.
    pub fn write(&self, addr: u64, data: &[u8]) {
        // SAFETY: caller keeps writes inside regions it allocated.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), to_host(addr) as *mut u8, data.len());
        }
    }
}

fn flags_to_prot(flags: u32) -> i32 {
    let mut prot = 0;
    if flags & PF_R != 0 {
        prot |= libc::PROT_READ;
    }
    if flags & PF_W != 0 {
        prot |= libc::PROT_WRITE;
    }
    if flags & PF_X != 0 {
        prot |= libc::PROT_EXEC;
    }
    prot
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn space_with_base(base: u64) -> GuestSpace {
        GuestSpace {
            entry: 0,
            base,
            alloc: base,
            host_alloc: to_host(base),
        }
    }

    #[test]
    fn test_translation_is_bias_add() {
        assert_eq!(to_host(0x1000), GUEST_BIAS + 0x1000);
        assert_eq!(to_guest(to_host(0xdead_0000)), 0xdead_0000);
    }

    #[test]
    fn test_alloc_grow_and_shrink_restores_break() {
        // A window nobody else uses; page-aligned.
        let base = 0x7100_0000;
        let mut mmu = space_with_base(base);

        let start = mmu.alloc(0);
        assert_eq!(start, base);

        let old = mmu.alloc(64 * 1024);
        assert_eq!(old, base);
        assert_eq!(mmu.alloc, base + 64 * 1024);
        assert_eq!(mmu.host_alloc, to_host(base + 64 * 1024));

        // The fresh pages are mapped and zeroed.
        let val: u64 = unsafe { read_guest(base + 4096) };
        assert_eq!(val, 0);

        let old = mmu.alloc(-(64 * 1024));
        assert_eq!(old, base + 64 * 1024);
        assert_eq!(mmu.alloc, base);
        assert_eq!(mmu.host_alloc, to_host(base));
    }

    #[test]
    fn test_alloc_partial_page_retreat() {
        let base = 0x7200_0000;
        let mut mmu = space_with_base(base);

        mmu.alloc(8192);
        // Retreating by less than a page keeps the last page mapped.
        mmu.alloc(-100);
        assert_eq!(mmu.alloc, base + 8192 - 100);
        assert_eq!(mmu.host_alloc, to_host(base + 8192));

        mmu.alloc(-(8192 - 100));
        assert_eq!(mmu.alloc, base);
        assert_eq!(mmu.host_alloc, to_host(base));
    }

    #[test]
    fn test_write_then_read_back() {
        let base = 0x7300_0000;
        let mut mmu = space_with_base(base);
        mmu.alloc(4096);

        mmu.write(base, b"\x37\x13");
        let val: u16 = unsafe { read_guest(base) };
        assert_eq!(val, 0x1337);
    }
}
