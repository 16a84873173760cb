//! Linux RV64 syscall shim.
//!
//! The dispatcher returns to the run loop on every `ecall`; this module
//! reads the guest's `a7`/`a0..a5`, performs the host-side action, and the
//! run loop writes the result back into `a0`. Guest pointers are
//! translated with the fixed bias and handed to the host syscall directly,
//! so host and guest must agree on the struct layouts involved (true for
//! the types used here except `struct stat`, which is carried host-layout
//! as a known limitation).
//!
//! Syscall numbers follow the RV64 Linux ABI (the riscv-pk numbering).
//! Anything not implemented is fatal with the number in the diagnostic.

use std::io;

use log::trace;

use crate::error::{EmuError, Result};
use crate::machine::Machine;
use crate::mmu::{read_guest, to_host};
use crate::registers::GpReg;

/// RV64 Linux syscall numbers.
pub mod nr {
    pub const IOCTL: u64 = 29;
    pub const OPENAT: u64 = 56;
    pub const CLOSE: u64 = 57;
    pub const LSEEK: u64 = 62;
    pub const READ: u64 = 63;
    pub const WRITE: u64 = 64;
    pub const WRITEV: u64 = 66;
    pub const FSTAT: u64 = 80;
    pub const EXIT: u64 = 93;
    pub const EXIT_GROUP: u64 = 94;
    pub const SET_TID_ADDRESS: u64 = 96;
    pub const SET_ROBUST_LIST: u64 = 99;
    pub const CLOCK_GETTIME: u64 = 113;
    pub const RT_SIGACTION: u64 = 134;
    pub const RT_SIGPROCMASK: u64 = 135;
    pub const GETTIMEOFDAY: u64 = 169;
    pub const GETPID: u64 = 172;
    pub const GETUID: u64 = 174;
    pub const GETEUID: u64 = 175;
    pub const GETGID: u64 = 176;
    pub const GETEGID: u64 = 177;
    pub const GETTID: u64 = 178;
    pub const BRK: u64 = 214;
    pub const MUNMAP: u64 = 215;
    pub const MMAP: u64 = 222;
}

/// Fold a host libc return value into the kernel convention the guest
/// expects: negative errno on failure.
fn host_ret(ret: i64) -> u64 {
    if ret == -1 {
        let errno = io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EINVAL);
        (-i64::from(errno)) as u64
    } else {
        ret as u64
    }
}

/// Handle one environment call. The caller writes the returned value into
/// the guest's `a0`.
///
/// # Errors
///
/// [`EmuError::UnknownSyscall`] for numbers outside the implemented set;
/// [`EmuError::Unsupported`] for implemented numbers used in a mode the
/// shim does not cover.
pub fn handle(m: &mut Machine, n: u64) -> Result<u64> {
    let a0 = m.gp_reg(GpReg::A0);
    let a1 = m.gp_reg(GpReg::A1);
    let a2 = m.gp_reg(GpReg::A2);
    let a3 = m.gp_reg(GpReg::A3);
    trace!("syscall {n}({a0:#x}, {a1:#x}, {a2:#x}, {a3:#x})");

    match n {
        nr::EXIT | nr::EXIT_GROUP => {
            trace!("guest exit with status {}", a0 as i64);
            std::process::exit(a0 as i32);
        }
        nr::READ => {
            // SAFETY: the guest owns the buffer; the host writes through
            // the bias into the same pages.
            let ret = unsafe {
                libc::read(a0 as i32, to_host(a1) as *mut libc::c_void, a2 as usize)
            };
            Ok(host_ret(ret as i64))
        }
        nr::WRITE => {
            let ret = unsafe {
                libc::write(a0 as i32, to_host(a1) as *const libc::c_void, a2 as usize)
            };
            Ok(host_ret(ret as i64))
        }
        nr::WRITEV => {
            let mut iovs = Vec::with_capacity(a2 as usize);
            for i in 0..a2 {
                let base: u64 = unsafe { read_guest(a1 + i * 16) };
                let len: u64 = unsafe { read_guest(a1 + i * 16 + 8) };
                iovs.push(libc::iovec {
                    iov_base: to_host(base) as *mut libc::c_void,
                    iov_len: len as usize,
                });
            }
            let ret = unsafe { libc::writev(a0 as i32, iovs.as_ptr(), iovs.len() as i32) };
            Ok(host_ret(ret as i64))
        }
        nr::OPENAT => {
            let ret = unsafe {
                libc::openat(
                    a0 as i32,
                    to_host(a1) as *const libc::c_char,
                    a2 as i32,
                    a3 as libc::mode_t,
                )
            };
            Ok(host_ret(i64::from(ret)))
        }
        nr::CLOSE => {
            // Leave the emulator's stdio alone.
            if (a0 as i32) <= 2 {
                return Ok(0);
            }
            Ok(host_ret(i64::from(unsafe { libc::close(a0 as i32) })))
        }
        nr::LSEEK => {
            let ret = unsafe { libc::lseek(a0 as i32, a1 as libc::off_t, a2 as i32) };
            Ok(host_ret(ret))
        }
        nr::FSTAT => {
            let ret = unsafe { libc::fstat(a0 as i32, to_host(a1) as *mut libc::stat) };
            Ok(host_ret(i64::from(ret)))
        }
        nr::BRK => {
            let cur = m.mmu.alloc(0);
            if a0 == 0 {
                return Ok(cur);
            }
            m.mmu.alloc(a0 as i64 - cur as i64);
            Ok(a0)
        }
        nr::MMAP => {
            if a0 != 0 {
                return Err(EmuError::Unsupported("mmap at a fixed guest address"));
            }
            // The guest expects page-aligned regions: realign the break,
            // then hand out whole pages.
            let page = 4096u64;
            let cur = m.mmu.alloc(0);
            let pad = cur.next_multiple_of(page) - cur;
            if pad > 0 {
                m.mmu.alloc(pad as i64);
            }
            let len = (a1.max(1)).next_multiple_of(page);
            Ok(m.mmu.alloc(len as i64))
        }
        nr::MUNMAP => Ok(0),
        nr::GETTIMEOFDAY => {
            let ret = unsafe {
                libc::gettimeofday(to_host(a0) as *mut libc::timeval, core::ptr::null_mut())
            };
            Ok(host_ret(i64::from(ret)))
        }
        nr::CLOCK_GETTIME => {
            let ret = unsafe {
                libc::clock_gettime(a0 as libc::clockid_t, to_host(a1) as *mut libc::timespec)
            };
            Ok(host_ret(i64::from(ret)))
        }
        nr::GETPID => Ok(unsafe { libc::getpid() } as u64),
        nr::GETTID => Ok(unsafe { libc::gettid() } as u64),
        nr::GETUID => Ok(u64::from(unsafe { libc::getuid() })),
        nr::GETEUID => Ok(u64::from(unsafe { libc::geteuid() })),
        nr::GETGID => Ok(u64::from(unsafe { libc::getgid() })),
        nr::GETEGID => Ok(u64::from(unsafe { libc::getegid() })),
        // Thread bookkeeping and signal setup have nothing to manage in a
        // single-threaded guest; report success.
        nr::SET_TID_ADDRESS | nr::SET_ROBUST_LIST | nr::RT_SIGACTION
        | nr::RT_SIGPROCMASK | nr::IOCTL => Ok(0),
        _ => Err(EmuError::UnknownSyscall(n)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu;

    fn machine_with_heap(base: u64) -> Machine {
        let mut m = Machine::new();
        m.mmu.base = base;
        m.mmu.alloc = base;
        m.mmu.host_alloc = mmu::to_host(base);
        m
    }

    #[test]
    fn test_write_round_trips_through_a_pipe() {
        let base = 0x7600_0000;
        let mut m = machine_with_heap(base);
        m.mmu.alloc(4096);
        m.mmu.write(base, b"hello");

        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        m.set_gp_reg(GpReg::A0, fds[1] as u64);
        m.set_gp_reg(GpReg::A1, base);
        m.set_gp_reg(GpReg::A2, 5);
        let written = handle(&mut m, nr::WRITE).unwrap();
        assert_eq!(written, 5);

        let mut buf = [0u8; 5];
        let n = unsafe { libc::read(fds[0], buf.as_mut_ptr().cast(), 5) };
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_brk_moves_the_guest_break() {
        let base = 0x7700_0000;
        let mut m = machine_with_heap(base);

        m.set_gp_reg(GpReg::A0, 0);
        assert_eq!(handle(&mut m, nr::BRK).unwrap(), base);

        m.set_gp_reg(GpReg::A0, base + 0x4000);
        assert_eq!(handle(&mut m, nr::BRK).unwrap(), base + 0x4000);
        assert_eq!(m.mmu.alloc, base + 0x4000);

        // The fresh break is usable memory.
        m.mmu.write(base + 0x3ff8, &42u64.to_le_bytes());
    }

    #[test]
    fn test_anonymous_mmap_allocates() {
        let base = 0x7800_0000;
        let mut m = machine_with_heap(base);

        m.set_gp_reg(GpReg::A0, 0);
        m.set_gp_reg(GpReg::A1, 8192);
        let addr = handle(&mut m, nr::MMAP).unwrap();
        assert_eq!(addr, base);
        m.mmu.write(addr, &[1, 2, 3]);

        m.set_gp_reg(GpReg::A0, 0x1234_5000);
        assert!(handle(&mut m, nr::MMAP).is_err());
    }

    #[test]
    fn test_unknown_syscall_is_fatal() {
        let mut m = Machine::new();
        m.set_gp_reg(GpReg::A7, 4095);
        assert!(matches!(
            handle(&mut m, 4095),
            Err(EmuError::UnknownSyscall(4095))
        ));
    }

    #[test]
    fn test_stdio_close_is_guarded() {
        let mut m = Machine::new();
        m.set_gp_reg(GpReg::A0, 1);
        assert_eq!(handle(&mut m, nr::CLOSE).unwrap(), 0);
    }
}
