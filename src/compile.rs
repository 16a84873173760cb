//! Compile pipeline: C source to installed native code.
//!
//! The generated translation unit is piped into `clang -O3 -c` and the
//! resulting relocatable object is linked by hand: `.rodata.*` sections
//! (clang emits them for floating-point literals and switch tables) are
//! copied into the code cache first, `.text` directly after, and each
//! `R_X86_64_PC32` entry in `.rela.text` is patched using section-relative
//! addresses: the bump allocator keeps the sections' relative layout, so
//! no symbol table beyond `st_value` is needed. Any other relocation type
//! is fatal.
//!
//! x86_64 hosts only: the relocation model and the RWX install path assume
//! the host ISA reads its own stores.

use std::io::Write;
use std::process::{Command, Stdio};

use goblin::elf::reloc::R_X86_64_PC32;
use goblin::elf::{Elf, SectionHeader};

use crate::cache::CodeCache;
use crate::error::{EmuError, Result};

/// Compile `source` and install the resulting code under `pc`.
///
/// Returns the entry address of the installed `.text`.
///
/// # Errors
///
/// Fails if `clang` cannot be spawned, rejects the source, or emits an
/// object with a relocation type the mini-linker does not handle.
pub fn compile_and_install(cache: &mut CodeCache, pc: u64, source: &str) -> Result<*const u8> {
    let mut child = Command::new("clang")
        .args(["-O3", "-c", "-xc", "-o", "/dev/stdout", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| EmuError::CompilerFailed(format!("cannot spawn clang: {e}")))?;

    child
        .stdin
        .take()
        .ok_or_else(|| EmuError::CompilerFailed("clang stdin not captured".into()))?
        .write_all(source.as_bytes())?;

    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(EmuError::CompilerFailed(format!(
            "clang exited with {}",
            output.status
        )));
    }
    if output.stdout.is_empty() {
        return Err(EmuError::CompilerFailed("clang produced no object".into()));
    }

    install_object(cache, pc, &output.stdout)
}

/// Parse the relocatable object, copy its code (and constants) into the
/// cache, and apply the text relocations.
fn install_object(cache: &mut CodeCache, pc: u64, object: &[u8]) -> Result<*const u8> {
    let elf = Elf::parse(object).map_err(|_| EmuError::BadObject("unparseable object"))?;

    let mut text: Option<&SectionHeader> = None;
    let mut rela_text_idx: Option<usize> = None;
    let mut rodata: Vec<&SectionHeader> = Vec::new();

    for (idx, shdr) in elf.section_headers.iter().enumerate() {
        match elf.shdr_strtab.get_at(shdr.sh_name) {
            Some(".text") => text = Some(shdr),
            Some(".rela.text") => rela_text_idx = Some(idx),
            Some(name) if name.starts_with(".rodata.") => rodata.push(shdr),
            _ => {}
        }
    }

    let text = text.ok_or(EmuError::BadObject("no .text section"))?;
    let text_range = text.sh_offset as usize..(text.sh_offset + text.sh_size) as usize;
    let text_bytes = object
        .get(text_range)
        .ok_or(EmuError::BadObject("truncated .text"))?;

    // Without relocations or constants, the text stands alone.
    if rela_text_idx.is_none() || rodata.is_empty() {
        return Ok(cache.add(pc, text_bytes, text.sh_addralign));
    }

    for shdr in &rodata {
        let range = shdr.sh_offset as usize..(shdr.sh_offset + shdr.sh_size) as usize;
        let bytes = object
            .get(range)
            .ok_or(EmuError::BadObject("truncated .rodata"))?;
        cache.add(pc, bytes, shdr.sh_addralign);
    }
    let text_addr = cache.add(pc, text_bytes, text.sh_addralign);

    let relocs = elf
        .shdr_relocs
        .iter()
        .find(|(idx, _)| Some(*idx) == rela_text_idx)
        .map(|(_, relocs)| relocs)
        .ok_or(EmuError::BadObject("missing .rela.text entries"))?;

    for reloc in relocs.iter() {
        if reloc.r_type != R_X86_64_PC32 {
            return Err(EmuError::UnsupportedReloc(reloc.r_type));
        }
        let sym = elf
            .syms
            .get(reloc.r_sym)
            .ok_or(EmuError::BadObject("relocation against missing symbol"))?;

        // Section-relative arithmetic: text and rodata keep the same
        // relative layout in the cache as in the object.
        let value = sym.st_value as i64 + reloc.r_addend.unwrap_or(0) - reloc.r_offset as i64;
        // SAFETY: r_offset addresses a 32-bit slot inside the text copy we
        // just installed; the arena is writable.
        unsafe {
            let loc = text_addr.add(reloc.r_offset as usize) as *mut u32;
            core::ptr::write_unaligned(loc, value as u32);
        }
    }

    Ok(text_addr)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn clang_available() -> bool {
        Command::new("clang")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_compile_trivial_function() {
        if !clang_available() {
            eprintln!("clang not in PATH, skipping");
            return;
        }

        let mut cache = CodeCache::new();
        let source = "\
typedef struct { unsigned long long a; unsigned long long b; } pair_t;
void start(pair_t *p) { p->a = p->b + 1; }
";
        let code = compile_and_install(&mut cache, 0x1000, source).unwrap();

        #[repr(C)]
        struct Pair {
            a: u64,
            b: u64,
        }
        let mut pair = Pair { a: 0, b: 41 };
        let f: unsafe extern "C" fn(*mut Pair) = unsafe { core::mem::transmute(code) };
        unsafe { f(&mut pair) };
        assert_eq!(pair.a, 42);
    }

    #[test]
    fn test_compile_rejects_bad_source() {
        if !clang_available() {
            eprintln!("clang not in PATH, skipping");
            return;
        }

        let mut cache = CodeCache::new();
        assert!(compile_and_install(&mut cache, 0x1000, "not C at all {").is_err());
    }

    #[test]
    fn test_install_rejects_garbage_object() {
        let mut cache = CodeCache::new();
        assert!(install_object(&mut cache, 0x1000, b"\x7fELFjunk").is_err());
    }
}
