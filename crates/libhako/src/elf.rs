//! Native dynamic-link dependency discovery.
//!
//! Base image provisioning needs to know which shared objects a host binary
//! pulls in. Instead of forking `ldd`, the program headers are read
//! directly: `PT_INTERP` names the dynamic linker and `PT_DYNAMIC` carries
//! the `DT_NEEDED` entries, with sonames resolved against the standard
//! library directories. Only ELF64 little-endian objects are considered;
//! anything else reports an empty dependency set.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;

const DT_NULL: i64 = 0;
const DT_NEEDED: i64 = 1;
const DT_STRTAB: i64 = 5;

/// Directories the dynamic linker searches on the hosts we provision from.
pub const LIB_SEARCH_DIRS: [&str; 5] = [
    "/lib/x86_64-linux-gnu",
    "/usr/lib/x86_64-linux-gnu",
    "/lib64",
    "/lib",
    "/usr/lib",
];

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ElfDeps {
    /// `PT_INTERP` path, absent for static binaries and shared objects.
    pub interpreter: Option<PathBuf>,
    /// `DT_NEEDED` sonames in file order.
    pub needed: Vec<String>,
}

/// Reads the direct dependencies of one object file.
pub fn read_deps(path: &Path) -> Result<ElfDeps> {
    let image = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(parse_deps(&image).unwrap_or_default())
}

/// Transitive closure of host paths a binary needs at runtime: the
/// interpreter plus every resolvable `DT_NEEDED`, recursively. Unresolvable
/// sonames are skipped; the provisioning caller copies what exists.
pub fn library_closure(binary: &Path) -> Result<Vec<PathBuf>> {
    let search_dirs: Vec<PathBuf> = LIB_SEARCH_DIRS.iter().map(PathBuf::from).collect();
    library_closure_in(binary, &search_dirs)
}

pub fn library_closure_in(binary: &Path, search_dirs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut resolved = BTreeSet::new();
    let mut queue = vec![binary.to_path_buf()];
    let mut first = true;

    while let Some(object) = queue.pop() {
        let deps = match read_deps(&object) {
            Ok(deps) => deps,
            // The root binary must be readable; later objects are best-effort.
            Err(e) if first => return Err(e),
            Err(_) => continue,
        };
        first = false;

        if let Some(interp) = deps.interpreter
            && interp.is_file()
            && resolved.insert(interp.clone())
        {
            queue.push(interp);
        }
        for soname in deps.needed {
            if let Some(lib) = resolve_soname(&soname, search_dirs)
                && resolved.insert(lib.clone())
            {
                queue.push(lib);
            }
        }
    }
    Ok(resolved.into_iter().collect())
}

pub fn resolve_soname(soname: &str, search_dirs: &[PathBuf]) -> Option<PathBuf> {
    search_dirs
        .iter()
        .map(|dir| dir.join(soname))
        .find(|candidate| candidate.is_file())
}

fn parse_deps(image: &[u8]) -> Option<ElfDeps> {
    if image.len() < 0x40 || image[..4] != ELF_MAGIC {
        return None;
    }
    if image[4] != ELFCLASS64 || image[5] != ELFDATA2LSB {
        return None;
    }

    let phoff = read_u64(image, 0x20)?;
    let phentsize = read_u16(image, 0x36)? as u64;
    let phnum = read_u16(image, 0x38)? as u64;
    if phentsize < 0x38 {
        return None;
    }

    let mut interpreter = None;
    let mut dynamic = None;
    let mut loads = Vec::new();

    for i in 0..phnum {
        let ph = phoff.checked_add(i * phentsize)? as usize;
        let p_type = read_u32(image, ph)?;
        let p_offset = read_u64(image, ph + 0x08)?;
        let p_vaddr = read_u64(image, ph + 0x10)?;
        let p_filesz = read_u64(image, ph + 0x20)?;

        match p_type {
            PT_INTERP => {
                let raw = slice(image, p_offset, p_filesz)?;
                let text = cstr(raw)?;
                interpreter = Some(PathBuf::from(text));
            }
            PT_DYNAMIC => dynamic = Some((p_offset, p_filesz)),
            PT_LOAD => loads.push((p_vaddr, p_offset, p_filesz)),
            _ => {}
        }
    }

    let mut needed = Vec::new();
    if let Some((dyn_off, dyn_sz)) = dynamic {
        let entries = slice(image, dyn_off, dyn_sz)?;
        let mut needed_offsets = Vec::new();
        let mut strtab_vaddr = None;

        for entry in entries.chunks_exact(16) {
            let d_tag = i64::from_le_bytes(entry[..8].try_into().ok()?);
            let d_val = u64::from_le_bytes(entry[8..].try_into().ok()?);
            match d_tag {
                DT_NULL => break,
                DT_NEEDED => needed_offsets.push(d_val),
                DT_STRTAB => strtab_vaddr = Some(d_val),
                _ => {}
            }
        }

        if let Some(vaddr) = strtab_vaddr {
            let strtab_off = vaddr_to_offset(&loads, vaddr)?;
            for name_off in needed_offsets {
                let start = strtab_off.checked_add(name_off)? as usize;
                if start >= image.len() {
                    return None;
                }
                needed.push(cstr(&image[start..])?.to_string());
            }
        }
    }

    Some(ElfDeps {
        interpreter,
        needed,
    })
}

fn vaddr_to_offset(loads: &[(u64, u64, u64)], vaddr: u64) -> Option<u64> {
    loads
        .iter()
        .find(|(p_vaddr, _, p_filesz)| vaddr >= *p_vaddr && vaddr < p_vaddr + p_filesz)
        .map(|(p_vaddr, p_offset, _)| vaddr - p_vaddr + p_offset)
}

fn cstr(raw: &[u8]) -> Option<&str> {
    let end = raw.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&raw[..end]).ok()
}

fn slice(image: &[u8], offset: u64, len: u64) -> Option<&[u8]> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    image.get(start..end)
}

fn read_u16(image: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_le_bytes(image.get(offset..offset + 2)?.try_into().ok()?))
}

fn read_u32(image: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_le_bytes(image.get(offset..offset + 4)?.try_into().ok()?))
}

fn read_u64(image: &[u8], offset: usize) -> Option<u64> {
    Some(u64::from_le_bytes(image.get(offset..offset + 8)?.try_into().ok()?))
}
