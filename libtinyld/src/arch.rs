//! Abstraction over different CPU architectures.

use crate::bail;
use crate::elf::BASE_ADDRESS;
use crate::error::Result;
use object::elf::EM_AARCH64;
use object::elf::EM_X86_64;
use std::borrow::Cow;

pub(crate) trait Arch {
    /// Get ELF header magic for the architecture.
    fn elf_header_arch_magic() -> u16;

    /// Get string representation of a relocation specific for the architecture.
    fn rel_type_to_string(r_type: u32) -> Cow<'static, str>;

    /// Computes and writes one relocation into `section_data`. Unknown relocation types and
    /// unencodable values the architecture has no recovery story for are errors; everything else
    /// is reported through the returned outcome.
    fn apply_relocation(
        rel: &RelocationContext,
        section_data: &mut [u8],
    ) -> Result<RelocationOutcome>;

    /// Write a PLT entry (a 16 byte stub) that jumps through the GOT slot at `got_address`.
    fn write_plt_entry(plt_entry: &mut [u8], got_address: u64, plt_address: u64) -> Result;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Architecture {
    X86_64,
    AArch64,
}

impl TryFrom<u16> for Architecture {
    type Error = anyhow::Error;

    fn try_from(arch: u16) -> Result<Self, Self::Error> {
        match arch {
            EM_X86_64 => Ok(Self::X86_64),
            EM_AARCH64 => Ok(Self::AArch64),
            _ => bail!("Unsupported architecture: 0x{:x}, expected x86-64 or ARM64", arch),
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Architecture::X86_64 => f.write_str("x86-64"),
            Architecture::AArch64 => f.write_str("aarch64"),
        }
    }
}

/// Everything an architecture needs in order to compute one relocation. Using the conventional
/// single-letter names: S is the resolved symbol value, A the addend, P the address of the place
/// being patched and B the base load address.
pub(crate) struct RelocationContext {
    pub(crate) r_type: u32,
    /// S
    pub(crate) symbol_value: u64,
    pub(crate) symbol_size: u64,
    /// A
    pub(crate) addend: i64,
    /// P. Always equals `section vma + offset`.
    pub(crate) place: u64,
    /// Offset of the patch site within the section data passed alongside.
    pub(crate) offset: u64,
}

impl RelocationContext {
    /// B
    pub(crate) fn base_address(&self) -> u64 {
        BASE_ADDRESS
    }
}

#[derive(Debug)]
pub(crate) enum RelocationOutcome {
    Applied,
    /// The computed displacement doesn't fit the encoding and the site was left unwritten. Only
    /// produced for relocation kinds the engine can repair by routing through a PLT stub.
    Overflowed,
    /// The relocation was not applied; the reason is reported as a warning and the link
    /// continues.
    Skipped(Cow<'static, str>),
}

pub(crate) fn fits_signed_32(value: i64) -> bool {
    i32::try_from(value).is_ok()
}

pub(crate) fn fits_unsigned_32(value: u64) -> bool {
    u32::try_from(value).is_ok()
}

/// Writes `bytes` into `data` at `offset`, failing if the write would extend past the end of the
/// section.
pub(crate) fn write_bytes(
    data: &mut [u8],
    offset: u64,
    bytes: &[u8],
    rel_name: &str,
) -> Result {
    let start = offset as usize;
    let Some(out) = data.get_mut(start..start + bytes.len()) else {
        bail!("{rel_name} relocation exceeds section bounds");
    };
    out.copy_from_slice(bytes);
    Ok(())
}

/// Reads the 32-bit instruction word at `offset`. AArch64 relocations patch immediate fields
/// inside an existing instruction rather than replacing whole words.
pub(crate) fn read_insn(data: &[u8], offset: u64, rel_name: &str) -> Result<u32> {
    let start = offset as usize;
    let Some(bytes) = data.get(start..start + 4) else {
        bail!("{rel_name} relocation exceeds section bounds");
    };
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}
