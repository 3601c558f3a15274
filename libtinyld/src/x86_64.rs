//! x86-64 relocation application. Relocation types are decoded once into a closed enum and
//! applied with exhaustive matching; PC-relative 32-bit forms that can't be encoded report an
//! overflow so the engine can route them through a PLT stub in a second pass.

use crate::arch::Arch;
use crate::arch::RelocationContext;
use crate::arch::RelocationOutcome;
use crate::arch::fits_signed_32;
use crate::arch::fits_unsigned_32;
use crate::arch::write_bytes;
use crate::bail;
use crate::elf::PLT_ENTRY_SIZE;
use crate::elf::const_name_by_value;
use crate::error::Result;
use anyhow::anyhow;
use std::borrow::Cow;

pub(crate) struct X86_64;

const PLT_ENTRY_TEMPLATE: &[u8] = &[
    0xff, 0x25, 0x00, 0x00, 0x00, 0x00, // jmp *{relative GOT address}(%rip)
    0x90, 0x90, 0x90, 0x90, 0x90, // nop padding to the fixed stub size
    0x90, 0x90, 0x90, 0x90, 0x90,
];

const _ASSERTS: () = {
    assert!(PLT_ENTRY_TEMPLATE.len() as u64 == PLT_ENTRY_SIZE);
};

/// The closed set of x86-64 relocation kinds we understand. Decoding happens once per
/// relocation; anything not representable here is an unsupported-type error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelocationKind {
    Abs64,
    Pc32,
    Got32,
    Plt32,
    Copy,
    GlobDat,
    JumpSlot,
    Relative,
    GotPcRel,
    Abs32,
    Abs32Signed,
    Abs16,
    Pc16,
    Abs8,
    Pc8,
    /// Static links don't support any TLS model; all TLS forms are skipped with a warning.
    Tls,
    Pc64,
    GotOff64,
    Size32,
    Size64,
    GotPcRelX,
    RexGotPcRelX,
}

impl RelocationKind {
    fn from_raw(r_type: u32) -> Result<RelocationKind> {
        Ok(match r_type {
            object::elf::R_X86_64_64 => Self::Abs64,
            object::elf::R_X86_64_PC32 => Self::Pc32,
            object::elf::R_X86_64_GOT32 => Self::Got32,
            object::elf::R_X86_64_PLT32 => Self::Plt32,
            object::elf::R_X86_64_COPY => Self::Copy,
            object::elf::R_X86_64_GLOB_DAT => Self::GlobDat,
            object::elf::R_X86_64_JUMP_SLOT => Self::JumpSlot,
            object::elf::R_X86_64_RELATIVE => Self::Relative,
            object::elf::R_X86_64_GOTPCREL => Self::GotPcRel,
            object::elf::R_X86_64_32 => Self::Abs32,
            object::elf::R_X86_64_32S => Self::Abs32Signed,
            object::elf::R_X86_64_16 => Self::Abs16,
            object::elf::R_X86_64_PC16 => Self::Pc16,
            object::elf::R_X86_64_8 => Self::Abs8,
            object::elf::R_X86_64_PC8 => Self::Pc8,
            object::elf::R_X86_64_DTPMOD64
            | object::elf::R_X86_64_DTPOFF64
            | object::elf::R_X86_64_TPOFF64
            | object::elf::R_X86_64_TLSGD
            | object::elf::R_X86_64_TLSLD
            | object::elf::R_X86_64_DTPOFF32
            | object::elf::R_X86_64_GOTTPOFF
            | object::elf::R_X86_64_TPOFF32 => Self::Tls,
            object::elf::R_X86_64_PC64 => Self::Pc64,
            object::elf::R_X86_64_GOTOFF64 => Self::GotOff64,
            object::elf::R_X86_64_SIZE32 => Self::Size32,
            object::elf::R_X86_64_SIZE64 => Self::Size64,
            object::elf::R_X86_64_GOTPCRELX => Self::GotPcRelX,
            object::elf::R_X86_64_REX_GOTPCRELX => Self::RexGotPcRelX,
            _ => bail!(
                "Unsupported x86-64 relocation type {}",
                X86_64::rel_type_to_string(r_type)
            ),
        })
    }
}

impl Arch for X86_64 {
    fn elf_header_arch_magic() -> u16 {
        object::elf::EM_X86_64
    }

    fn rel_type_to_string(r_type: u32) -> Cow<'static, str> {
        if let Some(name) = const_name_by_value![
            r_type,
            R_X86_64_NONE,
            R_X86_64_64,
            R_X86_64_PC32,
            R_X86_64_GOT32,
            R_X86_64_PLT32,
            R_X86_64_COPY,
            R_X86_64_GLOB_DAT,
            R_X86_64_JUMP_SLOT,
            R_X86_64_RELATIVE,
            R_X86_64_GOTPCREL,
            R_X86_64_32,
            R_X86_64_32S,
            R_X86_64_16,
            R_X86_64_PC16,
            R_X86_64_8,
            R_X86_64_PC8,
            R_X86_64_DTPMOD64,
            R_X86_64_DTPOFF64,
            R_X86_64_TPOFF64,
            R_X86_64_TLSGD,
            R_X86_64_TLSLD,
            R_X86_64_DTPOFF32,
            R_X86_64_GOTTPOFF,
            R_X86_64_TPOFF32,
            R_X86_64_PC64,
            R_X86_64_GOTOFF64,
            R_X86_64_GOTPC32,
            R_X86_64_SIZE32,
            R_X86_64_SIZE64,
            R_X86_64_GOTPCRELX,
            R_X86_64_REX_GOTPCRELX
        ] {
            Cow::Borrowed(name)
        } else {
            Cow::Owned(format!("Unknown x86_64 relocation type 0x{r_type:x}"))
        }
    }

    fn apply_relocation(
        rel: &RelocationContext,
        section_data: &mut [u8],
    ) -> Result<RelocationOutcome> {
        let kind = RelocationKind::from_raw(rel.r_type)?;
        let name = Self::rel_type_to_string(rel.r_type);
        let s = rel.symbol_value;
        let a = rel.addend;
        let p = rel.place;
        // S + A, computed with wrapping so negative addends behave.
        let s_plus_a = s.wrapping_add_signed(a);
        // S + A - P
        let pc_relative = s_plus_a.wrapping_sub(p) as i64;

        match kind {
            RelocationKind::Abs64 => {
                write_bytes(section_data, rel.offset, &s_plus_a.to_le_bytes(), &name)?;
            }
            RelocationKind::Pc32 | RelocationKind::Plt32 => {
                // With no dynamic linking, PLT32 degenerates to a direct PC-relative reference.
                if !fits_signed_32(pc_relative) {
                    return Ok(RelocationOutcome::Overflowed);
                }
                write_bytes(
                    section_data,
                    rel.offset,
                    &(pc_relative as i32).to_le_bytes(),
                    &name,
                )?;
            }
            RelocationKind::Got32 => {
                // GOT offset; with no GOT in a static link, the direct value is used.
                write_bytes(
                    section_data,
                    rel.offset,
                    &(s_plus_a as u32).to_le_bytes(),
                    &name,
                )?;
            }
            RelocationKind::Copy => {
                // Only meaningful when copying out of a shared object at load time.
            }
            RelocationKind::GlobDat | RelocationKind::JumpSlot => {
                write_bytes(section_data, rel.offset, &s.to_le_bytes(), &name)?;
            }
            RelocationKind::Relative => {
                let value = rel.base_address().wrapping_add_signed(a);
                write_bytes(section_data, rel.offset, &value.to_le_bytes(), &name)?;
            }
            RelocationKind::GotPcRel | RelocationKind::GotPcRelX | RelocationKind::RexGotPcRelX => {
                // Converted to a plain PC-relative reference for static linking.
                if !fits_signed_32(pc_relative) {
                    return Ok(RelocationOutcome::Skipped(Cow::Borrowed(
                        "value out of signed 32-bit range",
                    )));
                }
                write_bytes(
                    section_data,
                    rel.offset,
                    &(pc_relative as i32).to_le_bytes(),
                    &name,
                )?;
            }
            RelocationKind::Abs32 => {
                if !fits_unsigned_32(s_plus_a) {
                    // Some runtimes use R_X86_64_32 on values that are only representable when
                    // sign-extended; accept those rather than failing the link.
                    if fits_signed_32(s_plus_a as i64) {
                        tracing::debug!(value = s_plus_a, "accepting signed value for R_X86_64_32");
                    } else {
                        return Ok(RelocationOutcome::Skipped(Cow::Borrowed(
                            "value doesn't fit in 32 bits",
                        )));
                    }
                }
                write_bytes(
                    section_data,
                    rel.offset,
                    &(s_plus_a as u32).to_le_bytes(),
                    &name,
                )?;
            }
            RelocationKind::Abs32Signed => {
                let value = s_plus_a as i64;
                if !fits_signed_32(value) {
                    return Ok(RelocationOutcome::Skipped(Cow::Borrowed(
                        "value doesn't fit in signed 32 bits",
                    )));
                }
                write_bytes(
                    section_data,
                    rel.offset,
                    &(value as i32).to_le_bytes(),
                    &name,
                )?;
            }
            RelocationKind::Abs16 => {
                if u16::try_from(s_plus_a).is_err() {
                    return Ok(RelocationOutcome::Skipped(Cow::Borrowed(
                        "value doesn't fit in 16 bits",
                    )));
                }
                write_bytes(
                    section_data,
                    rel.offset,
                    &(s_plus_a as u16).to_le_bytes(),
                    &name,
                )?;
            }
            RelocationKind::Pc16 => {
                if i16::try_from(pc_relative).is_err() {
                    return Ok(RelocationOutcome::Skipped(Cow::Borrowed(
                        "value doesn't fit in signed 16 bits",
                    )));
                }
                write_bytes(
                    section_data,
                    rel.offset,
                    &(pc_relative as i16).to_le_bytes(),
                    &name,
                )?;
            }
            RelocationKind::Abs8 => {
                if u8::try_from(s_plus_a).is_err() {
                    bail!("{name} overflow: value {s_plus_a:#x} doesn't fit in 8 bits");
                }
                write_bytes(section_data, rel.offset, &[s_plus_a as u8], &name)?;
            }
            RelocationKind::Pc8 => {
                if i8::try_from(pc_relative).is_err() {
                    bail!("{name} overflow: value {pc_relative:#x} doesn't fit in signed 8 bits");
                }
                write_bytes(section_data, rel.offset, &[pc_relative as u8], &name)?;
            }
            RelocationKind::Tls => {
                return Ok(RelocationOutcome::Skipped(Cow::Borrowed(
                    "TLS relocations are not supported in static links",
                )));
            }
            RelocationKind::Pc64 => {
                write_bytes(
                    section_data,
                    rel.offset,
                    &(pc_relative as u64).to_le_bytes(),
                    &name,
                )?;
            }
            RelocationKind::GotOff64 => {
                write_bytes(section_data, rel.offset, &s_plus_a.to_le_bytes(), &name)?;
            }
            RelocationKind::Size32 => {
                write_bytes(
                    section_data,
                    rel.offset,
                    &(rel.symbol_size as u32).to_le_bytes(),
                    &name,
                )?;
            }
            RelocationKind::Size64 => {
                write_bytes(
                    section_data,
                    rel.offset,
                    &rel.symbol_size.to_le_bytes(),
                    &name,
                )?;
            }
        }

        Ok(RelocationOutcome::Applied)
    }

    fn write_plt_entry(plt_entry: &mut [u8], got_address: u64, plt_address: u64) -> Result {
        plt_entry.copy_from_slice(PLT_ENTRY_TEMPLATE);
        // The displacement is relative to the end of the 6-byte jmp instruction.
        let offset: i32 = (got_address.wrapping_sub(plt_address + 6) as i64)
            .try_into()
            .map_err(|_| anyhow!("PLT stub cannot reach its GOT entry"))?;
        plt_entry[2..6].copy_from_slice(&offset.to_le_bytes());
        Ok(())
    }
}
