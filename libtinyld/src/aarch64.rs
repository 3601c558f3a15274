//! AArch64 relocation application. Most kinds bit-pack an immediate into an existing
//! instruction word. Branch-range overflow is a hard error on this architecture: there's no
//! GOT/PLT repair pass for ARM64 branches.

use crate::arch::Arch;
use crate::arch::RelocationContext;
use crate::arch::RelocationOutcome;
use crate::arch::fits_signed_32;
use crate::arch::fits_unsigned_32;
use crate::arch::read_insn;
use crate::arch::write_bytes;
use crate::bail;
use crate::elf::PLT_ENTRY_SIZE;
use crate::elf::const_name_by_value;
use crate::error::Result;
use anyhow::ensure;
use std::borrow::Cow;

pub(crate) struct AArch64;

const PLT_ENTRY_TEMPLATE: &[u8] = &[
    0x10, 0x00, 0x00, 0x90, // adrp x16, page(&got[n])
    0x10, 0x02, 0x40, 0xf9, // ldr x16, [x16, offset(&got[n])]
    0x00, 0x02, 0x1f, 0xd6, // br x16
    0x1f, 0x20, 0x03, 0xd5, // nop
];

const _ASSERTS: () = {
    assert!(PLT_ENTRY_TEMPLATE.len() as u64 == PLT_ENTRY_SIZE);
};

const PAGE_MASK: u64 = !0xfff;

/// The closed set of AArch64 relocation kinds we understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelocationKind {
    None,
    Abs64,
    Abs32,
    Abs16,
    Prel64,
    Prel32,
    Prel16,
    /// `bl` / `b`, 26-bit shifted branch offset, range +-128 MiB.
    Call26,
    Jump26,
    /// Conditional branch, 19-bit shifted offset, range +-1 MiB.
    CondBr19,
    /// `adr`, 21-bit byte offset, range +-1 MiB.
    AdrPrelLo21,
    /// `adrp`, page-relative 21-bit page offset.
    AdrPrelPgHi21,
    /// `add` immediate, low 12 bits of the absolute address.
    AddAbsLo12,
    /// Load/store immediates: low 12 bits scaled by the access size.
    LdstAbsLo12 { scale: u32 },
}

impl RelocationKind {
    fn from_raw(r_type: u32) -> Result<RelocationKind> {
        Ok(match r_type {
            object::elf::R_AARCH64_NONE => Self::None,
            object::elf::R_AARCH64_ABS64 => Self::Abs64,
            object::elf::R_AARCH64_ABS32 => Self::Abs32,
            object::elf::R_AARCH64_ABS16 => Self::Abs16,
            object::elf::R_AARCH64_PREL64 => Self::Prel64,
            object::elf::R_AARCH64_PREL32 => Self::Prel32,
            object::elf::R_AARCH64_PREL16 => Self::Prel16,
            object::elf::R_AARCH64_CALL26 => Self::Call26,
            object::elf::R_AARCH64_JUMP26 => Self::Jump26,
            object::elf::R_AARCH64_CONDBR19 => Self::CondBr19,
            object::elf::R_AARCH64_ADR_PREL_LO21 => Self::AdrPrelLo21,
            object::elf::R_AARCH64_ADR_PREL_PG_HI21 => Self::AdrPrelPgHi21,
            object::elf::R_AARCH64_ADD_ABS_LO12_NC => Self::AddAbsLo12,
            object::elf::R_AARCH64_LDST8_ABS_LO12_NC => Self::LdstAbsLo12 { scale: 0 },
            object::elf::R_AARCH64_LDST16_ABS_LO12_NC => Self::LdstAbsLo12 { scale: 1 },
            object::elf::R_AARCH64_LDST32_ABS_LO12_NC => Self::LdstAbsLo12 { scale: 2 },
            object::elf::R_AARCH64_LDST64_ABS_LO12_NC => Self::LdstAbsLo12 { scale: 3 },
            object::elf::R_AARCH64_LDST128_ABS_LO12_NC => Self::LdstAbsLo12 { scale: 4 },
            _ => bail!(
                "Unsupported ARM64 relocation type {}",
                AArch64::rel_type_to_string(r_type)
            ),
        })
    }
}

/// Patches an instruction word: keeps the bits in `keep_mask`, ors in `bits`.
fn patch_insn(
    section_data: &mut [u8],
    offset: u64,
    keep_mask: u32,
    bits: u32,
    rel_name: &str,
) -> Result {
    let insn = read_insn(section_data, offset, rel_name)?;
    let patched = (insn & keep_mask) | bits;
    write_bytes(section_data, offset, &patched.to_le_bytes(), rel_name)
}

impl Arch for AArch64 {
    fn elf_header_arch_magic() -> u16 {
        object::elf::EM_AARCH64
    }

    fn rel_type_to_string(r_type: u32) -> Cow<'static, str> {
        if let Some(name) = const_name_by_value![
            r_type,
            R_AARCH64_NONE,
            R_AARCH64_ABS64,
            R_AARCH64_ABS32,
            R_AARCH64_ABS16,
            R_AARCH64_PREL64,
            R_AARCH64_PREL32,
            R_AARCH64_PREL16,
            R_AARCH64_CALL26,
            R_AARCH64_JUMP26,
            R_AARCH64_CONDBR19,
            R_AARCH64_ADR_PREL_LO21,
            R_AARCH64_ADR_PREL_PG_HI21,
            R_AARCH64_ADD_ABS_LO12_NC,
            R_AARCH64_LDST8_ABS_LO12_NC,
            R_AARCH64_LDST16_ABS_LO12_NC,
            R_AARCH64_LDST32_ABS_LO12_NC,
            R_AARCH64_LDST64_ABS_LO12_NC,
            R_AARCH64_LDST128_ABS_LO12_NC
        ] {
            Cow::Borrowed(name)
        } else {
            Cow::Owned(format!("Unknown aarch64 relocation type 0x{r_type:x}"))
        }
    }

    fn apply_relocation(
        rel: &RelocationContext,
        section_data: &mut [u8],
    ) -> Result<RelocationOutcome> {
        let kind = RelocationKind::from_raw(rel.r_type)?;
        let name = Self::rel_type_to_string(rel.r_type);
        let s_plus_a = rel.symbol_value.wrapping_add_signed(rel.addend);
        let pc_relative = s_plus_a.wrapping_sub(rel.place) as i64;

        match kind {
            RelocationKind::None => {}
            RelocationKind::Abs64 => {
                write_bytes(section_data, rel.offset, &s_plus_a.to_le_bytes(), &name)?;
            }
            RelocationKind::Abs32 => {
                if !fits_unsigned_32(s_plus_a) {
                    return Ok(RelocationOutcome::Skipped(Cow::Borrowed(
                        "value doesn't fit in 32 bits",
                    )));
                }
                write_bytes(
                    section_data,
                    rel.offset,
                    &(s_plus_a as u32).to_le_bytes(),
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
            RelocationKind::Prel64 => {
                write_bytes(
                    section_data,
                    rel.offset,
                    &(pc_relative as u64).to_le_bytes(),
                    &name,
                )?;
            }
            RelocationKind::Prel32 => {
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
            RelocationKind::Prel16 => {
                if i16::try_from(pc_relative).is_err() {
                    return Ok(RelocationOutcome::Skipped(Cow::Borrowed(
                        "value out of signed 16-bit range",
                    )));
                }
                write_bytes(
                    section_data,
                    rel.offset,
                    &(pc_relative as i16).to_le_bytes(),
                    &name,
                )?;
            }
            RelocationKind::Call26 | RelocationKind::Jump26 => {
                ensure!(
                    (-0x800_0000..=0x7ff_ffff).contains(&pc_relative),
                    "{name} overflow: branch target {pc_relative:#x} bytes away, limit is +-128 MiB"
                );
                let bits = ((pc_relative >> 2) as u32) & 0x03ff_ffff;
                patch_insn(section_data, rel.offset, 0xfc00_0000, bits, &name)?;
            }
            RelocationKind::CondBr19 => {
                ensure!(
                    (-0x10_0000..=0xf_ffff).contains(&pc_relative),
                    "{name} overflow: branch target {pc_relative:#x} bytes away, limit is +-1 MiB"
                );
                let bits = (((pc_relative >> 2) as u32) & 0x7_ffff) << 5;
                patch_insn(section_data, rel.offset, 0xff00_001f, bits, &name)?;
            }
            RelocationKind::AdrPrelLo21 => {
                ensure!(
                    (-0x10_0000..=0xf_ffff).contains(&pc_relative),
                    "{name} overflow: target {pc_relative:#x} bytes away, limit is +-1 MiB"
                );
                let value = pc_relative as u32;
                let bits = ((value & 0x3) << 29) | (((value >> 2) & 0x7_ffff) << 5);
                patch_insn(section_data, rel.offset, 0x9f00_001f, bits, &name)?;
            }
            RelocationKind::AdrPrelPgHi21 => {
                let delta = (s_plus_a & PAGE_MASK).wrapping_sub(rel.place & PAGE_MASK) as i64;
                ensure!(
                    (-(1i64 << 32)..(1i64 << 32)).contains(&delta),
                    "{name} overflow: page {delta:#x} bytes away, limit is +-4 GiB"
                );
                let imm = ((delta >> 12) as u32) & 0x1f_ffff;
                let bits = ((imm & 0x3) << 29) | (((imm >> 2) & 0x7_ffff) << 5);
                patch_insn(section_data, rel.offset, 0x9f00_001f, bits, &name)?;
            }
            RelocationKind::AddAbsLo12 => {
                let imm = (s_plus_a & 0xfff) as u32;
                patch_insn(section_data, rel.offset, 0xffc0_03ff, imm << 10, &name)?;
            }
            RelocationKind::LdstAbsLo12 { scale } => {
                let imm = ((s_plus_a & 0xfff) as u32) >> scale;
                patch_insn(section_data, rel.offset, 0xffc0_03ff, imm << 10, &name)?;
            }
        }

        Ok(RelocationOutcome::Applied)
    }

    fn write_plt_entry(plt_entry: &mut [u8], got_address: u64, plt_address: u64) -> Result {
        plt_entry.copy_from_slice(PLT_ENTRY_TEMPLATE);

        let page_offset = ((got_address & PAGE_MASK).wrapping_sub(plt_address & PAGE_MASK) as i64) >> 12;
        ensure!(
            (-(1i64 << 20)..(1i64 << 20)).contains(&page_offset),
            "PLT stub cannot reach its GOT entry's page"
        );
        let imm = page_offset as u32;
        let adrp = u32::from_le_bytes(plt_entry[0..4].try_into().unwrap())
            | ((imm & 0x3) << 29)
            | (((imm >> 2) & 0x7_ffff) << 5);
        plt_entry[0..4].copy_from_slice(&adrp.to_le_bytes());

        // The load immediate is scaled by 8, the size of a GOT slot.
        let ldr_imm = ((got_address & 0xfff) as u32) >> 3;
        let ldr = u32::from_le_bytes(plt_entry[4..8].try_into().unwrap()) | (ldr_imm << 10);
        plt_entry[4..8].copy_from_slice(&ldr.to_le_bytes());
        Ok(())
    }
}
