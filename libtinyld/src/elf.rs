//! ELF64 structures, constants and small wrappers shared by the rest of the linker. The raw
//! on-disk structures come from the `object` crate; we only add type aliases and the newtypes
//! that make flags and section types pleasant to work with.

use object::LittleEndian;

pub(crate) type FileHeader = object::elf::FileHeader64<LittleEndian>;
pub(crate) type ProgramHeader = object::elf::ProgramHeader64<LittleEndian>;
pub(crate) type SectionHeader = object::elf::SectionHeader64<LittleEndian>;

/// Our starting address in memory. We could start anywhere, but 0x400000 is what ld uses for
/// non-PIE executables and a distinctive value makes it obvious when a file offset has been
/// confused with an address.
pub(crate) const BASE_ADDRESS: u64 = 0x400_000;

pub(crate) const PAGE_SIZE: u64 = 0x1000;

/// Minimum alignment applied when appending an input section to its output section.
pub(crate) const SECTION_ALIGN: u64 = 16;

/// These sizes are from the spec (for 64 bit ELF).
pub(crate) const FILE_HEADER_SIZE: u16 = 0x40;
pub(crate) const PROGRAM_HEADER_SIZE: u16 = 0x38;
pub(crate) const SECTION_HEADER_SIZE: u16 = 0x40;

pub(crate) const GOT_ENTRY_SIZE: u64 = 0x8;
pub(crate) const PLT_ENTRY_SIZE: u64 = 0x10;

const _ASSERTS: () = {
    assert!(FILE_HEADER_SIZE as usize == size_of::<FileHeader>());
    assert!(PROGRAM_HEADER_SIZE as usize == size_of::<ProgramHeader>());
    assert!(SECTION_HEADER_SIZE as usize == size_of::<SectionHeader>());
};

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

macro_rules! const_name_by_value {
    ($needle: expr, $( $const:ident ),*) => {
        match $needle {
            $(object::elf::$const => Some(stringify!($const)),)*
            _ => None
        }
    };
}

pub(crate) use const_name_by_value;

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct SectionFlags(u64);

impl SectionFlags {
    pub(crate) fn from_header(header: &SectionHeader) -> Self {
        use object::read::elf::SectionHeader as _;
        Self(header.sh_flags(LittleEndian))
    }

    pub(crate) fn contains(self, flag: SectionFlags) -> bool {
        self.0 & flag.0 != 0
    }

    pub(crate) const fn from_u64(raw: u64) -> SectionFlags {
        SectionFlags(raw)
    }

    /// Returns self with the specified flags set.
    pub(crate) const fn with(self, flags: SectionFlags) -> SectionFlags {
        SectionFlags(self.0 | flags.0)
    }
}

impl std::fmt::Display for SectionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (flag, ch) in [
            (shf::WRITE, "W"),
            (shf::ALLOC, "A"),
            (shf::EXECINSTR, "X"),
            (shf::TLS, "T"),
        ] {
            if self.contains(flag) {
                f.write_str(ch)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SectionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

/// Section flag bit values.
pub(crate) mod shf {
    use super::SectionFlags;

    pub(crate) const WRITE: SectionFlags = SectionFlags::from_u64(object::elf::SHF_WRITE as u64);
    pub(crate) const ALLOC: SectionFlags = SectionFlags::from_u64(object::elf::SHF_ALLOC as u64);
    pub(crate) const EXECINSTR: SectionFlags =
        SectionFlags::from_u64(object::elf::SHF_EXECINSTR as u64);
    pub(crate) const TLS: SectionFlags = SectionFlags::from_u64(object::elf::SHF_TLS as u64);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SectionType(u32);

impl SectionType {
    pub(crate) fn from_header(header: &SectionHeader) -> Self {
        use object::read::elf::SectionHeader as _;
        Self(header.sh_type(LittleEndian))
    }

    pub(crate) const fn from_u32(raw: u32) -> Self {
        Self(raw)
    }
}

pub(crate) mod sht {
    use super::SectionType;

    pub(crate) const NULL: SectionType = SectionType::from_u32(object::elf::SHT_NULL);
    pub(crate) const PROGBITS: SectionType = SectionType::from_u32(object::elf::SHT_PROGBITS);
    pub(crate) const SYMTAB: SectionType = SectionType::from_u32(object::elf::SHT_SYMTAB);
    pub(crate) const STRTAB: SectionType = SectionType::from_u32(object::elf::SHT_STRTAB);
    pub(crate) const RELA: SectionType = SectionType::from_u32(object::elf::SHT_RELA);
    pub(crate) const NOBITS: SectionType = SectionType::from_u32(object::elf::SHT_NOBITS);
    pub(crate) const REL: SectionType = SectionType::from_u32(object::elf::SHT_REL);
    pub(crate) const GROUP: SectionType = SectionType::from_u32(object::elf::SHT_GROUP);
}

pub(crate) mod secnames {
    pub(crate) const TEXT_SECTION_NAME: &str = ".text";
    pub(crate) const RODATA_SECTION_NAME: &str = ".rodata";
    pub(crate) const DATA_SECTION_NAME: &str = ".data";
    pub(crate) const BSS_SECTION_NAME: &str = ".bss";
    pub(crate) const GOT_SECTION_NAME: &str = ".got";
    pub(crate) const PLT_SECTION_NAME: &str = ".plt";
}

/// Maps an input section name onto the name of the output section it merges into. Numbered
/// sub-sections produced by `-ffunction-sections` and friends fold into their parent; anything
/// unrecognised keeps its own name.
pub(crate) fn output_section_name(name: &str) -> &str {
    for base in [
        secnames::TEXT_SECTION_NAME,
        secnames::RODATA_SECTION_NAME,
        secnames::DATA_SECTION_NAME,
        secnames::BSS_SECTION_NAME,
    ] {
        if let Some(rest) = name.strip_prefix(base) {
            if rest.is_empty() || rest.starts_with('.') {
                return base;
            }
        }
    }
    name
}

pub(crate) fn is_debug_section(name: &str) -> bool {
    name.starts_with(".debug")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_section_name() {
        assert_eq!(output_section_name(".text"), ".text");
        assert_eq!(output_section_name(".text.unlikely"), ".text");
        assert_eq!(output_section_name(".rodata.str1.1"), ".rodata");
        assert_eq!(output_section_name(".data.rel.ro"), ".data");
        // A name that merely shares a prefix isn't folded.
        assert_eq!(output_section_name(".textual"), ".textual");
        assert_eq!(output_section_name(".init_array"), ".init_array");
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
        assert_eq!(align_up(7, 0), 7);
    }
}
