//! Parses ELF64 relocatable objects into an owned in-memory representation. An `ObjectFile` owns
//! all of its buffers, so it can outlive whatever byte range it was parsed from - in particular a
//! memory-mapped archive that gets unmapped once extraction is finished.

use crate::arch::Architecture;
use crate::bail;
use crate::elf;
use crate::elf::SectionFlags;
use crate::elf::SectionType;
use crate::elf::sht;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::input_data::InputData;
use anyhow::Context as _;
use object::LittleEndian;
use object::read::elf::FileHeader as _;
use object::read::elf::SectionHeader as _;
use object::read::elf::Sym as _;
use rayon::prelude::*;
use smallvec::SmallVec;

/// Parsing each input is independent of every other input, so it's worth fanning out over a
/// thread pool, but not for a handful of files.
const MIN_FILES_FOR_PARALLEL_PARSE: usize = 4;

pub(crate) struct ObjectFile {
    /// Display name: the file path, or `archive(member)` for extracted archive members.
    pub(crate) name: String,
    pub(crate) arch: Architecture,
    pub(crate) sections: Vec<Section>,
    pub(crate) symbols: Vec<Symbol>,
    pub(crate) relocation_sections: SmallVec<[RelaSection; 4]>,
    /// Set by the dead code eliminator when the object is reachable from the entry point.
    pub(crate) used: bool,
}

pub(crate) struct Section {
    pub(crate) name: String,
    pub(crate) kind: SectionType,
    pub(crate) flags: SectionFlags,
    pub(crate) size: u64,
    pub(crate) alignment: u64,
    /// None for SHT_NOBITS sections, which occupy memory but no file bytes.
    pub(crate) data: Option<Vec<u8>>,
}

pub(crate) struct Symbol {
    pub(crate) name: String,
    pub(crate) value: u64,
    pub(crate) size: u64,
    pub(crate) section: SymbolSection,
    pub(crate) binding: u8,
    pub(crate) kind: u8,
    pub(crate) visibility: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SymbolSection {
    Undefined,
    Absolute,
    Common,
    Section(usize),
}

pub(crate) struct RelaSection {
    /// Index of the section the relocations apply to.
    pub(crate) target_section: usize,
    pub(crate) relocations: Vec<Relocation>,
}

#[derive(Clone, Copy)]
pub(crate) struct Relocation {
    pub(crate) offset: u64,
    pub(crate) r_type: u32,
    pub(crate) symbol: u32,
    pub(crate) addend: i64,
}

impl Symbol {
    pub(crate) fn is_defined(&self) -> bool {
        self.section != SymbolSection::Undefined
    }

    pub(crate) fn is_global_or_weak(&self) -> bool {
        matches!(self.binding, object::elf::STB_GLOBAL | object::elf::STB_WEAK)
    }
}

impl ObjectFile {
    pub(crate) fn parse(data: &[u8], name: &str) -> Result<ObjectFile> {
        // Re-validates even when the caller already identified the file, because archive members
        // arrive here without having been through file-kind detection.
        match FileKind::identify_bytes(data)? {
            FileKind::ElfObject => {}
            FileKind::Archive => bail!("Nested archives are not supported"),
        }

        let e = LittleEndian;
        let header = elf::FileHeader::parse(data)?;
        let arch = Architecture::try_from(header.e_machine(e))?;
        let section_table = header.sections(e, data)?;

        let mut sections = Vec::with_capacity(section_table.len());
        for (_, section) in section_table.enumerate() {
            let name = String::from_utf8_lossy(section_table.section_name(e, section)?).into_owned();
            let kind = SectionType::from_header(section);
            let data = if kind == sht::NOBITS {
                None
            } else {
                Some(section.data(e, data)?.to_vec())
            };
            sections.push(Section {
                name,
                kind,
                flags: SectionFlags::from_header(section),
                size: section.sh_size(e),
                alignment: section.sh_addralign(e),
                data,
            });
        }

        let mut symbols = Vec::new();
        for (section_index, section) in section_table.enumerate() {
            if SectionType::from_header(section) != sht::SYMTAB {
                continue;
            }
            let symbol_table = object::read::elf::SymbolTable::parse(
                e,
                data,
                &section_table,
                section_index,
                section,
            )?;
            symbols.reserve(symbol_table.len());
            for symbol in symbol_table.symbols() {
                let name =
                    String::from_utf8_lossy(symbol_table.symbol_name(e, symbol)?).into_owned();
                symbols.push(Symbol {
                    name,
                    value: symbol.st_value(e),
                    size: symbol.st_size(e),
                    section: match symbol.st_shndx(e) {
                        object::elf::SHN_UNDEF => SymbolSection::Undefined,
                        object::elf::SHN_ABS => SymbolSection::Absolute,
                        object::elf::SHN_COMMON => SymbolSection::Common,
                        index => SymbolSection::Section(index as usize),
                    },
                    binding: symbol.st_bind(),
                    kind: symbol.st_type(),
                    visibility: symbol.st_visibility(),
                });
            }
            // Relocatable objects have a single symbol table.
            break;
        }

        let mut relocation_sections = SmallVec::new();
        for (_, section) in section_table.enumerate() {
            let Some((relocations, _)) = section.rela(e, data)? else {
                continue;
            };
            relocation_sections.push(RelaSection {
                target_section: section.sh_info(e) as usize,
                relocations: relocations
                    .iter()
                    .map(|r| Relocation {
                        offset: r.r_offset.get(e),
                        r_type: r.r_type(e, false),
                        symbol: r.r_sym(e, false),
                        addend: r.r_addend.get(e),
                    })
                    .collect(),
            });
        }

        Ok(ObjectFile {
            name: name.to_owned(),
            arch,
            sections,
            symbols,
            relocation_sections,
            used: false,
        })
    }
}

/// Parses all regular object inputs. Archives are left alone here; their members are parsed
/// on-demand during symbol resolution.
pub(crate) fn parse_input_files(input_data: &InputData) -> Result<Vec<ObjectFile>> {
    let inputs: Vec<_> = input_data
        .files
        .iter()
        .filter(|f| f.kind == FileKind::ElfObject)
        .collect();

    let parse_one = |file: &crate::input_data::InputFile| {
        ObjectFile::parse(file.data(), &file.filename.display().to_string())
            .with_context(|| format!("Failed to parse object file `{}`", file.filename.display()))
    };

    if inputs.len() < MIN_FILES_FOR_PARALLEL_PARSE {
        inputs.into_iter().map(parse_one).collect()
    } else {
        inputs.into_par_iter().map(parse_one).collect()
    }
}

/// All inputs must agree on one architecture; the first object decides.
pub(crate) fn common_architecture(objects: &[ObjectFile]) -> Result<Architecture> {
    let Some(first) = objects.first() else {
        bail!("No input objects remain to link");
    };
    for object in objects {
        if object.arch != first.arch {
            bail!(
                "`{}` has incompatible architecture: {}, expecting {}",
                object.name,
                object.arch,
                first.arch,
            );
        }
    }
    Ok(first.arch)
}
