//! Per-archive symbol indexes. Each archive is scanned once up-front: every member that parses as
//! an ELF object contributes its defined global and weak symbols to a name -> member map. Member
//! extraction then parses the member straight out of the archive's long-lived memory map, with no
//! copy of the archive bytes and no temporary files.

use crate::archive::ArchiveEntry;
use crate::archive::ArchiveIterator;
use crate::archive::ENTRY_HEADER_SIZE;
use crate::elf;
use crate::elf::sht;
use crate::error::Result;
use crate::error::warning;
use crate::file_kind::FileKind;
use crate::input_data::InputData;
use crate::parsing::ObjectFile;
use anyhow::Context as _;
use object::LittleEndian;
use object::read::elf::FileHeader as _;
use object::read::elf::Sym as _;
use std::collections::HashMap;
use std::ops::Range;

pub(crate) struct ArchiveIndex {
    file: crate::input_data::InputFile,
    members: Vec<Member>,
    symbol_to_member: HashMap<String, usize>,
}

struct Member {
    name: String,
    header_offset: usize,
    data_range: Range<usize>,
    extracted: bool,
}

/// Builds one index per archive input, in command-line order. Consumes the input data: the
/// archive maps move into the indexes, which stay alive for the whole resolution phase, while
/// regular object maps have already been parsed into owned objects and aren't needed any more.
pub(crate) fn build_indexes(input_data: InputData) -> Result<Vec<ArchiveIndex>> {
    input_data
        .files
        .into_iter()
        .filter(|f| f.kind == FileKind::Archive)
        .map(ArchiveIndex::build)
        .collect()
}

impl ArchiveIndex {
    pub(crate) fn build(file: crate::input_data::InputFile) -> Result<ArchiveIndex> {
        let data = file.data();

        let mut extended_filenames = None;
        for entry in ArchiveIterator::from_archive_bytes(data)
            .with_context(|| format!("Failed to read archive `{}`", file.filename.display()))?
        {
            if let ArchiveEntry::Filenames(table) = entry? {
                extended_filenames = Some(table);
            }
        }

        let mut members = Vec::new();
        let mut symbol_to_member = HashMap::new();
        for entry in ArchiveIterator::from_archive_bytes(data)? {
            let ArchiveEntry::Regular(content) = entry? else {
                continue;
            };
            let member_id = members.len();
            let name =
                String::from_utf8_lossy(content.identifier(extended_filenames)).into_owned();
            // Members that aren't valid ELF objects (linker scripts, random files) simply
            // contribute no symbols.
            if let Err(error) = index_member_symbols(
                content.entry_data,
                member_id,
                &mut symbol_to_member,
            ) {
                tracing::debug!(member = %name, %error, "skipping unindexable archive member");
                continue;
            }
            members.push(Member {
                name,
                header_offset: content.header_offset,
                data_range: content.data_range.clone(),
                extracted: false,
            });
        }

        tracing::debug!(
            archive = %file.filename.display(),
            members = members.len(),
            symbols = symbol_to_member.len(),
            "indexed archive"
        );

        Ok(ArchiveIndex {
            file,
            members,
            symbol_to_member,
        })
    }

    /// Returns the member defining `symbol`, if any. When several members define the same name,
    /// the first one in archive order wins, matching the `ar` symbol table convention.
    pub(crate) fn lookup(&self, symbol: &str) -> Option<usize> {
        self.symbol_to_member.get(symbol).copied()
    }

    /// Parses the given member out of the mapped archive. Returns None if the member was already
    /// extracted, or if it fails to parse - a member that can't be parsed simply provides
    /// nothing, it doesn't fail the link.
    pub(crate) fn extract(&mut self, member_id: usize) -> Option<ObjectFile> {
        let member = &mut self.members[member_id];
        if member.extracted {
            return None;
        }
        member.extracted = true;

        let display_name = format!("{}({})", self.file.filename.display(), member.name);
        match parse_member(self.file.data(), member, &display_name) {
            Ok(object) => Some(object),
            Err(error) => {
                warning(&format!("failed to extract `{display_name}`: {error:#}"));
                None
            }
        }
    }
}

/// Re-reads and validates the member header at its recorded offset, then parses the member's
/// bytes as an object file. The header re-check guards against an index built over a file that
/// has since been truncated or rewritten underneath our map.
fn parse_member(archive_data: &[u8], member: &Member, display_name: &str) -> Result<ObjectFile> {
    let header_end = member.header_offset + ENTRY_HEADER_SIZE;
    let Some(header_bytes) = archive_data.get(member.header_offset..header_end) else {
        anyhow::bail!("member header lies outside the archive");
    };
    let header: &crate::archive::EntryHeader = bytemuck::from_bytes(header_bytes);
    header.validate()?;

    let Some(member_data) = archive_data.get(member.data_range.clone()) else {
        anyhow::bail!("member data lies outside the archive");
    };
    ObjectFile::parse(member_data, display_name)
}

fn index_member_symbols(
    member_data: &[u8],
    member_id: usize,
    symbol_to_member: &mut HashMap<String, usize>,
) -> Result {
    let e = LittleEndian;
    let header = elf::FileHeader::parse(member_data)?;
    let sections = header.sections(e, member_data)?;

    for (section_index, section) in sections.enumerate() {
        if elf::SectionType::from_header(section) != sht::SYMTAB {
            continue;
        }
        let symbols = object::read::elf::SymbolTable::parse(
            e,
            member_data,
            &sections,
            section_index,
            section,
        )?;
        for symbol in symbols.symbols() {
            if symbol.st_shndx(e) == object::elf::SHN_UNDEF {
                continue;
            }
            if !matches!(symbol.st_bind(), object::elf::STB_GLOBAL | object::elf::STB_WEAK) {
                continue;
            }
            let name = symbols.symbol_name(e, symbol)?;
            if name.is_empty() {
                continue;
            }
            symbol_to_member
                .entry(String::from_utf8_lossy(name).into_owned())
                .or_insert(member_id);
        }
        break;
    }
    Ok(())
}
