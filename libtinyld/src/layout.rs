//! Section merging and virtual-address layout. Same-class input sections are concatenated into
//! output sections, then the output sections are laid into memory in a fixed order chosen to keep
//! code and read-only data close together.

use crate::args;
use crate::elf;
use crate::elf::PAGE_SIZE;
use crate::elf::SECTION_ALIGN;
use crate::elf::SectionFlags;
use crate::elf::align_up;
use crate::elf::secnames;
use crate::elf::shf;
use crate::elf::sht;
use crate::error::Result;
use crate::parsing::ObjectFile;
use crate::parsing::Section;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OutputSectionId(u32);

impl OutputSectionId {
    fn from_usize(index: usize) -> Self {
        Self(index as u32)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

pub(crate) struct OutputSection {
    pub(crate) name: String,
    pub(crate) flags: SectionFlags,
    pub(crate) alignment: u64,
    /// Total memory size. May exceed `data().len()` when the tail of the section is NOBITS.
    pub(crate) size: u64,
    pub(crate) vma: u64,
    data: Option<Vec<u8>>,
}

impl OutputSection {
    pub(crate) fn synthetic(
        name: &str,
        flags: SectionFlags,
        alignment: u64,
        vma: u64,
        data: Vec<u8>,
    ) -> OutputSection {
        OutputSection {
            name: name.to_owned(),
            flags,
            alignment,
            size: data.len() as u64,
            vma,
            data: Some(data),
        }
    }

    pub(crate) fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub(crate) fn data_mut(&mut self) -> Option<&mut [u8]> {
        self.data.as_deref_mut()
    }

    pub(crate) fn is_executable(&self) -> bool {
        self.flags.contains(shf::EXECINSTR)
    }
}

/// Where one input section landed: which output section, and at what offset within it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SectionPlacement {
    pub(crate) section: OutputSectionId,
    pub(crate) offset: u64,
}

pub(crate) struct Layout {
    pub(crate) sections: Vec<OutputSection>,
    by_name: HashMap<String, OutputSectionId>,
    /// Indexed by [object][input section].
    placements: Vec<Vec<Option<SectionPlacement>>>,
}

fn should_merge(section: &Section) -> bool {
    if elf::is_debug_section(&section.name) {
        return false;
    }
    let meta = [sht::NULL, sht::SYMTAB, sht::STRTAB, sht::RELA, sht::REL, sht::GROUP];
    if meta.contains(&section.kind) {
        return false;
    }
    section.flags.contains(shf::ALLOC)
}

impl Layout {
    pub(crate) fn merge(objects: &[ObjectFile]) -> Result<Layout> {
        let mut layout = Layout {
            sections: Vec::new(),
            by_name: HashMap::new(),
            placements: Vec::with_capacity(objects.len()),
        };

        for object in objects {
            let mut object_placements = vec![None; object.sections.len()];
            for (section_index, section) in object.sections.iter().enumerate() {
                if !should_merge(section) {
                    continue;
                }
                let output_name = elf::output_section_name(&section.name);
                let id = layout.find_or_create(output_name, section.flags);
                let output = &mut layout.sections[id.as_usize()];
                output.flags = output.flags.with(section.flags);

                if section.size == 0 {
                    object_placements[section_index] = Some(SectionPlacement {
                        section: id,
                        offset: output.size,
                    });
                    continue;
                }

                let alignment = section.alignment.max(SECTION_ALIGN);
                output.alignment = output.alignment.max(alignment);
                let offset = align_up(output.size, alignment);

                match &section.data {
                    // NOBITS grows the section without contributing file bytes.
                    None => output.size = offset + section.size,
                    Some(bytes) => {
                        let data = output.data.get_or_insert_with(Vec::new);
                        data.resize(offset as usize, 0);
                        data.extend_from_slice(bytes);
                        output.size = data.len() as u64;
                    }
                }

                object_placements[section_index] = Some(SectionPlacement {
                    section: id,
                    offset,
                });
            }
            layout.placements.push(object_placements);
        }

        Ok(layout)
    }

    fn find_or_create(&mut self, name: &str, flags: SectionFlags) -> OutputSectionId {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = OutputSectionId::from_usize(self.sections.len());
        self.sections.push(OutputSection {
            name: name.to_owned(),
            flags,
            alignment: SECTION_ALIGN,
            size: 0,
            vma: 0,
            data: None,
        });
        self.by_name.insert(name.to_owned(), id);
        id
    }

    /// Lays sections into memory. `.text` must be page-aligned; `.rodata` deliberately gets only
    /// a 16 byte alignment so it lands immediately after `.text`, which keeps PC-relative
    /// references from code into read-only data short. `.data` opens the writable segment on a
    /// fresh page.
    pub(crate) fn assign_addresses(&mut self) {
        let trace = args::address_tracing_enabled();
        let mut cursor = elf::BASE_ADDRESS;
        let mut assigned = vec![false; self.sections.len()];

        for name in [
            secnames::TEXT_SECTION_NAME,
            secnames::RODATA_SECTION_NAME,
            secnames::DATA_SECTION_NAME,
            secnames::BSS_SECTION_NAME,
        ] {
            let Some(&id) = self.by_name.get(name) else {
                continue;
            };
            let section = &mut self.sections[id.as_usize()];
            if section.size == 0 {
                continue;
            }
            let alignment = match name {
                secnames::TEXT_SECTION_NAME | secnames::DATA_SECTION_NAME => PAGE_SIZE,
                secnames::RODATA_SECTION_NAME => SECTION_ALIGN,
                _ => section.alignment.max(SECTION_ALIGN),
            };
            cursor = align_up(cursor, alignment);
            section.vma = cursor;
            cursor += section.size;
            assigned[id.as_usize()] = true;
            if trace {
                eprintln!(
                    "tinyld: assigned {} at {:#x}, size {:#x}",
                    section.name, section.vma, section.size
                );
            }
        }

        // Anything that isn't one of the standard four gets laid out in discovery order at its
        // natural alignment.
        for (index, section) in self.sections.iter_mut().enumerate() {
            if assigned[index] {
                continue;
            }
            cursor = align_up(cursor, section.alignment.max(1));
            section.vma = cursor;
            cursor += section.size;
            if trace {
                eprintln!(
                    "tinyld: assigned {} at {:#x}, size {:#x}",
                    section.name, section.vma, section.size
                );
            }
        }
    }

    pub(crate) fn section_id(&self, name: &str) -> Option<OutputSectionId> {
        self.by_name.get(name).copied()
    }

    pub(crate) fn section(&self, id: OutputSectionId) -> &OutputSection {
        &self.sections[id.as_usize()]
    }

    pub(crate) fn section_mut(&mut self, id: OutputSectionId) -> &mut OutputSection {
        &mut self.sections[id.as_usize()]
    }

    pub(crate) fn placement(&self, object: usize, section: usize) -> Option<SectionPlacement> {
        *self.placements.get(object)?.get(section)?
    }

    /// Reserves `size` bytes in `.bss` (creating it if needed) and returns where they landed.
    /// Only valid before address assignment.
    pub(crate) fn reserve_bss(&mut self, size: u64, alignment: u64) -> (OutputSectionId, u64) {
        let id = self.find_or_create(
            secnames::BSS_SECTION_NAME,
            shf::ALLOC.with(shf::WRITE),
        );
        let section = &mut self.sections[id.as_usize()];
        let alignment = alignment.max(1);
        section.alignment = section.alignment.max(alignment);
        let offset = align_up(section.size, alignment);
        section.size = offset + size;
        (id, offset)
    }

    /// Appends a synthesized section (`.got`, `.plt`) that already has its address assigned.
    pub(crate) fn push_synthetic(&mut self, section: OutputSection) -> OutputSectionId {
        let id = OutputSectionId::from_usize(self.sections.len());
        self.by_name.insert(section.name.clone(), id);
        self.sections.push(section);
        id
    }
}
