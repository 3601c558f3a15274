//! Emits the final ELF64 executable: file header, one program header per run of
//! same-permission sections, then the section bytes. No section headers are written - a minimal
//! `ET_EXEC` only needs program headers to load.

use crate::arch::Arch;
use crate::bail;
use crate::elf::FILE_HEADER_SIZE;
use crate::elf::FileHeader;
use crate::elf::PAGE_SIZE;
use crate::elf::PROGRAM_HEADER_SIZE;
use crate::elf::ProgramHeader;
use crate::elf::SECTION_HEADER_SIZE;
use crate::elf::shf;
use crate::error::Result;
use crate::error::warning;
use crate::layout::Layout;
use crate::layout::OutputSection;
use anyhow::Context as _;
use anyhow::anyhow;
use object::LittleEndian;
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;

struct Segment {
    executable: bool,
    offset: u64,
    vaddr: u64,
    filesz: u64,
    memsz: u64,
}

pub(crate) fn write<A: Arch>(path: &Path, layout: &Layout, entry: u64) -> Result {
    let mut sections: Vec<&OutputSection> = layout
        .sections
        .iter()
        .filter(|s| s.flags.contains(shf::ALLOC) && s.size > 0)
        .collect();
    sections.sort_by_key(|s| s.vma);

    // One PT_LOAD per run of consecutive sections sharing a permission class.
    let mut runs: Vec<(bool, std::ops::Range<usize>)> = Vec::new();
    for (index, section) in sections.iter().enumerate() {
        match runs.last_mut() {
            Some((executable, range)) if *executable == section.is_executable() => {
                range.end = index + 1;
            }
            _ => runs.push((section.is_executable(), index..index + 1)),
        }
    }

    if entry == 0 {
        bail!("entry point is unset");
    }
    if runs.is_empty() {
        bail!("no loadable segments");
    }

    // Assign file offsets. Each section's bytes must land at an offset congruent to its address
    // modulo the page size, so the loader can map segments directly.
    let headers_size = u64::from(FILE_HEADER_SIZE) + runs.len() as u64 * u64::from(PROGRAM_HEADER_SIZE);
    let mut cursor = headers_size;
    let mut file_offsets = Vec::with_capacity(sections.len());
    for section in &sections {
        if section.data().is_some() {
            cursor += section.vma.wrapping_sub(cursor) & (PAGE_SIZE - 1);
        }
        file_offsets.push(cursor);
        if let Some(data) = section.data() {
            cursor += data.len() as u64;
        }
    }

    let mut segments = Vec::with_capacity(runs.len());
    for (executable, range) in runs {
        let first = sections[range.start];
        let last = sections[range.end - 1];
        let offset = file_offsets[range.start];
        let mut filesz = 0;
        for index in range {
            if let Some(data) = sections[index].data() {
                filesz = file_offsets[index] + data.len() as u64 - offset;
            }
        }
        segments.push(Segment {
            executable,
            offset,
            vaddr: first.vma,
            filesz,
            memsz: last.vma + last.size - first.vma,
        });
    }

    validate_entry(&segments, entry)?;

    let mut header_bytes = vec![0u8; headers_size as usize];
    let (file_header, rest) = object::from_bytes_mut::<FileHeader>(&mut header_bytes)
        .map_err(|()| anyhow!("Failed to cast file header"))?;
    populate_file_header::<A>(file_header, segments.len() as u16, entry);
    let (program_headers, _) = object::slice_from_bytes_mut::<ProgramHeader>(rest, segments.len())
        .map_err(|()| anyhow!("Failed to cast program headers"))?;
    for (program_header, segment) in program_headers.iter_mut().zip(&segments) {
        let e = LittleEndian;
        program_header.p_type.set(e, object::elf::PT_LOAD);
        program_header.p_flags.set(
            e,
            object::elf::PF_R
                | if segment.executable {
                    object::elf::PF_X
                } else {
                    object::elf::PF_W
                },
        );
        program_header.p_offset.set(e, segment.offset);
        program_header.p_vaddr.set(e, segment.vaddr);
        program_header.p_paddr.set(e, segment.vaddr);
        program_header.p_filesz.set(e, segment.filesz);
        program_header.p_memsz.set(e, segment.memsz);
        program_header.p_align.set(e, PAGE_SIZE);
    }

    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create output file `{}`", path.display()))?;
    let mut out = std::io::BufWriter::new(file);
    out.write_all(&header_bytes)?;

    let mut position = headers_size;
    for (section, &offset) in sections.iter().zip(&file_offsets) {
        let Some(data) = section.data() else {
            continue;
        };
        while position < offset {
            let padding = [0u8; 256];
            let n = ((offset - position) as usize).min(padding.len());
            out.write_all(&padding[..n])?;
            position += n as u64;
        }
        out.write_all(data)?;
        position += data.len() as u64;
    }

    out.flush()?;
    drop(out);

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .with_context(|| format!("Failed to mark `{}` executable", path.display()))?;

    tracing::info!(path = %path.display(), segments = segments.len(), "wrote executable");
    Ok(())
}

fn populate_file_header<A: Arch>(header: &mut FileHeader, num_segments: u16, entry: u64) {
    let e = LittleEndian;
    header.e_ident.magic = object::elf::ELFMAG;
    header.e_ident.class = object::elf::ELFCLASS64;
    header.e_ident.data = object::elf::ELFDATA2LSB;
    header.e_ident.version = 1;
    header.e_ident.os_abi = object::elf::ELFOSABI_NONE;
    header.e_ident.abi_version = 0;
    header.e_ident.padding = Default::default();
    header.e_type.set(e, object::elf::ET_EXEC);
    header.e_machine.set(e, A::elf_header_arch_magic());
    header.e_version.set(e, u32::from(object::elf::EV_CURRENT));
    header.e_entry.set(e, entry);
    header.e_phoff.set(e, u64::from(FILE_HEADER_SIZE));
    // No section headers; program headers are all a loader needs.
    header.e_shoff.set(e, 0);
    header.e_flags.set(e, 0);
    header.e_ehsize.set(e, FILE_HEADER_SIZE);
    header.e_phentsize.set(e, PROGRAM_HEADER_SIZE);
    header.e_phnum.set(e, num_segments);
    header.e_shentsize.set(e, SECTION_HEADER_SIZE);
    header.e_shnum.set(e, 0);
    header.e_shstrndx.set(e, 0);
}

fn validate_entry(segments: &[Segment], entry: u64) -> Result {
    let Some(segment) = segments
        .iter()
        .find(|s| (s.vaddr..s.vaddr + s.memsz).contains(&entry))
    else {
        bail!("entry point {entry:#x} does not lie within any PT_LOAD segment");
    };
    if !segment.executable {
        warning(&format!("entry point {entry:#x} is in a non-executable segment"));
    }
    Ok(())
}
