//! End-to-end links over synthetic relocatable objects. The builder at the top serialises
//! minimal but well-formed ELF64 `ET_REL` files; each test links some and inspects the produced
//! executable byte-for-byte.

use libtinyld::args::Args;
use object::LittleEndian;
use object::read::elf::FileHeader as _;
use object::read::elf::ProgramHeader as _;
use std::path::Path;
use std::path::PathBuf;

type FileHeader = object::elf::FileHeader64<LittleEndian>;

const E: LittleEndian = LittleEndian;

struct SectionSpec {
    name: String,
    sh_type: u32,
    flags: u64,
    align: u64,
    data: Vec<u8>,
    /// For SHT_NOBITS, the declared size; otherwise data.len().
    size: u64,
}

struct SymbolSpec {
    name: String,
    bind: u8,
    kind: u8,
    /// "" = undefined, "*ABS*", "*COM*", otherwise a section name.
    section: String,
    value: u64,
    size: u64,
}

struct RelaSpec {
    offset: u64,
    r_type: u32,
    symbol: String,
    addend: i64,
}

struct ObjectBuilder {
    machine: u16,
    sections: Vec<SectionSpec>,
    symbols: Vec<SymbolSpec>,
    relas: Vec<(String, Vec<RelaSpec>)>,
}

impl ObjectBuilder {
    fn new() -> ObjectBuilder {
        ObjectBuilder {
            machine: object::elf::EM_X86_64,
            sections: Vec::new(),
            symbols: Vec::new(),
            relas: Vec::new(),
        }
    }

    fn section(mut self, name: &str, sh_type: u32, flags: u64, align: u64, data: &[u8]) -> Self {
        self.sections.push(SectionSpec {
            name: name.to_owned(),
            sh_type,
            flags,
            align,
            data: data.to_vec(),
            size: data.len() as u64,
        });
        self
    }

    fn text(self, data: &[u8]) -> Self {
        self.section(
            ".text",
            object::elf::SHT_PROGBITS,
            u64::from(object::elf::SHF_ALLOC | object::elf::SHF_EXECINSTR),
            16,
            data,
        )
    }

    fn symbol(mut self, name: &str, bind: u8, kind: u8, section: &str, value: u64, size: u64) -> Self {
        self.symbols.push(SymbolSpec {
            name: name.to_owned(),
            bind,
            kind,
            section: section.to_owned(),
            value,
            size,
        });
        self
    }

    fn global_in(self, name: &str, section: &str, value: u64) -> Self {
        self.symbol(
            name,
            object::elf::STB_GLOBAL,
            object::elf::STT_FUNC,
            section,
            value,
            0,
        )
    }

    fn undefined(self, name: &str) -> Self {
        self.symbol(
            name,
            object::elf::STB_GLOBAL,
            object::elf::STT_NOTYPE,
            "",
            0,
            0,
        )
    }

    fn common(self, name: &str, size: u64, align: u64) -> Self {
        self.symbol(
            name,
            object::elf::STB_GLOBAL,
            object::elf::STT_OBJECT,
            "*COM*",
            align,
            size,
        )
    }

    fn rela(mut self, target: &str, offset: u64, r_type: u32, symbol: &str, addend: i64) -> Self {
        match self.relas.iter_mut().find(|(name, _)| name == target) {
            Some((_, list)) => list.push(RelaSpec {
                offset,
                r_type,
                symbol: symbol.to_owned(),
                addend,
            }),
            None => self.relas.push((
                target.to_owned(),
                vec![RelaSpec {
                    offset,
                    r_type,
                    symbol: symbol.to_owned(),
                    addend,
                }],
            )),
        }
        self
    }

    fn section_index(&self, name: &str) -> u16 {
        let position = self
            .sections
            .iter()
            .position(|s| s.name == name)
            .unwrap_or_else(|| panic!("no section named {name}"));
        (position + 1) as u16
    }

    fn build(&self) -> Vec<u8> {
        let num_user = self.sections.len();
        let num_rela = self.relas.len();
        let symtab_index = 1 + num_user + num_rela;
        let strtab_index = symtab_index + 1;
        let shstrtab_index = strtab_index + 1;
        let num_sections = shstrtab_index + 1;

        // Locals first, then globals; sh_info of the symtab points at the first global.
        let mut ordered: Vec<&SymbolSpec> = self
            .symbols
            .iter()
            .filter(|s| s.bind == object::elf::STB_LOCAL)
            .collect();
        let first_global = (ordered.len() + 1) as u32;
        ordered.extend(self.symbols.iter().filter(|s| s.bind != object::elf::STB_LOCAL));
        let symbol_slot = |name: &str| -> u32 {
            (ordered
                .iter()
                .position(|s| s.name == name)
                .unwrap_or_else(|| panic!("no symbol named {name}"))
                + 1) as u32
        };

        let mut strtab = vec![0u8];
        let mut symtab = vec![0u8; 24];
        for spec in &ordered {
            let name_offset = strtab.len() as u32;
            strtab.extend_from_slice(spec.name.as_bytes());
            strtab.push(0);
            let shndx: u16 = match spec.section.as_str() {
                "" => 0,
                "*ABS*" => object::elf::SHN_ABS,
                "*COM*" => object::elf::SHN_COMMON,
                section => self.section_index(section),
            };
            symtab.extend_from_slice(&name_offset.to_le_bytes());
            symtab.push((spec.bind << 4) | spec.kind);
            symtab.push(0);
            symtab.extend_from_slice(&shndx.to_le_bytes());
            symtab.extend_from_slice(&spec.value.to_le_bytes());
            symtab.extend_from_slice(&spec.size.to_le_bytes());
        }

        let mut shstrtab = vec![0u8];
        let mut add_section_name = |name: &str| -> u32 {
            let offset = shstrtab.len() as u32;
            shstrtab.extend_from_slice(name.as_bytes());
            shstrtab.push(0);
            offset
        };
        let user_name_offsets: Vec<u32> =
            self.sections.iter().map(|s| add_section_name(&s.name)).collect();
        let rela_name_offsets: Vec<u32> = self
            .relas
            .iter()
            .map(|(target, _)| add_section_name(&format!(".rela{target}")))
            .collect();
        let symtab_name = add_section_name(".symtab");
        let strtab_name = add_section_name(".strtab");
        let shstrtab_name = add_section_name(".shstrtab");

        // File image: ELF header, section data, then the section header table.
        let mut out = vec![0u8; 64];
        let place = |out: &mut Vec<u8>, bytes: &[u8]| -> u64 {
            while out.len() % 8 != 0 {
                out.push(0);
            }
            let offset = out.len() as u64;
            out.extend_from_slice(bytes);
            offset
        };

        // (name, type, flags, offset, size, link, info, align, entsize)
        let mut headers: Vec<[u64; 9]> = Vec::with_capacity(num_sections);
        headers.push([0; 9]);
        for (spec, &name) in self.sections.iter().zip(&user_name_offsets) {
            let offset = if spec.sh_type == object::elf::SHT_NOBITS {
                out.len() as u64
            } else {
                place(&mut out, &spec.data)
            };
            headers.push([
                u64::from(name),
                u64::from(spec.sh_type),
                spec.flags,
                offset,
                spec.size,
                0,
                0,
                spec.align,
                0,
            ]);
        }
        for ((target, relas), &name) in self.relas.iter().zip(&rela_name_offsets) {
            let mut bytes = Vec::with_capacity(relas.len() * 24);
            for rela in relas {
                bytes.extend_from_slice(&rela.offset.to_le_bytes());
                let info = (u64::from(symbol_slot(&rela.symbol)) << 32) | u64::from(rela.r_type);
                bytes.extend_from_slice(&info.to_le_bytes());
                bytes.extend_from_slice(&rela.addend.to_le_bytes());
            }
            let offset = place(&mut out, &bytes);
            headers.push([
                u64::from(name),
                u64::from(object::elf::SHT_RELA),
                0,
                offset,
                bytes.len() as u64,
                symtab_index as u64,
                u64::from(self.section_index(target)),
                8,
                24,
            ]);
        }
        let offset = place(&mut out, &symtab);
        headers.push([
            u64::from(symtab_name),
            u64::from(object::elf::SHT_SYMTAB),
            0,
            offset,
            symtab.len() as u64,
            strtab_index as u64,
            u64::from(first_global),
            8,
            24,
        ]);
        let offset = place(&mut out, &strtab);
        headers.push([
            u64::from(strtab_name),
            u64::from(object::elf::SHT_STRTAB),
            0,
            offset,
            strtab.len() as u64,
            0,
            0,
            1,
            0,
        ]);
        let offset = place(&mut out, &shstrtab);
        headers.push([
            u64::from(shstrtab_name),
            u64::from(object::elf::SHT_STRTAB),
            0,
            offset,
            shstrtab.len() as u64,
            0,
            0,
            1,
            0,
        ]);

        while out.len() % 8 != 0 {
            out.push(0);
        }
        let shoff = out.len() as u64;
        for [name, sh_type, flags, offset, size, link, info, align, entsize] in headers {
            out.extend_from_slice(&(name as u32).to_le_bytes());
            out.extend_from_slice(&(sh_type as u32).to_le_bytes());
            out.extend_from_slice(&flags.to_le_bytes());
            out.extend_from_slice(&0u64.to_le_bytes()); // sh_addr
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
            out.extend_from_slice(&(link as u32).to_le_bytes());
            out.extend_from_slice(&(info as u32).to_le_bytes());
            out.extend_from_slice(&align.to_le_bytes());
            out.extend_from_slice(&entsize.to_le_bytes());
        }

        // ELF header.
        out[0..4].copy_from_slice(&object::elf::ELFMAG);
        out[4] = object::elf::ELFCLASS64;
        out[5] = object::elf::ELFDATA2LSB;
        out[6] = 1; // EV_CURRENT
        out[16..18].copy_from_slice(&object::elf::ET_REL.to_le_bytes());
        out[18..20].copy_from_slice(&self.machine.to_le_bytes());
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[40..48].copy_from_slice(&shoff.to_le_bytes());
        out[52..54].copy_from_slice(&64u16.to_le_bytes());
        out[58..60].copy_from_slice(&64u16.to_le_bytes());
        out[60..62].copy_from_slice(&(num_sections as u16).to_le_bytes());
        out[62..64].copy_from_slice(&(shstrtab_index as u16).to_le_bytes());

        out
    }

    fn write_to(&self, dir: &Path, filename: &str) -> PathBuf {
        let path = dir.join(filename);
        std::fs::write(&path, self.build()).unwrap();
        path
    }
}

fn link_args(inputs: Vec<PathBuf>, output: PathBuf) -> Args {
    Args {
        inputs,
        output,
        ..Args::default()
    }
}

fn read_header(bytes: &[u8]) -> &FileHeader {
    FileHeader::parse(bytes).unwrap()
}

/// `(p_flags, p_offset, p_vaddr, p_filesz, p_memsz)` per PT_LOAD.
fn load_segments(bytes: &[u8]) -> Vec<(u32, u64, u64, u64, u64)> {
    let header = read_header(bytes);
    header
        .program_headers(E, bytes)
        .unwrap()
        .iter()
        .filter(|p| p.p_type(E) == object::elf::PT_LOAD)
        .map(|p| {
            (
                p.p_flags(E),
                p.p_offset(E),
                p.p_vaddr(E),
                p.p_filesz(E),
                p.p_memsz(E),
            )
        })
        .collect()
}

// mov eax, 60; xor edi, edi; syscall -- exit(0)
const EXIT0: &[u8] = &[0xb8, 0x3c, 0x00, 0x00, 0x00, 0x31, 0xff, 0x0f, 0x05];

#[test]
fn test_minimal_executable() {
    let dir = tempfile::tempdir().unwrap();
    let start = ObjectBuilder::new()
        .text(EXIT0)
        .global_in("_start", ".text", 0)
        .write_to(dir.path(), "start.o");
    let output = dir.path().join("exit0");

    libtinyld::link(&link_args(vec![start], output.clone())).unwrap();

    let bytes = std::fs::read(&output).unwrap();
    let header = read_header(&bytes);
    assert_eq!(header.e_type.get(E), object::elf::ET_EXEC);
    assert_eq!(header.e_machine.get(E), object::elf::EM_X86_64);
    assert_eq!(header.e_shnum.get(E), 0);

    let segments = load_segments(&bytes);
    assert_eq!(segments.len(), 1);
    let (flags, offset, vaddr, filesz, memsz) = segments[0];
    assert_eq!(flags, object::elf::PF_R | object::elf::PF_X);
    assert_eq!(offset % 0x1000, vaddr % 0x1000);
    assert_eq!(filesz, EXIT0.len() as u64);
    assert_eq!(memsz, EXIT0.len() as u64);

    // The entry points at _start, which is at the very start of .text.
    let entry = header.e_entry.get(E);
    assert_eq!(entry, vaddr);
    assert!(entry >= vaddr && entry < vaddr + memsz);
    assert_eq!(&bytes[offset as usize..offset as usize + EXIT0.len()], EXIT0);

    // The output must be marked executable.
    use std::os::unix::fs::PermissionsExt as _;
    let mode = std::fs::metadata(&output).unwrap().permissions().mode();
    assert_eq!(mode & 0o111, 0o111);
}

#[test]
fn test_first_strong_definition_wins_by_input_order() {
    let dir = tempfile::tempdir().unwrap();
    let a = ObjectBuilder::new()
        .text(&[0x90; 16])
        .global_in("_start", ".text", 0)
        .write_to(dir.path(), "a.o");
    let b = ObjectBuilder::new()
        .text(&[0x90; 16])
        .global_in("_start", ".text", 8)
        .write_to(dir.path(), "b.o");

    let out_ab = dir.path().join("ab");
    libtinyld::link(&link_args(vec![a.clone(), b.clone()], out_ab.clone())).unwrap();
    let out_ba = dir.path().join("ba");
    libtinyld::link(&link_args(vec![b, a], out_ba.clone())).unwrap();

    let entry_ab = read_header(&std::fs::read(out_ab).unwrap()).e_entry.get(E);
    let entry_ba = read_header(&std::fs::read(out_ba).unwrap()).e_entry.get(E);
    // a.o's definition is at the start of .text, b.o's is 8 bytes into its own chunk; whichever
    // object comes first supplies the winning definition at the start of the merged section.
    assert_eq!(entry_ab, 0x400000);
    assert_eq!(entry_ba, 0x400008);
}

#[test]
fn test_pc32_call_across_objects() {
    let dir = tempfile::tempdir().unwrap();
    // call callee; ret
    let caller = ObjectBuilder::new()
        .text(&[0xe8, 0x00, 0x00, 0x00, 0x00, 0xc3])
        .global_in("_start", ".text", 0)
        .undefined("callee")
        .rela(".text", 1, object::elf::R_X86_64_PC32, "callee", -4)
        .write_to(dir.path(), "caller.o");
    let callee = ObjectBuilder::new()
        .text(&[0xc3])
        .global_in("callee", ".text", 0)
        .write_to(dir.path(), "callee.o");
    let output = dir.path().join("call");

    libtinyld::link(&link_args(vec![caller, callee], output.clone())).unwrap();

    let bytes = std::fs::read(&output).unwrap();
    let (_, offset, vaddr, _, _) = load_segments(&bytes)[0];
    // caller.o lands at the start of .text, callee.o is aligned up to 16.
    let callee_address = vaddr + 16;
    let site = vaddr + 1;
    let disp = i32::from_le_bytes(
        bytes[(offset + 1) as usize..(offset + 5) as usize]
            .try_into()
            .unwrap(),
    );
    assert_eq!((site + 4).wrapping_add_signed(disp as i64), callee_address);
}

#[test]
fn test_archive_members_are_extracted_lazily() {
    let dir = tempfile::tempdir().unwrap();

    // Only two of the six members are needed: helper (directly) and helper2 (transitively).
    let member = |defines: &str, references: Option<&str>| {
        let mut builder = ObjectBuilder::new()
            .text(&[0xc3])
            .global_in(defines, ".text", 0);
        if let Some(name) = references {
            builder = builder.undefined(name);
        }
        builder.build()
    };
    let members: Vec<(String, Vec<u8>)> = vec![
        ("unrelated1.o".to_owned(), member("unrelated1", None)),
        ("helper.o".to_owned(), member("helper", Some("helper2"))),
        ("unrelated2.o".to_owned(), member("unrelated2", None)),
        ("helper2.o".to_owned(), member("helper2", None)),
        ("unrelated3.o".to_owned(), member("unrelated3", None)),
        ("unrelated4.o".to_owned(), member("unrelated4", None)),
    ];
    let mut builder = ar::GnuBuilder::new(
        Vec::new(),
        members.iter().map(|(name, _)| name.clone().into_bytes()).collect(),
    );
    for (name, data) in &members {
        builder
            .append(&ar::Header::new(name.clone().into_bytes(), data.len() as u64), &data[..])
            .unwrap();
    }
    std::fs::write(dir.path().join("libhelpers.a"), builder.into_inner().unwrap()).unwrap();

    let main = ObjectBuilder::new()
        .text(EXIT0)
        .global_in("_start", ".text", 0)
        .undefined("helper")
        .write_to(dir.path(), "main.o");

    let output = dir.path().join("lazy");
    let args = Args {
        inputs: vec![main],
        output: output.clone(),
        lib_search_path: vec![dir.path().to_owned()],
        libraries: vec!["helpers".to_owned()],
        ..Args::default()
    };
    let stats = libtinyld::link(&args).unwrap();

    assert_eq!(stats.archive_members_extracted, 2);
    assert!(output.exists());
}

#[test]
fn test_common_symbols_get_bss_storage() {
    let dir = tempfile::tempdir().unwrap();
    let a = ObjectBuilder::new()
        .text(EXIT0)
        .global_in("_start", ".text", 0)
        .common("shared_buffer", 4, 4)
        .write_to(dir.path(), "a.o");
    let b = ObjectBuilder::new()
        .text(&[0xc3])
        .common("shared_buffer", 64, 8)
        .write_to(dir.path(), "b.o");
    let output = dir.path().join("commons");

    libtinyld::link(&link_args(vec![a, b], output.clone())).unwrap();

    let bytes = std::fs::read(&output).unwrap();
    let segments = load_segments(&bytes);
    assert_eq!(segments.len(), 2);
    let (flags, _, _, filesz, memsz) = segments[1];
    assert_eq!(flags, object::elf::PF_R | object::elf::PF_W);
    // The two tentative definitions merge into one 64-byte block of zero-fill.
    assert_eq!(filesz, 0);
    assert!(memsz >= 64);
    assert!(memsz < 128);
}

#[test]
fn test_undefined_symbols_fail_unless_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let main = ObjectBuilder::new()
        .text(EXIT0)
        .global_in("_start", ".text", 0)
        .undefined("nowhere_to_be_found")
        .write_to(dir.path(), "main.o");
    let output = dir.path().join("undef");

    let error = libtinyld::link(&link_args(vec![main.clone()], output.clone())).unwrap_err();
    assert!(format!("{error:#}").contains("nowhere_to_be_found"));

    let args = Args {
        allow_undefined: true,
        ..link_args(vec![main], output.clone())
    };
    libtinyld::link(&args).unwrap();
    assert!(output.exists());
}

#[test]
fn test_missing_entry_symbol_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let main = ObjectBuilder::new()
        .text(&[0xc3])
        .global_in("helper", ".text", 0)
        .write_to(dir.path(), "main.o");

    let error = libtinyld::link(&link_args(vec![main], dir.path().join("out"))).unwrap_err();
    assert!(format!("{error:#}").contains("_start"));
}

#[test]
fn test_gc_sections_drops_unreferenced_objects() {
    let dir = tempfile::tempdir().unwrap();
    let start = ObjectBuilder::new()
        .text(&[0xe8, 0x00, 0x00, 0x00, 0x00, 0xc3, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90])
        .global_in("_start", ".text", 0)
        .undefined("keep")
        .rela(".text", 1, object::elf::R_X86_64_PC32, "keep", -4)
        .write_to(dir.path(), "start.o");
    let keep = ObjectBuilder::new()
        .text(&[0xc3; 16])
        .global_in("keep", ".text", 0)
        .write_to(dir.path(), "keep.o");
    let dead = ObjectBuilder::new()
        .text(&[0xc3; 16])
        .global_in("dead", ".text", 0)
        .write_to(dir.path(), "dead.o");

    let gc_out = dir.path().join("gc");
    let args = Args {
        gc_sections: true,
        ..link_args(vec![start.clone(), keep.clone(), dead.clone()], gc_out.clone())
    };
    libtinyld::link(&args).unwrap();

    let no_gc_out = dir.path().join("no_gc");
    libtinyld::link(&link_args(vec![start, keep, dead], no_gc_out.clone())).unwrap();

    let text_size = |path: &Path| load_segments(&std::fs::read(path).unwrap())[0].4;
    assert_eq!(text_size(&gc_out), 32);
    assert_eq!(text_size(&no_gc_out), 48);
}

#[test]
fn test_unimplemented_libc_backends_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let main = ObjectBuilder::new()
        .text(EXIT0)
        .global_in("_start", ".text", 0)
        .write_to(dir.path(), "main.o");
    let args = Args {
        libc: libtinyld::args::LibcBackend::System,
        ..link_args(vec![main], dir.path().join("out"))
    };
    let error = libtinyld::link(&args).unwrap_err();
    assert!(format!("{error:#}").contains("not implemented"));
}
