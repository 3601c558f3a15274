use crate::arch::Architecture;
use crate::args::Args;
use crate::args::LibcBackend;
use crate::parsing::ObjectFile;
use crate::stats::LinkStats;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub(crate) use anyhow::bail;
pub(crate) use anyhow::ensure;

pub(crate) mod aarch64;
pub(crate) mod arch;
pub(crate) mod archive;
pub(crate) mod archive_index;
pub mod args;
pub(crate) mod elf;
pub(crate) mod elf_writer;
pub mod error;
pub(crate) mod file_kind;
pub(crate) mod gc;
pub(crate) mod gotplt;
pub(crate) mod hash;
pub(crate) mod input_data;
pub(crate) mod layout;
pub(crate) mod parsing;
pub(crate) mod relocations;
pub(crate) mod resolver;
pub mod stats;
pub(crate) mod symbol;
pub(crate) mod symbol_db;
pub(crate) mod x86_64;

pub struct Linker {
    action: args::Action,
}

impl Linker {
    pub fn from_args<S: AsRef<str>, I: Iterator<Item = S>>(args: I) -> error::Result<Self> {
        Ok(Linker {
            action: args::parse(args)?,
        })
    }

    pub fn run(&self) -> error::Result {
        match &self.action {
            args::Action::Link(args) => {
                init_tracing(args);
                link(args).map(|_| ())
            }
            args::Action::Version => {
                println!("tinyld {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.default_log_filter()));
    // try_init rather than init: several links may run in one process (tests do), and only the
    // first one gets to install the subscriber.
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

/// Runs a whole link: parse, resolve archives, GC, merge, lay out, resolve symbols, relocate,
/// repair overflows, write. Returns the link statistics once the output file is on disk and
/// marked executable.
pub fn link(args: &Args) -> error::Result<LinkStats> {
    match args.libc {
        LibcBackend::SelfContained => {}
        other => bail!("--libc={other} is not implemented"),
    }

    let mut stats = LinkStats::default();

    let input_data = input_data::InputData::from_args(args)?;
    let mut objects = parsing::parse_input_files(&input_data)?;
    stats.input_objects = objects.len();

    let mut archives = archive_index::build_indexes(input_data)?;
    resolver::extract_needed_members(&mut objects, &mut archives, &mut stats)?;
    drop(archives);

    if args.gc_sections {
        gc::eliminate_dead_objects(&mut objects, &args.entry, &mut stats);
    }

    match parsing::common_architecture(&objects)? {
        Architecture::X86_64 => link_for_arch::<x86_64::X86_64>(args, &objects, &mut stats)?,
        Architecture::AArch64 => link_for_arch::<aarch64::AArch64>(args, &objects, &mut stats)?,
    }
    Ok(stats)
}

fn link_for_arch<'data, A: arch::Arch>(
    args: &'data Args,
    objects: &'data [ObjectFile],
    stats: &mut LinkStats,
) -> error::Result {
    let mut layout = layout::Layout::merge(objects)?;

    let mut symbol_db = symbol_db::SymbolDb::build(objects)?;
    symbol_db.check_undefined(args.allow_undefined)?;
    symbol_db.allocate_commons(&mut layout);

    layout.assign_addresses();
    symbol_db.finalize_values(&layout);

    stats.total_symbols = symbol_db.num_symbols();
    stats.undefined_symbols = symbol_db.undefined_names().count();
    stats.weak_symbols = symbol_db.num_weak();
    if args.dump_symbols {
        symbol_db.dump();
    }

    let overflows = relocations::apply_relocations::<A>(
        objects,
        &mut layout,
        &symbol_db,
        args.dump_relocations,
        stats,
    )?;
    if !overflows.is_empty() {
        let table = gotplt::GotPltTable::build::<A>(&overflows, &layout)?;
        table.redirect_overflows(&overflows, &mut layout, stats)?;
        table.embed(&mut layout);
    }
    stats.output_sections = layout.sections.len();

    let entry = symbol_db.entry_address(&args.entry)?;
    elf_writer::write::<A>(&args.output, &layout, entry)?;

    stats.log_summary();
    Ok(())
}
