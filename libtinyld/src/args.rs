//! A handwritten parser for our arguments.
//!
//! We don't use a 3rd party library like clap because we need to behave like a linker: long
//! arguments must be accepted with a single '-' in addition to the more common double-dash,
//! `-l` and `-L` combine with their value in the same argument, and inputs are positional and
//! order-sensitive.

use crate::bail;
use crate::error::Result;
use std::path::PathBuf;

pub struct Args {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub lib_search_path: Vec<PathBuf>,
    pub libraries: Vec<String>,
    pub entry: String,
    pub libc: LibcBackend,
    pub gc_sections: bool,
    pub allow_undefined: bool,
    pub verbosity: u8,
    pub dump_symbols: bool,
    pub dump_relocations: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibcBackend {
    /// Link only against what was supplied on the command line. The only backend that's
    /// implemented.
    SelfContained,
    System,
    Mini,
}

impl std::fmt::Display for LibcBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LibcBackend::SelfContained => "self-contained",
            LibcBackend::System => "system",
            LibcBackend::Mini => "mini",
        })
    }
}

pub(crate) enum Action {
    Link(Box<Args>),
    Version,
}

/// Environment variable that turns on extra per-symbol and per-section address tracing. Purely
/// diagnostic; must never affect the produced output.
pub const DEBUG_ENV: &str = "TINYLD_DEBUG";

pub(crate) fn address_tracing_enabled() -> bool {
    std::env::var_os(DEBUG_ENV).is_some()
}

impl Default for Args {
    fn default() -> Self {
        Args {
            inputs: Vec::new(),
            output: PathBuf::from("a.out"),
            lib_search_path: Vec::new(),
            libraries: Vec::new(),
            entry: "_start".to_owned(),
            libc: LibcBackend::SelfContained,
            gc_sections: false,
            allow_undefined: false,
            verbosity: 0,
            dump_symbols: false,
            dump_relocations: false,
        }
    }
}

pub(crate) fn parse<S: AsRef<str>, I: Iterator<Item = S>>(mut input: I) -> Result<Action> {
    let mut args = Args::default();

    let mut take_value = |flag: &str, input: &mut I| -> Result<String> {
        match input.next() {
            Some(value) => Ok(value.as_ref().to_owned()),
            None => bail!("Missing value for argument `{flag}`"),
        }
    };

    while let Some(arg) = input.next() {
        let arg = arg.as_ref();

        if let Some(rest) = arg.strip_prefix("-L") {
            if rest.is_empty() {
                args.lib_search_path
                    .push(PathBuf::from(take_value("-L", &mut input)?));
            } else {
                args.lib_search_path.push(PathBuf::from(rest));
            }
            continue;
        }
        if let Some(rest) = arg.strip_prefix("-l") {
            if rest.is_empty() {
                args.libraries.push(take_value("-l", &mut input)?);
            } else {
                args.libraries.push(rest.to_owned());
            }
            continue;
        }
        if arg == "-o" {
            args.output = PathBuf::from(take_value("-o", &mut input)?);
            continue;
        }
        if let Some(mut long) = arg.strip_prefix('-') {
            // Long arguments are accepted with either one or two dashes.
            long = long.strip_prefix('-').unwrap_or(long);
            let (name, value) = match long.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (long, None),
            };
            match name {
                "version" => return Ok(Action::Version),
                "v" => args.verbosity = args.verbosity.max(1),
                "vv" => args.verbosity = args.verbosity.max(2),
                "vvv" => args.verbosity = args.verbosity.max(3),
                "gc-sections" => args.gc_sections = true,
                "no-gc-sections" => args.gc_sections = false,
                "allow-undefined" => args.allow_undefined = true,
                "dump-symbols" => args.dump_symbols = true,
                "dump-relocations" => args.dump_relocations = true,
                "entry" | "e" => {
                    args.entry = match value {
                        Some(value) => value.to_owned(),
                        None => take_value("--entry", &mut input)?,
                    };
                }
                "output" => {
                    args.output = PathBuf::from(match value {
                        Some(value) => value.to_owned(),
                        None => take_value("--output", &mut input)?,
                    });
                }
                "libc" => {
                    let value = match value {
                        Some(value) => value.to_owned(),
                        None => take_value("--libc", &mut input)?,
                    };
                    args.libc = match value.as_str() {
                        "self-contained" => LibcBackend::SelfContained,
                        "system" => LibcBackend::System,
                        "mini" => LibcBackend::Mini,
                        other => bail!("Unknown libc backend `{other}`"),
                    };
                }
                other => bail!("Unrecognised argument `-{other}`"),
            }
            continue;
        }
        args.inputs.push(PathBuf::from(arg));
    }

    if args.inputs.is_empty() {
        bail!("Missing input files");
    }

    Ok(Action::Link(Box::new(args)))
}

impl Args {
    /// The tracing filter directive corresponding to the `-v` count. `RUST_LOG`, when set, takes
    /// precedence over this.
    pub(crate) fn default_log_filter(&self) -> &'static str {
        match self.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
