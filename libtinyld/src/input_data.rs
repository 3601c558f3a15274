//! Code for figuring out what input files we need to read then mapping them into memory.

use crate::args::Args;
use crate::error::Result;
use crate::error::warning;
use crate::file_kind::FileKind;
use anyhow::Context;
use memmap2::Mmap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

pub(crate) struct InputData {
    /// Files given as positional inputs: relocatable objects, or archives whose every member
    /// should be considered (an archive named directly behaves like a library that's always
    /// searched).
    pub(crate) files: Vec<InputFile>,
}

pub(crate) struct InputFile {
    pub(crate) filename: PathBuf,
    pub(crate) kind: FileKind,
    bytes: Mmap,
}

impl InputFile {
    pub(crate) fn data(&self) -> &[u8] {
        &self.bytes
    }
}

impl InputData {
    pub(crate) fn from_args(config: &Args) -> Result<Self> {
        let mut input_data = InputData { files: Vec::new() };
        let mut seen = HashSet::new();

        for path in &config.inputs {
            input_data.register_input(path, &mut seen)?;
        }

        for lib_name in &config.libraries {
            let filename = format!("lib{lib_name}.a");
            match search_for_file(&config.lib_search_path, &filename) {
                Some(path) => input_data.register_input(&path, &mut seen)?,
                // A library that cannot be found provides nothing; the link may still succeed
                // if nothing needed it.
                None => warning(&format!("library `{lib_name}` not found on search path")),
            }
        }

        Ok(input_data)
    }

    fn register_input(&mut self, path: &Path, seen: &mut HashSet<PathBuf>) -> Result {
        let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_owned());
        if !seen.insert(absolute) {
            // File has already been added.
            return Ok(());
        }

        let bytes = mmap_file(path)?;
        let kind = FileKind::identify_bytes(&bytes)
            .with_context(|| format!("Failed to process input file `{}`", path.display()))?;

        self.files.push(InputFile {
            filename: path.to_owned(),
            kind,
            bytes,
        });
        Ok(())
    }
}

pub(crate) fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open input file `{}`", path.display()))?;

    // Safety: this is only sound if nothing modifies the input files while we have them mapped.
    // There's no way to protect against that on Linux, and reading all inputs up-front would cost
    // us the ability to skip the (usually large) parts of archives that we never extract, so we
    // accept the same compromise every mmap-based linker accepts.
    let bytes = unsafe { memmap2::MmapOptions::new().map(&file) }
        .with_context(|| format!("Failed to mmap input file `{}`", path.display()))?;

    Ok(bytes)
}

fn search_for_file(lib_search_path: &[PathBuf], filename: &str) -> Option<PathBuf> {
    for dir in lib_search_path {
        let path = dir.join(filename);
        if path.exists() {
            return Some(path);
        }
    }
    None
}
