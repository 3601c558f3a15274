//! Code to read `ar` files. We don't use the ar crate because it only hands out entry data via
//! the Read trait and we want to borrow each entry's bytes straight out of the mapped archive.
//! The ar crate is still used as a dev dependency so tests can cross-check our reader against it.

use crate::bail;
use crate::error::Result;
use anyhow::Context as _;
use bytemuck::Pod;
use bytemuck::Zeroable;
use std::ops::Range;

pub(crate) enum ArchiveEntry<'data> {
    /// The archive's own symbol table. We build our own index from member symbol tables, so this
    /// is skipped.
    Ignored,
    Regular(ArchiveContent<'data>),
    Filenames(ExtendedFilenames<'data>),
}

#[derive(Clone, Copy)]
pub(crate) struct ExtendedFilenames<'data> {
    data: &'data [u8],
}

pub(crate) struct ArchiveContent<'data> {
    ident: &'data str,

    pub(crate) entry_data: &'data [u8],

    /// Where in the archive this entry's 60-byte header starts.
    pub(crate) header_offset: usize,

    /// The byte range of the entry's data within the archive.
    pub(crate) data_range: Range<usize>,
}

pub(crate) struct ArchiveIterator<'data> {
    data: &'data [u8],
    offset: usize,
}

/// The classic 60-byte `ar` member header. All fields are space-padded ASCII; sizes and dates are
/// decimal.
#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
pub(crate) struct EntryHeader {
    ident: [u8; 16],
    _timestamp: [u8; 12],
    _owner_id: [u8; 6],
    _group_id: [u8; 6],
    _mode: [u8; 8],
    size: [u8; 10],
    end: [u8; 2],
}

pub(crate) const ENTRY_HEADER_SIZE: usize = size_of::<EntryHeader>();

const _ASSERTS: () = {
    assert!(ENTRY_HEADER_SIZE == 60);
};

const ENTRY_TRAILER: &[u8; 2] = b"`\n";

impl<'data> ArchiveIterator<'data> {
    /// Create an iterator from the bytes of the whole archive, starting with the `!<arch>\n`
    /// magic.
    pub(crate) fn from_archive_bytes(data: &'data [u8]) -> Result<Self> {
        let magic = object::archive::MAGIC;
        let Some(rest) = data.strip_prefix(&magic) else {
            bail!("Missing archive magic");
        };
        Ok(Self {
            data: rest,
            offset: magic.len(),
        })
    }

    fn next_result(&mut self) -> Result<Option<ArchiveEntry<'data>>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        if self.data.len() < ENTRY_HEADER_SIZE {
            bail!("Short entry header");
        }
        let header_offset = self.offset;
        let (header, rest) = self.data.split_at(ENTRY_HEADER_SIZE);
        let header: &EntryHeader = bytemuck::from_bytes(header);
        if header.end != *ENTRY_TRAILER {
            bail!("Invalid entry header at offset {header_offset}");
        }
        let size = parse_decimal(&header.size)
            .with_context(|| format!("Bad entry size at offset {header_offset}"))?;
        self.data = rest;
        self.offset += ENTRY_HEADER_SIZE;

        if self.data.len() < size {
            bail!("Entry size is {size}, but only {} bytes left", self.data.len());
        }
        let ident = std::str::from_utf8(&header.ident)
            .context("archive ident is invalid UTF-8")?
            .trim_end();
        let entry = match ident {
            "/" | "/SYM64/" => ArchiveEntry::Ignored,
            "//" => ArchiveEntry::Filenames(ExtendedFilenames {
                data: &self.data[..size],
            }),
            _ => ArchiveEntry::Regular(ArchiveContent {
                ident,
                entry_data: &self.data[..size],
                header_offset,
                data_range: self.offset..self.offset + size,
            }),
        };

        // Each member is padded to an even byte boundary.
        let size_with_padding = size.next_multiple_of(2).min(self.data.len());
        self.data = &self.data[size_with_padding..];
        self.offset += size_with_padding;
        Ok(Some(entry))
    }
}

fn parse_decimal(field: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(field)?.trim_end_matches([' ', '\0']);
    Ok(text.parse()?)
}

impl EntryHeader {
    /// Checks the trailer magic and the size field. Used when re-reading a header at a recorded
    /// offset just before extracting the member it describes.
    pub(crate) fn validate(&self) -> Result {
        if self.end != *ENTRY_TRAILER {
            bail!("Invalid archive member header");
        }
        parse_decimal(&self.size)?;
        Ok(())
    }
}

impl<'data> ArchiveContent<'data> {
    /// Returns the identifier (generally a filename) for this entry. Short names live in the
    /// header, trailed by a '/'; names of the form `/<offset>` reference the GNU extended
    /// filenames entry.
    pub(crate) fn identifier(
        &self,
        extended_filenames: Option<ExtendedFilenames<'data>>,
    ) -> &'data [u8] {
        if let Some(filenames) = extended_filenames {
            if let Some(rest) = self.ident.strip_prefix('/') {
                // GNU ar appends a trailing '/' to the reference only when the filename is
                // exactly 15 bytes, so strip it before parsing the offset.
                if let Ok(offset) = rest.trim_end_matches('/').trim_end().parse::<usize>() {
                    if offset < filenames.data.len() {
                        return extended_name(&filenames.data[offset..]);
                    }
                }
            }
        }
        self.ident.trim_end_matches('/').as_bytes()
    }
}

/// Each name in the extended filenames blob ends with "/\n". Paths may contain '/', so scan for
/// the newline rather than the slash.
fn extended_name(data: &[u8]) -> &[u8] {
    let end = memchr::memchr(b'\n', data).unwrap_or(data.len());
    let name = &data[..end];
    name.strip_suffix(b"/").unwrap_or(name)
}

impl<'data> Iterator for ArchiveIterator<'data> {
    type Item = Result<ArchiveEntry<'data>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_result().transpose()
    }
}
