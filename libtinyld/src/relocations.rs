//! Drives relocation application over every surviving object. Relocations are gathered into one
//! batch and sorted by target output section before being applied - processing order has no
//! semantic effect, it just keeps writes to any one section's bytes together.

use crate::arch::Arch;
use crate::arch::RelocationContext;
use crate::arch::RelocationOutcome;
use crate::ensure;
use crate::error::Result;
use crate::error::warning;
use crate::layout::Layout;
use crate::layout::OutputSectionId;
use crate::layout::SectionPlacement;
use crate::parsing::ObjectFile;
use crate::parsing::SymbolSection;
use crate::stats::LinkStats;
use crate::symbol_db::SymbolDb;

/// A relocation whose displacement couldn't be encoded directly. Pass 2 redirects the site
/// through a synthesized PLT stub.
pub(crate) struct OverflowCandidate {
    pub(crate) symbol_name: String,
    /// The referenced symbol's resolved address - what the GOT slot must contain.
    pub(crate) symbol_value: u64,
    pub(crate) section: OutputSectionId,
    /// Offset of the patch site within the output section.
    pub(crate) offset: u64,
    /// The address of the patch site (P).
    pub(crate) source_address: u64,
}

struct BatchEntry {
    object: usize,
    rela_section: usize,
    index: usize,
    place: SectionPlacement,
}

pub(crate) fn apply_relocations<'data, A: Arch>(
    objects: &'data [ObjectFile],
    layout: &mut Layout,
    db: &SymbolDb<'data>,
    dump_relocations: bool,
    stats: &mut LinkStats,
) -> Result<Vec<OverflowCandidate>> {
    let mut batch = Vec::new();
    for (object_index, object) in objects.iter().enumerate() {
        for (rela_index, rela_section) in object.relocation_sections.iter().enumerate() {
            let Some(place) = layout.placement(object_index, rela_section.target_section) else {
                // Relocations against discarded sections (debug info and friends) have nothing
                // to patch.
                tracing::debug!(
                    object = %object.name,
                    section = rela_section.target_section,
                    "relocations target a discarded section"
                );
                continue;
            };
            for index in 0..rela_section.relocations.len() {
                batch.push(BatchEntry {
                    object: object_index,
                    rela_section: rela_index,
                    index,
                    place,
                });
            }
        }
    }
    batch.sort_by(|a, b| {
        layout
            .section(a.place.section)
            .name
            .cmp(&layout.section(b.place.section).name)
    });

    let mut overflows = Vec::new();
    let mut dump_entries = Vec::new();

    for entry in &batch {
        let object = &objects[entry.object];
        let rel = &object.relocation_sections[entry.rela_section].relocations[entry.index];
        let section_id = entry.place.section;
        let output_offset = entry.place.offset + rel.offset;
        {
            let output_section = layout.section(section_id);
            ensure!(
                output_offset < output_section.size,
                "relocation at offset {:#x} lies outside section {} (from {})",
                rel.offset,
                output_section.name,
                object.name,
            );
        }
        let place_address = layout.section(section_id).vma + output_offset;

        let Some(symbol) = object.symbols.get(rel.symbol as usize) else {
            tracing::debug!(object = %object.name, "relocation symbol index out of range");
            continue;
        };

        // Resolution order: the global symbol table first, then section-local computation, and
        // finally a warning with value 0.
        let (symbol_value, symbol_size) = match db.lookup(&symbol.name) {
            Some(id) => {
                let resolved = db.symbol(id);
                (resolved.value, resolved.size)
            }
            None => match symbol.section {
                SymbolSection::Section(section_index) => {
                    match layout.placement(entry.object, section_index) {
                        Some(place) => (
                            layout.section(place.section).vma + place.offset + symbol.value,
                            symbol.size,
                        ),
                        None => {
                            // The symbol lives in a section we dropped; references to it can't
                            // be patched meaningfully.
                            tracing::debug!(
                                object = %object.name,
                                symbol = %symbol.name,
                                "relocation against symbol in discarded section"
                            );
                            continue;
                        }
                    }
                }
                _ => {
                    if !symbol.name.is_empty() {
                        warning(&format!(
                            "symbol `{}` not found for relocation in {}",
                            symbol.name, object.name
                        ));
                    }
                    (0, 0)
                }
            },
        };

        let rel_context = RelocationContext {
            r_type: rel.r_type,
            symbol_value,
            symbol_size,
            addend: rel.addend,
            place: place_address,
            offset: output_offset,
        };

        let Some(section_data) = layout.section_mut(section_id).data_mut() else {
            warning(&format!(
                "skipping relocation against dataless section (from {})",
                object.name
            ));
            stats.relocations_skipped += 1;
            continue;
        };

        let outcome = A::apply_relocation(&rel_context, section_data)?;
        let status = match outcome {
            RelocationOutcome::Applied => {
                stats.relocations_applied += 1;
                "applied"
            }
            RelocationOutcome::Skipped(reason) => {
                warning(&format!(
                    "skipping {} against `{}`: {reason}",
                    A::rel_type_to_string(rel.r_type),
                    symbol.name
                ));
                stats.relocations_skipped += 1;
                "skipped"
            }
            RelocationOutcome::Overflowed => {
                warning(&format!(
                    "{} against `{}` overflows, will redirect through GOT/PLT",
                    A::rel_type_to_string(rel.r_type),
                    symbol.name
                ));
                stats.relocations_skipped += 1;
                overflows.push(OverflowCandidate {
                    symbol_name: symbol.name.clone(),
                    symbol_value,
                    section: section_id,
                    offset: output_offset,
                    source_address: place_address,
                });
                "overflowed"
            }
        };

        if dump_relocations {
            dump_entries.push((place_address, rel.r_type, symbol.name.clone(), symbol_value, status));
        }
    }

    if dump_relocations {
        eprintln!("tinyld: applied relocations ({}):", dump_entries.len());
        for (address, r_type, symbol, value, status) in dump_entries {
            eprintln!(
                "  {address:#010x} {:28} {symbol:24} -> {value:#x} [{status}]",
                A::rel_type_to_string(r_type),
            );
        }
    }

    Ok(overflows)
}
