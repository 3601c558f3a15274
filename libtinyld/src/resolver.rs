//! Lazy archive resolution: extract the minimum set of archive members that satisfies the
//! undefined symbols of the working object set. Extraction can introduce new undefined symbols,
//! so the process iterates to a fixpoint, with a hard round cap so that pathological circular
//! archives still terminate.

use crate::archive_index::ArchiveIndex;
use crate::error::Result;
use crate::parsing::ObjectFile;
use crate::stats::LinkStats;
use crate::symbol_db::SymbolDb;

const MAX_RESOLUTION_ROUNDS: usize = 10;

pub(crate) fn extract_needed_members(
    objects: &mut Vec<ObjectFile>,
    archives: &mut [ArchiveIndex],
    stats: &mut LinkStats,
) -> Result {
    if archives.is_empty() {
        return Ok(());
    }

    let mut previous_undefined: Option<Vec<String>> = None;
    for round in 1..=MAX_RESOLUTION_ROUNDS {
        // The symbol table is rebuilt each round; extracted members both define symbols and
        // reference new ones.
        let mut undefined: Vec<String> = {
            let db = SymbolDb::build(objects)?;
            db.undefined_names().map(str::to_owned).collect()
        };
        undefined.sort_unstable();

        if undefined.is_empty() {
            tracing::debug!(round, "all symbols resolved");
            break;
        }
        // Fixpoint: the same set of names still undefined means another round can't help.
        if previous_undefined.as_ref() == Some(&undefined) {
            tracing::debug!(round, stuck_at = undefined.len(), "no resolution progress");
            break;
        }

        let mut extracted = 0;
        for archive in archives.iter_mut() {
            let mut wanted: Vec<usize> = undefined
                .iter()
                .filter_map(|name| archive.lookup(name))
                .collect();
            wanted.sort_unstable();
            wanted.dedup();
            for member in wanted {
                // extract() returns None for members that were already pulled in, so nothing is
                // ever extracted twice.
                if let Some(object) = archive.extract(member) {
                    objects.push(object);
                    extracted += 1;
                }
            }
        }

        stats.archive_members_extracted += extracted;
        tracing::debug!(round, undefined = undefined.len(), extracted, "resolution round");

        if extracted == 0 {
            break;
        }
        previous_undefined = Some(undefined);
    }

    Ok(())
}
