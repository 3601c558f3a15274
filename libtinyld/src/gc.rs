//! Whole-object dead code elimination. Reachability is computed with a breadth-first search over
//! objects: an object is reachable if the entry symbol's definer is, or if a reachable object has
//! a relocation against a symbol the object defines. Unreachable objects are dropped before
//! section merging.

use crate::error::warning;
use crate::parsing::ObjectFile;
use crate::stats::LinkStats;
use std::collections::HashMap;
use std::collections::VecDeque;

/// Startup-support objects that are always kept. Their symbols are consumed by early runtime
/// code in ways that don't show up as ordinary relocations.
const PINNED_RUNTIME_OBJECTS: &[&str] = &["crt.o", "crt0.o", "init.o"];

pub(crate) fn eliminate_dead_objects(
    objects: &mut Vec<ObjectFile>,
    entry_symbol: &str,
    stats: &mut LinkStats,
) {
    let total = objects.len();
    mark_used_objects(objects, entry_symbol);
    objects.retain(|object| object.used);
    stats.objects_discarded += total - objects.len();
    tracing::info!(kept = objects.len(), total, "dead code elimination");
}

fn mark_used_objects(objects: &mut [ObjectFile], entry_symbol: &str) {
    let mut used = vec![false; objects.len()];
    let mut queue = VecDeque::new();

    for (index, object) in objects.iter().enumerate() {
        if PINNED_RUNTIME_OBJECTS.contains(&base_object_name(&object.name)) {
            used[index] = true;
            queue.push_back(index);
        }
    }

    // Which object defines each name. First definer wins, matching resolution order.
    let mut definers: HashMap<&str, usize> = HashMap::new();
    for (index, object) in objects.iter().enumerate() {
        for symbol in &object.symbols {
            if symbol.is_defined() && !symbol.name.is_empty() {
                definers.entry(&symbol.name).or_insert(index);
            }
        }
    }

    match definers
        .get(entry_symbol)
        .or_else(|| definers.get("main"))
        .copied()
    {
        Some(entry_object) => {
            if !used[entry_object] {
                used[entry_object] = true;
                queue.push_back(entry_object);
            }
        }
        None => {
            // Without a root there's nothing sound to eliminate from.
            warning(&format!(
                "gc-sections: entry point `{entry_symbol}` not found, keeping all objects"
            ));
            for object in objects.iter_mut() {
                object.used = true;
            }
            return;
        }
    }

    while let Some(index) = queue.pop_front() {
        let object = &objects[index];
        for rela_section in &object.relocation_sections {
            for relocation in &rela_section.relocations {
                let Some(symbol) = object.symbols.get(relocation.symbol as usize) else {
                    continue;
                };
                // References satisfied within the object don't pull anything in.
                if symbol.is_defined() {
                    continue;
                }
                if let Some(&definer) = definers.get(symbol.name.as_str()) {
                    if !used[definer] {
                        used[definer] = true;
                        queue.push_back(definer);
                    }
                }
            }
        }
    }

    for (object, keep) in objects.iter_mut().zip(used) {
        object.used = keep;
    }
}

/// `libfoo.a(bar.o)` -> `bar.o`, `/path/to/bar.o` -> `bar.o`.
fn base_object_name(name: &str) -> &str {
    if let Some(member) = name
        .rsplit_once('(')
        .and_then(|(_, member)| member.strip_suffix(')'))
    {
        return member;
    }
    name.rsplit('/').next().unwrap_or(name)
}
