//! The global symbol table. Symbols from every surviving object are merged into one arena of
//! `LinkedSymbol` records addressed by stable `SymbolId` handles; a prehashed name map points at
//! the winning record for each name. Insertion applies the resolution-precedence rules, so after
//! construction each name has exactly one binding.

use crate::args;
use crate::error::Result;
use crate::hash::PassThroughHashMap;
use crate::layout::Layout;
use crate::layout::OutputSectionId;
use crate::parsing::ObjectFile;
use crate::parsing::Symbol;
use crate::parsing::SymbolSection;
use crate::symbol::SymbolName;
use anyhow::Context as _;
use anyhow::bail;
use std::collections::hash_map::Entry;

/// Name of the GOT-base symbol we synthesize so that objects referencing it always resolve. The
/// value is a placeholder; static links don't do GOT-relative addressing.
pub(crate) const GOT_BASE_SYMBOL_NAME: &str = "_GLOBAL_OFFSET_TABLE_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SymbolId(u32);

impl SymbolId {
    fn from_usize(index: usize) -> Self {
        Self(index as u32)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

pub(crate) struct LinkedSymbol<'data> {
    pub(crate) name: &'data str,
    /// Before `finalize_values` this is the symbol's value within its defining section; after,
    /// it's the final virtual address (or the raw value for absolutes).
    pub(crate) value: u64,
    pub(crate) size: u64,
    pub(crate) binding: u8,
    pub(crate) visibility: u8,
    pub(crate) placement: SymbolPlacement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SymbolPlacement {
    Undefined,
    Absolute,
    /// A tentative definition; `alignment` comes from `st_value` as the ELF spec prescribes.
    Common { alignment: u64 },
    /// Defined in `section` of `object`, at `value` bytes into it.
    InObject { object: usize, section: usize },
    /// Defined at a fixed offset in an output section (commons after allocation).
    InOutput { section: OutputSectionId, offset: u64 },
}

pub(crate) struct SymbolDb<'data> {
    names: PassThroughHashMap<SymbolName<'data>, SymbolId>,
    symbols: Vec<LinkedSymbol<'data>>,
    /// Symbols that were inserted as undefined strong references. Entries may have been defined
    /// since; `undefined_names` filters.
    undefined: Vec<SymbolId>,
}

impl<'data> SymbolDb<'data> {
    pub(crate) fn build(objects: &'data [ObjectFile]) -> Result<SymbolDb<'data>> {
        let mut db = SymbolDb {
            names: PassThroughHashMap::default(),
            symbols: Vec::new(),
            undefined: Vec::new(),
        };
        for (object_index, object) in objects.iter().enumerate() {
            for symbol in &object.symbols {
                if symbol.name.is_empty() {
                    continue;
                }
                if matches!(
                    symbol.kind,
                    object::elf::STT_SECTION | object::elf::STT_FILE
                ) {
                    continue;
                }
                if !symbol.is_global_or_weak() {
                    continue;
                }
                db.insert(object_index, symbol);
            }
        }
        db.add_synthetic_symbols();
        Ok(db)
    }

    fn insert(&mut self, object_index: usize, symbol: &'data Symbol) {
        let placement = match symbol.section {
            SymbolSection::Undefined => SymbolPlacement::Undefined,
            SymbolSection::Absolute => SymbolPlacement::Absolute,
            SymbolSection::Common => SymbolPlacement::Common {
                alignment: symbol.value.max(1),
            },
            SymbolSection::Section(section) => SymbolPlacement::InObject {
                object: object_index,
                section,
            },
        };
        let incoming = LinkedSymbol {
            name: &symbol.name,
            value: symbol.value,
            size: symbol.size,
            binding: symbol.binding,
            visibility: symbol.visibility,
            placement,
        };

        match self.names.entry(SymbolName::prehashed(&symbol.name)) {
            Entry::Occupied(entry) => {
                let id = *entry.get();
                resolve_pair(&mut self.symbols[id.as_usize()], incoming);
            }
            Entry::Vacant(entry) => {
                let id = SymbolId::from_usize(self.symbols.len());
                let track_undefined = placement == SymbolPlacement::Undefined
                    && symbol.binding == object::elf::STB_GLOBAL;
                self.symbols.push(incoming);
                entry.insert(id);
                if track_undefined {
                    self.undefined.push(id);
                }
            }
        }
    }

    /// Linker-provided symbols, inserted as already-defined absolute values so references to them
    /// resolve without any object having to define them.
    fn add_synthetic_symbols(&mut self) {
        let incoming = LinkedSymbol {
            name: GOT_BASE_SYMBOL_NAME,
            value: 0,
            size: 0,
            binding: object::elf::STB_GLOBAL,
            visibility: object::elf::STV_DEFAULT,
            placement: SymbolPlacement::Absolute,
        };
        match self.names.entry(SymbolName::prehashed(GOT_BASE_SYMBOL_NAME)) {
            Entry::Occupied(entry) => {
                let id = *entry.get();
                resolve_pair(&mut self.symbols[id.as_usize()], incoming);
            }
            Entry::Vacant(entry) => {
                entry.insert(SymbolId::from_usize(self.symbols.len()));
                self.symbols.push(incoming);
            }
        }
    }

    pub(crate) fn lookup(&self, name: &'data str) -> Option<SymbolId> {
        self.names.get(&SymbolName::prehashed(name)).copied()
    }

    pub(crate) fn symbol(&self, id: SymbolId) -> &LinkedSymbol<'data> {
        &self.symbols[id.as_usize()]
    }

    pub(crate) fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub(crate) fn num_weak(&self) -> usize {
        self.symbols
            .iter()
            .filter(|s| s.binding == object::elf::STB_WEAK)
            .count()
    }

    /// Names of strong references that still have no definition.
    pub(crate) fn undefined_names(&self) -> impl Iterator<Item = &'data str> + '_ {
        self.undefined.iter().filter_map(|id| {
            let symbol = &self.symbols[id.as_usize()];
            (symbol.placement == SymbolPlacement::Undefined).then_some(symbol.name)
        })
    }

    /// Allocates every common symbol into `.bss`, giving tentative definitions real storage.
    /// Must run after merging and before address assignment.
    pub(crate) fn allocate_commons(&mut self, layout: &mut Layout) {
        for symbol in &mut self.symbols {
            if let SymbolPlacement::Common { alignment } = symbol.placement {
                let (section, offset) = layout.reserve_bss(symbol.size, alignment);
                symbol.placement = SymbolPlacement::InOutput { section, offset };
                symbol.value = 0;
            }
        }
    }

    /// Rewrites section-relative symbol values into final virtual addresses. Must run after
    /// address assignment.
    pub(crate) fn finalize_values(&mut self, layout: &Layout) {
        let trace = args::address_tracing_enabled();
        for symbol in &mut self.symbols {
            match symbol.placement {
                SymbolPlacement::InObject { object, section } => {
                    match layout.placement(object, section) {
                        Some(place) => {
                            symbol.value += layout.section(place.section).vma + place.offset;
                        }
                        // The defining section was discarded (debug or other non-loaded
                        // section); the symbol keeps its raw value and can't be meaningfully
                        // referenced.
                        None => tracing::debug!(name = symbol.name, "symbol in discarded section"),
                    }
                }
                SymbolPlacement::InOutput { section, offset } => {
                    symbol.value = layout.section(section).vma + offset;
                }
                SymbolPlacement::Undefined
                | SymbolPlacement::Absolute
                | SymbolPlacement::Common { .. } => {}
            }
            if trace && symbol.placement != SymbolPlacement::Undefined {
                eprintln!("tinyld: symbol {} = {:#x}", symbol.name, symbol.value);
            }
        }
    }

    /// Enforces (or, with `allow_undefined`, merely reports) unresolved strong references left
    /// over once every archive has been searched.
    pub(crate) fn check_undefined(&self, allow_undefined: bool) -> Result {
        let undefined: Vec<&str> = self.undefined_names().collect();
        if undefined.is_empty() {
            return Ok(());
        }
        if allow_undefined {
            for name in &undefined {
                crate::error::warning(&format!("undefined reference to `{name}`"));
            }
            crate::error::warning(&format!(
                "{} undefined symbols (continuing because of --allow-undefined)",
                undefined.len()
            ));
            return Ok(());
        }
        let mut message = format!("{} undefined symbols, including:", undefined.len());
        for name in undefined.iter().take(20) {
            message.push_str("\n  ");
            message.push_str(name);
        }
        message.push_str("\nhint: supply the missing objects or libraries, or pass --allow-undefined");
        Err(anyhow::anyhow!(message))
    }

    /// Resolves the entry point: the configured entry symbol, falling back to `main`.
    pub(crate) fn entry_address(&self, entry_symbol: &'data str) -> Result<u64> {
        let id = self
            .lookup(entry_symbol)
            .filter(|id| self.symbol(*id).placement != SymbolPlacement::Undefined)
            .or_else(|| {
                self.lookup("main")
                    .filter(|id| self.symbol(*id).placement != SymbolPlacement::Undefined)
            })
            .with_context(|| {
                format!(
                    "entry symbol `{entry_symbol}` not found; \
                     hint: ensure a startup object defining it is linked"
                )
            })?;
        let address = self.symbol(id).value;
        if address == 0 {
            bail!("entry symbol `{entry_symbol}` resolved to address 0");
        }
        Ok(address)
    }

    pub(crate) fn dump(&self) {
        let mut ids: Vec<usize> = (0..self.symbols.len()).collect();
        ids.sort_by_key(|&i| self.symbols[i].value);
        eprintln!("tinyld: resolved symbol table ({} symbols):", ids.len());
        for i in ids {
            let symbol = &self.symbols[i];
            let bind = match symbol.binding {
                object::elf::STB_WEAK => 'w',
                object::elf::STB_GLOBAL => 'g',
                _ => 'l',
            };
            let state = match symbol.placement {
                SymbolPlacement::Undefined => " (undefined)",
                _ if symbol.visibility == object::elf::STV_HIDDEN => " (hidden)",
                _ => "",
            };
            eprintln!(
                "  {:#018x} {bind} {:6} {}{state}",
                symbol.value, symbol.size, symbol.name
            );
        }
    }
}

/// The resolution-precedence rules, applied when a second symbol with an existing name arrives.
fn resolve_pair<'data>(existing: &mut LinkedSymbol<'data>, incoming: LinkedSymbol<'data>) {
    let existing_defined = existing.placement != SymbolPlacement::Undefined;
    let incoming_defined = incoming.placement != SymbolPlacement::Undefined;

    // A strong definition overrides an existing weak one.
    if existing.binding == object::elf::STB_WEAK
        && incoming.binding == object::elf::STB_GLOBAL
        && incoming_defined
    {
        *existing = incoming;
        return;
    }

    // A weak symbol never overrides an existing strong definition.
    if existing.binding == object::elf::STB_GLOBAL && incoming.binding == object::elf::STB_WEAK {
        return;
    }

    // Two strong definitions: the first one inserted wins. No duplicate-symbol error; archives
    // routinely carry fallback definitions.
    if existing.binding == object::elf::STB_GLOBAL
        && incoming.binding == object::elf::STB_GLOBAL
        && existing_defined
        && incoming_defined
    {
        return;
    }

    // Two tentative definitions merge to the larger size.
    if let (
        SymbolPlacement::Common { .. },
        SymbolPlacement::Common {
            alignment: incoming_alignment,
        },
    ) = (existing.placement, incoming.placement)
    {
        if incoming.size > existing.size {
            existing.size = incoming.size;
            existing.placement = SymbolPlacement::Common {
                alignment: incoming_alignment,
            };
        }
        return;
    }

    // Any definition fills in an existing undefined slot.
    if !existing_defined && incoming_defined {
        *existing = incoming;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Architecture;
    use crate::parsing::Symbol;
    use smallvec::SmallVec;

    fn test_object(name: &str, symbols: Vec<Symbol>) -> ObjectFile {
        ObjectFile {
            name: name.to_owned(),
            arch: Architecture::X86_64,
            sections: Vec::new(),
            symbols,
            relocation_sections: SmallVec::new(),
            used: false,
        }
    }

    fn defined(name: &str, binding: u8, value: u64) -> Symbol {
        Symbol {
            name: name.to_owned(),
            value,
            size: 0,
            section: SymbolSection::Section(1),
            binding,
            kind: object::elf::STT_FUNC,
            visibility: object::elf::STV_DEFAULT,
        }
    }

    fn undefined(name: &str) -> Symbol {
        Symbol {
            name: name.to_owned(),
            value: 0,
            size: 0,
            section: SymbolSection::Undefined,
            binding: object::elf::STB_GLOBAL,
            kind: object::elf::STT_NOTYPE,
            visibility: object::elf::STV_DEFAULT,
        }
    }

    fn common(name: &str, size: u64, alignment: u64) -> Symbol {
        Symbol {
            name: name.to_owned(),
            value: alignment,
            size,
            section: SymbolSection::Common,
            binding: object::elf::STB_GLOBAL,
            kind: object::elf::STT_OBJECT,
            visibility: object::elf::STV_DEFAULT,
        }
    }

    #[test]
    fn test_strong_overrides_weak_in_both_orders() {
        let weak_first = [
            test_object("a.o", vec![defined("g", object::elf::STB_WEAK, 1)]),
            test_object("b.o", vec![defined("g", object::elf::STB_GLOBAL, 2)]),
        ];
        let strong_first = [
            test_object("b.o", vec![defined("g", object::elf::STB_GLOBAL, 2)]),
            test_object("a.o", vec![defined("g", object::elf::STB_WEAK, 1)]),
        ];
        for objects in [&weak_first, &strong_first] {
            let db = SymbolDb::build(objects).unwrap();
            let id = db.lookup("g").unwrap();
            assert_eq!(db.symbol(id).value, 2);
            assert_eq!(db.symbol(id).binding, object::elf::STB_GLOBAL);
        }
    }

    #[test]
    fn test_first_strong_definition_wins() {
        let objects = [
            test_object("a.o", vec![defined("f", object::elf::STB_GLOBAL, 10)]),
            test_object("b.o", vec![defined("f", object::elf::STB_GLOBAL, 20)]),
        ];
        let db = SymbolDb::build(&objects).unwrap();
        let id = db.lookup("f").unwrap();
        assert_eq!(db.symbol(id).value, 10);
        assert_eq!(
            db.symbol(id).placement,
            SymbolPlacement::InObject {
                object: 0,
                section: 1
            }
        );
    }

    #[test]
    fn test_definition_fills_undefined_regardless_of_order() {
        let objects = [
            test_object("a.o", vec![undefined("f")]),
            test_object("b.o", vec![defined("f", object::elf::STB_GLOBAL, 7)]),
        ];
        let db = SymbolDb::build(&objects).unwrap();
        assert_eq!(db.symbol(db.lookup("f").unwrap()).value, 7);
        assert_eq!(db.undefined_names().count(), 0);
    }

    #[test]
    fn test_commons_keep_largest_size() {
        let objects = [
            test_object("a.o", vec![common("x", 4, 4)]),
            test_object("b.o", vec![common("x", 8, 8)]),
        ];
        let db = SymbolDb::build(&objects).unwrap();
        let symbol = db.symbol(db.lookup("x").unwrap());
        assert_eq!(symbol.size, 8);
        assert_eq!(symbol.placement, SymbolPlacement::Common { alignment: 8 });
    }

    #[test]
    fn test_undefined_tracking() {
        let objects = [test_object("a.o", vec![undefined("missing")])];
        let db = SymbolDb::build(&objects).unwrap();
        assert_eq!(db.undefined_names().collect::<Vec<_>>(), vec!["missing"]);
        assert!(db.check_undefined(false).is_err());
        assert!(db.check_undefined(true).is_ok());
    }

    #[test]
    fn test_got_base_is_synthesized() {
        let objects = [test_object("a.o", vec![])];
        let db = SymbolDb::build(&objects).unwrap();
        let id = db.lookup(GOT_BASE_SYMBOL_NAME).unwrap();
        assert_eq!(db.symbol(id).placement, SymbolPlacement::Absolute);
    }
}
