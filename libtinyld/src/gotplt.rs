//! GOT/PLT synthesis for relocations whose direct encoding overflowed. One GOT slot (the
//! referenced symbol's absolute address) and one 16-byte PLT stub (an indirect jump through that
//! slot) are generated per unique symbol. The GOT goes on the first page boundary after `.text`,
//! the PLT immediately after it, so stubs stay within easy reach of the code that calls them.

use crate::arch::Arch;
use crate::elf::GOT_ENTRY_SIZE;
use crate::elf::PAGE_SIZE;
use crate::elf::PLT_ENTRY_SIZE;
use crate::elf::align_up;
use crate::elf::secnames;
use crate::elf::shf;
use crate::error::Result;
use crate::layout::Layout;
use crate::layout::OutputSection;
use crate::relocations::OverflowCandidate;
use crate::stats::LinkStats;
use anyhow::Context as _;
use anyhow::anyhow;
use anyhow::ensure;
use std::collections::HashMap;

pub(crate) struct GotPltTable {
    pub(crate) got_base: u64,
    pub(crate) plt_base: u64,
    /// Slot order; one GOT entry and one PLT stub per name.
    names: Vec<String>,
    slot_by_name: HashMap<String, usize>,
    got_data: Vec<u8>,
    plt_data: Vec<u8>,
}

impl GotPltTable {
    pub(crate) fn build<A: Arch>(
        candidates: &[OverflowCandidate],
        layout: &Layout,
    ) -> Result<GotPltTable> {
        let text_id = layout
            .section_id(secnames::TEXT_SECTION_NAME)
            .context("GOT/PLT synthesis requires a .text section")?;
        let text = layout.section(text_id);
        let got_base = align_up(text.vma + text.size, PAGE_SIZE);

        // One slot per unique symbol, in first-seen order.
        let mut names = Vec::new();
        let mut slot_by_name = HashMap::new();
        let mut addresses = Vec::new();
        for candidate in candidates {
            if !slot_by_name.contains_key(&candidate.symbol_name) {
                slot_by_name.insert(candidate.symbol_name.clone(), names.len());
                names.push(candidate.symbol_name.clone());
                addresses.push(candidate.symbol_value);
            }
        }

        let plt_base = got_base + names.len() as u64 * GOT_ENTRY_SIZE;

        let mut got_data = Vec::with_capacity(addresses.len() * GOT_ENTRY_SIZE as usize);
        for address in &addresses {
            got_data.extend_from_slice(&address.to_le_bytes());
        }

        let mut plt_data = vec![0u8; names.len() * PLT_ENTRY_SIZE as usize];
        for (slot, stub) in plt_data.chunks_mut(PLT_ENTRY_SIZE as usize).enumerate() {
            let plt_address = plt_base + slot as u64 * PLT_ENTRY_SIZE;
            let got_address = got_base + slot as u64 * GOT_ENTRY_SIZE;
            A::write_plt_entry(stub, got_address, plt_address)
                .with_context(|| format!("Failed to generate PLT stub for `{}`", names[slot]))?;
        }

        tracing::info!(
            entries = names.len(),
            got_base,
            plt_base,
            "synthesized GOT/PLT tables"
        );

        Ok(GotPltTable {
            got_base,
            plt_base,
            names,
            slot_by_name,
            got_data,
            plt_data,
        })
    }

    pub(crate) fn plt_address(&self, symbol: &str) -> Option<u64> {
        self.slot_by_name
            .get(symbol)
            .map(|slot| self.plt_base + *slot as u64 * PLT_ENTRY_SIZE)
    }

    /// Pass 2: overwrite every overflowed site with the displacement of its PLT stub. The PLT
    /// being out of range too is unrecoverable.
    pub(crate) fn redirect_overflows(
        &self,
        candidates: &[OverflowCandidate],
        layout: &mut Layout,
        stats: &mut LinkStats,
    ) -> Result {
        for candidate in candidates {
            let plt_address = self
                .plt_address(&candidate.symbol_name)
                .with_context(|| format!("no PLT entry for `{}`", candidate.symbol_name))?;
            let displacement = (plt_address as i64) - (candidate.source_address as i64 + 4);
            let displacement: i32 = displacement.try_into().map_err(|_| {
                anyhow!(
                    "PLT stub for `{}` is itself out of signed 32-bit range \
                     (displacement {displacement:#x})",
                    candidate.symbol_name
                )
            })?;

            let section = layout.section_mut(candidate.section);
            let data = section
                .data_mut()
                .context("overflowed relocation in a section without data")?;
            let offset = candidate.offset as usize;
            ensure!(
                offset + 4 <= data.len(),
                "overflowed relocation site lies outside its section"
            );
            data[offset..offset + 4].copy_from_slice(&displacement.to_le_bytes());
            stats.overflows_redirected += 1;
        }
        Ok(())
    }

    /// Appends the synthesized tables to the output sections so the writer emits them.
    pub(crate) fn embed(self, layout: &mut Layout) {
        let got_base = self.got_base;
        let plt_base = self.plt_base;
        layout.push_synthetic(OutputSection::synthetic(
            secnames::GOT_SECTION_NAME,
            shf::ALLOC.with(shf::WRITE),
            GOT_ENTRY_SIZE,
            got_base,
            self.got_data,
        ));
        layout.push_synthetic(OutputSection::synthetic(
            secnames::PLT_SECTION_NAME,
            shf::ALLOC.with(shf::EXECINSTR),
            PLT_ENTRY_SIZE,
            plt_base,
            self.plt_data,
        ));
        tracing::debug!(got_base, plt_base, "embedded GOT/PLT sections");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::OutputSectionId;
    use crate::x86_64::X86_64;

    /// A layout with just a `.text` section, the way the GOT/PLT pass sees one.
    fn layout_with_text(vma: u64, size: usize) -> (Layout, OutputSectionId) {
        let mut layout = Layout::merge(&[]).unwrap();
        let id = layout.push_synthetic(OutputSection::synthetic(
            ".text",
            shf::ALLOC.with(shf::EXECINSTR),
            16,
            vma,
            vec![0; size],
        ));
        (layout, id)
    }

    /// Follows the emitted machine code: the patched call displacement leads to a PLT stub,
    /// the stub's rip-relative load leads to a GOT slot, and the slot holds the symbol address.
    #[test]
    fn test_overflow_redirection_chain_reaches_symbol() {
        let (mut layout, text_id) = layout_with_text(0x401000, 0x100);
        let far_symbol = 0x401000 + 0xc000_0000; // ~3 GiB away, unreachable by PC32
        let candidate = OverflowCandidate {
            symbol_name: "far".to_owned(),
            symbol_value: far_symbol,
            section: text_id,
            offset: 0x10,
            source_address: 0x401010,
        };

        let table = GotPltTable::build::<X86_64>(std::slice::from_ref(&candidate), &layout).unwrap();
        assert_eq!(table.got_base, 0x402000);
        assert_eq!(table.plt_base, 0x402008);

        let mut stats = LinkStats::default();
        table
            .redirect_overflows(std::slice::from_ref(&candidate), &mut layout, &mut stats)
            .unwrap();
        assert_eq!(stats.overflows_redirected, 1);

        // The call site now holds a displacement that lands on the PLT stub.
        let text = layout.section(text_id).data().unwrap().to_vec();
        let disp = i32::from_le_bytes(text[0x10..0x14].try_into().unwrap());
        let branch_target = (candidate.source_address + 4).wrapping_add_signed(disp as i64);
        assert_eq!(branch_target, 0x402008);

        table.embed(&mut layout);
        let got = layout.section(layout.section_id(".got").unwrap());
        let plt = layout.section(layout.section_id(".plt").unwrap());
        assert!(got.flags.contains(shf::WRITE));
        assert!(plt.is_executable());

        // The stub jumps through its GOT slot...
        let plt_data = plt.data().unwrap();
        assert_eq!(&plt_data[..2], &[0xff, 0x25]);
        let stub_disp = i32::from_le_bytes(plt_data[2..6].try_into().unwrap());
        let slot = (plt.vma + 6).wrapping_add_signed(stub_disp as i64);
        assert_eq!(slot, got.vma);

        // ...and the slot holds the original symbol's address.
        let got_data = got.data().unwrap();
        assert_eq!(u64::from_le_bytes(got_data[..8].try_into().unwrap()), far_symbol);
    }

    #[test]
    fn test_candidates_are_deduplicated_by_symbol() {
        let (layout, text_id) = layout_with_text(0x401000, 0x100);
        let candidate = |offset: u64| OverflowCandidate {
            symbol_name: "far".to_owned(),
            symbol_value: 0x9_0000_0000,
            section: text_id,
            offset,
            source_address: 0x401000 + offset,
        };
        let candidates = vec![candidate(0x10), candidate(0x20), candidate(0x30)];
        let table = GotPltTable::build::<X86_64>(&candidates, &layout).unwrap();
        assert_eq!(table.names.len(), 1);
        assert_eq!(table.got_data.len(), 8);
        assert_eq!(table.plt_data.len(), 16);
    }
}
