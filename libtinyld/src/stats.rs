//! Counters accumulated over a link and summarised at the end. Kept in an explicit struct that's
//! threaded through the pipeline rather than in process-wide state, so that several independent
//! links can run in one process (and so tests can assert on them).

#[derive(Default, Debug)]
pub struct LinkStats {
    pub input_objects: usize,
    pub archive_members_extracted: usize,
    pub objects_discarded: usize,
    pub total_symbols: usize,
    pub undefined_symbols: usize,
    pub weak_symbols: usize,
    pub relocations_applied: usize,
    pub relocations_skipped: usize,
    pub overflows_redirected: usize,
    pub output_sections: usize,
}

impl LinkStats {
    pub(crate) fn log_summary(&self) {
        tracing::info!(
            input_objects = self.input_objects,
            archive_members_extracted = self.archive_members_extracted,
            objects_discarded = self.objects_discarded,
            symbols = self.total_symbols,
            undefined = self.undefined_symbols,
            weak = self.weak_symbols,
            "symbol summary"
        );
        tracing::info!(
            applied = self.relocations_applied,
            skipped = self.relocations_skipped,
            redirected = self.overflows_redirected,
            sections = self.output_sections,
            "relocation summary"
        );
    }
}
