use crate::hash::PreHashed;
use crate::hash::hash_bytes;
use std::fmt::Display;

/// A symbol name borrowed from the object that defined or referenced it. Stored prehashed so
/// that each name is hashed exactly once no matter how many times it's looked up.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct SymbolName<'data> {
    bytes: &'data str,
}

impl<'data> SymbolName<'data> {
    pub(crate) fn new(bytes: &'data str) -> SymbolName<'data> {
        Self { bytes }
    }

    pub(crate) fn prehashed(bytes: &'data str) -> PreHashed<SymbolName<'data>> {
        PreHashed::new(Self::new(bytes), hash_bytes(bytes.as_bytes()))
    }
}

impl Display for SymbolName<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self.bytes, f)
    }
}
