// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use hyp_pages::Hpa;
use static_assertions::const_assert;

// Root- and context-table entry formats. Both are 128 bits; a 4kB table page
// holds 256 of either, indexed by bus number (root table) or devfn (context
// table).

const ADDR_MASK: u64 = !0xfff;

/// A root-table entry. If present, points at the context-table page for one
/// PCI bus.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RootEntry {
    lo: u64,
    hi: u64,
}

const RE_PRESENT: u64 = 1 << 0;

impl RootEntry {
    /// Creates a present entry pointing at the context table page at `ctp`.
    pub fn new(ctp: Hpa) -> Self {
        Self {
            lo: (ctp.bits() & ADDR_MASK) | RE_PRESENT,
            hi: 0,
        }
    }

    /// Returns if this entry is marked present.
    pub fn present(&self) -> bool {
        self.lo & RE_PRESENT != 0
    }

    /// Returns the context-table pointer.
    pub fn context_table(&self) -> Hpa {
        Hpa::new(self.lo & ADDR_MASK)
    }
}

// Context-entry low qword: P bit 0, FPD bit 1, TT bits 3:2, SLPTPTR 63:12.
// High qword: AW bits 2:0, DID bits 23:8.
const CE_PRESENT: u64 = 1 << 0;
const CE_TT_SHIFT: u64 = 2;
const CE_AW_MASK: u64 = 0x7;
const CE_DID_SHIFT: u64 = 8;
const CE_DID_MASK: u64 = 0xffff;

/// Translation types a context entry can request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum TranslationType {
    /// Untranslated requests walk the second-level tables.
    Untranslated = 0,
    /// All request types are translated.
    All = 1,
    /// Untranslated requests bypass translation.
    PassThrough = 2,
}

/// A context-table entry: the translation context for one device function.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ContextEntry {
    lo: u64,
    hi: u64,
}

impl ContextEntry {
    /// Creates a present entry translating through the second-level table at
    /// `slpt`, tagged with `did` and walked at `aw` (the AGAW encoding:
    /// 1 = 3-level/39-bit, 2 = 4-level/48-bit).
    pub fn new(did: u16, aw: u8, slpt: Hpa) -> Self {
        Self {
            lo: (slpt.bits() & ADDR_MASK)
                | ((TranslationType::Untranslated as u64) << CE_TT_SHIFT)
                | CE_PRESENT,
            hi: (aw as u64 & CE_AW_MASK) | ((did as u64) << CE_DID_SHIFT),
        }
    }

    /// Returns if this entry is marked present.
    pub fn present(&self) -> bool {
        self.lo & CE_PRESENT != 0
    }

    /// Returns the domain id the entry tags IOTLB entries with.
    pub fn did(&self) -> u16 {
        ((self.hi >> CE_DID_SHIFT) & CE_DID_MASK) as u16
    }

    /// Returns the AGAW encoding of the walk.
    pub fn aw(&self) -> u8 {
        (self.hi & CE_AW_MASK) as u8
    }

    /// Returns the second-level table pointer.
    pub fn slpt(&self) -> Hpa {
        Hpa::new(self.lo & ADDR_MASK)
    }
}

/// Entries per 4kB root or context table page.
pub const ENTRIES_PER_TABLE: usize = 256;

const_assert!(core::mem::size_of::<RootEntry>() == 16);
const_assert!(core::mem::size_of::<ContextEntry>() == 16);
const_assert!(ENTRIES_PER_TABLE * core::mem::size_of::<ContextEntry>() == 4096);
