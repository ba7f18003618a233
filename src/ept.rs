// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::collections::BTreeMap;
use hyp_pages::{Gfn, Gpa, Hpa};

/// A TLB version number.
///
/// Versions track invalidations of a domain's second-level translations:
/// every `invept` issued on the hypercall return path bumps the version, so
/// callers can assert that a mutation has been followed by an invalidation.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TlbVersion(u64);

impl TlbVersion {
    /// Creates a new TLB version number, starting from 0.
    pub fn new() -> Self {
        TlbVersion(0)
    }

    /// Increments this TLB version number.
    pub fn increment(self) -> Self {
        TlbVersion(self.0 + 1)
    }
}

/// Access rights of a second-level mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Perm {
    Read,
    ReadWrite,
}

/// Effective memory type of a second-level mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemType {
    WriteBack,
    Uncacheable,
}

/// One 4kB second-level mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub hpa: Hpa,
    pub perm: Perm,
    pub mtype: MemType,
}

/// Errors from second-level map mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The frame is mapped and the requested mapping differs.
    AlreadyMapped(Gfn),
    /// The frame is not mapped.
    NotMapped(Gfn),
}

/// Holds results for second-level map operations.
pub type Result<T> = core::result::Result<T, Error>;

/// The second-level (guest-physical to host-physical) map of a domain.
///
/// The hardware EPT structures and the `invept` instruction itself belong to
/// the exit dispatcher; this trait is the authoritative hypervisor-side view
/// that the grant table and HVM parameter code mutate.
pub trait GuestPhysMap {
    /// Maps the 4kB guest frame `gfn` to `hpa`. Re-mapping an identical
    /// mapping is accepted; conflicting mappings are refused.
    fn map_4k(&mut self, gfn: Gfn, hpa: Hpa, perm: Perm, mtype: MemType) -> Result<()>;

    /// Removes the mapping of `gfn`, returning what was mapped.
    fn unmap(&mut self, gfn: Gfn) -> Result<Mapping>;

    /// Translates a guest-physical address, preserving the page offset.
    fn translate(&self, gpa: Gpa) -> Option<Hpa>;

    /// Records an invalidation of this map's cached translations and
    /// returns the new version.
    fn invalidate(&mut self) -> TlbVersion;

    /// Returns the current TLB version.
    fn tlb_version(&self) -> TlbVersion;
}

/// `GuestPhysMap` backed by a sorted frame map.
pub struct SoftEpt {
    map: BTreeMap<u64, Mapping>,
    version: TlbVersion,
}

impl SoftEpt {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
            version: TlbVersion::new(),
        }
    }

    /// Returns the number of 4kB mappings present.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if no mappings are present.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the mapping of `gfn`, if any.
    pub fn get(&self, gfn: Gfn) -> Option<Mapping> {
        self.map.get(&gfn.bits()).copied()
    }
}

impl Default for SoftEpt {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestPhysMap for SoftEpt {
    fn map_4k(&mut self, gfn: Gfn, hpa: Hpa, perm: Perm, mtype: MemType) -> Result<()> {
        let mapping = Mapping { hpa, perm, mtype };
        match self.map.get(&gfn.bits()) {
            None => {
                self.map.insert(gfn.bits(), mapping);
                Ok(())
            }
            Some(existing) if *existing == mapping => Ok(()),
            Some(_) => Err(Error::AlreadyMapped(gfn)),
        }
    }

    fn unmap(&mut self, gfn: Gfn) -> Result<Mapping> {
        self.map.remove(&gfn.bits()).ok_or(Error::NotMapped(gfn))
    }

    fn translate(&self, gpa: Gpa) -> Option<Hpa> {
        let mapping = self.map.get(&gpa.frame().bits())?;
        Some(Hpa::new(mapping.hpa.bits() | gpa.page_offset()))
    }

    fn invalidate(&mut self) -> TlbVersion {
        self.version = self.version.increment();
        self.version
    }

    fn tlb_version(&self) -> TlbVersion {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_translate_unmap() {
        let mut ept = SoftEpt::new();
        let gfn = Gfn::new(0x100);
        let hpa = Hpa::new(0x5000_1000);
        ept.map_4k(gfn, hpa, Perm::ReadWrite, MemType::WriteBack)
            .unwrap();
        assert_eq!(
            ept.translate(Gpa::new(0x100_123)),
            Some(Hpa::new(0x5000_1123))
        );
        assert_eq!(ept.translate(Gpa::new(0x101_000)), None);

        let mapping = ept.unmap(gfn).unwrap();
        assert_eq!(mapping.hpa, hpa);
        assert_eq!(ept.unmap(gfn), Err(Error::NotMapped(gfn)));
    }

    #[test]
    fn conflicting_remap_refused() {
        let mut ept = SoftEpt::new();
        let gfn = Gfn::new(7);
        ept.map_4k(gfn, Hpa::new(0x1000), Perm::Read, MemType::WriteBack)
            .unwrap();
        // Identical remap is idempotent.
        ept.map_4k(gfn, Hpa::new(0x1000), Perm::Read, MemType::WriteBack)
            .unwrap();
        assert_eq!(
            ept.map_4k(gfn, Hpa::new(0x2000), Perm::Read, MemType::WriteBack),
            Err(Error::AlreadyMapped(gfn))
        );
    }

    #[test]
    fn invalidation_bumps_version() {
        let mut ept = SoftEpt::new();
        let v0 = ept.tlb_version();
        let v1 = ept.invalidate();
        assert!(v1 > v0);
        assert_eq!(ept.tlb_version(), v1);
    }
}
