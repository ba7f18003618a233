// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use core::ptr::NonNull;

use crate::addr::Hpa;

/// Interface to the VMM's own address space.
///
/// The core consumes three services from the memory manager: resolving a
/// host-physical frame through the direct map, installing a short-lived 4kB
/// mapping for frames outside the direct map, and mapping device register
/// windows uncached. Mappings returned from here tear themselves down when
/// dropped, so every exit path releases them.
pub trait HostMapper: Sync {
    /// Resolves `hpa` through the direct map, if it is covered.
    fn phys_to_ptr(&self, hpa: Hpa) -> Option<NonNull<u8>>;

    /// Installs a temporary writable 4kB mapping of the frame containing
    /// `hpa`. `hpa` must be 4kB-aligned.
    fn map_page(&'static self, hpa: Hpa) -> Option<TempPage>;

    /// Maps the 4kB frame at `hpa` uncached, for device registers whose
    /// accesses must reach the bus.
    fn map_uncached(&'static self, hpa: Hpa) -> Option<MmioWindow>;

    /// Retargets `window` at `new_hpa`, flushing any stale translation for
    /// the window's virtual address. Returns the window's new pointer.
    fn remap_uncached(&self, window: &MmioWindow, new_hpa: Hpa) -> Option<NonNull<u8>>;

    /// Tears down a mapping previously returned from `map_page` or
    /// `map_uncached`. Called from the guards' `Drop`.
    fn unmap(&self, ptr: NonNull<u8>);
}

/// A temporary 4kB mapping, released on drop.
pub struct TempPage {
    ptr: NonNull<u8>,
    mapper: &'static dyn HostMapper,
}

impl TempPage {
    /// Returns a pointer to the first mapped byte.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }
}

impl Drop for TempPage {
    fn drop(&mut self) {
        self.mapper.unmap(self.ptr);
    }
}

/// An uncached register window over one 4kB host frame. The window can be
/// retargeted when the underlying device moves (e.g. a relocated xAPIC MMIO
/// page); its mapping is released on drop.
pub struct MmioWindow {
    ptr: NonNull<u8>,
    hpa: Hpa,
    mapper: &'static dyn HostMapper,
}

impl MmioWindow {
    /// Returns a pointer to the first byte of the window.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the host-physical frame the window currently targets.
    pub fn hpa(&self) -> Hpa {
        self.hpa
    }

    /// Points the window at `new_hpa`. Fails without modifying the window if
    /// the mapper cannot retarget it.
    pub fn retarget(&mut self, new_hpa: Hpa) -> Option<()> {
        let ptr = self.mapper.remap_uncached(self, new_hpa)?;
        self.ptr = ptr;
        self.hpa = new_hpa;
        Some(())
    }
}

impl Drop for MmioWindow {
    fn drop(&mut self) {
        self.mapper.unmap(self.ptr);
    }
}

// Safety: the windows only expose raw pointers; all mutation goes through
// volatile accesses by their users.
unsafe impl Send for TempPage {}
unsafe impl Send for MmioWindow {}

/// The memory manager of an identity-mapped type-1 VMM: every host-physical
/// address is reachable at the virtual address with the same bits, so all
/// mapping operations reduce to pointer casts and unmapping is a no-op.
pub struct IdentityMap;

/// The `IdentityMap` singleton handed to subsystems that need a
/// `&'static dyn HostMapper`.
pub static IDENTITY_MAP: IdentityMap = IdentityMap;

impl HostMapper for IdentityMap {
    fn phys_to_ptr(&self, hpa: Hpa) -> Option<NonNull<u8>> {
        NonNull::new(hpa.bits() as *mut u8)
    }

    fn map_page(&'static self, hpa: Hpa) -> Option<TempPage> {
        if !hpa.is_aligned_4k() {
            return None;
        }
        Some(TempPage {
            ptr: self.phys_to_ptr(hpa)?,
            mapper: self,
        })
    }

    fn map_uncached(&'static self, hpa: Hpa) -> Option<MmioWindow> {
        if !hpa.is_aligned_4k() {
            return None;
        }
        Some(MmioWindow {
            ptr: self.phys_to_ptr(hpa)?,
            hpa,
            mapper: self,
        })
    }

    fn remap_uncached(&self, _window: &MmioWindow, new_hpa: Hpa) -> Option<NonNull<u8>> {
        if !new_hpa.is_aligned_4k() {
            return None;
        }
        self.phys_to_ptr(new_hpa)
    }

    fn unmap(&self, _ptr: NonNull<u8>) {}
}
