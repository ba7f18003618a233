// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Ordering and cache-maintenance instructions.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use core::arch::asm;

/// Orders preceding memory stores with respect to succeeding stores.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn wmb() {
    // Safety: `sfence` does not access memory; it only orders surrounding
    // stores.
    unsafe { asm!("sfence") };
}

/// Hint that the CPU is in a spin-wait loop.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn pause() {
    unsafe { asm!("pause") };
}

/// Flushes the cache line containing `addr` from every level of the cache
/// hierarchy. Needed before handing table memory to agents that do not snoop
/// the caches (e.g. a non-coherent IOMMU page walk).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn clflush(addr: *const u8) {
    // Safety: `clflush` performs no data access; `addr` need only be
    // canonical, which any pointer into VMM memory is.
    unsafe { asm!("clflush [{0}]", in(reg) addr) };
}

/// Flushes each cache line in the `len`-byte range starting at `addr`.
pub fn clflush_range(addr: *const u8, len: usize) {
    const LINE: usize = 64;
    let start = addr as usize & !(LINE - 1);
    let end = addr as usize + len;
    let mut line = start;
    while line < end {
        clflush(line as *const u8);
        line += LINE;
    }
    wmb();
}

// Make the instruction wrappers no-ops for testing.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn wmb() {
    core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
}
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn pause() {
    core::hint::spin_loop();
}
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn clflush(_addr: *const u8) {}
