// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # Tessera
//!
//! Core subsystems of a thin type-1 hypervisor hosting paravirtualized
//! guests on Intel VT-x: the inter-domain grant table, the domain and vCPU
//! registry, the HVM parameter store, and the hypercall surface that a PV
//! toolstack running in the privileged root guest drives.
//!
//! The bootstrap/loader, the VMCS exit dispatcher, and the physical-page
//! allocators are external collaborators; they link this crate, register a
//! console sink, populate the [`domain::DomainTable`], and route hypercall
//! exits into [`hypercall`].
#![no_std]

extern crate alloc;

// For testing use the std crate.
#[cfg(test)]
#[macro_use]
extern crate std;

/// Bring-up of the VT-d DMA-remapping units.
pub mod dma;
/// Domain registry and scoped domain references.
pub mod domain;
/// The hypervisor-side view of a domain's extended page tables.
pub mod ept;
/// Inter-domain event channel ports.
pub mod evtchn;
/// The grant table: inter-domain memory sharing.
pub mod gnttab;
/// Per-domain HVM parameters.
pub mod hvm;
/// Hypercall opcodes and entry points.
pub mod hypercall;
/// The VMM lifecycle state machine.
pub mod state;
/// vCPUs and the VM-exit trace ring.
pub mod vcpu;

#[cfg(test)]
pub(crate) mod test_fixtures;
