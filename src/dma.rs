// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Bring-up of the VT-d DMA-remapping units.
//!
//! Runs once the root domain is registered: every DRHD in the ACPI DMAR
//! gets a `VtdUnit`, its register window is pulled out of the root's
//! second-level map so the root guest cannot reach the hardware, the unit
//! is quiesced and pointed at a fresh root table, and the root domain's
//! devices are bound before translation is enabled.

use alloc::sync::Arc;
use alloc::vec::Vec;
use hyp_console::println;
use hyp_pages::Hpa;

use drivers::vtd::{parse_dmar, Bdf, DmaRemapper, ParseError, VtdError, VtdUnit};

use crate::domain::{Domain, DomainTable};
use crate::ept::GuestPhysMap;

/// Errors from DMA-remapping bring-up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The root domain is not registered yet.
    NoRootDomain,
    /// The DMAR table did not parse.
    Dmar(ParseError),
    /// A unit failed to initialize.
    Unit(u32, VtdError),
}

/// Holds results for DMA-remapping bring-up.
pub type Result<T> = core::result::Result<T, Error>;

fn bring_up_unit(
    root: &Arc<Domain>,
    unit: &VtdUnit,
    root_slpt: Hpa,
    all_devices: &[Bdf],
) -> core::result::Result<(), VtdError> {
    // The register window must not stay reachable from the root guest.
    let reg_frame = unit.register_base().frame();
    let mut ept = root.ept().lock();
    if ept.unmap(hyp_pages::Gfn::new(reg_frame.bits())).is_ok() {
        ept.invalidate();
    }
    drop(ept);

    unit.reset_for_programming()?;
    unit.bind_domain(root.id(), root_slpt, all_devices)?;
    unit.enable_dma_remapping()
}

/// Initializes every DMA-remapping unit described by the raw DMAR bytes,
/// binds the root domain's devices to `root_slpt` (the hardware root of the
/// root domain's second-level table), and attaches the units to the root
/// domain for grant-table invalidation.
pub fn init_dma_remapping(
    table: &DomainTable,
    dmar: &[u8],
    all_devices: &[Bdf],
    root_slpt: Hpa,
) -> Result<Vec<Arc<VtdUnit>>> {
    let root = table.root().ok_or(Error::NoRootDomain)?;
    let drhds = parse_dmar(dmar).map_err(Error::Dmar)?;

    let mut units = Vec::new();
    for (i, drhd) in drhds.iter().enumerate() {
        let id = i as u32;
        let unit = VtdUnit::new(id, drhd, table.mapper()).map_err(|e| Error::Unit(id, e))?;
        bring_up_unit(&root, &unit, root_slpt, all_devices).map_err(|e| Error::Unit(id, e))?;

        println!(
            "vtd{}: base 0x{:x} domains {} psi {} catch-all {}",
            id,
            unit.register_base().bits(),
            unit.nr_domains(),
            unit.psi_supported(),
            unit.has_catchall_scope()
        );
        let unit = Arc::new(unit);
        root.add_iommu(unit.clone());
        units.push(unit);
    }
    Ok(units)
}
