// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Per-domain HVM parameters: a vector of opaque 64-bit values with a small
//! typed schema layered on top, plus the root domain's xenstore/console
//! bring-up that seeds them.

use alloc::sync::Arc;
use hyp_console::println;
use hyp_pages::{DomainId, Gfn, VmmPage};
use spin::Mutex;

use crate::domain::Domain;
use crate::ept::{MemType, Perm};

/// Number of parameter slots a domain carries.
pub const NR_PARAMS: usize = 64;

pub const HVM_PARAM_CALLBACK_IRQ: u32 = 0;
pub const HVM_PARAM_STORE_PFN: u32 = 1;
pub const HVM_PARAM_STORE_EVTCHN: u32 = 2;
pub const HVM_PARAM_PAE_ENABLED: u32 = 4;
pub const HVM_PARAM_IOREQ_PFN: u32 = 5;
pub const HVM_PARAM_BUFIOREQ_PFN: u32 = 6;
pub const HVM_PARAM_TIMER_MODE: u32 = 10;
pub const HVM_PARAM_IDENT_PT: u32 = 12;
pub const HVM_PARAM_CONSOLE_PFN: u32 = 17;
pub const HVM_PARAM_CONSOLE_EVTCHN: u32 = 18;
pub const HVM_PARAM_NESTEDHVM: u32 = 24;
pub const HVM_PARAM_PAGING_RING_PFN: u32 = 27;
pub const HVM_PARAM_MONITOR_RING_PFN: u32 = 28;
pub const HVM_PARAM_SHARING_RING_PFN: u32 = 29;
pub const HVM_PARAM_ALTP2M: u32 = 35;

// CALLBACK_IRQ encodes a delivery type in the top byte; only the
// fixed-vector type is virtualized.
const CALLBACK_TYPE_SHIFT: u64 = 56;
const CALLBACK_TYPE_VECTOR: u8 = 2;

/// Errors from HVM parameter operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The index is past the parameter vector.
    IndexOutOfRange(u32),
    /// The index is in range but not one this hypervisor understands.
    UnknownParam(u32),
    /// The value is not acceptable for the parameter.
    BadValue,
    /// CALLBACK_IRQ requested a delivery type other than a fixed vector.
    UnsupportedCallbackType(u8),
    /// The caller may not read this parameter.
    NotPermitted(u32),
}

/// Holds results for HVM parameter operations.
pub type Result<T> = core::result::Result<T, Error>;

/// The per-domain parameter vector.
pub struct HvmParams {
    params: Mutex<[u64; NR_PARAMS]>,
}

impl HvmParams {
    /// Creates a zeroed parameter vector.
    pub fn new() -> Self {
        Self {
            params: Mutex::new([0; NR_PARAMS]),
        }
    }

    /// Returns the raw value of `index`, which must be in range.
    pub fn get(&self, index: u32) -> u64 {
        assert!((index as usize) < NR_PARAMS);
        self.params.lock()[index as usize]
    }

    /// Stores `value` at `index` without schema checks. Bring-up and the
    /// post-validation path of `set_param` use this.
    pub fn set_raw(&self, index: u32, value: u64) {
        assert!((index as usize) < NR_PARAMS);
        self.params.lock()[index as usize] = value;
    }
}

impl Default for HvmParams {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies a toolstack or guest `set_param` to `dom`, enforcing the typed
/// schema before recording the raw value.
pub fn set_param(dom: &Domain, index: u32, value: u64) -> Result<()> {
    if index as usize >= NR_PARAMS {
        return Err(Error::IndexOutOfRange(index));
    }
    match index {
        HVM_PARAM_CALLBACK_IRQ => {
            let cb_type = (value >> CALLBACK_TYPE_SHIFT) as u8;
            if cb_type != 0 && cb_type != CALLBACK_TYPE_VECTOR {
                return Err(Error::UnsupportedCallbackType(cb_type));
            }
            let vector = (value & 0xff) as u8;
            dom.set_upcall_vector(vector);
            // Seed each vCPU that hasn't chosen its own vector, so event
            // delivery can consult the vCPU uniformly.
            dom.for_each_vcpu(|vcpu| {
                if vcpu.upcall_vector() == 0 {
                    vcpu.set_upcall_vector(vector);
                }
            });
        }
        HVM_PARAM_TIMER_MODE => {
            dom.set_timer_mode(value).map_err(|_| Error::BadValue)?;
        }
        HVM_PARAM_NESTEDHVM | HVM_PARAM_ALTP2M => {
            if value != 0 {
                return Err(Error::BadValue);
            }
        }
        HVM_PARAM_PAE_ENABLED | HVM_PARAM_IDENT_PT => {}
        HVM_PARAM_STORE_PFN
        | HVM_PARAM_IOREQ_PFN
        | HVM_PARAM_BUFIOREQ_PFN
        | HVM_PARAM_CONSOLE_PFN
        | HVM_PARAM_PAGING_RING_PFN
        | HVM_PARAM_MONITOR_RING_PFN
        | HVM_PARAM_SHARING_RING_PFN => {
            // Ring frames are given 4kB RW write-back backing. A frame the
            // guest already populated keeps its mapping.
            if let Err(e) = dom.add_guest_ram_page(Gfn::new(value)) {
                println!(
                    "hvm: dom 0x{:x} param {} page at gfn 0x{:x} not added: {:?}",
                    dom.id().bits(),
                    index,
                    value,
                    e
                );
            }
        }
        HVM_PARAM_STORE_EVTCHN | HVM_PARAM_CONSOLE_EVTCHN => {}
        _ => return Err(Error::UnknownParam(index)),
    }
    dom.hvm().set_raw(index, value);
    Ok(())
}

/// Reads a parameter on behalf of one of `dom`'s own (guest) vCPUs.
pub fn get_param_guest(dom: &Domain, index: u32) -> Result<u64> {
    if index as usize >= NR_PARAMS {
        return Err(Error::IndexOutOfRange(index));
    }
    match index {
        HVM_PARAM_STORE_PFN
        | HVM_PARAM_CONSOLE_PFN
        | HVM_PARAM_PAE_ENABLED
        | HVM_PARAM_NESTEDHVM
        | HVM_PARAM_STORE_EVTCHN
        | HVM_PARAM_CONSOLE_EVTCHN => Ok(dom.hvm().get(index)),
        _ => Err(Error::NotPermitted(index)),
    }
}

/// Reads a parameter on behalf of a root vCPU. The root only consults the
/// channel ports of its own PV pages.
pub fn get_param_root(dom: &Domain, index: u32) -> Result<u64> {
    if index as usize >= NR_PARAMS {
        return Err(Error::IndexOutOfRange(index));
    }
    match index {
        HVM_PARAM_STORE_EVTCHN | HVM_PARAM_CONSOLE_EVTCHN => Ok(dom.hvm().get(index)),
        _ => Err(Error::NotPermitted(index)),
    }
}

// Allocates one PV channel page for the root domain, wires an unbound event
// channel to dom0 for it, and exposes it identity-mapped.
//
// Both the store and console pages are accessed from the root guest and
// from dom0; the root's EPT is identity mapped, so mapping the page at the
// guest frame equal to its host frame makes it visible with no further
// work. Dom0 maps it later through the reserved grant references.
fn init_root_channel_page(
    dom: &Arc<Domain>,
    pfn_param: u32,
    evtchn_param: u32,
    what: &str,
) -> crate::domain::Result<()> {
    let page = VmmPage::new_zeroed().ok_or(crate::domain::Error::OutOfMemory)?;
    let dom0 = DomainId::new(0).unwrap();
    let port = match dom.evtchn().alloc_unbound(dom0) {
        Ok(port) => port,
        Err(e) => {
            println!("winpv: failed to alloc {} port: {:?}", what, e);
            return Ok(());
        }
    };

    let gfn = Gfn::new(page.hfn().bits());
    println!("winpv: {} pfn=0x{:x}, evtchn={}", what, gfn.bits(), port.bits());

    dom.hvm().set_raw(pfn_param, gfn.bits());
    dom.hvm().set_raw(evtchn_param, port.bits() as u64);

    let gpa = gfn.addr();
    dom.add_vmm_backed_page(gfn, Perm::ReadWrite, MemType::WriteBack, page)?;
    dom.whitelist_vmm_map(gpa);
    Ok(())
}

/// Brings up the root domain's xenstore and console parameters. Called from
/// root-domain construction.
pub(crate) fn init_root_pv_params(dom: &Arc<Domain>) -> crate::domain::Result<()> {
    init_root_channel_page(dom, HVM_PARAM_STORE_PFN, HVM_PARAM_STORE_EVTCHN, "xenstore")?;
    init_root_channel_page(
        dom,
        HVM_PARAM_CONSOLE_PFN,
        HVM_PARAM_CONSOLE_EVTCHN,
        "console",
    )
}
