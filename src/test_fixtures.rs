// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for the crate's tests: leaked registries, canned
//! domains, and a recording DMA remapper.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use drivers::vtd::DmaRemapper;
use hyp_pages::{DomainId, Gfn, Gpa, IDENTITY_MAP};
use spin::Mutex;

use crate::domain::{Domain, DomainTable};
use crate::hypercall::HypercallCtx;
use crate::vcpu::{Vcpu, VcpuKind};

/// Leaks a fresh registry so contexts can borrow it for `'static`.
pub(crate) fn new_domain_table() -> &'static DomainTable {
    Box::leak(Box::new(DomainTable::new(&IDENTITY_MAP)))
}

/// Creates and registers the root domain with the canned PV hole.
pub(crate) fn new_root(table: &'static DomainTable) -> Arc<Domain> {
    new_root_with_hole(table, 0xf0000, 0xf0100)
}

/// Creates and registers the root domain with a caller-chosen PV hole.
pub(crate) fn new_root_with_hole(
    table: &'static DomainTable,
    start_gfn: u64,
    end_gfn: u64,
) -> Arc<Domain> {
    let dom = Domain::new_root(table.mapper(), (Gfn::new(start_gfn), Gfn::new(end_gfn))).unwrap();
    table.set_root(dom.clone());
    dom
}

/// Creates and registers a guest domain.
pub(crate) fn add_guest(table: &'static DomainTable, id: u16) -> Arc<Domain> {
    let dom = Domain::new_guest(DomainId::new(id).unwrap(), table.mapper()).unwrap();
    table.insert(dom.clone()).unwrap();
    dom
}

fn ctx_with_kind(
    table: &'static DomainTable,
    dom: &Arc<Domain>,
    kind: VcpuKind,
) -> HypercallCtx<'static> {
    let vcpu = Vcpu::new(dom.nr_vcpus() as u32, dom, kind, None);
    dom.add_vcpu(vcpu.clone()).unwrap();
    HypercallCtx {
        domains: table,
        dom: dom.clone(),
        vcpu,
    }
}

/// Builds a hypercall context on a fresh guest vCPU of `dom`.
pub(crate) fn guest_ctx(table: &'static DomainTable, dom: &Arc<Domain>) -> HypercallCtx<'static> {
    ctx_with_kind(table, dom, VcpuKind::Guest)
}

/// Builds a hypercall context on a fresh root vCPU of `dom`.
pub(crate) fn root_ctx(table: &'static DomainTable, dom: &Arc<Domain>) -> HypercallCtx<'static> {
    ctx_with_kind(table, dom, VcpuKind::Root)
}

/// A `DmaRemapper` that records the flushes it is asked for.
pub(crate) struct FlushRecorder {
    psi: bool,
    domain_flushes: Mutex<usize>,
    page_flushes: Mutex<Vec<(u16, u64)>>,
}

impl FlushRecorder {
    /// Creates a recorder with the given PSI capability and binds it to
    /// `dom`.
    pub(crate) fn attach(dom: &Arc<Domain>, psi: bool) -> Arc<FlushRecorder> {
        let recorder = Arc::new(FlushRecorder {
            psi,
            domain_flushes: Mutex::new(0),
            page_flushes: Mutex::new(Vec::new()),
        });
        dom.add_iommu(recorder.clone());
        recorder
    }

    /// Returns how many domain-selective flushes were requested.
    pub(crate) fn domain_flushes(&self) -> usize {
        *self.domain_flushes.lock()
    }

    /// Returns the page-selective flushes requested, in order.
    pub(crate) fn page_flushes(&self) -> Vec<(u16, u64)> {
        self.page_flushes.lock().clone()
    }
}

impl DmaRemapper for FlushRecorder {
    fn psi_supported(&self) -> bool {
        self.psi
    }

    fn flush_iotlb_domain(&self, _dom: DomainId) {
        *self.domain_flushes.lock() += 1;
    }

    fn flush_iotlb_pages(&self, dom: DomainId, gpa: Gpa, _bytes: u64) {
        self.page_flushes.lock().push((dom.bits(), gpa.bits()));
    }
}
