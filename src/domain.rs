// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use arrayvec::ArrayVec;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use drivers::vtd::DmaRemapper;
use hyp_pages::{DomainId, Gfn, Gpa, HostMapper, Hpa, VmmPage};
use spin::{Mutex, Once};

use crate::ept::{GuestPhysMap, MemType, Perm, SoftEpt, TlbVersion};
use crate::evtchn::EventChannels;
use crate::gnttab::GrantTable;
use crate::hvm::HvmParams;
use crate::vcpu::{Vcpu, VcpuId};

/// Most vCPUs a single domain may hold.
pub const MAX_VCPUS: usize = 16;

/// Domain registry errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// A domain with this id already exists.
    IdInUse(DomainId),
    /// The id names an alias, not a real domain.
    ReservedId(DomainId),
    /// No such domain.
    NotFound(DomainId),
    /// The domain still has outstanding references or running vCPUs.
    DomainInUse(DomainId),
    /// Page allocation failed.
    OutOfMemory,
    /// The domain is at its vCPU limit.
    TooManyVcpus,
    /// A vCPU id is already in use.
    VcpuIdInUse(VcpuId),
    /// No such vCPU in this domain.
    VcpuNotFound(VcpuId),
    /// The vCPU must be stopped first.
    VcpuRunning(VcpuId),
    /// The nominal timer mode is not one the hardware emulation supports.
    InvalidTimerMode(u64),
    /// Second-level map mutation failed.
    Ept(crate::ept::Error),
}

/// Holds results for registry operations.
pub type Result<T> = core::result::Result<T, Error>;

impl From<crate::ept::Error> for Error {
    fn from(e: crate::ept::Error) -> Self {
        Error::Ept(e)
    }
}

/// How the domain came to exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DomainOrigin {
    /// Carved out of the root VM at bring-up.
    RootDerived,
    /// Spawned by the toolstack at run time.
    GuestSpawned,
}

/// An isolated guest: second-level map, vCPUs, grant table, HVM parameters,
/// and the set of DMA-remapping units bound to it.
pub struct Domain {
    id: DomainId,
    origin: DomainOrigin,
    mapper: &'static dyn HostMapper,
    destroying: AtomicBool,
    upcall_vector: AtomicU8,
    timer_mode: Mutex<Option<u64>>,
    vcpus: Mutex<ArrayVec<Arc<Vcpu>, MAX_VCPUS>>,
    ept: Mutex<SoftEpt>,
    hvm: HvmParams,
    gnttab: GrantTable,
    evtchn: EventChannels,
    iommus: Mutex<Vec<Arc<dyn DmaRemapper>>>,
    // Pages the VMM allocated to back guest frames (grant tables aside):
    // xenstore/console rings and ring-PFN parameter pages.
    backing: Mutex<Vec<VmmPage>>,
    // Identity mappings the root guest is allowed to establish over
    // VMM-provided pages.
    vmm_map_whitelist: Mutex<BTreeMap<u64, u64>>,
    // Guest-physical frame range the root reserves for hypervisor-
    // introduced PV pages.
    winpv_hole: Option<(Gfn, Gfn)>,
}

impl Domain {
    /// Creates an unprivileged guest domain.
    pub fn new_guest(id: DomainId, mapper: &'static dyn HostMapper) -> Result<Arc<Domain>> {
        Ok(Arc::new(Domain {
            id,
            origin: DomainOrigin::GuestSpawned,
            mapper,
            destroying: AtomicBool::new(false),
            upcall_vector: AtomicU8::new(0),
            timer_mode: Mutex::new(None),
            vcpus: Mutex::new(ArrayVec::new()),
            ept: Mutex::new(SoftEpt::new()),
            hvm: HvmParams::new(),
            gnttab: GrantTable::new_guest().ok_or(Error::OutOfMemory)?,
            evtchn: EventChannels::new(),
            iommus: Mutex::new(Vec::new()),
            backing: Mutex::new(Vec::new()),
            vmm_map_whitelist: Mutex::new(BTreeMap::new()),
            winpv_hole: None,
        }))
    }

    /// Creates the privileged root domain. `winpv_hole` is the inclusive-
    /// exclusive guest-frame range reserved for PV pages. The xenstore and
    /// console channels are brought up as part of construction.
    pub fn new_root(
        mapper: &'static dyn HostMapper,
        winpv_hole: (Gfn, Gfn),
    ) -> Result<Arc<Domain>> {
        let dom = Arc::new(Domain {
            id: DomainId::ROOTVM,
            origin: DomainOrigin::RootDerived,
            mapper,
            destroying: AtomicBool::new(false),
            upcall_vector: AtomicU8::new(0),
            timer_mode: Mutex::new(None),
            vcpus: Mutex::new(ArrayVec::new()),
            ept: Mutex::new(SoftEpt::new()),
            hvm: HvmParams::new(),
            gnttab: GrantTable::new_root(),
            evtchn: EventChannels::new(),
            iommus: Mutex::new(Vec::new()),
            backing: Mutex::new(Vec::new()),
            vmm_map_whitelist: Mutex::new(BTreeMap::new()),
            winpv_hole: Some(winpv_hole),
        });
        crate::hvm::init_root_pv_params(&dom)?;
        Ok(dom)
    }

    /// Returns the domain's id.
    pub fn id(&self) -> DomainId {
        self.id
    }

    /// Returns how the domain came to exist.
    pub fn origin(&self) -> DomainOrigin {
        self.origin
    }

    /// Returns whether this is the privileged root domain.
    pub fn is_root(&self) -> bool {
        self.id == DomainId::ROOTVM
    }

    /// Returns the VMM memory manager this domain was created against.
    pub fn mapper(&self) -> &'static dyn HostMapper {
        self.mapper
    }

    /// Returns the domain's grant table.
    pub fn gnttab(&self) -> &GrantTable {
        &self.gnttab
    }

    /// Returns the domain's HVM parameter store.
    pub fn hvm(&self) -> &HvmParams {
        &self.hvm
    }

    /// Returns the domain's event channel allocator.
    pub fn evtchn(&self) -> &EventChannels {
        &self.evtchn
    }

    /// Returns the domain's second-level map.
    pub fn ept(&self) -> &Mutex<SoftEpt> {
        &self.ept
    }

    /// Translates a guest-physical address through the domain's second-level
    /// map.
    pub fn translate_gpa(&self, gpa: Gpa) -> Option<Hpa> {
        self.ept.lock().translate(gpa)
    }

    /// Records an invalidation of the domain's cached translations.
    pub fn invalidate_ept(&self) -> TlbVersion {
        self.ept.lock().invalidate()
    }

    /// Binds a DMA-remapping unit to this domain.
    pub fn add_iommu(&self, iommu: Arc<dyn DmaRemapper>) {
        self.iommus.lock().push(iommu);
    }

    /// Returns the DMA-remapping units bound to this domain.
    pub fn iommus(&self) -> Vec<Arc<dyn DmaRemapper>> {
        self.iommus.lock().clone()
    }

    /// Returns the domain-wide event upcall vector, 0 if unset.
    pub fn upcall_vector(&self) -> u8 {
        self.upcall_vector.load(Ordering::Relaxed)
    }

    /// Sets the domain-wide event upcall vector.
    pub fn set_upcall_vector(&self, vector: u8) {
        self.upcall_vector.store(vector, Ordering::Relaxed);
    }

    /// Sets the nominal timer mode.
    pub fn set_timer_mode(&self, mode: u64) -> Result<()> {
        if mode > 3 {
            return Err(Error::InvalidTimerMode(mode));
        }
        *self.timer_mode.lock() = Some(mode);
        Ok(())
    }

    /// Returns the nominal timer mode, if the toolstack has set one.
    pub fn timer_mode(&self) -> Option<u64> {
        *self.timer_mode.lock()
    }

    /// Returns whether `gfn` falls in the root's PV hole.
    pub fn gfn_in_winpv_hole(&self, gfn: Gfn) -> bool {
        match self.winpv_hole {
            Some((start, end)) => gfn >= start && gfn < end,
            None => false,
        }
    }

    /// Maps the VMM-owned `page` at `gfn` and takes ownership of it for the
    /// domain's lifetime.
    pub fn add_vmm_backed_page(
        &self,
        gfn: Gfn,
        perm: Perm,
        mtype: MemType,
        page: VmmPage,
    ) -> Result<()> {
        self.ept.lock().map_4k(gfn, page.hpa(), perm, mtype)?;
        self.backing.lock().push(page);
        Ok(())
    }

    /// Allocates a fresh page of guest RAM and maps it RW write-back at
    /// `gfn`.
    pub fn add_guest_ram_page(&self, gfn: Gfn) -> Result<()> {
        let page = VmmPage::new_zeroed().ok_or(Error::OutOfMemory)?;
        self.add_vmm_backed_page(gfn, Perm::ReadWrite, MemType::WriteBack, page)
    }

    /// Whitelists an identity mapping the root may establish at `gpa`.
    pub fn whitelist_vmm_map(&self, gpa: Gpa) {
        self.vmm_map_whitelist
            .lock()
            .entry(gpa.bits())
            .or_insert(gpa.bits());
    }

    /// Returns whether `gpa` is whitelisted for a root identity mapping.
    pub fn vmm_map_whitelisted(&self, gpa: Gpa) -> bool {
        self.vmm_map_whitelist.lock().contains_key(&gpa.bits())
    }

    /// Adds `vcpu` to the domain.
    pub fn add_vcpu(&self, vcpu: Arc<Vcpu>) -> Result<()> {
        let mut vcpus = self.vcpus.lock();
        if vcpus.iter().any(|v| v.id() == vcpu.id()) {
            return Err(Error::VcpuIdInUse(vcpu.id()));
        }
        vcpus.try_push(vcpu).map_err(|_| Error::TooManyVcpus)
    }

    /// Returns the vCPU with id `id`.
    pub fn get_vcpu(&self, id: VcpuId) -> Option<Arc<Vcpu>> {
        self.vcpus.lock().iter().find(|v| v.id() == id).cloned()
    }

    /// Removes the stopped vCPU with id `id` from the domain.
    pub fn remove_vcpu(&self, id: VcpuId) -> Result<()> {
        let mut vcpus = self.vcpus.lock();
        let idx = vcpus
            .iter()
            .position(|v| v.id() == id)
            .ok_or(Error::VcpuNotFound(id))?;
        if vcpus[idx].is_running() {
            return Err(Error::VcpuRunning(id));
        }
        vcpus.remove(idx);
        Ok(())
    }

    /// Returns the number of vCPUs bound to the domain.
    pub fn nr_vcpus(&self) -> usize {
        self.vcpus.lock().len()
    }

    /// Calls `f` for each vCPU of the domain.
    pub fn for_each_vcpu(&self, mut f: impl FnMut(&Arc<Vcpu>)) {
        for vcpu in self.vcpus.lock().iter() {
            f(vcpu);
        }
    }

    /// Returns whether any vCPU of the domain is executing guest code.
    pub fn any_vcpu_running(&self) -> bool {
        self.vcpus.lock().iter().any(|v| v.is_running())
    }

    /// Returns whether destruction has been requested.
    pub fn is_destroying(&self) -> bool {
        self.destroying.load(Ordering::Acquire)
    }

    fn set_destroying(&self) {
        self.destroying.store(true, Ordering::Release);
    }
}

/// A borrowed reference to a registered domain. Holding one keeps the
/// domain alive; the release happens on drop, so every hypercall exit path
/// puts its reference back.
pub struct DomainRef(Arc<Domain>);

impl DomainRef {
    pub(crate) fn from_arc(dom: Arc<Domain>) -> Self {
        Self(dom)
    }

    /// Clones the underlying shared handle.
    pub fn arc(&self) -> Arc<Domain> {
        self.0.clone()
    }
}

impl Deref for DomainRef {
    type Target = Domain;

    fn deref(&self) -> &Domain {
        &self.0
    }
}

/// The process-wide registry of domains.
pub struct DomainTable {
    mapper: &'static dyn HostMapper,
    domains: Mutex<Vec<Arc<Domain>>>,
    root: Once<Arc<Domain>>,
}

impl DomainTable {
    /// Creates an empty registry using `mapper` for VMM mappings.
    pub const fn new(mapper: &'static dyn HostMapper) -> Self {
        Self {
            mapper,
            domains: Mutex::new(Vec::new()),
            root: Once::new(),
        }
    }

    /// Returns the VMM memory manager the registry hands to new domains.
    pub fn mapper(&self) -> &'static dyn HostMapper {
        self.mapper
    }

    /// Registers the root domain. Called once at bring-up.
    pub fn set_root(&self, dom: Arc<Domain>) {
        self.root.call_once(|| dom.clone());
        self.domains.lock().push(dom);
    }

    /// Returns the root domain, if bring-up has registered it.
    pub fn root(&self) -> Option<Arc<Domain>> {
        self.root.get().cloned()
    }

    /// Registers a new guest domain.
    pub fn insert(&self, dom: Arc<Domain>) -> Result<()> {
        if dom.id().is_alias() {
            return Err(Error::ReservedId(dom.id()));
        }
        let mut domains = self.domains.lock();
        if domains.iter().any(|d| d.id() == dom.id()) {
            return Err(Error::IdInUse(dom.id()));
        }
        domains.push(dom);
        Ok(())
    }

    /// Takes a reference to the domain with id `id`. Domains with a pending
    /// destruction are no longer visible.
    pub fn get(&self, id: DomainId) -> Option<DomainRef> {
        let domains = self.domains.lock();
        domains
            .iter()
            .find(|d| d.id() == id && !d.is_destroying())
            .cloned()
            .map(DomainRef::from_arc)
    }

    /// Requests destruction of the domain with id `id`. The domain
    /// disappears from lookups immediately; the backing state is freed once
    /// the last outstanding reference drops and no vCPU is running.
    pub fn destroy(&self, id: DomainId) -> Result<()> {
        {
            let domains = self.domains.lock();
            let dom = domains
                .iter()
                .find(|d| d.id() == id)
                .ok_or(Error::NotFound(id))?;
            dom.set_destroying();
        }
        self.reap();
        Ok(())
    }

    /// Frees domains whose destruction was requested and which are now
    /// quiescent. Returns how many were freed.
    pub fn reap(&self) -> usize {
        let mut domains = self.domains.lock();
        let before = domains.len();
        // A quiescent domain's only strong reference is the registry's own,
        // which is sound to test while the table lock is held.
        domains.retain(|d| {
            !(d.is_destroying() && Arc::strong_count(d) == 1 && !d.any_vcpu_running())
        });
        before - domains.len()
    }

    /// Returns the number of registered domains, destruction-pending ones
    /// included.
    pub fn len(&self) -> usize {
        self.domains.lock().len()
    }

    /// Returns whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.domains.lock().is_empty()
    }
}

/// Resolves a wire domain id as seen from `curr`'s hypercall context:
/// `SELF` and the caller's own id short-circuit to the current domain,
/// `ROOTVM` to the root domain, anything else goes through the registry.
pub fn get_dom(table: &DomainTable, curr: &Arc<Domain>, wire: u16) -> Option<DomainRef> {
    if wire == DomainId::SELF_ALIAS.bits() || wire == curr.id().bits() {
        return Some(DomainRef::from_arc(curr.clone()));
    }
    if wire == DomainId::ROOTVM.bits() {
        return table.root().map(DomainRef::from_arc);
    }
    let id = DomainId::new(wire)?;
    table.get(id)
}
