// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! The grant table: inter-domain memory sharing.
//!
//! Each domain owns a table of grant entries living in pages shared with
//! that guest. A granter writes an entry naming a grantee domain and a
//! frame; the grantee maps the frame into its own guest-physical space with
//! `map_grant_ref`, copies through it with `copy`, and releases it with
//! `unmap_grant_ref`.
//!
//! The shared entries are concurrently mutated by the granting guest, which
//! may legitimately flip the read-only bit or revoke access at any time.
//! All header accesses therefore go through an atomic 32-bit cell and
//! pinning is a bounded compare-exchange loop; collisions beyond the bound
//! are treated as adversarial and surfaced as an error.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use alloc::collections::BTreeMap;
use arrayvec::ArrayVec;
use hyp_console::println;
use hyp_pages::{DomainId, Gfn, Gpa, Hfn, HostMapper, Hpa, TempPage, VmmPage, PAGE_SIZE_4K};
use spin::Mutex;
use static_assertions::const_assert;
use x86_regs::wmb;

use crate::domain::{get_dom, Domain, DomainRef};
use drivers::vtd::DmaRemapper;
use crate::ept::{GuestPhysMap, MemType, Perm};
use crate::hvm::{HVM_PARAM_CONSOLE_PFN, HVM_PARAM_STORE_PFN};
use crate::hypercall::HypercallCtx;
use crate::vcpu::VcpuKind;

/// Compile-time bound on shared-table pages per domain.
pub const MAX_SHARED_PAGES: usize = 64;
/// Bound on status pages, derived from the v2 entry density.
pub const MAX_STATUS_PAGES: usize = MAX_SHARED_PAGES * V2_GTES_PER_PAGE / STATUS_GTES_PER_PAGE;

/// v1 grant entries per shared page.
pub const V1_GTES_PER_PAGE: usize = 512;
/// v2 grant entries per shared page.
pub const V2_GTES_PER_PAGE: usize = 256;
/// Status words per status page.
pub const STATUS_GTES_PER_PAGE: usize = 2048;

const V1_GTE_SIZE: usize = 8;
const_assert!(V1_GTES_PER_PAGE * V1_GTE_SIZE == PAGE_SIZE_4K as usize);
const_assert!(STATUS_GTES_PER_PAGE * 2 == PAGE_SIZE_4K as usize);

// Grant entry flag word. The low two bits are the entry type; only
// permit-access entries can be mapped.
pub const GTF_INVALID: u16 = 0;
pub const GTF_PERMIT_ACCESS: u16 = 1;
pub const GTF_ACCEPT_TRANSFER: u16 = 2;
pub const GTF_TYPE_MASK: u16 = 3;
pub const GTF_READONLY: u16 = 1 << 2;
pub const GTF_READING: u16 = 1 << 3;
pub const GTF_WRITING: u16 = 1 << 4;
pub const GTF_PWT: u16 = 1 << 5;
pub const GTF_PCD: u16 = 1 << 6;
pub const GTF_PAT: u16 = 1 << 7;
pub const GTF_SUB_PAGE: u16 = 1 << 8;

// Map-request flags.
pub const GNTMAP_DEVICE_MAP: u32 = 1 << 0;
pub const GNTMAP_HOST_MAP: u32 = 1 << 1;
pub const GNTMAP_READONLY: u32 = 1 << 2;

// Copy-request flags.
pub const GNTCOPY_SOURCE_GREF: u16 = 1 << 0;
pub const GNTCOPY_DEST_GREF: u16 = 1 << 1;

/// Grant reference reserved for the xenstore ring.
pub const GNTTAB_RESERVED_XENSTORE: u32 = 0;
/// Grant reference reserved for the console ring.
pub const GNTTAB_RESERVED_CONSOLE: u32 = 1;

/// `AddToPhysmap.idx` flag selecting the status table.
pub const MAPIDX_GRANT_TABLE_STATUS: u64 = 1 << 31;

const PIN_RETRIES: usize = 4;

/// Wire status of a grant operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i16)]
pub enum GrantStatus {
    Okay = 0,
    GeneralError = -1,
    BadDomain = -2,
    BadGntref = -3,
    BadHandle = -4,
    BadVirtAddr = -5,
    BadDevAddr = -6,
    NoDeviceSpace = -7,
    PermissionDenied = -8,
    BadPage = -9,
    BadCopyArg = -10,
}

impl GrantStatus {
    /// Returns the wire encoding.
    pub fn bits(self) -> i16 {
        self as i16
    }
}

type GrantResult<T> = core::result::Result<T, GrantStatus>;

/// `GNTTABOP_map_grant_ref` argument layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct MapGrantRef {
    pub host_addr: u64,
    pub flags: u32,
    pub gref: u32,
    pub dom: u16,
    pub status: i16,
    pub handle: u32,
    pub dev_bus_addr: u64,
}

/// `GNTTABOP_unmap_grant_ref` argument layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct UnmapGrantRef {
    pub host_addr: u64,
    pub dev_bus_addr: u64,
    pub handle: u32,
    pub status: i16,
}

/// One side of a `GNTTABOP_copy`: either a grant reference or (for the
/// caller's own domain) a raw guest frame, overlaid in `u` as on the wire.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CopyPtr {
    pub u: u64,
    pub domid: u16,
    pub offset: u16,
}

impl CopyPtr {
    fn gref(&self) -> u32 {
        self.u as u32
    }

    fn gfn(&self) -> Gfn {
        Gfn::new(self.u)
    }
}

/// `GNTTABOP_copy` argument layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GnttabCopy {
    pub source: CopyPtr,
    pub dest: CopyPtr,
    pub len: u16,
    pub flags: u16,
    pub status: i16,
}

/// `GNTTABOP_query_size` argument layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GnttabQuerySize {
    pub dom: u16,
    pub nr_frames: u32,
    pub max_nr_frames: u32,
    pub status: i16,
}

/// `GNTTABOP_set_version` argument layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GnttabSetVersion {
    pub version: u32,
}

/// `XENMEM_add_to_physmap` argument layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct AddToPhysmap {
    pub domid: u16,
    pub size: u16,
    pub space: u32,
    pub idx: u64,
    pub gpfn: u64,
}

const_assert!(core::mem::size_of::<MapGrantRef>() == 32);
const_assert!(core::mem::size_of::<UnmapGrantRef>() == 24);
const_assert!(core::mem::size_of::<GnttabCopy>() == 40);

// The entry header is one naturally-aligned 32-bit word: flags in the low
// half, the grantee domain in the high half, matching the little-endian v1
// layout {u16 flags; u16 domid}.
fn hdr_flags(hdr: u32) -> u16 {
    hdr as u16
}

fn hdr_domid(hdr: u32) -> u16 {
    (hdr >> 16) as u16
}

fn make_hdr(flags: u16, domid: u16) -> u32 {
    flags as u32 | ((domid as u32) << 16)
}

/// Only permit-access entries without any of the unsupported attribute bits
/// can be mapped.
fn mappable_gtf(gtf: u16) -> bool {
    if gtf & GTF_TYPE_MASK != GTF_PERMIT_ACCESS {
        return false;
    }
    gtf & (GTF_PWT | GTF_PCD | GTF_PAT | GTF_SUB_PAGE) == 0
}

fn supported_map_flags(gntmap: u32) -> bool {
    gntmap == GNTMAP_HOST_MAP || gntmap == (GNTMAP_HOST_MAP | GNTMAP_READONLY)
}

fn already_mapped(gtf: u16) -> bool {
    gtf & (GTF_READING | GTF_WRITING) != 0
}

fn has_read_access(domid: DomainId, hdr: u32) -> bool {
    hdr_domid(hdr) == domid.bits() && hdr_flags(hdr) & GTF_PERMIT_ACCESS != 0
}

fn has_write_access(domid: DomainId, hdr: u32) -> bool {
    let flags = hdr_flags(hdr);
    hdr_domid(hdr) == domid.bits()
        && flags & GTF_PERMIT_ACCESS != 0
        && flags & GTF_READONLY == 0
}

// Ceiling helpers relating shared pages to status pages for a given table
// version.
fn shared_to_status_pages(version: u32, shr_pages: u32) -> u32 {
    let per_page = if version == 1 {
        V1_GTES_PER_PAGE
    } else {
        V2_GTES_PER_PAGE
    } as u32;
    let entries = shr_pages * per_page;
    let rem = entries & (STATUS_GTES_PER_PAGE as u32 - 1);
    (entries / STATUS_GTES_PER_PAGE as u32) + (if rem != 0 { 1 } else { 0 })
}

fn status_to_shared_pages(version: u32, sts_pages: u32) -> u32 {
    let per_page = if version == 1 {
        V1_GTES_PER_PAGE
    } else {
        V2_GTES_PER_PAGE
    } as u32;
    let entries = sts_pages * STATUS_GTES_PER_PAGE as u32;
    let rem = entries & (per_page - 1);
    (entries / per_page) + (if rem != 0 { 1 } else { 0 })
}

// How a shared-table page is backed: allocated by the VMM (unprivileged
// domains), or provided by the root guest out of its own memory.
enum SharedBacking {
    Vmm(VmmPage),
    Guest,
}

struct SharedPage {
    ptr: NonNull<u8>,
    _backing: SharedBacking,
}

struct GrantTableInner {
    shared: ArrayVec<SharedPage, MAX_SHARED_PAGES>,
    status: ArrayVec<VmmPage, MAX_STATUS_PAGES>,
    // handle -> local guest-physical address of the mapping. A handle is
    // present iff the corresponding foreign frame is mapped in this
    // domain's second-level map.
    map_handles: BTreeMap<u32, u64>,
}

/// A domain's grant table.
pub struct GrantTable {
    version: AtomicU32,
    inner: Mutex<GrantTableInner>,
}

impl GrantTable {
    /// Creates the table of an unprivileged domain with its first shared
    /// page in place.
    pub fn new_guest() -> Option<Self> {
        let table = Self {
            version: AtomicU32::new(1),
            inner: Mutex::new(GrantTableInner {
                shared: ArrayVec::new(),
                status: ArrayVec::new(),
                map_handles: BTreeMap::new(),
            }),
        };
        table.grow(1).ok()?;
        Some(table)
    }

    /// Creates the root domain's table. Its shared pages arrive from the
    /// root guest through `mapspace_grant_table`, so the table starts with
    /// none.
    pub fn new_root() -> Self {
        Self {
            version: AtomicU32::new(1),
            inner: Mutex::new(GrantTableInner {
                shared: ArrayVec::new(),
                status: ArrayVec::new(),
                map_handles: BTreeMap::new(),
            }),
        }
    }

    /// Returns the table version (1; version 2 is not implemented).
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Relaxed)
    }

    fn gtes_per_page(&self) -> usize {
        if self.version() == 1 {
            V1_GTES_PER_PAGE
        } else {
            V2_GTES_PER_PAGE
        }
    }

    /// Returns the number of shared pages currently in place.
    pub fn nr_shared_pages(&self) -> usize {
        self.inner.lock().shared.len()
    }

    /// Returns the number of status pages currently in place (version 2
    /// tables only; always zero on v1).
    pub fn nr_status_pages(&self) -> usize {
        self.inner.lock().status.len()
    }

    /// Returns true if `gref` is outside the populated shared table.
    pub fn invalid_ref(&self, gref: u32) -> bool {
        gref as usize >= self.nr_shared_pages() * self.gtes_per_page()
    }

    // Returns the atomic header cell of `gref`'s entry.
    //
    // The returned pointer stays valid for the table's lifetime: shared
    // pages are owned by the table and growth is monotonic, so a page is
    // never freed or moved while the domain exists.
    fn shared_header(&self, gref: u32) -> Option<NonNull<AtomicU32>> {
        let per_page = self.gtes_per_page();
        let inner = self.inner.lock();
        let page = inner.shared.get(gref as usize / per_page)?;
        let offset = (gref as usize % per_page) * V1_GTE_SIZE;
        // Safety: offset is within the 4kB page; entries are 4-aligned.
        let ptr = unsafe { page.ptr.as_ptr().add(offset) as *mut AtomicU32 };
        NonNull::new(ptr)
    }

    /// Returns the guest frame granted by `gref`'s entry.
    pub fn shared_gfn(&self, gref: u32) -> Option<Gfn> {
        let per_page = self.gtes_per_page();
        let inner = self.inner.lock();
        let page = inner.shared.get(gref as usize / per_page)?;
        let offset = (gref as usize % per_page) * V1_GTE_SIZE + 4;
        // Safety: in bounds of the shared page; the frame field is the
        // 32-bit word after the header.
        let frame = unsafe { core::ptr::read_volatile(page.ptr.as_ptr().add(offset) as *const u32) };
        Some(Gfn::new(frame as u64))
    }

    /// Writes a whole v1 entry. Used to pre-populate reserved references;
    /// the caller fences afterwards.
    pub fn set_v1_entry(&self, gref: u32, flags: u16, domid: u16, frame: u32) -> Option<()> {
        let per_page = self.gtes_per_page();
        {
            let inner = self.inner.lock();
            let page = inner.shared.get(gref as usize / per_page)?;
            let offset = (gref as usize % per_page) * V1_GTE_SIZE;
            // Safety: in bounds of the shared page.
            unsafe {
                core::ptr::write_volatile(page.ptr.as_ptr().add(offset + 4) as *mut u32, frame);
            }
        }
        let hdr = self.shared_header(gref)?;
        // Safety: the header cell outlives the table, see shared_header.
        unsafe { hdr.as_ref() }.store(make_hdr(flags, domid), Ordering::Relaxed);
        Some(())
    }

    /// Logs the named v1 entry.
    pub fn dump_shared_entry(&self, gref: u32) {
        if self.invalid_ref(gref) {
            println!("gnttab: dump: OOB ref 0x{:x}", gref);
            return;
        }
        // Unwraps ok: bounds checked above.
        let hdr = unsafe { self.shared_header(gref).unwrap().as_ref() }.load(Ordering::Relaxed);
        let gfn = self.shared_gfn(gref).unwrap();
        println!(
            "gnttab: v1: ref 0x{:x} flags 0x{:x} domid 0x{:x} frame 0x{:x}",
            gref,
            hdr_flags(hdr),
            hdr_domid(hdr),
            gfn.bits()
        );
    }

    /// Adds `new_shr` VMM-backed shared pages (and, on version 2 tables,
    /// the derived number of status pages). Growth is monotonic and
    /// bounded by the compile-time maximum.
    pub fn grow(&self, new_shr: u32) -> core::result::Result<(), ()> {
        let new_sts = if self.version() == 2 {
            shared_to_status_pages(2, new_shr)
        } else {
            0
        };
        let mut inner = self.inner.lock();
        if inner.shared.len() + new_shr as usize > MAX_SHARED_PAGES
            || inner.status.len() + new_sts as usize > MAX_STATUS_PAGES
        {
            return Err(());
        }
        for _ in 0..new_shr {
            let page = VmmPage::new_zeroed().ok_or(())?;
            let ptr = page.as_ptr();
            inner.shared.push(SharedPage {
                ptr,
                _backing: SharedBacking::Vmm(page),
            });
        }
        for _ in 0..new_sts {
            inner.status.push(VmmPage::new_zeroed().ok_or(())?);
        }
        Ok(())
    }

    /// Returns the host frame of shared page `idx`, growing the table up to
    /// its capacity if needed. This backs both grant-table mapspace
    /// requests and toolstack resource enumeration.
    pub fn shared_page_hfn(&self, idx: usize) -> Option<Hfn> {
        if idx >= MAX_SHARED_PAGES {
            return None;
        }
        let have = self.nr_shared_pages();
        if idx >= have {
            self.grow((idx + 1 - have) as u32).ok()?;
        }
        let inner = self.inner.lock();
        let page = inner.shared.get(idx)?;
        Some(Hpa::new(page.ptr.as_ptr() as u64).frame())
    }

    /// Installs the root-provided page at `ptr` as shared page `idx`. The
    /// root grows its table strictly in order; replacing an existing slot
    /// re-points it at the new mapping.
    pub fn root_set_shared_page(&self, idx: usize, ptr: NonNull<u8>) -> core::result::Result<(), ()> {
        let mut inner = self.inner.lock();
        if idx < inner.shared.len() {
            inner.shared[idx] = SharedPage {
                ptr,
                _backing: SharedBacking::Guest,
            };
            Ok(())
        } else if idx == inner.shared.len() && idx < MAX_SHARED_PAGES {
            inner.shared.push(SharedPage {
                ptr,
                _backing: SharedBacking::Guest,
            });
            Ok(())
        } else {
            Err(())
        }
    }

    fn handle_addr(&self, handle: u32) -> Option<u64> {
        self.inner.lock().map_handles.get(&handle).copied()
    }

    fn insert_handle(&self, handle: u32, gpa: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.map_handles.contains_key(&handle) {
            return false;
        }
        inner.map_handles.insert(handle, gpa);
        true
    }

    fn remove_handle(&self, handle: u32) {
        self.inner.lock().map_handles.remove(&handle);
    }

    /// Returns the number of active map handles. Test and debug aid.
    pub fn nr_map_handles(&self) -> usize {
        self.inner.lock().map_handles.len()
    }
}

// Safety: the shared-page pointers are only dereferenced through volatile
// or atomic accesses, and the pages they name are owned by the table (or by
// the root guest, whose mapping outlives the table).
unsafe impl Send for GrantTable {}
unsafe impl Sync for GrantTable {}

/*
 * ldomid is the domain invoking the map hypercall, wanting to map in memory
 * from the foreign domain fdomid. Check that the foreign entry grants
 * ldomid the frame with permissions matching the request, then pin the
 * frame by setting GTF_reading (and GTF_writing for a writable map) in the
 * foreign entry. A pinned frame cannot be freed by the granter; the unpin
 * happens when ldomid unmaps the handle.
 */
fn pin_granted_page(
    fgnt: &GrantTable,
    ldomid: DomainId,
    fdomid: u16,
    gref: u32,
    map_rw: bool,
) -> GrantResult<()> {
    let hdr_ptr = fgnt.shared_header(gref).ok_or(GrantStatus::BadGntref)?;
    // Safety: the header cell outlives the table, see shared_header.
    let hdr = unsafe { hdr_ptr.as_ref() };
    let pin_flags = GTF_READING | if map_rw { GTF_WRITING } else { 0 };

    let mut observed = hdr.load(Ordering::Acquire);
    if already_mapped(hdr_flags(observed)) {
        println!(
            "gnttab: attempted remap: ref 0x{:x} dom 0x{:x} oldflags 0x{:x} newflags 0x{:x}",
            gref,
            fdomid,
            hdr_flags(observed),
            hdr_flags(observed) | pin_flags
        );
        return Err(GrantStatus::GeneralError);
    }

    for _ in 0..PIN_RETRIES {
        let flags = hdr_flags(observed);
        if !mappable_gtf(flags) {
            println!(
                "gnttab: invalid flags: gtf 0x{:x} ref 0x{:x} dom 0x{:x}",
                flags, gref, fdomid
            );
            return Err(GrantStatus::BadGntref);
        }
        // The granter may have pinned concurrently since the last load.
        if already_mapped(flags) {
            return Err(GrantStatus::GeneralError);
        }
        let allowed = if map_rw {
            has_write_access(ldomid, observed)
        } else {
            has_read_access(ldomid, observed)
        };
        if !allowed {
            println!(
                "gnttab: dom 0x{:x} doesn't have {} access to ref 0x{:x} in dom 0x{:x}",
                ldomid.bits(),
                if map_rw { "write" } else { "read" },
                gref,
                fdomid
            );
            return Err(GrantStatus::PermissionDenied);
        }

        let desired = observed | pin_flags as u32;
        // The release pairs with the grantee-visible EPT mutation that
        // follows: the pin must be observable before the mapping is.
        match hdr.compare_exchange(observed, desired, Ordering::Release, Ordering::Acquire) {
            Ok(_) => return Ok(()),
            Err(current) => observed = current,
        }
    }

    println!("gnttab: dom 0x{:x} ref 0x{:x} is unstable", fdomid, gref);
    Err(GrantStatus::GeneralError)
}

// Unconditionally clears both pin bits. Idempotent.
fn unpin_granted_page(hdr: NonNull<AtomicU32>) {
    const PINS: u32 = (GTF_READING | GTF_WRITING) as u32;
    // Safety: the header cell outlives the table, see shared_header.
    unsafe { hdr.as_ref() }.fetch_and(!PINS, Ordering::AcqRel);
}

fn valid_map_arg(map: &MapGrantRef) -> bool {
    if !supported_map_flags(map.flags) {
        println!("gnttab: unsupported GNTMAP flags 0x{:x}", map.flags);
        return false;
    }
    // The handle encodes the reference in its low half.
    if map.gref & 0xffff_0000 != 0 {
        println!(
            "gnttab: OOB ref 0x{:x} would overflow the map handle",
            map.gref
        );
        return false;
    }
    true
}

fn map_foreign_frame(
    ctx: &HypercallCtx,
    map: &mut MapGrantRef,
    fdom: &Domain,
    fgfn: Gfn,
    handle: u32,
) -> GrantResult<()> {
    let lgnt = ctx.dom.gnttab();
    let lgpa = map.host_addr;

    if !lgnt.insert_handle(handle, lgpa) {
        println!(
            "gnttab: failed to add map handle 0x{:x} for gpa 0x{:x}",
            handle, lgpa
        );
        return Err(GrantStatus::NoDeviceSpace);
    }

    map.handle = handle;
    map.dev_bus_addr = 0;

    let perm = if map.flags & GNTMAP_READONLY != 0 {
        Perm::Read
    } else {
        Perm::ReadWrite
    };
    let lgfn = Gpa::new(lgpa).frame();

    // The root guest's physical space is identity mapped, so its granted
    // frames are host frames already; anyone else's go through their
    // second-level map.
    let hpa = if fdom.is_root() {
        Some(Hpa::new(fgfn.addr().bits()))
    } else {
        fdom.translate_gpa(fgfn.addr())
    };
    let Some(hpa) = hpa else {
        lgnt.remove_handle(handle);
        println!(
            "gnttab: dom 0x{:x} gfn 0x{:x} is unmapped",
            fdom.id().bits(),
            fgfn.bits()
        );
        return Err(GrantStatus::GeneralError);
    };

    if let Err(e) = ctx
        .dom
        .ept()
        .lock()
        .map_4k(lgfn, hpa, perm, MemType::WriteBack)
    {
        lgnt.remove_handle(handle);
        println!("gnttab: map of gpa 0x{:x} failed: {:?}", lgpa, e);
        return Err(GrantStatus::GeneralError);
    }
    Ok(())
}

fn do_map_grant_ref(ctx: &HypercallCtx, map: &mut MapGrantRef, fdom: &Domain) {
    if !valid_map_arg(map) {
        map.status = GrantStatus::GeneralError.bits();
        return;
    }

    // Root mappings of foreign memory may only land in the PV hole.
    if ctx.dom.is_root() && !ctx.dom.gfn_in_winpv_hole(Gpa::new(map.host_addr).frame()) {
        println!(
            "gnttab: root map target 0x{:x} outside the winpv hole",
            map.host_addr
        );
        map.status = GrantStatus::GeneralError.bits();
        return;
    }

    let handle = ((map.dom as u32) << 16) | map.gref;
    if ctx.dom.gnttab().handle_addr(handle).is_some() {
        println!("gnttab: handle 0x{:x} already mapped", handle);
        map.status = GrantStatus::NoDeviceSpace.bits();
        return;
    }

    let fgnt = fdom.gnttab();
    let mut pinned = false;

    let fgfn = if fgnt.invalid_ref(map.gref) {
        println!(
            "gnttab: OOB ref 0x{:x} for dom 0x{:x}",
            map.gref, map.dom
        );
        // The root's xenstore ring is reachable before the root has grown a
        // grant table at all.
        if fdom.is_root() && map.gref == GNTTAB_RESERVED_XENSTORE {
            Gfn::new(fdom.hvm().get(HVM_PARAM_STORE_PFN))
        } else {
            map.status = GrantStatus::BadGntref.bits();
            return;
        }
    } else {
        if let Err(status) = pin_granted_page(
            fgnt,
            ctx.dom.id(),
            map.dom,
            map.gref,
            map.flags & GNTMAP_READONLY == 0,
        ) {
            map.status = status.bits();
            return;
        }
        pinned = true;
        // Unwrap ok: the reference was bounds-checked above.
        fgnt.shared_gfn(map.gref).unwrap()
    };

    match map_foreign_frame(ctx, map, fdom, fgfn, handle) {
        Ok(()) => map.status = GrantStatus::Okay.bits(),
        Err(status) => {
            if pinned {
                // Unwrap ok: the reference was valid when pinned.
                unpin_granted_page(fgnt.shared_header(map.gref).unwrap());
            }
            map.status = status.bits();
        }
    }
}

fn do_unmap_grant_ref(ctx: &HypercallCtx, unmap: &mut UnmapGrantRef, fdom: &Domain) {
    let handle = unmap.handle;
    let fref = handle & 0xffff;
    let lgpa = unmap.host_addr;
    let lgnt = ctx.dom.gnttab();

    match lgnt.handle_addr(handle) {
        None => {
            println!("gnttab: handle 0x{:x} not found", handle);
            unmap.status = GrantStatus::BadHandle.bits();
            return;
        }
        Some(stored) if stored != lgpa => {
            println!(
                "gnttab: handle addr 0x{:x} != unmap gpa 0x{:x}",
                stored, lgpa
            );
            unmap.status = GrantStatus::BadVirtAddr.bits();
            return;
        }
        Some(_) => {}
    }

    let fgnt = fdom.gnttab();
    if fgnt.invalid_ref(fref) {
        println!("gnttab: bad fref 0x{:x}", fref);
        // The reserved xenstore fallback was mapped without a pin.
        if !(fdom.is_root() && fref == GNTTAB_RESERVED_XENSTORE) {
            unmap.status = GrantStatus::BadHandle.bits();
            return;
        }
    } else {
        // Unwrap ok: bounds checked above.
        unpin_granted_page(fgnt.shared_header(fref).unwrap());
    }

    if let Err(e) = ctx.dom.ept().lock().unmap(Gpa::new(lgpa).frame()) {
        println!("gnttab: unmap of gpa 0x{:x} found no mapping: {:?}", lgpa, e);
    }
    lgnt.remove_handle(handle);
    unmap.status = GrantStatus::Okay.bits();
}

// Cache of the foreign domain across a batch: consecutive items naming the
// same domain reuse one registry reference.
struct ForeignDomCache {
    domid: u16,
    dom: Option<DomainRef>,
}

impl ForeignDomCache {
    fn new() -> Self {
        Self {
            domid: DomainId::INVALID.bits(),
            dom: None,
        }
    }

    fn get(&mut self, ctx: &HypercallCtx, domid: u16) -> Option<&DomainRef> {
        if self.dom.is_none() || self.domid != domid {
            // Dropping the previous reference is the put.
            self.dom = get_dom(ctx.domains, &ctx.dom, domid);
            self.domid = domid;
        }
        self.dom.as_ref()
    }
}

/// `GNTTABOP_map_grant_ref` over a mapped batch. Returns the hypercall
/// status register value: the status of the last operation attempted.
pub fn map_grant_ref(ctx: &HypercallCtx, ops: &mut [MapGrantRef]) -> i64 {
    let mut rc = GrantStatus::Okay.bits();
    let mut cache = ForeignDomCache::new();

    for op in ops.iter_mut() {
        let Some(fdom) = cache.get(ctx, op.dom) else {
            println!("gnttab: failed to get dom 0x{:x}", op.dom);
            rc = GrantStatus::BadDomain.bits();
            break;
        };
        do_map_grant_ref(ctx, op, fdom);
        rc = op.status;
        if rc != GrantStatus::Okay.bits() {
            println!("gnttab: map op failed, rc={}", rc);
            break;
        }
    }

    // No invept here: the only mutations were not-present -> present, which
    // the hardware may not cache negatively.
    rc as i64
}

/// `GNTTABOP_unmap_grant_ref` over a mapped batch. After the batch, the
/// local translations are invalidated and every remapping unit bound to the
/// caller is flushed for the prefix of items that ran.
pub fn unmap_grant_ref(ctx: &HypercallCtx, ops: &mut [UnmapGrantRef]) -> i64 {
    let mut rc = GrantStatus::Okay.bits();
    let mut cache = ForeignDomCache::new();
    let mut done = 0;

    for op in ops.iter_mut() {
        let fdomid = (op.handle >> 16) as u16;
        let Some(fdom) = cache.get(ctx, fdomid) else {
            println!("gnttab: failed to get dom 0x{:x}", fdomid);
            rc = GrantStatus::BadDomain.bits();
            break;
        };
        do_unmap_grant_ref(ctx, op, fdom);
        rc = op.status;
        if rc != GrantStatus::Okay.bits() {
            println!("gnttab: unmap op failed, rc={}", rc);
            break;
        }
        done += 1;
    }

    if done > 0 {
        ctx.dom.invalidate_ept();
        for iommu in ctx.dom.iommus() {
            if !iommu.psi_supported() {
                iommu.flush_iotlb_domain(ctx.dom.id());
                continue;
            }
            for op in ops.iter().take(done) {
                iommu.flush_iotlb_pages(ctx.dom.id(), Gpa::new(op.host_addr), PAGE_SIZE_4K);
            }
        }
    }

    rc as i64
}

// One side of a copy in flight. Dropping the operand releases whatever the
// acquisition took: the access token (only if this acquisition set it), the
// temporary mapping, and the domain reference.
struct CopyOperand {
    // Kept for the put on drop.
    _dom: DomainRef,
    hdr: Option<NonNull<AtomicU32>>,
    pinned: u16,
    page: NonNull<u8>,
    _tmp: Option<TempPage>,
}

impl Drop for CopyOperand {
    fn drop(&mut self) {
        if self.pinned != 0 {
            if let Some(hdr) = self.hdr {
                // Clear only the bit this acquisition set; a concurrent
                // map_grant_ref pin must survive the copy.
                // Safety: the header cell outlives the foreign table.
                unsafe { hdr.as_ref() }.fetch_and(!(self.pinned as u32), Ordering::AcqRel);
            }
        }
    }
}

fn copy_has_access(is_src: bool, domid: DomainId, hdr: u32) -> bool {
    if is_src {
        has_read_access(domid, hdr)
    } else {
        has_write_access(domid, hdr)
    }
}

// Takes an access token on the shared entry backing one side of a copy: a
// pre-existing pin with compatible access is used as-is, otherwise the
// matching pin bit is set with the bounded compare-exchange protocol.
fn get_copy_access(
    gnt: &GrantTable,
    current: DomainId,
    gref: u32,
    is_src: bool,
) -> GrantResult<(NonNull<AtomicU32>, u16)> {
    let hdr_ptr = gnt.shared_header(gref).ok_or(GrantStatus::BadGntref)?;
    // Safety: the header cell outlives the table, see shared_header.
    let hdr = unsafe { hdr_ptr.as_ref() };
    let mut observed = hdr.load(Ordering::Acquire);

    if already_mapped(hdr_flags(observed)) {
        if !copy_has_access(is_src, current, observed) {
            println!(
                "gnttab: ref 0x{:x} already mapped but dom 0x{:x} doesn't have {} access",
                gref,
                current.bits(),
                if is_src { "read" } else { "write" }
            );
            return Err(GrantStatus::PermissionDenied);
        }
        return Ok((hdr_ptr, 0));
    }

    let desired_flag = if is_src { GTF_READING } else { GTF_WRITING };
    for _ in 0..PIN_RETRIES {
        if !copy_has_access(is_src, current, observed) {
            println!(
                "gnttab: dom 0x{:x} doesn't have {} access to ref 0x{:x}",
                current.bits(),
                if is_src { "read" } else { "write" },
                gref
            );
            return Err(GrantStatus::PermissionDenied);
        }
        let desired = observed | desired_flag as u32;
        match hdr.compare_exchange(observed, desired, Ordering::Release, Ordering::Acquire) {
            Ok(_) => return Ok((hdr_ptr, desired_flag)),
            Err(current_hdr) => observed = current_hdr,
        }
    }

    println!("gnttab: grant entry 0x{:x} is unstable", gref);
    Err(GrantStatus::GeneralError)
}

fn get_copy_operand(
    ctx: &HypercallCtx,
    side: &CopyPtr,
    is_src: bool,
    use_gref: bool,
) -> GrantResult<CopyOperand> {
    let Some(dom) = get_dom(ctx.domains, &ctx.dom, side.domid) else {
        println!(
            "gnttab: failed to get {} dom 0x{:x}",
            if is_src { "src" } else { "dst" },
            side.domid
        );
        return Err(GrantStatus::BadDomain);
    };

    let mut operand = CopyOperand {
        _dom: dom,
        hdr: None,
        pinned: 0,
        page: NonNull::dangling(),
        _tmp: None,
    };
    let dom = &operand._dom;

    let gfn = if use_gref {
        let gref = side.gref();
        let gnt = dom.gnttab();
        if gnt.invalid_ref(gref) {
            println!(
                "gnttab: bad {} ref 0x{:x}",
                if is_src { "src" } else { "dst" },
                gref
            );
            return Err(GrantStatus::BadGntref);
        }
        let (hdr, pinned) = get_copy_access(gnt, ctx.dom.id(), gref, is_src)?;
        operand.hdr = Some(hdr);
        operand.pinned = pinned;
        // Unwrap ok: bounds checked above.
        gnt.shared_gfn(gref).unwrap()
    } else {
        side.gfn()
    };

    let hpa = if dom.is_root() {
        Some(Hpa::new(gfn.addr().bits()))
    } else {
        dom.translate_gpa(gfn.addr())
    };
    let Some(hpa) = hpa else {
        println!(
            "gnttab: {} gfn 0x{:x} in dom 0x{:x} is unmapped",
            if is_src { "src" } else { "dst" },
            gfn.bits(),
            dom.id().bits()
        );
        return Err(GrantStatus::GeneralError);
    };

    // Resolve the frame through the direct map, or install a transient
    // mapping that tears down with the operand.
    match ctx.dom.mapper().phys_to_ptr(hpa) {
        Some(ptr) => operand.page = ptr,
        None => {
            let tmp = ctx
                .dom
                .mapper()
                .map_page(hpa)
                .ok_or(GrantStatus::GeneralError)?;
            operand.page = tmp.as_ptr();
            operand._tmp = Some(tmp);
        }
    }

    Ok(operand)
}

fn valid_copy_args(copy: &GnttabCopy) -> Option<GrantStatus> {
    let src_use_gfn = copy.flags & GNTCOPY_SOURCE_GREF == 0;
    let dst_use_gfn = copy.flags & GNTCOPY_DEST_GREF == 0;

    // Frame-addressed operands bypass the granter's table, so only the
    // caller's own frames are reachable that way.
    if src_use_gfn && copy.source.domid != DomainId::SELF_ALIAS.bits() {
        println!("gnttab: src: only DOMID_SELF can use gfn-based copy");
        return Some(GrantStatus::PermissionDenied);
    }
    if dst_use_gfn && copy.dest.domid != DomainId::SELF_ALIAS.bits() {
        println!("gnttab: dst: only DOMID_SELF can use gfn-based copy");
        return Some(GrantStatus::PermissionDenied);
    }

    if copy.source.offset as u32 + copy.len as u32 > PAGE_SIZE_4K as u32 {
        println!(
            "gnttab: src: offset {} + len {} crosses the page",
            copy.source.offset, copy.len
        );
        return Some(GrantStatus::BadCopyArg);
    }
    if copy.dest.offset as u32 + copy.len as u32 > PAGE_SIZE_4K as u32 {
        println!(
            "gnttab: dst: offset {} + len {} crosses the page",
            copy.dest.offset, copy.len
        );
        return Some(GrantStatus::BadCopyArg);
    }
    None
}

fn do_copy(ctx: &HypercallCtx, copy: &mut GnttabCopy) {
    if let Some(status) = valid_copy_args(copy) {
        copy.status = status.bits();
        return;
    }

    let src = match get_copy_operand(
        ctx,
        &copy.source,
        true,
        copy.flags & GNTCOPY_SOURCE_GREF != 0,
    ) {
        Ok(op) => op,
        Err(status) => {
            copy.status = status.bits();
            return;
        }
    };
    let dst = match get_copy_operand(ctx, &copy.dest, false, copy.flags & GNTCOPY_DEST_GREF != 0) {
        Ok(op) => op,
        Err(status) => {
            copy.status = status.bits();
            return;
        }
    };

    // Safety: both offsets plus len were validated against the page size,
    // and each page pointer covers a full 4kB frame. `copy` handles the
    // same-frame case.
    unsafe {
        core::ptr::copy(
            src.page.as_ptr().add(copy.source.offset as usize),
            dst.page.as_ptr().add(copy.dest.offset as usize),
            copy.len as usize,
        );
    }
    copy.status = GrantStatus::Okay.bits();
    drop(dst);
    drop(src);
}

/// `GNTTABOP_copy` over a mapped batch.
pub fn copy(ctx: &HypercallCtx, ops: &mut [GnttabCopy]) -> i64 {
    let mut rc = GrantStatus::Okay.bits();
    for op in ops.iter_mut() {
        do_copy(ctx, op);
        rc = op.status;
        if rc != GrantStatus::Okay.bits() {
            println!("gnttab: copy op failed, rc={}", rc);
            break;
        }
    }
    rc as i64
}

/// `GNTTABOP_query_size`: reports how many shared frames the domain has and
/// the compile-time bound.
pub fn query_size(ctx: &HypercallCtx, op: &mut GnttabQuerySize) -> i64 {
    let Some(dom) = get_dom(ctx.domains, &ctx.dom, op.dom) else {
        println!("gnttab: query_size: dom 0x{:x} not found", op.dom);
        op.status = GrantStatus::BadDomain.bits();
        return -crate::hypercall::ESRCH;
    };
    op.nr_frames = dom.gnttab().nr_shared_pages() as u32;
    op.max_nr_frames = MAX_SHARED_PAGES as u32;
    op.status = GrantStatus::Okay.bits();
    0
}

/// `GNTTABOP_set_version`: v1 is the only implemented version.
pub fn set_version(_ctx: &HypercallCtx, op: &mut GnttabSetVersion) -> i64 {
    match op.version {
        1 => 0,
        2 => {
            println!("gnttab: set_version to 2 unimplemented");
            -crate::hypercall::ENOSYS
        }
        _ => -crate::hypercall::EINVAL,
    }
}

/// `XENMEM_add_to_physmap` with the grant-table space: maps shared (or, on
/// v2, status) table page `idx` into the caller's physmap at `gpfn`.
pub fn mapspace_grant_table(ctx: &HypercallCtx, atp: &mut AddToPhysmap) -> i64 {
    let gnt = ctx.dom.gnttab();
    let gfn = Gfn::new(atp.gpfn);

    match ctx.vcpu.kind() {
        VcpuKind::Guest => {
            let mut idx = atp.idx;
            if idx & MAPIDX_GRANT_TABLE_STATUS != 0 {
                if gnt.version() != 2 {
                    println!("gnttab: mapspace status requested but version is 1");
                    return -crate::hypercall::EINVAL;
                }
                idx &= !MAPIDX_GRANT_TABLE_STATUS;
            }
            let Some(hfn) = gnt.shared_page_hfn(idx as usize) else {
                println!("gnttab: mapspace shared page idx 0x{:x} unavailable", idx);
                return -crate::hypercall::EINVAL;
            };
            if ctx
                .dom
                .ept()
                .lock()
                .map_4k(gfn, hfn.addr(), Perm::ReadWrite, MemType::WriteBack)
                .is_err()
            {
                return -crate::hypercall::EINVAL;
            }
            ctx.dom.invalidate_ept();
            for iommu in ctx.dom.iommus() {
                iommu.flush_iotlb_pages(ctx.dom.id(), gfn.addr(), PAGE_SIZE_4K);
            }
            0
        }
        VcpuKind::Root => {
            if !ctx.dom.is_root()
                || !ctx.dom.gfn_in_winpv_hole(gfn)
                || atp.idx & MAPIDX_GRANT_TABLE_STATUS != 0
            {
                println!(
                    "gnttab: root mapspace rejected: idx 0x{:x} gpfn 0x{:x}",
                    atp.idx, atp.gpfn
                );
                return -crate::hypercall::EINVAL;
            }
            let idx = atp.idx as usize;

            // The root's own frame becomes the shared-page backing; its
            // physical space is identity mapped.
            let gpa = gfn.addr();
            if ctx
                .dom
                .ept()
                .lock()
                .map_4k(gfn, Hpa::new(gpa.bits()), Perm::ReadWrite, MemType::WriteBack)
                .is_err()
            {
                return -crate::hypercall::EINVAL;
            }
            let Some(ptr) = ctx.dom.mapper().phys_to_ptr(Hpa::new(gpa.bits())) else {
                return -crate::hypercall::EINVAL;
            };
            if gnt.root_set_shared_page(idx, ptr).is_err() {
                println!("gnttab: root mapspace idx 0x{:x} out of range", idx);
                return -crate::hypercall::EINVAL;
            }

            // Fill in the store and console entries as the toolstack would
            // have.
            if idx == 0 {
                let store_pfn = ctx.dom.hvm().get(HVM_PARAM_STORE_PFN);
                let console_pfn = ctx.dom.hvm().get(HVM_PARAM_CONSOLE_PFN);
                if store_pfn == 0 || console_pfn == 0 {
                    println!("gnttab: root PV channel frames are unset");
                    return -crate::hypercall::EINVAL;
                }
                gnt.set_v1_entry(
                    GNTTAB_RESERVED_XENSTORE,
                    GTF_PERMIT_ACCESS,
                    0,
                    store_pfn as u32,
                );
                gnt.set_v1_entry(
                    GNTTAB_RESERVED_CONSOLE,
                    GTF_PERMIT_ACCESS,
                    0,
                    console_pfn as u32,
                );
                // Dom0 reads these entries as soon as the page is visible.
                wmb();
            }
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DomainTable;
    use crate::ept::GuestPhysMap;
    use crate::test_fixtures::*;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    // Reads the current flag word of a v1 entry.
    fn entry_flags(dom: &Domain, gref: u32) -> u16 {
        let hdr = dom.gnttab().shared_header(gref).unwrap();
        hdr_flags(unsafe { hdr.as_ref() }.load(Ordering::Relaxed))
    }

    fn map_op(host_addr: u64, flags: u32, gref: u32, dom: u16) -> MapGrantRef {
        MapGrantRef {
            host_addr,
            flags,
            gref,
            dom,
            ..Default::default()
        }
    }

    fn unmap_op(host_addr: u64, handle: u32) -> UnmapGrantRef {
        UnmapGrantRef {
            host_addr,
            handle,
            ..Default::default()
        }
    }

    struct TwoDomains {
        table: &'static DomainTable,
        grantee: Arc<Domain>,
        granter: Arc<Domain>,
        ctx: HypercallCtx<'static>,
    }

    // A grantee (dom 1) with a hypercall context and a granter (dom 2)
    // holding one backing page granted to the grantee as ref 7.
    fn two_domains() -> (TwoDomains, VmmPage) {
        let table = new_domain_table();
        new_root(table);
        let grantee = add_guest(table, 1);
        let granter = add_guest(table, 2);
        let ctx = guest_ctx(table, &grantee);

        let backing = VmmPage::new_zeroed().unwrap();
        granter
            .ept()
            .lock()
            .map_4k(
                Gfn::new(0xabcde),
                backing.hpa(),
                Perm::ReadWrite,
                MemType::WriteBack,
            )
            .unwrap();
        granter
            .gnttab()
            .set_v1_entry(7, GTF_PERMIT_ACCESS, 1, 0xabcde)
            .unwrap();
        (
            TwoDomains {
                table,
                grantee,
                granter,
                ctx,
            },
            backing,
        )
    }

    #[test]
    fn map_unmap_rw_round_trip() {
        let (fix, backing) = two_domains();
        let mut ops = [map_op(0x10000, GNTMAP_HOST_MAP, 7, 2)];

        assert_eq!(map_grant_ref(&fix.ctx, &mut ops), 0);
        assert_eq!(ops[0].status, GrantStatus::Okay.bits());
        assert_eq!(ops[0].handle, (2 << 16) | 7);
        assert_eq!(ops[0].dev_bus_addr, 0);
        assert_eq!(
            entry_flags(&fix.granter, 7),
            GTF_PERMIT_ACCESS | GTF_READING | GTF_WRITING
        );
        assert_eq!(
            fix.grantee.translate_gpa(Gpa::new(0x10000)),
            Some(backing.hpa())
        );
        assert_eq!(fix.grantee.gnttab().nr_map_handles(), 1);

        let mut unmaps = [unmap_op(0x10000, (2 << 16) | 7)];
        assert_eq!(unmap_grant_ref(&fix.ctx, &mut unmaps), 0);
        assert_eq!(unmaps[0].status, GrantStatus::Okay.bits());
        assert_eq!(entry_flags(&fix.granter, 7), GTF_PERMIT_ACCESS);
        assert_eq!(fix.grantee.translate_gpa(Gpa::new(0x10000)), None);
        assert_eq!(fix.grantee.gnttab().nr_map_handles(), 0);

        // The handle is gone; a second unmap cannot find it.
        let mut again = [unmap_op(0x10000, (2 << 16) | 7)];
        assert_eq!(
            unmap_grant_ref(&fix.ctx, &mut again),
            GrantStatus::BadHandle.bits() as i64
        );
    }

    #[test]
    fn readonly_map_of_readonly_grant() {
        let (fix, _backing) = two_domains();
        fix.granter
            .gnttab()
            .set_v1_entry(7, GTF_PERMIT_ACCESS | GTF_READONLY, 1, 0xabcde)
            .unwrap();

        let mut ops = [map_op(0x10000, GNTMAP_HOST_MAP | GNTMAP_READONLY, 7, 2)];
        assert_eq!(map_grant_ref(&fix.ctx, &mut ops), 0);
        assert_eq!(
            entry_flags(&fix.granter, 7),
            GTF_PERMIT_ACCESS | GTF_READONLY | GTF_READING
        );
    }

    #[test]
    fn writable_map_of_readonly_grant_denied() {
        let (fix, _backing) = two_domains();
        fix.granter
            .gnttab()
            .set_v1_entry(7, GTF_PERMIT_ACCESS | GTF_READONLY, 1, 0xabcde)
            .unwrap();

        let mut ops = [map_op(0x10000, GNTMAP_HOST_MAP, 7, 2)];
        assert_eq!(
            map_grant_ref(&fix.ctx, &mut ops),
            GrantStatus::PermissionDenied.bits() as i64
        );
        // The entry is untouched.
        assert_eq!(entry_flags(&fix.granter, 7), GTF_PERMIT_ACCESS | GTF_READONLY);
        assert_eq!(fix.grantee.gnttab().nr_map_handles(), 0);
    }

    #[test]
    fn grant_to_other_domain_denied() {
        let (fix, _backing) = two_domains();
        // Granted to dom 5, not to the caller.
        fix.granter
            .gnttab()
            .set_v1_entry(7, GTF_PERMIT_ACCESS, 5, 0xabcde)
            .unwrap();

        let mut ops = [map_op(0x10000, GNTMAP_HOST_MAP, 7, 2)];
        assert_eq!(
            map_grant_ref(&fix.ctx, &mut ops),
            GrantStatus::PermissionDenied.bits() as i64
        );
    }

    #[test]
    fn unsupported_map_flags_rejected() {
        let (fix, _backing) = two_domains();
        for flags in [0, GNTMAP_DEVICE_MAP, GNTMAP_READONLY, GNTMAP_HOST_MAP | GNTMAP_DEVICE_MAP] {
            let mut ops = [map_op(0x10000, flags, 7, 2)];
            assert_eq!(
                map_grant_ref(&fix.ctx, &mut ops),
                GrantStatus::GeneralError.bits() as i64,
                "flags 0x{:x}",
                flags
            );
        }
    }

    #[test]
    fn oversized_gref_rejected() {
        let (fix, _backing) = two_domains();
        let mut ops = [map_op(0x10000, GNTMAP_HOST_MAP, 0x1_0000, 2)];
        assert_eq!(
            map_grant_ref(&fix.ctx, &mut ops),
            GrantStatus::GeneralError.bits() as i64
        );
    }

    #[test]
    fn out_of_table_gref_rejected() {
        let (fix, _backing) = two_domains();
        // One shared page holds 512 entries.
        let mut ops = [map_op(0x10000, GNTMAP_HOST_MAP, 600, 2)];
        assert_eq!(
            map_grant_ref(&fix.ctx, &mut ops),
            GrantStatus::BadGntref.bits() as i64
        );
    }

    #[test]
    fn unmappable_attribute_bits_rejected() {
        let (fix, _backing) = two_domains();
        fix.granter
            .gnttab()
            .set_v1_entry(7, GTF_PERMIT_ACCESS | GTF_SUB_PAGE, 1, 0xabcde)
            .unwrap();
        let mut ops = [map_op(0x10000, GNTMAP_HOST_MAP, 7, 2)];
        assert_eq!(
            map_grant_ref(&fix.ctx, &mut ops),
            GrantStatus::BadGntref.bits() as i64
        );
    }

    #[test]
    fn double_map_of_same_handle_refused() {
        let (fix, _backing) = two_domains();
        let mut first = [map_op(0x10000, GNTMAP_HOST_MAP, 7, 2)];
        assert_eq!(map_grant_ref(&fix.ctx, &mut first), 0);

        let mut second = [map_op(0x11000, GNTMAP_HOST_MAP, 7, 2)];
        assert_eq!(
            map_grant_ref(&fix.ctx, &mut second),
            GrantStatus::NoDeviceSpace.bits() as i64
        );
    }

    #[test]
    fn pinned_entry_refuses_remap_without_retry() {
        let (fix, _backing) = two_domains();
        fix.granter
            .gnttab()
            .set_v1_entry(7, GTF_PERMIT_ACCESS | GTF_READING | GTF_WRITING, 1, 0xabcde)
            .unwrap();

        let mut ops = [map_op(0x10000, GNTMAP_HOST_MAP, 7, 2)];
        assert_eq!(
            map_grant_ref(&fix.ctx, &mut ops),
            GrantStatus::GeneralError.bits() as i64
        );
        assert_eq!(
            entry_flags(&fix.granter, 7),
            GTF_PERMIT_ACCESS | GTF_READING | GTF_WRITING
        );
    }

    #[test]
    fn unpin_is_idempotent() {
        let (fix, _backing) = two_domains();
        fix.granter
            .gnttab()
            .set_v1_entry(7, GTF_PERMIT_ACCESS | GTF_READING | GTF_WRITING, 1, 0xabcde)
            .unwrap();
        let hdr = fix.granter.gnttab().shared_header(7).unwrap();
        unpin_granted_page(hdr);
        assert_eq!(entry_flags(&fix.granter, 7), GTF_PERMIT_ACCESS);
        unpin_granted_page(hdr);
        assert_eq!(entry_flags(&fix.granter, 7), GTF_PERMIT_ACCESS);
    }

    #[test]
    fn reserved_xenstore_fallback_round_trip() {
        let (fix, _backing) = two_domains();
        let root = fix.table.root().unwrap();
        let store_pfn = root.hvm().get(HVM_PARAM_STORE_PFN);
        assert_ne!(store_pfn, 0);
        // The root has not grown a grant table.
        assert_eq!(root.gnttab().nr_shared_pages(), 0);

        let rootvm = DomainId::ROOTVM.bits();
        let mut ops = [map_op(0x20000, GNTMAP_HOST_MAP, GNTTAB_RESERVED_XENSTORE, rootvm)];
        assert_eq!(map_grant_ref(&fix.ctx, &mut ops), 0);
        // Identity: the mapped frame is the store frame itself.
        assert_eq!(
            fix.grantee.translate_gpa(Gpa::new(0x20000)),
            Some(Hpa::new(store_pfn << 12))
        );

        let mut unmaps = [unmap_op(0x20000, ops[0].handle)];
        assert_eq!(unmap_grant_ref(&fix.ctx, &mut unmaps), 0);
        assert_eq!(fix.grantee.translate_gpa(Gpa::new(0x20000)), None);
    }

    #[test]
    fn unmap_argument_validation() {
        let (fix, _backing) = two_domains();
        let mut ops = [map_op(0x10000, GNTMAP_HOST_MAP, 7, 2)];
        assert_eq!(map_grant_ref(&fix.ctx, &mut ops), 0);

        // Wrong guest-physical address.
        let mut bad_addr = [unmap_op(0x18000, ops[0].handle)];
        assert_eq!(
            unmap_grant_ref(&fix.ctx, &mut bad_addr),
            GrantStatus::BadVirtAddr.bits() as i64
        );
        // Unknown handle.
        let mut bad_handle = [unmap_op(0x10000, (9 << 16) | 7)];
        assert_eq!(
            unmap_grant_ref(&fix.ctx, &mut bad_handle),
            GrantStatus::BadDomain.bits() as i64
        );
        // The original mapping survived both failures.
        assert_eq!(fix.grantee.gnttab().nr_map_handles(), 1);
    }

    #[test]
    fn batch_stops_at_first_failure_but_keeps_prefix() {
        let (fix, _backing) = two_domains();
        fix.granter
            .gnttab()
            .set_v1_entry(8, GTF_PERMIT_ACCESS, 1, 0xabcde)
            .unwrap();

        let mut ops = [
            map_op(0x10000, GNTMAP_HOST_MAP, 7, 2),
            map_op(0x11000, GNTMAP_DEVICE_MAP, 8, 2), // unsupported flags
            map_op(0x12000, GNTMAP_HOST_MAP, 8, 2),
        ];
        assert_eq!(
            map_grant_ref(&fix.ctx, &mut ops),
            GrantStatus::GeneralError.bits() as i64
        );
        // The eligible prefix stays applied; the batch is not rolled back.
        assert_eq!(ops[0].status, GrantStatus::Okay.bits());
        assert!(fix.grantee.translate_gpa(Gpa::new(0x10000)).is_some());
        // The item after the failure never ran.
        assert_eq!(ops[2].status, 0);
        assert!(fix.grantee.translate_gpa(Gpa::new(0x12000)).is_none());
    }

    #[test]
    fn unmap_batch_flushes_iotlb_per_psi_support() {
        let (fix, _backing) = two_domains();
        for gref in [8, 9] {
            fix.granter
                .gnttab()
                .set_v1_entry(gref, GTF_PERMIT_ACCESS, 1, (0xabcde - gref as u64) as u32)
                .unwrap();
            fix.granter
                .ept()
                .lock()
                .map_4k(
                    Gfn::new(0xabcde - gref as u64),
                    Hpa::new(0x9990_0000 + ((gref as u64) << 12)),
                    Perm::ReadWrite,
                    MemType::WriteBack,
                )
                .unwrap();
        }

        let psi = FlushRecorder::attach(&fix.grantee, true);
        let no_psi = FlushRecorder::attach(&fix.grantee, false);

        let mut maps = [
            map_op(0x10000, GNTMAP_HOST_MAP, 7, 2),
            map_op(0x11000, GNTMAP_HOST_MAP, 8, 2),
            map_op(0x12000, GNTMAP_HOST_MAP, 9, 2),
        ];
        assert_eq!(map_grant_ref(&fix.ctx, &mut maps), 0);
        let version_before = fix.grantee.ept().lock().tlb_version();

        let mut unmaps = [
            unmap_op(0x10000, (2 << 16) | 7),
            unmap_op(0x11000, (2 << 16) | 8),
            unmap_op(0x12000, (2 << 16) | 9),
        ];
        assert_eq!(unmap_grant_ref(&fix.ctx, &mut unmaps), 0);

        // EPT invalidated before return.
        assert!(fix.grantee.ept().lock().tlb_version() > version_before);
        // PSI: one page-selective flush per unmapped page.
        assert_eq!(
            psi.page_flushes(),
            vec![(1u16, 0x10000u64), (1, 0x11000), (1, 0x12000)]
        );
        assert_eq!(psi.domain_flushes(), 0);
        // No PSI: a single domain-selective flush.
        assert_eq!(no_psi.domain_flushes(), 1);
        assert!(no_psi.page_flushes().is_empty());
    }

    // Builds the cross-domain copy fixture: source
    // ref 3 in dom A granted to B, dest ref 5 in dom B granted to itself.
    struct CopyFixture {
        fix: TwoDomains,
        page_a: VmmPage,
        page_b: VmmPage,
    }

    fn copy_fixture() -> CopyFixture {
        let (fix, _unused) = two_domains();
        // fix.grantee is B (dom 1, the caller), fix.granter is A (dom 2).
        let page_a = VmmPage::new_zeroed().unwrap();
        let page_b = VmmPage::new_zeroed().unwrap();

        fix.granter
            .ept()
            .lock()
            .map_4k(Gfn::new(0x100), page_a.hpa(), Perm::ReadWrite, MemType::WriteBack)
            .unwrap();
        fix.granter
            .gnttab()
            .set_v1_entry(3, GTF_PERMIT_ACCESS, 1, 0x100)
            .unwrap();

        fix.grantee
            .ept()
            .lock()
            .map_4k(Gfn::new(0x200), page_b.hpa(), Perm::ReadWrite, MemType::WriteBack)
            .unwrap();
        fix.grantee
            .gnttab()
            .set_v1_entry(5, GTF_PERMIT_ACCESS, 1, 0x200)
            .unwrap();

        CopyFixture { fix, page_a, page_b }
    }

    fn copy_op(src: CopyPtr, dst: CopyPtr, len: u16, flags: u16) -> GnttabCopy {
        GnttabCopy {
            source: src,
            dest: dst,
            len,
            flags,
            ..Default::default()
        }
    }

    #[test]
    fn copy_between_domains() {
        let cf = copy_fixture();
        for i in 0..32 {
            cf.page_a.write_u32(i * 4, 0x0101_0101 * i as u32);
        }

        let mut ops = [copy_op(
            CopyPtr {
                u: 3,
                domid: 2,
                offset: 8,
            },
            CopyPtr {
                u: 5,
                domid: 1,
                offset: 0,
            },
            16,
            GNTCOPY_SOURCE_GREF | GNTCOPY_DEST_GREF,
        )];
        assert_eq!(copy(&cf.fix.ctx, &mut ops), 0);
        assert_eq!(ops[0].status, GrantStatus::Okay.bits());
        for i in 0..4 {
            assert_eq!(cf.page_b.read_u32(i * 4), cf.page_a.read_u32(8 + i * 4));
        }
        // Transient access tokens were released on return.
        assert_eq!(entry_flags(&cf.fix.granter, 3), GTF_PERMIT_ACCESS);
        assert_eq!(entry_flags(&cf.fix.grantee, 5), GTF_PERMIT_ACCESS);
    }

    #[test]
    fn copy_of_length_zero_is_a_no_op() {
        let cf = copy_fixture();
        cf.page_b.write_u32(0, 0x5555_5555);
        let mut ops = [copy_op(
            CopyPtr {
                u: 3,
                domid: 2,
                offset: 0,
            },
            CopyPtr {
                u: 5,
                domid: 1,
                offset: 0,
            },
            0,
            GNTCOPY_SOURCE_GREF | GNTCOPY_DEST_GREF,
        )];
        assert_eq!(copy(&cf.fix.ctx, &mut ops), 0);
        assert_eq!(cf.page_b.read_u32(0), 0x5555_5555);
    }

    #[test]
    fn copy_page_overrun_rejected() {
        let cf = copy_fixture();
        let mut ops = [copy_op(
            CopyPtr {
                u: 3,
                domid: 2,
                offset: 4090,
            },
            CopyPtr {
                u: 5,
                domid: 1,
                offset: 0,
            },
            16,
            GNTCOPY_SOURCE_GREF | GNTCOPY_DEST_GREF,
        )];
        assert_eq!(
            copy(&cf.fix.ctx, &mut ops),
            GrantStatus::BadCopyArg.bits() as i64
        );
    }

    #[test]
    fn gfn_addressed_copy_requires_domid_self() {
        let cf = copy_fixture();
        // Source by frame but naming dom 2 explicitly.
        let mut ops = [copy_op(
            CopyPtr {
                u: 0x100,
                domid: 2,
                offset: 0,
            },
            CopyPtr {
                u: 5,
                domid: 1,
                offset: 0,
            },
            8,
            GNTCOPY_DEST_GREF,
        )];
        assert_eq!(
            copy(&cf.fix.ctx, &mut ops),
            GrantStatus::PermissionDenied.bits() as i64
        );
    }

    #[test]
    fn gfn_addressed_copy_from_own_frame() {
        let cf = copy_fixture();
        cf.page_b.write_u32(0, 0);
        cf.page_a.write_u32(0, 0);

        // B copies from its own frame 0x200 into A's granted ref 3... which
        // requires write access: make ref 3 writable for this test.
        cf.page_b.write_u32(0, 0xfeed_f00d);
        let mut ops = [copy_op(
            CopyPtr {
                u: 0x200,
                domid: DomainId::SELF_ALIAS.bits(),
                offset: 0,
            },
            CopyPtr {
                u: 3,
                domid: 2,
                offset: 0,
            },
            4,
            GNTCOPY_DEST_GREF,
        )];
        assert_eq!(copy(&cf.fix.ctx, &mut ops), 0);
        assert_eq!(cf.page_a.read_u32(0), 0xfeed_f00d);
        assert_eq!(entry_flags(&cf.fix.granter, 3), GTF_PERMIT_ACCESS);
    }

    #[test]
    fn copy_to_readonly_grant_denied() {
        let cf = copy_fixture();
        cf.fix
            .grantee
            .gnttab()
            .set_v1_entry(5, GTF_PERMIT_ACCESS | GTF_READONLY, 1, 0x200)
            .unwrap();
        let mut ops = [copy_op(
            CopyPtr {
                u: 3,
                domid: 2,
                offset: 0,
            },
            CopyPtr {
                u: 5,
                domid: 1,
                offset: 0,
            },
            8,
            GNTCOPY_SOURCE_GREF | GNTCOPY_DEST_GREF,
        )];
        assert_eq!(
            copy(&cf.fix.ctx, &mut ops),
            GrantStatus::PermissionDenied.bits() as i64
        );
    }

    #[test]
    fn copy_preserves_pre_existing_pin() {
        let cf = copy_fixture();
        // A prior map pinned the source entry read/write.
        let mut maps = [map_op(0x30000, GNTMAP_HOST_MAP, 3, 2)];
        assert_eq!(map_grant_ref(&cf.fix.ctx, &mut maps), 0);
        assert_eq!(
            entry_flags(&cf.fix.granter, 3),
            GTF_PERMIT_ACCESS | GTF_READING | GTF_WRITING
        );

        let mut ops = [copy_op(
            CopyPtr {
                u: 3,
                domid: 2,
                offset: 0,
            },
            CopyPtr {
                u: 5,
                domid: 1,
                offset: 0,
            },
            8,
            GNTCOPY_SOURCE_GREF | GNTCOPY_DEST_GREF,
        )];
        assert_eq!(copy(&cf.fix.ctx, &mut ops), 0);

        // The map's pin survives the copy; only the unmap clears it.
        assert_eq!(
            entry_flags(&cf.fix.granter, 3),
            GTF_PERMIT_ACCESS | GTF_READING | GTF_WRITING
        );
        let mut unmaps = [unmap_op(0x30000, maps[0].handle)];
        assert_eq!(unmap_grant_ref(&cf.fix.ctx, &mut unmaps), 0);
        assert_eq!(entry_flags(&cf.fix.granter, 3), GTF_PERMIT_ACCESS);
    }

    #[test]
    fn query_size_is_pure() {
        let (fix, _backing) = two_domains();
        let mut op = GnttabQuerySize {
            dom: 2,
            ..Default::default()
        };
        assert_eq!(query_size(&fix.ctx, &mut op), 0);
        assert_eq!(op.nr_frames, 1);
        assert_eq!(op.max_nr_frames, MAX_SHARED_PAGES as u32);
        assert_eq!(op.status, GrantStatus::Okay.bits());

        let mut again = GnttabQuerySize {
            dom: 2,
            ..Default::default()
        };
        assert_eq!(query_size(&fix.ctx, &mut again), 0);
        assert_eq!(again.nr_frames, 1);

        let mut missing = GnttabQuerySize {
            dom: 0x555,
            ..Default::default()
        };
        assert_eq!(query_size(&fix.ctx, &mut missing), -crate::hypercall::ESRCH);
        assert_eq!(missing.status, GrantStatus::BadDomain.bits());
    }

    #[test]
    fn set_version_only_accepts_v1() {
        let (fix, _backing) = two_domains();
        let mut v1 = GnttabSetVersion { version: 1 };
        assert_eq!(set_version(&fix.ctx, &mut v1), 0);
        let mut v2 = GnttabSetVersion { version: 2 };
        assert_eq!(set_version(&fix.ctx, &mut v2), -crate::hypercall::ENOSYS);
        let mut v3 = GnttabSetVersion { version: 3 };
        assert_eq!(set_version(&fix.ctx, &mut v3), -crate::hypercall::EINVAL);
    }

    #[test]
    fn status_page_math_uses_corrected_ceiling() {
        // v1: 512 entries per page.
        assert_eq!(shared_to_status_pages(1, 1), 1);
        assert_eq!(shared_to_status_pages(1, 4), 1);
        assert_eq!(shared_to_status_pages(1, 8), 2);
        assert_eq!(shared_to_status_pages(1, 9), 3);
        // v2: 256 entries per page.
        assert_eq!(shared_to_status_pages(2, 1), 1);
        assert_eq!(shared_to_status_pages(2, 8), 1);
        assert_eq!(shared_to_status_pages(2, 9), 2);
        assert_eq!(status_to_shared_pages(2, 1), 8);
        assert_eq!(status_to_shared_pages(1, 1), 4);
    }

    #[test]
    fn mapspace_grows_guest_table() {
        let (fix, _backing) = two_domains();
        let recorder = FlushRecorder::attach(&fix.grantee, true);
        assert_eq!(fix.grantee.gnttab().nr_shared_pages(), 1);

        let mut atp = AddToPhysmap {
            domid: DomainId::SELF_ALIAS.bits(),
            space: crate::hypercall::XENMAPSPACE_GRANT_TABLE,
            idx: 1,
            gpfn: 0x5000,
            ..Default::default()
        };
        assert_eq!(mapspace_grant_table(&fix.ctx, &mut atp), 0);
        assert_eq!(fix.grantee.gnttab().nr_shared_pages(), 2);

        let hfn = fix.grantee.gnttab().shared_page_hfn(1).unwrap();
        assert_eq!(
            fix.grantee.translate_gpa(Gfn::new(0x5000).addr()),
            Some(hfn.addr())
        );
        assert_eq!(recorder.page_flushes(), vec![(1, Gfn::new(0x5000).addr().bits())]);

        // Status pages require v2.
        let mut status_atp = AddToPhysmap {
            idx: MAPIDX_GRANT_TABLE_STATUS,
            gpfn: 0x6000,
            ..atp
        };
        assert_eq!(
            mapspace_grant_table(&fix.ctx, &mut status_atp),
            -crate::hypercall::EINVAL
        );

        // Beyond the compile-time bound.
        let mut oob = AddToPhysmap {
            idx: MAX_SHARED_PAGES as u64,
            gpfn: 0x7000,
            ..atp
        };
        assert_eq!(
            mapspace_grant_table(&fix.ctx, &mut oob),
            -crate::hypercall::EINVAL
        );
    }

    #[test]
    fn mapspace_root_prefills_reserved_entries() {
        let table = new_domain_table();
        // Park the hole over a frame the test owns, so the identity-mapped
        // shared page lands on real memory.
        let hole_page = VmmPage::new_zeroed().unwrap();
        let hole_gfn = hole_page.hfn().bits();
        let root = new_root_with_hole(table, hole_gfn, hole_gfn + 1);
        let ctx = root_ctx(table, &root);

        let mut atp = AddToPhysmap {
            domid: DomainId::SELF_ALIAS.bits(),
            space: crate::hypercall::XENMAPSPACE_GRANT_TABLE,
            idx: 0,
            gpfn: hole_gfn,
            ..Default::default()
        };
        assert_eq!(mapspace_grant_table(&ctx, &mut atp), 0);
        assert_eq!(root.gnttab().nr_shared_pages(), 1);

        let store_pfn = root.hvm().get(HVM_PARAM_STORE_PFN) as u32;
        let console_pfn = root.hvm().get(HVM_PARAM_CONSOLE_PFN) as u32;
        assert_eq!(entry_flags(&root, GNTTAB_RESERVED_XENSTORE), GTF_PERMIT_ACCESS);
        assert_eq!(entry_flags(&root, GNTTAB_RESERVED_CONSOLE), GTF_PERMIT_ACCESS);
        assert_eq!(
            root.gnttab().shared_gfn(GNTTAB_RESERVED_XENSTORE).unwrap(),
            Gfn::new(store_pfn as u64)
        );
        assert_eq!(
            root.gnttab().shared_gfn(GNTTAB_RESERVED_CONSOLE).unwrap(),
            Gfn::new(console_pfn as u64)
        );

        // Outside the winpv hole.
        let mut outside = AddToPhysmap {
            gpfn: 0x1000,
            ..atp
        };
        assert_eq!(
            mapspace_grant_table(&ctx, &mut outside),
            -crate::hypercall::EINVAL
        );
    }

    #[test]
    fn growth_is_capacity_bounded() {
        let (fix, _backing) = two_domains();
        let gnt = fix.grantee.gnttab();
        assert!(gnt.grow(MAX_SHARED_PAGES as u32).is_err());
        assert!(gnt.grow((MAX_SHARED_PAGES - 1) as u32).is_ok());
        assert_eq!(gnt.nr_shared_pages(), MAX_SHARED_PAGES);
        assert!(gnt.grow(1).is_err());
    }

    #[test]
    fn collected_handles_match_mappings() {
        // Invariant: a handle is present iff the foreign frame is mapped.
        let (fix, _backing) = two_domains();
        let mut ops = [map_op(0x10000, GNTMAP_HOST_MAP, 7, 2)];
        assert_eq!(map_grant_ref(&fix.ctx, &mut ops), 0);
        let handles: Vec<_> = {
            let inner = fix.grantee.gnttab().inner.lock();
            inner.map_handles.iter().map(|(h, a)| (*h, *a)).collect()
        };
        assert_eq!(handles, vec![((2 << 16) | 7, 0x10000u64)]);
        assert!(fix.grantee.translate_gpa(Gpa::new(0x10000)).is_some());
    }
}
