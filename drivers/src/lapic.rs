// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Local APIC access shim.
//!
//! The root guest owns the hardware local APIC, but the hypervisor must be
//! able to program it directly (IPIs, EOIs) regardless of which mode the
//! guest has put it in. In xAPIC mode the APIC is a 4kB MMIO page; in x2APIC
//! mode the same registers are MSRs at `0x800 | reg`. The shim tracks the
//! guest's `IA32_APIC_BASE` writes and keeps a matching access path.

use core::ptr::NonNull;
use hyp_pages::{HostMapper, Hpa, MmioWindow};
use spin::Mutex;
use x86_regs::{apic_base_addr, apic_state, ApicState, IA32_APIC_BASE, X2APIC_MSR_BASE};

/// Register indices, in units of 32-bit registers. The xAPIC MMIO offset of
/// register `r` is `r << 4`.
const ID_REG: u32 = 0x02;
const EOI_REG: u32 = 0x0b;
const LDR_REG: u32 = 0x0d;
const DFR_REG: u32 = 0x0e;
const ICR_REG: u32 = 0x30;

const ICR_LO_OFFSET: usize = 0x300;
const ICR_HI_OFFSET: usize = 0x310;

/// ICR delivery/trigger field values used when composing IPIs.
const ICR_DELIVERY_INIT: u64 = 5 << 8;
const ICR_LEVEL_ASSERT: u64 = 1 << 14;
const ICR_DEST_ALL_NOT_SELF: u64 = 3 << 18;

/// Access to model-specific registers. The shim reaches the APIC through
/// this trait so construction and mode changes can run against recorded
/// state in tests.
pub trait MsrAccess: Sync {
    /// Reads `msr`.
    fn read(&self, msr: u32) -> u64;
    /// Writes `val` to `msr`.
    fn write(&self, msr: u32, val: u64);
}

/// `MsrAccess` backed by the RDMSR/WRMSR instructions.
pub struct HwMsrs;

/// The `HwMsrs` singleton.
pub static HW_MSRS: HwMsrs = HwMsrs;

impl MsrAccess for HwMsrs {
    fn read(&self, msr: u32) -> u64 {
        // Safety: the shim only touches MSRs it has verified the CPU is in
        // the right mode for.
        unsafe { x86_regs::rdmsr(msr) }
    }

    fn write(&self, msr: u32, val: u64) {
        // Safety: as above.
        unsafe { x86_regs::wrmsr(msr, val) }
    }
}

/// Errors from the local APIC shim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The APIC is disabled or in an architecturally invalid state.
    UnsupportedState(ApicState),
    /// The xAPIC MMIO page is not identity-mapped for the root guest.
    NotIdentityMapped(Hpa),
    /// No VMM virtual window could be mapped over the xAPIC page.
    WindowUnavailable,
    /// The hardware-reported local APIC ID does not fit a physical ICR
    /// destination.
    BadLocalId(u32),
}

/// Holds results for local APIC operations.
pub type Result<T> = core::result::Result<T, Error>;

// How register accesses reach the APIC. The mode changes rarely, so a
// matched dispatch beats function pointers; every op inlines to either a
// volatile MMIO access or an MSR access.
enum ApicAccess {
    XApic { window: MmioWindow },
    X2Apic,
}

impl ApicAccess {
    fn read(&self, msrs: &dyn MsrAccess, reg: u32) -> u32 {
        match self {
            Self::XApic { window } => {
                let ptr = mmio_reg(window, (reg << 4) as usize);
                // Safety: `mmio_reg` bounds the offset within the window.
                unsafe { core::ptr::read_volatile(ptr.as_ptr()) }
            }
            Self::X2Apic => msrs.read(X2APIC_MSR_BASE | reg) as u32,
        }
    }

    fn write(&self, msrs: &dyn MsrAccess, reg: u32, val: u32) {
        match self {
            Self::XApic { window } => {
                let ptr = mmio_reg(window, (reg << 4) as usize);
                // Safety: `mmio_reg` bounds the offset within the window.
                unsafe { core::ptr::write_volatile(ptr.as_ptr(), val) };
            }
            Self::X2Apic => msrs.write(X2APIC_MSR_BASE | reg, val as u64),
        }
    }

    fn write_icr(&self, msrs: &dyn MsrAccess, val: u64) {
        match self {
            Self::XApic { window } => {
                let hi = mmio_reg(window, ICR_HI_OFFSET);
                let lo = mmio_reg(window, ICR_LO_OFFSET);
                // The write of the low half triggers delivery; the high half
                // must be globally visible first.
                unsafe {
                    core::ptr::write_volatile(hi.as_ptr(), (val >> 32) as u32);
                    x86_regs::wmb();
                    core::ptr::write_volatile(lo.as_ptr(), val as u32);
                }
            }
            Self::X2Apic => msrs.write(x86_regs::X2APIC_ICR, val),
        }
    }

    fn write_eoi(&self, msrs: &dyn MsrAccess) {
        match self {
            Self::XApic { .. } => self.write(msrs, EOI_REG, 0),
            Self::X2Apic => msrs.write(x86_regs::X2APIC_EOI, 0),
        }
    }
}

fn mmio_reg(window: &MmioWindow, offset: usize) -> NonNull<u32> {
    assert!(offset + 4 <= hyp_pages::PAGE_SIZE_4K as usize);
    // Safety: offset is within the 4kB window, checked above.
    unsafe { NonNull::new_unchecked(window.as_ptr().as_ptr().add(offset) as *mut u32) }
}

/// The per-vCPU local APIC shim.
pub struct Lapic {
    msrs: &'static dyn MsrAccess,
    mapper: &'static dyn HostMapper,
    base_msr: u64,
    access: ApicAccess,
    local_id: u32,
    // Two 32-bit MMIO writes compose an xAPIC ICR write; they must not
    // interleave between vCPU threads sharing the window.
    icr_lock: Mutex<()>,
}

impl core::fmt::Debug for Lapic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Lapic")
            .field("base_msr", &self.base_msr)
            .field("local_id", &self.local_id)
            .finish()
    }
}

impl Lapic {
    /// Creates the shim for the current CPU's local APIC, snapshotting its
    /// mode from `IA32_APIC_BASE`. `translate_gpa` is the root guest's
    /// second-level translation; the xAPIC page must be identity-mapped in
    /// it, since the guest programs the same physical APIC.
    pub fn new(
        msrs: &'static dyn MsrAccess,
        mapper: &'static dyn HostMapper,
        translate_gpa: impl Fn(Hpa) -> Option<Hpa>,
    ) -> Result<Self> {
        let base_msr = msrs.read(IA32_APIC_BASE);
        let access = match apic_state(base_msr) {
            ApicState::XApic => Self::init_xapic(mapper, base_msr, &translate_gpa)?,
            ApicState::X2Apic => ApicAccess::X2Apic,
            state => return Err(Error::UnsupportedState(state)),
        };

        let mut lapic = Self {
            msrs,
            mapper,
            base_msr,
            access,
            local_id: 0,
            icr_lock: Mutex::new(()),
        };
        lapic.local_id = lapic.read_local_id();
        if lapic.local_id >= 0xff {
            return Err(Error::BadLocalId(lapic.local_id));
        }
        Ok(lapic)
    }

    fn init_xapic(
        mapper: &'static dyn HostMapper,
        base_msr: u64,
        translate_gpa: &impl Fn(Hpa) -> Option<Hpa>,
    ) -> Result<ApicAccess> {
        let hpa = Hpa::new(apic_base_addr(base_msr));
        if translate_gpa(hpa) != Some(hpa) {
            return Err(Error::NotIdentityMapped(hpa));
        }
        let window = mapper.map_uncached(hpa).ok_or(Error::WindowUnavailable)?;
        Ok(ApicAccess::XApic { window })
    }

    fn read_local_id(&self) -> u32 {
        let id = self.read(ID_REG);
        match self.access {
            ApicAccess::XApic { .. } => id >> 24,
            ApicAccess::X2Apic => id,
        }
    }

    /// Reads APIC register `reg` through the current access path.
    pub fn read(&self, reg: u32) -> u32 {
        self.access.read(self.msrs, reg)
    }

    /// Writes APIC register `reg` through the current access path.
    pub fn write(&self, reg: u32, val: u32) {
        self.access.write(self.msrs, reg, val)
    }

    /// Writes the full 64-bit interrupt command register.
    pub fn write_icr(&self, val: u64) {
        self.access.write_icr(self.msrs, val)
    }

    /// Signals end-of-interrupt.
    pub fn write_eoi(&self) {
        self.access.write_eoi(self.msrs)
    }

    /// Sends a fixed IPI with `vector` to this CPU, in physical destination
    /// mode using the cached local APIC ID.
    ///
    /// This must *not* read the APIC: MSI mapping code relies on IPI
    /// emission using only the ID cached at construction.
    pub fn write_ipi_fixed(&self, vector: u8) {
        // Only the xAPIC path needs the lock; its ICR write is two MMIO
        // stores.
        let _guard = match self.access {
            ApicAccess::XApic { .. } => Some(self.icr_lock.lock()),
            ApicAccess::X2Apic => None,
        };

        let mut icr = 0u64;
        icr |= (self.local_id as u64) << 56;
        icr |= ICR_LEVEL_ASSERT;
        icr |= vector as u64;
        self.write_icr(icr);
    }

    /// Broadcasts an INIT IPI to every CPU but this one.
    pub fn write_ipi_init_all_not_self(&self) {
        let _guard = self.icr_lock.lock();

        let icr = ICR_DELIVERY_INIT | ICR_LEVEL_ASSERT | ICR_DEST_ALL_NOT_SELF;
        self.write_icr(icr);
    }

    /// Returns the local APIC ID cached at construction.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Returns the logical destination ID the guest has programmed.
    pub fn logical_id(&self) -> u32 {
        let reg = self.read(LDR_REG);
        match self.access {
            ApicAccess::XApic { .. } => reg >> 24,
            ApicAccess::X2Apic => reg,
        }
    }

    /// Returns the xAPIC destination format model (flat/cluster).
    pub fn dest_model(&self) -> u32 {
        debug_assert!(self.is_xapic());
        self.read(DFR_REG) >> 28
    }

    /// Returns whether the last ICR write used logical destination mode.
    pub fn logical_dest(&self) -> bool {
        (self.read(ICR_REG) >> 11) & 1 != 0
    }

    /// Returns true if the shim is in xAPIC (MMIO) mode.
    pub fn is_xapic(&self) -> bool {
        matches!(self.access, ApicAccess::XApic { .. })
    }

    /// Returns true if the shim is in x2APIC (MSR) mode.
    pub fn is_x2apic(&self) -> bool {
        matches!(self.access, ApicAccess::X2Apic)
    }

    /// Returns the raw `IA32_APIC_BASE` value the shim last committed.
    pub fn base_msr(&self) -> u64 {
        self.base_msr
    }

    fn current_xapic_hpa(&self) -> Option<Hpa> {
        match &self.access {
            ApicAccess::XApic { window } => Some(window.hpa()),
            ApicAccess::X2Apic => None,
        }
    }

    fn commit_base(&mut self, val: u64) {
        self.base_msr = val;
        self.msrs.write(IA32_APIC_BASE, val);
    }

    /// Emulates a guest write to `IA32_APIC_BASE`, re-moding the access path
    /// to match before committing the value to hardware.
    pub fn emulate_base_wrmsr(
        &mut self,
        val: u64,
        translate_gpa: impl Fn(Hpa) -> Option<Hpa>,
    ) -> Result<()> {
        enum Plan {
            EnterX2Apic,
            MoveWindow,
            ReinitXApic,
            CommitOnly,
            Nothing,
        }

        let new_state = apic_state(val);
        let new_hpa = Hpa::new(apic_base_addr(val));
        let plan = match (new_state, self.current_xapic_hpa()) {
            (ApicState::X2Apic, Some(_)) => Plan::EnterX2Apic,
            (ApicState::X2Apic, None) => Plan::Nothing,
            (ApicState::XApic, Some(hpa)) if hpa != new_hpa => Plan::MoveWindow,
            (ApicState::XApic, Some(_)) => Plan::Nothing,
            (ApicState::XApic, None) => Plan::ReinitXApic,
            // Disabled or reset: commit and let the hardware follow.
            _ => Plan::CommitOnly,
        };

        match plan {
            Plan::EnterX2Apic => {
                // Dropping the old access frees the MMIO window.
                self.access = ApicAccess::X2Apic;
                self.commit_base(val);
            }
            Plan::MoveWindow => {
                if translate_gpa(new_hpa) != Some(new_hpa) {
                    return Err(Error::NotIdentityMapped(new_hpa));
                }
                if let ApicAccess::XApic { window } = &mut self.access {
                    window.retarget(new_hpa).ok_or(Error::WindowUnavailable)?;
                }
                self.commit_base(val);
            }
            Plan::ReinitXApic => {
                // Re-entering xAPIC from x2APIC or a reset: bring the window
                // back up and re-learn the hardware ID.
                self.access = Self::init_xapic(self.mapper, val, &translate_gpa)?;
                self.commit_base(val);
                self.local_id = self.read_local_id();
            }
            Plan::CommitOnly => self.commit_base(val),
            Plan::Nothing => {}
        }
        Ok(())
    }
}
