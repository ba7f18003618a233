// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Model-specific register indices and bitfields.

use tock_registers::register_bitfields;
use tock_registers::LocalRegisterCopy;

/// Index of the local APIC base register.
pub const IA32_APIC_BASE: u32 = 0x1b;

/// Base of the x2APIC MSR window; register `r` lives at `0x800 | r`.
pub const X2APIC_MSR_BASE: u32 = 0x800;
/// The 64-bit x2APIC interrupt command register.
pub const X2APIC_ICR: u32 = 0x830;
/// The x2APIC end-of-interrupt register.
pub const X2APIC_EOI: u32 = 0x80b;

register_bitfields![u64,
    /// Fields of `IA32_APIC_BASE`.
    pub ApicBase [
        Bsp OFFSET(8) NUMBITS(1),
        Extd OFFSET(10) NUMBITS(1),
        En OFFSET(11) NUMBITS(1),
        Base OFFSET(12) NUMBITS(40),
    ],
];

/// The operating mode the local APIC is in, per `IA32_APIC_BASE.{EN,EXTD}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApicState {
    /// EN=1, EXTD=0: legacy MMIO-programmed mode.
    XApic,
    /// EN=1, EXTD=1: MSR-programmed mode.
    X2Apic,
    /// EN=0, EXTD=0: APIC globally disabled.
    Disabled,
    /// EN=0, EXTD=1: architecturally invalid.
    Invalid,
}

/// Decodes the APIC operating mode from an `IA32_APIC_BASE` value.
pub fn apic_state(base_msr: u64) -> ApicState {
    let reg = LocalRegisterCopy::<u64, ApicBase::Register>::new(base_msr);
    match (reg.is_set(ApicBase::En), reg.is_set(ApicBase::Extd)) {
        (true, false) => ApicState::XApic,
        (true, true) => ApicState::X2Apic,
        (false, false) => ApicState::Disabled,
        (false, true) => ApicState::Invalid,
    }
}

/// Extracts the APIC MMIO base address from an `IA32_APIC_BASE` value.
pub fn apic_base_addr(base_msr: u64) -> u64 {
    let reg = LocalRegisterCopy::<u64, ApicBase::Register>::new(base_msr);
    reg.read(ApicBase::Base) << 12
}

/// Reads an MSR.
///
/// # Safety
///
/// `msr` must be implemented on the current CPU; reading an unimplemented
/// MSR raises #GP.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub unsafe fn rdmsr(msr: u32) -> u64 {
    let (hi, lo): (u32, u32);
    core::arch::asm!("rdmsr", in("ecx") msr, out("edx") hi, out("eax") lo);
    ((hi as u64) << 32) | lo as u64
}

/// Writes an MSR.
///
/// # Safety
///
/// `msr` must be implemented and `val` must be a legal value for it.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub unsafe fn wrmsr(msr: u32, val: u64) {
    let hi = (val >> 32) as u32;
    let lo = val as u32;
    core::arch::asm!("wrmsr", in("ecx") msr, in("edx") hi, in("eax") lo);
}

// MSR access is stubbed out when not running bare-metal; hardware access in
// tests goes through fake `MsrAccess` implementations instead.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub unsafe fn rdmsr(_msr: u32) -> u64 {
    0
}
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub unsafe fn wrmsr(_msr: u32, _val: u64) {}
