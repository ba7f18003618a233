// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! VMX basic exit reasons, as reported in the VMCS exit-reason field.

/// The subset of basic exit reasons the hypervisor routes or traces. The
/// discriminants are the architectural encodings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum BasicExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InterruptWindow = 7,
    Cpuid = 10,
    Hlt = 12,
    Vmcall = 18,
    CrAccess = 28,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    EptViolation = 48,
    EptMisconfiguration = 49,
    Xsetbv = 55,
}

impl BasicExitReason {
    /// Decodes the low bits of a VMCS exit-reason field. The full field
    /// carries flag bits above bit 15 which callers mask off first.
    pub fn from_raw(raw: u32) -> Option<Self> {
        use BasicExitReason::*;
        let reason = match raw {
            0 => ExceptionOrNmi,
            1 => ExternalInterrupt,
            2 => TripleFault,
            7 => InterruptWindow,
            10 => Cpuid,
            12 => Hlt,
            18 => Vmcall,
            28 => CrAccess,
            30 => IoInstruction,
            31 => Rdmsr,
            32 => Wrmsr,
            48 => EptViolation,
            49 => EptMisconfiguration,
            55 => Xsetbv,
            _ => return None,
        };
        Some(reason)
    }

    /// Returns a short human-readable name for trace output.
    pub fn name(&self) -> &'static str {
        use BasicExitReason::*;
        match self {
            ExceptionOrNmi => "exception_or_nmi",
            ExternalInterrupt => "external_interrupt",
            TripleFault => "triple_fault",
            InterruptWindow => "interrupt_window",
            Cpuid => "cpuid",
            Hlt => "hlt",
            Vmcall => "vmcall",
            CrAccess => "cr_access",
            IoInstruction => "io_instruction",
            Rdmsr => "rdmsr",
            Wrmsr => "wrmsr",
            EptViolation => "ept_violation",
            EptMisconfiguration => "ept_misconfiguration",
            Xsetbv => "xsetbv",
        }
    }
}

impl core::fmt::Display for BasicExitReason {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.write_str(self.name())
    }
}
