// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use static_assertions::const_assert;
use tock_registers::register_bitfields;
use tock_registers::registers::{ReadOnly, ReadWrite};

// VT-d register definitions; see the Intel VT-d architecture specification,
// chapter 11 (register descriptions).

register_bitfields![u64,
    pub Capability [
        Nd OFFSET(0) NUMBITS(3),
        Rwbf OFFSET(4) NUMBITS(1),
        Plmr OFFSET(5) NUMBITS(1),
        Phmr OFFSET(6) NUMBITS(1),
        Cm OFFSET(7) NUMBITS(1),
        Sagaw OFFSET(8) NUMBITS(5),
        Mgaw OFFSET(16) NUMBITS(6),
        Zlr OFFSET(22) NUMBITS(1),
        Fro OFFSET(24) NUMBITS(10),
        Sllps OFFSET(34) NUMBITS(4),
        Psi OFFSET(39) NUMBITS(1),
        Nfr OFFSET(40) NUMBITS(8),
        Mamv OFFSET(48) NUMBITS(6),
        Dwd OFFSET(54) NUMBITS(1),
        Drd OFFSET(55) NUMBITS(1),
    ],

    pub ExtendedCapability [
        C OFFSET(0) NUMBITS(1),
        Qi OFFSET(1) NUMBITS(1),
        Dt OFFSET(2) NUMBITS(1),
        Ir OFFSET(3) NUMBITS(1),
        Eim OFFSET(4) NUMBITS(1),
        Pt OFFSET(6) NUMBITS(1),
        Sc OFFSET(7) NUMBITS(1),
        Iro OFFSET(8) NUMBITS(10),
    ],

    pub ContextCommand [
        Did OFFSET(0) NUMBITS(16),
        Sid OFFSET(16) NUMBITS(16),
        Fm OFFSET(32) NUMBITS(2),
        Caig OFFSET(59) NUMBITS(2),
        Cirg OFFSET(61) NUMBITS(2),
        Icc OFFSET(63) NUMBITS(1),
    ],

    pub Iotlb [
        Did OFFSET(32) NUMBITS(16),
        Dw OFFSET(48) NUMBITS(1),
        Dr OFFSET(49) NUMBITS(1),
        Iaig OFFSET(57) NUMBITS(2),
        Iirg OFFSET(60) NUMBITS(2),
        Ivt OFFSET(63) NUMBITS(1),
    ],

    pub InvalidateAddress [
        Am OFFSET(0) NUMBITS(6),
        Ih OFFSET(6) NUMBITS(1),
        Addr OFFSET(12) NUMBITS(52),
    ],
];

register_bitfields![u32,
    pub GlobalCommand [
        Cfi OFFSET(23) NUMBITS(1),
        Sirtp OFFSET(24) NUMBITS(1),
        Ire OFFSET(25) NUMBITS(1),
        Qie OFFSET(26) NUMBITS(1),
        Wbf OFFSET(27) NUMBITS(1),
        Srtp OFFSET(30) NUMBITS(1),
        Te OFFSET(31) NUMBITS(1),
    ],

    pub GlobalStatus [
        Cfis OFFSET(23) NUMBITS(1),
        Irtps OFFSET(24) NUMBITS(1),
        Ires OFFSET(25) NUMBITS(1),
        Qies OFFSET(26) NUMBITS(1),
        Wbfs OFFSET(27) NUMBITS(1),
        Rtps OFFSET(30) NUMBITS(1),
        Tes OFFSET(31) NUMBITS(1),
    ],

    pub FaultStatus [
        Pfo OFFSET(0) NUMBITS(1),
        Ppf OFFSET(1) NUMBITS(1),
        Afo OFFSET(2) NUMBITS(1),
        Apf OFFSET(3) NUMBITS(1),
        Iqe OFFSET(4) NUMBITS(1),
        Ice OFFSET(5) NUMBITS(1),
        Ite OFFSET(6) NUMBITS(1),
        Fri OFFSET(8) NUMBITS(8),
    ],
];

/// Invalidation granularities shared by the context-cache and IOTLB command
/// encodings.
pub const INVG_GLOBAL: u64 = 1;
pub const INVG_DOMAIN: u64 = 2;
/// Device-selective for the context cache, page-selective for the IOTLB.
pub const INVG_DEVICE_OR_PAGE: u64 = 3;

/// The architectural (fixed-offset) VT-d register block. The IOTLB register
/// pair and the fault recording array live at capability-derived offsets and
/// are reached through `VtdUnit`'s raw accessors instead.
#[repr(C)]
pub struct VtdRegisters {
    pub ver: ReadOnly<u32>,
    _reserved0: u32,
    pub cap: ReadOnly<u64, Capability::Register>,
    pub ecap: ReadOnly<u64, ExtendedCapability::Register>,
    pub gcmd: ReadWrite<u32, GlobalCommand::Register>,
    pub gsts: ReadOnly<u32, GlobalStatus::Register>,
    pub rtaddr: ReadWrite<u64>,
    pub ccmd: ReadWrite<u64, ContextCommand::Register>,
    _reserved1: u32,
    pub fsts: ReadWrite<u32, FaultStatus::Register>,
    pub fectl: ReadWrite<u32>,
    pub fedata: ReadWrite<u32>,
    pub feaddr: ReadWrite<u32>,
    pub feuaddr: ReadWrite<u32>,
    _reserved2: [u32; 4],
    pub aflog: ReadWrite<u64>,
    _reserved3: u32,
    pub pmen: ReadWrite<u32>,
    pub plmbase: ReadWrite<u32>,
    pub plmlimit: ReadWrite<u32>,
    pub phmbase: ReadWrite<u64>,
    pub phmlimit: ReadWrite<u64>,
    pub iqh: ReadWrite<u64>,
    pub iqt: ReadWrite<u64>,
    pub iqa: ReadWrite<u64>,
    _reserved4: u32,
    pub ics: ReadWrite<u32>,
    pub iectl: ReadWrite<u32>,
    pub iedata: ReadWrite<u32>,
    pub ieaddr: ReadWrite<u32>,
    pub ieuaddr: ReadWrite<u32>,
    _reserved5: [u32; 2],
    pub irta: ReadWrite<u64>,
}

const_assert!(core::mem::size_of::<VtdRegisters>() == 0xc0);
