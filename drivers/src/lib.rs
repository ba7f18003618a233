// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # Hardware drivers

#![no_std]

extern crate alloc;

// For testing use the std crate.
#[cfg(test)]
#[macro_use]
extern crate std;

/// Provides the local APIC access shim for root vCPUs.
pub mod lapic;
/// Provides the driver for VT-d DMA-remapping hardware units.
pub mod vtd;
