// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

#![no_std]

//! Crate for handling x86_64 registers and low-level instructions.
//! msr - model-specific register indices, bitfields, and raw access
//! fence - ordering, cache-line flush, and spin-hint instructions
//! exit - VMX basic exit-reason enumeration

mod exit;
mod fence;
mod msr;

pub use exit::*;
pub use fence::*;
pub use msr::*;
