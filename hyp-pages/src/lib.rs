// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # Hypervisor page types
//!
//! - `Gpa`/`Gfn` and `Hpa`/`Hfn` are the guest-physical and host-physical
//!   address/frame types used throughout the hypervisor.
//! - `VmmPage` is the basic building block for VMM-owned 4kB pages.
//! - `HostMapper` abstracts resolving host-physical frames to VMM-virtual
//!   pointers and installing short-lived mappings.
#![no_std]

extern crate alloc;

// For testing use the std crate.
#[cfg(test)]
#[macro_use]
extern crate std;

mod addr;
mod domain_id;
mod map;
mod page;

pub use addr::{Gfn, Gpa, Hfn, Hpa, PAGE_MASK_4K, PAGE_SHIFT_4K, PAGE_SIZE_4K};
pub use domain_id::DomainId;
pub use map::{HostMapper, IdentityMap, MmioWindow, TempPage, IDENTITY_MAP};
pub use page::VmmPage;
