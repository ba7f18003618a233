// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use hyp_pages::Hpa;

/// Errors resulting from interacting with a VT-d remapping unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The DRHD register block could not be mapped into VMM space.
    RegistersUnavailable(Hpa),
    /// The capability-derived register layout does not fit the mapped page.
    RegistersTooLarge,
    /// The unit supports none of the page-walk levels we can program.
    UnsupportedAgaw(u8),
    /// Failed to allocate a table page.
    OutOfPages,
    /// The unit did not acknowledge a command before the spin bound.
    InvalidationTimeout,
}

/// Holds results for VT-d operations.
pub type Result<T> = core::result::Result<T, Error>;
