// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

/// `DomainId` identifies an isolated guest. The 16-bit space matches the PV
/// wire format; the top of the space is reserved for aliases that never name
/// a real domain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DomainId(u16);

impl DomainId {
    /// First id reserved for aliases; real domains live below this.
    pub const FIRST_RESERVED: u16 = 0x7ff0;

    /// Alias for "the domain issuing the hypercall".
    pub const SELF_ALIAS: DomainId = DomainId(0x7ff0);
    /// Marker for an unset or failed lookup.
    pub const INVALID: DomainId = DomainId(0x7ff4);
    /// Alias for the privileged root domain.
    pub const ROOTVM: DomainId = DomainId(0x7ff5);

    /// Creates a `DomainId` naming a real domain. Returns `None` if `id`
    /// falls in the reserved alias range.
    pub const fn new(id: u16) -> Option<Self> {
        if id >= Self::FIRST_RESERVED {
            None
        } else {
            Some(Self(id))
        }
    }

    /// Creates a `DomainId` from wire bits without rejecting aliases. Used
    /// when decoding hypercall arguments, where aliases are legitimate.
    pub const fn from_wire(id: u16) -> Self {
        Self(id)
    }

    /// Returns the raw bits of the id.
    pub const fn bits(&self) -> u16 {
        self.0
    }

    /// Returns true if this id is an alias rather than a real domain.
    pub const fn is_alias(&self) -> bool {
        self.0 >= Self::FIRST_RESERVED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ids_rejected() {
        assert!(DomainId::new(0).is_some());
        assert!(DomainId::new(0x7fef).is_some());
        assert!(DomainId::new(0x7ff0).is_none());
        assert!(DomainId::new(0xffff).is_none());
        assert!(DomainId::SELF_ALIAS.is_alias());
        assert!(DomainId::ROOTVM.is_alias());
        assert!(!DomainId::new(3).unwrap().is_alias());
    }
}
