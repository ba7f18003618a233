// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use arrayvec::ArrayVec;
use hyp_pages::DomainId;
use spin::Mutex;

/// Most ports a domain can hold open. The grant-table bring-up only needs
/// the xenstore and console channels; the backends allocate the rest.
const MAX_PORTS: usize = 256;

/// An event channel port number. Port numbers start at 1; 0 never names a
/// channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Port(u32);

impl Port {
    /// Returns the wire value of the port.
    pub fn bits(&self) -> u32 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_bits_test(bits: u32) -> Port {
        Port(bits)
    }
}

/// The state of one allocated port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortState {
    /// Allocated, waiting for the remote domain to bind.
    Unbound { remote: DomainId },
    /// Closed; the port number is not reused.
    Closed,
}

/// Errors from event channel operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    OutOfPorts,
    InvalidPort(u32),
}

/// Holds results for event channel operations.
pub type Result<T> = core::result::Result<T, Error>;

/// The per-domain event channel allocator.
///
/// Only the allocation surface the grant table and HVM bring-up consume is
/// implemented here; signal delivery lives with the event backends.
pub struct EventChannels {
    ports: Mutex<ArrayVec<PortState, MAX_PORTS>>,
}

impl EventChannels {
    /// Creates an allocator with no ports in use.
    pub fn new() -> Self {
        Self {
            ports: Mutex::new(ArrayVec::new()),
        }
    }

    /// Allocates a new unbound port for `remote` to bind to.
    pub fn alloc_unbound(&self, remote: DomainId) -> Result<Port> {
        let mut ports = self.ports.lock();
        if ports.is_full() {
            return Err(Error::OutOfPorts);
        }
        ports.push(PortState::Unbound { remote });
        Ok(Port(ports.len() as u32))
    }

    /// Returns the state of `port`.
    pub fn port_state(&self, port: Port) -> Result<PortState> {
        let ports = self.ports.lock();
        let idx = port.0.checked_sub(1).ok_or(Error::InvalidPort(port.0))? as usize;
        ports.get(idx).copied().ok_or(Error::InvalidPort(port.0))
    }

    /// Closes `port`. The number is retired, not recycled.
    pub fn close(&self, port: Port) -> Result<()> {
        let mut ports = self.ports.lock();
        let idx = port.0.checked_sub(1).ok_or(Error::InvalidPort(port.0))? as usize;
        let state = ports.get_mut(idx).ok_or(Error::InvalidPort(port.0))?;
        *state = PortState::Closed;
        Ok(())
    }
}

impl Default for EventChannels {
    fn default() -> Self {
        Self::new()
    }
}
