// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use hyp_console::println;
use spin::Mutex;

/// The lifecycle of the VMM as the loader drives it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmmState {
    Unloaded,
    Loaded,
    Running,
    /// A hardware-level failure was reported while starting or stopping a
    /// vCPU. The VMM's state can no longer be trusted; only an unload is
    /// accepted from here.
    Corrupt,
}

/// Errors from VMM state transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The requested transition is not legal from the current state.
    InvalidTransition { from: VmmState },
    /// The VMM is latched corrupt.
    Corrupted,
}

/// Holds results for VMM state transitions.
pub type Result<T> = core::result::Result<T, Error>;

/// Tracks the VMM lifecycle state.
pub struct VmmStateMachine {
    state: Mutex<VmmState>,
}

/// The global VMM state, shared with the loader.
pub static VMM_STATE: VmmStateMachine = VmmStateMachine::new();

impl VmmStateMachine {
    /// Creates a state machine in the unloaded state.
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(VmmState::Unloaded),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> VmmState {
        *self.state.lock()
    }

    fn transition(&self, from: VmmState, to: VmmState) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            VmmState::Corrupt => Err(Error::Corrupted),
            s if s == from => {
                *state = to;
                Ok(())
            }
            s => Err(Error::InvalidTransition { from: s }),
        }
    }

    /// Marks the VMM loaded.
    pub fn load(&self) -> Result<()> {
        self.transition(VmmState::Unloaded, VmmState::Loaded)
    }

    /// Marks the VMM running.
    pub fn start(&self) -> Result<()> {
        self.transition(VmmState::Loaded, VmmState::Running)
    }

    /// Marks the VMM stopped.
    pub fn stop(&self) -> Result<()> {
        self.transition(VmmState::Running, VmmState::Loaded)
    }

    /// Unloads the VMM. This is the one transition accepted from the
    /// corrupt state.
    pub fn unload(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            VmmState::Running => Err(Error::InvalidTransition { from: *state }),
            _ => {
                *state = VmmState::Unloaded;
                Ok(())
            }
        }
    }

    /// Latches the corrupt state after a hardware-level vCPU start/stop
    /// failure.
    pub fn mark_corrupt(&self) {
        let mut state = self.state.lock();
        if *state != VmmState::Corrupt {
            println!("vmm: hardware failure, state is now corrupt");
            *state = VmmState::Corrupt;
        }
    }

    /// Returns whether the VMM is usable for guest execution.
    pub fn is_usable(&self) -> bool {
        !matches!(*self.state.lock(), VmmState::Corrupt)
    }
}

impl Default for VmmStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
