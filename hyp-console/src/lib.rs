// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # Hypervisor console
//!
//! Formatted output for the hypervisor core. The actual sink (serial, xhci
//! debug, ...) is provided by the platform layer through `ConsoleWriter`;
//! until one is registered, output is discarded.
#![no_std]

use spin::Mutex;

/// Interface for a console sink.
pub trait ConsoleWriter: Sync {
    /// Writes `bytes` to the console.
    fn write_bytes(&self, bytes: &[u8]);
}

/// The system console, used by the `print!` and `println!` macros.
pub struct Console {
    writer: Option<&'static dyn ConsoleWriter>,
}

impl Console {
    const fn new() -> Self {
        Self { writer: None }
    }

    /// Registers `writer` as the sink for all console output.
    pub fn set_writer(writer: &'static dyn ConsoleWriter) {
        CONSOLE.lock().writer = Some(writer);
    }
}

/// The `Console` singleton.
pub static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

impl core::fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        if let Some(w) = self.writer {
            w.write_bytes(s.as_bytes());
        }
        Ok(())
    }
}

/// `print` macro writing to the system console.
#[macro_export]
macro_rules! print {
    ($($args:tt)*) => {
        {
            use core::fmt::Write;
            let _ = write!($crate::CONSOLE.lock(), $($args)*);
        }
    };
}

/// `println` macro writing to the system console.
#[macro_export]
macro_rules! println {
    ($($args:tt)*) => {
        {
            use core::fmt::Write;
            let _ = writeln!($crate::CONSOLE.lock(), $($args)*);
        }
    };
}
