// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

mod core;
mod dmar;
mod entry;
mod error;
mod regs;

pub use self::core::{DmaRemapper, VtdUnit};
pub use dmar::{parse_dmar, Bdf, Drhd, ParseError};
pub use entry::{ContextEntry, RootEntry, TranslationType};
pub use error::Error as VtdError;
pub use error::Result as VtdResult;
