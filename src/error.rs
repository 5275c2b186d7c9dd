// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::io;

/// Failure to add a machine with [`spawn_machine`](crate::spawn_machine).
#[derive(Debug)]
pub enum MachineError {
    /// The configured machine cap has been reached.
    AtCapacity {
        /// The cap at the time of the call, see
        /// [`max_machines`](crate::max_machines).
        max: usize,
    },
    /// The OS refused to create the carrier thread.
    Thread(io::Error),
}

impl fmt::Display for MachineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineError::AtCapacity { max } => {
                write!(f, "machine cap ({max}) reached")
            }
            MachineError::Thread(err) => write!(f, "failed to create machine thread: {err}"),
        }
    }
}

impl core::error::Error for MachineError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            MachineError::AtCapacity { .. } => None,
            MachineError::Thread(err) => Some(err),
        }
    }
}
