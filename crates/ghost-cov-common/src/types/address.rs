//! Process-qualified addresses

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one debuggee. On Windows this is the process id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessKey(pub u64);

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A virtual address inside a specific debuggee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub process: ProcessKey,
    pub value: u64,
}

impl Address {
    pub fn new(process: ProcessKey, value: u64) -> Self {
        Self { process, value }
    }

    /// Same process, different address
    pub fn with_value(self, value: u64) -> Self {
        Self {
            process: self.process,
            value,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.process, self.value)
    }
}
