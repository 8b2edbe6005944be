//! Call-site capture for the user-origin `{file, line}` pair the public API
//! threads through every allocating call.
//!
//! `#[track_caller]` plus `std::panic::Location::caller()` propagates the
//! original external call site transitively through every function in the
//! chain down to here, with no macro or hidden global state needed.

use std::fmt;
use std::panic::Location;

/// Where an allocation was requested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    pub file: &'static str,
    pub line: u32,
}

impl Origin {
    #[track_caller]
    pub(crate) fn capture() -> Self {
        let location = Location::caller();
        Self {
            file: location.file(),
            line: location.line(),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}
