//! Definition of error and status.

use std::error::Error;
use std::fmt;
use std::result;

/// Status of `HazardGc` operations
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Status {
    /// Current thread still holds guards
    Busy,
    /// Every hazard pointer slot of current thread is in use
    GuardsExhausted,
    /// Collector has fewer hazard pointers per thread than required
    TooFewHazardPointers,
    /// Invalid parameter
    InvalidParam,
    /// Global collector is not constructed
    NotConstructed,
    /// Global collector is already constructed
    AlreadyConstructed,
    /// Collector has been destructed
    Destructed,
    /// Thread local state of current thread is gone
    NotAttached,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error for Status {}

/// Result with `Status` as error
pub type Result<T> = result::Result<T, Status>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_base() {
        let s = Status::Busy;
        let a = format!("{}", s);
        assert_eq!(a, "Busy");
        let r: Result<()> = Err(Status::GuardsExhausted);
        assert_eq!(r.unwrap_err().to_string(), "GuardsExhausted");
    }
}
