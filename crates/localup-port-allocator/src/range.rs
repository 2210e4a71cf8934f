//! Inclusive window of ports the allocator may hand out

use std::fmt;

use crate::error::RangeError;

/// Inclusive port window `[min, max]`, fixed for the lifetime of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    min: u16,
    max: u16,
}

impl PortRange {
    /// Create a new range.
    ///
    /// Port 0 is reserved on the wire for "pick one for me", so it can never
    /// be part of the window.
    pub fn new(min: u16, max: u16) -> Result<Self, RangeError> {
        if min == 0 {
            return Err(RangeError::ZeroPort);
        }
        if min > max {
            return Err(RangeError::Inverted { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> u16 {
        self.min
    }

    pub fn max(&self) -> u16 {
        self.max
    }

    /// Check if port is within this range
    pub fn contains(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }

    /// Ports of the window in ascending order
    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.min..=self.max
    }

}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}
