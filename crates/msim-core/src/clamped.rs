//! Range-checked value cell
//!
//! `ClampedValue` guards a value with an inclusive `[min, max]` interval.
//! Setting a value outside the interval fails without mutating; it never
//! silently clamps.

use std::fmt;
use thiserror::Error;

/// Attempted to set a value outside the allowed interval
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("value {attempted} is outside the allowed range [{min}, {max}]")]
pub struct RangeError<T>
where
    T: fmt::Debug + fmt::Display,
{
    pub min: T,
    pub max: T,
    pub attempted: T,
}

/// A value constrained to an inclusive interval
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClampedValue<T> {
    min: T,
    max: T,
    value: T,
}

impl<T> ClampedValue<T>
where
    T: PartialOrd + Copy + fmt::Debug + fmt::Display,
{
    /// Create a new cell. Fails if `value` lies outside `[min, max]`.
    pub fn new(min: T, max: T, value: T) -> Result<Self, RangeError<T>> {
        if value < min || value > max {
            return Err(RangeError {
                min,
                max,
                attempted: value,
            });
        }
        Ok(Self { min, max, value })
    }

    pub fn get(&self) -> T {
        self.value
    }

    pub fn min(&self) -> T {
        self.min
    }

    pub fn max(&self) -> T {
        self.max
    }

    /// Replace the value. The cell is untouched when the check fails.
    pub fn set(&mut self, value: T) -> Result<(), RangeError<T>> {
        if value < self.min || value > self.max {
            return Err(RangeError {
                min: self.min,
                max: self.max,
                attempted: value,
            });
        }
        self.value = value;
        Ok(())
    }
}
