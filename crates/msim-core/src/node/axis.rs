//! Axis state machine
//!
//! An axis carries a movement direction, travel limits, an optional
//! discrete validator and the current drive value. Rotational axes hold
//! their value in degrees and turn about `direction` through
//! `center_point`; translational axes hold a length along `direction`.

use glam::{DMat4, DVec3};
use thiserror::Error;

use crate::discrete::DiscreteValidator;

/// Typed outcome of a rejected axis drive request
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum AxisError {
    #[error("axis value {attempted} underflows the minimum limit {min}")]
    Underflow { min: f64, attempted: f64 },
    #[error("axis value {attempted} overflows the maximum limit {max}")]
    Overflow { max: f64, attempted: f64 },
    #[error("axis value {attempted} does not match the discrete position set")]
    DiscreteMismatch { attempted: f64 },
}

/// Drive state shared by rotational and translational axes
#[derive(Debug, Clone, PartialEq)]
pub struct AxisState {
    direction: DVec3,
    initial_direction: DVec3,
    center_point: DVec3,
    min_limit: f64,
    max_limit: f64,
    value: f64,
    initial_value: f64,
    validator: Option<DiscreteValidator>,
}

impl AxisState {
    /// New axis along `direction` with unbounded travel and value 0.
    pub fn new(direction: DVec3) -> Self {
        Self {
            direction,
            initial_direction: direction,
            center_point: DVec3::ZERO,
            min_limit: f64::NEG_INFINITY,
            max_limit: f64::INFINITY,
            value: 0.0,
            initial_value: 0.0,
            validator: None,
        }
    }

    pub fn with_limits(mut self, min: f64, max: f64) -> Self {
        self.min_limit = min;
        self.max_limit = max;
        self
    }

    pub fn with_center(mut self, center: DVec3) -> Self {
        self.center_point = center;
        self
    }

    pub fn with_initial_value(mut self, value: f64) -> Self {
        self.initial_value = value;
        self
    }

    pub fn with_validator(mut self, validator: DiscreteValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn direction(&self) -> DVec3 {
        self.direction
    }

    pub fn initial_direction(&self) -> DVec3 {
        self.initial_direction
    }

    pub fn set_direction(&mut self, direction: DVec3) {
        self.direction = direction;
    }

    pub fn center_point(&self) -> DVec3 {
        self.center_point
    }

    pub fn min_limit(&self) -> f64 {
        self.min_limit
    }

    pub fn max_limit(&self) -> f64 {
        self.max_limit
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn initial_value(&self) -> f64 {
        self.initial_value
    }

    pub fn validator(&self) -> Option<&DiscreteValidator> {
        self.validator.as_ref()
    }

    /// Drive the axis to `value`.
    ///
    /// Underflow, overflow and discrete mismatch are reported as typed
    /// errors; the current value is untouched on failure. No clamping.
    pub fn set_value(&mut self, value: f64) -> Result<(), AxisError> {
        if value < self.min_limit {
            return Err(AxisError::Underflow {
                min: self.min_limit,
                attempted: value,
            });
        }
        if value > self.max_limit {
            return Err(AxisError::Overflow {
                max: self.max_limit,
                attempted: value,
            });
        }
        if let Some(validator) = &self.validator {
            if !validator.accepts(value) {
                return Err(AxisError::DiscreteMismatch { attempted: value });
            }
        }
        self.value = value;
        Ok(())
    }

    /// Drive the axis back to its initial value and direction.
    pub fn reset(&mut self) {
        self.value = self.initial_value;
        self.direction = self.initial_direction;
    }

    /// The local matrix induced by the current value.
    ///
    /// Rotational: rotation of `value` degrees about `direction` through
    /// `center_point`. Translational: translation of `value` along the
    /// normalized `direction`.
    pub fn value_matrix(&self, rotational: bool) -> DMat4 {
        let dir = self.direction.try_normalize().unwrap_or(DVec3::Z);
        if rotational {
            DMat4::from_translation(self.center_point)
                * DMat4::from_axis_angle(dir, self.value.to_radians())
                * DMat4::from_translation(-self.center_point)
        } else {
            DMat4::from_translation(dir * self.value)
        }
    }

    /// Rescale the length-valued state of a translational axis.
    pub(crate) fn scale_translational(&mut self, factor: f64) {
        self.value *= factor;
        self.initial_value *= factor;
        if self.min_limit.is_finite() {
            self.min_limit *= factor;
        }
        if self.max_limit.is_finite() {
            self.max_limit *= factor;
        }
        match &mut self.validator {
            Some(DiscreteValidator::List(values)) => {
                for v in values {
                    *v *= factor;
                }
            }
            Some(DiscreteValidator::Stepping { start, step }) => {
                *start *= factor;
                *step *= factor;
            }
            None => {}
        }
    }

    /// Rescale the center point of a rotational axis. Angles stay as is.
    pub(crate) fn scale_rotational(&mut self, factor: f64) {
        self.center_point *= factor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_value_within_limits() {
        let mut axis = AxisState::new(DVec3::Z).with_limits(-90.0, 90.0);
        axis.set_value(45.0).unwrap();
        assert_eq!(axis.value(), 45.0);
    }

    #[test]
    fn test_underflow_and_overflow_keep_value() {
        let mut axis = AxisState::new(DVec3::X).with_limits(-10.0, 10.0);
        axis.set_value(5.0).unwrap();

        let err = axis.set_value(-10.5).unwrap_err();
        assert_eq!(
            err,
            AxisError::Underflow {
                min: -10.0,
                attempted: -10.5
            }
        );
        assert_eq!(axis.value(), 5.0);

        let err = axis.set_value(11.0).unwrap_err();
        assert_eq!(
            err,
            AxisError::Overflow {
                max: 10.0,
                attempted: 11.0
            }
        );
        assert_eq!(axis.value(), 5.0);
    }

    #[test]
    fn test_discrete_mismatch() {
        let mut axis = AxisState::new(DVec3::Z)
            .with_limits(0.0, 360.0)
            .with_validator(DiscreteValidator::Stepping {
                start: 0.0,
                step: 90.0,
            });
        axis.set_value(180.0).unwrap();
        let err = axis.set_value(45.0).unwrap_err();
        assert_eq!(err, AxisError::DiscreteMismatch { attempted: 45.0 });
        assert_eq!(axis.value(), 180.0);
    }

    #[test]
    fn test_translational_value_matrix() {
        let mut axis = AxisState::new(DVec3::new(0.0, 0.0, 2.0));
        axis.set_value(7.0).unwrap();
        let m = axis.value_matrix(false);
        let p = m.transform_point3(DVec3::ZERO);
        assert!((p - DVec3::new(0.0, 0.0, 7.0)).length() < 1e-12);
    }

    #[test]
    fn test_rotational_value_matrix_about_center() {
        let mut axis = AxisState::new(DVec3::Z).with_center(DVec3::new(1.0, 0.0, 0.0));
        axis.set_value(180.0).unwrap();
        let m = axis.value_matrix(true);
        // The center stays fixed; the origin mirrors through it.
        let c = m.transform_point3(DVec3::new(1.0, 0.0, 0.0));
        assert!((c - DVec3::new(1.0, 0.0, 0.0)).length() < 1e-9);
        let o = m.transform_point3(DVec3::ZERO);
        assert!((o - DVec3::new(2.0, 0.0, 0.0)).length() < 1e-9);
    }

    #[test]
    fn test_zero_direction_falls_back_to_z() {
        let mut axis = AxisState::new(DVec3::ZERO);
        axis.set_value(3.0).unwrap();
        let p = axis.value_matrix(false).transform_point3(DVec3::ZERO);
        assert!((p - DVec3::new(0.0, 0.0, 3.0)).length() < 1e-12);
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let mut axis = AxisState::new(DVec3::X).with_initial_value(2.0);
        axis.set_value(9.0).unwrap();
        axis.set_direction(DVec3::Y);
        axis.reset();
        assert_eq!(axis.value(), 2.0);
        assert_eq!(axis.direction(), DVec3::X);
    }
}
