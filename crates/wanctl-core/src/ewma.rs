//! Exponentially weighted moving average with input and overflow guards.
//!
//! Generalized from the teacher's `scheduler::ewma::Ewma`, which silently
//! drops non-finite samples; here invalid input must propagate as an
//! error so the autorate loop can count it as a probe failure instead of
//! quietly ignoring a poisoned sample.

use crate::error::EwmaError;

#[derive(Debug, Clone)]
pub struct Ewma {
    value: Option<f64>,
    alpha: f64,
    max_value: f64,
}

impl Ewma {
    /// `alpha` must be in `(0, 1)` and `max_value` must be positive and
    /// finite; both are validated at config load time (see
    /// [`crate::config`]), not here, so construction is infallible.
    pub fn new(alpha: f64, max_value: f64) -> Self {
        debug_assert!(alpha > 0.0 && alpha < 1.0);
        debug_assert!(max_value > 0.0 && max_value.is_finite());
        Self {
            value: None,
            alpha,
            max_value,
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Resets to the unset state; used by state-store load to seed from
    /// a persisted value without treating it as the "first sample" for
    /// warm-up purposes.
    pub fn set(&mut self, value: f64) {
        self.value = Some(value);
    }

    pub fn update(&mut self, sample: f64) -> Result<f64, EwmaError> {
        if sample.is_nan() {
            return Err(EwmaError::InvalidInput("sample is NaN".into()));
        }
        if sample.is_infinite() {
            return Err(EwmaError::InvalidInput("sample is infinite".into()));
        }
        if sample < 0.0 {
            return Err(EwmaError::InvalidInput(format!(
                "sample {sample} is negative"
            )));
        }
        if sample > self.max_value {
            return Err(EwmaError::InvalidInput(format!(
                "sample {sample} exceeds max_value {}",
                self.max_value
            )));
        }

        let next = match self.value {
            None => sample,
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
        };

        if next.is_nan() || next.is_infinite() {
            return Err(EwmaError::Overflow);
        }

        self.value = Some(next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_sets_value_directly() {
        let mut e = Ewma::new(0.2, 1000.0);
        assert_eq!(e.update(50.0).unwrap(), 50.0);
        assert_eq!(e.value(), Some(50.0));
    }

    #[test]
    fn subsequent_samples_blend() {
        let mut e = Ewma::new(0.5, 1000.0);
        e.update(10.0).unwrap();
        let v = e.update(20.0).unwrap();
        assert_eq!(v, 15.0);
    }

    #[test]
    fn rejects_nan_without_mutating_state() {
        let mut e = Ewma::new(0.2, 1000.0);
        e.update(10.0).unwrap();
        let err = e.update(f64::NAN).unwrap_err();
        assert_eq!(err, EwmaError::InvalidInput("sample is NaN".into()));
        assert_eq!(e.value(), Some(10.0));
    }

    #[test]
    fn rejects_infinite() {
        let mut e = Ewma::new(0.2, 1000.0);
        assert!(e.update(f64::INFINITY).is_err());
        assert!(e.value().is_none());
    }

    #[test]
    fn rejects_negative() {
        let mut e = Ewma::new(0.2, 1000.0);
        assert!(e.update(-1.0).is_err());
    }

    #[test]
    fn rejects_above_max_value() {
        let mut e = Ewma::new(0.2, 100.0);
        assert!(e.update(100.1).is_err());
    }

    #[test]
    fn accepts_exactly_max_value() {
        let mut e = Ewma::new(0.2, 100.0);
        assert!(e.update(100.0).is_ok());
    }
}
