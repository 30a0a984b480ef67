use std::marker::PhantomData;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy)]
pub struct Unvalidated;

#[derive(Debug, Clone, Copy)]
pub struct Validated;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParamError {
    #[error("parameter '{name}' must be finite, got {value}")]
    NonFinite { name: &'static str, value: f64 },
    #[error("parameter '{name}' must not be negative, got {value}")]
    Negative { name: &'static str, value: f64 },
    #[error("parameter '{name}' must be greater than zero, got {value}")]
    NotPositive { name: &'static str, value: f64 },
    #[error("parameter '{name}' is read-only")]
    ReadOnly { name: &'static str },
    #[error("parameter '{name}' expects {expected}")]
    TypeMismatch {
        name: &'static str,
        expected: &'static str,
    },
    #[error("parameter index {0} out of range")]
    NoSuchParam(usize),
}

/// A group of load-time parameters that can check its own invariants.
pub trait ParamSet: Copy {
    fn check(&self) -> Result<(), ParamError>;
}

/// Parameter set tagged with whether it has passed [`ParamSet::check`].
///
/// Components only accept `Params<_, Validated>`, so an instance can never be
/// built from thresholds that would stall the state machine.
#[derive(Debug, Clone, Copy)]
pub struct Params<P, State = Unvalidated> {
    inner: P,
    _state: PhantomData<State>,
}

impl<P: ParamSet> Params<P, Unvalidated> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            _state: PhantomData,
        }
    }

    pub fn validate(self) -> Result<Params<P, Validated>, ParamError> {
        self.inner.check()?;
        Ok(Params {
            inner: self.inner,
            _state: PhantomData,
        })
    }
}

impl<P: ParamSet> Params<P, Validated> {
    pub fn get(&self) -> &P {
        &self.inner
    }

    /// Apply a change and re-check; the previous values are kept on error.
    pub fn update(&mut self, change: impl FnOnce(&mut P)) -> Result<(), ParamError> {
        let mut next = self.inner;
        change(&mut next);
        next.check()?;
        self.inner = next;
        Ok(())
    }
}

pub(crate) fn require_positive(name: &'static str, value: f64) -> Result<(), ParamError> {
    require_non_negative(name, value)?;
    if value == 0.0 {
        return Err(ParamError::NotPositive { name, value });
    }
    Ok(())
}

pub(crate) fn require_non_negative(name: &'static str, value: f64) -> Result<(), ParamError> {
    if !value.is_finite() {
        return Err(ParamError::NonFinite { name, value });
    }
    if value < 0.0 {
        return Err(ParamError::Negative { name, value });
    }
    Ok(())
}

/// Seconds as a `Duration`, rounded to whole microseconds so that f32
/// representation error never adds an extra tick.
pub(crate) fn secs(value: f32) -> Duration {
    let micros = (f64::from(value) * 1e6).round();
    if micros.is_finite() && micros > 0.0 {
        Duration::from_micros(micros as u64)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy)]
    struct Window {
        width: f32,
    }

    impl ParamSet for Window {
        fn check(&self) -> Result<(), ParamError> {
            require_positive("width", f64::from(self.width))
        }
    }

    #[test]
    fn rejects_nan_and_infinite() {
        let res = Params::new(Window { width: f32::NAN }).validate();
        assert!(matches!(res, Err(ParamError::NonFinite { .. })));
        let res = Params::new(Window {
            width: f32::INFINITY,
        })
        .validate();
        assert!(matches!(res, Err(ParamError::NonFinite { .. })));
    }

    #[test]
    fn rejects_negative_and_zero() {
        let res = Params::new(Window { width: -1.0 }).validate();
        assert!(matches!(res, Err(ParamError::Negative { name: "width", .. })));
        let res = Params::new(Window { width: 0.0 }).validate();
        assert!(matches!(res, Err(ParamError::NotPositive { .. })));
    }

    #[test]
    fn failed_update_keeps_previous_values() {
        let mut params = Params::new(Window { width: 2.0 }).validate().unwrap();
        assert!(params.update(|w| w.width = -5.0).is_err());
        assert_eq!(params.get().width, 2.0);
        params.update(|w| w.width = 3.0).unwrap();
        assert_eq!(params.get().width, 3.0);
    }

    #[test]
    fn converts_seconds() {
        assert_eq!(secs(1.5), Duration::from_millis(1500));
        assert_eq!(secs(0.1), Duration::from_millis(100));
        assert_eq!(secs(0.0), Duration::ZERO);
    }
}
