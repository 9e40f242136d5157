//! Rate value object with burst-driven normalization.

use tracing::warn;

use crate::error::{FloodgateError, Result};

/// Minimum period resolution in milliseconds.
const MIN_PERIOD_MS: f64 = 1.0;

/// An immutable permit-issuance rate: `events` permits per `period`
/// milliseconds.
///
/// Construction normalizes the requested rate against a burst bound so that
/// no more than `burst` permits are ever issued at once; see [`Rate::new`].
/// Thread-safe by immutability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rate {
    events: f64,
    period: f64,
}

impl Rate {
    /// The rate at which nothing is ever dispatched.
    pub const ZERO: Rate = Rate {
        events: 0.0,
        period: 1.0,
    };

    /// An effectively unbounded rate, used for forced drains.
    pub const MAX: Rate = Rate {
        events: u32::MAX as f64,
        period: 1.0,
    };

    /// Build a normalized rate.
    ///
    /// * `burst < events`: the period is rescaled to `period * burst /
    ///   events` so that at most `burst` permits are issued per (shorter)
    ///   period, preserving overall throughput. A rescaled period below 1ms
    ///   is clamped to 1ms and the burst is inflated to compensate; the
    ///   requested burst cannot be fully honored in that case and a warning
    ///   is logged. Requesting the rescale with `burst == 0` is
    ///   unsatisfiable at any resolution and fails.
    /// * `0 < events < 1`: the period is stretched to `period / events` and
    ///   exactly one permit is issued per stretched period.
    /// * otherwise the values are used unchanged.
    pub fn new(events: f64, period_ms: f64, burst: u32) -> Result<Rate> {
        if !events.is_finite() || events < 0.0 {
            return Err(FloodgateError::InvalidArgument(
                "events",
                format!("must be finite and non-negative, got {}", events),
            ));
        }
        if !period_ms.is_finite() || period_ms <= 0.0 {
            return Err(FloodgateError::InvalidArgument(
                "period_ms",
                format!("must be finite and positive, got {}", period_ms),
            ));
        }

        let burst_events = f64::from(burst);
        if burst_events < events {
            if burst == 0 {
                return Err(FloodgateError::UnsatisfiableBurst { burst });
            }
            let mut period = period_ms * burst_events / events;
            let mut events = burst_events;
            if period < MIN_PERIOD_MS {
                events = (burst_events / period).round();
                warn!(
                    burst,
                    inflated = events,
                    "Burst not honorable at 1ms resolution; inflating"
                );
                period = MIN_PERIOD_MS;
            }
            Ok(Rate { events, period })
        } else if events > 0.0 && events < 1.0 {
            Ok(Rate {
                events: 1.0,
                period: period_ms / events,
            })
        } else {
            Ok(Rate {
                events,
                period: period_ms,
            })
        }
    }

    /// Permits issued per period, rounded to the nearest integer.
    pub fn events(&self) -> u32 {
        self.events.round() as u32
    }

    /// Period length in whole milliseconds, rounded.
    pub fn period(&self) -> u64 {
        self.period.round() as u64
    }

    /// Exact permits per period.
    pub fn events_raw(&self) -> f64 {
        self.events
    }

    /// Exact period in milliseconds.
    pub fn period_raw(&self) -> f64 {
        self.period
    }

    /// Permits per millisecond: the scale-free form used to compare rates
    /// with different periods.
    pub(crate) fn per_ms(&self) -> f64 {
        self.events / self.period
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_below_events_rescales_period() {
        let rate = Rate::new(10.0, 1000.0, 5).unwrap();

        assert_eq!(rate.events(), 5);
        assert_eq!(rate.period(), 500);
        // Throughput is preserved by the rescale.
        assert!((rate.per_ms() - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_sub_millisecond_rescale_clamps_and_inflates() {
        let rate = Rate::new(1000.0, 1.0, 1).unwrap();

        assert_eq!(rate.period(), 1);
        assert_eq!(rate.events(), 1000);
    }

    #[test]
    fn test_fractional_events_stretch_period() {
        let rate = Rate::new(0.5, 1000.0, 10).unwrap();

        assert_eq!(rate.events(), 1);
        assert_eq!(rate.period(), 2000);
    }

    #[test]
    fn test_zero_burst_with_rescale_is_unsatisfiable() {
        let result = Rate::new(5.0, 1000.0, 0);

        assert!(matches!(
            result,
            Err(FloodgateError::UnsatisfiableBurst { burst: 0 })
        ));
    }

    #[test]
    fn test_zero_burst_without_rescale_is_accepted() {
        let rate = Rate::new(0.0, 1000.0, 0).unwrap();

        assert_eq!(rate.events(), 0);
        assert_eq!(rate.period(), 1000);
    }

    #[test]
    fn test_invalid_arguments() {
        assert!(Rate::new(-1.0, 1000.0, 1).is_err());
        assert!(Rate::new(f64::NAN, 1000.0, 1).is_err());
        assert!(Rate::new(1.0, 0.0, 1).is_err());
        assert!(Rate::new(1.0, -5.0, 1).is_err());
        assert!(Rate::new(f64::INFINITY, 1000.0, 1).is_err());
    }

    #[test]
    fn test_rounded_and_raw_accessors() {
        let rate = Rate::new(2.5, 1000.0, 10).unwrap();

        assert_eq!(rate.events(), 3);
        assert_eq!(rate.events_raw(), 2.5);
        assert_eq!(rate.period(), 1000);
        assert_eq!(rate.period_raw(), 1000.0);
    }

    #[test]
    fn test_equality_by_raw_fields() {
        let a = Rate::new(5.0, 1000.0, 10).unwrap();
        let b = Rate::new(5.0, 1000.0, 10).unwrap();
        let c = Rate::new(5.0, 2000.0, 10).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_constants() {
        assert_eq!(Rate::ZERO.events(), 0);
        assert_eq!(Rate::ZERO.period(), 1);
        assert_eq!(Rate::MAX.events(), u32::MAX);
        assert_eq!(Rate::MAX.period(), 1);
    }
}
