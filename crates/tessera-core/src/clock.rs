//! Period counter for a model run.
//!
//! The clock is the single source of truth for the current period `t`.
//! It starts at 0 and only ever moves forward, one period at a time, after
//! every stage of the period has run.

/// Errors that can occur during clock operations.
#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    /// Period counter would overflow.
    #[error("period counter overflow: cannot advance beyond u64::MAX")]
    PeriodOverflow,
}

/// Monotonic period counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeriodClock {
    /// Number of completed periods (the index of the period about to run).
    period: u64,
}

impl PeriodClock {
    /// Create a clock at period 0.
    pub const fn new() -> Self {
        Self { period: 0 }
    }

    /// Create a clock at an explicit period (state restoration, tests).
    pub const fn at(period: u64) -> Self {
        Self { period }
    }

    /// Advance the clock by one period. Returns the new period number.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::PeriodOverflow`] if the counter would exceed
    /// `u64::MAX`.
    pub fn advance(&mut self) -> Result<u64, ClockError> {
        self.period = self
            .period
            .checked_add(1)
            .ok_or(ClockError::PeriodOverflow)?;
        Ok(self.period)
    }

    /// Return the current period number.
    pub const fn period(&self) -> u64 {
        self.period
    }

    /// Return the index of the most recently completed period, if any.
    pub const fn last_completed(&self) -> Option<u64> {
        self.period.checked_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_starts_at_period_zero() {
        let clock = PeriodClock::new();
        assert_eq!(clock.period(), 0);
        assert_eq!(clock.last_completed(), None);
    }

    #[test]
    fn clock_advances() {
        let mut clock = PeriodClock::new();
        assert!(matches!(clock.advance(), Ok(1)));
        assert!(matches!(clock.advance(), Ok(2)));
        assert_eq!(clock.last_completed(), Some(1));
    }

    #[test]
    fn clock_refuses_to_overflow() {
        let mut clock = PeriodClock::at(u64::MAX);
        assert!(clock.advance().is_err());
        assert_eq!(clock.period(), u64::MAX);
    }
}
