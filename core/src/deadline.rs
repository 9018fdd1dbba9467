use std::fmt;
use std::time::{Duration, Instant};

/// Wire granularity for deadline transfer. The header carries remaining
/// whole milliseconds, so sub-millisecond remainders round up.
pub const WIRE_GRANULARITY: Duration = Duration::from_millis(1);

/// An absolute instant after which a call must fail with
/// `deadline_exceeded`.
///
/// A deadline is chosen at call creation and is immutable afterwards.
/// Two sentinels exist: [`Deadline::infinite`] (no deadline) and
/// [`Deadline::past`] (already expired at creation).
///
/// On the wire a deadline travels as *remaining* milliseconds computed
/// at send time; the receiving peer reconstructs an absolute instant
/// against its own clock. The two peers therefore agree only within
/// network latency and scheduling skew, never exactly.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// No deadline: the call runs until completed or cancelled.
    #[inline]
    pub fn infinite() -> Self {
        Self { at: None }
    }

    /// A deadline that has already expired.
    #[inline]
    pub fn past() -> Self {
        Self { at: Some(Instant::now()) }
    }

    #[inline]
    pub fn after(timeout: Duration) -> Self {
        Self { at: Some(Instant::now() + timeout) }
    }

    #[inline]
    pub fn at(instant: Instant) -> Self {
        Self { at: Some(instant) }
    }

    #[inline]
    pub fn is_infinite(&self) -> bool {
        self.at.is_none()
    }

    #[inline]
    pub fn instant(&self) -> Option<Instant> {
        self.at
    }

    #[inline]
    pub fn expired(&self) -> bool {
        match self.at {
            None => false,
            Some(at) => at <= Instant::now(),
        }
    }

    /// Time left until expiry. `None` for the infinite sentinel, zero
    /// once expired.
    #[inline]
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Remaining whole milliseconds for the wire header, rounded up so
    /// a nearly-elapsed deadline never serializes as "no time left"
    /// while still unexpired. Absent means no deadline.
    #[inline]
    pub fn to_wire_ms(&self) -> Option<u64> {
        let left = self.remaining()?;
        let ms = (left.as_nanos() + WIRE_GRANULARITY.as_nanos() - 1) / WIRE_GRANULARITY.as_nanos();
        Some(ms as u64)
    }

    /// Reconstruct an absolute deadline from a received header value.
    #[inline]
    pub fn from_wire_ms(ms: Option<u64>) -> Self {
        match ms {
            None => Self::infinite(),
            Some(ms) => Self::after(Duration::from_millis(ms)),
        }
    }
}

impl fmt::Display for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.remaining() {
            None => write!(f, "inf"),
            Some(left) => write!(f, "{}ms", left.as_millis()),
        }
    }
}

impl fmt::Debug for Deadline {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels() {
        assert!(Deadline::infinite().is_infinite());
        assert!(!Deadline::infinite().expired());
        assert!(Deadline::past().expired());
        assert_eq!(Deadline::infinite().to_wire_ms(), None);
    }

    #[test]
    fn test_wire_round_trip() {
        let d = Deadline::after(Duration::from_secs(7 * 24 * 3600));
        let ms = d.to_wire_ms().expect("finite");
        let d2 = Deadline::from_wire_ms(Some(ms));
        let a = d.remaining().unwrap();
        let b = d2.remaining().unwrap();
        let skew = if a > b { a - b } else { b - a };
        assert!(skew < Duration::from_secs(5), "skew {:?}", skew);
    }

    #[test]
    fn test_expired_serializes_as_zero() {
        let d = Deadline::past();
        assert_eq!(d.to_wire_ms(), Some(0));
    }
}
