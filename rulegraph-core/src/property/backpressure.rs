//! Backpressure policies for asynchronous recomputation.
//!
//! A policy only matters when a recompute is requested while a previous
//! asynchronous recompute of the same property is still in flight.

use std::time::Duration;

/// What to do with a recompute request that overlaps one in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Start a new recompute that supersedes the one in flight. With a
    /// debounce, the new computation waits until either the in-flight one
    /// settles or the debounce window closes, whichever is first, and is
    /// dropped if yet another request arrived meanwhile.
    Switch {
        /// Debounce window, if any.
        debounce: Option<Duration>,
    },

    /// Drop the request; the caller gets the in-flight result.
    Skip,
}

impl Backpressure {
    /// Debounce used by asynchronous scalars unless configured otherwise.
    pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(40);

    /// `switch` without debounce.
    pub fn switch() -> Self {
        Self::Switch { debounce: None }
    }

    /// `switch` with the given debounce window.
    pub fn debounced(debounce: Duration) -> Self {
        Self::Switch {
            debounce: Some(debounce),
        }
    }

    /// `skip`.
    pub fn skip() -> Self {
        Self::Skip
    }

    pub(crate) fn on_overlap(&self) -> Overlap {
        match *self {
            Self::Switch { debounce: None } => Overlap::StartNow,
            Self::Switch {
                debounce: Some(window),
            } if window.is_zero() => Overlap::StartNow,
            Self::Switch {
                debounce: Some(window),
            } => Overlap::Debounce(window),
            Self::Skip => Overlap::AwaitInFlight,
        }
    }
}

impl Default for Backpressure {
    fn default() -> Self {
        Self::debounced(Self::DEFAULT_DEBOUNCE)
    }
}

/// Decision taken for an overlapping recompute request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Overlap {
    StartNow,
    Debounce(Duration),
    AwaitInFlight,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_switch_with_forty_millis() {
        assert_eq!(
            Backpressure::default(),
            Backpressure::Switch {
                debounce: Some(Duration::from_millis(40))
            }
        );
    }

    #[test]
    fn overlap_decisions() {
        assert_eq!(Backpressure::switch().on_overlap(), Overlap::StartNow);
        assert_eq!(
            Backpressure::debounced(Duration::ZERO).on_overlap(),
            Overlap::StartNow
        );
        assert_eq!(
            Backpressure::default().on_overlap(),
            Overlap::Debounce(Duration::from_millis(40))
        );
        assert_eq!(Backpressure::skip().on_overlap(), Overlap::AwaitInFlight);
    }
}
