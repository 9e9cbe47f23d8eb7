//! One-shot latch for "first time only" reactions.
//!
//! A `Latch` can be cloned and shared across tasks. Exactly one call to
//! [`Latch::fire`] across all clones observes the transition from open to
//! fired; every other call sees it already fired.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A single-fire flag.
///
/// # Example
///
/// ```
/// use crossport_core::latch::Latch;
///
/// let latch = Latch::new();
/// let clone = latch.clone();
///
/// assert!(latch.fire());
/// assert!(!clone.fire());
/// assert!(clone.is_fired());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Latch {
    fired: Arc<AtomicBool>,
}

impl Latch {
    /// Create a new, unfired latch.
    pub fn new() -> Self {
        Self {
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fire the latch.
    ///
    /// Returns `true` only for the call that actually fired it.
    pub fn fire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Check whether the latch has fired.
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_latch_not_fired() {
        let latch = Latch::new();
        assert!(!latch.is_fired());
    }

    #[test]
    fn test_fire_once() {
        let latch = Latch::new();
        assert!(latch.fire());
        assert!(!latch.fire());
        assert!(latch.is_fired());
    }

    #[test]
    fn test_clone_shares_state() {
        let a = Latch::new();
        let b = a.clone();

        assert!(b.fire());
        assert!(a.is_fired());
        assert!(!a.fire());
    }

    #[test]
    fn test_concurrent_fire_has_single_winner() {
        let latch = Latch::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let latch = latch.clone();
                std::thread::spawn(move || latch.fire())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_default() {
        let latch = Latch::default();
        assert!(!latch.is_fired());
    }
}
