//! Candidate selection
//!
//! Slaves are picked uniformly at random among the currently eligible ones.

use rand::Rng;

/// Pick one element uniformly at random
#[must_use]
pub fn pick_random<T>(candidates: &[T]) -> Option<&T> {
    if candidates.is_empty() {
        return None;
    }
    let index = rand::thread_rng().gen_range(0..candidates.len());
    Some(&candidates[index])
}
