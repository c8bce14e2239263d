pub mod morton;

use thiserror::Error;

/// Basic Filter trait, not constrained to Morton filters.
///
/// Keys are opaque byte strings; a filter may refuse an insert when it runs
/// out of room, but lookups always answer.
pub trait Filter {
    fn insert(self: &mut Self, key: &[u8]) -> Result<(), FilterError>;

    fn contains(self: &Self, key: &[u8]) -> bool;

    fn fp_rate(self: &Self) -> f64;
}

/// An error surfaced by filter construction or mutation.
#[derive(Error, Debug)]
pub enum FilterError {
    /// The eviction loop gave up; the filter is overfull. State remains
    /// well-formed, but the pending fingerprint was dropped.
    #[error("filter overfull, gave up after {kicks} evictions")]
    CapacityExhausted { kicks: usize },

    /// An internal predicate failed. This is a bug, not an input problem.
    #[error("internal invariant broken: {0}")]
    InvariantViolation(&'static str),

    /// Construction parameters are inconsistent.
    #[error("invalid parameter {param}: {constraint}, got {value}")]
    ParameterError {
        param: &'static str,
        constraint: &'static str,
        value: usize,
    },
}
