use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the addressing and dispatch layer.
///
/// None of these are retried here. `OutOfRange` and `ShapeMismatch` indicate
/// upstream bugs; `AllocationExhausted` is the scheduler's signal to evict or
/// reject; `Kernel` aborts the whole step, since a partially attended batch
/// has no usable output.
#[derive(Debug, Error)]
pub enum Error {
    #[error("logical position {position} out of range for allocated capacity {capacity}")]
    OutOfRange { position: usize, capacity: usize },

    #[error("block pool exhausted: {requested} blocks requested, {available} free")]
    AllocationExhausted { requested: usize, available: usize },

    #[error("shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("attention kernel failed: {0}")]
    Kernel(#[from] candle_core::Error),
}
