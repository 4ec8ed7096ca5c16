//! Core error types.

use thiserror::Error;

/// Errors from the frame ring.
///
/// Both variants are expected operating conditions, not faults: `Exhausted`
/// means the consumer holds every slot, `Empty` means nothing became ready
/// within the caller's patience.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// Every slot is SENDING; nothing can be evicted for the producer.
    ///
    /// The caller owns the incoming frame and must drop (and count) it.
    #[error("ring exhausted: all slots held by the consumer")]
    Exhausted,

    /// No slot became READY within the acquire timeout.
    #[error("ring empty: no frame became ready in time")]
    Empty,
}
