//! The capacity-constrained booking write path.

mod capacity;
mod writer;

pub use capacity::{check_capacity, check_fits};
pub use writer::{BookingWriter, RetryPolicy};
