pub mod booking;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod error;
pub mod limits;
pub mod model;
pub mod observability;
pub mod pg;
pub mod store;
pub mod wal;

pub use error::Error;
