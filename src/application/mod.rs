//! Application services layer.

pub mod error;
pub mod limiter;
pub mod repos;
pub mod serving;
pub mod stream;
