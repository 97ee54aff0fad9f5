//! Common utilities and types

pub mod error;
pub mod net;
pub mod timeout;

pub use error::{Error, Result};
pub use net::TimedStream;
pub use timeout::{Phase, TimeoutPolicy};
