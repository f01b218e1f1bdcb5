//! Shared initialization helpers for ferrite components.

pub mod logging;

pub use logging::{init_logging, init_logging_json};
