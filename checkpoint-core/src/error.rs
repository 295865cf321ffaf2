//! Error types for checkpoint configuration

use thiserror::Error;

/// Errors raised while turning configuration into core state machines.
///
/// These are the only errors the core produces; runtime conditions such as
/// a rejected scan are reported as events, not errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Barcode validation pattern is not a valid regular expression
    #[error("Invalid validation pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A timing value is out of range
    #[error("Invalid value for '{field}': {reason}")]
    InvalidTiming { field: &'static str, reason: String },

    /// Start and stop code are configured to the same value
    #[error("Start and stop code must differ, both are '{0}'")]
    AmbiguousControlCode(String),
}
