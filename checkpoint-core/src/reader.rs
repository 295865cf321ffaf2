//! Barcode decoding from delimited key events.
//!
//! A barcode reader in keyboard-wedge mode "types" the code followed by a
//! terminator key. [`BarcodeDecoder`] accumulates the characters and, on the
//! terminator, validates the buffered code against the configured pattern.
//!
//! ```rust
//! use checkpoint_core::reader::{BarcodeDecoder, KeyEvent, ReaderEvent};
//!
//! let mut decoder = BarcodeDecoder::new("^[0-9]{6}$").unwrap();
//! let mut last = None;
//! for key in KeyEvent::from_line("123456") {
//!     last = decoder.push(&key);
//! }
//! assert!(matches!(last, Some(ReaderEvent::Valid(_))));
//! ```

use regex::Regex;
use std::time::SystemTime;

use crate::error::ConfigError;

/// Name of the key that terminates a code
pub const TERMINATOR_KEY: &str = "enter";

/// A single key press as delivered by the input layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    /// Key name, e.g. "a", "shift" or "enter"
    pub name: String,
    /// Character produced by the key, if any
    pub ch: Option<char>,
}

impl KeyEvent {
    pub fn char(ch: char) -> Self {
        KeyEvent {
            name: ch.to_string(),
            ch: Some(ch),
        }
    }

    pub fn terminator() -> Self {
        KeyEvent {
            name: TERMINATOR_KEY.to_string(),
            ch: None,
        }
    }

    /// Key events for a whole code, terminator included
    pub fn from_line(line: &str) -> Vec<KeyEvent> {
        line.chars()
            .map(KeyEvent::char)
            .chain(std::iter::once(KeyEvent::terminator()))
            .collect()
    }
}

/// A completed code
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub code: String,
    pub validated_at: SystemTime,
}

/// Result of a terminator key
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent {
    Valid(Reading),
    Invalid(Reading),
}

impl ReaderEvent {
    pub fn code(&self) -> &str {
        match self {
            ReaderEvent::Valid(r) | ReaderEvent::Invalid(r) => &r.code,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, ReaderEvent::Valid(_))
    }
}

/// Accumulates key events into validated codes.
#[derive(Debug)]
pub struct BarcodeDecoder {
    pattern: Option<Regex>,
    terminator: String,
    buffer: String,
}

impl BarcodeDecoder {
    /// Create a decoder. An empty pattern accepts every code.
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        Self::with_terminator(pattern, TERMINATOR_KEY)
    }

    pub fn with_terminator(pattern: &str, terminator: &str) -> Result<Self, ConfigError> {
        let pattern = if pattern.is_empty() {
            None
        } else {
            Some(
                Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                })?,
            )
        };
        Ok(BarcodeDecoder {
            pattern,
            terminator: terminator.to_ascii_lowercase(),
            buffer: String::new(),
        })
    }

    /// Feed one key event. Returns an event only on a non-empty terminator.
    pub fn push(&mut self, key: &KeyEvent) -> Option<ReaderEvent> {
        if key.name.eq_ignore_ascii_case(&self.terminator) {
            if self.buffer.is_empty() {
                return None;
            }
            let code = std::mem::take(&mut self.buffer);
            let reading = Reading {
                validated_at: SystemTime::now(),
                code,
            };
            return Some(if self.is_valid(&reading.code) {
                ReaderEvent::Valid(reading)
            } else {
                ReaderEvent::Invalid(reading)
            });
        }

        if let Some(ch) = key.ch {
            self.buffer.push(ch);
        }
        None
    }

    pub fn is_valid(&self, code: &str) -> bool {
        match &self.pattern {
            Some(re) => re.is_match(code),
            None => true,
        }
    }

    /// Characters received since the last terminator
    pub fn pending(&self) -> &str {
        &self.buffer
    }
}
