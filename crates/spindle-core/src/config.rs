//! Opaque configuration capability.
//!
//! The runtime does not own a configuration system; it consumes one.
//! `clock::setup` looks up two keys through this trait:
//!
//! - `"clock-source"` (string): name of the monotonic time source.
//! - `"high-priority"` (int, treated as a boolean): raise the process
//!   scheduling priority during setup.

use std::collections::HashMap;

/// Read-only key lookup supplied by the embedding application.
pub trait Config {
    /// String-valued option, or `None` when the key is unset.
    fn get_string(&self, key: &str) -> Option<String>;

    /// Integer-valued option, or `None` when the key is unset.
    fn get_int(&self, key: &str) -> Option<i64>;
}

/// `HashMap`-backed [`Config`] for tests and simple embedders.
#[derive(Debug, Default, Clone)]
pub struct MapConfig {
    strings: HashMap<String, String>,
    ints: HashMap<String, i64>,
}

impl MapConfig {
    /// Create an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style string option.
    #[must_use]
    pub fn with_string(mut self, key: &str, value: &str) -> Self {
        self.strings.insert(key.to_owned(), value.to_owned());
        self
    }

    /// Builder-style integer option.
    #[must_use]
    pub fn with_int(mut self, key: &str, value: i64) -> Self {
        self.ints.insert(key.to_owned(), value);
        self
    }
}

impl Config for MapConfig {
    fn get_string(&self, key: &str) -> Option<String> {
        self.strings.get(key).cloned()
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        self.ints.get(key).copied()
    }
}
