//! Runtime-tunable operator knobs.
//!
//! A process-wide map of float values keyed by `name` or `name@target`.
//! Handlers read knobs through [`Knobs::value`] with a compiled-in default;
//! an external watcher (deployment-specific, not part of this crate) may
//! update values at runtime via [`Knobs::set`].
//!
//! Lookup order for `value_for_target(name, Some(target))`:
//! 1. `name@target`
//! 2. the supplied default
//!
//! Reads take a shared lock and are cheap; writes are rare.

use std::collections::HashMap;
use std::sync::RwLock;

/// Well-known knob names.
pub mod knob {
    /// Overrides [`crate::constants::COOP_EXIT_CONFIRMATION_THRESHOLD`].
    pub const COOP_EXIT_CONFIRMATION_THRESHOLD: &str = "spark.coop_exit_confirmation_threshold";

    /// Overrides [`crate::constants::DATABASE_STATEMENT_TIMEOUT_MS`].
    pub const DATABASE_STATEMENT_TIMEOUT_MS: &str = "spark.database_statement_timeout_ms";

    /// Overrides [`crate::constants::CHAIN_WATCHER_POLL_INTERVAL_MS`].
    pub const CHAIN_WATCHER_POLL_INTERVAL_MS: &str = "spark.chain_watcher_poll_interval_ms";
}

/// A collection of runtime-tunable values.
#[derive(Debug, Default)]
pub struct Knobs {
    values: RwLock<HashMap<String, f64>>,
}

impl Knobs {
    /// Creates an empty knob set; every read falls through to its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a knob value, falling back to `default` when unset.
    pub fn value(&self, name: &str, default: f64) -> f64 {
        self.value_for_target(name, None, default)
    }

    /// Read a knob value for a specific target (e.g. an operator id).
    ///
    /// A `name@target` entry wins over a bare `name` entry.
    pub fn value_for_target(&self, name: &str, target: Option<&str>, default: f64) -> f64 {
        let values = self.values.read().expect("knob lock poisoned");
        if let Some(target) = target {
            let key = format!("{name}@{target}");
            if let Some(v) = values.get(&key) {
                return *v;
            }
        }
        values.get(name).copied().unwrap_or(default)
    }

    /// Set a knob value. `target` scopes the value to `name@target`.
    pub fn set(&self, name: &str, target: Option<&str>, value: f64) {
        let key = match target {
            Some(target) => format!("{name}@{target}"),
            None => name.to_owned(),
        };
        self.values
            .write()
            .expect("knob lock poisoned")
            .insert(key, value);
    }

    /// Remove a knob, restoring default behavior.
    pub fn clear(&self, name: &str, target: Option<&str>) {
        let key = match target {
            Some(target) => format!("{name}@{target}"),
            None => name.to_owned(),
        };
        self.values
            .write()
            .expect("knob lock poisoned")
            .remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_knob_returns_default() {
        let knobs = Knobs::new();
        assert_eq!(knobs.value("spark.anything", 42.0), 42.0);
    }

    #[test]
    fn set_then_read() {
        let knobs = Knobs::new();
        knobs.set(knob::COOP_EXIT_CONFIRMATION_THRESHOLD, None, 3.0);
        assert_eq!(knobs.value(knob::COOP_EXIT_CONFIRMATION_THRESHOLD, 6.0), 3.0);
    }

    #[test]
    fn target_entry_wins_over_bare_entry() {
        let knobs = Knobs::new();
        knobs.set("spark.timeout", None, 10.0);
        knobs.set("spark.timeout", Some("operator-2"), 20.0);

        assert_eq!(knobs.value_for_target("spark.timeout", Some("operator-2"), 0.0), 20.0);
        assert_eq!(knobs.value_for_target("spark.timeout", Some("operator-3"), 0.0), 10.0);
        assert_eq!(knobs.value("spark.timeout", 0.0), 10.0);
    }

    #[test]
    fn clear_restores_default() {
        let knobs = Knobs::new();
        knobs.set("spark.x", None, 1.0);
        knobs.clear("spark.x", None);
        assert_eq!(knobs.value("spark.x", 7.0), 7.0);
    }
}
