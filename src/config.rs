//! Aggregate store configuration.
//!
//! Configuration is an explicit value passed to constructors; there is no
//! process-wide mutable default. Validation happens at construction time
//! and surfaces [`Error::Configuration`] before any store call is made.

use crate::error::Error;

/// Default composite-sort-key version width.
pub const DEFAULT_VERSION_DIGITS: u32 = 9;

/// Default snapshot frequency (a snapshot every N commits).
pub const DEFAULT_SNAPSHOT_FREQUENCY: u64 = 100;

/// Snapshot behaviour, present only when snapshots are enabled.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Write a snapshot whenever `version % frequency == 0`. Must be >= 1.
    pub frequency: u64,
    /// Prefix prepended to every snapshot blob key.
    pub prefix: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            frequency: DEFAULT_SNAPSHOT_FREQUENCY,
            prefix: String::new(),
        }
    }
}

/// Configuration shared by every aggregate instance bound to one store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Commit table name, forwarded to the store backend. Must be 3-255
    /// characters of `[a-zA-Z0-9_\-.]`.
    pub table_name: String,
    /// Fixed digit width for the version segment of the sort key.
    pub version_digits: u32,
    /// Snapshot settings; `None` disables snapshots entirely.
    pub snapshots: Option<SnapshotConfig>,
}

impl StoreConfig {
    /// Build a configuration with defaults (9 version digits, snapshots
    /// disabled).
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            version_digits: DEFAULT_VERSION_DIGITS,
            snapshots: None,
        }
    }

    /// Enable snapshots with the given frequency.
    pub fn with_snapshots(mut self, frequency: u64) -> Self {
        self.snapshots = Some(SnapshotConfig {
            frequency,
            ..SnapshotConfig::default()
        });
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an invalid table name, a zero
    /// digit width, or snapshots enabled with frequency 0.
    pub fn validate(&self) -> Result<(), Error> {
        if !valid_table_name(&self.table_name) {
            return Err(Error::Configuration(format!(
                "invalid table name '{}'",
                self.table_name
            )));
        }

        if self.version_digits == 0 || self.version_digits > 19 {
            return Err(Error::Configuration(format!(
                "version_digits must be between 1 and 19, got {}",
                self.version_digits
            )));
        }

        if let Some(snapshots) = &self.snapshots {
            if snapshots.frequency == 0 {
                return Err(Error::Configuration(
                    "when snapshots are enabled, frequency must be at least 1".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// 3-255 characters of `[a-zA-Z0-9_\-.]`, the keyed store's table-name rule.
fn valid_table_name(name: &str) -> bool {
    (3..=255).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        StoreConfig::new("commits").validate().expect("defaults should be valid");
    }

    #[test]
    fn bad_table_names_are_configuration_errors() {
        for bad in ["", "ab", "has space", "has/slash", &"x".repeat(256)] {
            let err = StoreConfig::new(bad).validate().unwrap_err();
            assert!(
                matches!(err, Error::Configuration(_)),
                "'{bad}' should be rejected"
            );
        }
    }

    #[test]
    fn punctuated_table_names_are_accepted() {
        for good in ["commits", "my-table.v2", "a_b_c"] {
            StoreConfig::new(good).validate().expect("should be valid");
        }
    }

    #[test]
    fn snapshot_frequency_zero_is_rejected() {
        let mut config = StoreConfig::new("commits").with_snapshots(0);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        config.snapshots = Some(SnapshotConfig::default());
        config.validate().expect("default frequency should be valid");
    }

    #[test]
    fn version_digits_bounds_are_enforced() {
        let mut config = StoreConfig::new("commits");
        config.version_digits = 0;
        assert!(config.validate().is_err());
        config.version_digits = 20;
        assert!(config.validate().is_err());
        config.version_digits = 19;
        config.validate().expect("19 digits fits in u64");
    }
}
