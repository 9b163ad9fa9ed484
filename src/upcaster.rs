//! Event schema evolution via upcaster chains.
//!
//! An upcaster migrates one event type's properties from one schema
//! version to the next. Upcasters are indexed by `(event type, from
//! version)`; applying the chain repeatedly walks an event forward until
//! no upcaster exists for its current version. The chain cursor is the
//! event's schema version, which strictly increases each step, so a pass
//! over a finite registry always terminates.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::codec::{Commit, Event};

/// A pure transform from one schema version's properties to the next.
pub type UpcastFn = Box<dyn Fn(serde_json::Value) -> serde_json::Value + Send + Sync>;

/// Registry of upcasters indexed by `(event type, from version)`.
///
/// The registry also yields the *configuration checksum*: a stable hash of
/// which (type, version) slots are registered. Snapshots are tagged with
/// this checksum so state cached under an older upcaster configuration is
/// detected as stale and rebuilt instead of silently served.
#[derive(Default)]
pub struct UpcasterRegistry {
    // BTreeMap keeps checksum input ordering stable without sorting.
    upcasters: BTreeMap<String, BTreeMap<u32, UpcastFn>>,
}

impl std::fmt::Debug for UpcasterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots: Vec<(&str, Vec<u32>)> = self
            .upcasters
            .iter()
            .map(|(t, m)| (t.as_str(), m.keys().copied().collect()))
            .collect();
        f.debug_struct("UpcasterRegistry").field("slots", &slots).finish()
    }
}

impl UpcasterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transform for `event_type` at `from_version`.
    ///
    /// The transform receives the event's properties and returns the
    /// properties at `from_version + 1`. Registering the same slot twice
    /// replaces the earlier transform.
    pub fn register<F>(&mut self, event_type: impl Into<String>, from_version: u32, f: F)
    where
        F: Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    {
        self.upcasters
            .entry(event_type.into())
            .or_default()
            .insert(from_version, Box::new(f));
    }

    /// Whether no upcasters are registered.
    pub fn is_empty(&self) -> bool {
        self.upcasters.is_empty()
    }

    /// Walk one event forward through the chain.
    ///
    /// Returns the (possibly unchanged) event and whether any transform
    /// was applied. Re-running on an already-upcasted event is a no-op,
    /// since no upcaster exists for its final version.
    pub fn upcast_event(&self, mut event: Event) -> (Event, bool) {
        let mut changed = false;
        while let Some(f) = self
            .upcasters
            .get(&event.event_type)
            .and_then(|by_version| by_version.get(&event.schema_version))
        {
            event.properties = f(std::mem::take(&mut event.properties));
            event.schema_version += 1;
            changed = true;
        }
        (event, changed)
    }

    /// Upcast every event in a commit, marking the commit `upcasted` if
    /// any event changed.
    pub fn upcast_commit(&self, mut commit: Commit) -> Commit {
        if self.is_empty() {
            return commit;
        }

        let mut any = false;
        commit.events = commit
            .events
            .into_iter()
            .map(|event| {
                let (event, changed) = self.upcast_event(event);
                any |= changed;
                event
            })
            .collect();
        commit.upcasted = any;
        commit
    }

    /// Stable hash of the registered `(type, versions)` slots, or `None`
    /// when the registry is empty.
    ///
    /// The hash covers only which slots exist, not the transform bodies:
    /// changing a transform in place without moving its slot is assumed to
    /// be a bug fix that intends to keep existing snapshots.
    pub fn checksum(&self) -> Option<String> {
        if self.upcasters.is_empty() {
            return None;
        }

        let mut hasher = Sha256::new();
        for (event_type, by_version) in &self.upcasters {
            hasher.update(event_type.as_bytes());
            hasher.update([0u8]);
            for version in by_version.keys() {
                hasher.update(version.to_be_bytes());
            }
            hasher.update([0xff]);
        }
        let digest = hasher.finalize();
        Some(format!("{digest:x}"))
    }
}
