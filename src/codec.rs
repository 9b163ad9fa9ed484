//! Commit wire format: encoding and decoding between [`Commit`] and the
//! store-native [`CommitRecord`].
//!
//! The codec owns the key-encoding trick that makes version range queries
//! work on a string-keyed store: the sort key is
//! `"{aggregate_key}:{version zero-padded to a fixed digit count}"`, so
//! lexicographic ordering of sort keys equals numeric ordering of versions.
//! Event payloads travel as a gzip-compressed JSON array, keyed separately
//! from the commit metadata.

use std::io::{Read, Write};

use chrono::{DateTime, SecondsFormat, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Aggregate key used when an aggregate type declares no key schema
/// (singleton aggregates).
pub const SINGLETON_KEY: &str = "@";

/// A single immutable domain event.
///
/// `schema_version` starts at 0 and is bumped once per successful upcast;
/// it is omitted from the serialized form while still 0, matching the wire
/// shape of events written before any upcaster existed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type tag (e.g. `"ItemAdded"`).
    #[serde(rename = "type")]
    pub event_type: String,

    /// Structured event payload. Opaque to the store.
    #[serde(default)]
    pub properties: serde_json::Value,

    /// Schema version of `properties`. Defaults to 0.
    #[serde(default, rename = "version", skip_serializing_if = "schema_version_is_zero")]
    pub schema_version: u32,
}

fn schema_version_is_zero(v: &u32) -> bool {
    *v == 0
}

impl Event {
    /// Build an event at schema version 0.
    pub fn new(event_type: impl Into<String>, properties: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
            schema_version: 0,
        }
    }
}

/// An atomically-written batch of events at a specific version of one
/// aggregate.
///
/// `version` values for a fixed (aggregate type, aggregate key) form a
/// contiguous sequence starting at 1; the conditional write in the commit
/// store is what enforces that. `commit_id` is globally sortable and backs
/// the projector's cross-aggregate catch-up scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// Aggregate type this commit belongs to.
    pub aggregate_type: String,
    /// Aggregate key within the type. `"@"` for singletons.
    pub aggregate_key: String,
    /// Per-aggregate version, starting at 1, gapless.
    pub version: u64,
    /// Globally sortable identifier derived from the commit timestamp,
    /// aggregate type, and aggregate key.
    pub commit_id: String,
    /// Wall-clock commit time assigned by the writer.
    pub committed_at: DateTime<Utc>,
    /// Soft-delete flag. Inactive commits are excluded from the global
    /// secondary index scan.
    pub active: bool,
    /// The events in this commit, in application order.
    pub events: Vec<Event>,
    /// Set by the upcaster when any event in this commit was migrated.
    /// Runtime-only; never serialized.
    #[serde(skip)]
    pub upcasted: bool,
}

impl Commit {
    /// Build a commit, deriving `commit_id` from the timestamp and
    /// aggregate identity. `active` defaults to true.
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_key: impl Into<String>,
        version: u64,
        committed_at: DateTime<Utc>,
        events: Vec<Event>,
    ) -> Self {
        let aggregate_type = aggregate_type.into();
        let aggregate_key = aggregate_key.into();
        let commit_id = commit_id_for(&committed_at, &aggregate_type, &aggregate_key);
        Self {
            aggregate_type,
            aggregate_key,
            version,
            commit_id,
            committed_at,
            active: true,
            events,
            upcasted: false,
        }
    }

    /// `"{aggregate_type}:{aggregate_key}"`, the identity the projector
    /// serializes processing on.
    pub fn aggregate_id(&self) -> String {
        format!("{}:{}", self.aggregate_type, self.aggregate_key)
    }
}

/// A commit in the store's native record shape.
///
/// Field-for-field this is what lands in the keyed store: partition key
/// `aggregate_type`, composite sort key, the sortable `commit_id` for the
/// secondary index, an ISO-8601 timestamp string, the `"t"`/`"f"` active
/// flag, and the compressed event payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRecord {
    /// Partition key.
    pub aggregate_type: String,
    /// `"{aggregate_key}:{zero-padded version}"`.
    pub sort_key: String,
    /// Secondary index sort key.
    pub commit_id: String,
    /// ISO-8601 timestamp with millisecond precision.
    pub committed_at: String,
    /// `"t"` or `"f"`.
    pub active: String,
    /// Gzip-compressed JSON array of events.
    pub events: Vec<u8>,
}

/// Render a timestamp the way it is stored: ISO-8601 with milliseconds,
/// UTC, `Z` suffix (`2024-03-01T12:00:00.000Z`).
pub fn date_string(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Derive the globally sortable commit id: the timestamp's digits followed
/// by the aggregate type and key, `:`-joined.
///
/// Uniqueness is only (aggregate type, aggregate key)-scoped; collisions
/// across aggregates at the same millisecond are acceptable because the
/// primary key is the sort key, not the commit id.
pub fn commit_id_for(committed_at: &DateTime<Utc>, aggregate_type: &str, aggregate_key: &str) -> String {
    let digits: String = date_string(committed_at)
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    format!("{digits}:{aggregate_type}:{aggregate_key}")
}

/// Encode the composite sort key for one (aggregate key, version) pair.
///
/// The version is zero-padded to `version_digits` so lexicographic range
/// queries align with numeric version order. A version too wide for the
/// configured digit count is a configuration error and fails loudly; it is
/// never truncated or wrapped.
///
/// # Errors
///
/// Returns [`Error::Configuration`] if `version` has more than
/// `version_digits` decimal digits.
pub fn sort_key_for(aggregate_key: &str, version: u64, version_digits: u32) -> Result<String, Error> {
    let rendered = version.to_string();
    if rendered.len() > version_digits as usize {
        return Err(Error::Configuration(format!(
            "version {version} does not fit in {version_digits} digits; raise version_digits"
        )));
    }
    Ok(format!(
        "{aggregate_key}:{rendered:0>width$}",
        width = version_digits as usize
    ))
}

/// Highest version representable under a digit budget (`10^digits - 1`).
pub fn max_version_for_digits(version_digits: u32) -> u64 {
    10u64.saturating_pow(version_digits) - 1
}

/// Serialize a commit into its store-native record.
///
/// Events are serialized to JSON and gzip-compressed. The round trip
/// through [`decode_commit`] is lossless except for the zero padding of
/// the version inside the sort key, which decode reconstructs.
///
/// # Errors
///
/// Returns [`Error::Configuration`] if the version exceeds the digit
/// budget, or [`Error::Codec`] if event serialization or compression
/// fails.
pub fn encode_commit(commit: &Commit, version_digits: u32) -> Result<CommitRecord, Error> {
    let sort_key = sort_key_for(&commit.aggregate_key, commit.version, version_digits)?;

    let events_json = serde_json::to_vec(&commit.events)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&events_json)
        .and_then(|()| encoder.finish())
        .map(|compressed| CommitRecord {
            aggregate_type: commit.aggregate_type.clone(),
            sort_key,
            commit_id: commit.commit_id.clone(),
            committed_at: date_string(&commit.committed_at),
            active: if commit.active { "t" } else { "f" }.to_string(),
            events: compressed,
        })
        .map_err(|e| Error::Codec(format!("gzip compression failed: {e}")))
}

/// Deserialize a store record back into a [`Commit`].
///
/// The aggregate key and numeric version are reconstructed by splitting
/// the sort key at its last `:` (aggregate keys may themselves contain
/// `:`-free separator characters, but the version segment never does).
///
/// # Errors
///
/// Returns [`Error::Codec`] if the sort key, timestamp, compression, or
/// event JSON are malformed.
pub fn decode_commit(record: &CommitRecord) -> Result<Commit, Error> {
    let (aggregate_key, version_str) = record
        .sort_key
        .rsplit_once(':')
        .ok_or_else(|| Error::Codec(format!("malformed sort key '{}'", record.sort_key)))?;

    let version: u64 = version_str
        .parse()
        .map_err(|_| Error::Codec(format!("non-numeric version in sort key '{}'", record.sort_key)))?;

    let committed_at = DateTime::parse_from_rfc3339(&record.committed_at)
        .map_err(|e| Error::Codec(format!("bad committed_at '{}': {e}", record.committed_at)))?
        .with_timezone(&Utc);

    let mut events_json = Vec::new();
    GzDecoder::new(record.events.as_slice())
        .read_to_end(&mut events_json)
        .map_err(|e| Error::Codec(format!("gzip decompression failed: {e}")))?;
    let events: Vec<Event> = serde_json::from_slice(&events_json)?;

    Ok(Commit {
        aggregate_type: record.aggregate_type.clone(),
        aggregate_key: aggregate_key.to_string(),
        version,
        commit_id: record.commit_id.clone(),
        committed_at,
        active: record.active == "t",
        events,
        upcasted: false,
    })
}
