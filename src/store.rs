//! Commit persistence: the [`CommitStore`] trait, the high-level
//! [`CommitQuery`] cursor, and an in-memory backend.
//!
//! The trait speaks the keyed store's native vocabulary (conditional put,
//! paged range query over one partition, paged scan of the global
//! secondary index); [`CommitQuery`] layers version/time bounds and
//! transparent pagination on top and hands back decoded [`Commit`]s.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::codec::{
    decode_commit, max_version_for_digits, sort_key_for, Commit, CommitRecord, SINGLETON_KEY,
};
use crate::config::StoreConfig;
use crate::error::Error;

/// Opaque resume token for a paged query. Valid only for the store
/// instance and query shape that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor(String);

/// Capacity consumed by a successful write.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteReceipt {
    /// Write units the backend charged for the put.
    pub consumed_capacity_units: f64,
}

/// One page worth of raw records plus the token to fetch the next page.
#[derive(Debug)]
pub struct RecordPage {
    /// Records in request order.
    pub records: Vec<CommitRecord>,
    /// Present when more records remain past this page.
    pub next: Option<PageCursor>,
    /// Read units the backend charged for this page.
    pub consumed_capacity_units: f64,
}

/// A single-partition range query in store-native terms: a sort-key
/// interval, direction, and optional page limit.
#[derive(Debug, Clone)]
pub struct PageRequest {
    /// Table holding the commit records.
    pub table_name: String,
    /// Partition key.
    pub aggregate_type: String,
    /// Inclusive lower sort-key bound.
    pub min_sort_key: String,
    /// Inclusive upper sort-key bound.
    pub max_sort_key: String,
    /// Ascending sort-key order when true.
    pub ascending: bool,
    /// Cap on records returned across this page.
    pub limit: Option<usize>,
    /// Strongly consistent read when true.
    pub consistent_read: bool,
    /// Resume token from the previous page.
    pub cursor: Option<PageCursor>,
}

/// A page request against the global commit index, ordered by commit id.
#[derive(Debug, Clone)]
pub struct GlobalPageRequest {
    /// Table holding the commit records.
    pub table_name: String,
    /// Only commits with an id strictly greater than this are returned.
    /// Empty string means "from the beginning".
    pub after_commit_id: String,
    /// Cap on records returned in this page.
    pub limit: Option<usize>,
    /// Resume token from the previous page.
    pub cursor: Option<PageCursor>,
}

/// Read/write capacity accumulated across the store calls of one logical
/// operation, surfaced in hydrate/commit logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreMetrics {
    /// Total read units consumed.
    pub read_units_consumed: f64,
    /// Total write units consumed.
    pub write_units_consumed: f64,
}

impl StoreMetrics {
    /// Fold a page's read cost into the running totals.
    pub fn add_read(&mut self, units: f64) {
        self.read_units_consumed += units;
    }

    /// Fold a write receipt into the running totals.
    pub fn add_write(&mut self, receipt: WriteReceipt) {
        self.write_units_consumed += receipt.consumed_capacity_units;
    }
}

/// Backend holding commit records.
///
/// Implementations map these three calls onto their native store. The
/// contract `put_commit` must uphold is the one the whole concurrency
/// model rests on: the write succeeds only if no record exists at
/// `(aggregate_type, sort_key)`, and a conditional failure surfaces as
/// [`Error::VersionConflict`], never as [`Error::Store`].
#[async_trait]
pub trait CommitStore: Send + Sync {
    /// Write one commit record, conditional on its slot being empty.
    ///
    /// # Errors
    ///
    /// [`Error::VersionConflict`] when the slot is taken; [`Error::Store`]
    /// for any other backend failure.
    async fn put_commit(&self, table_name: &str, record: &CommitRecord)
        -> Result<WriteReceipt, Error>;

    /// Fetch one page of records from a partition's sort-key range.
    async fn query_commit_page(&self, request: PageRequest) -> Result<RecordPage, Error>;

    /// Fetch one page of active records from the global index, ordered by
    /// commit id.
    async fn global_commit_page(&self, request: GlobalPageRequest) -> Result<RecordPage, Error>;
}

/// Decode every record in a page, in page order.
///
/// # Errors
///
/// Returns [`Error::Codec`] on the first malformed record.
pub fn decode_page(page: &RecordPage) -> Result<Vec<Commit>, Error> {
    page.records.iter().map(decode_commit).collect()
}

/// Decoded commits plus the read cost of producing them.
#[derive(Debug)]
pub struct QueryOutcome {
    /// Commits in request order.
    pub commits: Vec<Commit>,
    /// Read units consumed across all pages fetched.
    pub read_units_consumed: f64,
}

/// High-level commit range query for one aggregate instance.
///
/// Defaults: singleton key, versions `1..=` the digit budget's maximum, no
/// time bound, ascending, unlimited, consistent reads. Pagination is
/// transparent; the caller sees a single decoded `Vec<Commit>`.
///
/// `max_time` is a post-filter on `committed_at`. On ascending scans the
/// fetch stops at the first commit past the bound, relying on per-instance
/// commit timestamps being non-decreasing; descending scans skip
/// too-recent commits and keep reading.
#[derive(Debug, Clone)]
pub struct CommitQuery {
    /// Partition to query.
    pub aggregate_type: String,
    /// Aggregate key within the partition.
    pub aggregate_key: String,
    /// Inclusive lower version bound.
    pub min_version: u64,
    /// Inclusive upper version bound, further capped by the digit budget.
    pub max_version: u64,
    /// Inclusive upper bound on `committed_at`.
    pub max_time: Option<DateTime<Utc>>,
    /// Version order of the results.
    pub ascending: bool,
    /// Cap on commits returned overall.
    pub limit: Option<usize>,
    /// Strongly consistent reads when true.
    pub consistent_read: bool,
}

impl CommitQuery {
    /// Query every commit of an aggregate type's singleton instance.
    pub fn new(aggregate_type: impl Into<String>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_key: SINGLETON_KEY.to_string(),
            min_version: 1,
            max_version: u64::MAX,
            max_time: None,
            ascending: true,
            limit: None,
            consistent_read: true,
        }
    }

    /// Target a specific aggregate key.
    pub fn with_key(mut self, aggregate_key: impl Into<String>) -> Self {
        self.aggregate_key = aggregate_key.into();
        self
    }

    /// Run the query to completion, decoding records as pages arrive.
    ///
    /// # Errors
    ///
    /// Propagates store failures and codec errors; returns
    /// [`Error::Configuration`] if the version bounds do not fit the
    /// configured digit budget.
    pub async fn fetch(
        &self,
        store: &dyn CommitStore,
        config: &StoreConfig,
    ) -> Result<QueryOutcome, Error> {
        let digits = config.version_digits;
        let max_version = self.max_version.min(max_version_for_digits(digits));

        let mut outcome = QueryOutcome {
            commits: Vec::new(),
            read_units_consumed: 0.0,
        };
        if self.min_version > max_version {
            return Ok(outcome);
        }

        let min_sort_key = sort_key_for(&self.aggregate_key, self.min_version, digits)?;
        let max_sort_key = sort_key_for(&self.aggregate_key, max_version, digits)?;

        let mut cursor = None;
        loop {
            let remaining = self.limit.map(|limit| limit - outcome.commits.len());
            let page = store
                .query_commit_page(PageRequest {
                    table_name: config.table_name.clone(),
                    aggregate_type: self.aggregate_type.clone(),
                    min_sort_key: min_sort_key.clone(),
                    max_sort_key: max_sort_key.clone(),
                    ascending: self.ascending,
                    limit: remaining,
                    consistent_read: self.consistent_read,
                    cursor,
                })
                .await?;
            outcome.read_units_consumed += page.consumed_capacity_units;

            for record in &page.records {
                let commit = decode_commit(record)?;
                if let Some(bound) = self.max_time {
                    if commit.committed_at > bound {
                        if self.ascending {
                            // Later versions of this instance cannot be
                            // older; the rest of the scan is all past the
                            // bound.
                            return Ok(outcome);
                        }
                        continue;
                    }
                }
                outcome.commits.push(commit);
                if self.limit.is_some_and(|limit| outcome.commits.len() >= limit) {
                    return Ok(outcome);
                }
            }

            match page.next {
                Some(next) => cursor = Some(next),
                None => return Ok(outcome),
            }
        }
    }
}

/// Look up the newest commit of an instance (descending, limit 1).
///
/// # Errors
///
/// Propagates store and codec failures.
pub async fn get_head_commit(
    store: &dyn CommitStore,
    config: &StoreConfig,
    aggregate_type: &str,
    aggregate_key: &str,
) -> Result<Option<Commit>, Error> {
    let mut query = CommitQuery::new(aggregate_type).with_key(aggregate_key);
    query.ascending = false;
    query.limit = Some(1);
    let outcome = query.fetch(store, config).await?;
    Ok(outcome.commits.into_iter().next())
}

/// In-memory [`CommitStore`] backed by a `BTreeMap` per table.
///
/// Sort order falls out of the map's key ordering, the same way it does in
/// the real keyed store. `page_size` caps each page so pagination paths
/// get exercised without thousands of records.
pub struct InMemoryCommitStore {
    tables: Mutex<HashMap<String, BTreeMap<(String, String), CommitRecord>>>,
    page_size: usize,
}

impl Default for InMemoryCommitStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCommitStore {
    /// Create an empty store with a generous page size.
    pub fn new() -> Self {
        Self::with_page_size(100)
    }

    /// Create an empty store returning at most `page_size` records per
    /// page.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            page_size: page_size.max(1),
        }
    }

    /// Count of records in a table, for assertions.
    pub fn record_count(&self, table_name: &str) -> usize {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.get(table_name).map_or(0, BTreeMap::len)
    }
}

impl InMemoryCommitStore {
    fn lock_tables(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<(String, String), CommitRecord>>> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CommitStore for InMemoryCommitStore {
    async fn put_commit(
        &self,
        table_name: &str,
        record: &CommitRecord,
    ) -> Result<WriteReceipt, Error> {
        let mut tables = self.lock_tables();
        let table = tables.entry(table_name.to_string()).or_default();
        let slot = (record.aggregate_type.clone(), record.sort_key.clone());

        if table.contains_key(&slot) {
            let (aggregate_key, version) = record
                .sort_key
                .rsplit_once(':')
                .and_then(|(key, v)| v.parse().ok().map(|v| (key.to_string(), v)))
                .ok_or_else(|| Error::Store(format!("malformed sort key '{}'", record.sort_key)))?;
            return Err(Error::VersionConflict {
                aggregate_type: record.aggregate_type.clone(),
                aggregate_key,
                version,
            });
        }

        table.insert(slot, record.clone());
        Ok(WriteReceipt {
            consumed_capacity_units: 1.0,
        })
    }

    async fn query_commit_page(&self, request: PageRequest) -> Result<RecordPage, Error> {
        let tables = self.lock_tables();
        let empty = BTreeMap::new();
        let table = tables.get(&request.table_name).unwrap_or(&empty);

        let lower = (request.aggregate_type.clone(), request.min_sort_key.clone());
        let upper = (request.aggregate_type.clone(), request.max_sort_key.clone());
        let in_range: Vec<&CommitRecord> = if request.ascending {
            table
                .range((Bound::Included(lower), Bound::Included(upper)))
                .map(|(_, r)| r)
                .collect()
        } else {
            table
                .range((Bound::Included(lower), Bound::Included(upper)))
                .rev()
                .map(|(_, r)| r)
                .collect()
        };

        let after_cursor: Vec<&CommitRecord> = match &request.cursor {
            None => in_range,
            Some(PageCursor(last)) => in_range
                .into_iter()
                .filter(|r| {
                    if request.ascending {
                        r.sort_key.as_str() > last.as_str()
                    } else {
                        r.sort_key.as_str() < last.as_str()
                    }
                })
                .collect(),
        };

        let page_limit = request
            .limit
            .map_or(self.page_size, |l| l.min(self.page_size));
        let has_more = after_cursor.len() > page_limit;
        let records: Vec<CommitRecord> =
            after_cursor.into_iter().take(page_limit).cloned().collect();

        let next = if has_more {
            records.last().map(|r| PageCursor(r.sort_key.clone()))
        } else {
            None
        };

        Ok(RecordPage {
            consumed_capacity_units: 0.5 * records.len().max(1) as f64,
            records,
            next,
        })
    }

    async fn global_commit_page(&self, request: GlobalPageRequest) -> Result<RecordPage, Error> {
        let tables = self.lock_tables();
        let empty = BTreeMap::new();
        let table = tables.get(&request.table_name).unwrap_or(&empty);

        let floor = match &request.cursor {
            Some(PageCursor(last)) => last.clone().max(request.after_commit_id.clone()),
            None => request.after_commit_id.clone(),
        };

        let mut matching: Vec<&CommitRecord> = table
            .values()
            .filter(|r| r.active == "t" && r.commit_id > floor)
            .collect();
        matching.sort_by(|a, b| a.commit_id.cmp(&b.commit_id));

        let page_limit = request
            .limit
            .map_or(self.page_size, |l| l.min(self.page_size));
        let has_more = matching.len() > page_limit;
        let records: Vec<CommitRecord> =
            matching.into_iter().take(page_limit).cloned().collect();

        let next = if has_more {
            records.last().map(|r| PageCursor(r.commit_id.clone()))
        } else {
            None
        };

        Ok(RecordPage {
            consumed_capacity_units: 0.5 * records.len().max(1) as f64,
            records,
            next,
        })
    }
}
