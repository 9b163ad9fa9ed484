//! Aggregate runtime: defining aggregate types and driving instances
//! through create / load / hydrate / commit.
//!
//! An aggregate type is a reducer over immutable events plus the
//! surrounding declarations (key schema, upcasters, initial events). An
//! [`Aggregate`] instance owns the folded state, the current version, and
//! the machinery that keeps both consistent with the store: snapshot-aware
//! hydration and optimistic-concurrency commits with an optional retry
//! loop.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{encode_commit, Commit, Event, SINGLETON_KEY};
use crate::config::StoreConfig;
use crate::error::Error;
use crate::keys::{KeySchema, Props};
use crate::retry::RetryPolicy;
use crate::snapshot::{read_snapshot, write_snapshot, BlobStore, SnapshotRecord};
use crate::store::{decode_page, CommitQuery, CommitStore, PageRequest, StoreMetrics};
use crate::upcaster::UpcasterRegistry;

/// Static description of one aggregate type.
///
/// Implementations are zero-sized marker types; everything is associated
/// items. The reducer must be a pure function of `(state, event, commit)`
/// so replay is deterministic.
pub trait AggregateType: Send + Sync + 'static {
    /// Aggregate type name, the commit table's partition key.
    const KIND: &'static str;

    /// The folded state. `Default` is the version-0 state.
    type State: Default + Clone + Serialize + DeserializeOwned + Send + Sync;

    /// Fold one event into the state.
    fn reduce(state: Self::State, event: &Event, commit: &Commit) -> Self::State;

    /// Key schema for deriving instance keys from creation props.
    /// `None` makes the type a singleton under [`SINGLETON_KEY`].
    fn key_schema() -> Option<KeySchema> {
        None
    }

    /// Register this type's upcasters.
    fn upcasters(_registry: &mut UpcasterRegistry) {}

    /// Events for the initial commit of a new instance.
    ///
    /// `props` are the creation props with derived key properties merged
    /// in, so a generated id is visible here.
    ///
    /// # Errors
    ///
    /// Implementations may reject invalid props.
    fn initial_events(props: &Props) -> Result<Vec<Event>, Error>;
}

/// Shared handles and configuration every instance of every aggregate
/// type is bound to. Cheap to clone.
#[derive(Clone)]
pub struct AggregateContext {
    commits: Arc<dyn CommitStore>,
    blobs: Option<Arc<dyn BlobStore>>,
    config: StoreConfig,
    retry: RetryPolicy,
}

impl AggregateContext {
    /// Bind a commit store, an optional blob store, and a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the configuration is invalid
    /// or if snapshots are enabled without a blob store.
    pub fn new(
        commits: Arc<dyn CommitStore>,
        blobs: Option<Arc<dyn BlobStore>>,
        config: StoreConfig,
    ) -> Result<Self, Error> {
        config.validate()?;
        if config.snapshots.is_some() && blobs.is_none() {
            return Err(Error::Configuration(
                "snapshots are enabled but no blob store was provided".to_string(),
            ));
        }
        Ok(Self {
            commits,
            blobs,
            config,
            retry: RetryPolicy::default(),
        })
    }

    /// Replace the default commit retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The bound configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The bound commit store.
    pub fn commit_store(&self) -> &Arc<dyn CommitStore> {
        &self.commits
    }
}

impl std::fmt::Debug for AggregateContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateContext")
            .field("config", &self.config)
            .field("retry", &self.retry)
            .field("has_blob_store", &self.blobs.is_some())
            .finish_non_exhaustive()
    }
}

/// Bounds on how far a hydrate replays.
#[derive(Debug, Clone, Copy)]
pub struct HydrateOptions {
    /// Replay up to and including this version.
    pub version: Option<u64>,
    /// Replay only commits with `committed_at` at or before this time.
    pub time: Option<DateTime<Utc>>,
    /// Use strongly consistent reads. Default true.
    pub consistent_read: bool,
}

impl Default for HydrateOptions {
    fn default() -> Self {
        Self {
            version: None,
            time: None,
            consistent_read: true,
        }
    }
}

/// One live aggregate instance: folded state plus commit machinery.
pub struct Aggregate<A: AggregateType> {
    context: AggregateContext,
    aggregate_key: String,
    version: u64,
    state: A::State,
    head_timestamp: Option<DateTime<Utc>>,
    upcasters: UpcasterRegistry,
    commit_in_flight: Option<u64>,
    metrics: StoreMetrics,
}

// `A::State` need not be `Debug`, so render the identity and position only.
impl<A: AggregateType> std::fmt::Debug for Aggregate<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregate")
            .field("aggregate_type", &A::KIND)
            .field("aggregate_key", &self.aggregate_key)
            .field("version", &self.version)
            .field("head_timestamp", &self.head_timestamp)
            .finish_non_exhaustive()
    }
}

impl<A: AggregateType> Aggregate<A> {
    /// An instance at version 0 with default state, not yet hydrated.
    fn detached(context: &AggregateContext, aggregate_key: String) -> Self {
        let mut upcasters = UpcasterRegistry::new();
        A::upcasters(&mut upcasters);
        Self {
            context: context.clone(),
            aggregate_key,
            version: 0,
            state: A::State::default(),
            head_timestamp: None,
            upcasters,
            commit_in_flight: None,
            metrics: StoreMetrics::default(),
        }
    }

    /// Derive the key for `props`, or the singleton key when the type
    /// declares no schema.
    fn derive_key(props: &Props) -> Result<(String, Props), Error> {
        match A::key_schema() {
            Some(schema) => schema.key_from_props(props),
            None => Ok((SINGLETON_KEY.to_string(), Props::new())),
        }
    }

    /// Create a new instance: derive the key, hydrate to confirm nothing
    /// exists, then commit the type's initial events.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VersionConflict`] if the instance already exists
    /// (whether seen during hydrate or lost to a concurrent creator at
    /// the conditional write), [`Error::MissingKeyProperty`] for
    /// incomplete props, and store errors otherwise.
    pub async fn create(context: &AggregateContext, props: Props) -> Result<Self, Error> {
        let (aggregate_key, key_props) = Self::derive_key(&props)?;

        let mut full_props = props;
        for (name, value) in key_props {
            full_props.insert(name, value);
        }
        let events = A::initial_events(&full_props)?;

        let mut instance = Self::detached(context, aggregate_key);
        instance.hydrate(HydrateOptions::default()).await?;
        if instance.version > 0 {
            return Err(Error::VersionConflict {
                aggregate_type: A::KIND.to_string(),
                aggregate_key: instance.aggregate_key,
                version: 1,
            });
        }

        instance.commit(events).await?;
        Ok(instance)
    }

    /// Load an existing instance, or `None` if it has no commits.
    ///
    /// # Errors
    ///
    /// Propagates key derivation and store failures.
    pub async fn load(context: &AggregateContext, props: Props) -> Result<Option<Self>, Error> {
        Self::load_at(context, props, HydrateOptions::default()).await
    }

    /// Load an instance hydrated under version/time bounds, or `None` if
    /// no commit falls inside the bounds.
    ///
    /// # Errors
    ///
    /// Propagates key derivation and store failures.
    pub async fn load_at(
        context: &AggregateContext,
        props: Props,
        options: HydrateOptions,
    ) -> Result<Option<Self>, Error> {
        let (aggregate_key, _) = Self::derive_key(&props)?;
        let mut instance = Self::detached(context, aggregate_key);
        instance.hydrate(options).await?;
        if instance.version == 0 {
            return Ok(None);
        }
        Ok(Some(instance))
    }

    /// Load an instance that must exist.
    ///
    /// Singleton types (no key schema) conceptually always exist, so an
    /// empty one is returned at version 0 rather than an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AggregateNotFound`] when a keyed instance has no
    /// commits.
    pub async fn require(context: &AggregateContext, props: Props) -> Result<Self, Error> {
        let (aggregate_key, _) = Self::derive_key(&props)?;
        let mut instance = Self::detached(context, aggregate_key);
        instance.hydrate(HydrateOptions::default()).await?;
        if instance.version == 0 && A::key_schema().is_some() {
            return Err(Error::AggregateNotFound {
                aggregate_type: A::KIND.to_string(),
                aggregate_key: instance.aggregate_key,
            });
        }
        Ok(instance)
    }

    /// Load an existing instance or create it with its initial events.
    ///
    /// # Errors
    ///
    /// Propagates creation and store failures. A creation race that loses
    /// the conditional write falls back to loading the winner.
    pub async fn load_or_create(context: &AggregateContext, props: Props) -> Result<Self, Error> {
        if let Some(instance) = Self::load(context, props.clone()).await? {
            return Ok(instance);
        }
        match Self::create(context, props.clone()).await {
            Ok(instance) => Ok(instance),
            Err(err) if err.is_version_conflict() => Self::load(context, props)
                .await?
                .ok_or(err),
            Err(err) => Err(err),
        }
    }

    /// Hydrated state of an instance, whether or not it exists yet.
    ///
    /// # Errors
    ///
    /// Propagates key derivation and store failures.
    pub async fn get_state(
        context: &AggregateContext,
        props: Props,
        options: HydrateOptions,
    ) -> Result<A::State, Error> {
        let (aggregate_key, _) = Self::derive_key(&props)?;
        let mut instance = Self::detached(context, aggregate_key);
        instance.hydrate(options).await?;
        Ok(instance.state)
    }

    /// Bring the state up to date with the store.
    ///
    /// Asking for an earlier version or time than the instance already
    /// holds resets it to version 0 first; replay is otherwise
    /// incremental, strictly after the current version. When no bound is
    /// given, a usable snapshot substitutes for the prefix of the replay;
    /// a snapshot written under a different upcaster configuration is
    /// ignored and rewritten from the freshly folded state.
    ///
    /// # Errors
    ///
    /// Propagates store and codec failures.
    pub async fn hydrate(&mut self, options: HydrateOptions) -> Result<(), Error> {
        let started = Instant::now();

        let bounded_back = options.version.is_some_and(|v| v < self.version)
            || matches!(
                (options.time, self.head_timestamp),
                (Some(bound), Some(head)) if bound < head
            );
        if bounded_back {
            self.version = 0;
            self.state = A::State::default();
            self.head_timestamp = None;
        }

        let mut rewrite_stale_snapshot = false;
        if self.version == 0 {
            if let (Some(snapshots), Some(blobs)) =
                (&self.context.config.snapshots, &self.context.blobs)
            {
                match read_snapshot(blobs.as_ref(), snapshots, A::KIND, &self.aggregate_key).await? {
                    None => {}
                    Some(snapshot) => {
                        let checksum_current = snapshot.upcasters_checksum == self.upcasters.checksum();
                        let inside_bounds = options
                            .version
                            .is_none_or(|v| v >= snapshot.version)
                            && options
                                .time
                                .is_none_or(|t| t >= snapshot.head_commit_timestamp);

                        if checksum_current && inside_bounds && snapshot.version > self.version {
                            self.state = serde_json::from_value(snapshot.state)?;
                            self.version = snapshot.version;
                            self.head_timestamp = Some(snapshot.head_commit_timestamp);
                        } else if !checksum_current {
                            tracing::warn!(
                                aggregate_type = A::KIND,
                                aggregate_key = %self.aggregate_key,
                                snapshot_version = snapshot.version,
                                "snapshot has a stale upcaster checksum; replaying from scratch"
                            );
                            rewrite_stale_snapshot = true;
                        }
                    }
                }
            }
        }

        let mut query = CommitQuery::new(A::KIND).with_key(&self.aggregate_key);
        query.min_version = self.version + 1;
        if let Some(version) = options.version {
            query.max_version = version;
        }
        query.max_time = options.time;
        query.consistent_read = options.consistent_read;

        let outcome = query
            .fetch(self.context.commits.as_ref(), &self.context.config)
            .await?;
        self.metrics.add_read(outcome.read_units_consumed);

        let replayed = outcome.commits.len();
        for commit in outcome.commits {
            self.apply_commit(commit);
        }

        let unbounded = options.version.is_none() && options.time.is_none();
        if rewrite_stale_snapshot && unbounded && self.version > 0 {
            self.write_snapshot_now().await?;
        }

        tracing::debug!(
            aggregate_type = A::KIND,
            aggregate_key = %self.aggregate_key,
            version = self.version,
            replayed,
            read_units = outcome.read_units_consumed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "hydrated"
        );
        Ok(())
    }

    /// Upcast a commit and fold its events into the state.
    fn apply_commit(&mut self, commit: Commit) {
        let commit = self.upcasters.upcast_commit(commit);
        let mut state = std::mem::take(&mut self.state);
        for event in &commit.events {
            state = A::reduce(state, event, &commit);
        }
        self.state = state;
        self.version = commit.version;
        self.head_timestamp = Some(commit.committed_at);
    }

    /// Append a commit at the next version, failing on conflict.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BusyCommitting`] if a commit on this instance is
    /// already in flight, [`Error::VersionConflict`] when a concurrent
    /// writer claimed the slot, [`Error::Configuration`] for an empty
    /// event list or version-digit overflow.
    pub async fn commit(&mut self, events: Vec<Event>) -> Result<Commit, Error> {
        self.commit_with(events, false).await
    }

    /// Append a commit, absorbing version conflicts by rehydrating and
    /// retrying under the context's [`RetryPolicy`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::RetriesExhausted`] carrying every conflict when
    /// the attempt budget runs out; other errors as for
    /// [`commit`](Self::commit).
    pub async fn commit_with_retry(&mut self, events: Vec<Event>) -> Result<Commit, Error> {
        self.commit_with(events, true).await
    }

    async fn commit_with(&mut self, events: Vec<Event>, retry: bool) -> Result<Commit, Error> {
        if let Some(version) = self.commit_in_flight {
            return Err(Error::BusyCommitting { version });
        }
        if events.is_empty() {
            return Err(Error::Configuration(
                "a commit requires at least one event".to_string(),
            ));
        }

        let started = Instant::now();
        let policy = self.context.retry.clone();
        let max_attempts = if retry { policy.max_attempts.max(1) } else { 1 };
        let mut conflicts = Vec::new();

        for attempt in 1..=max_attempts {
            let next_version = self.version + 1;
            self.commit_in_flight = Some(next_version);

            let result = self.try_commit_once(next_version, events.clone()).await;
            self.commit_in_flight = None;

            match result {
                Ok(commit) => {
                    self.apply_commit(commit.clone());
                    let frequency = self.context.config.snapshots.as_ref().map(|s| s.frequency);
                    if frequency.is_some_and(|f| self.version % f == 0) {
                        self.write_snapshot_now().await?;
                    }
                    tracing::debug!(
                        aggregate_type = A::KIND,
                        aggregate_key = %self.aggregate_key,
                        version = self.version,
                        attempt,
                        write_units = self.metrics.write_units_consumed,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "committed"
                    );
                    return Ok(commit);
                }
                Err(err) if err.is_version_conflict() && retry => {
                    tracing::debug!(
                        aggregate_type = A::KIND,
                        aggregate_key = %self.aggregate_key,
                        version = next_version,
                        attempt,
                        "version conflict; rehydrating and retrying"
                    );
                    conflicts.push(err);
                    if attempt == max_attempts {
                        break;
                    }
                    tokio::time::sleep(policy.delay_after_attempt(attempt)).await;
                    self.hydrate(HydrateOptions::default()).await?;
                }
                Err(err) => return Err(err),
            }
        }

        Err(Error::RetriesExhausted {
            attempts: max_attempts,
            errors: conflicts,
        })
    }

    async fn try_commit_once(&mut self, version: u64, events: Vec<Event>) -> Result<Commit, Error> {
        let commit = Commit::new(A::KIND, self.aggregate_key.clone(), version, Utc::now(), events);
        let record = encode_commit(&commit, self.context.config.version_digits)?;
        let receipt = self
            .context
            .commits
            .put_commit(&self.context.config.table_name, &record)
            .await?;
        self.metrics.add_write(receipt);
        Ok(commit)
    }

    /// Write the current state as this instance's snapshot.
    async fn write_snapshot_now(&mut self) -> Result<(), Error> {
        let (Some(snapshots), Some(blobs)) = (&self.context.config.snapshots, &self.context.blobs)
        else {
            return Ok(());
        };
        let Some(head_commit_timestamp) = self.head_timestamp else {
            return Ok(());
        };

        let record = SnapshotRecord {
            version: self.version,
            state: serde_json::to_value(&self.state)?,
            head_commit_timestamp,
            upcasters_checksum: self.upcasters.checksum(),
        };
        write_snapshot(blobs.as_ref(), snapshots, A::KIND, &self.aggregate_key, &record).await?;
        tracing::debug!(
            aggregate_type = A::KIND,
            aggregate_key = %self.aggregate_key,
            version = self.version,
            "snapshot written"
        );
        Ok(())
    }

    /// Every instance of this aggregate type, fully hydrated, in key
    /// order.
    ///
    /// Scans the whole partition and folds per-key commit runs; snapshots
    /// are not consulted.
    ///
    /// # Errors
    ///
    /// Propagates store and codec failures.
    pub async fn scan_instances(context: &AggregateContext) -> Result<Vec<Self>, Error> {
        let min_sort_key = String::new();
        let max_sort_key = char::MAX.to_string();

        let mut instances: Vec<Self> = Vec::new();
        let mut cursor = None;
        loop {
            let page = context
                .commits
                .query_commit_page(PageRequest {
                    table_name: context.config.table_name.clone(),
                    aggregate_type: A::KIND.to_string(),
                    min_sort_key: min_sort_key.clone(),
                    max_sort_key: max_sort_key.clone(),
                    ascending: true,
                    limit: None,
                    consistent_read: true,
                    cursor,
                })
                .await?;

            for commit in decode_page(&page)? {
                let same_key = instances
                    .last()
                    .is_some_and(|i| i.aggregate_key == commit.aggregate_key);
                if !same_key {
                    instances.push(Self::detached(context, commit.aggregate_key.clone()));
                }
                if let Some(instance) = instances.last_mut() {
                    instance.apply_commit(commit);
                }
            }

            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(instances)
    }

    /// The folded state.
    pub fn state(&self) -> &A::State {
        &self.state
    }

    /// The current version (0 before any commit is applied).
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The instance's aggregate key.
    pub fn aggregate_key(&self) -> &str {
        &self.aggregate_key
    }

    /// Capacity consumed by this instance's store calls so far.
    pub fn metrics(&self) -> StoreMetrics {
        self.metrics
    }
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::*;
    use super::*;
    use crate::snapshot::{read_snapshot, InMemoryBlobStore};
    use crate::store::{InMemoryCommitStore, WriteReceipt};
    use crate::codec::CommitRecord;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    fn context() -> AggregateContext {
        AggregateContext::new(
            Arc::new(InMemoryCommitStore::new()),
            None,
            StoreConfig::new("commits"),
        )
        .expect("context should build")
    }

    fn context_with_snapshots(frequency: u64) -> (AggregateContext, Arc<InMemoryBlobStore>) {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let context = AggregateContext::new(
            Arc::new(InMemoryCommitStore::new()),
            Some(blobs.clone()),
            StoreConfig::new("commits").with_snapshots(frequency),
        )
        .expect("context should build");
        (context, blobs)
    }

    fn add(name: &str) -> Event {
        Event::new("ItemAdded", json!({ "name": name }))
    }

    fn remove(name: &str) -> Event {
        Event::new("ItemRemoved", json!({ "name": name }))
    }

    /// Seed the three-commit history used by the load scenarios:
    /// v1 ItemAdded(firstItem), v2 ItemAdded(secondItem),
    /// v3 ItemRemoved(firstItem).
    async fn seed_three_commits(context: &AggregateContext) -> Aggregate<Cart> {
        let mut cart = Aggregate::<Cart>::create(
            context,
            props(json!({"userId": "u1", "firstItem": "firstItem"})),
        )
        .await
        .expect("create should succeed");
        cart.commit(vec![add("secondItem")]).await.expect("second commit");
        cart.commit(vec![remove("firstItem")]).await.expect("third commit");
        cart
    }

    #[tokio::test]
    async fn create_folds_initial_events() {
        let context = context();
        let cart = Aggregate::<Cart>::create(
            &context,
            props(json!({"userId": "u1", "firstItem": "apple"})),
        )
        .await
        .expect("create should succeed");

        assert_eq!(cart.version(), 1);
        assert_eq!(cart.aggregate_key(), "u1");
        assert_eq!(cart.state().items, vec!["apple"]);
    }

    #[tokio::test]
    async fn debug_renders_identity_without_state() {
        let context = context();
        let cart = Aggregate::<Cart>::create(
            &context,
            props(json!({"userId": "u1", "firstItem": "apple"})),
        )
        .await
        .expect("create should succeed");

        let rendered = format!("{cart:?}");
        assert!(rendered.contains("Cart"), "got: {rendered}");
        assert!(rendered.contains("u1"), "got: {rendered}");
        assert!(format!("{context:?}").contains("AggregateContext"));
    }

    #[tokio::test]
    async fn create_over_existing_is_a_version_conflict() {
        let context = context();
        seed_three_commits(&context).await;

        let err = Aggregate::<Cart>::create(&context, props(json!({"userId": "u1"})))
            .await
            .unwrap_err();
        assert!(err.is_version_conflict(), "got: {err}");
    }

    #[tokio::test]
    async fn create_without_required_key_prop_fails() {
        let context = context();
        let err = Aggregate::<Cart>::create(&context, props(json!({"firstItem": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingKeyProperty(p) if p == "userId"));
    }

    #[tokio::test]
    async fn load_replays_the_full_history() {
        let context = context();
        seed_three_commits(&context).await;

        let cart = Aggregate::<Cart>::load(&context, props(json!({"userId": "u1"})))
            .await
            .expect("load should succeed")
            .expect("instance should exist");
        assert_eq!(cart.version(), 3);
        assert_eq!(cart.state().items, vec!["secondItem"]);
    }

    #[tokio::test]
    async fn load_at_version_travels_back() {
        let context = context();
        seed_three_commits(&context).await;

        let cart = Aggregate::<Cart>::load_at(
            &context,
            props(json!({"userId": "u1"})),
            HydrateOptions {
                version: Some(2),
                time: None,
                ..HydrateOptions::default()
            },
        )
        .await
        .unwrap()
        .expect("instance should exist at version 2");
        assert_eq!(cart.version(), 2);
        assert_eq!(cart.state().items, vec!["firstItem", "secondItem"]);
    }

    #[tokio::test]
    async fn load_at_time_travels_back() {
        let context = context();
        let cart = seed_three_commits(&context).await;
        let second_commit_time = {
            // Reload at version 2 to learn its timestamp.
            let at2 = Aggregate::<Cart>::load_at(
                &context,
                props(json!({"userId": "u1"})),
                HydrateOptions {
                    version: Some(2),
                    time: None,
                    ..HydrateOptions::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
            at2.head_timestamp.expect("head timestamp should be set")
        };
        assert_eq!(cart.version(), 3);

        let at_time = Aggregate::<Cart>::load_at(
            &context,
            props(json!({"userId": "u1"})),
            HydrateOptions {
                version: None,
                time: Some(second_commit_time),
                ..HydrateOptions::default()
            },
        )
        .await
        .unwrap()
        .expect("instance should exist at that time");
        assert!(at_time.version() >= 2, "time bound must include the second commit");
        assert!(at_time.state().items.contains(&"secondItem".to_string()));
    }

    #[tokio::test]
    async fn hydrate_is_idempotent() {
        let context = context();
        seed_three_commits(&context).await;

        let mut cart = Aggregate::<Cart>::load(&context, props(json!({"userId": "u1"})))
            .await
            .unwrap()
            .unwrap();
        let before = cart.state().clone();
        cart.hydrate(HydrateOptions::default()).await.expect("rehydrate");
        assert_eq!(cart.state(), &before);
        assert_eq!(cart.version(), 3);
    }

    #[tokio::test]
    async fn hydrate_resets_when_asked_for_an_earlier_version() {
        let context = context();
        seed_three_commits(&context).await;

        let mut cart = Aggregate::<Cart>::load(&context, props(json!({"userId": "u1"})))
            .await
            .unwrap()
            .unwrap();
        cart.hydrate(HydrateOptions {
            version: Some(1),
            time: None,
            ..HydrateOptions::default()
        })
        .await
        .expect("hydrate back");
        assert_eq!(cart.version(), 1);
        assert_eq!(cart.state().items, vec!["firstItem"]);
    }

    #[tokio::test]
    async fn load_of_missing_instance_is_none_and_require_fails() {
        let context = context();
        let loaded = Aggregate::<Cart>::load(&context, props(json!({"userId": "nobody"})))
            .await
            .unwrap();
        assert!(loaded.is_none());

        let err = Aggregate::<Cart>::require(&context, props(json!({"userId": "nobody"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AggregateNotFound { .. }));
    }

    #[tokio::test]
    async fn require_on_a_singleton_returns_the_empty_instance() {
        let context = context();
        let counter = Aggregate::<Counter>::require(&context, Props::new())
            .await
            .expect("singletons always exist");
        assert_eq!(counter.version(), 0);
        assert_eq!(counter.aggregate_key(), SINGLETON_KEY);
    }

    #[tokio::test]
    async fn load_or_create_creates_then_loads() {
        let context = context();
        let created =
            Aggregate::<Cart>::load_or_create(&context, props(json!({"userId": "u9"})))
                .await
                .expect("first call creates");
        assert_eq!(created.version(), 1);

        let loaded =
            Aggregate::<Cart>::load_or_create(&context, props(json!({"userId": "u9"})))
                .await
                .expect("second call loads");
        assert_eq!(loaded.version(), 1);
        assert_eq!(loaded.state(), created.state());
    }

    #[tokio::test]
    async fn get_state_of_missing_instance_is_default() {
        let context = context();
        let state = Aggregate::<Cart>::get_state(
            &context,
            props(json!({"userId": "ghost"})),
            HydrateOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(state, CartState::default());
    }

    #[tokio::test]
    async fn concurrent_commit_without_retry_conflicts() {
        let context = context();
        seed_three_commits(&context).await;

        let mut a = Aggregate::<Cart>::load(&context, props(json!({"userId": "u1"})))
            .await
            .unwrap()
            .unwrap();
        let mut b = Aggregate::<Cart>::load(&context, props(json!({"userId": "u1"})))
            .await
            .unwrap()
            .unwrap();

        a.commit(vec![add("fromA")]).await.expect("first writer wins");
        let err = b.commit(vec![add("fromB")]).await.unwrap_err();
        assert!(err.is_version_conflict(), "got: {err}");
    }

    #[tokio::test]
    async fn concurrent_commit_with_retry_rehydrates_and_lands() {
        let context = context();
        seed_three_commits(&context).await;

        let mut a = Aggregate::<Cart>::load(&context, props(json!({"userId": "u1"})))
            .await
            .unwrap()
            .unwrap();
        let mut b = Aggregate::<Cart>::load(&context, props(json!({"userId": "u1"})))
            .await
            .unwrap()
            .unwrap();

        a.commit(vec![add("fromA")]).await.expect("first writer wins");
        let commit = b
            .commit_with_retry(vec![add("fromB")])
            .await
            .expect("retry should land after rehydrating");
        assert_eq!(commit.version, 5);
        assert_eq!(b.version(), 5);
        assert!(b.state().items.contains(&"fromA".to_string()));
        assert!(b.state().items.contains(&"fromB".to_string()));
    }

    #[tokio::test]
    async fn commit_failure_does_not_leave_the_instance_busy() {
        let context = context();
        seed_three_commits(&context).await;

        let mut a = Aggregate::<Cart>::load(&context, props(json!({"userId": "u1"})))
            .await
            .unwrap()
            .unwrap();
        let mut b = Aggregate::<Cart>::load(&context, props(json!({"userId": "u1"})))
            .await
            .unwrap()
            .unwrap();

        a.commit(vec![add("fromA")]).await.unwrap();
        b.commit(vec![add("fromB")]).await.unwrap_err();

        // The busy flag must have been cleared on the failure path.
        b.hydrate(HydrateOptions::default()).await.unwrap();
        b.commit(vec![add("again")]).await.expect("commit after failure");
    }

    #[tokio::test]
    async fn empty_commit_is_rejected() {
        let context = context();
        let mut cart = seed_three_commits(&context).await;
        let err = cart.commit(Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    /// Commit store that refuses every write with a version conflict.
    struct AlwaysConflicting {
        inner: InMemoryCommitStore,
    }

    #[async_trait]
    impl CommitStore for AlwaysConflicting {
        async fn put_commit(
            &self,
            _table_name: &str,
            record: &CommitRecord,
        ) -> Result<WriteReceipt, Error> {
            let (key, version) = record
                .sort_key
                .rsplit_once(':')
                .map(|(k, v)| (k.to_string(), v.parse().unwrap_or_default()))
                .unwrap_or_default();
            Err(Error::VersionConflict {
                aggregate_type: record.aggregate_type.clone(),
                aggregate_key: key,
                version,
            })
        }

        async fn query_commit_page(
            &self,
            request: crate::store::PageRequest,
        ) -> Result<crate::store::RecordPage, Error> {
            self.inner.query_commit_page(request).await
        }

        async fn global_commit_page(
            &self,
            request: crate::store::GlobalPageRequest,
        ) -> Result<crate::store::RecordPage, Error> {
            self.inner.global_commit_page(request).await
        }
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_carries_the_conflicts() {
        let context = AggregateContext::new(
            Arc::new(AlwaysConflicting {
                inner: InMemoryCommitStore::new(),
            }),
            None,
            StoreConfig::new("commits"),
        )
        .unwrap()
        .with_retry_policy(RetryPolicy {
            initial_delay: Duration::ZERO,
            max_attempts: 3,
            ..RetryPolicy::default()
        });

        let mut counter = Aggregate::<Counter>::require(&context, Props::new())
            .await
            .unwrap();
        let err = counter
            .commit_with_retry(vec![Event::new("Incremented", json!({}))])
            .await
            .unwrap_err();
        match err {
            Error::RetriesExhausted { attempts, errors } => {
                assert_eq!(attempts, 3);
                assert_eq!(errors.len(), 3);
                assert!(errors.iter().all(Error::is_version_conflict));
            }
            other => panic!("expected RetriesExhausted, got {other}"),
        }
    }

    #[tokio::test]
    async fn snapshot_is_written_at_the_configured_frequency() {
        let (context, blobs) = context_with_snapshots(2);
        let mut cart = Aggregate::<Cart>::create(
            &context,
            props(json!({"userId": "u1", "firstItem": "a"})),
        )
        .await
        .unwrap();
        assert!(
            read_snapshot(blobs.as_ref(), context.config().snapshots.as_ref().unwrap(), "Cart", "u1")
                .await
                .unwrap()
                .is_none(),
            "no snapshot after version 1"
        );

        cart.commit(vec![add("b")]).await.unwrap();
        let snap = read_snapshot(
            blobs.as_ref(),
            context.config().snapshots.as_ref().unwrap(),
            "Cart",
            "u1",
        )
        .await
        .unwrap()
        .expect("snapshot at version 2");
        assert_eq!(snap.version, 2);
        assert_eq!(snap.state, serde_json::to_value(cart.state()).unwrap());
        assert_eq!(snap.upcasters_checksum, None);
    }

    #[tokio::test]
    async fn snapshots_are_transparent_to_loads() {
        let (context, _blobs) = context_with_snapshots(2);
        let mut cart = Aggregate::<Cart>::create(
            &context,
            props(json!({"userId": "u1", "firstItem": "a"})),
        )
        .await
        .unwrap();
        cart.commit(vec![add("b")]).await.unwrap();
        cart.commit(vec![add("c")]).await.unwrap();

        // Same store without snapshots: pure replay.
        let replay_only = AggregateContext::new(
            context.commit_store().clone(),
            None,
            StoreConfig::new("commits"),
        )
        .unwrap();

        let from_snapshot = Aggregate::<Cart>::load(&context, props(json!({"userId": "u1"})))
            .await
            .unwrap()
            .unwrap();
        let from_replay = Aggregate::<Cart>::load(&replay_only, props(json!({"userId": "u1"})))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(from_snapshot.version(), from_replay.version());
        assert_eq!(from_snapshot.state(), from_replay.state());
    }

    #[tokio::test]
    async fn stale_snapshot_checksum_forces_replay_and_rewrite() {
        let (context, blobs) = context_with_snapshots(2);

        // History written (and snapshotted) before any upcaster existed.
        let mut cart = Aggregate::<Cart>::create(
            &context,
            props(json!({"userId": "u1", "firstItem": "a"})),
        )
        .await
        .unwrap();
        cart.commit(vec![add("b")]).await.unwrap();
        let old = read_snapshot(
            blobs.as_ref(),
            context.config().snapshots.as_ref().unwrap(),
            "Cart",
            "u1",
        )
        .await
        .unwrap()
        .expect("pre-upcaster snapshot");
        assert_eq!(old.upcasters_checksum, None);
        assert_eq!(old.state["items"], json!(["a", "b"]));

        // Load under the upcasted type: the old snapshot must be ignored,
        // every event replayed through the upcaster, and the snapshot
        // rewritten with the new checksum.
        let upcasted = Aggregate::<CartV2>::load(&context, props(json!({"userId": "u1"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(upcasted.state().items, vec!["_a_", "_b_"]);

        let rewritten = read_snapshot(
            blobs.as_ref(),
            context.config().snapshots.as_ref().unwrap(),
            "Cart",
            "u1",
        )
        .await
        .unwrap()
        .expect("rewritten snapshot");
        assert_eq!(rewritten.version, 2);
        assert_eq!(rewritten.state["items"], json!(["_a_", "_b_"]));
        assert!(rewritten.upcasters_checksum.is_some());

        // A second load finds the fresh checksum and uses the snapshot.
        let again = Aggregate::<CartV2>::load(&context, props(json!({"userId": "u1"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.state().items, vec!["_a_", "_b_"]);
    }

    #[tokio::test]
    async fn snapshots_without_a_blob_store_are_a_configuration_error() {
        let err = AggregateContext::new(
            Arc::new(InMemoryCommitStore::new()),
            None,
            StoreConfig::new("commits").with_snapshots(10),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn scan_instances_folds_every_key() {
        let context = context();
        for user in ["u1", "u2", "u3"] {
            let mut cart = Aggregate::<Cart>::create(
                &context,
                props(json!({"userId": user, "firstItem": format!("{user}-item")})),
            )
            .await
            .unwrap();
            if user == "u2" {
                cart.commit(vec![add("extra")]).await.unwrap();
            }
        }

        let instances = Aggregate::<Cart>::scan_instances(&context)
            .await
            .expect("scan should succeed");
        let keys: Vec<&str> = instances.iter().map(Aggregate::aggregate_key).collect();
        assert_eq!(keys, vec!["u1", "u2", "u3"], "instances come back in key order");
        assert_eq!(instances[1].version(), 2);
        assert_eq!(instances[1].state().items, vec!["u2-item", "extra"]);
    }

    #[tokio::test]
    async fn singleton_counter_roundtrips() {
        let context = context();
        let mut counter = Aggregate::<Counter>::create(&context, Props::new())
            .await
            .expect("create singleton");
        counter
            .commit(vec![Event::new("Incremented", json!({}))])
            .await
            .unwrap();

        let loaded = Aggregate::<Counter>::load(&context, Props::new())
            .await
            .unwrap()
            .expect("singleton exists after create");
        assert_eq!(loaded.state().count, 2);
        assert_eq!(loaded.aggregate_key(), SINGLETON_KEY);
    }
}
