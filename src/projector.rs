//! Projector engine: ordered, per-entity-serialized, bounded-concurrency
//! delivery of committed events to downstream projections.
//!
//! The projector tails the global commit index into a bounded buffer and
//! repeatedly extracts the longest prefix that is safe to process in
//! parallel: commits of distinct entities run concurrently, a second
//! commit of an entity already in the batch stays behind, and commits of
//! an exclusive aggregate type run strictly alone. Checkpoints bracket
//! each batch so a crash mid-batch is detected on the next startup and
//! answered with a full rebuild.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::codec::Commit;
use crate::config::StoreConfig;
use crate::error::Error;
use crate::store::{decode_page, CommitStore, GlobalPageRequest};

/// Durable position of one projection in the global commit order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProjectionCheckpoint {
    /// Commit id of the last fully processed commit. Empty means "from
    /// the beginning".
    pub head_commit_id: String,
    /// True while a batch containing this projection is being processed.
    /// Found true at startup, it means a previous run died mid-batch.
    pub commits_in_progress: bool,
}

/// A downstream consumer of committed events.
///
/// Implementations own their state and their checkpoint storage; the
/// projector only tells them what to process and when to move the
/// checkpoint. `process_commit` must be idempotent: after a crash
/// mid-batch the whole history is replayed.
#[async_trait]
pub trait Projection: Send + Sync {
    /// Projection name, for logging.
    fn name(&self) -> &str;

    /// Apply one commit.
    ///
    /// # Errors
    ///
    /// Any error is fatal to the projector run.
    async fn process_commit(&self, commit: &Commit) -> Result<(), Error>;

    /// Read the stored checkpoint.
    async fn checkpoint(&self) -> Result<ProjectionCheckpoint, Error>;

    /// Replace the stored checkpoint.
    async fn save_checkpoint(&self, checkpoint: &ProjectionCheckpoint) -> Result<(), Error>;

    /// Discard all projected state, returning to the from-scratch
    /// position.
    async fn clear(&self) -> Result<(), Error>;
}

/// Tuning knobs for the projector loop.
#[derive(Debug, Clone)]
pub struct ProjectorConfig {
    /// Sleep between polls when the buffer runs dry.
    pub poll_interval: Duration,
    /// Upper bound on buffered commits.
    pub buffer_capacity: usize,
    /// Refill the buffer when it drops below this many commits.
    pub refill_threshold: usize,
    /// Commits processed concurrently within one batch.
    pub concurrency: usize,
    /// Aggregate types whose commits must be processed alone.
    pub exclusive_types: HashSet<String>,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            buffer_capacity: 100,
            refill_threshold: 10,
            concurrency: 10,
            exclusive_types: HashSet::new(),
        }
    }
}

/// Pull the longest safely-parallel batch off the front of the buffer.
///
/// Scanning front to back: a commit joins the batch unless its entity is
/// already represented (it stays in the buffer, and so does everything
/// later for that entity). A commit of an exclusive type stops the scan;
/// at the front it forms a batch of one. The relative order of commits
/// left in the buffer is preserved, so an empty result implies an empty
/// buffer.
pub fn extract_batch(
    buffer: &mut VecDeque<Commit>,
    exclusive_types: &HashSet<String>,
) -> Vec<Commit> {
    let Some(first) = buffer.front() else {
        return Vec::new();
    };
    if exclusive_types.contains(&first.aggregate_type) {
        return buffer.pop_front().into_iter().collect();
    }

    let mut batch = Vec::new();
    let mut batch_entities = HashSet::new();
    let mut remaining = VecDeque::with_capacity(buffer.len());
    let mut halted = false;

    while let Some(commit) = buffer.pop_front() {
        if halted {
            remaining.push_back(commit);
            continue;
        }
        if exclusive_types.contains(&commit.aggregate_type) {
            halted = true;
            remaining.push_back(commit);
            continue;
        }
        if batch_entities.contains(&commit.aggregate_id()) {
            remaining.push_back(commit);
            continue;
        }
        batch_entities.insert(commit.aggregate_id());
        batch.push(commit);
    }

    *buffer = remaining;
    batch
}

/// Drives a set of projections over the global commit index.
pub struct Projector {
    commits: Arc<dyn CommitStore>,
    config: StoreConfig,
    options: ProjectorConfig,
    projections: Vec<Arc<dyn Projection>>,
}

impl Projector {
    /// Build a projector over a commit store.
    pub fn new(commits: Arc<dyn CommitStore>, config: StoreConfig, options: ProjectorConfig) -> Self {
        Self {
            commits,
            config,
            options,
            projections: Vec::new(),
        }
    }

    /// Register a projection. All registered projections advance in
    /// lockstep.
    pub fn register(mut self, projection: Arc<dyn Projection>) -> Self {
        self.projections.push(projection);
        self
    }

    /// Verify checkpoint consistency and return the head to resume from.
    ///
    /// Any checkpoint flagged in-progress, or checkpoints naming
    /// different heads, mean a previous run died partway through a batch
    /// and some projections may have processed commits others have not.
    /// The only safe answer is to clear every projection and rebuild
    /// from the beginning.
    async fn startup_check(&self) -> Result<String, Error> {
        if self.projections.is_empty() {
            return Err(Error::Configuration(
                "projector has no registered projections".to_string(),
            ));
        }

        let mut checkpoints = Vec::with_capacity(self.projections.len());
        for projection in &self.projections {
            checkpoints.push(projection.checkpoint().await?);
        }

        let any_in_progress = checkpoints.iter().any(|c| c.commits_in_progress);
        let heads_disagree = checkpoints
            .windows(2)
            .any(|pair| pair[0].head_commit_id != pair[1].head_commit_id);

        if any_in_progress || heads_disagree {
            tracing::warn!(
                any_in_progress,
                heads_disagree,
                "projection checkpoints are inconsistent; clearing all projections and rebuilding"
            );
            for projection in &self.projections {
                projection.clear().await?;
                projection
                    .save_checkpoint(&ProjectionCheckpoint::default())
                    .await?;
            }
            return Ok(String::new());
        }

        Ok(checkpoints
            .first()
            .map(|c| c.head_commit_id.clone())
            .unwrap_or_default())
    }

    /// Top up the buffer from the global index, starting strictly after
    /// `fetched_through`.
    async fn refill(
        &self,
        fetched_through: &mut String,
        buffer: &mut VecDeque<Commit>,
    ) -> Result<(), Error> {
        while buffer.len() < self.options.buffer_capacity {
            let page = self
                .commits
                .global_commit_page(GlobalPageRequest {
                    table_name: self.config.table_name.clone(),
                    after_commit_id: fetched_through.clone(),
                    limit: Some(self.options.buffer_capacity - buffer.len()),
                    cursor: None,
                })
                .await?;
            if page.records.is_empty() {
                return Ok(());
            }
            let commits = decode_page(&page)?;
            if let Some(last) = commits.last() {
                *fetched_through = last.commit_id.clone();
            }
            buffer.extend(commits);
            if page.next.is_none() {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Process one extracted batch: mark in-progress, run every commit
    /// through every projection under the concurrency bound, then advance
    /// the checkpoint head.
    ///
    /// The persisted head is a contiguous watermark: every commit at or
    /// before it has been processed, and nothing after it has been
    /// skipped. While a commit sits deferred in the buffer the head stops
    /// just before it, even when later commits in this batch already ran,
    /// so a run that stops there resumes at the deferred commit instead
    /// of past it. Once nothing remains deferred the head jumps to the
    /// highest processed commit id.
    async fn process_batch(
        &self,
        head: &mut String,
        high_mark: &mut String,
        batch: Vec<Commit>,
        deferred_floor: Option<&str>,
    ) -> Result<(), Error> {
        let in_progress = ProjectionCheckpoint {
            head_commit_id: head.clone(),
            commits_in_progress: true,
        };
        for projection in &self.projections {
            projection.save_checkpoint(&in_progress).await?;
        }

        let batch_len = batch.len();

        for chunk in batch.chunks(self.options.concurrency.max(1)) {
            let mut tasks = JoinSet::new();
            for commit in chunk {
                let commit = commit.clone();
                let projections = self.projections.clone();
                tasks.spawn(async move {
                    for projection in &projections {
                        projection.process_commit(&commit).await?;
                    }
                    Ok::<(), Error>(())
                });
            }
            while let Some(joined) = tasks.join_next().await {
                joined.map_err(|e| Error::Store(format!("projection task panicked: {e}")))??;
            }
        }

        if let Some(last) = batch.last() {
            if last.commit_id > *high_mark {
                *high_mark = last.commit_id.clone();
            }
        }
        let new_head = match deferred_floor {
            None => high_mark.clone(),
            // Batch order is commit-id order, so the last batch commit
            // below the deferred floor is the furthest contiguous point.
            Some(floor) => batch
                .iter()
                .rev()
                .find(|c| c.commit_id.as_str() < floor)
                .map(|c| c.commit_id.clone())
                .filter(|id| id.as_str() > head.as_str())
                .unwrap_or_else(|| head.clone()),
        };
        *head = new_head;
        let done = ProjectionCheckpoint {
            head_commit_id: head.clone(),
            commits_in_progress: false,
        };
        for projection in &self.projections {
            projection.save_checkpoint(&done).await?;
        }

        tracing::debug!(
            batch = batch_len,
            head = %head,
            "processed projection batch"
        );
        Ok(())
    }

    /// Process everything currently in the store, then return how many
    /// commits were processed.
    ///
    /// This is the one-shot entry point; [`start`](Self::start) wraps
    /// the same machinery in a polling loop.
    ///
    /// # Errors
    ///
    /// Any projection or store error aborts immediately, leaving
    /// checkpoints flagged in-progress so the next run rebuilds.
    pub async fn catch_up(&self) -> Result<u64, Error> {
        let mut head = self.startup_check().await?;
        let mut high_mark = head.clone();
        let mut fetched_through = head.clone();
        let mut buffer = VecDeque::new();
        let mut processed = 0u64;

        loop {
            if buffer.len() < self.options.refill_threshold {
                self.refill(&mut fetched_through, &mut buffer).await?;
            }
            let batch = extract_batch(&mut buffer, &self.options.exclusive_types);
            if batch.is_empty() {
                return Ok(processed);
            }
            processed += batch.len() as u64;
            let deferred = buffer.front().map(|c| c.commit_id.clone());
            self.process_batch(&mut head, &mut high_mark, batch, deferred.as_deref())
                .await?;
        }
    }

    /// Run until shutdown is signalled, polling for new commits whenever
    /// the buffer runs dry.
    ///
    /// # Errors
    ///
    /// Fatal on the first projection or store error.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        let mut head = self.startup_check().await?;
        let mut high_mark = head.clone();
        let mut fetched_through = head.clone();
        let mut buffer = VecDeque::new();

        tracing::info!(head = %head, "projector started");
        loop {
            if *shutdown.borrow() {
                tracing::info!(head = %head, "projector shut down");
                return Ok(());
            }

            if buffer.len() < self.options.refill_threshold {
                self.refill(&mut fetched_through, &mut buffer).await?;
            }

            let batch = extract_batch(&mut buffer, &self.options.exclusive_types);
            if batch.is_empty() {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    () = tokio::time::sleep(self.options.poll_interval) => {}
                }
                continue;
            }

            let deferred = buffer.front().map(|c| c.commit_id.clone());
            self.process_batch(&mut head, &mut high_mark, batch, deferred.as_deref())
                .await?;
        }
    }

    /// Spawn the polling loop on the current runtime.
    pub fn start(self) -> ProjectorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        ProjectorHandle { shutdown_tx, task }
    }
}

/// Handle to a running projector task.
pub struct ProjectorHandle {
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<Result<(), Error>>,
}

impl ProjectorHandle {
    /// Signal shutdown and wait for the loop to exit.
    ///
    /// # Errors
    ///
    /// Surfaces the run loop's error, if it died before shutdown.
    pub async fn shutdown(self) -> Result<(), Error> {
        let _ = self.shutdown_tx.send(true);
        self.task
            .await
            .map_err(|e| Error::Store(format!("projector task panicked: {e}")))?
    }
}
