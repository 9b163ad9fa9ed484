//! Event subscriptions: filter-clause matching and a poll-based live
//! feed of decorated events from the global commit index.
//!
//! A subscription is a set of filter clauses. Within a clause every
//! present field must match (AND); a subscription matches when any of its
//! clauses does (OR). Matched events are delivered *decorated*: the
//! event's JSON merged with its commit's metadata, the commit's fields
//! winning on collision, so a consumer sees the commit version rather
//! than the event's schema version.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::codec::{Commit, Event};
use crate::config::StoreConfig;
use crate::error::Error;
use crate::store::{decode_page, CommitStore, GlobalPageRequest};

/// One conjunction of event filters. Empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterClause {
    /// Event types to accept.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_types: Vec<String>,
    /// Aggregate types to accept.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregate_types: Vec<String>,
    /// Exact aggregate keys to accept.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregate_keys: Vec<String>,
    /// `*`-wildcard patterns over the aggregate key; any match accepts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregate_key_patterns: Vec<String>,
}

impl FilterClause {
    /// Whether every present field of this clause matches the event.
    pub fn matches(&self, commit: &Commit, event: &Event) -> bool {
        (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
            && (self.aggregate_types.is_empty()
                || self.aggregate_types.contains(&commit.aggregate_type))
            && (self.aggregate_keys.is_empty()
                || self.aggregate_keys.contains(&commit.aggregate_key))
            && (self.aggregate_key_patterns.is_empty()
                || self
                    .aggregate_key_patterns
                    .iter()
                    .any(|p| wildcard_match(p, &commit.aggregate_key)))
    }
}

/// A set of OR-ed filter clauses. An empty set is the unfiltered
/// subscription and matches every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// The clauses; any one matching accepts the event.
    pub clauses: Vec<FilterClause>,
}

impl Subscription {
    /// Subscribe to everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Subscribe to a single clause.
    pub fn single(clause: FilterClause) -> Self {
        Self {
            clauses: vec![clause],
        }
    }

    /// Whether this subscription accepts the event.
    pub fn matches(&self, commit: &Commit, event: &Event) -> bool {
        self.clauses.is_empty() || self.clauses.iter().any(|c| c.matches(commit, event))
    }
}

/// Match `text` against a pattern where `*` spans any run of characters.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }
    let parts: Vec<&str> = pattern.split('*').collect();

    let first = parts[0];
    if !text.starts_with(first) {
        return false;
    }
    let mut rest = &text[first.len()..];

    let last = parts[parts.len() - 1];
    for middle in &parts[1..parts.len() - 1] {
        if middle.is_empty() {
            continue;
        }
        match rest.find(middle) {
            Some(at) => rest = &rest[at + middle.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

/// Merge an event's JSON with its commit's metadata, the commit winning
/// on shared field names.
///
/// # Errors
///
/// Returns [`Error::Codec`] if either side fails to serialize.
pub fn decorate_event(commit: &Commit, event: &Event) -> Result<Value, Error> {
    let Value::Object(mut decorated) = serde_json::to_value(event)? else {
        return Err(Error::Codec("event did not serialize to an object".to_string()));
    };
    let Value::Object(commit_fields) = serde_json::to_value(commit)? else {
        return Err(Error::Codec("commit did not serialize to an object".to_string()));
    };
    for (name, value) in commit_fields {
        if name == "events" {
            continue;
        }
        decorated.insert(name, value);
    }
    Ok(Value::Object(decorated))
}

/// Tuning for a live event stream.
#[derive(Debug, Clone)]
pub struct EventStreamConfig {
    /// Sleep between polls of the global index.
    pub poll_interval: Duration,
    /// Capacity of the delivery channel.
    pub channel_capacity: usize,
    /// Deliver only commits with an id strictly greater than this.
    /// Empty streams the whole history first.
    pub after_commit_id: String,
}

impl Default for EventStreamConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            channel_capacity: 256,
            after_commit_id: String::new(),
        }
    }
}

/// A running live feed of decorated events.
pub struct EventStream {
    receiver: mpsc::Receiver<Value>,
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<Result<(), Error>>,
}

impl EventStream {
    /// Spawn a polling task that tails the global index and delivers
    /// every event matching `subscription`, decorated, in commit order.
    pub fn start(
        commits: Arc<dyn CommitStore>,
        store_config: StoreConfig,
        subscription: Subscription,
        config: EventStreamConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_stream(
            commits,
            store_config,
            subscription,
            config,
            sender,
            shutdown_rx,
        ));
        Self {
            receiver,
            shutdown_tx,
            task,
        }
    }

    /// Receive the next decorated event, or `None` once the feed has
    /// shut down.
    pub async fn recv(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }

    /// Signal shutdown and wait for the polling task to exit.
    ///
    /// # Errors
    ///
    /// Surfaces the polling task's error, if it died before shutdown.
    pub async fn shutdown(self) -> Result<(), Error> {
        let _ = self.shutdown_tx.send(true);
        drop(self.receiver);
        self.task
            .await
            .map_err(|e| Error::Store(format!("event stream task panicked: {e}")))?
    }
}

async fn run_stream(
    commits: Arc<dyn CommitStore>,
    store_config: StoreConfig,
    subscription: Subscription,
    config: EventStreamConfig,
    sender: mpsc::Sender<Value>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    let mut after = config.after_commit_id.clone();
    let mut pending: VecDeque<Value> = VecDeque::new();

    tracing::debug!(after = %after, "event stream started");
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        if pending.is_empty() {
            let page = commits
                .global_commit_page(GlobalPageRequest {
                    table_name: store_config.table_name.clone(),
                    after_commit_id: after.clone(),
                    limit: None,
                    cursor: None,
                })
                .await?;
            for commit in decode_page(&page)? {
                for event in &commit.events {
                    if subscription.matches(&commit, event) {
                        pending.push_back(decorate_event(&commit, event)?);
                    }
                }
                after = commit.commit_id.clone();
            }
        }

        if pending.is_empty() {
            tokio::select! {
                _ = shutdown.changed() => {}
                () = tokio::time::sleep(config.poll_interval) => {}
            }
            continue;
        }

        while let Some(decorated) = pending.pop_front() {
            if sender.send(decorated).await.is_err() {
                // Consumer hung up; nothing left to deliver to.
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_commit, SINGLETON_KEY};
    use crate::store::InMemoryCommitStore;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn commit_with(aggregate_type: &str, key: &str, version: u64, events: Vec<Event>) -> Commit {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
            + chrono::Duration::milliseconds(version as i64);
        Commit::new(aggregate_type, key, version, at, events)
    }

    mod wildcard {
        use super::super::wildcard_match;

        #[test]
        fn literal_patterns_require_equality() {
            assert!(wildcard_match("user-1", "user-1"));
            assert!(!wildcard_match("user-1", "user-12"));
        }

        #[test]
        fn star_spans_any_run() {
            assert!(wildcard_match("user-*", "user-42"));
            assert!(wildcard_match("*-42", "user-42"));
            assert!(wildcard_match("u*2", "user-42"));
            assert!(wildcard_match("*", "anything"));
            assert!(wildcard_match("*", ""));
        }

        #[test]
        fn middles_must_appear_in_order() {
            assert!(wildcard_match("a*b*c", "a-x-b-y-c"));
            assert!(!wildcard_match("a*b*c", "a-x-c-y-b"));
        }

        #[test]
        fn star_matches_empty_runs() {
            assert!(wildcard_match("user-*", "user-"));
            assert!(wildcard_match("a**b", "ab"));
        }
    }

    #[test]
    fn clause_fields_are_anded() {
        let clause = FilterClause {
            event_types: vec!["ItemAdded".into()],
            aggregate_types: vec!["Cart".into()],
            ..FilterClause::default()
        };
        let event = Event::new("ItemAdded", json!({}));
        let hit = commit_with("Cart", "u", 1, vec![]);
        let miss_type = commit_with("Order", "u", 1, vec![]);

        assert!(clause.matches(&hit, &event));
        assert!(!clause.matches(&miss_type, &event));
        assert!(!clause.matches(&hit, &Event::new("ItemRemoved", json!({}))));
    }

    #[test]
    fn clauses_are_ored() {
        let subscription = Subscription {
            clauses: vec![
                FilterClause {
                    aggregate_types: vec!["Cart".into()],
                    ..FilterClause::default()
                },
                FilterClause {
                    event_types: vec!["Shipped".into()],
                    ..FilterClause::default()
                },
            ],
        };
        let event = Event::new("Shipped", json!({}));
        assert!(subscription.matches(&commit_with("Order", "o1", 1, vec![]), &event));
        assert!(subscription.matches(
            &commit_with("Cart", "u", 1, vec![]),
            &Event::new("ItemAdded", json!({}))
        ));
        assert!(!subscription.matches(
            &commit_with("Order", "o1", 1, vec![]),
            &Event::new("ItemAdded", json!({}))
        ));
    }

    #[test]
    fn empty_subscription_matches_everything() {
        let event = Event::new("Anything", json!({}));
        assert!(Subscription::all().matches(&commit_with("X", SINGLETON_KEY, 1, vec![]), &event));
    }

    #[test]
    fn key_patterns_match_with_wildcards() {
        let clause = FilterClause {
            aggregate_key_patterns: vec!["tenant-a.*".into()],
            ..FilterClause::default()
        };
        let event = Event::new("E", json!({}));
        assert!(clause.matches(&commit_with("Doc", "tenant-a.doc7", 1, vec![]), &event));
        assert!(!clause.matches(&commit_with("Doc", "tenant-b.doc7", 1, vec![]), &event));
    }

    #[test]
    fn decoration_merges_commit_fields_over_event_fields() {
        let event = Event {
            event_type: "ItemAdded".into(),
            properties: json!({"name": "x"}),
            schema_version: 2,
        };
        let commit = commit_with("Cart", "u", 7, vec![event.clone()]);
        let decorated = decorate_event(&commit, &event).expect("decorate should succeed");

        assert_eq!(decorated["type"], "ItemAdded");
        assert_eq!(decorated["properties"], json!({"name": "x"}));
        assert_eq!(decorated["aggregate_type"], "Cart");
        assert_eq!(decorated["aggregate_key"], "u");
        assert_eq!(decorated["commit_id"], commit.commit_id.as_str());
        assert_eq!(
            decorated["version"], 7,
            "the commit version must win over the event's schema version"
        );
        assert!(
            decorated.get("events").is_none(),
            "the commit's event list must not be embedded"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stream_delivers_matching_events_in_commit_order() {
        let store = Arc::new(InMemoryCommitStore::new());
        let config = StoreConfig::new("commits");

        for (version, name) in [(1u64, "a"), (2, "b")] {
            let c = commit_with(
                "Cart",
                "u",
                version,
                vec![
                    Event::new("ItemAdded", json!({"name": name})),
                    Event::new("Ignored", json!({})),
                ],
            );
            let record = encode_commit(&c, 9).unwrap();
            store.put_commit("commits", &record).await.unwrap();
        }

        let subscription = Subscription::single(FilterClause {
            event_types: vec!["ItemAdded".into()],
            ..FilterClause::default()
        });
        let mut stream = EventStream::start(
            store.clone(),
            config,
            subscription,
            EventStreamConfig {
                poll_interval: Duration::from_millis(10),
                ..EventStreamConfig::default()
            },
        );

        let first = stream.recv().await.expect("first event");
        assert_eq!(first["properties"]["name"], "a");
        assert_eq!(first["version"], 1);
        let second = stream.recv().await.expect("second event");
        assert_eq!(second["properties"]["name"], "b");
        assert_eq!(second["version"], 2);

        // A commit landing after startup is picked up on a later poll.
        let c = commit_with("Cart", "u", 3, vec![Event::new("ItemAdded", json!({"name": "c"}))]);
        store
            .put_commit("commits", &encode_commit(&c, 9).unwrap())
            .await
            .unwrap();
        let third = stream.recv().await.expect("third event");
        assert_eq!(third["properties"]["name"], "c");

        stream.shutdown().await.expect("shutdown should succeed");
    }
}
