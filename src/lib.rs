//! Event-sourcing toolkit over a keyed commit store and a blob store.

mod aggregate;
pub use aggregate::{Aggregate, AggregateContext, AggregateType, HydrateOptions};
mod codec;
pub use codec::{
    commit_id_for, date_string, decode_commit, encode_commit, max_version_for_digits, sort_key_for,
    Commit, CommitRecord, Event, SINGLETON_KEY,
};
mod config;
pub use config::{SnapshotConfig, StoreConfig, DEFAULT_SNAPSHOT_FREQUENCY, DEFAULT_VERSION_DIGITS};
mod error;
pub use error::Error;
mod keys;
pub use keys::{KeyProp, KeySchema, Props};
mod projector;
pub use projector::{
    extract_batch, Projection, ProjectionCheckpoint, Projector, ProjectorConfig, ProjectorHandle,
};
mod retry;
pub use retry::RetryPolicy;
mod snapshot;
pub use snapshot::{
    read_snapshot, snapshot_key, write_snapshot, BlobStore, InMemoryBlobStore, SnapshotRecord,
};
mod store;
pub use store::{
    decode_page, get_head_commit, CommitQuery, CommitStore, GlobalPageRequest, InMemoryCommitStore,
    PageCursor, PageRequest, QueryOutcome, RecordPage, StoreMetrics, WriteReceipt,
};
mod subscription;
pub use subscription::{
    decorate_event, EventStream, EventStreamConfig, FilterClause, Subscription,
};
mod upcaster;
pub use upcaster::{UpcastFn, UpcasterRegistry};
