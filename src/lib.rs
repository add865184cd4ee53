//! optail — tail the MongoDB oplog and stream change operations.
//!
//! This crate turns a replica set's oplog into a single merged stream of
//! [`Op`] records: inserts, updates, deletes, and `drop`/`dropDatabase`
//! commands. It handles the concurrency underneath — a reconnecting
//! tailer, a pool of fetch workers that enrich update ops with their
//! post-images, bulk "direct reads" that seed consumers with existing
//! documents, and shard discovery for sharded deployments — and exposes
//! bounded channels plus pause/resume/seek/stop controls.
//!
//! # Key components
//!
//! - **[`start`]** runs the engine for one session and returns an
//!   [`OpCtx`] with the op and error channels.
//! - **[`start_multi`]** supervises one child context per shard and
//!   merges their streams; [`OpCtxMulti::add_shard_listener`] keeps the
//!   set current as shards join.
//! - **[`Options`]** configures ordering guarantees, buffering, direct
//!   reads, and the pluggable decode/filter callbacks.
//!
//! # Delivery semantics
//!
//! At-least-once: after a reconnect the tailer resumes at the timestamp
//! of the last delivered entry, so duplicates are possible but gaps are
//! not. Stream position is not persisted across process restarts.
//!
//! # Example
//!
//! ```rust,no_run
//! use mongodb::Client;
//! use optail::{Options, OrderingGuarantee};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::with_uri_str("mongodb://localhost:27017").await?;
//! let mut ctx = optail::start(
//!     &client,
//!     Options::builder()
//!         .ordering(OrderingGuarantee::Document)
//!         .worker_count(4)
//!         .direct_read_ns(vec!["shop.orders".to_string()])
//!         .build(),
//! )
//! .await?;
//!
//! // The snapshot of existing documents finishes independently of the
//! // live tail.
//! ctx.direct_read_wait().await;
//!
//! while let Some(op) = ctx.op_rx.recv().await {
//!     println!("{} {} {:?}", op.operation.as_str(), op.namespace, op.id);
//! }
//! ctx.stop().await;
//! # Ok(())
//! # }
//! ```

mod buffer;
pub mod context;
mod direct;
pub mod error;
pub mod metrics;
pub mod multi;
pub mod op;
pub mod options;
pub mod ordering;
pub mod shard;
mod tailer;
mod worker;

pub use context::{start, tail, OpCtx};
pub use error::{ConfigError, TailError};
pub use multi::{start_multi, OpCtxMulti};
pub use op::{
    chain_filters, timestamp_from_u64, timestamp_to_u64, DataDecoder, Namespace, Op, OpFilter,
    OpSource, Operation, OplogEntry,
};
pub use options::{Options, OptionsBuilder, TimestampSource};
pub use ordering::OrderingGuarantee;
pub use shard::{get_shards, ShardInfo, ShardInsertHandler};
