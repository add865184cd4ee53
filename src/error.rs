// Copyright 2026 Optail Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Error types surfaced by the engine.
//!
//! Two families exist. [`TailError`] values flow on the error channel of a
//! running context while streaming continues (or a reconnect cycle begins).
//! [`ConfigError`] values are fatal and are returned from [`start`] before
//! any task is spawned.
//!
//! [`start`]: crate::start

use thiserror::Error;

/// Errors delivered on a context's error channel.
///
/// None of these stop the engine on their own: a cursor error triggers a
/// reconnect cycle, a decode error drops the affected document, and the
/// remaining variants skip the unit of work they describe.
#[derive(Debug, Error)]
pub enum TailError {
    /// The batch lookup used to attach post-images to buffered update ops
    /// failed. The session is re-checked and the affected ops are retried
    /// on the next flush.
    #[error("error finding documents to associate with ops: {source}")]
    EnrichmentFetch {
        #[source]
        source: mongodb::error::Error,
    },

    /// A user-supplied decoder rejected one document. That document's op is
    /// dropped and streaming continues.
    #[error("error decoding document in {namespace}: {message}")]
    Unmarshal { namespace: String, message: String },

    /// The tailing oplog cursor ended with an error; the engine waits for
    /// the connection and reopens the cursor at the last seen timestamp.
    #[error("error tailing oplog entries: {source}")]
    TailClose {
        #[source]
        source: mongodb::error::Error,
    },

    /// A direct-read cursor ended with an error; the reader waits for the
    /// connection and resumes from its current position.
    #[error("error performing direct read of {namespace}: {source}")]
    DirectReadClose {
        namespace: String,
        #[source]
        source: mongodb::error::Error,
    },

    /// The user-supplied shard handler failed; the discovered shard is
    /// skipped and the listener keeps running.
    #[error("error calling shard handler: {message}")]
    ShardHandler { message: String },

    /// `parallelCollectionScan` failed or returned nothing usable; the
    /// reader falls back to a single-threaded collection read.
    #[error("parallel collection scan of {namespace} failed: {message}")]
    ParallelScan { namespace: String, message: String },

    /// A direct-read namespace was not of the form `db.collection`; the
    /// reader for that namespace exits.
    #[error("invalid namespace {namespace:?}: expecting db.collection")]
    NamespaceParse { namespace: String },
}

impl TailError {
    /// Low-cardinality label used by the metrics layer.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::EnrichmentFetch { .. } => "enrichment_fetch",
            Self::Unmarshal { .. } => "unmarshal",
            Self::TailClose { .. } => "tail_close",
            Self::DirectReadClose { .. } => "direct_read_close",
            Self::ShardHandler { .. } => "shard_handler",
            Self::ParallelScan { .. } => "parallel_scan",
            Self::NamespaceParse { .. } => "namespace_parse",
        }
    }
}

/// Fatal configuration errors discovered while starting a context.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No collection named `oplog.*` exists in the configured oplog
    /// database. Usually means the server is not a replica-set member.
    #[error("unable to find oplog collection in database {database:?}")]
    MissingOplogCollection { database: String },

    /// The `cursor_timeout` option did not parse as a duration string.
    #[error("invalid value {value:?} for cursor_timeout: {reason}")]
    InvalidCursorTimeout { value: String, reason: String },

    /// Listing collections of the oplog database failed.
    #[error("unable to get collection names for database {database:?}: {source}")]
    ListCollections {
        database: String,
        #[source]
        source: mongodb::error::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_are_stable() {
        let err = TailError::Unmarshal {
            namespace: "db.c".into(),
            message: "boom".into(),
        };
        assert_eq!(err.category(), "unmarshal");

        let err = TailError::NamespaceParse {
            namespace: "nodot".into(),
        };
        assert_eq!(err.category(), "namespace_parse");
    }

    #[test]
    fn messages_name_the_namespace() {
        let err = TailError::ParallelScan {
            namespace: "db.users".into(),
            message: "ok: 0".into(),
        };
        assert!(err.to_string().contains("db.users"));
    }
}
