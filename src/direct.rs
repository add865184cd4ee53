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

//! Bulk "direct reads" of existing collections.
//!
//! Each configured namespace gets one reader that turns every stored
//! document into a synthetic insert op with [`OpSource::Direct`] and a
//! wall-clock timestamp, seeding downstream consumers before the oplog
//! stream takes over.
//!
//! When the server supports it (2.6+), the reader asks
//! `parallelCollectionScan` for several server-side cursors and drives
//! each to completion concurrently. On command failure, `ok: 0`, or a
//! single returned cursor where more were requested, it falls back to a
//! single-threaded scan paged over the `_id` index.
//!
//! Completion of all readers is observable through
//! [`OpCtx::direct_read_wait`](crate::OpCtx::direct_read_wait).
//!
//! [`OpSource::Direct`]: crate::op::OpSource

use bson::{doc, Bson, Document, Timestamp};
use mongodb::options::Hint;
use mongodb::Client;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

use crate::context::{wait_for_connection, Control, Emitter};
use crate::error::TailError;
use crate::op::{Namespace, Op, OpSource, Operation};
use crate::options::Options;

/// Reply shape of `parallelCollectionScan`.
#[derive(Debug, Deserialize)]
struct ScanReply {
    #[serde(default)]
    cursors: Vec<ScanCursor>,
    #[serde(default)]
    ok: f64,
}

#[derive(Debug, Deserialize)]
struct ScanCursor {
    cursor: ScanCursorInfo,
}

#[derive(Debug, Deserialize)]
struct ScanCursorInfo {
    #[serde(rename = "firstBatch", default)]
    first_batch: Vec<Document>,
    id: i64,
}

/// Reply shape of `getMore`.
#[derive(Debug, Deserialize)]
struct GetMoreReply {
    cursor: GetMoreCursor,
}

#[derive(Debug, Deserialize)]
struct GetMoreCursor {
    #[serde(rename = "nextBatch", default)]
    next_batch: Vec<Document>,
    id: i64,
}

/// Whether the server is new enough (2.6+) for `parallelCollectionScan`.
pub(crate) async fn supports_collection_scan(
    client: &Client,
) -> Result<bool, mongodb::error::Error> {
    let info = client
        .database("admin")
        .run_command(doc! { "buildInfo": 1 })
        .await?;
    let Ok(version) = info.get_array("versionArray") else {
        return Ok(false);
    };
    let part = |index: usize| -> i64 {
        match version.get(index) {
            Some(Bson::Int32(v)) => i64::from(*v),
            Some(Bson::Int64(v)) => *v,
            Some(Bson::Double(v)) => *v as i64,
            _ => 0,
        }
    };
    let (major, minor) = (part(0), part(1));
    Ok(major > 2 || (major == 2 && minor >= 6))
}

/// Spawns the reader for one namespace on both context trackers.
pub(crate) fn spawn_reader(
    ctl: &Control,
    client: Client,
    em: Emitter,
    options: Arc<Options>,
    ns: String,
    parallel: bool,
) {
    let fut: futures::future::BoxFuture<'static, ()> = if parallel {
        Box::pin(collection_scan(
            ctl.clone(),
            client,
            em,
            options,
            ns,
        ))
    } else {
        Box::pin(direct_read(client, em, options, ns))
    };
    ctl.all_tasks.spawn(ctl.direct_read_tasks.track_future(fut));
}

/// Builds and emits the synthetic insert op for one stored document.
/// Returns `false` when the context was cancelled.
async fn emit_document(em: &Emitter, options: &Options, ns: &str, document: Document) -> bool {
    let now = chrono::Utc::now().timestamp();
    let mut op = Op {
        id: document.get("_id").cloned(),
        operation: Operation::Insert,
        namespace: ns.to_string(),
        data: None,
        doc: None,
        timestamp: Timestamp {
            time: now as u32,
            increment: 0,
        },
        source: OpSource::Direct,
    };
    match (options.unmarshal)(ns, &document) {
        Ok(value) => {
            op.process_data(value);
            if op.matches_direct_filter(options) {
                return em.emit(op).await;
            }
            true
        }
        Err(message) => {
            em.error(TailError::Unmarshal {
                namespace: ns.to_string(),
                message,
            })
            .await
        }
    }
}

/// The parallel reader: one `parallelCollectionScan`, then one task per
/// returned cursor. Falls back to [`direct_read`] when the scan cannot
/// provide real parallelism.
async fn collection_scan(
    ctl: Control,
    client: Client,
    em: Emitter,
    options: Arc<Options>,
    ns: String,
) {
    let parsed = match Namespace::parse(&ns) {
        Ok(parsed) => parsed,
        Err(err) => {
            em.error(err).await;
            return;
        }
    };
    let database = client.database(&parsed.database);
    let command = doc! {
        "parallelCollectionScan": parsed.collection.clone(),
        "numCursors": options.direct_read_cursors as i32,
    };
    let reply = match database.run_command(command).await {
        Ok(reply) => match bson::from_document::<ScanReply>(reply) {
            Ok(reply) if reply.ok != 0.0 => Some(reply),
            Ok(_) => None,
            Err(error) => {
                em.error(TailError::ParallelScan {
                    namespace: ns.clone(),
                    message: format!("unexpected reply shape: {error}"),
                })
                .await;
                None
            }
        },
        Err(error) => {
            em.error(TailError::ParallelScan {
                namespace: ns.clone(),
                message: error.to_string(),
            })
            .await;
            None
        }
    };

    match reply {
        Some(reply) if reply.cursors.len() > 1 => {
            debug!(namespace = %ns, cursors = reply.cursors.len(), "parallel collection scan");
            for scan_cursor in reply.cursors {
                let fut = cursor_read(
                    client.clone(),
                    em.clone(),
                    Arc::clone(&options),
                    ns.clone(),
                    parsed.clone(),
                    scan_cursor.cursor.first_batch,
                    scan_cursor.cursor.id,
                );
                ctl.all_tasks
                    .spawn(ctl.direct_read_tasks.track_future(fut));
            }
        }
        Some(reply) => {
            if options.direct_read_cursors > 1 {
                info!(
                    namespace = %ns,
                    returned = reply.cursors.len(),
                    "only one cursor available for collection scan in this storage engine"
                );
            }
            info!(namespace = %ns, "reverting to single-threaded collection read");
            let fut = direct_read(client, em, options, ns);
            ctl.all_tasks
                .spawn(ctl.direct_read_tasks.track_future(fut));
        }
        None => {
            info!(namespace = %ns, "reverting to single-threaded collection read");
            let fut = direct_read(client, em, options, ns);
            ctl.all_tasks
                .spawn(ctl.direct_read_tasks.track_future(fut));
        }
    }
}

/// Drives one server-side cursor from a parallel scan to completion:
/// the first batch, then `getMore` until the cursor id is zero.
async fn cursor_read(
    client: Client,
    em: Emitter,
    options: Arc<Options>,
    ns: String,
    parsed: Namespace,
    first_batch: Vec<Document>,
    cursor_id: i64,
) {
    let database = client.database(&parsed.database);
    let mut batch: VecDeque<Document> = first_batch.into();
    let mut cursor_id = cursor_id;
    loop {
        while let Some(document) = batch.pop_front() {
            if !emit_document(&em, &options, &ns, document).await {
                return;
            }
            if em.cancel.is_cancelled() {
                return;
            }
        }
        if cursor_id == 0 {
            return;
        }
        let command = doc! {
            "getMore": cursor_id,
            "collection": parsed.collection.clone(),
            "batchSize": options.direct_read_batch_size as i32,
        };
        match database.run_command(command).await {
            Ok(reply) => match bson::from_document::<GetMoreReply>(reply) {
                Ok(reply) => {
                    cursor_id = reply.cursor.id;
                    batch = reply.cursor.next_batch.into();
                }
                Err(error) => {
                    em.error(TailError::DirectReadClose {
                        namespace: ns.clone(),
                        source: mongodb::error::Error::custom(error),
                    })
                    .await;
                    return;
                }
            },
            Err(source) => {
                em.error(TailError::DirectReadClose {
                    namespace: ns.clone(),
                    source,
                })
                .await;
                wait_for_connection(&client, &em.cancel).await;
                if em.cancel.is_cancelled() {
                    return;
                }
                // Retry the getMore from the same position.
            }
        }
    }
}

/// The single-threaded reader: pages over the `_id` index in ascending
/// order. After a page ending at id `X`, the next page selects
/// `{_id: {$gt: X}}`; an empty page ends the read.
async fn direct_read(client: Client, em: Emitter, options: Arc<Options>, ns: String) {
    let parsed = match Namespace::parse(&ns) {
        Ok(parsed) => parsed,
        Err(err) => {
            em.error(err).await;
            return;
        }
    };
    let collection = client
        .database(&parsed.database)
        .collection::<Document>(&parsed.collection);
    let mut last_id: Option<Bson> = None;
    loop {
        let filter = match &last_id {
            Some(id) => doc! { "_id": { "$gt": id.clone() } },
            None => doc! {},
        };
        let mut cursor = match collection
            .find(filter)
            .sort(doc! { "_id": 1 })
            .hint(Hint::Keys(doc! { "_id": 1 }))
            .limit(options.direct_read_batch_size as i64)
            .batch_size(options.direct_read_batch_size as u32)
            .await
        {
            Ok(cursor) => cursor,
            Err(source) => {
                em.error(TailError::DirectReadClose {
                    namespace: ns.clone(),
                    source,
                })
                .await;
                wait_for_connection(&client, &em.cancel).await;
                if em.cancel.is_cancelled() {
                    return;
                }
                continue;
            }
        };
        let mut found = false;
        let mut retry = false;
        loop {
            match cursor.advance().await {
                Ok(true) => {
                    let document = match cursor.deserialize_current() {
                        Ok(document) => document,
                        Err(source) => {
                            em.error(TailError::DirectReadClose {
                                namespace: ns.clone(),
                                source,
                            })
                            .await;
                            continue;
                        }
                    };
                    found = true;
                    last_id = document.get("_id").cloned();
                    if !emit_document(&em, &options, &ns, document).await {
                        return;
                    }
                    if em.cancel.is_cancelled() {
                        return;
                    }
                }
                Ok(false) => break,
                Err(source) => {
                    em.error(TailError::DirectReadClose {
                        namespace: ns.clone(),
                        source,
                    })
                    .await;
                    wait_for_connection(&client, &em.cancel).await;
                    if em.cancel.is_cancelled() {
                        return;
                    }
                    // Reopen the page after the last delivered id.
                    retry = true;
                    break;
                }
            }
        }
        if retry {
            continue;
        }
        if !found {
            // An empty page means the collection is exhausted.
            debug!(namespace = %ns, "direct read complete");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_reply_parses_cursor_batches() {
        let reply = doc! {
            "cursors": [
                { "cursor": { "firstBatch": [ { "_id": 1 } ], "ns": "db.c", "id": 77i64 }, "ok": true },
                { "cursor": { "firstBatch": [], "ns": "db.c", "id": 0i64 }, "ok": true },
            ],
            "ok": 1.0,
        };
        let parsed: ScanReply = bson::from_document(reply).unwrap();
        assert_eq!(parsed.ok, 1.0);
        assert_eq!(parsed.cursors.len(), 2);
        assert_eq!(parsed.cursors[0].cursor.id, 77);
        assert_eq!(parsed.cursors[0].cursor.first_batch.len(), 1);
        assert_eq!(parsed.cursors[1].cursor.id, 0);
    }

    #[test]
    fn get_more_reply_parses_next_batch() {
        let reply = doc! {
            "cursor": { "nextBatch": [ { "_id": 2 }, { "_id": 3 } ], "id": 0i64, "ns": "db.c" },
            "ok": 1.0,
        };
        let parsed: GetMoreReply = bson::from_document(reply).unwrap();
        assert_eq!(parsed.cursor.id, 0);
        assert_eq!(parsed.cursor.next_batch.len(), 2);
    }

    #[tokio::test]
    async fn emitted_documents_are_synthetic_inserts() {
        use tokio::sync::mpsc;
        use tokio_util::sync::CancellationToken;

        let (op_tx, mut op_rx) = mpsc::channel(4);
        let (err_tx, _err_rx) = mpsc::channel(4);
        let em = Emitter {
            op_tx,
            err_tx,
            cancel: CancellationToken::new(),
        };
        let options = Options::default();
        assert!(emit_document(&em, &options, "db.c", doc! { "_id": 5, "v": 1 }).await);

        let op = op_rx.recv().await.unwrap();
        assert!(op.is_insert());
        assert!(op.is_source_direct());
        assert_eq!(op.id, Some(Bson::Int32(5)));
        assert_eq!(op.timestamp.increment, 0);
        assert!(op.timestamp.time > 0);
        assert_eq!(op.data, Some(doc! { "_id": 5, "v": 1 }));
    }

    #[tokio::test]
    async fn direct_filter_gates_emission() {
        use std::sync::Arc as StdArc;
        use tokio::sync::mpsc;
        use tokio_util::sync::CancellationToken;

        let (op_tx, mut op_rx) = mpsc::channel(4);
        let (err_tx, _err_rx) = mpsc::channel(4);
        let em = Emitter {
            op_tx,
            err_tx,
            cancel: CancellationToken::new(),
        };
        let options = Options::builder()
            .direct_read_filter(
                StdArc::new(|op: &Op| op.id != Some(Bson::Int32(5))) as crate::op::OpFilter
            )
            .build();
        assert!(emit_document(&em, &options, "db.c", doc! { "_id": 5 }).await);
        assert!(op_rx.try_recv().is_err(), "filtered doc must not be emitted");
    }

    #[tokio::test]
    async fn decode_failures_surface_and_continue() {
        use std::sync::Arc as StdArc;
        use tokio::sync::mpsc;
        use tokio_util::sync::CancellationToken;

        let (op_tx, mut op_rx) = mpsc::channel(4);
        let (err_tx, mut err_rx) = mpsc::channel(4);
        let em = Emitter {
            op_tx,
            err_tx,
            cancel: CancellationToken::new(),
        };
        let options = Options::builder()
            .unmarshal(StdArc::new(|_: &str, _: &Document| Err("bad".to_string()))
                as crate::op::DataDecoder)
            .build();
        assert!(emit_document(&em, &options, "db.c", doc! { "_id": 5 }).await);
        assert!(op_rx.try_recv().is_err());
        let err = err_rx.recv().await.unwrap();
        assert_eq!(err.category(), "unmarshal");
    }
}
