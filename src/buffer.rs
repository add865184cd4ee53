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

//! The per-worker staging buffer.
//!
//! Ops wait here until a flush, triggered by size or by the worker's
//! periodic tick. A flush first enriches buffered updates that still lack
//! a post-image — one `find {_id: {$in: ...}}` per namespace — then emits
//! every buffered op that passes the emission filter, in arrival order.
//! The fetch pass never reorders entries.

use bson::{doc, Bson, Document};
use futures::TryStreamExt;
use mongodb::Client;
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

use crate::context::{wait_for_connection, Emitter};
use crate::error::TailError;
use crate::metrics;
use crate::op::{Namespace, Op};
use crate::options::Options;

pub(crate) struct OpBuf {
    entries: Vec<Op>,
    buffer_size: usize,
}

impl OpBuf {
    pub(crate) fn new(buffer_size: usize) -> Self {
        Self {
            entries: Vec::with_capacity(buffer_size),
            buffer_size,
        }
    }

    pub(crate) fn append(&mut self, op: Op) {
        self.entries.push(op);
    }

    pub(crate) fn is_full(&self) -> bool {
        self.entries.len() >= self.buffer_size
    }

    /// The grouping key used to match fetched documents back to buffered
    /// ops.
    fn id_key(namespace: &str, id: &Bson) -> String {
        format!("{namespace}.{id:?}")
    }

    /// Enriches pending updates, then emits the buffered ops.
    ///
    /// When the enrichment fetch fails, the error is reported, the
    /// connection watchdog runs, and the buffer is kept intact for the
    /// next flush — nothing is emitted on that path. On cancellation the
    /// buffer is dropped.
    pub(crate) async fn flush(
        &mut self,
        client: &Client,
        em: &Emitter,
        options: &Options,
        trigger: &'static str,
    ) {
        if self.entries.is_empty() {
            return;
        }
        let started = Instant::now();

        // Group the ids of not-yet-enriched updates by namespace.
        let mut ids_by_ns: HashMap<String, Vec<Bson>> = HashMap::new();
        let mut entries_by_key: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, op) in self.entries.iter().enumerate() {
            if op.is_update() && op.doc.is_none() {
                if let Some(id) = &op.id {
                    ids_by_ns
                        .entry(op.namespace.clone())
                        .or_default()
                        .push(id.clone());
                    entries_by_key
                        .entry(Self::id_key(&op.namespace, id))
                        .or_default()
                        .push(index);
                }
            }
        }

        for (ns, ids) in ids_by_ns {
            let parsed = match Namespace::parse(&ns) {
                Ok(parsed) => parsed,
                Err(err) => {
                    em.error(err).await;
                    continue;
                }
            };
            let collection = client
                .database(&parsed.database)
                .collection::<Document>(&parsed.collection);
            let found: Result<Vec<Document>, mongodb::error::Error> =
                match collection.find(doc! { "_id": { "$in": ids } }).await {
                    Ok(cursor) => cursor.try_collect().await,
                    Err(error) => Err(error),
                };
            match found {
                Ok(results) => {
                    for result in results {
                        let Some(id) = result.get("_id") else { continue };
                        let Some(indexes) = entries_by_key.get(&Self::id_key(&ns, id)) else {
                            continue;
                        };
                        for &index in indexes {
                            match (options.unmarshal)(&ns, &result) {
                                Ok(value) => self.entries[index].process_data(value),
                                Err(message) => {
                                    em.error(TailError::Unmarshal {
                                        namespace: ns.clone(),
                                        message,
                                    })
                                    .await;
                                }
                            }
                        }
                    }
                }
                Err(source) => {
                    em.error(TailError::EnrichmentFetch { source }).await;
                    wait_for_connection(client, &em.cancel).await;
                    if em.cancel.is_cancelled() {
                        self.entries.clear();
                        return;
                    }
                    // Keep everything buffered; the next flush retries the
                    // whole pass.
                    debug!(pending = self.entries.len(), "flush deferred after fetch failure");
                    return;
                }
            }
        }

        for op in self.entries.drain(..) {
            if op.matches_filter(options) && !em.emit(op).await {
                break;
            }
        }
        self.entries.clear();
        metrics::record_buffer_flush(trigger, started.elapsed().as_secs_f64());
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}
