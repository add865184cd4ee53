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

//! The fetch worker task: one per worker slot.

use mongodb::Client;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::buffer::OpBuf;
use crate::context::Emitter;
use crate::op::Op;
use crate::options::Options;
use crate::ordering::WorkerPredicate;

/// Consumes the worker's private input channel, keeping only ops the
/// ordering predicate assigns to this worker. The buffer flushes when it
/// fills or on the periodic tick; an overflow flush restarts the tick so
/// the next one lands a full period later.
pub(crate) async fn fetch_documents(
    client: Client,
    cancel: CancellationToken,
    em: Emitter,
    options: Arc<Options>,
    predicate: WorkerPredicate,
    mut in_rx: mpsc::Receiver<Op>,
) {
    let mut buf = OpBuf::new(options.buffer_size);
    let mut tick = interval_at(
        Instant::now() + options.buffer_duration,
        options.buffer_duration,
    );
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            _ = tick.tick() => {
                buf.flush(&client, &em, &options, "tick").await;
            }
            received = in_rx.recv() => match received {
                Some(op) => {
                    if predicate(&op) {
                        buf.append(op);
                        if buf.is_full() {
                            buf.flush(&client, &em, &options, "size").await;
                            tick.reset();
                        }
                    }
                }
                None => {
                    // The tailer is gone; drain what is staged and exit.
                    debug!("worker input channel closed");
                    buf.flush(&client, &em, &options, "tick").await;
                    return;
                }
            }
        }
    }
}
