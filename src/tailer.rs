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

//! The oplog tailer.
//!
//! One long-lived task per context. It opens a tailable-await cursor over
//! the oplog at `ts > curr`, parses each entry, and hands accepted ops to
//! the fetch workers (or straight to the output channel in delta mode).
//! After every entry it checks the control channels without blocking, in
//! priority order: stop, then seek, then pause. `curr` advances to the
//! timestamp of the last delivered entry, so a reconnect resumes exactly
//! after it.
//!
//! The cursor carries a server-side await window of `cursor_timeout`; on
//! the client side an idle window of `eof_duration` bounds how long the
//! tailer waits before re-checking controls and reopening the cursor.
//! Cursor errors are reported, gated through the connection watchdog, and
//! retried indefinitely until the context stops.

use bson::{doc, Timestamp};
use mongodb::options::CursorType;
use mongodb::{Client, Collection, Cursor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::{wait_for_connection, Emitter};
use crate::error::TailError;
use crate::op::{Op, OplogEntry};
use crate::options::Options;

/// Control-channel receiving ends owned by the tailer task.
pub(crate) struct TailerChans {
    pub(crate) seek_rx: mpsc::Receiver<Timestamp>,
    pub(crate) pause_rx: mpsc::Receiver<()>,
    pub(crate) resume_rx: mpsc::Receiver<()>,
}

/// Outcome of a control-channel check.
enum Signal {
    /// Nothing pending; keep going.
    None,
    /// A seek arrived; restart the cursor at this timestamp.
    Seek(Timestamp),
    /// The context stopped.
    Stop,
}

/// Non-blocking control check. A pending pause blocks here until resume
/// (or stop), then consumes one more pending seek if any.
async fn check_controls(chans: &mut TailerChans, cancel: &CancellationToken) -> Signal {
    if cancel.is_cancelled() {
        return Signal::Stop;
    }
    if let Ok(ts) = chans.seek_rx.try_recv() {
        return Signal::Seek(ts);
    }
    if chans.pause_rx.try_recv().is_ok() {
        debug!("tailer paused");
        tokio::select! {
            biased;
            () = cancelled(cancel) => return Signal::Stop,
            _ = chans.resume_rx.recv() => {}
        }
        debug!("tailer resumed");
        if cancel.is_cancelled() {
            return Signal::Stop;
        }
        if let Ok(ts) = chans.seek_rx.try_recv() {
            return Signal::Seek(ts);
        }
    }
    Signal::None
}

// Indirection so the select arm has a name; CancellationToken::cancelled
// borrows, which reads poorly inline under `biased`.
async fn cancelled(cancel: &CancellationToken) {
    cancel.cancelled().await;
}

/// The timestamp of the newest oplog entry, or zero for an empty oplog.
/// This is the default starting point for tailing.
pub(crate) async fn last_op_timestamp(
    oplog: &Collection<OplogEntry>,
) -> Result<Timestamp, TailError> {
    let newest = oplog
        .find_one(doc! {})
        .sort(doc! { "$natural": -1 })
        .await
        .map_err(|source| TailError::TailClose { source })?;
    Ok(newest.map_or(
        Timestamp {
            time: 0,
            increment: 0,
        },
        |entry| entry.ts,
    ))
}

/// Opens the tailing cursor at `ts > after`, excluding entries produced by
/// chunk migrations, in natural order.
async fn oplog_cursor(
    oplog: &Collection<OplogEntry>,
    after: Timestamp,
    cursor_timeout: Duration,
) -> mongodb::error::Result<Cursor<OplogEntry>> {
    oplog
        .find(doc! { "ts": { "$gt": after }, "fromMigrate": { "$exists": false } })
        .sort(doc! { "$natural": 1 })
        .cursor_type(CursorType::TailableAwait)
        .max_await_time(cursor_timeout)
        .await
}

/// Delivers one accepted op: to the output channel in delta mode, else a
/// broadcast to every worker input channel (each worker keeps only what
/// its ordering predicate assigns to it). Returns `false` on cancellation.
async fn dispatch(em: &Emitter, worker_txs: &[mpsc::Sender<Op>], op: Op) -> bool {
    if worker_txs.is_empty() {
        return em.emit(op).await;
    }
    for tx in worker_txs {
        let sent = tokio::select! {
            biased;
            () = cancelled(&em.cancel) => false,
            result = tx.send(op.clone()) => result.is_ok(),
        };
        if !sent {
            return false;
        }
    }
    true
}

/// The tailer task body. Runs until the context stops.
pub(crate) async fn tail_ops(
    client: Client,
    em: Emitter,
    options: Arc<Options>,
    mut chans: TailerChans,
    worker_txs: Vec<mpsc::Sender<Op>>,
    cursor_timeout: Duration,
) {
    let collection_name = options
        .oplog_collection_name
        .clone()
        .unwrap_or_else(|| "oplog.rs".to_string());
    let oplog: Collection<OplogEntry> = client
        .database(&options.oplog_database_name)
        .collection(&collection_name);

    // Establish the starting timestamp, retrying through connection loss.
    let mut curr = loop {
        let attempt = match &options.after {
            Some(source) => source(oplog.clone()).await,
            None => last_op_timestamp(&oplog).await,
        };
        match attempt {
            Ok(ts) => break ts,
            Err(err) => {
                em.error(err).await;
                wait_for_connection(&client, &em.cancel).await;
                if em.cancel.is_cancelled() {
                    return;
                }
            }
        }
    };
    info!(
        seconds = curr.time,
        ordinal = curr.increment,
        "tailing oplog"
    );

    'cursor: loop {
        if em.cancel.is_cancelled() {
            return;
        }
        let mut cursor = match oplog_cursor(&oplog, curr, cursor_timeout).await {
            Ok(cursor) => cursor,
            Err(source) => {
                em.error(TailError::TailClose { source }).await;
                wait_for_connection(&client, &em.cancel).await;
                if em.cancel.is_cancelled() {
                    return;
                }
                continue 'cursor;
            }
        };
        loop {
            match tokio::time::timeout(options.eof_duration, cursor.advance()).await {
                // Idle: nothing arrived inside the EOF window. Check the
                // controls and reopen at curr.
                Err(_elapsed) => match check_controls(&mut chans, &em.cancel).await {
                    Signal::Stop => return,
                    Signal::Seek(ts) => {
                        curr = ts;
                        continue 'cursor;
                    }
                    Signal::None => continue 'cursor,
                },
                Ok(Ok(true)) => {
                    let entry: OplogEntry = match cursor.deserialize_current() {
                        Ok(entry) => entry,
                        Err(source) => {
                            em.error(TailError::TailClose { source }).await;
                            continue;
                        }
                    };
                    let entry_ts = entry.ts;
                    match Op::parse_log_entry(&entry, &options) {
                        Ok(Some(op)) if op.matches_filter(&options) => {
                            if !dispatch(&em, &worker_txs, op).await {
                                return;
                            }
                        }
                        Ok(_) => {}
                        Err(err) => {
                            em.error(err).await;
                        }
                    }
                    match check_controls(&mut chans, &em.cancel).await {
                        Signal::Stop => return,
                        Signal::Seek(ts) => {
                            curr = ts;
                            continue 'cursor;
                        }
                        Signal::None => curr = entry_ts,
                    }
                }
                // The tailable cursor died (capped collection rolled
                // over, or the server closed it); reopen at curr.
                Ok(Ok(false)) => match check_controls(&mut chans, &em.cancel).await {
                    Signal::Stop => return,
                    Signal::Seek(ts) => {
                        curr = ts;
                        continue 'cursor;
                    }
                    Signal::None => continue 'cursor,
                },
                Ok(Err(source)) => {
                    em.error(TailError::TailClose { source }).await;
                    wait_for_connection(&client, &em.cancel).await;
                    if em.cancel.is_cancelled() {
                        return;
                    }
                    continue 'cursor;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{OpSource, Operation};

    fn chans() -> (
        TailerChans,
        mpsc::Sender<Timestamp>,
        mpsc::Sender<()>,
        mpsc::Sender<()>,
    ) {
        let (seek_tx, seek_rx) = mpsc::channel(1);
        let (pause_tx, pause_rx) = mpsc::channel(1);
        let (resume_tx, resume_rx) = mpsc::channel(1);
        (
            TailerChans {
                seek_rx,
                pause_rx,
                resume_rx,
            },
            seek_tx,
            pause_tx,
            resume_tx,
        )
    }

    #[tokio::test]
    async fn stop_takes_priority_over_seek() {
        let (mut chans, seek_tx, _pause_tx, _resume_tx) = chans();
        let cancel = CancellationToken::new();
        seek_tx
            .send(Timestamp {
                time: 9,
                increment: 0,
            })
            .await
            .unwrap();
        cancel.cancel();
        assert!(matches!(
            check_controls(&mut chans, &cancel).await,
            Signal::Stop
        ));
    }

    #[tokio::test]
    async fn seek_is_consumed_before_pause() {
        let (mut chans, seek_tx, pause_tx, _resume_tx) = chans();
        let cancel = CancellationToken::new();
        seek_tx
            .send(Timestamp {
                time: 7,
                increment: 3,
            })
            .await
            .unwrap();
        pause_tx.send(()).await.unwrap();
        match check_controls(&mut chans, &cancel).await {
            Signal::Seek(ts) => {
                assert_eq!(ts.time, 7);
                assert_eq!(ts.increment, 3);
            }
            _ => panic!("expected a seek"),
        }
    }

    #[tokio::test]
    async fn pause_blocks_until_resume() {
        let (mut chans, _seek_tx, pause_tx, resume_tx) = chans();
        let cancel = CancellationToken::new();
        pause_tx.send(()).await.unwrap();

        let resumer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            resume_tx.send(()).await.unwrap();
            resume_tx
        });
        assert!(matches!(
            check_controls(&mut chans, &cancel).await,
            Signal::None
        ));
        resumer.await.unwrap();
    }

    #[tokio::test]
    async fn pause_then_stop_exits() {
        let (mut chans, _seek_tx, pause_tx, _resume_tx) = chans();
        let cancel = CancellationToken::new();
        pause_tx.send(()).await.unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        assert!(matches!(
            check_controls(&mut chans, &cancel).await,
            Signal::Stop
        ));
    }

    #[tokio::test]
    async fn quiet_channels_mean_no_control() {
        let (mut chans, _seek_tx, _pause_tx, _resume_tx) = chans();
        let cancel = CancellationToken::new();
        assert!(matches!(
            check_controls(&mut chans, &cancel).await,
            Signal::None
        ));
    }

    #[tokio::test]
    async fn dispatch_broadcasts_to_every_worker() {
        let (op_tx, _op_rx) = mpsc::channel(4);
        let (err_tx, _err_rx) = mpsc::channel(4);
        let em = Emitter {
            op_tx,
            err_tx,
            cancel: CancellationToken::new(),
        };
        let (a_tx, mut a_rx) = mpsc::channel(4);
        let (b_tx, mut b_rx) = mpsc::channel(4);
        let op = Op {
            id: None,
            operation: Operation::Insert,
            namespace: "db.c".into(),
            data: None,
            doc: None,
            timestamp: Timestamp {
                time: 1,
                increment: 0,
            },
            source: OpSource::Oplog,
        };
        assert!(dispatch(&em, &[a_tx, b_tx], op).await);
        assert!(a_rx.recv().await.is_some());
        assert!(b_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn dispatch_without_workers_emits_directly() {
        let (op_tx, mut op_rx) = mpsc::channel(4);
        let (err_tx, _err_rx) = mpsc::channel(4);
        let em = Emitter {
            op_tx,
            err_tx,
            cancel: CancellationToken::new(),
        };
        let op = Op {
            id: None,
            operation: Operation::Update,
            namespace: "db.c".into(),
            data: Some(doc! { "$set": { "a": 1 } }),
            doc: None,
            timestamp: Timestamp {
                time: 2,
                increment: 0,
            },
            source: OpSource::Oplog,
        };
        assert!(dispatch(&em, &[], op).await);
        assert!(op_rx.recv().await.is_some());
    }
}
