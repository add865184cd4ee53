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

//! Supervision of several contexts as one stream.
//!
//! [`start_multi`] runs one child context per session — typically one per
//! shard — and splices every child's op and error channel into a single
//! pair of parent channels. Control operations fan out to the children.
//! New children can join later through the shard listener
//! ([`OpCtxMulti::add_shard_listener`](crate::OpCtxMulti::add_shard_listener)).

use mongodb::Client;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::context::{start, Control, OpCtx};
use crate::error::{ConfigError, TailError};
use crate::op::Op;
use crate::options::Options;

/// Shared state of a multi-context; clones go to the splicer tasks and
/// the shard listener.
#[derive(Clone)]
pub(crate) struct MultiHandle {
    pub(crate) cancel: CancellationToken,
    pub(crate) all_tasks: TaskTracker,
    pub(crate) direct_read_tasks: TaskTracker,
    pub(crate) op_tx: mpsc::Sender<Op>,
    pub(crate) err_tx: mpsc::Sender<TailError>,
    pub(crate) children: Arc<Mutex<Vec<Control>>>,
    pub(crate) paused: Arc<RwLock<bool>>,
    pub(crate) stopped: Arc<RwLock<bool>>,
    // Pause state observed by the shard listener.
    pub(crate) pause_signal: watch::Sender<bool>,
}

impl MultiHandle {
    /// Reports an error on the parent error channel, racing cancellation.
    pub(crate) async fn report(&self, err: TailError) {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {}
            _ = self.err_tx.send(err) => {}
        }
    }
}

/// Copies items from a child channel into a parent channel until the
/// child ends or the parent is cancelled.
pub(crate) async fn forward<T: Send + 'static>(
    mut rx: mpsc::Receiver<T>,
    tx: mpsc::Sender<T>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            received = rx.recv() => match received {
                Some(item) => item,
                None => return,
            },
        };
        let delivered = tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            sent = tx.send(item) => sent.is_ok(),
        };
        if !delivered {
            return;
        }
    }
}

/// Splices a child context into the parent: registers its control handle,
/// propagates its task completion into the parent trackers, and forwards
/// its channels.
pub(crate) async fn splice_child(handle: &MultiHandle, child: OpCtx) {
    let OpCtx { op_rx, err_rx, ctl } = child;
    handle.children.lock().await.push(ctl.clone());

    let child_direct = ctl.direct_read_tasks.clone();
    handle
        .direct_read_tasks
        .spawn(async move { child_direct.wait().await });
    let child_all = ctl.all_tasks.clone();
    handle
        .all_tasks
        .spawn(async move { child_all.wait().await });

    handle.all_tasks.spawn(forward(
        op_rx,
        handle.op_tx.clone(),
        handle.cancel.clone(),
    ));
    handle.all_tasks.spawn(forward(
        err_rx,
        handle.err_tx.clone(),
        handle.cancel.clone(),
    ));
}

/// Several child contexts merged into one op stream.
///
/// Same consuming surface as [`OpCtx`]; control operations fan out to
/// every child.
pub struct OpCtxMulti {
    /// Ops from every child, merged.
    pub op_rx: mpsc::Receiver<Op>,
    /// Errors from every child, merged.
    pub err_rx: mpsc::Receiver<TailError>,
    pub(crate) shared: MultiHandle,
}

impl OpCtxMulti {
    /// Seeks every child tailer to `ts`.
    pub async fn since(&self, ts: bson::Timestamp) {
        let children = self.shared.children.lock().await;
        for child in children.iter() {
            child.since(ts).await;
        }
    }

    /// Pauses every child and the shard listener.
    pub async fn pause(&self) {
        let mut paused = self.shared.paused.write().await;
        if !*paused {
            *paused = true;
            let _ = self.shared.pause_signal.send_replace(true);
            let children = self.shared.children.lock().await;
            for child in children.iter() {
                child.pause().await;
            }
        }
    }

    /// Resumes every child and the shard listener.
    pub async fn resume(&self) {
        let mut paused = self.shared.paused.write().await;
        if *paused {
            *paused = false;
            let _ = self.shared.pause_signal.send_replace(false);
            let children = self.shared.children.lock().await;
            for child in children.iter() {
                child.resume().await;
            }
        }
    }

    /// Stops every child, then waits for all splicer and supervisor tasks
    /// to exit. Idempotent.
    pub async fn stop(&self) {
        {
            let mut stopped = self.shared.stopped.write().await;
            if !*stopped {
                *stopped = true;
                info!("stopping multi context");
                self.shared.cancel.cancel();
                let children = self.shared.children.lock().await;
                for child in children.iter() {
                    let child = child.clone();
                    tokio::spawn(async move { child.stop().await });
                }
                self.shared.all_tasks.close();
            }
        }
        self.shared.all_tasks.wait().await;
    }

    /// Completes when every child's direct reads are done, including
    /// children added later by the shard listener.
    pub async fn direct_read_wait(&self) {
        self.shared.direct_read_tasks.wait().await;
    }
}

/// Starts one child context per session and merges their outputs.
///
/// Fails fast: if any child fails to start, the already-started children
/// are stopped and the error is returned.
pub async fn start_multi(clients: &[Client], options: Options) -> Result<OpCtxMulti, ConfigError> {
    let mut options = options;
    options.set_defaults();

    let (op_tx, op_rx) = mpsc::channel(options.channel_size);
    let (err_tx, err_rx) = mpsc::channel(options.channel_size);
    let (pause_signal, _) = watch::channel(false);

    let shared = MultiHandle {
        cancel: CancellationToken::new(),
        all_tasks: TaskTracker::new(),
        direct_read_tasks: TaskTracker::new(),
        op_tx,
        err_tx,
        children: Arc::new(Mutex::new(Vec::new())),
        paused: Arc::new(RwLock::new(false)),
        stopped: Arc::new(RwLock::new(false)),
        pause_signal,
    };

    let mut started = Vec::with_capacity(clients.len());
    for client in clients {
        match start(client, options.clone()).await {
            Ok(ctx) => started.push(ctx),
            Err(err) => {
                for ctx in started {
                    tokio::spawn(async move { ctx.stop().await });
                }
                return Err(err);
            }
        }
    }
    for child in started {
        splice_child(&shared, child).await;
    }
    shared.direct_read_tasks.close();

    Ok(OpCtxMulti {
        op_rx,
        err_rx,
        shared,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{OpSource, Operation};
    use bson::Timestamp;

    fn sample_op(ns: &str, seconds: u32) -> Op {
        Op {
            id: None,
            operation: Operation::Insert,
            namespace: ns.to_string(),
            data: None,
            doc: None,
            timestamp: Timestamp {
                time: seconds,
                increment: 0,
            },
            source: OpSource::Oplog,
        }
    }

    #[tokio::test]
    async fn forward_merges_two_children_into_one_channel() {
        let cancel = CancellationToken::new();
        let (parent_tx, mut parent_rx) = mpsc::channel(16);
        let (a_tx, a_rx) = mpsc::channel(16);
        let (b_tx, b_rx) = mpsc::channel(16);

        tokio::spawn(forward(a_rx, parent_tx.clone(), cancel.clone()));
        tokio::spawn(forward(b_rx, parent_tx.clone(), cancel.clone()));

        a_tx.send(sample_op("a.x", 1)).await.unwrap();
        b_tx.send(sample_op("b.y", 2)).await.unwrap();
        drop(a_tx);
        drop(b_tx);

        let mut seen = vec![
            parent_rx.recv().await.unwrap().namespace,
            parent_rx.recv().await.unwrap().namespace,
        ];
        seen.sort();
        assert_eq!(seen, vec!["a.x".to_string(), "b.y".to_string()]);
    }

    #[tokio::test]
    async fn forward_exits_when_the_child_channel_ends() {
        let cancel = CancellationToken::new();
        let (parent_tx, _parent_rx) = mpsc::channel::<Op>(4);
        let (child_tx, child_rx) = mpsc::channel::<Op>(4);
        let task = tokio::spawn(forward(child_rx, parent_tx, cancel));
        drop(child_tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn forward_exits_on_cancellation_even_when_blocked() {
        let cancel = CancellationToken::new();
        // Parent channel of capacity 1 that nobody drains.
        let (parent_tx, _parent_rx) = mpsc::channel(1);
        let (child_tx, child_rx) = mpsc::channel(4);
        let task = tokio::spawn(forward(child_rx, parent_tx, cancel.clone()));

        child_tx.send(sample_op("a.x", 1)).await.unwrap();
        child_tx.send(sample_op("a.x", 2)).await.unwrap();
        child_tx.send(sample_op("a.x", 3)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn empty_multi_stops_idempotently() {
        let multi = start_multi(&[], Options::default()).await.unwrap();
        multi.stop().await;
        multi.stop().await;
        assert!(*multi.shared.stopped.read().await);
    }

    #[tokio::test]
    async fn empty_multi_direct_read_wait_returns() {
        let multi = start_multi(&[], Options::default()).await.unwrap();
        multi.direct_read_wait().await;
        multi.stop().await;
    }

    #[tokio::test]
    async fn pause_flag_reaches_watchers() {
        let multi = start_multi(&[], Options::default()).await.unwrap();
        let mut watcher = multi.shared.pause_signal.subscribe();
        multi.pause().await;
        assert!(*watcher.borrow_and_update());
        multi.resume().await;
        assert!(!*watcher.borrow_and_update());
        multi.stop().await;
    }
}
