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

//! Context lifecycle: starting the engine and controlling it.
//!
//! [`start`] wires the whole data flow for one session and returns an
//! [`OpCtx`] immediately:
//!
//! ```text
//! ┌────────┐   broadcast    ┌──────────────┐   flush    ┌──────┐
//! │ Tailer │ ─────────────► │ Fetch worker │ ─────────► │ op_rx│
//! └────────┘  per-worker    │  (OpBuf)     │            │err_rx│
//!      ▲      channels      └──────────────┘            └──────┘
//!      │                                                    ▲
//! ┌────────────┐          direct emission                   │
//! │ DirectRead │ ───────────────────────────────────────────┘
//! └────────────┘
//! ```
//!
//! Every spawned task is tracked; [`OpCtx::stop`] cancels them all and
//! waits for them to exit. Direct-read tasks are additionally tracked on
//! their own tracker so [`OpCtx::direct_read_wait`] can signal the end of
//! the initial snapshot.
//!
//! # Example
//!
//! ```rust,no_run
//! use mongodb::Client;
//! use optail::Options;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::with_uri_str("mongodb://localhost:27017").await?;
//! let mut ctx = optail::start(&client, Options::default()).await?;
//!
//! while let Some(op) = ctx.op_rx.recv().await {
//!     println!("{} on {}", op.operation.as_str(), op.namespace);
//! }
//! ctx.stop().await;
//! # Ok(())
//! # }
//! ```

use bson::{doc, Timestamp};
use mongodb::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::direct;
use crate::error::{ConfigError, TailError};
use crate::metrics;
use crate::op::Op;
use crate::options::{parse_duration, Options};
use crate::ordering::op_filter_for_ordering;
use crate::tailer::{self, TailerChans};
use crate::worker;

/// Shared control state for one running context. Cheap to clone; every
/// task holds one.
#[derive(Clone)]
pub(crate) struct Control {
    pub(crate) cancel: CancellationToken,
    pub(crate) seek_tx: mpsc::Sender<Timestamp>,
    pub(crate) pause_tx: mpsc::Sender<()>,
    pub(crate) resume_tx: mpsc::Sender<()>,
    pub(crate) paused: Arc<RwLock<bool>>,
    pub(crate) stopped: Arc<RwLock<bool>>,
    pub(crate) all_tasks: TaskTracker,
    pub(crate) direct_read_tasks: TaskTracker,
}

impl Control {
    pub(crate) async fn since(&self, ts: Timestamp) {
        if self.seek_tx.try_send(ts).is_err() {
            debug!("seek signal dropped; tailer has not consumed the previous one");
        }
    }

    pub(crate) async fn pause(&self) {
        let mut paused = self.paused.write().await;
        if !*paused {
            *paused = true;
            let _ = self.pause_tx.send(()).await;
        }
    }

    pub(crate) async fn resume(&self) {
        let mut paused = self.paused.write().await;
        if *paused {
            *paused = false;
            let _ = self.resume_tx.send(()).await;
        }
    }

    pub(crate) async fn stop(&self) {
        {
            let mut stopped = self.stopped.write().await;
            if !*stopped {
                *stopped = true;
                info!("stopping context");
                self.cancel.cancel();
                self.all_tasks.close();
            }
        }
        self.all_tasks.wait().await;
    }
}

/// Emission side of a context: the op and error channels plus the
/// cancellation token every send races against.
#[derive(Clone)]
pub(crate) struct Emitter {
    pub(crate) op_tx: mpsc::Sender<Op>,
    pub(crate) err_tx: mpsc::Sender<TailError>,
    pub(crate) cancel: CancellationToken,
}

impl Emitter {
    /// Delivers an op, honoring backpressure. Returns `false` when the
    /// context was cancelled or the consumer is gone.
    pub(crate) async fn emit(&self, op: Op) -> bool {
        let source = op.source.as_str();
        let operation = op.operation.as_str();
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            sent = self.op_tx.send(op) => {
                if sent.is_ok() {
                    metrics::record_op_emitted(source, operation);
                }
                sent.is_ok()
            }
        }
    }

    /// Reports an error. The error channel is bounded too; a full channel
    /// blocks the producer rather than dropping the error.
    pub(crate) async fn error(&self, err: TailError) -> bool {
        warn!(category = err.category(), error = %err, "engine error");
        metrics::record_error(err.category());
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            sent = self.err_tx.send(err) => sent.is_ok(),
        }
    }
}

/// Pings the server every five seconds until it answers or the context is
/// cancelled. Gates every reconnect path.
pub(crate) async fn wait_for_connection(client: &Client, cancel: &CancellationToken) {
    let period = Duration::from_secs(5);
    let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            _ = tick.tick() => {
                match client.database("admin").run_command(doc! { "ping": 1 }).await {
                    Ok(_) => {
                        info!("connection re-established");
                        metrics::record_reconnect();
                        return;
                    }
                    Err(error) => debug!(%error, "still waiting for connection"),
                }
            }
        }
    }
}

/// A running engine instance for one session.
///
/// Consume [`op_rx`](Self::op_rx) for the merged op stream and
/// [`err_rx`](Self::err_rx) for engine errors. The receivers end once
/// every producer has exited, which happens after [`stop`](Self::stop).
pub struct OpCtx {
    /// Emitted ops, in the configured ordering.
    pub op_rx: mpsc::Receiver<Op>,
    /// Engine errors; streaming continues after each.
    pub err_rx: mpsc::Receiver<TailError>,
    pub(crate) ctl: Control,
}

impl OpCtx {
    /// Moves the tailer to `ts`: the cursor restarts at entries newer than
    /// `ts`. Non-blocking; a seek sent before the tailer consumed the
    /// previous one is dropped.
    pub async fn since(&self, ts: Timestamp) {
        self.ctl.since(ts).await;
    }

    /// Pauses the tailer after the entry it is currently handling.
    /// In-flight ops may still be delivered; there is no hard fence.
    pub async fn pause(&self) {
        self.ctl.pause().await;
    }

    /// Resumes a paused tailer.
    pub async fn resume(&self) {
        self.ctl.resume().await;
    }

    /// Stops the context and waits for every spawned task to exit.
    /// Idempotent; concurrent callers all block until shutdown completes.
    pub async fn stop(&self) {
        self.ctl.stop().await;
    }

    /// Completes once every direct-read task has finished, i.e. the
    /// initial snapshot is done. Returns immediately when no direct reads
    /// were configured.
    pub async fn direct_read_wait(&self) {
        self.ctl.direct_read_tasks.wait().await;
    }
}

/// Resolves the oplog collection: the first collection in the oplog
/// database whose name begins with `oplog.`.
async fn resolve_oplog_collection(client: &Client, database: &str) -> Result<String, ConfigError> {
    let names = client
        .database(database)
        .list_collection_names()
        .await
        .map_err(|source| ConfigError::ListCollections {
            database: database.to_string(),
            source,
        })?;
    names
        .into_iter()
        .find(|name| name.starts_with("oplog."))
        .ok_or_else(|| ConfigError::MissingOplogCollection {
            database: database.to_string(),
        })
}

/// Starts the engine for one session and returns its context immediately.
///
/// Spawns the fetch workers, one reader per direct-read namespace, and the
/// tailer. Fails fast on configuration errors: an unresolvable oplog
/// collection or an invalid `cursor_timeout`.
pub async fn start(client: &Client, options: Options) -> Result<OpCtx, ConfigError> {
    let mut options = options;
    options.set_defaults();

    let cursor_timeout = parse_duration(&options.cursor_timeout).map_err(|reason| {
        ConfigError::InvalidCursorTimeout {
            value: options.cursor_timeout.clone(),
            reason,
        }
    })?;
    if options.oplog_collection_name.is_none() {
        let resolved = resolve_oplog_collection(client, &options.oplog_database_name).await?;
        debug!(collection = %resolved, "resolved oplog collection");
        options.oplog_collection_name = Some(resolved);
    }

    let (op_tx, op_rx) = mpsc::channel(options.channel_size);
    let (err_tx, err_rx) = mpsc::channel(options.channel_size);
    let (seek_tx, seek_rx) = mpsc::channel(1);
    let (pause_tx, pause_rx) = mpsc::channel(1);
    let (resume_tx, resume_rx) = mpsc::channel(1);

    let ctl = Control {
        cancel: CancellationToken::new(),
        seek_tx,
        pause_tx,
        resume_tx,
        paused: Arc::new(RwLock::new(false)),
        stopped: Arc::new(RwLock::new(false)),
        all_tasks: TaskTracker::new(),
        direct_read_tasks: TaskTracker::new(),
    };
    let em = Emitter {
        op_tx,
        err_tx,
        cancel: ctl.cancel.clone(),
    };
    let options = Arc::new(options);

    info!(
        ordering = ?options.ordering,
        workers = options.worker_count,
        direct_read_ns = options.direct_read_ns.len(),
        delta = options.update_data_as_delta,
        "starting context"
    );

    // Fetch workers, each with a private input channel. Delta mode runs
    // zero workers and the tailer emits directly.
    let worker_names: Vec<String> = (1..=options.worker_count).map(|i| i.to_string()).collect();
    let mut worker_txs = Vec::with_capacity(worker_names.len());
    for name in &worker_names {
        let (in_tx, in_rx) = mpsc::channel(options.channel_size);
        worker_txs.push(in_tx);
        let predicate = op_filter_for_ordering(options.ordering, &worker_names, name);
        ctl.all_tasks.spawn(worker::fetch_documents(
            client.clone(),
            ctl.cancel.clone(),
            em.clone(),
            Arc::clone(&options),
            predicate,
            in_rx,
        ));
    }

    if !options.direct_read_ns.is_empty() {
        let scan_ok = match direct::supports_collection_scan(client).await {
            Ok(ok) => {
                if ok {
                    info!("direct read parallel collection scan is on");
                }
                ok
            }
            Err(error) => {
                em.error(TailError::ParallelScan {
                    namespace: String::new(),
                    message: format!("error determining collection scan support: {error}"),
                })
                .await;
                false
            }
        };
        for ns in &options.direct_read_ns {
            direct::spawn_reader(
                &ctl,
                client.clone(),
                em.clone(),
                Arc::clone(&options),
                ns.clone(),
                scan_ok,
            );
        }
    }
    // No direct-read task is ever added outside an already-tracked task,
    // so closing here keeps direct_read_wait sound.
    ctl.direct_read_tasks.close();

    ctl.all_tasks.spawn(tailer::tail_ops(
        client.clone(),
        em.clone(),
        Arc::clone(&options),
        TailerChans {
            seek_rx,
            pause_rx,
            resume_rx,
        },
        worker_txs,
        cursor_timeout,
    ));

    Ok(OpCtx { op_rx, err_rx, ctl })
}

/// Convenience wrapper: starts a context and hands back only its channels.
/// The engine keeps running for the life of the process; use [`start`]
/// when you need `stop`/`pause`/`since`.
pub async fn tail(
    client: &Client,
    options: Options,
) -> Result<(mpsc::Receiver<Op>, mpsc::Receiver<TailError>), ConfigError> {
    let OpCtx { op_rx, err_rx, .. } = start(client, options).await?;
    Ok((op_rx, err_rx))
}
