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

//! Shard discovery for sharded deployments.
//!
//! [`get_shards`] lists the shards registered in `config.shards`, which
//! is how callers build the session list for
//! [`start_multi`](crate::start_multi).
//!
//! [`OpCtxMulti::add_shard_listener`](crate::OpCtxMulti::add_shard_listener)
//! keeps a deployment current after startup: a dedicated child context
//! tails the config server's oplog filtered to inserts on
//! `config.shards`, and each discovered shard is dialed through a
//! caller-supplied handler, started, and spliced into the parent.

use bson::{doc, Document};
use futures::future::BoxFuture;
use futures::TryStreamExt;
use mongodb::Client;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::context::{start, OpCtx};
use crate::error::{ConfigError, TailError};
use crate::multi::{splice_child, MultiHandle, OpCtxMulti};
use crate::op::{Op, OpFilter};
use crate::options::Options;

/// One shard of a sharded deployment, as registered in `config.shards`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    hostname: String,
}

impl ShardInfo {
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }

    /// The raw host string: `"<replicaSet>/<host:port,...>"` for replica
    /// set shards, `"<host:port>"` for standalone ones.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// A connection-string form of the host: the host list plus a
    /// `replicaSet` query parameter when one is named.
    #[must_use]
    pub fn url(&self) -> String {
        match self.hostname.split_once('/') {
            Some((replica_set, hosts)) => format!("{hosts}?replicaSet={replica_set}"),
            None => self.hostname.clone(),
        }
    }
}

/// Dials a newly discovered shard, returning a client for it. Errors are
/// reported as [`TailError::ShardHandler`] and the shard is skipped.
pub type ShardInsertHandler =
    Arc<dyn Fn(&ShardInfo) -> BoxFuture<'static, Result<Client, String>> + Send + Sync>;

/// Lists the shards currently registered in `config.shards`.
pub async fn get_shards(client: &Client) -> Result<Vec<ShardInfo>, mongodb::error::Error> {
    let cursor = client
        .database("config")
        .collection::<Document>("shards")
        .find(doc! {})
        .await?;
    let shards: Vec<Document> = cursor.try_collect().await?;
    Ok(shards
        .into_iter()
        .filter_map(|shard| shard.get_str("host").ok().map(ShardInfo::new))
        .collect())
}

impl OpCtxMulti {
    /// Watches the config server for new shards and splices a freshly
    /// started child context into this multi-context for each one.
    ///
    /// `config_client` must point at the config server (or a mongos that
    /// exposes its oplog). `shard_options` configures the per-shard child
    /// contexts. The supervisor honors this context's pause, resume, and
    /// stop.
    pub async fn add_shard_listener(
        &self,
        config_client: &Client,
        shard_options: Options,
        handler: ShardInsertHandler,
    ) -> Result<(), ConfigError> {
        let listener_options = Options::builder()
            .namespace_filter(
                Arc::new(|op: &Op| op.namespace == "config.shards" && op.is_insert()) as OpFilter,
            )
            .build();
        let config_ctx = start(config_client, listener_options).await?;
        let handle = self.shared.clone();
        let paused = self.shared.pause_signal.subscribe();
        self.shared
            .all_tasks
            .spawn(tail_shards(handle, paused, config_ctx, shard_options, handler));
        Ok(())
    }
}

/// The shard listener supervisor task.
async fn tail_shards(
    multi: MultiHandle,
    mut paused: watch::Receiver<bool>,
    mut config_ctx: OpCtx,
    options: Options,
    handler: ShardInsertHandler,
) {
    let mut options = options;
    options.set_defaults();
    loop {
        tokio::select! {
            biased;
            () = multi.cancel.cancelled() => {
                config_ctx.ctl.stop().await;
                return;
            }
            changed = paused.changed() => {
                if changed.is_ok() && *paused.borrow_and_update() {
                    if !wait_while_paused(&multi, &mut paused).await {
                        config_ctx.ctl.stop().await;
                        return;
                    }
                }
            }
            Some(err) = config_ctx.err_rx.recv() => {
                multi.report(err).await;
            }
            Some(op) = config_ctx.op_rx.recv() => {
                handle_shard_insert(&multi, &options, &handler, op).await;
            }
        }
    }
}

/// Blocks until the pause flag clears. Returns `false` on cancellation.
async fn wait_while_paused(multi: &MultiHandle, paused: &mut watch::Receiver<bool>) -> bool {
    loop {
        tokio::select! {
            biased;
            () = multi.cancel.cancelled() => return false,
            changed = paused.changed() => {
                if changed.is_err() || !*paused.borrow_and_update() {
                    return true;
                }
            }
        }
    }
}

/// Handles one insert on `config.shards`: dial the shard, start a child
/// context against it, splice the child in.
async fn handle_shard_insert(
    multi: &MultiHandle,
    options: &Options,
    handler: &ShardInsertHandler,
    op: Op,
) {
    let Some(host) = op.data.as_ref().and_then(|data| data.get_str("host").ok()) else {
        warn!("config.shards insert without a host field");
        return;
    };
    let shard = ShardInfo::new(host);
    info!(shard = %shard.hostname(), "new shard detected");
    let client = match handler(&shard).await {
        Ok(client) => client,
        Err(message) => {
            multi.report(TailError::ShardHandler { message }).await;
            return;
        }
    };
    match start(&client, options.clone()).await {
        Ok(child) => splice_child(multi, child).await,
        Err(err) => {
            multi
                .report(TailError::ShardHandler {
                    message: err.to_string(),
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replica_set_hosts_become_query_urls() {
        let shard = ShardInfo::new("rs0/node1:27017,node2:27017");
        assert_eq!(shard.hostname(), "rs0/node1:27017,node2:27017");
        assert_eq!(shard.url(), "node1:27017,node2:27017?replicaSet=rs0");
    }

    #[test]
    fn standalone_hosts_pass_through() {
        let shard = ShardInfo::new("node1:27018");
        assert_eq!(shard.url(), "node1:27018");
    }
}
