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

//! End-to-end tests against a live replica set.
//!
//! These need a MongoDB replica set (an oplog) on localhost:
//!
//! ```bash
//! mongod --replSet rs0 --port 27017 ... && mongosh --eval 'rs.initiate()'
//! cargo test --test live_tail_test -- --ignored
//! ```

use bson::{doc, Document};
use mongodb::Client;
use optail::{OpSource, Options, OrderingGuarantee};
use std::time::Duration;

async fn test_client() -> Result<Client, Box<dyn std::error::Error>> {
    Ok(Client::with_uri_str("mongodb://localhost:27017/?directConnection=true").await?)
}

#[tokio::test]
#[ignore] // Needs a live replica set.
async fn tail_sees_inserts_updates_and_deletes() -> Result<(), Box<dyn std::error::Error>> {
    let client = test_client().await?;
    let coll = client
        .database("optail_test")
        .collection::<Document>("events");
    coll.drop().await.ok();

    let mut ctx = optail::start(&client, Options::default()).await?;

    coll.insert_one(doc! { "_id": 1, "name": "a" }).await?;
    coll.update_one(doc! { "_id": 1 }, doc! { "$set": { "name": "b" } })
        .await?;
    coll.delete_one(doc! { "_id": 1 }).await?;

    let mut kinds = Vec::new();
    while kinds.len() < 3 {
        let op = tokio::time::timeout(Duration::from_secs(10), ctx.op_rx.recv())
            .await?
            .expect("op stream ended early");
        if op.namespace == "optail_test.events" {
            kinds.push(op.operation.as_str());
        }
    }
    assert_eq!(kinds, vec!["i", "u", "d"]);

    ctx.stop().await;
    Ok(())
}

#[tokio::test]
#[ignore] // Needs a live replica set.
async fn update_ops_are_enriched_with_the_post_image() -> Result<(), Box<dyn std::error::Error>> {
    let client = test_client().await?;
    let coll = client
        .database("optail_test")
        .collection::<Document>("enrich");
    coll.drop().await.ok();

    let mut ctx = optail::start(&client, Options::default()).await?;

    coll.insert_one(doc! { "_id": 1, "name": "a" }).await?;
    coll.update_one(doc! { "_id": 1 }, doc! { "$set": { "name": "b" } })
        .await?;

    let mut update = None;
    while update.is_none() {
        let op = tokio::time::timeout(Duration::from_secs(10), ctx.op_rx.recv())
            .await?
            .expect("op stream ended early");
        if op.namespace == "optail_test.enrich" && op.is_update() {
            update = Some(op);
        }
    }
    let update = update.unwrap();
    let data = update.data.expect("update should carry its post-image");
    assert_eq!(data.get_str("name").unwrap(), "b");

    ctx.stop().await;
    Ok(())
}

#[tokio::test]
#[ignore] // Needs a live replica set.
async fn direct_reads_snapshot_the_collection() -> Result<(), Box<dyn std::error::Error>> {
    let client = test_client().await?;
    let coll = client
        .database("optail_test")
        .collection::<Document>("snapshot");
    coll.drop().await.ok();
    coll.insert_many(vec![
        doc! { "_id": 1 },
        doc! { "_id": 2 },
        doc! { "_id": 3 },
    ])
    .await?;

    let mut ctx = optail::start(
        &client,
        Options::builder()
            .direct_read_ns(vec!["optail_test.snapshot".to_string()])
            .build(),
    )
    .await?;

    ctx.direct_read_wait().await;

    let mut ids = Vec::new();
    while ids.len() < 3 {
        let op = tokio::time::timeout(Duration::from_secs(5), ctx.op_rx.recv())
            .await?
            .expect("op stream ended early");
        if op.source == OpSource::Direct {
            assert!(op.is_insert());
            ids.push(op.id.unwrap());
        }
    }
    assert_eq!(ids.len(), 3);

    ctx.stop().await;
    Ok(())
}

#[tokio::test]
#[ignore] // Needs a live replica set.
async fn document_ordering_serializes_per_id_history() -> Result<(), Box<dyn std::error::Error>> {
    let client = test_client().await?;
    let coll = client
        .database("optail_test")
        .collection::<Document>("ordering");
    coll.drop().await.ok();

    let mut ctx = optail::start(
        &client,
        Options::builder()
            .ordering(OrderingGuarantee::Document)
            .worker_count(4)
            .build(),
    )
    .await?;

    coll.insert_one(doc! { "_id": 42, "v": 0 }).await?;
    for v in 1..=20 {
        coll.update_one(doc! { "_id": 42 }, doc! { "$set": { "v": v } })
            .await?;
    }

    let mut versions = Vec::new();
    while versions.len() < 21 {
        let op = tokio::time::timeout(Duration::from_secs(10), ctx.op_rx.recv())
            .await?
            .expect("op stream ended early");
        if op.namespace == "optail_test.ordering" {
            versions.push(optail::timestamp_to_u64(op.timestamp));
        }
    }
    let mut sorted = versions.clone();
    sorted.sort_unstable();
    assert_eq!(versions, sorted, "per-id ops must keep oplog order");

    ctx.stop().await;
    Ok(())
}

#[tokio::test]
#[ignore] // Needs a live replica set.
async fn stop_terminates_all_tasks() -> Result<(), Box<dyn std::error::Error>> {
    let client = test_client().await?;
    let ctx = optail::start(&client, Options::default()).await?;
    tokio::time::timeout(Duration::from_secs(10), ctx.stop()).await?;
    // A second stop returns immediately.
    tokio::time::timeout(Duration::from_secs(1), ctx.stop()).await?;
    Ok(())
}
