/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use upm::prelude::*;

use crate::setup::{demo_worker_path, eventually, initialize_tracing, test_config};

mod setup;

/// Host-kept channels are created once per consumer id and carry requests
/// straight to the worker.
#[tokio::test]
async fn test_host_kept_channel() -> anyhow::Result<()> {
    initialize_tracing();
    let dir = tempfile::tempdir()?;
    let client = ServiceClient::new("kept", demo_worker_path(), test_config(&dir));

    assert!(matches!(
        client.create_channel("early").await,
        Err(UpmError::NotReady(_))
    ));

    client.start().await?;

    let (first, second) = tokio::join!(
        client.create_channel("dashboard"),
        client.create_channel("dashboard")
    );
    let (first, second) = (first?, second?);
    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first, &client.create_channel("dashboard").await?));
    assert_eq!(client.channel_ids(), vec!["dashboard".to_string()]);
    assert_eq!(client.stats().channels_created(), 1);

    let reply: Value = client
        .execute_request_with(
            "echo",
            &json!("via channel"),
            RequestOptions {
                target: Target::Channel("dashboard".to_string()),
                ..RequestOptions::default()
            },
        )
        .await?;
    assert_eq!(reply, json!("via channel"));

    let unknown: Result<Value, _> = client
        .execute_request_with(
            "echo",
            &json!(1),
            RequestOptions {
                target: Target::Channel("nobody".to_string()),
                ..RequestOptions::default()
            },
        )
        .await;
    assert_eq!(unknown, Err(UpmError::UnknownChannel("nobody".to_string())));

    assert!(client.close_channel("dashboard").await);
    assert!(!client.close_channel("dashboard").await);
    assert!(client.channel_ids().is_empty());

    client.stop().await?;
    assert!(first.is_closed());
    Ok(())
}

/// A consumer obtains a channel through the host link and talks to the
/// worker directly; the channel can be handed out only once.
#[tokio::test]
async fn test_channel_hand_off_to_consumer() -> anyhow::Result<()> {
    initialize_tracing();
    let dir = tempfile::tempdir()?;
    let config = test_config(&dir);
    let registry = ServiceRegistry::new(config.clone());
    let client = registry
        .get_or_create("telemetry", demo_worker_path())
        .await?;

    let broker = channel_broker::run(config.clone(), registry.clone(), CancellationToken::new())
        .await?;

    let consumer = ChannelRequester::new("telemetry", "consumer-1", config.clone());
    consumer.connect().await?;
    assert!(consumer.is_connected());
    // Connecting again is a no-op.
    consumer.connect().await?;
    let stats = Arc::clone(&broker.stats);
    assert!(eventually(Duration::from_secs(2), move || stats.channels_delivered() == 1).await);

    let reply: Value = consumer.execute_request("echo", &json!({ "n": 1 })).await?;
    assert_eq!(reply, json!({ "n": 1 }));

    let mut events = consumer.subscribe_events();
    consumer.send_event(&json!({ "action": "ping" })).await?;
    let pong = tokio::time::timeout(Duration::from_secs(2), events.recv()).await??;
    assert_eq!(pong.data, json!({ "pong": true }));

    // The host released its half; it cannot use or re-create the channel.
    assert_eq!(
        client.create_channel("consumer-1").await.map(|_| ()),
        Err(UpmError::DuplicateChannel("consumer-1".to_string()))
    );

    let again = ChannelRequester::new("telemetry", "consumer-1", config.clone());
    assert!(matches!(
        again.connect().await,
        Err(UpmError::ChannelRefused(_))
    ));

    let stranger = ChannelRequester::new("no-such-service", "consumer-2", config);
    assert!(matches!(
        stranger.connect().await,
        Err(UpmError::ChannelRefused(_))
    ));
    let stats = Arc::clone(&broker.stats);
    assert!(eventually(Duration::from_secs(2), move || stats.channels_refused() == 2).await);

    consumer.close().await;
    assert!(!consumer.is_connected());
    let closed: Result<Value, _> = consumer.execute_request("echo", &json!(1)).await;
    assert_eq!(closed, Err(UpmError::ChannelClosed));

    broker.stop();
    registry.destroy_all().await;
    Ok(())
}

/// Requests pending on a consumer channel fail when the worker goes away.
#[tokio::test]
async fn test_consumer_sees_worker_stop() -> anyhow::Result<()> {
    initialize_tracing();
    let dir = tempfile::tempdir()?;
    let config = test_config(&dir);
    let registry = ServiceRegistry::new(config.clone());
    let client = registry.get_or_create("sleepy", demo_worker_path()).await?;
    let broker = channel_broker::run(config.clone(), registry.clone(), CancellationToken::new())
        .await?;

    let consumer = Arc::new(ChannelRequester::new("sleepy", "consumer-1", config));
    consumer.connect().await?;

    let waiting = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move {
            consumer
                .execute_request::<_, Value>("sleep", &json!({ "ms": 10_000 }))
                .await
        })
    };
    let counting = Arc::clone(&consumer);
    assert!(eventually(Duration::from_secs(2), move || counting.pending_requests() == 1).await);

    client.stop().await?;
    assert_eq!(waiting.await?, Err(UpmError::ConnectionClosed));
    assert!(!consumer.is_connected());

    broker.stop();
    Ok(())
}
