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

use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use upm::prelude::*;

use crate::setup::{demo_worker_path, initialize_tracing, test_config};

mod setup;

/// End-to-end walk through a telemetry service.
///
/// **Scenario:**
/// 1. Start the worker through the registry and ask for an unregistered
///    request type with a short timeout.
/// 2. Teach the worker `getStatus` with an event, then ask again.
/// 3. Create a channel for `consumer-1`, hand it to a consumer process
///    through the host link, and query the worker there.
/// 4. Stop the service.
///
/// **Verification:**
/// - The unregistered request is answered with an "unknown type" error, not a timeout.
/// - `getStatus` answers `{ "ok": true }` on the pipe and on the channel.
/// - `stop()` reports a clean exit and later requests are refused.
#[tokio::test]
async fn test_telemetry_service_lifecycle() -> anyhow::Result<()> {
    initialize_tracing();
    let dir = tempfile::tempdir()?;
    let config = test_config(&dir);
    let registry = ServiceRegistry::new(config.clone());
    let broker =
        channel_broker::run(config.clone(), registry.clone(), CancellationToken::new()).await?;

    let telemetry = registry
        .get_or_create("telemetry", demo_worker_path())
        .await?;
    assert_eq!(telemetry.state(), ServiceState::Ready);

    let unknown: Result<Value, _> = telemetry
        .execute_request_with(
            "getStatus",
            &json!({}),
            RequestOptions::with_timeout(Duration::from_millis(50)),
        )
        .await;
    match unknown {
        Err(UpmError::Remote(reason)) => assert!(reason.contains("unknown type 'getStatus'")),
        other => panic!("expected unknown type error, got {other:?}"),
    }

    telemetry
        .send_event(
            &json!({ "action": "register", "name": "getStatus", "reply": { "ok": true } }),
            Target::Worker,
        )
        .await?;
    let status: Value = telemetry.execute_request("getStatus", &json!({})).await?;
    assert_eq!(status, json!({ "ok": true }));

    let port = telemetry.create_channel("consumer-1").await?;
    assert!(!port.is_closed());
    let dashboard = ChannelRequester::new("telemetry", "consumer-1", config);
    dashboard.connect().await?;
    let status: Value = dashboard.execute_request("getStatus", &json!({})).await?;
    assert_eq!(status, json!({ "ok": true }));

    let code = telemetry.stop().await?;
    assert_eq!(code, Some(0));
    assert_eq!(telemetry.state(), ServiceState::Exited);

    let refused: Result<Value, _> = telemetry.execute_request("getStatus", &json!({})).await;
    assert!(matches!(refused, Err(UpmError::ServiceStopping(_))));

    dashboard.close().await;
    broker.stop();
    registry.destroy_all().await;
    Ok(())
}
