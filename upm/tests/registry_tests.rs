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

use serde_json::{json, Value};
use upm::prelude::*;

use crate::setup::{demo_worker_path, initialize_tracing, test_config};

mod setup;

/// One client per service name; asking again returns the running client.
#[tokio::test]
async fn test_get_or_create_reuses_client() -> anyhow::Result<()> {
    initialize_tracing();
    let dir = tempfile::tempdir()?;
    let registry = ServiceRegistry::new(test_config(&dir));
    assert!(registry.is_empty());

    let first = registry.get_or_create("search", demo_worker_path()).await?;
    let second = registry.get_or_create("search", demo_worker_path()).await?;
    assert!(first.ptr_eq(&second));
    assert_eq!(first.pid(), second.pid());
    assert_eq!(registry.service_names(), vec!["search".to_string()]);

    let mismatch = registry
        .get_or_create("search", dir.path().join("other-worker"))
        .await;
    assert!(matches!(
        mismatch,
        Err(UpmError::EntryPointMismatch { ref service, .. }) if service == "search"
    ));
    // The running client is untouched.
    let reply: Value = first.execute_request("echo", &json!("still here")).await?;
    assert_eq!(reply, json!("still here"));

    registry.destroy("search").await;
    assert!(registry.get("search").is_none());
    assert_eq!(first.state(), ServiceState::Exited);
    Ok(())
}

/// A stopped client is replaced by a fresh worker on the next request for it.
#[tokio::test]
async fn test_exited_client_is_replaced() -> anyhow::Result<()> {
    initialize_tracing();
    let dir = tempfile::tempdir()?;
    let registry = ServiceRegistry::new(test_config(&dir));

    let first = registry.get_or_create("indexer", demo_worker_path()).await?;
    first.stop().await?;

    let second = registry.get_or_create("indexer", demo_worker_path()).await?;
    assert!(!first.ptr_eq(&second));
    assert!(second.is_ready());
    assert_ne!(first.pid(), second.pid());

    registry.destroy_all().await;
    assert!(registry.is_empty());
    Ok(())
}

/// Destroying every service stops each worker.
#[tokio::test]
async fn test_destroy_all() -> anyhow::Result<()> {
    initialize_tracing();
    let dir = tempfile::tempdir()?;
    let registry = ServiceRegistry::new(test_config(&dir));

    let a = registry.get_or_create("a", demo_worker_path()).await?;
    let b = registry.get_or_create("b", demo_worker_path()).await?;
    assert_eq!(registry.len(), 2);

    registry.destroy_all().await;
    assert!(registry.is_empty());
    assert_eq!(a.state(), ServiceState::Exited);
    assert_eq!(b.state(), ServiceState::Exited);
    Ok(())
}
