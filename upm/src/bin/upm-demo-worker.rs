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

//! Small worker used by the integration tests and for manual poking.
//!
//! Requests:
//! - `echo`: returns its payload.
//! - `sleep` `{ "ms": n }`: waits `n` milliseconds, then returns `{ "slept": n }`.
//! - `fail`: answers with an error.
//!
//! Events:
//! - `{ "action": "register", "name": t, "reply": v }` adds a request handler
//!   for `t` that always returns `v`.
//! - `{ "action": "ping" }` answers with a `{ "pong": true }` event on the
//!   transport it arrived on.
//!
//! Setting `UPM_DEMO_EXIT_DURING_STARTUP=<code>` makes the worker exit with
//! that code before signalling readiness.

use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use upm::prelude::*;

const EXIT_DURING_STARTUP_ENV: &str = "UPM_DEMO_EXIT_DURING_STARTUP";

#[derive(Debug, Deserialize)]
struct SleepRequest {
    ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
enum Command {
    Register { name: String, reply: Value },
    Ping,
}

fn initialize_tracing() {
    let filter = std::env::var("UPM_LOG")
        .ok()
        .map(EnvFilter::new)
        .unwrap_or_else(|| {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        });

    let subscriber = FmtSubscriber::builder()
        .compact()
        .with_target(true)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    // A subscriber set elsewhere is fine; keep it.
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn install_handlers(router: &WorkerRouter) {
    router.add_request_handler("echo", |_ctx, data| async move { Ok(data) });

    router.add_request_handler("sleep", |_ctx, data| async move {
        let request: SleepRequest =
            serde_json::from_value(data).context("sleep expects { \"ms\": <number> }")?;
        tokio::time::sleep(Duration::from_millis(request.ms)).await;
        Ok(json!({ "slept": request.ms }))
    });

    router.add_request_handler("fail", |ctx, _data| async move {
        bail!("request {} failed on purpose", ctx.message_id)
    });

    router.add_event_handler(|ctx, data| async move {
        debug!("event {} on {}: {}", ctx.message_id, ctx.transport.label(), data);
        EventDisposition::NotHandled
    });

    let commands = router.clone();
    router.add_event_handler(move |ctx, data| {
        let router = commands.clone();
        async move {
            let Ok(command) = serde_json::from_value::<Command>(data) else {
                return EventDisposition::NotHandled;
            };
            match command {
                Command::Register { name, reply } => {
                    info!("registering request handler '{}'", name);
                    router.add_request_handler(name, move |_ctx, _data| {
                        let reply = reply.clone();
                        async move { Ok(reply) }
                    });
                }
                Command::Ping => {
                    let pong = Message::event(ctx.message_id, json!({ "pong": true }));
                    if let Err(e) = ctx.transport.send(&Envelope::service(pong)).await {
                        debug!("could not answer ping: {}", e);
                    }
                }
            }
            EventDisposition::Handled
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    initialize_tracing();

    if let Ok(code) = std::env::var(EXIT_DURING_STARTUP_ENV) {
        let code: i32 = code
            .parse()
            .with_context(|| format!("{EXIT_DURING_STARTUP_ENV} must be an exit code"))?;
        info!("exiting with {} before ready", code);
        std::process::exit(code);
    }

    let worker = WorkerContext::from_env()?;
    install_handlers(worker.router());
    worker.serve().await?;

    info!("worker '{}' done", worker.service_name());
    Ok(())
}
