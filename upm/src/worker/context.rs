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

use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use super::router::WorkerRouter;
use crate::common::UpmError;
use crate::host::{IN_CHILD_PROCESS_ENV, SERVICE_NAME_ENV};
use crate::message::{Envelope, ReadyNotice};
use crate::transport::{InboundHandler, ProcessPipe, Transport, TransportEvent};

/// Everything a worker process needs: its pipe to the host and its router.
///
/// Built once in the worker's `main` and passed to whatever registers
/// handlers.
///
/// # Example
///
/// ```rust,ignore
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let worker = WorkerContext::from_env()?;
///     worker.router().add_request_handler("getStatus", |_ctx, _data| async move {
///         Ok(serde_json::json!({ "ok": true }))
///     });
///     worker.serve().await?;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct WorkerContext {
    service_name: String,
    pipe: Arc<ProcessPipe>,
    router: WorkerRouter,
    shutdown: CancellationToken,
}

impl WorkerContext {
    /// Adopt the environment and pipe the host set up for this process.
    pub fn from_env() -> Result<Self, UpmError> {
        if std::env::var(IN_CHILD_PROCESS_ENV).as_deref() != Ok("true") {
            return Err(UpmError::NotInChildProcess);
        }
        let service_name =
            std::env::var(SERVICE_NAME_ENV).unwrap_or_else(|_| "worker".to_string());
        Ok(Self::new(service_name, ProcessPipe::from_stdin()?))
    }

    /// Build a context around an existing pipe.
    pub fn new(service_name: impl Into<String>, pipe: ProcessPipe) -> Self {
        Self {
            service_name: service_name.into(),
            pipe: Arc::new(pipe),
            router: WorkerRouter::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Service name the host started this worker with.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The router serving the pipe and every channel.
    #[must_use]
    pub const fn router(&self) -> &WorkerRouter {
        &self.router
    }

    /// Token that ends [`WorkerContext::serve`] when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Attach the router, signal readiness, and serve until the host closes
    /// the pipe or the shutdown token fires.
    #[instrument(skip(self), fields(service = %self.service_name))]
    pub async fn serve(&self) -> Result<(), UpmError> {
        let pipe: Arc<dyn Transport> = self.pipe.clone();
        let dispatch = self.router.dispatcher(&pipe, None);
        let shutdown = self.shutdown.clone();
        let handler: InboundHandler = Arc::new(move |event| {
            let closed = matches!(event, TransportEvent::Closed);
            let dispatched = dispatch(event);
            let shutdown = shutdown.clone();
            async move {
                dispatched.await;
                if closed {
                    shutdown.cancel();
                }
            }
            .boxed()
        });
        self.pipe.on_message(handler)?;

        let ready = ReadyNotice::new(self.service_name.clone(), std::process::id());
        self.pipe.send(&Envelope::Ready(ready)).await?;
        info!("Worker '{}' ready", self.service_name);

        self.shutdown.cancelled().await;

        info!("Worker '{}' shutting down", self.service_name);
        self.router.close_channels().await;
        self.pipe.close().await;
        Ok(())
    }
}
