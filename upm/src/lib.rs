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

#![deny(unsafe_code)]

//! # UPM: Utility Process Messaging
//!
//! Runs pieces of an application in isolated worker processes and talks to
//! them with correlated request/response traffic and fire-and-forget events.
//!
//! ## Key Concepts
//!
//! - **Host (`ServiceClient`, `ServiceRegistry`)**: spawns one worker per
//!   service, tracks its lifecycle, and correlates requests with responses.
//! - **Worker (`WorkerContext`, `WorkerRouter`)**: runs inside the child,
//!   routes requests by type and passes events down an ordered handler chain.
//! - **Channels (`MessagePort`)**: dedicated per-consumer connections to a
//!   worker. The host creates them and can transfer them to other processes
//!   over the host link (`channel_broker`).
//! - **Consumer (`ChannelRequester`)**: asks the host link for a channel and
//!   sends requests over it directly to the worker.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use upm::prelude::*;
//!
//! let registry = ServiceRegistry::new(UpmConfig::load());
//! let telemetry = registry.get_or_create("telemetry", "/usr/libexec/telemetry-worker").await?;
//!
//! let status: serde_json::Value = telemetry
//!     .execute_request("getStatus", &serde_json::json!({}))
//!     .await?;
//!
//! registry.destroy_all().await;
//! ```

/// Configuration, errors and request correlation shared by every side.
pub mod common;

/// Consumer processes that reach a worker through a transferred channel.
pub mod consumer;

/// Host-side process management.
pub mod host;

/// Wire-level message types.
pub mod message;

/// Framed Unix-socket transports and descriptor passing.
pub mod transport;

/// Worker-side context and routing.
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use async_trait;

    pub use crate::common::{Correlator, PendingResponse, UpmConfig, UpmError};
    pub use crate::consumer::ChannelRequester;
    pub use crate::host::channel_broker::{self, ChannelBrokerHandle, ChannelBrokerStats};
    pub use crate::host::{
        ExitCode, RequestOptions, ServiceClient, ServiceOptions, ServiceRegistry, ServiceState,
        Target,
    };
    pub use crate::message::{Envelope, Message, MessageKind};
    pub use crate::transport::{MessagePort, ProcessPipe, Transport, TransportEvent};
    pub use crate::worker::{
        EventContext, EventDisposition, RequestContext, WorkerContext, WorkerRouter,
    };
}
