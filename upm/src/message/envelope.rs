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

use derive_new::new;
use serde::{Deserialize, Serialize};

use super::Message;

/// Outer routing wrapper for every frame on a UPM transport.
///
/// # Wire Format
///
/// ```json
/// { "channel": "ServiceMessage", "payload": { "kind": "Event", "messageId": 1, "data": 5 } }
/// { "channel": "NewClient", "payload": { "consumerId": "consumer-1" } }
/// ```
///
/// A `NewClient` envelope sent to a worker is always accompanied by exactly
/// one transferred port (see [`Transport::send_with_port`](crate::transport::Transport::send_with_port)).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "channel", content = "payload")]
pub enum Envelope {
    /// Correlated service traffic.
    ServiceMessage(Message),
    /// Registers a dedicated channel for a consumer.
    NewClient(NewClient),
    /// Worker startup handshake, sent once on the process pipe.
    Ready(ReadyNotice),
    /// Host refusal of a consumer's channel request, sent on the host link.
    ChannelRefused(ChannelRefusal),
}

impl Envelope {
    /// Wraps a message for the `ServiceMessage` channel.
    #[must_use]
    pub const fn service(message: Message) -> Self {
        Self::ServiceMessage(message)
    }

    /// Name of the routing channel, for logging.
    #[must_use]
    pub const fn channel_name(&self) -> &'static str {
        match self {
            Self::ServiceMessage(_) => "ServiceMessage",
            Self::NewClient(_) => "NewClient",
            Self::Ready(_) => "Ready",
            Self::ChannelRefused(_) => "ChannelRefused",
        }
    }
}

/// Descriptor of a new per-consumer channel.
///
/// `service_name` is only set on the host link, where a single host serves
/// several services.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, new)]
#[serde(rename_all = "camelCase")]
pub struct NewClient {
    /// Consumer the channel belongs to.
    pub consumer_id: String,
    /// Service the channel connects to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
}

/// Sent by a worker once its router is attached.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, new)]
#[serde(rename_all = "camelCase")]
pub struct ReadyNotice {
    /// Service name the worker was started with.
    pub service_name: String,
    /// Worker process id.
    pub pid: u32,
}

/// Why the host did not hand out a channel.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, new)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRefusal {
    /// Service the consumer asked for.
    pub service_name: String,
    /// Consumer that asked.
    pub consumer_id: String,
    /// Human-readable reason.
    pub reason: String,
}
