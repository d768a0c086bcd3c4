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

use serde::{Deserialize, Serialize};

/// The role a [`Message`] plays in the protocol.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Fire-and-forget notification; never answered.
    Event,
    /// Correlated call expecting exactly one [`MessageKind::Response`].
    Request,
    /// Answer to a request, carrying the request's `message_id`.
    Response,
}

/// One correlated unit of protocol traffic.
///
/// # Wire Format
///
/// ```json
/// {
///   "kind": "Request",
///   "type": "getStatus",
///   "messageId": 42,
///   "data": {}
/// }
/// ```
///
/// A failed response carries `"error": "<message>"` and a `null` `data`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Event, request or response.
    pub kind: MessageKind,

    /// Logical operation name. Required for requests and responses.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,

    /// Sender-scoped correlation id.
    pub message_id: u64,

    /// Payload. The protocol does not interpret it.
    #[serde(default)]
    pub data: serde_json::Value,

    /// Error text on a failed response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    /// Creates an event.
    #[must_use]
    pub fn event(message_id: u64, data: serde_json::Value) -> Self {
        Self {
            kind: MessageKind::Event,
            message_type: None,
            message_id,
            data,
            error: None,
        }
    }

    /// Creates a request for `message_type`.
    #[must_use]
    pub fn request(
        message_id: u64,
        message_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            kind: MessageKind::Request,
            message_type: Some(message_type.into()),
            message_id,
            data,
            error: None,
        }
    }

    /// Creates a successful response to `request`.
    #[must_use]
    pub fn response(request: &Self, data: serde_json::Value) -> Self {
        Self {
            kind: MessageKind::Response,
            message_type: request.message_type.clone(),
            message_id: request.message_id,
            data,
            error: None,
        }
    }

    /// Creates a failed response to `request`.
    #[must_use]
    pub fn error_response(request: &Self, error: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Response,
            message_type: request.message_type.clone(),
            message_id: request.message_id,
            data: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }

    /// Returns `true` if this is a response carrying an error.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self.kind, MessageKind::Response) && self.error.is_some()
    }

    /// The logical type, or `""` when absent.
    #[must_use]
    pub fn type_name(&self) -> &str {
        self.message_type.as_deref().unwrap_or_default()
    }
}
