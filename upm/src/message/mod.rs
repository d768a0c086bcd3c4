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

//! Wire-level message types.
//!
//! Every frame on a UPM transport is an [`Envelope`]. `ServiceMessage`
//! envelopes carry a [`Message`], the unit of correlated traffic; the other
//! envelope channels manage channels and the worker startup handshake.

pub use envelope::{ChannelRefusal, Envelope, NewClient, ReadyNotice};
pub use service_message::{Message, MessageKind};

/// Defines the [`Envelope`] routing wrapper.
mod envelope;
/// Defines [`Message`] and [`MessageKind`].
mod service_message;
