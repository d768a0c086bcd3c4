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

//! Duplex, message-oriented transports.
//!
//! A [`Transport`] carries [`Envelope`]s between two processes. Two concrete
//! transports implement it:
//!
//! - [`ProcessPipe`]: the host↔worker link, bound when the worker is spawned.
//! - [`MessagePort`]: a per-consumer channel. One half can be transferred to
//!   another process alongside an envelope.
//!
//! Both run over Unix domain sockets and share one framing and dispatch core.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::common::UpmError;
use crate::message::Envelope;

pub use pipe::ProcessPipe;
pub use port::MessagePort;

/// Shared socket core: framing, fd passing, the reader task.
mod socket;

/// Host↔worker process pipe.
mod pipe;

/// Transferable per-consumer message port.
mod port;

/// Frame encoding and decoding.
pub mod protocol;

/// An envelope received on a transport, with the port transferred alongside it.
#[derive(Debug)]
pub struct Inbound {
    /// The decoded envelope.
    pub envelope: Envelope,
    /// Port transferred with the frame, if any.
    pub port: Option<MessagePort>,
}

/// What a transport delivers to its dispatcher.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded inbound frame.
    Message(Inbound),
    /// The transport stopped reading. Delivered exactly once.
    Closed,
}

/// Dispatcher attached to a transport with [`Transport::on_message`].
///
/// Each returned future is awaited before the next frame is read, so a
/// dispatcher sees frames in the order they were sent.
pub type InboundHandler = Arc<dyn Fn(TransportEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Contract shared by every UPM transport.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Send an envelope. Fails with [`UpmError::ChannelClosed`] once closed.
    async fn send(&self, envelope: &Envelope) -> Result<(), UpmError>;

    /// Send an envelope with one port half transferred alongside it.
    ///
    /// The port must not have a dispatcher attached. The caller keeps its own
    /// descriptor and should close it once the transfer succeeded.
    async fn send_with_port(&self, envelope: &Envelope, port: &MessagePort)
        -> Result<(), UpmError>;

    /// Register the single dispatcher and start reading.
    fn on_message(&self, handler: InboundHandler) -> Result<(), UpmError>;

    /// Stop reading and release this process's descriptor. Idempotent.
    async fn close(&self);

    /// Returns `true` once closed locally or by the peer.
    fn is_closed(&self) -> bool;

    /// Short name used in logs.
    fn label(&self) -> &str;
}
