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

use std::os::fd::OwnedFd;
use std::path::Path;

use async_trait::async_trait;
use tokio::net::UnixStream;

use super::protocol::MAX_FRAME_SIZE;
use super::socket::SocketCore;
use super::{InboundHandler, Transport};
use crate::common::UpmError;
use crate::message::Envelope;

/// A transferable, duplex message channel.
///
/// Ports are created in connected pairs. Either half can be handed to another
/// process with [`Transport::send_with_port`]; the receiver gets it back as
/// [`Inbound::port`](super::Inbound::port). The host link to a running
/// channel broker is also a `MessagePort`.
#[derive(Debug)]
pub struct MessagePort {
    core: SocketCore,
}

impl MessagePort {
    /// Create a connected pair of ports.
    pub fn pair() -> Result<(Self, Self), UpmError> {
        let (a, b) = UnixStream::pair()?;
        Ok((
            Self::from_stream(a, "port:a", MAX_FRAME_SIZE),
            Self::from_stream(b, "port:b", MAX_FRAME_SIZE),
        ))
    }

    /// Connect to a channel broker's host link.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, UpmError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_stream(
            stream,
            format!("link:{}", path.display()),
            MAX_FRAME_SIZE,
        ))
    }

    pub(crate) fn from_stream(stream: UnixStream, label: impl Into<String>, max: usize) -> Self {
        Self {
            core: SocketCore::new(stream, label.into(), max),
        }
    }

    /// Rebuild a port from a descriptor received over SCM_RIGHTS.
    pub(super) fn from_owned_fd(fd: OwnedFd, max_frame_size: usize) -> Result<Self, UpmError> {
        let stream = std::os::unix::net::UnixStream::from(fd);
        stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(stream)?;
        Ok(Self::from_stream(stream, "port:received", max_frame_size))
    }

    /// Replace the log label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.core.set_label(label.into());
        self
    }

    /// Replace the frame size limit.
    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.core.set_max_frame_size(max_frame_size);
        self
    }

    /// Frame size limit in bytes.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.core.max_frame_size()
    }

    /// Returns `true` once a dispatcher has been attached.
    #[must_use]
    pub fn has_handler(&self) -> bool {
        self.core.has_handler()
    }

    pub(super) const fn core(&self) -> &SocketCore {
        &self.core
    }
}

#[async_trait]
impl Transport for MessagePort {
    async fn send(&self, envelope: &Envelope) -> Result<(), UpmError> {
        self.core.send(envelope).await
    }

    async fn send_with_port(
        &self,
        envelope: &Envelope,
        port: &MessagePort,
    ) -> Result<(), UpmError> {
        self.core.send_with_port(envelope, port).await
    }

    fn on_message(&self, handler: InboundHandler) -> Result<(), UpmError> {
        self.core.on_message(handler)
    }

    async fn close(&self) {
        self.core.close();
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    fn label(&self) -> &str {
        self.core.label()
    }
}
