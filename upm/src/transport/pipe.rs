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

use std::os::fd::{AsFd, OwnedFd};
use std::process::Stdio;

use async_trait::async_trait;
use nix::sys::socket::{getsockopt, sockopt, SockType};

use super::protocol::MAX_FRAME_SIZE;
use super::socket::SocketCore;
use super::{InboundHandler, MessagePort, Transport};
use crate::common::UpmError;
use crate::message::Envelope;

/// The host↔worker link.
///
/// The host creates a socket pair when it spawns the worker and hands the
/// child end over as the worker's stdin. The worker adopts it with
/// [`ProcessPipe::from_stdin`].
#[derive(Debug)]
pub struct ProcessPipe {
    core: SocketCore,
}

impl ProcessPipe {
    /// Create the host end and the `Stdio` to give the child.
    pub fn for_child(
        service_name: &str,
        max_frame_size: usize,
    ) -> Result<(Self, Stdio), UpmError> {
        let (host, child) = std::os::unix::net::UnixStream::pair()?;
        host.set_nonblocking(true)?;
        let host = tokio::net::UnixStream::from_std(host)?;

        let pipe = Self {
            core: SocketCore::new(host, format!("pipe:{service_name}"), max_frame_size),
        };
        Ok((pipe, Stdio::from(OwnedFd::from(child))))
    }

    /// Adopt the pipe the host installed as this process's stdin.
    ///
    /// Fails with [`UpmError::NotInChildProcess`] if stdin is not a stream
    /// socket.
    pub fn from_stdin() -> Result<Self, UpmError> {
        Self::from_stdin_with_limit(MAX_FRAME_SIZE)
    }

    /// Like [`ProcessPipe::from_stdin`] with an explicit frame limit.
    pub fn from_stdin_with_limit(max_frame_size: usize) -> Result<Self, UpmError> {
        let fd = std::io::stdin().as_fd().try_clone_to_owned()?;
        match getsockopt(&fd, sockopt::SockType) {
            Ok(SockType::Stream) => {}
            _ => return Err(UpmError::NotInChildProcess),
        }

        let stream = std::os::unix::net::UnixStream::from(fd);
        stream.set_nonblocking(true)?;
        let stream = tokio::net::UnixStream::from_std(stream)?;
        Ok(Self {
            core: SocketCore::new(stream, "pipe:host".to_string(), max_frame_size),
        })
    }
}

#[async_trait]
impl Transport for ProcessPipe {
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
