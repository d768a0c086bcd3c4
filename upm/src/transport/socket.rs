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

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use parking_lot::{Mutex, RwLock};
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::protocol::{encode_frame, FrameDecoder};
use super::{Inbound, InboundHandler, MessagePort, TransportEvent};
use crate::common::UpmError;
use crate::message::Envelope;

/// Bytes requested per `recvmsg` call.
const READ_CHUNK: usize = 64 * 1024;

/// Descriptors accepted per `recvmsg` call.
const MAX_FDS_PER_READ: usize = 8;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: MsgFlags = MsgFlags::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: MsgFlags = MsgFlags::empty();

/// Framing, descriptor passing and the reader task for one Unix socket.
///
/// [`ProcessPipe`](super::ProcessPipe) and [`MessagePort`] are thin wrappers
/// around this type.
pub(super) struct SocketCore {
    label: String,
    stream: RwLock<Option<Arc<UnixStream>>>,
    write_lock: tokio::sync::Mutex<()>,
    handler_attached: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    max_frame_size: usize,
}

impl SocketCore {
    pub(super) fn new(stream: UnixStream, label: String, max_frame_size: usize) -> Self {
        Self {
            label,
            stream: RwLock::new(Some(Arc::new(stream))),
            write_lock: tokio::sync::Mutex::new(()),
            handler_attached: AtomicBool::new(false),
            reader: Mutex::new(None),
            cancel: CancellationToken::new(),
            max_frame_size,
        }
    }

    pub(super) fn label(&self) -> &str {
        &self.label
    }

    pub(super) fn set_label(&mut self, label: String) {
        self.label = label;
    }

    pub(super) const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub(super) fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }

    pub(super) fn has_handler(&self) -> bool {
        self.handler_attached.load(Ordering::Acquire)
    }

    pub(super) fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.stream.read().is_none()
    }

    fn stream(&self) -> Result<Arc<UnixStream>, UpmError> {
        if self.cancel.is_cancelled() {
            return Err(UpmError::ChannelClosed);
        }
        self.stream.read().clone().ok_or(UpmError::ChannelClosed)
    }

    pub(super) async fn send(&self, envelope: &Envelope) -> Result<(), UpmError> {
        let stream = self.stream()?;
        let frame = encode_frame(envelope, false, self.max_frame_size)?;

        let _guard = self.write_lock.lock().await;
        write_all(&stream, &frame).await.map_err(|e| {
            debug!("{}: send failed: {}", self.label, e);
            UpmError::from(e)
        })?;
        trace!("{}: sent {} ({} bytes)", self.label, envelope.channel_name(), frame.len());
        Ok(())
    }

    pub(super) async fn send_with_port(
        &self,
        envelope: &Envelope,
        port: &MessagePort,
    ) -> Result<(), UpmError> {
        if port.core().has_handler() {
            return Err(UpmError::PortInUse);
        }
        let stream = self.stream()?;
        let port_stream = port.core().stream()?;
        let frame = encode_frame(envelope, true, self.max_frame_size)?;

        let _guard = self.write_lock.lock().await;
        let fds = [port_stream.as_raw_fd()];
        let sent = stream
            .async_io(Interest::WRITABLE, || {
                sendmsg::<()>(
                    stream.as_raw_fd(),
                    &[IoSlice::new(&frame)],
                    &[ControlMessage::ScmRights(&fds)],
                    MsgFlags::empty(),
                    None,
                )
                .map_err(io::Error::from)
            })
            .await?;

        if sent == 0 {
            return Err(UpmError::IoError("sendmsg wrote 0 bytes".to_string()));
        }
        // The descriptor rides on the first chunk only.
        write_all(&stream, &frame[sent..]).await?;
        trace!(
            "{}: sent {} with port {}",
            self.label,
            envelope.channel_name(),
            port.core().label()
        );
        Ok(())
    }

    #[cfg(test)]
    pub(super) async fn send_raw_for_test(&self, bytes: &[u8]) {
        let stream = self.stream().unwrap();
        let _guard = self.write_lock.lock().await;
        write_all(&stream, bytes).await.unwrap();
    }

    pub(super) fn on_message(&self, handler: InboundHandler) -> Result<(), UpmError> {
        let stream = self.stream()?;
        if self
            .handler_attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(UpmError::HandlerAlreadyAttached);
        }

        let task = tokio::spawn(read_loop(
            stream,
            handler,
            self.cancel.clone(),
            self.max_frame_size,
            self.label.clone(),
        ));
        *self.reader.lock() = Some(task);
        Ok(())
    }

    pub(super) fn close(&self) {
        if self.cancel.is_cancelled() && self.stream.read().is_none() {
            return;
        }
        self.cancel.cancel();
        // The reader holds its own clone and drops it when it observes the
        // cancellation. Writers in flight finish with theirs.
        if self.stream.write().take().is_some() {
            debug!("{}: closed", self.label);
        }
        // Detach without awaiting: close may be called from the reader itself.
        drop(self.reader.lock().take());
    }
}

impl Drop for SocketCore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for SocketCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketCore")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .field("handler_attached", &self.has_handler())
            .field("max_frame_size", &self.max_frame_size)
            .finish_non_exhaustive()
    }
}

async fn write_all(stream: &UnixStream, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        stream.writable().await?;
        match stream.try_write(bytes) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Read bytes and any descriptors passed alongside them.
async fn recv_with_fds(stream: &UnixStream, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    stream
        .async_io(Interest::READABLE, || {
            let mut iov = [IoSliceMut::new(&mut *buf)];
            let mut cmsg = nix::cmsg_space!([RawFd; MAX_FDS_PER_READ]);
            let msg = recvmsg::<()>(stream.as_raw_fd(), &mut iov, Some(&mut cmsg), RECV_FLAGS)
                .map_err(io::Error::from)?;

            let mut fds = Vec::new();
            for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                if let ControlMessageOwned::ScmRights(raw) = cmsg {
                    fds.extend(raw.into_iter().map(adopt_fd));
                }
            }
            Ok((msg.bytes, fds))
        })
        .await
}

#[allow(unsafe_code)]
fn adopt_fd(raw: RawFd) -> OwnedFd {
    // SAFETY: SCM_RIGHTS installs a fresh descriptor in this process that
    // nothing else owns; wrapping it immediately makes it closed on drop.
    unsafe { OwnedFd::from_raw_fd(raw) }
}

async fn read_loop(
    stream: Arc<UnixStream>,
    handler: InboundHandler,
    cancel: CancellationToken,
    max_frame_size: usize,
    label: String,
) {
    let mut decoder = FrameDecoder::new(max_frame_size);
    let mut received_fds: VecDeque<OwnedFd> = VecDeque::new();
    let mut buf = vec![0u8; READ_CHUNK];

    'read: loop {
        let read = tokio::select! {
            () = cancel.cancelled() => break 'read,
            read = recv_with_fds(&stream, &mut buf) => read,
        };

        let n = match read {
            Ok((0, _)) => {
                debug!("{label}: peer closed the connection");
                break 'read;
            }
            Ok((n, fds)) => {
                received_fds.extend(fds);
                n
            }
            Err(e) => {
                error!("{label}: read error: {e}");
                break 'read;
            }
        };
        decoder.push(&buf[..n]);

        loop {
            let frame = match decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    error!("{label}: {e}; dropping connection");
                    break 'read;
                }
            };

            let port = if frame.carries_port() {
                let port = received_fds
                    .pop_front()
                    .and_then(|fd| match MessagePort::from_owned_fd(fd, max_frame_size) {
                        Ok(port) => Some(port),
                        Err(e) => {
                            warn!("{label}: failed to adopt transferred port: {e}");
                            None
                        }
                    });
                if port.is_none() {
                    warn!("{label}: frame flagged with a port arrived without one");
                }
                port
            } else {
                None
            };

            match frame.envelope() {
                Ok(envelope) => {
                    trace!("{label}: received {}", envelope.channel_name());
                    handler(TransportEvent::Message(Inbound { envelope, port })).await;
                }
                Err(e) => warn!("{label}: dropping undecodable frame: {e}"),
            }

            if cancel.is_cancelled() {
                break 'read;
            }
        }
    }

    if !received_fds.is_empty() {
        warn!("{label}: releasing {} unclaimed descriptors", received_fds.len());
    }
    cancel.cancel();
    drop(stream);
    handler(TransportEvent::Closed).await;
}
