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

//! Host link: hands channels to consumer processes.
//!
//! Consumers connect to a Unix socket and send `NewClient { serviceName,
//! consumerId }`. The broker creates the channel on the named service and
//! transfers the consumer half back over the same connection, or answers
//! with `ChannelRefused`.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::registry::ServiceRegistry;
use crate::common::{UpmConfig, UpmError};
use crate::message::{ChannelRefusal, Envelope, NewClient};
use crate::transport::{InboundHandler, MessagePort, Transport, TransportEvent};

/// Counters kept by a running broker.
#[derive(Debug, Default)]
pub struct ChannelBrokerStats {
    /// Consumer links accepted since start.
    pub links_accepted: AtomicUsize,
    /// Consumer links still open.
    pub links_active: AtomicUsize,
    /// Channels transferred to consumers.
    pub channels_delivered: AtomicUsize,
    /// Channel requests answered with `ChannelRefused`.
    pub channels_refused: AtomicUsize,
    /// Accept failures, rejected links and unexpected envelopes.
    pub errors: AtomicUsize,
}

impl ChannelBrokerStats {
    /// Zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn links_accepted(&self) -> usize {
        self.links_accepted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn links_active(&self) -> usize {
        self.links_active.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn channels_delivered(&self) -> usize {
        self.channels_delivered.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn channels_refused(&self) -> usize {
        self.channels_refused.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Returned by [`run`]; stops the broker and exposes its counters.
#[derive(Debug)]
pub struct ChannelBrokerHandle {
    /// Live counters, shared with the accept loop.
    pub stats: Arc<ChannelBrokerStats>,
    cancel_token: CancellationToken,
}

impl ChannelBrokerHandle {
    /// Stop accepting consumers and drop open links. The socket file is
    /// removed once the accept loop exits.
    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    /// Returns `true` once [`ChannelBrokerHandle::stop`] was called or the
    /// token passed to [`run`] fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Bind the host link and start handing channels to consumers.
///
/// Fails with [`UpmError::ProtocolError`] if a broker already answers on
/// the configured path; a socket file nobody answers on is replaced. The
/// socket file is removed when `cancel_token` fires.
pub async fn run(
    config: UpmConfig,
    registry: ServiceRegistry,
    cancel_token: CancellationToken,
) -> Result<ChannelBrokerHandle, UpmError> {
    let socket_path = config.host_link_path();
    let listener = bind_host_link(&socket_path, config.host_link.mode).await?;
    info!("Host link open at {}", socket_path.display());

    let stats = Arc::new(ChannelBrokerStats::new());
    let broker = Broker {
        max_frame_size: config.limits.max_frame_size,
        max_links: config.limits.max_links,
        links: Arc::new(Semaphore::new(config.limits.max_links)),
        registry,
        stats: Arc::clone(&stats),
        cancel_token: cancel_token.clone(),
    };

    tokio::spawn(async move {
        broker.accept_links(listener).await;
        match tokio::fs::remove_file(&socket_path).await {
            Ok(()) => debug!("Removed host link {}", socket_path.display()),
            Err(e) => warn!("Could not remove host link {}: {}", socket_path.display(), e),
        }
        info!("Host link closed");
    });

    Ok(ChannelBrokerHandle {
        stats,
        cancel_token,
    })
}

async fn bind_host_link(path: &Path, mode: u32) -> Result<UnixListener, UpmError> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            UpmError::IoError(format!("host link directory {}: {e}", dir.display()))
        })?;
    }

    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            return Err(UpmError::ProtocolError(format!(
                "a channel broker is already serving {}",
                path.display()
            )));
        }
        warn!("Replacing abandoned host link {}", path.display());
        tokio::fs::remove_file(path).await.map_err(|e| {
            UpmError::IoError(format!("abandoned host link {}: {e}", path.display()))
        })?;
    }

    let listener = UnixListener::bind(path)
        .map_err(|e| UpmError::IoError(format!("bind host link {}: {e}", path.display())))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
        UpmError::IoError(format!("host link mode {:o} on {}: {e}", mode, path.display()))
    })?;
    Ok(listener)
}

/// State shared by the accept loop and every link task.
struct Broker {
    max_frame_size: usize,
    max_links: usize,
    links: Arc<Semaphore>,
    registry: ServiceRegistry,
    stats: Arc<ChannelBrokerStats>,
    cancel_token: CancellationToken,
}

impl Broker {
    async fn accept_links(&self, listener: UnixListener) {
        loop {
            let accepted = tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let stream = match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!("Host link accept failed: {}", e);
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            let Ok(permit) = Arc::clone(&self.links).try_acquire_owned() else {
                warn!("Dropping consumer link: all {} slots in use", self.max_links);
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            let link_id = self.stats.links_accepted.fetch_add(1, Ordering::Relaxed) + 1;
            self.stats.links_active.fetch_add(1, Ordering::Relaxed);
            trace!("Consumer link #{} accepted", link_id);

            let link =
                MessagePort::from_stream(stream, format!("link#{link_id}"), self.max_frame_size);
            let registry = self.registry.clone();
            let cancel_token = self.cancel_token.clone();
            let stats = Arc::clone(&self.stats);
            tokio::spawn(async move {
                handle_link(link, link_id, registry, cancel_token, &stats).await;
                stats.links_active.fetch_sub(1, Ordering::Relaxed);
                drop(permit);
            });
        }
        debug!("Host link accept loop stopped");
    }
}

/// Serve one consumer link until it closes.
async fn handle_link(
    link: MessagePort,
    link_id: usize,
    registry: ServiceRegistry,
    cancel_token: CancellationToken,
    stats: &ChannelBrokerStats,
) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler: InboundHandler = Arc::new(move |event| {
        let _ = tx.send(event);
        async {}.boxed()
    });
    if let Err(e) = link.on_message(handler) {
        error!("Link #{} could not be attached: {}", link_id, e);
        stats.errors.fetch_add(1, Ordering::Relaxed);
        return;
    }

    loop {
        let event = tokio::select! {
            biased;

            () = cancel_token.cancelled() => {
                trace!("Link #{} dropped: broker stopping", link_id);
                break;
            }

            event = rx.recv() => event,
        };

        match event {
            Some(TransportEvent::Message(inbound)) => match inbound.envelope {
                Envelope::NewClient(request) => {
                    serve_channel_request(&link, link_id, &registry, request, stats).await;
                }
                other => {
                    warn!(
                        "Link #{} sent unexpected {} envelope",
                        link_id,
                        other.channel_name()
                    );
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                }
            },
            Some(TransportEvent::Closed) | None => {
                debug!("Link #{} closed by consumer", link_id);
                break;
            }
        }
    }

    link.close().await;
    trace!("Link #{} done", link_id);
}

async fn serve_channel_request(
    link: &MessagePort,
    link_id: usize,
    registry: &ServiceRegistry,
    request: NewClient,
    stats: &ChannelBrokerStats,
) {
    let consumer_id = request.consumer_id;
    let service_name = request.service_name.unwrap_or_default();
    debug!(
        "Link #{} requests channel '{}' on '{}'",
        link_id, consumer_id, service_name
    );

    let delivered = match registry.get(&service_name) {
        Some(client) => match client.create_channel(&consumer_id).await {
            Ok(_) => client.hand_off_channel(&consumer_id, link).await,
            Err(e) => Err(e),
        },
        None => Err(UpmError::UnknownService(service_name.clone())),
    };

    match delivered {
        Ok(()) => {
            stats.channels_delivered.fetch_add(1, Ordering::Relaxed);
            info!(
                "Delivered channel '{}' on '{}' over link #{}",
                consumer_id, service_name, link_id
            );
        }
        Err(e) => {
            stats.channels_refused.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Refusing channel '{}' on '{}': {}",
                consumer_id, service_name, e
            );
            let refusal = Envelope::ChannelRefused(ChannelRefusal::new(
                service_name,
                consumer_id,
                e.to_string(),
            ));
            if let Err(e) = link.send(&refusal).await {
                error!("Link #{} failed to send refusal: {}", link_id, e);
                stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config_in(dir: &tempfile::TempDir) -> UpmConfig {
        let mut config = UpmConfig::default();
        config.host_link.path = Some(dir.path().join("host.sock"));
        config
    }

    #[tokio::test]
    async fn test_unknown_service_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        let cancel = CancellationToken::new();
        let handle = run(config.clone(), ServiceRegistry::new(config.clone()), cancel.clone())
            .await
            .unwrap();

        let link = MessagePort::connect(config.host_link_path()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        link.on_message(Arc::new(move |event| {
            let _ = tx.send(event);
            async {}.boxed()
        }))
        .unwrap();

        link.send(&Envelope::NewClient(NewClient::new(
            "consumer-1".to_string(),
            Some("missing".to_string()),
        )))
        .await
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        let Some(TransportEvent::Message(inbound)) = event else {
            panic!("expected a refusal");
        };
        let Envelope::ChannelRefused(refusal) = inbound.envelope else {
            panic!("expected ChannelRefused");
        };
        assert_eq!(refusal.consumer_id, "consumer-1");
        assert!(refusal.reason.contains("Unknown service"));
        assert!(inbound.port.is_none());

        assert_eq!(handle.stats.channels_refused(), 1);
        handle.stop();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_second_broker_on_same_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        let registry = ServiceRegistry::new(config.clone());

        let first = run(config.clone(), registry.clone(), CancellationToken::new())
            .await
            .unwrap();
        let second = run(config, registry, CancellationToken::new()).await;

        assert!(matches!(second, Err(UpmError::ProtocolError(_))));
        first.stop();
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        let path = config.host_link_path();
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let handle = run(config.clone(), ServiceRegistry::new(config), CancellationToken::new())
            .await
            .unwrap();
        assert!(MessagePort::connect(&path).await.is_ok());
        handle.stop();
    }

    #[tokio::test]
    async fn test_stop_removes_host_link() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(&dir);
        config.host_link.mode = 0o600;
        let path = config.host_link_path();

        let handle = run(config.clone(), ServiceRegistry::new(config), CancellationToken::new())
            .await
            .unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        handle.stop();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while path.exists() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!path.exists());
    }
}
