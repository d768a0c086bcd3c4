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

//! Consumer-side access to a service through a dedicated channel.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, instrument, trace, warn};

use crate::common::{Correlator, UpmConfig, UpmError};
use crate::message::{Envelope, Message, MessageKind, NewClient};
use crate::transport::{Inbound, InboundHandler, MessagePort, Transport, TransportEvent};

/// Capacity of the pushed-event broadcast buffer.
const EVENT_BUFFER: usize = 64;

/// Asks the host for a channel to one service and talks over it.
///
/// # Example
///
/// ```rust,ignore
/// let requester = ChannelRequester::new("telemetry", "consumer-1", UpmConfig::load());
/// requester.connect().await?;
///
/// let status: serde_json::Value = requester.execute_request("getStatus", &serde_json::json!({})).await?;
/// requester.close().await;
/// ```
#[derive(Debug)]
pub struct ChannelRequester {
    service_name: String,
    consumer_id: String,
    config: UpmConfig,
    correlator: Arc<Correlator>,
    port: RwLock<Option<Arc<MessagePort>>>,
    connect_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<Message>,
}

impl ChannelRequester {
    /// Create a requester for `(service_name, consumer_id)`. Not yet connected.
    pub fn new(
        service_name: impl Into<String>,
        consumer_id: impl Into<String>,
        config: UpmConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            service_name: service_name.into(),
            consumer_id: consumer_id.into(),
            config,
            correlator: Arc::new(Correlator::new()),
            port: RwLock::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            events,
        }
    }

    /// Service this requester talks to.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Consumer id the channel is registered under.
    #[must_use]
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Returns `true` while a delivered channel is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.port
            .read()
            .as_ref()
            .is_some_and(|port| !port.is_closed())
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Receive events the worker pushes over this channel.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<Message> {
        self.events.subscribe()
    }

    /// Request a channel from the host and wait until it is delivered.
    ///
    /// Does nothing if already connected.
    #[instrument(skip(self), fields(service = %self.service_name, consumer = %self.consumer_id))]
    pub async fn connect(&self) -> Result<(), UpmError> {
        let _connecting = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let max_frame_size = self.config.limits.max_frame_size;
        let link = MessagePort::connect(self.config.host_link_path())
            .await?
            .with_max_frame_size(max_frame_size);

        let (tx, rx) = oneshot::channel();
        link.on_message(self.delivery_handler(tx))?;
        link.send(&Envelope::NewClient(NewClient::new(
            self.consumer_id.clone(),
            Some(self.service_name.clone()),
        )))
        .await?;

        let timeout = self.config.connect_timeout();
        let delivered = tokio::time::timeout(timeout, rx).await;
        link.close().await;

        let port = match delivered {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(UpmError::ConnectionClosed),
            Err(_) => {
                #[allow(clippy::cast_possible_truncation)]
                let timeout_ms = timeout.as_millis() as u64;
                return Err(UpmError::ConnectTimeout {
                    service: self.service_name.clone(),
                    timeout_ms,
                });
            }
        };

        let port = Arc::new(
            port.with_label(format!("channel:{}:{}", self.service_name, self.consumer_id))
                .with_max_frame_size(max_frame_size),
        );
        port.on_message(self.channel_handler())?;
        *self.port.write() = Some(port);
        info!(
            "Connected to '{}' as '{}'",
            self.service_name, self.consumer_id
        );
        Ok(())
    }

    /// Send a request over the channel using the configured timeout.
    pub async fn execute_request<T, R>(&self, message_type: &str, data: &T) -> Result<R, UpmError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.execute_request_with_timeout(message_type, data, self.config.request_timeout())
            .await
    }

    /// Send a request over the channel with an explicit timeout.
    pub async fn execute_request_with_timeout<T, R>(
        &self,
        message_type: &str,
        data: &T,
        timeout: Duration,
    ) -> Result<R, UpmError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let port = self.port()?;
        let data = serde_json::to_value(data)?;

        let message_id = self.correlator.next_message_id();
        let pending = self.correlator.register(message_id, timeout);
        let request = Message::request(message_id, message_type, data);
        if let Err(e) = port.send(&Envelope::service(request)).await {
            self.correlator.forget(message_id);
            return Err(e);
        }
        trace!("Sent request {} '{}'", message_id, message_type);

        let value = pending.wait().await?;
        serde_json::from_value(value).map_err(UpmError::from)
    }

    /// Fire-and-forget event over the channel.
    pub async fn send_event<T>(&self, data: &T) -> Result<(), UpmError>
    where
        T: Serialize + ?Sized,
    {
        let port = self.port()?;
        let data = serde_json::to_value(data)?;
        let message_id = self.correlator.next_message_id();
        port.send(&Envelope::service(Message::event(message_id, data)))
            .await
    }

    /// Reject pending requests and release the local half of the channel.
    ///
    /// The host is not notified.
    pub async fn close(&self) {
        let port = self.port.write().take();
        self.correlator
            .cancel_all(UpmError::RemovedBeforeSettled);
        if let Some(port) = port {
            port.close().await;
            debug!("Closed channel to '{}'", self.service_name);
        }
    }

    fn port(&self) -> Result<Arc<MessagePort>, UpmError> {
        self.port
            .read()
            .clone()
            .filter(|port| !port.is_closed())
            .ok_or(UpmError::ChannelClosed)
    }

    /// Resolves `tx` with the first delivery or refusal addressed to us.
    fn delivery_handler(
        &self,
        tx: oneshot::Sender<Result<MessagePort, UpmError>>,
    ) -> InboundHandler {
        let tx = Arc::new(Mutex::new(Some(tx)));
        let service_name = self.service_name.clone();
        let consumer_id = self.consumer_id.clone();

        Arc::new(move |event| {
            let outcome = match event {
                TransportEvent::Message(Inbound {
                    envelope: Envelope::NewClient(delivery),
                    port,
                }) if delivery.consumer_id == consumer_id
                    && delivery.service_name.as_deref() == Some(service_name.as_str()) =>
                {
                    Some(port.ok_or(UpmError::NoTransferredPort))
                }
                TransportEvent::Message(Inbound {
                    envelope: Envelope::ChannelRefused(refusal),
                    ..
                }) if refusal.consumer_id == consumer_id
                    && refusal.service_name == service_name =>
                {
                    Some(Err(UpmError::ChannelRefused(refusal.reason)))
                }
                TransportEvent::Message(inbound) => {
                    debug!(
                        "Ignoring {} on host link",
                        inbound.envelope.channel_name()
                    );
                    None
                }
                TransportEvent::Closed => Some(Err(UpmError::ConnectionClosed)),
            };

            if let Some(outcome) = outcome {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(outcome);
                }
            }
            async {}.boxed()
        })
    }

    fn channel_handler(&self) -> InboundHandler {
        let correlator = Arc::clone(&self.correlator);
        let events = self.events.clone();
        let service_name = self.service_name.clone();

        Arc::new(move |event| {
            match event {
                TransportEvent::Message(Inbound {
                    envelope: Envelope::ServiceMessage(message),
                    ..
                }) => match message.kind {
                    MessageKind::Response => {
                        correlator.settle(message);
                    }
                    MessageKind::Event => {
                        trace!("Event {} from '{}'", message.message_id, service_name);
                        let _ = events.send(message);
                    }
                    MessageKind::Request => warn!(
                        "Dropping request {} from '{}': consumers do not serve requests",
                        message.message_id, service_name
                    ),
                },
                TransportEvent::Message(inbound) => warn!(
                    "Protocol error: unexpected {} on channel to '{}'",
                    inbound.envelope.channel_name(),
                    service_name
                ),
                TransportEvent::Closed => {
                    let rejected = correlator.cancel_all(|_| UpmError::ConnectionClosed);
                    info!(
                        "Channel to '{}' closed ({} pending requests rejected)",
                        service_name, rejected
                    );
                }
            }
            async {}.boxed()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &tempfile::TempDir) -> UpmConfig {
        let mut config = UpmConfig::default();
        config.host_link.path = Some(dir.path().join("host.sock"));
        config.timeouts.connect = 500;
        config
    }

    #[tokio::test]
    async fn test_requests_fail_before_connect() {
        let requester = ChannelRequester::new("telemetry", "consumer-1", UpmConfig::default());
        assert!(!requester.is_connected());

        let result: Result<serde_json::Value, _> = requester
            .execute_request("getStatus", &serde_json::json!({}))
            .await;
        assert_eq!(result, Err(UpmError::ChannelClosed));
        assert_eq!(
            requester.send_event(&serde_json::json!(1)).await,
            Err(UpmError::ChannelClosed)
        );
    }

    #[tokio::test]
    async fn test_connect_without_host_fails() {
        let dir = tempfile::tempdir().unwrap();
        let requester = ChannelRequester::new("telemetry", "consumer-1", config_in(&dir));
        assert!(matches!(
            requester.connect().await,
            Err(UpmError::IoError(_))
        ));
    }

    #[tokio::test]
    async fn test_delivery_without_port_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        let listener = tokio::net::UnixListener::bind(config.host_link_path()).unwrap();

        // A host that answers with a NewClient but transfers nothing.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let link = MessagePort::from_stream(stream, "fake-host", usize::MAX);
            link.send(&Envelope::NewClient(NewClient::new(
                "consumer-1".to_string(),
                Some("telemetry".to_string()),
            )))
            .await
            .unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let requester = ChannelRequester::new("telemetry", "consumer-1", config);
        assert_eq!(requester.connect().await, Err(UpmError::NoTransferredPort));
        assert!(!requester.is_connected());
    }

    #[tokio::test]
    async fn test_silent_host_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        let listener = tokio::net::UnixListener::bind(config.host_link_path()).unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let requester = ChannelRequester::new("telemetry", "consumer-1", config);
        assert!(matches!(
            requester.connect().await,
            Err(UpmError::ConnectTimeout { timeout_ms: 500, .. })
        ));
    }
}
