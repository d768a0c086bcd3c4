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

//! Worker-side demultiplexer for inbound envelopes.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::common::UpmError;
use crate::message::{Envelope, Message, MessageKind};
use crate::transport::{Inbound, InboundHandler, MessagePort, Transport, TransportEvent};

/// Type alias for a stored request handler.
///
/// Handlers receive the request context and payload and produce the response
/// payload. An error is sent back as the response's `error` string.
pub type RequestHandler =
    Arc<dyn Fn(RequestContext, Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Type alias for a stored event handler.
pub type EventHandler =
    Arc<dyn Fn(EventContext, Value) -> BoxFuture<'static, EventDisposition> + Send + Sync>;

/// What an event handler did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    /// The event was consumed; later handlers are skipped.
    Handled,
    /// Pass the event on to the next handler.
    NotHandled,
}

/// Identifies a registered event handler for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandlerId(u64);

/// Context passed to request handlers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Logical type of the request.
    pub message_type: String,
    /// Correlation id of the request.
    pub message_id: u64,
    /// Channel the request arrived on; `None` for the process pipe.
    pub consumer_id: Option<String>,
}

/// Context passed to event handlers.
#[derive(Clone)]
pub struct EventContext {
    /// Channel the event arrived on; `None` for the process pipe.
    pub consumer_id: Option<String>,
    /// Transport the event arrived on, for handlers that answer with events.
    pub transport: Arc<dyn Transport>,
    /// Id the sender gave the event.
    pub message_id: u64,
}

impl fmt::Debug for EventContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventContext")
            .field("consumer_id", &self.consumer_id)
            .field("transport", &self.transport.label())
            .field("message_id", &self.message_id)
            .finish()
    }
}

/// Counters for a [`WorkerRouter`].
#[derive(Debug, Default)]
pub struct RouterStats {
    /// Requests received.
    pub requests: AtomicUsize,
    /// Requests answered with an error.
    pub request_errors: AtomicUsize,
    /// Events received.
    pub events: AtomicUsize,
    /// Events no handler claimed.
    pub events_unhandled: AtomicUsize,
    /// Frames dropped as protocol errors.
    pub protocol_errors: AtomicUsize,
    /// Frames dropped because their channel is not registered.
    pub routing_errors: AtomicUsize,
}

impl RouterStats {
    /// Get the number of requests received.
    #[must_use]
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    /// Get the number of failed requests.
    #[must_use]
    pub fn request_errors(&self) -> usize {
        self.request_errors.load(Ordering::Relaxed)
    }

    /// Get the number of events received.
    #[must_use]
    pub fn events(&self) -> usize {
        self.events.load(Ordering::Relaxed)
    }

    /// Get the number of unhandled events.
    #[must_use]
    pub fn events_unhandled(&self) -> usize {
        self.events_unhandled.load(Ordering::Relaxed)
    }

    /// Get the number of protocol errors.
    #[must_use]
    pub fn protocol_errors(&self) -> usize {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    /// Get the number of routing errors.
    #[must_use]
    pub fn routing_errors(&self) -> usize {
        self.routing_errors.load(Ordering::Relaxed)
    }
}

/// Routes inbound envelopes to request and event handlers.
///
/// One router serves the process pipe and every channel registered through
/// a `NewClient` envelope. Requests are looked up by type and answered on
/// the transport they arrived on. Events go through the event handlers in
/// registration order until one returns [`EventDisposition::Handled`].
///
/// # Example
///
/// ```rust,ignore
/// router.add_request_handler("getStatus", |_ctx, _data| async move {
///     Ok(serde_json::json!({ "ok": true }))
/// });
///
/// router.add_event_handler(|ctx, data| async move {
///     tracing::info!("event from {:?}: {}", ctx.consumer_id, data);
///     EventDisposition::NotHandled
/// });
/// ```
#[derive(Clone, Default)]
pub struct WorkerRouter {
    inner: Arc<RouterInner>,
}

#[derive(Default)]
struct RouterInner {
    request_handlers: DashMap<String, RequestHandler>,
    event_handlers: RwLock<Vec<(EventHandlerId, EventHandler)>>,
    next_handler_id: AtomicU64,
    channels: DashMap<String, Arc<MessagePort>>,
    stats: RouterStats,
}

impl WorkerRouter {
    /// Create a router with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `message_type`, replacing any existing one.
    pub fn add_request_handler<F, Fut>(&self, message_type: impl Into<String>, handler: F)
    where
        F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let message_type = message_type.into();
        let handler: RequestHandler = Arc::new(move |ctx, data| handler(ctx, data).boxed());
        if self
            .inner
            .request_handlers
            .insert(message_type.clone(), handler)
            .is_some()
        {
            debug!("Replaced request handler for '{}'", message_type);
        } else {
            debug!("Registered request handler for '{}'", message_type);
        }
    }

    /// Remove the handler for `message_type`.
    pub fn remove_request_handler(&self, message_type: &str) -> bool {
        self.inner.request_handlers.remove(message_type).is_some()
    }

    /// Returns `true` if a handler is registered for `message_type`.
    #[must_use]
    pub fn has_request_handler(&self, message_type: &str) -> bool {
        self.inner.request_handlers.contains_key(message_type)
    }

    /// Append an event handler to the end of the chain.
    pub fn add_event_handler<F, Fut>(&self, handler: F) -> EventHandlerId
    where
        F: Fn(EventContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EventDisposition> + Send + 'static,
    {
        let id = EventHandlerId(self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed));
        let handler: EventHandler = Arc::new(move |ctx, data| handler(ctx, data).boxed());
        self.inner.event_handlers.write().push((id, handler));
        id
    }

    /// Remove an event handler. Returns `false` if it was not registered.
    pub fn remove_event_handler(&self, id: EventHandlerId) -> bool {
        let mut handlers = self.inner.event_handlers.write();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    /// Number of registered event handlers.
    #[must_use]
    pub fn event_handler_count(&self) -> usize {
        self.inner.event_handlers.read().len()
    }

    /// Consumer ids with a registered channel.
    #[must_use]
    pub fn channel_ids(&self) -> Vec<String> {
        self.inner
            .channels
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Router counters.
    #[must_use]
    pub fn stats(&self) -> &RouterStats {
        &self.inner.stats
    }

    /// Attach this router as the dispatcher of `transport`.
    ///
    /// `consumer_id` names the channel the transport belongs to, or `None`
    /// for the process pipe.
    pub fn attach(
        &self,
        transport: Arc<dyn Transport>,
        consumer_id: Option<String>,
    ) -> Result<(), UpmError> {
        self.inner.attach(&transport, consumer_id)
    }

    /// Build the dispatcher [`WorkerRouter::attach`] installs, for callers
    /// that wrap it.
    pub(crate) fn dispatcher(
        &self,
        transport: &Arc<dyn Transport>,
        consumer_id: Option<String>,
    ) -> InboundHandler {
        RouterInner::dispatcher(
            Arc::downgrade(&self.inner),
            Arc::downgrade(transport),
            consumer_id,
        )
    }

    /// Close and unregister every channel.
    pub async fn close_channels(&self) {
        let ports: Vec<Arc<MessagePort>> = self
            .inner
            .channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.inner.channels.clear();
        for port in ports {
            port.close().await;
        }
    }
}

impl fmt::Debug for WorkerRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRouter")
            .field("request_handlers", &self.inner.request_handlers.len())
            .field("event_handlers", &self.event_handler_count())
            .field("channels", &self.inner.channels.len())
            .finish()
    }
}

impl RouterInner {
    fn attach(
        self: &Arc<Self>,
        transport: &Arc<dyn Transport>,
        consumer_id: Option<String>,
    ) -> Result<(), UpmError> {
        let handler = Self::dispatcher(Arc::downgrade(self), Arc::downgrade(transport), consumer_id);
        transport.on_message(handler)
    }

    fn dispatcher(
        router: Weak<Self>,
        transport: Weak<dyn Transport>,
        consumer_id: Option<String>,
    ) -> InboundHandler {
        Arc::new(move |event| {
            let router = router.clone();
            let transport = transport.clone();
            let consumer_id = consumer_id.clone();
            async move {
                let Some(router) = router.upgrade() else {
                    return;
                };
                match event {
                    TransportEvent::Message(inbound) => {
                        let Some(transport) = transport.upgrade() else {
                            return;
                        };
                        router.dispatch(inbound, transport, consumer_id).await;
                    }
                    TransportEvent::Closed => {
                        if let Some(id) = consumer_id {
                            if router
                                .channels
                                .remove_if(&id, |_, port| port.is_closed())
                                .is_some()
                            {
                                debug!("Channel for '{}' closed", id);
                            }
                        }
                    }
                }
            }
            .boxed()
        })
    }

    async fn dispatch(
        self: Arc<Self>,
        inbound: Inbound,
        transport: Arc<dyn Transport>,
        consumer_id: Option<String>,
    ) {
        let Inbound { envelope, port } = inbound;
        match envelope {
            Envelope::NewClient(client) => match port {
                Some(port) => self.register_channel(client.consumer_id, port).await,
                None => {
                    self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Protocol error: NewClient for '{}' arrived without a port",
                        client.consumer_id
                    );
                }
            },
            Envelope::ServiceMessage(message) => {
                if port.is_some() {
                    warn!("Dropping unexpected port on {}", transport.label());
                }
                if let Some(id) = &consumer_id {
                    if !self.channels.contains_key(id) {
                        self.stats.routing_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "Routing error: message {} for unregistered channel '{}'",
                            message.message_id, id
                        );
                        return;
                    }
                }
                match message.kind {
                    MessageKind::Request => self.handle_request(message, transport, consumer_id),
                    MessageKind::Event => self.handle_event(message, transport, consumer_id).await,
                    MessageKind::Response => {
                        self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "Protocol error: unexpected response {} on {}",
                            message.message_id,
                            transport.label()
                        );
                    }
                }
            }
            other => {
                self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Protocol error: unexpected {} envelope on {}",
                    other.channel_name(),
                    transport.label()
                );
            }
        }
    }

    async fn register_channel(self: &Arc<Self>, consumer_id: String, port: MessagePort) {
        let port = Arc::new(port.with_label(format!("channel:{consumer_id}")));
        if let Some(previous) = self.channels.insert(consumer_id.clone(), Arc::clone(&port)) {
            warn!("Replacing channel for '{}'", consumer_id);
            previous.close().await;
        }

        let transport: Arc<dyn Transport> = port;
        match self.attach(&transport, Some(consumer_id.clone())) {
            Ok(()) => info!("Registered channel for '{}'", consumer_id),
            Err(e) => {
                self.channels.remove(&consumer_id);
                warn!("Failed to attach channel for '{}': {}", consumer_id, e);
            }
        }
    }

    fn handle_request(
        self: &Arc<Self>,
        message: Message,
        transport: Arc<dyn Transport>,
        consumer_id: Option<String>,
    ) {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let message_type = message.type_name().to_string();
        let handler = self
            .request_handlers
            .get(&message_type)
            .map(|handler| Arc::clone(&handler));

        let Some(handler) = handler else {
            self.stats.request_errors.fetch_add(1, Ordering::Relaxed);
            info!("No request handler for '{}'", message_type);
            let reply = Message::error_response(
                &message,
                format!("unknown type '{message_type}': no request handler registered"),
            );
            tokio::spawn(async move { send_reply(&*transport, reply).await });
            return;
        };

        let ctx = RequestContext {
            message_type,
            message_id: message.message_id,
            consumer_id,
        };
        let data = message.data.clone();
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let reply = match handler(ctx, data).await {
                Ok(result) => Message::response(&message, result),
                Err(e) => {
                    router.stats.request_errors.fetch_add(1, Ordering::Relaxed);
                    debug!("Request {} failed: {:#}", message.message_id, e);
                    Message::error_response(&message, format!("{e:#}"))
                }
            };
            send_reply(&*transport, reply).await;
        });
    }

    async fn handle_event(
        &self,
        message: Message,
        transport: Arc<dyn Transport>,
        consumer_id: Option<String>,
    ) {
        self.stats.events.fetch_add(1, Ordering::Relaxed);
        let handlers: Vec<(EventHandlerId, EventHandler)> = self.event_handlers.read().clone();

        for (id, handler) in handlers {
            let ctx = EventContext {
                consumer_id: consumer_id.clone(),
                transport: Arc::clone(&transport),
                message_id: message.message_id,
            };
            if handler(ctx, message.data.clone()).await == EventDisposition::Handled {
                trace!("Event {} handled by {:?}", message.message_id, id);
                return;
            }
        }

        self.stats.events_unhandled.fetch_add(1, Ordering::Relaxed);
        info!(
            "Unhandled event {} on {}",
            message.message_id,
            transport.label()
        );
    }
}

async fn send_reply(transport: &dyn Transport, reply: Message) {
    let message_id = reply.message_id;
    if let Err(e) = transport.send(&Envelope::service(reply)).await {
        warn!(
            "Failed to send response {} on {}: {}",
            message_id,
            transport.label(),
            e
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::message::NewClient;

    struct Harness {
        router: WorkerRouter,
        host: MessagePort,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
        _worker: Arc<dyn Transport>,
    }

    fn collector() -> (InboundHandler, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: InboundHandler = Arc::new(move |event| {
            let _ = tx.send(event);
            async {}.boxed()
        });
        (handler, rx)
    }

    fn harness() -> Harness {
        let (host, worker) = MessagePort::pair().unwrap();
        let worker: Arc<dyn Transport> = Arc::new(worker);
        let router = WorkerRouter::new();
        router.attach(Arc::clone(&worker), None).unwrap();

        let (handler, inbound) = collector();
        host.on_message(handler).unwrap();
        Harness {
            router,
            host,
            inbound,
            _worker: worker,
        }
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Message {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(TransportEvent::Message(Inbound {
                envelope: Envelope::ServiceMessage(message),
                ..
            }))) => message,
            other => panic!("expected a service message, got {other:?}"),
        }
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_request_is_answered_on_same_transport() {
        let mut h = harness();
        h.router.add_request_handler("getStatus", |ctx, _data| async move {
            Ok(serde_json::json!({ "ok": true, "id": ctx.message_id }))
        });

        h.host
            .send(&Envelope::service(Message::request(5, "getStatus", Value::Null)))
            .await
            .unwrap();

        let reply = next_message(&mut h.inbound).await;
        assert_eq!(reply.kind, MessageKind::Response);
        assert_eq!(reply.message_id, 5);
        assert_eq!(reply.data, serde_json::json!({ "ok": true, "id": 5 }));
        assert!(reply.error.is_none());
    }

    #[tokio::test]
    async fn test_unknown_type_replies_with_error() {
        let mut h = harness();
        h.host
            .send(&Envelope::service(Message::request(1, "nonexistent", Value::Null)))
            .await
            .unwrap();

        let reply = next_message(&mut h.inbound).await;
        assert!(reply.error.unwrap().contains("unknown type"));
        assert_eq!(h.router.stats().request_errors(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_response_error() {
        let mut h = harness();
        h.router.add_request_handler("save", |_ctx, _data| async move {
            Err(anyhow::anyhow!("disk full"))
        });

        h.host
            .send(&Envelope::service(Message::request(2, "save", Value::Null)))
            .await
            .unwrap();

        let reply = next_message(&mut h.inbound).await;
        assert_eq!(reply.error.as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn test_handler_overwrite_and_removal() {
        let mut h = harness();
        h.router
            .add_request_handler("v", |_ctx, _data| async move { Ok(serde_json::json!(1)) });
        h.router
            .add_request_handler("v", |_ctx, _data| async move { Ok(serde_json::json!(2)) });

        h.host
            .send(&Envelope::service(Message::request(1, "v", Value::Null)))
            .await
            .unwrap();
        assert_eq!(next_message(&mut h.inbound).await.data, serde_json::json!(2));

        assert!(h.router.remove_request_handler("v"));
        assert!(!h.router.has_request_handler("v"));
    }

    #[tokio::test]
    async fn test_first_responder_wins() {
        let h = harness();
        let calls = Arc::new(DashMap::<&'static str, usize>::new());

        for (name, disposition) in [
            ("h1", EventDisposition::NotHandled),
            ("h2", EventDisposition::Handled),
            ("h3", EventDisposition::Handled),
        ] {
            let calls = Arc::clone(&calls);
            h.router.add_event_handler(move |_ctx, _data| {
                *calls.entry(name).or_insert(0) += 1;
                async move { disposition }
            });
        }

        h.host
            .send(&Envelope::service(Message::event(1, serde_json::json!("ping"))))
            .await
            .unwrap();

        let router = h.router.clone();
        eventually(move || router.stats().events() == 1).await;
        let calls_check = Arc::clone(&calls);
        eventually(move || calls_check.get("h2").is_some()).await;

        assert_eq!(calls.get("h1").map(|c| *c), Some(1));
        assert_eq!(calls.get("h2").map(|c| *c), Some(1));
        assert!(calls.get("h3").is_none());
        assert_eq!(h.router.stats().events_unhandled(), 0);
    }

    #[tokio::test]
    async fn test_unhandled_event_is_not_an_error() {
        let h = harness();
        let id = h
            .router
            .add_event_handler(|_ctx, _data| async move { EventDisposition::NotHandled });

        h.host
            .send(&Envelope::service(Message::event(1, Value::Null)))
            .await
            .unwrap();

        let router = h.router.clone();
        eventually(move || router.stats().events_unhandled() == 1).await;
        assert!(h.router.remove_event_handler(id));
        assert!(!h.router.remove_event_handler(id));
        assert_eq!(h.router.event_handler_count(), 0);
    }

    #[tokio::test]
    async fn test_new_client_registers_channel() {
        let h = harness();
        h.router
            .add_request_handler("echo", |_ctx, data| async move { Ok(data) });

        let (consumer_half, worker_half) = MessagePort::pair().unwrap();
        h.host
            .send_with_port(
                &Envelope::NewClient(NewClient::new("consumer-1".to_string(), None)),
                &worker_half,
            )
            .await
            .unwrap();
        worker_half.close().await;

        let router = h.router.clone();
        eventually(move || router.channel_ids() == vec!["consumer-1".to_string()]).await;

        let (handler, mut rx) = collector();
        consumer_half.on_message(handler).unwrap();
        consumer_half
            .send(&Envelope::service(Message::request(
                9,
                "echo",
                serde_json::json!("over the channel"),
            )))
            .await
            .unwrap();

        let reply = next_message(&mut rx).await;
        assert_eq!(reply.message_id, 9);
        assert_eq!(reply.data, serde_json::json!("over the channel"));
    }

    #[tokio::test]
    async fn test_new_client_without_port_is_protocol_error() {
        let h = harness();
        h.host
            .send(&Envelope::NewClient(NewClient::new("consumer-1".to_string(), None)))
            .await
            .unwrap();

        let router = h.router.clone();
        eventually(move || router.stats().protocol_errors() == 1).await;
        assert!(h.router.channel_ids().is_empty());
        assert!(!h.host.is_closed());
    }

    #[tokio::test]
    async fn test_unregistered_channel_traffic_is_dropped() {
        let h = harness();
        h.router
            .add_request_handler("echo", |_ctx, data| async move { Ok(data) });

        let (ghost_host, ghost_worker) = MessagePort::pair().unwrap();
        let ghost_worker: Arc<dyn Transport> = Arc::new(ghost_worker);
        h.router
            .attach(Arc::clone(&ghost_worker), Some("ghost".to_string()))
            .unwrap();

        ghost_host
            .send(&Envelope::service(Message::request(1, "echo", Value::Null)))
            .await
            .unwrap();

        let router = h.router.clone();
        eventually(move || router.stats().routing_errors() == 1).await;
        assert_eq!(h.router.stats().requests(), 0);
        assert!(!ghost_worker.is_closed());
    }

    #[tokio::test]
    async fn test_channel_unregistered_when_peer_closes() {
        let h = harness();
        let (consumer_half, worker_half) = MessagePort::pair().unwrap();
        h.host
            .send_with_port(
                &Envelope::NewClient(NewClient::new("consumer-1".to_string(), None)),
                &worker_half,
            )
            .await
            .unwrap();
        worker_half.close().await;

        let router = h.router.clone();
        eventually(move || router.channel_ids().len() == 1).await;

        consumer_half.close().await;
        drop(consumer_half);
        let router = h.router.clone();
        eventually(move || router.channel_ids().is_empty()).await;
    }
}
