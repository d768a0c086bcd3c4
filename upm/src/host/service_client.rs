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

//! Host-side owner of one worker process.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use static_assertions::assert_impl_all;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::common::{Correlator, CorrelatorStats, UpmConfig, UpmError};
use crate::message::{Envelope, Message, MessageKind, NewClient};
use crate::transport::{
    Inbound, InboundHandler, MessagePort, ProcessPipe, Transport, TransportEvent,
};

/// Environment variable marking a process as a UPM worker.
pub const IN_CHILD_PROCESS_ENV: &str = "IN_CHILD_PROCESS";

/// Environment variable carrying the worker's service name.
pub const SERVICE_NAME_ENV: &str = "UPM_SERVICE_NAME";

/// Exit code of a worker process; `None` when it was terminated by a signal.
pub type ExitCode = Option<i32>;

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, UpmError>>>;

/// Lifecycle of a [`ServiceClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Constructed, not started.
    Idle,
    /// Worker spawned, waiting for its ready signal.
    Starting,
    /// Worker is serving requests.
    Ready,
    /// `stop()` has begun.
    Stopping,
    /// Worker process has exited.
    Exited,
}

/// Where a host-originated message is sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Target {
    /// The worker's process pipe.
    #[default]
    Worker,
    /// A channel created with [`ServiceClient::create_channel`] and kept by the host.
    Channel(String),
}

/// Per-call options for [`ServiceClient::execute_request_with`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Transport to send the request on.
    pub target: Target,
    /// Overrides the configured request timeout.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    /// Options with an explicit timeout.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

/// Extra process settings for a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceOptions {
    /// Arguments passed to the entry point.
    pub args: Vec<String>,
    /// Environment added on top of the inherited one.
    pub env: Vec<(String, String)>,
}

/// Counters for a [`ServiceClient`].
#[derive(Debug, Default)]
pub struct ServiceClientStats {
    /// Requests sent.
    pub requests_sent: AtomicUsize,
    /// Events sent.
    pub events_sent: AtomicUsize,
    /// Events received from the worker or channels.
    pub events_received: AtomicUsize,
    /// Channels created.
    pub channels_created: AtomicUsize,
    /// Inbound frames dropped as protocol errors.
    pub protocol_errors: AtomicUsize,
}

impl ServiceClientStats {
    /// Get the number of requests sent.
    #[must_use]
    pub fn requests_sent(&self) -> usize {
        self.requests_sent.load(Ordering::Relaxed)
    }

    /// Get the number of events sent.
    #[must_use]
    pub fn events_sent(&self) -> usize {
        self.events_sent.load(Ordering::Relaxed)
    }

    /// Get the number of events received.
    #[must_use]
    pub fn events_received(&self) -> usize {
        self.events_received.load(Ordering::Relaxed)
    }

    /// Get the number of channels created.
    #[must_use]
    pub fn channels_created(&self) -> usize {
        self.channels_created.load(Ordering::Relaxed)
    }

    /// Get the number of protocol errors.
    #[must_use]
    pub fn protocol_errors(&self) -> usize {
        self.protocol_errors.load(Ordering::Relaxed)
    }
}

/// A channel created for one consumer.
#[derive(Debug)]
struct ChannelSlot {
    port: Arc<MessagePort>,
    transferred: AtomicBool,
    dispatcher_attached: AtomicBool,
}

/// Owns exactly one worker process.
///
/// `ServiceClient` is cheap to clone; clones share the same worker.
///
/// # Example
///
/// ```rust,ignore
/// let client = ServiceClient::new("telemetry", "/usr/libexec/telemetry-worker", UpmConfig::default());
/// client.start().await?;
///
/// let status: serde_json::Value = client.execute_request("getStatus", &serde_json::json!({})).await?;
/// client.send_event(&serde_json::json!({ "action": "flush" }), Target::Worker).await?;
///
/// let exit_code = client.stop().await?;
/// ```
#[derive(Clone)]
pub struct ServiceClient {
    inner: Arc<ClientInner>,
}

assert_impl_all!(ServiceClient: Send, Sync, Clone);

struct ClientInner {
    service_name: String,
    entry_point: PathBuf,
    options: ServiceOptions,
    config: UpmConfig,
    state: RwLock<ServiceState>,
    stopping: AtomicBool,
    startup_abort: CancellationToken,
    correlator: Correlator,
    pipe: RwLock<Option<Arc<ProcessPipe>>>,
    channels: DashMap<String, Arc<ChannelSlot>>,
    pending_channels: Mutex<HashMap<String, SharedResult<Arc<MessagePort>>>>,
    start_future: Mutex<Option<SharedResult<()>>>,
    stop_future: Mutex<Option<SharedResult<ExitCode>>>,
    pid: Mutex<Option<u32>>,
    ready_tx: Mutex<Option<oneshot::Sender<()>>>,
    exit_rx: Mutex<Option<watch::Receiver<Option<ExitCode>>>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    stats: ServiceClientStats,
}

impl ServiceClient {
    /// Create a client for `service_name`, not yet started.
    pub fn new(
        service_name: impl Into<String>,
        entry_point: impl Into<PathBuf>,
        config: UpmConfig,
    ) -> Self {
        Self::with_options(service_name, entry_point, ServiceOptions::default(), config)
    }

    /// Create a client with extra process arguments and environment.
    pub fn with_options(
        service_name: impl Into<String>,
        entry_point: impl Into<PathBuf>,
        options: ServiceOptions,
        config: UpmConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                service_name: service_name.into(),
                entry_point: entry_point.into(),
                options,
                config,
                state: RwLock::new(ServiceState::Idle),
                stopping: AtomicBool::new(false),
                startup_abort: CancellationToken::new(),
                correlator: Correlator::new(),
                pipe: RwLock::new(None),
                channels: DashMap::new(),
                pending_channels: Mutex::new(HashMap::new()),
                start_future: Mutex::new(None),
                stop_future: Mutex::new(None),
                pid: Mutex::new(None),
                ready_tx: Mutex::new(None),
                exit_rx: Mutex::new(None),
                kill_tx: Mutex::new(None),
                stats: ServiceClientStats::default(),
            }),
        }
    }

    /// Name of the service.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// Executable the worker is spawned from.
    #[must_use]
    pub fn entry_point(&self) -> &Path {
        &self.inner.entry_point
    }

    /// Returns `true` if both handles refer to the same client.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServiceState {
        *self.inner.state.read()
    }

    /// Returns `true` while the worker is serving.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == ServiceState::Ready && !self.inner.stopping.load(Ordering::SeqCst)
    }

    /// Process id of the worker, once spawned.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        *self.inner.pid.lock()
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
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

    /// Client counters.
    #[must_use]
    pub fn stats(&self) -> &ServiceClientStats {
        &self.inner.stats
    }

    /// Request correlation counters.
    #[must_use]
    pub fn correlator_stats(&self) -> &CorrelatorStats {
        self.inner.correlator.stats()
    }

    /// Spawn the worker and wait until it signals readiness.
    ///
    /// Concurrent callers await the same in-flight start. A worker that exits
    /// before signalling readiness fails the start with
    /// [`UpmError::ExitedDuringStartup`].
    #[instrument(skip(self), fields(service = %self.inner.service_name))]
    pub async fn start(&self) -> Result<(), UpmError> {
        if self.inner.stopping.load(Ordering::SeqCst) {
            return Err(UpmError::ServiceStopping(self.inner.service_name.clone()));
        }
        let start = {
            let mut cached = self.inner.start_future.lock();
            match cached.as_ref() {
                Some(start) => start.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let start = spawn_shared(async move { inner.spawn_worker().await });
                    *cached = Some(start.clone());
                    start
                }
            }
        };
        start.await
    }

    /// Create (or return) the channel for `consumer_id`.
    ///
    /// Fails immediately with [`UpmError::NotReady`] unless the client is
    /// ready. Concurrent calls for one consumer id share a single creation;
    /// later calls return the same port until it is transferred, after which
    /// they fail with [`UpmError::DuplicateChannel`].
    #[instrument(skip(self), fields(service = %self.inner.service_name))]
    pub async fn create_channel(&self, consumer_id: &str) -> Result<Arc<MessagePort>, UpmError> {
        self.inner.ensure_accepting()?;

        if let Some(slot) = self.inner.channels.get(consumer_id) {
            if slot.transferred.load(Ordering::SeqCst) {
                return Err(UpmError::DuplicateChannel(consumer_id.to_string()));
            }
            return Ok(Arc::clone(&slot.port));
        }

        let creation = {
            let mut pending = self.inner.pending_channels.lock();
            pending
                .entry(consumer_id.to_string())
                .or_insert_with(|| {
                    let inner = Arc::clone(&self.inner);
                    let consumer_id = consumer_id.to_string();
                    spawn_shared(async move { inner.open_channel(consumer_id).await })
                })
                .clone()
        };
        creation.await
    }

    /// Transfer the channel for `consumer_id` to another process over `link`.
    ///
    /// The port travels with a `NewClient` envelope naming this service. After
    /// the transfer the host releases its descriptor; the channel can be
    /// handed off only once.
    #[instrument(skip(self, link), fields(service = %self.inner.service_name))]
    pub async fn hand_off_channel(
        &self,
        consumer_id: &str,
        link: &dyn Transport,
    ) -> Result<(), UpmError> {
        let slot = self
            .inner
            .channels
            .get(consumer_id)
            .map(|slot| Arc::clone(&slot))
            .ok_or_else(|| UpmError::UnknownChannel(consumer_id.to_string()))?;

        if slot.transferred.swap(true, Ordering::SeqCst) {
            return Err(UpmError::DuplicateChannel(consumer_id.to_string()));
        }

        let envelope = Envelope::NewClient(NewClient::new(
            consumer_id.to_string(),
            Some(self.inner.service_name.clone()),
        ));
        match link.send_with_port(&envelope, &slot.port).await {
            Ok(()) => {
                slot.port.close().await;
                info!("Handed channel for '{}' to {}", consumer_id, link.label());
                Ok(())
            }
            Err(e) => {
                slot.transferred.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Close and unregister the channel for `consumer_id`.
    ///
    /// Returns `false` if no such channel exists.
    pub async fn close_channel(&self, consumer_id: &str) -> bool {
        match self.inner.channels.remove(consumer_id) {
            Some((_, slot)) => {
                slot.port.close().await;
                debug!("Closed channel for '{}'", consumer_id);
                true
            }
            None => false,
        }
    }

    /// Fire-and-forget event.
    pub async fn send_event<T>(&self, data: &T, target: Target) -> Result<(), UpmError>
    where
        T: Serialize + ?Sized,
    {
        self.inner.ensure_accepting()?;
        let transport = self.inner.transport_for(&target)?;
        let data = serde_json::to_value(data)?;

        let message_id = self.inner.correlator.next_message_id();
        transport
            .send(&Envelope::service(Message::event(message_id, data)))
            .await?;
        self.inner.stats.events_sent.fetch_add(1, Ordering::Relaxed);
        trace!("Sent event {} to {}", message_id, transport.label());
        Ok(())
    }

    /// Send a request to the worker and wait for its response.
    ///
    /// Uses the configured request timeout (120 s unless overridden).
    pub async fn execute_request<T, R>(&self, message_type: &str, data: &T) -> Result<R, UpmError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.execute_request_with(message_type, data, RequestOptions::default())
            .await
    }

    /// Send a request with an explicit target and/or timeout.
    pub async fn execute_request_with<T, R>(
        &self,
        message_type: &str,
        data: &T,
        options: RequestOptions,
    ) -> Result<R, UpmError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.inner.ensure_accepting()?;
        let transport = self.inner.transport_for(&options.target)?;
        let data = serde_json::to_value(data)?;
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.inner.config.request_timeout());

        let correlator = &self.inner.correlator;
        let message_id = correlator.next_message_id();
        let pending = correlator.register(message_id, timeout);

        // stop() may have drained the table between the guard and the insert.
        if self.inner.stopping.load(Ordering::SeqCst) {
            correlator.forget(message_id);
            return Err(UpmError::ServiceStopping(self.inner.service_name.clone()));
        }

        let request = Message::request(message_id, message_type, data);
        if let Err(e) = transport.send(&Envelope::service(request)).await {
            correlator.forget(message_id);
            return Err(e);
        }
        self.inner.stats.requests_sent.fetch_add(1, Ordering::Relaxed);
        trace!("Sent request {} '{}'", message_id, message_type);

        let value = pending.wait().await?;
        serde_json::from_value(value).map_err(UpmError::from)
    }

    /// Stop the worker and return its exit code.
    ///
    /// Rejects every pending request with [`UpmError::RemovedBeforeSettled`],
    /// closes every channel, closes the pipe and gives the worker
    /// `shutdown_grace` to exit before killing it. Concurrent callers await
    /// the same in-flight stop.
    #[instrument(skip(self), fields(service = %self.inner.service_name))]
    pub async fn stop(&self) -> Result<ExitCode, UpmError> {
        let stop = {
            let mut cached = self.inner.stop_future.lock();
            cached
                .get_or_insert_with(|| {
                    let inner = Arc::clone(&self.inner);
                    spawn_shared(async move { inner.shutdown().await })
                })
                .clone()
        };
        stop.await
    }
}

impl fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceClient")
            .field("service_name", &self.inner.service_name)
            .field("entry_point", &self.inner.entry_point)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .field("pending_requests", &self.pending_requests())
            .field("channels", &self.inner.channels.len())
            .finish()
    }
}

impl ClientInner {
    fn ensure_accepting(&self) -> Result<(), UpmError> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(UpmError::ServiceStopping(self.service_name.clone()));
        }
        match *self.state.read() {
            ServiceState::Ready => Ok(()),
            ServiceState::Stopping => Err(UpmError::ServiceStopping(self.service_name.clone())),
            _ => Err(UpmError::NotReady(self.service_name.clone())),
        }
    }

    fn set_state(&self, state: ServiceState) -> ServiceState {
        std::mem::replace(&mut *self.state.write(), state)
    }

    fn pipe(&self) -> Result<Arc<ProcessPipe>, UpmError> {
        self.pipe.read().clone().ok_or(UpmError::ChannelClosed)
    }

    fn transport_for(self: &Arc<Self>, target: &Target) -> Result<Arc<dyn Transport>, UpmError> {
        match target {
            Target::Worker => Ok(self.pipe()? as Arc<dyn Transport>),
            Target::Channel(consumer_id) => {
                let slot = self
                    .channels
                    .get(consumer_id)
                    .map(|slot| Arc::clone(&slot))
                    .ok_or_else(|| UpmError::UnknownChannel(consumer_id.clone()))?;

                if slot.transferred.load(Ordering::SeqCst) {
                    return Err(UpmError::ChannelClosed);
                }
                if !slot.dispatcher_attached.swap(true, Ordering::SeqCst) {
                    let handler = self.dispatcher(Some(consumer_id.clone()));
                    if let Err(e) = slot.port.on_message(handler) {
                        slot.dispatcher_attached.store(false, Ordering::SeqCst);
                        return Err(e);
                    }
                }
                Ok(slot.port.clone() as Arc<dyn Transport>)
            }
        }
    }

    async fn spawn_worker(self: Arc<Self>) -> Result<(), UpmError> {
        self.set_state(ServiceState::Starting);
        let result = self.spawn_and_wait_ready().await;
        if let Err(e) = &result {
            warn!("Service '{}' failed to start: {}", self.service_name, e);
            self.close_pipe().await;
            self.set_state(ServiceState::Exited);
        }
        result
    }

    async fn spawn_and_wait_ready(self: &Arc<Self>) -> Result<(), UpmError> {
        if self.startup_abort.is_cancelled() {
            return Err(UpmError::ServiceStopping(self.service_name.clone()));
        }
        let (pipe, child_stdin) =
            ProcessPipe::for_child(&self.service_name, self.config.limits.max_frame_size)?;
        let pipe = Arc::new(pipe);

        let (ready_tx, ready_rx) = oneshot::channel();
        *self.ready_tx.lock() = Some(ready_tx);
        pipe.on_message(self.dispatcher(None))?;
        *self.pipe.write() = Some(Arc::clone(&pipe));

        let mut command = Command::new(&self.entry_point);
        command
            .args(&self.options.args)
            .envs(self.options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(IN_CHILD_PROCESS_ENV, "true")
            .env(SERVICE_NAME_ENV, &self.service_name)
            .stdin(child_stdin)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            UpmError::SpawnFailed(format!("{}: {e}", self.entry_point.display()))
        })?;
        // Dropping the command releases our copy of the child's pipe end.
        drop(command);

        let pid = child.id();
        *self.pid.lock() = pid;
        info!(
            "Spawned worker for '{}' (pid {:?}) from {}",
            self.service_name,
            pid,
            self.entry_point.display()
        );

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        *self.exit_rx.lock() = Some(exit_rx.clone());
        *self.kill_tx.lock() = Some(kill_tx);
        tokio::spawn(watch_exit(child, kill_rx, exit_tx, Arc::downgrade(self)));

        let startup_timeout = self.config.startup_timeout();
        let mut exit_rx = exit_rx;
        tokio::select! {
            biased;
            ready = ready_rx => {
                ready.map_err(|_| UpmError::ConnectionClosed)?;
                let exited = *exit_rx.borrow();
                if let Some(code) = exited {
                    return Err(UpmError::ExitedDuringStartup {
                        service: self.service_name.clone(),
                        code,
                    });
                }
                self.set_state(ServiceState::Ready);
                info!("Service '{}' is ready", self.service_name);
                Ok(())
            }
            code = wait_exit(&mut exit_rx) => {
                Err(UpmError::ExitedDuringStartup {
                    service: self.service_name.clone(),
                    code,
                })
            }
            () = self.startup_abort.cancelled() => {
                self.kill();
                let code = wait_exit(&mut exit_rx).await;
                debug!(
                    "Startup of '{}' aborted; worker exited with {:?}",
                    self.service_name, code
                );
                Err(UpmError::ServiceStopping(self.service_name.clone()))
            }
            () = tokio::time::sleep(startup_timeout) => {
                self.kill();
                let _ = wait_exit(&mut exit_rx).await;
                #[allow(clippy::cast_possible_truncation)]
                let timeout_ms = startup_timeout.as_millis() as u64;
                Err(UpmError::StartupTimeout {
                    service: self.service_name.clone(),
                    timeout_ms,
                })
            }
        }
    }

    async fn close_pipe(&self) {
        let pipe = self.pipe.write().take();
        if let Some(pipe) = pipe {
            pipe.close().await;
        }
    }

    fn kill(&self) {
        if let Some(kill) = self.kill_tx.lock().take() {
            let _ = kill.send(());
        }
    }

    async fn open_channel(self: Arc<Self>, consumer_id: String) -> Result<Arc<MessagePort>, UpmError> {
        let result = self.open_channel_inner(&consumer_id).await;
        self.pending_channels.lock().remove(&consumer_id);
        result
    }

    async fn open_channel_inner(&self, consumer_id: &str) -> Result<Arc<MessagePort>, UpmError> {
        let pipe = self.pipe()?;
        let (consumer_half, worker_half) = MessagePort::pair()?;
        let max_frame_size = self.config.limits.max_frame_size;
        let port = Arc::new(
            consumer_half
                .with_label(format!("channel:{}:{consumer_id}", self.service_name))
                .with_max_frame_size(max_frame_size),
        );

        let slot = Arc::new(ChannelSlot {
            port: Arc::clone(&port),
            transferred: AtomicBool::new(false),
            dispatcher_attached: AtomicBool::new(false),
        });
        self.channels.insert(consumer_id.to_string(), Arc::clone(&slot));

        // Stop may have drained the channel map while we were inserting.
        if self.stopping.load(Ordering::SeqCst) {
            worker_half.close().await;
            self.discard_channel(consumer_id, &slot).await;
            return Err(UpmError::ServiceStopping(self.service_name.clone()));
        }

        let envelope = Envelope::NewClient(NewClient::new(consumer_id.to_string(), None));
        let sent = pipe.send_with_port(&envelope, &worker_half).await;
        worker_half.close().await;

        if let Err(e) = sent {
            self.discard_channel(consumer_id, &slot).await;
            warn!("Failed to create channel for '{}': {}", consumer_id, e);
            return Err(e);
        }
        if self.stopping.load(Ordering::SeqCst) {
            self.discard_channel(consumer_id, &slot).await;
            return Err(UpmError::ServiceStopping(self.service_name.clone()));
        }

        self.stats.channels_created.fetch_add(1, Ordering::Relaxed);
        info!(
            "Created channel for consumer '{}' on '{}'",
            consumer_id, self.service_name
        );
        Ok(port)
    }

    async fn discard_channel(&self, consumer_id: &str, slot: &Arc<ChannelSlot>) {
        self.channels.remove_if(consumer_id, |_, current| Arc::ptr_eq(current, slot));
        slot.port.close().await;
    }

    async fn close_all_channels(&self) {
        let slots: Vec<(String, Arc<ChannelSlot>)> = self
            .channels
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        self.channels.clear();
        for (consumer_id, slot) in slots {
            slot.port.close().await;
            trace!("Closed channel for '{}'", consumer_id);
        }
    }

    async fn shutdown(self: Arc<Self>) -> Result<ExitCode, UpmError> {
        self.stopping.store(true, Ordering::SeqCst);
        // A worker that never signals ready must not hold stop hostage.
        self.startup_abort.cancel();
        let in_flight_start = self.start_future.lock().clone();
        if let Some(start) = in_flight_start {
            let _ = start.await;
        }

        let previous = self.set_state(ServiceState::Stopping);
        info!("Stopping service '{}' (was {:?})", self.service_name, previous);

        let cancelled = self.correlator.cancel_all(UpmError::RemovedBeforeSettled);
        if cancelled > 0 {
            debug!("Rejected {} pending requests", cancelled);
        }
        self.close_all_channels().await;
        self.close_pipe().await;

        let exit_rx = self.exit_rx.lock().clone();
        let code = match exit_rx {
            Some(mut exit_rx) => {
                let grace = self.config.shutdown_grace();
                match tokio::time::timeout(grace, wait_exit(&mut exit_rx)).await {
                    Ok(code) => code,
                    Err(_) => {
                        warn!(
                            "Worker for '{}' did not exit within {:?}; killing",
                            self.service_name, grace
                        );
                        self.kill();
                        wait_exit(&mut exit_rx).await
                    }
                }
            }
            None => None,
        };

        self.correlator.cancel_all(UpmError::RemovedBeforeSettled);
        self.set_state(ServiceState::Exited);
        info!("Service '{}' stopped (exit code {:?})", self.service_name, code);
        Ok(code)
    }

    async fn on_process_exit(&self, code: ExitCode) {
        let previous = {
            let mut state = self.state.write();
            let previous = *state;
            // shutdown() owns the final transition while stopping.
            if previous != ServiceState::Stopping {
                *state = ServiceState::Exited;
            }
            previous
        };
        match previous {
            ServiceState::Ready => {
                match code {
                    Some(0) => info!("Worker for '{}' exited cleanly", self.service_name),
                    _ => warn!(
                        "Worker for '{}' exited unexpectedly (code {:?})",
                        self.service_name, code
                    ),
                }
                let service = self.service_name.clone();
                self.correlator.cancel_all(|_| UpmError::WorkerExited {
                    service: service.clone(),
                    code,
                });
                self.close_all_channels().await;
                self.close_pipe().await;
            }
            ServiceState::Stopping => {
                debug!("Worker for '{}' exited during stop", self.service_name);
            }
            _ => debug!(
                "Worker for '{}' exited while {:?} (code {:?})",
                self.service_name, previous, code
            ),
        }
    }

    fn dispatcher(self: &Arc<Self>, consumer_id: Option<String>) -> InboundHandler {
        let inner = Arc::downgrade(self);
        Arc::new(move |event| {
            let inner = inner.clone();
            let consumer_id = consumer_id.clone();
            async move {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                match event {
                    TransportEvent::Message(inbound) => {
                        inner.handle_inbound(inbound, consumer_id.as_deref());
                    }
                    TransportEvent::Closed => match consumer_id {
                        Some(id) => debug!("Channel for '{}' closed", id),
                        None => debug!("Pipe to '{}' closed", inner.service_name),
                    },
                }
            }
            .boxed()
        })
    }

    fn handle_inbound(&self, inbound: Inbound, consumer_id: Option<&str>) {
        let source = consumer_id.unwrap_or("worker");
        if inbound.port.is_some() {
            warn!("Dropping unexpected port from {}", source);
        }

        match inbound.envelope {
            Envelope::ServiceMessage(message) => match message.kind {
                MessageKind::Response => {
                    self.correlator.settle(message);
                }
                MessageKind::Event => {
                    self.stats.events_received.fetch_add(1, Ordering::Relaxed);
                    info!(
                        "Event {} from {} on '{}': {}",
                        message.message_id, source, self.service_name, message.data
                    );
                }
                MessageKind::Request => {
                    self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Dropping request {} from {}: the host does not serve requests",
                        message.message_id, source
                    );
                }
            },
            Envelope::Ready(notice) if consumer_id.is_none() => {
                match self.ready_tx.lock().take() {
                    Some(ready) => {
                        debug!("Ready from '{}' (pid {})", notice.service_name, notice.pid);
                        let _ = ready.send(());
                    }
                    None => warn!("Duplicate ready signal from '{}'", self.service_name),
                }
            }
            other => {
                self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Protocol error: unexpected {} envelope from {}",
                    other.channel_name(),
                    source
                );
            }
        }
    }
}

/// Run `fut` on its own task so it completes even if every caller goes away.
fn spawn_shared<T>(fut: impl Future<Output = Result<T, UpmError>> + Send + 'static) -> SharedResult<T>
where
    T: Clone + Send + Sync + 'static,
{
    let handle = tokio::spawn(fut);
    async move {
        handle
            .await
            .unwrap_or_else(|e| Err(UpmError::IoError(format!("task failed: {e}"))))
    }
    .boxed()
    .shared()
}

async fn wait_exit(exit_rx: &mut watch::Receiver<Option<ExitCode>>) -> ExitCode {
    match exit_rx.wait_for(Option::is_some).await {
        Ok(code) => {
            let code = *code;
            code.flatten()
        }
        Err(_) => None,
    }
}

async fn watch_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitCode>>,
    inner: Weak<ClientInner>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill worker: {}", e);
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            error!("Failed to wait for worker: {}", e);
            None
        }
    };
    let _ = exit_tx.send(Some(code));

    if let Some(inner) = inner.upgrade() {
        inner.on_process_exit(code).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ServiceClient {
        ServiceClient::new("telemetry", "/nonexistent/worker", UpmConfig::default())
    }

    #[tokio::test]
    async fn test_new_client_is_idle() {
        let client = client();
        assert_eq!(client.state(), ServiceState::Idle);
        assert!(!client.is_ready());
        assert_eq!(client.pending_requests(), 0);
        assert!(client.pid().is_none());
    }

    #[tokio::test]
    async fn test_create_channel_before_ready_is_rejected() {
        let client = client();
        let result = client.create_channel("consumer-1").await;
        assert_eq!(result.err(), Some(UpmError::NotReady("telemetry".to_string())));
    }

    #[tokio::test]
    async fn test_request_before_ready_is_rejected() {
        let client = client();
        let result: Result<serde_json::Value, _> =
            client.execute_request("getStatus", &serde_json::json!({})).await;
        assert_eq!(result, Err(UpmError::NotReady("telemetry".to_string())));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let client = client();
        let result = client.start().await;
        assert!(matches!(result, Err(UpmError::SpawnFailed(_))));
        assert_eq!(client.state(), ServiceState::Exited);

        // The failed start is cached for later callers.
        assert_eq!(client.start().await, result);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let client = client();
        assert_eq!(client.stop().await, Ok(None));
        assert_eq!(client.state(), ServiceState::Exited);
        assert!(matches!(
            client.start().await,
            Err(UpmError::ServiceStopping(_))
        ));
    }

    #[tokio::test]
    async fn test_channel_opened_while_stopping_is_discarded() {
        let client = client();
        let max_frame_size = crate::transport::protocol::MAX_FRAME_SIZE;
        let (pipe, _child_end) = ProcessPipe::for_child("telemetry", max_frame_size).unwrap();
        {
            let mut slot = client.inner.pipe.write();
            *slot = Some(Arc::new(pipe));
        }
        client.inner.stopping.store(true, Ordering::SeqCst);

        let result = client.inner.open_channel_inner("consumer-1").await;
        assert_eq!(
            result.err(),
            Some(UpmError::ServiceStopping("telemetry".to_string()))
        );
        assert!(client.channel_ids().is_empty());
        assert_eq!(client.stats().channels_created(), 0);
    }

    #[test]
    fn test_request_options_default_to_worker() {
        let options = RequestOptions::with_timeout(Duration::from_millis(50));
        assert_eq!(options.target, Target::Worker);
        assert_eq!(options.timeout, Some(Duration::from_millis(50)));
    }
}
