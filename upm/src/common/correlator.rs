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

//! Request/response correlation with per-request timeouts.
//!
//! The [`Correlator`] allocates message ids and keeps the table of pending
//! requests. Removing an entry from the table is the only way to settle it,
//! so a response, a timeout and a cancellation can race freely: whichever
//! removes the entry first wins and the others find nothing.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::UpmError;
use crate::message::Message;

type Settlement = Result<serde_json::Value, UpmError>;

/// Host-side state of one outstanding request.
#[derive(Debug)]
struct PendingRequest {
    tx: oneshot::Sender<Settlement>,
    timer: Option<AbortHandle>,
}

impl PendingRequest {
    fn finish(self, result: Settlement) -> bool {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        self.tx.send(result).is_ok()
    }
}

/// Counters for a [`Correlator`].
#[derive(Debug, Default)]
pub struct CorrelatorStats {
    /// Requests registered.
    pub registered: AtomicUsize,
    /// Responses matched to a pending request.
    pub matched: AtomicUsize,
    /// Responses dropped because no request was pending.
    pub dropped: AtomicUsize,
    /// Requests whose timer fired.
    pub timed_out: AtomicUsize,
    /// Requests rejected by cancellation.
    pub cancelled: AtomicUsize,
}

impl CorrelatorStats {
    /// Get the number of registered requests.
    #[must_use]
    pub fn registered(&self) -> usize {
        self.registered.load(Ordering::Relaxed)
    }

    /// Get the number of matched responses.
    #[must_use]
    pub fn matched(&self) -> usize {
        self.matched.load(Ordering::Relaxed)
    }

    /// Get the number of dropped responses.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Get the number of timed-out requests.
    #[must_use]
    pub fn timed_out(&self) -> usize {
        self.timed_out.load(Ordering::Relaxed)
    }

    /// Get the number of cancelled requests.
    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Receiving side of a registered request.
#[derive(Debug)]
pub struct PendingResponse {
    message_id: u64,
    rx: oneshot::Receiver<Settlement>,
}

impl PendingResponse {
    /// Correlation id of the request.
    #[must_use]
    pub const fn message_id(&self) -> u64 {
        self.message_id
    }

    /// Wait for the request to settle.
    pub async fn wait(self) -> Result<serde_json::Value, UpmError> {
        self.rx.await.unwrap_or(Err(UpmError::ConnectionClosed))
    }
}

/// Message id allocation and the pending-request table.
#[derive(Debug)]
pub struct Correlator {
    next_id: AtomicU64,
    pending: Arc<DashMap<u64, PendingRequest>>,
    stats: Arc<CorrelatorStats>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    /// Create an empty correlator. Ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            stats: Arc::new(CorrelatorStats::default()),
        }
    }

    /// Allocate the next message id.
    pub fn next_message_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a pending request and arm its timer.
    ///
    /// Must be called before the request is sent, so the response can never
    /// arrive ahead of its table entry.
    pub fn register(&self, message_id: u64, timeout: Duration) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        self.pending
            .insert(message_id, PendingRequest { tx, timer: None });
        self.stats.registered.fetch_add(1, Ordering::Relaxed);

        let pending = Arc::clone(&self.pending);
        let stats = Arc::clone(&self.stats);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, entry)) = pending.remove(&message_id) {
                stats.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!("Request {} timed out after {:?}", message_id, timeout);
                #[allow(clippy::cast_possible_truncation)]
                let timeout_ms = timeout.as_millis() as u64;
                let _ = entry.tx.send(Err(UpmError::Timeout {
                    message_id,
                    timeout_ms,
                }));
            }
        })
        .abort_handle();

        match self.pending.get_mut(&message_id) {
            Some(mut entry) => entry.timer = Some(timer),
            None => timer.abort(),
        }

        PendingResponse { message_id, rx }
    }

    /// Settle the pending request matching `response`.
    ///
    /// Returns `false` if no request with that id is pending (already timed
    /// out, cancelled, answered, or never sent); the response is dropped.
    pub fn settle(&self, response: Message) -> bool {
        let Some((_, entry)) = self.pending.remove(&response.message_id) else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Dropping response for unknown or expired request {}",
                response.message_id
            );
            return false;
        };

        self.stats.matched.fetch_add(1, Ordering::Relaxed);
        let result = match response.error {
            Some(error) => Err(UpmError::Remote(error)),
            None => Ok(response.data),
        };
        if !entry.finish(result) {
            debug!(
                "Caller for request {} went away before the response",
                response.message_id
            );
        }
        true
    }

    /// Remove a pending request without settling it, e.g. after a failed send.
    pub fn forget(&self, message_id: u64) -> bool {
        self.pending
            .remove(&message_id)
            .map(|(_, entry)| {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
            })
            .is_some()
    }

    /// Reject every pending request with the error produced by `reason`.
    ///
    /// Returns the number of requests rejected.
    pub fn cancel_all(&self, reason: impl Fn(u64) -> UpmError) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                entry.finish(Err(reason(id)));
                cancelled += 1;
            }
        }
        self.stats
            .cancelled
            .fetch_add(cancelled, Ordering::Relaxed);
        cancelled
    }

    /// Number of requests still pending.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if `message_id` is still pending.
    #[must_use]
    pub fn is_pending(&self, message_id: u64) -> bool {
        self.pending.contains_key(&message_id)
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> &CorrelatorStats {
        &self.stats
    }
}
