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

//! Error type shared by every UPM component.

use std::fmt;

/// Error types for UPM operations.
///
/// `UpmError` is `Clone` so a single failure can be handed to every caller
/// awaiting a shared in-flight operation (`start`, `stop`, `create_channel`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpmError {
    /// The worker process could not be spawned.
    SpawnFailed(String),

    /// The worker exited before it signalled readiness.
    ExitedDuringStartup {
        /// Name of the service whose worker exited.
        service: String,
        /// Exit code, or `None` if the process was terminated by a signal.
        code: Option<i32>,
    },

    /// The worker did not signal readiness within the startup timeout.
    StartupTimeout {
        /// Name of the service.
        service: String,
        /// Timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The operation requires a client in the `Ready` state.
    NotReady(String),

    /// The client is stopping or stopped; no new work is accepted.
    ServiceStopping(String),

    /// The worker process exited while requests were outstanding.
    WorkerExited {
        /// Name of the service.
        service: String,
        /// Exit code, or `None` if the process was terminated by a signal.
        code: Option<i32>,
    },

    /// No response arrived before the request's timer fired.
    Timeout {
        /// Correlation id of the request.
        message_id: u64,
        /// Timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The pending request was cancelled before a response arrived.
    RemovedBeforeSettled(u64),

    /// The remote handler answered with an error string.
    Remote(String),

    /// No channel is registered for the consumer id.
    UnknownChannel(String),

    /// A channel for the consumer id has already been handed to a consumer.
    DuplicateChannel(String),

    /// No service with this name is registered.
    UnknownService(String),

    /// A service with this name exists with a different entry point.
    EntryPointMismatch {
        /// Name of the service.
        service: String,
        /// Entry point of the registered client.
        existing: String,
        /// Entry point the caller asked for.
        requested: String,
    },

    /// The host refused to hand out a channel.
    ChannelRefused(String),

    /// No channel was delivered within the connect timeout.
    ConnectTimeout {
        /// Service the consumer asked for.
        service: String,
        /// Timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// A channel delivery arrived without a transferred port.
    NoTransferredPort,

    /// A dispatcher is already attached to this transport.
    HandlerAlreadyAttached,

    /// The port has a dispatcher attached and cannot be transferred.
    PortInUse,

    /// The transport is closed.
    ChannelClosed,

    /// The peer closed the connection.
    ConnectionClosed,

    /// The process was not started as a UPM worker.
    NotInChildProcess,

    /// Protocol error (invalid frame, unsupported version, unexpected envelope).
    ProtocolError(String),

    /// Serialization or deserialization failure.
    SerializationError(String),

    /// Socket or I/O error.
    IoError(String),
}

impl fmt::Display for UpmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpawnFailed(e) => write!(f, "Failed to spawn worker: {e}"),
            Self::ExitedDuringStartup { service, code } => match code {
                Some(code) => write!(f, "Service '{service}' exited during startup with code {code}"),
                None => write!(f, "Service '{service}' exited during startup (terminated by signal)"),
            },
            Self::StartupTimeout {
                service,
                timeout_ms,
            } => write!(f, "Service '{service}' not ready after {timeout_ms}ms"),
            Self::NotReady(s) => write!(f, "Service '{s}' is not ready"),
            Self::ServiceStopping(s) => write!(f, "Service '{s}' is stopping"),
            Self::WorkerExited { service, code } => match code {
                Some(code) => write!(f, "Worker for '{service}' exited with code {code}"),
                None => write!(f, "Worker for '{service}' was terminated by a signal"),
            },
            Self::Timeout {
                message_id,
                timeout_ms,
            } => write!(f, "Request {message_id} timed out after {timeout_ms}ms"),
            Self::RemovedBeforeSettled(id) => write!(f, "Request {id} removed before settled"),
            Self::Remote(e) => write!(f, "Remote error: {e}"),
            Self::UnknownChannel(c) => write!(f, "No channel registered for consumer '{c}'"),
            Self::DuplicateChannel(c) => {
                write!(f, "Channel for consumer '{c}' has already been handed out")
            }
            Self::UnknownService(s) => write!(f, "Unknown service: {s}"),
            Self::EntryPointMismatch {
                service,
                existing,
                requested,
            } => write!(
                f,
                "Service '{service}' already registered with entry point {existing}, requested {requested}"
            ),
            Self::ChannelRefused(reason) => write!(f, "Channel refused: {reason}"),
            Self::ConnectTimeout {
                service,
                timeout_ms,
            } => write!(f, "No channel for '{service}' delivered within {timeout_ms}ms"),
            Self::NoTransferredPort => write!(f, "Channel delivery carried no transferred port"),
            Self::HandlerAlreadyAttached => write!(f, "A message handler is already attached"),
            Self::PortInUse => write!(f, "Port has a message handler attached and cannot be transferred"),
            Self::ChannelClosed => write!(f, "Channel closed"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::NotInChildProcess => write!(f, "Not running as a UPM worker process"),
            Self::ProtocolError(e) => write!(f, "Protocol error: {e}"),
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for UpmError {}

impl From<serde_json::Error> for UpmError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for UpmError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<nix::errno::Errno> for UpmError {
    fn from(err: nix::errno::Errno) -> Self {
        Self::IoError(err.desc().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removed_before_settled_display() {
        let err = UpmError::RemovedBeforeSettled(7);
        assert_eq!(err.to_string(), "Request 7 removed before settled");
    }

    #[test]
    fn test_exited_during_startup_display() {
        let err = UpmError::ExitedDuringStartup {
            service: "telemetry".to_string(),
            code: Some(3),
        };
        assert!(err.to_string().contains("exited during startup"));

        let err = UpmError::ExitedDuringStartup {
            service: "telemetry".to_string(),
            code: None,
        };
        assert!(err.to_string().contains("signal"));
    }

    #[test]
    fn test_remote_error_keeps_message() {
        let err = UpmError::Remote("unknown type 'getStatus'".to_string());
        assert!(err.to_string().contains("unknown type"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let err: UpmError = io.into();
        assert!(matches!(err, UpmError::IoError(ref m) if m.contains("pipe gone")));
    }
}
