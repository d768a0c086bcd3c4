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

//! UPM configuration with XDG-compliant file and socket locations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Configuration for the UPM runtime.
///
/// Loaded from `$XDG_CONFIG_HOME/upm/upm.toml`. Every section is optional;
/// missing values fall back to their defaults.
///
/// # Example Configuration File
///
/// ```toml
/// [host_link]
/// # path = "/run/user/1000/upm/my_app/host.sock"
/// mode = 0o600
///
/// [limits]
/// max_frame_size = 16777216
/// max_links = 64
///
/// [timeouts]
/// request_timeout_ms = 120000
/// startup_timeout_ms = 30000
/// connect_timeout_ms = 10000
/// shutdown_grace_ms = 5000
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpmConfig {
    /// Host-link socket used by consumers to request channels.
    pub host_link: HostLinkConfig,
    /// Frame and connection limits.
    pub limits: LimitsConfig,
    /// Timeouts for requests and process lifecycle.
    pub timeouts: TimeoutsConfig,
}

/// Host-link socket configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostLinkConfig {
    /// Override the default socket path.
    ///
    /// If `None`, the socket lives at `$XDG_RUNTIME_DIR/upm/<app_name>/host.sock`.
    pub path: Option<PathBuf>,

    /// Socket file permissions. Default is `0o600`.
    pub mode: u32,

    /// Application name used to shard socket paths. Defaults to the binary name.
    pub app_name: Option<String>,
}

/// Limits applied to every transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest accepted frame payload, in bytes.
    pub max_frame_size: usize,

    /// Maximum concurrent host-link connections.
    pub max_links: usize,
}

/// Timeout configuration. All values are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Default request timeout, overridable per call.
    #[serde(rename = "request_timeout_ms")]
    pub request: u64,

    /// How long `start()` waits for the worker's ready signal.
    #[serde(rename = "startup_timeout_ms")]
    pub startup: u64,

    /// How long a consumer waits for its channel delivery.
    #[serde(rename = "connect_timeout_ms")]
    pub connect: u64,

    /// How long `stop()` waits for a clean exit before killing the worker.
    #[serde(rename = "shutdown_grace_ms")]
    pub shutdown_grace: u64,
}

impl Default for HostLinkConfig {
    fn default() -> Self {
        Self {
            path: None,
            mode: 0o600,
            app_name: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024, // 16 MiB
            max_links: 64,
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            request: 120_000,
            startup: 30_000,
            connect: 10_000,
            shutdown_grace: 5_000,
        }
    }
}

impl UpmConfig {
    /// Load configuration from `$XDG_CONFIG_HOME/upm/upm.toml`.
    ///
    /// Falls back to defaults when no file exists or when it cannot be parsed.
    #[must_use]
    pub fn load() -> Self {
        let xdg_dirs = match xdg::BaseDirectories::with_prefix("upm") {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!("Failed to initialize XDG directories for UPM config: {}", e);
                return Self::default();
            }
        };

        xdg_dirs.find_config_file("upm.toml").map_or_else(
            || {
                info!("No UPM configuration file found, using defaults");
                Self::default()
            },
            |path| Self::load_from(&path),
        )
    }

    /// Load configuration from an explicit file, falling back to defaults on error.
    #[must_use]
    pub fn load_from(path: &Path) -> Self {
        info!("Loading UPM configuration from: {}", path.display());
        match std::fs::read_to_string(path) {
            Ok(config_str) => match toml::from_str::<Self>(&config_str) {
                Ok(config) => config,
                Err(e) => {
                    warn!(
                        "Failed to parse UPM configuration file {}: {}",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(e) => {
                warn!(
                    "Failed to read UPM configuration file {}: {}",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Get the resolved application name.
    #[must_use]
    pub fn app_name(&self) -> String {
        self.host_link
            .app_name
            .clone()
            .unwrap_or_else(Self::default_app_name)
    }

    fn default_app_name() -> String {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "upm".to_string())
    }

    /// Get the host-link socket path.
    ///
    /// - Linux: `$XDG_RUNTIME_DIR/upm/<app_name>/host.sock`
    /// - Fallback: `/tmp/upm/<app_name>/host.sock`
    #[must_use]
    pub fn host_link_path(&self) -> PathBuf {
        self.host_link.path.clone().unwrap_or_else(|| {
            let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
                .map_or_else(|_| PathBuf::from("/tmp"), PathBuf::from);

            runtime_dir
                .join("upm")
                .join(self.app_name())
                .join("host.sock")
        })
    }

    /// Default request timeout as a `Duration`.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.request)
    }

    /// Startup timeout as a `Duration`.
    #[must_use]
    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.startup)
    }

    /// Channel connect timeout as a `Duration`.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.connect)
    }

    /// Shutdown grace period as a `Duration`.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.timeouts.shutdown_grace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = UpmConfig::default();
        assert_eq!(config.timeouts.request, 120_000);
        assert_eq!(config.limits.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(config.request_timeout(), Duration::from_millis(120_000));
    }

    #[test]
    fn test_host_link_path_default() {
        let config = UpmConfig::default();
        let path = config.host_link_path();

        assert!(path.to_string_lossy().contains("upm"));
        assert!(path.to_string_lossy().ends_with("host.sock"));
    }

    #[test]
    fn test_host_link_path_override() {
        let mut config = UpmConfig::default();
        config.host_link.path = Some(PathBuf::from("/custom/host.sock"));

        assert_eq!(config.host_link_path(), PathBuf::from("/custom/host.sock"));
    }

    #[test]
    fn test_app_name_override() {
        let mut config = UpmConfig::default();
        config.host_link.app_name = Some("shell".to_string());
        assert_eq!(config.app_name(), "shell");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upm.toml");
        std::fs::write(&path, "[timeouts]\nrequest_timeout_ms = 250\n").unwrap();

        let config = UpmConfig::load_from(&path);
        assert_eq!(config.timeouts.request, 250);
        assert_eq!(config.timeouts.shutdown_grace, 5_000);
        assert_eq!(config.limits.max_links, 64);
    }

    #[test]
    fn test_malformed_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upm.toml");
        std::fs::write(&path, "this is = = not toml").unwrap();

        let config = UpmConfig::load_from(&path);
        assert_eq!(config.timeouts.request, 120_000);
    }

    #[test]
    fn test_config_serialization() {
        let config = UpmConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: UpmConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.timeouts.startup, config.timeouts.startup);
    }
}
