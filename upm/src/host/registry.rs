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

//! Named collection of [`ServiceClient`]s.

use std::path::Path;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use super::service_client::{ServiceClient, ServiceOptions, ServiceState};
use crate::common::{UpmConfig, UpmError};

/// Registry of running services, keyed by service name.
///
/// Constructed explicitly by the host and passed to whatever needs it; there
/// is no process-global instance. Cloning shares the same registry.
///
/// # Example
///
/// ```rust,ignore
/// let registry = ServiceRegistry::new(UpmConfig::load());
/// let telemetry = registry.get_or_create("telemetry", "/usr/libexec/telemetry-worker").await?;
/// // ...
/// registry.destroy_all().await;
/// ```
#[derive(Clone, Debug)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    clients: DashMap<String, ServiceClient>,
    config: UpmConfig,
}

impl ServiceRegistry {
    /// Create an empty registry. Every client it creates uses `config`.
    #[must_use]
    pub fn new(config: UpmConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                clients: DashMap::new(),
                config,
            }),
        }
    }

    /// Configuration handed to new clients.
    #[must_use]
    pub fn config(&self) -> &UpmConfig {
        &self.inner.config
    }

    /// Return the running client for `service_name`, starting one if needed.
    pub async fn get_or_create(
        &self,
        service_name: &str,
        entry_point: impl AsRef<Path>,
    ) -> Result<ServiceClient, UpmError> {
        self.get_or_create_with(service_name, entry_point, ServiceOptions::default())
            .await
    }

    /// Like [`ServiceRegistry::get_or_create`] with extra process options.
    ///
    /// Fails with [`UpmError::EntryPointMismatch`] if the name is taken by a
    /// client with a different entry point. A client that fails to start is
    /// removed again; one whose worker has exited is replaced.
    #[instrument(skip(self, entry_point, options))]
    pub async fn get_or_create_with(
        &self,
        service_name: &str,
        entry_point: impl AsRef<Path>,
        options: ServiceOptions,
    ) -> Result<ServiceClient, UpmError> {
        let entry_point = entry_point.as_ref();

        let client = match self.inner.clients.entry(service_name.to_string()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get();
                if existing.entry_point() != entry_point {
                    return Err(UpmError::EntryPointMismatch {
                        service: service_name.to_string(),
                        existing: existing.entry_point().display().to_string(),
                        requested: entry_point.display().to_string(),
                    });
                }
                if matches!(existing.state(), ServiceState::Exited | ServiceState::Stopping) {
                    info!("Replacing exited client for '{}'", service_name);
                    let client = ServiceClient::with_options(
                        service_name,
                        entry_point,
                        options,
                        self.inner.config.clone(),
                    );
                    occupied.insert(client.clone());
                    client
                } else {
                    existing.clone()
                }
            }
            Entry::Vacant(vacant) => {
                debug!("Creating client for '{}'", service_name);
                let client = ServiceClient::with_options(
                    service_name,
                    entry_point,
                    options,
                    self.inner.config.clone(),
                );
                vacant.insert(client.clone());
                client
            }
        };

        if let Err(e) = client.start().await {
            // Only discard the entry if it is still this client.
            self.inner
                .clients
                .remove_if(service_name, |_, registered| registered.ptr_eq(&client));
            return Err(e);
        }
        Ok(client)
    }

    /// Look up a client by name.
    #[must_use]
    pub fn get(&self, service_name: &str) -> Option<ServiceClient> {
        self.inner
            .clients
            .get(service_name)
            .map(|client| client.clone())
    }

    /// Names of all registered services.
    #[must_use]
    pub fn service_names(&self) -> Vec<String> {
        self.inner
            .clients
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of registered services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.clients.len()
    }

    /// Returns `true` if no services are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.clients.is_empty()
    }

    /// Remove `service_name` and stop its client. No-op if absent.
    #[instrument(skip(self))]
    pub async fn destroy(&self, service_name: &str) {
        let Some((_, client)) = self.inner.clients.remove(service_name) else {
            return;
        };
        match client.stop().await {
            Ok(code) => info!("Destroyed '{}' (exit code {:?})", service_name, code),
            Err(e) => warn!("Error stopping '{}': {}", service_name, e),
        }
    }

    /// Destroy every registered client concurrently.
    #[instrument(skip(self))]
    pub async fn destroy_all(&self) {
        let names = self.service_names();
        info!("Destroying {} services", names.len());
        join_all(names.iter().map(|name| self.destroy(name))).await;
    }
}
