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

//! Host side: worker processes, the service registry, and the host link.

pub use registry::ServiceRegistry;
pub use service_client::{
    ExitCode, RequestOptions, ServiceClient, ServiceClientStats, ServiceOptions, ServiceState,
    Target, IN_CHILD_PROCESS_ENV, SERVICE_NAME_ENV,
};

/// Host link listener that transfers channels to consumers.
pub mod channel_broker;
/// Named collection of clients.
mod registry;
/// One worker process and its traffic.
mod service_client;
