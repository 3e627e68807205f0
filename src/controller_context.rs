// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Controller context - shared resources for all controllers.

use std::sync::Arc;

use kube::Client;

use crate::client::{ClusterClient, KubeClusterClient};
use crate::config::{AuthToken, ControllerConfig};

/// Shared context for all controllers.
///
/// Everything in here is immutable once built; per-service state lives only
/// inside a single reconcile call.
#[derive(Clone)]
pub struct ControllerContext {
    /// Kubernetes client, used to set up watches.
    pub client: Client,

    /// Cluster operations used by reconcilers.
    pub cluster: Arc<dyn ClusterClient>,

    /// Configuration for this instance.
    pub config: Arc<ControllerConfig>,

    /// ngrok auth token for tunnel pods.
    pub token: AuthToken,
}

impl ControllerContext {
    /// Creates a context whose cluster operations go through `client`.
    pub fn new(client: Client, config: Arc<ControllerConfig>, token: AuthToken) -> Self {
        Self {
            cluster: Arc::new(KubeClusterClient::new(client.clone())),
            client,
            config,
            token,
        }
    }
}
