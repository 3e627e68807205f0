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

//! Tunnel pod lifecycle.
//!
//! Tunnel pods are found by the owner's association label on every call,
//! including after a restart, so no identifier needs to be remembered.

use std::sync::Arc;

use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, info};

use crate::client::{ClientError, ClusterClient};
use crate::config::{AuthToken, TunnelConfig};
use crate::naming::ServiceKey;
use crate::workload::{build_tunnel_pod, TunnelTarget};

/// Errors returned by tunnel lifecycle operations.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Cleanup was requested but no tunnel pod carries the owner's label.
    #[error("can't find dependent tunnel pod {association}")]
    DependentNotFound {
        /// Association label value that matched nothing.
        association: String,
    },

    /// The cluster call failed.
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Proof that a service's tunnel pod has been deleted.
///
/// Only [`TunnelManager::delete`] creates one; releasing the finalizer requires it.
#[derive(Debug)]
#[must_use]
pub struct TunnelRemoved {
    pod: String,
}

impl TunnelRemoved {
    /// Name of the deleted pod.
    pub fn pod(&self) -> &str {
        &self.pod
    }
}

/// Creates and deletes tunnel pods.
#[derive(Clone)]
pub struct TunnelManager {
    client: Arc<dyn ClusterClient>,
    config: Arc<TunnelConfig>,
}

impl TunnelManager {
    /// Creates a manager working in the configured tunnel namespace.
    pub fn new(client: Arc<dyn ClusterClient>, config: Arc<TunnelConfig>) -> Self {
        Self { client, config }
    }

    /// Namespace holding the tunnel pods.
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Makes sure `owner` has a tunnel pod exposing `target`.
    ///
    /// Succeeds without creating anything if a pod already exists, or if a
    /// concurrent create won the race.
    pub async fn ensure_create(
        &self,
        target: &TunnelTarget,
        owner: &ServiceKey,
        token: &AuthToken,
    ) -> Result<(), TunnelError> {
        let association = owner.association();
        let existing = self
            .client
            .list_pods(self.namespace(), &owner.association_selector())
            .await?;

        if !existing.is_empty() {
            debug!(
                key = %owner,
                %association,
                pods = existing.len(),
                "tunnel pod already exists"
            );
            return Ok(());
        }

        let pod = build_tunnel_pod(target, owner, token, &self.config);
        match self.client.create_pod(self.namespace(), &pod).await {
            Ok(()) => {
                info!(key = %owner, %association, %target, pod = %pod.name_any(), "created tunnel pod");
                Ok(())
            }
            Err(ClientError::AlreadyExists { name, .. }) => {
                debug!(key = %owner, pod = %name, "tunnel pod created concurrently");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes the tunnel pod of `owner`.
    ///
    /// A missing pod is reported as [`TunnelError::DependentNotFound`], not success.
    pub async fn delete(&self, owner: &ServiceKey) -> Result<TunnelRemoved, TunnelError> {
        let association = owner.association();
        let pods = self
            .client
            .list_pods(self.namespace(), &owner.association_selector())
            .await?;

        let pod = pods
            .first()
            .map(|p| p.name_any())
            .ok_or_else(|| TunnelError::DependentNotFound {
                association: association.clone(),
            })?;

        self.client.delete_pod(self.namespace(), &pod).await?;
        info!(key = %owner, %association, %pod, "deleted tunnel pod");

        Ok(TunnelRemoved { pod })
    }
}
