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

//! Service reconciliation.
//!
//! Every request re-fetches the service by key and derives a [`ServiceState`]
//! from its label and deletion marker:
//!
//! | state | action |
//! |---|---|
//! | not found | nothing |
//! | `Unlabeled` | nothing, an existing tunnel pod is left alone |
//! | `Active` | add the finalizer, then ensure the tunnel pod |
//! | `Deleting` | delete the tunnel pod, then release the finalizer and requeue |
//!
//! Finalizer and pod mutations are sequenced through proof values:
//! [`FinalizerHeld`] must exist before a pod is created, and a
//! [`TunnelRemoved`] must exist before the finalizer is released. A
//! reconcile interrupted anywhere is completed by the next one.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::client::{ClientError, ClusterClient};
use crate::config::{AuthToken, TunnelConfig};
use crate::naming::{AssociationError, ServiceKey, FINALIZER_NAME, NGROK_LABEL, NGROK_LABEL_ENABLED};
use crate::tunnel::{TunnelError, TunnelManager, TunnelRemoved};
use crate::workload::{TargetError, TunnelTarget};

/// Why a labeled service cannot get a tunnel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Untunnelable {
    /// No cluster endpoint to forward to.
    #[error(transparent)]
    Target(#[from] TargetError),

    /// The association does not fit in a pod label.
    #[error(transparent)]
    Association(#[from] AssociationError),
}

/// Errors returned by [`Reconciler::reconcile`].
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The service cannot be tunneled until it changes.
    #[error("service {key} cannot be exposed: {reason}")]
    InvalidService {
        /// The rejected service.
        key: ServiceKey,
        /// What is wrong with it.
        #[source]
        reason: Untunnelable,
    },

    /// Creating or deleting the tunnel pod failed.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    /// Reading or updating the service failed.
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl ReconcileError {
    /// Whether retrying without a change to the service can help.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ReconcileError::InvalidService { .. })
    }
}

/// What the caller should do after a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Wait for the next change.
    Done,
    /// Look at the service again soon.
    Requeue,
}

/// Observed state of a service, from its label and deletion marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// `ngrok=true` is absent.
    Unlabeled,
    /// Labeled and not being deleted.
    Active,
    /// Labeled and being deleted.
    Deleting {
        /// Whether our finalizer is still attached.
        finalizer_held: bool,
    },
}

impl ServiceState {
    /// Classifies a fetched service.
    pub fn of(service: &Service) -> Self {
        let labeled = service
            .labels()
            .get(NGROK_LABEL)
            .is_some_and(|v| v == NGROK_LABEL_ENABLED);
        let deleting = service.metadata.deletion_timestamp.is_some();

        match (labeled, deleting) {
            (false, _) => ServiceState::Unlabeled,
            (true, false) => ServiceState::Active,
            (true, true) => ServiceState::Deleting {
                finalizer_held: has_finalizer(service),
            },
        }
    }
}

fn has_finalizer(service: &Service) -> bool {
    service.finalizers().iter().any(|f| f == FINALIZER_NAME)
}

/// Proof that the finalizer is persisted on a service.
#[derive(Debug)]
#[must_use]
pub struct FinalizerHeld(());

/// Drives services towards "one tunnel pod while labeled, none once deleted".
///
/// Holds no per-service state: everything a reconcile needs is fetched
/// inside the call, so concurrent reconciles of different keys never share data.
#[derive(Clone)]
pub struct Reconciler {
    client: Arc<dyn ClusterClient>,
    tunnels: TunnelManager,
    token: AuthToken,
}

impl Reconciler {
    /// Creates a reconciler.
    pub fn new(client: Arc<dyn ClusterClient>, config: Arc<TunnelConfig>, token: AuthToken) -> Self {
        Self {
            tunnels: TunnelManager::new(client.clone(), config),
            client,
            token,
        }
    }

    /// Reconciles the service identified by `key`.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn reconcile(&self, key: &ServiceKey) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(service) = self.client.get_service(&key.namespace, &key.name).await? else {
            debug!("service not found");
            return Ok(ReconcileOutcome::Done);
        };

        let state = ServiceState::of(&service);
        debug!(?state, "observed service");

        match state {
            ServiceState::Unlabeled => {
                debug!("service has no ngrok label");
                Ok(ReconcileOutcome::Done)
            }
            ServiceState::Active => self.ensure(key, &service).await,
            ServiceState::Deleting {
                finalizer_held: true,
            } => self.cleanup(key, &service).await,
            ServiceState::Deleting {
                finalizer_held: false,
            } => {
                debug!("tunnel already cleaned up, waiting for other finalizers");
                Ok(ReconcileOutcome::Done)
            }
        }
    }

    async fn ensure(
        &self,
        key: &ServiceKey,
        service: &Service,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        // Checked before the finalizer goes on, so an untunnelable service can still be deleted.
        let invalid = |reason: Untunnelable| ReconcileError::InvalidService {
            key: key.clone(),
            reason,
        };
        key.validated_association().map_err(|e| invalid(e.into()))?;
        let target = TunnelTarget::from_service(service).map_err(|e| invalid(e.into()))?;

        let held = self.hold_finalizer(service).await?;
        self.create_tunnel(held, &target, key).await?;
        Ok(ReconcileOutcome::Done)
    }

    async fn cleanup(
        &self,
        key: &ServiceKey,
        service: &Service,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let removed = self.tunnels.delete(key).await?;
        self.release_finalizer(service, removed).await?;
        info!("tunnel removed, finalizer released");
        Ok(ReconcileOutcome::Requeue)
    }

    async fn hold_finalizer(&self, service: &Service) -> Result<FinalizerHeld, ClientError> {
        if has_finalizer(service) {
            return Ok(FinalizerHeld(()));
        }

        let mut finalizers = service.finalizers().to_vec();
        finalizers.push(FINALIZER_NAME.to_string());
        self.client.set_service_finalizers(service, finalizers).await?;
        debug!(finalizer = FINALIZER_NAME, "added finalizer");

        Ok(FinalizerHeld(()))
    }

    async fn create_tunnel(
        &self,
        _held: FinalizerHeld,
        target: &TunnelTarget,
        key: &ServiceKey,
    ) -> Result<(), TunnelError> {
        self.tunnels.ensure_create(target, key, &self.token).await
    }

    async fn release_finalizer(
        &self,
        service: &Service,
        removed: TunnelRemoved,
    ) -> Result<(), ClientError> {
        let finalizers: Vec<String> = service
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER_NAME)
            .cloned()
            .collect();
        self.client.set_service_finalizers(service, finalizers).await?;
        debug!(finalizer = FINALIZER_NAME, pod = removed.pod(), "removed finalizer");
        Ok(())
    }
}
