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

//! Tunnel controller - watches Services and their tunnel pods.
//!
//! The kube runtime delivers reconcile requests, coalesces requests for the
//! same key and schedules retries; the [`Reconciler`] decides what to do.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::Api;
use kube::runtime::controller::{Action, Config as ControllerSettings, Controller as KubeController};
use kube::runtime::watcher;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use crate::config::TunnelConfig;
use crate::controller::{CancellationToken, Controller, Result};
use crate::controller_context::ControllerContext;
use crate::naming::{managed_selector, ServiceKey};
use crate::reconciler::{ReconcileError, ReconcileOutcome, Reconciler};

/// Name of the tunnel controller.
pub const TUNNEL_CONTROLLER_NAME: &str = "ngrok-tunnel";

/// State shared by reconcile calls.
pub struct ReconcileContext {
    reconciler: Reconciler,
    tunnel: Arc<TunnelConfig>,
}

impl ReconcileContext {
    /// Bundles a reconciler with the settings that shape requeue actions.
    pub fn new(reconciler: Reconciler, tunnel: Arc<TunnelConfig>) -> Self {
        Self { reconciler, tunnel }
    }
}

/// Reconciles one Service.
///
/// The watched object only names the key; the reconciler fetches the service again.
pub async fn reconcile(
    service: Arc<Service>,
    ctx: Arc<ReconcileContext>,
) -> std::result::Result<Action, ReconcileError> {
    let key = ServiceKey::from_service(&service);
    let outcome = ctx.reconciler.reconcile(&key).await?;
    Ok(outcome_action(outcome, &ctx.tunnel))
}

/// Maps a failed reconcile to a retry decision.
pub fn error_policy(service: Arc<Service>, error: &ReconcileError, ctx: Arc<ReconcileContext>) -> Action {
    let key = ServiceKey::from_service(&service);
    error!(
        %key,
        error = %error,
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    error_action(error, &ctx.tunnel)
}

fn outcome_action(outcome: ReconcileOutcome, tunnel: &TunnelConfig) -> Action {
    match outcome {
        ReconcileOutcome::Done => Action::await_change(),
        ReconcileOutcome::Requeue => Action::requeue(tunnel.cleanup_requeue),
    }
}

fn error_action(error: &ReconcileError, tunnel: &TunnelConfig) -> Action {
    if error.is_retryable() {
        Action::requeue(tunnel.error_requeue)
    } else {
        // Needs a spec change, which triggers a new reconcile anyway.
        Action::await_change()
    }
}

/// Maps a tunnel pod event to the service that owns it.
pub fn pod_owner(pod: Pod) -> Option<kube::runtime::reflector::ObjectRef<Service>> {
    ServiceKey::from_owner_annotations(pod.annotations()).map(|key| key.object_ref())
}

/// Controller exposing `ngrok=true` services through tunnel pods.
#[derive(Default)]
pub struct TunnelController {
    running: Arc<AtomicBool>,
}

impl TunnelController {
    /// Creates a controller.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Controller for TunnelController {
    fn name(&self) -> &str {
        TUNNEL_CONTROLLER_NAME
    }

    async fn run(&self, ctx: ControllerContext, cancel: CancellationToken) -> Result<()> {
        let tunnel = Arc::new(ctx.config.tunnel.clone());
        let reconciler = Reconciler::new(ctx.cluster.clone(), tunnel.clone(), ctx.token.clone());
        let state = Arc::new(ReconcileContext::new(reconciler, tunnel.clone()));

        let services: Api<Service> = Api::all(ctx.client.clone());
        let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &tunnel.namespace);
        let settings = ControllerSettings::default().concurrency(ctx.config.generic.concurrent_syncs);

        info!(
            namespace = %tunnel.namespace,
            concurrency = ctx.config.generic.concurrent_syncs,
            "watching services"
        );

        self.running.store(true, Ordering::SeqCst);
        KubeController::new(services, watcher::Config::default())
            .watches(
                pods,
                watcher::Config::default().labels(&managed_selector()),
                pod_owner,
            )
            .with_config(settings)
            .graceful_shutdown_on(cancel.cancelled_owned())
            .run(reconcile, error_policy, state)
            .for_each(|result| async move {
                match result {
                    Ok((obj, action)) => debug!(key = %obj, ?action, "reconciled"),
                    Err(e) => warn!(error = %e, "reconcile loop error"),
                }
            })
            .await;
        self.running.store(false, Ordering::SeqCst);

        info!("service watch stopped");
        Ok(())
    }

    fn health_check(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        let running = self.running.load(Ordering::SeqCst);
        Box::pin(async move { running })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientError, MockClusterClient};
    use crate::config::AuthToken;
    use crate::tunnel::TunnelError;
    use crate::workload::TargetError;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::time::Duration;

    fn tunnel() -> TunnelConfig {
        TunnelConfig {
            error_requeue: Duration::from_secs(7),
            cleanup_requeue: Duration::from_secs(2),
            ..Default::default()
        }
    }

    #[test]
    fn test_outcome_action() {
        assert_eq!(outcome_action(ReconcileOutcome::Done, &tunnel()), Action::await_change());
        assert_eq!(
            outcome_action(ReconcileOutcome::Requeue, &tunnel()),
            Action::requeue(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_error_action() {
        let transient = ReconcileError::Tunnel(TunnelError::DependentNotFound {
            association: "ns-default-svc-web".to_string(),
        });
        assert_eq!(error_action(&transient, &tunnel()), Action::requeue(Duration::from_secs(7)));

        let invalid = ReconcileError::InvalidService {
            key: ServiceKey::new("default", "web"),
            reason: TargetError::NoPorts.into(),
        };
        assert_eq!(error_action(&invalid, &tunnel()), Action::await_change());
    }

    #[test]
    fn test_pod_owner() {
        let key = ServiceKey::new("default", "web");
        let pod = Pod {
            metadata: ObjectMeta {
                annotations: Some(key.owner_annotations()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(pod_owner(pod), Some(key.object_ref()));
        assert_eq!(pod_owner(Pod::default()), None);
    }

    #[tokio::test]
    async fn test_reconcile_refetches_by_key() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_service()
            .withf(|ns, name| ns == "default" && name == "web")
            .times(1)
            .returning(|_, _| Ok(None));

        let reconciler = Reconciler::new(
            Arc::new(mock),
            Arc::new(tunnel()),
            AuthToken::new(Some("tok".to_string())).unwrap(),
        );
        let ctx = Arc::new(ReconcileContext::new(reconciler, Arc::new(tunnel())));

        // The watched copy claims to be labeled; the fetched state wins.
        let watched = Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                labels: Some(
                    [(crate::naming::NGROK_LABEL.to_string(), "true".to_string())].into(),
                ),
                ..Default::default()
            },
            ..Default::default()
        };
        let action = reconcile(Arc::new(watched), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_reconcile_surfaces_errors() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_service().returning(|_, _| {
            Err(ClientError::Conflict {
                kind: "service",
                name: "default/web".to_string(),
            })
        });

        let reconciler = Reconciler::new(
            Arc::new(mock),
            Arc::new(tunnel()),
            AuthToken::new(Some("tok".to_string())).unwrap(),
        );
        let ctx = Arc::new(ReconcileContext::new(reconciler, Arc::new(tunnel())));
        let service = Arc::new(Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });

        let err = reconcile(service.clone(), ctx.clone()).await.unwrap_err();
        assert_eq!(error_policy(service, &err, ctx), Action::requeue(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn test_health_reflects_watch_state() {
        let controller = TunnelController::new();
        assert!(!controller.health_check().await);
        controller.running.store(true, Ordering::SeqCst);
        assert!(controller.health_check().await);
    }
}
