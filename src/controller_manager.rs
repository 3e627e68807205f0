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

//! Controller manager - runs controllers until shutdown.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::controller::{Controller, ControllerError, Result};
use crate::controller_context::ControllerContext;
use crate::health::{ControllerHealthChecker, HealthServer};

/// The controller manager.
///
/// Runs every registered controller concurrently, optionally serves health
/// endpoints, and on shutdown waits up to `shutdownTimeout` for controllers
/// to drain.
pub struct ControllerManager {
    ctx: ControllerContext,

    controllers: Vec<Arc<dyn Controller>>,

    /// Root cancellation token for shutdown.
    shutdown_token: CancellationToken,

    /// Controllers that are currently running.
    running_controllers: Arc<RwLock<HashSet<String>>>,
}

impl ControllerManager {
    /// Creates a manager with no controllers.
    pub fn new(ctx: ControllerContext) -> Self {
        Self {
            ctx,
            controllers: Vec::new(),
            shutdown_token: CancellationToken::new(),
            running_controllers: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Adds a controller.
    pub fn register_controller(&mut self, controller: Arc<dyn Controller>) -> &mut Self {
        self.controllers.push(controller);
        self
    }

    /// Returns the shutdown cancellation token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Runs all controllers until they stop or shutdown is requested.
    pub async fn run(&self) -> Result<()> {
        if self.controllers.is_empty() {
            tracing::warn!("no controllers registered, exiting");
            return Ok(());
        }

        let health = self.spawn_health_server().await;

        let result = self.run_controllers().await;

        // The health server outlives the controllers only until here.
        self.shutdown_token.cancel();
        if let Some(handle) = health {
            match handle.await {
                Ok(Err(e)) => tracing::warn!(error = %e, "health server failed"),
                Err(e) => tracing::warn!(error = %e, "health server task failed"),
                Ok(Ok(())) => {}
            }
        }

        result
    }

    async fn spawn_health_server(&self) -> Option<tokio::task::JoinHandle<anyhow::Result<()>>> {
        let generic = &self.ctx.config.generic;
        let port = generic.healthz_bind_port?;

        let server = HealthServer::new(generic.healthz_bind_address.clone(), port);
        for controller in &self.controllers {
            server
                .registry()
                .register(Arc::new(ControllerHealthChecker::new(controller.clone())))
                .await;
        }

        let cancel = self.shutdown_token.clone();
        Some(tokio::spawn(server.run(cancel)))
    }

    async fn run_controllers(&self) -> Result<()> {
        let mut join_set = JoinSet::new();

        for controller in &self.controllers {
            let controller = controller.clone();
            let name = controller.name().to_string();
            let ctx = self.ctx.clone();
            let cancel = self.shutdown_token.clone();
            let running = self.running_controllers.clone();

            join_set.spawn(async move {
                tracing::info!(controller = %name, "starting controller");
                running.write().await.insert(name.clone());

                let result = controller.run(ctx, cancel).await;

                running.write().await.remove(&name);
                if let Err(e) = controller.shutdown().await {
                    tracing::warn!(controller = %name, error = %e, "controller shutdown hook failed");
                }

                match result {
                    Ok(()) => tracing::info!(controller = %name, "controller terminated successfully"),
                    Err(ref e) => tracing::error!(controller = %name, error = %e, "controller terminated with error"),
                }

                (name, result)
            });
        }

        tokio::select! {
            result = async {
                while let Some(joined) = join_set.join_next().await {
                    match joined {
                        Ok((name, Ok(()))) => {
                            tracing::debug!(controller = %name, "controller finished");
                        }
                        Ok((name, Err(e))) => {
                            return Err::<(), _>(ControllerError::Runtime {
                                name,
                                source: e.into(),
                            });
                        }
                        Err(e) => {
                            if e.is_panic() {
                                tracing::error!("controller task panicked");
                            }
                            return Err(ControllerError::Runtime {
                                name: "unknown".to_string(),
                                source: e.into(),
                            });
                        }
                    }
                }
                Ok(())
            } => {
                result?;
            }

            _ = self.shutdown_token.cancelled() => {
                tracing::info!("shutdown signal received, waiting for controllers to stop");
            }
        }

        self.drain(join_set).await;
        Ok(())
    }

    /// Waits for remaining controllers, up to the shutdown timeout.
    async fn drain(&self, mut join_set: JoinSet<(String, Result<()>)>) {
        let shutdown_timeout = self.ctx.config.generic.shutdown_timeout;
        let deadline = tokio::time::Instant::now() + shutdown_timeout;

        while !join_set.is_empty() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());

            if remaining.is_zero() {
                let running = self.running_controllers.read().await;
                tracing::warn!(
                    controllers = ?running.iter().collect::<Vec<_>>(),
                    "shutdown timeout reached, controllers still running"
                );
                join_set.abort_all();
                break;
            }

            tokio::select! {
                joined = join_set.join_next() => {
                    match joined {
                        Some(Ok((name, Ok(())))) => {
                            tracing::debug!(controller = %name, "controller stopped");
                        }
                        Some(Ok((name, Err(e)))) => {
                            tracing::warn!(controller = %name, error = %e, "controller stopped with error");
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "controller task failed");
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(remaining.min(Duration::from_secs(1))) => {
                    let running = self.running_controllers.read().await;
                    if !running.is_empty() {
                        tracing::debug!(
                            controllers = ?running.iter().collect::<Vec<_>>(),
                            "still waiting for controllers"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthToken, ControllerConfig};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context(config: ControllerConfig) -> ControllerContext {
        let kube_config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let client = kube::Client::try_from(kube_config).unwrap();
        ControllerContext::new(
            client,
            Arc::new(config),
            AuthToken::new(Some("tok".to_string())).unwrap(),
        )
    }

    /// Runs until cancelled, counting starts and shutdown hooks.
    #[derive(Default)]
    struct WaitForCancel {
        started: AtomicUsize,
        shut_down: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Controller for WaitForCancel {
        fn name(&self) -> &str {
            "wait-for-cancel"
        }

        async fn run(&self, _ctx: ControllerContext, cancel: CancellationToken) -> Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            cancel.cancelled().await;
            Ok(())
        }

        fn shutdown(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
            self.shut_down.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    struct Failing;

    #[async_trait]
    impl Controller for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn run(&self, _ctx: ControllerContext, _cancel: CancellationToken) -> Result<()> {
            Err(ControllerError::Runtime {
                name: "failing".to_string(),
                source: "watch stream ended".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_run_without_controllers_returns() {
        let manager = ControllerManager::new(context(ControllerConfig::default()));
        assert!(manager.run().await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_stops_controllers() {
        let controller = Arc::new(WaitForCancel::default());
        let shut_down = controller.shut_down.clone();

        let mut manager = ControllerManager::new(context(ControllerConfig::default()));
        manager.register_controller(controller.clone());
        let token = manager.shutdown_token();

        let run = tokio::spawn(async move { manager.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        assert!(run.await.unwrap().is_ok());
        assert_eq!(controller.started.load(Ordering::SeqCst), 1);
        assert_eq!(shut_down.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_controller_error_is_reported() {
        let mut manager = ControllerManager::new(context(ControllerConfig::default()));
        manager.register_controller(Arc::new(Failing));

        let err = manager.run().await.unwrap_err();
        assert!(matches!(err, ControllerError::Runtime { ref name, .. } if name == "failing"));
    }
}
