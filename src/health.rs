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

//! Health check support.
//!
//! Serves `/healthz` (process liveness), `/healthz/ready` and `/healthz/deep`
//! (controller health, plain text and JSON).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::http::StatusCode;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::controller::Controller;

/// Boxed future for health checks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Health check status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The component is healthy.
    Healthy,
    /// The component is unhealthy.
    Unhealthy,
}

/// Health check result.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// The overall health status.
    pub status: HealthStatus,

    /// Individual component health.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub checks: HashMap<String, HealthStatus>,
}

/// Something whose health can be probed.
pub trait HealthChecker: Send + Sync + 'static {
    /// Returns `true` if the component is healthy.
    fn check(&self) -> BoxFuture<'_, bool>;

    /// Returns the name of this checker.
    fn name(&self) -> &str;
}

/// Reports a controller's own [`Controller::health_check`].
pub struct ControllerHealthChecker {
    controller: Arc<dyn Controller>,
}

impl ControllerHealthChecker {
    /// Wraps a controller.
    pub fn new(controller: Arc<dyn Controller>) -> Self {
        Self { controller }
    }
}

impl HealthChecker for ControllerHealthChecker {
    fn check(&self) -> BoxFuture<'_, bool> {
        self.controller.health_check()
    }

    fn name(&self) -> &str {
        self.controller.name()
    }
}

/// Health check registry.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    checkers: Arc<RwLock<Vec<Arc<dyn HealthChecker>>>>,
}

impl HealthRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a health checker.
    pub async fn register(&self, checker: Arc<dyn HealthChecker>) {
        self.checkers.write().await.push(checker);
    }

    /// Runs all health checks and returns the results.
    pub async fn check_all(&self) -> HealthCheck {
        let checkers = self.checkers.read().await;
        let mut checks = HashMap::new();
        let mut overall_healthy = true;

        for checker in checkers.iter() {
            let healthy = checker.check().await;
            overall_healthy &= healthy;
            checks.insert(
                checker.name().to_string(),
                if healthy {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Unhealthy
                },
            );
        }

        HealthCheck {
            status: if overall_healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            checks,
        }
    }

    /// Returns the number of registered checkers.
    pub async fn len(&self) -> usize {
        self.checkers.read().await.len()
    }

    /// Returns true if there are no registered checkers.
    pub async fn is_empty(&self) -> bool {
        self.checkers.read().await.is_empty()
    }
}

/// Health check server.
pub struct HealthServer {
    registry: HealthRegistry,
    bind_address: String,
    bind_port: u16,
}

impl HealthServer {
    /// Creates a new health server.
    pub fn new(bind_address: String, bind_port: u16) -> Self {
        Self {
            registry: HealthRegistry::new(),
            bind_address,
            bind_port,
        }
    }

    /// Returns the health registry.
    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }

    /// Serves requests until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.bind_address, self.bind_port);
        let listener = TcpListener::bind(&addr).await?;

        tracing::info!("health server listening on {}", addr);

        loop {
            let (stream, _) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = cancel.cancelled() => {
                    tracing::debug!("health server stopping");
                    return Ok(());
                }
            };
            let registry = self.registry.clone();
            let io = TokioIo::new(stream);

            tokio::task::spawn(async move {
                let http = hyper::server::conn::http1::Builder::new();
                let service = service_fn(move |req: Request<Incoming>| {
                    let registry = registry.clone();
                    async move { Ok::<_, hyper::Error>(handle_request(req.uri().path(), &registry).await) }
                });

                if let Err(e) = http.serve_connection(io, service).await {
                    tracing::debug!(error = %e, "health connection closed with error");
                }
            });
        }
    }
}

fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

async fn handle_request(path: &str, registry: &HealthRegistry) -> Response<Full<Bytes>> {
    match path {
        "/healthz" | "/healthz/live" => response(StatusCode::OK, "text/plain", "ok"),
        "/healthz/ready" => {
            let result = registry.check_all().await;
            if result.status == HealthStatus::Healthy {
                response(StatusCode::OK, "text/plain", "ok")
            } else {
                response(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "not ready")
            }
        }
        "/healthz/deep" => {
            let result = registry.check_all().await;
            let status = if result.status == HealthStatus::Healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            let json = serde_json::to_string(&result).unwrap_or_default();
            response(status, "application/json", json)
        }
        _ => response(StatusCode::NOT_FOUND, "text/plain", "not found"),
    }
}
