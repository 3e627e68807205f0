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

//! Tunnel pod description.

use std::fmt;

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, SecurityContext, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use thiserror::Error;

use crate::config::{AuthToken, TunnelConfig};
use crate::naming::ServiceKey;

/// Command run in the tunnel container.
pub const NGROK_COMMAND: &str = "ngrok";

/// Why a service has no endpoint to tunnel to.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetError {
    /// The service carries no spec.
    #[error("service has no spec")]
    MissingSpec,
    /// No cluster IP has been allocated.
    #[error("service has no cluster IP")]
    NoClusterIp,
    /// `clusterIP: None`.
    #[error("headless service has no cluster IP")]
    Headless,
    /// Nothing to forward to.
    #[error("service declares no ports")]
    NoPorts,
}

/// Cluster-internal endpoint a tunnel exposes, `<clusterIP>:<port>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    /// Cluster IP of the service.
    pub host: String,
    /// First declared port of the service.
    pub port: i32,
}

impl TunnelTarget {
    /// Derives the target from a service's cluster IP and first port.
    ///
    /// Only the first port is exposed. Headless services and services
    /// without ports have nothing to tunnel to.
    pub fn from_service(service: &Service) -> Result<Self, TargetError> {
        let spec = service.spec.as_ref().ok_or(TargetError::MissingSpec)?;

        let host = match spec.cluster_ip.as_deref() {
            None | Some("") => return Err(TargetError::NoClusterIp),
            Some("None") => return Err(TargetError::Headless),
            Some(ip) => ip.to_string(),
        };

        let port = spec
            .ports
            .as_ref()
            .and_then(|ports| ports.first())
            .map(|p| p.port)
            .ok_or(TargetError::NoPorts)?;

        Ok(Self { host, port })
    }
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Arguments passed to `ngrok`.
pub fn tunnel_args(target: &TunnelTarget, token: &AuthToken) -> Vec<String> {
    vec![
        "http".to_string(),
        target.to_string(),
        "--log".to_string(),
        "stdout".to_string(),
        "--authtoken".to_string(),
        token.expose().to_string(),
    ]
}

/// Builds the tunnel pod for `owner` exposing `target`.
///
/// The pod carries no owner reference: it lives in another namespace and
/// is removed by the reconciler, not by the garbage collector.
pub fn build_tunnel_pod(
    target: &TunnelTarget,
    owner: &ServiceKey,
    token: &AuthToken,
    config: &TunnelConfig,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(owner.tunnel_pod_name()),
            namespace: Some(config.namespace.clone()),
            labels: Some(owner.association_labels()),
            annotations: Some(owner.owner_annotations()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: config.container_name.clone(),
                image: Some(config.image.clone()),
                // Refresh the ngrok client on every creation.
                image_pull_policy: Some("Always".to_string()),
                command: Some(vec![NGROK_COMMAND.to_string()]),
                args: Some(tunnel_args(target, token)),
                security_context: Some(SecurityContext {
                    run_as_user: Some(config.run_as_user),
                    run_as_non_root: Some(true),
                    allow_privilege_escalation: Some(false),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            restart_policy: Some("Always".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::{ASSOCIATION_LABEL, OWNER_NAME_ANNOTATION};
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};

    fn service(cluster_ip: Option<&str>, ports: Vec<i32>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: cluster_ip.map(String::from),
                ports: Some(
                    ports
                        .into_iter()
                        .map(|port| ServicePort {
                            port,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn token() -> AuthToken {
        AuthToken::new(Some("tok".to_string())).unwrap()
    }

    #[test]
    fn test_target_uses_first_port() {
        let target = TunnelTarget::from_service(&service(Some("10.0.0.5"), vec![8080, 9090])).unwrap();
        assert_eq!(target.to_string(), "10.0.0.5:8080");
    }

    #[test]
    fn test_target_rejects_untunnelable_services() {
        assert_eq!(
            TunnelTarget::from_service(&service(None, vec![80])),
            Err(TargetError::NoClusterIp)
        );
        assert_eq!(
            TunnelTarget::from_service(&service(Some("None"), vec![80])),
            Err(TargetError::Headless)
        );
        assert_eq!(
            TunnelTarget::from_service(&service(Some("10.0.0.5"), vec![])),
            Err(TargetError::NoPorts)
        );
        assert_eq!(
            TunnelTarget::from_service(&Service::default()),
            Err(TargetError::MissingSpec)
        );
    }

    #[test]
    fn test_build_tunnel_pod() {
        let target = TunnelTarget {
            host: "10.0.0.5".to_string(),
            port: 8080,
        };
        let owner = ServiceKey::new("default", "web");
        let config = TunnelConfig::default();

        let pod = build_tunnel_pod(&target, &owner, &token(), &config);

        assert_eq!(pod.metadata.namespace.as_deref(), Some("ngrok-tunnel"));
        assert_eq!(pod.metadata.name.as_deref(), Some("ngrok-tunnel-ns-default-svc-web"));
        assert_eq!(
            pod.metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(ASSOCIATION_LABEL))
                .map(String::as_str),
            Some("ns-default-svc-web")
        );
        assert_eq!(
            pod.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(OWNER_NAME_ANNOTATION))
                .map(String::as_str),
            Some("web")
        );
        assert!(pod.metadata.owner_references.is_none());

        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Always"));
        let container = &spec.containers[0];
        assert_eq!(container.image.as_deref(), Some("docker.io/soider/ngrok-tunnel-pod"));
        assert_eq!(container.image_pull_policy.as_deref(), Some("Always"));
        assert_eq!(container.command, Some(vec!["ngrok".to_string()]));
        assert_eq!(
            container.args,
            Some(
                ["http", "10.0.0.5:8080", "--log", "stdout", "--authtoken", "tok"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            )
        );
        let security = container.security_context.as_ref().unwrap();
        assert_eq!(security.run_as_user, Some(1000));
        assert_eq!(security.run_as_non_root, Some(true));
    }
}
