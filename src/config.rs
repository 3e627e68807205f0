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

//! Configuration structures for the tunnel controller.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable holding the ngrok auth token.
pub const NGROK_TOKEN_ENV: &str = "NGROK_TOKEN";

/// Errors raised while assembling the configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No usable ngrok auth token was given.
    #[error("NGROK_TOKEN is not set, see https://dashboard.ngrok.com/get-started/your-authtoken")]
    MissingToken,

    /// A setting has a value that cannot work.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration for the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Process-level settings.
    #[serde(default)]
    pub generic: GenericConfig,

    /// Tunnel workload settings.
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

impl ControllerConfig {
    /// Checks values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tunnel.namespace.is_empty() {
            return Err(ConfigError::Invalid("tunnel namespace is empty".to_string()));
        }
        if self.tunnel.image.is_empty() {
            return Err(ConfigError::Invalid("tunnel image is empty".to_string()));
        }
        if self.tunnel.run_as_user <= 0 {
            return Err(ConfigError::Invalid(format!(
                "tunnel runAsUser must be a non-root uid, got {}",
                self.tunnel.run_as_user
            )));
        }
        if self.generic.concurrent_syncs == 0 {
            return Err(ConfigError::Invalid("concurrentSyncs must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Process-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericConfig {
    /// Kubeconfig file for talking to the apiserver.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,

    /// Number of services reconciled in parallel.
    #[serde(default = "default_concurrent_syncs")]
    pub concurrent_syncs: u16,

    /// The maximum time to wait for controllers to stop.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Address for the health check server.
    #[serde(default = "default_bind_address")]
    pub healthz_bind_address: String,

    /// Port for the health check server. The server is off when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthz_bind_port: Option<u16>,
}

impl Default for GenericConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            master: None,
            concurrent_syncs: default_concurrent_syncs(),
            shutdown_timeout: default_shutdown_timeout(),
            healthz_bind_address: default_bind_address(),
            healthz_bind_port: None,
        }
    }
}

fn default_concurrent_syncs() -> u16 {
    5
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

/// Tunnel workload configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    /// Namespace the tunnel pods live in.
    #[serde(default = "default_tunnel_namespace")]
    pub namespace: String,

    /// Image running the ngrok client.
    #[serde(default = "default_tunnel_image")]
    pub image: String,

    /// Name of the tunnel container.
    #[serde(default = "default_container_name")]
    pub container_name: String,

    /// Unprivileged uid the tunnel container runs as.
    #[serde(default = "default_run_as_user")]
    pub run_as_user: i64,

    /// Delay before retrying a failed reconcile.
    #[serde(default = "default_error_requeue", with = "humantime_serde")]
    pub error_requeue: Duration,

    /// Delay before re-checking a service whose finalizer was just released.
    #[serde(default = "default_cleanup_requeue", with = "humantime_serde")]
    pub cleanup_requeue: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            namespace: default_tunnel_namespace(),
            image: default_tunnel_image(),
            container_name: default_container_name(),
            run_as_user: default_run_as_user(),
            error_requeue: default_error_requeue(),
            cleanup_requeue: default_cleanup_requeue(),
        }
    }
}

fn default_tunnel_namespace() -> String {
    "ngrok-tunnel".to_string()
}

fn default_tunnel_image() -> String {
    "docker.io/soider/ngrok-tunnel-pod".to_string()
}

fn default_container_name() -> String {
    "tunnel".to_string()
}

fn default_run_as_user() -> i64 {
    1000
}

fn default_error_requeue() -> Duration {
    Duration::from_secs(15)
}

fn default_cleanup_requeue() -> Duration {
    Duration::from_secs(1)
}

/// ngrok auth token handed to every tunnel pod.
///
/// `Debug` is redacted so the token never reaches the logs.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wraps a token, rejecting missing or blank values.
    pub fn new(token: Option<String>) -> Result<Self, ConfigError> {
        match token.map(|t| t.trim().to_string()) {
            Some(t) if !t.is_empty() => Ok(Self(t)),
            _ => Err(ConfigError::MissingToken),
        }
    }

    /// The raw token.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

/// Duration serialization with human-readable format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
