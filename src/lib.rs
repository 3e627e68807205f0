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

//! ngrok-tunnel-controller - exposes Kubernetes Services through ngrok.
//!
//! Services labeled `ngrok=true` get a tunnel pod in the `ngrok-tunnel`
//! namespace running `ngrok http <clusterIP>:<port>`. A finalizer on the
//! service keeps it around until its tunnel pod has been deleted.
//!
//! - [`naming`]: association labels and pod names derived from a service key
//! - [`workload`]: the tunnel pod description
//! - [`tunnel`]: idempotent create/delete of tunnel pods
//! - [`reconciler`]: the per-service state machine
//! - [`tunnel_controller`]: kube-runtime watch wiring
//! - [`controller_manager`]: process lifecycle and health endpoints

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod controller;
pub mod controller_context;
pub mod controller_manager;
pub mod health;
pub mod naming;
pub mod reconciler;
pub mod tunnel;
pub mod tunnel_controller;
pub mod workload;

// Re-export commonly used types
pub use client::{ClientError, ClusterClient, KubeClusterClient};
pub use config::{AuthToken, ControllerConfig};
pub use controller::{Controller, ControllerError};
pub use controller_context::ControllerContext;
pub use controller_manager::ControllerManager;
pub use naming::ServiceKey;
pub use reconciler::{ReconcileError, ReconcileOutcome, Reconciler, ServiceState};
pub use tunnel::{TunnelError, TunnelManager};
pub use tunnel_controller::TunnelController;

/// Semantic version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
