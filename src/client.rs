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

//! Cluster API operations used by the reconciler.
//!
//! The reconciler talks to the apiserver only through [`ClusterClient`],
//! so tests can substitute a mock or an in-memory store.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Errors returned by cluster API calls.
#[derive(Error, Debug)]
pub enum ClientError {
    /// A create hit an object with the same name.
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Object kind.
        kind: &'static str,
        /// `namespace/name` of the object.
        name: String,
    },

    /// A write carried a stale resourceVersion.
    #[error("{kind} {name} was modified concurrently")]
    Conflict {
        /// Object kind.
        kind: &'static str,
        /// `namespace/name` of the object.
        name: String,
    },

    /// Any other apiserver or transport failure.
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// Kubernetes operations needed to manage tunnels.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetches a service, `None` if it does not exist.
    async fn get_service(&self, namespace: &str, name: &str)
        -> Result<Option<Service>, ClientError>;

    /// Replaces the finalizer list of a fetched service.
    ///
    /// Fails with [`ClientError::Conflict`] if the service changed since it was fetched.
    async fn set_service_finalizers(
        &self,
        service: &Service,
        finalizers: Vec<String>,
    ) -> Result<(), ClientError>;

    /// Lists pods matching a label selector.
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, ClientError>;

    /// Creates a pod.
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), ClientError>;

    /// Deletes a pod. A pod that is already gone is not an error.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClientError>;
}

/// [`ClusterClient`] backed by the apiserver.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Wraps a kube client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, ClientError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(svc) => Ok(Some(svc)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_service_finalizers(
        &self,
        service: &Service,
        finalizers: Vec<String>,
    ) -> Result<(), ClientError> {
        let name = service.name_any();
        let namespace = service.namespace().unwrap_or_default();
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);

        // resourceVersion makes the apiserver reject the patch if someone else wrote first.
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": service.resource_version(),
                "finalizers": finalizers,
            }
        });

        match api
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(ClientError::Conflict {
                kind: "service",
                name: format!("{}/{}", namespace, name),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, ClientError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), ClientError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), pod).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Err(ClientError::AlreadyExists {
                    kind: "pod",
                    name: format!("{}/{}", namespace, pod.name_any()),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
