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

//! Deterministic names and labels linking a Service to its tunnel pod.
//!
//! Nothing is stored between reconciles, so the tunnel pod must be
//! re-discoverable from the owning service's `(namespace, name)` alone.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::Service;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use thiserror::Error;

/// Label selecting the services this controller exposes.
pub const NGROK_LABEL: &str = "ngrok";

/// Value of [`NGROK_LABEL`] that opts a service in.
pub const NGROK_LABEL_ENABLED: &str = "true";

/// Finalizer gating service deletion until its tunnel pod is gone.
pub const FINALIZER_NAME: &str = "ngrok.io/tunnel";

/// Label carrying the association string on every tunnel pod.
pub const ASSOCIATION_LABEL: &str = "exposed-from";

/// Label marking pods created by this controller.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`].
pub const MANAGED_BY: &str = "ngrok-tunnel-controller";

/// Annotation holding the owning service namespace.
pub const OWNER_NAMESPACE_ANNOTATION: &str = "tunnel.ngrok.io/service-namespace";

/// Annotation holding the owning service name.
pub const OWNER_NAME_ANNOTATION: &str = "tunnel.ngrok.io/service-name";

/// Longest value the apiserver accepts for a label.
pub const MAX_LABEL_VALUE_LEN: usize = 63;

const POD_NAME_PREFIX: &str = "ngrok-tunnel-";

/// An association string that cannot be stored in [`ASSOCIATION_LABEL`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssociationError {
    /// Longer than [`MAX_LABEL_VALUE_LEN`].
    #[error("association {value} is {len} characters, label values allow at most 63")]
    TooLong {
        /// The rejected association.
        value: String,
        /// Its length.
        len: usize,
    },

    /// Contains characters, or starts or ends with one, that label values forbid.
    #[error("association {value} is not a valid label value")]
    InvalidCharacters {
        /// The rejected association.
        value: String,
    },
}

/// Identity of a watched service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    /// Namespace of the service.
    pub namespace: String,
    /// Name of the service.
    pub name: String,
}

impl ServiceKey {
    /// Creates a key from its parts.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a fetched service. Cluster-scoped objects fall back to `default`.
    pub fn from_service(service: &Service) -> Self {
        Self::new(
            service.namespace().unwrap_or_else(|| "default".to_string()),
            service.name_any(),
        )
    }


    /// The association string for this service.
    pub fn association(&self) -> String {
        derive_association(&self.namespace, &self.name)
    }

    /// The association string, if the apiserver will accept it as a label value.
    pub fn validated_association(&self) -> Result<String, AssociationError> {
        let association = self.association();
        validate_label_value(&association)?;
        Ok(association)
    }

    /// Labels put on, and used to find, this service's tunnel pod.
    pub fn association_labels(&self) -> BTreeMap<String, String> {
        association_labels(&self.namespace, &self.name)
    }

    /// Label selector matching this service's tunnel pod.
    pub fn association_selector(&self) -> String {
        format!("{}={}", ASSOCIATION_LABEL, self.association())
    }

    /// Name of this service's tunnel pod.
    pub fn tunnel_pod_name(&self) -> String {
        tunnel_pod_name(&self.association())
    }

    /// Annotations pointing from a tunnel pod back to this service.
    pub fn owner_annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (OWNER_NAMESPACE_ANNOTATION.to_string(), self.namespace.clone()),
            (OWNER_NAME_ANNOTATION.to_string(), self.name.clone()),
        ])
    }

    /// Recovers the owning service key from a tunnel pod's annotations.
    pub fn from_owner_annotations(annotations: &BTreeMap<String, String>) -> Option<Self> {
        let namespace = annotations.get(OWNER_NAMESPACE_ANNOTATION)?;
        let name = annotations.get(OWNER_NAME_ANNOTATION)?;
        Some(Self::new(namespace.as_str(), name.as_str()))
    }

    /// Reconcile request for this key.
    pub fn object_ref(&self) -> ObjectRef<Service> {
        ObjectRef::new(&self.name).within(&self.namespace)
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Maps a service identity to its association string, `ns-<namespace>-svc-<name>`.
pub fn derive_association(namespace: &str, name: &str) -> String {
    format!("ns-{}-svc-{}", namespace, name)
}

/// Checks `value` against the apiserver's label value rules:
/// at most 63 characters of `[A-Za-z0-9._-]`, alphanumeric at both ends.
pub fn validate_label_value(value: &str) -> Result<(), AssociationError> {
    if value.len() > MAX_LABEL_VALUE_LEN {
        return Err(AssociationError::TooLong {
            value: value.to_string(),
            len: value.len(),
        });
    }

    let allowed = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    let edges = value.is_empty()
        || (value.starts_with(|c: char| c.is_ascii_alphanumeric())
            && value.ends_with(|c: char| c.is_ascii_alphanumeric()));
    if !allowed || !edges {
        return Err(AssociationError::InvalidCharacters {
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Full label set of a tunnel pod.
pub fn association_labels(namespace: &str, name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            ASSOCIATION_LABEL.to_string(),
            derive_association(namespace, name),
        ),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
    ])
}

/// Selector matching every tunnel pod this controller manages.
pub fn managed_selector() -> String {
    format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY)
}

/// Deterministic pod name, so the store rejects a second create for the same owner.
pub fn tunnel_pod_name(association: &str) -> String {
    format!("{}{}", POD_NAME_PREFIX, association).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_association() {
        assert_eq!(derive_association("default", "web"), "ns-default-svc-web");
    }

    #[test]
    fn test_association_is_stable_per_identity() {
        let a = ServiceKey::new("team-a", "api");
        let b = ServiceKey::new("team-a", "api");
        let c = ServiceKey::new("team-b", "api");
        assert_eq!(a.association(), b.association());
        assert_ne!(a.association(), c.association());
        assert_eq!(a.tunnel_pod_name(), "ngrok-tunnel-ns-team-a-svc-api");
    }

    #[test]
    fn test_association_labels() {
        let labels = ServiceKey::new("default", "web").association_labels();
        assert_eq!(
            labels.get(ASSOCIATION_LABEL).map(String::as_str),
            Some("ns-default-svc-web")
        );
        assert_eq!(labels.get(MANAGED_BY_LABEL).map(String::as_str), Some(MANAGED_BY));
        assert_eq!(
            ServiceKey::new("default", "web").association_selector(),
            "exposed-from=ns-default-svc-web"
        );
    }

    #[test]
    fn test_owner_annotations_round_trip() {
        let key = ServiceKey::new("shop", "checkout");
        let annotations = key.owner_annotations();
        assert_eq!(ServiceKey::from_owner_annotations(&annotations), Some(key));
        assert_eq!(ServiceKey::from_owner_annotations(&BTreeMap::new()), None);
    }

    #[test]
    fn test_display_and_object_ref() {
        let key = ServiceKey::new("default", "web");
        assert_eq!(key.to_string(), "default/web");
        let obj = key.object_ref();
        assert_eq!(obj.name, "web");
        assert_eq!(obj.namespace.as_deref(), Some("default"));
    }

    #[test]
    fn test_association_length_limit() {
        // "ns-" + 27 + "-svc-" + 28 is exactly 63 characters.
        let fits = ServiceKey::new("a".repeat(27), "b".repeat(28));
        assert_eq!(fits.validated_association().unwrap().len(), MAX_LABEL_VALUE_LEN);

        let long = ServiceKey::new("observability-platform-staging", "prometheus-kube-state-metrics");
        assert_eq!(
            long.validated_association(),
            Err(AssociationError::TooLong {
                value: "ns-observability-platform-staging-svc-prometheus-kube-state-metrics".to_string(),
                len: 67,
            })
        );
    }

    #[test]
    fn test_validate_label_value() {
        assert!(validate_label_value("ns-default-svc-web").is_ok());
        assert!(validate_label_value("").is_ok());
        assert!(validate_label_value("ns-default-svc-web_").is_err());
        assert!(validate_label_value("ns-default/web").is_err());
        assert!(validate_label_value("-ns").is_err());
    }
}
