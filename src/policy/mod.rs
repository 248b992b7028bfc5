//! Network isolation policy for agent instances
//!
//! Every cluster-backed instance gets a CiliumNetworkPolicy that fences its
//! pods into the tenant boundary: ingress only from the same tenant and the
//! control plane, egress only to the same tenant, cluster DNS, and the
//! public internet. Cross-tenant traffic has no matching rule and is
//! dropped by the eBPF datapath.
//!
//! This module holds the typed resource model and the pure policy builder.
//! Applying the policy to the API server (as a `DynamicObject`, since the
//! CRD is not part of `k8s-openapi`) is backend work.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::naming::{self, InstanceIdentity, APP_NAME, LABEL_APP, LABEL_TENANT};
use crate::DEFAULT_GATEWAY_PORT;

/// Label value identifying control-plane pods allowed to reach agent
/// gateways. Control planes deployed outside the agent namespace must carry
/// their own namespace label in addition.
pub const CONTROL_PLANE_APP: &str = "perch-control-plane";

/// Cilium Network Policy for L4 eBPF-based network enforcement
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CiliumNetworkPolicy {
    /// API version
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// Metadata
    pub metadata: PolicyMetadata,
    /// Spec
    pub spec: CiliumNetworkPolicySpec,
}

/// Metadata for policy resources
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PolicyMetadata {
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl PolicyMetadata {
    /// Create new metadata with the standard managed-by label
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            APP_NAME.to_string(),
        );
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels,
        }
    }
}

/// CiliumNetworkPolicy spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CiliumNetworkPolicySpec {
    /// Endpoint selector (which pods this applies to)
    pub endpoint_selector: EndpointSelector,
    /// Ingress rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<CiliumIngressRule>,
    /// Egress rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress: Vec<CiliumEgressRule>,
}

/// Endpoint selector for CiliumNetworkPolicy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSelector {
    /// Match labels
    pub match_labels: BTreeMap<String, String>,
}

impl EndpointSelector {
    fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            match_labels: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

/// Cilium ingress rule
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CiliumIngressRule {
    /// From endpoints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub from_endpoints: Vec<EndpointSelector>,
    /// To ports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_ports: Vec<CiliumPortRule>,
}

/// Cilium egress rule
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CiliumEgressRule {
    /// To endpoints (in-cluster peers)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_endpoints: Vec<EndpointSelector>,
    /// To entities (Cilium-defined destination classes like `world`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_entities: Vec<String>,
    /// To ports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_ports: Vec<CiliumPortRule>,
}

/// Cilium port rule
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CiliumPortRule {
    /// Ports
    pub ports: Vec<CiliumPort>,
}

/// One port and protocol inside a port rule
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CiliumPort {
    /// Port number
    pub port: String,
    /// Protocol (TCP, UDP)
    pub protocol: String,
}

impl CiliumPort {
    fn tcp(port: u16) -> Self {
        Self {
            port: port.to_string(),
            protocol: "TCP".to_string(),
        }
    }

    fn udp(port: u16) -> Self {
        Self {
            port: port.to_string(),
            protocol: "UDP".to_string(),
        }
    }
}

/// Build the isolation policy for one instance.
///
/// The policy endpoint-selects the instance's pods by tenant and instance
/// label. Ingress to the gateway port is allowed from same-tenant agent
/// pods and from the control plane; egress is allowed to same-tenant agent
/// pods, to kube-dns on port 53, and to `world`.
pub fn tenant_isolation_policy(
    identity: &InstanceIdentity,
    namespace: &str,
) -> CiliumNetworkPolicy {
    let tenant = identity.tenant_id();
    let gateway_ports = CiliumPortRule {
        ports: vec![CiliumPort::tcp(DEFAULT_GATEWAY_PORT)],
    };
    let same_tenant = EndpointSelector::from_pairs(&[(LABEL_APP, APP_NAME), (LABEL_TENANT, tenant)]);

    let ingress = vec![
        CiliumIngressRule {
            from_endpoints: vec![same_tenant.clone()],
            to_ports: vec![gateway_ports.clone()],
        },
        CiliumIngressRule {
            from_endpoints: vec![EndpointSelector::from_pairs(&[(
                LABEL_APP,
                CONTROL_PLANE_APP,
            )])],
            to_ports: vec![gateway_ports],
        },
    ];

    let egress = vec![
        CiliumEgressRule {
            to_endpoints: vec![same_tenant],
            to_entities: vec![],
            to_ports: vec![],
        },
        CiliumEgressRule {
            to_endpoints: vec![EndpointSelector::from_pairs(&[
                ("k8s:io.kubernetes.pod.namespace", "kube-system"),
                ("k8s:k8s-app", "kube-dns"),
            ])],
            to_entities: vec![],
            to_ports: vec![CiliumPortRule {
                ports: vec![CiliumPort::udp(53), CiliumPort::tcp(53)],
            }],
        },
        CiliumEgressRule {
            to_endpoints: vec![],
            to_entities: vec!["world".to_string()],
            to_ports: vec![],
        },
    ];

    CiliumNetworkPolicy {
        api_version: "cilium.io/v2".to_string(),
        kind: "CiliumNetworkPolicy".to_string(),
        metadata: PolicyMetadata::new(identity.name(), namespace),
        spec: CiliumNetworkPolicySpec {
            endpoint_selector: EndpointSelector {
                match_labels: BTreeMap::from([
                    (
                        naming::LABEL_TENANT.to_string(),
                        identity.tenant_id().to_string(),
                    ),
                    (
                        naming::LABEL_INSTANCE.to_string(),
                        identity.instance_id().to_string(),
                    ),
                ]),
            },
            ingress,
            egress,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> InstanceIdentity {
        InstanceIdentity::resolve("acme", "bot1").unwrap()
    }

    #[test]
    fn policy_selects_exactly_the_instance_pods() {
        let policy = tenant_isolation_policy(&identity(), "agents");

        let labels = &policy.spec.endpoint_selector.match_labels;
        assert_eq!(labels.get("tenant-id").map(String::as_str), Some("acme"));
        assert_eq!(labels.get("instance-id").map(String::as_str), Some("bot1"));
        assert_eq!(labels.len(), 2);
    }

    #[test]
    fn policy_is_named_and_placed_like_the_bundle() {
        let policy = tenant_isolation_policy(&identity(), "agents");

        assert_eq!(policy.api_version, "cilium.io/v2");
        assert_eq!(policy.kind, "CiliumNetworkPolicy");
        assert_eq!(policy.metadata.name, "agent-acme-bot1");
        assert_eq!(policy.metadata.namespace, "agents");
        assert_eq!(
            policy
                .metadata
                .labels
                .get("app.kubernetes.io/managed-by")
                .map(String::as_str),
            Some("perch")
        );
    }

    #[test]
    fn ingress_is_limited_to_tenant_and_control_plane() {
        let policy = tenant_isolation_policy(&identity(), "agents");
        assert_eq!(policy.spec.ingress.len(), 2);

        let tenant_rule = &policy.spec.ingress[0];
        let from = &tenant_rule.from_endpoints[0].match_labels;
        assert_eq!(from.get("app").map(String::as_str), Some("perch"));
        assert_eq!(from.get("tenant-id").map(String::as_str), Some("acme"));
        // Tenant peers reach only the gateway port
        assert_eq!(tenant_rule.to_ports[0].ports[0].port, "18789");
        assert_eq!(tenant_rule.to_ports[0].ports[0].protocol, "TCP");

        let cp_rule = &policy.spec.ingress[1];
        let from = &cp_rule.from_endpoints[0].match_labels;
        assert_eq!(
            from.get("app").map(String::as_str),
            Some("perch-control-plane")
        );
    }

    #[test]
    fn egress_allows_tenant_dns_and_world_only() {
        let policy = tenant_isolation_policy(&identity(), "agents");
        assert_eq!(policy.spec.egress.len(), 3);

        let tenant_rule = &policy.spec.egress[0];
        assert_eq!(
            tenant_rule.to_endpoints[0]
                .match_labels
                .get("tenant-id")
                .map(String::as_str),
            Some("acme")
        );

        let dns_rule = &policy.spec.egress[1];
        let dns_labels = &dns_rule.to_endpoints[0].match_labels;
        assert_eq!(
            dns_labels
                .get("k8s:io.kubernetes.pod.namespace")
                .map(String::as_str),
            Some("kube-system")
        );
        assert_eq!(
            dns_labels.get("k8s:k8s-app").map(String::as_str),
            Some("kube-dns")
        );
        let dns_ports = &dns_rule.to_ports[0].ports;
        assert!(dns_ports
            .iter()
            .any(|p| p.port == "53" && p.protocol == "UDP"));
        assert!(dns_ports
            .iter()
            .any(|p| p.port == "53" && p.protocol == "TCP"));

        let world_rule = &policy.spec.egress[2];
        assert_eq!(world_rule.to_entities, vec!["world".to_string()]);
        assert!(world_rule.to_endpoints.is_empty());
    }

    #[test]
    fn policy_serializes_in_cilium_wire_shape() {
        let policy = tenant_isolation_policy(&identity(), "agents");
        let value = serde_json::to_value(&policy).unwrap();

        assert_eq!(value["apiVersion"], "cilium.io/v2");
        assert!(value["spec"]["endpointSelector"]["matchLabels"].is_object());
        assert!(value["spec"]["ingress"][0]["fromEndpoints"].is_array());
        assert_eq!(value["spec"]["egress"][2]["toEntities"][0], "world");
        // Empty rule arms are omitted, not serialized as []
        assert!(value["spec"]["egress"][0].get("toEntities").is_none());
        assert!(value["spec"]["egress"][0].get("toPorts").is_none());
    }

    #[test]
    fn policies_for_different_tenants_never_overlap() {
        let a = tenant_isolation_policy(&InstanceIdentity::resolve("acme", "bot1").unwrap(), "agents");
        let b = tenant_isolation_policy(&InstanceIdentity::resolve("other", "bot1").unwrap(), "agents");

        assert_ne!(a.metadata.name, b.metadata.name);
        assert_ne!(
            a.spec.endpoint_selector.match_labels,
            b.spec.endpoint_selector.match_labels
        );
        // Neither tenant's ingress admits the other
        let a_from = &a.spec.ingress[0].from_endpoints[0].match_labels;
        assert_eq!(a_from.get("tenant-id").map(String::as_str), Some("acme"));
    }
}
