//! The `Agent` descriptor: desired state submitted by the user.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::meta::{ObjectKey, ObjectMeta};

/// API group/version of the descriptor, used in owner references.
pub const AGENT_API_VERSION: &str = "agentpool.dev/v1alpha1";

/// Kind name of the descriptor, used in owner references.
pub const AGENT_KIND: &str = "Agent";

/// Desired-state descriptor for a pool of build agents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: AgentSpec,

    /// Written only by the operator.
    #[serde(default)]
    pub status: AgentStatus,
}

impl Agent {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: AgentSpec) -> Self {
        Self {
            metadata: ObjectMeta::named(namespace, name),
            spec,
            status: AgentStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }
}

/// Desired state of an agent pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    /// Number of agent instances to run.
    pub size: u32,

    /// Container image; the operator substitutes a baseline image when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    /// MTU override for networks used by container jobs.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mtu_value: String,

    /// Additional configuration copied verbatim into the Configuration resource.
    #[serde(default)]
    pub config_map: ConfigPayload,
}

/// Connection parameters for the agent pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    pub url: String,

    pub token: String,

    pub pool_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub work_dir: String,
}

/// Proxy settings exported to the agent process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub http_proxy: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub https_proxy: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ftp_proxy: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub no_proxy: String,
}

/// Embedded configuration payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPayload {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub binary_data: BTreeMap<String, Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub immutable: Option<bool>,
}

/// Observed state of an agent pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    /// Names of the running agent instances, in store listing order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agents: Vec<String>,

    /// Name of the Credential resource once it exists.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret_available: String,
}
