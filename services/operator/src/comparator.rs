//! Desired shapes of the resources an `Agent` owns.
//!
//! Everything here is a pure function of the descriptor. Dependent resources
//! share the descriptor's name and namespace, carry the fixed label pair
//! `{component: agent, owner: <name>}` and a controller owner reference back
//! to the descriptor.

use std::collections::BTreeMap;

use agentpool_api::{
    Agent, AgentSpec, Configuration, Container, Credential, EnvVar, InstanceTemplate, Labels,
    ObjectMeta, OwnerReference, SecretKeyRef, Volume, VolumeMount, Workload, WorkloadSpec,
    AGENT_API_VERSION, AGENT_KIND,
};

/// Image used when the descriptor does not name one.
pub const DEFAULT_AGENT_IMAGE: &str = "bartvanbenthem/agent:latest";

pub const COMPONENT_LABEL: &str = "component";
pub const COMPONENT_VALUE: &str = "agent";
pub const OWNER_LABEL: &str = "owner";

/// Name of the single container in every agent instance.
pub const CONTAINER_NAME: &str = "agent";

const CONFIG_VOLUME_NAME: &str = "agent-config";
const CONFIG_MOUNT_PATH: &str = "/etc/agent";

pub const KEY_POOL_URL: &str = "AZP_URL";
pub const KEY_TOKEN: &str = "AZP_TOKEN";
pub const KEY_POOL_NAME: &str = "AZP_POOL";
pub const KEY_WORK_DIR: &str = "AZP_WORK";
pub const KEY_AGENT_NAME: &str = "AZP_AGENT_NAME";
pub const KEY_HTTP_PROXY: &str = "HTTP_PROXY";
pub const KEY_HTTPS_PROXY: &str = "HTTPS_PROXY";
pub const KEY_FTP_PROXY: &str = "FTP_PROXY";
pub const KEY_NO_PROXY: &str = "NO_PROXY";
pub const KEY_MTU_VALUE: &str = "AGENT_MTU_VALUE";

/// Credential keys, in the order they are exported to the container.
pub const CREDENTIAL_KEYS: [&str; 10] = [
    KEY_POOL_URL,
    KEY_TOKEN,
    KEY_POOL_NAME,
    KEY_WORK_DIR,
    KEY_AGENT_NAME,
    KEY_HTTP_PROXY,
    KEY_HTTPS_PROXY,
    KEY_FTP_PROXY,
    KEY_NO_PROXY,
    KEY_MTU_VALUE,
];

/// Labels identifying every resource owned by the named descriptor.
///
/// Also the selector used to list the descriptor's running instances.
pub fn labels_for_agent(name: &str) -> Labels {
    Labels::from([
        (COMPONENT_LABEL.to_string(), COMPONENT_VALUE.to_string()),
        (OWNER_LABEL.to_string(), name.to_string()),
    ])
}

/// Substitute `default_image` for an empty image reference.
///
/// Idempotent. Returns true if the spec was changed.
pub fn apply_defaults(spec: &mut AgentSpec, default_image: &str) -> bool {
    if !spec.image.is_empty() {
        return false;
    }
    spec.image = if default_image.is_empty() {
        DEFAULT_AGENT_IMAGE.to_string()
    } else {
        default_image.to_string()
    };
    true
}

/// Controller owner reference pointing at the descriptor.
pub fn owner_reference(agent: &Agent) -> OwnerReference {
    OwnerReference {
        api_version: AGENT_API_VERSION.to_string(),
        kind: AGENT_KIND.to_string(),
        name: agent.name().to_string(),
        uid: agent.metadata.uid.clone().unwrap_or_default(),
        controller: true,
    }
}

fn dependent_metadata(agent: &Agent) -> ObjectMeta {
    ObjectMeta {
        labels: labels_for_agent(agent.name()),
        owner_references: vec![owner_reference(agent)],
        ..ObjectMeta::named(agent.namespace(), agent.name())
    }
}

/// Desired workload: `spec.size` instances of one agent container whose
/// environment is read from the Credential resource.
pub fn desired_workload(agent: &Agent) -> Workload {
    let labels = labels_for_agent(agent.name());
    let image = if agent.spec.image.is_empty() {
        DEFAULT_AGENT_IMAGE.to_string()
    } else {
        agent.spec.image.clone()
    };

    let env = CREDENTIAL_KEYS
        .iter()
        .map(|key| EnvVar {
            name: key.to_string(),
            value_from: SecretKeyRef {
                name: agent.name().to_string(),
                key: key.to_string(),
            },
        })
        .collect();

    Workload {
        metadata: dependent_metadata(agent),
        spec: WorkloadSpec {
            replicas: agent.spec.size,
            selector: labels.clone(),
            template: InstanceTemplate {
                labels,
                containers: vec![Container {
                    name: CONTAINER_NAME.to_string(),
                    image,
                    env,
                    volume_mounts: vec![VolumeMount {
                        name: CONFIG_VOLUME_NAME.to_string(),
                        mount_path: CONFIG_MOUNT_PATH.to_string(),
                    }],
                }],
                volumes: vec![Volume {
                    name: CONFIG_VOLUME_NAME.to_string(),
                    config_map_name: agent.name().to_string(),
                }],
            },
        },
    }
}

/// Desired credential: pool, proxy and MTU settings under fixed keys.
pub fn desired_credential(agent: &Agent) -> Credential {
    let spec = &agent.spec;
    let string_data: BTreeMap<String, String> = [
        (KEY_POOL_URL, &spec.pool.url),
        (KEY_TOKEN, &spec.pool.token),
        (KEY_POOL_NAME, &spec.pool.pool_name),
        (KEY_WORK_DIR, &spec.pool.work_dir),
        (KEY_AGENT_NAME, &spec.pool.agent_name),
        (KEY_HTTP_PROXY, &spec.proxy.http_proxy),
        (KEY_HTTPS_PROXY, &spec.proxy.https_proxy),
        (KEY_FTP_PROXY, &spec.proxy.ftp_proxy),
        (KEY_NO_PROXY, &spec.proxy.no_proxy),
        (KEY_MTU_VALUE, &spec.mtu_value),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value.clone()))
    .collect();

    Credential {
        metadata: dependent_metadata(agent),
        string_data,
    }
}

/// Desired configuration: a verbatim copy of the embedded payload.
pub fn desired_configuration(agent: &Agent) -> Configuration {
    let payload = &agent.spec.config_map;
    Configuration {
        metadata: dependent_metadata(agent),
        data: payload.data.clone(),
        binary_data: payload.binary_data.clone(),
        immutable: payload.immutable,
    }
}
