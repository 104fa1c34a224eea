//! Integration tests for the convergence pass.
//!
//! Every test drives a `Reconciler` against the in-memory store and checks
//! both the pass outcome and the exact store traffic it produced.

use std::sync::Arc;
use std::time::Duration;

use agentpool_api::{
    Agent, AgentSpec, ConfigPayload, Configuration, Credential, Instance, Kind, Labels, ObjectKey,
    ObjectMeta, PoolConfig, ProxyConfig, Resource, Workload,
};
use agentpool_operator::comparator::{
    desired_workload, labels_for_agent, CREDENTIAL_KEYS, DEFAULT_AGENT_IMAGE,
};
use agentpool_operator::store::memory::{Op, StoreCall};
use agentpool_operator::store::StoreResult;
use agentpool_operator::{
    MemoryStore, ReconcileError, Reconciler, ReconcilerConfig, StoreError, StoreGateway,
};
use agentpool_reconcile::Outcome;
use async_trait::async_trait;
use proptest::prelude::*;

const REQUEUE: Outcome = Outcome::RequeueAfter(Duration::from_secs(60));

fn spec(size: u32) -> AgentSpec {
    AgentSpec {
        size,
        image: String::new(),
        pool: PoolConfig {
            url: "https://dev.example.com/org".to_string(),
            token: "t0k".to_string(),
            pool_name: "linux".to_string(),
            agent_name: "builder".to_string(),
            work_dir: "/work".to_string(),
        },
        proxy: ProxyConfig {
            http_proxy: "http://proxy:3128".to_string(),
            https_proxy: "http://proxy:3129".to_string(),
            ftp_proxy: String::new(),
            no_proxy: "localhost,.svc".to_string(),
        },
        mtu_value: "1400".to_string(),
        config_map: ConfigPayload::default(),
    }
}

async fn setup(agent: Agent) -> (Arc<MemoryStore>, Reconciler, ObjectKey) {
    setup_with(agent, ReconcilerConfig::default()).await
}

async fn setup_with(
    agent: Agent,
    config: ReconcilerConfig,
) -> (Arc<MemoryStore>, Reconciler, ObjectKey) {
    let key = agent.key();
    let store = Arc::new(MemoryStore::new());
    store.insert(agent).await;
    let reconciler = Reconciler::new(store.clone(), config);
    (store, reconciler, key)
}

/// Run passes until one reports `Done`, letting the platform settle
/// instances before each pass.
async fn converge(store: &MemoryStore, reconciler: &Reconciler, key: &ObjectKey) {
    for _ in 0..10 {
        store.settle_workloads().await;
        if reconciler.reconcile(key).await.unwrap() == Outcome::Done {
            return;
        }
    }
    panic!("agent {key} did not converge");
}

fn call(op: Op, kind: Kind, name: &str) -> StoreCall {
    StoreCall {
        op,
        kind,
        namespace: "ci".to_string(),
        name: Some(name.to_string()),
    }
}

#[tokio::test]
async fn test_deleted_agent_is_done_without_dependent_calls() {
    let store = Arc::new(MemoryStore::new());
    let reconciler = Reconciler::new(store.clone(), ReconcilerConfig::default());

    let outcome = reconciler
        .reconcile(&ObjectKey::new("ci", "gone"))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Done);
    assert_eq!(store.calls().await, vec![call(Op::Get, Kind::Agent, "gone")]);
}

#[tokio::test]
async fn test_first_pass_creates_workload_and_requeues() {
    let (store, reconciler, key) = setup(Agent::new("ci", "builders", spec(2))).await;

    let outcome = reconciler.reconcile(&key).await.unwrap();

    assert_eq!(outcome, REQUEUE);
    assert_eq!(
        store.mutations().await,
        vec![call(Op::Create, Kind::Workload, "builders")]
    );
    let workload: Workload = store.object(&key).await.unwrap();
    assert_eq!(workload.spec.replicas, 2);
    assert_eq!(workload.spec.selector, labels_for_agent("builders"));
    assert_eq!(store.count(Kind::Credential).await, 0);
}

#[tokio::test]
async fn test_default_image_substituted() {
    let (store, reconciler, key) = setup(Agent::new("ci", "builders", spec(1))).await;

    reconciler.reconcile(&key).await.unwrap();

    let workload: Workload = store.object(&key).await.unwrap();
    assert_eq!(workload.spec.template.containers[0].image, DEFAULT_AGENT_IMAGE);
}

#[tokio::test]
async fn test_configured_default_image_and_explicit_image() {
    let config = ReconcilerConfig {
        default_image: "registry.local/agent:9".to_string(),
        ..ReconcilerConfig::default()
    };
    let (store, reconciler, key) = setup_with(Agent::new("ci", "builders", spec(1)), config).await;
    reconciler.reconcile(&key).await.unwrap();
    let workload: Workload = store.object(&key).await.unwrap();
    assert_eq!(
        workload.spec.template.containers[0].image,
        "registry.local/agent:9"
    );

    let mut explicit = spec(1);
    explicit.image = "registry.local/agent:pinned".to_string();
    let (store, reconciler, key) = setup(Agent::new("ci", "pinned", explicit)).await;
    reconciler.reconcile(&key).await.unwrap();
    let workload: Workload = store.object(&key).await.unwrap();
    assert_eq!(
        workload.spec.template.containers[0].image,
        "registry.local/agent:pinned"
    );
}

#[tokio::test]
async fn test_second_pass_creates_credential_and_configuration() {
    let mut agent_spec = spec(2);
    agent_spec.config_map.data.insert("agent.conf".into(), "debug=true".into());
    let (store, reconciler, key) = setup(Agent::new("ci", "builders", agent_spec.clone())).await;

    reconciler.reconcile(&key).await.unwrap();
    store.clear_calls().await;
    let outcome = reconciler.reconcile(&key).await.unwrap();

    assert_eq!(outcome, REQUEUE);
    assert_eq!(
        store.mutations().await,
        vec![
            call(Op::Create, Kind::Credential, "builders"),
            call(Op::Create, Kind::Configuration, "builders"),
            call(Op::UpdateStatus, Kind::Agent, "builders"),
        ]
    );

    let credential: Credential = store.object(&key).await.unwrap();
    let keys: Vec<&str> = credential.string_data.keys().map(String::as_str).collect();
    let mut expected: Vec<&str> = CREDENTIAL_KEYS.to_vec();
    expected.sort_unstable();
    assert_eq!(keys, expected);
    assert_eq!(credential.string_data["AZP_URL"], agent_spec.pool.url);
    assert_eq!(credential.string_data["AZP_TOKEN"], agent_spec.pool.token);
    assert_eq!(credential.string_data["AZP_POOL"], agent_spec.pool.pool_name);
    assert_eq!(credential.string_data["AZP_WORK"], agent_spec.pool.work_dir);
    assert_eq!(credential.string_data["AZP_AGENT_NAME"], agent_spec.pool.agent_name);
    assert_eq!(credential.string_data["HTTP_PROXY"], agent_spec.proxy.http_proxy);
    assert_eq!(credential.string_data["HTTPS_PROXY"], agent_spec.proxy.https_proxy);
    assert_eq!(credential.string_data["FTP_PROXY"], "");
    assert_eq!(credential.string_data["NO_PROXY"], agent_spec.proxy.no_proxy);
    assert_eq!(credential.string_data["AGENT_MTU_VALUE"], "1400");

    let configuration: Configuration = store.object(&key).await.unwrap();
    assert_eq!(configuration.data, agent_spec.config_map.data);

    let agent: Agent = store.object(&key).await.unwrap();
    assert_eq!(agent.status.secret_available, "builders");
}

#[tokio::test]
async fn test_dependents_are_owned_by_agent() {
    let (store, reconciler, key) = setup(Agent::new("ci", "builders", spec(1))).await;
    converge(&store, &reconciler, &key).await;

    let agent: Agent = store.object(&key).await.unwrap();
    let uid = agent.metadata.uid.clone().unwrap();

    let workload: Workload = store.object(&key).await.unwrap();
    let credential: Credential = store.object(&key).await.unwrap();
    let configuration: Configuration = store.object(&key).await.unwrap();
    for meta in [
        &workload.metadata,
        &credential.metadata,
        &configuration.metadata,
    ] {
        let owner = meta.controller_owner().unwrap();
        assert_eq!(owner.uid, uid);
        assert_eq!(owner.kind, "Agent");
        assert_eq!(meta.labels, labels_for_agent("builders"));
    }
}

#[tokio::test]
async fn test_converged_pass_is_idempotent() {
    let (store, reconciler, key) = setup(Agent::new("ci", "builders", spec(3))).await;
    converge(&store, &reconciler, &key).await;

    store.clear_calls().await;
    let outcome = reconciler.reconcile(&key).await.unwrap();

    assert_eq!(outcome, Outcome::Done);
    assert!(store.mutations().await.is_empty());

    let agent: Agent = store.object(&key).await.unwrap();
    assert_eq!(
        agent.status.agents,
        vec!["builders-0", "builders-1", "builders-2"]
    );
}

#[tokio::test]
async fn test_stale_credential_is_updated_in_place() {
    let (store, reconciler, key) = setup(Agent::new("ci", "builders", spec(1))).await;
    converge(&store, &reconciler, &key).await;

    let mut stale: Credential = store.object(&key).await.unwrap();
    let uid = stale.metadata.uid.clone();
    stale
        .string_data
        .insert("AZP_URL".into(), "https://old.example.com".into());
    store.insert(stale).await;
    store.clear_calls().await;

    let outcome = reconciler.reconcile(&key).await.unwrap();

    assert_eq!(outcome, REQUEUE);
    assert_eq!(
        store.mutations().await,
        vec![call(Op::Update, Kind::Credential, "builders")]
    );
    let credential: Credential = store.object(&key).await.unwrap();
    assert_eq!(credential.string_data["AZP_URL"], "https://dev.example.com/org");
    assert_eq!(credential.metadata.uid, uid);
    assert_eq!(store.count(Kind::Credential).await, 1);

    assert_eq!(reconciler.reconcile(&key).await.unwrap(), Outcome::Done);
}

#[tokio::test]
async fn test_spec_change_propagates_to_credential() {
    let (store, reconciler, key) = setup(Agent::new("ci", "builders", spec(1))).await;
    converge(&store, &reconciler, &key).await;

    let mut agent: Agent = store.object(&key).await.unwrap();
    agent.spec.proxy.https_proxy = "http://new-proxy:8080".to_string();
    store.update(agent.into()).await.unwrap();
    store.clear_calls().await;

    assert_eq!(reconciler.reconcile(&key).await.unwrap(), REQUEUE);
    let credential: Credential = store.object(&key).await.unwrap();
    assert_eq!(credential.string_data["HTTPS_PROXY"], "http://new-proxy:8080");
}

#[tokio::test]
async fn test_mutable_configuration_drift_corrected() {
    let mut agent_spec = spec(1);
    agent_spec.config_map.data.insert("agent.conf".into(), "debug=true".into());
    let (store, reconciler, key) = setup(Agent::new("ci", "builders", agent_spec)).await;
    converge(&store, &reconciler, &key).await;

    let mut drifted: Configuration = store.object(&key).await.unwrap();
    drifted.data.insert("agent.conf".into(), "debug=false".into());
    store.insert(drifted).await;
    store.clear_calls().await;

    assert_eq!(reconciler.reconcile(&key).await.unwrap(), REQUEUE);
    assert_eq!(
        store.mutations().await,
        vec![call(Op::Update, Kind::Configuration, "builders")]
    );
    let configuration: Configuration = store.object(&key).await.unwrap();
    assert_eq!(configuration.data["agent.conf"], "debug=true");
}

#[tokio::test]
async fn test_immutable_configuration_left_alone() {
    let mut agent_spec = spec(1);
    agent_spec.config_map.data.insert("agent.conf".into(), "debug=true".into());
    agent_spec.config_map.immutable = Some(true);
    let (store, reconciler, key) = setup(Agent::new("ci", "builders", agent_spec)).await;
    converge(&store, &reconciler, &key).await;

    let mut drifted: Configuration = store.object(&key).await.unwrap();
    drifted.data.insert("agent.conf".into(), "debug=false".into());
    store.insert(drifted).await;
    store.clear_calls().await;

    assert_eq!(reconciler.reconcile(&key).await.unwrap(), Outcome::Done);
    assert!(store.mutations().await.is_empty());
    let configuration: Configuration = store.object(&key).await.unwrap();
    assert_eq!(configuration.data["agent.conf"], "debug=false");
}

#[tokio::test]
async fn test_status_tracks_instance_names() {
    let (store, reconciler, key) = setup(Agent::new("ci", "a", spec(2))).await;
    converge(&store, &reconciler, &key).await;

    let mut agent: Agent = store.object(&key).await.unwrap();
    agent.status.agents = vec!["a-0".to_string()];
    store.update_status(&agent).await.unwrap();
    store.clear_calls().await;

    let outcome = reconciler.reconcile(&key).await.unwrap();

    assert_eq!(outcome, REQUEUE);
    assert_eq!(
        store.mutations().await,
        vec![call(Op::UpdateStatus, Kind::Agent, "a")]
    );
    let agent: Agent = store.object(&key).await.unwrap();
    assert_eq!(agent.status.agents, vec!["a-0", "a-1"]);

    store.clear_calls().await;
    assert_eq!(reconciler.reconcile(&key).await.unwrap(), Outcome::Done);
    assert!(store.mutations().await.is_empty());
}

#[tokio::test]
async fn test_status_ignores_foreign_instances() {
    let (store, reconciler, key) = setup(Agent::new("ci", "a", spec(1))).await;
    converge(&store, &reconciler, &key).await;

    let mut foreign = ObjectMeta::named("ci", "b-0");
    foreign.labels = labels_for_agent("b");
    store.insert(Instance { metadata: foreign }).await;
    let mut unlabeled = ObjectMeta::named("ci", "a-extra");
    unlabeled.labels = Labels::from([("owner".to_string(), "a".to_string())]);
    store.insert(Instance { metadata: unlabeled }).await;

    assert_eq!(reconciler.reconcile(&key).await.unwrap(), Outcome::Done);
    let agent: Agent = store.object(&key).await.unwrap();
    assert_eq!(agent.status.agents, vec!["a-0"]);
}

#[tokio::test]
async fn test_scale_change_applied_before_status() {
    let (store, reconciler, key) = setup(Agent::new("ci", "builders", spec(1))).await;
    converge(&store, &reconciler, &key).await;

    let mut agent: Agent = store.object(&key).await.unwrap();
    agent.spec.size = 3;
    store.update(agent.into()).await.unwrap();
    store.clear_calls().await;

    assert_eq!(reconciler.reconcile(&key).await.unwrap(), REQUEUE);
    assert_eq!(
        store.mutations().await,
        vec![call(Op::Update, Kind::Workload, "builders")]
    );
    assert!(!store
        .calls()
        .await
        .iter()
        .any(|c| c.op == Op::List && c.kind == Kind::Instance));

    converge(&store, &reconciler, &key).await;
    let agent: Agent = store.object(&key).await.unwrap();
    assert_eq!(agent.status.agents.len(), 3);
}

#[tokio::test]
async fn test_store_error_short_circuits_pass() {
    let (store, reconciler, key) = setup(Agent::new("ci", "builders", spec(1))).await;
    converge(&store, &reconciler, &key).await;

    store
        .fail_next(
            Op::Get,
            Kind::Credential,
            StoreError::Unavailable("connection reset".into()),
        )
        .await;
    store.clear_calls().await;

    let err = reconciler.reconcile(&key).await.unwrap_err();

    assert!(matches!(
        err,
        ReconcileError::Store(StoreError::Unavailable(_))
    ));
    assert!(err.is_retryable());
    let calls = store.calls().await;
    assert_eq!(
        calls.last(),
        Some(&call(Op::Get, Kind::Credential, "builders"))
    );
}

#[tokio::test]
async fn test_agent_fetch_error_propagates() {
    let (store, reconciler, key) = setup(Agent::new("ci", "builders", spec(1))).await;
    store
        .fail_next(Op::Get, Kind::Agent, StoreError::Unavailable("timeout".into()))
        .await;

    let err = reconciler.reconcile(&key).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Store(StoreError::Unavailable(_))));
    assert_eq!(store.calls().await.len(), 1);
}

#[tokio::test]
async fn test_conflict_on_write_is_retryable_error() {
    let (store, reconciler, key) = setup(Agent::new("ci", "builders", spec(1))).await;
    store
        .fail_next(
            Op::Create,
            Kind::Workload,
            StoreError::Conflict {
                kind: Kind::Workload,
                key: key.clone(),
                message: "object was modified".into(),
            },
        )
        .await;

    let err = reconciler.reconcile(&key).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(store.count(Kind::Workload).await, 0);

    assert_eq!(reconciler.reconcile(&key).await.unwrap(), REQUEUE);
    assert_eq!(store.count(Kind::Workload).await, 1);
}

#[tokio::test]
async fn test_deleting_agent_collects_dependents() {
    let (store, reconciler, key) = setup(Agent::new("ci", "builders", spec(2))).await;
    converge(&store, &reconciler, &key).await;

    // agent, workload, credential, configuration and two instances
    assert_eq!(store.delete(Kind::Agent, &key).await, 6);
    for kind in [
        Kind::Workload,
        Kind::Credential,
        Kind::Configuration,
        Kind::Instance,
    ] {
        assert_eq!(store.count(kind).await, 0, "{kind} left behind");
    }

    store.clear_calls().await;
    assert_eq!(reconciler.reconcile(&key).await.unwrap(), Outcome::Done);
    assert_eq!(store.calls().await.len(), 1);
}

/// Store whose reads never finish in time.
struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
}

#[async_trait]
impl StoreGateway for SlowStore {
    async fn get(&self, kind: Kind, key: &ObjectKey) -> StoreResult<Resource> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(kind, key).await
    }

    async fn list(
        &self,
        kind: Kind,
        namespace: &str,
        selector: &Labels,
    ) -> StoreResult<Vec<Resource>> {
        self.inner.list(kind, namespace, selector).await
    }

    async fn create(&self, resource: Resource) -> StoreResult<()> {
        self.inner.create(resource).await
    }

    async fn update(&self, resource: Resource) -> StoreResult<()> {
        self.inner.update(resource).await
    }

    async fn update_status(&self, agent: &Agent) -> StoreResult<()> {
        self.inner.update_status(agent).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_pass_deadline_exceeded() {
    let inner = MemoryStore::new();
    inner.insert(Agent::new("ci", "builders", spec(1))).await;
    let store = Arc::new(SlowStore {
        inner,
        delay: Duration::from_secs(120),
    });
    let reconciler = Reconciler::new(
        store.clone(),
        ReconcilerConfig {
            pass_timeout: Duration::from_secs(5),
            ..ReconcilerConfig::default()
        },
    );
    let key = ObjectKey::new("ci", "builders");

    let err = reconciler.reconcile_within(&key).await.unwrap_err();

    match err {
        ReconcileError::DeadlineExceeded { key: failed, elapsed } => {
            assert_eq!(failed, key);
            assert!(elapsed >= Duration::from_secs(5));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(store.inner.mutations().await.is_empty());
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    /// An existing workload with the wrong replica count is scaled to the
    /// declared count and the pass requeues.
    #[test]
    fn prop_replica_mismatch_is_corrected(declared in 0u32..16, observed in 0u32..16) {
        prop_assume!(declared != observed);

        let (outcome, replicas) = block_on(async {
            let agent = Agent::new("ci", "builders", spec(declared));
            let (store, reconciler, key) = setup(agent).await;
            let mut stale = store.object::<Agent>(&key).await.unwrap();
            stale.spec.size = observed;
            store.insert(desired_workload(&stale)).await;

            let outcome = reconciler.reconcile(&key).await.unwrap();
            let workload: Workload = store.object(&key).await.unwrap();
            (outcome, workload.spec.replicas)
        });

        prop_assert_eq!(outcome, REQUEUE);
        prop_assert_eq!(replicas, declared);
    }

    /// Two consecutive passes on a converged agent write nothing.
    #[test]
    fn prop_converged_second_pass_writes_nothing(size in 0u32..6) {
        let (outcome, mutations) = block_on(async {
            let (store, reconciler, key) = setup(Agent::new("ci", "builders", spec(size))).await;
            converge(&store, &reconciler, &key).await;
            store.clear_calls().await;
            let outcome = reconciler.reconcile(&key).await.unwrap();
            (outcome, store.mutations().await.len())
        });

        prop_assert_eq!(outcome, Outcome::Done);
        prop_assert_eq!(mutations, 0);
    }
}
