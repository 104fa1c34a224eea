//! In-memory store gateway.
//!
//! Stands in for the platform store in tests and in the development binary.
//! Beyond the gateway operations it also plays the platform's part:
//! - assigns `uid` on create and a fresh `resource_version` on every write
//! - garbage-collects dependents through owner references on delete
//! - materializes `Instance` objects for workloads (`settle_workloads`)
//!
//! Every gateway call is journaled, and one-shot faults can be injected per
//! operation and kind.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use agentpool_api::{
    Agent, Instance, Kind, Labels, Object, ObjectKey, ObjectMeta, OwnerReference, Resource,
    Workload,
};
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::{StoreError, StoreGateway, StoreResult};

/// Gateway operation, for journaling and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
}

impl Op {
    pub fn is_mutation(&self) -> bool {
        matches!(self, Op::Create | Op::Update | Op::UpdateStatus)
    }
}

/// One journaled gateway call. `name` is `None` for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCall {
    pub op: Op,
    pub kind: Kind,
    pub namespace: String,
    pub name: Option<String>,
}

#[derive(Debug)]
struct Fault {
    op: Op,
    kind: Kind,
    error: StoreError,
}

/// In-memory store gateway.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<(Kind, ObjectKey), Resource>>,
    journal: Mutex<Vec<StoreCall>>,
    faults: Mutex<Vec<Fault>>,
    next_version: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an object directly, bypassing the journal.
    pub async fn insert(&self, resource: impl Into<Resource>) {
        let mut resource = resource.into();
        self.stamp(resource.metadata_mut());
        let key = (resource.kind(), resource.metadata().key());
        self.objects.write().await.insert(key, resource);
    }

    /// Read a typed object directly, bypassing the journal.
    pub async fn object<T: Object>(&self, key: &ObjectKey) -> Option<T> {
        let objects = self.objects.read().await;
        objects
            .get(&(T::KIND, key.clone()))
            .cloned()
            .and_then(|resource| T::try_from(resource).ok())
    }

    /// Number of stored objects of `kind`.
    pub async fn count(&self, kind: Kind) -> usize {
        let objects = self.objects.read().await;
        objects.keys().filter(|(k, _)| *k == kind).count()
    }

    /// Make the next `op` on `kind` fail with `error`.
    pub async fn fail_next(&self, op: Op, kind: Kind, error: StoreError) {
        self.faults.lock().await.push(Fault { op, kind, error });
    }

    /// All journaled calls, oldest first.
    pub async fn calls(&self) -> Vec<StoreCall> {
        self.journal.lock().await.clone()
    }

    /// Journaled create/update/status calls, oldest first.
    pub async fn mutations(&self) -> Vec<StoreCall> {
        let journal = self.journal.lock().await;
        journal.iter().filter(|c| c.op.is_mutation()).cloned().collect()
    }

    pub async fn clear_calls(&self) {
        self.journal.lock().await.clear();
    }

    /// Delete an object and, transitively, everything it controls.
    ///
    /// Returns the number of objects removed.
    pub async fn delete(&self, kind: Kind, key: &ObjectKey) -> usize {
        let mut objects = self.objects.write().await;
        let Some(root) = objects.remove(&(kind, key.clone())) else {
            return 0;
        };

        let mut removed = 1;
        let mut orphaned_uids: Vec<String> = root.metadata().uid.iter().cloned().collect();
        while let Some(uid) = orphaned_uids.pop() {
            let dependents: Vec<_> = objects
                .iter()
                .filter(|(_, r)| {
                    r.metadata()
                        .controller_owner()
                        .is_some_and(|owner| owner.uid == uid)
                })
                .map(|(k, _)| k.clone())
                .collect();

            for dependent in dependents {
                if let Some(resource) = objects.remove(&dependent) {
                    debug!(kind = %dependent.0, key = %dependent.1, "Garbage-collected dependent");
                    orphaned_uids.extend(resource.metadata().uid.iter().cloned());
                    removed += 1;
                }
            }
        }

        removed
    }

    /// Create or remove instances so each workload runs exactly `replicas`
    /// of them, named `<workload>-<ordinal>`.
    ///
    /// Returns the number of instances created plus removed.
    pub async fn settle_workloads(&self) -> usize {
        let workloads: Vec<Workload> = {
            let objects = self.objects.read().await;
            objects
                .values()
                .filter_map(|r| match r {
                    Resource::Workload(w) => Some(w.clone()),
                    _ => None,
                })
                .collect()
        };

        let mut changes = 0;
        for workload in workloads {
            let namespace = workload.metadata.namespace.clone();
            let wanted: Vec<String> = (0..workload.spec.replicas)
                .map(|ordinal| format!("{}-{}", workload.metadata.name, ordinal))
                .collect();

            let existing: Vec<ObjectKey> = {
                let objects = self.objects.read().await;
                objects
                    .values()
                    .filter(|r| r.kind() == Kind::Instance)
                    .map(Resource::metadata)
                    .filter(|m| {
                        m.namespace == namespace
                            && m.controller_owner().map(|o| o.name.as_str())
                                == Some(workload.metadata.name.as_str())
                    })
                    .map(ObjectMeta::key)
                    .collect()
            };

            for key in &existing {
                if !wanted.contains(&key.name) {
                    changes += self.delete(Kind::Instance, key).await;
                }
            }

            for name in wanted {
                if existing.iter().any(|k| k.name == name) {
                    continue;
                }
                let mut metadata = ObjectMeta::named(&namespace, name);
                metadata.labels = workload.spec.template.labels.clone();
                metadata.owner_references.push(OwnerReference {
                    api_version: "apps/v1".to_string(),
                    kind: "Workload".to_string(),
                    name: workload.metadata.name.clone(),
                    uid: workload.metadata.uid.clone().unwrap_or_default(),
                    controller: true,
                });
                self.insert(Instance { metadata }).await;
                changes += 1;
            }
        }

        changes
    }

    fn stamp(&self, metadata: &mut ObjectMeta) {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        if metadata.uid.is_none() {
            metadata.uid = Some(format!("uid-{:08}", version));
        }
        metadata.resource_version = Some(version.to_string());
    }

    async fn record(
        &self,
        op: Op,
        kind: Kind,
        namespace: &str,
        name: Option<&str>,
    ) -> StoreResult<()> {
        self.journal.lock().await.push(StoreCall {
            op,
            kind,
            namespace: namespace.to_string(),
            name: name.map(str::to_string),
        });

        let mut faults = self.faults.lock().await;
        match faults.iter().position(|f| f.op == op && f.kind == kind) {
            Some(index) => Err(faults.remove(index).error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StoreGateway for MemoryStore {
    async fn get(&self, kind: Kind, key: &ObjectKey) -> StoreResult<Resource> {
        self.record(Op::Get, kind, &key.namespace, Some(&key.name)).await?;

        let objects = self.objects.read().await;
        objects
            .get(&(kind, key.clone()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind,
                key: key.clone(),
            })
    }

    async fn list(
        &self,
        kind: Kind,
        namespace: &str,
        selector: &Labels,
    ) -> StoreResult<Vec<Resource>> {
        self.record(Op::List, kind, namespace, None).await?;

        let objects = self.objects.read().await;
        Ok(objects
            .iter()
            .filter(|((k, key), r)| {
                *k == kind && key.namespace == namespace && r.metadata().matches_labels(selector)
            })
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn create(&self, mut resource: Resource) -> StoreResult<()> {
        let kind = resource.kind();
        let key = resource.metadata().key();
        self.record(Op::Create, kind, &key.namespace, Some(&key.name)).await?;

        let mut objects = self.objects.write().await;
        if objects.contains_key(&(kind, key.clone())) {
            return Err(StoreError::AlreadyExists { kind, key });
        }
        resource.metadata_mut().uid = None;
        self.stamp(resource.metadata_mut());
        objects.insert((kind, key), resource);
        Ok(())
    }

    async fn update(&self, mut resource: Resource) -> StoreResult<()> {
        let kind = resource.kind();
        let key = resource.metadata().key();
        self.record(Op::Update, kind, &key.namespace, Some(&key.name)).await?;

        let mut objects = self.objects.write().await;
        let Some(current) = objects.get(&(kind, key.clone())) else {
            return Err(StoreError::NotFound { kind, key });
        };

        resource.metadata_mut().uid = current.metadata().uid.clone();
        // Spec writes never touch descriptor status.
        if let (Resource::Agent(incoming), Resource::Agent(stored)) = (&mut resource, current) {
            incoming.status = stored.status.clone();
        }
        self.stamp(resource.metadata_mut());
        objects.insert((kind, key), resource);
        Ok(())
    }

    async fn update_status(&self, agent: &Agent) -> StoreResult<()> {
        let key = agent.key();
        self.record(Op::UpdateStatus, Kind::Agent, &key.namespace, Some(&key.name)).await?;

        let mut objects = self.objects.write().await;
        let Some(Resource::Agent(stored)) = objects.get_mut(&(Kind::Agent, key.clone())) else {
            return Err(StoreError::NotFound {
                kind: Kind::Agent,
                key,
            });
        };

        stored.status = agent.status.clone();
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        stored.metadata.resource_version = Some(version.to_string());
        Ok(())
    }
}
