//! Store gateway: the operator's view of the managed-resource store.
//!
//! The gateway is deliberately small (get, list, create, update, and a
//! separate status write) so that any backing store can implement it. Wire
//! transport, authentication and watch delivery live outside this crate.

pub mod memory;

use agentpool_api::{Agent, ApiError, Kind, Labels, Object, ObjectKey, Resource};
use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by a store gateway.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No object with this identity exists.
    #[error("{kind} {key} not found")]
    NotFound { kind: Kind, key: ObjectKey },

    /// Create was issued for an identity that is already taken.
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: Kind, key: ObjectKey },

    /// The store rejected a write because of a concurrent modification.
    #[error("conflict writing {kind} {key}: {message}")]
    Conflict {
        kind: Kind,
        key: ObjectKey,
        message: String,
    },

    /// The store could not be reached or failed internally.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store returned an object of the wrong kind.
    #[error(transparent)]
    UnexpectedKind(#[from] ApiError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Everything except a kind mismatch can succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::UnexpectedKind(_))
    }
}

/// Primitive operations against the managed-resource store.
#[async_trait]
pub trait StoreGateway: Send + Sync {
    /// Fetch one object by identity.
    async fn get(&self, kind: Kind, key: &ObjectKey) -> StoreResult<Resource>;

    /// List objects of `kind` in `namespace` carrying every label in `selector`.
    async fn list(
        &self,
        kind: Kind,
        namespace: &str,
        selector: &Labels,
    ) -> StoreResult<Vec<Resource>>;

    async fn create(&self, resource: Resource) -> StoreResult<()>;

    /// Overwrite an existing object. Last writer wins.
    async fn update(&self, resource: Resource) -> StoreResult<()>;

    /// Overwrite only the status of a descriptor.
    async fn update_status(&self, agent: &Agent) -> StoreResult<()>;
}

/// Fetch a typed object, mapping not-found to `None`.
pub async fn get_object<T: Object>(
    store: &dyn StoreGateway,
    key: &ObjectKey,
) -> StoreResult<Option<T>> {
    match store.get(T::KIND, key).await {
        Ok(resource) => Ok(Some(T::try_from(resource)?)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// List typed objects by label selector.
pub async fn list_objects<T: Object>(
    store: &dyn StoreGateway,
    namespace: &str,
    selector: &Labels,
) -> StoreResult<Vec<T>> {
    store
        .list(T::KIND, namespace, selector)
        .await?
        .into_iter()
        .map(|resource| T::try_from(resource).map_err(StoreError::from))
        .collect()
}
