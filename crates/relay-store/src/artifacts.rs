use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, instrument};

use relay_core::events::Part;
use relay_core::ids::SessionId;

use crate::error::StoreError;

/// Filenames with this prefix are shared by every session of a user.
pub const USER_NAMESPACE_PREFIX: &str = "user:";

/// Where an artifact lives.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArtifactScope {
    pub app_name: String,
    pub user_id: String,
    pub session_id: SessionId,
}

impl ArtifactScope {
    pub fn new(app_name: impl Into<String>, user_id: impl Into<String>, session_id: SessionId) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            session_id,
        }
    }
}

/// Versioned binary or text blobs attached to sessions.
///
/// Versions start at 0 and grow by one per save of the same filename.
#[async_trait]
pub trait ArtifactService: Send + Sync {
    async fn save_artifact(
        &self,
        scope: &ArtifactScope,
        filename: &str,
        artifact: Part,
    ) -> Result<u64, StoreError>;

    /// Loads `version`, or the latest version when `None`.
    async fn load_artifact(
        &self,
        scope: &ArtifactScope,
        filename: &str,
        version: Option<u64>,
    ) -> Result<Option<Part>, StoreError>;

    /// Filenames visible from the scope's session, sorted.
    async fn list_artifact_keys(&self, scope: &ArtifactScope) -> Result<Vec<String>, StoreError>;

    async fn list_versions(&self, scope: &ArtifactScope, filename: &str) -> Result<Vec<u64>, StoreError>;

    /// Removes every version. Deleting an absent artifact succeeds.
    async fn delete_artifact(&self, scope: &ArtifactScope, filename: &str) -> Result<(), StoreError>;
}

/// Artifact namespace: a session or, for `user:` filenames, the whole user.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Namespace {
    Session(String, String, SessionId),
    User(String, String),
}

fn namespace(scope: &ArtifactScope, filename: &str) -> Namespace {
    if filename.starts_with(USER_NAMESPACE_PREFIX) {
        Namespace::User(scope.app_name.clone(), scope.user_id.clone())
    } else {
        Namespace::Session(
            scope.app_name.clone(),
            scope.user_id.clone(),
            scope.session_id.clone(),
        )
    }
}

#[derive(Default)]
pub struct InMemoryArtifactService {
    artifacts: RwLock<BTreeMap<(Namespace, String), Vec<Part>>>,
}

impl InMemoryArtifactService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactService for InMemoryArtifactService {
    #[instrument(skip(self, artifact), fields(session_id = %scope.session_id))]
    async fn save_artifact(
        &self,
        scope: &ArtifactScope,
        filename: &str,
        artifact: Part,
    ) -> Result<u64, StoreError> {
        let mut artifacts = self.artifacts.write();
        let versions = artifacts
            .entry((namespace(scope, filename), filename.to_string()))
            .or_default();
        versions.push(artifact);
        let version = (versions.len() - 1) as u64;
        debug!(version, "artifact saved");
        Ok(version)
    }

    async fn load_artifact(
        &self,
        scope: &ArtifactScope,
        filename: &str,
        version: Option<u64>,
    ) -> Result<Option<Part>, StoreError> {
        let artifacts = self.artifacts.read();
        let Some(versions) = artifacts.get(&(namespace(scope, filename), filename.to_string())) else {
            return Ok(None);
        };
        let found = match version {
            Some(v) => usize::try_from(v).ok().and_then(|v| versions.get(v)),
            None => versions.last(),
        };
        Ok(found.cloned())
    }

    async fn list_artifact_keys(&self, scope: &ArtifactScope) -> Result<Vec<String>, StoreError> {
        let session_ns = namespace(scope, "");
        let user_ns = Namespace::User(scope.app_name.clone(), scope.user_id.clone());
        let keys: BTreeSet<String> = self
            .artifacts
            .read()
            .keys()
            .filter(|(ns, _)| *ns == session_ns || *ns == user_ns)
            .map(|(_, name)| name.clone())
            .collect();
        Ok(keys.into_iter().collect())
    }

    async fn list_versions(&self, scope: &ArtifactScope, filename: &str) -> Result<Vec<u64>, StoreError> {
        let count = self
            .artifacts
            .read()
            .get(&(namespace(scope, filename), filename.to_string()))
            .map_or(0, Vec::len);
        Ok((0..count as u64).collect())
    }

    #[instrument(skip(self), fields(session_id = %scope.session_id))]
    async fn delete_artifact(&self, scope: &ArtifactScope, filename: &str) -> Result<(), StoreError> {
        self.artifacts
            .write()
            .remove(&(namespace(scope, filename), filename.to_string()));
        Ok(())
    }
}
