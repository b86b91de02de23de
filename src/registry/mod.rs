//! Drone Registry: the authoritative, durable index of drones and repos.
//!
//! All lifecycle mutations go through this module; every committed mutation
//! is persisted to a single JSON snapshot that is atomically replaced
//! (write-to-temp + rename). Reads are lock-free clones of the in-memory
//! state. Per-drone mutation locks serialise the orchestrator's workflows.

mod record;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use dashmap::DashMap;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::{HubError, HubResult};

pub use record::{
    DRAFT_NAME_MAX_LEN, DroneRecord, GithubRepo, HubPhase, NAME_MAX_LEN, RepoRecord,
    is_valid_draft_name, validate_name,
};

/// Deadline for flushing the snapshot to disk.
pub const SNAPSHOT_FLUSH_TIMEOUT: Duration = Duration::from_secs(15);

/// What goes into the snapshot file.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    drones: Vec<DroneRecord>,
    repos: Vec<RepoRecord>,
}

#[derive(Debug, Default)]
struct State {
    drones: HashMap<String, DroneRecord>,
    repos: HashMap<PathBuf, RepoRecord>,
}

/// Fields a phase transition may update alongside the phase itself.
#[derive(Debug, Default, Clone)]
pub struct TransitionUpdate {
    /// New engine-probe health, when observed.
    pub status_ok: Option<bool>,
    /// New probe diagnostics.
    pub status_error: Option<String>,
    /// New human-readable phase detail.
    pub hub_message: Option<String>,
}

/// Inputs for reserving a new drone slot.
#[derive(Debug, Clone)]
pub struct NewDrone {
    /// Display name (validated, unique among live drones).
    pub name: String,
    /// Optional grouping label.
    pub group: Option<String>,
    /// Host repository to seed from.
    pub repo_path: Option<PathBuf>,
    /// Preferred internal port.
    pub container_port: u16,
}

/// The process-wide drone registry.
pub struct Registry {
    state: RwLock<State>,
    snapshot_path: PathBuf,
    /// Serialises snapshot writes.
    flush: Mutex<()>,
    /// Per-drone mutation locks; entries live as long as the process.
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Advisory lock guarding the snapshot against a second daemon.
    _lock_file: std::fs::File,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("snapshot_path", &self.snapshot_path)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Load the registry from its snapshot, creating an empty one when the
    /// file does not exist.
    pub fn load(snapshot_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = snapshot_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data dir {}", parent.display()))?;
        }

        let lock_path = snapshot_path.with_extension("lock");
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("opening registry lock {}", lock_path.display()))?;
        lock_file.try_lock_exclusive().with_context(|| {
            format!(
                "registry snapshot {} is locked by another daemon",
                snapshot_path.display()
            )
        })?;

        let snapshot = if snapshot_path.exists() {
            let raw = std::fs::read_to_string(snapshot_path)
                .with_context(|| format!("reading snapshot {}", snapshot_path.display()))?;
            serde_json::from_str::<Snapshot>(&raw)
                .with_context(|| format!("parsing snapshot {}", snapshot_path.display()))?
        } else {
            Snapshot::default()
        };

        let mut state = State::default();
        for drone in snapshot.drones {
            state.drones.insert(drone.id.clone(), drone);
        }
        for repo in snapshot.repos {
            state.repos.insert(repo.path.clone(), repo);
        }

        Ok(Self {
            state: RwLock::new(state),
            snapshot_path: snapshot_path.to_path_buf(),
            flush: Mutex::new(()),
            locks: DashMap::new(),
            _lock_file: lock_file,
        })
    }

    /// Acquire the mutation lock for a drone id. Every lifecycle workflow
    /// holds this for its whole duration.
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Snapshot of all drones, sorted by creation time then id.
    pub async fn list(&self) -> Vec<DroneRecord> {
        let state = self.state.read().await;
        let mut drones: Vec<DroneRecord> = state.drones.values().cloned().collect();
        drones.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        drones
    }

    /// Look up one drone by id.
    pub async fn get(&self, id: &str) -> Option<DroneRecord> {
        self.state.read().await.drones.get(id).cloned()
    }

    /// Look up one drone by display name.
    pub async fn get_by_name(&self, name: &str) -> Option<DroneRecord> {
        let state = self.state.read().await;
        state.drones.values().find(|d| d.name == name).cloned()
    }

    /// Reserve a slot for a new drone in the `creating` phase.
    ///
    /// Fails with `name_conflict` when any live drone has the same name and
    /// with `invalid_name` when validation rejects it.
    pub async fn insert_starting(&self, new: NewDrone) -> HubResult<DroneRecord> {
        validate_name(&new.name)?;

        let record = {
            let mut state = self.state.write().await;
            if state.drones.values().any(|d| d.name == new.name) {
                return Err(HubError::NameConflict { name: new.name });
            }
            let record = DroneRecord {
                id: uuid::Uuid::new_v4().simple().to_string(),
                name: new.name,
                group: new.group,
                created_at: Utc::now(),
                repo_attached: new.repo_path.is_some(),
                repo_path: new.repo_path,
                container_port: new.container_port,
                host_port: None,
                status_ok: true,
                status_error: None,
                chats: vec!["default".to_owned()],
                hub_phase: HubPhase::Creating,
                hub_message: None,
                busy: true,
            };
            state.drones.insert(record.id.clone(), record.clone());
            record
        };

        self.persist().await?;
        Ok(record)
    }

    /// Validate and apply a phase transition.
    pub async fn transition(
        &self,
        id: &str,
        next: HubPhase,
        update: TransitionUpdate,
    ) -> HubResult<DroneRecord> {
        let record = {
            let mut state = self.state.write().await;
            let drone = state
                .drones
                .get_mut(id)
                .ok_or_else(|| HubError::not_found(format!("drone {id}")))?;
            if !drone.hub_phase.can_transition_to(next) {
                return Err(HubError::StateViolation {
                    action: format!("transition to {next}"),
                    phase: drone.hub_phase,
                });
            }
            drone.hub_phase = next;
            if let Some(ok) = update.status_ok {
                drone.status_ok = ok;
            }
            if update.status_error.is_some() {
                drone.status_error = update.status_error;
            }
            drone.hub_message = update.hub_message;
            drone.clone()
        };

        self.persist().await?;
        Ok(record)
    }

    /// Rename a live drone, enforcing validation and uniqueness.
    pub async fn rename(&self, id: &str, new_name: &str) -> HubResult<DroneRecord> {
        validate_name(new_name)?;

        let record = {
            let mut state = self.state.write().await;
            if state
                .drones
                .values()
                .any(|d| d.name == new_name && d.id != id)
            {
                return Err(HubError::NameConflict {
                    name: new_name.to_owned(),
                });
            }
            let drone = state
                .drones
                .get_mut(id)
                .ok_or_else(|| HubError::not_found(format!("drone {id}")))?;
            drone.name = new_name.to_owned();
            drone.clone()
        };

        self.persist().await?;
        Ok(record)
    }

    /// Remove a drone. Returns whether a record existed; removing an
    /// unknown id is not an error (deletes are idempotent).
    pub async fn remove(&self, id: &str) -> HubResult<bool> {
        let existed = self.state.write().await.drones.remove(id).is_some();
        if existed {
            self.persist().await?;
        }
        Ok(existed)
    }

    /// Apply an arbitrary mutation to one drone and persist.
    pub async fn update<F>(&self, id: &str, f: F) -> HubResult<DroneRecord>
    where
        F: FnOnce(&mut DroneRecord),
    {
        let record = {
            let mut state = self.state.write().await;
            let drone = state
                .drones
                .get_mut(id)
                .ok_or_else(|| HubError::not_found(format!("drone {id}")))?;
            f(drone);
            drone.clone()
        };
        self.persist().await?;
        Ok(record)
    }

    /// Set or clear the busy flag.
    pub async fn set_busy(&self, id: &str, busy: bool) -> HubResult<DroneRecord> {
        self.update(id, |d| d.busy = busy).await
    }

    /// Register a repo record, deduplicating on the canonical path.
    pub async fn add_repo(&self, repo: RepoRecord) -> HubResult<RepoRecord> {
        let stored = {
            let mut state = self.state.write().await;
            state
                .repos
                .entry(repo.path.clone())
                .or_insert(repo)
                .clone()
        };
        self.persist().await?;
        Ok(stored)
    }

    /// All registered repos, sorted by path.
    pub async fn list_repos(&self) -> Vec<RepoRecord> {
        let state = self.state.read().await;
        let mut repos: Vec<RepoRecord> = state.repos.values().cloned().collect();
        repos.sort_by(|a, b| a.path.cmp(&b.path));
        repos
    }

    /// Look up a repo record by canonical path.
    pub async fn get_repo(&self, path: &Path) -> Option<RepoRecord> {
        self.state.read().await.repos.get(path).cloned()
    }

    /// Write the snapshot atomically: temp file, fsync, rename.
    async fn persist(&self) -> HubResult<()> {
        let snapshot = {
            let state = self.state.read().await;
            let mut drones: Vec<DroneRecord> = state.drones.values().cloned().collect();
            drones.sort_by(|a, b| a.id.cmp(&b.id));
            let mut repos: Vec<RepoRecord> = state.repos.values().cloned().collect();
            repos.sort_by(|a, b| a.path.cmp(&b.path));
            Snapshot { drones, repos }
        };

        let _guard = self.flush.lock().await;
        let path = self.snapshot_path.clone();
        let write = tokio::task::spawn_blocking(move || write_snapshot(&path, &snapshot));

        match tokio::time::timeout(SNAPSHOT_FLUSH_TIMEOUT, write).await {
            Ok(Ok(result)) => result.map_err(HubError::Internal),
            Ok(Err(join_err)) => Err(HubError::Internal(anyhow::anyhow!(
                "snapshot writer panicked: {join_err}"
            ))),
            Err(_) => Err(HubError::Timeout {
                action: "registry snapshot flush".to_owned(),
                seconds: SNAPSHOT_FLUSH_TIMEOUT.as_secs(),
            }),
        }
    }
}

fn write_snapshot(path: &Path, snapshot: &Snapshot) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(snapshot).context("serialising registry snapshot")?;
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("snapshot path has no parent"))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent).context("creating snapshot temp file")?;
    std::io::Write::write_all(&mut tmp, &json).context("writing snapshot")?;
    tmp.as_file().sync_all().context("syncing snapshot")?;
    tmp.persist(path)
        .with_context(|| format!("replacing snapshot {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_drone(name: &str) -> NewDrone {
        NewDrone {
            name: name.to_owned(),
            group: None,
            repo_path: None,
            container_port: 3000,
        }
    }

    fn test_registry(dir: &Path) -> Registry {
        Registry::load(&dir.join("registry.json")).expect("load registry")
    }

    #[tokio::test]
    async fn ids_and_names_are_unique() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = test_registry(dir.path());

        let a = registry.insert_starting(new_drone("alpha")).await.expect("insert a");
        let b = registry.insert_starting(new_drone("beta")).await.expect("insert b");
        assert_ne!(a.id, b.id);

        let err = registry
            .insert_starting(new_drone("alpha"))
            .await
            .expect_err("duplicate name");
        assert_eq!(err.code(), "name_conflict");
    }

    #[tokio::test]
    async fn transition_rejects_illegal_edges() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = test_registry(dir.path());
        let d = registry.insert_starting(new_drone("alpha")).await.expect("insert");

        let err = registry
            .transition(&d.id, HubPhase::Ready, TransitionUpdate::default())
            .await
            .expect_err("creating -> ready is illegal");
        assert_eq!(err.code(), "state_violation");

        registry
            .transition(&d.id, HubPhase::Starting, TransitionUpdate::default())
            .await
            .expect("creating -> starting");
        registry
            .transition(&d.id, HubPhase::Seeding, TransitionUpdate::default())
            .await
            .expect("starting -> seeding");
        let ready = registry
            .transition(&d.id, HubPhase::Ready, TransitionUpdate::default())
            .await
            .expect("seeding -> ready");
        assert_eq!(ready.hub_phase, HubPhase::Ready);
    }

    #[tokio::test]
    async fn snapshot_round_trips_across_loads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("registry.json");

        let id = {
            let registry = Registry::load(&path).expect("first load");
            let d = registry
                .insert_starting(new_drone("persisted"))
                .await
                .expect("insert");
            registry
                .transition(&d.id, HubPhase::Starting, TransitionUpdate::default())
                .await
                .expect("transition");
            d.id
        };

        let registry = Registry::load(&path).expect("second load");
        let restored = registry.get(&id).await.expect("restored drone");
        assert_eq!(restored.name, "persisted");
        assert_eq!(restored.hub_phase, HubPhase::Starting);
    }

    #[tokio::test]
    async fn rename_validates_and_checks_conflicts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = test_registry(dir.path());
        let a = registry.insert_starting(new_drone("alpha")).await.expect("a");
        let _b = registry.insert_starting(new_drone("beta")).await.expect("b");

        assert_eq!(
            registry
                .rename(&a.id, "beta")
                .await
                .expect_err("conflict")
                .code(),
            "name_conflict"
        );
        assert_eq!(
            registry
                .rename(&a.id, "bad\nname")
                .await
                .expect_err("newline")
                .code(),
            "invalid_name"
        );
        let renamed = registry.rename(&a.id, "gamma").await.expect("rename");
        assert_eq!(renamed.name, "gamma");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = test_registry(dir.path());
        let d = registry.insert_starting(new_drone("alpha")).await.expect("insert");

        assert!(registry.remove(&d.id).await.expect("first remove"));
        assert!(!registry.remove(&d.id).await.expect("second remove"));
    }

    #[tokio::test]
    async fn repos_deduplicate_on_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = test_registry(dir.path());
        let repo = RepoRecord {
            path: PathBuf::from("/srv/repo"),
            added_at: Utc::now(),
            remote_url: None,
            github: None,
        };
        registry.add_repo(repo.clone()).await.expect("first add");
        registry.add_repo(repo).await.expect("second add");
        assert_eq!(registry.list_repos().await.len(), 1);
    }

    #[tokio::test]
    async fn name_free_after_delete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = test_registry(dir.path());
        let d = registry.insert_starting(new_drone("alpha")).await.expect("insert");
        registry.remove(&d.id).await.expect("remove");
        registry
            .insert_starting(new_drone("alpha"))
            .await
            .expect("name reusable after delete");
    }
}
