//! Lifecycle Orchestrator: single writer of drone lifecycle state.
//!
//! Every workflow runs under the registry's per-drone lock; long steps
//! (container create, seeding) happen in background tasks so queueing
//! returns immediately. Acceptance never means ready; clients poll the
//! registry.

pub mod naming;

use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::engine::{ContainerEngine, CopyOptions, RenameOptions, StartMode};
use crate::error::{HubError, HubResult};
use crate::prompts::{PromptDispatcher, SendPrompt, agent_session_name};
use crate::registry::{HubPhase, NewDrone, Registry, TransitionUpdate};
use crate::sync::RepoSync;
use crate::terminal::TerminalHub;

pub use naming::{HttpNameSuggester, NameSuggester, draft_free_name};

/// Live drones allowed per hub.
pub const MAX_DRONES: usize = 64;

/// Concurrent container creations.
const CREATE_CONCURRENCY: usize = 3;

/// Concurrent container deletions.
const DELETE_CONCURRENCY: usize = 3;

/// Chat-log poll cadence for ready drones.
const WATCH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

/// Port refresh happens every N watcher ticks.
const PORT_REFRESH_TICKS: u32 = 5;

/// One entry of a queue request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DroneQueueSpec {
    /// Display name for the new drone.
    pub name: String,
    /// Optional grouping label.
    #[serde(default)]
    pub group: Option<String>,
    /// Host repository to seed from.
    #[serde(default)]
    pub repo_path: Option<PathBuf>,
    /// Image or build hint passed to the engine.
    #[serde(default)]
    pub build: Option<String>,
    /// Agent binary started in the seed chat.
    pub seed_agent: String,
    /// Model flag for the agent.
    #[serde(default)]
    pub seed_model: Option<String>,
    /// Chat the agent session belongs to; `default` when absent.
    #[serde(default)]
    pub seed_chat: Option<String>,
    /// First prompt, dispatched once the drone is ready.
    #[serde(default)]
    pub seed_prompt: Option<String>,
}

/// One accepted queue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedDrone {
    /// The requested name.
    pub name: String,
    /// The assigned drone id.
    pub id: String,
}

/// One rejected queue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedDrone {
    /// The requested name.
    pub name: String,
    /// Why the entry was rejected.
    pub error: String,
    /// Machine code of the failure.
    pub code: String,
}

/// Result of a queue request, correlated to inputs by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOutcome {
    /// Entries that reserved a slot and created a container.
    pub accepted: Vec<AcceptedDrone>,
    /// Entries that failed before a container existed.
    pub rejected: Vec<RejectedDrone>,
}

/// Parameters for cloning a drone.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneRequest {
    /// Name for the clone.
    pub name: String,
    /// Also copy the source's chat transcripts.
    #[serde(default)]
    pub include_chats: bool,
}

/// The orchestrator. Wrapped in `Arc` so workflows can spawn tasks.
pub struct Orchestrator {
    registry: Arc<Registry>,
    engine: Arc<dyn ContainerEngine>,
    sync: Arc<RepoSync>,
    prompts: Arc<PromptDispatcher>,
    terminal: Arc<TerminalHub>,
    container_port: u16,
    suggester: Option<Arc<dyn NameSuggester>>,
    create_limit: Arc<Semaphore>,
    delete_limit: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Wire up the orchestrator.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        engine: Arc<dyn ContainerEngine>,
        sync: Arc<RepoSync>,
        prompts: Arc<PromptDispatcher>,
        terminal: Arc<TerminalHub>,
        container_port: u16,
        suggester: Option<Arc<dyn NameSuggester>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            engine,
            sync,
            prompts,
            terminal,
            container_port,
            suggester,
            create_limit: Arc::new(Semaphore::new(CREATE_CONCURRENCY)),
            delete_limit: Arc::new(Semaphore::new(DELETE_CONCURRENCY)),
            shutdown,
        }
    }

    /// Queue a batch of drones.
    ///
    /// Synchronous part: reserve the registry slot and create the
    /// container. Everything after (seeding, agent start, seed prompt)
    /// runs in a background task per drone; callers poll the registry.
    pub async fn queue(self: &Arc<Self>, specs: Vec<DroneQueueSpec>) -> QueueOutcome {
        let mut outcome = QueueOutcome::default();

        for mut spec in specs {
            let name = spec.name.clone();

            // A drone's repo path must reference a registered repo record.
            if let Some(raw) = &spec.repo_path {
                let canonical = match raw.canonicalize() {
                    Ok(c) => c,
                    Err(e) => {
                        outcome.rejected.push(RejectedDrone {
                            name,
                            error: format!("repository path {}: {e}", raw.display()),
                            code: "not_found".to_owned(),
                        });
                        continue;
                    }
                };
                if self.registry.get_repo(&canonical).await.is_none() {
                    outcome.rejected.push(RejectedDrone {
                        name,
                        error: format!(
                            "repository {} is not registered with the hub",
                            canonical.display()
                        ),
                        code: "not_found".to_owned(),
                    });
                    continue;
                }
                spec.repo_path = Some(canonical);
            }

            if self.registry.list().await.len() >= MAX_DRONES {
                outcome.rejected.push(RejectedDrone {
                    name,
                    error: format!("fleet limit of {MAX_DRONES} drones reached"),
                    code: "state_violation".to_owned(),
                });
                continue;
            }

            let record = match self
                .registry
                .insert_starting(NewDrone {
                    name: spec.name.clone(),
                    group: spec.group.clone(),
                    repo_path: spec.repo_path.clone(),
                    container_port: self.container_port,
                })
                .await
            {
                Ok(record) => record,
                Err(e) => {
                    outcome.rejected.push(RejectedDrone {
                        name,
                        code: e.code().to_owned(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            // Container creation is part of acceptance: a create failure
            // belongs in rejected[], with the errored record kept for
            // inspection.
            let permit = self.create_limit.clone().acquire_owned().await;
            let create_result = self
                .engine
                .create(&record.name, &self.create_args(&spec))
                .await;
            drop(permit);

            if let Err(e) = create_result {
                let _ = self
                    .registry
                    .transition(
                        &record.id,
                        HubPhase::Error,
                        TransitionUpdate {
                            status_ok: Some(false),
                            status_error: Some(e.to_string()),
                            hub_message: Some("container create failed".to_owned()),
                        },
                    )
                    .await;
                let _ = self.registry.set_busy(&record.id, false).await;
                outcome.rejected.push(RejectedDrone {
                    name,
                    code: e.code().to_owned(),
                    error: e.to_string(),
                });
                continue;
            }

            outcome.accepted.push(AcceptedDrone {
                name: record.name.clone(),
                id: record.id.clone(),
            });

            let this = Arc::clone(self);
            let id = record.id.clone();
            tokio::spawn(async move {
                this.complete_creation(&id, spec).await;
            });
        }

        outcome
    }

    fn create_args(&self, spec: &DroneQueueSpec) -> Vec<String> {
        let mut args = vec!["--port".to_owned(), self.container_port.to_string()];
        if let Some(build) = &spec.build {
            args.push("--image".to_owned());
            args.push(build.clone());
        }
        args
    }

    /// Background tail of the create workflow: seeding → agent → ready.
    async fn complete_creation(self: &Arc<Self>, id: &str, spec: DroneQueueSpec) {
        let guard = self.registry.lock(id).await;
        let chat = spec.seed_chat.clone().unwrap_or_else(|| "default".to_owned());

        let result = self.bring_up(id, &spec, &chat).await;
        match result {
            Ok(()) => {
                let _ = self.registry.set_busy(id, false).await;
            }
            Err(e) => {
                tracing::error!(drone = id, error = %e, "drone bring-up failed");
                let _ = self
                    .registry
                    .transition(
                        id,
                        HubPhase::Error,
                        TransitionUpdate {
                            status_ok: Some(false),
                            status_error: Some(e.to_string()),
                            hub_message: Some("bring-up failed; container preserved".to_owned()),
                        },
                    )
                    .await;
                let _ = self.registry.set_busy(id, false).await;
                return;
            }
        }
        drop(guard);

        self.spawn_watcher(id.to_owned());

        // Auto-rename from the seed prompt, then dispatch it. Both are
        // non-fatal: prompt failures never change hub phase.
        if let Some(prompt) = &spec.seed_prompt {
            self.auto_rename_from_prompt(id, prompt).await;
            if let Err(e) = self
                .prompts
                .send(
                    id,
                    &chat,
                    SendPrompt {
                        prompt: prompt.clone(),
                        attachments: Vec::new(),
                    },
                )
                .await
            {
                tracing::warn!(drone = id, error = %e, "seed prompt dispatch failed");
            }
        }
    }

    async fn bring_up(&self, id: &str, spec: &DroneQueueSpec, chat: &str) -> HubResult<()> {
        self.registry
            .transition(id, HubPhase::Starting, TransitionUpdate::default())
            .await?;
        self.registry
            .transition(
                id,
                HubPhase::Seeding,
                TransitionUpdate {
                    hub_message: Some("cloning working copy".to_owned()),
                    ..TransitionUpdate::default()
                },
            )
            .await?;

        let drone = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| HubError::not_found(format!("drone {id}")))?;

        if let Some(repo) = &spec.repo_path {
            let branch = format!("drone/{}", drone.name);
            self.sync
                .seed(repo, &drone.name, None, Some(&branch))
                .await?;
        }

        self.registry.update(id, |d| d.ensure_chat(chat)).await?;

        let mut agent_args = Vec::new();
        if let Some(model) = &spec.seed_model {
            agent_args.push("--model".to_owned());
            agent_args.push(model.clone());
        }
        self.engine
            .session_start(
                &drone.name,
                &agent_session_name(chat),
                &spec.seed_agent,
                &agent_args,
                true,
            )
            .await?;

        self.registry
            .transition(
                id,
                HubPhase::Ready,
                TransitionUpdate {
                    status_ok: Some(true),
                    status_error: None,
                    hub_message: None,
                },
            )
            .await?;
        tracing::info!(drone = id, name = %drone.name, "drone ready");
        Ok(())
    }

    /// Delete a drone. Unknown ids are accepted as no-ops so clients can
    /// retry optimistically.
    pub async fn delete(&self, id: &str) -> HubResult<bool> {
        let _guard = self.registry.lock(id).await;
        let Some(drone) = self.registry.get(id).await else {
            return Ok(false);
        };

        let _permit = self.delete_limit.acquire().await;
        self.registry.set_busy(id, true).await?;

        match self.engine.remove(&drone.name, false).await {
            Ok(()) => {
                self.terminal.close_drone(id);
                self.prompts.gc_drone(id);
                self.registry.remove(id).await?;
                tracing::info!(drone = id, name = %drone.name, "drone deleted");
                Ok(true)
            }
            Err(e) => {
                let _ = self.registry.set_busy(id, false).await;
                Err(e)
            }
        }
    }

    /// Rename a drone and its container.
    pub async fn rename(
        &self,
        id: &str,
        new_name: &str,
        migrate_volume_name: bool,
    ) -> HubResult<(String, String)> {
        let _guard = self.registry.lock(id).await;
        let drone = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| HubError::not_found(format!("drone {id}")))?;

        if drone.busy {
            return Err(HubError::StateViolation {
                action: "rename a busy drone".to_owned(),
                phase: drone.hub_phase,
            });
        }
        if matches!(drone.hub_phase, HubPhase::Starting | HubPhase::Seeding) {
            return Err(HubError::StateViolation {
                action: "rename".to_owned(),
                phase: drone.hub_phase,
            });
        }
        crate::registry::validate_name(new_name)?;
        if let Some(other) = self.registry.get_by_name(new_name).await {
            if other.id != id {
                return Err(HubError::NameConflict {
                    name: new_name.to_owned(),
                });
            }
        }

        self.engine
            .rename(
                &drone.name,
                new_name,
                RenameOptions {
                    start_mode: StartMode::Preserve,
                    migrate_volume_name,
                },
            )
            .await?;
        self.registry.rename(id, new_name).await?;

        tracing::info!(drone = id, old = %drone.name, new = new_name, "drone renamed");
        Ok((drone.name, new_name.to_owned()))
    }

    /// Clone a drone: same repo, seeded at the source's base SHA, chats
    /// copied across when requested.
    pub async fn clone_drone(
        self: &Arc<Self>,
        source_id: &str,
        request: CloneRequest,
    ) -> HubResult<AcceptedDrone> {
        let (repo_path, base_sha, chats_tar) = {
            let _guard = self.registry.lock(source_id).await;
            let source = self
                .registry
                .get(source_id)
                .await
                .ok_or_else(|| HubError::not_found(format!("drone {source_id}")))?;
            if source.busy {
                return Err(HubError::StateViolation {
                    action: "clone a busy drone".to_owned(),
                    phase: source.hub_phase,
                });
            }

            let base_sha = if source.repo_attached {
                Some(
                    self.engine
                        .repo_base_sha(&source.name, crate::sync::DRONE_REPO_PATH)
                        .await?,
                )
            } else {
                None
            };

            let chats_tar = if request.include_chats {
                self.snapshot_chats(&source.name).await
            } else {
                None
            };
            (source.repo_path.clone(), base_sha, chats_tar)
        };

        let record = self
            .registry
            .insert_starting(NewDrone {
                name: request.name.clone(),
                group: None,
                repo_path: repo_path.clone(),
                container_port: self.container_port,
            })
            .await?;

        self.engine
            .create(
                &record.name,
                &["--port".to_owned(), self.container_port.to_string()],
            )
            .await
            .inspect_err(|e| {
                let registry = Arc::clone(&self.registry);
                let id = record.id.clone();
                let message = e.to_string();
                tokio::spawn(async move {
                    let _ = registry
                        .transition(
                            &id,
                            HubPhase::Error,
                            TransitionUpdate {
                                status_ok: Some(false),
                                status_error: Some(message),
                                hub_message: Some("container create failed".to_owned()),
                            },
                        )
                        .await;
                    let _ = registry.set_busy(&id, false).await;
                });
            })?;

        let this = Arc::clone(self);
        let id = record.id.clone();
        tokio::spawn(async move {
            this.complete_clone(&id, repo_path, base_sha, chats_tar).await;
        });

        Ok(AcceptedDrone {
            name: record.name,
            id: record.id,
        })
    }

    async fn complete_clone(
        self: &Arc<Self>,
        id: &str,
        repo_path: Option<PathBuf>,
        base_sha: Option<String>,
        chats_tar: Option<Vec<u8>>,
    ) {
        let guard = self.registry.lock(id).await;
        let result = async {
            self.registry
                .transition(id, HubPhase::Starting, TransitionUpdate::default())
                .await?;
            self.registry
                .transition(id, HubPhase::Seeding, TransitionUpdate::default())
                .await?;

            let drone = self
                .registry
                .get(id)
                .await
                .ok_or_else(|| HubError::not_found(format!("drone {id}")))?;

            if let Some(repo) = &repo_path {
                self.sync
                    .seed(repo, &drone.name, base_sha.as_deref(), None)
                    .await?;
            }
            if let Some(tar) = &chats_tar {
                self.restore_chats(&drone.name, tar).await?;
            }

            self.engine
                .session_start(
                    &drone.name,
                    &agent_session_name("default"),
                    "claude",
                    &[],
                    true,
                )
                .await?;
            self.registry
                .transition(
                    id,
                    HubPhase::Ready,
                    TransitionUpdate {
                        status_ok: Some(true),
                        status_error: None,
                        hub_message: None,
                    },
                )
                .await?;
            Ok::<(), HubError>(())
        }
        .await;

        if let Err(e) = result {
            tracing::error!(drone = id, error = %e, "clone bring-up failed");
            let _ = self
                .registry
                .transition(
                    id,
                    HubPhase::Error,
                    TransitionUpdate {
                        status_ok: Some(false),
                        status_error: Some(e.to_string()),
                        hub_message: Some("clone failed; container preserved".to_owned()),
                    },
                )
                .await;
        }
        let _ = self.registry.set_busy(id, false).await;
        drop(guard);
        self.spawn_watcher(id.to_owned());
    }

    /// Tar + base64 the source chats directory. Missing directories and
    /// decode noise yield `None`; cloning chats is best-effort.
    async fn snapshot_chats(&self, container: &str) -> Option<Vec<u8>> {
        let out = self
            .engine
            .exec(
                container,
                "sh",
                &[
                    "-c".to_owned(),
                    "tar -C /work/.dronehub -cf - chats 2>/dev/null | base64".to_owned(),
                ],
                None,
            )
            .await
            .ok()?;
        if !out.success() {
            return None;
        }
        let compact: String = out.stdout.split_whitespace().collect();
        base64::engine::general_purpose::STANDARD.decode(compact).ok()
    }

    async fn restore_chats(&self, container: &str, tar: &[u8]) -> HubResult<()> {
        let scratch = tempfile::tempdir().map_err(|e| {
            HubError::Internal(anyhow::anyhow!("chats scratch dir: {e}"))
        })?;
        let tar_path = scratch.path().join("chats.tar");
        std::fs::write(&tar_path, tar)
            .map_err(|e| HubError::Internal(anyhow::anyhow!("writing chats tar: {e}")))?;

        self.engine
            .copy(
                container,
                &tar_path,
                "/tmp/dronehub/chats.tar",
                CopyOptions::default(),
            )
            .await?;
        let out = self
            .engine
            .exec(
                container,
                "sh",
                &[
                    "-c".to_owned(),
                    "mkdir -p /work/.dronehub && tar -C /work/.dronehub -xf /tmp/dronehub/chats.tar && rm -f /tmp/dronehub/chats.tar"
                        .to_owned(),
                ],
                None,
            )
            .await?;
        if !out.success() {
            return Err(HubError::engine_failure(&out.stderr, &out.stdout));
        }
        Ok(())
    }

    /// Commit the drone's container as a new base image.
    pub async fn set_base_image(&self, id: &str) -> HubResult<Option<String>> {
        let _guard = self.registry.lock(id).await;
        let drone = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| HubError::not_found(format!("drone {id}")))?;
        if drone.hub_phase != HubPhase::Ready || drone.busy {
            return Err(HubError::StateViolation {
                action: "set base image".to_owned(),
                phase: drone.hub_phase,
            });
        }

        self.registry.set_busy(id, true).await?;
        let result = self.engine.base_set(&drone.name).await;
        let _ = self.registry.set_busy(id, false).await;

        let tag = result?;
        tracing::info!(drone = id, tag = ?tag, "base image committed");
        Ok(tag)
    }

    /// Rename from a drafted name; always non-fatal.
    pub async fn auto_rename_from_prompt(&self, id: &str, prompt: &str) {
        let Some(suggester) = &self.suggester else {
            return;
        };
        let Some(name) = draft_free_name(suggester.as_ref(), &self.registry, prompt).await
        else {
            return;
        };
        match self.rename(id, &name, false).await {
            Ok((old, new)) => {
                tracing::info!(drone = id, old = %old, new = %new, "auto-renamed from seed prompt");
            }
            Err(e) => {
                tracing::debug!(drone = id, error = %e, "auto-rename skipped");
            }
        }
    }

    /// Compare the registry with the engine at startup: drones whose
    /// container vanished become errors; ready drones are started again.
    pub async fn startup_reconcile(self: &Arc<Self>) -> HubResult<()> {
        let live = self.engine.ls().await?;

        for drone in self.registry.list().await {
            let _guard = self.registry.lock(&drone.id).await;
            if !live.iter().any(|n| n == &drone.name) {
                if drone.hub_phase != HubPhase::Error {
                    let _ = self
                        .registry
                        .transition(
                            &drone.id,
                            HubPhase::Error,
                            TransitionUpdate {
                                status_ok: Some(false),
                                status_error: Some("container missing from engine".to_owned()),
                                hub_message: Some("container disappeared".to_owned()),
                            },
                        )
                        .await;
                }
                continue;
            }

            if drone.hub_phase == HubPhase::Ready {
                // Surface the restart: clients polling hubPhase see
                // `starting` until the container is back up, and prompts
                // and terminals are refused in the meantime.
                self.registry
                    .transition(
                        &drone.id,
                        HubPhase::Starting,
                        TransitionUpdate {
                            hub_message: Some("restarting after engine restart".to_owned()),
                            ..TransitionUpdate::default()
                        },
                    )
                    .await?;

                match self.engine.start(&drone.name).await {
                    Ok(()) => {
                        self.registry
                            .transition(
                                &drone.id,
                                HubPhase::Ready,
                                TransitionUpdate {
                                    status_ok: Some(true),
                                    status_error: None,
                                    hub_message: None,
                                },
                            )
                            .await?;
                        self.spawn_watcher(drone.id.clone());
                    }
                    Err(e) => {
                        let _ = self
                            .registry
                            .transition(
                                &drone.id,
                                HubPhase::Error,
                                TransitionUpdate {
                                    status_ok: Some(false),
                                    status_error: Some(e.to_string()),
                                    hub_message: Some("container failed to restart".to_owned()),
                                },
                            )
                            .await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Long-lived task per ready drone: folds chat logs into transcripts
    /// and refreshes the published host port.
    fn spawn_watcher(self: &Arc<Self>, id: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick: u32 = 0;
            loop {
                tokio::select! {
                    () = tokio::time::sleep(WATCH_INTERVAL) => {}
                    () = this.shutdown.cancelled() => break,
                }

                let Some(drone) = this.registry.get(&id).await else {
                    break;
                };
                if drone.hub_phase != HubPhase::Ready {
                    continue;
                }

                for chat in &drone.chats {
                    if let Err(e) = this.prompts.poll_chat_log(&id, chat).await {
                        tracing::debug!(drone = %id, chat, error = %e, "chat log poll failed");
                    }
                }

                tick = tick.wrapping_add(1);
                if tick % PORT_REFRESH_TICKS == 0 {
                    this.refresh_host_port(&drone).await;
                }
            }
            tracing::debug!(drone = %id, "watcher stopped");
        });
    }

    async fn refresh_host_port(&self, drone: &crate::registry::DroneRecord) {
        match self.engine.ports(&drone.name).await {
            Ok(ports) => {
                let host_port = ports
                    .iter()
                    .find(|p| p.container_port == drone.container_port)
                    .map(|p| p.host_port);
                if host_port != drone.host_port {
                    let _ = self
                        .registry
                        .update(&drone.id, |d| d.host_port = host_port)
                        .await;
                }
            }
            Err(e) => {
                tracing::debug!(drone = %drone.id, error = %e, "port refresh failed");
            }
        }
    }
}
