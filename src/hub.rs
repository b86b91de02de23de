//! The hub aggregate: owns every component and their shared lifecycle.
//!
//! Initialised once at daemon startup (load snapshot, reconcile with the
//! engine) and torn down by cancelling the shutdown token, which closes
//! terminal streams with code 1001 and stops the watcher tasks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::HubConfig;
use crate::engine::{ContainerEngine, DvmEngine};
use crate::error::{HubError, HubResult};
use crate::lifecycle::{HttpNameSuggester, NameSuggester, Orchestrator};
use crate::prompts::PromptDispatcher;
use crate::prs::{GithubClient, PrApi, PrController};
use crate::registry::{GithubRepo, Registry, RepoRecord};
use crate::sync::RepoSync;
use crate::terminal::TerminalHub;

/// Process-wide component graph.
pub struct Hub {
    config: HubConfig,
    registry: Arc<Registry>,
    engine: Arc<dyn ContainerEngine>,
    sync: Arc<RepoSync>,
    prompts: Arc<PromptDispatcher>,
    terminal: Arc<TerminalHub>,
    prs: PrController,
    lifecycle: Arc<Orchestrator>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub").finish_non_exhaustive()
    }
}

impl Hub {
    /// Build the production hub: `dvm` engine, GitHub client, registry
    /// snapshot from the data directory.
    pub fn new(config: HubConfig, snapshot_path: &Path) -> anyhow::Result<Arc<Self>> {
        let shutdown = CancellationToken::new();
        let engine: Arc<dyn ContainerEngine> = Arc::new(DvmEngine::new(
            config.engine_binary.clone(),
            shutdown.clone(),
        ));
        let pr_api: Arc<dyn PrApi> = Arc::new(GithubClient::new(
            config.github_api_base.clone(),
            config.github_token(),
        )?);
        let suggester: Option<Arc<dyn NameSuggester>> = config
            .naming_endpoint
            .clone()
            .map(|endpoint| {
                Arc::new(HttpNameSuggester::new(endpoint, config.naming_api_key()))
                    as Arc<dyn NameSuggester>
            });

        Ok(Self::assemble(
            config,
            snapshot_path,
            engine,
            pr_api,
            suggester,
            shutdown,
        )?)
    }

    /// Build a hub from explicit parts (tests inject mocks here).
    pub fn assemble(
        config: HubConfig,
        snapshot_path: &Path,
        engine: Arc<dyn ContainerEngine>,
        pr_api: Arc<dyn PrApi>,
        suggester: Option<Arc<dyn NameSuggester>>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        let registry = Arc::new(Registry::load(snapshot_path)?);
        let sync = Arc::new(RepoSync::new(Arc::clone(&engine)));
        let prompts = Arc::new(PromptDispatcher::new(
            Arc::clone(&engine),
            Arc::clone(&registry),
        ));
        let terminal = Arc::new(TerminalHub::new(
            Arc::clone(&engine),
            Arc::clone(&registry),
            config.agent_command.clone(),
            shutdown.clone(),
        ));
        let prs = PrController::new(pr_api, Arc::clone(&registry));
        let lifecycle = Arc::new(Orchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&engine),
            Arc::clone(&sync),
            Arc::clone(&prompts),
            Arc::clone(&terminal),
            config.container_port,
            suggester,
            shutdown.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            registry,
            engine,
            sync,
            prompts,
            terminal,
            prs,
            lifecycle,
            shutdown,
        }))
    }

    /// Reconcile the registry with the engine; call once at startup.
    pub async fn startup(self: &Arc<Self>) {
        if let Err(e) = self.lifecycle.startup_reconcile().await {
            tracing::warn!(error = %e, "startup reconcile failed; continuing");
        }
    }

    /// Begin shutdown: watcher tasks stop, terminal streams close 1001.
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// The daemon-wide cancellation token.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register a host repository: canonicalise, verify it is a working
    /// tree, detect the origin remote and GitHub coordinates.
    pub async fn register_repo(&self, path: &Path) -> HubResult<RepoRecord> {
        let canonical = path.canonicalize().map_err(|e| HubError::NotFound {
            what: format!("repository path {} ({e})", path.display()),
        })?;
        let remote_url = crate::sync::probe_host_repo(&canonical).await?;
        let github = remote_url.as_deref().and_then(GithubRepo::from_remote_url);

        self.registry
            .add_repo(RepoRecord {
                path: canonical,
                added_at: Utc::now(),
                remote_url,
                github,
            })
            .await
    }

    /// Whether the container engine answers.
    pub async fn engine_ok(&self) -> bool {
        self.engine.ls().await.is_ok()
    }

    /// The loaded configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// The drone registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The container adapter.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// The repo sync engine.
    #[must_use]
    pub fn sync(&self) -> &Arc<RepoSync> {
        &self.sync
    }

    /// The prompt dispatcher.
    #[must_use]
    pub fn prompts(&self) -> &Arc<PromptDispatcher> {
        &self.prompts
    }

    /// The terminal stream hub.
    #[must_use]
    pub fn terminal(&self) -> &Arc<TerminalHub> {
        &self.terminal
    }

    /// The PR controller.
    #[must_use]
    pub fn prs(&self) -> &PrController {
        &self.prs
    }

    /// The lifecycle orchestrator.
    #[must_use]
    pub fn lifecycle(&self) -> &Arc<Orchestrator> {
        &self.lifecycle
    }

    /// Resolve a drone or fail with `not_found`.
    pub async fn drone(&self, id: &str) -> HubResult<crate::registry::DroneRecord> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| HubError::not_found(format!("drone {id}")))
    }

    /// Default path of the registry snapshot for a data dir.
    #[must_use]
    pub fn snapshot_path_for(data_dir: &Path) -> PathBuf {
        data_dir.join("registry.json")
    }
}
