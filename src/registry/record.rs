use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HubError, HubResult};

/// Drone lifecycle phase as exposed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HubPhase {
    /// Registry slot reserved, container not yet created.
    Creating,

    /// Container created, waiting for it to come up.
    Starting,

    /// Working copy being cloned and pinned to the base SHA.
    Seeding,

    /// Agent session running, drone accepts prompts.
    Ready,

    /// A fatal lifecycle step failed; only deletion leaves this phase.
    Error,
}

impl std::fmt::Display for HubPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Starting => "starting",
            Self::Seeding => "seeding",
            Self::Ready => "ready",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl HubPhase {
    /// Whether the state machine permits `self → next`.
    ///
    /// `error` absorbs from every phase; `ready → seeding` re-seeds;
    /// `ready → starting` and `starting → ready` cover engine restarts.
    /// Same-phase transitions are accepted as no-ops.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (_, Self::Error)
                | (Self::Creating, Self::Starting)
                | (Self::Starting, Self::Seeding | Self::Ready)
                | (Self::Seeding, Self::Ready)
                | (Self::Ready, Self::Seeding | Self::Starting)
        )
    }
}

/// One drone as tracked by the registry.
///
/// Keyed by the opaque `id`; the display `name` is unique among live drones
/// but may be reused after deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DroneRecord {
    /// Opaque stable identifier.
    pub id: String,

    /// Display name, unique across live drones.
    pub name: String,

    /// Optional grouping label.
    pub group: Option<String>,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// Host repository this drone was seeded from, if any.
    pub repo_path: Option<PathBuf>,

    /// Whether a repository is attached.
    pub repo_attached: bool,

    /// Preferred internal port for previews.
    pub container_port: u16,

    /// Last observed published host port.
    pub host_port: Option<u16>,

    /// Whether the last engine status probe succeeded.
    pub status_ok: bool,

    /// Diagnostics from the last failed probe.
    pub status_error: Option<String>,

    /// Ordered set of chat names.
    pub chats: Vec<String>,

    /// Lifecycle phase.
    pub hub_phase: HubPhase,

    /// Human-readable phase detail.
    pub hub_message: Option<String>,

    /// True while a lifecycle mutation is in flight.
    pub busy: bool,
}

impl DroneRecord {
    /// Ensure a chat name is present, preserving insertion order.
    pub fn ensure_chat(&mut self, chat: &str) {
        if !self.chats.iter().any(|c| c == chat) {
            self.chats.push(chat.to_owned());
        }
    }
}

/// A host repository known to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoRecord {
    /// Canonical absolute path; primary key.
    pub path: PathBuf,

    /// When the repo was registered.
    pub added_at: DateTime<Utc>,

    /// URL of the `origin` remote, when present.
    pub remote_url: Option<String>,

    /// GitHub coordinates parsed from the remote URL.
    pub github: Option<GithubRepo>,
}

/// `owner/repo` coordinates on the hosting service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GithubRepo {
    /// Repository owner (user or organisation).
    pub owner: String,
    /// Repository name.
    pub repo: String,
}

impl GithubRepo {
    /// Parse GitHub coordinates from an `origin` URL.
    ///
    /// Handles `git@github.com:owner/repo.git` and
    /// `https://github.com/owner/repo(.git)` forms; anything else is `None`.
    #[must_use]
    pub fn from_remote_url(url: &str) -> Option<Self> {
        let rest = url
            .strip_prefix("git@github.com:")
            .or_else(|| url.strip_prefix("ssh://git@github.com/"))
            .or_else(|| url.strip_prefix("https://github.com/"))
            .or_else(|| url.strip_prefix("http://github.com/"))?;
        let rest = rest.trim_end_matches('/').trim_end_matches(".git");
        let (owner, repo) = rest.split_once('/')?;
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return None;
        }
        Some(Self {
            owner: owner.to_owned(),
            repo: repo.to_owned(),
        })
    }
}

/// Maximum display name length.
pub const NAME_MAX_LEN: usize = 80;

/// Maximum auto-drafted (dash-case) name length.
pub const DRAFT_NAME_MAX_LEN: usize = 48;

/// Validate a user-supplied display name.
pub fn validate_name(name: &str) -> HubResult<()> {
    if name.is_empty() {
        return Err(HubError::InvalidName {
            reason: "name must not be empty".to_owned(),
        });
    }
    if name.chars().count() > NAME_MAX_LEN {
        return Err(HubError::InvalidName {
            reason: format!("name exceeds {NAME_MAX_LEN} characters"),
        });
    }
    if name.contains('\n') || name.contains('\r') {
        return Err(HubError::InvalidName {
            reason: "name must not contain newlines".to_owned(),
        });
    }
    Ok(())
}

/// Whether a drafted name is valid dash-case (`[a-z0-9-]+`, bounded length,
/// no leading/trailing/double dashes).
#[must_use]
pub fn is_valid_draft_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= DRAFT_NAME_MAX_LEN
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
        && !name.contains("--")
}
